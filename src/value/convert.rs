// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fallible accessors on [`Value`] and parameter helpers on [`ValueMap`].
//!
//! Integer accessors accept every integer variant, integral floats and
//! numeric strings, and fail when the target type cannot hold the value.
//! Values received from the wire lose their original width, so handlers
//! should always read through these accessors instead of matching variants.

use uuid::Uuid;

use super::{Value, ValueMap};
use crate::error::ValueError;
use crate::response::CommandError;

/// Intermediate numeric representation used for conversions.
enum Number {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl Value {
    fn invalid(&self, to: &'static str) -> ValueError {
        ValueError::InvalidConversion {
            from: self.kind(),
            to,
        }
    }

    fn number(&self, to: &'static str) -> Result<Number, ValueError> {
        match self {
            Self::Int8(v) => Ok(Number::Signed(i64::from(*v))),
            Self::Int16(v) => Ok(Number::Signed(i64::from(*v))),
            Self::Int32(v) => Ok(Number::Signed(i64::from(*v))),
            Self::Int64(v) => Ok(Number::Signed(*v)),
            Self::UInt8(v) => Ok(Number::Unsigned(u64::from(*v))),
            Self::UInt16(v) => Ok(Number::Unsigned(u64::from(*v))),
            Self::UInt32(v) => Ok(Number::Unsigned(u64::from(*v))),
            Self::UInt64(v) => Ok(Number::Unsigned(*v)),
            Self::Float32(v) => Ok(Number::Float(f64::from(*v))),
            Self::Float64(v) => Ok(Number::Float(*v)),
            Self::String(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    Ok(Number::Signed(v))
                } else if let Ok(v) = s.parse::<u64>() {
                    Ok(Number::Unsigned(v))
                } else if let Ok(v) = s.parse::<f64>() {
                    Ok(Number::Float(v))
                } else {
                    Err(self.invalid(to))
                }
            }
            _ => Err(self.invalid(to)),
        }
    }

    /// Reads any integral value into a type wide enough for both i64 and u64.
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn integer_i128(&self, to: &'static str) -> Result<i128, ValueError> {
        match self.number(to)? {
            Number::Signed(v) => Ok(i128::from(v)),
            Number::Unsigned(v) => Ok(i128::from(v)),
            Number::Float(v) => {
                // Only integral floats within the u64/i64 span convert.
                let in_span = v >= i64::MIN as f64 && v <= u64::MAX as f64;
                if v.fract() == 0.0 && in_span {
                    Ok(v as i128)
                } else {
                    Err(self.invalid(to))
                }
            }
        }
    }

    /// Returns the value as a boolean.
    ///
    /// Accepts booleans, integers (non-zero is true) and the strings
    /// `"true"`/`"false"`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] for any other value.
    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Self::Bool(v) => Ok(*v),
            Self::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Self::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            Self::String(_) | Self::Float32(_) | Self::Float64(_) => Err(self.invalid("bool")),
            other => other.integer_i128("bool").map(|v| v != 0),
        }
    }

    /// Returns the value as a string slice.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] unless the value is a string.
    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Self::String(s) => Ok(s),
            _ => Err(self.invalid("string")),
        }
    }

    /// Returns the value as a UUID, parsing strings.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] if the value is neither a
    /// UUID nor a string holding one.
    pub fn as_uuid(&self) -> Result<Uuid, ValueError> {
        match self {
            Self::Uuid(u) => Ok(*u),
            Self::String(s) => Uuid::parse_str(s).map_err(|_| self.invalid("uuid")),
            _ => Err(self.invalid("uuid")),
        }
    }

    /// Returns the value as a single precision float.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] if the value is not numeric
    /// or is outside the `f32` range.
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_f32(&self) -> Result<f32, ValueError> {
        let v = self.as_f64().map_err(|_| self.invalid("float"))?;
        if v.is_finite() && v.abs() > f64::from(f32::MAX) {
            return Err(self.invalid("float"));
        }
        Ok(v as f32)
    }

    /// Returns the value as a double precision float.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] if the value is not numeric.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self.number("double")? {
            Number::Signed(v) => Ok(v as f64),
            Number::Unsigned(v) => Ok(v as f64),
            Number::Float(v) => Ok(v),
        }
    }

    /// Returns the value as a list.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] unless the value is a list.
    pub fn as_list(&self) -> Result<&[Value], ValueError> {
        match self {
            Self::List(v) => Ok(v),
            _ => Err(self.invalid("list")),
        }
    }

    /// Returns the value as a map.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::InvalidConversion`] unless the value is a map.
    pub fn as_map(&self) -> Result<&ValueMap, ValueError> {
        match self {
            Self::Map(v) => Ok(v),
            _ => Err(self.invalid("map")),
        }
    }
}

macro_rules! integer_accessors {
    ($($name:ident => $ty:ty, $label:literal);* $(;)?) => {
        impl Value {
            $(
                #[doc = concat!("Returns the value as `", stringify!($ty), "`.")]
                ///
                /// # Errors
                ///
                /// Returns [`ValueError::InvalidConversion`] if the value is not an
                /// integer or does not fit the target type.
                pub fn $name(&self) -> Result<$ty, ValueError> {
                    let wide = self.integer_i128($label)?;
                    <$ty>::try_from(wide).map_err(|_| self.invalid($label))
                }
            )*
        }
    };
}

integer_accessors! {
    as_i8 => i8, "int8";
    as_i16 => i16, "int16";
    as_i32 => i32, "int32";
    as_i64 => i64, "int64";
    as_u8 => u8, "uint8";
    as_u16 => u16, "uint16";
    as_u32 => u32, "uint32";
    as_u64 => u64, "uint64";
}

/// Parameter access helpers for command content maps.
///
/// Command handlers use these to validate their inputs. Failures come back
/// as [`CommandError`] so they can be returned directly from a handler.
///
/// # Examples
///
/// ```
/// use agobus_lib::value::{Value, ValueMap, ValueMapExt};
///
/// let mut content = ValueMap::new();
/// content.insert("level".to_string(), Value::from("75"));
///
/// let level: u8 = content.require_with("level", Value::as_u8).unwrap();
/// assert_eq!(level, 75);
/// assert!(content.require("color").is_err());
/// ```
pub trait ValueMapExt {
    /// Returns the string stored under `key`, if present and a string.
    fn get_str(&self, key: &str) -> Option<&str>;

    /// Returns the value under `key` or [`CommandError::ParameterMissing`].
    ///
    /// # Errors
    ///
    /// Fails when the key is absent or null.
    fn require(&self, key: &str) -> Result<&Value, CommandError>;

    /// Reads `key` through `convert`, mapping failures to command errors.
    ///
    /// # Errors
    ///
    /// [`CommandError::ParameterMissing`] when absent,
    /// [`CommandError::ParameterInvalid`] when the conversion fails.
    fn require_with<'a, T>(
        &'a self,
        key: &str,
        convert: impl FnOnce(&'a Value) -> Result<T, ValueError>,
    ) -> Result<T, CommandError>;
}

impl ValueMapExt for ValueMap {
    fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str().ok())
    }

    fn require(&self, key: &str) -> Result<&Value, CommandError> {
        match self.get(key) {
            Some(v) if !v.is_null() => Ok(v),
            _ => Err(CommandError::ParameterMissing(key.to_string())),
        }
    }

    fn require_with<'a, T>(
        &'a self,
        key: &str,
        convert: impl FnOnce(&'a Value) -> Result<T, ValueError>,
    ) -> Result<T, CommandError> {
        let value = self.require(key)?;
        convert(value).map_err(|e| CommandError::ParameterInvalid {
            name: key.to_string(),
            message: e.to_string(),
        })
    }
}
