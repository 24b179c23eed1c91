// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-type comparison of values.
//!
//! Rule evaluation compares values that arrived with different widths (an
//! `Int64` from the wire against a `UInt8` from configuration), so these
//! comparisons work on the numeric value rather than the variant.

use std::cmp::Ordering;

use super::Value;

/// Compares two values.
///
/// Numbers compare numerically across all numeric variants. Strings, UUIDs
/// and booleans compare within their own kind; a UUID also compares against
/// a string holding its textual form. Lists and maps, or values of unrelated
/// kinds, are not ordered and return `None`.
///
/// # Examples
///
/// ```
/// use std::cmp::Ordering;
/// use agobus_lib::value::{compare, Value};
///
/// assert_eq!(compare(&Value::from(3_u8), &Value::from(3.0_f64)), Some(Ordering::Equal));
/// assert_eq!(compare(&Value::from(-1_i64), &Value::from(1_u64)), Some(Ordering::Less));
/// assert_eq!(compare(&Value::from("a"), &Value::from(1_i32)), None);
/// ```
#[must_use]
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Uuid(x), Value::Uuid(y)) => Some(x.cmp(y)),
        (Value::Uuid(x), Value::String(y)) => Some(x.to_string().as_str().cmp(y.as_str())),
        (Value::String(x), Value::Uuid(y)) => Some(x.as_str().cmp(y.to_string().as_str())),
        _ if a.is_number() && b.is_number() => compare_numbers(a, b),
        _ => None,
    }
}

/// Returns true when [`compare`] reports equality, or when both values are
/// equal lists or maps.
#[must_use]
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loosely_equal(l, r))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| loosely_equal(v, other)))
        }
        _ => compare(a, b) == Some(Ordering::Equal),
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    // Exact integer comparison first, so large u64/i64 values do not lose
    // precision through f64.
    if let (Ok(x), Ok(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    if let (Ok(x), Ok(y)) = (a.as_u64(), b.as_u64()) {
        return Some(x.cmp(&y));
    }
    let x = a.as_f64().ok()?;
    let y = b.as_f64().ok()?;
    x.partial_cmp(&y)
}
