// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON representation of [`Value`].
//!
//! Encoding is lossless for the shape of the data but not for integer
//! widths: every integer decodes as `Int64` (or `UInt64` above `i64::MAX`),
//! every float as `Float64`, and UUIDs as strings. Non-finite floats encode
//! as `null`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{Value, ValueMap};

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        use serde_json::Value as Json;

        match value {
            Value::Null => Json::Null,
            Value::Bool(v) => Json::Bool(*v),
            Value::Int8(v) => Json::from(*v),
            Value::Int16(v) => Json::from(*v),
            Value::Int32(v) => Json::from(*v),
            Value::Int64(v) => Json::from(*v),
            Value::UInt8(v) => Json::from(*v),
            Value::UInt16(v) => Json::from(*v),
            Value::UInt32(v) => Json::from(*v),
            Value::UInt64(v) => Json::from(*v),
            Value::Float32(v) => serde_json::Number::from_f64(f64::from(*v))
                .map_or(Json::Null, Json::Number),
            Value::Float64(v) => serde_json::Number::from_f64(*v).map_or(Json::Null, Json::Number),
            Value::String(v) => Json::String(v.clone()),
            Value::Uuid(v) => Json::String(v.to_string()),
            Value::List(items) => Json::Array(items.iter().map(Json::from).collect()),
            Value::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Json::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;

        match json {
            Json::Null => Self::Null,
            Json::Bool(v) => Self::Bool(v),
            Json::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Self::Int64(v)
                } else if let Some(v) = n.as_u64() {
                    Self::UInt64(v)
                } else {
                    n.as_f64().map_or(Self::Null, Self::Float64)
                }
            }
            Json::String(s) => Self::String(s),
            Json::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Map(map_from_json(map)),
        }
    }
}

/// Converts a JSON object into a [`ValueMap`].
pub(crate) fn map_from_json(map: serde_json::Map<String, serde_json::Value>) -> ValueMap {
    map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::Value::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn integers_decode_as_widest_type() {
        let value: Value = serde_json::from_str("42").unwrap();
        assert_eq!(value, Value::Int64(42));

        let value: Value = serde_json::from_str("18446744073709551615").unwrap();
        assert_eq!(value, Value::UInt64(u64::MAX));
    }

    #[test]
    fn floats_decode_as_double() {
        let value: Value = serde_json::from_str("21.5").unwrap();
        assert_eq!(value, Value::Float64(21.5));
    }

    #[test]
    fn uuid_encodes_as_string() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&Value::Uuid(id)).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }

    #[test]
    fn non_finite_float_encodes_as_null() {
        let json = serde_json::to_string(&Value::Float64(f64::NAN)).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn map_serialization_is_sorted() {
        let mut map = ValueMap::new();
        map.insert("uuid".to_string(), Value::from("u"));
        map.insert("command".to_string(), Value::from("on"));
        let json = serde_json::to_string(&Value::Map(map)).unwrap();
        assert_eq!(json, r#"{"command":"on","uuid":"u"}"#);
    }

    #[test]
    fn nested_structure_decodes() {
        let value: Value =
            serde_json::from_str(r#"{"devices":{"a":{"devicetype":"switch"}},"ids":[1,"x",null]}"#)
                .unwrap();
        let map = value.as_map().unwrap();
        let devices = map["devices"].as_map().unwrap();
        assert_eq!(
            devices["a"].as_map().unwrap()["devicetype"],
            Value::from("switch")
        );
        assert_eq!(
            map["ids"],
            Value::List(vec![Value::Int64(1), Value::from("x"), Value::Null])
        );
    }
}
