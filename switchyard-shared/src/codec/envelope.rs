/// Tagged envelope format
///
/// Encoding is plain serde: whatever `Serialize` produces becomes the `d`
/// field. Decoding accepts both envelopes and bare JSON written before the
/// envelope existed; a bare value is decoded directly.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Highest envelope version this build understands
pub const ENVELOPE_VERSION: u8 = 1;

/// Serialization errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Envelope written by a newer producer
    #[error("Unsupported envelope version {found} (max {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },
}

/// Type tag plus encoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope version
    #[serde(rename = "v")]
    pub version: u8,

    /// Type of the encoded value
    #[serde(rename = "t")]
    pub type_tag: String,

    /// Encoded value
    #[serde(rename = "d")]
    pub data: JsonValue,
}

impl Envelope {
    /// Wraps `value`, tagging it with its Rust type name
    pub fn wrap<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Ok(Self {
            version: ENVELOPE_VERSION,
            type_tag: std::any::type_name::<T>().to_string(),
            data: serde_json::to_value(value)?,
        })
    }

    /// Decodes the wrapped value as `T`
    ///
    /// A type tag that differs from `T` is only logged: type paths move between
    /// releases while the data shape stays compatible.
    pub fn open<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        if self.version > ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion {
                found: self.version,
                supported: ENVELOPE_VERSION,
            });
        }

        let expected = std::any::type_name::<T>();
        if self.type_tag != expected {
            tracing::debug!(
                found = %self.type_tag,
                expected = %expected,
                "Envelope type tag differs from requested type"
            );
        }

        Ok(serde_json::from_value(self.data)?)
    }

    fn looks_like_envelope(value: &JsonValue) -> bool {
        match value.as_object() {
            Some(map) => {
                map.len() == 3
                    && map.get("v").map_or(false, JsonValue::is_u64)
                    && map.get("t").map_or(false, JsonValue::is_string)
                    && map.contains_key("d")
            }
            None => false,
        }
    }
}

/// Encodes `value` as an envelope string
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&Envelope::wrap(value)?)?)
}

/// Decodes an envelope string, or bare JSON, into `T`
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    let value: JsonValue = serde_json::from_str(raw)?;

    if Envelope::looks_like_envelope(&value) {
        let envelope: Envelope = serde_json::from_value(value)?;
        return envelope.open();
    }

    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        id: u64,
        issued_at: DateTime<Utc>,
        due_at: Option<DateTime<Utc>>,
        lines: Vec<String>,
        meta: BTreeMap<String, JsonValue>,
    }

    fn invoice() -> Invoice {
        let mut meta = BTreeMap::new();
        meta.insert("currency".to_string(), JsonValue::from("EUR"));
        Invoice {
            id: 7,
            issued_at: Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap()
                + chrono::Duration::nanoseconds(123_456_789),
            due_at: None,
            lines: vec!["a".into(), "b".into()],
            meta,
        }
    }

    #[test]
    fn test_dates_survive_round_trip() {
        let original = invoice();
        let raw = encode(&original).unwrap();
        let back: Invoice = decode(&raw).unwrap();

        assert_eq!(back, original);
        assert_eq!(back.issued_at.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn test_envelope_shape() {
        let raw = encode(&vec![1, 2, 3]).unwrap();
        let value: JsonValue = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["v"], 1);
        assert!(value["t"].as_str().unwrap().contains("Vec"));
        assert_eq!(value["d"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_bare_json_is_accepted() {
        let back: BTreeMap<String, u32> = decode(r#"{"a":1,"b":2}"#).unwrap();
        assert_eq!(back.get("b"), Some(&2));
    }

    #[test]
    fn test_user_object_with_envelope_like_keys_is_not_misread() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Odd {
            v: String,
            t: u8,
        }

        let raw = encode(&Odd { v: "x".into(), t: 3 }).unwrap();
        let back: Odd = decode(&raw).unwrap();
        assert_eq!(back, Odd { v: "x".into(), t: 3 });
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let raw = r#"{"v":9,"t":"u32","d":1}"#;
        let result: Result<u32, _> = decode(raw);
        assert!(matches!(
            result,
            Err(CodecError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_shape_mismatch_is_json_error() {
        let raw = encode(&"text").unwrap();
        let result: Result<u64, _> = decode(&raw);
        assert!(matches!(result, Err(CodecError::JsonError(_))));
    }
}
