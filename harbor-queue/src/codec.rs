//! Versioned wire format for job envelopes.
//!
//! An envelope is stored as a JSON object carrying a top-level `"v"` field
//! next to the job fields:
//!
//! ```json
//! {"v":1,"jid":"…","class":"echo","args":["hi"],"queue":"default","created_at":"…","retry_count":0}
//! ```
//!
//! Decoding fails closed: anything that is not a version this build
//! understands is rejected rather than guessed at.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::job::Job;

/// Envelope version written by [`JobCodec::encode`].
pub const ENVELOPE_VERSION: u64 = 1;

const VERSION_FIELD: &str = "v";

/// Envelope encoding and decoding errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Not JSON, not an object, or fields of the wrong shape
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// No `"v"` field
    #[error("envelope has no version field")]
    MissingVersion,

    /// A version this build cannot read
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u64),

    /// Serialization failed
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Encodes and decodes [`Job`] envelopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobCodec;

impl JobCodec {
    /// Serialize an envelope to bytes.
    pub fn encode(job: &Job) -> Result<Vec<u8>, CodecError> {
        let mut fields = match serde_json::to_value(job) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return Err(CodecError::Encode(format!(
                    "expected an object, got {}",
                    other
                )));
            }
            Err(e) => return Err(CodecError::Encode(e.to_string())),
        };

        let mut envelope = Map::with_capacity(fields.len() + 1);
        envelope.insert(VERSION_FIELD.to_string(), Value::from(ENVELOPE_VERSION));
        envelope.append(&mut fields);

        serde_json::to_vec(&Value::Object(envelope)).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Parse bytes back into an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Job, CodecError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(CodecError::Malformed("envelope is not a JSON object".to_string()));
        };

        let version = match fields.remove(VERSION_FIELD) {
            None => return Err(CodecError::MissingVersion),
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| CodecError::Malformed(format!("invalid version {}", n)))?,
            Some(other) => {
                return Err(CodecError::Malformed(format!("invalid version {}", other)));
            }
        };

        if version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn sample() -> Job {
        Job::new("default", "echo", vec![json!("hi"), json!(3), json!({"k": [1.5, null]})])
            .with_metadata("origin", "test")
            .schedule_at(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap())
    }

    #[test]
    fn test_round_trip() {
        let job = sample();
        let bytes = JobCodec::encode(&job).unwrap();
        assert_eq!(JobCodec::decode(&bytes).unwrap(), job);
    }

    #[test]
    fn test_round_trip_preserves_floats_and_retry_state() {
        let mut job = Job::new("low", "calc", vec![json!(0.1), json!(1e-300), json!(f64::MAX)]);
        job.record_failure("boom", Utc::now());
        job.schedule_retry(Utc::now());

        let decoded = JobCodec::decode(&JobCodec::encode(&job).unwrap()).unwrap();
        assert_eq!(decoded, job);
        assert_eq!(decoded.retry_count(), 1);
    }

    #[test]
    fn test_version_field_written() {
        let bytes = JobCodec::encode(&sample()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["v"], json!(1));
        assert_eq!(value["class"], json!("echo"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            JobCodec::decode(b"not json"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            JobCodec::decode(b"[1,2,3]"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_missing_version() {
        let job = sample();
        let mut value = serde_json::to_value(&job).unwrap();
        value.as_object_mut().unwrap().remove("v");
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            JobCodec::decode(&bytes),
            Err(CodecError::MissingVersion)
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut value: Value = serde_json::from_slice(&JobCodec::encode(&sample()).unwrap()).unwrap();
        value["v"] = json!(2);
        let bytes = serde_json::to_vec(&value).unwrap();

        assert!(matches!(
            JobCodec::decode(&bytes),
            Err(CodecError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let bytes = br#"{"v":1,"class":"echo"}"#;
        assert!(matches!(
            JobCodec::decode(bytes),
            Err(CodecError::Malformed(_))
        ));

        let bytes = br#"{"v":"one"}"#;
        assert!(matches!(
            JobCodec::decode(bytes),
            Err(CodecError::Malformed(_))
        ));
    }
}
