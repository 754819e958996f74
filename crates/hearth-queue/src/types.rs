use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QueueError, Result};

/// What gets stored in the `payload` column: which handler to run and the
/// arguments to hand it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub job: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Payload {
    /// Build a payload from any serializable data.
    ///
    /// `data` must serialize to a JSON object; `()`/`null` means no data.
    pub fn new(job: impl Into<String>, data: impl Serialize) -> Result<Self> {
        let data = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(QueueError::InvalidData(format!(
                    "expected a JSON object, got {other}"
                )))
            }
        };
        Ok(Self {
            job: job.into(),
            data,
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A row of the `jobs` table as seen at the moment it was read or claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    /// Raw payload text. Decoded lazily so a corrupt payload still reaches the
    /// worker and goes through the normal failure path.
    pub payload: String,
    /// Number of times the job has been claimed, this claim included.
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    /// `None` while the job waits to be claimed.
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn decode_payload(&self) -> Result<Payload> {
        Payload::decode(&self.payload)
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }
}

/// A row of the append-only `failed_jobs` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    /// Error text captured from the final attempt.
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}
