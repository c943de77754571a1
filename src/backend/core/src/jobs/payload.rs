//! The `{type, data}` envelope stored in a job row.
//!
//! Only the envelope itself is parsed here. Turning `data` into a task goes
//! through [`TaskRegistry`](crate::jobs::task::TaskRegistry), which decodes it
//! into the `Data` type declared by the task registered under `type`.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobPayload {
    /// Registered task name
    #[serde(rename = "type")]
    pub task_type: String,

    /// Serialized task data
    pub data: serde_json::Value,
}

impl JobPayload {
    pub fn new(task_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            data,
        }
    }

    /// Serialize typed task data into an envelope.
    pub fn encode<D: Serialize>(task_type: &str, data: &D) -> Result<Self> {
        let data = serde_json::to_value(data)?;
        Ok(Self::new(task_type, data))
    }

    /// Parse the envelope out of a stored row payload.
    pub fn from_value(raw: &serde_json::Value) -> Result<Self> {
        let payload: JobPayload = serde_json::from_value(raw.clone())
            .map_err(|e| QueueError::malformed_payload(e.to_string()))?;
        if payload.task_type.trim().is_empty() {
            return Err(QueueError::malformed_payload("envelope `type` is empty"));
        }
        Ok(payload)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "type": self.task_type, "data": self.data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let payload = JobPayload::new("send_mail", json!({"to": "ops@example.com"}));
        assert_eq!(
            payload.to_value(),
            json!({"type": "send_mail", "data": {"to": "ops@example.com"}})
        );
        assert_eq!(JobPayload::from_value(&payload.to_value()).unwrap(), payload);
    }

    #[test]
    fn test_corrupt_envelopes_rejected() {
        for raw in [
            json!("just a string"),
            json!({"data": {}}),
            json!({"type": 12, "data": {}}),
            json!({"type": "", "data": {}}),
            json!({"type": "x", "data": {}, "class": "Evil"}),
        ] {
            let err = JobPayload::from_value(&raw).unwrap_err();
            assert_eq!(err.code(), ErrorCode::MalformedPayload, "raw {}", raw);
        }
    }
}
