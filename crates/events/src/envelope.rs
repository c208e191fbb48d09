//! Notification payloads and their (optionally wrapped) wire encoding.
//!
//! A message body is JSON. Publishers that fan out through a topic wrap the
//! real payload as a JSON *string* under `Message`; direct publishers send the
//! payload itself. The payload is then classified by which required fields it
//! carries into exactly one [`Notification`] variant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

use strata_core::{ArchiveRef, JobId, JobStatus, RetrievalRef, UserId};

/// Why a message body could not be turned into a [`Notification`].
///
/// Every variant is unrecoverable: redelivering the same bytes cannot help.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("body is not a JSON object")]
    NotAnObject,

    #[error("envelope has no inner payload")]
    MissingInnerPayload,

    #[error("inner payload is not valid JSON: {0}")]
    InnerJson(#[source] serde_json::Error),

    #[error("payload matches no known notification")]
    Unrecognized,

    #[error("invalid {kind} payload: {reason}")]
    Invalid { kind: &'static str, reason: String },
}

/// A job was submitted and its input uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSubmitted {
    pub job_id: JobId,
    #[serde(alias = "s3_key_input_file")]
    pub input_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// A job reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFinished {
    pub job_id: JobId,
    pub job_status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<String>,
}

/// A user's account was upgraded; their archived results should come back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequested {
    pub user_id: UserId,
}

/// Outcome reported by the archive tier for a retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetrievalStatus {
    #[default]
    Succeeded,
    InProgress,
    Failed,
}

/// The archive tier finished (or gave up on) a retrieval.
///
/// Field names follow the archive tier's own notification format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRetrievalCompleted {
    #[serde(rename = "JobId", alias = "jobId")]
    pub retrieval_job_id: RetrievalRef,
    #[serde(rename = "ArchiveId")]
    pub archive_reference: ArchiveRef,
    #[serde(rename = "StatusCode", default)]
    pub status_code: RetrievalStatus,
    #[serde(rename = "VaultName", default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<String>,
}

/// Closed set of messages the workers understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    JobSubmitted(JobSubmitted),
    JobFinished(JobFinished),
    RestoreRequested(RestoreRequested),
    ArchiveRetrievalCompleted(ArchiveRetrievalCompleted),
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::JobSubmitted(_) => "job_submitted",
            Notification::JobFinished(_) => "job_finished",
            Notification::RestoreRequested(_) => "restore_requested",
            Notification::ArchiveRetrievalCompleted(_) => "archive_retrieval_completed",
        }
    }

    /// Decode a raw message body.
    pub fn decode(body: &str) -> Result<Self, DecodeError> {
        let outer: JsonValue = serde_json::from_str(body).map_err(DecodeError::Json)?;
        let JsonValue::Object(map) = outer else {
            return Err(DecodeError::NotAnObject);
        };
        let payload = unwrap_envelope(map)?;
        Self::classify(payload)
    }

    /// Decode an already-unwrapped payload object.
    pub fn classify(payload: Map<String, JsonValue>) -> Result<Self, DecodeError> {
        let has = |k: &str| payload.contains_key(k);

        if (has("JobId") || has("jobId")) && has("ArchiveId") {
            return parse(payload, "archive_retrieval_completed")
                .map(Notification::ArchiveRetrievalCompleted);
        }
        if has("job_id") && (has("input_reference") || has("s3_key_input_file")) {
            return parse(payload, "job_submitted").map(Notification::JobSubmitted);
        }
        if has("job_id") && has("job_status") {
            let finished: JobFinished = parse(payload, "job_finished")?;
            if !finished.job_status.is_terminal() {
                return Err(DecodeError::Invalid {
                    kind: "job_finished",
                    reason: format!("status {} is not terminal", finished.job_status),
                });
            }
            return Ok(Notification::JobFinished(finished));
        }
        if has("user_id") && !has("job_id") {
            return parse(payload, "restore_requested").map(Notification::RestoreRequested);
        }
        Err(DecodeError::Unrecognized)
    }

    /// The bare payload object.
    pub fn to_payload(&self) -> JsonValue {
        let v = match self {
            Notification::JobSubmitted(p) => serde_json::to_value(p),
            Notification::JobFinished(p) => serde_json::to_value(p),
            Notification::RestoreRequested(p) => serde_json::to_value(p),
            Notification::ArchiveRetrievalCompleted(p) => serde_json::to_value(p).map(|mut v| {
                if let JsonValue::Object(m) = &mut v {
                    m.insert("Action".into(), "ArchiveRetrieval".into());
                    m.insert(
                        "Completed".into(),
                        JsonValue::Bool(p.status_code != RetrievalStatus::InProgress),
                    );
                }
                v
            }),
        };
        // Plain structs of strings/ids never fail to serialize.
        v.unwrap_or(JsonValue::Null)
    }

    /// Body for a direct (unwrapped) publish.
    pub fn encode(&self) -> String {
        self.to_payload().to_string()
    }

    /// Body as delivered through a fan-out topic: the payload is serialized
    /// again as a string under `Message`.
    pub fn encode_wrapped(&self) -> String {
        serde_json::json!({
            "Type": "Notification",
            "MessageId": Uuid::now_v7().to_string(),
            "Message": self.encode(),
        })
        .to_string()
    }
}

fn unwrap_envelope(map: Map<String, JsonValue>) -> Result<Map<String, JsonValue>, DecodeError> {
    match map.get("Message") {
        Some(JsonValue::String(inner)) => {
            match serde_json::from_str::<JsonValue>(inner).map_err(DecodeError::InnerJson)? {
                JsonValue::Object(inner) => Ok(inner),
                _ => Err(DecodeError::NotAnObject),
            }
        }
        Some(_) => Err(DecodeError::MissingInnerPayload),
        None if map.get("Type").and_then(JsonValue::as_str) == Some("Notification") => {
            Err(DecodeError::MissingInnerPayload)
        }
        None => Ok(map),
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    payload: Map<String, JsonValue>,
    kind: &'static str,
) -> Result<T, DecodeError> {
    serde_json::from_value(JsonValue::Object(payload)).map_err(|e| DecodeError::Invalid {
        kind,
        reason: e.to_string(),
    })
}
