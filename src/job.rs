//! Job records and the values exchanged with queue callers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Store-assigned job identifier.
///
/// Identifiers are allocated in increasing order, so they double as the FIFO
/// tie-break among equally visible jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token proving that a consumer holds a claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AckToken(String);

impl AckToken {
    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AckToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AckToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: Value,
    /// The job can be claimed once this instant has passed.
    pub visible: DateTime<Utc>,
    /// Number of successful claims.
    pub tries: u32,
    /// Present while a claim is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckToken>,
    /// Set once the job is terminal; the store purges it afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<DateTime<Utc>>,
}

/// A record to be inserted; the store assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub payload: Value,
    pub visible: DateTime<Utc>,
    pub tries: u32,
}

impl NewJob {
    /// A fresh job that has never been claimed.
    #[must_use]
    pub fn new(payload: Value, visible: DateTime<Utc>) -> Self {
        Self {
            payload,
            visible,
            tries: 0,
        }
    }

    /// Assemble the full record once the store has assigned an id.
    #[must_use]
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            payload: self.payload,
            visible: self.visible,
            tries: self.tries,
            ack: None,
            deleted: None,
        }
    }
}

/// A job handed to a consumer by [`Queue::get`](crate::Queue::get).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub id: JobId,
    /// Present this to [`Queue::ping`](crate::Queue::ping) and
    /// [`Queue::ack`](crate::Queue::ack).
    pub ack: AckToken,
    pub payload: Value,
    pub tries: u32,
}

impl ClaimedJob {
    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns the deserialization error when the payload has a different shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// One payload or a batch of payloads passed to [`Queue::add`](crate::Queue::add).
#[derive(Debug, Clone, PartialEq)]
pub enum Payloads {
    Single(Value),
    Batch(Vec<Value>),
}

impl From<Value> for Payloads {
    fn from(value: Value) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<Value>> for Payloads {
    fn from(values: Vec<Value>) -> Self {
        Self::Batch(values)
    }
}

/// Ids returned by [`Queue::add`](crate::Queue::add), shaped like the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Added {
    Single(JobId),
    Batch(Vec<JobId>),
}

impl Added {
    /// The id of a single insert, or `None` for a batch.
    #[must_use]
    pub fn single(&self) -> Option<JobId> {
        match self {
            Self::Single(id) => Some(*id),
            Self::Batch(_) => None,
        }
    }

    /// All ids in input order.
    #[must_use]
    pub fn into_ids(self) -> Vec<JobId> {
        match self {
            Self::Single(id) => vec![id],
            Self::Batch(ids) => ids,
        }
    }
}

/// Payload shape persisted by
/// [`Queue::schedule_recurring`](crate::Queue::schedule_recurring).
///
/// The queue never interprets the pattern. An external scheduler reads these
/// templates and enqueues concrete jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTemplate {
    pub original_payload: Value,
    pub recurrence: Recurrence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ack_tokens_are_unique_hex() {
        let a = AckToken::generate();
        let b = AckToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn payload_as_deserializes() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Email {
            to: String,
        }

        let job = ClaimedJob {
            id: JobId(7),
            ack: AckToken::generate(),
            payload: json!({ "to": "ops@example.com" }),
            tries: 1,
        };
        let email: Email = job.payload_as().unwrap();
        assert_eq!(email.to, "ops@example.com");
        assert!(job.payload_as::<Vec<u8>>().is_err());
    }

    #[test]
    fn recurring_template_uses_camel_case() {
        let created_at = Utc::now();
        let template = RecurringTemplate {
            original_payload: json!({ "report": "daily" }),
            recurrence: Recurrence {
                pattern: "0 0 * * *".into(),
                created_at,
            },
        };
        let value = serde_json::to_value(&template).unwrap();
        assert_eq!(value["originalPayload"], json!({ "report": "daily" }));
        assert_eq!(value["recurrence"]["pattern"], "0 0 * * *");
        assert!(value["recurrence"].get("createdAt").is_some());
    }

    #[test]
    fn added_mirrors_input_shape() {
        assert_eq!(Added::Single(JobId(3)).single(), Some(JobId(3)));
        assert_eq!(Added::Batch(vec![JobId(1), JobId(2)]).single(), None);
        assert_eq!(
            Added::Batch(vec![JobId(1), JobId(2)]).into_ids(),
            vec![JobId(1), JobId(2)]
        );
    }
}
