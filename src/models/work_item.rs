use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Pointer to an object in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Key segment directly above the file name, if any.
    pub fn parent_segment(&self) -> Option<&str> {
        let mut segments = self.key.rsplit('/');
        segments.next()?;
        segments.next().filter(|s| !s.is_empty())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Object-created notification envelope, as delivered to the queues.
#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectCreatedEvent {
    #[serde(rename = "Records")]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectEntity {
    pub key: String,
}

impl ObjectCreatedEvent {
    pub fn for_object(object: &ObjectRef) -> Self {
        Self {
            records: vec![EventRecord {
                s3: S3Entity {
                    bucket: BucketEntity {
                        name: object.bucket.clone(),
                    },
                    object: ObjectEntity {
                        key: encode_key(&object.key),
                    },
                },
            }],
        }
    }

    /// Parse a queue body and extract the first record's object.
    pub fn parse(body: &str) -> Result<ObjectRef, EventError> {
        let event: ObjectCreatedEvent = serde_json::from_str(body).map_err(EventError::Json)?;
        let record = event.records.into_iter().next().ok_or(EventError::NoRecords)?;
        let key = decode_key(&record.s3.object.key).ok_or(EventError::BadKeyEncoding)?;
        if record.s3.bucket.name.is_empty() || key.is_empty() {
            return Err(EventError::EmptyLocation);
        }
        Ok(ObjectRef::new(record.s3.bucket.name, key))
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("message body is not an object-created event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event contains no records")]
    NoRecords,

    #[error("object key is not valid URL encoding")]
    BadKeyEncoding,

    #[error("event has an empty bucket or key")]
    EmptyLocation,
}

/// Notification keys are form-encoded: `+` is a space, `%XX` an escaped byte.
fn decode_key(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = raw.get(i + 1..i + 3).filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out).ok()
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Opaque token identifying one delivery of a message.
///
/// Encoded as `{message_id}:{delivery_count}` so a receipt from an earlier
/// delivery can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(message_id: Uuid, delivery_count: u32) -> Self {
        Self(format!("{message_id}:{delivery_count}"))
    }

    pub fn parse(&self) -> Option<(Uuid, u32)> {
        let (id, count) = self.0.split_once(':')?;
        Some((Uuid::parse_str(id).ok()?, count.parse().ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ReceiptHandle {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered from a queue.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub message_id: Uuid,
    pub body: String,
    pub receipt: ReceiptHandle,
    pub delivery_count: u32,
}

impl WorkItem {
    pub fn object(&self) -> Result<ObjectRef, EventError> {
        ObjectCreatedEvent::parse(&self.body)
    }
}

/// A message parked in a dead-letter queue after exhausting its deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub body: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trip_with_awkward_key() {
        let object = ObjectRef::new("customer-requests", "input_data/Q3 report+notes.csv");
        let body = ObjectCreatedEvent::for_object(&object).to_body().unwrap();
        assert!(body.contains("Q3+report%2Bnotes.csv"));
        assert_eq!(ObjectCreatedEvent::parse(&body).unwrap(), object);
    }

    #[test]
    fn test_parse_notification_body() {
        let body = r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"internal"},"object":{"key":"batch_input/p/p-batch1.jsonl","size":10}}}]}"#;
        let object = ObjectCreatedEvent::parse(body).unwrap();
        assert_eq!(object.bucket, "internal");
        assert_eq!(object.key, "batch_input/p/p-batch1.jsonl");
        assert_eq!(object.file_name(), "p-batch1.jsonl");
        assert_eq!(object.parent_segment(), Some("p"));
    }

    #[test]
    fn test_malformed_bodies_rejected() {
        assert!(matches!(ObjectCreatedEvent::parse("not json"), Err(EventError::Json(_))));
        assert!(matches!(
            ObjectCreatedEvent::parse(r#"{"Records":[]}"#),
            Err(EventError::NoRecords)
        ));
        assert!(matches!(
            ObjectCreatedEvent::parse(
                r#"{"Records":[{"s3":{"bucket":{"name":"b"},"object":{"key":"bad%zz"}}}]}"#
            ),
            Err(EventError::BadKeyEncoding)
        ));
    }

    #[test]
    fn test_escape_requires_two_hex_digits() {
        assert_eq!(decode_key("a%2Fb+c").as_deref(), Some("a/b c"));
        assert_eq!(decode_key("%+1"), None);
        assert_eq!(decode_key("%-1"), None);
        assert_eq!(decode_key("%4"), None);
    }

    #[test]
    fn test_receipt_handle_parse() {
        let id = Uuid::new_v4();
        let receipt = ReceiptHandle::new(id, 2);
        assert_eq!(receipt.parse(), Some((id, 2)));
        assert_eq!(ReceiptHandle::from("garbage".to_string()).parse(), None);
    }
}
