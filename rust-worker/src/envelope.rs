//! Job envelopes as they travel through the broker.
//!
//! The body is a UTF-8 JSON object `{"jobType": "...", ...payloadFields}`.
//! Retry bookkeeping lives in AMQP headers, never in the body, so a retried
//! or quarantined envelope carries the exact bytes the Producer published.

use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const ERROR_HEADER: &str = "x-error";
pub const ORIGINAL_ERROR_HEADER: &str = "x-original-error";
pub const ORIGINAL_EXCHANGE_HEADER: &str = "x-original-exchange";
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
pub const REPLAY_COUNT_HEADER: &str = "x-replay-count";

const JOB_TYPE_FIELD: &str = "jobType";

/// Typed view over the headers of an envelope.
///
/// Headers this crate does not own are kept in `other` and carried forward
/// unchanged, except the broker's own `x-death` bookkeeping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeHeaders {
    pub retry_count: Option<u32>,
    pub error: Option<String>,
    pub original_error: Option<String>,
    pub original_exchange: Option<String>,
    pub original_routing_key: Option<String>,
    pub replay_count: Option<u32>,
    pub other: FieldTable,
}

impl EnvelopeHeaders {
    pub fn from_field_table(table: &FieldTable) -> Self {
        let mut headers = Self::default();

        for (key, value) in table.inner() {
            match key.as_str() {
                RETRY_COUNT_HEADER => headers.retry_count = int_value(value),
                ERROR_HEADER => headers.error = string_value(value),
                ORIGINAL_ERROR_HEADER => headers.original_error = string_value(value),
                ORIGINAL_EXCHANGE_HEADER => headers.original_exchange = string_value(value),
                ORIGINAL_ROUTING_KEY_HEADER => headers.original_routing_key = string_value(value),
                REPLAY_COUNT_HEADER => headers.replay_count = int_value(value),
                _ => {
                    headers.other.insert(key.clone(), value.clone());
                }
            }
        }

        headers
    }

    pub fn to_field_table(&self) -> FieldTable {
        let mut table = self.other.clone();

        if let Some(count) = self.retry_count {
            table.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(i64::from(count)));
        }
        if let Some(count) = self.replay_count {
            table.insert(REPLAY_COUNT_HEADER.into(), AMQPValue::LongLongInt(i64::from(count)));
        }

        let strings = [
            (ERROR_HEADER, &self.error),
            (ORIGINAL_ERROR_HEADER, &self.original_error),
            (ORIGINAL_EXCHANGE_HEADER, &self.original_exchange),
            (ORIGINAL_ROUTING_KEY_HEADER, &self.original_routing_key),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                table.insert(
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value.as_str())),
                );
            }
        }

        table
    }

    /// Copy of these headers without broker-managed dead-letter bookkeeping.
    fn carried_forward(&self) -> Self {
        let mut other = FieldTable::default();
        for (key, value) in self.other.inner() {
            if !is_broker_bookkeeping(key.as_str()) {
                other.insert(key.clone(), value.clone());
            }
        }
        Self {
            other,
            ..self.clone()
        }
    }
}

fn is_broker_bookkeeping(key: &str) -> bool {
    key.starts_with("x-death") || key.starts_with("x-first-death") || key.starts_with("x-last-death")
}

/// Read a non-negative integer header written by any AMQP client.
fn int_value(value: &AMQPValue) -> Option<u32> {
    let wide: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::Double(v) if v.fract() == 0.0 => *v as i64,
        AMQPValue::Float(v) if v.fract() == 0.0 => *v as i64,
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok()?,
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(wide).ok()
}

fn string_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => None,
    }
}

/// Where a job was first published, used to route replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub exchange: String,
    pub routing_key: String,
}

impl Origin {
    /// Origin recorded in the headers, falling back to where this delivery came from.
    ///
    /// The headers win because a retried delivery arrives via the retry
    /// queue's dead-letter route, not the Producer's routing key.
    pub fn resolve(headers: &EnvelopeHeaders, exchange: &str, routing_key: &str) -> Self {
        Self {
            exchange: headers
                .original_exchange
                .clone()
                .unwrap_or_else(|| exchange.to_string()),
            routing_key: headers
                .original_routing_key
                .clone()
                .unwrap_or_else(|| routing_key.to_string()),
        }
    }
}

/// One message unit: job-type tag, opaque body and retry headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub job_type: String,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub headers: EnvelopeHeaders,
}

impl Envelope {
    /// Build a fresh envelope for `payload` tagged with `job_type`.
    ///
    /// The payload must serialize to a JSON object; its fields are flattened
    /// next to `jobType`. No retry headers are set.
    pub fn encode<T: Serialize>(job_type: &str, payload: &T) -> Result<Self, EnvelopeError> {
        let mut fields = match serde_json::to_value(payload)? {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            _ => return Err(EnvelopeError::NotAnObject),
        };
        fields.insert(JOB_TYPE_FIELD.to_string(), Value::String(job_type.to_string()));

        Ok(Self {
            job_type: job_type.to_string(),
            body: serde_json::to_vec(&fields)?,
            message_id: Some(format!("{}-{:016x}", job_type, rand::random::<u64>())),
            headers: EnvelopeHeaders::default(),
        })
    }

    /// Rebuild an envelope from raw broker parts.
    ///
    /// The job type is read on a best-effort basis; a body without one still
    /// produces an envelope so that it can be quarantined.
    pub fn from_parts(body: Vec<u8>, message_id: Option<String>, headers: Option<&FieldTable>) -> Self {
        let job_type = serde_json::from_slice::<Map<String, Value>>(&body)
            .ok()
            .and_then(|fields| fields.get(JOB_TYPE_FIELD)?.as_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            job_type,
            body,
            message_id,
            headers: headers.map(EnvelopeHeaders::from_field_table).unwrap_or_default(),
        }
    }

    /// Current retry count, defaulting to 0 when the header is absent.
    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count.unwrap_or(0)
    }

    /// Strictly decode the body into a job for handler invocation.
    pub fn job(&self) -> Result<Job, EnvelopeError> {
        let mut fields = match serde_json::from_slice::<Value>(&self.body)? {
            Value::Object(fields) => fields,
            _ => return Err(EnvelopeError::NotAnObject),
        };
        let job_type = match fields.remove(JOB_TYPE_FIELD) {
            Some(Value::String(job_type)) => job_type,
            _ => return Err(EnvelopeError::MissingJobType),
        };

        Ok(Job {
            job_type,
            payload: Value::Object(fields),
            message_id: self.message_id.clone(),
            retry_count: self.retry_count(),
        })
    }

    /// Replay target recorded in the headers.
    ///
    /// `None` unless both origin headers are present and the routing key is
    /// non-empty; an empty routing key on a named exchange is silently
    /// dropped by the broker.
    pub fn recorded_origin(&self) -> Option<Origin> {
        let exchange = self.headers.original_exchange.as_ref()?;
        let routing_key = self.headers.original_routing_key.as_ref()?;
        if routing_key.is_empty() {
            return None;
        }
        Some(Origin {
            exchange: exchange.clone(),
            routing_key: routing_key.clone(),
        })
    }

    fn derive(&self, headers: EnvelopeHeaders) -> Self {
        Self {
            job_type: self.job_type.clone(),
            body: self.body.clone(),
            message_id: self.message_id.clone(),
            headers,
        }
    }

    /// New envelope for the retry queue with the given (already incremented) count.
    ///
    /// `x-original-error` is only set on the first hop.
    pub fn for_retry(&self, retry_count: u32, error: &str, origin: &Origin) -> Self {
        let mut headers = self.headers.carried_forward();
        headers.retry_count = Some(retry_count);
        if headers.original_error.is_none() {
            headers.original_error = Some(error.to_string());
        }
        headers.original_exchange = Some(origin.exchange.clone());
        headers.original_routing_key = Some(origin.routing_key.clone());
        self.derive(headers)
    }

    /// New envelope for the dead-letter exchange.
    ///
    /// `x-error` is the final failure, `x-original-error` the first one recorded.
    pub fn for_quarantine(&self, retry_count: u32, error: &str, origin: &Origin) -> Self {
        let mut headers = self.headers.carried_forward();
        headers.retry_count = Some(retry_count);
        headers.error = Some(error.to_string());
        if headers.original_error.is_none() {
            headers.original_error = Some(error.to_string());
        }
        headers.original_exchange = Some(origin.exchange.clone());
        headers.original_routing_key = Some(origin.routing_key.clone());
        self.derive(headers)
    }

    /// New envelope for re-publishing a quarantined job with a fresh retry budget.
    pub fn for_replay(&self) -> Self {
        let mut headers = self.headers.carried_forward();
        headers.retry_count = Some(0);
        headers.error = None;
        headers.replay_count = Some(headers.replay_count.unwrap_or(0).saturating_add(1));
        self.derive(headers)
    }
}

/// Decoded job handed to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_type: String,
    pub payload: Value,
    pub message_id: Option<String>,
    pub retry_count: u32,
}

impl Job {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// An envelope as delivered on a queue, with the broker's delivery metadata.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
}

impl From<Delivery> for Incoming {
    fn from(mut delivery: Delivery) -> Self {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string());
        let body = std::mem::take(&mut delivery.data);
        let envelope = Envelope::from_parts(body, message_id, delivery.properties.headers().as_ref());

        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            envelope,
        }
    }
}
