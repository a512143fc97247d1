//! Transport-agnostic message model and native-message mapping.
//!
//! An [`Envelope`] bundles a string payload with a map of typed headers. It
//! is the unit the retry and request/reply machinery operates on, and it maps
//! bidirectionally to the transport's native message type:
//!
//! - [`Envelope::populate_native`] copies writable headers onto an outgoing
//!   native message
//! - [`Envelope::from_native`] builds an envelope from a received (or
//!   just-sent) native message
//!
//! ## System-reserved headers
//!
//! The keys in [`headers`] have transport-defined semantics. Most of them are
//! read-only on write: the transport owns them, so they are never copied onto
//! an outgoing message even when present on the envelope. Only
//! [`headers::CORRELATION_ID`] and [`headers::REPLY_TO`] are writable system
//! headers; every other header is copied as an opaque typed property.
//!
//! ## Mapping failures
//!
//! Native message accessors can fail individually on malformed or absent
//! data without invalidating the rest of the message. Both mapping directions
//! therefore treat each field as an independent attempt: a failed read or
//! write is logged at debug level and skipped, and the mapping step as a
//! whole cannot fail.

use std::collections::HashMap;

use crate::transport::{Destination, NativeMessage};

/// System-reserved header keys.
///
/// [`RETRY_COUNT`](headers::RETRY_COUNT) is not a transport field: it is the
/// integer custom property stamped onto the outgoing message from the second
/// delivery attempt onward.
pub mod headers {
    /// Message id assigned by the transport at send time. Read-only on write.
    pub const MESSAGE_ID: &str = "MessageID";
    /// Correlation id matching a reply to its request. Writable, string-valued.
    pub const CORRELATION_ID: &str = "CorrelationID";
    /// Message type tag. Read-only on write.
    pub const TYPE: &str = "Type";
    /// Delivery mode. Read-only on write.
    pub const DELIVERY_MODE: &str = "DeliveryMode";
    /// Delivery time. Read-only on write.
    pub const DELIVERY_TIME: &str = "DeliveryTime";
    /// Destination the message was sent to. Read-only on write.
    pub const DESTINATION: &str = "Destination";
    /// Expiration time. Read-only on write.
    pub const EXPIRATION: &str = "Expiration";
    /// Priority. Read-only on write.
    pub const PRIORITY: &str = "Priority";
    /// Redelivered flag. Read-only on write.
    pub const REDELIVERED: &str = "Redelivered";
    /// Reply destination. Writable, destination-valued.
    pub const REPLY_TO: &str = "ReplyTo";
    /// Send timestamp. Read-only on write.
    pub const TIMESTAMP: &str = "Timestamp";
    /// Retry marker stamped by the retry loop from the second attempt onward.
    pub const RETRY_COUNT: &str = "RetryCount";
}

/// Typed header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Int(i32),
    Long(i64),
    Bool(bool),
    Destination(Destination),
}

impl HeaderValue {
    /// Return the string value, if this is a string header.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(value) => Some(value),
            _ => None,
        }
    }

    /// Return the integer value, if this is an `Int` header.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            HeaderValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Return the destination value, if this is a destination header.
    pub fn as_destination(&self) -> Option<&Destination> {
        match self {
            HeaderValue::Destination(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i32> for HeaderValue {
    fn from(value: i32) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Long(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<Destination> for HeaderValue {
    fn from(value: Destination) -> Self {
        HeaderValue::Destination(value)
    }
}

/// Message container used by the send and request/reply pipeline.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic over the underlying broker: headers are plain
/// typed values and the payload is text.
///
/// ## Lifecycle
///
/// Envelopes are constructed with [`Envelope::builder`], accumulating headers
/// and then the payload. One envelope instance belongs to exactly one
/// in-flight call; the retry loop mutates the [`headers::RETRY_COUNT`] header
/// in place between attempts, everything else is left untouched after
/// construction.
///
/// ## Example
///
/// ```rust
/// use courier::Envelope;
/// use courier::envelope::headers;
///
/// let envelope = Envelope::builder()
///     .header(headers::CORRELATION_ID, "order-42")
///     .header("tenant", "acme")
///     .payload(r#"{"order":42}"#)
///     .build();
///
/// assert_eq!(envelope.payload(), Some(r#"{"order":42}"#));
/// assert_eq!(
///     envelope.header("tenant").and_then(|v| v.as_str()),
///     Some("acme"),
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    headers: HashMap<String, HeaderValue>,
    payload: Option<String>,
}

impl Envelope {
    /// Start building a new envelope.
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    /// Look up a header by name.
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Set or replace a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Iterate over all headers. Insertion order is not preserved.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// The textual payload, if present.
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Set or replace the payload.
    pub fn set_payload(&mut self, payload: impl Into<String>) {
        self.payload = Some(payload.into());
    }

    /// Copy the writable headers of this envelope onto an outgoing native
    /// message.
    ///
    /// Read-only system headers are skipped. [`headers::CORRELATION_ID`] must
    /// hold a string and [`headers::REPLY_TO`] a destination; any other
    /// writable header is copied as a typed property. Skipped headers and
    /// individual native setter failures are logged at debug level; this
    /// function never aborts the send.
    #[tracing::instrument(skip_all)]
    pub fn populate_native<N: NativeMessage>(&self, native: &mut N) {
        for (name, value) in &self.headers {
            if is_read_only_on_write(name) {
                tracing::debug!(header = %name, "header is read-only on write - skipping");
                continue;
            }

            if name == headers::CORRELATION_ID {
                match value {
                    HeaderValue::String(id) => {
                        if let Err(err) = native.set_correlation_id(id) {
                            tracing::debug!(error = %err, "failed to set CorrelationID - skipping");
                        }
                    }
                    other => {
                        tracing::debug!(
                            value = ?other,
                            "invalid CorrelationID value, only strings are supported - skipping",
                        );
                    }
                }
            } else if name == headers::REPLY_TO {
                match value {
                    HeaderValue::Destination(destination) => {
                        if let Err(err) = native.set_reply_to(destination.clone()) {
                            tracing::debug!(error = %err, "failed to set ReplyTo - skipping");
                        }
                    }
                    other => {
                        tracing::debug!(
                            value = ?other,
                            "invalid ReplyTo value, only destinations are supported - skipping",
                        );
                    }
                }
            } else if let Err(err) = native.set_property(name, value.clone()) {
                tracing::debug!(header = %name, error = %err, "failed to set property - skipping");
            }
        }
    }

    /// Build an envelope from a native message.
    ///
    /// Every standard system property is read through its own guarded
    /// accessor, so one failing read does not block the others. Custom
    /// properties are copied as-is. The payload is read only when the native
    /// message is text-capable; otherwise it is left absent.
    #[tracing::instrument(skip_all)]
    pub fn from_native<N: NativeMessage>(native: &N) -> Envelope {
        type FieldReader<N> = fn(&N) -> Result<Option<HeaderValue>, tower::BoxError>;

        let fields: [(&str, FieldReader<N>); 11] = [
            (headers::CORRELATION_ID, |m| {
                Ok(m.correlation_id()?.map(HeaderValue::String))
            }),
            (headers::DELIVERY_MODE, |m| {
                Ok(m.delivery_mode()?.map(HeaderValue::Int))
            }),
            (headers::DELIVERY_TIME, |m| {
                Ok(m.delivery_time()?.map(HeaderValue::Long))
            }),
            (headers::DESTINATION, |m| {
                Ok(m.destination()?.map(HeaderValue::Destination))
            }),
            (headers::EXPIRATION, |m| {
                Ok(m.expiration()?.map(HeaderValue::Long))
            }),
            (headers::MESSAGE_ID, |m| {
                Ok(m.message_id()?.map(HeaderValue::String))
            }),
            (headers::PRIORITY, |m| Ok(m.priority()?.map(HeaderValue::Int))),
            (headers::REDELIVERED, |m| {
                Ok(m.redelivered()?.map(HeaderValue::Bool))
            }),
            (headers::REPLY_TO, |m| {
                Ok(m.reply_to()?.map(HeaderValue::Destination))
            }),
            (headers::TIMESTAMP, |m| {
                Ok(m.timestamp()?.map(HeaderValue::Long))
            }),
            (headers::TYPE, |m| {
                Ok(m.message_type()?.map(HeaderValue::String))
            }),
        ];

        let mut builder = Envelope::builder();

        for (name, read) in fields {
            match read(native) {
                Ok(Some(value)) => builder = builder.header(name, value),
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(header = %name, error = %err, "failed to read system header - skipping");
                }
            }
        }

        match native.property_names() {
            Ok(names) => {
                for name in names {
                    match native.property(&name) {
                        Ok(Some(value)) => builder = builder.header(name, value),
                        Ok(None) => {}
                        Err(err) => {
                            tracing::debug!(property = %name, error = %err, "failed to read property - skipping");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "failed to read property names - skipping");
            }
        }

        match native.text() {
            Ok(Some(text)) => builder = builder.payload(text),
            Ok(None) => {
                tracing::debug!("message has no text body, payload left absent");
            }
            Err(err) => {
                tracing::debug!(error = %err, "failed to read text body - skipping");
            }
        }

        builder.build()
    }
}

/// Builder accumulating headers and payload for an [`Envelope`].
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    headers: HashMap<String, HeaderValue>,
    payload: Option<String>,
}

impl EnvelopeBuilder {
    /// Add a single header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a batch of headers.
    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, HeaderValue)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Finish building the envelope.
    pub fn build(self) -> Envelope {
        Envelope {
            headers: self.headers,
            payload: self.payload,
        }
    }
}

/// Whether a header key is system-reserved and owned by the transport on the
/// outgoing path. Only `CorrelationID` and `ReplyTo` are writable system
/// headers.
fn is_read_only_on_write(name: &str) -> bool {
    matches!(
        name,
        headers::MESSAGE_ID
            | headers::DELIVERY_MODE
            | headers::TYPE
            | headers::DESTINATION
            | headers::DELIVERY_TIME
            | headers::PRIORITY
            | headers::TIMESTAMP
            | headers::REDELIVERED
            | headers::EXPIRATION
    )
}
