//! Transport abstractions consumed by the retry and request/reply layer.
//!
//! This module defines the seam between the reliability layer and the
//! underlying message-queue client. Connection management, destination
//! resolution, and actual network I/O all live behind these traits; the
//! reliability layer only builds native messages, transmits them, and
//! performs bounded selected receives.
//!
//! ## Key components
//!
//! - [`Transport`]: send-with-factory and selected-receive primitives
//! - [`SendContext`]: per-send context used by the message factory to create
//!   native messages and resolve destination names
//! - [`NativeMessage`]: the transport's message type, with independently
//!   fallible field accessors
//! - [`Destination`] / [`ReplyTarget`]: destination references
//! - [`InMemoryTransport`]: queue-backed transport for tests and local
//!   pipelines
//!
//! Errors cross this seam as [`tower::BoxError`] so the concrete backend
//! error types stay visible to retry classification and to callers.

pub mod inmemory;

use std::time::Duration;

use crate::envelope::HeaderValue;

pub use inmemory::{InMemoryMessage, InMemoryTransport};

/// Opaque reference to a named destination (queue or topic).
///
/// Covers both the "destination reference" and "destination name" call
/// forms: build one from a name with `Destination::from("orders")`, or
/// obtain a resolved reference through
/// [`SendContext::resolve_destination_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
}

impl Destination {
    /// The destination name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Destination {
            name: name.to_owned(),
        }
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Destination { name }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Where a selected receive should consume from.
///
/// `None` at the [`Transport::receive_selected`] call site selects the
/// transport's default reply consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    /// An already-resolved destination reference.
    Destination(Destination),
    /// A destination name the transport resolves itself.
    Name(String),
}

/// The transport's native message type.
///
/// Each accessor is independently fallible: transports can fail to read or
/// write a single field on malformed data without invalidating the rest of
/// the message, and the envelope mapping recovers per field. Getters default
/// to `Ok(None)` so transports without a given field stay cheap to implement;
/// the setters are the writable surface and must be provided.
pub trait NativeMessage {
    /// Message id assigned by the transport at send time.
    fn message_id(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(None)
    }

    /// Correlation id, if set.
    fn correlation_id(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(None)
    }

    /// Set the correlation id.
    fn set_correlation_id(&mut self, id: &str) -> Result<(), tower::BoxError>;

    /// Reply destination, if set.
    fn reply_to(&self) -> Result<Option<Destination>, tower::BoxError> {
        Ok(None)
    }

    /// Set the reply destination.
    fn set_reply_to(&mut self, destination: Destination) -> Result<(), tower::BoxError>;

    /// Message type tag.
    fn message_type(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(None)
    }

    /// Delivery mode.
    fn delivery_mode(&self) -> Result<Option<i32>, tower::BoxError> {
        Ok(None)
    }

    /// Delivery time.
    fn delivery_time(&self) -> Result<Option<i64>, tower::BoxError> {
        Ok(None)
    }

    /// Destination the message was sent to.
    fn destination(&self) -> Result<Option<Destination>, tower::BoxError> {
        Ok(None)
    }

    /// Expiration time.
    fn expiration(&self) -> Result<Option<i64>, tower::BoxError> {
        Ok(None)
    }

    /// Priority.
    fn priority(&self) -> Result<Option<i32>, tower::BoxError> {
        Ok(None)
    }

    /// Redelivered flag.
    fn redelivered(&self) -> Result<Option<bool>, tower::BoxError> {
        Ok(None)
    }

    /// Send timestamp.
    fn timestamp(&self) -> Result<Option<i64>, tower::BoxError> {
        Ok(None)
    }

    /// Attach a custom typed property.
    fn set_property(&mut self, name: &str, value: HeaderValue) -> Result<(), tower::BoxError>;

    /// Read a custom property by name.
    fn property(&self, _name: &str) -> Result<Option<HeaderValue>, tower::BoxError> {
        Ok(None)
    }

    /// Names of all custom properties present on the message.
    fn property_names(&self) -> Result<Vec<String>, tower::BoxError> {
        Ok(Vec::new())
    }

    /// The textual body. `Ok(None)` means the message is not text-capable.
    fn text(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(None)
    }
}

/// Per-send context handed to the message factory.
///
/// The session analogue: it creates native messages and resolves destination
/// names inside the scope of one send.
pub trait SendContext {
    /// Native message type produced by this context.
    type Message: NativeMessage;

    /// Create a text-capable native message holding `payload`.
    fn create_text_message(&mut self, payload: &str) -> Result<Self::Message, tower::BoxError>;

    /// Resolve a destination name into a destination reference.
    fn resolve_destination_name(&mut self, name: &str) -> Result<Destination, tower::BoxError>;
}

/// Blocking message-queue client surface consumed by the reliability layer.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Native message type.
    type Message: NativeMessage + Send;
    /// Per-send context type handed to message factories.
    type Context: SendContext<Message = Self::Message> + Send;

    /// Build a native message through `factory` and transmit it to
    /// `destination`, returning the message as actually sent (with
    /// transport-assigned fields such as the message id filled in).
    async fn send_to<F>(
        &self,
        destination: &Destination,
        factory: F,
    ) -> Result<Self::Message, tower::BoxError>
    where
        F: FnOnce(&mut Self::Context) -> Result<Self::Message, tower::BoxError> + Send;

    /// Wait for a message matching `selector` on the given target, bounded by
    /// [`receive_timeout`](Transport::receive_timeout). `Ok(None)` means the
    /// timeout elapsed without a match. A `None` target uses the transport's
    /// default reply consumer.
    async fn receive_selected(
        &self,
        target: Option<&ReplyTarget>,
        selector: &str,
    ) -> Result<Option<Self::Message>, tower::BoxError>;

    /// The configured receive timeout. Zero means "wait indefinitely".
    fn receive_timeout(&self) -> Duration;
}
