//! Reliable send and request/reply on top of a [`Transport`].
//!
//! [`Courier`] is the public entry point. It validates the outgoing envelope,
//! wraps the transport interaction in the bounded retry loop, and for
//! request/reply calls derives a correlation key from the message as actually
//! sent, then waits for a matching reply under the transport's receive
//! timeout.
//!
//! ## Failure taxonomy
//!
//! - [`ValidationError`]: missing payload; raised before any transport
//!   interaction and never retried
//! - transport failures: whatever the backend returned, surfaced unchanged
//!   and retried only when their concrete type is registered as retryable
//! - [`TimeoutError`]: no reply within the receive timeout; carries the
//!   timeout and the selector used, and is retried only if explicitly
//!   registered like any other failure kind

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::classifier::RetryClassifier;
use crate::envelope::{headers, Envelope, HeaderValue};
use crate::retry::RetryExecutor;
use crate::transport::{Destination, NativeMessage, ReplyTarget, SendContext, Transport};

/// Reliability layer in front of a message-queue transport.
///
/// A `Courier` owns its transport, its retry configuration, and a
/// [`DeliveryHook`]. All configuration is applied at construction time and
/// shared read-only across calls; each call owns its own envelope and attempt
/// counter, so concurrent calls need no coordination.
///
/// Generic parameters:
/// - `T`: the transport backend
/// - `HK`: hook implementation for delivery lifecycle events
pub struct Courier<T, HK = DefaultDeliveryHook> {
    transport: T,
    executor: RetryExecutor,
    hook: HK,
}

impl<T> Courier<T, DefaultDeliveryHook> {
    /// Create a courier with an empty retryable-failure registry, a single
    /// retry budget, and the default logging hook.
    pub fn new(transport: T) -> Self {
        Courier {
            transport,
            executor: RetryExecutor::new(RetryClassifier::new()),
            hook: DefaultDeliveryHook,
        }
    }
}

impl<T, HK> Courier<T, HK> {
    /// Replace the delivery hook while keeping all other configuration.
    pub fn with_hook<HK2: DeliveryHook>(self, hook: HK2) -> Courier<T, HK2> {
        Courier {
            transport: self.transport,
            executor: self.executor,
            hook,
        }
    }

    /// Set the number of retries allowed after the initial attempt
    /// (minimum 1).
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.executor = self.executor.max_attempts(max_attempts);
        self
    }

    /// Register a failure type as retryable.
    pub fn retry_on<E: std::error::Error + 'static>(mut self) -> Self {
        self.executor.classifier_mut().register::<E>();
        self
    }

    /// Replace the whole retryable-failure registry.
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        *self.executor.classifier_mut() = classifier;
        self
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T, HK> Courier<T, HK>
where
    T: Transport,
    HK: DeliveryHook,
{
    /// Send `envelope` to `destination`, retrying classified failures.
    ///
    /// The payload is validated before any transport interaction. On success
    /// the sent observer fires with the envelope rebuilt from the message as
    /// actually transmitted.
    #[tracing::instrument(skip(self, envelope))]
    pub async fn send(
        &self,
        destination: &Destination,
        envelope: &mut Envelope,
    ) -> Result<(), tower::BoxError> {
        if envelope.payload().is_none() {
            return Err(ValidationError::missing_payload().into());
        }

        self.executor
            .execute(
                envelope,
                |env| self.hook.on_retry(env),
                |env| {
                    let transport = &self.transport;
                    let hook = &self.hook;
                    async move {
                        let sent = transport
                            .send_to(destination, |ctx| {
                                let mut native =
                                    ctx.create_text_message(env.payload().unwrap_or_default())?;
                                env.populate_native(&mut native);
                                Ok(native)
                            })
                            .await?;
                        hook.on_message_sent(&Envelope::from_native(&sent));
                        Ok(())
                    }
                },
            )
            .await
    }

    /// Send `envelope` to `destination` and wait for the correlated reply.
    ///
    /// The correlation key is the sent message's correlation id, falling back
    /// to its message id. Without either, no receive is attempted and
    /// `Ok(None)` is returned. The reply is consumed from the envelope's
    /// reply-to destination (a [`Destination`] used as-is, a string name
    /// resolved through the transport), or from the transport's default reply
    /// consumer when the envelope names none.
    ///
    /// A retried attempt repeats the whole sequence: a new outgoing message,
    /// a new correlation key, a fresh timed receive.
    #[tracing::instrument(skip(self, envelope))]
    pub async fn send_and_receive(
        &self,
        destination: &Destination,
        envelope: &mut Envelope,
    ) -> Result<Option<Envelope>, tower::BoxError> {
        if envelope.payload().is_none() {
            return Err(ValidationError::missing_payload().into());
        }
        // Captured once: retry observers may rewrite headers, the reply
        // target may not move between attempts.
        let reply_to = envelope.header(headers::REPLY_TO).cloned();

        self.executor
            .execute(
                envelope,
                |env| self.hook.on_retry(env),
                |env| {
                    let transport = &self.transport;
                    let hook = &self.hook;
                    let reply_to = reply_to.clone();
                    async move {
                        let sent = transport
                            .send_to(destination, |ctx| {
                                let mut native =
                                    ctx.create_text_message(env.payload().unwrap_or_default())?;
                                env.populate_native(&mut native);
                                match &reply_to {
                                    Some(HeaderValue::Destination(reply_to)) => {
                                        native.set_reply_to(reply_to.clone())?;
                                    }
                                    Some(HeaderValue::String(name)) => {
                                        let resolved = ctx.resolve_destination_name(name)?;
                                        native.set_reply_to(resolved)?;
                                    }
                                    _ => {}
                                }
                                Ok(native)
                            })
                            .await?;

                        hook.on_message_sent(&Envelope::from_native(&sent));

                        let Some(key) = read_correlation_key(&sent) else {
                            // Nothing to correlate a reply against.
                            return Ok(None);
                        };
                        let selector = format!("{}='{}'", headers::CORRELATION_ID, key);

                        if transport.receive_timeout().is_zero() {
                            tracing::warn!(
                                "receive timeout is zero, the reply wait will block indefinitely"
                            );
                        }

                        let target = match &reply_to {
                            Some(HeaderValue::Destination(reply_to)) => {
                                Some(ReplyTarget::Destination(reply_to.clone()))
                            }
                            Some(HeaderValue::String(name)) => {
                                Some(ReplyTarget::Name(name.clone()))
                            }
                            _ => None,
                        };

                        match transport.receive_selected(target.as_ref(), &selector).await? {
                            Some(reply) => {
                                let received = Envelope::from_native(&reply);
                                hook.on_message_received(&received);
                                Ok(Some(received))
                            }
                            None => {
                                Err(TimeoutError::new(transport.receive_timeout(), selector)
                                    .into())
                            }
                        }
                    }
                },
            )
            .await
    }
}

/// Correlation id of the sent message, falling back to its message id. A
/// failed read is logged and yields no key.
fn read_correlation_key<N: NativeMessage>(sent: &N) -> Option<String> {
    let key = sent.correlation_id().and_then(|id| match id {
        Some(id) => Ok(Some(id)),
        None => sent.message_id(),
    });
    match key {
        Ok(key) => key,
        Err(err) => {
            tracing::debug!(
                error = %err,
                "failed to read CorrelationID or MessageID from the sent message",
            );
            None
        }
    }
}

/// Hook trait for observing delivery lifecycle events.
///
/// Hooks are invoked synchronously on the calling task and should avoid heavy
/// or blocking work. Typical use cases include logging, metrics, and
/// adjusting a message before a retry.
pub trait DeliveryHook: Send + Sync {
    /// A message was handed to the transport; `envelope` is rebuilt from the
    /// message as actually sent.
    fn on_message_sent(&self, envelope: &Envelope);
    /// A correlated reply arrived.
    fn on_message_received(&self, envelope: &Envelope);
    /// The previous attempt failed with a retryable error; fired before the
    /// envelope is re-sent, and may mutate it.
    fn on_retry(&self, envelope: &mut Envelope);
}

/// Default delivery hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultDeliveryHook;

impl DeliveryHook for DefaultDeliveryHook {
    fn on_message_sent(&self, _envelope: &Envelope) {
        tracing::debug!("Message sent");
    }

    fn on_message_received(&self, _envelope: &Envelope) {
        tracing::debug!("Reply received");
    }

    fn on_retry(&self, _envelope: &mut Envelope) {
        tracing::debug!("Re-attempting delivery");
    }
}

/// Error raised when an envelope fails precondition checks.
///
/// Validation happens before any transport interaction and is never retried.
#[derive(Debug)]
pub struct ValidationError {
    context: SpanTrace,
    kind: ValidationErrorKind,
}

#[derive(Debug)]
enum ValidationErrorKind {
    MissingPayload,
}

impl ValidationError {
    fn missing_payload() -> Self {
        ValidationError {
            context: SpanTrace::capture(),
            kind: ValidationErrorKind::MissingPayload,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ValidationErrorKind::MissingPayload => {
                writeln!(f, "message payload is required before send")?;
            }
        }
        self.context.fmt(f)
    }
}

impl std::error::Error for ValidationError {}

/// Error raised when no reply arrives within the receive timeout.
///
/// Carries the timeout that elapsed and the selector the receive used. Like
/// any other failure it is retried only when explicitly registered.
#[derive(Debug)]
pub struct TimeoutError {
    context: SpanTrace,
    timeout: Duration,
    selector: String,
}

impl TimeoutError {
    fn new(timeout: Duration, selector: String) -> Self {
        TimeoutError {
            context: SpanTrace::capture(),
            timeout,
            selector,
        }
    }

    /// The receive timeout that elapsed.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The selector the receive was filtered by.
    pub fn selector(&self) -> &str {
        &self.selector
    }
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "timeout after waiting {} (ms) for {}",
            self.timeout.as_millis(),
            self.selector
        )?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemoryMessage, InMemoryTransport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct BrokerDown;

    impl std::fmt::Display for BrokerDown {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "broker down")
        }
    }

    impl std::error::Error for BrokerDown {}

    #[derive(Clone, Default)]
    struct RecordingHook {
        sent: Arc<Mutex<Vec<Envelope>>>,
        received: Arc<Mutex<Vec<Envelope>>>,
        retries: Arc<AtomicU32>,
    }

    impl DeliveryHook for RecordingHook {
        fn on_message_sent(&self, envelope: &Envelope) {
            self.sent.lock().unwrap().push(envelope.clone());
        }

        fn on_message_received(&self, envelope: &Envelope) {
            self.received.lock().unwrap().push(envelope.clone());
        }

        fn on_retry(&self, _envelope: &mut Envelope) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_delivers_payload_and_writable_headers() {
        let transport = InMemoryTransport::new();
        let hook = RecordingHook::default();
        let courier = Courier::new(transport.clone()).with_hook(hook.clone());

        let mut envelope = Envelope::builder()
            .header(headers::CORRELATION_ID, "abc")
            .header(headers::TIMESTAMP, 1i64)
            .header("tenant", "acme")
            .payload("ping")
            .build();

        courier
            .send(&Destination::from("orders"), &mut envelope)
            .await
            .unwrap();

        let queued = transport.queued_messages("orders").await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].text().unwrap(), Some("ping".to_owned()));
        assert_eq!(queued[0].correlation_id().unwrap(), Some("abc".to_owned()));
        assert_eq!(
            queued[0].property("tenant").unwrap(),
            Some(HeaderValue::String("acme".to_owned()))
        );
        // Read-only system header: never echoed, the transport stamps its own.
        assert_ne!(queued[0].timestamp().unwrap(), Some(1));
        assert_eq!(hook.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_without_payload_fails_validation_before_any_send() {
        let transport = InMemoryTransport::new();
        let courier = Courier::new(transport.clone());

        let mut envelope = Envelope::builder().header("tenant", "acme").build();
        let err = courier
            .send(&Destination::from("orders"), &mut envelope)
            .await
            .unwrap_err();

        assert!(err.is::<ValidationError>());
        assert!(transport.queued_messages("orders").await.is_empty());
    }

    #[tokio::test]
    async fn send_retries_registered_failures_and_stamps_the_wire_marker() {
        let transport = InMemoryTransport::new();
        transport.inject_send_failure(|| BrokerDown.into()).await;
        transport.inject_send_failure(|| BrokerDown.into()).await;

        let hook = RecordingHook::default();
        let courier = Courier::new(transport.clone())
            .with_hook(hook.clone())
            .max_attempts(2)
            .retry_on::<BrokerDown>();

        let mut envelope = Envelope::builder().payload("ping").build();
        courier
            .send(&Destination::from("orders"), &mut envelope)
            .await
            .unwrap();

        let queued = transport.queued_messages("orders").await;
        assert_eq!(queued.len(), 1);
        assert_eq!(
            queued[0].property(headers::RETRY_COUNT).unwrap(),
            Some(HeaderValue::Int(2))
        );
        assert_eq!(hook.retries.load(Ordering::SeqCst), 2);
        assert_eq!(
            envelope.header(headers::RETRY_COUNT),
            Some(&HeaderValue::Int(2))
        );
    }

    #[tokio::test]
    async fn send_surfaces_unregistered_failures_unchanged() {
        let transport = InMemoryTransport::new();
        transport.inject_send_failure(|| BrokerDown.into()).await;

        let hook = RecordingHook::default();
        let courier = Courier::new(transport.clone())
            .with_hook(hook.clone())
            .max_attempts(3);

        let mut envelope = Envelope::builder().payload("ping").build();
        let err = courier
            .send(&Destination::from("orders"), &mut envelope)
            .await
            .unwrap_err();

        assert!(err.is::<BrokerDown>());
        assert!(transport.queued_messages("orders").await.is_empty());
        assert_eq!(hook.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn send_and_receive_correlates_by_name_based_reply_to() {
        let transport = InMemoryTransport::new()
            .with_receive_timeout(Duration::from_millis(200));
        transport
            .enqueue(
                "replies",
                InMemoryMessage::text("pong").with_correlation_id("abc"),
            )
            .await;

        let hook = RecordingHook::default();
        let courier = Courier::new(transport.clone()).with_hook(hook.clone());

        let mut request = Envelope::builder()
            .header(headers::CORRELATION_ID, "abc")
            .header(headers::REPLY_TO, "replies")
            .payload("ping")
            .build();

        let reply = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap()
            .expect("correlated reply");

        assert_eq!(reply.payload(), Some("pong"));
        assert_eq!(
            reply.header(headers::CORRELATION_ID),
            Some(&HeaderValue::String("abc".to_owned()))
        );
        assert_eq!(hook.sent.lock().unwrap().len(), 1);
        assert_eq!(hook.received.lock().unwrap().len(), 1);
        // The request carried the resolved reply destination.
        let queued = transport.queued_messages("orders").await;
        assert_eq!(
            queued[0].reply_to().unwrap(),
            Some(Destination::from("replies"))
        );
    }

    #[tokio::test]
    async fn send_and_receive_accepts_destination_valued_reply_to() {
        let transport = InMemoryTransport::new()
            .with_receive_timeout(Duration::from_millis(200));
        transport
            .enqueue(
                "priority-replies",
                InMemoryMessage::text("pong").with_correlation_id("abc"),
            )
            .await;

        let courier = Courier::new(transport.clone());
        let mut request = Envelope::builder()
            .header(headers::CORRELATION_ID, "abc")
            .header(headers::REPLY_TO, Destination::from("priority-replies"))
            .payload("ping")
            .build();

        let reply = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap();

        assert_eq!(reply.unwrap().payload(), Some("pong"));
    }

    #[tokio::test]
    async fn send_and_receive_uses_the_default_reply_consumer() {
        let transport = InMemoryTransport::new()
            .with_receive_timeout(Duration::from_millis(200))
            .with_default_reply_queue("replies");
        transport
            .enqueue(
                "replies",
                InMemoryMessage::text("pong").with_correlation_id("abc"),
            )
            .await;

        let courier = Courier::new(transport.clone());
        let mut request = Envelope::builder()
            .header(headers::CORRELATION_ID, "abc")
            .payload("ping")
            .build();

        let reply = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap();

        assert_eq!(reply.unwrap().payload(), Some("pong"));
    }

    #[tokio::test]
    async fn send_and_receive_times_out_with_the_selector_used() {
        let transport = InMemoryTransport::new()
            .with_receive_timeout(Duration::from_millis(50));

        let courier = Courier::new(transport.clone());
        let mut request = Envelope::builder()
            .header(headers::CORRELATION_ID, "abc")
            .header(headers::REPLY_TO, "replies")
            .payload("ping")
            .build();

        let err = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap_err();

        let timeout = err.downcast_ref::<TimeoutError>().expect("timeout error");
        assert_eq!(timeout.timeout(), Duration::from_millis(50));
        assert_eq!(timeout.selector(), "CorrelationID='abc'");
    }

    #[tokio::test]
    async fn send_and_receive_without_correlation_skips_the_receive() {
        // No correlation header and no message-id stamping: no key can be
        // derived, so the call returns empty without attempting a receive
        // (a receive would fail here, no reply consumer is configured).
        let transport = InMemoryTransport::new().without_message_ids();

        let courier = Courier::new(transport.clone());
        let mut request = Envelope::builder().payload("ping").build();

        let reply = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap();

        assert!(reply.is_none());
        assert_eq!(transport.queued_messages("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn send_and_receive_falls_back_to_the_message_id() {
        let transport = InMemoryTransport::new()
            .with_receive_timeout(Duration::from_millis(200));
        // First message sent gets ID:1.
        transport
            .enqueue(
                "replies",
                InMemoryMessage::text("pong").with_correlation_id("ID:1"),
            )
            .await;

        let courier = Courier::new(transport.clone());
        let mut request = Envelope::builder()
            .header(headers::REPLY_TO, "replies")
            .payload("ping")
            .build();

        let reply = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap();

        assert_eq!(reply.unwrap().payload(), Some("pong"));
    }

    #[tokio::test]
    async fn registered_timeout_repeats_the_whole_request_reply_sequence() {
        let transport = InMemoryTransport::new()
            .with_receive_timeout(Duration::from_millis(20));

        let courier = Courier::new(transport.clone())
            .max_attempts(1)
            .retry_on::<TimeoutError>();

        let mut request = Envelope::builder()
            .header(headers::CORRELATION_ID, "abc")
            .header(headers::REPLY_TO, "replies")
            .payload("ping")
            .build();

        let err = courier
            .send_and_receive(&Destination::from("orders"), &mut request)
            .await
            .unwrap_err();

        assert!(err.is::<TimeoutError>());
        // Each attempt sent a fresh outgoing message.
        assert_eq!(transport.queued_messages("orders").await.len(), 2);
    }
}
