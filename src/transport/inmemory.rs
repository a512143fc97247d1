//! In-memory transport for testing or local pipelines.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::envelope::{headers, HeaderValue};
use crate::transport::{Destination, NativeMessage, ReplyTarget, SendContext, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Native message of the in-memory transport.
///
/// Messages can also be constructed directly to stage replies in tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryMessage {
    message_id: Option<String>,
    correlation_id: Option<String>,
    reply_to: Option<Destination>,
    message_type: Option<String>,
    delivery_mode: Option<i32>,
    delivery_time: Option<i64>,
    destination: Option<Destination>,
    expiration: Option<i64>,
    priority: Option<i32>,
    redelivered: Option<bool>,
    timestamp: Option<i64>,
    properties: HashMap<String, HeaderValue>,
    body: Option<String>,
}

impl InMemoryMessage {
    /// Create a text-capable message holding `body`.
    pub fn text(body: impl Into<String>) -> Self {
        InMemoryMessage {
            body: Some(body.into()),
            ..InMemoryMessage::default()
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply destination.
    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }

    /// Attach a custom property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

impl NativeMessage for InMemoryMessage {
    fn message_id(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(self.message_id.clone())
    }

    fn correlation_id(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(self.correlation_id.clone())
    }

    fn set_correlation_id(&mut self, id: &str) -> Result<(), tower::BoxError> {
        self.correlation_id = Some(id.to_owned());
        Ok(())
    }

    fn reply_to(&self) -> Result<Option<Destination>, tower::BoxError> {
        Ok(self.reply_to.clone())
    }

    fn set_reply_to(&mut self, destination: Destination) -> Result<(), tower::BoxError> {
        self.reply_to = Some(destination);
        Ok(())
    }

    fn message_type(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(self.message_type.clone())
    }

    fn delivery_mode(&self) -> Result<Option<i32>, tower::BoxError> {
        Ok(self.delivery_mode)
    }

    fn delivery_time(&self) -> Result<Option<i64>, tower::BoxError> {
        Ok(self.delivery_time)
    }

    fn destination(&self) -> Result<Option<Destination>, tower::BoxError> {
        Ok(self.destination.clone())
    }

    fn expiration(&self) -> Result<Option<i64>, tower::BoxError> {
        Ok(self.expiration)
    }

    fn priority(&self) -> Result<Option<i32>, tower::BoxError> {
        Ok(self.priority)
    }

    fn redelivered(&self) -> Result<Option<bool>, tower::BoxError> {
        Ok(self.redelivered)
    }

    fn timestamp(&self) -> Result<Option<i64>, tower::BoxError> {
        Ok(self.timestamp)
    }

    fn set_property(&mut self, name: &str, value: HeaderValue) -> Result<(), tower::BoxError> {
        self.properties.insert(name.to_owned(), value);
        Ok(())
    }

    fn property(&self, name: &str) -> Result<Option<HeaderValue>, tower::BoxError> {
        Ok(self.properties.get(name).cloned())
    }

    fn property_names(&self) -> Result<Vec<String>, tower::BoxError> {
        Ok(self.properties.keys().cloned().collect())
    }

    fn text(&self) -> Result<Option<String>, tower::BoxError> {
        Ok(self.body.clone())
    }
}

/// Send context of the in-memory transport.
#[derive(Debug, Default)]
pub struct InMemoryContext;

impl SendContext for InMemoryContext {
    type Message = InMemoryMessage;

    fn create_text_message(&mut self, payload: &str) -> Result<InMemoryMessage, tower::BoxError> {
        Ok(InMemoryMessage::text(payload))
    }

    fn resolve_destination_name(&mut self, name: &str) -> Result<Destination, tower::BoxError> {
        Ok(Destination::from(name))
    }
}

type SendFailure = Box<dyn FnOnce() -> tower::BoxError + Send>;

/// In-memory transport backed by a shared map of named queues.
///
/// Useful for:
/// - Unit and integration testing
/// - Simulating send, receive, and failure behavior without a real broker
/// - Debugging message flows
///
/// Sends append to the destination's queue; selected receives poll the target
/// queue until a match arrives or the configured receive timeout elapses.
/// Message ids are stamped at send time unless disabled with
/// [`without_message_ids`](InMemoryTransport::without_message_ids).
#[derive(Clone)]
pub struct InMemoryTransport {
    queues: Arc<Mutex<HashMap<String, VecDeque<InMemoryMessage>>>>,
    send_failures: Arc<Mutex<VecDeque<SendFailure>>>,
    next_id: Arc<AtomicU64>,
    receive_timeout: Duration,
    default_reply_queue: Option<String>,
    assign_message_ids: bool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        InMemoryTransport {
            queues: Arc::new(Mutex::new(HashMap::new())),
            send_failures: Arc::new(Mutex::new(VecDeque::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            receive_timeout: Duration::from_secs(5),
            default_reply_queue: None,
            assign_message_ids: true,
        }
    }
}

impl InMemoryTransport {
    /// Create a new transport with empty queues and a 5 second receive
    /// timeout.
    pub fn new() -> Self {
        InMemoryTransport::default()
    }

    /// Set the receive timeout. Zero means "wait indefinitely".
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the queue used when a selected receive names no target.
    pub fn with_default_reply_queue(mut self, name: impl Into<String>) -> Self {
        self.default_reply_queue = Some(name.into());
        self
    }

    /// Stop stamping message ids at send time. Sent messages then carry
    /// neither a message id nor a correlation fallback.
    pub fn without_message_ids(mut self) -> Self {
        self.assign_message_ids = false;
        self
    }

    /// Queue a failure for the next send. Failures are consumed in order,
    /// one per send, before any message is built.
    pub async fn inject_send_failure<F>(&self, failure: F)
    where
        F: FnOnce() -> tower::BoxError + Send + 'static,
    {
        self.send_failures.lock().await.push_back(Box::new(failure));
    }

    /// Append a message to a queue, e.g. to stage a reply.
    pub async fn enqueue(&self, queue: &str, message: InMemoryMessage) {
        self.queues
            .lock()
            .await
            .entry(queue.to_owned())
            .or_default()
            .push_back(message);
    }

    /// Snapshot of the messages currently sitting in a queue.
    pub async fn queued_messages(&self, queue: &str) -> Vec<InMemoryMessage> {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn take_matching(&self, queue: &str, selector: &Selector) -> Option<InMemoryMessage> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(queue)?;
        let position = queue.iter().position(|message| selector.matches(message))?;
        queue.remove(position)
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    type Message = InMemoryMessage;
    type Context = InMemoryContext;

    #[tracing::instrument(skip(self, factory))]
    async fn send_to<F>(
        &self,
        destination: &Destination,
        factory: F,
    ) -> Result<InMemoryMessage, tower::BoxError>
    where
        F: FnOnce(&mut InMemoryContext) -> Result<InMemoryMessage, tower::BoxError> + Send,
    {
        if let Some(failure) = self.send_failures.lock().await.pop_front() {
            return Err(failure());
        }

        let mut context = InMemoryContext;
        let mut message = factory(&mut context)?;

        if self.assign_message_ids {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            message.message_id = Some(format!("ID:{id}"));
        }
        message.destination = Some(destination.clone());
        message.timestamp = Some(now_millis());

        self.queues
            .lock()
            .await
            .entry(destination.name().to_owned())
            .or_default()
            .push_back(message.clone());
        tracing::info!(destination = %destination, "Message sent to in-memory queue");

        Ok(message)
    }

    #[tracing::instrument(skip(self))]
    async fn receive_selected(
        &self,
        target: Option<&ReplyTarget>,
        selector: &str,
    ) -> Result<Option<InMemoryMessage>, tower::BoxError> {
        let queue = match target {
            Some(ReplyTarget::Destination(destination)) => destination.name().to_owned(),
            Some(ReplyTarget::Name(name)) => name.clone(),
            None => self
                .default_reply_queue
                .clone()
                .ok_or("no default reply queue configured")?,
        };
        let selector = Selector::parse(selector)?;

        let deadline = if self.receive_timeout.is_zero() {
            None
        } else {
            Some(tokio::time::Instant::now() + self.receive_timeout)
        };

        loop {
            if let Some(message) = self.take_matching(&queue, &selector).await {
                return Ok(Some(message));
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }
}

/// Parsed `Field='value'` selector expression.
#[derive(Debug)]
struct Selector {
    field: String,
    value: String,
}

impl Selector {
    fn parse(expression: &str) -> Result<Selector, tower::BoxError> {
        let (field, value) = expression
            .split_once('=')
            .ok_or_else(|| format!("unsupported selector: {expression}"))?;
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .ok_or_else(|| format!("unsupported selector: {expression}"))?;
        Ok(Selector {
            field: field.to_owned(),
            value: value.to_owned(),
        })
    }

    fn matches(&self, message: &InMemoryMessage) -> bool {
        if self.field == headers::CORRELATION_ID {
            message.correlation_id.as_deref() == Some(self.value.as_str())
        } else {
            message.properties.get(&self.field)
                == Some(&HeaderValue::String(self.value.clone()))
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
