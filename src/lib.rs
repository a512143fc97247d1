#![doc = include_str!("../README.md")]

pub mod classifier;
mod client;
pub mod envelope;
pub mod retry;
pub mod transport;

#[doc(inline)]
pub use envelope::{Envelope, EnvelopeBuilder, HeaderValue};

#[doc(inline)]
pub use classifier::RetryClassifier;

#[doc(inline)]
pub use retry::RetryExecutor;

#[doc(inline)]
pub use transport::{Destination, NativeMessage, ReplyTarget, SendContext, Transport};

#[doc(inline)]
pub use client::{Courier, DefaultDeliveryHook, DeliveryHook, TimeoutError, ValidationError};
