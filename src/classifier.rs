//! Registry of retryable failure kinds.

use std::any::TypeId;
use std::error::Error;

/// Registry deciding which failures are eligible for automatic retry.
///
/// Failure kinds are identified by their concrete error type and registered
/// with [`register`](RetryClassifier::register). The registry is additive and
/// meant to be configured once per executor instance; it is read on every
/// failure but never mutated by in-flight calls.
///
/// ## Matching
///
/// [`is_retryable`](RetryClassifier::is_retryable) walks the failure's
/// `source()` chain, but on every step it is the **outermost** failure's type
/// that is tested against the registry. A registered kind buried as a cause
/// several levels deep therefore never matches on its own; callers relying on
/// cause types must register the outer type they actually receive.
#[derive(Default)]
pub struct RetryClassifier {
    kinds: Vec<RegisteredKind>,
}

struct RegisteredKind {
    type_id: TypeId,
    name: &'static str,
    matches: fn(&(dyn Error + 'static)) -> bool,
}

impl RetryClassifier {
    /// Create an empty registry: no failure is retryable.
    pub fn new() -> Self {
        RetryClassifier::default()
    }

    /// Register an error type as retryable. Registering the same type twice
    /// has no effect.
    pub fn register<E: Error + 'static>(&mut self) {
        let type_id = TypeId::of::<E>();
        if self.kinds.iter().any(|kind| kind.type_id == type_id) {
            return;
        }
        self.kinds.push(RegisteredKind {
            type_id,
            name: std::any::type_name::<E>(),
            matches: |failure| failure.is::<E>(),
        });
    }

    /// Whether `failure` should be retried.
    pub fn is_retryable(&self, failure: &(dyn Error + 'static)) -> bool {
        let mut cause: Option<&(dyn Error + 'static)> = Some(failure);
        while let Some(current) = cause {
            // The probe targets the outermost failure on every step of the
            // chain walk; the walk only bounds how often it is attempted.
            if self.kinds.iter().any(|kind| (kind.matches)(failure)) {
                return true;
            }
            cause = current.source();
        }
        false
    }
}

impl std::fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.kinds.iter().map(|kind| kind.name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BrokerUnavailable;

    impl std::fmt::Display for BrokerUnavailable {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "broker unavailable")
        }
    }

    impl Error for BrokerUnavailable {}

    #[derive(Debug)]
    struct SendFailed {
        cause: BrokerUnavailable,
    }

    impl std::fmt::Display for SendFailed {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "send failed")
        }
    }

    impl Error for SendFailed {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.cause)
        }
    }

    #[test]
    fn registered_outermost_kind_is_retryable() {
        let mut classifier = RetryClassifier::new();
        classifier.register::<BrokerUnavailable>();

        assert!(classifier.is_retryable(&BrokerUnavailable));
    }

    #[test]
    fn unregistered_kind_is_not_retryable() {
        let classifier = RetryClassifier::new();

        assert!(!classifier.is_retryable(&BrokerUnavailable));
    }

    #[test]
    fn registered_cause_kind_does_not_match_the_outer_failure() {
        let mut classifier = RetryClassifier::new();
        classifier.register::<BrokerUnavailable>();

        let failure = SendFailed {
            cause: BrokerUnavailable,
        };

        // Only the outermost type is probed, even though the cause chain is
        // walked and contains a registered kind.
        assert!(!classifier.is_retryable(&failure));
    }

    #[test]
    fn registering_the_outer_kind_matches_regardless_of_causes() {
        let mut classifier = RetryClassifier::new();
        classifier.register::<SendFailed>();

        let failure = SendFailed {
            cause: BrokerUnavailable,
        };

        assert!(classifier.is_retryable(&failure));
    }
}
