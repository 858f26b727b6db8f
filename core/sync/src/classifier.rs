//! Priority classification of incoming operations.

use driftsync_common::{Operation, OperationKind, Priority};

/// Result of classifying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub priority: Priority,
    pub safety_critical: bool,
}

/// Pure, deterministic classifier.
///
/// Classification never fails: unknown kinds get `Low` and are not marked
/// safety-critical here. The validator's per-entity-type safety marker is the
/// actual safety gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityClassifier;

impl PriorityClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify from the operation's kind and caller-supplied flags.
    pub fn classify(&self, op: &Operation) -> Classification {
        let flags = &op.flags;

        if flags.emergency || op.kind == OperationKind::Emergency {
            return Classification {
                priority: Priority::Critical,
                safety_critical: true,
            };
        }

        if op.kind == OperationKind::Unknown {
            return Classification {
                priority: Priority::Low,
                safety_critical: false,
            };
        }

        let priority = if flags.safety_domain {
            Priority::High
        } else if flags.time_sensitive {
            Priority::Medium
        } else {
            Priority::Low
        };

        Classification {
            priority,
            safety_critical: flags.safety_domain,
        }
    }

    /// Combine the classification with a caller-requested priority.
    ///
    /// A request may raise the priority but never lower it, so CRITICAL is
    /// never downgraded.
    pub fn resolve(&self, op: &Operation, requested: Option<Priority>) -> Classification {
        let mut classification = self.classify(op);
        if let Some(requested) = requested {
            classification.priority = classification.priority.max(requested);
        }
        classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_common::{DeviceId, EntityKey, OperationFlags};

    fn op(kind: OperationKind, flags: OperationFlags) -> Operation {
        Operation::new(
            kind,
            EntityKey::new("assessment", "1"),
            serde_json::Value::Null,
            DeviceId::new("device-a").unwrap(),
        )
        .with_flags(flags)
    }

    #[test]
    fn test_default_is_low() {
        let c = PriorityClassifier::new().classify(&op(OperationKind::Update, OperationFlags::default()));
        assert_eq!(c.priority, Priority::Low);
        assert!(!c.safety_critical);
    }

    #[test]
    fn test_time_sensitive_is_medium() {
        let flags = OperationFlags {
            time_sensitive: true,
            ..Default::default()
        };
        let c = PriorityClassifier::new().classify(&op(OperationKind::Create, flags));
        assert_eq!(c.priority, Priority::Medium);
    }

    #[test]
    fn test_safety_domain_is_high_and_safety_critical() {
        let flags = OperationFlags {
            safety_domain: true,
            time_sensitive: true,
            ..Default::default()
        };
        let c = PriorityClassifier::new().classify(&op(OperationKind::Update, flags));
        assert_eq!(c.priority, Priority::High);
        assert!(c.safety_critical);
    }

    #[test]
    fn test_emergency_is_critical() {
        let classifier = PriorityClassifier::new();
        let by_kind = classifier.classify(&op(OperationKind::Emergency, OperationFlags::default()));
        let by_flag = classifier.classify(&op(
            OperationKind::Update,
            OperationFlags {
                emergency: true,
                ..Default::default()
            },
        ));
        assert_eq!(by_kind.priority, Priority::Critical);
        assert_eq!(by_flag.priority, Priority::Critical);
    }

    #[test]
    fn test_unknown_kind_fails_open_on_priority() {
        let flags = OperationFlags {
            safety_domain: true,
            ..Default::default()
        };
        let c = PriorityClassifier::new().classify(&op(OperationKind::Unknown, flags));
        assert_eq!(c.priority, Priority::Low);
        assert!(!c.safety_critical);
    }

    #[test]
    fn test_request_never_downgrades() {
        let classifier = PriorityClassifier::new();
        let emergency = op(OperationKind::Emergency, OperationFlags::default());
        assert_eq!(
            classifier.resolve(&emergency, Some(Priority::Low)).priority,
            Priority::Critical
        );

        let plain = op(OperationKind::Update, OperationFlags::default());
        assert_eq!(
            classifier.resolve(&plain, Some(Priority::High)).priority,
            Priority::High
        );
    }
}
