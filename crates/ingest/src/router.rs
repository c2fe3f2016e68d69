//! Event routing
//!
//! Pure, synchronous mapping from the provider's event-type string to a
//! handler tag. The set of handled types is statically enumerable; anything
//! else is acknowledged and dropped by the pipeline; the provider sends
//! many event types this service does not care about, and that is not an
//! error.

/// Handler tag for a routed event. One variant per handled provider type;
/// dispatch is a match in the reconciler, resolved once per delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    PaymentMethodAttached,
    PaymentMethodDetached,
    DisputeCreated,
    DisputeClosed,
}

impl EventKind {
    /// Normalized name carried on the outbound domain event and used in the
    /// bus channel (`payment:<name>`).
    pub fn domain_event_type(&self) -> &'static str {
        match self {
            EventKind::SubscriptionCreated => "subscription.created",
            EventKind::SubscriptionUpdated => "subscription.updated",
            EventKind::SubscriptionDeleted => "subscription.canceled",
            EventKind::TrialWillEnd => "trial.will_end",
            EventKind::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            EventKind::InvoicePaymentFailed => "invoice.payment_failed",
            EventKind::PaymentIntentSucceeded => "payment_intent.succeeded",
            EventKind::PaymentIntentFailed => "payment_intent.failed",
            EventKind::PaymentMethodAttached => "payment_method.attached",
            EventKind::PaymentMethodDetached => "payment_method.detached",
            EventKind::DisputeCreated => "dispute.created",
            EventKind::DisputeClosed => "dispute.closed",
        }
    }
}

/// Map a provider event-type string to its handler tag. `None` means the
/// type is not handled and the event should be acknowledged and dropped.
pub fn route(event_type: &str) -> Option<EventKind> {
    match event_type {
        "customer.subscription.created" => Some(EventKind::SubscriptionCreated),
        "customer.subscription.updated" => Some(EventKind::SubscriptionUpdated),
        "customer.subscription.deleted" => Some(EventKind::SubscriptionDeleted),
        "customer.subscription.trial_will_end" => Some(EventKind::TrialWillEnd),
        "invoice.payment_succeeded" => Some(EventKind::InvoicePaymentSucceeded),
        "invoice.payment_failed" => Some(EventKind::InvoicePaymentFailed),
        "payment_intent.succeeded" => Some(EventKind::PaymentIntentSucceeded),
        "payment_intent.payment_failed" => Some(EventKind::PaymentIntentFailed),
        "payment_method.attached" => Some(EventKind::PaymentMethodAttached),
        "payment_method.detached" => Some(EventKind::PaymentMethodDetached),
        "charge.dispute.created" => Some(EventKind::DisputeCreated),
        "charge.dispute.closed" => Some(EventKind::DisputeClosed),
        _ => None,
    }
}

/// The provider types this service handles, for diagnostics and docs.
pub fn handled_types() -> &'static [&'static str] {
    &[
        "customer.subscription.created",
        "customer.subscription.updated",
        "customer.subscription.deleted",
        "customer.subscription.trial_will_end",
        "invoice.payment_succeeded",
        "invoice.payment_failed",
        "payment_intent.succeeded",
        "payment_intent.payment_failed",
        "payment_method.attached",
        "payment_method.detached",
        "charge.dispute.created",
        "charge.dispute.closed",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_every_handled_type() {
        for event_type in handled_types() {
            assert!(route(event_type).is_some(), "unrouted: {event_type}");
        }
    }

    #[test]
    fn unknown_types_are_unrouted() {
        assert_eq!(route("customer.created"), None);
        assert_eq!(route("invoice.finalized"), None);
        assert_eq!(route(""), None);
    }

    #[test]
    fn deleted_normalizes_to_canceled() {
        let kind = route("customer.subscription.deleted").unwrap();
        assert_eq!(kind.domain_event_type(), "subscription.canceled");
    }
}
