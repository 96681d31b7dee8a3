//! Routing keys: the string identity used to look up subscriptions/handlers.
//!
//! A routing table keyed by runtime type reflection would need a type
//! registry at dispatch time; this derives the key directly from
//! `std::any::type_name` instead, with an escape hatch for an explicit
//! string supplied at publish time for cross-type groupings.

use std::any::type_name;
use std::fmt;

/// A routing key: either a type's fully qualified name, or an explicit
/// string supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// The routing key for a concrete type `T`, as used by `Publish<E>`/`Subscribe<E>`.
    pub fn of<T: ?Sized>() -> Self {
        RoutingKey(type_name::<T>().to_string())
    }

    /// An explicit routing key, as used by `Publish(name, e)`/`Subscribe(name, ...)`.
    pub fn named(name: impl Into<String>) -> Self {
        RoutingKey(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RoutingKey {
    fn from(value: String) -> Self {
        RoutingKey(value)
    }
}

impl From<&str> for RoutingKey {
    fn from(value: &str) -> Self {
        RoutingKey(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Payment;

    #[test]
    fn of_uses_fully_qualified_type_name() {
        let key = RoutingKey::of::<Payment>();
        assert!(key.as_str().ends_with("Payment"));
    }

    #[test]
    fn named_is_used_verbatim() {
        let key = RoutingKey::named("billing.invoice_issued");
        assert_eq!(key.as_str(), "billing.invoice_issued");
    }

    #[test]
    fn two_routing_keys_for_the_same_type_are_equal() {
        assert_eq!(RoutingKey::of::<Payment>(), RoutingKey::of::<Payment>());
    }
}
