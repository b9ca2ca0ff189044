//! Signal identity.
//!
//! Every signal gets a [`SignalId`] when created and a private [`SignalKey`]
//! naming its channels on the runtime's process-wide buses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::emitter::{EventKey, Symbol};

/// Unique identifier for a signal.
///
/// Uses an atomic counter so identifiers stay unique across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u64);

impl SignalId {
    /// Generate a new unique signal ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for SignalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A signal's identity together with its broadcast channel.
///
/// Dependents subscribe to `channel` on the invalidation bus; value
/// listeners subscribe to it on the change bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignalKey {
    /// The signal's identifier.
    pub id: SignalId,
    /// The signal's private channel key.
    pub channel: EventKey,
}

impl SignalKey {
    pub(crate) fn new(id: SignalId) -> Self {
        Self {
            id,
            channel: EventKey::Symbol(Symbol::new(format!("signal{id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_ids_are_unique() {
        let id1 = SignalId::new();
        let id2 = SignalId::new();
        let id3 = SignalId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn keys_get_private_channels() {
        let id = SignalId::new();
        let a = SignalKey::new(id);
        let b = SignalKey::new(id);
        assert_eq!(a.id, b.id);
        assert_ne!(a.channel, b.channel);
    }
}
