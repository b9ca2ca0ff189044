//! Event keys.
//!
//! Events are addressed by [`EventKey`]: a name, a number, or a [`Symbol`].
//! Symbols are unique by construction and are what signals use for their
//! private channels on the process-wide buses.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique, non-string event key.
///
/// Two symbols compare equal only if one is a clone of the other; the
/// description is informational.
#[derive(Debug, Clone)]
pub struct Symbol {
    id: u64,
    description: Cow<'static, str>,
}

impl Symbol {
    /// Create a new unique symbol.
    pub fn new(description: impl Into<Cow<'static, str>>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self {
            id: COUNTER.fetch_add(1, Ordering::Relaxed),
            description: description.into(),
        }
    }

    /// Get the human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Key identifying an event channel on an emitter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// A named event such as `"change"`.
    Name(Cow<'static, str>),
    /// A numeric event key.
    Number(i64),
    /// A unique symbol key.
    Symbol(Symbol),
}

impl EventKey {
    /// The reserved error channel.
    pub const fn error() -> Self {
        EventKey::Name(Cow::Borrowed("error"))
    }

    /// Whether this key is the reserved error channel.
    pub fn is_error(&self) -> bool {
        matches!(self, EventKey::Name(name) if name == "error")
    }

    /// The string event type used for target-style emitters, which can only
    /// key on strings.
    pub fn to_type_string(&self) -> Cow<'_, str> {
        match self {
            EventKey::Name(name) => Cow::Borrowed(name.as_ref()),
            EventKey::Number(n) => Cow::Owned(n.to_string()),
            EventKey::Symbol(sym) => Cow::Owned(format!("@@{}#{}", sym.description, sym.id)),
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Name(name) => f.write_str(name),
            EventKey::Number(n) => write!(f, "{n}"),
            EventKey::Symbol(sym) => write!(f, "Symbol({})", sym.description),
        }
    }
}

impl From<&'static str> for EventKey {
    fn from(name: &'static str) -> Self {
        EventKey::Name(Cow::Borrowed(name))
    }
}

impl From<String> for EventKey {
    fn from(name: String) -> Self {
        EventKey::Name(Cow::Owned(name))
    }
}

impl From<i64> for EventKey {
    fn from(n: i64) -> Self {
        EventKey::Number(n)
    }
}

impl From<Symbol> for EventKey {
    fn from(sym: Symbol) -> Self {
        EventKey::Symbol(sym)
    }
}

impl From<&EventKey> for EventKey {
    fn from(key: &EventKey) -> Self {
        key.clone()
    }
}
