//! Reactive Context
//!
//! The reactive context tracks which signal is currently computing. This
//! enables automatic dependency tracking: when a signal is read, the
//! computing signal is recorded as its dependent.
//!
//! # Implementation
//!
//! We use a thread-local stack. Running a derivation pushes the signal onto
//! the stack through a guard, and the guard pops it when dropped, also when
//! the derivation panics. Only the top entry collects dependencies, so a
//! derivation that reads a dirty upstream (which then computes on the same
//! stack) records the upstream, never the upstream's own inputs.
//!
//! The stack is also the cycle check's first half: a signal finding itself
//! at the top of the stack is reading itself.

use std::cell::RefCell;

use super::id::{SignalId, SignalKey};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// An entry in the reactive context stack.
#[derive(Debug, Clone)]
struct ContextEntry {
    /// The signal whose derivation is running.
    signal_id: SignalId,
    /// Signals read so far, in first-read order.
    dependencies: Vec<SignalKey>,
}

/// Guard that pops the context when dropped.
pub struct ReactiveContext {
    signal_id: SignalId,
}

impl ReactiveContext {
    /// Enter a new reactive context for the given signal.
    ///
    /// The context is exited when the returned guard is dropped.
    pub fn enter(signal_id: SignalId) -> Self {
        CONTEXT_STACK.with(|stack| {
            stack.borrow_mut().push(ContextEntry {
                signal_id,
                dependencies: Vec::new(),
            });
        });

        Self { signal_id }
    }

    /// Check if there is an active reactive context.
    pub fn is_active() -> bool {
        CONTEXT_STACK.with(|stack| !stack.borrow().is_empty())
    }

    /// The signal currently computing on this thread, if any.
    pub fn current() -> Option<SignalId> {
        CONTEXT_STACK.with(|stack| stack.borrow().last().map(|entry| entry.signal_id))
    }

    /// Record a read of the given signal.
    ///
    /// Repeated reads of the same signal are recorded once.
    pub fn track_dependency(key: &SignalKey) {
        CONTEXT_STACK.with(|stack| {
            if let Some(entry) = stack.borrow_mut().last_mut() {
                if !entry.dependencies.iter().any(|dep| dep.id == key.id) {
                    entry.dependencies.push(key.clone());
                }
            }
        });
    }

    /// Take the dependencies collected in this context so far.
    pub fn take_dependencies(&self) -> Vec<SignalKey> {
        CONTEXT_STACK.with(|stack| {
            stack
                .borrow_mut()
                .last_mut()
                .filter(|entry| entry.signal_id == self.signal_id)
                .map(|entry| std::mem::take(&mut entry.dependencies))
                .unwrap_or_default()
        })
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        CONTEXT_STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();

            if let Some(entry) = popped {
                debug_assert_eq!(
                    entry.signal_id, self.signal_id,
                    "ReactiveContext mismatch: expected {:?}, got {:?}",
                    self.signal_id, entry.signal_id
                );
            }
        });
    }
}
