/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Helps manage "interruptable" things across the sync engine and its
//! storage layer. Nothing here is specific to SQL or HTTP; it's just a
//! cooperative way for long-running loops to notice a shutdown request
//! between suspension points.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Something that is interruptable. In practice this will be created on one
/// thread (or async task) but `.interrupt()` may be called from another, so
/// implementations must be `Send + Sync`.
pub trait Interruptable: Send + Sync {
    fn interrupt(&self);
}

/// Represents the state of something that may be interrupted. Decoupled
/// from `Interruptable` so that code which only wants to *check* for
/// interruption doesn't need to know about the interrupt mechanics.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }
}

/// A convenience implementation for tests and one-shot callers that never
/// want to be interrupted.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// The error returned by `err_if_interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the operation was interrupted")]
pub struct Interrupted;

/// A simple, shareable flag-based `Interruptee`/`Interruptable` pair. This is
/// the type `SyncOrchestrator::shutdown()` flips; every suspension point in
/// the pull/push loops and the event channel listener checks it.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
}

impl Interruptable for ShutdownFlag {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Interruptee for ShutdownFlag {
    fn was_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ShutdownFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownFlag")
            .field("interrupted", &self.was_interrupted())
            .finish()
    }
}

lazy_static::lazy_static! {
    static ref REGISTERED: Mutex<Vec<Weak<dyn Interruptable>>> = Mutex::new(Vec::new());
}

/// Register an `Interruptable` so a process-wide `shutdown_all()` reaches it.
/// Mirrors `components/support/shutdown`'s registry, kept here rather than
/// as a separate crate since this workspace has exactly one consumer of it.
pub fn register_interruptable(target: Weak<dyn Interruptable>) {
    REGISTERED.lock().push(target);
}

/// Interrupt every live registered `Interruptable`. Stale (dropped) entries
/// are pruned opportunistically.
pub fn shutdown_all() {
    let mut reg = REGISTERED.lock();
    reg.retain(|weak| {
        if let Some(strong) = weak.upgrade() {
            strong.interrupt();
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_never_interrupts() {
        assert!(!NeverInterrupts.was_interrupted());
        assert!(NeverInterrupts.err_if_interrupted().is_ok());
    }

    #[test]
    fn test_shutdown_flag() {
        let flag = ShutdownFlag::new();
        assert!(!flag.was_interrupted());
        flag.interrupt();
        assert!(flag.was_interrupted());
        assert!(matches!(flag.err_if_interrupted(), Err(Interrupted)));
    }

    #[test]
    fn test_registry_reaches_live_targets() {
        let flag = Arc::new(ShutdownFlag::new());
        register_interruptable(Arc::downgrade(&flag) as Weak<dyn Interruptable>);
        shutdown_all();
        assert!(flag.was_interrupted());
    }
}
