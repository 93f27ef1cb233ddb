//! Preemption control.
//!
//! RAII-based preemption guards, routed through the embedding kernel's
//! `PreemptControl` collaborator rather than a per-CPU control region WKI
//! would have to own itself.

use core::marker::PhantomData;

use crate::collab;

/// RAII guard that disables preemption while held.
/// !Send/!Sync: must stay on the same CPU context.
#[must_use = "if unused, preemption will be immediately re-enabled"]
pub struct PreemptGuard {
    _marker: PhantomData<*mut ()>,
}

impl PreemptGuard {
    #[inline]
    pub fn new() -> Self {
        if let Some(pc) = collab::preempt_control() {
            pc.disable();
        }
        Self {
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_active() -> bool {
        collab::preempt_control().is_some_and(|pc| pc.is_disabled())
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        if let Some(pc) = collab::preempt_control() {
            pc.enable();
        }
    }
}

/// Combined IRQ-disable + preemption-disable guard.
/// On drop: restore flags, then the preempt guard drops.
#[must_use = "if unused, protection will be immediately released"]
pub struct IrqPreemptGuard {
    saved_flags: u64,
    _preempt: PreemptGuard,
}

impl IrqPreemptGuard {
    #[inline]
    pub fn new() -> Self {
        let saved_flags = match collab::interrupt_control() {
            Some(ic) => ic.save_and_disable(),
            None => 0,
        };
        Self {
            saved_flags,
            _preempt: PreemptGuard::new(),
        }
    }

    #[inline]
    pub fn saved_flags(&self) -> u64 {
        self.saved_flags
    }
}

impl Default for IrqPreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqPreemptGuard {
    #[inline]
    fn drop(&mut self) {
        // Restore flags first. _preempt drops after this body completes,
        // which is correct: any deferred reschedule runs with interrupts
        // enabled.
        if let Some(ic) = collab::interrupt_control() {
            ic.restore(self.saved_flags);
        }
    }
}

#[inline]
pub fn is_preemption_disabled() -> bool {
    PreemptGuard::is_active()
}
