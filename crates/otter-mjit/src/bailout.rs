//! Leaving compiled code for the interpreter.
//!
//! Compiled code never fails on its own: a guard that does not hold takes the
//! slow path, and the slow path calls a generic stub. Two things can still
//! send execution back to the interpreter:
//!
//! - a stub raises an error (the generic operation throws), or
//! - a stub at a monitored site produces a value the oracle did not promise.
//!
//! Memory is fully synced at every stub call, so the frame decoded at that
//! point is exactly the interpreter's view of the stack.
//!
//! # Bailout flow
//!
//! ```text
//! executor:
//!   CallStub
//!     ├─ Ok(word), result type promised → continue in compiled code
//!     ├─ Ok(word), result type not promised → Bailout(TypeBarrier)
//!     └─ Err(e) → Bailout(StubFailure)
//!
//! caller:
//!   match tracker.record(reason)
//!     Continue       → resume the interpreter at state.pc
//!     Recompile      → drop the code, recompile with fresh type facts
//!     PermanentDeopt → never compile this function again
//! ```

use otter_mjit_runtime::{RuntimeError, Value};

/// Number of bailouts before a function is deoptimized for good
pub const DEOPT_THRESHOLD: u32 = 10;

/// Why compiled code handed control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutReason {
    /// A generic operation raised an error
    StubFailure,
    /// A monitored site produced a type outside its promised set
    TypeBarrier,
}

/// Interpreter view of the frame at the point of the bailout
#[derive(Debug, Clone, PartialEq)]
pub struct BailoutState {
    /// Why
    pub reason: BailoutReason,
    /// Bytecode pc the interpreter resumes at
    ///
    /// For a stub failure this is the failing operation; for a type barrier
    /// the operation has completed and this is its successor.
    pub pc: u32,
    /// Operand stack depth, counting args and locals
    pub sp: u32,
    /// Decoded slots `0..sp`: args, then locals, then the operand stack
    pub frame: Vec<Value>,
    /// The stub's error, for stub failures
    pub error: Option<RuntimeError>,
}

impl BailoutState {
    /// The operand stack above args and locals
    pub fn stack(&self, nfixed: u32) -> &[Value] {
        self.frame.get(nfixed as usize..).unwrap_or(&[])
    }
}

/// What the caller should do about a bailout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BailoutAction {
    /// Keep the code and interpret this one activation
    Continue,
    /// Discard the code; type facts are stale
    Recompile,
    /// Discard the code and stop compiling the function
    PermanentDeopt,
}

/// Per-function bailout bookkeeping
#[derive(Debug, Clone)]
pub struct BailoutTracker {
    threshold: u32,
    count: u32,
    deoptimized: bool,
}

impl Default for BailoutTracker {
    fn default() -> Self {
        Self::new(DEOPT_THRESHOLD)
    }
}

impl BailoutTracker {
    /// Tracker deoptimizing after `threshold` bailouts
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
            deoptimized: false,
        }
    }

    /// Bailouts seen so far
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Has the function been given up on
    pub fn is_deoptimized(&self) -> bool {
        self.deoptimized
    }

    /// Count one bailout
    pub fn record(&mut self, reason: BailoutReason) -> BailoutAction {
        if self.deoptimized {
            return BailoutAction::PermanentDeopt;
        }
        self.count = self.count.saturating_add(1);
        let action = if self.count >= self.threshold {
            self.deoptimized = true;
            BailoutAction::PermanentDeopt
        } else if reason == BailoutReason::TypeBarrier {
            BailoutAction::Recompile
        } else {
            BailoutAction::Continue
        };
        tracing::debug!(?reason, count = self.count, ?action, "bailout recorded");
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_deoptimizes() {
        let mut tracker = BailoutTracker::new(3);
        assert_eq!(tracker.record(BailoutReason::StubFailure), BailoutAction::Continue);
        assert_eq!(tracker.record(BailoutReason::StubFailure), BailoutAction::Continue);
        assert_eq!(tracker.record(BailoutReason::StubFailure), BailoutAction::PermanentDeopt);
        assert!(tracker.is_deoptimized());
        assert_eq!(tracker.record(BailoutReason::TypeBarrier), BailoutAction::PermanentDeopt);
        assert_eq!(tracker.count(), 3);
    }

    #[test]
    fn test_type_barrier_asks_for_recompile() {
        let mut tracker = BailoutTracker::default();
        assert_eq!(tracker.record(BailoutReason::TypeBarrier), BailoutAction::Recompile);
        assert!(!tracker.is_deoptimized());
    }

    #[test]
    fn test_stack_view_skips_fixed_slots() {
        let state = BailoutState {
            reason: BailoutReason::StubFailure,
            pc: 4,
            sp: 3,
            frame: vec![Value::Int32(1), Value::Undefined, Value::Null],
            error: None,
        };
        assert_eq!(state.stack(2), &[Value::Null]);
        assert!(state.stack(5).is_empty());
    }
}
