//! Out-of-line path management.
//!
//! Guards in the fast stream jump to the slow stream, which syncs the frame,
//! calls a stub and merges back. The stub compiler tracks the pieces of that
//! round trip for the operation being compiled:
//!
//! ```text
//!   fast:  guard ──────────────┐            ┌──> rejoin label
//!                              v            │
//!   slow:  exit label: sync; call stub; merge reloads; jmp
//! ```
//!
//! Exits either link straight to a sync label ([`StubCompiler::sync_exit`],
//! [`StubCompiler::link_exit_direct`]) or are deferred until the call is
//! emitted ([`StubCompiler::link_exit`], [`StubCompiler::leave`]). Both check
//! that the tracker generation the sync code was emitted for is still
//! current.

use smallvec::SmallVec;

use crate::assembler::{CodeBuffer, Inst, JumpRef, Label};
use crate::compiler::{JitError, JitResult};
use crate::frame::FrameState;
use crate::ic::IcId;
use crate::regs::RegMask;
use crate::stubs::StubKind;

/// A slow-stream label whose sync code matches one tracker generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitLabel {
    /// Start of the sync code
    pub label: Label,
    generation: u64,
}

/// A stub call awaiting finalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingCall {
    pub pc: u32,
    pub resume_pc: u32,
    pub call: Label,
    pub sp: u32,
    pub sp_after: Option<u32>,
    pub changes: u32,
    pub rejoin: Option<Label>,
    pub monitored_types: Option<u8>,
}

/// Slow-path bookkeeping for one compilation
#[derive(Debug, Default)]
pub struct StubCompiler {
    exits: SmallVec<[JumpRef; 4]>,
    exit_generation: Option<u64>,
    calls: Vec<PendingCall>,
    op_calls: usize,
    pc: u32,
    resume_pc: u32,
    monitored_types: Option<u8>,
}

impl StubCompiler {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Start compiling the operation at `pc`
    pub fn begin_op(&mut self, pc: u32, resume_pc: u32, monitored_types: Option<u8>) {
        self.pc = pc;
        self.resume_pc = resume_pc;
        self.monitored_types = monitored_types;
        self.op_calls = self.calls.len();
    }

    /// Where the interpreter continues after the current operation
    pub fn set_resume_pc(&mut self, resume_pc: u32) {
        self.resume_pc = resume_pc;
    }

    fn stale(&self, detail: &str) -> JitError {
        JitError::StaleExit {
            pc: self.pc as usize,
            detail: detail.to_owned(),
        }
    }

    // ------------------------------------------------------------------
    // Exits
    // ------------------------------------------------------------------

    /// Defer `jump` until [`StubCompiler::leave`]
    pub fn link_exit(&mut self, jump: JumpRef, frame: &FrameState) -> JitResult<()> {
        match self.exit_generation {
            Some(generation) if generation != frame.generation() => {
                return Err(self.stale("deferred exits taken at different generations"));
            }
            _ => self.exit_generation = Some(frame.generation()),
        }
        self.exits.push(jump);
        Ok(())
    }

    /// Are deferred exits waiting for a call
    pub fn has_pending_exits(&self) -> bool {
        !self.exits.is_empty()
    }

    /// Bind every deferred exit to a new slow-stream label and sync there
    pub fn leave(&mut self, frame: &FrameState, buf: &mut CodeBuffer) -> JitResult<Label> {
        if let Some(generation) = self.exit_generation
            && generation != frame.generation()
        {
            return Err(self.stale("the frame changed between a guard and its exit"));
        }
        let label = buf.slow.label();
        let exits = std::mem::take(&mut self.exits);
        buf.link_all(exits, label);
        self.exit_generation = None;
        frame.sync_to(&mut buf.slow);
        Ok(label)
    }

    /// A slow-stream label that syncs the current state
    pub fn sync_exit(&self, frame: &FrameState, buf: &mut CodeBuffer) -> ExitLabel {
        let label = buf.slow.label();
        frame.sync_to(&mut buf.slow);
        ExitLabel {
            label,
            generation: frame.generation(),
        }
    }

    /// Link `jump` to a sync label emitted earlier
    pub fn link_exit_direct(
        &self,
        jump: JumpRef,
        exit: ExitLabel,
        frame: &FrameState,
        buf: &mut CodeBuffer,
    ) -> JitResult<()> {
        if exit.generation != frame.generation() {
            return Err(self.stale("sync label emitted for an older frame state"));
        }
        buf.link(jump, exit.label);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn record_call(&mut self, call: Label, sp: u32) {
        self.calls.push(PendingCall {
            pc: self.pc,
            resume_pc: self.resume_pc,
            call,
            sp,
            sp_after: None,
            changes: 0,
            rejoin: None,
            monitored_types: self.monitored_types,
        });
    }

    /// Out-of-line stub call at the current stack pointer
    pub fn call(&mut self, frame: &FrameState, buf: &mut CodeBuffer, stub: StubKind, arg: i64) -> Label {
        let label = buf.slow.label();
        let sp = frame.sp();
        buf.slow.emit(Inst::CallStub { stub, sp, arg });
        self.record_call(label, sp);
        tracing::trace!(pc = self.pc, %stub, sp, "out-of-line stub call");
        label
    }

    /// Out-of-line IC stub call
    pub fn call_ic(&mut self, frame: &FrameState, buf: &mut CodeBuffer, ic: IcId, preserve: RegMask) -> Label {
        let label = buf.slow.label();
        let sp = frame.sp();
        buf.slow.emit(Inst::CallIcStub { ic, sp, preserve });
        self.record_call(label, sp);
        label
    }

    /// Inline stub call; the frame must already be synced and killed
    pub fn call_inline(&mut self, frame: &FrameState, buf: &mut CodeBuffer, stub: StubKind, arg: i64) -> Label {
        let label = buf.fast.label();
        let sp = frame.sp();
        buf.fast.emit(Inst::CallStub { stub, sp, arg });
        self.record_call(label, sp);
        label
    }

    fn complete(&mut self, sp_after: u32, changes: u32, rejoin: Option<Label>) {
        for call in &mut self.calls[self.op_calls..] {
            if call.sp_after.is_none() {
                call.sp_after = Some(sp_after);
                call.changes = changes;
                call.rejoin = rejoin;
            }
        }
    }

    // ------------------------------------------------------------------
    // Merging back
    // ------------------------------------------------------------------

    /// Merge the slow path into the fast stream at its current position
    ///
    /// Reloads every register binding of the post-operation state and jumps
    /// back; completes the operation's pending calls.
    pub fn rejoin(&mut self, frame: &FrameState, buf: &mut CodeBuffer, changes: u32) -> JitResult<()> {
        if self.has_pending_exits() {
            return Err(self.stale("rejoining with exits that never reached a call"));
        }
        let target = buf.fast.label();
        frame.merge_to(&mut buf.slow);
        let back = buf.slow.jump();
        buf.link(back, target);
        self.complete(frame.sp(), changes, Some(target));
        Ok(())
    }

    /// Complete an inline call; execution simply continues after it
    pub fn rejoin_inline(&mut self, frame: &FrameState, buf: &CodeBuffer, changes: u32) {
        let target = buf.fast.label();
        self.complete(frame.sp(), changes, Some(target));
    }

    /// Complete calls whose slow path branches to bytecode successors
    pub fn rejoin_at_branch(&mut self, sp_after: u32, changes: u32) {
        self.complete(sp_after, changes, None);
    }

    /// Jump from the slow stream back to the fast stream's current
    /// position, with no reloads
    pub fn link_rejoin(&mut self, jump: JumpRef, buf: &mut CodeBuffer) {
        let target = buf.fast.label();
        buf.link(jump, target);
    }

    /// Jump from the slow stream to a fast label
    pub fn cross_jump(&mut self, jump: JumpRef, label: Label, buf: &mut CodeBuffer) {
        buf.link(jump, label);
    }

    /// Check that the operation left nothing dangling
    pub fn end_op(&mut self) -> JitResult<()> {
        if self.has_pending_exits() {
            return Err(self.stale("guards never linked to a call"));
        }
        if self.calls[self.op_calls..].iter().any(|c| c.sp_after.is_none()) {
            return Err(JitError::InvariantViolation {
                pc: self.pc as usize,
                detail: "stub call without a rejoin".into(),
            });
        }
        Ok(())
    }

    pub(crate) fn into_calls(self) -> Vec<PendingCall> {
        self.calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Cond, Operand};
    use crate::oracle::TypeSet;
    use otter_mjit_runtime::Value;

    fn frame() -> FrameState {
        FrameState::new(1, 0, vec![TypeSet::unknown()], 4)
    }

    #[test]
    fn test_deferred_exits_join_at_leave() {
        let mut frame = frame();
        let mut buf = CodeBuffer::new();
        let mut stubcc = StubCompiler::new();
        stubcc.begin_op(0, 1, None);
        frame.push_constant(Value::Int32(1));
        let j = buf.fast.branch32(Cond::Equal, Operand::Tag(crate::assembler::FrameSlot(0)), Operand::Imm(0));
        stubcc.link_exit(j, &frame).expect("link");
        assert!(stubcc.has_pending_exits());
        let label = stubcc.leave(&frame, &mut buf).expect("leave");
        assert_eq!(label, Label { stream: crate::assembler::Stream::Slow, offset: 0 });
        // The constant on the stack is stored by the sync.
        assert_eq!(buf.slow.len(), 1);
        stubcc.call(&frame, &mut buf, StubKind::Pos, 0);
        stubcc.rejoin(&frame, &mut buf, 1).expect("rejoin");
        stubcc.end_op().expect("clean");
        let calls = stubcc.into_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].sp, 2);
        assert_eq!(calls[0].sp_after, Some(2));
    }

    #[test]
    fn test_stale_direct_exit_is_rejected() {
        let mut frame = frame();
        let mut buf = CodeBuffer::new();
        let stubcc = StubCompiler::new();
        let exit = stubcc.sync_exit(&frame, &mut buf);
        frame.push_constant(Value::Null);
        let j = buf.fast.jump();
        assert!(matches!(
            stubcc.link_exit_direct(j, exit, &frame, &mut buf),
            Err(JitError::StaleExit { .. })
        ));
    }

    #[test]
    fn test_unjoined_call_is_an_error() {
        let frame = frame();
        let mut buf = CodeBuffer::new();
        let mut stubcc = StubCompiler::new();
        stubcc.begin_op(3, 4, None);
        stubcc.call(&frame, &mut buf, StubKind::Not, 0);
        assert!(stubcc.end_op().is_err());
        stubcc.rejoin_at_branch(frame.sp(), 0);
        stubcc.end_op().expect("completed");
    }
}
