//! Finalized compiled code and its published, patchable form.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::assembler::{CodeBuffer, CodeOffset, Inst, Label, LinkTarget, Stream, UNLINKED};
use crate::compiler::{JitError, JitResult};
use crate::ic::{AttachOutcome, ElementStub, IcId, IcLayout, IcPatchState};

/// A stub call the executor can re-enter the interpreter from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RejoinSite {
    /// Bytecode pc of the operation making the call
    pub pc: u32,
    /// Bytecode pc execution continues at after the operation
    pub resume_pc: u32,
    /// Absolute offset of the call instruction
    pub call: CodeOffset,
    /// Stack pointer at the call
    pub sp: u32,
    /// Stack pointer once the operation completes
    pub sp_after: u32,
    /// Stack slots the operation rewrote
    pub changes: u32,
    /// Fast-stream offset the slow path merges back to; `None` when the
    /// slow path branches to bytecode successors instead
    pub rejoin: Option<CodeOffset>,
    /// Result types the oracle promised, when the site is monitored
    pub monitored_types: Option<u8>,
}

impl RejoinSite {
    /// May a result observed here continue in compiled code, or must a
    /// mismatch resume in the interpreter
    pub fn reenters_compiled_code(&self) -> bool {
        self.monitored_types.is_none()
    }
}

/// Finalized code for one function
#[derive(Debug, Clone)]
pub struct CompiledCode {
    /// Function name
    pub name: String,
    /// Fast stream followed by slow stream
    pub insts: Vec<Inst>,
    /// Length of the fast stream
    pub fast_len: u32,
    /// Fast-path offset of each bytecode pc; `None` for unreachable pcs
    pub pc_offsets: Vec<Option<CodeOffset>>,
    /// Rejoin sites, in emission order
    pub rejoin_sites: Vec<RejoinSite>,
    /// IC layouts, indexed by [`IcId`]
    pub ics: Vec<IcLayout>,
    /// Argument slots
    pub nargs: u32,
    /// Local slots
    pub nlocals: u32,
    /// Slots a frame needs: args, locals and the deepest stack
    pub frame_size: u32,
    /// Rejoin site of each call instruction
    pub call_sites: FxHashMap<CodeOffset, usize>,
    /// IC whose class guard sits at an offset
    pub clasp_guards: FxHashMap<CodeOffset, IcId>,
    /// IC whose inline path starts at an offset
    pub fast_path_starts: FxHashMap<CodeOffset, IcId>,
    /// Specializations an IC may attach before going megamorphic
    pub ic_max_stubs: u32,
}

#[derive(Serialize)]
struct CodeLayout<'a> {
    name: &'a str,
    fast_len: u32,
    slow_len: u32,
    pc_offsets: &'a [Option<CodeOffset>],
    rejoin_sites: &'a [RejoinSite],
    ics: &'a [IcLayout],
    insts: &'a [Inst],
}

impl CompiledCode {
    /// Length of the slow stream
    pub fn slow_len(&self) -> u32 {
        self.insts.len() as u32 - self.fast_len
    }

    /// Entry point of the fast path for `pc`
    pub fn offset_of_pc(&self, pc: u32) -> Option<CodeOffset> {
        self.pc_offsets.get(pc as usize).copied().flatten()
    }

    /// Number of stub calls, inline or out of line
    pub fn call_count(&self) -> usize {
        self.insts.iter().filter(|i| i.is_call()).count()
    }

    /// Number of stub calls in the fast stream
    pub fn fast_call_count(&self) -> usize {
        self.insts[..self.fast_len as usize]
            .iter()
            .filter(|i| i.is_call())
            .count()
    }

    /// Layout as JSON, for tooling and debugging
    pub fn layout_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&CodeLayout {
            name: &self.name,
            fast_len: self.fast_len,
            slow_len: self.slow_len(),
            pc_offsets: &self.pc_offsets,
            rejoin_sites: &self.rejoin_sites,
            ics: &self.ics,
            insts: &self.insts,
        })
    }
}

/// Absolute offset of a label once the slow stream is appended
pub fn absolute(label: Label, fast_len: u32) -> CodeOffset {
    match label.stream {
        Stream::Fast => label.offset,
        Stream::Slow => fast_len + label.offset,
    }
}

/// Concatenate both streams and resolve every link
pub fn link(buf: CodeBuffer, pc_labels: &[Option<Label>]) -> JitResult<(Vec<Inst>, u32)> {
    let fast_len = buf.fast.len();
    let mut insts: Vec<Inst> = buf.fast.insts().to_vec();
    insts.extend_from_slice(buf.slow.insts());

    for &(jump, target) in buf.links() {
        let resolved = match target {
            LinkTarget::Label(label) => absolute(label, fast_len),
            LinkTarget::Pc(pc) => pc_labels
                .get(pc as usize)
                .copied()
                .flatten()
                .map(|label| absolute(label, fast_len))
                .ok_or(JitError::InvalidJumpTarget { pc: pc as usize })?,
        };
        let at = absolute(
            Label {
                stream: jump.stream,
                offset: jump.index,
            },
            fast_len,
        );
        let slot = insts
            .get_mut(at as usize)
            .and_then(Inst::target_mut)
            .ok_or(JitError::UnlinkedJump { offset: at })?;
        *slot = resolved;
    }

    if let Some(at) = insts.iter().position(|i| i.target() == Some(UNLINKED)) {
        return Err(JitError::UnlinkedJump { offset: at as u32 });
    }
    Ok((insts, fast_len))
}

/// Compiled code shared with executors, plus its IC patch state
#[derive(Debug)]
pub struct PublishedCode {
    code: Arc<CompiledCode>,
    ic_states: RwLock<Vec<IcPatchState>>,
}

impl PublishedCode {
    /// Publish freshly compiled code
    pub fn new(code: CompiledCode) -> Self {
        let ic_states = RwLock::new(vec![IcPatchState::default(); code.ics.len()]);
        Self {
            code: Arc::new(code),
            ic_states,
        }
    }

    /// The code
    pub fn code(&self) -> &Arc<CompiledCode> {
        &self.code
    }

    /// Snapshot of an IC's patch state
    pub fn ic_state(&self, ic: IcId) -> Option<IcPatchState> {
        self.ic_states.read().get(ic.0 as usize).cloned()
    }

    /// Attach a specialization to an IC
    ///
    /// Specializations only read own elements and slots, so they stay valid
    /// when the array prototype changes.
    pub fn attach(&self, ic: IcId, stub: ElementStub) -> Option<AttachOutcome> {
        let mut states = self.ic_states.write();
        let state = states.get_mut(ic.0 as usize)?;
        let outcome = state.attach(stub, self.code.ic_max_stubs);
        match outcome {
            AttachOutcome::Attached => {
                tracing::debug!(
                    function = %self.code.name,
                    ic = ic.0,
                    ?stub,
                    version = state.version,
                    state = ?state.state(),
                    "attached IC stub"
                );
            }
            AttachOutcome::WentMegamorphic => {
                tracing::info!(
                    function = %self.code.name,
                    ic = ic.0,
                    pc = self.code.ics[ic.0 as usize].pc,
                    "IC went megamorphic"
                );
            }
            AttachOutcome::AlreadyAttached | AttachOutcome::Megamorphic => {}
        }
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{Cond, Operand};
    use crate::regs::Reg;

    #[test]
    fn test_link_resolves_both_streams() {
        let mut buf = CodeBuffer::new();
        let to_slow = buf.fast.branch32(Cond::Equal, Operand::Reg(Reg(0)), Operand::Imm(0));
        buf.fast.mov(Reg(1), Operand::Imm(1));
        let back_label = buf.fast.label();
        let slow_label = buf.slow.label();
        buf.slow.mov(Reg(1), Operand::Imm(2));
        let back = buf.slow.jump();
        buf.link(to_slow, slow_label);
        buf.link(back, back_label);

        let (insts, fast_len) = link(buf, &[]).expect("links");
        assert_eq!(fast_len, 2);
        assert_eq!(insts[0].target(), Some(2));
        assert_eq!(insts[3].target(), Some(2));
    }

    #[test]
    fn test_unlinked_jump_is_an_error() {
        let mut buf = CodeBuffer::new();
        let _ = buf.fast.jump();
        assert!(matches!(link(buf, &[]), Err(JitError::UnlinkedJump { offset: 0 })));
    }

    #[test]
    fn test_pc_link_needs_a_label() {
        let mut buf = CodeBuffer::new();
        let j = buf.fast.jump();
        buf.link_pc(j, 3);
        assert!(matches!(link(buf, &[None; 4]), Err(JitError::InvalidJumpTarget { pc: 3 })));
    }
}
