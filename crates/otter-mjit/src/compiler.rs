//! Method compiler: one linear pass from bytecode to machine code.
//!
//! Each operation is classified against what the frame tracker and the type
//! oracle know, then either emitted inline behind guards (with an
//! out-of-line path that calls the generic stub and rejoins) or compiled as a
//! plain stub call. Emission is split by family: `fastops`, `fast_arith` and
//! `elements` each add their `jsop_*` methods to the per-function compiler.

use std::sync::Arc;

use otter_mjit_bytecode::{
    ArgIndex, BytecodeError, ConstantIndex, Function, Instruction, LocalIndex,
};
use otter_mjit_runtime::{Heap, Value};
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::analysis::{self, Analysis};
use crate::assembler::{CodeBuffer, Inst, Label, ValueSource};
use crate::code::{self, CompiledCode, PublishedCode, RejoinSite, absolute};
use crate::config::JitConfig;
use crate::elements::IcSite;
use crate::fast_arith::{ArithOp, CompareOp};
use crate::fastops::{BitOpcode, BranchKind, IncDec, IncTarget, LiteralKind};
use crate::frame::FrameState;
use crate::ic::IcId;
use crate::oracle::{LoopHoister, ObjectKind, TypeFlags, TypeOracle, TypeSet};
use crate::stubcc::StubCompiler;
use crate::stubs::StubKind;

/// Errors produced by the method compiler
///
/// None of these are user-visible failures: the caller keeps interpreting
/// the function.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Jump target is outside the function or has no code
    #[error("invalid jump target at pc {pc}")]
    InvalidJumpTarget { pc: usize },

    /// A jump was never given a target
    #[error("unlinked jump at code offset {offset}")]
    UnlinkedJump { offset: u32 },

    /// An instruction pops more than the stack holds
    #[error("stack underflow at pc {pc}")]
    StackUnderflow { pc: usize },

    /// Two paths reach a pc with different stack depths
    #[error("stack depth mismatch at pc {pc}: expected {expected}, found {found}")]
    StackDepthMismatch { pc: usize, expected: u32, found: u32 },

    /// Compiled code changed the stack differently from the instruction contract
    #[error("stack effect mismatch at pc {pc} ({opcode}): expected {expected}, found {found}")]
    StackEffectMismatch {
        pc: usize,
        opcode: String,
        expected: i64,
        found: i64,
    },

    /// Control falls past the last instruction
    #[error("control falls off the end after pc {pc}")]
    FallsOffEnd { pc: usize },

    /// An operation moved through its compilation states out of order
    #[error("illegal lifecycle transition at pc {pc}: {from:?} -> {to:?}")]
    LifecycleViolation {
        pc: usize,
        from: OpLifecycle,
        to: OpLifecycle,
    },

    /// An exit was linked to sync code emitted for a different frame state
    #[error("stale exit at pc {pc}: {detail}")]
    StaleExit { pc: usize, detail: String },

    /// The frame tracker or register file reached an inconsistent state
    #[error("invariant violation at pc {pc}: {detail}")]
    InvariantViolation { pc: usize, detail: String },

    /// Every register is pinned or a temp
    #[error("register file exhausted at pc {pc}")]
    RegisterExhausted { pc: usize },

    /// A string constant was not interned before compilation
    #[error("string constant at pc {pc} is not interned in the heap")]
    UnlinkedString { pc: usize },

    /// The bytecode itself is malformed
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
}

/// Result type for compilation
pub type JitResult<T> = Result<T, JitError>;

/// Where one operation is in its compilation
///
/// `Unanalyzed -> Classified -> {InlineEmitted | GenericOnly} -> GuardsLinked
/// -> Rejoined`; composite operations go round again from `Rejoined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpLifecycle {
    /// Nothing decided
    Unanalyzed,
    /// Operand facts gathered and a strategy chosen
    Classified,
    /// Guarded inline code emitted
    InlineEmitted,
    /// Only a stub call emitted
    GenericOnly,
    /// Every guard jump has a slow-path target
    GuardsLinked,
    /// Slow paths merged back; the tracker is consistent
    Rejoined,
}

impl OpLifecycle {
    /// Is `self -> next` a legal step
    pub const fn can_advance_to(self, next: OpLifecycle) -> bool {
        use OpLifecycle::*;
        matches!(
            (self, next),
            (Unanalyzed, Classified)
                | (Classified, InlineEmitted)
                | (Classified, GenericOnly)
                | (InlineEmitted, GuardsLinked)
                | (GenericOnly, GuardsLinked)
                | (GuardsLinked, Rejoined)
                | (Rejoined, Classified)
        )
    }
}

/// How an emitter compiled its operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Emitted {
    /// Inline code, possibly with slow paths
    Inline,
    /// A stub call and nothing else
    Generic,
}

impl Emitted {
    fn lifecycle(self) -> OpLifecycle {
        match self {
            Emitted::Inline => OpLifecycle::InlineEmitted,
            Emitted::Generic => OpLifecycle::GenericOnly,
        }
    }
}

/// What a compilation may consult
pub struct CompileEnv<'a> {
    /// Heap the code will run against; string constants must be interned
    pub heap: &'a Heap,
    /// Type facts
    pub oracle: &'a dyn TypeOracle,
    /// Bounds-check hoisting
    pub hoister: &'a mut dyn LoopHoister,
}

/// Method JIT entry point
#[derive(Debug, Clone, Default)]
pub struct JitCompiler {
    config: JitConfig,
}

impl JitCompiler {
    /// Compiler with explicit settings
    pub fn new(config: JitConfig) -> Self {
        Self { config }
    }

    /// Compiler configured from `OTTER_MJIT_*`
    pub fn from_env() -> Self {
        Self::new(JitConfig::from_env())
    }

    /// Settings in use
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compile `function`
    pub fn compile<'a>(&self, function: &'a Function, env: CompileEnv<'a>) -> JitResult<CompiledCode> {
        function.validate()?;
        let analysis = analysis::analyze(function)?;
        tracing::debug!(
            function = function.display_name(),
            instructions = function.instructions.len(),
            generic_only = self.config.generic_only,
            "method compile started"
        );
        let code = Compiler::new(function, env, self.config, analysis).run()?;
        tracing::debug!(
            function = function.display_name(),
            fast_len = code.fast_len,
            slow_len = code.slow_len(),
            ics = code.ics.len(),
            rejoin_sites = code.rejoin_sites.len(),
            "method compile finished"
        );
        Ok(code)
    }

    /// Compile and wrap for execution
    pub fn compile_and_publish<'a>(
        &self,
        function: &'a Function,
        env: CompileEnv<'a>,
    ) -> JitResult<Arc<PublishedCode>> {
        Ok(Arc::new(PublishedCode::new(self.compile(function, env)?)))
    }
}

// ---------------------------------------------------------------------------
// Per-function compiler
// ---------------------------------------------------------------------------

/// State of one compilation
pub(crate) struct Compiler<'a> {
    pub(crate) function: &'a Function,
    pub(crate) heap: &'a Heap,
    pub(crate) oracle: &'a dyn TypeOracle,
    pub(crate) hoister: &'a mut dyn LoopHoister,
    pub(crate) config: JitConfig,
    pub(crate) analysis: Analysis,
    pub(crate) frame: FrameState,
    pub(crate) buf: CodeBuffer,
    pub(crate) stubcc: StubCompiler,
    pub(crate) ics: Vec<IcSite>,
    pub(crate) pc: u32,
    pc_labels: Vec<Option<Label>>,
    lifecycle: OpLifecycle,
}

impl<'a> Compiler<'a> {
    fn new(function: &'a Function, env: CompileEnv<'a>, config: JitConfig, analysis: Analysis) -> Self {
        let nargs = function.param_count as u32;
        let nlocals = function.local_count as u32;
        let base_types: Vec<TypeSet> = (0..function.param_count)
            .map(|i| env.oracle.arg_types(ArgIndex(i)))
            .chain((0..function.local_count).map(|i| env.oracle.local_types(LocalIndex(i))))
            .collect();
        let frame = FrameState::new(nargs, nlocals, base_types, analysis.max_depth);
        Self {
            function,
            heap: env.heap,
            oracle: env.oracle,
            hoister: env.hoister,
            config,
            pc_labels: vec![None; function.instructions.len()],
            analysis,
            frame,
            buf: CodeBuffer::new(),
            stubcc: StubCompiler::new(),
            ics: Vec::new(),
            pc: 0,
            lifecycle: OpLifecycle::Unanalyzed,
        }
    }

    pub(crate) fn invariant(&self, detail: impl Into<String>) -> JitError {
        JitError::InvariantViolation {
            pc: self.pc as usize,
            detail: detail.into(),
        }
    }

    pub(crate) fn generic_only(&self) -> bool {
        self.config.generic_only
    }

    /// Oracle types of the current operation's result
    pub(crate) fn pushed_types(&self) -> TypeSet {
        self.oracle.pushed_types(self.pc)
    }

    /// Absolute target of the jump at `pc`
    pub(crate) fn jump_target_of(&self, pc: usize) -> JitResult<u32> {
        self.function
            .jump_target(pc)
            .map(|t| t as u32)
            .ok_or(JitError::InvalidJumpTarget { pc })
    }

    /// The instruction `offset` ahead, if it may be compiled together with
    /// the current one
    pub(crate) fn fusable(&self, offset: usize) -> Option<Instruction> {
        if self.config.generic_only || self.config.disable_fusion {
            return None;
        }
        let pc = self.pc as usize;
        if (1..=offset).any(|k| self.analysis.is_jump_target(pc + k)) {
            return None;
        }
        self.function.instructions.get(pc + offset).copied()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn advance(&mut self, next: OpLifecycle) -> JitResult<()> {
        if !self.lifecycle.can_advance_to(next) {
            return Err(JitError::LifecycleViolation {
                pc: self.pc as usize,
                from: self.lifecycle,
                to: next,
            });
        }
        self.lifecycle = next;
        Ok(())
    }

    fn finish_step(&mut self, emitted: Emitted) -> JitResult<()> {
        self.advance(emitted.lifecycle())?;
        if self.stubcc.has_pending_exits() {
            return Err(JitError::StaleExit {
                pc: self.pc as usize,
                detail: "guards left without a slow path".into(),
            });
        }
        self.advance(OpLifecycle::GuardsLinked)?;
        self.stubcc.end_op()?;
        self.advance(OpLifecycle::Rejoined)
    }

    /// Close one part of a composite operation and start the next
    pub(crate) fn next_step(&mut self, emitted: Emitted) -> JitResult<()> {
        self.finish_step(emitted)?;
        self.frame.check_clean()?;
        self.advance(OpLifecycle::Classified)
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    fn run(mut self) -> JitResult<CompiledCode> {
        let len = self.function.instructions.len();
        let mut pc = 0usize;
        let mut live = true;
        while pc < len {
            let Some(depth) = self.analysis.depth(pc) else {
                live = false;
                pc += 1;
                continue;
            };
            self.pc = pc as u32;
            self.frame.set_pc(self.pc);
            if self.analysis.is_jump_target(pc) {
                if live {
                    self.frame.sync_and_forget_everything(&mut self.buf.fast)?;
                } else {
                    self.frame.reset_canonical(depth);
                }
            } else if !live {
                self.frame.reset_canonical(depth);
            }
            if self.frame.depth() != depth {
                return Err(JitError::StackDepthMismatch {
                    pc,
                    expected: depth,
                    found: self.frame.depth(),
                });
            }
            self.pc_labels[pc] = Some(self.buf.fast.label());
            let consumed = self.compile_op(pc, depth)?;
            live = !self.function.instructions[pc + consumed - 1].is_terminator();
            pc += consumed;
        }
        if live {
            return Err(JitError::FallsOffEnd { pc: len.saturating_sub(1) });
        }
        self.finish()
    }

    fn compile_op(&mut self, pc: usize, depth: u32) -> JitResult<usize> {
        let instruction = self.function.instructions[pc];
        self.lifecycle = OpLifecycle::Unanalyzed;
        let monitored = self
            .oracle
            .monitored(self.pc)
            .then(|| self.pushed_types().flags.bits());
        self.stubcc.begin_op(self.pc, self.pc + 1, monitored);
        self.advance(OpLifecycle::Classified)?;

        let (emitted, consumed) = self.dispatch(instruction)?;
        self.finish_step(emitted)?;
        self.frame.check_clean()?;

        let expected: i64 = self.function.instructions[pc..pc + consumed]
            .iter()
            .map(|i| i.stack_effect().delta())
            .sum();
        let found = self.frame.depth() as i64 - depth as i64;
        if expected != found {
            return Err(JitError::StackEffectMismatch {
                pc,
                opcode: instruction.opcode().name().to_owned(),
                expected,
                found,
            });
        }
        tracing::trace!(
            pc,
            op = instruction.opcode().name(),
            consumed,
            generic = emitted == Emitted::Generic,
            "compiled op"
        );
        Ok(consumed)
    }

    fn dispatch(&mut self, instruction: Instruction) -> JitResult<(Emitted, usize)> {
        use Instruction as I;

        if self.generic_only()
            && let Some((stub, arg)) = self.generic_stub(&instruction)
        {
            return Ok((self.emit_stub_op(stub, arg)?, 1));
        }

        let emitted = match instruction {
            I::Nop | I::LoopHead => Emitted::Inline,

            I::Undefined => self.push_constant(Value::Undefined),
            I::Null => self.push_constant(Value::Null),
            I::True => self.push_constant(Value::Boolean(true)),
            I::False => self.push_constant(Value::Boolean(false)),
            I::Int32 { value } => self.push_constant(Value::Int32(value)),
            I::Double { idx } => {
                let n = self
                    .function
                    .number_constant(idx)
                    .ok_or_else(|| self.invariant(format!("constant {} is not a number", idx.index())))?;
                self.push_constant(Value::Double(n))
            }
            I::String { idx } => {
                let value = self.string_constant(idx)?;
                self.push_constant(value)
            }

            I::GetLocal { idx } => {
                self.frame.push_local(idx);
                Emitted::Inline
            }
            I::GetArg { idx } => {
                self.frame.push_arg(idx);
                Emitted::Inline
            }
            I::SetLocal { idx } => {
                self.frame.store_local(idx, false, &mut self.buf.fast)?;
                Emitted::Inline
            }
            I::SetArg { idx } => {
                self.frame.store_arg(idx, false, &mut self.buf.fast)?;
                Emitted::Inline
            }

            I::IncLocal { idx } => return self.incdec(IncDec::PreInc, IncTarget::Local(idx)),
            I::DecLocal { idx } => return self.incdec(IncDec::PreDec, IncTarget::Local(idx)),
            I::LocalInc { idx } => return self.incdec(IncDec::PostInc, IncTarget::Local(idx)),
            I::LocalDec { idx } => return self.incdec(IncDec::PostDec, IncTarget::Local(idx)),
            I::IncArg { idx } => return self.incdec(IncDec::PreInc, IncTarget::Arg(idx)),
            I::DecArg { idx } => return self.incdec(IncDec::PreDec, IncTarget::Arg(idx)),
            I::ArgInc { idx } => return self.incdec(IncDec::PostInc, IncTarget::Arg(idx)),
            I::ArgDec { idx } => return self.incdec(IncDec::PostDec, IncTarget::Arg(idx)),

            I::Pop => {
                self.frame.pop();
                Emitted::Inline
            }
            I::Dup => {
                self.frame.dup();
                Emitted::Inline
            }
            I::Swap => {
                self.frame.swap(&mut self.buf.fast)?;
                Emitted::Inline
            }

            I::Add => self.jsop_binary(ArithOp::Add)?,
            I::Sub => self.jsop_binary(ArithOp::Sub)?,
            I::Pos => self.jsop_pos()?,

            I::BitOr => self.jsop_bitop(BitOpcode::Or)?,
            I::BitAnd => self.jsop_bitop(BitOpcode::And)?,
            I::BitXor => self.jsop_bitop(BitOpcode::Xor)?,
            I::Lsh => self.jsop_bitop(BitOpcode::Lsh)?,
            I::Rsh => self.jsop_bitop(BitOpcode::Rsh)?,
            I::Ursh => self.jsop_bitop(BitOpcode::Ursh)?,
            I::BitNot => self.jsop_bitnot()?,

            I::Eq => return self.jsop_compare_maybe_fused(CompareOp::Eq),
            I::Ne => return self.jsop_compare_maybe_fused(CompareOp::Ne),
            I::StrictEq => return self.jsop_compare_maybe_fused(CompareOp::StrictEq),
            I::StrictNe => return self.jsop_compare_maybe_fused(CompareOp::StrictNe),
            I::Lt => return self.jsop_compare_maybe_fused(CompareOp::Lt),
            I::Le => return self.jsop_compare_maybe_fused(CompareOp::Le),
            I::Gt => return self.jsop_compare_maybe_fused(CompareOp::Gt),
            I::Ge => return self.jsop_compare_maybe_fused(CompareOp::Ge),

            I::Not => self.jsop_not()?,
            I::TypeOf => return self.jsop_typeof(),

            I::Goto { .. } => {
                let target = self.jump_target_of(self.pc as usize)?;
                self.frame.sync_all(&mut self.buf.fast);
                let jump = self.buf.fast.jump();
                self.buf.link_pc(jump, target);
                Emitted::Inline
            }
            I::IfEq { .. } => self.jsop_branch(BranchKind::IfEq)?,
            I::IfNe { .. } => self.jsop_branch(BranchKind::IfNe)?,
            I::And { .. } => self.jsop_branch(BranchKind::And)?,
            I::Or { .. } => self.jsop_branch(BranchKind::Or)?,

            I::GetElem => self.jsop_getelem()?,
            I::SetElem => self.jsop_setelem()?,

            I::NewInit => self.jsop_newinit(LiteralKind::Empty)?,
            I::NewObject { template } => self.jsop_newinit(LiteralKind::Object(template))?,
            I::NewArray { count } => self.jsop_newinit(LiteralKind::Array(count))?,
            I::InitProp { name } => self.jsop_initprop(name)?,
            I::InitMethod { name } => self.jsop_init_generic(StubKind::InitMethod, name.index() as i64)?,
            I::InitElem => self.jsop_initelem()?,
            I::EndInit => {
                let top = self.frame.peek(1);
                self.frame.set_init_target(top, None);
                Emitted::Inline
            }

            I::Return => {
                let top = self.frame.peek(1);
                let value = self.frame.value_source(top, &mut self.buf.fast)?;
                self.buf.fast.emit(Inst::Return { value });
                self.frame.unpin_source(value);
                self.frame.pop();
                Emitted::Inline
            }
            I::ReturnUndefined => {
                self.buf.fast.emit(Inst::Return {
                    value: ValueSource::Constant(Value::Undefined.to_raw()),
                });
                Emitted::Inline
            }
        };
        Ok((emitted, 1))
    }

    fn push_constant(&mut self, value: Value) -> Emitted {
        self.frame.push_constant(value);
        Emitted::Inline
    }

    fn string_constant(&self, idx: ConstantIndex) -> JitResult<Value> {
        let text = self
            .function
            .string_constant(idx)
            .ok_or_else(|| self.invariant(format!("constant {} is not a string", idx.index())))?;
        let id = self
            .heap
            .lookup_string(text)
            .ok_or(JitError::UnlinkedString { pc: self.pc as usize })?;
        Ok(Value::String(id))
    }

    // ------------------------------------------------------------------
    // Generic path
    // ------------------------------------------------------------------

    /// Stub and argument compiling `instruction` generically, for ops that
    /// have one and no special stack handling
    fn generic_stub(&self, instruction: &Instruction) -> Option<(StubKind, i64)> {
        use Instruction as I;
        Some(match *instruction {
            I::Add => (StubKind::Add, 0),
            I::Sub => (StubKind::Sub, 0),
            I::Pos => (StubKind::Pos, 0),
            I::BitOr => (StubKind::BitOr, 0),
            I::BitAnd => (StubKind::BitAnd, 0),
            I::BitXor => (StubKind::BitXor, 0),
            I::Lsh => (StubKind::Lsh, 0),
            I::Rsh => (StubKind::Rsh, 0),
            I::Ursh => (StubKind::Ursh, 0),
            I::BitNot => (StubKind::BitNot, 0),
            I::Eq => (StubKind::Eq, 0),
            I::Ne => (StubKind::Ne, 0),
            I::StrictEq => (StubKind::StrictEq, 0),
            I::StrictNe => (StubKind::StrictNe, 0),
            I::Lt => (StubKind::Lt, 0),
            I::Le => (StubKind::Le, 0),
            I::Gt => (StubKind::Gt, 0),
            I::Ge => (StubKind::Ge, 0),
            I::Not => (StubKind::Not, 0),
            I::TypeOf => (StubKind::TypeOf, 0),
            I::GetElem => (StubKind::GetElem, 0),
            I::SetElem => (StubKind::SetElem, 0),
            _ => return None,
        })
    }

    /// Result types of a stub: what the stub can produce, narrowed by the
    /// oracle
    pub(crate) fn stub_result_types(&self, stub: StubKind) -> TypeSet {
        let intrinsic = match stub {
            StubKind::BitOr
            | StubKind::BitAnd
            | StubKind::BitXor
            | StubKind::Lsh
            | StubKind::Rsh
            | StubKind::BitNot => TypeFlags::INT32,
            StubKind::Ursh | StubKind::Pos | StubKind::Sub => TypeFlags::NUMBER,
            StubKind::Not
            | StubKind::ValueToBoolean
            | StubKind::Eq
            | StubKind::Ne
            | StubKind::StrictEq
            | StubKind::StrictNe
            | StubKind::Lt
            | StubKind::Le
            | StubKind::Gt
            | StubKind::Ge => TypeFlags::BOOLEAN,
            StubKind::TypeOf => TypeFlags::STRING,
            StubKind::NewInit | StubKind::NewObject => return TypeSet::objects(ObjectKind::Plain),
            StubKind::NewArray => return TypeSet::objects(ObjectKind::DenseArray),
            StubKind::InitProp | StubKind::InitMethod | StubKind::InitElem => TypeFlags::OBJECT,
            StubKind::Add | StubKind::GetElem | StubKind::SetElem => return self.pushed_types(),
        };
        let pushed = self.pushed_types();
        let flags = pushed.flags & intrinsic;
        if flags.is_empty() {
            TypeSet::of(intrinsic)
        } else {
            TypeSet {
                flags,
                object_kind: pushed.object_kind,
            }
        }
    }

    /// Compile an operation as one inline stub call with everything synced
    pub(crate) fn emit_stub_op(&mut self, stub: StubKind, arg: i64) -> JitResult<Emitted> {
        let result = self.stub_result_types(stub);
        self.emit_stub_op_typed(stub, arg, result)
    }

    /// [`Compiler::emit_stub_op`] with the result types given by the caller
    pub(crate) fn emit_stub_op_typed(&mut self, stub: StubKind, arg: i64, result: TypeSet) -> JitResult<Emitted> {
        self.frame.sync_and_kill(&mut self.buf.fast)?;
        self.stubcc.call_inline(&self.frame, &mut self.buf, stub, arg);
        self.frame.popn(stub.uses());
        for _ in 0..stub.defs() {
            self.frame.push_synced(result);
        }
        self.stubcc.rejoin_inline(&self.frame, &self.buf, stub.defs());
        Ok(Emitted::Generic)
    }

    /// Leave for the slow stream and call `stub` there
    pub(crate) fn slow_call(&mut self, stub: StubKind, arg: i64) -> JitResult<()> {
        self.stubcc.leave(&self.frame, &mut self.buf)?;
        self.stubcc.call(&self.frame, &mut self.buf, stub, arg);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    fn finish(self) -> JitResult<CompiledCode> {
        let Compiler {
            function,
            config,
            analysis,
            frame,
            buf,
            stubcc,
            ics,
            pc_labels,
            ..
        } = self;
        let (insts, fast_len) = code::link(buf, &pc_labels)?;
        let pc_offsets = pc_labels
            .iter()
            .map(|label| label.map(|l| absolute(l, fast_len)))
            .collect();

        let mut rejoin_sites = Vec::new();
        let mut call_sites = FxHashMap::default();
        for call in stubcc.into_calls() {
            let sp_after = call.sp_after.ok_or(JitError::InvariantViolation {
                pc: call.pc as usize,
                detail: "stub call never completed".into(),
            })?;
            let site = RejoinSite {
                pc: call.pc,
                resume_pc: call.resume_pc,
                call: absolute(call.call, fast_len),
                sp: call.sp,
                sp_after,
                changes: call.changes,
                rejoin: call.rejoin.map(|l| absolute(l, fast_len)),
                monitored_types: call.monitored_types,
            };
            call_sites.insert(site.call, rejoin_sites.len());
            rejoin_sites.push(site);
        }

        let mut clasp_guards = FxHashMap::default();
        let mut fast_path_starts = FxHashMap::default();
        let ics: Vec<_> = ics
            .iter()
            .enumerate()
            .map(|(i, site)| {
                let layout = site.layout(fast_len);
                clasp_guards.insert(layout.clasp_guard, IcId(i as u32));
                fast_path_starts.insert(layout.fast_path_start, IcId(i as u32));
                layout
            })
            .collect();

        let nargs = function.param_count as u32;
        let nlocals = function.local_count as u32;
        let frame_size = frame.max_sp().max(nargs + nlocals + analysis.max_depth) + 1;
        Ok(CompiledCode {
            name: function.display_name().to_owned(),
            insts,
            fast_len,
            pc_offsets,
            rejoin_sites,
            ics,
            nargs,
            nlocals,
            frame_size,
            call_sites,
            clasp_guards,
            fast_path_starts,
            ic_max_stubs: config.ic_max_stubs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{NoHoisting, NoTypeInfo};
    use otter_mjit_bytecode::{FunctionBuilder, JumpOffset};

    fn compile(function: &Function, config: JitConfig) -> JitResult<CompiledCode> {
        let mut heap = Heap::new();
        heap.link_function(function);
        let mut hoister = NoHoisting;
        JitCompiler::new(config).compile(
            function,
            CompileEnv {
                heap: &heap,
                oracle: &NoTypeInfo,
                hoister: &mut hoister,
            },
        )
    }

    #[test]
    fn test_lifecycle_transitions() {
        use OpLifecycle::*;
        assert!(Unanalyzed.can_advance_to(Classified));
        assert!(Classified.can_advance_to(GenericOnly));
        assert!(Rejoined.can_advance_to(Classified));
        assert!(!Classified.can_advance_to(Rejoined));
        assert!(!InlineEmitted.can_advance_to(GenericOnly));
        assert!(!Unanalyzed.can_advance_to(InlineEmitted));
    }

    #[test]
    fn test_constants_fold_to_a_return() {
        let function = FunctionBuilder::new()
            .instructions(vec![
                Instruction::Int32 { value: 6 },
                Instruction::Int32 { value: 3 },
                Instruction::BitXor,
                Instruction::Return,
            ])
            .build();
        let code = compile(&function, JitConfig::default()).expect("compiles");
        assert_eq!(code.call_count(), 0);
        assert_eq!(
            code.insts.last(),
            Some(&Inst::Return {
                value: ValueSource::Constant(Value::Int32(5).to_raw())
            })
        );
    }

    #[test]
    fn test_generic_only_calls_every_stub_inline() {
        let function = FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::GetArg { idx: ArgIndex(1) },
                Instruction::Lsh,
                Instruction::Return,
            ])
            .build();
        let code = compile(&function, JitConfig::generic()).expect("compiles");
        assert_eq!(code.call_count(), 1);
        assert_eq!(code.fast_call_count(), 1);
        assert_eq!(code.slow_len(), 0);
        assert_eq!(code.rejoin_sites[0].sp, 4);
        assert_eq!(code.rejoin_sites[0].sp_after, 3);
    }

    #[test]
    fn test_unlinked_string_is_reported() {
        let mut builder = FunctionBuilder::new();
        let idx = builder.string("nowhere");
        let function = builder
            .instructions(vec![Instruction::String { idx }, Instruction::Return])
            .build();
        let heap = Heap::new();
        let mut hoister = NoHoisting;
        let result = JitCompiler::default().compile(
            &function,
            CompileEnv {
                heap: &heap,
                oracle: &NoTypeInfo,
                hoister: &mut hoister,
            },
        );
        assert!(matches!(result, Err(JitError::UnlinkedString { pc: 0 })));
    }

    #[test]
    fn test_pc_map_covers_reachable_code() {
        let function = FunctionBuilder::new()
            .instructions(vec![
                Instruction::Goto { offset: JumpOffset(2) },
                Instruction::Nop,
                Instruction::ReturnUndefined,
            ])
            .build();
        let code = compile(&function, JitConfig::default()).expect("compiles");
        assert!(code.offset_of_pc(0).is_some());
        assert_eq!(code.offset_of_pc(1), None);
        assert_eq!(code.offset_of_pc(2), Some(1));
        assert_eq!(code.insts[0].target(), Some(1));
    }
}
