//! Inline paths for bitwise operators, `!`, `typeof`, truthiness branches,
//! increments and literal initializers.
//!
//! Integer operators share one shape: every operand is classified and given
//! its registers first, then converted to int32 behind guards, then
//! combined. Conversions that fail inline retry out of line before giving up
//! to the generic stub:
//!
//! ```text
//!   known double   truncate ──fail──> retry with x ∓ 2^32 ──fail──> stub
//!   unknown tag    int32? ──no──> double? truncate ──fail──> stub
//! ```

use otter_mjit_bytecode::{ArgIndex, ConstantIndex, Instruction, LocalIndex, TemplateIndex};
use otter_mjit_runtime::ops::{self, BitOp};
use otter_mjit_runtime::{JsType, ObjectField, Tag, Value};
use smallvec::SmallVec;

use crate::assembler::{
    AluOp, Cond, DoubleCond, DoubleOp, FrameSlot, Inst, Int32Key, JumpRef, Label, Operand,
    TestCond, UNLINKED,
};
use crate::compiler::{Compiler, Emitted, JitResult};
use crate::fast_arith::ArithOp;
use crate::frame::{InitTarget, KnownType};
use crate::oracle::{TypeFlags, TypeSet};
use crate::regs::{FP_CONVERSION_TEMP, FReg, RETURN_REG, Reg};
use crate::stubs::StubKind;
use crate::type_guards::{self, typeof_known, typeof_tag_test};

const TWO_POW_32: f64 = 4294967296.0;

/// Binary bitwise operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BitOpcode {
    Or,
    And,
    Xor,
    Lsh,
    Rsh,
    Ursh,
}

impl BitOpcode {
    fn stub(self) -> StubKind {
        match self {
            BitOpcode::Or => StubKind::BitOr,
            BitOpcode::And => StubKind::BitAnd,
            BitOpcode::Xor => StubKind::BitXor,
            BitOpcode::Lsh => StubKind::Lsh,
            BitOpcode::Rsh => StubKind::Rsh,
            BitOpcode::Ursh => StubKind::Ursh,
        }
    }

    fn runtime(self) -> BitOp {
        match self {
            BitOpcode::Or => BitOp::Or,
            BitOpcode::And => BitOp::And,
            BitOpcode::Xor => BitOp::Xor,
            BitOpcode::Lsh => BitOp::Lsh,
            BitOpcode::Rsh => BitOp::Rsh,
            BitOpcode::Ursh => BitOp::Ursh,
        }
    }

    fn alu(self) -> AluOp {
        match self {
            BitOpcode::Or => AluOp::Or,
            BitOpcode::And => AluOp::And,
            BitOpcode::Xor => AluOp::Xor,
            BitOpcode::Lsh => AluOp::Shl,
            BitOpcode::Rsh => AluOp::Sar,
            BitOpcode::Ursh => AluOp::Shr,
        }
    }

    fn is_commutative(self) -> bool {
        matches!(self, BitOpcode::Or | BitOpcode::And | BitOpcode::Xor)
    }

    /// `x op 0` is just `ToInt32(x)`
    fn zero_is_identity(self) -> bool {
        matches!(self, BitOpcode::Or | BitOpcode::Xor | BitOpcode::Lsh | BitOpcode::Rsh)
    }
}

/// Conditional jump flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchKind {
    /// Jump if falsy, popping
    IfEq,
    /// Jump if truthy, popping
    IfNe,
    /// Jump if falsy, keeping the value on the taken edge
    And,
    /// Jump if truthy, keeping the value on the taken edge
    Or,
}

impl BranchKind {
    fn jumps_on_truthy(self) -> bool {
        matches!(self, BranchKind::IfNe | BranchKind::Or)
    }

    fn keeps_value(self) -> bool {
        matches!(self, BranchKind::And | BranchKind::Or)
    }
}

/// Increment and decrement forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncDec {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

impl IncDec {
    fn is_post(self) -> bool {
        matches!(self, IncDec::PostInc | IncDec::PostDec)
    }

    fn delta(self) -> i32 {
        match self {
            IncDec::PreInc | IncDec::PostInc => 1,
            IncDec::PreDec | IncDec::PostDec => -1,
        }
    }
}

/// Variable an increment updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IncTarget {
    Local(LocalIndex),
    Arg(ArgIndex),
}

/// Literal opened by `NewInit`, `NewObject` or `NewArray`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiteralKind {
    Empty,
    Object(TemplateIndex),
    Array(u32),
}

/// How an operand becomes an int32 in its register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntPlan {
    /// Nothing to emit
    Ready,
    /// Truncate the number held in a temp FPR
    Truncate(FReg),
    /// Read the tag; int32 payloads pass, doubles are truncated
    Tagged { slot: FrameSlot, payload: Reg },
}

/// Registers pinned for the duration of one operation
pub(crate) type Pins = SmallVec<[Reg; 4]>;

impl Compiler<'_> {
    pub(crate) fn number_constant(&self, slot: FrameSlot) -> Option<f64> {
        self.frame.constant(slot).and_then(|v| v.as_f64())
    }

    /// Can ToInt32 of `slot` be computed without calling out
    fn int_convertible(&self, slot: FrameSlot) -> bool {
        match self.frame.constant(slot) {
            Some(value) => value.is_number(),
            None => matches!(
                self.frame.known_type(slot),
                KnownType::Int32 | KnownType::Double | KnownType::Unknown
            ),
        }
    }

    pub(crate) fn pin(&mut self, reg: Reg, pins: &mut Pins) {
        if self.frame.pin_reg(reg) {
            pins.push(reg);
        }
    }

    pub(crate) fn unpin_all(&mut self, pins: Pins) {
        for reg in pins {
            self.frame.unpin_reg(reg);
        }
    }

    /// Temp that will hold ToInt32 of `slot`, free to be overwritten
    fn int_owned(&mut self, slot: FrameSlot, pins: &mut Pins) -> JitResult<(Reg, IntPlan)> {
        if let Some(n) = self.number_constant(slot) {
            let reg = self.frame.alloc_reg(&mut self.buf.fast)?;
            self.buf.fast.mov(reg, Operand::Imm(i64::from(ops::to_int32(n))));
            return Ok((reg, IntPlan::Ready));
        }
        match self.frame.known_type(slot) {
            KnownType::Int32 => Ok((self.frame.copy_data_into_reg(slot, &mut self.buf.fast)?, IntPlan::Ready)),
            _ => self.int_converted(slot, pins),
        }
    }

    /// Read-only operand holding ToInt32 of `slot`
    fn int_operand(&mut self, slot: FrameSlot, pins: &mut Pins) -> JitResult<(Operand, IntPlan)> {
        if let Some(n) = self.number_constant(slot) {
            return Ok((Operand::Imm(i64::from(ops::to_int32(n))), IntPlan::Ready));
        }
        match self.frame.known_type(slot) {
            KnownType::Int32 => {
                let reg = self.frame.temp_reg_for_data(slot, &mut self.buf.fast)?;
                self.pin(reg, pins);
                Ok((Operand::Reg(reg), IntPlan::Ready))
            }
            _ => {
                let (reg, plan) = self.int_converted(slot, pins)?;
                Ok((Operand::Reg(reg), plan))
            }
        }
    }

    fn int_converted(&mut self, slot: FrameSlot, pins: &mut Pins) -> JitResult<(Reg, IntPlan)> {
        if self.frame.known_type(slot) == KnownType::Double {
            let fpr = self.frame.copy_number_into_fp_reg(slot, &mut self.buf.fast)?;
            let dst = self.frame.alloc_reg(&mut self.buf.fast)?;
            return Ok((dst, IntPlan::Truncate(fpr)));
        }
        let payload = self.frame.temp_reg_for_data(slot, &mut self.buf.fast)?;
        self.pin(payload, pins);
        let dst = self.frame.alloc_reg(&mut self.buf.fast)?;
        Ok((dst, IntPlan::Tagged { slot, payload }))
    }

    /// Emit the conversion of one operand into `dst`
    fn apply_int_plan(&mut self, plan: IntPlan, dst: Reg) -> JitResult<()> {
        match plan {
            IntPlan::Ready => Ok(()),
            IntPlan::Truncate(fpr) => {
                let failed = self.buf.fast.emit_jump(Inst::BranchTruncateDoubleToInt32 {
                    src: fpr,
                    dst,
                    target: UNLINKED,
                });
                let done = self.buf.fast.label();
                self.truncation_retry(failed, fpr, dst, done)
            }
            IntPlan::Tagged { slot, payload } => {
                let tag = self.frame.tag_operand(slot)?;
                let not_int = type_guards::branch_tag_is_not(&mut self.buf.fast, tag, Tag::Int32);
                self.buf.fast.mov(dst, Operand::Reg(payload));
                let done = self.buf.fast.label();

                let start = self.buf.slow.label();
                self.buf.link(not_int, start);
                let not_double = type_guards::branch_tag_is_not(&mut self.buf.slow, tag, Tag::Double);
                self.buf.slow.emit(Inst::MoveBitsToDouble {
                    dst: FP_CONVERSION_TEMP,
                    src: payload,
                });
                let failed = self.buf.slow.emit_jump(Inst::BranchTruncateDoubleToInt32 {
                    src: FP_CONVERSION_TEMP,
                    dst,
                    target: UNLINKED,
                });
                let back = self.buf.slow.jump();
                self.stubcc.link_exit(not_double, &self.frame)?;
                self.stubcc.link_exit(failed, &self.frame)?;
                self.stubcc.cross_jump(back, done, &mut self.buf);
                Ok(())
            }
        }
    }

    /// Out-of-line retry for doubles outside int32 range: move the value
    /// 2^32 toward zero and keep it only if the result is an exact int32
    fn truncation_retry(&mut self, failed: JumpRef, fpr: FReg, dst: Reg, done: Label) -> JitResult<()> {
        let start = self.buf.slow.label();
        let slow = &mut self.buf.slow;
        slow.emit(Inst::ZeroDouble { dst: FP_CONVERSION_TEMP });
        let negative = slow.branch_double(DoubleCond::LessThan, fpr, FP_CONVERSION_TEMP);
        slow.emit(Inst::MoveDoubleImm {
            dst: FP_CONVERSION_TEMP,
            value: -TWO_POW_32,
        });
        let adjust = slow.jump();
        let below_zero = slow.label();
        slow.emit(Inst::MoveDoubleImm {
            dst: FP_CONVERSION_TEMP,
            value: TWO_POW_32,
        });
        let add = slow.label();
        slow.emit(Inst::AluDouble {
            op: DoubleOp::Add,
            dst: fpr,
            src: FP_CONVERSION_TEMP,
        });
        let inexact = slow.emit_jump(Inst::BranchConvertDoubleToInt32 {
            src: fpr,
            dst,
            target: UNLINKED,
        });
        let back = slow.jump();

        self.buf.link(failed, start);
        self.buf.link(negative, below_zero);
        self.buf.link(adjust, add);
        self.stubcc.link_exit(inexact, &self.frame)?;
        self.stubcc.cross_jump(back, done, &mut self.buf);
        Ok(())
    }

    fn release_int_operand(&mut self, operand: Operand, plan: IntPlan) -> JitResult<()> {
        if let IntPlan::Truncate(fpr) = plan {
            self.frame.free_fp_reg(fpr)?;
        }
        match (operand, plan) {
            (_, IntPlan::Ready) => Ok(()),
            (Operand::Reg(reg), _) => self.frame.free_reg(reg),
            _ => Err(self.invariant("converted operand without a register")),
        }
    }

    // ------------------------------------------------------------------
    // Bitwise operators
    // ------------------------------------------------------------------

    pub(crate) fn jsop_bitop(&mut self, op: BitOpcode) -> JitResult<Emitted> {
        let stub = op.stub();
        let (mut lhs, mut rhs) = (self.frame.peek(2), self.frame.peek(1));

        if let (Some(a), Some(b)) = (self.number_constant(lhs), self.number_constant(rhs)) {
            let folded = op.runtime().apply(ops::to_int32(a), ops::to_int32(b));
            self.frame.popn(2);
            self.frame.push_constant(folded);
            return Ok(Emitted::Inline);
        }
        if !self.int_convertible(lhs) || !self.int_convertible(rhs) {
            return self.emit_stub_op(stub, 0);
        }
        let shift = self.number_constant(rhs).map(|n| ops::to_int32(n) & 31);
        if op == BitOpcode::Ursh && shift == Some(0) {
            // x >>> 0 may not fit an int32.
            return self.emit_stub_op(stub, 0);
        }
        if op.is_commutative() && self.frame.constant(lhs).is_some() {
            std::mem::swap(&mut lhs, &mut rhs);
        }
        let shared = self.frame.constant(rhs).is_none() && self.frame.have_same_backing(lhs, rhs);
        let int_result =
            op != BitOpcode::Ursh || shift.is_some() || self.pushed_types().known_type() == KnownType::Int32;

        let mut pins = Pins::new();
        let (res, lhs_plan) = self.int_owned(lhs, &mut pins)?;
        let (rhs_op, rhs_plan) = if shared {
            (Operand::Reg(res), IntPlan::Ready)
        } else {
            self.int_operand(rhs, &mut pins)?
        };
        let double_result = if int_result {
            None
        } else {
            Some(self.frame.alloc_fp_reg(&mut self.buf.fast)?)
        };

        self.apply_int_plan(lhs_plan, res)?;
        if let Operand::Reg(dst) = rhs_op
            && !shared
        {
            self.apply_int_plan(rhs_plan, dst)?;
        }
        if !(rhs_op == Operand::Imm(0) && op.zero_is_identity()) {
            self.buf.fast.alu32(op.alu(), res, rhs_op);
        }
        if op == BitOpcode::Ursh && shift.is_none() {
            match double_result {
                Some(fpr) => self.buf.fast.emit(Inst::ConvertUint32ToDouble { dst: fpr, src: res }),
                None => {
                    let negative = self.buf.fast.branch32(Cond::LessThan, Operand::Reg(res), Operand::Imm(0));
                    self.stubcc.link_exit(negative, &self.frame)?;
                }
            }
        }

        let slow = self.stubcc.has_pending_exits();
        if slow {
            self.slow_call(stub, 0)?;
        }
        if !shared {
            self.release_int_operand(rhs_op, rhs_plan)?;
        }
        if let IntPlan::Truncate(fpr) = lhs_plan {
            self.frame.free_fp_reg(fpr)?;
        }
        self.unpin_all(pins);
        self.frame.popn(2);
        match double_result {
            Some(fpr) => {
                self.frame.free_reg(res)?;
                self.frame.push_double(fpr)?;
            }
            None => {
                self.frame.push_typed_payload(KnownType::Int32, res)?;
            }
        }
        if slow {
            self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        }
        Ok(Emitted::Inline)
    }

    pub(crate) fn jsop_bitnot(&mut self) -> JitResult<Emitted> {
        let x = self.frame.peek(1);
        if let Some(n) = self.number_constant(x) {
            self.frame.pop();
            self.frame.push_constant(Value::Int32(!ops::to_int32(n)));
            return Ok(Emitted::Inline);
        }
        if !self.int_convertible(x) {
            return self.emit_stub_op(StubKind::BitNot, 0);
        }

        let mut pins = Pins::new();
        let (res, plan) = self.int_owned(x, &mut pins)?;
        self.apply_int_plan(plan, res)?;
        self.buf.fast.emit(Inst::Not32 { dst: res });

        let slow = self.stubcc.has_pending_exits();
        if slow {
            self.slow_call(StubKind::BitNot, 0)?;
        }
        if let IntPlan::Truncate(fpr) = plan {
            self.frame.free_fp_reg(fpr)?;
        }
        self.unpin_all(pins);
        self.frame.pop();
        self.frame.push_typed_payload(KnownType::Int32, res)?;
        if slow {
            self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        }
        Ok(Emitted::Inline)
    }

    // ------------------------------------------------------------------
    // !
    // ------------------------------------------------------------------

    pub(crate) fn jsop_not(&mut self) -> JitResult<Emitted> {
        let x = self.frame.peek(1);
        if let Some(value) = self.frame.constant(x)
            && let Ok(truthy) = ops::to_boolean(self.heap, value)
        {
            self.frame.pop();
            self.frame.push_constant(Value::Boolean(!truthy));
            return Ok(Emitted::Inline);
        }

        let res = match self.frame.known_type(x) {
            KnownType::Boolean => {
                let res = self.frame.copy_data_into_reg(x, &mut self.buf.fast)?;
                self.buf.fast.alu32(AluOp::Xor, res, Operand::Imm(1));
                res
            }
            KnownType::Int32 => {
                let mut pins = Pins::new();
                let src = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
                self.pin(src, &mut pins);
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                self.buf.fast.emit(Inst::Set32 {
                    cond: Cond::Equal,
                    lhs: src,
                    rhs: Operand::Imm(0),
                    dst: res,
                });
                self.unpin_all(pins);
                res
            }
            KnownType::Double => {
                let src = self.frame.temp_fp_reg_for_data(x, &mut self.buf.fast)?;
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                self.buf.fast.emit(Inst::ZeroDouble { dst: FP_CONVERSION_TEMP });
                self.buf.fast.emit(Inst::SetDouble {
                    cond: DoubleCond::EqualOrUnordered,
                    lhs: src,
                    rhs: FP_CONVERSION_TEMP,
                    dst: res,
                });
                res
            }
            KnownType::Object => {
                self.frame.pop();
                self.frame.push_constant(Value::Boolean(false));
                return Ok(Emitted::Inline);
            }
            KnownType::Unknown => return self.not_unknown(x),
            KnownType::String | KnownType::Null | KnownType::Undefined => {
                return self.emit_stub_op(StubKind::Not, 0);
            }
        };
        self.frame.pop();
        self.frame.push_typed_payload(KnownType::Boolean, res)?;
        Ok(Emitted::Inline)
    }

    /// `!x` for a value of unknown type: booleans inline, int32 and objects
    /// out of line, everything else through the stub
    fn not_unknown(&mut self, x: FrameSlot) -> JitResult<Emitted> {
        let mut pins = Pins::new();
        let payload = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
        self.pin(payload, &mut pins);
        let res = self.frame.alloc_reg(&mut self.buf.fast)?;
        let tag = self.frame.tag_operand(x)?;

        let not_bool = type_guards::branch_tag_is_not(&mut self.buf.fast, tag, Tag::Boolean);
        self.buf.fast.mov(res, Operand::Reg(payload));
        self.buf.fast.alu32(AluOp::Xor, res, Operand::Imm(1));
        let done = self.buf.fast.label();

        let int_case = self.buf.slow.label();
        self.buf.link(not_bool, int_case);
        let not_int = type_guards::branch_tag_is_not(&mut self.buf.slow, tag, Tag::Int32);
        self.buf.slow.emit(Inst::Set32 {
            cond: Cond::Equal,
            lhs: payload,
            rhs: Operand::Imm(0),
            dst: res,
        });
        let int_back = self.buf.slow.jump();
        let object_case = self.buf.slow.label();
        self.buf.link(not_int, object_case);
        let not_object = type_guards::branch_tag_is_not(&mut self.buf.slow, tag, Tag::Object);
        self.buf.slow.mov(res, Operand::Imm(0));
        let object_back = self.buf.slow.jump();
        self.stubcc.cross_jump(int_back, done, &mut self.buf);
        self.stubcc.cross_jump(object_back, done, &mut self.buf);
        self.stubcc.link_exit(not_object, &self.frame)?;

        self.slow_call(StubKind::Not, 0)?;
        self.unpin_all(pins);
        self.frame.pop();
        self.frame.push_typed_payload(KnownType::Boolean, res)?;
        self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        Ok(Emitted::Inline)
    }

    // ------------------------------------------------------------------
    // typeof
    // ------------------------------------------------------------------

    /// `typeof x`, fused with a following `== "name"` and branch when the
    /// answer is a single tag test
    pub(crate) fn jsop_typeof(&mut self) -> JitResult<(Emitted, usize)> {
        let x = self.frame.peek(1);
        let known = self.frame.known_type(x);

        if let (Some(Instruction::String { idx }), Some(cmp)) = (self.fusable(1), self.fusable(2))
            && let Some(negate) = typeof_comparison(cmp)
            && let Some(named) = self.function.string_constant(idx).and_then(JsType::from_name)
        {
            if let Some(actual) = typeof_known(known) {
                self.stubcc.set_resume_pc(self.pc + 3);
                self.frame.pop();
                self.frame.push_constant(Value::Boolean((actual == named) != negate));
                return Ok((Emitted::Inline, 3));
            }
            if known == KnownType::Unknown
                && let Some((cond, tag)) = typeof_tag_test(named)
            {
                let holds = if negate { cond.invert() } else { cond };
                if let Some(branch @ (Instruction::IfEq { .. } | Instruction::IfNe { .. })) = self.fusable(3) {
                    let target = self.jump_target_of(self.pc as usize + 3)?;
                    let cond = if matches!(branch, Instruction::IfNe { .. }) {
                        holds
                    } else {
                        holds.invert()
                    };
                    self.stubcc.set_resume_pc(self.pc + 4);
                    let tag_op = self.frame.tag_operand(x)?;
                    self.frame.pop();
                    self.frame.sync_for_branch(&mut self.buf.fast);
                    let jump = self.buf.fast.branch32(cond, tag_op, Operand::tag(tag));
                    self.buf.link_pc(jump, target);
                    return Ok((Emitted::Inline, 4));
                }

                self.stubcc.set_resume_pc(self.pc + 3);
                let mut pins = Pins::new();
                let tag_reg = self.frame.temp_reg_for_type(x, &mut self.buf.fast)?;
                self.pin(tag_reg, &mut pins);
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                self.buf.fast.emit(Inst::Set32 {
                    cond: holds,
                    lhs: tag_reg,
                    rhs: Operand::tag(tag),
                    dst: res,
                });
                self.unpin_all(pins);
                self.frame.pop();
                self.frame.push_typed_payload(KnownType::Boolean, res)?;
                return Ok((Emitted::Inline, 3));
            }
        }

        if let Some(actual) = typeof_known(known) {
            self.frame.pop();
            self.frame.push_constant(Value::String(self.heap.type_name(actual)));
            return Ok((Emitted::Inline, 1));
        }
        Ok((self.emit_stub_op(StubKind::TypeOf, 0)?, 1))
    }

    // ------------------------------------------------------------------
    // Truthiness branches
    // ------------------------------------------------------------------

    pub(crate) fn jsop_branch(&mut self, kind: BranchKind) -> JitResult<Emitted> {
        let target = self.jump_target_of(self.pc as usize)?;
        let on_truthy = kind.jumps_on_truthy();
        if self.generic_only() {
            return self.branch_generic(on_truthy, target);
        }

        let x = self.frame.peek(1);
        let known = self.frame.known_type(x);
        let folded = match self.frame.constant(x) {
            Some(value) => ops::to_boolean(self.heap, value).ok(),
            None => match known {
                KnownType::Null | KnownType::Undefined => Some(false),
                KnownType::Object => Some(true),
                _ => None,
            },
        };
        if let Some(truthy) = folded {
            if !kind.keeps_value() {
                self.frame.pop();
            }
            if truthy == on_truthy {
                self.frame.sync_all(&mut self.buf.fast);
                let jump = self.buf.fast.jump();
                self.buf.link_pc(jump, target);
            }
            if kind.keeps_value() {
                self.frame.pop();
            }
            return Ok(Emitted::Inline);
        }

        let cond = if on_truthy { TestCond::NonZero } else { TestCond::Zero };
        match known {
            KnownType::Boolean | KnownType::Int32 => {
                let reg = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
                self.frame.sync_for_branch(&mut self.buf.fast);
                let mask = if known == KnownType::Boolean { 1 } else { 0xFFFF_FFFF };
                let jump = self.buf.fast.branch_test32(cond, reg, Operand::Imm(mask));
                self.buf.link_pc(jump, target);
                self.frame.pop();
            }
            KnownType::Double => {
                let fpr = self.frame.temp_fp_reg_for_data(x, &mut self.buf.fast)?;
                self.frame.sync_for_branch(&mut self.buf.fast);
                self.buf.fast.emit(Inst::ZeroDouble { dst: FP_CONVERSION_TEMP });
                // NaN is falsy.
                let dcond = if on_truthy {
                    DoubleCond::NotEqual
                } else {
                    DoubleCond::EqualOrUnordered
                };
                let jump = self.buf.fast.branch_double(dcond, fpr, FP_CONVERSION_TEMP);
                self.buf.link_pc(jump, target);
                self.frame.pop();
            }
            KnownType::Unknown => self.branch_unknown(x, cond, target)?,
            _ => return self.branch_generic(on_truthy, target),
        }
        Ok(Emitted::Inline)
    }

    /// Boolean inline; int32 and the stub out of line. The slow paths jump
    /// to the target themselves, so the fall-through forgets every register
    /// they may have clobbered.
    fn branch_unknown(&mut self, x: FrameSlot, cond: TestCond, target: u32) -> JitResult<()> {
        let payload = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
        let tag = self.frame.tag_operand(x)?;
        self.frame.sync_for_branch(&mut self.buf.fast);

        let not_bool = type_guards::branch_tag_is_not(&mut self.buf.fast, tag, Tag::Boolean);
        let taken = self.buf.fast.branch_test32(cond, payload, Operand::Imm(1));
        self.buf.link_pc(taken, target);

        let int_case = self.buf.slow.label();
        self.buf.link(not_bool, int_case);
        let not_int = type_guards::branch_tag_is_not(&mut self.buf.slow, tag, Tag::Int32);
        let taken = self.buf.slow.branch_test32(cond, payload, Operand::Imm(0xFFFF_FFFF));
        self.buf.link_pc(taken, target);
        let int_fall = self.buf.slow.jump();

        let call = self.buf.slow.label();
        self.buf.link(not_int, call);
        self.stubcc.call(&self.frame, &mut self.buf, StubKind::ValueToBoolean, 0);
        let taken = self.buf.slow.branch_test32(cond, RETURN_REG, Operand::Imm(1));
        self.buf.link_pc(taken, target);
        let call_fall = self.buf.slow.jump();

        self.frame.pop();
        self.frame.sync_and_forget_everything(&mut self.buf.fast)?;
        self.stubcc.link_rejoin(int_fall, &mut self.buf);
        self.stubcc.link_rejoin(call_fall, &mut self.buf);
        self.stubcc.rejoin_at_branch(self.frame.sp(), 0);
        Ok(())
    }

    fn branch_generic(&mut self, on_truthy: bool, target: u32) -> JitResult<Emitted> {
        self.frame.sync_and_kill(&mut self.buf.fast)?;
        self.stubcc
            .call_inline(&self.frame, &mut self.buf, StubKind::ValueToBoolean, 0);
        let cond = if on_truthy { TestCond::NonZero } else { TestCond::Zero };
        let jump = self.buf.fast.branch_test32(cond, RETURN_REG, Operand::Imm(1));
        self.buf.link_pc(jump, target);
        self.frame.pop();
        self.stubcc.rejoin_inline(&self.frame, &self.buf, 0);
        Ok(Emitted::Generic)
    }

    // ------------------------------------------------------------------
    // Increment and decrement
    // ------------------------------------------------------------------

    /// `++x` and friends, composed from the arithmetic operators. A
    /// following `Pop` is absorbed: the postfix value is then never needed.
    pub(crate) fn incdec(&mut self, kind: IncDec, target: IncTarget) -> JitResult<(Emitted, usize)> {
        let popped = matches!(self.fusable(1), Some(Instruction::Pop));
        if popped {
            self.stubcc.set_resume_pc(self.pc + 2);
        }
        match target {
            IncTarget::Local(idx) => self.frame.push_local(idx),
            IncTarget::Arg(idx) => self.frame.push_arg(idx),
        };

        if kind.is_post() && !popped {
            let emitted = self.jsop_pos()?;
            self.next_step(emitted)?;
            self.frame.dup();
            self.frame.push_constant(Value::Int32(kind.delta()));
            let emitted = self.binary_op(ArithOp::Add, TypeSet::of(TypeFlags::NUMBER))?;
            self.next_step(emitted)?;
            self.store_incdec(target, false)?;
            self.frame.pop();
            return Ok((Emitted::Inline, 1));
        }

        // x - (-1) instead of x + 1: subtraction never concatenates.
        self.frame.push_constant(Value::Int32(-kind.delta()));
        let result = self.stub_result_types(StubKind::Sub);
        let emitted = self.binary_op(ArithOp::Sub, result)?;
        self.next_step(emitted)?;
        self.store_incdec(target, popped)?;
        Ok((Emitted::Inline, if popped { 2 } else { 1 }))
    }

    fn store_incdec(&mut self, target: IncTarget, popped: bool) -> JitResult<()> {
        match target {
            IncTarget::Local(idx) => self.frame.store_local(idx, popped, &mut self.buf.fast),
            IncTarget::Arg(idx) => self.frame.store_arg(idx, popped, &mut self.buf.fast),
        }
    }

    // ------------------------------------------------------------------
    // Literals
    // ------------------------------------------------------------------

    pub(crate) fn jsop_newinit(&mut self, kind: LiteralKind) -> JitResult<Emitted> {
        let (stub, arg, init) = match kind {
            LiteralKind::Empty => (StubKind::NewInit, 0, InitTarget::Empty),
            LiteralKind::Object(template) => (
                StubKind::NewObject,
                i64::from(template.index()),
                InitTarget::Object(template),
            ),
            LiteralKind::Array(length) => (StubKind::NewArray, i64::from(length), InitTarget::Array { length }),
        };
        let emitted = self.emit_stub_op(stub, arg)?;
        let top = self.frame.peek(1);
        self.frame.set_init_target(top, Some(init));
        Ok(emitted)
    }

    pub(crate) fn jsop_initprop(&mut self, name: ConstantIndex) -> JitResult<Emitted> {
        let (obj, value) = (self.frame.peek(2), self.frame.peek(1));
        let slot = match self.frame.init_target(obj) {
            Some(InitTarget::Object(template)) if !self.generic_only() => {
                self.function.template(template).and_then(|t| t.slot_of(name))
            }
            _ => None,
        };
        let Some(slot) = slot else {
            return self.jsop_init_generic(StubKind::InitProp, i64::from(name.index()));
        };

        let mut pins = Pins::new();
        let obj_reg = self.frame.temp_reg_for_data(obj, &mut self.buf.fast)?;
        self.pin(obj_reg, &mut pins);
        let source = self.frame.value_source(value, &mut self.buf.fast)?;
        self.buf.fast.emit(Inst::StoreNamedSlot {
            obj: obj_reg,
            slot,
            value: source,
        });
        self.frame.unpin_source(source);
        self.unpin_all(pins);
        self.frame.pop();
        Ok(Emitted::Inline)
    }

    /// Initializer through its stub; the object stays on the stack with
    /// its literal facts
    pub(crate) fn jsop_init_generic(&mut self, stub: StubKind, arg: i64) -> JitResult<Emitted> {
        self.frame.sync_and_kill(&mut self.buf.fast)?;
        self.stubcc.call_inline(&self.frame, &mut self.buf, stub, arg);
        self.frame.popn(stub.uses() - 1);
        self.stubcc.rejoin_inline(&self.frame, &self.buf, 1);
        Ok(Emitted::Generic)
    }

    pub(crate) fn jsop_initelem(&mut self) -> JitResult<Emitted> {
        let (obj, key, value) = (self.frame.peek(3), self.frame.peek(2), self.frame.peek(1));
        let is_last = matches!(
            self.function.instructions.get(self.pc as usize + 1),
            Some(Instruction::EndInit)
        );
        let index = match (self.frame.init_target(obj), self.frame.int32_constant(key)) {
            (Some(InitTarget::Array { length }), Some(i)) if i >= 0 && (i as u32) < length && !self.generic_only() => i,
            _ => return self.jsop_init_generic(StubKind::InitElem, i64::from(is_last)),
        };

        let mut pins = Pins::new();
        let obj_reg = self.frame.temp_reg_for_data(obj, &mut self.buf.fast)?;
        self.pin(obj_reg, &mut pins);
        let source = self.frame.value_source(value, &mut self.buf.fast)?;
        self.buf.fast.emit(Inst::StoreElement {
            obj: obj_reg,
            key: Int32Key::Constant(index),
            value: source,
        });
        // An earlier initializer may already have pushed the length past us.
        let covered = self.buf.fast.emit_jump(Inst::BranchArrayExtent {
            field: ObjectField::InitializedLength,
            obj: obj_reg,
            key: Int32Key::Constant(index),
            cond: Cond::Above,
            target: UNLINKED,
        });
        self.buf.fast.emit(Inst::StoreObjField {
            obj: obj_reg,
            field: ObjectField::InitializedLength,
            src: Operand::Imm(i64::from(index) + 1),
        });
        let done = self.buf.fast.label();
        self.buf.link(covered, done);
        self.frame.unpin_source(source);
        self.unpin_all(pins);
        self.frame.popn(2);
        Ok(Emitted::Inline)
    }
}

/// Whether a comparison following `typeof x, "name"` negates
fn typeof_comparison(instruction: Instruction) -> Option<bool> {
    match instruction {
        Instruction::Eq | Instruction::StrictEq => Some(false),
        Instruction::Ne | Instruction::StrictNe => Some(true),
        _ => None,
    }
}
