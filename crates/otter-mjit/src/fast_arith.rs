//! Inline paths for `+`, `-`, unary `+` and the comparison operators.
//!
//! Arithmetic has two inline shapes. When both operands may be int32 the
//! operation runs on payloads behind tag guards and an overflow check; when
//! either side is known to be a number that may not be int32 both sides are
//! loaded as doubles. Anything else calls the stub.
//!
//! Comparisons feeding straight into `ifeq`/`ifne` are fused: no boolean is
//! materialized, the guarded compare jumps to the branch target, and the slow
//! path branches on the stub's return register.

use otter_mjit_bytecode::Instruction;
use otter_mjit_runtime::ops;
use otter_mjit_runtime::{Tag, Value};
use smallvec::SmallVec;

use crate::assembler::{
    AluOp, CheckedOp, Cond, DoubleCond, DoubleOp, FrameSlot, Inst, Operand, TestCond,
};
use crate::compiler::{Compiler, Emitted, JitResult};
use crate::fastops::Pins;
use crate::frame::KnownType;
use crate::oracle::{TypeFlags, TypeSet};
use crate::regs::{FP_CONVERSION_TEMP, FReg, RETURN_REG, Reg};
use crate::stubs::StubKind;
use crate::type_guards::{self, Guard};

/// Additive operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
}

impl ArithOp {
    fn stub(self) -> StubKind {
        match self {
            ArithOp::Add => StubKind::Add,
            ArithOp::Sub => StubKind::Sub,
        }
    }

    fn checked(self) -> CheckedOp {
        match self {
            ArithOp::Add => CheckedOp::Add,
            ArithOp::Sub => CheckedOp::Sub,
        }
    }

    fn double(self) -> DoubleOp {
        match self {
            ArithOp::Add => DoubleOp::Add,
            ArithOp::Sub => DoubleOp::Sub,
        }
    }

    fn fold(self, a: f64, b: f64) -> Value {
        Value::number(match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
        })
    }
}

/// Equality and relational operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn stub(self) -> StubKind {
        match self {
            CompareOp::Eq => StubKind::Eq,
            CompareOp::Ne => StubKind::Ne,
            CompareOp::StrictEq => StubKind::StrictEq,
            CompareOp::StrictNe => StubKind::StrictNe,
            CompareOp::Lt => StubKind::Lt,
            CompareOp::Le => StubKind::Le,
            CompareOp::Gt => StubKind::Gt,
            CompareOp::Ge => StubKind::Ge,
        }
    }

    fn is_equality(self) -> bool {
        matches!(
            self,
            CompareOp::Eq | CompareOp::Ne | CompareOp::StrictEq | CompareOp::StrictNe
        )
    }

    fn is_strict(self) -> bool {
        matches!(self, CompareOp::StrictEq | CompareOp::StrictNe)
    }

    /// `!=` and `!==`
    fn is_negated(self) -> bool {
        matches!(self, CompareOp::Ne | CompareOp::StrictNe)
    }

    fn cond(self) -> Cond {
        match self {
            CompareOp::Eq | CompareOp::StrictEq => Cond::Equal,
            CompareOp::Ne | CompareOp::StrictNe => Cond::NotEqual,
            CompareOp::Lt => Cond::LessThan,
            CompareOp::Le => Cond::LessThanOrEqual,
            CompareOp::Gt => Cond::GreaterThan,
            CompareOp::Ge => Cond::GreaterThanOrEqual,
        }
    }

    /// NaN compares unequal to everything, itself included
    fn double_cond(self) -> DoubleCond {
        match self {
            CompareOp::Eq | CompareOp::StrictEq => DoubleCond::Equal,
            CompareOp::Ne | CompareOp::StrictNe => DoubleCond::NotEqualOrUnordered,
            CompareOp::Lt => DoubleCond::LessThan,
            CompareOp::Le => DoubleCond::LessThanOrEqual,
            CompareOp::Gt => DoubleCond::GreaterThan,
            CompareOp::Ge => DoubleCond::GreaterThanOrEqual,
        }
    }

    /// Result for two constants, when it needs no conversions
    fn fold(self, a: Value, b: Value) -> Option<bool> {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return Some(match self {
                CompareOp::Eq | CompareOp::StrictEq => x == y,
                CompareOp::Ne | CompareOp::StrictNe => x != y,
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
                CompareOp::Gt => x > y,
                CompareOp::Ge => x >= y,
            });
        }
        if !self.is_equality() {
            return None;
        }
        let equal = if self.is_strict() {
            ops::strict_equals(a, b)
        } else {
            match (a, b) {
                (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
                (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
                _ if a.tag() == b.tag() => ops::strict_equals(a, b),
                _ => return None,
            }
        };
        Some(equal != self.is_negated())
    }
}

/// Branch a comparison is fused with
#[derive(Debug, Clone, Copy)]
struct FusedBranch {
    target: u32,
    /// Jump when the comparison is true (`ifne`) or false (`ifeq`)
    on_true: bool,
}

/// Operands of a guarded compare, in registers
#[derive(Debug, Clone, Copy)]
enum CmpOperands {
    Int { lhs: Reg, rhs: Operand },
    Double { lhs: FReg, rhs: FReg },
}

/// Double temps a compare owns until it finishes
type FpTemps = SmallVec<[FReg; 2]>;

fn is_numeric_or_unknown(ty: KnownType) -> bool {
    ty.is_number() || ty == KnownType::Unknown
}

impl Compiler<'_> {
    pub(crate) fn link_guard(&mut self, guard: Guard) -> JitResult<()> {
        match guard {
            Guard::Exit(jump) => self.stubcc.link_exit(jump, &self.frame),
            Guard::Proven => Ok(()),
            Guard::Refuted => Err(self.invariant("operand classified for a guard it cannot pass")),
        }
    }

    // ------------------------------------------------------------------
    // + and -
    // ------------------------------------------------------------------

    pub(crate) fn jsop_binary(&mut self, op: ArithOp) -> JitResult<Emitted> {
        let types = self.stub_result_types(op.stub());
        self.binary_op(op, types)
    }

    /// `lhs op rhs` on the top two entries, pushing a result of `types`
    pub(crate) fn binary_op(&mut self, op: ArithOp, types: TypeSet) -> JitResult<Emitted> {
        let (lhs, rhs) = (self.frame.peek(2), self.frame.peek(1));
        if let (Some(a), Some(b)) = (self.number_constant(lhs), self.number_constant(rhs)) {
            self.frame.popn(2);
            self.frame.push_constant(op.fold(a, b));
            return Ok(Emitted::Inline);
        }

        let (lt, rt) = (self.frame.known_type(lhs), self.frame.known_type(rhs));
        let numeric = is_numeric_or_unknown(lt) && is_numeric_or_unknown(rt);
        let result = types.known_type();
        if !numeric || result.is_non_number() {
            return self.emit_stub_op_typed(op.stub(), 0, types);
        }
        if lt == KnownType::Double || rt == KnownType::Double {
            // With an unknown operand `+` may concatenate, and the slow
            // path's result would not fit the double the fast path pushes.
            let untyped = lt == KnownType::Unknown || rt == KnownType::Unknown;
            if op == ArithOp::Add && untyped && !result.is_number() {
                return self.emit_stub_op_typed(op.stub(), 0, types);
            }
            self.binary_double(op, lhs, rhs)
        } else {
            self.binary_int(op, lhs, rhs, types)
        }
    }

    fn binary_double(&mut self, op: ArithOp, lhs: FrameSlot, rhs: FrameSlot) -> JitResult<Emitted> {
        let res = self.frame.copy_number_into_fp_reg(lhs, &mut self.buf.fast)?;
        let src = self.frame.copy_number_into_fp_reg(rhs, &mut self.buf.fast)?;

        for slot in [lhs, rhs] {
            let guard = type_guards::guard_number(&self.frame, slot, &mut self.buf.fast)?;
            self.link_guard(guard)?;
        }
        self.buf.fast.emit(Inst::AluDouble {
            op: op.double(),
            dst: res,
            src,
        });

        let slow = self.stubcc.has_pending_exits();
        if slow {
            self.slow_call(op.stub(), 0)?;
        }
        self.frame.free_fp_reg(src)?;
        self.frame.popn(2);
        self.frame.push_double(res)?;
        if slow {
            self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        }
        Ok(Emitted::Inline)
    }

    fn binary_int(&mut self, op: ArithOp, lhs: FrameSlot, rhs: FrameSlot, types: TypeSet) -> JitResult<Emitted> {
        let mut pins = Pins::new();
        let res = self.frame.copy_data_into_reg(lhs, &mut self.buf.fast)?;
        let src = match self.frame.int32_constant(rhs) {
            Some(i) => Operand::Imm(i64::from(i)),
            None => {
                let reg = self.frame.temp_reg_for_data(rhs, &mut self.buf.fast)?;
                self.pin(reg, &mut pins);
                Operand::Reg(reg)
            }
        };
        let result = types.known_type();
        let double_result = match result {
            KnownType::Double => Some(self.frame.alloc_fp_reg(&mut self.buf.fast)?),
            _ => None,
        };
        let tag = match result {
            KnownType::Unknown => Some(self.frame.alloc_reg(&mut self.buf.fast)?),
            _ => None,
        };

        for slot in [lhs, rhs] {
            let guard = type_guards::guard_tag(&self.frame, slot, Tag::Int32, &mut self.buf.fast)?;
            self.link_guard(guard)?;
        }
        let overflow = self.buf.fast.branch_alu32(op.checked(), res, src);
        self.stubcc.link_exit(overflow, &self.frame)?;
        if let Some(fpr) = double_result {
            self.buf.fast.emit(Inst::ConvertInt32ToDouble { dst: fpr, src: res });
        }
        if let Some(tag) = tag {
            self.buf.fast.mov(tag, Operand::tag(Tag::Int32));
        }

        self.slow_call(op.stub(), 0)?;
        self.unpin_all(pins);
        self.frame.popn(2);
        match (double_result, tag) {
            (Some(fpr), _) => {
                self.frame.free_reg(res)?;
                self.frame.push_double(fpr)?;
            }
            (None, Some(tag)) => {
                self.frame.push_regs(tag, res, types)?;
            }
            (None, None) => {
                self.frame.push_typed_payload(KnownType::Int32, res)?;
            }
        }
        self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        Ok(Emitted::Inline)
    }

    // ------------------------------------------------------------------
    // Unary +
    // ------------------------------------------------------------------

    pub(crate) fn jsop_pos(&mut self) -> JitResult<Emitted> {
        let x = self.frame.peek(1);
        if let Some(value) = self.frame.constant(x) {
            if value.is_number() {
                return Ok(Emitted::Inline);
            }
            if let Ok(n) = ops::pos(self.heap, value) {
                self.frame.pop();
                self.frame.push_constant(n);
                return Ok(Emitted::Inline);
            }
        }
        match self.frame.known_type(x) {
            ty if ty.is_number() => Ok(Emitted::Inline),
            KnownType::Unknown => {
                // The stub rewrites the slot in place, so the slot's own
                // memory must hold the value on both paths.
                self.frame.sync_entry(x, &mut self.buf.fast);
                let guard = type_guards::guard_number(&self.frame, x, &mut self.buf.fast)?;
                self.link_guard(guard)?;
                self.slow_call(StubKind::Pos, 0)?;
                self.frame.pop();
                self.frame.push_synced(TypeSet::of(TypeFlags::NUMBER));
                self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
                Ok(Emitted::Inline)
            }
            _ => self.emit_stub_op(StubKind::Pos, 0),
        }
    }

    // ------------------------------------------------------------------
    // Comparisons
    // ------------------------------------------------------------------

    /// Compare the top two entries; returns how many instructions were
    /// consumed (2 when fused with the following branch)
    pub(crate) fn jsop_compare_maybe_fused(&mut self, op: CompareOp) -> JitResult<(Emitted, usize)> {
        let (lhs, rhs) = (self.frame.peek(2), self.frame.peek(1));
        let fused = match self.fusable(1) {
            Some(branch @ (Instruction::IfEq { .. } | Instruction::IfNe { .. })) => Some(FusedBranch {
                target: self.jump_target_of(self.pc as usize + 1)?,
                on_true: matches!(branch, Instruction::IfNe { .. }),
            }),
            _ => None,
        };

        if let (Some(a), Some(b)) = (self.frame.constant(lhs), self.frame.constant(rhs))
            && let Some(result) = op.fold(a, b)
        {
            return self.push_compare_constant(result);
        }
        if op.is_equality()
            && let Some(emitted) = self.compare_nullish(op, lhs, rhs, fused)?
        {
            return Ok(emitted);
        }
        if op.is_strict()
            && let Some(emitted) = self.compare_strict_boolean(op, lhs, rhs)?
        {
            return Ok(emitted);
        }
        if self.frame.constant(rhs).is_none() && self.frame.have_same_backing(lhs, rhs) {
            return self.compare_same_backing(op, lhs);
        }

        let (lt, rt) = (self.frame.known_type(lhs), self.frame.known_type(rhs));
        if op.is_strict() && lt != rt && lt.is_non_number() && rt != KnownType::Unknown {
            return self.push_compare_constant(op.is_negated());
        }
        if op.is_strict() && rt.is_non_number() && lt != rt && lt != KnownType::Unknown {
            return self.push_compare_constant(op.is_negated());
        }

        let identity = op.is_equality()
            && lt == rt
            && matches!(lt, KnownType::Object | KnownType::Boolean);
        if identity {
            return self.compare_int(op, lhs, rhs, fused);
        }
        if is_numeric_or_unknown(lt) && is_numeric_or_unknown(rt) {
            if lt == KnownType::Double || rt == KnownType::Double {
                return self.compare_double(op, lhs, rhs, fused);
            }
            return self.compare_int(op, lhs, rhs, fused);
        }
        Ok((self.emit_stub_op(op.stub(), 0)?, 1))
    }

    fn push_compare_constant(&mut self, result: bool) -> JitResult<(Emitted, usize)> {
        self.frame.popn(2);
        self.frame.push_constant(Value::Boolean(result));
        Ok((Emitted::Inline, 1))
    }

    /// `x == null` and friends: a tag test, or a constant when the type of
    /// `x` is known
    fn compare_nullish(
        &mut self,
        op: CompareOp,
        lhs: FrameSlot,
        rhs: FrameSlot,
        fused: Option<FusedBranch>,
    ) -> JitResult<Option<(Emitted, usize)>> {
        let (nullish, x) = match (self.frame.constant(lhs), self.frame.constant(rhs)) {
            (_, Some(v @ (Value::Null | Value::Undefined))) => (v, lhs),
            (Some(v @ (Value::Null | Value::Undefined)), _) => (v, rhs),
            _ => return Ok(None),
        };
        let negated = op.is_negated();
        let known = self.frame.known_type(x);
        if known != KnownType::Unknown {
            let equal = if op.is_strict() {
                known.tag() == Some(nullish.tag())
            } else {
                matches!(known, KnownType::Null | KnownType::Undefined)
            };
            return self.push_compare_constant(equal != negated).map(Some);
        }

        let tags: SmallVec<[Tag; 2]> = if op.is_strict() {
            SmallVec::from_slice(&[nullish.tag()])
        } else {
            SmallVec::from_slice(&[Tag::Null, Tag::Undefined])
        };

        if let Some(branch) = fused {
            let tag_op = self.frame.tag_operand(x)?;
            self.frame.popn(2);
            self.frame.sync_for_branch(&mut self.buf.fast);
            // Jump when the tag is one of `tags` iff that is the taken outcome.
            if branch.on_true != negated {
                for &tag in &tags {
                    let jump = type_guards::branch_tag_is(&mut self.buf.fast, tag_op, tag);
                    self.buf.link_pc(jump, branch.target);
                }
            } else {
                let (&last, rest) = tags
                    .split_last()
                    .ok_or_else(|| self.invariant("nullish test without tags"))?;
                let mut skips = SmallVec::<[_; 2]>::new();
                for &tag in rest {
                    skips.push(type_guards::branch_tag_is(&mut self.buf.fast, tag_op, tag));
                }
                let jump = type_guards::branch_tag_is_not(&mut self.buf.fast, tag_op, last);
                self.buf.link_pc(jump, branch.target);
                let fall = self.buf.fast.label();
                self.buf.link_all(skips, fall);
            }
            return Ok(Some((Emitted::Inline, 2)));
        }

        let mut pins = Pins::new();
        let tag_reg = self.frame.temp_reg_for_type(x, &mut self.buf.fast)?;
        self.pin(tag_reg, &mut pins);
        let res = self.frame.alloc_reg(&mut self.buf.fast)?;
        let scratch = if tags.len() > 1 {
            Some(self.frame.alloc_reg(&mut self.buf.fast)?)
        } else {
            None
        };
        self.buf.fast.emit(Inst::Set32 {
            cond: Cond::Equal,
            lhs: tag_reg,
            rhs: Operand::tag(tags[0]),
            dst: res,
        });
        if let (Some(scratch), Some(&second)) = (scratch, tags.get(1)) {
            self.buf.fast.emit(Inst::Set32 {
                cond: Cond::Equal,
                lhs: tag_reg,
                rhs: Operand::tag(second),
                dst: scratch,
            });
            self.buf.fast.alu32(AluOp::Or, res, Operand::Reg(scratch));
            self.frame.free_reg(scratch)?;
        }
        if negated {
            self.buf.fast.alu32(AluOp::Xor, res, Operand::Imm(1));
        }
        self.unpin_all(pins);
        self.frame.popn(2);
        self.frame.push_typed_payload(KnownType::Boolean, res)?;
        Ok(Some((Emitted::Inline, 1)))
    }

    /// `x === true` and `x !== false`: tag and payload tests
    fn compare_strict_boolean(
        &mut self,
        op: CompareOp,
        lhs: FrameSlot,
        rhs: FrameSlot,
    ) -> JitResult<Option<(Emitted, usize)>> {
        let (b, x) = match (self.frame.constant(lhs), self.frame.constant(rhs)) {
            (_, Some(Value::Boolean(b))) => (b, lhs),
            (Some(Value::Boolean(b)), _) => (b, rhs),
            _ => return Ok(None),
        };
        let negated = op.is_negated();
        let cond = if negated { Cond::NotEqual } else { Cond::Equal };
        match self.frame.known_type(x) {
            KnownType::Boolean => {
                let mut pins = Pins::new();
                let payload = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
                self.pin(payload, &mut pins);
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                self.buf.fast.emit(Inst::Set32 {
                    cond,
                    lhs: payload,
                    rhs: Operand::Imm(i64::from(b)),
                    dst: res,
                });
                self.unpin_all(pins);
                self.frame.popn(2);
                self.frame.push_typed_payload(KnownType::Boolean, res)?;
                Ok(Some((Emitted::Inline, 1)))
            }
            KnownType::Unknown => {
                let mut pins = Pins::new();
                let payload = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
                self.pin(payload, &mut pins);
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                let tag = self.frame.tag_operand(x)?;
                self.buf.fast.mov(res, Operand::Imm(i64::from(negated)));
                let not_bool = type_guards::branch_tag_is_not(&mut self.buf.fast, tag, Tag::Boolean);
                self.buf.fast.emit(Inst::Set32 {
                    cond,
                    lhs: payload,
                    rhs: Operand::Imm(i64::from(b)),
                    dst: res,
                });
                let done = self.buf.fast.label();
                self.buf.link(not_bool, done);
                self.unpin_all(pins);
                self.frame.popn(2);
                self.frame.push_typed_payload(KnownType::Boolean, res)?;
                Ok(Some((Emitted::Inline, 1)))
            }
            _ => self.push_compare_constant(negated).map(Some),
        }
    }

    /// Both operands are the same value: reflexive unless it is NaN
    fn compare_same_backing(&mut self, op: CompareOp, x: FrameSlot) -> JitResult<(Emitted, usize)> {
        let reflexive = matches!(
            op,
            CompareOp::Eq | CompareOp::StrictEq | CompareOp::Le | CompareOp::Ge
        );
        let known = self.frame.known_type(x);
        match known {
            KnownType::Double => {
                let fpr = self.frame.temp_fp_reg_for_data(x, &mut self.buf.fast)?;
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                self.buf.fast.emit(Inst::SetDouble {
                    cond: op.double_cond(),
                    lhs: fpr,
                    rhs: fpr,
                    dst: res,
                });
                self.frame.popn(2);
                self.frame.push_typed_payload(KnownType::Boolean, res)?;
                Ok((Emitted::Inline, 1))
            }
            KnownType::Unknown if op.is_equality() => {
                let mut pins = Pins::new();
                let payload = self.frame.temp_reg_for_data(x, &mut self.buf.fast)?;
                self.pin(payload, &mut pins);
                let res = self.frame.alloc_reg(&mut self.buf.fast)?;
                let tag = self.frame.tag_operand(x)?;
                self.buf.fast.mov(res, Operand::Imm(i64::from(reflexive)));
                let not_double = type_guards::branch_tag_is_not(&mut self.buf.fast, tag, Tag::Double);
                self.buf.fast.emit(Inst::MoveBitsToDouble {
                    dst: FP_CONVERSION_TEMP,
                    src: payload,
                });
                self.buf.fast.emit(Inst::SetDouble {
                    cond: op.double_cond(),
                    lhs: FP_CONVERSION_TEMP,
                    rhs: FP_CONVERSION_TEMP,
                    dst: res,
                });
                let done = self.buf.fast.label();
                self.buf.link(not_double, done);
                self.unpin_all(pins);
                self.frame.popn(2);
                self.frame.push_typed_payload(KnownType::Boolean, res)?;
                Ok((Emitted::Inline, 1))
            }
            KnownType::Int32 => self.push_compare_constant(reflexive),
            ty if op.is_equality() && ty != KnownType::Unknown => self.push_compare_constant(reflexive),
            _ => Ok((self.emit_stub_op(op.stub(), 0)?, 1)),
        }
    }

    /// Payload compare: int32 operands behind tag guards, or booleans and
    /// objects compared by identity
    fn compare_int(
        &mut self,
        op: CompareOp,
        mut lhs: FrameSlot,
        mut rhs: FrameSlot,
        fused: Option<FusedBranch>,
    ) -> JitResult<(Emitted, usize)> {
        let mut cond = op.cond();
        if self.frame.constant(lhs).is_some() {
            std::mem::swap(&mut lhs, &mut rhs);
            cond = cond.commute();
        }
        let mut pins = Pins::new();
        let lhs_reg = self.frame.temp_reg_for_data(lhs, &mut self.buf.fast)?;
        self.pin(lhs_reg, &mut pins);
        let rhs_op = match self.frame.constant(rhs) {
            Some(value) => Operand::Imm(value.to_raw().payload as i64),
            None => {
                let reg = self.frame.temp_reg_for_data(rhs, &mut self.buf.fast)?;
                self.pin(reg, &mut pins);
                Operand::Reg(reg)
            }
        };
        let res = match fused {
            Some(_) => None,
            None => Some(self.frame.alloc_reg(&mut self.buf.fast)?),
        };

        for slot in [lhs, rhs] {
            if self.frame.known_type(slot) == KnownType::Unknown {
                let guard = type_guards::guard_tag(&self.frame, slot, Tag::Int32, &mut self.buf.fast)?;
                self.link_guard(guard)?;
            }
        }
        let operands = CmpOperands::Int { lhs: lhs_reg, rhs: rhs_op };
        self.finish_compare(op, cond, operands, res, fused, pins, FpTemps::new())
    }

    fn compare_double(
        &mut self,
        op: CompareOp,
        lhs: FrameSlot,
        rhs: FrameSlot,
        fused: Option<FusedBranch>,
    ) -> JitResult<(Emitted, usize)> {
        let lf = self.frame.copy_number_into_fp_reg(lhs, &mut self.buf.fast)?;
        let rf = self.frame.copy_number_into_fp_reg(rhs, &mut self.buf.fast)?;
        let res = match fused {
            Some(_) => None,
            None => Some(self.frame.alloc_reg(&mut self.buf.fast)?),
        };
        for slot in [lhs, rhs] {
            let guard = type_guards::guard_number(&self.frame, slot, &mut self.buf.fast)?;
            self.link_guard(guard)?;
        }
        let temps: FpTemps = SmallVec::from_slice(&[lf, rf]);
        let operands = CmpOperands::Double { lhs: lf, rhs: rf };
        self.finish_compare(op, op.cond(), operands, res, fused, Pins::new(), temps)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_compare(
        &mut self,
        op: CompareOp,
        cond: Cond,
        operands: CmpOperands,
        res: Option<Reg>,
        fused: Option<FusedBranch>,
        pins: Pins,
        temps: FpTemps,
    ) -> JitResult<(Emitted, usize)> {
        let stub = op.stub();
        match (fused, res) {
            (None, Some(res)) => {
                match operands {
                    CmpOperands::Int { lhs, rhs } => self.buf.fast.emit(Inst::Set32 { cond, lhs, rhs, dst: res }),
                    CmpOperands::Double { lhs, rhs } => self.buf.fast.emit(Inst::SetDouble {
                        cond: op.double_cond(),
                        lhs,
                        rhs,
                        dst: res,
                    }),
                }
                let slow = self.stubcc.has_pending_exits();
                if slow {
                    self.slow_call(stub, 0)?;
                }
                self.release_cmp_temps(temps)?;
                self.unpin_all(pins);
                self.frame.popn(2);
                self.frame.push_typed_payload(KnownType::Boolean, res)?;
                if slow {
                    self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
                }
                Ok((Emitted::Inline, 1))
            }
            (Some(branch), None) => {
                let slow_fall = if self.stubcc.has_pending_exits() {
                    self.slow_call(stub, 0)?;
                    let test = if branch.on_true { TestCond::NonZero } else { TestCond::Zero };
                    let taken = self.buf.slow.branch_test32(test, RETURN_REG, Operand::Imm(1));
                    self.buf.link_pc(taken, branch.target);
                    Some(self.buf.slow.jump())
                } else {
                    None
                };

                self.unpin_all(pins);
                self.frame.popn(2);
                self.frame.sync_for_branch(&mut self.buf.fast);
                let jump = match operands {
                    CmpOperands::Int { lhs, rhs } => {
                        let cond = if branch.on_true { cond } else { cond.invert() };
                        self.buf.fast.branch32(cond, Operand::Reg(lhs), rhs)
                    }
                    CmpOperands::Double { lhs, rhs } => {
                        let dcond = op.double_cond();
                        let dcond = if branch.on_true { dcond } else { dcond.invert() };
                        self.buf.fast.branch_double(dcond, lhs, rhs)
                    }
                };
                self.buf.link_pc(jump, branch.target);
                self.release_cmp_temps(temps)?;

                if let Some(fall) = slow_fall {
                    // The stub clobbered every register the fall-through
                    // might still expect.
                    self.frame.sync_and_forget_everything(&mut self.buf.fast)?;
                    self.stubcc.link_rejoin(fall, &mut self.buf);
                    self.stubcc.rejoin_at_branch(self.frame.sp(), 0);
                }
                Ok((Emitted::Inline, 2))
            }
            _ => Err(self.invariant("compare result register does not match fusion")),
        }
    }

    fn release_cmp_temps(&mut self, temps: FpTemps) -> JitResult<()> {
        for reg in temps {
            self.frame.free_fp_reg(reg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CompiledCode;
    use crate::compiler::{CompileEnv, JitCompiler};
    use crate::config::JitConfig;
    use crate::oracle::{NoHoisting, OracleTable};
    use otter_mjit_bytecode::{ArgIndex, Function, FunctionBuilder, JumpOffset};
    use otter_mjit_runtime::Heap;

    fn compile(function: &Function, oracle: &OracleTable) -> CompiledCode {
        let mut heap = Heap::new();
        heap.link_function(function);
        let mut hoister = NoHoisting;
        JitCompiler::new(JitConfig::default())
            .compile(
                function,
                CompileEnv {
                    heap: &heap,
                    oracle,
                    hoister: &mut hoister,
                },
            )
            .expect("compiles")
    }

    fn binary(op: Instruction) -> Function {
        FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::GetArg { idx: ArgIndex(1) },
                op,
                Instruction::Return,
            ])
            .build()
    }

    fn branch_on(op: Instruction) -> Function {
        FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::GetArg { idx: ArgIndex(1) },
                op,
                Instruction::IfEq { offset: JumpOffset(3) },
                Instruction::Int32 { value: 1 },
                Instruction::Return,
                Instruction::Int32 { value: 2 },
                Instruction::Return,
            ])
            .build()
    }

    #[test]
    fn test_fold_rules() {
        assert_eq!(CompareOp::Lt.fold(Value::Int32(1), Value::Double(1.5)), Some(true));
        assert_eq!(CompareOp::Eq.fold(Value::Null, Value::Undefined), Some(true));
        assert_eq!(CompareOp::StrictEq.fold(Value::Null, Value::Undefined), Some(false));
        assert_eq!(CompareOp::Ne.fold(Value::Double(f64::NAN), Value::Double(f64::NAN)), Some(true));
        assert_eq!(CompareOp::Eq.fold(Value::Boolean(true), Value::Int32(1)), None);
        assert_eq!(ArithOp::Add.fold(f64::from(i32::MAX), 1.0), Value::Double(2147483648.0));
    }

    #[test]
    fn test_int_add_checks_overflow() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::of(TypeFlags::INT32))
            .with_arg(1, TypeSet::of(TypeFlags::INT32))
            .with_pushed(2, TypeSet::of(TypeFlags::INT32));
        let code = compile(&binary(Instruction::Add), &oracle);
        let fast = &code.insts[..code.fast_len as usize];
        assert!(fast.iter().any(|i| matches!(i, Inst::BranchAlu32 { op: CheckedOp::Add, .. })));
        assert!(!fast.iter().any(|i| matches!(i, Inst::Branch32 { .. })));
        assert_eq!(code.fast_call_count(), 0);
        assert_eq!(code.call_count(), 1);
    }

    #[test]
    fn test_double_operand_takes_double_path() {
        let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::DOUBLE));
        let code = compile(&binary(Instruction::Sub), &oracle);
        assert!(code
            .insts
            .iter()
            .any(|i| matches!(i, Inst::AluDouble { op: DoubleOp::Sub, .. })));
        // Only the unknown rhs is guarded.
        let guards = code.insts[..code.fast_len as usize]
            .iter()
            .filter(|i| matches!(i, Inst::Branch32 { cond: Cond::Above, .. }))
            .count();
        assert_eq!(guards, 1);
    }

    #[test]
    fn test_double_plus_unknown_is_generic_unless_numeric() {
        let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::DOUBLE));
        let code = compile(&binary(Instruction::Add), &oracle);
        assert_eq!(code.fast_call_count(), 1);
        assert!(!code.insts.iter().any(|i| matches!(i, Inst::AluDouble { .. })));

        let numeric = oracle.with_pushed(2, TypeSet::of(TypeFlags::NUMBER));
        let code = compile(&binary(Instruction::Add), &numeric);
        assert_eq!(code.fast_call_count(), 0);
        assert!(code
            .insts
            .iter()
            .any(|i| matches!(i, Inst::AluDouble { op: DoubleOp::Add, .. })));
    }

    #[test]
    fn test_string_add_is_generic() {
        let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::STRING));
        let code = compile(&binary(Instruction::Add), &oracle);
        assert_eq!(code.fast_call_count(), 1);
    }

    #[test]
    fn test_fused_int_compare_branches_directly() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::of(TypeFlags::INT32))
            .with_arg(1, TypeSet::of(TypeFlags::INT32));
        let code = compile(&branch_on(Instruction::Lt), &oracle);
        assert_eq!(code.offset_of_pc(3), None);
        assert_eq!(code.call_count(), 0);
        assert!(code.insts.iter().any(|i| matches!(
            i,
            Inst::Branch32 { cond: Cond::GreaterThanOrEqual, lhs: Operand::Reg(_), .. }
        )));
        assert!(!code.insts.iter().any(|i| matches!(i, Inst::Set32 { .. })));
    }

    #[test]
    fn test_fused_slow_path_branches_on_r0() {
        let code = compile(&branch_on(Instruction::Eq), &OracleTable::new());
        assert_eq!(code.fast_call_count(), 0);
        let call = code.insts.iter().position(Inst::is_call).expect("slow call");
        assert!(matches!(
            code.insts[call + 1],
            Inst::BranchTest32 { cond: TestCond::Zero, lhs: RETURN_REG, .. }
        ));
        assert_eq!(code.rejoin_sites[0].rejoin, None);
        assert_eq!(code.rejoin_sites[0].sp_after, 2);
    }

    #[test]
    fn test_nullish_compare_is_a_tag_test() {
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::Null,
                Instruction::Eq,
                Instruction::Return,
            ])
            .build();
        let code = compile(&function, &OracleTable::new());
        assert_eq!(code.call_count(), 0);
        let tests = code
            .insts
            .iter()
            .filter(|i| matches!(i, Inst::Set32 { cond: Cond::Equal, .. }))
            .count();
        assert_eq!(tests, 2);
    }

    #[test]
    fn test_nullish_compare_of_known_type_folds() {
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::Undefined,
                Instruction::StrictNe,
                Instruction::Return,
            ])
            .build();
        let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::NULL));
        let code = compile(&function, &oracle);
        let expected = Value::Boolean(true).to_raw();
        assert!(code.insts.iter().any(|i| matches!(
            i,
            Inst::Return { value: crate::assembler::ValueSource::Constant(raw) } if *raw == expected
        )));
        assert_eq!(code.call_count(), 0);
    }

    #[test]
    fn test_same_backing_double_checks_nan() {
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::Dup,
                Instruction::StrictEq,
                Instruction::Return,
            ])
            .build();
        let oracle = OracleTable::new().with_arg(0, TypeSet::of(TypeFlags::DOUBLE));
        let code = compile(&function, &oracle);
        assert!(code.insts.iter().any(|i| matches!(
            i,
            Inst::SetDouble { cond: DoubleCond::Equal, lhs, rhs, .. } if lhs == rhs
        )));
        assert_eq!(code.call_count(), 0);
    }

    #[test]
    fn test_object_equality_is_identity() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::of(TypeFlags::OBJECT))
            .with_arg(1, TypeSet::of(TypeFlags::OBJECT));
        let code = compile(&binary(Instruction::Eq), &oracle);
        assert_eq!(code.call_count(), 0);
        assert!(code.insts.iter().any(|i| matches!(i, Inst::Set32 { cond: Cond::Equal, .. })));
    }

    #[test]
    fn test_pos_of_unknown_guards_number() {
        let function = FunctionBuilder::new()
            .param_count(1)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::Pos,
                Instruction::Return,
            ])
            .build();
        let code = compile(&function, &OracleTable::new());
        assert_eq!(code.fast_call_count(), 0);
        assert_eq!(code.call_count(), 1);
        assert!(code.insts[..code.fast_len as usize].iter().any(|i| matches!(
            i,
            Inst::Branch32 { cond: Cond::Above, rhs, .. } if *rhs == Operand::tag(Tag::NUMBER_MAX)
        )));
    }
}
