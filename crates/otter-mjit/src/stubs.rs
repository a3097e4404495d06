//! Runtime stubs: the generic implementation of every operation the
//! compiler does not finish inline.
//!
//! # Calling convention
//!
//! A stub call names the stack pointer at the call. The stub reads its
//! `uses` operands from `slots[sp - uses .. sp]`, writes its `defs` results
//! in place starting at `slots[sp - uses]`, and returns one word in `r0`
//! (0 or 1 for stubs that produce a boolean). Every register other than
//! `r0` is clobbered. Compiled code must have synced the frame before the
//! call.

use otter_mjit_bytecode::{ConstantIndex, Function, TemplateIndex};
use otter_mjit_runtime::ops::{self, BitOp, RelOp};
use otter_mjit_runtime::{Heap, RawValue, RuntimeError, RuntimeResult, StrId, Value};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stub kind enumeration
// ---------------------------------------------------------------------------

/// Identifies a runtime stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StubKind {
    /// `(lhs, rhs) -> lhs | rhs`
    BitOr = 0,
    /// `(lhs, rhs) -> lhs & rhs`
    BitAnd = 1,
    /// `(lhs, rhs) -> lhs ^ rhs`
    BitXor = 2,
    /// `(lhs, rhs) -> lhs << rhs`
    Lsh = 3,
    /// `(lhs, rhs) -> lhs >> rhs`
    Rsh = 4,
    /// `(lhs, rhs) -> lhs >>> rhs`
    Ursh = 5,
    /// `(val) -> ~val`
    BitNot = 6,
    /// `(lhs, rhs) -> lhs + rhs`
    Add = 7,
    /// `(lhs, rhs) -> lhs - rhs`
    Sub = 8,
    /// `(val) -> +val`
    Pos = 9,
    /// `(val) -> !val`, also returned in r0
    Not = 10,
    /// `(val) -> ()`, truthiness returned in r0
    ValueToBoolean = 11,
    /// `(val) -> typeof val`
    TypeOf = 12,
    /// `(lhs, rhs) -> lhs == rhs`
    Eq = 13,
    /// `(lhs, rhs) -> lhs != rhs`
    Ne = 14,
    /// `(lhs, rhs) -> lhs === rhs`
    StrictEq = 15,
    /// `(lhs, rhs) -> lhs !== rhs`
    StrictNe = 16,
    /// `(lhs, rhs) -> lhs < rhs`
    Lt = 17,
    /// `(lhs, rhs) -> lhs <= rhs`
    Le = 18,
    /// `(lhs, rhs) -> lhs > rhs`
    Gt = 19,
    /// `(lhs, rhs) -> lhs >= rhs`
    Ge = 20,
    /// `(obj, key) -> obj[key]`
    GetElem = 21,
    /// `(obj, key, val) -> val` after `obj[key] = val`
    SetElem = 22,
    /// `() -> {}`
    NewInit = 23,
    /// `() -> {..template}`; arg is the template index
    NewObject = 24,
    /// `() -> [holes]`; arg is the declared length
    NewArray = 25,
    /// `(obj, val) -> obj`; arg is the name constant
    InitProp = 26,
    /// `(obj, fn) -> obj`; arg is the name constant
    InitMethod = 27,
    /// `(obj, key, val) -> obj`; arg is 1 for the literal's last element
    InitElem = 28,
}

impl StubKind {
    /// Operands read from the stack
    pub const fn uses(self) -> u32 {
        match self {
            Self::NewInit | Self::NewObject | Self::NewArray => 0,
            Self::BitNot | Self::Pos | Self::Not | Self::ValueToBoolean | Self::TypeOf => 1,
            Self::SetElem | Self::InitElem => 3,
            _ => 2,
        }
    }

    /// Results written back
    pub const fn defs(self) -> u32 {
        match self {
            Self::ValueToBoolean => 0,
            _ => 1,
        }
    }

    /// Does r0 carry a boolean outcome
    pub const fn returns_bool(self) -> bool {
        matches!(
            self,
            Self::Not
                | Self::ValueToBoolean
                | Self::Eq
                | Self::Ne
                | Self::StrictEq
                | Self::StrictNe
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
        )
    }

    /// Stable name for logs and layout dumps
    pub const fn name(self) -> &'static str {
        match self {
            Self::BitOr => "bitor",
            Self::BitAnd => "bitand",
            Self::BitXor => "bitxor",
            Self::Lsh => "lsh",
            Self::Rsh => "rsh",
            Self::Ursh => "ursh",
            Self::BitNot => "bitnot",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Pos => "pos",
            Self::Not => "not",
            Self::ValueToBoolean => "value_to_boolean",
            Self::TypeOf => "typeof",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::StrictEq => "stricteq",
            Self::StrictNe => "strictne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::GetElem => "getelem",
            Self::SetElem => "setelem",
            Self::NewInit => "newinit",
            Self::NewObject => "newobject",
            Self::NewArray => "newarray",
            Self::InitProp => "initprop",
            Self::InitMethod => "initmethod",
            Self::InitElem => "initelem",
        }
    }

    /// Bitwise operation behind a bitop stub
    pub const fn bit_op(self) -> Option<BitOp> {
        Some(match self {
            Self::BitOr => BitOp::Or,
            Self::BitAnd => BitOp::And,
            Self::BitXor => BitOp::Xor,
            Self::Lsh => BitOp::Lsh,
            Self::Rsh => BitOp::Rsh,
            Self::Ursh => BitOp::Ursh,
            _ => return None,
        })
    }
}

impl std::fmt::Display for StubKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// What a stub may touch
pub struct StubFrame<'a> {
    /// The heap
    pub heap: &'a mut Heap,
    /// Function being executed, for constants and templates
    pub function: &'a Function,
    /// Frame memory
    pub slots: &'a mut [RawValue],
    /// Stack pointer at the call
    pub sp: u32,
}

impl StubFrame<'_> {
    fn operand(&self, depth: u32) -> RuntimeResult<Value> {
        let index = self
            .sp
            .checked_sub(depth)
            .ok_or_else(|| RuntimeError::RangeError("stub operand below the frame".into()))?;
        self.slots
            .get(index as usize)
            .copied()
            .ok_or_else(|| RuntimeError::RangeError(format!("stub operand {index} outside the frame")))?
            .decode()
    }

    fn write(&mut self, depth: u32, value: Value) -> RuntimeResult<()> {
        let index = (self.sp as usize)
            .checked_sub(depth as usize)
            .ok_or_else(|| RuntimeError::RangeError("stub result below the frame".into()))?;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| RuntimeError::RangeError(format!("stub result {index} outside the frame")))?;
        *slot = value.to_raw();
        Ok(())
    }

    fn name_constant(&mut self, arg: i64) -> RuntimeResult<StrId> {
        let name = self
            .function
            .string_constant(ConstantIndex(arg as u32))
            .ok_or_else(|| RuntimeError::TypeError(format!("constant {arg} is not a name")))?;
        Ok(self.heap.intern(name))
    }
}

fn boolean(frame: &mut StubFrame<'_>, depth: u32, b: bool) -> RuntimeResult<u64> {
    frame.write(depth, Value::Boolean(b))?;
    Ok(b as u64)
}

/// Run `kind` against the frame
pub fn invoke(kind: StubKind, frame: &mut StubFrame<'_>, arg: i64) -> RuntimeResult<u64> {
    match kind {
        StubKind::BitOr
        | StubKind::BitAnd
        | StubKind::BitXor
        | StubKind::Lsh
        | StubKind::Rsh
        | StubKind::Ursh => {
            let (lhs, rhs) = (frame.operand(2)?, frame.operand(1)?);
            let op = kind.bit_op().unwrap_or(BitOp::Or);
            let result = ops::bitop(frame.heap, op, lhs, rhs)?;
            frame.write(2, result)?;
        }
        StubKind::BitNot => {
            let value = frame.operand(1)?;
            let result = ops::bitnot(frame.heap, value)?;
            frame.write(1, result)?;
        }
        StubKind::Add => {
            let (lhs, rhs) = (frame.operand(2)?, frame.operand(1)?);
            let result = ops::add(frame.heap, lhs, rhs)?;
            frame.write(2, result)?;
        }
        StubKind::Sub => {
            let (lhs, rhs) = (frame.operand(2)?, frame.operand(1)?);
            let result = ops::sub(frame.heap, lhs, rhs)?;
            frame.write(2, result)?;
        }
        StubKind::Pos => {
            let value = frame.operand(1)?;
            let result = ops::pos(frame.heap, value)?;
            frame.write(1, result)?;
        }
        StubKind::Not => {
            let value = frame.operand(1)?;
            let b = ops::not(frame.heap, value)?;
            return boolean(frame, 1, b);
        }
        StubKind::ValueToBoolean => {
            let value = frame.operand(1)?;
            return Ok(ops::to_boolean(frame.heap, value)? as u64);
        }
        StubKind::TypeOf => {
            let value = frame.operand(1)?;
            let name = ops::type_of(frame.heap, value);
            frame.write(1, Value::String(name))?;
        }
        StubKind::Eq | StubKind::Ne => {
            let (lhs, rhs) = (frame.operand(2)?, frame.operand(1)?);
            let eq = ops::loose_equals(frame.heap, lhs, rhs)?;
            return boolean(frame, 2, eq == (kind == StubKind::Eq));
        }
        StubKind::StrictEq | StubKind::StrictNe => {
            let eq = ops::strict_equals(frame.operand(2)?, frame.operand(1)?);
            return boolean(frame, 2, eq == (kind == StubKind::StrictEq));
        }
        StubKind::Lt | StubKind::Le | StubKind::Gt | StubKind::Ge => {
            let op = match kind {
                StubKind::Lt => RelOp::Lt,
                StubKind::Le => RelOp::Le,
                StubKind::Gt => RelOp::Gt,
                _ => RelOp::Ge,
            };
            let (lhs, rhs) = (frame.operand(2)?, frame.operand(1)?);
            let result = ops::compare(frame.heap, op, lhs, rhs)?;
            return boolean(frame, 2, result);
        }
        StubKind::GetElem => {
            let (obj, key) = (frame.operand(2)?, frame.operand(1)?);
            let result = ops::get_elem(frame.heap, obj, key)?;
            frame.write(2, result)?;
        }
        StubKind::SetElem => {
            let (obj, key, value) = (frame.operand(3)?, frame.operand(2)?, frame.operand(1)?);
            ops::set_elem(frame.heap, obj, key, value)?;
            frame.write(3, value)?;
        }
        StubKind::NewInit => {
            let id = frame.heap.new_plain_object();
            frame.write(0, Value::Object(id))?;
        }
        StubKind::NewObject => {
            let template = frame
                .function
                .template(TemplateIndex(arg as u32))
                .ok_or_else(|| RuntimeError::TypeError(format!("no object template {arg}")))?;
            let mut keys = Vec::with_capacity(template.properties.len());
            for &name in &template.properties {
                let text = frame
                    .function
                    .string_constant(name)
                    .ok_or_else(|| RuntimeError::TypeError("template name is not a string".into()))?;
                keys.push(frame.heap.intern(text));
            }
            let id = frame.heap.new_object_with_keys(&keys);
            frame.write(0, Value::Object(id))?;
        }
        StubKind::NewArray => {
            let id = frame.heap.new_array_literal(arg as u32)?;
            frame.write(0, Value::Object(id))?;
        }
        StubKind::InitProp | StubKind::InitMethod => {
            let name = frame.name_constant(arg)?;
            let (obj, value) = (frame.operand(2)?, frame.operand(1)?);
            ops::init_prop(frame.heap, obj, name, value)?;
            frame.write(2, obj)?;
        }
        StubKind::InitElem => {
            let (obj, key, value) = (frame.operand(3)?, frame.operand(2)?, frame.operand(1)?);
            ops::init_elem(frame.heap, obj, key, value, arg != 0)?;
            frame.write(3, obj)?;
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_mjit_bytecode::FunctionBuilder;

    fn run(kind: StubKind, heap: &mut Heap, slots: &mut [RawValue], sp: u32, arg: i64) -> u64 {
        let function = FunctionBuilder::new().build();
        let mut frame = StubFrame {
            heap,
            function: &function,
            slots,
            sp,
        };
        invoke(kind, &mut frame, arg).expect("stub succeeds")
    }

    #[test]
    fn test_binary_result_lands_in_place() {
        let mut heap = Heap::new();
        let mut slots = vec![Value::Int32(6).to_raw(), Value::Int32(3).to_raw(), RawValue::UNDEFINED];
        run(StubKind::BitXor, &mut heap, &mut slots, 2, 0);
        assert_eq!(slots[0].decode(), Ok(Value::Int32(5)));
    }

    #[test]
    fn test_compare_returns_bool() {
        let mut heap = Heap::new();
        let mut slots = vec![Value::Int32(1).to_raw(), Value::Double(1.5).to_raw()];
        assert_eq!(run(StubKind::Lt, &mut heap, &mut slots, 2, 0), 1);
        assert_eq!(slots[0].decode(), Ok(Value::Boolean(true)));
    }

    #[test]
    fn test_value_to_boolean_keeps_operand() {
        let mut heap = Heap::new();
        let mut slots = vec![Value::Int32(0).to_raw()];
        assert_eq!(run(StubKind::ValueToBoolean, &mut heap, &mut slots, 1, 0), 0);
        assert_eq!(slots[0].decode(), Ok(Value::Int32(0)));
    }

    #[test]
    fn test_new_array_writes_at_sp() {
        let mut heap = Heap::new();
        let mut slots = vec![RawValue::UNDEFINED; 2];
        run(StubKind::NewArray, &mut heap, &mut slots, 1, 3);
        let Ok(Value::Object(id)) = slots[1].decode() else {
            panic!("expected an object");
        };
        assert_eq!(heap.object(id).expect("live").length, 3);
    }

    #[test]
    fn test_uses_and_defs() {
        assert_eq!(StubKind::SetElem.uses(), 3);
        assert_eq!(StubKind::NewInit.uses(), 0);
        assert_eq!(StubKind::ValueToBoolean.defs(), 0);
        assert!(StubKind::StrictNe.returns_bool());
        assert!(!StubKind::TypeOf.returns_bool());
    }

    #[test]
    fn test_nullish_getelem_fails() {
        let mut heap = Heap::new();
        let function = FunctionBuilder::new().build();
        let mut slots = vec![Value::Null.to_raw(), Value::Int32(0).to_raw()];
        let mut frame = StubFrame {
            heap: &mut heap,
            function: &function,
            slots: &mut slots,
            sp: 2,
        };
        assert!(invoke(StubKind::GetElem, &mut frame, 0).is_err());
    }
}
