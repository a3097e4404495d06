//! `getelem` and `setelem`.
//!
//! Arrays the oracle proves dense get a guarded inline access with no IC.
//! Everything else that may be an element access on an object gets an IC
//! (see [`crate::ic`]): the same inline dense path behind a patchable class
//! guard, with every miss funnelled to one slow-path start that calls the
//! IC stub.

use otter_mjit_runtime::{ObjectClass, ObjectField, Tag};
use smallvec::SmallVec;

use crate::assembler::{AluOp, Cond, FrameSlot, Inst, Int32Key, JumpRef, Label, Operand, UNLINKED, ValueSource};
use crate::code::absolute;
use crate::compiler::{Compiler, Emitted, JitResult};
use crate::fastops::Pins;
use crate::frame::KnownType;
use crate::ic::{IcId, IcKey, IcKind, IcLayout};
use crate::oracle::{Container, ObjectKind};
use crate::regs::{Reg, RegMask};
use crate::stubs::StubKind;
use crate::type_guards;

/// An IC site as the compiler records it, with stream-relative labels
#[derive(Debug, Clone)]
pub(crate) struct IcSite {
    kind: IcKind,
    pc: u32,
    fast_path_start: Label,
    clasp_guard: Label,
    fast_path_rejoin: Label,
    slow_path_start: Label,
    obj: Reg,
    key: IcKey,
    value: Option<ValueSource>,
    result: Option<(Reg, Reg)>,
    preserved: RegMask,
}

impl IcSite {
    /// Layout with absolute offsets
    pub(crate) fn layout(&self, fast_len: u32) -> IcLayout {
        IcLayout {
            kind: self.kind,
            pc: self.pc,
            fast_path_start: absolute(self.fast_path_start, fast_len),
            clasp_guard: absolute(self.clasp_guard, fast_len),
            fast_path_rejoin: absolute(self.fast_path_rejoin, fast_len),
            slow_path_start: absolute(self.slow_path_start, fast_len),
            obj: self.obj,
            key: self.key,
            value: self.value,
            result: self.result,
            preserved: self.preserved,
        }
    }
}

/// How an element access is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElemPath {
    Generic,
    Dense { packed: bool },
    Cache,
}

/// Where an element key lives once loaded
#[derive(Debug, Clone, Copy)]
struct KeyLoc {
    ic: IcKey,
    /// Index usable by element instructions; `None` for string keys
    index: Option<Int32Key>,
}

type Temps = SmallVec<[Reg; 2]>;

impl Compiler<'_> {
    fn classify_elem(&self, obj: FrameSlot, key: FrameSlot) -> ElemPath {
        let obj_ty = self.frame.known_type(obj);
        if !matches!(obj_ty, KnownType::Unknown | KnownType::Object) {
            return ElemPath::Generic;
        }
        let key_ty = self.frame.known_type(key);
        if !matches!(key_ty, KnownType::Int32 | KnownType::String | KnownType::Unknown) {
            return ElemPath::Generic;
        }
        if matches!(self.frame.int32_constant(key), Some(i) if i < 0) {
            return ElemPath::Generic;
        }
        if self.frame.have_same_backing(obj, key) {
            return ElemPath::Generic;
        }
        let kind = self.frame.types(obj).object_kind;
        // An indexed prototype property could stand in for any hole.
        if obj_ty == KnownType::Object
            && kind.is_dense_array()
            && key_ty != KnownType::String
            && !self.heap.array_proto_has_indexed()
        {
            return ElemPath::Dense {
                packed: kind == ObjectKind::PackedArray,
            };
        }
        ElemPath::Cache
    }

    /// Can the initialized-length check on `obj` be left to the enclosing
    /// loop
    fn hoisted_bounds_check(&mut self, obj: FrameSlot, key: FrameSlot) -> bool {
        if self.frame.constant(key).is_some() {
            return false;
        }
        let backing = self.frame.backing(obj);
        if backing.0 >= self.frame.stack_base() {
            return false;
        }
        let nargs = u32::from(self.function.param_count);
        let container = if backing.0 < nargs {
            Container::Arg(backing.0 as u16)
        } else {
            Container::Local((backing.0 - nargs) as u16)
        };
        let hoisted = self.hoister.hoist_array_length_check(self.pc, container, 0).is_some();
        if hoisted {
            tracing::trace!(pc = self.pc, ?container, "bounds check hoisted");
        }
        hoisted
    }

    fn load_key(&mut self, key: FrameSlot, pins: &mut Pins, temps: &mut Temps) -> JitResult<KeyLoc> {
        if let Some(i) = self.frame.int32_constant(key) {
            return Ok(KeyLoc {
                ic: IcKey::Constant(i),
                index: Some(Int32Key::Constant(i)),
            });
        }
        if let Some(value) = self.frame.constant(key) {
            let reg = self.frame.copy_data_into_reg(key, &mut self.buf.fast)?;
            temps.push(reg);
            return Ok(KeyLoc {
                ic: IcKey::Reg {
                    tag: None,
                    payload: reg,
                    known_tag: Some(value.tag() as u64),
                },
                index: None,
            });
        }
        match self.frame.known_type(key) {
            KnownType::Unknown => {
                let tag = self.frame.temp_reg_for_type(key, &mut self.buf.fast)?;
                self.pin(tag, pins);
                let payload = self.frame.temp_reg_for_data(key, &mut self.buf.fast)?;
                self.pin(payload, pins);
                Ok(KeyLoc {
                    ic: IcKey::Reg {
                        tag: Some(tag),
                        payload,
                        known_tag: None,
                    },
                    index: Some(Int32Key::Reg(payload)),
                })
            }
            ty => {
                let payload = self.frame.temp_reg_for_data(key, &mut self.buf.fast)?;
                self.pin(payload, pins);
                Ok(KeyLoc {
                    ic: IcKey::Reg {
                        tag: None,
                        payload,
                        known_tag: ty.tag().map(|t| t as u64),
                    },
                    index: (ty == KnownType::Int32).then_some(Int32Key::Reg(payload)),
                })
            }
        }
    }

    /// Exit unless the key is an int32; string keys always exit
    fn guard_int_key(&mut self, key: FrameSlot, loc: KeyLoc) -> JitResult<()> {
        if loc.index.is_none() {
            let jump = self.buf.fast.jump();
            return self.stubcc.link_exit(jump, &self.frame);
        }
        let guard = type_guards::guard_tag(&self.frame, key, Tag::Int32, &mut self.buf.fast)?;
        self.link_guard(guard)
    }

    fn guard_object(&mut self, obj: FrameSlot) -> JitResult<()> {
        let guard = type_guards::guard_tag(&self.frame, obj, Tag::Object, &mut self.buf.fast)?;
        self.link_guard(guard)
    }

    fn branch_not_array(&mut self, obj: Reg) -> JumpRef {
        self.buf.fast.emit_jump(Inst::BranchObjClass {
            cond: Cond::NotEqual,
            obj,
            class: ObjectClass::Array,
            target: UNLINKED,
        })
    }

    /// Jump if `key` is at or past the initialized length
    fn branch_past_initialized(&mut self, obj: Reg, key: Int32Key) -> JumpRef {
        self.buf.fast.emit_jump(Inst::BranchArrayExtent {
            field: ObjectField::InitializedLength,
            obj,
            key,
            cond: Cond::BelowOrEqual,
            target: UNLINKED,
        })
    }

    fn branch_hole(&mut self, obj: Reg, key: Int32Key) -> JumpRef {
        self.buf.fast.emit_jump(Inst::BranchElementHole {
            obj,
            key,
            target: UNLINKED,
        })
    }

    fn release_elem_regs(&mut self, pins: Pins, temps: Temps) -> JitResult<()> {
        self.unpin_all(pins);
        for reg in temps {
            self.frame.free_reg(reg)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // getelem
    // ------------------------------------------------------------------

    pub(crate) fn jsop_getelem(&mut self) -> JitResult<Emitted> {
        let (obj, key) = (self.frame.peek(2), self.frame.peek(1));
        match self.classify_elem(obj, key) {
            ElemPath::Generic => self.emit_stub_op(StubKind::GetElem, 0),
            ElemPath::Dense { packed } => self.getelem_dense(obj, key, packed),
            ElemPath::Cache => self.getelem_ic(obj, key),
        }
    }

    fn getelem_dense(&mut self, obj: FrameSlot, key: FrameSlot, packed: bool) -> JitResult<Emitted> {
        let types = self.pushed_types();
        let hoisted = self.hoisted_bounds_check(obj, key);
        let undefined_ok = types.might_be(Tag::Undefined);

        let (mut pins, mut temps) = (Pins::new(), Temps::new());
        let obj_reg = self.frame.temp_reg_for_data(obj, &mut self.buf.fast)?;
        self.pin(obj_reg, &mut pins);
        let loc = self.load_key(key, &mut pins, &mut temps)?;
        let index = loc
            .index
            .ok_or_else(|| self.invariant("dense element access with a string key"))?;
        let tag = match types.known_type().tag() {
            Some(_) => None,
            None => Some(self.frame.alloc_reg(&mut self.buf.fast)?),
        };
        let payload = self.frame.alloc_reg(&mut self.buf.fast)?;

        self.guard_int_key(key, loc)?;
        let not_array = self.branch_not_array(obj_reg);
        self.stubcc.link_exit(not_array, &self.frame)?;
        let mut misses = SmallVec::<[JumpRef; 2]>::new();
        if !hoisted {
            misses.push(self.branch_past_initialized(obj_reg, index));
        }
        if packed {
            misses.push(self.buf.fast.emit_jump(Inst::LoadPackedElement {
                obj: obj_reg,
                key: index,
                tag,
                payload,
                target: UNLINKED,
            }));
        } else {
            misses.push(self.branch_hole(obj_reg, index));
            self.buf.fast.emit(Inst::LoadElement {
                obj: obj_reg,
                key: index,
                tag,
                payload,
            });
        }

        if undefined_ok && !misses.is_empty() {
            // A miss reads `undefined` while the array prototype is as it
            // was when this code was compiled.
            let done = self.buf.fast.jump();
            let miss = self.buf.fast.label();
            self.buf.link_all(misses, miss);
            let moved = self.buf.fast.emit_jump(Inst::BranchPrototypeEpoch {
                expected: self.heap.prototype_epoch(),
                target: UNLINKED,
            });
            self.stubcc.link_exit(moved, &self.frame)?;
            if let Some(tag) = tag {
                self.buf.fast.mov(tag, Operand::tag(Tag::Undefined));
            }
            self.buf.fast.mov(payload, Operand::Imm(0));
            let joined = self.buf.fast.label();
            self.buf.link(done, joined);
        } else {
            for miss in misses {
                self.stubcc.link_exit(miss, &self.frame)?;
            }
        }

        self.slow_call(StubKind::GetElem, 0)?;
        self.release_elem_regs(pins, temps)?;
        self.frame.popn(2);
        match tag {
            Some(tag) => self.frame.push_regs(tag, payload, types)?,
            None => {
                let slot = self.frame.push_typed_payload(types.known_type(), payload)?;
                self.frame.set_types(slot, types);
                slot
            }
        };
        self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        Ok(Emitted::Inline)
    }

    fn getelem_ic(&mut self, obj: FrameSlot, key: FrameSlot) -> JitResult<Emitted> {
        let types = self.pushed_types();
        let (mut pins, mut temps) = (Pins::new(), Temps::new());
        let obj_reg = self.frame.temp_reg_for_data(obj, &mut self.buf.fast)?;
        self.pin(obj_reg, &mut pins);
        let loc = self.load_key(key, &mut pins, &mut temps)?;
        let tag = self.frame.alloc_reg(&mut self.buf.fast)?;
        let payload = self.frame.alloc_reg(&mut self.buf.fast)?;

        let fast_path_start = self.buf.fast.label();
        self.guard_object(obj)?;
        let clasp_guard = self.buf.fast.label();
        let not_array = self.branch_not_array(obj_reg);
        self.stubcc.link_exit(not_array, &self.frame)?;
        self.guard_int_key(key, loc)?;
        if let Some(index) = loc.index {
            let past = self.branch_past_initialized(obj_reg, index);
            self.stubcc.link_exit(past, &self.frame)?;
            let hole = self.branch_hole(obj_reg, index);
            self.stubcc.link_exit(hole, &self.frame)?;
            self.buf.fast.emit(Inst::LoadElement {
                obj: obj_reg,
                key: index,
                tag: Some(tag),
                payload,
            });
        }
        let fast_path_rejoin = self.buf.fast.label();

        let id = IcId(self.ics.len() as u32);
        let slow_path_start = self.stubcc.leave(&self.frame, &mut self.buf)?;
        let preserved = self.frame.regs().in_use();
        self.stubcc.call_ic(&self.frame, &mut self.buf, id, preserved);
        self.ics.push(IcSite {
            kind: IcKind::GetElem,
            pc: self.pc,
            fast_path_start,
            clasp_guard,
            fast_path_rejoin,
            slow_path_start,
            obj: obj_reg,
            key: loc.ic,
            value: None,
            result: Some((tag, payload)),
            preserved,
        });

        self.release_elem_regs(pins, temps)?;
        self.frame.popn(2);
        self.frame.push_regs(tag, payload, types)?;
        self.stubcc.rejoin(&self.frame, &mut self.buf, 1)?;
        tracing::trace!(pc = self.pc, ic = id.0, "getelem IC");
        Ok(Emitted::Inline)
    }

    // ------------------------------------------------------------------
    // setelem
    // ------------------------------------------------------------------

    pub(crate) fn jsop_setelem(&mut self) -> JitResult<Emitted> {
        let (obj, key, value) = (self.frame.peek(3), self.frame.peek(2), self.frame.peek(1));
        match self.classify_elem(obj, key) {
            ElemPath::Generic => self.emit_stub_op(StubKind::SetElem, 0),
            ElemPath::Dense { packed } => self.setelem_dense(obj, key, value, packed),
            ElemPath::Cache => self.setelem_ic(obj, key, value),
        }
    }

    /// Leave the stored value on the stack in place of the three operands
    fn finish_setelem(&mut self, source: ValueSource, pins: Pins, temps: Temps) -> JitResult<()> {
        self.frame.unpin_source(source);
        self.release_elem_regs(pins, temps)?;
        self.frame.shimmy(2, &mut self.buf.fast)?;
        self.stubcc.rejoin(&self.frame, &mut self.buf, 1)
    }

    fn setelem_dense(&mut self, obj: FrameSlot, key: FrameSlot, value: FrameSlot, packed: bool) -> JitResult<Emitted> {
        let hoisted = self.hoisted_bounds_check(obj, key);
        let (mut pins, mut temps) = (Pins::new(), Temps::new());
        let obj_reg = self.frame.temp_reg_for_data(obj, &mut self.buf.fast)?;
        self.pin(obj_reg, &mut pins);
        let loc = self.load_key(key, &mut pins, &mut temps)?;
        let index = loc
            .index
            .ok_or_else(|| self.invariant("dense element access with a string key"))?;
        let source = self.frame.value_source(value, &mut self.buf.fast)?;
        let bumped = match (hoisted, index) {
            (false, Int32Key::Reg(_)) => {
                let reg = self.frame.alloc_reg(&mut self.buf.fast)?;
                temps.push(reg);
                Some(reg)
            }
            _ => None,
        };

        self.guard_int_key(key, loc)?;
        let not_array = self.branch_not_array(obj_reg);
        self.stubcc.link_exit(not_array, &self.frame)?;
        let past = (!hoisted).then(|| self.branch_past_initialized(obj_reg, index));
        if !packed {
            let hole = self.branch_hole(obj_reg, index);
            self.stubcc.link_exit(hole, &self.frame)?;
        }
        self.buf.fast.emit(Inst::StoreElement {
            obj: obj_reg,
            key: index,
            value: source,
        });
        let stored = self.buf.fast.label();

        if let Some(past) = past {
            self.setelem_extend(past, obj_reg, index, source, bumped, stored)?;
        }

        self.slow_call(StubKind::SetElem, 0)?;
        self.finish_setelem(source, pins, temps)?;
        Ok(Emitted::Inline)
    }

    /// Out-of-line write at exactly the initialized length: store, then
    /// bump the initialized length and, if needed, the visible length
    fn setelem_extend(
        &mut self,
        past: JumpRef,
        obj: Reg,
        index: Int32Key,
        source: ValueSource,
        bumped: Option<Reg>,
        stored: Label,
    ) -> JitResult<()> {
        let new_length = match (index, bumped) {
            (Int32Key::Constant(i), _) => Operand::Imm(i64::from(i) + 1),
            (Int32Key::Reg(_), Some(reg)) => Operand::Reg(reg),
            (Int32Key::Reg(_), None) => return Err(self.invariant("no register for the bumped length")),
        };
        let start = self.buf.slow.label();
        self.buf.link(past, start);
        let slow = &mut self.buf.slow;
        let gap = slow.emit_jump(Inst::BranchArrayExtent {
            field: ObjectField::InitializedLength,
            obj,
            key: index,
            cond: Cond::NotEqual,
            target: UNLINKED,
        });
        let full = slow.emit_jump(Inst::BranchArrayExtent {
            field: ObjectField::Capacity,
            obj,
            key: index,
            cond: Cond::BelowOrEqual,
            target: UNLINKED,
        });
        slow.emit(Inst::StoreElement {
            obj,
            key: index,
            value: source,
        });
        if let (Int32Key::Reg(key), Operand::Reg(reg)) = (index, new_length) {
            slow.mov(reg, Operand::Reg(key));
            slow.alu32(AluOp::Add, reg, Operand::Imm(1));
        }
        slow.emit(Inst::StoreObjField {
            obj,
            field: ObjectField::InitializedLength,
            src: new_length,
        });
        let long_enough = slow.emit_jump(Inst::BranchArrayExtent {
            field: ObjectField::Length,
            obj,
            key: index,
            cond: Cond::Above,
            target: UNLINKED,
        });
        slow.emit(Inst::StoreObjField {
            obj,
            field: ObjectField::Length,
            src: new_length,
        });
        let back = slow.jump();
        self.buf.link(long_enough, stored);
        self.stubcc.cross_jump(back, stored, &mut self.buf);
        self.stubcc.link_exit(gap, &self.frame)?;
        self.stubcc.link_exit(full, &self.frame)
    }

    fn setelem_ic(&mut self, obj: FrameSlot, key: FrameSlot, value: FrameSlot) -> JitResult<Emitted> {
        let (mut pins, mut temps) = (Pins::new(), Temps::new());
        let obj_reg = self.frame.temp_reg_for_data(obj, &mut self.buf.fast)?;
        self.pin(obj_reg, &mut pins);
        let loc = self.load_key(key, &mut pins, &mut temps)?;
        let source = self.frame.value_source(value, &mut self.buf.fast)?;

        let fast_path_start = self.buf.fast.label();
        self.guard_object(obj)?;
        let clasp_guard = self.buf.fast.label();
        let not_array = self.branch_not_array(obj_reg);
        self.stubcc.link_exit(not_array, &self.frame)?;
        self.guard_int_key(key, loc)?;
        if let Some(index) = loc.index {
            let past = self.branch_past_initialized(obj_reg, index);
            self.stubcc.link_exit(past, &self.frame)?;
            let hole = self.branch_hole(obj_reg, index);
            self.stubcc.link_exit(hole, &self.frame)?;
            self.buf.fast.emit(Inst::StoreElement {
                obj: obj_reg,
                key: index,
                value: source,
            });
        }
        let fast_path_rejoin = self.buf.fast.label();

        let id = IcId(self.ics.len() as u32);
        let slow_path_start = self.stubcc.leave(&self.frame, &mut self.buf)?;
        let preserved = self.frame.regs().in_use();
        self.stubcc.call_ic(&self.frame, &mut self.buf, id, preserved);
        self.ics.push(IcSite {
            kind: IcKind::SetElem,
            pc: self.pc,
            fast_path_start,
            clasp_guard,
            fast_path_rejoin,
            slow_path_start,
            obj: obj_reg,
            key: loc.ic,
            value: Some(source),
            result: None,
            preserved,
        });

        self.finish_setelem(source, pins, temps)?;
        tracing::trace!(pc = self.pc, ic = id.0, "setelem IC");
        Ok(Emitted::Inline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CompiledCode;
    use crate::compiler::{CompileEnv, JitCompiler};
    use crate::config::JitConfig;
    use crate::oracle::{HoistTable, LoopHoister, NoHoisting, OracleTable, TypeFlags, TypeSet};
    use otter_mjit_bytecode::{ArgIndex, Function, FunctionBuilder, Instruction};
    use otter_mjit_runtime::Heap;

    fn compile_with(function: &Function, oracle: &OracleTable, hoister: &mut dyn LoopHoister) -> CompiledCode {
        let mut heap = Heap::new();
        heap.link_function(function);
        JitCompiler::new(JitConfig::default())
            .compile(
                function,
                CompileEnv {
                    heap: &heap,
                    oracle,
                    hoister,
                },
            )
            .expect("compiles")
    }

    fn compile(function: &Function, oracle: &OracleTable) -> CompiledCode {
        compile_with(function, oracle, &mut NoHoisting)
    }

    fn get(key: Instruction) -> Function {
        FunctionBuilder::new()
            .param_count(2)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                key,
                Instruction::GetElem,
                Instruction::Return,
            ])
            .build()
    }

    fn set() -> Function {
        FunctionBuilder::new()
            .param_count(3)
            .instructions(vec![
                Instruction::GetArg { idx: ArgIndex(0) },
                Instruction::GetArg { idx: ArgIndex(1) },
                Instruction::GetArg { idx: ArgIndex(2) },
                Instruction::SetElem,
                Instruction::Return,
            ])
            .build()
    }

    fn count(code: &CompiledCode, pred: impl Fn(&Inst) -> bool) -> usize {
        code.insts.iter().filter(|i| pred(i)).count()
    }

    #[test]
    fn test_unknown_object_gets_an_ic() {
        let code = compile(&get(Instruction::GetArg { idx: ArgIndex(1) }), &OracleTable::new());
        assert_eq!(code.ics.len(), 1);
        let ic = code.ics[0];
        assert_eq!(ic.kind, IcKind::GetElem);
        assert!(matches!(ic.key, IcKey::Reg { tag: Some(_), .. }));
        assert!(ic.result.is_some());
        assert!(matches!(code.insts[ic.clasp_guard as usize], Inst::BranchObjClass { .. }));
        assert!(matches!(code.insts[ic.slow_path_start as usize..]
            .iter()
            .find(|i| i.is_call()), Some(Inst::CallIcStub { ic: IcId(0), .. })));
        assert!(ic.fast_path_start < ic.clasp_guard);
        assert!(ic.clasp_guard < ic.fast_path_rejoin);
        assert!(code.clasp_guards.contains_key(&ic.clasp_guard));
    }

    #[test]
    fn test_dense_array_skips_the_ic() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::objects(ObjectKind::DenseArray))
            .with_arg(1, TypeSet::of(TypeFlags::INT32))
            .with_pushed(2, TypeSet::of(TypeFlags::INT32));
        let code = compile(&get(Instruction::GetArg { idx: ArgIndex(1) }), &oracle);
        assert!(code.ics.is_empty());
        assert_eq!(count(&code, |i| matches!(i, Inst::BranchElementHole { .. })), 1);
        assert_eq!(count(&code, |i| matches!(i, Inst::LoadElement { tag: None, .. })), 1);
        assert_eq!(count(&code, |i| matches!(i, Inst::BranchPrototypeEpoch { .. })), 0);
    }

    #[test]
    fn test_packed_array_without_hole_check() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::objects(ObjectKind::PackedArray))
            .with_arg(1, TypeSet::of(TypeFlags::INT32));
        let code = compile(&get(Instruction::GetArg { idx: ArgIndex(1) }), &oracle);
        assert_eq!(count(&code, |i| matches!(i, Inst::BranchElementHole { .. })), 0);
        assert_eq!(count(&code, |i| matches!(i, Inst::LoadElement { .. })), 0);
        let load = code
            .insts
            .iter()
            .position(|i| matches!(i, Inst::LoadPackedElement { .. }))
            .expect("packed load");
        assert!(code.insts[load].target().is_some_and(|t| t != UNLINKED));
        // The result may be undefined, so misses are guarded by the epoch.
        assert_eq!(count(&code, |i| matches!(i, Inst::BranchPrototypeEpoch { .. })), 1);
    }

    #[test]
    fn test_hoisted_bounds_check() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::objects(ObjectKind::PackedArray))
            .with_arg(1, TypeSet::of(TypeFlags::INT32));
        let mut hoister = HoistTable::new().allow(2, Container::Arg(0));
        let code = compile_with(&get(Instruction::GetArg { idx: ArgIndex(1) }), &oracle, &mut hoister);
        assert_eq!(hoister.queries, vec![(2, Container::Arg(0), 0)]);
        assert_eq!(count(&code, |i| matches!(i, Inst::BranchArrayExtent { .. })), 0);
    }

    #[test]
    fn test_negative_constant_key_is_generic() {
        let code = compile(&get(Instruction::Int32 { value: -1 }), &OracleTable::new());
        assert!(code.ics.is_empty());
        assert_eq!(code.fast_call_count(), 1);
    }

    #[test]
    fn test_constant_key_ic() {
        let code = compile(&get(Instruction::Int32 { value: 3 }), &OracleTable::new());
        assert_eq!(code.ics[0].key, IcKey::Constant(3));
    }

    #[test]
    fn test_dense_setelem_has_an_extension_path() {
        let oracle = OracleTable::new()
            .with_arg(0, TypeSet::objects(ObjectKind::DenseArray))
            .with_arg(1, TypeSet::of(TypeFlags::INT32));
        let code = compile(&set(), &oracle);
        assert!(code.ics.is_empty());
        let slow = &code.insts[code.fast_len as usize..];
        assert!(slow.iter().any(|i| matches!(
            i,
            Inst::StoreObjField { field: ObjectField::InitializedLength, .. }
        )));
        assert!(slow.iter().any(|i| matches!(
            i,
            Inst::BranchArrayExtent { field: ObjectField::Capacity, .. }
        )));
        assert_eq!(count(&code, |i| matches!(i, Inst::StoreElement { .. })), 2);
    }

    #[test]
    fn test_setelem_ic_records_the_value() {
        let code = compile(&set(), &OracleTable::new());
        let ic = code.ics[0];
        assert_eq!(ic.kind, IcKind::SetElem);
        assert!(matches!(ic.value, Some(ValueSource::Regs { .. })));
        assert_eq!(ic.result, None);
    }

    #[test]
    fn test_string_key_jumps_to_the_slow_path() {
        let oracle = OracleTable::new().with_arg(1, TypeSet::of(TypeFlags::STRING));
        let code = compile(&get(Instruction::GetArg { idx: ArgIndex(1) }), &oracle);
        let ic = code.ics[0];
        assert!(matches!(ic.key, IcKey::Reg { tag: None, known_tag: Some(t), .. } if t == Tag::String as u64));
        assert_eq!(count(&code, |i| matches!(i, Inst::LoadElement { .. })), 0);
    }
}
