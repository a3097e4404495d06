//! Element inline caches.
//!
//! An element access that cannot be proven dense at compile time gets an IC:
//! an inline dense-array fast path behind a class guard, plus a slow path
//! that calls the IC stub. The stub runs the generic operation and may
//! attach a specialization for the shape it saw (a typed-array class or a
//! named slot). Attached specializations are consulted when the class guard
//! fails, before the slow path. Past the configured cap the IC turns
//! megamorphic and the class guard is redirected straight to the slow path.
//!
//! The compiled instructions never change; patching is modelled by the
//! mutable [`IcPatchState`] the executor consults at the patch points
//! recorded in [`IcLayout`].

use otter_mjit_runtime::ops::{self, PropertyKey};
use otter_mjit_runtime::{
    Heap, ObjId, ObjectClass, RawValue, RuntimeResult, ShapeId, StrId, Value,
};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::assembler::{CodeOffset, ValueSource};
use crate::regs::{Reg, RegMask};

/// Index of an IC within its compiled function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IcId(pub u32);

/// Operation an IC caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcKind {
    /// `obj[key]`
    GetElem,
    /// `obj[key] = value`
    SetElem,
}

/// Where the key lives at the class guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcKey {
    /// Constant int32
    Constant(i32),
    /// Register payload; `tag` is `None` when the key type is known
    Reg {
        /// Tag register, if the tag is not static
        tag: Option<Reg>,
        /// Payload register
        payload: Reg,
        /// Static tag when `tag` is `None`
        known_tag: Option<u64>,
    },
}

/// Patch points and register assignment of one IC site
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IcLayout {
    /// Which operation
    pub kind: IcKind,
    /// Bytecode pc
    pub pc: u32,
    /// Start of the inline fast path
    pub fast_path_start: CodeOffset,
    /// The class guard; attached stubs are probed when it fails
    pub clasp_guard: CodeOffset,
    /// Where control resumes after the fast path or an attached stub
    pub fast_path_rejoin: CodeOffset,
    /// First instruction of the slow path
    pub slow_path_start: CodeOffset,
    /// Register holding the object payload
    pub obj: Reg,
    /// Key location
    pub key: IcKey,
    /// Value being stored, for `SetElem`
    pub value: Option<ValueSource>,
    /// Result registers `(tag, payload)`, for `GetElem`
    pub result: Option<(Reg, Reg)>,
    /// Registers the slow-path call must preserve
    pub preserved: RegMask,
}

/// A specialization an IC stub may attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementStub {
    /// In-bounds typed-array access
    TypedArray {
        /// Guarded class
        class: ObjectClass,
    },
    /// Named own slot on objects of one shape
    NamedSlot {
        /// Guarded shape
        shape: ShapeId,
        /// Guarded key
        key: StrId,
        /// Slot index
        slot: u32,
    },
}

/// Outcome of trying to attach a stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Added
    Attached,
    /// An identical stub was already attached
    AlreadyAttached,
    /// The cap was reached; the IC is now megamorphic
    WentMegamorphic,
    /// Megamorphic ICs attach nothing
    Megamorphic,
}

/// Where an IC is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IcState {
    /// Only the inline fast path
    Speculative,
    /// One or more attached specializations
    Polymorphic,
    /// Every access takes the slow path
    Megamorphic,
}

/// Run-time patch state of one IC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcPatchState {
    /// Attached specializations, probed in order
    pub stubs: SmallVec<[ElementStub; 4]>,
    /// The fast-path start jumps straight to the slow path
    pub megamorphic: bool,
    /// Bumped on every patch
    pub version: u32,
}

impl IcPatchState {
    /// Current state
    pub fn state(&self) -> IcState {
        if self.megamorphic {
            IcState::Megamorphic
        } else if self.stubs.is_empty() {
            IcState::Speculative
        } else {
            IcState::Polymorphic
        }
    }

    /// Attach `stub` unless present; go megamorphic past `cap`
    pub fn attach(&mut self, stub: ElementStub, cap: u32) -> AttachOutcome {
        if self.megamorphic {
            return AttachOutcome::Megamorphic;
        }
        if self.stubs.contains(&stub) {
            return AttachOutcome::AlreadyAttached;
        }
        self.version += 1;
        if self.stubs.len() as u32 >= cap {
            self.stubs.clear();
            self.megamorphic = true;
            return AttachOutcome::WentMegamorphic;
        }
        self.stubs.push(stub);
        AttachOutcome::Attached
    }
}

/// Specialization matching this access, if one applies
pub fn choose_stub(heap: &mut Heap, obj: Value, key: Value) -> RuntimeResult<Option<ElementStub>> {
    let Value::Object(id) = obj else {
        return Ok(None);
    };
    let class = heap.object(id)?.class;
    if class.is_typed_array() && matches!(key, Value::Int32(i) if i >= 0) {
        return Ok(Some(ElementStub::TypedArray { class }));
    }
    if class != ObjectClass::Plain {
        return Ok(None);
    }
    let PropertyKey::Name(name) = ops::to_property_key(heap, key)? else {
        return Ok(None);
    };
    let object = heap.object(id)?;
    // Only existing slots are cached; adding a property changes the shape.
    Ok(heap
        .shapes
        .lookup(object.shape, name)
        .map(|slot| ElementStub::NamedSlot {
            shape: object.shape,
            key: name,
            slot,
        }))
}

fn stub_matches(heap: &Heap, stub: ElementStub, id: ObjId, key: Value) -> RuntimeResult<Option<usize>> {
    let object = heap.object(id)?;
    Ok(match (stub, key) {
        (ElementStub::TypedArray { class }, Value::Int32(i))
            if object.class == class && i >= 0 && (i as u32) < object.length =>
        {
            Some(i as usize)
        }
        (ElementStub::NamedSlot { shape, key: name, slot }, Value::String(s))
            if object.shape == shape && s == name =>
        {
            Some(slot as usize)
        }
        _ => None,
    })
}

/// Read through the first matching stub
pub fn probe_get(heap: &Heap, stubs: &[ElementStub], id: ObjId, key: Value) -> RuntimeResult<Option<RawValue>> {
    for &stub in stubs {
        if let Some(index) = stub_matches(heap, stub, id, key)? {
            let object = heap.object(id)?;
            return Ok(match stub {
                ElementStub::TypedArray { .. } => object.elements.get(index).copied(),
                ElementStub::NamedSlot { .. } => object.slots.get(index).copied(),
            });
        }
    }
    Ok(None)
}

/// Write through the first matching stub; false if none matched
pub fn probe_set(heap: &mut Heap, stubs: &[ElementStub], id: ObjId, key: Value, value: Value) -> RuntimeResult<bool> {
    for &stub in stubs {
        let Some(index) = stub_matches(heap, stub, id, key)? else {
            continue;
        };
        let stored = match stub {
            ElementStub::TypedArray { class: ObjectClass::Int32Array } => {
                Value::Int32(ops::value_to_int32(heap, value)?)
            }
            ElementStub::TypedArray { .. } => Value::Double(ops::to_number(heap, value)?),
            ElementStub::NamedSlot { .. } => value,
        };
        let object = heap.object_mut(id)?;
        let target = match stub {
            ElementStub::TypedArray { .. } => object.elements.get_mut(index),
            ElementStub::NamedSlot { .. } => object.slots.get_mut(index),
        };
        if let Some(slot) = target {
            *slot = stored.to_raw();
            return Ok(true);
        }
    }
    Ok(false)
}
