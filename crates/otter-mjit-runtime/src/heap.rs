//! Object and string heap.
//!
//! Objects carry named slots (laid out by their shape) and an element vector.
//! For arrays the element vector is the dense backing store: its length is
//! the capacity, the first `initialized_length` entries are initialized (holes
//! allowed), and `length` is the externally visible `length` property.
//! Typed arrays keep their elements in the same vector, always fully
//! initialized.
//!
//! The array prototype may carry indexed properties. Adding one bumps the
//! prototype epoch so compiled code that assumed "holes read as undefined"
//! can notice.

use otter_mjit_bytecode::{Constant, Function};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};
use crate::shape::{ShapeId, ShapeTree};
use crate::value::{JsType, ObjId, RawValue, StrId, Value};

/// Largest capacity a dense array may grow to through element writes
pub const MAX_DENSE_CAPACITY: u32 = 1 << 24;

/// Object class, the part of an object the class guard tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectClass {
    /// Ordinary object
    Plain,
    /// Dense array
    Array,
    /// `Int32Array`
    Int32Array,
    /// `Float64Array`
    Float64Array,
}

impl ObjectClass {
    /// Typed array classes
    pub const fn is_typed_array(self) -> bool {
        matches!(self, Self::Int32Array | Self::Float64Array)
    }
}

/// Per-object words compiled code may read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectField {
    /// Number of initialized element slots
    InitializedLength,
    /// Allocated element slots
    Capacity,
    /// Visible `length`
    Length,
}

/// A heap object
#[derive(Debug, Clone)]
pub struct JsObject {
    /// Class tested by class guards
    pub class: ObjectClass,
    /// Named slot layout
    pub shape: ShapeId,
    /// Named slots
    pub slots: Vec<RawValue>,
    /// Element storage; its length is the capacity
    pub elements: Vec<RawValue>,
    /// Initialized prefix of `elements`
    pub initialized_length: u32,
    /// Visible length
    pub length: u32,
}

impl JsObject {
    fn plain(shape: ShapeId, slot_count: u32) -> Self {
        Self {
            class: ObjectClass::Plain,
            shape,
            slots: vec![RawValue::UNDEFINED; slot_count as usize],
            elements: Vec::new(),
            initialized_length: 0,
            length: 0,
        }
    }

    /// Allocated element slots
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.elements.len() as u32
    }

    /// Read one of the per-object words
    pub fn field(&self, field: ObjectField) -> u32 {
        match field {
            ObjectField::InitializedLength => self.initialized_length,
            ObjectField::Capacity => self.capacity(),
            ObjectField::Length => self.length,
        }
    }

    /// Write one of the per-object words; capacity is not writable
    pub fn set_field(&mut self, field: ObjectField, value: u32) -> RuntimeResult<()> {
        match field {
            ObjectField::InitializedLength if value <= self.capacity() => {
                self.initialized_length = value
            }
            ObjectField::Length => self.length = value,
            _ => {
                return Err(RuntimeError::RangeError(format!(
                    "cannot set {field:?} to {value} (capacity {})",
                    self.capacity()
                )));
            }
        }
        Ok(())
    }

    /// No holes below the initialized length
    pub fn is_packed(&self) -> bool {
        self.elements[..self.initialized_length as usize]
            .iter()
            .all(|e| !e.is_hole())
    }
}

/// The heap: interned strings, objects, shapes and array-prototype facts
pub struct Heap {
    strings: Vec<Box<str>>,
    string_ids: FxHashMap<Box<str>, StrId>,
    objects: Vec<JsObject>,
    /// Shape transition tree
    pub shapes: ShapeTree,
    array_proto_elements: FxHashMap<u32, RawValue>,
    proto_epoch: u64,
    type_names: [StrId; 6],
    length_atom: StrId,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create an empty heap with the `typeof` names pre-interned
    pub fn new() -> Self {
        let mut heap = Self {
            strings: Vec::new(),
            string_ids: FxHashMap::default(),
            objects: Vec::new(),
            shapes: ShapeTree::new(),
            array_proto_elements: FxHashMap::default(),
            proto_epoch: 0,
            type_names: [StrId(0); 6],
            length_atom: StrId(0),
        };
        for (i, ty) in JsType::ALL.into_iter().enumerate() {
            heap.type_names[i] = heap.intern(ty.name());
        }
        heap.length_atom = heap.intern("length");
        heap
    }

    // ------------------------------------------------------------------
    // Strings
    // ------------------------------------------------------------------

    /// Intern a string; equal contents always get the same handle
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.into());
        self.string_ids.insert(s.into(), id);
        id
    }

    /// Handle of an already interned string
    pub fn lookup_string(&self, s: &str) -> Option<StrId> {
        self.string_ids.get(s).copied()
    }

    /// Contents of a string
    pub fn string(&self, id: StrId) -> RuntimeResult<&str> {
        self.strings
            .get(id.0 as usize)
            .map(|s| &**s)
            .ok_or(RuntimeError::InvalidString(id.0))
    }

    /// Interned `typeof` result name
    pub fn type_name(&self, ty: JsType) -> StrId {
        let idx = JsType::ALL.iter().position(|&t| t == ty).unwrap_or(0);
        self.type_names[idx]
    }

    /// Interned `"length"`
    pub fn length_atom(&self) -> StrId {
        self.length_atom
    }

    /// Intern every string constant of `function`
    ///
    /// Compiled code embeds string handles, so this must run before the
    /// function is compiled.
    pub fn link_function(&mut self, function: &Function) {
        for constant in function.constants.iter() {
            if let Constant::String(s) = constant {
                self.intern(s);
            }
        }
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    fn alloc(&mut self, object: JsObject) -> ObjId {
        let id = ObjId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    /// Object behind a handle
    pub fn object(&self, id: ObjId) -> RuntimeResult<&JsObject> {
        self.objects
            .get(id.0 as usize)
            .ok_or(RuntimeError::InvalidObject(id.0 as u64))
    }

    /// Mutable object behind a handle
    pub fn object_mut(&mut self, id: ObjId) -> RuntimeResult<&mut JsObject> {
        self.objects
            .get_mut(id.0 as usize)
            .ok_or(RuntimeError::InvalidObject(id.0 as u64))
    }

    /// Object behind a raw payload word
    pub fn object_at(&self, payload: u64) -> RuntimeResult<&JsObject> {
        let id = u32::try_from(payload).map_err(|_| RuntimeError::InvalidObject(payload))?;
        self.object(ObjId(id))
    }

    /// Mutable object behind a raw payload word
    pub fn object_at_mut(&mut self, payload: u64) -> RuntimeResult<&mut JsObject> {
        let id = u32::try_from(payload).map_err(|_| RuntimeError::InvalidObject(payload))?;
        self.object_mut(ObjId(id))
    }

    /// New empty ordinary object
    pub fn new_plain_object(&mut self) -> ObjId {
        self.alloc(JsObject::plain(ShapeId::EMPTY, 0))
    }

    /// New ordinary object laid out with `keys`, every slot `undefined`
    pub fn new_object_with_keys(&mut self, keys: &[StrId]) -> ObjId {
        let shape = self.shapes.shape_for(keys);
        let count = self.shapes.slot_count(shape);
        self.alloc(JsObject::plain(shape, count))
    }

    /// New array literal under construction: visible length `count`,
    /// capacity `count`, nothing initialized yet
    pub fn new_array_literal(&mut self, count: u32) -> RuntimeResult<ObjId> {
        if count > MAX_DENSE_CAPACITY {
            return Err(RuntimeError::RangeError(format!(
                "array literal of length {count} is too large"
            )));
        }
        Ok(self.alloc(JsObject {
            class: ObjectClass::Array,
            shape: ShapeId::EMPTY,
            slots: Vec::new(),
            elements: vec![RawValue::HOLE; count as usize],
            initialized_length: 0,
            length: count,
        }))
    }

    /// New packed array holding `values`, with room for `capacity` elements
    pub fn new_array_with_capacity(&mut self, values: &[Value], capacity: u32) -> ObjId {
        let capacity = capacity.max(values.len() as u32);
        let mut elements = vec![RawValue::HOLE; capacity as usize];
        for (slot, value) in elements.iter_mut().zip(values) {
            *slot = value.to_raw();
        }
        self.alloc(JsObject {
            class: ObjectClass::Array,
            shape: ShapeId::EMPTY,
            slots: Vec::new(),
            elements,
            initialized_length: values.len() as u32,
            length: values.len() as u32,
        })
    }

    /// New packed array holding exactly `values`
    pub fn new_array(&mut self, values: &[Value]) -> ObjId {
        self.new_array_with_capacity(values, values.len() as u32)
    }

    /// New zero-filled typed array
    pub fn new_typed_array(&mut self, class: ObjectClass, len: u32) -> RuntimeResult<ObjId> {
        let zero = match class {
            ObjectClass::Int32Array => Value::Int32(0),
            ObjectClass::Float64Array => Value::Double(0.0),
            _ => {
                return Err(RuntimeError::TypeError(format!(
                    "{class:?} is not a typed array class"
                )));
            }
        };
        Ok(self.alloc(JsObject {
            class,
            shape: ShapeId::EMPTY,
            slots: Vec::new(),
            elements: vec![zero.to_raw(); len as usize],
            initialized_length: len,
            length: len,
        }))
    }

    /// Grow the element store of `id` to at least `capacity` slots
    pub fn ensure_capacity(&mut self, id: ObjId, capacity: u32) -> RuntimeResult<()> {
        if capacity > MAX_DENSE_CAPACITY {
            return Err(RuntimeError::RangeError(format!(
                "element capacity {capacity} exceeds the dense limit"
            )));
        }
        let object = self.object_mut(id)?;
        if object.capacity() < capacity {
            let grown = capacity
                .max(object.capacity().saturating_mul(2))
                .max(8)
                .min(MAX_DENSE_CAPACITY);
            object.elements.resize(grown as usize, RawValue::HOLE);
        }
        Ok(())
    }

    /// Own named property of `id`
    pub fn get_named(&self, id: ObjId, key: StrId) -> RuntimeResult<Option<RawValue>> {
        let object = self.object(id)?;
        Ok(self
            .shapes
            .lookup(object.shape, key)
            .map(|slot| object.slots[slot as usize]))
    }

    /// Define or overwrite an own named property of `id`
    pub fn define_named(&mut self, id: ObjId, key: StrId, value: Value) -> RuntimeResult<()> {
        let shape = self.object(id)?.shape;
        let slot = match self.shapes.lookup(shape, key) {
            Some(slot) => slot,
            None => {
                let next = self.shapes.transition(shape, key);
                let object = self.object_mut(id)?;
                object.shape = next;
                object.slots.push(RawValue::UNDEFINED);
                object.slots.len() as u32 - 1
            }
        };
        self.object_mut(id)?.slots[slot as usize] = value.to_raw();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Array prototype
    // ------------------------------------------------------------------

    /// Invalidation epoch of array-prototype facts
    pub fn prototype_epoch(&self) -> u64 {
        self.proto_epoch
    }

    /// Whether reads of array holes can be intercepted by the prototype
    pub fn array_proto_has_indexed(&self) -> bool {
        !self.array_proto_elements.is_empty()
    }

    /// Indexed property of the array prototype
    pub fn array_proto_element(&self, index: u32) -> Option<RawValue> {
        self.array_proto_elements.get(&index).copied()
    }

    /// Add an indexed property to the array prototype
    pub fn set_array_proto_element(&mut self, index: u32, value: Value) {
        self.array_proto_elements.insert(index, value.to_raw());
        self.proto_epoch += 1;
        tracing::debug!(index, epoch = self.proto_epoch, "array prototype gained an indexed property");
    }
}
