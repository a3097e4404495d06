//! # Otter method-JIT runtime
//!
//! The value model, heap and generic operations that compiled code falls back
//! to. Values live in memory as a tag word plus a payload word ([`RawValue`]);
//! the tag layout is shared with the JIT's type guards.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod heap;
pub mod ops;
pub mod shape;
pub mod value;

pub use error::{RuntimeError, RuntimeResult};
pub use heap::{Heap, JsObject, ObjectClass, ObjectField};
pub use shape::{ShapeId, ShapeTree};
pub use value::{JsType, ObjId, RawValue, StrId, Tag, Value};
