//! Hidden classes (shapes) for named-slot layout.
//!
//! A shape records which property names an object has and at which slot each
//! lives. Objects that gained the same properties in the same order share a
//! shape through a transition tree, so a shape id is enough to prove a slot
//! layout.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::value::StrId;

/// Index of a shape in the [`ShapeTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShapeId(pub u32);

impl ShapeId {
    /// The shape with no properties
    pub const EMPTY: ShapeId = ShapeId(0);
}

struct Shape {
    /// Every property in slot order, inherited ones included
    keys: Vec<StrId>,
    slots: FxHashMap<StrId, u32>,
}

/// Arena of shapes plus their transitions
pub struct ShapeTree {
    shapes: Vec<Shape>,
    transitions: FxHashMap<(ShapeId, StrId), ShapeId>,
}

impl Default for ShapeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeTree {
    /// Create a tree holding only the empty shape
    pub fn new() -> Self {
        Self {
            shapes: vec![Shape {
                keys: Vec::new(),
                slots: FxHashMap::default(),
            }],
            transitions: FxHashMap::default(),
        }
    }

    /// Find the transition for adding `key` to `from`, or create it.
    pub fn transition(&mut self, from: ShapeId, key: StrId) -> ShapeId {
        if let Some(&to) = self.transitions.get(&(from, key)) {
            return to;
        }

        let parent = &self.shapes[from.0 as usize];
        let mut keys = parent.keys.clone();
        let mut slots = parent.slots.clone();
        slots.insert(key, keys.len() as u32);
        keys.push(key);

        let to = ShapeId(self.shapes.len() as u32);
        self.shapes.push(Shape { keys, slots });
        self.transitions.insert((from, key), to);
        to
    }

    /// Shape reached by adding `keys` in order to the empty shape
    pub fn shape_for(&mut self, keys: &[StrId]) -> ShapeId {
        keys.iter()
            .fold(ShapeId::EMPTY, |shape, &key| self.transition(shape, key))
    }

    /// Slot of `key` in `shape`
    pub fn lookup(&self, shape: ShapeId, key: StrId) -> Option<u32> {
        self.shapes
            .get(shape.0 as usize)
            .and_then(|s| s.slots.get(&key).copied())
    }

    /// Number of slots objects of `shape` carry
    pub fn slot_count(&self, shape: ShapeId) -> u32 {
        self.shapes
            .get(shape.0 as usize)
            .map_or(0, |s| s.keys.len() as u32)
    }

    /// Property names of `shape`, in slot order
    pub fn keys(&self, shape: ShapeId) -> &[StrId] {
        self.shapes
            .get(shape.0 as usize)
            .map_or(&[], |s| s.keys.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_shared() {
        let mut tree = ShapeTree::new();
        let a = StrId(1);
        let b = StrId(2);
        let ab = tree.shape_for(&[a, b]);
        let ab_again = tree.shape_for(&[a, b]);
        let ba = tree.shape_for(&[b, a]);
        assert_eq!(ab, ab_again);
        assert_ne!(ab, ba);
        assert_eq!(tree.lookup(ab, b), Some(1));
        assert_eq!(tree.lookup(ba, b), Some(0));
        assert_eq!(tree.slot_count(ab), 2);
        assert_eq!(tree.lookup(ShapeId::EMPTY, a), None);
    }
}
