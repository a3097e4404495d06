//! Tag checks emitted in front of specialized code.
//!
//! Every value carries a tag word whose numbering makes the common
//! categories single comparisons:
//!
//! ```text
//!   number     tag <= Int32
//!   primitive  tag <  Object
//! ```
//!
//! A guard jumps when its assumption does NOT hold, so the returned jump is
//! always an exit to be linked to a slow path.

use otter_mjit_runtime::{JsType, Tag};

use crate::assembler::{Cond, FrameSlot, JumpRef, Masm, Operand};
use crate::compiler::JitResult;
use crate::frame::{FrameState, KnownType};

/// Outcome of guarding a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    /// The assumption is statically true; nothing emitted
    Proven,
    /// The assumption is statically false
    Refuted,
    /// Emitted; the jump is taken when the assumption fails
    Exit(JumpRef),
}

impl Guard {
    /// The exit jump, if one was emitted
    pub(crate) fn exit(self) -> Option<JumpRef> {
        match self {
            Guard::Exit(jump) => Some(jump),
            Guard::Proven | Guard::Refuted => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw tag tests
// ---------------------------------------------------------------------------

/// Jump if the tag is `tag`
pub(crate) fn branch_tag_is(masm: &mut Masm, tag_op: Operand, tag: Tag) -> JumpRef {
    masm.branch32(Cond::Equal, tag_op, Operand::tag(tag))
}

/// Jump if the tag is not `tag`
pub(crate) fn branch_tag_is_not(masm: &mut Masm, tag_op: Operand, tag: Tag) -> JumpRef {
    masm.branch32(Cond::NotEqual, tag_op, Operand::tag(tag))
}

/// Jump if the tag is a number tag
pub(crate) fn branch_is_number(masm: &mut Masm, tag_op: Operand) -> JumpRef {
    masm.branch32(Cond::BelowOrEqual, tag_op, Operand::tag(Tag::NUMBER_MAX))
}

/// Jump if the tag is not a number tag
pub(crate) fn branch_is_not_number(masm: &mut Masm, tag_op: Operand) -> JumpRef {
    masm.branch32(Cond::Above, tag_op, Operand::tag(Tag::NUMBER_MAX))
}

// ---------------------------------------------------------------------------
// Slot guards
// ---------------------------------------------------------------------------

/// Exit unless `slot` carries `tag`
pub(crate) fn guard_tag(frame: &FrameState, slot: FrameSlot, tag: Tag, masm: &mut Masm) -> JitResult<Guard> {
    match frame.known_type(slot) {
        KnownType::Unknown => {
            let tag_op = frame.tag_operand(slot)?;
            Ok(Guard::Exit(branch_tag_is_not(masm, tag_op, tag)))
        }
        // A known number may be stored with either numeric tag.
        KnownType::Double if tag == Tag::Int32 => {
            let tag_op = Operand::Tag(frame.backing(slot));
            if frame.constant(slot).is_some() {
                return Ok(Guard::Refuted);
            }
            Ok(Guard::Exit(branch_tag_is_not(masm, tag_op, tag)))
        }
        ty if ty.tag() == Some(tag) => Ok(Guard::Proven),
        _ => Ok(Guard::Refuted),
    }
}

/// Exit unless `slot` is a number
pub(crate) fn guard_number(frame: &FrameState, slot: FrameSlot, masm: &mut Masm) -> JitResult<Guard> {
    match frame.known_type(slot) {
        KnownType::Unknown => {
            let tag_op = frame.tag_operand(slot)?;
            Ok(Guard::Exit(branch_is_not_number(masm, tag_op)))
        }
        ty if ty.is_number() => Ok(Guard::Proven),
        _ => Ok(Guard::Refuted),
    }
}

// ---------------------------------------------------------------------------
// typeof
// ---------------------------------------------------------------------------

/// Single tag test equivalent to `typeof x == name`
///
/// `object` and `function` need more than the tag (null is an object,
/// functions are objects), so they have no test.
pub(crate) fn typeof_tag_test(ty: JsType) -> Option<(Cond, Tag)> {
    match ty {
        JsType::Undefined => Some((Cond::Equal, Tag::Undefined)),
        JsType::Boolean => Some((Cond::Equal, Tag::Boolean)),
        JsType::String => Some((Cond::Equal, Tag::String)),
        JsType::Number => Some((Cond::BelowOrEqual, Tag::NUMBER_MAX)),
        JsType::Object | JsType::Function => None,
    }
}

/// `typeof` of a statically known type, when the type alone decides it
pub(crate) fn typeof_known(ty: KnownType) -> Option<JsType> {
    match ty {
        KnownType::Int32 | KnownType::Double => Some(JsType::Number),
        KnownType::Boolean => Some(JsType::Boolean),
        KnownType::String => Some(JsType::String),
        KnownType::Undefined => Some(JsType::Undefined),
        KnownType::Null => Some(JsType::Object),
        // Callable objects answer "function".
        KnownType::Object | KnownType::Unknown => None,
    }
}
