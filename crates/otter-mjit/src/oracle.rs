//! Type facts supplied by an external inference engine, and the loop hoister.
//!
//! The compiler never trusts a fact it cannot check at run time unless the
//! oracle marks it as monitored; everything else is guarded.

use bitflags::bitflags;
use otter_mjit_bytecode::{ArgIndex, LocalIndex};
use otter_mjit_runtime::{Tag, Value};
use rustc_hash::FxHashMap;

use crate::frame::KnownType;

bitflags! {
    /// Primitive type lattice of a value
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u8 {
        /// `undefined`
        const UNDEFINED = 1 << 0;
        /// `null`
        const NULL = 1 << 1;
        /// boolean
        const BOOLEAN = 1 << 2;
        /// int32 number
        const INT32 = 1 << 3;
        /// non-int32 number
        const DOUBLE = 1 << 4;
        /// string
        const STRING = 1 << 5;
        /// object
        const OBJECT = 1 << 6;
        /// any number
        const NUMBER = Self::INT32.bits() | Self::DOUBLE.bits();
    }
}

/// What the oracle knows about the objects a value may be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ObjectKind {
    /// Nothing
    #[default]
    Unknown,
    /// Only dense arrays
    DenseArray,
    /// Only dense arrays without holes below their initialized length
    PackedArray,
    /// Only ordinary objects
    Plain,
    /// Only typed arrays
    TypedArray,
}

impl ObjectKind {
    /// Dense or packed arrays
    pub const fn is_dense_array(self) -> bool {
        matches!(self, Self::DenseArray | Self::PackedArray)
    }
}

/// Possible types of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeSet {
    /// Primitive types
    pub flags: TypeFlags,
    /// Object facts, meaningful when `flags` is `OBJECT`
    pub object_kind: ObjectKind,
}

impl Default for TypeSet {
    fn default() -> Self {
        Self::unknown()
    }
}

impl TypeSet {
    /// No information
    pub const fn unknown() -> Self {
        Self {
            flags: TypeFlags::all(),
            object_kind: ObjectKind::Unknown,
        }
    }

    /// Exactly these primitive types
    pub const fn of(flags: TypeFlags) -> Self {
        Self {
            flags,
            object_kind: ObjectKind::Unknown,
        }
    }

    /// Objects of one kind
    pub const fn objects(kind: ObjectKind) -> Self {
        Self {
            flags: TypeFlags::OBJECT,
            object_kind: kind,
        }
    }

    /// Nothing is known
    pub fn is_unknown(self) -> bool {
        self.flags == TypeFlags::all()
    }

    /// The single type every value in the set has, if any
    ///
    /// Int32 plus double collapses to `Double`, which means "some number".
    pub fn known_type(self) -> KnownType {
        match self.flags {
            f if f == TypeFlags::INT32 => KnownType::Int32,
            f if f == TypeFlags::DOUBLE || f == TypeFlags::NUMBER => KnownType::Double,
            f if f == TypeFlags::BOOLEAN => KnownType::Boolean,
            f if f == TypeFlags::STRING => KnownType::String,
            f if f == TypeFlags::NULL => KnownType::Null,
            f if f == TypeFlags::UNDEFINED => KnownType::Undefined,
            f if f == TypeFlags::OBJECT => KnownType::Object,
            _ => KnownType::Unknown,
        }
    }

    /// Could a value of this set carry `tag`
    pub fn might_be(self, tag: Tag) -> bool {
        let flag = match tag {
            Tag::Double => TypeFlags::DOUBLE,
            Tag::Int32 => TypeFlags::INT32,
            Tag::Undefined => TypeFlags::UNDEFINED,
            Tag::Boolean => TypeFlags::BOOLEAN,
            Tag::String => TypeFlags::STRING,
            Tag::Null => TypeFlags::NULL,
            Tag::Object => TypeFlags::OBJECT,
            Tag::Magic => return false,
        };
        self.flags.contains(flag)
    }

    /// Does `value` belong to the set
    pub fn contains_value(self, value: Value) -> bool {
        match value {
            Value::Double(d) if Value::number(d).tag() == Tag::Int32 => {
                self.flags.intersects(TypeFlags::NUMBER)
            }
            other => self.might_be(other.tag()),
        }
    }

    /// Set for a statically known type
    pub fn for_known(ty: KnownType) -> Self {
        let flags = match ty {
            KnownType::Unknown => TypeFlags::all(),
            KnownType::Int32 => TypeFlags::INT32,
            KnownType::Double => TypeFlags::NUMBER,
            KnownType::Boolean => TypeFlags::BOOLEAN,
            KnownType::String => TypeFlags::STRING,
            KnownType::Null => TypeFlags::NULL,
            KnownType::Undefined => TypeFlags::UNDEFINED,
            KnownType::Object => TypeFlags::OBJECT,
        };
        Self::of(flags)
    }
}

/// Type facts for one function
pub trait TypeOracle {
    /// Types of the values the instruction at `pc` pushes
    fn pushed_types(&self, pc: u32) -> TypeSet;
    /// Types a local may hold anywhere in the function
    fn local_types(&self, local: LocalIndex) -> TypeSet;
    /// Types an argument may hold anywhere in the function
    fn arg_types(&self, arg: ArgIndex) -> TypeSet;
    /// Whether the result at `pc` is monitored, so a stub observing a type
    /// outside [`TypeOracle::pushed_types`] triggers recompilation instead of
    /// being trusted
    fn monitored(&self, pc: u32) -> bool;
}

/// Oracle that knows nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTypeInfo;

impl TypeOracle for NoTypeInfo {
    fn pushed_types(&self, _pc: u32) -> TypeSet {
        TypeSet::unknown()
    }

    fn local_types(&self, _local: LocalIndex) -> TypeSet {
        TypeSet::unknown()
    }

    fn arg_types(&self, _arg: ArgIndex) -> TypeSet {
        TypeSet::unknown()
    }

    fn monitored(&self, _pc: u32) -> bool {
        false
    }
}

/// Oracle backed by explicit tables; absent entries are unknown
#[derive(Debug, Clone, Default)]
pub struct OracleTable {
    pushed: FxHashMap<u32, TypeSet>,
    locals: FxHashMap<u16, TypeSet>,
    args: FxHashMap<u16, TypeSet>,
    monitored: FxHashMap<u32, bool>,
}

impl OracleTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result types of `pc`
    pub fn with_pushed(mut self, pc: u32, types: TypeSet) -> Self {
        self.pushed.insert(pc, types);
        self
    }

    /// Record the types of a local
    pub fn with_local(mut self, local: u16, types: TypeSet) -> Self {
        self.locals.insert(local, types);
        self
    }

    /// Record the types of an argument
    pub fn with_arg(mut self, arg: u16, types: TypeSet) -> Self {
        self.args.insert(arg, types);
        self
    }

    /// Mark the result of `pc` as monitored
    pub fn with_monitored(mut self, pc: u32) -> Self {
        self.monitored.insert(pc, true);
        self
    }
}

impl TypeOracle for OracleTable {
    fn pushed_types(&self, pc: u32) -> TypeSet {
        self.pushed.get(&pc).copied().unwrap_or_default()
    }

    fn local_types(&self, local: LocalIndex) -> TypeSet {
        self.locals.get(&local.index()).copied().unwrap_or_default()
    }

    fn arg_types(&self, arg: ArgIndex) -> TypeSet {
        self.args.get(&arg.index()).copied().unwrap_or_default()
    }

    fn monitored(&self, pc: u32) -> bool {
        self.monitored.get(&pc).copied().unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Loop hoisting
// ---------------------------------------------------------------------------

/// Variable holding the container of an element access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Container {
    /// A local
    Local(u16),
    /// An argument
    Arg(u16),
}

/// Answers whether a bounds check can move to the loop preheader
pub trait LoopHoister {
    /// Hoist `index < initialized_length(container)` at `pc`, where the index
    /// is an int32 loop-invariant-bumped by `bump`
    ///
    /// On success the returned container is guaranteed to be invariant
    /// across the loop and the check already holds for every iteration, so
    /// the element access may skip its own bounds test.
    fn hoist_array_length_check(&mut self, pc: u32, container: Container, bump: i32) -> Option<Container>;
}

/// Hoister that never hoists
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHoisting;

impl LoopHoister for NoHoisting {
    fn hoist_array_length_check(&mut self, _pc: u32, _container: Container, _bump: i32) -> Option<Container> {
        None
    }
}

/// Hoister answering from a table of `(pc, container)` pairs
#[derive(Debug, Clone, Default)]
pub struct HoistTable {
    checks: FxHashMap<(u32, Container), Container>,
    /// Every query received, in order
    pub queries: Vec<(u32, Container, i32)>,
}

impl HoistTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow hoisting the check at `pc` on `container`
    pub fn allow(mut self, pc: u32, container: Container) -> Self {
        self.checks.insert((pc, container), container);
        self
    }
}

impl LoopHoister for HoistTable {
    fn hoist_array_length_check(&mut self, pc: u32, container: Container, bump: i32) -> Option<Container> {
        self.queries.push((pc, container, bump));
        self.checks.get(&(pc, container)).copied()
    }
}
