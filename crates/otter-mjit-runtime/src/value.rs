//! JavaScript values as tag + payload pairs
//!
//! Every value slot in a frame, every element and every named slot is two
//! 64-bit words: a tag and a payload. Compiled code tests the tag word
//! directly, so the numbering matters.
//!
//! ## Encoding Scheme
//!
//! ```text
//! tag  name        payload
//!  0   Double      f64 bits
//!  1   Int32       i32, zero-extended
//!  2   Undefined   0
//!  3   Boolean     0 or 1
//!  4   Magic       0 (array hole)
//!  5   String      string handle
//!  6   Null        0
//!  7   Object      object handle
//!
//! number     <=> tag <= Int32
//! primitive  <=> tag <  Object
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{RuntimeError, RuntimeResult};

/// Value tag word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    /// IEEE double
    Double = 0,
    /// 32-bit signed integer
    Int32 = 1,
    /// `undefined`
    Undefined = 2,
    /// `true` / `false`
    Boolean = 3,
    /// Internal marker, only ever an array hole
    Magic = 4,
    /// Interned string
    String = 5,
    /// `null`
    Null = 6,
    /// Heap object
    Object = 7,
}

impl Tag {
    /// Decode a tag word
    pub fn from_bits(bits: u64) -> Option<Self> {
        Some(match bits {
            0 => Self::Double,
            1 => Self::Int32,
            2 => Self::Undefined,
            3 => Self::Boolean,
            4 => Self::Magic,
            5 => Self::String,
            6 => Self::Null,
            7 => Self::Object,
            _ => return None,
        })
    }

    /// The tag word
    #[inline]
    pub const fn bits(self) -> u64 {
        self as u64
    }

    /// Highest tag that is a number
    pub const NUMBER_MAX: Tag = Tag::Int32;
}

/// Handle to an interned string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StrId(pub u32);

/// Handle to a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ObjId(pub u32);

/// A value as stored in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawValue {
    /// Tag word
    pub tag: u64,
    /// Payload word
    pub payload: u64,
}

impl RawValue {
    /// The array hole marker
    pub const HOLE: RawValue = RawValue {
        tag: Tag::Magic as u64,
        payload: 0,
    };

    /// `undefined`
    pub const UNDEFINED: RawValue = RawValue {
        tag: Tag::Undefined as u64,
        payload: 0,
    };

    /// Build from parts
    #[inline]
    pub const fn new(tag: Tag, payload: u64) -> Self {
        Self {
            tag: tag as u64,
            payload,
        }
    }

    /// Is this the hole marker
    #[inline]
    pub fn is_hole(self) -> bool {
        self.tag == Tag::Magic as u64
    }

    /// Decode into a value
    pub fn decode(self) -> RuntimeResult<Value> {
        let tag = Tag::from_bits(self.tag).ok_or(RuntimeError::InvalidTag(self.tag))?;
        Ok(match tag {
            Tag::Double => Value::Double(f64::from_bits(self.payload)),
            Tag::Int32 => Value::Int32(self.payload as u32 as i32),
            Tag::Undefined => Value::Undefined,
            Tag::Boolean => Value::Boolean(self.payload & 1 != 0),
            Tag::Magic => return Err(RuntimeError::UnexpectedHole),
            Tag::String => Value::String(StrId(self.payload as u32)),
            Tag::Null => Value::Null,
            Tag::Object => Value::Object(ObjId(self.payload as u32)),
        })
    }
}

impl Default for RawValue {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

/// Result of the `typeof` operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JsType {
    /// `"undefined"`
    Undefined,
    /// `"object"` (also `null`)
    Object,
    /// `"boolean"`
    Boolean,
    /// `"number"`
    Number,
    /// `"string"`
    String,
    /// `"function"`
    Function,
}

impl JsType {
    /// All type names, in a fixed order
    pub const ALL: [JsType; 6] = [
        JsType::Undefined,
        JsType::Object,
        JsType::Boolean,
        JsType::Number,
        JsType::String,
        JsType::Function,
    ];

    /// Type name as returned by `typeof`
    pub const fn name(self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Object => "object",
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::Function => "function",
        }
    }

    /// Parse a type name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

/// A decoded JavaScript value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Boolean(bool),
    /// 32-bit integer number
    Int32(i32),
    /// Double number
    Double(f64),
    /// Interned string
    String(StrId),
    /// Heap object
    Object(ObjId),
}

impl Value {
    /// Build a number, preferring the int32 representation when exact
    ///
    /// `-0.0` stays a double.
    pub fn number(n: f64) -> Self {
        let i = n as i32;
        if i as f64 == n && !(n == 0.0 && n.is_sign_negative()) {
            Value::Int32(i)
        } else {
            Value::Double(n)
        }
    }

    /// The value's tag
    pub const fn tag(&self) -> Tag {
        match self {
            Value::Undefined => Tag::Undefined,
            Value::Null => Tag::Null,
            Value::Boolean(_) => Tag::Boolean,
            Value::Int32(_) => Tag::Int32,
            Value::Double(_) => Tag::Double,
            Value::String(_) => Tag::String,
            Value::Object(_) => Tag::Object,
        }
    }

    /// Encode for memory
    pub fn to_raw(self) -> RawValue {
        let payload = match self {
            Value::Undefined | Value::Null => 0,
            Value::Boolean(b) => b as u64,
            Value::Int32(i) => i as u32 as u64,
            Value::Double(d) => d.to_bits(),
            Value::String(s) => s.0 as u64,
            Value::Object(o) => o.0 as u64,
        };
        RawValue::new(self.tag(), payload)
    }

    /// Is this a number (int32 or double)
    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int32(_) | Value::Double(_))
    }

    /// Numeric value, if this is a number
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int32(i) => Some(i as f64),
            Value::Double(d) => Some(d),
            _ => None,
        }
    }

    /// Object handle, if this is an object
    #[inline]
    pub fn as_object(&self) -> Option<ObjId> {
        match *self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// `typeof` without touching the heap
    pub const fn js_type(&self) -> JsType {
        match self {
            Value::Undefined => JsType::Undefined,
            Value::Null | Value::Object(_) => JsType::Object,
            Value::Boolean(_) => JsType::Boolean,
            Value::Int32(_) | Value::Double(_) => JsType::Number,
            Value::String(_) => JsType::String,
        }
    }

    /// Observable identity: same `typeof`, numbers compared by value
    /// (NaN equals NaN, `+0` differs from `-0`), everything else by handle
    pub fn same_value(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => {
                (a.is_nan() && b.is_nan())
                    || (a == b && a.is_sign_negative() == b.is_sign_negative())
            }
            (None, None) => self == other,
            _ => false,
        }
    }
}
