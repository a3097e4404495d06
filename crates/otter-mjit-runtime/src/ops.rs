//! Generic (type-agnostic) operations.
//!
//! These implement the full semantics of each operation for any operand
//! types. Compiled code calls them through stubs whenever a fast path does
//! not apply, and the reference mode of the compiler uses nothing else.

use crate::error::{RuntimeError, RuntimeResult};
use crate::heap::{Heap, ObjectClass};
use crate::value::{JsType, ObjId, RawValue, StrId, Value};

/// Relational operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOp {
    /// `|`
    Or,
    /// `&`
    And,
    /// `^`
    Xor,
    /// `<<`
    Lsh,
    /// `>>`
    Rsh,
    /// `>>>`
    Ursh,
}

impl BitOp {
    /// Apply to already converted operands
    ///
    /// Shift amounts use their low five bits. `>>>` produces an unsigned
    /// result and may need a double.
    pub fn apply(self, lhs: i32, rhs: i32) -> Value {
        let shift = (rhs as u32) & 31;
        match self {
            BitOp::Or => Value::Int32(lhs | rhs),
            BitOp::And => Value::Int32(lhs & rhs),
            BitOp::Xor => Value::Int32(lhs ^ rhs),
            BitOp::Lsh => Value::Int32(lhs.wrapping_shl(shift)),
            BitOp::Rsh => Value::Int32(lhs >> shift),
            BitOp::Ursh => Value::number(((lhs as u32) >> shift) as f64),
        }
    }
}

/// A property key after conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKey {
    /// Array index
    Index(u32),
    /// Any other key
    Name(StrId),
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// ECMAScript ToInt32 on a number
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let truncated = n.trunc();
    let modulo = truncated.rem_euclid(4294967296.0);
    modulo as u64 as u32 as i32
}

/// ECMAScript ToUint32 on a number
pub fn to_uint32(n: f64) -> u32 {
    to_int32(n) as u32
}

/// ToBoolean
pub fn to_boolean(heap: &Heap, value: Value) -> RuntimeResult<bool> {
    Ok(match value {
        Value::Undefined | Value::Null => false,
        Value::Boolean(b) => b,
        Value::Int32(i) => i != 0,
        Value::Double(d) => d != 0.0 && !d.is_nan(),
        Value::String(s) => !heap.string(s)?.is_empty(),
        Value::Object(_) => true,
    })
}

fn string_to_number(s: &str) -> f64 {
    let s = s.trim();
    if s.is_empty() {
        return 0.0;
    }
    let radix = |prefix: &str, radix: u32| {
        s.get(..2)
            .filter(|p| p.eq_ignore_ascii_case(prefix))
            .map(|_| u64::from_str_radix(&s[2..], radix).map_or(f64::NAN, |v| v as f64))
    };
    if let Some(n) = radix("0x", 16).or_else(|| radix("0o", 8)).or_else(|| radix("0b", 2)) {
        return n;
    }
    match s {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let numeric = s
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !numeric {
        return f64::NAN;
    }
    s.parse::<f64>().unwrap_or(f64::NAN)
}

/// Format a number the way `String(n)` does
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    if n == 0.0 {
        return "0".into();
    }
    let abs = n.abs();
    if (1e-6..1e21).contains(&abs) {
        return format!("{n}");
    }
    let formatted = format!("{n:e}");
    match formatted.split_once('e') {
        Some((mantissa, exp)) if !exp.starts_with('-') => format!("{mantissa}e+{exp}"),
        _ => formatted,
    }
}

fn array_join(heap: &Heap, id: ObjId, depth: u32) -> RuntimeResult<String> {
    let object = heap.object(id)?;
    let mut out = String::new();
    for i in 0..object.length {
        if i > 0 {
            out.push(',');
        }
        let raw = object
            .elements
            .get(i as usize)
            .copied()
            .filter(|_| i < object.initialized_length)
            .filter(|raw| !raw.is_hole())
            .or_else(|| heap.array_proto_element(i))
            .unwrap_or(RawValue::UNDEFINED);
        match raw.decode()? {
            Value::Undefined | Value::Null => {}
            v => out.push_str(&to_string_depth(heap, v, depth + 1)?),
        }
    }
    Ok(out)
}

fn to_string_depth(heap: &Heap, value: Value, depth: u32) -> RuntimeResult<String> {
    Ok(match value {
        Value::Undefined => "undefined".into(),
        Value::Null => "null".into(),
        Value::Boolean(b) => b.to_string(),
        Value::Int32(i) => i.to_string(),
        Value::Double(d) => number_to_string(d),
        Value::String(s) => heap.string(s)?.to_owned(),
        Value::Object(id) => match heap.object(id)?.class {
            ObjectClass::Plain => "[object Object]".into(),
            // Cyclic arrays print empty past a fixed depth.
            _ if depth > 16 => String::new(),
            _ => array_join(heap, id, depth)?,
        },
    })
}

/// ToString
pub fn to_string(heap: &Heap, value: Value) -> RuntimeResult<String> {
    to_string_depth(heap, value, 0)
}

/// ToPrimitive; objects have no user-defined `valueOf`, so they become
/// their string form
pub fn to_primitive(heap: &mut Heap, value: Value) -> RuntimeResult<Value> {
    match value {
        Value::Object(_) => {
            let s = to_string(heap, value)?;
            Ok(Value::String(heap.intern(&s)))
        }
        v => Ok(v),
    }
}

/// ToNumber
pub fn to_number(heap: &Heap, value: Value) -> RuntimeResult<f64> {
    Ok(match value {
        Value::Undefined => f64::NAN,
        Value::Null => 0.0,
        Value::Boolean(b) => b as u8 as f64,
        Value::Int32(i) => i as f64,
        Value::Double(d) => d,
        Value::String(s) => string_to_number(heap.string(s)?),
        Value::Object(_) => string_to_number(&to_string(heap, value)?),
    })
}

/// ToInt32 on any value
pub fn value_to_int32(heap: &Heap, value: Value) -> RuntimeResult<i32> {
    match value {
        Value::Int32(i) => Ok(i),
        v => Ok(to_int32(to_number(heap, v)?)),
    }
}

/// `typeof`
pub fn type_of(heap: &Heap, value: Value) -> StrId {
    heap.type_name(value.js_type())
}

// ---------------------------------------------------------------------------
// Equality and comparison
// ---------------------------------------------------------------------------

/// `===`
pub fn strict_equals(lhs: Value, rhs: Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        (None, None) => lhs == rhs,
        _ => false,
    }
}

/// `==`
pub fn loose_equals(heap: &mut Heap, lhs: Value, rhs: Value) -> RuntimeResult<bool> {
    use Value::*;
    if lhs.tag() == rhs.tag() || (lhs.is_number() && rhs.is_number()) {
        return Ok(strict_equals(lhs, rhs));
    }
    match (lhs, rhs) {
        (Undefined | Null, Undefined | Null) => Ok(true),
        (Undefined | Null, _) | (_, Undefined | Null) => Ok(false),
        (String(_), Int32(_) | Double(_)) | (Int32(_) | Double(_), String(_)) => {
            Ok(to_number(heap, lhs)? == to_number(heap, rhs)?)
        }
        (Boolean(b), other) => loose_equals(heap, Value::Int32(b as i32), other),
        (other, Boolean(b)) => loose_equals(heap, other, Value::Int32(b as i32)),
        (Object(_), _) => {
            let prim = to_primitive(heap, lhs)?;
            loose_equals(heap, prim, rhs)
        }
        (_, Object(_)) => {
            let prim = to_primitive(heap, rhs)?;
            loose_equals(heap, lhs, prim)
        }
        _ => Ok(false),
    }
}

/// `<`, `<=`, `>`, `>=`
pub fn compare(heap: &mut Heap, op: RelOp, lhs: Value, rhs: Value) -> RuntimeResult<bool> {
    let lhs = to_primitive(heap, lhs)?;
    let rhs = to_primitive(heap, rhs)?;
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        let ord = heap
            .string(a)?
            .encode_utf16()
            .cmp(heap.string(b)?.encode_utf16());
        return Ok(match op {
            RelOp::Lt => ord.is_lt(),
            RelOp::Le => ord.is_le(),
            RelOp::Gt => ord.is_gt(),
            RelOp::Ge => ord.is_ge(),
        });
    }
    let a = to_number(heap, lhs)?;
    let b = to_number(heap, rhs)?;
    Ok(match op {
        RelOp::Lt => a < b,
        RelOp::Le => a <= b,
        RelOp::Gt => a > b,
        RelOp::Ge => a >= b,
    })
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

/// `+`
pub fn add(heap: &mut Heap, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    if let (Value::Int32(a), Value::Int32(b)) = (lhs, rhs) {
        return Ok(match a.checked_add(b) {
            Some(sum) => Value::Int32(sum),
            None => Value::Double(a as f64 + b as f64),
        });
    }
    let lhs = to_primitive(heap, lhs)?;
    let rhs = to_primitive(heap, rhs)?;
    if matches!(lhs, Value::String(_)) || matches!(rhs, Value::String(_)) {
        let mut s = to_string(heap, lhs)?;
        s.push_str(&to_string(heap, rhs)?);
        return Ok(Value::String(heap.intern(&s)));
    }
    Ok(Value::number(to_number(heap, lhs)? + to_number(heap, rhs)?))
}

/// `-`
pub fn sub(heap: &Heap, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    if let (Value::Int32(a), Value::Int32(b)) = (lhs, rhs) {
        return Ok(match a.checked_sub(b) {
            Some(diff) => Value::Int32(diff),
            None => Value::Double(a as f64 - b as f64),
        });
    }
    Ok(Value::number(to_number(heap, lhs)? - to_number(heap, rhs)?))
}

/// Unary `+`
pub fn pos(heap: &Heap, value: Value) -> RuntimeResult<Value> {
    match value {
        Value::Int32(_) | Value::Double(_) => Ok(value),
        v => Ok(Value::number(to_number(heap, v)?)),
    }
}

/// Binary bitwise operators
pub fn bitop(heap: &Heap, op: BitOp, lhs: Value, rhs: Value) -> RuntimeResult<Value> {
    Ok(op.apply(value_to_int32(heap, lhs)?, value_to_int32(heap, rhs)?))
}

/// `~`
pub fn bitnot(heap: &Heap, value: Value) -> RuntimeResult<Value> {
    Ok(Value::Int32(!value_to_int32(heap, value)?))
}

/// `!`
pub fn not(heap: &Heap, value: Value) -> RuntimeResult<bool> {
    Ok(!to_boolean(heap, value)?)
}

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

/// Convert an element key
pub fn to_property_key(heap: &mut Heap, key: Value) -> RuntimeResult<PropertyKey> {
    match key {
        Value::Int32(i) if i >= 0 => return Ok(PropertyKey::Index(i as u32)),
        Value::Double(d) if d >= 0.0 && d < 4294967295.0 && d.fract() == 0.0 => {
            return Ok(PropertyKey::Index(d as u32));
        }
        Value::String(s) => {
            let text = heap.string(s)?;
            if let Ok(index) = text.parse::<u32>()
                && index != u32::MAX
                && index.to_string() == text
            {
                return Ok(PropertyKey::Index(index));
            }
            return Ok(PropertyKey::Name(s));
        }
        _ => {}
    }
    let text = to_string(heap, key)?;
    Ok(PropertyKey::Name(heap.intern(&text)))
}

fn index_name(heap: &mut Heap, index: u32) -> StrId {
    heap.intern(&index.to_string())
}

fn nullish_error(base: Value) -> RuntimeError {
    let name = if base == Value::Null { "null" } else { "undefined" };
    RuntimeError::TypeError(format!("cannot access an element of {name}"))
}

/// `base[key]`
pub fn get_elem(heap: &mut Heap, base: Value, key: Value) -> RuntimeResult<Value> {
    let key = match base {
        Value::Undefined | Value::Null => return Err(nullish_error(base)),
        _ => to_property_key(heap, key)?,
    };
    let id = match base {
        Value::Object(id) => id,
        Value::String(s) => {
            let text = heap.string(s)?.to_owned();
            return Ok(match key {
                PropertyKey::Index(i) => match text.encode_utf16().nth(i as usize) {
                    Some(unit) => {
                        let ch = String::from_utf16_lossy(&[unit]);
                        Value::String(heap.intern(&ch))
                    }
                    None => Value::Undefined,
                },
                PropertyKey::Name(n) if n == heap.length_atom() => {
                    Value::number(text.encode_utf16().count() as f64)
                }
                PropertyKey::Name(_) => Value::Undefined,
            });
        }
        _ => return Ok(Value::Undefined),
    };

    let object = heap.object(id)?;
    match (object.class, key) {
        (ObjectClass::Array, PropertyKey::Index(i)) => {
            let own = object
                .elements
                .get(i as usize)
                .copied()
                .filter(|_| i < object.initialized_length)
                .filter(|raw| !raw.is_hole());
            match own.or_else(|| heap.array_proto_element(i)) {
                Some(raw) => raw.decode(),
                None => Ok(Value::Undefined),
            }
        }
        (class, PropertyKey::Index(i)) if class.is_typed_array() => match object.elements.get(i as usize) {
            Some(raw) => raw.decode(),
            None => Ok(Value::Undefined),
        },
        (class, PropertyKey::Name(n)) if class != ObjectClass::Plain && n == heap.length_atom() => {
            Ok(Value::number(object.length as f64))
        }
        (_, PropertyKey::Name(n)) => match heap.get_named(id, n)? {
            Some(raw) => raw.decode(),
            None => Ok(Value::Undefined),
        },
        (_, PropertyKey::Index(i)) => {
            let name = index_name(heap, i);
            match heap.get_named(id, name)? {
                Some(raw) => raw.decode(),
                None => Ok(Value::Undefined),
            }
        }
    }
}

fn set_dense_element(heap: &mut Heap, id: ObjId, index: u32, value: Value) -> RuntimeResult<()> {
    if index >= heap.object(id)?.capacity() {
        heap.ensure_capacity(id, index + 1)?;
    }
    let object = heap.object_mut(id)?;
    if index >= object.initialized_length {
        // Anything skipped over stays a hole.
        object.initialized_length = index + 1;
    }
    object.elements[index as usize] = value.to_raw();
    if index >= object.length {
        object.length = index + 1;
    }
    Ok(())
}

fn set_array_length(heap: &mut Heap, id: ObjId, value: Value) -> RuntimeResult<()> {
    let n = to_number(heap, value)?;
    let len = to_uint32(n);
    if len as f64 != n {
        return Err(RuntimeError::RangeError("invalid array length".into()));
    }
    let object = heap.object_mut(id)?;
    if len < object.initialized_length {
        for slot in &mut object.elements[len as usize..object.initialized_length as usize] {
            *slot = RawValue::HOLE;
        }
        object.initialized_length = len;
    }
    object.length = len;
    Ok(())
}

/// `base[key] = value`
pub fn set_elem(heap: &mut Heap, base: Value, key: Value, value: Value) -> RuntimeResult<()> {
    let key = match base {
        Value::Undefined | Value::Null => return Err(nullish_error(base)),
        _ => to_property_key(heap, key)?,
    };
    let Value::Object(id) = base else {
        // Writes to primitives are dropped.
        return Ok(());
    };

    let class = heap.object(id)?.class;
    match (class, key) {
        (ObjectClass::Array, PropertyKey::Index(i)) => set_dense_element(heap, id, i, value),
        (ObjectClass::Array, PropertyKey::Name(n)) if n == heap.length_atom() => {
            set_array_length(heap, id, value)
        }
        (ObjectClass::Int32Array, PropertyKey::Index(i)) => {
            let converted = Value::Int32(value_to_int32(heap, value)?);
            if let Some(slot) = heap.object_mut(id)?.elements.get_mut(i as usize) {
                *slot = converted.to_raw();
            }
            Ok(())
        }
        (ObjectClass::Float64Array, PropertyKey::Index(i)) => {
            let converted = Value::Double(to_number(heap, value)?);
            if let Some(slot) = heap.object_mut(id)?.elements.get_mut(i as usize) {
                *slot = converted.to_raw();
            }
            Ok(())
        }
        (_, PropertyKey::Name(n)) => heap.define_named(id, n, value),
        (_, PropertyKey::Index(i)) => {
            let name = index_name(heap, i);
            heap.define_named(id, name, value)
        }
    }
}

/// Define `name` on an object literal under construction
pub fn init_prop(heap: &mut Heap, obj: Value, name: StrId, value: Value) -> RuntimeResult<()> {
    match obj {
        Value::Object(id) => heap.define_named(id, name, value),
        _ => Err(RuntimeError::TypeError("initializer target is not an object".into())),
    }
}

/// Define an element on a literal under construction
///
/// When this is the literal's last initializer the visible length covers it.
pub fn init_elem(
    heap: &mut Heap,
    obj: Value,
    key: Value,
    value: Value,
    is_last: bool,
) -> RuntimeResult<()> {
    let Value::Object(id) = obj else {
        return Err(RuntimeError::TypeError("initializer target is not an object".into()));
    };
    set_elem(heap, obj, key, value)?;
    if is_last
        && let PropertyKey::Index(i) = to_property_key(heap, key)?
    {
        let object = heap.object_mut(id)?;
        if object.class == ObjectClass::Array && object.length <= i {
            object.length = i + 1;
        }
    }
    Ok(())
}

/// The name a `typeof` result string denotes
pub fn type_from_name(heap: &Heap, name: StrId) -> Option<JsType> {
    heap.string(name).ok().and_then(JsType::from_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_to_int32() {
        assert_eq!(to_int32(5.0), 5);
        assert_eq!(to_int32(2147483648.0), -2147483648);
        assert_eq!(to_int32(4294967296.0 + 3.0), 3);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
    }

    #[test]
    fn test_shift_amount_is_masked() {
        assert_eq!(BitOp::Lsh.apply(1, 33), Value::Int32(2));
        assert_eq!(BitOp::Ursh.apply(-1, 0), Value::Double(4294967295.0));
        assert_eq!(BitOp::Ursh.apply(-1, 32), Value::Double(4294967295.0));
        assert_eq!(BitOp::Rsh.apply(-8, 1), Value::Int32(-4));
    }

    #[test]
    fn test_loose_equality() {
        let mut heap = Heap::new();
        let five = Value::String(heap.intern("5"));
        assert!(loose_equals(&mut heap, Value::Null, Value::Undefined).expect("eq"));
        assert!(!loose_equals(&mut heap, Value::Null, Value::Int32(0)).expect("eq"));
        assert!(loose_equals(&mut heap, five, Value::Double(5.0)).expect("eq"));
        assert!(loose_equals(&mut heap, Value::Boolean(true), Value::Int32(1)).expect("eq"));
        assert!(!loose_equals(&mut heap, Value::Double(f64::NAN), Value::Double(f64::NAN)).expect("eq"));
        let arr = heap.new_array(&[Value::Int32(5)]);
        assert!(loose_equals(&mut heap, Value::Object(arr), five).expect("eq"));
    }

    #[test]
    fn test_add_concatenates() {
        let mut heap = Heap::new();
        let s = Value::String(heap.intern("5"));
        let sum = add(&mut heap, s, Value::Int32(1)).expect("add");
        assert_eq!(sum, Value::String(heap.intern("51")));
        assert_eq!(
            add(&mut heap, Value::Int32(i32::MAX), Value::Int32(1)).expect("add"),
            Value::Double(2147483648.0)
        );
        assert_eq!(sub(&heap, s, Value::Int32(-1)).expect("sub"), Value::Int32(6));
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1e-7), "1e-7");
        assert_eq!(number_to_string(123.0), "123");
    }

    #[test]
    fn test_dense_array_writes() {
        let mut heap = Heap::new();
        let arr = heap.new_array(&[Value::Int32(1), Value::Int32(2)]);
        set_elem(&mut heap, Value::Object(arr), Value::Int32(2), Value::Int32(3)).expect("append");
        set_elem(&mut heap, Value::Object(arr), Value::Int32(5), Value::Int32(6)).expect("gap");
        let object = heap.object(arr).expect("live");
        assert_eq!(object.length, 6);
        assert_eq!(object.initialized_length, 6);
        assert!(object.elements[3].is_hole());
        assert_eq!(
            get_elem(&mut heap, Value::Object(arr), Value::Int32(3)).expect("read"),
            Value::Undefined
        );
        heap.set_array_proto_element(3, Value::Int32(99));
        assert_eq!(
            get_elem(&mut heap, Value::Object(arr), Value::Int32(3)).expect("read"),
            Value::Int32(99)
        );
    }

    #[test]
    fn test_nullish_base_throws() {
        let mut heap = Heap::new();
        assert!(matches!(
            get_elem(&mut heap, Value::Null, Value::Int32(0)),
            Err(RuntimeError::TypeError(_))
        ));
    }

    #[test]
    fn test_string_keys() {
        let mut heap = Heap::new();
        let arr = heap.new_array(&[Value::Int32(1), Value::Int32(2)]);
        let one = Value::String(heap.intern("1"));
        let length = Value::String(heap.length_atom());
        assert_eq!(get_elem(&mut heap, Value::Object(arr), one).expect("read"), Value::Int32(2));
        assert_eq!(get_elem(&mut heap, Value::Object(arr), length).expect("read"), Value::Int32(2));
    }

    proptest! {
        #[test]
        fn int32_roundtrips_through_to_int32(i in any::<i32>()) {
            prop_assert_eq!(to_int32(i as f64), i);
            prop_assert_eq!(to_int32(i as f64 + 4294967296.0), i);
        }
    }
}
