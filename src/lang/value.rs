use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::frontend::token::Operator;
use crate::lang::types::Type;
use crate::runtime::host::Callable;

pub type MapRef = Rc<RefCell<BTreeMap<MapKey, Value>>>;
pub type HeapRef = Rc<RefCell<Value>>;

/// A value held in VM memory.
///
/// Slices and maps share their backing storage between copies, structs are
/// copied on assignment. `Nil` doubles as the zero value of slices, maps,
/// pointers and functions.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Slice(SliceRef),
    Map(MapRef),
    Struct(Vec<Value>),
    /// Absolute address of a memory cell.
    Ref(usize),
    /// Pointer to a cell outside VM memory, from `new(T)` or `&T{...}`.
    Heap(HeapRef),
    /// Code offset of a compiled function.
    Func(usize),
    Host(Rc<dyn Callable>),
    Iter(Box<RangeIter>),
    Type(Type),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    #[error("integer divide by zero")]
    DivisionByZero,
    #[error("negative shift amount")]
    NegativeShift,
    #[error("invalid operation: {left} {op} {right}")]
    Mismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("invalid operation: {op}{operand}")]
    UnaryMismatch { op: &'static str, operand: &'static str },
    #[error("cannot convert {from} to {to}")]
    Conversion { from: &'static str, to: String },
    #[error("invalid map key of type {0}")]
    MapKey(&'static str),
    #[error("cannot range over {0}")]
    NotIterable(&'static str),
    #[error("{0} can only be compared to nil")]
    Uncomparable(&'static str),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float64",
            Value::Str(_) => "string",
            Value::Slice(_) => "slice",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Ref(_) | Value::Heap(_) => "pointer",
            Value::Func(_) | Value::Host(_) => "func",
            Value::Iter(_) => "iterator",
            Value::Type(_) => "type",
        }
    }

    pub fn is_truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn slice_of(items: Vec<Value>) -> Value {
        Value::Slice(SliceRef::new(items))
    }

    pub fn map_of(entries: BTreeMap<MapKey, Value>) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    /// Go `==`. Slices, maps and functions only compare against nil.
    pub fn equals(&self, other: &Value) -> Result<bool, ValueError> {
        Ok(match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Nil, v) | (v, Value::Nil) => match v {
                Value::Slice(_)
                | Value::Map(_)
                | Value::Ref(_)
                | Value::Heap(_)
                | Value::Func(_)
                | Value::Host(_) => false,
                other => return Err(ValueError::Uncomparable(other.type_name())),
            },
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Heap(a), Value::Heap(b)) => Rc::ptr_eq(a, b),
            (Value::Ref(_), Value::Heap(_)) | (Value::Heap(_), Value::Ref(_)) => false,
            (Value::Struct(a), Value::Struct(b)) => {
                if a.len() != b.len() {
                    return Ok(false);
                }
                for (x, y) in a.iter().zip(b) {
                    if !x.equals(y)? {
                        return Ok(false);
                    }
                }
                true
            }
            (Value::Type(a), Value::Type(b)) => a == b,
            (a @ (Value::Slice(_) | Value::Map(_) | Value::Func(_) | Value::Host(_)), _) => {
                return Err(ValueError::Uncomparable(a.type_name()));
            }
            (a, b) => {
                return Err(ValueError::Mismatch {
                    op: "==",
                    left: a.type_name(),
                    right: b.type_name(),
                });
            }
        })
    }
}

/// Structural equality, used by tests and snapshots. Slices compare by
/// visible elements, functions by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Slice(a), Value::Slice(b)) => a.items() == b.items(),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::Heap(a), Value::Heap(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => Rc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "<nil>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Slice(s) => {
                write!(f, "[")?;
                for (i, v) in s.items().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "map[")?;
                for (i, (k, v)) in m.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
            Value::Ref(addr) => write!(f, "0x{:08x}", addr),
            Value::Heap(cell) => write!(f, "&{}", cell.borrow()),
            Value::Func(off) => write!(f, "func@{}", off),
            Value::Host(h) => write!(f, "func:{}", h.name()),
            Value::Iter(_) => write!(f, "<iterator>"),
            Value::Type(t) => write!(f, "{}", t),
        }
    }
}

// =============================================================================
// Slices
// =============================================================================

/// A window onto a shared backing array.
#[derive(Debug, Clone)]
pub struct SliceRef {
    data: Rc<RefCell<Vec<Value>>>,
    off: usize,
    len: usize,
}

impl SliceRef {
    pub fn new(items: Vec<Value>) -> Self {
        let len = items.len();
        SliceRef {
            data: Rc::new(RefCell::new(items)),
            off: 0,
            len,
        }
    }

    /// `len` zero elements backed by an array of `cap` zero elements.
    pub fn with_capacity(zero: &Value, len: usize, cap: usize) -> Self {
        SliceRef {
            data: Rc::new(RefCell::new(vec![zero.clone(); cap.max(len)])),
            off: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn cap(&self) -> usize {
        self.data.borrow().len().saturating_sub(self.off)
    }

    pub fn get(&self, i: usize) -> Option<Value> {
        if i >= self.len {
            return None;
        }
        self.data.borrow().get(self.off + i).cloned()
    }

    /// Writes through to the backing array; `false` when out of range.
    pub fn set(&self, i: usize, value: Value) -> bool {
        if i >= self.len {
            return false;
        }
        match self.data.borrow_mut().get_mut(self.off + i) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn items(&self) -> Vec<Value> {
        let data = self.data.borrow();
        data[self.off..self.off + self.len].to_vec()
    }

    /// Appends in place while the backing array has room past the window,
    /// overwriting what is there, and grows the backing array otherwise.
    pub fn append(&self, values: impl IntoIterator<Item = Value>) -> SliceRef {
        let mut data = self.data.borrow_mut();
        let mut len = self.len;
        for v in values {
            let at = self.off + len;
            if at < data.len() {
                data[at] = v;
            } else {
                data.push(v);
            }
            len += 1;
        }
        SliceRef {
            data: Rc::clone(&self.data),
            off: self.off,
            len,
        }
    }

    /// `s[low:high]`, bounded by capacity.
    pub fn slice(&self, low: usize, high: usize) -> Option<SliceRef> {
        if low > high || high > self.cap() {
            return None;
        }
        Some(SliceRef {
            data: Rc::clone(&self.data),
            off: self.off + low,
            len: high - low,
        })
    }
}

// =============================================================================
// Maps
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapKey {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl TryFrom<&Value> for MapKey {
    type Error = ValueError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(MapKey::Bool(*b)),
            Value::Int(n) => Ok(MapKey::Int(*n)),
            Value::Str(s) => Ok(MapKey::Str(s.clone())),
            other => Err(ValueError::MapKey(other.type_name())),
        }
    }
}

impl From<MapKey> for Value {
    fn from(key: MapKey) -> Self {
        match key {
            MapKey::Bool(b) => Value::Bool(b),
            MapKey::Int(n) => Value::Int(n),
            MapKey::Str(s) => Value::Str(s),
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Bool(b) => write!(f, "{}", b),
            MapKey::Int(n) => write!(f, "{}", n),
            MapKey::Str(s) => write!(f, "{}", s),
        }
    }
}

// =============================================================================
// Range iteration
// =============================================================================

/// State of a `for ... range` loop, kept on the operand stack.
#[derive(Debug, Clone)]
pub enum RangeIter {
    /// Pre-collected key/value pairs (slices, maps, strings).
    Pairs { items: Vec<(Value, Value)>, pos: usize },
    /// `range n` over an integer.
    Count { n: i64, pos: i64 },
}

impl RangeIter {
    /// Map iteration follows key order.
    pub fn over(value: &Value) -> Result<RangeIter, ValueError> {
        let items = match value {
            Value::Nil => Vec::new(),
            Value::Int(n) => return Ok(RangeIter::Count { n: *n, pos: 0 }),
            Value::Slice(s) => s
                .items()
                .into_iter()
                .enumerate()
                .map(|(i, v)| (Value::Int(i as i64), v))
                .collect(),
            Value::Map(m) => m
                .borrow()
                .iter()
                .map(|(k, v)| (Value::from(k.clone()), v.clone()))
                .collect(),
            Value::Str(s) => s
                .char_indices()
                .map(|(i, c)| (Value::Int(i as i64), Value::Int(c as i64)))
                .collect(),
            other => return Err(ValueError::NotIterable(other.type_name())),
        };
        Ok(RangeIter::Pairs { items, pos: 0 })
    }
}

impl Iterator for RangeIter {
    type Item = (Value, Value);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            RangeIter::Pairs { items, pos } => {
                let item = items.get(*pos).cloned();
                *pos += 1;
                item
            }
            RangeIter::Count { n, pos } => {
                if *pos >= *n {
                    return None;
                }
                let i = *pos;
                *pos += 1;
                Some((Value::Int(i), Value::Nil))
            }
        }
    }
}

// =============================================================================
// Operators
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Quo,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eql,
    Neq,
    Lss,
    Leq,
    Gtr,
    Geq,
}

impl BinOp {
    pub fn from_operator(op: Operator) -> Option<BinOp> {
        Some(match op {
            Operator::Add => BinOp::Add,
            Operator::Sub => BinOp::Sub,
            Operator::Mul => BinOp::Mul,
            Operator::Quo => BinOp::Quo,
            Operator::Rem => BinOp::Rem,
            Operator::And => BinOp::And,
            Operator::Or => BinOp::Or,
            Operator::Xor => BinOp::Xor,
            Operator::Shl => BinOp::Shl,
            Operator::Shr => BinOp::Shr,
            Operator::Eql => BinOp::Eql,
            Operator::Neq => BinOp::Neq,
            Operator::Lss => BinOp::Lss,
            Operator::Leq => BinOp::Leq,
            Operator::Gtr => BinOp::Gtr,
            Operator::Geq => BinOp::Geq,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Quo => "/",
            BinOp::Rem => "%",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Eql => "==",
            BinOp::Neq => "!=",
            BinOp::Lss => "<",
            BinOp::Leq => "<=",
            BinOp::Gtr => ">",
            BinOp::Geq => ">=",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eql | BinOp::Neq | BinOp::Lss | BinOp::Leq | BinOp::Gtr | BinOp::Geq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    BitNot,
}

impl UnOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
            UnOp::BitNot => "^",
        }
    }
}

/// Evaluates `a op b`. Shared by the VM and constant folding.
pub fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, ValueError> {
    if op.is_comparison() {
        return compare(op, a, b).map(Value::Bool);
    }
    let mismatch = || ValueError::Mismatch {
        op: op.as_str(),
        left: a.type_name(),
        right: b.type_name(),
    };

    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_op(op, *x, *y).map(Value::Int),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let (x, y) = match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(mismatch()),
            };
            match op {
                BinOp::Add => Ok(Value::Float(x + y)),
                BinOp::Sub => Ok(Value::Float(x - y)),
                BinOp::Mul => Ok(Value::Float(x * y)),
                BinOp::Quo => Ok(Value::Float(x / y)),
                _ => Err(mismatch()),
            }
        }
        (Value::Str(x), Value::Str(y)) if op == BinOp::Add => {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            Ok(Value::Str(s))
        }
        _ => Err(mismatch()),
    }
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<i64, ValueError> {
    Ok(match op {
        BinOp::Add => x.wrapping_add(y),
        BinOp::Sub => x.wrapping_sub(y),
        BinOp::Mul => x.wrapping_mul(y),
        BinOp::Quo => {
            if y == 0 {
                return Err(ValueError::DivisionByZero);
            }
            x.wrapping_div(y)
        }
        BinOp::Rem => {
            if y == 0 {
                return Err(ValueError::DivisionByZero);
            }
            x.wrapping_rem(y)
        }
        BinOp::And => x & y,
        BinOp::Or => x | y,
        BinOp::Xor => x ^ y,
        BinOp::Shl => match y {
            y if y < 0 => return Err(ValueError::NegativeShift),
            y if y >= 64 => 0,
            y => x << y,
        },
        BinOp::Shr => match y {
            y if y < 0 => return Err(ValueError::NegativeShift),
            y if y >= 64 => {
                if x < 0 {
                    -1
                } else {
                    0
                }
            }
            y => x >> y,
        },
        _ => {
            return Err(ValueError::Mismatch {
                op: op.as_str(),
                left: "int",
                right: "int",
            });
        }
    })
}

fn compare(op: BinOp, a: &Value, b: &Value) -> Result<bool, ValueError> {
    match op {
        BinOp::Eql => return a.equals(b),
        BinOp::Neq => return a.equals(b).map(|eq| !eq),
        _ => {}
    }
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            }
        }
        _ => {
            return Err(ValueError::Mismatch {
                op: op.as_str(),
                left: a.type_name(),
                right: b.type_name(),
            });
        }
    };
    // NaN compares false under every ordering
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        BinOp::Lss => ordering.is_lt(),
        BinOp::Leq => ordering.is_le(),
        BinOp::Gtr => ordering.is_gt(),
        _ => ordering.is_ge(),
    })
}

pub fn unary(op: UnOp, v: &Value) -> Result<Value, ValueError> {
    match (op, v) {
        (UnOp::Neg, Value::Int(n)) => Ok(Value::Int(n.wrapping_neg())),
        (UnOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnOp::BitNot, Value::Int(n)) => Ok(Value::Int(!n)),
        _ => Err(ValueError::UnaryMismatch {
            op: op.as_str(),
            operand: v.type_name(),
        }),
    }
}

/// Go conversion `T(v)`.
pub fn convert(v: &Value, to: &Type) -> Result<Value, ValueError> {
    let fail = || ValueError::Conversion {
        from: v.type_name(),
        to: to.to_string(),
    };
    match (to, v) {
        (Type::Unknown | Type::Any, _) => Ok(v.clone()),
        (Type::Int, Value::Int(n)) => Ok(Value::Int(*n)),
        (Type::Int, Value::Float(x)) => Ok(Value::Int(*x as i64)),
        (Type::Float, Value::Int(n)) => Ok(Value::Float(*n as f64)),
        (Type::Float, Value::Float(x)) => Ok(Value::Float(*x)),
        (Type::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
        (Type::String, Value::Str(s)) => Ok(Value::Str(s.clone())),
        (Type::String, Value::Int(n)) => {
            let c = u32::try_from(*n)
                .ok()
                .and_then(char::from_u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER);
            Ok(Value::Str(c.to_string()))
        }
        (Type::String, Value::Slice(s)) => {
            let mut bytes = Vec::with_capacity(s.len());
            for item in s.items() {
                match item {
                    Value::Int(b) => bytes.push(b as u8),
                    _ => return Err(fail()),
                }
            }
            Ok(Value::Str(String::from_utf8_lossy(&bytes).into_owned()))
        }
        (Type::String, Value::Nil) => Ok(Value::Str(String::new())),
        (Type::Slice(elem), Value::Str(s)) if **elem == Type::Int => Ok(Value::slice_of(
            s.bytes().map(|b| Value::Int(b as i64)).collect(),
        )),
        (Type::Slice(_) | Type::Map(..) | Type::Ptr(_) | Type::Func(_), Value::Nil) => {
            Ok(Value::Nil)
        }
        (Type::Slice(_), Value::Slice(_))
        | (Type::Map(..), Value::Map(_))
        | (Type::Ptr(_), Value::Ref(_) | Value::Heap(_))
        | (Type::Func(_), Value::Func(_) | Value::Host(_)) => Ok(v.clone()),
        (Type::Struct { fields, .. }, Value::Struct(values)) if fields.len() == values.len() => {
            Ok(v.clone())
        }
        _ => Err(fail()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(binary(BinOp::Add, &Value::Int(2), &Value::Int(3)), Ok(Value::Int(5)));
        assert_eq!(binary(BinOp::Quo, &Value::Int(7), &Value::Int(2)), Ok(Value::Int(3)));
        assert_eq!(binary(BinOp::Rem, &Value::Int(-7), &Value::Int(2)), Ok(Value::Int(-1)));
        assert_eq!(binary(BinOp::Shl, &Value::Int(1), &Value::Int(4)), Ok(Value::Int(16)));
        assert_eq!(
            binary(BinOp::Quo, &Value::Int(1), &Value::Int(0)),
            Err(ValueError::DivisionByZero)
        );
    }

    #[test]
    fn test_mixed_numeric_promotes_to_float() {
        assert_eq!(binary(BinOp::Mul, &Value::Int(2), &Value::Float(1.5)), Ok(Value::Float(3.0)));
        assert_eq!(binary(BinOp::Lss, &Value::Int(1), &Value::Float(1.5)), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_string_ops() {
        assert_eq!(
            binary(BinOp::Add, &Value::Str("ab".into()), &Value::Str("cd".into())),
            Ok(Value::Str("abcd".into()))
        );
        assert_eq!(
            binary(BinOp::Lss, &Value::Str("a".into()), &Value::Str("b".into())),
            Ok(Value::Bool(true))
        );
        assert!(binary(BinOp::Sub, &Value::Str("a".into()), &Value::Str("b".into())).is_err());
    }

    #[test]
    fn test_nil_comparison() {
        let s = Value::slice_of(vec![Value::Int(1)]);
        assert_eq!(binary(BinOp::Eql, &s, &Value::Nil), Ok(Value::Bool(false)));
        assert_eq!(binary(BinOp::Neq, &Value::Nil, &Value::Nil), Ok(Value::Bool(false)));
        assert!(binary(BinOp::Eql, &s, &s).is_err());
    }

    #[test]
    fn test_unary() {
        assert_eq!(unary(UnOp::Neg, &Value::Int(3)), Ok(Value::Int(-3)));
        assert_eq!(unary(UnOp::Not, &Value::Bool(true)), Ok(Value::Bool(false)));
        assert_eq!(unary(UnOp::BitNot, &Value::Int(0)), Ok(Value::Int(-1)));
        assert!(unary(UnOp::Not, &Value::Int(1)).is_err());
    }

    #[test]
    fn test_slice_aliasing() {
        let base = SliceRef::with_capacity(&Value::Int(0), 2, 4);
        let grown = base.append([Value::Int(7)]);
        assert_eq!(grown.len(), 3);
        assert_eq!(base.len(), 2);

        let window = grown.slice(1, 3).unwrap();
        assert!(window.set(0, Value::Int(9)));
        assert_eq!(grown.get(1), Some(Value::Int(9)));
        assert_eq!(window.cap(), 3);
        assert!(grown.slice(0, 5).is_none());
    }

    #[test]
    fn test_display() {
        let s = Value::slice_of(vec![Value::Int(1), Value::Str("a".into())]);
        assert_eq!(s.to_string(), "[1 a]");
        let mut m = BTreeMap::new();
        m.insert(MapKey::Str("b".into()), Value::Int(2));
        m.insert(MapKey::Str("a".into()), Value::Int(1));
        assert_eq!(Value::map_of(m).to_string(), "map[a:1 b:2]");
        assert_eq!(Value::Struct(vec![Value::Int(1), Value::Bool(true)]).to_string(), "{1 true}");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
    }

    #[test]
    fn test_range_over_string_yields_runes() {
        let pairs: Vec<_> = RangeIter::over(&Value::Str("hé".into())).unwrap().collect();
        assert_eq!(pairs[0], (Value::Int(0), Value::Int('h' as i64)));
        assert_eq!(pairs[1], (Value::Int(1), Value::Int('é' as i64)));
    }

    #[test]
    fn test_range_over_int() {
        let keys: Vec<_> = RangeIter::over(&Value::Int(3)).unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(convert(&Value::Float(3.9), &Type::Int), Ok(Value::Int(3)));
        assert_eq!(convert(&Value::Int(65), &Type::String), Ok(Value::Str("A".into())));
        assert_eq!(
            convert(&Value::Str("hi".into()), &Type::slice_of(Type::Int)),
            Ok(Value::slice_of(vec![Value::Int(104), Value::Int(105)]))
        );
        assert!(convert(&Value::Str("1".into()), &Type::Int).is_err());
    }
}
