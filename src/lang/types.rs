use std::fmt;

use crate::lang::value::{BinOp, Value};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
    /// The last parameter is a slice collecting the trailing arguments.
    pub variadic: bool,
}

/// Runtime type descriptor.
///
/// `Unknown` is only produced by the compiler for values it cannot type
/// statically (host results declared as such); it is compatible with
/// everything and checked at run time instead.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Type {
    #[default]
    Unknown,
    Nil,
    Bool,
    Int,
    Float,
    String,
    Slice(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Ptr(Box<Type>),
    Func(FuncType),
    Struct {
        name: String,
        fields: Vec<(String, Type)>,
    },
    Any,
}

impl Type {
    pub fn slice_of(elem: Type) -> Type {
        Type::Slice(Box::new(elem))
    }

    pub fn map_of(key: Type, value: Type) -> Type {
        Type::Map(Box::new(key), Box::new(value))
    }

    pub fn ptr_to(elem: Type) -> Type {
        Type::Ptr(Box::new(elem))
    }

    pub fn func(params: Vec<Type>, results: Vec<Type>) -> Type {
        Type::Func(FuncType {
            params,
            results,
            variadic: false,
        })
    }

    /// The zero value stored in a fresh variable of this type.
    pub fn zero(&self) -> Value {
        match self {
            Type::Bool => Value::Bool(false),
            Type::Int => Value::Int(0),
            Type::Float => Value::Float(0.0),
            Type::String => Value::Str(String::new()),
            Type::Struct { fields, .. } => {
                Value::Struct(fields.iter().map(|(_, ty)| ty.zero()).collect())
            }
            _ => Value::Nil,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float)
    }

    /// Statically unknown or dynamic: checks are left to the VM.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Type::Unknown | Type::Any)
    }

    /// Element type of an indexable or dereferenceable type.
    pub fn elem(&self) -> Option<Type> {
        match self {
            Type::Slice(elem) | Type::Ptr(elem) => Some((**elem).clone()),
            Type::Map(_, value) => Some((**value).clone()),
            Type::String => Some(Type::Int),
            Type::Unknown | Type::Any => Some(Type::Unknown),
            _ => None,
        }
    }

    /// Index and type of a struct field, looking through one pointer.
    pub fn field(&self, name: &str) -> Option<(usize, Type)> {
        match self {
            Type::Struct { fields, .. } => fields
                .iter()
                .position(|(n, _)| n == name)
                .map(|i| (i, fields[i].1.clone())),
            Type::Ptr(elem) => match &**elem {
                Type::Struct { .. } => elem.field(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Whether a value of type `from` may be stored where `self` is expected.
    /// An `int` flowing into a `float64` is accepted; the compiler inserts the
    /// conversion (see [`Type::needs_float`]).
    pub fn accepts(&self, from: &Type) -> bool {
        if self == from || self.is_dynamic() || from.is_dynamic() {
            return true;
        }
        match (self, from) {
            (Type::Float, Type::Int) => true,
            (Type::Slice(_) | Type::Map(..) | Type::Ptr(_) | Type::Func(_), Type::Nil) => true,
            (Type::Struct { name: a, .. }, Type::Struct { name: b, .. }) => a == b,
            (Type::Slice(a), Type::Slice(b)) | (Type::Ptr(a), Type::Ptr(b)) => {
                a.identical(b)
            }
            (Type::Map(ka, va), Type::Map(kb, vb)) => ka.identical(kb) && va.identical(vb),
            _ => false,
        }
    }

    /// Element types must match exactly; `accepts` in both directions keeps
    /// `[]float64` from taking a `[]int`.
    pub fn identical(&self, other: &Type) -> bool {
        self.accepts(other) && other.accepts(self)
    }

    pub fn needs_float(&self, from: &Type) -> bool {
        *self == Type::Float && *from == Type::Int
    }

    /// Static result type of `left op right`.
    pub fn binary_result(op: BinOp, left: &Type, right: &Type) -> Result<Type, String> {
        let mismatch = || {
            format!(
                "invalid operation: operator {} not defined on {} and {}",
                op.as_str(),
                left,
                right
            )
        };

        if op.is_comparison() {
            let comparable = left.accepts(right) || right.accepts(left);
            let ordered = matches!(op, BinOp::Eql | BinOp::Neq)
                || (left.is_numeric() || left.is_dynamic() || *left == Type::String);
            return if comparable && ordered {
                Ok(Type::Bool)
            } else {
                Err(mismatch())
            };
        }

        match (left, right) {
            (l, r) if l.is_dynamic() || r.is_dynamic() => {
                if l.is_dynamic() {
                    Ok(r.clone())
                } else {
                    Ok(l.clone())
                }
            }
            (Type::Int, Type::Int) => Ok(Type::Int),
            (Type::Float, Type::Int | Type::Float) | (Type::Int, Type::Float) => match op {
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Quo => Ok(Type::Float),
                _ => Err(mismatch()),
            },
            (Type::String, Type::String) if op == BinOp::Add => Ok(Type::String),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if self.variadic && i + 1 == self.params.len() {
                match p {
                    Type::Slice(elem) => write!(f, "...{}", elem)?,
                    other => write!(f, "...{}", other)?,
                }
            } else {
                write!(f, "{}", p)?;
            }
        }
        write!(f, ")")?;
        match self.results.as_slice() {
            [] => Ok(()),
            [single] => write!(f, " {}", single),
            many => {
                write!(f, " (")?;
                for (i, r) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", r)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unknown => write!(f, "?"),
            Type::Nil => write!(f, "nil"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float64"),
            Type::String => write!(f, "string"),
            Type::Slice(elem) => write!(f, "[]{}", elem),
            Type::Map(k, v) => write!(f, "map[{}]{}", k, v),
            Type::Ptr(elem) => write!(f, "*{}", elem),
            Type::Func(sig) => write!(f, "{}", sig),
            Type::Struct { name, fields } => {
                if !name.is_empty() {
                    return write!(f, "{}", name);
                }
                write!(f, "struct {{")?;
                for (i, (n, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, " {} {}", n, ty)?;
                }
                write!(f, " }}")
            }
            Type::Any => write!(f, "any"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Type {
        Type::Struct {
            name: "Point".into(),
            fields: vec![("X".into(), Type::Int), ("Y".into(), Type::Float)],
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(Type::map_of(Type::String, Type::slice_of(Type::Int)).to_string(), "map[string][]int");
        assert_eq!(Type::ptr_to(point()).to_string(), "*Point");
        assert_eq!(
            Type::func(vec![Type::Int, Type::String], vec![Type::Bool, Type::Int]).to_string(),
            "func(int, string) (bool, int)"
        );
    }

    #[test]
    fn test_zero_values() {
        assert_eq!(Type::Int.zero(), Value::Int(0));
        assert_eq!(Type::String.zero(), Value::Str(String::new()));
        assert_eq!(point().zero(), Value::Struct(vec![Value::Int(0), Value::Float(0.0)]));
        assert_eq!(Type::slice_of(Type::Int).zero(), Value::Nil);
    }

    #[test]
    fn test_fields_through_pointer() {
        assert_eq!(point().field("Y"), Some((1, Type::Float)));
        assert_eq!(Type::ptr_to(point()).field("X"), Some((0, Type::Int)));
        assert_eq!(point().field("Z"), None);
    }

    #[test]
    fn test_accepts() {
        assert!(Type::Float.accepts(&Type::Int));
        assert!(Type::Float.needs_float(&Type::Int));
        assert!(!Type::Int.accepts(&Type::Float));
        assert!(Type::slice_of(Type::Int).accepts(&Type::Nil));
        assert!(!Type::Int.accepts(&Type::Nil));
        assert!(Type::Any.accepts(&Type::String));
    }

    #[test]
    fn test_binary_result() {
        assert_eq!(Type::binary_result(BinOp::Add, &Type::Int, &Type::Int), Ok(Type::Int));
        assert_eq!(Type::binary_result(BinOp::Mul, &Type::Int, &Type::Float), Ok(Type::Float));
        assert_eq!(Type::binary_result(BinOp::Lss, &Type::Int, &Type::Int), Ok(Type::Bool));
        assert_eq!(Type::binary_result(BinOp::Add, &Type::String, &Type::String), Ok(Type::String));
        assert!(Type::binary_result(BinOp::Sub, &Type::String, &Type::String).is_err());
        assert!(Type::binary_result(BinOp::Rem, &Type::Float, &Type::Float).is_err());
        assert!(Type::binary_result(BinOp::Add, &Type::Int, &Type::String).is_err());
    }
}
