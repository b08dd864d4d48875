use std::collections::HashMap;

use crate::lang::types::Type;
use crate::lang::value::Value;
use crate::runtime::host::Registry;

/// Scope of top-level code. Nested scopes extend it with `/`.
pub const MAIN_SCOPE: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A host-provided value, materialized into a data slot on first use.
    Value,
    Type,
    Label,
    Const,
    Var,
    Func,
    Pkg,
    Builtin(Builtin),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Cap,
    Append,
    Make,
    Delete,
    Panic,
    New,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Cap => "cap",
            Builtin::Append => "append",
            Builtin::Make => "make",
            Builtin::Delete => "delete",
            Builtin::Panic => "panic",
            Builtin::New => "new",
        }
    }
}

/// Where a variable or function lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Absolute index into the data segment.
    Global(usize),
    /// Offset from the frame pointer. Parameters are negative.
    Local(isize),
    /// Code offset (labels).
    Code(usize),
    /// Not yet placed.
    Unresolved,
}

/// A memory operand of the load and store instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Global(usize),
    Local(isize),
}

impl Address {
    pub fn slot(self) -> Option<Slot> {
        match self {
            Address::Global(i) => Some(Slot::Global(i)),
            Address::Local(i) => Some(Slot::Local(i)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub kind: Kind,
    pub addr: Address,
    pub ty: Type,
    /// Constant value, host function, or compiled function entry.
    pub value: Option<Value>,
}

impl Symbol {
    pub fn new(kind: Kind, addr: Address, ty: Type) -> Self {
        Symbol {
            kind,
            addr,
            ty,
            value: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn is_local(&self) -> bool {
        matches!(self.addr, Address::Local(_))
    }
}

/// Flat map from scope-qualified names to symbols.
///
/// Keys are `<scope>/<name>`; the universe scope is empty, so predeclared
/// names have no prefix at all. Lookup walks from the innermost scope
/// outwards by stripping path components.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the predeclared identifiers plus the registry's
    /// universe-level host functions.
    pub fn with_universe(registry: &Registry) -> Self {
        let mut table = Self::new();

        for (name, ty) in [
            ("int", Type::Int),
            ("int64", Type::Int),
            ("byte", Type::Int),
            ("rune", Type::Int),
            ("float64", Type::Float),
            ("float32", Type::Float),
            ("string", Type::String),
            ("bool", Type::Bool),
            ("any", Type::Any),
        ] {
            table.add(name, Symbol::new(Kind::Type, Address::Unresolved, ty));
        }

        for (name, ty, value) in [
            ("true", Type::Bool, Value::Bool(true)),
            ("false", Type::Bool, Value::Bool(false)),
            ("nil", Type::Nil, Value::Nil),
            ("iota", Type::Int, Value::Int(0)),
        ] {
            table.add(name, Symbol::new(Kind::Const, Address::Unresolved, ty).with_value(value));
        }

        for builtin in [
            Builtin::Len,
            Builtin::Cap,
            Builtin::Append,
            Builtin::Make,
            Builtin::Delete,
            Builtin::Panic,
            Builtin::New,
        ] {
            table.add(
                builtin.name(),
                Symbol::new(Kind::Builtin(builtin), Address::Unresolved, Type::Unknown),
            );
        }

        for (name, binding) in registry.universe() {
            table.add(
                name,
                Symbol::new(Kind::Value, Address::Unresolved, binding.ty.clone())
                    .with_value(binding.value.clone()),
            );
        }
        table
    }

    pub fn add(&mut self, key: impl Into<String>, symbol: Symbol) {
        self.symbols.insert(key.into(), symbol);
    }

    /// Exact lookup by qualified key.
    pub fn lookup(&self, key: &str) -> Option<&Symbol> {
        self.symbols.get(key)
    }

    pub fn lookup_mut(&mut self, key: &str) -> Option<&mut Symbol> {
        self.symbols.get_mut(key)
    }

    /// Resolves `name` from `scope` outwards; returns the qualified key found.
    pub fn get(&self, name: &str, scope: &str) -> Option<(String, &Symbol)> {
        let mut scope = scope;
        loop {
            let key = qualify(scope, name);
            if let Some(symbol) = self.symbols.get(&key) {
                return Some((key, symbol));
            }
            if scope.is_empty() {
                return None;
            }
            scope = match scope.rfind('/') {
                Some(p) => &scope[..p],
                None => "",
            };
        }
    }

    /// Labels live beside variables under a `:` suffix so a label and a
    /// variable may share a name.
    pub fn label(&self, name: &str) -> Option<usize> {
        match self.symbols.get(&label_key(name)) {
            Some(Symbol {
                addr: Address::Code(offset),
                ..
            }) => Some(*offset),
            _ => None,
        }
    }

    pub fn add_label(&mut self, name: &str, offset: usize) {
        self.add(
            label_key(name),
            Symbol::new(Kind::Label, Address::Code(offset), Type::Unknown),
        );
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

pub fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", scope, name)
    }
}

fn label_key(name: &str) -> String {
    format!("{}:", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(index: usize) -> Symbol {
        Symbol::new(Kind::Var, Address::Global(index), Type::Int)
    }

    #[test]
    fn test_lookup_walks_outwards() {
        let mut table = SymbolTable::new();
        table.add("main/x", var(0));
        table.add("main/f/x", var(1));

        let (key, sym) = table.get("x", "main/f/#b3").unwrap();
        assert_eq!(key, "main/f/x");
        assert_eq!(sym.addr, Address::Global(1));

        let (key, _) = table.get("x", "main/#b0").unwrap();
        assert_eq!(key, "main/x");
        assert!(table.get("y", "main/f").is_none());
    }

    #[test]
    fn test_universe_is_reachable_from_any_scope() {
        let table = SymbolTable::with_universe(&Registry::with_stdlib());
        let (key, sym) = table.get("int", "main/f/#b1").unwrap();
        assert_eq!(key, "int");
        assert_eq!(sym.kind, Kind::Type);
        assert_eq!(table.get("len", "main").unwrap().1.kind, Kind::Builtin(Builtin::Len));
        assert_eq!(table.get("println", "main").unwrap().1.kind, Kind::Value);
    }

    #[test]
    fn test_labels_do_not_shadow_variables() {
        let mut table = SymbolTable::new();
        table.add("main/f/done", var(3));
        table.add_label("main/f/done", 42);
        assert_eq!(table.label("main/f/done"), Some(42));
        assert_eq!(table.lookup("main/f/done").unwrap().kind, Kind::Var);
        assert_eq!(table.label("main/f/other"), None);
    }
}
