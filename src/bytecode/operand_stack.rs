//! Compile-time mirror of the VM operand stack.
//!
//! Every shaped token that produces a runtime value pushes an [`Operand`]
//! describing its type; every token that consumes values pops them. Operands
//! that never reach the runtime stack (types, packages, functions named in
//! call position, builtins) have zero slots, so the slot count above a mark
//! is exactly what a `Pop` must remove at run time.

use crate::lang::symbol::Builtin;
use crate::lang::types::{FuncType, Type};
use crate::lang::value::Value;

/// A value known at compile time, with the code index of the instruction
/// that loads it.
#[derive(Debug, Clone, PartialEq)]
pub struct Konst {
    pub value: Value,
    pub at: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value { ty: Type, konst: Option<Konst> },
    /// Pointer to a struct used as an assignment base.
    Place(Type),
    Iter { key: Type, value: Type },
    Type(Type),
    Package(String),
    /// Statically known function named in call position.
    Func { key: String, sig: FuncType },
    Builtin(Builtin),
}

impl Operand {
    pub fn value(ty: Type) -> Self {
        Operand::Value { ty, konst: None }
    }

    pub fn constant(value: Value, ty: Type, at: usize) -> Self {
        Operand::Value {
            ty,
            konst: Some(Konst { value, at }),
        }
    }

    /// Runtime stack slots the operand occupies.
    pub fn slots(&self) -> usize {
        match self {
            Operand::Value { .. } | Operand::Place(_) | Operand::Iter { .. } => 1,
            _ => 0,
        }
    }

    pub fn ty(&self) -> Option<&Type> {
        match self {
            Operand::Value { ty, .. } | Operand::Place(ty) => Some(ty),
            _ => None,
        }
    }

    pub fn konst(&self) -> Option<&Konst> {
        match self {
            Operand::Value { konst, .. } => konst.as_ref(),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Operand::Value { ty, .. } => format!("value of type {}", ty),
            Operand::Place(ty) => format!("address of {}", ty),
            Operand::Iter { .. } => "range iterator".into(),
            Operand::Type(ty) => format!("type {}", ty),
            Operand::Package(p) => format!("package {}", p),
            Operand::Func { key, .. } => format!("function {}", key),
            Operand::Builtin(b) => format!("builtin {}", b.name()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperandStack {
    items: Vec<Operand>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operand: Operand) {
        self.items.push(operand);
    }

    pub fn pop(&mut self) -> Option<Operand> {
        self.items.pop()
    }

    /// Pops `n` operands, returned in push order.
    pub fn pop_n(&mut self, n: usize) -> Option<Vec<Operand>> {
        if n > self.items.len() {
            return None;
        }
        Some(self.items.split_off(self.items.len() - n))
    }

    pub fn peek(&self) -> Option<&Operand> {
        self.items.last()
    }

    pub fn peek_mut(&mut self) -> Option<&mut Operand> {
        self.items.last_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops operands above `height`, returning the runtime slots they held.
    pub fn truncate(&mut self, height: usize) -> usize {
        let slots = self.slots_above(height);
        self.items.truncate(height);
        slots
    }

    pub fn slots_above(&self, height: usize) -> usize {
        self.items
            .get(height..)
            .map(|rest| rest.iter().map(Operand::slots).sum())
            .unwrap_or(0)
    }

    /// Called at jump targets: values reaching a label along several paths
    /// are not compile-time constants anymore.
    pub fn forget_constants(&mut self) {
        for item in &mut self.items {
            if let Operand::Value { konst, .. } = item {
                *konst = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_accounting() {
        let mut stack = OperandStack::new();
        stack.push(Operand::value(Type::Int));
        let mark = stack.len();
        stack.push(Operand::Package("fmt".into()));
        stack.push(Operand::value(Type::String));
        stack.push(Operand::Type(Type::Int));
        stack.push(Operand::value(Type::Bool));
        assert_eq!(stack.slots_above(mark), 2);
        assert_eq!(stack.truncate(mark), 2);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_pop_n_keeps_push_order() {
        let mut stack = OperandStack::new();
        stack.push(Operand::value(Type::Int));
        stack.push(Operand::value(Type::String));
        let popped = stack.pop_n(2).unwrap();
        assert_eq!(popped[0].ty(), Some(&Type::Int));
        assert_eq!(popped[1].ty(), Some(&Type::String));
        assert!(stack.pop_n(1).is_none());
    }

    #[test]
    fn test_forget_constants() {
        let mut stack = OperandStack::new();
        stack.push(Operand::constant(Value::Int(1), Type::Int, 0));
        assert!(stack.peek().unwrap().konst().is_some());
        stack.forget_constants();
        assert!(stack.peek().unwrap().konst().is_none());
    }
}
