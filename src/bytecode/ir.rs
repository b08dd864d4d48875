use crate::bytecode::Op;
use crate::frontend::token::Span;
use crate::lang::types::Type;
use crate::lang::value::Value;

/// One instruction with the source position it was compiled from.
#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub span: Span,
    pub op: Op,
}

/// A compiled program: code, data segment and entry point.
///
/// Both segments only grow. A session keeps appending to the same program
/// across evaluations, so existing code offsets and data indices stay
/// valid for its whole lifetime.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub code: Vec<Instr>,
    /// Globals, materialized host functions, function entries, string
    /// constants and the type descriptors referenced by instructions.
    pub data: Vec<Value>,
    /// First instruction of top-level code, past any function bodies
    /// compiled before it.
    pub entry: usize,
    /// Data slots holding read-only string constants.
    constants: Vec<usize>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, op: Op, span: Span) -> usize {
        self.code.push(Instr { span, op });
        self.code.len() - 1
    }

    pub fn alloc(&mut self, value: Value) -> usize {
        self.data.push(value);
        self.data.len() - 1
    }

    /// Index of a string constant, deduplicated by content.
    pub fn string_slot(&mut self, s: &str) -> usize {
        let found = self
            .constants
            .iter()
            .copied()
            .find(|&i| matches!(&self.data[i], Value::Str(t) if t == s));
        match found {
            Some(i) => i,
            None => {
                let i = self.alloc(Value::Str(s.to_string()));
                self.constants.push(i);
                i
            }
        }
    }

    /// Index of a type descriptor, reusing an equal one already present.
    pub fn type_slot(&mut self, ty: &Type) -> usize {
        let found = self
            .data
            .iter()
            .position(|v| matches!(v, Value::Type(t) if t == ty));
        match found {
            Some(i) => i,
            None => self.alloc(Value::Type(ty.clone())),
        }
    }

    pub fn type_at(&self, index: usize) -> Option<&Type> {
        match self.data.get(index) {
            Some(Value::Type(t)) => Some(t),
            _ => None,
        }
    }

    /// Drops everything emitted past the given lengths.
    pub fn truncate(&mut self, code_len: usize, data_len: usize) {
        self.code.truncate(code_len);
        self.data.truncate(data_len);
        self.constants.retain(|&i| i < data_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_slots_are_shared() {
        let mut program = Program::new();
        program.alloc(Value::Int(1));
        let a = program.type_slot(&Type::slice_of(Type::Int));
        let b = program.type_slot(&Type::slice_of(Type::Int));
        let c = program.type_slot(&Type::String);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(program.type_at(a), Some(&Type::slice_of(Type::Int)));
        assert_eq!(program.type_at(0), None);
    }

    #[test]
    fn test_string_constants_skip_variables() {
        let mut program = Program::new();
        let var = program.alloc(Value::Str("go".into()));
        let a = program.string_slot("go");
        let b = program.string_slot("go");
        assert_ne!(var, a);
        assert_eq!(a, b);

        program.truncate(0, a);
        let c = program.string_slot("go");
        assert_eq!(c, a);
        assert_eq!(program.data.len(), a + 1);
    }
}
