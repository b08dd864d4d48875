use std::fmt;

use crate::lang::symbol::Slot;
use crate::lang::value::{BinOp, UnOp, Value};

/// Element layout of a `Composite` instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Layout {
    /// Elements in declaration order.
    Positional,
    /// Struct fields by index, in the order the values were pushed.
    Fields(Vec<usize>),
    /// Map entries, key then value.
    Pairs,
}

// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// Jump offsets are relative to the instruction carrying them. Operands
// named `ty` index a `Value::Type` in the data segment.

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // stack
    Push(Value),
    Pop(usize),
    /// Reserve the frame's local slots.
    Grow(usize),

    // memory
    Get(Slot),
    Set(Slot),
    Addr(Slot),
    Deref,
    DerefSet,
    /// Zero value of a type.
    New(usize),
    /// Moves the top value into a fresh heap cell and pushes its pointer.
    Box,

    // arithmetic and logic
    Binary(BinOp),
    Unary(UnOp),
    Addi(i64),
    Subi(i64),
    Loweri(i64),
    /// Converts the value `depth` slots below the top.
    Convert { ty: usize, depth: usize },

    // control flow
    Jump(isize),
    JumpTrue(isize),
    JumpFalse(isize),
    /// Keep the top and jump if it is true, else pop it.
    JumpSetTrue(isize),
    JumpSetFalse(isize),
    Call(isize),
    /// Call the function value on top of the stack.
    CallX {
        argc: usize,
        results: usize,
        /// Fixed parameter count of a variadic callee.
        variadic: Option<usize>,
        spread: bool,
    },
    Return { results: usize, params: usize },
    MissingReturn,
    Exit,

    // containers
    Index,
    /// Map lookup yielding the zero value of `ty` for absent keys.
    MapIndex(usize),
    IndexSet,
    /// Map store; fails on a nil map.
    MapSet,
    Slice { low: bool, high: bool },
    Field(usize),
    /// Store through the pointer below the value, following a field path.
    FieldSet(Vec<usize>),
    Composite { ty: usize, len: usize, layout: Layout },
    Len,
    Cap,
    Append { count: usize, spread: bool },
    Make { ty: usize, argc: usize },
    Delete,
    Panic,
    Range,
    /// Advance the iterator on top; jump by `offset` when exhausted.
    Next {
        key: Option<Slot>,
        value: Option<Slot>,
        offset: isize,
    },
}

impl Op {
    /// Relative target of a jump-like instruction.
    pub fn jump_offset(&self) -> Option<isize> {
        match self {
            Op::Jump(o)
            | Op::JumpTrue(o)
            | Op::JumpFalse(o)
            | Op::JumpSetTrue(o)
            | Op::JumpSetFalse(o)
            | Op::Call(o) => Some(*o),
            Op::Next { offset, .. } => Some(*offset),
            _ => None,
        }
    }

    /// Rewrites the relative target of a jump-like instruction.
    pub fn set_jump_offset(&mut self, rel: isize) -> bool {
        match self {
            Op::Jump(o)
            | Op::JumpTrue(o)
            | Op::JumpFalse(o)
            | Op::JumpSetTrue(o)
            | Op::JumpSetFalse(o)
            | Op::Call(o) => *o = rel,
            Op::Next { offset, .. } => *offset = rel,
            _ => return false,
        }
        true
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Global(i) => write!(f, "g{}", i),
            Slot::Local(i) => write!(f, "l{}", i),
        }
    }
}

fn opt_slot(slot: &Option<Slot>) -> String {
    slot.map(|s| s.to_string()).unwrap_or_else(|| "_".into())
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Push(Value::Str(s)) => write!(f, "PUSH        {:?}", s),
            Op::Push(v) => write!(f, "PUSH        {}", v),
            Op::Pop(n) => write!(f, "POP         {}", n),
            Op::Grow(n) => write!(f, "GROW        {}", n),
            Op::Get(s) => write!(f, "GET         {}", s),
            Op::Set(s) => write!(f, "SET         {}", s),
            Op::Addr(s) => write!(f, "ADDR        {}", s),
            Op::Deref => write!(f, "DEREF"),
            Op::DerefSet => write!(f, "DEREF_SET"),
            Op::New(ty) => write!(f, "NEW         t{}", ty),
            Op::Box => write!(f, "BOX"),
            Op::Binary(op) => write!(f, "BINARY      {}", op.as_str()),
            Op::Unary(op) => write!(f, "UNARY       {}", op.as_str()),
            Op::Addi(k) => write!(f, "ADDI        {}", k),
            Op::Subi(k) => write!(f, "SUBI        {}", k),
            Op::Loweri(k) => write!(f, "LOWERI      {}", k),
            Op::Convert { ty, depth } => write!(f, "CONVERT     t{} @{}", ty, depth),
            Op::Jump(o) => write!(f, "JUMP        {:+}", o),
            Op::JumpTrue(o) => write!(f, "JUMP_TRUE   {:+}", o),
            Op::JumpFalse(o) => write!(f, "JUMP_FALSE  {:+}", o),
            Op::JumpSetTrue(o) => write!(f, "JSET_TRUE   {:+}", o),
            Op::JumpSetFalse(o) => write!(f, "JSET_FALSE  {:+}", o),
            Op::Call(o) => write!(f, "CALL        {:+}", o),
            Op::CallX {
                argc,
                results,
                variadic,
                spread,
            } => {
                write!(f, "CALLX       {} -> {}", argc, results)?;
                if let Some(fixed) = variadic {
                    write!(f, " variadic({})", fixed)?;
                }
                if *spread {
                    write!(f, " ...")?;
                }
                Ok(())
            }
            Op::Return { results, params } => write!(f, "RETURN      {} ({} params)", results, params),
            Op::MissingReturn => write!(f, "MISSING_RETURN"),
            Op::Exit => write!(f, "EXIT"),
            Op::Index => write!(f, "INDEX"),
            Op::MapIndex(ty) => write!(f, "MAP_INDEX   t{}", ty),
            Op::IndexSet => write!(f, "INDEX_SET"),
            Op::MapSet => write!(f, "MAP_SET"),
            Op::Slice { low, high } => write!(f, "SLICE       {} {}", low, high),
            Op::Field(i) => write!(f, "FIELD       {}", i),
            Op::FieldSet(path) => write!(f, "FIELD_SET   {:?}", path),
            Op::Composite { ty, len, layout } => {
                write!(f, "COMPOSITE   t{} len={}", ty, len)?;
                match layout {
                    Layout::Positional => Ok(()),
                    Layout::Fields(idx) => write!(f, " fields={:?}", idx),
                    Layout::Pairs => write!(f, " pairs"),
                }
            }
            Op::Len => write!(f, "LEN"),
            Op::Cap => write!(f, "CAP"),
            Op::Append { count, spread } => {
                write!(f, "APPEND      {}{}", count, if *spread { " ..." } else { "" })
            }
            Op::Make { ty, argc } => write!(f, "MAKE        t{} {}", ty, argc),
            Op::Delete => write!(f, "DELETE"),
            Op::Panic => write!(f, "PANIC"),
            Op::Range => write!(f, "RANGE"),
            Op::Next { key, value, offset } => write!(
                f,
                "NEXT        {} {} {:+}",
                opt_slot(key),
                opt_slot(value),
                offset
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_jump_offsets() {
        let mut op = Op::JumpFalse(0);
        assert!(op.set_jump_offset(-4));
        assert_eq!(op.jump_offset(), Some(-4));

        let mut next = Op::Next {
            key: None,
            value: Some(Slot::Local(1)),
            offset: 0,
        };
        assert!(next.set_jump_offset(7));
        assert_eq!(next.to_string(), "NEXT        _ l1 +7");

        let mut push = Op::Push(Value::Int(1));
        assert!(!push.set_jump_offset(3));
    }

    #[test]
    fn test_display() {
        assert_eq!(Op::Get(Slot::Global(3)).to_string(), "GET         g3");
        assert_eq!(Op::Push(Value::Str("hi".into())).to_string(), "PUSH        \"hi\"");
        assert_eq!(Op::Binary(BinOp::Leq).to_string(), "BINARY      <=");
    }
}
