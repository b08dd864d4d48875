use thiserror::Error;

use crate::frontend::token::Span;
use crate::lang::value::ValueError;

fn position(span: &Option<Span>) -> String {
    match span {
        Some(span) => format!("{}: ", span),
        None => String::new(),
    }
}

fn backtrace(call_stack: &[String]) -> String {
    let mut out = String::new();
    if !call_stack.is_empty() {
        out.push_str("\n  call stack:");
        for (i, frame) in call_stack.iter().enumerate() {
            out.push_str(&format!("\n    {}: {}", i, frame));
        }
    }
    out
}

/// An error raised while executing bytecode, located at the failing
/// instruction. `call_stack` lists the call sites of the active frames,
/// innermost first.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}runtime error: {message}{}", position(.span), backtrace(.call_stack))]
pub struct RuntimeError {
    pub message: String,
    pub span: Option<Span>,
    pub call_stack: Vec<String>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            span: None,
            call_stack: Vec::new(),
        }
    }

    /// Sets the position unless one is already known.
    pub fn at(mut self, span: Span) -> Self {
        self.span.get_or_insert(span);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.call_stack.push(context.into());
        self
    }
}

impl From<ValueError> for RuntimeError {
    fn from(err: ValueError) -> Self {
        RuntimeError::new(err.to_string())
    }
}

pub fn type_error(expected: &str, got: &str) -> RuntimeError {
    RuntimeError::new(format!("type error: expected {}, got {}", expected, got))
}

pub fn index_out_of_range(index: i64, len: usize) -> RuntimeError {
    RuntimeError::new(format!("index out of range [{}] with length {}", index, len))
}

pub fn nil_dereference() -> RuntimeError {
    RuntimeError::new("invalid memory address or nil pointer dereference")
}

pub fn stack_underflow(op: &str) -> RuntimeError {
    RuntimeError::new(format!("stack underflow in {}", op))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RuntimeError::new("integer divide by zero").at(Span { line: 2, col: 5 });
        assert_eq!(err.to_string(), "2:5: runtime error: integer divide by zero");

        let err = err.at(Span { line: 9, col: 9 }).with_context("called at 4:1");
        assert_eq!(
            err.to_string(),
            "2:5: runtime error: integer divide by zero\n  call stack:\n    0: called at 4:1"
        );
    }

    #[test]
    fn test_from_value_error() {
        let err: RuntimeError = ValueError::DivisionByZero.into();
        assert_eq!(err.message, "integer divide by zero");
        assert_eq!(index_out_of_range(5, 3).message, "index out of range [5] with length 3");
    }
}
