use thiserror::Error;

use crate::frontend::token::Span;

/// A parsing error with source location.
///
/// `line` and `col` are 1-based positions coming from the lexer spans.
/// For errors found at the end of a token group (a missing operand, an empty
/// condition) the parser falls back to the span of the last token it saw so
/// locations are never `0:0`.
#[derive(Debug, Clone, Error)]
#[error("{line}:{col}: {message}")]
pub struct ParserError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl ParserError {
    pub fn at(span: Span, message: impl Into<String>) -> Self {
        ParserError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }
}
