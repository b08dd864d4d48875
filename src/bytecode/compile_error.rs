use thiserror::Error;

use crate::frontend::token::Span;

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

/// A compile error. Compilation stops at the first one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("{span}: undefined: {name}")]
    Undefined { name: String, span: Span },

    #[error("{span}: label {label} not defined")]
    UnresolvedLabel { label: String, span: Span },

    #[error("{span}: {message}{}", hint_suffix(.hint))]
    Invalid {
        message: String,
        span: Span,
        hint: Option<String>,
    },

    /// A token sequence the parser should never produce.
    #[error("{span}: internal compiler error: {message}")]
    Internal { message: String, span: Span },
}

impl CompileError {
    pub fn undefined(name: impl Into<String>, span: Span) -> Self {
        CompileError::Undefined {
            name: name.into(),
            span,
        }
    }

    pub fn unresolved_label(label: impl Into<String>, span: Span) -> Self {
        CompileError::UnresolvedLabel {
            label: label.into(),
            span,
        }
    }

    pub fn invalid(message: impl Into<String>, span: Span) -> Self {
        CompileError::Invalid {
            message: message.into(),
            span,
            hint: None,
        }
    }

    pub fn with_hint(message: impl Into<String>, span: Span, hint: impl Into<String>) -> Self {
        CompileError::Invalid {
            message: message.into(),
            span,
            hint: Some(hint.into()),
        }
    }

    pub fn internal(message: impl Into<String>, span: Span) -> Self {
        CompileError::Internal {
            message: message.into(),
            span,
        }
    }

    /// `cannot use <what> as <want> value in <context>`
    pub fn mismatch(what: impl std::fmt::Display, want: impl std::fmt::Display, context: &str, span: Span) -> Self {
        Self::invalid(format!("cannot use {} as {} value in {}", what, want, context), span)
    }

    pub fn capture(name: &str, span: Span) -> Self {
        Self::with_hint(
            format!("cannot capture local variable {} of an enclosing function", name),
            span,
            "function literals may only refer to globals and their own locals",
        )
    }

    pub fn span(&self) -> Span {
        match self {
            CompileError::Undefined { span, .. }
            | CompileError::UnresolvedLabel { span, .. }
            | CompileError::Invalid { span, .. }
            | CompileError::Internal { span, .. } => *span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_position() {
        let span = Span { line: 3, col: 7 };
        assert_eq!(CompileError::undefined("x", span).to_string(), "3:7: undefined: x");
        assert_eq!(
            CompileError::unresolved_label("main/done", span).to_string(),
            "3:7: label main/done not defined"
        );
    }

    #[test]
    fn test_hint_is_appended() {
        let span = Span { line: 1, col: 1 };
        let err = CompileError::with_hint("bad", span, "try this");
        assert_eq!(err.to_string(), "1:1: bad\n  hint: try this");
        assert_eq!(CompileError::invalid("bad", span).to_string(), "1:1: bad");
        assert_eq!(err.span(), span);
    }
}
