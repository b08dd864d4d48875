use crate::frontend::token::{Tok, Token};

/// Prints a shaped token stream, one token per line, for `--tokens`.
pub struct TokenDumper {
    pub color: bool,
    /// Indent function bodies and block scopes.
    pub indent: bool,
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            indent: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const BLU: &'static str = "\x1b[34m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn flat(mut self) -> Self {
        self.indent = false;
        self
    }

    pub fn dump(&self, tokens: &[Token]) {
        for line in self.render(tokens) {
            println!("{}", line);
        }
    }

    pub fn render(&self, tokens: &[Token]) -> Vec<String> {
        let mut depth = 0usize;
        let mut lines = Vec::with_capacity(tokens.len());

        for t in tokens {
            let closes = matches!(t.tok, Tok::Leave)
                || matches!(&t.tok, Tok::Label(l) if l.ends_with("_end"));
            if closes {
                depth = depth.saturating_sub(1);
            }

            let pad = if self.indent { "  ".repeat(depth) } else { String::new() };
            let (colr, reset) = if self.color {
                (self.color_of(&t.tok), Self::RESET)
            } else {
                ("", "")
            };
            lines.push(format!(
                "[{:02}:{:02}] {}{}{:<8} {}{}",
                t.span.line,
                t.span.col,
                pad,
                colr,
                self.kind(&t.tok),
                t.tok,
                reset
            ));

            if matches!(t.tok, Tok::Enter(_) | Tok::Func { .. }) {
                depth += 1;
            }
        }
        lines
    }

    fn kind(&self, t: &Tok) -> &'static str {
        match t {
            Tok::Int(_) | Tok::Float(_) => "NUMBER",
            Tok::Str(_) => "STRING",
            Tok::Ident(_) | Tok::Place(_) => "IDENT",
            Tok::Binary(_) | Tok::Unary(_) => "OP",
            Tok::Call { .. } => "CALL",
            Tok::Index | Tok::Slice { .. } | Tok::Field(_) | Tok::Composite { .. } => "ACCESS",
            Tok::TypeRef(_) | Tok::TypeDecl { .. } => "TYPE",
            Tok::Define
            | Tok::Assign
            | Tok::IndexAssign
            | Tok::FieldAssign(_)
            | Tok::DerefAssign
            | Tok::Decl { .. } => "STORE",
            Tok::ConstDecl { .. } => "CONST",
            Tok::Import { .. } => "IMPORT",
            Tok::FuncDecl { .. } | Tok::Func { .. } | Tok::Return(_) => "FUNC",
            Tok::Label(_) => "LABEL",
            Tok::Goto(_)
            | Tok::JumpFalse(_)
            | Tok::JumpTrue(_)
            | Tok::JumpSetFalse(_)
            | Tok::JumpSetTrue(_)
            | Tok::Range
            | Tok::Next { .. } => "JUMP",
            Tok::Enter(_) | Tok::Leave => "SCOPE",
            Tok::Mark | Tok::Discard | Tok::Drop => "STACK",
            _ => "LEXEME",
        }
    }

    fn color_of(&self, t: &Tok) -> &'static str {
        match t {
            Tok::Enter(_) | Tok::Leave | Tok::Mark | Tok::Discard | Tok::Drop => Self::DIM,
            Tok::Str(_) => Self::GRN,
            Tok::Int(_) | Tok::Float(_) => Self::CYN,
            Tok::Ident(_) | Tok::Place(_) => Self::YEL,
            Tok::Binary(_) | Tok::Unary(_) => Self::MAG,
            Tok::Label(_)
            | Tok::Goto(_)
            | Tok::JumpFalse(_)
            | Tok::JumpTrue(_)
            | Tok::JumpSetFalse(_)
            | Tok::JumpSetTrue(_) => Self::BLU,
            _ => Self::RESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::token::Span;

    #[test]
    fn test_render_plain() {
        let span = Span { line: 1, col: 3 };
        let tokens = vec![
            Token::new(Tok::Enter("main/#b0".into()), span),
            Token::new(Tok::Int(1), span),
            Token::new(Tok::Leave, span),
        ];
        let lines = TokenDumper::new().no_color().render(&tokens);
        assert_eq!(lines[0], "[01:03] SCOPE    Enter(main/#b0)");
        assert_eq!(lines[1], "[01:03]   NUMBER   1");
        assert_eq!(lines[2], "[01:03] SCOPE    Leave");
    }

    #[test]
    fn test_render_flat() {
        let span = Span { line: 2, col: 1 };
        let tokens = vec![
            Token::new(Tok::Enter("s".into()), span),
            Token::new(Tok::Ident("x".into()), span),
        ];
        let lines = TokenDumper::new().no_color().flat().render(&tokens);
        assert_eq!(lines[1], "[02:01] IDENT    x");
    }
}
