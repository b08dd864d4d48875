use thiserror::Error;

use crate::frontend::token::{Delim, Keyword, Operator, Span, Tok, Token};

/// A scanning error with source location.
///
/// `incomplete` is set when the input simply ended too early (an open block
/// or string), so an interactive driver can ask for more lines instead of
/// reporting a failure.
#[derive(Debug, Clone, Error)]
#[error("{line}:{col}: {message}")]
pub struct LexerError {
    pub message: String,
    pub line: usize,
    pub col: usize,
    pub incomplete: bool,
}

impl LexerError {
    fn at(span: Span, message: impl Into<String>) -> Self {
        LexerError {
            message: message.into(),
            line: span.line,
            col: span.col,
            incomplete: false,
        }
    }

    fn incomplete(span: Span, message: impl Into<String>) -> Self {
        LexerError {
            incomplete: true,
            ..LexerError::at(span, message)
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Skips a `//` or `/* */` comment. Returns true if the comment spanned a
    /// newline, which counts as a line break for semicolon insertion.
    fn skip_comment(&mut self) -> Result<bool, LexerError> {
        let start = self.span();
        self.advance();
        if self.advance() == Some('/') {
            while let Some(ch) = self.current() {
                if ch == '\n' {
                    break;
                }
                self.advance();
            }
            return Ok(false);
        }

        let mut newline = false;
        loop {
            match self.current() {
                Some('*') if self.peek() == Some('/') => {
                    self.advance();
                    self.advance();
                    return Ok(newline);
                }
                Some(ch) => {
                    newline |= ch == '\n';
                    self.advance();
                }
                None => return Err(LexerError::incomplete(start, "comment not terminated")),
            }
        }
    }

    fn read_escape(&mut self) -> Result<char, LexerError> {
        self.advance();
        let ch = match self.current() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('\\') => '\\',
            Some('"') => '"',
            Some('\'') => '\'',
            Some('0') => '\0',
            Some(ch) => {
                return Err(LexerError::at(
                    self.span(),
                    format!("unknown escape sequence: \\{}", ch),
                ));
            }
            None => {
                return Err(LexerError::incomplete(
                    self.span(),
                    "unexpected EOF in escape sequence",
                ));
            }
        };
        self.advance();
        Ok(ch)
    }

    fn read_string(&mut self) -> Result<Tok, LexerError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Tok::Str(string));
                }
                Some('\\') => string.push(self.read_escape()?),
                Some('\n') => {
                    return Err(LexerError::at(
                        start,
                        "unterminated string (newline before closing quote)",
                    ));
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => return Err(LexerError::incomplete(start, "unterminated string literal")),
            }
        }
    }

    fn read_raw_string(&mut self) -> Result<Tok, LexerError> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        loop {
            match self.advance() {
                Some('`') => return Ok(Tok::Str(string)),
                Some('\r') => {}
                Some(ch) => string.push(ch),
                None => {
                    return Err(LexerError::incomplete(
                        start,
                        "unterminated raw string literal",
                    ));
                }
            }
        }
    }

    fn read_rune(&mut self) -> Result<Tok, LexerError> {
        let start = self.span();
        self.advance();
        let ch = match self.current() {
            Some('\\') => self.read_escape()?,
            Some('\'') | Some('\n') | None => {
                return Err(LexerError::at(start, "empty or unterminated rune literal"));
            }
            Some(ch) => {
                self.advance();
                ch
            }
        };
        if self.current() != Some('\'') {
            return Err(LexerError::at(start, "rune literal must hold one character"));
        }
        self.advance();
        Ok(Tok::Int(ch as i64))
    }

    fn read_number(&mut self) -> Result<Tok, LexerError> {
        let start = self.span();

        // Hex: 0x... or 0X...
        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();

            let mut hex = String::new();
            while let Some(ch) = self.current() {
                if ch.is_ascii_hexdigit() {
                    hex.push(ch);
                    self.advance();
                } else if ch == '_' {
                    self.advance();
                } else {
                    break;
                }
            }

            if hex.is_empty() {
                return Err(LexerError::at(start, "expected hex digits after 0x"));
            }

            let value = i64::from_str_radix(&hex, 16)
                .map_err(|_| LexerError::at(start, format!("invalid hex number: 0x{}", hex)))?;
            return Ok(Tok::Int(value));
        }

        let mut digits = String::new();
        let mut is_float = false;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else if ch == '_' {
                self.advance();
            } else if ch == '.' && !is_float {
                // `1..` never happens in this language, but `a[1:].` could
                is_float = true;
                digits.push('.');
                self.advance();
            } else if (ch == 'e' || ch == 'E') && !digits.is_empty() {
                is_float = true;
                digits.push('e');
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.current() {
                    digits.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        if is_float {
            let value: f64 = digits
                .parse()
                .map_err(|_| LexerError::at(start, format!("invalid float: {}", digits)))?;
            Ok(Tok::Float(value))
        } else {
            let value: i64 = digits
                .parse()
                .map_err(|_| LexerError::at(start, format!("invalid integer: {}", digits)))?;
            Ok(Tok::Int(value))
        }
    }

    fn read_identifier(&mut self) -> Tok {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        match Keyword::from_ident(&ident) {
            Some(kw) => Tok::Keyword(kw),
            None => Tok::Ident(ident),
        }
    }

    fn read_operator(&mut self) -> Option<Tok> {
        let ch = self.current()?;
        let next = self.peek();

        let (tok, len) = match (ch, next) {
            ('.', Some('.')) if self.source.get(self.pos + 2) == Some(&'.') => (Tok::Ellipsis, 3),
            ('&', Some('&')) => (Tok::Op(Operator::LAnd), 2),
            ('|', Some('|')) => (Tok::Op(Operator::LOr), 2),
            ('<', Some('<')) => (Tok::Op(Operator::Shl), 2),
            ('>', Some('>')) => (Tok::Op(Operator::Shr), 2),
            ('=', Some('=')) => (Tok::Op(Operator::Eql), 2),
            ('!', Some('=')) => (Tok::Op(Operator::Neq), 2),
            ('<', Some('=')) => (Tok::Op(Operator::Leq), 2),
            ('>', Some('=')) => (Tok::Op(Operator::Geq), 2),
            (':', Some('=')) => (Tok::Op(Operator::Define), 2),
            ('+', Some('=')) => (Tok::Op(Operator::AddAssign), 2),
            ('-', Some('=')) => (Tok::Op(Operator::SubAssign), 2),
            ('*', Some('=')) => (Tok::Op(Operator::MulAssign), 2),
            ('/', Some('=')) => (Tok::Op(Operator::QuoAssign), 2),
            ('%', Some('=')) => (Tok::Op(Operator::RemAssign), 2),
            ('+', Some('+')) => (Tok::Op(Operator::Inc), 2),
            ('-', Some('-')) => (Tok::Op(Operator::Dec), 2),
            ('+', _) => (Tok::Op(Operator::Add), 1),
            ('-', _) => (Tok::Op(Operator::Sub), 1),
            ('*', _) => (Tok::Op(Operator::Mul), 1),
            ('/', _) => (Tok::Op(Operator::Quo), 1),
            ('%', _) => (Tok::Op(Operator::Rem), 1),
            ('&', _) => (Tok::Op(Operator::And), 1),
            ('|', _) => (Tok::Op(Operator::Or), 1),
            ('^', _) => (Tok::Op(Operator::Xor), 1),
            ('!', _) => (Tok::Op(Operator::Not), 1),
            ('=', _) => (Tok::Op(Operator::Assign), 1),
            ('<', _) => (Tok::Op(Operator::Lss), 1),
            ('>', _) => (Tok::Op(Operator::Gtr), 1),
            (':', _) => (Tok::Colon, 1),
            ('.', _) => (Tok::Dot, 1),
            (',', _) => (Tok::Comma, 1),
            (';', _) => (Tok::Semicolon, 1),
            _ => return None,
        };

        for _ in 0..len {
            self.advance();
        }
        Some(tok)
    }

    /// Scans the whole source into a flat token list where every bracketed
    /// group is a single `Tok::Block`.
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexerError> {
        self.scan_until(None)
    }

    fn scan_until(&mut self, closer: Option<(Delim, Span)>) -> Result<Vec<Token>, LexerError> {
        let mut tokens: Vec<Token> = Vec::new();

        loop {
            self.skip_whitespace();
            let span = self.span();

            let insert_semicolon =
                |tokens: &mut Vec<Token>, span: Span| match tokens.last() {
                    Some(last) if last.tok.ends_statement() => {
                        tokens.push(Token::new(Tok::Semicolon, span));
                    }
                    _ => {}
                };

            match self.current() {
                None => {
                    if let Some((delim, open)) = closer {
                        return Err(LexerError::incomplete(
                            open,
                            format!("block not terminated: missing '{}'", delim.close()),
                        ));
                    }
                    insert_semicolon(&mut tokens, span);
                    return Ok(tokens);
                }
                Some('\n') => {
                    insert_semicolon(&mut tokens, span);
                    self.advance();
                }
                Some('/') if matches!(self.peek(), Some('/') | Some('*')) => {
                    if self.skip_comment()? {
                        insert_semicolon(&mut tokens, span);
                    }
                }
                Some(ch @ ('(' | '[' | '{')) => {
                    let delim = match ch {
                        '(' => Delim::Paren,
                        '[' => Delim::Bracket,
                        _ => Delim::Brace,
                    };
                    self.advance();
                    let inner = self.scan_until(Some((delim, span)))?;
                    tokens.push(Token::new(Tok::Block(delim, inner), span));
                }
                Some(ch @ (')' | ']' | '}')) => match closer {
                    Some((delim, _)) if delim.close() == ch => {
                        self.advance();
                        if delim == Delim::Brace {
                            insert_semicolon(&mut tokens, span);
                        }
                        return Ok(tokens);
                    }
                    _ => {
                        return Err(LexerError::at(span, format!("unexpected '{}'", ch)));
                    }
                },
                Some('"') => {
                    let tok = self.read_string()?;
                    tokens.push(Token::new(tok, span));
                }
                Some('`') => {
                    let tok = self.read_raw_string()?;
                    tokens.push(Token::new(tok, span));
                }
                Some('\'') => {
                    let tok = self.read_rune()?;
                    tokens.push(Token::new(tok, span));
                }
                Some('.') if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                    let tok = self.read_number()?;
                    tokens.push(Token::new(tok, span));
                }
                Some(ch) if ch.is_ascii_digit() => {
                    let tok = self.read_number()?;
                    tokens.push(Token::new(tok, span));
                }
                Some(ch) if ch.is_alphabetic() || ch == '_' => {
                    let tok = self.read_identifier();
                    tokens.push(Token::new(tok, span));
                }
                Some(ch) => match self.read_operator() {
                    Some(tok) => tokens.push(Token::new(tok, span)),
                    None => {
                        return Err(LexerError::at(
                            span,
                            format!("unexpected character: '{}'", ch),
                        ));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Tok> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    fn ident(s: &str) -> Tok {
        Tok::Ident(s.to_string())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(
            tokens("1 + 2*x"),
            vec![
                Tok::Int(1),
                Tok::Op(Operator::Add),
                Tok::Int(2),
                Tok::Op(Operator::Mul),
                ident("x"),
                Tok::Semicolon,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            tokens("a := b && c || d != e"),
            vec![
                ident("a"),
                Tok::Op(Operator::Define),
                ident("b"),
                Tok::Op(Operator::LAnd),
                ident("c"),
                Tok::Op(Operator::LOr),
                ident("d"),
                Tok::Op(Operator::Neq),
                ident("e"),
                Tok::Semicolon,
            ]
        );
    }

    #[test]
    fn test_blocks_are_nested() {
        let t = tokens("f(a, [b])");
        assert_eq!(t.len(), 3);
        match &t[1] {
            Tok::Block(Delim::Paren, inner) => {
                assert_eq!(inner.len(), 3);
                assert!(matches!(inner[2].tok, Tok::Block(Delim::Bracket, _)));
            }
            other => panic!("expected paren block, got {:?}", other),
        }
    }

    #[test]
    fn test_semicolon_insertion() {
        let t = tokens("x := 1\ny++\nreturn\n");
        let semis = t.iter().filter(|t| **t == Tok::Semicolon).count();
        assert_eq!(semis, 3);
    }

    #[test]
    fn test_no_semicolon_after_operator() {
        let t = tokens("x := 1 +\n 2");
        assert_eq!(t.iter().filter(|t| **t == Tok::Semicolon).count(), 1);
    }

    #[test]
    fn test_semicolon_before_closing_brace() {
        let t = tokens("{ x }");
        match &t[0] {
            Tok::Block(Delim::Brace, inner) => {
                assert_eq!(inner.last().map(|t| &t.tok), Some(&Tok::Semicolon));
            }
            other => panic!("expected brace block, got {:?}", other),
        }
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            tokens("func range map"),
            vec![
                Tok::Keyword(Keyword::Func),
                Tok::Keyword(Keyword::Range),
                Tok::Keyword(Keyword::Map),
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("0xff 1.5 2e3 .5 1_000"),
            vec![
                Tok::Int(255),
                Tok::Float(1.5),
                Tok::Float(2000.0),
                Tok::Float(0.5),
                Tok::Int(1000),
                Tok::Semicolon,
            ]
        );
    }

    #[test]
    fn test_strings_and_runes() {
        assert_eq!(
            tokens(r#""a\tb" `raw\n` 'x'"#),
            vec![
                Tok::Str("a\tb".to_string()),
                Tok::Str("raw\\n".to_string()),
                Tok::Int('x' as i64),
                Tok::Semicolon,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens("a // trailing\n/* block */ b"),
            vec![ident("a"), Tok::Semicolon, ident("b"), Tok::Semicolon]
        );
    }

    #[test]
    fn test_unterminated_block_is_incomplete() {
        let err = Lexer::new("func f() {\n x := 1\n").tokenize().unwrap_err();
        assert!(err.is_incomplete());
        assert!(err.message.contains("block not terminated"));
        assert_eq!((err.line, err.col), (1, 10));
    }

    #[test]
    fn test_unterminated_string_is_incomplete() {
        let err = Lexer::new("\"abc").tokenize().unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_mismatched_closer() {
        let err = Lexer::new("(a]").tokenize().unwrap_err();
        assert!(!err.is_incomplete());
        assert!(err.message.contains("unexpected ']'"));
    }

    #[test]
    fn test_unknown_escape_error() {
        let err = Lexer::new(r#""\q""#).tokenize().unwrap_err();
        assert!(err.message.contains("unknown escape"));
    }

    #[test]
    fn test_spans() {
        let toks = Lexer::new("a\n  b").tokenize().unwrap();
        assert_eq!(toks[0].span, Span { line: 1, col: 1 });
        assert_eq!(toks[2].span, Span { line: 2, col: 3 });
    }
}
