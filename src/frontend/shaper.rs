//! Operator-precedence shaping of expressions.
//!
//! Expressions arrive as infix token slices (with nested blocks) and leave as
//! an execution-ordered stream: operands first, then the operator that
//! consumes them. Calls put their arguments before the callee, and `&&`/`||`
//! become a conditional jump over the right operand.

use crate::frontend::parser::{Parser, comma_list, without_semicolons};
use crate::frontend::parser_error::ParserError;
use crate::frontend::token::{
    CompositeKeys, Delim, FuncSig, Keyword, Operator, Param, Span, Tok, Token, TypeExpr,
};

/// Prefix operators bind tighter than every binary operator.
const UNARY_PRECEDENCE: u8 = 6;

/// An operator waiting on the shaper's stack.
#[derive(Debug)]
enum Pending {
    Unary(Operator),
    Binary(Operator),
    /// `&&` or `||`, with the label that closes its right operand.
    Logic(Operator, String),
}

impl Pending {
    fn precedence(&self) -> u8 {
        match self {
            Pending::Unary(_) => UNARY_PRECEDENCE,
            Pending::Binary(op) | Pending::Logic(op, _) => op.precedence().unwrap_or(0),
        }
    }

    fn into_token(self, span: Span) -> Token {
        let tok = match self {
            Pending::Unary(op) => Tok::Unary(op),
            Pending::Binary(op) => Tok::Binary(op),
            Pending::Logic(_, label) => Tok::Label(label),
        };
        Token::new(tok, span)
    }
}

enum ParamEntry {
    Named(String, TypeExpr),
    /// A lone identifier: a name when other entries are named, else a type.
    Lone(String),
    Bare(TypeExpr),
}

impl Parser<'_> {
    /// Shapes one expression into `out`.
    pub(crate) fn shape_expr(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        if toks.is_empty() {
            return Err(ParserError::at(self.last_span, "expected expression"));
        }

        let mut ops: Vec<(Pending, Span)> = Vec::new();
        let mut expect_operand = true;
        let mut i = 0;

        while i < toks.len() {
            let token = &toks[i];
            self.last_span = token.span;

            if expect_operand {
                if let Tok::Op(op) = token.tok {
                    if !op.is_unary() {
                        return Err(ParserError::at(
                            token.span,
                            format!("unexpected operator '{}'", op.as_str()),
                        ));
                    }
                    // right-associative: never flush on a prefix operator
                    ops.push((Pending::Unary(op), token.span));
                    i += 1;
                    continue;
                }
                i = self.primary(toks, i, out)?;
                expect_operand = false;
                continue;
            }

            let op = match token.tok {
                Tok::Op(op) => op,
                _ => {
                    return Err(ParserError::at(
                        token.span,
                        format!("unexpected '{}' in expression", token.tok),
                    ));
                }
            };
            let prec = op.precedence().ok_or_else(|| {
                ParserError::at(
                    token.span,
                    format!("operator '{}' is not allowed in an expression", op.as_str()),
                )
            })?;

            while let Some((top, _)) = ops.last() {
                if top.precedence() < prec {
                    break;
                }
                if let Some((top, span)) = ops.pop() {
                    out.push(top.into_token(span));
                }
            }

            match op {
                Operator::LAnd | Operator::LOr => {
                    let label = self.fresh("x");
                    let jump = if op == Operator::LAnd {
                        Tok::JumpSetFalse(label.clone())
                    } else {
                        Tok::JumpSetTrue(label.clone())
                    };
                    out.push(Token::new(jump, token.span));
                    ops.push((Pending::Logic(op, label), token.span));
                }
                _ => ops.push((Pending::Binary(op), token.span)),
            }
            expect_operand = true;
            i += 1;
        }

        if expect_operand {
            return Err(ParserError::at(self.last_span, "expected operand at end of expression"));
        }
        while let Some((op, span)) = ops.pop() {
            out.push(op.into_token(span));
        }
        Ok(())
    }

    /// Shapes an operand together with its postfix chain (selectors, calls,
    /// indexing) and returns the index past it.
    fn primary(&mut self, toks: &[Token], i: usize, out: &mut Vec<Token>) -> Result<usize, ParserError> {
        let start = out.len();
        let token = &toks[i];
        let span = token.span;

        let mut j = match &token.tok {
            Tok::Int(_) | Tok::Float(_) | Tok::Str(_) => {
                out.push(token.clone());
                i + 1
            }
            Tok::Ident(name) => match toks.get(i + 1).map(|t| &t.tok) {
                Some(Tok::Block(Delim::Brace, inner)) => {
                    self.composite(TypeExpr::Name(name.clone()), inner, span, out)?;
                    i + 2
                }
                _ => {
                    out.push(token.clone());
                    i + 1
                }
            },
            Tok::Block(Delim::Paren, inner) => {
                let inner = without_semicolons(inner);
                self.shape_expr(&inner, out)?;
                i + 1
            }
            Tok::Keyword(Keyword::Func)
                if matches!(toks.get(i + 1).map(|t| &t.tok), Some(Tok::Block(Delim::Paren, _))) =>
            {
                self.func_literal(toks, i, out)?
            }
            Tok::Block(Delim::Bracket, _) | Tok::Keyword(Keyword::Map | Keyword::Struct) => {
                let (ty, next) = self.parse_type(toks, i)?;
                match toks.get(next).map(|t| &t.tok) {
                    Some(Tok::Block(Delim::Brace, inner)) => {
                        self.composite(ty, inner, span, out)?;
                        next + 1
                    }
                    _ => {
                        out.push(Token::new(Tok::TypeRef(ty), span));
                        next
                    }
                }
            }
            other => {
                return Err(ParserError::at(span, format!("unexpected '{}' in expression", other)));
            }
        };

        loop {
            let Some(next) = toks.get(j) else { break };
            match &next.tok {
                Tok::Dot => match toks.get(j + 1).map(|t| &t.tok) {
                    Some(Tok::Ident(field)) => {
                        out.push(Token::new(Tok::Field(field.clone()), next.span));
                        j += 2;
                    }
                    _ => return Err(self.error(toks, j + 1, "expected field name after '.'")),
                },
                Tok::Block(Delim::Paren, inner) => {
                    self.call(inner, start, next.span, out)?;
                    j += 1;
                }
                Tok::Block(Delim::Bracket, inner) => {
                    self.index(inner, next.span, out)?;
                    j += 1;
                }
                _ => break,
            }
        }
        Ok(j)
    }

    /// Moves the already shaped callee behind its arguments.
    fn call(&mut self, inner: &[Token], start: usize, span: Span, out: &mut Vec<Token>) -> Result<(), ParserError> {
        let inner = without_semicolons(inner);
        let args = comma_list(&inner);
        let mut shaped = Vec::new();
        let mut spread = false;

        for (k, arg) in args.iter().enumerate() {
            let arg = match arg.split_last() {
                Some((last, rest)) if last.tok == Tok::Ellipsis => {
                    if k + 1 != args.len() {
                        return Err(ParserError::at(last.span, "can only use ... with final argument"));
                    }
                    spread = true;
                    rest
                }
                _ => *arg,
            };
            self.shape_expr(arg, &mut shaped)?;
        }

        let callee = out.split_off(start);
        out.extend(shaped);
        out.extend(callee);
        out.push(Token::new(
            Tok::Call {
                argc: args.len(),
                spread,
            },
            span,
        ));
        Ok(())
    }

    fn index(&mut self, inner: &[Token], span: Span, out: &mut Vec<Token>) -> Result<(), ParserError> {
        let inner = without_semicolons(inner);
        match inner.iter().position(|t| t.tok == Tok::Colon) {
            Some(c) => {
                let (low, high) = (&inner[..c], &inner[c + 1..]);
                if !low.is_empty() {
                    self.shape_expr(low, out)?;
                }
                if !high.is_empty() {
                    self.shape_expr(high, out)?;
                }
                out.push(Token::new(
                    Tok::Slice {
                        low: !low.is_empty(),
                        high: !high.is_empty(),
                    },
                    span,
                ));
            }
            None => {
                self.shape_expr(&inner, out)?;
                out.push(Token::new(Tok::Index, span));
            }
        }
        Ok(())
    }

    /// `func(params) results { body }` in operand position.
    fn func_literal(&mut self, toks: &[Token], i: usize, out: &mut Vec<Token>) -> Result<usize, ParserError> {
        let span = toks[i].span;
        let params = match &toks[i + 1].tok {
            Tok::Block(Delim::Paren, inner) => inner,
            _ => return Err(self.error(toks, i + 1, "expected parameter list")),
        };
        let body = toks[i + 2..]
            .iter()
            .enumerate()
            .find(|(k, t)| {
                matches!(t.tok, Tok::Block(Delim::Brace, _))
                    && !(*k > 0 && toks[i + 1 + k].tok == Tok::Keyword(Keyword::Struct))
            })
            .map(|(k, _)| i + 2 + k);

        let Some(body) = body else {
            // no body: this is a func type, e.g. a conversion target
            let (ty, next) = self.parse_type(toks, i)?;
            out.push(Token::new(Tok::TypeRef(ty), span));
            return Ok(next);
        };

        let sig = self.signature(params, &toks[i + 2..body])?;
        let short = self.fresh_name("lit");
        let name = format!("{}/{}", self.scope(), short);
        let inner = match &toks[body].tok {
            Tok::Block(_, inner) => inner.as_slice(),
            _ => &[],
        };
        self.func_body(name, sig, inner, span, out)?;
        out.push(Token::new(Tok::Ident(short), span));
        Ok(body + 1)
    }

    /// Shapes `T{...}`. Element values come first, then the `Composite`
    /// marker. Elements written as bare `{...}` take the element type of `ty`.
    fn composite(&mut self, ty: TypeExpr, inner: &[Token], span: Span, out: &mut Vec<Token>) -> Result<(), ParserError> {
        let inner = without_semicolons(inner);
        let elems = comma_list(&inner);

        let (key_ty, elem_ty) = match &ty {
            TypeExpr::Slice(e) => (None, Some((**e).clone())),
            TypeExpr::Map(k, v) => (Some((**k).clone()), Some((**v).clone())),
            _ => (None, None),
        };

        let colons: Vec<Option<usize>> = elems
            .iter()
            .map(|e| e.iter().position(|t| t.tok == Tok::Colon))
            .collect();
        let keyed = colons.iter().filter(|c| c.is_some()).count();
        if keyed != 0 && keyed != elems.len() {
            return Err(ParserError::at(span, "mixture of field:value and value elements in composite literal"));
        }

        let keys = if keyed == 0 {
            CompositeKeys::Positional
        } else if matches!(ty, TypeExpr::Map(..)) {
            CompositeKeys::Pairs
        } else {
            let names: Option<Vec<String>> = elems
                .iter()
                .zip(&colons)
                .map(|(e, c)| match (&e[..c.unwrap_or(0)], c) {
                    (
                        [Token {
                            tok: Tok::Ident(name),
                            ..
                        }],
                        Some(_),
                    ) => Some(name.clone()),
                    _ => None,
                })
                .collect();
            match names {
                Some(names) => CompositeKeys::Fields(names),
                None => CompositeKeys::Pairs,
            }
        };

        for (elem, colon) in elems.iter().zip(&colons) {
            match (&keys, colon) {
                (CompositeKeys::Fields(_), Some(c)) => {
                    self.element(&elem[c + 1..], None, span, out)?;
                }
                (CompositeKeys::Pairs, Some(c)) => {
                    self.element(&elem[..*c], key_ty.as_ref(), span, out)?;
                    self.element(&elem[c + 1..], elem_ty.as_ref(), span, out)?;
                }
                _ => self.element(elem, elem_ty.as_ref(), span, out)?,
            }
        }

        out.push(Token::new(
            Tok::Composite {
                ty,
                len: elems.len(),
                keys,
            },
            span,
        ));
        Ok(())
    }

    fn element(
        &mut self,
        toks: &[Token],
        implied: Option<&TypeExpr>,
        span: Span,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        match (toks, implied) {
            (
                [Token {
                    tok: Tok::Block(Delim::Brace, inner),
                    span,
                }],
                Some(ty),
            ) => self.composite(ty.clone(), inner, *span, out),
            (
                [Token {
                    tok: Tok::Block(Delim::Brace, _),
                    span,
                }],
                None,
            ) => Err(ParserError::at(*span, "missing type in composite literal")),
            ([], _) => Err(ParserError::at(span, "missing element in composite literal")),
            _ => self.shape_expr(toks, out),
        }
    }

    // =========================================================================
    // Types
    // =========================================================================

    /// Parses a type starting at `toks[i]`; returns it with the index past it.
    pub(crate) fn parse_type(&self, toks: &[Token], i: usize) -> Result<(TypeExpr, usize), ParserError> {
        let Some(token) = toks.get(i) else {
            return Err(self.error(toks, i, "expected type"));
        };

        match &token.tok {
            Tok::Ident(name) => Ok((TypeExpr::Name(name.clone()), i + 1)),
            Tok::Block(Delim::Bracket, inner) => {
                if !inner.is_empty() {
                    return Err(ParserError::at(token.span, "fixed-length arrays are not supported"));
                }
                let (elem, next) = self.parse_type(toks, i + 1)?;
                Ok((TypeExpr::Slice(Box::new(elem)), next))
            }
            Tok::Keyword(Keyword::Map) => {
                let key = match toks.get(i + 1).map(|t| &t.tok) {
                    Some(Tok::Block(Delim::Bracket, inner)) => self.parse_type_all(inner)?,
                    _ => return Err(self.error(toks, i + 1, "expected '[' after map")),
                };
                let (value, next) = self.parse_type(toks, i + 2)?;
                Ok((TypeExpr::Map(Box::new(key), Box::new(value)), next))
            }
            Tok::Op(Operator::Mul) => {
                let (elem, next) = self.parse_type(toks, i + 1)?;
                Ok((TypeExpr::Ptr(Box::new(elem)), next))
            }
            Tok::Keyword(Keyword::Func) => {
                let params = match toks.get(i + 1).map(|t| &t.tok) {
                    Some(Tok::Block(Delim::Paren, inner)) => inner,
                    _ => return Err(self.error(toks, i + 1, "expected '(' after func")),
                };
                let (results, next) = match toks.get(i + 2).map(|t| &t.tok) {
                    Some(Tok::Block(Delim::Paren, _)) => (&toks[i + 2..i + 3], i + 3),
                    Some(
                        Tok::Ident(_)
                        | Tok::Block(Delim::Bracket, _)
                        | Tok::Keyword(Keyword::Map | Keyword::Func | Keyword::Struct)
                        | Tok::Op(Operator::Mul),
                    ) => {
                        let (_, next) = self.parse_type(toks, i + 2)?;
                        (&toks[i + 2..next], next)
                    }
                    _ => (&toks[i + 2..i + 2], i + 2),
                };
                Ok((TypeExpr::Func(self.signature(params, results)?), next))
            }
            Tok::Keyword(Keyword::Struct) => match toks.get(i + 1).map(|t| &t.tok) {
                Some(Tok::Block(Delim::Brace, inner)) => Ok((self.struct_fields(inner)?, i + 2)),
                _ => Err(self.error(toks, i + 1, "expected '{' after struct")),
            },
            Tok::Block(Delim::Paren, inner) => Ok((self.parse_type_all(inner)?, i + 1)),
            other => Err(ParserError::at(token.span, format!("expected type, found '{}'", other))),
        }
    }

    /// Parses a token slice that must hold exactly one type.
    pub(crate) fn parse_type_all(&self, toks: &[Token]) -> Result<TypeExpr, ParserError> {
        let (ty, next) = self.parse_type(toks, 0)?;
        if next != toks.len() {
            return Err(self.error(toks, next, "unexpected token after type"));
        }
        Ok(ty)
    }

    fn struct_fields(&self, inner: &[Token]) -> Result<TypeExpr, ParserError> {
        let mut fields = Vec::new();
        for decl in inner.split(|t| t.tok == Tok::Semicolon).filter(|d| !d.is_empty()) {
            let mut names = Vec::new();
            let mut j = 0;
            while let Some(Tok::Ident(name)) = decl.get(j).map(|t| &t.tok) {
                names.push(name.clone());
                if decl.get(j + 1).map(|t| &t.tok) == Some(&Tok::Comma) {
                    j += 2;
                } else {
                    j += 1;
                    break;
                }
            }
            if names.is_empty() || j >= decl.len() {
                return Err(ParserError::at(decl[0].span, "embedded fields are not supported"));
            }
            let ty = self.parse_type_all(&decl[j..])?;
            for name in names {
                fields.push((name, ty.clone()));
            }
        }
        Ok(TypeExpr::Struct(fields))
    }

    /// Builds a signature from the parameter block contents and the tokens
    /// between it and the body.
    pub(crate) fn signature(&self, params: &[Token], results: &[Token]) -> Result<FuncSig, ParserError> {
        let (params, variadic) = self.param_list(params)?;
        let results = match results {
            [] => Vec::new(),
            [
                Token {
                    tok: Tok::Block(Delim::Paren, inner),
                    ..
                },
            ] => {
                let (results, variadic) = self.param_list(inner)?;
                if variadic {
                    return Err(ParserError::at(results_span(inner, self.last_span), "results cannot be variadic"));
                }
                results
            }
            _ => vec![Param {
                name: None,
                ty: self.parse_type_all(results)?,
            }],
        };
        Ok(FuncSig {
            params,
            results,
            variadic,
        })
    }

    /// Go-style parameter lists: `a, b int, c string` or `int, string`.
    fn param_list(&self, toks: &[Token]) -> Result<(Vec<Param>, bool), ParserError> {
        let toks = without_semicolons(toks);
        let entries = comma_list(&toks);
        let mut parsed = Vec::with_capacity(entries.len());
        let mut variadic = false;

        for (k, entry) in entries.iter().enumerate() {
            let span = entry.first().map(|t| t.span).unwrap_or(self.last_span);
            let (name, rest) = match entry {
                [Token {
                    tok: Tok::Ident(name),
                    ..
                }] => {
                    parsed.push(ParamEntry::Lone(name.clone()));
                    continue;
                }
                [
                    Token {
                        tok: Tok::Ident(name),
                        ..
                    },
                    rest @ ..,
                ] if !rest.is_empty() && rest[0].tok != Tok::Dot => (Some(name.clone()), rest),
                _ => (None, *entry),
            };
            let rest = match rest.split_first() {
                Some((first, tail)) if first.tok == Tok::Ellipsis => {
                    if k + 1 != entries.len() {
                        return Err(ParserError::at(first.span, "can only use ... with final parameter"));
                    }
                    variadic = true;
                    tail
                }
                _ => rest,
            };
            if rest.is_empty() {
                return Err(ParserError::at(span, "missing parameter type"));
            }
            let ty = self.parse_type_all(rest)?;
            parsed.push(match name {
                Some(name) => ParamEntry::Named(name, ty),
                None => ParamEntry::Bare(ty),
            });
        }

        let any_named = parsed.iter().any(|p| matches!(p, ParamEntry::Named(..)));
        let mut params = Vec::with_capacity(parsed.len());
        if any_named {
            let mut carried: Option<TypeExpr> = None;
            for entry in parsed.into_iter().rev() {
                match entry {
                    ParamEntry::Named(name, ty) => {
                        carried = Some(ty.clone());
                        params.push(Param { name: Some(name), ty });
                    }
                    ParamEntry::Lone(name) => match &carried {
                        Some(ty) => params.push(Param {
                            name: Some(name),
                            ty: ty.clone(),
                        }),
                        None => {
                            return Err(ParserError::at(self.last_span, "mixed named and unnamed parameters"));
                        }
                    },
                    ParamEntry::Bare(_) => {
                        return Err(ParserError::at(self.last_span, "mixed named and unnamed parameters"));
                    }
                }
            }
            params.reverse();
        } else {
            for entry in parsed {
                let ty = match entry {
                    ParamEntry::Lone(name) => TypeExpr::Name(name),
                    ParamEntry::Bare(ty) | ParamEntry::Named(_, ty) => ty,
                };
                params.push(Param { name: None, ty });
            }
        }
        Ok((params, variadic))
    }
}

fn results_span(toks: &[Token], fallback: Span) -> Span {
    toks.first().map(|t| t.span).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;
    use proptest::prelude::*;

    fn shape(source: &str) -> Result<String, ParserError> {
        let tokens = Lexer::new(source).tokenize().expect("lexing should succeed");
        let tokens: Vec<Token> = tokens.into_iter().filter(|t| t.tok != Tok::Semicolon).collect();
        let mut labels = 0;
        let mut parser = Parser::new(&mut labels);
        let mut out = Vec::new();
        parser.shape_expr(&tokens, &mut out)?;
        Ok(out.iter().map(|t| t.tok.to_string()).collect::<Vec<_>>().join(" "))
    }

    fn assert_shape(source: &str, expected: &str) {
        assert_eq!(shape(source).expect("shaping should succeed"), expected);
    }

    #[test]
    fn test_precedence() {
        assert_shape("1 + 2 * 3", "1 2 3 * +");
        assert_shape("(1 + 2) * 3", "1 2 + 3 *");
        assert_shape("a - b - c", "a b - c -");
        assert_shape("a < b == c", "a b < c ==");
        assert_shape("a == b && c", "a b == JumpSetFalse(main/#x0) c main/#x0:");
    }

    #[test]
    fn test_unary_vs_binary() {
        assert_shape("-a * b", "a -u b *");
        assert_shape("a - -b", "a b -u -");
        assert_shape("!!x", "x !u !u");
        assert_shape("*p + &x", "p *u x &u +");
    }

    #[test]
    fn test_short_circuit_labels() {
        assert_shape("a && b", "a JumpSetFalse(main/#x0) b main/#x0:");
        assert_shape(
            "a || b && c",
            "a JumpSetTrue(main/#x0) b JumpSetFalse(main/#x1) c main/#x1: main/#x0:",
        );
        assert_shape(
            "a && b || c",
            "a JumpSetFalse(main/#x0) b main/#x0: JumpSetTrue(main/#x1) c main/#x1:",
        );
    }

    #[test]
    fn test_calls_put_arguments_first() {
        assert_shape("f(1, g(2))", "1 2 g Call(1) f Call(2)");
        assert_shape("fmt.Println(x)", "x fmt .Println Call(1)");
        assert_shape("f(x)(y)", "y x f Call(1) Call(1)");
        assert_shape("append(a, b...)", "a b append Call(2...)");
    }

    #[test]
    fn test_index_and_slice() {
        assert_shape("a[i+1]", "a i 1 + Index");
        assert_shape("s[1:]", "s 1 Slice(true, false)");
        assert_shape("s[:n]", "s n Slice(false, true)");
        assert_shape("m[k].x", "m k Index .x");
    }

    #[test]
    fn test_composites() {
        assert_shape("[]int{1, 2}", "1 2 Composite([]int, 2)");
        assert_shape("Point{X: 1, Y: 2}", "1 2 Composite(Point, 2)");
        assert_shape(
            "map[string]int{\"a\": 1}",
            "\"a\" 1 Composite(map[string]int, 1)",
        );
        assert_shape(
            "[]Point{{1, 2}, {3, 4}}",
            "1 2 Composite(Point, 2) 3 4 Composite(Point, 2) Composite([]Point, 2)",
        );
    }

    #[test]
    fn test_elided_type_needs_context() {
        let err = shape("Point{{1}}").unwrap_err();
        assert!(err.message.contains("missing type"));
    }

    #[test]
    fn test_type_operands() {
        assert_shape("make([]int, 3)", "Type([]int) 3 make Call(2)");
        assert_shape("float64(x)", "x float64 Call(1)");
    }

    #[test]
    fn test_func_literal_is_emitted_inline() {
        assert_shape(
            "func(x int) int { return x }(3)",
            "3 Func(main/#lit0(int) int) x Return(1) main/#lit0_end: #lit0 Call(1)",
        );
    }

    #[test]
    fn test_errors() {
        assert!(shape("1 +").unwrap_err().message.contains("expected operand"));
        assert!(shape("1 2").unwrap_err().message.contains("unexpected"));
        assert!(shape("* / 2").unwrap_err().message.contains("unexpected operator"));
    }

    #[test]
    fn test_signatures() {
        let tokens = Lexer::new("(a, b int, c ...string) (int, error)").tokenize().unwrap();
        let mut labels = 0;
        let parser = Parser::new(&mut labels);
        let params = match &tokens[0].tok {
            Tok::Block(_, inner) => inner.clone(),
            _ => unreachable!(),
        };
        let sig = parser.signature(&params, &tokens[1..2]).unwrap();
        assert_eq!(sig.to_string(), "(int, int, ...string) (int, error)");
        assert!(sig.variadic);
        assert_eq!(sig.params[1].name.as_deref(), Some("b"));
    }

    /// Reference evaluation of a shaped arithmetic stream.
    fn eval_postfix(shaped: &str) -> i64 {
        let mut stack: Vec<i64> = Vec::new();
        for tok in shaped.split(' ') {
            match tok {
                "+" | "-" | "*" => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(match tok {
                        "+" => a.wrapping_add(b),
                        "-" => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    });
                }
                "-u" => {
                    let a = stack.pop().unwrap();
                    stack.push(a.wrapping_neg());
                }
                n => stack.push(n.parse().unwrap()),
            }
        }
        stack.pop().unwrap()
    }

    fn reference(nums: &[i64], ops: &[usize]) -> i64 {
        // multiplication first, then left-to-right addition/subtraction
        let mut terms = vec![nums[0]];
        let mut signs = vec![1i64];
        for (k, op) in ops.iter().enumerate() {
            let n = nums[k + 1];
            match op {
                0 => {
                    terms.push(n);
                    signs.push(1);
                }
                1 => {
                    terms.push(n);
                    signs.push(-1);
                }
                _ => {
                    let last = terms.len() - 1;
                    terms[last] = terms[last].wrapping_mul(n);
                }
            }
        }
        terms
            .iter()
            .zip(signs)
            .fold(0i64, |acc, (t, s)| acc.wrapping_add(t.wrapping_mul(s)))
    }

    proptest! {
        #[test]
        fn shaped_arithmetic_matches_precedence(
            nums in prop::collection::vec(0i64..100, 1..8),
            ops in prop::collection::vec(0usize..3, 7),
        ) {
            let ops = &ops[..nums.len() - 1];
            let mut source = nums[0].to_string();
            for (k, op) in ops.iter().enumerate() {
                source.push_str([" + ", " - ", " * "][*op]);
                source.push_str(&nums[k + 1].to_string());
            }
            let shaped = shape(&source).unwrap();
            prop_assert_eq!(eval_postfix(&shaped), reference(&nums, ops));
        }
    }
}
