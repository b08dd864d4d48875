use crate::frontend::parser_error::ParserError;
use crate::frontend::token::{Delim, FuncSig, Keyword, Operator, Span, Tok, Token, TypeExpr};
use crate::lang::symbol::MAIN_SCOPE;

/// Statement-level driver around the expression shaper.
///
/// The parser consumes the nested token tree produced by the lexer and emits
/// one flat, execution-ordered token stream for a whole chunk:
/// - `import`, `type`, `const` and top-level `func` signatures are hoisted to
///   the head of the stream so that later code may refer to them before
///   their textual position
/// - every control structure is lowered to labels and jumps
/// - block scopes are bracketed by `Enter`/`Leave`
/// - expression statements are wrapped in `Mark`/`Discard`, except the last
///   top-level one, whose value becomes the result of the chunk
///
/// Label and scope names come from a counter owned by the caller, so a
/// long-lived session can keep them unique across chunks.
pub struct Parser<'a> {
    labels: &'a mut usize,
    /// Current scope path, innermost last. Never empty.
    scopes: Vec<String>,
    funcs: Vec<FuncFrame>,
    breaks: Vec<String>,
    continues: Vec<String>,
    hoisted: Vec<Token>,
    /// Span of the most recently started statement or operand.
    pub(crate) last_span: Span,
}

struct FuncFrame {
    name: String,
    named_results: Option<Vec<String>>,
}

/// What a statement left behind, used to pick the chunk's result.
enum Stmt {
    Expr,
    Assign(Option<String>),
    Other,
}

impl<'a> Parser<'a> {
    pub fn new(labels: &'a mut usize) -> Self {
        Parser {
            labels,
            scopes: vec![MAIN_SCOPE.to_string()],
            funcs: Vec::new(),
            breaks: Vec::new(),
            continues: Vec::new(),
            hoisted: Vec::new(),
            last_span: Span { line: 1, col: 1 },
        }
    }

    /// Parses a complete chunk.
    pub fn parse(&mut self, tokens: &[Token]) -> Result<Vec<Token>, ParserError> {
        let mut body = Vec::new();
        let mut tail = (Stmt::Other, 0);

        let mut i = 0;
        while i < tokens.len() {
            if tokens[i].tok == Tok::Semicolon {
                i += 1;
                continue;
            }
            let start = body.len();
            let (next, kind) = self.statement(tokens, i, &mut body)?;
            tail = (kind, start);
            i = next;
        }

        match tail {
            (Stmt::Expr, start) => {
                // keep the value of the final expression on the stack
                body.remove(start);
                body.pop();
            }
            (Stmt::Assign(Some(name)), _) => {
                body.push(Token::new(Tok::Ident(name), self.last_span));
            }
            _ => {}
        }

        let mut out = std::mem::take(&mut self.hoisted);
        out.extend(body);
        Ok(out)
    }

    // =========================================================================
    // Names
    // =========================================================================

    pub(crate) fn scope(&self) -> &str {
        self.scopes.last().map(String::as_str).unwrap_or(MAIN_SCOPE)
    }

    fn func_scope(&self) -> &str {
        self.funcs
            .last()
            .map(|f| f.name.as_str())
            .unwrap_or(MAIN_SCOPE)
    }

    fn at_top_level(&self) -> bool {
        self.funcs.is_empty() && self.scopes.len() == 1
    }

    /// A fresh local name such as `#x12`.
    pub(crate) fn fresh_name(&mut self, tag: &str) -> String {
        let n = *self.labels;
        *self.labels += 1;
        format!("#{}{}", tag, n)
    }

    /// A fresh name qualified by the current scope, such as `main/f/#x12`.
    pub(crate) fn fresh(&mut self, tag: &str) -> String {
        let name = self.fresh_name(tag);
        format!("{}/{}", self.scope(), name)
    }

    fn user_label(&self, name: &str) -> String {
        format!("{}/{}", self.func_scope(), name)
    }

    pub(crate) fn error(&self, toks: &[Token], i: usize, message: impl Into<String>) -> ParserError {
        let span = toks.get(i).map(|t| t.span).unwrap_or(self.last_span);
        ParserError::at(span, message)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statements(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        let mut i = 0;
        while i < toks.len() {
            if toks[i].tok == Tok::Semicolon {
                i += 1;
                continue;
            }
            let (next, _) = self.statement(toks, i, out)?;
            i = next;
        }
        Ok(())
    }

    /// Parses the statement starting at `toks[i]` and returns the index just
    /// past it.
    fn statement(
        &mut self,
        toks: &[Token],
        i: usize,
        out: &mut Vec<Token>,
    ) -> Result<(usize, Stmt), ParserError> {
        let span = toks[i].span;
        self.last_span = span;
        let end = end_of_statement(toks, i);

        match &toks[i].tok {
            Tok::Keyword(Keyword::If) => Ok((self.if_statement(toks, i, out)?, Stmt::Other)),
            Tok::Keyword(Keyword::For) => Ok((self.for_statement(toks, i, out)?, Stmt::Other)),
            Tok::Keyword(Keyword::Switch) => {
                Ok((self.switch_statement(toks, i, out)?, Stmt::Other))
            }
            Tok::Keyword(Keyword::Func) => {
                self.func_declaration(&toks[i..end], out)?;
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(Keyword::Var) => {
                self.var_declaration(&toks[i + 1..end], out)?;
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(Keyword::Const) => {
                self.const_declaration(&toks[i + 1..end], out)?;
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(Keyword::Type) => {
                self.type_declaration(&toks[i + 1..end], out)?;
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(Keyword::Import) => {
                self.import_declaration(&toks[i + 1..end])?;
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(Keyword::Package) => Ok((end, Stmt::Other)),
            Tok::Keyword(Keyword::Return) => {
                self.return_statement(&toks[i + 1..end], span, out)?;
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(kw @ (Keyword::Break | Keyword::Continue)) => {
                if end > i + 1 {
                    return Err(self.error(toks, i + 1, "labeled break/continue is not supported"));
                }
                let target = match kw {
                    Keyword::Break => self.breaks.last(),
                    _ => self.continues.last(),
                };
                let target = target.cloned().ok_or_else(|| {
                    ParserError::at(span, format!("{} is not in a loop", kw.as_str()))
                })?;
                out.push(Token::new(Tok::Goto(target), span));
                Ok((end, Stmt::Other))
            }
            Tok::Keyword(Keyword::Goto) => match toks.get(i + 1).map(|t| &t.tok) {
                Some(Tok::Ident(name)) if end == i + 2 => {
                    out.push(Token::new(Tok::Goto(self.user_label(name)), span));
                    Ok((end, Stmt::Other))
                }
                _ => Err(self.error(toks, i + 1, "expected label name after goto")),
            },
            Tok::Block(Delim::Brace, inner) => {
                self.scoped_block(inner, span, out)?;
                Ok((i + 1, Stmt::Other))
            }
            Tok::Ident(name) if matches!(toks.get(i + 1).map(|t| &t.tok), Some(Tok::Colon)) => {
                out.push(Token::new(Tok::Label(self.user_label(name)), span));
                Ok((i + 2, Stmt::Other))
            }
            Tok::Keyword(kw) => Err(ParserError::at(
                span,
                format!("unexpected keyword '{}' at start of statement", kw.as_str()),
            )),
            _ => {
                let kind = self.simple_statement(&toks[i..end], out)?;
                Ok((end, kind))
            }
        }
    }

    fn scoped_block(
        &mut self,
        inner: &[Token],
        span: Span,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        let scope = self.fresh("b");
        out.push(Token::new(Tok::Enter(scope.clone()), span));
        self.scopes.push(scope);
        let result = self.statements(inner, out);
        self.scopes.pop();
        result?;
        out.push(Token::new(Tok::Leave, self.last_span));
        Ok(())
    }

    /// Index of the body block of a control statement whose header starts at
    /// `from`.
    ///
    /// Inside a header a brace opens a composite literal only when it directly
    /// follows a type written with brackets (`[]T{`, `map[K]V{`) or the
    /// `struct` keyword; any other brace is the body.
    fn find_body(&self, toks: &[Token], from: usize) -> Result<usize, ParserError> {
        for j in from..toks.len() {
            if !matches!(toks[j].tok, Tok::Block(Delim::Brace, _)) {
                continue;
            }
            let prev = j.checked_sub(1).map(|k| &toks[k].tok);
            let before = j.checked_sub(2).map(|k| &toks[k].tok);
            let composite = match (before, prev) {
                (_, Some(Tok::Keyword(Keyword::Struct))) => true,
                (Some(Tok::Block(Delim::Bracket, _)), Some(Tok::Ident(_))) => j - 2 >= from,
                _ => false,
            };
            if !composite {
                return Ok(j);
            }
        }
        Err(self.error(toks, from.saturating_sub(1), "expected '{' to open the body"))
    }

    fn body_of<'t>(&self, toks: &'t [Token], j: usize) -> &'t [Token] {
        match &toks[j].tok {
            Tok::Block(_, inner) => inner,
            _ => &[],
        }
    }

    fn if_statement(
        &mut self,
        toks: &[Token],
        i: usize,
        out: &mut Vec<Token>,
    ) -> Result<usize, ParserError> {
        let span = toks[i].span;
        let body = self.find_body(toks, i + 1)?;
        let header = &toks[i + 1..body];
        let parts: Vec<&[Token]> = header.split(|t| t.tok == Tok::Semicolon).collect();
        let (init, cond) = match parts.as_slice() {
            [cond] => (None, *cond),
            [init, cond] => (Some(*init), *cond),
            _ => return Err(ParserError::at(span, "malformed if header")),
        };
        if cond.is_empty() {
            return Err(ParserError::at(span, "missing condition in if statement"));
        }

        let scope = self.fresh("b");
        out.push(Token::new(Tok::Enter(scope.clone()), span));
        self.scopes.push(scope);
        let else_label = self.fresh("else");

        if let Some(init) = init {
            self.simple_statement(init, out)?;
        }
        self.shape_expr(cond, out)?;
        out.push(Token::new(Tok::JumpFalse(else_label.clone()), span));
        self.scoped_block(self.body_of(toks, body), toks[body].span, out)?;

        let mut next = body + 1;
        if matches!(toks.get(next).map(|t| &t.tok), Some(Tok::Keyword(Keyword::Else))) {
            let end_label = self.fresh("end");
            out.push(Token::new(Tok::Goto(end_label.clone()), toks[next].span));
            out.push(Token::new(Tok::Label(else_label), toks[next].span));
            match toks.get(next + 1).map(|t| &t.tok) {
                Some(Tok::Keyword(Keyword::If)) => {
                    next = self.if_statement(toks, next + 1, out)?;
                }
                Some(Tok::Block(Delim::Brace, inner)) => {
                    self.scoped_block(inner, toks[next + 1].span, out)?;
                    next += 2;
                }
                _ => return Err(self.error(toks, next + 1, "expected 'if' or '{' after else")),
            }
            out.push(Token::new(Tok::Label(end_label), self.last_span));
        } else {
            out.push(Token::new(Tok::Label(else_label), self.last_span));
        }

        self.scopes.pop();
        out.push(Token::new(Tok::Leave, self.last_span));
        Ok(next)
    }

    fn for_statement(
        &mut self,
        toks: &[Token],
        i: usize,
        out: &mut Vec<Token>,
    ) -> Result<usize, ParserError> {
        let span = toks[i].span;
        let body = self.find_body(toks, i + 1)?;
        let header = &toks[i + 1..body];

        let scope = self.fresh("b");
        out.push(Token::new(Tok::Enter(scope.clone()), span));
        self.scopes.push(scope);

        let range_at = header
            .iter()
            .position(|t| t.tok == Tok::Keyword(Keyword::Range));
        match range_at {
            Some(r) => self.range_loop(header, r, toks, body, out)?,
            None => self.counted_loop(header, span, toks, body, out)?,
        }

        self.scopes.pop();
        out.push(Token::new(Tok::Leave, self.last_span));
        Ok(body + 1)
    }

    fn counted_loop(
        &mut self,
        header: &[Token],
        span: Span,
        toks: &[Token],
        body: usize,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        let parts: Vec<&[Token]> = header.split(|t| t.tok == Tok::Semicolon).collect();
        let (init, cond, post) = match parts.as_slice() {
            [cond] => (None, *cond, None),
            [init, cond, post] => (Some(*init), *cond, Some(*post)),
            _ => return Err(ParserError::at(span, "malformed for header")),
        };

        let cond_label = self.fresh("cond");
        let cont_label = self.fresh("cont");
        let end_label = self.fresh("end");

        if let Some(init) = init.filter(|t| !t.is_empty()) {
            self.simple_statement(init, out)?;
        }
        out.push(Token::new(Tok::Label(cond_label.clone()), span));
        if !cond.is_empty() {
            self.shape_expr(cond, out)?;
            out.push(Token::new(Tok::JumpFalse(end_label.clone()), span));
        }

        self.loop_body(toks, body, &end_label, &cont_label, out)?;

        out.push(Token::new(Tok::Label(cont_label), self.last_span));
        if let Some(post) = post.filter(|t| !t.is_empty()) {
            if post
                .iter()
                .any(|t| t.tok == Tok::Op(Operator::Define))
            {
                return Err(ParserError::at(post[0].span, "cannot declare in post statement of for loop"));
            }
            self.simple_statement(post, out)?;
        }
        out.push(Token::new(Tok::Goto(cond_label), self.last_span));
        out.push(Token::new(Tok::Label(end_label), self.last_span));
        Ok(())
    }

    fn range_loop(
        &mut self,
        header: &[Token],
        r: usize,
        toks: &[Token],
        body: usize,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        let span = header[r].span;
        let lhs = &header[..r];
        let (names, define) = match lhs.split_last() {
            None => (Vec::new(), false),
            Some((last, names)) => {
                let define = match last.tok {
                    Tok::Op(Operator::Define) => true,
                    Tok::Op(Operator::Assign) => false,
                    _ => return Err(ParserError::at(last.span, "expected := or = before range")),
                };
                let mut idents = Vec::new();
                for part in comma_list(names) {
                    match part {
                        [Token {
                            tok: Tok::Ident(name),
                            ..
                        }] => idents.push(name.clone()),
                        _ => {
                            return Err(ParserError::at(
                                span,
                                "range variables must be identifiers",
                            ));
                        }
                    }
                }
                (idents, define)
            }
        };
        if names.len() > 2 {
            return Err(ParserError::at(span, "range permits at most two iteration variables"));
        }
        let named = |k: usize| names.get(k).filter(|n| n.as_str() != "_").cloned();

        self.shape_expr(&header[r + 1..], out)?;
        out.push(Token::new(Tok::Range, span));

        let next_label = self.fresh("next");
        let end_label = self.fresh("end");
        out.push(Token::new(Tok::Label(next_label.clone()), span));
        out.push(Token::new(
            Tok::Next {
                label: end_label.clone(),
                key: named(0),
                value: named(1),
                define,
            },
            span,
        ));

        self.loop_body(toks, body, &end_label, &next_label, out)?;

        out.push(Token::new(Tok::Goto(next_label), self.last_span));
        out.push(Token::new(Tok::Label(end_label), self.last_span));
        out.push(Token::new(Tok::Drop, self.last_span));
        Ok(())
    }

    fn loop_body(
        &mut self,
        toks: &[Token],
        body: usize,
        brk: &str,
        cont: &str,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        self.breaks.push(brk.to_string());
        self.continues.push(cont.to_string());
        let result = self.scoped_block(self.body_of(toks, body), toks[body].span, out);
        self.breaks.pop();
        self.continues.pop();
        result
    }

    fn switch_statement(
        &mut self,
        toks: &[Token],
        i: usize,
        out: &mut Vec<Token>,
    ) -> Result<usize, ParserError> {
        let span = toks[i].span;
        let body = self.find_body(toks, i + 1)?;
        let header = &toks[i + 1..body];
        let parts: Vec<&[Token]> = header.split(|t| t.tok == Tok::Semicolon).collect();
        let (init, tag) = match parts.as_slice() {
            [tag] => (None, *tag),
            [init, tag] => (Some(*init), *tag),
            _ => return Err(ParserError::at(span, "malformed switch header")),
        };

        let scope = self.fresh("b");
        out.push(Token::new(Tok::Enter(scope.clone()), span));
        self.scopes.push(scope);

        if let Some(init) = init.filter(|t| !t.is_empty()) {
            self.simple_statement(init, out)?;
        }
        let tag_var = if tag.is_empty() {
            None
        } else {
            let name = self.fresh_name("tag");
            self.shape_expr(tag, out)?;
            out.push(Token::new(Tok::Ident(name.clone()), span));
            out.push(Token::new(Tok::Define, span));
            Some(name)
        };

        let clauses = self.case_clauses(self.body_of(toks, body))?;
        let end_label = self.fresh("end");
        let mut default_label = None;
        let mut case_labels = Vec::with_capacity(clauses.len());

        for clause in &clauses {
            let label = self.fresh("case");
            match &clause.exprs {
                None => {
                    if default_label.is_some() {
                        return Err(ParserError::at(clause.span, "multiple defaults in switch"));
                    }
                    default_label = Some(label.clone());
                }
                Some(exprs) => {
                    for expr in exprs {
                        match &tag_var {
                            Some(name) => {
                                out.push(Token::new(Tok::Ident(name.clone()), clause.span));
                                self.shape_expr(expr, out)?;
                                out.push(Token::new(Tok::Binary(Operator::Eql), clause.span));
                            }
                            None => self.shape_expr(expr, out)?,
                        }
                        out.push(Token::new(Tok::JumpTrue(label.clone()), clause.span));
                    }
                }
            }
            case_labels.push(label);
        }
        let fallback = default_label.unwrap_or_else(|| end_label.clone());
        out.push(Token::new(Tok::Goto(fallback), span));

        self.breaks.push(end_label.clone());
        for (clause, label) in clauses.iter().zip(case_labels) {
            out.push(Token::new(Tok::Label(label), clause.span));
            self.scoped_block(&clause.body, clause.span, out)?;
            out.push(Token::new(Tok::Goto(end_label.clone()), self.last_span));
        }
        self.breaks.pop();

        out.push(Token::new(Tok::Label(end_label), self.last_span));
        self.scopes.pop();
        out.push(Token::new(Tok::Leave, self.last_span));
        Ok(body + 1)
    }

    fn case_clauses(&self, toks: &[Token]) -> Result<Vec<CaseClause>, ParserError> {
        let mut clauses: Vec<CaseClause> = Vec::new();
        let mut i = 0;
        while i < toks.len() {
            let span = toks[i].span;
            match &toks[i].tok {
                Tok::Semicolon => {
                    i += 1;
                    continue;
                }
                Tok::Keyword(Keyword::Case) => {
                    let colon = toks[i..]
                        .iter()
                        .position(|t| t.tok == Tok::Colon)
                        .map(|p| p + i)
                        .ok_or_else(|| ParserError::at(span, "expected ':' after case"))?;
                    let exprs: Vec<Vec<Token>> =
                        comma_list(&toks[i + 1..colon]).into_iter().map(<[Token]>::to_vec).collect();
                    if exprs.is_empty() {
                        return Err(ParserError::at(span, "missing case expression"));
                    }
                    clauses.push(CaseClause {
                        span,
                        exprs: Some(exprs),
                        body: Vec::new(),
                    });
                    i = colon + 1;
                }
                Tok::Keyword(Keyword::Default) => {
                    if toks.get(i + 1).map(|t| &t.tok) != Some(&Tok::Colon) {
                        return Err(self.error(toks, i + 1, "expected ':' after default"));
                    }
                    clauses.push(CaseClause {
                        span,
                        exprs: None,
                        body: Vec::new(),
                    });
                    i += 2;
                }
                _ => {
                    let clause = clauses
                        .last_mut()
                        .ok_or_else(|| ParserError::at(span, "statement outside of case clause"))?;
                    let end = toks[i..]
                        .iter()
                        .position(|t| {
                            matches!(t.tok, Tok::Keyword(Keyword::Case | Keyword::Default))
                        })
                        .map(|p| p + i)
                        .unwrap_or(toks.len());
                    clause.body.extend_from_slice(&toks[i..end]);
                    i = end;
                }
            }
        }
        Ok(clauses)
    }

    fn return_statement(
        &mut self,
        toks: &[Token],
        span: Span,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        let named = match self.funcs.last() {
            Some(frame) => frame.named_results.clone(),
            None => return Err(ParserError::at(span, "return outside function")),
        };

        let exprs = comma_list(toks);
        match (exprs.is_empty(), named) {
            (true, Some(names)) => {
                for name in &names {
                    out.push(Token::new(Tok::Ident(name.clone()), span));
                }
                out.push(Token::new(Tok::Return(names.len()), span));
            }
            _ => {
                for expr in &exprs {
                    self.shape_expr(expr, out)?;
                }
                out.push(Token::new(Tok::Return(exprs.len()), span));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn func_declaration(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        let span = toks[0].span;
        let name = match toks.get(1).map(|t| &t.tok) {
            Some(Tok::Ident(name)) => name.clone(),
            Some(Tok::Block(Delim::Paren, _)) => {
                return Err(ParserError::at(span, "methods are not supported"));
            }
            _ => return Err(self.error(toks, 1, "expected function name")),
        };
        if !self.at_top_level() {
            return Err(ParserError::at(
                span,
                "function declarations are only allowed at top level",
            ));
        }
        let params = match toks.get(2).map(|t| &t.tok) {
            Some(Tok::Block(Delim::Paren, inner)) => inner,
            _ => return Err(self.error(toks, 2, "expected '(' after function name")),
        };
        let body = match toks.last().map(|t| &t.tok) {
            Some(Tok::Block(Delim::Brace, inner)) if toks.len() > 3 => inner,
            _ => {
                return Err(ParserError::at(
                    span,
                    format!("missing body for function '{}'", name),
                ));
            }
        };
        let sig = self.signature(params, &toks[3..toks.len() - 1])?;
        let key = format!("{}/{}", self.scope(), name);

        self.hoisted.push(Token::new(
            Tok::FuncDecl {
                name: key.clone(),
                sig: sig.clone(),
            },
            span,
        ));
        self.func_body(key, sig, body, span, out)
    }

    /// Emits `Func`, the body statements and the closing `<name>_end` label.
    pub(crate) fn func_body(
        &mut self,
        name: String,
        sig: FuncSig,
        body: &[Token],
        span: Span,
        out: &mut Vec<Token>,
    ) -> Result<(), ParserError> {
        out.push(Token::new(
            Tok::Func {
                name: name.clone(),
                sig: sig.clone(),
            },
            span,
        ));

        self.funcs.push(FuncFrame {
            name: name.clone(),
            named_results: sig.named_results(),
        });
        self.scopes.push(name.clone());
        let breaks = std::mem::take(&mut self.breaks);
        let continues = std::mem::take(&mut self.continues);

        let result = self.statements(body, out);

        self.breaks = breaks;
        self.continues = continues;
        self.scopes.pop();
        self.funcs.pop();
        result?;

        out.push(Token::new(Tok::Label(format!("{}_end", name)), self.last_span));
        Ok(())
    }

    fn var_declaration(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        for spec in group_specs(toks) {
            self.var_spec(&spec, out)?;
        }
        Ok(())
    }

    fn var_spec(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        let span = toks.first().map(|t| t.span).unwrap_or(self.last_span);
        let (names, ty, values) = self.value_spec(toks)?;
        if ty.is_none() && values.is_none() {
            return Err(ParserError::at(span, "missing type or initializer in var declaration"));
        }

        match values {
            Some(values) => {
                if values.len() != names.len() && values.len() != 1 {
                    return Err(ParserError::at(
                        span,
                        format!(
                            "assignment mismatch: {} variables but {} values",
                            names.len(),
                            values.len()
                        ),
                    ));
                }
                for value in &values {
                    self.shape_expr(value, out)?;
                }
                for name in names.iter().rev() {
                    out.push(Token::new(
                        Tok::Decl {
                            name: name.clone(),
                            ty: ty.clone(),
                            init: true,
                        },
                        span,
                    ));
                }
            }
            None => {
                for name in names {
                    out.push(Token::new(
                        Tok::Decl {
                            name,
                            ty: ty.clone(),
                            init: false,
                        },
                        span,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Splits `a, b T = x, y` into names, optional type and optional values.
    fn value_spec<'t>(
        &mut self,
        toks: &'t [Token],
    ) -> Result<(Vec<String>, Option<TypeExpr>, Option<Vec<&'t [Token]>>), ParserError> {
        let eq = toks.iter().position(|t| t.tok == Tok::Op(Operator::Assign));
        let (lhs, rhs) = match eq {
            Some(p) => (&toks[..p], Some(&toks[p + 1..])),
            None => (toks, None),
        };

        let mut names = Vec::new();
        let mut j = 0;
        loop {
            match lhs.get(j).map(|t| &t.tok) {
                Some(Tok::Ident(name)) => names.push(name.clone()),
                _ => return Err(self.error(lhs, j, "expected identifier in declaration")),
            }
            j += 1;
            if lhs.get(j).map(|t| &t.tok) == Some(&Tok::Comma) {
                j += 1;
            } else {
                break;
            }
        }

        let ty = if j < lhs.len() {
            Some(self.parse_type_all(&lhs[j..])?)
        } else {
            None
        };
        Ok((names, ty, rhs.map(comma_list)))
    }

    fn const_declaration(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        let mut decls = Vec::new();
        let mut previous: Option<(Option<TypeExpr>, Vec<Vec<Token>>)> = None;

        for (iota, spec) in group_specs(toks).iter().enumerate() {
            let span = spec.first().map(|t| t.span).unwrap_or(self.last_span);
            let (names, ty, values) = self.value_spec(spec)?;
            if let Some(values) = values {
                let mut shaped = Vec::with_capacity(values.len());
                for value in values {
                    let mut expr = Vec::new();
                    self.shape_expr(value, &mut expr)?;
                    shaped.push(expr);
                }
                previous = Some((ty, shaped));
            } else if ty.is_some() {
                return Err(ParserError::at(span, "const declaration with type needs a value"));
            }

            let (ty, exprs) = previous
                .as_ref()
                .ok_or_else(|| ParserError::at(span, "missing init expr for const declaration"))?;
            if exprs.len() != names.len() {
                return Err(ParserError::at(
                    span,
                    format!("{} constants but {} values", names.len(), exprs.len()),
                ));
            }
            for (name, expr) in names.into_iter().zip(exprs) {
                decls.push(Token::new(
                    Tok::ConstDecl {
                        name,
                        ty: ty.clone(),
                        expr: expr.clone(),
                        iota: iota as i64,
                    },
                    span,
                ));
            }
        }

        self.declarations(decls, out);
        Ok(())
    }

    fn type_declaration(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<(), ParserError> {
        let mut decls = Vec::new();
        for spec in group_specs(toks) {
            let span = spec.first().map(|t| t.span).unwrap_or(self.last_span);
            let name = match spec.first().map(|t| &t.tok) {
                Some(Tok::Ident(name)) => name.clone(),
                _ => return Err(ParserError::at(span, "expected type name")),
            };
            // `type A = B` declares an alias, which behaves the same here
            let rest = match spec.get(1).map(|t| &t.tok) {
                Some(Tok::Op(Operator::Assign)) => &spec[2..],
                _ => &spec[1..],
            };
            let ty = self.parse_type_all(rest)?;
            decls.push(Token::new(Tok::TypeDecl { name, ty }, span));
        }
        self.declarations(decls, out);
        Ok(())
    }

    fn import_declaration(&mut self, toks: &[Token]) -> Result<(), ParserError> {
        if !self.at_top_level() {
            return Err(self.error(toks, 0, "imports must be at top level"));
        }
        for spec in group_specs(toks) {
            let span = spec.first().map(|t| t.span).unwrap_or(self.last_span);
            let (name, path) = match spec.iter().map(|t| &t.tok).collect::<Vec<_>>().as_slice() {
                [Tok::Str(path)] => {
                    let name = path.rsplit('/').next().unwrap_or(path).to_string();
                    (name, path.clone())
                }
                [Tok::Ident(name), Tok::Str(path)] => (name.clone(), path.clone()),
                _ => return Err(ParserError::at(span, "malformed import")),
            };
            self.hoisted.push(Token::new(Tok::Import { name, path }, span));
        }
        Ok(())
    }

    /// Top-level declarations go to the hoisted head, nested ones stay put.
    fn declarations(&mut self, decls: Vec<Token>, out: &mut Vec<Token>) {
        if self.at_top_level() {
            self.hoisted.extend(decls);
        } else {
            out.extend(decls);
        }
    }

    // =========================================================================
    // Simple statements
    // =========================================================================

    fn simple_statement(&mut self, toks: &[Token], out: &mut Vec<Token>) -> Result<Stmt, ParserError> {
        let span = toks[0].span;
        let assign_at = toks.iter().position(|t| {
            matches!(
                t.tok,
                Tok::Op(
                    Operator::Assign
                        | Operator::Define
                        | Operator::AddAssign
                        | Operator::SubAssign
                        | Operator::MulAssign
                        | Operator::QuoAssign
                        | Operator::RemAssign
                        | Operator::Inc
                        | Operator::Dec
                )
            )
        });

        let Some(p) = assign_at else {
            out.push(Token::new(Tok::Mark, span));
            self.shape_expr(toks, out)?;
            out.push(Token::new(Tok::Discard, self.last_span));
            return Ok(Stmt::Expr);
        };

        let op = match toks[p].tok {
            Tok::Op(op) => op,
            _ => return Err(ParserError::at(toks[p].span, "expected assignment")),
        };
        let lhs = &toks[..p];
        let rhs = &toks[p + 1..];
        let op_span = toks[p].span;

        match op {
            Operator::Inc | Operator::Dec => {
                if !rhs.is_empty() {
                    return Err(ParserError::at(rhs[0].span, "unexpected token after ++/--"));
                }
                let one = [Token::new(Tok::Int(1), op_span)];
                self.assign_target(lhs, &one, op.compound_base(), op_span, out)
            }
            Operator::Assign | Operator::Define => {
                let targets = comma_list(lhs);
                let values = comma_list(rhs);
                if values.is_empty() || targets.is_empty() {
                    return Err(ParserError::at(op_span, "expected operands around assignment"));
                }
                let simple: Option<Vec<String>> = targets
                    .iter()
                    .map(|t| match t {
                        [Token {
                            tok: Tok::Ident(name),
                            ..
                        }] => Some(name.clone()),
                        _ => None,
                    })
                    .collect();

                match simple {
                    Some(names) => {
                        if values.len() != names.len() && values.len() != 1 {
                            return Err(ParserError::at(
                                op_span,
                                format!(
                                    "assignment mismatch: {} variables but {} values",
                                    names.len(),
                                    values.len()
                                ),
                            ));
                        }
                        for value in &values {
                            self.shape_expr(value, out)?;
                        }
                        let marker = if op == Operator::Define {
                            Tok::Define
                        } else {
                            Tok::Assign
                        };
                        for name in names.iter().rev() {
                            out.push(Token::new(Tok::Ident(name.clone()), op_span));
                            out.push(Token::new(marker.clone(), op_span));
                        }
                        let last = names.last().filter(|n| n.as_str() != "_").cloned();
                        Ok(Stmt::Assign(last))
                    }
                    None if op == Operator::Define => {
                        Err(ParserError::at(op_span, "non-name on left side of :="))
                    }
                    None if targets.len() > 1 || values.len() > 1 => Err(ParserError::at(
                        op_span,
                        "multiple assignment is only supported for plain variables",
                    )),
                    None => self.assign_target(lhs, rhs, None, op_span, out),
                }
            }
            _ => {
                if comma_list(lhs).len() != 1 || comma_list(rhs).len() != 1 {
                    return Err(ParserError::at(
                        op_span,
                        format!("{} takes exactly one operand on each side", op.as_str()),
                    ));
                }
                self.assign_target(lhs, rhs, op.compound_base(), op_span, out)
            }
        }
    }

    /// Assigns `value` (optionally combined with the current value through
    /// `op`) to a single target expression.
    fn assign_target(
        &mut self,
        target: &[Token],
        value: &[Token],
        op: Option<Operator>,
        span: Span,
        out: &mut Vec<Token>,
    ) -> Result<Stmt, ParserError> {
        let combine = |parser: &mut Self, out: &mut Vec<Token>| -> Result<(), ParserError> {
            parser.shape_expr(value, out)?;
            if let Some(op) = op {
                out.push(Token::new(Tok::Binary(op), span));
            }
            Ok(())
        };

        match target {
            [] => Err(ParserError::at(span, "missing assignment target")),
            [Token {
                tok: Tok::Ident(name),
                ..
            }] => {
                if op.is_some() {
                    out.push(Token::new(Tok::Ident(name.clone()), span));
                }
                combine(self, out)?;
                out.push(Token::new(Tok::Ident(name.clone()), span));
                out.push(Token::new(Tok::Assign, span));
                Ok(Stmt::Assign(Some(name.clone()).filter(|n| n != "_")))
            }
            [
                Token {
                    tok: Tok::Op(Operator::Mul),
                    ..
                },
                pointer @ ..,
            ] => {
                self.shape_expr(pointer, out)?;
                if op.is_some() {
                    self.shape_expr(pointer, out)?;
                    out.push(Token::new(Tok::Unary(Operator::Mul), span));
                }
                combine(self, out)?;
                out.push(Token::new(Tok::DerefAssign, span));
                Ok(Stmt::Other)
            }
            [
                base @ ..,
                Token {
                    tok: Tok::Block(Delim::Bracket, index),
                    ..
                },
            ] if !base.is_empty() && !index.iter().any(|t| t.tok == Tok::Colon) => {
                let index = without_semicolons(index);
                self.shape_expr(base, out)?;
                self.shape_expr(&index, out)?;
                if op.is_some() {
                    self.shape_expr(base, out)?;
                    self.shape_expr(&index, out)?;
                    out.push(Token::new(Tok::Index, span));
                }
                combine(self, out)?;
                out.push(Token::new(Tok::IndexAssign, span));
                Ok(Stmt::Other)
            }
            [
                Token {
                    tok: Tok::Ident(base),
                    ..
                },
                rest @ ..,
            ] => {
                let path = field_path(rest)
                    .ok_or_else(|| ParserError::at(span, "cannot assign to this expression"))?;
                out.push(Token::new(Tok::Place(base.clone()), span));
                if op.is_some() {
                    out.push(Token::new(Tok::Ident(base.clone()), span));
                    for field in &path {
                        out.push(Token::new(Tok::Field(field.clone()), span));
                    }
                }
                combine(self, out)?;
                out.push(Token::new(Tok::FieldAssign(path), span));
                Ok(Stmt::Other)
            }
            _ => Err(ParserError::at(span, "cannot assign to this expression")),
        }
    }
}

struct CaseClause {
    span: Span,
    /// `None` for `default`.
    exprs: Option<Vec<Vec<Token>>>,
    body: Vec<Token>,
}

/// Index of the semicolon ending the statement at `i` (or the slice length).
fn end_of_statement(toks: &[Token], i: usize) -> usize {
    toks[i..]
        .iter()
        .position(|t| t.tok == Tok::Semicolon)
        .map(|p| p + i)
        .unwrap_or(toks.len())
}

/// Splits on commas, dropping one trailing empty element.
pub(crate) fn comma_list(toks: &[Token]) -> Vec<&[Token]> {
    if toks.is_empty() {
        return Vec::new();
    }
    let mut parts: Vec<&[Token]> = toks.split(|t| t.tok == Tok::Comma).collect();
    if parts.len() > 1 && parts.last().map(|p| p.is_empty()).unwrap_or(false) {
        parts.pop();
    }
    parts
}

pub(crate) fn without_semicolons(toks: &[Token]) -> Vec<Token> {
    toks.iter()
        .filter(|t| t.tok != Tok::Semicolon)
        .cloned()
        .collect()
}

/// `var x int` or `var ( x int; y = 2 )`: one entry per spec.
fn group_specs(toks: &[Token]) -> Vec<Vec<Token>> {
    match toks {
        [Token {
            tok: Tok::Block(Delim::Paren, inner),
            ..
        }] => inner
            .split(|t| t.tok == Tok::Semicolon)
            .filter(|s| !s.is_empty())
            .map(<[Token]>::to_vec)
            .collect(),
        _ => vec![toks.to_vec()],
    }
}

/// `.a.b.c` into `["a", "b", "c"]`.
fn field_path(toks: &[Token]) -> Option<Vec<String>> {
    if toks.is_empty() || toks.len() % 2 != 0 {
        return None;
    }
    toks.chunks(2)
        .map(|pair| match (&pair[0].tok, &pair[1].tok) {
            (Tok::Dot, Tok::Ident(name)) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(source: &str) -> Result<Vec<Tok>, ParserError> {
        let tokens = Lexer::new(source).tokenize().expect("lexing should succeed");
        let mut labels = 0;
        let shaped = Parser::new(&mut labels).parse(&tokens)?;
        Ok(shaped.into_iter().map(|t| t.tok).collect())
    }

    fn render(source: &str) -> String {
        parse(source)
            .expect("parsing should succeed")
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn assert_parse_error(source: &str, contains: &str) {
        match parse(source) {
            Ok(toks) => panic!("expected error containing '{}', got {:?}", contains, toks),
            Err(e) => assert!(
                e.message.contains(contains),
                "expected error containing '{}', got: {}",
                contains,
                e.message
            ),
        }
    }

    #[test]
    fn test_final_expression_is_kept() {
        assert_eq!(render("1 + 2"), "1 2 +");
    }

    #[test]
    fn test_expression_statements_are_discarded() {
        assert_eq!(render("f()\ng()"), "Mark f Call(0) Discard g Call(0)");
    }

    #[test]
    fn test_define_emits_values_then_targets() {
        assert_eq!(render("a, b := 1, 2\nc := 3"), "1 2 b := a := 3 c := c");
    }

    #[test]
    fn test_trailing_assignment_loads_target() {
        assert_eq!(render("a = a + 3"), "a 3 + a = a");
    }

    #[test]
    fn test_compound_assignment() {
        assert_eq!(render("x *= y + 1\n"), "x y 1 + * x = x");
        assert_eq!(render("i++"), "i 1 + i = i");
    }

    #[test]
    fn test_index_and_field_assignment() {
        assert_eq!(render("a[i] = v"), "a i v IndexAssign");
        assert_eq!(render("p.x.y = 1"), "Place(p) 1 FieldAssign(x.y)");
        assert_eq!(render("*p += 2"), "p p *u 2 + DerefAssign");
    }

    #[test]
    fn test_if_else_lowering() {
        assert_eq!(
            render("if x { y() } else { z() }"),
            "Enter(main/#b0) x JumpFalse(main/#b0/#else1) \
             Enter(main/#b0/#b2) Mark y Call(0) Discard Leave \
             Goto(main/#b0/#end3) main/#b0/#else1: \
             Enter(main/#b0/#b4) Mark z Call(0) Discard Leave \
             main/#b0/#end3: Leave"
        );
    }

    #[test]
    fn test_for_loop_lowering() {
        let out = render("for i := 0; i < 3; i++ { }");
        assert!(out.starts_with("Enter(main/#b0) 0 i := main/#b0/#cond1: i 3 < JumpFalse(main/#b0/#end3)"));
        assert!(out.ends_with("main/#b0/#cont2: i 1 + i = Goto(main/#b0/#cond1) main/#b0/#end3: Leave"));
    }

    #[test]
    fn test_range_lowering() {
        let out = render("for _, v := range xs { }");
        assert!(out.contains("xs Range main/#b0/#next1: Next(main/#b0/#end2, _, v)"));
        assert!(out.ends_with("Goto(main/#b0/#next1) main/#b0/#end2: Drop Leave"));
    }

    #[test]
    fn test_break_and_continue_targets() {
        let out = render("for { if x { break }; continue }");
        assert!(out.contains("Goto(main/#b0/#end3)"));
        assert!(out.contains("Goto(main/#b0/#cont2)"));
    }

    #[test]
    fn test_break_outside_loop() {
        assert_parse_error("break", "not in a loop");
    }

    #[test]
    fn test_switch_lowering() {
        let out = render("switch x { case 1, 2: a()\ndefault: b() }");
        assert!(out.contains("x #tag1 :="));
        assert!(out.contains("#tag1 1 == JumpTrue(main/#b0/#case3)"));
        assert!(out.contains("#tag1 2 == JumpTrue(main/#b0/#case3)"));
        assert!(out.contains("Goto(main/#b0/#case4)"));
    }

    #[test]
    fn test_function_declaration_is_hoisted() {
        let out = render("x := f()\nfunc f() int { return 1 }");
        assert!(out.starts_with("FuncDecl(main/f() int)"));
        assert!(out.contains("Func(main/f() int) 1 Return(1) main/f_end:"));
    }

    #[test]
    fn test_named_result_bare_return() {
        let out = render("func f() (a, b int) { return }");
        assert!(out.contains("a b Return(2)"));
    }

    #[test]
    fn test_return_outside_function() {
        assert_parse_error("return 1", "return outside function");
    }

    #[test]
    fn test_const_group_with_iota() {
        let toks = parse("const (\n A = iota\n B\n C\n)").unwrap();
        let iotas: Vec<i64> = toks
            .iter()
            .filter_map(|t| match t {
                Tok::ConstDecl { iota, expr, .. } => {
                    assert_eq!(expr.len(), 1);
                    Some(*iota)
                }
                _ => None,
            })
            .collect();
        assert_eq!(iotas, vec![0, 1, 2]);
    }

    #[test]
    fn test_var_declarations() {
        assert_eq!(render("var a, b int"), "Decl(a int, false) Decl(b int, false)");
        assert_eq!(render("var x = 1"), "1 Decl(x, true)");
    }

    #[test]
    fn test_import_is_hoisted() {
        assert_eq!(
            render("x := 1\nimport \"fmt\""),
            "Import(fmt \"fmt\") 1 x :="
        );
    }

    #[test]
    fn test_user_labels_are_function_qualified() {
        let out = render("func f() { goto done\ndone: }");
        assert!(out.contains("Goto(main/f/done)"));
        assert!(out.contains("main/f/done:"));
    }

    #[test]
    fn test_methods_rejected() {
        assert_parse_error("func (p P) m() {}", "methods are not supported");
    }

    #[test]
    fn test_multi_target_needs_identifiers() {
        assert_parse_error("a[0], b = 1, 2", "only supported for plain variables");
    }

    #[test]
    fn test_labels_unique_across_parsers() {
        let mut labels = 0;
        let tokens = Lexer::new("if x { }").tokenize().unwrap();
        let first = Parser::new(&mut labels).parse(&tokens).unwrap();
        let second = Parser::new(&mut labels).parse(&tokens).unwrap();
        assert_ne!(first, second);
    }
}
