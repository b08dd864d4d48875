use std::collections::HashSet;

use tracing::{debug, trace, warn};

use crate::{
    bytecode::{
        Layout, Op, Program,
        compile_error::CompileError,
        operand_stack::{Konst, Operand, OperandStack},
    },
    frontend::token::{CompositeKeys, FuncSig, Operator, Span, Tok, Token, TypeExpr},
    lang::{
        symbol::{Address, Builtin, Kind, MAIN_SCOPE, Slot, Symbol, SymbolTable, qualify},
        types::{FuncType, Type},
        value::{self, BinOp, UnOp, Value, ValueError},
    },
    runtime::host::Registry,
};

/// Destination of a jump emitted before the destination was compiled.
#[derive(Debug, Clone, PartialEq)]
enum Target {
    Label(String),
    Func(String),
}

#[derive(Debug, Clone)]
struct PendingJump {
    site: usize,
    target: Target,
    span: Span,
}

/// State of the function body being compiled.
struct FuncCtx {
    key: String,
    sig: FuncType,
    nlocals: usize,
    grow_site: usize,
    /// Jump over the body; absent when the body sits at the entry point.
    skip_site: Option<usize>,
    stack_base: usize,
    marks_base: usize,
}

/// Compile-time constant expression element.
enum ConstItem {
    Value(Value, Type),
    Type(Type),
}

/// Single-pass compiler from the shaped token stream to bytecode.
///
/// The compiler appends to a [`Program`] owned by the caller and registers
/// names in the caller's [`SymbolTable`], so a session can feed it one chunk
/// at a time. Types are tracked on a symbolic operand stack mirroring the VM
/// stack; that is what lets it type-check, coerce `int` operands into
/// `float64` slots, fold constants and count the slots a discarded
/// expression statement leaves behind.
///
/// Jumps to labels or functions not compiled yet are recorded and patched
/// in a final pass once the whole chunk is done.
pub struct Compiler<'s> {
    symbols: &'s mut SymbolTable,
    program: &'s mut Program,
    registry: &'s Registry,
    stack: OperandStack,
    scopes: Vec<String>,
    funcs: Vec<FuncCtx>,
    marks: Vec<usize>,
    pending: Vec<PendingJump>,
    /// Labels defined by this chunk.
    labels: HashSet<String>,
    /// Code index of the most recent jump target.
    last_label_at: Option<usize>,
}

impl<'s> Compiler<'s> {
    pub fn new(symbols: &'s mut SymbolTable, program: &'s mut Program, registry: &'s Registry) -> Self {
        Compiler {
            symbols,
            program,
            registry,
            stack: OperandStack::new(),
            scopes: vec![MAIN_SCOPE.to_string()],
            funcs: Vec::new(),
            marks: Vec::new(),
            pending: Vec::new(),
            labels: HashSet::new(),
            last_label_at: None,
        }
    }

    /// Compiles one chunk. Top-level code is appended at the end of the
    /// program; a value left by the final expression stays on the stack.
    pub fn compile(mut self, tokens: &[Token]) -> Result<(), CompileError> {
        let head = tokens.iter().take_while(|t| is_hoisted(&t.tok)).count();
        self.declarations(&tokens[..head])?;

        let mut i = head;
        while i < tokens.len() {
            i = self.token(tokens, i)?;
        }
        self.finish()
    }

    /// Hoisted declarations in dependency order: packages and types first so
    /// that signatures and constants may refer to them.
    fn declarations(&mut self, head: &[Token]) -> Result<(), CompileError> {
        for pass in 0..4 {
            for t in head {
                match (&t.tok, pass) {
                    (Tok::Import { name, path }, 0) => self.import(name, path, t.span)?,
                    (Tok::TypeDecl { name, ty }, 1) => self.type_decl(name, ty, t.span)?,
                    (
                        Tok::ConstDecl {
                            name,
                            ty,
                            expr,
                            iota,
                        },
                        2,
                    ) => self.const_decl(name, ty.as_ref(), expr, *iota, t.span)?,
                    (Tok::FuncDecl { name, sig }, 3) => self.func_decl(name, sig, t.span)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), CompileError> {
        if let Some(f) = self.funcs.last() {
            return Err(CompileError::internal(
                format!("function {} is not terminated", f.key),
                Span::default(),
            ));
        }
        for jump in std::mem::take(&mut self.pending) {
            let target = match &jump.target {
                Target::Label(label) => self
                    .local_label(label)
                    .ok_or_else(|| CompileError::unresolved_label(short_name(label), jump.span))?,
                Target::Func(key) => match self.symbols.lookup(key).and_then(|s| s.value.as_ref()) {
                    Some(Value::Func(offset)) => *offset,
                    _ => {
                        return Err(CompileError::with_hint(
                            format!("missing function body for {}", short_name(key)),
                            jump.span,
                            "declare the function with a body in the same input",
                        ));
                    }
                },
            };
            self.patch(jump.site, target);
        }
        Ok(())
    }

    // =========================================================================
    // Token dispatch
    // =========================================================================

    /// Compiles the token at `i` and returns the index of the next one.
    fn token(&mut self, toks: &[Token], i: usize) -> Result<usize, CompileError> {
        let span = toks[i].span;
        match &toks[i].tok {
            Tok::Int(n) => self.constant(Value::Int(*n), Type::Int, span),
            Tok::Float(x) => self.constant(Value::Float(*x), Type::Float, span),
            Tok::Str(s) => self.constant(Value::Str(s.clone()), Type::String, span),
            Tok::Ident(_) => return self.ident(toks, i),

            Tok::Binary(op) => self.binary(*op, span)?,
            Tok::Unary(op) => self.unary(*op, span)?,
            Tok::Call { argc, spread } => self.call(*argc, *spread, span)?,
            Tok::Index => self.index(span)?,
            Tok::Slice { low, high } => self.slice(*low, *high, span)?,
            Tok::Field(name) => self.field(name, span)?,
            Tok::Composite { ty, len, keys } => self.composite(ty, *len, keys, span)?,
            Tok::TypeRef(ty) => {
                let ty = self.resolve_type(ty, span)?;
                self.stack.push(Operand::Type(ty));
            }

            Tok::Decl { name, ty, init } => self.declare(name, ty.as_ref(), *init, span)?,
            Tok::Place(name) => self.place(name, span)?,
            Tok::IndexAssign => self.index_assign(span)?,
            Tok::FieldAssign(path) => self.field_assign(path, span)?,
            Tok::DerefAssign => self.deref_assign(span)?,
            Tok::ConstDecl {
                name,
                ty,
                expr,
                iota,
            } => self.const_decl(name, ty.as_ref(), expr, *iota, span)?,
            Tok::TypeDecl { name, ty } => self.type_decl(name, ty, span)?,
            Tok::Import { name, path } => self.import(name, path, span)?,
            Tok::FuncDecl { name, sig } => self.func_decl(name, sig, span)?,
            Tok::Func { name, sig } => self.func_begin(name, sig, span)?,
            Tok::Return(n) => self.ret(*n, span)?,

            Tok::Label(label) => self.label(label, span)?,
            Tok::Goto(label) => self.jump(Op::Jump(0), label, span),
            Tok::JumpFalse(label) => {
                self.pop_bool(span)?;
                self.jump(Op::JumpFalse(0), label, span);
            }
            Tok::JumpTrue(label) => {
                self.pop_bool(span)?;
                self.jump(Op::JumpTrue(0), label, span);
            }
            Tok::JumpSetFalse(label) => {
                self.pop_bool(span)?;
                self.jump(Op::JumpSetFalse(0), label, span);
            }
            Tok::JumpSetTrue(label) => {
                self.pop_bool(span)?;
                self.jump(Op::JumpSetTrue(0), label, span);
            }

            Tok::Range => self.range(span)?,
            Tok::Next {
                label,
                key,
                value,
                define,
            } => self.next(label, key.as_deref(), value.as_deref(), *define, span)?,
            Tok::Enter(scope) => self.scopes.push(scope.clone()),
            Tok::Leave => {
                self.scopes.pop();
            }
            Tok::Mark => self.marks.push(self.stack.len()),
            Tok::Discard => {
                let height = self
                    .marks
                    .pop()
                    .ok_or_else(|| CompileError::internal("discard without mark", span))?;
                let slots = self.stack.truncate(height);
                if slots > 0 {
                    self.emit(Op::Pop(slots), span);
                }
            }
            Tok::Drop => match self.stack.pop() {
                Some(Operand::Iter { .. }) => {
                    self.emit(Op::Pop(1), span);
                }
                _ => return Err(CompileError::internal("drop without range iterator", span)),
            },

            Tok::Define | Tok::Assign => {
                return Err(CompileError::internal("store without a target name", span));
            }
            other => {
                return Err(CompileError::internal(format!("unexpected token '{}'", other), span));
            }
        }
        Ok(i + 1)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn scope(&self) -> &str {
        self.scopes.last().map(String::as_str).unwrap_or(MAIN_SCOPE)
    }

    fn emit(&mut self, op: Op, span: Span) -> usize {
        trace!(at = self.program.code.len(), op = %op, "emit");
        self.program.emit(op, span)
    }

    fn code_len(&self) -> usize {
        self.program.code.len()
    }

    /// Points the jump at `site` to the absolute code index `target`.
    fn patch(&mut self, site: usize, target: usize) {
        let rel = target as isize - site as isize;
        self.program.code[site].op.set_jump_offset(rel);
    }

    fn local_label(&self, label: &str) -> Option<usize> {
        if self.labels.contains(label) {
            self.symbols.label(label)
        } else {
            None
        }
    }

    fn jump(&mut self, op: Op, label: &str, span: Span) {
        let site = self.emit(op, span);
        match self.local_label(label) {
            Some(target) => self.patch(site, target),
            None => self.pending.push(PendingJump {
                site,
                target: Target::Label(label.to_string()),
                span,
            }),
        }
    }

    fn pop_operand(&mut self, span: Span) -> Result<Operand, CompileError> {
        self.stack
            .pop()
            .ok_or_else(|| CompileError::internal("operand stack underflow", span))
    }

    fn pop_operands(&mut self, n: usize, span: Span) -> Result<Vec<Operand>, CompileError> {
        self.stack
            .pop_n(n)
            .ok_or_else(|| CompileError::internal("operand stack underflow", span))
    }

    /// Pops an operand that must be a runtime value.
    fn pop_value(&mut self, span: Span) -> Result<(Type, Option<Konst>), CompileError> {
        expect_value(self.pop_operand(span)?, span)
    }

    fn pop_bool(&mut self, span: Span) -> Result<(), CompileError> {
        let (ty, _) = self.pop_value(span)?;
        if ty == Type::Bool || ty.is_dynamic() {
            Ok(())
        } else {
            Err(CompileError::invalid(
                format!("non-boolean condition (type {})", ty),
                span,
            ))
        }
    }

    /// The last instruction loads `konst` and nothing may jump in between.
    fn is_trailing(&self, konst: &Konst) -> bool {
        konst.at + 1 == self.code_len() && self.last_label_at != Some(konst.at)
    }

    fn constant(&mut self, value: Value, ty: Type, span: Span) {
        let at = match &value {
            Value::Str(s) => {
                let slot = self.program.string_slot(s);
                self.emit(Op::Get(Slot::Global(slot)), span)
            }
            _ => self.emit(Op::Push(value.clone()), span),
        };
        self.stack.push(Operand::constant(value, ty, at));
    }

    /// Checks that a `from` value may be stored in a `to` slot, converting an
    /// `int` headed for a `float64` slot. `depth` counts the slots above it.
    fn coerce(
        &mut self,
        from: &Type,
        konst: Option<&Konst>,
        to: &Type,
        depth: usize,
        context: &str,
        span: Span,
    ) -> Result<(), CompileError> {
        if !to.accepts(from) {
            return Err(CompileError::mismatch(
                format!("value of type {}", from),
                to,
                context,
                span,
            ));
        }
        if !to.needs_float(from) {
            return Ok(());
        }
        if let Some(k) = konst {
            if let Op::Push(Value::Int(n)) = self.program.code[k.at].op {
                self.program.code[k.at].op = Op::Push(Value::Float(n as f64));
                return Ok(());
            }
        }
        let ty = self.program.type_slot(&Type::Float);
        self.emit(Op::Convert { ty, depth }, span);
        Ok(())
    }

    /// Re-resolves a named struct seen through its own declaration, where
    /// only a fieldless placeholder was available.
    fn complete(&self, ty: Type) -> Type {
        match ty {
            Type::Struct { ref name, ref fields } if fields.is_empty() && !name.is_empty() => {
                match self.symbols.get(name, self.scope()) {
                    Some((_, s)) if s.kind == Kind::Type => s.ty.clone(),
                    _ => ty,
                }
            }
            Type::Ptr(inner) => Type::ptr_to(self.complete(*inner)),
            other => other,
        }
    }

    fn resolve_type(&self, expr: &TypeExpr, span: Span) -> Result<Type, CompileError> {
        Ok(match expr {
            TypeExpr::Name(name) => match self.symbols.get(name, self.scope()) {
                Some((_, s)) if s.kind == Kind::Type => s.ty.clone(),
                Some(_) => return Err(CompileError::invalid(format!("{} is not a type", name), span)),
                None => return Err(CompileError::undefined(name, span)),
            },
            TypeExpr::Slice(elem) => Type::slice_of(self.resolve_type(elem, span)?),
            TypeExpr::Map(k, v) => {
                let key = self.resolve_type(k, span)?;
                if !matches!(key, Type::Bool | Type::Int | Type::String) {
                    return Err(CompileError::invalid(format!("invalid map key type {}", key), span));
                }
                Type::map_of(key, self.resolve_type(v, span)?)
            }
            TypeExpr::Ptr(elem) => Type::ptr_to(self.resolve_type(elem, span)?),
            TypeExpr::Func(sig) => Type::Func(self.resolve_sig(sig, span)?),
            TypeExpr::Struct(fields) => {
                let mut resolved = Vec::with_capacity(fields.len());
                for (name, ty) in fields {
                    if resolved.iter().any(|(n, _): &(String, Type)| n == name) {
                        return Err(CompileError::invalid(format!("duplicate field {}", name), span));
                    }
                    resolved.push((name.clone(), self.resolve_type(ty, span)?));
                }
                Type::Struct {
                    name: String::new(),
                    fields: resolved,
                }
            }
        })
    }

    fn resolve_sig(&self, sig: &FuncSig, span: Span) -> Result<FuncType, CompileError> {
        let n = sig.params.len();
        let mut params = Vec::with_capacity(n);
        for (k, p) in sig.params.iter().enumerate() {
            let ty = self.resolve_type(&p.ty, span)?;
            params.push(if sig.variadic && k + 1 == n {
                Type::slice_of(ty)
            } else {
                ty
            });
        }
        let mut results = Vec::with_capacity(sig.results.len());
        for r in &sig.results {
            results.push(self.resolve_type(&r.ty, span)?);
        }
        Ok(FuncType {
            params,
            results,
            variadic: sig.variadic,
        })
    }

    // =========================================================================
    // Names and storage
    // =========================================================================

    fn resolve(&self, name: &str, span: Span) -> Result<(String, Symbol), CompileError> {
        if name == "_" {
            return Err(CompileError::invalid("cannot use _ as value", span));
        }
        self.symbols
            .get(name, self.scope())
            .map(|(key, symbol)| (key, symbol.clone()))
            .ok_or_else(|| CompileError::undefined(name, span))
    }

    /// Load/store operand of a variable, refusing locals of enclosing
    /// functions.
    fn var_slot(&self, key: &str, symbol: &Symbol, name: &str, span: Span) -> Result<Slot, CompileError> {
        match symbol.addr {
            Address::Global(i) => Ok(Slot::Global(i)),
            Address::Local(offset) => match self.funcs.last() {
                Some(f) if key.starts_with(&format!("{}/", f.key)) => Ok(Slot::Local(offset)),
                _ => Err(CompileError::capture(name, span)),
            },
            _ => Err(CompileError::internal(format!("variable {} has no storage", name), span)),
        }
    }

    /// Data slot of a function or host value, allocated on first use.
    fn materialize(&mut self, key: &str, span: Span) -> Result<usize, CompileError> {
        let symbol = self
            .symbols
            .lookup_mut(key)
            .ok_or_else(|| CompileError::undefined(short_name(key), span))?;
        match symbol.addr {
            Address::Global(slot) => Ok(slot),
            Address::Unresolved => {
                let value = symbol.value.clone().unwrap_or(Value::Nil);
                let slot = self.program.alloc(value);
                symbol.addr = Address::Global(slot);
                Ok(slot)
            }
            _ => Err(CompileError::internal(format!("{} cannot be loaded", key), span)),
        }
    }

    /// Storage for a new variable: a frame slot inside a function, a data
    /// slot holding the zero value at top level.
    fn alloc_var(&mut self, ty: &Type) -> Address {
        match self.funcs.last_mut() {
            Some(f) => {
                let k = f.nlocals;
                f.nlocals += 1;
                Address::Local(k as isize)
            }
            None => Address::Global(self.program.alloc(ty.zero())),
        }
    }

    /// Slot for `name` declared in the current scope, reusing the one of a
    /// variable already declared there.
    fn declare_var(&mut self, name: &str, ty: &Type, span: Span) -> Result<Slot, CompileError> {
        let key = qualify(self.scope(), name);
        if let Some(existing) = self.symbols.lookup(&key) {
            if existing.kind != Kind::Var {
                return Err(CompileError::invalid(format!("{} redeclared in this block", name), span));
            }
            let Some(slot) = existing.addr.slot() else {
                return Err(CompileError::internal(format!("variable {} has no storage", name), span));
            };
            // Code compiled earlier was checked against the existing type.
            if !existing.ty.identical(ty) {
                return Err(CompileError::with_hint(
                    format!("{} redeclared in this block", name),
                    span,
                    format!("{} already has type {}", name, existing.ty),
                ));
            }
            let refine = existing.ty.is_dynamic();
            if self.funcs.is_empty() {
                warn!(name, "redefining variable, reusing its slot");
            }
            if let Some(symbol) = self.symbols.lookup_mut(&key).filter(|_| refine) {
                symbol.ty = ty.clone();
            }
            return Ok(slot);
        }

        let addr = self.alloc_var(ty);
        self.symbols.add(key, Symbol::new(Kind::Var, addr, ty.clone()));
        addr.slot()
            .ok_or_else(|| CompileError::internal(format!("variable {} has no storage", name), span))
    }

    fn ident(&mut self, toks: &[Token], i: usize) -> Result<usize, CompileError> {
        let span = toks[i].span;
        let Tok::Ident(name) = &toks[i].tok else {
            return Err(CompileError::internal("expected identifier", span));
        };
        let next = toks.get(i + 1).map(|t| &t.tok);
        match next {
            Some(Tok::Define) => {
                self.define(name, span)?;
                return Ok(i + 2);
            }
            Some(Tok::Assign) => {
                self.assign(name, span)?;
                return Ok(i + 2);
            }
            _ => {}
        }

        let (key, symbol) = self.resolve(name, span)?;
        match symbol.kind {
            Kind::Var => {
                let slot = self.var_slot(&key, &symbol, name, span)?;
                self.emit(Op::Get(slot), span);
                self.stack.push(Operand::value(symbol.ty));
            }
            Kind::Const => {
                let value = symbol.value.unwrap_or(Value::Nil);
                self.constant(value, symbol.ty, span);
            }
            Kind::Type => self.stack.push(Operand::Type(symbol.ty)),
            Kind::Pkg => match symbol.value {
                Some(Value::Str(path)) => self.stack.push(Operand::Package(path)),
                _ => return Err(CompileError::internal(format!("package {} has no path", name), span)),
            },
            Kind::Builtin(b) => self.stack.push(Operand::Builtin(b)),
            Kind::Func if matches!(next, Some(Tok::Call { .. })) => {
                let Type::Func(sig) = symbol.ty else {
                    return Err(CompileError::internal(format!("function {} has no signature", name), span));
                };
                self.stack.push(Operand::Func { key, sig });
            }
            Kind::Func | Kind::Value => {
                let slot = self.materialize(&key, span)?;
                self.emit(Op::Get(Slot::Global(slot)), span);
                self.stack.push(Operand::value(symbol.ty));
            }
            Kind::Label => return Err(CompileError::undefined(name, span)),
        }
        Ok(i + 1)
    }

    /// `name := value`
    fn define(&mut self, name: &str, span: Span) -> Result<(), CompileError> {
        let (ty, _) = self.pop_value(span)?;
        if name == "_" {
            self.emit(Op::Pop(1), span);
            return Ok(());
        }
        if ty == Type::Nil {
            return Err(CompileError::invalid("use of untyped nil in assignment", span));
        }
        let slot = self.declare_var(name, &ty, span)?;
        self.emit(Op::Set(slot), span);
        Ok(())
    }

    /// `name = value`
    fn assign(&mut self, name: &str, span: Span) -> Result<(), CompileError> {
        let (ty, konst) = self.pop_value(span)?;
        if name == "_" {
            self.emit(Op::Pop(1), span);
            return Ok(());
        }
        let (key, symbol) = self.resolve(name, span)?;
        match symbol.kind {
            Kind::Var => {}
            Kind::Const => {
                return Err(CompileError::invalid(
                    format!("cannot assign to {} (neither addressable nor a map index expression)", name),
                    span,
                ));
            }
            _ => return Err(CompileError::invalid(format!("cannot assign to {}", name), span)),
        }
        self.coerce(&ty, konst.as_ref(), &symbol.ty, 0, "assignment", span)?;
        let slot = self.var_slot(&key, &symbol, name, span)?;
        self.emit(Op::Set(slot), span);
        Ok(())
    }

    /// `var name T` or `var name [T] = value`
    fn declare(&mut self, name: &str, ty: Option<&TypeExpr>, init: bool, span: Span) -> Result<(), CompileError> {
        let declared = match ty {
            Some(expr) => Some(self.resolve_type(expr, span)?),
            None => None,
        };
        let ty = if init {
            let (vty, konst) = self.pop_value(span)?;
            match declared {
                Some(t) => {
                    self.coerce(&vty, konst.as_ref(), &t, 0, "variable declaration", span)?;
                    t
                }
                None if vty == Type::Nil => {
                    return Err(CompileError::invalid("use of untyped nil in variable declaration", span));
                }
                None => vty,
            }
        } else {
            declared.ok_or_else(|| CompileError::internal("declaration without type or value", span))?
        };

        if name == "_" {
            if init {
                self.emit(Op::Pop(1), span);
            }
            return Ok(());
        }
        let slot = self.declare_var(name, &ty, span)?;
        if !init {
            // every execution starts from the zero value, loop bodies included
            let t = self.program.type_slot(&ty);
            self.emit(Op::New(t), span);
        }
        self.emit(Op::Set(slot), span);
        Ok(())
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn binary(&mut self, op: Operator, span: Span) -> Result<(), CompileError> {
        let bop = BinOp::from_operator(op)
            .ok_or_else(|| CompileError::internal(format!("{} is not a binary operator", op.as_str()), span))?;
        let (rty, rk) = self.pop_value(span)?;
        let (lty, lk) = self.pop_value(span)?;
        let ty = Type::binary_result(bop, &lty, &rty).map_err(|m| CompileError::invalid(m, span))?;

        if let (Some(a), Some(b)) = (&lk, &rk) {
            if self.is_trailing(b) && a.at + 1 == b.at {
                let v = value::binary(bop, &a.value, &b.value).map_err(|e| const_error(e, span))?;
                self.program.code.truncate(a.at);
                self.constant(v, ty, span);
                return Ok(());
            }
        }

        if let Some(Konst { value: Value::Int(k), at }) = rk {
            if lty == Type::Int && rty == Type::Int && self.last_label_at != Some(at) && at + 1 == self.code_len() {
                let short = match bop {
                    BinOp::Add => Some(Op::Addi(k)),
                    BinOp::Sub => Some(Op::Subi(k)),
                    BinOp::Lss => Some(Op::Loweri(k)),
                    _ => None,
                };
                if let Some(short) = short {
                    self.program.code[at].op = short;
                    self.stack.push(Operand::value(ty));
                    return Ok(());
                }
            }
        }

        self.emit(Op::Binary(bop), span);
        self.stack.push(Operand::value(ty));
        Ok(())
    }

    fn unary(&mut self, op: Operator, span: Span) -> Result<(), CompileError> {
        match op {
            Operator::And => return self.address_of(span),
            Operator::Mul => return self.indirect(span),
            _ => {}
        }

        let (ty, konst) = self.pop_value(span)?;
        let uop = match op {
            Operator::Add if ty.is_numeric() || ty.is_dynamic() => None,
            Operator::Sub if ty.is_numeric() || ty.is_dynamic() => Some(UnOp::Neg),
            Operator::Not if ty == Type::Bool || ty.is_dynamic() => Some(UnOp::Not),
            Operator::Xor if ty == Type::Int || ty.is_dynamic() => Some(UnOp::BitNot),
            _ => {
                return Err(CompileError::invalid(
                    format!(
                        "invalid operation: operator {} not defined on value of type {}",
                        op.as_str(),
                        ty
                    ),
                    span,
                ));
            }
        };
        let Some(uop) = uop else {
            self.stack.push(Operand::Value { ty, konst });
            return Ok(());
        };

        if let Some(k) = konst.filter(|k| self.is_trailing(k)) {
            let v = value::unary(uop, &k.value).map_err(|e| const_error(e, span))?;
            self.program.code.truncate(k.at);
            self.constant(v, ty, span);
            return Ok(());
        }
        self.emit(Op::Unary(uop), span);
        self.stack.push(Operand::value(ty));
        Ok(())
    }

    /// `&x` or `&T{...}`
    fn address_of(&mut self, span: Span) -> Result<(), CompileError> {
        let (ty, konst) = self.pop_value(span)?;
        let last = self.program.code.last().map(|instr| instr.op.clone());
        match last {
            Some(Op::Get(Slot::Local(_))) if konst.is_none() => {
                // Frame slots are reused once the function returns.
                return Err(CompileError::with_hint(
                    "cannot take the address of a function-local variable",
                    span,
                    "allocate it on the heap with new(T) or &T{...}",
                ));
            }
            Some(Op::Get(slot)) if konst.is_none() && self.last_label_at != Some(self.code_len()) => {
                if let Some(instr) = self.program.code.last_mut() {
                    instr.op = Op::Addr(slot);
                }
            }
            Some(Op::Composite { .. }) => {
                self.emit(Op::Box, span);
            }
            _ => {
                return Err(CompileError::with_hint(
                    format!("cannot take address of value of type {}", ty),
                    span,
                    "only variables and composite literals are addressable here",
                ));
            }
        }
        self.stack.push(Operand::value(Type::ptr_to(ty)));
        Ok(())
    }

    /// `*p`, or `*T` in type position.
    fn indirect(&mut self, span: Span) -> Result<(), CompileError> {
        match self.pop_operand(span)? {
            Operand::Type(t) => self.stack.push(Operand::Type(Type::ptr_to(t))),
            Operand::Value { ty, .. } => {
                let elem = match self.complete(ty) {
                    Type::Ptr(elem) => *elem,
                    t if t.is_dynamic() => Type::Unknown,
                    t => {
                        return Err(CompileError::invalid(
                            format!("invalid operation: cannot indirect value of type {}", t),
                            span,
                        ));
                    }
                };
                self.emit(Op::Deref, span);
                let elem = self.complete(elem);
                self.stack.push(Operand::value(elem));
            }
            other => {
                return Err(CompileError::invalid(
                    format!("invalid operation: cannot indirect {}", other.describe()),
                    span,
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call(&mut self, argc: usize, spread: bool, span: Span) -> Result<(), CompileError> {
        match self.pop_operand(span)? {
            Operand::Func { key, sig } => self.call_direct(&key, &sig, argc, spread, span),
            Operand::Value {
                ty: Type::Func(sig), ..
            } => self.call_value(&sig, argc, spread, span),
            Operand::Type(ty) => self.conversion(ty, argc, spread, span),
            Operand::Builtin(b) => self.builtin(b, argc, spread, span),
            other => Err(CompileError::invalid(
                format!("invalid operation: cannot call non-function {}", other.describe()),
                span,
            )),
        }
    }

    fn pop_args(&mut self, argc: usize, span: Span) -> Result<Vec<(Type, Option<Konst>)>, CompileError> {
        self.pop_operands(argc, span)?
            .into_iter()
            .map(|operand| expect_value(operand, span))
            .collect()
    }

    fn arity_error(have: usize, sig: &FuncType, span: Span) -> CompileError {
        let word = if have < sig.params.len() { "not enough" } else { "too many" };
        CompileError::invalid(
            format!("{} arguments in call: have {}, want {}", word, have, sig.params.len()),
            span,
        )
    }

    /// Checks and coerces the arguments of a call to `sig`. `above` counts
    /// the slots sitting over the last argument (a callee value).
    fn call_args(
        &mut self,
        sig: &FuncType,
        args: &[(Type, Option<Konst>)],
        spread: bool,
        above: usize,
        span: Span,
    ) -> Result<(), CompileError> {
        let argc = args.len();
        let n = sig.params.len();
        if spread && !sig.variadic {
            return Err(CompileError::invalid("cannot use ... in call to non-variadic function", span));
        }
        let fixed = if sig.variadic && !spread { n - 1 } else { n };
        if argc < fixed || (!(sig.variadic && !spread) && argc != n) {
            return Err(Self::arity_error(argc, sig, span));
        }
        for (k, (ty, konst)) in args.iter().enumerate() {
            let want = if k < fixed {
                sig.params[k].clone()
            } else {
                sig.params[n - 1].elem().unwrap_or(Type::Unknown)
            };
            let depth = argc - 1 - k + above;
            self.coerce(ty, konst.as_ref(), &want, depth, "argument", span)?;
        }
        Ok(())
    }

    fn push_results(&mut self, sig: &FuncType) {
        for ty in &sig.results {
            let ty = self.complete(ty.clone());
            self.stack.push(Operand::value(ty));
        }
    }

    /// Call of a function known by name: a relative `Call`, patched later
    /// when the body comes after the call site.
    fn call_direct(&mut self, key: &str, sig: &FuncType, argc: usize, spread: bool, span: Span) -> Result<(), CompileError> {
        let args = self.pop_args(argc, span)?;
        self.call_args(sig, &args, spread, 0, span)?;
        if sig.variadic && !spread {
            let fixed = sig.params.len() - 1;
            let ty = self.program.type_slot(&sig.params[fixed]);
            self.emit(
                Op::Composite {
                    ty,
                    len: argc - fixed,
                    layout: Layout::Positional,
                },
                span,
            );
        }

        let site = self.emit(Op::Call(0), span);
        let compiled = match self.symbols.lookup(key).and_then(|s| s.value.as_ref()) {
            Some(Value::Func(offset)) => Some(*offset),
            _ => None,
        };
        match compiled {
            Some(offset) => self.patch(site, offset),
            None => self.pending.push(PendingJump {
                site,
                target: Target::Func(key.to_string()),
                span,
            }),
        }
        self.push_results(sig);
        Ok(())
    }

    /// Call through a function value on top of the stack.
    fn call_value(&mut self, sig: &FuncType, argc: usize, spread: bool, span: Span) -> Result<(), CompileError> {
        let args = self.pop_args(argc, span)?;
        self.call_args(sig, &args, spread, 1, span)?;
        let variadic = if sig.variadic {
            Some(sig.params.len() - 1)
        } else {
            None
        };
        self.emit(
            Op::CallX {
                argc,
                results: sig.results.len(),
                variadic,
                spread,
            },
            span,
        );
        self.push_results(sig);
        Ok(())
    }

    /// `T(x)`
    fn conversion(&mut self, ty: Type, argc: usize, spread: bool, span: Span) -> Result<(), CompileError> {
        if argc != 1 || spread {
            return Err(CompileError::invalid(
                format!("conversion to {} takes exactly one argument", ty),
                span,
            ));
        }
        let (_, konst) = self.pop_value(span)?;
        let scalar = matches!(ty, Type::Bool | Type::Int | Type::Float | Type::String);
        if let Some(k) = konst.filter(|k| scalar && self.is_trailing(k)) {
            let v = value::convert(&k.value, &ty).map_err(|e| CompileError::invalid(e.to_string(), span))?;
            self.program.code.truncate(k.at);
            self.constant(v, ty, span);
            return Ok(());
        }
        let slot = self.program.type_slot(&ty);
        self.emit(Op::Convert { ty: slot, depth: 0 }, span);
        self.stack.push(Operand::value(ty));
        Ok(())
    }

    fn builtin(&mut self, b: Builtin, argc: usize, spread: bool, span: Span) -> Result<(), CompileError> {
        let want = |range: std::ops::RangeInclusive<usize>| -> Result<(), CompileError> {
            if range.contains(&argc) {
                Ok(())
            } else {
                let word = if argc < *range.start() { "not enough" } else { "too many" };
                Err(CompileError::invalid(
                    format!("{} arguments for {} (have {})", word, b.name(), argc),
                    span,
                ))
            }
        };
        if spread && b != Builtin::Append {
            return Err(CompileError::invalid(
                format!("invalid use of ... with builtin {}", b.name()),
                span,
            ));
        }

        match b {
            Builtin::Len | Builtin::Cap => {
                want(1..=1)?;
                let (ty, konst) = self.pop_value(span)?;
                let ok = match (b, &ty) {
                    (_, Type::Slice(_)) => true,
                    (Builtin::Len, Type::String | Type::Map(..)) => true,
                    (_, t) => t.is_dynamic(),
                };
                if !ok {
                    return Err(CompileError::invalid(
                        format!("invalid argument: value of type {} for built-in {}", ty, b.name()),
                        span,
                    ));
                }
                if let Some(Konst {
                    value: Value::Str(s),
                    at,
                }) = konst.as_ref().filter(|k| self.is_trailing(k))
                {
                    let n = s.len() as i64;
                    self.program.code.truncate(*at);
                    self.constant(Value::Int(n), Type::Int, span);
                    return Ok(());
                }
                self.emit(if b == Builtin::Len { Op::Len } else { Op::Cap }, span);
                self.stack.push(Operand::value(Type::Int));
            }
            Builtin::Append => {
                want(1..=usize::MAX)?;
                let args = self.pop_args(argc, span)?;
                let base = self.complete(args[0].0.clone());
                let elem = match &base {
                    Type::Slice(elem) => (**elem).clone(),
                    t if t.is_dynamic() => Type::Unknown,
                    t => {
                        return Err(CompileError::invalid(
                            format!("invalid argument: first argument to append must be a slice; have value of type {}", t),
                            span,
                        ));
                    }
                };
                if spread {
                    if argc != 2 {
                        return Err(CompileError::invalid("can only use ... with final argument in append", span));
                    }
                    let extra = &args[1].0;
                    if !base.accepts(extra) && !(*extra == Type::String && elem == Type::Int) {
                        return Err(CompileError::mismatch(
                            format!("value of type {}", extra),
                            &base,
                            "append",
                            span,
                        ));
                    }
                } else {
                    for (k, (ty, konst)) in args.iter().enumerate().skip(1) {
                        self.coerce(ty, konst.as_ref(), &elem, argc - 1 - k, "append", span)?;
                    }
                }
                self.emit(
                    Op::Append {
                        count: argc - 1,
                        spread,
                    },
                    span,
                );
                self.stack.push(Operand::value(base));
            }
            Builtin::Make => {
                want(1..=3)?;
                let mut args = self.pop_operands(argc, span)?.into_iter();
                let ty = match args.next() {
                    Some(Operand::Type(t)) if matches!(t, Type::Slice(_) | Type::Map(..)) => t,
                    Some(other) => {
                        return Err(CompileError::invalid(
                            format!("invalid argument: cannot make {}", other.describe()),
                            span,
                        ));
                    }
                    None => return Err(CompileError::internal("make without arguments", span)),
                };
                if matches!(ty, Type::Slice(_)) && argc < 2 {
                    return Err(CompileError::invalid(format!("invalid operation: make({}) expects 2 or 3 arguments; found 1", ty), span));
                }
                for size in args {
                    let (sty, _) = expect_value(size, span)?;
                    if sty != Type::Int && !sty.is_dynamic() {
                        return Err(CompileError::invalid(
                            format!("cannot use value of type {} as size in make", sty),
                            span,
                        ));
                    }
                }
                let slot = self.program.type_slot(&ty);
                self.emit(Op::Make { ty: slot, argc: argc - 1 }, span);
                self.stack.push(Operand::value(ty));
            }
            Builtin::New => {
                want(1..=1)?;
                let ty = match self.pop_operand(span)? {
                    Operand::Type(t) => t,
                    other => {
                        return Err(CompileError::invalid(format!("{} is not a type", other.describe()), span));
                    }
                };
                let slot = self.program.type_slot(&ty);
                self.emit(Op::New(slot), span);
                self.emit(Op::Box, span);
                self.stack.push(Operand::value(Type::ptr_to(ty)));
            }
            Builtin::Delete => {
                want(2..=2)?;
                let args = self.pop_args(2, span)?;
                match self.complete(args[0].0.clone()) {
                    Type::Map(k, _) => {
                        self.coerce(&args[1].0, args[1].1.as_ref(), &k, 0, "argument to delete", span)?;
                    }
                    t if t.is_dynamic() => {}
                    t => {
                        return Err(CompileError::invalid(
                            format!("invalid argument: value of type {} is not a map", t),
                            span,
                        ));
                    }
                }
                self.emit(Op::Delete, span);
            }
            Builtin::Panic => {
                want(1..=1)?;
                self.pop_value(span)?;
                self.emit(Op::Panic, span);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Containers and selectors
    // =========================================================================

    fn index(&mut self, span: Span) -> Result<(), CompileError> {
        let (ity, ik) = self.pop_value(span)?;
        let (cty, _) = self.pop_value(span)?;
        let int_index = |ty: &Type| -> Result<(), CompileError> {
            if *ty == Type::Int || ty.is_dynamic() {
                Ok(())
            } else {
                Err(CompileError::invalid(
                    format!("invalid argument: index of type {} must be integer", ty),
                    span,
                ))
            }
        };
        match self.complete(cty) {
            Type::Slice(elem) => {
                int_index(&ity)?;
                self.emit(Op::Index, span);
                let elem = self.complete(*elem);
                self.stack.push(Operand::value(elem));
            }
            Type::String => {
                int_index(&ity)?;
                self.emit(Op::Index, span);
                self.stack.push(Operand::value(Type::Int));
            }
            Type::Map(k, v) => {
                self.coerce(&ity, ik.as_ref(), &k, 0, "map index", span)?;
                let slot = self.program.type_slot(&v);
                self.emit(Op::MapIndex(slot), span);
                let v = self.complete(*v);
                self.stack.push(Operand::value(v));
            }
            t if t.is_dynamic() => {
                self.emit(Op::Index, span);
                self.stack.push(Operand::value(Type::Unknown));
            }
            t => {
                return Err(CompileError::invalid(
                    format!("invalid operation: cannot index value of type {}", t),
                    span,
                ));
            }
        }
        Ok(())
    }

    fn slice(&mut self, low: bool, high: bool, span: Span) -> Result<(), CompileError> {
        for _ in 0..(low as usize + high as usize) {
            let (ty, _) = self.pop_value(span)?;
            if ty != Type::Int && !ty.is_dynamic() {
                return Err(CompileError::invalid(
                    format!("invalid argument: index of type {} must be integer", ty),
                    span,
                ));
            }
        }
        let (ty, _) = self.pop_value(span)?;
        if !matches!(ty, Type::Slice(_) | Type::String) && !ty.is_dynamic() {
            return Err(CompileError::invalid(format!("cannot slice value of type {}", ty), span));
        }
        self.emit(Op::Slice { low, high }, span);
        self.stack.push(Operand::value(ty));
        Ok(())
    }

    fn field(&mut self, name: &str, span: Span) -> Result<(), CompileError> {
        match self.pop_operand(span)? {
            Operand::Package(path) => {
                let key = format!("{}.{}", path, name);
                if self.symbols.lookup(&key).is_none() {
                    let binding = self
                        .registry
                        .lookup(&path, name)
                        .ok_or_else(|| CompileError::undefined(&key, span))?;
                    self.symbols.add(
                        key.clone(),
                        Symbol::new(Kind::Value, Address::Unresolved, binding.ty.clone())
                            .with_value(binding.value.clone()),
                    );
                }
                let ty = self.symbols.lookup(&key).map(|s| s.ty.clone()).unwrap_or_default();
                let slot = self.materialize(&key, span)?;
                self.emit(Op::Get(Slot::Global(slot)), span);
                self.stack.push(Operand::value(ty));
            }
            Operand::Value { ty, .. } => {
                let ty = self.complete(ty);
                let (index, fty) = ty.field(name).ok_or_else(|| {
                    CompileError::invalid(
                        format!("value of type {} has no field or method {}", ty, name),
                        span,
                    )
                })?;
                self.emit(Op::Field(index), span);
                let fty = self.complete(fty);
                self.stack.push(Operand::value(fty));
            }
            other => {
                return Err(CompileError::invalid(
                    format!("{}.{} undefined ({} has no fields)", other.describe(), name, other.describe()),
                    span,
                ));
            }
        }
        Ok(())
    }

    fn composite(&mut self, ty: &TypeExpr, len: usize, keys: &CompositeKeys, span: Span) -> Result<(), CompileError> {
        let ty = self.resolve_type(ty, span)?;
        let ty = self.complete(ty);

        let layout = match (&ty, keys) {
            (Type::Slice(elem), CompositeKeys::Positional) => {
                let elems = self.pop_args(len, span)?;
                let elem = (**elem).clone();
                check_elems(&elems, |_| elem.clone(), span)?;
                Layout::Positional
            }
            (Type::Slice(_), _) => {
                return Err(CompileError::with_hint(
                    "keyed slice literals are not supported",
                    span,
                    "list the elements in order",
                ));
            }
            (Type::Map(..), CompositeKeys::Positional) if len == 0 => Layout::Pairs,
            (Type::Map(k, v), CompositeKeys::Pairs) => {
                let elems = self.pop_args(2 * len, span)?;
                let (k, v) = ((**k).clone(), (**v).clone());
                check_elems(&elems, |i| if i % 2 == 0 { k.clone() } else { v.clone() }, span)?;
                Layout::Pairs
            }
            (Type::Struct { fields, .. }, CompositeKeys::Positional) => {
                if len != 0 && len != fields.len() {
                    return Err(CompileError::invalid(
                        format!("too {} values in struct literal of type {}", if len < fields.len() { "few" } else { "many" }, ty),
                        span,
                    ));
                }
                let elems = self.pop_args(len, span)?;
                let types: Vec<Type> = fields.iter().map(|(_, t)| t.clone()).collect();
                check_elems(&elems, |i| types[i].clone(), span)?;
                Layout::Positional
            }
            (Type::Struct { fields, .. }, CompositeKeys::Fields(names)) => {
                let mut indices = Vec::with_capacity(names.len());
                let mut types = Vec::with_capacity(names.len());
                for name in names {
                    let Some(i) = fields.iter().position(|(n, _)| n == name) else {
                        return Err(CompileError::invalid(
                            format!("unknown field {} in struct literal of type {}", name, ty),
                            span,
                        ));
                    };
                    if indices.contains(&i) {
                        return Err(CompileError::invalid(
                            format!("duplicate field name {} in struct literal", name),
                            span,
                        ));
                    }
                    indices.push(i);
                    types.push(fields[i].1.clone());
                }
                let elems = self.pop_args(len, span)?;
                check_elems(&elems, |i| types[i].clone(), span)?;
                Layout::Fields(indices)
            }
            (Type::Struct { .. }, CompositeKeys::Pairs) => {
                return Err(CompileError::invalid("invalid field name in struct literal", span));
            }
            _ => {
                return Err(CompileError::invalid(
                    format!("invalid composite literal type {}", ty),
                    span,
                ));
            }
        };
        let slot = self.program.type_slot(&ty);
        self.emit(Op::Composite { ty: slot, len, layout }, span);
        self.stack.push(Operand::value(ty));
        Ok(())
    }

    // =========================================================================
    // Assignment targets
    // =========================================================================

    /// Base of a field assignment: the address of a struct variable, or the
    /// pointer a variable holds.
    fn place(&mut self, name: &str, span: Span) -> Result<(), CompileError> {
        let (key, symbol) = self.resolve(name, span)?;
        if symbol.kind != Kind::Var {
            return Err(CompileError::invalid(format!("cannot assign to fields of {}", name), span));
        }
        let slot = self.var_slot(&key, &symbol, name, span)?;
        match self.complete(symbol.ty) {
            Type::Ptr(inner) if matches!(*inner, Type::Struct { .. }) => {
                self.emit(Op::Get(slot), span);
                self.stack.push(Operand::Place(*inner));
            }
            ty @ Type::Struct { .. } => {
                self.emit(Op::Addr(slot), span);
                self.stack.push(Operand::Place(ty));
            }
            ty => {
                return Err(CompileError::invalid(
                    format!("{}.x undefined (type {} has no fields)", name, ty),
                    span,
                ));
            }
        }
        Ok(())
    }

    fn field_assign(&mut self, path: &[String], span: Span) -> Result<(), CompileError> {
        let (vty, konst) = self.pop_value(span)?;
        let Some(Operand::Place(mut ty)) = self.stack.pop() else {
            return Err(CompileError::internal("field assignment without base", span));
        };
        let mut indices = Vec::with_capacity(path.len());
        for name in path {
            let (i, fty) = ty.field(name).ok_or_else(|| {
                CompileError::invalid(format!("value of type {} has no field or method {}", ty, name), span)
            })?;
            indices.push(i);
            ty = self.complete(fty);
        }
        self.coerce(&vty, konst.as_ref(), &ty, 0, "assignment", span)?;
        self.emit(Op::FieldSet(indices), span);
        Ok(())
    }

    fn index_assign(&mut self, span: Span) -> Result<(), CompileError> {
        let (vty, vk) = self.pop_value(span)?;
        let (ity, ik) = self.pop_value(span)?;
        let (cty, _) = self.pop_value(span)?;
        let mut op = Op::IndexSet;
        match self.complete(cty) {
            Type::Slice(elem) => {
                if ity != Type::Int && !ity.is_dynamic() {
                    return Err(CompileError::invalid(
                        format!("invalid argument: index of type {} must be integer", ity),
                        span,
                    ));
                }
                self.coerce(&vty, vk.as_ref(), &elem, 0, "assignment", span)?;
            }
            Type::Map(k, v) => {
                if !k.accepts(&ity) {
                    return Err(CompileError::mismatch(format!("value of type {}", ity), &k, "map index", span));
                }
                if k.needs_float(&ity) {
                    self.coerce(&ity, ik.as_ref(), &k, 1, "map index", span)?;
                }
                self.coerce(&vty, vk.as_ref(), &v, 0, "assignment", span)?;
                op = Op::MapSet;
            }
            Type::String => {
                return Err(CompileError::invalid(
                    "cannot assign to string index (strings are immutable)",
                    span,
                ));
            }
            t if t.is_dynamic() => {}
            t => {
                return Err(CompileError::invalid(
                    format!("invalid operation: cannot index value of type {}", t),
                    span,
                ));
            }
        }
        self.emit(op, span);
        Ok(())
    }

    fn deref_assign(&mut self, span: Span) -> Result<(), CompileError> {
        let (vty, vk) = self.pop_value(span)?;
        let (pty, _) = self.pop_value(span)?;
        match self.complete(pty) {
            Type::Ptr(elem) => self.coerce(&vty, vk.as_ref(), &elem, 0, "assignment", span)?,
            t if t.is_dynamic() => {}
            t => {
                return Err(CompileError::invalid(
                    format!("invalid operation: cannot indirect value of type {}", t),
                    span,
                ));
            }
        }
        self.emit(Op::DerefSet, span);
        Ok(())
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn import(&mut self, name: &str, path: &str, span: Span) -> Result<(), CompileError> {
        if !self.registry.has_package(path) {
            return Err(CompileError::with_hint(
                format!("package {} is not in std", path),
                span,
                "only host-registered packages can be imported",
            ));
        }
        debug!(package = path, "import");
        self.symbols.add(
            qualify(MAIN_SCOPE, name),
            Symbol::new(Kind::Pkg, Address::Unresolved, Type::Unknown).with_value(Value::Str(path.to_string())),
        );
        Ok(())
    }

    fn type_decl(&mut self, name: &str, ty: &TypeExpr, span: Span) -> Result<(), CompileError> {
        let key = qualify(self.scope(), name);
        // fieldless placeholder so that the type may point to itself
        self.symbols.add(
            key.clone(),
            Symbol::new(
                Kind::Type,
                Address::Unresolved,
                Type::Struct {
                    name: name.to_string(),
                    fields: Vec::new(),
                },
            ),
        );
        let mut resolved = self.resolve_type(ty, span)?;
        if let Type::Struct { name: n, .. } = &mut resolved {
            if n.is_empty() {
                *n = name.to_string();
            }
        }
        self.symbols.add(key, Symbol::new(Kind::Type, Address::Unresolved, resolved));
        Ok(())
    }

    fn const_decl(
        &mut self,
        name: &str,
        ty: Option<&TypeExpr>,
        expr: &[Token],
        iota: i64,
        span: Span,
    ) -> Result<(), CompileError> {
        let (mut value, mut vty) = self.eval_const(expr, iota, span)?;
        if let Some(expr) = ty {
            let t = self.resolve_type(expr, span)?;
            if !t.accepts(&vty) {
                return Err(CompileError::mismatch(format!("constant of type {}", vty), &t, "constant declaration", span));
            }
            value = value::convert(&value, &t).map_err(|e| CompileError::invalid(e.to_string(), span))?;
            vty = t;
        }
        if name == "_" {
            return Ok(());
        }
        let key = qualify(self.scope(), name);
        if let Some(existing) = self.symbols.lookup(&key) {
            if matches!(existing.kind, Kind::Var | Kind::Func | Kind::Type) {
                return Err(CompileError::invalid(format!("{} redeclared in this block", name), span));
            }
        }
        self.symbols.add(key, Symbol::new(Kind::Const, Address::Unresolved, vty).with_value(value));
        Ok(())
    }

    /// Evaluates a shaped constant expression at compile time.
    fn eval_const(&self, expr: &[Token], iota: i64, span: Span) -> Result<(Value, Type), CompileError> {
        let mut stack: Vec<ConstItem> = Vec::new();
        let not_constant = |what: &str| CompileError::invalid(format!("{} is not constant", what), span);

        for t in expr {
            match &t.tok {
                Tok::Int(n) => stack.push(ConstItem::Value(Value::Int(*n), Type::Int)),
                Tok::Float(x) => stack.push(ConstItem::Value(Value::Float(*x), Type::Float)),
                Tok::Str(s) => stack.push(ConstItem::Value(Value::Str(s.clone()), Type::String)),
                Tok::Ident(name) if name == "iota" => stack.push(ConstItem::Value(Value::Int(iota), Type::Int)),
                Tok::Ident(name) => match self.symbols.get(name, self.scope()) {
                    Some((_, s)) if s.kind == Kind::Const => stack.push(ConstItem::Value(
                        s.value.clone().unwrap_or(Value::Nil),
                        s.ty.clone(),
                    )),
                    Some((_, s)) if s.kind == Kind::Type => stack.push(ConstItem::Type(s.ty.clone())),
                    Some(_) => return Err(not_constant(name)),
                    None => return Err(CompileError::undefined(name, t.span)),
                },
                Tok::TypeRef(te) => stack.push(ConstItem::Type(self.resolve_type(te, t.span)?)),
                Tok::Binary(op) => {
                    let (Some(ConstItem::Value(b, bt)), Some(ConstItem::Value(a, at))) = (stack.pop(), stack.pop()) else {
                        return Err(not_constant("expression"));
                    };
                    let bop = BinOp::from_operator(*op).ok_or_else(|| not_constant(op.as_str()))?;
                    let ty = Type::binary_result(bop, &at, &bt).map_err(|m| CompileError::invalid(m, t.span))?;
                    let v = value::binary(bop, &a, &b).map_err(|e| const_error(e, t.span))?;
                    stack.push(ConstItem::Value(v, ty));
                }
                Tok::Unary(op) => {
                    let Some(ConstItem::Value(v, ty)) = stack.pop() else {
                        return Err(not_constant("expression"));
                    };
                    let v = match op {
                        Operator::Add => Ok(v),
                        Operator::Sub => value::unary(UnOp::Neg, &v),
                        Operator::Not => value::unary(UnOp::Not, &v),
                        Operator::Xor => value::unary(UnOp::BitNot, &v),
                        other => return Err(not_constant(other.as_str())),
                    }
                    .map_err(|e| const_error(e, t.span))?;
                    stack.push(ConstItem::Value(v, ty));
                }
                Tok::Call { argc: 1, spread: false } => {
                    let (Some(ConstItem::Type(ty)), Some(ConstItem::Value(v, _))) = (stack.pop(), stack.pop()) else {
                        return Err(not_constant("call"));
                    };
                    let v = value::convert(&v, &ty).map_err(|e| CompileError::invalid(e.to_string(), t.span))?;
                    stack.push(ConstItem::Value(v, ty));
                }
                other => return Err(not_constant(&other.to_string())),
            }
        }

        match stack.pop() {
            Some(ConstItem::Value(v, ty)) if stack.is_empty() => Ok((v, ty)),
            _ => Err(CompileError::invalid("invalid constant expression", span)),
        }
    }

    fn func_decl(&mut self, key: &str, sig: &FuncSig, span: Span) -> Result<(), CompileError> {
        let fty = self.resolve_sig(sig, span)?;
        if let Some(existing) = self.symbols.lookup(key) {
            if existing.kind != Kind::Func || existing.value.is_some() {
                return Err(CompileError::with_hint(
                    format!("{} redeclared in this block", short_name(key)),
                    span,
                    "functions cannot be redefined once compiled",
                ));
            }
        }
        self.symbols
            .add(key, Symbol::new(Kind::Func, Address::Unresolved, Type::Func(fty)));
        Ok(())
    }

    /// Start of a function body.
    ///
    /// Bodies are compiled in place, so a jump over the body is emitted
    /// first unless the body opens the entry point of top-level code; the
    /// entry point then moves past it once the body is done.
    fn func_begin(&mut self, key: &str, sig: &FuncSig, span: Span) -> Result<(), CompileError> {
        let fty = self.resolve_sig(sig, span)?;
        let existing = self.symbols.lookup(key).cloned();
        if existing.as_ref().and_then(|s| s.value.as_ref()).is_some() {
            return Err(CompileError::invalid(
                format!("{} redeclared in this block", short_name(key)),
                span,
            ));
        }

        let inline = self.funcs.is_empty() && self.code_len() == self.program.entry;
        let skip_site = if inline { None } else { Some(self.emit(Op::Jump(0), span)) };
        let offset = self.code_len();

        let slot = match existing.map(|s| s.addr) {
            Some(Address::Global(slot)) => {
                self.program.data[slot] = Value::Func(offset);
                slot
            }
            _ => self.program.alloc(Value::Func(offset)),
        };
        self.symbols.add(
            key,
            Symbol::new(Kind::Func, Address::Global(slot), Type::Func(fty.clone())).with_value(Value::Func(offset)),
        );

        // parameters sit below the return address and saved frame pointer
        let n = fty.params.len();
        for (k, param) in sig.params.iter().enumerate() {
            let Some(name) = param.name.as_deref().filter(|n| *n != "_") else {
                continue;
            };
            let offset = -((n - k) as isize) - 2;
            self.symbols.add(
                qualify(key, name),
                Symbol::new(Kind::Var, Address::Local(offset), fty.params[k].clone()),
            );
        }

        let grow_site = self.emit(Op::Grow(0), span);
        debug!(function = key, offset, params = n, "compiling function");
        self.funcs.push(FuncCtx {
            key: key.to_string(),
            sig: fty.clone(),
            nlocals: 0,
            grow_site,
            skip_site,
            stack_base: self.stack.len(),
            marks_base: self.marks.len(),
        });
        self.scopes.push(key.to_string());

        // named results start at their zero values
        for (k, result) in sig.results.iter().enumerate() {
            let Some(name) = result.name.as_deref() else { continue };
            let ty = fty.results[k].clone();
            let addr = self.alloc_var(&ty);
            if name != "_" {
                self.symbols.add(qualify(key, name), Symbol::new(Kind::Var, addr, ty.clone()));
            }
            if let Some(slot) = addr.slot() {
                let t = self.program.type_slot(&ty);
                self.emit(Op::New(t), span);
                self.emit(Op::Set(slot), span);
            }
        }
        Ok(())
    }

    fn func_end(&mut self, span: Span) -> Result<(), CompileError> {
        let f = self
            .funcs
            .pop()
            .ok_or_else(|| CompileError::internal("function end outside function", span))?;
        if f.sig.results.is_empty() {
            self.emit(
                Op::Return {
                    results: 0,
                    params: f.sig.params.len(),
                },
                span,
            );
        } else {
            self.emit(Op::MissingReturn, span);
        }
        self.program.code[f.grow_site].op = Op::Grow(f.nlocals);

        let end = self.code_len();
        match f.skip_site {
            Some(site) => self.patch(site, end),
            None => self.program.entry = end,
        }
        self.stack.truncate(f.stack_base);
        self.marks.truncate(f.marks_base);
        self.scopes.pop();
        self.last_label_at = Some(end);
        self.stack.forget_constants();
        debug!(function = %f.key, locals = f.nlocals, "function compiled");
        Ok(())
    }

    fn ret(&mut self, n: usize, span: Span) -> Result<(), CompileError> {
        let (results, params) = match self.funcs.last() {
            Some(f) => (f.sig.results.clone(), f.sig.params.len()),
            None => return Err(CompileError::invalid("return outside function", span)),
        };
        if n != results.len() {
            let word = if n < results.len() { "not enough" } else { "too many" };
            return Err(CompileError::invalid(
                format!("{} return values: have {}, want {}", word, n, results.len()),
                span,
            ));
        }
        let values = self.pop_args(n, span)?;
        for (k, (ty, konst)) in values.iter().enumerate() {
            self.coerce(ty, konst.as_ref(), &results[k], n - 1 - k, "return statement", span)?;
        }
        self.emit(Op::Return { results: n, params }, span);
        Ok(())
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    fn label(&mut self, label: &str, span: Span) -> Result<(), CompileError> {
        let ends_func = self
            .funcs
            .last()
            .map(|f| label.strip_suffix("_end") == Some(f.key.as_str()))
            .unwrap_or(false);
        if ends_func {
            return self.func_end(span);
        }

        if !self.labels.insert(label.to_string()) {
            return Err(CompileError::invalid(
                format!("label {} already defined", short_name(label)),
                span,
            ));
        }
        let at = self.code_len();
        self.symbols.add_label(label, at);
        self.last_label_at = Some(at);
        self.stack.forget_constants();
        Ok(())
    }

    fn range(&mut self, span: Span) -> Result<(), CompileError> {
        let (ty, _) = self.pop_value(span)?;
        let (key, value) = match self.complete(ty) {
            Type::Slice(elem) => (Type::Int, *elem),
            Type::Map(k, v) => (*k, *v),
            Type::String => (Type::Int, Type::Int),
            Type::Int => (Type::Int, Type::Nil),
            t if t.is_dynamic() => (Type::Unknown, Type::Unknown),
            t => {
                return Err(CompileError::invalid(format!("cannot range over value of type {}", t), span));
            }
        };
        self.emit(Op::Range, span);
        self.stack.push(Operand::Iter { key, value });
        Ok(())
    }

    /// Slot receiving one iteration variable.
    fn range_var(&mut self, name: &str, ty: Type, define: bool, span: Span) -> Result<Slot, CompileError> {
        if define {
            return self.declare_var(name, &ty, span);
        }
        let (key, symbol) = self.resolve(name, span)?;
        if symbol.kind != Kind::Var {
            return Err(CompileError::invalid(format!("cannot assign to {}", name), span));
        }
        if !symbol.ty.accepts(&ty) || symbol.ty.needs_float(&ty) {
            return Err(CompileError::mismatch(format!("value of type {}", ty), &symbol.ty, "range", span));
        }
        self.var_slot(&key, &symbol, name, span)
    }

    fn next(
        &mut self,
        label: &str,
        key: Option<&str>,
        value: Option<&str>,
        define: bool,
        span: Span,
    ) -> Result<(), CompileError> {
        let Some(Operand::Iter { key: kty, value: vty }) = self.stack.peek().cloned() else {
            return Err(CompileError::internal("next without range iterator", span));
        };
        // counting loops have no value variable
        if value.is_some() && vty == Type::Nil {
            return Err(CompileError::invalid(
                "range over int permits only one iteration variable",
                span,
            ));
        }
        let key = match key {
            Some(name) => Some(self.range_var(name, kty, define, span)?),
            None => None,
        };
        let value = match value {
            Some(name) => Some(self.range_var(name, vty, define, span)?),
            None => None,
        };
        let site = self.emit(
            Op::Next {
                key,
                value,
                offset: 0,
            },
            span,
        );
        match self.local_label(label) {
            Some(target) => self.patch(site, target),
            None => self.pending.push(PendingJump {
                site,
                target: Target::Label(label.to_string()),
                span,
            }),
        }
        Ok(())
    }
}

fn is_hoisted(tok: &Tok) -> bool {
    matches!(
        tok,
        Tok::Import { .. } | Tok::TypeDecl { .. } | Tok::ConstDecl { .. } | Tok::FuncDecl { .. }
    )
}

fn expect_value(operand: Operand, span: Span) -> Result<(Type, Option<Konst>), CompileError> {
    match operand {
        Operand::Value { ty, konst } => Ok((ty, konst)),
        other => Err(CompileError::invalid(
            format!("{} is not an expression", other.describe()),
            span,
        )),
    }
}

/// Composite literal elements are converted by the VM, so only
/// compatibility is checked here.
fn check_elems(
    elems: &[(Type, Option<Konst>)],
    want: impl Fn(usize) -> Type,
    span: Span,
) -> Result<(), CompileError> {
    for (k, (ty, _)) in elems.iter().enumerate() {
        let expected = want(k);
        if !expected.accepts(ty) {
            return Err(CompileError::mismatch(
                format!("value of type {}", ty),
                expected,
                "composite literal",
                span,
            ));
        }
    }
    Ok(())
}

fn const_error(err: ValueError, span: Span) -> CompileError {
    match err {
        ValueError::DivisionByZero => CompileError::invalid("invalid operation: division by zero", span),
        other => CompileError::invalid(format!("constant {}", other), span),
    }
}

/// Last path component of a scoped key.
fn short_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::frontend::shape_source;

    fn compile(source: &str) -> Result<Program, CompileError> {
        let mut labels = 0;
        let tokens = shape_source(source, &mut labels).expect("shaping should succeed");
        let registry = Registry::with_stdlib_writer(Rc::new(RefCell::new(Vec::<u8>::new())));
        let mut symbols = SymbolTable::with_universe(&registry);
        let mut program = Program::new();
        Compiler::new(&mut symbols, &mut program, &registry).compile(&tokens)?;
        Ok(program)
    }

    fn ops(source: &str) -> Vec<Op> {
        compile(source)
            .expect("compilation should succeed")
            .code
            .into_iter()
            .map(|instr| instr.op)
            .collect()
    }

    fn assert_error(source: &str, expected: &str) {
        match compile(source) {
            Ok(_) => panic!("expected error containing '{}'", expected),
            Err(e) => assert!(
                e.to_string().contains(expected),
                "expected error containing '{}', got '{}'",
                expected,
                e
            ),
        }
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(ops("1 + 2 * 3"), vec![Op::Push(Value::Int(7))]);
        assert_eq!(ops("(1 + 2) * 3"), vec![Op::Push(Value::Int(9))]);
        assert_eq!(ops("!true"), vec![Op::Push(Value::Bool(false))]);
    }

    #[test]
    fn test_constant_division_by_zero() {
        assert_error("1 / 0", "division by zero");
    }

    #[test]
    fn test_immediate_operands() {
        assert_eq!(
            ops("x := 1\nx + 2"),
            vec![
                Op::Push(Value::Int(1)),
                Op::Set(Slot::Global(0)),
                Op::Get(Slot::Global(0)),
                Op::Addi(2),
            ]
        );
        assert!(ops("x := 1\nx < 10").contains(&Op::Loweri(10)));
    }

    #[test]
    fn test_int_constant_widened_in_place() {
        assert_eq!(
            ops("var f float64 = 1"),
            vec![Op::Push(Value::Float(1.0)), Op::Set(Slot::Global(0))]
        );
        let code = ops("func half(x float64) float64 { return x / 2 }\nhalf(3)");
        assert!(code.contains(&Op::Push(Value::Float(3.0))));
    }

    #[test]
    fn test_undefined_name() {
        let err = compile("y + 1").unwrap_err();
        assert_eq!(
            err,
            CompileError::Undefined {
                name: "y".into(),
                span: Span { line: 1, col: 1 }
            }
        );
    }

    #[test]
    fn test_type_mismatch() {
        assert_error(
            "var s string = 1",
            "cannot use value of type int as string value in variable declaration",
        );
        assert_error("x := 1\nx = \"a\"", "cannot use value of type string as int value in assignment");
    }

    #[test]
    fn test_forward_goto_is_patched() {
        let program = compile("func f() {\n\tgoto done\ndone:\n}").unwrap();
        let code: Vec<Op> = program.code.iter().map(|i| i.op.clone()).collect();
        assert_eq!(
            code,
            vec![
                Op::Grow(0),
                Op::Jump(1),
                Op::Return {
                    results: 0,
                    params: 0
                },
            ]
        );
        assert_eq!(program.entry, 3);
    }

    #[test]
    fn test_undefined_label() {
        let err = compile("func f() {\n\tgoto nowhere\n}").unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedLabel { ref label, .. } if label == "nowhere"));
    }

    #[test]
    fn test_discarded_results_are_popped() {
        let code = ops("func two() (int, int) { return 1, 2 }\ntwo()\n3");
        assert!(code.contains(&Op::Pop(2)));
        assert!(code.contains(&Op::Return {
            results: 2,
            params: 0
        }));
    }

    #[test]
    fn test_missing_return() {
        let code = ops("func f(a int) int {\n\tif a > 0 {\n\t\treturn 1\n\t}\n}");
        assert_eq!(code.last(), Some(&Op::MissingReturn));
    }

    #[test]
    fn test_function_redeclared() {
        assert_error("func f() {}\nfunc f() {}", "f redeclared");
    }

    #[test]
    fn test_capture_is_rejected() {
        assert_error(
            "func f() {\n\tx := 1\n\tg := func() int { return x }\n\t_ = g\n}",
            "cannot capture local variable x",
        );
    }

    #[test]
    fn test_address_of_local_is_rejected() {
        assert_error(
            "func f() *int {\n\tx := 7\n\treturn &x\n}",
            "cannot take the address of a function-local variable",
        );
        assert!(ops("x := 1\np := &x").iter().any(|op| matches!(op, Op::Addr(Slot::Global(_)))));
    }

    #[test]
    fn test_redefinition_keeps_type() {
        assert_error("a := 1\na := \"x\"", "a redeclared");
        assert_error("a := 1.5\na := 2", "a redeclared");
        assert_error("func f() {\n\tb := true\n\tb := 1\n}", "b redeclared");
    }

    #[test]
    fn test_variadic_arguments_are_packed() {
        let code = ops("func count(xs ...int) int { return len(xs) }\ncount(1, 2, 3)");
        let packed = code.iter().position(|op| {
            matches!(
                op,
                Op::Composite {
                    len: 3,
                    layout: Layout::Positional,
                    ..
                }
            )
        });
        let call = code.iter().rposition(|op| matches!(op, Op::Call(_)));
        assert!(packed.is_some() && call == packed.map(|p| p + 1));
    }

    #[test]
    fn test_self_referential_struct() {
        let source = "type Node struct {\n\tval int\n\tnext *Node\n}\n\
                      n := &Node{val: 1}\n\
                      n.next = &Node{val: 2}\n\
                      n.next.val";
        let code = ops(source);
        assert!(code.contains(&Op::Box));
        assert!(code.contains(&Op::FieldSet(vec![1])));
        assert_eq!(code.last(), Some(&Op::Field(0)));
    }

    #[test]
    fn test_host_package_call() {
        let code = ops("import \"strings\"\nstrings.ToUpper(\"go\")");
        assert!(matches!(
            code.last(),
            Some(Op::CallX {
                argc: 1,
                results: 1,
                variadic: None,
                spread: false
            })
        ));
        assert_error("import \"os\"", "package os is not in std");
    }

    #[test]
    fn test_range_over_int_takes_one_variable() {
        assert_error(
            "for i, v := range 10 {\n\t_ = i\n\t_ = v\n}",
            "range over int permits only one iteration variable",
        );
    }

    #[test]
    fn test_constants_and_iota() {
        let code = ops("const (\n\tA = iota * 10\n\tB\n\tC\n)\nC + 1");
        assert_eq!(code, vec![Op::Push(Value::Int(21))]);
    }
}
