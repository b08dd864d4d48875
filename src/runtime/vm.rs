use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::bytecode::{Layout, Op, Program};
use crate::lang::symbol::Slot;
use crate::lang::types::Type;
use crate::lang::value::{self, MapKey, RangeIter, SliceRef, Value};
use crate::runtime::runtime_error::{
    RuntimeError, index_out_of_range, nil_dereference, stack_underflow, type_error,
};

/// Call sites listed in a runtime error; deeper frames are counted.
const MAX_BACKTRACE: usize = 10;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    /// Cells above the globals.
    pub max_stack_size: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

/// Stack machine executing a [`Program`].
///
/// A single memory vector holds the globals at the bottom (mirroring the
/// program's data segment) with the operand stack and call frames above.
/// A frame is `[params] [return ip] [saved fp] [locals] [temporaries]`
/// with `fp` pointing at the first local, so parameters sit at negative
/// offsets.
pub struct Vm {
    mem: Vec<Value>,
    ip: usize,
    fp: usize,
    /// Length of memory when the current run started.
    base: usize,
    depth: usize,
    steps: usize,
    config: VmConfig,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Vm {
            mem: Vec::new(),
            ip: 0,
            fp: 0,
            base: 0,
            depth: 0,
            steps: 0,
            config,
        }
    }

    pub fn memory(&self) -> &[Value] {
        &self.mem
    }

    /// Overwrites a global; `false` when the index is out of range.
    pub fn store(&mut self, index: usize, value: Value) -> bool {
        match self.mem.get_mut(index) {
            Some(cell) => {
                *cell = value;
                true
            }
            None => false,
        }
    }

    /// Brings memory in line with the data segment: cells from `from` on are
    /// replaced by the program's, earlier globals keep their current values.
    pub fn load_data(&mut self, data: &[Value], from: usize) {
        self.mem.truncate(from);
        if let Some(fresh) = data.get(self.mem.len()..) {
            self.mem.extend(fresh.iter().cloned());
        }
    }

    /// Executes from `start` until `Exit`. Returns the value left on top of
    /// the stack, if any; the stack itself is cleared either way.
    pub fn run(&mut self, program: &Program, start: usize) -> Result<Option<Value>, RuntimeError> {
        self.base = self.mem.len();
        self.ip = start;
        self.fp = self.base;
        self.depth = 0;
        self.steps = 0;
        debug!(start, globals = self.base, "vm run");

        let outcome = self.execute(program);
        let result = match outcome {
            Ok(()) if self.mem.len() > self.base => Ok(self.mem.last().cloned()),
            Ok(()) => Ok(None),
            Err(e) => Err(self.locate(e, program)),
        };
        self.mem.truncate(self.base);
        result
    }

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeError::new(format!(
                    "execution step limit exceeded ({})",
                    max
                )));
            }
        }

        if self.mem.len() - self.base > self.config.max_stack_size {
            return Err(RuntimeError::new(format!(
                "stack size limit exceeded ({})",
                self.config.max_stack_size
            )));
        }

        Ok(())
    }

    /// Attaches the failing instruction's position and the call sites of
    /// the active frames.
    fn locate(&self, err: RuntimeError, program: &Program) -> RuntimeError {
        let mut err = match program.code.get(self.ip) {
            Some(instr) => err.at(instr.span),
            None => err,
        };
        let mut fp = self.fp;
        let mut frames = 0;
        for _ in 0..self.depth {
            let (Some(Value::Int(ret)), Some(Value::Int(saved))) =
                (self.mem.get(fp.wrapping_sub(2)), self.mem.get(fp.wrapping_sub(1)))
            else {
                break;
            };
            if frames < MAX_BACKTRACE {
                let site = (*ret as usize).saturating_sub(1);
                if let Some(instr) = program.code.get(site) {
                    err = err.with_context(format!("called at {}", instr.span));
                }
            }
            frames += 1;
            fp = *saved as usize;
        }
        if frames > MAX_BACKTRACE {
            err = err.with_context(format!("... {} more", frames - MAX_BACKTRACE));
        }
        err
    }

    // =========================================================================
    // Stack helpers
    // =========================================================================

    fn push(&mut self, v: Value) {
        self.mem.push(v);
    }

    fn pop(&mut self, op: &str) -> Result<Value, RuntimeError> {
        if self.mem.len() <= self.base {
            return Err(stack_underflow(op));
        }
        self.mem.pop().ok_or_else(|| stack_underflow(op))
    }

    fn pop_n(&mut self, n: usize, op: &str) -> Result<Vec<Value>, RuntimeError> {
        if self.mem.len() < self.base + n {
            return Err(stack_underflow(op));
        }
        let at = self.mem.len() - n;
        Ok(self.mem.split_off(at))
    }

    fn pop_int(&mut self, op: &str) -> Result<i64, RuntimeError> {
        match self.pop(op)? {
            Value::Int(n) => Ok(n),
            other => Err(type_error("int", other.type_name())),
        }
    }

    fn pop_bool(&mut self, op: &str) -> Result<bool, RuntimeError> {
        match self.pop(op)? {
            Value::Bool(b) => Ok(b),
            other => Err(type_error("bool", other.type_name())),
        }
    }

    fn peek_bool(&self, op: &str) -> Result<bool, RuntimeError> {
        match self.mem.last() {
            Some(Value::Bool(b)) if self.mem.len() > self.base => Ok(*b),
            Some(other) if self.mem.len() > self.base => Err(type_error("bool", other.type_name())),
            _ => Err(stack_underflow(op)),
        }
    }

    fn addr(&self, slot: Slot) -> Result<usize, RuntimeError> {
        let addr = match slot {
            Slot::Global(i) => Some(i),
            Slot::Local(k) => self.fp.checked_add_signed(k),
        };
        match addr {
            Some(a) if a < self.mem.len() => Ok(a),
            _ => Err(RuntimeError::new(format!("invalid memory slot {}", slot))),
        }
    }

    fn target(&self, rel: isize) -> Result<usize, RuntimeError> {
        self.ip
            .checked_add_signed(rel)
            .ok_or_else(|| RuntimeError::new(format!("jump out of range from {}", self.ip)))
    }

    fn type_at<'p>(program: &'p Program, ty: usize) -> Result<&'p Type, RuntimeError> {
        program
            .type_at(ty)
            .ok_or_else(|| RuntimeError::new(format!("data slot {} is not a type", ty)))
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn execute(&mut self, program: &Program) -> Result<(), RuntimeError> {
        loop {
            self.check_limits()?;
            let Some(instr) = program.code.get(self.ip) else {
                return Err(RuntimeError::new(format!(
                    "instruction pointer {} out of range",
                    self.ip
                )));
            };
            trace!(ip = self.ip, depth = self.depth, op = %instr.op, "step");

            let mut next = self.ip + 1;
            match &instr.op {
                Op::Exit => return Ok(()),

                Op::Push(v) => self.push(v.clone()),
                Op::Pop(n) => {
                    self.pop_n(*n, "POP")?;
                }
                Op::Grow(n) => {
                    let len = self.mem.len() + n;
                    self.mem.resize(len, Value::Nil);
                }

                Op::Get(slot) => {
                    let a = self.addr(*slot)?;
                    let v = self.mem[a].clone();
                    self.push(v);
                }
                Op::Set(slot) => {
                    let v = self.pop("SET")?;
                    let a = self.addr(*slot)?;
                    self.mem[a] = v;
                }
                Op::Addr(slot) => {
                    let a = self.addr(*slot)?;
                    self.push(Value::Ref(a));
                }
                Op::Deref => {
                    let p = self.pop("DEREF")?;
                    let v = self.load(&p)?;
                    self.push(v);
                }
                Op::DerefSet => {
                    let v = self.pop("DEREF_SET")?;
                    let p = self.pop("DEREF_SET")?;
                    match p {
                        Value::Ref(a) => match self.mem.get_mut(a) {
                            Some(cell) => *cell = v,
                            None => return Err(nil_dereference()),
                        },
                        Value::Heap(cell) => *cell.borrow_mut() = v,
                        Value::Nil => return Err(nil_dereference()),
                        other => return Err(type_error("pointer", other.type_name())),
                    }
                }
                Op::New(ty) => {
                    let zero = Self::type_at(program, *ty)?.zero();
                    self.push(zero);
                }
                Op::Box => {
                    let v = self.pop("BOX")?;
                    self.push(Value::Heap(Rc::new(RefCell::new(v))));
                }

                Op::Binary(op) => {
                    let b = self.pop("BINARY")?;
                    let a = self.pop("BINARY")?;
                    let v = value::binary(*op, &a, &b)?;
                    self.push(v);
                }
                Op::Unary(op) => {
                    let a = self.pop("UNARY")?;
                    let v = value::unary(*op, &a)?;
                    self.push(v);
                }
                Op::Addi(k) => {
                    let v = match self.pop("ADDI")? {
                        Value::Int(n) => Value::Int(n.wrapping_add(*k)),
                        other => value::binary(value::BinOp::Add, &other, &Value::Int(*k))?,
                    };
                    self.push(v);
                }
                Op::Subi(k) => {
                    let v = match self.pop("SUBI")? {
                        Value::Int(n) => Value::Int(n.wrapping_sub(*k)),
                        other => value::binary(value::BinOp::Sub, &other, &Value::Int(*k))?,
                    };
                    self.push(v);
                }
                Op::Loweri(k) => {
                    let v = match self.pop("LOWERI")? {
                        Value::Int(n) => Value::Bool(n < *k),
                        other => value::binary(value::BinOp::Lss, &other, &Value::Int(*k))?,
                    };
                    self.push(v);
                }
                Op::Convert { ty, depth } => {
                    let to = Self::type_at(program, *ty)?;
                    let at = self
                        .mem
                        .len()
                        .checked_sub(depth + 1)
                        .filter(|&at| at >= self.base)
                        .ok_or_else(|| stack_underflow("CONVERT"))?;
                    self.mem[at] = value::convert(&self.mem[at], to)?;
                }

                Op::Jump(rel) => next = self.target(*rel)?,
                Op::JumpTrue(rel) => {
                    if self.pop_bool("JUMP_TRUE")? {
                        next = self.target(*rel)?;
                    }
                }
                Op::JumpFalse(rel) => {
                    if !self.pop_bool("JUMP_FALSE")? {
                        next = self.target(*rel)?;
                    }
                }
                Op::JumpSetTrue(rel) => {
                    if self.peek_bool("JSET_TRUE")? {
                        next = self.target(*rel)?;
                    } else {
                        self.pop("JSET_TRUE")?;
                    }
                }
                Op::JumpSetFalse(rel) => {
                    if !self.peek_bool("JSET_FALSE")? {
                        next = self.target(*rel)?;
                    } else {
                        self.pop("JSET_FALSE")?;
                    }
                }
                Op::Call(rel) => {
                    let target = self.target(*rel)?;
                    next = self.enter(target)?;
                }
                Op::CallX {
                    argc,
                    results,
                    variadic,
                    spread,
                } => {
                    let callee = self.pop("CALLX")?;
                    if let Some(target) = self.call_value(callee, *argc, *results, *variadic, *spread)? {
                        next = target;
                    }
                }
                Op::Return { results, params } => next = self.ret(*results, *params)?,
                Op::MissingReturn => return Err(RuntimeError::new("missing return")),

                Op::Index => {
                    let i = self.pop("INDEX")?;
                    let c = self.pop("INDEX")?;
                    let v = index(&c, &i)?;
                    self.push(v);
                }
                Op::MapIndex(ty) => {
                    let k = self.pop("MAP_INDEX")?;
                    let m = self.pop("MAP_INDEX")?;
                    let key = MapKey::try_from(&k)?;
                    let found = match m {
                        Value::Map(m) => m.borrow().get(&key).cloned(),
                        Value::Nil => None,
                        other => return Err(type_error("map", other.type_name())),
                    };
                    let v = match found {
                        Some(v) => v,
                        None => Self::type_at(program, *ty)?.zero(),
                    };
                    self.push(v);
                }
                Op::IndexSet | Op::MapSet => {
                    let v = self.pop("INDEX_SET")?;
                    let i = self.pop("INDEX_SET")?;
                    let c = self.pop("INDEX_SET")?;
                    match (c, &i) {
                        (Value::Slice(s), Value::Int(n)) => {
                            if *n < 0 || !s.set(*n as usize, v) {
                                return Err(index_out_of_range(*n, s.len()));
                            }
                        }
                        (Value::Map(m), _) => {
                            m.borrow_mut().insert(MapKey::try_from(&i)?, v);
                        }
                        (Value::Nil, _) if instr.op == Op::MapSet => {
                            return Err(RuntimeError::new("assignment to entry in nil map"));
                        }
                        (Value::Nil, Value::Int(n)) => return Err(index_out_of_range(*n, 0)),
                        (c, _) => return Err(type_error("slice or map", c.type_name())),
                    }
                }
                Op::Slice { low, high } => {
                    let hi = if *high { Some(self.pop_int("SLICE")?) } else { None };
                    let lo = if *low { self.pop_int("SLICE")? } else { 0 };
                    let c = self.pop("SLICE")?;
                    let v = slice(c, lo, hi)?;
                    self.push(v);
                }
                Op::Field(i) => {
                    let v = self.pop("FIELD")?;
                    let v = match v {
                        Value::Ref(_) | Value::Heap(_) | Value::Nil => self.load(&v)?,
                        v => v,
                    };
                    match v {
                        Value::Struct(mut fields) if *i < fields.len() => self.push(fields.swap_remove(*i)),
                        other => return Err(type_error("struct", other.type_name())),
                    }
                }
                Op::FieldSet(path) => {
                    let v = self.pop("FIELD_SET")?;
                    let p = self.pop("FIELD_SET")?;
                    self.store_path(p, path, v)?;
                }
                Op::Composite { ty, len, layout } => {
                    let ty = Self::type_at(program, *ty)?;
                    let v = self.composite(ty, *len, layout)?;
                    self.push(v);
                }
                Op::Len => {
                    let n = match self.pop("LEN")? {
                        Value::Slice(s) => s.len(),
                        Value::Str(s) => s.len(),
                        Value::Map(m) => m.borrow().len(),
                        Value::Nil => 0,
                        other => return Err(type_error("slice, map or string", other.type_name())),
                    };
                    self.push(Value::Int(n as i64));
                }
                Op::Cap => {
                    let n = match self.pop("CAP")? {
                        Value::Slice(s) => s.cap(),
                        Value::Nil => 0,
                        other => return Err(type_error("slice", other.type_name())),
                    };
                    self.push(Value::Int(n as i64));
                }
                Op::Append { count, spread } => {
                    let items = if *spread {
                        match self.pop("APPEND")? {
                            Value::Slice(s) => s.items(),
                            Value::Str(s) => s.bytes().map(|b| Value::Int(b as i64)).collect(),
                            Value::Nil => Vec::new(),
                            other => return Err(type_error("slice", other.type_name())),
                        }
                    } else {
                        self.pop_n(*count, "APPEND")?
                    };
                    let grown = match self.pop("APPEND")? {
                        Value::Slice(s) => s.append(items),
                        Value::Nil => SliceRef::new(items),
                        other => return Err(type_error("slice", other.type_name())),
                    };
                    self.push(Value::Slice(grown));
                }
                Op::Make { ty, argc } => {
                    let sizes = self.pop_n(*argc, "MAKE")?;
                    let v = make(Self::type_at(program, *ty)?, &sizes)?;
                    self.push(v);
                }
                Op::Delete => {
                    let k = self.pop("DELETE")?;
                    match self.pop("DELETE")? {
                        Value::Map(m) => {
                            m.borrow_mut().remove(&MapKey::try_from(&k)?);
                        }
                        Value::Nil => {}
                        other => return Err(type_error("map", other.type_name())),
                    }
                }
                Op::Panic => {
                    let v = self.pop("PANIC")?;
                    return Err(RuntimeError::new(format!("panic: {}", v)));
                }
                Op::Range => {
                    let v = self.pop("RANGE")?;
                    let it = RangeIter::over(&v)?;
                    self.push(Value::Iter(Box::new(it)));
                }
                Op::Next { key, value, offset } => {
                    let item = match self.mem.last_mut() {
                        Some(Value::Iter(it)) => it.next(),
                        _ => return Err(RuntimeError::new("range iterator missing")),
                    };
                    match item {
                        None => next = self.target(*offset)?,
                        Some((k, v)) => {
                            if let Some(slot) = key {
                                let a = self.addr(*slot)?;
                                self.mem[a] = k;
                            }
                            if let Some(slot) = value {
                                let a = self.addr(*slot)?;
                                self.mem[a] = v;
                            }
                        }
                    }
                }
            }
            self.ip = next;
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Pushes a frame header and returns the callee's entry.
    fn enter(&mut self, target: usize) -> Result<usize, RuntimeError> {
        if self.depth >= self.config.max_call_depth {
            return Err(RuntimeError::new(format!(
                "call depth limit exceeded ({}) - possible infinite recursion",
                self.config.max_call_depth
            )));
        }
        self.depth += 1;
        self.push(Value::Int((self.ip + 1) as i64));
        self.push(Value::Int(self.fp as i64));
        self.fp = self.mem.len();
        Ok(target)
    }

    /// Returns the jump target for compiled callees, `None` after a host
    /// call completed in place.
    fn call_value(
        &mut self,
        callee: Value,
        argc: usize,
        results: usize,
        variadic: Option<usize>,
        spread: bool,
    ) -> Result<Option<usize>, RuntimeError> {
        match callee {
            Value::Func(offset) => {
                if let (Some(fixed), false) = (variadic, spread) {
                    let rest = self.pop_n(argc.saturating_sub(fixed), "CALLX")?;
                    self.push(Value::slice_of(rest));
                }
                self.enter(offset).map(Some)
            }
            Value::Host(host) => {
                if host.arity_out() != results {
                    return Err(RuntimeError::new(format!(
                        "{} returns {} values, call wants {}",
                        host.name(),
                        host.arity_out(),
                        results
                    )));
                }
                let mut args = self.pop_n(argc, "CALLX")?;
                if spread {
                    match args.pop() {
                        Some(Value::Slice(s)) => args.extend(s.items()),
                        Some(Value::Nil) | None => {}
                        Some(other) => return Err(type_error("slice", other.type_name())),
                    }
                }
                let arity = host.arity_in();
                let fits = if host.is_variadic() {
                    args.len() + 1 >= arity
                } else {
                    args.len() == arity
                };
                if !fits {
                    return Err(RuntimeError::new(format!(
                        "wrong number of arguments in call to {}: have {}, want {}",
                        host.name(),
                        args.len(),
                        arity
                    )));
                }
                trace!(host = host.name(), argc = args.len(), "host call");
                let out = host
                    .invoke(args)
                    .map_err(|e| RuntimeError::new(format!("{}: {}", host.name(), e)))?;
                if out.len() != results {
                    return Err(RuntimeError::new(format!(
                        "{} returned {} values, want {}",
                        host.name(),
                        out.len(),
                        results
                    )));
                }
                self.mem.extend(out);
                Ok(None)
            }
            Value::Nil => Err(nil_dereference()),
            other => Err(type_error("func", other.type_name())),
        }
    }

    fn ret(&mut self, results: usize, params: usize) -> Result<usize, RuntimeError> {
        let values = self.pop_n(results, "RETURN")?;
        if self.fp < self.base + 2 || self.fp > self.mem.len() {
            return Err(RuntimeError::new("return outside of a function"));
        }
        self.mem.truncate(self.fp);
        let saved = self.pop_int("RETURN")?;
        let ret = self.pop_int("RETURN")?;
        self.pop_n(params, "RETURN")?;
        self.mem.extend(values);
        self.fp = saved as usize;
        self.depth = self.depth.saturating_sub(1);
        Ok(ret as usize)
    }

    // =========================================================================
    // Pointers and aggregates
    // =========================================================================

    fn load(&self, p: &Value) -> Result<Value, RuntimeError> {
        match p {
            Value::Ref(a) => self.mem.get(*a).cloned().ok_or_else(nil_dereference),
            Value::Heap(cell) => Ok(cell.borrow().clone()),
            Value::Nil => Err(nil_dereference()),
            other => Err(type_error("pointer", other.type_name())),
        }
    }

    /// Stores `v` at a field path below the pointer `p`, following any
    /// pointer fields along the way.
    fn store_path(&mut self, p: Value, path: &[usize], v: Value) -> Result<(), RuntimeError> {
        let mut ptr = p;
        let mut path = path;
        let mut v = Some(v);
        loop {
            let rest = match &ptr {
                Value::Ref(a) => {
                    let cell = self.mem.get_mut(*a).ok_or_else(nil_dereference)?;
                    write_path(cell, path, &mut v)?
                }
                Value::Heap(cell) => write_path(&mut cell.borrow_mut(), path, &mut v)?,
                Value::Nil => return Err(nil_dereference()),
                other => return Err(type_error("pointer", other.type_name())),
            };
            match rest {
                None => return Ok(()),
                Some((p, tail)) => {
                    ptr = p;
                    path = tail;
                }
            }
        }
    }

    fn composite(&mut self, ty: &Type, len: usize, layout: &Layout) -> Result<Value, RuntimeError> {
        match (ty, layout) {
            (Type::Slice(elem), Layout::Positional) => {
                let items = self.pop_n(len, "COMPOSITE")?;
                Ok(Value::slice_of(items.into_iter().map(|v| fit(v, elem)).collect()))
            }
            (Type::Struct { fields, .. }, Layout::Positional) => {
                if len == 0 {
                    return Ok(ty.zero());
                }
                let items = self.pop_n(len, "COMPOSITE")?;
                Ok(Value::Struct(
                    items
                        .into_iter()
                        .zip(fields)
                        .map(|(v, (_, fty))| fit(v, fty))
                        .collect(),
                ))
            }
            (Type::Struct { fields, .. }, Layout::Fields(order)) => {
                let items = self.pop_n(len, "COMPOSITE")?;
                let Value::Struct(mut values) = ty.zero() else {
                    return Err(type_error("struct", ty.to_string().as_str()));
                };
                for (v, &i) in items.into_iter().zip(order) {
                    if let (Some(slot), Some((_, fty))) = (values.get_mut(i), fields.get(i)) {
                        *slot = fit(v, fty);
                    }
                }
                Ok(Value::Struct(values))
            }
            (Type::Map(kty, vty), Layout::Pairs) => {
                let items = self.pop_n(2 * len, "COMPOSITE")?;
                let mut entries = BTreeMap::new();
                let mut items = items.into_iter();
                while let (Some(k), Some(v)) = (items.next(), items.next()) {
                    let key = MapKey::try_from(&fit(k, kty))?;
                    entries.insert(key, fit(v, vty));
                }
                Ok(Value::map_of(entries))
            }
            (ty, _) => Err(RuntimeError::new(format!(
                "invalid composite literal of type {}",
                ty
            ))),
        }
    }
}

/// Widens untyped integers stored into float slots.
fn fit(v: Value, ty: &Type) -> Value {
    match (ty, v) {
        (Type::Float, Value::Int(n)) => Value::Float(n as f64),
        (_, v) => v,
    }
}

/// Writes through inline structs along `path`. Stops at a pointer field
/// and hands it back together with the remaining path.
fn write_path<'p>(
    target: &mut Value,
    path: &'p [usize],
    v: &mut Option<Value>,
) -> Result<Option<(Value, &'p [usize])>, RuntimeError> {
    let Value::Struct(fields) = target else {
        return Err(type_error("struct", target.type_name()));
    };
    let Some((&i, rest)) = path.split_first() else {
        return Err(RuntimeError::new("empty field path"));
    };
    let Some(field) = fields.get_mut(i) else {
        return Err(RuntimeError::new(format!("field index {} out of range", i)));
    };
    if rest.is_empty() {
        *field = v.take().unwrap_or(Value::Nil);
        return Ok(None);
    }
    match field {
        Value::Ref(_) | Value::Heap(_) => Ok(Some((field.clone(), rest))),
        Value::Nil => Err(nil_dereference()),
        _ => write_path(field, rest, v),
    }
}

fn index(c: &Value, i: &Value) -> Result<Value, RuntimeError> {
    match (c, i) {
        (Value::Slice(s), Value::Int(n)) => usize::try_from(*n)
            .ok()
            .and_then(|k| s.get(k))
            .ok_or_else(|| index_out_of_range(*n, s.len())),
        (Value::Str(s), Value::Int(n)) => usize::try_from(*n)
            .ok()
            .and_then(|k| s.as_bytes().get(k))
            .map(|b| Value::Int(*b as i64))
            .ok_or_else(|| index_out_of_range(*n, s.len())),
        (Value::Map(m), k) => Ok(m
            .borrow()
            .get(&MapKey::try_from(k)?)
            .cloned()
            .unwrap_or(Value::Nil)),
        (Value::Nil, Value::Int(n)) => Err(index_out_of_range(*n, 0)),
        (c, _) => Err(type_error("slice, map or string", c.type_name())),
    }
}

fn slice(c: Value, lo: i64, hi: Option<i64>) -> Result<Value, RuntimeError> {
    let bounds = |len: usize, cap: usize| -> Result<(usize, usize), RuntimeError> {
        let hi = hi.unwrap_or(len as i64);
        if hi < 0 || hi as usize > cap {
            return Err(RuntimeError::new(format!(
                "slice bounds out of range [:{}] with capacity {}",
                hi, cap
            )));
        }
        if lo < 0 || lo > hi {
            return Err(RuntimeError::new(format!(
                "slice bounds out of range [{}:{}]",
                lo, hi
            )));
        }
        Ok((lo as usize, hi as usize))
    };
    match c {
        Value::Slice(s) => {
            let (lo, hi) = bounds(s.len(), s.cap())?;
            s.slice(lo, hi)
                .map(Value::Slice)
                .ok_or_else(|| RuntimeError::new("slice bounds out of range"))
        }
        Value::Str(s) => {
            let (lo, hi) = bounds(s.len(), s.len())?;
            let bytes = s.as_bytes().get(lo..hi).unwrap_or_default();
            Ok(Value::Str(String::from_utf8_lossy(bytes).into_owned()))
        }
        Value::Nil => {
            bounds(0, 0)?;
            Ok(Value::Nil)
        }
        other => Err(type_error("slice or string", other.type_name())),
    }
}

fn make(ty: &Type, sizes: &[Value]) -> Result<Value, RuntimeError> {
    let size = |i: usize| -> Result<Option<i64>, RuntimeError> {
        match sizes.get(i) {
            Some(Value::Int(n)) => Ok(Some(*n)),
            Some(Value::Float(x)) if x.fract() == 0.0 => Ok(Some(*x as i64)),
            Some(other) => Err(type_error("int", other.type_name())),
            None => Ok(None),
        }
    };
    match ty {
        Type::Slice(elem) => {
            let len = size(0)?.unwrap_or(0);
            let cap = size(1)?.unwrap_or(len);
            if len < 0 {
                return Err(RuntimeError::new("makeslice: len out of range"));
            }
            if cap < len {
                return Err(RuntimeError::new("makeslice: cap out of range"));
            }
            Ok(Value::Slice(SliceRef::with_capacity(
                &elem.zero(),
                len as usize,
                cap as usize,
            )))
        }
        Type::Map(..) => Ok(Value::map_of(Default::default())),
        other => Err(RuntimeError::new(format!("cannot make {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::token::Span;
    use crate::lang::types::FuncType;
    use crate::lang::value::BinOp;
    use crate::runtime::host::{HostError, HostFn};

    // =========================================================================
    // Test helpers
    // =========================================================================

    fn program_from_ops(program: &mut Program, ops: Vec<Op>) {
        for op in ops {
            program.emit(op, Span { line: 1, col: 1 });
        }
        program.emit(Op::Exit, Span { line: 1, col: 1 });
    }

    fn run_program(program: &Program, config: VmConfig) -> Result<Option<Value>, RuntimeError> {
        let mut vm = Vm::with_config(config);
        vm.load_data(&program.data, 0);
        vm.run(program, program.entry)
    }

    fn run_ops(ops: Vec<Op>) -> Result<Option<Value>, RuntimeError> {
        let mut program = Program::new();
        program_from_ops(&mut program, ops);
        run_program(&program, VmConfig::default())
    }

    /// Assert the value left on top of the stack
    fn assert_top(ops: Vec<Op>, expected: Value) {
        let top = run_ops(ops).expect("execution should succeed");
        assert_eq!(top, Some(expected), "top of stack mismatch");
    }

    /// Assert execution produces an error containing the given substring
    fn assert_error(ops: Vec<Op>, error_contains: &str) {
        match run_ops(ops) {
            Ok(top) => panic!(
                "expected error containing '{}', got top: {:?}",
                error_contains, top
            ),
            Err(e) => assert!(
                e.message.contains(error_contains),
                "expected error containing '{}', got: {}",
                error_contains,
                e.message
            ),
        }
    }

    fn int(n: i64) -> Value {
        Value::Int(n)
    }

    fn string(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    // =========================================================================
    // Arithmetic and control flow
    // =========================================================================

    #[test]
    fn test_arithmetic() {
        assert_top(vec![Op::Push(int(2)), Op::Push(int(3)), Op::Binary(BinOp::Mul)], int(6));
        assert_top(vec![Op::Push(int(2)), Op::Addi(5)], int(7));
        assert_top(vec![Op::Push(int(2)), Op::Loweri(5)], Value::Bool(true));
        assert_error(
            vec![Op::Push(int(1)), Op::Push(int(0)), Op::Binary(BinOp::Quo)],
            "integer divide by zero",
        );
    }

    #[test]
    fn test_empty_run_leaves_no_value() {
        assert_eq!(run_ops(vec![]), Ok(None));
        assert_eq!(run_ops(vec![Op::Push(int(1)), Op::Pop(1)]), Ok(None));
    }

    #[test]
    fn test_short_circuit_keeps_left_operand() {
        // false && (1/0 == 0)
        assert_top(
            vec![
                Op::Push(Value::Bool(false)),
                Op::JumpSetFalse(4),
                Op::Push(int(1)),
                Op::Push(int(0)),
                Op::Binary(BinOp::Quo),
            ],
            Value::Bool(false),
        );
    }

    #[test]
    fn test_call_and_return() {
        assert_top(
            vec![
                Op::Jump(5),
                Op::Grow(0),
                Op::Get(Slot::Local(-3)),
                Op::Addi(1),
                Op::Return { results: 1, params: 1 },
                Op::Push(int(41)),
                Op::Call(-5),
            ],
            int(42),
        );
    }

    #[test]
    fn test_call_depth_limit() {
        let mut program = Program::new();
        program_from_ops(&mut program, vec![Op::Jump(3), Op::Grow(0), Op::Call(-1), Op::Call(-2)]);
        let err = run_program(&program, VmConfig::default()).unwrap_err();
        assert!(err.message.contains("call depth limit exceeded"));
        assert_eq!(err.call_stack.len(), MAX_BACKTRACE + 1);
        let last = err.call_stack.last().unwrap();
        assert!(last.starts_with("... ") && last.ends_with(" more"), "got {}", last);
    }

    #[test]
    fn test_step_limit() {
        let mut program = Program::new();
        program_from_ops(&mut program, vec![Op::Jump(0)]);
        let config = VmConfig {
            max_steps: Some(100),
            ..VmConfig::default()
        };
        let err = run_program(&program, config).unwrap_err();
        assert!(err.message.contains("step limit exceeded (100)"));
    }

    #[test]
    fn test_error_carries_span_and_call_stack() {
        let mut program = Program::new();
        let at = |line| Span { line, col: 1 };
        program.emit(Op::Jump(4), at(1));
        program.emit(Op::Grow(0), at(2));
        program.emit(Op::Push(Value::Str("boom".into())), at(3));
        program.emit(Op::Panic, at(3));
        program.emit(Op::Call(-3), at(7));
        program.emit(Op::Exit, at(7));

        let err = run_program(&program, VmConfig::default()).unwrap_err();
        assert_eq!(err.message, "panic: boom");
        assert_eq!(err.span, Some(at(3)));
        assert_eq!(err.call_stack, vec!["called at 7:1".to_string()]);
    }

    #[test]
    fn test_missing_return() {
        assert_error(vec![Op::MissingReturn], "missing return");
    }

    // =========================================================================
    // Memory
    // =========================================================================

    #[test]
    fn test_globals_survive_runs() {
        let mut program = Program::new();
        let g = program.alloc(int(0));
        program_from_ops(&mut program, vec![Op::Push(int(5)), Op::Set(Slot::Global(g))]);

        let mut vm = Vm::new();
        vm.load_data(&program.data, 0);
        assert_eq!(vm.run(&program, 0), Ok(None));
        assert_eq!(vm.memory(), &[int(5)]);

        // new data past the old globals leaves them alone
        program.alloc(int(9));
        vm.load_data(&program.data, 1);
        assert_eq!(vm.memory(), &[int(5), int(9)]);
    }

    #[test]
    fn test_heap_pointer() {
        let mut program = Program::new();
        let t = program.type_slot(&Type::Int);
        let g = program.alloc(Value::Nil);
        program_from_ops(
            &mut program,
            vec![
                Op::New(t),
                Op::Box,
                Op::Set(Slot::Global(g)),
                Op::Get(Slot::Global(g)),
                Op::Push(int(5)),
                Op::DerefSet,
                Op::Get(Slot::Global(g)),
                Op::Deref,
            ],
        );
        assert_eq!(run_program(&program, VmConfig::default()), Ok(Some(int(5))));
    }

    #[test]
    fn test_nil_pointer_dereference() {
        assert_error(vec![Op::Push(Value::Nil), Op::Deref], "nil pointer dereference");
    }

    #[test]
    fn test_field_set_through_nested_struct() {
        let inner = Type::Struct {
            name: "Inner".into(),
            fields: vec![("n".into(), Type::Int)],
        };
        let outer = Type::Struct {
            name: "Outer".into(),
            fields: vec![("a".into(), Type::Int), ("in".into(), inner)],
        };
        let mut program = Program::new();
        let g = program.alloc(outer.zero());
        program_from_ops(
            &mut program,
            vec![
                Op::Addr(Slot::Global(g)),
                Op::Push(int(7)),
                Op::FieldSet(vec![1, 0]),
                Op::Get(Slot::Global(g)),
            ],
        );
        assert_eq!(
            run_program(&program, VmConfig::default()),
            Ok(Some(Value::Struct(vec![int(0), Value::Struct(vec![int(7)])])))
        );
    }

    #[test]
    fn test_field_set_follows_pointer_fields() {
        // n.next = &Node{}; n.next.val = 9; n.next.val
        let mut program = Program::new();
        let g = program.alloc(Value::Struct(vec![int(1), Value::Nil]));
        program_from_ops(
            &mut program,
            vec![
                Op::Addr(Slot::Global(g)),
                Op::Push(Value::Struct(vec![int(0), Value::Nil])),
                Op::Box,
                Op::FieldSet(vec![1]),
                Op::Addr(Slot::Global(g)),
                Op::Push(int(9)),
                Op::FieldSet(vec![1, 0]),
                Op::Get(Slot::Global(g)),
                Op::Field(1),
                Op::Field(0),
            ],
        );
        assert_eq!(run_program(&program, VmConfig::default()), Ok(Some(int(9))));

        assert_error(
            vec![
                Op::Push(Value::Struct(vec![int(0), Value::Nil])),
                Op::Box,
                Op::Push(int(1)),
                Op::FieldSet(vec![1, 0]),
            ],
            "nil pointer dereference",
        );
    }

    // =========================================================================
    // Containers
    // =========================================================================

    #[test]
    fn test_composite_widens_floats() {
        let mut program = Program::new();
        let t = program.type_slot(&Type::slice_of(Type::Float));
        program_from_ops(
            &mut program,
            vec![
                Op::Push(int(1)),
                Op::Push(Value::Float(2.5)),
                Op::Composite {
                    ty: t,
                    len: 2,
                    layout: Layout::Positional,
                },
            ],
        );
        assert_eq!(
            run_program(&program, VmConfig::default()),
            Ok(Some(Value::slice_of(vec![Value::Float(1.0), Value::Float(2.5)])))
        );
    }

    #[test]
    fn test_index_out_of_range() {
        let mut program = Program::new();
        let t = program.type_slot(&Type::slice_of(Type::Int));
        program_from_ops(
            &mut program,
            vec![
                Op::Push(int(1)),
                Op::Push(int(2)),
                Op::Composite {
                    ty: t,
                    len: 2,
                    layout: Layout::Positional,
                },
                Op::Push(int(5)),
                Op::Index,
            ],
        );
        let err = run_program(&program, VmConfig::default()).unwrap_err();
        assert_eq!(err.message, "index out of range [5] with length 2");
    }

    #[test]
    fn test_nil_map_assignment() {
        assert_error(
            vec![Op::Push(Value::Nil), Op::Push(string("k")), Op::Push(int(1)), Op::MapSet],
            "assignment to entry in nil map",
        );
    }

    #[test]
    fn test_map_index_missing_key_is_zero() {
        let mut program = Program::new();
        let t = program.type_slot(&Type::Int);
        let m = program.type_slot(&Type::map_of(Type::String, Type::Int));
        program_from_ops(
            &mut program,
            vec![
                Op::Make { ty: m, argc: 0 },
                Op::Push(string("x")),
                Op::MapIndex(t),
            ],
        );
        assert_eq!(run_program(&program, VmConfig::default()), Ok(Some(int(0))));
    }

    #[test]
    fn test_append_and_slice() {
        assert_top(
            vec![
                Op::Push(Value::Nil),
                Op::Push(int(1)),
                Op::Push(int(2)),
                Op::Push(int(3)),
                Op::Append { count: 3, spread: false },
                Op::Push(int(1)),
                Op::Slice { low: true, high: false },
                Op::Len,
            ],
            int(2),
        );
        assert_error(
            vec![Op::Push(string("go")), Op::Push(int(3)), Op::Slice { low: false, high: true }],
            "slice bounds out of range [:3] with capacity 2",
        );
    }

    #[test]
    fn test_range_over_int() {
        let mut program = Program::new();
        let sum = program.alloc(int(0));
        let i = program.alloc(int(0));
        program_from_ops(
            &mut program,
            vec![
                Op::Push(int(4)),
                Op::Range,
                Op::Next {
                    key: Some(Slot::Global(i)),
                    value: None,
                    offset: 6,
                },
                Op::Get(Slot::Global(sum)),
                Op::Get(Slot::Global(i)),
                Op::Binary(BinOp::Add),
                Op::Set(Slot::Global(sum)),
                Op::Jump(-5),
                Op::Pop(1),
                Op::Get(Slot::Global(sum)),
            ],
        );
        assert_eq!(run_program(&program, VmConfig::default()), Ok(Some(int(6))));
    }

    // =========================================================================
    // Host calls
    // =========================================================================

    fn host(name: &str, results: usize) -> Value {
        let sig = FuncType {
            params: vec![Type::Int],
            results: vec![Type::Int; results.min(1)],
            variadic: false,
        };
        Value::Host(Rc::new(HostFn::new(name, sig, move |args| match args.as_slice() {
            [Value::Int(n)] if results == 1 => Ok(vec![Value::Int(n * 2)]),
            [Value::Int(_)] => Ok(vec![]),
            _ => Err(HostError::new("want one int")),
        })))
    }

    #[test]
    fn test_host_call() {
        let call = Op::CallX {
            argc: 1,
            results: 1,
            variadic: None,
            spread: false,
        };
        assert_top(vec![Op::Push(int(21)), Op::Push(host("double", 1)), call.clone()], int(42));
        assert_error(
            vec![Op::Push(int(21)), Op::Push(host("sink", 0)), call.clone()],
            "sink returns 0 values, call wants 1",
        );

        let sig = FuncType {
            params: vec![Type::Int],
            results: vec![Type::Int],
            variadic: false,
        };
        let broken = Value::Host(Rc::new(HostFn::new("broken", sig, |_| Ok(vec![]))));
        assert_error(
            vec![Op::Push(int(21)), Op::Push(broken), call],
            "broken returned 0 values, want 1",
        );
    }

    #[test]
    fn test_host_argument_count() {
        let call = |argc| Op::CallX {
            argc,
            results: 1,
            variadic: None,
            spread: false,
        };
        assert_error(
            vec![Op::Push(int(1)), Op::Push(int(2)), Op::Push(host("double", 1)), call(2)],
            "wrong number of arguments in call to double: have 2, want 1",
        );

        let sig = FuncType {
            params: vec![Type::String, Type::Slice(Box::new(Type::Any))],
            results: vec![Type::Int],
            variadic: true,
        };
        let count = Value::Host(Rc::new(HostFn::new("count", sig, |args| {
            Ok(vec![Value::Int(args.len() as i64)])
        })));
        assert_top(
            vec![Op::Push(string("f")), Op::Push(int(1)), Op::Push(int(2)), Op::Push(count.clone()), call(3)],
            int(3),
        );
        assert_top(vec![Op::Push(string("f")), Op::Push(count.clone()), call(1)], int(1));
        assert_error(
            vec![Op::Push(count), call(0)],
            "wrong number of arguments in call to count: have 0, want 2",
        );
    }

    #[test]
    fn test_variadic_func_value_packs_arguments() {
        // func(xs ...int) int { return len(xs) }
        assert_top(
            vec![
                Op::Jump(5),
                Op::Grow(0),
                Op::Get(Slot::Local(-3)),
                Op::Len,
                Op::Return { results: 1, params: 1 },
                Op::Push(int(1)),
                Op::Push(int(2)),
                Op::Push(int(3)),
                Op::Push(Value::Func(1)),
                Op::CallX {
                    argc: 3,
                    results: 1,
                    variadic: Some(0),
                    spread: false,
                },
            ],
            int(3),
        );
    }
}
