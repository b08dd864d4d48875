//! Re-entrant evaluation.
//!
//! A [`Session`] owns everything that persists between evaluations: the
//! program whose code and data segments only grow, the symbol table, the
//! host registry and the VM holding the live globals. Each [`Session::eval`]
//! compiles one more chunk onto the program and runs just that chunk.

use tracing::debug;

use crate::bytecode::{Compiler, Instr, Op, Program};
use crate::error::Error;
use crate::frontend;
use crate::lang::symbol::{Kind, MAIN_SCOPE, SymbolTable, qualify};
use crate::lang::value::Value;
use crate::runtime::host::Registry;
use crate::runtime::{Vm, VmConfig};
use crate::snapshot::{self, Dump};

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub vm: VmConfig,
}

pub struct Session {
    program: Program,
    symbols: SymbolTable,
    registry: Registry,
    vm: Vm,
    /// Data slots already copied into VM memory.
    data_offset: usize,
    /// Label counter shared by every chunk shaped in this session.
    labels: usize,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with the standard host library printing to stdout.
    pub fn new() -> Self {
        Self::with_registry(Registry::with_stdlib())
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self::with_parts(registry, SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::with_parts(Registry::with_stdlib(), config)
    }

    pub fn with_parts(registry: Registry, config: SessionConfig) -> Self {
        Session {
            program: Program::new(),
            symbols: SymbolTable::with_universe(&registry),
            registry,
            vm: Vm::with_config(config.vm),
            data_offset: 0,
            labels: 0,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Compiles and runs one chunk of source.
    ///
    /// Returns the value the chunk leaves on top of the stack: the last
    /// expression statement, or the variable assigned by a trailing
    /// assignment. A compile error leaves the session exactly as it was
    /// before the call. A runtime error keeps the compiled code, so
    /// functions declared by the chunk stay callable.
    pub fn eval(&mut self, source: &str) -> Result<Option<Value>, Error> {
        let tokens = frontend::shape_source(source, &mut self.labels)?;
        let end = tokens.last().map(|t| t.span).unwrap_or_default();

        if matches!(self.program.code.last(), Some(Instr { op: Op::Exit, .. })) {
            self.program.code.pop();
        }
        let start = self.program.code.len();
        let data_len = self.program.data.len();
        let entry = self.program.entry;
        let symbols = self.symbols.clone();
        debug!(start, data_len, entry, tokens = tokens.len(), "eval");

        let compiled = Compiler::new(&mut self.symbols, &mut self.program, &self.registry).compile(&tokens);
        if let Err(e) = compiled {
            debug!(error = %e, "compile failed, rolling back");
            self.program.truncate(start, data_len);
            self.program.entry = entry;
            self.symbols = symbols;
            self.program.emit(Op::Exit, end);
            return Err(e.into());
        }

        self.vm.load_data(&self.program.data, self.data_offset);
        self.data_offset = self.program.data.len();
        self.program.emit(Op::Exit, end);

        let ip = start.max(self.program.entry);
        Ok(self.vm.run(&self.program, ip)?)
    }

    /// Calls a compiled function taking no arguments, such as `main`.
    pub fn call(&mut self, name: &str) -> Result<Option<Value>, Error> {
        self.eval(&format!("{}()", name))
    }

    /// Whether top-level code declared a function with this name.
    pub fn has_func(&self, name: &str) -> bool {
        matches!(
            self.symbols.lookup(&qualify(MAIN_SCOPE, name)),
            Some(symbol) if symbol.kind == Kind::Func
        )
    }

    pub fn dump(&self) -> Result<Dump, Error> {
        Ok(snapshot::dump(&self.symbols, self.globals())?)
    }

    /// Restores global values from a dump taken by a session that compiled
    /// the same declarations. Either every record applies or none does.
    pub fn apply_dump(&mut self, dump: &Dump) -> Result<(), Error> {
        let writes = snapshot::restore(&self.symbols, self.globals(), dump)?;
        debug!(records = writes.len(), "apply dump");
        for (index, value) in writes {
            self.vm.store(index, value);
        }
        Ok(())
    }

    fn globals(&self) -> &[Value] {
        let memory = self.vm.memory();
        &memory[..self.data_offset.min(memory.len())]
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use proptest::prelude::*;

    use super::*;
    use crate::lang::symbol::Address;

    // =========================================================================
    // Test helpers
    // =========================================================================

    fn session_with_output() -> (Session, Rc<RefCell<Vec<u8>>>) {
        let out = Rc::new(RefCell::new(Vec::new()));
        let session = Session::with_registry(Registry::with_stdlib_writer(Rc::clone(&out)));
        (session, out)
    }

    fn eval(source: &str) -> Result<Option<Value>, Error> {
        session_with_output().0.eval(source)
    }

    fn assert_value(source: &str, expected: Value) {
        match eval(source) {
            Ok(Some(v)) => assert_eq!(v, expected, "source: {}", source),
            other => panic!("expected {:?} from {:?}, got {:?}", expected, source, other),
        }
    }

    fn assert_error(source: &str, contains: &str) {
        match eval(source) {
            Ok(v) => panic!("expected error '{}', got {:?}", contains, v),
            Err(e) => assert!(
                e.to_string().contains(contains),
                "expected '{}' in error, got: {}",
                contains,
                e
            ),
        }
    }

    fn output(session: &mut Session, out: &Rc<RefCell<Vec<u8>>>, source: &str) -> String {
        session.eval(source).unwrap();
        String::from_utf8(out.borrow().clone()).unwrap()
    }

    fn int(n: i64) -> Value {
        Value::Int(n)
    }

    fn slot_of(session: &Session, name: &str) -> Address {
        session.symbols().lookup(name).map(|s| s.addr).unwrap()
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    #[test]
    fn test_precedence() {
        assert_value("1+2*3", int(7));
        assert_value("(1+2)*3", int(9));
        assert_value("10 - 4 - 3", int(3));
        assert_value("2.5 * 2", Value::Float(5.0));
        assert_value("\"go\" + \"lang\"", Value::Str("golang".into()));
    }

    #[test]
    fn test_short_circuit_skips_right_operand() {
        assert_value("z := 0\nfalse && 1/z == 0", Value::Bool(false));
        assert_value("z := 0\ntrue || 1/z == 0", Value::Bool(true));
        assert_error("z := 0\ntrue && 1/z == 0", "integer divide by zero");
    }

    proptest! {
        #[test]
        fn prop_left_associative_precedence(a in -50i64..50, b in -50i64..50, c in 1i64..50) {
            let source = format!("{} - {} * {} + {} / {}", a, b, c, a, c);
            let expected = a - b * c + a / c;
            prop_assert_eq!(eval(&source).unwrap(), Some(Value::Int(expected)));
        }
    }

    // =========================================================================
    // Functions
    // =========================================================================

    #[test]
    fn test_recursive_fib() {
        let source = "func fib(n int) int {\n\
                      \tif n < 2 {\n\t\treturn n\n\t}\n\
                      \treturn fib(n-1) + fib(n-2)\n\
                      }\n\
                      fib(6)";
        assert_value(source, int(8));
    }

    #[test]
    fn test_call_before_declaration() {
        assert_value("x := twice(4)\nfunc twice(n int) int { return n * 2 }\nx", int(8));
    }

    #[test]
    fn test_discarded_results_keep_stack_balanced() {
        let source = "func pair() (int, int) { return 1, 2 }\npair()\n40 + 2";
        assert_value(source, int(42));

        // leaked results would overflow the stack long before the loop ends
        let source = "func pair() (int, int) { return 1, 2 }\n\
                      n := 0\n\
                      for i := 0; i < 6000; i++ {\n\tpair()\n\tn++\n}\n\
                      n";
        assert_value(source, int(6000));
    }

    #[test]
    fn test_variadic_and_literals() {
        let source = "func sum(xs ...int) int {\n\
                      \tt := 0\n\
                      \tfor _, x := range xs {\n\t\tt += x\n\t}\n\
                      \treturn t\n\
                      }\n\
                      f := func(a int) int { return a + 1 }\n\
                      sum(1, 2, 3) + f(3)";
        assert_value(source, int(10));
    }

    #[test]
    fn test_address_of_local_is_a_compile_error() {
        let (mut session, _) = session_with_output();
        let err = session
            .eval("func f() *int {\n\tx := 7\n\treturn &x\n}\nf()")
            .unwrap_err();
        assert!(matches!(err, Error::Compile(_)), "got {:?}", err);
        assert!(!session.has_func("f"));

        let source = "func f() *int {\n\tp := new(int)\n\t*p = 7\n\treturn p\n}\n\
                      func h(p *int) int {\n\tz := 5\n\treturn *p + z - 5\n}\n\
                      h(f())";
        assert_eq!(session.eval(source).unwrap(), Some(int(7)));
    }

    #[test]
    fn test_runtime_error_reports_position_and_caller() {
        let (mut session, _) = session_with_output();
        let err = session
            .eval("func div(a int, b int) int {\n\treturn a / b\n}\ndiv(1, 0)")
            .unwrap_err();
        match err {
            Error::Runtime(e) => {
                assert_eq!(e.message, "integer divide by zero");
                assert_eq!(e.span.map(|s| s.line), Some(2));
                assert_eq!(e.call_stack.len(), 1);
            }
            other => panic!("expected runtime error, got {:?}", other),
        }
        // the function survives the failed run
        assert_eq!(session.eval("div(6, 3)").unwrap(), Some(int(2)));
    }

    // =========================================================================
    // Statements
    // =========================================================================

    #[test]
    fn test_loops_and_switch() {
        let source = "s := 0\n\
                      for i := 0; i < 5; i++ {\n\
                      \tswitch {\n\
                      \tcase i%2 == 0:\n\t\ts += i\n\
                      \tdefault:\n\t\tcontinue\n\
                      \t}\n\
                      }\n\
                      s";
        assert_value(source, int(6));
    }

    #[test]
    fn test_goto_forward_label() {
        assert_value("n := 1\ngoto done\nn = 2\ndone:\nn", int(1));
        assert_error("goto nowhere", "label");
    }

    #[test]
    fn test_maps_slices_structs() {
        let source = "type P struct {\n\tx int\n\ty float64\n}\n\
                      m := map[string]int{\"a\": 1}\n\
                      m[\"b\"] = 2\n\
                      s := []int{}\n\
                      s = append(s, m[\"a\"], m[\"b\"], m[\"zz\"])\n\
                      p := &P{x: 3}\n\
                      p.y = 1\n\
                      len(s) + p.x + int(p.y)";
        assert_value(source, int(7));
        assert_error("var m map[string]int\nm[\"a\"] = 1", "assignment to entry in nil map");
        assert_error("s := []int{1}\ns[3]", "index out of range [3] with length 1");
    }

    #[test]
    fn test_println_through_registry() {
        let (mut session, out) = session_with_output();
        let text = output(&mut session, &out, "import \"strings\"\nprintln(strings.ToUpper(\"go\"), 1+1)");
        assert_eq!(text, "GO 2\n");
    }

    // =========================================================================
    // Re-entrant evaluation
    // =========================================================================

    #[test]
    fn test_reentrant_assignment_reuses_slot() {
        let (mut session, _) = session_with_output();
        assert_eq!(session.eval("a := 2").unwrap(), Some(int(2)));
        let before = slot_of(&session, "main/a");
        assert_eq!(session.eval("a = a + 3").unwrap(), Some(int(5)));
        assert_eq!(slot_of(&session, "main/a"), before);

        session.eval("a := 10").unwrap();
        assert_eq!(slot_of(&session, "main/a"), before);
        assert_eq!(session.eval("a").unwrap(), Some(int(10)));
    }

    #[test]
    fn test_redefinition_cannot_change_type() {
        let (mut session, _) = session_with_output();
        session.eval("a := 1\nfunc f() int { return a + 1 }").unwrap();
        let err = session.eval("a := \"x\"").unwrap_err();
        assert!(err.to_string().contains("a redeclared"), "got: {}", err);
        assert_eq!(session.eval("f()").unwrap(), Some(int(2)));
    }

    #[test]
    fn test_functions_declared_later_do_not_run() {
        let (mut session, out) = session_with_output();
        session.eval("x := 1").unwrap();
        let text = output(&mut session, &out, "func hello() {\n\tprintln(\"hi\")\n}");
        assert_eq!(text, "");
        assert_eq!(output(&mut session, &out, "hello()"), "hi\n");
        assert!(session.has_func("hello"));
    }

    #[test]
    fn test_compile_error_rolls_back() {
        let (mut session, _) = session_with_output();
        session.eval("a := 1").unwrap();
        let code_len = session.program().code.len();
        let data_len = session.program().data.len();

        assert!(matches!(
            session.eval("b := 2\nc := undefined_name"),
            Err(Error::Compile(_))
        ));
        assert_eq!(session.program().code.len(), code_len);
        assert_eq!(session.program().data.len(), data_len);
        assert!(session.symbols().lookup("main/b").is_none());

        // names from the failed chunk can be declared again
        assert_eq!(session.eval("b := 5\nb + a").unwrap(), Some(int(6)));
    }

    #[test]
    fn test_incomplete_input() {
        let (mut session, _) = session_with_output();
        let err = session.eval("func f() {\n\tx := 1").unwrap_err();
        assert!(err.is_incomplete());
        assert!(!session.eval("1 +* 2").unwrap_err().is_incomplete());
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    #[test]
    fn test_snapshot_round_trip() {
        let (mut first, _) = session_with_output();
        first.eval("a := 3\nfunc inc(n int) int { return n + 1 }").unwrap();
        let bytes = first.dump().unwrap().to_bytes().unwrap();

        let (mut second, _) = session_with_output();
        second.eval("a := 0\nfunc inc(n int) int { return n + 1 }").unwrap();
        second.apply_dump(&Dump::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(second.eval("inc(a)").unwrap(), Some(int(4)));
    }

    #[test]
    fn test_snapshot_keeps_shared_pointers() {
        let source = "type T struct{n int}\na := &T{}\nb := a\nb.n = 5";
        let (mut first, _) = session_with_output();
        first.eval(source).unwrap();
        let bytes = first.dump().unwrap().to_bytes().unwrap();

        let (mut second, _) = session_with_output();
        second.eval(source).unwrap();
        second.apply_dump(&Dump::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(second.eval("a.n = 7\nb.n").unwrap(), Some(int(7)));
        assert_eq!(first.eval("a.n = 7\nb.n").unwrap(), Some(int(7)));
    }

    #[test]
    fn test_snapshot_rejects_mismatch() {
        let (mut first, _) = session_with_output();
        first.eval("a := 3").unwrap();
        let dump = first.dump().unwrap();

        let (mut renamed, _) = session_with_output();
        renamed.eval("b := 3").unwrap();
        assert!(matches!(
            renamed.apply_dump(&dump),
            Err(Error::Snapshot(snapshot::SnapshotError::NameMismatch { .. }))
        ));

        let (mut retyped, _) = session_with_output();
        retyped.eval("a := 1.5").unwrap();
        assert!(matches!(
            retyped.apply_dump(&dump),
            Err(Error::Snapshot(snapshot::SnapshotError::TypeMismatch { .. }))
        ));
        assert_eq!(retyped.eval("a").unwrap(), Some(Value::Float(1.5)));

        let (mut empty, _) = session_with_output();
        assert!(matches!(
            empty.apply_dump(&dump),
            Err(Error::Snapshot(snapshot::SnapshotError::OutOfRange { .. }))
        ));
    }
}
