//! Host functions callable from compiled code.
//!
//! The registry maps package paths to bound Rust closures. Universe entries
//! (`print`, `println`) need no import; everything else is reached through an
//! `import` and a selector such as `strings.ToUpper`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::rc::Rc;

use thiserror::Error;

use crate::lang::types::{FuncType, Type};
use crate::lang::value::{SliceRef, Value};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        HostError(message.into())
    }
}

/// Anything the VM can call through `CallX`.
pub trait Callable: fmt::Debug {
    fn name(&self) -> &str;
    fn arity_in(&self) -> usize;
    fn arity_out(&self) -> usize;
    fn is_variadic(&self) -> bool {
        false
    }
    fn invoke(&self, args: Vec<Value>) -> Result<Vec<Value>, HostError>;
}

type HostImpl = dyn Fn(Vec<Value>) -> Result<Vec<Value>, HostError>;

/// A Rust closure with a Go signature.
pub struct HostFn {
    name: String,
    sig: FuncType,
    func: Box<HostImpl>,
}

impl HostFn {
    pub fn new(
        name: impl Into<String>,
        sig: FuncType,
        func: impl Fn(Vec<Value>) -> Result<Vec<Value>, HostError> + 'static,
    ) -> Self {
        HostFn {
            name: name.into(),
            sig,
            func: Box::new(func),
        }
    }

    pub fn signature(&self) -> &FuncType {
        &self.sig
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({} {})", self.name, self.sig)
    }
}

impl Callable for HostFn {
    fn name(&self) -> &str {
        &self.name
    }

    fn arity_in(&self) -> usize {
        self.sig.params.len()
    }

    fn arity_out(&self) -> usize {
        self.sig.results.len()
    }

    fn is_variadic(&self) -> bool {
        self.sig.variadic
    }

    fn invoke(&self, args: Vec<Value>) -> Result<Vec<Value>, HostError> {
        (self.func)(args)
    }
}

/// A registered host function together with its static type.
#[derive(Debug, Clone)]
pub struct Binding {
    pub ty: Type,
    pub value: Value,
}

impl Binding {
    fn new(f: HostFn) -> Self {
        Binding {
            ty: Type::Func(f.signature().clone()),
            value: Value::Host(Rc::new(f)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    universe: BTreeMap<String, Binding>,
    packages: BTreeMap<String, BTreeMap<String, Binding>>,
}

impl Registry {
    /// An empty registry: no host functions at all.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard host library, printing to stdout.
    pub fn with_stdlib() -> Self {
        Self::with_stdlib_writer(Rc::new(RefCell::new(io::stdout())))
    }

    /// The standard host library, printing to `out`.
    pub fn with_stdlib_writer<W: Write + 'static>(out: Rc<RefCell<W>>) -> Self {
        let mut registry = Self::new();
        stdlib::install(&mut registry, out);
        registry
    }

    pub fn define(&mut self, f: HostFn) {
        self.universe.insert(f.name.clone(), Binding::new(f));
    }

    pub fn define_in(&mut self, package: &str, f: HostFn) {
        let name = f.name.rsplit('.').next().unwrap_or(&f.name).to_string();
        self.packages
            .entry(package.to_string())
            .or_default()
            .insert(name, Binding::new(f));
    }

    pub fn has_package(&self, path: &str) -> bool {
        self.packages.contains_key(path)
    }

    pub fn lookup(&self, package: &str, name: &str) -> Option<&Binding> {
        self.packages.get(package).and_then(|p| p.get(name))
    }

    pub fn universe(&self) -> impl Iterator<Item = (&String, &Binding)> {
        self.universe.iter()
    }
}

mod stdlib {
    use super::*;

    fn sig(params: Vec<Type>, results: Vec<Type>, variadic: bool) -> FuncType {
        FuncType {
            params,
            results,
            variadic,
        }
    }

    fn variadic_any() -> FuncType {
        sig(vec![Type::slice_of(Type::Any)], vec![], true)
    }

    fn write_out<W: Write>(out: &Rc<RefCell<W>>, text: &str) -> Result<(), HostError> {
        let mut out = out.borrow_mut();
        out.write_all(text.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| HostError::new(format!("write failed: {}", e)))
    }

    /// Go `Print` spacing: a blank between operands when neither is a string.
    fn sprint(args: &[Value]) -> String {
        let mut s = String::new();
        for (i, v) in args.iter().enumerate() {
            if i > 0 && !matches!(v, Value::Str(_)) && !matches!(args[i - 1], Value::Str(_)) {
                s.push(' ');
            }
            s.push_str(&v.to_string());
        }
        s
    }

    fn sprintln(args: &[Value]) -> String {
        let mut s = args
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        s.push('\n');
        s
    }

    /// `%v %d %s %q %t %f %.Nf %x %%` subset of Go's formatting verbs.
    pub(super) fn sprintf(format: &str, args: &[Value]) -> String {
        let mut out = String::new();
        let mut args = args.iter();
        let mut chars = format.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let mut precision: Option<usize> = None;
            if chars.peek() == Some(&'.') {
                chars.next();
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                precision = digits.parse().ok();
            }
            let Some(verb) = chars.next() else {
                out.push_str("%!(NOVERB)");
                break;
            };
            if verb == '%' {
                out.push('%');
                continue;
            }
            let Some(arg) = args.next() else {
                out.push_str(&format!("%!{}(MISSING)", verb));
                continue;
            };
            match (verb, arg) {
                ('f', v) => match v.as_f64() {
                    Some(x) => out.push_str(&format!("{:.*}", precision.unwrap_or(6), x)),
                    None => out.push_str(&format!("%!f({})", v)),
                },
                ('q', Value::Str(s)) => out.push_str(&format!("{:?}", s)),
                ('x', Value::Int(n)) => out.push_str(&format!("{:x}", n)),
                ('d', Value::Int(n)) => out.push_str(&n.to_string()),
                ('d', v) => out.push_str(&format!("%!d({})", v)),
                _ => out.push_str(&arg.to_string()),
            }
        }
        for extra in args {
            out.push_str(&format!("%!(EXTRA {})", extra));
        }
        out
    }

    fn string_arg(args: &[Value], i: usize) -> Result<&str, HostError> {
        match args.get(i) {
            Some(Value::Str(s)) => Ok(s),
            Some(other) => Err(HostError::new(format!(
                "argument {} must be string, got {}",
                i + 1,
                other.type_name()
            ))),
            None => Err(HostError::new(format!("missing argument {}", i + 1))),
        }
    }

    fn int_arg(args: &[Value], i: usize) -> Result<i64, HostError> {
        match args.get(i) {
            Some(Value::Int(n)) => Ok(*n),
            Some(other) => Err(HostError::new(format!(
                "argument {} must be int, got {}",
                i + 1,
                other.type_name()
            ))),
            None => Err(HostError::new(format!("missing argument {}", i + 1))),
        }
    }

    fn float_arg(args: &[Value], i: usize) -> Result<f64, HostError> {
        args.get(i)
            .and_then(Value::as_f64)
            .ok_or_else(|| HostError::new(format!("argument {} must be float64", i + 1)))
    }

    fn string_fn(
        name: &str,
        params: usize,
        result: Type,
        f: impl Fn(&[Value]) -> Result<Value, HostError> + 'static,
    ) -> HostFn {
        HostFn::new(
            name,
            sig(vec![Type::String; params], vec![result], false),
            move |args| f(&args).map(|v| vec![v]),
        )
    }

    fn math_fn(name: &str, f: impl Fn(f64) -> f64 + 'static) -> HostFn {
        HostFn::new(
            name,
            sig(vec![Type::Float], vec![Type::Float], false),
            move |args| Ok(vec![Value::Float(f(float_arg(&args, 0)?))]),
        )
    }

    pub(super) fn install<W: Write + 'static>(registry: &mut Registry, out: Rc<RefCell<W>>) {
        let w = Rc::clone(&out);
        registry.define(HostFn::new("print", variadic_any(), move |args| {
            write_out(&w, &sprint(&args)).map(|_| vec![])
        }));
        let w = Rc::clone(&out);
        registry.define(HostFn::new("println", variadic_any(), move |args| {
            write_out(&w, &sprintln(&args)).map(|_| vec![])
        }));

        let w = Rc::clone(&out);
        registry.define_in("fmt", HostFn::new("fmt.Print", variadic_any(), move |args| {
            write_out(&w, &sprint(&args)).map(|_| vec![])
        }));
        let w = Rc::clone(&out);
        registry.define_in("fmt", HostFn::new("fmt.Println", variadic_any(), move |args| {
            write_out(&w, &sprintln(&args)).map(|_| vec![])
        }));
        let format_sig = || {
            sig(
                vec![Type::String, Type::slice_of(Type::Any)],
                vec![],
                true,
            )
        };
        let w = Rc::clone(&out);
        registry.define_in("fmt", HostFn::new("fmt.Printf", format_sig(), move |args| {
            let format = string_arg(&args, 0)?;
            write_out(&w, &sprintf(format, &args[1..])).map(|_| vec![])
        }));
        registry.define_in(
            "fmt",
            HostFn::new(
                "fmt.Sprint",
                sig(vec![Type::slice_of(Type::Any)], vec![Type::String], true),
                |args| Ok(vec![Value::Str(sprint(&args))]),
            ),
        );
        registry.define_in(
            "fmt",
            HostFn::new(
                "fmt.Sprintf",
                sig(
                    vec![Type::String, Type::slice_of(Type::Any)],
                    vec![Type::String],
                    true,
                ),
                |args| {
                    let format = string_arg(&args, 0)?;
                    Ok(vec![Value::Str(sprintf(format, &args[1..]))])
                },
            ),
        );

        registry.define_in(
            "strings",
            string_fn("strings.ToUpper", 1, Type::String, |a| {
                Ok(Value::Str(string_arg(a, 0)?.to_uppercase()))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.ToLower", 1, Type::String, |a| {
                Ok(Value::Str(string_arg(a, 0)?.to_lowercase()))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.TrimSpace", 1, Type::String, |a| {
                Ok(Value::Str(string_arg(a, 0)?.trim().to_string()))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.Contains", 2, Type::Bool, |a| {
                Ok(Value::Bool(string_arg(a, 0)?.contains(string_arg(a, 1)?)))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.HasPrefix", 2, Type::Bool, |a| {
                Ok(Value::Bool(string_arg(a, 0)?.starts_with(string_arg(a, 1)?)))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.HasSuffix", 2, Type::Bool, |a| {
                Ok(Value::Bool(string_arg(a, 0)?.ends_with(string_arg(a, 1)?)))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.Index", 2, Type::Int, |a| {
                let found = string_arg(a, 0)?.find(string_arg(a, 1)?);
                Ok(Value::Int(found.map(|i| i as i64).unwrap_or(-1)))
            }),
        );
        registry.define_in(
            "strings",
            string_fn("strings.Split", 2, Type::slice_of(Type::String), |a| {
                let parts = string_arg(a, 0)?
                    .split(string_arg(a, 1)?)
                    .map(|p| Value::Str(p.to_string()))
                    .collect();
                Ok(Value::Slice(SliceRef::new(parts)))
            }),
        );
        registry.define_in(
            "strings",
            HostFn::new(
                "strings.Join",
                sig(
                    vec![Type::slice_of(Type::String), Type::String],
                    vec![Type::String],
                    false,
                ),
                |args| {
                    let parts = match args.first() {
                        Some(Value::Slice(s)) => s.items(),
                        _ => Vec::new(),
                    };
                    let parts: Vec<String> = parts.iter().map(Value::to_string).collect();
                    Ok(vec![Value::Str(parts.join(string_arg(&args, 1)?))])
                },
            ),
        );
        registry.define_in(
            "strings",
            HostFn::new(
                "strings.Repeat",
                sig(vec![Type::String, Type::Int], vec![Type::String], false),
                |args| {
                    let count = int_arg(&args, 1)?;
                    let count = usize::try_from(count)
                        .map_err(|_| HostError::new("strings: negative Repeat count"))?;
                    Ok(vec![Value::Str(string_arg(&args, 0)?.repeat(count))])
                },
            ),
        );

        registry.define_in("math", math_fn("math.Sqrt", f64::sqrt));
        registry.define_in("math", math_fn("math.Abs", f64::abs));
        registry.define_in("math", math_fn("math.Floor", f64::floor));
        registry.define_in("math", math_fn("math.Ceil", f64::ceil));
        registry.define_in(
            "math",
            HostFn::new(
                "math.Pow",
                sig(vec![Type::Float, Type::Float], vec![Type::Float], false),
                |args| Ok(vec![Value::Float(float_arg(&args, 0)?.powf(float_arg(&args, 1)?))]),
            ),
        );

        registry.define_in(
            "strconv",
            HostFn::new(
                "strconv.Itoa",
                sig(vec![Type::Int], vec![Type::String], false),
                |args| Ok(vec![Value::Str(int_arg(&args, 0)?.to_string())]),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(registry: &Registry, package: &str, name: &str, args: Vec<Value>) -> Vec<Value> {
        let binding = registry.lookup(package, name).expect("function should be registered");
        match &binding.value {
            Value::Host(f) => f.invoke(args).expect("call should succeed"),
            other => panic!("expected host function, got {:?}", other),
        }
    }

    #[test]
    fn test_println_writes_to_sink() {
        let sink = Rc::new(RefCell::new(Vec::<u8>::new()));
        let registry = Registry::with_stdlib_writer(Rc::clone(&sink));
        call(&registry, "fmt", "Println", vec![Value::Str("a".into()), Value::Int(1)]);
        assert_eq!(String::from_utf8(sink.borrow().clone()).unwrap(), "a 1\n");
    }

    #[test]
    fn test_print_spacing() {
        let registry = Registry::with_stdlib();
        let out = call(
            &registry,
            "fmt",
            "Sprint",
            vec![Value::Int(1), Value::Int(2), Value::Str("x".into()), Value::Int(3)],
        );
        assert_eq!(out, vec![Value::Str("1 2x3".into())]);
    }

    #[test]
    fn test_sprintf_verbs() {
        assert_eq!(
            stdlib::sprintf("%d-%s %.2f %q %v%%", &[
                Value::Int(4),
                Value::Str("go".into()),
                Value::Float(3.14159),
                Value::Str("q".into()),
                Value::Bool(true),
            ]),
            "4-go 3.14 \"q\" true%"
        );
        assert_eq!(stdlib::sprintf("%d", &[]), "%!d(MISSING)");
    }

    #[test]
    fn test_strings_package() {
        let registry = Registry::with_stdlib();
        assert_eq!(
            call(&registry, "strings", "ToUpper", vec![Value::Str("abc".into())]),
            vec![Value::Str("ABC".into())]
        );
        assert_eq!(
            call(&registry, "strings", "Repeat", vec![Value::Str("ab".into()), Value::Int(3)]),
            vec![Value::Str("ababab".into())]
        );
        assert_eq!(
            call(&registry, "strings", "Split", vec![Value::Str("a,b".into()), Value::Str(",".into())]),
            vec![Value::slice_of(vec![Value::Str("a".into()), Value::Str("b".into())])]
        );
    }

    #[test]
    fn test_signatures_and_arity() {
        let registry = Registry::with_stdlib();
        let sqrt = registry.lookup("math", "Sqrt").unwrap();
        assert_eq!(sqrt.ty.to_string(), "func(float64) float64");
        let Value::Host(f) = &sqrt.value else { panic!("not a host function") };
        assert_eq!((f.arity_in(), f.arity_out(), f.is_variadic()), (1, 1, false));
        assert!(registry.has_package("strconv"));
        assert!(!registry.has_package("os"));
        assert!(registry.lookup("math", "Nope").is_none());
    }

    #[test]
    fn test_host_errors_propagate() {
        let registry = Registry::with_stdlib();
        let Value::Host(f) = &registry.lookup("strings", "Repeat").unwrap().value else {
            panic!("not a host function")
        };
        let err = f.invoke(vec![Value::Str("a".into()), Value::Int(-1)]).unwrap_err();
        assert!(err.0.contains("negative"));
    }
}
