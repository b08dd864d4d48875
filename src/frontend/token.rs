use std::fmt;

/// 1-based source position of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub span: Span,
}

impl Token {
    pub fn new(tok: Tok, span: Span) -> Self {
        Token { tok, span }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delim {
    Paren,
    Bracket,
    Brace,
}

impl Delim {
    pub fn open(self) -> char {
        match self {
            Delim::Paren => '(',
            Delim::Bracket => '[',
            Delim::Brace => '{',
        }
    }

    pub fn close(self) -> char {
        match self {
            Delim::Paren => ')',
            Delim::Bracket => ']',
            Delim::Brace => '}',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Break,
    Case,
    Const,
    Continue,
    Default,
    Else,
    For,
    Func,
    Goto,
    If,
    Import,
    Map,
    Package,
    Range,
    Return,
    Struct,
    Switch,
    Type,
    Var,
}

impl Keyword {
    pub fn from_ident(s: &str) -> Option<Self> {
        Some(match s {
            "break" => Keyword::Break,
            "case" => Keyword::Case,
            "const" => Keyword::Const,
            "continue" => Keyword::Continue,
            "default" => Keyword::Default,
            "else" => Keyword::Else,
            "for" => Keyword::For,
            "func" => Keyword::Func,
            "goto" => Keyword::Goto,
            "if" => Keyword::If,
            "import" => Keyword::Import,
            "map" => Keyword::Map,
            "package" => Keyword::Package,
            "range" => Keyword::Range,
            "return" => Keyword::Return,
            "struct" => Keyword::Struct,
            "switch" => Keyword::Switch,
            "type" => Keyword::Type,
            "var" => Keyword::Var,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Break => "break",
            Keyword::Case => "case",
            Keyword::Const => "const",
            Keyword::Continue => "continue",
            Keyword::Default => "default",
            Keyword::Else => "else",
            Keyword::For => "for",
            Keyword::Func => "func",
            Keyword::Goto => "goto",
            Keyword::If => "if",
            Keyword::Import => "import",
            Keyword::Map => "map",
            Keyword::Package => "package",
            Keyword::Range => "range",
            Keyword::Return => "return",
            Keyword::Struct => "struct",
            Keyword::Switch => "switch",
            Keyword::Type => "type",
            Keyword::Var => "var",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    // Arithmetic and bitwise
    Add,
    Sub,
    Mul,
    Quo,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,

    // Logic
    LAnd,
    LOr,
    Not,

    // Comparison
    Eql,
    Neq,
    Lss,
    Leq,
    Gtr,
    Geq,

    // Assignment
    Assign,
    Define,
    AddAssign,
    SubAssign,
    MulAssign,
    QuoAssign,
    RemAssign,
    Inc,
    Dec,
}

impl Operator {
    /// Binary precedence, higher binds tighter. `None` for operators that
    /// never appear in binary position.
    pub fn precedence(self) -> Option<u8> {
        use Operator::*;
        Some(match self {
            Mul | Quo | Rem | Shl | Shr | And => 5,
            Add | Sub | Or | Xor => 4,
            Eql | Neq | Lss | Leq | Gtr | Geq => 3,
            LAnd => 2,
            LOr => 1,
            _ => return None,
        })
    }

    /// Operators that may appear in prefix position: `+ - ! ^ & *`.
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            Operator::Add
                | Operator::Sub
                | Operator::Not
                | Operator::Xor
                | Operator::And
                | Operator::Mul
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::Eql
                | Operator::Neq
                | Operator::Lss
                | Operator::Leq
                | Operator::Gtr
                | Operator::Geq
        )
    }

    /// The arithmetic operator behind a compound assignment (`+=` -> `+`).
    pub fn compound_base(self) -> Option<Operator> {
        Some(match self {
            Operator::AddAssign | Operator::Inc => Operator::Add,
            Operator::SubAssign | Operator::Dec => Operator::Sub,
            Operator::MulAssign => Operator::Mul,
            Operator::QuoAssign => Operator::Quo,
            Operator::RemAssign => Operator::Rem,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        use Operator::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Quo => "/",
            Rem => "%",
            And => "&",
            Or => "|",
            Xor => "^",
            Shl => "<<",
            Shr => ">>",
            LAnd => "&&",
            LOr => "||",
            Not => "!",
            Eql => "==",
            Neq => "!=",
            Lss => "<",
            Leq => "<=",
            Gtr => ">",
            Geq => ">=",
            Assign => "=",
            Define => ":=",
            AddAssign => "+=",
            SubAssign => "-=",
            MulAssign => "*=",
            QuoAssign => "/=",
            RemAssign => "%=",
            Inc => "++",
            Dec => "--",
        }
    }
}

/// Syntactic type, names still unresolved.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Name(String),
    Slice(Box<TypeExpr>),
    Map(Box<TypeExpr>, Box<TypeExpr>),
    Ptr(Box<TypeExpr>),
    Func(FuncSig),
    Struct(Vec<(String, TypeExpr)>),
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Name(n) => write!(f, "{}", n),
            TypeExpr::Slice(e) => write!(f, "[]{}", e),
            TypeExpr::Map(k, v) => write!(f, "map[{}]{}", k, v),
            TypeExpr::Ptr(e) => write!(f, "*{}", e),
            TypeExpr::Func(sig) => write!(f, "func{}", sig),
            TypeExpr::Struct(fields) => {
                write!(f, "struct{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{} {}", name, ty)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Option<String>,
    pub ty: TypeExpr,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FuncSig {
    pub params: Vec<Param>,
    pub results: Vec<Param>,
    /// Last parameter is `...T`.
    pub variadic: bool,
}

impl FuncSig {
    /// Result names, when every result is named.
    pub fn named_results(&self) -> Option<Vec<String>> {
        if self.results.is_empty() {
            return None;
        }
        self.results.iter().map(|p| p.name.clone()).collect()
    }
}

impl fmt::Display for FuncSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if self.variadic && i + 1 == self.params.len() {
                write!(f, "...")?;
            }
            write!(f, "{}", p.ty)?;
        }
        write!(f, ")")?;
        match self.results.len() {
            0 => Ok(()),
            1 => write!(f, " {}", self.results[0].ty),
            _ => {
                write!(f, " (")?;
                for (i, p) in self.results.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.ty)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// How the elements of a composite literal are laid out on the stack.
#[derive(Debug, Clone, PartialEq)]
pub enum CompositeKeys {
    /// `T{a, b, c}`
    Positional,
    /// `T{x: a, y: b}` for structs, values pushed in field-name order given.
    Fields(Vec<String>),
    /// `map[K]V{k: v, ...}`, key then value for each entry.
    Pairs,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    // ==========================================================================
    // Lexed atoms
    // ==========================================================================
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Keyword(Keyword),
    Op(Operator),
    Comma,
    Semicolon,
    Colon,
    Dot,
    Ellipsis,
    /// A bracketed group together with its lexed contents.
    Block(Delim, Vec<Token>),

    // ==========================================================================
    // Shaped expression tokens
    // ==========================================================================
    Binary(Operator),
    Unary(Operator),
    /// Call with the given argument count; arguments precede the callee.
    /// `spread` marks a final `xs...` argument.
    Call {
        argc: usize,
        spread: bool,
    },
    Index,
    Slice {
        low: bool,
        high: bool,
    },
    Field(String),
    Composite {
        ty: TypeExpr,
        len: usize,
        keys: CompositeKeys,
    },
    /// A type used in value position (conversion callee, `make` argument).
    TypeRef(TypeExpr),

    // ==========================================================================
    // Shaped statement tokens
    // ==========================================================================
    /// Preceded by the target identifier, pops one value.
    Define,
    Assign,
    Decl {
        name: String,
        ty: Option<TypeExpr>,
        init: bool,
    },
    /// Address of a variable (or the pointer it holds) as an assignment base.
    Place(String),
    IndexAssign,
    /// Field path below the `Place` base, outermost first.
    FieldAssign(Vec<String>),
    DerefAssign,
    ConstDecl {
        name: String,
        ty: Option<TypeExpr>,
        expr: Vec<Token>,
        iota: i64,
    },
    TypeDecl {
        name: String,
        ty: TypeExpr,
    },
    Import {
        name: String,
        path: String,
    },
    /// Hoisted signature of a top-level function.
    FuncDecl {
        name: String,
        sig: FuncSig,
    },
    /// Start of a function body; closed by `Label("<name>_end")`.
    Func {
        name: String,
        sig: FuncSig,
    },
    Return(usize),
    Label(String),
    Goto(String),
    JumpFalse(String),
    JumpTrue(String),
    JumpSetFalse(String),
    JumpSetTrue(String),
    Range,
    Next {
        label: String,
        key: Option<String>,
        value: Option<String>,
        define: bool,
    },
    Enter(String),
    Leave,
    Mark,
    Discard,
    Drop,
}

impl Tok {
    /// True for tokens after which a newline inserts a semicolon.
    pub fn ends_statement(&self) -> bool {
        match self {
            Tok::Ident(_) | Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::Block(..) => true,
            Tok::Keyword(k) => matches!(k, Keyword::Break | Keyword::Continue | Keyword::Return),
            Tok::Op(op) => matches!(op, Operator::Inc | Operator::Dec),
            _ => false,
        }
    }
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "{}", s),
            Tok::Int(n) => write!(f, "{}", n),
            Tok::Float(n) => write!(f, "{:?}", n),
            Tok::Str(s) => write!(f, "{:?}", s),
            Tok::Keyword(k) => write!(f, "{}", k.as_str()),
            Tok::Op(op) => write!(f, "{}", op.as_str()),
            Tok::Comma => write!(f, ","),
            Tok::Semicolon => write!(f, ";"),
            Tok::Colon => write!(f, ":"),
            Tok::Dot => write!(f, "."),
            Tok::Ellipsis => write!(f, "..."),
            Tok::Block(d, inner) => {
                write!(f, "{}", d.open())?;
                for (i, t) in inner.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", t.tok)?;
                }
                write!(f, "{}", d.close())
            }
            Tok::Binary(op) => write!(f, "{}", op.as_str()),
            Tok::Unary(op) => write!(f, "{}u", op.as_str()),
            Tok::Call { argc, spread } => {
                write!(f, "Call({}{})", argc, if *spread { "..." } else { "" })
            }
            Tok::Index => write!(f, "Index"),
            Tok::Slice { low, high } => write!(f, "Slice({}, {})", low, high),
            Tok::Field(name) => write!(f, ".{}", name),
            Tok::Composite { ty, len, .. } => write!(f, "Composite({}, {})", ty, len),
            Tok::TypeRef(ty) => write!(f, "Type({})", ty),
            Tok::Define => write!(f, ":="),
            Tok::Assign => write!(f, "="),
            Tok::Decl { name, ty, init } => match ty {
                Some(ty) => write!(f, "Decl({} {}, {})", name, ty, init),
                None => write!(f, "Decl({}, {})", name, init),
            },
            Tok::Place(name) => write!(f, "Place({})", name),
            Tok::IndexAssign => write!(f, "IndexAssign"),
            Tok::FieldAssign(path) => write!(f, "FieldAssign({})", path.join(".")),
            Tok::DerefAssign => write!(f, "DerefAssign"),
            Tok::ConstDecl { name, iota, .. } => write!(f, "Const({}, iota={})", name, iota),
            Tok::TypeDecl { name, ty } => write!(f, "TypeDecl({} {})", name, ty),
            Tok::Import { name, path } => write!(f, "Import({} {:?})", name, path),
            Tok::FuncDecl { name, sig } => write!(f, "FuncDecl({}{})", name, sig),
            Tok::Func { name, sig } => write!(f, "Func({}{})", name, sig),
            Tok::Return(n) => write!(f, "Return({})", n),
            Tok::Label(l) => write!(f, "{}:", l),
            Tok::Goto(l) => write!(f, "Goto({})", l),
            Tok::JumpFalse(l) => write!(f, "JumpFalse({})", l),
            Tok::JumpTrue(l) => write!(f, "JumpTrue({})", l),
            Tok::JumpSetFalse(l) => write!(f, "JumpSetFalse({})", l),
            Tok::JumpSetTrue(l) => write!(f, "JumpSetTrue({})", l),
            Tok::Range => write!(f, "Range"),
            Tok::Next {
                label, key, value, ..
            } => write!(
                f,
                "Next({}, {}, {})",
                label,
                key.as_deref().unwrap_or("_"),
                value.as_deref().unwrap_or("_")
            ),
            Tok::Enter(s) => write!(f, "Enter({})", s),
            Tok::Leave => write!(f, "Leave"),
            Tok::Mark => write!(f, "Mark"),
            Tok::Discard => write!(f, "Discard"),
            Tok::Drop => write!(f, "Drop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_precedence_order() {
        let mul = Operator::Mul.precedence().unwrap();
        let add = Operator::Add.precedence().unwrap();
        let cmp = Operator::Lss.precedence().unwrap();
        let and = Operator::LAnd.precedence().unwrap();
        let or = Operator::LOr.precedence().unwrap();
        assert!(mul > add && add > cmp && cmp > and && and > or);
        assert_eq!(Operator::Not.precedence(), None);
    }

    #[test]
    fn test_compound_base() {
        assert_eq!(Operator::AddAssign.compound_base(), Some(Operator::Add));
        assert_eq!(Operator::Dec.compound_base(), Some(Operator::Sub));
        assert_eq!(Operator::Assign.compound_base(), None);
    }

    #[test]
    fn test_type_expr_display() {
        let ty = TypeExpr::Map(
            Box::new(TypeExpr::Name("string".into())),
            Box::new(TypeExpr::Slice(Box::new(TypeExpr::Name("int".into())))),
        );
        assert_eq!(ty.to_string(), "map[string][]int");
    }

    #[test]
    fn test_named_results() {
        let sig = FuncSig {
            params: vec![],
            results: vec![
                Param {
                    name: Some("a".into()),
                    ty: TypeExpr::Name("int".into()),
                },
                Param {
                    name: None,
                    ty: TypeExpr::Name("int".into()),
                },
            ],
            variadic: false,
        };
        assert_eq!(sig.named_results(), None);
    }
}
