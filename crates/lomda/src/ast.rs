use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "mod",
            Self::Pow => "^",
        }
    }

    /// The verb used in "X is not defined between a and b" messages.
    pub fn verb(self) -> &'static str {
        match self {
            Self::Add => "addition",
            Self::Sub => "subtraction",
            Self::Mul => "multiplication",
            Self::Div => "division",
            Self::Mod => "modulus",
            Self::Pow => "exponentiation",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Leq,
    Geq,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Leq => "<=",
            Self::Geq => ">=",
        }
    }
}

/// The standard math functions recognized as prefix keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum MathFn {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Log,
    Sqrt,
    Exp,
    Max,
    Min,
}

/// Projection side for tuple access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TupleSide {
    Left,
    Right,
}

/// One `let` binder. `rec` marks the parenthesized-parameter sugar form
/// (`let f(x) = ...`), which always produces a lambda.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LetBinding {
    pub name: String,
    pub expr: Expr,
    pub rec: bool,
}

/// One constructor of an ADT declaration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AdtVariant {
    pub kind: String,
    pub field_types: Vec<crate::types::Type>,
}

/// One arm of a `switch` expression.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SwitchArm {
    pub kind: String,
    pub params: Vec<String>,
    pub body: Expr,
}

/// The closed expression family.
///
/// Every variant supports evaluation; the differentiable subset additionally
/// supports the numeric and symbolic derivative operations (the rest report a
/// calculus error when differentiated).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Int(i64),
    Real(f64),
    True,
    False,
    Void,
    Str(String),
    Var(String),
    List(Vec<Expr>),
    Dict(Vec<(String, Expr)>),
    Tuple(Box<Expr>, Box<Expr>),
    Lambda(Vec<String>, Box<Expr>),
    Thunk(Box<Expr>),
    Apply(Box<Expr>, Vec<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    While {
        cond: Box<Expr>,
        body: Box<Expr>,
        /// `do`-`while` enters the body at least once.
        always_enter: bool,
    },
    For {
        var: String,
        iter: Box<Expr>,
        body: Box<Expr>,
    },
    Let {
        bindings: Vec<LetBinding>,
        body: Box<Expr>,
    },
    Seq(Vec<Expr>),
    Assign(Box<Expr>, Box<Expr>),
    ListAccess(Box<Expr>, Box<Expr>),
    ListSlice(Box<Expr>, Option<Box<Expr>>, Option<Box<Expr>>),
    ListAdd {
        list: Box<Expr>,
        index: Box<Expr>,
        elem: Box<Expr>,
    },
    ListRemove {
        list: Box<Expr>,
        index: Box<Expr>,
    },
    DictAccess(Box<Expr>, String),
    TupleAccess(Box<Expr>, TupleSide),
    Derivative(Box<Expr>, String),
    Magnitude(Box<Expr>),
    Norm(Box<Expr>),
    Print(Vec<Expr>),
    Input,
    Cast(Box<Expr>, String),
    Isa(Box<Expr>, String),
    /// Membership test `x in xs`.
    Has(Box<Expr>, Box<Expr>),
    Fold {
        list: Box<Expr>,
        func: Box<Expr>,
        base: Box<Expr>,
    },
    Map {
        func: Box<Expr>,
        list: Box<Expr>,
    },
    MathFn(MathFn, Box<Expr>),
    Import {
        module: String,
        name: String,
        body: Box<Expr>,
    },
    FromImport {
        module: String,
        names: Vec<String>,
        body: Box<Expr>,
    },
    AdtDecl {
        name: String,
        variants: Vec<AdtVariant>,
        body: Box<Expr>,
    },
    Switch {
        scrutinee: Box<Expr>,
        arms: Vec<SwitchArm>,
    },
    /// Body of a generated ADT constructor lambda: packs its parameters
    /// `#0..#n` into an instance of the named constructor.
    AdtMake {
        type_name: String,
        kind: String,
        arity: usize,
    },
    /// Body of a standard-library lambda: reads its named arguments from the
    /// call environment and runs native code.
    Builtin(crate::modules::BuiltinFn),
}

impl Expr {
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    /// Whether the variant participates in differentiation at all.
    pub fn is_differentiable(&self) -> bool {
        !matches!(
            self,
            Self::Str(_)
                | Self::True
                | Self::False
                | Self::Compare(..)
                | Self::And(..)
                | Self::Or(..)
                | Self::Not(_)
                | Self::Cast(..)
                | Self::Isa(..)
                | Self::Has(..)
                | Self::Print(_)
                | Self::Input
                | Self::Import { .. }
                | Self::FromImport { .. }
                | Self::AdtDecl { .. }
                | Self::Switch { .. }
        )
    }
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Expr]) -> fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{a}")?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Real(r) => write!(f, "{}", ryu::Buffer::new().format(*r)),
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Void => write!(f, "void"),
            Self::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Self::Var(x) => write!(f, "{x}"),
            Self::List(items) => {
                write!(f, "[")?;
                write_args(f, items)?;
                write!(f, "]")
            }
            Self::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} : {v}")?;
                }
                write!(f, "}}")
            }
            Self::Tuple(l, r) => write!(f, "({l}, {r})"),
            Self::Lambda(params, body) => {
                write!(f, "lambda (")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                if matches!(**body, Self::Let { .. } | Self::Seq(_)) {
                    write!(f, ") ({body})")
                } else {
                    write!(f, ") {body}")
                }
            }
            Self::Thunk(e) => write!(f, "thunk {e}"),
            Self::Apply(op, args) => {
                if matches!(**op, Self::Var(_)) {
                    write!(f, "{op}(")?;
                } else {
                    write!(f, "({op})(")?;
                }
                write_args(f, args)?;
                write!(f, ")")
            }
            Self::Binary(op, l, r) => write!(f, "{l} {} {r}", op.symbol()),
            Self::Compare(op, l, r) => write!(f, "{l} {} {r}", op.symbol()),
            Self::And(l, r) => write!(f, "{l} and {r}"),
            Self::Or(l, r) => write!(f, "{l} or {r}"),
            Self::Not(e) => write!(f, "not {e}"),
            Self::If(c, t, e) => write!(f, "if {c} then {t} else {e}"),
            Self::While {
                cond,
                body,
                always_enter,
            } => {
                if *always_enter {
                    write!(f, "do {body} while {cond}")
                } else {
                    write!(f, "while {cond} {body}")
                }
            }
            Self::For { var, iter, body } => write!(f, "for {var} in {iter} {body}"),
            Self::Let { bindings, body } => {
                write!(f, "let ")?;
                for (i, b) in bindings.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", b.name, b.expr)?;
                }
                write!(f, "; {body}")
            }
            Self::Seq(es) => {
                for (i, e) in es.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            Self::Assign(tgt, e) => write!(f, "{tgt} = {e}"),
            Self::ListAccess(l, i) => write!(f, "{l}[{i}]"),
            Self::ListSlice(l, from, to) => {
                write!(f, "{l}[")?;
                if let Some(from) = from {
                    write!(f, "{from}")?;
                }
                write!(f, ":")?;
                if let Some(to) = to {
                    write!(f, "{to}")?;
                }
                write!(f, "]")
            }
            Self::ListAdd { list, index, elem } => write!(f, "insert {elem} into {list} at {index}"),
            Self::ListRemove { list, index } => write!(f, "remove from {list} at {index}"),
            Self::DictAccess(d, key) => write!(f, "{d}.{key}"),
            Self::TupleAccess(t, side) => match side {
                TupleSide::Left => write!(f, "left of {t}"),
                TupleSide::Right => write!(f, "right of {t}"),
            },
            Self::Derivative(e, x) => {
                if matches!(**e, Self::Var(_)) {
                    write!(f, "d/d{x} {e}")
                } else {
                    write!(f, "d/d{x} ({e})")
                }
            }
            Self::Magnitude(e) => write!(f, "|{e}|"),
            Self::Norm(e) => write!(f, "||{e}||"),
            Self::Print(args) => {
                write!(f, "print ")?;
                write_args(f, args)
            }
            Self::Input => write!(f, "input"),
            Self::Cast(e, ty) => write!(f, "{e} as {ty}"),
            Self::Isa(e, ty) => write!(f, "{e} isa {ty}"),
            Self::Has(item, set) => write!(f, "{item} in {set}"),
            Self::Fold { list, func, base } => write!(f, "fold {list} into {func} from {base}"),
            Self::Map { func, list } => write!(f, "map {func} over {list}"),
            Self::MathFn(fun, e) => write!(f, "{fun} {e}"),
            Self::Import { module, name, body } => {
                if module == name {
                    write!(f, "import {module}; {body}")
                } else {
                    write!(f, "import {module} as {name}; {body}")
                }
            }
            Self::FromImport { module, names, body } => {
                write!(f, "from {module} import {}; {body}", names.join(", "))
            }
            Self::AdtDecl { name, variants, body } => {
                write!(f, "type {name} = ")?;
                for (i, v) in variants.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}(", v.kind)?;
                    for (j, t) in v.field_types.iter().enumerate() {
                        if j > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{t}")?;
                    }
                    write!(f, ")")?;
                }
                write!(f, "; {body}")
            }
            Self::Switch { scrutinee, arms } => {
                write!(f, "switch {scrutinee} in ")?;
                for (i, arm) in arms.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}({}) -> {}", arm.kind, arm.params.join(", "), arm.body)?;
                }
                Ok(())
            }
            Self::AdtMake { kind, arity, .. } => {
                write!(f, "{kind}(")?;
                for i in 0..*arity {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "#{i}")?;
                }
                write!(f, ")")
            }
            Self::Builtin(b) => write!(f, "{b}"),
        }
    }
}
