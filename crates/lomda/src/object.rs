use std::fmt;

use indexmap::IndexMap;

use crate::{
    heap::{Heap, HeapData},
    value::Value,
};

/// A Lomda value that can be returned from the interpreter.
///
/// This is the public-facing value type: it owns all of its data and needs
/// no heap. Closures and thunks have no structural mapping and surface as
/// `Repr` text.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Int(i64),
    Real(f64),
    Bool(bool),
    Void,
    Str(String),
    List(Vec<Object>),
    Dict(IndexMap<String, Object>),
    Tuple(Box<Object>, Box<Object>),
    /// An algebraic-data-type instance: type name, constructor kind, fields.
    Data {
        name: String,
        kind: String,
        fields: Vec<Object>,
    },
    /// Output-only rendering for values with no structural mapping.
    Repr(String),
}

impl Object {
    pub(crate) fn from_value(heap: &Heap, v: &Value) -> Self {
        match v {
            Value::Int(n) => Self::Int(*n),
            Value::Real(r) => Self::Real(*r),
            Value::Bool(b) => Self::Bool(*b),
            Value::Void => Self::Void,
            Value::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Self::Str(s.clone()),
                HeapData::List(items) => Self::List(items.iter().map(|x| Self::from_value(heap, x)).collect()),
                HeapData::Dict(entries) => Self::Dict(
                    entries
                        .iter()
                        .map(|(k, x)| (k.clone(), Self::from_value(heap, x)))
                        .collect(),
                ),
                HeapData::Tuple(l, r) => Self::Tuple(
                    Self::from_value(heap, l).into(),
                    Self::from_value(heap, r).into(),
                ),
                HeapData::Adt(adt) => Self::Data {
                    name: adt.type_name.clone(),
                    kind: adt.kind.clone(),
                    fields: adt.fields.iter().map(|x| Self::from_value(heap, x)).collect(),
                },
                HeapData::Lambda(_) | HeapData::Thunk(_) | HeapData::Frame(_) => Self::Repr(v.display(heap)),
            },
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Real(r) => {
                if r.is_finite() {
                    write!(f, "{}", ryu::Buffer::new().format(*r))
                } else {
                    write!(f, "{r}")
                }
            }
            Self::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Self::Void => write!(f, "void"),
            Self::Str(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        _ => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Self::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
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
            Self::Data { kind, fields, .. } => {
                write!(f, "{kind}(")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Self::Repr(s) => write!(f, "{s}"),
        }
    }
}
