use std::fmt::Write as _;

use indexmap::IndexMap;

use crate::heap::{AdtInstance, Heap, HeapData, HeapId, Lambda, Thunk};

/// Primary runtime value type.
///
/// Small immediate values are stored inline; everything with interior
/// structure (strings, lists, dictionaries, tuples, closures, thunks, ADT
/// instances, environment frames) lives in the arena and is referenced via
/// `Ref(HeapId)`.
///
/// NOTE: `Clone` is intentionally NOT derived. Use `clone_with_heap()` so the
/// reference count tracks every copy, and `drop_with_heap()` to release one.
#[derive(Debug, PartialEq)]
pub(crate) enum Value {
    Int(i64),
    Real(f64),
    Bool(bool),
    /// The unit value returned by statements that produce no result.
    Void,
    Ref(HeapId),
}

impl Value {
    /// Copies this value, adding a reference for heap-allocated data.
    pub fn clone_with_heap(&self, heap: &Heap) -> Self {
        match self {
            Self::Int(n) => Self::Int(*n),
            Self::Real(r) => Self::Real(*r),
            Self::Bool(b) => Self::Bool(*b),
            Self::Void => Self::Void,
            Self::Ref(id) => {
                heap.inc_ref(*id);
                Self::Ref(*id)
            }
        }
    }

    /// Releases this value's reference, freeing heap data that reaches zero.
    pub fn drop_with_heap(self, heap: &mut Heap) {
        if let Self::Ref(id) = self {
            heap.dec_ref(id);
        }
    }

    /// Builds a fresh value object with the same contents.
    ///
    /// This is the `let`-binding copy: containers get a new heap slot whose
    /// cells are counted references to the original cells, and closures get a
    /// new slot sharing the captured environment (so the recursion post-pass
    /// can rewrite it without touching the source closure).
    pub fn shallow_copy(&self, heap: &mut Heap) -> Self {
        let id = match self {
            Self::Int(_) | Self::Real(_) | Self::Bool(_) | Self::Void => {
                return self.clone_with_heap(heap);
            }
            Self::Ref(id) => *id,
        };
        let data = match heap.get(id) {
            HeapData::Str(s) => HeapData::Str(s.clone()),
            HeapData::List(items) => {
                let copies: Vec<Value> = items.iter().map(|v| v.clone_with_heap(heap)).collect();
                HeapData::List(copies)
            }
            HeapData::Dict(entries) => {
                let copies: IndexMap<String, Value> = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone_with_heap(heap)))
                    .collect();
                HeapData::Dict(copies)
            }
            HeapData::Tuple(l, r) => HeapData::Tuple(l.clone_with_heap(heap), r.clone_with_heap(heap)),
            HeapData::Lambda(lambda) => {
                if let Some(env) = lambda.env {
                    heap.inc_ref(env);
                }
                HeapData::Lambda(Lambda {
                    params: lambda.params.clone(),
                    body: lambda.body.clone(),
                    env: lambda.env,
                })
            }
            HeapData::Thunk(thunk) => {
                heap.inc_ref(thunk.env);
                HeapData::Thunk(Thunk {
                    body: thunk.body.clone(),
                    env: thunk.env,
                    cached: thunk.cached.as_ref().map(|v| v.clone_with_heap(heap)),
                })
            }
            HeapData::Adt(adt) => HeapData::Adt(AdtInstance {
                type_name: adt.type_name.clone(),
                kind: adt.kind.clone(),
                fields: adt.fields.iter().map(|v| v.clone_with_heap(heap)).collect(),
            }),
            HeapData::Frame(_) => {
                // Frames are copied through the environment chain, never here.
                heap.inc_ref(id);
                return Self::Ref(id);
            }
        };
        Self::Ref(heap.allocate(data))
    }

    /// The user-facing name of this value's shape, for error messages.
    pub fn type_name(&self, heap: &Heap) -> &'static str {
        match self {
            Self::Int(_) => "integer",
            Self::Real(_) => "real",
            Self::Bool(_) => "boolean",
            Self::Void => "void",
            Self::Ref(id) => heap.get(*id).kind_name(),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Real(_))
    }

    /// Numeric payload, promoting integers to reals.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list_id(&self, heap: &Heap) -> Option<HeapId> {
        match self {
            Self::Ref(id) if matches!(heap.get(*id), HeapData::List(_)) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str<'h>(&self, heap: &'h Heap) -> Option<&'h str> {
        match self {
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Renders the value in source-ish form: strings quoted, lists bracketed,
    /// lambdas as `λx,y.body`.
    pub fn display(&self, heap: &Heap) -> String {
        let mut out = String::new();
        self.display_into(heap, &mut out);
        out
    }

    fn display_into(&self, heap: &Heap, out: &mut String) {
        match self {
            Self::Int(n) => {
                let _ = write!(out, "{n}");
            }
            Self::Real(r) => {
                if r.is_finite() {
                    out.push_str(ryu::Buffer::new().format(*r));
                } else {
                    let _ = write!(out, "{r}");
                }
            }
            Self::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Self::Void => out.push_str("void"),
            Self::Ref(id) => match heap.get(*id) {
                HeapData::Str(s) => {
                    out.push('"');
                    for c in s.chars() {
                        match c {
                            '"' => out.push_str("\\\""),
                            '\\' => out.push_str("\\\\"),
                            '\n' => out.push_str("\\n"),
                            '\t' => out.push_str("\\t"),
                            _ => out.push(c),
                        }
                    }
                    out.push('"');
                }
                HeapData::List(items) => {
                    out.push('[');
                    for (i, v) in items.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        v.display_into(heap, out);
                    }
                    out.push(']');
                }
                HeapData::Dict(entries) => {
                    out.push('{');
                    for (i, (k, v)) in entries.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        let _ = write!(out, "{k} : ");
                        v.display_into(heap, out);
                    }
                    out.push('}');
                }
                HeapData::Tuple(l, r) => {
                    out.push('(');
                    l.display_into(heap, out);
                    out.push_str(", ");
                    r.display_into(heap, out);
                    out.push(')');
                }
                HeapData::Lambda(lambda) => {
                    out.push('λ');
                    for (i, p) in lambda.params.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        out.push_str(p);
                    }
                    let _ = write!(out, ".{}", lambda.body);
                }
                HeapData::Thunk(_) => out.push_str("(thunk)"),
                HeapData::Adt(adt) => {
                    out.push_str(&adt.kind);
                    out.push('(');
                    for (i, v) in adt.fields.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        v.display_into(heap, out);
                    }
                    out.push(')');
                }
                HeapData::Frame(_) => out.push_str("(environment)"),
            },
        }
    }
}

/// Structural equality across two values, following comparison semantics:
/// numbers compare numerically, booleans to booleans, void to void, strings
/// and containers structurally, everything else is unequal.
pub(crate) fn values_equal(heap: &Heap, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::Real(_), Value::Int(_) | Value::Real(_)) => {
            a.as_f64().expect("checked number") == b.as_f64().expect("checked number")
        }
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Void, Value::Void) => true,
        (Value::Ref(x), Value::Ref(y)) => {
            if x == y {
                return true;
            }
            match (heap.get(*x), heap.get(*y)) {
                (HeapData::Str(s), HeapData::Str(t)) => s == t,
                (HeapData::List(xs), HeapData::List(ys)) => {
                    xs.len() == ys.len() && xs.iter().zip(ys).all(|(u, v)| values_equal(heap, u, v))
                }
                (HeapData::Dict(xs), HeapData::Dict(ys)) => {
                    xs.len() == ys.len()
                        && xs
                            .iter()
                            .all(|(k, u)| ys.get(k).is_some_and(|v| values_equal(heap, u, v)))
                }
                (HeapData::Tuple(la, ra), HeapData::Tuple(lb, rb)) => {
                    values_equal(heap, la, lb) && values_equal(heap, ra, rb)
                }
                (HeapData::Adt(u), HeapData::Adt(v)) => {
                    u.type_name == v.type_name
                        && u.kind == v.kind
                        && u.fields.len() == v.fields.len()
                        && u.fields.iter().zip(&v.fields).all(|(x, y)| values_equal(heap, x, y))
                }
                _ => false,
            }
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let mut heap = Heap::new();
        assert_eq!(Value::Int(7).display(&heap), "7");
        assert_eq!(Value::Real(2.5).display(&heap), "2.5");
        assert_eq!(Value::Bool(true).display(&heap), "true");
        assert_eq!(Value::Void.display(&heap), "void");
        let s = heap.allocate(HeapData::Str("yes".to_owned()));
        assert_eq!(Value::Ref(s).display(&heap), "\"yes\"");
        let xs = heap.allocate(HeapData::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(Value::Ref(xs).display(&heap), "[1, 2]");
    }

    #[test]
    fn numbers_compare_across_tags() {
        let heap = Heap::new();
        assert!(values_equal(&heap, &Value::Int(3), &Value::Real(3.0)));
        assert!(!values_equal(&heap, &Value::Int(3), &Value::Bool(true)));
        assert!(values_equal(&heap, &Value::Void, &Value::Void));
    }

    #[test]
    fn shallow_copy_shares_cells() {
        let mut heap = Heap::new();
        let s = heap.allocate(HeapData::Str("a".to_owned()));
        let xs = heap.allocate(HeapData::List(vec![Value::Ref(s)]));
        let copy = Value::Ref(xs).shallow_copy(&mut heap);
        // The cell is shared: two references to the string.
        assert_eq!(heap.refcount(s), 2);
        copy.drop_with_heap(&mut heap);
        assert_eq!(heap.refcount(s), 1);
    }
}
