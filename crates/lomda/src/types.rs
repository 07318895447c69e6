//! The type model: a closed sum of types, most-general-unifier bookkeeping,
//! and the type environment carried through inference.

use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{config, error::debug};

/// The closed sum of types.
///
/// `Sum` and `Mult` are deferred algebraic constraints: "these two operand
/// types must later unify to the same numeric-or-list carrier". They are
/// discharged by substitution as soon as both sides become constant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Type {
    Int,
    Real,
    Bool,
    Str,
    Void,
    List(Box<Type>),
    Tuple(Box<Type>, Box<Type>),
    /// Function type; carries the type environment captured when the lambda
    /// was typed, used to type later applications.
    Lambda(Box<Type>, Box<Type>, Option<Box<TypeEnv>>),
    Dict(IndexMap<String, Type>),
    Adt(String),
    Var(String),
    Sum(Box<Type>, Box<Type>),
    Mult(Box<Type>, Box<Type>),
}

impl Type {
    pub fn lambda(left: Type, right: Type) -> Self {
        Self::Lambda(left.boxed(), right.boxed(), None)
    }

    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    fn is_base(&self) -> bool {
        matches!(
            self,
            Self::Int | Self::Real | Self::Bool | Self::Str | Self::Void | Self::Adt(_)
        )
    }

    /// Whether `var` occurs free in this type (the occurs check).
    fn occurs(&self, var: &str) -> bool {
        match self {
            Self::Var(n) => n == var,
            Self::List(t) => t.occurs(var),
            Self::Tuple(l, r) | Self::Lambda(l, r, _) | Self::Sum(l, r) | Self::Mult(l, r) => {
                l.occurs(var) || r.occurs(var)
            }
            Self::Dict(fields) => fields.values().any(|t| t.occurs(var)),
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "Z"),
            Self::Real => write!(f, "R"),
            Self::Bool => write!(f, "B"),
            Self::Str => write!(f, "S"),
            Self::Void => write!(f, "void"),
            Self::List(t) => write!(f, "[{t}]"),
            Self::Tuple(l, r) => write!(f, "({l} * {r})"),
            Self::Lambda(l, r, _) => write!(f, "({l} -> {r})"),
            Self::Dict(fields) => {
                write!(f, "{{")?;
                for (i, (k, t)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} : {t}")?;
                }
                write!(f, "}}")
            }
            Self::Adt(name) | Self::Var(name) => write!(f, "{name}"),
            Self::Sum(l, r) => write!(f, "({l} + {r})"),
            Self::Mult(l, r) => write!(f, "({l} x {r})"),
        }
    }
}

/// Process-wide monotonic counter backing fresh type variable names.
static NEXT_TYPE_VAR: AtomicUsize = AtomicUsize::new(0);

/// Converts a counter value to an alphabetic name: a..z, aa..az, ba..
fn type_var_name(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    out.reverse();
    String::from_utf8(out).expect("ascii letters")
}

/// The type environment: names to types, plus the MGU substitution mapping
/// type variables to their current resolutions.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct TypeEnv {
    types: AHashMap<String, Type>,
    mgu: AHashMap<String, Type>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// The type bound to `x`, instantiating a fresh variable if absent.
    pub fn apply(&mut self, x: &str) -> Type {
        if let Some(t) = self.types.get(x) {
            return t.clone();
        }
        let v = self.make_tvar();
        self.types.insert(x.to_owned(), v.clone());
        v
    }

    pub fn has_var(&self, x: &str) -> bool {
        self.types.contains_key(x)
    }

    pub fn set(&mut self, x: impl Into<String>, t: Type) {
        self.types.insert(x.into(), t);
    }

    pub fn remove(&mut self, x: &str) -> Option<Type> {
        self.types.remove(x)
    }

    pub fn get_tvar(&self, v: &str) -> Option<&Type> {
        self.mgu.get(v)
    }

    pub fn set_tvar(&mut self, v: impl Into<String>, t: Type) {
        self.mgu.insert(v.into(), t);
    }

    /// Allocates a fresh type variable, self-bound in the substitution.
    pub fn make_tvar(&mut self) -> Type {
        let name = type_var_name(NEXT_TYPE_VAR.fetch_add(1, Ordering::Relaxed));
        if config::verbosity() {
            debug("types", format!("Let {name} be a fresh type variable"));
        }
        self.mgu.insert(name.clone(), Type::Var(name.clone()));
        Type::Var(name)
    }

    /// Whether `t` resolves to a type with no free variables under the MGU.
    pub fn is_constant(&self, t: &Type) -> bool {
        match t {
            Type::Var(n) => match self.mgu.get(n) {
                Some(Type::Var(m)) if m == n => false,
                Some(bound) => self.is_constant(&bound.clone()),
                None => false,
            },
            Type::List(t) => self.is_constant(t),
            Type::Tuple(l, r) | Type::Lambda(l, r, _) | Type::Sum(l, r) | Type::Mult(l, r) => {
                self.is_constant(l) && self.is_constant(r)
            }
            Type::Dict(fields) => fields.values().all(|t| self.is_constant(t)),
            _ => true,
        }
    }

    /// Applies the substitution transitively, reducing discharged `Sum`/`Mult`
    /// constraints along the way. Idempotent.
    pub fn subst(&mut self, t: &Type) -> Type {
        match t {
            Type::Var(n) => match self.mgu.get(n).cloned() {
                Some(Type::Var(m)) if m == *n => Type::Var(m),
                Some(bound) => self.subst(&bound),
                None => Type::Var(n.clone()),
            },
            Type::List(t) => Type::List(self.subst(t).boxed()),
            Type::Tuple(l, r) => Type::Tuple(self.subst(l).boxed(), self.subst(r).boxed()),
            Type::Lambda(l, r, env) => Type::Lambda(self.subst(l).boxed(), self.subst(r).boxed(), env.clone()),
            Type::Dict(fields) => Type::Dict(fields.iter().map(|(k, t)| (k.clone(), self.subst(t))).collect()),
            Type::Sum(l, r) => {
                let l = self.subst(l);
                let r = self.subst(r);
                if self.is_constant(&l) && self.is_constant(&r) {
                    self.unify(&l, &r)
                        .unwrap_or_else(|| Type::Sum(l.boxed(), r.boxed()))
                } else {
                    Type::Sum(l.boxed(), r.boxed())
                }
            }
            Type::Mult(l, r) => {
                let l = self.subst(l);
                let r = self.subst(r);
                if self.is_constant(&l) && self.is_constant(&r) {
                    self.unify(&l, &r)
                        .unwrap_or_else(|| Type::Mult(l.boxed(), r.boxed()))
                } else {
                    Type::Mult(l.boxed(), r.boxed())
                }
            }
            other => other.clone(),
        }
    }

    /// Unifies two types under the current substitution, updating it.
    ///
    /// Returns the unified type, or `None` when no unification exists.
    /// Symmetric: `unify(a, b)` succeeds exactly when `unify(b, a)` does.
    pub fn unify(&mut self, a: &Type, b: &Type) -> Option<Type> {
        let result = self.unify_inner(a, b);
        if config::verbosity() {
            match &result {
                Some(t) => debug("types", format!("{a} = {b} unifies to {t}")),
                None => debug("types", format!("{a} = {b} is not unifiable")),
            }
        }
        result
    }

    fn unify_inner(&mut self, a: &Type, b: &Type) -> Option<Type> {
        match (a, b) {
            (Type::Var(n), t) => self.unify_var(n, t),
            (t, Type::Var(n)) => self.unify_var(n, t),
            (Type::Int, Type::Int) => Some(Type::Int),
            (Type::Real, Type::Real) | (Type::Int, Type::Real) | (Type::Real, Type::Int) => Some(Type::Real),
            (Type::Bool, Type::Bool) => Some(Type::Bool),
            (Type::Str, Type::Str) => Some(Type::Str),
            (Type::Void, Type::Void) => Some(Type::Void),
            (Type::Adt(x), Type::Adt(y)) if x == y => Some(Type::Adt(x.clone())),
            (Type::List(x), Type::List(y)) => Some(Type::List(self.unify(x, y)?.boxed())),
            (Type::Tuple(l1, r1), Type::Tuple(l2, r2)) => {
                let l = self.unify(l1, l2)?;
                let r = self.unify(r1, r2)?;
                Some(Type::Tuple(l.boxed(), r.boxed()))
            }
            (Type::Lambda(l1, r1, env), Type::Lambda(l2, r2, _)) => {
                let l = self.unify(l1, l2)?;
                let r = self.unify(r1, r2)?;
                Some(Type::Lambda(l.boxed(), r.boxed(), env.clone()))
            }
            (Type::Dict(xs), Type::Dict(ys)) => {
                if xs.len() != ys.len() {
                    return None;
                }
                let mut fields = IndexMap::new();
                for (k, x) in xs {
                    let y = ys.get(k)?;
                    fields.insert(k.clone(), self.unify(x, y)?);
                }
                Some(Type::Dict(fields))
            }
            (Type::Sum(l, r), t) | (t, Type::Sum(l, r)) => self.unify_algebraic(l, r, t, false),
            (Type::Mult(l, r), t) | (t, Type::Mult(l, r)) => self.unify_algebraic(l, r, t, true),
            _ => None,
        }
    }

    /// Unification against a type variable: chase the binding, or bind after
    /// the occurs check.
    fn unify_var(&mut self, name: &str, t: &Type) -> Option<Type> {
        if let Some(resolved) = self.mgu.get(name).cloned()
            && !matches!(&resolved, Type::Var(m) if m == name)
        {
            let unified = self.unify(&resolved, t)?;
            self.set_tvar(name.to_owned(), unified.clone());
            return Some(unified);
        }
        // The variable is free (self-bound or unregistered).
        match t {
            Type::Var(other) if other == name => Some(Type::Var(name.to_owned())),
            Type::Var(other) => {
                let other_bound = self.mgu.get(other).cloned();
                match other_bound {
                    Some(resolved) if !matches!(&resolved, Type::Var(m) if m == other) => {
                        self.unify_var(name, &resolved)
                    }
                    _ => {
                        // Both free: alias the second to the first.
                        self.set_tvar(other.clone(), Type::Var(name.to_owned()));
                        Some(Type::Var(name.to_owned()))
                    }
                }
            }
            // A free variable against a deferred constraint: discharge the
            // constraint by unifying its sides, then bind to the carrier.
            // Binding the variable to the constraint itself would trip the
            // occurs check whenever the constraint mentions the variable.
            Type::Sum(l, r) | Type::Mult(l, r) => {
                let (l, r) = ((**l).clone(), (**r).clone());
                let z = self.unify(&l, &r)?;
                self.unify_var(name, &z)
            }
            _ => {
                let resolved = self.subst(t);
                if resolved.occurs(name) {
                    return None;
                }
                self.set_tvar(name.to_owned(), resolved.clone());
                Some(resolved)
            }
        }
    }

    /// Unification for the deferred `Sum`/`Mult` constraints.
    ///
    /// Both sides must unify with the target and with each other; the result
    /// must drill down (through list nesting) to a numeric carrier or a still
    /// free variable. A still-free carrier keeps the constraint deferred.
    fn unify_algebraic(&mut self, l: &Type, r: &Type, t: &Type, mult: bool) -> Option<Type> {
        let wrap = |z: Type| {
            if mult {
                Type::Mult(z.clone().boxed(), z.boxed())
            } else {
                Type::Sum(z.clone().boxed(), z.boxed())
            }
        };
        let z = match t {
            Type::Sum(l2, r2) | Type::Mult(l2, r2) => {
                let x = self.unify(l, l2)?;
                let y = self.unify(r, r2)?;
                self.unify(&x, &y)?
            }
            Type::Int | Type::Real | Type::List(_) => {
                let x = self.unify(l, t)?;
                let y = self.unify(r, t)?;
                self.unify(&x, &y)?
            }
            _ => return None,
        };
        // Drill through list nesting to the carrier type.
        let mut carrier = &z;
        while let Type::List(inner) = carrier {
            carrier = inner;
        }
        match carrier {
            Type::Int | Type::Real => Some(z),
            Type::Var(_) => Some(wrap(z)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_names_advance_alphabetically() {
        assert_eq!(type_var_name(0), "a");
        assert_eq!(type_var_name(25), "z");
        assert_eq!(type_var_name(26), "aa");
        assert_eq!(type_var_name(27), "ab");
    }

    #[test]
    fn int_unifies_with_real_to_real() {
        let mut tenv = TypeEnv::new();
        assert_eq!(tenv.unify(&Type::Int, &Type::Real), Some(Type::Real));
        assert_eq!(tenv.unify(&Type::Real, &Type::Int), Some(Type::Real));
    }

    #[test]
    fn mismatched_bases_do_not_unify() {
        let mut tenv = TypeEnv::new();
        assert_eq!(tenv.unify(&Type::Bool, &Type::Int), None);
        assert_eq!(tenv.unify(&Type::Str, &Type::Void), None);
    }

    #[test]
    fn variables_bind_and_resolve() {
        let mut tenv = TypeEnv::new();
        let v = tenv.make_tvar();
        assert_eq!(tenv.unify(&v, &Type::Int), Some(Type::Int));
        assert_eq!(tenv.subst(&v), Type::Int);
    }

    #[test]
    fn unification_is_symmetric_for_lists() {
        let mut a = TypeEnv::new();
        let mut b = TypeEnv::new();
        let list_int = Type::List(Type::Int.boxed());
        let list_real = Type::List(Type::Real.boxed());
        assert_eq!(a.unify(&list_int, &list_real), b.unify(&list_real, &list_int));
    }

    #[test]
    fn occurs_check_rejects_infinite_types() {
        let mut tenv = TypeEnv::new();
        let v = tenv.make_tvar();
        let Type::Var(name) = &v else { unreachable!() };
        let list_of_v = Type::List(Type::Var(name.clone()).boxed());
        assert_eq!(tenv.unify(&v, &list_of_v), None);
    }

    #[test]
    fn substitution_is_idempotent() {
        let mut tenv = TypeEnv::new();
        let v = tenv.make_tvar();
        tenv.unify(&v, &Type::List(Type::Int.boxed()));
        let once = tenv.subst(&v);
        let twice = tenv.subst(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sum_constraint_discharges_to_numeric() {
        let mut tenv = TypeEnv::new();
        let sum = Type::Sum(Type::Int.boxed(), Type::Real.boxed());
        assert_eq!(tenv.unify(&sum, &Type::Real), Some(Type::Real));
    }

    #[test]
    fn sum_constraint_stays_deferred_on_free_variable() {
        let mut tenv = TypeEnv::new();
        let v = tenv.make_tvar();
        let w = tenv.make_tvar();
        let sum = Type::Sum(v.clone().boxed(), v.boxed());
        let unified = tenv.unify(&sum, &Type::List(w.boxed()));
        // A list of a free variable keeps the constraint alive.
        assert!(matches!(unified, Some(Type::Sum(..))));
    }

    #[test]
    fn sum_rejects_boolean_carrier() {
        let mut tenv = TypeEnv::new();
        let sum = Type::Sum(Type::Bool.boxed(), Type::Bool.boxed());
        assert_eq!(tenv.unify(&sum, &Type::Int), None);
    }
}
