//! Type inference: walks the AST producing a type under a per-call type
//! environment, deferring algebraic constraints until operand types become
//! constant.

use ahash::AHashMap;

use crate::{
    ast::{Expr, MathFn, TupleSide},
    error::{debug, LomdaError, RunResult},
    types::{Type, TypeEnv},
};

fn untypable(exp: &Expr) -> LomdaError {
    LomdaError::type_err(format!("expression '{exp}' is untypable"))
}

fn proof(exp: &Expr, t: &Type) {
    debug("types", format!("⊢ {exp} : {t}"));
}

/// Infers the type of `exp` under `tenv`, updating the MGU substitution.
pub(crate) fn type_of(exp: &Expr, tenv: &mut TypeEnv) -> RunResult<Type> {
    let t = infer(exp, tenv)?;
    proof(exp, &t);
    Ok(t)
}

fn infer(exp: &Expr, tenv: &mut TypeEnv) -> RunResult<Type> {
    match exp {
        Expr::Int(_) => Ok(Type::Int),
        Expr::Real(_) => Ok(Type::Real),
        Expr::True | Expr::False => Ok(Type::Bool),
        Expr::Str(_) => Ok(Type::Str),
        Expr::Void => Ok(Type::Void),
        Expr::Input => Ok(Type::Str),

        Expr::Var(name) => Ok(tenv.apply(name)),

        Expr::Lambda(params, body) => {
            let mut fresh = Vec::with_capacity(params.len());
            let mut shadowed = AHashMap::new();
            for p in params {
                let v = tenv.make_tvar();
                if tenv.has_var(p) {
                    shadowed.insert(p.clone(), tenv.apply(p));
                }
                tenv.set(p.clone(), v.clone());
                fresh.push(v);
            }
            let body_type = type_of(body, tenv);
            for p in params {
                tenv.remove(p);
            }
            for (name, t) in shadowed {
                tenv.set(name, t);
            }
            let mut t = tenv.subst(&body_type?);
            let captured = Some(Box::new(tenv.clone()));
            if fresh.is_empty() {
                t = Type::Lambda(Type::Void.boxed(), t.boxed(), captured);
            } else {
                for (i, v) in fresh.into_iter().enumerate().rev() {
                    let arg = tenv.subst(&v);
                    let env = if i == 0 { captured.clone() } else { None };
                    t = Type::Lambda(arg.boxed(), t.boxed(), env);
                }
            }
            Ok(t)
        }

        Expr::Apply(op, args) => {
            let mut t = type_of(op, tenv)?;
            if args.is_empty() {
                let result = tenv.make_tvar();
                let expected = Type::Lambda(Type::Void.boxed(), result.clone().boxed(), None);
                tenv.unify(&t, &expected).ok_or_else(|| untypable(exp))?;
                return Ok(tenv.subst(&result));
            }
            for arg in args {
                let arg_type = type_of(arg, tenv)?;
                let result = tenv.make_tvar();
                let expected = Type::Lambda(arg_type.boxed(), result.clone().boxed(), None);
                tenv.unify(&expected, &t).ok_or_else(|| untypable(exp))?;
                t = tenv.subst(&result);
            }
            Ok(t)
        }

        Expr::If(cond, then_exp, else_exp) => {
            let c = type_of(cond, tenv)?;
            tenv.unify(&c, &Type::Bool).ok_or_else(|| untypable(exp))?;
            let t = type_of(then_exp, tenv)?;
            let f = type_of(else_exp, tenv)?;
            tenv.unify(&t, &f).ok_or_else(|| untypable(exp))
        }

        Expr::Let { bindings, body } => {
            let mut shadowed = AHashMap::new();
            for binding in bindings {
                let t = type_of(&binding.expr, tenv)?;
                if tenv.has_var(&binding.name) && !shadowed.contains_key(&binding.name) {
                    shadowed.insert(binding.name.clone(), tenv.apply(&binding.name));
                }
                tenv.set(binding.name.clone(), t);
            }
            let result = type_of(body, tenv);
            for binding in bindings {
                tenv.remove(&binding.name);
            }
            for (name, t) in shadowed {
                tenv.set(name, t);
            }
            result
        }

        Expr::Seq(exps) => {
            let mut last = Type::Void;
            for e in exps {
                last = type_of(e, tenv)?;
            }
            Ok(last)
        }

        Expr::Assign(target, source) => {
            let t = type_of(target, tenv)?;
            let s = type_of(source, tenv)?;
            tenv.unify(&t, &s).ok_or_else(|| untypable(exp))
        }

        Expr::While { cond, body, .. } => {
            let c = type_of(cond, tenv)?;
            tenv.unify(&c, &Type::Bool).ok_or_else(|| untypable(exp))?;
            type_of(body, tenv)?;
            Ok(Type::Void)
        }

        Expr::For { var, iter, body } => {
            let elem = tenv.make_tvar();
            let it = type_of(iter, tenv)?;
            tenv.unify(&it, &Type::List(elem.clone().boxed()))
                .ok_or_else(|| untypable(exp))?;
            let shadowed = tenv.has_var(var).then(|| tenv.apply(var));
            tenv.set(var.clone(), elem);
            let result = type_of(body, tenv);
            tenv.remove(var);
            if let Some(t) = shadowed {
                tenv.set(var.clone(), t);
            }
            result?;
            Ok(Type::Void)
        }

        Expr::Not(e) => {
            let t = type_of(e, tenv)?;
            tenv.unify(&t, &Type::Bool).ok_or_else(|| untypable(exp))
        }

        Expr::And(l, r) | Expr::Or(l, r) => {
            let a = type_of(l, tenv)?;
            let b = type_of(r, tenv)?;
            tenv.unify(&a, &Type::Bool).ok_or_else(|| untypable(exp))?;
            tenv.unify(&b, &Type::Bool).ok_or_else(|| untypable(exp))?;
            Ok(Type::Bool)
        }

        Expr::Compare(_, l, r) => {
            let a = type_of(l, tenv)?;
            let b = type_of(r, tenv)?;
            tenv.unify(&a, &b).ok_or_else(|| untypable(exp))?;
            Ok(Type::Bool)
        }

        // U + V: unify directly when both operand types are constant,
        // otherwise defer the algebraic constraint.
        Expr::Binary(op, l, r) => {
            let a = type_of(l, tenv)?;
            let b = type_of(r, tenv)?;
            if tenv.is_constant(&a) && tenv.is_constant(&b) {
                return tenv.unify(&a, &b).ok_or_else(|| untypable(exp));
            }
            let t = match op {
                crate::ast::BinOp::Add | crate::ast::BinOp::Sub => Type::Sum(a.boxed(), b.boxed()),
                _ => Type::Mult(a.boxed(), b.boxed()),
            };
            Ok(t)
        }

        Expr::List(items) => {
            if items.is_empty() {
                return Ok(Type::List(tenv.make_tvar().boxed()));
            }
            let mut t = type_of(&items[0], tenv)?;
            for item in &items[1..] {
                let u = type_of(item, tenv)?;
                t = tenv.unify(&t, &u).ok_or_else(|| untypable(exp))?;
            }
            Ok(Type::List(t.boxed()))
        }

        Expr::Dict(entries) => {
            let mut fields = indexmap::IndexMap::new();
            for (k, e) in entries {
                fields.insert(k.clone(), type_of(e, tenv)?);
            }
            Ok(Type::Dict(fields))
        }

        Expr::Tuple(l, r) => {
            let a = type_of(l, tenv)?;
            let b = type_of(r, tenv)?;
            Ok(Type::Tuple(a.boxed(), b.boxed()))
        }

        Expr::ListAccess(list, index) => {
            let elem = tenv.make_tvar();
            let lt = type_of(list, tenv)?;
            tenv.unify(&lt, &Type::List(elem.clone().boxed()))
                .ok_or_else(|| untypable(exp))?;
            let it = type_of(index, tenv)?;
            tenv.unify(&it, &Type::Int).ok_or_else(|| untypable(exp))?;
            Ok(tenv.subst(&elem))
        }

        Expr::ListSlice(list, from, to) => {
            let elem = tenv.make_tvar();
            let lt = type_of(list, tenv)?;
            let unified = tenv
                .unify(&lt, &Type::List(elem.boxed()))
                .ok_or_else(|| untypable(exp))?;
            for endpoint in [from, to].into_iter().flatten() {
                let it = type_of(endpoint, tenv)?;
                tenv.unify(&it, &Type::Int).ok_or_else(|| untypable(exp))?;
            }
            Ok(unified)
        }

        Expr::ListAdd { list, index, elem } => {
            let slot = tenv.make_tvar();
            let lt = type_of(list, tenv)?;
            tenv.unify(&lt, &Type::List(slot.clone().boxed()))
                .ok_or_else(|| untypable(exp))?;
            let it = type_of(index, tenv)?;
            tenv.unify(&it, &Type::Int).ok_or_else(|| untypable(exp))?;
            let et = type_of(elem, tenv)?;
            tenv.unify(&et, &slot).ok_or_else(|| untypable(exp))?;
            Ok(Type::Void)
        }

        Expr::ListRemove { list, index } => {
            let elem = tenv.make_tvar();
            let lt = type_of(list, tenv)?;
            tenv.unify(&lt, &Type::List(elem.clone().boxed()))
                .ok_or_else(|| untypable(exp))?;
            let it = type_of(index, tenv)?;
            tenv.unify(&it, &Type::Int).ok_or_else(|| untypable(exp))?;
            Ok(tenv.subst(&elem))
        }

        Expr::DictAccess(dict, key) => {
            let t = type_of(dict, tenv)?;
            match tenv.subst(&t) {
                Type::Dict(fields) => fields.get(key).cloned().ok_or_else(|| untypable(exp)),
                Type::Var(_) => Ok(tenv.make_tvar()),
                _ => Err(untypable(exp)),
            }
        }

        Expr::TupleAccess(tuple, side) => {
            let l = tenv.make_tvar();
            let r = tenv.make_tvar();
            let t = type_of(tuple, tenv)?;
            tenv.unify(&t, &Type::Tuple(l.clone().boxed(), r.clone().boxed()))
                .ok_or_else(|| untypable(exp))?;
            Ok(match side {
                TupleSide::Left => tenv.subst(&l),
                TupleSide::Right => tenv.subst(&r),
            })
        }

        // Differentiation preserves the shape of the differentiated value.
        Expr::Derivative(e, _) => type_of(e, tenv),

        Expr::Thunk(e) => type_of(e, tenv),

        Expr::Magnitude(e) => {
            let t = type_of(e, tenv)?;
            match tenv.subst(&t) {
                Type::Int => Ok(Type::Int),
                Type::Real => Ok(Type::Real),
                Type::List(_) => Ok(Type::Int),
                Type::Var(_) | Type::Sum(..) | Type::Mult(..) => Ok(tenv.make_tvar()),
                _ => Err(untypable(exp)),
            }
        }

        Expr::Norm(e) => {
            type_of(e, tenv)?;
            Ok(Type::Real)
        }

        Expr::MathFn(fun, e) => {
            let t = type_of(e, tenv)?;
            let expected = match fun {
                MathFn::Max | MathFn::Min => Type::List(Type::Real.boxed()),
                _ => Type::Real,
            };
            tenv.unify(&t, &expected).ok_or_else(|| untypable(exp))?;
            Ok(Type::Real)
        }

        Expr::Print(args) => {
            for a in args {
                type_of(a, tenv)?;
            }
            Ok(Type::Void)
        }

        Expr::Cast(e, target) => {
            type_of(e, tenv)?;
            match target.as_str() {
                "int" | "integer" => Ok(Type::Int),
                "real" => Ok(Type::Real),
                "string" => Ok(Type::Str),
                "bool" | "boolean" => Ok(Type::Bool),
                _ => Err(untypable(exp)),
            }
        }

        Expr::Isa(e, _) => {
            type_of(e, tenv)?;
            Ok(Type::Bool)
        }

        Expr::Has(item, set) => {
            type_of(item, tenv)?;
            type_of(set, tenv)?;
            Ok(Type::Bool)
        }

        // fold : [a] -> (b -> a -> b) -> b -> b
        Expr::Fold { list, func, base } => {
            let elem = tenv.make_tvar();
            let acc = tenv.make_tvar();
            let lt = type_of(list, tenv)?;
            tenv.unify(&lt, &Type::List(elem.clone().boxed()))
                .ok_or_else(|| untypable(exp))?;
            let ft = type_of(func, tenv)?;
            let expected = Type::lambda(acc.clone(), Type::lambda(elem, acc.clone()));
            tenv.unify(&ft, &expected).ok_or_else(|| untypable(exp))?;
            let bt = type_of(base, tenv)?;
            tenv.unify(&bt, &acc).ok_or_else(|| untypable(exp))?;
            Ok(tenv.subst(&acc))
        }

        // map : (a -> b) -> [a] -> [b]
        Expr::Map { func, list } => {
            let from = tenv.make_tvar();
            let to = tenv.make_tvar();
            let ft = type_of(func, tenv)?;
            tenv.unify(&ft, &Type::lambda(from.clone(), to.clone()))
                .ok_or_else(|| untypable(exp))?;
            let lt = type_of(list, tenv)?;
            tenv.unify(&lt, &Type::List(from.boxed()))
                .ok_or_else(|| untypable(exp))?;
            Ok(Type::List(tenv.subst(&to).boxed()))
        }

        Expr::Import { name, body, .. } => {
            let v = tenv.make_tvar();
            let shadowed = tenv.has_var(name).then(|| tenv.apply(name));
            tenv.set(name.clone(), v);
            let result = type_of(body, tenv);
            tenv.remove(name);
            if let Some(t) = shadowed {
                tenv.set(name.clone(), t);
            }
            result
        }

        Expr::FromImport { names, body, .. } => {
            let mut shadowed = AHashMap::new();
            for name in names {
                if tenv.has_var(name) {
                    shadowed.insert(name.clone(), tenv.apply(name));
                }
                let v = tenv.make_tvar();
                tenv.set(name.clone(), v);
            }
            let result = type_of(body, tenv);
            for name in names {
                tenv.remove(name);
            }
            for (name, t) in shadowed {
                tenv.set(name, t);
            }
            result
        }

        Expr::AdtDecl { name, variants, body } => {
            let mut shadowed = AHashMap::new();
            for variant in variants {
                if tenv.has_var(&variant.kind) {
                    shadowed.insert(variant.kind.clone(), tenv.apply(&variant.kind));
                }
                let mut t = Type::Adt(name.clone());
                if variant.field_types.is_empty() {
                    t = Type::lambda(Type::Void, t);
                } else {
                    for field in variant.field_types.iter().rev() {
                        t = Type::lambda(field.clone(), t);
                    }
                }
                tenv.set(variant.kind.clone(), t);
            }
            let result = type_of(body, tenv);
            for variant in variants {
                tenv.remove(&variant.kind);
            }
            for (name, t) in shadowed {
                tenv.set(name, t);
            }
            result
        }

        Expr::Switch { scrutinee, arms } => {
            type_of(scrutinee, tenv)?;
            let mut result: Option<Type> = None;
            for arm in arms {
                let mut shadowed = AHashMap::new();
                for p in &arm.params {
                    if tenv.has_var(p) {
                        shadowed.insert(p.clone(), tenv.apply(p));
                    }
                    let v = tenv.make_tvar();
                    tenv.set(p.clone(), v);
                }
                let t = type_of(&arm.body, tenv);
                for p in &arm.params {
                    tenv.remove(p);
                }
                for (name, t) in shadowed {
                    tenv.set(name, t);
                }
                let t = t?;
                result = Some(match result {
                    None => t,
                    Some(prev) => tenv.unify(&prev, &t).ok_or_else(|| untypable(exp))?,
                });
            }
            result.ok_or_else(|| untypable(exp))
        }

        Expr::AdtMake { type_name, .. } => Ok(Type::Adt(type_name.clone())),

        Expr::Builtin(_) => Ok(tenv.make_tvar()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parse::parse_program;

    fn type_str(src: &str) -> String {
        let program = parse_program(src).expect("parses");
        let mut tenv = TypeEnv::new();
        match type_of(&program, &mut tenv) {
            Ok(t) => {
                let t = tenv.subst(&t);
                t.to_string()
            }
            Err(_) => "untypable".to_owned(),
        }
    }

    #[test]
    fn literals_have_base_types() {
        assert_eq!(type_str("1"), "Z");
        assert_eq!(type_str("1.5"), "R");
        assert_eq!(type_str("true"), "B");
        assert_eq!(type_str("\"hi\""), "S");
    }

    #[test]
    fn mixed_arithmetic_promotes_to_real() {
        assert_eq!(type_str("1 + 2.5"), "R");
        assert_eq!(type_str("1 + 2"), "Z");
    }

    #[test]
    fn conditional_branches_must_agree() {
        assert_eq!(type_str("if true then 1 else 2"), "Z");
        assert_eq!(type_str("if true then 1 else 2.0"), "R");
        assert_eq!(type_str("if 1 then 2 else 3"), "untypable");
    }

    #[test]
    fn lambda_application_resolves_parameters() {
        assert_eq!(type_str("let f = lambda (x) x + 1; f(3)"), "Z");
    }

    #[test]
    fn list_access_recovers_element_type() {
        assert_eq!(type_str("let xs = [1, 2, 3]; xs[0]"), "Z");
        assert_eq!(type_str("[1, 2][0] + 1"), "Z");
    }

    #[test]
    fn heterogeneous_lists_are_untypable() {
        assert_eq!(type_str("[1, true]"), "untypable");
    }

    #[test]
    fn fold_threads_the_accumulator() {
        assert_eq!(
            type_str("fold [1, 2, 3] into lambda (a, b) a + b from 0"),
            "Z"
        );
    }

    #[test]
    fn map_produces_a_list() {
        assert_eq!(type_str("map lambda (x) x * 2 over [1, 2]"), "[Z]");
    }
}
