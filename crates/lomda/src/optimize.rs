//! The optimizer: constant folding and algebraic simplification over the
//! AST, run before evaluation when `-O` is set. The pass preserves
//! semantics and is idempotent.

use crate::ast::{BinOp, CmpOp, Expr, LetBinding};

/// Whether evaluating the expression can have side effects or fail; only
/// pure operands may be erased by algebraic identities like `e * 0`.
fn is_pure(exp: &Expr) -> bool {
    match exp {
        Expr::Int(_) | Expr::Real(_) | Expr::True | Expr::False | Expr::Void | Expr::Str(_) | Expr::Var(_) => true,
        Expr::List(items) => items.iter().all(is_pure),
        Expr::Tuple(l, r) => is_pure(l) && is_pure(r),
        Expr::Lambda(..) => true,
        _ => false,
    }
}

fn fold_arith(op: BinOp, l: &Expr, r: &Expr) -> Option<Expr> {
    match (l, r) {
        (Expr::Int(a), Expr::Int(b)) => {
            let v = match op {
                BinOp::Add => a.checked_add(*b)?,
                BinOp::Sub => a.checked_sub(*b)?,
                BinOp::Mul => a.checked_mul(*b)?,
                BinOp::Div => {
                    if *b == 0 {
                        return None;
                    }
                    a / b
                }
                BinOp::Mod => {
                    if *b == 0 {
                        return None;
                    }
                    a % b
                }
                BinOp::Pow => return None,
            };
            Some(Expr::Int(v))
        }
        (Expr::Int(_) | Expr::Real(_), Expr::Int(_) | Expr::Real(_)) => {
            let a = num(l)?;
            let b = num(r)?;
            let v = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Mod => a % b,
                BinOp::Pow => return None,
            };
            Some(Expr::Real(v))
        }
        _ => None,
    }
}

fn num(e: &Expr) -> Option<f64> {
    match e {
        Expr::Int(n) => Some(*n as f64),
        Expr::Real(r) => Some(*r),
        _ => None,
    }
}

fn is_zero(e: &Expr) -> bool {
    matches!(e, Expr::Int(0)) || matches!(e, Expr::Real(r) if *r == 0.0)
}

fn is_one(e: &Expr) -> bool {
    matches!(e, Expr::Int(1)) || matches!(e, Expr::Real(r) if *r == 1.0)
}

/// Rewrites the expression bottom-up, folding constants and erasing
/// arithmetic identities.
pub(crate) fn optimize(exp: Expr) -> Expr {
    match exp {
        Expr::Binary(op, l, r) => {
            let l = optimize(*l);
            let r = optimize(*r);
            if let Some(folded) = fold_arith(op, &l, &r) {
                return folded;
            }
            match op {
                BinOp::Add | BinOp::Sub if is_zero(&r) => return l,
                BinOp::Add if is_zero(&l) => return r,
                BinOp::Mul if is_one(&r) => return l,
                BinOp::Mul if is_one(&l) => return r,
                BinOp::Mul if is_zero(&r) && is_pure(&l) => return Expr::Int(0),
                BinOp::Mul if is_zero(&l) && is_pure(&r) => return Expr::Int(0),
                BinOp::Div | BinOp::Pow if is_one(&r) => return l,
                BinOp::Pow if is_zero(&r) && is_pure(&l) => return Expr::Int(1),
                _ => {}
            }
            Expr::Binary(op, l.boxed(), r.boxed())
        }

        Expr::Compare(op, l, r) => {
            let l = optimize(*l);
            let r = optimize(*r);
            if let (Some(a), Some(b)) = (num(&l), num(&r)) {
                let v = match op {
                    CmpOp::Eq => a == b,
                    CmpOp::Neq => a != b,
                    CmpOp::Lt => a < b,
                    CmpOp::Gt => a > b,
                    CmpOp::Leq => a <= b,
                    CmpOp::Geq => a >= b,
                };
                return if v { Expr::True } else { Expr::False };
            }
            Expr::Compare(op, l.boxed(), r.boxed())
        }

        Expr::Not(e) => {
            let e = optimize(*e);
            match e {
                Expr::True => Expr::False,
                Expr::False => Expr::True,
                Expr::Not(inner) => *inner,
                other => Expr::Not(other.boxed()),
            }
        }

        Expr::And(l, r) => {
            let l = optimize(*l);
            let r = optimize(*r);
            match (&l, &r) {
                (Expr::True, _) => r,
                (_, Expr::True) => l,
                (Expr::False, other) | (other, Expr::False) if is_pure(other) => Expr::False,
                _ => Expr::And(l.boxed(), r.boxed()),
            }
        }

        Expr::Or(l, r) => {
            let l = optimize(*l);
            let r = optimize(*r);
            match (&l, &r) {
                (Expr::False, _) => r,
                (_, Expr::False) => l,
                (Expr::True, other) | (other, Expr::True) if is_pure(other) => Expr::True,
                _ => Expr::Or(l.boxed(), r.boxed()),
            }
        }

        Expr::If(cond, t, f) => {
            let cond = optimize(*cond);
            match cond {
                Expr::True => optimize(*t),
                Expr::False => optimize(*f),
                other => Expr::If(other.boxed(), optimize(*t).boxed(), optimize(*f).boxed()),
            }
        }

        Expr::Magnitude(e) => {
            let e = optimize(*e);
            match e {
                Expr::Int(n) => Expr::Int(n.abs()),
                Expr::Real(r) => Expr::Real(r.abs()),
                other => Expr::Magnitude(other.boxed()),
            }
        }

        // Structural recursion for everything else.
        Expr::List(items) => Expr::List(items.into_iter().map(optimize).collect()),
        Expr::Dict(entries) => Expr::Dict(entries.into_iter().map(|(k, v)| (k, optimize(v))).collect()),
        Expr::Tuple(l, r) => Expr::Tuple(optimize(*l).boxed(), optimize(*r).boxed()),
        Expr::Lambda(params, body) => Expr::Lambda(params, optimize(*body).boxed()),
        Expr::Thunk(e) => Expr::Thunk(optimize(*e).boxed()),
        Expr::Apply(op, args) => Expr::Apply(optimize(*op).boxed(), args.into_iter().map(optimize).collect()),
        Expr::While {
            cond,
            body,
            always_enter,
        } => Expr::While {
            cond: optimize(*cond).boxed(),
            body: optimize(*body).boxed(),
            always_enter,
        },
        Expr::For { var, iter, body } => Expr::For {
            var,
            iter: optimize(*iter).boxed(),
            body: optimize(*body).boxed(),
        },
        Expr::Let { bindings, body } => Expr::Let {
            bindings: bindings
                .into_iter()
                .map(|b| LetBinding {
                    name: b.name,
                    expr: optimize(b.expr),
                    rec: b.rec,
                })
                .collect(),
            body: optimize(*body).boxed(),
        },
        Expr::Seq(items) => Expr::Seq(items.into_iter().map(optimize).collect()),
        Expr::Assign(t, e) => Expr::Assign(optimize(*t).boxed(), optimize(*e).boxed()),
        Expr::ListAccess(l, i) => Expr::ListAccess(optimize(*l).boxed(), optimize(*i).boxed()),
        Expr::ListSlice(l, from, to) => Expr::ListSlice(
            optimize(*l).boxed(),
            from.map(|e| optimize(*e).boxed()),
            to.map(|e| optimize(*e).boxed()),
        ),
        Expr::ListAdd { list, index, elem } => Expr::ListAdd {
            list: optimize(*list).boxed(),
            index: optimize(*index).boxed(),
            elem: optimize(*elem).boxed(),
        },
        Expr::ListRemove { list, index } => Expr::ListRemove {
            list: optimize(*list).boxed(),
            index: optimize(*index).boxed(),
        },
        Expr::DictAccess(d, key) => Expr::DictAccess(optimize(*d).boxed(), key),
        Expr::TupleAccess(t, side) => Expr::TupleAccess(optimize(*t).boxed(), side),
        Expr::Derivative(e, x) => Expr::Derivative(optimize(*e).boxed(), x),
        Expr::Norm(e) => Expr::Norm(optimize(*e).boxed()),
        Expr::Print(args) => Expr::Print(args.into_iter().map(optimize).collect()),
        Expr::Cast(e, target) => Expr::Cast(optimize(*e).boxed(), target),
        Expr::Isa(e, shape) => Expr::Isa(optimize(*e).boxed(), shape),
        Expr::Has(item, set) => Expr::Has(optimize(*item).boxed(), optimize(*set).boxed()),
        Expr::Fold { list, func, base } => Expr::Fold {
            list: optimize(*list).boxed(),
            func: optimize(*func).boxed(),
            base: optimize(*base).boxed(),
        },
        Expr::Map { func, list } => Expr::Map {
            func: optimize(*func).boxed(),
            list: optimize(*list).boxed(),
        },
        Expr::MathFn(fun, e) => Expr::MathFn(fun, optimize(*e).boxed()),
        Expr::Import { module, name, body } => Expr::Import {
            module,
            name,
            body: optimize(*body).boxed(),
        },
        Expr::FromImport { module, names, body } => Expr::FromImport {
            module,
            names,
            body: optimize(*body).boxed(),
        },
        Expr::AdtDecl { name, variants, body } => Expr::AdtDecl {
            name,
            variants,
            body: optimize(*body).boxed(),
        },
        Expr::Switch { scrutinee, arms } => Expr::Switch {
            scrutinee: optimize(*scrutinee).boxed(),
            arms: arms
                .into_iter()
                .map(|mut arm| {
                    arm.body = optimize(arm.body);
                    arm
                })
                .collect(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::parse::parse_program;

    fn optimized(src: &str) -> Expr {
        optimize(parse_program(src).expect("parses"))
    }

    #[test]
    fn constants_fold() {
        assert_eq!(optimized("1 + 2 * 3"), Expr::Int(7));
        assert_eq!(optimized("10 / 4"), Expr::Int(2));
        assert_eq!(optimized("1.5 + 0.5"), Expr::Real(2.0));
    }

    #[test]
    fn identities_erase() {
        assert_eq!(optimized("x + 0"), Expr::Var("x".into()));
        assert_eq!(optimized("x * 1"), Expr::Var("x".into()));
        assert_eq!(optimized("x * 0"), Expr::Int(0));
        assert_eq!(optimized("x ^ 1"), Expr::Var("x".into()));
    }

    #[test]
    fn impure_operands_survive_identities() {
        // f() * 0 must still call f.
        let e = optimized("f() * 0");
        assert!(matches!(e, Expr::Binary(BinOp::Mul, ..)));
    }

    #[test]
    fn constant_conditions_select_a_branch() {
        assert_eq!(optimized("if 2 > 1 then 10 else 20"), Expr::Int(10));
        assert_eq!(optimized("if false then 10 else 20"), Expr::Int(20));
    }

    #[test]
    fn division_by_zero_is_left_to_the_evaluator() {
        assert!(matches!(optimized("1 / 0"), Expr::Binary(BinOp::Div, ..)));
    }

    #[test]
    fn the_pass_is_idempotent() {
        let once = optimized("1 + 2 * x + 0");
        let twice = optimize(once.clone());
        assert_eq!(once, twice);
    }
}
