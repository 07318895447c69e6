//! Symbolic differentiation: a per-variant AST rewrite producing the tree of
//! the derivative.
//!
//! The symbolic pass may be called from the numeric pass (to build the body
//! of a differentiated lambda), but never the other way around. Variants
//! without a closed-form rule are wrapped in a derivative node so the
//! numeric pass resolves them against the seed environment later.

use crate::ast::{BinOp, Expr, MathFn};

fn int(n: i64) -> Expr {
    Expr::Int(n)
}

fn bin(op: BinOp, l: Expr, r: Expr) -> Expr {
    Expr::Binary(op, l.boxed(), r.boxed())
}

fn math(fun: MathFn, e: Expr) -> Expr {
    Expr::MathFn(fun, e.boxed())
}

/// Rewrites `exp` into an AST computing `∂exp/∂x`.
pub(crate) fn symb_diff(exp: &Expr, x: &str) -> Expr {
    match exp {
        // d/dx c = 0
        Expr::Int(_) | Expr::Real(_) => int(0),

        Expr::Binary(BinOp::Add, l, r) => bin(BinOp::Add, symb_diff(l, x), symb_diff(r, x)),
        Expr::Binary(BinOp::Sub, l, r) => bin(BinOp::Sub, symb_diff(l, x), symb_diff(r, x)),

        // (L R)' = L R' + R L'
        Expr::Binary(BinOp::Mul, l, r) => bin(
            BinOp::Add,
            bin(BinOp::Mul, (**l).clone(), symb_diff(r, x)),
            bin(BinOp::Mul, (**r).clone(), symb_diff(l, x)),
        ),

        // (L/R)' = (R L' - L R') / (R R)
        Expr::Binary(BinOp::Div, l, r) => bin(
            BinOp::Div,
            bin(
                BinOp::Sub,
                bin(BinOp::Mul, (**r).clone(), symb_diff(l, x)),
                bin(BinOp::Mul, (**l).clone(), symb_diff(r, x)),
            ),
            bin(BinOp::Mul, (**r).clone(), (**r).clone()),
        ),

        Expr::MathFn(fun, e) => {
            let du = symb_diff(e, x);
            let u = (**e).clone();
            match fun {
                MathFn::Sin => bin(BinOp::Mul, math(MathFn::Cos, u), du),
                MathFn::Cos => bin(
                    BinOp::Mul,
                    int(-1),
                    bin(BinOp::Mul, math(MathFn::Sin, u), du),
                ),
                MathFn::Tan => bin(
                    BinOp::Div,
                    du,
                    bin(BinOp::Mul, math(MathFn::Cos, u.clone()), math(MathFn::Cos, u)),
                ),
                MathFn::Asin => bin(
                    BinOp::Div,
                    du,
                    math(MathFn::Sqrt, bin(BinOp::Sub, int(1), bin(BinOp::Mul, u.clone(), u))),
                ),
                MathFn::Acos => bin(
                    BinOp::Mul,
                    int(-1),
                    bin(
                        BinOp::Div,
                        du,
                        math(MathFn::Sqrt, bin(BinOp::Sub, int(1), bin(BinOp::Mul, u.clone(), u))),
                    ),
                ),
                MathFn::Atan => bin(BinOp::Div, du, bin(BinOp::Add, int(1), bin(BinOp::Mul, u.clone(), u))),
                MathFn::Sinh => bin(BinOp::Mul, math(MathFn::Cosh, u), du),
                MathFn::Cosh => bin(BinOp::Mul, math(MathFn::Sinh, u), du),
                MathFn::Tanh => bin(
                    BinOp::Div,
                    du,
                    bin(BinOp::Mul, math(MathFn::Cosh, u.clone()), math(MathFn::Cosh, u)),
                ),
                MathFn::Log => bin(BinOp::Div, du, u),
                MathFn::Sqrt => bin(BinOp::Div, du, bin(BinOp::Mul, int(2), math(MathFn::Sqrt, u))),
                MathFn::Exp => bin(BinOp::Mul, math(MathFn::Exp, u), du),
                // No closed form; the numeric pass reports the error.
                MathFn::Max | MathFn::Min => Expr::Derivative(exp.clone().boxed(), x.to_owned()),
            }
        }

        Expr::Thunk(e) => Expr::Thunk(symb_diff(e, x).boxed()),

        // Nested derivatives compose: d/dx (d/dy f) differentiates twice.
        Expr::Derivative(f, y) => {
            let dy = symb_diff(f, y);
            // When the inner rewrite made no progress (a bare residual
            // wrapper), differentiating it again would never terminate;
            // leave a second-order residual for the numeric pass instead.
            if matches!(&dy, Expr::Derivative(inner, v) if inner == f && v == y) {
                Expr::Derivative(exp.clone().boxed(), x.to_owned())
            } else {
                symb_diff(&dy, x)
            }
        }

        // Anything else resolves against the seed environment at numeric time.
        _ => Expr::Derivative(exp.clone().boxed(), x.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_derivative_is_zero() {
        assert_eq!(symb_diff(&Expr::Int(42), "x"), Expr::Int(0));
        assert_eq!(symb_diff(&Expr::Real(1.5), "x"), Expr::Int(0));
    }

    #[test]
    fn sum_rule_distributes() {
        let e = bin(BinOp::Add, Expr::Var("x".into()), Expr::Int(3));
        let d = symb_diff(&e, "x");
        assert_eq!(d.to_string(), "d/dx x + 0");
    }

    #[test]
    fn product_rule_shape() {
        let e = bin(BinOp::Mul, Expr::Var("x".into()), Expr::Var("y".into()));
        let d = symb_diff(&e, "x");
        assert_eq!(d.to_string(), "x * d/dx y + y * d/dx x");
    }

    #[test]
    fn variables_defer_to_the_numeric_pass() {
        let d = symb_diff(&Expr::Var("x".into()), "x");
        assert_eq!(d, Expr::Derivative(Expr::Var("x".into()).boxed(), "x".into()));
    }

    #[test]
    fn nested_derivatives_compose() {
        let e = Expr::Derivative(
            bin(BinOp::Mul, Expr::Var("x".into()), Expr::Var("x".into())).boxed(),
            "x".into(),
        );
        // d/dx (d/dx x*x) should rewrite into a second-order tree rather than
        // leaving the inner derivative untouched.
        let d = symb_diff(&e, "x");
        assert!(!matches!(d, Expr::Derivative(ref inner, _) if matches!(**inner, Expr::Derivative(..))));
    }
}
