//! Differentiation tests: the numeric pass, the symbolic pass through
//! differentiated lambdas, and the agreement between them.

use lomda::{ErrorCategory, NoPrint, Object, Runner};
use pretty_assertions::assert_eq;

fn eval(src: &str) -> Object {
    Runner::new(src, "test.lom")
        .expect("program parses")
        .run(&mut NoPrint)
        .expect("program evaluates")
}

fn eval_err(src: &str) -> lomda::LomdaError {
    Runner::new(src, "test.lom")
        .expect("program parses")
        .run(&mut NoPrint)
        .expect_err("program fails")
}

#[test]
fn derivative_of_a_constant_is_zero() {
    assert_eq!(eval("let x = 4; d/dx 7"), Object::Int(0));
    assert_eq!(eval("let x = 4; let y = 2; d/dx (y * y)"), Object::Int(0));
}

#[test]
fn derivative_of_an_affine_expression_is_its_slope() {
    assert_eq!(eval("let x = 2; d/dx (3 * x + 5)"), Object::Int(3));
    assert_eq!(eval("let x = 100; d/dx (3 * x + 5)"), Object::Int(3));
}

#[test]
fn product_rule() {
    assert_eq!(eval("let x = 2; d/dx (x * x)"), Object::Int(4));
    assert_eq!(eval("let x = 1; d/dx (x * x * x)"), Object::Int(3));
}

#[test]
fn quotient_rule() {
    // d/dx (1 / x) at x = 2 is -1/4
    let Object::Real(v) = eval("let x = 2.0; d/dx (1 / x)") else {
        panic!("expected a real")
    };
    assert!((v + 0.25).abs() < 1e-9);
}

#[test]
fn power_rule() {
    let Object::Real(v) = eval("let x = 3.0; d/dx (x ^ 2)") else {
        panic!("expected a real")
    };
    assert!((v - 6.0).abs() < 1e-9);
}

#[test]
fn differentiated_functions_are_lambdas() {
    // d/dx f is itself a function; applying it evaluates f' at the argument.
    assert_eq!(eval("let f = lambda (x) x * x; (d/dx f)(3)"), Object::Int(6));
    assert_eq!(eval("let f = lambda (x) x * x; d/dx f(3)"), Object::Int(6));
    assert_eq!(eval("let f = lambda (x) x * x; d/dx f(5)"), Object::Int(10));
}

#[test]
fn chain_rule_through_application() {
    // d/dx f(g(x)) via the application rule.
    assert_eq!(
        eval("let f = lambda (y) y * y; let x = 3; d/dx (f(x) + x)"),
        Object::Int(7)
    );
}

#[test]
fn numeric_and_symbolic_derivatives_agree() {
    // The same function differentiated numerically at a point, and applied
    // as a differentiated lambda (whose body is the symbolic rewrite).
    let numeric = eval("let x = 2.0; d/dx (x * x + 3 * x)");
    let symbolic = eval("(d/dy (lambda (y) y * y + 3 * y))(2.0)");
    assert_eq!(numeric.as_real(), symbolic.as_real());
    assert_eq!(numeric.as_real(), Some(7.0));
}

#[test]
fn list_derivatives_are_elementwise() {
    assert_eq!(eval("let x = 2; d/dx [x, x * x, 7]").to_string(), "[1, 4, 0]");
}

#[test]
fn vector_dot_product_derivative() {
    // d/dv (v . v) = 2v under the identity seed.
    assert_eq!(eval("let v = [1, 2]; d/dv (v * v)").to_string(), "[2, 4]");
}

#[test]
fn container_variables_get_identity_seeds() {
    // The seed for d m / d m carries 1 exactly on matched index paths.
    assert_eq!(
        eval("let m = [[1, 2], [3, 4]]; (d/dm m)[0][0]").to_string(),
        "[[1, 0], [0, 0]]"
    );
    assert_eq!(
        eval("let m = [[1, 2], [3, 4]]; (d/dm m)[1][0]").to_string(),
        "[[0, 0], [1, 0]]"
    );
}

#[test]
fn matrix_product_derivatives_flow_through_the_seed() {
    // Each entry of d/dm (m*m) is the gradient of that entry of m*m with
    // respect to the whole matrix. For (m*m)[0][0] = m00*m00 + m01*m10 the
    // gradient is [[2*m00, m10], [m01, 0]].
    assert_eq!(
        eval("let m = [[1, 2], [3, 4]]; d/dm (m * m)[0][0]").to_string(),
        "[[2, 3], [2, 0]]"
    );
    // (m*m)[0][1] = m00*m01 + m01*m11: gradient [[m01, m00 + m11], [0, m01]].
    assert_eq!(
        eval("let m = [[1, 2], [3, 4]]; d/dm (m * m)[0][1]").to_string(),
        "[[2, 5], [0, 2]]"
    );
}

#[test]
fn tuple_derivatives_project() {
    assert_eq!(eval("let x = 2; left of d/dx (x, x * x)"), Object::Int(1));
    assert_eq!(eval("let x = 2; right of d/dx (x, x * x)"), Object::Int(4));
}

#[test]
fn conditional_derivative_follows_the_selected_branch() {
    assert_eq!(eval("let x = 5; d/dx (if x > 0 then x * x else x)"), Object::Int(10));
    assert_eq!(eval("let x = 0 - 5; d/dx (if x > 0 then x * x else x)"), Object::Int(1));
}

#[test]
fn math_function_derivatives() {
    // d/dx sin x at 0 is cos 0 = 1
    let Object::Real(v) = eval("let x = 0.0; d/dx (sin x)") else {
        panic!("expected a real")
    };
    assert!((v - 1.0).abs() < 1e-12);
    // d/dx exp x at 1 is e
    let Object::Real(v) = eval("let x = 1.0; d/dx (exp x)") else {
        panic!("expected a real")
    };
    assert!((v - std::f64::consts::E).abs() < 1e-12);
    // d/dx log x at 2 is 1/2
    let Object::Real(v) = eval("let x = 2.0; d/dx (log x)") else {
        panic!("expected a real")
    };
    assert!((v - 0.5).abs() < 1e-12);
}

#[test]
fn fold_derivative_follows_the_chain_rule() {
    // sum of [x, x, x] differentiates to 3.
    assert_eq!(
        eval("let x = 2; d/dx (fold [x, x, x] into lambda (a, b) a + b from 0)"),
        Object::Int(3)
    );
}

#[test]
fn map_derivative_applies_the_function_derivative() {
    // map (y -> y*y) over [x, 2x]: derivative entries are f'(u) * u'.
    assert_eq!(
        eval("let x = 3; d/dx (map lambda (y) y * y over [x, 2 * x])").to_string(),
        "[6, 24]"
    );
}

#[test]
fn loops_differentiate_iteratively() {
    // The for-derivative pairs each element with its derivative; the result
    // is the last body derivative. d(i * 2) for i = x*x is 2 * d(x*x) = 8.
    assert_eq!(
        eval("let x = 2; d/dx (for i in [x, x * x] { i * 2 })"),
        Object::Int(8)
    );
}

#[test]
fn booleans_and_strings_are_non_differentiable() {
    assert_eq!(eval_err("let x = 1; d/dx \"text\"").category, ErrorCategory::Runtime);
    assert_eq!(eval_err("let x = 1; d/dx (x == 1)").category, ErrorCategory::Runtime);
}

#[test]
fn unseeded_variables_are_calculus_errors() {
    // y is bound to a boolean, which cannot be seeded.
    let err = eval_err("let y = true; let x = 1; d/dx (y * 2)");
    assert_eq!(err.category, ErrorCategory::Calculus);
}

#[test]
fn second_derivative_through_nested_lambdas() {
    // d/dx (d/dx f) for f = x^3... via two differentiated lambdas: f'' = 6x.
    let Object::Real(v) = eval("let f = lambda (x) x * x * x; (d/dx (d/dx f))(2.0)") else {
        panic!("expected a real")
    };
    assert!((v - 12.0).abs() < 1e-9);
}
