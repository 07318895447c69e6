//! Type inference tests through the public `type_check` surface.

use lomda::Runner;
use pretty_assertions::assert_eq;

fn type_of(src: &str) -> String {
    Runner::new(src, "test.lom")
        .expect("program parses")
        .type_check()
        .expect("program types")
}

fn untypable(src: &str) -> bool {
    Runner::new(src, "test.lom")
        .expect("program parses")
        .type_check()
        .is_err()
}

#[test]
fn base_literals() {
    assert_eq!(type_of("42"), "Z");
    assert_eq!(type_of("4.2"), "R");
    assert_eq!(type_of("true"), "B");
    assert_eq!(type_of("\"s\""), "S");
    assert_eq!(type_of("void"), "void");
}

#[test]
fn arithmetic_promotion() {
    assert_eq!(type_of("1 + 2"), "Z");
    assert_eq!(type_of("1 + 2.0"), "R");
    assert_eq!(type_of("2 * 3 * 4"), "Z");
}

#[test]
fn booleans_do_not_add() {
    assert!(untypable("1 + true"));
    assert!(untypable("\"a\" * 2"));
}

#[test]
fn conditionals_unify_branches() {
    assert_eq!(type_of("if true then 1 else 2"), "Z");
    assert_eq!(type_of("if true then 1 else 2.5"), "R");
    assert!(untypable("if 1 then 2 else 3"));
    assert!(untypable("if true then 1 else \"one\""));
}

#[test]
fn lambda_types_resolve_through_application() {
    assert_eq!(type_of("let f = lambda (x) x + 1; f(3)"), "Z");
    assert_eq!(type_of("let f = lambda (x) x + 1; f(3.5)"), "R");
    assert_eq!(type_of("let inc = lambda (x) x + 1; inc(inc(1))"), "Z");
}

#[test]
fn applying_with_a_bad_argument_fails() {
    assert!(untypable("let f = lambda (x) x + 1; f(true)"));
}

#[test]
fn list_types() {
    assert_eq!(type_of("[1, 2, 3]"), "[Z]");
    assert_eq!(type_of("[1, 2.0]"), "[R]");
    assert_eq!(type_of("[1, 2][0]"), "Z");
    assert_eq!(type_of("[1, 2, 3][1:]"), "[Z]");
    assert!(untypable("[1, true]"));
    assert!(untypable("[1, 2][true]"));
}

#[test]
fn tuple_types_are_structural() {
    assert_eq!(type_of("(1, true)"), "(Z * B)");
    assert_eq!(type_of("left of (1, true)"), "Z");
    assert_eq!(type_of("right of (1, true)"), "B");
}

#[test]
fn loops_are_void() {
    assert_eq!(type_of("while true { 1 }"), "void");
    assert_eq!(type_of("for i in [1, 2] { i }"), "void");
    assert!(untypable("while 3 { 1 }"));
}

#[test]
fn combinators() {
    assert_eq!(type_of("fold [1, 2] into lambda (a, b) a + b from 0"), "Z");
    assert_eq!(type_of("map lambda (x) x * 2 over [1, 2]"), "[Z]");
    assert_eq!(type_of("map lambda (x) x > 1 over [1, 2]"), "[B]");
}

#[test]
fn casts_and_tests() {
    assert_eq!(type_of("\"1\" as int"), "Z");
    assert_eq!(type_of("1 isa real"), "B");
    assert_eq!(type_of("1 in [1, 2]"), "B");
}

#[test]
fn derivative_preserves_shape() {
    assert_eq!(type_of("let x = 2; d/dx (x * x)"), "Z");
}

#[test]
fn print_is_void() {
    assert_eq!(type_of("print 1, 2"), "void");
}

#[test]
fn sequences_type_as_their_last_expression() {
    assert_eq!(type_of("print 1; 2 + 3"), "Z");
}
