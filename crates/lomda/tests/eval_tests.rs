//! Evaluation tests driving the public `Runner` API.

use lomda::{CollectStringPrint, ErrorCategory, NoPrint, Object, Runner};
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
fn arithmetic_follows_pemdas() {
    assert_eq!(eval("1 + 2 * 3"), Object::Int(7));
    assert_eq!(eval("(1 + 2) * 3"), Object::Int(9));
    assert_eq!(eval("2 ^ 3 ^ 2"), Object::Int(512));
}

#[test]
fn integer_promotes_to_real() {
    assert_eq!(eval("1 + 0.5"), Object::Real(1.5));
    assert_eq!(eval("2 * 2.5"), Object::Real(5.0));
}

#[test]
fn division_by_zero_surfaces_infinity() {
    assert_eq!(eval("1 / 0"), Object::Real(f64::INFINITY));
    let Object::Real(nan) = eval("0.0 / 0.0") else {
        panic!("expected a real")
    };
    assert!(nan.is_nan());
}

#[test]
fn repeated_runs_yield_equal_values() {
    // Evaluating under identical fresh environments is deterministic.
    let runner = Runner::new("let xs = [1, 2]; xs + [3, 4]", "test.lom").unwrap();
    let first = runner.run(&mut NoPrint).unwrap();
    let second = runner.run(&mut NoPrint).unwrap();
    assert_eq!(first, second);
}

#[test]
fn closures_capture_their_definition_environment() {
    assert_eq!(eval("let n = 10; let f = lambda (x) x + n; f(5)"), Object::Int(15));
    // Shadowing after capture does not disturb the closure.
    assert_eq!(
        eval("let n = 10; let f = lambda (x) x + n; let n = 99; f(5)"),
        Object::Int(15)
    );
}

#[test]
fn recursion_through_let() {
    assert_eq!(
        eval("let fact = lambda (n) if n <= 1 then 1 else n * fact(n - 1); fact(5)"),
        Object::Int(120)
    );
    assert_eq!(
        eval("let fib(n) = if n < 2 then n else fib(n - 1) + fib(n - 2); fib(12)"),
        Object::Int(144)
    );
}

#[test]
fn mutual_recursion_within_one_let() {
    let src = "let is_even = lambda (n) if n == 0 then true else is_odd(n - 1), \
               is_odd = lambda (n) if n == 0 then false else is_even(n - 1); \
               is_even(10)";
    assert_eq!(eval(src), Object::Bool(true));
}

#[test]
fn runaway_recursion_is_a_runtime_error() {
    let err = eval_err("let f(n) = f(n + 1); f(0)");
    assert_eq!(err.category, ErrorCategory::Runtime);
}

#[test]
fn wrong_arity_is_an_error() {
    let err = eval_err("let f = lambda (a, b) a + b; f(1)");
    assert_eq!(err.category, ErrorCategory::Runtime);
}

#[test]
fn applying_a_non_lambda_is_a_type_error() {
    let err = eval_err("let x = 5; x(3)");
    assert_eq!(err.category, ErrorCategory::Type);
}

#[test]
fn unbound_variables_are_runtime_errors() {
    let err = eval_err("nope + 1");
    assert_eq!(err.category, ErrorCategory::Runtime);
}

#[test]
fn list_access_and_slicing() {
    assert_eq!(eval("let xs = [1, 2, 3]; xs[1]"), Object::Int(2));
    assert_eq!(eval("[10, 20, 30, 40][1:3]").to_string(), "[20, 30]");
    assert_eq!(eval("[10, 20, 30][:2]").to_string(), "[10, 20]");
    assert_eq!(eval("[10, 20, 30][1:]").to_string(), "[20, 30]");
}

#[test]
fn out_of_bounds_access_is_an_error() {
    assert_eq!(eval_err("[1, 2][5]").category, ErrorCategory::Runtime);
    assert_eq!(eval_err("[1, 2][1:9]").category, ErrorCategory::Runtime);
}

#[test]
fn insert_then_remove_restores_the_list() {
    assert_eq!(
        eval("let xs = [1, 2]; insert 9 into xs at 1; remove from xs at 1; xs").to_string(),
        "[1, 2]"
    );
    assert_eq!(eval("let xs = [1, 2]; insert 9 into xs at 1; xs[1]"), Object::Int(9));
    // remove returns the removed element
    assert_eq!(eval("let xs = [7, 8]; remove from xs at 0"), Object::Int(7));
}

#[test]
fn unshared_lists_mutate_independently() {
    assert_eq!(
        eval("let xs = [1, 2]; let ys = [1, 2]; xs[0] = 9; ys[0]"),
        Object::Int(1)
    );
}

#[test]
fn shared_container_cells_alias() {
    // A binding copy shares its cells: mutating through one name is visible
    // through the other when the cell itself is a container.
    assert_eq!(
        eval("let xs = [[1], [2]]; let ys = xs; xs[0][0] = 9; ys[0][0]"),
        Object::Int(9)
    );
}

#[test]
fn assignment_requires_matching_tags_on_primitives() {
    assert_eq!(eval("let x = 5; x = 7; x"), Object::Int(7));
    assert_eq!(eval_err("let x = 5; x = 2.5").category, ErrorCategory::Type);
    assert_eq!(eval_err("let x = 5; x = \"five\"").category, ErrorCategory::Type);
}

#[test]
fn while_and_do_while() {
    assert_eq!(eval("let x = 0; while x < 5 { x = x + 1 }; x"), Object::Int(5));
    assert_eq!(eval("let x = 9; do { x = x + 1 } while false; x"), Object::Int(10));
    // A while loop that never runs produces void.
    assert_eq!(eval("while false { 1 }"), Object::Void);
}

#[test]
fn for_iterates_in_order() {
    assert_eq!(
        eval("let s = 0; for i in [1, 2, 3, 4] { s = s * 10 + i }; s"),
        Object::Int(1234)
    );
    assert_eq!(eval("for i in [] { i }"), Object::Void);
}

#[test]
fn sequences_evaluate_left_to_right() {
    let runner = Runner::new("print 1; print 2; 3", "test.lom").unwrap();
    let mut print = CollectStringPrint::new();
    let result = runner.run(&mut print).unwrap();
    assert_eq!(result, Object::Int(3));
    assert_eq!(print.take(), "1\n2\n");
}

#[test]
fn print_separates_arguments_with_spaces() {
    let runner = Runner::new("print 1 + 1, \"hi\"", "test.lom").unwrap();
    let mut print = CollectStringPrint::new();
    runner.run(&mut print).unwrap();
    assert_eq!(print.take(), "2 \"hi\"\n");
}

#[test]
fn dictionaries_keep_insertion_order() {
    assert_eq!(eval("{b : 1, a : 2}").to_string(), "{b : 1, a : 2}");
    assert_eq!(eval("let d = {a : 1, b : 2}; d.b"), Object::Int(2));
    assert_eq!(eval("let d = {a : 1}; d.a = 5; d.a"), Object::Int(5));
}

#[test]
fn tuples_project_left_and_right() {
    assert_eq!(eval("left of (1, \"two\")"), Object::Int(1));
    assert_eq!(eval("right of (1, \"two\")"), Object::Str("two".into()));
    // n-tuples are right-nested pairs.
    assert_eq!(eval("right of (1, 2, 3)").to_string(), "(2, 3)");
}

#[test]
fn thunks_force_transparently() {
    assert_eq!(eval("let t = thunk 2 * 3; t + 1"), Object::Int(7));
    assert_eq!(eval("let t = thunk [1, 2]; t[0]"), Object::Int(1));
}

#[test]
fn comparison_semantics() {
    assert_eq!(eval("1 == 1.0"), Object::Bool(true));
    assert_eq!(eval("void == void"), Object::Bool(true));
    assert_eq!(eval("true == true"), Object::Bool(true));
    // Mixed shapes compare false rather than erroring.
    assert_eq!(eval("1 == true"), Object::Bool(false));
}

#[test]
fn boolean_operators_are_strict() {
    assert_eq!(eval("true or false"), Object::Bool(true));
    // Both operands evaluate: a non-boolean on the right still errors.
    assert_eq!(eval_err("true or 1").category, ErrorCategory::Runtime);
}

#[test]
fn magnitude_and_norm() {
    assert_eq!(eval("|0 - 5|"), Object::Int(5));
    assert_eq!(eval("|[1, 2, 3]|"), Object::Int(3));
    assert_eq!(eval("||[3, 4]||"), Object::Real(5.0));
    // Magnitude of a matrix is its determinant.
    assert_eq!(eval("|[[1, 2], [3, 4]]|"), Object::Real(-2.0));
}

#[test]
fn matrix_arithmetic() {
    assert_eq!(eval("[[1, 2], [3, 4]] * [[1, 0], [0, 1]]").to_string(), "[[1, 2], [3, 4]]");
    assert_eq!(eval("[[1, 2], [3, 4]] * [1, 1]").to_string(), "[3, 7]");
    assert_eq!(eval("[1, 2, 3] * [4, 5, 6]"), Object::Int(32));
    assert_eq!(eval("[[0, 1], [0, 0]] ^ 2").to_string(), "[[0, 0], [0, 0]]");
}

#[test]
fn casts_and_shape_tests() {
    assert_eq!(eval("\"42\" as int"), Object::Int(42));
    assert_eq!(eval("2.9 as int"), Object::Int(2));
    assert_eq!(eval("1 as bool"), Object::Bool(true));
    assert_eq!(eval("3 as string"), Object::Str("3".into()));
    assert_eq!(eval_err("\"oops\" as int").category, ErrorCategory::Type);
    assert_eq!(eval("3 isa int"), Object::Bool(true));
    assert_eq!(eval("3 isa real"), Object::Bool(false));
    assert_eq!(eval("3.0 isa number"), Object::Bool(true));
    assert_eq!(eval("[1] isa list"), Object::Bool(true));
}

#[test]
fn membership_tests() {
    assert_eq!(eval("2 in [1, 2, 3]"), Object::Bool(true));
    assert_eq!(eval("5 in [1, 2, 3]"), Object::Bool(false));
    assert_eq!(eval("\"a\" in {a : 1}"), Object::Bool(true));
    assert_eq!(eval("\"ell\" in \"hello\""), Object::Bool(true));
}

#[test]
fn fold_and_map() {
    assert_eq!(eval("fold [1, 2, 3, 4] into lambda (a, b) a + b from 0"), Object::Int(10));
    assert_eq!(eval("fold [] into lambda (a, b) a + b from 42"), Object::Int(42));
    assert_eq!(eval("map lambda (x) x * x over [1, 2, 3]").to_string(), "[1, 4, 9]");
    let err = eval_err("fold [1] into lambda (a) a from 0");
    assert_eq!(err.category, ErrorCategory::Runtime);
}

#[test]
fn string_module() {
    assert_eq!(
        eval("import string; string.strcat(\"ab\", \"cd\")"),
        Object::Str("abcd".into())
    );
    assert_eq!(
        eval("from string import substring; substring(\"hello\", 1, 3)"),
        Object::Str("el".into())
    );
    assert_eq!(eval("from string import strstr; strstr(\"hello\", \"llo\")"), Object::Int(2));
    assert_eq!(eval("from string import strstr; strstr(\"abc\", \"z\")"), Object::Int(-1));
}

#[test]
fn sort_module() {
    assert_eq!(
        eval("import sort; sort.mergesort([3, 1, 2])").to_string(),
        "[1, 2, 3]"
    );
    assert_eq!(
        eval("import sort; sort.quicksort([5, 4, 1, 3, 2])").to_string(),
        "[1, 2, 3, 4, 5]"
    );
    assert_eq!(eval("import sort; sort.is_sorted([1, 2, 2, 3])"), Object::Bool(true));
    assert_eq!(eval("import sort; sort.is_sorted([2, 1])"), Object::Bool(false));
}

#[test]
fn linalg_module() {
    assert_eq!(eval("import linalg; linalg.det([[1, 2], [3, 4]])"), Object::Real(-2.0));
    assert_eq!(eval("import linalg; linalg.trace([[1, 2], [3, 4]])"), Object::Real(5.0));
    assert_eq!(
        eval("import linalg; linalg.transpose([[1, 2], [3, 4]])").to_string(),
        "[[1.0, 3.0], [2.0, 4.0]]"
    );
    let solved = eval("import linalg; linalg.gaussian([[2, 1], [1, 3]], [5, 10])");
    let Object::List(xs) = solved else { panic!("expected a list") };
    assert!((xs[0].as_real().unwrap() - 1.0).abs() < 1e-9);
    assert!((xs[1].as_real().unwrap() - 3.0).abs() < 1e-9);
}

#[test]
fn math_module_classifies_floats() {
    assert_eq!(eval("import math; math.isnan(0.0 / 0.0)"), Object::Bool(true));
    assert_eq!(eval("import math; math.isfinite(1.5)"), Object::Bool(true));
    assert_eq!(eval("import math; math.isinfinite(1 / 0)"), Object::Bool(true));
}

#[test]
fn seeded_random_is_deterministic() {
    let src = "import random; random.seed(7); random.uniform(0.0, 1.0)";
    let first = eval(src);
    let second = eval(src);
    assert_eq!(first, second);
    let Object::Real(x) = first else { panic!("expected a real") };
    assert!((0.0..1.0).contains(&x));
}

#[test]
fn missing_module_is_an_io_error() {
    let err = eval_err("import definitely_missing_module; 1");
    assert_eq!(err.category, ErrorCategory::Io);
}

#[test]
fn adt_declaration_and_switch() {
    let src = "type Tree = Leaf(int) | Node(Tree, Tree); \
               let depth(t) = switch t in Leaf(n) -> 1 | Node(l, r) -> { \
                   let a = depth(l); let b = depth(r); \
                   1 + if a > b then a else b \
               }; \
               depth(Node(Leaf(1), Node(Leaf(2), Leaf(3))))";
    assert_eq!(eval(src), Object::Int(3));
}

#[test]
fn switch_on_the_wrong_constructor_is_an_error() {
    let err = eval_err("type T = A | B; switch A() in B() -> 1");
    assert_eq!(err.category, ErrorCategory::Runtime);
}

#[test]
fn renamed_parameters_are_observationally_equivalent() {
    // Alpha-equivalence: consistently renaming bound parameters changes nothing.
    let with_x = eval("let f = lambda (x) x * x + 1; f(7)");
    let with_y = eval("let f = lambda (y) y * y + 1; f(7)");
    assert_eq!(with_x, with_y);
}

#[test]
fn math_functions() {
    assert_eq!(eval("sqrt 16"), Object::Real(4.0));
    assert_eq!(eval("max [3, 9, 4]"), Object::Real(9.0));
    assert_eq!(eval("min [3, 9, 4]"), Object::Real(3.0));
    let Object::Real(s) = eval("sin 0") else { panic!("expected a real") };
    assert!(s.abs() < 1e-12);
    let Object::Real(e) = eval("exp 1") else { panic!("expected a real") };
    assert!((e - std::f64::consts::E).abs() < 1e-12);
}
