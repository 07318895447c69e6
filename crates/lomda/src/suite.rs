//! The built-in test suite behind the `-t` flag: a table of programs and
//! their expected printed results.

use crate::{io::NoPrint, run::Runner};

/// `(program, expected display of the result)`
const CASES: &[(&str, &str)] = &[
    // arithmetic
    ("1 + 2 * 3", "7"),
    ("(1 + 2) * 3", "9"),
    ("2 ^ 10", "1024"),
    ("7 mod 3", "1"),
    ("1 + 2.5", "3.5"),
    ("10 / 4", "2"),
    ("-3 + 5", "2"),
    ("|0 - 4|", "4"),
    // comparison and booleans
    ("3 > 2", "true"),
    ("3 <= 2", "false"),
    ("true and not false", "true"),
    ("1 == 1.0", "true"),
    ("void == void", "true"),
    // control flow
    ("if 3 > 2 then \"yes\" else \"no\"", "\"yes\""),
    ("let x = 0; while x < 5 { x = x + 1 }; x", "5"),
    ("let s = 0; for i in [1, 2, 3, 4] { s = s + i }; s", "10"),
    ("let x = 10; do { x = x + 1 } while false; x", "11"),
    // closures and recursion
    ("let f = lambda (x) x * x; f(3)", "9"),
    ("let add = lambda (a, b) a + b; add(2, 5)", "7"),
    (
        "let fact = lambda (n) if n <= 1 then 1 else n * fact(n - 1); fact(5)",
        "120",
    ),
    ("let fib(n) = if n < 2 then n else fib(n - 1) + fib(n - 2); fib(10)", "55"),
    // lists
    ("let xs = [1, 2, 3]; xs[1]", "2"),
    ("[1, 2] + [10, 20]", "[11, 22]"),
    ("let xs = [1, 2, 3, 4]; xs[1:3]", "[2, 3]"),
    ("let xs = [1, 2]; insert 9 into xs at 1; xs", "[1, 9, 2]"),
    ("let xs = [1, 2, 3]; remove from xs at 0", "1"),
    ("|[1, 2, 3]|", "3"),
    ("[1, 2, 3] * [4, 5, 6]", "32"),
    // dictionaries and tuples
    ("let d = {a : 1, b : 2}; d.b", "2"),
    ("left of (1, 2)", "1"),
    ("right of (1, 2)", "2"),
    // higher-order combinators
    ("fold [1, 2, 3, 4] into lambda (a, b) a + b from 0", "10"),
    ("map lambda (x) x * x over [1, 2, 3]", "[1, 4, 9]"),
    // casts and shape tests
    ("\"42\" as int + 1", "43"),
    ("3 as string", "\"3\""),
    ("3 isa int", "true"),
    ("[1] isa list", "true"),
    ("2 in [1, 2, 3]", "true"),
    // calculus
    ("let x = 2; d/dx (3 * x + 5)", "3"),
    ("let x = 2; d/dx (x * x)", "4"),
    ("let x = 4; d/dx 7", "0"),
    ("let f = lambda (x) x * x; (d/dx f)(3)", "6"),
    ("let f = lambda (x) x * x; d/dx f(3)", "6"),
    ("let x = 1; d/dx (x * x * x)", "3"),
    ("let v = [1, 2]; d/dv (v * v)", "[2, 4]"),
    (
        "let m = [[1, 2], [3, 4]]; d/dm (m * m)[0][0]",
        "[[2, 3], [2, 0]]",
    ),
    // algebraic data types
    (
        "type Shape = Circle(real) | Square(real); switch Circle(2.0) in Circle(r) -> r | Square(s) -> s * s",
        "2.0",
    ),
];

/// Runs every case, reporting failures to stderr. Returns the number of
/// failing cases, which the CLI uses as its exit code.
pub fn run_suite() -> usize {
    let mut failures = 0;
    for (i, (program, expected)) in CASES.iter().enumerate() {
        let outcome = Runner::new(*program, "<test>").and_then(|r| r.run(&mut NoPrint));
        match outcome {
            Ok(v) if v.to_string() == *expected => {}
            Ok(v) => {
                eprintln!("test {i} failed: '{program}' evaluated to {v}, expected {expected}");
                failures += 1;
            }
            Err(e) => {
                eprintln!("test {i} failed: '{program}' reported {e}, expected {expected}");
                failures += 1;
            }
        }
    }
    println!("{} of {} tests passed", CASES.len() - failures, CASES.len());
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_builtin_suite_passes() {
        assert_eq!(run_suite(), 0);
    }
}
