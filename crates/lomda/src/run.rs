//! The public interface for running Lomda code.

use crate::{
    ast::Expr,
    config,
    error::{LomdaError, RunResult},
    eval::Interp,
    infer, object::Object,
    io::PrintWriter,
    optimize, parse,
    types::TypeEnv,
};

/// A parsed (and possibly optimized) program, ready to run.
///
/// # Example
/// ```
/// use lomda::{NoPrint, Object, Runner};
///
/// let runner = Runner::new("1 + 2 * 3", "example.lom").unwrap();
/// let result = runner.run(&mut NoPrint).unwrap();
/// assert_eq!(result, Object::Int(7));
/// ```
#[derive(Debug, Clone)]
pub struct Runner {
    program: Expr,
    code: String,
    script_name: String,
}

impl Runner {
    /// Parses the given code; the optimizer pass runs when enabled.
    ///
    /// # Errors
    /// Returns a `parser` error when the code cannot be parsed.
    pub fn new(code: impl Into<String>, script_name: impl Into<String>) -> Result<Self, LomdaError> {
        let code = code.into();
        let mut program = parse::parse_program(&code)?;
        if config::optimize() {
            program = optimize::optimize(program);
        }
        Ok(Self {
            program,
            code,
            script_name: script_name.into(),
        })
    }

    /// The source code this runner was built from.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Evaluates the program under a fresh environment and heap, forcing the
    /// final value. The heap (including any closure cycles from recursive
    /// bindings) is released en masse when this returns.
    pub fn run(&self, print: &mut dyn PrintWriter) -> RunResult<Object> {
        let mut interp = Interp::new(print);
        let result = interp.run(&self.program);
        let out = match result {
            Ok(v) => {
                let object = Object::from_value(&interp.heap, &v);
                v.drop_with_heap(&mut interp.heap);
                Ok(object)
            }
            Err(e) => Err(e),
        };
        interp.clear_module_cache();
        out
    }

    /// Runs the type inferencer over the program, returning the display form
    /// of the inferred type with the final substitution applied.
    pub fn type_check(&self) -> RunResult<String> {
        let mut tenv = TypeEnv::new();
        let t = infer::type_of(&self.program, &mut tenv)?;
        let t = tenv.subst(&t);
        Ok(t.to_string())
    }
}

/// Parses and runs a program in one step.
pub fn run_source(code: &str, print: &mut dyn PrintWriter) -> RunResult<Object> {
    Runner::new(code, "<source>")?.run(print)
}
