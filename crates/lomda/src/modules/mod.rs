//! Standard-library modules: dictionaries of builtin lambdas.
//!
//! A builtin lambda is an ordinary closure whose body is a builtin dispatch
//! expression; applying it binds the arguments into a call frame, and the
//! dispatch reads them back by parameter name and runs native code.

mod fs_mod;
mod linalg_mod;
mod math_mod;
mod random_mod;
mod sort_mod;
mod string_mod;
mod sys_mod;

use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    ast::Expr,
    env,
    error::{LomdaError, RunResult},
    eval::Interp,
    heap::{HeapData, HeapId, Lambda},
    value::Value,
};

/// The builtin functions exposed through the standard library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum BuiltinFn {
    // string
    Strcat,
    Substring,
    Strstr,
    // sort
    IsSorted,
    Mergesort,
    Quicksort,
    // random
    RandomSeed,
    RandomUniform,
    RandomNormal,
    // linalg
    Det,
    Gaussian,
    Trace,
    Transpose,
    // math
    Isnan,
    Isfinite,
    Isinfinite,
    // fs
    FsOpen,
    FsRead,
    FsWrite,
    FsClose,
    // sys
    SysExit,
}

/// Builds the named standard-library module, or `None` when the name is not
/// a builtin module (and should resolve to a `.lom` file instead).
pub(crate) fn load_stdlib(interp: &mut Interp, name: &str) -> RunResult<Option<Value>> {
    let value = match name {
        "string" => string_mod::load(interp),
        "sort" => sort_mod::load(interp),
        "random" => random_mod::load(interp),
        "linalg" => linalg_mod::load(interp),
        "math" => math_mod::load(interp),
        "fs" => fs_mod::load(interp),
        "sys" => sys_mod::load(interp),
        _ => return Ok(None),
    };
    Ok(Some(value))
}

/// Allocates a builtin lambda with the given parameter names.
pub(super) fn make_fn(interp: &mut Interp, params: &[&str], builtin: BuiltinFn) -> Value {
    Value::Ref(interp.heap.allocate(HeapData::Lambda(Lambda {
        params: params.iter().map(|&p| p.to_owned()).collect(),
        body: Expr::Builtin(builtin),
        env: None,
    })))
}

/// Builds a module dictionary from named bindings.
pub(super) fn make_module(interp: &mut Interp, entries: Vec<(&str, Value)>) -> Value {
    let map = entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect();
    Value::Ref(interp.heap.allocate(HeapData::Dict(map)))
}

/// Reads a named argument out of the builtin's call frame.
pub(super) fn arg(interp: &mut Interp, env: HeapId, name: &str) -> RunResult<Value> {
    let v = env::lookup(&interp.heap, env, name)
        .map(Value::borrow_copy)
        .unwrap_or_else(|| panic!("builtin frame binds '{name}'"));
    let v = v.clone_with_heap(&interp.heap);
    interp.force(v)
}

/// Reads a named argument and requires it to be a string.
pub(super) fn str_arg(interp: &mut Interp, env: HeapId, name: &str, what: &str) -> RunResult<String> {
    let v = arg(interp, env, name)?;
    let s = v.as_str(&interp.heap).map(str::to_owned);
    let result = s.ok_or_else(|| {
        LomdaError::type_err(format!(
            "{what} expects a string, not {}",
            v.display(&interp.heap)
        ))
    });
    v.drop_with_heap(&mut interp.heap);
    result
}

/// Reads a named argument and requires it to be a number.
pub(super) fn num_arg(interp: &mut Interp, env: HeapId, name: &str, what: &str) -> RunResult<f64> {
    let v = arg(interp, env, name)?;
    let result = v.as_f64().ok_or_else(|| {
        LomdaError::type_err(format!(
            "{what} expects a number, not {}",
            v.display(&interp.heap)
        ))
    });
    v.drop_with_heap(&mut interp.heap);
    result
}

/// Dispatches a builtin call against its call frame.
pub(crate) fn call_builtin(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::Strcat | BuiltinFn::Substring | BuiltinFn::Strstr => string_mod::call(interp, builtin, env),
        BuiltinFn::IsSorted | BuiltinFn::Mergesort | BuiltinFn::Quicksort => sort_mod::call(interp, builtin, env),
        BuiltinFn::RandomSeed | BuiltinFn::RandomUniform | BuiltinFn::RandomNormal => {
            random_mod::call(interp, builtin, env)
        }
        BuiltinFn::Det | BuiltinFn::Gaussian | BuiltinFn::Trace | BuiltinFn::Transpose => {
            linalg_mod::call(interp, builtin, env)
        }
        BuiltinFn::Isnan | BuiltinFn::Isfinite | BuiltinFn::Isinfinite => math_mod::call(interp, builtin, env),
        BuiltinFn::FsOpen | BuiltinFn::FsRead | BuiltinFn::FsWrite | BuiltinFn::FsClose => {
            fs_mod::call(interp, builtin, env)
        }
        BuiltinFn::SysExit => sys_mod::call(interp, builtin, env),
    }
}
