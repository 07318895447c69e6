//! The `math` standard-library module: floating-point classification.

use super::{arg, make_fn, make_module, BuiltinFn};
use crate::{error::RunResult, eval::Interp, heap::HeapId, value::Value};

pub(super) fn load(interp: &mut Interp) -> Value {
    let isnan = make_fn(interp, &["x"], BuiltinFn::Isnan);
    let isfinite = make_fn(interp, &["x"], BuiltinFn::Isfinite);
    let isinfinite = make_fn(interp, &["x"], BuiltinFn::Isinfinite);
    make_module(
        interp,
        vec![
            ("isnan", isnan),
            ("isfinite", isfinite),
            ("isinfinite", isinfinite),
        ],
    )
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    let v = arg(interp, env, "x")?;
    // Non-real inputs classify as false, they do not error.
    let result = match (builtin, &v) {
        (BuiltinFn::Isnan, Value::Real(r)) => r.is_nan(),
        (BuiltinFn::Isfinite, Value::Real(r)) => r.is_finite(),
        (BuiltinFn::Isfinite, Value::Int(_)) => true,
        (BuiltinFn::Isinfinite, Value::Real(r)) => r.is_infinite(),
        _ => false,
    };
    v.drop_with_heap(&mut interp.heap);
    Ok(Value::Bool(result))
}
