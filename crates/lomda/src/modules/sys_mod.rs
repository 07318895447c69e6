//! The `sys` standard-library module.

use super::{arg, make_fn, make_module, BuiltinFn};
use crate::{
    error::{LomdaError, RunResult},
    eval::Interp,
    heap::HeapId,
    value::Value,
};

pub(super) fn load(interp: &mut Interp) -> Value {
    let exit = make_fn(interp, &["code"], BuiltinFn::SysExit);
    make_module(interp, vec![("exit", exit)])
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::SysExit => {
            let v = arg(interp, env, "code")?;
            let code = v.as_int().ok_or_else(|| {
                LomdaError::type_err(format!("exit expects an integer, not {}", v.display(&interp.heap)))
            });
            v.drop_with_heap(&mut interp.heap);
            std::process::exit(code? as i32);
        }
        _ => unreachable!("dispatched to the sys module"),
    }
}
