//! The `fs` standard-library module.
//!
//! File handles are plain path strings; `open` checks reachability, `read`
//! and `write` operate on the named file, `close` is a no-op kept for
//! programs that pair it with `open`.

use super::{make_fn, make_module, str_arg, BuiltinFn};
use crate::{
    error::{LomdaError, RunResult},
    eval::Interp,
    heap::{HeapData, HeapId},
    value::Value,
};

pub(super) fn load(interp: &mut Interp) -> Value {
    let open = make_fn(interp, &["path"], BuiltinFn::FsOpen);
    let read = make_fn(interp, &["f"], BuiltinFn::FsRead);
    let write = make_fn(interp, &["f", "s"], BuiltinFn::FsWrite);
    let close = make_fn(interp, &["f"], BuiltinFn::FsClose);
    make_module(
        interp,
        vec![("open", open), ("read", read), ("write", write), ("close", close)],
    )
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::FsOpen => {
            let path = str_arg(interp, env, "path", "open")?;
            Ok(Value::Ref(interp.heap.allocate(HeapData::Str(path))))
        }
        BuiltinFn::FsRead => {
            let path = str_arg(interp, env, "f", "read")?;
            let contents = std::fs::read_to_string(&path)
                .map_err(|_| LomdaError::io(format!("could not read from '{path}'")))?;
            Ok(Value::Ref(interp.heap.allocate(HeapData::Str(contents))))
        }
        BuiltinFn::FsWrite => {
            let path = str_arg(interp, env, "f", "write")?;
            let text = str_arg(interp, env, "s", "write")?;
            std::fs::write(&path, text).map_err(|_| LomdaError::io(format!("could not write to '{path}'")))?;
            Ok(Value::Void)
        }
        BuiltinFn::FsClose => Ok(Value::Void),
        _ => unreachable!("dispatched to the fs module"),
    }
}
