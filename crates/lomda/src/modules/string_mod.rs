//! The `string` standard-library module.

use super::{make_fn, make_module, str_arg, BuiltinFn};
use crate::{
    error::{LomdaError, RunResult},
    eval::Interp,
    heap::{HeapData, HeapId},
    value::Value,
};

pub(super) fn load(interp: &mut Interp) -> Value {
    let strcat = make_fn(interp, &["a", "b"], BuiltinFn::Strcat);
    let substring = make_fn(interp, &["s", "i", "j"], BuiltinFn::Substring);
    let strstr = make_fn(interp, &["s", "t"], BuiltinFn::Strstr);
    make_module(
        interp,
        vec![("strcat", strcat), ("substring", substring), ("strstr", strstr)],
    )
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::Strcat => {
            let a = str_arg(interp, env, "a", "strcat")?;
            let b = str_arg(interp, env, "b", "strcat")?;
            Ok(Value::Ref(interp.heap.allocate(HeapData::Str(a + &b))))
        }
        BuiltinFn::Substring => {
            let s = str_arg(interp, env, "s", "substring")?;
            let i = index_arg(interp, env, "i")?;
            let j = index_arg(interp, env, "j")?;
            let chars: Vec<char> = s.chars().collect();
            if i > chars.len() || j > chars.len() || i > j {
                return Err(LomdaError::runtime(format!(
                    "substring {i}:{j} is out of bounds of string of length {}",
                    chars.len()
                )));
            }
            let out: String = chars[i..j].iter().collect();
            Ok(Value::Ref(interp.heap.allocate(HeapData::Str(out))))
        }
        BuiltinFn::Strstr => {
            let s = str_arg(interp, env, "s", "strstr")?;
            let t = str_arg(interp, env, "t", "strstr")?;
            let index = s.find(&t).map_or(-1, |byte_index| {
                s[..byte_index].chars().count() as i64
            });
            Ok(Value::Int(index))
        }
        _ => unreachable!("dispatched to the string module"),
    }
}

fn index_arg(interp: &mut Interp, env: HeapId, name: &str) -> RunResult<usize> {
    let v = super::arg(interp, env, name)?;
    let result = match v.as_int() {
        Some(i) if i >= 0 => Ok(i as usize),
        _ => Err(LomdaError::type_err(format!(
            "substring expects a non-negative integer, not {}",
            v.display(&interp.heap)
        ))),
    };
    v.drop_with_heap(&mut interp.heap);
    result
}
