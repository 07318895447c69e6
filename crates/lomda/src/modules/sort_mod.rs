//! The `sort` standard-library module.

use super::{arg, make_fn, make_module, BuiltinFn};
use crate::{
    error::{LomdaError, RunResult},
    eval::Interp,
    heap::{HeapData, HeapId},
    ops,
    value::Value,
};

pub(super) fn load(interp: &mut Interp) -> Value {
    let is_sorted = make_fn(interp, &["xs"], BuiltinFn::IsSorted);
    let mergesort = make_fn(interp, &["xs"], BuiltinFn::Mergesort);
    let quicksort = make_fn(interp, &["xs"], BuiltinFn::Quicksort);
    make_module(
        interp,
        vec![
            ("is_sorted", is_sorted),
            ("mergesort", mergesort),
            ("quicksort", quicksort),
        ],
    )
}

/// Reads the `xs` argument as a numeric key list, keeping the original values.
fn keyed_list(interp: &mut Interp, env: HeapId, what: &str) -> RunResult<Vec<(f64, Value)>> {
    let xs = arg(interp, env, "xs")?;
    let Some(items) = ops::list_items(&interp.heap, &xs) else {
        let msg = format!("{what} expects a list, not {}", xs.display(&interp.heap));
        xs.drop_with_heap(&mut interp.heap);
        return Err(LomdaError::type_err(msg));
    };
    let mut keyed = Vec::with_capacity(items.len());
    for item in &items {
        let Some(key) = item.as_f64() else {
            let msg = format!("{what} expects a list of numbers, not {}", xs.display(&interp.heap));
            xs.drop_with_heap(&mut interp.heap);
            return Err(LomdaError::type_err(msg));
        };
        keyed.push((key, item.clone_with_heap(&interp.heap)));
    }
    xs.drop_with_heap(&mut interp.heap);
    Ok(keyed)
}

pub(super) fn call(interp: &mut Interp, builtin: BuiltinFn, env: HeapId) -> RunResult<Value> {
    match builtin {
        BuiltinFn::IsSorted => {
            let keyed = keyed_list(interp, env, "is_sorted")?;
            let sorted = keyed.windows(2).all(|w| w[0].0 <= w[1].0);
            for (_, v) in keyed {
                v.drop_with_heap(&mut interp.heap);
            }
            Ok(Value::Bool(sorted))
        }
        BuiltinFn::Mergesort => {
            let keyed = keyed_list(interp, env, "mergesort")?;
            let sorted = mergesort(keyed);
            let items = sorted.into_iter().map(|(_, v)| v).collect();
            Ok(Value::Ref(interp.heap.allocate(HeapData::List(items))))
        }
        BuiltinFn::Quicksort => {
            let mut keyed = keyed_list(interp, env, "quicksort")?;
            let len = keyed.len();
            if len > 1 {
                quicksort(&mut keyed, 0, len - 1);
            }
            let items = keyed.into_iter().map(|(_, v)| v).collect();
            Ok(Value::Ref(interp.heap.allocate(HeapData::List(items))))
        }
        _ => unreachable!("dispatched to the sort module"),
    }
}

fn mergesort(items: Vec<(f64, Value)>) -> Vec<(f64, Value)> {
    if items.len() <= 1 {
        return items;
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let mut left = mergesort(left).into_iter().peekable();
    let mut right = mergesort(right).into_iter().peekable();
    let mut merged = Vec::with_capacity(left.len() + right.len());
    loop {
        match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => {
                if l.0 <= r.0 {
                    merged.push(left.next().expect("peeked"));
                } else {
                    merged.push(right.next().expect("peeked"));
                }
            }
            (Some(_), None) => merged.push(left.next().expect("peeked")),
            (None, Some(_)) => merged.push(right.next().expect("peeked")),
            (None, None) => return merged,
        }
    }
}

fn quicksort(items: &mut [(f64, Value)], lo: usize, hi: usize) {
    if lo >= hi {
        return;
    }
    let pivot = items[hi].0;
    let mut store = lo;
    for i in lo..hi {
        if items[i].0 < pivot {
            items.swap(i, store);
            store += 1;
        }
    }
    items.swap(store, hi);
    if store > 0 {
        quicksort(items, lo, store - 1);
    }
    quicksort(items, store + 1, hi);
}
