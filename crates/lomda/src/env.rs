//! Environment frames: name-to-value chains living in the heap.
//!
//! Frames are singly linked. `lookup` walks outward, `set` updates the
//! nearest frame containing the name, `extend` pushes a new frame, and
//! `clone_chain` structurally copies the whole chain (adding a reference per
//! stored value). Cloning on lambda capture is what freezes the bindings
//! visible at definition time.

use smallvec::smallvec;

use crate::{
    heap::{Frame, Heap, HeapData, HeapId},
    value::Value,
};

/// Allocates an empty root environment.
pub(crate) fn empty(heap: &mut Heap) -> HeapId {
    heap.allocate(HeapData::Frame(Frame::default()))
}

fn frame(heap: &Heap, id: HeapId) -> &Frame {
    match heap.get(id) {
        HeapData::Frame(f) => f,
        other => panic!("environment id points at {}", other.kind_name()),
    }
}

fn frame_mut(heap: &mut Heap, id: HeapId) -> &mut Frame {
    match heap.get_mut(id) {
        HeapData::Frame(f) => f,
        other => panic!("environment id points at {}", other.kind_name()),
    }
}

/// Nearest-frame-outward search. Returns a borrowed value without adding a
/// reference; callers that keep the value past the environment's lifetime
/// must add one explicitly.
pub(crate) fn lookup<'h>(heap: &'h Heap, env: HeapId, name: &str) -> Option<&'h Value> {
    let mut cur = Some(env);
    while let Some(id) = cur {
        let f = frame(heap, id);
        if let Some((_, v)) = f.store.iter().find(|(n, _)| n == name) {
            return Some(v);
        }
        cur = f.parent;
    }
    None
}

/// Pushes a new frame binding `name` to `value` (taking ownership of the
/// value's reference). The new frame holds a counted reference to its parent.
pub(crate) fn extend(heap: &mut Heap, env: HeapId, name: impl Into<String>, value: Value) -> HeapId {
    heap.inc_ref(env);
    heap.allocate(HeapData::Frame(Frame {
        store: smallvec![(name.into(), value)],
        parent: Some(env),
    }))
}

/// In-place mutation of the nearest frame containing `name`.
///
/// Takes ownership of `value`'s reference on success. On failure the value is
/// handed back so the caller can release it and report the unknown name.
pub(crate) fn set(heap: &mut Heap, env: HeapId, name: &str, value: Value) -> Result<(), Value> {
    let mut cur = Some(env);
    let target = loop {
        let Some(id) = cur else { return Err(value) };
        let f = frame(heap, id);
        if f.store.iter().any(|(n, _)| n == name) {
            break id;
        }
        cur = f.parent;
    };
    let f = frame_mut(heap, target);
    let slot = f
        .store
        .iter_mut()
        .find(|(n, _)| n == name)
        .expect("slot vanished between walk and update");
    let old = std::mem::replace(&mut slot.1, value);
    old.drop_with_heap(heap);
    Ok(())
}

/// Structural copy of the frame chain: new frames, shared (ref-incremented)
/// values, recursively cloned parents.
pub(crate) fn clone_chain(heap: &mut Heap, env: HeapId) -> HeapId {
    let (store, parent) = {
        let f = frame(heap, env);
        let pairs: Vec<(String, Value)> = f
            .store
            .iter()
            .map(|(n, v)| (n.clone(), v.clone_with_heap(heap)))
            .collect();
        (pairs, f.parent)
    };
    let cloned_parent = parent.map(|p| clone_chain(heap, p));
    heap.allocate(HeapData::Frame(Frame {
        store: store.into_iter().collect(),
        parent: cloned_parent,
    }))
}

/// The frame ids of the chain, innermost first.
pub(crate) fn chain(heap: &Heap, env: HeapId) -> Vec<HeapId> {
    let mut ids = Vec::new();
    let mut cur = Some(env);
    while let Some(id) = cur {
        ids.push(id);
        cur = frame(heap, id).parent;
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_outward() {
        let mut heap = Heap::new();
        let root = empty(&mut heap);
        let outer = extend(&mut heap, root, "x", Value::Int(1));
        let inner = extend(&mut heap, outer, "y", Value::Int(2));
        assert_eq!(lookup(&heap, inner, "x"), Some(&Value::Int(1)));
        assert_eq!(lookup(&heap, inner, "y"), Some(&Value::Int(2)));
        assert_eq!(lookup(&heap, inner, "z"), None);
    }

    #[test]
    fn shadowing_finds_nearest_frame() {
        let mut heap = Heap::new();
        let root = empty(&mut heap);
        let outer = extend(&mut heap, root, "x", Value::Int(1));
        let inner = extend(&mut heap, outer, "x", Value::Int(2));
        assert_eq!(lookup(&heap, inner, "x"), Some(&Value::Int(2)));
        assert_eq!(lookup(&heap, outer, "x"), Some(&Value::Int(1)));
    }

    #[test]
    fn set_updates_nearest_frame_only() {
        let mut heap = Heap::new();
        let root = empty(&mut heap);
        let outer = extend(&mut heap, root, "x", Value::Int(1));
        let inner = extend(&mut heap, outer, "y", Value::Int(2));
        assert!(set(&mut heap, inner, "x", Value::Int(9)).is_ok());
        assert_eq!(lookup(&heap, inner, "x"), Some(&Value::Int(9)));
        assert!(set(&mut heap, inner, "missing", Value::Int(0)).is_err());
    }

    #[test]
    fn clone_freezes_bindings() {
        let mut heap = Heap::new();
        let root = empty(&mut heap);
        let env = extend(&mut heap, root, "x", Value::Int(1));
        let snapshot = clone_chain(&mut heap, env);
        assert!(set(&mut heap, env, "x", Value::Int(2)).is_ok());
        assert_eq!(lookup(&heap, snapshot, "x"), Some(&Value::Int(1)));
        assert_eq!(lookup(&heap, env, "x"), Some(&Value::Int(2)));
    }
}
