use std::cell::Cell;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{ast::Expr, value::Value};

/// Index of a value stored in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(usize);

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A closure: parameter names, a body expression, and the captured environment.
///
/// Builtin lambdas (standard-library bindings) have no captured environment;
/// they read their arguments straight out of the call frame.
#[derive(Debug)]
pub(crate) struct Lambda {
    pub params: Vec<String>,
    pub body: Expr,
    pub env: Option<HeapId>,
}

/// A suspended computation that evaluates on demand exactly once.
#[derive(Debug)]
pub(crate) struct Thunk {
    pub body: Expr,
    pub env: HeapId,
    pub cached: Option<Value>,
}

/// An algebraic-data-type instance: a constructor kind plus its field values.
#[derive(Debug)]
pub(crate) struct AdtInstance {
    pub type_name: String,
    pub kind: String,
    pub fields: Vec<Value>,
}

/// One environment frame: a small name-to-value store and a parent link.
///
/// Frames live in the heap so closures can hold on to them past the frame
/// that created them. The parent link is a counted reference.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    pub store: SmallVec<[(String, Value); 4]>,
    pub parent: Option<HeapId>,
}

/// Heap-allocated runtime data. Small immediate values (integers, reals,
/// booleans, void) live inline in [`Value`] and never reach the heap.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(String),
    List(Vec<Value>),
    Dict(IndexMap<String, Value>),
    Tuple(Value, Value),
    Lambda(Lambda),
    Thunk(Thunk),
    Adt(AdtInstance),
    Frame(Frame),
}

impl HeapData {
    /// Static name of the variant, for diagnostics and heap statistics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::List(_) => "list",
            Self::Dict(_) => "dictionary",
            Self::Tuple(..) => "tuple",
            Self::Lambda(_) => "lambda",
            Self::Thunk(_) => "thunk",
            Self::Adt(_) => "data value",
            Self::Frame(_) => "environment",
        }
    }

    /// Collects the heap ids this value holds references to.
    pub(crate) fn child_ids(&self, out: &mut Vec<HeapId>) {
        let mut push_value = |v: &Value, out: &mut Vec<HeapId>| {
            if let Value::Ref(id) = v {
                out.push(*id);
            }
        };
        match self {
            Self::Str(_) => {}
            Self::List(items) => {
                for v in items {
                    push_value(v, out);
                }
            }
            Self::Dict(entries) => {
                for v in entries.values() {
                    push_value(v, out);
                }
            }
            Self::Tuple(l, r) => {
                push_value(l, out);
                push_value(r, out);
            }
            Self::Lambda(lambda) => {
                if let Some(env) = lambda.env {
                    out.push(env);
                }
            }
            Self::Thunk(thunk) => {
                out.push(thunk.env);
                if let Some(v) = &thunk.cached {
                    push_value(v, out);
                }
            }
            Self::Adt(adt) => {
                for v in &adt.fields {
                    push_value(v, out);
                }
            }
            Self::Frame(frame) => {
                for (_, v) in &frame.store {
                    push_value(v, out);
                }
                if let Some(parent) = frame.parent {
                    out.push(parent);
                }
            }
        }
    }
}

#[derive(Debug)]
struct HeapEntry {
    refcount: Cell<usize>,
    data: HeapData,
}

/// Snapshot of heap occupancy, used by tests to check refcount discipline.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects on the heap.
    pub live_objects: usize,
    /// Number of freed slots available for reuse.
    pub free_slots: usize,
    /// Total slot count (live + free).
    pub total_slots: usize,
}

/// The reference-counted value arena.
///
/// Every construction yields a value with refcount 1, owned by the creator.
/// Storing a value anywhere that outlives the current frame adds a reference;
/// overwriting or releasing a slot removes one; reaching zero destroys the
/// value and transitively releases the references it held.
///
/// Recursive `let` creates closure→environment→closure cycles that refcounting
/// alone cannot reclaim. The arena is released en masse when the top-level
/// evaluation ends, which bounds the lifetime of such cycles.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` in the arena, returning an id with refcount 1.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        let entry = HeapEntry {
            refcount: Cell::new(1),
            data,
        };
        if let Some(index) = self.free_list.pop() {
            self.entries[index] = Some(entry);
            HeapId(index)
        } else {
            self.entries.push(Some(entry));
            HeapId(self.entries.len() - 1)
        }
    }

    /// Adds a reference to a live heap entry.
    ///
    /// # Panics
    /// Panics if the id is invalid or the entry has already been freed.
    pub fn inc_ref(&self, id: HeapId) {
        let entry = self
            .entries
            .get(id.index())
            .expect("Heap::inc_ref: slot missing")
            .as_ref()
            .expect("Heap::inc_ref: object already freed");
        entry.refcount.set(entry.refcount.get() + 1);
    }

    /// Removes a reference; frees the entry (and transitively its children)
    /// when the count reaches zero.
    ///
    /// # Panics
    /// Panics if the id is invalid or the entry has already been freed.
    pub fn dec_ref(&mut self, id: HeapId) {
        let data = {
            let slot = self.entries.get_mut(id.index()).expect("Heap::dec_ref: slot missing");
            let entry = slot.as_mut().expect("Heap::dec_ref: object already freed");
            let count = entry.refcount.get();
            if count > 1 {
                entry.refcount.set(count - 1);
                return;
            }
            slot.take().expect("Heap::dec_ref: object already freed").data
        };

        self.free_list.push(id.index());

        let mut child_ids = Vec::new();
        data.child_ids(&mut child_ids);
        drop(data);
        for child in child_ids {
            self.dec_ref(child);
        }
    }

    /// Current reference count of a live entry; used by refcount tests.
    #[cfg(test)]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entries[id.index()]
            .as_ref()
            .expect("Heap::refcount: object already freed")
            .refcount
            .get()
    }

    /// Returns an immutable reference to the data stored at the given id.
    ///
    /// # Panics
    /// Panics if the id is invalid or the entry has already been freed.
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns a mutable reference to the data stored at the given id.
    ///
    /// # Panics
    /// Panics if the id is invalid or the entry has already been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Swaps the data stored at `id`, returning the old data.
    ///
    /// The refcount of the slot is unchanged; children of the old data are
    /// not released here (the caller decides, since in-place container
    /// assignment reuses the old cells).
    pub fn replace(&mut self, id: HeapId, data: HeapData) -> HeapData {
        std::mem::replace(self.get_mut(id), data)
    }

    #[cfg(test)]
    pub fn stats(&self) -> HeapStats {
        let live = self.entries.iter().filter(|e| e.is_some()).count();
        HeapStats {
            live_objects: live,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let mut heap = Heap::new();
        let id = heap.allocate(HeapData::Str("hello".to_owned()));
        assert_eq!(heap.stats().live_objects, 1);
        heap.inc_ref(id);
        heap.dec_ref(id);
        assert_eq!(heap.stats().live_objects, 1);
        heap.dec_ref(id);
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.stats().free_slots, 1);
    }

    #[test]
    fn release_cascades_to_children() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::Str("x".to_owned()));
        let list = heap.allocate(HeapData::List(vec![Value::Ref(inner), Value::Int(1)]));
        // The list owns the only reference to the string.
        heap.dec_ref(list);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Str("a".to_owned()));
        heap.dec_ref(a);
        let b = heap.allocate(HeapData::Str("b".to_owned()));
        assert_eq!(a.index(), b.index());
        assert_eq!(heap.stats().total_slots, 1);
    }
}
