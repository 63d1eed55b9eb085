//! Generational copying garbage collector (C7).
//!
//! Grounded on the teacher's `runtime/memory.rs` (`MemoryManager`,
//! `GarbageCollector`) for the allocate/collect/stats API shape; the
//! teacher's collector only promoted elapsed-time-aged bump regions and
//! never traced reachability, which the spec flags for redesign (§4.6/§9:
//! "a true generational copying collector"). This is a real tracing copying
//! collector: a cycle walks every `Term` reachable from the process's roots
//! (X-registers and operand stack — `runtime::term::Heap` objects hold no
//! other external references, since messages and the process dictionary are
//! plain Rust values, not heap `Term`s) and copies live objects into a fresh
//! heap, discarding everything unreached.
//!
//! Simplification, recorded here rather than hidden: BEAM keeps young and
//! old generations as physically separate heaps so a minor collection only
//! scans the young one. Doing that in safe Rust without unsafe pointer
//! tagging would mean encoding a generation bit into `Term` itself; instead
//! each heap object carries a survivor count in a side table parallel to the
//! heap, and "promotion" is bookkeeping (`GcStats::promoted`) rather than a
//! separate space — every collection is a full trace. Functionally this is
//! indistinguishable from a generational collector at the reachability/GC
//! level the testable properties in spec §8 describe; the difference is a
//! minor-GC's scan cost does not shrink below the heap size, which safepoint
//! scheduling (GC only runs between reductions, never inside one) absorbs.

use std::collections::{HashMap, VecDeque};

use crate::error::{GcError, GcResult};
use crate::runtime::term::{Heap, HeapObject, Term};

/// Survivor-count threshold after which an object is considered promoted to
/// the old generation (spec default: survive two minor cycles).
pub const DEFAULT_FULLSWEEP_AFTER: u8 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub minor_collections: u64,
    pub major_collections: u64,
    pub objects_reclaimed: u64,
    pub objects_promoted: u64,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

/// Per-process collector state. One instance lives alongside each
/// `runtime::process::Process`'s heap.
pub struct GenerationalGc {
    fullsweep_after: u8,
    /// Survivor counts, indexed like the heap they were last collected
    /// against; reset on full sweep, incremented on minor collections that
    /// preserve the object without promoting it.
    survivor_counts: Vec<u8>,
    stats: GcStats,
}

impl GenerationalGc {
    pub fn new() -> Self {
        Self::with_fullsweep_after(DEFAULT_FULLSWEEP_AFTER)
    }

    pub fn with_fullsweep_after(fullsweep_after: u8) -> Self {
        GenerationalGc { fullsweep_after, survivor_counts: Vec::new(), stats: GcStats::default() }
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Run a collection cycle: trace from `roots` (typically a process's
    /// registers plus operand stack), copy every reachable object into a
    /// fresh heap, and rewrite `roots` plus every copied object's pointers
    /// to match. Returns the new heap; the caller swaps it into the process.
    ///
    /// `major` requests a full sweep that also resets survivor counts (used
    /// for the `emit_crash_dump`/explicit `:erlang.garbage_collect()`-style
    /// forced collection); minor collections still trace everything (see
    /// module doc) but track survivorship for promotion stats.
    pub fn collect(&mut self, heap: &Heap, roots: &mut [&mut Term], major: bool) -> GcResult<Heap> {
        let bytes_before = heap.byte_size();

        let mut new_objects: Vec<HeapObject> = Vec::new();
        let mut new_survivors: Vec<u8> = Vec::new();
        let mut forwarding: HashMap<usize, usize> = HashMap::new();
        let mut worklist: VecDeque<usize> = VecDeque::new();

        let mut seed = |idx: usize,
                        forwarding: &mut HashMap<usize, usize>,
                        new_objects: &mut Vec<HeapObject>,
                        new_survivors: &mut Vec<u8>,
                        worklist: &mut VecDeque<usize>|
         -> GcResult<()> {
            if forwarding.contains_key(&idx) {
                return Ok(());
            }
            let obj = heap
                .object_at(idx)
                .ok_or_else(|| GcError::DanglingPointer(format!("root/child index {idx} not in heap")))?
                .clone();
            let prior_survivors = self.survivor_counts.get(idx).copied().unwrap_or(0);
            let survivors = if major { 0 } else { prior_survivors.saturating_add(1) };
            let new_idx = new_objects.len();
            new_objects.push(obj);
            new_survivors.push(survivors);
            forwarding.insert(idx, new_idx);
            worklist.push_back(idx);
            Ok(())
        };

        for root in roots.iter() {
            if let Some(idx) = root.as_box_index() {
                seed(idx, &mut forwarding, &mut new_objects, &mut new_survivors, &mut worklist)?;
            }
        }

        while let Some(old_idx) = worklist.pop_front() {
            let children = heap
                .object_at(old_idx)
                .ok_or_else(|| GcError::DanglingPointer(format!("worklist index {old_idx} not in heap")))?
                .child_terms();
            for child in children {
                if let Some(cidx) = child.as_box_index() {
                    seed(cidx, &mut forwarding, &mut new_objects, &mut new_survivors, &mut worklist)?;
                }
            }
        }

        for obj in new_objects.iter_mut() {
            obj.remap_children(|t| match t.as_box_index() {
                Some(idx) => forwarding.get(&idx).map(|&n| Term::boxed(n)).unwrap_or(t),
                None => t,
            });
        }

        for root in roots.iter_mut() {
            if let Some(idx) = root.as_box_index() {
                if let Some(&new_idx) = forwarding.get(&idx) {
                    **root = Term::boxed(new_idx);
                }
            }
        }

        let reclaimed = heap.len().saturating_sub(new_objects.len());
        let promoted = new_survivors.iter().filter(|&&s| s >= self.fullsweep_after).count();

        let mut new_heap = Heap::new();
        let bytes_after: usize = new_objects.iter().map(HeapObject::approx_size).sum();
        new_heap.replace(new_objects);

        self.survivor_counts = new_survivors;
        self.stats.objects_reclaimed += reclaimed as u64;
        self.stats.objects_promoted += promoted as u64;
        self.stats.bytes_before = bytes_before;
        self.stats.bytes_after = bytes_after;
        if major {
            self.stats.major_collections += 1;
        } else {
            self.stats.minor_collections += 1;
        }

        Ok(new_heap)
    }
}

impl Default for GenerationalGc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::term::HeapObject;

    #[test]
    fn unreachable_objects_are_reclaimed() {
        let mut heap = Heap::new();
        let reachable = heap.alloc(HeapObject::Float(1.0));
        let _garbage = heap.alloc(HeapObject::Float(2.0));
        assert_eq!(heap.len(), 2);

        let mut gc = GenerationalGc::new();
        let mut root = reachable;
        let new_heap = gc.collect(&heap, &mut [&mut root], false).unwrap();

        assert_eq!(new_heap.len(), 1);
        assert_eq!(gc.stats().objects_reclaimed, 1);
        assert!(new_heap.get(root).is_some());
    }

    #[test]
    fn reachable_chain_through_cons_is_preserved() {
        let mut heap = Heap::new();
        let inner = heap.alloc(HeapObject::Float(9.0));
        let outer = heap.alloc(HeapObject::Cons(inner, Term::nil()));

        let mut gc = GenerationalGc::new();
        let mut root = outer;
        let new_heap = gc.collect(&heap, &mut [&mut root], false).unwrap();

        assert_eq!(new_heap.len(), 2);
        match new_heap.get(root).unwrap() {
            HeapObject::Cons(h, _) => assert!(new_heap.get(*h).is_some()),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn survivors_promote_after_threshold() {
        let mut heap = Heap::new();
        let obj = heap.alloc(HeapObject::Float(1.0));
        let mut gc = GenerationalGc::with_fullsweep_after(2);
        let mut root = obj;

        let heap1 = gc.collect(&heap, &mut [&mut root], false).unwrap();
        assert_eq!(gc.stats().objects_promoted, 0);
        let _heap2 = gc.collect(&heap1, &mut [&mut root], false).unwrap();
        assert_eq!(gc.stats().objects_promoted, 1);
    }

    #[test]
    fn major_collection_resets_survivor_counts() {
        let mut heap = Heap::new();
        let obj = heap.alloc(HeapObject::Float(1.0));
        let mut gc = GenerationalGc::with_fullsweep_after(1);
        let mut root = obj;

        let heap1 = gc.collect(&heap, &mut [&mut root], true).unwrap();
        assert_eq!(gc.stats().major_collections, 1);
        assert_eq!(gc.stats().objects_promoted, 0);
        let _ = heap1;
    }
}
