//! Term representation (C1) — the tagged word a running process computes
//! with, as distinct from `bytecode::Value`, the constant-pool literal it is
//! materialized from at load time (see `bytecode::loader`).
//!
//! A `Term` is a `#[repr(transparent)] u64`. The low 2 bits are a primary
//! tag; the remaining 62 bits are either an inline payload (fixnums,
//! immediates) or an index into the owning process's heap — we use an index
//! into a `Vec<HeapObject>` rather than a raw pointer, which keeps the
//! generational copying GC (`runtime::memory`) entirely in safe Rust: a
//! collection copies live `HeapObject`s into a fresh `Vec` and rewrites every
//! `Term` that pointed at the old index via a forwarding table.

use std::fmt;
use std::sync::Arc;

use crate::types::{MonitorRef, Pid, PortableTerm};

const TAG_MASK: u64 = 0b11;
const TAG_FIXNUM: u64 = 0b00;
const TAG_ATOM: u64 = 0b01;
const TAG_BOXED: u64 = 0b10;
const TAG_IMMEDIATE: u64 = 0b11;

const IMM_NIL: u64 = 0;
const IMM_TRUE: u64 = 1;
const IMM_FALSE: u64 = 2;

/// Smallest integer representable inline (62-bit signed).
pub const FIXNUM_MIN: i64 = -(1i64 << 61);
pub const FIXNUM_MAX: i64 = (1i64 << 61) - 1;

/// A tagged heap word. Copy because it is either an immediate value or a
/// reference into a heap the caller already holds a borrow path to.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Term(u64);

impl Term {
    fn from_tagged(tag: u64, payload: u64) -> Self {
        Term((payload << 2) | tag)
    }

    fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    fn payload(self) -> u64 {
        self.0 >> 2
    }

    /// The empty list / `nil`.
    pub const fn nil() -> Self {
        Term(IMM_NIL << 2 | TAG_IMMEDIATE)
    }

    pub const fn bool(b: bool) -> Self {
        if b {
            Term(IMM_TRUE << 2 | TAG_IMMEDIATE)
        } else {
            Term(IMM_FALSE << 2 | TAG_IMMEDIATE)
        }
    }

    pub fn is_nil(self) -> bool {
        self.tag() == TAG_IMMEDIATE && self.payload() == IMM_NIL
    }

    pub fn small_int(v: i64) -> Option<Self> {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&v) {
            Some(Term::from_tagged(TAG_FIXNUM, (v as u64) & ((1 << 62) - 1) | if v < 0 { sign_fill() } else { 0 }))
        } else {
            None
        }
    }

    pub fn as_small_int(self) -> Option<i64> {
        if self.tag() != TAG_FIXNUM {
            return None;
        }
        // Sign-extend the 62-bit payload back to i64.
        let shifted = (self.0 as i64) >> 2;
        Some(shifted)
    }

    pub fn atom(id: u32) -> Self {
        Term::from_tagged(TAG_ATOM, id as u64)
    }

    pub fn as_atom_id(self) -> Option<u32> {
        (self.tag() == TAG_ATOM).then(|| self.payload() as u32)
    }

    pub fn is_truthy(self) -> bool {
        !(self.tag() == TAG_IMMEDIATE && self.payload() == IMM_FALSE) && !self.is_nil()
    }

    /// Construct a boxed reference to heap object `index`. Public so the GC
    /// (`runtime::memory`) can rebuild forwarded pointers after a copy.
    pub fn boxed(index: usize) -> Self {
        Term::from_tagged(TAG_BOXED, index as u64)
    }

    pub fn as_box_index(self) -> Option<usize> {
        (self.tag() == TAG_BOXED).then(|| self.payload() as usize)
    }

    pub fn is_boxed(self) -> bool {
        self.tag() == TAG_BOXED
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// `payload << 2` drops high bits on shift-back; this mask restores them for
/// negative fixnums so `as i64 >> 2` sign-extends correctly.
fn sign_fill() -> u64 {
    !((1u64 << 62) - 1)
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(i) = self.as_small_int() {
            write!(f, "Term::Int({i})")
        } else if self.is_nil() {
            write!(f, "Term::Nil")
        } else if let Some(id) = self.as_atom_id() {
            write!(f, "Term::Atom({id})")
        } else if let Some(idx) = self.as_box_index() {
            write!(f, "Term::Boxed({idx})")
        } else {
            write!(f, "Term({:#x})", self.0)
        }
    }
}

/// The boxed kinds a `Term` can point at. Mirrors BEAM's tagged heap objects
/// (tuple, cons cell, bignum, float, binaries in their three flavors, map,
/// fun closure) plus an opaque reference used by NIF resource handles.
#[derive(Debug, Clone)]
pub enum HeapObject {
    Tuple(Vec<Term>),
    Cons(Term, Term),
    BigInt(i128),
    Float(f64),
    /// Binary stored inline on the process heap (copied on GC, like any
    /// other heap object).
    HeapBinary(Vec<u8>),
    /// Binary stored off-heap and reference counted; GC rewrites the index
    /// but never copies the bytes (spec §9: "literal areas and off-heap
    /// binaries are not copied; pointers are rewritten as-is").
    RefcBinary(Arc<Vec<u8>>),
    /// A view into another binary term, avoiding a copy for `binary:part/3`
    /// style slicing.
    SubBinary { base: Term, offset: usize, len: usize },
    /// Small maps are kept as an association list, matching BEAM's flat map
    /// representation used below the HAMT promotion threshold.
    Map(Vec<(Term, Term)>),
    Fun { module: String, function: String, arity: u8, captured: Vec<Term> },
    /// Opaque handle returned by a NIF (spec §4.10); carries no GC-visible
    /// substructure.
    ExternalRef(u64),
    /// A process identifier carried as a first-class value (e.g. pushed by
    /// `Bytecode::Self_`/`SpawnProcess`, or embedded in a message tuple).
    PidValue(Pid),
    /// A monitor reference, as returned by `Bytecode::Monitor`.
    RefValue(MonitorRef),
}

impl HeapObject {
    /// `Term`s directly reachable from this object — the GC's per-object
    /// scan step.
    pub fn child_terms(&self) -> Vec<Term> {
        match self {
            HeapObject::Tuple(items) => items.clone(),
            HeapObject::Cons(h, t) => vec![*h, *t],
            HeapObject::SubBinary { base, .. } => vec![*base],
            HeapObject::Map(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
            HeapObject::Fun { captured, .. } => captured.clone(),
            HeapObject::BigInt(_)
            | HeapObject::Float(_)
            | HeapObject::HeapBinary(_)
            | HeapObject::RefcBinary(_)
            | HeapObject::ExternalRef(_)
            | HeapObject::PidValue(_)
            | HeapObject::RefValue(_) => Vec::new(),
        }
    }

    /// Rewrite every child `Term` in place via `f` — the GC's per-object
    /// relocation step after copying an object into to-space.
    pub fn remap_children<F: FnMut(Term) -> Term>(&mut self, mut f: F) {
        match self {
            HeapObject::Tuple(items) => {
                for t in items.iter_mut() {
                    *t = f(*t);
                }
            }
            HeapObject::Cons(h, t) => {
                *h = f(*h);
                *t = f(*t);
            }
            HeapObject::SubBinary { base, .. } => {
                *base = f(*base);
            }
            HeapObject::Map(pairs) => {
                for (k, v) in pairs.iter_mut() {
                    *k = f(*k);
                    *v = f(*v);
                }
            }
            HeapObject::Fun { captured, .. } => {
                for t in captured.iter_mut() {
                    *t = f(*t);
                }
            }
            HeapObject::BigInt(_)
            | HeapObject::Float(_)
            | HeapObject::HeapBinary(_)
            | HeapObject::RefcBinary(_)
            | HeapObject::ExternalRef(_)
            | HeapObject::PidValue(_)
            | HeapObject::RefValue(_) => {}
        }
    }

    /// Rough size in bytes, used for GC threshold accounting. Off-heap
    /// binaries count only the handle, not the bytes they reference.
    pub fn approx_size(&self) -> usize {
        match self {
            HeapObject::Tuple(items) => 16 + items.len() * 8,
            HeapObject::Cons(_, _) => 16,
            HeapObject::BigInt(_) => 24,
            HeapObject::Float(_) => 16,
            HeapObject::HeapBinary(b) => 16 + b.len(),
            HeapObject::RefcBinary(_) => 16,
            HeapObject::SubBinary { .. } => 24,
            HeapObject::Map(pairs) => 16 + pairs.len() * 16,
            HeapObject::Fun { captured, .. } => 32 + captured.len() * 8,
            HeapObject::ExternalRef(_) => 16,
            HeapObject::PidValue(_) => 16,
            HeapObject::RefValue(_) => 16,
        }
    }
}

/// A process-local heap: a flat, append-only object table addressed by
/// `Term::boxed` indices. Owned by `runtime::process::Process`; collected by
/// `runtime::memory::GenerationalGc`.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Heap { objects: Vec::new() }
    }

    pub fn alloc(&mut self, obj: HeapObject) -> Term {
        let idx = self.objects.len();
        self.objects.push(obj);
        Term::boxed(idx)
    }

    pub fn get(&self, term: Term) -> Option<&HeapObject> {
        term.as_box_index().and_then(|i| self.objects.get(i))
    }

    pub fn get_mut(&mut self, term: Term) -> Option<&mut HeapObject> {
        term.as_box_index().and_then(move |i| self.objects.get_mut(i))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.objects.iter().map(HeapObject::approx_size).sum()
    }

    /// Replace the backing store, as done by a GC cycle after copying. The
    /// caller supplies already-rewritten `Term`s that index the new objects.
    pub fn replace(&mut self, objects: Vec<HeapObject>) {
        self.objects = objects;
    }

    /// Iterate `(old_index, object)` pairs — used by the GC to copy live
    /// objects into to-space while building a forwarding table.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &HeapObject)> {
        self.objects.iter().enumerate()
    }

    pub fn object_at(&self, index: usize) -> Option<&HeapObject> {
        self.objects.get(index)
    }
}

/// Detach a heap-relative `Term` into the external term format so it can
/// outlive the heap it was computed on (mailbox delivery, `term_to_binary`).
/// Fails on the handful of boxed kinds that are meaningless off their
/// originating heap (maps, funs, NIF resource refs, monitor refs) rather than
/// silently dropping them to `nil`.
pub fn term_to_portable(heap: &Heap, t: Term) -> Result<PortableTerm, String> {
    if let Some(i) = t.as_small_int() {
        return Ok(PortableTerm::Int(i));
    }
    if t.is_nil() {
        return Ok(PortableTerm::Nil);
    }
    if t == Term::bool(true) {
        return Ok(PortableTerm::Bool(true));
    }
    if t == Term::bool(false) {
        return Ok(PortableTerm::Bool(false));
    }
    if let Some(id) = t.as_atom_id() {
        return Ok(PortableTerm::Atom(id));
    }
    match heap.get(t) {
        Some(HeapObject::Tuple(items)) => {
            let items = items.iter().map(|i| term_to_portable(heap, *i)).collect::<Result<_, _>>()?;
            Ok(PortableTerm::Tuple(items))
        }
        Some(HeapObject::Cons(h, tl)) => {
            Ok(PortableTerm::Cons(Box::new(term_to_portable(heap, *h)?), Box::new(term_to_portable(heap, *tl)?)))
        }
        Some(HeapObject::BigInt(i)) => Ok(PortableTerm::BigInt(*i)),
        Some(HeapObject::Float(f)) => Ok(PortableTerm::Float(*f)),
        Some(HeapObject::HeapBinary(b)) => Ok(PortableTerm::Binary(b.clone())),
        Some(HeapObject::RefcBinary(b)) => Ok(PortableTerm::Binary(b.as_ref().clone())),
        Some(HeapObject::SubBinary { base, offset, len }) => match term_to_portable(heap, *base)? {
            PortableTerm::Binary(b) => {
                Ok(PortableTerm::Binary(b.get(*offset..*offset + *len).map(|s| s.to_vec()).unwrap_or_default()))
            }
            _ => Err("sub-binary base is not a binary".to_string()),
        },
        Some(HeapObject::PidValue(pid)) => Ok(PortableTerm::Pid(*pid)),
        Some(HeapObject::Map(_)) => Err("maps cannot cross a term boundary".to_string()),
        Some(HeapObject::Fun { .. }) => Err("funs cannot cross a term boundary".to_string()),
        Some(HeapObject::ExternalRef(_)) => Err("NIF resource references cannot cross a term boundary".to_string()),
        Some(HeapObject::RefValue(_)) => Err("monitor references cannot cross a term boundary".to_string()),
        None => Err("dangling term".to_string()),
    }
}

/// Rebuild a detached term into a (possibly different process's) heap —
/// the inverse of `term_to_portable`.
pub fn portable_to_term(heap: &mut Heap, p: &PortableTerm) -> Term {
    match p {
        PortableTerm::Int(i) => Term::small_int(*i).unwrap(),
        PortableTerm::Nil => Term::nil(),
        PortableTerm::Bool(b) => Term::bool(*b),
        PortableTerm::Atom(id) => Term::atom(*id),
        PortableTerm::BigInt(i) => heap.alloc(HeapObject::BigInt(*i)),
        PortableTerm::Float(f) => heap.alloc(HeapObject::Float(*f)),
        PortableTerm::Binary(b) => heap.alloc(HeapObject::HeapBinary(b.clone())),
        PortableTerm::Pid(pid) => heap.alloc(HeapObject::PidValue(*pid)),
        PortableTerm::Tuple(items) => {
            let items = items.iter().map(|i| portable_to_term(heap, i)).collect();
            heap.alloc(HeapObject::Tuple(items))
        }
        PortableTerm::Cons(h, t) => {
            let h = portable_to_term(heap, h);
            let t = portable_to_term(heap, t);
            heap.alloc(HeapObject::Cons(h, t))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_roundtrip() {
        for v in [0i64, 1, -1, 12345, -98765, FIXNUM_MAX, FIXNUM_MIN] {
            let t = Term::small_int(v).unwrap();
            assert_eq!(t.as_small_int(), Some(v));
        }
    }

    #[test]
    fn out_of_range_fixnum_rejected() {
        assert!(Term::small_int(FIXNUM_MAX + 1).is_none());
        assert!(Term::small_int(FIXNUM_MIN - 1).is_none());
    }

    #[test]
    fn nil_and_bools_are_distinct_immediates() {
        assert!(Term::nil().is_nil());
        assert!(!Term::bool(true).is_nil());
        assert!(Term::bool(true).is_truthy());
        assert!(!Term::bool(false).is_truthy());
        assert!(!Term::nil().is_truthy());
    }

    #[test]
    fn heap_alloc_and_lookup() {
        let mut heap = Heap::new();
        let t = heap.alloc(HeapObject::Tuple(vec![Term::small_int(1).unwrap(), Term::nil()]));
        assert!(t.is_boxed());
        match heap.get(t).unwrap() {
            HeapObject::Tuple(items) => assert_eq!(items.len(), 2),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn child_terms_reachable_from_cons() {
        let mut heap = Heap::new();
        let head = Term::small_int(7).unwrap();
        let tail = Term::nil();
        let cons = heap.alloc(HeapObject::Cons(head, tail));
        let obj = heap.get(cons).unwrap();
        assert_eq!(obj.child_terms(), vec![head, tail]);
    }
}
