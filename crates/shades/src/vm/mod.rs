//! Virtual Machine - Continuation-Passing Byte Code Execution
//!
//! The VM is a register machine driven by `bcode` cells: an accumulator
//! whose word type is fixed per bcode, a typed stack inside the current
//! continuation frame, and a program counter that only ever moves
//! forward within a sequence (so every sequence terminates and its
//! allocation bound is a finite sum).
//!
//! Every call allocates a continuation, tail calls replace the frame,
//! and the scheduler multiplexes cooperative threads over per-priority
//! FIFO queues. Between sequences the machine sits at a GC-safe point:
//! that is where group commits run, where threads yield, and where
//! flush-and-retry restarts a sequence whose true allocation demand
//! exceeded the current batch.

pub mod cache;
pub mod insn;
pub mod interp;
pub mod loader;
pub mod net;

use crate::heap::Heap;
use crate::word::{Ptr, Word};

pub use insn::{
    Insn, CONS_MAX_ALLOCATION, CONTEXT_MAX_ALLOCATION, CSW_MAX_ALLOCATION,
    MAX_NUMBER_OF_WORDS_IN_CONT,
};
pub use interp::interp;
pub use loader::load_bcode;
pub use net::{NetDriver, NetOutcome, Wakeup};

/// Process-local machine state: the network driver, the bcode/global
/// caches, and the loader's unresolved-call bookkeeping. Everything
/// persistent lives in the heap.
pub struct Vm {
    pub net: NetDriver,
    pub(crate) caches: cache::Caches,
    /// Bcode ids whose call instructions are not fully resolved yet;
    /// resolution is retried after every load and every commit.
    pub pending_bcodes: Vec<Word>,
    /// Announce assigned bcode ids on load (`--show-bcode-ids`).
    pub show_bcode_ids: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        Vm {
            net: NetDriver::new(),
            caches: cache::Caches::new(),
            pending_bcodes: Vec::new(),
            show_bcode_ids: false,
        }
    }

    /// Cell addresses moved: flush both caches and re-run the loader's
    /// pointer-resolution pass. Must follow every commit and recovery.
    pub fn after_commit(&mut self, heap: &mut Heap) {
        self.caches.flush();
        loader::resolve_pending(heap, self);
    }
}

// === Cell field accessors shared by the interpreter and loader ===

#[inline]
pub(crate) fn cont_bcode(heap: &Heap, cont: Ptr) -> Ptr {
    Ptr::from_word(heap.word_at(cont, 1))
}

#[inline]
pub(crate) fn cont_next(heap: &Heap, cont: Ptr) -> Word {
    heap.word_at(cont, 2)
}

#[inline]
pub(crate) fn cont_size_words(heap: &Heap, cont: Ptr) -> usize {
    ((heap.word(cont) >> 12) & 0xFFF) as usize
}

#[inline]
pub(crate) fn cont_bound_args(heap: &Heap, cont: Ptr) -> usize {
    (heap.word(cont) & 0xFFF) as usize
}

#[inline]
pub(crate) fn bcode_accu_type(heap: &Heap, b: Ptr) -> Word {
    heap.word_at(b, 1)
}

#[inline]
pub(crate) fn bcode_stack_depth(heap: &Heap, b: Ptr) -> usize {
    heap.word_at(b, 2) as usize
}

#[inline]
pub(crate) fn bcode_code_len(heap: &Heap, b: Ptr) -> usize {
    heap.word_at(b, 3) as usize
}

#[inline]
pub(crate) fn bcode_is_reusable(heap: &Heap, b: Ptr) -> bool {
    heap.word_at(b, 4) != 0
}

#[inline]
pub(crate) fn bcode_max_alloc(heap: &Heap, b: Ptr) -> usize {
    heap.word_at(b, 5) as usize
}

#[inline]
pub(crate) fn bcode_cont_words(heap: &Heap, b: Ptr) -> usize {
    heap.word_at(b, 6) as usize
}

#[inline]
pub(crate) fn bcode_id(heap: &Heap, b: Ptr) -> Word {
    heap.word(b) & 0x00FF_FFFF
}
