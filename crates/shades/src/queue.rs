//! Queue Module - A Persistent Real-Time FIFO Queue
//!
//! The scheduler keeps one of these per priority, so queue operations
//! must have a worst-case allocation bound: a byte code sequence's
//! declared maximum allocation includes `QUEUE_MAX_ALLOCATION` and the
//! pre-flight `can_allocate` check has to stay sound.
//!
//! That rules out the classic two-list queue (its occasional full
//! reversal allocates proportionally to the queue length), so the
//! reversal is spread out: when the rear list outgrows the front list a
//! rotation starts, and every subsequent operation performs two
//! incremental steps of it. The rotation state lives in the `queue_rev`
//! cell; a queue between rotations is the plain five-word `queue` cell,
//! and the empty queue is the null pointer.
//!
//! Items are arbitrary words with pointer tagging (the scheduler stores
//! context cell pointers). Lists are ordinary `list` cells.

use crate::cell::CellType;
use crate::heap::Heap;
use crate::word::{Ptr, Word, NULL_PTR};

/// Worst-case words allocated by one queue operation: a header cell, one
/// item cons, and two rotation steps of up to two conses each.
pub const QUEUE_MAX_ALLOCATION: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Rotation {
    Idle,
    /// Reversing both lists: `sf` still to reverse into `sfp`, `sr` still
    /// to reverse into `srp`; `ok` counts the `sfp` items still live.
    Reversing,
    /// Moving the `ok` live items of `sfp` onto `srp`.
    Appending,
}

/// Decoded queue state, rebuilt into a fresh cell after every operation.
struct QState {
    lenf: Word,
    f: Word,
    lenr: Word,
    r: Word,
    rot: Rotation,
    ok: i32,
    sf: Word,
    sfp: Word,
    sr: Word,
    srp: Word,
}

fn cons(heap: &mut Heap, car: Word, cdr: Word) -> Word {
    let p = heap.allocate(3, CellType::List);
    heap.set_word_at(p, 1, car);
    heap.set_word_at(p, 2, cdr);
    p.to_word()
}

#[inline]
fn car(heap: &Heap, list: Word) -> Word {
    heap.word_at(Ptr::from_word(list), 1)
}

#[inline]
fn cdr(heap: &Heap, list: Word) -> Word {
    heap.word_at(Ptr::from_word(list), 2)
}

fn read_state(heap: &Heap, q: Ptr) -> QState {
    match heap.type_of(q) {
        CellType::Queue => QState {
            lenf: heap.word_at(q, 3),
            f: heap.word_at(q, 1),
            lenr: heap.word_at(q, 4),
            r: heap.word_at(q, 2),
            rot: Rotation::Idle,
            ok: 0,
            sf: 0,
            sfp: 0,
            sr: 0,
            srp: 0,
        },
        CellType::QueueRev => QState {
            lenf: heap.word_at(q, 3),
            f: heap.word_at(q, 1),
            lenr: heap.word_at(q, 4),
            r: heap.word_at(q, 2),
            rot: if heap.word_at(q, 10) == 0 {
                Rotation::Reversing
            } else {
                Rotation::Appending
            },
            ok: heap.word_at(q, 9) as i32,
            sf: heap.word_at(q, 5),
            sfp: heap.word_at(q, 6),
            sr: heap.word_at(q, 7),
            srp: heap.word_at(q, 8),
        },
        other => panic!("not a queue cell: {}", other.name()),
    }
}

fn write_state(heap: &mut Heap, st: &QState) -> Ptr {
    match st.rot {
        Rotation::Idle => {
            let q = heap.allocate(5, CellType::Queue);
            heap.set_word_at(q, 1, st.f);
            heap.set_word_at(q, 2, st.r);
            heap.set_word_at(q, 3, st.lenf);
            heap.set_word_at(q, 4, st.lenr);
            q
        }
        rot => {
            let q = heap.allocate(11, CellType::QueueRev);
            heap.set_word_at(q, 1, st.f);
            heap.set_word_at(q, 2, st.r);
            heap.set_word_at(q, 3, st.lenf);
            heap.set_word_at(q, 4, st.lenr);
            heap.set_word_at(q, 5, st.sf);
            heap.set_word_at(q, 6, st.sfp);
            heap.set_word_at(q, 7, st.sr);
            heap.set_word_at(q, 8, st.srp);
            heap.set_word_at(q, 9, st.ok as Word);
            heap.set_word_at(q, 10, if rot == Rotation::Reversing { 0 } else { 1 });
            q
        }
    }
}

/// One incremental rotation step.
fn exec(heap: &mut Heap, st: &mut QState) {
    match st.rot {
        Rotation::Idle => {}
        Rotation::Reversing => {
            if st.sf != 0 {
                // Move one item from each source list to its reversal.
                let x = car(heap, st.sf);
                st.sfp = cons(heap, x, st.sfp);
                st.sf = cdr(heap, st.sf);
                let y = car(heap, st.sr);
                st.srp = cons(heap, y, st.srp);
                st.sr = cdr(heap, st.sr);
                st.ok += 1;
            } else {
                debug_assert!(st.sr != 0 && cdr(heap, st.sr) == 0);
                let y = car(heap, st.sr);
                st.srp = cons(heap, y, st.srp);
                st.sr = 0;
                st.rot = Rotation::Appending;
            }
        }
        Rotation::Appending => {
            if st.ok == 0 {
                // Rotation complete: the accumulated list is the new front.
                st.f = st.srp;
                st.rot = Rotation::Idle;
                st.sf = 0;
                st.sfp = 0;
                st.srp = 0;
            } else {
                let x = car(heap, st.sfp);
                st.srp = cons(heap, x, st.srp);
                st.sfp = cdr(heap, st.sfp);
                st.ok -= 1;
            }
        }
    }
}

/// The head of the working front was removed; keep the rotation state
/// consistent with it.
fn invalidate(heap: &mut Heap, st: &mut QState) {
    match st.rot {
        Rotation::Idle => {}
        Rotation::Reversing => st.ok -= 1,
        Rotation::Appending => {
            if st.ok == 0 {
                // The item being dropped is exactly the head of the
                // accumulated new front.
                st.f = cdr(heap, st.srp);
                st.rot = Rotation::Idle;
                st.sf = 0;
                st.sfp = 0;
                st.srp = 0;
            } else {
                st.ok -= 1;
            }
        }
    }
}

/// Re-establish the balance invariant and advance any rotation.
fn check(heap: &mut Heap, st: &mut QState) -> Ptr {
    if st.lenr > st.lenf {
        // Start a rotation: the new logical front is f ++ reverse(r),
        // built incrementally while the old front keeps serving reads.
        debug_assert_eq!(st.rot, Rotation::Idle);
        st.rot = Rotation::Reversing;
        st.ok = 0;
        st.sf = st.f;
        st.sfp = 0;
        st.sr = st.r;
        st.srp = 0;
        st.lenf += st.lenr;
        st.lenr = 0;
        st.r = 0;
    }
    exec(heap, st);
    exec(heap, st);
    write_state(heap, st)
}

/// Is the queue empty?
pub fn queue_is_empty(q: Ptr) -> bool {
    q.is_null()
}

/// Number of items queued.
pub fn queue_length(heap: &Heap, q: Ptr) -> usize {
    if q.is_null() {
        return 0;
    }
    let st = read_state(heap, q);
    (st.lenf + st.lenr) as usize
}

/// The first item of a non-empty queue.
pub fn queue_get_first(heap: &Heap, q: Ptr) -> Word {
    assert!(!q.is_null(), "first of an empty queue");
    let st = read_state(heap, q);
    debug_assert!(st.f != 0, "rotation fell behind the front");
    car(heap, st.f)
}

/// Append an item; returns the new queue. The caller has pre-flighted
/// `can_allocate(QUEUE_MAX_ALLOCATION)`.
pub fn queue_insert_last(heap: &mut Heap, q: Ptr, item: Word) -> Ptr {
    if q.is_null() {
        let f = cons(heap, item, 0);
        let st = QState {
            lenf: 1,
            f,
            lenr: 0,
            r: 0,
            rot: Rotation::Idle,
            ok: 0,
            sf: 0,
            sfp: 0,
            sr: 0,
            srp: 0,
        };
        return write_state(heap, &st);
    }
    let mut st = read_state(heap, q);
    st.r = cons(heap, item, st.r);
    st.lenr += 1;
    check(heap, &mut st)
}

/// Drop the first item; returns the new queue (null when it empties).
pub fn queue_remove_first(heap: &mut Heap, q: Ptr) -> Ptr {
    assert!(!q.is_null(), "remove from an empty queue");
    let mut st = read_state(heap, q);
    if st.lenf + st.lenr == 1 {
        return NULL_PTR;
    }
    st.f = cdr(heap, st.f);
    st.lenf -= 1;
    invalidate(heap, &mut st);
    check(heap, &mut st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::word::signed_to_tagged;

    fn test_heap() -> Heap {
        let mut p = Params::default();
        p.db_size = 2 * 1024 * 1024;
        p.first_generation_size = 512 * 1024;
        Heap::create(p).unwrap()
    }

    #[test]
    fn test_empty_queue() {
        let h = test_heap();
        assert!(queue_is_empty(NULL_PTR));
        assert_eq!(queue_length(&h, NULL_PTR), 0);
    }

    #[test]
    fn test_fifo_order() {
        let mut h = test_heap();
        let mut q = NULL_PTR;
        for i in 0..50 {
            assert!(h.can_allocate(QUEUE_MAX_ALLOCATION));
            q = queue_insert_last(&mut h, q, signed_to_tagged(i));
        }
        assert_eq!(queue_length(&h, q), 50);
        for i in 0..50 {
            assert_eq!(queue_get_first(&h, q), signed_to_tagged(i));
            assert!(h.can_allocate(QUEUE_MAX_ALLOCATION));
            q = queue_remove_first(&mut h, q);
        }
        assert!(queue_is_empty(q));
    }

    #[test]
    fn test_interleaved_operations() {
        let mut h = test_heap();
        let mut q = NULL_PTR;
        let mut model = std::collections::VecDeque::new();
        let mut x: u32 = 42;
        for step in 0..400 {
            x = x.wrapping_mul(1103515245).wrapping_add(12345);
            assert!(h.can_allocate(QUEUE_MAX_ALLOCATION));
            if model.is_empty() || x % 3 != 0 {
                let item = signed_to_tagged((step * 7) as i32);
                q = queue_insert_last(&mut h, q, item);
                model.push_back(item);
            } else {
                assert_eq!(queue_get_first(&h, q), *model.front().unwrap());
                q = queue_remove_first(&mut h, q);
                model.pop_front();
            }
            assert_eq!(queue_length(&h, q), model.len());
            if let Some(&front) = model.front() {
                assert_eq!(queue_get_first(&h, q), front);
            }
        }
    }

    #[test]
    fn test_allocation_stays_bounded() {
        let mut h = test_heap();
        let mut q = NULL_PTR;
        for i in 0..200 {
            let before = h.first_generation_free_words();
            q = queue_insert_last(&mut h, q, signed_to_tagged(i));
            assert!(before - h.first_generation_free_words() <= QUEUE_MAX_ALLOCATION);
        }
        for _ in 0..200 {
            let before = h.first_generation_free_words();
            q = queue_remove_first(&mut h, q);
            assert!(before - h.first_generation_free_words() <= QUEUE_MAX_ALLOCATION);
        }
        assert!(queue_is_empty(q));
    }

    #[test]
    fn test_old_queue_versions_stay_readable() {
        let mut h = test_heap();
        let mut q = NULL_PTR;
        for i in 0..5 {
            q = queue_insert_last(&mut h, q, signed_to_tagged(i));
        }
        let snapshot = q;
        q = queue_remove_first(&mut h, q);
        q = queue_insert_last(&mut h, q, signed_to_tagged(99));
        // The snapshot still sees the original queue.
        assert_eq!(queue_length(&h, snapshot), 5);
        assert_eq!(queue_get_first(&h, snapshot), signed_to_tagged(0));
        assert_eq!(queue_get_first(&h, q), signed_to_tagged(1));
        assert_eq!(queue_length(&h, q), 5);
    }
}
