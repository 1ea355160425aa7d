//! Trie Module - A Persistent 4-way Trie With One-Word Keys
//!
//! Keys are 32 bits wide, consumed two bits at a time from the most
//! significant end, so every path is exactly 16 nodes deep and the
//! sixteenth node's child slots hold the stored values. Values are
//! pointer words; the null word means "absent", so a present value is
//! never 0.
//!
//! All operations are non-destructive: an update copies the path from
//! the root down and returns the new root, leaving every old root
//! readable. Callers pre-flight `can_allocate(TRIE_MAX_ALLOCATION)`
//! before any updating operation.

use crate::cell::CellType;
use crate::heap::Heap;
use crate::word::{Ptr, Word, NULL_PTR};

/// Depth of every key path.
const TRIE_DEPTH: usize = 16;

/// Worst case allocation of one updating trie operation: a full path of
/// five-word nodes, plus one for headroom.
pub const TRIE_MAX_ALLOCATION: usize = (TRIE_DEPTH + 1) * 5;

#[inline]
fn digit(key: Word, level: usize) -> usize {
    ((key >> (30 - 2 * level)) & 3) as usize
}

/// Return the value stored behind `key`, or the null word.
pub fn trie_find(heap: &Heap, root: Ptr, key: Word) -> Word {
    let mut node = root;
    for level in 0..TRIE_DEPTH {
        if node.is_null() {
            return 0;
        }
        let w = heap.word_at(node, 1 + digit(key, level));
        if level == TRIE_DEPTH - 1 {
            return w;
        }
        node = Ptr::from_word(w);
    }
    unreachable!()
}

fn new_node(heap: &mut Heap, template: Ptr) -> Ptr {
    let node = heap.allocate(5, CellType::QuadTrie);
    if template.is_null() {
        for i in 1..5 {
            heap.set_word_at(node, i, 0);
        }
    } else {
        for i in 1..5 {
            let w = heap.word_at(template, i);
            heap.set_word_at(node, i, w);
        }
    }
    node
}

/// Insert (or replace) the value stored behind `key`. Returns the new
/// root. The value must not be the null word.
pub fn trie_insert(heap: &mut Heap, root: Ptr, key: Word, value: Word) -> Ptr {
    assert!(value != 0, "cannot insert the null word into a trie");
    // Record the existing path, then rebuild it bottom-up.
    let mut path = [NULL_PTR; TRIE_DEPTH];
    let mut node = root;
    for level in 0..TRIE_DEPTH {
        path[level] = node;
        if !node.is_null() && level < TRIE_DEPTH - 1 {
            node = Ptr::from_word(heap.word_at(node, 1 + digit(key, level)));
        } else {
            node = NULL_PTR;
        }
    }
    let mut below = value;
    for level in (0..TRIE_DEPTH).rev() {
        let fresh = new_node(heap, path[level]);
        heap.set_word_at(fresh, 1 + digit(key, level), below);
        below = fresh.to_word();
    }
    Ptr::from_word(below)
}

/// Delete the value stored behind `key`. Returns the initial root when
/// the key is absent, otherwise the root of the new trie (null when it
/// became empty).
pub fn trie_delete(heap: &mut Heap, root: Ptr, key: Word) -> Ptr {
    if trie_find(heap, root, key) == 0 {
        return root;
    }
    let mut path = [NULL_PTR; TRIE_DEPTH];
    let mut node = root;
    for level in 0..TRIE_DEPTH {
        path[level] = node;
        if level < TRIE_DEPTH - 1 {
            node = Ptr::from_word(heap.word_at(node, 1 + digit(key, level)));
        }
    }
    let mut below: Word = 0;
    for level in (0..TRIE_DEPTH).rev() {
        let old = path[level];
        // A node whose only occupied slot is the one being emptied
        // collapses away entirely.
        let occupied = (1..5)
            .filter(|&i| i != 1 + digit(key, level))
            .any(|i| heap.word_at(old, i) != 0);
        if below == 0 && !occupied {
            continue;
        }
        let fresh = new_node(heap, old);
        heap.set_word_at(fresh, 1 + digit(key, level), below);
        below = fresh.to_word();
    }
    Ptr::from_word(below)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::root::RootId;

    fn test_heap() -> Heap {
        let mut p = Params::default();
        p.db_size = 2 * 1024 * 1024;
        p.first_generation_size = 256 * 1024;
        p.start_gc_limit = 16 * 1024;
        p.max_gc_limit = 8 * 1024;
        Heap::create(p).unwrap()
    }

    fn value_cell(heap: &mut Heap, data: Word) -> Word {
        let p = heap.allocate(2, CellType::WordVector);
        let p0 = heap.word(p);
        heap.set_word(p, p0 | 1);
        heap.set_word_at(p, 1, data);
        p.to_word()
    }

    #[test]
    fn test_find_on_empty_trie() {
        let h = test_heap();
        assert_eq!(trie_find(&h, NULL_PTR, 7), 0);
    }

    #[test]
    fn test_insert_find_delete() {
        let mut h = test_heap();
        let mut root = NULL_PTR;
        let keys = [7u32, 42, 1000, 0, u32::MAX, 0x8000_0000];
        for &k in &keys {
            assert!(h.can_allocate(TRIE_MAX_ALLOCATION + 2));
            let v = value_cell(&mut h, k ^ 0x5555);
            root = trie_insert(&mut h, root, k, v);
        }
        for &k in &keys {
            let v = trie_find(&h, root, k);
            assert_ne!(v, 0, "key {k} lost");
            assert_eq!(h.word_at(Ptr::from_word(v), 1), k ^ 0x5555);
        }
        assert_eq!(trie_find(&h, root, 8), 0);

        root = trie_delete(&mut h, root, 42);
        assert_eq!(trie_find(&h, root, 42), 0);
        assert_ne!(trie_find(&h, root, 7), 0);
    }

    #[test]
    fn test_insert_is_non_destructive() {
        let mut h = test_heap();
        let a = value_cell(&mut h, 100);
        let b = value_cell(&mut h, 200);
        let r1 = trie_insert(&mut h, NULL_PTR, 3, a);
        let r2 = trie_insert(&mut h, r1, 3, b);
        assert_eq!(trie_find(&h, r1, 3), a);
        assert_eq!(trie_find(&h, r2, 3), b);
    }

    #[test]
    fn test_delete_absent_key_allocates_nothing() {
        let mut h = test_heap();
        let v = value_cell(&mut h, 1);
        let root = trie_insert(&mut h, NULL_PTR, 10, v);
        let free = h.first_generation_free_words();
        let same = trie_delete(&mut h, root, 11);
        assert_eq!(same, root);
        assert_eq!(h.first_generation_free_words(), free);
    }

    #[test]
    fn test_delete_to_empty() {
        let mut h = test_heap();
        let v = value_cell(&mut h, 1);
        let root = trie_insert(&mut h, NULL_PTR, 77, v);
        let root = trie_delete(&mut h, root, 77);
        assert!(root.is_null());
    }

    #[test]
    fn test_many_keys_survive_commit() {
        let mut h = test_heap();
        let mut root = NULL_PTR;
        let mut key: Word = 12345;
        let mut inserted = Vec::new();
        for _ in 0..64 {
            key = key.wrapping_mul(1103515245).wrapping_add(12341);
            if !h.can_allocate(TRIE_MAX_ALLOCATION + 2) {
                h.set_root_ptr(RootId::Test1, root);
                h.flush_batch().unwrap();
                root = h.root_ptr(RootId::Test1);
            }
            let v = value_cell(&mut h, key);
            root = trie_insert(&mut h, root, key, v);
            inserted.push(key);
        }
        h.set_root_ptr(RootId::Test1, root);
        h.flush_batch().unwrap();
        root = h.root_ptr(RootId::Test1);
        for &k in &inserted {
            let v = trie_find(&h, root, k);
            assert_ne!(v, 0);
            assert_eq!(h.word_at(Ptr::from_word(v), 1), k);
        }
    }
}
