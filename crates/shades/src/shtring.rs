//! Shtring Module - Persistent Strings and Interning
//!
//! A shtring is an immutable array of 8-bit bytes, stored as a sequence
//! of chunk cells gathered under a small tree, with a five-word
//! descriptor on top. New shtrings are only ever created from host byte
//! buffers or existing shtrings; nothing mutates one after creation.
//!
//! Interning gives equal strings one physical cell and a monotonic
//! 32-bit id. The id namespace keys the `bcodes` and `globals` tries, so
//! ids are never reused and survive recovery with the interning
//! structure itself. Equality of interned pointers is therefore semantic
//! equality.

use crate::cell::CellType;
use crate::heap::Heap;
use crate::trie::{trie_find, trie_insert, TRIE_MAX_ALLOCATION};
use crate::word::{Ptr, Word, NULL_PTR};

/// Maximum number of bytes in one chunk.
pub const SHTRING_CHUNK_MAX: usize = 32;

/// Maximum children under one chunk-tree node.
const NODE_MAX_CHILDREN: usize = 16;

/// Worst-case allocation of one `shtring_intern`: two trie updates, the
/// intern node and a fresh intern root.
pub const SHTRING_INTERN_MAX_ALLOCATION: usize = 2 * TRIE_MAX_ALLOCATION + 4 + 4;

/// Words needed to `shtring_create` a string of `len` bytes.
pub fn shtring_create_max_allocation(len: usize) -> usize {
    let chunks = len.div_ceil(SHTRING_CHUNK_MAX).max(1);
    // Chunk cells.
    let mut words = chunks * (1 + SHTRING_CHUNK_MAX / 4);
    // Tree nodes, level by level.
    let mut level = chunks;
    while level > 1 {
        level = level.div_ceil(NODE_MAX_CHILDREN);
        words += level * (3 + NODE_MAX_CHILDREN);
    }
    words + 5
}

/// Words needed to `shtring_cat` two shtrings.
pub fn shtring_cat_max_allocation(heap: &Heap, s1: Ptr, s2: Ptr) -> usize {
    shtring_create_max_allocation(shtring_length(heap, s1) + shtring_length(heap, s2))
}

/// Create a shtring from a host byte buffer. The caller has pre-flighted
/// `can_allocate(shtring_create_max_allocation(bytes.len()))`.
pub fn shtring_create(heap: &mut Heap, bytes: &[u8]) -> Ptr {
    let mut level: Vec<Ptr> = Vec::with_capacity(bytes.len().div_ceil(SHTRING_CHUNK_MAX));
    for chunk in bytes.chunks(SHTRING_CHUNK_MAX) {
        level.push(make_chunk(heap, chunk));
    }
    let mut height: Word = 0;
    while level.len() > 1 {
        height += 1;
        let mut next = Vec::with_capacity(level.len().div_ceil(NODE_MAX_CHILDREN));
        for group in level.chunks(NODE_MAX_CHILDREN) {
            next.push(make_node(heap, group, height));
        }
        level = next;
    }
    let root = level.first().copied().unwrap_or(NULL_PTR);
    let s = heap.allocate(5, CellType::Shtring);
    heap.set_word_at(s, 1, 0);
    heap.set_word_at(s, 2, bytes.len() as Word);
    heap.set_word_at(s, 3, height);
    heap.set_word_at(s, 4, root.to_word());
    s
}

fn make_chunk(heap: &mut Heap, bytes: &[u8]) -> Ptr {
    debug_assert!(!bytes.is_empty() && bytes.len() <= SHTRING_CHUNK_MAX);
    let payload_words = bytes.len().div_ceil(4);
    let p = heap.allocate(1 + payload_words, CellType::ShtringChunk);
    let p0 = heap.word(p);
    heap.set_word(p, p0 | bytes.len() as Word);
    for (i, quad) in bytes.chunks(4).enumerate() {
        let mut buf = [0u8; 4];
        buf[..quad.len()].copy_from_slice(quad);
        heap.set_word_at(p, 1 + i, Word::from_le_bytes(buf));
    }
    p
}

fn make_node(heap: &mut Heap, children: &[Ptr], height: Word) -> Ptr {
    let p = heap.allocate(3 + children.len(), CellType::ShtringNode);
    let p0 = heap.word(p);
    heap.set_word(p, p0 | children.len() as Word);
    let total: Word = children.iter().map(|&c| subtree_length(heap, c)).sum();
    heap.set_word_at(p, 1, total);
    heap.set_word_at(p, 2, height);
    for (i, &c) in children.iter().enumerate() {
        heap.set_word_at(p, 3 + i, c.to_word());
    }
    p
}

fn subtree_length(heap: &Heap, node: Ptr) -> Word {
    match heap.type_of(node) {
        CellType::ShtringChunk => heap.word(node) & 0x00FF_FFFF,
        CellType::ShtringNode => heap.word_at(node, 1),
        other => panic!("not a chunk tree cell: {}", other.name()),
    }
}

/// Length of a shtring in bytes.
pub fn shtring_length(heap: &Heap, s: Ptr) -> usize {
    heap.word_at(s, 2) as usize
}

/// The byte at `pos`, by descent through the chunk tree.
pub fn shtring_charat(heap: &Heap, s: Ptr, pos: usize) -> u8 {
    assert!(pos < shtring_length(heap, s), "charat out of range");
    let mut target = heap.word_at(s, 1) as usize + pos;
    let mut node = Ptr::from_word(heap.word_at(s, 4));
    loop {
        match heap.type_of(node) {
            CellType::ShtringChunk => {
                let w = heap.word_at(node, 1 + target / 4);
                return w.to_le_bytes()[target % 4];
            }
            CellType::ShtringNode => {
                let children = (heap.word(node) & 0xFF) as usize;
                let mut next = NULL_PTR;
                for i in 0..children {
                    let child = Ptr::from_word(heap.word_at(node, 3 + i));
                    let len = subtree_length(heap, child) as usize;
                    if target < len {
                        next = child;
                        break;
                    }
                    target -= len;
                }
                assert!(!next.is_null(), "chunk tree length accounting broken");
                node = next;
            }
            other => panic!("not a chunk tree cell: {}", other.name()),
        }
    }
}

/// Copy `len` bytes starting at `pos` into a host buffer.
pub fn shtring_strat(heap: &Heap, out: &mut [u8], s: Ptr, pos: usize, len: usize) {
    assert!(pos + len <= shtring_length(heap, s), "strat out of range");
    assert!(out.len() >= len);
    let start = heap.word_at(s, 1) as usize + pos;
    let mut written = 0usize;
    collect_bytes(
        heap,
        Ptr::from_word(heap.word_at(s, 4)),
        start,
        len,
        out,
        &mut written,
        &mut 0,
    );
    debug_assert_eq!(written, len);
}

fn collect_bytes(
    heap: &Heap,
    node: Ptr,
    start: usize,
    len: usize,
    out: &mut [u8],
    written: &mut usize,
    seen: &mut usize,
) {
    if node.is_null() || *written == len {
        return;
    }
    match heap.type_of(node) {
        CellType::ShtringChunk => {
            let clen = (heap.word(node) & 0x00FF_FFFF) as usize;
            for i in 0..clen {
                let at = *seen + i;
                if at >= start && *written < len {
                    let w = heap.word_at(node, 1 + i / 4);
                    out[*written] = w.to_le_bytes()[i % 4];
                    *written += 1;
                }
            }
            *seen += clen;
        }
        CellType::ShtringNode => {
            let sublen = heap.word_at(node, 1) as usize;
            if *seen + sublen <= start {
                // Entirely before the requested range.
                *seen += sublen;
                return;
            }
            let children = (heap.word(node) & 0xFF) as usize;
            for i in 0..children {
                collect_bytes(
                    heap,
                    Ptr::from_word(heap.word_at(node, 3 + i)),
                    start,
                    len,
                    out,
                    written,
                    seen,
                );
            }
        }
        other => panic!("not a chunk tree cell: {}", other.name()),
    }
}

/// All bytes of a shtring as a host vector.
pub fn shtring_to_bytes(heap: &Heap, s: Ptr) -> Vec<u8> {
    let len = shtring_length(heap, s);
    let mut out = vec![0u8; len];
    shtring_strat(heap, &mut out, s, 0, len);
    out
}

/// Byte-wise comparison, without heap allocation.
pub fn shtring_cmp(heap: &Heap, s1: Ptr, s2: Ptr) -> std::cmp::Ordering {
    shtring_to_bytes(heap, s1).cmp(&shtring_to_bytes(heap, s2))
}

/// Concatenate two shtrings into a new one. The caller has pre-flighted
/// `can_allocate(shtring_cat_max_allocation(s1, s2))`.
pub fn shtring_cat(heap: &mut Heap, s1: Ptr, s2: Ptr) -> Ptr {
    let mut bytes = shtring_to_bytes(heap, s1);
    bytes.extend(shtring_to_bytes(heap, s2));
    shtring_create(heap, &bytes)
}

fn shtring_hash(heap: &Heap, s: Ptr) -> Word {
    let mut h: Word = 0x811C_9DC5;
    for b in shtring_to_bytes(heap, s) {
        h = (h ^ b as Word).wrapping_mul(0x0100_0193);
    }
    // The trie cannot store key 0's absence apart from a null bucket;
    // any constant displacement keeps hashing uniform enough.
    h | 1
}

/// Result of an interning operation.
pub struct InternResult {
    pub new_root: Ptr,
    pub id: Word,
    pub interned: Ptr,
    pub was_new: bool,
}

/// Intern a shtring: return the physically unique cell and stable id for
/// its contents, inserting it if absent. The caller has pre-flighted
/// `can_allocate(SHTRING_INTERN_MAX_ALLOCATION)`.
pub fn shtring_intern(heap: &mut Heap, root: Ptr, s: Ptr) -> InternResult {
    let (hash_trie, id_trie, count) = if root.is_null() {
        (NULL_PTR, NULL_PTR, 0)
    } else {
        (
            Ptr::from_word(heap.word_at(root, 1)),
            Ptr::from_word(heap.word_at(root, 2)),
            heap.word_at(root, 3),
        )
    };
    let h = shtring_hash(heap, s);
    let bucket = Ptr::from_word(trie_find(heap, hash_trie, h));

    let mut node = bucket;
    let bytes = shtring_to_bytes(heap, s);
    while !node.is_null() {
        let candidate = Ptr::from_word(heap.word_at(node, 2));
        if shtring_to_bytes(heap, candidate) == bytes {
            return InternResult {
                new_root: root,
                id: heap.word_at(node, 3),
                interned: candidate,
                was_new: false,
            };
        }
        node = Ptr::from_word(heap.word_at(node, 1));
    }

    let id = count + 1;
    let fresh = heap.allocate(4, CellType::ShtringInternNode);
    heap.set_word_at(fresh, 1, bucket.to_word());
    heap.set_word_at(fresh, 2, s.to_word());
    heap.set_word_at(fresh, 3, id);
    let hash_trie = trie_insert(heap, hash_trie, h, fresh.to_word());
    let id_trie = trie_insert(heap, id_trie, id, s.to_word());
    let new_root = heap.allocate(4, CellType::ShtringInternRoot);
    heap.set_word_at(new_root, 1, hash_trie.to_word());
    heap.set_word_at(new_root, 2, id_trie.to_word());
    heap.set_word_at(new_root, 3, id);
    InternResult {
        new_root,
        id,
        interned: s,
        was_new: true,
    }
}

/// Find an interned shtring by its id, or null.
pub fn shtring_lookup_by_intern_id(heap: &Heap, root: Ptr, id: Word) -> Ptr {
    if root.is_null() {
        return NULL_PTR;
    }
    let id_trie = Ptr::from_word(heap.word_at(root, 2));
    Ptr::from_word(trie_find(heap, id_trie, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;

    fn test_heap() -> Heap {
        let mut p = Params::default();
        p.db_size = 4 * 1024 * 1024;
        p.first_generation_size = 1024 * 1024;
        Heap::create(p).unwrap()
    }

    fn create(heap: &mut Heap, text: &str) -> Ptr {
        assert!(heap.can_allocate(shtring_create_max_allocation(text.len())));
        shtring_create(heap, text.as_bytes())
    }

    #[test]
    fn test_create_and_read_back() {
        let mut h = test_heap();
        for text in ["", "x", "hello", "a".repeat(31).as_str(), "b".repeat(33).as_str()] {
            let s = create(&mut h, text);
            assert_eq!(shtring_length(&h, s), text.len());
            assert_eq!(shtring_to_bytes(&h, s), text.as_bytes());
        }
    }

    #[test]
    fn test_large_string_builds_a_tree() {
        let mut h = test_heap();
        let text: String = (0..4000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let s = create(&mut h, &text);
        assert!(h.word_at(s, 3) >= 1, "expected at least one node level");
        assert_eq!(shtring_to_bytes(&h, s), text.as_bytes());
        assert_eq!(shtring_charat(&h, s, 0), b'a');
        assert_eq!(shtring_charat(&h, s, 3999), text.as_bytes()[3999]);
        let mut mid = [0u8; 10];
        shtring_strat(&h, &mut mid, s, 1000, 10);
        assert_eq!(&mid, &text.as_bytes()[1000..1010]);
    }

    #[test]
    fn test_create_allocation_bound_holds() {
        let mut h = test_heap();
        for len in [0usize, 1, 32, 33, 1000, 5000] {
            let text = "q".repeat(len);
            let before = h.first_generation_free_words();
            let _ = create(&mut h, &text);
            let used = before - h.first_generation_free_words();
            assert!(
                used <= shtring_create_max_allocation(len),
                "create({len}) used {used} words, bound {}",
                shtring_create_max_allocation(len)
            );
        }
    }

    #[test]
    fn test_cat_and_cmp() {
        let mut h = test_heap();
        let a = create(&mut h, "fore");
        let b = create(&mut h, "castle");
        assert!(h.can_allocate(shtring_cat_max_allocation(&h, a, b)));
        let ab = shtring_cat(&mut h, a, b);
        assert_eq!(shtring_to_bytes(&h, ab), b"forecastle");
        assert_eq!(shtring_cmp(&h, a, a), std::cmp::Ordering::Equal);
        assert_eq!(shtring_cmp(&h, b, a), std::cmp::Ordering::Less);
    }

    #[test]
    fn test_intern_is_physically_unique() {
        let mut h = test_heap();
        let s1 = create(&mut h, "fib");
        let s2 = create(&mut h, "fib");
        assert_ne!(s1, s2);
        assert!(h.can_allocate(2 * SHTRING_INTERN_MAX_ALLOCATION));
        let r1 = shtring_intern(&mut h, NULL_PTR, s1);
        assert!(r1.was_new);
        let r2 = shtring_intern(&mut h, r1.new_root, s2);
        assert!(!r2.was_new);
        assert_eq!(r2.id, r1.id);
        assert_eq!(r2.interned, s1, "interning must return the first cell");
        assert_eq!(r2.new_root, r1.new_root);
    }

    #[test]
    fn test_intern_ids_are_distinct_and_monotonic() {
        let mut h = test_heap();
        let mut root = NULL_PTR;
        let mut ids = Vec::new();
        for i in 0..20 {
            let s = create(&mut h, &format!("name-{i}"));
            assert!(h.can_allocate(SHTRING_INTERN_MAX_ALLOCATION));
            let r = shtring_intern(&mut h, root, s);
            assert!(r.was_new);
            root = r.new_root;
            ids.push(r.id);
        }
        for w in ids.windows(2) {
            assert!(w[1] > w[0]);
        }
        for (i, &id) in ids.iter().enumerate() {
            let s = shtring_lookup_by_intern_id(&h, root, id);
            assert!(!s.is_null());
            assert_eq!(shtring_to_bytes(&h, s), format!("name-{i}").as_bytes());
        }
        assert!(shtring_lookup_by_intern_id(&h, root, 9999).is_null());
    }
}
