//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use shades::{Heap, Params};

/// Parameters for an in-memory database (no disk image).
pub fn mem_params(db_size: usize, first_generation_size: usize) -> Params {
    let mut p = Params::default();
    p.db_size = db_size;
    p.first_generation_size = first_generation_size;
    // Keep threshold-driven collection out of small test heaps so page
    // and generation counts stay predictable.
    p.start_gc_limit = 8 * 1024;
    p.max_gc_limit = 4 * 1024;
    p.print_insns_are_disabled = true;
    p
}

/// Parameters for a disk-backed database in `dir`.
pub fn disk_params(
    dir: &tempfile::TempDir,
    db_size: usize,
    first_generation_size: usize,
) -> Params {
    let mut p = mem_params(db_size, first_generation_size);
    p.disk_filename = dir.path().join("image").to_str().unwrap().to_string();
    p.disk_filesize = (db_size * 4).max(8 * 1024 * 1024);
    p.disk_skip_nbytes = 8 * 1024;
    p
}

/// A word_vector cell holding one payload word, the idiomatic test datum.
pub fn value_cell(heap: &mut Heap, data: u32) -> shades::Ptr {
    assert!(heap.can_allocate(2));
    let p = heap.allocate(2, shades::CellType::WordVector);
    let header = heap.word(p);
    heap.set_word(p, header | 1);
    heap.set_word_at(p, 1, data);
    p
}

/// The payload word of a `value_cell`.
pub fn value_of(heap: &Heap, p: shades::Ptr) -> u32 {
    assert!(!p.is_null());
    heap.word_at(p, 1)
}
