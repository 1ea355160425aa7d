//! Heap Module - The Contiguous Cell Region and Its Allocator
//!
//! One aligned region of words holds everything persistent:
//!
//! ```text
//! ┌──────────────┬───────────────────────────────┬──────────────────┐
//! │ root region  │ data pages (mature gens)      │ first generation │
//! │ header+roots │ page 0 | page 1 | ...         │ bump ↓ downward  │
//! └──────────────┴───────────────────────────────┴──────────────────┘
//! ```
//!
//! The first generation is bump-allocated from its high end downward; a
//! successful `can_allocate` makes the following `allocate` infallible,
//! which is what lets byte code sequences pre-flight their whole
//! allocation once. Mature generations live in the page pool and are only
//! ever written by the commit engine.
//!
//! The `Heap` handle owns all process state: the word region, the page
//! table, the generation list, the external-root slab and the disk image.
//! There is no global mutable state.

use crate::cell::{self, CellType, SlotKind};
use crate::config::Params;
use crate::disk::DiskImage;
use crate::error::{Result, ShadesError};
use crate::root::{
    self, RootId, ROOT_FORMAT_VERSION, ROOT_MAGIC, ROOT_SLOTS_BASE, RH_DB_SIZE,
    RH_FIRST_GENERATION_SIZE, RH_MAGIC, RH_NUM_ROOT_SLOTS, RH_PAGE_SIZE, RH_ROOT_REGION_WORDS,
    RH_TIMESTAMP, RH_VERSION,
};
use crate::stats::Stats;
use crate::word::{Ptr, Word};

/// Reserved pinfo headroom beyond the per-page worst case.
const ROOT_REGION_SLACK_WORDS: usize = 32;

/// Worst-case pinfo words per data page (one single-page generation each:
/// 4 header words + 2 page words).
const PINFO_WORDS_PER_PAGE: usize = 6;

/// Per-data-page bookkeeping. Pages are identified by their index in the
/// data page pool.
#[derive(Debug, Clone)]
pub(crate) struct PageInfo {
    /// Generation number owning this page, if any.
    pub owner: Option<Word>,
    /// Disk page currently holding this page's committed image.
    pub disk_page: Option<u32>,
    /// Written since the last commit; must go to disk next commit.
    pub dirty: bool,
}

/// Process-local mirror of one mature generation. The durable form is the
/// generation_pinfo chain in the root region.
#[derive(Debug, Clone)]
pub(crate) struct Generation {
    pub number: Word,
    /// Memory data pages, in allocation order.
    pub pages: Vec<u32>,
    /// Words used in each page, parallel to `pages`.
    pub fills: Vec<u32>,
    pub live_words: usize,
    /// Live-out over live-in ratio of this generation's last collection;
    /// 1.0 until it has been collected once.
    pub shrinkage: f64,
}

impl Generation {
    pub fn byte_size(&self, page_bytes: usize) -> usize {
        self.pages.len() * page_bytes
    }
}

/// An externally-rooted pointer: a host-side slot the commit engine
/// treats as a root and patches after copying.
///
/// Obtained from [`Heap::external_root_init`] and returned with
/// [`Heap::external_root_uninit`]; using a slot after returning it is made
/// impossible by ownership, double-init cannot be expressed, and a leaked
/// handle merely pins its target forever. Unlike the root block, these do
/// not survive a crash.
#[derive(Debug)]
pub struct ExternalRoot {
    index: usize,
}

/// An allocation point: the bump position to return to when speculative
/// work turns out to be a no-op. A commit must not occur between capture
/// and restore.
#[derive(Debug, Clone, Copy)]
pub struct AllocationPoint(pub(crate) usize);

#[derive(Debug)]
pub struct Heap {
    pub(crate) words: Box<[Word]>,
    pub(crate) params: Params,
    pub(crate) page_words: usize,
    pub(crate) root_region_words: usize,
    pub(crate) data_start_w: usize,
    pub(crate) num_data_pages: usize,
    pub(crate) fg_start_w: usize,
    pub(crate) fg_end_w: usize,
    pub(crate) fg_alloc_w: usize,
    pub(crate) pages: Vec<PageInfo>,
    pub(crate) free_pages: Vec<u32>,
    /// Mature generations, newest first.
    pub(crate) generations: Vec<Generation>,
    pub(crate) next_generation_number: Word,
    pub(crate) batch_number: Word,
    pub(crate) disk: Option<DiskImage>,
    /// Disk pages freed this commit; reusable only after the root block
    /// that no longer references them is durable.
    pub(crate) deferred_disk_free: Vec<u32>,
    pub(crate) external_roots: Vec<Option<Word>>,
    pub(crate) external_free: Vec<usize>,
    pub stats: Stats,
}

/// Computed region geometry, shared by create and recovery.
pub(crate) struct Geometry {
    pub page_words: usize,
    pub root_region_words: usize,
    pub num_data_pages: usize,
    pub fg_words: usize,
    pub total_words: usize,
}

pub(crate) fn compute_geometry(params: &Params) -> Result<Geometry> {
    let page_words = params.page_size / 4;
    let fg_words = params.first_generation_size / 4;
    let db_words = params.db_size / 4;

    let est_data_pages = (db_words - fg_words) / page_words;
    let root_need = ROOT_SLOTS_BASE
        + root::num_root_slots()
        + PINFO_WORDS_PER_PAGE * est_data_pages
        + ROOT_REGION_SLACK_WORDS;
    let root_region_words = root_need.div_ceil(page_words) * page_words;

    if db_words <= root_region_words + fg_words {
        return Err(ShadesError::Configuration(format!(
            "db_size of {} bytes leaves no room for data pages",
            params.db_size
        )));
    }
    let num_data_pages = (db_words - root_region_words - fg_words) / page_words;
    if num_data_pages == 0 {
        return Err(ShadesError::Configuration(
            "db_size leaves no room for data pages".to_string(),
        ));
    }
    let total_words = root_region_words + num_data_pages * page_words + fg_words;
    Ok(Geometry {
        page_words,
        root_region_words,
        num_data_pages,
        fg_words,
        total_words,
    })
}

impl Heap {
    /// Build a fresh, empty database.
    ///
    /// When `disk_filename` is set, the backing image file is created and
    /// sized; the first root block reaches the disk at the first
    /// `flush_batch`.
    pub fn create(params: Params) -> Result<Heap> {
        params
            .validate()
            .map_err(|e| ShadesError::Configuration(e.to_string()))?;
        let geo = compute_geometry(&params)?;
        let disk = if params.disk_filename.is_empty() {
            None
        } else {
            Some(DiskImage::create(&params, geo.root_region_words * 4)?)
        };
        let mut heap = Heap::from_parts(params, geo, disk);
        heap.init_root_region();
        Ok(heap)
    }

    pub(crate) fn from_parts(params: Params, geo: Geometry, disk: Option<DiskImage>) -> Heap {
        let words = vec![0u32; geo.total_words].into_boxed_slice();
        let data_start_w = geo.root_region_words;
        let fg_start_w = data_start_w + geo.num_data_pages * geo.page_words;
        let fg_end_w = fg_start_w + geo.fg_words;
        Heap {
            words,
            params,
            page_words: geo.page_words,
            root_region_words: geo.root_region_words,
            data_start_w,
            num_data_pages: geo.num_data_pages,
            fg_start_w,
            fg_end_w,
            fg_alloc_w: fg_end_w,
            pages: vec![
                PageInfo {
                    owner: None,
                    disk_page: None,
                    dirty: false,
                };
                geo.num_data_pages
            ],
            free_pages: (0..geo.num_data_pages as u32).rev().collect(),
            generations: Vec::new(),
            next_generation_number: 1,
            batch_number: 0,
            disk,
            deferred_disk_free: Vec::new(),
            external_roots: Vec::new(),
            external_free: Vec::new(),
            stats: Stats::new(),
        }
    }

    fn init_root_region(&mut self) {
        self.words[RH_MAGIC] = ROOT_MAGIC;
        self.words[RH_VERSION] = ROOT_FORMAT_VERSION;
        self.words[RH_TIMESTAMP] = 0;
        self.words[RH_PAGE_SIZE] = self.params.page_size as Word;
        self.words[RH_DB_SIZE] = self.params.db_size as Word;
        self.words[RH_FIRST_GENERATION_SIZE] = self.params.first_generation_size as Word;
        self.words[RH_ROOT_REGION_WORDS] = self.root_region_words as Word;
        self.words[RH_NUM_ROOT_SLOTS] = root::num_root_slots() as Word;
    }

    // === Word access ===

    #[inline]
    pub fn word(&self, p: Ptr) -> Word {
        self.words[p.word_index()]
    }

    #[inline]
    pub fn set_word(&mut self, p: Ptr, w: Word) {
        self.words[p.word_index()] = w;
    }

    #[inline]
    pub fn word_at(&self, p: Ptr, off: usize) -> Word {
        self.words[p.word_index() + off]
    }

    #[inline]
    pub fn set_word_at(&mut self, p: Ptr, off: usize, w: Word) {
        self.words[p.word_index() + off] = w;
    }

    // === Cell registry operations ===

    #[inline]
    pub fn type_of(&self, p: Ptr) -> CellType {
        CellType::of_header(self.word(p))
    }

    pub fn size_of(&self, p: Ptr) -> usize {
        let size = cell::size_words(self, p);
        debug_assert!(size >= cell::MIN_CELL_WORDS);
        debug_assert!(size < self.page_words || !self.is_in_data_pages(p));
        size
    }

    pub fn walk(&self, p: Ptr, visit: &mut dyn FnMut(SlotKind, usize)) {
        cell::walk_cell(self, p, visit);
    }

    // === Allocation ===

    /// Pure check that `n` more words fit in the current commit batch.
    #[inline]
    pub fn can_allocate(&self, n: usize) -> bool {
        self.fg_alloc_w - self.fg_start_w >= n
    }

    /// Allocate `n` words in the first generation and stamp the type tag.
    ///
    /// Never fails: callers must have just checked `can_allocate`, and a
    /// violation aborts the process.
    #[inline]
    pub fn allocate(&mut self, n: usize, t: CellType) -> Ptr {
        assert!(self.can_allocate(n), "allocate({n}) without can_allocate");
        debug_assert!(n >= cell::MIN_CELL_WORDS);
        self.fg_alloc_w -= n;
        self.words[self.fg_alloc_w] = (t as Word) << 24;
        Ptr::from_word_index(self.fg_alloc_w)
    }

    /// Allocate without stamping a tag, for code paths that overwrite the
    /// whole cell from another cell.
    #[inline]
    pub fn raw_allocate(&mut self, n: usize) -> Ptr {
        assert!(self.can_allocate(n), "raw_allocate({n}) without can_allocate");
        self.fg_alloc_w -= n;
        Ptr::from_word_index(self.fg_alloc_w)
    }

    /// Capture the current bump position.
    #[inline]
    pub fn allocation_point(&self) -> AllocationPoint {
        AllocationPoint(self.fg_alloc_w)
    }

    /// Retract all allocation done since `point` was captured.
    #[inline]
    pub fn restore_allocation_point(&mut self, point: AllocationPoint) {
        assert!(
            point.0 >= self.fg_alloc_w && point.0 <= self.fg_end_w,
            "allocation point from a different batch"
        );
        self.fg_alloc_w = point.0;
    }

    #[inline]
    pub fn is_in_first_generation(&self, p: Ptr) -> bool {
        p.word_index() >= self.fg_start_w
    }

    fn is_in_data_pages(&self, p: Ptr) -> bool {
        let wi = p.word_index();
        wi >= self.data_start_w && wi < self.fg_start_w
    }

    /// Words still available in the first generation.
    pub fn first_generation_free_words(&self) -> usize {
        self.fg_alloc_w - self.fg_start_w
    }

    /// Free memory in the mature page pool, in bytes.
    pub fn free_bytes(&self) -> usize {
        self.free_pages.len() * self.page_words * 4
    }

    /// Generic cell copy into the first generation. The caller must have
    /// pre-flighted `can_allocate(self.size_of(p))`.
    pub fn cell_copy(&mut self, p: Ptr) -> Ptr {
        let size = self.size_of(p);
        let dst = self.raw_allocate(size);
        for i in 0..size {
            let w = self.word_at(p, i);
            self.set_word_at(dst, i, w);
        }
        dst
    }

    // === Page helpers ===

    #[inline]
    pub(crate) fn page_start_w(&self, page: u32) -> usize {
        self.data_start_w + page as usize * self.page_words
    }

    pub(crate) fn page_of_ptr(&self, p: Ptr) -> Option<u32> {
        let wi = p.word_index();
        if wi >= self.data_start_w && wi < self.fg_start_w {
            Some(((wi - self.data_start_w) / self.page_words) as u32)
        } else {
            None
        }
    }

    /// Mark the mature page containing `p` dirty, for the few controlled
    /// in-place rewrites outside the commit engine (loader pointer
    /// resolution).
    pub(crate) fn mark_ptr_page_dirty(&mut self, p: Ptr) {
        if let Some(page) = self.page_of_ptr(p) {
            self.pages[page as usize].dirty = true;
        }
    }

    // === Named root access ===

    #[inline]
    fn root_index(slot: usize) -> usize {
        ROOT_SLOTS_BASE + slot
    }

    pub fn root_word(&self, id: RootId) -> Word {
        self.words[Self::root_index(root::root_slot(id))]
    }

    pub fn set_root_word(&mut self, id: RootId, w: Word) {
        self.words[Self::root_index(root::root_slot(id))] = w;
    }

    pub fn root_ptr(&self, id: RootId) -> Ptr {
        Ptr::from_word(self.root_word(id))
    }

    pub fn set_root_ptr(&mut self, id: RootId, p: Ptr) {
        self.set_root_word(id, p.to_word());
    }

    pub fn root_ptr_vec(&self, id: RootId, index: usize) -> Ptr {
        Ptr::from_word(self.words[Self::root_index(root::root_slot_vec(id, index))])
    }

    pub fn set_root_ptr_vec(&mut self, id: RootId, index: usize, p: Ptr) {
        self.words[Self::root_index(root::root_slot_vec(id, index))] = p.to_word();
    }

    /// Raw access by slot number, for the VM's root instructions.
    pub fn root_slot_word(&self, slot: usize) -> Option<Word> {
        if slot < root::num_root_slots() {
            Some(self.words[Self::root_index(slot)])
        } else {
            None
        }
    }

    pub fn set_root_slot_word(&mut self, slot: usize, w: Word) -> bool {
        if slot < root::num_root_slots() {
            self.words[Self::root_index(slot)] = w;
            true
        } else {
            false
        }
    }

    /// True when every named root is null/zero (a freshly created or empty
    /// database).
    pub fn all_roots_null(&self) -> bool {
        (0..root::num_root_slots()).all(|slot| self.words[Self::root_index(slot)] == 0)
    }

    // === Externally-rooted pointers ===

    /// Create an externally-rooted slot holding `value`.
    pub fn external_root_init(&mut self, value: Ptr) -> ExternalRoot {
        let index = match self.external_free.pop() {
            Some(i) => {
                self.external_roots[i] = Some(value.to_word());
                i
            }
            None => {
                self.external_roots.push(Some(value.to_word()));
                self.external_roots.len() - 1
            }
        };
        ExternalRoot { index }
    }

    /// Reassign an externally-rooted slot.
    pub fn external_root_assign(&mut self, root: &ExternalRoot, value: Ptr) {
        match self.external_roots.get_mut(root.index) {
            Some(slot @ Some(_)) => *slot = Some(value.to_word()),
            _ => panic!("assign to uninitialized external root"),
        }
    }

    /// Read an externally-rooted slot.
    pub fn external_root_ref(&self, root: &ExternalRoot) -> Ptr {
        match self.external_roots.get(root.index) {
            Some(Some(w)) => Ptr::from_word(*w),
            _ => panic!("ref of uninitialized external root"),
        }
    }

    /// Return an externally-rooted slot.
    pub fn external_root_uninit(&mut self, root: ExternalRoot) {
        match self.external_roots.get_mut(root.index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.external_free.push(root.index);
            }
            _ => panic!("uninit of uninitialized external root"),
        }
    }

    // === Introspection ===

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn batch_number(&self) -> Word {
        self.batch_number
    }

    pub fn number_of_generations(&self) -> usize {
        self.generations.len()
    }

    /// One-line debugging rendition of a cell.
    pub fn fmt_cell(&self, p: Ptr) -> String {
        if p.is_null() {
            return "NULL".to_string();
        }
        let t = self.type_of(p);
        let size = if t == CellType::ForwardPointer || t == CellType::Bonk {
            2
        } else {
            self.size_of(p)
        };
        let mut s = format!("{}@{:#x}[", t.name(), p.to_word());
        for i in 0..size.min(12) {
            if i > 0 {
                s.push(' ');
            }
            s.push_str(&format!("{:#x}", self.word_at(p, i)));
        }
        if size > 12 {
            s.push_str(" ...");
        }
        s.push(']');
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> Params {
        let mut p = Params::default();
        p.db_size = 512 * 1024;
        p.first_generation_size = 64 * 1024;
        p
    }

    #[test]
    fn test_geometry_partitions_the_region() {
        let p = small_params();
        let geo = compute_geometry(&p).unwrap();
        assert!(geo.root_region_words.is_multiple_of(geo.page_words));
        assert!(geo.num_data_pages > 0);
        assert_eq!(
            geo.total_words,
            geo.root_region_words + geo.num_data_pages * geo.page_words + geo.fg_words
        );
        assert!(geo.total_words * 4 <= p.db_size);
    }

    #[test]
    fn test_bump_allocation_moves_downward() {
        let mut h = Heap::create(small_params()).unwrap();
        let free = h.first_generation_free_words();
        let a = h.allocate(4, CellType::WordVector);
        let b = h.allocate(2, CellType::List);
        assert!(b.word_index() < a.word_index());
        assert_eq!(h.first_generation_free_words(), free - 6);
        assert!(h.is_in_first_generation(a));
        assert!(h.is_in_first_generation(b));
        assert_eq!(h.type_of(a), CellType::WordVector);
    }

    #[test]
    fn test_can_allocate_is_exact() {
        let mut h = Heap::create(small_params()).unwrap();
        let free = h.first_generation_free_words();
        assert!(h.can_allocate(free));
        assert!(!h.can_allocate(free + 1));
        h.allocate(free, CellType::WordVector);
        assert!(!h.can_allocate(1));
    }

    #[test]
    #[should_panic]
    fn test_allocate_without_room_aborts() {
        let mut h = Heap::create(small_params()).unwrap();
        let free = h.first_generation_free_words();
        h.allocate(free + 1, CellType::List);
    }

    #[test]
    fn test_allocation_point_restores_speculative_work() {
        let mut h = Heap::create(small_params()).unwrap();
        let free = h.first_generation_free_words();
        let ap = h.allocation_point();
        h.allocate(8, CellType::WordVector);
        h.allocate(3, CellType::List);
        h.restore_allocation_point(ap);
        assert_eq!(h.first_generation_free_words(), free);
    }

    #[test]
    fn test_roots_start_null_and_round_trip() {
        let mut h = Heap::create(small_params()).unwrap();
        assert!(h.all_roots_null());
        h.set_root_word(RootId::HighestThreadId, 7);
        assert_eq!(h.root_word(RootId::HighestThreadId), 7);
        let p = h.allocate(3, CellType::List);
        h.set_root_ptr(RootId::Test1, p);
        assert_eq!(h.root_ptr(RootId::Test1), p);
        h.set_root_ptr_vec(RootId::Contexts, 2, p);
        assert_eq!(h.root_ptr_vec(RootId::Contexts, 2), p);
        assert!(!h.all_roots_null());
    }

    #[test]
    fn test_external_root_lifecycle() {
        let mut h = Heap::create(small_params()).unwrap();
        let p = h.allocate(3, CellType::List);
        let r = h.external_root_init(p);
        assert_eq!(h.external_root_ref(&r), p);
        let q = h.allocate(3, CellType::List);
        h.external_root_assign(&r, q);
        assert_eq!(h.external_root_ref(&r), q);
        h.external_root_uninit(r);
        let r2 = h.external_root_init(q);
        h.external_root_uninit(r2);
    }

    #[test]
    #[should_panic]
    fn test_external_root_use_after_uninit_is_fatal() {
        let mut h = Heap::create(small_params()).unwrap();
        let p = h.allocate(3, CellType::List);
        let r = h.external_root_init(p);
        let stale = ExternalRoot { index: r.index };
        h.external_root_uninit(r);
        h.external_root_ref(&stale);
    }

    #[test]
    fn test_cell_copy_is_bitwise() {
        let mut h = Heap::create(small_params()).unwrap();
        let p = h.allocate(4, CellType::WordVector);
        let p0 = h.word(p);
        h.set_word(p, p0 | 3);
        h.set_word_at(p, 1, 10);
        h.set_word_at(p, 2, 20);
        h.set_word_at(p, 3, 30);
        let q = h.cell_copy(p);
        for i in 0..4 {
            assert_eq!(h.word_at(p, i), h.word_at(q, i));
        }
    }
}
