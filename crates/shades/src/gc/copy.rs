//! Copying Collector - Cheney Copy Into Mature Pages
//!
//! One `Copier` drives one copy pass: promotion of first-generation
//! survivors at every commit, and mature-generation scavenging when the
//! policy asks for it. The from-space test is the only difference between
//! the two.
//!
//! Copied cells land in freshly taken pages of the destination
//! generation, in allocation order; the breadth-first scan walks those
//! same pages behind the allocation point until it catches up. A cell
//! never spans a page: when the remainder of the current page is too
//! small the page is closed and the remainder stays zeroed, which is also
//! what lets recovery re-derive page fills by scanning for the first zero
//! header.
//!
//! Every moved cell leaves a `forward_pointer` behind; a second visit to
//! the same cell resolves through it, which is what makes shared
//! structure and cycles copy correctly.

use rustc_hash::FxHashSet;

use crate::cell::{make_header, CellType, SlotKind, WordType};
use crate::error::{Result, ShadesError};
use crate::heap::{Generation, Heap};
use crate::root::{self, RootId};
use crate::word::{Ptr, Word, NULL_PTR};

/// Which cells this pass relocates.
pub(crate) enum FromSpace {
    /// Every cell in the first generation.
    FirstGen,
    /// Every cell in a page owned by one of these generation numbers.
    Victims(FxHashSet<Word>),
}

pub(crate) struct Copier {
    gen_number: Word,
    from: FromSpace,
    /// Destination pages in allocation order, with per-page fills. The
    /// last fill is the current allocation point.
    pages: Vec<u32>,
    fills: Vec<u32>,
    scan_page: usize,
    scan_off: usize,
    pub words_copied: usize,
}

impl Copier {
    pub fn new(gen_number: Word, from: FromSpace) -> Copier {
        Copier {
            gen_number,
            from,
            pages: Vec::new(),
            fills: Vec::new(),
            scan_page: 0,
            scan_off: 0,
            words_copied: 0,
        }
    }

    fn in_from_space(&self, heap: &Heap, p: Ptr) -> bool {
        match &self.from {
            FromSpace::FirstGen => heap.is_in_first_generation(p),
            FromSpace::Victims(numbers) => match heap.page_of_ptr(p) {
                Some(page) => match heap.pages[page as usize].owner {
                    Some(owner) => numbers.contains(&owner),
                    None => false,
                },
                None => false,
            },
        }
    }

    /// Take space for one cell in the destination generation.
    fn alloc(&mut self, heap: &mut Heap, n: usize) -> Result<Ptr> {
        debug_assert!(n < heap.page_words);
        let need_page = match self.fills.last() {
            Some(&fill) => heap.page_words - (fill as usize) < n,
            None => true,
        };
        if need_page {
            let page = heap
                .free_pages
                .pop()
                .ok_or(ShadesError::DatabaseFull {
                    generation: self.gen_number,
                })?;
            let start = heap.page_start_w(page);
            heap.words[start..start + heap.page_words].fill(0);
            let info = &mut heap.pages[page as usize];
            info.owner = Some(self.gen_number);
            info.dirty = true;
            self.pages.push(page);
            self.fills.push(0);
        }
        let page = *self.pages.last().unwrap();
        let fill = self.fills.last_mut().unwrap();
        let at = heap.page_start_w(page) + *fill as usize;
        *fill += n as u32;
        Ok(Ptr::from_word_index(at))
    }

    /// Copy the cell a pointer word designates, if it lies in from-space.
    ///
    /// Returns the word to store in the referring slot: unchanged when the
    /// target does not move, the forwarding target when it already moved,
    /// the fresh copy otherwise.
    pub fn copy(&mut self, heap: &mut Heap, w: Word) -> Result<Word> {
        if w == 0 {
            return Ok(0);
        }
        let p = Ptr::from_word(w);
        if !self.in_from_space(heap, p) {
            return Ok(w);
        }
        if heap.type_of(p) == CellType::ForwardPointer {
            return Ok(heap.word_at(p, 1));
        }
        let size = heap.size_of(p);
        let dst = self.alloc(heap, size)?;
        for i in 0..size {
            let word = heap.word_at(p, i);
            heap.set_word_at(dst, i, word);
        }
        heap.set_word(p, make_header(CellType::ForwardPointer, 0));
        heap.set_word_at(p, 1, dst.to_word());
        self.words_copied += size;
        Ok(dst.to_word())
    }

    /// Patch one pointer-bearing slot of `cell` through this copier.
    fn patch_slot(
        &mut self,
        heap: &mut Heap,
        cell: Ptr,
        kind: SlotKind,
        off: usize,
    ) -> Result<bool> {
        let w = heap.word_at(cell, off);
        let is_pointer = match kind {
            SlotKind::Word => false,
            SlotKind::Ptr | SlotKind::NonNullPtr => true,
            SlotKind::Tagged => w != 0 && w & 3 == 0,
        };
        if !is_pointer || w == 0 {
            return Ok(false);
        }
        let nw = self.copy(heap, w)?;
        if nw != w {
            heap.set_word_at(cell, off, nw);
            return Ok(true);
        }
        Ok(false)
    }

    /// Run the breadth-first scan until it catches up with allocation.
    pub fn scan(&mut self, heap: &mut Heap) -> Result<()> {
        let mut slots: Vec<(SlotKind, usize)> = Vec::with_capacity(64);
        while self.scan_page < self.pages.len() {
            let fill = self.fills[self.scan_page] as usize;
            if self.scan_off >= fill {
                if self.scan_page + 1 == self.pages.len() {
                    break;
                }
                self.scan_page += 1;
                self.scan_off = 0;
                continue;
            }
            let cell =
                Ptr::from_word_index(heap.page_start_w(self.pages[self.scan_page]) + self.scan_off);
            let size = heap.size_of(cell);
            slots.clear();
            heap.walk(cell, &mut |k, i| slots.push((k, i)));
            for i in 0..slots.len() {
                let (kind, off) = slots[i];
                self.patch_slot(heap, cell, kind, off)?;
            }
            self.scan_off += size;
        }
        Ok(())
    }

    /// Close the pass and hand back the destination generation, if any
    /// cell was copied.
    pub fn finish(self, _heap: &Heap) -> Option<Generation> {
        if self.pages.is_empty() {
            return None;
        }
        let live_words = self.fills.iter().map(|&f| f as usize).sum();
        Some(Generation {
            number: self.gen_number,
            pages: self.pages,
            fills: self.fills,
            live_words,
            shrinkage: 0.5,
        })
    }
}

/// Copy and patch every member of the root set: the named root slots, the
/// suspended accumulator (whose kind the `SuspendedAccuType` root
/// declares), and every active externally-rooted pointer.
///
/// The `generations` root is cleared first: the pinfo chain is rebuilt by
/// the commit engine after copying, so the stale chain must not be
/// treated as live data.
pub(crate) fn copy_roots(heap: &mut Heap, copier: &mut Copier) -> Result<()> {
    heap.set_root_ptr(RootId::Generations, NULL_PTR);

    for slot in 0..root::num_root_slots() {
        if root::slot_kind(slot) == Some(root::RootKind::Ptr) {
            let w = heap.root_slot_word(slot).unwrap();
            let nw = copier.copy(heap, w)?;
            heap.set_root_slot_word(slot, nw);
        }
    }

    let accu_type = WordType::from_word(heap.root_word(RootId::SuspendedAccuType));
    let accu = heap.root_word(RootId::SuspendedAccu);
    let accu_is_pointer = match accu_type {
        WordType::Ptr | WordType::NonNullPtr => true,
        WordType::Tagged => accu != 0 && accu & 3 == 0,
        WordType::Word | WordType::Void => false,
    };
    if accu_is_pointer {
        let nw = copier.copy(heap, accu)?;
        heap.set_root_word(RootId::SuspendedAccu, nw);
    }

    for i in 0..heap.external_roots.len() {
        if let Some(w) = heap.external_roots[i] {
            let nw = copier.copy(heap, w)?;
            heap.external_roots[i] = Some(nw);
        }
    }
    Ok(())
}

/// Patch every pointer in one committed page that leads into the
/// copier's from-space. Returns true when the page was modified (it must
/// then be rewritten to disk).
pub(crate) fn patch_page(
    heap: &mut Heap,
    copier: &mut Copier,
    page: u32,
    fill: u32,
) -> Result<bool> {
    let mut slots: Vec<(SlotKind, usize)> = Vec::with_capacity(64);
    let mut changed = false;
    let mut off = 0usize;
    while off < fill as usize {
        let cell = Ptr::from_word_index(heap.page_start_w(page) + off);
        let size = heap.size_of(cell);
        slots.clear();
        heap.walk(cell, &mut |k, i| slots.push((k, i)));
        for i in 0..slots.len() {
            let (kind, soff) = slots[i];
            changed |= copier.patch_slot(heap, cell, kind, soff)?;
        }
        off += size;
    }
    if changed {
        heap.pages[page as usize].dirty = true;
    }
    Ok(changed)
}
