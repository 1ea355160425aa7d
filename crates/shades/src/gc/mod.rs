//! Group Commit - Promotion, Mature Collection and the Durable Write
//!
//! A commit runs at a GC-safe point (the VM between byte code sequences,
//! or a host caller wanting to publish state). Steps, in order:
//!
//! 1. VM registers were snapshotted into the `suspended_*` roots by the
//!    caller.
//! 2. First-generation survivors are Cheney-copied into fresh pages of a
//!    new mature generation, leaving forward pointers behind.
//! 3. Under policy, an adjacent run of mature generations is scavenged
//!    into a successor generation that takes the run's place in the
//!    generation order, with newer pages patched in place.
//! 4. All roots and all slots of moved cells now hold patched pointers.
//! 5. Dirty pages get fresh disk pages and are written, data first, the
//!    root block last; the root block's timestamp identifies the newest
//!    durable state on recovery. Disk pages freed here become reusable
//!    only after that root write.
//! 6. The first-generation bump pointer resets and the batch advances.
//!
//! After a commit no cell in any mature generation references the first
//! generation, the root block is coherent with the mature heap, and the
//! disk image contains both.

mod copy;
mod policy;

pub(crate) use copy::{copy_roots, patch_page, Copier, FromSpace};
pub(crate) use policy::{choose_victims, CommitMode, VictimPlan};

use rustc_hash::FxHashSet;

use crate::cell::{make_header, CellType};
use crate::error::{Result, ShadesError};
use crate::heap::Heap;
use crate::root::{self, RootId, RH_CHECKSUM, RH_PINFO_USED, RH_TIMESTAMP, ROOT_SLOTS_BASE};
use crate::word::{Ptr, Word};

/// A generation_pinfo may describe at most this many pages (12 bits in
/// the header).
pub const MAX_GENERATION_PAGES: usize = 0xFFF;

/// Checksum over the root region with the checksum slot itself zeroed.
pub(crate) fn region_checksum(words: &[Word]) -> Word {
    let mut sum: Word = 0x811C_9DC5;
    for (i, &w) in words.iter().enumerate() {
        let w = if i == RH_CHECKSUM { 0 } else { w };
        sum = (sum ^ w).wrapping_mul(0x0100_0193);
    }
    sum
}

impl Heap {
    /// Finish the current commit batch and start a new one.
    ///
    /// Moves data: host-side pointers must be re-read from the root block
    /// or held in externally-rooted slots.
    pub fn flush_batch(&mut self) -> Result<()> {
        self.commit(CommitMode::Normal)
    }

    /// Opportunistic collection for the VM's idle loop. Commits only when
    /// the policy finds a generation worth collecting; returns whether it
    /// did.
    pub fn maybe_idle_collect(&mut self) -> Result<bool> {
        if choose_victims(self, CommitMode::Idle).is_some() {
            self.commit(CommitMode::Idle)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub(crate) fn commit(&mut self, mode: CommitMode) -> Result<()> {
        let fg_used = self.fg_end_w - self.fg_alloc_w;
        log::debug!(
            "commit {} starting: {} first-generation words used, {} generations, {} free pages",
            self.batch_number + 1,
            fg_used,
            self.generations.len(),
            self.free_pages.len()
        );

        // Step 2: promote first-generation survivors.
        let gen_no = self.next_generation_number;
        self.next_generation_number += 1;
        let mut copier = Copier::new(gen_no, FromSpace::FirstGen);
        copy_roots(self, &mut copier)?;
        copier.scan(self)?;
        self.stats.words_promoted += copier.words_copied as u64;
        let promoted = copier.words_copied;
        if let Some(gen) = copier.finish(self) {
            self.generations.insert(0, gen);
        }

        // Step 3: mature collection under policy.
        if let Some(plan) = choose_victims(self, mode) {
            self.collect_mature(plan)?;
        }

        // Steps 4-5: assign disk pages, rebuild the durable generation
        // list, write everything out.
        self.assign_disk_pages()?;
        self.rebuild_pinfo()?;
        self.write_commit()?;

        // Step 6: new batch.
        self.fg_alloc_w = self.fg_end_w;
        self.stats.commits += 1;
        log::debug!(
            "commit {} done: {} words promoted, {} generations, {} free pages",
            self.batch_number,
            promoted,
            self.generations.len(),
            self.free_pages.len()
        );
        Ok(())
    }

    /// Scavenge the adjacent victim run `[plan.start, plan.end)` of the
    /// newest-first generation list into a successor generation at the
    /// same position.
    ///
    /// References into the run can come only from the roots and from
    /// generations newer than it (cells never point at generations
    /// younger than themselves), so those are the only pages scanned.
    fn collect_mature(&mut self, plan: VictimPlan) -> Result<()> {
        let victim_numbers: FxHashSet<Word> = self.generations[plan.start..plan.end]
            .iter()
            .map(|g| g.number)
            .collect();
        let in_words: usize = self.generations[plan.start..plan.end]
            .iter()
            .map(|g| g.live_words)
            .sum();
        log::info!(
            "collecting {} mature generation(s) holding {} pages",
            plan.end - plan.start,
            self.generations[plan.start..plan.end]
                .iter()
                .map(|g| g.pages.len())
                .sum::<usize>(),
        );

        let gen_no = self.next_generation_number;
        self.next_generation_number += 1;
        let mut copier = Copier::new(gen_no, FromSpace::Victims(victim_numbers));
        copy_roots(self, &mut copier)?;
        copier.scan(self)?;
        let newer: Vec<(u32, u32)> = self.generations[..plan.start]
            .iter()
            .flat_map(|g| g.pages.iter().copied().zip(g.fills.iter().copied()))
            .collect();
        for (page, fill) in newer {
            patch_page(self, &mut copier, page, fill)?;
        }
        copier.scan(self)?;

        let out_words = copier.words_copied;
        self.stats.words_collected += out_words as u64;
        self.stats.generations_collected += (plan.end - plan.start) as u64;

        let victims: Vec<_> = self.generations.drain(plan.start..plan.end).collect();
        for gen in victims {
            for page in gen.pages {
                let info = &mut self.pages[page as usize];
                if let Some(dp) = info.disk_page.take() {
                    self.deferred_disk_free.push(dp);
                }
                info.owner = None;
                info.dirty = false;
                self.free_pages.push(page);
            }
        }
        if let Some(mut gen) = copier.finish(self) {
            gen.shrinkage = out_words as f64 / in_words.max(1) as f64;
            self.generations.insert(plan.start, gen);
        }
        Ok(())
    }

    /// Give every dirty page a fresh disk page. The page it previously
    /// occupied may still be referenced by the last durable root, so it
    /// goes to the deferred list instead of straight back to the pool.
    fn assign_disk_pages(&mut self) -> Result<()> {
        let Some(disk) = self.disk.as_mut() else {
            return Ok(());
        };
        for info in self.pages.iter_mut() {
            if info.dirty && info.owner.is_some() {
                if let Some(old) = info.disk_page.take() {
                    self.deferred_disk_free.push(old);
                }
                info.disk_page = Some(disk.alloc_page()?);
            }
        }
        Ok(())
    }

    /// Rebuild the generation_pinfo chain in the root region's pinfo
    /// area, oldest generation first so each cell can link to its elder,
    /// and point the `generations` root at the newest.
    fn rebuild_pinfo(&mut self) -> Result<()> {
        let base = ROOT_SLOTS_BASE + root::num_root_slots();
        let mut off = base;
        let mut prev: Word = 0;
        for gi in (0..self.generations.len()).rev() {
            let npages = self.generations[gi].pages.len();
            if npages > MAX_GENERATION_PAGES {
                return Err(ShadesError::Internal(format!(
                    "generation of {npages} pages exceeds the pinfo limit"
                )));
            }
            let need = 4 + 2 * npages;
            if off + need > self.root_region_words {
                return Err(ShadesError::Internal(
                    "generation_pinfo area overflow".to_string(),
                ));
            }
            self.words[off] = make_header(CellType::GenerationPinfo, npages as Word);
            self.words[off + 1] = prev;
            self.words[off + 2] = self.generations[gi].number;
            self.words[off + 3] = 0;
            for i in 0..npages {
                let page = self.generations[gi].pages[i];
                self.words[off + 4 + 2 * i] = page;
                self.words[off + 4 + 2 * i + 1] =
                    self.pages[page as usize].disk_page.unwrap_or(0);
            }
            prev = Ptr::from_word_index(off).to_word();
            off += need;
        }
        // Zero the tail so a stale chain can never be misread.
        self.words[off..self.root_region_words].fill(0);
        self.words[RH_PINFO_USED] = (off - base) as Word;
        self.set_root_word(RootId::Generations, prev);
        Ok(())
    }

    /// Write dirty pages and the root block, then release deferred disk
    /// pages. A failure here is fatal: the in-memory state is already
    /// ahead of the disk image.
    fn write_commit(&mut self) -> Result<()> {
        self.batch_number += 1;
        self.words[RH_TIMESTAMP] = self.batch_number;

        if self.disk.is_none() {
            for info in self.pages.iter_mut() {
                info.dirty = false;
            }
            self.deferred_disk_free.clear();
            return Ok(());
        }

        let mut written = 0u64;
        for page in 0..self.num_data_pages {
            if !self.pages[page].dirty {
                continue;
            }
            let dp = self.pages[page]
                .disk_page
                .expect("dirty page without a disk page");
            let start = self.data_start_w + page * self.page_words;
            let disk = self.disk.as_mut().unwrap();
            disk.write_data_page(dp, &self.words[start..start + self.page_words]);
            self.pages[page].dirty = false;
            written += 1;
        }
        let disk = self.disk.as_mut().unwrap();
        disk.flush_data()?;

        self.words[RH_CHECKSUM] = 0;
        let sum = region_checksum(&self.words[..self.root_region_words]);
        self.words[RH_CHECKSUM] = sum;
        let slot = (self.batch_number % 2) as usize;
        let disk = self.disk.as_mut().unwrap();
        disk.write_root_slot(slot, &self.words[..self.root_region_words])?;

        if self.params.root_timestamp_is_displayed {
            log::info!("root block written with timestamp {}", self.batch_number);
        }
        self.stats.pages_written += written;
        self.stats.root_writes += 1;

        let disk = self.disk.as_mut().unwrap();
        for dp in self.deferred_disk_free.drain(..) {
            disk.free_page(dp);
        }
        Ok(())
    }
}
