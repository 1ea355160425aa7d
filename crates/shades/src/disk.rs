//! Disk Image - The Memory-Mapped Backing File
//!
//! A fixed-size file divided into pages of the configured page size:
//!
//! ```text
//! ┌───────────────┬─────────────┬─────────────┬────────────────────────┐
//! │ skipped head  │ root slot A │ root slot B │ data pages             │
//! │ (partition    │ (one root   │ (alternate  │ allocated freely,      │
//! │  table safety)│  region)    │  commit)    │ positions in pinfo     │
//! └───────────────┴─────────────┴─────────────┴────────────────────────┘
//! ```
//!
//! Commits write dirty data pages first, flush them, then write the whole
//! root region into the slot for the batch's parity and flush that, so a
//! torn write can never expose a root that references unwritten pages.
//! Recovery reads both root slots and picks the one with the higher
//! timestamp that passes the header checksum.
//!
//! A data page freed during commit N may still be referenced by the
//! previous durable root, so its disk page becomes reusable only after
//! commit N's root write completes; the heap keeps those in a deferred
//! list and returns them here afterwards.

use std::fs::OpenOptions;

use memmap2::MmapMut;

use crate::config::Params;
use crate::error::{Result, ShadesError};
use crate::word::Word;

#[derive(Debug)]
pub struct DiskImage {
    map: MmapMut,
    page_bytes: usize,
    skip_pages: usize,
    /// Pages per root slot (the root region size).
    root_slot_pages: usize,
    num_data_pages: usize,
    /// Free disk data pages.
    free: Vec<u32>,
}

fn io_err(operation: &'static str) -> impl FnOnce(std::io::Error) -> ShadesError {
    move |source| ShadesError::DiskIo { operation, source }
}

impl DiskImage {
    /// Create (or truncate) the backing file for a fresh database.
    pub fn create(params: &Params, root_region_bytes: usize) -> Result<DiskImage> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&params.disk_filename)
            .map_err(io_err("create"))?;
        let layout = Layout::of(params, root_region_bytes)?;
        file.set_len(layout.total_bytes as u64)
            .map_err(io_err("set_len"))?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err("mmap"))?;
        Ok(DiskImage {
            map,
            page_bytes: params.page_size,
            skip_pages: layout.skip_pages,
            root_slot_pages: layout.root_slot_pages,
            num_data_pages: layout.num_data_pages,
            free: (0..layout.num_data_pages as u32).rev().collect(),
        })
    }

    /// Reopen an existing backing file for recovery. The free list starts
    /// full; recovery re-marks the pages the chosen root references.
    pub fn open(params: &Params, root_region_bytes: usize) -> Result<DiskImage> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&params.disk_filename)
            .map_err(io_err("open"))?;
        let layout = Layout::of(params, root_region_bytes)?;
        let actual = file.metadata().map_err(io_err("stat"))?.len();
        if actual != layout.total_bytes as u64 {
            return Err(ShadesError::RecoveryMismatch(format!(
                "disk image is {actual} bytes, configuration implies {}",
                layout.total_bytes
            )));
        }
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err("mmap"))?;
        Ok(DiskImage {
            map,
            page_bytes: params.page_size,
            skip_pages: layout.skip_pages,
            root_slot_pages: layout.root_slot_pages,
            num_data_pages: layout.num_data_pages,
            free: (0..layout.num_data_pages as u32).rev().collect(),
        })
    }

    // === Disk page allocation ===

    pub fn alloc_page(&mut self) -> Result<u32> {
        self.free.pop().ok_or(ShadesError::DiskFull)
    }

    pub fn free_page(&mut self, dp: u32) {
        debug_assert!((dp as usize) < self.num_data_pages);
        self.free.push(dp);
    }

    /// Remove every page a recovered root references from the free pool.
    pub fn remove_from_free(&mut self, in_use: &rustc_hash::FxHashSet<u32>) {
        self.free.retain(|p| !in_use.contains(p));
    }

    pub fn num_data_pages(&self) -> usize {
        self.num_data_pages
    }

    // === Page I/O ===

    fn data_offset(&self, dp: u32) -> usize {
        debug_assert!((dp as usize) < self.num_data_pages);
        (self.skip_pages + 2 * self.root_slot_pages + dp as usize) * self.page_bytes
    }

    fn root_offset(&self, slot: usize) -> usize {
        debug_assert!(slot < 2);
        (self.skip_pages + slot * self.root_slot_pages) * self.page_bytes
    }

    pub fn write_data_page(&mut self, dp: u32, words: &[Word]) {
        debug_assert_eq!(words.len() * 4, self.page_bytes);
        let off = self.data_offset(dp);
        write_words(&mut self.map[off..off + self.page_bytes], words);
    }

    pub fn read_data_page(&self, dp: u32, words: &mut [Word]) {
        debug_assert_eq!(words.len() * 4, self.page_bytes);
        let off = self.data_offset(dp);
        read_words(&self.map[off..off + self.page_bytes], words);
    }

    /// Flush all data page writes of this commit to stable storage.
    pub fn flush_data(&self) -> Result<()> {
        self.map.flush().map_err(io_err("flush data pages"))
    }

    /// Write one root slot and flush it. Called after `flush_data`, which
    /// is what makes the root block the commit point.
    pub fn write_root_slot(&mut self, slot: usize, words: &[Word]) -> Result<()> {
        debug_assert_eq!(words.len(), self.root_slot_pages * self.page_bytes / 4);
        let off = self.root_offset(slot);
        let len = words.len() * 4;
        write_words(&mut self.map[off..off + len], words);
        self.map
            .flush_range(off, len)
            .map_err(io_err("flush root block"))
    }

    pub fn read_root_slot(&self, slot: usize, words: &mut [Word]) {
        debug_assert_eq!(words.len(), self.root_slot_pages * self.page_bytes / 4);
        let off = self.root_offset(slot);
        read_words(&self.map[off..off + words.len() * 4], words);
    }
}

struct Layout {
    skip_pages: usize,
    root_slot_pages: usize,
    num_data_pages: usize,
    total_bytes: usize,
}

impl Layout {
    fn of(params: &Params, root_region_bytes: usize) -> Result<Layout> {
        let page = params.page_size;
        let skip_pages = params.disk_skip_nbytes.div_ceil(page);
        let root_slot_pages = root_region_bytes / page;
        debug_assert!(root_region_bytes.is_multiple_of(page));
        let total_pages = params.disk_filesize / page;
        let overhead = skip_pages + 2 * root_slot_pages;
        if total_pages <= overhead {
            return Err(ShadesError::Configuration(format!(
                "disk_filesize of {} pages cannot hold {} overhead pages",
                total_pages, overhead
            )));
        }
        let num_data_pages = total_pages - overhead;
        Ok(Layout {
            skip_pages,
            root_slot_pages,
            num_data_pages,
            total_bytes: total_pages * page,
        })
    }
}

fn write_words(dst: &mut [u8], words: &[Word]) {
    for (chunk, w) in dst.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
}

fn read_words(src: &[u8], words: &mut [Word]) {
    for (chunk, w) in src.chunks_exact(4).zip(words.iter_mut()) {
        *w = Word::from_le_bytes(chunk.try_into().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_params(dir: &tempfile::TempDir) -> Params {
        let mut p = Params::default();
        p.db_size = 256 * 1024;
        p.first_generation_size = 64 * 1024;
        p.disk_filesize = 4 * 1024 * 1024;
        p.disk_skip_nbytes = 8 * 1024;
        p.disk_filename = dir
            .path()
            .join("image")
            .to_str()
            .unwrap()
            .to_string();
        p
    }

    #[test]
    fn test_image_size_is_page_multiple() {
        let dir = tempfile::tempdir().unwrap();
        let p = disk_params(&dir);
        let _img = DiskImage::create(&p, 2 * p.page_size).unwrap();
        let len = std::fs::metadata(&p.disk_filename).unwrap().len();
        assert!(len.is_multiple_of(p.page_size as u64));
    }

    #[test]
    fn test_data_page_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let p = disk_params(&dir);
        let mut img = DiskImage::create(&p, 2 * p.page_size).unwrap();
        let n = p.page_size / 4;
        let page: Vec<Word> = (0..n as Word).map(|i| i.wrapping_mul(2654435761)).collect();
        let dp = img.alloc_page().unwrap();
        img.write_data_page(dp, &page);
        img.flush_data().unwrap();
        let mut back = vec![0; n];
        img.read_data_page(dp, &mut back);
        assert_eq!(page, back);
    }

    #[test]
    fn test_root_slots_are_independent(){
        let dir = tempfile::tempdir().unwrap();
        let p = disk_params(&dir);
        let root_words = 2 * p.page_size / 4;
        let mut img = DiskImage::create(&p, 2 * p.page_size).unwrap();
        let a: Vec<Word> = vec![0xAAAA_AAAA; root_words];
        let b: Vec<Word> = vec![0xBBBB_BBBB; root_words];
        img.write_root_slot(0, &a).unwrap();
        img.write_root_slot(1, &b).unwrap();
        let mut back = vec![0; root_words];
        img.read_root_slot(0, &mut back);
        assert_eq!(back, a);
        img.read_root_slot(1, &mut back);
        assert_eq!(back, b);
    }

    #[test]
    fn test_reopen_preserves_pages() {
        let dir = tempfile::tempdir().unwrap();
        let p = disk_params(&dir);
        let n = p.page_size / 4;
        let page: Vec<Word> = (0..n as Word).collect();
        let dp;
        {
            let mut img = DiskImage::create(&p, 2 * p.page_size).unwrap();
            dp = img.alloc_page().unwrap();
            img.write_data_page(dp, &page);
            img.flush_data().unwrap();
        }
        let img = DiskImage::open(&p, 2 * p.page_size).unwrap();
        let mut back = vec![0; n];
        img.read_data_page(dp, &mut back);
        assert_eq!(back, page);
    }
}
