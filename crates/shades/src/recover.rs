//! Recovery - Rebuilding the Heap From the Disk Image
//!
//! Recovery reopens the backing file, picks the newest valid root block
//! by timestamp among the two root slots (magic, version and checksum
//! validated), loads every mature page the reconstructed pinfo chain
//! references at its recorded memory position, and starts an empty first
//! generation. Pointers are heap-relative words, so loading a page at its
//! recorded page number is all the rebasing there is.
//!
//! No user code runs during recovery. Afterwards the recovered VM
//! register set is visible through the `suspended_*` roots; the VM entry
//! point checks those to decide whether to resume a suspended thread.

use rustc_hash::FxHashSet;

use crate::cell::CellType;
use crate::config::Params;
use crate::disk::DiskImage;
use crate::error::{Result, ShadesError};
use crate::gc::region_checksum;
use crate::heap::{compute_geometry, Generation, Heap, PageInfo};
use crate::root::{
    self, RootId, ROOT_FORMAT_VERSION, ROOT_MAGIC, RH_CHECKSUM, RH_DB_SIZE,
    RH_FIRST_GENERATION_SIZE, RH_MAGIC, RH_NUM_ROOT_SLOTS, RH_PAGE_SIZE, RH_ROOT_REGION_WORDS,
    RH_TIMESTAMP, RH_VERSION,
};
use crate::word::{Ptr, Word};

/// Create a new empty database.
pub fn create_db(params: Params) -> Result<Heap> {
    let heap = Heap::create(params)?;
    log::info!(
        "created database: {} data pages of {} bytes, {} byte first generation",
        heap.num_data_pages,
        heap.params.page_size,
        heap.params.first_generation_size
    );
    Ok(heap)
}

/// Recover an existing database from its disk image.
///
/// Fails with [`ShadesError::NoValidRoot`] when neither root slot holds a
/// valid root block; the caller may then offer `create_db` instead.
pub fn recover_db(params: Params) -> Result<Heap> {
    params
        .validate()
        .map_err(|e| ShadesError::Configuration(e.to_string()))?;
    if params.disk_filename.is_empty() {
        return Err(ShadesError::Configuration(
            "recovery requires disk_filename".to_string(),
        ));
    }
    let geo = compute_geometry(&params)?;
    let region_words = geo.root_region_words;
    let mut disk = DiskImage::open(&params, region_words * 4)?;

    // Pick the newest valid root block.
    let mut best: Option<(Word, Vec<Word>)> = None;
    for slot in 0..2 {
        let mut buf = vec![0 as Word; region_words];
        disk.read_root_slot(slot, &mut buf);
        match validate_root_region(&buf) {
            Ok(timestamp) => {
                if params.root_search_is_verbose {
                    log::info!("root slot {slot} is valid with timestamp {timestamp}");
                }
                if best.as_ref().map_or(true, |(t, _)| timestamp > *t) {
                    best = Some((timestamp, buf));
                }
            }
            Err(reason) => {
                if params.root_search_is_verbose {
                    log::info!("root slot {slot} rejected: {reason}");
                }
            }
        }
    }
    let (timestamp, region) = best.ok_or(ShadesError::NoValidRoot)?;
    if params.root_timestamp_is_displayed {
        log::info!("recovering from root block with timestamp {timestamp}");
    }

    check_geometry(&params, region_words, &region)?;

    let mut heap = Heap::from_parts(params, geo, None);
    heap.words[..region_words].copy_from_slice(&region);
    heap.batch_number = timestamp;

    // Rebuild the mature generations from the pinfo chain, newest first.
    let mut in_use: FxHashSet<u32> = FxHashSet::default();
    let mut max_gen: Word = 0;
    let mut chain = heap.root_word(RootId::Generations);
    while chain != 0 {
        let p = Ptr::from_word(chain);
        if p.word_index() >= region_words || heap.type_of(p) != CellType::GenerationPinfo {
            return Err(ShadesError::RecoveryMismatch(
                "generation list leads outside the root region".to_string(),
            ));
        }
        let npages = (heap.word(p) & 0xFFF) as usize;
        let number = heap.word_at(p, 2);
        max_gen = max_gen.max(number);
        let mut pages = Vec::with_capacity(npages);
        let mut fills = Vec::with_capacity(npages);
        for i in 0..npages {
            let mem_page = heap.word_at(p, 4 + 2 * i);
            let disk_page = heap.word_at(p, 4 + 2 * i + 1);
            if mem_page as usize >= heap.num_data_pages {
                return Err(ShadesError::RecoveryMismatch(format!(
                    "generation {number} references memory page {mem_page} beyond the pool"
                )));
            }
            let start = heap.page_start_w(mem_page);
            let page_words = heap.page_words;
            disk.read_data_page(disk_page, &mut heap.words[start..start + page_words]);
            in_use.insert(disk_page);
            heap.pages[mem_page as usize] = PageInfo {
                owner: Some(number),
                disk_page: Some(disk_page),
                dirty: false,
            };
            pages.push(mem_page);
        }
        for &page in &pages {
            fills.push(scan_page_fill(&heap, page));
        }
        let live_words = fills.iter().map(|&f| f as usize).sum();
        heap.generations.push(Generation {
            number,
            pages,
            fills,
            live_words,
            shrinkage: 0.5,
        });
        chain = heap.word_at(p, 1);
    }

    disk.remove_from_free(&in_use);
    heap.free_pages = (0..heap.num_data_pages as u32)
        .rev()
        .filter(|&p| heap.pages[p as usize].owner.is_none())
        .collect();
    heap.next_generation_number = max_gen + 1;
    heap.disk = Some(disk);

    log::info!(
        "recovered database: timestamp {}, {} generation(s), {} pages live",
        timestamp,
        heap.generations.len(),
        heap.pages.iter().filter(|p| p.owner.is_some()).count()
    );
    Ok(heap)
}

fn validate_root_region(buf: &[Word]) -> std::result::Result<Word, &'static str> {
    if buf[RH_MAGIC] != ROOT_MAGIC {
        return Err("bad magic");
    }
    if buf[RH_VERSION] != ROOT_FORMAT_VERSION {
        return Err("unknown format version");
    }
    if buf[RH_TIMESTAMP] == 0 {
        return Err("never written");
    }
    if region_checksum(buf) != buf[RH_CHECKSUM] {
        return Err("checksum mismatch");
    }
    Ok(buf[RH_TIMESTAMP])
}

fn check_geometry(params: &Params, region_words: usize, buf: &[Word]) -> Result<()> {
    let expect = [
        (RH_PAGE_SIZE, params.page_size as Word, "page_size"),
        (RH_DB_SIZE, params.db_size as Word, "db_size"),
        (
            RH_FIRST_GENERATION_SIZE,
            params.first_generation_size as Word,
            "first_generation_size",
        ),
        (
            RH_ROOT_REGION_WORDS,
            region_words as Word,
            "root region size",
        ),
        (
            RH_NUM_ROOT_SLOTS,
            root::num_root_slots() as Word,
            "root slot count",
        ),
    ];
    for (idx, want, what) in expect {
        if buf[idx] != want {
            return Err(ShadesError::RecoveryMismatch(format!(
                "{what} is {} on disk but {want} in the configuration",
                buf[idx]
            )));
        }
    }
    Ok(())
}

/// Derive how many words of a recovered page hold cells: cells are packed
/// from the page start and the remainder is zeroed, so the first zero
/// header ends the page.
fn scan_page_fill(heap: &Heap, page: u32) -> u32 {
    let start = heap.page_start_w(page);
    let mut off = 0usize;
    while off < heap.page_words {
        let header = heap.words[start + off];
        if header >> 24 == 0 {
            break;
        }
        off += heap.size_of(Ptr::from_word_index(start + off));
    }
    off as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::{signed_to_tagged, NULL_PTR};

    fn disk_params(dir: &tempfile::TempDir) -> Params {
        let mut p = Params::default();
        p.db_size = 512 * 1024;
        p.first_generation_size = 64 * 1024;
        p.disk_filesize = 8 * 1024 * 1024;
        p.disk_skip_nbytes = 8 * 1024;
        p.disk_filename = dir.path().join("image").to_str().unwrap().to_string();
        p
    }

    #[test]
    fn test_recover_without_commit_finds_no_root() {
        let dir = tempfile::tempdir().unwrap();
        let params = disk_params(&dir);
        let _heap = create_db(params.clone()).unwrap();
        match recover_db(params) {
            Err(ShadesError::NoValidRoot) => {}
            other => panic!("expected NoValidRoot, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let params = disk_params(&dir);
        let mut heap = create_db(params.clone()).unwrap();
        heap.flush_batch().unwrap();
        drop(heap);

        let len = std::fs::metadata(&params.disk_filename).unwrap().len();
        assert!(len.is_multiple_of(params.page_size as u64));

        let heap = recover_db(params).unwrap();
        assert!(heap.all_roots_null());
        assert_eq!(heap.number_of_generations(), 0);
    }

    #[test]
    fn test_data_survives_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let params = disk_params(&dir);
        let mut heap = create_db(params.clone()).unwrap();
        let cell = heap.allocate(3, CellType::List);
        heap.set_word_at(cell, 1, signed_to_tagged(1234));
        heap.set_word_at(cell, 2, NULL_PTR.to_word());
        heap.set_root_ptr(RootId::Test1, cell);
        heap.flush_batch().unwrap();
        let batch = heap.batch_number();
        drop(heap);

        let heap = recover_db(params).unwrap();
        assert_eq!(heap.batch_number(), batch);
        let p = heap.root_ptr(RootId::Test1);
        assert_eq!(heap.type_of(p), CellType::List);
        assert_eq!(heap.word_at(p, 1), signed_to_tagged(1234));
        assert_eq!(heap.number_of_generations(), 1);
    }

    #[test]
    fn test_recovery_rejects_geometry_change() {
        let dir = tempfile::tempdir().unwrap();
        let params = disk_params(&dir);
        let mut heap = create_db(params.clone()).unwrap();
        heap.flush_batch().unwrap();
        drop(heap);

        let mut changed = params.clone();
        changed.first_generation_size = 128 * 1024;
        match recover_db(changed) {
            Err(ShadesError::RecoveryMismatch(_)) | Err(ShadesError::NoValidRoot) => {}
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_latest_timestamp_wins() {
        let dir = tempfile::tempdir().unwrap();
        let params = disk_params(&dir);
        let mut heap = create_db(params.clone()).unwrap();
        let a = heap.allocate(3, CellType::List);
        heap.set_word_at(a, 1, signed_to_tagged(1));
        heap.set_root_ptr(RootId::Test1, a);
        heap.flush_batch().unwrap();
        // Second commit lands in the other root slot with a newer value.
        let p = heap.root_ptr(RootId::Test1);
        let b = heap.allocate(3, CellType::List);
        heap.set_word_at(b, 1, signed_to_tagged(2));
        heap.set_word_at(b, 2, p.to_word());
        heap.set_root_ptr(RootId::Test1, b);
        heap.flush_batch().unwrap();
        drop(heap);

        let heap = recover_db(params).unwrap();
        let r = heap.root_ptr(RootId::Test1);
        assert_eq!(heap.word_at(r, 1), signed_to_tagged(2));
    }
}
