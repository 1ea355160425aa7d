//! # Shades - A Persistent Main-Memory Database
//!
//! Shades keeps all data in one contiguous region of tagged cells
//! (small records of 32-bit words). Updates are non-destructive: every
//! mutation allocates fresh cells in a bump-allocated first generation,
//! so a logically consistent snapshot is always present. A group commit
//! promotes the survivors into page-structured mature generations,
//! optionally scavenges old generations by copying, and writes the
//! dirty pages plus the root block to a disk image from which recovery
//! can rebuild everything.
//!
//! User transactions are driven by a continuation-passing byte code
//! virtual machine whose allocation contract is what makes the
//! allocator's pre-flight check sound: every sequence declares its
//! maximum allocation, and the machine commits before entering a
//! sequence the current batch cannot hold.
//!
//! ## Quick start
//!
//! ```no_run
//! use shades::{create_db, Params, RootId};
//!
//! fn main() -> shades::Result<()> {
//!     let mut params = Params::default();
//!     params.disk_filename = "/tmp/shades.img".to_string();
//!     let mut heap = create_db(params)?;
//!
//!     // Build a little persistent structure and publish it.
//!     assert!(heap.can_allocate(shades::trie::TRIE_MAX_ALLOCATION + 3));
//!     let v = heap.allocate(3, shades::CellType::List);
//!     let root = shades::trie::trie_insert(
//!         &mut heap,
//!         shades::NULL_PTR,
//!         42,
//!         v.to_word(),
//!     );
//!     heap.set_root_ptr(RootId::Test1, root);
//!     heap.flush_batch()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cell`]: the cell model and tag registry
//! - [`heap`]: the contiguous region, allocator and external roots
//! - [`gc`]: the group-commit engine and collection policy
//! - [`recover`]: create and recovery entry points
//! - [`disk`]: the memory-mapped disk image
//! - [`root`]: the root block layout
//! - [`trie`], [`queue`], [`shtring`]: the persistent structures the
//!   core itself consumes
//! - [`vm`]: the byte code interpreter, loader, caches and network
//!   driver
//! - [`config`]: parameters, their file/env/CLI layering
//! - [`stats`]: execution counters

pub mod cell;
pub mod config;
pub mod disk;
pub mod error;
pub mod gc;
pub mod heap;
pub mod queue;
pub mod recover;
pub mod root;
pub mod shtring;
pub mod stats;
pub mod trie;
pub mod vm;
pub mod word;

pub use cell::{CellType, SlotKind, WordType};
pub use config::Params;
pub use error::{Result, ShadesError};
pub use heap::{AllocationPoint, ExternalRoot, Heap};
pub use recover::{create_db, recover_db};
pub use root::{RootId, NUMBER_OF_CONTEXT_PRIORITIES};
pub use stats::Stats;
pub use vm::{interp, load_bcode, Insn, NetDriver, Vm};
pub use word::{
    signed_to_tagged, tagged_to_signed, Ptr, Word, NULL_PTR, NULL_WORD, TAGGED_FALSE, TAGGED_TRUE,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
