//! Block Translation Table: single-block, power-fail atomic writes over a
//! byte-addressable namespace.
//!
//! The namespace itself only guarantees byte-level durability, so an
//! in-place block update can tear. The BTT never updates in place: every
//! external block address is translated through an on-media map to an
//! internal block, and a write goes to a free internal block which is then
//! swapped in via a logged, sequence-numbered commit. After any crash an
//! external block reads as its last fully committed contents.
//!
//! ```no_run
//! use btt::{Btt, BttConfig, MemNamespace};
//!
//! let ns = MemNamespace::new(32 << 20);
//! let btt = Btt::new(ns, BttConfig {
//!     rawsize: 32 << 20,
//!     lbasize: 512,
//!     parent_uuid: [0u8; 16],
//!     maxlane: 4,
//! }).unwrap();
//! let block = vec![0xABu8; 512];
//! btt.write(0, 7, &block).unwrap();
//! ```

#[macro_use]
extern crate log;

mod arena;
mod btt;
mod check;
mod cli;
mod error;
mod layout;
mod ns;
mod util;

pub use crate::btt::{Btt, BttConfig};
pub use crate::cli::*;
pub use crate::error::{BttError, Result};
pub use crate::layout::{
    split_arenas, ArenaGeometry, BttInfo, FlogEntry, LayoutParams, ALIGNMENT, ARENA_MAX,
    ARENA_MIN, BTT_SIG, DEFAULT_NFREE, FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN, INFO_ERROR_MASK,
    INFO_FLAG_ERROR, INFO_SIZE, INTERNAL_LBA_ALIGNMENT, MAJOR_VERSION, MAP_ENTRY_ERROR,
    MAP_ENTRY_SIZE, MAP_ENTRY_ZERO, MAP_LBA_MASK, MINOR_VERSION, MIN_LBA,
};
pub use crate::ns::{FileNamespace, MemNamespace, Namespace};
