//! On-media format: constants, the arena info block, flog entries, and the
//! geometry computation shared by the layout reader and writer.
//!
//! Everything on media is little-endian; runtime copies are host order.
//! Encoding happens at the last moment before a namespace write and decoding
//! immediately after a read.

use crate::error::{BttError, Result};
use crate::util::{fletcher64, round_up};

pub const BTT_SIG: &[u8; 16] = b"BTT_ARENA_INFO\0\0";
pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 1;

/// Hard cap on a single arena. Keeps `internal_nlba` within 30 bits.
pub const ARENA_MAX: u64 = 1 << 39; // 512 GiB
/// A trailing namespace remainder below this is wasted rather than made into
/// an arena.
pub const ARENA_MIN: u64 = 1 << 24; // 16 MiB
pub const ALIGNMENT: u64 = 4096;
/// The info block occupies one aligned unit at each end of the arena.
pub const INFO_SIZE: u64 = ALIGNMENT;
pub const FLOG_ENTRY_SIZE: u64 = 16;
pub const FLOG_PAIR_ALIGN: u64 = 64;
pub const INTERNAL_LBA_ALIGNMENT: u32 = 256;
pub const MIN_LBA: u32 = 512;
pub const DEFAULT_NFREE: u32 = 256;
pub const MAP_ENTRY_SIZE: u64 = 4;

pub const MAP_ENTRY_ERROR: u32 = 1 << 31;
pub const MAP_ENTRY_ZERO: u32 = 1 << 30;
pub const MAP_LBA_MASK: u32 = (1 << 30) - 1;
/// Idle rtt slot. In-flight slots hold a masked internal LBA, which fits in
/// 30 bits and so can never equal this.
pub const RTT_IDLE: u32 = MAP_ENTRY_ERROR | MAP_ENTRY_ZERO;

/// Info-block flag: the arena took an internal consistency fault and no
/// longer accepts writes.
pub const INFO_FLAG_ERROR: u32 = 1;
pub const INFO_ERROR_MASK: u32 = INFO_FLAG_ERROR;

/// Flog sequence numbers advance 1 -> 2 -> 3 -> 1; 0 marks an unwritten half.
pub const fn nseq(seq: u32) -> u32 {
    if seq == 3 {
        1
    } else {
        seq + 1
    }
}

/// The info fields serialize into the first 112 bytes of the block; the
/// rest is zero pad, still covered by the checksum.
const INFO_CSUM_OFF: usize = 104;

/// Arena info block, duplicated at the start and end of each arena.
/// Offsets stored here are arena-relative.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BttInfo {
    pub parent_uuid: [u8; 16],
    pub flags: u32,
    pub major: u16,
    pub minor: u16,
    pub external_lbasize: u32,
    pub external_nlba: u32,
    pub internal_lbasize: u32,
    pub internal_nlba: u32,
    pub nfree: u32,
    pub infosize: u32,
    pub nextoff: u64,
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
}

impl BttInfo {
    /// Serialize into a checksummed `INFO_SIZE` block.
    pub fn encode(&self) -> Vec<u8> {
        let mut b = vec![0u8; INFO_SIZE as usize];
        b[0..16].copy_from_slice(BTT_SIG);
        b[16..32].copy_from_slice(&self.parent_uuid);
        b[32..36].copy_from_slice(&self.flags.to_le_bytes());
        b[36..38].copy_from_slice(&self.major.to_le_bytes());
        b[38..40].copy_from_slice(&self.minor.to_le_bytes());
        b[40..44].copy_from_slice(&self.external_lbasize.to_le_bytes());
        b[44..48].copy_from_slice(&self.external_nlba.to_le_bytes());
        b[48..52].copy_from_slice(&self.internal_lbasize.to_le_bytes());
        b[52..56].copy_from_slice(&self.internal_nlba.to_le_bytes());
        b[56..60].copy_from_slice(&self.nfree.to_le_bytes());
        b[60..64].copy_from_slice(&self.infosize.to_le_bytes());
        b[64..72].copy_from_slice(&self.nextoff.to_le_bytes());
        b[72..80].copy_from_slice(&self.dataoff.to_le_bytes());
        b[80..88].copy_from_slice(&self.mapoff.to_le_bytes());
        b[88..96].copy_from_slice(&self.flogoff.to_le_bytes());
        b[96..104].copy_from_slice(&self.infooff.to_le_bytes());
        // Checksum last, over the whole block with the field still zero.
        let csum = fletcher64(&b);
        b[INFO_CSUM_OFF..INFO_CSUM_OFF + 8].copy_from_slice(&csum.to_le_bytes());
        b
    }

    /// Parse the fields of an `INFO_SIZE` block without validating them.
    pub fn decode(b: &[u8]) -> BttInfo {
        let u32_at = |off: usize| u32::from_le_bytes(b[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(b[off..off + 8].try_into().unwrap());
        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&b[16..32]);
        BttInfo {
            parent_uuid,
            flags: u32_at(32),
            major: u16::from_le_bytes(b[36..38].try_into().unwrap()),
            minor: u16::from_le_bytes(b[38..40].try_into().unwrap()),
            external_lbasize: u32_at(40),
            external_nlba: u32_at(44),
            internal_lbasize: u32_at(48),
            internal_nlba: u32_at(52),
            nfree: u32_at(56),
            infosize: u32_at(60),
            nextoff: u64_at(64),
            dataoff: u64_at(72),
            mapoff: u64_at(80),
            flogoff: u64_at(88),
            infooff: u64_at(96),
        }
    }

    /// Decode and validate signature, version and checksum. `None` means the
    /// block does not describe a btt arena.
    pub fn validate(b: &[u8]) -> Option<BttInfo> {
        if b.len() != INFO_SIZE as usize || &b[0..16] != BTT_SIG {
            return None;
        }
        let stored = u64::from_le_bytes(b[INFO_CSUM_OFF..INFO_CSUM_OFF + 8].try_into().unwrap());
        let mut zeroed = b.to_vec();
        zeroed[INFO_CSUM_OFF..INFO_CSUM_OFF + 8].fill(0);
        if fletcher64(&zeroed) != stored {
            return None;
        }
        let info = BttInfo::decode(b);
        if info.major < 1 {
            return None;
        }
        Some(info)
    }
}

/// One half of a flog pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlogEntry {
    pub lba: u32,
    pub old_map: u32,
    pub new_map: u32,
    pub seq: u32,
}

impl FlogEntry {
    pub fn encode(&self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&self.lba.to_le_bytes());
        b[4..8].copy_from_slice(&self.old_map.to_le_bytes());
        b[8..12].copy_from_slice(&self.new_map.to_le_bytes());
        b[12..16].copy_from_slice(&self.seq.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> FlogEntry {
        FlogEntry {
            lba: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            old_map: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            new_map: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            seq: u32::from_le_bytes(b[12..16].try_into().unwrap()),
        }
    }
}

/// Geometry knobs for a fresh layout. The defaults are the on-media
/// constants; overriding them is for tools and tests, and breaks
/// compatibility with default-laid-out namespaces.
#[derive(Clone, Copy, Debug)]
pub struct LayoutParams {
    pub arena_max: u64,
    pub arena_min: u64,
    pub nfree: u32,
}

impl Default for LayoutParams {
    fn default() -> Self {
        Self {
            arena_max: ARENA_MAX,
            arena_min: ARENA_MIN,
            nfree: DEFAULT_NFREE,
        }
    }
}

/// Split a namespace into arena byte sizes: full `arena_max` arenas plus a
/// trailing remainder iff it is at least `arena_min`.
pub fn split_arenas(rawsize: u64, params: &LayoutParams) -> Vec<u64> {
    let mut sizes = vec![params.arena_max; (rawsize / params.arena_max) as usize];
    let rem = rawsize % params.arena_max;
    if rem >= params.arena_min {
        sizes.push(rem);
    }
    sizes
}

/// Deterministic geometry of one arena, arena-relative offsets.
///
/// In-arena order: info, data, map, flog, info. The map sits immediately
/// before the flog, the flog immediately before the trailing info; the slack
/// between the end of the data region and `mapoff` is alignment padding.
#[derive(Clone, Copy, Debug)]
pub struct ArenaGeometry {
    pub arena_size: u64,
    pub internal_lbasize: u32,
    pub internal_nlba: u32,
    pub external_nlba: u32,
    pub flog_size: u64,
    pub map_size: u64,
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
    pub nextoff: u64,
}

impl ArenaGeometry {
    pub fn compute(arena_size: u64, lbasize: u32, nfree: u32, is_last: bool) -> Result<Self> {
        let flog_raw = nfree as u64 * round_up(2 * FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN);
        let flog_size = round_up(flog_raw, ALIGNMENT);
        let internal_lbasize = round_up(
            lbasize.max(MIN_LBA) as u64,
            INTERNAL_LBA_ALIGNMENT as u64,
        ) as u32;
        let overhead = 2 * INFO_SIZE + flog_size + ALIGNMENT;
        if arena_size <= overhead {
            return Err(BttError::NamespaceTooSmall { rawsize: arena_size });
        }
        let datasize = arena_size - 2 * INFO_SIZE - flog_size;
        // The extra ALIGNMENT absorbs the map rounding below.
        let internal_nlba = (datasize - ALIGNMENT) / (internal_lbasize as u64 + MAP_ENTRY_SIZE);
        debug_assert!(internal_nlba <= MAP_LBA_MASK as u64);
        let internal_nlba = internal_nlba as u32;
        if internal_nlba <= nfree {
            return Err(BttError::NamespaceTooSmall { rawsize: arena_size });
        }
        let external_nlba = internal_nlba - nfree;
        let map_size = round_up(external_nlba as u64 * MAP_ENTRY_SIZE, ALIGNMENT);
        let infooff = arena_size - INFO_SIZE;
        let flogoff = infooff - flog_size;
        let mapoff = flogoff - map_size;
        Ok(Self {
            arena_size,
            internal_lbasize,
            internal_nlba,
            external_nlba,
            flog_size,
            map_size,
            dataoff: INFO_SIZE,
            mapoff,
            flogoff,
            infooff,
            nextoff: if is_last { 0 } else { arena_size },
        })
    }

    pub fn to_info(&self, parent_uuid: [u8; 16], lbasize: u32, nfree: u32) -> BttInfo {
        BttInfo {
            parent_uuid,
            flags: 0,
            major: MAJOR_VERSION,
            minor: MINOR_VERSION,
            external_lbasize: lbasize,
            external_nlba: self.external_nlba,
            internal_lbasize: self.internal_lbasize,
            internal_nlba: self.internal_nlba,
            nfree,
            infosize: INFO_SIZE as u32,
            nextoff: self.nextoff,
            dataoff: self.dataoff,
            mapoff: self.mapoff,
            flogoff: self.flogoff,
            infooff: self.infooff,
        }
    }
}
