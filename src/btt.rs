//! The BTT instance: layout detection and creation, LBA resolution, and the
//! external read/write/set-flag operations.

use once_cell::sync::OnceCell;

use crate::arena::Arena;
use crate::error::{BttError, Result};
use crate::layout::{
    split_arenas, ArenaGeometry, BttInfo, FlogEntry, LayoutParams, FLOG_ENTRY_SIZE,
    FLOG_PAIR_ALIGN, INFO_ERROR_MASK, INFO_SIZE, MAP_ENTRY_ERROR, MAP_ENTRY_SIZE, MAP_ENTRY_ZERO,
    MAP_LBA_MASK,
};
use crate::ns::Namespace;
use crate::util::round_up;

/// Construction parameters for a BTT instance.
#[derive(Clone, Debug)]
pub struct BttConfig {
    /// Size of the namespace in bytes. Never resized.
    pub rawsize: u64,
    /// External block size callers read and write.
    pub lbasize: u32,
    /// Identity of the containing namespace, stored in every info block.
    pub parent_uuid: [u8; 16],
    /// Upper bound on concurrent lanes the caller will use.
    pub maxlane: u32,
}

/// A Block Translation Table over a namespace.
///
/// Presents `nlba` external blocks of `lbasize` bytes with single-block
/// power-fail atomicity: after a crash each block reads as its last fully
/// committed contents, never a torn mixture.
///
/// All operations take a lane in `[0, nlane)`. Distinct concurrent callers
/// must use distinct lanes; the library assigns none.
pub struct Btt<N: Namespace> {
    pub(crate) ns: N,
    rawsize: u64,
    pub(crate) lbasize: u32,
    parent_uuid: [u8; 16],
    params: LayoutParams,
    nfree: u32,
    nlane: u32,
    nlba: u64,
    /// Populated at open when a valid layout exists, else on first write.
    /// `get_or_try_init` is the layout-write mutex: one initializer runs,
    /// racing lanes block and then adopt its result.
    pub(crate) arenas: OnceCell<Vec<Arena>>,
}

impl<N: Namespace> Btt<N> {
    /// Open a namespace with the default on-media layout parameters,
    /// loading an existing layout or deferring creation to the first write.
    pub fn new(ns: N, cfg: BttConfig) -> Result<Self> {
        Self::with_params(ns, cfg, LayoutParams::default())
    }

    /// Open with explicit layout parameters. Overrides apply only when this
    /// instance creates the layout; an existing layout's geometry always
    /// wins.
    pub fn with_params(ns: N, cfg: BttConfig, params: LayoutParams) -> Result<Self> {
        let sizes = split_arenas(cfg.rawsize, &params);
        if sizes.is_empty() {
            return Err(BttError::NamespaceTooSmall { rawsize: cfg.rawsize });
        }

        let arenas = read_layout(&ns, cfg.rawsize, cfg.lbasize, &cfg.parent_uuid)?;
        let (nfree, nlba) = match &arenas {
            Some(list) => {
                // Arenas may disagree after external manipulation; adopt the
                // minimum so every lane has a flog slot everywhere.
                let nfree = list.iter().map(|a| a.nfree).min().unwrap();
                let nlba = list.iter().map(|a| a.external_nlba as u64).sum();
                (nfree, nlba)
            }
            None => {
                // Unlaid-out: compute the geometry a future write_layout
                // would produce so bounds checks work before any data
                // exists.
                let mut nlba = 0u64;
                let last = sizes.len() - 1;
                for (i, &size) in sizes.iter().enumerate() {
                    let g = ArenaGeometry::compute(size, cfg.lbasize, params.nfree, i == last)?;
                    nlba += g.external_nlba as u64;
                }
                (params.nfree, nlba)
            }
        };

        let btt = Self {
            ns,
            rawsize: cfg.rawsize,
            lbasize: cfg.lbasize,
            parent_uuid: cfg.parent_uuid,
            params,
            nfree,
            nlane: nfree.min(cfg.maxlane.max(1)),
            nlba,
            arenas: OnceCell::new(),
        };
        if let Some(list) = arenas {
            let _ = btt.arenas.set(list);
        }
        debug!(
            "btt open: rawsize {} nlba {} nfree {} nlane {} laidout {}",
            btt.rawsize,
            btt.nlba,
            btt.nfree,
            btt.nlane,
            btt.laidout()
        );
        Ok(btt)
    }

    /// Number of lanes callers may use concurrently.
    pub fn nlane(&self) -> u32 {
        self.nlane
    }

    /// Number of external blocks.
    pub fn nlba(&self) -> u64 {
        self.nlba
    }

    /// External block size in bytes.
    pub fn lbasize(&self) -> u32 {
        self.lbasize
    }

    /// Whether the namespace currently carries a layout.
    pub fn laidout(&self) -> bool {
        self.arenas.get().is_some()
    }

    /// Decoded info block of each arena, with its absolute start offset.
    /// Empty while unlaid-out.
    pub fn arena_infos(&self) -> Vec<(u64, BttInfo)> {
        match self.arenas.get() {
            Some(list) => list.iter().map(|a| (a.startoff, a.info.clone())).collect(),
            None => Vec::new(),
        }
    }

    fn check_args(&self, lane: u32, lba: u64, buflen: usize) -> Result<()> {
        debug_assert!(lane < self.nlane, "lane {} out of {}", lane, self.nlane);
        if buflen != self.lbasize as usize {
            return Err(BttError::BadBuffer {
                len: buflen,
                lbasize: self.lbasize,
            });
        }
        if lba >= self.nlba {
            return Err(BttError::OutOfRange {
                lba,
                nlba: self.nlba,
            });
        }
        Ok(())
    }

    fn check_lba(&self, lane: u32, lba: u64) -> Result<()> {
        debug_assert!(lane < self.nlane, "lane {} out of {}", lane, self.nlane);
        if lba >= self.nlba {
            return Err(BttError::OutOfRange {
                lba,
                nlba: self.nlba,
            });
        }
        Ok(())
    }

    /// Arena owning an external LBA, plus the residual pre-map LBA.
    fn resolve<'a>(&self, arenas: &'a [Arena], lba: u64) -> (&'a Arena, u32) {
        let mut rem = lba;
        for a in arenas {
            if rem < a.external_nlba as u64 {
                return (a, rem as u32);
            }
            rem -= a.external_nlba as u64;
        }
        unreachable!("lba checked against nlba");
    }

    /// Read one external block into `buf` (`lbasize` bytes).
    pub fn read(&self, lane: u32, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_args(lane, lba, buf.len())?;
        let arenas = match self.arenas.get() {
            Some(a) => a,
            None => {
                // Nothing was ever written.
                buf.fill(0);
                return Ok(());
            }
        };
        let (arena, premap) = self.resolve(arenas, lba);

        let mut entry = arena.map_read(&self.ns, lane, premap)?;
        let entry = loop {
            if entry & (MAP_ENTRY_ERROR | MAP_ENTRY_ZERO) != 0 {
                break entry;
            }
            // Guard the target block against reassignment, then re-read the
            // map: a writer may have freed the block between the first read
            // and the rtt store.
            arena.rtt_publish(lane, entry & MAP_LBA_MASK);
            match arena.map_read(&self.ns, lane, premap) {
                Ok(again) if again == entry => break entry,
                Ok(again) => entry = again,
                Err(e) => {
                    arena.rtt_clear(lane);
                    return Err(e);
                }
            }
        };

        if entry & MAP_ENTRY_ERROR != 0 {
            arena.rtt_clear(lane);
            return Err(BttError::ErrorBlock { lba });
        }
        if entry & MAP_ENTRY_ZERO != 0 {
            arena.rtt_clear(lane);
            buf.fill(0);
            return Ok(());
        }

        let block = (entry & MAP_LBA_MASK) as u64;
        let res = self.ns.read(
            lane,
            buf,
            arena.dataoff + block * arena.internal_lbasize as u64,
        );
        arena.rtt_clear(lane);
        res?;
        Ok(())
    }

    fn ensure_layout(&self, lane: u32) -> Result<&[Arena]> {
        self.arenas
            .get_or_try_init(|| self.create_layout(lane))
            .map(|v| v.as_slice())
    }

    /// Force layout creation without writing any block. A no-op when the
    /// namespace is already laid out. Used by tooling.
    pub fn init_layout(&self, lane: u32) -> Result<()> {
        self.ensure_layout(lane).map(|_| ())
    }

    /// Write one external block atomically. On return the new contents are
    /// durable and a crash at any earlier point leaves the old contents.
    pub fn write(&self, lane: u32, lba: u64, buf: &[u8]) -> Result<()> {
        self.check_args(lane, lba, buf.len())?;
        let arenas = self.ensure_layout(lane)?;
        let (arena, premap) = self.resolve(arenas, lba);
        if arena.flags() & INFO_ERROR_MASK != 0 {
            return Err(BttError::ArenaBroken { arena: arena.idx });
        }

        // The lane's free block, and a wait for any in-flight read of it.
        let free = arena.free_block(lane);
        arena.rtt_wait(self.nlane, free);

        self.ns.write(
            lane,
            buf,
            arena.dataoff + free as u64 * arena.internal_lbasize as u64,
        )?;

        let (guard, old_entry) = arena.map_lock(&self.ns, lane, premap)?;
        if let Err(e) = arena.flog_update(&self.ns, lane, premap, old_entry, free) {
            drop(guard); // abort without touching the map
            return Err(e);
        }
        // The flog already committed the transition; a failure past this
        // point is healed by recovery at the next open.
        arena.map_unlock(&self.ns, lane, premap, free, guard)?;
        Ok(())
    }

    fn set_flag(&self, lane: u32, lba: u64, flag: u32) -> Result<()> {
        let arenas = self.ensure_layout(lane)?;
        let (arena, premap) = self.resolve(arenas, lba);
        if arena.flags() & INFO_ERROR_MASK != 0 {
            return Err(BttError::ArenaBroken { arena: arena.idx });
        }
        let (guard, old_entry) = arena.map_lock(&self.ns, lane, premap)?;
        let new_entry = old_entry | flag;
        if new_entry == old_entry {
            drop(guard);
            return Ok(());
        }
        arena.map_unlock(&self.ns, lane, premap, new_entry, guard)?;
        Ok(())
    }

    /// Make subsequent reads of `lba` return zeros. A no-op on an
    /// unlaid-out namespace.
    pub fn set_zero(&self, lane: u32, lba: u64) -> Result<()> {
        self.check_lba(lane, lba)?;
        if !self.laidout() {
            return Ok(());
        }
        self.set_flag(lane, lba, MAP_ENTRY_ZERO)
    }

    /// Make subsequent reads of `lba` fail until it is rewritten. Forces
    /// layout creation on an unlaid-out namespace.
    pub fn set_error(&self, lane: u32, lba: u64) -> Result<()> {
        self.check_lba(lane, lba)?;
        self.set_flag(lane, lba, MAP_ENTRY_ERROR)
    }

    /// Create the on-media layout, then load it through the normal read
    /// path. Runs inside the one-shot initializer; a failure leaves the
    /// namespace unlaid-out and a later write retries from scratch.
    fn create_layout(&self, lane: u32) -> Result<Vec<Arena>> {
        info!(
            "writing btt layout: rawsize {} lbasize {} nfree {}",
            self.rawsize, self.lbasize, self.params.nfree
        );
        let sizes = split_arenas(self.rawsize, &self.params);
        let last = sizes.len() - 1;
        let mut startoff = 0u64;
        for (i, &size) in sizes.iter().enumerate() {
            let g = ArenaGeometry::compute(size, self.lbasize, self.params.nfree, i == last)?;
            self.write_arena(lane, startoff, &g)?;
            startoff += size;
        }
        match read_layout(&self.ns, self.rawsize, self.lbasize, &self.parent_uuid)? {
            Some(arenas) => Ok(arenas),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "freshly written layout did not read back",
            )
            .into()),
        }
    }

    fn write_arena(&self, lane: u32, startoff: u64, g: &ArenaGeometry) -> Result<()> {
        // Identity map, through mapped windows.
        let mut premap: u32 = 0;
        let mut off = startoff + g.mapoff;
        let mut remaining = g.external_nlba as usize * MAP_ENTRY_SIZE as usize;
        while remaining > 0 {
            let (ptr, avail) = self.ns.map(lane, remaining, off)?;
            let len = avail.min(remaining) & !3;
            if len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "namespace map window too small for a map entry",
                )
                .into());
            }
            unsafe {
                let words = ptr as *mut u32;
                for k in 0..len / 4 {
                    words.add(k).write_unaligned((premap | MAP_ENTRY_ZERO).to_le());
                    premap += 1;
                }
            }
            self.ns.sync(lane, ptr, len)?;
            off += len as u64;
            remaining -= len;
        }

        // Flog pairs: first half maps lane k to free block external_nlba+k,
        // second half unwritten.
        let pair_stride = round_up(2 * FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN);
        let mut pair = vec![0u8; pair_stride as usize];
        for k in 0..self.params.nfree {
            let free = (g.external_nlba + k) | MAP_ENTRY_ZERO;
            let entry = FlogEntry {
                lba: 0,
                old_map: free,
                new_map: free,
                seq: 1,
            };
            pair[0..16].copy_from_slice(&entry.encode());
            self.ns
                .write(lane, &pair, startoff + g.flogoff + k as u64 * pair_stride)?;
        }

        // Info blocks last, backup then primary; the layout only becomes
        // discoverable once the primary lands.
        let block = g
            .to_info(self.parent_uuid, self.lbasize, self.params.nfree)
            .encode();
        self.ns.write(lane, &block, startoff + g.infooff)?;
        self.ns.write(lane, &block, startoff)?;
        Ok(())
    }
}

/// Walk the info-block chain from offset 0. `Ok(None)` means the namespace
/// carries no (usable) layout; only I/O failures and an lbasize conflict are
/// errors.
fn read_layout(
    ns: &impl Namespace,
    rawsize: u64,
    lbasize: u32,
    parent_uuid: &[u8; 16],
) -> Result<Option<Vec<Arena>>> {
    let mut arenas = Vec::new();
    let mut startoff = 0u64;
    loop {
        if startoff + INFO_SIZE > rawsize {
            warn!("info chain at {:#x} runs past the namespace", startoff);
            return Ok(None);
        }
        let mut block = vec![0u8; INFO_SIZE as usize];
        ns.read(0, &mut block, startoff)?;
        let info = match BttInfo::validate(&block) {
            Some(info) => info,
            None => {
                if startoff == 0 {
                    debug!("no valid layout at offset 0, namespace is unlaid-out");
                } else {
                    warn!("invalid info block at {:#x}, treating namespace as unlaid-out", startoff);
                }
                return Ok(None);
            }
        };
        if &info.parent_uuid != parent_uuid {
            warn!("arena at {:#x} belongs to another namespace", startoff);
            return Ok(None);
        }
        if info.external_lbasize != lbasize {
            return Err(BttError::LbaSizeMismatch {
                requested: lbasize,
                stored: info.external_lbasize,
            });
        }
        let extent = info.infooff + INFO_SIZE;
        if startoff + extent > rawsize {
            warn!(
                "arena at {:#x} extends past the namespace ({} > {})",
                startoff,
                startoff + extent,
                rawsize
            );
            return Ok(None);
        }
        debug!(
            "arena {} at {:#x}: external_nlba {} internal_lbasize {} nfree {}",
            arenas.len(),
            startoff,
            info.external_nlba,
            info.internal_lbasize,
            info.nfree
        );
        let nextoff = info.nextoff;
        arenas.push(Arena::load(ns, arenas.len(), startoff, info)?);
        if nextoff == 0 {
            break;
        }
        startoff += nextoff;
    }
    Ok(Some(arenas))
}
