//! Offline consistency checker: every internal block must be referenced
//! exactly once, either by a map entry or by a lane's flog free block.

use fixedbitset::FixedBitSet;

use crate::arena::Arena;
use crate::btt::Btt;
use crate::error::Result;
use crate::layout::MAP_LBA_MASK;
use crate::ns::Namespace;

impl<N: Namespace> Btt<N> {
    /// Scan every arena for duplicate or missing internal blocks.
    ///
    /// Single-threaded; the caller must quiesce all other operations first.
    /// Returns `Ok(false)` on an inconsistency, reserving `Err` for I/O
    /// failures. An unlaid-out namespace is trivially consistent.
    pub fn check(&self) -> Result<bool> {
        let arenas = match self.arenas.get() {
            Some(a) => a,
            None => return Ok(true),
        };
        let mut consistent = true;
        for arena in arenas.iter() {
            if !self.check_arena(arena)? {
                consistent = false;
            }
        }
        Ok(consistent)
    }

    fn check_arena(&self, arena: &Arena) -> Result<bool> {
        let nblocks = arena.internal_nlba as usize;
        let mut seen = FixedBitSet::with_capacity(nblocks);
        let mut ok = true;
        let mut claim = |block: usize, who: &str, idx: usize| {
            if block >= nblocks {
                error!(
                    "arena {}: {} {} references block {} outside [0, {})",
                    arena.idx, who, idx, block, nblocks
                );
                ok = false;
            } else if seen.put(block) {
                error!(
                    "arena {}: {} {} references block {} twice",
                    arena.idx, who, idx, block
                );
                ok = false;
            }
        };

        // One pass over the on-media map, through direct windows.
        let mut off = arena.mapoff;
        let mut remaining = arena.external_nlba as usize * 4;
        let mut premap = 0usize;
        while remaining > 0 {
            let (ptr, avail) = self.ns.map(0, remaining, off)?;
            let len = avail.min(remaining) & !3;
            if len == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "namespace map window too small for a map entry",
                )
                .into());
            }
            for k in 0..len / 4 {
                let raw = unsafe { (ptr as *const u32).add(k).read_unaligned() };
                let entry = u32::from_le(raw);
                claim((entry & MAP_LBA_MASK) as usize, "map entry", premap);
                premap += 1;
            }
            off += len as u64;
            remaining -= len;
        }

        // Then every lane's free block.
        for (lane, entry) in arena.flog_entries().iter().enumerate() {
            claim((entry.old_map & MAP_LBA_MASK) as usize, "flog slot", lane);
        }

        if seen.count_ones(..) != nblocks {
            for block in 0..nblocks {
                if !seen.contains(block) {
                    error!("arena {}: block {} is referenced by nothing", arena.idx, block);
                }
            }
            ok = false;
        }
        if ok {
            debug!("arena {}: consistent, {} blocks", arena.idx, nblocks);
        }
        Ok(ok)
    }
}
