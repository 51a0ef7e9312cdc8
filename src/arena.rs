//! Per-arena runtime state and the two engines that make a write atomic:
//! the flog (free-list log) and the locked map.
//!
//! A write never updates a block in place. It writes the payload into the
//! lane's free block, records `{pre-map lba, old map entry, new map entry}`
//! in the lane's flog pair, commits by bumping the pair's sequence number,
//! and only then stores the new entry into the map. The sequence write is
//! the single commit point; everything before it is invisible after a crash
//! and everything after it is rolled forward at the next open.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::error::Result;
use crate::layout::{
    nseq, BttInfo, FlogEntry, FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN, INFO_FLAG_ERROR, MAP_ENTRY_SIZE,
    MAP_LBA_MASK, RTT_IDLE,
};
use crate::ns::Namespace;
use crate::util::round_up;

/// Runtime flog state for one lane.
///
/// `entry` is a host-order copy of the pair's current half; its `old_map`
/// field names the free block this lane owns.
pub(crate) struct FlogSlot {
    /// Absolute offsets of the pair's two halves.
    off: [u64; 2],
    /// Index of the half that receives the next update.
    next: usize,
    /// The pair failed to parse at open: neither half is a determinate
    /// current entry and the lane must not be recovered or written.
    collision: bool,
    pub(crate) entry: FlogEntry,
}

/// How a flog pair reads back at open time.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PairState {
    /// `current` half holds the live entry, `next` takes the next update.
    Valid { current: usize, next: usize },
    /// Both halves carry the same sequence number; the arena is broken.
    Collision,
}

/// Decide which half of a pair is current (rules in declaration order):
/// equal sequence numbers are a consistency fault; a zero half is unwritten
/// and the other is current; otherwise the half one sequence step ahead
/// wins.
pub(crate) fn parse_pair(e0: &FlogEntry, e1: &FlogEntry) -> PairState {
    if e0.seq == e1.seq {
        PairState::Collision
    } else if e0.seq == 0 {
        PairState::Valid { current: 1, next: 0 }
    } else if e1.seq == 0 {
        PairState::Valid { current: 0, next: 1 }
    } else if nseq(e0.seq) == e1.seq {
        PairState::Valid { current: 1, next: 0 }
    } else {
        PairState::Valid { current: 0, next: 1 }
    }
}

/// One self-contained BTT unit. Offsets kept here are namespace-absolute;
/// the arena-relative originals stay in `info`.
pub(crate) struct Arena {
    pub(crate) idx: usize,
    pub(crate) info: BttInfo,
    pub(crate) startoff: u64,
    pub(crate) dataoff: u64,
    pub(crate) mapoff: u64,
    pub(crate) flogoff: u64,
    pub(crate) external_nlba: u32,
    pub(crate) internal_lbasize: u32,
    pub(crate) internal_nlba: u32,
    pub(crate) nfree: u32,
    /// Set once, at open or pair parse; read-only afterwards.
    flags: AtomicU32,
    flog: Vec<UnsafeCell<FlogSlot>>,
    /// One slot per lane; a slot holds the masked internal block the lane is
    /// currently reading, or `RTT_IDLE`.
    rtt: Vec<AtomicU32>,
    /// Stripe locks over the map, indexed by `pre_map_lba % nfree`.
    map_locks: Vec<spin::Mutex<()>>,
}

// Each flog slot belongs exclusively to the lane with the same index, and
// callers guarantee distinct lanes per concurrent thread.
unsafe impl Sync for Arena {}

impl Arena {
    /// Build the runtime for a validated info block: load every flog pair,
    /// replay any interrupted map update, and initialize the rtt and lock
    /// stripe.
    pub(crate) fn load(
        ns: &impl Namespace,
        idx: usize,
        startoff: u64,
        info: BttInfo,
    ) -> Result<Arena> {
        let pair_stride = round_up(2 * FLOG_ENTRY_SIZE, FLOG_PAIR_ALIGN);
        let mut arena = Arena {
            idx,
            startoff,
            dataoff: startoff + info.dataoff,
            mapoff: startoff + info.mapoff,
            flogoff: startoff + info.flogoff,
            external_nlba: info.external_nlba,
            internal_lbasize: info.internal_lbasize,
            internal_nlba: info.internal_nlba,
            nfree: info.nfree,
            flags: AtomicU32::new(info.flags),
            flog: Vec::with_capacity(info.nfree as usize),
            rtt: (0..info.nfree).map(|_| AtomicU32::new(RTT_IDLE)).collect(),
            map_locks: (0..info.nfree).map(|_| spin::Mutex::new(())).collect(),
            info,
        };
        fence(Ordering::SeqCst);

        for lane in 0..arena.nfree {
            let off = [
                arena.flogoff + lane as u64 * pair_stride,
                arena.flogoff + lane as u64 * pair_stride + FLOG_ENTRY_SIZE,
            ];
            let mut raw = [0u8; 32];
            ns.read(0, &mut raw, off[0])?;
            let e0 = FlogEntry::decode(&raw[0..16]);
            let e1 = FlogEntry::decode(&raw[16..32]);
            let slot = match parse_pair(&e0, &e1) {
                PairState::Collision => {
                    error!(
                        "arena {}: flog pair {} has colliding seq {}, marking arena bad",
                        idx, lane, e0.seq
                    );
                    arena.flags.fetch_or(INFO_FLAG_ERROR, Ordering::SeqCst);
                    FlogSlot {
                        off,
                        next: 1,
                        collision: true,
                        entry: e0,
                    }
                }
                PairState::Valid { current, next } => FlogSlot {
                    off,
                    next,
                    collision: false,
                    entry: if current == 0 { e0 } else { e1 },
                },
            };
            arena.flog.push(UnsafeCell::new(slot));
        }

        arena.recover(ns)?;
        Ok(arena)
    }

    /// Replay flog transactions whose map update didn't land. A current
    /// entry with `old_map != new_map` names an in-flight write; if the live
    /// map entry still equals `old_map` the commit happened but the map
    /// write was lost, so roll it forward. Any other live value means the
    /// transaction finished or was superseded.
    ///
    /// Lanes whose pair collided have no current entry, so their fields
    /// (including `lba`) carry no meaning and must not drive a map access.
    fn recover(&self, ns: &impl Namespace) -> Result<()> {
        for lane in 0..self.nfree {
            let slot = unsafe { &*self.flog[lane as usize].get() };
            if slot.collision {
                continue;
            }
            let entry = slot.entry;
            if entry.old_map == entry.new_map {
                // Freshly initialized pair, nothing in flight.
                continue;
            }
            let live = self.map_read(ns, 0, entry.lba)?;
            if live == entry.old_map {
                info!(
                    "arena {}: rolling map[{}] forward {:#010x} -> {:#010x}",
                    self.idx, entry.lba, entry.old_map, entry.new_map
                );
                self.map_write(ns, 0, entry.lba, entry.new_map)?;
            }
        }
        Ok(())
    }

    pub(crate) fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    /// Read the map entry for a pre-map LBA, host order.
    pub(crate) fn map_read(&self, ns: &impl Namespace, lane: u32, premap: u32) -> Result<u32> {
        debug_assert!(premap < self.external_nlba);
        let mut b = [0u8; 4];
        ns.read(lane, &mut b, self.mapoff + premap as u64 * MAP_ENTRY_SIZE)?;
        Ok(u32::from_le_bytes(b))
    }

    fn map_write(&self, ns: &impl Namespace, lane: u32, premap: u32, entry: u32) -> Result<()> {
        ns.write(
            lane,
            &entry.to_le_bytes(),
            self.mapoff + premap as u64 * MAP_ENTRY_SIZE,
        )?;
        Ok(())
    }

    /// Lock the stripe covering `premap` and read the current entry under
    /// the lock. Dropping the guard without `map_unlock` aborts the update.
    pub(crate) fn map_lock(
        &self,
        ns: &impl Namespace,
        lane: u32,
        premap: u32,
    ) -> Result<(spin::MutexGuard<'_, ()>, u32)> {
        let guard = self.map_locks[(premap % self.nfree) as usize].lock();
        // Guard drops on error, releasing the stripe.
        let entry = self.map_read(ns, lane, premap)?;
        Ok((guard, entry))
    }

    /// Store a new entry and release the stripe.
    pub(crate) fn map_unlock(
        &self,
        ns: &impl Namespace,
        lane: u32,
        premap: u32,
        entry: u32,
        guard: spin::MutexGuard<'_, ()>,
    ) -> Result<()> {
        let res = self.map_write(ns, lane, premap, entry);
        drop(guard);
        res
    }

    /// Write `{lba, old_map, new_map}` into the non-current half, then
    /// commit it with the 4-byte sequence write. Must run under the map
    /// stripe lock for `pre_map_lba`.
    pub(crate) fn flog_update(
        &self,
        ns: &impl Namespace,
        lane: u32,
        pre_map_lba: u32,
        old_map: u32,
        new_map: u32,
    ) -> Result<()> {
        let slot = unsafe { &mut *self.flog[lane as usize].get() };
        let off = slot.off[slot.next];
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&pre_map_lba.to_le_bytes());
        b[4..8].copy_from_slice(&old_map.to_le_bytes());
        b[8..12].copy_from_slice(&new_map.to_le_bytes());
        ns.write(lane, &b, off)?;
        let seq = nseq(slot.entry.seq);
        // The commit point: once this 4-byte write is durable the new entry
        // is current.
        ns.write(lane, &seq.to_le_bytes(), off + 12)?;
        slot.entry = FlogEntry {
            lba: pre_map_lba,
            old_map,
            new_map,
            seq,
        };
        slot.next ^= 1;
        Ok(())
    }

    /// The masked free block owned by a lane.
    pub(crate) fn free_block(&self, lane: u32) -> u32 {
        let slot = unsafe { &*self.flog[lane as usize].get() };
        slot.entry.old_map & MAP_LBA_MASK
    }

    /// Publish the block a read is about to touch. The fence orders the
    /// store before the map re-read that validates it.
    pub(crate) fn rtt_publish(&self, lane: u32, block: u32) {
        self.rtt[lane as usize].store(block, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }

    pub(crate) fn rtt_clear(&self, lane: u32) {
        self.rtt[lane as usize].store(RTT_IDLE, Ordering::SeqCst);
    }

    /// Spin until no lane is reading `block`. Bounded by the duration of a
    /// single outstanding read.
    pub(crate) fn rtt_wait(&self, nlane: u32, block: u32) {
        for i in 0..nlane {
            while self.rtt[i as usize].load(Ordering::SeqCst) == block {
                std::hint::spin_loop();
            }
        }
    }

    /// Snapshot of every lane's current flog entry. Only sound while the
    /// caller has quiesced all lanes (checker contract).
    pub(crate) fn flog_entries(&self) -> Vec<FlogEntry> {
        self.flog
            .iter()
            .map(|s| unsafe { (*s.get()).entry })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(seq: u32) -> FlogEntry {
        FlogEntry {
            lba: 1,
            old_map: 2,
            new_map: 3,
            seq,
        }
    }

    #[test]
    fn test_parse_pair_zero_half() {
        // One unwritten half: the other is current, next points at the zero
        // half.
        assert_eq!(
            parse_pair(&e(0), &e(1)),
            PairState::Valid { current: 1, next: 0 }
        );
        assert_eq!(
            parse_pair(&e(2), &e(0)),
            PairState::Valid { current: 0, next: 1 }
        );
    }

    #[test]
    fn test_parse_pair_sequence_order() {
        // Second half one step ahead: it wins.
        assert_eq!(
            parse_pair(&e(1), &e(2)),
            PairState::Valid { current: 1, next: 0 }
        );
        // Wraparound: 3 -> 1.
        assert_eq!(
            parse_pair(&e(3), &e(1)),
            PairState::Valid { current: 1, next: 0 }
        );
        // First half ahead.
        assert_eq!(
            parse_pair(&e(2), &e(1)),
            PairState::Valid { current: 0, next: 1 }
        );
        assert_eq!(
            parse_pair(&e(1), &e(3)),
            PairState::Valid { current: 0, next: 1 }
        );
    }

    #[test]
    fn test_parse_pair_collision() {
        assert_eq!(parse_pair(&e(2), &e(2)), PairState::Collision);
        // Both unwritten is a collision too, not an empty pair.
        assert_eq!(parse_pair(&e(0), &e(0)), PairState::Collision);
    }
}
