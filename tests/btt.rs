//! End-to-end tests over an in-memory namespace: basic block semantics,
//! crash recovery with injected power failures, concurrency across lanes,
//! and the consistency checker.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use btt::*;

const RAWSIZE: u64 = 8 << 20;
const LBASIZE: u32 = 512;
const NFREE: u32 = 4;

fn test_params() -> LayoutParams {
    // Small arenas and a small free pool keep the tests fast; geometry is
    // otherwise the same as a default layout.
    LayoutParams {
        arena_max: 16 << 20,
        arena_min: 1 << 20,
        nfree: NFREE,
    }
}

fn config(maxlane: u32) -> BttConfig {
    BttConfig {
        rawsize: RAWSIZE,
        lbasize: LBASIZE,
        parent_uuid: [0x42; 16],
        maxlane,
    }
}

fn open(ns: MemNamespace, maxlane: u32) -> Btt<MemNamespace> {
    Btt::with_params(ns, config(maxlane), test_params()).unwrap()
}

fn block(fill: u8) -> Vec<u8> {
    vec![fill; LBASIZE as usize]
}

fn read_back(btt: &Btt<MemNamespace>, lane: u32, lba: u64) -> Vec<u8> {
    let mut buf = block(0);
    btt.read(lane, lba, &mut buf).unwrap();
    buf
}

/// Namespace wrapper that simulates a power failure: the first `budget`
/// durable writes land, everything after is dropped with an error. Reads
/// and mapped windows are unaffected.
struct FaultNs {
    inner: MemNamespace,
    budget: AtomicI64,
}

impl FaultNs {
    fn new(inner: MemNamespace, budget: i64) -> Self {
        Self {
            inner,
            budget: AtomicI64::new(budget),
        }
    }
}

impl Namespace for FaultNs {
    fn read(&self, lane: u32, buf: &mut [u8], off: u64) -> io::Result<()> {
        self.inner.read(lane, buf, off)
    }

    fn write(&self, lane: u32, buf: &[u8], off: u64) -> io::Result<()> {
        if self.budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "injected power failure"));
        }
        self.inner.write(lane, buf, off)
    }

    fn map(&self, lane: u32, len: usize, off: u64) -> io::Result<(*mut u8, usize)> {
        self.inner.map(lane, len, off)
    }

    fn sync(&self, lane: u32, ptr: *mut u8, len: usize) -> io::Result<()> {
        self.inner.sync(lane, ptr, len)
    }
}

#[test]
fn test_fresh_read() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns, 4);
    assert!(!btt.laidout());
    assert!(btt.nlba() > 0);
    assert_eq!(btt.nlane(), NFREE);
    // Reads of an unlaid-out namespace return zeros without touching it.
    assert_eq!(read_back(&btt, 0, 0), block(0));
    assert!(!btt.laidout());
    // Bounds and buffer size are still enforced.
    let mut buf = block(0);
    assert!(matches!(
        btt.read(0, btt.nlba(), &mut buf),
        Err(BttError::OutOfRange { .. })
    ));
    let mut short = vec![0u8; 100];
    assert!(matches!(
        btt.read(0, 0, &mut short),
        Err(BttError::BadBuffer { .. })
    ));
}

#[test]
fn test_first_write_lays_out() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns.clone(), 4);
    btt.write(0, 0, &block(0xAA)).unwrap();
    assert!(btt.laidout());
    assert_eq!(read_back(&btt, 0, 0), block(0xAA));
    // Untouched blocks still read as zeros.
    assert_eq!(read_back(&btt, 1, 1), block(0));

    // The two info copies are byte-identical and both validate.
    let infos = btt.arena_infos();
    assert_eq!(infos.len(), 1);
    let (start, info) = &infos[0];
    let mut primary = vec![0u8; INFO_SIZE as usize];
    let mut backup = vec![0u8; INFO_SIZE as usize];
    ns.read(0, &mut primary, *start).unwrap();
    ns.read(0, &mut backup, *start + info.infooff).unwrap();
    assert_eq!(primary, backup);
    assert_eq!(BttInfo::validate(&primary), Some(info.clone()));
    assert!(btt.check().unwrap());
}

#[test]
fn test_reopen_preserves_data() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 4);
        btt.write(0, 11, &block(0x5C)).unwrap();
    }
    let btt = open(ns, 4);
    assert!(btt.laidout());
    assert_eq!(read_back(&btt, 0, 11), block(0x5C));
    assert!(btt.check().unwrap());
}

#[test]
fn test_overwrite_cycles_through_free_pool() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns.clone(), 4);
    btt.write(0, 0, &block(1)).unwrap();
    let (start, info) = btt.arena_infos().remove(0);
    let map_entry_off = start + info.mapoff + 5 * MAP_ENTRY_SIZE;

    let mut blocks_seen = Vec::new();
    for i in 1..=(NFREE + 2) {
        let lane = (i - 1) % btt.nlane();
        btt.write(lane, 5, &block(i as u8)).unwrap();
        assert_eq!(read_back(&btt, lane, 5), block(i as u8));
        let mut raw = [0u8; 4];
        ns.read(0, &mut raw, map_entry_off).unwrap();
        let target = u32::from_le_bytes(raw) & MAP_LBA_MASK;
        if !blocks_seen.contains(&target) {
            blocks_seen.push(target);
        }
    }
    // Round-robin lanes walk the block through the whole free pool plus the
    // originally mapped block before any reuse.
    assert_eq!(blocks_seen.len() as u32, NFREE + 1);
    assert!(btt.check().unwrap());
}

#[test]
fn test_crash_after_flog_commit_before_map() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 1);
        btt.write(0, 5, &block(0x0D)).unwrap();
    }
    {
        // Data write, 12-byte flog write and seq commit land; the final map
        // write is lost.
        let faulty = FaultNs::new(ns.clone(), 3);
        let btt = Btt::with_params(faulty, config(1), test_params()).unwrap();
        assert!(btt.write(0, 5, &block(0x0E)).is_err());
    }
    // The commit point passed, so recovery rolls the map forward.
    let btt = open(ns, 1);
    assert_eq!(read_back(&btt, 0, 5), block(0x0E));
    assert!(btt.check().unwrap());
}

#[test]
fn test_crash_before_flog_commit() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 1);
        btt.write(0, 5, &block(0x0D)).unwrap();
    }
    {
        // Data and the 12-byte flog write land, the seq commit is lost.
        let faulty = FaultNs::new(ns.clone(), 2);
        let btt = Btt::with_params(faulty, config(1), test_params()).unwrap();
        assert!(btt.write(0, 5, &block(0x0E)).is_err());
    }
    // Nothing committed: the pre-crash contents survive.
    let btt = open(ns, 1);
    assert_eq!(read_back(&btt, 0, 5), block(0x0D));
    assert!(btt.check().unwrap());
}

#[test]
fn test_powerfail_atomicity_at_every_cut() {
    // Drop every suffix of the durable writes a single block write issues.
    // Whatever the cut, the block must read back as exactly the old or the
    // new payload, and the arena must stay consistent.
    for budget in 0..=4 {
        let ns = MemNamespace::new(RAWSIZE as usize);
        {
            let btt = open(ns.clone(), 1);
            btt.write(0, 9, &block(0xA1)).unwrap();
        }
        {
            let faulty = FaultNs::new(ns.clone(), budget);
            let btt = Btt::with_params(faulty, config(1), test_params()).unwrap();
            let res = btt.write(0, 9, &block(0xB2));
            assert_eq!(res.is_ok(), budget >= 4, "budget {}", budget);
        }
        let btt = open(ns, 1);
        let got = read_back(&btt, 0, 9);
        assert!(
            got == block(0xA1) || got == block(0xB2),
            "budget {}: torn or foreign block",
            budget
        );
        // The map update is the last durable write, so the new payload is
        // visible exactly when the whole sequence landed or the flog commit
        // was rolled forward.
        if budget >= 3 {
            assert_eq!(got, block(0xB2), "budget {}", budget);
        } else {
            assert_eq!(got, block(0xA1), "budget {}", budget);
        }
        assert!(btt.check().unwrap(), "budget {}", budget);
    }
}

#[test]
fn test_set_zero() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 4);
        btt.write(0, 7, &block(0xFF)).unwrap();
        btt.set_zero(0, 7).unwrap();
        assert_eq!(read_back(&btt, 0, 7), block(0));
        assert!(btt.check().unwrap());
    }
    // The flag is on media, not in the instance.
    let btt = open(ns, 4);
    assert_eq!(read_back(&btt, 0, 7), block(0));
}

#[test]
fn test_set_zero_unlaidout_is_noop() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns, 4);
    btt.set_zero(0, 3).unwrap();
    assert!(!btt.laidout());
}

#[test]
fn test_set_error() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns, 4);
    // set_error is not vacuous: it forces layout creation.
    btt.set_error(0, 9).unwrap();
    assert!(btt.laidout());
    let mut buf = block(0);
    assert!(matches!(
        btt.read(0, 9, &mut buf),
        Err(BttError::ErrorBlock { lba: 9 })
    ));
    assert!(btt.check().unwrap());
    // A write allocates a fresh block and clears the error semantics.
    btt.write(0, 9, &block(0x77)).unwrap();
    assert_eq!(read_back(&btt, 0, 9), block(0x77));
    assert!(btt.check().unwrap());
}

#[test]
fn test_lbasize_mismatch_rejected() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 4);
        btt.write(0, 0, &block(1)).unwrap();
    }
    let cfg = BttConfig {
        lbasize: 1024,
        ..config(4)
    };
    assert!(matches!(
        Btt::with_params(ns, cfg, test_params()),
        Err(BttError::LbaSizeMismatch {
            requested: 1024,
            stored: 512
        })
    ));
}

#[test]
fn test_foreign_uuid_reads_as_unlaidout() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 4);
        btt.write(0, 0, &block(1)).unwrap();
    }
    let cfg = BttConfig {
        parent_uuid: [0x99; 16],
        ..config(4)
    };
    let btt = Btt::with_params(ns, cfg, test_params()).unwrap();
    assert!(!btt.laidout());
}

#[test]
fn test_multiple_arenas() {
    let params = LayoutParams {
        arena_max: 1 << 20,
        arena_min: 512 << 10,
        nfree: NFREE,
    };
    let rawsize: u64 = (2 << 20) + (512 << 10);
    let ns = MemNamespace::new(rawsize as usize);
    let cfg = BttConfig {
        rawsize,
        lbasize: LBASIZE,
        parent_uuid: [0x42; 16],
        maxlane: 4,
    };
    let btt = Btt::with_params(ns.clone(), cfg.clone(), params).unwrap();
    // Two full arenas of 1996 external blocks plus a 980-block remainder.
    assert_eq!(btt.nlba(), 1996 + 1996 + 980);

    // One write in each arena, including the last block of the namespace.
    let lbas = [0u64, 1996, 2 * 1996, btt.nlba() - 1];
    for (i, &lba) in lbas.iter().enumerate() {
        btt.write(0, lba, &block(i as u8 + 1)).unwrap();
    }
    let infos = btt.arena_infos();
    assert_eq!(infos.len(), 3);
    assert_eq!(infos[0].0, 0);
    assert_eq!(infos[1].0, 1 << 20);
    assert_eq!(infos[2].0, 2 << 20);
    assert_eq!(infos[2].1.nextoff, 0);
    for (i, &lba) in lbas.iter().enumerate() {
        assert_eq!(read_back(&btt, 0, lba), block(i as u8 + 1));
    }
    assert!(btt.check().unwrap());

    // Reopen sees all three arenas.
    drop(btt);
    let btt = Btt::with_params(ns, cfg, params).unwrap();
    assert_eq!(btt.arena_infos().len(), 3);
    assert_eq!(read_back(&btt, 0, 2 * 1996), block(3));
}

#[test]
fn test_flog_seq_collision_marks_arena_bad() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 4);
        btt.write(0, 2, &block(0x33)).unwrap();
    }
    // Force both halves of lane 0's flog pair to the same sequence number.
    let (start, info) = {
        let btt = open(ns.clone(), 4);
        btt.arena_infos().remove(0)
    };
    let mut half0 = [0u8; 16];
    ns.read(0, &mut half0, start + info.flogoff).unwrap();
    let seq = &half0[12..16];
    ns.write(0, seq, start + info.flogoff + FLOG_ENTRY_SIZE + 12)
        .unwrap();

    let btt = open(ns, 4);
    // Writes are refused, reads of valid entries still work.
    assert!(matches!(
        btt.write(0, 2, &block(0x44)),
        Err(BttError::ArenaBroken { arena: 0 })
    ));
    assert_eq!(read_back(&btt, 0, 2), block(0x33));
}

#[test]
fn test_flog_seq_collision_on_inflight_half_still_opens() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    {
        let btt = open(ns.clone(), 4);
        // Two writes on the same lane so half 0 holds a live transaction
        // record (old_map != new_map) rather than the init entry.
        btt.write(0, 2, &block(0x33)).unwrap();
        btt.write(0, 2, &block(0x44)).unwrap();
    }
    let (start, info) = {
        let btt = open(ns.clone(), 4);
        btt.arena_infos().remove(0)
    };
    // Trash half 0's lba field, then copy its seq into half 1 so the pair
    // collides and half 0 is the one a naive parse would pick.
    ns.write(0, &0x00FF_FFFFu32.to_le_bytes(), start + info.flogoff)
        .unwrap();
    let mut half0 = [0u8; 16];
    ns.read(0, &mut half0, start + info.flogoff).unwrap();
    ns.write(0, &half0[12..16], start + info.flogoff + FLOG_ENTRY_SIZE + 12)
        .unwrap();

    // A collided pair has no current entry: it must not drive recovery, so
    // the open succeeds and only flags the arena.
    let btt = open(ns, 4);
    assert!(matches!(
        btt.write(0, 2, &block(0x55)),
        Err(BttError::ArenaBroken { arena: 0 })
    ));
    assert_eq!(read_back(&btt, 0, 2), block(0x44));
}

#[test]
fn test_check_detects_duplicate_map_entry() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns.clone(), 4);
    btt.write(0, 0, &block(1)).unwrap();
    btt.write(1, 1, &block(2)).unwrap();
    assert!(btt.check().unwrap());

    // Point lba 0 at lba 1's block: one block referenced twice, one
    // referenced never.
    let (start, info) = btt.arena_infos().remove(0);
    let mut entry1 = [0u8; 4];
    ns.read(0, &mut entry1, start + info.mapoff + MAP_ENTRY_SIZE)
        .unwrap();
    ns.write(0, &entry1, start + info.mapoff).unwrap();
    assert!(!btt.check().unwrap());
}

#[test]
fn test_check_detects_missing_internal_block() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns.clone(), 4);
    btt.write(0, 0, &block(1)).unwrap();
    assert!(btt.check().unwrap());

    // An out-of-range target leaves a real block referenced by nothing.
    let (start, info) = btt.arena_infos().remove(0);
    let bogus = (info.internal_nlba + 100).to_le_bytes();
    ns.write(0, &bogus, start + info.mapoff).unwrap();
    assert!(!btt.check().unwrap());
}

#[test]
fn test_concurrent_writers_disjoint_lbas() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns, 4);
    let nlane = btt.nlane();
    std::thread::scope(|s| {
        for lane in 0..nlane {
            let btt = &btt;
            s.spawn(move || {
                let mut buf = block(0);
                for i in 0..10_000u32 {
                    buf.fill((i as u8) ^ (lane as u8).wrapping_mul(31));
                    btt.write(lane, lane as u64 * 7, &buf).unwrap();
                }
            });
        }
    });
    for lane in 0..nlane {
        let expected = block((9999u32 as u8) ^ (lane as u8).wrapping_mul(31));
        assert_eq!(read_back(&btt, 0, lane as u64 * 7), expected);
    }
    assert!(btt.check().unwrap());
}

#[test]
fn test_concurrent_reader_and_writer_same_lba() {
    const A: u8 = 0x11;
    const B: u8 = 0x22;
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns, 2);
    btt.write(0, 3, &block(A)).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let btt_ref = &btt;
        let done_ref = &done;
        s.spawn(move || {
            for i in 0..2_000u32 {
                let fill = if i % 2 == 0 { B } else { A };
                btt_ref.write(0, 3, &block(fill)).unwrap();
            }
            done_ref.store(true, Ordering::SeqCst);
        });
        s.spawn(move || {
            let mut buf = block(0);
            while !done_ref.load(Ordering::SeqCst) {
                btt_ref.read(1, 3, &mut buf).unwrap();
                // Every observed block is one payload in full; a torn block
                // would mean a writer reused it while the rtt guard was up.
                let first = buf[0];
                assert!(first == A || first == B, "foreign byte {:#x}", first);
                assert!(buf.iter().all(|&b| b == first), "torn block");
            }
        });
    });
    assert!(btt.check().unwrap());
}

#[derive(Clone, Copy, PartialEq)]
enum Model {
    Zero,
    Data(u8),
    Bad,
}

#[test]
fn test_random_ops_hold_invariants() {
    // Random single-lane workload against a model, with the permutation
    // invariant (via check) revalidated periodically.
    let mut rng = SmallRng::seed_from_u64(0xB77);
    let ns = MemNamespace::new(RAWSIZE as usize);
    let btt = open(ns.clone(), 4);
    let lbas: u64 = 48;
    let mut model: HashMap<u64, Model> = HashMap::new();

    for step in 0..1_500u32 {
        let lba = rng.gen_range(0..lbas);
        match rng.gen_range(0..10) {
            0..=5 => {
                let fill = rng.gen::<u8>();
                btt.write(0, lba, &block(fill)).unwrap();
                model.insert(lba, Model::Data(fill));
            }
            6 => {
                btt.set_zero(0, lba).unwrap();
                // Zeroing an error block keeps it failing reads.
                let stays_bad = matches!(model.get(&lba), Some(Model::Bad));
                if btt.laidout() && !stays_bad {
                    model.insert(lba, Model::Zero);
                }
            }
            7 => {
                btt.set_error(0, lba).unwrap();
                model.insert(lba, Model::Bad);
            }
            _ => {
                let mut buf = block(0);
                match model.get(&lba).copied().unwrap_or(Model::Zero) {
                    Model::Zero => {
                        btt.read(0, lba, &mut buf).unwrap();
                        assert_eq!(buf, block(0), "step {} lba {}", step, lba);
                    }
                    Model::Data(fill) => {
                        btt.read(0, lba, &mut buf).unwrap();
                        assert_eq!(buf, block(fill), "step {} lba {}", step, lba);
                    }
                    Model::Bad => {
                        assert!(
                            matches!(btt.read(0, lba, &mut buf), Err(BttError::ErrorBlock { .. })),
                            "step {} lba {}",
                            step,
                            lba
                        );
                    }
                }
            }
        }
        if step % 250 == 249 {
            assert!(btt.check().unwrap(), "inconsistent at step {}", step);
        }
    }

    // Reopen and sweep: everything the model knows must survive.
    drop(btt);
    let btt = open(ns, 4);
    let mut buf = block(0);
    for (lba, state) in model {
        match state {
            Model::Zero => {
                btt.read(0, lba, &mut buf).unwrap();
                assert_eq!(buf, block(0));
            }
            Model::Data(fill) => {
                btt.read(0, lba, &mut buf).unwrap();
                assert_eq!(buf, block(fill));
            }
            Model::Bad => {
                assert!(matches!(
                    btt.read(0, lba, &mut buf),
                    Err(BttError::ErrorBlock { .. })
                ));
            }
        }
    }
    assert!(btt.check().unwrap());
}

#[test]
fn test_nlane_is_min_of_nfree_and_maxlane() {
    let ns = MemNamespace::new(RAWSIZE as usize);
    assert_eq!(open(ns.clone(), 2).nlane(), 2);
    assert_eq!(open(ns.clone(), 16).nlane(), NFREE);
    assert_eq!(open(ns, 4).nlane(), NFREE);
}
