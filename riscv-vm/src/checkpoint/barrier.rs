//! Atomic-spin sync barrier across harts (spec §4.5, §9 "barrier revision").
//!
//! Grounded in `riscv-vm/src/hart.rs`'s `HartContext`/`HartManager` pair: one
//! `#[repr(align(64))]` record per hart to avoid false sharing, global state
//! in atomics rather than a mutex + condvar. This supersedes the original
//! implementation's `multicore.c` (`GMutex`/`GCond`), which the redesign
//! notes call out as a correctness-preserving rewrite, not a different
//! algorithm: the leader/limit-bump/release shape is the same.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Per-hart record the barrier owns (spec §3 `Hart`): online/exited flags,
/// the two parallel instruction counters the original's `SyncInfo_t` tracks
/// (`workload_insns`, `kernel_insns`), and whether this hart is currently
/// parked at the barrier.
#[repr(align(64))]
pub struct HartSlot {
    pub index: usize,
    online: AtomicBool,
    exited: AtomicBool,
    waiting: AtomicBool,
    checkpoint_end: AtomicBool,
    workload_insns: AtomicI64,
    kernel_insns: AtomicI64,
    _padding: [u8; 16],
}

impl HartSlot {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            online: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            checkpoint_end: AtomicBool::new(false),
            workload_insns: AtomicI64::new(0),
            kernel_insns: AtomicI64::new(0),
            _padding: [0; 16],
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn set_exited(&self, exited: bool) {
        self.exited.store(exited, Ordering::Release);
    }

    pub fn add_workload_insns(&self, delta: i64) {
        self.workload_insns.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn workload_insns(&self) -> i64 {
        self.workload_insns.load(Ordering::Relaxed)
    }

    pub fn add_kernel_insns(&self, delta: i64) {
        self.kernel_insns.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn kernel_insns(&self) -> i64 {
        self.kernel_insns.load(Ordering::Relaxed)
    }
}

/// Multi-hart sync barrier: every online hart that reaches its
/// `sync_limit` parks here until the last one arrives, at which point one
/// hart (the "leader") is elected to run the commit closure and bump the
/// shared limit before releasing everyone else.
pub struct SyncBarrier {
    slots: Vec<HartSlot>,
    online_count: AtomicUsize,
    /// Monotonically increasing barrier generation; used to distinguish a
    /// hart that is still waiting on the current round from one that has
    /// already been released into the next one.
    wait_id: AtomicUsize,
    /// Count of online harts that have arrived at the current round. The
    /// hart whose `fetch_add` lands on `online_harts()` is elected leader —
    /// unlike a check-then-act scan, incrementing a single atomic counter
    /// guarantees exactly one hart observes that value.
    arrived: AtomicUsize,
    /// One sync limit per hart. `Uniform`/`Simpoint`/`None` keep every
    /// hart's limit identical via `set_sync_limit`/`bump_sync_limit`;
    /// `SyncUniform` with live detail-model feedback can diverge them so a
    /// hart with a higher measured CPI reaches the barrier after fewer
    /// instructions, keeping harts in step by simulated cycle count rather
    /// than raw instruction count (spec §8 scenario 4).
    sync_limits: Vec<AtomicU64>,
}

impl SyncBarrier {
    pub fn new(num_harts: usize, initial_sync_limit: u64) -> Self {
        Self {
            slots: (0..num_harts).map(HartSlot::new).collect(),
            online_count: AtomicUsize::new(0),
            wait_id: AtomicUsize::new(0),
            arrived: AtomicUsize::new(0),
            sync_limits: (0..num_harts).map(|_| AtomicU64::new(initial_sync_limit)).collect(),
        }
    }

    pub fn num_harts(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, hart: usize) -> &HartSlot {
        &self.slots[hart]
    }

    /// Hart 0's sync limit. Valid to read as "the" shared limit whenever
    /// every hart is kept in lockstep via `set_sync_limit`/`bump_sync_limit`.
    pub fn sync_limit(&self) -> u64 {
        self.sync_limits[0].load(Ordering::Acquire)
    }

    pub fn bump_sync_limit(&self, delta: u64) {
        for l in &self.sync_limits {
            l.fetch_add(delta, Ordering::Release);
        }
    }

    /// Overwrite every hart's sync limit identically, used once per round
    /// to mirror the policy's own (possibly non-additive) notion of the
    /// next limit.
    pub fn set_sync_limit(&self, limit: u64) {
        for l in &self.sync_limits {
            l.store(limit, Ordering::Release);
        }
    }

    pub fn hart_sync_limit(&self, hart: usize) -> u64 {
        self.sync_limits[hart].load(Ordering::Acquire)
    }

    /// Override a single hart's sync limit, diverging it from the rest —
    /// used to apply per-hart detail-model CPI scaling.
    pub fn set_hart_sync_limit(&self, hart: usize, limit: u64) {
        self.sync_limits[hart].store(limit, Ordering::Release);
    }

    pub fn mark_online(&self, hart: usize) {
        if !self.slots[hart].is_online() {
            self.slots[hart].set_online(true);
            self.online_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn mark_exited(&self, hart: usize) {
        if !self.slots[hart].is_exited() {
            self.slots[hart].set_exited(true);
            self.online_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn online_harts(&self) -> usize {
        self.online_count.load(Ordering::Acquire)
    }

    /// Whether every hart this barrier was built for is currently online.
    /// A hart that calls in before the rest of the machine has finished
    /// bringing up its harts skips the barrier entirely rather than
    /// synchronizing against a partial set (spec §4.5 step 1's `EXIT`
    /// classification).
    pub fn all_online(&self) -> bool {
        self.online_harts() == self.slots.len()
    }

    /// Park `hart` at the barrier. The last online, non-exited hart to
    /// arrive becomes the leader: `on_release` runs once, under no lock,
    /// with every other hart already spinning, then every hart (including
    /// the leader) is released together.
    ///
    /// `on_first_arrival` runs exactly once per generation, for whichever
    /// hart's arrival brings the round's count to 1 — this is where guest
    /// ticks get frozen and `mtime` gets snapshotted (spec §4.5 step 3),
    /// since that must happen before any hart can observe a stale clock,
    /// not only once the leader is known.
    ///
    /// Returns true if this call was the leader and ran `on_release`.
    pub fn wait<A: FnOnce(), F: FnOnce()>(&self, hart: usize, on_first_arrival: A, on_release: F) -> bool {
        let slot = &self.slots[hart];
        slot.waiting.store(true, Ordering::Release);

        let my_wait_id = self.wait_id.load(Ordering::Acquire);
        let target = self.online_harts().max(1);
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == 1 {
            on_first_arrival();
        }

        if arrived >= target {
            // Leader: every online hart has now arrived at this round. Run
            // the commit closure with everyone else already parked, then
            // release the round.
            on_release();
            for s in &self.slots {
                s.waiting.store(false, Ordering::Release);
            }
            self.arrived.store(0, Ordering::Release);
            self.wait_id.fetch_add(1, Ordering::Release);
            return true;
        }

        while self.wait_id.load(Ordering::Acquire) == my_wait_id && slot.waiting.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_hart_is_always_leader() {
        let barrier = SyncBarrier::new(1, 1_000_000);
        barrier.mark_online(0);
        let ran = std::sync::atomic::AtomicBool::new(false);
        let was_leader = barrier.wait(0, || {}, || ran.store(true, Ordering::Relaxed));
        assert!(was_leader);
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn two_harts_release_together_exactly_one_leader() {
        let barrier = Arc::new(SyncBarrier::new(2, 1_000_000));
        barrier.mark_online(0);
        barrier.mark_online(1);
        let leader_count = Arc::new(AtomicU32::new(0));

        let b0 = barrier.clone();
        let lc0 = leader_count.clone();
        let t0 = thread::spawn(move || {
            if b0.wait(0, || {}, || {}) {
                lc0.fetch_add(1, Ordering::Relaxed);
            }
        });
        let b1 = barrier.clone();
        let lc1 = leader_count.clone();
        let t1 = thread::spawn(move || {
            if b1.wait(1, || {}, || {}) {
                lc1.fetch_add(1, Ordering::Relaxed);
            }
        });
        t0.join().unwrap();
        t1.join().unwrap();
        assert_eq!(leader_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn exited_hart_does_not_block_the_round() {
        let barrier = SyncBarrier::new(2, 1_000_000);
        barrier.mark_online(0);
        barrier.mark_online(1);
        barrier.mark_exited(1);
        let was_leader = barrier.wait(0, || {}, || {});
        assert!(was_leader);
    }

    #[test]
    fn bump_sync_limit_is_visible_after_release() {
        let barrier = SyncBarrier::new(1, 100);
        barrier.mark_online(0);
        barrier.wait(0, || {}, || {});
        barrier.bump_sync_limit(50);
        assert_eq!(barrier.sync_limit(), 150);
    }

    #[test]
    fn per_hart_sync_limit_can_diverge_from_the_rest() {
        let barrier = SyncBarrier::new(2, 1_000);
        assert_eq!(barrier.hart_sync_limit(0), 1_000);
        assert_eq!(barrier.hart_sync_limit(1), 1_000);

        barrier.set_hart_sync_limit(1, 500);
        assert_eq!(barrier.hart_sync_limit(0), 1_000);
        assert_eq!(barrier.hart_sync_limit(1), 500);

        barrier.set_sync_limit(2_000);
        assert_eq!(barrier.hart_sync_limit(0), 2_000);
        assert_eq!(barrier.hart_sync_limit(1), 2_000);
    }

    #[test]
    fn not_all_harts_online_yet_is_reported() {
        let barrier = SyncBarrier::new(2, 1_000);
        barrier.mark_online(0);
        assert!(!barrier.all_online());
        barrier.mark_online(1);
        assert!(barrier.all_online());
    }

    #[test]
    fn on_first_arrival_runs_once_even_when_the_first_arriver_is_also_the_leader() {
        let barrier = SyncBarrier::new(1, 1_000_000);
        barrier.mark_online(0);
        let first_arrivals = std::sync::atomic::AtomicU32::new(0);
        barrier.wait(0, || {
            first_arrivals.fetch_add(1, Ordering::Relaxed);
        }, || {});
        assert_eq!(first_arrivals.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn on_first_arrival_runs_exactly_once_across_two_harts() {
        let barrier = Arc::new(SyncBarrier::new(2, 1_000_000));
        barrier.mark_online(0);
        barrier.mark_online(1);
        let first_arrivals = Arc::new(AtomicU32::new(0));

        let b0 = barrier.clone();
        let fa0 = first_arrivals.clone();
        let t0 = thread::spawn(move || {
            b0.wait(0, || { fa0.fetch_add(1, Ordering::Relaxed); }, || {});
        });
        let b1 = barrier.clone();
        let fa1 = first_arrivals.clone();
        let t1 = thread::spawn(move || {
            b1.wait(1, || { fa1.fetch_add(1, Ordering::Relaxed); }, || {});
        });
        t0.join().unwrap();
        t1.join().unwrap();

        assert_eq!(first_arrivals.load(Ordering::Relaxed), 1, "one first-arrival per generation, not one per hart");
    }
}
