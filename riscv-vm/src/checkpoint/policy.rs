//! Checkpointing policy layer (spec §4.4).
//!
//! Four interchangeable vtables, one per [`super::CheckpointMode`], matching
//! the original's `MODE_DEF_HELPER` macro that instantiates the same seven
//! function pointers (`get_cpt_limit_instructions`, `get_sync_limit_instructions`,
//! `try_take_cpt`, `after_take_cpt`, `try_set_mie`,
//! `update_cpt_limit_instructions`, `update_sync_limit_instructions`) per
//! mode. `NoCheckpoint` is a real implementation, not an `Option`, so the
//! JIT's per-block hook table (`accel/tcg/checkpoint-gen.c`'s
//! `checkpoint_gen_empty_callback`) stays densely populated.

use super::host::MachineHost;
use super::schedule::Schedule;

/// Per-hart decision surface the engine calls on every post-translation-block
/// hook.
pub trait CheckpointPolicy: Send + Sync {
    /// Instruction count at which `hart` should next consider taking a
    /// checkpoint.
    fn get_cpt_limit(&self, hart: usize) -> u64;

    /// Instruction count at which harts should next resynchronize at the
    /// barrier, independent of whether a checkpoint is committed there.
    fn get_sync_limit(&self) -> u64;

    /// Should `hart` take a checkpoint now, having just reached
    /// `insns` executed instructions?
    fn try_take_cpt(&self, hart: usize, insns: u64) -> bool;

    /// Called once a checkpoint has been committed for `hart` at `insns`;
    /// advances any internal schedule cursor.
    fn after_take_cpt(&self, hart: usize, insns: u64);

    /// Bump the per-hart checkpoint limit after a checkpoint (or a
    /// no-checkpoint round), mirroring the original's post-commit
    /// `limit += increment` idiom.
    fn update_cpt_limit(&self, hart: usize);

    /// Bump the shared sync limit once a barrier round completes.
    fn update_sync_limit(&self);

    /// Single-hart policy override: suppress spurious timer wakeups around
    /// a checkpoint boundary by clearing `mie.STIE`/`mie.UTIE` directly.
    fn try_set_mie(&self, hart: usize, host: &dyn MachineHost, num_harts: usize);

    /// Whether this policy has permanently run out of checkpoints to take
    /// (a finite Simpoint schedule with nothing left). `None`/`Uniform`
    /// never exhaust, hence the default.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// The `(location, weight)` pair of the schedule entry a checkpoint
    /// taken for `hart` right now would commit against, for policies backed
    /// by a Simpoint schedule. `None` for policies with no such schedule.
    fn current_simpoint_entry(&self, hart: usize) -> Option<(u64, f64)> {
        let _ = hart;
        None
    }
}

const MIE_STIE: u64 = 1 << 5;
const MIE_UTIE: u64 = 1 << 4;

fn single_hart_clear_timer_mie(hart: usize, host: &dyn MachineHost, num_harts: usize) {
    if num_harts == 1 {
        host.clear_mie_bits(hart, MIE_STIE | MIE_UTIE);
    }
}

/// No checkpoints are ever taken; limits are effectively infinite so the
/// barrier still runs (keeping multi-hart sync alive) without ever
/// committing anything.
pub struct NoCheckpoint;

impl CheckpointPolicy for NoCheckpoint {
    fn get_cpt_limit(&self, _hart: usize) -> u64 {
        u64::MAX
    }

    fn get_sync_limit(&self) -> u64 {
        u64::MAX
    }

    fn try_take_cpt(&self, _hart: usize, _insns: u64) -> bool {
        false
    }

    fn after_take_cpt(&self, _hart: usize, _insns: u64) {}

    fn update_cpt_limit(&self, _hart: usize) {}

    fn update_sync_limit(&self) {}

    fn try_set_mie(&self, _hart: usize, _host: &dyn MachineHost, _num_harts: usize) {}
}

/// One checkpoint every `interval` instructions, forever, per hart.
pub struct UniformCheckpoint {
    interval: u64,
    limits: Vec<std::sync::atomic::AtomicU64>,
    sync_limit: std::sync::atomic::AtomicU64,
}

impl UniformCheckpoint {
    pub fn new(num_harts: usize, interval: u64, sync_interval: u64) -> Self {
        Self {
            interval,
            limits: (0..num_harts)
                .map(|_| std::sync::atomic::AtomicU64::new(interval))
                .collect(),
            sync_limit: std::sync::atomic::AtomicU64::new(sync_interval),
        }
    }
}

impl CheckpointPolicy for UniformCheckpoint {
    fn get_cpt_limit(&self, hart: usize) -> u64 {
        self.limits[hart].load(std::sync::atomic::Ordering::Acquire)
    }

    fn get_sync_limit(&self) -> u64 {
        self.sync_limit.load(std::sync::atomic::Ordering::Acquire)
    }

    fn try_take_cpt(&self, hart: usize, insns: u64) -> bool {
        insns >= self.get_cpt_limit(hart)
    }

    fn after_take_cpt(&self, _hart: usize, _insns: u64) {}

    fn update_cpt_limit(&self, hart: usize) {
        self.limits[hart].fetch_add(self.interval, std::sync::atomic::Ordering::Release);
    }

    fn update_sync_limit(&self) {
        self.sync_limit.fetch_add(self.interval, std::sync::atomic::Ordering::Release);
    }

    fn try_set_mie(&self, hart: usize, host: &dyn MachineHost, num_harts: usize) {
        single_hart_clear_timer_mie(hart, host, num_harts);
    }
}

/// Checkpoints at the instruction counts named by a loaded Simpoint
/// schedule; each location is taken once, in ascending order.
///
/// A schedule entry's `location` is a cluster *index* into fixed-size
/// `interval_size`-instruction windows (the same unit `UniformCheckpoint`
/// counts in), not an absolute instruction count — so the instruction
/// threshold for a given entry is `location * interval_size`, plus any
/// warmup run before the checkpoint window is considered representative.
pub struct SimpointCheckpoint {
    schedule: Schedule,
    warmup_interval: u64,
    interval_size: u64,
    /// The last finite limit handed out, kept current while entries
    /// remain. Once the schedule is exhausted this keeps ticking forward
    /// by `interval_size` every round instead of jumping to an
    /// unreachable limit, so the barrier still gets entered (spec §8
    /// scenario 3's "shutdown requested on 4th barrier entry" needs a
    /// 4th entry to exist at all).
    tail_limit: std::sync::atomic::AtomicU64,
}

impl SimpointCheckpoint {
    pub fn new(schedule: Schedule, warmup_interval: u64, interval_size: u64) -> Self {
        Self {
            schedule,
            warmup_interval,
            interval_size,
            tail_limit: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn next_limit(&self) -> u64 {
        match self.schedule.peek_next() {
            Some(entry) => {
                let limit = entry.location.saturating_mul(self.interval_size) + self.warmup_interval;
                self.tail_limit.store(limit, std::sync::atomic::Ordering::Release);
                limit
            }
            None => self.tail_limit.load(std::sync::atomic::Ordering::Acquire),
        }
    }
}

impl CheckpointPolicy for SimpointCheckpoint {
    fn get_cpt_limit(&self, _hart: usize) -> u64 {
        self.next_limit()
    }

    fn get_sync_limit(&self) -> u64 {
        self.next_limit()
    }

    fn try_take_cpt(&self, _hart: usize, insns: u64) -> bool {
        !self.schedule.is_exhausted() && insns >= self.next_limit()
    }

    fn after_take_cpt(&self, _hart: usize, _insns: u64) {
        self.schedule.advance();
    }

    fn update_cpt_limit(&self, _hart: usize) {}

    fn update_sync_limit(&self) {
        if self.schedule.is_exhausted() {
            self.tail_limit
                .fetch_add(self.interval_size.max(1), std::sync::atomic::Ordering::AcqRel);
        }
    }

    fn try_set_mie(&self, hart: usize, host: &dyn MachineHost, num_harts: usize) {
        single_hart_clear_timer_mie(hart, host, num_harts);
    }

    fn is_exhausted(&self) -> bool {
        self.schedule.is_exhausted()
    }

    fn current_simpoint_entry(&self, _hart: usize) -> Option<(u64, f64)> {
        self.schedule.peek_next().map(|e| (e.location, e.weight))
    }
}

/// Uniform checkpointing (identical cpt schedule to [`UniformCheckpoint`], no
/// Simpoint schedule involved) whose per-hart sync targets the engine
/// additionally scales by CPI feedback from an external detailed timing
/// model once a `Detail2Qemu` reply lands. The scaling itself lives in
/// `Engine::on_post_tb` (it needs the live IPC reply, which this policy
/// doesn't hold); this type only supplies the same nominal cpt/sync
/// progression `UniformCheckpoint` would, which the engine treats as the
/// unscaled baseline.
pub struct SyncUniformCheckpoint {
    uniform: UniformCheckpoint,
}

impl SyncUniformCheckpoint {
    pub fn new(num_harts: usize, cpt_interval: u64, sync_interval: u64) -> Self {
        Self {
            uniform: UniformCheckpoint::new(num_harts, cpt_interval, sync_interval),
        }
    }
}

impl CheckpointPolicy for SyncUniformCheckpoint {
    fn get_cpt_limit(&self, hart: usize) -> u64 {
        self.uniform.get_cpt_limit(hart)
    }

    fn get_sync_limit(&self) -> u64 {
        self.uniform.get_sync_limit()
    }

    fn try_take_cpt(&self, hart: usize, insns: u64) -> bool {
        self.uniform.try_take_cpt(hart, insns)
    }

    fn after_take_cpt(&self, hart: usize, insns: u64) {
        self.uniform.after_take_cpt(hart, insns);
    }

    fn update_cpt_limit(&self, hart: usize) {
        self.uniform.update_cpt_limit(hart);
    }

    fn update_sync_limit(&self) {
        self.uniform.update_sync_limit();
    }

    fn try_set_mie(&self, hart: usize, host: &dyn MachineHost, num_harts: usize) {
        self.uniform.try_set_mie(hart, host, num_harts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::host::fake::FakeHost;
    use crate::checkpoint::schedule::SimpointEntry;

    #[test]
    fn no_checkpoint_never_fires() {
        let policy = NoCheckpoint;
        assert!(!policy.try_take_cpt(0, u64::MAX - 1));
    }

    #[test]
    fn uniform_fires_at_each_interval_and_advances() {
        let policy = UniformCheckpoint::new(1, 100, 100);
        assert!(!policy.try_take_cpt(0, 50));
        assert!(policy.try_take_cpt(0, 100));
        policy.update_cpt_limit(0);
        assert_eq!(policy.get_cpt_limit(0), 200);
        assert!(!policy.try_take_cpt(0, 150));
        assert!(policy.try_take_cpt(0, 200));
    }

    #[test]
    fn simpoint_fires_once_per_location_in_order() {
        let schedule = Schedule::new(vec![
            SimpointEntry { location: 1, weight: 0.5 },
            SimpointEntry { location: 2, weight: 0.5 },
        ]);
        let policy = SimpointCheckpoint::new(schedule, 0, 100);
        assert!(!policy.try_take_cpt(0, 99));
        assert!(policy.try_take_cpt(0, 100));
        policy.after_take_cpt(0, 100);
        assert!(!policy.try_take_cpt(0, 150));
        assert!(policy.try_take_cpt(0, 200));
        policy.after_take_cpt(0, 200);
        assert!(!policy.try_take_cpt(0, u64::MAX - 1));
    }

    #[test]
    fn simpoint_location_is_scaled_by_interval_size() {
        let schedule = Schedule::new(vec![SimpointEntry { location: 100, weight: 0.5 }]);
        let policy = SimpointCheckpoint::new(schedule, 0, 10_000);
        assert_eq!(policy.get_cpt_limit(0), 1_000_000);
        assert!(!policy.try_take_cpt(0, 999_999));
        assert!(policy.try_take_cpt(0, 1_000_000));
    }

    #[test]
    fn simpoint_warmup_interval_adds_past_the_scaled_location() {
        let schedule = Schedule::new(vec![SimpointEntry { location: 1, weight: 0.5 }]);
        let policy = SimpointCheckpoint::new(schedule, 500, 10_000);
        assert_eq!(policy.get_cpt_limit(0), 10_500);
    }

    #[test]
    fn single_hart_policies_clear_timer_mie() {
        let host = FakeHost::new(1, 4096);
        let policy = UniformCheckpoint::new(1, 100, 100);
        policy.try_set_mie(0, host.as_ref(), 1);
        assert_eq!(host.mie.lock().unwrap()[0] & (MIE_STIE | MIE_UTIE), 0);
    }

    #[test]
    fn multi_hart_does_not_clear_timer_mie() {
        let host = FakeHost::new(2, 4096);
        let policy = UniformCheckpoint::new(2, 100, 100);
        policy.try_set_mie(0, host.as_ref(), 2);
        assert_ne!(host.mie.lock().unwrap()[0] & (MIE_STIE | MIE_UTIE), 0);
    }

    #[test]
    fn sync_uniform_follows_the_same_cpt_schedule_as_uniform_with_no_simpoint_entry() {
        let policy = SyncUniformCheckpoint::new(1, 100, 100);
        assert!(policy.current_simpoint_entry(0).is_none());
        assert!(!policy.try_take_cpt(0, 99));
        assert!(policy.try_take_cpt(0, 100));
        policy.update_cpt_limit(0);
        assert_eq!(policy.get_cpt_limit(0), 200);
    }

    #[test]
    fn simpoint_exposes_current_entry_until_advanced() {
        let schedule = Schedule::new(vec![SimpointEntry { location: 1, weight: 0.3 }, SimpointEntry { location: 2, weight: 0.7 }]);
        let policy = SimpointCheckpoint::new(schedule, 0, 100);
        assert_eq!(policy.current_simpoint_entry(0), Some((1, 0.3)));
        policy.after_take_cpt(0, 100);
        assert_eq!(policy.current_simpoint_entry(0), Some((2, 0.7)));
    }
}
