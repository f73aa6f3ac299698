//! Top-level checkpoint engine (spec §3, §4.1).
//!
//! Ties the barrier, policy, serializer, writer, and optional detail-model
//! link together behind the single entry point the emulator calls:
//! [`Engine::on_post_tb`], invoked once per executed translation block per
//! hart (spec §6's `register_post_tb_callback`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::barrier::SyncBarrier;
use super::error::{EngineError, Result};
use super::host::MachineHost;
use super::ipc::{DetailModelLink, Qemu2Detail, SyncControlInfo};
use super::layout::{CheckpointHeader, DEFAULT_MEMLAYOUT, SINGLE_CORE_SIZE};
use super::policy::{CheckpointPolicy, NoCheckpoint, SimpointCheckpoint, SyncUniformCheckpoint, UniformCheckpoint};
use super::schedule::{simpoint_checkpoint_path, uniform_checkpoint_path, Schedule};
use super::serializer::serialize_hart;
use super::writer::{build_payload, commit, CheckpointWriter, FsCheckpointWriter};
use super::{CheckpointMode, EngineConfig};

pub struct Engine {
    config: EngineConfig,
    host: Arc<dyn MachineHost>,
    policy: Box<dyn CheckpointPolicy>,
    barrier: SyncBarrier,
    writer: Box<dyn CheckpointWriter>,
    detail_link: Option<DetailModelLink>,
    sync_info: Arc<SyncControlInfo>,
    next_cluster_id: AtomicU32,
    committed: AtomicU64,
    /// Guest `mtime` as observed at the start of the barrier generation
    /// currently in flight, frozen by the first hart to arrive and held
    /// fixed until the next generation's first arrival overwrites it (spec
    /// §4.1, §4.5 step 3). Every hart serializes against this value rather
    /// than a live CLINT read so a round's checkpoints agree on the clock.
    global_mtime: AtomicU64,
    /// Set once the detail-model link has failed; further rounds skip it
    /// and fall back to running on the schedule/uniform limits alone.
    ipc_disabled: AtomicBool,
    /// Set once a shutdown has been requested, so a permanently-exhausted
    /// schedule doesn't call `request_shutdown` on every remaining round.
    shutdown_signaled: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig, host: Arc<dyn MachineHost>) -> Result<Self> {
        config.validate()?;

        let policy: Box<dyn CheckpointPolicy> = match config.mode {
            CheckpointMode::None => Box::new(NoCheckpoint),
            CheckpointMode::Uniform => Box::new(UniformCheckpoint::new(config.num_harts, config.cpt_interval, config.sync_interval)),
            CheckpointMode::Simpoint => {
                let dir = config
                    .simpoint_path
                    .as_deref()
                    .ok_or_else(|| EngineError::Config("simpoint_path missing after validate()".into()))?;
                let schedule = Schedule::load(dir)?;
                Box::new(SimpointCheckpoint::new(schedule, config.warmup_interval, config.cpt_interval))
            }
            CheckpointMode::SyncUniform => Box::new(SyncUniformCheckpoint::new(config.num_harts, config.cpt_interval, config.sync_interval)),
        };

        let barrier = SyncBarrier::new(config.num_harts, policy.get_sync_limit());
        let skip_boot = config.skip_boot;

        let detail_link = match &config.detail_model_fifo {
            Some(base) => Some(DetailModelLink::open(base)?),
            None => None,
        };

        let engine = Self {
            config,
            host,
            policy,
            barrier,
            writer: Box::new(FsCheckpointWriter),
            detail_link,
            sync_info: Arc::new(SyncControlInfo::new()),
            next_cluster_id: AtomicU32::new(0),
            committed: AtomicU64::new(0),
            global_mtime: AtomicU64::new(0),
            ipc_disabled: AtomicBool::new(false),
            shutdown_signaled: AtomicBool::new(false),
        };
        if skip_boot {
            engine.mark_hart_online(0);
        }
        Ok(engine)
    }

    /// Marks `hart` online and, the first time this happens for it, snapshots
    /// its current `profiling_insns` as `kernel_insns` (spec §3: "snapshot of
    /// `profiling_insns` at `online` transition; workload-relative counts
    /// subtract this"). `add_kernel_insns` is delta-based, so the snapshot is
    /// taken as one `(target - current)` adjustment rather than an absolute
    /// overwrite.
    pub fn mark_hart_online(&self, hart: usize) {
        let slot = self.barrier.slot(hart);
        if !slot.is_online() {
            let target = self.host.profiling_insns(hart) as i64;
            slot.add_kernel_insns(target - slot.kernel_insns());
        }
        self.barrier.mark_online(hart);
    }

    pub fn mark_hart_exited(&self, hart: usize) {
        self.barrier.mark_exited(hart);
    }

    pub fn checkpoints_committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn hart_sync_limit_for_test(&self, hart: usize) -> u64 {
        self.barrier.hart_sync_limit(hart)
    }

    #[cfg(test)]
    fn global_mtime_for_test(&self) -> u64 {
        self.global_mtime.load(Ordering::Acquire)
    }

    /// `profiling_insns(hart) - kernel_insns(hart)`, the workload-relative
    /// instruction count spec §3/§4.5 compare against the cpt/sync limits
    /// (kernel instructions run before the `online` transition don't count
    /// towards either). Also refreshes the cached `workload_insns` counter
    /// via `add_kernel_insns`'s sibling `add_workload_insns`, expressed as
    /// one delta so the accessor stays additive rather than becoming a
    /// disguised setter.
    fn workload_insns(&self, hart: usize) -> u64 {
        let slot = self.barrier.slot(hart);
        let delta = self.host.profiling_insns(hart) as i64 - slot.kernel_insns();
        slot.add_workload_insns(delta - slot.workload_insns());
        delta.max(0) as u64
    }

    /// Called once per executed translation block for `hart`, with
    /// `exit_sync_period` set by the caller when a trap or WFI ended the
    /// guest-visible workload for this block (spec §4.5 step 1, §6).
    /// Classifies the hart (`EXIT` / `WAIT` / `RUNNING`): a hart that calls
    /// in before every hart in the machine is online skips the barrier
    /// entirely (`EXIT`); otherwise a hart that just exited its sync period,
    /// is halted, or has reached its per-hart sync target parks at the
    /// barrier (`WAIT`); everything else returns to guest execution
    /// immediately (`RUNNING`). The barrier's leader evaluates every online
    /// hart's policy and commits whichever checkpoints are due, then
    /// advances the shared limits for the next round.
    pub fn on_post_tb(&self, hart: usize, exit_sync_period: bool) -> Result<()> {
        self.policy.try_set_mie(hart, self.host.as_ref(), self.config.num_harts);

        if !self.barrier.all_online() {
            return Ok(());
        }

        let workload_insns = self.workload_insns(hart);
        let should_wait = exit_sync_period || self.host.is_halted(hart) || workload_insns >= self.barrier.hart_sync_limit(hart);
        if !should_wait {
            return Ok(());
        }

        let mut commit_err = None;
        self.barrier.wait(
            hart,
            || {
                self.global_mtime.store(self.host.snapshot_mtime(), Ordering::Release);
            },
            || {
                // Captured before this round's commits run: a schedule that
                // exhausts *during* this round should still let the round
                // finish normally and only trigger shutdown starting the
                // round after, matching "shutdown requested on the 4th
                // barrier entry" when the 3rd commit is what empties it.
                let was_exhausted = self.policy.is_exhausted();

                for h in 0..self.barrier.num_harts() {
                    if !self.barrier.slot(h).is_online() || self.barrier.slot(h).is_exited() {
                        continue;
                    }
                    let h_insns = self.workload_insns(h);
                    if self.policy.try_take_cpt(h, h_insns) {
                        if let Err(e) = self.commit_checkpoint(h, h_insns) {
                            commit_err = Some(e);
                        }
                        self.policy.after_take_cpt(h, h_insns);
                    }
                    self.policy.update_cpt_limit(h);
                }
                self.policy.update_sync_limit();
                let nominal = self.policy.get_sync_limit();
                match self.sync_info.consume() {
                    // A fresh detail-model reply landed this round: scale each
                    // hart's next limit by its measured CPI so a slower hart
                    // (higher CPI) reaches the barrier after fewer
                    // instructions, keeping harts in step by simulated cycle
                    // count rather than raw instruction count.
                    Some(info) => {
                        for h in 0..self.barrier.num_harts() {
                            let cpi = info.cpi[h.min(super::ipc::MAX_HARTS - 1)];
                            let scaled = if cpi > 0.0 { (nominal as f64 / cpi).round() as u64 } else { nominal };
                            self.barrier.set_hart_sync_limit(h, scaled);
                        }
                    }
                    None => self.barrier.set_sync_limit(nominal),
                }

                if was_exhausted && !self.shutdown_signaled.swap(true, Ordering::AcqRel) {
                    log::info!(target: "checkpoint", "schedule exhausted, requesting shutdown");
                    self.host.request_shutdown("simpoint schedule exhausted");
                }
            },
        );

        if let Some(e) = commit_err {
            log::error!(target: "checkpoint", "commit_failed hart={hart}: {e}");
        }
        Ok(())
    }

    fn checkpoint_path(&self, hart: usize, insns: u64) -> PathBuf {
        match self.config.mode {
            CheckpointMode::Simpoint => match self.policy.current_simpoint_entry(hart) {
                Some((location, weight)) => simpoint_checkpoint_path(&self.config.base_dir, &self.config.workload_name, location, weight),
                None => uniform_checkpoint_path(&self.config.base_dir, &self.config.workload_name, insns),
            },
            _ => uniform_checkpoint_path(&self.config.base_dir, &self.config.workload_name, insns),
        }
    }

    fn commit_checkpoint(&self, hart: usize, insns: u64) -> Result<()> {
        let layout = DEFAULT_MEMLAYOUT;
        let header = CheckpointHeader::new(self.host.cpus() as u32);
        let global_mtime = self.global_mtime.load(Ordering::Acquire);

        let mut per_hart = Vec::with_capacity(self.host.cpus());
        for h in 0..self.host.cpus() {
            per_hart.push(serialize_hart(self.host.as_ref(), h, &layout, SINGLE_CORE_SIZE as usize, global_mtime));
        }
        let ram = self.host.probe_memory_and_copy(crate::dram::DRAM_BASE, self.host.memory_len());
        let payload = build_payload(&header, &layout, &per_hart, &ram);

        let path = self.checkpoint_path(hart, insns);
        let size = commit(self.writer.as_ref(), &path, &payload)?;

        self.committed.fetch_add(1, Ordering::Relaxed);
        log::info!(
            target: "checkpoint",
            "committed checkpoint hart={hart} insns={insns} path={} bytes={size}",
            path.display()
        );

        if self.config.mode == CheckpointMode::SyncUniform {
            if let Some(link) = &self.detail_link {
                if !self.ipc_disabled.load(Ordering::Acquire) {
                    let cluster_id = self.next_cluster_id.fetch_add(1, Ordering::Relaxed);
                    let round_trip = link
                        .send(&Qemu2Detail {
                            cpt_ready: 1,
                            _pad: [0; 7],
                            cpt_id: cluster_id,
                            _pad2: [0; 4],
                            total_inst_count: insns,
                        })
                        .and_then(|()| link.recv());

                    match round_trip {
                        Ok(reply) => self.sync_info.set(reply, 1),
                        Err(e) => {
                            log::error!(target: "checkpoint", "detail model link failed, downgrading: {e}");
                            self.ipc_disabled.store(true, Ordering::Release);
                            if !self.shutdown_signaled.swap(true, Ordering::AcqRel) {
                                self.host.request_shutdown("detail model link failure");
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::host::fake::FakeHost;

    fn config(mode: CheckpointMode, base_dir: PathBuf) -> EngineConfig {
        EngineConfig {
            mode,
            num_harts: 1,
            base_dir,
            config_name: "cfg".into(),
            workload_name: "wl".into(),
            cpt_interval: 100,
            sync_interval: 100,
            warmup_interval: 0,
            simpoint_path: None,
            skip_boot: true,
            detail_model_fifo: None,
        }
    }

    #[test]
    fn none_mode_never_commits() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        let engine = Engine::new(config(CheckpointMode::None, tmp.path().to_path_buf()), host.clone()).unwrap();
        host.advance(0, 10_000);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(engine.checkpoints_committed(), 0);
    }

    #[test]
    fn uniform_mode_commits_once_interval_is_reached() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        let engine = Engine::new(config(CheckpointMode::Uniform, tmp.path().to_path_buf()), host.clone()).unwrap();

        host.advance(0, 50);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(engine.checkpoints_committed(), 0);

        host.advance(0, 50);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(engine.checkpoints_committed(), 1);
    }

    #[test]
    fn uniform_mode_commits_repeatedly_across_rounds() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        let engine = Engine::new(config(CheckpointMode::Uniform, tmp.path().to_path_buf()), host.clone()).unwrap();

        for _ in 0..3 {
            host.advance(0, 100);
            engine.on_post_tb(0, false).unwrap();
        }
        assert_eq!(engine.checkpoints_committed(), 3);
    }

    /// Two harts advancing at different rates still resynchronize at every
    /// `sync_interval` crossing and agree on one checkpoint per crossing,
    /// with hart 0 running at twice hart 1's instruction rate.
    #[test]
    fn two_harts_at_different_rates_stay_in_lockstep() {
        use std::sync::Arc;
        use std::thread;

        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(2, 8192);
        let mut cfg = config(CheckpointMode::Uniform, tmp.path().to_path_buf());
        cfg.num_harts = 2;
        cfg.cpt_interval = 1_000;
        cfg.sync_interval = 1_000;
        let engine = Arc::new(Engine::new(cfg, host.clone()).unwrap());
        engine.mark_hart_online(1);

        let e0 = engine.clone();
        let h0 = host.clone();
        let t0 = thread::spawn(move || {
            for _ in 0..30 {
                h0.advance(0, 100);
                e0.on_post_tb(0, false).unwrap();
            }
        });

        let e1 = engine.clone();
        let h1 = host.clone();
        let t1 = thread::spawn(move || {
            for _ in 0..60 {
                h1.advance(1, 50);
                e1.on_post_tb(1, false).unwrap();
            }
        });

        t0.join().unwrap();
        t1.join().unwrap();

        assert_eq!(host.profiling_insns(0), 3_000);
        assert_eq!(host.profiling_insns(1), 3_000);
        assert_eq!(engine.checkpoints_committed(), 6);
    }

    /// A finite Simpoint schedule fires its three checkpoints, then — one
    /// barrier round later, once the engine notices nothing is left —
    /// asks the host to shut down without ever taking a fourth checkpoint.
    #[test]
    fn simpoint_schedule_exhaustion_requests_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let simpoints_dir = tmp.path().join("simpoints");
        std::fs::create_dir_all(&simpoints_dir).unwrap();
        std::fs::write(simpoints_dir.join("simpoints0"), "1 0\n2 1\n3 2\n").unwrap();
        std::fs::write(simpoints_dir.join("weights0"), "0.3 0\n0.3 1\n0.4 2\n").unwrap();

        let host = FakeHost::new(1, 8192);
        let mut cfg = config(CheckpointMode::Simpoint, tmp.path().join("out"));
        cfg.simpoint_path = Some(simpoints_dir);
        cfg.cpt_interval = 10_000;
        let engine = Engine::new(cfg, host.clone()).unwrap();

        for target in [10_000, 20_000, 30_000] {
            host.advance(0, target - host.profiling_insns(0));
            engine.on_post_tb(0, false).unwrap();
        }
        assert_eq!(engine.checkpoints_committed(), 3);
        assert!(!host.shutdown_requested.load(std::sync::atomic::Ordering::Relaxed));

        // Fourth barrier entry, one tail tick (`interval_size`) past the
        // last location: the schedule is exhausted and the engine asks
        // the host to shut down, without taking another checkpoint.
        host.advance(0, 10_000);
        engine.on_post_tb(0, false).unwrap();
        assert!(host.shutdown_requested.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(engine.checkpoints_committed(), 3);
    }

    /// SyncUniform with a live detail-model link: after one round-trip
    /// delivers `cpi = [1.0, 2.0]`, hart 1 (twice the CPI) gets half hart
    /// 0's next sync limit, so it resynchronizes after half as many
    /// instructions rather than the same raw count.
    #[test]
    fn sync_uniform_applies_detail_model_cpi_feedback() {
        use crate::checkpoint::ipc::{Detail2Qemu, Qemu2Detail};
        use bytemuck::Zeroable;
        use std::fs::File;
        use std::io::{Read, Write};
        use std::sync::Arc;
        use std::thread;

        let tmp = tempfile::tempdir().unwrap();
        let fifo_base = tmp.path().join("detail_link");
        let mut q2d_path = fifo_base.clone().into_os_string();
        q2d_path.push(".q2d");
        let q2d_path = PathBuf::from(q2d_path);
        let mut d2q_path = fifo_base.clone().into_os_string();
        d2q_path.push(".d2q");
        let d2q_path = PathBuf::from(d2q_path);

        nix::unistd::mkfifo(&q2d_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        nix::unistd::mkfifo(&d2q_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        let reader_q2d = q2d_path.clone();
        let writer_d2q = d2q_path.clone();
        let responder = thread::spawn(move || {
            let mut f = File::open(&reader_q2d).unwrap();
            let mut buf = [0u8; std::mem::size_of::<Qemu2Detail>()];
            f.read_exact(&mut buf).unwrap();

            let mut out = File::create(&writer_d2q).unwrap();
            let mut reply = Detail2Qemu::zeroed();
            reply.cpi[0] = 1.0;
            reply.cpi[1] = 2.0;
            out.write_all(bytemuck::bytes_of(&reply)).unwrap();
        });

        let host = FakeHost::new(2, 8192);
        let mut cfg = config(CheckpointMode::SyncUniform, tmp.path().join("out"));
        cfg.num_harts = 2;
        cfg.cpt_interval = 500_000;
        cfg.sync_interval = 500_000;
        cfg.detail_model_fifo = Some(fifo_base);
        // `Engine::new` opens the FIFOs, which blocks until the responder
        // thread above has both ends open too.
        let engine = Arc::new(Engine::new(cfg, host.clone()).unwrap());
        engine.mark_hart_online(1);
        responder.join().unwrap();

        let e0 = engine.clone();
        let h0 = host.clone();
        let t0 = thread::spawn(move || {
            h0.advance(0, 500_000);
            e0.on_post_tb(0, false).unwrap();
        });
        let e1 = engine.clone();
        let h1 = host.clone();
        let t1 = thread::spawn(move || {
            h1.advance(1, 500_000);
            e1.on_post_tb(1, false).unwrap();
        });
        t0.join().unwrap();
        t1.join().unwrap();

        assert_eq!(engine.checkpoints_committed(), 2);
        let hart0_limit = engine.hart_sync_limit_for_test(0);
        let hart1_limit = engine.hart_sync_limit_for_test(1);
        assert_eq!(hart0_limit, 2 * hart1_limit, "cpi=2.0 hart should get half the sync limit");
    }

    /// A broken detail-model pipe is logged and downgrades the link
    /// (no further IPC attempted) and requests shutdown, but never
    /// panics and never blocks the checkpoint that was already written.
    #[test]
    fn ipc_failure_downgrades_and_requests_shutdown_without_crashing() {
        use std::fs::File;

        let tmp = tempfile::tempdir().unwrap();
        let fifo_base = tmp.path().join("detail_link");
        let mut q2d_path = fifo_base.clone().into_os_string();
        q2d_path.push(".q2d");
        let q2d_path = PathBuf::from(q2d_path);
        let mut d2q_path = fifo_base.clone().into_os_string();
        d2q_path.push(".d2q");
        let d2q_path = PathBuf::from(d2q_path);
        nix::unistd::mkfifo(&q2d_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        nix::unistd::mkfifo(&d2q_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        let reader_q2d = q2d_path.clone();
        let writer_d2q = d2q_path.clone();
        let peer = std::thread::spawn(move || {
            // Open both ends to unblock the engine's own open, then drop
            // them immediately so the engine's later writes see a closed
            // pipe instead of hanging.
            let _r = File::open(&reader_q2d).unwrap();
            let _w = File::create(&writer_d2q).unwrap();
        });

        let host = FakeHost::new(1, 8192);
        // SyncUniform, not Uniform: `commit_checkpoint` only attempts the
        // detail-model round trip in that mode (spec §4.7), so this test
        // must actually run in it to exercise the failure path at all.
        let mut cfg = config(CheckpointMode::SyncUniform, tmp.path().join("out"));
        cfg.cpt_interval = 100;
        cfg.sync_interval = 100;
        cfg.detail_model_fifo = Some(fifo_base);
        let engine = Engine::new(cfg, host.clone()).unwrap();
        peer.join().unwrap();

        host.advance(0, 100);
        // The peer's ends are already closed by the time this commits, so
        // the detail-model round trip fails. Must not panic.
        engine.on_post_tb(0, false).unwrap();

        assert_eq!(engine.checkpoints_committed(), 1);
        assert!(host.shutdown_requested.load(std::sync::atomic::Ordering::Relaxed));
    }

    /// Same broken-pipe setup as above, but in plain `Uniform` mode: the
    /// detail-model link is only meant to be live under `SyncUniform` (spec
    /// §4.7), so even with a `detail_model_fifo` configured and already
    /// broken, a committed checkpoint must not trip the IPC failure path.
    #[test]
    fn uniform_mode_never_touches_the_detail_model_link() {
        use std::fs::File;

        let tmp = tempfile::tempdir().unwrap();
        let fifo_base = tmp.path().join("detail_link");
        let mut q2d_path = fifo_base.clone().into_os_string();
        q2d_path.push(".q2d");
        let q2d_path = PathBuf::from(q2d_path);
        let mut d2q_path = fifo_base.clone().into_os_string();
        d2q_path.push(".d2q");
        let d2q_path = PathBuf::from(d2q_path);
        nix::unistd::mkfifo(&q2d_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        nix::unistd::mkfifo(&d2q_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        let reader_q2d = q2d_path.clone();
        let writer_d2q = d2q_path.clone();
        let peer = std::thread::spawn(move || {
            let _r = File::open(&reader_q2d).unwrap();
            let _w = File::create(&writer_d2q).unwrap();
        });

        let host = FakeHost::new(1, 8192);
        let mut cfg = config(CheckpointMode::Uniform, tmp.path().join("out"));
        cfg.cpt_interval = 100;
        cfg.sync_interval = 100;
        cfg.detail_model_fifo = Some(fifo_base);
        let engine = Engine::new(cfg, host.clone()).unwrap();
        peer.join().unwrap();

        host.advance(0, 100);
        engine.on_post_tb(0, false).unwrap();

        assert_eq!(engine.checkpoints_committed(), 1);
        assert!(
            !host.shutdown_requested.load(std::sync::atomic::Ordering::Relaxed),
            "Uniform mode must never attempt the detail-model round trip, broken or not"
        );
    }

    /// A hart that only goes online after already accumulating instructions
    /// (e.g. boot-time execution before the guest's before-workload marker)
    /// must have those instructions excluded from its workload count: the
    /// cpt interval is measured from the `online` transition, not from zero.
    #[test]
    fn late_online_hart_excludes_pre_online_instructions_from_its_workload_count() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        let mut cfg = config(CheckpointMode::Uniform, tmp.path().to_path_buf());
        cfg.skip_boot = false;
        let engine = Engine::new(cfg, host.clone()).unwrap();

        host.advance(0, 10_000);
        engine.mark_hart_online(0);

        host.advance(0, 50);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(engine.checkpoints_committed(), 0, "50 workload instructions is nowhere near the 100 interval");

        host.advance(0, 50);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(engine.checkpoints_committed(), 1, "100 workload instructions since online should commit");
    }

    /// `exit_sync_period` forces a hart into the barrier even though it is
    /// far short of its instruction-count sync limit, matching spec §4.5
    /// step 1's `WAIT` classification for a trap/WFI boundary. The sync
    /// limit bump every barrier round performs is the observable proof a
    /// round actually ran, since the checkpoint interval itself is untouched
    /// at `insns=1`.
    #[test]
    fn exit_sync_period_forces_barrier_entry_before_the_sync_limit_is_reached() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        let mut cfg = config(CheckpointMode::Uniform, tmp.path().to_path_buf());
        cfg.sync_interval = 1_000;
        let engine = Engine::new(cfg, host.clone()).unwrap();
        assert_eq!(engine.hart_sync_limit_for_test(0), 1_000);

        host.advance(0, 1);
        engine.on_post_tb(0, true).unwrap();
        assert_eq!(
            engine.hart_sync_limit_for_test(0),
            1_100,
            "exit_sync_period must force a barrier round (and its sync-limit bump) even at insns=1"
        );
    }

    /// A halted hart (parked in WFI) is swept into the barrier the same way
    /// as one that reached its sync limit, per spec §4.5 step 1's `WAIT`
    /// classification.
    #[test]
    fn halted_hart_forces_barrier_entry_before_the_sync_limit_is_reached() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        host.halted[0].store(true, std::sync::atomic::Ordering::Relaxed);
        let mut cfg = config(CheckpointMode::Uniform, tmp.path().to_path_buf());
        cfg.sync_interval = 1_000;
        let engine = Engine::new(cfg, host.clone()).unwrap();

        host.advance(0, 1);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(
            engine.hart_sync_limit_for_test(0),
            1_100,
            "a halted hart must enter the barrier regardless of its insns count"
        );
    }

    /// A hart that calls in before every hart in the machine has gone
    /// online skips the barrier entirely (spec §4.5 step 1's `EXIT`
    /// classification) rather than synchronizing against a partial set.
    #[test]
    fn not_all_harts_online_skips_the_barrier_even_past_the_sync_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(2, 8192);
        let mut cfg = config(CheckpointMode::Uniform, tmp.path().to_path_buf());
        cfg.num_harts = 2;
        cfg.skip_boot = true;
        let engine = Engine::new(cfg, host.clone()).unwrap();

        host.advance(0, 10_000);
        engine.on_post_tb(0, true).unwrap();
        assert_eq!(engine.checkpoints_committed(), 0, "hart 1 is still offline, so hart 0 must not enter the barrier");
    }

    /// `mtime` is frozen exactly once per barrier generation, at whichever
    /// hart's arrival is first, and every checkpoint serialized during that
    /// generation sees that same frozen value rather than a live read.
    #[test]
    fn global_mtime_is_frozen_at_first_barrier_arrival() {
        let tmp = tempfile::tempdir().unwrap();
        let host = FakeHost::new(1, 8192);
        let engine = Engine::new(config(CheckpointMode::Uniform, tmp.path().to_path_buf()), host.clone()).unwrap();

        host.mtime.store(0x42, std::sync::atomic::Ordering::Relaxed);
        host.advance(0, 100);
        engine.on_post_tb(0, false).unwrap();
        assert_eq!(engine.global_mtime_for_test(), 0x42);

        // A live clock change after the round must not retroactively affect
        // the frozen value from the round that already committed.
        host.mtime.store(0x99, std::sync::atomic::Ordering::Relaxed);
        assert_eq!(engine.global_mtime_for_test(), 0x42);
    }
}
