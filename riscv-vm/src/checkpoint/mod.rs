//! Multi-hart checkpointing coordinator.
//!
//! Drives a sync barrier across harts, a pluggable checkpointing policy
//! (none / uniform-interval / Simpoint / CPI-scaled uniform), a fixed-layout
//! register serializer, a Zstd-compressing atomic writer, and an optional
//! named-pipe link to an external detailed timing model.
//!
//! The emulator calls into [`engine::Engine::on_post_tb`] once per executed
//! translation block; the engine calls back out through [`host::MachineHost`]
//! for everything it needs to read from the machine.

pub mod barrier;
pub mod engine;
pub mod error;
pub mod host;
pub mod ipc;
pub mod layout;
pub mod policy;
pub mod schedule;
pub mod serializer;
pub mod writer;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use host::MachineHost;

use std::path::PathBuf;

/// Which checkpointing policy governs when checkpoints are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// No checkpoints are ever taken; the barrier still runs so the JIT's
    /// per-block hook table stays densely populated.
    None,
    /// One checkpoint every `cpt_interval` instructions, forever.
    Uniform,
    /// Checkpoints at the instruction counts named by a Simpoint schedule.
    Simpoint,
    /// Uniform with per-hart sync targets scaled by a CPI vector received
    /// from an external detailed timing model over the detail-model IPC
    /// link. No Simpoint schedule is involved.
    SyncUniform,
}

impl Default for CheckpointMode {
    fn default() -> Self {
        CheckpointMode::None
    }
}

/// Host-supplied configuration for the checkpoint engine (spec's
/// configuration surface, grounded in `NEMUArgs_t`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mode: CheckpointMode,
    pub num_harts: usize,

    /// Output directory checkpoints and their path manifests are written
    /// under.
    pub base_dir: PathBuf,
    pub config_name: String,
    pub workload_name: String,

    /// Instruction interval between checkpoints in `Uniform`/`SyncUniform`
    /// modes.
    pub cpt_interval: u64,
    /// Instruction interval harts resynchronize at, independent of when a
    /// checkpoint is actually committed.
    pub sync_interval: u64,
    /// Instructions to run past a Simpoint location before the checkpoint
    /// window is considered "warmed up" and representative.
    pub warmup_interval: u64,

    /// Path to the `simpoints0`/`weights0` pair, required when `mode` is
    /// `Simpoint`. Unused by `SyncUniform`, which has no schedule of its
    /// own and instead scales `Uniform`'s interval by a CPI vector read
    /// over the detail-model IPC link.
    pub simpoint_path: Option<PathBuf>,

    /// When true, hart 0 is treated as online immediately at construction
    /// instead of waiting for the guest's before-workload marker.
    pub skip_boot: bool,

    /// When set, spawn the detail-model FIFO pair at this base path
    /// (`{path}.q2d` / `{path}.d2q`).
    pub detail_model_fifo: Option<PathBuf>,
}

impl EngineConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.num_harts == 0 {
            return Err(EngineError::Config("num_harts must be >= 1".into()));
        }
        if matches!(self.mode, CheckpointMode::Simpoint) && self.simpoint_path.is_none() {
            return Err(EngineError::Config("simpoint_path is required for Simpoint mode".into()));
        }
        if matches!(
            self.mode,
            CheckpointMode::Uniform | CheckpointMode::Simpoint | CheckpointMode::SyncUniform
        ) && self.cpt_interval == 0
        {
            return Err(EngineError::Config(
                "cpt_interval must be > 0 for Uniform, Simpoint, and SyncUniform modes (Simpoint \
                 uses it as the interval-window size a schedule location indexes into)"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mode: CheckpointMode) -> EngineConfig {
        EngineConfig {
            mode,
            num_harts: 1,
            base_dir: PathBuf::from("/tmp/cpt"),
            config_name: "cfg".into(),
            workload_name: "wl".into(),
            cpt_interval: 1_000_000,
            sync_interval: 1_000_000,
            warmup_interval: 0,
            simpoint_path: None,
            skip_boot: false,
            detail_model_fifo: None,
        }
    }

    #[test]
    fn none_mode_needs_nothing_extra() {
        assert!(base_config(CheckpointMode::None).validate().is_ok());
    }

    #[test]
    fn simpoint_mode_requires_path() {
        assert!(base_config(CheckpointMode::Simpoint).validate().is_err());
        let mut cfg = base_config(CheckpointMode::Simpoint);
        cfg.simpoint_path = Some(PathBuf::from("/tmp/simpoints0"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sync_uniform_mode_needs_no_simpoint_path() {
        let cfg = base_config(CheckpointMode::SyncUniform);
        assert!(cfg.simpoint_path.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn uniform_mode_requires_nonzero_interval() {
        let mut cfg = base_config(CheckpointMode::Uniform);
        cfg.cpt_interval = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_harts_rejected() {
        let mut cfg = base_config(CheckpointMode::None);
        cfg.num_harts = 0;
        assert!(cfg.validate().is_err());
    }
}
