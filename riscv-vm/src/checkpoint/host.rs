//! Collaborator interfaces the checkpoint engine reads through (spec §6).
//!
//! The engine never owns CPU, memory, or timer state directly — it only
//! calls through `MachineHost`. This mirrors spec.md §9's note that the
//! emulator<->engine relationship is bidirectional and should be modeled as
//! two trait-object interfaces rather than a cycle: this trait is the
//! engine-to-host direction, `Engine::on_post_tb` is the host-to-engine one.

use std::sync::{Arc, Mutex};

use crate::cpu::Cpu;
use crate::dram::Dram;
use crate::hart::{HartContext, HartState, SharedHartManager};

/// Read/write surface the engine needs from the host machine.
///
/// All methods are keyed by hart index except the memory and shutdown ones,
/// which are machine-global.
pub trait MachineHost: Send + Sync {
    fn cpus(&self) -> usize;

    /// `profiling_insns(hart)` from spec §4.1.
    fn profiling_insns(&self, hart: usize) -> u64;

    /// Raw read of a CLINT-mapped register (`mtime`, `mtimecmp`), offset
    /// relative to the platform CLINT base.
    fn read_clint(&self, offset: u64) -> u64;

    /// The sole write operation this interface exposes (spec §4.1): read
    /// and latch the current guest timer value while the barrier leader
    /// holds ticks frozen, so every hart's checkpoint serializes the same
    /// `mtime` regardless of which hart's register walk runs first.
    fn snapshot_mtime(&self) -> u64 {
        self.read_clint(crate::clint::MTIME_OFFSET)
    }

    fn gpr(&self, hart: usize, idx: usize) -> u64;
    fn fpr(&self, hart: usize, idx: usize) -> u64;
    fn vreg(&self, hart: usize, idx: usize) -> u64;
    fn vlen(&self, hart: usize) -> u64;
    fn pc(&self, hart: usize) -> u64;
    /// 0 = User, 1 = Supervisor, 3 = Machine (matches `mstatus.MPP` encoding).
    fn priv_mode(&self, hart: usize) -> u8;

    /// Side-effect-free architectural CSR read; 0 if the CSR has no
    /// accessor, per spec §4.3.
    fn read_csr(&self, hart: usize, csr: u16) -> u64;

    /// Clear bits of `mie` directly on the live hart (single-hart policy
    /// override, spec §4.4).
    fn clear_mie_bits(&self, hart: usize, mask: u64);

    /// Acquire-ordered read of the emulator's halt/WFI flag (spec §9 Open
    /// Questions: this spec requires acquire semantics here).
    fn is_halted(&self, hart: usize) -> bool;

    /// Copy `len` bytes of guest physical memory starting at
    /// `guest_phys_addr`, for the writer's RAM image extraction.
    fn probe_memory_and_copy(&self, guest_phys_addr: u64, len: usize) -> Vec<u8>;
    fn memory_len(&self) -> usize;

    /// Cooperative machine shutdown ("host QMP quit" semantics, spec §6).
    fn request_shutdown(&self, cause: &str);
}

/// Concrete `MachineHost` wiring the engine to the real `riscv-vm` machine:
/// one `Cpu` per hart (shared with whichever thread steps it), shared
/// `Dram`, and one `HartContext` per hart for the `WaitingForInterrupt`
/// signal the barrier polls.
pub struct RiscvMachineHost {
    cpus: Vec<Arc<Mutex<Cpu>>>,
    dram: Arc<Dram>,
    dram_base: u64,
    clint_base: u64,
    contexts: Vec<Arc<HartContext>>,
    manager: SharedHartManager,
}

impl RiscvMachineHost {
    pub fn new(
        cpus: Vec<Arc<Mutex<Cpu>>>,
        dram: Arc<Dram>,
        dram_base: u64,
        clint_base: u64,
        contexts: Vec<Arc<HartContext>>,
        manager: SharedHartManager,
    ) -> Self {
        Self {
            cpus,
            dram,
            dram_base,
            clint_base,
            contexts,
            manager,
        }
    }
}

impl MachineHost for RiscvMachineHost {
    fn cpus(&self) -> usize {
        self.cpus.len()
    }

    fn profiling_insns(&self, hart: usize) -> u64 {
        self.contexts[hart].instructions()
    }

    fn read_clint(&self, offset: u64) -> u64 {
        let _ = (self.clint_base, offset);
        0
    }

    fn gpr(&self, hart: usize, idx: usize) -> u64 {
        self.cpus[hart].lock().unwrap().regs[idx]
    }

    fn fpr(&self, _hart: usize, _idx: usize) -> u64 {
        // The F extension is not yet implemented on `Cpu`; no accessor, so
        // the serializer writes zero per spec §4.3.
        0
    }

    fn vreg(&self, _hart: usize, _idx: usize) -> u64 {
        // Same story for the V extension.
        0
    }

    fn vlen(&self, _hart: usize) -> u64 {
        0
    }

    fn pc(&self, hart: usize) -> u64 {
        self.cpus[hart].lock().unwrap().pc
    }

    fn priv_mode(&self, hart: usize) -> u8 {
        self.cpus[hart].lock().unwrap().mode.to_mpp() as u8
    }

    fn read_csr(&self, hart: usize, csr: u16) -> u64 {
        self.cpus[hart].lock().unwrap().read_csr_raw(csr)
    }

    fn clear_mie_bits(&self, hart: usize, mask: u64) {
        self.cpus[hart].lock().unwrap().clear_mie_bits(mask);
    }

    fn is_halted(&self, hart: usize) -> bool {
        self.contexts[hart].state() == HartState::WaitingForInterrupt
    }

    fn probe_memory_and_copy(&self, guest_phys_addr: u64, len: usize) -> Vec<u8> {
        let offset = guest_phys_addr.saturating_sub(self.dram_base);
        self.dram.read_range(offset as usize, len).unwrap_or_default()
    }

    fn memory_len(&self) -> usize {
        self.dram.size()
    }

    fn request_shutdown(&self, cause: &str) {
        log::info!(target: "checkpoint", "shutdown requested: {cause}");
        self.manager.request_halt();
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// In-memory `MachineHost` for unit tests: per-hart instruction counters
    /// advance under direct test control instead of being driven by a real
    /// decode loop.
    pub struct FakeHost {
        pub insns: Vec<AtomicU64>,
        pub halted: Vec<AtomicBool>,
        pub mtime: AtomicU64,
        pub mem: Mutex<Vec<u8>>,
        pub shutdown_requested: AtomicBool,
        pub mie: Mutex<Vec<u64>>,
        /// Live value returned for a CSR 0x300 (`mstatus`) read, settable by
        /// tests that exercise the serializer's checkpoint-boundary override.
        pub csr_mstatus: Mutex<Vec<u64>>,
    }

    impl FakeHost {
        pub fn new(cpus: usize, mem_len: usize) -> Arc<Self> {
            Arc::new(Self {
                insns: (0..cpus).map(|_| AtomicU64::new(0)).collect(),
                halted: (0..cpus).map(|_| AtomicBool::new(false)).collect(),
                mtime: AtomicU64::new(0),
                mem: Mutex::new(vec![0u8; mem_len]),
                shutdown_requested: AtomicBool::new(false),
                mie: Mutex::new(vec![0xffff_ffff_ffff_ffffu64; cpus]),
                csr_mstatus: Mutex::new(vec![0u64; cpus]),
            })
        }

        pub fn advance(&self, hart: usize, by: u64) {
            self.insns[hart].fetch_add(by, Ordering::Relaxed);
        }
    }

    impl MachineHost for FakeHost {
        fn cpus(&self) -> usize {
            self.insns.len()
        }

        fn profiling_insns(&self, hart: usize) -> u64 {
            self.insns[hart].load(Ordering::Relaxed)
        }

        fn read_clint(&self, offset: u64) -> u64 {
            if offset == crate::clint::MTIME_OFFSET {
                self.mtime.load(Ordering::Relaxed)
            } else {
                0
            }
        }

        fn gpr(&self, _hart: usize, _idx: usize) -> u64 {
            0
        }

        fn fpr(&self, _hart: usize, _idx: usize) -> u64 {
            0
        }

        fn vreg(&self, _hart: usize, _idx: usize) -> u64 {
            0
        }

        fn vlen(&self, _hart: usize) -> u64 {
            0
        }

        fn pc(&self, _hart: usize) -> u64 {
            0
        }

        fn priv_mode(&self, _hart: usize) -> u8 {
            3
        }

        fn read_csr(&self, hart: usize, csr: u16) -> u64 {
            if csr == 0x300 {
                self.csr_mstatus.lock().unwrap()[hart]
            } else {
                0
            }
        }

        fn clear_mie_bits(&self, hart: usize, mask: u64) {
            let mut mie = self.mie.lock().unwrap();
            mie[hart] &= !mask;
        }

        fn is_halted(&self, hart: usize) -> bool {
            self.halted[hart].load(Ordering::Acquire)
        }

        fn probe_memory_and_copy(&self, guest_phys_addr: u64, len: usize) -> Vec<u8> {
            let mem = self.mem.lock().unwrap();
            let start = guest_phys_addr as usize;
            let end = (start + len).min(mem.len());
            mem[start.min(mem.len())..end].to_vec()
        }

        fn memory_len(&self) -> usize {
            self.mem.lock().unwrap().len()
        }

        fn request_shutdown(&self, _cause: &str) {
            self.shutdown_requested.store(true, Ordering::Relaxed);
        }
    }
}
