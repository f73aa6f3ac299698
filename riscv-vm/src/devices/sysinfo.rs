//! Emulated board identification / scratch device.
//!
//! A small read-mostly MMIO block a guest can probe to confirm it's running
//! under this emulator and to stash a scratch value across a reboot, the
//! same role CLINT's `HART_COUNT_OFFSET` plays for hart count. Lock-free,
//! same shape as [`crate::devices::clint::Clint`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const SYSINFO_BASE: u64 = 0x0011_0000;
pub const SYSINFO_SIZE: u64 = 0x1000;

/// "RVVM" in ASCII, identifies the board to guest firmware.
const MAGIC: u32 = 0x5256_564D;
const VERSION: u32 = 1;

const MAGIC_OFFSET: u64 = 0x00;
const VERSION_OFFSET: u64 = 0x04;
const NUM_HARTS_OFFSET: u64 = 0x08;
const SCRATCH_OFFSET: u64 = 0x10;

/// Board info / scratch register block.
///
/// `MAGIC`/`VERSION`/`NUM_HARTS` are read-only; `SCRATCH` is a plain
/// read-write register firmware can use to pass a value across a
/// warm reset. All other offsets read as zero and ignore writes.
pub struct SysInfo {
    num_harts: AtomicU32,
    scratch: AtomicU64,
}

impl SysInfo {
    pub fn new() -> Self {
        Self {
            num_harts: AtomicU32::new(1),
            scratch: AtomicU64::new(0),
        }
    }

    /// Set the hart count reported at `NUM_HARTS_OFFSET` (called by the
    /// emulator at init, mirroring `Clint::set_num_harts`).
    pub fn set_num_harts(&self, num_harts: usize) {
        self.num_harts.store(num_harts as u32, Ordering::Relaxed);
    }

    pub fn load(&self, offset: u64, size: u64) -> u64 {
        match (offset, size) {
            (MAGIC_OFFSET, 4) | (MAGIC_OFFSET, 8) => MAGIC as u64,
            (VERSION_OFFSET, 4) | (VERSION_OFFSET, 8) => VERSION as u64,
            (NUM_HARTS_OFFSET, 4) | (NUM_HARTS_OFFSET, 8) => {
                self.num_harts.load(Ordering::Relaxed) as u64
            }
            (SCRATCH_OFFSET, 8) => self.scratch.load(Ordering::Relaxed),
            (SCRATCH_OFFSET, 4) => self.scratch.load(Ordering::Relaxed) & 0xFFFF_FFFF,
            (o, 4) if o == SCRATCH_OFFSET + 4 => self.scratch.load(Ordering::Relaxed) >> 32,
            _ => 0,
        }
    }

    pub fn store(&self, offset: u64, size: u64, value: u64) {
        match (offset, size) {
            (SCRATCH_OFFSET, 8) => self.scratch.store(value, Ordering::Relaxed),
            (SCRATCH_OFFSET, 4) => {
                let hi = self.scratch.load(Ordering::Relaxed) & 0xFFFF_FFFF_0000_0000;
                self.scratch.store(hi | (value & 0xFFFF_FFFF), Ordering::Relaxed);
            }
            (o, 4) if o == SCRATCH_OFFSET + 4 => {
                let lo = self.scratch.load(Ordering::Relaxed) & 0xFFFF_FFFF;
                self.scratch.store((value << 32) | lo, Ordering::Relaxed);
            }
            // MAGIC/VERSION/NUM_HARTS are read-only; ignore writes.
            _ => {}
        }
    }
}

impl Default for SysInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_and_version_are_read_only() {
        let s = SysInfo::new();
        assert_eq!(s.load(MAGIC_OFFSET, 4), MAGIC as u64);
        assert_eq!(s.load(VERSION_OFFSET, 4), VERSION as u64);
        s.store(MAGIC_OFFSET, 4, 0);
        assert_eq!(s.load(MAGIC_OFFSET, 4), MAGIC as u64);
    }

    #[test]
    fn num_harts_reflects_set_num_harts() {
        let s = SysInfo::new();
        assert_eq!(s.load(NUM_HARTS_OFFSET, 4), 1);
        s.set_num_harts(4);
        assert_eq!(s.load(NUM_HARTS_OFFSET, 4), 4);
    }

    #[test]
    fn scratch_round_trips_at_every_width() {
        let s = SysInfo::new();
        s.store(SCRATCH_OFFSET, 8, 0xdead_beef_1234_5678);
        assert_eq!(s.load(SCRATCH_OFFSET, 8), 0xdead_beef_1234_5678);

        s.store(SCRATCH_OFFSET, 4, 0x1111_2222);
        assert_eq!(s.load(SCRATCH_OFFSET, 4), 0x1111_2222);
        assert_eq!(s.load(SCRATCH_OFFSET, 8) >> 32, 0xdead_beef);

        s.store(SCRATCH_OFFSET + 4, 4, 0x3333_4444);
        assert_eq!(s.load(SCRATCH_OFFSET + 4, 4), 0x3333_4444);
        assert_eq!(s.load(SCRATCH_OFFSET, 4), 0x1111_2222);
    }

    #[test]
    fn unmapped_offset_reads_zero_and_ignores_writes() {
        let s = SysInfo::new();
        s.store(0x800, 8, 0xffff_ffff_ffff_ffff);
        assert_eq!(s.load(0x800, 8), 0);
    }
}
