//! Bidirectional named-pipe IPC with an external detailed timing model
//! (spec §4.7, §6).
//!
//! Struct layouts are lifted directly from
//! `include/checkpoint/directed_tbs.h`: `Qemu2Detail`, `Detail2Qemu`, and
//! `SyncControlInfo`'s `info_valid_periods` rate limiter. Transport is a
//! pair of POSIX FIFOs created with `nix::unistd::mkfifo`, matching the
//! `sis-kernel` daemon's use of `nix` for low-level POSIX plumbing rather
//! than reaching for a heavier IPC crate.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use bytemuck::{Pod, Zeroable};

use super::error::{EngineError, Result};

pub const MAX_HARTS: usize = 8;

/// Engine -> detail model: "a checkpoint region just started, here is its
/// id and the instruction count it started at."
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Qemu2Detail {
    pub cpt_ready: u8,
    _pad: [u8; 7],
    pub cpt_id: u32,
    _pad2: [u8; 4],
    pub total_inst_count: u64,
}

/// Detail model -> engine: per-hart timing feedback for the region that
/// just finished.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Detail2Qemu {
    pub cpi: [f64; MAX_HARTS],
    pub has_wfi: [u8; MAX_HARTS],
}

/// Rate-limits how often the engine re-reads `Detail2Qemu`, mirroring the
/// original's `SyncControlInfo.info_valid_periods` counter.
pub struct SyncControlInfo {
    latest: Mutex<Detail2Qemu>,
    valid_periods: AtomicI32,
}

impl SyncControlInfo {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(Detail2Qemu::zeroed()),
            valid_periods: AtomicI32::new(0),
        }
    }

    pub fn set(&self, info: Detail2Qemu, periods: i32) {
        *self.latest.lock().unwrap() = info;
        self.valid_periods.store(periods, Ordering::Release);
    }

    /// Consume one period of validity; returns the cached info as long as
    /// periods remain, then `None` once it has expired.
    pub fn consume(&self) -> Option<Detail2Qemu> {
        let remaining = self.valid_periods.fetch_sub(1, Ordering::AcqRel);
        if remaining > 0 {
            Some(*self.latest.lock().unwrap())
        } else {
            self.valid_periods.store(0, Ordering::Release);
            None
        }
    }
}

impl Default for SyncControlInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the two FIFOs (`{base}.q2d` engine-writes / `{base}.d2q`
/// engine-reads) used to talk to the external detail model.
pub struct DetailModelLink {
    q2d: Mutex<File>,
    d2q: Mutex<File>,
}

fn fifo_path(base: &Path, suffix: &str) -> PathBuf {
    let mut p = base.as_os_str().to_owned();
    p.push(suffix);
    PathBuf::from(p)
}

impl DetailModelLink {
    /// Create (if missing) and open both FIFOs. Both opens block until the
    /// external detail model process has the other end open, matching the
    /// original's startup handshake.
    #[cfg(unix)]
    pub fn open(base: &Path) -> Result<Self> {
        let q2d_path = fifo_path(base, ".q2d");
        let d2q_path = fifo_path(base, ".d2q");

        for path in [&q2d_path, &d2q_path] {
            match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
                Ok(()) => {}
                Err(nix::errno::Errno::EEXIST) => {}
                Err(e) => return Err(EngineError::Ipc(format!("mkfifo {}: {e}", path.display()))),
            }
        }

        let q2d = OpenOptions::new()
            .write(true)
            .open(&q2d_path)
            .map_err(|e| EngineError::Ipc(format!("open {}: {e}", q2d_path.display())))?;
        let d2q = OpenOptions::new()
            .read(true)
            .open(&d2q_path)
            .map_err(|e| EngineError::Ipc(format!("open {}: {e}", d2q_path.display())))?;

        Ok(Self {
            q2d: Mutex::new(q2d),
            d2q: Mutex::new(d2q),
        })
    }

    pub fn send(&self, msg: &Qemu2Detail) -> Result<()> {
        let bytes = bytemuck::bytes_of(msg);
        self.q2d
            .lock()
            .unwrap()
            .write_all(bytes)
            .map_err(|e| EngineError::Ipc(format!("write to detail model: {e}")))
    }

    pub fn recv(&self) -> Result<Detail2Qemu> {
        let mut buf = [0u8; std::mem::size_of::<Detail2Qemu>()];
        self.d2q
            .lock()
            .unwrap()
            .read_exact(&mut buf)
            .map_err(|e| EngineError::Ipc(format!("read from detail model: {e}")))?;
        Ok(*bytemuck::from_bytes(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::thread;

    #[test]
    fn qemu2detail_has_a_stable_wire_size() {
        assert_eq!(std::mem::size_of::<Qemu2Detail>(), 24);
    }

    #[test]
    fn sync_control_info_expires_after_its_period_count() {
        let info = SyncControlInfo::new();
        info.set(Detail2Qemu::zeroed(), 2);
        assert!(info.consume().is_some());
        assert!(info.consume().is_some());
        assert!(info.consume().is_none());
    }

    #[test]
    fn fifo_round_trip_via_real_pipes() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("link");
        let q2d_path = fifo_path(&base, ".q2d");
        let d2q_path = fifo_path(&base, ".d2q");
        nix::unistd::mkfifo(&q2d_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();
        nix::unistd::mkfifo(&d2q_path, nix::sys::stat::Mode::from_bits_truncate(0o600)).unwrap();

        let reader_q2d = q2d_path.clone();
        let writer_d2q = d2q_path.clone();
        let reader = thread::spawn(move || {
            let mut f = File::open(&reader_q2d).unwrap();
            let mut buf = [0u8; std::mem::size_of::<Qemu2Detail>()];
            f.read_exact(&mut buf).unwrap();
            let msg: Qemu2Detail = *bytemuck::from_bytes(&buf);

            let mut out = File::create(&writer_d2q).unwrap();
            let mut reply = Detail2Qemu::zeroed();
            reply.cpi[0] = msg.total_inst_count as f64;
            out.write_all(bytemuck::bytes_of(&reply)).unwrap();
        });

        let link = DetailModelLink::open(&base).unwrap();
        link.send(&Qemu2Detail {
            cpt_ready: 1,
            _pad: [0; 7],
            cpt_id: 42,
            _pad2: [0; 4],
            total_inst_count: 12345,
        })
        .unwrap();
        let reply = link.recv().unwrap();
        reader.join().unwrap();
        assert_eq!(reply.cpi[0], 12345.0);
    }
}
