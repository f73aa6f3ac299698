//! Per-hart register serialization (spec §4.3).
//!
//! Grounded in `target/riscv/serializer.c`'s `serializeRegs`: GPRs, then
//! FPRs, then PC, then (conditionally) vector registers, then every
//! readable CSR, then a magic-number "done" marker and the CLINT
//! `mtimecmp`/`mtime` pair. The byte offsets for each region come from
//! [`super::layout::MemLayout`] rather than being hardcoded here, so a
//! caller can swap in an alternate layout without touching this code.

use super::host::MachineHost;
use super::layout::MemLayout;

const CSR_TABLE_SIZE: usize = 4096;

const CSR_MSTATUS: u16 = 0x300;
const CSR_MEPC: u16 = 0x341;
const MSTATUS_MIE: u64 = 1 << 3;
const MSTATUS_MPIE: u64 = 1 << 7;
const MSTATUS_MPP_SHIFT: u64 = 11;
const MSTATUS_MPP_MASK: u64 = 0b11 << MSTATUS_MPP_SHIFT;

fn write_u64(buf: &mut [u8], offset: u64, val: u64) {
    let offset = offset as usize;
    buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
}

/// Serialize hart `hart`'s architectural state into a freshly allocated
/// `single_core_size`-byte buffer, applying the checkpoint-boundary
/// register overrides spec §4.4 calls for (mstatus.MPIE/MIE, mstatus.MPP,
/// mepc <- pc) so the checkpoint resumes as if returning from a trap taken
/// at exactly this PC. `global_mtime` is the value the barrier leader froze
/// at barrier entry (spec §4.5 step 3); every hart's checkpoint uses this
/// same frozen value for its `mtime` field rather than a live CLINT read,
/// so the serialized image is self-consistent across harts.
pub fn serialize_hart(host: &dyn MachineHost, hart: usize, layout: &MemLayout, single_core_size: usize, global_mtime: u64) -> Vec<u8> {
    let mut buf = vec![0u8; single_core_size];

    for i in 0..32 {
        write_u64(&mut buf, layout.int_reg_cpt_addr + (i as u64) * 8, host.gpr(hart, i));
    }
    for i in 0..32 {
        write_u64(&mut buf, layout.float_reg_cpt_addr + (i as u64) * 8, host.fpr(hart, i));
    }

    write_u64(&mut buf, layout.pc_cpt_addr, host.pc(hart));
    write_u64(&mut buf, layout.mode_cpt_addr, host.priv_mode(hart) as u64);

    let vlen = host.vlen(hart);
    if vlen > 0 {
        let vreg_words = (32 * vlen / 64) as usize;
        let vector_bytes = (layout.vector_reg_done - layout.vector_reg_cpt_addr) as usize;
        let max_words = vector_bytes / 8;
        for i in 0..vreg_words.min(max_words) {
            write_u64(&mut buf, layout.vector_reg_cpt_addr + (i as u64) * 8, host.vreg(hart, i));
        }
    }

    for csr in 0..CSR_TABLE_SIZE {
        let csr = csr as u16;
        let val = match csr {
            // Resume as if returning from a trap taken exactly at the
            // checkpointed PC: MPIE <- MIE, MIE <- 0, MPP <- current
            // privilege. Matches spec §4.3's checkpoint-boundary overrides.
            CSR_MSTATUS => {
                let live = host.read_csr(hart, csr);
                let mie_set = live & MSTATUS_MIE != 0;
                let mut v = live & !MSTATUS_MIE & !MSTATUS_MPIE & !MSTATUS_MPP_MASK;
                if mie_set {
                    v |= MSTATUS_MPIE;
                }
                v |= (host.priv_mode(hart) as u64 & 0b11) << MSTATUS_MPP_SHIFT;
                v
            }
            CSR_MEPC => host.pc(hart),
            _ => host.read_csr(hart, csr),
        };
        write_u64(&mut buf, layout.csr_reg_cpt_addr + (csr as u64) * 8, val);
    }

    write_u64(&mut buf, layout.misc_done_cpt_addr, super::layout::MAGIC_NUMBER as u64);
    write_u64(&mut buf, layout.mtime_cmp_cpt_addr, host.read_clint(crate::clint::MTIMECMP_OFFSET));
    write_u64(&mut buf, layout.mtime_cpt_addr, global_mtime);

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::host::fake::FakeHost;
    use crate::checkpoint::layout::DEFAULT_MEMLAYOUT;

    #[test]
    fn writes_pc_and_mode_at_the_documented_offsets() {
        let host = FakeHost::new(1, 4096);
        host.mtime.store(0xdead, std::sync::atomic::Ordering::Relaxed);
        let buf = serialize_hart(host.as_ref(), 0, &DEFAULT_MEMLAYOUT, 1024 * 1024, 0xdead);

        let pc = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        assert_eq!(pc, host.pc(0));

        let magic = u64::from_le_bytes(
            buf[DEFAULT_MEMLAYOUT.misc_done_cpt_addr as usize..DEFAULT_MEMLAYOUT.misc_done_cpt_addr as usize + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(magic, super::super::layout::MAGIC_NUMBER as u64);
    }

    #[test]
    fn gpr_region_matches_host() {
        let host = FakeHost::new(1, 4096);
        let buf = serialize_hart(host.as_ref(), 0, &DEFAULT_MEMLAYOUT, 1024 * 1024, 0);
        for i in 0..32 {
            let off = DEFAULT_MEMLAYOUT.int_reg_cpt_addr as usize + i * 8;
            let val = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
            assert_eq!(val, host.gpr(0, i));
        }
    }

    #[test]
    fn mtime_field_reflects_the_frozen_value_not_the_live_host_clock() {
        let host = FakeHost::new(1, 4096);
        host.mtime.store(0x1234, std::sync::atomic::Ordering::Relaxed);
        let buf = serialize_hart(host.as_ref(), 0, &DEFAULT_MEMLAYOUT, 1024 * 1024, 0x9999);

        let mtime = u64::from_le_bytes(
            buf[DEFAULT_MEMLAYOUT.mtime_cpt_addr as usize..DEFAULT_MEMLAYOUT.mtime_cpt_addr as usize + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(mtime, 0x9999, "mtime field must come from the frozen snapshot, not host.read_clint");
    }

    #[test]
    fn mstatus_checkpoint_boundary_moves_mie_into_mpie_and_stamps_current_priv_into_mpp() {
        let host = FakeHost::new(1, 4096);
        {
            let mut live = host.csr_mstatus.lock().unwrap();
            live[0] = MSTATUS_MIE;
        }
        let buf = serialize_hart(host.as_ref(), 0, &DEFAULT_MEMLAYOUT, 1024 * 1024, 0);
        let off = (DEFAULT_MEMLAYOUT.csr_reg_cpt_addr + (CSR_MSTATUS as u64) * 8) as usize;
        let mstatus = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        assert_eq!(mstatus & MSTATUS_MIE, 0, "mie must be cleared at the checkpoint boundary");
        assert_eq!(mstatus & MSTATUS_MPIE, MSTATUS_MPIE, "old mie must be preserved into mpie");
        assert_eq!(
            (mstatus & MSTATUS_MPP_MASK) >> MSTATUS_MPP_SHIFT,
            host.priv_mode(0) as u64 & 0b11,
            "mpp must be stamped with the hart's current privilege mode"
        );
    }

    #[test]
    fn buffer_is_exactly_single_core_size() {
        let host = FakeHost::new(1, 4096);
        let buf = serialize_hart(host.as_ref(), 0, &DEFAULT_MEMLAYOUT, 1024 * 1024, 0);
        assert_eq!(buf.len(), 1024 * 1024);
    }
}
