//! Protobuf-compatible checkpoint header and per-hart memory layout (spec
//! §4.3, §6).
//!
//! Generated types come from `proto/checkpoint.proto` via `build.rs`
//! (`prost-build`), matching the original's `checkpoint.pb.h`. The exact
//! byte offsets below are lifted from
//! `include/checkpoint/serializer_utils.h`'s `default_cpt_percpu_layout` so
//! encode/decode stay bit-for-bit compatible.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/checkpoint.rs"));

pub const MAGIC_NUMBER: u32 = 0xdead_beef;

/// Size in bytes of one hart's register region within a checkpoint file.
pub const SINGLE_CORE_SIZE: u64 = 1024 * 1024;

/// The stock per-hart layout shipped by the original implementation.
pub const DEFAULT_MEMLAYOUT: MemLayout = MemLayout {
    pc_cpt_addr: 0x0,
    mode_cpt_addr: 0x8,
    mtime_cpt_addr: 0x10,
    mtime_cmp_cpt_addr: 0x18,
    misc_done_cpt_addr: 0x20,
    misc_reserve: 0x28,
    int_reg_cpt_addr: 0x1000,
    int_reg_done: 0x1128,
    float_reg_cpt_addr: 0x1130,
    float_reg_done: 0x1230,
    csr_reg_cpt_addr: 0x1238,
    csr_reg_done: 0x9238,
    csr_reserve: 0x9240,
    vector_reg_cpt_addr: 0x11240,
    vector_reg_done: 0x13240,
};

impl CheckpointHeader {
    pub fn new(cpu_num: u32) -> Self {
        // Matches `default_cpt_header.cpt_offset`: header + one memlayout
        // record precede the per-hart register/memory image.
        let header_len = prost::Message::encoded_len(&CheckpointHeader {
            magic_number: MAGIC_NUMBER,
            cpt_offset: 0,
            cpu_num,
            single_core_size: SINGLE_CORE_SIZE,
            version: 0x2024_0125,
        });
        let layout_len = prost::Message::encoded_len(&DEFAULT_MEMLAYOUT);
        Self {
            magic_number: MAGIC_NUMBER,
            cpt_offset: (header_len + layout_len) as u64,
            cpu_num,
            single_core_size: SINGLE_CORE_SIZE,
            version: 0x2024_0125,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn header_round_trips_through_length_delimited_encoding() {
        let header = CheckpointHeader::new(2);
        let mut buf = Vec::new();
        header.encode_length_delimited(&mut buf).unwrap();
        let decoded = CheckpointHeader::decode_length_delimited(&buf[..]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.magic_number, MAGIC_NUMBER);
    }

    #[test]
    fn memlayout_round_trips() {
        let mut buf = Vec::new();
        DEFAULT_MEMLAYOUT.encode_length_delimited(&mut buf).unwrap();
        let decoded = MemLayout::decode_length_delimited(&buf[..]).unwrap();
        assert_eq!(decoded, DEFAULT_MEMLAYOUT);
        assert_eq!(decoded.vector_reg_cpt_addr, 0x11240);
    }
}
