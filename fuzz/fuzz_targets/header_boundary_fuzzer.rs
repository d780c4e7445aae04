//! Fuzz target for packet header boundary conditions
//!
//! # Strategy
//!
//! - Magic/opcode: zero, max, random
//! - Flags/priority/transport: every byte value, known and unknown
//! - Buffer length: below, at, and above the 9-byte header size
//!
//! # Invariants
//!
//! - Buffers shorter than 9 bytes MUST return `HeaderTooShort`
//! - Every 9-byte pattern parses (all field values are structurally valid)
//! - Parsed fields round-trip through `to_bytes` unchanged

#![no_main]

use gantry_proto::PacketHeader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match PacketHeader::from_bytes(data) {
        Ok(header) => {
            assert!(data.len() >= PacketHeader::SIZE);
            let bytes = header.to_bytes();
            assert_eq!(&bytes[..], &data[..PacketHeader::SIZE]);
        },
        Err(_) => {
            assert!(data.len() < PacketHeader::SIZE);
        },
    }
});
