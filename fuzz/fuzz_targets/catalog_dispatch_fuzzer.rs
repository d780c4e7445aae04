//! Fuzz target for catalog-driven deserialization
//!
//! Drives `PacketCatalog::try_deserialize` with arbitrary bytes against a
//! small catalog. Unknown magics and short buffers must surface as errors,
//! registered magics must decode and re-serialize without panicking.

#![no_main]

use gantry_proto::{CatalogBuilder, PacketSpec};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut builder = CatalogBuilder::new();
    builder.register(PacketSpec::opaque(0x0000_0001, "A")).expect("fresh magic registers");
    builder.register(PacketSpec::opaque(0xFFFF_FFFF, "B")).expect("fresh magic registers");
    let catalog = builder.build();

    if let Ok(packet) = catalog.try_deserialize(data) {
        // Whatever decoded must serialize back to the same bytes.
        let wire = packet.serialize().expect("decoded packet re-serializes");
        assert_eq!(&wire[..], data);
    }
});
