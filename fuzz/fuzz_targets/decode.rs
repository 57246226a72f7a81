#![no_main]

use kedr_asm::{Bitness, Decoder};
use libfuzzer_sys::fuzz_target;

#[derive(arbitrary::Arbitrary, Debug)]
struct FuzzInput {
    x64: bool,
    bytes: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let bitness = if input.x64 { Bitness::X64 } else { Bitness::X86 };
    let decoder = Decoder::new(bitness);

    // The decoder must never panic on arbitrary bytes, and must never report
    // having consumed more bytes than it was given.
    if let Ok(insn) = decoder.decode(&input.bytes, 0x1000) {
        assert!(insn.len as usize <= input.bytes.len());
    }
});
