use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kedr_asm::{Bitness, Decoder};

fn decode(c: &mut Criterion) {
    // A representative mix: REX-prefixed register-indirect load, a locked
    // increment, a conditional near jump, and an indirect call through a
    // SIB-addressed jump-table slot.
    let x64_mix: &[u8] = &[
        0x48, 0x8b, 0x07, // mov rax, [rdi]
        0xf0, 0xff, 0x00, // lock inc dword [rax]
        0x0f, 0x84, 0x10, 0x00, 0x00, 0x00, // je +0x10
        0xff, 0x14, 0x85, 0x00, 0x00, 0x00, 0x00, // call [rax*4 + disp32]
    ];

    let mut group = c.benchmark_group("decode");

    group.bench_function("x64-mixed-stream", |b| {
        let decoder = Decoder::new(Bitness::X64);
        b.iter(|| {
            let mut pc = 0x1000u64;
            let mut offset = 0usize;
            while offset < x64_mix.len() {
                let insn = decoder
                    .decode(black_box(&x64_mix[offset..]), black_box(pc))
                    .expect("benchmark stream must be decodable");
                offset += insn.len as usize;
                pc += insn.len as u64;
            }
        })
    });

    group.bench_function("single-reg-indirect-load", |b| {
        let decoder = Decoder::new(Bitness::X64);
        let bytes = [0x48, 0x8b, 0x07];
        b.iter(|| decoder.decode(black_box(&bytes), black_box(0x1000)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, decode);
criterion_main!(benches);
