use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use kedr_asm::Bitness;
use kedr_core::module::{ModuleImage, Section};

/// A handful of small, self-contained functions: straight-line loads, a
/// locked increment, a short conditional, and an outward call, laid out
/// back to back in one section the way a real kernel module's text would be.
fn sample_module() -> ModuleImage {
    let mut bytes = Vec::new();

    let straight_line = bytes.len();
    bytes.extend_from_slice(&[0x48, 0x8b, 0x07, 0xc3]); // mov rax, [rdi]; ret
    let _ = straight_line;

    let locked_update = bytes.len();
    bytes.extend_from_slice(&[0xf0, 0xff, 0x07, 0xc3]); // lock inc dword [rdi]; ret
    let _ = locked_update;

    let short_conditional = bytes.len();
    bytes.extend_from_slice(&[0x85, 0xff, 0x74, 0x01, 0x90, 0xc3]); // test edi,edi; jz +1; nop; ret
    let _ = short_conditional;

    let outward_call = bytes.len();
    bytes.extend_from_slice(&[0xe8, 0, 0, 0, 0, 0xc3]); // call rel32; ret
    let disp = (0x9000i64 - (outward_call as i64 + 5)) as i32;
    bytes[outward_call + 1..outward_call + 5].copy_from_slice(&disp.to_le_bytes());

    ModuleImage::new("bench_mod")
        .with_section(Section::new(".text", 0x1000, bytes))
        .with_symbol("straight_line", 0x1000)
        .with_symbol("locked_update", 0x1004)
        .with_symbol("short_conditional", 0x1008)
        .with_symbol("outward_call", 0x100e)
}

fn pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    group.bench_function("discover_functions", |b| {
        let module = sample_module();
        b.iter(|| kedr_core::discovery::discover_functions(black_box(&module), Bitness::X64))
    });

    group.bench_function("build_fallback_copies", |b| {
        let module = sample_module();
        let bases = HashMap::from([(".text".to_string(), 0x9000_0000u64)]);
        b.iter(|| {
            let mut records = kedr_core::discovery::discover_functions(&module, Bitness::X64);
            kedr_core::fallback::build_fallback_copies(
                black_box(&module),
                Bitness::X64,
                &mut records,
                black_box(&bases),
            )
            .unwrap()
        })
    });

    group.bench_function("build_function_ir", |b| {
        let module = sample_module();
        b.iter(|| kedr_core::ir::build_function_ir(black_box(&module), Bitness::X64, 0x1000, 4).unwrap())
    });

    group.finish();
}

criterion_group!(benches, pipeline);
criterion_main!(benches);
