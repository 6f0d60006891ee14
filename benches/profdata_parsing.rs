use criterion::{black_box, criterion_group, criterion_main, Criterion};
use indexed_profdata::instrumentation_profile::types::*;
use indexed_profdata::*;

fn synthetic_profile(functions: u64) -> Vec<u8> {
    let mut writer = InstrProfWriter::default();
    for i in 0..functions {
        let mut record =
            NamedInstrProfRecord::new(format!("function_{}", i), i, (0..16).map(|x| x * i).collect());
        if i % 4 == 0 {
            let targets = (0..8)
                .map(|x| InstrProfValueData::new(compute_hash(format!("function_{}", x)), x + i))
                .collect::<Vec<_>>();
            record
                .record
                .add_value_data(ValueKind::IndirectCallTarget, 0, &targets, None);
        }
        writer.add_record(record, &mut |_| ());
    }
    writer.write_buffer().unwrap()
}

pub fn indexed_profile(c: &mut Criterion) {
    let data = synthetic_profile(5000);

    c.bench_function("profdata_parse", |b| {
        b.iter(|| parse_bytes(black_box(&data)))
    });

    let reader = parse_bytes(&data).unwrap();
    c.bench_function("profdata_iterate", |b| {
        b.iter(|| black_box(&reader).iter().filter(|x| x.is_ok()).count())
    });
    c.bench_function("profdata_lookup", |b| {
        b.iter(|| reader.get_instr_prof_record(black_box("function_2500"), 2500, None))
    });
}

criterion_group!(benches, indexed_profile);

criterion_main!(benches);
