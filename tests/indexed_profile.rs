use indexed_profdata::instrumentation_profile::memprof::*;
use indexed_profdata::instrumentation_profile::remapping::FragmentRemapper;
use indexed_profdata::instrumentation_profile::temporal::TemporalProfTrace;
use indexed_profdata::instrumentation_profile::types::*;
use indexed_profdata::summary::{Kind, ProfileSummary};
use indexed_profdata::*;
use nom::number::Endianness;
use pretty_assertions::assert_eq;

fn no_errors() -> impl FnMut(InstrProfError) {
    |e: InstrProfError| panic!("unexpected error: {}", e)
}

fn sparse_writer(sparse: bool) -> InstrProfWriter {
    let mut writer = InstrProfWriter::default();
    writer.set_sparse(sparse);
    writer
}

fn read(writer: &InstrProfWriter) -> IndexedProfileReader {
    parse_bytes(&writer.write_buffer().unwrap()).unwrap()
}

fn values(pairs: &[(u64, u64)]) -> Vec<InstrProfValueData> {
    pairs
        .iter()
        .map(|(value, count)| InstrProfValueData::new(*value, *count))
        .collect()
}

fn callee(i: usize) -> u64 {
    compute_hash(format!("callee{}", i))
}

/// A caller with four indirect call sites, the second one without values
fn caller_record(kind: ValueKind) -> NamedInstrProfRecord {
    let mut record = NamedInstrProfRecord::new("caller", 0x1234, vec![1, 2]);
    record.record.reserve_sites(kind, 4);
    let sites: [&[(u64, u64)]; 4] = [
        &[(callee(1), 1), (callee(2), 2), (callee(3), 3)],
        &[],
        &[(callee(1), 1), (callee(2), 2)],
        &[(callee(1), 1)],
    ];
    for (i, site) in sites.iter().enumerate() {
        record.record.add_value_data(kind, i, &values(site), None);
    }
    record
}

fn add_callees(writer: &mut InstrProfWriter) {
    for (i, hash) in (1..=3).zip(0x2000..) {
        writer.add_record(
            NamedInstrProfRecord::new(format!("callee{}", i), hash, vec![i as u64]),
            &mut no_errors(),
        );
    }
}

#[test]
fn write_and_read_empty_profile() {
    let writer = InstrProfWriter::default();
    let reader = read(&writer);
    assert_eq!(reader.iter().count(), 0);
    assert_eq!(reader.version(), 12);
    assert!(reader.symtab().is_empty());
    assert!(!reader.has_memprof());
    assert!(!reader.has_temporal_profile());
    assert_eq!(reader.get_summary(false).num_functions(), 0);
}

#[test]
fn write_and_read_one_function() {
    for sparse in [false, true] {
        let mut writer = sparse_writer(sparse);
        writer.add_record(
            NamedInstrProfRecord::new("foo", 0x1234, vec![1, 2, 3, 4]),
            &mut no_errors(),
        );
        let reader = read(&writer);
        assert_eq!(reader.is_sparse(), sparse);
        let records = reader.iter().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(
            records,
            vec![NamedInstrProfRecord::new("foo", 0x1234, vec![1, 2, 3, 4])]
        );
    }
}

#[test]
fn get_instr_prof_record() {
    let mut writer = InstrProfWriter::default();
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![1, 2]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1235, vec![3, 4]), &mut no_errors());
    let reader = read(&writer);

    let record = reader.get_instr_prof_record("foo", 0x1234, None).unwrap();
    assert_eq!(record.counts(), &[1, 2]);
    let record = reader.get_instr_prof_record("foo", 0x1235, None).unwrap();
    assert_eq!(record.counts(), &[3, 4]);

    assert_eq!(
        reader.get_instr_prof_record("foo", 0x5678, None),
        Err(InstrProfError::HashMismatch)
    );
    assert_eq!(
        reader.get_instr_prof_record("bar", 0x1234, None),
        Err(InstrProfError::UnknownFunction)
    );
}

#[test]
fn get_function_counts() {
    let mut writer = InstrProfWriter::default();
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![1, 2]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1235, vec![3, 4]), &mut no_errors());
    let reader = read(&writer);

    let mut counts = vec![];
    reader.get_function_counts("foo", 0x1234, &mut counts).unwrap();
    assert_eq!(counts, vec![1, 2]);
    reader.get_function_counts("foo", 0x1235, &mut counts).unwrap();
    assert_eq!(counts, vec![3, 4]);

    assert_eq!(
        reader.get_function_counts("foo", 0x5678, &mut counts),
        Err(InstrProfError::HashMismatch)
    );
    assert_eq!(
        reader.get_function_counts("bar", 0x1234, &mut counts),
        Err(InstrProfError::UnknownFunction)
    );
}

#[test]
fn get_weighted_function_counts() {
    for sparse in [false, true] {
        let mut writer = sparse_writer(sparse);
        writer.add_weighted_record(
            NamedInstrProfRecord::new("foo", 0x1234, vec![1, 2]),
            3,
            &mut no_errors(),
        );
        writer.add_weighted_record(
            NamedInstrProfRecord::new("foo", 0x1235, vec![3, 4]),
            5,
            &mut no_errors(),
        );
        let reader = read(&writer);

        let mut counts = vec![];
        reader.get_function_counts("foo", 0x1234, &mut counts).unwrap();
        assert_eq!(counts, vec![3, 6]);
        reader.get_function_counts("foo", 0x1235, &mut counts).unwrap();
        assert_eq!(counts, vec![15, 20]);
    }
}

#[test]
fn get_profile_summary() {
    let mut writer = InstrProfWriter::default();
    let mut err = no_errors();
    writer.add_record(NamedInstrProfRecord::new("func1", 0x1234, vec![97531]), &mut err);
    writer.add_record(NamedInstrProfRecord::new("func2", 0x1234, vec![0, 0]), &mut err);
    writer.add_record(
        NamedInstrProfRecord::new(
            "func3",
            0x1234,
            vec![
                2305843009213693952,
                1152921504606846976,
                576460752303423488,
                288230376151711744,
                144115188075855872,
                72057594037927936,
            ],
        ),
        &mut err,
    );
    writer.add_record(NamedInstrProfRecord::new("func4", 0x1234, vec![0]), &mut err);
    let reader = read(&writer);

    let verify = |summary: &ProfileSummary| {
        assert_eq!(summary.kind(), Kind::Instr);
        assert_eq!(summary.max_function_count(), 2305843009213693952);
        assert_eq!(summary.max_count(), 2305843009213693952);
        assert_eq!(summary.num_counts(), 10);
        assert_eq!(summary.num_functions(), 4);
        assert_eq!(summary.total_count(), 4539628424389557499);
        let min_count = |cutoff| summary.entry_for_cutoff(cutoff).unwrap().min_count;
        assert_eq!(min_count(800000), 576460752303423488);
        assert_eq!(min_count(900000), 288230376151711744);
        assert_eq!(min_count(950000), 288230376151711744);
        assert_eq!(min_count(990000), 72057594037927936);
    };
    let summary = reader.get_summary(false);
    verify(summary);

    // Round trip through the metadata form
    let metadata = summary.to_metadata();
    let from_metadata = ProfileSummary::from_metadata(&metadata).unwrap();
    verify(&from_metadata);
    assert_eq!(&from_metadata, summary);
}

#[test]
fn context_sensitive_summary() {
    let mut writer = InstrProfWriter::default();
    let mut cs = NamedInstrProfRecord::new("foo", 0x1234, vec![10, 20]);
    cs.set_cs_flag();
    let cs_hash = cs.hash;
    writer.add_record(cs, &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![1]), &mut no_errors());
    let reader = read(&writer);

    assert_eq!(reader.get_summary(true).kind(), Kind::CsInstr);
    assert_eq!(reader.get_summary(true).num_functions(), 1);
    assert_eq!(reader.get_maximum_function_count(true), 10);
    assert_eq!(reader.get_summary(false).num_functions(), 1);
    assert_eq!(reader.get_maximum_function_count(false), 1);

    let record = reader.get_instr_prof_record("foo", cs_hash, None).unwrap();
    assert!(record.has_cs_flag());
    assert_eq!(record.counts(), &[10, 20]);
}

#[test]
fn get_max_function_count() {
    for sparse in [false, true] {
        let mut writer = sparse_writer(sparse);
        let mut err = no_errors();
        writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![1 << 31, 2]), &mut err);
        writer.add_record(NamedInstrProfRecord::new("bar", 0, vec![1 << 63]), &mut err);
        writer.add_record(NamedInstrProfRecord::new("baz", 0x5678, vec![0, 0, 0, 0]), &mut err);
        let reader = read(&writer);
        assert_eq!(reader.get_maximum_function_count(false), 1 << 63);
    }
}

#[test]
fn test_writer_merge() {
    let mut writer = InstrProfWriter::default();
    writer.add_record(NamedInstrProfRecord::new("func1", 0x1234, vec![42]), &mut no_errors());

    let mut writer2 = InstrProfWriter::default();
    writer2.add_record(NamedInstrProfRecord::new("func2", 0x1234, vec![0, 0]), &mut no_errors());
    writer2.add_record(NamedInstrProfRecord::new("func1", 0x1234, vec![8]), &mut no_errors());

    writer.merge_records_from_writer(writer2, &mut no_errors());
    let reader = read(&writer);
    assert_eq!(
        reader.get_instr_prof_record("func1", 0x1234, None).unwrap().counts(),
        &[50]
    );
    assert_eq!(
        reader.get_instr_prof_record("func2", 0x1234, None).unwrap().counts(),
        &[0, 0]
    );
}

#[test]
fn merge_order_does_not_matter() {
    let records = vec![
        NamedInstrProfRecord::new("foo", 0x1, vec![1, 2]),
        NamedInstrProfRecord::new("bar", 0x2, vec![3]),
        NamedInstrProfRecord::new("foo", 0x1, vec![4, 5]),
        NamedInstrProfRecord::new("baz", 0x3, vec![6]),
        NamedInstrProfRecord::new("foo", 0x4, vec![7]),
    ];
    let mut forward = InstrProfWriter::default();
    for record in records.iter().cloned() {
        forward.add_record(record, &mut no_errors());
    }
    let mut backward = InstrProfWriter::default();
    for record in records.into_iter().rev() {
        backward.add_record(record, &mut no_errors());
    }
    assert_eq!(forward.write_buffer().unwrap(), backward.write_buffer().unwrap());
}

#[test]
fn sparse_profiles_drop_zero_records() {
    for sparse in [false, true] {
        let mut writer = sparse_writer(sparse);
        writer.add_record(NamedInstrProfRecord::new("hot", 0x1, vec![1, 0]), &mut no_errors());
        writer.add_record(NamedInstrProfRecord::new("cold", 0x2, vec![0, 0]), &mut no_errors());
        let reader = read(&writer);
        assert!(reader.get_instr_prof_record("hot", 0x1, None).is_ok());
        let cold = reader.get_instr_prof_record("cold", 0x2, None);
        if sparse {
            assert_eq!(cold, Err(InstrProfError::UnknownFunction));
            assert_eq!(reader.symtab().len(), 1);
        } else {
            assert_eq!(cold.unwrap().counts(), &[0, 0]);
        }
    }
}

#[test]
fn get_icall_data_read_write() {
    for kind in [ValueKind::IndirectCallTarget, ValueKind::VTableTarget] {
        for sparse in [false, true] {
            let mut writer = sparse_writer(sparse);
            add_callees(&mut writer);
            writer.add_record(caller_record(kind), &mut no_errors());
            let reader = read(&writer);

            let record = reader.get_instr_prof_record("caller", 0x1234, None).unwrap();
            assert_eq!(record.num_value_sites(kind), 4);
            let record = record.record;
            assert_eq!(record.num_value_data_for_site(kind, 0), 3);
            assert_eq!(record.num_value_data_for_site(kind, 1), 0);
            assert_eq!(record.num_value_data_for_site(kind, 2), 2);
            assert_eq!(record.num_value_data_for_site(kind, 3), 1);
            assert_eq!(record.num_value_data(kind), 6);

            let site = record.get_value_for_site(kind, 0);
            assert_eq!(
                reader.symtab().get_func_or_var_name(site[0].value),
                Some("callee3")
            );
            assert_eq!(site[0].count, 3);
            assert_eq!(
                reader.symtab().get_func_or_var_name(site[1].value),
                Some("callee2")
            );
            assert_eq!(site[1].count, 2);
            assert_eq!(
                reader.symtab().get_func_or_var_name(site[2].value),
                Some("callee1")
            );
            assert_eq!(site[2].count, 1);
        }
    }
}

#[test]
fn get_icall_data_read_write_with_weight() {
    let kind = ValueKind::IndirectCallTarget;
    let mut writer = InstrProfWriter::default();
    add_callees(&mut writer);
    writer.add_weighted_record(caller_record(kind), 10, &mut no_errors());
    let reader = read(&writer);

    let record = reader
        .get_instr_prof_record("caller", 0x1234, None)
        .unwrap()
        .record;
    assert_eq!(record.counts, vec![10, 20]);
    assert_eq!(
        record.get_value_for_site(kind, 0),
        values(&[(callee(3), 30), (callee(2), 20), (callee(1), 10)]).as_slice()
    );
    assert_eq!(record.site_total_count(kind, 0), 60);
    assert_eq!(record.site_total_count(kind, 1), 0);
}

#[test]
fn get_icall_data_read_write_big_endian() {
    let kind = ValueKind::IndirectCallTarget;
    let mut writer = InstrProfWriter::default();
    writer.set_value_prof_data_endianness(Endianness::Big);
    writer.add_record(caller_record(kind), &mut no_errors());
    let mut reader = read(&writer);
    assert_eq!(reader.header().value_prof_endianness(), Endianness::Big);

    let record = reader.get_instr_prof_record("caller", 0x1234, None).unwrap();
    assert_eq!(
        record.record.get_value_for_site(kind, 0),
        values(&[(callee(3), 3), (callee(2), 2), (callee(1), 1)]).as_slice()
    );

    reader.set_value_prof_data_endianness(Endianness::Little);
    assert_eq!(
        reader.get_instr_prof_record("caller", 0x1234, None),
        Err(InstrProfError::Malformed)
    );
}

#[test]
fn get_icall_data_merge() {
    let kind = ValueKind::IndirectCallTarget;
    let mut first = NamedInstrProfRecord::new("caller", 0x1234, vec![1, 2]);
    first.record.reserve_sites(kind, 2);
    first
        .record
        .add_value_data(kind, 0, &values(&[(callee(1), 1), (callee(2), 2)]), None);
    let mut second = NamedInstrProfRecord::new("caller", 0x1234, vec![1, 2]);
    second.record.reserve_sites(kind, 3);
    second
        .record
        .add_value_data(kind, 0, &values(&[(callee(2), 3), (callee(3), 4)]), None);
    second
        .record
        .add_value_data(kind, 2, &values(&[(callee(1), 7)]), None);

    let mut writer = InstrProfWriter::default();
    writer.add_record(first, &mut no_errors());
    writer.add_weighted_record(second, 2, &mut no_errors());
    let reader = read(&writer);

    let record = reader
        .get_instr_prof_record("caller", 0x1234, None)
        .unwrap()
        .record;
    assert_eq!(record.counts, vec![3, 6]);
    assert_eq!(record.num_value_sites(kind), 3);
    assert_eq!(
        record.get_value_for_site(kind, 0),
        values(&[(callee(2), 8), (callee(3), 8), (callee(1), 1)]).as_slice()
    );
    assert!(record.get_value_for_site(kind, 1).is_empty());
    assert_eq!(
        record.get_value_for_site(kind, 2),
        values(&[(callee(1), 14)]).as_slice()
    );
}

#[test]
fn get_icall_data_merge_saturation() {
    let max = u64::MAX;
    let mut errors = vec![];
    let mut writer = InstrProfWriter::default();

    writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![1]), &mut |e| {
        errors.push(e)
    });
    assert!(errors.is_empty());
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![max]), &mut |e| {
        errors.push(e)
    });
    assert_eq!(errors, vec![InstrProfError::CounterOverflow]);
    errors.clear();

    let kind = ValueKind::IndirectCallTarget;
    let mut record4 = NamedInstrProfRecord::new("baz", 0x5678, vec![3, 4]);
    record4.record.add_value_data(kind, 0, &values(&[(callee(1), 1)]), None);
    writer.add_record(record4, &mut |e| errors.push(e));
    assert!(errors.is_empty());

    let mut record5 = NamedInstrProfRecord::new("baz", 0x5678, vec![5, 6]);
    record5.record.add_value_data(kind, 0, &values(&[(callee(1), max)]), None);
    writer.add_record(record5, &mut |e| errors.push(e));
    // Reported once even though only a value count saturated
    assert_eq!(errors, vec![InstrProfError::CounterOverflow]);

    let reader = read(&writer);
    let foo = reader.get_instr_prof_record("foo", 0x1234, None).unwrap();
    assert_eq!(foo.counts(), &[MAX_COUNT_VALUE]);
    let baz = reader.get_instr_prof_record("baz", 0x5678, None).unwrap();
    assert_eq!(baz.counts(), &[8, 10]);
    assert_eq!(
        baz.record.get_value_for_site(kind, 0),
        values(&[(callee(1), max)]).as_slice()
    );
}

#[test]
fn get_icall_data_merge_site_trunc() {
    let kind = ValueKind::IndirectCallTarget;
    let mut record11 = NamedInstrProfRecord::new("caller", 0x1234, vec![1, 2]);
    record11.record.reserve_sites(kind, 2);
    let vd0 = (0..255u64)
        .map(|i| InstrProfValueData::new(2 * i, 2 * i + 1000))
        .collect::<Vec<_>>();
    record11.record.add_value_data(kind, 0, &vd0, None);
    record11.record.add_value_data(kind, 1, &[], None);

    let mut record12 = NamedInstrProfRecord::new("caller", 0x1234, vec![1, 2]);
    record12.record.reserve_sites(kind, 2);
    let vd1 = (0..255u64)
        .map(|i| InstrProfValueData::new(2 * i + 1, 2 * i + 1001))
        .collect::<Vec<_>>();
    record12.record.add_value_data(kind, 0, &vd1, None);
    record12.record.add_value_data(kind, 1, &[], None);

    let mut writer = InstrProfWriter::default();
    writer.add_record(record11, &mut no_errors());
    // Merge profile data
    writer.add_record(record12, &mut no_errors());
    let reader = read(&writer);

    let record = reader
        .get_instr_prof_record("caller", 0x1234, None)
        .unwrap()
        .record;
    assert_eq!(record.num_value_sites(kind), 2);
    let site = record.get_value_for_site(kind, 0);
    assert_eq!(site.len(), MAX_NUM_VALUE_PER_SITE);
    for (i, data) in site.iter().enumerate() {
        assert_eq!(data.value, 509 - i as u64);
        assert_eq!(data.count, 1509 - i as u64);
    }
}

#[test]
fn strict_merge_reports_mismatches() {
    let mut writer = InstrProfWriter::new(WriterOptions {
        merge_mode: MergeMode::Strict,
        ..Default::default()
    });
    let mut errors = vec![];
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1, vec![1, 2]), &mut |e| {
        errors.push(e)
    });
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1, vec![1, 2, 3]), &mut |e| {
        errors.push(e)
    });
    assert_eq!(errors, vec![InstrProfError::CountMismatch]);
    let reader = read(&writer);
    assert_eq!(
        reader.get_instr_prof_record("foo", 0x1, None).unwrap().counts(),
        &[1, 2]
    );

    // The default pads the shorter record with zeros
    let mut writer = InstrProfWriter::default();
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1, vec![1, 2]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1, vec![1, 2, 3]), &mut no_errors());
    let reader = read(&writer);
    assert_eq!(
        reader.get_instr_prof_record("foo", 0x1, None).unwrap().counts(),
        &[2, 4, 3]
    );
}

#[test]
fn deprecated_names() {
    let mut writer = InstrProfWriter::default();
    writer.add_record(NamedInstrProfRecord::new("func1", 0x1234, vec![1]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("func2.llvm.0", 0x1234, vec![2]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("func3", 0x1234, vec![3]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("func3.llvm.0", 0x1234, vec![4]), &mut no_errors());
    let reader = read(&writer);

    let counts = |name: &str, deprecated: Option<&str>| {
        reader
            .get_instr_prof_record(name, 0x1234, deprecated)
            .map(|x| x.record.counts)
    };
    assert_eq!(counts("func1", None), Ok(vec![1]));
    assert_eq!(counts("func1.llvm.0", Some("func1")), Ok(vec![1]));
    assert_eq!(counts("func2", None), Err(InstrProfError::UnknownFunction));
    assert_eq!(counts("func2", Some("func2.llvm.0")), Ok(vec![2]));
    // The current name wins over the deprecated one
    assert_eq!(counts("func3", Some("func3.llvm.0")), Ok(vec![3]));
    assert_eq!(counts("func3.llvm.0", Some("func3")), Ok(vec![4]));
    assert_eq!(
        reader.get_instr_prof_record("func4", 0x1234, Some("func1")),
        reader.get_instr_prof_record("func1", 0x1234, None)
    );
}

#[test]
fn instr_prof_reader_remapping() {
    let mut writer = InstrProfWriter::default();
    writer.add_record(
        NamedInstrProfRecord::new("_Z3fooi", 0x1234, vec![1, 2, 3, 4]),
        &mut no_errors(),
    );
    writer.add_record(
        NamedInstrProfRecord::new("file;_Z3barf", 0x567, vec![5, 6, 7]),
        &mut no_errors(),
    );
    let remapper = FragmentRemapper::parse(
        r"
        type i l
        name 3bar 4quux
        ",
    )
    .unwrap();
    let reader =
        IndexedProfileReader::create(writer.write_buffer().unwrap(), Some(Box::new(remapper)))
            .unwrap();

    let counts = |name: &str, hash: u64| {
        reader
            .get_instr_prof_record(name, hash, None)
            .map(|x| x.record.counts)
    };
    assert_eq!(counts("_Z3fooi", 0x1234), Ok(vec![1, 2, 3, 4]));
    assert_eq!(counts("file;_Z4quuxf", 0x567), Ok(vec![5, 6, 7]));
    assert_eq!(counts("_Z3fool", 0x1234), Ok(vec![1, 2, 3, 4]));
    assert_eq!(counts("file;_Z3barf", 0x567), Ok(vec![5, 6, 7]));
    assert_eq!(counts("_Z3fooi", 0x1235), Err(InstrProfError::HashMismatch));
    assert_eq!(counts("_Z3fool", 0x1235), Err(InstrProfError::HashMismatch));
    assert_eq!(counts("_Z3quxf", 0x1234), Err(InstrProfError::UnknownFunction));
}

#[test]
fn compressed_names() {
    let mut writer = InstrProfWriter::new(WriterOptions {
        compress_names: true,
        ..Default::default()
    });
    for i in 0..50 {
        writer.add_record(
            NamedInstrProfRecord::new(format!("function_{}", i), i, vec![i]),
            &mut no_errors(),
        );
    }
    let reader = read(&writer);
    assert_eq!(reader.symtab().len(), 50);
    for i in 0..50 {
        let name = format!("function_{}", i);
        assert_eq!(reader.symtab().get_func_or_var_name(compute_hash(&name)), Some(name.as_str()));
        let record = reader.get_instr_prof_record(&name, i, None).unwrap();
        assert_eq!(record.counts(), &[i]);
    }
}

fn memprof_frames() -> Vec<Frame> {
    vec![
        Frame::new(0x123, 1, 2, false),
        Frame::new(0x345, 3, 4, true),
        Frame::new(0x125, 5, 6, false),
        Frame::new(0x567, 7, 8, true),
    ]
}

fn mib(alloc_count: u32) -> MemInfoBlock {
    MemInfoBlock {
        alloc_count,
        total_access_count: 20,
        total_size: 30,
        total_lifetime: 40,
        ..Default::default()
    }
}

fn memprof_writer(version: MemProfVersion) -> (InstrProfWriter, MemProfRecord) {
    let mut writer = InstrProfWriter::default();
    writer.set_memprof_version(version);
    writer
        .merge_profile_kind(ProfileKind::IR_INSTRUMENTATION)
        .unwrap();
    let frames = memprof_frames();
    let ids = frames.iter().map(Frame::id).collect::<Vec<_>>();
    for (id, frame) in ids.iter().zip(&frames) {
        assert!(writer.add_memprof_frame(*id, *frame, &mut no_errors()));
    }
    let record = IndexedMemProfRecord {
        alloc_sites: vec![
            IndexedAllocationInfo {
                call_stack: CallStackRef::Inline(ids[0..2].to_vec()),
                info: mib(1),
            },
            IndexedAllocationInfo {
                call_stack: CallStackRef::Inline(ids[2..4].to_vec()),
                info: mib(2),
            },
        ],
        call_sites: vec![CallStackRef::Inline(ids[1..3].to_vec())],
    };
    writer.add_memprof_record(0x9999, record);
    let expected = MemProfRecord {
        alloc_sites: vec![
            AllocationInfo {
                call_stack: frames[0..2].to_vec(),
                info: mib(1),
            },
            AllocationInfo {
                call_stack: frames[2..4].to_vec(),
                info: mib(2),
            },
        ],
        call_sites: vec![frames[1..3].to_vec()],
    };
    (writer, expected)
}

#[test]
fn memprof_every_version() {
    for version in [MemProfVersion::V0, MemProfVersion::V1, MemProfVersion::V2] {
        let (mut writer, expected) = memprof_writer(version);
        writer.add_record(NamedInstrProfRecord::new("foo", 0x1234, vec![1, 2]), &mut no_errors());
        let reader = read(&writer);

        assert!(reader.has_memprof());
        assert!(reader.profile_kind().contains(ProfileKind::MEMPROF));
        assert_eq!(reader.memprof_record_ids().unwrap(), vec![0x9999]);
        assert_eq!(reader.get_memprof_record(0x9999).unwrap(), expected);
        assert_eq!(
            reader.get_memprof_record(0x1111),
            Err(InstrProfError::UnknownFunction)
        );
        assert_eq!(
            reader.get_instr_prof_record("foo", 0x1234, None).unwrap().counts(),
            &[1, 2]
        );
    }
}

#[test]
fn memprof_density_fields_need_v1() {
    let dense = MemInfoBlock {
        total_access_density: 5,
        ..mib(1)
    };
    for (version, density) in [(MemProfVersion::V0, 0), (MemProfVersion::V2, 5)] {
        let (mut writer, _) = memprof_writer(version);
        writer.add_memprof_record(
            0x7777,
            IndexedMemProfRecord {
                alloc_sites: vec![IndexedAllocationInfo {
                    call_stack: CallStackRef::Inline(vec![memprof_frames()[0].id()]),
                    info: dense,
                }],
                call_sites: vec![],
            },
        );
        let reader = read(&writer);
        let record = reader.get_memprof_record(0x7777).unwrap();
        assert_eq!(record.alloc_sites[0].info.total_access_density, density);
        assert_eq!(record.alloc_sites[0].info.alloc_count, 1);
    }
}

#[test]
fn memprof_getrecord_error() {
    let (mut writer, _) = memprof_writer(MemProfVersion::V2);
    let frame_id = memprof_frames()[0].id();
    writer.add_memprof_record(
        0x5555,
        IndexedMemProfRecord {
            alloc_sites: vec![IndexedAllocationInfo {
                call_stack: CallStackRef::Id(0xdead),
                info: mib(1),
            }],
            call_sites: vec![],
        },
    );
    writer.add_memprof_record(
        0x6666,
        IndexedMemProfRecord {
            alloc_sites: vec![],
            call_sites: vec![CallStackRef::Inline(vec![frame_id, 0xbeef])],
        },
    );
    let reader = read(&writer);
    assert_eq!(
        reader.get_memprof_record(0x5555),
        Err(InstrProfError::HashMismatch)
    );
    assert_eq!(
        reader.get_memprof_record(0x6666),
        Err(InstrProfError::HashMismatch)
    );
    // Other records are unaffected
    assert!(reader.get_memprof_record(0x9999).is_ok());
}

#[test]
fn memprof_merge_across_writers() {
    let (mut writer, expected) = memprof_writer(MemProfVersion::V2);
    let (other, _) = memprof_writer(MemProfVersion::V2);
    writer.merge_records_from_writer(other, &mut no_errors());
    let reader = read(&writer);
    let record = reader.get_memprof_record(0x9999).unwrap();
    assert_eq!(record.alloc_sites.len(), 4);
    assert_eq!(record.call_sites.len(), 2);
    assert_eq!(record.alloc_sites[..2], expected.alloc_sites[..]);
    assert_eq!(record.alloc_sites[2..], expected.alloc_sites[..]);
}

#[test]
fn memprof_conflicting_frames() {
    let (mut writer, _) = memprof_writer(MemProfVersion::V2);
    let id = memprof_frames()[0].id();
    let mut errors = vec![];
    assert!(!writer.add_memprof_frame(id, Frame::new(1, 1, 1, false), &mut |e| errors.push(e)));
    assert_eq!(errors, vec![InstrProfError::Malformed]);

    let stack_id = hash_call_stack(&[id]);
    assert!(writer.add_memprof_call_stack(stack_id, vec![id], &mut no_errors()));
    assert!(writer.add_memprof_call_stack(stack_id, vec![id], &mut no_errors()));
    assert!(!writer.add_memprof_call_stack(stack_id, vec![], &mut |e| errors.push(e)));
    assert_eq!(errors.len(), 2);
    assert_eq!(writer.memprof().frames[&id], memprof_frames()[0]);
}

fn trace(names: &[&str]) -> TemporalProfTrace {
    TemporalProfTrace::new(names.iter().map(compute_hash).collect())
}

fn temporal_writer(reservoir_size: usize, max_trace_length: usize) -> InstrProfWriter {
    let mut writer = InstrProfWriter::new(WriterOptions {
        reservoir_size,
        max_trace_length,
        ..Default::default()
    });
    for (name, hash) in [("foo", 1), ("bar", 2), ("goo", 3)] {
        writer.add_record(NamedInstrProfRecord::new(name, hash, vec![1]), &mut no_errors());
    }
    writer
}

#[test]
fn read_write_truncated_temporal_traces() {
    let mut writer = temporal_writer(10, 2);
    writer.add_temporal_profile_traces(vec![trace(&["foo", "bar", "goo"]), trace(&["foo", "bar"])], 2);
    let reader = read(&writer);
    assert!(reader.has_temporal_profile());
    assert!(reader.profile_kind().contains(ProfileKind::TEMPORAL_PROFILE));
    assert_eq!(reader.get_temporal_prof_trace_stream_size(), 2);
    assert_eq!(
        reader.get_temporal_prof_traces(),
        &[trace(&["foo", "bar"]), trace(&["foo", "bar"])]
    );
    let names = reader.get_temporal_prof_traces()[0]
        .function_name_refs
        .iter()
        .map(|x| reader.symtab().get_func_or_var_name(*x))
        .collect::<Vec<_>>();
    assert_eq!(names, vec![Some("foo"), Some("bar")]);
}

#[test]
fn merge_temporal_traces_across_writers() {
    let mut writer = temporal_writer(10, 100);
    writer.add_temporal_profile_traces(vec![trace(&["foo", "bar"])], 1);
    let mut other = temporal_writer(10, 100);
    other.add_temporal_profile_traces(vec![trace(&["goo"])], 1);
    writer.merge_records_from_writer(other, &mut no_errors());

    let reader = read(&writer);
    assert_eq!(reader.get_temporal_prof_trace_stream_size(), 2);
    assert_eq!(
        reader.get_temporal_prof_traces(),
        &[trace(&["foo", "bar"]), trace(&["goo"])]
    );
}

#[test]
fn sampled_temporal_traces() {
    let mut writer = temporal_writer(3, 100);
    let batch = vec![trace(&["foo"]), trace(&["bar"]), trace(&["goo"])];
    writer.add_temporal_profile_traces(batch, 5);
    writer.add_temporal_profile_traces(vec![trace(&["foo", "bar"]), trace(&["bar", "goo"])], 2);
    writer.add_temporal_profile_traces(vec![trace(&["goo", "foo"])], 1);

    let reader = read(&writer);
    assert_eq!(reader.get_temporal_prof_trace_stream_size(), 8);
    assert_eq!(reader.get_temporal_prof_traces().len(), 3);
}

#[test]
fn add_existing_profile() {
    let (mut writer, expected) = memprof_writer(MemProfVersion::V2);
    let kind = ValueKind::IndirectCallTarget;
    writer.add_record(caller_record(kind), &mut no_errors());
    writer.add_temporal_profile_traces(vec![trace(&["caller"])], 1);
    let reader = read(&writer);

    let mut merged = InstrProfWriter::default();
    merged.add_profile(&reader, 2, &mut no_errors()).unwrap();
    merged.add_profile(&reader, 1, &mut no_errors()).unwrap();
    let reader = read(&merged);

    let record = reader.get_instr_prof_record("caller", 0x1234, None).unwrap();
    assert_eq!(record.counts(), &[3, 6]);
    assert_eq!(record.record.site_total_count(kind, 0), 18);
    assert_eq!(reader.get_temporal_prof_trace_stream_size(), 2);
    let memprof = reader.get_memprof_record(0x9999).unwrap();
    assert_eq!(memprof.alloc_sites[..2], expected.alloc_sites[..]);
    assert_eq!(memprof.alloc_sites.len(), 4);

    let mut fe = InstrProfWriter::default();
    fe.merge_profile_kind(ProfileKind::FRONTEND_INSTRUMENTATION)
        .unwrap();
    assert_eq!(
        fe.add_profile(&reader, 1, &mut no_errors()),
        Err(InstrProfError::IncompatibleProfileKind)
    );
}

#[test]
fn corrupt_profiles() {
    let mut writer = InstrProfWriter::default();
    writer.add_record(NamedInstrProfRecord::new("foo", 0x1, vec![1]), &mut no_errors());
    writer.add_record(NamedInstrProfRecord::new("bar", 0x2, vec![2]), &mut no_errors());
    let data = writer.write_buffer().unwrap();
    let create = |data: &[u8]| IndexedProfileReader::create(data.to_vec(), None).unwrap_err();

    assert_eq!(create(&data[..4]), InstrProfError::BadMagic);
    let mut bad = data.clone();
    bad[0] = 0;
    assert_eq!(create(&bad), InstrProfError::BadMagic);
    assert_eq!(parse_bytes(&bad).unwrap_err(), InstrProfError::UnrecognizedFormat);

    let mut bad = data.clone();
    bad[8] = 13;
    assert_eq!(create(&bad), InstrProfError::UnsupportedVersion);

    let mut bad = data.clone();
    bad[32] = 2;
    assert_eq!(create(&bad), InstrProfError::UnsupportedHashType);

    assert_eq!(create(&data[..60]), InstrProfError::Malformed);
    assert_eq!(create(&data[..100]), InstrProfError::Malformed);

    // Name table claiming more bytes than there are
    let mut bad = data;
    bad[88..96].copy_from_slice(&u64::MAX.to_le_bytes());
    assert_eq!(create(&bad), InstrProfError::Malformed);
}
