#![no_main]
use indexed_profdata::parse_bytes;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(reader) = parse_bytes(data) {
        for record in &reader {
            if let Ok(record) = record {
                let _ = reader.get_instr_prof_record(&record.name, record.hash, None);
            }
        }
        if let Ok(ids) = reader.memprof_record_ids() {
            for id in ids {
                let _ = reader.get_memprof_record(id);
            }
        }
    }
});
