use crate::hash_table::HashTableGenerator;
use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::indexed_profile::{
    endianness_to_u64, Header, IndexedProfileReader, FEATURE_SPARSE, HASH_TYPE_MD5, HEADER_SIZE,
    INDEXED_VERSION,
};
use crate::instrumentation_profile::memprof::{
    self, CallStackId, Frame, FrameId, GlobalValueId, IndexedMemProfRecord, MemProfData,
    MemProfRecord, MemProfVersion,
};
use crate::instrumentation_profile::summary::ProfileSummaryBuilder;
use crate::instrumentation_profile::temporal::{self, TemporalProfTrace, TraceReservoir};
use crate::instrumentation_profile::types::*;
use crate::instrumentation_profile::value_prof::ValueProfData;
use crate::summary::Kind;
use crate::util::{collect_name_strings, pad_to_alignment, write_u64, write_u64_array};
use indexmap::{map::Entry, IndexMap};
use nom::number::Endianness;
use std::io::{self, Write};
use tracing::{debug, warn};

/// Settings of an `InstrProfWriter`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriterOptions {
    /// Leave out functions whose counters are all zero
    pub sparse: bool,
    /// Maximum number of temporal traces kept
    pub reservoir_size: usize,
    pub max_trace_length: usize,
    pub memprof_version: MemProfVersion,
    pub value_prof_endianness: Endianness,
    pub compress_names: bool,
    pub merge_mode: MergeMode,
    pub allow_incompatible_kinds: bool,
    /// Seed of the temporal trace sampler
    pub seed: u64,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            sparse: false,
            reservoir_size: 100,
            max_trace_length: 10000,
            memprof_version: MemProfVersion::default(),
            value_prof_endianness: Endianness::Little,
            compress_names: false,
            merge_mode: MergeMode::default(),
            allow_incompatible_kinds: false,
            seed: 0,
        }
    }
}

/// Accumulates profile records and writes them out as an indexed profile.
#[derive(Clone, Debug)]
pub struct InstrProfWriter {
    options: WriterOptions,
    function_data: IndexMap<String, IndexMap<u64, InstrProfRecord>>,
    profile_kind: ProfileKind,
    memprof: MemProfData,
    temporal: TraceReservoir,
}

impl Default for InstrProfWriter {
    fn default() -> Self {
        Self::new(WriterOptions::default())
    }
}

impl InstrProfWriter {
    pub fn new(options: WriterOptions) -> Self {
        Self {
            options,
            function_data: IndexMap::new(),
            profile_kind: ProfileKind::UNKNOWN,
            memprof: MemProfData::default(),
            temporal: TraceReservoir::new(
                options.reservoir_size,
                options.max_trace_length,
                options.seed,
            ),
        }
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn set_sparse(&mut self, sparse: bool) {
        self.options.sparse = sparse;
    }

    pub fn set_value_prof_data_endianness(&mut self, endianness: Endianness) {
        self.options.value_prof_endianness = endianness;
    }

    pub fn set_memprof_version(&mut self, version: MemProfVersion) {
        self.options.memprof_version = version;
    }

    pub fn profile_kind(&self) -> ProfileKind {
        self.profile_kind
    }

    pub fn memprof(&self) -> &MemProfData {
        &self.memprof
    }

    pub fn temporal_traces(&self) -> &TraceReservoir {
        &self.temporal
    }

    pub fn num_functions(&self) -> usize {
        self.function_data.len()
    }

    pub fn get_record(&self, name: &str, hash: u64) -> Option<&InstrProfRecord> {
        self.function_data.get(name).and_then(|x| x.get(&hash))
    }

    /// Unions `other` into the kind of the profile. Front end and IR instrumentation can't be
    /// mixed and neither can function entry only profiles with basic block profiles.
    pub fn merge_profile_kind(&mut self, other: ProfileKind) -> Result<(), InstrProfError> {
        if self.profile_kind.is_unknown() {
            self.profile_kind = other;
            return Ok(());
        }
        let ours = self.profile_kind;
        let incompatible = |a: ProfileKind, b: ProfileKind| {
            (ours.intersects(a) && other.intersects(b))
                || (ours.intersects(b) && other.intersects(a))
        };
        if !self.options.allow_incompatible_kinds
            && (incompatible(
                ProfileKind::FRONTEND_INSTRUMENTATION,
                ProfileKind::IR_INSTRUMENTATION,
            ) || incompatible(
                ProfileKind::FUNCTION_ENTRY_ONLY,
                ProfileKind::FUNCTION_ENTRY_INSTRUMENTATION,
            ))
        {
            debug!("Can't merge {:?} into {:?}", other, ours);
            return Err(InstrProfError::IncompatibleProfileKind);
        }
        self.profile_kind |= other;
        Ok(())
    }

    pub fn add_record(&mut self, record: NamedInstrProfRecord, warn: &mut dyn FnMut(InstrProfError)) {
        self.add_weighted_record(record, 1, warn);
    }

    /// The first record for a name and hash is stored scaled by `weight` with its value sites
    /// normalized, later ones are merged into it.
    pub fn add_weighted_record(
        &mut self,
        record: NamedInstrProfRecord,
        weight: u64,
        warn: &mut dyn FnMut(InstrProfError),
    ) {
        let NamedInstrProfRecord { name, hash, record } = record;
        let mode = self.options.merge_mode;
        let records = self.function_data.entry(name).or_default();
        match records.entry(hash) {
            Entry::Vacant(e) => {
                let record = e.insert(record);
                let overflowed = if weight > 1 {
                    record.scale(weight)
                } else {
                    record.normalize_value_sites()
                };
                if overflowed {
                    warn(InstrProfError::CounterOverflow);
                }
            }
            Entry::Occupied(mut e) => e.get_mut().merge(&record, weight, mode, warn),
        }
    }

    /// Moves everything from `other` into this writer.
    pub fn merge_records_from_writer(
        &mut self,
        other: InstrProfWriter,
        warn: &mut dyn FnMut(InstrProfError),
    ) {
        if let Err(e) = self.merge_profile_kind(other.profile_kind) {
            warn(e);
            return;
        }
        for (name, records) in other.function_data {
            for (hash, record) in records {
                let record = NamedInstrProfRecord {
                    name: name.clone(),
                    hash,
                    record,
                };
                self.add_record(record, warn);
            }
        }
        self.memprof.merge(other.memprof, warn);
        self.temporal.merge(other.temporal);
    }

    /// Adds every record, memprof record and temporal trace of an existing profile.
    pub fn add_profile(
        &mut self,
        reader: &IndexedProfileReader,
        weight: u64,
        warn: &mut dyn FnMut(InstrProfError),
    ) -> Result<(), InstrProfError> {
        self.merge_profile_kind(reader.profile_kind())?;
        for record in reader.iter() {
            self.add_weighted_record(record?, weight, warn);
        }
        if reader.has_memprof() {
            for id in reader.memprof_record_ids()? {
                match reader.get_memprof_record(id) {
                    Ok(record) => self.add_memprof_resolved_record(id, &record, warn),
                    Err(e) => {
                        warn!("Skipping memprof record {:#x}: {}", id, e);
                        warn(e);
                    }
                }
            }
        }
        if reader.has_temporal_profile() {
            self.add_temporal_profile_traces(
                reader.get_temporal_prof_traces().to_vec(),
                reader.get_temporal_prof_trace_stream_size(),
            );
        }
        Ok(())
    }

    pub fn add_temporal_profile_traces(&mut self, traces: Vec<TemporalProfTrace>, stream_size: u64) {
        self.profile_kind |= ProfileKind::TEMPORAL_PROFILE;
        self.temporal.add_traces(traces, stream_size);
    }

    pub fn add_memprof_frame(
        &mut self,
        id: FrameId,
        frame: Frame,
        warn: &mut dyn FnMut(InstrProfError),
    ) -> bool {
        self.profile_kind |= ProfileKind::MEMPROF;
        self.memprof.add_frame(id, frame, warn)
    }

    pub fn add_memprof_call_stack(
        &mut self,
        id: CallStackId,
        frames: Vec<FrameId>,
        warn: &mut dyn FnMut(InstrProfError),
    ) -> bool {
        self.profile_kind |= ProfileKind::MEMPROF;
        self.memprof.add_call_stack(id, frames, warn)
    }

    pub fn add_memprof_record(&mut self, id: GlobalValueId, record: IndexedMemProfRecord) {
        self.profile_kind |= ProfileKind::MEMPROF;
        self.memprof.add_record(id, record);
    }

    /// Adds a record with resolved call stacks, its frames are added under their content ids.
    pub fn add_memprof_resolved_record(
        &mut self,
        id: GlobalValueId,
        record: &MemProfRecord,
        warn: &mut dyn FnMut(InstrProfError),
    ) {
        let memprof = &mut self.memprof;
        let record = IndexedMemProfRecord::from_memprof_record(record, |frame_id, frame| {
            memprof.add_frame(frame_id, frame, &mut *warn);
        });
        self.add_memprof_record(id, record);
    }

    fn should_write(&self, records: &IndexMap<u64, InstrProfRecord>) -> bool {
        !self.options.sparse || records.values().any(|x| !x.is_all_zero())
    }

    pub fn write(&self, writer: &mut impl Write) -> io::Result<()> {
        let buffer = self.write_buffer()?;
        writer.write_all(&buffer)
    }

    /// Serialises the profile. Functions and their hashes are written sorted so the output
    /// doesn't depend on the order records were added in.
    pub fn write_buffer(&self) -> Result<Vec<u8>, InstrProfError> {
        let endianness = self.options.value_prof_endianness;
        let mut names = self
            .function_data
            .iter()
            .filter(|(_, records)| self.should_write(records))
            .collect::<Vec<_>>();
        names.sort_unstable_by(|a, b| a.0.cmp(b.0));

        let mut header = Header {
            version: INDEXED_VERSION,
            features: self.profile_kind.bits(),
            value_prof_endianness: endianness_to_u64(endianness),
            hash_type: HASH_TYPE_MD5,
            ..Default::default()
        };
        if self.options.sparse {
            header.features |= FEATURE_SPARSE;
        }
        let mut out = vec![0; HEADER_SIZE];

        let blob = collect_name_strings(
            &names.iter().map(|x| x.0.as_str()).collect::<Vec<_>>(),
            self.options.compress_names,
        )?;
        header.name_table_offset = out.len() as u64;
        write_u64(&mut out, blob.len() as u64);
        out.extend_from_slice(&blob);

        let mut summary = ProfileSummaryBuilder::default();
        let mut cs_summary = ProfileSummaryBuilder::default();
        let mut table = HashTableGenerator::new();
        for (name, records) in &names {
            let mut hashes = records.iter().collect::<Vec<_>>();
            hashes.sort_unstable_by_key(|x| *x.0);
            let mut data = vec![];
            for (hash, record) in hashes {
                if has_cs_flag_in_hash(*hash) {
                    cs_summary.add_record(record);
                } else {
                    summary.add_record(record);
                }
                write_u64(&mut data, *hash);
                write_u64_array(&mut data, &record.counts);
                ValueProfData::serialize_from(record).write(endianness, &mut data);
            }
            table.insert(compute_hash(name), name.as_bytes().to_vec(), data);
        }
        pad_to_alignment(&mut out);
        header.record_table_offset = out.len() as u64;
        table.emit(&mut out);

        pad_to_alignment(&mut out);
        header.summary_offset = out.len() as u64;
        summary.get_summary(Kind::Instr).write(&mut out);

        if self.profile_kind.contains(ProfileKind::CONTEXT_SENSITIVE)
            || cs_summary.num_functions() > 0
        {
            pad_to_alignment(&mut out);
            header.cs_summary_offset = out.len() as u64;
            cs_summary.get_summary(Kind::CsInstr).write(&mut out);
        }

        if self.profile_kind.contains(ProfileKind::MEMPROF) {
            pad_to_alignment(&mut out);
            header.memprof_offset = out.len() as u64;
            memprof::write_section(&mut out, self.options.memprof_version, &self.memprof)?;
        }

        if self.profile_kind.contains(ProfileKind::TEMPORAL_PROFILE) {
            pad_to_alignment(&mut out);
            header.temporal_prof_offset = out.len() as u64;
            temporal::write_section(
                &mut out,
                self.temporal.traces(),
                self.temporal.stream_size(),
            );
        }
        pad_to_alignment(&mut out);

        let mut header_bytes = Vec::with_capacity(HEADER_SIZE);
        header.write(&mut header_bytes);
        out[..HEADER_SIZE].copy_from_slice(&header_bytes);
        debug!(
            "Wrote {} functions in {} bytes: {:?}",
            names.len(),
            out.len(),
            header
        );
        Ok(out)
    }
}
