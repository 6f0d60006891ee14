use crate::hash_table::{HashTable, HashTableIter};
use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::memprof::{GlobalValueId, MemProfIndex, MemProfRecord};
use crate::instrumentation_profile::remapping::NameRemapper;
use crate::instrumentation_profile::symtab::Symtab;
use crate::instrumentation_profile::temporal::{self, TemporalProfTrace};
use crate::instrumentation_profile::types::*;
use crate::instrumentation_profile::value_prof::ValueProfData;
use crate::instrumentation_profile::ParseResult;
use crate::summary::{Kind, ProfileSummary};
use crate::util::{parse_u64_array, slice_from, write_u64};
use nom::multi::{count, length_data};
use nom::number::complete::le_u64;
use nom::number::Endianness;
use rustc_hash::FxHashMap;
use std::fmt;
use std::io::prelude::*;
use tracing::debug;

pub const MAGIC: [u8; 8] = [0xff, 0x6c, 0x70, 0x72, 0x6f, 0x66, 0x69, 0x81];
pub const INDEXED_VERSION: u64 = 12;
/// Feature bit set when records with only zero counters were left out
pub const FEATURE_SPARSE: u64 = 1 << 32;
pub const HASH_TYPE_MD5: u64 = 0;
pub const HEADER_SIZE: usize = 88;

pub(crate) fn endianness_to_u64(endianness: Endianness) -> u64 {
    match endianness {
        Endianness::Little => 0,
        Endianness::Big => 1,
        Endianness::Native if cfg!(target_endian = "big") => 1,
        Endianness::Native => 0,
    }
}

/// Detects an indexed profile from its magic
pub fn has_format(mut input: impl Read) -> bool {
    let mut buffer: [u8; 8] = [0; 8];
    if input.read_exact(&mut buffer).is_ok() {
        buffer == MAGIC
    } else {
        false
    }
}

/// ```text
/// u64 magic
/// u64 version
/// u64 features
/// u64 value_prof_endianness
/// u64 hash_type
/// u64 name_table_offset
/// u64 record_table_offset
/// u64 summary_offset
/// u64 cs_summary_offset
/// u64 memprof_offset
/// u64 temporal_prof_offset
/// ```
///
/// Offsets are from the start of the file, an offset of 0 means the section isn't present.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Header {
    pub version: u64,
    pub features: u64,
    pub value_prof_endianness: u64,
    pub hash_type: u64,
    pub name_table_offset: u64,
    pub record_table_offset: u64,
    pub summary_offset: u64,
    pub cs_summary_offset: u64,
    pub memprof_offset: u64,
    pub temporal_prof_offset: u64,
}

fn parse_header_fields(input: &[u8]) -> ParseResult<Vec<u64>> {
    count(le_u64, 10)(input)
}

impl Header {
    pub fn parse(data: &[u8]) -> Result<Self, InstrProfError> {
        if !has_format(data) {
            return Err(InstrProfError::BadMagic);
        }
        let (_, fields) = parse_header_fields(&data[MAGIC.len()..])?;
        let header = Self {
            version: fields[0],
            features: fields[1],
            value_prof_endianness: fields[2],
            hash_type: fields[3],
            name_table_offset: fields[4],
            record_table_offset: fields[5],
            summary_offset: fields[6],
            cs_summary_offset: fields[7],
            memprof_offset: fields[8],
            temporal_prof_offset: fields[9],
        };
        if header.version != INDEXED_VERSION
            || header.features & !(ProfileKind::ALL_BITS | FEATURE_SPARSE) != 0
        {
            return Err(InstrProfError::UnsupportedVersion);
        }
        if header.hash_type != HASH_TYPE_MD5 {
            return Err(InstrProfError::UnsupportedHashType);
        }
        if header.value_prof_endianness > 1 {
            return Err(InstrProfError::Malformed);
        }
        let len = data.len() as u64;
        let sections = [
            header.name_table_offset,
            header.record_table_offset,
            header.summary_offset,
            header.cs_summary_offset,
            header.memprof_offset,
            header.temporal_prof_offset,
        ];
        if header.name_table_offset == 0
            || header.record_table_offset == 0
            || sections
                .iter()
                .any(|x| *x != 0 && (*x < HEADER_SIZE as u64 || *x >= len))
        {
            return Err(InstrProfError::Malformed);
        }
        Ok(header)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        for field in &[
            self.version,
            self.features,
            self.value_prof_endianness,
            self.hash_type,
            self.name_table_offset,
            self.record_table_offset,
            self.summary_offset,
            self.cs_summary_offset,
            self.memprof_offset,
            self.temporal_prof_offset,
        ] {
            write_u64(out, *field);
        }
    }

    pub fn profile_kind(&self) -> ProfileKind {
        ProfileKind::from_bits(self.features & ProfileKind::ALL_BITS).unwrap_or_default()
    }

    pub fn is_sparse(&self) -> bool {
        self.features & FEATURE_SPARSE != 0
    }

    pub fn value_prof_endianness(&self) -> Endianness {
        if self.value_prof_endianness == 1 {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

fn parse_name_table(input: &[u8]) -> ParseResult<&[u8]> {
    length_data(le_u64)(input)
}

/// Decodes every `(hash, record)` stored under one name.
fn parse_function_records(
    mut input: &[u8],
    endianness: Endianness,
) -> ParseResult<Vec<(u64, InstrProfRecord)>> {
    let mut records = vec![];
    while !input.is_empty() {
        let (bytes, hash) = le_u64(input)?;
        let (bytes, counts) = parse_u64_array(bytes)?;
        let (bytes, value_data) = ValueProfData::parse(bytes, endianness)?;
        let mut record = InstrProfRecord::new(counts);
        value_data.deserialize_to(&mut record, None);
        records.push((hash, record));
        input = bytes;
    }
    Ok((input, records))
}

/// Reads an indexed profile held in memory. Only the header, name table and summaries are
/// decoded up front, records are decoded as they're looked up.
pub struct IndexedProfileReader {
    data: Vec<u8>,
    header: Header,
    symtab: Symtab,
    summary: ProfileSummary,
    cs_summary: ProfileSummary,
    memprof: Option<MemProfIndex>,
    temporal_traces: Vec<TemporalProfTrace>,
    temporal_stream_size: u64,
    value_prof_endianness: Endianness,
    remapper: Option<Box<dyn NameRemapper>>,
    /// canonical name to the profile names with that canonical form
    remapped_names: FxHashMap<String, Vec<String>>,
}

impl fmt::Debug for IndexedProfileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedProfileReader")
            .field("header", &self.header)
            .field("symtab", &self.symtab)
            .field("summary", &self.summary)
            .field("cs_summary", &self.cs_summary)
            .field("memprof", &self.memprof)
            .field("temporal_stream_size", &self.temporal_stream_size)
            .finish_non_exhaustive()
    }
}

impl IndexedProfileReader {
    pub fn create(
        data: Vec<u8>,
        remapper: Option<Box<dyn NameRemapper>>,
    ) -> Result<Self, InstrProfError> {
        let header = Header::parse(&data)?;
        debug!("Indexed profile header: {:?}", header);

        let (_, names) = parse_name_table(slice_from(&data, header.name_table_offset)?)?;
        let symtab = Symtab::create_from_name_strings(names)?;
        HashTable::parse(slice_from(&data, header.record_table_offset)?)?;

        let summary = match header.summary_offset {
            0 => ProfileSummary::empty(Kind::Instr),
            offset => ProfileSummary::parse(slice_from(&data, offset)?, Kind::Instr)?.1,
        };
        let cs_summary = match header.cs_summary_offset {
            0 => ProfileSummary::empty(Kind::CsInstr),
            offset => ProfileSummary::parse(slice_from(&data, offset)?, Kind::CsInstr)?.1,
        };
        let memprof = match header.memprof_offset {
            0 => None,
            offset => Some(MemProfIndex::parse(&data, offset)?),
        };
        let (temporal_traces, temporal_stream_size) = match header.temporal_prof_offset {
            0 => (vec![], 0),
            offset => temporal::parse_section(slice_from(&data, offset)?)?.1,
        };

        let mut remapped_names: FxHashMap<String, Vec<String>> = FxHashMap::default();
        if let Some(remapper) = remapper.as_ref() {
            for name in symtab.names.values() {
                remapped_names
                    .entry(remapper.canonicalize(name))
                    .or_default()
                    .push(name.clone());
            }
        }
        debug!(
            "Loaded profile with {} names, memprof: {}, {} temporal traces",
            symtab.len(),
            memprof.is_some(),
            temporal_traces.len()
        );
        Ok(Self {
            value_prof_endianness: header.value_prof_endianness(),
            data,
            header,
            symtab,
            summary,
            cs_summary,
            memprof,
            temporal_traces,
            temporal_stream_size,
            remapper,
            remapped_names,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn version(&self) -> u64 {
        self.header.version
    }

    pub fn profile_kind(&self) -> ProfileKind {
        self.header.profile_kind()
    }

    pub fn is_sparse(&self) -> bool {
        self.header.is_sparse()
    }

    pub fn symtab(&self) -> &Symtab {
        &self.symtab
    }

    /// Overrides the byte order the value profile data is decoded with.
    pub fn set_value_prof_data_endianness(&mut self, endianness: Endianness) {
        self.value_prof_endianness = endianness;
    }

    fn record_table(&self) -> Result<HashTable<'_>, InstrProfError> {
        HashTable::parse(slice_from(&self.data, self.header.record_table_offset)?)
    }

    fn find_function(&self, name: &str) -> Result<Option<Vec<(u64, InstrProfRecord)>>, InstrProfError> {
        let table = self.record_table()?;
        match table.find(compute_hash(name), name.as_bytes())? {
            Some(data) => {
                let (_, records) = parse_function_records(data, self.value_prof_endianness)?;
                Ok(Some(records))
            }
            None => Ok(None),
        }
    }

    /// Names to try for `name`, itself first and then the profile names it remaps to.
    fn candidates<'a>(&'a self, name: &'a str) -> Vec<&'a str> {
        let mut result = vec![name];
        if let Some(remapper) = self.remapper.as_ref() {
            if let Some(names) = self.remapped_names.get(&remapper.canonicalize(name)) {
                result.extend(names.iter().map(|x| x.as_str()).filter(|x| *x != name));
            }
        }
        result
    }

    /// Looks up the record for `name` with content hash `hash`. When the profile has no data under
    /// `name` the remapped names are tried, then `deprecated_name` and its remapped names. The
    /// first name with data decides the outcome.
    pub fn get_instr_prof_record(
        &self,
        name: &str,
        hash: u64,
        deprecated_name: Option<&str>,
    ) -> Result<NamedInstrProfRecord, InstrProfError> {
        let mut candidates = self.candidates(name);
        if let Some(deprecated) = deprecated_name {
            candidates.extend(self.candidates(deprecated));
        }
        for candidate in candidates {
            if let Some(records) = self.find_function(candidate)? {
                return records
                    .into_iter()
                    .find(|x| x.0 == hash)
                    .map(|(hash, record)| NamedInstrProfRecord {
                        name: candidate.to_string(),
                        hash,
                        record,
                    })
                    .ok_or(InstrProfError::HashMismatch);
            }
        }
        Err(InstrProfError::UnknownFunction)
    }

    pub fn get_function_counts(
        &self,
        name: &str,
        hash: u64,
        counts: &mut Vec<u64>,
    ) -> Result<(), InstrProfError> {
        let record = self.get_instr_prof_record(name, hash, None)?;
        *counts = record.record.counts;
        Ok(())
    }

    pub fn get_summary(&self, is_cs: bool) -> &ProfileSummary {
        if is_cs {
            &self.cs_summary
        } else {
            &self.summary
        }
    }

    pub fn get_maximum_function_count(&self, is_cs: bool) -> u64 {
        self.get_summary(is_cs).max_function_count()
    }

    pub fn has_memprof(&self) -> bool {
        self.memprof.is_some()
    }

    pub fn get_memprof_record(&self, id: GlobalValueId) -> Result<MemProfRecord, InstrProfError> {
        match self.memprof.as_ref() {
            Some(memprof) => memprof.get_record(&self.data, id),
            None => Err(InstrProfError::UnknownFunction),
        }
    }

    pub fn memprof_record_ids(&self) -> Result<Vec<GlobalValueId>, InstrProfError> {
        match self.memprof.as_ref() {
            Some(memprof) => memprof.record_ids(&self.data),
            None => Ok(vec![]),
        }
    }

    pub fn has_temporal_profile(&self) -> bool {
        self.header.temporal_prof_offset != 0
    }

    pub fn get_temporal_prof_traces(&self) -> &[TemporalProfTrace] {
        &self.temporal_traces
    }

    pub fn get_temporal_prof_trace_stream_size(&self) -> u64 {
        self.temporal_stream_size
    }

    /// Walks every record in the profile, the order is the on disk order.
    pub fn iter(&self) -> RecordIter<'_> {
        match self.record_table() {
            Ok(table) => RecordIter {
                reader: self,
                items: Some(table.iter()),
                pending: vec![].into_iter(),
                error: None,
            },
            Err(e) => RecordIter {
                reader: self,
                items: None,
                pending: vec![].into_iter(),
                error: Some(e),
            },
        }
    }
}

impl<'a> IntoIterator for &'a IndexedProfileReader {
    type Item = Result<NamedInstrProfRecord, InstrProfError>;
    type IntoIter = RecordIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct RecordIter<'a> {
    reader: &'a IndexedProfileReader,
    items: Option<HashTableIter<'a>>,
    pending: std::vec::IntoIter<NamedInstrProfRecord>,
    error: Option<InstrProfError>,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<NamedInstrProfRecord, InstrProfError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.next() {
                return Some(Ok(record));
            }
            if let Some(e) = self.error.take() {
                self.items = None;
                return Some(Err(e));
            }
            let item = match self.items.as_mut()?.next()? {
                Ok(item) => item,
                Err(e) => {
                    self.error = Some(e);
                    continue;
                }
            };
            let name = match std::str::from_utf8(item.key) {
                Ok(name) => name,
                Err(_) => {
                    self.error = Some(InstrProfError::Malformed);
                    continue;
                }
            };
            match parse_function_records(item.data, self.reader.value_prof_endianness) {
                Ok((_, records)) => {
                    self.pending = records
                        .into_iter()
                        .map(|(hash, record)| NamedInstrProfRecord {
                            name: name.to_string(),
                            hash,
                            record,
                        })
                        .collect::<Vec<_>>()
                        .into_iter();
                }
                Err(_) => self.error = Some(InstrProfError::Malformed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation_profile::binary_writer::InstrProfWriter;
    use crate::instrumentation_profile::remapping::FragmentRemapper;
    use std::convert::TryInto;

    fn profile() -> Vec<u8> {
        let mut writer = InstrProfWriter::default();
        let mut warn = |e: InstrProfError| panic!("unexpected {:?}", e);
        for (name, hash, counts) in [
            ("foo", 0x1234, vec![1, 2]),
            ("foo", 0x1235, vec![3, 4]),
            ("bar", 0x2345, vec![5]),
            ("_Z3barf", 0x3456, vec![6, 7, 8]),
        ] {
            writer.add_record(NamedInstrProfRecord::new(name, hash, counts), &mut warn);
        }
        writer.write_buffer().unwrap()
    }

    #[test]
    fn format_detection() {
        assert!(has_format(&MAGIC[..]));
        assert!(!has_format(&MAGIC[..7]));
        assert!(!has_format(&[0u8; 8][..]));
        assert!(has_format(profile().as_slice()));
    }

    #[test]
    fn header_validation() {
        let data = profile();
        assert_eq!(Header::parse(&data[..4]), Err(InstrProfError::BadMagic));
        assert_eq!(Header::parse(&data[..40]), Err(InstrProfError::Malformed));

        let mut bad = data.clone();
        bad[8] = 11;
        assert_eq!(Header::parse(&bad), Err(InstrProfError::UnsupportedVersion));

        let mut bad = data.clone();
        bad[16 + 5] = 1;
        assert_eq!(Header::parse(&bad), Err(InstrProfError::UnsupportedVersion));

        let mut bad = data.clone();
        bad[32] = 1;
        assert_eq!(Header::parse(&bad), Err(InstrProfError::UnsupportedHashType));

        let mut bad = data;
        bad[48..56].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(Header::parse(&bad), Err(InstrProfError::Malformed));
    }

    #[test]
    fn lookups() {
        let reader = IndexedProfileReader::create(profile(), None).unwrap();
        let record = reader.get_instr_prof_record("foo", 0x1235, None).unwrap();
        assert_eq!(record.counts(), &[3, 4]);
        assert_eq!(
            reader.get_instr_prof_record("foo", 0x9999, None),
            Err(InstrProfError::HashMismatch)
        );
        assert_eq!(
            reader.get_instr_prof_record("baz", 0x1234, None),
            Err(InstrProfError::UnknownFunction)
        );
        let record = reader
            .get_instr_prof_record("baz", 0x2345, Some("bar"))
            .unwrap();
        assert_eq!(record.name, "bar");

        let mut counts = vec![];
        reader.get_function_counts("foo", 0x1234, &mut counts).unwrap();
        assert_eq!(counts, vec![1, 2]);

        let mut seen = reader
            .iter()
            .map(|x| x.map(|r| (r.name, r.hash)))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("_Z3barf".to_string(), 0x3456),
                ("bar".to_string(), 0x2345),
                ("foo".to_string(), 0x1234),
                ("foo".to_string(), 0x1235),
            ]
        );
    }

    #[test]
    fn remapped_lookup() {
        let remapper = FragmentRemapper::new(vec![("3bar", "4quux")]);
        let reader = IndexedProfileReader::create(profile(), Some(Box::new(remapper))).unwrap();
        let record = reader.get_instr_prof_record("_Z4quuxf", 0x3456, None).unwrap();
        assert_eq!(record.counts(), &[6, 7, 8]);
        assert_eq!(record.name, "_Z3barf");
        assert_eq!(
            reader.get_instr_prof_record("_Z4quuxf", 0x1, None),
            Err(InstrProfError::HashMismatch)
        );
    }

    #[test]
    fn corrupt_records_end_iteration() {
        let mut data = profile();
        let header = Header::parse(&data).unwrap();
        // Overwrite every bucket offset with garbage
        let table = header.record_table_offset as usize;
        let num_buckets = u64::from_le_bytes(data[table..table + 8].try_into().unwrap()) as usize;
        for slot in 0..num_buckets {
            let start = table + 16 + slot * 8;
            if data[start..start + 8] != [0; 8] {
                data[start..start + 8].copy_from_slice(&(u32::MAX as u64).to_le_bytes());
            }
        }
        let reader = IndexedProfileReader::create(data, None).unwrap();
        let results = reader.iter().collect::<Vec<_>>();
        assert_eq!(results, vec![Err(InstrProfError::Malformed)]);
    }
}
