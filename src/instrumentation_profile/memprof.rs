use crate::hash_table::{HashTable, HashTableGenerator};
use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::types::compute_hash;
use crate::instrumentation_profile::ParseResult;
use crate::util::{pad_to_alignment, parse_u64_array, slice_from, write_u64, write_u64_array};
use indexmap::{map::Entry, IndexMap};
use nom::error::{ErrorKind, ParseError, VerboseError};
use nom::multi::count;
use nom::number::complete::{le_u32, le_u64, le_u8};
use std::convert::{TryFrom, TryInto};
use tracing::{debug, warn};

pub type FrameId = u64;
pub type CallStackId = u64;
pub type GlobalValueId = u64;

/// Number of `MemInfoBlock` fields written by `MemProfVersion::V0`.
const BASE_FIELDS: usize = 19;

/// Layout of the memprof section.
///
/// * `V0` stores the frame ids of every call stack inline in the record.
/// * `V1` keeps that layout and adds the access density fields to the `MemInfoBlock` schema.
/// * `V2` stores a `CallStackId` per site, the frames of each call stack live in a separate table
///   shared by every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemProfVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
}

impl Default for MemProfVersion {
    fn default() -> Self {
        Self::V2
    }
}

impl TryFrom<u64> for MemProfVersion {
    type Error = InstrProfError;

    fn try_from(version: u64) -> Result<Self, Self::Error> {
        match version {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            _ => Err(InstrProfError::UnsupportedVersion),
        }
    }
}

impl MemProfVersion {
    /// The `MemInfoBlock` fields serialised by this version, in order.
    pub fn schema(self) -> &'static [Meta] {
        match self {
            Self::V0 => &Meta::ALL[..BASE_FIELDS],
            Self::V1 | Self::V2 => Meta::ALL,
        }
    }
}

trait MibValue: Sized {
    fn parse(input: &[u8]) -> ParseResult<Self>;
}

impl MibValue for u32 {
    fn parse(input: &[u8]) -> ParseResult<Self> {
        le_u32(input)
    }
}

impl MibValue for u64 {
    fn parse(input: &[u8]) -> ParseResult<Self> {
        le_u64(input)
    }
}

macro_rules! mib_fields {
    ($($meta:ident => $field:ident: $ty:ty,)*) => {
        /// Identifies a `MemInfoBlock` field in a serialised schema, the discriminant is the id
        /// written to disk.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Meta {
            $($meta,)*
        }

        impl Meta {
            pub const ALL: &'static [Meta] = &[$(Meta::$meta,)*];
        }

        /// Allocation statistics gathered for one allocation context.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct MemInfoBlock {
            $(pub $field: $ty,)*
        }

        impl MemInfoBlock {
            pub fn get(&self, meta: Meta) -> u64 {
                match meta {
                    $(Meta::$meta => self.$field as u64,)*
                }
            }

            fn write_field(&self, meta: Meta, out: &mut Vec<u8>) {
                match meta {
                    $(Meta::$meta => out.extend_from_slice(&self.$field.to_le_bytes()),)*
                }
            }

            fn parse_field<'a>(&mut self, meta: Meta, input: &'a [u8]) -> ParseResult<'a, ()> {
                match meta {
                    $(Meta::$meta => {
                        let (bytes, value) = <$ty as MibValue>::parse(input)?;
                        self.$field = value;
                        Ok((bytes, ()))
                    })*
                }
            }
        }
    };
}

mib_fields! {
    AllocCount => alloc_count: u32,
    TotalAccessCount => total_access_count: u64,
    MinAccessCount => min_access_count: u64,
    MaxAccessCount => max_access_count: u64,
    TotalSize => total_size: u64,
    MinSize => min_size: u32,
    MaxSize => max_size: u32,
    AllocTimestamp => alloc_timestamp: u32,
    DeallocTimestamp => dealloc_timestamp: u32,
    TotalLifetime => total_lifetime: u64,
    MinLifetime => min_lifetime: u32,
    MaxLifetime => max_lifetime: u32,
    AllocCpuId => alloc_cpu_id: u32,
    DeallocCpuId => dealloc_cpu_id: u32,
    NumMigratedCpu => num_migrated_cpu: u32,
    NumLifetimeOverlaps => num_lifetime_overlaps: u32,
    NumSameAllocCpu => num_same_alloc_cpu: u32,
    NumSameDeallocCpu => num_same_dealloc_cpu: u32,
    DataTypeId => data_type_id: u64,
    TotalAccessDensity => total_access_density: u32,
    MinAccessDensity => min_access_density: u32,
    MaxAccessDensity => max_access_density: u32,
    TotalLifetimeAccessDensity => total_lifetime_access_density: u32,
    MinLifetimeAccessDensity => min_lifetime_access_density: u32,
    MaxLifetimeAccessDensity => max_lifetime_access_density: u32,
}

impl TryFrom<u64> for Meta {
    type Error = InstrProfError;

    fn try_from(id: u64) -> Result<Self, Self::Error> {
        usize::try_from(id)
            .ok()
            .and_then(|id| Meta::ALL.get(id))
            .copied()
            .ok_or(InstrProfError::Malformed)
    }
}

impl MemInfoBlock {
    /// Writes the fields named in `schema`, the rest are dropped.
    pub(crate) fn write(&self, schema: &[Meta], out: &mut Vec<u8>) {
        for meta in schema {
            self.write_field(*meta, out);
        }
    }

    /// Reads the fields named in `schema`, the rest are left at zero.
    pub(crate) fn parse<'a>(input: &'a [u8], schema: &[Meta]) -> ParseResult<'a, Self> {
        let mut mib = Self::default();
        let mut bytes = input;
        for meta in schema {
            let (rest, ()) = mib.parse_field(*meta, bytes)?;
            bytes = rest;
        }
        Ok((bytes, mib))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    /// Hash of the function's name
    pub function: GlobalValueId,
    pub line_offset: u32,
    pub column: u32,
    pub is_inline_frame: bool,
}

impl Frame {
    pub const fn new(
        function: GlobalValueId,
        line_offset: u32,
        column: u32,
        is_inline_frame: bool,
    ) -> Self {
        Self {
            function,
            line_offset,
            column,
            is_inline_frame,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_u64(out, self.function);
        out.extend_from_slice(&self.line_offset.to_le_bytes());
        out.extend_from_slice(&self.column.to_le_bytes());
        out.push(self.is_inline_frame as u8);
    }

    fn parse(input: &[u8]) -> ParseResult<Self> {
        let (bytes, function) = le_u64(input)?;
        let (bytes, line_offset) = le_u32(bytes)?;
        let (bytes, column) = le_u32(bytes)?;
        let (bytes, is_inline_frame) = le_u8(bytes)?;
        let frame = Self {
            function,
            line_offset,
            column,
            is_inline_frame: is_inline_frame != 0,
        };
        Ok((bytes, frame))
    }

    /// Content derived id, equal frames get equal ids.
    pub fn id(&self) -> FrameId {
        let mut buffer = Vec::with_capacity(17);
        self.write(&mut buffer);
        compute_hash(buffer)
    }
}

/// Identity of a call stack, derived from its frame ids.
pub fn hash_call_stack(frames: &[FrameId]) -> CallStackId {
    let bytes = frames
        .iter()
        .flat_map(|x| x.to_le_bytes())
        .collect::<Vec<u8>>();
    compute_hash(bytes)
}

/// How a site refers to its call stack, the outermost frame last.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallStackRef {
    Inline(Vec<FrameId>),
    Id(CallStackId),
}

impl CallStackRef {
    pub fn id(&self) -> CallStackId {
        match self {
            Self::Inline(frames) => hash_call_stack(frames),
            Self::Id(id) => *id,
        }
    }
}

fn too_long(input: &[u8]) -> nom::Err<VerboseError<&[u8]>> {
    nom::Err::Failure(VerboseError::from_error_kind(input, ErrorKind::Count))
}

fn parse_call_stack_ref(input: &[u8], version: MemProfVersion) -> ParseResult<CallStackRef> {
    match version {
        MemProfVersion::V2 => {
            let (bytes, id) = le_u64(input)?;
            Ok((bytes, CallStackRef::Id(id)))
        }
        MemProfVersion::V0 | MemProfVersion::V1 => {
            let (bytes, frames) = parse_u64_array(input)?;
            Ok((bytes, CallStackRef::Inline(frames)))
        }
    }
}

fn write_call_stack_ref(
    stack: &CallStackRef,
    version: MemProfVersion,
    call_stacks: &mut IndexMap<CallStackId, Vec<FrameId>>,
    out: &mut Vec<u8>,
) -> Result<(), InstrProfError> {
    match (version, stack) {
        (MemProfVersion::V2, CallStackRef::Id(id)) => write_u64(out, *id),
        (MemProfVersion::V2, CallStackRef::Inline(frames)) => {
            let id = hash_call_stack(frames);
            call_stacks.entry(id).or_insert_with(|| frames.clone());
            write_u64(out, id);
        }
        (_, CallStackRef::Inline(frames)) => write_u64_array(out, frames),
        (_, CallStackRef::Id(id)) => {
            let frames = call_stacks.get(id).ok_or(InstrProfError::Malformed)?;
            write_u64_array(out, frames);
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IndexedAllocationInfo {
    pub call_stack: CallStackRef,
    pub info: MemInfoBlock,
}

impl Default for CallStackRef {
    fn default() -> Self {
        Self::Inline(vec![])
    }
}

/// A memprof record in the form it's stored in, call stacks are referenced rather than resolved.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IndexedMemProfRecord {
    pub alloc_sites: Vec<IndexedAllocationInfo>,
    pub call_sites: Vec<CallStackRef>,
}

impl IndexedMemProfRecord {
    pub fn merge(&mut self, other: IndexedMemProfRecord) {
        self.alloc_sites.extend(other.alloc_sites);
        self.call_sites.extend(other.call_sites);
    }

    /// Splits a resolved record back into frame references, handing every frame to `add_frame`.
    pub fn from_memprof_record(
        record: &MemProfRecord,
        mut add_frame: impl FnMut(FrameId, Frame),
    ) -> Self {
        let mut to_ref = |frames: &[Frame]| {
            let ids = frames
                .iter()
                .map(|frame| {
                    let id = frame.id();
                    add_frame(id, *frame);
                    id
                })
                .collect();
            CallStackRef::Inline(ids)
        };
        let alloc_sites = record
            .alloc_sites
            .iter()
            .map(|site| IndexedAllocationInfo {
                call_stack: to_ref(&site.call_stack),
                info: site.info,
            })
            .collect();
        let call_sites = record.call_sites.iter().map(|x| to_ref(x)).collect();
        Self {
            alloc_sites,
            call_sites,
        }
    }

    fn write(
        &self,
        version: MemProfVersion,
        call_stacks: &mut IndexMap<CallStackId, Vec<FrameId>>,
        out: &mut Vec<u8>,
    ) -> Result<(), InstrProfError> {
        write_u64(out, self.alloc_sites.len() as u64);
        for site in &self.alloc_sites {
            write_call_stack_ref(&site.call_stack, version, call_stacks, out)?;
            site.info.write(version.schema(), out);
        }
        write_u64(out, self.call_sites.len() as u64);
        for site in &self.call_sites {
            write_call_stack_ref(site, version, call_stacks, out)?;
        }
        Ok(())
    }

    fn parse<'a>(
        input: &'a [u8],
        version: MemProfVersion,
        schema: &[Meta],
    ) -> ParseResult<'a, Self> {
        let (mut bytes, num_alloc_sites) = le_u64(input)?;
        if num_alloc_sites > (bytes.len() / 8) as u64 {
            return Err(too_long(input));
        }
        let mut alloc_sites = Vec::with_capacity(num_alloc_sites as usize);
        for _ in 0..num_alloc_sites {
            let (rest, call_stack) = parse_call_stack_ref(bytes, version)?;
            let (rest, info) = MemInfoBlock::parse(rest, schema)?;
            alloc_sites.push(IndexedAllocationInfo { call_stack, info });
            bytes = rest;
        }
        let (mut bytes, num_call_sites) = le_u64(bytes)?;
        if num_call_sites > (bytes.len() / 8) as u64 {
            return Err(too_long(input));
        }
        let mut call_sites = Vec::with_capacity(num_call_sites as usize);
        for _ in 0..num_call_sites {
            let (rest, site) = parse_call_stack_ref(bytes, version)?;
            call_sites.push(site);
            bytes = rest;
        }
        let record = Self {
            alloc_sites,
            call_sites,
        };
        Ok((bytes, record))
    }

    /// Resolves every call stack reference into frames. The first reference that can't be
    /// resolved fails the whole record.
    pub fn to_memprof_record<F, C>(
        &self,
        mut frame_for: F,
        mut call_stack_for: C,
    ) -> Result<MemProfRecord, InstrProfError>
    where
        F: FnMut(FrameId) -> Result<Frame, InstrProfError>,
        C: FnMut(CallStackId) -> Result<Vec<FrameId>, InstrProfError>,
    {
        let mut resolve = |stack: &CallStackRef| -> Result<Vec<Frame>, InstrProfError> {
            let ids = match stack {
                CallStackRef::Inline(ids) => ids.clone(),
                CallStackRef::Id(id) => call_stack_for(*id)?,
            };
            ids.into_iter().map(|id| frame_for(id)).collect()
        };
        let mut alloc_sites = Vec::with_capacity(self.alloc_sites.len());
        for site in &self.alloc_sites {
            alloc_sites.push(AllocationInfo {
                call_stack: resolve(&site.call_stack)?,
                info: site.info,
            });
        }
        let call_sites = self
            .call_sites
            .iter()
            .map(|x| resolve(x))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MemProfRecord {
            alloc_sites,
            call_sites,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AllocationInfo {
    pub call_stack: Vec<Frame>,
    pub info: MemInfoBlock,
}

/// A memprof record with every call stack resolved to frames, the same whatever version it was
/// read from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct MemProfRecord {
    pub alloc_sites: Vec<AllocationInfo>,
    pub call_sites: Vec<Vec<Frame>>,
}

/// Memprof contents of a writer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemProfData {
    pub records: IndexMap<GlobalValueId, IndexedMemProfRecord>,
    pub frames: IndexMap<FrameId, Frame>,
    pub call_stacks: IndexMap<CallStackId, Vec<FrameId>>,
}

impl MemProfData {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.frames.is_empty() && self.call_stacks.is_empty()
    }

    /// Returns false if `id` already names a different frame, the existing frame is kept.
    pub fn add_frame(
        &mut self,
        id: FrameId,
        frame: Frame,
        warn: &mut dyn FnMut(InstrProfError),
    ) -> bool {
        match self.frames.entry(id) {
            Entry::Occupied(e) if *e.get() != frame => {
                warn!("Frame id {:#x} redefined: {:?} vs {:?}", id, e.get(), frame);
                warn(InstrProfError::Malformed);
                false
            }
            Entry::Occupied(_) => true,
            Entry::Vacant(e) => {
                e.insert(frame);
                true
            }
        }
    }

    /// Returns false if `id` already names a different call stack, the existing one is kept.
    pub fn add_call_stack(
        &mut self,
        id: CallStackId,
        frames: Vec<FrameId>,
        warn: &mut dyn FnMut(InstrProfError),
    ) -> bool {
        match self.call_stacks.entry(id) {
            Entry::Occupied(e) if *e.get() != frames => {
                warn!("Call stack id {:#x} redefined", id);
                warn(InstrProfError::Malformed);
                false
            }
            Entry::Occupied(_) => true,
            Entry::Vacant(e) => {
                e.insert(frames);
                true
            }
        }
    }

    /// Records for the same id have their sites appended.
    pub fn add_record(&mut self, id: GlobalValueId, record: IndexedMemProfRecord) {
        match self.records.entry(id) {
            Entry::Occupied(mut e) => e.get_mut().merge(record),
            Entry::Vacant(e) => {
                e.insert(record);
            }
        }
    }

    pub fn merge(&mut self, other: MemProfData, warn: &mut dyn FnMut(InstrProfError)) {
        for (id, frame) in other.frames {
            self.add_frame(id, frame, warn);
        }
        for (id, frames) in other.call_stacks {
            self.add_call_stack(id, frames, warn);
        }
        for (id, record) in other.records {
            self.add_record(id, record);
        }
    }
}

/// Writes the memprof section.
///
/// ```text
/// u64 version
/// u64 schema_len
/// u64 meta_ids[schema_len]
/// u64 record_table_offset
/// u64 frame_table_offset
/// u64 call_stack_table_offset    (V2 only)
/// tables, each aligned to 8 bytes
/// ```
///
/// Offsets are from the start of the section.
pub(crate) fn write_section(
    out: &mut Vec<u8>,
    version: MemProfVersion,
    data: &MemProfData,
) -> Result<(), InstrProfError> {
    let start = out.len();
    let schema = version.schema();
    write_u64(out, version as u64);
    write_u64(out, schema.len() as u64);
    for meta in schema {
        write_u64(out, *meta as u64);
    }
    let num_tables = if version == MemProfVersion::V2 { 3 } else { 2 };
    let offsets_start = out.len();
    out.resize(offsets_start + 8 * num_tables, 0);

    let mut call_stacks = data.call_stacks.clone();
    let mut records = HashTableGenerator::new();
    for (id, record) in &data.records {
        let mut buffer = vec![];
        record.write(version, &mut call_stacks, &mut buffer)?;
        records.insert(*id, id.to_le_bytes().to_vec(), buffer);
    }
    let mut frames = HashTableGenerator::new();
    for (id, frame) in &data.frames {
        let mut buffer = Vec::with_capacity(17);
        frame.write(&mut buffer);
        frames.insert(*id, id.to_le_bytes().to_vec(), buffer);
    }

    let mut table_offsets = Vec::with_capacity(num_tables);
    pad_to_alignment(out);
    table_offsets.push(out.len() - start);
    records.emit(out);
    pad_to_alignment(out);
    table_offsets.push(out.len() - start);
    frames.emit(out);
    if version == MemProfVersion::V2 {
        let mut stacks = HashTableGenerator::new();
        for (id, frames) in &call_stacks {
            let mut buffer = vec![];
            write_u64_array(&mut buffer, frames);
            stacks.insert(*id, id.to_le_bytes().to_vec(), buffer);
        }
        pad_to_alignment(out);
        table_offsets.push(out.len() - start);
        stacks.emit(out);
    }
    for (i, offset) in table_offsets.iter().enumerate() {
        let slot = offsets_start + i * 8;
        out[slot..slot + 8].copy_from_slice(&(*offset as u64).to_le_bytes());
    }
    debug!(
        "Wrote memprof {:?} section: {} records, {} frames, {} call stacks",
        version,
        records.len(),
        frames.len(),
        call_stacks.len()
    );
    Ok(())
}

fn parse_section_header(input: &[u8]) -> ParseResult<(u64, Vec<u64>)> {
    let (bytes, version) = le_u64(input)?;
    let (bytes, schema) = parse_u64_array(bytes)?;
    Ok((bytes, (version, schema)))
}

fn parse_offsets(input: &[u8], num_tables: usize) -> ParseResult<Vec<u64>> {
    count(le_u64, num_tables)(input)
}

/// Where the tables of a memprof section are. Records are only decoded when asked for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MemProfIndex {
    version: MemProfVersion,
    schema: Vec<Meta>,
    record_table: u64,
    frame_table: u64,
    call_stack_table: Option<u64>,
}

impl MemProfIndex {
    /// `offset` is where the section starts in `data`.
    pub(crate) fn parse(data: &[u8], offset: u64) -> Result<Self, InstrProfError> {
        let section = slice_from(data, offset)?;
        let (bytes, (version, schema)) = parse_section_header(section)?;
        let version = MemProfVersion::try_from(version)?;
        let schema = schema
            .into_iter()
            .map(Meta::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let num_tables = if version == MemProfVersion::V2 { 3 } else { 2 };
        let (_, offsets) = parse_offsets(bytes, num_tables)?;
        let mut tables = Vec::with_capacity(num_tables);
        for table_offset in offsets {
            let absolute = offset
                .checked_add(table_offset)
                .ok_or(InstrProfError::Malformed)?;
            HashTable::parse(slice_from(data, absolute)?)?;
            tables.push(absolute);
        }
        debug!("Memprof {:?} section, tables at {:?}", version, tables);
        Ok(Self {
            version,
            schema,
            record_table: tables[0],
            frame_table: tables[1],
            call_stack_table: tables.get(2).copied(),
        })
    }

    pub(crate) fn version(&self) -> MemProfVersion {
        self.version
    }

    fn table(data: &[u8], offset: u64) -> Result<HashTable<'_>, InstrProfError> {
        HashTable::parse(slice_from(data, offset)?)
    }

    pub(crate) fn get_record(
        &self,
        data: &[u8],
        id: GlobalValueId,
    ) -> Result<MemProfRecord, InstrProfError> {
        let records = Self::table(data, self.record_table)?;
        let bytes = records
            .find(id, &id.to_le_bytes())?
            .ok_or(InstrProfError::UnknownFunction)?;
        let (_, record) = IndexedMemProfRecord::parse(bytes, self.version, &self.schema)?;
        let frames = Self::table(data, self.frame_table)?;
        let call_stacks = self
            .call_stack_table
            .map(|x| Self::table(data, x))
            .transpose()?;
        record.to_memprof_record(
            |frame_id| {
                let bytes = frames
                    .find(frame_id, &frame_id.to_le_bytes())?
                    .ok_or(InstrProfError::HashMismatch)?;
                let (_, frame) = Frame::parse(bytes)?;
                Ok(frame)
            },
            |stack_id| {
                let bytes = call_stacks
                    .ok_or(InstrProfError::HashMismatch)?
                    .find(stack_id, &stack_id.to_le_bytes())?
                    .ok_or(InstrProfError::HashMismatch)?;
                let (_, frames) = parse_u64_array(bytes)?;
                Ok(frames)
            },
        )
    }

    pub(crate) fn record_ids(&self, data: &[u8]) -> Result<Vec<GlobalValueId>, InstrProfError> {
        Self::table(data, self.record_table)?
            .iter()
            .map(|item| {
                let item = item?;
                item.key
                    .try_into()
                    .map(u64::from_le_bytes)
                    .map_err(|_| InstrProfError::Malformed)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frames() -> Vec<(FrameId, Frame)> {
        vec![
            (0, Frame::new(0x123, 1, 2, false)),
            (1, Frame::new(0x345, 3, 4, true)),
            (2, Frame::new(0x125, 5, 6, false)),
            (3, Frame::new(0x567, 7, 8, true)),
            (4, Frame::new(0x124, 5, 6, false)),
            (5, Frame::new(0x789, 8, 9, true)),
        ]
    }

    fn full_mib() -> MemInfoBlock {
        MemInfoBlock {
            alloc_count: 1,
            total_access_count: 2,
            total_size: 3,
            max_lifetime: 4,
            data_type_id: 5,
            total_access_density: 6,
            max_lifetime_access_density: 7,
            ..Default::default()
        }
    }

    fn data(inline: bool) -> MemProfData {
        let mut data = MemProfData::default();
        let mut warn = |e: InstrProfError| panic!("unexpected {:?}", e);
        for (id, frame) in frames() {
            assert!(data.add_frame(id, frame, &mut warn));
        }
        let stacks = [vec![0, 1], vec![2, 3], vec![4, 5]];
        let refs = stacks
            .iter()
            .map(|x| {
                if inline {
                    CallStackRef::Inline(x.clone())
                } else {
                    let id = hash_call_stack(x);
                    assert!(data.add_call_stack(id, x.clone(), &mut warn));
                    CallStackRef::Id(id)
                }
            })
            .collect::<Vec<_>>();
        let record = IndexedMemProfRecord {
            alloc_sites: vec![
                IndexedAllocationInfo {
                    call_stack: refs[0].clone(),
                    info: full_mib(),
                },
                IndexedAllocationInfo {
                    call_stack: refs[1].clone(),
                    info: full_mib(),
                },
            ],
            call_sites: vec![refs[1].clone(), refs[2].clone()],
        };
        data.add_record(0x9999, record);
        data
    }

    fn write(version: MemProfVersion, data: &MemProfData) -> Vec<u8> {
        let mut out = vec![0; 8];
        write_section(&mut out, version, data).unwrap();
        out
    }

    fn expected(mib: MemInfoBlock) -> MemProfRecord {
        let frames = frames().into_iter().map(|x| x.1).collect::<Vec<_>>();
        MemProfRecord {
            alloc_sites: vec![
                AllocationInfo {
                    call_stack: frames[0..2].to_vec(),
                    info: mib,
                },
                AllocationInfo {
                    call_stack: frames[2..4].to_vec(),
                    info: mib,
                },
            ],
            call_sites: vec![frames[2..4].to_vec(), frames[4..6].to_vec()],
        }
    }

    #[test]
    fn schema_versions() {
        assert_eq!(MemProfVersion::V0.schema().len(), BASE_FIELDS);
        assert_eq!(MemProfVersion::V1.schema().len(), Meta::ALL.len());
        assert_eq!(Meta::try_from(0).unwrap(), Meta::AllocCount);
        assert_eq!(
            Meta::try_from(Meta::ALL.len() as u64),
            Err(InstrProfError::Malformed)
        );

        let mut out = vec![];
        full_mib().write(MemProfVersion::V0.schema(), &mut out);
        let (rest, parsed) = MemInfoBlock::parse(&out, MemProfVersion::V0.schema()).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.get(Meta::DataTypeId), 5);
        assert_eq!(parsed.total_access_density, 0);
    }

    #[test]
    fn frame_ids() {
        let a = Frame::new(0x123, 1, 2, false);
        assert_eq!(a.id(), Frame::new(0x123, 1, 2, false).id());
        assert_ne!(a.id(), Frame::new(0x123, 1, 2, true).id());
        assert_ne!(hash_call_stack(&[1, 2]), hash_call_stack(&[2, 1]));
        assert_eq!(CallStackRef::Inline(vec![1, 2]).id(), hash_call_stack(&[1, 2]));
    }

    #[test]
    fn read_every_version() {
        let v1_mib = full_mib();
        let v0_mib = MemInfoBlock {
            total_access_density: 0,
            max_lifetime_access_density: 0,
            ..v1_mib
        };
        for (version, inline, mib) in [
            (MemProfVersion::V0, true, v0_mib),
            (MemProfVersion::V0, false, v0_mib),
            (MemProfVersion::V1, true, v1_mib),
            (MemProfVersion::V2, true, v1_mib),
            (MemProfVersion::V2, false, v1_mib),
        ] {
            let out = write(version, &data(inline));
            let index = MemProfIndex::parse(&out, 8).unwrap();
            assert_eq!(index.version(), version);
            assert_eq!(index.record_ids(&out).unwrap(), vec![0x9999]);
            let record = index.get_record(&out, 0x9999).unwrap();
            assert_eq!(record, expected(mib));
            assert_eq!(
                index.get_record(&out, 0x1111),
                Err(InstrProfError::UnknownFunction)
            );
        }
    }

    #[test]
    fn missing_frames_and_call_stacks() {
        let mut broken = data(false);
        broken.frames.swap_remove(&3);
        let out = write(MemProfVersion::V2, &broken);
        let index = MemProfIndex::parse(&out, 8).unwrap();
        assert_eq!(
            index.get_record(&out, 0x9999),
            Err(InstrProfError::HashMismatch)
        );

        let mut broken = data(false);
        broken.call_stacks.swap_remove(&hash_call_stack(&[4, 5]));
        let out = write(MemProfVersion::V2, &broken);
        let index = MemProfIndex::parse(&out, 8).unwrap();
        assert_eq!(
            index.get_record(&out, 0x9999),
            Err(InstrProfError::HashMismatch)
        );

        // Legacy versions need the frames of every referenced call stack
        let mut out = vec![];
        assert_eq!(
            write_section(&mut out, MemProfVersion::V1, &broken),
            Err(InstrProfError::Malformed)
        );
    }

    #[test]
    fn unknown_version() {
        let mut out = write(MemProfVersion::V2, &data(true));
        out[8] = 3;
        assert_eq!(
            MemProfIndex::parse(&out, 8),
            Err(InstrProfError::UnsupportedVersion)
        );
        assert_eq!(
            MemProfIndex::parse(&out, out.len() as u64 + 1),
            Err(InstrProfError::Malformed)
        );
    }

    #[test]
    fn redefinitions() {
        let mut data = data(false);
        let mut errors = vec![];
        assert!(data.add_frame(0, Frame::new(0x123, 1, 2, false), &mut |e| errors.push(e)));
        assert!(!data.add_frame(0, Frame::new(0x999, 1, 2, false), &mut |e| errors.push(e)));
        assert!(!data.add_call_stack(hash_call_stack(&[0, 1]), vec![1], &mut |e| errors
            .push(e)));
        assert_eq!(errors, vec![InstrProfError::Malformed; 2]);
        assert_eq!(data.frames[&0], Frame::new(0x123, 1, 2, false));
    }

    #[test]
    fn merge_appends_sites() {
        let mut a = data(true);
        let b = data(true);
        a.merge(b, &mut |e| panic!("unexpected {:?}", e));
        let record = &a.records[&0x9999];
        assert_eq!(record.alloc_sites.len(), 4);
        assert_eq!(record.call_sites.len(), 4);
        assert_eq!(a.frames.len(), 6);
    }

    #[test]
    fn resolved_records_round_trip() {
        let resolved = expected(full_mib());
        let mut frames = IndexMap::new();
        let indexed =
            IndexedMemProfRecord::from_memprof_record(&resolved, |id, frame| {
                frames.insert(id, frame);
            });
        let back = indexed
            .to_memprof_record(
                |id| frames.get(&id).copied().ok_or(InstrProfError::HashMismatch),
                |_| Err(InstrProfError::HashMismatch),
            )
            .unwrap();
        assert_eq!(back, resolved);
        assert_eq!(frames.len(), 6);
    }
}
