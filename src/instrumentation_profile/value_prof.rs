use crate::instrumentation_profile::types::*;
use crate::instrumentation_profile::{get_num_padding_bytes, ParseResult};
use nom::bytes::complete::take;
use nom::error::{ErrorKind, ParseError, VerboseError};
use nom::number::complete::{u32 as nom_u32, u64 as nom_u64};
use nom::number::Endianness;
use std::convert::TryFrom;

/// `total_size` and `num_value_kinds`
const HEADER_SIZE: usize = 8;

/// On disk form of the value profile data of one record.
///
/// ```text
/// u32 total_size
/// u32 num_value_kinds
/// for each kind with sites:
///     u32 kind
///     u32 num_value_sites
///     u8  site_count[num_value_sites]
///     padding to 8 bytes
///     (u64 value, u64 count)[sum(site_count)]
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValueProfData {
    records: Vec<ValueProfRecord>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueProfRecord {
    kind: ValueKind,
    site_counts: Vec<u8>,
    values: Vec<InstrProfValueData>,
}

impl ValueProfRecord {
    fn header_size(&self) -> usize {
        8 + self.site_counts.len()
    }

    fn size(&self) -> usize {
        let header = self.header_size();
        header + get_num_padding_bytes(header as u64) as usize + 16 * self.values.len()
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn num_value_sites(&self) -> usize {
        self.site_counts.len()
    }
}

fn malformed(input: &[u8]) -> nom::Err<VerboseError<&[u8]>> {
    nom::Err::Failure(VerboseError::from_error_kind(input, ErrorKind::Verify))
}

fn write_u32(out: &mut Vec<u8>, value: u32, endianness: Endianness) {
    let bytes = match endianness {
        Endianness::Big => value.to_be_bytes(),
        Endianness::Little => value.to_le_bytes(),
        Endianness::Native => value.to_ne_bytes(),
    };
    out.extend_from_slice(&bytes);
}

fn write_u64(out: &mut Vec<u8>, value: u64, endianness: Endianness) {
    let bytes = match endianness {
        Endianness::Big => value.to_be_bytes(),
        Endianness::Little => value.to_le_bytes(),
        Endianness::Native => value.to_ne_bytes(),
    };
    out.extend_from_slice(&bytes);
}

fn parse_record(input: &[u8], endianness: Endianness) -> ParseResult<ValueProfRecord> {
    let (bytes, kind) = nom_u32(endianness)(input)?;
    let kind = ValueKind::try_from(kind).map_err(|_| malformed(input))?;
    let (bytes, num_value_sites) = nom_u32(endianness)(bytes)?;
    let (bytes, site_counts) = take(num_value_sites as usize)(bytes)?;
    let padding = get_num_padding_bytes(8 + num_value_sites as u64) as usize;
    let (mut bytes, _) = take(padding)(bytes)?;

    let num_values = site_counts.iter().map(|x| *x as usize).sum::<usize>();
    if num_values * 16 > bytes.len() {
        return Err(malformed(input));
    }
    let mut values = Vec::with_capacity(num_values);
    for _ in 0..num_values {
        let (rest, value) = nom_u64(endianness)(bytes)?;
        let (rest, count) = nom_u64(endianness)(rest)?;
        values.push(InstrProfValueData { value, count });
        bytes = rest;
    }
    let record = ValueProfRecord {
        kind,
        site_counts: site_counts.to_vec(),
        values,
    };
    Ok((bytes, record))
}

impl ValueProfData {
    pub fn serialize_from(record: &InstrProfRecord) -> Self {
        let mut records = vec![];
        if let Some(data) = record.data.as_ref() {
            for kind in ValueKind::iter() {
                let sites = data.sites(kind);
                if sites.is_empty() {
                    continue;
                }
                let mut site_counts = Vec::with_capacity(sites.len());
                let mut values = vec![];
                for site in sites {
                    let len = site.len().min(MAX_NUM_VALUE_PER_SITE);
                    site_counts.push(len as u8);
                    values.extend_from_slice(&site[..len]);
                }
                records.push(ValueProfRecord {
                    kind,
                    site_counts,
                    values,
                });
            }
        }
        Self { records }
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.records.iter().map(|x| x.size()).sum::<usize>()
    }

    pub fn num_value_kinds(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[ValueProfRecord] {
        &self.records
    }

    pub fn write(&self, endianness: Endianness, out: &mut Vec<u8>) {
        write_u32(out, self.total_size() as u32, endianness);
        write_u32(out, self.records.len() as u32, endianness);
        for record in &self.records {
            write_u32(out, record.kind as u32, endianness);
            write_u32(out, record.site_counts.len() as u32, endianness);
            out.extend_from_slice(&record.site_counts);
            let padding = get_num_padding_bytes(record.header_size() as u64) as usize;
            out.resize(out.len() + padding, 0);
            for value in &record.values {
                write_u64(out, value.value, endianness);
                write_u64(out, value.count, endianness);
            }
        }
    }

    pub fn to_bytes(&self, endianness: Endianness) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        self.write(endianness, &mut out);
        out
    }

    /// Parses the value data of one record, the remaining input starts right after `total_size`
    /// bytes. Unknown or repeated kinds and records overrunning the total size are rejected.
    pub fn parse(input: &[u8], endianness: Endianness) -> ParseResult<Self> {
        let (bytes, total_size) = nom_u32(endianness)(input)?;
        let total_size = total_size as usize;
        if total_size < HEADER_SIZE || total_size > input.len() || total_size % 8 != 0 {
            return Err(malformed(input));
        }
        let (_, num_value_kinds) = nom_u32(endianness)(bytes)?;
        if num_value_kinds as usize > ValueKind::len() {
            return Err(malformed(input));
        }
        let mut bytes = &input[HEADER_SIZE..total_size];
        let mut records: Vec<ValueProfRecord> = Vec::with_capacity(num_value_kinds as usize);
        for _ in 0..num_value_kinds {
            let (rest, record) = parse_record(bytes, endianness)?;
            if records.iter().any(|x| x.kind == record.kind) {
                return Err(malformed(bytes));
            }
            records.push(record);
            bytes = rest;
        }
        Ok((&input[total_size..], Self { records }))
    }

    /// Fills the value sites of `record` with the decoded data. When a mapper is given every
    /// value goes through it, otherwise values are stored raw.
    pub fn deserialize_to(&self, record: &mut InstrProfRecord, mapper: Option<&dyn ValueMapper>) {
        for vp in &self.records {
            record.reserve_sites(vp.kind, vp.site_counts.len());
            let data = match record.data.as_mut() {
                Some(data) => data,
                None => continue,
            };
            let sites = data.sites_mut(vp.kind);
            let mut values = vp.values.as_slice();
            for (site, count) in vp.site_counts.iter().enumerate() {
                let (site_values, rest) = values.split_at(*count as usize);
                sites[site] = site_values
                    .iter()
                    .map(|x| InstrProfValueData {
                        value: mapper
                            .map(|m| m.map_value(vp.kind, x.value))
                            .unwrap_or(x.value),
                        count: x.count,
                    })
                    .collect();
                values = rest;
            }
        }
    }
}
