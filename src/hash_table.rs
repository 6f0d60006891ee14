use crate::instrumentation_profile::error::InstrProfError;
use crate::instrumentation_profile::ParseResult;
use crate::util::{slice_from, write_u64};
use nom::bytes::complete::take;
use nom::multi::count;
use nom::number::complete::{le_u16, le_u64};
use std::convert::TryInto;

/// Builds an on disk chained hash table. Keys and data are opaque bytes, the caller supplies the
/// hash of each key.
///
/// ```text
/// u64 num_buckets                    (power of two)
/// u64 num_entries
/// u64 bucket_offsets[num_buckets]    (from the table start, 0 for an empty bucket)
/// buckets:
///     u16 num_items
///     (u64 hash, u64 key_len, u64 data_len, key, data)[num_items]
/// ```
#[derive(Clone, Debug, Default)]
pub(crate) struct HashTableGenerator {
    entries: Vec<Entry>,
}

#[derive(Clone, Debug)]
struct Entry {
    hash: u64,
    key: Vec<u8>,
    data: Vec<u8>,
}

impl HashTableGenerator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, hash: u64, key: Vec<u8>, data: Vec<u8>) {
        self.entries.push(Entry { hash, key, data });
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Keeps the load factor under 3/4
    fn num_buckets(&self) -> u64 {
        let mut buckets = 64u64;
        while self.entries.len() as u64 * 4 >= buckets * 3 {
            buckets *= 2;
        }
        buckets
    }

    /// Appends the table to `out`, offsets are relative to where the table starts.
    pub(crate) fn emit(&self, out: &mut Vec<u8>) {
        let start = out.len();
        let num_buckets = self.num_buckets();
        let mut buckets = vec![vec![]; num_buckets as usize];
        for entry in &self.entries {
            buckets[(entry.hash & (num_buckets - 1)) as usize].push(entry);
        }
        write_u64(out, num_buckets);
        write_u64(out, self.entries.len() as u64);
        let offsets_start = out.len();
        out.resize(offsets_start + 8 * num_buckets as usize, 0);
        for (i, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let offset = ((out.len() - start) as u64).to_le_bytes();
            let slot = offsets_start + i * 8;
            out[slot..slot + 8].copy_from_slice(&offset);
            out.extend_from_slice(&(bucket.len() as u16).to_le_bytes());
            for entry in bucket {
                write_u64(out, entry.hash);
                write_u64(out, entry.key.len() as u64);
                write_u64(out, entry.data.len() as u64);
                out.extend_from_slice(&entry.key);
                out.extend_from_slice(&entry.data);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableItem<'a> {
    pub(crate) hash: u64,
    pub(crate) key: &'a [u8],
    pub(crate) data: &'a [u8],
}

fn parse_item(input: &[u8]) -> ParseResult<TableItem<'_>> {
    let (bytes, hash) = le_u64(input)?;
    let (bytes, key_len) = le_u64(bytes)?;
    let (bytes, data_len) = le_u64(bytes)?;
    let (bytes, key) = take(key_len as usize)(bytes)?;
    let (bytes, data) = take(data_len as usize)(bytes)?;
    Ok((bytes, TableItem { hash, key, data }))
}

fn parse_bucket(input: &[u8]) -> ParseResult<Vec<TableItem<'_>>> {
    let (bytes, num_items) = le_u16(input)?;
    count(parse_item, num_items as usize)(bytes)
}

fn parse_table_header(input: &[u8]) -> ParseResult<(u64, u64)> {
    let (bytes, num_buckets) = le_u64(input)?;
    let (bytes, num_entries) = le_u64(bytes)?;
    Ok((bytes, (num_buckets, num_entries)))
}

/// Read only view of a table written by `HashTableGenerator`. Buckets are only decoded when
/// they're looked at.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HashTable<'a> {
    table: &'a [u8],
    num_buckets: u64,
    num_entries: u64,
}

impl<'a> HashTable<'a> {
    /// `table` starts at the table and may run on past its end.
    pub(crate) fn parse(table: &'a [u8]) -> Result<Self, InstrProfError> {
        let (rest, (num_buckets, num_entries)) = parse_table_header(table)?;
        if !num_buckets.is_power_of_two() || num_buckets > (rest.len() / 8) as u64 {
            return Err(InstrProfError::Malformed);
        }
        Ok(Self {
            table,
            num_buckets,
            num_entries,
        })
    }

    pub(crate) fn num_entries(&self) -> u64 {
        self.num_entries
    }

    fn bucket_items(&self, index: u64) -> Result<Vec<TableItem<'a>>, InstrProfError> {
        let slot = 16 + index as usize * 8;
        let offset = self
            .table
            .get(slot..slot + 8)
            .and_then(|x| x.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or(InstrProfError::Malformed)?;
        if offset == 0 {
            return Ok(vec![]);
        }
        let (_, items) = parse_bucket(slice_from(self.table, offset)?)?;
        Ok(items)
    }

    pub(crate) fn find(&self, hash: u64, key: &[u8]) -> Result<Option<&'a [u8]>, InstrProfError> {
        let items = self.bucket_items(hash & (self.num_buckets - 1))?;
        Ok(items
            .into_iter()
            .find(|x| x.hash == hash && x.key == key)
            .map(|x| x.data))
    }

    /// Visits every entry in bucket order. Iteration stops after the first corrupt bucket.
    pub(crate) fn iter(&self) -> HashTableIter<'a> {
        HashTableIter {
            table: *self,
            bucket: 0,
            pending: vec![].into_iter(),
            failed: false,
        }
    }
}

pub(crate) struct HashTableIter<'a> {
    table: HashTable<'a>,
    bucket: u64,
    pending: std::vec::IntoIter<TableItem<'a>>,
    failed: bool,
}

impl<'a> Iterator for HashTableIter<'a> {
    type Item = Result<TableItem<'a>, InstrProfError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(Ok(item));
            }
            if self.failed || self.bucket >= self.table.num_buckets {
                return None;
            }
            let index = self.bucket;
            self.bucket += 1;
            match self.table.bucket_items(index) {
                Ok(items) => self.pending = items.into_iter(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
