use crate::instrumentation_profile::error::InstrProfError;
use indexmap::IndexMap;
use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Largest value a counter can hold. The values above it are reserved.
pub const MAX_COUNT_VALUE: u64 = u64::MAX - 2;
/// Largest count a single value profile entry can hold.
pub const MAX_VALUE_COUNT: u64 = u64::MAX;
/// Number of values kept for a value site once it has been merged.
pub const MAX_NUM_VALUE_PER_SITE: usize = 255;
/// This bit is reserved as the flag for the context sensitive profile record
pub const CS_FLAG_IN_FUNC_HASH: u64 = 60;

/// Computes `x * weight + acc`, pinning the result at `ceiling`. The flag is set when the result
/// had to be pinned.
pub fn saturating_multiply_add(x: u64, weight: u64, acc: u64, ceiling: u64) -> (u64, bool) {
    match x.checked_mul(weight).and_then(|x| x.checked_add(acc)) {
        Some(res) if res <= ceiling => (res, false),
        _ => (ceiling, true),
    }
}

/// The name hash used to key functions, the low 64 bits of the md5 digest.
pub fn compute_hash(data: impl AsRef<[u8]>) -> u64 {
    let hash = md5::compute(data).0[..8].try_into().unwrap_or_default();
    u64::from_le_bytes(hash)
}

pub fn has_cs_flag_in_hash(hash: u64) -> bool {
    ((hash >> CS_FLAG_IN_FUNC_HASH) & 1) != 0
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum ValueKind {
    IndirectCallTarget = 0,
    MemOpSize = 1,
    VTableTarget = 2,
}

impl ValueKind {
    const ALL: [ValueKind; 3] = [
        ValueKind::IndirectCallTarget,
        ValueKind::MemOpSize,
        ValueKind::VTableTarget,
    ];

    pub const fn len() -> usize {
        3
    }

    pub fn iter() -> impl Iterator<Item = ValueKind> {
        IntoIterator::into_iter(Self::ALL)
    }
}

impl TryFrom<u32> for ValueKind {
    type Error = u32;

    fn try_from(kind: u32) -> Result<Self, Self::Error> {
        Self::ALL.get(kind as usize).copied().ok_or(kind)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndirectCallTarget => write!(f, "indirect call target"),
            Self::MemOpSize => write!(f, "memory intrinsic size"),
            Self::VTableTarget => write!(f, "vtable target"),
        }
    }
}

/// Rewrites a profiled value before it is stored, e.g. turning a raw address into the hash of the
/// function living there.
pub trait ValueMapper {
    fn map_value(&self, kind: ValueKind, value: u64) -> u64;
}

impl<F> ValueMapper for F
where
    F: Fn(ValueKind, u64) -> u64,
{
    fn map_value(&self, kind: ValueKind, value: u64) -> u64 {
        self(kind, value)
    }
}

/// How to treat two versions of a record whose counter or value site vectors differ in length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MergeMode {
    /// Extend to the longer shape, the missing entries count as zero.
    Lenient,
    /// Report a mismatch and keep the stored record as it is.
    Strict,
}

impl Default for MergeMode {
    fn default() -> Self {
        Self::Lenient
    }
}

/// Bitset describing how a profile was collected.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ProfileKind(u64);

impl ProfileKind {
    pub const UNKNOWN: Self = Self(0);
    pub const FRONTEND_INSTRUMENTATION: Self = Self(1 << 0);
    pub const IR_INSTRUMENTATION: Self = Self(1 << 1);
    pub const FUNCTION_ENTRY_INSTRUMENTATION: Self = Self(1 << 2);
    pub const CONTEXT_SENSITIVE: Self = Self(1 << 3);
    pub const SINGLE_BYTE_COVERAGE: Self = Self(1 << 4);
    pub const FUNCTION_ENTRY_ONLY: Self = Self(1 << 5);
    pub const MEMPROF: Self = Self(1 << 6);
    pub const TEMPORAL_PROFILE: Self = Self(1 << 7);

    pub(crate) const ALL_BITS: u64 = (1 << 8) - 1;

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits & !Self::ALL_BITS == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    pub fn level(self) -> InstrumentationLevel {
        if self.intersects(Self::IR_INSTRUMENTATION) {
            InstrumentationLevel::Ir
        } else {
            InstrumentationLevel::FrontEnd
        }
    }
}

impl BitOr for ProfileKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ProfileKind {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Hash)]
pub enum InstrumentationLevel {
    FrontEnd,
    Ir,
}

impl fmt::Display for InstrumentationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrontEnd => write!(f, "Front-end"),
            Self::Ir => write!(f, "IR"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrProfValueData {
    pub value: u64,
    pub count: u64,
}

impl InstrProfValueData {
    pub const fn new(value: u64, count: u64) -> Self {
        Self { value, count }
    }
}

pub type InstrProfValueSiteRecord = Vec<InstrProfValueData>;

/// Folds `src` scaled by `weight` into `dst`. Entries are grouped by value, then sorted by count
/// with the hottest first and cut down to `MAX_NUM_VALUE_PER_SITE`. Equal counts keep the order
/// the values were first seen in, `dst` before `src`. Returns true if a count saturated.
fn merge_site_records(
    dst: &mut InstrProfValueSiteRecord,
    src: &[InstrProfValueData],
    weight: u64,
) -> bool {
    let mut merged = IndexMap::<u64, u64>::with_capacity(dst.len() + src.len());
    let mut overflowed = false;
    let existing = dst.iter().map(|x| (x, 1));
    for (data, weight) in existing.chain(src.iter().map(|x| (x, weight))) {
        let acc = merged.entry(data.value).or_insert(0);
        let (sum, overflow) = saturating_multiply_add(data.count, weight, *acc, MAX_VALUE_COUNT);
        *acc = sum;
        overflowed |= overflow;
    }
    *dst = merged
        .into_iter()
        .map(|(value, count)| InstrProfValueData { value, count })
        .collect();
    dst.sort_by(|a, b| b.count.cmp(&a.count));
    dst.truncate(MAX_NUM_VALUE_PER_SITE);
    overflowed
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ValueProfDataRecord {
    pub indirect_callsites: Vec<InstrProfValueSiteRecord>,
    pub mem_op_sizes: Vec<InstrProfValueSiteRecord>,
    pub vtable_targets: Vec<InstrProfValueSiteRecord>,
}

impl ValueProfDataRecord {
    pub fn sites(&self, kind: ValueKind) -> &[InstrProfValueSiteRecord] {
        match kind {
            ValueKind::IndirectCallTarget => &self.indirect_callsites,
            ValueKind::MemOpSize => &self.mem_op_sizes,
            ValueKind::VTableTarget => &self.vtable_targets,
        }
    }

    pub fn sites_mut(&mut self, kind: ValueKind) -> &mut Vec<InstrProfValueSiteRecord> {
        match kind {
            ValueKind::IndirectCallTarget => &mut self.indirect_callsites,
            ValueKind::MemOpSize => &mut self.mem_op_sizes,
            ValueKind::VTableTarget => &mut self.vtable_targets,
        }
    }

    pub fn is_empty(&self) -> bool {
        ValueKind::iter().all(|kind| self.sites(kind).is_empty())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct InstrProfRecord {
    pub counts: Vec<u64>,
    pub data: Option<Box<ValueProfDataRecord>>,
}

impl InstrProfRecord {
    pub fn new(counts: Vec<u64>) -> Self {
        Self { counts, data: None }
    }

    pub fn num_value_sites(&self, kind: ValueKind) -> usize {
        self.data
            .as_ref()
            .map(|x| x.sites(kind).len())
            .unwrap_or_default()
    }

    pub fn num_value_data(&self, kind: ValueKind) -> usize {
        self.data
            .as_ref()
            .map(|x| x.sites(kind).iter().map(|site| site.len()).sum())
            .unwrap_or_default()
    }

    pub fn num_value_data_for_site(&self, kind: ValueKind, site: usize) -> usize {
        self.get_value_for_site(kind, site).len()
    }

    pub fn get_value_for_site(&self, kind: ValueKind, site: usize) -> &[InstrProfValueData] {
        self.data
            .as_ref()
            .and_then(|x| x.sites(kind).get(site))
            .map(|x| x.as_slice())
            .unwrap_or_default()
    }

    /// Sum of the counts recorded for a site, saturating at `u64::MAX`.
    pub fn site_total_count(&self, kind: ValueKind, site: usize) -> u64 {
        self.get_value_for_site(kind, site)
            .iter()
            .fold(0u64, |acc, x| acc.saturating_add(x.count))
    }

    /// Makes sure there are at least `num_sites` sites for `kind`.
    pub fn reserve_sites(&mut self, kind: ValueKind, num_sites: usize) {
        let sites = self.data.get_or_insert_with(Default::default).sites_mut(kind);
        if sites.len() < num_sites {
            sites.resize(num_sites, vec![]);
        }
    }

    /// Records `values` for the site at `site`. With a mapper every value is translated first,
    /// without one values are stored as given. Values already present at the site are combined,
    /// returns true if a combined count saturated.
    pub fn add_value_data(
        &mut self,
        kind: ValueKind,
        site: usize,
        values: &[InstrProfValueData],
        mapper: Option<&dyn ValueMapper>,
    ) -> bool {
        self.reserve_sites(kind, site + 1);
        let mapped = values
            .iter()
            .map(|x| InstrProfValueData {
                value: mapper.map(|m| m.map_value(kind, x.value)).unwrap_or(x.value),
                count: x.count,
            })
            .collect::<Vec<_>>();
        match self.data.as_mut() {
            Some(data) => merge_site_records(&mut data.sites_mut(kind)[site], &mapped, 1),
            None => false,
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.counts.iter().all(|x| *x == 0)
    }

    /// Multiplies every count by `weight`. Returns true if any count saturated.
    pub fn scale(&mut self, weight: u64) -> bool {
        let mut overflowed = false;
        for count in self.counts.iter_mut() {
            let (res, overflow) = saturating_multiply_add(*count, weight, 0, MAX_COUNT_VALUE);
            *count = res;
            overflowed |= overflow;
        }
        self.scale_value_sites(weight) || overflowed
    }

    /// Brings every value site into stored form: repeated values combined, ordered by descending
    /// count and cut to the most frequent ones. Returns true if a combined count saturated.
    pub fn normalize_value_sites(&mut self) -> bool {
        self.scale_value_sites(1)
    }

    fn scale_value_sites(&mut self, weight: u64) -> bool {
        let mut overflowed = false;
        if let Some(data) = self.data.as_mut() {
            for kind in ValueKind::iter() {
                for site in data.sites_mut(kind).iter_mut() {
                    let values = std::mem::take(site);
                    overflowed |= merge_site_records(site, &values, weight);
                }
            }
        }
        overflowed
    }

    /// Adds `other` scaled by `weight` into this record. Problems are passed to `warn`, a counter
    /// overflow is reported once no matter how many counters saturated.
    pub fn merge(
        &mut self,
        other: &InstrProfRecord,
        weight: u64,
        mode: MergeMode,
        warn: &mut dyn FnMut(InstrProfError),
    ) {
        if mode == MergeMode::Strict {
            if self.counts.len() != other.counts.len() {
                warn(InstrProfError::CountMismatch);
                return;
            }
            if ValueKind::iter()
                .any(|kind| self.num_value_sites(kind) != other.num_value_sites(kind))
            {
                warn(InstrProfError::ValueSiteCountMismatch);
                return;
            }
        }
        if self.counts.len() < other.counts.len() {
            self.counts.resize(other.counts.len(), 0);
        }
        let mut overflowed = false;
        for (own, other) in self.counts.iter_mut().zip(other.counts.iter()) {
            let (res, overflow) = saturating_multiply_add(*other, weight, *own, MAX_COUNT_VALUE);
            *own = res;
            overflowed |= overflow;
        }
        if let Some(other) = other.data.as_ref() {
            overflowed |= self.merge_value_prof_data(other, weight);
        }
        if overflowed {
            warn(InstrProfError::CounterOverflow);
        }
    }

    fn merge_value_prof_data(&mut self, other: &ValueProfDataRecord, weight: u64) -> bool {
        let data = self.data.get_or_insert_with(Default::default);
        let mut overflowed = false;
        for kind in ValueKind::iter() {
            let theirs = other.sites(kind);
            let ours = data.sites_mut(kind);
            if ours.len() < theirs.len() {
                ours.resize(theirs.len(), vec![]);
            }
            for (own, other) in ours.iter_mut().zip(theirs.iter()) {
                overflowed |= merge_site_records(own, other, weight);
            }
        }
        overflowed
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct NamedInstrProfRecord {
    pub name: String,
    pub hash: u64,
    pub record: InstrProfRecord,
}

impl NamedInstrProfRecord {
    pub fn new(name: impl Into<String>, hash: u64, counts: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            hash,
            record: InstrProfRecord::new(counts),
        }
    }

    pub fn num_value_sites(&self, kind: ValueKind) -> usize {
        self.record.num_value_sites(kind)
    }

    pub fn has_cs_flag(&self) -> bool {
        has_cs_flag_in_hash(self.hash)
    }

    pub fn set_cs_flag(&mut self) {
        self.hash |= 1 << CS_FLAG_IN_FUNC_HASH;
    }

    pub fn counts(&self) -> &[u64] {
        &self.record.counts
    }
}
