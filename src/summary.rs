use crate::instrumentation_profile::ParseResult;
use crate::util::write_u64;
use nom::error::{ErrorKind, ParseError, VerboseError};
use nom::number::complete::le_u64;
use std::fmt;

/// Cutoffs are expressed in parts per million of the total count.
pub const SCALE: u64 = 1_000_000;

pub const DEFAULT_CUTOFFS: [u32; 16] = [
    10000, 100000, 200000, 300000, 400000, 500000, 600000, 700000, 800000, 900000, 950000, 990000,
    999000, 999900, 999990, 999999,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Instr,
    CsInstr,
    Sample,
}

impl Kind {
    fn format_name(self) -> &'static str {
        match self {
            Self::Instr => "InstrProf",
            Self::CsInstr => "CSInstrProf",
            Self::Sample => "SampleProfile",
        }
    }

    fn from_format_name(name: &str) -> Option<Self> {
        match name {
            "InstrProf" => Some(Self::Instr),
            "CSInstrProf" => Some(Self::CsInstr),
            "SampleProfile" => Some(Self::Sample),
            _ => None,
        }
    }
}

/// The smallest count needed to reach `cutoff` parts per million of the total, and how many
/// counts are at least that large.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileSummaryEntry {
    pub cutoff: u32,
    pub min_count: u64,
    pub num_counts: u64,
}

#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct ProfileSummary {
    pub(crate) kind: Kind,
    pub(crate) total_count: u64,
    pub(crate) max_count: u64,
    pub(crate) max_internal_count: u64,
    pub(crate) max_function_count: u64,
    pub(crate) num_counts: u64,
    pub(crate) num_fns: u64,
    pub(crate) partial: bool,
    pub(crate) partial_profile_ratio: f64,
    pub(crate) detailed_summary: Vec<ProfileSummaryEntry>,
}

/// A small tree of metadata nodes, used to attach a summary to a module.
#[derive(Clone, Debug, PartialEq)]
pub enum Metadata {
    String(String),
    Int(u64),
    Float(f64),
    Tuple(Vec<Metadata>),
}

impl Metadata {
    fn key_value(key: &str, value: Metadata) -> Self {
        Self::Tuple(vec![Self::String(key.to_string()), value])
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<u64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn as_tuple(&self) -> Option<&[Metadata]> {
        match self {
            Self::Tuple(t) => Some(t.as_slice()),
            _ => None,
        }
    }

    /// Returns the value of a `(key, value)` tuple if the key matches.
    fn value_for(&self, key: &str) -> Option<&Metadata> {
        match self.as_tuple()? {
            [k, v] if k.as_str() == Some(key) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "!\"{}\"", s),
            Self::Int(i) => write!(f, "i64 {}", i),
            Self::Float(x) => write!(f, "double {:e}", x),
            Self::Tuple(nodes) => {
                write!(f, "!{{")?;
                for (i, node) in nodes.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", node)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl ProfileSummary {
    pub fn empty(kind: Kind) -> Self {
        Self {
            kind,
            total_count: 0,
            max_count: 0,
            max_internal_count: 0,
            max_function_count: 0,
            num_counts: 0,
            num_fns: 0,
            partial: false,
            partial_profile_ratio: 0.0,
            detailed_summary: vec![],
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn max_count(&self) -> u64 {
        self.max_count
    }

    pub fn max_internal_count(&self) -> u64 {
        self.max_internal_count
    }

    pub fn max_function_count(&self) -> u64 {
        self.max_function_count
    }

    pub fn num_counts(&self) -> u64 {
        self.num_counts
    }

    pub fn num_functions(&self) -> u64 {
        self.num_fns
    }

    pub fn is_partial_profile(&self) -> bool {
        self.partial
    }

    pub fn partial_profile_ratio(&self) -> f64 {
        self.partial_profile_ratio
    }

    pub fn set_partial_profile_ratio(&mut self, ratio: f64) {
        self.partial = true;
        self.partial_profile_ratio = ratio;
    }

    pub fn detailed_summary(&self) -> &[ProfileSummaryEntry] {
        &self.detailed_summary
    }

    /// Entry with the smallest cutoff that is at least `cutoff`.
    pub fn entry_for_cutoff(&self, cutoff: u32) -> Option<&ProfileSummaryEntry> {
        self.detailed_summary.iter().find(|x| x.cutoff >= cutoff)
    }

    pub fn to_metadata(&self) -> Metadata {
        let mut nodes = vec![
            Metadata::key_value(
                "ProfileFormat",
                Metadata::String(self.kind.format_name().to_string()),
            ),
            Metadata::key_value("TotalCount", Metadata::Int(self.total_count)),
            Metadata::key_value("MaxCount", Metadata::Int(self.max_count)),
            Metadata::key_value("MaxInternalCount", Metadata::Int(self.max_internal_count)),
            Metadata::key_value("MaxFunctionCount", Metadata::Int(self.max_function_count)),
            Metadata::key_value("NumCounts", Metadata::Int(self.num_counts)),
            Metadata::key_value("NumFunctions", Metadata::Int(self.num_fns)),
        ];
        if self.partial {
            nodes.push(Metadata::key_value("IsPartialProfile", Metadata::Int(1)));
            nodes.push(Metadata::key_value(
                "PartialProfileRatio",
                Metadata::Float(self.partial_profile_ratio),
            ));
        }
        let entries = self
            .detailed_summary
            .iter()
            .map(|x| {
                Metadata::Tuple(vec![
                    Metadata::Int(x.cutoff as u64),
                    Metadata::Int(x.min_count),
                    Metadata::Int(x.num_counts),
                ])
            })
            .collect();
        nodes.push(Metadata::key_value(
            "DetailedSummary",
            Metadata::Tuple(entries),
        ));
        Metadata::Tuple(nodes)
    }

    /// Rebuilds a summary from `to_metadata` output. Anything structurally off gives `None`.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let nodes = metadata.as_tuple()?;
        let mut nodes = nodes.iter();
        let kind = Kind::from_format_name(nodes.next()?.value_for("ProfileFormat")?.as_str()?)?;
        let mut int_field = |key: &str| nodes.next()?.value_for(key)?.as_int();
        let total_count = int_field("TotalCount")?;
        let max_count = int_field("MaxCount")?;
        let max_internal_count = int_field("MaxInternalCount")?;
        let max_function_count = int_field("MaxFunctionCount")?;
        let num_counts = int_field("NumCounts")?;
        let num_fns = int_field("NumFunctions")?;

        let mut partial = false;
        let mut partial_profile_ratio = 0.0;
        let mut node = nodes.next()?;
        if let Some(flag) = node.value_for("IsPartialProfile") {
            partial = flag.as_int()? != 0;
            node = nodes.next()?;
            if let Some(Metadata::Float(ratio)) = node.value_for("PartialProfileRatio") {
                partial_profile_ratio = *ratio;
                node = nodes.next()?;
            }
        }
        let mut detailed_summary = vec![];
        for entry in node.value_for("DetailedSummary")?.as_tuple()? {
            match entry.as_tuple()? {
                [cutoff, min_count, num_counts] => detailed_summary.push(ProfileSummaryEntry {
                    cutoff: cutoff.as_int()? as u32,
                    min_count: min_count.as_int()?,
                    num_counts: num_counts.as_int()?,
                }),
                _ => return None,
            }
        }
        if nodes.next().is_some() {
            return None;
        }
        Some(Self {
            kind,
            total_count,
            max_count,
            max_internal_count,
            max_function_count,
            num_counts,
            num_fns,
            partial,
            partial_profile_ratio,
            detailed_summary,
        })
    }

    /// Writes the summary section of an indexed profile.
    ///
    /// ```text
    /// u64 num_fields
    /// u64 num_entries
    /// u64 fields[num_fields]
    /// (u64 cutoff, u64 min_count, u64 num_counts)[num_entries]
    /// ```
    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        let fields = [
            self.num_fns,
            self.num_counts,
            self.max_function_count,
            self.max_count,
            self.max_internal_count,
            self.total_count,
        ];
        write_u64(out, fields.len() as u64);
        write_u64(out, self.detailed_summary.len() as u64);
        for field in &fields {
            write_u64(out, *field);
        }
        for entry in &self.detailed_summary {
            write_u64(out, entry.cutoff as u64);
            write_u64(out, entry.min_count);
            write_u64(out, entry.num_counts);
        }
    }

    /// Reads a summary section. Fields beyond the ones known here are skipped and missing ones
    /// read as zero.
    pub(crate) fn parse(input: &[u8], kind: Kind) -> ParseResult<Self> {
        let (bytes, num_fields) = le_u64(input)?;
        let (mut bytes, num_entries) = le_u64(bytes)?;
        if num_fields.saturating_add(num_entries.saturating_mul(3)) > (bytes.len() / 8) as u64 {
            return Err(nom::Err::Failure(VerboseError::from_error_kind(
                input,
                ErrorKind::Count,
            )));
        }
        let mut fields = [0u64; 6];
        for i in 0..num_fields as usize {
            let (rest, field) = le_u64(bytes)?;
            if let Some(f) = fields.get_mut(i) {
                *f = field;
            }
            bytes = rest;
        }
        let mut detailed_summary = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let (rest, cutoff) = le_u64(bytes)?;
            let (rest, min_count) = le_u64(rest)?;
            let (rest, num_counts) = le_u64(rest)?;
            detailed_summary.push(ProfileSummaryEntry {
                cutoff: cutoff as u32,
                min_count,
                num_counts,
            });
            bytes = rest;
        }
        let [num_fns, num_counts, max_function_count, max_count, max_internal_count, total_count] =
            fields;
        let summary = Self {
            kind,
            total_count,
            max_count,
            max_internal_count,
            max_function_count,
            num_counts,
            num_fns,
            partial: false,
            partial_profile_ratio: 0.0,
            detailed_summary,
        };
        Ok((bytes, summary))
    }
}
