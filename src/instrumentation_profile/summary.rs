use crate::instrumentation_profile::types::*;
use crate::summary::{Kind, ProfileSummary, ProfileSummaryEntry, DEFAULT_CUTOFFS, SCALE};
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// Accumulates counts from records and turns them into a `ProfileSummary`.
#[derive(Clone, Debug)]
pub struct ProfileSummaryBuilder {
    cutoffs: Vec<u32>,
    num_functions: u64,
    num_counts: u64,
    total_count: u64,
    max_count: u64,
    max_function_count: u64,
    max_internal_block_count: u64,
    count_frequencies: BTreeMap<Reverse<u64>, u64>,
}

impl Default for ProfileSummaryBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CUTOFFS.to_vec())
    }
}

impl ProfileSummaryBuilder {
    pub fn new(mut cutoffs: Vec<u32>) -> Self {
        cutoffs.sort_unstable();
        cutoffs.retain(|x| (*x as u64) < SCALE);
        Self {
            cutoffs,
            num_functions: 0,
            num_counts: 0,
            total_count: 0,
            max_count: 0,
            max_function_count: 0,
            max_internal_block_count: 0,
            count_frequencies: BTreeMap::new(),
        }
    }

    /// The first counter is the entry count of the function, the rest are internal block counts.
    pub fn add_record(&mut self, record: &InstrProfRecord) {
        if let Some((entry, internal)) = record.counts.split_first() {
            self.add_entry_count(*entry);
            for count in internal {
                self.add_internal_count(*count);
            }
        }
    }

    fn add_entry_count(&mut self, count: u64) {
        self.num_functions += 1;
        // u64::MAX marks an invalid count
        if count == u64::MAX {
            return;
        }
        self.add_count(count);
        if count > self.max_function_count {
            self.max_function_count = count;
        }
    }

    fn add_internal_count(&mut self, count: u64) {
        if count == u64::MAX {
            return;
        }
        self.add_count(count);
        if count > self.max_internal_block_count {
            self.max_internal_block_count = count;
        }
    }

    fn add_count(&mut self, count: u64) {
        self.total_count = self.total_count.saturating_add(count);
        if count > self.max_count {
            self.max_count = count;
        }
        self.num_counts += 1;
        *self.count_frequencies.entry(Reverse(count)).or_insert(0) += 1;
    }

    pub fn num_functions(&self) -> u64 {
        self.num_functions
    }

    pub fn max_function_count(&self) -> u64 {
        self.max_function_count
    }

    pub fn max_internal_block_count(&self) -> u64 {
        self.max_internal_block_count
    }

    /// Walks the counts from hottest to coldest, for every cutoff recording the count that takes
    /// the running sum past the cutoff's share of the total.
    fn detailed_summary(&self) -> Vec<ProfileSummaryEntry> {
        let mut result = Vec::with_capacity(self.cutoffs.len());
        let mut frequencies = self.count_frequencies.iter();
        let mut counts_seen = 0u64;
        let mut current_sum = 0u128;
        let mut count = 0u64;
        for cutoff in &self.cutoffs {
            let desired = self.total_count as u128 * *cutoff as u128 / SCALE as u128;
            while current_sum < desired {
                match frequencies.next() {
                    Some((Reverse(c), freq)) => {
                        count = *c;
                        current_sum += *c as u128 * *freq as u128;
                        counts_seen += freq;
                    }
                    None => break,
                }
            }
            result.push(ProfileSummaryEntry {
                cutoff: *cutoff,
                min_count: count,
                num_counts: counts_seen,
            });
        }
        result
    }

    pub fn get_summary(&self, kind: Kind) -> ProfileSummary {
        let mut summary = ProfileSummary::empty(kind);
        summary.total_count = self.total_count;
        summary.max_count = self.max_count;
        summary.max_internal_count = self.max_internal_block_count;
        summary.max_function_count = self.max_function_count;
        summary.num_counts = self.num_counts;
        summary.num_fns = self.num_functions;
        summary.detailed_summary = self.detailed_summary();
        summary
    }
}
