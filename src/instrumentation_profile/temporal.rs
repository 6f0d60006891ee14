use crate::instrumentation_profile::ParseResult;
use crate::util::{parse_u64_array, write_u64, write_u64_array};
use indexmap::IndexSet;
use nom::error::{ErrorKind, ParseError, VerboseError};
use nom::number::complete::le_u64;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// The order in which functions were first executed in one run, as name hashes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TemporalProfTrace {
    pub weight: u64,
    pub function_name_refs: Vec<u64>,
}

impl Default for TemporalProfTrace {
    fn default() -> Self {
        Self::new(vec![])
    }
}

impl TemporalProfTrace {
    pub fn new(function_name_refs: Vec<u64>) -> Self {
        Self {
            weight: 1,
            function_name_refs,
        }
    }
}

/// Keeps a uniform random sample of at most `capacity` traces from every trace ever added.
/// `stream_size` counts all of those traces, kept or not.
#[derive(Clone, Debug)]
pub struct TraceReservoir {
    capacity: usize,
    max_trace_length: usize,
    traces: Vec<TemporalProfTrace>,
    stream_size: u64,
    rng: SmallRng,
}

impl TraceReservoir {
    pub fn new(capacity: usize, max_trace_length: usize, seed: u64) -> Self {
        Self {
            capacity,
            max_trace_length,
            traces: vec![],
            stream_size: 0,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_trace_length(&self) -> usize {
        self.max_trace_length
    }

    pub fn traces(&self) -> &[TemporalProfTrace] {
        &self.traces
    }

    pub fn stream_size(&self) -> u64 {
        self.stream_size
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    fn is_sampled(&self, stream_size: u64) -> bool {
        stream_size > self.capacity as u64
    }

    fn add_trace(&mut self, trace: TemporalProfTrace) {
        if self.stream_size < self.capacity as u64 {
            self.traces.push(trace);
        } else {
            let index = self.rng.gen_range(0..=self.stream_size);
            if let Some(slot) = self.traces.get_mut(index as usize) {
                *slot = trace;
            }
        }
        self.stream_size = self.stream_size.saturating_add(1);
    }

    /// Adds a batch of traces that was drawn from a stream of `stream_size` traces. Traces are
    /// cut to `max_trace_length` and empty ones are dropped. If `stream_size` is larger than the
    /// capacity the batch is taken to be a sample of that stream and gets replayed as one.
    pub fn add_traces(&mut self, traces: Vec<TemporalProfTrace>, stream_size: u64) {
        let max_len = self.max_trace_length;
        let mut source = traces
            .into_iter()
            .filter_map(|mut x| {
                x.function_name_refs.truncate(max_len);
                if x.function_name_refs.is_empty() {
                    None
                } else {
                    Some(x)
                }
            })
            .collect::<Vec<_>>();
        let mut source_stream = stream_size;

        let mut source_sampled = self.is_sampled(source_stream);
        if !self.is_sampled(self.stream_size) && source_sampled {
            std::mem::swap(&mut self.traces, &mut source);
            std::mem::swap(&mut self.stream_size, &mut source_stream);
            self.traces.truncate(self.capacity);
            source_sampled = self.is_sampled(source_stream);
        }

        if !source_sampled {
            for trace in source {
                self.add_trace(trace);
            }
        } else {
            let to_replace = self.draw_slots(source_stream);
            source.shuffle(&mut self.rng);
            for (index, trace) in to_replace.into_iter().zip(source) {
                self.traces[index] = trace;
            }
        }
        debug!(
            "Trace reservoir holds {} of {} traces",
            self.traces.len(),
            self.stream_size
        );
    }

    /// Replays `draws` additions into a full reservoir and returns the slots they land in, in
    /// the order they were first hit. Runs of draws that miss every slot are skipped in one step.
    fn draw_slots(&mut self, draws: u64) -> IndexSet<usize> {
        let len = self.traces.len();
        let mut slots = IndexSet::new();
        let mut remaining = draws;
        while remaining > 0 && slots.len() < len {
            let misses = self.misses_before_hit(remaining);
            self.stream_size = self.stream_size.saturating_add(misses);
            remaining -= misses;
            if remaining == 0 {
                break;
            }
            slots.insert(self.rng.gen_range(0..len));
            self.stream_size = self.stream_size.saturating_add(1);
            remaining -= 1;
        }
        // Once every slot is taken the rest of the draws only grow the stream
        self.stream_size = self.stream_size.saturating_add(remaining);
        slots
    }

    /// Number of draws, at most `limit`, that miss every slot before one hits. With `n` traces
    /// seen a draw lands in one of the `len` slots with probability `len / (n + 1)`.
    fn misses_before_hit(&mut self, limit: u64) -> u64 {
        let len = self.traces.len();
        let first = self.stream_size as f64 + 1.0 - len as f64;
        // Chance that the next `n` draws all miss
        let all_miss = |n: u64| {
            (0..len)
                .map(|i| (first + i as f64) / (first + n as f64 + i as f64))
                .product::<f64>()
        };
        let target: f64 = self.rng.gen();
        if all_miss(limit) > target {
            return limit;
        }
        let (mut lo, mut hi) = (0, limit);
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if all_miss(mid) > target {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn merge(&mut self, other: TraceReservoir) {
        self.add_traces(other.traces, other.stream_size);
    }
}

/// ```text
/// u64 num_traces
/// u64 stream_size
/// (u64 weight, u64 num_refs, u64 refs[num_refs])[num_traces]
/// ```
pub(crate) fn write_section(out: &mut Vec<u8>, traces: &[TemporalProfTrace], stream_size: u64) {
    write_u64(out, traces.len() as u64);
    write_u64(out, stream_size);
    for trace in traces {
        write_u64(out, trace.weight);
        write_u64_array(out, &trace.function_name_refs);
    }
}

pub(crate) fn parse_section(input: &[u8]) -> ParseResult<(Vec<TemporalProfTrace>, u64)> {
    let (bytes, num_traces) = le_u64(input)?;
    let (mut bytes, stream_size) = le_u64(bytes)?;
    if num_traces > (bytes.len() / 16) as u64 {
        return Err(nom::Err::Failure(VerboseError::from_error_kind(
            input,
            ErrorKind::Count,
        )));
    }
    if stream_size < num_traces {
        return Err(nom::Err::Failure(VerboseError::from_error_kind(
            input,
            ErrorKind::Verify,
        )));
    }
    let mut traces = Vec::with_capacity(num_traces as usize);
    for _ in 0..num_traces {
        let (rest, weight) = le_u64(bytes)?;
        let (rest, function_name_refs) = parse_u64_array(rest)?;
        traces.push(TemporalProfTrace {
            weight,
            function_name_refs,
        });
        bytes = rest;
    }
    Ok((bytes, (traces, stream_size)))
}
