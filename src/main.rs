use anyhow::{anyhow, bail, Context, Result};
use indexed_profdata::instrumentation_profile::memprof::{Frame, Meta, MemProfVersion};
use indexed_profdata::instrumentation_profile::stats::*;
use indexed_profdata::instrumentation_profile::types::*;
use indexed_profdata::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::convert::TryFrom;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use structopt::StructOpt;
use tracing::{debug, warn, Level};

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub enum Command {
    Show {
        #[structopt(flatten)]
        show: ShowCommand,
    },
    Merge {
        #[structopt(flatten)]
        merge: MergeCommand,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub struct ShowCommand {
    /// Indexed profile to show some information about
    #[structopt(name = "input", long = "input", short = "i")]
    input: PathBuf,
    /// Show counter values for shown functions
    #[structopt(long = "counts")]
    show_counts: bool,
    /// Details for every function
    #[structopt(long = "all-functions")]
    all_functions: bool,
    /// Show indirect call site target values for shown functions
    #[structopt(long = "ic-targets")]
    ic_targets: bool,
    /// Show the profiled sizes of the memory intrinsic call for shown functions
    #[structopt(long = "memop-sizes")]
    memop_sizes: bool,
    /// Show the vtable targets for shown functions
    #[structopt(long = "vtable-targets")]
    vtable_targets: bool,
    /// Show detailed profile summary
    #[structopt(long = "detailed-summary")]
    detailed_summary: bool,
    /// Show context sensitive counts
    #[structopt(long = "showcs")]
    showcs: bool,
    /// Details for matching functions
    #[structopt(long = "function")]
    function: Option<String>,
    /// Show the list of functions with the largest internal counts
    #[structopt(long = "topn")]
    topn: Option<usize>,
    /// Show the temporal profile traces
    #[structopt(long = "temporal-traces")]
    temporal_traces: bool,
    /// Show the memprof record of the function with this name hash
    #[structopt(long = "memprof")]
    memprof: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub struct MergeCommand {
    /// Input files to merge
    #[structopt(name = "input", long = "input", short = "i")]
    input: Vec<PathBuf>,
    /// Output file
    #[structopt(long = "output", short = "o")]
    output: PathBuf,
    /// List of weights and filenames in `<weight>,<filename>` format
    #[structopt(long = "weighted-input", parse(try_from_str=try_parse_weighted))]
    weighted_input: Vec<(u64, String)>,
    /// Generate a sparse profile
    #[structopt(long = "sparse")]
    sparse: bool,
    /// Compress the function names
    #[structopt(long = "compress-names")]
    compress_names: bool,
    /// Version of the memprof section to write
    #[structopt(long = "memprof-version", default_value = "2")]
    memprof_version: u64,
    /// Number of merge threads to use (will autodetect by default)
    #[structopt(long = "num-threads", short = "j")]
    jobs: Option<usize>,
}

#[derive(Clone, Debug, Eq, PartialEq, StructOpt)]
pub struct Opts {
    /// Print debug logging to stderr
    #[structopt(long = "verbose", short = "v")]
    verbose: bool,
    #[structopt(subcommand)]
    cmd: Command,
}

fn try_parse_weighted(input: &str) -> Result<(u64, String), String> {
    if !input.contains(',') {
        Ok((1, input.to_string()))
    } else {
        let parts = input.split(',').collect::<Vec<_>>();
        if parts.len() != 2 {
            Err("Unexpected weighting format, expected $weight,$name or just $name".to_string())
        } else {
            let weight = parts[0]
                .parse()
                .map_err(|e| format!("Invalid weight: {}", e))?;
            if weight < 1 {
                Err("Weight must be positive integer".to_string())
            } else {
                Ok((weight, parts[1].to_string()))
            }
        }
    }
}

fn check_function(name: &str, pattern: Option<&String>) -> bool {
    match pattern {
        Some(pat) => name.contains(pat.as_str()),
        None => false,
    }
}

#[derive(Clone, Debug, Eq)]
struct HotFn {
    name: String,
    count: u64,
}

impl PartialOrd for HotFn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HotFn {
    fn cmp(&self, other: &Self) -> Ordering {
        // Do the reverse here
        other.count.cmp(&self.count)
    }
}

impl PartialEq for HotFn {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
    }
}

fn show_frame(out: &mut impl Write, frame: &Frame, symtab_name: Option<&str>) -> io::Result<()> {
    let function = match symtab_name {
        Some(name) => name.to_string(),
        None => format!("{:#018x}", frame.function),
    };
    writeln!(
        out,
        "        {}:{}:{} inline: {}",
        function, frame.line_offset, frame.column, frame.is_inline_frame
    )
}

impl ShowCommand {
    fn value_kinds(&self) -> Vec<ValueKind> {
        let mut kinds = vec![];
        if self.ic_targets {
            kinds.push(ValueKind::IndirectCallTarget);
        }
        if self.memop_sizes {
            kinds.push(ValueKind::MemOpSize);
        }
        if self.vtable_targets {
            kinds.push(ValueKind::VTableTarget);
        }
        kinds
    }

    pub fn run(&self) -> Result<()> {
        let profile = open(&self.input)
            .with_context(|| format!("Failed to read {}", self.input.display()))?;
        let stdout = io::stdout();
        let mut out = stdout.lock();

        let is_ir_instr = profile.profile_kind().level() == InstrumentationLevel::Ir;
        let mut stats = vec![ValueSiteStats::default(); ValueKind::len()];
        let topn = self.topn.unwrap_or_default();
        let mut hotties = BinaryHeap::<HotFn>::with_capacity(topn);
        let mut shown_funcs = 0;
        let mut total_funcs = 0;

        let mut funcs = profile.iter().collect::<Result<Vec<_>, _>>()?;
        funcs.sort_by(|a, b| a.name.cmp(&b.name).then(a.hash.cmp(&b.hash)));

        for func in &funcs {
            if is_ir_instr && func.has_cs_flag() != self.showcs {
                continue;
            }
            total_funcs += 1;
            let show = self.all_functions || check_function(&func.name, self.function.as_ref());
            let func_max = func.counts().iter().copied().max().unwrap_or_default();
            if topn > 0 {
                if hotties.len() == topn {
                    if hotties.peek().map(|x| x.count < func_max).unwrap_or(false) {
                        hotties.pop();
                        hotties.push(HotFn {
                            name: func.name.clone(),
                            count: func_max,
                        });
                    }
                } else {
                    hotties.push(HotFn {
                        name: func.name.clone(),
                        count: func_max,
                    });
                }
            }
            if !show {
                continue;
            }
            if shown_funcs == 0 {
                writeln!(out, "Counters:")?;
            }
            shown_funcs += 1;
            writeln!(out, "  {}:", func.name)?;
            writeln!(out, "    Hash: {:#018x}", func.hash)?;
            writeln!(out, "    Counters: {}", func.counts().len())?;
            if !is_ir_instr {
                writeln!(
                    out,
                    "    Function count: {}",
                    func.counts().first().copied().unwrap_or_default()
                )?;
            }
            if self.show_counts {
                let start = if is_ir_instr { 0 } else { 1 };
                let counts = func
                    .counts()
                    .iter()
                    .skip(start)
                    .map(|x| x.to_string())
                    .collect::<Vec<String>>()
                    .join(", ");
                writeln!(out, "    Block counts: [{}]", counts)?;
            }
            for kind in self.value_kinds() {
                let num_sites = func.num_value_sites(kind);
                writeln!(out, "    {} site count: {}", kind, num_sites)?;
                if num_sites > 0 {
                    writeln!(out, "    {} results:", kind)?;
                    let symtab = match kind {
                        ValueKind::MemOpSize => None,
                        _ => Some(profile.symtab()),
                    };
                    stats[kind as usize].traverse_sites(&func.record, kind, symtab, &mut out)?;
                }
            }
        }

        let summary = profile.get_summary(self.showcs);
        writeln!(
            out,
            "Instrumentation level: {}",
            profile.profile_kind().level()
        )?;
        if self.all_functions || self.function.is_some() {
            writeln!(out, "Functions shown: {}", shown_funcs)?;
        }
        writeln!(out, "Total functions: {}", total_funcs)?;
        writeln!(
            out,
            "Maximum function count: {}",
            summary.max_function_count()
        )?;
        writeln!(
            out,
            "Maximum internal block count: {}",
            summary.max_internal_count()
        )?;
        if let Some(topn) = self.topn {
            writeln!(
                out,
                "Top {} functions with the largest internal block counts: ",
                topn
            )?;
            for f in hotties.into_sorted_vec() {
                writeln!(out, "  {}, max count = {}", f.name, f.count)?;
            }
        }
        if shown_funcs > 0 {
            for kind in self.value_kinds() {
                writeln!(out, "Statistics for {} profile:", kind)?;
                writeln!(out, "{}", stats[kind as usize])?;
            }
        }
        if self.detailed_summary {
            writeln!(out, "Total number of blocks: {}", summary.num_counts())?;
            writeln!(out, "Total count: {}", summary.total_count())?;
            writeln!(out, "Detailed summary:")?;
            for entry in summary.detailed_summary() {
                writeln!(
                    out,
                    "{} blocks ({:.2}%) with count >= {} account for {} percentage of the total counts.",
                    entry.num_counts,
                    entry.num_counts as f64 * 100.0 / summary.num_counts().max(1) as f64,
                    entry.min_count,
                    entry.cutoff as f64 / 10000.0
                )?;
            }
        }
        if self.temporal_traces {
            let traces = profile.get_temporal_prof_traces();
            writeln!(
                out,
                "Temporal Profile Traces (samples={} seen={}):",
                traces.len(),
                profile.get_temporal_prof_trace_stream_size()
            )?;
            for (i, trace) in traces.iter().enumerate() {
                writeln!(
                    out,
                    "  Temporal Profile Trace {} (weight={} count={}):",
                    i,
                    trace.weight,
                    trace.function_name_refs.len()
                )?;
                for hash in &trace.function_name_refs {
                    match profile.symtab().get_func_or_var_name(*hash) {
                        Some(name) => writeln!(out, "  {}", name)?,
                        None => writeln!(out, "  {:#018x}", hash)?,
                    }
                }
            }
        }
        if let Some(id) = self.memprof {
            let record = profile
                .get_memprof_record(id)
                .with_context(|| format!("No memprof record for {:#x}", id))?;
            let name = |frame: &Frame| profile.symtab().get_func_or_var_name(frame.function);
            writeln!(out, "MemProf record {:#018x}:", id)?;
            for site in &record.alloc_sites {
                writeln!(out, "    AllocSite:")?;
                writeln!(out, "      CallStack:")?;
                for frame in &site.call_stack {
                    show_frame(&mut out, frame, name(frame))?;
                }
                writeln!(out, "      MemInfoBlock:")?;
                for meta in Meta::ALL {
                    writeln!(out, "        {:?}: {}", meta, site.info.get(*meta))?;
                }
            }
            for site in &record.call_sites {
                writeln!(out, "    CallSite:")?;
                for frame in site {
                    show_frame(&mut out, frame, name(frame))?;
                }
            }
        }
        Ok(())
    }
}

fn merge_inputs(inputs: &[(u64, PathBuf)], options: WriterOptions) -> Result<InstrProfWriter> {
    let mut writer = InstrProfWriter::new(options);
    for (weight, path) in inputs {
        let reader =
            open(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mut report = |e: InstrProfError| warn!("{}: {}", path.display(), e);
        writer
            .add_profile(&reader, *weight, &mut report)
            .with_context(|| format!("Failed to merge {}", path.display()))?;
        debug!("Merged {} with weight {}", path.display(), weight);
    }
    Ok(writer)
}

impl MergeCommand {
    fn run(&self) -> Result<()> {
        let mut inputs = self
            .input
            .iter()
            .map(|x| (1, x.clone()))
            .collect::<Vec<_>>();
        inputs.extend(
            self.weighted_input
                .iter()
                .map(|(weight, path)| (*weight, PathBuf::from(path))),
        );
        if inputs.is_empty() {
            bail!("No input files selected. See merge --help");
        }
        let options = WriterOptions {
            sparse: self.sparse,
            compress_names: self.compress_names,
            memprof_version: MemProfVersion::try_from(self.memprof_version)?,
            ..Default::default()
        };
        let jobs = self
            .jobs
            .unwrap_or_else(|| thread::available_parallelism().map(|x| x.get()).unwrap_or(1))
            .clamp(1, inputs.len());
        let chunk_size = (inputs.len() + jobs - 1) / jobs;
        debug!("Merging {} profiles on {} threads", inputs.len(), jobs);

        let writers = thread::scope(|s| {
            let handles = inputs
                .chunks(chunk_size)
                .map(|chunk| s.spawn(move || merge_inputs(chunk, options)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(writer) => writer,
                    Err(_) => Err(anyhow!("Merge thread panicked")),
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut writers = writers.into_iter();
        let mut merged = writers
            .next()
            .ok_or_else(|| anyhow!("No profiles were merged"))?;
        for writer in writers {
            merged.merge_records_from_writer(writer, &mut |e| warn!("{}", e));
        }
        let mut output = fs::File::create(&self.output)
            .with_context(|| format!("Failed to create {}", self.output.display()))?;
        merged.write(&mut output)?;
        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::from_args();
    let level = if opts.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
    match opts.cmd {
        Command::Show { show } => show.run(),
        Command::Merge { merge } => merge.run(),
    }
}
