//! End to end analyses built from the decoder and the analysis primitives.

use crate::analysis::hwm::{FunctionSiteAllocation, HwmRecord};
use crate::analysis::mapper::{self, GlobalStackId, StackEquivalenceMapper};
use crate::analysis::model::{ConsumptionModel, Formula, RunScale, ScaleComparison, Tally};
use crate::analysis::report::{self, ConsumptionRow, RunSummary};
use crate::config::TraceConfig;
use crate::decoder::{self, DecodeOptions, DecodedTrace, SearchTarget};
use crate::layout;
use crate::types::{AllocationId, Bytes, SymbolName};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to decode trace '{}'", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: decoder::Error,
    },

    #[error("No trace files found in '{}'", .0.display())]
    NoTraces(PathBuf),

    #[error("An analysis worker panicked")]
    WorkerPanicked,

    #[error("Encountered and IO error while writing a report ({})", .0.kind())]
    Io(#[from] io::Error),
}

fn decode(path: &Path, opts: DecodeOptions) -> Result<DecodedTrace, Error> {
    DecodedTrace::from_file(path, opts).map_err(|source| Error::Decode {
        path: path.to_path_buf(),
        source,
    })
}

/// A trace decoded once in full and once up to its peak
#[derive(Clone, Debug)]
pub struct PeakAnalysis {
    /// Fast pass over the whole trace, with its consumption log
    pub full: DecodedTrace,
    /// Symbolic pass stopped at the peak allocation
    pub at_peak: DecodedTrace,
}

impl PeakAnalysis {
    pub fn hwm(&self) -> HwmRecord {
        self.full.hwm
    }

    /// Memory live at the peak, grouped by call stack
    pub fn function_breakdown(&self) -> Vec<FunctionSiteAllocation> {
        self.at_peak.tracker.function_breakdown()
    }

    pub fn call_stack(&self, site: &FunctionSiteAllocation) -> Vec<SymbolName> {
        self.at_peak.call_stack_symbols(site.stack_id)
    }

    pub fn consumption_graph(&self) -> Vec<ConsumptionRow> {
        match self.full.tracker.consumption_log() {
            Some(log) => report::consumption_graph(
                log,
                self.full.static_memory,
                self.full.hwm.peak_bytes,
                self.full.elapsed(),
            ),
            None => Vec::new(),
        }
    }

    /// Write the function breakdown next to `trace`
    pub fn write_functions_report<P: AsRef<Path>>(&self, trace: P) -> Result<PathBuf, Error> {
        let path = layout::report_path(trace, layout::FUNCTIONS_SUFFIX);
        let w = BufWriter::new(File::create(&path)?);
        report::write_function_breakdown(
            w,
            self.hwm().peak_bytes,
            &self.function_breakdown(),
            |site| self.call_stack(site),
        )?;
        Ok(path)
    }

    /// Write the consumption graph next to `trace`
    pub fn write_graph_report<P: AsRef<Path>>(&self, trace: P) -> Result<PathBuf, Error> {
        let path = layout::report_path(trace, layout::GRAPH_SUFFIX);
        let w = BufWriter::new(File::create(&path)?);
        report::write_consumption_graph(w, &self.consumption_graph())?;
        Ok(path)
    }
}

/// Find the peak of a trace, then replay it symbolically up to that point
pub fn analyze_peak<P: AsRef<Path>>(path: P) -> Result<PeakAnalysis, Error> {
    let path = path.as_ref();
    let full = decode(path, DecodeOptions::fast().with_consumption_log(true))?;
    debug!(path = %path.display(), hwm = %full.hwm, "Found peak");

    let mut opts = DecodeOptions::symbolic();
    if full.hwm.peak_allocation_id > AllocationId::zero() {
        opts = opts.with_search(SearchTarget::AllocationId(full.hwm.peak_allocation_id));
    }
    let at_peak = decode(path, opts)?;
    if at_peak.tracker.live_bytes() != full.hwm.peak_bytes {
        warn!(
            path = %path.display(),
            expected = %full.hwm.peak_bytes,
            found = %at_peak.tracker.live_bytes(),
            "Replay did not reproduce the peak"
        );
    }
    Ok(PeakAnalysis { full, at_peak })
}

/// Analyze a freshly finished trace as `config` asks, writing the selected
/// reports next to it. `None` when post processing is off.
pub fn post_process<P: AsRef<Path>>(
    trace: P,
    config: &TraceConfig,
) -> Result<Option<PeakAnalysis>, Error> {
    if !config.post_process {
        return Ok(None);
    }
    let trace = trace.as_ref();
    let analysis = analyze_peak(trace)?;
    if config.post_process_functions {
        analysis.write_functions_report(trace)?;
    }
    if config.post_process_graph {
        analysis.write_graph_report(trace)?;
    }
    debug!(path = %trace.display(), hwm = %analysis.hwm(), "Post processed trace");
    Ok(Some(analysis))
}

/// Peaks of every rank in a run directory
#[derive(Clone, PartialEq, Debug)]
pub struct RunAnalysis {
    pub traces: Vec<PathBuf>,
    /// Indexed by rank
    pub peaks: Vec<HwmRecord>,
    pub summary: RunSummary,
}

/// Decode every trace of a run on `workers` threads
pub fn analyze_run<P: AsRef<Path>>(run_dir: P, workers: usize) -> Result<RunAnalysis, Error> {
    let run_dir = run_dir.as_ref();
    let traces = layout::discover_traces(run_dir);
    if traces.is_empty() {
        return Err(Error::NoTraces(run_dir.to_path_buf()));
    }
    let ranges = layout::partition(workers.clamp(1, traces.len()), traces.len());
    debug!(traces = traces.len(), workers = ranges.len(), "Analyzing run");

    let results: Vec<Result<Vec<(HwmRecord, Bytes)>, Error>> = thread::scope(|s| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|range| {
                let chunk = &traces[range];
                s.spawn(move || {
                    chunk
                        .iter()
                        .map(|p| decode(p, DecodeOptions::fast()).map(|t| (t.hwm, t.static_memory)))
                        .collect::<Result<Vec<_>, Error>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or(Err(Error::WorkerPanicked)))
            .collect()
    });

    let mut peaks = Vec::with_capacity(traces.len());
    let mut static_memory = Bytes::zero();
    for chunk in results {
        for (hwm, stat) in chunk? {
            if peaks.is_empty() {
                static_memory = stat;
            }
            peaks.push(hwm);
        }
    }

    let peak_bytes: Vec<Bytes> = peaks.iter().map(|p| p.peak_bytes).collect();
    let summary = RunSummary::new(&peak_bytes, static_memory)
        .ok_or_else(|| Error::NoTraces(run_dir.to_path_buf()))?;
    Ok(RunAnalysis {
        traces,
        peaks,
        summary,
    })
}

/// A trace and the problem setup of the run it belongs to
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct RunInput {
    pub path: PathBuf,
    /// Global problem dimensions, unused dimensions set to 1
    pub problem: [u64; 3],
    /// Ranks along each problem dimension
    pub decomposition: [u32; 3],
}

impl RunInput {
    pub fn new<P: Into<PathBuf>>(path: P, problem: [u64; 3], decomposition: [u32; 3]) -> Self {
        Self {
            path: path.into(),
            problem,
            decomposition,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ScalingModel {
    pub comparison: ScaleComparison,
    pub formula: Formula,
    pub baseline: Tally,
    pub target: Tally,
    /// Number of call stacks compared
    pub sites: usize,
}

/// Compare the peaks of a baseline and a target run and fit a formula
pub fn build_scaling_model(
    baseline: &RunInput,
    target: &RunInput,
    tolerance: f64,
) -> Result<ScalingModel, Error> {
    let a = analyze_peak(&baseline.path)?;
    let b = analyze_peak(&target.path)?;

    let scale = |input: &RunInput, trace: &DecodedTrace| {
        let ranks = u32::try_from(trace.run.comm_size).unwrap_or(1).max(1);
        RunScale::new(ranks, input.problem).with_decomposition(input.decomposition)
    };
    let comparison = ScaleComparison::new(&scale(baseline, &a.at_peak), &scale(target, &b.at_peak));

    let mapper = StackEquivalenceMapper::from_symbolized(&[
        mapper::symbolize(&a.at_peak),
        mapper::symbolize(&b.at_peak),
    ]);
    let sites_a = sites_by_global_id(&mapper, 0, a.function_breakdown());
    let sites_b = sites_by_global_id(&mapper, 1, b.function_breakdown());

    let mut ids: Vec<GlobalStackId> = sites_a.keys().chain(sites_b.keys()).copied().collect();
    ids.sort();
    ids.dedup();

    let mut model = ConsumptionModel::new(comparison.ratios).with_tolerance(tolerance);
    for id in ids.iter() {
        let rel = model.compare_site(sites_a.get(id), sites_b.get(id));
        debug!(global_id = %id, relationship = ?rel, "Compared call stack");
    }
    let formula = model.finish(&comparison);
    debug!(%formula, "Built scaling model");

    Ok(ScalingModel {
        comparison,
        formula,
        baseline: *model.baseline(),
        target: *model.target(),
        sites: ids.len(),
    })
}

/// Merge a trace's breakdown under the global ids of its call stacks.
///
/// Stacks the mapper does not know are pooled under
/// [`GlobalStackId::UNMAPPED`].
pub fn sites_by_global_id(
    mapper: &StackEquivalenceMapper,
    trace: usize,
    sites: Vec<FunctionSiteAllocation>,
) -> BTreeMap<GlobalStackId, FunctionSiteAllocation> {
    let mut out: BTreeMap<GlobalStackId, FunctionSiteAllocation> = BTreeMap::new();
    for site in sites {
        let global = mapper.global_id(trace, site.stack_id);
        match out.get_mut(&global) {
            Some(merged) => {
                for size in site.allocations {
                    merged.add(size);
                }
            }
            None => {
                out.insert(global, site);
            }
        }
    }
    out
}
