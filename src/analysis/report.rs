//! Plain text reports produced from a decoded trace or a whole run.

use crate::analysis::hwm::{ConsumptionLog, FunctionSiteAllocation};
use crate::time::ElapsedTime;
use crate::types::{Bytes, SymbolName};
use std::fmt;
use std::io::{self, Write};

/// Graph rows are kept when they move by more than `1 / GRAPH_RESOLUTION`
/// of the static plus peak memory
pub const GRAPH_RESOLUTION: i64 = 1024;

/// Write the per-site breakdown of the memory live at the peak.
///
/// `call_stack` resolves a site's stack id to its frames, innermost first.
pub fn write_function_breakdown<W, F>(
    mut w: W,
    peak: Bytes,
    sites: &[FunctionSiteAllocation],
    mut call_stack: F,
) -> io::Result<()>
where
    W: Write,
    F: FnMut(&FunctionSiteAllocation) -> Vec<SymbolName>,
{
    writeln!(w, "# High water mark of {peak}(B)")?;
    writeln!(w, "# Function breakdown")?;
    for site in sites.iter() {
        writeln!(
            w,
            "Call Stack: {} Allocated {}(B) ({:.2}%) from {} allocations",
            site.stack_id,
            site.bytes,
            percent(site.bytes.0 as f64, peak.0 as f64),
            site.count()
        )?;
        for (depth, frame) in call_stack(site).iter().enumerate() {
            writeln!(w, "{}{frame}", "-".repeat(depth))?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// One point of the consumption graph
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug)]
pub struct ConsumptionRow {
    pub time: ElapsedTime,
    /// Share of the total trace time
    pub time_percent: f64,
    /// Static plus live heap memory
    pub megabytes: f64,
}

impl fmt::Display for ConsumptionRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}",
            self.time.as_secs(),
            self.time_percent,
            self.megabytes
        )
    }
}

/// Thin the consumption log into graph rows.
///
/// A row is emitted when the live heap differs from the last emitted row by
/// more than `(static_memory + peak) / GRAPH_RESOLUTION` bytes.
pub fn consumption_graph(
    log: &ConsumptionLog,
    static_memory: Bytes,
    peak: Bytes,
    total: ElapsedTime,
) -> Vec<ConsumptionRow> {
    let limit = (static_memory.0 + peak.0) / GRAPH_RESOLUTION;
    let mut last = 0;
    let mut rows = Vec::new();
    for (time, live) in log.entries() {
        if (live.0 - last).abs() > limit {
            rows.push(ConsumptionRow {
                time: *time,
                time_percent: percent(time.as_secs(), total.as_secs()),
                megabytes: (static_memory + *live).as_megabytes(),
            });
            last = live.0;
        }
    }
    rows
}

pub fn write_consumption_graph<W: Write>(mut w: W, rows: &[ConsumptionRow]) -> io::Result<()> {
    writeln!(w, "# <time (s)> <time (%)> <memory (MB)>")?;
    for row in rows.iter() {
        writeln!(w, "{row}")?;
    }
    Ok(())
}

/// Peak memory across the ranks of one run
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug)]
pub struct RunSummary {
    pub ranks: usize,
    pub max: Bytes,
    pub max_rank: usize,
    pub min: Bytes,
    pub min_rank: usize,
    pub standard_deviation: f64,
    pub static_memory: Bytes,
}

impl RunSummary {
    /// `peaks` is indexed by rank, `None` when empty
    pub fn new(peaks: &[Bytes], static_memory: Bytes) -> Option<Self> {
        let first = *peaks.first()?;
        let mut summary = Self {
            ranks: peaks.len(),
            max: first,
            max_rank: 0,
            min: first,
            min_rank: 0,
            standard_deviation: 0.0,
            static_memory,
        };
        for (rank, peak) in peaks.iter().enumerate().skip(1) {
            if *peak > summary.max {
                summary.max = *peak;
                summary.max_rank = rank;
            }
            if *peak < summary.min {
                summary.min = *peak;
                summary.min_rank = rank;
            }
        }
        let values: Vec<f64> = peaks.iter().map(|p| p.0 as f64).collect();
        summary.standard_deviation = standard_deviation(&values);
        Some(summary)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Max memory {}(B) (rank {})", self.max, self.max_rank)?;
        writeln!(f, "Min memory {}(B) (rank {})", self.min, self.min_rank)?;
        writeln!(f, "Standard deviation {:.2}(B)", self.standard_deviation)?;
        write!(f, "Static memory {}(B)", self.static_memory)
    }
}

/// Sample standard deviation, 0 for fewer than two values
pub fn standard_deviation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (n - 1.0)).sqrt()
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::StackId;
    use pretty_assertions::assert_eq;

    #[test]
    fn sample_standard_deviation() {
        assert_eq!(standard_deviation(&[100.0, 100.0, 100.0]), 0.0);
        assert_eq!(standard_deviation(&[90.0, 100.0, 110.0]), 10.0);
        assert_eq!(standard_deviation(&[42.0]), 0.0);
        assert_eq!(standard_deviation(&[]), 0.0);
    }

    #[test]
    fn run_summary_ranks() {
        let s = RunSummary::new(&[Bytes(90), Bytes(110), Bytes(100), Bytes(80)], Bytes(7)).unwrap();
        assert_eq!(s.max, Bytes(110));
        assert_eq!(s.max_rank, 1);
        assert_eq!(s.min, Bytes(80));
        assert_eq!(s.min_rank, 3);
        assert_eq!(s.ranks, 4);
        assert!(RunSummary::new(&[], Bytes(0)).is_none());
    }

    #[test]
    fn breakdown_text() {
        let mut site = FunctionSiteAllocation::new(StackId(4));
        site.add(Bytes(192));
        site.add(Bytes(64));
        let mut out = Vec::new();
        write_function_breakdown(&mut out, Bytes(1024), &[site], |_| {
            ["malloc", "grow", "main"]
                .into_iter()
                .map(SymbolName::new)
                .collect()
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# High water mark of 1024(B)\n\
             # Function breakdown\n\
             Call Stack: 4 Allocated 256(B) (25.00%) from 2 allocations\n\
             malloc\n\
             -grow\n\
             --main\n\
             \n"
        );
    }

    #[test]
    fn graph_is_thinned() {
        let mut log = ConsumptionLog::new();
        log.record(ElapsedTime::from_secs(0.0), Bytes(0));
        log.record(ElapsedTime::from_secs(1.0), Bytes(4096));
        log.record(ElapsedTime::from_secs(2.0), Bytes(6000));
        log.record(ElapsedTime::from_secs(4.0), Bytes(1000));
        // Limit is (0 + 2_097_152) / 1024 = 2048
        let rows = consumption_graph(&log, Bytes(0), Bytes(2 * 1024 * 1024), ElapsedTime::from_secs(4.0));
        let times: Vec<f64> = rows.iter().map(|r| r.time.as_secs()).collect();
        assert_eq!(times, vec![1.0, 4.0]);
        assert_eq!(rows[0].time_percent, 25.0);
        assert_eq!(rows[1].megabytes, 1000.0 / (1024.0 * 1024.0));
    }
}
