//! On-disk layout of a traced run: one directory per run, one file per rank.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base name of run directories
pub const DEFAULT_RUN_DIR: &str = "HWMTrace";

pub const GRAPH_SUFFIX: &str = ".graph";
pub const FUNCTIONS_SUFFIX: &str = ".functions";

pub fn trace_path<P: AsRef<Path>>(run_dir: P, rank: i32) -> PathBuf {
    run_dir.as_ref().join(format!("trace-{rank}.z"))
}

/// Report file next to a trace, `trace-3.z` becomes `trace-3<suffix>`
pub fn report_path<P: AsRef<Path>>(trace: P, suffix: &str) -> PathBuf {
    let trace = trace.as_ref();
    let stem = trace
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    trace.with_file_name(format!("{stem}{suffix}"))
}

/// Create a fresh run directory.
///
/// Uses `base` itself when it does not exist yet, otherwise the first free
/// `<base>NNNN`.
pub fn create_run_dir<P: AsRef<Path>>(base: P) -> io::Result<PathBuf> {
    let base = base.as_ref();
    let dir = if base.exists() {
        numbered_dirs(base)
            .find(|d| !d.exists())
            .unwrap_or_else(|| base.to_path_buf())
    } else {
        base.to_path_buf()
    };
    fs::create_dir_all(&dir)?;
    debug!(dir = %dir.display(), "Created run directory");
    Ok(dir)
}

/// The most recently created run directory for `base`
pub fn latest_run_dir<P: AsRef<Path>>(base: P) -> PathBuf {
    let base = base.as_ref();
    let mut latest = base.to_path_buf();
    for dir in numbered_dirs(base) {
        if !dir.exists() {
            break;
        }
        latest = dir;
    }
    latest
}

fn numbered_dirs(base: &Path) -> impl Iterator<Item = PathBuf> + '_ {
    (0..10_000).map(move |n| {
        let mut name = base.as_os_str().to_os_string();
        name.push(format!("{n:04}"));
        PathBuf::from(name)
    })
}

/// Trace files of a run, counting consecutive ranks from 0
pub fn discover_traces<P: AsRef<Path>>(run_dir: P) -> Vec<PathBuf> {
    let run_dir = run_dir.as_ref();
    (0..)
        .map(|rank| trace_path(run_dir, rank))
        .take_while(|p| p.exists())
        .collect()
}

/// Split `items` as evenly as possible over `workers`, earlier workers taking
/// the remainder
pub fn partition(workers: usize, items: usize) -> Vec<Range<usize>> {
    if workers == 0 {
        return Vec::new();
    }
    let div = items / workers;
    let rem = items % workers;
    let mut start = 0;
    (0..workers)
        .map(|w| {
            let len = div + usize::from(w < rem);
            let r = start..start + len;
            start += len;
            r
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn trace_and_report_names() {
        let t = trace_path("run", 3);
        assert_eq!(t, PathBuf::from("run/trace-3.z"));
        assert_eq!(report_path(&t, GRAPH_SUFFIX), PathBuf::from("run/trace-3.graph"));
        assert_eq!(
            report_path(&t, FUNCTIONS_SUFFIX),
            PathBuf::from("run/trace-3.functions")
        );
    }

    #[test]
    fn partition_spreads_remainder() {
        assert_eq!(partition(3, 10), vec![0..4, 4..7, 7..10]);
        assert_eq!(partition(4, 2), vec![0..1, 1..2, 2..2, 2..2]);
        assert!(partition(0, 5).is_empty());
    }

    #[test]
    fn run_dirs_are_numbered() {
        let root = std::env::temp_dir().join(format!("hwm-trace-layout-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let base = root.join("run");

        let first = create_run_dir(&base).unwrap();
        assert_eq!(first, base);
        let second = create_run_dir(&base).unwrap();
        assert_eq!(second, root.join("run0000"));
        assert_eq!(latest_run_dir(&base), second);

        fs::write(trace_path(&first, 0), b"").unwrap();
        fs::write(trace_path(&first, 1), b"").unwrap();
        fs::write(trace_path(&first, 3), b"").unwrap();
        assert_eq!(discover_traces(&first).len(), 2);

        fs::remove_dir_all(&root).unwrap();
    }
}
