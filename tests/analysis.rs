use hwm_trace::{
    analysis::{model::Relationship, workflow::*, *},
    config::TraceConfig,
    decoder::{DecodeOptions, DecodedTrace},
    encoder::TraceEncoder,
    layout,
    symbols::*,
    time::*,
    types::*,
};
use pretty_assertions::assert_eq;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hwm-trace-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// A binary whose functions start at `base`
fn binary(base: i64, names: &[&str]) -> StaticSymbols {
    let mut symbols: Vec<ElfSymbol> = names
        .iter()
        .enumerate()
        .map(|(i, n)| ElfSymbol::new(base + 0x100 * i as i64, *n))
        .collect();
    symbols.push(ElfSymbol::new(base + 0x100 * names.len() as i64, "_end"));
    StaticSymbols::new(2048, symbols)
}

fn no_libraries() -> Vec<FunctionRange> {
    Vec::new()
}

/// Allocation sizes per call stack, the stack given as function indices
/// into the binary, innermost first
struct Site<'a> {
    frames: &'a [i64],
    sizes: &'a [i64],
}

fn write_trace<P: AsRef<Path>>(path: P, run: RunData, base: i64, names: &[&str], sites: &[Site]) {
    let symbols = binary(base, names);
    let file = BufWriter::new(File::create(path).unwrap());
    let mut enc = TraceEncoder::new(file, &run, &symbols).unwrap();
    let delta = TimeDelta::from_secs(0.5);

    // Short lived scratch allocation before the real ones
    enc.record_malloc(Address(0x10), delta, Bytes(8), StackId(0)).unwrap();
    enc.record_free(Address(0x10), delta).unwrap();

    let mut address = 0x10_000;
    for site in sites {
        let stack = site
            .frames
            .iter()
            .map(|f| Address(base + 0x100 * f + 0x10))
            .collect();
        let id = enc.intern_stack(stack).unwrap();
        for size in site.sizes {
            enc.record_malloc(Address(address), delta, Bytes(*size), id)
                .unwrap();
            address += 0x1000;
        }
    }
    enc.finish(&no_libraries).unwrap();
}

const NAMES: &[&str] = &["_init", "main", "setup", "grow", "solve"];

fn encode_in_memory(base: i64, names: &[&str], frames: &[i64]) -> DecodedTrace {
    let symbols = binary(base, names);
    let mut enc = TraceEncoder::new(Vec::new(), &RunData::serial(), &symbols).unwrap();
    let stack = frames.iter().map(|f| Address(base + 0x100 * f + 0x10)).collect();
    let id = enc.intern_stack(stack).unwrap();
    enc.record_malloc(Address(0x100), TimeDelta::zero(), Bytes(64), id)
        .unwrap();
    let bytes = enc.finish(&no_libraries).unwrap();
    DecodedTrace::from_reader(Cursor::new(bytes), DecodeOptions::symbolic())
}

#[test_log::test]
fn stacks_map_by_name_not_address() {
    // Same binary loaded at different addresses
    let a = encode_in_memory(0x1000, NAMES, &[3, 1]);
    let b = encode_in_memory(0x9000, NAMES, &[3, 1]);
    assert_ne!(a.call_stack(StackId(0)), b.call_stack(StackId(0)));

    // Same addresses, different functions
    let c = encode_in_memory(0x1000, &["_init", "main", "setup", "shrink"], &[3, 1]);

    let mapper = StackEquivalenceMapper::new(&[a, b, c]);
    assert_eq!(mapper.trace_count(), 3);
    assert_eq!(mapper.global_id(0, StackId(0)), GlobalStackId(1));
    assert_eq!(mapper.global_id(1, StackId(0)), GlobalStackId(1));
    assert_eq!(mapper.global_id(2, StackId(0)), GlobalStackId(2));
    assert_eq!(
        mapper.call_stack(GlobalStackId(1)),
        Some(&[SymbolName::new("grow"), SymbolName::new("main")][..])
    );
}

#[test_log::test]
fn peak_analysis_and_reports() {
    let dir = scratch_dir("peak");
    let path = layout::trace_path(&dir, 0);
    write_trace(
        &path,
        RunData::serial(),
        0x1000,
        NAMES,
        &[
            Site {
                frames: &[2, 1],
                sizes: &[1024],
            },
            Site {
                frames: &[3, 1],
                sizes: &[256, 256, 512],
            },
        ],
    );

    let analysis = analyze_peak(&path).unwrap();
    assert_eq!(analysis.hwm().peak_bytes, Bytes(2048));
    assert_eq!(analysis.at_peak.tracker.live_bytes(), Bytes(2048));
    assert!(analysis.at_peak.search_reached);

    let sites = analysis.function_breakdown();
    assert_eq!(sites.len(), 2);
    assert_eq!(sites[0].bytes, Bytes(1024));
    assert_eq!(sites[0].count(), 1);
    assert_eq!(sites[1].count(), 3);
    assert_eq!(
        analysis.call_stack(&sites[1]),
        vec![SymbolName::new("grow"), SymbolName::new("main")]
    );

    let functions = analysis.write_functions_report(&path).unwrap();
    assert_eq!(functions, dir.join("trace-0.functions"));
    let text = fs::read_to_string(&functions).unwrap();
    assert!(text.starts_with("# High water mark of 2048(B)\n"));
    assert!(text.contains("Call Stack: 1 Allocated 1024(B) (50.00%) from 3 allocations\ngrow\n-main\n"));

    let graph = analysis.write_graph_report(&path).unwrap();
    assert_eq!(graph, dir.join("trace-0.graph"));
    assert!(!analysis.consumption_graph().is_empty());

    fs::remove_dir_all(&dir).unwrap();
}

#[test_log::test]
fn post_processing_follows_the_config() {
    let dir = scratch_dir("post");
    let path = layout::trace_path(&dir, 0);
    write_trace(
        &path,
        RunData::serial(),
        0x1000,
        NAMES,
        &[Site {
            frames: &[4, 1],
            sizes: &[4096],
        }],
    );

    assert!(post_process(&path, &TraceConfig::default()).unwrap().is_none());

    let config = TraceConfig::parse("post-process-functions\n").unwrap();
    let analysis = post_process(&path, &config).unwrap().unwrap();
    assert_eq!(analysis.hwm().peak_bytes, Bytes(4096));
    assert!(dir.join("trace-0.functions").exists());
    assert!(!dir.join("trace-0.graph").exists());

    fs::remove_dir_all(&dir).unwrap();
}

#[test_log::test]
fn run_summary_over_ranks() {
    let dir = scratch_dir("run");
    for (rank, size) in [90, 110, 100].into_iter().enumerate() {
        write_trace(
            layout::trace_path(&dir, rank as i32),
            RunData::new(rank as i32, 3, "node"),
            0x1000,
            NAMES,
            &[Site {
                frames: &[1],
                sizes: &[size],
            }],
        );
    }

    let run = analyze_run(&dir, 2).unwrap();
    assert_eq!(run.traces.len(), 3);
    let peaks: Vec<Bytes> = run.peaks.iter().map(|p| p.peak_bytes).collect();
    assert_eq!(peaks, vec![Bytes(90), Bytes(110), Bytes(100)]);
    assert_eq!(run.summary.max_rank, 1);
    assert_eq!(run.summary.min_rank, 0);
    assert_eq!(run.summary.standard_deviation, 10.0);
    assert_eq!(run.summary.static_memory, Bytes(2048));

    let empty = scratch_dir("run-empty");
    assert!(matches!(analyze_run(&empty, 2), Err(Error::NoTraces(_))));

    fs::remove_dir_all(&dir).unwrap();
    fs::remove_dir_all(&empty).unwrap();
}

#[test_log::test]
fn scaling_model_from_two_runs() {
    let dir = scratch_dir("model");
    let baseline = dir.join("baseline.z");
    let target = dir.join("target.z");

    // 2 ranks on a 100x100 grid
    write_trace(
        &baseline,
        RunData::new(0, 2, "node"),
        0x1000,
        NAMES,
        &[
            Site {
                frames: &[2, 1],
                sizes: &[1000],
            },
            Site {
                frames: &[3, 1],
                sizes: &[400],
            },
            Site {
                frames: &[4, 1],
                sizes: &[600],
            },
        ],
    );
    // 4 ranks on the same grid, loaded elsewhere
    write_trace(
        &target,
        RunData::new(0, 4, "node"),
        0x40_000,
        NAMES,
        &[
            Site {
                frames: &[4, 1],
                sizes: &[300],
            },
            Site {
                frames: &[2, 1],
                sizes: &[1000],
            },
            Site {
                frames: &[3, 1],
                sizes: &[800],
            },
        ],
    );

    let model = build_scaling_model(
        &RunInput::new(&baseline, [100, 100, 1], [2, 1, 1]),
        &RunInput::new(&target, [100, 100, 1], [2, 2, 1]),
        ConsumptionModel::DEFAULT_TOLERANCE,
    )
    .unwrap();

    assert_eq!(model.sites, 3);
    assert_eq!(model.comparison.ratios.rank, Some(2.0));
    assert_eq!(model.comparison.ratios.problem, Some(0.5));
    assert_eq!(model.target.direct, Bytes(1000));
    assert_eq!(model.target.core, Bytes(800));
    assert_eq!(model.target.problem, Bytes(300));
    assert_eq!(model.target.unmatched, Bytes(0));
    assert_eq!(model.formula.direct, 1000.0);
    assert_eq!(model.formula.per_core, 200.0);
    assert_eq!(model.formula.per_problem, 300.0 / 2500.0);
    assert_eq!(model.formula.per_ghost, None);

    fs::remove_dir_all(&dir).unwrap();
}

#[test_log::test]
fn relationships_in_band_order() {
    let mut model = ConsumptionModel::new(ScalingRatios {
        rank: Some(1.02),
        ..Default::default()
    });
    // Within 5 % of both 1.0 and the rank ratio, direct wins
    assert_eq!(
        model.hazy_match(Bytes(100), Bytes(102), 5.0),
        Some(Relationship::Direct)
    );
    assert_eq!(model.hazy_match(Bytes(100), Bytes(105), 5.0), Some(Relationship::Direct));
    assert_eq!(model.hazy_match(Bytes(100), Bytes(106), 5.0), Some(Relationship::Core));
    assert_eq!(model.hazy_match(Bytes(100), Bytes(120), 5.0), None);
}
