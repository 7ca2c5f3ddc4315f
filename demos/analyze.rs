use clap::Parser;
use hwm_trace::{
    analysis::{analyze_peak, analyze_run},
    layout,
};
use std::path::PathBuf;
use tabular::{Row, Table};

/// Report the memory high water mark of a trace, or of every rank in a run
#[derive(Parser, Debug, Clone)]
#[clap(name = "analyze", version, about, long_about = None)]
pub struct Opts {
    /// Print the memory live at the peak, per call stack
    #[clap(long)]
    pub functions: bool,

    /// Print the consumption graph
    #[clap(long)]
    pub graph: bool,

    /// Write the .functions and .graph reports next to the trace
    #[clap(long)]
    pub write_reports: bool,

    /// Decoding threads when analyzing a run directory
    #[clap(long, default_value_t = 4, value_parser = workers)]
    pub workers: usize,

    /// Path to a trace file or a run directory, defaults to the latest run
    #[clap(value_parser)]
    pub path: Option<PathBuf>,
}

fn workers(s: &str) -> Result<usize, String> {
    clap_num::number_range(s, 1, 256)
}

fn main() {
    match do_main() {
        Ok(()) => (),
        Err(e) => {
            eprintln!("{e}");
            let mut cause = e.source();
            while let Some(err) = cause {
                eprintln!("Caused by: {err}");
                cause = err.source();
            }
            std::process::exit(exitcode::SOFTWARE);
        }
    }
}

fn do_main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();

    reset_signal_pipe_handler()?;

    try_init_tracing_subscriber()?;

    let path = opts
        .path
        .unwrap_or_else(|| layout::latest_run_dir(layout::DEFAULT_RUN_DIR));

    if path.is_dir() {
        let run = analyze_run(&path, opts.workers)?;
        let mut table = Table::new("{:>}  {:>}  {:>}  {:<}");
        table.add_row(
            Row::new()
                .with_cell("rank")
                .with_cell("peak (B)")
                .with_cell("time (s)")
                .with_cell("trace"),
        );
        for (rank, (hwm, path)) in run.peaks.iter().zip(run.traces.iter()).enumerate() {
            table.add_row(
                Row::new()
                    .with_cell(rank)
                    .with_cell(hwm.peak_bytes)
                    .with_cell(hwm.peak_time)
                    .with_cell(path.display()),
            );
        }
        print!("{table}");
        println!("{}", run.summary);
        return Ok(());
    }

    let analysis = analyze_peak(&path)?;
    let trace = &analysis.full;
    println!("Run: {}", trace.run);
    println!("Trace ended with {}", trace.end);
    println!("High water mark: {}", analysis.hwm());
    println!("Static memory: {}(B)", trace.static_memory);
    println!("Elapsed: {} s", trace.elapsed());

    if opts.functions {
        let sites = analysis.function_breakdown();
        let mut table = Table::new("{:>}  {:>}  {:>}  {:<}");
        table.add_row(
            Row::new()
                .with_cell("stack")
                .with_cell("bytes")
                .with_cell("allocations")
                .with_cell("call stack"),
        );
        for site in sites.iter() {
            let frames: Vec<String> = analysis
                .call_stack(site)
                .iter()
                .map(ToString::to_string)
                .collect();
            table.add_row(
                Row::new()
                    .with_cell(site.stack_id)
                    .with_cell(site.bytes)
                    .with_cell(site.count())
                    .with_cell(frames.join(" <- ")),
            );
        }
        print!("{table}");
    }

    if opts.graph {
        for row in analysis.consumption_graph() {
            println!("{row}");
        }
    }

    if opts.write_reports {
        let functions = analysis.write_functions_report(&path)?;
        let graph = analysis.write_graph_report(&path)?;
        println!("Wrote {} and {}", functions.display(), graph.display());
    }

    Ok(())
}

fn try_init_tracing_subscriber() -> Result<(), Box<dyn std::error::Error>> {
    let builder = tracing_subscriber::fmt::Subscriber::builder();
    let env_filter = std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV)
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                tracing::Level::WARN
            ))
        });
    let builder = builder.with_env_filter(env_filter);
    let subscriber = builder.finish();
    use tracing_subscriber::util::SubscriberInitExt;
    subscriber.try_init()?;
    Ok(())
}

// Used to prevent panics on broken pipes.
// See:
//   https://github.com/rust-lang/rust/issues/46016#issuecomment-605624865
fn reset_signal_pipe_handler() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    {
        use nix::sys::signal;

        unsafe {
            signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigDfl)?;
        }
    }

    Ok(())
}
