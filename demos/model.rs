use clap::Parser;
use hwm_trace::analysis::{build_scaling_model, ConsumptionModel, RunInput};
use std::path::PathBuf;
use tabular::{Row, Table};

/// Fit a memory scaling formula from the peaks of two runs
#[derive(Parser, Debug, Clone)]
#[clap(name = "model", version, about, long_about = None)]
pub struct Opts {
    /// Global problem dimensions of the baseline run, e.g. 100,100
    #[clap(long, value_delimiter = ',', num_args = 1..=3, required = true)]
    pub baseline_problem: Vec<u64>,

    /// Ranks along each problem dimension of the baseline run
    #[clap(long, value_delimiter = ',', num_args = 1..=3)]
    pub baseline_decomposition: Vec<u32>,

    /// Global problem dimensions of the target run
    #[clap(long, value_delimiter = ',', num_args = 1..=3, required = true)]
    pub target_problem: Vec<u64>,

    /// Ranks along each problem dimension of the target run
    #[clap(long, value_delimiter = ',', num_args = 1..=3)]
    pub target_decomposition: Vec<u32>,

    /// Band half width in percent
    #[clap(long, default_value_t = ConsumptionModel::DEFAULT_TOLERANCE)]
    pub tolerance: f64,

    /// Evaluate the formula at this many cores
    #[clap(long, value_parser = cores)]
    pub cores: Option<u32>,

    /// Trace of the baseline run
    #[clap(value_parser)]
    pub baseline: PathBuf,

    /// Trace of the target run
    #[clap(value_parser)]
    pub target: PathBuf,
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

fn cores(s: &str) -> Result<u32, String> {
    clap_num::number_range(s, 1, u32::MAX)
}

fn dims<T: Copy>(values: &[T], fill: T) -> [T; 3] {
    let mut out = [fill; 3];
    for (o, v) in out.iter_mut().zip(values.iter()) {
        *o = *v;
    }
    out
}

fn do_main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();

    reset_signal_pipe_handler()?;

    tracing_subscriber::fmt::init();

    let baseline = RunInput::new(
        &opts.baseline,
        dims(&opts.baseline_problem, 1),
        dims(&opts.baseline_decomposition, 1),
    );
    let target = RunInput::new(
        &opts.target,
        dims(&opts.target_problem, 1),
        dims(&opts.target_decomposition, 1),
    );
    let model = build_scaling_model(&baseline, &target, opts.tolerance)?;

    let ratio = |r: Option<f64>| r.map_or_else(|| "disabled".to_owned(), |r| format!("{r:.4}"));
    let r = &model.comparison.ratios;
    let table = Table::new("{:<}  {:>}")
        .with_row(Row::new().with_cell("rank ratio").with_cell(ratio(r.rank)))
        .with_row(
            Row::new()
                .with_cell("exclusive rank ratio")
                .with_cell(ratio(r.exclusive_rank)),
        )
        .with_row(Row::new().with_cell("problem ratio").with_cell(ratio(r.problem)))
        .with_row(Row::new().with_cell("ghost ratio").with_cell(ratio(r.ghost)))
        .with_row(Row::new().with_cell("call stacks").with_cell(model.sites));
    print!("{table}");

    println!("Baseline: {}", model.baseline);
    println!("Target:   {}", model.target);
    println!("{}", model.formula);

    if let Some(cores) = opts.cores {
        let problem: u64 = dims(&opts.target_problem, 1).iter().product();
        let y = model.formula.evaluate(
            f64::from(cores),
            problem as f64,
            model.comparison.target_ghost_cells,
        );
        println!("Y({cores}, {problem}) = {y:.0}(B)");
    }

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
