use clap::Parser;
use hwm_trace::{
    analysis::post_process,
    config::TraceConfig,
    layout,
    recorder::Tracer,
    symbols::{ElfSymbol, FunctionRange, StaticSymbols},
    types::{Address, RunData},
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Write a run of synthetic traces through the recorder
#[derive(Parser, Debug, Clone)]
#[clap(name = "synthesize", version, about, long_about = None)]
pub struct Opts {
    /// Number of ranks to write
    #[clap(long, default_value_t = 4, value_parser = ranks)]
    pub ranks: u32,

    /// Allocations per rank
    #[clap(long, default_value_t = 10_000)]
    pub allocations: u32,

    /// Bytes every rank allocates per rank in the run, modelling per core
    /// buffers
    #[clap(long, default_value_t = 4096)]
    pub per_rank: usize,

    /// Seed of the allocation pattern
    #[clap(long, default_value = "0x2545F491", value_parser = clap_num::maybe_hex::<u64>)]
    pub seed: u64,

    /// Base name of the run directory
    #[clap(long, default_value = layout::DEFAULT_RUN_DIR)]
    pub dir: PathBuf,
}

fn ranks(s: &str) -> Result<u32, String> {
    clap_num::number_range(s, 1, 4096)
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

const FUNCTIONS: &[&str] = &["_init", "main", "setup", "exchange", "solve", "_end"];
const LIBC_BASE: i64 = 0x7f00_0000_0000;

fn binary() -> StaticSymbols {
    let symbols = FUNCTIONS
        .iter()
        .enumerate()
        .map(|(i, name)| ElfSymbol::new(0x40_0000 + 0x1000 * i as i64, *name))
        .collect();
    StaticSymbols::new(64 * 1024, symbols)
}

fn libraries() -> Vec<FunctionRange> {
    vec![
        FunctionRange::new(LIBC_BASE, LIBC_BASE + 0x1000, "malloc"),
        FunctionRange::new(LIBC_BASE + 0x1000, LIBC_BASE + 0x2000, "calloc"),
    ]
}

/// Return address inside the static function at `index`
fn frame(index: usize) -> Address {
    Address(0x40_0000 + 0x1000 * index as i64 + 0x42)
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

fn do_main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = Opts::parse();

    reset_signal_pipe_handler()?;

    tracing_subscriber::fmt::init();

    let mut config = TraceConfig::load()?;
    config.complex = true;

    let run_dir = layout::create_run_dir(&opts.dir)?;
    let symbols = binary();
    let mut rng = Lcg(opts.seed);

    for rank in 0..opts.ranks {
        let run = RunData::new(rank as i32, opts.ranks as i32, format!("node{}", rank / 16));

        // Call site of the current allocation, read by the unwinder
        let site = Arc::new(AtomicUsize::new(2));
        let unwinder_site = Arc::clone(&site);
        let tracer = Tracer::create(&run_dir, &run, &symbols, &config)?.with_unwinder(move || {
            vec![
                Address(LIBC_BASE + 0x10),
                frame(unwinder_site.load(Ordering::Relaxed)),
                frame(1),
            ]
        });
        tracer.start();

        let mut next_address = 0x1000_0000_i64;
        let mut alloc = |size: usize| {
            let address = Address(next_address);
            next_address += size as i64 + 16;
            address
        };

        // Constant setup memory plus per core buffers
        site.store(2, Ordering::Relaxed);
        let setup = alloc(1 << 20);
        tracer.malloc(1 << 20, || setup);
        site.store(3, Ordering::Relaxed);
        let size = opts.per_rank * opts.ranks as usize;
        let exchange = alloc(size);
        tracer.calloc(opts.per_rank, opts.ranks as usize, || exchange);

        // Solver churn, shrinking with the rank count
        site.store(4, Ordering::Relaxed);
        let mut live: Vec<Address> = Vec::new();
        for _ in 0..opts.allocations {
            if !live.is_empty() && rng.next() % 3 == 0 {
                let idx = rng.next() as usize % live.len();
                let address = live.swap_remove(idx);
                tracer.free(address, || ());
            } else if !live.is_empty() && rng.next() % 7 == 0 {
                let idx = rng.next() as usize % live.len();
                let size = 256 + (rng.next() % 4096) as usize / opts.ranks as usize;
                let moved = alloc(size);
                live[idx] = tracer.realloc(live[idx], size, || moved);
            } else {
                let size = 256 + (rng.next() % 65_536) as usize / opts.ranks as usize;
                let address = alloc(size);
                live.push(tracer.malloc(size, || address));
            }
        }

        info!(rank, counters = %tracer.counters(), "Finished rank");
        tracer.finish(&libraries)?;

        let trace = layout::trace_path(&run_dir, rank as i32);
        if let Some(analysis) = post_process(&trace, &config)? {
            info!(rank, hwm = %analysis.hwm(), "Post processed");
        }
    }

    println!("Wrote {} traces to {}", opts.ranks, run_dir.display());
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
