//! Record, decode and model heap high-water-mark traces.
//!
//! A [`recorder::Tracer`] sits behind the allocator hooks of a traced process
//! and streams allocation events through a [`encoder::TraceEncoder`] into one
//! compressed trace file per rank. [`decoder::TraceDecoder`] replays a trace
//! into an [`analysis::HwmTracker`], and [`analysis`] builds peak reports and
//! cross-run scaling models on top.

pub mod analysis;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod layout;
pub mod recorder;
pub mod stack_table;
pub mod stream;
pub mod symbols;
pub mod time;
pub mod types;
