//! Analysis of decoded traces: peak tracking, cross-trace stack mapping,
//! the scaling model and the reports built on them.

pub use hwm::{FunctionSiteAllocation, HwmRecord, HwmTracker};
pub use mapper::{GlobalStackId, StackEquivalenceMapper};
pub use model::{ConsumptionModel, Formula, Relationship, RunScale, ScaleComparison, ScalingRatios};
pub use report::RunSummary;
pub use workflow::{
    analyze_peak, analyze_run, build_scaling_model, post_process, PeakAnalysis, RunInput,
};

pub mod hwm;
pub mod mapper;
pub mod model;
pub mod report;
pub mod workflow;
