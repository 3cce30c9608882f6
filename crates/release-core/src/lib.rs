pub mod admission;
pub mod app;
pub mod chart;
pub mod helm;
pub mod lineage;
pub mod orchestrator;
pub mod staging;
pub mod state;
pub mod sync;
pub mod workload;

pub use orchestrator::Orchestrator;
