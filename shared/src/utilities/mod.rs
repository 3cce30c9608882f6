pub mod config;
pub mod errors;
pub mod instrumentation;
pub mod names;
