pub mod batch;
pub mod classify;
pub mod config;
pub mod distribute;
pub mod engine;
pub mod errors;
pub mod generate;
pub mod model;
pub mod pipeline;
pub mod providers;
pub mod report;
pub mod tap;
pub mod triage;
