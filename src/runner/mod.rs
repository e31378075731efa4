//! ベンチマークと監査

pub mod audit;
pub mod benchmark;

pub use audit::{run_audit, AuditReport};
pub use benchmark::{run_benchmark, BenchmarkReport};
