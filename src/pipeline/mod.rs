//! Document-level building blocks used by the converter and backends.

pub mod detect;
pub mod encode;
pub mod llm;
pub mod pdf;
pub mod postprocess;
pub mod repair;
