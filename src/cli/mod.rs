//! Storage CLI plumbing
//!
//! - [`runner`]: spawn one external command and capture its outcome
//! - [`invoker`]: the resilient retry protocol around the control process
//! - [`parser`]: typed field extraction from fixed-format command output

pub mod invoker;
pub mod parser;
pub mod runner;
