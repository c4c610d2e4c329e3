//! Durable state shared across case evaluations.
//!
//! Rule bodies and example cases are injected as trait objects so the
//! evaluator and optimizer never touch a process-wide singleton; tests swap
//! in doubles, production wires the filesystem implementations.

pub mod examples;
pub mod rules;

pub use examples::{ExampleStore, JsonExampleStore};
pub use rules::{FsRuleStore, RuleStore};
