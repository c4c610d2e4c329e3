pub mod batch;
pub mod evaluator;

pub use batch::{BatchCase, BatchRunner, CaseResultRow, CaseStatus};
pub use evaluator::{CancelFlag, EvalOptions, Evaluator};
