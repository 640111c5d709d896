pub mod evaluator;

pub use evaluator::Evaluator;
