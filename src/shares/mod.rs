//! Share validation, attribution, and persistence pipeline.

pub mod algorithm;
pub mod pipeline;

pub use algorithm::{AcceptAllAlgorithm, AlgorithmContract, ShareEvaluation};
pub use pipeline::{ShareContext, ShareOutcome, SharePipeline};

