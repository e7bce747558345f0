//! Terraform generation.
//!
//! A request flows through [`pipeline::PipelineOrchestrator`]: retrieve
//! reference context, build a prompt, call an LLM, split the reply into
//! files, validate them and let the correction loop fix what it can.
//! Validation, diffing and best-practice review are also usable on their own.

pub mod best_practices;
pub mod clarify;
pub mod context;
pub mod corrector;
pub mod diff;
pub mod llm;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod validator;

pub use models::{GenerationRequest, GenerationResult, Scenario};
pub use pipeline::{PipelineOrchestrator, PipelineSettings};
