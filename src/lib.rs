pub mod analyst;
pub mod config;
pub mod extract;
pub mod llm;
pub mod repair;
pub mod sandbox;
pub mod security;

pub use analyst::{stage_upload, Analyst, AnalystError, StagedFile};
pub use repair::{LoopState, RepairLoop, RepairReport, Termination};
