// Core types and functionality for Herald notification orchestration

pub mod cache;
pub mod digest;
pub mod error;
pub mod lock;
pub mod preferences;
pub mod storage;
pub mod tier;
pub mod types;

pub use error::{HeraldError, HeraldResult, Violation};
pub use types::*;
