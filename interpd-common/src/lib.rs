//! # interpd Common Library
//!
//! Shared code for the interpreter assignment engine:
//! - Error taxonomy and result type
//! - Clock abstraction (deterministic time in tests)
//! - Configuration loading
//! - Database schema, row models, and the advisory lock primitive
//! - Structured audit events and the event bus

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
