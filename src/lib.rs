pub mod completion;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod quality;
pub mod session;
pub mod store;
pub mod workflow;
pub mod workspace;

pub use crate::core::{Task, TaskGraph, TaskId, TaskStatus};
pub use error::{Error, Result};
