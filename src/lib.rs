pub mod config;
pub mod core;
pub mod error;
pub mod handoff;
pub mod log;
pub mod orchestration;
pub mod store;

pub use error::{Error, Result};
