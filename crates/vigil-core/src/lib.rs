//! `vigil-core`: configuration and error types shared by the vigil crates.

pub mod config;
pub mod error;

pub use config::VigilConfig;
pub use error::{Result, VigilError};
