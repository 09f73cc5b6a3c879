//! Configuration module for s3mirror
//!
//! Provides CLI arguments, the JSON config file and runtime settings.

mod settings;

pub use settings::*;
