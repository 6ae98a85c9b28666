//! Shared runtime configuration.
//!
//! This module introduces types to facilitate the configuration of the host
//! side pipeline context and of worker processes.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes to allow easy setup via command-line arguments.
//! - [`Serializer`]: Specifies the serialization format used for function
//!   payloads and data batches.
//!
//! # Usage:
//! Binaries flatten [`Config`] into their own CLI. The host side passes it to
//! [`Context::new`](crate::pipeline::Context::new); workers pass it to
//! [`WorkerRuntime::from_config`](crate::worker::WorkerRuntime::from_config).

use clap::{Args, ValueEnum};

const DEFAULT_COLLECT_HOST: &str = "127.0.0.1";
const DEFAULT_BATCH_SIZE: usize = 1024;
const DEFAULT_RESULT_TIMEOUT_MS: u64 = 15_000;
const HELP_HEADING: &str = "Spindle options";

/// Represents the main configuration structure.
#[derive(Args, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Config {
    /// Determines the serialization format of function payloads and batches.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Host of the result servers the engine opens for collection calls.
    #[arg(long, help_heading = HELP_HEADING, env = "SPINDLE_COLLECT_HOST", default_value = DEFAULT_COLLECT_HOST)]
    pub collect_host: String,

    /// Maximum number of records per output frame produced by a worker.
    #[arg(long, short, help_heading = HELP_HEADING, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// How long a result server waits for its collector to connect, in
    /// milliseconds.
    #[arg(long, help_heading = HELP_HEADING, env = "SPINDLE_RESULT_TIMEOUT_MS", default_value_t = DEFAULT_RESULT_TIMEOUT_MS)]
    pub result_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serializer: Default::default(),
            collect_host: DEFAULT_COLLECT_HOST.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            result_timeout_ms: DEFAULT_RESULT_TIMEOUT_MS,
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}
