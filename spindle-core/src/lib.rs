#![cfg_attr(docsrs, feature(doc_cfg))]

//! Function pipelining and a binary wire protocol for remote partition
//! processing.
//!
//! Spindle lets a host program describe per-partition transformations of a
//! dataset held by a remote engine, and ships those transformations to worker
//! processes as plain bytes.
//!
//! Features:
//! - **Fusion**: consecutive transformations are composed into one function,
//!   so a whole chain crosses the process boundary, and is (de)serialized,
//!   once.
//! - **Laziness**: composed functions stream elements through every stage on
//!   demand; no intermediate partition is ever materialized.
//! - **No closures on the wire**: transformations are serializable values
//!   that belong to a registry enum, so workers rebuild them from data.
//! - **Bit-exact wire format**: big-endian primitives and length-prefixed
//!   frames, readable from any blocking byte stream.
//!
//! # How to use Spindle
//!
//! ## Defining transformations
//!
//! A transformation implements
//! [`PartitionFn`](crate::transform::PartitionFn): given a partition index
//! and a lazy stream of elements, it returns a new lazy stream.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use spindle::transform::{FnKind, PartitionFn, PartitionStream};
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! struct Square;
//!
//! impl PartitionFn for Square {
//!     type Input = i64;
//!     type Output = i64;
//!     // Associate the transformation with the registry type.
//!     type Kind = MyFns;
//!
//!     fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
//!         Box::new(input.map(|v| v.map(|v| v * v)))
//!     }
//! }
//!
//! // Declare the registry.
//! #[derive(FnKind, Serialize, Deserialize, Debug, Clone, Copy)]
//! enum MyFns {
//!     Square(Square),
//! }
//! ```
//!
//! ### Function registry
//!
//! Workers can only run transformations they know how to decode. Every
//! transformation is therefore listed in a registry enum whose variants are
//! single tuple structs wrapping it. `#[derive(FnKind)]` wires up decoding of
//! input batches, erased application and encoding of output batches for
//! every variant.
//!
//! ## Building a pipeline
//!
//! A [`Context`](crate::pipeline::Context) connects pipelines to a
//! [`RemoteEngine`](crate::engine::RemoteEngine).
//! [`LocalEngine`](crate::engine::LocalEngine) runs everything in process,
//! which is useful for tests and local development.
//!
//! ```
//! # use serde::{Deserialize, Serialize};
//! # use spindle::transform::{FnKind, PartitionFn, PartitionStream};
//! #
//! # #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! # struct Square;
//! #
//! # impl PartitionFn for Square {
//! #     type Input = i64;
//! #     type Output = i64;
//! #     type Kind = MyFns;
//! #
//! #     fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
//! #         Box::new(input.map(|v| v.map(|v| v * v)))
//! #     }
//! # }
//! #
//! # #[derive(FnKind, Serialize, Deserialize, Debug, Clone, Copy)]
//! # enum MyFns {
//! #     Square(Square),
//! # }
//! use spindle::{config::Config, engine::LocalEngine, pipeline::Context};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::default();
//! let context = Context::new(LocalEngine::<MyFns>::from_config(&config), &config);
//!
//! let squares = context
//!     .parallelize(vec![vec![1i64, 2], vec![3, 4]])?
//!     .map_partitions(Square)
//!     .map_partitions(Square);
//!
//! // Both stages run as one fused function.
//! assert_eq!(squares.stage_count(), 2);
//! assert_eq!(squares.collect()?, vec![1, 16, 81, 256]);
//! # Ok(())
//! # }
//! ```
//!
//! Calling [`cache`](crate::pipeline::Pipeline::cache) or
//! [`checkpoint`](crate::pipeline::Pipeline::checkpoint) ends fusion at that
//! node: later appends start a new stage that reads its materialized output.
//!
//! ## Application and deployment architecture
//!
//! We suggest the following project layout:
//! ```bash
//! ops
//! ├── Cargo.toml
//! └── src
//!    └── lib.rs
//! worker
//! ├── Cargo.toml
//! └── src
//!    └── main.rs
//! ```
//!
//! - `ops`: A library with your transformations and their registry, shared
//!   between `worker` and the host program.
//! - `worker`: Serves dispatched stages with a
//!   [`WorkerRuntime`](crate::worker::WorkerRuntime).
pub mod collect;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod pipeline;
pub mod serializer;
pub mod transform;
pub mod value;
pub mod wire;
pub mod worker;
pub mod fnkind_derive {
    pub use spindle_fnkind_derive::*;
}
#[doc(hidden)]
pub mod __private {
    pub use anyhow;
}
pub use tracing;

#[cfg(test)]
mod testing;
