//! Per-partition transformations and their registries.
//!
//! Key components of this module include:
//! ## [`PartitionFn`]
//! A pure function from `(split index, partition stream)` to a new partition
//! stream. Transformations are plain serializable values, never closures,
//! so they can be shipped to a worker as bytes.
//!
//! ## [`FnKind`]
//! A registry enum of every transformation a worker may be asked to run,
//! usually implemented with `#[derive(FnKind)]`. The registry is what
//! actually crosses the process boundary. It also knows how to decode input
//! batches and encode output batches with the concrete element types of each
//! of its variants.
//!
//! ## [`StageFn`]
//! The fused function of one pipeline stage: a non-empty sequence of
//! registry entries applied one after the other.
//!
//! # Type erasure
//!
//! Appends are statically typed, so the output type of one stage always
//! matches the input type of the next. Between fused stages inside a
//! [`StageFn`], elements travel as type-erased [`Record`]s; they are only
//! decoded from and encoded to bytes at the two ends of the composition.
//!
//! ## Example
//! ```
//! use serde::{Deserialize, Serialize};
//! use spindle::transform::{FnKind, PartitionFn, PartitionStream};
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! struct Scale(i64);
//!
//! impl PartitionFn for Scale {
//!     type Input = i64;
//!     type Output = i64;
//!     type Kind = MyFns;
//!
//!     fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
//!         Box::new(input.map(move |v| v.map(|v| v * self.0)))
//!     }
//! }
//!
//! #[derive(FnKind, Serialize, Deserialize, Debug, Clone)]
//! enum MyFns {
//!     Scale(Scale),
//! }
//! ```
use std::{any::Any, fmt::Debug};

use anyhow::{anyhow, Result};

use crate::serializer::{Serializable, Serializer};

mod compose;
pub use compose::*;
pub use spindle_fnkind_derive::FnKind;

/// A lazy, finite sequence of one partition's elements.
pub type PartitionStream<'a, T> = Box<dyn Iterator<Item = Result<T>> + Send + 'a>;

/// A type-erased element flowing between fused stages.
pub type Record = Box<dyn Any + Send>;

/// A partition stream of type-erased elements.
pub type ErasedStream<'a> = PartitionStream<'a, Record>;

/// A transformation applied to every partition of a pipeline.
///
/// Implementations must be pure with respect to their inputs and lazy: they
/// should return an adapter over `input` rather than collecting it.
pub trait PartitionFn: Serializable + Clone + Debug {
    /// The element type consumed by the function.
    type Input: Serializable + Debug;
    /// The element type produced by the function.
    type Output: Serializable + Debug;
    /// The registry this function belongs to.
    type Kind: FnKind;

    /// Transform the elements of partition `split`.
    fn apply<'a>(
        &'a self,
        split: usize,
        input: PartitionStream<'a, Self::Input>,
    ) -> PartitionStream<'a, Self::Output>;
}

/// A registry of [`PartitionFn`]s that can be executed opaquely by a worker.
///
/// This is automatically implemented by the
/// [`FnKind`](crate::fnkind_derive::FnKind) derive macro.
pub trait FnKind: Serializable + Clone + Debug {
    /// Name of the active variant, for diagnostics.
    fn name(&self) -> &'static str;

    /// Apply the wrapped function to a stream of erased records.
    fn apply_erased<'a>(&'a self, split: usize, input: ErasedStream<'a>) -> ErasedStream<'a>;

    /// Decode a serialized batch of the wrapped function's input type.
    fn decode_input(&self, serializer: Serializer, batch: &[u8]) -> Result<Vec<Record>>;

    /// Encode records of the wrapped function's output type into a batch.
    fn encode_output(&self, serializer: Serializer, records: Vec<Record>) -> Result<Vec<u8>>;
}

/// Box a value as a [`Record`].
pub fn erase<T: Send + 'static>(value: T) -> Record {
    Box::new(value)
}

/// Recover a typed value from a [`Record`].
///
/// Fails if the record holds a different type, which indicates the records
/// fed into a composition don't match its innermost input type.
pub fn unerase<T: 'static>(record: Record) -> Result<T> {
    record
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| anyhow!("record is not a {}", std::any::type_name::<T>()))
}

/// Apply a typed function to an erased stream.
///
/// Used by [`FnKind`] implementations to dispatch to their variants.
pub fn apply_erased<'a, F: PartitionFn>(
    f: &'a F,
    split: usize,
    input: ErasedStream<'a>,
) -> ErasedStream<'a> {
    let typed = input.map(|record| record.and_then(unerase::<F::Input>));
    Box::new(
        f.apply(split, Box::new(typed))
            .map(|output| output.map(erase)),
    )
}

/// Decode a serialized `Vec<F::Input>` into erased records.
pub fn decode_batch<F: PartitionFn>(serializer: Serializer, batch: &[u8]) -> Result<Vec<Record>> {
    let values: Vec<F::Input> = serializer.from_bytes(batch)?;
    Ok(values.into_iter().map(erase).collect())
}

/// Encode erased records holding `F::Output` values as a serialized batch.
pub fn encode_batch<F: PartitionFn>(serializer: Serializer, records: Vec<Record>) -> Result<Vec<u8>> {
    let values = records
        .into_iter()
        .map(unerase::<F::Output>)
        .collect::<Result<Vec<_>>>()?;
    serializer.to_bytes(&values)
}

/// Wrap plain values as an infallible partition stream.
pub fn from_values<'a, T, I>(values: I) -> PartitionStream<'a, T>
where
    T: 'a,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'a,
{
    Box::new(values.into_iter().map(Ok))
}
