//! A small transformation registry shared by the crate's unit tests.
use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::{
    transform::{FnKind, PartitionFn, PartitionStream},
    value::Value,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct Scale(pub i64);

impl PartitionFn for Scale {
    type Input = i64;
    type Output = i64;
    type Kind = TestFns;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        Box::new(input.map(move |v| v.map(|v| v * self.0)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct Offset(pub i64);

impl PartitionFn for Offset {
    type Input = i64;
    type Output = i64;
    type Kind = TestFns;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        Box::new(input.map(move |v| v.map(|v| v + self.0)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct KeepEven;

impl PartitionFn for KeepEven {
    type Input = i64;
    type Output = i64;
    type Kind = TestFns;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        Box::new(input.filter(|v| !matches!(v, Ok(v) if v % 2 != 0)))
    }
}

/// Formats each element as `"{split}:{value}"`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct Describe;

impl PartitionFn for Describe {
    type Input = i64;
    type Output = String;
    type Kind = TestFns;

    fn apply<'a>(&'a self, split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, String> {
        Box::new(input.map(move |v| v.map(|v| format!("{split}:{v}"))))
    }
}

/// Emits `[Long(v), String("#v")]` tuples.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ToRow;

impl PartitionFn for ToRow {
    type Input = i64;
    type Output = Vec<Value>;
    type Kind = TestFns;

    fn apply<'a>(
        &'a self,
        _split: usize,
        input: PartitionStream<'a, i64>,
    ) -> PartitionStream<'a, Vec<Value>> {
        Box::new(input.map(|v| v.map(|v| vec![Value::Long(v), Value::String(format!("#{v}"))])))
    }
}

/// Emits the big-endian bytes of each element.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ToBytes;

impl PartitionFn for ToBytes {
    type Input = i64;
    type Output = Vec<u8>;
    type Kind = TestFns;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, Vec<u8>> {
        Box::new(input.map(|v| v.map(|v| v.to_be_bytes().to_vec())))
    }
}

/// Measures byte payloads.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct ByteLen;

impl PartitionFn for ByteLen {
    type Input = Vec<u8>;
    type Output = i64;
    type Kind = TestFns;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, Vec<u8>>) -> PartitionStream<'a, i64> {
        Box::new(input.map(|bytes| -> anyhow::Result<i64> { Ok(i64::try_from(bytes?.len())?) }))
    }
}

/// Fails the partition when it meets the given value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct FailOn(pub i64);

impl PartitionFn for FailOn {
    type Input = i64;
    type Output = i64;
    type Kind = TestFns;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        Box::new(input.map(move |v| match v {
            Ok(v) if v == self.0 => bail!("refusing to process {v}"),
            other => other,
        }))
    }
}

#[derive(FnKind, Serialize, Deserialize, Debug, Clone, Copy)]
#[spindle(internal)]
pub enum TestFns {
    Scale(Scale),
    Offset(Offset),
    KeepEven(KeepEven),
    Describe(Describe),
    ToRow(ToRow),
    ToBytes(ToBytes),
    ByteLen(ByteLen),
    FailOn(FailOn),
}
