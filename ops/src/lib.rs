//! Sample transformations for demo and testing purposes.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use spindle::{
    transform::{FnKind, PartitionFn, PartitionStream},
    value::Value,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct SplitWords;

impl PartitionFn for SplitWords {
    type Input = String;
    type Output = String;
    type Kind = Ops;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, String>) -> PartitionStream<'a, String> {
        Box::new(input.flat_map(|line| {
            let words: Vec<anyhow::Result<String>> = match line {
                Ok(line) => line.split_whitespace().map(|w| Ok(w.to_string())).collect(),
                Err(e) => vec![Err(e)],
            };
            words
        }))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct WordLength;

impl PartitionFn for WordLength {
    type Input = String;
    type Output = i64;
    type Kind = Ops;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, String>) -> PartitionStream<'a, i64> {
        Box::new(input.map(|word| word.map(|w| w.chars().count() as i64)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct MultiplyBy(pub i64);

impl PartitionFn for MultiplyBy {
    type Input = i64;
    type Output = i64;
    type Kind = Ops;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        Box::new(input.map(move |v| -> anyhow::Result<i64> {
            let v = v?;
            v.checked_mul(self.0)
                .ok_or_else(|| anyhow!("{v} * {} overflowed", self.0))
        }))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct KeepAbove(pub i64);

impl PartitionFn for KeepAbove {
    type Input = i64;
    type Output = i64;
    type Kind = Ops;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        Box::new(input.filter(move |v| !matches!(v, Ok(v) if *v <= self.0)))
    }
}

/// Prefix sums within each partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct RunningSum;

impl PartitionFn for RunningSum {
    type Input = i64;
    type Output = i64;
    type Kind = Ops;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
        let mut total = 0i64;
        Box::new(input.map(move |v| -> anyhow::Result<i64> {
            total = total
                .checked_add(v?)
                .ok_or_else(|| anyhow!("running sum overflowed"))?;
            Ok(total)
        }))
    }
}

/// Pairs every element with the index of its partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct TagPartition;

impl PartitionFn for TagPartition {
    type Input = i64;
    type Output = (u32, i64);
    type Kind = Ops;

    fn apply<'a>(&'a self, split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, (u32, i64)> {
        Box::new(input.map(move |v| -> anyhow::Result<(u32, i64)> {
            Ok((u32::try_from(split)?, v?))
        }))
    }
}

/// Turns words into `(word, length)` rows.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct WordRow;

impl PartitionFn for WordRow {
    type Input = String;
    type Output = Vec<Value>;
    type Kind = Ops;

    fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, String>) -> PartitionStream<'a, Vec<Value>> {
        Box::new(input.map(|word| {
            word.map(|w| {
                let len = w.chars().count() as i64;
                vec![Value::String(w), Value::Long(len)]
            })
        }))
    }
}

#[derive(FnKind, Debug, Serialize, Deserialize, Clone, Copy)]
pub enum Ops {
    SplitWords(SplitWords),
    WordLength(WordLength),
    MultiplyBy(MultiplyBy),
    KeepAbove(KeepAbove),
    RunningSum(RunningSum),
    TagPartition(TagPartition),
    WordRow(WordRow),
}
