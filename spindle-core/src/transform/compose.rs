use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use super::{erase, unerase, ErasedStream, FnKind, PartitionStream};

/// The fused function of one pipeline stage.
///
/// A stage is a non-empty sequence of registry entries in application order:
/// the first entry consumes the stage input and each following entry consumes
/// the output of the one before it. Fusing another function appends to the
/// sequence, so the serialized form stays flat however many functions are
/// fused.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "K: FnKind", try_from = "Vec<K>", into = "Vec<K>")]
pub struct StageFn<K> {
    // Never empty.
    stages: Vec<K>,
}

impl<K: FnKind> StageFn<K> {
    pub fn single(f: impl Into<K>) -> Self {
        Self {
            stages: vec![f.into()],
        }
    }

    /// Fuse `outer` over an existing stage function.
    ///
    /// The result applies `inner` first, then `outer`, for the same
    /// partition index.
    pub fn compose(outer: impl Into<K>, inner: StageFn<K>) -> Self {
        let mut stages = inner.stages;
        stages.push(outer.into());
        Self { stages }
    }

    /// Feed `input` through every fused function in order.
    ///
    /// Nothing is evaluated until the returned stream is polled, and each
    /// element is pulled through all functions on demand.
    pub fn apply<'a>(&'a self, split: usize, input: ErasedStream<'a>) -> ErasedStream<'a> {
        self.stages
            .iter()
            .fold(input, |stream, f| f.apply_erased(split, stream))
    }

    /// Apply to typed values, un-erasing the output as `O`.
    pub fn apply_typed<'a, I, O>(
        &'a self,
        split: usize,
        input: PartitionStream<'a, I>,
    ) -> PartitionStream<'a, O>
    where
        I: Send + 'static,
        O: 'static,
    {
        let erased = Box::new(input.map(|value| value.map(erase)));
        Box::new(
            self.apply(split, erased)
                .map(|record| record.and_then(unerase::<O>)),
        )
    }

    /// The first function applied; it decides how input batches decode.
    pub fn innermost(&self) -> &K {
        &self.stages[0]
    }

    /// The last function applied; it decides how output batches encode.
    pub fn outermost(&self) -> &K {
        &self.stages[self.stages.len() - 1]
    }

    /// All fused functions in application order.
    pub fn stages(&self) -> &[K] {
        &self.stages
    }

    /// Number of fused functions.
    pub fn depth(&self) -> usize {
        self.stages.len()
    }
}

impl<K> TryFrom<Vec<K>> for StageFn<K> {
    type Error = Error;

    fn try_from(stages: Vec<K>) -> Result<Self, Self::Error> {
        if stages.is_empty() {
            bail!("a stage function needs at least one function");
        }
        Ok(Self { stages })
    }
}

impl<K> From<StageFn<K>> for Vec<K> {
    fn from(func: StageFn<K>) -> Self {
        func.stages
    }
}
