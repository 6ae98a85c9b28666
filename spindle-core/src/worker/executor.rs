use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::{
    dispatch::{Command, SerializedMode},
    transform::{erase, unerase, FnKind, Record},
};

/// Counters describing one stage execution.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionStats {
    pub input_batches: usize,
    pub input_records: usize,
    pub output_batches: usize,
    pub output_records: usize,
}

fn check_mode(mode: SerializedMode) -> Result<()> {
    match mode {
        SerializedMode::Byte | SerializedMode::Row | SerializedMode::None => Ok(()),
        other => bail!("serialized mode {other} is not supported by this worker"),
    }
}

/// Run the stage described by `command` over one partition.
///
/// Input batches are decoded one at a time with the innermost function's
/// input type and pulled through the composition lazily. Output records are
/// re-batched into groups of at most `batch_size`, encoded with the
/// outermost function's output type, and handed to `sink` in order.
///
/// With [`SerializedMode::None`] the serializer is bypassed on that side:
/// every input frame is one `Vec<u8>` record, and every output record must
/// be a `Vec<u8>` that is handed to `sink` as its own frame.
///
/// The first failure, whether decoding, applying or sinking, stops the
/// stage and is returned with the stage id and split attached.
#[instrument(skip_all, fields(stage_id = command.descriptor.stage_id(), split = split), level = "debug")]
pub fn execute<K, I, S>(
    command: &Command,
    split: usize,
    input: I,
    batch_size: usize,
    sink: S,
) -> Result<ExecutionStats>
where
    K: FnKind,
    I: IntoIterator<Item = Result<Bytes>>,
    I::IntoIter: Send,
    S: FnMut(Vec<u8>) -> Result<()>,
{
    run::<K, I, S>(command, split, input, batch_size, sink).with_context(|| {
        format!(
            "stage {} failed on partition {split}",
            command.descriptor.stage_id()
        )
    })
}

fn run<K, I, S>(
    command: &Command,
    split: usize,
    input: I,
    batch_size: usize,
    mut sink: S,
) -> Result<ExecutionStats>
where
    K: FnKind,
    I: IntoIterator<Item = Result<Bytes>>,
    I::IntoIter: Send,
    S: FnMut(Vec<u8>) -> Result<()>,
{
    ensure!(batch_size > 0, "batch size must be positive");
    check_mode(command.prev_mode)?;
    check_mode(command.mode)?;

    let func = command.decode_func::<K>()?;
    let serializer = command.serializer;
    let innermost = func.innermost();
    let outermost = func.outermost();
    debug!(stages = func.depth(), innermost = innermost.name(), outermost = outermost.name(), "decoded stage function");

    let raw_input = command.prev_mode == SerializedMode::None;
    let raw_output = command.mode == SerializedMode::None;
    let batch_size = if raw_output { 1 } else { batch_size };

    let input_batches = AtomicUsize::new(0);
    let input_records = AtomicUsize::new(0);

    let records = input.into_iter().flat_map(|batch| {
        let decoded = batch.and_then(|batch| {
            if raw_input {
                Ok(vec![erase(batch.to_vec())])
            } else {
                innermost.decode_input(serializer, &batch)
            }
        });
        let records: Box<dyn Iterator<Item = Result<Record>> + Send> = match decoded {
            Ok(records) => {
                input_batches.fetch_add(1, Ordering::Relaxed);
                input_records.fetch_add(records.len(), Ordering::Relaxed);
                Box::new(records.into_iter().map(Ok))
            }
            Err(err) => Box::new(std::iter::once(Err(err))),
        };
        records
    });

    let mut stats = ExecutionStats::default();
    let mut emit = |records: Vec<Record>, stats: &mut ExecutionStats| -> Result<()> {
        stats.output_batches += 1;
        stats.output_records += records.len();
        if raw_output {
            for record in records {
                sink(unerase::<Vec<u8>>(record)?)?;
            }
            Ok(())
        } else {
            sink(outermost.encode_output(serializer, records)?)
        }
    };

    let mut batch = Vec::with_capacity(batch_size);
    for record in func.apply(split, Box::new(records)) {
        batch.push(record?);
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            emit(full, &mut stats)?;
        }
    }
    if !batch.is_empty() {
        emit(batch, &mut stats)?;
    }

    stats.input_batches = input_batches.load(Ordering::Relaxed);
    stats.input_records = input_records.load(Ordering::Relaxed);
    debug!(?stats, "stage executed");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        serializer::Serializer,
        testing::{ByteLen, FailOn, KeepEven, Offset, Scale, TestFns, ToBytes, ToRow},
        transform::StageFn,
        value::Value,
    };

    fn command(func: StageFn<TestFns>, mode: SerializedMode) -> Command {
        Command::for_stage(3, &func, SerializedMode::Byte, mode, Serializer::Postcard).unwrap()
    }

    fn batches(values: &[&[i64]]) -> Vec<Result<Bytes>> {
        values
            .iter()
            .map(|batch| Ok(Bytes::from(Serializer::Postcard.to_bytes(batch).unwrap())))
            .collect()
    }

    fn run_collect<T: serde::de::DeserializeOwned>(
        command: &Command,
        input: Vec<Result<Bytes>>,
        batch_size: usize,
    ) -> Result<(Vec<Vec<T>>, ExecutionStats)> {
        let mut out = Vec::new();
        let stats = execute::<TestFns, _, _>(command, 0, input, batch_size, |batch| {
            out.push(Serializer::Postcard.from_bytes(&batch)?);
            Ok(())
        })?;
        Ok((out, stats))
    }

    #[test]
    fn output_is_rebatched() {
        let cmd = command(
            StageFn::compose(KeepEven, StageFn::single(Offset(1))),
            SerializedMode::Byte,
        );
        let (out, stats) = run_collect::<i64>(&cmd, batches(&[&[1, 2, 3], &[], &[5, 7, 9]]), 2).unwrap();
        assert_eq!(out, vec![vec![2, 4], vec![6, 8], vec![10]]);
        assert_eq!(
            stats,
            ExecutionStats {
                input_batches: 3,
                input_records: 6,
                output_batches: 3,
                output_records: 5,
            }
        );
    }

    #[test]
    fn empty_partition_produces_no_batches() {
        let cmd = command(StageFn::single(Scale(2)), SerializedMode::Byte);
        let (out, stats) = run_collect::<i64>(&cmd, vec![], 4).unwrap();
        assert!(out.is_empty());
        assert_eq!(stats, ExecutionStats::default());
    }

    #[test]
    fn row_output_encodes_value_tuples() {
        let cmd = command(
            StageFn::compose(ToRow, StageFn::single(Scale(10))),
            SerializedMode::Row,
        );
        let (out, _) = run_collect::<Vec<Value>>(&cmd, batches(&[&[1]]), 8).unwrap();
        assert_eq!(
            out,
            vec![vec![vec![Value::Long(10), Value::String("#10".into())]]]
        );
    }

    #[test]
    fn raw_output_bypasses_the_serializer() {
        let cmd = command(
            StageFn::compose(ToBytes, StageFn::single(Offset(1))),
            SerializedMode::None,
        );
        let mut frames = Vec::new();
        let stats = execute::<TestFns, _, _>(&cmd, 0, batches(&[&[1, 2], &[3]]), 8, |frame| {
            frames.push(frame);
            Ok(())
        })
        .unwrap();

        assert_eq!(
            frames,
            vec![
                2i64.to_be_bytes().to_vec(),
                3i64.to_be_bytes().to_vec(),
                4i64.to_be_bytes().to_vec(),
            ]
        );
        assert_eq!(stats.output_batches, 3);
        assert_eq!(stats.output_records, 3);
    }

    #[test]
    fn raw_input_is_one_record_per_frame() {
        let cmd = Command::for_stage(
            3,
            &StageFn::<TestFns>::compose(Scale(10), StageFn::single(ByteLen)),
            SerializedMode::None,
            SerializedMode::Byte,
            Serializer::Postcard,
        )
        .unwrap();
        let input = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"z")),
        ];
        let (out, stats) = run_collect::<i64>(&cmd, input, 8).unwrap();
        assert_eq!(out, vec![vec![30, 0, 10]]);
        assert_eq!(stats.input_records, 3);
    }

    #[test]
    fn raw_output_requires_byte_records() {
        let cmd = command(StageFn::single(Scale(1)), SerializedMode::None);
        let err = execute::<TestFns, _, _>(&cmd, 0, batches(&[&[1]]), 8, |_| Ok(())).unwrap_err();
        assert!(format!("{err:#}").contains("Vec<u8>"));
    }

    #[test]
    fn unsupported_modes_are_rejected() {
        for mode in [SerializedMode::String, SerializedMode::Pair] {
            let cmd = command(StageFn::single(Scale(1)), mode);
            let err = run_collect::<i64>(&cmd, batches(&[&[1]]), 8).unwrap_err();
            assert!(format!("{err:#}").contains("not supported"));
        }
    }

    #[test]
    fn failures_name_the_stage() {
        let cmd = command(StageFn::single(FailOn(2)), SerializedMode::Byte);
        let err = run_collect::<i64>(&cmd, batches(&[&[1, 2, 3]]), 8).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("stage 3"));
        assert!(message.contains("refusing to process 2"));

        let cmd = command(StageFn::single(Scale(1)), SerializedMode::Byte);
        let garbage = vec![Ok(Bytes::from_static(&[0xff, 0xff, 0xff]))];
        assert!(run_collect::<i64>(&cmd, garbage, 8).is_err());
        assert!(run_collect::<i64>(&cmd, batches(&[&[1]]), 0).is_err());
    }
}
