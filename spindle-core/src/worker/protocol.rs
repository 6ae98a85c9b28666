use std::{
    io::{BufReader, BufWriter, Read, Write},
    net::{TcpStream, ToSocketAddrs},
};

use anyhow::{anyhow, bail, ensure, Result};
use bytes::Bytes;
use tracing::{error, instrument, warn};

use super::executor::{execute, ExecutionStats};
use crate::{
    dispatch::Command,
    transform::FnKind,
    wire::{FrameReader, FrameWriter, WireError},
};

/// Length written in place of a frame when the stage failed; a string with
/// the error message follows.
pub const FAILURE_MARKER: i32 = -1;

fn read_task<R: Read>(reader: &mut FrameReader<R>) -> Result<(Command, usize, Vec<Bytes>)> {
    let command = Command::from_bytes(&reader.read_frame()?)?;
    let split = reader.read_int()?;
    let split = usize::try_from(split).map_err(|_| anyhow!("negative split index {split}"))?;

    let mut batches = Vec::new();
    loop {
        let batch = reader.read_frame()?;
        if batch.is_empty() {
            break;
        }
        batches.push(batch);
    }
    Ok((command, split, batches))
}

/// Serve one task on a connection.
///
/// Reads a command frame, the split index and input frames up to the
/// zero-length terminator, then writes the output frames followed by a
/// terminator. On failure the client receives [`FAILURE_MARKER`] and the
/// error message instead, and the error is also returned.
///
/// Input is drained completely before any output is written, so a client
/// may write its whole request before it starts reading.
pub fn handle_connection<K: FnKind, R: Read, W: Write>(
    reader: R,
    writer: W,
    batch_size: usize,
) -> Result<ExecutionStats> {
    let mut reader = FrameReader::new(BufReader::new(reader));
    let mut writer = FrameWriter::new(BufWriter::new(writer));

    let result = read_task(&mut reader).and_then(|(command, split, batches)| {
        execute::<K, _, _>(
            &command,
            split,
            batches.into_iter().map(Ok),
            batch_size,
            |batch| Ok(writer.write_frame(&batch)?),
        )
    });

    match result {
        Ok(stats) => {
            writer.write_end_of_stream()?;
            writer.flush()?;
            Ok(stats)
        }
        Err(err) => {
            error!("Failed to process task {err:#}");
            let reported = writer
                .write_int(FAILURE_MARKER)
                .and_then(|_| writer.write_string(&format!("{err:#}")))
                .and_then(|_| writer.flush());
            if let Err(report_err) = reported {
                warn!("Failed to report task failure to the client {report_err}");
            }
            Err(err)
        }
    }
}

/// Send one task over an established connection and wait for its output
/// frames.
pub fn dispatch_over<R, W, B>(
    reader: R,
    writer: W,
    command: &Command,
    split: usize,
    batches: impl IntoIterator<Item = B>,
) -> Result<Vec<Bytes>>
where
    R: Read,
    W: Write,
    B: AsRef<[u8]>,
{
    let mut writer = FrameWriter::new(BufWriter::new(writer));
    writer.write_frame(&command.to_bytes()?)?;
    writer.write_int(i32::try_from(split)?)?;
    for batch in batches {
        let batch = batch.as_ref();
        ensure!(
            !batch.is_empty(),
            "empty input batches are reserved for the end-of-stream marker"
        );
        writer.write_frame(batch)?;
    }
    writer.write_end_of_stream()?;
    writer.flush()?;

    let mut reader = FrameReader::new(BufReader::new(reader));
    let mut output = Vec::new();
    loop {
        match reader.read_int()? {
            0 => break,
            FAILURE_MARKER => {
                let message = reader.read_string()?;
                bail!("worker failed: {message}");
            }
            len if len < 0 => return Err(WireError::NegativeLength(len).into()),
            len => output.push(reader.read_exact(len as usize)?),
        }
    }
    Ok(output)
}

/// Connect to a worker at `addr` and run one task on it.
#[instrument(skip(command, batches), fields(stage_id = command.descriptor.stage_id()), level = "debug")]
pub fn dispatch<B: AsRef<[u8]>>(
    addr: impl ToSocketAddrs + std::fmt::Debug,
    command: &Command,
    split: usize,
    batches: impl IntoIterator<Item = B>,
) -> Result<Vec<Bytes>> {
    let stream = TcpStream::connect(addr)?;
    let reader = stream.try_clone()?;
    dispatch_over(reader, stream, command, split, batches)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        dispatch::SerializedMode,
        serializer::Serializer,
        testing::{Describe, FailOn, Scale, TestFns},
        transform::StageFn,
    };

    fn request(command: &Command, split: i32, batches: &[Vec<u8>]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new());
        writer.write_frame(&command.to_bytes().unwrap()).unwrap();
        writer.write_int(split).unwrap();
        for batch in batches {
            writer.write_frame(batch).unwrap();
        }
        writer.write_end_of_stream().unwrap();
        writer.into_inner()
    }

    fn command(func: StageFn<TestFns>) -> Command {
        Command::for_stage(
            11,
            &func,
            SerializedMode::Byte,
            SerializedMode::Byte,
            Serializer::Postcard,
        )
        .unwrap()
    }

    #[test]
    fn successful_task_ends_with_terminator() {
        let cmd = command(StageFn::compose(Describe, StageFn::single(Scale(2))));
        let input = vec![Serializer::Postcard.to_bytes(&vec![1i64, 2]).unwrap()];
        let mut response = Vec::new();

        let stats =
            handle_connection::<TestFns, _, _>(Cursor::new(request(&cmd, 4, &input)), &mut response, 16)
                .unwrap();
        assert_eq!(stats.output_records, 2);

        let mut reader = FrameReader::new(Cursor::new(response));
        let batch: Vec<String> = Serializer::Postcard
            .from_bytes(&reader.read_frame().unwrap())
            .unwrap();
        assert_eq!(batch, vec!["4:2", "4:4"]);
        assert!(reader.read_frame().unwrap().is_empty());
        assert!(reader.try_read_frame().unwrap().is_none());
    }

    #[test]
    fn failed_task_reports_marker_and_message() {
        let cmd = command(StageFn::single(FailOn(1)));
        let input = vec![Serializer::Postcard.to_bytes(&vec![1i64]).unwrap()];
        let mut response = Vec::new();

        assert!(handle_connection::<TestFns, _, _>(
            Cursor::new(request(&cmd, 0, &input)),
            &mut response,
            16
        )
        .is_err());

        let mut reader = FrameReader::new(Cursor::new(response));
        assert_eq!(reader.read_int().unwrap(), FAILURE_MARKER);
        assert!(reader.read_string().unwrap().contains("refusing to process 1"));
    }

    #[test]
    fn truncated_request_is_reported() {
        let cmd = command(StageFn::single(Scale(1)));
        let mut bytes = request(&cmd, 0, &[]);
        bytes.truncate(bytes.len() - 4);
        let mut response = Vec::new();
        assert!(handle_connection::<TestFns, _, _>(Cursor::new(bytes), &mut response, 16).is_err());
        assert_eq!(&response[..4], &FAILURE_MARKER.to_be_bytes());
    }

    #[test]
    fn client_surfaces_worker_failures() {
        let cmd = command(StageFn::single(Scale(1)));
        let mut response = FrameWriter::new(Vec::new());
        response.write_int(FAILURE_MARKER).unwrap();
        response.write_string("boom").unwrap();

        let mut sent = Vec::new();
        let err = dispatch_over(
            Cursor::new(response.into_inner()),
            &mut sent,
            &cmd,
            0,
            [vec![1u8]],
        )
        .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(sent, request(&cmd, 0, &[vec![1u8]]));
    }

    #[test]
    fn client_rejects_empty_batches() {
        let cmd = command(StageFn::single(Scale(1)));
        let result = dispatch_over(Cursor::new(Vec::new()), Vec::new(), &cmd, 0, [Vec::<u8>::new()]);
        assert!(result.is_err());
    }
}
