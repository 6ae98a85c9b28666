//! What a worker needs to run one stage.
//!
//! A [`DispatchDescriptor`] identifies the composed function of a stage and
//! its argument slots. A [`Command`] wraps it with the serialization modes
//! and payload format and is the byte payload the engine hands to a worker.
//!
//! # Command layout
//!
//! Encoded with the [wire codec](crate::wire::codec):
//!
//! | field | encoding |
//! |---|---|
//! | `prev_mode` | string |
//! | `mode` | string |
//! | `serializer` | string |
//! | `stage_id` | int |
//! | `args_count` | int |
//! | offsets length | int |
//! | `arg_offsets` | int × length |
//! | `func` | frame |
use std::{fmt, str::FromStr};

use anyhow::{bail, ensure, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    serializer::Serializer,
    transform::{FnKind, StageFn},
    wire::{
        codec::{self, WirePrimitive},
        WireError,
    },
};

/// How the elements of a data stream are serialized.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SerializedMode {
    /// Batches of values serialized with the command's [`Serializer`].
    #[default]
    Byte,
    String,
    Pair,
    None,
    /// Batches of value tuples, decoded into rows by the collector.
    Row,
}

impl SerializedMode {
    /// The name written on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Byte => "Byte",
            Self::String => "String",
            Self::Pair => "Pair",
            Self::None => "None",
            Self::Row => "Row",
        }
    }
}

impl fmt::Display for SerializedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SerializedMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Byte" => Self::Byte,
            "String" => Self::String,
            "Pair" => Self::Pair,
            "None" => Self::None,
            "Row" => Self::Row,
            other => bail!("unknown serialized mode: {other:?}"),
        })
    }
}

/// Identifies the composed function a worker must invoke for one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchDescriptor {
    stage_id: i32,
    func: Bytes,
    args_count: i32,
    arg_offsets: Vec<i32>,
}

impl DispatchDescriptor {
    pub fn new(stage_id: i32, func: impl Into<Bytes>, args_count: i32, arg_offsets: Vec<i32>) -> Self {
        Self {
            stage_id,
            func: func.into(),
            args_count,
            arg_offsets,
        }
    }

    pub fn stage_id(&self) -> i32 {
        self.stage_id
    }

    /// The serialized composed function.
    pub fn func(&self) -> &Bytes {
        &self.func
    }

    pub fn args_count(&self) -> i32 {
        self.args_count
    }

    pub fn arg_offsets(&self) -> &[i32] {
        &self.arg_offsets
    }
}

/// The payload of a remote node creation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Mode of the data the stage reads.
    pub prev_mode: SerializedMode,
    /// Mode of the data the stage produces.
    pub mode: SerializedMode,
    /// Format of the function payload and of every data batch.
    pub serializer: Serializer,
    pub descriptor: DispatchDescriptor,
}

impl Command {
    /// Serialize `func` and wrap it in a command for stage `stage_id`.
    ///
    /// Stage functions take a single argument, the partition stream, at
    /// offset zero.
    pub fn for_stage<K: FnKind>(
        stage_id: i32,
        func: &StageFn<K>,
        prev_mode: SerializedMode,
        mode: SerializedMode,
        serializer: Serializer,
    ) -> Result<Self> {
        let payload = serializer.to_bytes(func)?;
        Ok(Self {
            prev_mode,
            mode,
            serializer,
            descriptor: DispatchDescriptor::new(stage_id, payload, 1, vec![0]),
        })
    }

    /// Deserialize the composed function carried by this command.
    pub fn decode_func<K: FnKind>(&self) -> Result<StageFn<K>> {
        self.serializer.from_bytes(self.descriptor.func())
    }

    pub fn to_bytes(&self) -> std::result::Result<Bytes, WireError> {
        let descriptor = &self.descriptor;
        let func_len = i32::try_from(descriptor.func.len())
            .map_err(|_| WireError::FrameTooLarge(descriptor.func.len()))?;
        let offsets_len = i32::try_from(descriptor.arg_offsets.len())
            .map_err(|_| WireError::FrameTooLarge(descriptor.arg_offsets.len()))?;

        let mut buf = BytesMut::with_capacity(64 + descriptor.func.len());
        codec::encode_str(self.prev_mode.name(), &mut buf);
        codec::encode_str(self.mode.name(), &mut buf);
        codec::encode_str(self.serializer.name(), &mut buf);
        descriptor.stage_id.encode(&mut buf);
        descriptor.args_count.encode(&mut buf);
        offsets_len.encode(&mut buf);
        for offset in &descriptor.arg_offsets {
            offset.encode(&mut buf);
        }
        func_len.encode(&mut buf);
        buf.put_slice(&descriptor.func);
        Ok(buf.freeze())
    }

    /// Decode a command, rejecting trailing bytes.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let buf = &mut bytes;
        let prev_mode: SerializedMode = String::decode(buf)?.parse()?;
        let mode: SerializedMode = String::decode(buf)?.parse()?;
        let serializer: Serializer = String::decode(buf)?.parse()?;
        let stage_id = i32::decode(buf)?;
        let args_count = i32::decode(buf)?;

        let offsets_len = length(i32::decode(buf)?)?;
        let arg_offsets = (0..offsets_len)
            .map(|_| i32::decode(buf))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let func_len = length(i32::decode(buf)?)?;
        if buf.remaining() < func_len {
            return Err(WireError::InsufficientData {
                needed: func_len,
                available: buf.remaining(),
            }
            .into());
        }
        let func = buf.copy_to_bytes(func_len);
        ensure!(
            !buf.has_remaining(),
            "{} trailing bytes after command",
            buf.remaining()
        );

        Ok(Self {
            prev_mode,
            mode,
            serializer,
            descriptor: DispatchDescriptor::new(stage_id, func, args_count, arg_offsets),
        })
    }
}

fn length(len: i32) -> std::result::Result<usize, WireError> {
    usize::try_from(len).map_err(|_| WireError::NegativeLength(len))
}
