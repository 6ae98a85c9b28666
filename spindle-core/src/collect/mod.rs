//! Draining result streams served by the engine.
//!
//! For every collection call the engine opens a one-shot server and returns
//! its port. The [`StreamCollector`] connects, reads length-prefixed frames
//! until a zero-length frame or a clean close at a frame boundary, decodes
//! each frame as a batch and returns the concatenated result in arrival
//! order. The connection is owned by the call and closed before it returns,
//! whether it succeeded or not.
use std::{
    io::{BufReader, Read},
    net::TcpStream,
    sync::Arc,
};

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    config::Config,
    serializer::Serializer,
    value::{Row, RowSchema, Value},
    wire::{FrameReader, WireError},
};

/// Failures of a collection call. Nothing is retried.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to connect to result server {addr}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The stream failed or closed mid-frame after `batch` complete batches.
    #[error("result stream failed after {batch} batches")]
    Transport {
        batch: usize,
        #[source]
        source: WireError,
    },

    /// Batch number `batch` (zero-based) could not be decoded.
    #[error("failed to decode result batch {batch}")]
    Decode {
        batch: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Turns one frame payload into value tuples.
pub trait RowDeserializer: Send + Sync {
    fn deserialize(&self, payload: &[u8]) -> anyhow::Result<Vec<Vec<Value>>>;
}

/// Decodes batches serialized as `Vec<Vec<Value>>` with a [`Serializer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SerializerRowDeserializer(pub Serializer);

impl RowDeserializer for SerializerRowDeserializer {
    fn deserialize(&self, payload: &[u8]) -> anyhow::Result<Vec<Vec<Value>>> {
        self.0.from_bytes(payload)
    }
}

/// Client for the engine's per-call result servers.
#[derive(Clone)]
pub struct StreamCollector {
    host: String,
    deserializer: Arc<dyn RowDeserializer>,
}

impl StreamCollector {
    /// A collector for servers on `host`, decoding postcard row batches.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            deserializer: Arc::new(SerializerRowDeserializer::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.collect_host.clone())
            .with_deserializer(SerializerRowDeserializer(Serializer::from(config)))
    }

    pub fn with_deserializer(mut self, deserializer: impl RowDeserializer + 'static) -> Self {
        self.deserializer = Arc::new(deserializer);
        self
    }

    fn connect(&self, port: u16) -> Result<TcpStream, CollectError> {
        TcpStream::connect((self.host.as_str(), port)).map_err(|source| CollectError::Connect {
            addr: format!("{}:{port}", self.host),
            source,
        })
    }

    /// Collect row batches from the server on `port`, pairing every tuple
    /// with `schema`.
    #[instrument(skip(self, schema), level = "debug")]
    pub fn collect_rows(&self, port: u16, schema: Arc<RowSchema>) -> Result<Vec<Row>, CollectError> {
        let stream = self.connect(port)?;
        Self::collect_from(stream, |payload| {
            self.deserializer
                .deserialize(payload)?
                .into_iter()
                .map(|values| Row::new(values, schema.clone()))
                .collect()
        })
    }

    /// Collect batches of plain values serialized as `Vec<T>`.
    #[instrument(skip(self), level = "debug")]
    pub fn collect_values<T: DeserializeOwned>(
        &self,
        port: u16,
        serializer: Serializer,
    ) -> Result<Vec<T>, CollectError> {
        let stream = self.connect(port)?;
        Self::collect_from(stream, |payload| serializer.from_bytes::<Vec<T>>(payload))
    }

    /// Drain `reader`, decoding every frame with `decode`.
    pub fn collect_from<R, T, F>(reader: R, mut decode: F) -> Result<Vec<T>, CollectError>
    where
        R: Read,
        F: FnMut(&[u8]) -> anyhow::Result<Vec<T>>,
    {
        let mut reader = FrameReader::new(BufReader::new(reader));
        let mut collected = Vec::new();
        let mut batch = 0;

        while let Some(frame) = reader
            .try_read_frame()
            .map_err(|source| CollectError::Transport { batch, source })?
        {
            if frame.is_empty() {
                break;
            }
            let records = decode(&frame).map_err(|source| CollectError::Decode { batch, source })?;
            collected.extend(records);
            batch += 1;
        }

        debug!(batches = batch, records = collected.len(), "collected result stream");
        Ok(collected)
    }
}
