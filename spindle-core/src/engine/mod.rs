//! The boundary to the remote execution engine.
//!
//! The engine owns the distributed datasets; this crate only ever holds
//! opaque [`RemoteHandle`]s to them. Pipelines talk to the engine through the
//! [`RemoteEngine`] trait, so the engine can be a real cluster client or the
//! in-process [`LocalEngine`].
use std::{fmt, sync::Arc};

use anyhow::Result;
use bytes::Bytes;

use crate::wire::{self, FrameReader, FrameWriter};

mod local;
pub use local::*;

/// An opaque reference to a dataset held by the engine.
///
/// Cloning is cheap. Two handles are equal if they carry the same id;
/// [`RemoteHandle::ptr_eq`] additionally checks that they are the same
/// handle object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteHandle(Arc<str>);

impl RemoteHandle {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// Whether both handles share one allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Write as a non-null object reference.
    pub fn write_to<W: std::io::Write>(&self, writer: &mut FrameWriter<W>) -> wire::Result<()> {
        writer.write_object_reference(Some(self.id()))
    }

    /// Read an object reference; a null reference yields `None`.
    pub fn read_from<R: std::io::Read>(reader: &mut FrameReader<R>) -> wire::Result<Option<Self>> {
        Ok(reader.read_object_reference()?.map(Self::new))
    }
}

impl fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to create an engine node that runs a dispatched stage.
#[derive(Clone, Debug)]
pub struct CreateNodeRequest {
    /// Handles of the datasets the stage reads.
    pub parents: Vec<RemoteHandle>,
    /// An encoded [`Command`](crate::dispatch::Command).
    pub command: Bytes,
    pub preserves_partitioning: bool,
}

/// Operations the pipeline needs from the engine.
///
/// All calls block until the engine answers. Implementations decide their
/// own retry and timeout behaviour; callers never retry.
pub trait RemoteEngine: Send + Sync {
    /// Register source data, given as serialized batches per partition.
    fn parallelize(&self, partitions: Vec<Vec<Bytes>>) -> Result<RemoteHandle>;

    /// Create a node that runs a dispatched stage over its parents.
    fn create_pipelined_node(&self, request: CreateNodeRequest) -> Result<RemoteHandle>;

    /// Keep the node's output once it has been computed.
    fn persist(&self, handle: &RemoteHandle) -> Result<()>;

    /// Save the node's output and cut its lineage.
    fn checkpoint(&self, handle: &RemoteHandle) -> Result<()>;

    /// Compute the node and serve its batches on a one-shot local server.
    ///
    /// Returns the port the server listens on.
    fn collect_and_serve(&self, handle: &RemoteHandle) -> Result<u16>;
}

impl<E: RemoteEngine + ?Sized> RemoteEngine for Arc<E> {
    fn parallelize(&self, partitions: Vec<Vec<Bytes>>) -> Result<RemoteHandle> {
        (**self).parallelize(partitions)
    }

    fn create_pipelined_node(&self, request: CreateNodeRequest) -> Result<RemoteHandle> {
        (**self).create_pipelined_node(request)
    }

    fn persist(&self, handle: &RemoteHandle) -> Result<()> {
        (**self).persist(handle)
    }

    fn checkpoint(&self, handle: &RemoteHandle) -> Result<()> {
        (**self).checkpoint(handle)
    }

    fn collect_and_serve(&self, handle: &RemoteHandle) -> Result<u16> {
        (**self).collect_and_serve(handle)
    }
}
