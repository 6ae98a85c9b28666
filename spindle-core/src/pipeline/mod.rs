//! Lazy, fused chains of partition transformations.
//!
//! # Features:
//! - **Fusion**: appending a transformation to a [`Pipeline`] that hasn't been
//!   cached or checkpointed creates a new node whose function is the
//!   composition of the new function over the old one. The whole chain
//!   crosses into a worker once, as a single
//!   [`Command`](crate::dispatch::Command).
//! - **Boundaries**: appending to a cached or checkpointed pipeline (or to a
//!   source) leaves its function untouched and starts a new stage that reads
//!   the materialized output.
//! - **Idempotent resolution**: the remote handle of a node is created on
//!   first demand, at most once, and cached. Concurrent callers wait for the
//!   first resolution and share its handle.
//!
//! Nodes live in an append-only arena owned by the [`Context`]. Ids increase
//! with creation order, so the graph can't contain cycles.
//!
//! # Usage:
//! ```
//! use serde::{Deserialize, Serialize};
//! use spindle::{
//!     config::Config,
//!     engine::LocalEngine,
//!     pipeline::Context,
//!     transform::{FnKind, PartitionFn, PartitionStream},
//! };
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! struct AddOne;
//!
//! impl PartitionFn for AddOne {
//!     type Input = i64;
//!     type Output = i64;
//!     type Kind = MyFns;
//!
//!     fn apply<'a>(&'a self, _split: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
//!         Box::new(input.map(|v| v.map(|v| v + 1)))
//!     }
//! }
//!
//! #[derive(FnKind, Serialize, Deserialize, Debug, Clone, Copy)]
//! enum MyFns {
//!     AddOne(AddOne),
//! }
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::default();
//! let context = Context::new(LocalEngine::<MyFns>::from_config(&config), &config);
//!
//! let numbers = context.parallelize(vec![vec![1i64, 2], vec![3]])?;
//! let plus_two = numbers
//!     .map_partitions(AddOne)
//!     .map_partitions_with_index(AddOne, true);
//!
//! assert_eq!(plus_two.stage_count(), 2);
//! assert_eq!(plus_two.collect()?, vec![3, 4, 5]);
//! # Ok(())
//! # }
//! ```
use std::{
    any::TypeId,
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
};

use anyhow::{anyhow, bail, Context as _, Result};
use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::{
    collect::{CollectError, StreamCollector},
    config::Config,
    dispatch::{Command, SerializedMode},
    engine::{CreateNodeRequest, RemoteEngine, RemoteHandle},
    serializer::{Serializable, Serializer},
    transform::{FnKind, PartitionFn, StageFn},
    value::{Row, RowSchema, Value},
};

mod node;
use node::{Node, NodeKind};
pub use node::NodeId;

/// Stages producing value tuples are row streams; everything else is a
/// stream of serialized batches.
fn output_mode<T: 'static>() -> SerializedMode {
    if TypeId::of::<T>() == TypeId::of::<Vec<Value>>() {
        SerializedMode::Row
    } else {
        SerializedMode::Byte
    }
}

struct ContextInner<K, E> {
    nodes: RwLock<Vec<Arc<Node<K>>>>,
    engine: E,
    serializer: Serializer,
    batch_size: usize,
    collector: StreamCollector,
}

/// Owns the node arena and the engine connection of a set of pipelines.
///
/// Cloning is cheap and yields a handle to the same context.
pub struct Context<K, E> {
    inner: Arc<ContextInner<K, E>>,
}

impl<K, E> Clone for Context<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: FnKind, E: RemoteEngine> Context<K, E> {
    pub fn new(engine: E, config: &Config) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                nodes: RwLock::new(Vec::new()),
                engine,
                serializer: Serializer::from(config),
                batch_size: config.batch_size,
                collector: StreamCollector::from_config(config),
            }),
        }
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    pub fn serializer(&self) -> Serializer {
        self.inner.serializer
    }

    /// Number of nodes created so far.
    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    /// Ship local partitions to the engine as a new source.
    ///
    /// Each partition is cut into batches of at most the configured batch
    /// size. Empty partitions are kept, with no batches.
    #[instrument(skip_all, fields(partitions = partitions.len()), level = "debug")]
    pub fn parallelize<T: Serializable>(&self, partitions: Vec<Vec<T>>) -> Result<Pipeline<T, K, E>> {
        let batch_size = self.inner.batch_size.max(1);
        let batches = partitions
            .iter()
            .map(|partition| {
                partition
                    .chunks(batch_size)
                    .map(|chunk| Ok(Bytes::from(self.inner.serializer.to_bytes(&chunk)?)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let handle = self.inner.engine.parallelize(batches)?;
        Ok(self.from_handle(handle, SerializedMode::Byte))
    }

    /// Wrap a dataset the engine already holds as a source pipeline.
    pub fn from_handle<T>(&self, handle: RemoteHandle, mode: SerializedMode) -> Pipeline<T, K, E> {
        let node = self.push(|id| Node::source(id, handle, mode));
        Pipeline::new(self.clone(), node)
    }

    /// The arena is append-only, so a poisoned lock still guards a
    /// consistent list.
    fn nodes(&self) -> RwLockReadGuard<'_, Vec<Arc<Node<K>>>> {
        self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, build: impl FnOnce(NodeId) -> Node<K>) -> Arc<Node<K>> {
        let mut nodes = self
            .inner
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let node = Arc::new(build(NodeId(nodes.len())));
        nodes.push(node.clone());
        node
    }

    fn node(&self, id: NodeId) -> Result<Arc<Node<K>>> {
        self.nodes()
            .get(id.0)
            .cloned()
            .ok_or_else(|| anyhow!("no node {id} in this context"))
    }

    /// Resolve the remote handle of `node`, creating it on first demand.
    ///
    /// The node's lock is held throughout, so concurrent callers observe a
    /// single creation. Predecessors are resolved while it is held; they
    /// always have smaller ids, so locks are taken in decreasing id order.
    fn resolve(&self, node: &Node<K>) -> Result<RemoteHandle> {
        let mut slot = node
            .handle
            .lock()
            .map_err(|_| anyhow!("remote handle lock of node {} poisoned", node.id))?;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let NodeKind::Pipelined {
            func,
            prev,
            prev_mode,
        } = &node.kind
        else {
            bail!("source node {} has no remote handle", node.id);
        };

        let prev_node = self.node(*prev)?;
        let prev_handle = self.resolve(&prev_node)?;
        let stage_id = i32::try_from(node.id.0)?;
        let command = Command::for_stage(stage_id, func, *prev_mode, node.mode, self.inner.serializer)?;

        let handle = self.inner.engine.create_pipelined_node(CreateNodeRequest {
            parents: vec![prev_handle],
            command: command.to_bytes()?,
            preserves_partitioning: node.preserves_partitioning,
        })?;
        debug!(node = %node.id, %handle, stages = func.depth(), "resolved remote handle");

        *slot = Some(handle.clone());
        Ok(handle)
    }
}

/// A typed handle to one node of a pipeline graph.
///
/// `T` is the element type of the node's output. Appending returns a new
/// pipeline and never changes this one.
pub struct Pipeline<T, K, E> {
    context: Context<K, E>,
    node: Arc<Node<K>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, K, E> Clone for Pipeline<T, K, E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, K: FnKind, E: RemoteEngine> Pipeline<T, K, E> {
    fn new(context: Context<K, E>, node: Arc<Node<K>>) -> Self {
        Self {
            context,
            node,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    pub fn context(&self) -> &Context<K, E> {
        &self.context
    }

    /// Serialization mode of this node's output.
    pub fn mode(&self) -> SerializedMode {
        self.node.mode
    }

    /// The node whose remote handle this node reads, if any.
    pub fn prev_id(&self) -> Option<NodeId> {
        self.node.prev()
    }

    pub fn is_cached(&self) -> bool {
        self.node.is_cached()
    }

    pub fn is_checkpointed(&self) -> bool {
        self.node.is_checkpointed()
    }

    /// Whether appending fuses into this node instead of starting a new
    /// stage.
    pub fn is_pipelinable(&self) -> bool {
        self.node.is_pipelinable()
    }

    /// True only if every fused function preserves partitioning.
    pub fn preserves_partitioning(&self) -> bool {
        self.node.preserves_partitioning
    }

    /// Number of functions fused into this node; zero for sources.
    pub fn stage_count(&self) -> usize {
        self.node.func().map_or(0, StageFn::depth)
    }

    /// The fused function of this node, if it isn't a source.
    pub fn stage_fn(&self) -> Option<&StageFn<K>> {
        self.node.func()
    }

    /// Append `f`, applied to every partition together with its index.
    pub fn map_partitions_with_index<F>(&self, f: F, preserves_partitioning: bool) -> Pipeline<F::Output, K, E>
    where
        F: PartitionFn<Input = T, Kind = K> + Into<K>,
    {
        let mode = output_mode::<F::Output>();
        let node = match &self.node.kind {
            NodeKind::Pipelined {
                func,
                prev,
                prev_mode,
            } if self.is_pipelinable() => {
                let func = StageFn::compose(f, func.clone());
                let preserves = self.node.preserves_partitioning && preserves_partitioning;
                let node = self
                    .context
                    .push(|id| Node::pipelined(id, func, *prev, *prev_mode, mode, preserves));
                trace!(from = %self.node.id, to = %node.id, "fused stage");
                node
            }
            _ => {
                let (prev, prev_mode) = (self.node.id, self.node.mode);
                let node = self.context.push(|id| {
                    Node::pipelined(id, StageFn::single(f), prev, prev_mode, mode, preserves_partitioning)
                });
                trace!(from = %self.node.id, to = %node.id, "started stage");
                node
            }
        };
        Pipeline::new(self.context.clone(), node)
    }

    /// Append `f`, which doesn't preserve partitioning.
    pub fn map_partitions<F>(&self, f: F) -> Pipeline<F::Output, K, E>
    where
        F: PartitionFn<Input = T, Kind = K> + Into<K>,
    {
        self.map_partitions_with_index(f, false)
    }

    /// Resolve this node's remote handle, creating it on first demand.
    ///
    /// Every call on the same node returns the same handle object, and the
    /// engine is asked to create it at most once.
    #[instrument(skip(self), fields(node = %self.node.id), level = "debug")]
    pub fn remote_handle(&self) -> Result<RemoteHandle> {
        self.context.resolve(&self.node)
    }

    /// Ask the engine to keep this node's output. Later appends start a new
    /// stage reading it.
    pub fn cache(&self) -> Result<Self> {
        let handle = self.remote_handle()?;
        self.context.engine().persist(&handle)?;
        self.node.mark_cached();
        Ok(self.clone())
    }

    /// Ask the engine to checkpoint this node's output. Later appends start
    /// a new stage reading it.
    pub fn checkpoint(&self) -> Result<Self> {
        let handle = self.remote_handle()?;
        self.context.engine().checkpoint(&handle)?;
        self.node.mark_checkpointed();
        Ok(self.clone())
    }

    /// Have the engine serve this node's output and drain it with
    /// `collect`. Any failure is reported against this stage.
    fn collect_with<R>(
        &self,
        collect: impl FnOnce(&StreamCollector, u16) -> std::result::Result<R, CollectError>,
    ) -> Result<R> {
        let stage = self.node.id;
        self.remote_handle()
            .and_then(|handle| self.context.engine().collect_and_serve(&handle))
            .and_then(|port| Ok(collect(&self.context.inner.collector, port)?))
            .with_context(|| format!("collecting stage {stage}"))
    }

    /// Compute the pipeline and return its elements in partition order.
    #[instrument(skip(self), fields(node = %self.node.id), level = "debug")]
    pub fn collect(&self) -> Result<Vec<T>>
    where
        T: Serializable,
    {
        let serializer = self.context.serializer();
        self.collect_with(|collector, port| collector.collect_values(port, serializer))
    }
}

impl<K: FnKind, E: RemoteEngine> Pipeline<Vec<Value>, K, E> {
    /// Compute the pipeline and return its tuples as rows of `schema`.
    #[instrument(skip(self, schema), fields(node = %self.node.id), level = "debug")]
    pub fn collect_rows(&self, schema: Arc<RowSchema>) -> Result<Vec<Row>> {
        self.collect_with(|collector, port| collector.collect_rows(port, schema))
    }
}
