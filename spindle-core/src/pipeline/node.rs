use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use crate::{dispatch::SerializedMode, engine::RemoteHandle, transform::StageFn};

/// Position of a node in its context's arena.
///
/// Ids grow with creation order, and a node only ever refers to nodes with
/// smaller ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) enum NodeKind<K> {
    /// Data the engine already holds.
    Source,
    /// A fused stage reading the output of `prev`.
    Pipelined {
        func: StageFn<K>,
        prev: NodeId,
        prev_mode: SerializedMode,
    },
}

pub(crate) struct Node<K> {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind<K>,
    pub(crate) mode: SerializedMode,
    pub(crate) preserves_partitioning: bool,
    cached: AtomicBool,
    checkpointed: AtomicBool,
    /// Filled exactly once; the lock is held for the whole resolution.
    pub(crate) handle: Mutex<Option<RemoteHandle>>,
}

impl<K> Node<K> {
    pub(crate) fn source(id: NodeId, handle: RemoteHandle, mode: SerializedMode) -> Self {
        Self {
            id,
            kind: NodeKind::Source,
            mode,
            preserves_partitioning: true,
            cached: AtomicBool::new(false),
            checkpointed: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        }
    }

    pub(crate) fn pipelined(
        id: NodeId,
        func: StageFn<K>,
        prev: NodeId,
        prev_mode: SerializedMode,
        mode: SerializedMode,
        preserves_partitioning: bool,
    ) -> Self {
        Self {
            id,
            kind: NodeKind::Pipelined {
                func,
                prev,
                prev_mode,
            },
            mode,
            preserves_partitioning,
            cached: AtomicBool::new(false),
            checkpointed: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn is_cached(&self) -> bool {
        self.cached.load(Ordering::SeqCst)
    }

    pub(crate) fn is_checkpointed(&self) -> bool {
        self.checkpointed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_cached(&self) {
        self.cached.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_checkpointed(&self) {
        self.checkpointed.store(true, Ordering::SeqCst);
    }

    /// Only stage nodes whose output hasn't been materialized absorb new
    /// stages.
    pub(crate) fn is_pipelinable(&self) -> bool {
        matches!(self.kind, NodeKind::Pipelined { .. }) && !(self.is_cached() || self.is_checkpointed())
    }

    pub(crate) fn func(&self) -> Option<&StageFn<K>> {
        match &self.kind {
            NodeKind::Source => None,
            NodeKind::Pipelined { func, .. } => Some(func),
        }
    }

    pub(crate) fn prev(&self) -> Option<NodeId> {
        match &self.kind {
            NodeKind::Source => None,
            NodeKind::Pipelined { prev, .. } => Some(*prev),
        }
    }
}
