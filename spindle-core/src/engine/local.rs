use std::{
    io::{self, BufWriter},
    marker::PhantomData,
    net::{SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, instrument, trace};

use super::{CreateNodeRequest, RemoteEngine, RemoteHandle};
use crate::{
    config::Config,
    dispatch::Command,
    transform::FnKind,
    wire::FrameWriter,
    worker,
};

type Partitions = Arc<Vec<Vec<Bytes>>>;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone)]
enum LocalNode {
    Source(Partitions),
    Stage {
        parent: RemoteHandle,
        command: Command,
        preserves_partitioning: bool,
    },
}

#[derive(Clone)]
struct NodeEntry {
    node: LocalNode,
    persisted: bool,
    checkpointed: bool,
    // Shared by every clone of the entry; held while the node is computed.
    materialized: Arc<Mutex<Option<Partitions>>>,
}

impl NodeEntry {
    fn new(node: LocalNode) -> Self {
        Self {
            node,
            persisted: false,
            checkpointed: false,
            materialized: Arc::default(),
        }
    }
}

/// Where stages of a [`LocalEngine`] run.
#[derive(Clone, Copy, Debug)]
enum Executor {
    InProcess,
    Worker(SocketAddr),
}

/// An in-process stand-in for the remote engine.
///
/// Source partitions are held as serialized batches. Stage nodes record
/// their command and are computed on demand, either in process with
/// [`worker::execute`] or by dispatching each partition to a worker
/// process. Persisted and checkpointed nodes are computed at most once.
///
/// Collection serves the computed batches on a one-shot loopback server,
/// exactly like a real engine serves results to the row collector.
///
/// This is useful for tests and for running pipelines without a cluster.
pub struct LocalEngine<K> {
    nodes: DashMap<Arc<str>, NodeEntry>,
    next_id: AtomicUsize,
    stage_runs: AtomicUsize,
    batch_size: usize,
    collect_host: String,
    result_timeout: Duration,
    executor: Executor,
    _kind: PhantomData<K>,
}

impl<K: FnKind> Default for LocalEngine<K> {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl<K: FnKind> LocalEngine<K> {
    pub fn from_config(config: &Config) -> Self {
        Self {
            nodes: DashMap::new(),
            next_id: AtomicUsize::new(0),
            stage_runs: AtomicUsize::new(0),
            batch_size: config.batch_size,
            collect_host: config.collect_host.clone(),
            result_timeout: Duration::from_millis(config.result_timeout_ms),
            executor: Executor::InProcess,
            _kind: PhantomData,
        }
    }

    /// Run stages on the worker listening at `addr` instead of in process.
    pub fn with_worker(mut self, addr: SocketAddr) -> Self {
        self.executor = Executor::Worker(addr);
        self
    }

    /// Number of partition executions performed so far.
    pub fn stage_runs(&self) -> usize {
        self.stage_runs.load(Ordering::SeqCst)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn register(&self, prefix: &str, node: LocalNode) -> RemoteHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = RemoteHandle::new(format!("{prefix}-{id}"));
        self.nodes.insert(handle.0.clone(), NodeEntry::new(node));
        handle
    }

    fn entry(&self, handle: &RemoteHandle) -> Result<NodeEntry> {
        self.nodes
            .get(handle.id())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow!("unknown remote handle {handle}"))
    }

    fn update(&self, handle: &RemoteHandle, f: impl FnOnce(&mut NodeEntry)) -> Result<()> {
        let mut entry = self
            .nodes
            .get_mut(handle.id())
            .ok_or_else(|| anyhow!("unknown remote handle {handle}"))?;
        f(entry.value_mut());
        Ok(())
    }

    fn run_partition(&self, command: &Command, split: usize, batches: &[Bytes]) -> Result<Vec<Bytes>> {
        self.stage_runs.fetch_add(1, Ordering::SeqCst);
        match self.executor {
            Executor::InProcess => {
                let mut output = Vec::new();
                worker::execute::<K, _, _>(
                    command,
                    split,
                    batches.iter().cloned().map(Ok),
                    self.batch_size,
                    |batch| {
                        output.push(Bytes::from(batch));
                        Ok(())
                    },
                )?;
                Ok(output)
            }
            Executor::Worker(addr) => worker::dispatch(addr, command, split, batches),
        }
    }

    /// Compute the batches of every partition of `handle`.
    ///
    /// Persisted and checkpointed nodes are computed under their
    /// materialization lock, so concurrent callers wait for the first
    /// computation instead of repeating it. DashMap guards are never held
    /// across the recursion into parents.
    fn partitions(&self, handle: &RemoteHandle) -> Result<Partitions> {
        let entry = self.entry(handle)?;
        if !(entry.persisted || entry.checkpointed) {
            return self.compute(handle, entry.node);
        }

        let mut materialized = entry
            .materialized
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(partitions) = materialized.as_ref() {
            trace!(%handle, "using materialized partitions");
            return Ok(partitions.clone());
        }

        let partitions = self.compute(handle, entry.node)?;
        debug!(%handle, "materializing node");
        *materialized = Some(partitions.clone());
        if entry.checkpointed {
            self.update(handle, |entry| entry.node = LocalNode::Source(partitions.clone()))?;
        }
        Ok(partitions)
    }

    fn compute(&self, handle: &RemoteHandle, node: LocalNode) -> Result<Partitions> {
        match node {
            LocalNode::Source(partitions) => Ok(partitions),
            LocalNode::Stage {
                parent, command, ..
            } => {
                let input = self.partitions(&parent)?;
                let output = input
                    .iter()
                    .enumerate()
                    .map(|(split, batches)| self.run_partition(&command, split, batches))
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("computing {handle}"))?;
                Ok(Arc::new(output))
            }
        }
    }

    /// Whether the stage node keeps the partitioning of its parent.
    pub fn preserves_partitioning(&self, handle: &RemoteHandle) -> Result<bool> {
        Ok(match self.entry(handle)?.node {
            LocalNode::Source(_) => true,
            LocalNode::Stage {
                preserves_partitioning,
                ..
            } => preserves_partitioning,
        })
    }
}

/// Accept one connection and write every batch, then the terminator.
///
/// Gives up when nobody connects within `timeout`; the listener is closed
/// on return either way.
fn serve_batches(listener: TcpListener, partitions: &[Vec<Bytes>], timeout: Duration) -> Result<()> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    let stream = loop {
        match listener.accept() {
            Ok((stream, _)) => break stream,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    bail!("no collector connected within {timeout:?}");
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    };
    stream.set_nonblocking(false)?;

    let mut writer = FrameWriter::new(BufWriter::new(stream));
    for batch in partitions.iter().flatten() {
        writer.write_frame(batch)?;
    }
    writer.write_end_of_stream()?;
    writer.flush()?;
    Ok(())
}

impl<K: FnKind> RemoteEngine for LocalEngine<K> {
    #[instrument(skip_all, level = "debug")]
    fn parallelize(&self, partitions: Vec<Vec<Bytes>>) -> Result<RemoteHandle> {
        let handle = self.register("source", LocalNode::Source(Arc::new(partitions)));
        debug!(%handle, "registered source");
        Ok(handle)
    }

    #[instrument(skip_all, level = "debug")]
    fn create_pipelined_node(&self, request: CreateNodeRequest) -> Result<RemoteHandle> {
        let [parent] = <[RemoteHandle; 1]>::try_from(request.parents).map_err(|parents| {
            anyhow!("local stages read exactly one parent, got {}", parents.len())
        })?;
        self.entry(&parent)?;
        let command = Command::from_bytes(&request.command)?;

        let handle = self.register(
            "node",
            LocalNode::Stage {
                parent,
                command,
                preserves_partitioning: request.preserves_partitioning,
            },
        );
        debug!(%handle, "registered stage");
        Ok(handle)
    }

    #[instrument(skip(self), level = "debug")]
    fn persist(&self, handle: &RemoteHandle) -> Result<()> {
        self.update(handle, |entry| entry.persisted = true)
    }

    #[instrument(skip(self), level = "debug")]
    fn checkpoint(&self, handle: &RemoteHandle) -> Result<()> {
        self.update(handle, |entry| entry.checkpointed = true)
    }

    #[instrument(skip(self), level = "debug")]
    fn collect_and_serve(&self, handle: &RemoteHandle) -> Result<u16> {
        let partitions = self.partitions(handle)?;
        let listener = TcpListener::bind((self.collect_host.as_str(), 0))?;
        let port = listener.local_addr()?.port();
        ensure!(port != 0, "result server did not get a port");

        let served = handle.clone();
        let timeout = self.result_timeout;
        thread::Builder::new()
            .name(format!("serve-{handle}"))
            .spawn(move || {
                if let Err(e) = serve_batches(listener, &partitions, timeout) {
                    error!("Failed to serve results of {served} {e:#}");
                }
            })?;

        debug!(port, "serving results");
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collect::StreamCollector,
        dispatch::SerializedMode,
        serializer::Serializer,
        testing::{KeepEven, Scale, TestFns},
        transform::StageFn,
    };

    fn batch(values: &[i64]) -> Bytes {
        Bytes::from(Serializer::Postcard.to_bytes(&values).unwrap())
    }

    fn stage(engine: &LocalEngine<TestFns>, parent: &RemoteHandle, func: StageFn<TestFns>) -> RemoteHandle {
        let command = Command::for_stage(
            0,
            &func,
            SerializedMode::Byte,
            SerializedMode::Byte,
            Serializer::Postcard,
        )
        .unwrap();
        engine
            .create_pipelined_node(CreateNodeRequest {
                parents: vec![parent.clone()],
                command: command.to_bytes().unwrap(),
                preserves_partitioning: false,
            })
            .unwrap()
    }

    fn collect(engine: &LocalEngine<TestFns>, handle: &RemoteHandle) -> Vec<i64> {
        let port = engine.collect_and_serve(handle).unwrap();
        StreamCollector::new("127.0.0.1")
            .collect_values::<i64>(port, Serializer::Postcard)
            .unwrap()
    }

    #[test]
    fn stages_run_over_every_partition() {
        let engine = LocalEngine::<TestFns>::default();
        let source = engine
            .parallelize(vec![vec![batch(&[1, 2])], vec![batch(&[3]), batch(&[4])]])
            .unwrap();
        let node = stage(&engine, &source, StageFn::single(Scale(10)));
        assert_eq!(collect(&engine, &node), vec![10, 20, 30, 40]);
        assert_eq!(engine.stage_runs(), 2);
        assert!(!engine.preserves_partitioning(&node).unwrap());
    }

    #[test]
    fn persisted_nodes_are_computed_once() {
        let engine = LocalEngine::<TestFns>::default();
        let source = engine.parallelize(vec![vec![batch(&[1, 2, 3, 4])]]).unwrap();
        let scaled = stage(&engine, &source, StageFn::single(Scale(3)));
        engine.persist(&scaled).unwrap();
        let even = stage(&engine, &scaled, StageFn::single(KeepEven));

        assert_eq!(collect(&engine, &even), vec![6, 12]);
        assert_eq!(collect(&engine, &even), vec![6, 12]);
        assert_eq!(collect(&engine, &scaled), vec![3, 6, 9, 12]);
        // `scaled` once, `even` twice.
        assert_eq!(engine.stage_runs(), 3);
    }

    #[test]
    fn concurrent_collections_materialize_once() {
        let engine = LocalEngine::<TestFns>::default();
        let source = engine
            .parallelize(vec![vec![batch(&[1, 2])], vec![batch(&[3])]])
            .unwrap();
        let scaled = stage(&engine, &source, StageFn::single(Scale(2)));
        engine.persist(&scaled).unwrap();

        let results: Vec<Vec<i64>> = thread::scope(|scope| {
            let collectors: Vec<_> = (0..6)
                .map(|_| scope.spawn(|| collect(&engine, &scaled)))
                .collect();
            collectors.into_iter().map(|c| c.join().unwrap()).collect()
        });

        assert!(results.iter().all(|values| values == &[2, 4, 6]));
        // One run per partition, shared by every caller.
        assert_eq!(engine.stage_runs(), 2);
    }

    #[test]
    fn result_server_closes_when_nobody_connects() {
        let config = Config {
            result_timeout_ms: 50,
            ..Config::default()
        };
        let engine = LocalEngine::<TestFns>::from_config(&config);
        let source = engine.parallelize(vec![vec![batch(&[1])]]).unwrap();

        let port = engine.collect_and_serve(&source).unwrap();
        thread::sleep(Duration::from_millis(500));
        assert!(std::net::TcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[test]
    fn requests_are_validated() {
        let engine = LocalEngine::<TestFns>::default();
        let source = engine.parallelize(vec![]).unwrap();
        let unknown = RemoteHandle::new("node-404");

        assert!(engine.persist(&unknown).is_err());
        assert!(engine.collect_and_serve(&unknown).is_err());
        assert!(engine
            .create_pipelined_node(CreateNodeRequest {
                parents: vec![source.clone(), source.clone()],
                command: Bytes::new(),
                preserves_partitioning: true,
            })
            .is_err());
        assert!(engine
            .create_pipelined_node(CreateNodeRequest {
                parents: vec![source],
                command: Bytes::from_static(b"junk"),
                preserves_partitioning: true,
            })
            .is_err());
        assert_eq!(engine.node_count(), 1);
    }
}
