//! Worker side execution of dispatched stages.
//!
//! A worker receives a [`Command`](crate::dispatch::Command) and the input
//! batches of one partition, runs the composed function and streams the
//! encoded output batches back.
//!
//! - [`execute`]: the transport-agnostic executor.
//! - [`handle_connection`] / [`dispatch`]: the two ends of the worker
//!   connection protocol.
//! - [`WorkerRuntime`]: a TCP server that serves one task per connection.
//!
//! # Connection protocol
//!
//! One connection carries one task. The client writes:
//! 1. the encoded command as a frame;
//! 2. the split index as an int;
//! 3. one frame per input batch, then a zero-length frame.
//!
//! The worker answers with one frame per output batch and a zero-length
//! frame, or with [`FAILURE_MARKER`] followed by an error message string.
use std::{future::Future, io, marker::PhantomData, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, debug_span, error, info};

use crate::{config::Config, transform::FnKind};

mod executor;
mod protocol;

pub use executor::*;
pub use protocol::*;

/// Serves tasks for the registry `K` over TCP.
///
/// Connections are accepted on the async runtime and each task runs on a
/// blocking thread, since execution and framing are synchronous.
///
/// # Example
/// ```no_run
/// use anyhow::Result;
/// use clap::Parser;
/// use serde::{Deserialize, Serialize};
/// use spindle::{
///     config::Config,
///     transform::{FnKind, PartitionFn, PartitionStream},
///     worker::WorkerRuntime,
/// };
///
/// # #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
/// # struct Negate;
/// # impl PartitionFn for Negate {
/// #     type Input = i64;
/// #     type Output = i64;
/// #     type Kind = MyFns;
/// #     fn apply<'a>(&'a self, _: usize, input: PartitionStream<'a, i64>) -> PartitionStream<'a, i64> {
/// #         Box::new(input.map(|v| v.map(|v| -v)))
/// #     }
/// # }
/// #[derive(FnKind, Serialize, Deserialize, Debug, Clone, Copy)]
/// enum MyFns {
///     // ... your transformations
/// #   Negate(Negate),
/// }
///
/// #[derive(Parser, Debug)]
/// pub struct Cli {
///     #[command(flatten)]
///     pub options: Config,
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let args = Cli::parse();
///     let runtime: WorkerRuntime<MyFns> =
///         WorkerRuntime::from_config(&args.options, "0.0.0.0:7077").await?;
///     runtime.serve().await
/// }
/// ```
pub struct WorkerRuntime<K> {
    listener: TcpListener,
    batch_size: usize,
    _kind: PhantomData<K>,
}

impl<K: FnKind> WorkerRuntime<K> {
    /// Bind a listener on `listen` using the batch size from `config`.
    pub async fn from_config(config: &Config, listen: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!(addr = %listener.local_addr()?, "worker listening");
        Ok(Self {
            listener,
            batch_size: config.batch_size,
            _kind: PhantomData,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve tasks until the process is stopped.
    pub async fn serve(self) -> Result<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Serve tasks until `shutdown` resolves.
    ///
    /// Tasks already running are left to finish on their blocking threads.
    pub async fn serve_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("worker shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    if let Err(e) = self.spawn_task(accepted) {
                        error!("Failed to start task {e:#}");
                    }
                }
            }
        }
    }

    /// Hand an accepted connection to a blocking thread.
    ///
    /// Errors only concern this connection; the accept loop keeps going.
    fn spawn_task(&self, accepted: io::Result<(TcpStream, SocketAddr)>) -> Result<()> {
        let (stream, peer) = accepted.context("accepting connection")?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;

        let batch_size = self.batch_size;
        let span = debug_span!("task", %peer);
        tokio::task::spawn_blocking(move || {
            let _guard = span.enter();
            let served = stream
                .try_clone()
                .map_err(anyhow::Error::from)
                .and_then(|reader| handle_connection::<K, _, _>(reader, stream, batch_size));
            if let Ok(stats) = served {
                debug!(?stats, "task completed");
            }
        });
        Ok(())
    }
}
