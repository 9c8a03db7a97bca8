//! The host-side multi-port vsock listener (spec §4.4).
//!
//! The guest-initiated model is the only correct one: Firecracker proxies an
//! in-guest `AF_VSOCK(CID=2, port)` connect to a host Unix listener bound at
//! `"{uds_path}_{port}"`. This module owns exactly that: one accept task per
//! bound port, handing each accepted connection to a caller-supplied handler
//! through a bounded worker pool with backpressure (spec §5).

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::Limits;

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Handler = Arc<dyn Fn(UnixStream, u16) -> BoxFuture + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum VsockListenerError {
    #[error("failed to bind vsock listener socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A bounded FIFO of accepted-but-not-yet-handled connections. When a push
/// would exceed `capacity`, the oldest entry is evicted and its connection
/// dropped (closed), per spec §5's backpressure rule.
struct ConnectionQueue {
    items: Mutex<VecDeque<(UnixStream, u16)>>,
    notify: Notify,
    capacity: usize,
}

impl ConnectionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    async fn push(&self, stream: UnixStream, port: u16) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            if let Some(_dropped) = items.pop_front() {
                tracing::warn!(port, "connection queue full, closing oldest queued connection");
            }
        }
        items.push_back((stream, port));
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> (UnixStream, u16) {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A per-VM listener bound on one or more vsock listener ports
/// (`"{uds_path}_{port}"`). Dropping it closes every bound socket and aborts
/// its accept/worker tasks, which unblocks any in-flight `AgentSession`
/// waiters with `AgentDisconnected` (spec §5).
pub struct VsockListener {
    accept_tasks: Vec<JoinHandle<()>>,
    worker_tasks: Vec<JoinHandle<()>>,
    bound_paths: Vec<PathBuf>,
}

impl VsockListener {
    /// Binds `uds_base_path` suffixed with `_{port}` for every port in
    /// `ports`, removing any stale socket file first, then starts the
    /// accept loops and worker pool. `handler` is invoked once per accepted
    /// connection with the raw stream and the port it arrived on.
    pub async fn bind(
        uds_base_path: &Path,
        ports: &[u16],
        limits: Limits,
        handler: Handler,
    ) -> Result<Self, VsockListenerError> {
        let queue = Arc::new(ConnectionQueue::new(limits.connection_queue_depth));
        let mut bound_paths = Vec::new();
        let mut accept_tasks = Vec::new();

        for &port in ports {
            let path = listener_path(uds_base_path, port);
            let _ = std::fs::remove_file(&path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|source| VsockListenerError::Bind {
                    path: path.clone(),
                    source,
                })?;
            }
            let listener = UnixListener::bind(&path).map_err(|source| VsockListenerError::Bind {
                path: path.clone(),
                source,
            })?;
            bound_paths.push(path.clone());

            let queue = queue.clone();
            accept_tasks.push(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _addr)) => queue.push(stream, port).await,
                        Err(error) => {
                            tracing::warn!(port, %error, "vsock accept failed");
                            break;
                        }
                    }
                }
            }));
        }

        let mut worker_tasks = Vec::with_capacity(limits.worker_pool_size);
        for _ in 0..limits.worker_pool_size {
            let queue = queue.clone();
            let handler = handler.clone();
            let idle_timeout = limits.connection_idle_timeout;
            worker_tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, port) = queue.pop().await;
                    run_with_idle_guard(stream, port, idle_timeout, handler.clone()).await;
                }
            }));
        }

        Ok(Self {
            accept_tasks,
            worker_tasks,
            bound_paths,
        })
    }

    pub fn bound_paths(&self) -> &[PathBuf] {
        &self.bound_paths
    }

    /// Stops all accept/worker tasks and removes the bound socket files.
    /// Used both by `VmController::stop` and by `SnapshotEngine::create`,
    /// which must close the listener before asking the VMM to snapshot its
    /// vsock device.
    pub async fn shutdown(mut self) {
        for task in self.accept_tasks.drain(..) {
            task.abort();
        }
        for task in self.worker_tasks.drain(..) {
            task.abort();
        }
        for path in &self.bound_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn listener_path(uds_base_path: &Path, port: u16) -> PathBuf {
    let mut os_string = uds_base_path.as_os_str().to_owned();
    os_string.push(format!("_{port}"));
    PathBuf::from(os_string)
}

/// Runs `handler` against one accepted connection, aborting it if the whole
/// exchange (request/response, or a streaming transfer) takes longer than
/// `idle_timeout` without completing (spec §4.4).
async fn run_with_idle_guard(stream: UnixStream, port: u16, idle_timeout: Duration, handler: Handler) {
    match tokio::time::timeout(idle_timeout, handler(stream, port)).await {
        Ok(()) => {}
        Err(_) => tracing::debug!(port, "closing vsock connection idle for >{idle_timeout:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn accepts_connections_on_every_bound_port() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("vsock.sock");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let handler: Handler = Arc::new(move |_stream, _port| {
            let count = count_clone.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        });

        let listener = VsockListener::bind(&base, &[9001, 9002], Limits::default(), handler)
            .await
            .unwrap();
        assert_eq!(listener.bound_paths().len(), 2);

        let mut conn = UnixStream::connect(listener_path(&base, 9001)).await.unwrap();
        conn.write_all(b"x").await.unwrap();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        listener.shutdown().await;
        assert!(!listener_path(&base, 9001).exists());
    }
}
