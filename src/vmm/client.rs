//! A typed client for the VMM's HTTP-over-UDS API (spec §4.3), grounded on
//! the teacher's `vm/api.rs` request shapes and `vmm/process.rs`'s
//! hyper-over-Unix-socket transport.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_client_sockets::{HyperUnixConnector, UnixUriExt};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum VmmClientError {
    #[error("could not build the API request: {0}")]
    RequestNotBuilt(http::Error),
    #[error("the API socket path could not be represented as a URI")]
    InvalidSocketUri,
    #[error("the underlying HTTP connection failed: {0}")]
    Transport(hyper_util::client::legacy::Error),
    #[error("could not read the response body: {0}")]
    BodyRead(hyper::Error),
    #[error("could not (de)serialize a request or response body: {0}")]
    Serde(serde_json::Error),
    #[error("the VMM rejected the request with status {status}: {body}")]
    VmmRejected { status: StatusCode, body: String },
    #[error("the VMM's API socket never accepted a connection within the boot grace period")]
    BootTimeout,
}

#[derive(Debug, Serialize)]
struct FaultMessage {
    fault_message: Option<String>,
}

/// A connection to one VM's VMM control socket. Cheap to clone: the
/// underlying hyper connection pool is reused.
#[derive(Debug, Clone)]
pub struct VmmClient {
    socket_path: PathBuf,
    http: Client<HyperUnixConnector, Full<Bytes>>,
}

impl VmmClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            http: Client::builder(TokioExecutor::new()).build(HyperUnixConnector),
        }
    }

    /// Retries connection-refused errors with bounded backoff (starting at
    /// 25ms, doubling, capped at 2s) until `max_wait` elapses. This is the
    /// only retry behavior in the client: once the VMM has accepted its
    /// first connection, every subsequent semantic error is surfaced as-is.
    pub async fn wait_ready(&self, max_wait: Duration) -> Result<(), VmmClientError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut backoff = Duration::from_millis(25);
        loop {
            if tokio::net::UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VmmClientError::BootTimeout);
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    pub async fn put_machine_config(&self, vcpu: u8, mem_mib: u32, smt: bool) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct MachineConfig {
            vcpu_count: u8,
            mem_size_mib: u32,
            smt: bool,
        }
        self.put("/machine-config", &MachineConfig {
            vcpu_count: vcpu,
            mem_size_mib: mem_mib,
            smt,
        })
        .await
    }

    pub async fn put_boot_source(&self, kernel_path: &Path, boot_args: &str) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct BootSource<'a> {
            kernel_image_path: &'a Path,
            boot_args: &'a str,
        }
        self.put("/boot-source", &BootSource {
            kernel_image_path: kernel_path,
            boot_args,
        })
        .await
    }

    pub async fn put_drive(
        &self,
        drive_id: &str,
        path: &Path,
        is_root: bool,
        is_read_only: bool,
    ) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct Drive<'a> {
            drive_id: &'a str,
            path_on_host: &'a Path,
            is_root_device: bool,
            is_read_only: bool,
        }
        self.put(
            &format!("/drives/{drive_id}"),
            &Drive {
                drive_id,
                path_on_host: path,
                is_root_device: is_root,
                is_read_only,
            },
        )
        .await
    }

    pub async fn put_network_interface(
        &self,
        iface_id: &str,
        host_tap: &str,
        mac: Option<&str>,
    ) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct NetIface<'a> {
            iface_id: &'a str,
            host_dev_name: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            guest_mac: Option<&'a str>,
        }
        self.put(
            &format!("/network-interfaces/{iface_id}"),
            &NetIface {
                iface_id,
                host_dev_name: host_tap,
                guest_mac: mac,
            },
        )
        .await
    }

    /// Establishes the vsock device; the VMM then itself creates listener
    /// sockets at `"{uds_path}_{port}"` for every port the guest targets
    /// (spec §4.3/§4.4).
    pub async fn put_vsock(&self, cid: u32, uds_path: &Path) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct Vsock<'a> {
            guest_cid: u32,
            uds_path: &'a Path,
        }
        self.put("/vsock", &Vsock { guest_cid: cid, uds_path }).await
    }

    pub async fn start(&self) -> Result<(), VmmClientError> {
        self.action("InstanceStart").await
    }

    pub async fn pause(&self) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct UpdateState {
            state: &'static str,
        }
        self.patch("/vm", &UpdateState { state: "Paused" }).await
    }

    pub async fn resume(&self) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct UpdateState {
            state: &'static str,
        }
        self.patch("/vm", &UpdateState { state: "Resumed" }).await
    }

    pub async fn snapshot_create(
        &self,
        snapshot_type: SnapshotType,
        mem_file_path: &Path,
        state_file_path: &Path,
    ) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct CreateSnapshot<'a> {
            snapshot_type: SnapshotType,
            mem_file_path: &'a Path,
            snapshot_path: &'a Path,
        }
        self.put(
            "/snapshot/create",
            &CreateSnapshot {
                snapshot_type,
                mem_file_path,
                snapshot_path: state_file_path,
            },
        )
        .await
    }

    pub async fn snapshot_load(
        &self,
        mem_file_path: &Path,
        state_file_path: &Path,
        resume: bool,
    ) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct MemBackend<'a> {
            backend_type: &'static str,
            backend_path: &'a Path,
        }
        #[derive(Serialize)]
        struct LoadSnapshot<'a> {
            snapshot_path: &'a Path,
            mem_backend: MemBackend<'a>,
            resume_vm: bool,
        }
        self.put(
            "/snapshot/load",
            &LoadSnapshot {
                snapshot_path: state_file_path,
                mem_backend: MemBackend {
                    backend_type: "File",
                    backend_path: mem_file_path,
                },
                resume_vm: resume,
            },
        )
        .await
    }

    async fn action(&self, action_type: &str) -> Result<(), VmmClientError> {
        #[derive(Serialize)]
        struct Action<'a> {
            action_type: &'a str,
        }
        self.put("/actions", &Action { action_type }).await
    }

    async fn put(&self, route: &str, body: &impl Serialize) -> Result<(), VmmClientError> {
        self.send::<_, ()>(route, "PUT", Some(body)).await.map(|_| ())
    }

    async fn patch(&self, route: &str, body: &impl Serialize) -> Result<(), VmmClientError> {
        self.send::<_, ()>(route, "PATCH", Some(body)).await.map(|_| ())
    }

    async fn send<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        route: &str,
        method: &str,
        body: Option<&B>,
    ) -> Result<Option<R>, VmmClientError> {
        let builder = Request::builder()
            .method(method)
            .uri(http::Uri::unix(&self.socket_path, route).map_err(|_| VmmClientError::InvalidSocketUri)?);
        let request = match body {
            Some(body) => {
                let json = serde_json::to_vec(body).map_err(VmmClientError::Serde)?;
                builder
                    .header("Content-Type", "application/json")
                    .body(Full::new(Bytes::from(json)))
            }
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(VmmClientError::RequestNotBuilt)?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(VmmClientError::Transport)?;
        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .map_err(VmmClientError::BodyRead)?
            .to_bytes();

        if !status.is_success() {
            return Err(VmmClientError::VmmRejected {
                status,
                body: String::from_utf8_lossy(&body_bytes).into_owned(),
            });
        }

        if body_bytes.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&body_bytes).map(Some).map_err(VmmClientError::Serde)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum SnapshotType {
    Full,
    Diff,
}
