//! Storage layout and tunables, resolved once behind a cheaply-cloneable
//! value rather than read ad hoc from the environment at each call site —
//! the same shape as the teacher's [`crate::vmm`] installation handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_STORAGE_ROOT: &str = "/var/lib/bandsox";
const DEFAULT_VSOCK_ISOLATION_ROOT: &str = "/tmp/bsx";
const DEFAULT_VSOCK_BASE: &str = "/tmp/bandsox";

/// The on-disk layout described in spec §6, rooted at `BANDSOX_STORAGE`
/// (default `/var/lib/bandsox`).
#[derive(Debug, Clone)]
pub struct StorageLayout(Arc<StorageLayoutInner>);

#[derive(Debug)]
struct StorageLayoutInner {
    root: PathBuf,
    vsock_isolation_root: PathBuf,
}

impl StorageLayout {
    /// Build a layout from the environment, falling back to the documented
    /// defaults when `BANDSOX_STORAGE` / `BANDSOX_VSOCK_ISOLATION_DIR` are
    /// unset.
    pub fn from_env() -> Self {
        let root = std::env::var_os("BANDSOX_STORAGE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT));
        let vsock_isolation_root = std::env::var_os("BANDSOX_VSOCK_ISOLATION_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_VSOCK_ISOLATION_ROOT));
        Self::new(root, vsock_isolation_root)
    }

    pub fn new(root: impl Into<PathBuf>, vsock_isolation_root: impl Into<PathBuf>) -> Self {
        Self(Arc::new(StorageLayoutInner {
            root: root.into(),
            vsock_isolation_root: vsock_isolation_root.into(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.0.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.0.root.join("images")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.0.root.join("snapshots")
    }

    pub fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.snapshots_dir().join(snapshot_id)
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.0.root.join("sockets")
    }

    pub fn vmm_socket_path(&self, vm_id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{vm_id}.sock"))
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.0.root.join("metadata")
    }

    pub fn metadata_path(&self, vm_id: &str) -> PathBuf {
        self.metadata_dir().join(format!("{vm_id}.json"))
    }

    pub fn cid_allocator_path(&self) -> PathBuf {
        self.0.root.join("cid_allocator.json")
    }

    pub fn port_allocator_path(&self) -> PathBuf {
        self.0.root.join("port_allocator.json")
    }

    /// Vsock UDS base in the default (non-isolated) mount namespace.
    pub fn vsock_uds_base(&self, vm_id: &str) -> PathBuf {
        PathBuf::from(DEFAULT_VSOCK_BASE).join(format!("vsock_{vm_id}.sock"))
    }

    /// Vsock UDS base as it is bound inside a per-restore mount namespace.
    pub fn isolated_vsock_uds_base(&self, vm_id: &str) -> PathBuf {
        self.0
            .vsock_isolation_root
            .join(vm_id)
            .join(format!("vsock_{vm_id}.sock"))
    }

    pub fn vsock_isolation_dir(&self, vm_id: &str) -> PathBuf {
        self.0.vsock_isolation_root.join(vm_id)
    }

    /// Root of guest-initiated file transfers (spec §4.4 `upload`/`download`).
    pub fn transfers_dir(&self) -> PathBuf {
        self.0.root.join("transfers")
    }

    /// Per-VM transfer directory; guest-supplied paths are sanitized and
    /// joined under this before any filesystem access.
    pub fn vm_transfers_dir(&self, vm_id: &str) -> PathBuf {
        self.transfers_dir().join(vm_id)
    }

    /// All directories that must exist before the store can be used.
    pub fn all_dirs(&self) -> [PathBuf; 5] {
        [
            self.images_dir(),
            self.snapshots_dir(),
            self.sockets_dir(),
            self.metadata_dir(),
            self.transfers_dir(),
        ]
    }
}

/// Tunables for the vsock accept path and agent timeouts (spec §4.4/§4.5/§5).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Bounded worker pool size dispatching accepted connections.
    pub worker_pool_size: usize,
    /// Maximum queued connections before the oldest idle one is closed.
    pub connection_queue_depth: usize,
    /// Idle duration after which a connection with no activity is closed.
    pub connection_idle_timeout: Duration,
    /// How long `boot` waits for the guest's `register` message before
    /// falling back to the serial bridge.
    pub registration_grace_period: Duration,
    /// How long the listener waits for a guest reconnect after
    /// ECONNRESET/EPIPE before falling back to serial.
    pub serial_fallback_window: Duration,
    /// Hard size cap for uploads/downloads carried over the serial fallback.
    pub serial_upload_cap_bytes: u64,
    /// Chunk size for streamed vsock file transfers.
    pub chunk_size_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            worker_pool_size: 64,
            connection_queue_depth: 256,
            connection_idle_timeout: Duration::from_secs(60),
            registration_grace_period: Duration::from_secs(5),
            serial_fallback_window: Duration::from_secs(2),
            serial_upload_cap_bytes: 8 * 1024 * 1024,
            chunk_size_bytes: 64 * 1024,
        }
    }
}
