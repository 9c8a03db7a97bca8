//! On-disk VM and snapshot descriptors (spec §3, §4.2).
//!
//! Reads are lockless; writes use write-to-temp + atomic rename with a
//! per-file advisory lock held for the entire update, same shape as
//! [`crate::allocator`]. Enumeration tolerates partial/corrupt files by
//! skipping and logging them rather than failing the whole listing.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StorageLayout;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("descriptor at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no descriptor found for {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Created,
    Booting,
    Running,
    Paused,
    Stopped,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub enabled: bool,
    #[serde(default)]
    pub tap_name: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mask: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VsockConfig {
    pub cid: u32,
    pub port: u16,
    pub uds_path: PathBuf,
}

/// Resource shape, immutable after create (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceShape {
    pub vcpu: u8,
    pub mem_mib: u32,
    pub disk_size_mib: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDescriptor {
    pub vm_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
    pub resources: ResourceShape,
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    #[serde(default)]
    pub vsock: Option<VsockConfig>,
    pub status: VmStatus,
    #[serde(default)]
    pub vmm_pid: Option<u32>,
    #[serde(default)]
    pub source_snapshot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmDescriptor {
    pub fn new(
        rootfs_path: PathBuf,
        kernel_path: PathBuf,
        resources: ResourceShape,
        name: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            vm_id: Uuid::new_v4().to_string(),
            name,
            rootfs_path,
            kernel_path,
            resources,
            network: None,
            vsock: None,
            status: VmStatus::Created,
            vmm_pid: None,
            source_snapshot_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub snapshot_id: String,
    pub name: Option<String>,
    pub source_vm_id: String,
    pub mem_file_path: PathBuf,
    pub state_file_path: PathBuf,
    pub rootfs_copy_path: PathBuf,
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub vsock_config: Option<VsockConfig>,
    #[serde(default)]
    pub network_config: Option<NetworkConfig>,
    pub resources: ResourceShape,
    pub created_at: DateTime<Utc>,
}

/// Flat-directory metadata store rooted at [`StorageLayout::root`].
#[derive(Debug, Clone)]
pub struct MetadataStore {
    layout: StorageLayout,
}

impl MetadataStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn save_vm(&self, descriptor: &VmDescriptor) -> Result<(), MetadataError> {
        write_json_atomic(&self.layout.metadata_path(&descriptor.vm_id), descriptor)
    }

    pub fn load_vm(&self, vm_id: &str) -> Result<VmDescriptor, MetadataError> {
        read_json(&self.layout.metadata_path(vm_id)).map_err(|err| match err {
            MetadataError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                MetadataError::NotFound(vm_id.to_string())
            }
            other => other,
        })
    }

    pub fn delete_vm(&self, vm_id: &str) -> Result<(), MetadataError> {
        let path = self.layout.metadata_path(vm_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MetadataError::Io { path, source }),
        }
    }

    /// Lists every VM descriptor in `metadata/`, skipping (and logging) any
    /// file that fails to parse, per spec §4.2.
    pub fn list_vms(&self) -> Result<Vec<VmDescriptor>, MetadataError> {
        let dir = self.layout.metadata_dir();
        std::fs::create_dir_all(&dir).map_err(|source| MetadataError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|source| MetadataError::Io {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| MetadataError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<VmDescriptor>(&path) {
                Ok(descriptor) => out.push(descriptor),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping corrupt VM descriptor");
                }
            }
        }
        Ok(out)
    }

    pub fn save_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<(), MetadataError> {
        let path = self
            .layout
            .snapshot_dir(&descriptor.snapshot_id)
            .join("descriptor.json");
        write_json_atomic(&path, descriptor)
    }

    pub fn load_snapshot(&self, snapshot_id: &str) -> Result<SnapshotDescriptor, MetadataError> {
        let path = self.layout.snapshot_dir(snapshot_id).join("descriptor.json");
        read_json(&path).map_err(|err| match err {
            MetadataError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                MetadataError::NotFound(snapshot_id.to_string())
            }
            other => other,
        })
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>, MetadataError> {
        let dir = self.layout.snapshots_dir();
        std::fs::create_dir_all(&dir).map_err(|source| MetadataError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|source| MetadataError::Io {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| MetadataError::Io {
                path: dir.clone(),
                source,
            })?;
            let descriptor_path = entry.path().join("descriptor.json");
            if !descriptor_path.exists() {
                continue;
            }
            match read_json::<SnapshotDescriptor>(&descriptor_path) {
                Ok(descriptor) => out.push(descriptor),
                Err(err) => {
                    tracing::warn!(path = %descriptor_path.display(), error = %err, "skipping corrupt snapshot descriptor");
                }
            }
        }
        Ok(out)
    }

    /// Removes a snapshot's files. Never touches descendant VMs (spec §4.8).
    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), MetadataError> {
        let dir = self.layout.snapshot_dir(snapshot_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MetadataError::Io { path: dir, source }),
        }
    }

    /// Builds a lookup of live (CID, port) -> vm_id, used by `Manager` to
    /// enforce the uniqueness invariant of spec §3 when reconciling.
    pub fn live_vsock_index(&self) -> Result<HashMap<(u32, u16), String>, MetadataError> {
        let mut index = HashMap::new();
        for descriptor in self.list_vms()? {
            if let Some(vsock) = descriptor.vsock {
                if matches!(descriptor.status, VmStatus::Running | VmStatus::Paused) {
                    index.insert((vsock.cid, vsock.port), descriptor.vm_id.clone());
                }
            }
        }
        Ok(index)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), MetadataError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| MetadataError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(path)
        .map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    flock(&file, FlockArg::LockExclusive).map_err(|e| MetadataError::Io {
        path: path.to_path_buf(),
        source: std::io::Error::from(e),
    })?;

    let serialized = serde_json::to_string_pretty(value).expect("descriptor always serializes");
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp_file = File::create(&tmp_path).map_err(|source| MetadataError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    tmp_file
        .write_all(serialized.as_bytes())
        .map_err(|source| MetadataError::Io {
            path: tmp_path.clone(),
            source,
        })?;
    tmp_file.sync_all().map_err(|source| MetadataError::Io {
        path: tmp_path.clone(),
        source,
    })?;
    std::fs::rename(&tmp_path, path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    drop(file);
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, MetadataError> {
    let contents = std::fs::read_to_string(path).map_err(|source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| MetadataError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &tempfile::TempDir) -> StorageLayout {
        StorageLayout::new(dir.path(), dir.path().join("vsock-isolation"))
    }

    #[test]
    fn round_trips_a_vm_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(layout(&dir));
        let descriptor = VmDescriptor::new(
            "/images/a.ext4".into(),
            "/images/vmlinux".into(),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 512,
            },
            Some("my-vm".to_string()),
        );
        store.save_vm(&descriptor).unwrap();
        let loaded = store.load_vm(&descriptor.vm_id).unwrap();
        assert_eq!(loaded.vm_id, descriptor.vm_id);
        assert_eq!(loaded.status, VmStatus::Created);
    }

    #[test]
    fn list_vms_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(layout(&dir));
        let descriptor = VmDescriptor::new(
            "/images/a.ext4".into(),
            "/images/vmlinux".into(),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 512,
            },
            None,
        );
        store.save_vm(&descriptor).unwrap();
        std::fs::write(store.layout().metadata_dir().join("garbage.json"), b"{not json").unwrap();

        let vms = store.list_vms().unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].vm_id, descriptor.vm_id);
    }

    #[test]
    fn delete_vm_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(layout(&dir));
        store.delete_vm("nonexistent").unwrap();
        store.delete_vm("nonexistent").unwrap();
    }
}
