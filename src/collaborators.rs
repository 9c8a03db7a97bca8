//! Trait boundaries for the two external collaborators `VmController` calls
//! through but does not implement (spec §1): image construction and network
//! provisioning. Real implementations (container unpacking, TAP/bridge/NAT
//! setup) are out of scope; only the interface and in-memory test fakes live
//! here.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::metadata::NetworkConfig;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("image build failed: {0}")]
    ImageBuild(String),
    #[error("network provisioning failed: {0}")]
    Network(String),
}

/// Resolves a container image reference to a bootable ext4 rootfs.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, image_ref: &str, size_hint_mib: u32) -> Result<BuiltImage, CollaboratorError>;
}

/// Sets up (and tears down) the host-side networking — TAP device, bridge
/// membership, NAT rules — for one VM. `provision` runs before boot;
/// `teardown` runs on delete.
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    async fn provision(&self, vm_id: &str) -> Result<NetworkConfig, CollaboratorError>;
    async fn teardown(&self, vm_id: &str, config: &NetworkConfig) -> Result<(), CollaboratorError>;
}

/// A provisioner for VMs that opt out of networking (`net=false`).
pub struct NoNetworkProvisioner;

#[async_trait]
impl NetworkProvisioner for NoNetworkProvisioner {
    async fn provision(&self, _vm_id: &str) -> Result<NetworkConfig, CollaboratorError> {
        Ok(NetworkConfig {
            enabled: false,
            tap_name: None,
            mac: None,
            ip: None,
            mask: None,
            gateway: None,
        })
    }

    async fn teardown(&self, _vm_id: &str, _config: &NetworkConfig) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg(test)]
pub mod fakes {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Always returns the same pre-built rootfs/kernel pair, as if the image
    /// had already been unpacked onto disk by a test fixture.
    pub struct FakeImageBuilder {
        pub rootfs_path: PathBuf,
        pub kernel_path: PathBuf,
        pub calls: AtomicUsize,
    }

    impl FakeImageBuilder {
        pub fn new(rootfs_path: PathBuf, kernel_path: PathBuf) -> Self {
            Self {
                rootfs_path,
                kernel_path,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ImageBuilder for FakeImageBuilder {
        async fn build(&self, _image_ref: &str, _size_hint_mib: u32) -> Result<BuiltImage, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BuiltImage {
                rootfs_path: self.rootfs_path.clone(),
                kernel_path: self.kernel_path.clone(),
            })
        }
    }

    /// Hands out incrementing fake TAP names; teardown just records calls.
    pub struct FakeNetworkProvisioner {
        next_tap: AtomicUsize,
        pub torn_down: Mutex<Vec<String>>,
    }

    impl Default for FakeNetworkProvisioner {
        fn default() -> Self {
            Self {
                next_tap: AtomicUsize::new(0),
                torn_down: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NetworkProvisioner for FakeNetworkProvisioner {
        async fn provision(&self, vm_id: &str) -> Result<NetworkConfig, CollaboratorError> {
            let n = self.next_tap.fetch_add(1, Ordering::SeqCst);
            let _ = vm_id;
            Ok(NetworkConfig {
                enabled: true,
                tap_name: Some(format!("tap{n}")),
                mac: Some(format!("02:00:00:00:{n:02x}:01")),
                ip: Some("172.16.0.1".to_string()),
                mask: Some("255.255.255.252".to_string()),
                gateway: Some("172.16.0.2".to_string()),
            })
        }

        async fn teardown(&self, vm_id: &str, _config: &NetworkConfig) -> Result<(), CollaboratorError> {
            self.torn_down.lock().unwrap().push(vm_id.to_string());
            Ok(())
        }
    }
}
