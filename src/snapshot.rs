//! Snapshot create/restore (spec §4.8).
//!
//! `create` requires the VM already `Paused`, briefly takes the vsock
//! listener offline around `VmmClient::snapshot_create` so the VMM's vsock
//! device isn't racing an accept loop, then reopens it before returning.
//! `restore` assembles a brand-new `VmController` whose VMM is launched in a
//! private mount namespace: the VMM's restored state references the
//! snapshot's original UDS path verbatim, so two concurrent restores of the
//! same snapshot would otherwise collide trying to bind that same path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::agent::AgentSession;
use crate::allocator::{CidAllocator, PortAllocator};
use crate::collaborators::NetworkProvisioner;
use crate::config::{Limits, StorageLayout};
use crate::error::BandsoxError;
use crate::metadata::{MetadataStore, SnapshotDescriptor, VmDescriptor, VmStatus, VsockConfig};
use crate::vm_controller::{self, VmController};
use crate::vmm::client::{SnapshotType, VmmClient};
use crate::vmm::process::VmmProcess;
use crate::vsock::listener::VsockListener;

const RESTORE_BOOT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Builds and restores VM snapshots. Holds nothing per-VM; every method
/// takes the `VmController`/allocators it needs as arguments.
#[derive(Clone)]
pub struct SnapshotEngine {
    layout: StorageLayout,
    limits: Limits,
    metadata: MetadataStore,
    vmm_binary_path: PathBuf,
}

impl SnapshotEngine {
    pub fn new(layout: StorageLayout, limits: Limits, metadata: MetadataStore, vmm_binary_path: PathBuf) -> Self {
        Self {
            layout,
            limits,
            metadata,
            vmm_binary_path,
        }
    }

    /// `controller`'s VM must already be `Paused`. Takes the vsock listener
    /// offline, snapshots memory/state, copies the rootfs, writes the
    /// descriptor, then reopens the listener unconditionally so a later
    /// `resume` has somewhere for the guest to reconnect — even if the
    /// snapshot itself failed partway through.
    pub async fn create(&self, controller: &VmController, name: Option<String>) -> Result<SnapshotDescriptor, BandsoxError> {
        let descriptor = controller.descriptor().await;
        if descriptor.status != VmStatus::Paused {
            return Err(BandsoxError::StateConflict(format!(
                "snapshot requires status Paused, found {:?}",
                descriptor.status
            )));
        }
        let client = controller
            .vmm_client()
            .await
            .ok_or_else(|| BandsoxError::Internal(format!("vm {} has no VMM client", descriptor.vm_id)))?;

        let snapshot_id = Uuid::new_v4().to_string();
        let snapshot_dir = self.layout.snapshot_dir(&snapshot_id);
        std::fs::create_dir_all(&snapshot_dir)?;
        let mem_file_path = snapshot_dir.join("mem.bin");
        let state_file_path = snapshot_dir.join("state.bin");
        let rootfs_copy_path = snapshot_dir.join("rootfs.ext4");

        controller.quiesce_vsock_for_snapshot().await?;
        let snapshot_result = client.snapshot_create(SnapshotType::Full, &mem_file_path, &state_file_path).await;
        // The VM is expected to stay usable after `create` returns regardless
        // of whether the snapshot itself succeeded, so the listener always
        // comes back before we propagate any error.
        controller.reopen_vsock_after_snapshot().await?;
        snapshot_result?;

        std::fs::copy(&descriptor.rootfs_path, &rootfs_copy_path)?;

        let snapshot = SnapshotDescriptor {
            snapshot_id,
            name,
            source_vm_id: descriptor.vm_id,
            mem_file_path,
            state_file_path,
            rootfs_copy_path,
            kernel_path: descriptor.kernel_path,
            vsock_config: descriptor.vsock,
            network_config: descriptor.network,
            resources: descriptor.resources,
            created_at: Utc::now(),
        };
        self.metadata.save_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    /// Restores `snapshot_id` into a freshly assembled `VmController`. Reuses
    /// the snapshot's CID unchanged (spec §9: the guest's in-memory state
    /// references it, and rewriting the VMM's saved state to reassign it is
    /// out of scope — no `CidAllocator` draw happens here), allocates a fresh
    /// control port, and runs the VMM child in a private mount namespace
    /// bind-mounting a per-VM directory over the snapshot's original UDS
    /// path's parent so concurrent restores of the same snapshot never
    /// collide on that path (spec §4.8).
    pub async fn restore(
        &self,
        snapshot_id: &str,
        port_allocator: &PortAllocator,
        network: Arc<dyn NetworkProvisioner>,
        resume: bool,
    ) -> Result<VmController, BandsoxError> {
        let snapshot = self
            .metadata
            .load_snapshot(snapshot_id)
            .map_err(|error| match error {
                crate::metadata::MetadataError::NotFound(id) => BandsoxError::NotFound(id),
                other => other.into(),
            })?;
        let source_vsock = snapshot
            .vsock_config
            .clone()
            .ok_or_else(|| BandsoxError::Internal(format!("snapshot {snapshot_id} has no vsock config")))?;

        let mut descriptor = VmDescriptor::new(
            PathBuf::new(),
            snapshot.kernel_path.clone(),
            snapshot.resources,
            snapshot.name.clone(),
        );
        descriptor.source_snapshot_id = Some(snapshot_id.to_string());
        let vm_id = descriptor.vm_id.clone();
        descriptor.rootfs_path = self.layout.images_dir().join(format!("{vm_id}.ext4"));
        std::fs::create_dir_all(self.layout.images_dir())?;
        std::fs::copy(&snapshot.rootfs_copy_path, &descriptor.rootfs_path)?;

        let port = match port_allocator.acquire() {
            Ok(port) => port,
            Err(error) => {
                let _ = std::fs::remove_file(&descriptor.rootfs_path);
                return Err(error.into());
            }
        };

        let isolation_dir = self.layout.vsock_isolation_dir(&vm_id);
        let restore_result = self
            .restore_inner(&snapshot, &mut descriptor, &isolation_dir, source_vsock, port, network, resume)
            .await;
        if restore_result.is_err() {
            port_allocator.release(port).ok();
            let _ = std::fs::remove_file(&descriptor.rootfs_path);
        }

        restore_result
    }

    #[allow(clippy::too_many_arguments)]
    async fn restore_inner(
        &self,
        snapshot: &SnapshotDescriptor,
        descriptor: &mut VmDescriptor,
        isolation_dir: &std::path::Path,
        source_vsock: VsockConfig,
        port: u16,
        network: Arc<dyn NetworkProvisioner>,
        resume: bool,
    ) -> Result<VmController, BandsoxError> {
        let vm_id = descriptor.vm_id.clone();
        std::fs::create_dir_all(isolation_dir)?;
        let original_filename = source_vsock
            .uds_path
            .file_name()
            .ok_or_else(|| BandsoxError::Internal("snapshot vsock uds_path has no file name".into()))?;
        let isolated_uds_path = isolation_dir.join(original_filename);
        let bind_over = source_vsock
            .uds_path
            .parent()
            .ok_or_else(|| BandsoxError::Internal("snapshot vsock uds_path has no parent directory".into()))?
            .to_path_buf();
        std::fs::create_dir_all(&bind_over)?;
        // The VMM's restored state references this exact path; clear any
        // socket a previous restore of the same snapshot left behind.
        let _ = std::fs::remove_file(&isolated_uds_path);

        // Re-provisioning host-side networking for a restored VM isn't
        // specified (spec §4.8 only calls for drive/kernel to be configured
        // identically), so the restored VM starts without one; the network
        // config is still retained on the snapshot descriptor for reference.
        descriptor.network = None;
        descriptor.vsock = Some(VsockConfig {
            cid: source_vsock.cid,
            port,
            uds_path: isolated_uds_path.clone(),
        });
        self.metadata.save_vm(descriptor)?;

        let socket_path = self.layout.vmm_socket_path(&vm_id);
        let mut process = VmmProcess::spawn_isolated(&self.vmm_binary_path, &socket_path, true, isolation_dir.to_path_buf(), bind_over)
            .map_err(|error| BandsoxError::BootFailed { reason: error.to_string() })?;

        let client = VmmClient::new(socket_path.clone());
        if let Err(error) = self.configure_restored(&client, descriptor, snapshot, port, resume).await {
            let _ = process.send_sigkill();
            return Err(error);
        }
        let _ = process.try_wait();

        let transfers_dir = self.layout.vm_transfers_dir(&vm_id);
        let agent = Arc::new(AgentSession::new(vm_id.clone(), isolated_uds_path.clone(), port, self.limits, transfers_dir));
        let controller = VmController::new(
            descriptor.clone(),
            self.layout.clone(),
            self.limits,
            self.metadata.clone(),
            CidAllocator::new(self.layout.cid_allocator_path()),
            PortAllocator::new(self.layout.port_allocator_path()),
            self.vmm_binary_path.clone(),
            network,
        );
        let handler = controller.build_vsock_handler(agent.clone());
        let listener = VsockListener::bind(&isolated_uds_path, &[port], self.limits, handler)
            .await
            .map_err(|error| {
                let _ = process.send_sigkill();
                BandsoxError::Internal(error.to_string())
            })?;

        if resume {
            let registered =
                tokio::time::timeout(self.limits.registration_grace_period, vm_controller::wait_until_registered(&agent))
                    .await
                    .is_ok();
            if !registered {
                tracing::warn!(vm_id = %vm_id, "guest did not re-register after restore within the grace period; using serial");
                if let Some(serial_io) = process.take_serial_io() {
                    agent.attach_serial(serial_io).await;
                }
            }
        }

        let status = if resume { VmStatus::Running } else { VmStatus::Paused };
        controller.finish_boot(process, client, listener, agent, status).await?;
        Ok(controller)
    }

    async fn configure_restored(
        &self,
        client: &VmmClient,
        descriptor: &VmDescriptor,
        snapshot: &SnapshotDescriptor,
        port: u16,
        resume: bool,
    ) -> Result<(), BandsoxError> {
        client.wait_ready(RESTORE_BOOT_GRACE_PERIOD).await?;
        client
            .put_machine_config(descriptor.resources.vcpu, descriptor.resources.mem_mib, false)
            .await?;
        client.put_boot_source(&descriptor.kernel_path, &vm_controller::boot_args(port)).await?;
        client.put_drive("rootfs", &descriptor.rootfs_path, true, false).await?;
        client.snapshot_load(&snapshot.mem_file_path, &snapshot.state_file_path, resume).await?;
        Ok(())
    }
}

/// Removes a snapshot's files. Never touches descendant VMs restored from it
/// (spec §4.8).
pub fn delete(metadata: &MetadataStore, snapshot_id: &str) -> Result<(), BandsoxError> {
    metadata.delete_snapshot(snapshot_id)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeNetworkProvisioner;
    use crate::metadata::ResourceShape;

    fn layout(dir: &tempfile::TempDir) -> StorageLayout {
        StorageLayout::new(dir.path(), dir.path().join("vsock-isolation"))
    }

    #[tokio::test]
    async fn create_rejects_a_non_paused_vm() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let metadata = MetadataStore::new(layout.clone());
        let descriptor = VmDescriptor::new(
            dir.path().join("rootfs.ext4"),
            dir.path().join("vmlinux"),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 256,
            },
            None,
        );
        let controller = VmController::new(
            descriptor,
            layout.clone(),
            Limits::default(),
            metadata.clone(),
            CidAllocator::new(layout.cid_allocator_path()),
            PortAllocator::new(layout.port_allocator_path()),
            PathBuf::from("/usr/bin/true"),
            Arc::new(FakeNetworkProvisioner::default()),
        );
        let engine = SnapshotEngine::new(layout, Limits::default(), metadata, PathBuf::from("/usr/bin/true"));

        let result = engine.create(&controller, None).await;
        assert_matches::assert_matches!(result, Err(BandsoxError::StateConflict(_)));
    }

    #[tokio::test]
    async fn restore_fails_cleanly_for_an_unknown_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let metadata = MetadataStore::new(layout.clone());
        let engine = SnapshotEngine::new(layout.clone(), Limits::default(), metadata, PathBuf::from("/usr/bin/true"));
        let port_allocator = PortAllocator::new(layout.port_allocator_path());

        let result = engine
            .restore("nonexistent", &port_allocator, Arc::new(FakeNetworkProvisioner::default()), true)
            .await;
        assert_matches::assert_matches!(result, Err(BandsoxError::NotFound(_)));
    }
}
