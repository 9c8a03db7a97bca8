//! `Manager`: the top-level coordinator (spec §2). Owns every live
//! `VmController`, the shared allocators and metadata store, and the two
//! out-of-scope collaborators (`ImageBuilder`, `NetworkProvisioner`).
//! Operations on distinct VMs proceed in parallel; operations on the same VM
//! serialize through that VM's own `VmController` (spec §5) — `Manager`
//! itself holds its registry lock only long enough to look a controller up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::allocator::{CidAllocator, PortAllocator};
use crate::collaborators::{ImageBuilder, NetworkProvisioner};
use crate::config::{Limits, StorageLayout};
use crate::error::BandsoxError;
use crate::metadata::{MetadataStore, SnapshotDescriptor, VmDescriptor, VmStatus};
use crate::snapshot::{self, SnapshotEngine};
use crate::vm_controller::{CreateSpec, VmController};

/// What a caller asks for when creating a VM (spec §2/§3). `Manager::create`
/// resolves `image_ref` via the configured `ImageBuilder` to get the rootfs
/// and kernel paths `CreateSpec` needs.
pub struct CreateRequest {
    pub image_ref: String,
    pub name: Option<String>,
    pub vcpu: u8,
    pub mem_mib: u32,
    pub disk_size_mib: u32,
    pub network_enabled: bool,
}

/// One `Manager` per host (spec §5: cross-process coordination on the same
/// VM isn't supported). Construct with [`Manager::new`], then call
/// [`Manager::start`] once before accepting requests.
pub struct Manager {
    layout: StorageLayout,
    limits: Limits,
    metadata: MetadataStore,
    cid_allocator: CidAllocator,
    port_allocator: PortAllocator,
    vmm_binary_path: PathBuf,
    image_builder: Arc<dyn ImageBuilder>,
    network: Arc<dyn NetworkProvisioner>,
    snapshots: SnapshotEngine,
    controllers: Mutex<HashMap<String, Arc<VmController>>>,
}

impl Manager {
    pub fn new(
        layout: StorageLayout,
        limits: Limits,
        vmm_binary_path: PathBuf,
        image_builder: Arc<dyn ImageBuilder>,
        network: Arc<dyn NetworkProvisioner>,
    ) -> Self {
        let metadata = MetadataStore::new(layout.clone());
        let cid_allocator = CidAllocator::new(layout.cid_allocator_path());
        let port_allocator = PortAllocator::new(layout.port_allocator_path());
        let snapshots = SnapshotEngine::new(layout.clone(), limits, metadata.clone(), vmm_binary_path.clone());
        Self {
            layout,
            limits,
            metadata,
            cid_allocator,
            port_allocator,
            vmm_binary_path,
            image_builder,
            network,
            snapshots,
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures the storage layout exists, then reconciles every descriptor
    /// left over from a prior run (spec §8): a `Running`/`Paused` descriptor
    /// whose `vmm_pid` is no longer alive is downgraded to `Stopped` and its
    /// allocator entries released, exactly once, before its controller is
    /// registered.
    pub async fn start(&self) -> Result<(), BandsoxError> {
        for dir in self.layout.all_dirs() {
            std::fs::create_dir_all(&dir)?;
        }
        let mut controllers = self.controllers.lock().await;
        for descriptor in self.metadata.list_vms()? {
            if descriptor.status == VmStatus::Deleted {
                continue;
            }
            let vm_id = descriptor.vm_id.clone();
            let controller = Arc::new(self.controller_for(descriptor));
            controller.reconcile_after_restart().await?;
            controllers.insert(vm_id, controller);
        }
        Ok(())
    }

    fn controller_for(&self, descriptor: VmDescriptor) -> VmController {
        VmController::new(
            descriptor,
            self.layout.clone(),
            self.limits,
            self.metadata.clone(),
            self.cid_allocator.clone(),
            self.port_allocator.clone(),
            self.vmm_binary_path.clone(),
            self.network.clone(),
        )
    }

    /// Resolves `request.image_ref` via the configured `ImageBuilder`, writes
    /// a new `VmDescriptor`, boots it, and registers the resulting
    /// controller. A `name` colliding with any non-`Deleted` VM is rejected
    /// (spec §3).
    pub async fn create(&self, request: CreateRequest) -> Result<VmDescriptor, BandsoxError> {
        if let Some(name) = &request.name {
            if self.find_live_by_name(name).await?.is_some() {
                return Err(BandsoxError::InvalidArgument(format!("a VM named {name:?} already exists")));
            }
        }

        let built = self
            .image_builder
            .build(&request.image_ref, request.disk_size_mib)
            .await
            .map_err(|error| BandsoxError::BootFailed { reason: error.to_string() })?;

        let spec = CreateSpec {
            name: request.name,
            rootfs_path: built.rootfs_path,
            kernel_path: built.kernel_path,
            resources: crate::metadata::ResourceShape {
                vcpu: request.vcpu,
                mem_mib: request.mem_mib,
                disk_size_mib: request.disk_size_mib,
            },
            network_enabled: request.network_enabled,
        };

        let mut descriptor = VmDescriptor::new(PathBuf::new(), spec.kernel_path, spec.resources, spec.name);
        let vm_id = descriptor.vm_id.clone();
        descriptor.rootfs_path = self.layout.images_dir().join(format!("{vm_id}.ext4"));
        std::fs::create_dir_all(self.layout.images_dir())?;
        std::fs::copy(&spec.rootfs_path, &descriptor.rootfs_path)?;
        self.metadata.save_vm(&descriptor)?;

        let controller = Arc::new(self.controller_for(descriptor));
        if let Err(error) = controller.boot(spec.network_enabled).await {
            self.metadata.delete_vm(&vm_id)?;
            return Err(error);
        }

        self.controllers.lock().await.insert(vm_id, controller.clone());
        Ok(controller.descriptor().await)
    }

    async fn find_live_by_name(&self, name: &str) -> Result<Option<VmDescriptor>, BandsoxError> {
        Ok(self
            .metadata
            .list_vms()?
            .into_iter()
            .find(|d| d.status != VmStatus::Deleted && d.name.as_deref() == Some(name)))
    }

    pub async fn get(&self, vm_id: &str) -> Result<Arc<VmController>, BandsoxError> {
        self.controllers
            .lock()
            .await
            .get(vm_id)
            .cloned()
            .ok_or_else(|| BandsoxError::NotFound(vm_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<VmDescriptor>, BandsoxError> {
        Ok(self.metadata.list_vms()?)
    }

    pub async fn pause(&self, vm_id: &str) -> Result<(), BandsoxError> {
        self.get(vm_id).await?.pause().await
    }

    pub async fn resume(&self, vm_id: &str) -> Result<(), BandsoxError> {
        self.get(vm_id).await?.resume().await
    }

    pub async fn stop(&self, vm_id: &str) -> Result<(), BandsoxError> {
        self.get(vm_id).await?.stop().await
    }

    /// Removes a `Stopped`/`Failed` VM and forgets its controller. Refuses
    /// `Running` (spec §4.7, enforced by `VmController::delete`).
    pub async fn delete(&self, vm_id: &str) -> Result<(), BandsoxError> {
        let controller = self.get(vm_id).await?;
        controller.delete().await?;
        self.controllers.lock().await.remove(vm_id);
        Ok(())
    }

    pub async fn snapshot(&self, vm_id: &str, name: Option<String>) -> Result<SnapshotDescriptor, BandsoxError> {
        let controller = self.get(vm_id).await?;
        self.snapshots.create(&controller, name).await
    }

    /// Restores `snapshot_id` into a brand-new VM and registers its
    /// controller under the freshly minted `vm_id` (spec §4.8).
    pub async fn restore(&self, snapshot_id: &str, resume: bool) -> Result<VmDescriptor, BandsoxError> {
        let controller = self
            .snapshots
            .restore(snapshot_id, &self.port_allocator, self.network.clone(), resume)
            .await?;
        let descriptor = controller.descriptor().await;
        self.controllers
            .lock()
            .await
            .insert(descriptor.vm_id.clone(), Arc::new(controller));
        Ok(descriptor)
    }

    pub fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), BandsoxError> {
        snapshot::delete(&self.metadata, snapshot_id)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>, BandsoxError> {
        Ok(self.metadata.list_snapshots()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeImageBuilder, FakeNetworkProvisioner};
    use crate::metadata::ResourceShape;

    fn manager(dir: &tempfile::TempDir, image_builder: Arc<dyn ImageBuilder>) -> Manager {
        let layout = StorageLayout::new(dir.path(), dir.path().join("vsock-isolation"));
        Manager::new(
            layout,
            Limits::default(),
            PathBuf::from("/usr/bin/true"),
            image_builder,
            Arc::new(FakeNetworkProvisioner::default()),
        )
    }

    fn create_request(name: Option<&str>) -> CreateRequest {
        CreateRequest {
            image_ref: "alpine:latest".to_string(),
            name: name.map(str::to_string),
            vcpu: 1,
            mem_mib: 128,
            disk_size_mib: 256,
            network_enabled: false,
        }
    }

    #[tokio::test]
    async fn get_on_an_unknown_vm_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let image_builder: Arc<dyn ImageBuilder> =
            Arc::new(FakeImageBuilder::new(dir.path().join("rootfs.ext4"), dir.path().join("vmlinux")));
        let mgr = manager(&dir, image_builder);
        mgr.start().await.unwrap();

        let result = mgr.get("nonexistent").await;
        assert_matches::assert_matches!(result, Err(BandsoxError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_rejects_a_duplicate_live_name() {
        let dir = tempfile::tempdir().unwrap();
        let image_builder: Arc<dyn ImageBuilder> =
            Arc::new(FakeImageBuilder::new(dir.path().join("rootfs.ext4"), dir.path().join("vmlinux")));
        let mgr = manager(&dir, image_builder);
        mgr.start().await.unwrap();

        let existing = VmDescriptor::new(
            dir.path().join("other.ext4"),
            dir.path().join("vmlinux"),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 256,
            },
            Some("box".to_string()),
        );
        mgr.metadata.save_vm(&existing).unwrap();

        let result = mgr.create(create_request(Some("box"))).await;
        assert_matches::assert_matches!(result, Err(BandsoxError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn list_snapshots_on_an_empty_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let image_builder: Arc<dyn ImageBuilder> =
            Arc::new(FakeImageBuilder::new(dir.path().join("rootfs.ext4"), dir.path().join("vmlinux")));
        let mgr = manager(&dir, image_builder);
        mgr.start().await.unwrap();

        assert!(mgr.list_snapshots().await.unwrap().is_empty());
    }
}
