//! Snapshot metadata lifecycle (spec §4.8/§6): deleting a snapshot removes
//! only the snapshot's own descriptor/files and never touches a VM that was
//! restored from it.

use bandsox::config::StorageLayout;
use bandsox::metadata::{MetadataStore, ResourceShape, SnapshotDescriptor, VmDescriptor};
use bandsox::snapshot;

fn layout(dir: &tempfile::TempDir) -> StorageLayout {
    StorageLayout::new(dir.path(), dir.path().join("vsock-isolation"))
}

#[test]
fn deleting_a_snapshot_leaves_its_descendant_vm_descriptor_intact() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(&dir);
    let metadata = MetadataStore::new(layout.clone());

    let snapshot_descriptor = SnapshotDescriptor {
        snapshot_id: "snap-1".to_string(),
        name: Some("before-upgrade".to_string()),
        source_vm_id: "vm-source".to_string(),
        mem_file_path: dir.path().join("snap-1/mem"),
        state_file_path: dir.path().join("snap-1/state"),
        rootfs_copy_path: dir.path().join("snap-1/rootfs.ext4"),
        kernel_path: dir.path().join("vmlinux"),
        vsock_config: None,
        network_config: None,
        resources: ResourceShape {
            vcpu: 1,
            mem_mib: 128,
            disk_size_mib: 256,
        },
        created_at: chrono::Utc::now(),
    };
    metadata.save_snapshot(&snapshot_descriptor).unwrap();

    let mut descendant = VmDescriptor::new(
        dir.path().join("images/restored.ext4"),
        dir.path().join("vmlinux"),
        snapshot_descriptor.resources,
        None,
    );
    descendant.source_snapshot_id = Some(snapshot_descriptor.snapshot_id.clone());
    metadata.save_vm(&descendant).unwrap();

    snapshot::delete(&metadata, &snapshot_descriptor.snapshot_id).unwrap();

    assert!(matches!(
        metadata.load_snapshot(&snapshot_descriptor.snapshot_id),
        Err(bandsox::metadata::MetadataError::NotFound(_))
    ));
    let reloaded = metadata.load_vm(&descendant.vm_id).unwrap();
    assert_eq!(reloaded.source_snapshot_id.as_deref(), Some("snap-1"));
}

#[test]
fn deleting_an_unknown_snapshot_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let layout = layout(&dir);
    let metadata = MetadataStore::new(layout);

    // Mirrors delete_vm's idempotent semantics: deleting something already
    // gone is success, not an error.
    snapshot::delete(&metadata, "does-not-exist").unwrap();
}
