//! The per-VM state machine (spec §4.7): owns the VMM process, its API
//! client, the vsock listener and the agent session, and drives every
//! state-changing transition under one lock so operations on the same VM
//! serialize the way spec §5 requires.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::agent::AgentSession;
use crate::allocator::{CidAllocator, PortAllocator};
use crate::collaborators::NetworkProvisioner;
use crate::config::{Limits, StorageLayout};
use crate::error::BandsoxError;
use crate::metadata::{MetadataStore, NetworkConfig, ResourceShape, VmDescriptor, VmStatus, VsockConfig};
use crate::vmm::client::VmmClient;
use crate::vmm::process::VmmProcess;
use crate::vsock::listener::{Handler, VsockListener};
use crate::vsock::protocol::{self, GuestMessage, HostReply};

const BOOT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Parameters for a brand-new VM, resolved by `Manager::create` before a
/// `VmController` exists (image build already done).
pub struct CreateSpec {
    pub name: Option<String>,
    pub rootfs_path: PathBuf,
    pub kernel_path: PathBuf,
    pub resources: ResourceShape,
    pub network_enabled: bool,
}

pub struct VmController {
    layout: StorageLayout,
    limits: Limits,
    metadata: MetadataStore,
    cid_allocator: CidAllocator,
    port_allocator: PortAllocator,
    vmm_binary_path: PathBuf,
    network: Arc<dyn NetworkProvisioner>,
    descriptor: Mutex<VmDescriptor>,
    process: Arc<Mutex<Option<VmmProcess>>>,
    client: Mutex<Option<VmmClient>>,
    listener: Mutex<Option<VsockListener>>,
    agent: Mutex<Option<Arc<AgentSession>>>,
    fallback_watcher: Mutex<Option<JoinHandle<()>>>,
    /// Acquired for the duration of any state-changing transition
    /// (spec §5); read-only accessors (`descriptor`, `agent`) don't need it.
    lifecycle_lock: Mutex<()>,
}

impl VmController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: VmDescriptor,
        layout: StorageLayout,
        limits: Limits,
        metadata: MetadataStore,
        cid_allocator: CidAllocator,
        port_allocator: PortAllocator,
        vmm_binary_path: PathBuf,
        network: Arc<dyn NetworkProvisioner>,
    ) -> Self {
        Self {
            layout,
            limits,
            metadata,
            cid_allocator,
            port_allocator,
            vmm_binary_path,
            network,
            descriptor: Mutex::new(descriptor),
            process: Arc::new(Mutex::new(None)),
            client: Mutex::new(None),
            listener: Mutex::new(None),
            agent: Mutex::new(None),
            fallback_watcher: Mutex::new(None),
            lifecycle_lock: Mutex::new(()),
        }
    }

    pub async fn descriptor(&self) -> VmDescriptor {
        self.descriptor.lock().await.clone()
    }

    pub async fn agent(&self) -> Option<Arc<AgentSession>> {
        self.agent.lock().await.clone()
    }

    async fn persist(&self, descriptor: &VmDescriptor) -> Result<(), BandsoxError> {
        self.metadata.save_vm(descriptor)?;
        Ok(())
    }

    /// `Created -> Booting -> Running` (spec §4.7). Not idempotent: re-entry
    /// from `Running` fails with a state conflict; failures before the VMM
    /// spawns release any allocators already acquired and leave the
    /// descriptor `Created` again so the caller may retry. `network_enabled`
    /// is the caller's `net=` choice at create time (spec §8 scenario 1):
    /// when false, the `NetworkProvisioner` is never invoked and the VM gets
    /// a disabled `NetworkConfig` directly.
    pub async fn boot(&self, network_enabled: bool) -> Result<(), BandsoxError> {
        let _guard = self.lifecycle_lock.lock().await;
        {
            let descriptor = self.descriptor.lock().await;
            if descriptor.status != VmStatus::Created {
                return Err(BandsoxError::StateConflict(format!(
                    "boot requires status Created, found {:?}",
                    descriptor.status
                )));
            }
        }

        self.set_status(VmStatus::Booting).await?;
        let vm_id = self.descriptor.lock().await.vm_id.clone();

        let network = if network_enabled {
            match self.network.provision(&vm_id).await {
                Ok(net) => net,
                Err(error) => {
                    self.set_status(VmStatus::Created).await?;
                    return Err(BandsoxError::BootFailed {
                        reason: error.to_string(),
                    });
                }
            }
        } else {
            NetworkConfig {
                enabled: false,
                tap_name: None,
                mac: None,
                ip: None,
                mask: None,
                gateway: None,
            }
        };

        let cid = match self.cid_allocator.acquire() {
            Ok(cid) => cid,
            Err(error) => {
                self.teardown_network_best_effort(&vm_id, &network).await;
                self.set_status(VmStatus::Created).await?;
                return Err(error.into());
            }
        };
        let port = match self.port_allocator.acquire() {
            Ok(port) => port,
            Err(error) => {
                self.cid_allocator.release(cid).ok();
                self.teardown_network_best_effort(&vm_id, &network).await;
                self.set_status(VmStatus::Created).await?;
                return Err(error.into());
            }
        };

        let uds_path = self.layout.vsock_uds_base(&vm_id);
        {
            let mut descriptor = self.descriptor.lock().await;
            descriptor.network = Some(network.clone());
            descriptor.vsock = Some(VsockConfig {
                cid,
                port,
                uds_path: uds_path.clone(),
            });
            self.persist(&descriptor).await?;
        }

        let socket_path = self.layout.vmm_socket_path(&vm_id);
        let mut process = match VmmProcess::spawn(&self.vmm_binary_path, &socket_path, true) {
            Ok(process) => process,
            Err(error) => {
                self.release_acquired(&vm_id, cid, port, &network).await;
                self.set_status(VmStatus::Failed).await?;
                return Err(BandsoxError::BootFailed {
                    reason: error.to_string(),
                });
            }
        };

        let client = VmmClient::new(socket_path.clone());
        if let Err(error) = self.configure_and_start(&client, &mut process, cid, port, &uds_path, network.enabled).await {
            let _ = process.send_sigkill();
            self.release_acquired(&vm_id, cid, port, &network).await;
            self.set_status(VmStatus::Failed).await?;
            return Err(error);
        }

        let transfers_dir = self.layout.vm_transfers_dir(&vm_id);
        let agent = Arc::new(AgentSession::new(vm_id.clone(), uds_path.clone(), port, self.limits, transfers_dir));
        let handler = self.build_vsock_handler(agent.clone());
        let listener = match VsockListener::bind(&uds_path, &[port], self.limits, handler).await {
            Ok(listener) => listener,
            Err(error) => {
                let _ = process.send_sigkill();
                self.release_acquired(&vm_id, cid, port, &network).await;
                self.set_status(VmStatus::Failed).await?;
                return Err(BandsoxError::BootFailed {
                    reason: error.to_string(),
                });
            }
        };

        let registered = tokio::time::timeout(self.limits.registration_grace_period, wait_until_registered(&agent))
            .await
            .is_ok();
        if !registered {
            tracing::warn!(vm_id = %vm_id, "guest did not register within the grace period; using serial");
            if let Some(serial_io) = process.take_serial_io() {
                agent.attach_serial(serial_io).await;
            }
        }

        self.finish_boot(process, client, listener, agent, VmStatus::Running).await
    }

    /// Stores the live handles produced by a successful boot or restore and
    /// marks the VM `status`. Shared by `boot` (always `Running`) and
    /// `SnapshotEngine::restore` (`Running` or `Paused`, depending on whether
    /// the restore requested an immediate resume), whose VMM setup differs
    /// but whose tail is identical.
    pub(crate) async fn finish_boot(
        &self,
        process: VmmProcess,
        client: VmmClient,
        listener: VsockListener,
        agent: Arc<AgentSession>,
        status: VmStatus,
    ) -> Result<(), BandsoxError> {
        let pid = process.pid();
        *self.process.lock().await = Some(process);
        *self.client.lock().await = Some(client);
        *self.listener.lock().await = Some(listener);
        *self.agent.lock().await = Some(agent.clone());
        *self.fallback_watcher.lock().await = Some(self.spawn_fallback_watcher(agent));

        let mut descriptor = self.descriptor.lock().await;
        descriptor.vmm_pid = Some(pid);
        descriptor.status = status;
        descriptor.touch();
        self.persist(&descriptor).await?;
        Ok(())
    }

    /// Releases a CID/port pair and tears down networking acquired earlier
    /// in `boot`, used by every failure branch before the VMM process exists.
    async fn release_acquired(&self, vm_id: &str, cid: u32, port: u16, network: &crate::metadata::NetworkConfig) {
        self.port_allocator.release(port).ok();
        self.cid_allocator.release(cid).ok();
        self.teardown_network_best_effort(vm_id, network).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn configure_and_start(
        &self,
        client: &VmmClient,
        process: &mut VmmProcess,
        cid: u32,
        port: u16,
        uds_path: &std::path::Path,
        network_enabled: bool,
    ) -> Result<(), BandsoxError> {
        client.wait_ready(BOOT_GRACE_PERIOD).await?;
        let descriptor = self.descriptor.lock().await.clone();
        client
            .put_machine_config(descriptor.resources.vcpu, descriptor.resources.mem_mib, false)
            .await?;
        client.put_boot_source(&descriptor.kernel_path, &boot_args(port)).await?;
        client
            .put_drive("rootfs", &descriptor.rootfs_path, true, false)
            .await?;
        if network_enabled {
            if let Some(network) = &descriptor.network {
                if let Some(tap_name) = &network.tap_name {
                    client
                        .put_network_interface("eth0", tap_name, network.mac.as_deref())
                        .await?;
                }
            }
        }
        client.put_vsock(cid, uds_path).await?;
        client.start().await?;
        let _ = process.try_wait();
        Ok(())
    }

    /// Builds the per-connection vsock handler closure. `pub(crate)` so
    /// `SnapshotEngine::restore` can bind a listener for a freshly assembled
    /// `VmController` before calling `finish_boot`.
    pub(crate) fn build_vsock_handler(&self, agent: Arc<AgentSession>) -> Handler {
        Arc::new(move |stream, port| {
            let agent = agent.clone();
            Box::pin(async move {
                if let Err(error) = handle_vsock_connection(stream, &agent).await {
                    tracing::debug!(port, %error, "vsock connection ended with an error");
                }
            })
        })
    }

    /// Watches for `report_connection_error` signals and attaches the
    /// serial fallback if no guest activity is observed within the fallback
    /// window (spec §4.5's ECONNRESET/no-reconnect trigger).
    fn spawn_fallback_watcher(&self, agent: Arc<AgentSession>) -> JoinHandle<()> {
        let process = self.process.clone();
        let window = self.limits.serial_fallback_window;
        tokio::spawn(async move {
            loop {
                agent.wait_for_connection_error().await;
                let error_at = tokio::time::Instant::now();
                tokio::time::sleep(window).await;
                if agent.had_activity_since(error_at).await || agent.has_serial().await {
                    continue;
                }
                let mut guard = process.lock().await;
                if let Some(serial_io) = guard.as_mut().and_then(VmmProcess::take_serial_io) {
                    drop(guard);
                    agent.attach_serial(serial_io).await;
                }
            }
        })
    }

    /// `Running -> Paused` via `VmmClient::pause`.
    pub async fn pause(&self) -> Result<(), BandsoxError> {
        let _guard = self.lifecycle_lock.lock().await;
        self.require_status(VmStatus::Running).await?;
        let client = self.client.lock().await.clone().ok_or_else(|| BandsoxError::Internal("no VMM client".into()))?;
        client.pause().await?;
        self.set_status(VmStatus::Paused).await?;
        Ok(())
    }

    /// `Paused -> Running` via `VmmClient::resume`.
    pub async fn resume(&self) -> Result<(), BandsoxError> {
        let _guard = self.lifecycle_lock.lock().await;
        self.require_status(VmStatus::Paused).await?;
        let client = self.client.lock().await.clone().ok_or_else(|| BandsoxError::Internal("no VMM client".into()))?;
        client.resume().await?;
        self.set_status(VmStatus::Running).await?;
        Ok(())
    }

    /// `Running -> Stopped`: broadcasts `session_kill`, then SIGTERM with a
    /// 5s grace period before SIGKILL. Idempotent — calling `stop` on an
    /// already-`Stopped` VM succeeds immediately (spec §8).
    pub async fn stop(&self) -> Result<(), BandsoxError> {
        let _guard = self.lifecycle_lock.lock().await;
        let status = self.descriptor.lock().await.status;
        if matches!(status, VmStatus::Stopped | VmStatus::Deleted) {
            return Ok(());
        }

        if let Some(agent) = self.agent.lock().await.take() {
            agent.disconnect().await;
        }
        if let Some(watcher) = self.fallback_watcher.lock().await.take() {
            watcher.abort();
        }
        if let Some(listener) = self.listener.lock().await.take() {
            listener.shutdown().await;
        }

        if let Some(mut process) = self.process.lock().await.take() {
            if process.send_sigterm().is_ok() {
                let exited = tokio::time::timeout(STOP_GRACE_PERIOD, process.wait_for_exit()).await;
                if exited.is_err() {
                    let _ = process.send_sigkill();
                    let _ = process.wait_for_exit().await;
                }
            }
        }
        self.client.lock().await.take();

        self.set_status(VmStatus::Stopped).await?;
        Ok(())
    }

    /// `Stopped|Failed -> Deleted`: tears down networking, releases the
    /// CID/port, and removes the rootfs/sockets. Refuses `Running` (spec
    /// §4.7).
    pub async fn delete(&self) -> Result<(), BandsoxError> {
        let _guard = self.lifecycle_lock.lock().await;
        let descriptor = self.descriptor.lock().await.clone();
        if !matches!(descriptor.status, VmStatus::Stopped | VmStatus::Failed) {
            return Err(BandsoxError::StateConflict(format!(
                "delete requires Stopped or Failed, found {:?}",
                descriptor.status
            )));
        }

        if let Some(network) = &descriptor.network {
            self.teardown_network_best_effort(&descriptor.vm_id, network).await;
        }
        if let Some(vsock) = &descriptor.vsock {
            self.cid_allocator.release(vsock.cid).ok();
            self.port_allocator.release(vsock.port).ok();
            let mut listener_socket = vsock.uds_path.as_os_str().to_owned();
            listener_socket.push(format!("_{}", vsock.port));
            let _ = std::fs::remove_file(PathBuf::from(listener_socket));
        }
        let _ = std::fs::remove_file(&descriptor.rootfs_path);
        let _ = std::fs::remove_file(self.layout.vmm_socket_path(&descriptor.vm_id));
        self.metadata.delete_vm(&descriptor.vm_id)?;

        let mut locked = self.descriptor.lock().await;
        locked.status = VmStatus::Deleted;
        locked.touch();
        Ok(())
    }

    /// Used by `Manager`'s startup reconciliation (spec §8): when a
    /// descriptor claims `Running`/`Paused` but its `vmm_pid` is dead,
    /// downgrade to `Stopped` and release its allocator entries exactly
    /// once.
    pub async fn reconcile_after_restart(&self) -> Result<bool, BandsoxError> {
        let _guard = self.lifecycle_lock.lock().await;
        let descriptor = self.descriptor.lock().await.clone();
        if !matches!(descriptor.status, VmStatus::Running | VmStatus::Paused) {
            return Ok(false);
        }
        let alive = descriptor.vmm_pid.is_some_and(crate::vmm::process::pid_is_alive);
        if alive {
            return Ok(false);
        }

        if let Some(vsock) = &descriptor.vsock {
            self.cid_allocator.release(vsock.cid).ok();
            self.port_allocator.release(vsock.port).ok();
        }
        if let Some(network) = &descriptor.network {
            self.teardown_network_best_effort(&descriptor.vm_id, network).await;
        }
        self.set_status(VmStatus::Stopped).await?;
        Ok(true)
    }

    async fn require_status(&self, expected: VmStatus) -> Result<(), BandsoxError> {
        let status = self.descriptor.lock().await.status;
        if status != expected {
            return Err(BandsoxError::StateConflict(format!(
                "operation requires status {expected:?}, found {status:?}"
            )));
        }
        Ok(())
    }

    async fn set_status(&self, status: VmStatus) -> Result<(), BandsoxError> {
        let mut descriptor = self.descriptor.lock().await;
        descriptor.status = status;
        descriptor.touch();
        self.metadata.save_vm(&descriptor)?;
        Ok(())
    }

    async fn teardown_network_best_effort(&self, vm_id: &str, network: &crate::metadata::NetworkConfig) {
        if !network.enabled {
            return;
        }
        if let Err(error) = self.network.teardown(vm_id, network).await {
            tracing::warn!(vm_id, %error, "network teardown failed; leaking host-side network state");
        }
    }

    /// The bits `SnapshotEngine` needs and nothing else: the VMM client, the
    /// vsock config, and a way to take the listener offline and rebind it.
    pub(crate) async fn vmm_client(&self) -> Option<VmmClient> {
        self.client.lock().await.clone()
    }

    pub(crate) async fn take_listener(&self) -> Option<VsockListener> {
        self.listener.lock().await.take()
    }

    pub(crate) async fn rebind_listener(&self, listener: VsockListener) {
        *self.listener.lock().await = Some(listener);
    }

    pub(crate) fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub(crate) fn limits(&self) -> Limits {
        self.limits
    }

    /// Takes the vsock listener offline so `VmmClient::snapshot_create` can
    /// run without a listener racing the VMM for the socket files (spec
    /// §4.8 create step 2).
    pub(crate) async fn quiesce_vsock_for_snapshot(&self) -> Result<(), BandsoxError> {
        if let Some(listener) = self.take_listener().await {
            listener.shutdown().await;
        }
        Ok(())
    }

    /// Rebinds a fresh listener at the VM's existing vsock path once a
    /// snapshot has been taken, so a later `resume` has somewhere for the
    /// guest to reconnect (spec §4.8 create step 6).
    pub(crate) async fn reopen_vsock_after_snapshot(&self) -> Result<(), BandsoxError> {
        let descriptor = self.descriptor.lock().await.clone();
        let vsock = descriptor
            .vsock
            .ok_or_else(|| BandsoxError::Internal(format!("vm {} has no vsock config", descriptor.vm_id)))?;
        let agent = self
            .agent
            .lock()
            .await
            .clone()
            .ok_or_else(|| BandsoxError::Internal(format!("vm {} has no agent session", descriptor.vm_id)))?;
        let handler = self.build_vsock_handler(agent);
        let listener = VsockListener::bind(&vsock.uds_path, &[vsock.port], self.limits, handler)
            .await
            .map_err(|error| BandsoxError::Internal(error.to_string()))?;
        self.rebind_listener(listener).await;
        Ok(())
    }
}

pub(crate) async fn wait_until_registered(agent: &AgentSession) {
    while !agent.is_registered().await {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Kernel boot args, carrying the allocated control port so the in-guest
/// agent knows where to dial (spec §6: `connect(AF_VSOCK(CID=2,
/// port=$BANDSOX_VSOCK_PORT))`) — `put_vsock` itself only conveys the UDS
/// path, not the port, so the command line is the only guest-reachable
/// channel for it.
pub(crate) fn boot_args(vsock_port: u16) -> String {
    format!("console=ttyS0 reboot=k panic=1 BANDSOX_VSOCK_PORT={vsock_port}")
}

/// One accepted guest-initiated connection: `ping` is answered inline,
/// `upload`/`download` run the file-transfer reply flow, everything else
/// (`exec_result`, `session_output`, `session_exit`, `register`) is routed to
/// the agent's waiter/session map (spec §4.4/§4.6). Errors on a connection
/// that had previously registered are reported to the agent's fallback
/// watcher rather than propagated.
async fn handle_vsock_connection(mut stream: UnixStream, agent: &AgentSession) -> Result<(), protocol::ProtocolError> {
    let message: GuestMessage = match protocol::read_header(&mut stream).await {
        Ok(message) => message,
        Err(error) => {
            if agent.is_registered().await {
                agent.report_connection_error();
            }
            return Err(error);
        }
    };
    match message {
        GuestMessage::Ping { id } => {
            protocol::write_header(&mut stream, &HostReply::Success { id: id.clone() }).await?;
        }
        GuestMessage::Upload { .. } => agent.receive_guest_upload(&mut stream, message).await?,
        GuestMessage::Download { .. } => agent.send_guest_download(&mut stream, message).await?,
        _ => agent.handle_guest_message(message).await,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeImageBuilder, FakeNetworkProvisioner};
    use crate::metadata::ResourceShape;

    fn layout(dir: &tempfile::TempDir) -> StorageLayout {
        StorageLayout::new(dir.path(), dir.path().join("vsock-isolation"))
    }

    #[tokio::test]
    async fn boot_is_rejected_outside_created() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let metadata = MetadataStore::new(layout.clone());
        let mut descriptor = VmDescriptor::new(
            dir.path().join("rootfs.ext4"),
            dir.path().join("vmlinux"),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 256,
            },
            None,
        );
        descriptor.status = VmStatus::Running;
        let controller = VmController::new(
            descriptor,
            layout.clone(),
            Limits::default(),
            metadata,
            CidAllocator::new(layout.cid_allocator_path()),
            PortAllocator::new(layout.port_allocator_path()),
            PathBuf::from("/usr/bin/true"),
            Arc::new(FakeNetworkProvisioner::default()),
        );
        let _image_builder = FakeImageBuilder::new(dir.path().join("rootfs.ext4"), dir.path().join("vmlinux"));

        let result = controller.boot(true).await;
        assert_matches::assert_matches!(result, Err(BandsoxError::StateConflict(_)));
    }

    #[tokio::test]
    async fn stop_is_idempotent_on_an_already_stopped_vm() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let metadata = MetadataStore::new(layout.clone());
        let mut descriptor = VmDescriptor::new(
            dir.path().join("rootfs.ext4"),
            dir.path().join("vmlinux"),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 256,
            },
            None,
        );
        descriptor.status = VmStatus::Stopped;
        let controller = VmController::new(
            descriptor,
            layout.clone(),
            Limits::default(),
            metadata,
            CidAllocator::new(layout.cid_allocator_path()),
            PortAllocator::new(layout.port_allocator_path()),
            PathBuf::from("/usr/bin/true"),
            Arc::new(FakeNetworkProvisioner::default()),
        );
        controller.stop().await.unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn delete_refuses_a_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        let metadata = MetadataStore::new(layout.clone());
        let mut descriptor = VmDescriptor::new(
            dir.path().join("rootfs.ext4"),
            dir.path().join("vmlinux"),
            ResourceShape {
                vcpu: 1,
                mem_mib: 128,
                disk_size_mib: 256,
            },
            None,
        );
        descriptor.status = VmStatus::Running;
        let controller = VmController::new(
            descriptor,
            layout.clone(),
            Limits::default(),
            metadata,
            CidAllocator::new(layout.cid_allocator_path()),
            PortAllocator::new(layout.port_allocator_path()),
            PathBuf::from("/usr/bin/true"),
            Arc::new(FakeNetworkProvisioner::default()),
        );
        let result = controller.delete().await;
        assert_matches::assert_matches!(result, Err(BandsoxError::StateConflict(_)));
    }
}
