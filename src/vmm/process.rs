//! Spawning and signaling the external VMM process, grounded on the
//! teacher's `VmmProcess` (`vmm/process.rs`): a small state machine around a
//! [`tokio::process::Child`], distinct from the higher-level `VmState`
//! tracked by [`crate::vm_controller`].

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
pub enum VmmProcessError {
    #[error("failed to spawn the VMM binary at {path}: {source}")]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sending {signal} to the VMM process failed: {source}")]
    SignalFailed {
        signal: &'static str,
        #[source]
        source: nix::Error,
    },
    #[error("waiting for the VMM process to exit failed: {0}")]
    WaitFailed(std::io::Error),
    #[error("the VMM process has no pid (already reaped)")]
    NoPid,
}

/// A handle to the spawned VMM (e.g. `firecracker`) process. Owns the child
/// and exposes the narrow signal/wait surface [`crate::vm_controller`] needs;
/// all configuration happens over [`super::client::VmmClient`] instead of
/// command-line flags, mirroring Firecracker's "empty config, configure over
/// the API" mode.
#[derive(Debug)]
pub struct VmmProcess {
    child: Child,
    pid: u32,
    serial_io: Option<SerialIo>,
}

impl VmmProcess {
    /// Spawns `binary_path --api-sock socket_path`, redirecting stdio to
    /// `/dev/null` so the VMM's own logs don't interleave with the host
    /// process's stdout.
    ///
    /// When `serial` is set, stdin/stdout are piped instead: Firecracker
    /// wires the guest's `ttyS0` to its own stdio, which is exactly the
    /// channel [`crate::vsock::serial::SerialBridge`] needs for the fallback
    /// path (spec §4.5).
    pub fn spawn(binary_path: &Path, socket_path: &Path, serial: bool) -> Result<Self, VmmProcessError> {
        Self::from_command(Self::base_command(binary_path, socket_path, serial), binary_path, serial)
    }

    /// Like [`Self::spawn`], but the child is first moved into a private
    /// mount namespace where `bind_over` is bind-mounted with `namespace_root`
    /// underneath it. Used by [`crate::snapshot`] when restoring a snapshot:
    /// the VMM's restored state references the original UDS path verbatim, so
    /// concurrent restores of the same snapshot must each see that path
    /// resolve to a distinct backing directory.
    pub fn spawn_isolated(
        binary_path: &Path,
        socket_path: &Path,
        serial: bool,
        namespace_root: PathBuf,
        bind_over: PathBuf,
    ) -> Result<Self, VmmProcessError> {
        let mut command = Self::base_command(binary_path, socket_path, serial);
        // SAFETY: the closure only calls unshare(2)/mount(2), does no heap
        // allocation beyond what nix's thin wrappers need, and runs in the
        // forked child before exec, as `Command::pre_exec` requires.
        unsafe {
            command.pre_exec(move || isolate_vsock_namespace(&namespace_root, &bind_over));
        }
        Self::from_command(command, binary_path, serial)
    }

    fn base_command(binary_path: &Path, socket_path: &Path, serial: bool) -> Command {
        let stdio = |piped: bool| if piped { Stdio::piped() } else { Stdio::null() };
        let mut command = Command::new(binary_path);
        command
            .arg("--api-sock")
            .arg(socket_path)
            .stdin(stdio(serial))
            .stdout(stdio(serial))
            .stderr(Stdio::null())
            .kill_on_drop(false);
        command
    }

    fn from_command(mut command: Command, binary_path: &Path, serial: bool) -> Result<Self, VmmProcessError> {
        let mut child = command.spawn().map_err(|source| VmmProcessError::SpawnFailed {
            path: binary_path.to_path_buf(),
            source,
        })?;
        let pid = child.id().ok_or(VmmProcessError::NoPid)?;
        let serial_io = if serial {
            let stdin = child.stdin.take().ok_or(VmmProcessError::NoPid)?;
            let stdout = child.stdout.take().ok_or(VmmProcessError::NoPid)?;
            Some(SerialIo { stdin, stdout })
        } else {
            None
        };
        Ok(Self {
            child,
            pid,
            serial_io,
        })
    }

    /// Takes ownership of the serial console I/O, if this process was
    /// spawned with `serial = true`. Can only be taken once.
    pub fn take_serial_io(&mut self) -> Option<SerialIo> {
        self.serial_io.take()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn send_sigterm(&self) -> Result<(), VmmProcessError> {
        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).map_err(|source| {
            VmmProcessError::SignalFailed {
                signal: "SIGTERM",
                source,
            }
        })
    }

    pub fn send_sigkill(&self) -> Result<(), VmmProcessError> {
        signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL).map_err(|source| {
            VmmProcessError::SignalFailed {
                signal: "SIGKILL",
                source,
            }
        })
    }

    /// Awaits process exit and returns its status (never blocks forever on a
    /// living process thanks to the caller wrapping this in a timeout).
    pub async fn wait_for_exit(&mut self) -> Result<ExitStatus, VmmProcessError> {
        self.child.wait().await.map_err(VmmProcessError::WaitFailed)
    }

    /// Non-blocking poll of whether the process has already exited, used by
    /// `Manager`'s startup reconciliation (spec §8) to detect a `vmm_pid`
    /// that no longer corresponds to a live process.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, VmmProcessError> {
        self.child.try_wait().map_err(VmmProcessError::WaitFailed)
    }
}

/// Whether the OS process for `pid` is still alive. Used by reconciliation
/// when bandsox itself has restarted and no longer owns a `Child` handle.
pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Unshares the mount namespace and bind-mounts `namespace_root` over
/// `bind_over`, so this process's view of `bind_over` (and nothing else on
/// the host) changes. Runs inside the forked child, before exec.
fn isolate_vsock_namespace(namespace_root: &Path, bind_over: &Path) -> std::io::Result<()> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(std::io::Error::from)?;
    // Without this, propagation events would carry our bind mount back to
    // the host's namespace, defeating the isolation.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(std::io::Error::from)?;
    mount(Some(namespace_root), bind_over, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .map_err(std::io::Error::from)?;
    Ok(())
}

/// The VMM's stdio pair, wired to the guest's serial console. Reads come
/// from the VMM's stdout, writes go to its stdin.
#[derive(Debug)]
pub struct SerialIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl AsyncRead for SerialIo {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialIo {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
