//! Crash-safe pool allocation for vsock CIDs and listener ports (spec §4.1).
//!
//! Every mutation is a read-lock-modify-fsync-unlock cycle against a single
//! JSON state file, the same "open, flock, re-parse, mutate, write-temp +
//! rename, unlock" shape the teacher uses for chown/ownership bookkeeping,
//! except here the lock is the actual synchronization primitive rather than
//! a best-effort hint: it is what makes allocation safe across independent
//! `Manager` processes on the same host.

use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};
use serde::{de::DeserializeOwned, Serialize};

/// The reserved vsock CIDs: 0 is the hypervisor, 1 is local, 2 is the host.
const FIRST_GUEST_CID: u32 = 3;
const CID_UPPER_BOUND: u32 = u32::MAX - 2;
const PORT_RANGE_START: u16 = 9000;
const PORT_RANGE_END: u16 = 9999; // inclusive

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("I/O error on allocator state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("allocator state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no free CID is available in [{FIRST_GUEST_CID}, {CID_UPPER_BOUND})")]
    Exhausted,
    #[error("no free port is available in [{PORT_RANGE_START}, {PORT_RANGE_END}]")]
    NoFreePort,
}

/// Open `path` (creating it with `default` if missing), take an advisory
/// exclusive OS-level lock covering the whole file, deserialize, hand `&mut
/// T` to `mutate`, then write-temp + rename + fsync before releasing the
/// lock. The lock is held for the entire critical section, including the
/// rename, so two processes racing on the same file never observe a
/// half-written state.
fn with_locked_state<T, R>(
    path: &Path,
    default: impl FnOnce() -> T,
    mutate: impl FnOnce(&mut T) -> Result<R, AllocatorError>,
) -> Result<R, AllocatorError>
where
    T: Serialize + DeserializeOwned,
{
    let io_err = |source: std::io::Error| AllocatorError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_err)?;
    flock(&file, FlockArg::LockExclusive).map_err(|e| io_err(std::io::Error::from(e)))?;

    // The lock is released when `file` is dropped at the end of this
    // function, after the rename below, guaranteeing readers never observe
    // a torn write.
    let contents = std::fs::read_to_string(path).map_err(io_err)?;
    let mut state: T = if contents.trim().is_empty() {
        default()
    } else {
        serde_json::from_str(&contents).map_err(|source| AllocatorError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?
    };

    let result = mutate(&mut state)?;

    let serialized = serde_json::to_string_pretty(&state).expect("allocator state always serializes");
    let tmp_path = path.with_extension("tmp");
    let mut tmp_file = File::create(&tmp_path).map_err(io_err)?;
    tmp_file.write_all(serialized.as_bytes()).map_err(io_err)?;
    tmp_file.sync_all().map_err(io_err)?;
    std::fs::rename(&tmp_path, path).map_err(io_err)?;

    drop(file); // releases the flock after the rename is durable
    Ok(result)
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct CidState {
    free: Vec<u32>,
    next: u32,
}

impl Default for CidState {
    fn default() -> Self {
        Self {
            free: Vec::new(),
            next: FIRST_GUEST_CID,
        }
    }
}

/// Allocates vsock Context IDs from `[3, 2^32-3)`.
#[derive(Debug, Clone)]
pub struct CidAllocator {
    state_path: PathBuf,
}

impl CidAllocator {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    /// Prefers the LIFO free-list, else bumps `next`, else `Exhausted`.
    pub fn acquire(&self) -> Result<u32, AllocatorError> {
        with_locked_state(&self.state_path, CidState::default, |state| {
            if let Some(cid) = state.free.pop() {
                return Ok(cid);
            }
            if state.next < CID_UPPER_BOUND {
                let cid = state.next;
                state.next += 1;
                return Ok(cid);
            }
            Err(AllocatorError::Exhausted)
        })
    }

    /// Idempotent: releasing an id not currently allocated (or already
    /// released) is a no-op.
    pub fn release(&self, cid: u32) -> Result<(), AllocatorError> {
        with_locked_state(&self.state_path, CidState::default, |state| {
            if !state.free.contains(&cid) && cid < state.next {
                state.free.push(cid);
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
struct PortState {
    used: HashSet<u16>,
    next: u16,
}

impl Default for PortState {
    fn default() -> Self {
        Self {
            used: HashSet::new(),
            next: PORT_RANGE_START,
        }
    }
}

/// Allocates listener ports from `[9000, 9999]`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    state_path: PathBuf,
}

impl PortAllocator {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    const RANGE_LEN: u32 = PORT_RANGE_END as u32 - PORT_RANGE_START as u32 + 1;

    /// Scans forward from `next` modulo the range, skipping ports in `used`.
    pub fn acquire(&self) -> Result<u16, AllocatorError> {
        with_locked_state(&self.state_path, PortState::default, |state| {
            let start_offset = (state.next - PORT_RANGE_START) as u32;
            for step in 0..Self::RANGE_LEN {
                let offset = (start_offset + step) % Self::RANGE_LEN;
                let candidate = PORT_RANGE_START + offset as u16;
                if !state.used.contains(&candidate) {
                    state.used.insert(candidate);
                    let next_offset = (offset + 1) % Self::RANGE_LEN;
                    state.next = PORT_RANGE_START + next_offset as u16;
                    return Ok(candidate);
                }
            }
            Err(AllocatorError::NoFreePort)
        })
    }

    /// Idempotent: removes `port` from `used`; a no-op if absent. This is
    /// the corrected semantics noted in spec §9 (the source's documented
    /// `release` re-adding to `used` was a bug; here release only removes).
    pub fn release(&self, port: u16) -> Result<(), AllocatorError> {
        with_locked_state(&self.state_path, PortState::default, |state| {
            state.used.remove(&port);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_allocator_prefers_free_list_lifo() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = CidAllocator::new(dir.path().join("cid.json"));

        let a = alloc.acquire().unwrap();
        let b = alloc.acquire().unwrap();
        assert_eq!((a, b), (3, 4));

        alloc.release(a).unwrap();
        alloc.release(b).unwrap();
        // LIFO: b was released last, so it comes back first.
        assert_eq!(alloc.acquire().unwrap(), b);
        assert_eq!(alloc.acquire().unwrap(), a);
    }

    #[test]
    fn cid_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = CidAllocator::new(dir.path().join("cid.json"));
        let a = alloc.acquire().unwrap();
        alloc.release(a).unwrap();
        alloc.release(a).unwrap();
        // Only one copy of `a` should be in the free list, not two.
        assert_eq!(alloc.acquire().unwrap(), a);
        let next = alloc.acquire().unwrap();
        assert_ne!(next, a);
    }

    #[test]
    fn port_allocator_scans_and_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = PortAllocator::new(dir.path().join("port.json"));
        let first = alloc.acquire().unwrap();
        assert_eq!(first, PORT_RANGE_START);
        alloc.release(first).unwrap();
        alloc.release(first).unwrap(); // idempotent
    }

    #[test]
    fn port_allocator_exhaustion_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port.json");
        let alloc = PortAllocator::new(&path);
        let mut acquired = Vec::new();
        for _ in 0..PortAllocator::RANGE_LEN {
            acquired.push(alloc.acquire().unwrap());
        }
        let before = std::fs::read_to_string(&path).unwrap();
        let err = alloc.acquire().unwrap_err();
        assert_matches::assert_matches!(err, AllocatorError::NoFreePort);
        let after = std::fs::read_to_string(&path).unwrap();
        assert_eq!(before, after);
    }
}
