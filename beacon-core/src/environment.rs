//! Environment probes consulted before each flush
//!
//! A flush only runs in the primary process, while online, on a network type
//! the send policy allows. Detecting those facts is platform work outside the
//! pipeline, so it sits behind the [`Environment`] trait.

use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Connectivity types a send policy can allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum NetworkType {
    #[serde(rename = "wifi")]
    Wifi,
    #[serde(rename = "wired")]
    Wired,
    #[serde(rename = "2g")]
    Mobile2G,
    #[serde(rename = "3g")]
    Mobile3G,
    #[serde(rename = "4g")]
    Mobile4G,
    #[serde(rename = "5g")]
    Mobile5G,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkType::Wifi => "wifi",
            NetworkType::Wired => "wired",
            NetworkType::Mobile2G => "2g",
            NetworkType::Mobile3G => "3g",
            NetworkType::Mobile4G => "4g",
            NetworkType::Mobile5G => "5g",
        })
    }
}

/// The set of network types uploads are allowed on
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SendPolicy(BTreeSet<NetworkType>);

impl SendPolicy {
    pub fn new(allowed: impl IntoIterator<Item = NetworkType>) -> Self {
        Self(allowed.into_iter().collect())
    }

    /// Allow every network type
    pub fn any() -> Self {
        Self::new([
            NetworkType::Wifi,
            NetworkType::Wired,
            NetworkType::Mobile2G,
            NetworkType::Mobile3G,
            NetworkType::Mobile4G,
            NetworkType::Mobile5G,
        ])
    }

    pub fn allows(&self, network: NetworkType) -> bool {
        self.0.contains(&network)
    }
}

impl Default for SendPolicy {
    /// Everything except 2G
    fn default() -> Self {
        Self::new([
            NetworkType::Wifi,
            NetworkType::Wired,
            NetworkType::Mobile3G,
            NetworkType::Mobile4G,
            NetworkType::Mobile5G,
        ])
    }
}

/// Process and connectivity facts the flush engine depends on
pub trait Environment: Send + Sync {
    /// Whether this process is the one designated to upload
    fn is_primary_process(&self) -> bool;

    /// Current connectivity, `None` when offline
    fn network_type(&self) -> Option<NetworkType>;
}

/// Fixed answers, for embedding hosts that know their own state and for tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticEnvironment {
    pub primary: bool,
    pub network: Option<NetworkType>,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            primary: true,
            network: Some(NetworkType::Wired),
        }
    }
}

impl Environment for StaticEnvironment {
    fn is_primary_process(&self) -> bool {
        self.primary
    }

    fn network_type(&self) -> Option<NetworkType> {
        self.network
    }
}

/// Host environment for desktop and server processes.
///
/// Several processes may share one queue database; only the one holding the
/// advisory lock scoped to that database uploads. A process that lost the
/// lock probes it again on every check, so it takes over once the holder
/// exits. Connectivity is reported as wired, leaving offline detection to
/// the transport's connection errors.
pub struct HostEnvironment {
    lock: PrimaryLock,
}

impl HostEnvironment {
    /// Try to become the primary process for the queue at `db_path`
    pub fn detect(db_path: &Path) -> io::Result<Self> {
        let lock = PrimaryLock::open(db_path)?;
        if !lock.probe() {
            tracing::info!(
                db_path = %db_path.display(),
                "Another process owns uploads for this queue"
            );
        }
        Ok(Self { lock })
    }
}

impl Environment for HostEnvironment {
    fn is_primary_process(&self) -> bool {
        self.lock.probe()
    }

    fn network_type(&self) -> Option<NetworkType> {
        Some(NetworkType::Wired)
    }
}

/// Exclusive `flock` on a per-database file under the runtime dir.
///
/// The file is never unlinked: every contender must lock the same inode.
/// Closing the descriptor (on drop) releases the lock.
struct PrimaryLock {
    path: PathBuf,
    held: Mutex<Option<File>>,
}

impl PrimaryLock {
    fn open(db_path: &Path) -> io::Result<Self> {
        let mut path = match std::env::var_os("XDG_RUNTIME_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir(),
        };
        path.push("beacon");
        fs::create_dir_all(&path)?;

        let mut hasher = DefaultHasher::new();
        db_path.to_string_lossy().hash(&mut hasher);
        path.push(format!("primary-{:016x}.lock", hasher.finish()));

        Ok(Self {
            path,
            held: Mutex::new(None),
        })
    }

    /// Whether this process holds the lock, acquiring it if it is free
    fn probe(&self) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.is_some() {
            return true;
        }

        match self.try_lock() {
            Ok(Some(file)) => {
                tracing::debug!(path = %self.path.display(), "Acquired primary lock");
                *held = Some(file);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Primary lock check failed");
                false
            }
        }
    }

    fn try_lock(&self) -> io::Result<Option<File>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        if let Err(e) = flock_exclusive(&file) {
            return match e.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(e),
            };
        }

        // Record the owner for anyone inspecting the runtime dir
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "pid={}", std::process::id())?;
        Ok(Some(file))
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<()> {
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    // SAFETY: the descriptor is owned by `file` and outlives the call.
    if unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
compile_error!("beacon primary-process locks require a Unix host");
