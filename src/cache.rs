//! The last public IP we reconciled for, kept on local disk.
//!
//! The cache only decides whether a run may skip talking to the provider. It never stands in for
//! the provider's rule set, so a stale, missing, or corrupt cache costs at most one extra
//! describe call.

use crate::error::Error;
use crate::rule::{valid_group_id, Mode};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// A completed reconciliation: the IP that was admitted, and the mode it was admitted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synced {
    pub ip: Ipv4Addr,
    pub mode: Mode,
}

impl Synced {
    /// The cached IP, if this entry is good enough to skip a run in `mode`.
    ///
    /// An additive entry says nothing about other sources, so it never satisfies a strict run.
    pub fn ip_for(&self, mode: Mode) -> Option<Ipv4Addr> {
        if self.mode.covers(mode) {
            Some(self.ip)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Synced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ip, self.mode)
    }
}

/// Parse a cache file: an IPv4 literal, optionally followed by the mode.
///
/// Entries without a mode predate it and are read as additive, the weaker of the two.
fn parse_entry(contents: &str) -> Option<Synced> {
    let mut fields = contents.split_whitespace();
    let ip = fields.next()?.parse().ok()?;
    let mode = match fields.next() {
        Some(m) => m.parse().ok()?,
        None => Mode::Additive,
    };
    if fields.next().is_some() {
        return None;
    }
    Some(Synced { ip, mode })
}

/// Key-value access to the last reconciliation.
pub trait IpCache {
    /// The last fully reconciled IP and mode, if known.
    ///
    /// Implementations must not fail: anything that prevents reading the value is a miss.
    fn get(&self) -> Option<Synced>;

    /// Record `synced` as fully reconciled.
    fn set(&mut self, synced: Synced) -> Result<(), Error>;
}

/// A plain-text file holding `<ip> <mode>`.
#[derive(Debug, Clone)]
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCache { path: path.into() }
    }

    /// Where the cached IP for `group_id` lives when no path is given explicitly.
    ///
    /// Each (group, protocol, port) gets its own file so that syncing one target never makes
    /// another look up to date. Returns `None` if there is no cache directory, or if `group_id`
    /// is not a plain identifier.
    pub fn default_path(
        group_id: &str,
        protocol: crate::Protocol,
        port: u16,
    ) -> Option<PathBuf> {
        if !valid_group_id(group_id) {
            return None;
        }
        let dirs = directories::ProjectDirs::from("", "", "ipgate")?;
        Some(
            dirs.cache_dir()
                .join(format!("{}_{}_{}.ip", group_id, protocol, port)),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomically(&self, synced: Synced) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        // same directory as the target so the rename cannot cross filesystems
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        writeln!(tmp, "{}", synced)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl IpCache for FileCache {
    fn get(&self) -> Option<Synced> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no cached ip");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "could not read cached ip, forcing a full check: {}", e
                );
                return None;
            }
        };

        match parse_entry(&contents) {
            Some(synced) => {
                tracing::trace!(path = %self.path.display(), %synced, "loaded cached ip");
                Some(synced)
            }
            None => {
                tracing::warn!(
                    path = %self.path.display(),
                    "cached ip is not an ipv4 address, forcing a full check"
                );
                None
            }
        }
    }

    fn set(&mut self, synced: Synced) -> Result<(), Error> {
        self.write_atomically(synced).map_err(|source| Error::CacheWrite {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(path = %self.path.display(), %synced, "cached ip");
        Ok(())
    }
}
