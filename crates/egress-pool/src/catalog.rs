//! Tunnel configuration inventory per vendor
//!
//! Each vendor has a directory `<root>/<vendor>` holding `.ovpn` files. The
//! catalog keeps the sorted file names and hands them out round-robin:
//! `next(vendor, n)` returns entry `n % len`. `VendorStats` supplies `n`, one
//! per renewal attempt, shared by every slot of the vendor.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};

const TUNNEL_FILE_SUFFIX: &str = ".ovpn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFile {
    pub vendor: String,
    pub identifier: String,
}

pub struct FileCatalog {
    root: PathBuf,
    files: RwLock<HashMap<String, Vec<String>>>,
}

impl FileCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the vendor directory, keeping `.ovpn` files that match `filter`.
    ///
    /// Returns the number of files loaded. Replaces any previous inventory for
    /// the vendor.
    pub async fn load(&self, vendor: &str, filter: Option<&Regex>) -> Result<usize> {
        let dir = self.root.join(vendor);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::CatalogNotFound {
                    vendor: vendor.to_string(),
                    path: dir,
                });
            }
            Err(source) => return Err(Error::CatalogIo { path: dir, source }),
        };

        let mut names = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(Error::CatalogIo { path: dir, source }),
            };
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !name.ends_with(TUNNEL_FILE_SUFFIX) {
                continue;
            }
            if filter.is_some_and(|re| !re.is_match(&name)) {
                debug!(vendor, file = %name, "tunnel file filtered out");
                continue;
            }
            names.push(name);
        }

        if names.is_empty() {
            return Err(Error::EmptyCatalog(vendor.to_string()));
        }
        names.sort();

        let count = names.len();
        self.files
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vendor.to_string(), names);
        info!(vendor, files = count, "tunnel catalog loaded");
        Ok(count)
    }

    /// The `n`-th file in the vendor's rotation, wrapping around.
    pub fn next(&self, vendor: &str, n: u64) -> Result<TunnelFile> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let names = files
            .get(vendor)
            .filter(|names| !names.is_empty())
            .ok_or_else(|| Error::EmptyCatalog(vendor.to_string()))?;
        let index = (n % names.len() as u64) as usize;
        Ok(TunnelFile {
            vendor: vendor.to_string(),
            identifier: names[index].clone(),
        })
    }

    pub fn len(&self, vendor: &str) -> usize {
        self.files
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vendor)
            .map_or(0, Vec::len)
    }
}

/// Connections issued per vendor. Monotonic.
#[derive(Debug, Default)]
pub struct VendorStats {
    issued: Mutex<HashMap<String, u64>>,
}

impl VendorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next rotation index for `vendor`. The first call returns 0.
    pub fn issue(&self, vendor: &str) -> u64 {
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        let counter = issued.entry(vendor.to_string()).or_insert(0);
        let n = *counter;
        *counter += 1;
        n
    }

    pub fn issued(&self, vendor: &str) -> u64 {
        self.issued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(vendor)
            .copied()
            .unwrap_or(0)
    }
}
