use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use shared::protocol::CACHE_EXPIRATION_SECS;
use shared::types::CacheEntry;

/// Previously seen services keyed by host.
///
/// Persisted as a pretty-printed JSON object; nothing here is fatal, a cache
/// that cannot be read simply starts empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheTable {
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the table persisted at `path`, dropping expired entries. A
    /// missing, unreadable or corrupt file yields an empty table.
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::warn!(
                    "Failed reading cache file {}: {}. Starting from scratch.",
                    path.display(),
                    e
                );
                return Self::new();
            }
        };

        let mut table = match Self::parse(&contents) {
            Ok(table) => table,
            Err(e) => {
                tracing::error!(
                    "Failed parsing cache content in {}: {}. Starting from scratch.",
                    path.display(),
                    e
                );
                return Self::new();
            }
        };

        table.evict_expired(Utc::now());
        tracing::info!("Loaded {} cached services from {}", table.len(), path.display());
        table
    }

    pub fn parse(contents: &str) -> serde_json::Result<Self> {
        let entries = serde_json::from_str(contents)?;
        Ok(Self { entries })
    }

    /// Replace whatever was known about `host`
    pub fn upsert(&mut self, host: String, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(host, entry)
    }

    pub fn get(&self, host: &str) -> Option<&CacheEntry> {
        self.entries.get(host)
    }

    pub fn entries(&self) -> &BTreeMap<String, CacheEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove entries observed more than the cache expiry ago. Returns how
    /// many were removed.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if is_expired(entry, now) {
                tracing::debug!("Deleting expired entry {} {}", entry.service, entry.name);
                false
            } else {
                true
            }
        });
        before - self.entries.len()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.entries)
    }

    /// Write the table to `path`, readable by the owner only. Parent
    /// directories are created owner-only as well.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_private_dir(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let json = self.to_json().context("Failed to serialize cache table")?;
        write_private(path, json.as_bytes())
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;

        Ok(())
    }
}

pub fn is_expired(entry: &CacheEntry, now: DateTime<Utc>) -> bool {
    entry.age(now) > Duration::seconds(CACHE_EXPIRATION_SECS)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        // mode only applies on creation
        if path.exists() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
