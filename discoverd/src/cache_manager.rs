use std::path::PathBuf;
use std::thread;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use anyhow::Result;
use shared::types::CacheEntry;
use crate::cache::table::CacheTable;

/// Commands sent to the cache thread
pub enum CacheCommand {
    Upsert(String, CacheEntry, oneshot::Sender<()>),
    Get(String, oneshot::Sender<Option<CacheEntry>>),
    Snapshot(oneshot::Sender<Vec<(String, CacheEntry)>>),
    /// Evict expired entries, then persist to the path if one is set.
    /// Replies with the number of entries left.
    Flush(Option<PathBuf>, oneshot::Sender<usize>),
    Shutdown,
}

/// Handle to the thread owning the cache table. Every read and write goes
/// through this one owner, so discovery rounds and flushes never interleave
/// on the table.
#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Spawn a new cache thread owning `table`
    pub fn spawn(mut table: CacheTable) -> Self {
        let (tx, mut rx) = mpsc::channel::<CacheCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    CacheCommand::Upsert(host, entry, reply) => {
                        tracing::debug!("Caching {} under {}", entry.name, host);
                        table.upsert(host, entry);
                        let _ = reply.send(());
                    }
                    CacheCommand::Get(host, reply) => {
                        let _ = reply.send(table.get(&host).cloned());
                    }
                    CacheCommand::Snapshot(reply) => {
                        let entries = table
                            .entries()
                            .iter()
                            .map(|(host, entry)| (host.clone(), entry.clone()))
                            .collect();
                        let _ = reply.send(entries);
                    }
                    CacheCommand::Flush(path, reply) => {
                        let evicted = table.evict_expired(Utc::now());
                        if evicted > 0 {
                            tracing::info!("Evicted {} expired services", evicted);
                        }
                        match path {
                            Some(path) => {
                                // persistence is best effort
                                if let Err(e) = table.persist(&path) {
                                    tracing::error!("{:#}. No persistence!", e);
                                }
                            }
                            None => tracing::debug!("No cache path configured, not persisting"),
                        }
                        let _ = reply.send(table.len());
                    }
                    CacheCommand::Shutdown => {
                        tracing::info!("Cache thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Insert or replace the entry for a host
    pub async fn upsert(&self, host: String, entry: CacheEntry) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Upsert(host, entry, reply)).await?;
        Ok(rx.await?)
    }

    pub async fn get(&self, host: String) -> Result<Option<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Get(host, reply)).await?;
        Ok(rx.await?)
    }

    /// All entries, ordered by host
    pub async fn snapshot(&self) -> Result<Vec<(String, CacheEntry)>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Snapshot(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn flush(&self, path: Option<PathBuf>) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(CacheCommand::Flush(path, reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the cache thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(CacheCommand::Shutdown).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(name: &str) -> CacheEntry {
        CacheEntry {
            name: name.to_string(),
            port: 80,
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let cache = CacheHandle::spawn(CacheTable::new());

        cache.upsert("a.local.".to_string(), entry("a._http._tcp.local.")).await.unwrap();

        let found = cache.get("a.local.".to_string()).await.unwrap().unwrap();
        assert_eq!(found.name, "a._http._tcp.local.");
        assert!(cache.get("b.local.".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = CacheHandle::spawn(CacheTable::new());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                let host = format!("host{}.local.", i);
                cache.upsert(host, entry(&format!("inst{}._http._tcp.local.", i))).await.unwrap();
                cache.flush(Some(path)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(cache.snapshot().await.unwrap().len(), 16);
        assert_eq!(CacheTable::load(&path).len(), 16);
    }

    #[tokio::test]
    async fn test_flush_evicts_expired() {
        let cache = CacheHandle::spawn(CacheTable::new());

        let mut stale = entry("stale._http._tcp.local.");
        stale.timestamp = Utc::now() - Duration::seconds(700);
        cache.upsert("stale.local.".to_string(), stale).await.unwrap();
        cache.upsert("fresh.local.".to_string(), entry("fresh._http._tcp.local.")).await.unwrap();

        assert_eq!(cache.flush(None).await.unwrap(), 1);
        let hosts: Vec<_> = cache.snapshot().await.unwrap().into_iter().map(|(h, _)| h).collect();
        assert_eq!(hosts, vec!["fresh.local.".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let cache = CacheHandle::spawn(CacheTable::new());
        cache.shutdown().await.unwrap();

        // the thread is gone once the command is processed
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(cache.snapshot().await.is_err());
    }
}
