//! A fixed set of independent sessions shared by concurrent transfers.
//!
//! Every slot owns a [`Client`] (session plus navigator) behind an async
//! mutex. Holding the mutex guard is what marks a slot busy, so a session
//! never serves two units of work at once. Transfers themselves are blocking
//! and run on tokio's blocking thread pool.

use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::config::{ServerProfile, Settings};
use crate::error::{Error, Result};
use crate::session::{FtpSession, Session};
use crate::tree::TransferError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Pause between scans for a free session
    pub poll_interval: Duration,
    /// Total time `acquire` waits before giving up
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Exclusive use of one pooled session, released on drop.
pub struct Lease<S: Session> {
    index: usize,
    guard: OwnedMutexGuard<Client<S>>,
}

impl<S: Session> Lease<S> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<S: Session> Deref for Lease<S> {
    type Target = Client<S>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<S: Session> DerefMut for Lease<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

struct Unit {
    source: String,
    destination: String,
    handle: JoinHandle<Result<u64>>,
}

pub struct SessionPool<S: Session + 'static> {
    slots: Vec<Arc<Mutex<Client<S>>>>,
    settings: PoolSettings,
    units: Vec<Unit>,
    // Failures of units already collected before `close`
    failed: Vec<TransferError>,
}

impl SessionPool<FtpSession> {
    /// Open `settings.pool_size` FTP sessions to the same server.
    pub async fn connect(profile: &ServerProfile, settings: &Settings) -> Result<Self> {
        profile.validate()?;
        info!(
            "Opening {} sessions to {}",
            settings.pool_size,
            profile.host_port()
        );

        let connecting = (0..settings.pool_size).map(|_| {
            let profile = profile.clone();
            let block_size = settings.block_size;
            tokio::task::spawn_blocking(move || {
                FtpSession::connect(&profile).map(|s| s.with_block_size(block_size))
            })
        });

        let mut clients = Vec::with_capacity(settings.pool_size);
        for joined in join_all(connecting).await {
            let session = joined.map_err(|e| Error::Task(e.to_string()))??;
            clients.push(Client::with_options(session, settings.client_options()));
        }
        Ok(Self::with_clients(clients, settings.pool_settings()))
    }
}

impl<S: Session + 'static> SessionPool<S> {
    pub fn new(sessions: Vec<S>, settings: PoolSettings) -> Self {
        Self::with_clients(sessions.into_iter().map(Client::new).collect(), settings)
    }

    pub fn with_clients(clients: Vec<Client<S>>, settings: PoolSettings) -> Self {
        Self {
            slots: clients
                .into_iter()
                .map(|client| Arc::new(Mutex::new(client)))
                .collect(),
            settings,
            units: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Number of spawned units whose outcome has not been collected yet.
    pub fn pending(&self) -> usize {
        self.units.len()
    }

    /// Lease a free session, polling every `poll_interval` until one frees up
    /// or `acquire_timeout` has elapsed.
    pub async fn acquire(&self) -> Result<Lease<S>> {
        let started = Instant::now();
        loop {
            for (index, slot) in self.slots.iter().enumerate() {
                if let Ok(guard) = Arc::clone(slot).try_lock_owned() {
                    debug!("Leased session {}", index);
                    return Ok(Lease { index, guard });
                }
            }

            if started.elapsed() >= self.settings.acquire_timeout {
                warn!(
                    "No free session among {} after {:?}",
                    self.slots.len(),
                    self.settings.acquire_timeout
                );
                return Err(Error::ResourceUnavailable(self.settings.acquire_timeout));
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Lease a session and download `remote` to `local` in the background.
    pub async fn spawn_download(
        &mut self,
        remote: impl Into<String>,
        local: impl Into<PathBuf>,
    ) -> Result<()> {
        self.collect_finished().await;
        let remote = remote.into();
        let local = local.into();
        let destination = local.display().to_string();
        let mut lease = self.acquire().await?;

        let source = remote.clone();
        let handle = tokio::task::spawn_blocking(move || lease.get_to_path(&remote, &local));
        self.units.push(Unit {
            source,
            destination,
            handle,
        });
        Ok(())
    }

    /// Lease a session and upload `local` to `remote` in the background.
    pub async fn spawn_upload(
        &mut self,
        local: impl Into<PathBuf>,
        remote: impl Into<String>,
    ) -> Result<()> {
        self.collect_finished().await;
        let local = local.into();
        let remote = remote.into();
        let source = local.display().to_string();
        let mut lease = self.acquire().await?;

        let destination = remote.clone();
        let handle = tokio::task::spawn_blocking(move || lease.put_file(&local, &remote));
        self.units.push(Unit {
            source,
            destination,
            handle,
        });
        Ok(())
    }

    /// Drop the handles of units that already ran, keeping their failures.
    async fn collect_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.units)
            .into_iter()
            .partition(|unit| unit.handle.is_finished());
        self.units = running;
        for unit in finished {
            let joined = unit.handle.await;
            if let Some(failure) = settle(unit.source, unit.destination, joined) {
                self.failed.push(failure);
            }
        }
    }

    /// Wait for every spawned unit, then shut down every session.
    ///
    /// Returns one [`TransferError`] per unit that failed.
    pub async fn close(self) -> Vec<TransferError> {
        let (labels, handles): (Vec<_>, Vec<_>) = self
            .units
            .into_iter()
            .map(|unit| ((unit.source, unit.destination), unit.handle))
            .unzip();

        let mut errors = self.failed;
        for ((source, destination), joined) in labels.into_iter().zip(join_all(handles).await) {
            errors.extend(settle(source, destination, joined));
        }

        let teardown = self.slots.into_iter().map(|slot| async move {
            let mut client = slot.lock_owned().await;
            if let Err(e) = tokio::task::spawn_blocking(move || client.close()).await {
                warn!("Session teardown did not finish: {}", e);
            }
        });
        join_all(teardown).await;

        errors
    }
}

fn settle(
    source: String,
    destination: String,
    joined: std::result::Result<Result<u64>, JoinError>,
) -> Option<TransferError> {
    let message = match joined {
        Ok(Ok(bytes)) => {
            debug!("{} -> {} done ({} bytes)", source, destination, bytes);
            return None;
        }
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("Transfer task failed to complete: {e}"),
    };
    error!("{} -> {} failed: {}", source, destination, message);
    Some(TransferError::new(source, destination, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use crate::transfer::NoProgress;

    fn quick() -> PoolSettings {
        PoolSettings {
            poll_interval: Duration::from_millis(5),
            acquire_timeout: Duration::from_secs(5),
        }
    }

    fn pool_on(remote: &MemorySession, size: usize, settings: PoolSettings) -> SessionPool<MemorySession> {
        let clients = (0..size)
            .map(|_| {
                let mut client = Client::new(remote.attach());
                client.set_progress_sink(Box::new(NoProgress));
                client
            })
            .collect();
        SessionPool::with_clients(clients, settings)
    }

    #[tokio::test]
    async fn test_acquire_hands_out_distinct_sessions() {
        let remote = MemorySession::new();
        let pool = pool_on(&remote, 3, quick());

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();

        let mut indices = vec![a.index(), b.index(), c.index()];
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_extra_acquire_waits_for_release() {
        let remote = MemorySession::new();
        let pool = Arc::new(pool_on(&remote, 2, quick()));
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        let released = first.index();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.index()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let index = waiter.await.unwrap().unwrap();
        assert_eq!(index, released);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let remote = MemorySession::new();
        let settings = PoolSettings {
            poll_interval: Duration::from_millis(5),
            acquire_timeout: Duration::from_millis(30),
        };
        let pool = pool_on(&remote, 1, settings);
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, Error::ResourceUnavailable(d) if d == Duration::from_millis(30)));
    }

    #[tokio::test]
    async fn test_leases_keep_their_own_navigator() {
        let remote = MemorySession::new();
        remote.add_dir("left");
        remote.add_dir("right");
        let pool = pool_on(&remote, 2, quick());

        let mut a = pool.acquire().await.unwrap();
        let mut b = pool.acquire().await.unwrap();
        a.cd("left").unwrap();
        b.cd("right").unwrap();

        assert_eq!(a.pwd(), "left");
        assert_eq!(b.pwd(), "right");
    }

    #[tokio::test]
    async fn test_close_collects_failures_and_tears_down() {
        let remote = MemorySession::new();
        for i in 0..6 {
            remote.add_file(&format!("files/{i}.dat"), format!("payload {i}").as_bytes());
        }
        remote.fail_transfers_of("4.dat");
        let local = tempfile::tempdir().unwrap();
        let mut pool = pool_on(&remote, 2, quick());

        for i in 0..6 {
            pool.spawn_download(format!("files/{i}.dat"), local.path().join(format!("{i}.dat")))
                .await
                .unwrap();
        }
        let errors = pool.close().await;

        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "files/4.dat");
        for i in [0, 1, 2, 3, 5] {
            let body = std::fs::read(local.path().join(format!("{i}.dat"))).unwrap();
            assert_eq!(body, format!("payload {i}").into_bytes());
        }
        assert_eq!(remote.disconnected_sessions(), 2);
    }

    #[tokio::test]
    async fn test_finished_units_are_collected_on_next_spawn() {
        let remote = MemorySession::new();
        remote.add_file("bad.dat", b"bad");
        remote.add_file("good.dat", b"good");
        remote.fail_transfers_of("bad.dat");
        let local = tempfile::tempdir().unwrap();
        let mut pool = pool_on(&remote, 1, quick());

        pool.spawn_download("bad.dat", local.path().join("bad.dat"))
            .await
            .unwrap();
        while !pool.units.iter().all(|unit| unit.handle.is_finished()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.spawn_download("good.dat", local.path().join("good.dat"))
            .await
            .unwrap();

        assert_eq!(pool.pending(), 1);
        assert_eq!(pool.failed.len(), 1);

        let errors = pool.close().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "bad.dat");
        assert_eq!(std::fs::read(local.path().join("good.dat")).unwrap(), b"good");
    }

    #[tokio::test]
    async fn test_spawn_upload() {
        let remote = MemorySession::new();
        let local = tempfile::tempdir().unwrap();
        let mut pool = pool_on(&remote, 3, quick());
        for name in ["x.txt", "y.txt"] {
            let path = local.path().join(name);
            std::fs::write(&path, name).unwrap();
            pool.spawn_upload(path, "incoming/").await.unwrap();
        }

        assert!(pool.close().await.is_empty());
        assert_eq!(remote.file("incoming/x.txt"), Some(b"x.txt".to_vec()));
        assert_eq!(remote.file("incoming/y.txt"), Some(b"y.txt".to_vec()));
    }
}
