//! Save and load pipelines between a [`VaultSession`] and the card.
//!
//! A single worker task owns the [`CardTransport`] and takes jobs from a
//! queue, so a second save only starts once the first one has disconnected.
//! Progress is published on a `watch` channel.

use std::fmt;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::VaultSession;
use crate::error::{CardError, SyncError};
use crate::transport::{CardTransport, Peripheral};

/// Location of the vault container on the card.
pub const CARD_PATH: &str = "/passwordvault/db.kdbx";

const QUEUE_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Encrypting,
    Connecting,
    Transferring,
    Complete,
    Failed(String),
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => f.write_str("idle"),
            SyncStatus::Encrypting => f.write_str("encrypting"),
            SyncStatus::Connecting => f.write_str("connecting"),
            SyncStatus::Transferring => f.write_str("transferring"),
            SyncStatus::Complete => f.write_str("complete"),
            SyncStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub card_path: String,
    /// Extra connect attempts after a connection timeout.
    pub connect_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            card_path: CARD_PATH.to_string(),
            connect_retries: 2,
        }
    }
}

enum Job {
    Save {
        session: Box<VaultSession>,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Load {
        password: Zeroizing<String>,
        reply: oneshot::Sender<Result<VaultSession, SyncError>>,
    },
}

/// Cloneable front end of the sync worker.
///
/// The worker stops once every handle has been dropped.
#[derive(Clone)]
pub struct SyncHandle {
    jobs: mpsc::Sender<Job>,
    status: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn<P>(transport: CardTransport<P>, settings: SyncSettings) -> Self
    where
        P: Peripheral + 'static,
    {
        let (jobs, queue) = mpsc::channel(QUEUE_DEPTH);
        let (status_tx, status) = watch::channel(SyncStatus::Idle);

        let worker = Worker {
            transport,
            settings,
            status: status_tx,
        };
        tokio::spawn(worker.run(queue));

        Self { jobs, status }
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Encrypts a snapshot of `session` and writes it to the card. Waits for
    /// any earlier job, including its disconnect.
    pub async fn save(&self, session: &VaultSession) -> Result<(), SyncError> {
        let (reply, done) = oneshot::channel();
        self.jobs
            .send(Job::Save {
                session: Box::new(session.clone()),
                reply,
            })
            .await
            .map_err(|_| SyncError::WorkerStopped)?;
        done.await.map_err(|_| SyncError::WorkerStopped)?
    }

    /// Reads the container from the card and opens it with `password`.
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound` if the card holds no vault yet.
    pub async fn load(&self, password: &str) -> Result<VaultSession, SyncError> {
        let (reply, done) = oneshot::channel();
        self.jobs
            .send(Job::Load {
                password: Zeroizing::new(password.to_string()),
                reply,
            })
            .await
            .map_err(|_| SyncError::WorkerStopped)?;
        done.await.map_err(|_| SyncError::WorkerStopped)?
    }
}

struct Worker<P> {
    transport: CardTransport<P>,
    settings: SyncSettings,
    status: watch::Sender<SyncStatus>,
}

impl<P: Peripheral> Worker<P> {
    async fn run(mut self, mut queue: mpsc::Receiver<Job>) {
        while let Some(job) = queue.recv().await {
            match job {
                Job::Save { session, reply } => {
                    let result = self.save(*session).await;
                    self.finish(&result);
                    let _ = reply.send(result);
                }
                Job::Load { password, reply } => {
                    let result = self.load(password).await;
                    self.finish(&result);
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn publish(&self, status: SyncStatus) {
        info!(%status, "sync");
        self.status.send_replace(status);
    }

    fn finish<T>(&self, result: &Result<T, SyncError>) {
        match result {
            Ok(_) => self.publish(SyncStatus::Complete),
            Err(e) => self.publish(SyncStatus::Failed(e.to_string())),
        }
    }

    async fn save(&mut self, mut session: VaultSession) -> Result<(), SyncError> {
        self.publish(SyncStatus::Encrypting);
        let data = task::spawn_blocking(move || session.encrypt())
            .await
            .map_err(|_| SyncError::WorkerStopped)??;

        self.transport.ensure_powered_on().await?;

        self.publish(SyncStatus::Connecting);
        let outcome = match self.connect().await {
            Ok(()) => {
                self.publish(SyncStatus::Transferring);
                self.write(&data).await
            }
            Err(e) => Err(e),
        };
        self.release().await;

        outcome.map_err(SyncError::from)
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), CardError> {
        let path = self.settings.card_path.as_str();
        self.transport.put(data).await?;
        self.transport.verify_checksum(data).await?;
        self.transport.close(path).await?;
        info!(bytes = data.len(), path, "vault written to card");
        Ok(())
    }

    async fn load(&mut self, password: Zeroizing<String>) -> Result<VaultSession, SyncError> {
        self.transport.ensure_powered_on().await?;

        self.publish(SyncStatus::Connecting);
        let outcome = match self.connect().await {
            Ok(()) => {
                self.publish(SyncStatus::Transferring);
                self.read().await
            }
            Err(e) => Err(e.into()),
        };
        self.release().await;

        let data = outcome?;
        let session = task::spawn_blocking(move || VaultSession::open(&data, &password))
            .await
            .map_err(|_| SyncError::WorkerStopped)??;
        Ok(session)
    }

    async fn read(&mut self) -> Result<Vec<u8>, SyncError> {
        let path = self.settings.card_path.clone();
        if !self.transport.exists(&path).await? {
            return Err(SyncError::DatabaseNotFound);
        }
        match self.transport.get(&path).await {
            Ok(data) => Ok(data),
            Err(CardError::FileNotFound(_)) => Err(SyncError::DatabaseNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Connects, retrying only on timeouts.
    async fn connect(&mut self) -> Result<(), CardError> {
        let mut attempt = 0;
        loop {
            match self.transport.connect().await {
                Err(CardError::ConnectionTimedOut) if attempt < self.settings.connect_retries => {
                    attempt += 1;
                    warn!(attempt, "connect timed out, retrying");
                }
                other => return other,
            }
        }
    }

    /// Runs after every transfer attempt, successful or not.
    async fn release(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
    }
}
