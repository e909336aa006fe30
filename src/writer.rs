//! Multi-writer ingestion pipeline
//!
//! Each worker task owns exactly one block file and is fed by its own
//! bounded queue. Submissions are routed by a stable coordinate hash,
//! so a given coordinate always reaches the same worker; that makes the
//! worker's local written-set a complete duplicate check, keeps every
//! append sequential per file, and leaves the single commit channel as
//! the only cross-worker rendezvous.

use crate::blockfile::BlockFile;
use crate::codec::Codec;
use crate::error::{Error, Result, WriteError};
use crate::index::{BlockIndex, IndexEntry};
use crate::types::BlockCoord;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Work sent down one worker's queue.
pub(crate) enum Submission {
    Write {
        coord: BlockCoord,
        idx: u64,
        data: Bytes,
    },
    /// Sync the block file and echo a token to the committer. Queued
    /// behind every earlier submission, so the echo proves the queue
    /// prefix has been processed.
    Checkpoint,
    /// Poison pill: drain everything queued before it, then stop.
    Shutdown,
}

/// Messages from the workers to the index-update agent.
pub(crate) enum CommitMessage {
    Committed {
        coord: BlockCoord,
        idx: u64,
        entry: IndexEntry,
    },
    Rejected(WriteError),
    Checkpoint,
    /// A flush waiting for one full checkpoint wave.
    FlushRequest(oneshot::Sender<()>),
    /// Sent once every worker has stopped.
    Shutdown,
}

/// Route a coordinate to its owning worker.
///
/// FNV-1a over the 12-byte little-endian triple, mod the worker count.
/// Stable across runs and platforms; the same coordinate always lands
/// on the same worker and therefore the same block file.
pub(crate) fn route(coord: BlockCoord, n_workers: u16) -> u16 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in coord.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % n_workers as u64) as u16
}

struct Worker {
    id: u16,
    file: BlockFile,
    codec: Arc<dyn Codec>,
    written: HashSet<BlockCoord>,
    rx: mpsc::Receiver<Submission>,
    commit_tx: mpsc::Sender<CommitMessage>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(submission) = self.rx.recv().await {
            match submission {
                Submission::Write { coord, idx, data } => {
                    self.handle_write(coord, idx, data).await;
                }
                Submission::Checkpoint => {
                    if let Err(e) = self.file.sync().await {
                        tracing::warn!(worker = self.id, error = %e, "block-file sync failed");
                    }
                    let _ = self.commit_tx.send(CommitMessage::Checkpoint).await;
                }
                Submission::Shutdown => break,
            }
        }
        // The pill (or a closed queue) is behind every accepted
        // submission, so the drain is complete here.
        if let Err(e) = self.file.sync().await {
            tracing::warn!(worker = self.id, error = %e, "block-file sync failed at shutdown");
        }
        tracing::debug!(worker = self.id, "writer drained");
    }

    async fn handle_write(&mut self, coord: BlockCoord, idx: u64, data: Bytes) {
        if self.written.contains(&coord) {
            tracing::warn!(%coord, worker = self.id, "duplicate submission dropped");
            let _ = self
                .commit_tx
                .send(CommitMessage::Rejected(WriteError::DuplicateWrite(coord)))
                .await;
            return;
        }
        match self.encode_and_append(&data).await {
            Ok(entry) => {
                self.written.insert(coord);
                tracing::trace!(%coord, worker = self.id, offset = entry.offset, nbytes = entry.nbytes, "block appended");
                let _ = self
                    .commit_tx
                    .send(CommitMessage::Committed { coord, idx, entry })
                    .await;
            }
            // The coordinate stays absent from the written-set: the
            // failed bytes were never advertised, so a later submission
            // may still claim the cell.
            Err(e) => {
                tracing::warn!(%coord, worker = self.id, error = %e, "block write failed");
                let _ = self
                    .commit_tx
                    .send(CommitMessage::Rejected(WriteError::WriteFailure {
                        coord,
                        reason: e.to_string(),
                    }))
                    .await;
            }
        }
    }

    async fn encode_and_append(&mut self, data: &[u8]) -> Result<IndexEntry> {
        let encoded = self.codec.encode(data)?;
        if encoded.is_empty() {
            return Err(Error::Codec("codec produced zero bytes".into()));
        }
        let (offset, nbytes) = self.file.append(&encoded).await?;
        Ok(IndexEntry::new(self.id, offset, nbytes))
    }
}

/// The index-update agent: the sole consumer of the commit channel and
/// the only writer of the shared index.
async fn run_committer(
    mut rx: mpsc::Receiver<CommitMessage>,
    index: Arc<RwLock<BlockIndex>>,
    errors: Arc<Mutex<Vec<WriteError>>>,
    n_workers: u16,
) {
    let mut checkpoints: u32 = 0;
    let mut waiters: VecDeque<oneshot::Sender<()>> = VecDeque::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            CommitMessage::Committed { coord, idx, entry } => {
                if !index.write().put(idx, entry) {
                    // The worker-local duplicate check makes this
                    // unreachable in normal operation; record it rather
                    // than clobber the first write.
                    errors.lock().push(WriteError::DuplicateWrite(coord));
                }
            }
            CommitMessage::Rejected(err) => {
                errors.lock().push(err);
            }
            CommitMessage::Checkpoint => checkpoints += 1,
            CommitMessage::FlushRequest(tx) => waiters.push_back(tx),
            CommitMessage::Shutdown => break,
        }
        // One flush completes per full wave of worker checkpoints,
        // whichever side of the rendezvous arrived first.
        while checkpoints >= n_workers as u32 {
            match waiters.pop_front() {
                Some(tx) => {
                    checkpoints -= n_workers as u32;
                    let _ = tx.send(());
                }
                None => break,
            }
        }
    }
    // Channel closed mid-flush only during shutdown; release any
    // stragglers instead of leaving them waiting forever.
    for tx in waiters {
        let _ = tx.send(());
    }
}

/// Cheap-to-clone producer side of the pool: the per-worker submission
/// queues plus the commit channel used for flush rendezvous.
#[derive(Clone)]
#[derive(Debug)]
pub(crate) struct PoolHandle {
    submit_tx: Vec<mpsc::Sender<Submission>>,
    commit_tx: mpsc::Sender<CommitMessage>,
}

impl PoolHandle {
    pub fn n_workers(&self) -> u16 {
        self.submit_tx.len() as u16
    }

    /// Queue one block on its owning worker, waiting for queue space.
    pub async fn submit(&self, coord: BlockCoord, idx: u64, data: Bytes) -> Result<()> {
        let worker = route(coord, self.n_workers()) as usize;
        self.submit_tx[worker]
            .send(Submission::Write { coord, idx, data })
            .await
            .map_err(|_| Error::Closed)
    }

    /// Run one checkpoint wave: every submission accepted before this
    /// call has committed or failed by the time it returns, and every
    /// block file has been synced.
    pub async fn checkpoint(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commit_tx
            .send(CommitMessage::FlushRequest(tx))
            .await
            .map_err(|_| Error::Closed)?;
        for sender in &self.submit_tx {
            sender
                .send(Submission::Checkpoint)
                .await
                .map_err(|_| Error::Closed)?;
        }
        rx.await.map_err(|_| Error::Closed)
    }
}

/// The running worker set.
#[derive(Debug)]
pub(crate) struct WriterPool {
    handle: PoolHandle,
    workers: Vec<JoinHandle<()>>,
    committer: JoinHandle<()>,
}

impl WriterPool {
    /// Spawn one worker per block file plus the index-update agent.
    pub fn start(
        files: Vec<BlockFile>,
        codec: Arc<dyn Codec>,
        index: Arc<RwLock<BlockIndex>>,
        errors: Arc<Mutex<Vec<WriteError>>>,
        queue_depth: usize,
    ) -> Self {
        let n_workers = files.len() as u16;
        let (commit_tx, commit_rx) = mpsc::channel(queue_depth.max(1) * files.len());

        let mut submit_tx = Vec::with_capacity(files.len());
        let mut workers = Vec::with_capacity(files.len());
        for (id, file) in files.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            submit_tx.push(tx);
            workers.push(tokio::spawn(
                Worker {
                    id: id as u16,
                    file,
                    codec: Arc::clone(&codec),
                    written: HashSet::new(),
                    rx,
                    commit_tx: commit_tx.clone(),
                }
                .run(),
            ));
        }

        let committer = tokio::spawn(run_committer(commit_rx, index, errors, n_workers));

        Self {
            handle: PoolHandle {
                submit_tx,
                commit_tx,
            },
            workers,
            committer,
        }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Drain every queue, stop the workers, then stop the committer.
    ///
    /// The shutdown pill queues behind every accepted submission, so
    /// joining the workers is what guarantees the drain.
    pub async fn shutdown(self) {
        for sender in &self.handle.submit_tx {
            let _ = sender.send(Submission::Shutdown).await;
        }
        for handle in self.workers {
            let _ = handle.await;
        }
        let _ = self.handle.commit_tx.send(CommitMessage::Shutdown).await;
        let _ = self.committer.await;
    }
}
