//! Filesystem storage layer.
//!
//! Three directories under the data dir hold the whole queue:
//!
//! ```text
//! {data_dir}/
//! ├── pending/                 messages available for claim
//! ├── working/{consumer_id}/   messages claimed by one consumer
//! └── abort/                   terminal, kept for inspection
//! ```
//!
//! Every mutation is a single-file operation (link, rename, remove). A rename
//! out of `pending` is the claim: whoever's rename succeeds owns the message.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{Claimed, MessageId, Priority};
use crate::telemetry::metrics;

const PENDING_DIR: &str = "pending";
const WORKING_DIR: &str = "working";
const ABORT_DIR: &str = "abort";
const TEMP_SUFFIX: &str = ".tmp";

/// Tunables for [`Storage::open`].
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Rescan interval when no change notification arrives.
    pub poll_interval: Duration,
    /// Arm a filesystem watcher on `pending`. Producers don't need one.
    pub watch: bool,
    /// Enqueue temp files older than this are removed by [`Storage::open`].
    /// Must exceed the longest plausible write of a single body.
    pub temp_grace: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            watch: true,
            temp_grace: Duration::from_secs(600),
        }
    }
}

/// Message counts per area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    /// Summed over every consumer's working directory.
    pub working: usize,
    pub aborted: usize,
}

/// Storage backend for one consumer identity.
pub struct Storage {
    data_dir: PathBuf,
    consumer_id: String,
    pending_dir: PathBuf,
    working_dir: PathBuf,
    abort_dir: PathBuf,
    poll_interval: Duration,
    /// Signalled whenever a message-named entry shows up in `pending`.
    arrivals: Arc<Notify>,
    _watcher: Option<Mutex<RecommendedWatcher>>,
}

impl Storage {
    /// Create the directory layout if needed and start watching `pending`.
    pub async fn open(
        data_dir: impl Into<PathBuf>,
        consumer_id: impl Into<String>,
        options: StorageOptions,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        let consumer_id = consumer_id.into();
        validate_consumer_id(&consumer_id)?;

        let pending_dir = data_dir.join(PENDING_DIR);
        let working_dir = data_dir.join(WORKING_DIR).join(&consumer_id);
        let abort_dir = data_dir.join(ABORT_DIR);

        tokio::fs::create_dir_all(&pending_dir).await?;
        tokio::fs::create_dir_all(&working_dir).await?;
        tokio::fs::create_dir_all(&abort_dir).await?;

        let swept = sweep_stale_temp_files(&pending_dir, options.temp_grace).await?;
        if swept > 0 {
            info!(count = swept, "removed abandoned enqueue temp files");
        }

        let arrivals = Arc::new(Notify::new());
        let watcher = if options.watch {
            match watch_pending(&pending_dir, Arc::clone(&arrivals)) {
                Ok(watcher) => Some(Mutex::new(watcher)),
                Err(e) => {
                    warn!(
                        poll_interval = ?options.poll_interval,
                        "cannot watch pending dir, falling back to polling: {e}"
                    );
                    None
                }
            }
        } else {
            None
        };

        debug!(
            data_dir = %data_dir.display(),
            consumer_id = %consumer_id,
            watch = options.watch,
            "storage opened"
        );

        Ok(Self {
            data_dir,
            consumer_id,
            pending_dir,
            working_dir,
            abort_dir,
            poll_interval: options.poll_interval,
            arrivals,
            _watcher: watcher,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Validate `priority`, then atomically publish `body` into `pending`.
    /// `None` means [`Priority::DEFAULT`].
    ///
    /// The body is written to a dot-prefixed temp file first and hard-linked
    /// under its final name, so a reader never observes a partial file and
    /// an existing name is never overwritten.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        body: &T,
        priority: Option<u8>,
    ) -> Result<MessageId> {
        let priority = priority.map_or(Ok(Priority::DEFAULT), Priority::new)?;
        let payload = serde_json::to_vec(body)?;

        let temp_path = self
            .pending_dir
            .join(format!(".{}{TEMP_SUFFIX}", Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&temp_path, &payload).await {
            remove_temp_file(&temp_path).await;
            return Err(e.into());
        }

        let published = self.link_into_pending(&temp_path, priority).await;
        remove_temp_file(&temp_path).await;
        let id = published?;

        record_op("enqueue");
        debug!(message_id = %id, %priority, bytes = payload.len(), "message enqueued");
        Ok(id)
    }

    async fn link_into_pending(&self, temp_path: &Path, priority: Priority) -> Result<MessageId> {
        loop {
            let id = MessageId::generate(priority);
            match tokio::fs::hard_link(temp_path, self.pending_path(&id)).await {
                Ok(()) => return Ok(id),
                // Another process took this exact nanosecond; the next id is later.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(message_id = %id, "id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Claiming
    // -----------------------------------------------------------------------

    /// One scan of `pending` in id order. Returns the first message this
    /// consumer managed to move into its working directory, or `None`.
    pub async fn try_claim(&self) -> Result<Option<MessageId>> {
        for id in list_ids(&self.pending_dir).await? {
            match tokio::fs::rename(self.pending_path(&id), self.working_path(&id)).await {
                Ok(()) => {
                    record_op("claim");
                    debug!(message_id = %id, consumer_id = %self.consumer_id, "message claimed");
                    return Ok(Some(id));
                }
                // Someone else claimed or removed it between listing and rename.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    record_op("claim_conflict");
                    debug!(message_id = %id, "claim conflict, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Claim the next message, waiting for one to arrive if `pending` is empty.
    ///
    /// Wakes on a watcher notification or after the poll interval, whichever
    /// comes first, and always rescans from scratch.
    pub async fn claim_next(&self) -> Result<MessageId> {
        loop {
            if let Some(id) = self.try_claim().await? {
                return Ok(id);
            }
            tokio::select! {
                _ = self.arrivals.notified() => trace!("pending changed, rescanning"),
                _ = tokio::time::sleep(self.poll_interval) => trace!("poll interval elapsed, rescanning"),
            }
        }
    }

    /// [`claim_next`](Self::claim_next) followed by
    /// [`read_claimed`](Self::read_claimed).
    ///
    /// A body that fails to decode stays claimed; recovery returns it.
    pub async fn claim_next_message<T: DeserializeOwned>(&self) -> Result<Claimed<T>> {
        let id = self.claim_next().await?;
        let body = self.read_claimed(&id).await?;
        Ok(Claimed { id, body })
    }

    // -----------------------------------------------------------------------
    // Claimed messages
    // -----------------------------------------------------------------------

    pub async fn read_claimed<T: DeserializeOwned>(&self, id: &MessageId) -> Result<T> {
        let bytes = tokio::fs::read(self.working_path(id))
            .await
            .map_err(|e| self.missing(e, id, "working"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Permanently remove a claimed message.
    pub async fn delete_claimed(&self, id: &MessageId) -> Result<()> {
        tokio::fs::remove_file(self.working_path(id))
            .await
            .map_err(|e| self.missing(e, id, "working"))?;
        record_op("delete");
        debug!(message_id = %id, "message deleted");
        Ok(())
    }

    /// Move a claimed message to the abort area. Terminal for the consumer.
    pub async fn move_to_abort(&self, id: &MessageId) -> Result<()> {
        tokio::fs::rename(self.working_path(id), self.abort_dir.join(id.to_string()))
            .await
            .map_err(|e| self.missing(e, id, "working"))?;
        record_op("abort");
        info!(message_id = %id, consumer_id = %self.consumer_id, "message aborted");
        Ok(())
    }

    /// Return every message in this consumer's working directory to `pending`.
    pub async fn recover_in_flight(&self) -> Result<Vec<MessageId>> {
        let mut recovered = Vec::new();
        for id in list_ids(&self.working_dir).await? {
            match tokio::fs::rename(self.working_path(&id), self.pending_path(&id)).await {
                Ok(()) => {
                    record_op("recover");
                    recovered.push(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(message_id = %id, "in-flight message vanished during recovery");
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !recovered.is_empty() {
            info!(
                consumer_id = %self.consumer_id,
                count = recovered.len(),
                "returned in-flight messages to pending"
            );
        }
        Ok(recovered)
    }

    /// Recover in-flight work and remove this consumer's working directory.
    ///
    /// The storage must not be used to claim afterwards.
    pub async fn close(&self) -> Result<()> {
        self.recover_in_flight().await?;
        match tokio::fs::remove_dir_all(&self.working_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(consumer_id = %self.consumer_id, "storage closed");
        Ok(())
    }

    /// Remove this consumer's working directory if it holds nothing.
    ///
    /// For short-lived handles (producers, inspection) that never claim.
    pub async fn prune_working_dir(&self) -> Result<bool> {
        if !list_ids(&self.working_dir).await?.is_empty() {
            return Ok(false);
        }
        match tokio::fs::remove_dir(&self.working_dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub async fn list_pending(&self) -> Result<Vec<MessageId>> {
        list_ids(&self.pending_dir).await
    }

    /// This consumer's claimed messages.
    pub async fn list_working(&self) -> Result<Vec<MessageId>> {
        list_ids(&self.working_dir).await
    }

    pub async fn list_aborted(&self) -> Result<Vec<MessageId>> {
        list_ids(&self.abort_dir).await
    }

    pub async fn read_pending<T: DeserializeOwned>(&self, id: &MessageId) -> Result<T> {
        let bytes = tokio::fs::read(self.pending_path(id))
            .await
            .map_err(|e| self.missing(e, id, "pending"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn read_aborted<T: DeserializeOwned>(&self, id: &MessageId) -> Result<T> {
        let bytes = tokio::fs::read(self.abort_dir.join(id.to_string()))
            .await
            .map_err(|e| self.missing(e, id, "abort"))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Operator action: put an aborted message back into `pending`.
    pub async fn requeue_aborted(&self, id: &MessageId) -> Result<()> {
        tokio::fs::rename(self.abort_dir.join(id.to_string()), self.pending_path(id))
            .await
            .map_err(|e| self.missing(e, id, "abort"))?;
        info!(message_id = %id, "aborted message requeued");
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut working = 0;
        let mut consumers = tokio::fs::read_dir(self.data_dir.join(WORKING_DIR)).await?;
        while let Some(entry) = consumers.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                working += list_ids(&entry.path()).await?.len();
            }
        }

        Ok(QueueStats {
            pending: list_ids(&self.pending_dir).await?.len(),
            working,
            aborted: list_ids(&self.abort_dir).await?.len(),
        })
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    fn pending_path(&self, id: &MessageId) -> PathBuf {
        self.pending_dir.join(id.to_string())
    }

    fn working_path(&self, id: &MessageId) -> PathBuf {
        self.working_dir.join(id.to_string())
    }

    fn missing(&self, e: std::io::Error, id: &MessageId, area: &str) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            match area {
                "working" => Error::NotFound(format!("{id} in working/{}", self.consumer_id)),
                _ => Error::NotFound(format!("{id} in {area}")),
            }
        } else {
            Error::Io(e)
        }
    }
}

/// Message ids in `dir`, sorted. Entries that aren't message names are ignored.
async fn list_ids(dir: &Path) -> Result<Vec<MessageId>> {
    let mut ids = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            ids.push(id);
        }
    }
    // read_dir order is unspecified.
    ids.sort_unstable();
    Ok(ids)
}

async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove temp file: {e}"),
    }
}

/// Remove enqueue temp files in `dir` last modified more than `grace` ago.
///
/// They are left behind when a producer dies between writing and linking.
/// A live producer's temp file is younger than `grace` and is kept.
async fn sweep_stale_temp_files(dir: &Path, grace: Duration) -> Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name
            .to_str()
            .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        {
            continue;
        }
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        // A clock step backwards makes the file look new; it waits for the next open.
        if now.duration_since(modified).unwrap_or_default() < grace {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed stale temp file");
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

fn watch_pending(dir: &Path, arrivals: Arc<Notify>) -> Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_arrival(&event) => arrivals.notify_one(),
        Ok(_) => {}
        Err(e) => warn!("pending watcher error: {e}"),
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// A new message name appeared: freshly linked, or renamed in by recovery.
fn is_arrival(event: &Event) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any
    );
    kind_matches
        && event.paths.iter().any(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.parse::<MessageId>().is_ok())
        })
}

fn validate_consumer_id(consumer_id: &str) -> Result<()> {
    let valid = !consumer_id.is_empty()
        && consumer_id != "."
        && consumer_id != ".."
        && !consumer_id.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "consumer id must be a single path component, got {consumer_id:?}"
        )))
    }
}

fn record_op(operation: &'static str) {
    metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
}
