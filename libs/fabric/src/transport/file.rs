use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_core::{validate_address, Envelope, BROADCAST};
use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout, MissedTickBehavior};

use crate::codec::{BincodeCodec, Codec, Format};
use crate::error::{Error, Result};
use crate::task::{ListenerSlot, StopSignal};
use crate::transport::{InboundSink, Protocol};

const INBOX_DIR: &str = "inbox";
const ERROR_DIR: &str = "error";
const STAGING_DIR: &str = "tmp";
const EXTENSION: &str = "msg";

/// Directory mailbox settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding one mailbox per address
    pub base_dir: PathBuf,
    /// Mailbox this node listens on
    pub address: String,
    pub poll_interval_ms: u64,
    /// Bound on every individual filesystem operation
    pub io_timeout_ms: u64,
    pub format: Format,
}

impl FileConfig {
    pub fn new(base_dir: impl Into<PathBuf>, address: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data/fallback_comm"),
            address: "node".to_string(),
            poll_interval_ms: 500,
            io_timeout_ms: 2000,
            format: Format::Bincode,
        }
    }
}

static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Name for a new mailbox file
///
/// The stamp is wall-clock nanoseconds forced strictly increasing within the
/// process, so sorting names reproduces write order. The pid keeps
/// concurrent writer processes apart.
fn next_file_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let previous = LAST_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    let stamp = now.max(previous + 1);

    format!("{:020}-{}", stamp, std::process::id())
}

/// Same-host, cross-process delivery through per-recipient directories
///
/// Layout under the base directory:
///
/// ```text
/// <recipient>/inbox/<id>.msg   pending
/// <recipient>/error/<id>.msg   unparseable, kept for inspection
/// <recipient>/tmp/<id>.tmp     being written
/// ```
///
/// Writers stage into `tmp/` and rename into `inbox/`, so a listener never
/// sees a half-written file.
pub struct FileProtocol<C = BincodeCodec> {
    config: FileConfig,
    codec: C,
    initialized: AtomicBool,
    listener: ListenerSlot,
}

impl FileProtocol<BincodeCodec> {
    pub fn new(config: FileConfig) -> Self {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<C: Codec + Clone + 'static> FileProtocol<C> {
    pub fn with_codec(config: FileConfig, codec: C) -> Self {
        Self {
            config,
            codec,
            initialized: AtomicBool::new(false),
            listener: ListenerSlot::new(),
        }
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    pub fn mailbox_dir(&self, address: &str) -> PathBuf {
        self.config.base_dir.join(address)
    }

    pub fn inbox_dir(&self, address: &str) -> PathBuf {
        self.mailbox_dir(address).join(INBOX_DIR)
    }

    pub fn error_dir(&self, address: &str) -> PathBuf {
        self.mailbox_dir(address).join(ERROR_DIR)
    }

    async fn write_into(&self, recipient: &str, bytes: &[u8]) -> Result<()> {
        let mailbox = self.mailbox_dir(recipient);
        let staging_dir = mailbox.join(STAGING_DIR);
        let inbox_dir = mailbox.join(INBOX_DIR);

        let id = next_file_id();
        let staging = staging_dir.join(format!("{id}.tmp"));
        let target = inbox_dir.join(format!("{id}.{EXTENSION}"));

        let write_op = async {
            fs::create_dir_all(&staging_dir).await?;
            fs::create_dir_all(&inbox_dir).await?;

            let mut file = fs::File::create(&staging).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);

            fs::rename(&staging, &target).await?;
            Ok::<(), Error>(())
        };

        let result = match timeout(self.config.io_timeout(), write_op).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("File write")),
        };

        if result.is_err() {
            let _ = fs::remove_file(&staging).await;
        } else {
            tracing::trace!(path = %target.display(), "mailbox file written");
        }
        result
    }

    /// Every mailbox other than our own
    async fn broadcast_targets(&self) -> Result<Vec<String>> {
        let scan = async {
            let mut targets = Vec::new();
            let mut entries = fs::read_dir(&self.config.base_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if name == self.config.address || validate_address(&name).is_err() {
                    continue;
                }
                if fs::metadata(entry.path().join(INBOX_DIR)).await.is_ok() {
                    targets.push(name);
                }
            }
            targets.sort();
            Ok::<Vec<String>, Error>(targets)
        };

        let targets = timeout(self.config.io_timeout(), scan)
            .await
            .map_err(|_| Error::Timeout("Mailbox scan"))??;

        if targets.is_empty() {
            return Err(Error::NoRoute(BROADCAST.to_string()));
        }
        Ok(targets)
    }
}

#[async_trait::async_trait]
impl<C: Codec + Clone + 'static> Protocol for FileProtocol<C> {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn initialize(&self) -> Result<()> {
        validate_address(&self.config.address)
            .map_err(|e| Error::Config(format!("file mailbox address: {e}")))?;

        let mailbox = self.mailbox_dir(&self.config.address);
        let prepare = async {
            for dir in [INBOX_DIR, ERROR_DIR, STAGING_DIR] {
                fs::create_dir_all(mailbox.join(dir)).await?;
            }
            Ok::<(), std::io::Error>(())
        };

        match timeout(self.config.io_timeout(), prepare).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::Config(format!(
                    "cannot prepare mailbox {}: {e}",
                    mailbox.display()
                )))
            }
            Err(_) => {
                return Err(Error::Config(format!(
                    "timed out preparing mailbox {}",
                    mailbox.display()
                )))
            }
        }

        if !self.initialized.swap(true, Ordering::SeqCst) {
            tracing::debug!(mailbox = %mailbox.display(), "file protocol initialized");
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        let bytes = self.codec.encode(envelope)?;

        if envelope.is_broadcast() {
            for recipient in self.broadcast_targets().await? {
                self.write_into(&recipient, &bytes).await?;
            }
            Ok(())
        } else {
            validate_address(&envelope.recipient)?;
            self.write_into(&envelope.recipient, &bytes).await
        }
    }

    async fn start_listening(&self, sink: InboundSink) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }

        let mailbox = Mailbox {
            inbox: self.inbox_dir(&self.config.address),
            error: self.error_dir(&self.config.address),
            io_timeout: self.config.io_timeout(),
        };
        let codec = self.codec.clone();
        let poll_interval = self.config.poll_interval();

        self.listener
            .start("file-listener", move |signal| async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = signal.stopped() => break,
                        _ = ticker.tick() => {}
                    }

                    match mailbox.drain(&codec, &sink, &signal).await {
                        Ok(0) => {}
                        Ok(count) => tracing::debug!(count, "mailbox drained"),
                        Err(Error::ListenerClosed) => {
                            tracing::warn!("file listener lost its sink, stopping");
                            break;
                        }
                        Err(e) => tracing::warn!(error = %e, "mailbox poll failed"),
                    }
                }
            })
            .await
    }

    async fn stop_listening(&self) -> Result<()> {
        if self.listener.stop().await {
            tracing::debug!(address = %self.config.address, "file listener stopped");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            return false;
        }

        let base = &self.config.base_dir;
        let probe = base.join(format!(".health-{}", next_file_id()));
        let check = async {
            if !fs::metadata(base).await?.is_dir() {
                return Ok(false);
            }
            fs::write(&probe, b"").await?;
            fs::remove_file(&probe).await?;
            Ok::<bool, std::io::Error>(true)
        };

        matches!(timeout(self.config.io_timeout(), check).await, Ok(Ok(true)))
    }
}

/// Listener-side view of our own mailbox
struct Mailbox {
    inbox: PathBuf,
    error: PathBuf,
    io_timeout: Duration,
}

impl Mailbox {
    /// Deliver every pending file in name order, returning how many went out
    async fn drain<C: Codec>(&self, codec: &C, sink: &InboundSink, signal: &StopSignal) -> Result<usize> {
        let pending = timeout(self.io_timeout, pending_files(&self.inbox))
            .await
            .map_err(|_| Error::Timeout("Mailbox scan"))??;

        let mut delivered = 0;
        for path in pending {
            if signal.is_stopped() {
                break;
            }

            let bytes = match timeout(self.io_timeout, fs::read(&path)).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Ok(Err(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read mailbox file");
                    continue;
                }
                Err(_) => {
                    tracing::warn!(path = %path.display(), "mailbox file read timed out");
                    continue;
                }
            };

            match codec.decode::<Envelope>(&bytes) {
                Ok(envelope) => {
                    // Keep the file until the dispatcher has it.
                    sink.deliver(envelope).await?;
                    if let Err(e) = fs::remove_file(&path).await {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(path = %path.display(), error = %e, "cannot remove delivered file");
                        }
                    }
                    delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unparseable envelope, quarantining");
                    self.quarantine(&path).await;
                }
            }
        }

        Ok(delivered)
    }

    async fn quarantine(&self, path: &Path) {
        let Some(name) = path.file_name() else {
            return;
        };
        let target = self.error.join(name);

        let moved = async {
            fs::create_dir_all(&self.error).await?;
            fs::rename(path, &target).await
        };

        match timeout(self.io_timeout, moved).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(path = %path.display(), error = %e, "cannot quarantine mailbox file")
            }
            Err(_) => tracing::error!(path = %path.display(), "quarantine timed out"),
        }
    }
}

async fn pending_files(inbox: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(inbox).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(EXTENSION)
            && entry.file_type().await?.is_file()
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids_sort_in_creation_order() {
        let ids: Vec<String> = (0..100).map(|_| next_file_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn config_defaults() {
        let config = FileConfig::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.io_timeout(), Duration::from_millis(2000));
        assert_eq!(config.format, Format::Bincode);
    }
}
