//! The on-disk message store.
//!
//! One flat spool directory holds committed messages as
//! `<id>.envelope` / `<id>.content` pairs. A message exists for a
//! scanner iff both files exist and the envelope carries its end
//! sentinel; everything else is a partial write, cleaned up at
//! startup. Commit is rename-based so that a crash between any two
//! file operations leaves the store consistent.
//
// Assumptions, in the spirit of the platform contract:
//  - renaming a file within the spool directory is atomic
//  - once a flush+sync has returned, the data is not changed by
//    anything other than another mailrelay-aware process

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use futures::AsyncWriteExt;
use smol::unblock;
use tracing::{debug, warn};
use walkdir::WalkDir;

mod envelope;

pub use envelope::Envelope;

const ENVELOPE_SUFFIX: &str = ".envelope";
const CONTENT_SUFFIX: &str = ".content";
const BAD_SUFFIX: &str = ".envelope.bad";
const NEW_SUFFIX: &str = ".new";
const SENTINEL: &str = "End: 1";

/// Short printable token unique within one spool directory:
/// start-time seconds, process id fragment, monotonic counter.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(Arc<String>);

impl MessageId {
    pub fn new<S: ToString>(s: S) -> MessageId {
        MessageId(Arc::new(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("spool i/o on ‘{0}’")]
    Io(String, #[source] io::Error),

    #[error("envelope line not understood: ‘{0}’")]
    BadEnvelope(String),

    #[error("envelope has no end sentinel")]
    PartialEnvelope,

    #[error("no such message ‘{0}’")]
    Missing(MessageId),
}

fn io_err(path: &Path, e: io::Error) -> SpoolError {
    SpoolError::Io(path.display().to_string(), e)
}

/// Receiving half of the rescan notification: each message is the
/// reason string of one rescan request.
pub type RescanEvents = smol::channel::Receiver<String>;

struct StoreImpl {
    dir: PathBuf,
    pid: u32,
    start: u64,
    counter: AtomicU64,
    rescan_tx: smol::channel::Sender<String>,
    rescan_rx: smol::channel::Receiver<String>,
}

/// Handle to one spool directory. Cheap to clone.
pub struct Store {
    s: Arc<StoreImpl>,
}

impl Clone for Store {
    fn clone(&self) -> Store {
        Store { s: self.s.clone() }
    }
}

impl Store {
    /// Opens a spool directory and runs startup recovery: `.new`
    /// leftovers, sentinel-less envelopes and orphaned halves are
    /// removed.
    pub async fn open(dir: PathBuf) -> Result<Store, SpoolError> {
        let dir2 = dir.clone();
        unblock(move || recover(&dir2)).await?;
        let (rescan_tx, rescan_rx) = smol::channel::unbounded();
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(Store {
            s: Arc::new(StoreImpl {
                dir,
                pid: std::process::id(),
                start,
                counter: AtomicU64::new(1),
                rescan_tx,
                rescan_rx,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.s.dir
    }

    pub fn envelope_path(&self, id: &MessageId) -> PathBuf {
        self.s.dir.join(format!("{}{}", id, ENVELOPE_SUFFIX))
    }

    pub fn content_path(&self, id: &MessageId) -> PathBuf {
        self.s.dir.join(format!("{}{}", id, CONTENT_SUFFIX))
    }

    fn bad_path(&self, id: &MessageId) -> PathBuf {
        self.s.dir.join(format!("{}{}", id, BAD_SUFFIX))
    }

    fn next_id(&self) -> MessageId {
        let n = self.s.counter.fetch_add(1, Ordering::Relaxed);
        MessageId::new(format!("{}.{}.{}", self.s.start, self.s.pid, n))
    }

    /// Starts a new message. The content temporary is created
    /// exclusively, so an id collision (eg. a counter reuse after
    /// restart within one second) just moves on to the next id.
    pub async fn new_message(&self, envelope: Envelope) -> Result<MessageWriter, SpoolError> {
        loop {
            let id = self.next_id();
            let path = self.content_new_path(&id);
            match smol::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(content) => {
                    debug!(id = %id, "new spool entry");
                    return Ok(MessageWriter {
                        store: self.clone(),
                        id,
                        envelope,
                        content,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_err(&path, e)),
            }
        }
    }

    fn content_new_path(&self, id: &MessageId) -> PathBuf {
        self.s
            .dir
            .join(format!("{}{}{}", id, CONTENT_SUFFIX, NEW_SUFFIX))
    }

    fn envelope_new_path(&self, id: &MessageId) -> PathBuf {
        self.s
            .dir
            .join(format!("{}{}{}", id, ENVELOPE_SUFFIX, NEW_SUFFIX))
    }

    /// Committed messages, sorted by envelope mtime ascending. Files
    /// appearing or vanishing mid-enumeration are tolerated.
    pub async fn scan(&self) -> Result<Vec<MessageId>, SpoolError> {
        let dir = self.s.dir.clone();
        unblock(move || {
            let mut found: Vec<(SystemTime, MessageId)> = Vec::new();
            for entry in WalkDir::new(&dir).max_depth(1) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                let id = match strip_suffix_exact(&name, ENVELOPE_SUFFIX) {
                    Some(id) => MessageId::new(id),
                    None => continue,
                };
                if !has_sentinel(entry.path()) {
                    continue;
                }
                if !dir
                    .join(format!("{}{}", id, CONTENT_SUFFIX))
                    .exists()
                {
                    continue;
                }
                let mtime = entry
                    .path()
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(UNIX_EPOCH);
                found.push((mtime, id));
            }
            found.sort();
            Ok(found.into_iter().map(|(_, id)| id).collect())
        })
        .await
    }

    /// Messages whose envelope was renamed to `.envelope.bad`.
    pub async fn failures(&self) -> Result<Vec<MessageId>, SpoolError> {
        let dir = self.s.dir.clone();
        unblock(move || {
            let mut found = Vec::new();
            for entry in WalkDir::new(&dir).max_depth(1) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(id) = strip_suffix_exact(&name, BAD_SUFFIX) {
                    found.push(MessageId::new(id));
                }
            }
            found.sort();
            Ok(found)
        })
        .await
    }

    /// Renames every `.envelope.bad` back to `.envelope`.
    pub async fn unfail_all(&self) -> Result<usize, SpoolError> {
        let failures = self.failures().await?;
        let dir = self.s.dir.clone();
        let paths: Vec<(PathBuf, PathBuf)> = failures
            .iter()
            .map(|id| {
                (
                    dir.join(format!("{}{}", id, BAD_SUFFIX)),
                    dir.join(format!("{}{}", id, ENVELOPE_SUFFIX)),
                )
            })
            .collect();
        unblock(move || {
            let mut n = 0;
            for (bad, good) in paths {
                match std::fs::rename(&bad, &good) {
                    Ok(()) => n += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                    Err(e) => return Err(io_err(&bad, e)),
                }
            }
            Ok(n)
        })
        .await
    }

    pub async fn read_envelope(&self, id: &MessageId) -> Result<Envelope, SpoolError> {
        let path = self.envelope_path(id);
        let text = match smol::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SpoolError::Missing(id.clone()))
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        Envelope::parse(&text)
    }

    pub async fn open_content(&self, id: &MessageId) -> Result<smol::fs::File, SpoolError> {
        let path = self.content_path(id);
        match smol::fs::File::open(&path).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SpoolError::Missing(id.clone())),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    pub async fn content_size(&self, id: &MessageId) -> Result<u64, SpoolError> {
        let path = self.content_path(id);
        smol::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .map_err(|e| io_err(&path, e))
    }

    /// Rewrites the envelope of a committed message in place (used by
    /// the deliver/copy filters to drop handled recipients). The
    /// rewrite goes through a temporary and a rename.
    pub async fn rewrite_envelope(
        &self,
        id: &MessageId,
        envelope: &Envelope,
    ) -> Result<(), SpoolError> {
        let tmp = self.envelope_new_path(id);
        let path = self.envelope_path(id);
        smol::fs::write(&tmp, envelope.to_text())
            .await
            .map_err(|e| io_err(&tmp, e))?;
        smol::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    /// Replaces the content of a committed message (used by rewriting
    /// filters), going through a temporary and a rename.
    pub async fn replace_content(&self, id: &MessageId, bytes: &[u8]) -> Result<(), SpoolError> {
        let tmp = self.content_new_path(id);
        let path = self.content_path(id);
        smol::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        smol::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    /// Forward-success: removes the envelope, then the content.
    pub async fn delete(&self, id: &MessageId) -> Result<(), SpoolError> {
        let env = self.envelope_path(id);
        smol::fs::remove_file(&env).await.map_err(|e| io_err(&env, e))?;
        let content = self.content_path(id);
        match smol::fs::remove_file(&content).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&content, e)),
        }
    }

    /// Permanent forwarding failure: renames the envelope to
    /// `.envelope.bad` and records the reason.
    pub async fn fail(&self, id: &MessageId, reason: &str) -> Result<(), SpoolError> {
        let env = self.envelope_path(id);
        let bad = self.bad_path(id);
        smol::fs::rename(&env, &bad)
            .await
            .map_err(|e| io_err(&env, e))?;
        // Best effort: re-read, add the Reason line, rewrite
        if let Ok(text) = smol::fs::read_to_string(&bad).await {
            if let Ok(mut envelope) = Envelope::parse(&text) {
                envelope.reason = Some(reason.to_owned());
                let tmp = self.envelope_new_path(id);
                if smol::fs::write(&tmp, envelope.to_text()).await.is_ok() {
                    let _ = smol::fs::rename(&tmp, &bad).await;
                }
            }
        }
        Ok(())
    }

    /// Asks subscribers to rescan: an external agent may have created
    /// or uncovered spool entries.
    pub fn request_rescan(&self, reason: &str) {
        debug!(reason = reason, "rescan requested");
        // Unbounded channel: try_send only fails when closed
        let _ = self.s.rescan_tx.try_send(reason.to_owned());
    }

    pub fn rescan_events(&self) -> RescanEvents {
        self.s.rescan_rx.clone()
    }
}

/// In-progress message: content is streamed in, the envelope follows
/// at commit time.
pub struct MessageWriter {
    store: Store,
    id: MessageId,
    envelope: Envelope,
    content: smol::fs::File,
}

impl MessageWriter {
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    pub fn add_to(&mut self, address: &str, is_local: bool) {
        if is_local {
            self.envelope.to_local.push(address.to_owned());
        } else {
            self.envelope.to_remote.push(address.to_owned());
        }
    }

    /// Appends raw octets to the content file.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), SpoolError> {
        self.content
            .write_all(bytes)
            .await
            .map_err(|e| io_err(&self.store.content_new_path(&self.id), e))
    }

    /// Appends one line plus CRLF.
    pub async fn write_line(&mut self, line: &[u8]) -> Result<(), SpoolError> {
        self.write(line).await?;
        self.write(b"\r\n").await
    }

    /// Atomic commit: flush and rename the content, then write and
    /// rename the envelope. A scanner sees either nothing or a
    /// complete message.
    pub async fn commit(mut self, fsync: bool) -> Result<MessageId, SpoolError> {
        let content_new = self.store.content_new_path(&self.id);
        self.content
            .flush()
            .await
            .map_err(|e| io_err(&content_new, e))?;
        if fsync {
            self.content
                .sync_all()
                .await
                .map_err(|e| io_err(&content_new, e))?;
        }
        drop(self.content);
        let content = self.store.content_path(&self.id);
        smol::fs::rename(&content_new, &content)
            .await
            .map_err(|e| io_err(&content_new, e))?;

        let envelope_new = self.store.envelope_new_path(&self.id);
        {
            let mut f = smol::fs::File::create(&envelope_new)
                .await
                .map_err(|e| io_err(&envelope_new, e))?;
            f.write_all(self.envelope.to_text().as_bytes())
                .await
                .map_err(|e| io_err(&envelope_new, e))?;
            f.flush().await.map_err(|e| io_err(&envelope_new, e))?;
            if fsync {
                f.sync_all().await.map_err(|e| io_err(&envelope_new, e))?;
            }
        }
        let envelope = self.store.envelope_path(&self.id);
        smol::fs::rename(&envelope_new, &envelope)
            .await
            .map_err(|e| io_err(&envelope_new, e))?;
        debug!(id = %self.id, "committed");
        Ok(self.id)
    }

    /// Drops the temporaries.
    pub async fn cancel(self) {
        let _ = smol::fs::remove_file(self.store.content_new_path(&self.id)).await;
        let _ = smol::fs::remove_file(self.store.envelope_new_path(&self.id)).await;
    }
}

fn strip_suffix_exact<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let id = name.strip_suffix(suffix)?;
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn has_sentinel(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|text| text.lines().any(|l| l.trim_end() == SENTINEL))
        .unwrap_or(false)
}

fn recover(dir: &Path) -> Result<(), SpoolError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let exists = |name: &str| names.iter().any(|n| n == name);

    for name in &names {
        let path = dir.join(name);
        if name.ends_with(NEW_SUFFIX) {
            warn!(file = name.as_str(), "removing leftover temporary");
            let _ = std::fs::remove_file(&path);
        } else if let Some(id) = strip_suffix_exact(name, ENVELOPE_SUFFIX) {
            if !has_sentinel(&path) {
                warn!(file = name.as_str(), "removing partial envelope");
                let _ = std::fs::remove_file(&path);
            } else if !exists(&format!("{}{}", id, CONTENT_SUFFIX)) {
                warn!(file = name.as_str(), "removing envelope without content");
                let _ = std::fs::remove_file(&path);
            }
        } else if let Some(id) = strip_suffix_exact(name, CONTENT_SUFFIX) {
            let has_envelope = exists(&format!("{}{}", id, ENVELOPE_SUFFIX))
                && has_sentinel(&dir.join(format!("{}{}", id, ENVELOPE_SUFFIX)));
            let has_bad = exists(&format!("{}{}", id, BAD_SUFFIX));
            if !has_envelope && !has_bad {
                warn!(file = name.as_str(), "removing content without envelope");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smtp_proto::BodyKind;

    fn envelope() -> Envelope {
        Envelope {
            from: "u@a.example".to_owned(),
            from_is_local: true,
            client: "127.0.0.1:9999".to_owned(),
            ..Envelope::default()
        }
    }

    fn block_on<T>(f: impl std::future::Future<Output = T>) -> T {
        smol::block_on(f)
    }

    #[test]
    fn commit_then_scan() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        block_on(async {
            let store = Store::open(tmp.path().to_owned()).await.unwrap();
            let mut w = store.new_message(envelope()).await.unwrap();
            w.add_to("v@b.example", false);
            w.write_line(b"Subject: x").await.unwrap();
            w.write_line(b"").await.unwrap();
            w.write_line(b"hi").await.unwrap();
            let id = w.commit(true).await.unwrap();

            let ids = store.scan().await.unwrap();
            assert_eq!(ids, vec![id.clone()]);

            let env = store.read_envelope(&id).await.unwrap();
            assert_eq!(env.to_remote, vec!["v@b.example"]);
            assert_eq!(env.body, BodyKind::SevenBit);

            let content = std::fs::read(store.content_path(&id)).unwrap();
            assert_eq!(content, b"Subject: x\r\n\r\nhi\r\n");
        });
    }

    #[test]
    fn uncommitted_message_is_invisible() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        block_on(async {
            let store = Store::open(tmp.path().to_owned()).await.unwrap();
            let mut w = store.new_message(envelope()).await.unwrap();
            w.write(b"pending").await.unwrap();
            assert!(store.scan().await.unwrap().is_empty());
            w.cancel().await;
            assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        });
    }

    #[test]
    fn scan_orders_by_mtime() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        block_on(async {
            let store = Store::open(tmp.path().to_owned()).await.unwrap();
            let mut ids = Vec::new();
            for _ in 0..3 {
                let mut w = store.new_message(envelope()).await.unwrap();
                w.add_to("v@b.example", false);
                w.write_line(b"x").await.unwrap();
                ids.push(w.commit(false).await.unwrap());
            }
            assert_eq!(store.scan().await.unwrap(), ids);
        });
    }

    #[test]
    fn fail_and_unfail() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        block_on(async {
            let store = Store::open(tmp.path().to_owned()).await.unwrap();
            let mut w = store.new_message(envelope()).await.unwrap();
            w.add_to("v@b.example", false);
            w.write_line(b"x").await.unwrap();
            let id = w.commit(false).await.unwrap();

            store.fail(&id, "550 mailbox unavailable").await.unwrap();
            assert!(store.scan().await.unwrap().is_empty());
            assert_eq!(store.failures().await.unwrap(), vec![id.clone()]);

            let bad = std::fs::read_to_string(store.bad_path(&id)).unwrap();
            assert!(bad.contains("Reason: 550 mailbox unavailable"));

            assert_eq!(store.unfail_all().await.unwrap(), 1);
            assert_eq!(store.scan().await.unwrap(), vec![id]);
            assert!(store.failures().await.unwrap().is_empty());
        });
    }

    #[test]
    fn recovery_removes_leftovers() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        let dir = tmp.path();
        // A leftover temporary, a sentinel-less envelope with content,
        // and an orphaned content file
        std::fs::write(dir.join("1.1.1.content.new"), b"tmp").unwrap();
        std::fs::write(dir.join("2.2.2.envelope"), b"From-Local: u@a\n").unwrap();
        std::fs::write(dir.join("2.2.2.content"), b"body").unwrap();
        std::fs::write(dir.join("3.3.3.content"), b"orphan").unwrap();
        // And one good message
        std::fs::write(
            dir.join("4.4.4.envelope"),
            envelope().to_text(),
        )
        .unwrap();
        std::fs::write(dir.join("4.4.4.content"), b"ok").unwrap();

        block_on(async {
            let store = Store::open(dir.to_owned()).await.unwrap();
            let ids = store.scan().await.unwrap();
            assert_eq!(ids, vec![MessageId::new("4.4.4")]);
        });
        assert!(!dir.join("1.1.1.content.new").exists());
        assert!(!dir.join("2.2.2.envelope").exists());
        assert!(!dir.join("2.2.2.content").exists());
        assert!(!dir.join("3.3.3.content").exists());
    }

    #[test]
    fn rescan_signal_reaches_subscriber() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        block_on(async {
            let store = Store::open(tmp.path().to_owned()).await.unwrap();
            let events = store.rescan_events();
            store.request_rescan("filter");
            assert_eq!(events.recv().await.unwrap(), "filter");
        });
    }

    #[test]
    fn delete_removes_both_files() {
        let tmp = tempdir::TempDir::new("spool-test").unwrap();
        block_on(async {
            let store = Store::open(tmp.path().to_owned()).await.unwrap();
            let mut w = store.new_message(envelope()).await.unwrap();
            w.add_to("v@b.example", false);
            w.write_line(b"x").await.unwrap();
            let id = w.commit(false).await.unwrap();
            store.delete(&id).await.unwrap();
            assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        });
    }
}
