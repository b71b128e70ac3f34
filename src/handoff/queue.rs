//! Directory-as-queue.
//!
//! Producers drop one JSON file per message into a shared directory; the
//! consumer scans for names matching `<prefix>-*.json`, parses them, and
//! deletes each file once it has been applied. Delivery is at-least-once:
//! a file is only removed by [`DirectoryQueue::ack`], so a crash between
//! apply and ack redelivers it, and consumers must treat messages
//! idempotently. Malformed files are reported and left in place.
//!
//! One consumer per directory is assumed. Two consumers scanning the same
//! directory can both read a file before either deletes it.

use crate::error::Result;
use crate::{rlog_debug, rlog_trace};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::sync::mpsc;

/// One file found by [`DirectoryQueue::scan`].
#[derive(Debug)]
pub enum Delivery<T> {
    Parsed { path: PathBuf, item: T },
    Malformed { path: PathBuf, error: String },
}

impl<T> Delivery<T> {
    pub fn path(&self) -> &Path {
        match self {
            Delivery::Parsed { path, .. } | Delivery::Malformed { path, .. } => path,
        }
    }
}

/// A shared directory used as a message queue of JSON files.
#[derive(Debug, Clone)]
pub struct DirectoryQueue<T> {
    dir: PathBuf,
    prefix: String,
    pattern: Regex,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DirectoryQueue<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Queue over `dir` accepting files named `<prefix>-<anything>.json`.
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let pattern = Regex::new(&format!(r"^{}-[A-Za-z0-9._-]+\.json$", regex::escape(prefix)))?;
        Ok(Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            pattern,
            _marker: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether a bare file name belongs to this queue.
    pub fn matches(&self, file_name: &str) -> bool {
        self.pattern.is_match(file_name)
    }

    /// Read every queued file, oldest first.
    ///
    /// A missing directory is an empty queue. Files that vanish between
    /// listing and reading (taken by someone else) are skipped.
    pub fn scan(&self) -> Result<Vec<Delivery<T>>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !self.matches(&name.to_string_lossy()) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((modified, entry.path()));
        }
        files.sort();

        let mut deliveries = Vec::with_capacity(files.len());
        for (_, path) in files {
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    deliveries.push(Delivery::Malformed {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            match serde_json::from_str::<T>(&content) {
                Ok(item) => deliveries.push(Delivery::Parsed { path, item }),
                Err(e) => deliveries.push(Delivery::Malformed {
                    path,
                    error: e.to_string(),
                }),
            }
        }
        rlog_trace!("{} scan found {} file(s)", self.dir.display(), deliveries.len());
        Ok(deliveries)
    }

    /// Remove a consumed file. Already-removed files are not an error.
    pub fn ack(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueue `item` under `<prefix>-<key>-<millis>-<nonce>.json`.
    ///
    /// The file is written under a hidden temporary name and renamed into
    /// place so a concurrent scan never sees a partial payload.
    pub fn push(&self, key: &str, item: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let name = format!(
            "{}-{}-{}-{}.json",
            self.prefix,
            encode_key(key),
            chrono::Utc::now().timestamp_millis(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let path = self.dir.join(&name);
        write_atomic(&path, &serde_json::to_vec_pretty(item)?)?;
        rlog_debug!("Enqueued {}", path.display());
        Ok(path)
    }

    /// Watch the directory and send a wake-up whenever a queue file appears.
    ///
    /// Wake-ups are coalesced: a full channel drops the signal since one
    /// pending wake-up already covers every file present. The returned
    /// watcher must be kept alive.
    pub fn watch(&self, wake: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
        fs::create_dir_all(&self.dir)?;
        let pattern = self.pattern.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else { return };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                let relevant = event.paths.iter().any(|p| {
                    p.file_name()
                        .map(|n| pattern.is_match(&n.to_string_lossy()))
                        .unwrap_or(false)
                });
                if relevant {
                    let _ = wake.try_send(());
                }
            },
            Config::default(),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

/// Encode an id as a file-name component.
///
/// `[A-Za-z0-9.-]` pass through. Every other byte, `_` itself and a leading
/// `.` included, becomes `_XX` in uppercase hex, so distinct ids always map
/// to distinct names.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, byte) in key.bytes().enumerate() {
        let plain = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if plain {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{:02X}", byte));
        }
    }
    out
}

/// Write via a hidden sibling file and rename into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
