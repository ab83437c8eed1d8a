//! File-backed message queues, one durable log per destination.
//!
//! Queue layout under the data directory:
//! - queues/<destination>.jsonl     : one envelope record per line, oldest first
//! - queues/<destination>.jsonl.tmp : remainder being written by a dequeue
//!
//! Dequeue never truncates the live log. The remainder is written to the temp
//! file, synced, and renamed over the log before anything is returned, so a
//! crash at any point leaves either the old log or the new one.

use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::{Error, Result};
use crate::protocol::Envelope;

/// Queue directory name.
pub const QUEUE_DIR: &str = "queues";

const LOG_SUFFIX: &str = ".jsonl";
const TMP_SUFFIX: &str = ".jsonl.tmp";

fn destination_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static pattern"))
}

/// Check that a destination name is usable as a log file name.
pub fn validate_destination(destination: &str) -> Result<()> {
    if destination_pattern().is_match(destination) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid destination name '{}'",
            destination
        )))
    }
}

/// State guarded by a destination's lock.
#[derive(Debug, Default)]
struct DestinationState {
    /// Highest `created_at` in the log, seeded from disk on first enqueue.
    last_created_at: i64,
    seeded: bool,
}

/// Durable FIFO queues keyed by destination.
#[derive(Debug)]
pub struct QueueStore {
    /// Directory holding the logs.
    base_path: PathBuf,
    /// One lock per destination; distinct destinations never contend.
    locks: Mutex<HashMap<String, Arc<Mutex<DestinationState>>>>,
}

impl QueueStore {
    /// Open (or create) the store under `data_dir`.
    ///
    /// Queue contents are read from disk on every operation, so a freshly
    /// opened store sees everything acknowledged before a restart.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let base_path = data_dir.as_ref().join(QUEUE_DIR);
        fs::create_dir_all(&base_path)?;

        let store = Self {
            base_path,
            locks: Mutex::new(HashMap::new()),
        };
        store.remove_stale_temp_files()?;

        tracing::debug!("Opened queue store at {}", store.base_path.display());
        Ok(store)
    }

    /// Directory holding the queue logs.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Append an envelope to the destination's log.
    ///
    /// Returns the stored envelope. `created_at` is raised if needed so it
    /// never goes backwards within a destination.
    pub fn enqueue(&self, destination: &str, mut envelope: Envelope) -> Result<Envelope> {
        validate_destination(destination)?;
        if envelope.destination != destination {
            return Err(Error::Validation(format!(
                "envelope {} is addressed to '{}', not '{}'",
                envelope.id, envelope.destination, destination
            )));
        }

        let slot = self.lock_for(destination);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if !state.seeded {
            if let Some(newest) = self.newest_created_at(destination)? {
                state.last_created_at = state.last_created_at.max(newest);
            }
            state.seeded = true;
        }
        envelope.created_at = envelope.created_at.max(state.last_created_at);

        let mut line = envelope.to_record()?;
        line.push('\n');

        let path = self.log_path(destination);
        let created = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::store_write(destination, e))?;

        let prev_len = file
            .metadata()
            .map_err(|e| Error::store_write(destination, e))?
            .len();

        // A torn write from an earlier crash may have left a line without its
        // newline; start on a fresh line so only that fragment is corrupt.
        if prev_len > 0 && !ends_with_newline(&mut file, prev_len) {
            line.insert(0, '\n');
        }

        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.sync_data()) {
            if let Err(rollback) = file.set_len(prev_len) {
                tracing::error!(
                    "Failed to roll back partial append to {}: {}",
                    path.display(),
                    rollback
                );
            }
            return Err(Error::store_write(destination, e));
        }
        if created {
            self.sync_dir();
        }

        state.last_created_at = envelope.created_at;
        tracing::debug!("Enqueued message {} to {}", envelope.id, destination);
        Ok(envelope)
    }

    /// Remove and return the oldest well-formed envelope.
    ///
    /// Corrupt records ahead of it are discarded. If the remainder cannot be
    /// persisted the envelope is not returned and the log is left unchanged.
    pub fn dequeue_one(&self, destination: &str) -> Result<Option<Envelope>> {
        validate_destination(destination)?;

        let slot = self.lock_for(destination);
        let _state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(content) = self.read_log(destination)? else {
            return Ok(None);
        };

        let lines = record_lines(&content);
        if lines.is_empty() {
            return Ok(None);
        }

        let mut taken = None;
        for (idx, line) in lines.iter().enumerate() {
            match parse_line(line) {
                Ok(envelope) => {
                    taken = Some((idx, envelope));
                    break;
                }
                Err(e) => self.log_discard(destination, &e),
            }
        }

        let remainder = match &taken {
            Some((idx, _)) => join_lines(&lines[idx + 1..]),
            None => Vec::new(),
        };
        self.persist(destination, &remainder)?;

        let envelope = taken.map(|(_, envelope)| envelope);
        if let Some(envelope) = &envelope {
            tracing::debug!("Dequeued message {} from {}", envelope.id, destination);
        }
        Ok(envelope)
    }

    /// Remove and return every well-formed envelope, oldest first.
    pub fn dequeue_all(&self, destination: &str) -> Result<Vec<Envelope>> {
        validate_destination(destination)?;

        let slot = self.lock_for(destination);
        let _state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(content) = self.read_log(destination)? else {
            return Ok(Vec::new());
        };

        let lines = record_lines(&content);
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let mut envelopes = Vec::with_capacity(lines.len());
        for line in &lines {
            match parse_line(line) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => self.log_discard(destination, &e),
            }
        }

        self.persist(destination, &[])?;

        tracing::debug!("Drained {} messages from {}", envelopes.len(), destination);
        Ok(envelopes)
    }

    /// Count well-formed records without removing anything.
    pub fn peek_length(&self, destination: &str) -> Result<usize> {
        validate_destination(destination)?;

        let slot = self.lock_for(destination);
        let _state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(content) = self.read_log(destination)? else {
            return Ok(0);
        };

        Ok(record_lines(&content)
            .iter()
            .filter(|line| parse_line(line).is_ok())
            .count())
    }

    /// Destinations that have a log on disk, sorted by name.
    pub fn destinations(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            if let Some(destination) = name.strip_suffix(LOG_SUFFIX) {
                if validate_destination(destination).is_ok() {
                    names.push(destination.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Queue length for every known destination.
    pub fn stats(&self) -> Result<QueueStats> {
        let mut lengths = BTreeMap::new();
        for destination in self.destinations()? {
            let len = self.peek_length(&destination)?;
            lengths.insert(destination, len);
        }

        let total = lengths.values().sum();
        Ok(QueueStats { lengths, total })
    }

    fn lock_for(&self, destination: &str) -> Arc<Mutex<DestinationState>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(destination.to_string()).or_default().clone()
    }

    fn log_path(&self, destination: &str) -> PathBuf {
        self.base_path.join(format!("{}{}", destination, LOG_SUFFIX))
    }

    fn temp_path(&self, destination: &str) -> PathBuf {
        self.base_path.join(format!("{}{}", destination, TMP_SUFFIX))
    }

    fn read_log(&self, destination: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.log_path(destination)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the log with `remainder`: write temp, sync, rename.
    fn persist(&self, destination: &str, remainder: &[u8]) -> Result<()> {
        let tmp = self.temp_path(destination);
        let path = self.log_path(destination);

        let result = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(remainder)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if let Err(e) = result {
            if tmp.is_file() {
                let _ = fs::remove_file(&tmp);
            }
            return Err(Error::store_write(destination, e));
        }

        self.sync_dir();
        Ok(())
    }

    /// Make new or renamed directory entries durable where the platform
    /// allows it.
    fn sync_dir(&self) {
        if let Ok(dir) = File::open(&self.base_path) {
            let _ = dir.sync_all();
        }
    }

    /// `created_at` of the last well-formed record in the log.
    fn newest_created_at(&self, destination: &str) -> Result<Option<i64>> {
        let Some(content) = self.read_log(destination)? else {
            return Ok(None);
        };

        Ok(record_lines(&content)
            .iter()
            .rev()
            .find_map(|line| parse_line(line).ok())
            .map(|envelope| envelope.created_at))
    }

    fn remove_stale_temp_files(&self) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(TMP_SUFFIX));

            if is_temp && path.is_file() {
                fs::remove_file(&path)?;
                tracing::info!("Removed stale temp file: {}", path.display());
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn log_discard(&self, destination: &str, error: &Error) {
        tracing::warn!("Discarding record in {} queue: {}", destination, error);
    }
}

fn parse_line(line: &[u8]) -> Result<Envelope> {
    let record = std::str::from_utf8(line)
        .map_err(|e| Error::CorruptRecord(format!("invalid UTF-8: {}", e)))?;
    Envelope::from_record(record)
}

/// Non-blank lines of a log.
fn record_lines(content: &[u8]) -> Vec<&[u8]> {
    content
        .split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .collect()
}

fn join_lines(lines: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    out
}

fn ends_with_newline(file: &mut File, len: u64) -> bool {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))
        .and_then(|_| file.read_exact(&mut last))
        .map(|_| last[0] == b'\n')
        .unwrap_or(true)
}

/// Queue statistics.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub lengths: BTreeMap<String, usize>,
    pub total: usize,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue Stats:")?;
        for (destination, len) in &self.lengths {
            writeln!(f, "  {:<12} {}", format!("{}:", destination), len)?;
        }
        write!(f, "  {:<12} {}", "Total:", self.total)
    }
}
