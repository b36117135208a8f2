use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher;
use eventpipe_common::{Event, EventBatch};
use eventpipe_config::BufferConfig;
use eventpipe_metrics::{
    BUFFER_BATCHES_GAUGE, BUFFER_BYTES_GAUGE, BUFFER_CORRUPT_FILES_TOTAL,
    BUFFER_EXPIRED_EVENTS_TOTAL, BUFFER_REJECTIONS_TOTAL,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const MAGIC: &str = "EVENTPIPE_BUFFER_V1";
const SEPARATOR: &str = "---";
const BATCH_EXTENSION: &str = "buf";
const TEMP_EXTENSION: &str = "tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";
const HOUR_DIR_FORMAT: &str = "%Y%m%d%H";

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Overflow buffer full: {needed} bytes needed, {used}/{max} bytes used")]
    Full { needed: u64, used: u64, max: u64 },

    #[error("Overflow buffer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize buffered batch: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Buffered batch {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Self-describing header written in front of every buffered batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferHeader {
    pub version: u8,
    pub batch_id: String,
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub buffered_at: DateTime<Utc>,
    pub event_count: usize,
    pub checksum: u32,
}

/// A batch file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub path: PathBuf,
    pub buffered_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BufferedBatch {
    pub header: BufferHeader,
    pub events: Vec<Event>,
}

impl BufferedBatch {
    pub fn into_batch(self) -> EventBatch {
        EventBatch {
            batch_id: self.header.batch_id,
            source: self.header.source,
            received_at: self.header.received_at,
            events: self.events,
        }
    }
}

/// Disk-backed queue of batches the broker would not take.
///
/// Layout: `<dir>/<YYYYMMDDHH>/<millis>_<seq>_<batch_id>.buf`. File names
/// sort in write order, so listing yields oldest first. Not thread safe on
/// its own; the publisher serializes access through one mutex.
pub struct OverflowBuffer {
    directory: PathBuf,
    max_size_bytes: u64,
    retention: Duration,
    used_bytes: u64,
    batch_count: usize,
    sequence: u64,
}

impl OverflowBuffer {
    /// Open the buffer directory, recovering usage from the files already on disk
    pub fn open(config: &BufferConfig) -> Result<Self, BufferError> {
        fs::create_dir_all(&config.directory)?;

        let mut buffer = Self {
            directory: config.directory.clone(),
            max_size_bytes: config.max_size_bytes(),
            retention: config.retention(),
            used_bytes: 0,
            batch_count: 0,
            sequence: 0,
        };

        let mut stale_temps = 0usize;
        for hour_dir in buffer.hour_dirs()? {
            for entry in fs::read_dir(&hour_dir)? {
                let path = entry?.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(BATCH_EXTENSION) => {
                        buffer.used_bytes += fs::metadata(&path)?.len();
                        buffer.batch_count += 1;
                    }
                    Some(TEMP_EXTENSION) => {
                        // interrupted write; the batch was never acknowledged as buffered
                        fs::remove_file(&path)?;
                        stale_temps += 1;
                    }
                    _ => {}
                }
            }
        }

        buffer.update_gauges();
        info!(
            "[BUFFER] Opened overflow buffer at {:?}: {} batches, {} bytes (limit {} bytes, {} stale temp files removed)",
            buffer.directory, buffer.batch_count, buffer.used_bytes, buffer.max_size_bytes, stale_temps
        );
        Ok(buffer)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn is_empty(&self) -> bool {
        self.batch_count == 0
    }

    pub fn is_at_capacity(&self) -> bool {
        self.used_bytes >= self.max_size_bytes
    }

    /// Persist a batch. Rejected with [`BufferError::Full`] if it would exceed the size bound.
    pub fn append(&mut self, batch: &EventBatch) -> Result<BufferEntry, BufferError> {
        let buffered_at = Utc::now();
        let content = encode(batch, buffered_at)?;
        let needed = content.len() as u64;

        if self.used_bytes + needed > self.max_size_bytes {
            BUFFER_REJECTIONS_TOTAL.inc();
            warn!(
                "[BUFFER] Rejecting batch {} ({} events, {} bytes): buffer at {}/{} bytes",
                batch.batch_id,
                batch.len(),
                needed,
                self.used_bytes,
                self.max_size_bytes
            );
            return Err(BufferError::Full {
                needed,
                used: self.used_bytes,
                max: self.max_size_bytes,
            });
        }

        let hour_dir = self
            .directory
            .join(buffered_at.format(HOUR_DIR_FORMAT).to_string());
        fs::create_dir_all(&hour_dir)?;

        self.sequence += 1;
        let file_name = format!(
            "{:013}_{:06}_{}.{}",
            buffered_at.timestamp_millis(),
            self.sequence % 1_000_000,
            sanitize(&batch.batch_id),
            BATCH_EXTENSION
        );
        let final_path = hour_dir.join(&file_name);
        let temp_path = final_path.with_extension(TEMP_EXTENSION);

        {
            let mut file = File::create(&temp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;
        sync_dir(&hour_dir);

        self.used_bytes += needed;
        self.batch_count += 1;
        self.update_gauges();

        debug!(
            "[BUFFER] Buffered batch {} ({} events) at {:?}",
            batch.batch_id,
            batch.len(),
            final_path
        );

        Ok(BufferEntry {
            path: final_path,
            buffered_at,
            size_bytes: needed,
        })
    }

    /// All buffered batches, oldest first
    pub fn list(&self) -> Result<Vec<BufferEntry>, BufferError> {
        let mut entries = Vec::new();
        for hour_dir in self.hour_dirs()? {
            for entry in fs::read_dir(&hour_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(BATCH_EXTENSION) {
                    continue;
                }
                let Some(buffered_at) = buffered_at_from_name(&path) else {
                    warn!("[BUFFER] Ignoring unrecognised file {:?}", path);
                    continue;
                };
                entries.push(BufferEntry {
                    size_bytes: entry.metadata()?.len(),
                    path,
                    buffered_at,
                });
            }
        }
        entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(entries)
    }

    /// Read and verify a batch. A file that fails verification is quarantined.
    pub fn read(&mut self, entry: &BufferEntry) -> Result<BufferedBatch, BufferError> {
        let contents = fs::read_to_string(&entry.path)?;
        match decode(&contents) {
            Ok(batch) => Ok(batch),
            Err(reason) => {
                self.quarantine(entry, &reason)?;
                Err(BufferError::Corrupt {
                    path: entry.path.clone(),
                    reason,
                })
            }
        }
    }

    /// Delete a batch once the broker has acknowledged all of its events
    pub fn remove(&mut self, entry: &BufferEntry) -> Result<(), BufferError> {
        fs::remove_file(&entry.path)?;
        self.forget(entry);
        if let Some(parent) = entry.path.parent() {
            remove_dir_if_empty(parent);
        }
        Ok(())
    }

    /// Drop batches older than the retention window.
    ///
    /// Every dropped event is logged and counted; returns the number of events lost.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> Result<usize, BufferError> {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(72));
        let cutoff = now - retention;

        let mut lost = 0usize;
        for entry in self.list()? {
            if entry.buffered_at >= cutoff {
                // sorted oldest first
                break;
            }

            let contents = fs::read_to_string(&entry.path)?;
            let header = match read_header(&contents) {
                Ok(header) => header,
                Err(reason) => {
                    self.quarantine(&entry, &reason)?;
                    continue;
                }
            };

            self.remove(&entry)?;
            lost += header.event_count;
            BUFFER_EXPIRED_EVENTS_TOTAL.inc_by(header.event_count as u64);
            error!(
                batch_id = %header.batch_id,
                events = header.event_count,
                buffered_at = %header.buffered_at,
                "[BUFFER] Dropping expired batch {} with {} events after retention of {:?}",
                header.batch_id,
                header.event_count,
                self.retention
            );
        }
        Ok(lost)
    }

    fn quarantine(&mut self, entry: &BufferEntry, reason: &str) -> Result<(), BufferError> {
        let mut quarantined = entry.path.clone().into_os_string();
        quarantined.push(CORRUPT_SUFFIX);
        fs::rename(&entry.path, &quarantined)?;
        self.forget(entry);
        BUFFER_CORRUPT_FILES_TOTAL.inc();
        error!(
            "[BUFFER] Quarantined corrupt batch file {:?}: {}",
            entry.path, reason
        );
        Ok(())
    }

    fn forget(&mut self, entry: &BufferEntry) {
        self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
        self.batch_count = self.batch_count.saturating_sub(1);
        self.update_gauges();
    }

    fn hour_dirs(&self) -> Result<Vec<PathBuf>, BufferError> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.directory)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    fn update_gauges(&self) {
        BUFFER_BYTES_GAUGE.set(self.used_bytes as i64);
        BUFFER_BATCHES_GAUGE.set(self.batch_count as i64);
    }
}

fn encode(batch: &EventBatch, buffered_at: DateTime<Utc>) -> Result<Vec<u8>, BufferError> {
    let header = BufferHeader {
        version: 1,
        batch_id: batch.batch_id.clone(),
        source: batch.source.clone(),
        received_at: batch.received_at,
        buffered_at,
        event_count: batch.events.len(),
        checksum: 0,
    };

    let mut hasher = Hasher::new();
    hasher.update(serde_json::to_string(&header)?.as_bytes());

    let mut lines = Vec::with_capacity(batch.events.len());
    for event in &batch.events {
        let line = serde_json::to_string(event)?;
        hasher.update(line.as_bytes());
        lines.push(line);
    }

    let header = BufferHeader {
        checksum: hasher.finalize(),
        ..header
    };

    let mut out = Vec::new();
    writeln!(out, "{}", MAGIC)?;
    writeln!(out, "{}", serde_json::to_string(&header)?)?;
    writeln!(out, "{}", SEPARATOR)?;
    for line in lines {
        writeln!(out, "{}", line)?;
    }
    Ok(out)
}

fn read_header(contents: &str) -> Result<BufferHeader, String> {
    let mut lines = contents.lines();
    if lines.next() != Some(MAGIC) {
        return Err("missing magic line".to_string());
    }
    let header_line = lines.next().ok_or("missing header")?;
    serde_json::from_str(header_line).map_err(|e| format!("bad header: {}", e))
}

fn decode(contents: &str) -> Result<BufferedBatch, String> {
    let header = read_header(contents)?;
    let mut lines = contents.lines().skip(2);
    if lines.next() != Some(SEPARATOR) {
        return Err("missing separator".to_string());
    }

    let mut hasher = Hasher::new();
    let unsigned = BufferHeader {
        checksum: 0,
        ..header.clone()
    };
    hasher.update(
        serde_json::to_string(&unsigned)
            .map_err(|e| e.to_string())?
            .as_bytes(),
    );

    let mut events = Vec::with_capacity(header.event_count);
    for (i, line) in lines.filter(|l| !l.is_empty()).enumerate() {
        hasher.update(line.as_bytes());
        let event: Event =
            serde_json::from_str(line).map_err(|e| format!("bad event at line {}: {}", i + 4, e))?;
        events.push(event);
    }

    let checksum = hasher.finalize();
    if checksum != header.checksum {
        return Err(format!(
            "checksum mismatch: expected {}, calculated {}",
            header.checksum, checksum
        ));
    }
    if events.len() != header.event_count {
        return Err(format!(
            "event count mismatch: header says {}, found {}",
            header.event_count,
            events.len()
        ));
    }

    Ok(BufferedBatch { header, events })
}

fn buffered_at_from_name(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let millis: i64 = name.split('_').next()?.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

fn sanitize(batch_id: &str) -> String {
    let cleaned: String = batch_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "batch".to_string()
    } else {
        cleaned
    }
}

fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            debug!("[BUFFER] Directory fsync not supported for {:?}: {}", dir, e);
        }
    }
}

fn remove_dir_if_empty(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir) {
        if entries.next().is_none() {
            let _ = fs::remove_dir(dir);
        }
    }
}
