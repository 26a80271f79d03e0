//! File-based storage backend for persistent storage.

use crate::backend::{apply_ops, KvBackend, Table, Tables, WriteBatch};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Size of the SHA-256 digest stored in every record header.
const DIGEST_SIZE: usize = 32;
/// Record header: body length (u32 LE) followed by the body digest.
const HEADER_SIZE: usize = 4 + DIGEST_SIZE;

/// A file-based key/value backend.
///
/// Every committed [`WriteBatch`] is appended to a single log file as one
/// record:
///
/// ```text
/// [len: u32 LE][sha256(body): 32 bytes][body: CBOR-encoded batch]
/// ```
///
/// The full table image is kept in memory and rebuilt by replaying the
/// log on open.
///
/// # Durability
///
/// - `commit()` calls `File::sync_data()` before the batch becomes visible
/// - A torn or corrupt record at the tail of the log is treated as an
///   uncommitted batch and truncated away on open
/// - A sibling `<log>.lock` file is held exclusively while the backend is
///   open, so two processes never append to the same log
///
/// # Example
///
/// ```no_run
/// use ledgersync_storage::{FileBackend, KvBackend, Table, WriteBatch};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("ledger.log")).unwrap();
/// let mut batch = WriteBatch::new();
/// batch.put(Table::Meta, "cursor", b"7".to_vec());
/// backend.commit(batch).unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    log: Mutex<LogFile>,
    tables: RwLock<Tables>,
    _lock_file: File,
}

#[derive(Debug)]
struct LogFile {
    file: File,
    size: u64,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// If the file exists its records are replayed. A trailing partial or
    /// corrupt record is discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the log,
    /// an I/O error if the file cannot be opened, or an error if a record
    /// with a valid checksum cannot be decoded.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let lock_path = lock_path(path);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (tables, valid_len, records) = replay(&bytes)?;
        if valid_len < bytes.len() as u64 {
            tracing::warn!(
                path = %path.display(),
                discarded = bytes.len() as u64 - valid_len,
                "discarding torn tail of commit log"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        tracing::debug!(path = %path.display(), records, "opened commit log");

        Ok(Self {
            path: path.to_path_buf(),
            log: Mutex::new(LogFile {
                file,
                size: valid_len,
            }),
            tables: RwLock::new(tables),
            _lock_file: lock_file,
        })
    }

    /// Opens or creates a file backend, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current size of the log in bytes.
    pub fn log_size(&self) -> u64 {
        self.log.lock().size
    }

    /// Rewrites the log as a single snapshot record.
    ///
    /// The snapshot is written to a sibling file and atomically renamed over
    /// the log, so a crash mid-compaction leaves the old log intact.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written or renamed.
    pub fn compact(&self) -> StorageResult<()> {
        let mut log = self.log.lock();
        let tables = self.tables.read();

        let mut snapshot = WriteBatch::new();
        for (table, rows) in tables.iter() {
            for (key, value) in rows {
                snapshot.put(*table, key.clone(), value.clone());
            }
        }

        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let record = if snapshot.is_empty() {
            Vec::new()
        } else {
            encode_record(&snapshot)?
        };
        tmp.write_all(&record)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        tracing::info!(
            path = %self.path.display(),
            before = log.size,
            after = record.len(),
            "compacted commit log"
        );
        log.file = file;
        log.size = record.len() as u64;
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn get(&self, table: Table, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn scan(&self, table: Table) -> StorageResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let record = encode_record(&batch)?;
        let mut log = self.log.lock();
        let start = log.size;

        if let Err(err) = write_at(&mut log.file, start, &record) {
            // Best effort: drop whatever part of the record reached the file.
            // If this fails too, replay will discard the torn tail on open.
            let _ = log.file.set_len(start);
            return Err(err.into());
        }

        log.size = start + record.len() as u64;
        apply_ops(&mut self.tables.write(), batch.ops());
        Ok(())
    }
}

fn write_at(file: &mut File, offset: u64, record: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(record)?;
    file.sync_data()
}

/// Encodes a batch as one framed log record.
/// Path of the lock file guarding `path`.
fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn encode_record(batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(batch, &mut body).map_err(StorageError::codec)?;

    let len = u32::try_from(body.len())
        .map_err(|_| StorageError::WriteRejected(format!("batch of {} bytes", body.len())))?;
    let digest = Sha256::digest(&body);

    let mut record = Vec::with_capacity(HEADER_SIZE + body.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&digest);
    record.extend_from_slice(&body);
    Ok(record)
}

/// Replays log bytes into a table image.
///
/// Returns the tables, the length of the valid prefix, and the number of
/// records replayed.
fn replay(bytes: &[u8]) -> StorageResult<(Tables, u64, usize)> {
    let mut tables = Tables::new();
    let mut offset = 0usize;
    let mut records = 0usize;

    while bytes.len() - offset >= HEADER_SIZE {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        let body_start = offset + HEADER_SIZE;
        let Some(body_end) = body_start.checked_add(len) else {
            break;
        };
        if body_end > bytes.len() {
            break;
        }

        let body = &bytes[body_start..body_end];
        if Sha256::digest(body).as_slice() != &bytes[offset + 4..body_start] {
            break;
        }

        let batch: WriteBatch = ciborium::from_reader(body)
            .map_err(|e| StorageError::Corrupted(format!("record at offset {offset}: {e}")))?;
        apply_ops(&mut tables, batch.ops());

        offset = body_end;
        records += 1;
    }

    Ok((tables, offset as u64, records))
}
