//! Append-only, length-prefixed, checksummed JSON record log.
//!
//! Framing is `MAGIC LENGTH CHECKSUM\n` followed by `LENGTH` bytes of UTF-8
//! JSON payload, where `CHECKSUM` is the lower-case hex CRC-32 of the
//! payload. Grounded in `ovsdb_file_open_log`/the record-at-a-time reader in
//! `ovsdb/file.c`, adapted from length-prefixed bincode framing to an ASCII
//! header line in `engines/granite/wal.rs`'s `write_records_no_sync`.
//!
//! Unlike the WAL this is modeled after, there is no background worker
//! thread or channel: every call here runs synchronously on the caller's
//! thread, per the single-writer, single-threaded cooperative model.

use std::fs::{self, File as StdFile, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use serde_json::Value as Json;

use crate::error::{DbError, Result};

pub const MAGIC_DB: &str = "STRATADB";
pub const MAGIC_LOG: &str = "STRATARAFT";

/// How a log's file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    CreateExcl,
}

/// Advisory locking policy for a log's underlying file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locking {
    /// Always attempt to take the lock; fail to open if it cannot be taken.
    ForceLock,
    /// Never attempt to take the lock.
    ForbidLock,
    /// Take the lock only when the log is opened for writing.
    LockIfWritable,
}

/// One framed record header, parsed off the wire.
struct Header {
    magic: String,
    length: usize,
    checksum: String,
}

/// An append-only, length-prefixed, checksummed record stream.
pub struct Log {
    file: StdFile,
    path: PathBuf,
    write_magic: &'static str,
    accepted_magics: Vec<&'static str>,
    lock: Option<fslock::LockFile>,
    last_record: Option<Json>,
    last_magic: Option<&'static str>,
    pushback: bool,
}

impl Log {
    pub fn open(
        path: impl AsRef<Path>,
        write_magic: &'static str,
        accepted_magics: &[&'static str],
        mode: OpenMode,
        locking: Locking,
    ) -> Result<Log> {
        let path = path.as_ref().to_path_buf();
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(&path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(&path)?,
            OpenMode::CreateExcl => OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)?,
        };

        let wants_lock = match locking {
            Locking::ForceLock => true,
            Locking::ForbidLock => false,
            Locking::LockIfWritable => mode != OpenMode::ReadOnly,
        };
        let lock = if wants_lock {
            let lock_path = lock_path_for(&path);
            let mut lock_file = fslock::LockFile::open(&lock_path).map_err(|e| {
                DbError::state(format!("cannot open lock file {}: {}", lock_path.display(), e))
            })?;
            let acquired = lock_file.try_lock().map_err(|e| {
                DbError::state(format!("cannot lock {}: {}", lock_path.display(), e))
            })?;
            if !acquired {
                return Err(DbError::state(format!(
                    "{} is locked by another process",
                    path.display()
                )));
            }
            Some(lock_file)
        } else {
            None
        };

        Ok(Log {
            file,
            path,
            write_magic,
            accepted_magics: accepted_magics.to_vec(),
            lock,
            last_record: None,
            last_magic: None,
            pushback: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The magic token the most recently read record was framed under, if
    /// any record has been read yet.
    pub fn last_magic(&self) -> Option<&'static str> {
        self.last_magic
    }

    /// Returns the next record, `None` at a clean end-of-stream (including a
    /// tolerated truncated trailing record), or a framing/syntax error for
    /// a corrupt record that was fully present on disk.
    pub fn read(&mut self) -> Result<Option<Json>> {
        if self.pushback {
            self.pushback = false;
            return Ok(self.last_record.clone());
        }

        let start = self.file.stream_position()?;

        let header = match self.read_header()? {
            Some(h) => h,
            None => {
                self.file.seek(SeekFrom::Start(start))?;
                return Ok(None);
            }
        };

        let Some(&matched_magic) = self.accepted_magics.iter().find(|m| **m == header.magic) else {
            return Err(DbError::framing(format!(
                "unrecognized magic '{}' in {}",
                header.magic,
                self.path.display()
            )));
        };

        let mut payload = vec![0u8; header.length];
        if let Err(e) = self.file.read_exact(&mut payload) {
            if e.kind() == ErrorKind::UnexpectedEof {
                log::warn!(
                    "{}: truncated record at offset {}, treating as end of log",
                    self.path.display(),
                    start
                );
                self.file.seek(SeekFrom::Start(start))?;
                return Ok(None);
            }
            return Err(e.into());
        }

        let actual = format!("{:08x}", crc32fast::hash(&payload));
        if actual != header.checksum {
            return Err(DbError::framing(format!(
                "checksum mismatch in {} at offset {} (expected {}, got {})",
                self.path.display(),
                start,
                header.checksum,
                actual
            )));
        }

        let text = String::from_utf8(payload)?;
        let value: Json = serde_json::from_str(&text)?;

        self.last_record = Some(value.clone());
        self.last_magic = Some(matched_magic);
        Ok(Some(value))
    }

    /// Read one header line, byte by byte so no buffering hides the file
    /// cursor from `offset()`/`replace_start()`. Returns `None` if the
    /// stream ended before a full header line was available.
    fn read_header(&mut self) -> Result<Option<Header>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.file.read(&mut byte) {
                // A clean EOF with nothing read yet, or a partial header
                // line, are both end-of-stream: the latter is a tolerated
                // tail truncation.
                Ok(0) => return Ok(None),
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(e) => return Err(e.into()),
            }
        }
        let text = String::from_utf8(line).map_err(|_| DbError::framing("non-UTF-8 record header"))?;
        let mut parts = text.splitn(3, ' ');
        let (magic, length, checksum) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(l), Some(c)) => (m, l, c),
            _ => return Err(DbError::framing(format!("malformed record header '{}'", text))),
        };
        let length: usize = length
            .parse()
            .map_err(|_| DbError::framing(format!("malformed record length '{}'", length)))?;
        Ok(Some(Header {
            magic: magic.to_string(),
            length,
            checksum: checksum.to_string(),
        }))
    }

    /// Push the most recently read record back so the next `read()` returns
    /// it again. Exactly one level of pushback is supported.
    pub fn unread(&mut self) -> Result<()> {
        if self.last_record.is_none() {
            return Err(DbError::state("no record to unread"));
        }
        self.pushback = true;
        Ok(())
    }

    /// Buffer and write one record. Returns only on I/O failure.
    pub fn append(&mut self, json: &Json) -> Result<()> {
        let payload = serde_json::to_vec(json)?;
        let checksum = format!("{:08x}", crc32fast::hash(&payload));
        let mut buf = BytesMut::with_capacity(payload.len() + 64);
        buf.extend_from_slice(
            format!("{} {} {}\n", self.write_magic, payload.len(), checksum).as_bytes(),
        );
        buf.extend_from_slice(&payload);
        self.file.write_all(&buf)?;
        Ok(())
    }

    /// Durable barrier: after this returns, every appended record so far
    /// survives power loss.
    pub fn commit(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn offset(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    /// Open a sibling temporary log at `path.tmp` for compaction. The
    /// receiver remains usable for reads.
    pub fn replace_start(&self) -> Result<Log> {
        let tmp_path = tmp_path_for(&self.path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(Log {
            file,
            path: tmp_path,
            write_magic: self.write_magic,
            accepted_magics: self.accepted_magics.clone(),
            lock: None,
            last_record: None,
            last_magic: None,
            pushback: false,
        })
    }

    /// Fsync `new`, atomically rename it over the receiver's path, then
    /// adopt its file handle. On any failure before the rename, the
    /// receiver's log is untouched; `new`'s temporary file is left for the
    /// caller to clean up.
    pub fn replace_commit(&mut self, mut new: Log) -> Result<()> {
        new.commit()?;
        fs::rename(&new.path, &self.path)?;
        if let Some(dir) = self.path.parent() {
            StdFile::open(dir)?.sync_all()?;
        }
        self.file = new.file;
        Ok(())
    }

    pub fn close(self) {
        // Dropping releases the fd and, if held, the advisory lock.
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_rw(path: &Path) -> Log {
        Log::open(
            path,
            MAGIC_DB,
            &[MAGIC_DB],
            OpenMode::CreateExcl,
            Locking::ForceLock,
        )
        .unwrap()
    }

    #[test]
    fn append_and_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let mut log = open_rw(&path);
        let rec = serde_json::json!({"hello": "world"});
        log.append(&rec).unwrap();
        log.commit().unwrap();
        log.file.seek(SeekFrom::Start(0)).unwrap();
        let read_back = log.read().unwrap().unwrap();
        assert_eq!(read_back, rec);
        assert!(log.read().unwrap().is_none());
    }

    #[test]
    fn unread_replays_the_same_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let mut log = open_rw(&path);
        let rec = serde_json::json!({"x": 1});
        log.append(&rec).unwrap();
        log.commit().unwrap();
        log.file.seek(SeekFrom::Start(0)).unwrap();
        let first = log.read().unwrap().unwrap();
        log.unread().unwrap();
        let second = log.read().unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn truncated_trailing_record_is_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let mut log = open_rw(&path);
            log.append(&serde_json::json!({"x": 1})).unwrap();
            log.commit().unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 2).unwrap();
        drop(f);

        let mut log = Log::open(
            &path,
            MAGIC_DB,
            &[MAGIC_DB],
            OpenMode::ReadWrite,
            Locking::ForceLock,
        )
        .unwrap();
        assert!(log.read().unwrap().is_none());
    }

    #[test]
    fn bit_flip_in_payload_is_a_framing_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        {
            let mut log = open_rw(&path);
            log.append(&serde_json::json!({"x": 1})).unwrap();
            log.commit().unwrap();
        }
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let mut log = Log::open(
            &path,
            MAGIC_DB,
            &[MAGIC_DB],
            OpenMode::ReadWrite,
            Locking::ForceLock,
        )
        .unwrap();
        assert!(log.read().is_err());
    }
}
