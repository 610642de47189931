//! Write-ahead log for the transactional cache (spec §4.3, §4.5).
//!
//! Layout: an 11-byte magic `"TCDSLOG#1.0"`, then an 8-byte little-endian
//! base transaction id, then a stream of records:
//!
//! ```text
//! size:   u32 LE   (payload length in bytes)
//! offset: i64 LE   (byte offset in the volume this record covers)
//! crc:    u32 LE   (CRC-32C over the header with crc zeroed, then payload)
//! payload: [u8; size]
//! ```
//!
//! The log is replayed once at open, then truncated and a fresh base
//! transid written. It rotates (truncate + rewrite base) once its size
//! exceeds `slog_max_size`, coinciding with a checkpoint (spec §4.3).

use std::io::SeekFrom;

use camino::Utf8Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{CloudFileError, Result};
use crate::types::TransId;

pub const MAGIC: &[u8; 11] = b"TCDSLOG#1.0";
const HEADER_LEN: usize = 11 + 8;
const RECORD_HEADER_LEN: usize = 4 + 8 + 4;

#[derive(Debug, Clone)]
pub struct SlogRecord {
    pub offset: i64,
    pub payload: Vec<u8>,
}

fn record_crc(size: u32, offset: i64, payload: &[u8]) -> u32 {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // crc field zeroed during computation
    buf.extend_from_slice(payload);
    crc32c::crc32c(&buf)
}

pub struct Slog {
    file: File,
    path: camino::Utf8PathBuf,
    base_transid: TransId,
    size: u64,
}

impl Slog {
    /// Opens (creating if absent) the slog at `path`. If the file is new
    /// or empty, writes a fresh header with `initial_base`. Otherwise
    /// replays every well-formed record (stopping at the first CRC
    /// mismatch or truncated tail, which simply marks the end of valid
    /// data after a crash) and returns them alongside the open log.
    pub async fn open(path: &Utf8Path, initial_base: TransId) -> Result<(Self, Vec<SlogRecord>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .await
            .map_err(CloudFileError::CacheIo)?;

        let len = file.metadata().await.map_err(CloudFileError::CacheIo)?.len();
        if len < HEADER_LEN as u64 {
            Self::write_header(&mut file, initial_base).await?;
            return Ok((
                Self {
                    file,
                    path: path.to_owned(),
                    base_transid: initial_base,
                    size: HEADER_LEN as u64,
                },
                Vec::new(),
            ));
        }

        let mut header = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0)).await.map_err(CloudFileError::CacheIo)?;
        file.read_exact(&mut header).await.map_err(CloudFileError::CacheIo)?;
        if &header[0..11] != MAGIC {
            return Err(CloudFileError::Integrity("slog magic mismatch".into()));
        }
        let base_transid = TransId(u64::from_le_bytes(header[11..19].try_into().unwrap()));

        let mut records = Vec::new();
        let mut pos = HEADER_LEN as u64;
        loop {
            let mut rec_header = [0u8; RECORD_HEADER_LEN];
            if file.seek(SeekFrom::Start(pos)).await.is_err() {
                break;
            }
            if file.read_exact(&mut rec_header).await.is_err() {
                break;
            }
            let size = u32::from_le_bytes(rec_header[0..4].try_into().unwrap());
            let offset = i64::from_le_bytes(rec_header[4..12].try_into().unwrap());
            let crc = u32::from_le_bytes(rec_header[12..16].try_into().unwrap());

            let mut payload = vec![0u8; size as usize];
            if file.read_exact(&mut payload).await.is_err() {
                break;
            }
            if record_crc(size, offset, &payload) != crc {
                tracing::warn!(pos, "slog record CRC mismatch, stopping replay");
                break;
            }
            records.push(SlogRecord { offset, payload });
            pos += RECORD_HEADER_LEN as u64 + size as u64;
        }

        Ok((
            Self {
                file,
                path: path.to_owned(),
                base_transid,
                size: pos,
            },
            records,
        ))
    }

    async fn write_header(file: &mut File, base: TransId) -> Result<()> {
        file.seek(SeekFrom::Start(0)).await.map_err(CloudFileError::CacheIo)?;
        file.write_all(MAGIC).await.map_err(CloudFileError::CacheIo)?;
        file.write_all(&base.0.to_le_bytes()).await.map_err(CloudFileError::CacheIo)?;
        file.flush().await.map_err(CloudFileError::CacheIo)?;
        file.sync_all().await.map_err(CloudFileError::CacheIo)?;
        Ok(())
    }

    pub fn base_transid(&self) -> TransId {
        self.base_transid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Appends one record and fsyncs before returning, so a crash after
    /// this call never loses the write it protects.
    pub async fn append(&mut self, offset: i64, payload: &[u8]) -> Result<()> {
        let size = payload.len() as u32;
        let crc = record_crc(size, offset, payload);
        self.file
            .seek(SeekFrom::Start(self.size))
            .await
            .map_err(CloudFileError::CacheIo)?;
        self.file.write_all(&size.to_le_bytes()).await.map_err(CloudFileError::CacheIo)?;
        self.file.write_all(&offset.to_le_bytes()).await.map_err(CloudFileError::CacheIo)?;
        self.file.write_all(&crc.to_le_bytes()).await.map_err(CloudFileError::CacheIo)?;
        self.file.write_all(payload).await.map_err(CloudFileError::CacheIo)?;
        self.file.flush().await.map_err(CloudFileError::CacheIo)?;
        self.file.sync_all().await.map_err(CloudFileError::CacheIo)?;
        self.size += RECORD_HEADER_LEN as u64 + payload.len() as u64;
        Ok(())
    }

    pub fn needs_rotation(&self, max_size: u64) -> bool {
        self.size >= max_size
    }

    /// Truncates the log back to just the header and rewrites the base
    /// transid, called right after a checkpoint has made every record up
    /// to `new_base` durable elsewhere (spec §4.3 step 7).
    pub async fn rotate(&mut self, new_base: TransId) -> Result<()> {
        self.file.set_len(0).await.map_err(CloudFileError::CacheIo)?;
        Self::write_header(&mut self.file, new_base).await?;
        self.base_transid = new_base;
        self.size = HEADER_LEN as u64;
        Ok(())
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_log_starts_with_no_records() {
        let dir = camino_tempfile::tempdir().unwrap();
        let (slog, records) = Slog::open(&dir.path().join("slog"), TransId(1)).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(slog.base_transid(), TransId(1));
    }

    #[tokio::test]
    async fn append_then_reopen_replays_records() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("slog");
        {
            let (mut slog, _) = Slog::open(&path, TransId(1)).await.unwrap();
            slog.append(4096, b"hello").await.unwrap();
            slog.append(8192, b"world!").await.unwrap();
        }
        let (_, records) = Slog::open(&path, TransId(1)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 4096);
        assert_eq!(records[0].payload, b"hello");
        assert_eq!(records[1].payload, b"world!");
    }

    #[tokio::test]
    async fn truncated_tail_stops_replay_without_erroring() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("slog");
        {
            let (mut slog, _) = Slog::open(&path, TransId(1)).await.unwrap();
            slog.append(0, b"whole-record").await.unwrap();
        }
        // Corrupt: append a partial trailing record header, simulating a
        // crash mid-write.
        {
            let mut f = OpenOptions::new().append(true).open(&path).await.unwrap();
            f.write_all(&[1, 2, 3]).await.unwrap();
        }
        let (_, records) = Slog::open(&path, TransId(1)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"whole-record");
    }

    #[tokio::test]
    async fn rotate_resets_size_and_base() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("slog");
        let (mut slog, _) = Slog::open(&path, TransId(1)).await.unwrap();
        slog.append(0, b"x").await.unwrap();
        slog.rotate(TransId(2)).await.unwrap();
        assert_eq!(slog.base_transid(), TransId(2));
        assert_eq!(slog.size(), (MAGIC.len() + 8) as u64);
    }
}
