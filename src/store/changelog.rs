//! Append-only change log
//!
//! Each committed change-set becomes one frame:
//! `[MAGIC:4][SEQUENCE:8][LEN:4][PAYLOAD:n][HASH:32][CRC32:4]`
//!
//! `HASH = blake3(previous HASH || SEQUENCE || PAYLOAD)`, so a frame
//! cannot be dropped or reordered without breaking every later hash.
//! The CRC covers sequence, length, payload and hash. On open the whole
//! log is replayed into memory; a torn trailing frame (crash during
//! append) is cut off, anything else that fails verification refuses to
//! open.
//!
//! A frame is written with a single `write_all` on the file. If the write
//! or the sync fails, the file is cut back to the last good frame before
//! the error is returned, so a rejected change-set never resurfaces.

use crate::common::{chain_hash, crc32, Error, Result, SyncPolicy, HASH_LEN};
use crate::store::{ChangeSet, ObjectStore, Value};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_MAGIC: [u8; 4] = [0x44, 0x43, 0x4C, 0x31]; // "DCL1"
const LOG_FILE: &str = "changes.log";

/// Upper bound on a frame payload
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

struct LogState {
    file: File,
    /// Length of the verified prefix of the file
    valid_len: u64,
    /// Set when a failed append could not be undone
    broken: bool,
    next_sequence: u64,
    last_hash: [u8; HASH_LEN],
    map: BTreeMap<String, Value>,
}

/// A decoded frame
struct Frame {
    sequence: u64,
    payload: Vec<u8>,
    hash: [u8; HASH_LEN],
}

enum ReadOutcome {
    Frame(Frame, u64),
    End,
    Torn,
}

/// Durable object store over an append-only log file
pub struct ChangeLogStore {
    path: PathBuf,
    sync_policy: SyncPolicy,
    state: Mutex<LogState>,
}

impl ChangeLogStore {
    /// Open or create the log inside `dir`, replaying existing frames
    pub fn open(dir: impl AsRef<Path>, sync_policy: SyncPolicy) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(LOG_FILE);

        let (map, next_sequence, last_hash, valid_len) = Self::replay(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Change log {} has a torn trailing frame, truncating to {} bytes",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        let file = OpenOptions::new().append(true).open(&path)?;

        tracing::debug!(
            "Opened change log {} ({} frames, {} keys)",
            path.display(),
            next_sequence,
            map.len()
        );

        Ok(Self {
            path,
            sync_policy,
            state: Mutex::new(LogState {
                file,
                valid_len,
                broken: false,
                next_sequence,
                last_hash,
                map,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Does a repository already exist in `dir`?
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        dir.as_ref().join(LOG_FILE).is_file()
    }

    /// Number of frames written so far
    pub fn sequence(&self) -> Result<u64> {
        Ok(self.lock()?.next_sequence)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LogState>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("change log lock poisoned".into()))
    }

    /// Rebuild the key space from the log.
    /// Returns (map, next sequence, last hash, length of the valid prefix).
    #[allow(clippy::type_complexity)]
    fn replay(path: &Path) -> Result<(BTreeMap<String, Value>, u64, [u8; HASH_LEN], u64)> {
        let mut map = BTreeMap::new();
        let mut last_hash = [0u8; HASH_LEN];
        let mut next_sequence = 0u64;
        let mut offset = 0u64;

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((map, next_sequence, last_hash, offset))
            }
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        loop {
            match Self::read_frame(&mut reader)? {
                ReadOutcome::End => break,
                ReadOutcome::Torn => break,
                ReadOutcome::Frame(frame, size) => {
                    if frame.sequence != next_sequence {
                        return Err(Error::ChangeLog(format!(
                            "frame sequence {} found where {} was expected",
                            frame.sequence, next_sequence
                        )));
                    }
                    let expected = chain_hash(&last_hash, frame.sequence, &frame.payload);
                    if expected != frame.hash {
                        return Err(Error::ChecksumMismatch {
                            expected: hex::encode(expected),
                            actual: hex::encode(frame.hash),
                        });
                    }
                    let change: ChangeSet = serde_json::from_slice(&frame.payload)?;
                    change.apply_to(&mut map);

                    last_hash = frame.hash;
                    next_sequence += 1;
                    offset += size;
                }
            }
        }

        Ok((map, next_sequence, last_hash, offset))
    }

    fn read_frame<R: Read>(reader: &mut R) -> Result<ReadOutcome> {
        let mut magic = [0u8; 4];
        match read_full(reader, &mut magic)? {
            0 => return Ok(ReadOutcome::End),
            4 => {}
            _ => return Ok(ReadOutcome::Torn),
        }
        if magic != LOG_MAGIC {
            return Err(Error::ChangeLog("invalid frame magic".into()));
        }

        let mut header = [0u8; 12];
        if read_full(reader, &mut header)? < header.len() {
            return Ok(ReadOutcome::Torn);
        }
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&header[..8]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&header[8..]);
        let sequence = u64::from_le_bytes(seq_bytes);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_PAYLOAD {
            return Err(Error::ChangeLog(format!(
                "frame {} declares {} payload bytes, limit is {}",
                sequence, len, MAX_FRAME_PAYLOAD
            )));
        }

        let mut payload = vec![0u8; len];
        if read_full(reader, &mut payload)? < len {
            return Ok(ReadOutcome::Torn);
        }
        let mut hash = [0u8; HASH_LEN];
        if read_full(reader, &mut hash)? < HASH_LEN {
            return Ok(ReadOutcome::Torn);
        }
        let mut crc_bytes = [0u8; 4];
        if read_full(reader, &mut crc_bytes)? < 4 {
            return Ok(ReadOutcome::Torn);
        }

        let mut checksum_data = Vec::with_capacity(12 + len + HASH_LEN);
        checksum_data.extend_from_slice(&header);
        checksum_data.extend_from_slice(&payload);
        checksum_data.extend_from_slice(&hash);
        if crc32(&checksum_data) != u32::from_le_bytes(crc_bytes) {
            return Err(Error::ChangeLog(format!(
                "checksum mismatch in frame {}",
                sequence
            )));
        }

        let size = (4 + 12 + len + HASH_LEN + 4) as u64;
        Ok(ReadOutcome::Frame(
            Frame {
                sequence,
                payload,
                hash,
            },
            size,
        ))
    }

    /// Encode one frame; returns its bytes and chain hash
    fn encode_frame(
        last_hash: &[u8; HASH_LEN],
        sequence: u64,
        payload: &[u8],
    ) -> (Vec<u8>, [u8; HASH_LEN]) {
        let hash = chain_hash(last_hash, sequence, payload);

        let mut frame = Vec::with_capacity(4 + 12 + payload.len() + HASH_LEN + 4);
        frame.extend_from_slice(&LOG_MAGIC);
        frame.extend_from_slice(&sequence.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&hash);
        // CRC covers everything after the magic
        let checksum = crc32(&frame[4..]);
        frame.extend_from_slice(&checksum.to_le_bytes());
        (frame, hash)
    }

    fn append(&self, state: &mut LogState, frame: &[u8]) -> Result<()> {
        state.file.write_all(frame)?;
        state.file.flush()?;
        if self.sync_policy == SyncPolicy::Always {
            state.file.sync_all()?;
        }
        Ok(())
    }

    /// Cut the file back to the last good frame and reopen the handle
    fn discard_tail(&self, state: &mut LogState) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(state.valid_len)?;
        file.sync_all()?;
        state.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Read until `buf` is full or EOF; returns bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

impl ObjectStore for ChangeLogStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock()?.map.get(key).cloned())
    }

    fn commit(&self, change: ChangeSet) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(&change)?;
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(Error::ChangeLog(format!(
                "change-set of {} bytes exceeds the frame limit",
                payload.len()
            )));
        }
        let mut state = self.lock()?;
        if state.broken {
            return Err(Error::ChangeLog(format!(
                "{} has an unrecoverable tail, reopen required",
                self.path.display()
            )));
        }

        let (frame, hash) = Self::encode_frame(&state.last_hash, state.next_sequence, &payload);
        if let Err(e) = self.append(&mut state, &frame) {
            tracing::error!(
                "Append of frame {} to {} failed, discarding it: {}",
                state.next_sequence,
                self.path.display(),
                e
            );
            if let Err(cleanup) = self.discard_tail(&mut state) {
                tracing::error!("Cannot truncate {}: {}", self.path.display(), cleanup);
                state.broken = true;
            }
            return Err(e);
        }

        // only visible once durable
        change.apply_to(&mut state.map);
        state.valid_len += frame.len() as u64;
        state.last_hash = hash;
        state.next_sequence += 1;
        Ok(())
    }
}
