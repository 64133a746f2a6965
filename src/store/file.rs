use crate::identity::Identity;
use crate::store::{StoreBackend, StoreError, TxnId};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
#[cfg(test)]
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::Mmap;
use parking_lot::Mutex;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::*;

const RECORD_MAGIC: u32 = 0x5356_4E54;
const KIND_PUT: u8 = 1;
const KIND_TOMBSTONE: u8 = 2;

/// On-log framing of one record; followed by `category_len + name_len +
/// state_len` raw bytes. Little-endian fields, alignment 1, no padding.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RecordHeader {
    magic: U32,
    kind: u8,
    category_len: U16,
    name_len: U16,
    state_len: U32,
}

const HEADER_SIZE: usize = size_of::<RecordHeader>();

struct PendingRecord {
    kind: u8,
    key: Identity,
    state: Vec<u8>,
}

struct FileInner {
    // offset and length of the latest state bytes for each live key
    index: HashMap<Identity, (u64, u32)>,
    end: u64,
    pending: HashMap<TxnId, Vec<PendingRecord>>,
    next_txn: u64,
}

/// Append-only log store, one file per store.
///
/// `save` appends a put record, `erase` appends a tombstone; the in-memory
/// index always points at the latest state for each key and is rebuilt on
/// `open` by scanning the whole log. Writes are buffered per transaction and
/// reach the file (followed by fsync) only at commit. A single log file has
/// no lock cycles, so this backend never reports a deadlock.
pub struct FileStore {
    file: File,
    inner: Mutex<FileInner>,
    #[cfg(test)]
    injected_write_failures: AtomicU32,
}

impl FileStore {
    /// Creates a new, empty log file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(StoreError::Io)?;

        Ok(Self {
            file,
            inner: Mutex::new(FileInner {
                index: HashMap::new(),
                end: 0,
                pending: HashMap::new(),
                next_txn: 0,
            }),
            #[cfg(test)]
            injected_write_failures: AtomicU32::new(0),
        })
    }

    /// Opens an existing log file and rebuilds the key index from it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .truncate(false)
            .open(path)
            .map_err(StoreError::Io)?;

        let len = file.metadata()?.len();
        let mut index = HashMap::new();
        if len > 0 {
            // SAFETY: the map is dropped before any write to the file
            let map = unsafe { Mmap::map(&file) }.map_err(StoreError::Io)?;
            Self::rebuild_index(&map, &mut index)?;
        }

        Ok(Self {
            file,
            inner: Mutex::new(FileInner {
                index,
                end: len,
                pending: HashMap::new(),
                next_txn: 0,
            }),
            #[cfg(test)]
            injected_write_failures: AtomicU32::new(0),
        })
    }

    fn rebuild_index(
        log: &[u8],
        index: &mut HashMap<Identity, (u64, u32)>,
    ) -> Result<(), StoreError> {
        let mut offset = 0usize;
        while offset < log.len() {
            let header_bytes = log
                .get(offset..offset + HEADER_SIZE)
                .ok_or(StoreError::Corrupted)?;
            let header =
                RecordHeader::ref_from_bytes(header_bytes).map_err(|_| StoreError::Corrupted)?;
            if header.magic.get() != RECORD_MAGIC {
                return Err(StoreError::Corrupted);
            }

            let category_len = header.category_len.get() as usize;
            let name_len = header.name_len.get() as usize;
            let state_len = header.state_len.get() as usize;
            let body = offset + HEADER_SIZE;
            let state_off = body + category_len + name_len;
            let next = state_off + state_len;
            if next > log.len() {
                return Err(StoreError::Corrupted);
            }

            let category = str::from_utf8(&log[body..body + category_len])
                .map_err(|_| StoreError::Corrupted)?;
            let name = str::from_utf8(&log[body + category_len..state_off])
                .map_err(|_| StoreError::Corrupted)?;
            let key = Identity::new(category, name).map_err(|_| StoreError::Corrupted)?;

            match header.kind {
                KIND_PUT => {
                    index.insert(key, (state_off as u64, state_len as u32));
                }
                KIND_TOMBSTONE => {
                    index.remove(&key);
                }
                _ => return Err(StoreError::Corrupted),
            }
            offset = next;
        }
        Ok(())
    }

    // Appends the record bytes to `buf` and returns the state offset in the
    // log, assuming `buf` lands at `base`.
    fn encode_record(record: &PendingRecord, base: u64, buf: &mut Vec<u8>) -> u64 {
        let category = record.key.category().as_bytes();
        let name = record.key.name().as_bytes();
        let header = RecordHeader {
            magic: U32::new(RECORD_MAGIC),
            kind: record.kind,
            category_len: U16::new(category.len() as u16),
            name_len: U16::new(name.len() as u16),
            state_len: U32::new(record.state.len() as u32),
        };

        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(category);
        buf.extend_from_slice(name);
        let state_off = base + buf.len() as u64;
        buf.extend_from_slice(&record.state);
        state_off
    }

    fn write_log(&self, buf: &[u8], offset: u64) -> Result<(), StoreError> {
        #[cfg(test)]
        if self
            .injected_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        self.file.write_all_at(buf, offset).map_err(StoreError::Io)
    }

    #[cfg(test)]
    fn inject_write_failures(&self, count: u32) {
        self.injected_write_failures.store(count, Ordering::SeqCst);
    }

    /// Attempts to sync log data to the disk.
    ///
    /// # Panics
    ///
    /// Panics if the underlying `File::sync_all` operation fails.
    fn fsync(&self) {
        let result = self.file.sync_all();
        if result.is_err() {
            // if fsync fails, we can't make sure data is flushed to disk
            // ref: https://wiki.postgresql.org/wiki/Fsync_Errors
            panic!("flush (fsync) failed");
        }
    }
}

impl StoreBackend for FileStore {
    fn begin(&self) -> Result<TxnId, StoreError> {
        let mut inner = self.inner.lock();
        let txn = TxnId(inner.next_txn);
        inner.next_txn += 1;
        inner.pending.insert(txn, Vec::new());
        Ok(txn)
    }

    fn commit(&self, txn: TxnId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let records = inner.pending.remove(&txn).ok_or(StoreError::Corrupted)?;
        if records.is_empty() {
            return Ok(());
        }

        // stage the whole transaction into one buffer and write it before
        // touching the index, so a failed commit applies nothing
        let base = inner.end;
        let mut buf = Vec::new();
        let mut state_offsets = Vec::with_capacity(records.len());
        for record in &records {
            state_offsets.push(Self::encode_record(record, base, &mut buf));
        }

        self.write_log(&buf, base)?;
        self.fsync();

        inner.end = base + buf.len() as u64;
        for (record, state_off) in records.iter().zip(state_offsets) {
            match record.kind {
                KIND_PUT => {
                    inner
                        .index
                        .insert(record.key.clone(), (state_off, record.state.len() as u32));
                }
                KIND_TOMBSTONE => {
                    inner.index.remove(&record.key);
                }
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn rollback(&self, txn: TxnId) {
        self.inner.lock().pending.remove(&txn);
    }

    fn load(&self, txn: TxnId, key: &Identity) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock();
        // a transaction reads its own buffered writes first
        if let Some(records) = inner.pending.get(&txn) {
            for record in records.iter().rev() {
                if record.key == *key {
                    return match record.kind {
                        KIND_PUT => Ok(record.state.clone()),
                        _ => Err(StoreError::NotFound),
                    };
                }
            }
        }
        let (offset, len) = *inner.index.get(key).ok_or(StoreError::NotFound)?;
        let mut state = vec![0; len as usize];
        self.file
            .read_exact_at(&mut state, offset)
            .map_err(StoreError::Io)?;
        Ok(state)
    }

    fn save(&self, txn: TxnId, key: &Identity, state: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let records = inner.pending.get_mut(&txn).ok_or(StoreError::Corrupted)?;
        records.push(PendingRecord {
            kind: KIND_PUT,
            key: key.clone(),
            state: state.to_vec(),
        });
        Ok(())
    }

    fn erase(&self, txn: TxnId, key: &Identity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let known = inner.index.contains_key(key);
        let records = inner.pending.get_mut(&txn).ok_or(StoreError::Corrupted)?;
        let buffered = records
            .iter()
            .any(|r| r.kind == KIND_PUT && r.key == *key);
        if !known && !buffered {
            return Err(StoreError::NotFound);
        }
        records.push(PendingRecord {
            kind: KIND_TOMBSTONE,
            key: key.clone(),
            state: Vec::new(),
        });
        Ok(())
    }
}
