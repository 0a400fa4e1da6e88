//! On-disk chunk tier.
//!
//! One file per chunk build:
//!
//! ```text
//! offset 0 : u8   compressed (0|1)
//! offset 1 : u64  payload length, little-endian
//! offset 9 : payload (canonical JSON, deflated when compressed = 1)
//! ```
//!
//! `index.dat` lists every resident file. New records are appended as they are
//! written and the whole index is rewritten on [`DiskCache::flush_index`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;

use super::CacheError;
use crate::world::chunk::{ChunkKey, Lod, WorldChunk};

pub const INDEX_FILE: &str = "index.dat";
const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub key: String,
    pub file_name: String,
    pub bytes: u64,
    pub saved_unix: u64,
    pub lod: u8,
}

impl DiskRecord {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&(self.file_name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.file_name.as_bytes());
        out.extend_from_slice(&self.bytes.to_le_bytes());
        out.extend_from_slice(&self.saved_unix.to_le_bytes());
        out.push(self.lod);
    }

    fn read_from(buf: &mut &[u8]) -> Option<DiskRecord> {
        let key_len = take_u32(buf)? as usize;
        let key = String::from_utf8(take(buf, key_len)?.to_vec()).ok()?;
        let name_len = take_u32(buf)? as usize;
        let file_name = String::from_utf8(take(buf, name_len)?.to_vec()).ok()?;
        let bytes = take_u64(buf)?;
        let saved_unix = take_u64(buf)?;
        let lod = *take(buf, 1)?.first()?;
        Some(DiskRecord { key, file_name, bytes, saved_unix, lod })
    }

    fn chunk_key(&self) -> Option<ChunkKey> {
        let mut parts = self.key.split('_');
        let x = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        let lod = Lod::from_ordinal(parts.next()?.parse().ok()?)?;
        Some(ChunkKey::new(x, z, lod))
    }
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if buf.len() < n {
        return None;
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Some(head)
}

fn take_u32(buf: &mut &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(take(buf, 4)?.try_into().ok()?))
}

fn take_u64(buf: &mut &[u8]) -> Option<u64> {
    Some(u64::from_le_bytes(take(buf, 8)?.try_into().ok()?))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Deflate `data` at `level` (1..=9).
pub fn compress(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::new(level.min(9)));
    enc.write_all(data)?;
    enc.finish()
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

/// Frame a canonical payload. Level 0 stores it uncompressed.
pub fn encode_file(payload: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let (flag, body) = if level == 0 {
        (0u8, payload.to_vec())
    } else {
        (1u8, compress(payload, level)?)
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(flag);
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Undo [`encode_file`], returning the canonical payload.
pub fn decode_file(bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(CacheError::Corrupt(format!("file is {} bytes, header needs 9", bytes.len())));
    }
    let flag = bytes[0];
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[1..HEADER_LEN]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != len {
        return Err(CacheError::Corrupt(format!("payload length {} but header says {}", body.len(), len)));
    }
    match flag {
        0 => Ok(body.to_vec()),
        1 => decompress(body).map_err(|e| CacheError::Corrupt(format!("inflate failed: {}", e))),
        other => Err(CacheError::Corrupt(format!("bad compression flag {}", other))),
    }
}

struct IndexEntry {
    record: DiskRecord,
    /// Write order within this process, breaks `saved_unix` ties.
    seq: u64,
}

#[derive(Default)]
struct DiskIndex {
    records: HashMap<ChunkKey, IndexEntry>,
    seq: u64,
    /// Records physically present in `index.dat`, including superseded ones.
    on_file: u32,
}

pub struct DiskCache {
    dir: PathBuf,
    compression_level: u32,
    max_chunks: usize,
    index: Mutex<DiskIndex>,
}

impl DiskCache {
    /// Open (creating if needed) a cache directory and load its index.
    pub fn open(dir: impl AsRef<Path>, compression_level: u32, max_chunks: usize) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut index = DiskIndex::default();

        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            let raw = fs::read(&index_path)?;
            let mut buf = raw.as_slice();
            let count = take_u32(&mut buf).unwrap_or(0);
            let mut dropped = 0usize;
            for _ in 0..count {
                let Some(record) = DiskRecord::read_from(&mut buf) else {
                    tracing::warn!("Disk cache index truncated after {} records", index.records.len());
                    break;
                };
                let Some(key) = record.chunk_key() else {
                    dropped += 1;
                    continue;
                };
                if !dir.join(&record.file_name).exists() {
                    dropped += 1;
                    continue;
                }
                index.seq += 1;
                let seq = index.seq;
                index.records.insert(key, IndexEntry { record, seq });
            }
            if dropped > 0 {
                tracing::info!("Disk cache dropped {} stale index records", dropped);
            }
        }
        tracing::info!("Disk cache at {:?}: {} chunks indexed", dir, index.records.len());

        let cache = Self {
            dir,
            compression_level: compression_level.min(9),
            max_chunks: max_chunks.max(1),
            index: Mutex::new(index),
        };
        cache.flush_index()?;
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.index.lock().expect("disk index poisoned").records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("disk index poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, key: &ChunkKey) -> Option<DiskRecord> {
        let index = self.index.lock().expect("disk index poisoned");
        index.records.get(key).map(|e| e.record.clone())
    }

    /// Write a chunk's canonical form and index it, evicting the oldest file
    /// when over capacity.
    pub fn write(&self, chunk: &WorldChunk) -> Result<(), CacheError> {
        let key = chunk.key();
        let payload = chunk.to_canonical_json()?;
        let framed = encode_file(&payload, self.compression_level)?;
        let file_name = key.file_name();
        let tmp = self.dir.join(format!("{}.tmp", file_name));
        fs::write(&tmp, &framed)?;
        fs::rename(&tmp, self.dir.join(&file_name))?;

        let record = DiskRecord {
            key: key.to_string(),
            file_name,
            bytes: framed.len() as u64,
            saved_unix: unix_now(),
            lod: key.lod.ordinal(),
        };

        let mut index = self.index.lock().expect("disk index poisoned");
        index.seq += 1;
        let seq = index.seq;
        index.records.insert(key, IndexEntry { record: record.clone(), seq });
        while index.records.len() > self.max_chunks {
            let Some(oldest) = index
                .records
                .iter()
                .min_by_key(|(_, e)| (e.record.saved_unix, e.seq))
                .map(|(k, _)| *k)
            else {
                break;
            };
            if let Some(entry) = index.records.remove(&oldest) {
                if let Err(e) = fs::remove_file(self.dir.join(&entry.record.file_name)) {
                    tracing::warn!("Failed to delete evicted chunk file {}: {}", entry.record.file_name, e);
                }
                tracing::debug!("Disk cache evicted {}", oldest);
            }
        }
        if let Err(e) = self.append_record(&mut index, &record) {
            tracing::warn!("Index append failed, will rewrite on flush: {}", e);
        }
        Ok(())
    }

    fn append_record(&self, index: &mut DiskIndex, record: &DiskRecord) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(INDEX_FILE))?;
        if file.metadata()?.len() < 4 {
            file.write_all(&0u32.to_le_bytes())?;
            index.on_file = 0;
        }
        let mut buf = Vec::new();
        record.write_to(&mut buf);
        file.seek(SeekFrom::End(0))?;
        file.write_all(&buf)?;
        index.on_file += 1;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&index.on_file.to_le_bytes())?;
        Ok(())
    }

    /// Read and decode a chunk. `Ok(None)` when not indexed. A corrupt or
    /// missing file is dropped from the index and reported as an error.
    pub fn read(&self, key: &ChunkKey) -> Result<Option<WorldChunk>, CacheError> {
        let Some(record) = self.record(key) else {
            return Ok(None);
        };
        let result = fs::read(self.dir.join(&record.file_name))
            .map_err(CacheError::from)
            .and_then(|bytes| decode_file(&bytes))
            .and_then(|payload| WorldChunk::from_canonical_json(&payload, key.lod).map_err(CacheError::from))
            .and_then(|chunk| {
                if chunk.pos() != key.pos() {
                    Err(CacheError::Corrupt(format!("file for {} holds chunk {:?}", key, chunk.pos())))
                } else {
                    Ok(chunk)
                }
            });
        match result {
            Ok(chunk) => Ok(Some(chunk)),
            Err(e) => {
                self.remove(key);
                Err(e)
            }
        }
    }

    pub fn remove(&self, key: &ChunkKey) -> bool {
        let removed = self.index.lock().expect("disk index poisoned").records.remove(key);
        match removed {
            Some(entry) => {
                let _ = fs::remove_file(self.dir.join(&entry.record.file_name));
                true
            }
            None => false,
        }
    }

    /// Rewrite `index.dat` from the in-memory index.
    pub fn flush_index(&self) -> Result<(), CacheError> {
        let mut index = self.index.lock().expect("disk index poisoned");
        let mut entries: Vec<&IndexEntry> = index.records.values().collect();
        entries.sort_by_key(|e| e.seq);
        let mut buf = Vec::new();
        buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in &entries {
            entry.record.write_to(&mut buf);
        }
        let count = entries.len() as u32;
        let tmp = self.dir.join(format!("{}.tmp", INDEX_FILE));
        let mut file = File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(INDEX_FILE))?;
        index.on_file = count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::generator::{GeneratorConfig, WorldGenerator};
    use crate::world::position::ChunkPos;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("worldcore_disk_{}_{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn chunk(x: i32, lod: Lod) -> WorldChunk {
        WorldGenerator::new(GeneratorConfig::default()).generate(ChunkPos::new(x, 3), lod)
    }

    #[test]
    fn compression_round_trips() {
        let data = b"aaaaaaaaaabbbbbbbbbbccccccccccdddddddddd".repeat(20);
        for level in 1..=9 {
            let packed = compress(&data, level).unwrap();
            assert_eq!(decompress(&packed).unwrap(), data);
        }
        let framed = encode_file(&data, 0).unwrap();
        assert_eq!(framed[0], 0);
        assert_eq!(decode_file(&framed).unwrap(), data);
    }

    #[test]
    fn write_then_read_matches_canonical_form() {
        let dir = temp_dir("roundtrip");
        let cache = DiskCache::open(&dir, 6, 10).unwrap();
        let c = chunk(-2, Lod::Medium);
        cache.write(&c).unwrap();
        let back = cache.read(&c.key()).unwrap().unwrap();
        assert_eq!(back.to_canonical_json().unwrap(), c.to_canonical_json().unwrap());
        assert_eq!(back.lod(), Lod::Medium);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = temp_dir("reopen");
        {
            let cache = DiskCache::open(&dir, 1, 10).unwrap();
            cache.write(&chunk(0, Lod::High)).unwrap();
            cache.write(&chunk(1, Lod::Low)).unwrap();
        }
        let cache = DiskCache::open(&dir, 1, 10).unwrap();
        assert_eq!(cache.len(), 2);
        let rec = cache.record(&ChunkKey::new(1, 3, Lod::Low)).unwrap();
        assert_eq!(rec.key, "1_3_2");
        assert_eq!(rec.file_name, "chunk_00000001_00000003_2.bin");
        assert_eq!(rec.lod, 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn records_with_missing_files_are_dropped_on_open() {
        let dir = temp_dir("missing");
        {
            let cache = DiskCache::open(&dir, 0, 10).unwrap();
            cache.write(&chunk(0, Lod::High)).unwrap();
            cache.write(&chunk(1, Lod::High)).unwrap();
        }
        fs::remove_file(dir.join(ChunkKey::new(0, 3, Lod::High).file_name())).unwrap();
        let cache = DiskCache::open(&dir, 0, 10).unwrap();
        assert_eq!(cache.len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_is_removed_and_reported() {
        let dir = temp_dir("corrupt");
        let cache = DiskCache::open(&dir, 6, 10).unwrap();
        let c = chunk(4, Lod::High);
        cache.write(&c).unwrap();
        fs::write(dir.join(c.key().file_name()), b"\x01\x05\x00\x00\x00\x00\x00\x00\x00junk").unwrap();
        assert!(cache.read(&c.key()).is_err());
        assert!(!cache.contains(&c.key()));
        assert!(cache.read(&c.key()).unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn capacity_evicts_oldest_write() {
        let dir = temp_dir("capacity");
        let cache = DiskCache::open(&dir, 1, 2).unwrap();
        for x in 0..3 {
            cache.write(&chunk(x, Lod::Billboard)).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&ChunkKey::new(0, 3, Lod::Billboard)));
        assert!(!dir.join(ChunkKey::new(0, 3, Lod::Billboard).file_name()).exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
