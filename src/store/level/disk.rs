//! Immutable on-disk levels.
//!
//! A level is a pair of files: an index file holding per-key metadata and
//! body offsets, and a body file holding raw blob bytes. The index is small
//! (keys plus fixed-size metadata) and is loaded into memory when the level
//! is opened; blobs are read positionally from the body on demand.
//!
//! ## Index file layout
//!
//! ```text
//! +---------------------------------------------------+
//! | magic (8) | version (4) | entry_count (8)         |
//! | min_access_time (8) | area_size (8)               |
//! | merge_free_size (8) | reserved (4)                |  header, 48 bytes
//! +---------------------------------------------------+
//! | key_len u16 | key | op u8 | access_time u64       |
//! | next_size u64 | body_offset u64 | blob_len u32    |  per record
//! +---------------------------------------------------+
//! | crc32 over header + records (4)                   |
//! +---------------------------------------------------+
//! ```
//!
//! All integers big-endian. The body file is an 8-byte magic followed by
//! concatenated blob bytes. Files are written under temporary names and
//! renamed on completion, body first: the index's existence commits the
//! level.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crc::{Crc, CRC_32_ISCSI};

use crate::error::{Error, Result};
use crate::io::{FileController, FileWriter, RandomAccessFile, WriteOptions};
use crate::key::{KeySerializer, StorageKey};
use crate::profile::{
    CheckProfileResult, GetProfileResult, Operation, ENTRY_OVERHEAD,
};
use crate::store::level::{EntryIter, KeyEntry, KeyIter, LevelEntry, ReadLevel};

const INDEX_MAGIC: &[u8; 8] = b"PFDB\x00IX\x00";
const BODY_MAGIC: &[u8; 8] = b"PFDB\x00BD\x00";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 48;
const BODY_HEADER_SIZE: u64 = 8;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Paths of a level's file pair.
#[derive(Debug, Clone)]
pub struct LevelFiles {
    pub index_path: PathBuf,
    pub body_path: PathBuf,
}

impl LevelFiles {
    pub fn new(index_path: PathBuf, body_path: PathBuf) -> Self {
        Self {
            index_path,
            body_path,
        }
    }

    fn temp(&self) -> Self {
        Self {
            index_path: temp_name(&self.index_path),
            body_path: temp_name(&self.body_path),
        }
    }
}

fn temp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
struct DiskRecord<K> {
    key: K,
    operation: Operation,
    access_time: u64,
    next_size: u64,
    body_offset: u64,
    blob_len: u32,
}

/// An immutable on-disk level: in-memory index, positional body reads.
pub struct DiskLevel<K: StorageKey> {
    records: Arc<Vec<DiskRecord<K>>>,
    body: Arc<dyn RandomAccessFile>,
    area_size: u64,
    merge_free_size: u64,
    min_access_time: u64,
}

impl<K: StorageKey> DiskLevel<K> {
    /// Opens a level, validating magic, version, checksum, and key order.
    pub fn open(
        controller: &dyn FileController,
        serializer: &Arc<dyn KeySerializer<K>>,
        files: &LevelFiles,
    ) -> Result<Self> {
        let index_file = controller.open_read(&files.index_path)?;
        let index_size = index_file.size()?;
        if (index_size as usize) < HEADER_SIZE + 4 {
            return Err(Error::CorruptedLevel(format!(
                "index file too short: {} bytes",
                index_size
            )));
        }
        let mut raw = vec![0u8; index_size as usize];
        index_file.read_exact_at(0, &mut raw)?;

        let checked_len = raw.len() - 4;
        let stored_crc = (&raw[checked_len..]).read_u32::<BigEndian>()?;
        if CASTAGNOLI.checksum(&raw[..checked_len]) != stored_crc {
            return Err(Error::ChecksumMismatch);
        }

        let header = Header::decode(&raw[..HEADER_SIZE])?;
        let mut records = Vec::with_capacity(header.entry_count as usize);
        let mut cursor = Cursor::new(&raw[HEADER_SIZE..checked_len]);
        for _ in 0..header.entry_count {
            records.push(decode_record(&mut cursor, serializer.as_ref())?);
        }
        if cursor.position() != (checked_len - HEADER_SIZE) as u64 {
            return Err(Error::CorruptedLevel(
                "trailing bytes after last index record".to_string(),
            ));
        }
        for pair in records.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(Error::CorruptedLevel(
                    "index records out of key order".to_string(),
                ));
            }
        }

        let body = controller.open_read(&files.body_path)?;
        let mut body_magic = [0u8; 8];
        body.read_exact_at(0, &mut body_magic)?;
        if &body_magic != BODY_MAGIC {
            return Err(Error::InvalidLevelMagic);
        }

        Ok(Self {
            records: Arc::new(records),
            body: Arc::from(body),
            area_size: header.area_size,
            merge_free_size: header.merge_free_size,
            min_access_time: header.min_access_time,
        })
    }

    fn find(&self, key: &K) -> Option<&DiskRecord<K>> {
        self.records
            .binary_search_by(|record| record.key.cmp(key))
            .ok()
            .map(|idx| &self.records[idx])
    }

    fn read_blob(&self, record: &DiskRecord<K>) -> Result<Bytes> {
        let mut buf = vec![0u8; record.blob_len as usize];
        self.body.read_exact_at(record.body_offset, &mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl<K: StorageKey> ReadLevel<K> for DiskLevel<K> {
    fn check_profile(&self, key: &K) -> Result<CheckProfileResult> {
        Ok(match self.find(key) {
            Some(record) => CheckProfileResult {
                operation: record.operation,
                size: record.blob_len as u64,
            },
            None => CheckProfileResult::not_found(),
        })
    }

    fn get_profile(&self, key: &K) -> Result<GetProfileResult> {
        match self.find(key) {
            Some(record) => {
                let blob = if record.operation == Operation::Erase {
                    None
                } else {
                    Some(self.read_blob(record)?)
                };
                Ok(GetProfileResult {
                    operation: record.operation,
                    access_time: record.access_time,
                    blob,
                })
            }
            None => Ok(GetProfileResult::not_found()),
        }
    }

    fn key_iterator(&self) -> Result<KeyIter<K>> {
        Ok(Box::new(DiskKeyIter {
            records: self.records.clone(),
            pos: 0,
        }))
    }

    fn iterator(&self, read_buffer_size: usize) -> Result<EntryIter<K>> {
        Ok(Box::new(DiskEntryIter {
            records: self.records.clone(),
            body: self.body.clone(),
            pos: 0,
            buf: Vec::new(),
            buf_start: 0,
            read_buffer_size: read_buffer_size.max(4096),
        }))
    }

    fn size(&self) -> u64 {
        self.records.len() as u64
    }

    fn area_size(&self) -> u64 {
        self.area_size
    }

    fn merge_free_size(&self) -> u64 {
        self.merge_free_size
    }

    fn min_access_time(&self) -> u64 {
        self.min_access_time
    }
}

struct DiskKeyIter<K> {
    records: Arc<Vec<DiskRecord<K>>>,
    pos: usize,
}

impl<K: StorageKey> Iterator for DiskKeyIter<K> {
    type Item = Result<KeyEntry<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.pos)?;
        self.pos += 1;
        Some(Ok(KeyEntry {
            key: record.key.clone(),
            operation: record.operation,
            access_time: record.access_time,
        }))
    }
}

/// Streaming full scan: body bytes are pulled in `read_buffer_size` chunks,
/// so a level scan does one large read per chunk instead of one per blob.
struct DiskEntryIter<K> {
    records: Arc<Vec<DiskRecord<K>>>,
    body: Arc<dyn RandomAccessFile>,
    pos: usize,
    buf: Vec<u8>,
    buf_start: u64,
    read_buffer_size: usize,
}

impl<K: StorageKey> DiskEntryIter<K> {
    fn blob_for(&mut self, record: &DiskRecord<K>) -> Result<Bytes> {
        let len = record.blob_len as usize;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let start = record.body_offset;
        let end = start + len as u64;
        let buffered_end = self.buf_start + self.buf.len() as u64;
        if start < self.buf_start || end > buffered_end {
            let chunk = self.read_buffer_size.max(len);
            let mut buf = vec![0u8; chunk];
            let n = self.body.read_at(start, &mut buf)?;
            if n < len {
                return Err(Error::CorruptedLevel(format!(
                    "body truncated at offset {}",
                    start
                )));
            }
            buf.truncate(n);
            self.buf = buf;
            self.buf_start = start;
        }

        let offset = (start - self.buf_start) as usize;
        Ok(Bytes::copy_from_slice(&self.buf[offset..offset + len]))
    }
}

impl<K: StorageKey> Iterator for DiskEntryIter<K> {
    type Item = Result<LevelEntry<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.get(self.pos)?.clone();
        self.pos += 1;
        let blob = match self.blob_for(&record) {
            Ok(blob) => blob,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok(LevelEntry {
            key: record.key,
            operation: record.operation,
            access_time: record.access_time,
            next_size: record.next_size,
            blob,
        }))
    }
}

struct Header {
    entry_count: u64,
    min_access_time: u64,
    area_size: u64,
    merge_free_size: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(INDEX_MAGIC);
        (&mut buf[8..12])
            .write_u32::<BigEndian>(FORMAT_VERSION)
            .expect("buffer write");
        (&mut buf[12..20])
            .write_u64::<BigEndian>(self.entry_count)
            .expect("buffer write");
        (&mut buf[20..28])
            .write_u64::<BigEndian>(self.min_access_time)
            .expect("buffer write");
        (&mut buf[28..36])
            .write_u64::<BigEndian>(self.area_size)
            .expect("buffer write");
        (&mut buf[36..44])
            .write_u64::<BigEndian>(self.merge_free_size)
            .expect("buffer write");
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if &buf[0..8] != INDEX_MAGIC {
            return Err(Error::InvalidLevelMagic);
        }
        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedLevelVersion(version));
        }
        Ok(Self {
            entry_count: (&buf[12..20]).read_u64::<BigEndian>()?,
            min_access_time: (&buf[20..28]).read_u64::<BigEndian>()?,
            area_size: (&buf[28..36]).read_u64::<BigEndian>()?,
            merge_free_size: (&buf[36..44]).read_u64::<BigEndian>()?,
        })
    }
}

fn encode_record<K: StorageKey>(
    out: &mut Vec<u8>,
    serializer: &dyn KeySerializer<K>,
    entry: &LevelEntry<K>,
    body_offset: u64,
) -> Result<()> {
    let mut key_bytes = Vec::new();
    serializer.encode(&entry.key, &mut key_bytes);
    if key_bytes.len() > u16::MAX as usize {
        return Err(Error::Encode(
            "key",
            io::Error::new(io::ErrorKind::InvalidInput, "encoded key too long"),
        ));
    }

    out.write_u16::<BigEndian>(key_bytes.len() as u16)
        .expect("vec write");
    out.extend_from_slice(&key_bytes);
    out.push(entry.operation.as_u8());
    out.write_u64::<BigEndian>(entry.access_time).expect("vec write");
    out.write_u64::<BigEndian>(entry.next_size).expect("vec write");
    out.write_u64::<BigEndian>(body_offset).expect("vec write");
    out.write_u32::<BigEndian>(entry.blob.len() as u32)
        .expect("vec write");
    Ok(())
}

fn decode_record<K: StorageKey>(
    cursor: &mut Cursor<&[u8]>,
    serializer: &dyn KeySerializer<K>,
) -> Result<DiskRecord<K>> {
    let key_len = cursor.read_u16::<BigEndian>()? as usize;
    let pos = cursor.position() as usize;
    let raw = *cursor.get_ref();
    if pos + key_len > raw.len() {
        return Err(Error::Decode(
            "index record key",
            io::Error::new(io::ErrorKind::UnexpectedEof, "key out of bounds"),
        ));
    }
    let key = serializer.decode(&raw[pos..pos + key_len])?;
    cursor.set_position((pos + key_len) as u64);

    let op_code = cursor.read_u8()?;
    let operation = Operation::from_u8(op_code).ok_or_else(|| {
        Error::Decode(
            "index record operation",
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown operation code {}", op_code),
            ),
        )
    })?;

    Ok(DiskRecord {
        key,
        operation,
        access_time: cursor.read_u64::<BigEndian>()?,
        next_size: cursor.read_u64::<BigEndian>()?,
        body_offset: cursor.read_u64::<BigEndian>()?,
        blob_len: cursor.read_u32::<BigEndian>()?,
    })
}

/// Aggregates of a finished level, recorded in the index header.
#[derive(Debug, Clone, Copy)]
pub struct LevelWriteStats {
    pub entry_count: u64,
    pub area_size: u64,
    pub merge_free_size: u64,
    pub min_access_time: u64,
}

/// Serializes a key-sorted entry stream into a level file pair.
///
/// Writes under temporary names and renames on completion. An empty stream
/// produces no files and returns `None`. On any failure the temporaries are
/// removed and the final names never appear.
pub fn write_level<K: StorageKey>(
    controller: &dyn FileController,
    serializer: &Arc<dyn KeySerializer<K>>,
    files: &LevelFiles,
    entries: &mut dyn Iterator<Item = Result<LevelEntry<K>>>,
    buffer_size: usize,
) -> Result<Option<LevelWriteStats>> {
    let temp = files.temp();
    match write_level_files(controller, serializer, &temp, entries, buffer_size) {
        Ok(None) => Ok(None),
        Ok(Some(stats)) => {
            controller.rename(&temp.body_path, &files.body_path)?;
            controller.rename(&temp.index_path, &files.index_path)?;
            Ok(Some(stats))
        }
        Err(e) => {
            let _ = controller.remove_file(&temp.body_path);
            let _ = controller.remove_file(&temp.index_path);
            Err(e)
        }
    }
}

fn write_level_files<K: StorageKey>(
    controller: &dyn FileController,
    serializer: &Arc<dyn KeySerializer<K>>,
    temp: &LevelFiles,
    entries: &mut dyn Iterator<Item = Result<LevelEntry<K>>>,
    buffer_size: usize,
) -> Result<Option<LevelWriteStats>> {
    let opts = WriteOptions::default().drop_cache(true);
    let mut body = FileWriter::create(controller, &temp.body_path, opts, buffer_size)?;
    body.write_all(BODY_MAGIC)?;

    let mut records = Vec::new();
    let mut stats = LevelWriteStats {
        entry_count: 0,
        area_size: 0,
        merge_free_size: 0,
        min_access_time: u64::MAX,
    };
    let mut body_offset = BODY_HEADER_SIZE;

    for entry in entries {
        let entry = entry?;
        let blob_len = entry.blob.len() as u64;
        let offset = if entry.operation == Operation::Erase || blob_len == 0 {
            0
        } else {
            let offset = body_offset;
            body.write_all(&entry.blob)?;
            body_offset += blob_len;
            offset
        };
        encode_record(&mut records, serializer.as_ref(), &entry, offset)?;

        stats.entry_count += 1;
        stats.area_size += blob_len + ENTRY_OVERHEAD;
        stats.merge_free_size += entry.next_size;
        stats.min_access_time = stats.min_access_time.min(entry.access_time);
    }

    if stats.entry_count == 0 {
        drop(body);
        let _ = controller.remove_file(&temp.body_path);
        return Ok(None);
    }
    body.sync()?;
    body.close()?;

    let header = Header {
        entry_count: stats.entry_count,
        min_access_time: stats.min_access_time,
        area_size: stats.area_size,
        merge_free_size: stats.merge_free_size,
    }
    .encode();

    let mut digest = CASTAGNOLI.digest();
    digest.update(&header);
    digest.update(&records);
    let crc = digest.finalize();

    let mut index = FileWriter::create(controller, &temp.index_path, opts, buffer_size)?;
    index.write_all(&header)?;
    index.write_all(&records)?;
    let mut footer = Vec::with_capacity(4);
    footer.write_u32::<BigEndian>(crc).expect("vec write");
    index.write_all(&footer)?;
    index.sync()?;
    index.close()?;

    Ok(Some(stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::PosixFileController;
    use crate::key::BytesKeySerializer;
    use crate::tmpfs::TempDir;

    fn serializer() -> Arc<dyn KeySerializer<Vec<u8>>> {
        Arc::new(BytesKeySerializer)
    }

    fn files_in(dir: &TempDir) -> LevelFiles {
        LevelFiles::new(dir.path().join("lvl.ix"), dir.path().join("lvl.db"))
    }

    fn entry(key: &[u8], op: Operation, at: u64, next_size: u64, blob: &[u8]) -> LevelEntry<Vec<u8>> {
        LevelEntry {
            key: key.to_vec(),
            operation: op,
            access_time: at,
            next_size,
            blob: Bytes::copy_from_slice(blob),
        }
    }

    fn write_entries(
        dir: &TempDir,
        entries: Vec<LevelEntry<Vec<u8>>>,
    ) -> (LevelFiles, Option<LevelWriteStats>) {
        let controller = PosixFileController::new();
        let files = files_in(dir);
        let mut iter = entries.into_iter().map(Ok);
        let stats = write_level(&controller, &serializer(), &files, &mut iter, 64 * 1024)
            .expect("write_level failed");
        (files, stats)
    }

    #[test]
    fn test_write_then_point_reads() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, stats) = write_entries(
            &dir,
            vec![
                entry(b"alpha", Operation::Insert, 100, 3, b"profile-a"),
                entry(b"beta", Operation::Erase, 120, 0, b""),
                entry(b"gamma", Operation::Rewrite, 90, 7, b"profile-g"),
            ],
        );
        let stats = stats.expect("level should not be empty");
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.min_access_time, 90);
        assert_eq!(stats.merge_free_size, 10);

        let controller = PosixFileController::new();
        let level =
            DiskLevel::open(&controller, &serializer(), &files).expect("open failed");

        assert_eq!(level.size(), 3);
        assert_eq!(level.min_access_time(), 90);

        let got = level.get_profile(&b"alpha".to_vec()).expect("get failed");
        assert_eq!(got.operation, Operation::Insert);
        assert_eq!(got.access_time, 100);
        assert_eq!(got.blob, Some(Bytes::from_static(b"profile-a")));

        let erased = level.get_profile(&b"beta".to_vec()).expect("get failed");
        assert_eq!(erased.operation, Operation::Erase);
        assert!(erased.blob.is_none());

        let check = level.check_profile(&b"gamma".to_vec()).expect("check failed");
        assert_eq!(check.operation, Operation::Rewrite);
        assert_eq!(check.size, 9);

        assert!(!level
            .get_profile(&b"missing".to_vec())
            .expect("get failed")
            .found());
    }

    #[test]
    fn test_full_scan_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let written = vec![
            entry(b"a", Operation::Insert, 1, 0, b"small"),
            entry(b"b", Operation::Insert, 2, 5, &[0xAB; 9000]),
            entry(b"c", Operation::Erase, 3, 0, b""),
            entry(b"d", Operation::Rewrite, 4, 2, b"tail"),
        ];
        let (files, _) = write_entries(&dir, written.clone());

        let controller = PosixFileController::new();
        let level = DiskLevel::open(&controller, &serializer(), &files).expect("open failed");

        // Small read buffer forces multiple refills across the large blob.
        let scanned: Vec<_> = level
            .iterator(4096)
            .expect("iterator failed")
            .collect::<Result<Vec<_>>>()
            .expect("scan failed");

        assert_eq!(scanned.len(), written.len());
        for (got, want) in scanned.iter().zip(&written) {
            assert_eq!(got.key, want.key);
            assert_eq!(got.operation, want.operation);
            assert_eq!(got.access_time, want.access_time);
            assert_eq!(got.next_size, want.next_size);
            assert_eq!(got.blob, want.blob);
        }
    }

    #[test]
    fn test_key_iterator_skips_bodies() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, _) = write_entries(
            &dir,
            vec![
                entry(b"a", Operation::Insert, 1, 0, b"x"),
                entry(b"b", Operation::Erase, 2, 0, b""),
            ],
        );

        let controller = PosixFileController::new();
        let level = DiskLevel::open(&controller, &serializer(), &files).expect("open failed");

        let keys: Vec<_> = level
            .key_iterator()
            .expect("key_iterator failed")
            .collect::<Result<Vec<_>>>()
            .expect("scan failed");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].key, b"a".to_vec());
        assert_eq!(keys[1].operation, Operation::Erase);
    }

    #[test]
    fn test_empty_stream_writes_nothing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, stats) = write_entries(&dir, vec![]);
        assert!(stats.is_none());
        assert!(!files.index_path.exists());
        assert!(!files.body_path.exists());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, _) = write_entries(&dir, vec![entry(b"a", Operation::Insert, 1, 0, b"x")]);
        assert!(files.index_path.exists());
        assert!(!temp_name(&files.index_path).exists());
        assert!(!temp_name(&files.body_path).exists());
    }

    #[test]
    fn test_corrupt_index_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, _) = write_entries(&dir, vec![entry(b"a", Operation::Insert, 1, 0, b"x")]);

        // Flip a byte in the records region.
        let mut raw = std::fs::read(&files.index_path).expect("read failed");
        let mid = HEADER_SIZE + 2;
        raw[mid] ^= 0xFF;
        std::fs::write(&files.index_path, &raw).expect("write failed");

        let controller = PosixFileController::new();
        let result = DiskLevel::open(&controller, &serializer(), &files);
        assert!(matches!(result, Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_bad_magic_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, _) = write_entries(&dir, vec![entry(b"a", Operation::Insert, 1, 0, b"x")]);

        let mut raw = std::fs::read(&files.index_path).expect("read failed");
        raw[0..8].copy_from_slice(b"NOTALEVL");
        // Keep the checksum consistent so the magic check is what fires.
        let len = raw.len();
        let crc = CASTAGNOLI.checksum(&raw[..len - 4]);
        (&mut raw[len - 4..]).copy_from_slice(&crc.to_be_bytes());
        std::fs::write(&files.index_path, &raw).expect("write failed");

        let controller = PosixFileController::new();
        let result = DiskLevel::open(&controller, &serializer(), &files);
        assert!(matches!(result, Err(Error::InvalidLevelMagic)));
    }

    #[test]
    fn test_truncated_index_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (files, _) = write_entries(&dir, vec![entry(b"a", Operation::Insert, 1, 0, b"x")]);

        std::fs::write(&files.index_path, b"short").expect("write failed");

        let controller = PosixFileController::new();
        let result = DiskLevel::open(&controller, &serializer(), &files);
        assert!(matches!(result, Err(Error::CorruptedLevel(_))));
    }
}
