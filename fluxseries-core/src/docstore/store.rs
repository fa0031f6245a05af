//! Document store handle, batches and body reader

use super::{DocInfo, OpenMode, Record, RecordKind, StoreConfig, FORMAT_VERSION, HEADER_LEN, MAGIC};
use crate::{Result, SeriesError};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pending operation in a batch
#[derive(Debug, Clone)]
enum BatchOp {
    Upsert { key: String, body: Bytes },
    Delete { key: String },
}

/// Accumulates upserts and deletes until committed with [`DocStore::commit`]
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, key: impl Into<String>, body: impl Into<Bytes>) {
        self.ops.push(BatchOp::Upsert {
            key: key.into(),
            body: body.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

/// Fetch-only handle. Opening it reads the header and nothing else.
///
/// A reader stays bound to the file it opened, so offsets taken from a scan
/// of that file remain valid after compaction renames a new file over it.
#[derive(Debug)]
pub struct DocReader {
    path: PathBuf,
    generation: u64,
    file: Mutex<File>,
}

impl DocReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = open_existing(&path, false)?;
        let generation = check_header(&mut file, &path)?;
        Ok(Self {
            path,
            generation,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Random id written when the file was created; kept across compaction
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Read and verify the record at `info`, returning the decoded body
    pub fn fetch_body(&self, info: &DocInfo) -> Result<Bytes> {
        let record = self.read_record(info)?;
        if record.kind != RecordKind::Put || record.key != info.id {
            return Err(SeriesError::Corruption(format!(
                "record at {} is not document {}",
                info.offset, info.id
            )));
        }
        record.body()
    }

    fn read_raw(&self, info: &DocInfo) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; info.size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(info.offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_record(&self, info: &DocInfo) -> Result<Record> {
        let raw = self.read_raw(info)?;
        match Record::decode(&raw)? {
            Some((record, _)) => Ok(record),
            None => Err(SeriesError::Corruption(format!(
                "truncated record at {}",
                info.offset
            ))),
        }
    }
}

/// A handle to one store file with its committed key index
pub struct DocStore {
    path: PathBuf,
    mode: OpenMode,
    config: StoreConfig,
    reader: Arc<DocReader>,
    writer: Option<File>,
    index: BTreeMap<String, DocInfo>,
    update_seq: u64,
    end: u64,
}

impl DocStore {
    /// Open a store, building the key index from committed records
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if mode == OpenMode::Create && !path.exists() {
            create_file(&path)?;
            debug!("Created store {:?}", path);
        }

        let mut file = open_existing(&path, mode.writable())?;
        let generation = check_header(&mut file, &path)?;
        let file_len = file.metadata()?.len();

        let scan = scan(&mut file, &path)?;
        if scan.committed_end < file_len {
            if mode.writable() {
                warn!(
                    "Truncating {} uncommitted bytes from {:?}",
                    file_len - scan.committed_end,
                    path
                );
                file.set_len(scan.committed_end)?;
                file.sync_all()?;
            } else {
                debug!("Ignoring uncommitted tail of {:?}", path);
            }
        }

        // A read-only store keeps the scanned handle so the reader cannot
        // see a different file than the index describes
        let (reader, writer) = if mode.writable() {
            let mut w = file;
            w.seek(SeekFrom::Start(scan.committed_end))?;
            (DocReader::open(&path)?, Some(w))
        } else {
            let reader = DocReader {
                path: path.clone(),
                generation,
                file: Mutex::new(file),
            };
            (reader, None)
        };

        Ok(Self {
            reader: Arc::new(reader),
            path,
            mode,
            config,
            writer,
            index: scan.index,
            update_seq: scan.update_seq,
            end: scan.committed_end,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Number of live documents
    pub fn doc_count(&self) -> usize {
        self.index.len()
    }

    /// Sequence number of the last committed write
    pub fn update_seq(&self) -> u64 {
        self.update_seq
    }

    /// Committed file size in bytes
    pub fn file_size(&self) -> u64 {
        self.end
    }

    pub fn get(&self, key: &str) -> Option<&DocInfo> {
        self.index.get(key)
    }

    pub fn fetch_body(&self, info: &DocInfo) -> Result<Bytes> {
        self.reader.fetch_body(info)
    }

    /// Identity of this file, fixed at creation
    pub fn generation(&self) -> u64 {
        self.reader.generation()
    }

    /// Body reader over the same file this store indexed
    pub fn shared_reader(&self) -> Arc<DocReader> {
        self.reader.clone()
    }

    /// Committed documents in key order, both bounds inclusive
    pub fn range<'a>(
        &'a self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> impl Iterator<Item = &'a DocInfo> + 'a {
        let lower = from.map_or(Bound::Unbounded, |k| Bound::Included(k.to_string()));
        let upper = to.map_or(Bound::Unbounded, |k| Bound::Included(k.to_string()));
        let empty = matches!((&lower, &upper), (Bound::Included(l), Bound::Included(u)) if l > u);
        let range = if empty {
            None
        } else {
            Some(self.index.range::<String, _>((lower, upper)))
        };
        range.into_iter().flatten().map(|(_, info)| info)
    }

    /// Walk committed documents in key order; the first error stops the walk
    pub fn visit_range<F>(&self, from: Option<&str>, to: Option<&str>, mut visit: F) -> Result<()>
    where
        F: FnMut(&DocInfo) -> Result<()>,
    {
        for info in self.range(from, to) {
            visit(info)?;
        }
        Ok(())
    }

    /// Append the batch and a commit record, then publish it in the index.
    /// The batch is emptied on success. Returns the number of operations.
    pub fn commit(&mut self, batch: &mut WriteBatch) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SeriesError::Internal(format!("{:?} is read-only", self.path)))?;

        let mut buf = BytesMut::new();
        let mut seq = self.update_seq;
        let mut applied = Vec::with_capacity(batch.len());

        for op in &batch.ops {
            seq += 1;
            let offset = self.end + buf.len() as u64;
            match op {
                BatchOp::Upsert { key, body } => {
                    let encoded = Record::put(seq, key, body, self.config.compress_threshold).encode();
                    applied.push((
                        key.clone(),
                        Some(DocInfo {
                            id: key.clone(),
                            seq,
                            offset,
                            size: encoded.len() as u32,
                        }),
                    ));
                    buf.extend_from_slice(&encoded);
                }
                BatchOp::Delete { key } => {
                    buf.extend_from_slice(&Record::delete(seq, key).encode());
                    applied.push((key.clone(), None));
                }
            }
        }
        buf.extend_from_slice(&Record::commit(seq).encode());

        let write = writer.write_all(&buf).and_then(|_| {
            if self.config.sync_on_commit {
                writer.sync_data()
            } else {
                writer.flush()
            }
        });
        if let Err(e) = write {
            // Roll the file back so the next commit starts on a record boundary
            let _ = writer.set_len(self.end);
            let _ = writer.seek(SeekFrom::Start(self.end));
            return Err(e.into());
        }

        for (key, info) in applied {
            match info {
                Some(info) => {
                    self.index.insert(key, info);
                }
                None => {
                    self.index.remove(&key);
                }
            }
        }
        self.end += buf.len() as u64;
        self.update_seq = seq;

        let count = batch.len();
        batch.clear();
        Ok(count)
    }

    /// Write every live document into a fresh file at `dest` and sync it
    pub fn compact_to(&self, dest: impl AsRef<Path>) -> Result<usize> {
        let dest = dest.as_ref();
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dest)?;
        out.write_all(&header_bytes(self.generation()))?;

        let mut buf = Vec::with_capacity(64 * 1024);
        for info in self.index.values() {
            let raw = self.reader.read_raw(info)?;
            // Verify before copying so corruption is not carried forward
            if Record::decode(&raw)?.is_none() {
                return Err(SeriesError::Corruption(format!(
                    "truncated record for {}",
                    info.id
                )));
            }
            buf.extend_from_slice(&raw);
            if buf.len() >= 64 * 1024 {
                out.write_all(&buf)?;
                buf.clear();
            }
        }
        buf.extend_from_slice(&Record::commit(self.update_seq).encode());
        out.write_all(&buf)?;
        out.sync_all()?;

        Ok(self.index.len())
    }
}

struct ScanResult {
    index: BTreeMap<String, DocInfo>,
    update_seq: u64,
    committed_end: u64,
}

fn scan(file: &mut File, path: &Path) -> Result<ScanResult> {
    file.seek(SeekFrom::Start(HEADER_LEN))?;
    let mut reader = BufReader::new(&mut *file);

    let mut index = BTreeMap::new();
    let mut pending: Vec<(String, Option<DocInfo>)> = Vec::new();
    let mut update_seq = 0;
    let mut offset = HEADER_LEN;
    let mut committed_end = HEADER_LEN;
    let mut buf = Vec::new();

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        buf.clear();
        buf.extend_from_slice(&len_bytes);
        buf.resize(4 + len, 0);
        match reader.read_exact(&mut buf[4..]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let (record, size) = match Record::decode(&buf) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => break,
            Err(e) => {
                warn!("Stopping scan of {:?} at offset {}: {}", path, offset, e);
                break;
            }
        };

        match record.kind {
            RecordKind::Put => pending.push((
                record.key.clone(),
                Some(DocInfo {
                    id: record.key,
                    seq: record.seq,
                    offset,
                    size: size as u32,
                }),
            )),
            RecordKind::Delete => pending.push((record.key, None)),
            RecordKind::Commit => {
                for (key, info) in pending.drain(..) {
                    match info {
                        Some(info) => {
                            index.insert(key, info);
                        }
                        None => {
                            index.remove(&key);
                        }
                    }
                }
                update_seq = record.seq;
                committed_end = offset + size as u64;
            }
        }
        offset += size as u64;
    }

    Ok(ScanResult {
        index,
        update_seq,
        committed_end,
    })
}

fn header_bytes(generation: u64) -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..4].copy_from_slice(MAGIC);
    header[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    header[8..].copy_from_slice(&generation.to_le_bytes());
    header
}

fn create_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(&header_bytes(rand::random()))?;
    file.sync_all()?;
    Ok(())
}

fn open_existing(path: &Path, writable: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(writable)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => SeriesError::NotFound(path.display().to_string()),
            _ => SeriesError::Io(e),
        })
}

/// Validate the header and return the file's generation
fn check_header(file: &mut File, path: &Path) -> Result<u64> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            SeriesError::Corruption(format!("{:?}: missing header", path))
        }
        _ => SeriesError::Io(e),
    })?;
    if &header[..4] != MAGIC {
        return Err(SeriesError::Corruption(format!("{:?}: bad magic", path)));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != FORMAT_VERSION {
        return Err(SeriesError::Corruption(format!(
            "{:?}: unsupported version {}",
            path, version
        )));
    }
    let mut generation = [0u8; 8];
    generation.copy_from_slice(&header[8..]);
    Ok(u64::from_le_bytes(generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> StoreConfig {
        StoreConfig {
            sync_on_commit: false,
            compress_threshold: 64,
        }
    }

    fn ids(store: &DocStore, from: Option<&str>, to: Option<&str>) -> Vec<String> {
        store.range(from, to).map(|d| d.id.clone()).collect()
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope.series");
        assert!(matches!(
            DocStore::open(&path, OpenMode::ReadOnly, config()),
            Err(SeriesError::NotFound(_))
        ));
        assert!(matches!(DocReader::open(&path), Err(SeriesError::NotFound(_))));
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.series");

        {
            let mut store = DocStore::open(&path, OpenMode::Create, config()).unwrap();
            let mut batch = WriteBatch::new();
            batch.upsert("a", &b"{\"n\":1}"[..]);
            batch.upsert("b", &b"{\"n\":2}"[..]);
            batch.upsert("c", vec![b'x'; 200]);
            assert_eq!(store.commit(&mut batch).unwrap(), 3);
            assert!(batch.is_empty());

            batch.delete("b");
            batch.upsert("a", &b"{\"n\":10}"[..]);
            store.commit(&mut batch).unwrap();
            assert_eq!(store.update_seq(), 5);
        }

        let store = DocStore::open(&path, OpenMode::ReadOnly, config()).unwrap();
        assert_eq!(ids(&store, None, None), vec!["a", "c"]);
        let a = store.get("a").unwrap();
        assert_eq!(&store.fetch_body(a).unwrap()[..], b"{\"n\":10}");
        let c = store.get("c").unwrap();
        assert_eq!(store.fetch_body(c).unwrap().len(), 200);
    }

    #[test]
    fn test_uncommitted_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.series");

        {
            let mut store = DocStore::open(&path, OpenMode::Create, config()).unwrap();
            let mut batch = WriteBatch::new();
            batch.upsert("a", &b"1"[..]);
            store.commit(&mut batch).unwrap();
        }
        let committed = std::fs::metadata(&path).unwrap().len();
        {
            // A put with no commit, then half of another record
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&Record::put(2, "b", b"2", 0).encode()).unwrap();
            let torn = Record::put(3, "c", b"3", 0).encode();
            f.write_all(&torn[..torn.len() / 2]).unwrap();
        }

        let ro = DocStore::open(&path, OpenMode::ReadOnly, config()).unwrap();
        assert_eq!(ids(&ro, None, None), vec!["a"]);
        drop(ro);

        let rw = DocStore::open(&path, OpenMode::ReadWrite, config()).unwrap();
        assert_eq!(rw.file_size(), committed);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), committed);
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let dir = TempDir::new().unwrap();
        let mut store =
            DocStore::open(dir.path().join("r.series"), OpenMode::Create, config()).unwrap();
        let mut batch = WriteBatch::new();
        for k in ["k1", "k2", "k3", "k4"] {
            batch.upsert(k, &b"{}"[..]);
        }
        store.commit(&mut batch).unwrap();

        assert_eq!(ids(&store, Some("k2"), Some("k3")), vec!["k2", "k3"]);
        assert_eq!(ids(&store, Some("k3"), None), vec!["k3", "k4"]);
        assert!(ids(&store, Some("k4"), Some("k1")).is_empty());

        let mut seen = 0;
        let err = store.visit_range(None, None, |_| {
            seen += 1;
            if seen == 2 {
                Err(SeriesError::Internal("stop".into()))
            } else {
                Ok(())
            }
        });
        assert!(err.is_err());
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_compact_preserves_documents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.series");
        let compacted = dir.path().join("c.series.compact");

        let mut store = DocStore::open(&path, OpenMode::Create, config()).unwrap();
        let mut batch = WriteBatch::new();
        for i in 0..50 {
            batch.upsert(format!("k{:02}", i), format!("{{\"i\":{}}}", i));
        }
        store.commit(&mut batch).unwrap();
        for i in 0..40 {
            batch.delete(format!("k{:02}", i));
        }
        store.commit(&mut batch).unwrap();

        assert_eq!(store.compact_to(&compacted).unwrap(), 10);
        let after = DocStore::open(&compacted, OpenMode::ReadOnly, config()).unwrap();
        assert_eq!(ids(&after, None, None), ids(&store, None, None));
        assert_eq!(after.update_seq(), store.update_seq());
        assert!(after.file_size() < store.file_size());
        let info = after.get("k45").unwrap();
        assert_eq!(&after.fetch_body(info).unwrap()[..], b"{\"i\":45}");
        assert_eq!(after.generation(), store.generation());
    }

    #[test]
    fn test_recreated_file_gets_new_generation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g.series");

        let first = DocStore::open(&path, OpenMode::Create, config()).unwrap().generation();
        assert_eq!(DocReader::open(&path).unwrap().generation(), first);
        std::fs::remove_file(&path).unwrap();

        let second = DocStore::open(&path, OpenMode::Create, config()).unwrap().generation();
        assert_ne!(first, second);
    }

    #[test]
    fn test_shared_reader_outlives_rename_over() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.series");
        let compacted = dir.path().join("s.series.compact");

        let mut store = DocStore::open(&path, OpenMode::Create, config()).unwrap();
        let mut batch = WriteBatch::new();
        for i in 0..10 {
            batch.upsert(format!("k{}", i), format!("{{\"i\":{}}}", i));
        }
        store.commit(&mut batch).unwrap();
        for i in 0..9 {
            batch.delete(format!("k{}", i));
        }
        store.commit(&mut batch).unwrap();
        drop(store);

        let ro = DocStore::open(&path, OpenMode::ReadOnly, config()).unwrap();
        let info = ro.get("k9").unwrap().clone();
        let reader = ro.shared_reader();

        let rw = DocStore::open(&path, OpenMode::ReadWrite, config()).unwrap();
        rw.compact_to(&compacted).unwrap();
        std::fs::rename(&compacted, &path).unwrap();

        // The path now names a file where k9 sits at a different offset
        assert!(DocReader::open(&path).unwrap().fetch_body(&info).is_err());
        assert_eq!(&reader.fetch_body(&info).unwrap()[..], b"{\"i\":9}");
    }
}
