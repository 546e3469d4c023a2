//! Snapshot framing and checkpoint lifecycle
//!
//! A snapshot travels as a flat stream of framed files:
//!
//! ```text
//! '$' | size: u64 BE | name len: u16 BE | name | '\n' | payload[size]
//! ```
//!
//! File names are relative paths whose first segment is the decimal
//! update index of the snapshot, so the consumer can recover the index
//! from the stream itself. One snapshot directory is retained at a time;
//! taking a new one retires the previous.

use std::fs;
use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{MagnetiteError, Result};
use crate::store::{MetaStore, SlotStore};

const START_MARKER: u8 = b'$';
const END_MARKER: u8 = b'\n';
const COPY_BUF: usize = 2048;

/// Header of one framed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub name: String,
    pub size: u64,
}

impl SnapshotFile {
    /// Bytes the header occupies on the wire
    pub fn header_len(&self) -> usize {
        1 + 8 + 2 + self.name.len() + 1
    }

    pub fn write_header(&self, w: &mut impl Write) -> Result<()> {
        let name_len = u16::try_from(self.name.len()).map_err(|_| {
            MagnetiteError::SnapshotHeader(format!("file name too long: {} bytes", self.name.len()))
        })?;
        w.write_all(&[START_MARKER])?;
        w.write_all(&self.size.to_be_bytes())?;
        w.write_all(&name_len.to_be_bytes())?;
        w.write_all(self.name.as_bytes())?;
        w.write_all(&[END_MARKER])?;
        Ok(())
    }

    /// Read the next header off the stream. `Ok(None)` means the stream
    /// ended cleanly before another frame started.
    pub fn read_header(r: &mut impl BufRead) -> Result<Option<SnapshotFile>> {
        let mut start = [0u8; 1];
        match r.read_exact(&mut start) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if start[0] != START_MARKER {
            return Err(MagnetiteError::SnapshotHeader(format!(
                "bad start marker: 0x{:02x}",
                start[0]
            )));
        }

        let mut size_buf = [0u8; 8];
        r.read_exact(&mut size_buf)?;
        let size = u64::from_be_bytes(size_buf);

        let mut len_buf = [0u8; 2];
        r.read_exact(&mut len_buf)?;
        let name_len = u16::from_be_bytes(len_buf) as usize;
        if name_len == 0 {
            return Err(MagnetiteError::SnapshotHeader(
                "zero-length file name".to_string(),
            ));
        }

        let mut name_buf = vec![0u8; name_len];
        r.read_exact(&mut name_buf)?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| MagnetiteError::SnapshotHeader("file name not UTF-8".to_string()))?;

        let mut end = [0u8; 1];
        r.read_exact(&mut end)?;
        if end[0] != END_MARKER {
            return Err(MagnetiteError::SnapshotHeader(format!(
                "bad end marker: 0x{:02x}",
                end[0]
            )));
        }

        Ok(Some(SnapshotFile { name, size }))
    }
}

fn copy_payload(r: &mut impl Read, w: &mut impl Write, size: u64) -> Result<u64> {
    let mut buf = [0u8; COPY_BUF];
    let mut copied = 0u64;
    while copied < size {
        let want = (size - copied).min(COPY_BUF as u64) as usize;
        let n = r.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n])?;
        copied += n as u64;
    }
    Ok(copied)
}

fn receive_file(r: &mut impl Read, base: &Path, file: &SnapshotFile) -> Result<()> {
    let path = base.join(&file.name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = fs::File::create(&path)?;
    let copied = copy_payload(r, &mut out, file.size)?;
    if copied != file.size {
        return Err(MagnetiteError::SnapshotSize {
            name: file.name.clone(),
            expected: file.size,
            actual: copied,
        });
    }
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<io::Result<_>>()?;
    children.sort();
    for child in children {
        if child.is_dir() {
            collect_files(&child, out)?;
        } else {
            out.push(child);
        }
    }
    Ok(())
}

/// Stream every file under the snapshot directory, framed, onto `w`.
/// Names are emitted relative to the directory's parent so the snapshot's
/// update index leads each name.
pub fn save_snapshot(dir: &Path, w: &mut impl Write) -> Result<()> {
    let parent = dir.parent().ok_or_else(|| {
        MagnetiteError::SnapshotHeader("snapshot directory has no parent".to_string())
    })?;
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;

    for path in files {
        let rel = path.strip_prefix(parent).map_err(|e| {
            MagnetiteError::Internal(format!("snapshot path outside base: {e}"))
        })?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = fs::metadata(&path)?.len();
        let header = SnapshotFile { name, size };
        header.write_header(w)?;

        let mut f = fs::File::open(&path)?;
        let copied = copy_payload(&mut f, w, size)?;
        if copied != size {
            return Err(MagnetiteError::SnapshotSize {
                name: header.name,
                expected: size,
                actual: copied,
            });
        }
    }
    w.flush()?;
    Ok(())
}

/// Rebuild a framed snapshot stream under the dbsync scratch directory.
/// Returns the scratch directory and the stream's update index.
pub fn recover_snapshot(r: &mut impl BufRead, dbsync_path: &Path) -> Result<(PathBuf, u64)> {
    if dbsync_path.exists() {
        fs::remove_dir_all(dbsync_path)?;
    }
    fs::create_dir_all(dbsync_path)?;

    let mut last_name: Option<String> = None;
    let mut files = 0usize;
    while let Some(file) = SnapshotFile::read_header(r)? {
        receive_file(r, dbsync_path, &file)?;
        files += 1;
        last_name = Some(file.name);
    }

    let name = last_name.ok_or_else(|| {
        MagnetiteError::SnapshotHeader("snapshot stream carried no files".to_string())
    })?;
    let index = name
        .split('/')
        .next()
        .and_then(|seg| seg.parse::<u64>().ok())
        .ok_or_else(|| {
            MagnetiteError::SnapshotHeader(format!("no update index in file name '{name}'"))
        })?;

    info!(files, index, path = %dbsync_path.display(), "snapshot received");
    Ok((dbsync_path.to_path_buf(), index))
}

/// A checkpointed snapshot on disk.
#[derive(Debug, Clone)]
pub struct SnapshotDetail {
    pub dir: PathBuf,
    pub update_index: u64,
}

impl SnapshotDetail {
    /// Remove the snapshot directory.
    pub fn clean(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Checkpoint the engine and metadata into `snapshot_path/<update index>`,
/// retiring the previously retained snapshot directory.
pub fn do_snapshot(
    store: &dyn SlotStore,
    meta: &dyn MetaStore,
    snapshot_path: &Path,
) -> Result<SnapshotDetail> {
    let index = meta.update_index();
    let dir = snapshot_path.join(index.to_string());

    let previous = meta.set_snapshot_index(index);
    if previous != 0 && previous != index {
        let old = snapshot_path.join(previous.to_string());
        if old.exists() {
            if let Err(e) = fs::remove_dir_all(&old) {
                warn!(path = %old.display(), error = %e, "failed to retire previous snapshot");
            }
        }
    }

    if dir.exists() {
        fs::remove_dir_all(&dir)?;
    }
    fs::create_dir_all(&dir)?;

    store.checkpoint(&dir)?;
    meta.checkpoint(&dir)?;

    info!(index, path = %dir.display(), "snapshot checkpointed");
    Ok(SnapshotDetail {
        dir,
        update_index: index,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::store::{MemoryMeta, MemoryStore, SlotStore};
    use bytes::Bytes;
    use std::io::Cursor;

    fn frame(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        SnapshotFile {
            name: name.to_string(),
            size: payload.len() as u64,
        }
        .write_header(&mut buf)
        .unwrap();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_header_roundtrip() {
        let header = SnapshotFile {
            name: "12/data.json".to_string(),
            size: 77,
        };
        let mut buf = Vec::new();
        header.write_header(&mut buf).unwrap();
        assert_eq!(buf.len(), header.header_len());
        assert_eq!(buf[0], b'$');
        assert_eq!(*buf.last().unwrap(), b'\n');

        let parsed = SnapshotFile::read_header(&mut Cursor::new(buf)).unwrap().unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_empty_stream_is_end() {
        assert!(SnapshotFile::read_header(&mut Cursor::new(Vec::new()))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bad_markers_rejected() {
        let mut buf = frame("1/f", b"x");
        buf[0] = b'#';
        assert!(matches!(
            SnapshotFile::read_header(&mut Cursor::new(buf)),
            Err(MagnetiteError::SnapshotHeader(_))
        ));

        let mut buf = frame("1/f", b"x");
        let end = 1 + 8 + 2 + 3;
        buf[end] = b'#';
        assert!(matches!(
            SnapshotFile::read_header(&mut Cursor::new(buf)),
            Err(MagnetiteError::SnapshotHeader(_))
        ));
    }

    #[test]
    fn test_zero_length_name_rejected() {
        let mut buf = vec![b'$'];
        buf.extend_from_slice(&0u64.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.push(b'\n');
        assert!(matches!(
            SnapshotFile::read_header(&mut Cursor::new(buf)),
            Err(MagnetiteError::SnapshotHeader(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_size_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stream = frame("3/data", b"full payload");
        stream.truncate(stream.len() - 4);
        let err = recover_snapshot(&mut Cursor::new(stream), &tmp.path().join("dbsync"))
            .unwrap_err();
        assert!(matches!(err, MagnetiteError::SnapshotSize { .. }));
    }

    #[test]
    fn test_stream_roundtrip_recovers_files_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        let snap_dir = tmp.path().join("57");
        fs::create_dir_all(snap_dir.join("sub")).unwrap();
        fs::write(snap_dir.join("data.json"), b"engine state").unwrap();
        fs::write(snap_dir.join("sub/meta.json"), b"meta state").unwrap();

        let mut stream = Vec::new();
        save_snapshot(&snap_dir, &mut stream).unwrap();

        let scratch = tmp.path().join("dbsync");
        let (dir, index) = recover_snapshot(&mut Cursor::new(stream), &scratch).unwrap();
        assert_eq!(index, 57);
        assert_eq!(dir, scratch);
        assert_eq!(fs::read(scratch.join("57/data.json")).unwrap(), b"engine state");
        assert_eq!(
            fs::read(scratch.join("57/sub/meta.json")).unwrap(),
            b"meta state"
        );
    }

    #[test]
    fn test_recover_replaces_stale_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("dbsync");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("leftover"), b"old").unwrap();

        let stream = frame("8/f", b"x");
        recover_snapshot(&mut Cursor::new(stream), &scratch).unwrap();
        assert!(!scratch.join("leftover").exists());
        assert_eq!(fs::read(scratch.join("8/f")).unwrap(), b"x");
    }

    #[test]
    fn test_empty_stream_has_no_index() {
        let tmp = tempfile::tempdir().unwrap();
        let err = recover_snapshot(&mut Cursor::new(Vec::new()), &tmp.path().join("d"))
            .unwrap_err();
        assert!(matches!(err, MagnetiteError::SnapshotHeader(_)));
    }

    #[test]
    fn test_do_snapshot_checkpoints_and_retires_previous() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .string_set(b"k", 7, Bytes::from_static(b"v"))
            .unwrap();
        let meta = MemoryMeta::new();
        meta.set_update_index(4);

        let first = do_snapshot(&store, &meta, tmp.path()).unwrap();
        assert_eq!(first.update_index, 4);
        assert!(first.dir.join("data.json").exists());
        assert!(first.dir.join("meta.json").exists());

        meta.set_update_index(9);
        let second = do_snapshot(&store, &meta, tmp.path()).unwrap();
        assert_eq!(second.update_index, 9);
        assert!(second.dir.exists());
        assert!(!first.dir.exists(), "previous snapshot must be retired");

        second.clean().unwrap();
        assert!(!second.dir.exists());
    }

    #[test]
    fn test_full_cycle_snapshot_then_sync() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        store
            .string_set(b"k", 7, Bytes::from_static(b"v"))
            .unwrap();
        let meta = MemoryMeta::new();
        meta.set_update_index(21);

        let detail = do_snapshot(&store, &meta, &tmp.path().join("snapshot")).unwrap();
        let mut stream = Vec::new();
        save_snapshot(&detail.dir, &mut stream).unwrap();

        let scratch = tmp.path().join("dbsync");
        let (_, index) = recover_snapshot(&mut Cursor::new(stream), &scratch).unwrap();
        assert_eq!(index, 21);
        assert!(scratch.join("21/data.json").exists());
    }
}
