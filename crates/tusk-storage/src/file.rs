use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hashbrown::HashMap;
use tusk_common::{TuskError, TuskResult};

use crate::page_id::PageId;
use crate::page_store::PageStore;

/// One open segment file, named by the decimal rendering of its segment
/// id. Exposes positional block I/O; all page-addressing policy lives in
/// `SegmentStore`.
pub struct SegmentFile {
    file: File,
}

impl SegmentFile {
    /// Open (or create) the segment file for `segment_id` under `dir`.
    /// Opening never truncates: existing segment data is served as-is.
    pub fn open(dir: &Path, segment_id: u16) -> std::io::Result<Self> {
        let path = dir.join(segment_id.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Fill `dst[..len]` from the file at `offset`. Ranges past the end of
    /// the file read as zeros: pages that were never written are logically
    /// zero-filled.
    pub fn read_block(&mut self, offset: u64, len: usize, dst: &mut [u8]) -> std::io::Result<()> {
        let dst = &mut dst[..len];
        let file_len = self.file.metadata()?.len();

        if offset >= file_len {
            dst.fill(0);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let available = (file_len - offset) as usize;
        if available < len {
            // Tail of the block lies past EOF.
            dst.fill(0);
            self.file.read_exact(&mut dst[..available])?;
        } else {
            self.file.read_exact(dst)?;
        }
        Ok(())
    }

    /// Write `src[..len]` at `offset`, extending the file (zero-filled)
    /// when the offset lies past the current end.
    pub fn write_block(&mut self, src: &[u8], offset: u64, len: usize) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&src[..len])
    }

    /// Flush file contents to durable storage.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

/// Filesystem-backed page store over segment files.
///
/// The high 16 bits of a page id select the segment file; the low 48 bits
/// are the page number within it, at byte offset `page_number * page_size`.
/// Open files are cached per segment id.
pub struct SegmentStore {
    root: PathBuf,
    page_size: usize,
    files: Mutex<HashMap<u16, SegmentFile>>,
}

impl SegmentStore {
    /// Create a segment store rooted at `root`, creating the directory if
    /// it does not exist.
    pub fn new(root: impl AsRef<Path>, page_size: usize) -> TuskResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| {
                TuskError::Storage(format!(
                    "failed to create segment directory {}: {e}",
                    root.display()
                ))
            })?;
        }
        Ok(Self {
            root,
            page_size,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the segment file for `segment_id`.
    pub fn segment_path(&self, segment_id: u16) -> PathBuf {
        self.root.join(segment_id.to_string())
    }

    fn byte_offset(&self, page_id: PageId) -> TuskResult<u64> {
        page_id.offset(self.page_size).ok_or_else(|| {
            TuskError::InvalidArgument(format!("page offset overflows u64 for page {page_id}"))
        })
    }

    fn with_file<R>(
        &self,
        page_id: PageId,
        op: impl FnOnce(&mut SegmentFile) -> std::io::Result<R>,
    ) -> TuskResult<R> {
        let segment_id = page_id.segment_id();
        let mut files = self.files.lock().unwrap();
        if !files.contains_key(&segment_id) {
            let file = SegmentFile::open(&self.root, segment_id).map_err(|e| {
                TuskError::Storage(format!("failed to open segment {segment_id}: {e}"))
            })?;
            files.insert(segment_id, file);
        }
        op(files.get_mut(&segment_id).unwrap()).map_err(|source| TuskError::PageIo {
            page_id: page_id.to_u64(),
            source,
        })
    }
}

impl PageStore for SegmentStore {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> TuskResult<()> {
        assert_eq!(buf.len(), self.page_size);
        let offset = self.byte_offset(page_id)?;
        self.with_file(page_id, |f| f.read_block(offset, buf.len(), buf))
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> TuskResult<()> {
        assert_eq!(buf.len(), self.page_size);
        let offset = self.byte_offset(page_id)?;
        self.with_file(page_id, |f| f.write_block(buf, offset, buf.len()))
    }
}
