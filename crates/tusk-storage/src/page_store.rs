use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tusk_common::TuskResult;

use crate::page_id::PageId;

/// Seam between the buffer manager and the block device.
///
/// Implementations:
/// - `SegmentStore`: segment files on the filesystem
/// - `MockPageStore`: in-memory store for testing
///
/// Buffers are always exactly one page long. Pages are addressed, never
/// allocated: reading a page that was never written yields zeros.
pub trait PageStore: Send + Sync {
    /// Read a page into `buf`.
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> TuskResult<()>;

    /// Write a page from `buf`.
    fn write_page(&self, page_id: PageId, buf: &[u8]) -> TuskResult<()>;
}

// Lets callers hand the manager a store they keep a handle to.
impl<S: PageStore> PageStore for std::sync::Arc<S> {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> TuskResult<()> {
        (**self).read_page(page_id, buf)
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> TuskResult<()> {
        (**self).write_page(page_id, buf)
    }
}

/// In-memory page store for tests. Counts physical reads and writes so
/// tests can assert how many times the manager actually touched "disk".
pub struct MockPageStore {
    page_size: usize,
    pages: Mutex<HashMap<u64, Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MockPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of `read_page` calls so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `write_page` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of distinct pages ever written.
    pub fn page_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    /// Stored bytes of a page, if it was ever written.
    pub fn stored(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.pages.lock().unwrap().get(&page_id.to_u64()).cloned()
    }
}

impl PageStore for MockPageStore {
    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> TuskResult<()> {
        assert_eq!(buf.len(), self.page_size);
        self.reads.fetch_add(1, Ordering::SeqCst);
        let pages = self.pages.lock().unwrap();
        if let Some(data) = pages.get(&page_id.to_u64()) {
            buf.copy_from_slice(data);
        } else {
            // Never-written pages are logically zero.
            buf.fill(0);
        }
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> TuskResult<()> {
        assert_eq!(buf.len(), self.page_size);
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .insert(page_id.to_u64(), buf.to_vec());
        Ok(())
    }
}
