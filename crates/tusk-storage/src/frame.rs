use crate::latch::RwLatch;

/// A buffer frame: one page-sized block of heap memory plus the latch
/// that coordinates access to it.
///
/// Frame identity (which page is loaded), the pin count, and the dirty
/// flag live in the buffer manager's pool state, guarded by the pool
/// mutex. The frame itself only owns the bytes and the content latch.
///
/// # Safety
///
/// `data`/`data_mut` hand out views of memory shared between threads.
/// Callers must guarantee exclusivity through the buffer manager's
/// protocol: either the frame's latch in a compatible mode, or sole
/// ownership of the frame (off every queue, no page-table entry, pin
/// count zero) during a load or write-back.
pub struct Frame {
    buf: *mut u8,
    len: usize,
    latch: RwLatch,
}

// All access to `buf` is coordinated by the latch and the pool protocol.
unsafe impl Send for Frame {}
unsafe impl Sync for Frame {}

impl Frame {
    /// Allocate a zeroed frame of `page_size` bytes, aligned to 8 so page
    /// contents can be reinterpreted as 8-byte words by clients.
    pub fn new(page_size: usize) -> Self {
        let layout = Self::layout(page_size);
        // SAFETY: layout has non-zero size (validated by BufferConfig) and
        // power-of-two alignment.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        if buf.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        Self {
            buf,
            len: page_size,
            latch: RwLatch::new(),
        }
    }

    fn layout(page_size: usize) -> std::alloc::Layout {
        std::alloc::Layout::from_size_align(page_size, 8).expect("invalid page layout")
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn latch(&self) -> &RwLatch {
        &self.latch
    }

    /// Shared view of the page bytes.
    ///
    /// # Safety
    ///
    /// Caller must hold the latch (either mode) or otherwise exclude
    /// concurrent writers per the type-level contract.
    pub unsafe fn data(&self) -> &[u8] {
        // SAFETY: buf is valid for len bytes for the lifetime of the frame.
        unsafe { std::slice::from_raw_parts(self.buf, self.len) }
    }

    /// Exclusive view of the page bytes. The `&self` receiver is
    /// intentional: the frame is interior-mutable, coordinated by the
    /// latch rather than the borrow checker.
    ///
    /// # Safety
    ///
    /// Caller must hold the latch exclusively or have sole ownership of
    /// the frame during a load.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        // SAFETY: buf is valid for len bytes; exclusivity is the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.buf, self.len) }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        // SAFETY: buf was allocated in `new` with this exact layout.
        unsafe {
            std::alloc::dealloc(self.buf, Self::layout(self.len));
        }
    }
}
