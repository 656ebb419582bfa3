use std::sync::{Condvar, Mutex, MutexGuard};

use hashbrown::HashMap;
use tusk_common::{BufferConfig, TuskError, TuskResult};

use crate::file::SegmentStore;
use crate::frame::Frame;
use crate::page_id::{FrameIdx, PageId};
use crate::page_store::PageStore;
use crate::queue::{QueueKind, ReplacementQueues};

/// Buffer manager: a bounded pool of page frames over a `PageStore`.
///
/// Pages are loaded on demand and cached under a two-queue policy: a miss
/// admits the page to the probationary FIFO queue, a second reference
/// promotes it to the protected LRU queue, and victims are taken from the
/// queue heads, clean frames before dirty ones. Fixed (pinned) pages are
/// never evicted.
///
/// Concurrency model: one pool mutex guards the page table, both queues,
/// the free list, and all frame metadata; critical sections are short and
/// do no I/O. Page contents are guarded by a per-frame reader/writer
/// latch held for the lifetime of a fix. Loads and write-backs run with
/// the pool mutex released; a `Busy` page-table entry stands in for the
/// page meanwhile, and threads that encounter one wait on a condvar
/// instead of starting a second load.
pub struct BufferManager {
    page_size: usize,
    page_count: usize,
    /// Frame arena: buffers and latches, stable for the manager lifetime.
    frames: Vec<Frame>,
    store: Box<dyn PageStore>,
    pool: Mutex<PoolState>,
    /// Signaled whenever a `Busy` table entry resolves.
    resolved: Condvar,
}

/// Residency state of a page-table entry.
enum Slot {
    Resident(FrameIdx),
    /// The page is being read in, or its frame is being written back
    /// prior to eviction. Fixes wait for the entry to resolve.
    Busy,
}

/// Per-frame metadata. Guarded by the pool mutex, never by the frame
/// latch.
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    dirty: bool,
}

struct PoolState {
    table: HashMap<PageId, Slot>,
    meta: Vec<FrameMeta>,
    queues: ReplacementQueues,
    free: Vec<FrameIdx>,
    hits: u64,
    misses: u64,
}

/// Counters snapshot for diagnostics.
#[derive(Clone, Debug)]
pub struct BufferManagerStats {
    pub page_count: usize,
    pub resident: usize,
    pub fifo_len: usize,
    pub lru_len: usize,
    pub dirty: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
}

impl BufferManager {
    /// Create a manager over segment files in `config.directory`.
    pub fn new(config: &BufferConfig) -> TuskResult<Self> {
        config.validate()?;
        let store = SegmentStore::new(&config.directory, config.page_size)?;
        Self::with_store(config, Box::new(store))
    }

    /// Create a manager over an arbitrary page store.
    pub fn with_store(config: &BufferConfig, store: Box<dyn PageStore>) -> TuskResult<Self> {
        config.validate()?;
        let page_count = config.page_count;
        let frames = (0..page_count)
            .map(|_| Frame::new(config.page_size))
            .collect();
        let meta = (0..page_count)
            .map(|_| FrameMeta {
                page_id: PageId::INVALID,
                pin_count: 0,
                dirty: false,
            })
            .collect();
        // Reversed so the lowest indices are handed out first.
        let free = (0..page_count as u32).rev().map(FrameIdx).collect();

        Ok(Self {
            page_size: config.page_size,
            page_count,
            frames,
            store,
            pool: Mutex::new(PoolState {
                table: HashMap::with_capacity(page_count),
                meta,
                queues: ReplacementQueues::new(page_count),
                free,
                hits: 0,
                misses: 0,
            }),
            resolved: Condvar::new(),
        })
    }

    /// Segment id of a raw page id: its 16 most significant bits.
    pub const fn segment_id(page_id: u64) -> u16 {
        PageId::from_u64(page_id).segment_id()
    }

    /// Page number of a raw page id within its segment: the 48 least
    /// significant bits.
    pub const fn segment_page_id(page_id: u64) -> u64 {
        PageId::from_u64(page_id).segment_page()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Fix a page: load it if absent, pin it, and lock its contents in
    /// the requested mode. The returned handle keeps the page resident
    /// until it is unfixed.
    ///
    /// Blocks while another fix holds the page latch incompatibly; a
    /// thread re-fixing a page it already holds exclusively deadlocks
    /// against itself, like any reader/writer lock.
    ///
    /// Fails with `BufferFull` when every frame is pinned, or with an I/O
    /// error from the store (in which case the pool is left as it was).
    pub fn fix_page(&self, page_id: PageId, exclusive: bool) -> TuskResult<PageHandle<'_>> {
        let idx = self
            .pin_page(page_id, true)?
            .expect("waiting pin cannot be declined");
        let latch = self.frames[idx.as_usize()].latch();
        if exclusive {
            latch.lock_exclusive();
        } else {
            latch.lock_shared();
        }
        Ok(PageHandle {
            manager: self,
            idx,
            page_id,
            exclusive,
            mark_dirty: false,
        })
    }

    /// Non-blocking variant of `fix_page`: returns `Ok(None)` instead of
    /// waiting when the page is mid-load or its latch is held
    /// incompatibly. A miss still performs the load.
    pub fn try_fix_page(
        &self,
        page_id: PageId,
        exclusive: bool,
    ) -> TuskResult<Option<PageHandle<'_>>> {
        let Some(idx) = self.pin_page(page_id, false)? else {
            return Ok(None);
        };
        let latch = self.frames[idx.as_usize()].latch();
        let acquired = if exclusive {
            latch.try_lock_exclusive()
        } else {
            latch.try_lock_shared()
        };
        if !acquired {
            let mut pool = self.pool.lock().unwrap();
            pool.meta[idx.as_usize()].pin_count -= 1;
            return Ok(None);
        }
        Ok(Some(PageHandle {
            manager: self,
            idx,
            page_id,
            exclusive,
            mark_dirty: false,
        }))
    }

    /// Unfix a page: release the content latch and the pin, folding
    /// `mark_dirty` into the frame's dirty flag (dirty is sticky until a
    /// successful write-back).
    ///
    /// Panics if the handle belongs to a different manager.
    pub fn unfix_page(&self, mut handle: PageHandle<'_>, mark_dirty: bool) {
        assert!(
            std::ptr::eq(self, handle.manager),
            "unfix_page: handle does not belong to this buffer manager"
        );
        handle.mark_dirty |= mark_dirty;
        // Drop releases the latch and the pin.
    }

    /// Write every dirty resident page back to the store without
    /// evicting anything. Returns the first error, after attempting all
    /// pages.
    pub fn flush_all(&self) -> TuskResult<()> {
        let dirty: Vec<(FrameIdx, PageId)> = {
            let mut pool = self.pool.lock().unwrap();
            let state = &*pool;
            let mut collected = Vec::new();
            for kind in [QueueKind::Fifo, QueueKind::Lru] {
                for idx in state.queues.iter(kind) {
                    let m = &state.meta[idx.as_usize()];
                    if m.dirty {
                        collected.push((idx, m.page_id));
                    }
                }
            }
            // Pin them all so none is evicted before its write.
            for &(idx, _) in &collected {
                pool.meta[idx.as_usize()].pin_count += 1;
            }
            collected
        };

        let mut first_err = None;
        for (idx, page_id) in dirty {
            // Clear the flag before writing so a concurrent re-dirty is
            // not lost when we would otherwise clear it afterwards.
            {
                let mut pool = self.pool.lock().unwrap();
                pool.meta[idx.as_usize()].dirty = false;
            }

            let frame = &self.frames[idx.as_usize()];
            frame.latch().lock_shared();
            // SAFETY: shared latch held; writers are excluded.
            let res = self.store.write_page(page_id, unsafe { frame.data() });
            frame.latch().unlock_shared();

            let mut pool = self.pool.lock().unwrap();
            if res.is_err() {
                pool.meta[idx.as_usize()].dirty = true;
            }
            pool.meta[idx.as_usize()].pin_count -= 1;
            if let Err(e) = res {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Page ids currently in the FIFO queue, oldest first. Diagnostic;
    /// meaningful only in quiescent states.
    pub fn fifo_list(&self) -> Vec<PageId> {
        self.queue_list(QueueKind::Fifo)
    }

    /// Page ids currently in the LRU queue, least recently used first.
    /// Diagnostic; meaningful only in quiescent states.
    pub fn lru_list(&self) -> Vec<PageId> {
        self.queue_list(QueueKind::Lru)
    }

    fn queue_list(&self, kind: QueueKind) -> Vec<PageId> {
        let pool = self.pool.lock().unwrap();
        pool.queues
            .iter(kind)
            .map(|idx| pool.meta[idx.as_usize()].page_id)
            .collect()
    }

    pub fn stats(&self) -> BufferManagerStats {
        let pool = self.pool.lock().unwrap();
        BufferManagerStats {
            page_count: self.page_count,
            resident: pool.queues.total_len(),
            fifo_len: pool.queues.len(QueueKind::Fifo),
            lru_len: pool.queues.len(QueueKind::Lru),
            dirty: pool.meta.iter().filter(|m| m.dirty).count(),
            pinned: pool.meta.iter().filter(|m| m.pin_count > 0).count(),
            hits: pool.hits,
            misses: pool.misses,
        }
    }

    /// Resolve `page_id` to a pinned frame, loading and evicting as
    /// needed. Returns `Ok(None)` only when `wait_on_busy` is false and
    /// the page is mid-load or mid-eviction.
    fn pin_page(&self, page_id: PageId, wait_on_busy: bool) -> TuskResult<Option<FrameIdx>> {
        let mut pool = self.pool.lock().unwrap();
        loop {
            match pool.table.get(&page_id) {
                Some(Slot::Resident(idx)) => {
                    let idx = *idx;
                    pool.hits += 1;
                    return self.touch_resident(pool, idx).map(Some);
                }
                Some(Slot::Busy) => {
                    if !wait_on_busy {
                        return Ok(None);
                    }
                    pool = self.resolved.wait(pool).unwrap();
                }
                None => break,
            }
        }

        pool.misses += 1;
        if let Some(idx) = pool.free.pop() {
            self.load_into_free(pool, idx, page_id).map(Some)
        } else {
            self.load_with_eviction(pool, page_id).map(Some)
        }
    }

    /// Hit path: apply the 2Q touch policy and take a pin.
    fn touch_resident(
        &self,
        mut pool: MutexGuard<'_, PoolState>,
        idx: FrameIdx,
    ) -> TuskResult<FrameIdx> {
        match pool.queues.queue_of(idx) {
            // Re-reference in LRU refreshes recency.
            Some(QueueKind::Lru) => {
                pool.queues.move_to_tail(idx);
                pool.meta[idx.as_usize()].pin_count += 1;
                Ok(idx)
            }
            // Second touch promotes out of the probationary queue.
            Some(QueueKind::Fifo) if pool.queues.total_len() < self.page_count => {
                pool.queues.unlink(idx);
                pool.queues.push_tail(QueueKind::Lru, idx);
                pool.meta[idx.as_usize()].pin_count += 1;
                Ok(idx)
            }
            Some(QueueKind::Fifo) => self.promote_with_eviction(pool, idx),
            None => unreachable!("resident frame is not enqueued"),
        }
    }

    /// Promotion with a full pool: free an LRU slot first, then promote.
    fn promote_with_eviction(
        &self,
        mut pool: MutexGuard<'_, PoolState>,
        idx: FrameIdx,
    ) -> TuskResult<FrameIdx> {
        let Some(victim) = select_victim(&pool, &[QueueKind::Lru]) else {
            // No unpinned LRU frame. A hit needs no slot, so serve it
            // from FIFO unpromoted; promotion is retried on the next
            // re-reference.
            pool.meta[idx.as_usize()].pin_count += 1;
            return Ok(idx);
        };

        let vmeta = &pool.meta[victim.as_usize()];
        let (victim_pid, victim_dirty) = (vmeta.page_id, vmeta.dirty);

        if !victim_dirty {
            pool.release_victim(victim);
            pool.queues.unlink(idx);
            pool.queues.push_tail(QueueKind::Lru, idx);
            pool.meta[idx.as_usize()].pin_count += 1;
            return Ok(idx);
        }

        // Dirty victim: write it back outside the pool mutex. Pin the
        // requested frame so no concurrent miss can evict it meanwhile;
        // the victim is unlinked and marked Busy so fixes of it wait.
        pool.meta[idx.as_usize()].pin_count += 1;
        pool.queues.unlink(victim);
        pool.table.insert(victim_pid, Slot::Busy);
        drop(pool);

        // SAFETY: the victim is unpinned, off both queues, and Busy in
        // the table; no other thread can latch or repurpose its frame.
        let res = self
            .store
            .write_page(victim_pid, unsafe { self.frames[victim.as_usize()].data() });

        let mut pool = self.pool.lock().unwrap();
        match res {
            Ok(()) => {
                pool.table.remove(&victim_pid);
                pool.reset_meta(victim);
                pool.free.push(victim);
                // Another fix may have promoted the page while we wrote.
                match pool.queues.queue_of(idx) {
                    Some(QueueKind::Fifo) => {
                        pool.queues.unlink(idx);
                        pool.queues.push_tail(QueueKind::Lru, idx);
                    }
                    Some(QueueKind::Lru) => pool.queues.move_to_tail(idx),
                    None => unreachable!("pinned frame left the queues"),
                }
                self.resolved.notify_all();
                Ok(idx)
            }
            Err(e) => {
                // Write-back failed: the victim keeps its dirty contents
                // and returns to the LRU as prime eviction candidate; the
                // fix that needed the slot fails.
                pool.table.insert(victim_pid, Slot::Resident(victim));
                pool.queues.push_head(QueueKind::Lru, victim);
                pool.meta[idx.as_usize()].pin_count -= 1;
                self.resolved.notify_all();
                Err(e)
            }
        }
    }

    /// Miss with a free frame: load the page and admit it to FIFO.
    fn load_into_free(
        &self,
        mut pool: MutexGuard<'_, PoolState>,
        idx: FrameIdx,
        page_id: PageId,
    ) -> TuskResult<FrameIdx> {
        pool.table.insert(page_id, Slot::Busy);
        drop(pool);

        // SAFETY: the frame came off the free list and the page id is
        // Busy; this thread is the frame's sole user.
        let res = self
            .store
            .read_page(page_id, unsafe { self.frames[idx.as_usize()].data_mut() });

        let mut pool = self.pool.lock().unwrap();
        match res {
            Ok(()) => {
                let m = &mut pool.meta[idx.as_usize()];
                m.page_id = page_id;
                m.pin_count = 1;
                m.dirty = false;
                pool.queues.push_tail(QueueKind::Fifo, idx);
                pool.table.insert(page_id, Slot::Resident(idx));
                self.resolved.notify_all();
                Ok(idx)
            }
            Err(e) => {
                pool.table.remove(&page_id);
                pool.free.push(idx);
                self.resolved.notify_all();
                Err(e)
            }
        }
    }

    /// Miss with a full pool: evict a victim, then load into its frame.
    fn load_with_eviction(
        &self,
        mut pool: MutexGuard<'_, PoolState>,
        page_id: PageId,
    ) -> TuskResult<FrameIdx> {
        let Some(victim) = select_victim(&pool, &[QueueKind::Fifo, QueueKind::Lru]) else {
            return Err(TuskError::BufferFull);
        };
        let victim_queue = pool.queues.queue_of(victim).unwrap();
        let vmeta = &pool.meta[victim.as_usize()];
        let (victim_pid, victim_dirty) = (vmeta.page_id, vmeta.dirty);

        pool.queues.unlink(victim);
        if victim_dirty {
            // Keep fixes of the victim id waiting until its contents are
            // durable; a concurrent reload before the write-back would
            // see stale bytes on disk.
            pool.table.insert(victim_pid, Slot::Busy);
        } else {
            pool.table.remove(&victim_pid);
        }
        pool.table.insert(page_id, Slot::Busy);
        drop(pool);

        let frame = &self.frames[victim.as_usize()];
        if victim_dirty {
            // SAFETY: the victim is unpinned, dequeued, and Busy; this
            // thread is its sole user.
            if let Err(e) = self.store.write_page(victim_pid, unsafe { frame.data() }) {
                // The victim's slot is not repurposed on a failed
                // write-back; it returns to the head of its queue.
                let mut pool = self.pool.lock().unwrap();
                pool.table.insert(victim_pid, Slot::Resident(victim));
                pool.queues.push_head(victim_queue, victim);
                pool.table.remove(&page_id);
                self.resolved.notify_all();
                return Err(e);
            }
        }

        // SAFETY: same exclusivity argument as above.
        let res = self.store.read_page(page_id, unsafe { frame.data_mut() });

        let mut pool = self.pool.lock().unwrap();
        if victim_dirty {
            pool.table.remove(&victim_pid);
        }
        match res {
            Ok(()) => {
                let m = &mut pool.meta[victim.as_usize()];
                m.page_id = page_id;
                m.pin_count = 1;
                m.dirty = false;
                pool.queues.push_tail(QueueKind::Fifo, victim);
                pool.table.insert(page_id, Slot::Resident(victim));
                self.resolved.notify_all();
                Ok(victim)
            }
            Err(e) => {
                // The read failed after the victim's eviction completed;
                // the frame joins the free list and the fix fails.
                pool.reset_meta(victim);
                pool.table.remove(&page_id);
                pool.free.push(victim);
                self.resolved.notify_all();
                Err(e)
            }
        }
    }

}

impl PoolState {
    /// Drop a clean resident victim: off the table, off its queue, onto
    /// the free list.
    fn release_victim(&mut self, victim: FrameIdx) {
        let victim_pid = self.meta[victim.as_usize()].page_id;
        self.queues.unlink(victim);
        self.table.remove(&victim_pid);
        self.reset_meta(victim);
        self.free.push(victim);
    }

    fn reset_meta(&mut self, idx: FrameIdx) {
        let m = &mut self.meta[idx.as_usize()];
        debug_assert_eq!(m.pin_count, 0);
        m.page_id = PageId::INVALID;
        m.dirty = false;
    }
}

/// First unpinned frame in scan order: each queue head-to-tail, clean
/// frames before dirty ones within a queue. Clean victims need no
/// write-back, so a hot read-only workload never stalls behind one.
fn select_victim(pool: &PoolState, queues: &[QueueKind]) -> Option<FrameIdx> {
    for &kind in queues {
        for allow_dirty in [false, true] {
            for idx in pool.queues.iter(kind) {
                let m = &pool.meta[idx.as_usize()];
                if m.pin_count == 0 && (allow_dirty || !m.dirty) {
                    return Some(idx);
                }
            }
        }
    }
    None
}

impl Drop for BufferManager {
    /// Teardown writes every dirty resident page back to the store.
    /// Errors cannot propagate from here; they are logged and the page is
    /// left dirty. Callers that need error reporting use `flush_all`
    /// first.
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap();
        for (i, m) in pool.meta.iter_mut().enumerate() {
            if !m.page_id.is_valid() || !m.dirty {
                continue;
            }
            // SAFETY: &mut self gives exclusive access to every frame.
            let data = unsafe { self.frames[i].data() };
            match self.store.write_page(m.page_id, data) {
                Ok(()) => m.dirty = false,
                Err(e) => {
                    tracing::warn!("teardown write-back failed for page {}: {e}", m.page_id);
                }
            }
        }
    }
}

/// A fixed page: the pin and content latch held by one `fix_page` call.
///
/// `data` is readable in both modes; `data_mut` requires an exclusive
/// fix. Dropping the handle unfixes the page without marking it dirty;
/// `BufferManager::unfix_page` does the same with an explicit dirty bit.
pub struct PageHandle<'bm> {
    manager: &'bm BufferManager,
    idx: FrameIdx,
    page_id: PageId,
    exclusive: bool,
    mark_dirty: bool,
}

impl PageHandle<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// The page bytes.
    pub fn data(&self) -> &[u8] {
        // SAFETY: this fix holds the frame latch; writers are excluded.
        unsafe { self.manager.frames[self.idx.as_usize()].data() }
    }

    /// The page bytes, writable. Panics on a shared fix: mutating through
    /// a shared handle is a programming error.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(self.exclusive, "data_mut on a shared fix");
        // SAFETY: this fix holds the frame latch exclusively.
        unsafe { self.manager.frames[self.idx.as_usize()].data_mut() }
    }

    /// Mark the page dirty when the handle is released, equivalent to
    /// `unfix_page(handle, true)`.
    pub fn mark_dirty(&mut self) {
        self.mark_dirty = true;
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        let frame = &self.manager.frames[self.idx.as_usize()];
        // Release the latch before the pin: a frame must never become
        // evictable while its latch is still held.
        if self.exclusive {
            frame.latch().unlock_exclusive();
        } else {
            frame.latch().unlock_shared();
        }
        let mut pool = self.manager.pool.lock().unwrap();
        let m = &mut pool.meta[self.idx.as_usize()];
        debug_assert!(m.pin_count > 0, "unfix of unpinned frame");
        m.pin_count -= 1;
        m.dirty |= self.mark_dirty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::MockPageStore;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const PAGE_SIZE: usize = 64;

    fn config(page_count: usize) -> BufferConfig {
        BufferConfig {
            page_size: PAGE_SIZE,
            page_count,
            ..Default::default()
        }
    }

    fn make_bm(page_count: usize) -> (BufferManager, Arc<MockPageStore>) {
        let store = Arc::new(MockPageStore::new(PAGE_SIZE));
        let bm = BufferManager::with_store(&config(page_count), Box::new(Arc::clone(&store)))
            .unwrap();
        (bm, store)
    }

    fn pid(n: u64) -> PageId {
        PageId::new(0, n)
    }

    fn raw_list(list: Vec<PageId>) -> Vec<u64> {
        list.into_iter().map(|p| p.segment_page()).collect()
    }

    /// Store wrapper whose reads/writes can be made to fail on demand.
    struct FailingStore {
        inner: Arc<MockPageStore>,
        fail_reads: Arc<AtomicBool>,
        fail_writes: Arc<AtomicBool>,
    }

    impl PageStore for FailingStore {
        fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> TuskResult<()> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(TuskError::PageIo {
                    page_id: page_id.to_u64(),
                    source: std::io::Error::other("injected read failure"),
                });
            }
            self.inner.read_page(page_id, buf)
        }

        fn write_page(&self, page_id: PageId, buf: &[u8]) -> TuskResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TuskError::PageIo {
                    page_id: page_id.to_u64(),
                    source: std::io::Error::other("injected write failure"),
                });
            }
            self.inner.write_page(page_id, buf)
        }
    }

    fn make_failing_bm(
        page_count: usize,
    ) -> (
        BufferManager,
        Arc<MockPageStore>,
        Arc<AtomicBool>,
        Arc<AtomicBool>,
    ) {
        let inner = Arc::new(MockPageStore::new(PAGE_SIZE));
        let fail_reads = Arc::new(AtomicBool::new(false));
        let fail_writes = Arc::new(AtomicBool::new(false));
        let store = FailingStore {
            inner: Arc::clone(&inner),
            fail_reads: Arc::clone(&fail_reads),
            fail_writes: Arc::clone(&fail_writes),
        };
        let bm = BufferManager::with_store(&config(page_count), Box::new(store)).unwrap();
        (bm, inner, fail_reads, fail_writes)
    }

    #[test]
    fn create_manager() {
        let (bm, _) = make_bm(10);
        assert_eq!(bm.page_count(), 10);
        assert_eq!(bm.page_size(), PAGE_SIZE);
        let stats = bm.stats();
        assert_eq!(stats.resident, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn rejects_invalid_config() {
        let store = Box::new(MockPageStore::new(PAGE_SIZE));
        let bad = BufferConfig {
            page_size: PAGE_SIZE,
            page_count: 0,
            ..Default::default()
        };
        assert!(matches!(
            BufferManager::with_store(&bad, store),
            Err(TuskError::InvalidArgument(_))
        ));
    }

    #[test]
    fn raw_id_helpers() {
        let raw = PageId::new(3, 17).to_u64();
        assert_eq!(BufferManager::segment_id(raw), 3);
        assert_eq!(BufferManager::segment_page_id(raw), 17);
    }

    #[test]
    fn first_touch_admits_to_fifo_tail() {
        let (bm, _) = make_bm(10);
        for n in 1..=3 {
            let h = bm.fix_page(pid(n), false).unwrap();
            bm.unfix_page(h, false);
        }
        assert_eq!(raw_list(bm.fifo_list()), vec![1, 2, 3]);
        assert!(bm.lru_list().is_empty());
    }

    #[test]
    fn second_touch_promotes_only_that_page() {
        let (bm, _) = make_bm(10);
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);

        assert_eq!(raw_list(bm.fifo_list()), vec![2]);
        assert_eq!(raw_list(bm.lru_list()), vec![1]);
    }

    #[test]
    fn lru_hit_refreshes_recency() {
        let (bm, _) = make_bm(10);
        for n in [1, 1, 2, 2] {
            bm.unfix_page(bm.fix_page(pid(n), false).unwrap(), false);
        }
        assert_eq!(raw_list(bm.lru_list()), vec![1, 2]);

        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        assert_eq!(raw_list(bm.lru_list()), vec![2, 1]);
    }

    #[test]
    fn eviction_prefers_clean_over_dirty() {
        let (bm, _) = make_bm(2);
        let mut h = bm.fix_page(pid(1), true).unwrap();
        h.data_mut().fill(0xAA);
        bm.unfix_page(h, true);
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);

        // Page 1 (dirty, at the FIFO head) is skipped in favor of clean
        // page 2.
        bm.unfix_page(bm.fix_page(pid(3), false).unwrap(), false);
        assert_eq!(raw_list(bm.fifo_list()), vec![1, 3]);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let (bm, store) = make_bm(1);
        let mut h = bm.fix_page(pid(1), true).unwrap();
        h.data_mut().fill(0xBC);
        bm.unfix_page(h, true);

        // Evicting page 1 must persist it before the frame is reused.
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);
        assert_eq!(store.stored(pid(1)).unwrap(), vec![0xBC; PAGE_SIZE]);
    }

    #[test]
    fn round_trip_through_eviction() {
        let (bm, _) = make_bm(2);
        let mut h = bm.fix_page(pid(1), true).unwrap();
        h.data_mut().copy_from_slice(&[0x42; PAGE_SIZE]);
        bm.unfix_page(h, true);

        // Thrash the pool until page 1 is gone.
        for n in 2..=4 {
            bm.unfix_page(bm.fix_page(pid(n), false).unwrap(), false);
        }
        assert!(!raw_list(bm.fifo_list()).contains(&1));

        let h = bm.fix_page(pid(1), false).unwrap();
        assert_eq!(h.data(), &[0x42; PAGE_SIZE]);
        bm.unfix_page(h, false);
    }

    #[test]
    fn dirty_flag_survives_promotion() {
        let (bm, store) = make_bm(10);
        let mut h = bm.fix_page(pid(1), true).unwrap();
        h.data_mut().fill(7);
        bm.unfix_page(h, true);

        // Promote to LRU, then force its eviction from there.
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        assert_eq!(raw_list(bm.lru_list()), vec![1]);
        assert!(store.stored(pid(1)).is_none());

        drop(bm);
        assert_eq!(store.stored(pid(1)).unwrap(), vec![7; PAGE_SIZE]);
    }

    #[test]
    fn pinned_pages_cause_buffer_full() {
        let (bm, _) = make_bm(2);
        let h1 = bm.fix_page(pid(1), false).unwrap();
        let h2 = bm.fix_page(pid(2), false).unwrap();

        assert!(matches!(
            bm.fix_page(pid(3), false),
            Err(TuskError::BufferFull)
        ));

        // Unpinning one page makes it the victim.
        bm.unfix_page(h1, false);
        bm.unfix_page(bm.fix_page(pid(3), false).unwrap(), false);
        assert_eq!(raw_list(bm.fifo_list()), vec![2, 3]);

        bm.unfix_page(h2, false);
    }

    #[test]
    fn buffer_full_leaves_pool_unchanged() {
        let (bm, _) = make_bm(2);
        let _h1 = bm.fix_page(pid(1), false).unwrap();
        let _h2 = bm.fix_page(pid(2), false).unwrap();

        let before = bm.fifo_list();
        assert!(bm.fix_page(pid(3), false).is_err());
        assert_eq!(bm.fifo_list(), before);
        assert_eq!(bm.stats().resident, 2);
    }

    #[test]
    fn resident_page_is_read_once() {
        let (bm, store) = make_bm(10);
        for _ in 0..5 {
            bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        }
        assert_eq!(store.read_count(), 1);
        let stats = bm.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 4);
    }

    #[test]
    fn handle_drop_unpins() {
        let (bm, _) = make_bm(2);
        {
            let _h = bm.fix_page(pid(1), true).unwrap();
            assert_eq!(bm.stats().pinned, 1);
        }
        assert_eq!(bm.stats().pinned, 0);
        // Dropped without unfix_page(_, true): the page stays clean.
        assert_eq!(bm.stats().dirty, 0);
    }

    #[test]
    #[should_panic(expected = "data_mut on a shared fix")]
    fn data_mut_on_shared_fix_panics() {
        let (bm, _) = make_bm(2);
        let mut h = bm.fix_page(pid(1), false).unwrap();
        let _ = h.data_mut();
    }

    #[test]
    fn mark_dirty_on_shared_fix_is_honored() {
        let (bm, store) = make_bm(2);
        let h = bm.fix_page(pid(1), false).unwrap();
        bm.unfix_page(h, true);
        assert_eq!(bm.stats().dirty, 1);

        drop(bm);
        assert!(store.stored(pid(1)).is_some());
    }

    #[test]
    fn write_back_failure_restores_victim() {
        let (bm, _, _, fail_writes) = make_failing_bm(1);
        let mut h = bm.fix_page(pid(1), true).unwrap();
        h.data_mut().fill(9);
        bm.unfix_page(h, true);

        fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(
            bm.fix_page(pid(2), false),
            Err(TuskError::PageIo { page_id: 1, .. })
        ));

        // The dirty victim is still resident and still dirty.
        assert_eq!(raw_list(bm.fifo_list()), vec![1]);
        assert_eq!(bm.stats().dirty, 1);

        // And still serves hits with its modified contents.
        fail_writes.store(false, Ordering::SeqCst);
        let h = bm.fix_page(pid(1), false).unwrap();
        assert_eq!(h.data(), &[9; PAGE_SIZE]);
        drop(h);
    }

    #[test]
    fn read_failure_leaves_pool_unchanged() {
        let (bm, _, fail_reads, _) = make_failing_bm(2);
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);

        fail_reads.store(true, Ordering::SeqCst);
        assert!(bm.fix_page(pid(2), false).is_err());
        fail_reads.store(false, Ordering::SeqCst);

        assert_eq!(raw_list(bm.fifo_list()), vec![1]);
        assert_eq!(bm.stats().resident, 1);

        // The discarded frame is reusable.
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);
        assert_eq!(raw_list(bm.fifo_list()), vec![1, 2]);
    }

    #[test]
    fn read_failure_after_eviction_frees_the_slot() {
        let (bm, store, fail_reads, _) = make_failing_bm(1);
        let mut h = bm.fix_page(pid(1), true).unwrap();
        h.data_mut().fill(3);
        bm.unfix_page(h, true);

        // Write-back of page 1 succeeds, then the read of page 2 fails.
        fail_reads.store(true, Ordering::SeqCst);
        assert!(bm.fix_page(pid(2), false).is_err());
        fail_reads.store(false, Ordering::SeqCst);

        // Page 1 was evicted durably; the pool is empty but functional.
        assert_eq!(store.stored(pid(1)).unwrap(), vec![3; PAGE_SIZE]);
        assert_eq!(bm.stats().resident, 0);
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);
        assert_eq!(bm.stats().resident, 1);
    }

    #[test]
    fn flush_all_clears_dirty_without_evicting() {
        let (bm, store) = make_bm(4);
        for n in 1..=3 {
            let mut h = bm.fix_page(pid(n), true).unwrap();
            h.data_mut().fill(n as u8);
            bm.unfix_page(h, true);
        }
        assert_eq!(bm.stats().dirty, 3);

        bm.flush_all().unwrap();
        assert_eq!(bm.stats().dirty, 0);
        assert_eq!(bm.stats().resident, 3);
        for n in 1..=3u64 {
            assert_eq!(store.stored(pid(n)).unwrap(), vec![n as u8; PAGE_SIZE]);
        }
    }

    #[test]
    fn teardown_writes_dirty_pages() {
        let (bm, store) = make_bm(4);
        let mut h = bm.fix_page(pid(5), true).unwrap();
        h.data_mut().fill(0x55);
        bm.unfix_page(h, true);
        bm.unfix_page(bm.fix_page(pid(6), false).unwrap(), false);

        drop(bm);
        assert_eq!(store.stored(pid(5)).unwrap(), vec![0x55; PAGE_SIZE]);
        // Clean pages are not written.
        assert!(store.stored(pid(6)).is_none());
    }

    #[test]
    fn promotion_with_full_pool_evicts_from_lru() {
        let (bm, _) = make_bm(3);
        // Promote 1 into LRU, then fill the pool with 2 and 3.
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);
        bm.unfix_page(bm.fix_page(pid(3), false).unwrap(), false);
        assert_eq!(raw_list(bm.fifo_list()), vec![2, 3]);
        assert_eq!(raw_list(bm.lru_list()), vec![1]);

        // Second touch of 2 with a full pool: 1 is evicted from LRU to
        // make room, 2 is promoted.
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);
        assert_eq!(raw_list(bm.fifo_list()), vec![3]);
        assert_eq!(raw_list(bm.lru_list()), vec![2]);
    }

    #[test]
    fn promotion_without_lru_victim_serves_from_fifo() {
        let (bm, _) = make_bm(2);
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        bm.unfix_page(bm.fix_page(pid(2), false).unwrap(), false);

        // Pool full, LRU empty: the hit is served but not promoted.
        bm.unfix_page(bm.fix_page(pid(1), false).unwrap(), false);
        assert_eq!(raw_list(bm.fifo_list()), vec![1, 2]);
        assert!(bm.lru_list().is_empty());
    }

    #[test]
    fn try_fix_declines_contended_latch() {
        let (bm, _) = make_bm(2);
        let h = bm.fix_page(pid(1), true).unwrap();

        assert!(bm.try_fix_page(pid(1), false).unwrap().is_none());
        assert!(bm.try_fix_page(pid(1), true).unwrap().is_none());

        bm.unfix_page(h, false);
        let h = bm.try_fix_page(pid(1), false).unwrap().unwrap();
        assert_eq!(h.page_id(), pid(1));
        drop(h);

        // Declined attempts must not leak pins.
        assert_eq!(bm.stats().pinned, 0);
    }

    #[test]
    fn try_fix_loads_missing_pages() {
        let (bm, store) = make_bm(2);
        let h = bm.try_fix_page(pid(1), false).unwrap().unwrap();
        drop(h);
        assert_eq!(store.read_count(), 1);
        assert_eq!(raw_list(bm.fifo_list()), vec![1]);
    }

    #[test]
    fn shared_fixes_coexist() {
        let (bm, _) = make_bm(2);
        let h1 = bm.fix_page(pid(1), false).unwrap();
        let h2 = bm.fix_page(pid(1), false).unwrap();
        assert_eq!(h1.data(), h2.data());
        assert_eq!(bm.stats().pinned, 1);

        // Still pinned by h2 after h1 goes away: not evictable.
        drop(h1);
        assert_eq!(bm.stats().pinned, 1);
        drop(h2);
        assert_eq!(bm.stats().pinned, 0);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        use std::thread;

        let store = Arc::new(MockPageStore::new(PAGE_SIZE));
        let bm = Arc::new(
            BufferManager::with_store(&config(4), Box::new(Arc::clone(&store))).unwrap(),
        );

        let mut handles = vec![];
        for _ in 0..2 {
            let bm = Arc::clone(&bm);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let mut h = bm.fix_page(pid(1), true).unwrap();
                    let counter = u64::from_le_bytes(h.data()[..8].try_into().unwrap());
                    h.data_mut()[..8].copy_from_slice(&(counter + 1).to_le_bytes());
                    bm.unfix_page(h, true);
                }
            }));
        }
        for t in handles {
            t.join().unwrap();
        }

        let h = bm.fix_page(pid(1), false).unwrap();
        let counter = u64::from_le_bytes(h.data()[..8].try_into().unwrap());
        assert_eq!(counter, 2000);
        drop(h);
        // The page stayed resident throughout: one physical read.
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn concurrent_distinct_pages_thrash_safely() {
        use std::thread;

        let store = Arc::new(MockPageStore::new(PAGE_SIZE));
        let bm = Arc::new(
            BufferManager::with_store(&config(4), Box::new(Arc::clone(&store))).unwrap(),
        );

        let mut handles = vec![];
        for worker in 0..4u64 {
            let bm = Arc::clone(&bm);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let page = pid(worker * 64 + (i % 16));
                    // BufferFull is transient when other threads hold
                    // their pins: back off and retry.
                    let mut h = loop {
                        match bm.fix_page(page, true) {
                            Ok(h) => break h,
                            Err(TuskError::BufferFull) => thread::yield_now(),
                            Err(e) => panic!("fix failed: {e}"),
                        }
                    };
                    let b = h.data()[0];
                    h.data_mut()[0] = b.wrapping_add(1);
                    bm.unfix_page(h, true);
                }
            }));
        }
        for t in handles {
            t.join().unwrap();
        }

        let stats = bm.stats();
        assert!(stats.resident <= 4);
        assert_eq!(stats.pinned, 0);
    }
}
