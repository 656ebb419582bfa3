use crate::page_id::FrameIdx;

/// Which replacement queue a resident frame belongs to.
///
/// New pages are admitted to the FIFO (probationary) queue; a second
/// reference promotes them to the LRU (protected) queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    Fifo,
    Lru,
}

/// Intrusive link node, one per arena slot. A frame is in at most one
/// queue at a time; `queue == None` means not enqueued (free, mid-load,
/// or mid-eviction).
#[derive(Clone, Copy, Default)]
struct Link {
    prev: Option<FrameIdx>,
    next: Option<FrameIdx>,
    queue: Option<QueueKind>,
}

#[derive(Default)]
struct List {
    head: Option<FrameIdx>,
    tail: Option<FrameIdx>,
    len: usize,
}

/// The two replacement queues, represented as intrusive doubly-linked
/// lists over the frame arena. Every operation is O(1) except iteration;
/// removal never shifts or re-indexes other entries.
pub struct ReplacementQueues {
    links: Vec<Link>,
    fifo: List,
    lru: List,
}

impl ReplacementQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            links: vec![Link::default(); capacity],
            fifo: List::default(),
            lru: List::default(),
        }
    }

    fn list(&self, kind: QueueKind) -> &List {
        match kind {
            QueueKind::Fifo => &self.fifo,
            QueueKind::Lru => &self.lru,
        }
    }

    fn list_mut(&mut self, kind: QueueKind) -> &mut List {
        match kind {
            QueueKind::Fifo => &mut self.fifo,
            QueueKind::Lru => &mut self.lru,
        }
    }

    /// The queue currently holding `idx`, if any.
    pub fn queue_of(&self, idx: FrameIdx) -> Option<QueueKind> {
        self.links[idx.as_usize()].queue
    }

    /// Append `idx` at the tail of `kind`. The frame must not be enqueued.
    pub fn push_tail(&mut self, kind: QueueKind, idx: FrameIdx) {
        debug_assert!(self.links[idx.as_usize()].queue.is_none());
        let old_tail = self.list(kind).tail;
        self.links[idx.as_usize()] = Link {
            prev: old_tail,
            next: None,
            queue: Some(kind),
        };
        match old_tail {
            Some(t) => self.links[t.as_usize()].next = Some(idx),
            None => self.list_mut(kind).head = Some(idx),
        }
        let list = self.list_mut(kind);
        list.tail = Some(idx);
        list.len += 1;
    }

    /// Insert `idx` at the head of `kind`, making it the prime eviction
    /// candidate. The frame must not be enqueued.
    pub fn push_head(&mut self, kind: QueueKind, idx: FrameIdx) {
        debug_assert!(self.links[idx.as_usize()].queue.is_none());
        let old_head = self.list(kind).head;
        self.links[idx.as_usize()] = Link {
            prev: None,
            next: old_head,
            queue: Some(kind),
        };
        match old_head {
            Some(h) => self.links[h.as_usize()].prev = Some(idx),
            None => self.list_mut(kind).tail = Some(idx),
        }
        let list = self.list_mut(kind);
        list.head = Some(idx);
        list.len += 1;
    }

    /// Remove `idx` from its queue. The frame must be enqueued.
    pub fn unlink(&mut self, idx: FrameIdx) {
        let Link { prev, next, queue } = self.links[idx.as_usize()];
        let kind = queue.expect("unlink of frame that is not enqueued");

        match prev {
            Some(p) => self.links[p.as_usize()].next = next,
            None => self.list_mut(kind).head = next,
        }
        match next {
            Some(n) => self.links[n.as_usize()].prev = prev,
            None => self.list_mut(kind).tail = prev,
        }
        self.list_mut(kind).len -= 1;
        self.links[idx.as_usize()] = Link::default();
    }

    /// Move `idx` to the tail of the queue it is already in.
    pub fn move_to_tail(&mut self, idx: FrameIdx) {
        let kind = self.queue_of(idx).expect("move_to_tail of unenqueued frame");
        if self.list(kind).tail == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_tail(kind, idx);
    }

    pub fn head(&self, kind: QueueKind) -> Option<FrameIdx> {
        self.list(kind).head
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.list(kind).len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Combined length of both queues: the number of resident pages.
    pub fn total_len(&self) -> usize {
        self.fifo.len + self.lru.len
    }

    /// Head-to-tail iteration over one queue.
    pub fn iter(&self, kind: QueueKind) -> QueueIter<'_> {
        QueueIter {
            queues: self,
            cursor: self.list(kind).head,
        }
    }
}

pub struct QueueIter<'a> {
    queues: &'a ReplacementQueues,
    cursor: Option<FrameIdx>,
}

impl Iterator for QueueIter<'_> {
    type Item = FrameIdx;

    fn next(&mut self) -> Option<FrameIdx> {
        let idx = self.cursor?;
        self.cursor = self.queues.links[idx.as_usize()].next;
        Some(idx)
    }
}
