//! Least-recently-used tracking with stable handles.
//!
//! Nodes live in fixed-size chunks that are never reallocated once created,
//! so a handle returned by [`LruPool::add`] stays valid across any number of
//! later insertions. Removed nodes go to a free list and are reused.
//!
//! ```text
//!   head (least recent) <-> ... <-> tail (most recent)
//! ```

const CHUNK_SIZE: usize = 64;
const NIL: u32 = u32::MAX;

/// Opaque handle to a live entry of an [`LruPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LruHandle(u32);

#[derive(Debug)]
struct Node<T> {
    value: Option<T>,
    prev: u32,
    next: u32,
}

impl<T> Node<T> {
    fn vacant() -> Self {
        Self {
            value: None,
            prev: NIL,
            next: NIL,
        }
    }
}

/// Doubly linked LRU list over a chunked node arena.
#[derive(Debug)]
pub struct LruPool<T> {
    chunks: Vec<Box<[Node<T>]>>,
    /// Number of node slots handed out so far.
    used: u32,
    /// Head of the free list, linked through `next`.
    free: u32,
    head: u32,
    tail: u32,
    len: usize,
}

impl<T> Default for LruPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruPool<T> {
    /// Empty pool. No memory is allocated until the first `add`.
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            used: 0,
            free: NIL,
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Pool with room for `capacity` entries before it grows.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self::new();
        while pool.chunks.len() * CHUNK_SIZE < capacity {
            pool.grow();
        }
        pool
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the pool has no live entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn grow(&mut self) {
        let chunk: Box<[Node<T>]> = (0..CHUNK_SIZE).map(|_| Node::vacant()).collect();
        self.chunks.push(chunk);
    }

    fn node(&self, index: u32) -> &Node<T> {
        let i = index as usize;
        &self.chunks[i / CHUNK_SIZE][i % CHUNK_SIZE]
    }

    fn node_mut(&mut self, index: u32) -> &mut Node<T> {
        let i = index as usize;
        &mut self.chunks[i / CHUNK_SIZE][i % CHUNK_SIZE]
    }

    fn take_slot(&mut self) -> u32 {
        if self.free != NIL {
            let index = self.free;
            self.free = self.node(index).next;
            return index;
        }
        if self.used as usize == self.chunks.len() * CHUNK_SIZE {
            self.grow();
        }
        let index = self.used;
        self.used += 1;
        index
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
    }

    fn link_tail(&mut self, index: u32) {
        let tail = self.tail;
        {
            let node = self.node_mut(index);
            node.prev = tail;
            node.next = NIL;
        }
        if tail == NIL {
            self.head = index;
        } else {
            self.node_mut(tail).next = index;
        }
        self.tail = index;
    }

    /// Inserts `value` as the most recently used entry.
    pub fn add(&mut self, value: T) -> LruHandle {
        let index = self.take_slot();
        self.node_mut(index).value = Some(value);
        self.link_tail(index);
        self.len += 1;
        LruHandle(index)
    }

    /// Marks the entry as most recently used. Using the most recent entry is
    /// a no-op.
    pub fn mark_used(&mut self, handle: LruHandle) {
        debug_assert!(self.contains(handle), "stale LRU handle");
        if handle.0 == self.tail {
            return;
        }
        self.unlink(handle.0);
        self.link_tail(handle.0);
    }

    /// Unlinks the entry and recycles its node.
    pub fn remove(&mut self, handle: LruHandle) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }
        self.unlink(handle.0);
        self.len -= 1;
        let free = self.free;
        let node = self.node_mut(handle.0);
        let value = node.value.take();
        node.prev = NIL;
        node.next = free;
        self.free = handle.0;
        value
    }

    /// The least recently used entry, `None` when empty.
    pub fn least_recent(&self) -> Option<&T> {
        if self.head == NIL {
            return None;
        }
        self.node(self.head).value.as_ref()
    }

    /// The value behind a live handle.
    pub fn get(&self, handle: LruHandle) -> Option<&T> {
        if (handle.0 as usize) >= self.used as usize {
            return None;
        }
        self.node(handle.0).value.as_ref()
    }

    fn contains(&self, handle: LruHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Entries from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = self.node(cursor);
            cursor = node.next;
            node.value.as_ref()
        })
    }

    /// Drops every entry and keeps the allocated chunks.
    pub fn clear(&mut self) {
        for chunk in &mut self.chunks {
            for node in chunk.iter_mut() {
                *node = Node::vacant();
            }
        }
        self.used = 0;
        self.free = NIL;
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }
}
