//! One-item adapters over [`SpanQueue`] span reservations.
//!
//! `DirectPush` and `DirectPop` hide the reservation bookkeeping: `push` and
//! `pop` work on single items and transparently re-reserve a fresh span when
//! the current slice is exhausted. A span that crosses the ring end is
//! consumed as two linear ranges.

use std::time::Duration;

use crate::ring::{SpanQueue, CONCUR_NONE};

/// Streaming producer handle writing items in place.
pub struct DirectPush<'q, T: Copy + Default> {
    queue: &'q SpanQueue<T>,
    start: usize,
    pos: usize,
    end1: usize,
    /// length to the ring end when the span wraps, else equals `end1`
    end2: usize,
    push_id: u32,
    block_size: usize,
    second_part: bool,
}

impl<'q, T: Copy + Default> DirectPush<'q, T> {
    /// Creates a pusher; `block_size == 0` selects the queue's recommended
    /// span size.
    #[must_use]
    pub fn new(queue: &'q SpanQueue<T>, block_size: usize) -> Self {
        let block_size = if block_size != 0 {
            block_size
        } else {
            queue.recommended_push_span().max(1)
        };
        Self {
            queue,
            start: 0,
            pos: 0,
            end1: 0,
            end2: 0,
            push_id: CONCUR_NONE,
            block_size,
            second_part: false,
        }
    }

    fn handle_push(&mut self, timeout: Option<Duration>) -> bool {
        if self.end1 != self.end2 {
            // the span wraps; continue at the ring start
            self.pos = 0;
            self.end1 = self.end2;
            self.second_part = true;
            return true;
        }
        let qsize = self.queue.queue_size();
        let written = if self.second_part {
            self.pos + qsize - self.start
        } else {
            self.pos - self.start
        };
        let size = self.queue.begin_push(
            self.block_size,
            written,
            &mut self.push_id,
            &mut self.start,
            timeout,
        );
        self.second_part = false;
        if size == 0 {
            return false;
        }
        self.pos = self.start;
        self.end1 = self.pos + size;
        if self.end1 <= qsize {
            self.end2 = self.end1;
        } else {
            self.end1 = qsize;
            self.end2 = self.pos + size - qsize;
        }
        true
    }

    /// Pushes one item, blocking while the queue is full. Returns false when
    /// the queue was closed or cancelled.
    pub fn push(&mut self, item: T) -> bool {
        self.push_timeout(item, None)
    }

    /// Pushes one item with a timeout on the underlying reservation.
    pub fn push_timeout(&mut self, item: T, timeout: Option<Duration>) -> bool {
        if self.pos < self.end1 || self.handle_push(timeout) {
            // SAFETY: `pos` lies inside the span granted by begin_push above.
            unsafe { self.queue.write_cell(self.pos, item) };
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Retires the current reservation, committing everything written so far.
    pub fn finish(&mut self) {
        let written = if self.second_part {
            self.pos + self.queue.queue_size() - self.start
        } else {
            self.pos - self.start
        };
        self.queue.finish_push(written, self.push_id);
        self.push_id = CONCUR_NONE;
        self.second_part = false;
        self.start = 0;
        self.pos = 0;
        self.end1 = 0;
        self.end2 = 0;
    }
}

impl<T: Copy + Default> Drop for DirectPush<'_, T> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Streaming consumer handle reading items in place.
pub struct DirectPop<'q, T: Copy + Default> {
    queue: &'q SpanQueue<T>,
    start: usize,
    pos: usize,
    end1: usize,
    end2: usize,
    pop_id: u32,
    block_size: usize,
    second_part: bool,
}

impl<'q, T: Copy + Default> DirectPop<'q, T> {
    /// Creates a popper; `block_size == 0` selects the queue's recommended
    /// span size.
    #[must_use]
    pub fn new(queue: &'q SpanQueue<T>, block_size: usize) -> Self {
        let block_size = if block_size != 0 {
            block_size
        } else {
            queue.recommended_pop_span().max(1)
        };
        Self {
            queue,
            start: 0,
            pos: 0,
            end1: 0,
            end2: 0,
            pop_id: CONCUR_NONE,
            block_size,
            second_part: false,
        }
    }

    fn handle_pop(&mut self, timeout: Option<Duration>) -> bool {
        if self.end1 != self.end2 {
            self.pos = 0;
            self.end1 = self.end2;
            self.second_part = true;
            return true;
        }
        let qsize = self.queue.queue_size();
        let consumed = if self.second_part {
            self.pos + qsize - self.start
        } else {
            self.pos - self.start
        };
        let size = self.queue.begin_pop(
            self.block_size,
            consumed,
            &mut self.pop_id,
            &mut self.start,
            timeout,
        );
        self.second_part = false;
        if size == 0 {
            return false;
        }
        self.pos = self.start;
        self.end1 = self.pos + size;
        if self.end1 <= qsize {
            self.end2 = self.end1;
        } else {
            self.end1 = qsize;
            self.end2 = self.pos + size - qsize;
        }
        true
    }

    /// Pops one item, blocking while the queue is empty. Returns `None` once
    /// the queue is closed and drained, or cancelled.
    pub fn pop(&mut self) -> Option<T> {
        self.pop_timeout(None)
    }

    /// Pops one item with a timeout on the underlying reservation.
    pub fn pop_timeout(&mut self, timeout: Option<Duration>) -> Option<T> {
        if self.pos < self.end1 || self.handle_pop(timeout) {
            // SAFETY: `pos` lies inside the span granted by begin_pop above.
            let item = unsafe { self.queue.read_cell(self.pos) };
            self.pos += 1;
            Some(item)
        } else {
            None
        }
    }

    /// Retires the current reservation, releasing everything read so far.
    pub fn finish(&mut self) {
        let consumed = if self.second_part {
            self.pos + self.queue.queue_size() - self.start
        } else {
            self.pos - self.start
        };
        self.queue.finish_pop(consumed, self.pop_id);
        self.pop_id = CONCUR_NONE;
        self.second_part = false;
        self.start = 0;
        self.pos = 0;
        self.end1 = 0;
        self.end2 = 0;
    }
}

impl<T: Copy + Default> Drop for DirectPop<'_, T> {
    fn drop(&mut self) {
        self.finish();
    }
}
