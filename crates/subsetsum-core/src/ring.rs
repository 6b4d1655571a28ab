//! Span-reservation MPMC ring buffer.
//!
//! The queue hands out contiguous spans of its cell array to concurrent
//! pushers and poppers. Callers write or read the cells in place, outside any
//! lock, and retire their spans in any order; the queue then *folds* finished
//! spans into the committed region in arrival order, physically compacting
//! the buffer when a span was retired shorter than reserved. Compaction
//! memmoves run with the main mutex released; a per-side fold gate (a tiny
//! mutex built on the main lock's condvar) keeps two folders from moving
//! overlapping bytes.
//!
//! Commits are FIFO in `begin_push` order even when `finish_push` calls
//! arrive out of order.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Sentinel for "no reservation in flight".
pub const CONCUR_NONE: u32 = u32::MAX;

#[derive(Clone, Copy, Default)]
struct ConcurEntry {
    start: usize,
    end: usize,
    /// true while the owning operation is still writing/reading the span
    processed: bool,
}

/// Gate state for one fold side. Lives under the main mutex; waiting happens
/// on a dedicated condvar so a folder can release the main mutex around its
/// memmoves without letting a second folder in.
#[derive(Default)]
struct FoldGate {
    locked: bool,
    holders: u32,
}

struct State {
    /// start of the committed, unread region
    read_pos: usize,
    /// end of the committed region
    write_pos: usize,
    /// start of the next pop reservation
    new_read_pos: usize,
    /// start of the next push reservation
    new_write_pos: usize,

    push_entries: Box<[ConcurEntry]>,
    push_start: u32,
    push_used: u32,
    pop_entries: Box<[ConcurEntry]>,
    pop_start: u32,
    pop_used: u32,

    /// pushes between begin and finish, used by close()
    concur_pushes: u32,
    closing: bool,

    push_fold: FoldGate,
    pop_fold: FoldGate,
}

/// Lock-assisted MPMC queue over a fixed array of cells with in-place span
/// reservations.
pub struct SpanQueue<T> {
    cells: UnsafeCell<Box<[T]>>,
    queue_size: usize,
    push_alloc: u32,
    pop_alloc: u32,

    state: Mutex<State>,
    push_cond: Condvar,
    pop_cond: Condvar,
    close_cond: Condvar,
    push_fold_cond: Condvar,
    pop_fold_cond: Condvar,

    closed: AtomicBool,
    cancelled: AtomicBool,
    no_data: AtomicBool,
}

// SAFETY: the cell array is shared across threads, but every unsynchronised
// access goes through a span reservation: `begin_push`/`begin_pop` hand out
// disjoint index ranges under the mutex, and fold memmoves are serialised by
// the fold gates and only touch retired spans.
unsafe impl<T: Send + Copy> Send for SpanQueue<T> {}
unsafe impl<T: Send + Copy> Sync for SpanQueue<T> {}

impl<T: Copy + Default> SpanQueue<T> {
    /// Creates a queue of `queue_size` cells with the given per-side
    /// reservation-slot limits (0 selects `3 * available_parallelism`).
    ///
    /// # Panics
    ///
    /// Panics when `queue_size` is zero.
    #[must_use]
    pub fn new(queue_size: usize, push_slots: u32, pop_slots: u32) -> Self {
        assert!(queue_size > 0, "queue size must be non-zero");
        let default_slots = || {
            let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
            (cpus * 3) as u32
        };
        let push_alloc = if push_slots != 0 { push_slots } else { default_slots() };
        let pop_alloc = if pop_slots != 0 { pop_slots } else { default_slots() };
        Self {
            cells: UnsafeCell::new(vec![T::default(); queue_size].into_boxed_slice()),
            queue_size,
            push_alloc,
            pop_alloc,
            state: Mutex::new(State {
                read_pos: 0,
                write_pos: 0,
                new_read_pos: 0,
                new_write_pos: 0,
                push_entries: vec![ConcurEntry::default(); push_alloc as usize].into_boxed_slice(),
                push_start: 0,
                push_used: 0,
                pop_entries: vec![ConcurEntry::default(); pop_alloc as usize].into_boxed_slice(),
                pop_start: 0,
                pop_used: 0,
                concur_pushes: 0,
                closing: false,
                push_fold: FoldGate::default(),
                pop_fold: FoldGate::default(),
            }),
            push_cond: Condvar::new(),
            pop_cond: Condvar::new(),
            close_cond: Condvar::new(),
            push_fold_cond: Condvar::new(),
            pop_fold_cond: Condvar::new(),
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            no_data: AtomicBool::new(false),
        }
    }

    /// Queue capacity in cells.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue_size
    }

    /// Number of committed, unread cells.
    #[must_use]
    pub fn used_size(&self) -> usize {
        let state = self.state.lock();
        state.write_pos - state.read_pos
    }

    /// Recommended span size for pushers: an even share of the capacity per
    /// reservation slot, rounded down to a friendly multiple.
    #[must_use]
    pub fn recommended_push_span(&self) -> usize {
        let base = self.queue_size / (self.push_alloc + self.pop_alloc) as usize;
        if base >= 256 {
            base & !15
        } else if base >= 64 {
            base & !3
        } else {
            base
        }
    }

    /// Recommended span size for poppers.
    #[must_use]
    pub fn recommended_pop_span(&self) -> usize {
        self.recommended_push_span()
    }

    /// True once `close` completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True once `cancel` was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True when the queue is closed and fully drained.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        self.no_data.load(Ordering::Acquire)
    }

    #[inline]
    fn wrap(&self, pos: usize) -> usize {
        if pos < self.queue_size {
            pos
        } else {
            pos - self.queue_size
        }
    }

    // ------------------------------------------------------------------
    // fold gates
    // ------------------------------------------------------------------

    fn fold_lock(
        guard: &mut MutexGuard<'_, State>,
        cond: &Condvar,
        side: impl Fn(&mut State) -> &mut FoldGate + Copy,
    ) {
        side(&mut **guard).holders += 1;
        while side(&mut **guard).locked {
            cond.wait(guard);
        }
        side(&mut **guard).locked = true;
    }

    fn fold_unlock(
        guard: &mut MutexGuard<'_, State>,
        cond: &Condvar,
        side: impl Fn(&mut State) -> &mut FoldGate + Copy,
    ) {
        let gate = side(&mut **guard);
        gate.holders -= 1;
        gate.locked = false;
        if gate.holders != 0 {
            cond.notify_all();
        }
    }

    // ------------------------------------------------------------------
    // cell access (reservation holders only)
    // ------------------------------------------------------------------

    /// Writes one cell of an active push reservation.
    ///
    /// # Safety
    ///
    /// `idx` must lie inside a span currently granted to the caller by
    /// `begin_push` and not yet finished.
    pub(crate) unsafe fn write_cell(&self, idx: usize, value: T) {
        let cells = &mut *self.cells.get();
        *cells.get_unchecked_mut(idx) = value;
    }

    /// Reads one cell of an active pop reservation.
    ///
    /// # Safety
    ///
    /// `idx` must lie inside a span currently granted to the caller by
    /// `begin_pop` and not yet finished.
    pub(crate) unsafe fn read_cell(&self, idx: usize) -> T {
        let cells = &*self.cells.get();
        *cells.get_unchecked(idx)
    }

    fn copy_in(&self, pos: usize, elems: &[T]) {
        let pos = self.wrap(pos);
        let first = elems.len().min(self.queue_size - pos);
        // SAFETY: [pos, pos+len) mod queue_size is a span reserved by the
        // caller's active push grant.
        unsafe {
            let cells = &mut *self.cells.get();
            cells[pos..pos + first].copy_from_slice(&elems[..first]);
            if first < elems.len() {
                cells[..elems.len() - first].copy_from_slice(&elems[first..]);
            }
        }
    }

    fn copy_out(&self, pos: usize, elems: &mut [T]) {
        let pos = self.wrap(pos);
        let first = elems.len().min(self.queue_size - pos);
        // SAFETY: the range is covered by the caller's active pop grant.
        unsafe {
            let cells = &*self.cells.get();
            elems[..first].copy_from_slice(&cells[pos..pos + first]);
            if first < elems.len() {
                let remaining = elems.len() - first;
                elems[first..].copy_from_slice(&cells[..remaining]);
            }
        }
    }

    /// Applies queued compaction moves. `moves` are (dst, src, len) cell
    /// ranges that never wrap individually.
    ///
    /// # Safety
    ///
    /// Must only be called by the holder of the corresponding fold gate; the
    /// ranges must cover retired spans only.
    unsafe fn apply_moves(&self, moves: &[(usize, usize, usize)]) {
        let cells = (*self.cells.get()).as_mut_ptr();
        for &(dst, src, len) in moves {
            std::ptr::copy(cells.add(src), cells.add(dst), len);
        }
    }

    /// Splits one logical move into at most three non-wrapping segments, in
    /// front-to-back order (push folds contract towards `write_pos`, so the
    /// destination trails the source).
    fn push_fold_segments(
        &self,
        moves: &mut Vec<(usize, usize, usize)>,
        mut dst: usize,
        mut src: usize,
        block: usize,
    ) {
        let qsize = self.queue_size;
        let mut b1 = block;
        let mut b2 = block;
        if src + block > qsize {
            b1 = qsize - src;
        }
        if dst + block > qsize {
            if b1 < block {
                b2 = qsize - dst;
            } else {
                b1 = qsize - dst;
            }
        }
        moves.push((dst, src, b1));
        if b1 < block {
            dst = self.wrap(dst + b1);
            src = self.wrap(src + b1);
            moves.push((dst, src, b2 - b1));
            if b2 < block {
                dst = self.wrap(dst + (b2 - b1));
                src = self.wrap(src + (b2 - b1));
                moves.push((dst, src, block - b2));
            }
        }
    }

    /// Same splitting for pop folds, emitted back-to-front because there the
    /// destination leads the source.
    fn pop_fold_segments(
        &self,
        moves: &mut Vec<(usize, usize, usize)>,
        mut dst: usize,
        mut src: usize,
        block: usize,
    ) {
        let qsize = self.queue_size;
        let mut b1 = block;
        let mut b2 = block;
        if dst + block > qsize {
            b1 = qsize - dst;
        }
        if src + block > qsize {
            if b1 < block {
                b2 = qsize - src;
            } else {
                b1 = qsize - src;
            }
        }
        let first_dst = dst;
        let first_src = src;
        if b1 < block {
            dst = self.wrap(dst + b1);
            src = self.wrap(src + b1);
            let mid_dst = dst;
            let mid_src = src;
            if b2 < block {
                dst = self.wrap(dst + (b2 - b1));
                src = self.wrap(src + (b2 - b1));
                moves.push((dst, src, block - b2));
            }
            moves.push((mid_dst, mid_src, b2 - b1));
        }
        moves.push((first_dst, first_src, b1));
    }

    // ------------------------------------------------------------------
    // push side
    // ------------------------------------------------------------------

    fn alloc_push_concur(&self, state: &mut State, elems: usize, push_pos: &mut usize) -> u32 {
        let mut push_id = state.push_start + state.push_used;
        state.push_used += 1;
        if push_id >= self.push_alloc {
            push_id -= self.push_alloc;
        }
        let entry = &mut state.push_entries[push_id as usize];
        entry.start = state.new_write_pos;
        entry.end = state.new_write_pos + elems;
        entry.processed = true;
        *push_pos = self.wrap(state.new_write_pos);
        state.new_write_pos += elems;
        push_id
    }

    /// Retires a push span and folds every leading finished span into the
    /// committed region. Returns `(success, fixed)` where `fixed` reports
    /// that a popper normalised the counters while the fold ran unlocked.
    fn finish_push_concur(
        &self,
        guard: &mut MutexGuard<'_, State>,
        mut push_id: u32,
        elems: usize,
    ) -> (bool, bool) {
        let mut success = true;
        if guard.push_used == 0 {
            return (true, false);
        }
        if push_id >= self.push_alloc {
            push_id -= self.push_alloc;
        }
        {
            let entry = &mut guard.push_entries[push_id as usize];
            if entry.end - entry.start < elems {
                success = false;
                entry.end = entry.start;
            } else {
                entry.end = entry.start + elems;
            }
            entry.processed = false;
        }

        let old_used = guard.push_used;
        let mut tmp_used = guard.push_used;
        let mut tmp_start = guard.push_start;
        let mut tmp_write = guard.write_pos;
        let old_write = guard.write_pos;

        // All mutations of push entries happen under the push fold gate the
        // caller holds, so this walk sees a stable prefix.
        let mut moves = Vec::new();
        while tmp_used != 0 && !guard.push_entries[tmp_start as usize].processed {
            let entry = guard.push_entries[tmp_start as usize];
            let dst = self.wrap(tmp_write);
            let src = self.wrap(entry.start);
            let block = entry.end - entry.start;
            if dst != src && block != 0 {
                self.push_fold_segments(&mut moves, dst, src, block);
            }
            tmp_write += block;
            tmp_used -= 1;
            tmp_start += 1;
            if tmp_start >= self.push_alloc {
                tmp_start -= self.push_alloc;
            }
        }

        if !moves.is_empty() {
            MutexGuard::unlocked(guard, || {
                // SAFETY: push fold gate held; moved ranges are retired spans.
                unsafe { self.apply_moves(&moves) };
            });
        }

        let mut fixed = false;
        if old_write == guard.write_pos + self.queue_size {
            // a popper normalised the counters while we were unlocked
            guard.write_pos = tmp_write - self.queue_size;
            fixed = true;
        } else {
            guard.write_pos = tmp_write;
        }
        guard.push_start = tmp_start;
        guard.push_used = tmp_used;

        if (tmp_used < old_used && old_used == self.push_alloc)
            || (tmp_used == 0 && guard.write_pos < guard.new_write_pos)
        {
            self.push_cond.notify_all();
        }
        if guard.push_used == 0 {
            guard.push_start = 0;
            guard.new_write_pos = guard.write_pos;
        }
        (success, fixed)
    }

    fn finish_pushing_int(
        &self,
        guard: &mut MutexGuard<'_, State>,
        old_elems: usize,
        push_id: u32,
    ) -> bool {
        if push_id == CONCUR_NONE {
            return true;
        }
        let mut old_write = guard.write_pos;
        let (success, fixed) = self.finish_push_concur(guard, push_id, old_elems);
        if fixed {
            old_write -= self.queue_size;
        }
        if guard.write_pos != old_write && old_write == guard.new_read_pos {
            self.pop_cond.notify_all();
        }
        guard.concur_pushes -= 1;
        if guard.closing && guard.concur_pushes == 0 {
            self.close_cond.notify_all();
        }
        success
    }

    /// Finishes the previous push reservation (when `push_id` is not
    /// [`CONCUR_NONE`]) and reserves the next contiguous span of up to
    /// `elems` cells.
    ///
    /// On success writes the wrap-corrected start index to `queue_pos`, the
    /// new grant id to `push_id` and returns the granted length. Returns 0
    /// when the queue is closed, cancelled, or the timeout expired; in every
    /// 0 case `push_id` is reset to [`CONCUR_NONE`].
    ///
    /// # Panics
    ///
    /// Panics when `old_elems` exceeds the previously granted length.
    pub fn begin_push(
        &self,
        elems: usize,
        old_elems: usize,
        push_id: &mut u32,
        queue_pos: &mut usize,
        timeout: Option<Duration>,
    ) -> usize {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.state.lock();
        Self::fold_lock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);

        let ok = self.finish_pushing_int(&mut guard, old_elems, *push_id);
        *push_id = CONCUR_NONE;
        assert!(ok, "finish_push: more elements reported than were reserved");

        if guard.closing || self.is_closed() || self.is_cancelled() {
            Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
            return 0;
        }
        guard.concur_pushes += 1;

        while self.queue_size - (guard.new_write_pos - guard.read_pos) == 0
            || guard.push_used == self.push_alloc
        {
            Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
            if let Some(deadline) = deadline {
                if self.push_cond.wait_until(&mut guard, deadline).timed_out() {
                    guard.concur_pushes -= 1;
                    if guard.closing && guard.concur_pushes == 0 {
                        self.close_cond.notify_all();
                    }
                    return 0;
                }
            } else {
                self.push_cond.wait(&mut guard);
            }
            Self::fold_lock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
            if guard.closing || self.is_closed() || self.is_cancelled() {
                guard.concur_pushes -= 1;
                if guard.closing && guard.concur_pushes == 0 {
                    self.close_cond.notify_all();
                }
                Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
                return 0;
            }
        }

        let free = self.queue_size - (guard.new_write_pos - guard.read_pos);
        let taken = elems.min(free);
        *push_id = self.alloc_push_concur(&mut guard, taken, queue_pos);
        Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
        taken
    }

    /// Non-blocking variant of [`begin_push`](Self::begin_push).
    pub fn try_begin_push(
        &self,
        elems: usize,
        old_elems: usize,
        push_id: &mut u32,
        queue_pos: &mut usize,
    ) -> usize {
        let mut guard = self.state.lock();
        Self::fold_lock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);

        let ok = self.finish_pushing_int(&mut guard, old_elems, *push_id);
        *push_id = CONCUR_NONE;
        assert!(ok, "finish_push: more elements reported than were reserved");

        if guard.closing
            || self.is_closed()
            || self.is_cancelled()
            || self.queue_size - (guard.new_write_pos - guard.read_pos) == 0
            || guard.push_used == self.push_alloc
        {
            Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
            return 0;
        }
        guard.concur_pushes += 1;

        let free = self.queue_size - (guard.new_write_pos - guard.read_pos);
        let taken = elems.min(free);
        *push_id = self.alloc_push_concur(&mut guard, taken, queue_pos);
        Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
        taken
    }

    /// Retires the current push reservation, reporting `old_elems` cells as
    /// actually written (`old_elems` may be less than granted; the tail is
    /// reclaimed by folding).
    ///
    /// # Panics
    ///
    /// Panics when `old_elems` exceeds the granted length.
    pub fn finish_push(&self, old_elems: usize, push_id: u32) {
        let mut guard = self.state.lock();
        Self::fold_lock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
        let ok = self.finish_pushing_int(&mut guard, old_elems, push_id);
        Self::fold_unlock(&mut guard, &self.push_fold_cond, |s| &mut s.push_fold);
        assert!(ok, "finish_push: more elements reported than were reserved");
    }

    // ------------------------------------------------------------------
    // pop side
    // ------------------------------------------------------------------

    fn alloc_pop_concur(&self, state: &mut State, elems: usize, pop_pos: &mut usize) -> u32 {
        let mut pop_id = state.pop_start + state.pop_used;
        state.pop_used += 1;
        if pop_id >= self.pop_alloc {
            pop_id -= self.pop_alloc;
        }
        let entry = &mut state.pop_entries[pop_id as usize];
        entry.start = state.new_read_pos;
        entry.end = state.new_read_pos + elems;
        entry.processed = true;
        *pop_pos = self.wrap(state.new_read_pos);
        state.new_read_pos += elems;
        pop_id
    }

    /// Retires a pop span: drops fully-consumed leading spans and shifts the
    /// unread tails of finished trailing spans back so pending reads stay
    /// contiguous.
    fn finish_pop_concur(
        &self,
        guard: &mut MutexGuard<'_, State>,
        mut pop_id: u32,
        elems: usize,
    ) -> bool {
        let mut success = true;
        if guard.pop_used == 0 {
            return true;
        }
        if pop_id >= self.pop_alloc {
            pop_id -= self.pop_alloc;
        }
        {
            let entry = &mut guard.pop_entries[pop_id as usize];
            if entry.end - entry.start < elems {
                success = false;
            } else {
                // start now marks the first unread cell
                entry.start += elems;
            }
            entry.processed = false;
        }

        let old_used = guard.pop_used;
        let mut tmp_start = guard.pop_start;
        let mut tmp_used = guard.pop_used;
        let mut tmp_read = guard.read_pos;
        let mut tmp_new_read = guard.new_read_pos;

        // drop fully consumed entries from the front
        while tmp_used != 0 {
            let entry = guard.pop_entries[tmp_start as usize];
            if entry.processed || entry.start != entry.end {
                break;
            }
            tmp_read = if entry.end - tmp_read > self.queue_size {
                entry.end - self.queue_size
            } else {
                entry.end
            };
            tmp_start += 1;
            if tmp_start >= self.pop_alloc {
                tmp_start -= self.pop_alloc;
            }
            tmp_used -= 1;
        }

        // move unread tails of finished trailing entries towards the front
        let mut it = tmp_start.wrapping_add(tmp_used.wrapping_sub(1));
        if (tmp_used != 0) && it >= self.pop_alloc {
            it -= self.pop_alloc;
        }
        let mut added_unread = false;
        let mut moves = Vec::new();
        let mut fold_used = tmp_used;
        while fold_used != 0 && !guard.pop_entries[it as usize].processed {
            let entry = guard.pop_entries[it as usize];
            let src = self.wrap(entry.start);
            let dst_end = self.wrap(tmp_new_read);
            let end = self.wrap(entry.end);
            let block = entry.end - entry.start;
            if end != dst_end && block != 0 {
                let dst = if dst_end >= block {
                    dst_end - block
                } else {
                    dst_end + self.queue_size - block
                };
                self.pop_fold_segments(&mut moves, dst, src, block);
            }
            tmp_new_read -= block;
            if block != 0 {
                added_unread = true;
            }
            it = if it == 0 { self.pop_alloc - 1 } else { it - 1 };
            fold_used -= 1;
        }
        tmp_used = fold_used;

        if !moves.is_empty() {
            MutexGuard::unlocked(guard, || {
                // SAFETY: pop fold gate held; only committed, unclaimed data
                // between reservations moves.
                unsafe { self.apply_moves(&moves) };
            });
        }

        guard.read_pos = tmp_read;
        guard.new_read_pos = tmp_new_read;
        guard.pop_start = tmp_start;
        guard.pop_used = tmp_used;

        if (tmp_used < old_used && old_used == self.pop_alloc) || added_unread {
            self.pop_cond.notify_all();
        }
        if guard.pop_used == 0 {
            guard.read_pos = guard.new_read_pos;
            guard.pop_start = 0;
        }
        success
    }

    fn finish_popping_int(
        &self,
        guard: &mut MutexGuard<'_, State>,
        old_elems: usize,
        pop_id: u32,
    ) -> bool {
        if pop_id == CONCUR_NONE {
            return true;
        }
        let old_read = guard.read_pos;
        let success = self.finish_pop_concur(guard, pop_id, old_elems);
        if guard.read_pos != old_read && old_read + self.queue_size == guard.new_write_pos {
            self.push_cond.notify_all();
        }
        if self.is_cancelled()
            || (self.is_closed() && guard.read_pos == guard.write_pos && guard.pop_used == 0)
        {
            self.pop_cond.notify_all();
            self.no_data.store(true, Ordering::Release);
        }
        if guard.read_pos >= self.queue_size {
            guard.read_pos -= self.queue_size;
            guard.write_pos -= self.queue_size;
            guard.new_read_pos -= self.queue_size;
            guard.new_write_pos -= self.queue_size;
        }
        success
    }

    /// Finishes the previous pop reservation and reserves the next span of up
    /// to `elems` committed cells. Mirrors [`begin_push`](Self::begin_push).
    ///
    /// # Panics
    ///
    /// Panics when `old_elems` exceeds the previously granted length.
    pub fn begin_pop(
        &self,
        elems: usize,
        old_elems: usize,
        pop_id: &mut u32,
        queue_pos: &mut usize,
        timeout: Option<Duration>,
    ) -> usize {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.state.lock();
        Self::fold_lock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);

        let ok = self.finish_popping_int(&mut guard, old_elems, *pop_id);
        *pop_id = CONCUR_NONE;
        assert!(ok, "finish_pop: more elements reported than were reserved");

        if self.is_cancelled()
            || (self.is_closed() && guard.pop_used == 0 && guard.read_pos == guard.write_pos)
        {
            Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
            return 0;
        }

        while guard.write_pos - guard.new_read_pos == 0 || guard.pop_used == self.pop_alloc {
            Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
            if let Some(deadline) = deadline {
                if self.pop_cond.wait_until(&mut guard, deadline).timed_out() {
                    return 0;
                }
            } else {
                self.pop_cond.wait(&mut guard);
            }
            Self::fold_lock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
            if self.is_cancelled()
                || (self.is_closed()
                    && guard.pop_used == 0
                    && guard.push_used == 0
                    && guard.read_pos == guard.write_pos)
            {
                self.pop_cond.notify_all();
                Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
                return 0;
            }
        }

        let avail = guard.write_pos - guard.new_read_pos;
        let taken = elems.min(avail);
        *pop_id = self.alloc_pop_concur(&mut guard, taken, queue_pos);
        Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
        taken
    }

    /// Non-blocking variant of [`begin_pop`](Self::begin_pop).
    pub fn try_begin_pop(
        &self,
        elems: usize,
        old_elems: usize,
        pop_id: &mut u32,
        queue_pos: &mut usize,
    ) -> usize {
        let mut guard = self.state.lock();
        Self::fold_lock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);

        let ok = self.finish_popping_int(&mut guard, old_elems, *pop_id);
        *pop_id = CONCUR_NONE;
        assert!(ok, "finish_pop: more elements reported than were reserved");

        if self.is_cancelled()
            || (self.is_closed() && guard.pop_used == 0 && guard.read_pos == guard.write_pos)
            || guard.write_pos - guard.new_read_pos == 0
            || guard.pop_used == self.pop_alloc
        {
            Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
            return 0;
        }

        let avail = guard.write_pos - guard.new_read_pos;
        let taken = elems.min(avail);
        *pop_id = self.alloc_pop_concur(&mut guard, taken, queue_pos);
        Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
        taken
    }

    /// Retires the current pop reservation with `old_elems` cells consumed.
    ///
    /// # Panics
    ///
    /// Panics when `old_elems` exceeds the granted length.
    pub fn finish_pop(&self, old_elems: usize, pop_id: u32) {
        let mut guard = self.state.lock();
        Self::fold_lock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
        let ok = self.finish_popping_int(&mut guard, old_elems, pop_id);
        Self::fold_unlock(&mut guard, &self.pop_fold_cond, |s| &mut s.pop_fold);
        assert!(ok, "finish_pop: more elements reported than were reserved");
    }

    // ------------------------------------------------------------------
    // bulk helpers
    // ------------------------------------------------------------------

    /// Pushes the whole slice, blocking while the queue is full. Returns the
    /// number of cells actually pushed (short only when closed/cancelled or
    /// the timeout expired).
    pub fn push_all(&self, elems: &[T], timeout: Option<Duration>) -> usize {
        if elems.is_empty() {
            return 0;
        }
        let mut remain = elems;
        let mut old_elems = 0usize;
        let mut pos = 0usize;
        let mut push_id = CONCUR_NONE;
        while !self.is_closed() && !remain.is_empty() {
            old_elems = self.begin_push(remain.len(), old_elems, &mut push_id, &mut pos, timeout);
            if old_elems == 0 {
                break;
            }
            self.copy_in(pos, &remain[..old_elems]);
            remain = &remain[old_elems..];
        }
        self.finish_push(old_elems, push_id);
        elems.len() - remain.len()
    }

    /// Attempts to push without blocking; may push a prefix.
    pub fn try_push(&self, elems: &[T]) -> usize {
        if elems.is_empty() {
            return 0;
        }
        let mut pos = 0usize;
        let mut push_id = CONCUR_NONE;
        let taken = self.try_begin_push(elems.len(), 0, &mut push_id, &mut pos);
        if taken != 0 {
            self.copy_in(pos, &elems[..taken]);
        }
        self.finish_push(taken, push_id);
        taken
    }

    /// Pops into the whole slice, blocking until the requested count, a
    /// close-drain, a cancel, or the timeout. Returns the number popped.
    pub fn pop_all(&self, elems: &mut [T], timeout: Option<Duration>) -> usize {
        if elems.is_empty() {
            return 0;
        }
        let total = elems.len();
        let mut filled = 0usize;
        let mut old_elems = 0usize;
        let mut pos = 0usize;
        let mut pop_id = CONCUR_NONE;
        while (!self.is_closed() || self.used_size() != 0) && filled < total {
            old_elems = self.begin_pop(total - filled, old_elems, &mut pop_id, &mut pos, timeout);
            if old_elems == 0 {
                break;
            }
            self.copy_out(pos, &mut elems[filled..filled + old_elems]);
            filled += old_elems;
        }
        self.finish_pop(old_elems, pop_id);
        filled
    }

    /// Attempts to pop without blocking; may pop a prefix.
    pub fn try_pop(&self, elems: &mut [T]) -> usize {
        if elems.is_empty() {
            return 0;
        }
        let mut pos = 0usize;
        let mut pop_id = CONCUR_NONE;
        let taken = self.try_begin_pop(elems.len(), 0, &mut pop_id, &mut pos);
        if taken != 0 {
            self.copy_out(pos, &mut elems[..taken]);
        }
        self.finish_pop(taken, pop_id);
        taken
    }

    // ------------------------------------------------------------------
    // close / cancel
    // ------------------------------------------------------------------

    /// Closes the queue: waits for in-flight pushes to retire, then rejects
    /// further pushes while poppers drain the remaining data.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let mut guard = self.state.lock();
        guard.closing = true;
        self.push_cond.notify_all();
        while guard.concur_pushes != 0 && !self.is_cancelled() {
            self.close_cond.wait(&mut guard);
        }
        if self.is_closed() || self.is_cancelled() {
            return;
        }
        self.closed.store(true, Ordering::Release);
        self.pop_cond.notify_all();
        self.push_cond.notify_all();
        if guard.pop_used == 0 && guard.read_pos == guard.write_pos {
            self.no_data.store(true, Ordering::Release);
        }
    }

    /// Cancels the queue: both sides observe failure at their next call.
    pub fn cancel(&self) {
        let mut guard = self.state.lock();
        self.cancelled.store(true, Ordering::Release);
        if !self.is_closed() {
            guard.closing = true;
            self.closed.store(true, Ordering::Release);
        }
        self.push_cond.notify_all();
        self.pop_cond.notify_all();
        self.close_cond.notify_all();
        self.no_data.store(true, Ordering::Release);
        drop(guard);
    }

    /// Committed-region bounds, for invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn debug_positions(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock();
        (
            state.read_pos,
            state.write_pos,
            state.new_read_pos,
            state.new_write_pos,
        )
    }
}
