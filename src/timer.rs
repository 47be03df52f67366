//! Expiration-ordered timer list for idle-connection eviction.
//!
//! Records live in an arena and are addressed by stable [`TimerHandle`]
//! indices; the expiration order is kept by an index-linked doubly linked
//! list, and freed slots are recycled through an intrusive free list. This
//! keeps the O(1)-removal-by-handle and ascending-order contracts without
//! any raw pointer management.

use crate::table::ConnId;

const NIL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u32);

struct TimerRecord {
    expire: u64,
    conn: ConnId,
    prev: i32,
    next: i32,
    /// Free-list link, valid only while the slot is vacant.
    next_free: i32,
    live: bool,
}

pub struct TimerList {
    records: Vec<TimerRecord>,
    head: i32,
    tail: i32,
    free_head: i32,
    len: usize,
}

impl TimerList {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            head: NIL,
            tail: NIL,
            free_head: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, expire: u64, conn: ConnId) -> u32 {
        if self.free_head != NIL {
            let idx = self.free_head as usize;
            self.free_head = self.records[idx].next_free;
            let rec = &mut self.records[idx];
            rec.expire = expire;
            rec.conn = conn;
            rec.prev = NIL;
            rec.next = NIL;
            rec.live = true;
            idx as u32
        } else {
            self.records.push(TimerRecord {
                expire,
                conn,
                prev: NIL,
                next: NIL,
                next_free: NIL,
                live: true,
            });
            (self.records.len() - 1) as u32
        }
    }

    fn release(&mut self, idx: u32) {
        let rec = &mut self.records[idx as usize];
        rec.live = false;
        rec.next_free = self.free_head;
        self.free_head = idx as i32;
        self.len -= 1;
    }

    /// Insert a new record, keeping the list sorted ascending by expiration.
    /// O(1) when the new deadline precedes the head, otherwise a forward scan
    /// to the first record whose expiration is not smaller.
    pub fn add(&mut self, expire: u64, conn: ConnId) -> TimerHandle {
        let idx = self.alloc(expire, conn);
        self.len += 1;
        self.link_from(idx, self.head);
        TimerHandle(idx)
    }

    /// Refresh a record's deadline after a liveness event. Deadlines only
    /// move forward, so the re-insertion scan starts at the record's current
    /// successor and never revisits earlier entries.
    pub fn adjust(&mut self, handle: TimerHandle, new_expire: u64) {
        let idx = handle.0;
        if !self.records[idx as usize].live {
            return;
        }
        let next = self.records[idx as usize].next;
        self.records[idx as usize].expire = new_expire;
        if next == NIL || new_expire <= self.records[next as usize].expire {
            return;
        }
        self.unlink(idx);
        self.link_from(idx, next);
    }

    /// O(1) unlink and slot recycle.
    pub fn del(&mut self, handle: TimerHandle) {
        let idx = handle.0;
        if !self.records[idx as usize].live {
            return;
        }
        self.unlink(idx);
        self.release(idx);
    }

    /// Remove and return exactly the prefix with `expire <= now`, in
    /// ascending order. The remainder is untouched and still sorted.
    pub fn tick(&mut self, now: u64) -> Vec<ConnId> {
        let mut expired = Vec::new();
        while self.head != NIL {
            let idx = self.head as usize;
            if self.records[idx].expire > now {
                break;
            }
            expired.push(self.records[idx].conn);
            self.unlink(self.head as u32);
            self.release(idx as u32);
        }
        expired
    }

    /// Splice `idx` into the sorted position at or after `start` (a list
    /// index or NIL). `idx` must currently be unlinked.
    fn link_from(&mut self, idx: u32, start: i32) {
        let expire = self.records[idx as usize].expire;

        if start == NIL {
            // Empty list or insertion past the tail.
            if self.head == NIL {
                self.head = idx as i32;
                self.tail = idx as i32;
                return;
            }
            self.link_after(idx, self.tail as u32);
            return;
        }

        let mut cursor = start;
        while cursor != NIL && self.records[cursor as usize].expire <= expire {
            cursor = self.records[cursor as usize].next;
        }
        match cursor {
            NIL => self.link_after(idx, self.tail as u32),
            first_later => self.link_before(idx, first_later as u32),
        }
    }

    fn link_before(&mut self, idx: u32, at: u32) {
        let prev = self.records[at as usize].prev;
        self.records[idx as usize].prev = prev;
        self.records[idx as usize].next = at as i32;
        self.records[at as usize].prev = idx as i32;
        if prev == NIL {
            self.head = idx as i32;
        } else {
            self.records[prev as usize].next = idx as i32;
        }
    }

    fn link_after(&mut self, idx: u32, at: u32) {
        let next = self.records[at as usize].next;
        self.records[idx as usize].next = next;
        self.records[idx as usize].prev = at as i32;
        self.records[at as usize].next = idx as i32;
        if next == NIL {
            self.tail = idx as i32;
        } else {
            self.records[next as usize].prev = idx as i32;
        }
    }

    fn unlink(&mut self, idx: u32) {
        let prev = self.records[idx as usize].prev;
        let next = self.records[idx as usize].next;
        if prev == NIL {
            self.head = next;
        } else {
            self.records[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.records[next as usize].prev = prev;
        }
        self.records[idx as usize].prev = NIL;
        self.records[idx as usize].next = NIL;
    }
}

impl Default for TimerList {
    fn default() -> Self {
        Self::new()
    }
}
