//! Fixed-capacity connection table.
//!
//! Slots are preallocated once at startup and recycled through an intrusive
//! free list. A slot is addressed by a generation-tagged [`ConnId`], so a
//! kernel-reused socket descriptor can never alias a stale logical
//! connection: freeing a slot bumps its generation and every lookup checks
//! the tag.

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::config::ServerConfig;
use crate::conn::HttpConnection;
use crate::timer::TimerHandle;

const NIL: i32 = -1;

/// Generation-tagged connection identifier, packed into the epoll token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId {
    pub index: u32,
    pub generation: u32,
}

impl ConnId {
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

struct Slot {
    conn: Arc<Mutex<HttpConnection>>,
    timer: Option<TimerHandle>,
    fd: RawFd,
    generation: u32,
    next_free: i32,
    occupied: bool,
}

pub struct ConnectionTable {
    slots: Box<[Slot]>,
    free_head: i32,
    live: usize,
}

impl ConnectionTable {
    /// Allocate every slot up front; connection buffers are reused across
    /// the slot's whole lifetime.
    pub fn new(capacity: usize, config: Arc<ServerConfig>) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                conn: Arc::new(Mutex::new(HttpConnection::new(config.clone()))),
                timer: None,
                fd: -1,
                generation: 0,
                next_free: if i + 1 == capacity { NIL } else { (i + 1) as i32 },
                occupied: false,
            });
        }
        Self {
            slots: slots.into_boxed_slice(),
            free_head: if capacity == 0 { NIL } else { 0 },
            live: 0,
        }
    }

    /// O(1) allocation off the free list; `None` at capacity.
    pub fn allocate(&mut self, fd: RawFd) -> Option<ConnId> {
        if self.free_head == NIL {
            return None;
        }
        let index = self.free_head as usize;
        let slot = &mut self.slots[index];
        self.free_head = slot.next_free;
        slot.occupied = true;
        slot.fd = fd;
        slot.timer = None;
        self.live += 1;
        Some(ConnId {
            index: index as u32,
            generation: slot.generation,
        })
    }

    /// O(1) release. Bumps the generation so stale identifiers stop
    /// resolving. The caller is responsible for closing the descriptor and
    /// unlinking the timer first.
    pub fn free(&mut self, id: ConnId) {
        let Some(index) = self.check(id) else { return };
        let slot = &mut self.slots[index];
        slot.occupied = false;
        slot.fd = -1;
        slot.timer = None;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = index as i32;
        self.live -= 1;
    }

    fn check(&self, id: ConnId) -> Option<usize> {
        let index = id.index as usize;
        let slot = self.slots.get(index)?;
        if slot.occupied && slot.generation == id.generation {
            Some(index)
        } else {
            None
        }
    }

    pub fn conn(&self, id: ConnId) -> Option<&Arc<Mutex<HttpConnection>>> {
        self.check(id).map(|i| &self.slots[i].conn)
    }

    pub fn fd(&self, id: ConnId) -> Option<RawFd> {
        self.check(id).map(|i| self.slots[i].fd)
    }

    pub fn timer(&self, id: ConnId) -> Option<TimerHandle> {
        self.check(id).and_then(|i| self.slots[i].timer)
    }

    pub fn set_timer(&mut self, id: ConnId, timer: Option<TimerHandle>) {
        if let Some(index) = self.check(id) {
            self.slots[index].timer = timer;
        }
    }

    /// Number of slots currently open and not torn down.
    pub fn live(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize) -> ConnectionTable {
        ConnectionTable::new(capacity, Arc::new(ServerConfig::default()))
    }

    #[test]
    fn test_token_round_trip() {
        let id = ConnId {
            index: 42,
            generation: 7,
        };
        assert_eq!(ConnId::from_token(id.token()), id);
    }

    #[test]
    fn test_allocate_free_live_count() {
        let mut t = table(3);
        assert_eq!(t.live(), 0);

        let a = t.allocate(100).unwrap();
        let b = t.allocate(101).unwrap();
        assert_eq!(t.live(), 2);
        assert_eq!(t.fd(a), Some(100));

        t.free(a);
        assert_eq!(t.live(), 1);
        assert_eq!(t.fd(b), Some(101));

        // Slot is recycled LIFO.
        let c = t.allocate(102).unwrap();
        assert_eq!(c.index, a.index);
        assert_eq!(t.live(), 2);
    }

    #[test]
    fn test_stale_id_never_resolves() {
        let mut t = table(2);
        let a = t.allocate(100).unwrap();
        t.free(a);

        let b = t.allocate(200).unwrap();
        assert_eq!(b.index, a.index);
        assert_ne!(b.generation, a.generation);

        // The old identifier aliases nothing.
        assert!(t.conn(a).is_none());
        assert!(t.fd(a).is_none());
        t.free(a);
        assert_eq!(t.live(), 1);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut t = table(2);
        t.allocate(1).unwrap();
        t.allocate(2).unwrap();
        assert!(t.allocate(3).is_none());
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut t = table(2);
        let a = t.allocate(1).unwrap();
        t.free(a);
        t.free(a);
        assert_eq!(t.live(), 0);
    }
}
