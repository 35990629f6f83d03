//! Synchronization primitives for cooperatively-suspending processes.
//!
//! Everything here is single-threaded: "suspending" means the caller parks a
//! waiter token and returns to the scheduler; the releasing side gets the
//! token back and schedules its wake-up on the clock. Grant order is strict
//! FIFO everywhere.

use std::collections::VecDeque;

use crate::error::SyncError;

/// Outcome of [`CapacityResource::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Queued,
}

/// N interchangeable units with FIFO waiters.
#[derive(Debug)]
pub struct CapacityResource<W> {
    capacity: usize,
    in_use: usize,
    waiters: VecDeque<W>,
}

impl<W> CapacityResource<W> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: 0,
            waiters: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Take a unit if one is free, otherwise park `waiter` at the back of the
    /// FIFO. A `Queued` caller owns nothing until its wake-up fires.
    pub fn request(&mut self, waiter: W) -> Acquire {
        if self.in_use < self.capacity {
            self.in_use += 1;
            Acquire::Granted
        } else {
            self.waiters.push_back(waiter);
            Acquire::Queued
        }
    }

    /// Return a unit. Hands it straight to the longest waiter if any; the
    /// caller must schedule the returned token. Releasing with nothing held
    /// is a programming error.
    pub fn release(&mut self) -> Result<Option<W>, SyncError> {
        if self.in_use == 0 {
            return Err(SyncError::ReleaseWithoutHold);
        }
        if let Some(next) = self.waiters.pop_front() {
            // Unit moves directly to the waiter; in_use stays constant.
            Ok(Some(next))
        } else {
            self.in_use -= 1;
            Ok(None)
        }
    }
}

/// Outcome of [`BoundedQueue::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Put<W> {
    /// Item stored; if a getter was suspended, its token is handed back to
    /// be scheduled.
    Stored { woken_getter: Option<W> },
    /// Queue full; item and waiter are parked until a `get` frees a slot.
    Blocked,
}

/// Outcome of [`BoundedQueue::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Get<T, W> {
    /// Item delivered; if a putter was suspended its item has been admitted
    /// and its token is handed back to be scheduled.
    Item { item: T, woken_putter: Option<W> },
    Blocked,
}

/// FIFO item buffer with blocking put/get. `capacity: None` is unbounded.
#[derive(Debug)]
pub struct BoundedQueue<T, W> {
    capacity: Option<usize>,
    items: VecDeque<T>,
    get_waiters: VecDeque<W>,
    put_waiters: VecDeque<(W, T)>,
}

impl<T, W> BoundedQueue<T, W> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
            get_waiters: VecDeque::new(),
            put_waiters: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn waiting_getters(&self) -> usize {
        self.get_waiters.len()
    }

    pub fn waiting_putters(&self) -> usize {
        self.put_waiters.len()
    }

    fn has_space(&self) -> bool {
        match self.capacity {
            Some(cap) => self.items.len() < cap,
            None => true,
        }
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Non-suspending put for producers that must not block: stores the item
    /// (waking the longest-suspended getter) or hands it back when full.
    pub fn offer(&mut self, item: T) -> Result<Option<W>, T> {
        if self.has_space() {
            self.items.push_back(item);
            Ok(self.get_waiters.pop_front())
        } else {
            Err(item)
        }
    }

    /// Store `item`, waking the longest-suspended getter if there is one.
    /// When full, `waiter` and the item are parked FIFO.
    pub fn put(&mut self, item: T, waiter: W) -> Put<W> {
        if self.has_space() {
            self.items.push_back(item);
            Put::Stored {
                woken_getter: self.get_waiters.pop_front(),
            }
        } else {
            self.put_waiters.push_back((waiter, item));
            Put::Blocked
        }
    }

    /// Pop the head item. When one is taken, the longest-suspended putter's
    /// item is admitted into the freed slot and its token handed back. When
    /// empty, `waiter` is parked FIFO.
    pub fn get(&mut self, waiter: W) -> Get<T, W> {
        match self.items.pop_front() {
            Some(item) => {
                let woken_putter = self.put_waiters.pop_front().map(|(w, blocked_item)| {
                    self.items.push_back(blocked_item);
                    w
                });
                Get::Item { item, woken_putter }
            }
            None => {
                self.get_waiters.push_back(waiter);
                Get::Blocked
            }
        }
    }

    /// Non-suspending pop, used for batch draining by an already-woken
    /// consumer. Also admits a blocked putter's item, whose token the caller
    /// must schedule.
    pub fn try_get(&mut self) -> Option<(T, Option<W>)> {
        let item = self.items.pop_front()?;
        let woken_putter = self.put_waiters.pop_front().map(|(w, blocked_item)| {
            self.items.push_back(blocked_item);
            w
        });
        Some((item, woken_putter))
    }
}

/// One-shot event. `succeed` wakes all current waiters exactly once; the
/// next round needs a fresh instance (re-arming is an explicit step at the
/// call site, never implicit).
#[derive(Debug)]
pub struct Signal<W> {
    fired: bool,
    waiters: Vec<W>,
}

impl<W> Default for Signal<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Signal<W> {
    pub fn new() -> Self {
        Self {
            fired: false,
            waiters: Vec::new(),
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Returns `true` if the signal already fired (no suspension needed);
    /// otherwise parks the waiter.
    pub fn wait(&mut self, waiter: W) -> bool {
        if self.fired {
            true
        } else {
            self.waiters.push(waiter);
            false
        }
    }

    /// Fire the signal, returning every parked waiter for scheduling.
    pub fn succeed(&mut self) -> Result<Vec<W>, SyncError> {
        if self.fired {
            return Err(SyncError::SignalAlreadyFired);
        }
        self.fired = true;
        Ok(std::mem::take(&mut self.waiters))
    }
}
