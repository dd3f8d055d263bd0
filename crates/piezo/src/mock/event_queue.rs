// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The ordered set of pending firings.
//!
//! Events are serviced in strictly ascending deadline order; two events
//! sharing a deadline are serviced in insertion order. Identity is the
//! [`EventId`], not the deadline: a periodic event keeps its id across
//! re-insertions, which is what lets a handle stop or reschedule it later.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

// Using ahash for faster hashing operations. See: https://github.com/garro95/priority-queue#speeding-up
type OrderedEvents<T> =
    priority_queue::DoublePriorityQueue<Entry<T>, FireKey, ahash::RandomState>;

/// Identifies one scheduled event for the lifetime of its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EventId(u64);

/// Service order: deadline first, insertion order on ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FireKey {
    deadline: SystemTime,
    seq: u64,
}

struct Entry<T> {
    id: EventId,
    payload: T,
}

// Entries hash and compare by id only, so the queue can be addressed by
// `EventId` through `Borrow`.
impl<T> Hash for Entry<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Borrow<EventId> for Entry<T> {
    fn borrow(&self) -> &EventId {
        &self.id
    }
}

pub(crate) struct EventQueue<T> {
    queue: OrderedEvents<T>,
    next_id: u64,
    next_seq: u64,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self {
            queue: OrderedEvents::default(),
            next_id: 0,
            next_seq: 0,
        }
    }
}

impl<T> EventQueue<T> {
    /// Allocates an id for a new event. The id stays valid across
    /// re-insertions until the event is removed for good.
    pub(crate) fn alloc(&mut self) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Inserts (or re-inserts) the event with the given deadline.
    pub(crate) fn insert(&mut self, id: EventId, deadline: SystemTime, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue
            .push(Entry { id, payload }, FireKey { deadline, seq });
    }

    /// Pops the earliest event if its deadline is at or before `threshold`.
    pub(crate) fn pop_due(&mut self, threshold: SystemTime) -> Option<(EventId, SystemTime, T)> {
        let (_, key) = self.queue.peek_min()?;
        if key.deadline > threshold {
            return None;
        }
        let (entry, key) = self
            .queue
            .pop_min()
            .expect("peeked entry must still be present");
        Some((entry.id, key.deadline, entry.payload))
    }

    /// Removes the event, returning its payload if it was still pending.
    pub(crate) fn remove(&mut self, id: EventId) -> Option<T> {
        self.queue.remove(&id).map(|(entry, _)| entry.payload)
    }

    /// The earliest pending deadline, if any event is scheduled.
    pub(crate) fn next_deadline(&self) -> Option<SystemTime> {
        self.queue.peek_min().map(|(_, key)| key.deadline)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
