//! Accepted units that have not reported yet.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use weft_core::Value;
use weft_dataflow::{Completion, ExecFailure};

struct Slot {
    done: Completion,
    started: bool,
}

/// Completion tokens keyed by backend ticket
#[derive(Default)]
pub(crate) struct Backlog {
    slots: Mutex<HashMap<u64, Slot>>,
    drained: Condvar,
}

impl Backlog {
    pub(crate) fn insert(&self, ticket: u64, done: Completion) {
        self.slots.lock().insert(ticket, Slot { done, started: false });
    }

    /// Mark a unit as running. False if it was withdrawn or abandoned.
    pub(crate) fn claim(&self, ticket: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(&ticket) {
            Some(slot) => {
                slot.started = true;
                slot.done.started();
                true
            }
            None => false,
        }
    }

    /// Report an outcome. False if the ticket is unknown.
    pub(crate) fn finish(&self, ticket: u64, outcome: Result<Value, ExecFailure>) -> bool {
        match self.remove(ticket) {
            Some(slot) => {
                slot.done.finish(outcome);
                true
            }
            None => false,
        }
    }

    /// Withdraw a unit that has not started
    pub(crate) fn withdraw(&self, ticket: u64) -> bool {
        let slot = {
            let mut slots = self.slots.lock();
            if !slots.get(&ticket).is_some_and(|slot| !slot.started) {
                return false;
            }
            let slot = slots.remove(&ticket);
            if slots.is_empty() {
                self.drained.notify_all();
            }
            slot
        };
        if let Some(slot) = slot {
            slot.done.withdraw();
        }
        true
    }

    /// Drop a token whose submission failed
    pub(crate) fn discard(&self, ticket: u64) {
        drop(self.remove(ticket));
    }

    /// Drop every token. Each reports `WorkerLost`.
    pub(crate) fn abandon_all(&self) -> usize {
        let abandoned: Vec<Slot> = {
            let mut slots = self.slots.lock();
            let taken = slots.drain().map(|(_, slot)| slot).collect();
            self.drained.notify_all();
            taken
        };
        abandoned.len()
    }

    pub(crate) fn wait_drained(&self) {
        let mut slots = self.slots.lock();
        while !slots.is_empty() {
            self.drained.wait(&mut slots);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn remove(&self, ticket: u64) -> Option<Slot> {
        let mut slots = self.slots.lock();
        let slot = slots.remove(&ticket);
        if slots.is_empty() {
            self.drained.notify_all();
        }
        slot
    }
}
