// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::store::ObjectId;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

/// A single report emitted by a registered source.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub object_id: ObjectId,
    pub text: String,
    pub fraction: f64,
}

#[derive(Debug, Default)]
struct RegistryShared {
    queue: Mutex<VecDeque<ProgressEvent>>,
    active: Mutex<BTreeSet<ObjectId>>,
}

/// Hands out reporter handles for locally observed operations.
///
/// This is the explicit counterpart of untyped observer dispatch:
/// registering a source yields a scoped handle bound to the caller's
/// `ObjectId`; reports accumulate in a queue the owning handler drains on
/// each refresh, and dropping the handle deregisters the source. Reports
/// from a deregistered source are discarded.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    shared: Arc<RegistryShared>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under a caller-assigned id. Re-registering an
    /// id while a previous handle is live is a caller bug; the handles
    /// will then deregister each other's id on drop.
    pub fn register(&self, object_id: ObjectId) -> ProgressReporter {
        self.shared.active.lock().unwrap().insert(object_id);
        ProgressReporter {
            object_id,
            shared: self.shared.clone(),
        }
    }

    pub fn is_active(&self, object_id: ObjectId) -> bool {
        self.shared.active.lock().unwrap().contains(&object_id)
    }

    /// Drain everything reported since the last drain, in arrival order.
    pub fn drain(&self) -> Vec<ProgressEvent> {
        self.shared.queue.lock().unwrap().drain(..).collect()
    }
}

/// The reporting end of one registered source.
pub struct ProgressReporter {
    object_id: ObjectId,
    shared: Arc<RegistryShared>,
}

impl ProgressReporter {
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn report(&self, text: &str, fraction: f64) {
        if !self.shared.active.lock().unwrap().contains(&self.object_id) {
            return;
        }
        self.shared.queue.lock().unwrap().push_back(ProgressEvent {
            object_id: self.object_id,
            text: text.to_string(),
            fraction,
        });
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shared.active.lock().unwrap().remove(&self.object_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reports_arrive_in_order() {
        let registry = ProgressRegistry::new();
        let a = registry.register(1);
        let b = registry.register(2);
        a.report("a", 0.1);
        b.report("b", 0.2);
        a.report("a", 0.3);
        let events: Vec<_> = registry.drain().iter().map(|e| e.object_id).collect();
        assert_eq!(events, vec![1, 2, 1]);
        assert!(registry.drain().is_empty());
    }

    #[test]
    fn dropping_a_reporter_deregisters_its_source() {
        let registry = ProgressRegistry::new();
        let r = registry.register(7);
        assert!(registry.is_active(7));
        r.report("live", 0.5);
        drop(r);
        assert!(!registry.is_active(7));
        assert_eq!(registry.drain().len(), 1);
    }
}
