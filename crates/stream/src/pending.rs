//! The pending side of a wallet feed: the set of unconfirmed activities
//! currently on display, deduplicated against everything that has already
//! finished.

use std::collections::HashSet;

use walletfeed_core_types::{sort_activities, ActivitiesUpdate, Activity};

use crate::bounded::FinishedHashSet;

/// How a batch of new data affects the pending set.
#[derive(Debug)]
pub enum PendingInput {
    /// A poll fetched the full pending list; it replaces the current one.
    Replace(Vec<Activity>),
    /// Socket updates; each replaces the entries under its message hash.
    Merge(Vec<ActivitiesUpdate>),
    /// The pending fetch failed; keep what is already displayed.
    Keep,
}

#[derive(Debug)]
pub struct PendingActivitySet {
    activities: Vec<Activity>,
    finished: FinishedHashSet,
}

impl PendingActivitySet {
    pub fn new(finished_capacity: usize) -> Self {
        Self {
            activities: Vec::new(),
            finished: FinishedHashSet::new(finished_capacity),
        }
    }

    /// Sorted newest-first.
    pub fn all(&self) -> &[Activity] {
        &self.activities
    }

    /// Applies one reconciliation step. `confirmed` marks hashes as finished
    /// regardless of where `input` came from, so a pending entry whose
    /// confirmed counterpart arrives in the same step is dropped, and a late
    /// pending delivery for an already-confirmed hash never resurfaces.
    pub fn update(&mut self, confirmed: &[Activity], input: PendingInput) {
        for hash in confirmed.iter().filter_map(|a| a.message_hash.as_deref()) {
            self.finished.insert(hash);
        }
        if let PendingInput::Merge(updates) = &input {
            for update in updates.iter().filter(|u| u.is_final()) {
                self.finished.insert(&update.message_hash);
            }
        }

        match input {
            PendingInput::Replace(mut all) => {
                sort_activities(&mut all);
                self.activities = all;
            }
            PendingInput::Merge(updates) if !updates.is_empty() => {
                let replaced: HashSet<&str> =
                    updates.iter().map(|u| u.message_hash.as_str()).collect();
                self.activities.retain(|a| {
                    a.message_hash
                        .as_deref()
                        .map_or(true, |h| !replaced.contains(h))
                });
                self.activities.extend(
                    updates
                        .into_iter()
                        .filter(|u| u.are_pending)
                        .flat_map(|u| u.activities),
                );
                sort_activities(&mut self.activities);
            }
            _ => {}
        }

        self.activities.retain(|a| {
            a.message_hash
                .as_deref()
                .map_or(true, |h| !self.finished.contains(h))
        });
    }
}
