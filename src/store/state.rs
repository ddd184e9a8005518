//! Pure reconciliation state for the notification store.
//!
//! [`StoreState`] is single-threaded by construction; the actor in the
//! parent module is the only code that touches it. It combines baseline
//! snapshots, live pushes, and optimistic local mutations into one
//! deduplicated, ordered view, and produces the rollback records the
//! actor applies when a gateway call fails.
//!
//! Two rules do the heavy lifting:
//!
//! - `mutation_version > 0` marks an entry carrying a local optimistic
//!   mutation. Baseline data may be a stale snapshot taken before that
//!   mutation, so the baseline's `is_read` is discarded for such entries.
//! - An id deleted in this session stays dead: a tombstone holds the data
//!   for rollback while the delete is in flight, and once confirmed the id
//!   is never re-admitted via push or baseline.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{Notification, SortKey};

/// A notification plus its local mutation counter.
#[derive(Debug, Clone)]
pub struct StoreEntry {
    /// The notification as currently visible.
    pub notification: Notification,
    /// Incremented on every local optimistic change; zero means the entry
    /// only reflects server-observed state.
    pub mutation_version: u64,
}

/// Rollback record for a single mark-read.
#[derive(Debug, Clone)]
pub struct MarkReadRollback {
    pub(crate) id: String,
    pub(crate) was_read: bool,
    pub(crate) prev_version: u64,
    /// Version this operation assigned; rollback only applies while the
    /// entry still carries it (a later mutation takes precedence).
    pub(crate) set_version: u64,
}

/// Rollback record for one entry touched by mark-all-read.
#[derive(Debug, Clone)]
pub struct MarkAllRollback {
    pub(crate) id: String,
    pub(crate) prev_version: u64,
    /// Version this operation assigned; rollback only applies while the
    /// entry still carries it (a later mutation takes precedence).
    pub(crate) set_version: u64,
}

/// Reconciliation state: entries keyed by id plus a sorted index.
#[derive(Debug, Default)]
pub struct StoreState {
    entries: HashMap<String, StoreEntry>,
    /// Newest-first index over the visible entries.
    order: BTreeMap<SortKey, String>,
    /// Optimistically deleted entries retained for rollback.
    tombstones: HashMap<String, StoreEntry>,
    /// Every id deleted this session; such ids are never re-admitted.
    dead: HashSet<String>,
}

impl StoreState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of visible entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the visible list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a visible entry.
    pub fn get(&self, id: &str) -> Option<&StoreEntry> {
        self.entries.get(id)
    }

    /// The visible list: strict descending `(created_at, id)`, no
    /// duplicate ids.
    pub fn visible(&self) -> Vec<Notification> {
        self.order
            .values()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.notification.clone())
            .collect()
    }

    /// Merge a baseline snapshot.
    ///
    /// Absent ids are inserted at version zero. Present ids with a local
    /// mutation (`mutation_version > 0`) keep their local `is_read`; the
    /// baseline value is discarded as potentially stale. Entries missing
    /// from the snapshot are not removed - a push may have delivered
    /// something the snapshot predates; removal happens only through a
    /// confirmed delete.
    pub fn merge_baseline(&mut self, baseline: Vec<Notification>) {
        for notification in baseline {
            if self.dead.contains(&notification.id) {
                continue;
            }
            match self.entries.get_mut(&notification.id) {
                None => self.insert(notification),
                Some(entry) => {
                    if entry.mutation_version == 0 {
                        entry.notification.is_read = notification.is_read;
                    }
                }
            }
        }
    }

    /// Apply a pushed notification. Returns whether anything changed.
    ///
    /// A duplicate id is a baseline item arriving out of order and is
    /// ignored; at-least-once delivery with dedup.
    pub fn apply_push(&mut self, notification: Notification) -> bool {
        if self.dead.contains(&notification.id) || self.entries.contains_key(&notification.id) {
            return false;
        }
        self.insert(notification);
        true
    }

    /// Optimistically mark an entry read. `None` if the id is unknown.
    pub fn begin_mark_read(&mut self, id: &str) -> Option<MarkReadRollback> {
        let entry = self.entries.get_mut(id)?;
        let was_read = entry.notification.is_read;
        let prev_version = entry.mutation_version;
        entry.notification.is_read = true;
        entry.mutation_version += 1;
        Some(MarkReadRollback {
            id: id.to_string(),
            was_read,
            prev_version,
            set_version: entry.mutation_version,
        })
    }

    /// Revert a failed mark-read to its pre-mutation state.
    ///
    /// Only applies while the entry still carries the version this
    /// operation assigned; an entry a later operation touched keeps that
    /// later state.
    pub fn rollback_mark_read(&mut self, rollback: &MarkReadRollback) {
        if let Some(entry) = self.entries.get_mut(&rollback.id) {
            if entry.mutation_version == rollback.set_version {
                entry.notification.is_read = rollback.was_read;
                entry.mutation_version = rollback.prev_version;
            }
        }
    }

    /// Optimistically mark every unread entry read.
    ///
    /// Returns one rollback record per entry actually changed; entries
    /// already read are untouched and not recorded.
    pub fn begin_mark_all_read(&mut self) -> Vec<MarkAllRollback> {
        let mut rollbacks = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.notification.is_read {
                continue;
            }
            let prev_version = entry.mutation_version;
            entry.notification.is_read = true;
            entry.mutation_version += 1;
            rollbacks.push(MarkAllRollback {
                id: entry.notification.id.clone(),
                prev_version,
                set_version: entry.mutation_version,
            });
        }
        rollbacks
    }

    /// Revert a failed mark-all-read.
    ///
    /// Only entries still carrying the version this operation assigned
    /// are reverted; entries a later operation touched keep that later
    /// state.
    pub fn rollback_mark_all_read(&mut self, rollbacks: &[MarkAllRollback]) {
        for rollback in rollbacks {
            if let Some(entry) = self.entries.get_mut(&rollback.id) {
                if entry.mutation_version == rollback.set_version {
                    entry.notification.is_read = false;
                    entry.mutation_version = rollback.prev_version;
                }
            }
        }
    }

    /// Optimistically delete an entry, retaining a tombstone for
    /// rollback. Returns false if the id is unknown.
    pub fn begin_delete(&mut self, id: &str) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        self.order.remove(&entry.notification.sort_key());
        self.dead.insert(id.to_string());
        self.tombstones.insert(id.to_string(), entry);
        true
    }

    /// Reinsert a tombstoned entry after a failed delete.
    ///
    /// The sort key is derived from the entry itself, so it lands back at
    /// its original position in the visible list.
    pub fn rollback_delete(&mut self, id: &str) {
        if let Some(entry) = self.tombstones.remove(id) {
            self.dead.remove(id);
            self.order
                .insert(entry.notification.sort_key(), id.to_string());
            self.entries.insert(id.to_string(), entry);
        }
    }

    /// Collect the tombstone of a confirmed delete. The id stays dead for
    /// the rest of the session.
    pub fn confirm_delete(&mut self, id: &str) {
        self.tombstones.remove(id);
    }

    fn insert(&mut self, notification: Notification) {
        self.order
            .insert(notification.sort_key(), notification.id.clone());
        self.entries.insert(
            notification.id.clone(),
            StoreEntry {
                notification,
                mutation_version: 0,
            },
        );
    }

    /// Consistency check used by tests: the index and the entry map agree
    /// and the visible list is strictly descending with unique ids.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        assert_eq!(self.order.len(), self.entries.len());
        let list = self.visible();
        let mut seen = HashSet::new();
        for window in list.windows(2) {
            let a = &window[0];
            let b = &window[1];
            assert!(
                a.sort_key() < b.sort_key(),
                "visible list not strictly descending: {} before {}",
                a.id,
                b.id
            );
        }
        for n in &list {
            assert!(seen.insert(n.id.clone()), "duplicate id {}", n.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NotificationKind;
    use chrono::{TimeZone, Utc};

    fn notif(id: &str, secs: i64, is_read: bool) -> Notification {
        Notification {
            id: id.to_string(),
            recipient_id: "u-1".to_string(),
            actor_id: "u-2".to_string(),
            kind: NotificationKind::Comment,
            message: format!("message {id}"),
            created_at: Utc.timestamp_opt(secs, 0).single().unwrap(),
            is_read,
        }
    }

    fn ids(state: &StoreState) -> Vec<String> {
        state.visible().into_iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_baseline_then_push_orders_newest_first() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false), notif("b", 5, false)]);
        assert!(state.apply_push(notif("c", 15, false)));

        assert_eq!(ids(&state), vec!["c", "a", "b"]);
        state.assert_invariants();
    }

    #[test]
    fn test_push_duplicate_of_baseline_is_ignored() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        assert!(!state.apply_push(notif("a", 10, false)));
        assert_eq!(state.len(), 1);
        state.assert_invariants();
    }

    #[test]
    fn test_baseline_duplicate_of_push_is_deduped() {
        let mut state = StoreState::new();
        assert!(state.apply_push(notif("d", 20, false)));
        state.merge_baseline(vec![notif("d", 20, false), notif("e", 1, true)]);
        assert_eq!(state.len(), 2);
        assert_eq!(ids(&state), vec!["d", "e"]);
        state.assert_invariants();
    }

    #[test]
    fn test_interleaved_merge_and_push_never_duplicates() {
        let mut state = StoreState::new();
        for round in 0..5 {
            state.merge_baseline((0..10).map(|i| notif(&format!("n{i}"), i, false)).collect());
            for i in 0..10 {
                state.apply_push(notif(&format!("n{i}"), i, false));
                state.apply_push(notif(&format!("p{round}-{i}"), 100 + i, false));
            }
            state.assert_invariants();
        }
        assert_eq!(state.len(), 10 + 5 * 10);
    }

    #[test]
    fn test_stale_baseline_does_not_regress_local_mark_read() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        let rollback = state.begin_mark_read("a").unwrap();
        assert_eq!(rollback.prev_version, 0);
        assert!(state.get("a").unwrap().notification.is_read);

        // Stale snapshot taken before the local mutation.
        state.merge_baseline(vec![notif("a", 10, false)]);
        assert!(
            state.get("a").unwrap().notification.is_read,
            "stale baseline must not flip a locally-mutated entry back to unread"
        );
        state.assert_invariants();
    }

    #[test]
    fn test_baseline_updates_unmutated_entries() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        // Server now reports it read (e.g. read on another device).
        state.merge_baseline(vec![notif("a", 10, true)]);
        assert!(state.get("a").unwrap().notification.is_read);
    }

    #[test]
    fn test_baseline_absence_does_not_remove() {
        let mut state = StoreState::new();
        state.apply_push(notif("fresh", 50, false));
        state.merge_baseline(vec![notif("old", 1, false)]);
        assert_eq!(state.len(), 2, "snapshot absence must not evict pushed entries");
    }

    #[test]
    fn test_mark_read_rollback_restores_prior_state() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        let rollback = state.begin_mark_read("a").unwrap();

        state.rollback_mark_read(&rollback);
        let entry = state.get("a").unwrap();
        assert!(!entry.notification.is_read);
        assert_eq!(entry.mutation_version, 0);
    }

    #[test]
    fn test_mark_read_rollback_skips_later_mutation() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        let first = state.begin_mark_read("a").unwrap();
        let second = state.begin_mark_read("a").unwrap();

        // The first call fails after the second already moved the entry on;
        // the stale rollback must not clobber the newer state.
        state.rollback_mark_read(&first);
        let entry = state.get("a").unwrap();
        assert!(entry.notification.is_read, "later mutation keeps its state");
        assert_eq!(entry.mutation_version, second.set_version);
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        state.begin_mark_read("a").unwrap();
        let second = state.begin_mark_read("a").unwrap();
        assert!(second.was_read, "second application sees already-read state");
        assert!(state.get("a").unwrap().notification.is_read);

        // Rolling back only the second application changes nothing visible.
        state.rollback_mark_read(&second);
        assert!(state.get("a").unwrap().notification.is_read);
    }

    #[test]
    fn test_mark_read_unknown_id() {
        let mut state = StoreState::new();
        assert!(state.begin_mark_read("ghost").is_none());
    }

    #[test]
    fn test_delete_and_rollback_restores_position() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![
            notif("c", 15, false),
            notif("a", 10, false),
            notif("b", 5, false),
        ]);
        assert!(state.begin_delete("a"));
        assert_eq!(ids(&state), vec!["c", "b"]);

        state.rollback_delete("a");
        assert_eq!(ids(&state), vec!["c", "a", "b"]);
        state.assert_invariants();
    }

    #[test]
    fn test_confirmed_delete_blocks_readmission() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        assert!(state.begin_delete("a"));
        state.confirm_delete("a");

        assert!(!state.apply_push(notif("a", 10, false)));
        state.merge_baseline(vec![notif("a", 10, false)]);
        assert!(state.is_empty(), "a deleted id is dead for the session");
    }

    #[test]
    fn test_pending_delete_blocks_push() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false)]);
        assert!(state.begin_delete("a"));
        // Push races with the in-flight delete.
        assert!(!state.apply_push(notif("a", 10, false)));
        // A failed delete restores the entry once, not twice.
        state.rollback_delete("a");
        assert_eq!(state.len(), 1);
        state.assert_invariants();
    }

    #[test]
    fn test_mark_all_read_flips_only_unread() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, true), notif("b", 5, false)]);
        let rollbacks = state.begin_mark_all_read();
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].id, "b");
        assert!(state.visible().iter().all(|n| n.is_read));
    }

    #[test]
    fn test_mark_all_rollback_skips_later_mutations() {
        let mut state = StoreState::new();
        state.merge_baseline(vec![notif("a", 10, false), notif("b", 5, false)]);
        let rollbacks = state.begin_mark_all_read();

        // A later local mutation bumps b past the version mark-all set.
        state.begin_mark_read("b").unwrap();

        state.rollback_mark_all_read(&rollbacks);
        assert!(
            !state.get("a").unwrap().notification.is_read,
            "a reverts: only mark-all touched it"
        );
        assert!(
            state.get("b").unwrap().notification.is_read,
            "b keeps the later mutation"
        );
    }

    #[test]
    fn test_tiebreak_ordering_is_deterministic() {
        let mut state = StoreState::new();
        state.apply_push(notif("x", 10, false));
        state.apply_push(notif("y", 10, false));
        assert_eq!(ids(&state), vec!["y", "x"], "id descending on equal timestamps");
        state.assert_invariants();
    }
}
