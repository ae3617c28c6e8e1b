//! Deterministic reductions over observed events.
//!
//! Every view the client shows is a fold over a multiset of immutable events.
//! The functions here are pure: the same multiset in any order gives the same
//! output. Timestamp ties are broken by the lexically smallest id.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

use crate::event::Event;

/// Canonical read order: newest first, then ascending id.
pub fn canonical_order(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Whether `candidate` supersedes `current` for the same logical key.
pub fn supersedes(candidate: &Event, current: &Event) -> bool {
    canonical_order(candidate, current) == Ordering::Less
}

/// Deduplicate by id and sort into canonical read order.
pub fn ordered(events: impl IntoIterator<Item = Event>) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut out: Vec<Event> = events
        .into_iter()
        .filter(|ev| seen.insert(ev.id.clone()))
        .collect();
    out.sort_by(canonical_order);
    out
}

/// Keep one event per logical key: the newest, ties to the smallest id.
///
/// Events for which `key` returns `None` are discarded.
pub fn latest_by<K, F>(events: impl IntoIterator<Item = Event>, mut key: F) -> BTreeMap<K, Event>
where
    K: Ord + Hash + Clone,
    F: FnMut(&Event) -> Option<K>,
{
    let mut out: BTreeMap<K, Event> = BTreeMap::new();
    for ev in events {
        let Some(k) = key(&ev) else {
            continue;
        };
        match out.get(&k) {
            Some(current) if !supersedes(&ev, current) => {}
            _ => {
                out.insert(k, ev);
            }
        }
    }
    out
}

/// Latest event for a replaceable kind, keyed by `(kind, d tag)`.
///
/// Events without a `d` tag share the empty identifier.
pub fn latest_replaceable(events: impl IntoIterator<Item = Event>) -> BTreeMap<(u32, String), Event> {
    latest_by(events, |ev| Some((ev.kind, ev.d_tag().unwrap_or_default().to_string())))
}

/// Newest event of `kind` with `d` tag `d`, if any.
pub fn latest_with_d(events: impl IntoIterator<Item = Event>, kind: u32, d: &str) -> Option<Event> {
    latest_replaceable(events).remove(&(kind, d.to_string()))
}

/// Newest event of `kind` regardless of tags.
pub fn latest_of_kind(events: impl IntoIterator<Item = Event>, kind: u32) -> Option<Event> {
    latest_by(events, |ev| (ev.kind == kind).then_some(())).remove(&())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn ev(id: &str, pubkey: &str, created_at: u64) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind: 42,
            tags: vec![],
            content: format!("{id}@{created_at}"),
            sig: String::new(),
        }
    }

    fn settings(id: &str, d: &str, created_at: u64) -> Event {
        Event {
            kind: 30199,
            tags: vec![Tag::new(["d", d])],
            ..ev(id, "op", created_at)
        }
    }

    /// Every rotation and the reversal of `events`.
    fn permutations(events: &[Event]) -> Vec<Vec<Event>> {
        let mut out = Vec::new();
        for i in 0..events.len() {
            let mut v = events.to_vec();
            v.rotate_left(i);
            out.push(v.clone());
            v.reverse();
            out.push(v);
        }
        out
    }

    #[test]
    fn ordered_drops_duplicate_ids() {
        let events = vec![ev("b", "x", 2), ev("a", "x", 1), ev("b", "x", 2), ev("a", "x", 1)];
        let out = ordered(events);
        let ids: Vec<_> = out.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn ordered_breaks_timestamp_ties_by_id() {
        let events = vec![ev("c", "x", 5), ev("a", "x", 5), ev("b", "x", 9)];
        let ids: Vec<_> = ordered(events).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn ordered_is_order_independent() {
        let events = vec![
            ev("d", "x", 3),
            ev("a", "y", 7),
            ev("c", "x", 3),
            ev("a", "y", 7),
            ev("e", "z", 1),
        ];
        let expected = ordered(events.clone());
        for perm in permutations(&events) {
            assert_eq!(ordered(perm), expected);
        }
    }

    #[test]
    fn latest_wins_per_key() {
        let events = vec![ev("a", "alice", 1), ev("b", "alice", 3), ev("c", "bob", 2), ev("d", "alice", 2)];
        let view = latest_by(events, |e| Some(e.pubkey.clone()));
        assert_eq!(view.len(), 2);
        assert_eq!(view["alice"].id, "b");
        assert_eq!(view["bob"].id, "c");
    }

    #[test]
    fn latest_wins_ties_prefer_smallest_id() {
        for perm in permutations(&[ev("z", "k", 4), ev("m", "k", 4), ev("q", "k", 4)]) {
            let view = latest_by(perm, |e| Some(e.pubkey.clone()));
            assert_eq!(view["k"].id, "m");
        }
    }

    #[test]
    fn latest_wins_is_order_independent() {
        let events = vec![
            ev("a", "p1", 1),
            ev("b", "p2", 5),
            ev("c", "p1", 9),
            ev("c", "p1", 9),
            ev("d", "p2", 5),
        ];
        let expected = latest_by(events.clone(), |e| Some(e.pubkey.clone()));
        for perm in permutations(&events) {
            assert_eq!(latest_by(perm, |e| Some(e.pubkey.clone())), expected);
        }
    }

    #[test]
    fn replaceable_keyed_by_kind_and_d() {
        let events = vec![
            settings("a", "arcade-push", 1),
            settings("b", "arcade-push", 2),
            settings("c", "arcade-settings", 1),
        ];
        let view = latest_replaceable(events.clone());
        assert_eq!(view.len(), 2);
        assert_eq!(view[&(30199, "arcade-push".to_string())].id, "b");
        assert_eq!(latest_with_d(events.clone(), 30199, "arcade-settings").unwrap().id, "c");
        assert!(latest_with_d(events, 30199, "missing").is_none());
    }

    #[test]
    fn latest_of_kind_ignores_other_kinds() {
        let mut meta = ev("m", "x", 1);
        meta.kind = 0;
        let newer_other = ev("n", "x", 10);
        assert_eq!(latest_of_kind(vec![meta, newer_other], 0).unwrap().id, "m");
    }
}
