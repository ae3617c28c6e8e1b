//! Subscription filters sent in `REQ` messages and matched locally.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// NIP-01 filter. Empty or absent fields do not constrain the match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Tag constraints keyed by tag name without the `#` prefix.
    pub tags: BTreeMap<String, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Constrain tag `name` (e.g. `p`) to any of `values`.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.trim_start_matches('#').to_string();
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Render the filter as the JSON object carried in a `REQ`.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(ids) = non_empty(&self.ids) {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = non_empty(&self.authors) {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = non_empty(&self.kinds) {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            map.insert(format!("#{tag}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        map
    }

    /// Whether `ev` satisfies every constraint except `limit`.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = non_empty(&self.ids) {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = non_empty(&self.authors) {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = non_empty(&self.kinds) {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (tag, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            if !ev.tag_values(tag).any(|v| values.iter().any(|want| want == v)) {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s) && self.until.map_or(true, |u| ev.created_at <= u)
    }
}

fn non_empty<T>(v: &Option<Vec<T>>) -> Option<&Vec<T>> {
    v.as_ref().filter(|v| !v.is_empty())
}

fn strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn ev(id: &str, pubkey: &str, kind: u32, created_at: u64, tags: Vec<Tag>) -> Event {
        Event {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn renders_req_object() {
        let f = Filter::new()
            .authors(["p1"])
            .kinds([4])
            .tag("#p", ["me"])
            .since(5)
            .limit(500);
        let json = Value::Object(f.to_json());
        assert_eq!(
            json,
            serde_json::json!({
                "authors": ["p1"],
                "kinds": [4],
                "#p": ["me"],
                "since": 5,
                "limit": 500
            })
        );
    }

    #[test]
    fn empty_lists_are_omitted() {
        let f = Filter {
            authors: Some(vec![]),
            ..Filter::default()
        };
        assert!(f.to_json().is_empty());
        assert!(f.matches(&ev("a", "x", 1, 1, vec![])));
    }

    #[test]
    fn matches_tags_and_time_window() {
        let f = Filter::new().kinds([42]).tag("e", ["chan"]).since(10).until(20);
        let inside = ev("a", "x", 42, 15, vec![Tag::new(["e", "chan", "", "root"])]);
        let other_channel = ev("b", "x", 42, 15, vec![Tag::new(["e", "other"])]);
        let too_old = ev("c", "x", 42, 5, vec![Tag::new(["e", "chan"])]);
        let wrong_kind = ev("d", "x", 1, 15, vec![Tag::new(["e", "chan"])]);
        assert!(f.matches(&inside));
        assert!(!f.matches(&other_channel));
        assert!(!f.matches(&too_old));
        assert!(!f.matches(&wrong_kind));
    }
}
