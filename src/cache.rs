//! File-backed local event cache answering `local_only` fetches.

use std::{
    collections::HashSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde_json::to_writer;

use crate::error::Result;
use crate::event::Event;
use crate::filter::Filter;

/// Tags indexed for lookup.
const INDEXED_TAGS: [&str; 3] = ["e", "p", "d"];

/// Persistent cache of events and lookup indexes rooted at `root`.
#[derive(Debug, Clone)]
pub struct EventCache {
    root: PathBuf,
}

impl EventCache {
    /// Create a cache rooted at `root`, creating its directory tree.
    pub fn open(root: PathBuf) -> Result<Self> {
        let cache = Self { root };
        cache.init()?;
        Ok(cache)
    }

    fn init(&self) -> Result<()> {
        fs::create_dir_all(self.root.join("events"))?;
        fs::create_dir_all(self.root.join("index/by-author"))?;
        fs::create_dir_all(self.root.join("index/by-kind"))?;
        for tag in INDEXED_TAGS {
            fs::create_dir_all(self.root.join("index/by-tag").join(tag))?;
        }
        Ok(())
    }

    /// Store an event unless already present. Returns whether it was new.
    pub fn ingest(&self, ev: &Event) -> Result<bool> {
        if !is_event_id(&ev.id) {
            return Ok(false);
        }
        let path = self.event_path(&ev.id);
        if path.exists() {
            return Ok(false);
        }
        let parent_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent_dir)?;
        let tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
        to_writer(&tmp, ev)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        self.index_event(ev)?;
        Ok(true)
    }

    fn index_event(&self, ev: &Event) -> Result<()> {
        self.append_index("index/by-author", &ev.pubkey, &ev.id)?;
        self.append_index("index/by-kind", &ev.kind.to_string(), &ev.id)?;
        for tag in INDEXED_TAGS {
            for value in ev.tag_values(tag) {
                if is_safe_name(value) {
                    self.append_index(&format!("index/by-tag/{tag}"), value, &ev.id)?;
                }
            }
        }
        Ok(())
    }

    /// Append an event ID to the index file under `prefix/name.txt`.
    fn append_index(&self, prefix: &str, name: &str, id: &str) -> Result<()> {
        if !is_safe_name(name) {
            return Ok(());
        }
        let path = self.root.join(prefix).join(format!("{name}.txt"));
        let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{id}")?;
        Ok(())
    }

    fn event_path(&self, id: &str) -> PathBuf {
        self.root
            .join("events")
            .join(&id[0..2])
            .join(&id[2..4])
            .join(format!("{id}.json"))
    }

    fn load_ids(&self, prefix: &str, keys: &[String]) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for key in keys.iter().filter(|k| is_safe_name(k)) {
            ids.extend(read_ids(&self.root.join(prefix).join(format!("{key}.txt")))?);
        }
        Ok(ids)
    }

    /// Events matching `filter`, newest first, truncated to its limit.
    ///
    /// Candidates come from intersecting the id, author, kind and tag indexes;
    /// a filter constraining none of them matches nothing.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let mut sets: Vec<HashSet<String>> = vec![];
        if let Some(ids) = filter.ids.as_ref().filter(|v| !v.is_empty()) {
            sets.push(ids.iter().cloned().collect());
        }
        if let Some(authors) = filter.authors.as_ref().filter(|v| !v.is_empty()) {
            sets.push(self.load_ids("index/by-author", authors)?);
        }
        if let Some(kinds) = filter.kinds.as_ref().filter(|v| !v.is_empty()) {
            let keys: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
            sets.push(self.load_ids("index/by-kind", &keys)?);
        }
        for (tag, values) in &filter.tags {
            if INDEXED_TAGS.contains(&tag.as_str()) && !values.is_empty() {
                sets.push(self.load_ids(&format!("index/by-tag/{tag}"), values)?);
            }
        }
        let mut iter = sets.into_iter();
        let Some(mut ids) = iter.next() else {
            return Ok(vec![]);
        };
        for s in iter {
            ids = ids.intersection(&s).cloned().collect();
        }

        let mut events: Vec<Event> = ids
            .into_iter()
            .filter(|id| is_event_id(id))
            .filter_map(|id| {
                let data = fs::read_to_string(self.event_path(&id)).ok()?;
                serde_json::from_str(&data).ok()
            })
            .filter(|ev| filter.matches(ev))
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}

/// Ids become path segments; only hex ids are stored or looked up.
fn is_event_id(id: &str) -> bool {
    id.len() >= 4 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Index keys become file names; reject anything that could escape the tree.
fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 128 && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Read newline-separated IDs from a text file.
fn read_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(Default::default());
    }
    let data = fs::read_to_string(path)?;
    Ok(data.lines().map(|s| s.to_string()).collect())
}
