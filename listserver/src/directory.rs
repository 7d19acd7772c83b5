//! The list of advertised game servers.
//!
//! Entries live in an arena and are reference counted. The directory holds
//! one reference while an entry is fresh, and every LIST cursor holds one
//! for each entry it has not passed yet. An entry that stops refreshing is
//! marked stale, which drops the directory's reference exactly once, and it
//! is freed by the next `check_list` that finds it unreferenced.

use crate::error::DirectoryError;
use crate::request::AddRequest;
use log::{debug, info};
use shared::gameinfo::{repack_counts, TEAM_COUNT};
use shared::protocol::{DEFAULT_SERVER_PORT, VERSION_PREFIX};
use std::collections::HashSet;
use std::time::{Duration, Instant, SystemTime};

pub const MAX_TITLE_LEN: usize = 127;

pub type EntryId = usize;

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub version: String,
    pub build: String,
    pub game_info: String,
    pub title: String,
    /// Numeric address clients should use, filled in from the request's
    /// source or the reachability probe.
    pub address: String,
    updated: Instant,
    ref_count: u32,
    fresh: bool,
}

impl Entry {
    pub fn new(request: AddRequest, address: String, now: Instant) -> Self {
        Self {
            name: request.name,
            version: request.version,
            build: request.build,
            game_info: request.game_info,
            title: clean_title(&request.title),
            address,
            updated: now,
            ref_count: 1,
            fresh: true,
        }
    }

    /// Host part of the name.
    pub fn host(&self) -> &str {
        self.name.split_once(':').map_or(self.name.as_str(), |(host, _)| host)
    }

    /// Port part of the name, defaulting to the game port.
    pub fn port(&self) -> Option<u16> {
        match self.name.split_once(':') {
            Some((_, port)) => port.parse().ok().filter(|&p| p != 0),
            None => Some(DEFAULT_SERVER_PORT),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn is_referenced(&self) -> bool {
        self.ref_count > 0
    }

    pub fn is_stale(&self, now: Instant, expiration: Duration) -> bool {
        now.saturating_duration_since(self.updated) >= expiration
    }

    fn add_ref(&mut self) {
        self.ref_count += 1;
    }

    fn unref(&mut self) {
        debug_assert!(self.ref_count > 0);
        self.ref_count = self.ref_count.saturating_sub(1);
    }

    /// Drops the directory's reference, once.
    pub fn set_stale(&mut self) {
        if self.fresh {
            self.unref();
            debug!("Server {} is stale", self.name);
        }
        self.fresh = false;
    }

    pub fn set_fresh(&mut self, now: Instant) {
        if !self.fresh {
            self.add_ref();
            debug!("Server {} is fresh", self.name);
        }
        self.updated = now;
        self.fresh = true;
    }

    /// One LIST reply line.
    pub fn list_line(&self) -> String {
        format!(
            "{} {} {} {} {}\r\n",
            self.name, self.version, self.game_info, self.address, self.title
        )
    }
}

fn clean_title(title: &str) -> String {
    title
        .chars()
        .take(MAX_TITLE_LEN)
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .collect()
}

#[derive(Debug)]
pub enum AddOutcome {
    Refreshed(EntryId),
    Inserted(EntryId),
    /// The caller must probe the server and hand the entry back through
    /// [`Directory::finish_probe`].
    NeedsProbe(Entry),
}

pub struct Directory {
    slots: Vec<Option<Entry>>,
    order: Vec<EntryId>,
    probing: HashSet<String>,
    expiration: Duration,
    last_change: SystemTime,
}

impl Directory {
    pub fn new(expiration: Duration) -> Self {
        Self {
            slots: Vec::new(),
            order: Vec::new(),
            probing: HashSet::new(),
            expiration,
            last_change: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn last_change(&self) -> SystemTime {
        self.last_change
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub fn find(&self, name: &str) -> Option<EntryId> {
        self.order
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|entry| entry.name == name))
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.order.iter().filter_map(|&id| self.get(id))
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    fn touch(&mut self) {
        self.last_change = SystemTime::now();
    }

    fn insert(&mut self, entry: Entry) -> EntryId {
        info!("Added server {} ({}) {:?}", entry.name, entry.address, entry.title);
        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(entry);
                free
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.order.push(id);
        self.touch();
        id
    }

    /// Lists a new server or refreshes a known one. New servers go through
    /// a reachability probe first when `probe` is set.
    pub fn add(
        &mut self,
        request: AddRequest,
        address: String,
        probe: bool,
        now: Instant,
    ) -> Result<AddOutcome, DirectoryError> {
        if !request.version.starts_with(VERSION_PREFIX) {
            return Err(DirectoryError::BadVersion(request.version));
        }
        if let Some(id) = self.find(&request.name) {
            if let Some(entry) = self.get_mut(id) {
                entry.title = clean_title(&request.title);
                entry.game_info = request.game_info;
                entry.set_fresh(now);
            }
            self.touch();
            return Ok(AddOutcome::Refreshed(id));
        }
        if self.probing.contains(&request.name) {
            return Err(DirectoryError::ProbeInProgress(request.name));
        }
        let entry = Entry::new(request, address, now);
        if probe {
            self.probing.insert(entry.name.clone());
            return Ok(AddOutcome::NeedsProbe(entry));
        }
        Ok(AddOutcome::Inserted(self.insert(entry)))
    }

    /// Completes a probe started by `add`. Unreachable servers are dropped.
    pub fn finish_probe(&mut self, mut entry: Entry, reached: Option<String>) -> Option<EntryId> {
        self.probing.remove(&entry.name);
        match reached {
            Some(address) => {
                entry.address = address;
                Some(self.insert(entry))
            }
            None => {
                info!("Server {} is unreachable, not listing it", entry.name);
                None
            }
        }
    }

    pub fn is_probing(&self, name: &str) -> bool {
        self.probing.contains(name)
    }

    pub fn remove(&mut self, name: &str) -> Result<(), DirectoryError> {
        let id = self
            .find(name)
            .ok_or_else(|| DirectoryError::UnknownServer(name.to_string()))?;
        if let Some(entry) = self.get_mut(id) {
            entry.set_stale();
        }
        self.touch();
        Ok(())
    }

    pub fn set_num(
        &mut self,
        name: &str,
        counts: &[u16; TEAM_COUNT],
        now: Instant,
    ) -> Result<(), DirectoryError> {
        let id = self
            .find(name)
            .ok_or_else(|| DirectoryError::UnknownServer(name.to_string()))?;
        if let Some(entry) = self.get_mut(id) {
            repack_counts(&mut entry.game_info, counts);
            entry.set_fresh(now);
        }
        self.touch();
        Ok(())
    }

    /// Marks expired entries stale and frees unreferenced ones. Returns the
    /// number freed.
    pub fn check_list(&mut self, now: Instant) -> usize {
        let expiration = self.expiration;
        let mut changed = false;
        let mut freed = Vec::new();
        for &id in &self.order {
            let Some(entry) = self.slots.get_mut(id).and_then(Option::as_mut) else {
                continue;
            };
            if entry.is_fresh() && entry.is_stale(now, expiration) {
                entry.set_stale();
                changed = true;
            }
            if !entry.is_referenced() {
                freed.push(id);
            }
        }
        for &id in &freed {
            if let Some(entry) = self.slots[id].take() {
                info!("Removed server {}", entry.name);
            }
        }
        self.order.retain(|id| !freed.contains(id));
        if changed || !freed.is_empty() {
            self.touch();
        }
        freed.len()
    }

    /// Starts a LIST cursor: every current entry gains a reference that
    /// [`Directory::advance`] or [`Directory::release`] gives back.
    pub fn begin_listing(&mut self) -> Vec<EntryId> {
        let ids = self.order.clone();
        for &id in &ids {
            if let Some(entry) = self.get_mut(id) {
                entry.add_ref();
            }
        }
        ids
    }

    /// Moves the cursor past `id`. Returns its reply line if it is fresh.
    pub fn advance(&mut self, id: EntryId) -> Option<String> {
        let entry = self.get_mut(id)?;
        entry.unref();
        entry.is_fresh().then(|| entry.list_line())
    }

    /// Drops the references of a cursor that stopped early.
    pub fn release(&mut self, ids: &[EntryId]) {
        for &id in ids {
            if let Some(entry) = self.get_mut(id) {
                entry.unref();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::GameInfo;

    const EXPIRATION: Duration = Duration::from_secs(45 * 60);

    fn add_request(name: &str) -> AddRequest {
        AddRequest {
            name: name.to_string(),
            version: "BZFS0221".to_string(),
            build: "build1".to_string(),
            game_info: GameInfo::default().to_hex(),
            title: "title".to_string(),
        }
    }

    fn test_directory() -> Directory {
        Directory::new(EXPIRATION)
    }

    fn insert(dir: &mut Directory, name: &str, now: Instant) -> EntryId {
        match dir.add(add_request(name), "10.0.0.1".into(), false, now).unwrap() {
            AddOutcome::Inserted(id) => id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_add_refreshes() {
        let mut dir = test_directory();
        let start = Instant::now();
        let id = insert(&mut dir, "host:1234", start);

        let mut again = add_request("host:1234");
        again.title = "new\ttitle".into();
        let later = start + Duration::from_secs(60);
        match dir.add(again, "10.0.0.1".into(), false, later).unwrap() {
            AddOutcome::Refreshed(same) => assert_eq!(same, id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(dir.len(), 1);
        let entry = dir.get(id).unwrap();
        assert_eq!(entry.title, "new title");
        assert_eq!(entry.ref_count(), 1);
        assert!(!entry.is_stale(later + EXPIRATION - Duration::from_secs(1), EXPIRATION));
    }

    #[test]
    fn test_rejects_foreign_version() {
        let mut dir = test_directory();
        let mut request = add_request("host:1234");
        request.version = "HTTP0221".into();
        assert!(matches!(
            dir.add(request, "10.0.0.1".into(), false, Instant::now()),
            Err(DirectoryError::BadVersion(_))
        ));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_title_is_cleaned() {
        let mut request = add_request("host");
        request.title = format!("a\nb{}", "x".repeat(200));
        let entry = Entry::new(request, "10.0.0.1".into(), Instant::now());
        assert_eq!(entry.title.chars().count(), MAX_TITLE_LEN);
        assert!(entry.title.starts_with("a b"));
        assert_eq!(entry.host(), "host");
        assert_eq!(entry.port(), Some(DEFAULT_SERVER_PORT));
    }

    #[test]
    fn test_stale_unrefs_once() {
        let mut dir = test_directory();
        let now = Instant::now();
        let id = insert(&mut dir, "host:1234", now);
        let cursor = dir.begin_listing();
        assert_eq!(dir.get(id).unwrap().ref_count(), 2);

        dir.remove("host:1234").unwrap();
        dir.remove("host:1234").unwrap();
        assert_eq!(dir.get(id).unwrap().ref_count(), 1);

        // The open cursor keeps the entry alive.
        assert_eq!(dir.check_list(now), 0);
        assert_eq!(dir.advance(cursor[0]), None);
        assert_eq!(dir.check_list(now), 1);
        assert!(dir.is_empty());
        assert_eq!(dir.remove("host:1234"), Err(DirectoryError::UnknownServer("host:1234".into())));
    }

    #[test]
    fn test_expiry_and_revival() {
        let mut dir = test_directory();
        let start = Instant::now();
        let id = insert(&mut dir, "a:1", start);
        let cursor = dir.begin_listing();

        dir.check_list(start + EXPIRATION);
        let entry = dir.get(id).unwrap();
        assert!(!entry.is_fresh());
        assert_eq!(entry.ref_count(), 1);

        // A SETNUM before the entry is freed brings it back.
        dir.set_num("a:1", &[1, 2, 3, 4, 5], start + EXPIRATION).unwrap();
        let entry = dir.get(id).unwrap();
        assert!(entry.is_fresh());
        assert_eq!(entry.ref_count(), 2);
        assert_eq!(&entry.game_info[12..32], "00010002000300040005");

        dir.release(&cursor);
        assert_eq!(dir.check_list(start + EXPIRATION), 0);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn test_listing_skips_stale() {
        let mut dir = test_directory();
        let now = Instant::now();
        insert(&mut dir, "a:1", now);
        insert(&mut dir, "b:2", now);
        dir.remove("a:1").unwrap();

        let cursor = dir.begin_listing();
        let lines: Vec<String> = cursor.iter().filter_map(|&id| dir.advance(id)).collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("b:2 BZFS0221 "));
        assert!(lines[0].ends_with(" 10.0.0.1 title\r\n"));

        assert_eq!(dir.check_list(now), 1);
        assert!(dir.find("a:1").is_none());
        assert!(dir.find("b:2").is_some());
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut dir = test_directory();
        let now = Instant::now();
        let first = insert(&mut dir, "a:1", now);
        dir.remove("a:1").unwrap();
        dir.check_list(now);
        let second = insert(&mut dir, "b:2", now);
        assert_eq!(first, second);
        assert_eq!(dir.get(second).unwrap().name, "b:2");
    }

    #[test]
    fn test_probe_flow() {
        let mut dir = test_directory();
        let now = Instant::now();
        let entry = match dir.add(add_request("c:3"), "10.0.0.1".into(), true, now).unwrap() {
            AddOutcome::NeedsProbe(entry) => entry,
            other => panic!("unexpected {:?}", other),
        };
        assert!(dir.is_probing("c:3"));
        assert!(matches!(
            dir.add(add_request("c:3"), "10.0.0.1".into(), true, now),
            Err(DirectoryError::ProbeInProgress(_))
        ));

        let id = dir.finish_probe(entry, Some("192.0.2.7".into())).unwrap();
        assert!(!dir.is_probing("c:3"));
        assert_eq!(dir.get(id).unwrap().address, "192.0.2.7");

        let entry = match dir.add(add_request("d:4"), "10.0.0.1".into(), true, now).unwrap() {
            AddOutcome::NeedsProbe(entry) => entry,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(dir.finish_probe(entry, None), None);
        assert!(dir.find("d:4").is_none());
    }
}
