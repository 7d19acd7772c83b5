//! Request counters, logged periodically as totals and per-interval deltas.

use crate::request::Command;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    adds: AtomicU64,
    adds_bad: AtomicU64,
    removes: AtomicU64,
    removes_bad: AtomicU64,
    setnums: AtomicU64,
    setnums_bad: AtomicU64,
    lists: AtomicU64,
    gets: AtomicU64,
    gets_bad: AtomicU64,
    bad: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub adds: u64,
    pub adds_bad: u64,
    pub removes: u64,
    pub removes_bad: u64,
    pub setnums: u64,
    pub setnums_bad: u64,
    pub lists: u64,
    pub gets: u64,
    pub gets_bad: u64,
    pub bad: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request of a known command, and whether it was refused or
    /// malformed.
    pub fn record(&self, command: Command, bad: bool) {
        let (total, failed) = match command {
            Command::Add => (&self.adds, Some(&self.adds_bad)),
            Command::Remove => (&self.removes, Some(&self.removes_bad)),
            Command::SetNum => (&self.setnums, Some(&self.setnums_bad)),
            Command::List => (&self.lists, None),
            Command::Get => (&self.gets, Some(&self.gets_bad)),
        };
        bump(total, 1);
        if bad {
            bump(failed.unwrap_or(&self.bad), 1);
        }
    }

    /// Unknown commands and unterminated input.
    pub fn record_bad(&self) {
        bump(&self.bad, 1);
    }

    pub fn add_read(&self, bytes: usize) {
        bump(&self.bytes_read, bytes as u64);
    }

    pub fn add_written(&self, bytes: usize) {
        bump(&self.bytes_written, bytes as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            adds: load(&self.adds),
            adds_bad: load(&self.adds_bad),
            removes: load(&self.removes),
            removes_bad: load(&self.removes_bad),
            setnums: load(&self.setnums),
            setnums_bad: load(&self.setnums_bad),
            lists: load(&self.lists),
            gets: load(&self.gets),
            gets_bad: load(&self.gets_bad),
            bad: load(&self.bad),
            bytes_read: load(&self.bytes_read),
            bytes_written: load(&self.bytes_written),
        }
    }
}

impl StatsSnapshot {
    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            adds: self.adds - earlier.adds,
            adds_bad: self.adds_bad - earlier.adds_bad,
            removes: self.removes - earlier.removes,
            removes_bad: self.removes_bad - earlier.removes_bad,
            setnums: self.setnums - earlier.setnums,
            setnums_bad: self.setnums_bad - earlier.setnums_bad,
            lists: self.lists - earlier.lists,
            gets: self.gets - earlier.gets,
            gets_bad: self.gets_bad - earlier.gets_bad,
            bad: self.bad - earlier.bad,
            bytes_read: self.bytes_read - earlier.bytes_read,
            bytes_written: self.bytes_written - earlier.bytes_written,
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "add {}/{} bad, remove {}/{} bad, setnum {}/{} bad, list {}, get {}/{} bad, \
             other bad {}, {} bytes in, {} bytes out",
            self.adds,
            self.adds_bad,
            self.removes,
            self.removes_bad,
            self.setnums,
            self.setnums_bad,
            self.lists,
            self.gets,
            self.gets_bad,
            self.bad,
            self.bytes_read,
            self.bytes_written
        )
    }
}
