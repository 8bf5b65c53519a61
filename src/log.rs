use bytes::Bytes;

use crate::message::{Entry, EntryId};

// The in-memory log of a replica: a contiguous run of entries with 1-based
// indexing. Index 0 is a sentinel "before first" position with term 0; it
// exists only as a comparison anchor and never holds an entry.
pub struct LogStore {
    entries: Vec<Entry>,
}

impl LogStore {
    // Returns a new instance with no entries, i.e., the next expected entry
    // has index 1.
    pub fn new() -> Self {
        LogStore {
            entries: Vec::new(),
        }
    }

    // Returns an instance holding the supplied entries, which must be dense
    // and start at index 1. Used to restore the log from its durable form.
    pub fn restore(entries: Vec<Entry>) -> Self {
        for (position, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, position as u64 + 1, "log entries not dense");
        }
        LogStore { entries }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    // Returns the index of the latest entry, or 0 if the log is empty.
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    // Returns the term of the latest entry, or the sentinel 0 if the log is
    // empty.
    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn last_entry_id(&self) -> EntryId {
        EntryId {
            term: self.last_term(),
            index: self.last_index(),
        }
    }

    // Returns the term of the entry at the supplied index. Index 0 yields
    // the sentinel term 0; indexes beyond the end of the log yield None.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize - 1).map(|e| e.term)
    }

    // Returns the entry at the supplied index. Must only be called for an
    // index currently present in the log.
    pub fn entry_at(&self, index: u64) -> &Entry {
        &self.entries[index as usize - 1]
    }

    // Adds an entry to the end of the log. The entry's index must be the
    // next expected index.
    pub fn append(&mut self, entry: Entry) {
        assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    // Appends a fresh entry holding the supplied command, assigning it the
    // next index. Returns the id of the new entry.
    pub fn append_command(&mut self, term: u64, command: Bytes) -> EntryId {
        let entry = Entry {
            term,
            index: self.last_index() + 1,
            command,
        };
        let id = entry.id();
        self.entries.push(entry);
        id
    }

    // Removes the entry at the supplied index and all entries after it.
    pub fn truncate_from(&mut self, index: u64) {
        assert!(index >= 1);
        self.entries.truncate(index as usize - 1);
    }

    // Returns a copy of all entries from the supplied index (inclusive) to
    // the end of the log. May be empty.
    pub fn entries_from(&self, index: u64) -> Vec<Entry> {
        assert!(index >= 1);
        if index > self.last_index() {
            return Vec::new();
        }
        self.entries[index as usize - 1..].to_vec()
    }

    // Returns true if a log ending in the supplied entry id is at least as
    // up-to-date as this log: a strictly newer last term wins, and equal
    // last terms are broken by length.
    pub fn up_to_date(&self, other_last: EntryId) -> bool {
        let this_last = self.last_entry_id();
        if other_last.term != this_last.term {
            return other_last.term > this_last.term;
        }
        other_last.index >= this_last.index
    }

    // Walks backward from the supplied index (which must hold an entry of
    // the supplied term) and returns the first index of that contiguous run
    // of same-term entries. Used to build the follower's conflict hint.
    pub fn first_index_of_term(&self, from: u64, term: u64) -> u64 {
        debug_assert_eq!(self.term_at(from), Some(term));
        let mut first = from;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    // Scans backward from the supplied index for the latest entry with the
    // supplied term. Used by the leader to rewind a follower's next index
    // from a conflict hint.
    pub fn last_index_of_term(&self, from: u64, term: u64) -> Option<u64> {
        let mut index = from.min(self.last_index());
        while index >= 1 {
            if self.term_at(index) == Some(term) {
                return Some(index);
            }
            index -= 1;
        }
        None
    }
}
