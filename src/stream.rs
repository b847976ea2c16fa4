use std::fmt::Display;

use crate::error::CommandError;

/// Identifier of one stream entry: a `(ms, seq)` pair rendered as
/// `"<ms>-<seq>"`. The derived ordering is lexicographic on the pair,
/// which is exactly the wire-level total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };
    pub const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// The id argument of an append: fully automatic (`*`), a fixed timestamp
/// with automatic sequence (`<ms>-*`), or fully explicit (`<ms>-<seq>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    Auto,
    AutoSeq(u64),
    Explicit(EntryId),
}

impl IdSpec {
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        if raw == "*" {
            return Ok(Self::Auto);
        }
        match raw.split_once('-') {
            Some((ms, "*")) => Ok(Self::AutoSeq(parse_part(ms)?)),
            Some((ms, seq)) => Ok(Self::Explicit(EntryId::new(
                parse_part(ms)?,
                parse_part(seq)?,
            ))),
            None => Ok(Self::Explicit(EntryId::new(parse_part(raw)?, 0))),
        }
    }
}

fn parse_part(part: &str) -> Result<u64, CommandError> {
    part.parse().map_err(|_| CommandError::InvalidEntryId)
}

/// Parses a range *start* bound: `-` for the beginning, `<ms>` with the
/// sequence defaulting to 0, or an explicit `<ms>-<seq>`.
pub fn parse_range_start(raw: &str) -> Result<EntryId, CommandError> {
    if raw == "-" {
        return Ok(EntryId::ZERO);
    }
    match raw.split_once('-') {
        Some((ms, seq)) => Ok(EntryId::new(parse_part(ms)?, parse_part(seq)?)),
        None => Ok(EntryId::new(parse_part(raw)?, 0)),
    }
}

/// Parses a range *end* bound: `+` for the end, `<ms>` with the sequence
/// defaulting to the maximum, or an explicit `<ms>-<seq>`.
pub fn parse_range_end(raw: &str) -> Result<EntryId, CommandError> {
    if raw == "+" {
        return Ok(EntryId::MAX);
    }
    match raw.split_once('-') {
        Some((ms, seq)) => Ok(EntryId::new(parse_part(ms)?, parse_part(seq)?)),
        None => Ok(EntryId::new(parse_part(raw)?, u64::MAX)),
    }
}

#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

/// An append-only stream. Entries are kept in insertion order, which is
/// also id order: `last_id` is strictly monotonic, every stored id is
/// `<= last_id`, and appends that would break this are rejected.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: Vec<StreamEntry>,
    last_id: EntryId,
}

impl Stream {
    pub fn last_id(&self) -> EntryId {
        self.last_id
    }

    /// Resolves the id spec against `last_id`, validates it and appends.
    /// `now_ms` is the wall clock used for fully automatic ids.
    pub fn add(
        &mut self,
        spec: IdSpec,
        fields: Vec<(String, String)>,
        now_ms: u64,
    ) -> Result<EntryId, CommandError> {
        let id = match spec {
            IdSpec::Auto => {
                if self.last_id.ms == now_ms {
                    EntryId::new(now_ms, self.last_id.seq + 1)
                } else {
                    EntryId::new(now_ms, 0)
                }
            }
            IdSpec::AutoSeq(ms) => {
                let seq = if ms == 0 {
                    1
                } else if ms == self.last_id.ms {
                    self.last_id.seq + 1
                } else {
                    0
                };
                EntryId::new(ms, seq)
            }
            IdSpec::Explicit(id) => {
                if id == EntryId::ZERO {
                    return Err(CommandError::EntryIdZero);
                }
                if id <= self.last_id {
                    return Err(CommandError::EntryIdNotGreater);
                }
                id
            }
        };

        self.entries.push(StreamEntry { id, fields });
        self.last_id = id;
        Ok(id)
    }

    /// Entries with `start <= id <= end`, in id order.
    pub fn range(&self, start: EntryId, end: EntryId) -> Vec<&StreamEntry> {
        self.entries
            .iter()
            .filter(|entry| start <= entry.id && entry.id <= end)
            .collect()
    }

    /// Entries strictly newer than `after`, in id order.
    pub fn entries_after(&self, after: EntryId) -> Vec<&StreamEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.id > after)
            .collect()
    }
}
