//! Shared-log actions and their wire codec.
//!
//! Log entries are text-framed with a versioned header. Required fields come
//! first in declared order, optional fields follow, and unknown trailing
//! lines are ignored so older replicas can read entries written by newer
//! ones.

use crate::error::{EngineError, Result};
use crate::unix_time_secs;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// Fetch the part from some replica that has it.
    Get,
    /// Merge source parts into a new one.
    Merge,
    /// Apply a mutation to one part.
    Mutate,
    /// Drop every part covered by the range.
    DropRange,
    /// Rewrite parts in the range without the named column.
    ClearColumn,
    /// Drop the range and fetch the replacement parts.
    ReplaceRange,
}

impl EntryType {
    fn keyword(self) -> &'static str {
        match self {
            EntryType::Get => "get",
            EntryType::Merge => "merge",
            EntryType::Mutate => "mutate",
            EntryType::DropRange => "drop",
            EntryType::ClearColumn => "clear_column",
            EntryType::ReplaceRange => "replace_range",
        }
    }
}

/// One record of the shared action log. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub entry_type: EntryType,
    /// Unix seconds on the server that created the entry.
    pub create_time: u64,
    pub source_replica: String,
    /// Expected ack count for quorum writes; 0 disables tracking.
    pub quorum: usize,
    /// Dedup key of the INSERT that produced a GET entry.
    pub block_id: Option<String>,
    /// Target part, or the covering range name for DROP/CLEAR/REPLACE.
    pub new_part_name: String,
    /// Merge/mutate sources; replacement parts for REPLACE_RANGE.
    pub source_parts: Vec<String>,
    /// Mutation version for MUTATE entries.
    pub mutation_version: Option<i64>,
    /// Column for CLEAR_COLUMN entries.
    pub column_name: Option<String>,
    /// DROP_RANGE detaches instead of deleting.
    pub detach: bool,
}

impl LogEntry {
    fn base(entry_type: EntryType, source_replica: &str, new_part_name: String) -> Self {
        Self {
            entry_type,
            create_time: unix_time_secs(),
            source_replica: source_replica.to_string(),
            quorum: 0,
            block_id: None,
            new_part_name,
            source_parts: Vec::new(),
            mutation_version: None,
            column_name: None,
            detach: false,
        }
    }

    pub fn get(
        source_replica: &str,
        part_name: String,
        block_id: Option<String>,
        quorum: usize,
    ) -> Self {
        Self {
            block_id,
            quorum,
            ..Self::base(EntryType::Get, source_replica, part_name)
        }
    }

    pub fn merge(source_replica: &str, source_parts: Vec<String>, new_part_name: String) -> Self {
        Self {
            source_parts,
            ..Self::base(EntryType::Merge, source_replica, new_part_name)
        }
    }

    pub fn mutate(
        source_replica: &str,
        source_part: String,
        new_part_name: String,
        version: i64,
    ) -> Self {
        Self {
            source_parts: vec![source_part],
            mutation_version: Some(version),
            ..Self::base(EntryType::Mutate, source_replica, new_part_name)
        }
    }

    pub fn drop_range(source_replica: &str, range_name: String, detach: bool) -> Self {
        Self {
            detach,
            ..Self::base(EntryType::DropRange, source_replica, range_name)
        }
    }

    pub fn clear_column(source_replica: &str, column: String, range_name: String) -> Self {
        Self {
            column_name: Some(column),
            ..Self::base(EntryType::ClearColumn, source_replica, range_name)
        }
    }

    pub fn replace_range(
        source_replica: &str,
        range_name: String,
        new_parts: Vec<String>,
    ) -> Self {
        Self {
            source_parts: new_parts,
            ..Self::base(EntryType::ReplaceRange, source_replica, range_name)
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("format version: {FORMAT_VERSION}\n"));
        out.push_str(&format!("create_time: {}\n", self.create_time));
        out.push_str(&format!("source replica: {}\n", self.source_replica));
        if self.quorum > 0 {
            out.push_str(&format!("quorum: {}\n", self.quorum));
        }
        if let Some(block_id) = &self.block_id {
            out.push_str(&format!("block_id: {block_id}\n"));
        }
        out.push_str(self.entry_type.keyword());
        out.push('\n');
        match self.entry_type {
            EntryType::Get => {
                out.push_str(&self.new_part_name);
                out.push('\n');
            }
            EntryType::Merge => {
                for part in &self.source_parts {
                    out.push_str(part);
                    out.push('\n');
                }
                out.push_str("into\n");
                out.push_str(&self.new_part_name);
                out.push('\n');
            }
            EntryType::Mutate => {
                out.push_str(self.source_parts.first().map(String::as_str).unwrap_or(""));
                out.push('\n');
                out.push_str("to\n");
                out.push_str(&self.new_part_name);
                out.push('\n');
                out.push_str(&format!(
                    "version: {}\n",
                    self.mutation_version.unwrap_or(0)
                ));
            }
            EntryType::DropRange => {
                out.push_str(&self.new_part_name);
                out.push('\n');
                out.push_str(&format!("detach: {}\n", u8::from(self.detach)));
            }
            EntryType::ClearColumn => {
                out.push_str(self.column_name.as_deref().unwrap_or(""));
                out.push('\n');
                out.push_str("in\n");
                out.push_str(&self.new_part_name);
                out.push('\n');
            }
            EntryType::ReplaceRange => {
                out.push_str(&self.new_part_name);
                out.push('\n');
                out.push_str("with\n");
                out.push_str(&self.source_parts.join(" "));
                out.push('\n');
            }
        }
        out.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data).map_err(|_| bad_entry("not utf-8"))?;
        let mut lines = text.lines();

        let header = lines.next().ok_or_else(|| bad_entry("empty"))?;
        let version: u32 = header
            .strip_prefix("format version: ")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| bad_entry("missing format header"))?;
        if version == 0 {
            return Err(bad_entry("format version 0"));
        }

        let mut create_time = 0;
        let mut source_replica = String::new();
        let mut quorum = 0;
        let mut block_id = None;
        let action = loop {
            let line = lines.next().ok_or_else(|| bad_entry("truncated header"))?;
            if let Some(value) = line.strip_prefix("create_time: ") {
                create_time = value.trim().parse().map_err(|_| bad_entry("create_time"))?;
            } else if let Some(value) = line.strip_prefix("source replica: ") {
                source_replica = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("quorum: ") {
                quorum = value.trim().parse().map_err(|_| bad_entry("quorum"))?;
            } else if let Some(value) = line.strip_prefix("block_id: ") {
                block_id = Some(value.trim().to_string());
            } else if line.contains(": ") {
                // Optional field from a newer writer; skip.
                continue;
            } else {
                break line;
            }
        };

        let mut entry = match action {
            "get" => {
                let part = lines.next().ok_or_else(|| bad_entry("get: missing part"))?;
                LogEntry::base(EntryType::Get, "", part.to_string())
            }
            "merge" => {
                let mut source_parts = Vec::new();
                loop {
                    let line = lines.next().ok_or_else(|| bad_entry("merge: truncated"))?;
                    if line == "into" {
                        break;
                    }
                    source_parts.push(line.to_string());
                }
                let new_part = lines.next().ok_or_else(|| bad_entry("merge: missing target"))?;
                LogEntry {
                    source_parts,
                    ..LogEntry::base(EntryType::Merge, "", new_part.to_string())
                }
            }
            "mutate" => {
                let source = lines.next().ok_or_else(|| bad_entry("mutate: missing source"))?;
                let into = lines.next().ok_or_else(|| bad_entry("mutate: truncated"))?;
                if into != "to" {
                    return Err(bad_entry("mutate: expected 'to'"));
                }
                let new_part = lines.next().ok_or_else(|| bad_entry("mutate: missing target"))?;
                let version = lines
                    .next()
                    .and_then(|l| l.strip_prefix("version: "))
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| bad_entry("mutate: missing version"))?;
                LogEntry {
                    source_parts: vec![source.to_string()],
                    mutation_version: Some(version),
                    ..LogEntry::base(EntryType::Mutate, "", new_part.to_string())
                }
            }
            "drop" => {
                let range = lines.next().ok_or_else(|| bad_entry("drop: missing range"))?;
                let detach = lines
                    .next()
                    .and_then(|l| l.strip_prefix("detach: "))
                    .map(|v| v.trim() == "1")
                    .unwrap_or(false);
                LogEntry {
                    detach,
                    ..LogEntry::base(EntryType::DropRange, "", range.to_string())
                }
            }
            "clear_column" => {
                let column = lines
                    .next()
                    .ok_or_else(|| bad_entry("clear_column: missing column"))?;
                let infix = lines.next().ok_or_else(|| bad_entry("clear_column: truncated"))?;
                if infix != "in" {
                    return Err(bad_entry("clear_column: expected 'in'"));
                }
                let range = lines
                    .next()
                    .ok_or_else(|| bad_entry("clear_column: missing range"))?;
                LogEntry {
                    column_name: Some(column.to_string()),
                    ..LogEntry::base(EntryType::ClearColumn, "", range.to_string())
                }
            }
            "replace_range" => {
                let range = lines
                    .next()
                    .ok_or_else(|| bad_entry("replace_range: missing range"))?;
                let infix = lines.next().ok_or_else(|| bad_entry("replace_range: truncated"))?;
                if infix != "with" {
                    return Err(bad_entry("replace_range: expected 'with'"));
                }
                let parts_line = lines
                    .next()
                    .ok_or_else(|| bad_entry("replace_range: missing parts"))?;
                LogEntry {
                    source_parts: parts_line
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    ..LogEntry::base(EntryType::ReplaceRange, "", range.to_string())
                }
            }
            other => return Err(bad_entry(&format!("unknown action {other:?}"))),
        };
        // Trailing lines from newer formats are ignored.

        entry.create_time = create_time;
        entry.source_replica = source_replica;
        entry.quorum = quorum;
        entry.block_id = block_id;
        Ok(entry)
    }
}

fn bad_entry(what: &str) -> EngineError {
    EngineError::LogicalInvariantViolated(format!("malformed log entry: {what}"))
}

/// Execution states of a queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEntryState {
    Pending,
    Executing,
}

/// A log entry mirrored into this replica's queue, with local execution
/// state. The authoritative key is the sequential znode name.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub znode_name: String,
    pub log: LogEntry,
    /// Rewritten when a fetch returned a covering part.
    pub actual_new_part_name: Option<String>,
    pub num_tries: u32,
    pub last_exception: Option<String>,
    /// Unix ms of the last execution attempt.
    pub last_attempt_time: u64,
    pub state: QueueEntryState,
    /// Unix ms before which the entry is not retried.
    pub backoff_until: u64,
}

impl QueueEntry {
    pub fn new(znode_name: String, log: LogEntry) -> Self {
        Self {
            znode_name,
            log,
            actual_new_part_name: None,
            num_tries: 0,
            last_exception: None,
            last_attempt_time: 0,
            state: QueueEntryState::Pending,
            backoff_until: 0,
        }
    }

    /// The part this entry will produce, after any covering rewrite.
    pub fn target_part_name(&self) -> &str {
        self.actual_new_part_name
            .as_deref()
            .unwrap_or(&self.log.new_part_name)
    }
}
