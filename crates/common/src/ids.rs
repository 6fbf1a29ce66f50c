//! Typed identifiers shared across scheduler components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable stage identifier, unique within the sequence that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of one worker node (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(pub String);

impl NodeAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable job identifier plus the numeric instance id used to
/// namespace the job's intermediate sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    /// `Job-<date>_<time>_<seq>` style name.
    pub name: String,
    /// Sequence number embedded in `name`.
    pub instance: u64,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identifies one named dataset.
///
/// `job_instance` is `None` for sets owned by storage (job sources and
/// explicitly named outputs) and `Some(job)` for sets the scheduler creates
/// on behalf of one job run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SetIdentifier {
    pub database: String,
    pub set_name: String,
    #[serde(default)]
    pub job_instance: Option<u64>,
}

impl SetIdentifier {
    /// Storage-owned set with no job scope.
    pub fn new(database: impl Into<String>, set_name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            set_name: set_name.into(),
            job_instance: None,
        }
    }

    /// Job-scoped set created by the scheduler.
    pub fn scoped(database: impl Into<String>, set_name: impl Into<String>, job: u64) -> Self {
        Self {
            database: database.into(),
            set_name: set_name.into(),
            job_instance: Some(job),
        }
    }

    /// Name shared by every run of the same logical set, ignoring job scope.
    pub fn logical_name(&self) -> String {
        format!("{}.{}", self.database, self.set_name)
    }

    pub fn is_job_scoped(&self) -> bool {
        self.job_instance.is_some()
    }
}

impl fmt::Display for SetIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job_instance {
            Some(job) => write!(f, "{}.{}#{}", self.database, self.set_name, job),
            None => write!(f, "{}.{}", self.database, self.set_name),
        }
    }
}

/// Monotonic id source.
///
/// Shared by reference (usually `Arc`) so that independent sessions can
/// either share one process-wide sequence or each own a private one.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_stage_id(&self) -> StageId {
        StageId(self.next_id())
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_strictly_increasing() {
        let seq = SequenceGenerator::starting_at(10);
        let a = seq.next_stage_id();
        let b = seq.next_stage_id();
        assert_eq!(a, StageId(10));
        assert!(b > a);
    }

    #[test]
    fn logical_name_ignores_job_scope() {
        let a = SetIdentifier::scoped("tpch", "agg_out", 3);
        let b = SetIdentifier::scoped("tpch", "agg_out", 4);
        assert_ne!(a, b);
        assert_eq!(a.logical_name(), b.logical_name());
        assert_eq!(a.to_string(), "tpch.agg_out#3");
        assert_eq!(SetIdentifier::new("d", "s").to_string(), "d.s");
    }

    #[test]
    fn set_identifier_defaults_job_scope_when_absent() {
        let s: SetIdentifier =
            serde_json::from_str(r#"{"database":"d","set_name":"s"}"#).expect("decode");
        assert_eq!(s, SetIdentifier::new("d", "s"));
    }
}
