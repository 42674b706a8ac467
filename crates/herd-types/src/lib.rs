#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **herd-types** – Shared primitive data structures for the herd controller.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the server/group model, the procedure and checkpoint
//! vocabulary, the tabular result-set shape used across the RPC surface, and
//! the error kinds shared by the whole workspace. It intentionally makes no
//! assumptions about I/O, storage, or the async runtime.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod addr;
pub mod error;
pub mod result;

pub use error::Error;
pub use result::{ColumnType, CommandResult, ResultSet};

//─────────────────────────────
//  Server model
//─────────────────────────────

/// Default port assumed when an address carries none.
pub const DEFAULT_SERVER_PORT: u16 = 3306;

/// Administrative status of a managed server.
///
/// Transitions are restricted to a fixed matrix (see
/// [`ServerStatus::can_transition`]); in particular `Faulty → Secondary`
/// only happens through an explicit administrative command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    /// The writable member of its group; replication source for the others.
    Primary,
    /// A replicating, read-only member eligible for promotion.
    Secondary,
    /// A configured member kept out of the promotion candidate set.
    Spare,
    /// Marked unreachable by the failure detector or an operator.
    Faulty,
    /// Administratively removed from service.
    Offline,
    /// Being provisioned; not yet part of the replication topology.
    Configuring,
}

impl ServerStatus {
    /// All statuses, in display order.
    pub const ALL: [ServerStatus; 6] = [
        ServerStatus::Primary,
        ServerStatus::Secondary,
        ServerStatus::Spare,
        ServerStatus::Faulty,
        ServerStatus::Offline,
        ServerStatus::Configuring,
    ];

    /// Whether a transition from `self` to `to` is allowed.
    ///
    /// The matrix is deliberately strict: a faulty server cannot silently
    /// rejoin the topology, and a primary is only ever demoted, never
    /// provisioned.
    pub fn can_transition(self, to: ServerStatus) -> bool {
        use ServerStatus::*;
        match (self, to) {
            (a, b) if a == b => true,
            (Configuring, Secondary) | (Configuring, Spare) => true,
            (Secondary, Primary) | (Secondary, Spare) | (Secondary, Faulty) => true,
            (Secondary, Offline) => true,
            (Primary, Secondary) | (Primary, Faulty) | (Primary, Offline) => true,
            (Spare, Secondary) | (Spare, Faulty) | (Spare, Offline) => true,
            // Recovery from Faulty goes through Spare (operator re-activation).
            (Faulty, Spare) | (Faulty, Offline) => true,
            (Offline, Configuring) => true,
            _ => false,
        }
    }

    /// Parse a status from its canonical upper-case name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "PRIMARY" => Ok(ServerStatus::Primary),
            "SECONDARY" => Ok(ServerStatus::Secondary),
            "SPARE" => Ok(ServerStatus::Spare),
            "FAULTY" => Ok(ServerStatus::Faulty),
            "OFFLINE" => Ok(ServerStatus::Offline),
            "CONFIGURING" => Ok(ServerStatus::Configuring),
            other => Err(Error::Server(format!("unknown server status ({other})"))),
        }
    }

    /// Canonical upper-case name, as persisted and reported.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Primary => "PRIMARY",
            ServerStatus::Secondary => "SECONDARY",
            ServerStatus::Spare => "SPARE",
            ServerStatus::Faulty => "FAULTY",
            ServerStatus::Offline => "OFFLINE",
            ServerStatus::Configuring => "CONFIGURING",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/write mode of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMode {
    /// Not accepting connections.
    Offline,
    /// Accepting reads only.
    ReadOnly,
    /// Accepting reads and writes.
    ReadWrite,
}

impl ServerMode {
    /// Parse a mode from its canonical upper-case name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "OFFLINE" => Ok(ServerMode::Offline),
            "READ_ONLY" => Ok(ServerMode::ReadOnly),
            "READ_WRITE" => Ok(ServerMode::ReadWrite),
            other => Err(Error::Server(format!("unknown server mode ({other})"))),
        }
    }

    /// Canonical upper-case name, as persisted and reported.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerMode::Offline => "OFFLINE",
            ServerMode::ReadOnly => "READ_ONLY",
            ServerMode::ReadWrite => "READ_WRITE",
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed database server.
///
/// A server is uniquely identified through a UUID and carries a `host:port`
/// address used to reach it. No provisioning happens when the value is
/// constructed; the server process is assumed to exist already.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Unique identity of the server.
    pub uuid: Uuid,
    /// Group the server belongs to, if any.
    pub group_id: Option<String>,
    /// `host:port` used to reach the server.
    pub address: String,
    /// Account used when connecting to the server.
    pub user: Option<String>,
    /// Password for `user`.
    pub passwd: Option<String>,
    /// Read/write mode.
    pub mode: ServerMode,
    /// Administrative status.
    pub status: ServerStatus,
    /// Relative weight used when electing a new primary.
    pub weight: f64,
}

impl Server {
    /// Create a server record in its initial state.
    ///
    /// New servers start out `Configuring`/`Offline` with unit weight; a
    /// `NEW_SERVER_ADD` handler moves them into the topology.
    pub fn new(uuid: Uuid, address: impl Into<String>) -> Self {
        Self {
            uuid,
            group_id: None,
            address: address.into(),
            user: None,
            passwd: None,
            mode: ServerMode::Offline,
            status: ServerStatus::Configuring,
            weight: 1.0,
        }
    }

    /// Validate the invariants a server row must satisfy.
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.trim().is_empty() {
            return Err(Error::Server("server address cannot be empty".into()));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(Error::Server(format!(
                "server weight must be a non-negative number, got {}",
                self.weight
            )));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Group model
//─────────────────────────────

/// Activation status of a replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    /// Monitored by the failure detector; eligible for automatic failover.
    Active,
    /// Administratively present but unmonitored.
    Inactive,
}

impl GroupStatus {
    /// Parse a status from its canonical upper-case name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "ACTIVE" => Ok(GroupStatus::Active),
            "INACTIVE" => Ok(GroupStatus::Inactive),
            other => Err(Error::Group(format!("unknown group status ({other})"))),
        }
    }

    /// Canonical upper-case name, as persisted and reported.
    pub fn as_str(self) -> &'static str {
        match self {
            GroupStatus::Active => "ACTIVE",
            GroupStatus::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named set of servers, at most one of which is the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Opaque identity of the group.
    pub group_id: String,
    /// Free-form description.
    pub description: Option<String>,
    /// UUID of the current primary, when one has been elected.
    pub master_uuid: Option<Uuid>,
    /// Activation status.
    pub status: GroupStatus,
}

impl Group {
    /// Create a new, inactive group with no primary.
    pub fn new(group_id: impl Into<String>, description: Option<String>) -> Self {
        Self {
            group_id: group_id.into(),
            description,
            master_uuid: None,
            status: GroupStatus::Inactive,
        }
    }

    /// Validate the invariants a group row must satisfy.
    pub fn validate(&self) -> Result<(), Error> {
        if self.group_id.trim().is_empty() {
            return Err(Error::Group("group id cannot be empty".into()));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Procedure vocabulary
//─────────────────────────────

/// Execution state of a job inside a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting in its procedure's queue.
    Enqueued,
    /// Currently running on a worker.
    Processing,
    /// Finished, successfully or not.
    Complete,
}

impl JobState {
    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Enqueued => "ENQUEUED",
            JobState::Processing => "PROCESSING",
            JobState::Complete => "COMPLETE",
        }
    }
}

/// One entry in a job's ordered status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Execution state at the time of the record.
    pub state: JobState,
    /// Whether the transition was a success.
    pub success: bool,
    /// When the record was written.
    pub when: DateTime<Utc>,
    /// Human-readable description of the transition.
    pub description: String,
}

impl StatusRecord {
    /// Convenience constructor stamping the current time.
    pub fn now(state: JobState, success: bool, description: impl Into<String>) -> Self {
        Self {
            state,
            success,
            when: Utc::now(),
            description: description.into(),
        }
    }
}

/// Durable phase of a checkpoint row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointPhase {
    /// Written when the job was attached to its procedure.
    Scheduled,
    /// Written in the transaction that reserved the job for execution.
    Started,
    /// Written when the job finished, successfully or not.
    Finished,
}

impl CheckpointPhase {
    /// Parse a phase from its canonical upper-case name.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "SCHEDULED" => Ok(CheckpointPhase::Scheduled),
            "STARTED" => Ok(CheckpointPhase::Started),
            "FINISHED" => Ok(CheckpointPhase::Finished),
            other => Err(Error::Procedure(format!("unknown checkpoint phase ({other})"))),
        }
    }

    /// Canonical upper-case name, as persisted.
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointPhase::Scheduled => "SCHEDULED",
            CheckpointPhase::Started => "STARTED",
            CheckpointPhase::Finished => "FINISHED",
        }
    }
}

/// The set of string keys a procedure serializes on.
///
/// Keys are kept sorted so lock acquisition order is deterministic.
pub type LockSet = BTreeSet<String>;

/// Build a [`LockSet`] from anything iterable over string-likes.
pub fn lock_set<I, S>(keys: I) -> LockSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transition_matrix() {
        use ServerStatus::*;
        assert!(Secondary.can_transition(Primary));
        assert!(Primary.can_transition(Faulty));
        assert!(Configuring.can_transition(Secondary));
        assert!(Faulty.can_transition(Spare));
        // A faulty server never rejoins silently.
        assert!(!Faulty.can_transition(Secondary));
        assert!(!Faulty.can_transition(Primary));
        // A primary is never provisioned from scratch.
        assert!(!Configuring.can_transition(Primary));
        assert!(!Offline.can_transition(Primary));
    }

    #[test]
    fn status_round_trip() {
        for status in ServerStatus::ALL {
            assert_eq!(ServerStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ServerStatus::parse("BROKEN").is_err());
    }

    #[test]
    fn server_validation() {
        let mut server = Server::new(Uuid::new_v4(), "db1.example.com:3306");
        assert!(server.validate().is_ok());
        server.weight = -1.0;
        assert!(server.validate().is_err());
        server.weight = f64::NAN;
        assert!(server.validate().is_err());
    }

    #[test]
    fn group_validation() {
        assert!(Group::new("g1", None).validate().is_ok());
        assert!(Group::new("  ", None).validate().is_err());
    }

    #[test]
    fn lock_set_is_sorted_and_deduplicated() {
        let set = lock_set(["b", "a", "b"]);
        let keys: Vec<_> = set.iter().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }
}
