use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of an operation.
///
/// Rows move monotonically through the graph:
///
/// ```text
/// pending    -> inprogress
/// pending    -> user_cancelled | system_cancelled   (cancelled before start)
/// inprogress -> success | warning | error
/// inprogress -> user_cancelled | system_cancelled
/// ```
///
/// Terminal rows never change status again; same-status rewrites are allowed
/// (progress updates of an in-progress row, re-timing a superseded pending
/// row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Inprogress,
    Success,
    Warning,
    Error,
    UserCancelled,
    SystemCancelled,
}

impl OpStatus {
    /// True once a row can no longer change status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Inprogress)
    }

    /// True for the two cancellation outcomes.
    pub fn is_cancelled(self) -> bool {
        matches!(self, Self::UserCancelled | Self::SystemCancelled)
    }

    /// Check whether moving from `self` to `to` is a valid edge in the
    /// status graph. Same-status rewrites are valid for non-terminal rows.
    pub fn can_transition_to(self, to: OpStatus) -> bool {
        if self == to {
            return !self.is_terminal();
        }
        match self {
            Self::Pending => matches!(
                to,
                Self::Inprogress | Self::UserCancelled | Self::SystemCancelled
            ),
            Self::Inprogress => to.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Inprogress => "inprogress",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::UserCancelled => "user_cancelled",
            Self::SystemCancelled => "system_cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for OpStatus {
    type Err = OpStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "inprogress" => Ok(Self::Inprogress),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "user_cancelled" => Ok(Self::UserCancelled),
            "system_cancelled" => Ok(Self::SystemCancelled),
            other => Err(OpStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OpStatus`] string.
#[derive(Debug, Clone)]
pub struct OpStatusParseError(pub String);

impl fmt::Display for OpStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation status: {:?}", self.0)
    }
}

impl std::error::Error for OpStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of work an operation records. Derived from the payload tag; stored
/// in its own column so the snapshot-row index can filter on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Backup,
    Forget,
    Prune,
    Restore,
    IndexSnapshot,
    Stats,
    Check,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backup => "backup",
            Self::Forget => "forget",
            Self::Prune => "prune",
            Self::Restore => "restore",
            Self::IndexSnapshot => "index_snapshot",
            Self::Stats => "stats",
            Self::Check => "check",
        };
        f.write_str(s)
    }
}

impl FromStr for OpKind {
    type Err = OpKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Self::Backup),
            "forget" => Ok(Self::Forget),
            "prune" => Ok(Self::Prune),
            "restore" => Ok(Self::Restore),
            "index_snapshot" => Ok(Self::IndexSnapshot),
            "stats" => Ok(Self::Stats),
            "check" => Ok(Self::Check),
            other => Err(OpKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`OpKind`] string.
#[derive(Debug, Clone)]
pub struct OpKindParseError(pub String);

impl fmt::Display for OpKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid operation kind: {:?}", self.0)
    }
}

impl std::error::Error for OpKindParseError {}

// ---------------------------------------------------------------------------
// Telemetry structs carried inside payloads
// ---------------------------------------------------------------------------

/// A single progress entry reported by the backup subprocess.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackupProgress {
    pub percent_done: f64,
    pub files_done: u64,
    pub total_files: u64,
    pub bytes_done: u64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
}

/// Final summary reported when a backup completes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BackupSummary {
    pub snapshot_id: String,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub duration_ms: i64,
}

/// Progress entry for a restore.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub percent_done: f64,
    pub bytes_restored: u64,
    pub total_bytes: u64,
}

/// Summary reported by the stats subcommand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total_size: u64,
    pub total_file_count: u64,
    pub snapshot_count: u64,
}

/// Summary reported by the check subcommand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckSummary {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Per-kind telemetry attached to an operation row. Tagged so dispatch is
/// always on the `kind` discriminant, never on dynamic type identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpPayload {
    Backup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_status: Option<BackupProgress>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Forget {
        /// Snapshot ids removed by this forget run.
        #[serde(default)]
        forgotten: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Prune {
        /// Head of the subprocess text output; the full stream lives in the
        /// log blob referenced by `log_ref`.
        #[serde(default)]
        output_preview: String,
        /// True when the run was skipped by the frequency policy.
        #[serde(default)]
        skipped: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Restore {
        snapshot_id: String,
        path: String,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_status: Option<RestoreProgress>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    IndexSnapshot {
        snapshot_id: String,
    },
    Stats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<StatsSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Check {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<CheckSummary>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OpPayload {
    /// The kind discriminant for this payload.
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Backup { .. } => OpKind::Backup,
            Self::Forget { .. } => OpKind::Forget,
            Self::Prune { .. } => OpKind::Prune,
            Self::Restore { .. } => OpKind::Restore,
            Self::IndexSnapshot { .. } => OpKind::IndexSnapshot,
            Self::Stats { .. } => OpKind::Stats,
            Self::Check { .. } => OpKind::Check,
        }
    }

    /// Empty backup payload.
    pub fn backup() -> Self {
        Self::Backup {
            last_status: None,
            snapshot_id: None,
            error: None,
        }
    }

    /// Empty forget payload.
    pub fn forget() -> Self {
        Self::Forget {
            forgotten: Vec::new(),
            error: None,
        }
    }

    /// Empty prune payload.
    pub fn prune() -> Self {
        Self::Prune {
            output_preview: String::new(),
            skipped: false,
            error: None,
        }
    }

    /// Set (or replace) the error message on this payload, if the variant
    /// carries one.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self {
            Self::Backup { error, .. }
            | Self::Forget { error, .. }
            | Self::Prune { error, .. }
            | Self::Restore { error, .. }
            | Self::Stats { error, .. }
            | Self::Check { error, .. } => *error = Some(message),
            Self::IndexSnapshot { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// One attempted unit of backup-engine work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Operation {
    /// Monotonically increasing journal id, assigned on insert.
    pub id: i64,
    /// Groups causally related operations (a backup plus its follow-ups).
    pub flow_id: Option<i64>,
    pub repo_id: String,
    pub plan_id: String,
    pub snapshot_id: Option<String>,
    pub status: OpStatus,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
    #[sqlx(json)]
    pub payload: OpPayload,
    /// Opaque handle to the log blob holding full subprocess output.
    pub log_ref: Option<String>,
}

impl Operation {
    /// The kind discriminant, taken from the payload tag.
    pub fn kind(&self) -> OpKind {
        self.payload.kind()
    }
}

/// Parameters for inserting a new operation row. The id is always assigned
/// by the journal, never by the caller.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub flow_id: Option<i64>,
    pub repo_id: String,
    pub plan_id: String,
    pub snapshot_id: Option<String>,
    pub status: OpStatus,
    pub started_at_ms: i64,
    /// Set only for rows inserted directly in a terminal state, e.g. the
    /// snapshot index rows produced by an index run.
    pub ended_at_ms: Option<i64>,
    pub payload: OpPayload,
}

// ---------------------------------------------------------------------------
// Query specs
// ---------------------------------------------------------------------------

/// Bounds for a range scan over one dimension of the journal.
///
/// `cursor` is exclusive: a forward scan returns ids strictly greater than
/// it, a reverse scan ids strictly smaller. Results are ordered by id
/// ascending unless `reverse` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpQuery {
    pub cursor: Option<i64>,
    pub limit: Option<u32>,
    pub reverse: bool,
}

impl OpQuery {
    /// Scan everything, forward.
    pub fn all() -> Self {
        Self::default()
    }

    /// Forward scan capped at `limit` rows.
    pub fn first(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Reverse scan capped at `limit` rows (most recent first).
    pub fn last(limit: u32) -> Self {
        Self {
            limit: Some(limit),
            reverse: true,
            ..Self::default()
        }
    }
}

/// Filter for bulk history deletion. With `only_failed` set, rows that
/// ended in `Success` or `Warning` are always kept.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub repo_id: Option<String>,
    pub plan_id: Option<String>,
    pub only_failed: bool,
    pub ids: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_status_display_roundtrip() {
        let variants = [
            OpStatus::Pending,
            OpStatus::Inprogress,
            OpStatus::Success,
            OpStatus::Warning,
            OpStatus::Error,
            OpStatus::UserCancelled,
            OpStatus::SystemCancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: OpStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn op_status_invalid() {
        let result = "bogus".parse::<OpStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn op_kind_display_roundtrip() {
        let variants = [
            OpKind::Backup,
            OpKind::Forget,
            OpKind::Prune,
            OpKind::Restore,
            OpKind::IndexSnapshot,
            OpKind::Stats,
            OpKind::Check,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: OpKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn op_kind_invalid() {
        let result = "compress".parse::<OpKind>();
        assert!(result.is_err());
    }

    #[test]
    fn pending_transitions() {
        assert!(OpStatus::Pending.can_transition_to(OpStatus::Inprogress));
        assert!(OpStatus::Pending.can_transition_to(OpStatus::UserCancelled));
        assert!(OpStatus::Pending.can_transition_to(OpStatus::SystemCancelled));
        assert!(OpStatus::Pending.can_transition_to(OpStatus::Pending));
        assert!(!OpStatus::Pending.can_transition_to(OpStatus::Success));
        assert!(!OpStatus::Pending.can_transition_to(OpStatus::Error));
    }

    #[test]
    fn inprogress_transitions() {
        assert!(OpStatus::Inprogress.can_transition_to(OpStatus::Success));
        assert!(OpStatus::Inprogress.can_transition_to(OpStatus::Warning));
        assert!(OpStatus::Inprogress.can_transition_to(OpStatus::Error));
        assert!(OpStatus::Inprogress.can_transition_to(OpStatus::UserCancelled));
        assert!(OpStatus::Inprogress.can_transition_to(OpStatus::SystemCancelled));
        assert!(OpStatus::Inprogress.can_transition_to(OpStatus::Inprogress));
        assert!(!OpStatus::Inprogress.can_transition_to(OpStatus::Pending));
    }

    #[test]
    fn terminal_rows_are_immutable() {
        let terminals = [
            OpStatus::Success,
            OpStatus::Warning,
            OpStatus::Error,
            OpStatus::UserCancelled,
            OpStatus::SystemCancelled,
        ];
        for from in &terminals {
            assert!(from.is_terminal());
            for to in &[
                OpStatus::Pending,
                OpStatus::Inprogress,
                OpStatus::Success,
                OpStatus::Error,
            ] {
                assert!(
                    !from.can_transition_to(*to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn payload_kind_mapping() {
        assert_eq!(OpPayload::backup().kind(), OpKind::Backup);
        assert_eq!(OpPayload::forget().kind(), OpKind::Forget);
        assert_eq!(OpPayload::prune().kind(), OpKind::Prune);
        assert_eq!(
            OpPayload::IndexSnapshot {
                snapshot_id: "abc".into()
            }
            .kind(),
            OpKind::IndexSnapshot
        );
    }

    #[test]
    fn payload_serde_roundtrip_with_tag() {
        let payload = OpPayload::Backup {
            last_status: Some(BackupProgress {
                percent_done: 0.5,
                files_done: 10,
                total_files: 20,
                bytes_done: 512,
                total_bytes: 1024,
                current_file: Some("/etc/hosts".into()),
            }),
            snapshot_id: Some("deadbeef".into()),
            error: None,
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""kind":"backup""#), "tag missing: {json}");

        let back: OpPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn payload_set_error() {
        let mut payload = OpPayload::forget();
        payload.set_error("repository locked");
        match payload {
            OpPayload::Forget { error, .. } => {
                assert_eq!(error.as_deref(), Some("repository locked"));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn op_query_constructors() {
        let q = OpQuery::last(5);
        assert!(q.reverse);
        assert_eq!(q.limit, Some(5));
        assert!(q.cursor.is_none());

        let q = OpQuery::first(3);
        assert!(!q.reverse);
        assert_eq!(q.limit, Some(3));

        let q = OpQuery::all();
        assert!(!q.reverse);
        assert!(q.limit.is_none());
    }
}
