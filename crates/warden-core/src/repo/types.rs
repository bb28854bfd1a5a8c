//! Supporting types for the driver seam.

use serde::{Deserialize, Serialize};

use crate::config::{Plan, RetentionPolicy};

/// A snapshot as reported by the backup binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub plan_id: String,
    pub time_ms: i64,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub hostname: String,
}

/// A directory entry inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub mtime_ms: i64,
}

/// What a forget run acts on: a plan's tagged snapshots filtered by its
/// retention policy, or one specific snapshot.
#[derive(Debug, Clone, Copy)]
pub enum ForgetTarget<'a> {
    Plan {
        plan: &'a Plan,
        policy: &'a RetentionPolicy,
    },
    Snapshot(&'a str),
}

/// Kept output bytes when a subprocess fails: 500 total, split first/last
/// 250 when longer.
const TAIL_BUDGET: usize = 500;
const TAIL_HALF: usize = TAIL_BUDGET / 2;

/// Errors surfaced by driver implementations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The subprocess exited non-zero. `tail` carries the last 500 bytes of
    /// its output (first/last 250 when longer), built via [`output_tail`].
    #[error("subprocess failed with exit code {exit_code}: {tail}")]
    SubprocessFailed { exit_code: i32, tail: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Reduce subprocess output to the 500-byte window kept in error messages:
/// everything when short, otherwise the first 250 and last 250 bytes joined
/// by an ellipsis marker. Splits are nudged onto UTF-8 boundaries.
pub fn output_tail(output: &[u8]) -> String {
    if output.len() <= TAIL_BUDGET {
        return String::from_utf8_lossy(output).into_owned();
    }
    let head = String::from_utf8_lossy(&output[..TAIL_HALF]);
    let tail = String::from_utf8_lossy(&output[output.len() - TAIL_HALF..]);
    format!("{head} [...] {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_kept_whole() {
        let out = b"fatal: wrong password";
        assert_eq!(output_tail(out), "fatal: wrong password");
    }

    #[test]
    fn output_at_budget_kept_whole() {
        let out = vec![b'x'; 500];
        assert_eq!(output_tail(&out).len(), 500);
    }

    #[test]
    fn long_output_split_first_and_last_250() {
        let mut out = Vec::new();
        out.extend(std::iter::repeat_n(b'a', 300));
        out.extend(std::iter::repeat_n(b'z', 300));

        let tail = output_tail(&out);
        assert!(tail.starts_with(&"a".repeat(250)));
        assert!(tail.ends_with(&"z".repeat(250)));
        assert!(tail.contains("[...]"));
    }

    #[test]
    fn subprocess_failed_display_includes_tail() {
        let err = DriverError::SubprocessFailed {
            exit_code: 3,
            tail: "unable to open config file".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("unable to open config file"));
    }
}
