//! Child-outcome log codec
//!
//! A parent task accumulates child outcomes as a newline-delimited log:
//! `<child_id>:<json-result>` for a completed child,
//! `<child_id>!<json-error>` for a permanently failed one. Appending a
//! line is the only write a child's terminal update performs on its
//! parent's result, which keeps that update free of read-modify-write.

use serde_json::Value;

/// Error decoding a result column
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResultLogError {
    /// Line does not match `<id>:<json>` or `<id>!<json>`
    #[error("malformed child log line: {0:?}")]
    MalformedLine(String),

    /// Payload after the separator is not valid JSON
    #[error("invalid JSON in result: {0}")]
    Json(String),
}

/// Outcome of a single child task, as recorded in its parent's log
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    /// Child completed; `result` is its handler's return value
    Completed { child_id: u64, result: Value },

    /// Child permanently failed; `error` is its recorded error
    Failed { child_id: u64, error: Value },
}

impl ChildOutcome {
    pub fn child_id(&self) -> u64 {
        match self {
            Self::Completed { child_id, .. } | Self::Failed { child_id, .. } => *child_id,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Render the log line for a completed child. `result_json` must already
/// be serialized JSON.
pub fn success_line(child_id: u64, result_json: &str) -> String {
    format!("{child_id}:{result_json}\n")
}

/// Render the log line for a permanently failed child.
pub fn failure_line(child_id: u64, error: &str) -> String {
    format!("{child_id}!{}\n", Value::String(error.to_string()))
}

/// Decode an accumulated child log into outcomes ordered by child id.
pub fn decode_child_log(log: &str) -> Result<Vec<ChildOutcome>, ResultLogError> {
    let mut outcomes = Vec::new();

    for line in log.lines() {
        if line.is_empty() {
            continue;
        }

        let digits_end = line
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| ResultLogError::MalformedLine(line.to_string()))?;
        if digits_end == 0 {
            return Err(ResultLogError::MalformedLine(line.to_string()));
        }

        let child_id: u64 = line[..digits_end]
            .parse()
            .map_err(|_| ResultLogError::MalformedLine(line.to_string()))?;
        let separator = line.as_bytes()[digits_end];
        if separator != b':' && separator != b'!' {
            return Err(ResultLogError::MalformedLine(line.to_string()));
        }
        let body: Value = serde_json::from_str(&line[digits_end + 1..])
            .map_err(|e| ResultLogError::Json(e.to_string()))?;

        outcomes.push(if separator == b':' {
            ChildOutcome::Completed {
                child_id,
                result: body,
            }
        } else {
            ChildOutcome::Failed {
                child_id,
                error: body,
            }
        });
    }

    outcomes.sort_by_key(ChildOutcome::child_id);
    Ok(outcomes)
}
