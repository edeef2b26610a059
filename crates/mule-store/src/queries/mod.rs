//! Database query functions for the per-queue table groups.
//!
//! Every queue owns five tables in the `mule` schema: `t_<q>` (tasks),
//! `r_<q>` (runs), `c_<q>` (checkpoints), `e_<q>` (cached events), and
//! `w_<q>` (waiters). Table names are interpolated into SQL, so queue names
//! are validated before any statement is built.
//!
//! "Now" is always the datastore's clock: the [`NOW`] fragment reads the
//! `mule.now` session setting when present (the test clock hook) and falls
//! back to `NOW()`.

pub mod checkpoints;
pub mod claims;
pub mod events;
pub mod queues;
pub mod runs;
pub mod tasks;

use anyhow::Result;

/// Schema holding every queue's table group.
pub const SCHEMA: &str = "mule";

/// SQL fragment for the datastore clock, honouring the `mule.now` override.
pub(crate) const NOW: &str =
    "COALESCE(NULLIF(current_setting('mule.now', TRUE), '')::timestamptz, NOW())";

/// Longest accepted queue name. Table names add a two-character prefix and
/// must stay within Postgres' 63-byte identifier limit.
pub const MAX_QUEUE_NAME_LEN: usize = 48;

/// Validate a queue name before it is interpolated into SQL.
///
/// Accepts lowercase ASCII letters, digits, and underscores; the first
/// character must be a letter.
pub fn validate_queue_name(queue: &str) -> Result<()> {
    if queue.is_empty() || queue.len() > MAX_QUEUE_NAME_LEN {
        anyhow::bail!(
            "queue name {:?} must be between 1 and {} characters",
            queue,
            MAX_QUEUE_NAME_LEN
        );
    }
    let mut chars = queue.chars();
    let first = chars.next().unwrap_or('_');
    if !first.is_ascii_lowercase() {
        anyhow::bail!("queue name {:?} must start with a lowercase letter", queue);
    }
    if !queue
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        anyhow::bail!(
            "queue name {:?} may only contain lowercase letters, digits, and underscores",
            queue
        );
    }
    Ok(())
}

/// Fully-qualified table names for a queue.
#[derive(Debug, Clone)]
pub(crate) struct QueueTables {
    pub tasks: String,
    pub runs: String,
    pub checkpoints: String,
    pub events: String,
    pub waiters: String,
}

/// Resolve the table group for a queue, validating the name first.
pub(crate) fn queue_tables(queue: &str) -> Result<QueueTables> {
    validate_queue_name(queue)?;
    Ok(QueueTables {
        tasks: format!("{SCHEMA}.t_{queue}"),
        runs: format!("{SCHEMA}.r_{queue}"),
        checkpoints: format!("{SCHEMA}.c_{queue}"),
        events: format!("{SCHEMA}.e_{queue}"),
        waiters: format!("{SCHEMA}.w_{queue}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_queue_name("jobs").is_ok());
        assert!(validate_queue_name("billing_2024").is_ok());
        assert!(validate_queue_name("q").is_ok());
    }

    #[test]
    fn rejects_empty_and_long_names() {
        assert!(validate_queue_name("").is_err());
        let long = "q".repeat(MAX_QUEUE_NAME_LEN + 1);
        assert!(validate_queue_name(&long).is_err());
    }

    #[test]
    fn rejects_injection_attempts() {
        assert!(validate_queue_name("jobs; DROP TABLE t_jobs").is_err());
        assert!(validate_queue_name("jobs--").is_err());
        assert!(validate_queue_name("Jobs").is_err());
        assert!(validate_queue_name("1jobs").is_err());
        assert!(validate_queue_name("_jobs").is_err());
    }

    #[test]
    fn table_names_are_prefixed() {
        let tables = queue_tables("jobs").expect("valid name");
        assert_eq!(tables.tasks, "mule.t_jobs");
        assert_eq!(tables.runs, "mule.r_jobs");
        assert_eq!(tables.checkpoints, "mule.c_jobs");
        assert_eq!(tables.events, "mule.e_jobs");
        assert_eq!(tables.waiters, "mule.w_jobs");
    }
}
