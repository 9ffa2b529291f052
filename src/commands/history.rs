//! `zr history`: query the append-only execution history log.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::cli::{Cli, HistoryOpts, HistoryStatusArg};
use crate::error::ZrError;
use crate::history::{HistoryQuery, HistoryRecord, HistoryStatus, HistoryStore};

use super::support;

fn to_history_status(arg: HistoryStatusArg) -> HistoryStatus {
    match arg {
        HistoryStatusArg::Ok => HistoryStatus::Ok,
        HistoryStatusArg::CacheHit => HistoryStatus::CacheHit,
        HistoryStatusArg::Failed => HistoryStatus::Failed,
        HistoryStatusArg::TimedOut => HistoryStatus::TimedOut,
        HistoryStatusArg::Cancelled => HistoryStatus::Cancelled,
    }
}

fn status_label(status: HistoryStatus) -> &'static str {
    match status {
        HistoryStatus::Ok => "ok",
        HistoryStatus::CacheHit => "cache-hit",
        HistoryStatus::Failed => "failed",
        HistoryStatus::TimedOut => "timed-out",
        HistoryStatus::Cancelled => "cancelled",
    }
}

#[derive(Debug, Serialize)]
struct HistoryReport {
    records: Vec<HistoryRecord>,
}

/// Entry point for `zr history`: queries the history log and prints matches.
#[allow(clippy::print_stdout, clippy::cast_precision_loss)]
pub fn run(cli: &Cli, opts: &HistoryOpts) -> Result<i32, ZrError> {
    let state_root = support::state_root(cli.root.as_deref())?;
    let store = HistoryStore::new(state_root.join("history.ndjson"));

    let since = opts
        .since
        .and_then(|hours| i64::try_from(hours).ok())
        .map(|hours| Utc::now() - ChronoDuration::hours(hours));

    let query = HistoryQuery {
        since,
        status: opts.status.map(to_history_status),
        task: opts.task.clone(),
        limit: opts.limit,
    };
    let records = store.query(&query)?;

    if opts.json {
        let report = HistoryReport { records };
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| ZrError::Internal(format!("serializing history: {e}")))?;
        println!("{json}");
        return Ok(0);
    }

    if records.is_empty() {
        println!("no history records match");
        return Ok(0);
    }
    for record in &records {
        let duration = format!("{:.3}ms", record.duration_ns as f64 / 1_000_000.0);
        let exit = record.exit_code.map_or_else(String::new, |c| format!(" exit={c}"));
        println!(
            "{}  {:<10}  {:<12}  {}{exit}",
            record.ts.to_rfc3339(),
            status_label(record.status),
            record.task,
            duration,
        );
    }
    Ok(0)
}
