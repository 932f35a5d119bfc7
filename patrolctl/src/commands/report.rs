use rusqlite::{Connection, OpenFlags};
use serde::Serialize;

use patrol_core::load_patrol_config;

use crate::{Cli, OutputFormat, ReportArgs, ReportCommands, Result};

#[derive(Debug, Serialize)]
struct FailureRow {
    ts: String,
    target: String,
    attempt: i64,
    error: String,
}

#[derive(Debug, Serialize)]
struct ResultRow {
    ts: String,
    target: String,
    success: bool,
    attempts: i64,
    elapsed_ms: i64,
}

pub fn execute(cli: &Cli, command: &ReportCommands) -> Result<()> {
    let config = load_patrol_config(&cli.config)?;
    let conn = Connection::open_with_flags(
        &config.observability.metrics_db,
        OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    match command {
        ReportCommands::Failures(args) => failures(cli, &conn, args),
        ReportCommands::Results(args) => results(cli, &conn, args),
    }
}

fn failures(cli: &Cli, conn: &Connection, args: &ReportArgs) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT ts, target, attempt, error FROM attempts
         WHERE success = 0 ORDER BY ts DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([args.limit as i64], |row| {
            Ok(FailureRow {
                ts: row.get(0)?,
                target: row.get(1)?,
                attempt: row.get(2)?,
                error: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            for row in rows {
                println!(
                    "{} {:<24} attempt {} | {}",
                    row.ts, row.target, row.attempt, row.error
                );
            }
        }
    }
    Ok(())
}

fn results(cli: &Cli, conn: &Connection, args: &ReportArgs) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT ts, target, success, attempts, elapsed_ms FROM target_results
         ORDER BY ts DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([args.limit as i64], |row| {
            Ok(ResultRow {
                ts: row.get(0)?,
                target: row.get(1)?,
                success: row.get::<_, i64>(2)? != 0,
                attempts: row.get(3)?,
                elapsed_ms: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => {
            for row in rows {
                let status = if row.success { "ok" } else { "failed" };
                println!(
                    "{} {:<24} {status:<8} attempts={} elapsed={}ms",
                    row.ts, row.target, row.attempts, row.elapsed_ms
                );
            }
        }
    }
    Ok(())
}
