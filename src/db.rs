use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::run::{RunReport, StageSummary};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            id            TEXT PRIMARY KEY,
            started_at    TEXT NOT NULL,
            finished_at   TEXT NOT NULL,
            target_url    TEXT NOT NULL,
            status        TEXT NOT NULL CHECK(status IN ('completed','cancelled','failed')),
            error         TEXT,
            links         INTEGER NOT NULL DEFAULT 0,
            raw_items     INTEGER NOT NULL DEFAULT 0,
            prompts       INTEGER NOT NULL DEFAULT 0,
            metadata_rows INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS stage_summaries (
            id         INTEGER PRIMARY KEY,
            run_id     TEXT NOT NULL REFERENCES runs(id),
            stage      TEXT NOT NULL,
            total      INTEGER NOT NULL,
            succeeded  INTEGER NOT NULL,
            skipped    INTEGER NOT NULL,
            retries    INTEGER NOT NULL,
            UNIQUE(run_id, stage)
        );
        CREATE INDEX IF NOT EXISTS idx_stage_run ON stage_summaries(run_id);
        ",
    )?;
    Ok(())
}

pub fn record_run(conn: &Connection, report: &RunReport) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM stage_summaries WHERE run_id = ?1", [&report.run_id])?;
    tx.execute("DELETE FROM runs WHERE id = ?1", [&report.run_id])?;
    tx.execute(
        "INSERT INTO runs
         (id, started_at, finished_at, target_url, status, error, links, raw_items, prompts, metadata_rows)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            report.run_id,
            report.started_at.to_rfc3339(),
            report.finished_at.to_rfc3339(),
            report.target_url,
            report.status.as_str(),
            report.error,
            report.links as i64,
            report.raw_items as i64,
            report.prompts as i64,
            report.metadata_rows as i64,
        ],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO stage_summaries (run_id, stage, total, succeeded, skipped, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for s in &report.stages {
            stmt.execute(rusqlite::params![
                report.run_id,
                s.stage,
                s.total as i64,
                s.succeeded as i64,
                s.skipped as i64,
                s.retries as i64,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub struct RunRow {
    pub id: String,
    pub started_at: String,
    pub status: String,
    pub links: i64,
    pub prompts: i64,
    pub metadata_rows: i64,
    pub stages: Vec<StageSummary>,
}

pub fn fetch_recent_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, started_at, status, links, prompts, metadata_rows
         FROM runs ORDER BY started_at DESC LIMIT ?1",
    )?;
    let mut runs = stmt
        .query_map([limit as i64], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                started_at: row.get(1)?,
                status: row.get(2)?,
                links: row.get(3)?,
                prompts: row.get(4)?,
                metadata_rows: row.get(5)?,
                stages: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stage_stmt = conn.prepare(
        "SELECT stage, total, succeeded, skipped, retries
         FROM stage_summaries WHERE run_id = ?1 ORDER BY id",
    )?;
    for run in &mut runs {
        run.stages = stage_stmt
            .query_map([&run.id], |row| {
                Ok(StageSummary {
                    stage: row.get(0)?,
                    total: row.get::<_, i64>(1)? as usize,
                    succeeded: row.get::<_, i64>(2)? as usize,
                    skipped: row.get::<_, i64>(3)? as usize,
                    retries: row.get::<_, i64>(4)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::run::RunStatus;

    fn report(id: &str, offset_secs: i64) -> RunReport {
        let started_at = Utc::now() + Duration::seconds(offset_secs);
        RunReport {
            run_id: id.to_string(),
            started_at,
            finished_at: started_at,
            target_url: "https://example.com".into(),
            status: RunStatus::Completed,
            error: None,
            links: 4,
            raw_items: 9,
            prompts: 7,
            metadata_rows: 5,
            stages: vec![StageSummary {
                stage: "metadata".into(),
                total: 7,
                succeeded: 5,
                skipped: 2,
                retries: 3,
            }],
            skipped_files: Vec::new(),
            outputs: Vec::new(),
        }
    }

    #[test]
    fn records_and_lists_runs_newest_first() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        record_run(&conn, &report("run-1", 0)).unwrap();
        record_run(&conn, &report("run-2", 60)).unwrap();

        let runs = fetch_recent_runs(&conn, 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "run-2");
        assert_eq!(runs[0].status, "completed");
        assert_eq!(runs[0].stages[0].skipped, 2);
        assert_eq!(runs[1].metadata_rows, 5);
    }

    #[test]
    fn back_to_back_runs_are_both_kept() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let settings = crate::config::Settings::default();
        record_run(&conn, &RunReport::start(&settings)).unwrap();
        record_run(&conn, &RunReport::start(&settings)).unwrap();
        assert_eq!(fetch_recent_runs(&conn, 10).unwrap().len(), 2);
    }

    #[test]
    fn re_recording_replaces_run() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        record_run(&conn, &report("run-1", 0)).unwrap();
        record_run(&conn, &report("run-1", 0)).unwrap();
        assert_eq!(fetch_recent_runs(&conn, 10).unwrap().len(), 1);
    }
}
