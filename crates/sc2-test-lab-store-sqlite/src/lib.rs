#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use sc2_test_lab_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Match, MatchCompletion, MatchFilter,
    MatchRegistry, MatchResult, NewMatch, UNRESOLVED_MAP_NAME, UNTRACKED_TEST_GROUP,
};
use time::OffsetDateTime;

const MATCHES_MIGRATION_VERSION: i64 = 1;

const SCHEMA_MATCHES_V1: &str = r"
CREATE TABLE IF NOT EXISTS matches (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  test_group_id INTEGER NOT NULL,
  start_timestamp TEXT,
  end_timestamp TEXT,
  map_name TEXT NOT NULL DEFAULT 'TBD',
  opponent_race TEXT NOT NULL,
  opponent_difficulty TEXT NOT NULL,
  opponent_build TEXT NOT NULL,
  result TEXT NOT NULL DEFAULT 'Pending',
  duration_in_game_time REAL
);

CREATE INDEX IF NOT EXISTS idx_matches_test_group
  ON matches(test_group_id, id);
CREATE INDEX IF NOT EXISTS idx_matches_difficulty
  ON matches(opponent_difficulty, test_group_id);
";

const MATCH_COLUMNS: &str = "id, test_group_id, start_timestamp, end_timestamp, map_name,
     opponent_race, opponent_difficulty, opponent_build, result, duration_in_game_time";

pub struct SqliteMatchStore {
    conn: Connection,
}

impl SqliteMatchStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_MATCHES_V1)
            .context("failed to apply matches schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MATCHES_MIGRATION_VERSION, now],
            )
            .context("failed to register matches schema migration")?;

        Ok(())
    }

    /// Inserts a `Pending` match stamped with the current time.
    pub fn insert_pending(&self, new_match: &NewMatch) -> Result<i64> {
        let started_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO matches(
                    test_group_id, start_timestamp, map_name,
                    opponent_race, opponent_difficulty, opponent_build, result
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new_match.test_group_id,
                    started_at,
                    UNRESOLVED_MAP_NAME,
                    new_match.opponent_race,
                    new_match.opponent_difficulty,
                    new_match.opponent_build,
                    MatchResult::Pending.as_str(),
                ],
            )
            .context("failed to insert pending match")?;

        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_match(&self, id: i64) -> Result<Option<Match>> {
        let query = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE id = ?1");
        self.conn
            .query_row(&query, params![id], parse_match_row)
            .optional()
            .with_context(|| format!("failed to load match {id}"))
    }

    pub fn list_matches(&self, filter: &MatchFilter) -> Result<Vec<Match>> {
        let mut query = format!("SELECT {MATCH_COLUMNS} FROM matches WHERE 1 = 1");
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(difficulty) = &filter.difficulty {
            values.push(SqlValue::Text(difficulty.clone()));
            query.push_str(&format!(" AND opponent_difficulty = ?{}", values.len()));
        }

        if let Some(excluded) = filter.exclude_test_group {
            values.push(SqlValue::Integer(excluded));
            query.push_str(&format!(" AND test_group_id != ?{}", values.len()));
        }

        query.push_str(" ORDER BY id ASC");

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), parse_match_row)?;
        collect_rows(rows)
    }

    /// Highest tracked test group id, ignoring the untracked sentinel.
    pub fn max_test_group_id(&self) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(test_group_id) FROM matches WHERE test_group_id != ?1",
                params![UNTRACKED_TEST_GROUP],
                |row| row.get::<_, Option<i64>>(0),
            )
            .context("failed to query max test_group_id")
    }

    pub fn next_test_group_id(&self) -> Result<i64> {
        Ok(self.max_test_group_id()?.map_or(1, |max| max + 1))
    }

    pub fn complete_match(&self, id: i64, completion: &MatchCompletion) -> Result<Match> {
        completion
            .validate()
            .map_err(|err| anyhow!("match completion validation failed: {err}"))?;

        let ended_at =
            format_rfc3339(completion.end_timestamp).map_err(|err| anyhow!(err.to_string()))?;

        let changed = self
            .conn
            .execute(
                "UPDATE matches SET
                    result = ?2,
                    map_name = COALESCE(?3, map_name),
                    end_timestamp = ?4,
                    duration_in_game_time = ?5
                 WHERE id = ?1",
                params![
                    id,
                    completion.result.as_str(),
                    completion.map_name,
                    ended_at,
                    completion.duration_in_game_time,
                ],
            )
            .with_context(|| format!("failed to complete match {id}"))?;

        if changed == 0 {
            return Err(anyhow!("match not found: {id}"));
        }

        self.get_match(id)?
            .ok_or_else(|| anyhow!("match not found: {id}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl MatchRegistry for SqliteMatchStore {
    type Error = anyhow::Error;

    fn register_pending(&mut self, new_match: &NewMatch) -> Result<i64> {
        self.insert_pending(new_match)
    }
}

fn parse_match_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Match> {
    let start_raw: Option<String> = row.get(2)?;
    let end_raw: Option<String> = row.get(3)?;
    let result_raw: String = row.get(8)?;

    Ok(Match {
        id: row.get(0)?,
        test_group_id: row.get(1)?,
        start_timestamp: parse_optional_timestamp(2, start_raw.as_deref())?,
        end_timestamp: parse_optional_timestamp(3, end_raw.as_deref())?,
        map_name: row.get(4)?,
        opponent_race: row.get(5)?,
        opponent_difficulty: row.get(6)?,
        opponent_build: row.get(7)?,
        result: MatchResult::parse(&result_raw),
        duration_in_game_time: row.get(9)?,
    })
}

fn parse_optional_timestamp(
    column: usize,
    raw: Option<&str>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    raw.map(|value| {
        parse_rfc3339_utc(value).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    err.to_string(),
                )),
            )
        })
    })
    .transpose()
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
