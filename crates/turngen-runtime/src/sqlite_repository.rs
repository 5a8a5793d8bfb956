//! SQLite-backed generator repository.
//!
//! This module is feature-gated behind `sqlite-persistence`.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use turngen_kernel::{
    AgentRef, GenerationTime, Generator, GeneratorConfig, GeneratorId, GeneratorRepository,
    KernelError, Pause, Ready, RealmRef, RecurrenceRule, RuleId, ScheduleUpdate, StoredRule,
    TaskHandle,
};

const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS generators (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    realm_kind            TEXT NOT NULL,
    realm_id              INTEGER NOT NULL,
    generating            INTEGER NOT NULL DEFAULT 0,
    generation_time_ms    INTEGER NULL,
    task_handle           TEXT NULL,
    force_generate        INTEGER NOT NULL,
    autogenerate          INTEGER NOT NULL,
    allow_pauses          INTEGER NOT NULL,
    minimum_between_secs  INTEGER NULL,
    UNIQUE (realm_kind, realm_id)
);

CREATE TABLE IF NOT EXISTS generation_rules (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    generator_id  INTEGER NOT NULL REFERENCES generators(id) ON DELETE CASCADE,
    rule_json     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pauses (
    generator_id  INTEGER NOT NULL REFERENCES generators(id) ON DELETE CASCADE,
    agent_kind    TEXT NOT NULL,
    agent_id      INTEGER NOT NULL,
    user_name     TEXT NULL,
    reason        TEXT NOT NULL,
    timestamp_ms  INTEGER NOT NULL,
    UNIQUE (generator_id, agent_kind, agent_id)
);

CREATE TABLE IF NOT EXISTS readies (
    generator_id  INTEGER NOT NULL REFERENCES generators(id) ON DELETE CASCADE,
    agent_kind    TEXT NOT NULL,
    agent_id      INTEGER NOT NULL,
    user_name     TEXT NULL,
    timestamp_ms  INTEGER NOT NULL,
    UNIQUE (generator_id, agent_kind, agent_id)
);

CREATE TABLE IF NOT EXISTS generation_times (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    generator_id  INTEGER NOT NULL REFERENCES generators(id) ON DELETE CASCADE,
    timestamp_ms  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_generation_times_generator
    ON generation_times(generator_id, timestamp_ms);
"#;

const GENERATOR_COLUMNS: &str = "id, realm_kind, realm_id, generating, generation_time_ms, \
     task_handle, force_generate, autogenerate, allow_pauses, minimum_between_secs";

fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> KernelError {
    KernelError::Driver(format!("{prefix}: {e}"))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Read an epoch-millisecond column; out-of-range values are a row error.
fn ms_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    ms_to_dt(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_ms_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(ms) => ms_to_dt(ms)
            .map(Some)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms)),
        None => Ok(None),
    }
}

fn ms_to_dt(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn row_to_generator(row: &Row<'_>) -> rusqlite::Result<Generator> {
    Ok(Generator {
        id: row.get::<_, i64>(0)? as GeneratorId,
        realm: RealmRef::new(row.get::<_, String>(1)?, row.get::<_, i64>(2)? as u64),
        generating: row.get(3)?,
        generation_time: opt_ms_column(row, 4)?,
        task_handle: row.get::<_, Option<String>>(5)?.map(TaskHandle::from),
        config: GeneratorConfig {
            force_generate: row.get(6)?,
            autogenerate: row.get(7)?,
            allow_pauses: row.get(8)?,
            minimum_between_generations: row.get::<_, Option<i64>>(9)?.map(Duration::seconds),
        },
    })
}

/// Column values of a schedule update: (handle, eta_ms).
fn schedule_values(update: &ScheduleUpdate) -> Option<(Option<String>, Option<i64>)> {
    match update {
        ScheduleUpdate::Keep => None,
        ScheduleUpdate::Clear => Some((None, None)),
        ScheduleUpdate::Set { handle, eta } => {
            Some((Some(handle.as_str().to_string()), Some(dt_to_ms(*eta))))
        }
    }
}

pub struct SqliteGeneratorRepository {
    conn: Mutex<Connection>,
}

impl SqliteGeneratorRepository {
    /// Open (or create) the database at `path`; `":memory:"` for a private one.
    pub fn new(path: &str) -> Result<Self, KernelError> {
        let conn = Connection::open(path).map_err(|e| map_driver_err("open sqlite", e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| map_driver_err("schema bootstrap", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|e| map_driver_err("sqlite connection poisoned", e))
    }

    fn ensure_exists(conn: &Connection, id: GeneratorId) -> Result<(), KernelError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM generators WHERE id = ?1",
                params![id as i64],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| map_driver_err("lookup generator", e))?;
        found.ok_or(KernelError::GeneratorNotFound(id))
    }

    fn query_generators(
        conn: &Connection,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Generator>, KernelError> {
        let sql = format!("SELECT {GENERATOR_COLUMNS} FROM generators {filter} ORDER BY id ASC");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_driver_err("prepare generator query", e))?;
        let rows = stmt
            .query_map(args, row_to_generator)
            .map_err(|e| map_driver_err("query generators", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("read generator", e))
    }
}

impl GeneratorRepository for SqliteGeneratorRepository {
    fn create_generator(
        &self,
        realm: &RealmRef,
        config: &GeneratorConfig,
    ) -> Result<Generator, KernelError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO generators
             (realm_kind, realm_id, force_generate, autogenerate, allow_pauses, minimum_between_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                realm.kind,
                realm.id as i64,
                config.force_generate,
                config.autogenerate,
                config.allow_pauses,
                config.minimum_between_generations.map(|d| d.num_seconds()),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(KernelError::GeneratorExists(realm.clone()))
            }
            Err(e) => return Err(map_driver_err("insert generator", e)),
        }
        Ok(Generator {
            id: conn.last_insert_rowid() as GeneratorId,
            realm: realm.clone(),
            generating: false,
            generation_time: None,
            task_handle: None,
            config: config.clone(),
        })
    }

    fn get_generator(&self, id: GeneratorId) -> Result<Option<Generator>, KernelError> {
        let conn = self.lock()?;
        Ok(Self::query_generators(&conn, "WHERE id = ?1", params![id as i64])?
            .into_iter()
            .next())
    }

    fn find_generator(&self, realm: &RealmRef) -> Result<Option<Generator>, KernelError> {
        let conn = self.lock()?;
        Ok(Self::query_generators(
            &conn,
            "WHERE realm_kind = ?1 AND realm_id = ?2",
            params![realm.kind, realm.id as i64],
        )?
        .into_iter()
        .next())
    }

    fn list_generators(&self) -> Result<Vec<Generator>, KernelError> {
        let conn = self.lock()?;
        Self::query_generators(&conn, "", [])
    }

    fn update_config(
        &self,
        id: GeneratorId,
        config: &GeneratorConfig,
    ) -> Result<(), KernelError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE generators
                 SET force_generate = ?2, autogenerate = ?3, allow_pauses = ?4,
                     minimum_between_secs = ?5
                 WHERE id = ?1",
                params![
                    id as i64,
                    config.force_generate,
                    config.autogenerate,
                    config.allow_pauses,
                    config.minimum_between_generations.map(|d| d.num_seconds()),
                ],
            )
            .map_err(|e| map_driver_err("update config", e))?;
        if updated == 0 {
            return Err(KernelError::GeneratorNotFound(id));
        }
        Ok(())
    }

    fn delete_generator(&self, id: GeneratorId) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM generators WHERE id = ?1", params![id as i64])
            .map_err(|e| map_driver_err("delete generator", e))?;
        Ok(deleted > 0)
    }

    fn add_rule(&self, id: GeneratorId, rule: &RecurrenceRule) -> Result<StoredRule, KernelError> {
        let conn = self.lock()?;
        Self::ensure_exists(&conn, id)?;
        let json = serde_json::to_string(rule).map_err(|e| map_driver_err("encode rule", e))?;
        conn.execute(
            "INSERT INTO generation_rules (generator_id, rule_json) VALUES (?1, ?2)",
            params![id as i64, json],
        )
        .map_err(|e| map_driver_err("insert rule", e))?;
        Ok(StoredRule {
            id: conn.last_insert_rowid() as RuleId,
            generator_id: id,
            rule: rule.clone(),
        })
    }

    fn remove_rule(&self, id: GeneratorId, rule_id: RuleId) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM generation_rules WHERE id = ?1 AND generator_id = ?2",
                params![rule_id as i64, id as i64],
            )
            .map_err(|e| map_driver_err("delete rule", e))?;
        Ok(deleted > 0)
    }

    fn list_rules(&self, id: GeneratorId) -> Result<Vec<StoredRule>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, rule_json FROM generation_rules
                 WHERE generator_id = ?1 ORDER BY id ASC",
            )
            .map_err(|e| map_driver_err("prepare rule query", e))?;
        let rows = stmt
            .query_map(params![id as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| map_driver_err("query rules", e))?;

        let mut rules = Vec::new();
        for row in rows {
            let (rule_id, json) = row.map_err(|e| map_driver_err("read rule", e))?;
            let rule: RecurrenceRule =
                serde_json::from_str(&json).map_err(|e| map_driver_err("decode rule", e))?;
            rules.push(StoredRule {
                id: rule_id as RuleId,
                generator_id: id,
                rule,
            });
        }
        Ok(rules)
    }

    fn add_pause(&self, pause: &Pause) -> Result<(), KernelError> {
        let conn = self.lock()?;
        Self::ensure_exists(&conn, pause.generator_id)?;
        match conn.execute(
            "INSERT INTO pauses
             (generator_id, agent_kind, agent_id, user_name, reason, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pause.generator_id as i64,
                pause.agent.kind,
                pause.agent.id as i64,
                pause.user,
                pause.reason,
                dt_to_ms(pause.timestamp),
            ],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(KernelError::AlreadyPaused(pause.agent.clone())),
            Err(e) => Err(map_driver_err("insert pause", e)),
        }
    }

    fn remove_pause(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM pauses WHERE generator_id = ?1 AND agent_kind = ?2 AND agent_id = ?3",
                params![id as i64, agent.kind, agent.id as i64],
            )
            .map_err(|e| map_driver_err("delete pause", e))?;
        Ok(deleted > 0)
    }

    fn list_pauses(&self, id: GeneratorId) -> Result<Vec<Pause>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT agent_kind, agent_id, user_name, reason, timestamp_ms FROM pauses
                 WHERE generator_id = ?1 ORDER BY rowid ASC",
            )
            .map_err(|e| map_driver_err("prepare pause query", e))?;
        let rows = stmt
            .query_map(params![id as i64], |row| {
                Ok(Pause {
                    generator_id: id,
                    agent: AgentRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64),
                    user: row.get(2)?,
                    reason: row.get(3)?,
                    timestamp: ms_column(row, 4)?,
                })
            })
            .map_err(|e| map_driver_err("query pauses", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("read pause", e))
    }

    fn add_ready(&self, ready: &Ready) -> Result<(), KernelError> {
        let conn = self.lock()?;
        Self::ensure_exists(&conn, ready.generator_id)?;
        match conn.execute(
            "INSERT INTO readies (generator_id, agent_kind, agent_id, user_name, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ready.generator_id as i64,
                ready.agent.kind,
                ready.agent.id as i64,
                ready.user,
                dt_to_ms(ready.timestamp),
            ],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(KernelError::AlreadyReady(ready.agent.clone())),
            Err(e) => Err(map_driver_err("insert ready", e)),
        }
    }

    fn remove_ready(&self, id: GeneratorId, agent: &AgentRef) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM readies WHERE generator_id = ?1 AND agent_kind = ?2 AND agent_id = ?3",
                params![id as i64, agent.kind, agent.id as i64],
            )
            .map_err(|e| map_driver_err("delete ready", e))?;
        Ok(deleted > 0)
    }

    fn list_readies(&self, id: GeneratorId) -> Result<Vec<Ready>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT agent_kind, agent_id, user_name, timestamp_ms FROM readies
                 WHERE generator_id = ?1 ORDER BY rowid ASC",
            )
            .map_err(|e| map_driver_err("prepare ready query", e))?;
        let rows = stmt
            .query_map(params![id as i64], |row| {
                Ok(Ready {
                    generator_id: id,
                    agent: AgentRef::new(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64),
                    user: row.get(2)?,
                    timestamp: ms_column(row, 3)?,
                })
            })
            .map_err(|e| map_driver_err("query readies", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("read ready", e))
    }

    fn clear_readies(&self, id: GeneratorId) -> Result<u64, KernelError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute("DELETE FROM readies WHERE generator_id = ?1", params![id as i64])
            .map_err(|e| map_driver_err("clear readies", e))?;
        Ok(deleted as u64)
    }

    fn append_generation_time(
        &self,
        id: GeneratorId,
        timestamp: DateTime<Utc>,
    ) -> Result<GenerationTime, KernelError> {
        let conn = self.lock()?;
        Self::ensure_exists(&conn, id)?;
        conn.execute(
            "INSERT INTO generation_times (generator_id, timestamp_ms) VALUES (?1, ?2)",
            params![id as i64, dt_to_ms(timestamp)],
        )
        .map_err(|e| map_driver_err("insert generation time", e))?;
        Ok(GenerationTime {
            generator_id: id,
            timestamp,
        })
    }

    fn list_generation_times(&self, id: GeneratorId) -> Result<Vec<GenerationTime>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT timestamp_ms FROM generation_times
                 WHERE generator_id = ?1 ORDER BY timestamp_ms DESC, id DESC",
            )
            .map_err(|e| map_driver_err("prepare generation time query", e))?;
        let rows = stmt
            .query_map(params![id as i64], |row| {
                Ok(GenerationTime {
                    generator_id: id,
                    timestamp: ms_column(row, 0)?,
                })
            })
            .map_err(|e| map_driver_err("query generation times", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| map_driver_err("read generation time", e))
    }

    fn try_acquire_lock(&self, id: GeneratorId) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let updated = conn
            .execute(
                "UPDATE generators SET generating = 1 WHERE id = ?1 AND generating = 0",
                params![id as i64],
            )
            .map_err(|e| map_driver_err("acquire generator lock", e))?;
        Ok(updated == 1)
    }

    fn release_lock(
        &self,
        id: GeneratorId,
        expected: Option<&TaskHandle>,
        schedule: &ScheduleUpdate,
    ) -> Result<bool, KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_driver_err("begin release", e))?;
        let unlocked = tx
            .execute(
                "UPDATE generators SET generating = 0 WHERE id = ?1",
                params![id as i64],
            )
            .map_err(|e| map_driver_err("release generator lock", e))?;
        if unlocked == 0 {
            return Err(KernelError::GeneratorNotFound(id));
        }
        let applied = match schedule_values(schedule) {
            None => true,
            Some((handle, eta_ms)) => {
                let expected = expected.map(|h| h.as_str().to_string());
                tx.execute(
                    "UPDATE generators SET task_handle = ?3, generation_time_ms = ?4
                     WHERE id = ?1 AND task_handle IS ?2",
                    params![id as i64, expected, handle, eta_ms],
                )
                .map_err(|e| map_driver_err("release schedule", e))?
                    > 0
            }
        };
        tx.commit()
            .map_err(|e| map_driver_err("commit release", e))?;
        Ok(applied)
    }

    fn replace_schedule(
        &self,
        id: GeneratorId,
        expected: Option<&TaskHandle>,
        schedule: &ScheduleUpdate,
    ) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let expected = expected.map(|h| h.as_str().to_string());
        let updated = match schedule_values(schedule) {
            None => conn.execute(
                "UPDATE generators SET task_handle = task_handle
                 WHERE id = ?1 AND task_handle IS ?2",
                params![id as i64, expected],
            ),
            Some((handle, eta_ms)) => conn.execute(
                "UPDATE generators SET task_handle = ?3, generation_time_ms = ?4
                 WHERE id = ?1 AND task_handle IS ?2",
                params![id as i64, expected, handle, eta_ms],
            ),
        }
        .map_err(|e| map_driver_err("replace schedule", e))?;
        if updated == 0 {
            Self::ensure_exists(&conn, id)?;
            return Ok(false);
        }
        Ok(true)
    }
}
