use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use surfacer_core::{
    cosine_similarity, AccessEffect, AdaptiveThresholdState, Clearance, DecisionRecord,
    FeedbackApplied, FeedbackConfig, FeedbackEvent, Memory, MemoryId, MemoryStatus, MemoryStore,
    RetrievedCandidate, SearchFilters, StoreError, UsageStats, UserIdentity,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

/// Bounded retries for versioned usage-stats and threshold-state updates.
const UPDATE_RETRY_LIMIT: usize = 5;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS memories (
  memory_id TEXT PRIMARY KEY,
  canonical_question TEXT NOT NULL,
  semantic_variants_json TEXT NOT NULL,
  answer_json TEXT NOT NULL,
  embedding_json TEXT NOT NULL,
  departments_json TEXT NOT NULL,
  tags_json TEXT NOT NULL,
  workflows_json TEXT NOT NULL,
  access_rule_json TEXT NOT NULL,
  expiration_json TEXT NOT NULL,
  authority_score REAL NOT NULL CHECK (authority_score >= 0.0 AND authority_score <= 1.0),
  status TEXT NOT NULL CHECK (status IN ('draft','pending_approval','approved','expired','archived')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_stats (
  memory_id TEXT PRIMARY KEY,
  access_count INTEGER NOT NULL,
  last_accessed TEXT,
  accept_rate REAL NOT NULL CHECK (accept_rate >= 0.0 AND accept_rate <= 1.0),
  row_version INTEGER NOT NULL,
  FOREIGN KEY (memory_id) REFERENCES memories(memory_id)
);

CREATE TABLE IF NOT EXISTS threshold_state (
  state_key TEXT PRIMARY KEY,
  positive REAL NOT NULL,
  negative REAL NOT NULL,
  row_version INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS identities (
  user_id TEXT PRIMARY KEY,
  role TEXT NOT NULL,
  department TEXT NOT NULL,
  clearance TEXT NOT NULL CHECK (clearance IN ('public','internal','confidential','restricted'))
);

CREATE TABLE IF NOT EXISTS feedback_events (
  fingerprint TEXT PRIMARY KEY,
  memory_id TEXT NOT NULL,
  context_fingerprint TEXT NOT NULL,
  outcome TEXT NOT NULL CHECK (outcome IN ('accepted','ignored','rejected','edited')),
  occurred_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (memory_id) REFERENCES memories(memory_id)
);

CREATE TABLE IF NOT EXISTS decision_log (
  decision_id TEXT PRIMARY KEY,
  generated_at TEXT NOT NULL,
  context_fingerprint TEXT NOT NULL,
  record_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_status ON memories(status);
CREATE INDEX IF NOT EXISTS idx_feedback_events_memory ON feedback_events(memory_id);
CREATE INDEX IF NOT EXISTS idx_decision_log_fingerprint ON decision_log(context_fingerprint);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

impl SqliteStore {
    /// Open a SQLite-backed store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
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

    /// Bound how long this handle waits on a busy database before the
    /// failure surfaces, eventually classified as [`StoreError::Timeout`].
    ///
    /// # Errors
    /// Returns an error when the pragma cannot be applied.
    pub fn set_busy_timeout(&self, timeout_ms: u64) -> Result<()> {
        self.conn
            .pragma_update(None, "busy_timeout", i64::try_from(timeout_ms).unwrap_or(i64::MAX))
            .context("failed to set sqlite busy timeout")?;
        Ok(())
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }
        Ok(())
    }

    /// Insert or replace one memory, validating it first. Usage stats rows
    /// are created alongside the memory and updated only through feedback.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn write_memory(&mut self, memory: &Memory) -> Result<()> {
        memory.validate().map_err(|err| anyhow!("memory rejected: {err}"))?;

        let tx = self.conn.transaction().context("failed to start write transaction")?;
        tx.execute(
            "INSERT INTO memories(
                memory_id, canonical_question, semantic_variants_json, answer_json,
                embedding_json, departments_json, tags_json, workflows_json,
                access_rule_json, expiration_json, authority_score, status,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(memory_id) DO UPDATE SET
                canonical_question = excluded.canonical_question,
                semantic_variants_json = excluded.semantic_variants_json,
                answer_json = excluded.answer_json,
                embedding_json = excluded.embedding_json,
                departments_json = excluded.departments_json,
                tags_json = excluded.tags_json,
                workflows_json = excluded.workflows_json,
                access_rule_json = excluded.access_rule_json,
                expiration_json = excluded.expiration_json,
                authority_score = excluded.authority_score,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                memory.id.to_string(),
                memory.canonical_question,
                to_json(&memory.semantic_variants)?,
                memory.answer.to_string(),
                to_json(&memory.embedding)?,
                to_json(&memory.departments)?,
                to_json(&memory.tags)?,
                to_json(&memory.workflows)?,
                to_json(&memory.access_rule)?,
                to_json(&memory.expiration)?,
                f64::from(memory.authority_score),
                memory.status.as_str(),
                format_timestamp(memory.created_at)?,
                format_timestamp(memory.updated_at)?,
            ],
        )
        .context("failed to insert memory")?;

        tx.execute(
            "INSERT INTO usage_stats(memory_id, access_count, last_accessed, accept_rate, row_version)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(memory_id) DO NOTHING",
            params![
                memory.id.to_string(),
                i64::try_from(memory.usage_stats.access_count).unwrap_or(i64::MAX),
                memory
                    .usage_stats
                    .last_accessed
                    .map(format_timestamp)
                    .transpose()?,
                f64::from(memory.usage_stats.accept_rate),
            ],
        )
        .context("failed to insert usage stats")?;

        tx.commit().context("failed to commit memory write")
    }

    /// Governance hook: status transitions come from the human approval
    /// workflow, never from the decision path.
    ///
    /// # Errors
    /// Returns an error when the memory does not exist or the update fails.
    pub fn set_memory_status(
        &self,
        memory_id: MemoryId,
        status: MemoryStatus,
        at: OffsetDateTime,
    ) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE memories SET status = ?2, updated_at = ?3 WHERE memory_id = ?1",
                params![memory_id.to_string(), status.as_str(), format_timestamp(at)?],
            )
            .context("failed to update memory status")?;
        if changed == 0 {
            return Err(anyhow!("memory not found: {memory_id}"));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails or stored data is corrupt.
    pub fn get_memory(&self, memory_id: MemoryId) -> Result<Option<Memory>> {
        let row = self
            .conn
            .query_row(
                &format!("{MEMORY_SELECT_SQL} WHERE m.memory_id = ?1"),
                params![memory_id.to_string()],
                map_memory_row,
            )
            .optional()
            .context("failed to query memory")?;
        row.map(decode_memory_row).transpose()
    }

    /// All memories regardless of status, in id order.
    ///
    /// # Errors
    /// Returns an error when the listing fails or stored data is corrupt.
    pub fn list_memories(&self) -> Result<Vec<Memory>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{MEMORY_SELECT_SQL} ORDER BY m.memory_id ASC"))
            .context("failed to prepare memory listing")?;
        let rows = stmt
            .query_map([], map_memory_row)
            .context("failed to list memories")?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(decode_memory_row(row.context("failed to read memory row")?)?);
        }
        Ok(memories)
    }

    /// Approved, unexpired, access-eligible candidates whose cosine
    /// similarity clears the filter floor, ordered (similarity desc, id asc), at most
    /// `k`. Denied memories never leave this function.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored data is corrupt.
    pub fn search_memories(
        &self,
        query_embedding: &[f32],
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedCandidate>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{MEMORY_SELECT_SQL} WHERE m.status = 'approved'"))
            .context("failed to prepare search")?;
        let rows = stmt
            .query_map([], map_memory_row)
            .context("failed to run search")?;

        let mut candidates = Vec::new();
        for row in rows {
            let memory = decode_memory_row(row.context("failed to read search row")?)?;
            if memory.expiration.is_expired(filters.not_expired_at) {
                continue;
            }
            if memory.access_rule.evaluate(&filters.requester) == AccessEffect::Deny {
                continue;
            }
            let similarity = cosine_similarity(query_embedding, &memory.embedding);
            if similarity < filters.similarity_floor {
                continue;
            }
            candidates.push(RetrievedCandidate { memory, similarity });
        }

        candidates.sort_by(|lhs, rhs| {
            rhs.similarity
                .partial_cmp(&lhs.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| lhs.memory.id.cmp(&rhs.memory.id))
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    /// # Errors
    /// Returns an error when persistence fails.
    pub fn upsert_identity(&self, identity: &UserIdentity) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO identities(user_id, role, department, clearance)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    role = excluded.role,
                    department = excluded.department,
                    clearance = excluded.clearance",
                params![
                    identity.id,
                    identity.role,
                    identity.department,
                    identity.clearance.as_str()
                ],
            )
            .context("failed to upsert identity")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails or stored data is corrupt.
    pub fn get_identity(&self, user_id: &str) -> Result<Option<UserIdentity>> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, role, department, clearance FROM identities WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to query identity")?;
        row.map(|(id, role, department, clearance)| {
            let clearance = Clearance::parse(&clearance)
                .ok_or_else(|| anyhow!("corrupt clearance value: {clearance}"))?;
            Ok(UserIdentity { id, role, department, clearance })
        })
        .transpose()
    }

    /// Adaptive state for one user/context fingerprint; defaults when absent.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn load_threshold_state(&self, key: &str) -> Result<AdaptiveThresholdState> {
        let row = self
            .conn
            .query_row(
                "SELECT positive, negative FROM threshold_state WHERE state_key = ?1",
                params![key],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()
            .context("failed to query threshold state")?;
        Ok(match row {
            Some((positive, negative)) => AdaptiveThresholdState {
                key: key.to_string(),
                positive: f32_from_stored(positive),
                negative: f32_from_stored(negative),
            },
            None => AdaptiveThresholdState::new(key),
        })
    }

    /// Deduplicate one feedback event, then fold it into the memory's usage
    /// stats and the submitting context's threshold state.
    ///
    /// Updates are guarded by per-row versions and retried a bounded number
    /// of times, so concurrent feedback for the same key never loses counts
    /// while feedback for different keys proceeds independently.
    ///
    /// # Errors
    /// Returns an error when the update cannot be applied.
    pub fn apply_feedback(
        &mut self,
        event: &FeedbackEvent,
        config: &FeedbackConfig,
        recorded_at: OffsetDateTime,
    ) -> Result<FeedbackApplied> {
        let memory_exists = self
            .conn
            .query_row(
                "SELECT 1 FROM memories WHERE memory_id = ?1",
                params![event.memory_id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .context("failed to check memory existence")?
            .is_some();
        if !memory_exists {
            return Ok(FeedbackApplied::UnknownMemory);
        }

        let fingerprint = feedback_fingerprint(event)?;

        for _ in 0..UPDATE_RETRY_LIMIT {
            let tx = self.conn.transaction().context("failed to start feedback transaction")?;
            let inserted = tx
                .execute(
                    "INSERT INTO feedback_events(
                        fingerprint, memory_id, context_fingerprint, outcome,
                        occurred_at, recorded_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(fingerprint) DO NOTHING",
                    params![
                        fingerprint,
                        event.memory_id.to_string(),
                        event.context_fingerprint,
                        event.outcome.as_str(),
                        format_timestamp(event.occurred_at)?,
                        format_timestamp(recorded_at)?,
                    ],
                )
                .context("failed to record feedback event")?;
            if inserted == 0 {
                tx.commit().context("failed to commit duplicate feedback")?;
                return Ok(FeedbackApplied::Duplicate);
            }

            let stats_updated = update_usage_stats(&tx, event, config)?;
            let state_updated = update_threshold_state(&tx, event, config, recorded_at)?;
            if stats_updated && state_updated {
                tx.commit().context("failed to commit feedback")?;
                return Ok(FeedbackApplied::Applied);
            }
            // Version moved under us; roll back the event insert and retry.
            drop(tx);
            tracing::warn!(
                memory_id = %event.memory_id,
                "feedback update lost a version race; retrying"
            );
        }

        Err(anyhow!("feedback update exhausted {UPDATE_RETRY_LIMIT} retries"))
    }

    /// # Errors
    /// Returns an error when the decision log cannot be written.
    pub fn save_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO decision_log(
                    decision_id, generated_at, context_fingerprint, record_json
                ) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.decision_id,
                    format_timestamp(record.generated_at)?,
                    record.context_fingerprint,
                    to_json(record)?,
                ],
            )
            .context("failed to save decision record")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the decision log cannot be read or is corrupt.
    pub fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRecord>> {
        let json = self
            .conn
            .query_row(
                "SELECT record_json FROM decision_log WHERE decision_id = ?1",
                params![decision_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to query decision record")?;
        json.map(|payload| {
            serde_json::from_str(&payload).context("corrupt decision record json")
        })
        .transpose()
    }
}

const MEMORY_SELECT_SQL: &str = "SELECT
    m.memory_id, m.canonical_question, m.semantic_variants_json, m.answer_json,
    m.embedding_json, m.departments_json, m.tags_json, m.workflows_json,
    m.access_rule_json, m.expiration_json, m.authority_score, m.status,
    m.created_at, m.updated_at,
    s.access_count, s.last_accessed, s.accept_rate
 FROM memories m
 JOIN usage_stats s ON s.memory_id = m.memory_id";

struct MemoryRow {
    memory_id: String,
    canonical_question: String,
    semantic_variants_json: String,
    answer_json: String,
    embedding_json: String,
    departments_json: String,
    tags_json: String,
    workflows_json: String,
    access_rule_json: String,
    expiration_json: String,
    authority_score: f64,
    status: String,
    created_at: String,
    updated_at: String,
    access_count: i64,
    last_accessed: Option<String>,
    accept_rate: f64,
}

fn map_memory_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRow> {
    Ok(MemoryRow {
        memory_id: row.get(0)?,
        canonical_question: row.get(1)?,
        semantic_variants_json: row.get(2)?,
        answer_json: row.get(3)?,
        embedding_json: row.get(4)?,
        departments_json: row.get(5)?,
        tags_json: row.get(6)?,
        workflows_json: row.get(7)?,
        access_rule_json: row.get(8)?,
        expiration_json: row.get(9)?,
        authority_score: row.get(10)?,
        status: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        access_count: row.get(14)?,
        last_accessed: row.get(15)?,
        accept_rate: row.get(16)?,
    })
}

fn decode_memory_row(row: MemoryRow) -> Result<Memory> {
    let id = MemoryId(
        Ulid::from_str(&row.memory_id)
            .map_err(|err| anyhow!("corrupt memory id {}: {err}", row.memory_id))?,
    );
    let status = MemoryStatus::parse(&row.status)
        .ok_or_else(|| anyhow!("corrupt memory status: {}", row.status))?;
    Ok(Memory {
        id,
        canonical_question: row.canonical_question,
        semantic_variants: from_json(&row.semantic_variants_json, "semantic_variants")?,
        answer: from_json(&row.answer_json, "answer")?,
        embedding: from_json(&row.embedding_json, "embedding")?,
        departments: from_json(&row.departments_json, "departments")?,
        tags: from_json(&row.tags_json, "tags")?,
        workflows: from_json(&row.workflows_json, "workflows")?,
        access_rule: from_json(&row.access_rule_json, "access_rule")?,
        expiration: from_json(&row.expiration_json, "expiration")?,
        authority_score: f32_from_stored(row.authority_score),
        usage_stats: UsageStats {
            access_count: u64::try_from(row.access_count).unwrap_or(0),
            last_accessed: row.last_accessed.map(|raw| parse_timestamp(&raw)).transpose()?,
            accept_rate: f32_from_stored(row.accept_rate),
        },
        status,
        created_at: parse_timestamp(&row.created_at)?,
        updated_at: parse_timestamp(&row.updated_at)?,
    })
}

fn update_usage_stats(
    tx: &rusqlite::Transaction<'_>,
    event: &FeedbackEvent,
    config: &FeedbackConfig,
) -> Result<bool> {
    let (access_count, last_accessed, accept_rate, row_version) = tx
        .query_row(
            "SELECT access_count, last_accessed, accept_rate, row_version
             FROM usage_stats WHERE memory_id = ?1",
            params![event.memory_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .context("failed to load usage stats")?;

    let mut stats = UsageStats {
        access_count: u64::try_from(access_count).unwrap_or(0),
        last_accessed: last_accessed.map(|raw| parse_timestamp(&raw)).transpose()?,
        accept_rate: f32_from_stored(accept_rate),
    };
    stats.apply(event.outcome, event.occurred_at, config.ema_alpha);

    let changed = tx
        .execute(
            "UPDATE usage_stats SET
                access_count = ?2, last_accessed = ?3, accept_rate = ?4,
                row_version = row_version + 1
             WHERE memory_id = ?1 AND row_version = ?5",
            params![
                event.memory_id.to_string(),
                i64::try_from(stats.access_count).unwrap_or(i64::MAX),
                stats.last_accessed.map(format_timestamp).transpose()?,
                f64::from(stats.accept_rate),
                row_version,
            ],
        )
        .context("failed to update usage stats")?;
    Ok(changed == 1)
}

fn update_threshold_state(
    tx: &rusqlite::Transaction<'_>,
    event: &FeedbackEvent,
    config: &FeedbackConfig,
    recorded_at: OffsetDateTime,
) -> Result<bool> {
    let row = tx
        .query_row(
            "SELECT positive, negative, row_version FROM threshold_state WHERE state_key = ?1",
            params![event.context_fingerprint],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?, row.get::<_, i64>(2)?)),
        )
        .optional()
        .context("failed to load threshold state")?;

    let mut state = AdaptiveThresholdState {
        key: event.context_fingerprint.clone(),
        positive: row.map_or(0.0, |(positive, _, _)| f32_from_stored(positive)),
        negative: row.map_or(0.0, |(_, negative, _)| f32_from_stored(negative)),
    };
    state.apply(event.outcome, config);

    let changed = match row {
        Some((_, _, row_version)) => tx
            .execute(
                "UPDATE threshold_state SET
                    positive = ?2, negative = ?3, row_version = row_version + 1,
                    updated_at = ?4
                 WHERE state_key = ?1 AND row_version = ?5",
                params![
                    event.context_fingerprint,
                    f64::from(state.positive),
                    f64::from(state.negative),
                    format_timestamp(recorded_at)?,
                    row_version,
                ],
            )
            .context("failed to update threshold state")?,
        None => tx
            .execute(
                "INSERT INTO threshold_state(state_key, positive, negative, row_version, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(state_key) DO NOTHING",
                params![
                    event.context_fingerprint,
                    f64::from(state.positive),
                    f64::from(state.negative),
                    format_timestamp(recorded_at)?,
                ],
            )
            .context("failed to insert threshold state")?,
    };
    Ok(changed == 1)
}

fn feedback_fingerprint(event: &FeedbackEvent) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(event.memory_id.to_string().as_bytes());
    hasher.update(event.context_fingerprint.as_bytes());
    hasher.update(event.outcome.as_str().as_bytes());
    hasher.update(format_timestamp(event.occurred_at)?.as_bytes());
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    Ok(format!("fbk_{}", &digest_hex[..32]))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get::<_, i64>(0),
        )
        .context("failed to read schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, format_timestamp(OffsetDateTime::now_utc())?],
    )
    .context("failed to record schema version")?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize value to json")
}

fn from_json<T: serde::de::DeserializeOwned>(payload: &str, field: &str) -> Result<T> {
    serde_json::from_str(payload).with_context(|| format!("corrupt {field} json"))
}

fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format timestamp")
}

fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("corrupt timestamp: {raw}"))
}

#[allow(clippy::cast_possible_truncation)]
fn f32_from_stored(value: f64) -> f32 {
    value as f32
}

/// Handle implementing the engine's store seam by opening a connection per
/// call. Cheap to clone into service state; SQLite's WAL mode handles the
/// concurrent readers.
#[derive(Debug, Clone)]
pub struct SqliteMemoryStore {
    db_path: PathBuf,
    busy_timeout_ms: u64,
}

impl SqliteMemoryStore {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, busy_timeout_ms: 5_000 }
    }

    /// Retrieval deadline for this handle; a database busy past this bound
    /// is reported as [`StoreError::Timeout`].
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.busy_timeout_ms = timeout_ms;
        self
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.set_busy_timeout(self.busy_timeout_ms)?;
        store.migrate()?;
        Ok(store)
    }
}

fn classify_store_error(err: &anyhow::Error) -> StoreError {
    if let Some(sqlite_err) = err.downcast_ref::<rusqlite::Error>() {
        if let rusqlite::Error::SqliteFailure(failure, _) = sqlite_err {
            if failure.code == ErrorCode::DatabaseBusy || failure.code == ErrorCode::DatabaseLocked
            {
                return StoreError::Timeout;
            }
        }
    }
    StoreError::Unavailable(format!("{err:#}"))
}

impl MemoryStore for SqliteMemoryStore {
    fn search(
        &self,
        query_embedding: &[f32],
        filters: &SearchFilters,
        k: usize,
    ) -> Result<Vec<RetrievedCandidate>, StoreError> {
        let store = self.open_migrated().map_err(|err| classify_store_error(&err))?;
        store
            .search_memories(query_embedding, filters, k)
            .map_err(|err| classify_store_error(&err))
    }

    fn resolve_user(&self, user_id: &str) -> Result<Option<UserIdentity>, StoreError> {
        let store = self.open_migrated().map_err(|err| classify_store_error(&err))?;
        store.get_identity(user_id).map_err(|err| classify_store_error(&err))
    }

    fn load_threshold_state(&self, key: &str) -> Result<AdaptiveThresholdState, StoreError> {
        let store = self.open_migrated().map_err(|err| classify_store_error(&err))?;
        store.load_threshold_state(key).map_err(|err| classify_store_error(&err))
    }

    fn apply_feedback(
        &self,
        event: &FeedbackEvent,
        config: &FeedbackConfig,
    ) -> Result<FeedbackApplied, StoreError> {
        let mut store = self.open_migrated().map_err(|err| classify_store_error(&err))?;
        store
            .apply_feedback(event, config, OffsetDateTime::now_utc())
            .map_err(|err| classify_store_error(&err))
    }

    fn save_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        let store = self.open_migrated().map_err(|err| classify_store_error(&err))?;
        store.save_decision(record).map_err(|err| classify_store_error(&err))
    }

    fn get_decision(&self, decision_id: &str) -> Result<Option<DecisionRecord>, StoreError> {
        let store = self.open_migrated().map_err(|err| classify_store_error(&err))?;
        store.get_decision(decision_id).map_err(|err| classify_store_error(&err))
    }
}
