//! 질의 기록 - 질의당 관측 레코드
//!
//! 모든 `ask` 호출은 성공/거절/에러와 관계없이 정확히 하나의 `QueryRecord`를 남깁니다.
//! 기록 실패는 경고 로그만 남기고 질의를 실패시키지 않습니다.
//!
//! 저장 위치: ~/.grounded-rag/queries.db

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::get_data_dir;
use crate::guardrail::GuardrailFlag;
use crate::knowledge::ChunkId;

use super::answer::RefusalReason;

/// 질의 로그 DB 파일 이름
pub const QUERY_LOG_FILE_NAME: &str = "queries.db";

// ============================================================================
// Types
// ============================================================================

/// 질의 하나의 관측 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: Uuid,
    pub session_id: String,
    /// 질의 시점의 코퍼스 세대
    pub generation: Uuid,
    pub query: String,
    pub evidence_chunk_ids: Vec<ChunkId>,
    pub fused_scores: Vec<f64>,
    pub guardrail_flags: Vec<GuardrailFlag>,
    pub refused: bool,
    pub refusal_reason: Option<RefusalReason>,
    /// 실패 시 내부 에러 메시지
    pub error: Option<String>,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// 질의 로그 통계
#[derive(Debug, Clone, Serialize)]
pub struct QueryLogStats {
    pub total: usize,
    pub answered: usize,
    pub refused: usize,
    pub guardrail_blocked: usize,
    pub errors: usize,
    pub avg_latency_ms: f64,
    pub db_path: PathBuf,
}

// ============================================================================
// QueryRecorder Trait
// ============================================================================

/// 질의 레코드 싱크
pub trait QueryRecorder: Send + Sync {
    fn record(&self, record: &QueryRecord) -> Result<()>;
}

/// `tracing` 이벤트로 기록
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl QueryRecorder for TracingRecorder {
    fn record(&self, record: &QueryRecord) -> Result<()> {
        tracing::info!(
            query_id = %record.query_id,
            session = %record.session_id,
            generation = %record.generation,
            evidence = record.evidence_chunk_ids.len(),
            guardrail_flags = record.guardrail_flags.len(),
            refused = record.refused,
            refusal_reason = record.refusal_reason.map(|r| r.as_str()).unwrap_or("-"),
            error = record.error.as_deref().unwrap_or("-"),
            latency_ms = record.latency_ms,
            "query completed"
        );
        Ok(())
    }
}

// ============================================================================
// SqliteQueryLog
// ============================================================================

/// SQLite 질의 로그
pub struct SqliteQueryLog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteQueryLog {
    /// 로그 DB 열기 (없으면 생성)
    ///
    /// # Arguments
    /// * `path` - DB 파일 경로
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let log = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        log.initialize()?;
        Ok(log)
    }

    /// 기본 위치에서 열기 (~/.grounded-rag/queries.db)
    pub fn open_default() -> Result<Self> {
        Self::open(&get_data_dir().join(QUERY_LOG_FILE_NAME))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queries (
                query_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                generation TEXT NOT NULL,
                query TEXT NOT NULL,
                evidence_chunk_ids TEXT NOT NULL,
                fused_scores TEXT NOT NULL,
                guardrail_flags TEXT NOT NULL,
                refused INTEGER NOT NULL,
                refusal_reason TEXT,
                error TEXT,
                latency_ms INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create queries table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queries_timestamp ON queries(timestamp)",
            [],
        )
        .context("Failed to create timestamp index")?;

        tracing::debug!("Query log initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 최근 레코드 조회 (최신순)
    pub fn recent(&self, limit: usize) -> Result<Vec<QueryRecord>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare(
            "SELECT query_id, session_id, generation, query, evidence_chunk_ids, fused_scores,
                    guardrail_flags, refused, refusal_reason, error, latency_ms, timestamp
             FROM queries
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(QueryRecord {
                query_id: parse_uuid(row.get::<_, String>(0)?),
                session_id: row.get(1)?,
                generation: parse_uuid(row.get::<_, String>(2)?),
                query: row.get(3)?,
                evidence_chunk_ids: parse_json(row.get::<_, String>(4)?),
                fused_scores: parse_json(row.get::<_, String>(5)?),
                guardrail_flags: parse_json(row.get::<_, String>(6)?),
                refused: row.get(7)?,
                refusal_reason: row
                    .get::<_, Option<String>>(8)?
                    .as_deref()
                    .and_then(parse_refusal_reason),
                error: row.get(9)?,
                latency_ms: row.get::<_, i64>(10)?.max(0) as u64,
                timestamp: parse_datetime(row.get::<_, String>(11)?),
            })
        })?;

        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// 로그 통계
    pub fn stats(&self) -> Result<QueryLogStats> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let (total, refused, blocked, errors, avg_latency): (i64, i64, i64, i64, f64) = conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(refused), 0),
                        COALESCE(SUM(CASE WHEN refusal_reason = 'guardrail_blocked' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN error IS NOT NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(AVG(latency_ms), 0.0)
                 FROM queries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .context("Failed to compute query log stats")?;

        Ok(QueryLogStats {
            total: total as usize,
            answered: (total - refused - errors).max(0) as usize,
            refused: refused as usize,
            guardrail_blocked: blocked as usize,
            errors: errors as usize,
            avg_latency_ms: avg_latency,
            db_path: self.db_path.clone(),
        })
    }
}

impl QueryRecorder for SqliteQueryLog {
    fn record(&self, record: &QueryRecord) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "INSERT INTO queries (query_id, session_id, generation, query, evidence_chunk_ids,
                                  fused_scores, guardrail_flags, refused, refusal_reason, error,
                                  latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record.query_id.to_string(),
                record.session_id,
                record.generation.to_string(),
                record.query,
                serde_json::to_string(&record.evidence_chunk_ids)?,
                serde_json::to_string(&record.fused_scores)?,
                serde_json::to_string(&record.guardrail_flags)?,
                record.refused,
                record.refusal_reason.map(|r| r.as_str()),
                record.error,
                record.latency_ms as i64,
                record.timestamp.to_rfc3339(),
            ],
        )
        .context("Failed to insert query record")?;

        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_uuid(s: String) -> Uuid {
    Uuid::parse_str(&s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_json<T: serde::de::DeserializeOwned + Default>(s: String) -> T {
    serde_json::from_str(&s).unwrap_or_default()
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_refusal_reason(s: &str) -> Option<RefusalReason> {
    match s {
        "no_evidence" => Some(RefusalReason::NoEvidence),
        "model_declined" => Some(RefusalReason::ModelDeclined),
        "guardrail_blocked" => Some(RefusalReason::GuardrailBlocked),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
