//! 렉시컬 검색 - SQLite FTS5 BM25
//!
//! 코퍼스 세대마다 메모리 내 FTS5 테이블을 한 번 만들고, 질의 시에는
//! 메타데이터 필터를 통과한 후보의 rowid로 검색 범위를 제한합니다.
//! rowid는 저장소 삽입 순서이므로 동점은 삽입 순서로 정렬됩니다.
//! source: https://www.sqlite.org/fts5.html#the_bm25_function

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::{RagError, Result};

use super::store::{Chunk, ChunkStore};
use super::RankedResult;

/// 용어 빈도 포화 파라미터 (FTS5 bm25 고정값)
pub const BM25_K1: f64 = 1.2;
/// 문서 길이 정규화 파라미터 (FTS5 bm25 고정값)
pub const BM25_B: f64 = 0.75;

/// 불용어 (질문 형태의 일반 단어가 점수를 지배하지 않도록)
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for",
    "from", "how", "i", "in", "is", "it", "its", "of", "on", "or", "that", "the", "this",
    "to", "was", "what", "when", "where", "which", "who", "why", "will", "with", "you",
    "your",
];

// ============================================================================
// LexicalRetriever
// ============================================================================

/// FTS5 기반 BM25 렉시컬 검색기
///
/// `Connection`은 `Sync`가 아니므로 `Mutex`로 감쌉니다.
pub struct LexicalRetriever {
    conn: Mutex<Connection>,
    store: Arc<ChunkStore>,
}

impl LexicalRetriever {
    /// 코퍼스 세대에 대한 FTS5 인덱스 생성
    ///
    /// 본문은 `tokenize()` 결과를 공백으로 이어 저장하므로
    /// 불용어는 문서 길이에도 포함되지 않습니다.
    ///
    /// # Errors
    /// SQLite/FTS5 초기화 실패 시 `LexicalIndex`
    pub fn build(store: Arc<ChunkStore>) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;

        conn.execute(
            "CREATE VIRTUAL TABLE chunks_fts USING fts5(
                body,
                tokenize = 'unicode61 remove_diacritics 0'
            )",
            [],
        )?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO chunks_fts(rowid, body) VALUES (?1, ?2)")?;
            for (i, chunk) in store.chunks().iter().enumerate() {
                stmt.execute(params![rowid(i), tokenize(&chunk.text).join(" ")])?;
            }
        }
        tx.commit()?;

        tracing::debug!(
            "Lexical index ready: generation={}, rows={}",
            store.generation(),
            store.len()
        );

        Ok(Self {
            conn: Mutex::new(conn),
            store,
        })
    }

    /// BM25 검색
    ///
    /// # Arguments
    /// * `query` - 검색 쿼리
    /// * `candidates` - 후보 청크 (이 저장소에 없는 청크는 무시)
    /// * `k` - 최대 결과 수
    ///
    /// # Returns
    /// 점수 내림차순 결과. 겹치는 용어가 없으면 빈 목록.
    ///
    /// # Errors
    /// - 후보가 비어 있으면 `EmptyCorpus`
    /// - FTS5 질의 실패 시 `LexicalIndex`
    pub fn search(
        &self,
        query: &str,
        candidates: &[Arc<Chunk>],
        k: usize,
    ) -> Result<Vec<RankedResult>> {
        if candidates.is_empty() {
            return Err(RagError::EmptyCorpus);
        }

        let match_expr = fts5_match_expr(query);
        if match_expr.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let rowids: Vec<String> = candidates
            .iter()
            .filter_map(|c| self.store.position(&c.id))
            .map(|i| rowid(i).to_string())
            .collect();
        let rowids = format!("[{}]", rowids.join(","));

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT rowid, bm25(chunks_fts) AS score
            FROM chunks_fts
            WHERE chunks_fts MATCH ?1
              AND rowid IN (SELECT value FROM json_each(?2))
            ORDER BY score ASC, rowid ASC
            LIMIT ?3
            "#,
        )?;

        let chunks = self.store.chunks();
        let rows = stmt.query_map(params![match_expr, rowids, k as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (rowid, bm25) = row?;
            let Some(chunk) = usize::try_from(rowid - 1).ok().and_then(|i| chunks.get(i)) else {
                continue;
            };
            results.push(RankedResult {
                chunk_id: chunk.id.clone(),
                // FTS5 bm25()는 음수일수록 관련도가 높음
                score: -bm25,
                rank: results.len() + 1,
            });
        }

        tracing::debug!(
            "Lexical search: match={:?}, candidates={}, matched={}",
            match_expr,
            candidates.len(),
            results.len()
        );

        Ok(results)
    }
}

/// 저장소 위치 → FTS5 rowid (1부터)
fn rowid(position: usize) -> i64 {
    position as i64 + 1
}

/// 쿼리 → FTS5 MATCH 식
///
/// 토큰은 영숫자만 남으므로 큰따옴표로 감싸면 FTS5 연산자로 해석되지 않습니다.
/// 용어는 OR로 결합해 하나라도 겹치는 청크를 후보로 삼습니다.
fn fts5_match_expr(query: &str) -> String {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// 토큰화: 소문자화, 영숫자 외 문자로 분리, 불용어 제거
///
/// `8%` 같은 수치는 `8`로 남습니다.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
