//! 시맨틱 검색 - 임베딩 코사인 유사도
//!
//! 쿼리를 임베딩한 뒤 후보 청크의 (인덱스 빌드 시 계산된) 임베딩과 비교합니다.
//! 임베딩 실패는 조용히 무시하지 않고 `EmbeddingUnavailable`로 올립니다.

use std::sync::Arc;
use std::time::Duration;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

use super::store::Chunk;
use super::RankedResult;

// ============================================================================
// Types
// ============================================================================

/// 시맨틱 검색 결과
#[derive(Debug, Clone, Default)]
pub struct SemanticHits {
    /// 유사도 하한을 통과한 결과 (내림차순)
    pub ranked: Vec<RankedResult>,
    /// 하한 적용 전 후보 중 최고 유사도
    pub best_similarity: Option<f32>,
}

// ============================================================================
// SemanticRetriever
// ============================================================================

/// 임베딩 기반 시맨틱 검색기
#[derive(Clone)]
pub struct SemanticRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    min_similarity: f32,
}

impl SemanticRetriever {
    /// # Arguments
    /// * `embedder` - 코퍼스 빌드에 사용한 것과 같은 임베딩 프로바이더
    /// * `timeout` - 임베딩 호출 타임아웃
    /// * `min_similarity` - 이 값 미만의 후보는 결과에서 제외
    ///   (최고 유사도가 이 값 미만이면 질의 전체가 관련 없음으로 판정됨)
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, timeout: Duration, min_similarity: f32) -> Self {
        Self {
            embedder,
            timeout,
            min_similarity,
        }
    }

    /// 쿼리 임베딩 (타임아웃 적용)
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        match tokio::time::timeout(self.timeout, self.embedder.embed(query)).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(RagError::EmbeddingUnavailable(format!(
                "{}: {:#}",
                self.embedder.name(),
                e
            ))),
            Err(_) => Err(RagError::EmbeddingUnavailable(format!(
                "{}: timed out after {:?}",
                self.embedder.name(),
                self.timeout
            ))),
        }
    }

    /// 시맨틱 검색
    ///
    /// # Arguments
    /// * `query` - 검색 쿼리
    /// * `candidates` - 후보 청크
    /// * `k` - 최대 결과 수
    ///
    /// # Errors
    /// - 후보가 비어 있으면 `EmptyCorpus`
    /// - 임베딩 실패/타임아웃/차원 불일치 시 `EmbeddingUnavailable`
    pub async fn search(
        &self,
        query: &str,
        candidates: &[Arc<Chunk>],
        k: usize,
    ) -> Result<SemanticHits> {
        if candidates.is_empty() {
            return Err(RagError::EmptyCorpus);
        }

        let query_embedding = self.embed_query(query).await?;
        let expected = candidates[0].embedding.len();
        if query_embedding.len() != expected {
            return Err(RagError::EmbeddingUnavailable(format!(
                "query embedding dimension {} does not match corpus dimension {}",
                query_embedding.len(),
                expected
            )));
        }

        let all: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, cosine_similarity(&query_embedding, &c.embedding)))
            .collect();
        let best_similarity = all.iter().map(|(_, sim)| *sim).reduce(f32::max);

        let mut scored: Vec<(usize, f32)> = all
            .into_iter()
            .filter(|(_, sim)| *sim >= self.min_similarity)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        tracing::debug!(
            "Semantic search: {} candidates, {} above similarity floor {}, best={:?}",
            candidates.len(),
            scored.len(),
            self.min_similarity,
            best_similarity
        );

        let ranked = scored
            .into_iter()
            .enumerate()
            .map(|(rank, (i, similarity))| RankedResult {
                chunk_id: candidates[i].id.clone(),
                score: similarity as f64,
                rank: rank + 1,
            })
            .collect();

        Ok(SemanticHits {
            ranked,
            best_similarity,
        })
    }

    /// 최소 유사도
    pub fn min_similarity(&self) -> f32 {
        self.min_similarity
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 두 벡터 간의 코사인 유사도를 계산합니다.
/// 결과는 -1.0 ~ 1.0 범위입니다.
///
/// # Arguments
/// * `a` - 첫 번째 벡터
/// * `b` - 두 번째 벡터
///
/// # Returns
/// 코사인 유사도 (-1.0 ~ 1.0), 길이가 다르거나 영벡터면 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
