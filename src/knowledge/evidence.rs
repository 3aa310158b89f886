//! 근거 선택 - 융합 결과에서 최종 Top-K 청크 선택
//!
//! 최상위 융합 점수가 임계값 미만이면 빈 근거 집합을 반환합니다.
//! 이것이 "모른다" 응답 경로의 1차 장치입니다.

use std::collections::HashSet;
use std::sync::Arc;

use super::store::{Chunk, ChunkId, ChunkStore};
use super::{FusedResult, SearchMethod};

// ============================================================================
// Types
// ============================================================================

/// 근거 청크 하나
#[derive(Debug, Clone)]
pub struct Evidence {
    pub chunk: Arc<Chunk>,
    /// 융합 순위 (1부터)
    pub fused_rank: usize,
    pub fused_score: f64,
    /// 어떤 검색기에서 왔는지
    pub method: SearchMethod,
}

/// 질의 하나에 대한 근거 집합 (생성 후 불변)
#[derive(Debug, Clone, Default)]
pub struct EvidenceSet {
    items: Vec<Evidence>,
}

impl EvidenceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Evidence] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.items.iter().map(|e| e.chunk.id.clone()).collect()
    }

    pub fn fused_scores(&self) -> Vec<f64> {
        self.items.iter().map(|e| e.fused_score).collect()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.items.iter().any(|e| &e.chunk.id == id)
    }
}

// ============================================================================
// EvidenceSelector
// ============================================================================

/// 근거 선택기
#[derive(Debug, Clone, Copy)]
pub struct EvidenceSelector {
    min_fused_score: f64,
}

impl EvidenceSelector {
    /// # Arguments
    /// * `min_fused_score` - 최상위 융합 점수 하한 (코퍼스에 맞춰 보정)
    pub fn new(min_fused_score: f64) -> Self {
        Self { min_fused_score }
    }

    /// 최종 근거 선택
    ///
    /// ID 중복 제거 → 임계값 검사 → `k`개로 자르기.
    /// 저장소에 없는 ID는 건너뜁니다.
    pub fn select(&self, fused: &[FusedResult], store: &ChunkStore, k: usize) -> EvidenceSet {
        let mut seen: HashSet<&ChunkId> = HashSet::new();
        let unique: Vec<&FusedResult> = fused
            .iter()
            .filter(|f| seen.insert(&f.result.chunk_id))
            .collect();

        let top_score = unique.first().map(|f| f.result.score).unwrap_or(0.0);
        if unique.is_empty() || top_score < self.min_fused_score {
            tracing::debug!(
                "Evidence rejected: top fused score {:.5} below threshold {:.5}",
                top_score,
                self.min_fused_score
            );
            return EvidenceSet::empty();
        }

        let items: Vec<Evidence> = unique
            .into_iter()
            .filter_map(|f| {
                let chunk = store.get(&f.result.chunk_id)?;
                Some(Evidence {
                    chunk: Arc::clone(chunk),
                    fused_rank: f.result.rank,
                    fused_score: f.result.score,
                    method: f.method,
                })
            })
            .take(k)
            .collect();

        EvidenceSet { items }
    }
}

// ============================================================================
// Tests
// ============================================================================
