//! RRF (Reciprocal Rank Fusion)
//!
//! 두 검색 결과를 순위 기반으로 통합합니다.
//! BM25와 코사인 유사도는 스케일이 달라 점수를 직접 비교할 수 없으므로 순위만 사용합니다.
//! ref: https://www.elastic.co/blog/hybrid-search-rrf
//!
//! RRF Score = Σ 1 / (k + rank), rank는 1부터 시작

use std::collections::{HashMap, HashSet};

use super::store::ChunkId;
use super::{FusedResult, RankedResult, SearchMethod};

/// 기본 스무딩 상수 (높을수록 하위 순위와의 차이가 줄어듦)
pub const DEFAULT_RRF_K: f64 = 60.0;

/// RRF 통합기 (순수 함수)
#[derive(Debug, Clone, Copy)]
pub struct RrfFusion {
    k: f64,
}

impl Default for RrfFusion {
    fn default() -> Self {
        Self::new(DEFAULT_RRF_K)
    }
}

/// 융합 중간 상태
struct Accumulator {
    score: f64,
    best_rank: usize,
    lexical: bool,
    semantic: bool,
}

impl RrfFusion {
    pub fn new(k: f64) -> Self {
        Self { k }
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    /// 렉시컬 + 시맨틱 결과 통합
    ///
    /// # Arguments
    /// * `lexical` - 렉시컬 검색 결과 (순서 = 순위)
    /// * `semantic` - 시맨틱 검색 결과 (순서 = 순위)
    /// * `limit` - 최대 결과 수
    ///
    /// # Returns
    /// 융합 점수 내림차순, 동점이면 최고 개별 순위 오름차순, 그다음 청크 ID 오름차순
    pub fn fuse(
        &self,
        lexical: &[RankedResult],
        semantic: &[RankedResult],
        limit: usize,
    ) -> Vec<FusedResult> {
        let mut scores: HashMap<&ChunkId, Accumulator> = HashMap::new();

        for (list, method) in [(lexical, SearchMethod::Lexical), (semantic, SearchMethod::Semantic)] {
            // 한 목록 안의 중복은 첫 위치만 반영
            let mut seen: HashSet<&ChunkId> = HashSet::new();

            for (position, result) in list.iter().enumerate() {
                if !seen.insert(&result.chunk_id) {
                    continue;
                }
                let rank = position + 1;
                let entry = scores.entry(&result.chunk_id).or_insert(Accumulator {
                    score: 0.0,
                    best_rank: usize::MAX,
                    lexical: false,
                    semantic: false,
                });
                entry.score += 1.0 / (self.k + rank as f64);
                entry.best_rank = entry.best_rank.min(rank);
                match method {
                    SearchMethod::Lexical => entry.lexical = true,
                    _ => entry.semantic = true,
                }
            }
        }

        let mut results: Vec<(&ChunkId, Accumulator)> = scores.into_iter().collect();

        results.sort_by(|a, b| {
            b.1.score
                .partial_cmp(&a.1.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.best_rank.cmp(&b.1.best_rank))
                .then_with(|| a.0.cmp(b.0))
        });
        results.truncate(limit);

        results
            .into_iter()
            .enumerate()
            .map(|(i, (chunk_id, acc))| {
                let method = match (acc.lexical, acc.semantic) {
                    (true, true) => SearchMethod::Hybrid,
                    (true, false) => SearchMethod::Lexical,
                    (false, _) => SearchMethod::Semantic,
                };

                FusedResult {
                    result: RankedResult {
                        chunk_id: chunk_id.clone(),
                        score: acc.score,
                        rank: i + 1,
                    },
                    best_rank: acc.best_rank,
                    method,
                }
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
