//! 하이브리드 검색 - BM25 + 벡터 RRF 통합
//!
//! 메타데이터 필터로 후보를 제한한 뒤 두 검색기를 동시에 실행하고
//! RRF로 순위를 통합합니다. 한쪽 검색기가 실패하면 다른 쪽 결과로
//! 대체하지 않고 질의 전체를 실패시킵니다.
//!
//! 후보 중 최고 시맨틱 유사도가 `min_similarity` 미만이면 렉시컬 일치가
//! 있더라도 융합 결과를 비웁니다 (관련 없는 질의 → 근거 없음).

use std::sync::Arc;

use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

use super::filter::MetadataFilter;
use super::fusion::RrfFusion;
use super::lexical::LexicalRetriever;
use super::store::ChunkStore;
use super::vector::SemanticRetriever;
use super::{FusedResult, RankedResult};

// ============================================================================
// Types
// ============================================================================

/// 하이브리드 검색 결과 (단계별 중간 결과 포함)
#[derive(Debug, Clone, Default)]
pub struct HybridSearch {
    /// 필터 적용 후 후보 수
    pub candidate_count: usize,
    pub lexical: Vec<RankedResult>,
    pub semantic: Vec<RankedResult>,
    pub fused: Vec<FusedResult>,
    /// 하한 적용 전 최고 시맨틱 유사도
    pub best_similarity: Option<f32>,
    /// 최고 유사도가 하한 미만이라 융합 결과를 비웠는지
    pub below_relevance_floor: bool,
    /// 융합 결과가 한 검색기에서만 나왔는지
    pub degraded: bool,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 불변 `ChunkStore`를 공유하므로 여러 질의가 동시에 사용해도 안전합니다.
pub struct HybridRetriever {
    store: Arc<ChunkStore>,
    lexical: LexicalRetriever,
    semantic: SemanticRetriever,
    fusion: RrfFusion,
    retriever_k: usize,
}

impl HybridRetriever {
    /// 새 하이브리드 검색기 생성
    ///
    /// # Arguments
    /// * `store` - 코퍼스 세대
    /// * `embedder` - 코퍼스 임베딩과 같은 모델의 임베딩 프로바이더
    /// * `config` - 파이프라인 설정
    ///
    /// # Errors
    /// 렉시컬 인덱스 생성 실패 시 `LexicalIndex`
    pub fn new(
        store: Arc<ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: &RagConfig,
    ) -> Result<Self> {
        Ok(Self {
            lexical: LexicalRetriever::build(Arc::clone(&store))?,
            semantic: SemanticRetriever::new(embedder, config.embed_timeout(), config.min_similarity),
            fusion: RrfFusion::new(config.rrf_k),
            retriever_k: config.retriever_k,
            store,
        })
    }

    /// 내부 스토어 접근
    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// 하이브리드 검색 (RRF 통합)
    ///
    /// # Arguments
    /// * `query` - 검색 쿼리
    /// * `filter` - 메타데이터 필터 (검색 전 적용)
    /// * `limit` - 융합 결과 최대 수
    ///
    /// # Errors
    /// - 저장소가 비어 있으면 `EmptyCorpus`
    /// - 임베딩 실패 시 `EmbeddingUnavailable`
    ///
    /// 필터가 모든 청크를 제외하면 에러가 아니라 빈 결과를 반환합니다.
    pub async fn search(
        &self,
        query: &str,
        filter: &MetadataFilter,
        limit: usize,
    ) -> Result<HybridSearch> {
        if self.store.is_empty() {
            return Err(RagError::EmptyCorpus);
        }

        let candidates = filter.restrict(self.store.chunks());
        if candidates.is_empty() {
            tracing::debug!("Metadata filter excluded every chunk: {:?}", filter);
            return Ok(HybridSearch::default());
        }

        // 시맨틱 요청이 대기하는 동안 렉시컬 스코어링을 진행
        let (semantic, lexical) = futures::join!(
            self.semantic.search(query, &candidates, self.retriever_k),
            async { self.lexical.search(query, &candidates, self.retriever_k) }
        );
        let semantic = semantic?;
        let lexical = lexical?;

        let floor = self.semantic.min_similarity();
        if semantic.best_similarity.map_or(true, |best| best < floor) {
            tracing::info!(
                "Best semantic similarity {:?} below floor {}; query treated as unrelated",
                semantic.best_similarity,
                floor
            );
            return Ok(HybridSearch {
                candidate_count: candidates.len(),
                lexical,
                semantic: semantic.ranked,
                fused: Vec::new(),
                best_similarity: semantic.best_similarity,
                below_relevance_floor: true,
                degraded: false,
            });
        }

        let semantic_ranked = semantic.ranked;
        let fused = self.fusion.fuse(&lexical, &semantic_ranked, limit);

        let degraded = lexical.is_empty() != semantic_ranked.is_empty();
        if degraded {
            tracing::warn!(
                "Degraded retrieval: fused ranking comes from {} results only",
                if lexical.is_empty() { "semantic" } else { "lexical" }
            );
        }

        tracing::debug!(
            "Hybrid search: candidates={}, lexical={}, semantic={}, fused={}",
            candidates.len(),
            lexical.len(),
            semantic_ranked.len(),
            fused.len()
        );

        Ok(HybridSearch {
            candidate_count: candidates.len(),
            lexical,
            semantic: semantic_ranked,
            fused,
            best_similarity: semantic.best_similarity,
            below_relevance_floor: false,
            degraded,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
