//! Knowledge 모듈 - 하이브리드 검색
//!
//! - Store: 불변 청크 저장소 (코퍼스 세대 단위)
//! - Filter: 메타데이터 사전 필터
//! - Lexical: SQLite FTS5 BM25 키워드 검색
//! - Vector: 임베딩 코사인 유사도 검색
//! - Fusion: RRF 알고리즘으로 두 검색 결과 통합
//! - Evidence: 최종 Top-K 근거 선택

mod evidence;
mod filter;
mod fusion;
mod hybrid;
mod lexical;
mod store;
mod vector;

use serde::Serialize;

// Re-exports
pub use evidence::{Evidence, EvidenceSelector, EvidenceSet};
pub use filter::MetadataFilter;
pub use fusion::{RrfFusion, DEFAULT_RRF_K};
pub use hybrid::{HybridRetriever, HybridSearch};
pub use lexical::{tokenize, LexicalRetriever, BM25_B, BM25_K1};
pub use store::{Chunk, ChunkId, ChunkMetadata, ChunkStore, CorpusStats, CORPUS_FILE_NAME};
pub use vector::{cosine_similarity, SemanticHits, SemanticRetriever};

// ============================================================================
// Types
// ============================================================================

/// 검색기 또는 융합 단계의 순위 결과
///
/// 검색기마다 점수 스케일이 다르므로 서로 다른 검색기의 점수는 비교하지 않습니다.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub chunk_id: ChunkId,
    pub score: f64,
    /// 1부터 시작
    pub rank: usize,
}

/// 검색 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    /// BM25 키워드 검색만
    Lexical,
    /// 벡터 검색만
    Semantic,
    /// 양쪽 모두 (RRF 통합)
    Hybrid,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMethod::Lexical => "lexical",
            SearchMethod::Semantic => "semantic",
            SearchMethod::Hybrid => "hybrid",
        }
    }
}

/// RRF 융합 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    /// 융합 점수와 융합 순위
    pub result: RankedResult,
    /// 개별 검색기 순위 중 가장 좋은 값
    pub best_rank: usize,
    pub method: SearchMethod,
}
