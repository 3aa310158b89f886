//! grounded-rag - 근거 기반 하이브리드 RAG 질의응답
//!
//! BM25 키워드 검색과 임베딩 벡터 검색을 RRF로 결합하고,
//! 검색된 근거만으로 답변하며 근거가 없으면 "모른다"고 답합니다.
//! 사용자 질의와 문서 청크 모두 프롬프트 인젝션 검사를 거칩니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod gemini;
pub mod generation;
pub mod guardrail;
pub mod knowledge;
pub mod qa;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports
pub use config::{get_data_dir, RagConfig};
pub use embedding::{create_embedder, EmbeddingProvider, GeminiEmbedding, HashingEmbedding};
pub use error::{RagError, Result};
pub use gemini::{get_api_key, has_api_key};
pub use generation::{GeminiGeneration, GenerationProvider};
pub use guardrail::{GuardrailInspector, GuardrailReason, GuardrailVerdict};
pub use knowledge::{
    Chunk, ChunkId, ChunkMetadata, ChunkStore, EvidenceSet, FusedResult, HybridRetriever,
    MetadataFilter, RankedResult, SearchMethod,
};
pub use qa::{AnswerResult, Citation, QaPipeline, QueryRecord, QueryRecorder, RefusalReason};
