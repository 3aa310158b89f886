//! QA 모듈 - 근거 기반 답변 파이프라인
//!
//! - Prompt: 근거 + 메모리 + 질의로 생성 요청 조립 (길이 예산 적용)
//! - Answer: 생성 호출, 재시도, 거절 판정, 인용
//! - Memory: 세션별 최근 대화 턴
//! - Record: 질의당 관측 레코드 (tracing, SQLite)
//! - Pipeline: `ask` 진입점

mod answer;
mod memory;
mod pipeline;
mod prompt;
mod record;

// Re-exports
pub use answer::{
    is_refusal, AnswerResult, AnswerState, Citation, GroundedAnswerer, RefusalReason,
    GUARDRAIL_REFUSAL,
};
pub use memory::{ConversationMemory, ConversationTurn, SessionStore};
pub use pipeline::QaPipeline;
pub use prompt::{
    evidence_header, GenerationRequest, PromptAssembler, CANONICAL_REFUSAL, INSTRUCTION_BLOCK,
};
pub use record::{
    QueryLogStats, QueryRecord, QueryRecorder, SqliteQueryLog, TracingRecorder,
    QUERY_LOG_FILE_NAME,
};
