//! 에러 타입
//!
//! 검색/생성 파이프라인의 실패 분류입니다.
//! 가드레일 차단은 에러가 아니라 `AnswerResult`의 거절 사유로 표현됩니다.

use thiserror::Error;

/// 사용자에게 보여줄 일시 장애 메시지
pub const TEMPORARILY_UNAVAILABLE: &str =
    "I'm temporarily unable to answer. Please try again shortly.";

/// RAG 파이프라인 에러
#[derive(Debug, Error)]
pub enum RagError {
    /// 검색 대상 청크가 없음
    #[error("Corpus is empty")]
    EmptyCorpus,

    /// 임베딩 프로바이더 실패 (타임아웃 포함)
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// 생성 프로바이더 일시 장애 (타임아웃, rate limit) - 재시도 대상
    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    /// 생성 프로바이더 영구 실패 (잘못된 응답 등)
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// 호출자가 질의를 취소함
    #[error("Query cancelled")]
    Cancelled,

    /// 코퍼스 불변식 위반 (중복 ID, 임베딩 차원 불일치 등)
    #[error("Invalid corpus: {0}")]
    InvalidCorpus(String),

    /// 설정 검증 실패
    #[error("Configuration error: {0}")]
    Config(String),

    /// 렉시컬 인덱스(SQLite FTS5) 실패
    #[error("Lexical index error: {0}")]
    LexicalIndex(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// 재시도 가능한 일시 장애인지 여부
    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::GenerationUnavailable(_))
    }

    /// 사용자 노출용 메시지
    ///
    /// 내부 원인(프로바이더 에러 본문 등)은 노출하지 않습니다.
    pub fn user_message(&self) -> &'static str {
        match self {
            RagError::EmptyCorpus
            | RagError::EmbeddingUnavailable(_)
            | RagError::GenerationUnavailable(_)
            | RagError::GenerationFailed(_)
            | RagError::LexicalIndex(_) => TEMPORARILY_UNAVAILABLE,
            RagError::Cancelled => "The request was cancelled.",
            RagError::InvalidCorpus(_) | RagError::Config(_) | RagError::Io(_) => {
                "The question-answering service is misconfigured."
            }
        }
    }
}

/// RAG 결과 타입
pub type Result<T> = std::result::Result<T, RagError>;
