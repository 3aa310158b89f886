//! 근거 기반 답변 - 생성 호출, 거절 판정, 인용 부착
//!
//! 인용은 모델 출력에서 추출하지 않고, 프롬프트에 실제로 제시된 근거에서
//! 제시 순서대로 결정적으로 만듭니다.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::generation::GenerationProvider;
use crate::knowledge::ChunkId;

use super::prompt::{GenerationRequest, CANONICAL_REFUSAL};

/// 가드레일 차단 시 사용자에게 보여줄 답변
pub const GUARDRAIL_REFUSAL: &str =
    "I can't help with that request. Please ask a question about the indexed documents.";

// ============================================================================
// Types
// ============================================================================

/// 거절 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// 근거 없음 (임계값 미달, 필터로 전부 제외 등)
    NoEvidence,
    /// 모델이 정형 거절 문장으로 답함
    ModelDeclined,
    /// 질의가 인젝션으로 탐지됨
    GuardrailBlocked,
}

impl RefusalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefusalReason::NoEvidence => "no_evidence",
            RefusalReason::ModelDeclined => "model_declined",
            RefusalReason::GuardrailBlocked => "guardrail_blocked",
        }
    }
}

/// 답변 처리 상태
///
/// `NotStarted`에서 시작해 세 종료 상태 중 하나로만 전이합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerState {
    NotStarted,
    GuardrailBlocked,
    Answered,
    Refused,
}

/// 인용
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
    pub document_name: String,
    pub page: Option<u32>,
    pub chunk_id: ChunkId,
}

/// 최종 답변
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResult {
    pub text: String,
    /// `refused`이면 항상 비어 있음
    pub citations: Vec<Citation>,
    pub refused: bool,
    pub refusal_reason: Option<RefusalReason>,
}

impl AnswerResult {
    /// 거절 답변 생성
    pub fn refusal(reason: RefusalReason) -> Self {
        let text = match reason {
            RefusalReason::GuardrailBlocked => GUARDRAIL_REFUSAL,
            RefusalReason::NoEvidence | RefusalReason::ModelDeclined => CANONICAL_REFUSAL,
        };
        Self {
            text: text.to_string(),
            citations: Vec::new(),
            refused: true,
            refusal_reason: Some(reason),
        }
    }

    /// 종료 상태
    pub fn state(&self) -> AnswerState {
        match self.refusal_reason {
            Some(RefusalReason::GuardrailBlocked) => AnswerState::GuardrailBlocked,
            Some(_) => AnswerState::Refused,
            None => AnswerState::Answered,
        }
    }
}

/// 모델 출력이 정형 거절인지 판정
///
/// 정형 거절 문장을 포함하거나, 마지막 문장이 "I don't know" 그 자체일 때만
/// 거절로 봅니다. "I don't know the exact date, but ..."처럼 답이 이어지면 거절이 아닙니다.
pub fn is_refusal(text: &str) -> bool {
    let normalized = text.trim().replace('\u{2019}', "'").to_lowercase();
    if normalized.contains(&CANONICAL_REFUSAL.to_lowercase()) {
        return true;
    }
    normalized
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .last()
        == Some("i don't know")
}

// ============================================================================
// GroundedAnswerer
// ============================================================================

/// 근거 기반 답변기 (질의당 생성 호출 1회, 일시 장애만 재시도)
pub struct GroundedAnswerer {
    generator: Arc<dyn GenerationProvider>,
    timeout: Duration,
    max_retries: u32,
    initial_backoff: Duration,
}

impl GroundedAnswerer {
    /// # Arguments
    /// * `generator` - 생성 프로바이더
    /// * `timeout` - 호출당 타임아웃
    /// * `max_retries` - 일시 장애 최대 재시도 횟수
    /// * `initial_backoff` - 첫 재시도 대기 시간 (이후 2배씩 증가)
    pub fn new(
        generator: Arc<dyn GenerationProvider>,
        timeout: Duration,
        max_retries: u32,
        initial_backoff: Duration,
    ) -> Self {
        Self {
            generator,
            timeout,
            max_retries,
            initial_backoff,
        }
    }

    pub fn from_config(generator: Arc<dyn GenerationProvider>, config: &RagConfig) -> Self {
        Self::new(
            generator,
            config.generation_timeout(),
            config.max_retries,
            config.initial_backoff(),
        )
    }

    /// 답변 생성
    ///
    /// # Errors
    /// - 재시도 소진 시 마지막 `GenerationUnavailable`
    /// - `GenerationFailed`는 재시도 없이 즉시 반환
    pub async fn answer(&self, request: &GenerationRequest) -> Result<AnswerResult> {
        if request.presented.is_empty() {
            tracing::debug!("No evidence presented; refusing without generation");
            return Ok(AnswerResult::refusal(RefusalReason::NoEvidence));
        }

        let raw = self.complete_with_retry(request).await?;

        if is_refusal(&raw) {
            tracing::debug!("Model declined to answer from the provided context");
            return Ok(AnswerResult::refusal(RefusalReason::ModelDeclined));
        }

        let citations = request
            .presented
            .iter()
            .map(|e| Citation {
                document_name: e.chunk.metadata.document_name.clone(),
                page: e.chunk.metadata.page,
                chunk_id: e.chunk.id.clone(),
            })
            .collect();

        Ok(AnswerResult {
            text: raw.trim().to_string(),
            citations,
            refused: false,
            refusal_reason: None,
        })
    }

    async fn complete_with_retry(&self, request: &GenerationRequest) -> Result<String> {
        let mut backoff = self.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, self.generator.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(RagError::GenerationUnavailable(format!(
                    "{} timed out after {:?}",
                    self.generator.name(),
                    self.timeout
                ))),
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Generation attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt,
                        self.max_retries + 1,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
