//! 생성 모듈 - LLM 답변 생성 프로바이더
//!
//! `GroundedAnswerer`가 질의당 한 번 호출하는 외부 능력입니다.
//! 재시도는 호출자가 담당하므로, 프로바이더는 실패를 일시 장애
//! (`GenerationUnavailable`)와 영구 실패(`GenerationFailed`)로 분류만 합니다.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{RagError, Result};
use crate::gemini::{self, RateLimiter, GEMINI_API_BASE};
use crate::qa::GenerationRequest;

// ============================================================================
// GenerationProvider Trait
// ============================================================================

/// 생성 프로바이더 트레이트
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// 프롬프트로 답변 텍스트 생성
    ///
    /// # Errors
    /// - `GenerationUnavailable`: 타임아웃, rate limit, 서버 에러 (재시도 가능)
    /// - `GenerationFailed`: 잘못된 요청/응답 (재시도 불가)
    async fn complete(&self, request: &GenerationRequest) -> Result<String>;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Generation
// ============================================================================

/// 기본 생성 모델
pub const DEFAULT_GENERATION_MODEL: &str = "gemini-2.0-flash";

/// Rate Limiter 설정
const RATE_LIMIT_RPM: u32 = 15;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Google Gemini 생성 구현체
///
/// 결정적인 답변을 위해 temperature 0을 사용합니다.
/// source: https://ai.google.dev/api/generate-content
#[derive(Debug)]
pub struct GeminiGeneration {
    api_key: String,
    model: String,
    client: reqwest::Client,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl GeminiGeneration {
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `model` - 모델 이름 (예: "gemini-2.0-flash")
    pub fn new(api_key: String, model: String) -> anyhow::Result<Self> {
        // 호출 타임아웃은 GroundedAnswerer가 적용하므로 여기서는 연결 타임아웃만 둠
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            api_key,
            model,
            client,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
                Duration::ZERO,
            ))),
        })
    }

    /// 환경변수에서 API 키와 모델(`GEMINI_GENERATION_MODEL`)을 읽어 생성
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = gemini::get_api_key()?;
        let model = gemini::model_from_env("GEMINI_GENERATION_MODEL", DEFAULT_GENERATION_MODEL);
        Self::new(api_key, model)
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", GEMINI_API_BASE, self.model)
    }

    fn build_body(request: &GenerationRequest) -> GenerateRequest {
        GenerateRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part {
                    text: request.system.clone(),
                }],
            },
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        }
    }
}

/// Gemini generateContent 요청 본문
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

/// Gemini generateContent 응답
#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// 응답 본문에서 답변 텍스트 추출
fn parse_response(body: &str) -> Result<String> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| RagError::GenerationFailed(format!("Malformed response: {}", e)))?;

    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(RagError::GenerationFailed(
            "Response contained no text".to_string(),
        ));
    }
    Ok(text)
}

#[async_trait]
impl GenerationProvider for GeminiGeneration {
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        self.rate_limiter.lock().await.acquire().await;

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| RagError::GenerationUnavailable(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagError::GenerationUnavailable(format!("Failed to read body: {}", e)))?;

        if status.is_success() {
            return parse_response(&body);
        }

        let message = gemini::describe_error(status, &body);
        if gemini::is_retryable_status(status) {
            Err(RagError::GenerationUnavailable(message))
        } else {
            Err(RagError::GenerationFailed(message))
        }
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================
