//! 임베딩 모듈 - 텍스트 벡터화 프로바이더
//!
//! 시맨틱 검색이 쿼리를 벡터로 바꿀 때 사용하는 외부 능력(capability)입니다.
//! 코퍼스 임베딩은 외부 인덱서가 미리 계산하므로, 질의 시점에는
//! 반드시 같은 모델/차원의 프로바이더를 사용해야 합니다.
//!
//! - `GeminiEmbedding`: Gemini API (gemini-embedding-001)
//! - `HashingEmbedding`: 오프라인 결정적 임베딩 (feature hashing)
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env()?;
//! let embedding = embedder.embed("What is the minimum capital requirement?").await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::gemini::{self, RateLimiter, GEMINI_API_BASE};
use crate::knowledge::tokenize;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 텍스트를 벡터로 변환하는 인터페이스입니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// 기본 임베딩 모델 (MRL 지원)
pub const DEFAULT_EMBEDDING_MODEL: &str = "gemini-embedding-001";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이 (1000ms = 60 RPM 준수)
const MIN_DELAY: Duration = Duration::from_millis(1000);
/// 429/5xx 에러 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 2000;

/// Google Gemini 임베딩 구현체
///
/// 질의 임베딩에는 `RETRIEVAL_QUERY` 태스크 타입을 사용합니다.
/// source: https://ai.google.dev/gemini-api/docs/embeddings
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    model: String,
    client: reqwest::Client,
    dimension: usize,
    task_type: &'static str,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl GeminiEmbedding {
    /// 차원을 지정하여 생성
    ///
    /// # Arguments
    /// * `api_key` - Google AI API 키
    /// * `dimension` - 임베딩 차원 (768, 1536, 3072 중 선택, 코퍼스와 동일해야 함)
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if ![768, 1536, 3072].contains(&dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                dimension
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            model: gemini::model_from_env("GEMINI_EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            client,
            dimension,
            task_type: "RETRIEVAL_QUERY",
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
                MIN_DELAY,
            ))),
        })
    }

    /// 환경변수에서 API 키를 읽어 생성
    ///
    /// 우선순위: GEMINI_API_KEY > GOOGLE_AI_API_KEY
    pub fn from_env_with_dimension(dimension: usize) -> Result<Self> {
        let api_key = gemini::get_api_key()?;
        Self::with_dimension(api_key, dimension)
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:embedContent", GEMINI_API_BASE, self.model)
    }
}

/// Gemini API 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: String,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        // 빈 텍스트는 영벡터 (어떤 청크와도 유사도 0)
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: format!("models/{}", self.model),
            content: EmbedContent {
                parts: vec![EmbedPart {
                    text: text.to_string(),
                }],
            },
            task_type: self.task_type.to_string(),
            output_dimensionality: self.dimension,
        };

        let mut last_error: Option<anyhow::Error> = None;

        // 재시도 루프 (429/5xx/네트워크 에러 시 지수 백오프)
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt - 1));
                tracing::warn!(
                    "Embedding request failed, retrying in {:?} (attempt {}/{})",
                    backoff,
                    attempt,
                    MAX_RETRIES
                );
                tokio::time::sleep(backoff).await;
            }

            // Rate limiting (매 시도마다)
            self.rate_limiter.lock().await.acquire().await;

            // API 키는 URL이 아닌 헤더로 전송
            let response = match self
                .client
                .post(self.endpoint())
                .header("x-goog-api-key", &self.api_key)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send embedding request: {}", e));
                    continue;
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .context("Failed to read response body")?;

            if status.is_success() {
                let parsed: EmbedResponse =
                    serde_json::from_str(&body).context("Failed to parse embedding response")?;
                if parsed.embedding.values.len() != self.dimension {
                    anyhow::bail!(
                        "Gemini returned {} dimensions, expected {}",
                        parsed.embedding.values.len(),
                        self.dimension
                    );
                }
                return Ok(parsed.embedding.values);
            }

            if gemini::is_retryable_status(status) {
                last_error = Some(anyhow::anyhow!(gemini::describe_error(status, &body)));
                continue;
            }

            // 다른 에러 - 즉시 실패
            anyhow::bail!(gemini::describe_error(status, &body));
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("Embedding failed after {} retries", MAX_RETRIES)))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Hashing Embedding (offline)
// ============================================================================

/// 오프라인 결정적 임베딩 (feature hashing)
///
/// 토큰마다 FNV-1a 해시로 차원과 부호를 정하고 L2 정규화합니다.
/// 네트워크 없이 동작하므로 오프라인 코퍼스와 테스트에 사용합니다.
/// 같은 차원으로 빌드한 코퍼스에서만 의미가 있습니다.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// 동기 임베딩
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in tokenize(text) {
            let hash = fnv1a(token.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// FNV-1a 64bit
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(PRIME))
}

// ============================================================================
// Factory Function
// ============================================================================

/// 임베딩 프로바이더 생성
///
/// # Arguments
/// * `offline` - true면 `HashingEmbedding`, 아니면 Gemini API
/// * `dimension` - 코퍼스 임베딩 차원
pub fn create_embedder(offline: bool, dimension: usize) -> Result<Arc<dyn EmbeddingProvider>> {
    if offline {
        tracing::info!("Using offline hashing embedding (dimension: {})", dimension);
        return Ok(Arc::new(HashingEmbedding::new(dimension)));
    }

    if !gemini::has_api_key() {
        anyhow::bail!(
            "GEMINI_API_KEY or GOOGLE_AI_API_KEY not set.\n\
             Set: export GEMINI_API_KEY=your-api-key\n\
             Get your API key at: https://aistudio.google.com/app/apikey"
        );
    }

    let embedder = GeminiEmbedding::from_env_with_dimension(dimension)?;
    tracing::info!(
        "Using Gemini API embedding {} (dimension: {})",
        embedder.model,
        embedder.dimension
    );
    Ok(Arc::new(embedder))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::cosine_similarity;

    #[test]
    fn test_invalid_dimension() {
        let result = GeminiEmbedding::with_dimension("fake_key".to_string(), 999);
        let err = result.err();
        assert!(err
            .as_ref()
            .map(|e| e.to_string().contains("Invalid dimension"))
            .unwrap_or(false));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in [768, 1536, 3072] {
            let result = GeminiEmbedding::with_dimension("fake_key".to_string(), dim);
            assert!(result.is_ok());
        }
    }

    #[test]
    fn test_gemini_endpoint_uses_model() {
        let embedder = GeminiEmbedding::with_dimension("fake_key".to_string(), 768).unwrap();
        assert!(embedder.endpoint().ends_with(":embedContent"));
        assert!(embedder.endpoint().contains(&embedder.model));
    }

    #[test]
    fn test_hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedding::new(256);
        let a = embedder.embed_text("Minimum capital requirement");
        let b = embedder.embed_text("minimum CAPITAL requirement!");
        assert_eq!(a, b);

        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hashing_related_text_is_closer() {
        let embedder = HashingEmbedding::new(1024);
        let query = embedder.embed_text("minimum capital requirement");
        let related = embedder.embed_text("the minimum capital requirement for banks");
        let unrelated = embedder.embed_text("sourdough fermentation schedule");

        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated)
        );
    }

    #[test]
    fn test_hashing_empty_text_is_zero_vector() {
        let v = HashingEmbedding::new(8).embed_text("the of and");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_create_offline_embedder() {
        let embedder = create_embedder(true, 64).unwrap();
        assert_eq!(embedder.dimension(), 64);
        assert_eq!(embedder.name(), "hashing");
        assert_eq!(embedder.embed("capital").await.unwrap().len(), 64);
    }
}
