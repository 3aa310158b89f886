//! 설정 모듈
//!
//! 기본값 → JSON 설정 파일 → 환경변수 순으로 덮어씁니다.
//! 관련도 임계값과 인젝션 패턴은 대상 코퍼스에 맞춰 보정해야 하는 값입니다.
//!
//! ## 환경변수
//! - `RAG_TOP_K`, `RAG_RETRIEVER_K`
//! - `RAG_MIN_SIMILARITY`, `RAG_MIN_FUSED_SCORE`
//! - `RAG_MEMORY_TURNS`, `RAG_MAX_PROMPT_CHARS`

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

/// 설정 파일 이름 (데이터 디렉토리 기준)
pub const CONFIG_FILE_NAME: &str = "config.json";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.grounded-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".grounded-rag")
}

// ============================================================================
// RagConfig
// ============================================================================

/// 파이프라인 설정
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// 최종 근거(Evidence) 개수
    pub top_k: usize,
    /// 각 검색기가 반환하는 후보 개수
    pub retriever_k: usize,
    /// RRF 스무딩 상수
    pub rrf_k: f64,
    /// 시맨틱 후보 최소 코사인 유사도
    pub min_similarity: f32,
    /// 최상위 RRF 스코어 하한 (미만이면 거절)
    pub min_fused_score: f64,
    /// 프롬프트에 포함할 최근 대화 턴 수
    pub memory_turns: usize,
    /// 동시에 유지할 최대 세션 수 (초과 시 가장 오래 쓰지 않은 세션 제거)
    pub max_sessions: usize,
    /// 프롬프트 최대 길이 (문자 수)
    pub max_prompt_chars: usize,
    /// 임베딩 호출 타임아웃 (초)
    pub embed_timeout_secs: u64,
    /// 생성 호출 타임아웃 (초)
    pub generation_timeout_secs: u64,
    /// 생성 일시 장애 최대 재시도 횟수
    pub max_retries: u32,
    /// 재시도 초기 백오프 (ms, 매 시도마다 2배)
    pub initial_backoff_ms: u64,
    /// 추가 인젝션 탐지 정규식
    pub extra_injection_patterns: Vec<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            retriever_k: 10,
            rrf_k: 60.0,
            min_similarity: 0.22,
            min_fused_score: 0.0,
            memory_turns: 6,
            max_sessions: 1024,
            max_prompt_chars: 12_000,
            embed_timeout_secs: 30,
            generation_timeout_secs: 60,
            max_retries: 3,
            initial_backoff_ms: 500,
            extra_injection_patterns: Vec::new(),
        }
    }
}

impl RagConfig {
    /// 설정 로드
    ///
    /// # Arguments
    /// * `path` - JSON 설정 파일 경로 (없으면 `<data_dir>/config.json`, 파일이 없으면 기본값)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| get_data_dir().join(CONFIG_FILE_NAME));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let config: RagConfig = serde_json::from_str(&raw).map_err(|e| {
                RagError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            tracing::debug!("Loaded config from {:?}", path);
            config
        } else {
            RagConfig::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// 환경변수 덮어쓰기
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env("RAG_TOP_K", &mut self.top_k)?;
        override_from_env("RAG_RETRIEVER_K", &mut self.retriever_k)?;
        override_from_env("RAG_MIN_SIMILARITY", &mut self.min_similarity)?;
        override_from_env("RAG_MIN_FUSED_SCORE", &mut self.min_fused_score)?;
        override_from_env("RAG_MEMORY_TURNS", &mut self.memory_turns)?;
        override_from_env("RAG_MAX_SESSIONS", &mut self.max_sessions)?;
        override_from_env("RAG_MAX_PROMPT_CHARS", &mut self.max_prompt_chars)?;
        Ok(())
    }

    /// 값 일관성 검증
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(RagError::Config("top_k must be greater than zero".to_string()));
        }
        // 검색기 k가 최종 k보다 작으면 융합 결과가 top_k를 채우지 못함
        if self.retriever_k < self.top_k {
            return Err(RagError::Config(format!(
                "retriever_k ({}) must be >= top_k ({})",
                self.retriever_k, self.top_k
            )));
        }
        if self.rrf_k.is_nan() || self.rrf_k <= 0.0 {
            return Err(RagError::Config("rrf_k must be positive".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.min_similarity) {
            return Err(RagError::Config(format!(
                "min_similarity ({}) must be within [-1, 1]",
                self.min_similarity
            )));
        }
        if self.min_fused_score < 0.0 {
            return Err(RagError::Config("min_fused_score must be >= 0".to_string()));
        }
        if self.max_sessions == 0 {
            return Err(RagError::Config("max_sessions must be greater than zero".to_string()));
        }
        if self.max_prompt_chars == 0 {
            return Err(RagError::Config("max_prompt_chars must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

/// 환경변수가 있으면 파싱하여 덮어쓰기
fn override_from_env<T: FromStr>(key: &str, slot: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(key) {
        if raw.trim().is_empty() {
            return Ok(());
        }
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| RagError::Config(format!("Invalid value for {}: {}", key, raw)))?;
        tracing::debug!("Config override from {}", key);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        assert!(RagConfig::default().validate().is_ok());
    }

    #[test]
    fn test_retriever_k_smaller_than_top_k_rejected() {
        let config = RagConfig {
            top_k: 8,
            retriever_k: 4,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retriever_k"));
    }

    #[test]
    fn test_zero_top_k_rejected() {
        let config = RagConfig {
            top_k: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_zero_max_sessions_rejected() {
        let config = RagConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "top_k": 3, "min_fused_score": 0.02 }"#).unwrap();

        let config = RagConfig::load(Some(&path)).unwrap();
        assert_eq!(config.top_k, 3);
        assert!((config.min_fused_score - 0.02).abs() < 1e-12);
        assert_eq!(config.retriever_k, 10);
        assert_eq!(config.memory_turns, 6);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = RagConfig::load(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config.top_k, RagConfig::default().top_k);
    }

    #[test]
    fn test_load_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ top_k: ").unwrap();
        assert!(matches!(RagConfig::load(Some(&path)), Err(RagError::Config(_))));
    }
}
