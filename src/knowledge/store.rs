//! Chunk Store - 불변 청크 저장소
//!
//! 외부 인덱서가 만든 코퍼스 세대(generation)를 메모리에 보관합니다.
//! 질의 시점에는 절대 변경되지 않으므로 `Arc`로 공유하며 잠금 없이 읽습니다.
//!
//! 코퍼스 입력 형식: JSON Lines (한 줄에 청크 하나)
//! ```json
//! {"id":"banking-7","text":"...","metadata":{"document_name":"basel.pdf","page":3,"industry":"banking","chunk_index":7},"embedding":[0.1, ...]}
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// 코퍼스 파일 이름 (데이터 디렉토리 기준)
pub const CORPUS_FILE_NAME: &str = "corpus.jsonl";

// ============================================================================
// Types
// ============================================================================

/// 청크 ID (코퍼스 세대 내에서 유일)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChunkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// 청크 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 원본 문서 이름 (예: "banking/basel3.pdf")
    pub document_name: String,
    /// 페이지 번호 (PDF가 아니면 None)
    #[serde(default)]
    pub page: Option<u32>,
    /// 산업 분류 (예: "banking", "healthcare")
    pub industry: String,
    /// 문서 내 청크 순번 (0-based)
    #[serde(default)]
    pub chunk_index: u32,
    /// 추가 문자열 속성
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

impl ChunkMetadata {
    /// 속성 이름으로 값 조회
    ///
    /// 표준 필드 외의 이름은 `extra`에서 찾습니다.
    pub fn attribute(&self, name: &str) -> Option<Cow<'_, str>> {
        match name {
            "document_name" => Some(Cow::Borrowed(self.document_name.as_str())),
            "industry" => Some(Cow::Borrowed(self.industry.as_str())),
            "page" => self.page.map(|p| Cow::Owned(p.to_string())),
            "chunk_index" => Some(Cow::Owned(self.chunk_index.to_string())),
            other => self.extra.get(other).map(|v| Cow::Borrowed(v.as_str())),
        }
    }
}

/// 인덱싱된 텍스트 단위
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    pub metadata: ChunkMetadata,
    /// 인덱스 빌드 시 계산된 임베딩
    pub embedding: Vec<f32>,
}

/// 코퍼스 통계
#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub generation: Uuid,
    pub chunk_count: usize,
    pub document_count: usize,
    pub dimension: usize,
    pub total_text_bytes: usize,
    /// 산업별 청크 수
    pub industries: BTreeMap<String, usize>,
}

// ============================================================================
// ChunkStore
// ============================================================================

/// 불변 청크 저장소 (코퍼스 세대 하나)
#[derive(Debug)]
pub struct ChunkStore {
    generation: Uuid,
    chunks: Vec<Arc<Chunk>>,
    positions: HashMap<ChunkId, usize>,
    dimension: usize,
}

impl ChunkStore {
    /// 청크 목록으로 저장소 생성
    ///
    /// 삽입 순서가 보존되며, 렉시컬 검색의 동점 처리 기준이 됩니다.
    ///
    /// # Errors
    /// 중복 ID 또는 임베딩 차원 불일치 시 `InvalidCorpus`
    pub fn new(chunks: Vec<Chunk>) -> Result<Self> {
        let dimension = chunks.first().map(|c| c.embedding.len()).unwrap_or(0);
        let mut positions = HashMap::with_capacity(chunks.len());
        let mut stored = Vec::with_capacity(chunks.len());

        for (i, chunk) in chunks.into_iter().enumerate() {
            if chunk.embedding.is_empty() {
                return Err(RagError::InvalidCorpus(format!(
                    "chunk {} has no embedding",
                    chunk.id
                )));
            }
            if chunk.embedding.len() != dimension {
                return Err(RagError::InvalidCorpus(format!(
                    "chunk {} has embedding dimension {}, expected {}",
                    chunk.id,
                    chunk.embedding.len(),
                    dimension
                )));
            }
            if positions.insert(chunk.id.clone(), i).is_some() {
                return Err(RagError::InvalidCorpus(format!(
                    "duplicate chunk id: {}",
                    chunk.id
                )));
            }
            stored.push(Arc::new(chunk));
        }

        let store = Self {
            generation: Uuid::new_v4(),
            chunks: stored,
            positions,
            dimension,
        };

        tracing::debug!(
            "Chunk store ready: generation={}, chunks={}, dimension={}",
            store.generation,
            store.chunks.len(),
            store.dimension
        );

        Ok(store)
    }

    /// JSON Lines 코퍼스 파일 로드
    ///
    /// # Arguments
    /// * `path` - 외부 인덱서가 생성한 `.jsonl` 파일
    pub fn load_jsonl(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut chunks = Vec::new();

        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let chunk: Chunk = serde_json::from_str(line).map_err(|e| {
                RagError::InvalidCorpus(format!(
                    "{}:{}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            chunks.push(chunk);
        }

        let store = Self::new(chunks)?;
        tracing::info!(
            "Loaded corpus: {} chunks from {:?} (generation={})",
            store.len(),
            path,
            store.generation
        );
        Ok(store)
    }

    /// 코퍼스 세대 ID (재빌드마다 새로 발급)
    pub fn generation(&self) -> Uuid {
        self.generation
    }

    /// 임베딩 차원 (빈 저장소는 0)
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// 삽입 순서대로 전체 청크
    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    /// ID로 청크 조회
    pub fn get(&self, id: &ChunkId) -> Option<&Arc<Chunk>> {
        self.positions.get(id).map(|&i| &self.chunks[i])
    }

    /// 삽입 순서상 위치
    pub fn position(&self, id: &ChunkId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 저장소 통계
    pub fn stats(&self) -> CorpusStats {
        let mut industries: BTreeMap<String, usize> = BTreeMap::new();
        let mut documents: BTreeSet<&str> = BTreeSet::new();
        let mut total_text_bytes = 0;

        for chunk in &self.chunks {
            *industries.entry(chunk.metadata.industry.clone()).or_default() += 1;
            documents.insert(chunk.metadata.document_name.as_str());
            total_text_bytes += chunk.text.len();
        }

        CorpusStats {
            generation: self.generation,
            chunk_count: self.chunks.len(),
            document_count: documents.len(),
            dimension: self.dimension,
            total_text_bytes,
            industries,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
