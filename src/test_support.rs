//! 테스트용 결정적 대역 (임베딩/생성 프로바이더, 코퍼스 빌더, 레코더)

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::GenerationProvider;
use crate::knowledge::{tokenize, Chunk, ChunkMetadata, ChunkStore};
use crate::qa::{GenerationRequest, QueryRecord, QueryRecorder};

// ============================================================================
// Corpus Builders
// ============================================================================

/// 테스트 청크 (document_name = "{industry}/{id}.pdf", page = 1)
pub fn chunk(id: &str, industry: &str, text: &str, embedding: Vec<f32>) -> Chunk {
    Chunk {
        id: id.into(),
        text: text.to_string(),
        metadata: ChunkMetadata {
            document_name: format!("{}/{}.pdf", industry, id),
            page: Some(1),
            industry: industry.to_string(),
            chunk_index: 0,
            extra: BTreeMap::new(),
        },
        embedding,
    }
}

/// `(id, industry, text)` 목록으로 코퍼스와 그에 맞는 임베더 생성
///
/// 임베더는 코퍼스 어휘 기반 단어 빈도 벡터를 만들므로 해시 충돌이 없고,
/// 코퍼스에 없는 질의 단어는 무시됩니다.
pub fn test_corpus(entries: &[(&str, &str, &str)]) -> (ChunkStore, Arc<dyn EmbeddingProvider>) {
    let embedder = VocabularyEmbedder::from_texts(entries.iter().map(|(_, _, text)| *text));
    let chunks = entries
        .iter()
        .map(|(id, industry, text)| chunk(id, industry, text, embedder.embed_text(text)))
        .collect();
    (ChunkStore::new(chunks).unwrap(), Arc::new(embedder))
}

// ============================================================================
// Embedding Stand-ins
// ============================================================================

/// 코퍼스 어휘 기반 단어 빈도 임베딩
pub struct VocabularyEmbedder {
    vocabulary: BTreeMap<String, usize>,
}

impl VocabularyEmbedder {
    pub fn from_texts<'a>(texts: impl Iterator<Item = &'a str>) -> Self {
        let mut vocabulary = BTreeMap::new();
        for text in texts {
            for token in tokenize(text) {
                let next = vocabulary.len();
                vocabulary.entry(token).or_insert(next);
            }
        }
        Self { vocabulary }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.vocabulary.len()];
        for token in tokenize(text) {
            if let Some(&i) = self.vocabulary.get(&token) {
                vector[i] += 1.0;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed_text(text))
    }

    fn dimension(&self) -> usize {
        self.vocabulary.len()
    }

    fn name(&self) -> &str {
        "vocabulary"
    }
}

/// 항상 같은 벡터를 반환
pub struct FixedEmbedder {
    vector: Vec<f32>,
}

impl FixedEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }
}

#[async_trait]
impl EmbeddingProvider for FixedEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.vector.clone())
    }

    fn dimension(&self) -> usize {
        self.vector.len()
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// 항상 실패
pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("embedding service unreachable")
    }

    fn dimension(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// 지정 시간만큼 지연 후 응답
pub struct SlowEmbedder {
    delay: Duration,
}

impl SlowEmbedder {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        tokio::time::sleep(self.delay).await;
        Ok(vec![1.0])
    }

    fn dimension(&self) -> usize {
        1
    }

    fn name(&self) -> &str {
        "slow"
    }
}

// ============================================================================
// Generation Stand-in
// ============================================================================

/// 스크립트된 응답을 순서대로 반환하는 생성 프로바이더
///
/// 호출 횟수와 받은 요청을 기록합니다.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    /// 항상 같은 답변
    pub fn answering(text: &str) -> Self {
        Self::build(VecDeque::new(), Some(text.to_string()))
    }

    /// 순서대로 반환, 소진되면 `GenerationFailed`
    pub fn scripted(script: Vec<Result<String>>) -> Self {
        Self::build(script.into(), None)
    }

    fn build(script: VecDeque<Result<String>>, fallback: Option<String>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedGenerator {
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match (next, &self.fallback) {
            (Some(result), _) => result,
            (None, Some(text)) => Ok(text.clone()),
            (None, None) => Err(RagError::GenerationFailed("script exhausted".to_string())),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ============================================================================
// Recorder Stand-ins
// ============================================================================

/// 메모리에 레코드를 모으는 레코더
#[derive(Default)]
pub struct RecordingRecorder {
    records: Mutex<Vec<QueryRecord>>,
}

impl RecordingRecorder {
    pub fn records(&self) -> Vec<QueryRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl QueryRecorder for RecordingRecorder {
    fn record(&self, record: &QueryRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// 항상 실패하는 레코더
pub struct FailingRecorder;

impl QueryRecorder for FailingRecorder {
    fn record(&self, _record: &QueryRecord) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }
}
