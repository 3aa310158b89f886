//! 메타데이터 필터 - 검색 전 후보 청크 제한
//!
//! 두 검색기가 실행되기 전에 적용되므로(pre-filtering)
//! 검색된 청크는 항상 필터를 만족합니다.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::store::Chunk;

/// 대소문자를 무시하고 비교하는 속성
const CASE_INSENSITIVE_ATTRIBUTES: &[&str] = &["industry"];

/// 속성 → 허용 값 집합
///
/// 빈 필터는 항등 함수입니다. 어떤 청크에도 없는 속성을 참조하면
/// 결과는 에러가 아니라 빈 집합입니다 (fail closed).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFilter {
    constraints: BTreeMap<String, BTreeSet<String>>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 산업 필터 (UI의 단일 선택 필터)
    pub fn industry(industry: impl Into<String>) -> Self {
        Self::new().allow("industry", industry)
    }

    /// 허용 값 추가 (같은 속성에 여러 번 호출하면 OR)
    pub fn allow(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints
            .entry(attribute.into())
            .or_default()
            .insert(value.into());
        self
    }

    /// `key=value` 형식 파싱 (CLI용)
    pub fn parse_pair(pair: &str) -> Option<(String, String)> {
        let (key, value) = pair.split_once('=')?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return None;
        }
        Some((key.to_string(), value.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// 청크가 모든 제약을 만족하는지 여부
    pub fn matches(&self, chunk: &Chunk) -> bool {
        self.constraints.iter().all(|(attribute, allowed)| {
            let Some(value) = chunk.metadata.attribute(attribute) else {
                return false;
            };
            if CASE_INSENSITIVE_ATTRIBUTES.contains(&attribute.as_str()) {
                allowed.iter().any(|a| a.eq_ignore_ascii_case(&value))
            } else {
                allowed.contains(value.as_ref())
            }
        })
    }

    /// 후보 집합 제한 (입력 순서 유지)
    pub fn restrict(&self, candidates: &[Arc<Chunk>]) -> Vec<Arc<Chunk>> {
        if self.is_empty() {
            return candidates.to_vec();
        }
        candidates
            .iter()
            .filter(|c| self.matches(c))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
