//! CLI 모듈
//!
//! grounded-rag CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::{get_data_dir, RagConfig, CONFIG_FILE_NAME};
use crate::embedding::create_embedder;
use crate::gemini::has_api_key;
use crate::generation::GeminiGeneration;
use crate::knowledge::{
    ChunkStore, HybridRetriever, MetadataFilter, SearchMethod, CORPUS_FILE_NAME,
};
use crate::qa::{AnswerResult, QaPipeline, SqliteQueryLog, QUERY_LOG_FILE_NAME};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "grounded-rag")]
#[command(version, about = "근거 기반 하이브리드 RAG 질의응답", long_about = None)]
pub struct Cli {
    /// 코퍼스 파일 (JSON Lines, 기본: <data_dir>/corpus.jsonl)
    #[arg(long, global = true)]
    pub corpus: Option<PathBuf>,

    /// 설정 파일 (기본: <data_dir>/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// 오프라인 해싱 임베딩 사용 (코퍼스도 같은 방식으로 빌드되어 있어야 함)
    #[arg(long, global = true)]
    pub offline: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// 메타데이터 필터 옵션
#[derive(Args, Clone, Default)]
pub struct FilterArgs {
    /// 산업 필터 (예: banking, healthcare)
    #[arg(short, long)]
    pub industry: Option<String>,

    /// 추가 속성 필터 (key=value, 반복 가능)
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    pub filters: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 질문 하나에 답변
    Ask {
        /// 질문
        query: String,

        #[command(flatten)]
        filter: FilterArgs,

        /// 대화 세션 ID
        #[arg(short, long, default_value = "cli")]
        session: String,
    },

    /// 대화형 질의응답 (exit 또는 quit으로 종료)
    Chat {
        #[command(flatten)]
        filter: FilterArgs,

        /// 대화 세션 ID
        #[arg(short, long, default_value = "chat")]
        session: String,
    },

    /// 하이브리드 검색 결과만 출력 (답변 생성 없음)
    Search {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long, default_value = "10")]
        limit: usize,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// 상태 확인
    Status,

    /// 최근 질의 기록
    Log {
        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let ctx = CliContext::new(&cli)?;

    match cli.command {
        Commands::Ask {
            query,
            filter,
            session,
        } => cmd_ask(&ctx, &query, &filter, &session).await,
        Commands::Chat { filter, session } => cmd_chat(&ctx, &filter, &session).await,
        Commands::Search {
            query,
            limit,
            filter,
        } => cmd_search(&ctx, &query, limit, &filter).await,
        Commands::Status => cmd_status(&ctx).await,
        Commands::Log { limit } => cmd_log(limit).await,
    }
}

/// 명령어 공통 입력
struct CliContext {
    config: RagConfig,
    corpus_path: PathBuf,
    offline: bool,
}

impl CliContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config = RagConfig::load(cli.config.as_deref()).context("설정 로드 실패")?;
        let corpus_path = cli
            .corpus
            .clone()
            .unwrap_or_else(|| get_data_dir().join(CORPUS_FILE_NAME));

        Ok(Self {
            config,
            corpus_path,
            offline: cli.offline,
        })
    }

    fn load_store(&self) -> Result<Arc<ChunkStore>> {
        if !self.corpus_path.exists() {
            bail!(
                "코퍼스 파일이 없습니다: {}\n\
                 외부 인덱서로 생성한 JSON Lines 파일을 --corpus로 지정하세요.",
                self.corpus_path.display()
            );
        }

        let store = ChunkStore::load_jsonl(&self.corpus_path)
            .with_context(|| format!("코퍼스 로드 실패: {}", self.corpus_path.display()))?;
        if store.is_empty() {
            bail!("코퍼스가 비어 있습니다: {}", self.corpus_path.display());
        }
        Ok(Arc::new(store))
    }

    fn retriever(&self) -> Result<HybridRetriever> {
        let store = self.load_store()?;
        let embedder = create_embedder(self.offline, store.dimension())?;
        Ok(HybridRetriever::new(store, embedder, &self.config)?)
    }

    fn pipeline(&self) -> Result<QaPipeline> {
        if !has_api_key() {
            bail!(
                "API 키가 설정되지 않았습니다.\n\n\
                 설정 방법:\n  \
                 export GEMINI_API_KEY=your-api-key\n  \
                 또는\n  \
                 export GOOGLE_AI_API_KEY=your-api-key\n\n\
                 API 키 발급: https://aistudio.google.com/app/apikey"
            );
        }

        let store = self.load_store()?;
        let embedder = create_embedder(self.offline, store.dimension())?;
        let generator = GeminiGeneration::from_env().context("GeminiGeneration 생성 실패")?;

        let mut pipeline = QaPipeline::new(store, embedder, Arc::new(generator), &self.config)
            .context("파이프라인 초기화 실패")?;

        // 질의 로그는 선택 사항: 열기 실패 시 경고만 출력
        match SqliteQueryLog::open_default() {
            Ok(log) => pipeline = pipeline.with_recorder(Arc::new(log)),
            Err(e) => tracing::warn!("Query log unavailable: {:#}", e),
        }
        Ok(pipeline)
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 단일 질문 명령어 (ask)
async fn cmd_ask(ctx: &CliContext, query: &str, filter: &FilterArgs, session: &str) -> Result<()> {
    let filter = build_filter(filter)?;
    let pipeline = ctx.pipeline()?;

    println!("[*] 질문: \"{}\"", query);
    let result = ask_interruptible(&pipeline, query, &filter, session).await?;
    print_answer(&result);
    Ok(())
}

/// 대화형 명령어 (chat)
async fn cmd_chat(ctx: &CliContext, filter: &FilterArgs, session: &str) -> Result<()> {
    let filter = build_filter(filter)?;
    let pipeline = ctx.pipeline()?;

    println!("[*] 대화 세션: {} (종료: exit)", session);
    if !filter.is_empty() {
        println!("[*] 필터: {:?}", filter);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }

        match ask_interruptible(&pipeline, query, &filter, session).await {
            Ok(result) => print_answer(&result),
            Err(e) => println!("[!] {:#}", e),
        }
    }

    pipeline.end_session(session).await;
    println!("[OK] 세션 종료");
    Ok(())
}

/// 검색 명령어 (search)
async fn cmd_search(ctx: &CliContext, query: &str, limit: usize, filter: &FilterArgs) -> Result<()> {
    let filter = build_filter(filter)?;
    let retriever = ctx.retriever()?;

    println!("[*] 검색 중: \"{}\"", query);
    let search = retriever
        .search(query, &filter, limit)
        .await
        .context("검색 실패")?;

    if search.below_relevance_floor {
        println!(
            "\n[!] 관련 문서가 없습니다. (최고 유사도 {:.3} < 하한 {:.3})",
            search.best_similarity.unwrap_or(0.0),
            ctx.config.min_similarity
        );
        return Ok(());
    }

    if search.fused.is_empty() {
        println!("\n[!] 검색 결과가 없습니다. (필터 후 후보: {} 건)", search.candidate_count);
        return Ok(());
    }

    if search.degraded {
        println!("[!] 한쪽 검색기에서만 결과가 나왔습니다.");
    }

    println!(
        "\n[OK] 검색 결과 ({} 건, 후보 {} / 키워드 {} / 벡터 {}):\n",
        search.fused.len(),
        search.candidate_count,
        search.lexical.len(),
        search.semantic.len()
    );

    let store = retriever.store();
    for fused in &search.fused {
        let method_str = match fused.method {
            SearchMethod::Lexical => "LEX",
            SearchMethod::Semantic => "SEM",
            SearchMethod::Hybrid => "HYB",
        };
        println!(
            "{}. [{}] [점수: {:.4}] {}",
            fused.result.rank, method_str, fused.result.score, fused.result.chunk_id
        );
        if let Some(chunk) = store.get(&fused.result.chunk_id) {
            println!(
                "   문서: {} (page={}, industry={})",
                chunk.metadata.document_name,
                chunk
                    .metadata
                    .page
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "n/a".to_string()),
                chunk.metadata.industry
            );
            println!("   내용: {}", truncate_text(&chunk.text, 200));
        }
        println!();
    }

    Ok(())
}

/// 상태 확인 명령어 (status)
async fn cmd_status(ctx: &CliContext) -> Result<()> {
    println!("grounded-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let data_dir = get_data_dir();
    println!("[*] 데이터 디렉토리: {}", data_dir.display());
    print_path_status("설정 파일", &data_dir.join(CONFIG_FILE_NAME));

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    let config = &ctx.config;
    println!(
        "[*] 설정: top_k={}, retriever_k={}, rrf_k={}, min_similarity={}, min_fused_score={}",
        config.top_k, config.retriever_k, config.rrf_k, config.min_similarity, config.min_fused_score
    );

    match ctx.load_store() {
        Ok(store) => {
            let stats = store.stats();
            println!("[OK] 코퍼스: {}", ctx.corpus_path.display());
            println!(
                "     청크 {} 건 / 문서 {} 건 / 차원 {}",
                stats.chunk_count, stats.document_count, stats.dimension
            );
            println!("     총 텍스트: {}", format_bytes(stats.total_text_bytes));
            println!("     세대: {}", stats.generation);
            for (industry, count) in &stats.industries {
                println!("     - {}: {} 청크", industry, count);
            }
        }
        Err(e) => println!("[!] 코퍼스: {:#}", e),
    }

    match SqliteQueryLog::open_default().and_then(|log| log.stats()) {
        Ok(stats) => {
            println!(
                "[OK] 질의 기록: {} 건 (답변 {} / 거절 {} / 차단 {} / 에러 {})",
                stats.total, stats.answered, stats.refused, stats.guardrail_blocked, stats.errors
            );
            println!("     평균 지연: {:.1} ms", stats.avg_latency_ms);
        }
        Err(e) => {
            tracing::debug!("Query log stats unavailable: {:#}", e);
            println!("[!] 질의 기록: 없음");
        }
    }

    Ok(())
}

/// 질의 기록 명령어 (log)
async fn cmd_log(limit: usize) -> Result<()> {
    let path = get_data_dir().join(QUERY_LOG_FILE_NAME);
    if !path.exists() {
        println!("[!] 질의 기록이 없습니다.");
        return Ok(());
    }

    let log = SqliteQueryLog::open(&path).context("질의 기록 열기 실패")?;
    let records = log.recent(limit).context("질의 기록 조회 실패")?;

    println!("[OK] 최근 질의 ({} 건):\n", records.len());
    for record in &records {
        let outcome = match (&record.error, record.refusal_reason) {
            (Some(error), _) => format!("ERROR {}", truncate_text(error, 60)),
            (None, Some(reason)) => format!("REFUSED {}", reason.as_str()),
            (None, None) => "ANSWERED".to_string(),
        };
        println!(
            "{} [{}] {} ({} ms)",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.session_id,
            outcome,
            record.latency_ms
        );
        println!("   질문: {}", truncate_text(&record.query, 100));
        if !record.evidence_chunk_ids.is_empty() {
            let ids: Vec<&str> = record.evidence_chunk_ids.iter().map(|id| id.as_str()).collect();
            println!("   근거: {}", ids.join(", "));
        }
        for flag in &record.guardrail_flags {
            println!("   가드레일: {:?} ({})", flag.target, flag.reason.as_str());
        }
        println!();
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Ctrl+C로 취소 가능한 질의
async fn ask_interruptible(
    pipeline: &QaPipeline,
    query: &str,
    filter: &MetadataFilter,
    session: &str,
) -> Result<AnswerResult> {
    let cancel = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // 시그널 핸들러를 설치할 수 없으면 취소 없이 진행
            std::future::pending::<()>().await;
        }
    };

    pipeline
        .ask_cancellable(query, filter, session, cancel)
        .await
        .map_err(|e| {
            tracing::debug!("Query failed: {}", e);
            anyhow::anyhow!(e.user_message())
        })
}

/// 필터 옵션을 `MetadataFilter`로 변환
fn build_filter(args: &FilterArgs) -> Result<MetadataFilter> {
    let mut filter = match &args.industry {
        Some(industry) => MetadataFilter::industry(industry.as_str()),
        None => MetadataFilter::new(),
    };

    for pair in &args.filters {
        let Some((key, value)) = MetadataFilter::parse_pair(pair) else {
            bail!("잘못된 필터 형식: {} (key=value)", pair);
        };
        filter = filter.allow(key, value);
    }
    Ok(filter)
}

fn print_answer(result: &AnswerResult) {
    if result.refused {
        let reason = result.refusal_reason.map(|r| r.as_str()).unwrap_or("-");
        println!("\n[!] 답변 거절 ({})", reason);
        println!("{}", result.text);
        return;
    }

    println!("\n[OK] 답변:\n");
    println!("{}", result.text);

    println!("\n출처:");
    for (i, citation) in result.citations.iter().enumerate() {
        println!(
            "  [S{}] {} | page={} | chunk={}",
            i + 1,
            citation.document_name,
            citation
                .page
                .map(|p| p.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            citation.chunk_id
        );
    }
}

fn print_path_status(label: &str, path: &Path) {
    if path.exists() {
        println!("[OK] {}: {}", label, path.display());
    } else {
        println!("[*] {}: 없음 (기본값 사용)", label);
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
