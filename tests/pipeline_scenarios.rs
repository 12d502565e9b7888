mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;

use common::{seed_documents, services_with, test_config, ScriptedGenerator, Step, DIMENSION};
use dental_rag::cache::{CacheBackend, CacheEntry, CacheKey, CacheSource, ResponseCache};
use dental_rag::context::PromptComposer;
use dental_rag::embedding::{HashingEmbedder, InputPolicy};
use dental_rag::history::{ConversationStore, Role};
use dental_rag::pipeline::{
    CacheError, ChatPipeline, PipelineError, PipelineOptions, PipelineState, PipelineWarning,
};
use dental_rag::rag::{DocumentIndex, Retriever};

#[tokio::test]
async fn answers_from_clinic_documents_then_serves_repeat_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("We are open 9am-6pm, Sunday to Thursday."));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let first = services
        .pipeline
        .run("c1", "What are your opening hours?")
        .await
        .unwrap();

    assert_eq!(first.answer, "We are open 9am-6pm, Sunday to Thursday.");
    assert_eq!(first.source, CacheSource::Generated);
    assert_eq!(first.generation_attempts, 1);
    assert_eq!(first.states.last(), Some(&PipelineState::Done));
    assert!(first.states.contains(&PipelineState::Persisting));
    let prompt = generator.last_prompt().unwrap();
    assert!(prompt.contains("Branch opens 9am-6pm Sun-Thu"));
    assert!(prompt.contains("What are your opening hours?"));

    let second = services
        .pipeline
        .run("c1", "what are your opening hours")
        .await
        .unwrap();

    assert!(second.cache_hit());
    assert_eq!(second.answer, first.answer);
    assert_eq!(second.generation_attempts, 0);
    assert!(second.states.contains(&PipelineState::CacheHit));
    assert!(!second.states.contains(&PipelineState::Persisting));
    assert_eq!(generator.calls(), 1);

    // Cache hits are not written to history.
    let turns = services.history.all("c1").await.unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[0].text, "What are your opening hours?");
    assert_eq!(turns[1].role, Role::Assistant);
    assert_eq!(turns[1].text, first.answer);
}

#[tokio::test]
async fn other_conversation_does_not_share_cached_answer() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("Open 9am-6pm."));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    services.pipeline.run("c1", "Opening hours?").await.unwrap();
    let other = services.pipeline.run("c2", "Opening hours?").await.unwrap();

    assert_eq!(other.source, CacheSource::Generated);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn prompt_carries_previous_turns() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Answer("We offer whitening.".to_string()),
        Step::Answer("It costs 500.".to_string()),
    ]));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    services
        .pipeline
        .run("c1", "Do you offer whitening?")
        .await
        .unwrap();
    services.pipeline.run("c1", "How much is it?").await.unwrap();

    let prompt = generator.last_prompt().unwrap();
    assert!(prompt.contains("Do you offer whitening?"));
    assert!(prompt.contains("We offer whitening."));
    assert_eq!(services.history.turn_count("c1").await.unwrap(), 4);
}

#[tokio::test]
async fn retries_attempts_that_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.generation.timeout_ms = 50;
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Hang(Duration::from_secs(5)),
        Step::Hang(Duration::from_secs(5)),
        Step::Answer("Open 9am-6pm.".to_string()),
    ]));
    let services = services_with(&dir, config, generator.clone()).await;

    let outcome = services.pipeline.run("c1", "Opening hours?").await.unwrap();

    assert_eq!(outcome.answer, "Open 9am-6pm.");
    assert_eq!(outcome.generation_attempts, 3);
    assert_eq!(generator.calls(), 3);
    assert!(!outcome
        .states
        .iter()
        .any(|s| matches!(s, PipelineState::Failed(_))));
}

#[tokio::test]
async fn retries_transient_provider_errors() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Transient,
        Step::Transient,
        Step::Answer("Open 9am-6pm.".to_string()),
    ]));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let outcome = services.pipeline.run("c1", "Opening hours?").await.unwrap();

    assert_eq!(outcome.generation_attempts, 3);
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn permanent_failure_is_not_retried_or_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(vec![Step::Permanent]));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let err = services
        .pipeline
        .run("c1", "Opening hours?")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "generation_permanent");
    assert!(!err.is_retryable());
    assert_eq!(generator.calls(), 1);
    assert_eq!(services.history.turn_count("c1").await.unwrap(), 0);
    assert!(services.cache.is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_transient_error() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Step::Transient,
        Step::Transient,
        Step::Transient,
    ]));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let err = services
        .pipeline
        .run("c1", "Opening hours?")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "generation_transient");
    assert!(err.is_retryable());
    assert_eq!(generator.calls(), 3);

    // The failure is not cached; the next call generates again.
    let outcome = services.pipeline.run("c1", "Opening hours?").await.unwrap();
    assert_eq!(outcome.source, CacheSource::Generated);
    assert_eq!(generator.calls(), 4);
}

#[tokio::test]
async fn concurrent_identical_queries_generate_once() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(
        ScriptedGenerator::answering("Open 9am-6pm.").with_latency(Duration::from_millis(200)),
    );
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let runs = (0..8).map(|_| {
        let services = services.clone();
        async move { services.pipeline.run("c1", "Opening hours?").await }
    });
    let outcomes = join_all(runs).await;

    assert_eq!(generator.calls(), 1);
    let mut generated = 0;
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.answer, "Open 9am-6pm.");
        if outcome.source == CacheSource::Generated {
            generated += 1;
        }
    }
    assert_eq!(generated, 1);
    assert_eq!(services.cache.in_flight(), 0);
    // Only the generating request persisted its exchange.
    assert_eq!(services.history.turn_count("c1").await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_conversations_keep_dense_indices() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("Sure."));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let runs = (0..6).map(|i| {
        let services = services.clone();
        async move {
            services
                .pipeline
                .run("shared", &format!("Question number {}", i))
                .await
        }
    });
    for outcome in join_all(runs).await {
        outcome.unwrap();
    }

    let turns = services.history.all("shared").await.unwrap();
    assert_eq!(turns.len(), 12);
    for (expected, turn) in turns.iter().enumerate() {
        assert_eq!(turn.turn_index, expected as i64);
    }
    assert_eq!(services.history.active_locks(), 0);
}

#[tokio::test]
async fn total_latency_budget_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.pipeline.max_total_latency_ms = 100;
    config.generation.timeout_ms = 10_000;
    let generator = Arc::new(ScriptedGenerator::new(vec![Step::Hang(Duration::from_secs(5))]));
    let services = services_with(&dir, config, generator.clone()).await;

    let err = services
        .pipeline
        .run("c1", "Opening hours?")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Timeout { limit_ms: 100 }));
    assert_eq!(services.cache.in_flight(), 0);
    assert_eq!(services.history.turn_count("c1").await.unwrap(), 0);
}

#[tokio::test]
async fn blank_input_is_rejected_before_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("unused"));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let err = services.pipeline.run("c1", "   ").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    let err = services.pipeline.run("", "Opening hours?").await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn corrupt_history_fails_only_that_conversation() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("Open 9am-6pm."));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let pool = sqlx::SqlitePool::connect(&format!(
        "sqlite://{}",
        services.paths.db_path.display()
    ))
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO conversation_turns (conversation_id, turn_index, role, text, created_at)
         VALUES ('broken', 0, 'narrator', 'garbled', '2024-01-01T00:00:00Z')",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let err = services
        .pipeline
        .run("broken", "Opening hours?")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "corrupt_history");
    assert_eq!(generator.calls(), 0);

    let outcome = services.pipeline.run("healthy", "Opening hours?").await.unwrap();
    assert_eq!(outcome.answer, "Open 9am-6pm.");
}

struct BrokenBackend;

#[async_trait]
impl CacheBackend for BrokenBackend {
    async fn load(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Err(CacheError::backend("disk I/O error"))
    }

    async fn save(&self, _entry: &CacheEntry) -> Result<(), CacheError> {
        Err(CacheError::backend("disk I/O error"))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Err(CacheError::backend("disk I/O error"))
    }

    async fn record_hit(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Err(CacheError::backend("disk I/O error"))
    }

    async fn prune(&self, _keep: usize) -> Result<u64, CacheError> {
        Err(CacheError::backend("disk I/O error"))
    }
}

#[tokio::test]
async fn broken_cache_store_degrades_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator::answering("Open 9am-6pm."));
    let embedder = Arc::new(HashingEmbedder::new(DIMENSION, InputPolicy::default()));
    let index = Arc::new(DocumentIndex::new(DIMENSION));
    let history = Arc::new(
        ConversationStore::open(&dir.path().join("chatbot.db"))
            .await
            .unwrap(),
    );
    let cache = Arc::new(ResponseCache::new(
        16,
        1,
        Some(Arc::new(BrokenBackend) as Arc<dyn CacheBackend>),
    ));

    let pipeline = ChatPipeline::new(
        Retriever::new(embedder, index, false),
        history,
        cache,
        PromptComposer::new(
            config.prompt.system_prompt.clone(),
            config.history.window,
            config.generation.parameters(),
        ),
        generator.clone(),
        PipelineOptions::from_config(&config),
    );

    let outcome = pipeline.run("c1", "Opening hours?").await.unwrap();

    assert_eq!(outcome.answer, "Open 9am-6pm.");
    assert!(outcome
        .warnings
        .iter()
        .any(|w| matches!(w, PipelineWarning::CacheDegraded { .. })));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn durable_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first_generator = Arc::new(ScriptedGenerator::answering("Open 9am-6pm."));
    let services = services_with(&dir, test_config(), first_generator.clone()).await;
    services.pipeline.run("c1", "Opening hours?").await.unwrap();
    services.shutdown().await;
    drop(services);

    let second_generator = Arc::new(ScriptedGenerator::answering("different"));
    let restarted = services_with(&dir, test_config(), second_generator.clone()).await;
    let outcome = restarted.pipeline.run("c1", "Opening hours?").await.unwrap();

    assert!(outcome.cache_hit());
    assert_eq!(outcome.answer, "Open 9am-6pm.");
    assert_eq!(second_generator.calls(), 0);
    assert_eq!(restarted.history.turn_count("c1").await.unwrap(), 2);
}

#[tokio::test]
async fn empty_index_still_answers() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("Please call the clinic."));
    let paths = Arc::new(dental_rag::core::config::AppPaths::with_data_dir(dir.path()));
    let embedder = Arc::new(HashingEmbedder::new(DIMENSION, InputPolicy::default()));
    let services = dental_rag::ChatbotServices::with_providers(
        paths,
        test_config(),
        embedder,
        generator.clone(),
    )
    .await
    .unwrap();
    assert!(services.index.is_empty());

    let outcome = services.pipeline.run("c1", "Opening hours?").await.unwrap();
    assert_eq!(outcome.answer, "Please call the clinic.");

    seed_documents(&services).await;
    assert_eq!(services.index.len(), 3);
}

#[tokio::test]
async fn failed_persistence_still_returns_the_answer() {
    let dir = tempfile::tempdir().unwrap();
    let generator = Arc::new(ScriptedGenerator::answering("Open 9am."));
    let services = services_with(&dir, test_config(), generator.clone()).await;

    let pool = sqlx::SqlitePool::connect(&format!(
        "sqlite://{}",
        services.paths.db_path.display()
    ))
    .await
    .unwrap();
    sqlx::query(
        "CREATE TRIGGER reject_turns BEFORE INSERT ON conversation_turns
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool.close().await;

    let outcome = services.pipeline.run("c1", "Opening hours?").await.unwrap();

    assert_eq!(outcome.answer, "Open 9am.");
    assert_eq!(outcome.source, CacheSource::Generated);
    assert_eq!(outcome.states.last(), Some(&PipelineState::Done));
    assert!(outcome
        .warnings
        .iter()
        .any(|w| matches!(w, PipelineWarning::PersistenceFailed { message } if message.contains("disk full"))));
    assert_eq!(services.history.turn_count("c1").await.unwrap(), 0);
    assert_eq!(services.history.active_locks(), 0);
}

#[tokio::test]
async fn truncated_query_is_reported_on_the_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.embedding.max_input_chars = 24;
    config.embedding.truncate_long_inputs = true;
    let generator = Arc::new(ScriptedGenerator::answering("Open 9am-6pm."));
    let paths = Arc::new(dental_rag::core::config::AppPaths::with_data_dir(dir.path()));
    let embedder = Arc::new(HashingEmbedder::new(
        DIMENSION,
        config.embedding.input_policy(),
    ));
    let services =
        dental_rag::ChatbotServices::with_providers(paths, config, embedder, generator.clone())
            .await
            .unwrap();
    seed_documents(&services).await;

    let long = services
        .pipeline
        .run(
            "c1",
            "What are your opening hours on weekends and public holidays?",
        )
        .await
        .unwrap();
    assert!(long.warnings.contains(&PipelineWarning::QueryTruncated));
    assert_eq!(long.answer, "Open 9am-6pm.");

    let short = services.pipeline.run("c2", "Opening hours?").await.unwrap();
    assert!(!short.warnings.contains(&PipelineWarning::QueryTruncated));
}
