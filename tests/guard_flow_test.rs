//! Guard Flow Integration Tests
//!
//! End-to-end agent loops against a SQLite-backed store.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use toolguard::{
    CompletionClient, CompletionReply, CompletionRequest, CorrectionStrategy, ErrorCategory,
    ExecutionStatus, GuardConfig, GuardStore, LlmError, NewToolCall, ReflectionRequest,
    SqliteStore, ToolGuard, MAX_ROUNDS,
};

fn create_test_store(name: &str) -> (Arc<SqliteStore>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join(format!("{}.db", name));
    let store = SqliteStore::open(&db_path).expect("Failed to create store");
    (Arc::new(store), temp_dir)
}

struct CannedClient {
    replies: Mutex<VecDeque<String>>,
}

impl CannedClient {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl CompletionClient for CannedClient {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionReply, LlmError> {
        match self.replies.lock().unwrap().pop_front() {
            Some(text) => Ok(CompletionReply::Text(text)),
            None => Err(LlmError::NotConfigured),
        }
    }
}

#[tokio::test]
async fn test_redundant_call_is_skipped() {
    let (store, _temp) = create_test_store("redundant");
    let guard = ToolGuard::new(store.clone(), &GuardConfig::default());
    let params = json!({"symbol": "ACME", "range": {"from": "2026-01-01", "to": "2026-03-31"}});

    // First call executes
    assert!(!guard.redundancy.is_redundant(Some("s1"), Some("quote"), Some(&params)).await.unwrap());
    let first = guard
        .redundancy
        .record_tool_call(NewToolCall::new("s1", "quote", Some(params.clone()), ExecutionStatus::Success).timing(120, 40, 300))
        .await
        .unwrap();
    guard
        .redundancy
        .cache_result("s1", "quote", Some(&params), json!({"close": 12.5}), Some(&first.id), None)
        .await
        .unwrap();

    // Same call with reordered keys is redundant and served from cache
    let again = json!({"range": {"to": "2026-03-31", "from": "2026-01-01"}, "symbol": "ACME"});
    assert!(guard.redundancy.is_redundant(Some("s1"), Some("quote"), Some(&again)).await.unwrap());
    let cached = guard.redundancy.get_cached_result("s1", "quote", Some(&again)).await.unwrap();
    assert_eq!(cached, Some(json!({"close": 12.5})));

    let second = guard
        .redundancy
        .record_tool_call(NewToolCall::new("s1", "quote", Some(again), ExecutionStatus::Success))
        .await
        .unwrap();
    assert!(guard.redundancy.mark_as_redundant(&second.id, &first.id, "cache hit").await.unwrap());

    let stored = store.find_record_by_id(&second.id).await.unwrap().unwrap();
    assert_eq!(stored.execution_status, ExecutionStatus::Skipped);
    assert_eq!(stored.original_call_id.as_deref(), Some(first.id.as_str()));

    // Type-distinct params are a different call
    let as_string = json!({"symbol": "ACME", "range": "Q1"});
    assert!(!guard.redundancy.is_redundant(Some("s1"), Some("quote"), Some(&as_string)).await.unwrap());

    // Without the cache, the newest history row is the skipped duplicate
    assert_eq!(guard.redundancy.clear_session_cache("s1").await.unwrap(), 1);
    assert!(!guard.redundancy.is_redundant(Some("s1"), Some("quote"), Some(&params)).await.unwrap());
}

#[tokio::test]
async fn test_failed_call_is_retried_until_bound() {
    let (store, _temp) = create_test_store("rounds");
    let guard = ToolGuard::new(store.clone(), &GuardConfig::default());
    let params = json!({"report": "monthly"});

    let call = guard
        .redundancy
        .record_tool_call(
            NewToolCall::new("s1", "build_report", Some(params.clone()), ExecutionStatus::Failed)
                .tenant("t1")
                .error(Some("DataError"), "数据不完整: revenue column missing"),
        )
        .await
        .unwrap();

    // A failed prior call never suppresses the retry
    assert!(!guard.redundancy.is_redundant(Some("s1"), Some("build_report"), Some(&params)).await.unwrap());

    let mut strategies = Vec::new();
    while guard.corrections.should_retry(&call.id).await.unwrap() {
        let round = guard
            .corrections
            .create_correction_record(&call.id, Some("t1"), Some("s1"), Some("DataError"), Some("数据不完整"))
            .await
            .unwrap();
        assert_eq!(round.error_category, ErrorCategory::DataInsufficient);
        strategies.push(round.correction_strategy);
        guard
            .corrections
            .record_correction_outcome(&round.id, false, "FAILED")
            .await
            .unwrap();
    }

    assert_eq!(strategies.len() as u32, MAX_ROUNDS);
    assert!(strategies.iter().all(|s| *s == CorrectionStrategy::ReRetrieve));
    assert_eq!(guard.corrections.get_remaining_retries(&call.id).await.unwrap(), 0);

    let rounds = store.find_corrections_by_tool_call(&call.id).await.unwrap();
    let numbers: Vec<u32> = rounds.iter().map(|r| r.correction_rounds).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(rounds.iter().all(|r| r.final_status.as_deref() == Some("FAILED")));
}

#[tokio::test]
async fn test_reflection_history_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("reflections.db");
    let config = GuardConfig::default();

    let request = ReflectionRequest {
        tenant_id: Some("t1".to_string()),
        user_intent: "Book a table for two tomorrow".to_string(),
        tool_name: "reserve".to_string(),
        original_params: json!({"date": "tomorrow", "party": 2}),
        error_message: "invalid format for field 'date'".to_string(),
        verification: None,
        attempt_number: 0,
    };

    {
        let store: Arc<dyn GuardStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
        let client = CannedClient::new(&[
            r#"{"strategy": "FORMAT_FIX", "correctedParams": {"date": "2026-10-17", "party": 2}, "reflection": "Use an ISO date", "confidence": 0.9}"#,
        ]);
        let guard = ToolGuard::new(store.clone(), &config).with_reflection(store, client, &config);
        let reflector = guard.reflection.as_ref().unwrap();

        let decision = reflector.analyze_and_correct(&request).await.unwrap();
        assert!(decision.should_retry);
        assert_eq!(decision.corrected_params.unwrap()["date"], "2026-10-17");
    }

    let store: Arc<dyn GuardStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
    // No replies left: the completion fails and the attempt is still logged
    let guard = ToolGuard::new(store.clone(), &config).with_reflection(store.clone(), CannedClient::new(&[]), &config);
    let reflector = guard.reflection.as_ref().unwrap();

    let history = reflector.get_historical_reflections(Some("t1"), "reserve", 5).await.unwrap();
    assert!(history.contains("[SUCCESS]"));
    assert!(history.contains("Use an ISO date"));

    let decision = reflector.analyze_and_correct(&request).await.unwrap();
    assert!(!decision.should_retry);
    assert_eq!(decision.strategy, CorrectionStrategy::Abandon);

    let rows = store.find_reflections("reserve", Some("t1")).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_quick_recover_plan() {
    let (store, _temp) = create_test_store("recover");
    let guard = ToolGuard::new(store.clone(), &GuardConfig::default());
    let guard = ToolGuard {
        recovery: guard.recovery.clone().with_alternatives("flight_search", ["cached_fares"]),
        ..guard
    };

    let params = json!({"origin": "OSL", "departure_date": "17.10.2026", "carrier": ""});
    let call = guard
        .redundancy
        .record_tool_call(NewToolCall::new("s1", "flight_search", Some(params.clone()), ExecutionStatus::Success))
        .await
        .unwrap();
    guard
        .redundancy
        .record_failure(&call.id, ExecutionStatus::Timeout, None, "upstream timed out parsing date")
        .await
        .unwrap();

    assert!(guard.recovery.should_attempt_recovery(&call.id).await.unwrap());

    let plan = guard.recovery.quick_recover(&call.id, Some(&params)).await.unwrap().unwrap();
    assert!(plan.should_retry);
    assert_eq!(plan.retry_count, 1);
    assert_eq!(plan.alternatives, vec!["cached_fares".to_string()]);

    let fields: Vec<&str> = plan.parameter_fixes.iter().map(|f| f.field.as_str()).collect();
    assert!(fields.contains(&"carrier"));
    assert!(fields.contains(&"departure_date"));

    guard.redundancy.record_recovery(&call.id, "FULL_RETRY").await.unwrap();
    let stored = store.find_record_by_id(&call.id).await.unwrap().unwrap();
    assert!(stored.recovered);
    assert_eq!(stored.retry_count, 1);
}

#[tokio::test]
async fn test_expired_cache_sweep() {
    let (store, _temp) = create_test_store("sweep");
    let guard = ToolGuard::new(store, &GuardConfig::default());

    guard.redundancy.cache_result("s1", "a", None, json!(1), None, Some(0)).await.unwrap();
    guard.redundancy.cache_result("s2", "a", None, json!(2), None, Some(0)).await.unwrap();
    guard.redundancy.cache_result("s2", "b", None, json!(3), None, None).await.unwrap();

    assert_eq!(guard.redundancy.cleanup_expired_cache().await.unwrap(), 2);
    assert_eq!(guard.redundancy.get_cached_result("s2", "b", None).await.unwrap(), Some(json!(3)));
    assert_eq!(guard.redundancy.cleanup_expired_cache().await.unwrap(), 0);
}

#[tokio::test]
async fn test_colon_ids_and_huge_ttl_on_sqlite() {
    let (store, _temp) = create_test_store("isolation");
    let guard = ToolGuard::new(store, &GuardConfig::default());
    let params = json!({"q": 1});

    guard
        .redundancy
        .cache_result("s1:search", "x", Some(&params), json!("s1:search result"), None, Some(i64::MAX / 2))
        .await
        .unwrap();

    assert!(guard.redundancy.get_cached_result("s1", "search:x", Some(&params)).await.unwrap().is_none());
    assert!(!guard.redundancy.is_redundant(Some("s1"), Some("search:x"), Some(&params)).await.unwrap());

    // Clamped expiry survives the millisecond round trip and stays valid
    assert_eq!(
        guard.redundancy.get_cached_result("s1:search", "x", Some(&params)).await.unwrap(),
        Some(json!("s1:search result"))
    );
    assert_eq!(guard.redundancy.cleanup_expired_cache().await.unwrap(), 0);
}
