//! Write-time dedup, consolidation and duplicate scanning

mod common;

use common::{
    create_memory_service, create_memory_service_with, create_test_db, insert_memory, sample_memory,
};
use steward_core::config::MemoryConfig;
use steward_core::types::{StoreAction, REL_SUPERSEDES};
use steward_core::{
    MemoryId, MemoryService, MemoryType, MergeStrategy, StoreRequest, SuggestionStatus,
};

fn request(title: &str, content: &str, project: Option<&str>, importance: f32) -> StoreRequest {
    StoreRequest {
        title: title.to_string(),
        content: content.to_string(),
        project_id: project.map(String::from),
        importance,
        tags: vec!["test".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_store_new_memory_applies_ttl_or_promotes() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);

    let short = service
        .store(request("Scratch note", "temporary idea", Some("p"), 0.3))
        .await
        .unwrap();
    assert_eq!(short.action, StoreAction::Created);
    assert_eq!(short.memory.ttl_seconds, Some(86_400));
    assert!(short.memory.expires_at.is_some());
    assert_eq!(short.memory.memory_type, MemoryType::General);

    let important = service
        .store(request("Release policy", "never ship on fridays", Some("p"), 0.9))
        .await
        .unwrap();
    assert_eq!(important.action, StoreAction::Created);
    assert!(important.memory.ttl_seconds.is_none());
    assert!(important.memory.expires_at.is_none());
}

#[tokio::test]
async fn test_store_near_duplicate_merges_into_existing() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);

    let first = service
        .store(request("Pool sizing", "use eight connections per worker", Some("p"), 0.5))
        .await
        .unwrap();
    let second = service
        .store(request("Pool sizing", "use eight connections per worker", Some("p"), 0.6))
        .await
        .unwrap();

    assert_eq!(second.action, StoreAction::Updated);
    assert_eq!(second.memory.id, first.memory.id);
    assert_eq!(second.memory.importance, 0.6);
    assert!(second.memory.merged_from.contains(&first.memory.id));

    let log = service
        .consolidation_log(Some(first.memory.id), 10, 0)
        .await
        .unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].performed_by, "system");
    assert!(log[0].similarity_score.unwrap() >= 0.92);
}

#[tokio::test]
async fn test_store_similar_memory_reports_suggestions() {
    let (_dir, db) = create_test_db().await;
    let mut config = MemoryConfig::default();
    config.consolidation.suggest_threshold = 0.3;
    let service = create_memory_service_with(&db, config);

    service
        .store(request("alpha beta", "gamma delta", Some("p"), 0.5))
        .await
        .unwrap();
    let result = service
        .store(request("alpha beta", "omega sigma", Some("p"), 0.5))
        .await
        .unwrap();
    assert_eq!(result.action, StoreAction::CreatedWithSuggestions);
    assert_eq!(result.suggestions.len(), 1);
}

#[tokio::test]
async fn test_dedup_stays_within_project_scope() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);

    service
        .store(request("Pool sizing", "use eight connections", Some("p1"), 0.5))
        .await
        .unwrap();
    let other = service
        .store(request("Pool sizing", "use eight connections", Some("p2"), 0.5))
        .await
        .unwrap();
    assert_eq!(other.action, StoreAction::Created);
}

#[tokio::test]
async fn test_consolidate_marks_sources_replaced_and_links() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);

    let target = sample_memory("Cache policy", "use LRU", Some("p"));
    let source = sample_memory("Cache eviction", "prefer LRU eviction", Some("p"));
    insert_memory(&service, &target).await;
    insert_memory(&service, &source).await;

    let merged = service
        .consolidate_memories(
            target.id,
            &[source.id, target.id, MemoryId::new()],
            MergeStrategy::Append,
            "steward:auto_merge",
        )
        .await
        .unwrap();
    assert_eq!(merged.id, target.id);
    assert!(merged.is_active());
    assert_eq!(merged.merged_from, vec![source.id]);
    assert!(merged.content.contains("use LRU"));
    assert!(merged.content.contains("prefer LRU eviction"));

    let replaced = service.get(source.id).await.unwrap().unwrap();
    assert_eq!(replaced.replaced_by(), Some(target.id));

    let rels = service.repository().relationships_for(target.id).await.unwrap();
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].relationship, REL_SUPERSEDES);
    assert_eq!(rels[0].to_memory_id, source.id);
    assert_eq!(rels[0].strength, 1.0);

    let log = service.consolidation_log(Some(target.id), 10, 0).await.unwrap();
    assert_eq!(log[0].performed_by, "steward:auto_merge");
    assert_eq!(log[0].source_ids, vec![source.id]);

    // Replaced memories cannot be merge targets
    let err = service
        .consolidate_memories(source.id, &[target.id], MergeStrategy::Append, "")
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_consolidate_without_usable_sources_is_a_no_op() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);
    let target = sample_memory("Solo", "only one", None);
    insert_memory(&service, &target).await;

    let result = service
        .consolidate_memories(target.id, &[target.id], MergeStrategy::SmartMerge, "")
        .await
        .unwrap();
    assert_eq!(result.content, "only one");
    assert!(service.consolidation_log(None, 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_find_similar_excludes_self() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);
    let a = sample_memory("Retry budget", "three attempts then dead letter", Some("p"));
    let b = sample_memory("Retry budget", "three attempts then dead letter", Some("p"));
    insert_memory(&service, &a).await;
    insert_memory(&service, &b).await;

    let similar = service.find_similar_to(a.id, 0.0, 5).await.unwrap();
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].memory.id, b.id);
}

#[tokio::test]
async fn test_scan_creates_one_suggestion_per_pair() {
    let (_dir, db) = create_test_db().await;
    let service = create_memory_service(&db);
    let a = sample_memory("Deploy window", "deploy tuesdays only", Some("p"));
    let b = sample_memory("Deploy window", "deploy tuesdays only", Some("p"));
    let elsewhere = sample_memory("Deploy window", "deploy tuesdays only", Some("q"));
    insert_memory(&service, &a).await;
    insert_memory(&service, &b).await;
    insert_memory(&service, &elsewhere).await;

    assert_eq!(service.scan_for_duplicates().await.unwrap(), 1);
    // A second scan raises similarity at most; it never duplicates rows
    service.scan_for_duplicates().await.unwrap();

    let (pending, total) = service
        .get_suggestions(None, SuggestionStatus::Pending, 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(pending[0].project_id.as_deref(), Some("p"));
    assert!(pending[0].memory_a_id.to_string() < pending[0].memory_b_id.to_string());

    assert!(service
        .update_suggestion_status(pending[0].id, SuggestionStatus::Dismissed)
        .await
        .unwrap());
    let (dismissed, _) = service
        .get_suggestions(None, SuggestionStatus::Dismissed, 10, 0)
        .await
        .unwrap();
    assert!(dismissed[0].resolved_at.is_some());
}
