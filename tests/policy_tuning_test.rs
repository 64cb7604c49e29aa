//! Self-learning tune cycle and policy rollback through the manager

mod common;

use common::{create_memory_service, create_test_db, test_steward_config};
use std::sync::Arc;
use steward_core::steward::types::JOB_TYPE_POLICY_TUNE;
use steward_core::steward::RunFilters;
use steward_core::storage::consolidation::ConsolidationRepository;
use steward_core::types::DuplicatePair;
use steward_core::{Database, Manager, MemoryId, MemoryService, StewardError, SuggestionStatus};

async fn seed_dismissed_suggestions(db: &Database, count: usize) {
    let repo = ConsolidationRepository::new(db.clone());
    for _ in 0..count {
        repo.upsert_suggestion(&DuplicatePair::new(
            MemoryId::new(),
            MemoryId::new(),
            0.8,
            Some("p".to_string()),
        ))
        .await
        .unwrap();
    }
    let (pending, _) = repo
        .list_suggestions(None, SuggestionStatus::Pending, 100, 0)
        .await
        .unwrap();
    for suggestion in pending {
        repo.update_suggestion_status(suggestion.id, SuggestionStatus::Dismissed)
            .await
            .unwrap();
    }
}

fn self_learning_manager(db: &Database, min_sample_size: i64) -> Manager {
    let mut config = test_steward_config();
    config.self_learn.enabled = true;
    config.self_learn.min_sample_size = min_sample_size;
    Manager::new(
        db.clone(),
        create_memory_service(db) as Arc<dyn MemoryService>,
        config,
        None,
    )
}

#[tokio::test]
async fn test_low_acceptance_raises_merge_threshold() {
    let (_dir, db) = create_test_db().await;
    seed_dismissed_suggestions(&db, 12).await;
    let manager = self_learning_manager(&db, 1);

    manager.run_once().await.unwrap();

    let runs = manager
        .list_runs(RunFilters {
            job_type: Some(JOB_TYPE_POLICY_TUNE.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0].output_snapshot.as_ref().unwrap()["decision"],
        "policy_updated"
    );

    let changes = manager
        .list_policy_changes(Some("auto_merge_threshold".to_string()), 0, 0)
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].changed_by, "steward:self_learn");
    assert_eq!(changes[0].prior_value, Some(0.92));
    assert!((changes[0].new_value.unwrap() - 0.93).abs() < 1e-9);
    assert_eq!(changes[0].evidence["suggest_total"], 12);

    let status = manager.status().await;
    assert!((status.auto_merge_threshold - 0.93).abs() < 1e-9);

    // The evaluation window has not elapsed, so no second tune is queued
    manager.run_once().await.unwrap();
    let changes = manager.list_policy_changes(None, 0, 0).await.unwrap();
    assert_eq!(changes.len(), 1);
}

#[tokio::test]
async fn test_rollback_restores_prior_value() {
    let (_dir, db) = create_test_db().await;
    seed_dismissed_suggestions(&db, 12).await;
    let manager = self_learning_manager(&db, 1);
    manager.run_once().await.unwrap();

    let tuned = manager
        .list_policy_changes(Some("auto_merge_threshold".to_string()), 1, 0)
        .await
        .unwrap()
        .remove(0);

    let rollback = manager.rollback_policy("auto_merge_threshold").await.unwrap();
    assert_eq!(rollback.rollback_of_id, Some(tuned.id));
    assert_eq!(rollback.changed_by, "steward:rollback");
    assert_eq!(rollback.prior_value, tuned.new_value);
    assert_eq!(rollback.new_value, Some(0.92));
    assert_eq!(manager.policy().snapshot().await.auto_merge_threshold, 0.92);

    let history = manager
        .list_policy_changes(Some("auto_merge_threshold".to_string()), 0, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, rollback.id);
}

#[tokio::test]
async fn test_rollback_errors() {
    let (_dir, db) = create_test_db().await;
    let manager = self_learning_manager(&db, 1);

    let err = manager.rollback_policy("merge_everything").await.unwrap_err();
    assert!(matches!(err, StewardError::Validation(_)));

    let err = manager
        .rollback_policy("derivation.min_novelty")
        .await
        .unwrap_err();
    assert!(matches!(err, StewardError::NotFound(_)));
}

#[tokio::test]
async fn test_insufficient_sample_leaves_policy_alone() {
    let (_dir, db) = create_test_db().await;
    seed_dismissed_suggestions(&db, 12).await;
    let manager = self_learning_manager(&db, 100);

    manager.run_once().await.unwrap();

    let runs = manager.list_runs(RunFilters::default()).await.unwrap();
    assert_eq!(runs.len(), 1);
    let output = runs[0].output_snapshot.as_ref().unwrap();
    assert_eq!(output["decision"], "no_policy_change");
    assert_eq!(output["suggestions_24h"], 12);
    assert!(manager.list_policy_changes(None, 0, 0).await.unwrap().is_empty());
    assert_eq!(manager.status().await.auto_merge_threshold, 0.92);
}

#[tokio::test]
async fn test_tuned_threshold_survives_restart() {
    let (_dir, db) = create_test_db().await;
    seed_dismissed_suggestions(&db, 12).await;
    let first = self_learning_manager(&db, 1);
    first.run_once().await.unwrap();
    assert!((first.status().await.auto_merge_threshold - 0.93).abs() < 1e-9);
    drop(first);

    let restarted = self_learning_manager(&db, 1);
    let values = restarted.reload_policy().await.unwrap();
    assert!((values.auto_merge_threshold - 0.93).abs() < 1e-9);
    assert!((restarted.status().await.auto_merge_threshold - 0.93).abs() < 1e-9);
    // Keys without history keep their configured values
    assert_eq!(values.derivation_min_confidence, 0.8);
    assert_eq!(values.derivation_min_novelty, 0.2);
}

#[tokio::test]
async fn test_rollback_by_another_process_applies_on_next_tick() {
    let (_dir, db) = create_test_db().await;
    seed_dismissed_suggestions(&db, 12).await;
    let daemon = self_learning_manager(&db, 1);
    daemon.run_once().await.unwrap();
    assert!((daemon.status().await.auto_merge_threshold - 0.93).abs() < 1e-9);

    let operator = self_learning_manager(&db, 1);
    operator.rollback_policy("auto_merge_threshold").await.unwrap();
    assert!((daemon.status().await.auto_merge_threshold - 0.93).abs() < 1e-9);

    daemon.run_once().await.unwrap();
    assert_eq!(daemon.status().await.auto_merge_threshold, 0.92);
    let latest = daemon
        .list_policy_changes(Some("auto_merge_threshold".to_string()), 1, 0)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(latest.new_value, Some(0.92));
}
