//! Contract tests run against both repository implementations.

use std::sync::Arc;

use tether::error::SessionError;
use tether::session::{script_hash, BackendKind, Message, Role, ScriptProvenance, SessionRecord, SessionStatus};
use tether::store::{MemoryRepository, SessionRepository, SqliteRepository};

async fn memory_repo() -> Arc<dyn SessionRepository> {
    Arc::new(MemoryRepository::new())
}

async fn sqlite_repo() -> Arc<dyn SessionRepository> {
    Arc::new(
        SqliteRepository::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite"),
    )
}

fn sample_record(path: &str) -> SessionRecord {
    let mut record = SessionRecord::new(path, BackendKind::Api);
    record.meta.model_id = Some("deepseek-chat".into());
    record.meta.max_turns = 24;
    record.push_message(Message::text(Role::User, "hello"));
    record.push_message(Message::text(Role::Assistant, "hi there"));
    record
}

async fn check_create_then_get(repo: Arc<dyn SessionRepository>) {
    let record = sample_record("/tmp/repo/one.md");
    repo.create(&record).await.unwrap();

    let loaded = repo.get_by_id(&record.id).await.unwrap().unwrap();
    assert_eq!(loaded, record);
    assert!(repo.get_by_id("missing").await.unwrap().is_none());
}

async fn check_duplicate_create_rejected(repo: Arc<dyn SessionRepository>) {
    let record = sample_record("/tmp/repo/dup.md");
    repo.create(&record).await.unwrap();
    let err = repo.create(&record).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyExists(_)));
}

async fn check_update_roundtrip(repo: Arc<dyn SessionRepository>) {
    let mut record = sample_record("/tmp/repo/upd.md");
    repo.create(&record).await.unwrap();

    record.status = SessionStatus::WaitingConfirmation;
    record.meta.turns_used = 3;
    record.push_message(Message::text(Role::Assistant, "one more thing"));
    repo.update(&record).await.unwrap();

    let loaded = repo.get_by_id(&record.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, SessionStatus::WaitingConfirmation);
    assert_eq!(loaded.meta.turns_used, 3);
    assert_eq!(loaded.messages.len(), 3);
}

async fn check_update_missing_rejected(repo: Arc<dyn SessionRepository>) {
    let record = sample_record("/tmp/repo/ghost.md");
    let err = repo.update(&record).await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

async fn check_delete(repo: Arc<dyn SessionRepository>) {
    let record = sample_record("/tmp/repo/del.md");
    repo.create(&record).await.unwrap();
    repo.delete(&record.id).await.unwrap();
    assert!(repo.get_by_id(&record.id).await.unwrap().is_none());
}

async fn check_list_ordered_by_creation(repo: Arc<dyn SessionRepository>) {
    let mut first = sample_record("/tmp/repo/l1.md");
    first.created_at = 100;
    let mut second = sample_record("/tmp/repo/l2.md");
    second.created_at = 200;
    // Insert newest first to prove the ordering comes from the store.
    repo.create(&second).await.unwrap();
    repo.create(&first).await.unwrap();

    let all = repo.list().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, first.id);
    assert_eq!(all[1].id, second.id);
}

async fn check_script_lookups(repo: Arc<dyn SessionRepository>) {
    let content = "print('hello')";
    let mut record = sample_record("/tmp/repo/script.md");
    record.script = Some(ScriptProvenance {
        path: record.path.clone(),
        content_hash: script_hash(content),
        modified_at: 1_700_000_000,
        snapshot: Some(content.to_string()),
    });
    repo.create(&record).await.unwrap();

    let by_hash = repo.find_by_script_hash(&script_hash(content)).await.unwrap();
    assert_eq!(by_hash.len(), 1);
    assert_eq!(by_hash[0].id, record.id);

    // Empty or unknown hashes are empty results, not errors.
    assert!(repo.find_by_script_hash("").await.unwrap().is_empty());
    assert!(repo.find_by_script_hash("feedface").await.unwrap().is_empty());

    let by_path = repo.find_by_script_path(&record.path).await.unwrap();
    assert_eq!(by_path.unwrap().id, record.id);
    assert!(repo
        .find_by_script_path("/tmp/repo/nowhere.md")
        .await
        .unwrap()
        .is_none());
}

macro_rules! repo_contract_tests {
    ($module:ident, $factory:ident) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn test_create_then_get() {
                check_create_then_get($factory().await).await;
            }

            #[tokio::test]
            async fn test_duplicate_create_rejected() {
                check_duplicate_create_rejected($factory().await).await;
            }

            #[tokio::test]
            async fn test_update_roundtrip() {
                check_update_roundtrip($factory().await).await;
            }

            #[tokio::test]
            async fn test_update_missing_rejected() {
                check_update_missing_rejected($factory().await).await;
            }

            #[tokio::test]
            async fn test_delete() {
                check_delete($factory().await).await;
            }

            #[tokio::test]
            async fn test_list_ordered_by_creation() {
                check_list_ordered_by_creation($factory().await).await;
            }

            #[tokio::test]
            async fn test_script_lookups() {
                check_script_lookups($factory().await).await;
            }
        }
    };
}

repo_contract_tests!(memory, memory_repo);
repo_contract_tests!(sqlite, sqlite_repo);
