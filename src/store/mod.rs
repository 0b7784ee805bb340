//! Session repository
//!
//! Durable store keyed by session id. The pool and queue manager only ever
//! talk to the trait; the sqlite implementation is the production store and
//! the in-memory one backs tests and embedding.

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use crate::error::Result;
use crate::session::SessionRecord;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Fails `AlreadyExists` when the id is taken.
    async fn create(&self, record: &SessionRecord) -> Result<()>;

    /// Fails `NotFound` when the id is absent.
    async fn update(&self, record: &SessionRecord) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    async fn get_by_id(&self, id: &str) -> Result<Option<SessionRecord>>;

    async fn list(&self) -> Result<Vec<SessionRecord>>;

    /// Empty vec for an unknown or empty hash, never an error.
    async fn find_by_script_hash(&self, hash: &str) -> Result<Vec<SessionRecord>>;

    async fn find_by_script_path(&self, path: &str) -> Result<Option<SessionRecord>>;
}
