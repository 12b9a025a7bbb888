pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::Database;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{Order, Position, PositionFilter, Workload};

/// Persistence is the authoritative store for positions; runners re-read it
/// on every action tick instead of caching.
#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn create_position(&self, position: &Position) -> Result<()>;

    async fn update_position(&self, position: &Position) -> Result<()>;

    /// Positions matching the filter, each with its orders attached and
    /// sorted by order time ascending.
    async fn positions(&self, filter: PositionFilter) -> Result<Vec<Position>>;

    async fn positions_count(&self, filter: PositionFilter) -> Result<i64>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, order: &Order) -> Result<()>;

    async fn update_order(&self, order: &Order) -> Result<()>;
}

#[async_trait]
pub trait WorkloadRepository: Send + Sync {
    /// Enumerates the authoritative workload set, accounts attached.
    async fn workloads(&self) -> Result<Vec<Workload>>;

    async fn create_workload(&self, workload: &Workload) -> Result<()>;
}
