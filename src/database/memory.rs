#![allow(dead_code)]
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{OrderRepository, PositionRepository, WorkloadRepository};
use crate::types::{Order, Position, PositionFilter, Workload};

/// In-memory implementation of the persistence traits. Backs the test suite
/// and dry runs; mirrors the SQLite semantics including order-by-time
/// attachment of orders to positions.
#[derive(Default)]
pub struct MemoryStore {
    positions: Mutex<Vec<Position>>,
    orders: Mutex<HashMap<Uuid, Order>>,
    workloads: Mutex<Vec<Workload>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PositionRepository for MemoryStore {
    async fn create_position(&self, position: &Position) -> Result<()> {
        self.positions
            .lock()
            .expect("memory store lock poisoned")
            .push(position.clone());
        Ok(())
    }

    async fn update_position(&self, position: &Position) -> Result<()> {
        let mut positions = self.positions.lock().expect("memory store lock poisoned");

        let stored = positions
            .iter_mut()
            .find(|p| p.id == position.id)
            .ok_or_else(|| anyhow!("no such position: [{}]", position.id))?;
        stored.status = position.status;

        Ok(())
    }

    async fn positions(&self, filter: PositionFilter) -> Result<Vec<Position>> {
        let positions = self.positions.lock().expect("memory store lock poisoned");
        let orders = self.orders.lock().expect("memory store lock poisoned");

        let mut matching: Vec<Position> = positions
            .iter()
            .filter(|p| p.workload_id == filter.workload_id && p.status == filter.status)
            .cloned()
            .collect();

        for position in &mut matching {
            position.orders = orders
                .values()
                .filter(|o| o.position_id == position.id)
                .cloned()
                .collect();
            position.orders.sort_by_key(|o| o.time);
        }

        Ok(matching)
    }

    async fn positions_count(&self, filter: PositionFilter) -> Result<i64> {
        let positions = self.positions.lock().expect("memory store lock poisoned");

        Ok(positions
            .iter()
            .filter(|p| p.workload_id == filter.workload_id && p.status == filter.status)
            .count() as i64)
    }
}

#[async_trait]
impl OrderRepository for MemoryStore {
    async fn create_order(&self, order: &Order) -> Result<()> {
        self.orders
            .lock()
            .expect("memory store lock poisoned")
            .insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.lock().expect("memory store lock poisoned");

        let stored = orders
            .get_mut(&order.id)
            .ok_or_else(|| anyhow!("no such order: [{}]", order.id))?;
        stored.executed = order.executed;

        Ok(())
    }
}

#[async_trait]
impl WorkloadRepository for MemoryStore {
    async fn workloads(&self) -> Result<Vec<Workload>> {
        Ok(self
            .workloads
            .lock()
            .expect("memory store lock poisoned")
            .clone())
    }

    async fn create_workload(&self, workload: &Workload) -> Result<()> {
        self.workloads
            .lock()
            .expect("memory store lock poisoned")
            .push(workload.clone());
        Ok(())
    }
}
