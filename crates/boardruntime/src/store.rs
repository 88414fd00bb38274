use async_trait::async_trait;
use boardcore::{Board, BoardId, Execution, ExecutionId, LogEntry, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence for execution records.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Upsert by execution id. Rewriting a terminal record with different
    /// content is rejected.
    async fn update(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn append_log_entry(
        &self,
        execution_id: ExecutionId,
        entry: &LogEntry,
    ) -> Result<(), StoreError>;

    async fn get(&self, execution_id: ExecutionId) -> Result<Execution, StoreError>;
}

/// Source of board snapshots.
#[async_trait]
pub trait BoardRepository: Send + Sync {
    async fn load(&self, board_id: BoardId) -> Result<Board, StoreError>;

    /// Bump the board's execution counter.
    async fn record_execution(&self, _board_id: BoardId) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-process execution store. Readers get clones, so they never observe a
/// record mid-update.
#[derive(Default, Clone)]
pub struct InMemoryExecutionStore {
    records: Arc<RwLock<HashMap<ExecutionId, Execution>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn list(&self) -> Vec<Execution> {
        let records = self.records.read().await;
        let mut all: Vec<Execution> = records.values().cloned().collect();
        all.sort_by_key(|e| e.started_at);
        all
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn update(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&execution.id) {
            if existing.is_terminal() && existing != execution {
                return Err(StoreError::TerminalRecord(execution.id));
            }
        }
        records.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn append_log_entry(
        &self,
        execution_id: ExecutionId,
        entry: &LogEntry,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&execution_id)
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;
        if record.is_terminal() {
            return Err(StoreError::TerminalRecord(execution_id));
        }
        // sequences only grow, so a replayed append is a no-op
        let newer = record
            .execution_log
            .last()
            .map_or(true, |last| entry.sequence > last.sequence);
        if newer {
            record.execution_log.push(entry.clone());
        }
        Ok(())
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Execution, StoreError> {
        let records = self.records.read().await;
        records
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
    }
}

/// In-process board repository.
#[derive(Default, Clone)]
pub struct InMemoryBoardRepository {
    boards: Arc<RwLock<HashMap<BoardId, Board>>>,
}

impl InMemoryBoardRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a board definition.
    pub async fn save(&self, board: Board) {
        let mut boards = self.boards.write().await;
        boards.insert(board.id, board);
    }
}

#[async_trait]
impl BoardRepository for InMemoryBoardRepository {
    async fn load(&self, board_id: BoardId) -> Result<Board, StoreError> {
        let boards = self.boards.read().await;
        boards
            .get(&board_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(board_id.to_string()))
    }

    async fn record_execution(&self, board_id: BoardId) -> Result<(), StoreError> {
        let mut boards = self.boards.write().await;
        let board = boards
            .get_mut(&board_id)
            .ok_or_else(|| StoreError::NotFound(board_id.to_string()))?;
        board.execution_count += 1;
        Ok(())
    }
}
