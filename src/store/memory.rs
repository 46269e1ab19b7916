use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TaskRecord;
use crate::traits::TaskStore;

/// Map-backed store for tests and hosts that don't need durability.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn persist(&self, record: &TaskRecord) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn restore_all(&self) -> anyhow::Result<Vec<TaskRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn remove(&self, task_id: &str) -> anyhow::Result<()> {
        self.records.write().await.remove(task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::task::{Task, TaskSpec};

    #[tokio::test]
    async fn last_write_wins_per_id() {
        let store = MemoryTaskStore::new();
        let task = Task::new(TaskSpec::new("goal"), 20, 1_000);
        let caps = PersistenceConfig::default();

        let mut record = TaskRecord::from_task(&task, &caps);
        store.persist(&record).await.unwrap();
        record.turn_count = 7;
        store.persist(&record).await.unwrap();

        let restored = store.restore_all().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].turn_count, 7);

        store.remove(&record.id).await.unwrap();
        assert!(store.restore_all().await.unwrap().is_empty());
    }
}
