//! In-memory store for development and testing
//!
//! [`InMemoryExecutionStore`] is the reference implementation of
//! [`ExecutionStore`]: thread-safe maps behind `tokio::sync::RwLock`, no
//! external dependencies, microsecond latency, data gone on restart. Use it
//! for tests and single-process setups; production backends implement the
//! same trait over a real database.

use crate::error::{Result, StoreError};
use crate::models::{
    ApprovalRequestRecord, ApprovalStatus, ExecutionFilter, ExecutionRecordStatus,
    ExecutionStats, NodeExecutionRecord, ProcessExecutionRecord,
};
use crate::traits::ExecutionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    executions: HashMap<String, ProcessExecutionRecord>,
    node_executions: HashMap<String, Vec<NodeExecutionRecord>>,
    approvals: HashMap<String, ApprovalRequestRecord>,
    execution_numbers: HashMap<String, u64>,
}

/// Thread-safe in-memory [`ExecutionStore`]
#[derive(Default)]
pub struct InMemoryExecutionStore {
    inner: RwLock<Inner>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything (test isolation)
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        *inner = Inner::default();
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, record: ProcessExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.executions.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "execution {} already exists",
                record.id
            )));
        }
        inner.executions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ProcessExecutionRecord>> {
        Ok(self.inner.read().await.executions.get(execution_id).cloned())
    }

    async fn get_execution_by_correlation(
        &self,
        org_id: &str,
        correlation_id: &str,
    ) -> Result<Option<ProcessExecutionRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .executions
            .values()
            .find(|record| {
                record.org_id == org_id
                    && record.correlation_id.as_deref() == Some(correlation_id)
            })
            .cloned())
    }

    async fn update_execution(&self, mut record: ProcessExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.executions.contains_key(&record.id) {
            return Err(StoreError::NotFound(format!("execution {}", record.id)));
        }
        record.updated_at = Some(Utc::now());
        inner.executions.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.executions.remove(execution_id).is_none() {
            return Err(StoreError::NotFound(format!("execution {execution_id}")));
        }
        inner.node_executions.remove(execution_id);
        inner
            .approvals
            .retain(|_, approval| approval.process_execution_id != execution_id);
        Ok(())
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ProcessExecutionRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .executions
            .values()
            .filter(|record| {
                filter
                    .org_id
                    .as_ref()
                    .map(|org| &record.org_id == org)
                    .unwrap_or(true)
                    && filter
                        .agent_id
                        .as_ref()
                        .map(|agent| &record.agent_id == agent)
                        .unwrap_or(true)
                    && filter
                        .status
                        .map(|status| record.status == status)
                        .unwrap_or(true)
                    && filter
                        .parent_execution_id
                        .as_ref()
                        .map(|parent| record.parent_execution_id.as_ref() == Some(parent))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn next_execution_number(&self, agent_id: &str) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let counter = inner
            .execution_numbers
            .entry(agent_id.to_string())
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn list_due_resumptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProcessExecutionRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .executions
            .values()
            .filter(|record| {
                record.status == ExecutionRecordStatus::Waiting
                    && record
                        .extra_metadata
                        .get("wake_at")
                        .and_then(Value::as_str)
                        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                        .map(|wake| wake.with_timezone(&Utc) <= now)
                        .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn execution_stats(
        &self,
        org_id: &str,
        agent_id: Option<&str>,
    ) -> Result<ExecutionStats> {
        let inner = self.inner.read().await;
        let mut stats = ExecutionStats::default();
        let mut durations = Vec::new();

        for record in inner.executions.values() {
            if record.org_id != org_id {
                continue;
            }
            if let Some(agent) = agent_id {
                if record.agent_id != agent {
                    continue;
                }
            }
            stats.total += 1;
            stats.total_tokens += record.tokens_used;
            match record.status {
                ExecutionRecordStatus::Completed => stats.completed += 1,
                ExecutionRecordStatus::Failed | ExecutionRecordStatus::TimedOut => {
                    stats.failed += 1
                }
                ExecutionRecordStatus::Waiting => stats.waiting += 1,
                ExecutionRecordStatus::Running | ExecutionRecordStatus::Pending => {
                    stats.running += 1
                }
                ExecutionRecordStatus::Cancelled => stats.cancelled += 1,
                ExecutionRecordStatus::Paused => stats.waiting += 1,
            }
            if let Some(duration) = record.total_duration_ms {
                durations.push(duration);
            }
        }
        if !durations.is_empty() {
            stats.avg_duration_ms = durations.iter().sum::<f64>() / durations.len() as f64;
        }
        Ok(stats)
    }

    async fn create_node_execution(&self, record: NodeExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .node_executions
            .entry(record.process_execution_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn update_node_execution(&self, record: NodeExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(records) = inner
            .node_executions
            .get_mut(&record.process_execution_id)
        else {
            return Err(StoreError::NotFound(format!(
                "node executions for {}",
                record.process_execution_id
            )));
        };
        let Some(slot) = records.iter_mut().find(|r| r.id == record.id) else {
            return Err(StoreError::NotFound(format!("node execution {}", record.id)));
        };
        *slot = record;
        Ok(())
    }

    async fn list_node_executions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<NodeExecutionRecord>> {
        let inner = self.inner.read().await;
        let mut records = inner
            .node_executions
            .get(execution_id)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|r| r.execution_order);
        Ok(records)
    }

    async fn create_approval(&self, record: ApprovalRequestRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.approvals.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!(
                "approval {} already exists",
                record.id
            )));
        }
        inner.approvals.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequestRecord>> {
        Ok(self.inner.read().await.approvals.get(approval_id).cloned())
    }

    async fn update_approval(&self, mut record: ApprovalRequestRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.approvals.contains_key(&record.id) {
            return Err(StoreError::NotFound(format!("approval {}", record.id)));
        }
        record.updated_at = Some(Utc::now());
        inner.approvals.insert(record.id.clone(), record);
        Ok(())
    }

    async fn pending_approvals_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ApprovalRequestRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .approvals
            .values()
            .filter(|record| {
                record.process_execution_id == execution_id && record.is_pending()
            })
            .cloned()
            .collect())
    }

    async fn pending_approvals_for_user(
        &self,
        org_id: &str,
        user_id: &str,
        role_ids: &[String],
        group_ids: &[String],
    ) -> Result<Vec<ApprovalRequestRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .approvals
            .values()
            .filter(|record| {
                record.org_id == org_id
                    && record.is_pending()
                    && record.is_visible_to(user_id, role_ids, group_ids)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn expire_due_approvals(
        &self,
        org_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequestRecord>> {
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for record in inner.approvals.values_mut() {
            if record.org_id != org_id || !record.is_expired(now) {
                continue;
            }
            if !record.escalated && !record.escalation_user_ids.is_empty() {
                record.status = ApprovalStatus::Escalated;
                record.escalated = true;
                record.escalated_at = Some(now);
                record.assigned_user_ids = record.escalation_user_ids.clone();
                record.assignee_type = "user".to_string();
                // An escalated request gets a fresh deadline window
                if let (Some(deadline), Some(hours)) =
                    (record.deadline_at, record.escalate_after_hours)
                {
                    record.deadline_at = Some(deadline + chrono::Duration::hours(hours as i64));
                }
            } else {
                record.status = ApprovalStatus::Expired;
            }
            record.updated_at = Some(now);
            expired.push(record.clone());
        }
        Ok(expired)
    }
}
