//! Client Surface: typed wrappers over the scheduler's unary RPCs for
//! scheduling, querying, signalling, and terminating instances.
//!
//! The connection-construction shape (parse a URL, carry bearer-token
//! metadata) follows the same pattern as the worker's channel setup; the
//! operation surface itself is scheduler-agnostic rather than tied to any
//! one backend's gRPC service.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::history::FailureDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Terminated,
    ContinuedAsNew,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OrchestrationMetadata {
    pub instance_id: String,
    pub name: String,
    pub status: OrchestrationStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_updated_at: chrono::DateTime<chrono::Utc>,
    pub custom_status: Option<Value>,
    pub output: Option<Value>,
    pub failure: Option<FailureDetail>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("wait for completion timed out")]
    WaitTimeout,

    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Scheduling and instance-management operations, independent of the
/// streaming work-item channel the dispatchers use (Client
/// Surface is described as "only to the precision needed to drive the
/// worker" — unary RPCs, not the bidirectional stream).
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn schedule_new_orchestration(
        &self,
        name: &str,
        instance_id: Option<&str>,
        input: Value,
    ) -> Result<String, ClientError>;

    async fn wait_for_start(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError>;

    async fn wait_for_completion(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError>;

    async fn get_status(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError>;

    async fn raise_event(&self, instance_id: &str, name: &str, input: Value) -> Result<(), ClientError>;

    async fn terminate(&self, instance_id: &str, reason: Option<&str>) -> Result<(), ClientError>;

    async fn suspend(&self, instance_id: &str, reason: Option<&str>) -> Result<(), ClientError>;

    async fn resume(&self, instance_id: &str, reason: Option<&str>) -> Result<(), ClientError>;

    async fn purge(&self, instance_id: &str) -> Result<(), ClientError>;

    async fn signal_entity(&self, entity_id: &str, operation: &str, input: Value) -> Result<(), ClientError>;

    async fn call_entity(&self, entity_id: &str, operation: &str, input: Value) -> Result<Value, ClientError>;
}

/// Typed convenience wrapper over [`SchedulerClient`]: the schedule/wait
/// pair most callers want, with serialization folded in.
pub struct DurableTaskClient<C: SchedulerClient> {
    inner: C,
}

impl<C: SchedulerClient> DurableTaskClient<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub async fn schedule<I: Serialize>(
        &self,
        name: &str,
        instance_id: Option<&str>,
        input: &I,
    ) -> Result<String, ClientError> {
        let input = serde_json::to_value(input).map_err(ClientError::Serialization)?;
        self.inner.schedule_new_orchestration(name, instance_id, input).await
    }

    pub async fn wait_for_completion<O: DeserializeOwned>(
        &self,
        instance_id: &str,
    ) -> Result<Result<O, FailureDetail>, ClientError> {
        let metadata = self.inner.wait_for_completion(instance_id).await?;
        match (metadata.output, metadata.failure) {
            (Some(output), _) => {
                let typed = serde_json::from_value(output).map_err(ClientError::Serialization)?;
                Ok(Ok(typed))
            }
            (None, Some(failure)) => Ok(Err(failure)),
            (None, None) => Err(ClientError::NotFound(instance_id.to_string())),
        }
    }

    pub async fn raise_event<I: Serialize>(&self, instance_id: &str, name: &str, input: &I) -> Result<(), ClientError> {
        let input = serde_json::to_value(input).map_err(ClientError::Serialization)?;
        self.inner.raise_event(instance_id, name, input).await
    }

    pub async fn call_entity<I: Serialize, O: DeserializeOwned>(
        &self,
        entity_id: &str,
        operation: &str,
        input: &I,
    ) -> Result<O, ClientError> {
        let input = serde_json::to_value(input).map_err(ClientError::Serialization)?;
        let result = self.inner.call_entity(entity_id, operation, input).await?;
        serde_json::from_value(result).map_err(ClientError::Serialization)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        completed: Mutex<Option<OrchestrationMetadata>>,
    }

    #[async_trait]
    impl SchedulerClient for FakeClient {
        async fn schedule_new_orchestration(
            &self,
            _name: &str,
            instance_id: Option<&str>,
            _input: Value,
        ) -> Result<String, ClientError> {
            Ok(instance_id.map(String::from).unwrap_or_else(|| "generated".into()))
        }

        async fn wait_for_start(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError> {
            self.get_status(instance_id).await
        }

        async fn wait_for_completion(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError> {
            self.get_status(instance_id).await
        }

        async fn get_status(&self, instance_id: &str) -> Result<OrchestrationMetadata, ClientError> {
            self.completed
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ClientError::NotFound(instance_id.to_string()))
        }

        async fn raise_event(&self, _instance_id: &str, _name: &str, _input: Value) -> Result<(), ClientError> {
            Ok(())
        }

        async fn terminate(&self, _instance_id: &str, _reason: Option<&str>) -> Result<(), ClientError> {
            Ok(())
        }

        async fn suspend(&self, _instance_id: &str, _reason: Option<&str>) -> Result<(), ClientError> {
            Ok(())
        }

        async fn resume(&self, _instance_id: &str, _reason: Option<&str>) -> Result<(), ClientError> {
            Ok(())
        }

        async fn purge(&self, _instance_id: &str) -> Result<(), ClientError> {
            Ok(())
        }

        async fn signal_entity(&self, _entity_id: &str, _operation: &str, _input: Value) -> Result<(), ClientError> {
            Ok(())
        }

        async fn call_entity(&self, _entity_id: &str, _operation: &str, _input: Value) -> Result<Value, ClientError> {
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn wait_for_completion_surfaces_failure_without_error() {
        let fake = FakeClient::default();
        *fake.completed.lock().unwrap() = Some(OrchestrationMetadata {
            instance_id: "i1".into(),
            name: "n".into(),
            status: OrchestrationStatus::Failed,
            created_at: chrono::Utc::now(),
            last_updated_at: chrono::Utc::now(),
            custom_status: None,
            output: None,
            failure: Some(FailureDetail::application("boom")),
        });
        let client = DurableTaskClient::new(fake);
        let result: Result<Result<i64, FailureDetail>, ClientError> = client.wait_for_completion("i1").await;
        assert!(result.unwrap().is_err());
    }
}
