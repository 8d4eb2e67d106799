//! Sub-process invocation backed by the execution service
//!
//! The engine sees only the [`SubProcessRunner`] trait; this implementation
//! resolves the target definition, creates the child execution with parent
//! linkage and incremented depth, and either waits for the child's terminal
//! result or fires it off in the background with a preallocated id.

use crate::service::{ExecutionService, ParentLink, StartRequest};
use async_trait::async_trait;
use procflow_core::{DependencyError, SubProcessOutcome, SubProcessRequest, SubProcessRunner};
use tracing::{info, warn};
use uuid::Uuid;

/// [`SubProcessRunner`] that starts child executions through the service
pub struct ServiceSubProcessRunner {
    service: ExecutionService,
}

impl ServiceSubProcessRunner {
    pub fn new(service: ExecutionService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SubProcessRunner for ServiceSubProcessRunner {
    async fn start(
        &self,
        request: SubProcessRequest,
    ) -> Result<SubProcessOutcome, DependencyError> {
        if request.execution_depth > self.service.max_sub_process_depth() {
            return Err(DependencyError::Failed(format!(
                "sub-process depth {} exceeds the limit of {}",
                request.execution_depth,
                self.service.max_sub_process_depth()
            )));
        }

        let Some(resolver) = self.service.resolver() else {
            return Err(DependencyError::Unavailable(
                "no process definition resolver configured".to_string(),
            ));
        };

        let parent = self
            .service
            .store()
            .get_execution(&request.parent_execution_id)
            .await
            .map_err(|e| DependencyError::Failed(e.to_string()))?
            .ok_or_else(|| {
                DependencyError::NotFound(format!(
                    "parent execution {}",
                    request.parent_execution_id
                ))
            })?;

        let Some(definition) = resolver.resolve(&request.process_id, &parent.org_id).await
        else {
            return Err(DependencyError::NotFound(format!(
                "process {}",
                request.process_id
            )));
        };

        let child_id = Uuid::new_v4().to_string();
        let mut start = StartRequest::new(
            definition,
            &parent.org_id,
            &parent.agent_id,
            &parent.created_by,
        )
        .with_trigger("sub_process", request.input.clone());
        start.parent = Some(ParentLink {
            execution_id: request.parent_execution_id.clone(),
            node_id: request.parent_node_id.clone(),
            depth: request.execution_depth,
        });
        start.execution_id = Some(child_id.clone());

        info!(
            parent = %request.parent_execution_id,
            child = %child_id,
            process = %request.process_id,
            wait = request.wait_for_completion,
            "starting sub-process"
        );

        if request.wait_for_completion {
            let result = self
                .service
                .start_execution(start)
                .await
                .map_err(|e| DependencyError::Failed(e.to_string()))?;
            Ok(SubProcessOutcome {
                execution_id: result.execution_id.clone(),
                status: Some(result.status),
                output: result.output,
            })
        } else {
            let service = self.service.clone();
            tokio::spawn(async move {
                if let Err(e) = service.start_execution(start).await {
                    warn!(error = %e, "background sub-process failed to start");
                }
            });
            Ok(SubProcessOutcome {
                execution_id: child_id,
                status: None,
                output: None,
            })
        }
    }
}
