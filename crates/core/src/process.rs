//! Process and workflow-run records.
//!
//! A [`Process`] is one execution of an algorithm, either invoked directly
//! or as one step of a [`WorkflowRun`]. Both records are persisted as status
//! snapshots and are the polling surface for clients.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::service::ExecutionSpec;
use crate::status::{percentage, StatusCode, StatusRecord};
use crate::types::{new_id, EntityId, Timestamp};

/// Back-reference from a step process to the workflow run that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRef {
    pub run_id: EntityId,
    pub step_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub identifier: EntityId,
    pub service_id: EntityId,
    pub service_path: String,
    pub execution: ExecutionSpec,
    pub input_parameters: Value,
    pub status: StatusRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<PathBuf>,
    #[serde(default)]
    pub retry_count: u32,
    /// Diagnostic reference for failed executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_log: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<StepRef>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Process {
    pub fn new(
        service_id: EntityId,
        service_path: impl Into<String>,
        execution: ExecutionSpec,
        input_parameters: Value,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            identifier: new_id(),
            service_id,
            service_path: service_path.into(),
            execution,
            input_parameters,
            status: StatusRecord::pending("queued"),
            result_location: None,
            retry_count: 0,
            error_log: None,
            workflow: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_step(mut self, run_id: EntityId, step_id: impl Into<String>) -> Self {
        self.workflow = Some(StepRef {
            run_id,
            step_id: step_id.into(),
        });
        self
    }

    pub fn set_status(&mut self, status: StatusRecord) {
        self.status = status;
        self.updated_at = chrono::Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Terminal outcome of a process, as delivered to whoever awaits it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub process_id: EntityId,
    pub status: StatusRecord,
    pub result_location: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
}

impl ProcessOutcome {
    pub fn from_process(process: &Process) -> Self {
        Self {
            process_id: process.identifier,
            status: process.status.clone(),
            result_location: process.result_location.clone(),
            error_log: process.error_log.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status.status_code == StatusCode::Done
    }
}

// ---------------------------------------------------------------------------
// Workflow runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRun {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<EntityId>,
    pub status: StatusRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub identifier: EntityId,
    pub workflow_id: EntityId,
    pub workflow_path: String,
    pub status: StatusRecord,
    /// Steps in execution order.
    pub steps: Vec<StepRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Set once cancellation of the whole run was requested.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancel_requested: bool,
    /// Published result of the last step in execution order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_location: Option<PathBuf>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl WorkflowRun {
    pub fn new<I, S>(workflow_id: EntityId, workflow_path: impl Into<String>, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = chrono::Utc::now();
        let steps: Vec<StepRun> = step_ids
            .into_iter()
            .map(|id| StepRun {
                step_id: id.into(),
                process_id: None,
                status: StatusRecord::pending("waiting for dependencies"),
                result_location: None,
            })
            .collect();
        let mut run = Self {
            identifier: new_id(),
            workflow_id,
            workflow_path: workflow_path.into(),
            status: StatusRecord::pending("queued"),
            steps,
            failed_step: None,
            cancel_requested: false,
            result_location: None,
            created_at: now,
            updated_at: now,
        };
        run.refresh_aggregate();
        run
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRun> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Record the outcome of one step and recompute the aggregate status.
    pub fn record_step(
        &mut self,
        step_id: &str,
        status: StatusRecord,
        result_location: Option<PathBuf>,
    ) {
        let failed = matches!(
            status.status_code,
            StatusCode::Error | StatusCode::Cancelled
        );
        if let Some(step) = self.step_mut(step_id) {
            step.status = status;
            if result_location.is_some() {
                step.result_location = result_location;
            }
        }
        if failed && self.failed_step.is_none() {
            self.failed_step = Some(step_id.to_string());
        }
        self.refresh_aggregate();
    }

    /// Mark the run as cancelled. Steps still open keep their status until
    /// they settle; the aggregate becomes terminal once they have.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.refresh_aggregate();
    }

    /// Aggregate status derived from the step statuses.
    ///
    /// ERROR as soon as any step failed; DONE once every step is DONE;
    /// ERROR once every step settled without all of them being DONE;
    /// otherwise IN_PROGRESS with the share of finished steps.
    pub fn refresh_aggregate(&mut self) {
        self.updated_at = chrono::Utc::now();
        let total = self.steps.len() as u32;
        let done = self
            .steps
            .iter()
            .filter(|s| s.status.status_code == StatusCode::Done)
            .count() as u32;

        if let Some(failed) = &self.failed_step {
            let detail = self
                .step(failed)
                .map(|s| s.status.status_message.clone())
                .unwrap_or_default();
            self.status = StatusRecord::new(
                StatusCode::Error,
                format!("step '{failed}' failed: {detail}"),
                percentage(done, total),
            );
            return;
        }

        if done == total {
            self.result_location = self.steps.last().and_then(|s| s.result_location.clone());
            self.status = StatusRecord::done("workflow finished");
            return;
        }

        if self.is_settled() {
            let message = if self.cancel_requested {
                "workflow run cancelled".to_string()
            } else {
                let stopped = self
                    .steps
                    .iter()
                    .find(|s| s.status.status_code != StatusCode::Done)
                    .map(|s| format!("step '{}' did not run: {}", s.step_id, s.status.status_message))
                    .unwrap_or_default();
                format!("workflow stopped: {stopped}")
            };
            self.status = StatusRecord::new(StatusCode::Error, message, percentage(done, total));
            return;
        }

        let started = self
            .steps
            .iter()
            .any(|s| s.status.status_code != StatusCode::Pending);
        self.status = if started {
            StatusRecord::in_progress(
                format!("{done} of {total} steps finished"),
                percentage(done, total),
            )
        } else {
            StatusRecord::pending("queued")
        };
    }

    /// True once no step is pending or running.
    pub fn is_settled(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }
}
