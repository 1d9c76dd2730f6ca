use std::sync::Arc;

use spaghettihub_common::{PortingWorkRecord, WorkStatus};
use tracing::{error, info};
use uuid::Uuid;

use super::{PortingRequest, PortingSagaWorkflow};
use crate::clients::merge_proposal_id;
use crate::engine::{WorkflowClient, WorkflowClientExt, WorkflowOptions};
use crate::errors::PortingError;
use crate::store::Store;

/// Entry point for porting requests coming from the web UI or the CLI.
#[derive(Clone)]
pub struct PortingService {
    store: Store,
    engine: Arc<dyn WorkflowClient>,
    task_queue: String,
}

impl PortingService {
    pub fn new(store: Store, engine: Arc<dyn WorkflowClient>, task_queue: impl Into<String>) -> Self {
        Self {
            store,
            engine,
            task_queue: task_queue.into(),
        }
    }

    /// Record a `NEW` request and start its saga.
    pub async fn request(&self, launchpad_url: &str) -> Result<PortingWorkRecord, PortingError> {
        let launchpad_url = launchpad_url.trim().to_string();
        if merge_proposal_id(&launchpad_url).is_none() {
            return Err(PortingError::InvalidLaunchpadUrl(launchpad_url));
        }

        let request = PortingRequest {
            request_uuid: Uuid::new_v4().to_string(),
            launchpad_url,
        };
        let (uuid, url) = (request.request_uuid.clone(), request.launchpad_url.clone());
        let work = self
            .store
            .call(move |db| db.create_work(&uuid, &url))
            .await?;

        let options = WorkflowOptions::new(request.workflow_id()).with_task_queue(self.task_queue.clone());
        if let Err(e) = self
            .engine
            .start_workflow::<PortingSagaWorkflow>(&request, options)
            .await
        {
            error!(request_uuid = %request.request_uuid, error = %e, "Failed to start porting saga");
            let uuid = request.request_uuid.clone();
            self.store
                .call(move |db| db.finish_work(&uuid, WorkStatus::Failed, None))
                .await?;
            return Err(PortingError::StartFailed {
                request_uuid: request.request_uuid,
                source: e,
            });
        }

        info!(request_uuid = %work.request_uuid, launchpad_url = %work.launchpad_url, "Porting requested");
        Ok(work)
    }

    pub async fn status(&self, request_uuid: &str) -> Result<Option<PortingWorkRecord>, PortingError> {
        let uuid = request_uuid.to_string();
        Ok(self.store.call(move |db| db.get_work(&uuid)).await?)
    }
}
