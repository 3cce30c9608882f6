use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ListParams},
};
use tracing::{info, warn};

use shared::{
    models::{
        AppRef, COMPONENT_STAGING, LABEL_BLOB_UID, LABEL_COMPONENT, LABEL_STAGE_ID,
        LABEL_STAGE_ID_PREVIOUS, StageRef, app_labels, app_selector,
    },
    utilities::errors::AppError,
};

/// Fresh build identity plus the id of the build it supersedes. A first
/// build has no predecessor and doubles as its own.
pub fn next(previous: Option<String>) -> (StageRef, String) {
    let stage = StageRef::generate();
    let previous = previous
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| stage.id.clone());
    (stage, previous)
}

/// The label set carried by a build's job and env secret. Links the
/// build to its application and to the build it replaces.
pub fn staging_labels(
    app: &AppRef,
    stage: &StageRef,
    previous_id: &str,
    blob_uid: &str,
) -> BTreeMap<String, String> {
    let mut labels = app_labels(app, COMPONENT_STAGING);
    labels.insert(LABEL_STAGE_ID.to_string(), stage.id.clone());
    labels.insert(LABEL_STAGE_ID_PREVIOUS.to_string(), previous_id.to_string());
    labels.insert(LABEL_BLOB_UID.to_string(), blob_uid.to_string());
    labels
}

/// Removes superseded build artifacts from the staging namespace.
#[derive(Clone)]
pub struct LineageTracker {
    client: Client,
    staging_namespace: String,
}

impl LineageTracker {
    pub fn new(client: Client, staging_namespace: &str) -> Self {
        Self {
            client,
            staging_namespace: staging_namespace.to_string(),
        }
    }

    /// Deletes every staging job and env secret of the application whose
    /// stage id differs from `keep_stage_id`. With `None` everything
    /// goes. Returns how many builds were removed.
    pub async fn unstage(
        &self,
        app: &AppRef,
        keep_stage_id: Option<&str>,
    ) -> Result<u32, AppError> {
        let selector = format!(
            "{},{LABEL_COMPONENT}={COMPONENT_STAGING}",
            app_selector(app)
        );

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.staging_namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.staging_namespace);

        let list = jobs.list(&ListParams::default().labels(&selector)).await?;

        let mut removed = 0;
        for job in list {
            let Some(stage_id) = job.labels().get(LABEL_STAGE_ID).cloned() else {
                continue;
            };
            if keep_stage_id == Some(stage_id.as_str()) {
                continue;
            }

            let job_name = job.name_any();
            info!(
                "Removing superseded build {} of {}/{}",
                stage_id, app.namespace, app.name
            );

            match jobs.delete(&job_name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }

            let secret_name = app.staging_env_secret_name(&stage_id);
            match secrets
                .delete(&secret_name, &DeleteParams::background())
                .await
            {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    warn!("Env secret {} already gone", secret_name);
                }
                Err(e) => return Err(e.into()),
            }

            removed += 1;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_first_build_is_its_own_predecessor() {
        let (stage, previous) = next(None);
        assert_eq!(stage.id, previous);
    }

    #[test]
    fn test_next_empty_previous_counts_as_absent() {
        let (stage, previous) = next(Some(String::new()));
        assert_eq!(stage.id, previous);
    }

    #[test]
    fn test_next_chains_to_previous_build() {
        let (stage, previous) = next(Some("aaaa".to_string()));
        assert_eq!(previous, "aaaa");
        assert_ne!(stage.id, previous);
    }

    #[test]
    fn test_staging_labels() {
        let app = AppRef::new("myapp", "workspace");
        let stage = StageRef {
            id: "ffff".to_string(),
        };
        let labels = staging_labels(&app, &stage, "eeee", "blob-1");
        assert_eq!(labels.get(LABEL_STAGE_ID).map(String::as_str), Some("ffff"));
        assert_eq!(
            labels.get(LABEL_STAGE_ID_PREVIOUS).map(String::as_str),
            Some("eeee")
        );
        assert_eq!(
            labels.get(LABEL_BLOB_UID).map(String::as_str),
            Some("blob-1")
        );
        assert_eq!(
            labels.get(LABEL_COMPONENT).map(String::as_str),
            Some(COMPONENT_STAGING)
        );
    }
}
