use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client,
    api::{DeleteParams, PostParams},
};
use tracing::debug;

use shared::{
    models::{AppRef, COMPONENT_STAGING, StageRef, app_labels},
    utilities::errors::AppError,
};

/// Where a staging job stands. Terminal states come from the job's
/// `Complete` and `Failed` conditions; anything else is still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagingStatus {
    Active,
    Done,
    Failed,
}

pub fn job_staging_status(job: &Job) -> StagingStatus {
    if let Some(status) = &job.status
        && let Some(conditions) = &status.conditions
    {
        for condition in conditions {
            if condition.status != "True" {
                continue;
            }
            match condition.type_.as_str() {
                "Complete" => return StagingStatus::Done,
                "Failed" => return StagingStatus::Failed,
                _ => {}
            }
        }
    }

    StagingStatus::Active
}

/// A finished build no longer defends its claim; a running one does.
pub fn claim_takeover_allowed(status: StagingStatus) -> bool {
    status != StagingStatus::Active
}

const CLAIM_STAGE_KEY: &str = "stage-id";

/// Gatekeeper for new builds: at most one active build per application.
/// Arbitration runs through a per-app claim secret, so the cluster's
/// create/replace exclusivity decides races instead of a list snapshot.
#[derive(Clone)]
pub struct AdmissionController {
    client: Client,
    staging_namespace: String,
}

impl AdmissionController {
    pub fn new(client: Client, staging_namespace: &str) -> Self {
        Self {
            client,
            staging_namespace: staging_namespace.to_string(),
        }
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.staging_namespace)
    }

    /// Claims the application's build slot for the given stage. The
    /// claim secret records the holding build; a takeover is allowed
    /// only once the holder's job is terminal or gone, and goes through
    /// a versioned replace so of two racers exactly one wins. Create
    /// and replace conflicts both surface as `StagingConflict`.
    pub async fn claim(&self, app: &AppRef, stage: &StageRef) -> Result<(), AppError> {
        let secrets = self.secrets();
        let claim_name = app.staging_claim_name();
        let data = BTreeMap::from([(
            CLAIM_STAGE_KEY.to_string(),
            ByteString(stage.id.clone().into_bytes()),
        )]);

        let mut existing = match secrets.get(&claim_name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let claim = Secret {
                    metadata: ObjectMeta {
                        name: Some(claim_name.clone()),
                        namespace: Some(self.staging_namespace.clone()),
                        labels: Some(app_labels(app, COMPONENT_STAGING)),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                return match secrets.create(&PostParams::default(), &claim).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Err(conflict(app)),
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(holder) = existing
            .data
            .as_ref()
            .and_then(|data| data.get(CLAIM_STAGE_KEY))
        {
            let holder_id = String::from_utf8_lossy(&holder.0).into_owned();
            if !holder_id.is_empty() && !self.holder_terminal(app, &holder_id).await? {
                debug!(
                    "Build {} of {}/{} still holds the claim",
                    holder_id, app.namespace, app.name
                );
                return Err(conflict(app));
            }
        }

        // the carried resourceVersion makes this replace the arbiter
        existing.data = Some(data);
        match secrets
            .replace(&claim_name, &PostParams::default(), &existing)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(conflict(app)),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the claim holder's job has reached a terminal condition.
    /// A job that never materialized counts as terminal, so a crashed
    /// submission does not wedge the application.
    async fn holder_terminal(&self, app: &AppRef, stage_id: &str) -> Result<bool, AppError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.staging_namespace);
        match jobs.get(&app.staging_job_name(stage_id)).await {
            Ok(job) => Ok(claim_takeover_allowed(job_staging_status(&job))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes the claim when the application goes away.
    pub async fn clear(&self, app: &AppRef) -> Result<(), AppError> {
        match self
            .secrets()
            .delete(&app.staging_claim_name(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn conflict(app: &AppRef) -> AppError {
    AppError::StagingConflict {
        app: format!("{}/{}", app.namespace, app.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn job_with_conditions(conditions: Vec<JobCondition>) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_without_status_is_active() {
        assert_eq!(job_staging_status(&Job::default()), StagingStatus::Active);
    }

    #[test]
    fn test_job_without_conditions_is_active() {
        let job = job_with_conditions(vec![]);
        assert_eq!(job_staging_status(&job), StagingStatus::Active);
    }

    #[test]
    fn test_complete_job_is_done() {
        let job = job_with_conditions(vec![condition("Complete", "True")]);
        assert_eq!(job_staging_status(&job), StagingStatus::Done);
    }

    #[test]
    fn test_failed_job_is_failed() {
        let job = job_with_conditions(vec![condition("Failed", "True")]);
        assert_eq!(job_staging_status(&job), StagingStatus::Failed);
    }

    #[test]
    fn test_false_conditions_do_not_terminate() {
        let job = job_with_conditions(vec![
            condition("Complete", "False"),
            condition("Failed", "False"),
        ]);
        assert_eq!(job_staging_status(&job), StagingStatus::Active);
    }

    #[test]
    fn test_unrelated_conditions_are_ignored() {
        let job = job_with_conditions(vec![
            condition("Suspended", "True"),
            condition("Complete", "True"),
        ]);
        assert_eq!(job_staging_status(&job), StagingStatus::Done);
    }

    #[test]
    fn test_takeover_only_from_terminal_holders() {
        assert!(!claim_takeover_allowed(StagingStatus::Active));
        assert!(claim_takeover_allowed(StagingStatus::Done));
        assert!(claim_takeover_allowed(StagingStatus::Failed));
    }

    #[test]
    fn test_racing_submissions_contend_on_one_claim() {
        use shared::models::AppRef;

        // two submissions mint different stage ids and thus different
        // job names, but both must create or replace the same claim
        let app = AppRef::new("myapp", "workspace");
        let first = StageRef::generate();
        let second = StageRef::generate();

        assert_ne!(
            app.staging_job_name(&first.id),
            app.staging_job_name(&second.id)
        );
        assert!(!app.staging_claim_name().contains(&first.id));
        assert!(!app.staging_claim_name().contains(&second.id));
    }
}
