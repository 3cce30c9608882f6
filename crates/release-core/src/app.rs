use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Client, CustomResource,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use shared::{
    models::{AppRef, COMPONENT_APPLICATION, LABEL_MANAGED_BY, MANAGED_BY, app_labels},
    utilities::errors::AppError,
};

pub const API_GROUP: &str = "stratus.dev";
pub const API_VERSION: &str = "stratus.dev/v1";

/// The application record. Build bookkeeping lives in the spec so a new
/// build can fall back to what the previous one used.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "stratus.dev",
    version = "v1",
    kind = "App",
    plural = "apps",
    namespaced
)]
pub struct AppSpec {
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builder_image: Option<String>,
}

/// Owner reference pointing at the given application record. Everything
/// carrying it is garbage-collected when the App goes away.
pub fn owner_reference(record: &App) -> Result<OwnerReference, AppError> {
    let name = record
        .metadata
        .name
        .clone()
        .ok_or_else(|| AppError::InternalError("app record has no name".to_string()))?;
    let uid = record
        .metadata
        .uid
        .clone()
        .ok_or_else(|| AppError::InternalError(format!("app record {name} has no uid")))?;

    Ok(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: "App".to_string(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: Some(false),
    })
}

/// CRUD for application records.
#[derive(Clone)]
pub struct Apps {
    client: Client,
}

impl Apps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<App> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn create(
        &self,
        app: &AppRef,
        routes: Vec<String>,
        chart: Option<String>,
    ) -> Result<App, AppError> {
        let mut record = App::new(
            &app.name,
            AppSpec {
                routes,
                chart,
                ..Default::default()
            },
        );
        record.metadata.namespace = Some(app.namespace.clone());
        record.metadata.labels = Some(app_labels(app, COMPONENT_APPLICATION));

        info!("Creating application record {}/{}", app.namespace, app.name);
        let created = self
            .api(&app.namespace)
            .create(&PostParams::default(), &record)
            .await?;

        Ok(created)
    }

    pub async fn get(&self, app: &AppRef) -> Result<App, AppError> {
        match self.api(&app.namespace).get(&app.name).await {
            Ok(record) => Ok(record),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(AppError::NotFoundError(format!(
                "application {} not found in namespace {}",
                app.name, app.namespace
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, app: &AppRef) -> Result<bool, AppError> {
        match self.api(&app.namespace).get(&app.name).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All application records managed by the orchestrator, across
    /// namespaces.
    pub async fn list_all(&self) -> Result<Vec<App>, AppError> {
        let api: Api<App> = Api::all(self.client.clone());
        let selector = format!("{LABEL_MANAGED_BY}={MANAGED_BY}");
        let list = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(list.items)
    }

    /// Persists what the submitted build used, so later builds can reuse
    /// the blob and builder without respecifying them.
    pub async fn record_staging(
        &self,
        app: &AppRef,
        stage_id: &str,
        blob_uid: &str,
        builder_image: &str,
    ) -> Result<(), AppError> {
        let patch = serde_json::json!({
            "spec": {
                "stage_id": stage_id,
                "blob_uid": blob_uid,
                "builder_image": builder_image,
            }
        });
        self.api(&app.namespace)
            .patch(&app.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Persists the image the running release was deployed from.
    pub async fn record_deployment(
        &self,
        app: &AppRef,
        stage_id: &str,
        image_url: &str,
    ) -> Result<(), AppError> {
        let patch = serde_json::json!({
            "spec": {
                "stage_id": stage_id,
                "image_url": image_url,
            }
        });
        self.api(&app.namespace)
            .patch(&app.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Deletes the record. Owned resources (fact secrets) go with it.
    pub async fn delete(&self, app: &AppRef) -> Result<(), AppError> {
        info!("Deleting application record {}/{}", app.namespace, app.name);
        match self
            .api(&app.namespace)
            .delete(&app.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_reference_requires_uid() {
        let record = App::new("myapp", AppSpec::default());
        assert!(owner_reference(&record).is_err());
    }

    #[test]
    fn test_owner_reference() {
        let mut record = App::new("myapp", AppSpec::default());
        record.metadata.uid = Some("abc-123".to_string());
        let owner = owner_reference(&record).unwrap();
        assert_eq!(owner.kind, "App");
        assert_eq!(owner.api_version, "stratus.dev/v1");
        assert_eq!(owner.name, "myapp");
        assert_eq!(owner.uid, "abc-123");
    }

    #[test]
    fn test_spec_serializes_without_empty_fields() {
        let spec = AppSpec {
            routes: vec!["myapp.example.com".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["routes"][0], "myapp.example.com");
        assert!(json.get("stage_id").is_none());
        assert!(json.get("builder_image").is_none());
    }
}
