use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utilities::names;

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

pub const LABEL_STAGE_ID: &str = "stratus.dev/stage-id";
pub const LABEL_STAGE_ID_PREVIOUS: &str = "stratus.dev/stage-id-previous";
pub const LABEL_BLOB_UID: &str = "stratus.dev/blob-uid";
pub const LABEL_AREA: &str = "stratus.dev/area";

pub const MANAGED_BY: &str = "stratus";
pub const COMPONENT_APPLICATION: &str = "application";
pub const COMPONENT_STAGING: &str = "staging";

pub const ANNOTATION_RESTARTED_AT: &str = "stratus.dev/restarted-at";

/// User-set environment assignments, ordered by name.
pub type EnvVariableMap = BTreeMap<String, String>;

/// Identity of an application: name plus the namespace it lives in. All
/// resource names owned by the application derive from this pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRef {
    pub name: String,
    pub namespace: String,
}

impl AppRef {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn scale_secret_name(&self) -> String {
        names::generate_resource_name(&[&self.name, "scaling"])
    }

    pub fn env_secret_name(&self) -> String {
        names::generate_resource_name(&[&self.name, "env"])
    }

    pub fn service_secret_name(&self) -> String {
        names::generate_resource_name(&[&self.name, "svc"])
    }

    pub fn configuration_secret_name(&self) -> String {
        names::generate_resource_name(&[&self.name, "config"])
    }

    pub fn cache_pvc_name(&self) -> String {
        names::generate_resource_name(&["cache", &self.namespace, &self.name])
    }

    pub fn staging_job_name(&self, stage_id: &str) -> String {
        names::generate_resource_name(&["stage", &self.namespace, &self.name, stage_id])
    }

    pub fn staging_env_secret_name(&self, stage_id: &str) -> String {
        names::generate_resource_name(&["env", &self.namespace, &self.name, stage_id])
    }

    /// The per-app claim secret arbitrating concurrent builds. No stage
    /// id in the name: every submission for the app targets this one
    /// resource.
    pub fn staging_claim_name(&self) -> String {
        names::generate_resource_name(&["stage", &self.namespace, &self.name, "claim"])
    }

    pub fn release_name(&self) -> String {
        names::release_name(&self.name)
    }

    /// Where the registry stores the image produced by the given build.
    pub fn image_url(&self, registry_url: &str, stage_id: &str) -> String {
        format!("{registry_url}/{}-{}:{stage_id}", self.namespace, self.name)
    }
}

/// Identity of one build of an application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRef {
    pub id: String,
}

impl StageRef {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
        }
    }
}

impl std::fmt::Display for StageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Optional container probes, stored alongside the instance count.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppProbes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness: Option<serde_json::Value>,
}

/// The standard label set attached to every resource the orchestrator
/// creates for an application.
pub fn app_labels(app: &AppRef, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), app.name.clone()),
        (LABEL_PART_OF.to_string(), app.namespace.clone()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_COMPONENT.to_string(), component.to_string()),
    ])
}

/// Label selector matching every resource of the given application.
pub fn app_selector(app: &AppRef) -> String {
    format!(
        "{LABEL_NAME}={},{LABEL_PART_OF}={},{LABEL_MANAGED_BY}={MANAGED_BY}",
        app.name, app.namespace
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_names_are_per_area() {
        let app = AppRef::new("myapp", "workspace");
        let names = [
            app.scale_secret_name(),
            app.env_secret_name(),
            app.service_secret_name(),
            app.configuration_secret_name(),
        ];
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_image_url() {
        let app = AppRef::new("myapp", "workspace");
        assert_eq!(
            app.image_url("registry.local:5000/apps", "cafe"),
            "registry.local:5000/apps/workspace-myapp:cafe"
        );
    }

    #[test]
    fn test_staging_claim_name_is_per_app() {
        let app = AppRef::new("myapp", "workspace");
        let a = StageRef::generate();
        let b = StageRef::generate();
        assert_ne!(app.staging_job_name(&a.id), app.staging_job_name(&b.id));
        assert!(!app.staging_claim_name().contains(&a.id));
        assert!(!app.staging_claim_name().contains(&b.id));
    }

    #[test]
    fn test_stage_ref_is_unique_hex() {
        let a = StageRef::generate();
        let b = StageRef::generate();
        assert_ne!(a, b);
        assert_eq!(a.id.len(), 32);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_app_selector() {
        let app = AppRef::new("myapp", "workspace");
        assert_eq!(
            app_selector(&app),
            "app.kubernetes.io/name=myapp,app.kubernetes.io/part-of=workspace,app.kubernetes.io/managed-by=stratus"
        );
    }
}
