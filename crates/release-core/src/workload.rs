use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use kube::{
    Api, Client,
    api::{ListParams, PostParams},
};
use tracing::warn;

use shared::{
    models::{
        ANNOTATION_RESTARTED_AT, AppRef, COMPONENT_APPLICATION, LABEL_COMPONENT, app_selector,
    },
    utilities::{errors::AppError, names},
};

const RETRY_ATTEMPTS: u32 = 5;

/// Adds the volume/mount pair carrying a service binding. Already-bound
/// services are left alone, so the edit is idempotent.
pub fn bind_volume(volumes: &mut Vec<Volume>, mounts: &mut Vec<VolumeMount>, service_name: &str) {
    if !volumes.iter().any(|v| v.name == service_name) {
        volumes.push(Volume {
            name: service_name.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(names::service_binding_resource(service_name)),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    if !mounts.iter().any(|m| m.name == service_name) {
        mounts.push(VolumeMount {
            name: service_name.to_string(),
            mount_path: format!("/services/{service_name}"),
            read_only: Some(true),
            ..Default::default()
        });
    }
}

/// Removes exactly the named binding's volume and mount. Everything
/// else, including other bindings, stays untouched.
pub fn unbind_volume(volumes: &mut Vec<Volume>, mounts: &mut Vec<VolumeMount>, service_name: &str) {
    volumes.retain(|v| v.name != service_name);
    mounts.retain(|m| m.name != service_name);
}

/// Rewrites the container's references into the application env secret:
/// stale references go, one `secretKeyRef` per current variable comes
/// back. Env entries pointing anywhere else are preserved.
pub fn sync_env_references(env: &mut Vec<EnvVar>, env_secret_name: &str, var_names: &[String]) {
    env.retain(|e| {
        e.value_from
            .as_ref()
            .and_then(|vf| vf.secret_key_ref.as_ref())
            .map(|r| r.name.as_str())
            != Some(env_secret_name)
    });

    for name in var_names {
        env.push(EnvVar {
            name: name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: env_secret_name.to_string(),
                    key: name.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
}

/// Edits the running deployment of an application in place, without
/// touching its replica count.
#[derive(Clone)]
pub struct Workloads {
    client: Client,
}

impl Workloads {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// The application's deployment, found by its labels. `None` while
    /// the application has never been deployed.
    pub async fn get(&self, app: &AppRef) -> Result<Option<Deployment>, AppError> {
        let selector = format!(
            "{},{LABEL_COMPONENT}={COMPONENT_APPLICATION}",
            app_selector(app)
        );
        let list = self
            .api(&app.namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items.into_iter().next())
    }

    pub async fn exists(&self, app: &AppRef) -> Result<bool, AppError> {
        Ok(self.get(app).await?.is_some())
    }

    /// Read-modify-write against the live deployment. The replace sends
    /// the observed resourceVersion back, so a concurrent writer turns
    /// into a 409 and the cycle restarts on fresh data, a bounded number
    /// of times. Returns false when there is no workload to edit.
    async fn update(
        &self,
        app: &AppRef,
        modify: impl Fn(&mut Deployment),
    ) -> Result<bool, AppError> {
        let api = self.api(&app.namespace);

        for attempt in 1..=RETRY_ATTEMPTS {
            let Some(mut deployment) = self.get(app).await? else {
                return Ok(false);
            };

            modify(&mut deployment);

            let name = deployment.metadata.name.clone().ok_or_else(|| {
                AppError::InternalError(format!(
                    "deployment of {}/{} has no name",
                    app.namespace, app.name
                ))
            })?;

            match api.replace(&name, &PostParams::default(), &deployment).await {
                Ok(_) => return Ok(true),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    warn!(
                        "Conflicting write on deployment {}/{}, attempt {}/{}",
                        app.namespace, name, attempt, RETRY_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::RetriesExhausted {
            resource: format!("deployment of {}/{}", app.namespace, app.name),
            attempts: RETRY_ATTEMPTS,
        })
    }

    pub async fn bind_service(&self, app: &AppRef, service_name: &str) -> Result<bool, AppError> {
        let service_name = service_name.to_string();
        self.update(app, move |deployment| {
            let Some(spec) = deployment.spec.as_mut() else {
                return;
            };
            let Some(pod) = spec.template.spec.as_mut() else {
                return;
            };
            let Some(container) = pod.containers.first_mut() else {
                return;
            };
            bind_volume(
                pod.volumes.get_or_insert_with(Vec::new),
                container.volume_mounts.get_or_insert_with(Vec::new),
                &service_name,
            );
        })
        .await
    }

    pub async fn unbind_service(&self, app: &AppRef, service_name: &str) -> Result<bool, AppError> {
        let service_name = service_name.to_string();
        self.update(app, move |deployment| {
            let Some(spec) = deployment.spec.as_mut() else {
                return;
            };
            let Some(pod) = spec.template.spec.as_mut() else {
                return;
            };
            let Some(container) = pod.containers.first_mut() else {
                return;
            };
            unbind_volume(
                pod.volumes.get_or_insert_with(Vec::new),
                container.volume_mounts.get_or_insert_with(Vec::new),
                &service_name,
            );
        })
        .await
    }

    pub async fn sync_environment(
        &self,
        app: &AppRef,
        var_names: Vec<String>,
    ) -> Result<bool, AppError> {
        let env_secret_name = app.env_secret_name();
        self.update(app, move |deployment| {
            let Some(spec) = deployment.spec.as_mut() else {
                return;
            };
            let Some(pod) = spec.template.spec.as_mut() else {
                return;
            };
            let Some(container) = pod.containers.first_mut() else {
                return;
            };
            sync_env_references(
                container.env.get_or_insert_with(Vec::new),
                &env_secret_name,
                &var_names,
            );
        })
        .await
    }

    /// Rolls the pods without changing desired state, by bumping a
    /// template annotation.
    pub async fn restart(&self, app: &AppRef) -> Result<bool, AppError> {
        let stamp = Utc::now().to_rfc3339();
        self.update(app, move |deployment| {
            let Some(spec) = deployment.spec.as_mut() else {
                return;
            };
            let metadata = spec.template.metadata.get_or_insert_with(Default::default);
            metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ANNOTATION_RESTARTED_AT.to_string(), stamp.clone());
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(volumes: &[Volume]) -> Vec<String> {
        volumes.iter().map(|v| v.name.clone()).collect()
    }

    #[test]
    fn test_bind_volume_adds_pair() {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        bind_volume(&mut volumes, &mut mounts, "mydb");

        assert_eq!(bound(&volumes), vec!["mydb"]);
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some("s-mydb")
        );
        assert_eq!(mounts[0].mount_path, "/services/mydb");
        assert_eq!(mounts[0].read_only, Some(true));
    }

    #[test]
    fn test_bind_volume_is_idempotent() {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        bind_volume(&mut volumes, &mut mounts, "mydb");
        bind_volume(&mut volumes, &mut mounts, "mydb");

        assert_eq!(volumes.len(), 1);
        assert_eq!(mounts.len(), 1);
    }

    #[test]
    fn test_unbind_volume_preserves_others() {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        for name in ["a", "b", "c"] {
            bind_volume(&mut volumes, &mut mounts, name);
        }

        unbind_volume(&mut volumes, &mut mounts, "b");

        assert_eq!(bound(&volumes), vec!["a", "c"]);
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().all(|m| m.name != "b"));
    }

    #[test]
    fn test_unbind_unknown_is_noop() {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        bind_volume(&mut volumes, &mut mounts, "a");

        unbind_volume(&mut volumes, &mut mounts, "nope");

        assert_eq!(volumes.len(), 1);
        assert_eq!(mounts.len(), 1);
    }

    #[test]
    fn test_sync_env_references_replaces_stale_refs() {
        let mut env = vec![EnvVar {
            name: "GONE".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: "myapp-env".to_string(),
                    key: "GONE".to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }];

        sync_env_references(&mut env, "myapp-env", &["PORT".to_string()]);

        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "PORT");
    }

    #[test]
    fn test_sync_env_references_preserves_unrelated_entries() {
        let mut env = vec![
            EnvVar {
                name: "PLAIN".to_string(),
                value: Some("1".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: "OTHER_SECRET".to_string(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: "something-else".to_string(),
                        key: "OTHER_SECRET".to_string(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];

        sync_env_references(&mut env, "myapp-env", &["PORT".to_string()]);

        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["PLAIN", "OTHER_SECRET", "PORT"]);
    }

    #[test]
    fn test_sync_env_references_is_idempotent() {
        let mut env = Vec::new();
        let vars = vec!["A".to_string(), "B".to_string()];

        sync_env_references(&mut env, "myapp-env", &vars);
        let once = env.clone();
        sync_env_references(&mut env, "myapp-env", &vars);

        assert_eq!(env, once);
    }
}
