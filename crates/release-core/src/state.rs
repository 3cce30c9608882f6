use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client,
    api::{ListParams, PostParams},
};
use tracing::warn;

use shared::{
    models::{
        AppProbes, AppRef, COMPONENT_APPLICATION, EnvVariableMap, LABEL_AREA, LABEL_COMPONENT,
        LABEL_MANAGED_BY, LABEL_NAME, MANAGED_BY, app_labels,
    },
    utilities::errors::AppError,
};

use crate::app::{Apps, owner_reference};

pub const AREA_SCALING: &str = "scaling";
pub const AREA_ENVIRONMENT: &str = "environment";
pub const AREA_SERVICE: &str = "service";
pub const AREA_CONFIGURATION: &str = "configuration";

const DESIRED_INSTANCES_KEY: &str = "desired";
const LIVENESS_KEY: &str = "liveness";
const READINESS_KEY: &str = "readiness";

const UPDATE_ATTEMPTS: u32 = 5;

/// Per-application facts, each area in its own lazily-created secret
/// owned by the application record.
#[derive(Clone)]
pub struct StateStore {
    client: Client,
    apps: Apps,
}

impl StateStore {
    pub fn new(client: Client) -> Self {
        let apps = Apps::new(client.clone());
        Self { client, apps }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn load_or_create(
        &self,
        app: &AppRef,
        secret_name: &str,
        area: &str,
    ) -> Result<Secret, AppError> {
        let api = self.secrets(&app.namespace);

        match api.get(secret_name).await {
            Ok(secret) => return Ok(secret),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let record = self.apps.get(app).await?;

        let mut labels = app_labels(app, COMPONENT_APPLICATION);
        labels.insert(LABEL_AREA.to_string(), area.to_string());

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.to_string()),
                namespace: Some(app.namespace.clone()),
                labels: Some(labels),
                owner_references: Some(vec![owner_reference(&record)?]),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(created) => Ok(created),
            // lost the create race, take the winner
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(api.get(secret_name).await?),
            Err(e) => Err(e.into()),
        }
    }

    /// The read-modify-write cycle every mutation goes through. A 409 on
    /// the write means somebody else got between our read and write; the
    /// whole cycle repeats against fresh data, a bounded number of times.
    async fn update(
        &self,
        app: &AppRef,
        secret_name: &str,
        area: &str,
        modify: impl Fn(&mut BTreeMap<String, ByteString>),
    ) -> Result<(), AppError> {
        let api = self.secrets(&app.namespace);

        for attempt in 1..=UPDATE_ATTEMPTS {
            let mut secret = self.load_or_create(app, secret_name, area).await?;
            let mut data = secret.data.take().unwrap_or_default();
            modify(&mut data);
            secret.data = Some(data);

            match api
                .replace(secret_name, &PostParams::default(), &secret)
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    warn!(
                        "Conflicting write on secret {}/{}, attempt {}/{}",
                        app.namespace, secret_name, attempt, UPDATE_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::RetriesExhausted {
            resource: format!("{}/{}", app.namespace, secret_name),
            attempts: UPDATE_ATTEMPTS,
        })
    }

    // --- scaling ---

    pub async fn scaling(&self, app: &AppRef) -> Result<i32, AppError> {
        let secret = self
            .load_or_create(app, &app.scale_secret_name(), AREA_SCALING)
            .await?;
        scaling_from_data(secret.data.as_ref().unwrap_or(&BTreeMap::new()))
    }

    pub async fn set_scaling(&self, app: &AppRef, instances: i32) -> Result<(), AppError> {
        self.update(app, &app.scale_secret_name(), AREA_SCALING, move |data| {
            data.insert(
                DESIRED_INSTANCES_KEY.to_string(),
                ByteString(instances.to_string().into_bytes()),
            );
        })
        .await
    }

    pub async fn probes(&self, app: &AppRef) -> Result<AppProbes, AppError> {
        let secret = self
            .load_or_create(app, &app.scale_secret_name(), AREA_SCALING)
            .await?;
        let data = secret.data.unwrap_or_default();

        let parse = |key: &str| -> Result<Option<serde_json::Value>, AppError> {
            match data.get(key) {
                Some(raw) if !raw.0.is_empty() => Ok(Some(serde_json::from_slice(&raw.0)?)),
                _ => Ok(None),
            }
        };

        Ok(AppProbes {
            liveness: parse(LIVENESS_KEY)?,
            readiness: parse(READINESS_KEY)?,
        })
    }

    pub async fn set_probes(&self, app: &AppRef, probes: &AppProbes) -> Result<(), AppError> {
        let liveness = probes
            .liveness
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        let readiness = probes
            .readiness
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;

        self.update(app, &app.scale_secret_name(), AREA_SCALING, move |data| {
            match &liveness {
                Some(bytes) => data.insert(LIVENESS_KEY.to_string(), ByteString(bytes.clone())),
                None => data.remove(LIVENESS_KEY),
            };
            match &readiness {
                Some(bytes) => data.insert(READINESS_KEY.to_string(), ByteString(bytes.clone())),
                None => data.remove(READINESS_KEY),
            };
        })
        .await
    }

    // --- environment ---

    pub async fn environment(&self, app: &AppRef) -> Result<EnvVariableMap, AppError> {
        let secret = self
            .load_or_create(app, &app.env_secret_name(), AREA_ENVIRONMENT)
            .await?;
        Ok(environment_from_data(
            secret.data.as_ref().unwrap_or(&BTreeMap::new()),
        ))
    }

    pub async fn environment_names(&self, app: &AppRef) -> Result<Vec<String>, AppError> {
        let secret = self
            .load_or_create(app, &app.env_secret_name(), AREA_ENVIRONMENT)
            .await?;
        Ok(names_from_data(
            secret.data.as_ref().unwrap_or(&BTreeMap::new()),
        ))
    }

    pub async fn set_environment(
        &self,
        app: &AppRef,
        assignments: EnvVariableMap,
        replace: bool,
    ) -> Result<(), AppError> {
        self.update(
            app,
            &app.env_secret_name(),
            AREA_ENVIRONMENT,
            move |data| {
                // Replacement is adding to a clear structure
                if replace {
                    data.clear();
                }
                for (name, value) in &assignments {
                    data.insert(name.clone(), ByteString(value.clone().into_bytes()));
                }
            },
        )
        .await
    }

    pub async fn unset_environment(&self, app: &AppRef, var_name: &str) -> Result<(), AppError> {
        let var_name = var_name.to_string();
        self.update(
            app,
            &app.env_secret_name(),
            AREA_ENVIRONMENT,
            move |data| {
                data.remove(&var_name);
            },
        )
        .await
    }

    // --- bound services ---

    pub async fn bound_services(&self, app: &AppRef) -> Result<Vec<String>, AppError> {
        let secret = self
            .load_or_create(app, &app.service_secret_name(), AREA_SERVICE)
            .await?;
        Ok(names_from_data(
            secret.data.as_ref().unwrap_or(&BTreeMap::new()),
        ))
    }

    /// Adds the given service names to the application's bound set, or
    /// replaces the set wholesale. Adding a known service is a no-op.
    pub async fn bound_services_set(
        &self,
        app: &AppRef,
        service_names: &[String],
        replace: bool,
    ) -> Result<(), AppError> {
        let service_names = service_names.to_vec();
        self.update(
            app,
            &app.service_secret_name(),
            AREA_SERVICE,
            move |data| {
                if replace {
                    data.clear();
                }
                for name in &service_names {
                    data.insert(name.clone(), ByteString(Vec::new()));
                }
            },
        )
        .await
    }

    /// Removes a service from the bound set. Unknown names are a no-op.
    pub async fn bound_services_unset(
        &self,
        app: &AppRef,
        service_name: &str,
    ) -> Result<(), AppError> {
        let service_name = service_name.to_string();
        self.update(
            app,
            &app.service_secret_name(),
            AREA_SERVICE,
            move |data| {
                data.remove(&service_name);
            },
        )
        .await
    }

    /// Names of applications in the namespace bound to the given service.
    pub async fn apps_bound_to_service(
        &self,
        namespace: &str,
        service_name: &str,
    ) -> Result<Vec<String>, AppError> {
        let selector = format!(
            "{LABEL_AREA}={AREA_SERVICE},{LABEL_COMPONENT}={COMPONENT_APPLICATION},{LABEL_MANAGED_BY}={MANAGED_BY}"
        );
        let api = self.secrets(namespace);
        let bindings = api.list(&ListParams::default().labels(&selector)).await?;

        let mut result = Vec::new();
        for binding in bindings {
            let bound = binding
                .data
                .as_ref()
                .is_some_and(|data| data.contains_key(service_name));
            if bound
                && let Some(labels) = &binding.metadata.labels
                && let Some(app_name) = labels.get(LABEL_NAME)
            {
                result.push(app_name.clone());
            }
        }

        Ok(result)
    }

    // --- bound configurations ---

    pub async fn bound_configurations(&self, app: &AppRef) -> Result<Vec<String>, AppError> {
        let secret = self
            .load_or_create(app, &app.configuration_secret_name(), AREA_CONFIGURATION)
            .await?;
        Ok(names_from_data(
            secret.data.as_ref().unwrap_or(&BTreeMap::new()),
        ))
    }

    pub async fn bound_configurations_set(
        &self,
        app: &AppRef,
        configuration_names: &[String],
        replace: bool,
    ) -> Result<(), AppError> {
        let configuration_names = configuration_names.to_vec();
        self.update(
            app,
            &app.configuration_secret_name(),
            AREA_CONFIGURATION,
            move |data| {
                if replace {
                    data.clear();
                }
                for name in &configuration_names {
                    data.insert(name.clone(), ByteString(Vec::new()));
                }
            },
        )
        .await
    }

    pub async fn bound_configurations_unset(
        &self,
        app: &AppRef,
        configuration_name: &str,
    ) -> Result<(), AppError> {
        let configuration_name = configuration_name.to_string();
        self.update(
            app,
            &app.configuration_secret_name(),
            AREA_CONFIGURATION,
            move |data| {
                data.remove(&configuration_name);
            },
        )
        .await
    }
}

/// Desired instance count from the scaling secret. Damaged or missing
/// data falls back to one instance; non-numeric text is an error.
pub fn scaling_from_data(data: &BTreeMap<String, ByteString>) -> Result<i32, AppError> {
    match data.get(DESIRED_INSTANCES_KEY) {
        None => Ok(1),
        Some(raw) if raw.0.is_empty() => Ok(1),
        Some(raw) => {
            let text = String::from_utf8(raw.0.clone())?;
            let instances: i32 = text.trim().parse()?;
            if instances < 0 { Ok(1) } else { Ok(instances) }
        }
    }
}

pub fn environment_from_data(data: &BTreeMap<String, ByteString>) -> EnvVariableMap {
    data.iter()
        .map(|(name, value)| {
            (
                name.clone(),
                String::from_utf8_lossy(&value.0).into_owned(),
            )
        })
        .collect()
}

/// Key names of a fact secret, sorted.
pub fn names_from_data(data: &BTreeMap<String, ByteString>) -> Vec<String> {
    data.keys().cloned().collect()
}
