use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, KeyToPath, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    Api, Client,
    api::{DeleteParams, PostParams},
};
use tokio::time::{Instant, interval};
use tracing::{info, warn};

use shared::{
    models::{AppRef, COMPONENT_APPLICATION, EnvVariableMap, StageRef, app_labels},
    utilities::{config::Config, errors::AppError},
};

use crate::admission::{StagingStatus, job_staging_status};
use crate::lineage::staging_labels;

// The buildpack user inside paketo builder images.
const BUILD_USER_ID: i64 = 1000;
const BUILD_GROUP_ID: i64 = 1000;

const WAIT_POLL_SECS: u64 = 2;

/// Cluster-level knobs for build composition, lifted out of the config.
#[derive(Clone, Debug)]
pub struct StageSettings {
    pub download_image: String,
    pub unpack_image: String,
    pub registry_credentials_secret: String,
    pub registry_certificate_secret: Option<String>,
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_use_ssl: bool,
    pub s3_connection_secret: String,
    pub cache_storage_size: String,
}

impl From<&Config> for StageSettings {
    fn from(config: &Config) -> Self {
        Self {
            download_image: config.download_image.clone(),
            unpack_image: config.unpack_image.clone(),
            registry_credentials_secret: config.registry_credentials_secret.clone(),
            registry_certificate_secret: config.registry_certificate_secret.clone(),
            s3_endpoint: config.s3_endpoint.clone(),
            s3_bucket: config.s3_bucket.clone(),
            s3_use_ssl: config.s3_use_ssl,
            s3_connection_secret: config.s3_connection_secret.clone(),
            cache_storage_size: config.cache_storage_size.clone(),
        }
    }
}

/// Everything one build needs: identity, lineage, source blob, builder
/// and the user environment copied into the build.
#[derive(Clone, Debug)]
pub struct StageParams {
    pub app: AppRef,
    pub stage: StageRef,
    pub previous_id: String,
    pub blob_uid: String,
    pub builder_image: String,
    pub image_url: String,
    pub previous_image_url: String,
    pub environment: EnvVariableMap,
}

fn stage_env(settings: &StageSettings, params: &StageParams) -> Vec<EnvVar> {
    let protocol = if settings.s3_use_ssl { "https" } else { "http" };

    let plain = |name: &str, value: &str| EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    };

    vec![
        plain("PROTOCOL", protocol),
        plain("ENDPOINT", &settings.s3_endpoint),
        plain("BUCKET", &settings.s3_bucket),
        plain("BLOBID", &params.blob_uid),
        plain("PREIMAGE", &params.previous_image_url),
        plain("APPIMAGE", &params.image_url),
        plain("USERID", &BUILD_USER_ID.to_string()),
        plain("GROUPID", &BUILD_GROUP_ID.to_string()),
    ]
}

fn stage_mounts(settings: &StageSettings) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: "source".to_string(),
            sub_path: Some("source".to_string()),
            mount_path: "/workspace/source".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "cache".to_string(),
            sub_path: Some("cache".to_string()),
            mount_path: "/workspace/cache".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "registry-creds".to_string(),
            mount_path: "/home/cnb/.docker/".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "app-environment".to_string(),
            mount_path: "/workspace/source/appenv".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "s3-creds".to_string(),
            mount_path: "/root/.aws".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];

    if settings.registry_certificate_secret.is_some() {
        mounts.push(VolumeMount {
            name: "registry-certs".to_string(),
            mount_path: "/certs".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    mounts
}

fn stage_volumes(
    settings: &StageSettings,
    params: &StageParams,
    env_secret_name: &str,
) -> Vec<Volume> {
    let mut volumes = vec![
        Volume {
            name: "cache".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: params.app.cache_pvc_name(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
        Volume {
            name: "source".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            // see the env secret created next to the job
            name: "app-environment".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(env_secret_name.to_string()),
                default_mode: Some(420),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "s3-creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(settings.s3_connection_secret.clone()),
                default_mode: Some(420),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "registry-creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(settings.registry_credentials_secret.clone()),
                default_mode: Some(420),
                items: Some(vec![KeyToPath {
                    key: ".dockerconfigjson".to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    if let Some(cert_secret) = &settings.registry_certificate_secret {
        volumes.push(Volume {
            name: "registry-certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(cert_secret.clone()),
                default_mode: Some(420),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    volumes
}

/// Builds the staging job and its env secret. The secret carries a copy
/// of the user environment and shares the job's name and labels.
pub fn compose(settings: &StageSettings, params: &StageParams) -> (Job, Secret) {
    let job_name = params.app.staging_job_name(&params.stage.id);
    let env_secret_name = params.app.staging_env_secret_name(&params.stage.id);
    let labels = staging_labels(
        &params.app,
        &params.stage,
        &params.previous_id,
        &params.blob_uid,
    );

    let env = stage_env(settings, params);
    let mounts = stage_mounts(settings);
    let volumes = stage_volumes(settings, params, &env_secret_name);

    let download_script = "aws --no-progress --endpoint-url \"${PROTOCOL}://${ENDPOINT}\" \
         s3 cp \"s3://${BUCKET}/${BLOBID}\" /workspace/source/blob"
        .to_string();
    let unpack_script = "mkdir -p /workspace/source/app && \
         tar -xmf /workspace/source/blob -C /workspace/source/app"
        .to_string();
    let build_script = "/cnb/lifecycle/creator \
         -app=/workspace/source/app -cache-dir=/workspace/cache \"${APPIMAGE}\""
        .to_string();

    let shell = |script: String| {
        (
            Some(vec!["/bin/bash".to_string()]),
            Some(vec!["-c".to_string(), script]),
        )
    };

    let (download_cmd, download_args) = shell(download_script);
    let (unpack_cmd, unpack_args) = shell(unpack_script);
    let (build_cmd, build_args) = shell(build_script);

    let data: BTreeMap<String, k8s_openapi::ByteString> = params
        .environment
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                k8s_openapi::ByteString(value.clone().into_bytes()),
            )
        })
        .collect();

    let env_secret = Secret {
        metadata: ObjectMeta {
            name: Some(env_secret_name),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![
                        Container {
                            name: "download".to_string(),
                            image: Some(settings.download_image.clone()),
                            command: download_cmd,
                            args: download_args,
                            env: Some(env.clone()),
                            volume_mounts: Some(mounts.clone()),
                            ..Default::default()
                        },
                        Container {
                            name: "unpack".to_string(),
                            image: Some(settings.unpack_image.clone()),
                            command: unpack_cmd,
                            args: unpack_args,
                            env: Some(env.clone()),
                            volume_mounts: Some(mounts.clone()),
                            ..Default::default()
                        },
                    ]),
                    containers: vec![Container {
                        name: "buildpack".to_string(),
                        image: Some(params.builder_image.clone()),
                        command: build_cmd,
                        args: build_args,
                        env: Some(env),
                        volume_mounts: Some(mounts),
                        security_context: Some(SecurityContext {
                            run_as_user: Some(BUILD_USER_ID),
                            run_as_group: Some(BUILD_GROUP_ID),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    (job, env_secret)
}

/// Submits builds to the staging namespace and waits on them.
#[derive(Clone)]
pub struct Stager {
    client: Client,
    staging_namespace: String,
    settings: StageSettings,
}

impl Stager {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            staging_namespace: config.staging_namespace.clone(),
            settings: StageSettings::from(config),
        }
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// The per-app build cache volume, created on first use.
    pub async fn ensure_cache_pvc(&self, app: &AppRef) -> Result<(), AppError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.staging_namespace);
        let pvc_name = app.cache_pvc_name();

        match api.get(&pvc_name).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(pvc_name.clone()),
                namespace: Some(self.staging_namespace.clone()),
                labels: Some(app_labels(app, COMPONENT_APPLICATION)),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(self.settings.cache_storage_size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &pvc).await {
            Ok(_) => {
                info!("Created build cache {} for {}/{}", pvc_name, app.namespace, app.name);
                Ok(())
            }
            // someone else created it between our get and create
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_cache_pvc(&self, app: &AppRef) -> Result<(), AppError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.staging_namespace);
        match api
            .delete(&app.cache_pvc_name(), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates the env secret and the job. Admission was decided by the
    /// claim before composing; a create conflict here is a backstop and
    /// refuses the same way.
    pub async fn submit(&self, params: &StageParams) -> Result<(), AppError> {
        let (job, env_secret) = compose(&self.settings, params);

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.staging_namespace);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.staging_namespace);

        match secrets.create(&PostParams::default(), &env_secret).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                return Err(AppError::StagingConflict {
                    app: format!("{}/{}", params.app.namespace, params.app.name),
                });
            }
            Err(e) => return Err(e.into()),
        }

        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(
                    "Submitted build {} for {}/{}",
                    params.stage.id, params.app.namespace, params.app.name
                );
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // the env secret is ours, clean it up before refusing
                let name = params.app.staging_env_secret_name(&params.stage.id);
                if let Err(e) = secrets.delete(&name, &DeleteParams::default()).await {
                    warn!("Could not remove env secret {}: {}", name, e);
                }
                Err(AppError::StagingConflict {
                    app: format!("{}/{}", params.app.namespace, params.app.name),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Polls the build's job until it reaches a terminal condition.
    /// Running past the deadline is a timeout, distinct from failure.
    pub async fn wait_done(
        &self,
        app: &AppRef,
        stage: &StageRef,
        timeout: Duration,
    ) -> Result<(), AppError> {
        let job_name = app.staging_job_name(&stage.id);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.staging_namespace);

        let deadline = Instant::now() + timeout;
        let mut ticker = interval(Duration::from_secs(WAIT_POLL_SECS));

        loop {
            ticker.tick().await;

            let job = match jobs.get(&job_name).await {
                Ok(job) => job,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Err(AppError::NotFoundError(format!(
                        "staging job {job_name} not found"
                    )));
                }
                Err(e) => return Err(e.into()),
            };

            match job_staging_status(&job) {
                StagingStatus::Done => {
                    info!("Build {} of {}/{} complete", stage.id, app.namespace, app.name);
                    return Ok(());
                }
                StagingStatus::Failed => {
                    return Err(AppError::StagingFailed { job: job_name });
                }
                StagingStatus::Active => {}
            }

            if Instant::now() >= deadline {
                return Err(AppError::StagingTimeout {
                    job: job_name,
                    seconds: timeout.as_secs(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::{LABEL_STAGE_ID, LABEL_STAGE_ID_PREVIOUS};

    fn settings() -> StageSettings {
        StageSettings {
            download_image: "amazon/aws-cli:2.15.30".to_string(),
            unpack_image: "bash:5.2".to_string(),
            registry_credentials_secret: "registry-creds".to_string(),
            registry_certificate_secret: None,
            s3_endpoint: "minio.local:9000".to_string(),
            s3_bucket: "sources".to_string(),
            s3_use_ssl: false,
            s3_connection_secret: "staging-blobs".to_string(),
            cache_storage_size: "2Gi".to_string(),
        }
    }

    fn params() -> StageParams {
        let app = AppRef::new("myapp", "workspace");
        let image_url = app.image_url("registry.local:5000/apps", "ffff");
        let previous_image_url = app.image_url("registry.local:5000/apps", "eeee");
        StageParams {
            app,
            stage: StageRef {
                id: "ffff".to_string(),
            },
            previous_id: "eeee".to_string(),
            blob_uid: "blob-1".to_string(),
            builder_image: "paketobuildpacks/builder-jammy-full:latest".to_string(),
            image_url,
            previous_image_url,
            environment: EnvVariableMap::from([("PORT".to_string(), "8080".to_string())]),
        }
    }

    #[test]
    fn test_compose_job_shape() {
        let (job, _) = compose(&settings(), &params());

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let init = pod.init_containers.unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[0].name, "download");
        assert_eq!(init[1].name, "unpack");

        assert_eq!(pod.containers.len(), 1);
        assert_eq!(pod.containers[0].name, "buildpack");
        assert_eq!(
            pod.containers[0].image.as_deref(),
            Some("paketobuildpacks/builder-jammy-full:latest")
        );
    }

    #[test]
    fn test_compose_lineage_labels() {
        let (job, env_secret) = compose(&settings(), &params());
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_STAGE_ID).map(String::as_str), Some("ffff"));
        assert_eq!(
            labels.get(LABEL_STAGE_ID_PREVIOUS).map(String::as_str),
            Some("eeee")
        );
        assert_eq!(env_secret.metadata.labels.unwrap(), labels);
    }

    #[test]
    fn test_compose_env_carries_image_urls() {
        let (job, _) = compose(&settings(), &params());
        let pod = job.spec.unwrap().template.spec.unwrap();
        let env = pod.containers[0].env.clone().unwrap();

        let get = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };

        assert_eq!(
            get("APPIMAGE").unwrap(),
            "registry.local:5000/apps/workspace-myapp:ffff"
        );
        assert_eq!(
            get("PREIMAGE").unwrap(),
            "registry.local:5000/apps/workspace-myapp:eeee"
        );
        assert_eq!(get("BLOBID").unwrap(), "blob-1");
        assert_eq!(get("PROTOCOL").unwrap(), "http");
    }

    #[test]
    fn test_compose_env_secret_copies_user_environment() {
        let (_, env_secret) = compose(&settings(), &params());

        let data = env_secret.data.unwrap();
        assert_eq!(data.get("PORT").unwrap().0, b"8080".to_vec());
    }

    #[test]
    fn test_compose_env_secret_uses_the_name_cleanup_deletes() {
        let (job, env_secret) = compose(&settings(), &params());
        let app = params().app;

        assert_eq!(
            env_secret.metadata.name.as_deref(),
            Some(app.staging_env_secret_name("ffff").as_str())
        );
        assert_ne!(env_secret.metadata.name, job.metadata.name);

        // the job must mount the secret under that same name
        let pod = job.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        let env_volume = volumes
            .iter()
            .find(|v| v.name == "app-environment")
            .unwrap();
        assert_eq!(
            env_volume.secret.as_ref().unwrap().secret_name,
            env_secret.metadata.name
        );
    }

    #[test]
    fn test_compose_cert_mount_only_when_configured() {
        let (job, _) = compose(&settings(), &params());
        let pod = job.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert!(!volumes.iter().any(|v| v.name == "registry-certs"));

        let mut with_certs = settings();
        with_certs.registry_certificate_secret = Some("registry-tls".to_string());
        let (job, _) = compose(&with_certs, &params());
        let pod = job.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == "registry-certs"));
        let mounts = pod.containers[0].volume_mounts.clone().unwrap();
        assert!(mounts.iter().any(|m| m.name == "registry-certs"));
    }

    #[test]
    fn test_compose_cache_volume_uses_app_pvc() {
        let (job, _) = compose(&settings(), &params());
        let pod = job.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        let cache = volumes.iter().find(|v| v.name == "cache").unwrap();
        assert_eq!(
            cache.persistent_volume_claim.as_ref().unwrap().claim_name,
            params().app.cache_pvc_name()
        );
    }
}
