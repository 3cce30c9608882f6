use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use tokio::fs;
use tracing::Level;

use crate::utilities::errors::AppError;

#[derive(Clone, Debug)]
pub struct Config {
    // KUBERNETES
    pub k8s_in_cluster: bool,
    pub k8s_config_path: Option<String>,

    pub tracing_level: Level,

    // STAGING
    pub staging_namespace: String,
    pub default_builder_image: String,
    pub download_image: String,
    pub unpack_image: String,
    pub staging_timeout_secs: u64,
    pub cache_storage_size: String,

    // REGISTRY
    pub registry_url: String,
    pub registry_credentials_secret: String,
    pub registry_certificate_secret: Option<String>,

    // BLOB STORE (S3 style, consumed by the download init container)
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub s3_use_ssl: bool,
    pub s3_connection_secret: String,

    // DEPLOY
    pub deployment_chart: String,
    pub tls_issuer: String,
    pub ingress_class_name: Option<String>,
    pub deploy_timeout_secs: u64,

    // JANITOR
    pub janitor_sweep_secs: u64,
}

impl Config {
    pub async fn init() -> Result<Self, AppError> {
        let k8s_config_path =
            get_optional_config_value("K8S_KUBECONFIG", Some("K8S_KUBECONFIG"), None).await?;
        let k8s_in_cluster =
            get_config_value("K8S_IN_CLUSTER", Some("K8S_IN_CLUSTER"), None, Some(false)).await?;

        let tracing_level = get_config_value(
            "TRACING_LEVEL",
            Some("TRACING_LEVEL"),
            None,
            Some(Level::DEBUG),
        )
        .await?;

        let staging_namespace = get_config_value(
            "STAGING_NAMESPACE",
            Some("STAGING_NAMESPACE"),
            None,
            Some("stratus-staging".to_string()),
        )
        .await?;

        let default_builder_image = get_config_value(
            "DEFAULT_BUILDER_IMAGE",
            Some("DEFAULT_BUILDER_IMAGE"),
            None,
            Some("paketobuildpacks/builder-jammy-full:latest".to_string()),
        )
        .await?;

        let download_image = get_config_value(
            "DOWNLOAD_IMAGE",
            Some("DOWNLOAD_IMAGE"),
            None,
            Some("amazon/aws-cli:2.15.30".to_string()),
        )
        .await?;

        let unpack_image = get_config_value(
            "UNPACK_IMAGE",
            Some("UNPACK_IMAGE"),
            None,
            Some("bash:5.2".to_string()),
        )
        .await?;

        let staging_timeout_secs = get_config_value(
            "STAGING_TIMEOUT_SECS",
            Some("STAGING_TIMEOUT_SECS"),
            None,
            Some(3600),
        )
        .await?;

        let cache_storage_size = get_config_value(
            "CACHE_STORAGE_SIZE",
            Some("CACHE_STORAGE_SIZE"),
            None,
            Some("2Gi".to_string()),
        )
        .await?;

        let registry_url = get_config_value(
            "REGISTRY_URL",
            Some("REGISTRY_URL"),
            None,
            Some("registry.stratus-registry.svc.cluster.local:5000/apps".to_string()),
        )
        .await?;

        let registry_credentials_secret = get_config_value(
            "REGISTRY_CREDENTIALS_SECRET",
            Some("REGISTRY_CREDENTIALS_SECRET"),
            None,
            Some("registry-creds".to_string()),
        )
        .await?;

        let registry_certificate_secret = get_optional_config_value(
            "REGISTRY_CERTIFICATE_SECRET",
            Some("REGISTRY_CERTIFICATE_SECRET"),
            None,
        )
        .await?;

        let s3_endpoint = get_config_value(
            "S3_ENDPOINT",
            Some("S3_ENDPOINT"),
            None,
            Some("minio.stratus-minio.svc.cluster.local:9000".to_string()),
        )
        .await?;

        let s3_bucket = get_config_value(
            "S3_BUCKET",
            Some("S3_BUCKET"),
            None,
            Some("stratus-sources".to_string()),
        )
        .await?;

        let s3_use_ssl =
            get_config_value("S3_USE_SSL", Some("S3_USE_SSL"), None, Some(false)).await?;

        let s3_connection_secret = get_config_value(
            "S3_CONNECTION_SECRET",
            Some("S3_CONNECTION_SECRET"),
            None,
            Some("staging-blobs".to_string()),
        )
        .await?;

        let deployment_chart = get_config_value(
            "DEPLOYMENT_CHART",
            Some("DEPLOYMENT_CHART"),
            None,
            Some("oci://ghcr.io/stratus-paas/charts/stratus-app".to_string()),
        )
        .await?;

        let tls_issuer = get_config_value(
            "TLS_ISSUER",
            Some("TLS_ISSUER"),
            None,
            Some("stratus-ca".to_string()),
        )
        .await?;

        let ingress_class_name =
            get_optional_config_value("INGRESS_CLASS_NAME", Some("INGRESS_CLASS_NAME"), None)
                .await?;

        let deploy_timeout_secs = get_config_value(
            "DEPLOY_TIMEOUT_SECS",
            Some("DEPLOY_TIMEOUT_SECS"),
            None,
            Some(300),
        )
        .await?;

        let janitor_sweep_secs = get_config_value(
            "JANITOR_SWEEP_SECS",
            Some("JANITOR_SWEEP_SECS"),
            None,
            Some(600),
        )
        .await?;

        let config = Config {
            k8s_in_cluster,
            k8s_config_path,
            tracing_level,
            staging_namespace,
            default_builder_image,
            download_image,
            unpack_image,
            staging_timeout_secs,
            cache_storage_size,
            registry_url,
            registry_credentials_secret,
            registry_certificate_secret,
            s3_endpoint,
            s3_bucket,
            s3_use_ssl,
            s3_connection_secret,
            deployment_chart,
            tls_issuer,
            ingress_class_name,
            deploy_timeout_secs,
            janitor_sweep_secs,
        };

        Ok(config)
    }
}

pub async fn get_optional_config_value<T>(
    secret_name: &str,
    env_name: Option<&str>,
    fallback_path: Option<&PathBuf>,
) -> Result<Option<T>, AppError>
where
    T: FromStr,
{
    // Docker secret
    let docker_secret = Path::new("/run/secrets").join(secret_name);
    if docker_secret.exists() {
        if let Ok(content) = fs::read_to_string(&docker_secret).await {
            if let Ok(parsed) = T::from_str(content.trim()) {
                return Ok(Some(parsed));
            }
        }
    }

    // Env var
    if let Some(env_key) = env_name
        && let Ok(val) = std::env::var(env_key)
    {
        if let Ok(parsed) = T::from_str(val.trim()) {
            return Ok(Some(parsed));
        }
    }

    // Fallback path
    if let Some(path) = fallback_path
        && path.exists()
    {
        if let Ok(content) = fs::read_to_string(path).await {
            if let Ok(parsed) = T::from_str(content.trim()) {
                return Ok(Some(parsed));
            }
        }
    }

    Ok(None)
}

pub async fn get_config_value<T>(
    secret_name: &str,
    env_name: Option<&str>,
    fallback_path: Option<&PathBuf>,
    fallback: Option<T>,
) -> Result<T, AppError>
where
    T: FromStr + Clone,
{
    if let Some(value) =
        get_optional_config_value::<T>(secret_name, env_name, fallback_path).await?
    {
        return Ok(value);
    }

    fallback.ok_or_else(|| {
        AppError::EnvironmentVariableNotSetError(env_name.unwrap_or(secret_name).to_string())
    })
}
