use kube::{
    Client, Config as KubeConfig,
    config::{KubeConfigOptions, Kubeconfig},
};
use tracing::info;

use crate::utilities::{config::Config, errors::AppError};

/// Holds the cluster connection. In-cluster config wins; otherwise an
/// explicit kubeconfig path, otherwise whatever the environment infers.
pub struct Kubernetes {
    pub client: Client,
}

impl Kubernetes {
    pub async fn new(config: &Config) -> Result<Self, AppError> {
        let kube_config = if config.k8s_in_cluster {
            info!("Using in-cluster kubernetes config");
            KubeConfig::incluster()?
        } else if let Some(path) = &config.k8s_config_path {
            info!("Using kubeconfig from {}", path);
            let kubeconfig = Kubeconfig::read_from(path)?;
            KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        } else {
            KubeConfig::infer().await?
        };

        let client = Client::try_from(kube_config)?;

        Ok(Self { client })
    }
}
