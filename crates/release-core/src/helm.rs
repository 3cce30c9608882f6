use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use shared::utilities::{config::Config, errors::AppError};

use crate::sync::ReleaseManager;

/// Drives the `helm` binary. Values are piped over stdin so nothing
/// lands on disk.
#[derive(Clone, Debug)]
pub struct HelmCli {
    chart: String,
    timeout_secs: u64,
}

impl HelmCli {
    pub fn new(chart: &str, timeout_secs: u64) -> Self {
        Self {
            chart: chart.to_string(),
            timeout_secs,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.deployment_chart, config.deploy_timeout_secs)
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<std::process::Output, AppError> {
        debug!("helm {}", args.join(" "));

        let mut command = Command::new("helm");
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn()?;

        if let Some(input) = stdin {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| AppError::InternalError("no stdin pipe on helm child".to_string()))?;
            pipe.write_all(input.as_bytes()).await?;
            // closing the pipe tells helm the values are complete
            drop(pipe);
        }

        Ok(child.wait_with_output().await?)
    }
}

impl ReleaseManager for HelmCli {
    async fn install_or_upgrade(
        &self,
        namespace: &str,
        release: &str,
        values_yaml: &str,
    ) -> Result<(), AppError> {
        let timeout = format!("{}s", self.timeout_secs);
        let output = self
            .run(
                &[
                    "upgrade",
                    "--install",
                    release,
                    &self.chart,
                    "--namespace",
                    namespace,
                    "--values",
                    "-",
                    "--wait",
                    "--timeout",
                    &timeout,
                ],
                Some(values_yaml),
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("timed out") {
                return Err(AppError::DeployTimeout {
                    release: release.to_string(),
                    seconds: self.timeout_secs,
                });
            }
            return Err(AppError::ReleaseError(format!(
                "helm upgrade of {release} failed: {}",
                stderr.trim()
            )));
        }

        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<(), AppError> {
        let output = self
            .run(
                &["uninstall", release, "--namespace", namespace, "--wait"],
                None,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not found") {
                return Ok(());
            }
            return Err(AppError::ReleaseError(format!(
                "helm uninstall of {release} failed: {}",
                stderr.trim()
            )));
        }

        Ok(())
    }

    async fn exists(&self, namespace: &str, release: &str) -> Result<bool, AppError> {
        let output = self
            .run(&["status", release, "--namespace", namespace], None)
            .await?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") {
            return Ok(false);
        }

        Err(AppError::ReleaseError(format!(
            "helm status of {release} failed: {}",
            stderr.trim()
        )))
    }
}
