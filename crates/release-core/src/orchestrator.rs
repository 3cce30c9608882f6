use std::time::Duration;

use kube::Client;
use tracing::{info, warn};

use shared::{
    models::{AppProbes, AppRef, EnvVariableMap, StageRef},
    utilities::{config::Config, errors::AppError},
};

use crate::admission::AdmissionController;
use crate::app::{App, Apps};
use crate::chart::{self, ChartInput};
use crate::lineage::{self, LineageTracker};
use crate::staging::{StageParams, Stager};
use crate::state::StateStore;
use crate::sync::{ReleaseManager, ReleaseSynchronizer};
use crate::workload::Workloads;

/// Resolves which source blob a build uses: the caller's explicit choice
/// wins, otherwise the blob of the previous build. An application that
/// never received a blob cannot be built.
pub fn resolve_blob(
    requested: Option<String>,
    recorded: Option<String>,
    app: &AppRef,
) -> Result<String, AppError> {
    requested.or(recorded).ok_or_else(|| {
        AppError::ValidationError(format!(
            "application {}/{} has no source blob to build from",
            app.namespace, app.name
        ))
    })
}

/// Resolves the builder image: explicit choice, then whatever the
/// previous build used, then the cluster default. An empty result means
/// there is nothing to build with.
pub fn resolve_builder(
    requested: Option<String>,
    recorded: Option<String>,
    default: &str,
) -> Result<String, AppError> {
    let builder = requested
        .filter(|image| !image.is_empty())
        .or(recorded.filter(|image| !image.is_empty()))
        .unwrap_or_else(|| default.to_string());

    if builder.is_empty() {
        return Err(AppError::ValidationError(
            "no builder image requested, recorded, or configured".to_string(),
        ));
    }
    Ok(builder)
}

/// The release pipeline front door. Every operation resolves the
/// application record first, reads desired state from the store, and
/// drives the staging or release machinery accordingly.
pub struct Orchestrator<M> {
    config: Config,
    apps: Apps,
    store: StateStore,
    admission: AdmissionController,
    lineage: LineageTracker,
    stager: Stager,
    synchronizer: ReleaseSynchronizer<M>,
    workloads: Workloads,
}

impl<M: ReleaseManager> Orchestrator<M> {
    pub fn new(client: Client, config: Config, manager: M) -> Self {
        Self {
            apps: Apps::new(client.clone()),
            store: StateStore::new(client.clone()),
            admission: AdmissionController::new(client.clone(), &config.staging_namespace),
            lineage: LineageTracker::new(client.clone(), &config.staging_namespace),
            stager: Stager::new(client.clone(), &config),
            synchronizer: ReleaseSynchronizer::new(manager),
            workloads: Workloads::new(client),
            config,
        }
    }

    pub fn apps(&self) -> &Apps {
        &self.apps
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub async fn create_app(
        &self,
        app: &AppRef,
        routes: Vec<String>,
        chart: Option<String>,
    ) -> Result<App, AppError> {
        self.apps.create(app, routes, chart).await
    }

    /// Admits and submits a new build. Returns its identity; the caller
    /// follows up with [`await_staged`](Self::await_staged) to learn the
    /// outcome.
    pub async fn stage(
        &self,
        app: &AppRef,
        blob_uid: Option<String>,
        builder_image: Option<String>,
    ) -> Result<StageRef, AppError> {
        let record = self.apps.get(app).await?;

        let blob_uid = resolve_blob(blob_uid, record.spec.blob_uid.clone(), app)?;
        let builder_image = resolve_builder(
            builder_image,
            record.spec.builder_image.clone(),
            &self.config.default_builder_image,
        )?;

        let (stage, previous_id) = lineage::next(record.spec.stage_id.clone());
        self.admission.claim(app, &stage).await?;

        self.stager.ensure_cache_pvc(app).await?;
        let environment = self.store.environment(app).await?;

        let params = StageParams {
            app: app.clone(),
            image_url: app.image_url(&self.config.registry_url, &stage.id),
            previous_image_url: app.image_url(&self.config.registry_url, &previous_id),
            stage: stage.clone(),
            previous_id,
            blob_uid: blob_uid.clone(),
            builder_image: builder_image.clone(),
            environment,
        };

        self.stager.submit(&params).await?;
        self.apps
            .record_staging(app, &stage.id, &blob_uid, &builder_image)
            .await?;

        Ok(stage)
    }

    /// Blocks until the build completes, fails, or runs out the
    /// configured staging timeout.
    pub async fn await_staged(&self, app: &AppRef, stage: &StageRef) -> Result<(), AppError> {
        self.stager
            .wait_done(
                app,
                stage,
                Duration::from_secs(self.config.staging_timeout_secs),
            )
            .await
    }

    /// Rolls the application's release onto the image of the given
    /// build. The rendered chart values reflect the stored desired state
    /// at this moment. Returns the routes the release serves.
    pub async fn deploy(
        &self,
        app: &AppRef,
        stage_id: &str,
        restart: bool,
    ) -> Result<Vec<String>, AppError> {
        let record = self.apps.get(app).await?;
        let image_url = app.image_url(&self.config.registry_url, stage_id);

        let input = ChartInput {
            app: app.clone(),
            image_url: image_url.clone(),
            instances: self.store.scaling(app).await?,
            probes: self.store.probes(app).await?,
            environment: self.store.environment(app).await?,
            configurations: self.store.bound_configurations(app).await?,
            services: self.store.bound_services(app).await?,
            routes: record.spec.routes.clone(),
            ingress_class_name: self.config.ingress_class_name.clone(),
            tls_issuer: self.config.tls_issuer.clone(),
            stage_id: stage_id.to_string(),
            start: restart.then(chart::restart_nonce),
        };
        let values = chart::render(&input)?;

        self.synchronizer
            .install_or_upgrade(&app.namespace, &app.release_name(), &values)
            .await?;

        self.apps
            .record_deployment(app, stage_id, &image_url)
            .await?;

        // superseded builds are garbage now, but the release is up either way
        if let Err(e) = self.lineage.unstage(app, Some(stage_id)).await {
            warn!(
                "Could not clean superseded builds of {}/{}: {}",
                app.namespace, app.name, e
            );
        }

        info!("Deployed {}/{} at build {}", app.namespace, app.name, stage_id);
        Ok(record.spec.routes)
    }

    /// Stores the desired instance count. A running release is rolled
    /// immediately; otherwise the count applies on the next deploy.
    pub async fn set_scaling(&self, app: &AppRef, instances: i32) -> Result<(), AppError> {
        self.store.set_scaling(app, instances).await?;

        let record = self.apps.get(app).await?;
        if let Some(stage_id) = record.spec.stage_id
            && self.workloads.exists(app).await?
        {
            self.deploy(app, &stage_id, false).await?;
        }
        Ok(())
    }

    /// Stores environment assignments and, when a workload is running,
    /// rewrites its secret references so the pods pick the change up.
    pub async fn set_environment(
        &self,
        app: &AppRef,
        assignments: EnvVariableMap,
        replace: bool,
    ) -> Result<(), AppError> {
        self.store.set_environment(app, assignments, replace).await?;
        self.refresh_workload_environment(app).await
    }

    pub async fn unset_environment(&self, app: &AppRef, var_name: &str) -> Result<(), AppError> {
        self.store.unset_environment(app, var_name).await?;
        self.refresh_workload_environment(app).await
    }

    async fn refresh_workload_environment(&self, app: &AppRef) -> Result<(), AppError> {
        let var_names = self.store.environment_names(app).await?;
        self.workloads.sync_environment(app, var_names).await?;
        Ok(())
    }

    /// Stores probe documents. They take effect on the next deploy.
    pub async fn set_probes(&self, app: &AppRef, probes: &AppProbes) -> Result<(), AppError> {
        self.store.set_probes(app, probes).await
    }

    /// Records the binding and, when a workload is running, mounts the
    /// service's credential secret into it.
    pub async fn bind_service(&self, app: &AppRef, service_name: &str) -> Result<(), AppError> {
        self.store
            .bound_services_set(app, &[service_name.to_string()], false)
            .await?;
        self.workloads.bind_service(app, service_name).await?;
        Ok(())
    }

    pub async fn unbind_service(&self, app: &AppRef, service_name: &str) -> Result<(), AppError> {
        self.store.bound_services_unset(app, service_name).await?;
        self.workloads.unbind_service(app, service_name).await?;
        Ok(())
    }

    /// Records a configuration binding. It takes effect on the next
    /// deploy, when the chart mounts the bound set.
    pub async fn bind_configuration(
        &self,
        app: &AppRef,
        configuration_name: &str,
    ) -> Result<(), AppError> {
        self.store
            .bound_configurations_set(app, &[configuration_name.to_string()], false)
            .await
    }

    pub async fn unbind_configuration(
        &self,
        app: &AppRef,
        configuration_name: &str,
    ) -> Result<(), AppError> {
        self.store
            .bound_configurations_unset(app, configuration_name)
            .await
    }

    /// Rolls the pods of a running release without touching its state.
    pub async fn restart(&self, app: &AppRef) -> Result<bool, AppError> {
        self.workloads.restart(app).await
    }

    /// Tears the application down: release, build artifacts, cache, and
    /// finally the record, which cascades to the fact secrets.
    pub async fn delete_app(&self, app: &AppRef) -> Result<(), AppError> {
        self.synchronizer
            .uninstall_if_present(&app.namespace, &app.release_name())
            .await?;
        self.lineage.unstage(app, None).await?;
        self.admission.clear(app).await?;
        self.stager.delete_cache_pvc(app).await?;
        self.apps.delete(app).await
    }
}
