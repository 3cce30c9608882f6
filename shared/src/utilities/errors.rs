#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0} environment variable not set error")]
    EnvironmentVariableNotSetError(String),
    #[error("{0}")]
    NotFoundError(String),
    #[error("Validation error, {0}")]
    ValidationError(String),
    #[error("Internal error, {0}")]
    InternalError(String),
    #[error("Staging of {app} is blocked, another build is already running")]
    StagingConflict { app: String },
    #[error("Staging job {job} failed")]
    StagingFailed { job: String },
    #[error("Staging job {job} still running after {seconds}s")]
    StagingTimeout { job: String, seconds: u64 },
    #[error("Release {release} not settled after {seconds}s")]
    DeployTimeout { release: String, seconds: u64 },
    #[error("Gave up updating {resource} after {attempts} conflicting writes")]
    RetriesExhausted { resource: String, attempts: u32 },
    #[error("Release operation failed, {0}")]
    ReleaseError(String),
    #[error("Kube error, {0}")]
    KubeError(#[from] kube::Error),
    #[error("Serde json error, {0}")]
    SerdejsonError(#[from] serde_json::Error),
    #[error("Serde yaml error, {0}")]
    SerdeyamlError(#[from] serde_yaml::Error),
    #[error("IO error, {0}")]
    IoError(#[from] std::io::Error),
    #[error("FromUtf8Error, {0}")]
    FromUtf8Error(#[from] std::string::FromUtf8Error),
    #[error("Attempted to parse a number to an integer but errored out: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("InClusterError, {0}")]
    InClusterError(#[from] kube_client::config::InClusterError),
    #[error("KubeconfigError, {0}")]
    KubeconfigError(#[from] kube_client::config::KubeconfigError),
    #[error("InferConfigError, {0}")]
    InferConfigError(#[from] kube_client::config::InferConfigError),
}
