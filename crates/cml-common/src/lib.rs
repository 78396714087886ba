// cml-common: Shared services for the CML runner.
// Depends on `cml-sdk`; holds the CI provider drivers, runner log parsing,
// Terraform provisioning and the traced host context.

pub mod constants;
pub mod drivers;
pub mod host_context;
pub mod http_client_factory;
pub mod log_parser;
pub mod secret_masker;
pub mod terraform;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use constants::{Architecture, OsPlatform, CURRENT_ARCHITECTURE, CURRENT_PLATFORM};
pub use drivers::{
    create_driver, is_still_running_job, DriverCapabilities, DriverError, DriverKind, JobRecord,
    JobStatus, LaunchRequest, RegisterRunnerRequest, RunnerCommand, RunnerDriver, RunnerInfo,
    RunnerRegistration,
};
pub use host_context::HostContext;
pub use http_client_factory::HttpClientFactory;
pub use log_parser::{
    parse_runner_log, resolve_job_identity, EventStatus, LifecycleEvent, LogPatterns,
};
pub use secret_masker::SecretMasker;
pub use terraform::{
    CloudInstanceDescriptor, CloudRunnerSpec, Provisioner, TerraformProvisioner, TerraformState,
};
pub use tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
