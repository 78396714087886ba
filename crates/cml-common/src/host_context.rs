// HostContext: the shared application context handed to every component.
// Owns the secret masker, the trace manager, the HTTP client and the
// process-wide cancellation token.

use crate::constants::variables;
use crate::http_client_factory::HttpClientFactory;
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, TraceSetting, Tracing};

use anyhow::Result;
use cml_sdk::{CmlPackage, Source};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The central application context.
///
/// Created once by the entry point. Components take what they need from it
/// (named trace sources, the HTTP client) instead of reaching for globals.
pub struct HostContext {
    host_type: String,

    /// Cancelled once the process is about to exit; background tasks stop on it.
    process_token: CancellationToken,

    /// Secret masker shared across the entire process.
    pub secret_masker: Arc<SecretMasker>,

    trace_manager: TraceManager,

    http_client: reqwest::Client,
}

impl HostContext {
    /// Create a new `HostContext`.
    ///
    /// Values of the sensitive environment variables are registered with
    /// the masker straight away.
    pub fn new(host_type: impl Into<String>, sensitive_env: &[String]) -> Result<Arc<Self>> {
        let secret_masker = Arc::new(SecretMasker::new());
        secret_masker.add_env_values(sensitive_env);

        let trace_manager =
            TraceManager::with_setting(secret_masker.clone(), TraceSetting::default());
        let http_client = HttpClientFactory::create_client(&Self::default_user_agent())?;

        Ok(Arc::new(Self {
            host_type: host_type.into(),
            process_token: CancellationToken::new(),
            secret_masker,
            trace_manager,
            http_client,
        }))
    }

    /// Context for tests: nothing read from the environment.
    pub fn for_tests() -> Arc<Self> {
        let secret_masker = Arc::new(SecretMasker::new());
        Arc::new(Self {
            host_type: "Test".to_string(),
            process_token: CancellationToken::new(),
            trace_manager: TraceManager::new(secret_masker.clone()),
            secret_masker,
            http_client: reqwest::Client::new(),
        })
    }

    /// The deny list from `CML_RUNNER_SENSITIVE_ENV`, or the built-in default.
    pub fn sensitive_env_from_environment() -> Vec<String> {
        match std::env::var(variables::SENSITIVE_ENV) {
            Ok(value) if !value.trim().is_empty() => cml_sdk::StringUtil::split_list(&value),
            _ => variables::default_sensitive_env(),
        }
    }

    pub fn default_user_agent() -> String {
        format!(
            "{}/{} ({})",
            CmlPackage::PACKAGE_NAME,
            CmlPackage::VERSION,
            Source::COMMIT_HASH
        )
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Get a trace source for the given component name.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.http_client
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    /// Token cancelled when the process is shutting down for good.
    pub fn process_token(&self) -> CancellationToken {
        self.process_token.clone()
    }

    pub fn cancel_background_tasks(&self) {
        self.process_token.cancel();
    }
}
