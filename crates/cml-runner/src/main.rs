// Entry point for the `cml` binary.
//
// Parses the command line, sets up logging and the host context, and hands
// over to `Runner`. The exit code is 0 for a graceful shutdown and 1 when
// an error caused it.

use clap::Parser;
use cml_common::constants::{self, variables};
use cml_common::HostContext;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use cml_runner::command_settings::{CommandSettings, LogFormat};
use cml_runner::runner::Runner;

fn main() {
    let settings = CommandSettings::parse();

    // Build the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move { run(settings).await });

    std::process::exit(exit_code);
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_env(variables::LOG_FILTER)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(settings: CommandSettings) -> i32 {
    init_logging(settings.log);

    tracing::debug!(
        "cml {} ({}) on {} / {}",
        cml_sdk::CmlPackage::VERSION,
        cml_sdk::Source::COMMIT_HASH,
        constants::CURRENT_PLATFORM,
        constants::CURRENT_ARCHITECTURE
    );

    let host_context =
        match HostContext::new("Runner", &HostContext::sensitive_env_from_environment()) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!("Failed to initialize: {:#}", e);
                return constants::return_code::TERMINATED_ERROR;
            }
        };

    let runner = Runner::new(Arc::clone(&host_context));
    match runner.execute_command(settings).await {
        Ok(exit_code) => exit_code,
        Err(e) => {
            tracing::error!("Runner failed with error: {:#}", e);
            constants::return_code::TERMINATED_ERROR
        }
    }
}
