// cml-runner: the `cml` command and the runner lifecycle.
// Depends on `cml-sdk` and `cml-common`.
//
// Architecture:
//   main → Runner::execute_command → runner launch
//   RunnerController → RunnerSupervisor (local process or cloud) + RunnerDriver
//   triggers (signals, ACPI, panic) → ShutdownHandle → RunnerController

pub mod command_settings;
pub mod controller;
pub mod lifecycle;
pub mod runner;
pub mod runner_config;
pub mod supervisor;
pub mod triggers;

#[cfg(test)]
mod test_support;
