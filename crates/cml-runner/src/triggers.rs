// Shutdown trigger sources. Each runs as its own task (or hook) and only
// ever sends a request through the controller's `ShutdownHandle`.

use crate::lifecycle::{ShutdownHandle, ShutdownReason};
use cml_common::Tracing;
use cml_sdk::TraceWriter;
use tokio_util::sync::CancellationToken;

/// Install every trigger source. Tasks stop once `token` is cancelled.
pub fn install(shutdown: &ShutdownHandle, trace: &Tracing, token: &CancellationToken) {
    spawn_signal_listener(shutdown.clone(), trace.clone(), token.clone());
    #[cfg(target_os = "linux")]
    spawn_acpi_listener(
        shutdown.clone(),
        trace.clone(),
        token.clone(),
        cml_common::constants::ACPID_SOCKET,
    );
    install_panic_hook(shutdown.clone());
}

// ---------------------------------------------------------------------------
// OS signals
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn spawn_signal_listener(shutdown: ShutdownHandle, trace: Tracing, token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let streams = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::quit()),
        );
        let (mut sigint, mut sigterm, mut sigquit) = match streams {
            (Ok(int), Ok(term), Ok(quit)) => (int, term, quit),
            _ => {
                trace.warning("Failed to install signal handlers");
                return;
            }
        };

        loop {
            let name = tokio::select! {
                _ = token.cancelled() => return,
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
                _ = sigquit.recv() => "SIGQUIT",
            };
            trace.info(&format!("{name} received"));
            shutdown.request(ShutdownReason::Signal(name.to_string()));
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(shutdown: ShutdownHandle, trace: Tracing, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        trace.warning(&format!("Failed to listen for Ctrl-C: {e}"));
                        return;
                    }
                }
            }
            trace.info("Ctrl-C received");
            shutdown.request(ShutdownReason::Signal("SIGINT".to_string()));
        }
    });
}

// ---------------------------------------------------------------------------
// ACPI power button
// ---------------------------------------------------------------------------

/// True for acpid events such as `button/power PBTN 00000080 00000000`.
pub fn is_power_button_event(line: &str) -> bool {
    line.contains("power") && line.contains("button")
}

#[cfg(target_os = "linux")]
fn spawn_acpi_listener(
    shutdown: ShutdownHandle,
    trace: Tracing,
    token: CancellationToken,
    socket: &'static str,
) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    tokio::spawn(async move {
        let stream = match tokio::net::UnixStream::connect(socket).await {
            Ok(stream) => stream,
            Err(e) => {
                trace.warning(&format!("Failed to connect to {socket}: {e}"));
                return;
            }
        };

        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => return,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    trace.verbose(&format!("ACPI event: {line}"));
                    if is_power_button_event(&line) {
                        shutdown.request(ShutdownReason::Acpi);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    trace.warning(&format!("ACPI socket read failed: {e}"));
                    return;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Panic hook
// ---------------------------------------------------------------------------

/// Chain onto the current hook, then ask the controller to shut down.
fn install_panic_hook(shutdown: ShutdownHandle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        shutdown.request_with_error(
            ShutdownReason::Panic,
            anyhow::anyhow!("Unexpected panic: {info}"),
        );
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use cml_common::HostContext;

    #[test]
    fn power_button_lines() {
        assert!(is_power_button_event("button/power PBTN 00000080 00000000"));
        assert!(is_power_button_event("button/power LNXPWRBN:00 00000080"));
        assert!(!is_power_button_event("button/lid LID close"));
        assert!(!is_power_button_event("ac_adapter ACPI0003:00 00000080 00000000"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn acpi_socket_requests_shutdown() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acpid.socket");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let socket: &'static str = Box::leak(path.to_string_lossy().into_owned().into_boxed_str());

        let (handle, mut rx) = ShutdownHandle::channel();
        let token = CancellationToken::new();
        let trace = HostContext::for_tests().get_trace("Triggers");
        spawn_acpi_listener(handle, trace, token.clone(), socket);

        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(b"button/lid LID close\n").await.unwrap();
        stream
            .write_all(b"button/power PBTN 00000080 00000000\n")
            .await
            .unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.reason, ShutdownReason::Acpi);
        token.cancel();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn missing_acpi_socket_is_not_fatal() {
        let (handle, mut rx) = ShutdownHandle::channel();
        let token = CancellationToken::new();
        let trace = HostContext::for_tests().get_trace("Triggers");
        spawn_acpi_listener(handle, trace, token, "/nonexistent/acpid.socket");
        // The task gives up and drops its handle, closing the channel.
        assert!(rx.recv().await.is_none());
    }
}
