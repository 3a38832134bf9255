//! Diagnostics: one-shot commands in the utility-VM host.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, ShimError};
use crate::guest::{Container, GuestProcess, ProcessRequest, ProcessSpec, User};
use crate::proto;
use crate::relay::IoRelay;
use crate::signals::GuestFlavor;

/// Bound on a diagnostic command's whole run.
pub const EXEC_IN_HOST_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a one-shot command in the utility-VM host, relaying its stdio through
/// the named endpoints, and return its exit code.
pub async fn exec_in_host(
    host: Arc<dyn Container>,
    req: proto::DiagExecInHostRequest,
) -> Result<proto::DiagExecInHostResponse> {
    if req.args.is_empty() {
        return Err(ShimError::InvalidArgument("missing command".to_string()));
    }
    let io = IoRelay::open(&req.stdin, &req.stdout, &req.stderr, req.terminal)
        .await
        .map_err(ShimError::Other)?;

    let mut spec = ProcessSpec {
        args: req.args.clone(),
        cwd: req.workdir.clone(),
        terminal: req.terminal,
        ..ProcessSpec::default()
    };
    if host.guest_flavor() == GuestFlavor::Windows {
        spec.user = Some(User {
            username: r"NT AUTHORITY\SYSTEM".to_string(),
            ..User::default()
        });
    }

    let request = ProcessRequest {
        spec: Some(spec),
        terminal: req.terminal,
        stdin: !req.stdin.is_empty(),
        stdout: !req.stdout.is_empty(),
        stderr: !req.stderr.is_empty(),
    };
    let mut process = match host.create_process(request).await {
        Ok(process) => process,
        Err(e) => {
            io.close().await;
            return Err(ShimError::Other(e.context("launching host command")));
        }
    };
    io.attach(process.take_stdio()).await;
    let process: Arc<dyn GuestProcess> = Arc::from(process);

    let finished = tokio::time::timeout(EXEC_IN_HOST_TIMEOUT, process.wait()).await;
    if finished.is_err() {
        let _ = process.kill().await;
        io.close().await;
        return Err(ShimError::DeadlineExceeded {
            op: "host command",
            timeout: EXEC_IN_HOST_TIMEOUT,
        });
    }

    let code = process.exit_code().await;
    io.close().await;
    let exit_code = code.map_err(ShimError::Other)?;
    debug!(exit_code, "host command finished");
    Ok(proto::DiagExecInHostResponse { exit_code })
}
