use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use uvshim::events::EventPublisher;
use uvshim::host::HostRuntime;
use uvshim::ipc::IpcServer;
use uvshim::service::TaskService;

#[derive(Parser)]
#[command(name = "uvshim")]
#[command(version)]
#[command(about = "Task shim for OCI containers in hypervisor-isolated utility VMs")]
struct Args {
    /// Unix socket to serve the task API on
    #[arg(short, long, default_value = "/run/uvshim/task.sock")]
    listen: PathBuf,

    /// Task id this shim serves; the first Create must match it
    #[arg(short, long)]
    task_id: String,

    /// Serve a pod sandbox hosting workload tasks instead of a single task
    #[arg(long)]
    sandbox: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("uvshim=info".parse()?))
        .init();

    let args = Args::parse();

    if let Some(dir) = args.listen.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    info!(task_id = %args.task_id, sandbox = args.sandbox, "initializing uvshim");

    let (events, mut event_rx) = EventPublisher::channel();
    let runtime = Arc::new(HostRuntime::new());
    let service = Arc::new(TaskService::new(events, runtime, args.task_id, args.sandbox));

    // Surface lifecycle events in the log; forwarding them to the manager is
    // the transport's concern.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(topic = event.topic(), event = ?event, "publishing task event");
        }
    });

    let server = IpcServer::bind(&args.listen, service)?;
    server.serve().await?;

    Ok(())
}
