//! End-to-end lifecycle against real host processes.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::{next_event, process_spec, write_bundle};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uvshim::events::{EventPublisher, TaskEvent};
use uvshim::host::HostRuntime;
use uvshim::proto;
use uvshim::service::TaskService;

struct LocalShim {
    service: Arc<TaskService>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    bundle: TempDir,
}

fn new_local_shim(tid: &str, init_args: &[&str]) -> LocalShim {
    let (events, rx) = EventPublisher::channel();
    let runtime = Arc::new(HostRuntime::new());
    let service = Arc::new(TaskService::new(events, runtime, tid.to_string(), false));
    let bundle = tempfile::tempdir().expect("tempdir");
    write_bundle(bundle.path(), init_args);
    LocalShim {
        service,
        events: rx,
        bundle,
    }
}

fn create_req(id: &str, bundle: &Path) -> proto::CreateTaskRequest {
    proto::CreateTaskRequest {
        id: id.to_string(),
        bundle: bundle.display().to_string(),
        ..proto::CreateTaskRequest::default()
    }
}

async fn create_and_start(shim: &LocalShim, stdio: Option<(&str, &str, &str)>) -> u32 {
    let mut req = create_req("t1", shim.bundle.path());
    if let Some((stdin, stdout, stderr)) = stdio {
        req.stdin = stdin.to_string();
        req.stdout = stdout.to_string();
        req.stderr = stderr.to_string();
    }
    shim.service.create(req).await.expect("create");
    let started = shim
        .service
        .start(proto::StartRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
        })
        .await
        .expect("start");
    started.pid
}

#[tokio::test]
async fn init_process_exit_code_is_observed() {
    let mut shim = new_local_shim("t1", &["/bin/sh", "-c", "exit 7"]);
    let pid = create_and_start(&shim, None).await;
    assert!(pid > 0);
    assert_eq!(
        next_event(&mut shim.events).await,
        TaskEvent::Started {
            tid: "t1".to_string(),
            pid,
        }
    );

    let waited = shim
        .service
        .wait(proto::WaitRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
        })
        .await
        .expect("wait");
    assert_eq!(waited.exit_status, 7);

    let deleted = shim
        .service
        .delete(proto::DeleteRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
        })
        .await
        .expect("delete");
    assert_eq!(deleted.exit_status, 7);
    assert_eq!(deleted.pid, pid);
}

#[tokio::test]
async fn kill_terminates_a_running_process() {
    let shim = new_local_shim("t1", &["/bin/sh", "-c", "sleep 30"]);
    create_and_start(&shim, None).await;

    shim.service
        .kill(proto::KillRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
            signal: 9,
            all: false,
        })
        .await
        .expect("kill");

    let waited = shim
        .service
        .wait(proto::WaitRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
        })
        .await
        .expect("wait");
    // 128 + SIGKILL.
    assert_eq!(waited.exit_status, 137);
}

#[tokio::test]
async fn stdio_relays_through_the_endpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stdin_path = dir.path().join("stdin");
    let stdout_path = dir.path().join("stdout");
    std::fs::write(&stdin_path, b"ping").expect("seed stdin");
    std::fs::write(&stdout_path, b"").expect("create stdout");

    let shim = new_local_shim("t1", &["/bin/sh", "-c", "cat"]);
    create_and_start(
        &shim,
        Some((
            stdin_path.to_str().expect("utf-8 path"),
            stdout_path.to_str().expect("utf-8 path"),
            "",
        )),
    )
    .await;

    let waited = shim
        .service
        .wait(proto::WaitRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
        })
        .await
        .expect("wait");
    assert_eq!(waited.exit_status, 0);

    // The relay drained before the exit was observable.
    let out = std::fs::read(&stdout_path).expect("read stdout");
    assert_eq!(out, b"ping");
}

#[tokio::test]
async fn additional_exec_runs_a_real_process() {
    let mut shim = new_local_shim("t1", &["/bin/sh", "-c", "sleep 30"]);
    create_and_start(&shim, None).await;
    let _ = next_event(&mut shim.events).await;

    let spec = serde_json::to_vec(&process_spec(&["/bin/sh", "-c", "exit 3"]))
        .expect("spec json");
    shim.service
        .exec_process(proto::ExecProcessRequest {
            id: "t1".to_string(),
            exec_id: "e1".to_string(),
            spec,
            ..proto::ExecProcessRequest::default()
        })
        .await
        .expect("exec");
    shim.service
        .start(proto::StartRequest {
            id: "t1".to_string(),
            exec_id: "e1".to_string(),
        })
        .await
        .expect("start e1");

    match next_event(&mut shim.events).await {
        TaskEvent::ExecStarted { tid, eid, .. } => {
            assert_eq!(tid, "t1");
            assert_eq!(eid, "e1");
        }
        other => panic!("expected exec-started, got {other:?}"),
    }

    let waited = shim
        .service
        .wait(proto::WaitRequest {
            id: "t1".to_string(),
            exec_id: "e1".to_string(),
        })
        .await
        .expect("wait e1");
    assert_eq!(waited.exit_status, 3);

    match next_event(&mut shim.events).await {
        TaskEvent::Exited { eid, exit_status, .. } => {
            assert_eq!(eid, "e1");
            assert_eq!(exit_status, 3);
        }
        other => panic!("expected the exec exit, got {other:?}"),
    }

    // Stop the init process so the task can wind down.
    shim.service
        .kill(proto::KillRequest {
            id: "t1".to_string(),
            exec_id: String::new(),
            signal: 9,
            all: false,
        })
        .await
        .expect("kill init");
}

#[tokio::test]
async fn diag_exec_in_host_returns_the_exit_code() {
    let shim = new_local_shim("t1", &["/bin/sh", "-c", "exit 0"]);
    let resp = shim
        .service
        .diag_exec_in_host(proto::DiagExecInHostRequest {
            args: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 5".to_string()],
            ..proto::DiagExecInHostRequest::default()
        })
        .await
        .expect("diag exec");
    assert_eq!(resp.exit_code, 5);

    let err = shim
        .service
        .diag_exec_in_host(proto::DiagExecInHostRequest::default())
        .await
        .expect_err("empty command");
    assert_eq!(err.code(), uvshim::proto::Code::InvalidArgument);
}

#[tokio::test]
async fn ipc_round_trip() {
    use prost::Message;
    use tokio::net::UnixStream;
    use uvshim::ipc::{IpcServer, read_frame, write_frame};
    use uvshim::proto::{Code, TaskOp};

    let shim = new_local_shim("t1", &["/bin/sh", "-c", "exit 0"]);
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("task.sock");
    let server = IpcServer::bind(&socket, shim.service.clone()).expect("bind");
    let serve = tokio::spawn(server.serve());

    let mut stream = UnixStream::connect(&socket).await.expect("connect");

    // A request against an unknown task maps to NotFound on the wire.
    let envelope = proto::Envelope {
        op: TaskOp::Connect as i32,
        payload: proto::ConnectRequest {
            id: "t1".to_string(),
        }
        .encode_to_vec(),
    };
    write_frame(&mut stream, &envelope.encode_to_vec())
        .await
        .expect("send");
    let frame = read_frame(&mut stream)
        .await
        .expect("recv")
        .expect("reply frame");
    let reply = proto::Reply::decode(frame.as_slice()).expect("reply");
    assert_eq!(reply.code, Code::NotFound as i32);

    // Shutdown stops the accept loop.
    let envelope = proto::Envelope {
        op: TaskOp::Shutdown as i32,
        payload: proto::ShutdownRequest {
            id: "t1".to_string(),
            now: true,
        }
        .encode_to_vec(),
    };
    write_frame(&mut stream, &envelope.encode_to_vec())
        .await
        .expect("send");
    let frame = read_frame(&mut stream)
        .await
        .expect("recv")
        .expect("reply frame");
    let reply = proto::Reply::decode(frame.as_slice()).expect("reply");
    assert_eq!(reply.code, Code::Ok as i32);

    serve
        .await
        .expect("server task")
        .expect("serve returns cleanly");
}
