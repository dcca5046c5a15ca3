//! End-to-end tests of the daemon over a real Unix socket
//!
//! Each test runs the server on a temp socket with a temp data directory.
//! The platform's tools are small shell scripts: the compiler touches its
//! output file and the "debugger" is `cat`, so a debug session echoes.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_core::KilnCore;
use kiln_core::config::{Config, Directories};
use kiln_core::discovery::PortEnumerator;
use kiln_core::process::TokioLauncher;
use kiln_daemon::{DaemonState, serve};
use kiln_rpc::protocol::{
    BACKEND_UNAVAILABLE, CompileParams, INVALID_INSTANCE, INVALID_PARAMS, InitParams,
    METHOD_NOT_FOUND, MISSING_TARGET, PlatformInstallParams, STREAM_NOT_FOUND,
};
use kiln_rpc::{ClientError, OperationOutcome, RpcClient};
use kiln_types::{
    DebugConfigRequest, DeltaKind, InstanceId, OutputStream, Port, ProgressEvent,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

const FQBN: &str = "acme:samd:zero";

/// Ports the test has plugged in
#[derive(Default)]
struct PluggedPorts(Mutex<Vec<Port>>);

impl PortEnumerator for PluggedPorts {
    fn enumerate(&self) -> kiln_core::Result<Vec<Port>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

struct TestDaemon {
    temp: TempDir,
    dirs: Directories,
    socket: PathBuf,
    ports: Arc<PluggedPorts>,
    server: JoinHandle<kiln_daemon::Result<()>>,
}

impl TestDaemon {
    async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    async fn start_with(config: Config) -> Self {
        let temp = TempDir::new().unwrap();
        let dirs = Directories::with_base(temp.path().join("kiln"));
        dirs.ensure_exists().unwrap();
        std::fs::write(dirs.package_index(), package_index().to_string()).unwrap();
        install_tools(&dirs.platform_dir("acme", "samd", "1.2.0"));

        let ports = Arc::new(PluggedPorts::default());
        let core = KilnCore::with_backends(
            dirs.clone(),
            config,
            Arc::new(TokioLauncher),
            ports.clone(),
        );
        let socket = temp.path().join("kiln.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(serve(listener, Arc::new(DaemonState::new(core))));

        Self {
            temp,
            dirs,
            socket,
            ports,
            server,
        }
    }

    async fn client(&self) -> RpcClient {
        RpcClient::connect_to(self.socket.clone()).await.unwrap()
    }

    /// A serial device that reports the Acme Zero's USB ids
    fn plug_zero(&self, name: &str) {
        let port = Port::serial(format!("/dev/{name}")).with_usb_id("2341", "804e");
        self.ports.0.lock().unwrap().push(port);
    }

    fn sketch(&self, name: &str) -> PathBuf {
        let dir = self.temp.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{name}.ino")), "void setup() {}\nvoid loop() {}\n")
            .unwrap();
        dir
    }
}

fn package_index() -> Value {
    json!({
        "packages": [{
            "name": "acme",
            "platforms": [{
                "architecture": "samd",
                "version": "1.2.0",
                "name": "Acme SAMD Boards",
                "postInstall": ["./post_install.sh"],
                "compile": [
                    "{runtime.platform.path}/tools/bin/acme-build",
                    "--fqbn", "{build.fqbn}",
                    "--out", "{build.path}/{build.project_name}.ino.elf",
                    "{sketch.path}"
                ],
                "boards": [
                    {"id": "zero", "name": "Acme Zero", "vid": ["0x2341"], "pid": ["0x804E"]}
                ],
                "programmers": [{"id": "edbg", "name": "Atmel EDBG"}],
                "debug": {
                    "toolchain": "gcc",
                    "toolchainPath": "{runtime.platform.path}/tools/bin",
                    "toolchainPrefix": "arm-none-eabi",
                    "server": "openocd",
                    "serverPath": "{runtime.platform.path}/tools/openocd",
                    "serverConfiguration": {
                        "scripts": ["interface/{programmer.id}.cfg", "target/at91samdXX.cfg"]
                    },
                    "defaultProgrammer": "edbg"
                }
            }]
        }]
    })
}

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn install_tools(platform: &Path) {
    write_script(&platform.join("post_install.sh"), "echo post-install done");
    // Arguments: --fqbn <fqbn> --out <elf> <sketch>
    write_script(
        &platform.join("tools/bin/acme-build"),
        "case \"$5\" in *slow*) sleep 5 ;; esac\necho \"building $2\"\ntouch \"$4\"",
    );
    write_script(&platform.join("tools/bin/arm-none-eabi-gdb"), "exec cat");
}

async fn collect(
    stream: kiln_rpc::OperationStream,
) -> (Vec<ProgressEvent>, OperationOutcome) {
    let mut events = Vec::new();
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        stream.outcome(|event| events.push(event.clone())),
    )
    .await
    .expect("operation did not finish")
    .unwrap();
    (events, outcome)
}

async fn initialized(client: &RpcClient) -> InstanceId {
    let instance = client.create_instance().await.unwrap();
    let (_, outcome) = collect(client.init(instance).await.unwrap()).await;
    assert!(outcome.is_success(), "init failed: {outcome:?}");
    instance
}

async fn install(client: &RpcClient, instance: InstanceId) -> (Vec<ProgressEvent>, OperationOutcome) {
    let stream = client
        .platform_install(PlatformInstallParams {
            instance,
            platform_package: "acme".to_string(),
            architecture: "samd".to_string(),
            version: None,
            skip_post_install: false,
        })
        .await
        .unwrap();
    collect(stream).await
}

fn compile_params(instance: InstanceId, sketch: &Path) -> CompileParams {
    CompileParams {
        instance,
        fqbn: FQBN.to_string(),
        sketch_path: sketch.to_path_buf(),
        build_path: None,
        verbose: false,
    }
}

async fn ready_to_debug(daemon: &TestDaemon, client: &RpcClient) -> (InstanceId, PathBuf) {
    let instance = initialized(client).await;
    let (_, outcome) = install(client, instance).await;
    assert!(outcome.is_success(), "install failed: {outcome:?}");
    let sketch = daemon.sketch("blink");
    let (_, outcome) = collect(client.compile(compile_params(instance, &sketch)).await.unwrap()).await;
    assert!(outcome.is_success(), "compile failed: {outcome:?}");
    (instance, sketch)
}

fn debug_request(instance: InstanceId, sketch: &Path) -> DebugConfigRequest {
    let mut req = DebugConfigRequest::new(instance, sketch);
    req.fqbn = Some(FQBN.to_string());
    req
}

#[tokio::test]
async fn test_status_reports_instances_and_connections() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let first = client.create_instance().await.unwrap();
    let second = client.create_instance().await.unwrap();
    assert_ne!(first, second);

    let status = client.status().await.unwrap();
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    assert!(status.instances.contains(&first));
    assert!(status.instances.contains(&second));
    assert_eq!(status.connections, 1);
}

#[tokio::test]
async fn test_destroyed_instance_is_invalid() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = client.create_instance().await.unwrap();

    client.destroy_instance(instance).await.unwrap();

    let err = client.destroy_instance(instance).await.unwrap_err();
    assert_eq!(err.code(), Some(INVALID_INSTANCE));
    let Err(err) = client.init(instance).await else {
        panic!("init on a destroyed instance opened a stream");
    };
    assert_eq!(err.code(), Some(INVALID_INSTANCE));
}

#[tokio::test]
async fn test_unknown_method_is_rejected() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let err = client.request::<Value>("frobnicate", None).await.unwrap_err();
    assert_eq!(err.code(), Some(METHOD_NOT_FOUND));
}

#[tokio::test]
async fn test_frame_for_unknown_stream_is_not_found() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;

    let err = client
        .request::<Value>("stream.cancel", Some(json!({"stream": 999})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(STREAM_NOT_FOUND));
}

#[tokio::test]
async fn test_install_and_compile() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = initialized(&client).await;

    let (events, outcome) = install(&client, instance).await;
    assert!(outcome.is_success(), "install failed: {outcome:?}");
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::Output { stream: OutputStream::Stdout, text } if text.contains("post-install done")
    )));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

    let sketch = daemon.sketch("blink");
    let (_, outcome) = collect(client.compile(compile_params(instance, &sketch)).await.unwrap()).await;
    let OperationOutcome::Completed(result) = outcome else {
        panic!("compile failed: {outcome:?}");
    };
    let executable = PathBuf::from(result["executable"].as_str().unwrap());
    assert_eq!(
        executable,
        sketch.join("build").join(FQBN).join("blink.ino.elf")
    );
    assert!(executable.exists());
}

#[tokio::test]
async fn test_failed_install_is_reported_as_failure() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = initialized(&client).await;

    let stream = client
        .platform_install(PlatformInstallParams {
            instance,
            platform_package: "nobody".to_string(),
            architecture: "avr".to_string(),
            version: None,
            skip_post_install: false,
        })
        .await
        .unwrap();
    let (_, outcome) = collect(stream).await;
    assert_eq!(
        outcome,
        OperationOutcome::Failed("Platform nobody:avr not found".to_string())
    );
}

#[tokio::test]
async fn test_destroying_instance_closes_operation_stream() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = initialized(&client).await;
    let (_, outcome) = install(&client, instance).await;
    assert!(outcome.is_success());

    let sketch = daemon.sketch("slow");
    let stream = client.compile(compile_params(instance, &sketch)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.destroy_instance(instance).await.unwrap();

    let (events, outcome) = collect(stream).await;
    assert!(matches!(outcome, OperationOutcome::TransportClosed(_)));
    assert!(events.iter().all(|e| !e.is_terminal()));
}

#[tokio::test]
async fn test_board_list_identifies_connected_board() {
    let daemon = TestDaemon::start().await;
    daemon.plug_zero("ttyACM0");
    let client = daemon.client().await;
    let instance = initialized(&client).await;
    let (_, outcome) = install(&client, instance).await;
    assert!(outcome.is_success());

    let ports = client.board_list(instance, 0).await.unwrap();
    assert_eq!(ports.len(), 1);
    assert!(ports[0].port.address.ends_with("ttyACM0"));
    assert_eq!(ports[0].matching_boards[0].fqbn, FQBN);
}

#[tokio::test]
async fn test_watch_reports_changes_until_stopped() {
    let mut config = Config::default();
    config.discovery.poll_interval_ms = 20;
    let daemon = TestDaemon::start_with(config).await;
    let client = daemon.client().await;
    let instance = initialized(&client).await;
    let (_, outcome) = install(&client, instance).await;
    assert!(outcome.is_success());

    let mut watch = client.board_list_watch(instance).await.unwrap();
    daemon.plug_zero("ttyACM1");

    let delta = tokio::time::timeout(Duration::from_secs(5), watch.next_delta())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delta.kind, DeltaKind::Added);
    assert_eq!(delta.seq, 1);
    assert_eq!(delta.port.matching_boards[0].fqbn, FQBN);

    watch.stop().await.unwrap();
    let end = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(next) = watch.next_delta().await {
            next.unwrap();
        }
    })
    .await;
    assert!(end.is_ok(), "watch did not end after stop");
}

#[tokio::test]
async fn test_init_profile_supplies_debug_target() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let (instance, sketch) = ready_to_debug(&daemon, &client).await;
    std::fs::write(
        sketch.join("sketch.json"),
        json!({"profiles": {"bench": {"fqbn": FQBN}}}).to_string(),
    )
    .unwrap();

    let params = InitParams {
        sketch_path: Some(sketch.clone()),
        profile: Some("bench".to_string()),
        ..InitParams::new(instance)
    };
    let (_, outcome) = collect(client.init_with(params).await.unwrap()).await;
    assert!(outcome.is_success(), "init failed: {outcome:?}");

    let config = client
        .get_debug_config(DebugConfigRequest::new(instance, Path::new("/elsewhere")))
        .await
        .unwrap();
    assert_eq!(
        config.executable,
        Path::new("/elsewhere/build").join(FQBN).join("elsewhere.ino.elf")
    );
}

#[tokio::test]
async fn test_init_profile_without_sketch_is_invalid() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = client.create_instance().await.unwrap();

    let params = InitParams {
        profile: Some("bench".to_string()),
        ..InitParams::new(instance)
    };
    let Err(err) = client.init_with(params).await else {
        panic!("profile without a sketch opened a stream");
    };
    assert_eq!(err.code(), Some(INVALID_PARAMS));
}

#[tokio::test]
async fn test_get_debug_config_resolves_platform_profile() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = initialized(&client).await;
    let (_, outcome) = install(&client, instance).await;
    assert!(outcome.is_success());

    let config = client
        .get_debug_config(debug_request(instance, Path::new("/s")))
        .await
        .unwrap();
    assert_eq!(config.toolchain_prefix, "arm-none-eabi");
    assert_eq!(config.programmer.as_deref(), Some("edbg"));
    assert_eq!(
        config.executable,
        PathBuf::from("/s/build/acme:samd:zero/s.ino.elf")
    );
}

#[tokio::test]
async fn test_debug_session_echoes_through_backend() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let (instance, sketch) = ready_to_debug(&daemon, &client).await;

    let mut session = client.debug(debug_request(instance, &sketch)).await.unwrap();
    assert_eq!(
        session.config().executable,
        sketch.join("build").join(FQBN).join("blink.ino.elf")
    );

    session.send(b"ping\n").await.unwrap();
    let mut received = Vec::new();
    while received.len() < 5 {
        let response = tokio::time::timeout(Duration::from_secs(5), session.next_response())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(response.error.is_none());
        received.extend(response.data);
    }
    assert_eq!(received, b"ping\n");

    session.close().await.unwrap();
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        let mut rest = Vec::new();
        while let Some(next) = session.next_response().await {
            rest.push(next.unwrap());
        }
        rest
    })
    .await
    .unwrap();
    assert!(rest.is_empty(), "unexpected output: {rest:?}");
}

#[tokio::test]
async fn test_debug_negotiation_error_answers_the_call() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let instance = initialized(&client).await;
    let sketch = daemon.sketch("nofqbn");

    let Err(err) = client.debug(DebugConfigRequest::new(instance, &sketch)).await else {
        panic!("debug without a target started a session");
    };
    assert_eq!(err.code(), Some(MISSING_TARGET));
}

#[tokio::test]
async fn test_debug_session_limit() {
    let mut config = Config::default();
    config.debug.max_sessions_per_instance = 1;
    let daemon = TestDaemon::start_with(config).await;
    let client = daemon.client().await;
    let (instance, sketch) = ready_to_debug(&daemon, &client).await;

    let session = client.debug(debug_request(instance, &sketch)).await.unwrap();
    let Err(err) = client.debug(debug_request(instance, &sketch)).await else {
        panic!("second session exceeded the limit");
    };
    assert_eq!(err.code(), Some(BACKEND_UNAVAILABLE));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_frees_debug_session() {
    let mut config = Config::default();
    config.debug.max_sessions_per_instance = 1;
    let daemon = TestDaemon::start_with(config).await;
    let owner = daemon.client().await;
    let (instance, sketch) = ready_to_debug(&daemon, &owner).await;

    let other = daemon.client().await;
    let session = other.debug(debug_request(instance, &sketch)).await.unwrap();
    drop(session);
    drop(other);

    // The slot frees once the daemon notices the dropped connection
    let mut reopened = None;
    for _ in 0..50 {
        match owner.debug(debug_request(instance, &sketch)).await {
            Ok(session) => {
                reopened = Some(session);
                break;
            }
            Err(ClientError::Rpc { code, .. }) if code == BACKEND_UNAVAILABLE => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(reopened.is_some(), "debug slot was never released");
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let daemon = TestDaemon::start().await;
    let client = daemon.client().await;
    let _instance = client.create_instance().await.unwrap();

    client.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), daemon.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(daemon.dirs.data.exists());
}
