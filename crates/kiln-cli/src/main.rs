//! Kiln CLI
//!
//! Drives the kiln daemon over its socket. Commands that need board state
//! open their own instance, initialize it, and destroy it on the way out.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use kiln_rpc::protocol::{CompileParams, InitParams, PlatformInstallParams};
use kiln_rpc::{DebugStream, OperationOutcome, OperationStream, RpcClient, socket_path};
use kiln_types::{
    BoardDelta, DebugConfigRequest, DeltaKind, DetectedPort, InstanceId, OutputStream, Port,
    ProgressEvent,
};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

const STDIN_CHUNK: usize = 4096;

/// Find a binary, preferring one next to this executable (dev builds)
fn find_binary(name: &str) -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join(name);
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from(name)
}

/// Kiln CLI
#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln - board discovery, builds and debugging through the kiln daemon")]
#[command(version)]
#[command(after_help = "\
Examples:
  kiln daemon                              Run the daemon in foreground
  kiln status                              Check daemon status
  kiln board list                          List connected boards
  kiln board watch                         Follow boards being plugged in and out
  kiln core install acme:samd              Install the latest acme:samd platform
  kiln core install acme:samd@1.2.0        Install a specific version
  kiln compile -b acme:samd:zero ./blink   Build a sketch
  kiln debug -b acme:samd:zero ./blink     Debug a built sketch (Ctrl-C interrupts)
  kiln debug -I -b acme:samd:zero ./blink  Show the resolved debug configuration
")]
struct Cli {
    /// Daemon socket (defaults to $XDG_RUNTIME_DIR/kiln.sock)
    #[arg(long, global = true)]
    socket_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in foreground
    Daemon {
        /// Config file to load and watch
        #[arg(long)]
        config: Option<PathBuf>,
        /// Data directory holding the package index and platforms
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Show daemon status
    Status,

    /// Shutdown the daemon
    Shutdown,

    /// Board discovery
    Board {
        #[command(subcommand)]
        command: BoardCommand,
    },

    /// Platform management
    Core {
        #[command(subcommand)]
        command: CoreCommand,
    },

    /// Compile a sketch
    Compile {
        /// Fully qualified board name (packager:arch:board)
        #[arg(short = 'b', long)]
        fqbn: String,
        /// Sketch directory
        sketch: PathBuf,
        /// Build directory (defaults to <sketch>/build/<fqbn>)
        #[arg(long)]
        build_path: Option<PathBuf>,
        /// Show log output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Debug a compiled sketch
    Debug(DebugArgs),
}

#[derive(Subcommand)]
enum BoardCommand {
    /// List connected boards
    List {
        /// How long to wait for discovery (0 uses the daemon's default)
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },

    /// Print board changes until interrupted
    Watch,
}

#[derive(Subcommand)]
enum CoreCommand {
    /// Install a platform
    Install {
        /// PACKAGER:ARCH[@VERSION]
        platform: String,
        /// Do not run the platform's post-install script
        #[arg(long)]
        skip_post_install: bool,
    },
}

#[derive(Args)]
struct DebugArgs {
    /// Sketch directory
    sketch: PathBuf,
    /// Fully qualified board name (defaults to the sketch's)
    #[arg(short = 'b', long)]
    fqbn: Option<String>,
    /// Upload port address
    #[arg(short, long)]
    port: Option<String>,
    /// Debugger interpreter (console, mi, mi1, mi2, mi3)
    #[arg(long)]
    interpreter: Option<String>,
    /// Programmer id
    #[arg(short = 'P', long)]
    programmer: Option<String>,
    /// Directory holding the compiled binaries
    #[arg(long)]
    import_dir: Option<PathBuf>,
    /// Sketch profile supplying the board, port and programmer
    #[arg(long)]
    profile: Option<String>,
    /// Print the resolved debug configuration and exit
    #[arg(short = 'I', long)]
    info: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket_path.clone().unwrap_or_else(socket_path);

    match cli.command {
        Commands::Daemon { config, data_dir } => run_daemon(
            cli.socket_path.as_deref(),
            config.as_deref(),
            data_dir.as_deref(),
        ),
        Commands::Status => run_status(&socket).await,
        Commands::Shutdown => run_shutdown(&socket).await,
        Commands::Board { command } => match command {
            BoardCommand::List { timeout_ms } => run_board_list(&socket, timeout_ms).await,
            BoardCommand::Watch => run_board_watch(&socket).await,
        },
        Commands::Core {
            command:
                CoreCommand::Install {
                    platform,
                    skip_post_install,
                },
        } => run_core_install(&socket, &platform, skip_post_install).await,
        Commands::Compile {
            fqbn,
            sketch,
            build_path,
            verbose,
        } => run_compile(&socket, fqbn, sketch, build_path, verbose).await,
        Commands::Debug(args) => run_debug(&socket, args).await,
    }
}

fn run_daemon(socket: Option<&Path>, config: Option<&Path>, data_dir: Option<&Path>) -> Result<()> {
    let binary = find_binary("kiln-daemon");
    let mut command = Command::new(&binary);
    if let Some(socket) = socket {
        command.arg("--socket-path").arg(socket);
    }
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }
    if let Some(data_dir) = data_dir {
        command.arg("--data-dir").arg(data_dir);
    }

    let status = command
        .status()
        .with_context(|| format!("Failed to start {}. Is it installed?", binary.display()))?;
    if !status.success() {
        bail!("kiln-daemon exited with status: {status}");
    }
    Ok(())
}

async fn connect(socket: &Path) -> Result<RpcClient> {
    if !socket.exists() {
        bail!(
            "Daemon not running (socket not found at {}).\nStart with: kiln daemon",
            socket.display()
        );
    }

    RpcClient::connect_to(socket.to_path_buf())
        .await
        .context("Failed to connect to daemon. Is it running?")
}

/// A connection with one initialized instance
struct Session {
    client: RpcClient,
    instance: InstanceId,
}

impl Session {
    async fn open(socket: &Path) -> Result<Self> {
        Self::open_for(socket, None, None).await
    }

    /// Open a session whose instance takes its target defaults from `sketch`.
    async fn open_for(
        socket: &Path,
        sketch: Option<PathBuf>,
        profile: Option<String>,
    ) -> Result<Self> {
        let client = connect(socket).await?;
        let instance = client
            .create_instance()
            .await
            .context("Failed to create instance")?;
        let session = Self { client, instance };

        let params = InitParams {
            sketch_path: sketch,
            profile,
            ..InitParams::new(instance)
        };
        let init = match session.client.init_with(params).await {
            Ok(stream) => finish(stream, false).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = init {
            session.close().await;
            return Err(e.context("Failed to initialize instance"));
        }
        Ok(session)
    }

    async fn close(self) {
        if let Err(e) = self.client.destroy_instance(self.instance).await {
            eprintln!("Warning: failed to release instance {}: {e}", self.instance);
        }
    }
}

/// Print an operation's progress and return its result payload
async fn finish(stream: OperationStream, verbose: bool) -> Result<Value> {
    let outcome = stream
        .outcome(|event| print_event(event, verbose))
        .await
        .context("Operation stream failed")?;

    match outcome {
        OperationOutcome::Completed(result) => Ok(result),
        OperationOutcome::Failed(message) => bail!("{message}"),
        OperationOutcome::TransportClosed(message) => {
            bail!("Operation ended without a result: {message}")
        }
    }
}

fn print_event(event: &ProgressEvent, verbose: bool) {
    match event {
        ProgressEvent::Output {
            stream: OutputStream::Stdout,
            text,
        } => println!("{}", text.trim_end_matches('\n')),
        ProgressEvent::Output {
            stream: OutputStream::Stderr,
            text,
        } => eprintln!("{}", text.trim_end_matches('\n')),
        ProgressEvent::Output {
            stream: OutputStream::Log,
            text,
        } if verbose => eprintln!("{}", text.trim_end_matches('\n')),
        ProgressEvent::Task {
            name,
            message,
            completed,
        } if verbose => {
            let state = if *completed { "done" } else { "..." };
            match message {
                Some(message) => eprintln!("{name} {state} {message}"),
                None => eprintln!("{name} {state}"),
            }
        }
        _ => {}
    }
}

async fn run_status(socket: &Path) -> Result<()> {
    if !socket.exists() {
        println!("Status: Not running");
        println!("Socket: {} (not found)", socket.display());
        return Ok(());
    }

    match RpcClient::connect_to(socket.to_path_buf()).await {
        Ok(client) => {
            let status = client.status().await.context("Status request failed")?;
            println!("Status: Running");
            println!("Socket: {}", socket.display());
            println!("Version: {}", status.version);
            println!("Instances: {}", status.instances.len());
            println!("Connections: {}", status.connections);
        }
        Err(e) => {
            println!("Status: Error");
            println!(
                "Socket: {} (exists but connection failed)",
                socket.display()
            );
            println!("Error: {e}");
        }
    }

    Ok(())
}

async fn run_shutdown(socket: &Path) -> Result<()> {
    let client = connect(socket).await?;
    client.shutdown().await.context("Shutdown command failed")?;
    println!("Daemon shutting down");
    Ok(())
}

async fn run_board_list(socket: &Path, timeout_ms: u64) -> Result<()> {
    let session = Session::open(socket).await?;
    let result = session
        .client
        .board_list(session.instance, timeout_ms)
        .await
        .context("Board discovery failed");
    session.close().await;

    let ports = result?;
    if ports.is_empty() {
        println!("No boards found.");
        return Ok(());
    }
    println!("{:<24} {:<10} {:<24} FQBN", "Port", "Protocol", "Board");
    for detected in &ports {
        for line in port_lines(detected) {
            println!("{line}");
        }
    }
    Ok(())
}

/// One table row per matching board, or one "Unknown" row
fn port_lines(detected: &DetectedPort) -> Vec<String> {
    let port = &detected.port;
    if detected.matching_boards.is_empty() {
        return vec![format!(
            "{:<24} {:<10} {:<24}",
            port.address, port.protocol, "Unknown"
        )
        .trim_end()
        .to_string()];
    }
    detected
        .matching_boards
        .iter()
        .map(|board| {
            format!(
                "{:<24} {:<10} {:<24} {}",
                port.address, port.protocol, board.name, board.fqbn
            )
        })
        .collect()
}

fn format_delta(delta: &BoardDelta) -> String {
    let sign = match delta.kind {
        DeltaKind::Added => '+',
        DeltaKind::Removed => '-',
        DeltaKind::Updated => '~',
    };
    let boards: Vec<_> = delta
        .port
        .matching_boards
        .iter()
        .map(|b| b.fqbn.as_str())
        .collect();
    if boards.is_empty() {
        format!("{sign} {}", delta.port.port.address)
    } else {
        format!("{sign} {} ({})", delta.port.port.address, boards.join(", "))
    }
}

async fn run_board_watch(socket: &Path) -> Result<()> {
    let session = Session::open(socket).await?;
    let result = watch_boards(&session).await;
    session.close().await;
    result
}

async fn watch_boards(session: &Session) -> Result<()> {
    let mut watch = session
        .client
        .board_list_watch(session.instance)
        .await
        .context("Failed to start board watch")?;

    let mut stopping = false;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c(), if !stopping => {
                result.context("Failed to listen for Ctrl-C")?;
                watch.stop().await.context("Failed to stop board watch")?;
                stopping = true;
            }
            next = watch.next_delta() => match next {
                Some(Ok(delta)) => println!("{}", format_delta(&delta)),
                Some(Err(e)) => return Err(e).context("Board watch failed"),
                None => break,
            }
        }
    }
    Ok(())
}

/// `PACKAGER:ARCH[@VERSION]`
#[derive(Debug, PartialEq)]
struct PlatformRef {
    packager: String,
    architecture: String,
    version: Option<String>,
}

fn parse_platform(spec: &str) -> Result<PlatformRef> {
    let (id, version) = match spec.split_once('@') {
        Some((id, version)) => (id, Some(version)),
        None => (spec, None),
    };
    let Some((packager, architecture)) = id.split_once(':') else {
        bail!("Invalid platform '{spec}', expected PACKAGER:ARCH[@VERSION]");
    };
    if packager.is_empty() || architecture.is_empty() || architecture.contains(':') {
        bail!("Invalid platform '{spec}', expected PACKAGER:ARCH[@VERSION]");
    }
    Ok(PlatformRef {
        packager: packager.to_string(),
        architecture: architecture.to_string(),
        version: version.filter(|v| !v.is_empty()).map(str::to_string),
    })
}

async fn run_core_install(socket: &Path, platform: &str, skip_post_install: bool) -> Result<()> {
    let platform = parse_platform(platform)?;
    let session = Session::open(socket).await?;
    let params = PlatformInstallParams {
        instance: session.instance,
        platform_package: platform.packager.clone(),
        architecture: platform.architecture.clone(),
        version: platform.version.clone(),
        skip_post_install,
    };
    let result = match session.client.platform_install(params).await {
        Ok(stream) => finish(stream, true).await,
        Err(e) => Err(e.into()),
    };
    session.close().await;

    let result = result.with_context(|| {
        format!(
            "Failed to install {}:{}",
            platform.packager, platform.architecture
        )
    })?;
    let label = result
        .get("platform")
        .and_then(Value::as_str)
        .map_or_else(
            || format!("{}:{}", platform.packager, platform.architecture),
            str::to_string,
        );
    if result
        .get("already_installed")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        println!("Platform {label} already installed");
    } else {
        println!("Installed {label}");
    }
    Ok(())
}

async fn run_compile(
    socket: &Path,
    fqbn: String,
    sketch: PathBuf,
    build_path: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let sketch = std::path::absolute(&sketch)
        .with_context(|| format!("Invalid sketch path {}", sketch.display()))?;
    let build_path = build_path.map(std::path::absolute).transpose()?;

    let session = Session::open(socket).await?;
    let params = CompileParams {
        instance: session.instance,
        fqbn,
        sketch_path: sketch,
        build_path,
        verbose,
    };
    let result = match session.client.compile(params).await {
        Ok(stream) => finish(stream, verbose).await,
        Err(e) => Err(e.into()),
    };
    session.close().await;

    let result = result.context("Compilation failed")?;
    if let Some(executable) = result.get("executable").and_then(Value::as_str) {
        println!("Executable: {executable}");
    }
    Ok(())
}

async fn run_debug(socket: &Path, args: DebugArgs) -> Result<()> {
    let sketch = std::path::absolute(&args.sketch)
        .with_context(|| format!("Invalid sketch path {}", args.sketch.display()))?;
    let session = Session::open_for(socket, Some(sketch.clone()), args.profile).await?;

    let mut request = DebugConfigRequest::new(session.instance, sketch);
    request.fqbn = args.fqbn;
    request.port = args.port.map(Port::serial);
    request.interpreter = args.interpreter;
    request.programmer = args.programmer;
    request.import_dir = args.import_dir;

    let result = if args.info {
        print_debug_config(&session.client, request).await
    } else {
        match session.client.debug(request).await {
            Ok(mut stream) => {
                eprintln!("Debugging {}", stream.config().executable.display());
                relay(&mut stream).await
            }
            Err(e) => Err(e).context("Failed to start debug session"),
        }
    };
    session.close().await;
    result
}

async fn print_debug_config(client: &RpcClient, request: DebugConfigRequest) -> Result<()> {
    let config = client
        .get_debug_config(request)
        .await
        .context("Failed to resolve debug configuration")?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Pump the terminal through the debugger until it exits.
///
/// Ctrl-C interrupts the target instead of ending the session; closing
/// stdin ends it.
async fn relay(stream: &mut DebugStream) -> Result<()> {
    let (input_tx, mut input) = mpsc::channel::<Vec<u8>>(16);
    // A plain thread, so a pending read never holds up runtime shutdown
    std::thread::spawn(move || read_stdin(&input_tx));

    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            chunk = input.recv(), if stdin_open => match chunk {
                Some(data) => stream.send(&data).await.context("Failed to send to debugger")?,
                None => {
                    stdin_open = false;
                    stream.close().await.context("Failed to close debug session")?;
                }
            },
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                stream.interrupt().await.context("Failed to interrupt debugger")?;
            }
            next = stream.next_response() => match next {
                Some(Ok(response)) => {
                    if let Some(error) = response.error {
                        eprint!("{error}");
                    }
                    stdout.write_all(&response.data).await?;
                    stdout.flush().await?;
                }
                Some(Err(e)) => return Err(e).context("Debug session failed"),
                None => break,
            }
        }
    }
    Ok(())
}

fn read_stdin(tx: &mpsc::Sender<Vec<u8>>) {
    let mut stdin = std::io::stdin().lock();
    let mut buf = vec![0u8; STDIN_CHUNK];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use kiln_types::BoardListItem;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_platform_with_version() {
        assert_eq!(
            parse_platform("acme:samd@1.2.0").unwrap(),
            PlatformRef {
                packager: "acme".to_string(),
                architecture: "samd".to_string(),
                version: Some("1.2.0".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_platform_without_version() {
        let platform = parse_platform("acme:samd").unwrap();
        assert_eq!(platform.packager, "acme");
        assert_eq!(platform.version, None);
        assert_eq!(parse_platform("acme:samd@").unwrap().version, None);
    }

    #[test]
    fn test_parse_platform_rejects_malformed() {
        for spec in ["acme", ":samd", "acme:", "acme:samd:zero", "@1.0"] {
            assert!(parse_platform(spec).is_err(), "{spec} was accepted");
        }
    }

    #[test]
    fn test_debug_flags_parse() {
        let cli = Cli::try_parse_from([
            "kiln", "debug", "-b", "acme:samd:zero", "-P", "jlink", "--interpreter", "mi", "-I",
            "--profile", "bench", "./blink",
        ])
        .unwrap();
        let Commands::Debug(args) = cli.command else {
            panic!("expected debug command");
        };
        assert_eq!(args.fqbn.as_deref(), Some("acme:samd:zero"));
        assert_eq!(args.programmer.as_deref(), Some("jlink"));
        assert_eq!(args.interpreter.as_deref(), Some("mi"));
        assert_eq!(args.profile.as_deref(), Some("bench"));
        assert!(args.info);
        assert_eq!(args.sketch, PathBuf::from("./blink"));
    }

    #[test]
    fn test_unknown_port_gets_one_row() {
        let detected = DetectedPort {
            port: Port::serial("/dev/ttyUSB0"),
            matching_boards: Vec::new(),
        };
        let lines = port_lines(&detected);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("/dev/ttyUSB0"));
        assert!(lines[0].ends_with("Unknown"));
    }

    #[test]
    fn test_delta_lists_matching_boards() {
        let delta = BoardDelta {
            seq: 3,
            kind: DeltaKind::Added,
            port: DetectedPort {
                port: Port::serial("/dev/ttyACM0"),
                matching_boards: vec![BoardListItem {
                    name: "Acme Zero".to_string(),
                    fqbn: "acme:samd:zero".to_string(),
                }],
            },
        };
        assert_eq!(format_delta(&delta), "+ /dev/ttyACM0 (acme:samd:zero)");

        let removed = BoardDelta {
            kind: DeltaKind::Removed,
            ..delta
        };
        assert_eq!(format_delta(&removed), "- /dev/ttyACM0 (acme:samd:zero)");
    }
}
