//! Backend-specific configuration producers and the gdb launch command.

use crate::config::INTERPRETERS;
use crate::process::CommandSpec;
use crate::{Error, Result};
use kiln_types::{
    DebugSessionConfig, GccToolchainConfig, OpenOcdServerConfig, ServerConfig, ToolchainConfig,
};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Build the typed toolchain payload for a toolchain identifier.
///
/// # Errors
///
/// Returns `Error::UnsupportedTarget` if a known toolchain's settings are
/// malformed.
pub fn toolchain_config(kind: &str, payload: Map<String, Value>) -> Result<ToolchainConfig> {
    match kind {
        "gcc" => serde_json::from_value::<GccToolchainConfig>(Value::Object(payload))
            .map(ToolchainConfig::Gcc)
            .map_err(|e| Error::UnsupportedTarget(format!("Invalid gcc configuration: {e}"))),
        _ => Ok(ToolchainConfig::Unknown {
            kind: kind.to_string(),
            payload,
        }),
    }
}

/// Build the typed server payload for a server identifier.
///
/// `server_path` fills in the `OpenOCD` binary and scripts locations the
/// profile leaves out.
///
/// # Errors
///
/// Returns `Error::UnsupportedTarget` if a known server's settings are
/// malformed.
pub fn server_config(
    kind: &str,
    payload: Map<String, Value>,
    server_path: &Path,
) -> Result<ServerConfig> {
    match kind {
        "openocd" => openocd_config(&payload, server_path).map(ServerConfig::OpenOcd),
        _ => Ok(ServerConfig::Unknown {
            kind: kind.to_string(),
            payload,
        }),
    }
}

fn openocd_config(payload: &Map<String, Value>, server_path: &Path) -> Result<OpenOcdServerConfig> {
    let invalid = |field: &str| {
        Error::UnsupportedTarget(format!("Invalid openocd configuration: {field} must be a string"))
    };
    let path_field = |field: &str| -> Result<Option<PathBuf>> {
        match payload.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(PathBuf::from(s))),
            Some(_) => Err(invalid(field)),
        }
    };

    let scripts = match payload.get("scripts") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(|| invalid("scripts[]")))
            .collect::<Result<_>>()?,
        Some(Value::String(script)) => vec![script.clone()],
        Some(_) => return Err(invalid("scripts")),
    };

    Ok(OpenOcdServerConfig {
        path: path_field("path")?.or_else(|| Some(server_path.join("bin").join("openocd"))),
        scripts_dir: path_field("scriptsDir")?
            .or_else(|| Some(server_path.join("share").join("openocd").join("scripts"))),
        scripts,
    })
}

/// Command line that starts gdb with `OpenOCD` piped in as its remote.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` for an unknown interpreter and
/// `Error::BackendUnavailable` when the toolchain/server pair cannot be
/// launched or the debugger binary is missing.
pub fn build_command(config: &DebugSessionConfig, interpreter: &str) -> Result<CommandSpec> {
    if !INTERPRETERS.contains(&interpreter) {
        return Err(Error::InvalidArgument(format!(
            "Unsupported interpreter '{interpreter}', expected one of {}",
            INTERPRETERS.join(", ")
        )));
    }
    if config.toolchain != "gcc" {
        return Err(Error::BackendUnavailable(format!(
            "Toolchain '{}' cannot be launched",
            config.toolchain
        )));
    }
    let Some(ServerConfig::OpenOcd(openocd)) = &config.server_configuration else {
        return Err(Error::BackendUnavailable(format!(
            "Debug server '{}' cannot be launched",
            config.server
        )));
    };

    let gdb = if config.toolchain_prefix.is_empty() {
        config.toolchain_path.join("gdb")
    } else {
        config
            .toolchain_path
            .join(format!("{}-gdb", config.toolchain_prefix))
    };
    if !gdb.is_file() {
        return Err(Error::BackendUnavailable(format!(
            "Debugger not found: {}",
            gdb.display()
        )));
    }

    let server_path = config.server_path.join("bin").join("openocd");
    let openocd_bin = openocd.path.as_deref().unwrap_or(&server_path);
    let mut remote = format!("target extended-remote | {}", openocd_bin.display());
    if let Some(dir) = &openocd.scripts_dir {
        remote.push_str(&format!(" -s \"{}\"", dir.display()));
    }
    for script in &openocd.scripts {
        remote.push_str(&format!(" --file \"{script}\""));
    }
    remote.push_str(" -c \"gdb_port pipe\" -c \"telnet_port 0\"");

    let mut spec = CommandSpec::new(gdb)
        .arg(format!("--interpreter={interpreter}"))
        .args(["-ex", "set pagination off"])
        .args(["-ex", "set remotetimeout 5"])
        .arg("-ex")
        .arg(remote)
        .arg(config.executable.to_string_lossy());
    if let Some(dir) = config.executable.parent() {
        spec = spec.current_dir(dir);
    }
    Ok(spec)
}
