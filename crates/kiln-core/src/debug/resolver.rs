//! Resolve a debug target into a concrete [`DebugSessionConfig`].

use super::backend;
use crate::fqbn::{Fqbn, default_build_path};
use crate::index::{DebugProfile, IndexState};
use crate::recipe::Placeholders;
use crate::sketch::{SketchMetadata, project_name};
use crate::{Error, Result};
use kiln_types::{DebugConfigRequest, DebugSessionConfig};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::debug;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Resolve the toolchain and server for a debug request.
///
/// Target fields the request leaves unset fall back to the sketch's
/// `sketch.json`, then to the sketch the instance was initialized with. The
/// sketch directory does not have to exist.
///
/// # Errors
///
/// - `MissingTarget` when no FQBN is given or recorded for the sketch
/// - `UnsupportedTarget` when the platform is not installed, the board is
///   unknown, has no debug profile, or an explicit programmer is unknown
/// - `InvalidArgument` for a malformed FQBN
pub fn resolve(state: &IndexState, req: &DebugConfigRequest) -> Result<DebugSessionConfig> {
    let metadata = SketchMetadata::load(&req.sketch_path).or(&state.sketch_defaults);

    let fqbn_text = non_empty(req.fqbn.as_deref())
        .or_else(|| non_empty(metadata.default_fqbn.as_deref()))
        .ok_or_else(|| {
            Error::MissingTarget(format!(
                "No FQBN given and none recorded for sketch {}",
                req.sketch_path.display()
            ))
        })?
        .to_string();
    let fqbn = Fqbn::parse(&fqbn_text)?;

    let resolved = state.board(&fqbn)?;
    let profile: &DebugProfile = resolved
        .board
        .debug
        .as_ref()
        .or(resolved.platform.debug.as_ref())
        .ok_or_else(|| Error::UnsupportedTarget(format!("Debugging is not supported for {fqbn}")))?;

    let programmer = match non_empty(req.programmer.as_deref()) {
        Some(explicit) => {
            if !resolved.platform.programmers.iter().any(|p| p.id == explicit) {
                return Err(Error::UnsupportedTarget(format!(
                    "Programmer '{explicit}' is not available for {}",
                    fqbn.platform_id()
                )));
            }
            Some(explicit.to_string())
        }
        None => non_empty(metadata.default_programmer.as_deref())
            .or_else(|| non_empty(profile.default_programmer.as_deref()))
            .map(str::to_string),
    };

    let build_path = req
        .import_dir
        .clone()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| default_build_path(&req.sketch_path, &fqbn_text));
    let project = project_name(&req.sketch_path);
    let port = req
        .port
        .as_ref()
        .map(|p| p.address.clone())
        .or(metadata.default_port)
        .unwrap_or_default();

    let vars = Placeholders::new()
        .with_path("runtime.platform.path", &resolved.platform_path)
        .with_path("build.path", &build_path)
        .with("build.project_name", project.as_str())
        .with("upload.port.address", port)
        .with("programmer.id", programmer.clone().unwrap_or_default());

    let executable = match &profile.executable {
        Some(template) => PathBuf::from(vars.expand(template)),
        None => build_path.join(format!("{project}.ino.elf")),
    };
    let toolchain_path = PathBuf::from(vars.expand(&profile.toolchain_path));
    let server_path = PathBuf::from(vars.expand(&profile.server_path));

    let toolchain_configuration = backend::toolchain_config(
        &profile.toolchain,
        expand_map(&vars, &profile.toolchain_configuration),
    )?;
    let server_configuration = backend::server_config(
        &profile.server,
        expand_map(&vars, &profile.server_configuration),
        &server_path,
    )?;

    debug!(
        "Resolved debug target {}: {} + {}",
        fqbn, profile.toolchain, profile.server
    );

    Ok(DebugSessionConfig {
        executable,
        toolchain: profile.toolchain.clone(),
        toolchain_path,
        toolchain_prefix: vars.expand(&profile.toolchain_prefix),
        server: profile.server.clone(),
        server_path,
        toolchain_configuration: Some(toolchain_configuration),
        server_configuration: Some(server_configuration),
        custom_configs: profile.custom_configs.clone(),
        svd_file: profile
            .svd_file
            .as_deref()
            .map(|svd| PathBuf::from(vars.expand(svd))),
        programmer,
    })
}

fn expand_map(vars: &Placeholders, map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), expand_value(vars, v)))
        .collect()
}

fn expand_value(vars: &Placeholders, value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(vars.expand(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| expand_value(vars, v)).collect()),
        Value::Object(map) => Value::Object(expand_map(vars, map)),
        other => other.clone(),
    }
}
