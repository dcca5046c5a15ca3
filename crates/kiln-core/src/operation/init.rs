use super::{InitRequest, OperationContext, ProgressSink};
use crate::Result;
use crate::fqbn::Fqbn;
use crate::index::load_state;
use crate::sketch::SketchMetadata;
use kiln_types::ProgressEvent;
use serde_json::{Value, json};
use tracing::info;

const TASK: &str = "Loading package index";

pub(super) async fn run(
    ctx: &OperationContext,
    req: &InitRequest,
    sink: &ProgressSink,
) -> Result<Value> {
    sink.emit(ProgressEvent::task(TASK)).await?;

    let (mut state, found) = load_state(&ctx.dirs)?;
    if !found {
        sink.log(format!(
            "No package index at {}, starting empty",
            ctx.dirs.package_index().display()
        ))
        .await?;
    }

    if let Some(sketch) = &req.sketch_path {
        let mut defaults = SketchMetadata::load(sketch);
        if let Some(profile) = req.profile.as_deref().filter(|p| !p.is_empty()) {
            defaults = defaults.with_profile(profile)?;
            // A profile pins a board, so its platform has to be installed
            if let Some(fqbn) = defaults.default_fqbn.as_deref() {
                state.board(&Fqbn::parse(fqbn)?)?;
            }
            sink.log(format!("Using profile '{profile}' of {}", sketch.display()))
                .await?;
        }
        state.sketch_defaults = defaults;
    }

    let packages = state.index.packages.len();
    let installed = state.installed.len();
    let fqbn = state.sketch_defaults.default_fqbn.clone();
    *ctx.instance.state.write().await = state;
    info!(
        "[{}] Index loaded: {} packages, {} installed",
        ctx.instance.id, packages, installed
    );

    sink.emit(ProgressEvent::task_done(TASK)).await?;
    let mut result = json!({ "packages": packages, "installed": installed });
    if let Some(fqbn) = fqbn {
        result["fqbn"] = json!(fqbn);
    }
    Ok(result)
}
