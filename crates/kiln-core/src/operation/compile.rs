use super::{CompileRequest, OperationContext, ProgressSink, run_tool};
use crate::fqbn::{Fqbn, default_build_path};
use crate::process::{CommandSpec, Exit};
use crate::recipe::Placeholders;
use crate::sketch;
use crate::{Error, Result};
use kiln_types::ProgressEvent;
use serde_json::{Value, json};
use tracing::info;

pub(super) async fn run(
    ctx: &OperationContext,
    req: &CompileRequest,
    sink: &ProgressSink,
) -> Result<Value> {
    let fqbn = Fqbn::parse(&req.fqbn)?;
    sketch::main_file(&req.sketch_path)?;
    let project = sketch::project_name(&req.sketch_path);

    let (recipe, platform_path) = {
        let state = ctx.instance.state.read().await;
        let resolved = state.board(&fqbn)?;
        if resolved.platform.compile.is_empty() {
            return Err(Error::UnsupportedTarget(format!(
                "Platform {} has no compile recipe",
                fqbn.platform_id()
            )));
        }
        (resolved.platform.compile.clone(), resolved.platform_path)
    };

    let build_path = req
        .build_path
        .clone()
        .unwrap_or_else(|| default_build_path(&req.sketch_path, &req.fqbn));
    std::fs::create_dir_all(&build_path)?;

    let vars = Placeholders::new()
        .with_path("sketch.path", &req.sketch_path)
        .with_path("build.path", &build_path)
        .with("build.fqbn", fqbn.to_string())
        .with("build.project_name", project.as_str())
        .with_path("runtime.platform.path", &platform_path);
    let argv = vars.expand_all(&recipe);
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::UnsupportedTarget("Empty compile recipe".to_string()));
    };
    let spec = CommandSpec::new(program)
        .args(args.iter().cloned())
        .current_dir(&req.sketch_path);

    let task = format!("Compiling {project} for {fqbn}");
    sink.emit(ProgressEvent::task(&task)).await?;
    if req.verbose {
        sink.log(spec.display()).await?;
    }

    match run_tool(ctx.launcher.as_ref(), &spec, sink).await? {
        Exit::Code(0) => {}
        Exit::Code(code) => {
            return Err(Error::OperationFailed(format!(
                "Compilation failed with exit status {code}"
            )));
        }
        Exit::Signal(signal) => {
            return Err(Error::TransportClosed(format!(
                "Compiler terminated by signal {signal}"
            )));
        }
    }

    let executable = build_path.join(format!("{project}.ino.elf"));
    info!("[{}] Compiled {} into {}", ctx.instance.id, project, build_path.display());
    sink.emit(ProgressEvent::task_done(task)).await?;
    Ok(json!({
        "build_path": build_path,
        "executable": executable,
    }))
}
