use super::{OperationContext, PlatformInstallRequest, ProgressSink, run_tool};
use crate::index::{InstalledPlatform, PlatformRelease};
use crate::process::{CommandSpec, Exit};
use crate::{Error, Result};
use kiln_types::ProgressEvent;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHECKSUM_PREFIX: &str = "SHA-256:";

pub(super) async fn run(
    ctx: &OperationContext,
    req: &PlatformInstallRequest,
    sink: &ProgressSink,
) -> Result<Value> {
    let _install = ctx.instance.install_lock.lock().await;
    let platform_id = format!("{}:{}", req.packager, req.architecture);

    let (release, already_installed) = {
        let state = ctx.instance.state.read().await;
        let release = state
            .index
            .find_platform(&req.packager, &req.architecture, req.version.as_deref())
            .ok_or_else(|| {
                let version = req
                    .version
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("@{v}"))
                    .unwrap_or_default();
                Error::OperationFailed(format!("Platform {platform_id}{version} not found"))
            })?
            .clone();
        let already = state
            .installed
            .find(&req.packager, &req.architecture)
            .is_some_and(|p| p.version == release.version);
        (release, already)
    };

    let label = format!("{platform_id}@{}", release.version);
    if already_installed {
        sink.log(format!("Platform {label} already installed")).await?;
        return Ok(json!({
            "platform": platform_id,
            "version": release.version,
            "already_installed": true,
        }));
    }

    let task = format!("Installing {label}");
    sink.emit(ProgressEvent::task(&task)).await?;

    verify_staged_archive(ctx, &release, sink).await?;

    let platform_dir = ctx
        .dirs
        .platform_dir(&req.packager, &req.architecture, &release.version);
    std::fs::create_dir_all(&platform_dir)?;

    if !release.post_install.is_empty() {
        if req.skip_post_install {
            sink.log("Skipping post-install script").await?;
        } else {
            run_post_install(ctx, &release.post_install, &platform_dir, sink).await?;
        }
    }

    {
        let mut state = ctx.instance.state.write().await;
        state.installed.insert(InstalledPlatform::new(
            &req.packager,
            &req.architecture,
            &release.version,
        ));
        state.installed.save(&ctx.dirs.installed_file())?;
    }
    info!("[{}] Installed {}", ctx.instance.id, label);

    sink.emit(ProgressEvent::task_done(task)).await?;
    Ok(json!({
        "platform": platform_id,
        "version": release.version,
        "already_installed": false,
    }))
}

async fn verify_staged_archive(
    ctx: &OperationContext,
    release: &PlatformRelease,
    sink: &ProgressSink,
) -> Result<()> {
    let (Some(checksum), Some(archive)) = (&release.checksum, &release.archive_file_name) else {
        return Ok(());
    };
    let path = ctx.dirs.staging().join(archive);
    if !path.is_file() {
        debug!("Archive {} not staged, skipping verification", path.display());
        return Ok(());
    }

    let expected = checksum
        .strip_prefix(CHECKSUM_PREFIX)
        .ok_or_else(|| Error::OperationFailed(format!("Unsupported checksum format: {checksum}")))?
        .to_ascii_lowercase();

    sink.emit(ProgressEvent::task(format!("Verifying {archive}"))).await?;
    let actual = compute_file_hash(&path)?;
    if actual != expected {
        return Err(Error::OperationFailed(format!(
            "Checksum mismatch for {archive}: expected {expected}, got {actual}"
        )));
    }
    sink.emit(ProgressEvent::task_done(format!("Verifying {archive}")))
        .await
}

async fn run_post_install(
    ctx: &OperationContext,
    argv: &[String],
    platform_dir: &Path,
    sink: &ProgressSink,
) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let program = PathBuf::from(program);
    let program = if program.is_relative() && program.components().count() > 1 {
        platform_dir.join(program)
    } else {
        program
    };
    let spec = CommandSpec::new(program)
        .args(args.iter().cloned())
        .current_dir(platform_dir);

    sink.emit(ProgressEvent::task("Running post-install script"))
        .await?;
    match run_tool(ctx.launcher.as_ref(), &spec, sink).await? {
        Exit::Code(0) => {
            sink.emit(ProgressEvent::task_done("Running post-install script"))
                .await
        }
        Exit::Code(code) => Err(Error::OperationFailed(format!(
            "Post-install script failed with exit status {code}"
        ))),
        Exit::Signal(signal) => Err(Error::TransportClosed(format!(
            "Post-install script terminated by signal {signal}"
        ))),
    }
}

/// SHA-256 of a file as lowercase hex
fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
