//! Tests for debug target resolution

use super::fixtures::{
    FQBN, LoopbackLauncher, TestEnv, initialized_instance, no_ports, test_core,
};
use crate::Error;
use kiln_types::{
    DebugConfigRequest, GccToolchainConfig, InstanceId, OpenOcdServerConfig, Port, ServerConfig,
    ToolchainConfig,
};
use serde_json::json;
use std::path::PathBuf;

#[tokio::test]
async fn test_resolve_from_platform_profile() {
    let env = TestEnv::new().with_installed_platform();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;
    let platform = env.platform_dir();

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some(FQBN.to_string());
    req.port = Some(Port::serial("/dev/ttyACM0"));
    let config = core.debug_config(&req).await.unwrap();

    assert_eq!(
        config.executable,
        PathBuf::from("/s/build/acme:samd:zero/s.ino.elf")
    );
    assert_eq!(config.toolchain, "gcc");
    assert_eq!(config.toolchain_path, platform.join("tools/bin"));
    assert_eq!(config.toolchain_prefix, "arm-none-eabi");
    assert_eq!(config.server, "openocd");
    assert_eq!(config.server_path, platform.join("tools/openocd"));
    assert_eq!(
        config.toolchain_configuration,
        Some(ToolchainConfig::Gcc(GccToolchainConfig {}))
    );
    assert_eq!(
        config.server_configuration,
        Some(ServerConfig::OpenOcd(OpenOcdServerConfig {
            path: Some(platform.join("tools/openocd/bin/openocd")),
            scripts_dir: Some(platform.join("tools/openocd/share/openocd/scripts")),
            scripts: vec![
                "interface/edbg.cfg".to_string(),
                "target/at91samdXX.cfg".to_string()
            ],
        }))
    );
    assert_eq!(
        config.custom_configs.get("cortex-debug").map(String::as_str),
        Some("{\"device\":\"ATSAMD21G18\"}")
    );
    assert_eq!(
        config.svd_file,
        Some(platform.join("svd/ATSAMD21G18A.svd"))
    );
    assert_eq!(config.programmer.as_deref(), Some("edbg"));
}

#[tokio::test]
async fn test_resolve_import_dir_overrides_build_path() {
    let env = TestEnv::new().with_installed_platform();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some(FQBN.to_string());
    req.import_dir = Some(PathBuf::from("/tmp/artifacts"));
    let config = core.debug_config(&req).await.unwrap();

    assert_eq!(config.executable, PathBuf::from("/tmp/artifacts/s.ino.elf"));
}

#[tokio::test]
async fn test_resolve_empty_import_dir_uses_build_path() {
    let env = TestEnv::new().with_installed_platform();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some(FQBN.to_string());
    req.import_dir = Some(PathBuf::new());
    let config = core.debug_config(&req).await.unwrap();

    assert_eq!(
        config.executable,
        PathBuf::from("/s/build/acme:samd:zero/s.ino.elf")
    );
}

#[tokio::test]
async fn test_resolve_explicit_programmer() {
    let env = TestEnv::new().with_installed_platform();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some(FQBN.to_string());
    req.programmer = Some("jlink".to_string());
    let config = core.debug_config(&req).await.unwrap();

    assert_eq!(config.programmer.as_deref(), Some("jlink"));
    let Some(ServerConfig::OpenOcd(openocd)) = config.server_configuration else {
        panic!("Expected OpenOcd config");
    };
    assert_eq!(openocd.scripts[0], "interface/jlink.cfg");

    req.programmer = Some("stlink".to_string());
    assert!(matches!(
        core.debug_config(&req).await,
        Err(Error::UnsupportedTarget(_))
    ));
}

#[tokio::test]
async fn test_resolve_falls_back_to_sketch_metadata() {
    let env = TestEnv::new().with_installed_platform();
    let sketch = env.sketch("blink");
    std::fs::write(
        sketch.join("sketch.json"),
        json!({
            "defaultFqbn": FQBN,
            "defaultPort": "/dev/ttyACM3",
            "defaultProgrammer": "jlink"
        })
        .to_string(),
    )
    .unwrap();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let config = core
        .debug_config(&DebugConfigRequest::new(id, &sketch))
        .await
        .unwrap();

    assert_eq!(
        config.executable,
        sketch.join("build").join(FQBN).join("blink.ino.elf")
    );
    assert_eq!(config.programmer.as_deref(), Some("jlink"));
}

#[tokio::test]
async fn test_resolve_without_fqbn_is_missing_target() {
    let env = TestEnv::new().with_installed_platform();
    let sketch = env.sketch("blink");
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let result = core.debug_config(&DebugConfigRequest::new(id, &sketch)).await;
    assert!(matches!(result, Err(Error::MissingTarget(_))));
}

#[tokio::test]
async fn test_resolve_platform_not_installed() {
    let env = TestEnv::new().with_installed_platform();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some("other:avr:uno".to_string());
    assert!(matches!(
        core.debug_config(&req).await,
        Err(Error::UnsupportedTarget(_))
    ));
}

#[tokio::test]
async fn test_resolve_release_without_debug_profile() {
    let env = TestEnv::new().with_installed_platform();
    std::fs::write(
        env.dirs.installed_file(),
        json!({"platforms": [{"packager": "acme", "architecture": "samd", "version": "1.0.0"}]})
            .to_string(),
    )
    .unwrap();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some(FQBN.to_string());
    let err = core.debug_config(&req).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedTarget(_)));
    assert!(err.to_string().contains("Debugging is not supported"));
}

#[tokio::test]
async fn test_resolve_malformed_fqbn() {
    let env = TestEnv::new().with_installed_platform();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());
    let id = initialized_instance(&core).await;

    let mut req = DebugConfigRequest::new(id, "/s");
    req.fqbn = Some("acme::zero".to_string());
    assert!(matches!(
        core.debug_config(&req).await,
        Err(Error::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_resolve_unknown_instance() {
    let env = TestEnv::new();
    let core = test_core(&env, LoopbackLauncher::new(), no_ports());

    let mut req = DebugConfigRequest::new(InstanceId(42), "/s");
    req.fqbn = Some(FQBN.to_string());
    assert!(matches!(
        core.debug_config(&req).await,
        Err(Error::InvalidInstance(_))
    ));
}
