//! Shared types for kiln daemon components.
//!
//! This crate provides the data model used across kiln-core, kiln-rpc,
//! kiln-daemon, and kiln-cli. All types are serializable for RPC transport.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Byte payloads travel as lowercase hex strings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Handle of one client instance, allocated by the daemon and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ============================================================================
// Boards and ports
// ============================================================================

/// A communication port a board is attached to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub address: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub protocol_label: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

fn default_protocol() -> String {
    "serial".to_string()
}

impl Port {
    #[must_use]
    pub fn serial(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            label: address.clone(),
            address,
            protocol: default_protocol(),
            protocol_label: "Serial Port".to_string(),
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_usb_id(mut self, vid: &str, pid: &str) -> Self {
        self.properties
            .insert("vid".to_string(), vid.to_ascii_lowercase());
        self.properties
            .insert("pid".to_string(), pid.to_ascii_lowercase());
        self.protocol_label = "Serial Port (USB)".to_string();
        self
    }

    #[must_use]
    pub fn vid(&self) -> Option<&str> {
        self.properties.get("vid").map(String::as_str)
    }

    #[must_use]
    pub fn pid(&self) -> Option<&str> {
        self.properties.get("pid").map(String::as_str)
    }

    /// Identity of the port within one discovery view.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.protocol.clone(), self.address.clone())
    }
}

/// A board known to an installed platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardListItem {
    pub name: String,
    pub fqbn: String,
}

/// A port together with the installed boards matching its hardware ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedPort {
    pub port: Port,
    #[serde(default)]
    pub matching_boards: Vec<BoardListItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Added,
    Removed,
    Updated,
}

/// One incremental change in a board-watch subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardDelta {
    /// Per-subscription sequence number, starting at 1
    pub seq: u64,
    pub kind: DeltaKind,
    pub port: DetectedPort,
}

/// Board set reconstructed by replaying deltas in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet {
    ports: BTreeMap<(String, String), DetectedPort>,
    last_seq: u64,
}

impl PortSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one delta.
    ///
    /// Returns `false` when the delta is out of sequence and was ignored.
    pub fn apply(&mut self, delta: &BoardDelta) -> bool {
        if delta.seq <= self.last_seq {
            return false;
        }
        self.last_seq = delta.seq;

        let key = delta.port.port.key();
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated => {
                self.ports.insert(key, delta.port.clone());
            }
            DeltaKind::Removed => {
                self.ports.remove(&key);
            }
        }
        true
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectedPort> {
        self.ports.values()
    }

    /// Current ports, ordered by protocol then address.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DetectedPort> {
        self.ports.values().cloned().collect()
    }
}

// ============================================================================
// Long-running operations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    Log,
}

/// One unit of a long-running operation's output stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Incremental textual output
    Output { stream: OutputStream, text: String },

    /// Named step progress
    Task {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        completed: bool,
    },

    /// Terminal success with the operation's result payload
    Completed {
        #[serde(default)]
        result: Value,
    },

    /// Terminal failure with its cause
    Failed { message: String },
}

impl ProgressEvent {
    #[must_use]
    pub fn log(text: impl Into<String>) -> Self {
        Self::Output {
            stream: OutputStream::Log,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn task(name: impl Into<String>) -> Self {
        Self::Task {
            name: name.into(),
            message: None,
            completed: false,
        }
    }

    #[must_use]
    pub fn task_done(name: impl Into<String>) -> Self {
        Self::Task {
            name: name.into(),
            message: None,
            completed: true,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

// ============================================================================
// Debugging
// ============================================================================

/// Parameters identifying the target of a debug session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugConfigRequest {
    pub instance: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqbn: Option<String>,
    pub sketch_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub programmer: Option<String>,
}

impl DebugConfigRequest {
    #[must_use]
    pub fn new(instance: InstanceId, sketch_path: impl Into<PathBuf>) -> Self {
        Self {
            instance,
            fqbn: None,
            sketch_path: sketch_path.into(),
            port: None,
            interpreter: None,
            import_dir: None,
            programmer: None,
        }
    }
}

/// Client-to-daemon message of a debug stream.
///
/// The first message must carry `config` and nothing else; later messages
/// carry raw bytes or the interrupt flag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<DebugConfigRequest>,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub send_interrupt: bool,
}

impl DebugRequest {
    #[must_use]
    pub fn open(config: DebugConfigRequest) -> Self {
        Self {
            config: Some(config),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn interrupt() -> Self {
        Self {
            send_interrupt: true,
            ..Self::default()
        }
    }
}

/// Daemon-to-client message of a debug stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugResponse {
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DebugResponse {
    #[must_use]
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Resolved configuration of one debug session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugSessionConfig {
    pub executable: PathBuf,
    pub toolchain: String,
    pub toolchain_path: PathBuf,
    pub toolchain_prefix: String,
    pub server: String,
    pub server_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain_configuration: Option<ToolchainConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_configuration: Option<ServerConfig>,
    /// Third-party plugin payloads, attached verbatim
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_configs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub svd_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub programmer: Option<String>,
}

/// GCC toolchain settings (no options yet)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GccToolchainConfig {}

/// `OpenOCD` server settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOcdServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scripts_dir: Option<PathBuf>,
    #[serde(default)]
    pub scripts: Vec<String>,
}

/// Toolchain-specific payload keyed by toolchain identifier.
///
/// Unrecognized kinds are kept as-is and forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BackendBlob", into = "BackendBlob")]
pub enum ToolchainConfig {
    Gcc(GccToolchainConfig),
    Unknown {
        kind: String,
        payload: Map<String, Value>,
    },
}

impl ToolchainConfig {
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Gcc(_) => "gcc",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// Server-specific payload keyed by server identifier.
///
/// Unrecognized kinds are kept as-is and forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BackendBlob", into = "BackendBlob")]
pub enum ServerConfig {
    OpenOcd(OpenOcdServerConfig),
    Unknown {
        kind: String,
        payload: Map<String, Value>,
    },
}

impl ServerConfig {
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::OpenOcd(_) => "openocd",
            Self::Unknown { kind, .. } => kind,
        }
    }
}

/// Wire shape shared by backend payloads: `{"kind": ..., <payload fields>}`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackendBlob {
    kind: String,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

impl TryFrom<BackendBlob> for ToolchainConfig {
    type Error = String;

    fn try_from(blob: BackendBlob) -> Result<Self, Self::Error> {
        match blob.kind.as_str() {
            "gcc" => serde_json::from_value(Value::Object(blob.payload))
                .map(ToolchainConfig::Gcc)
                .map_err(|e| format!("Invalid gcc toolchain configuration: {e}")),
            _ => Ok(ToolchainConfig::Unknown {
                kind: blob.kind,
                payload: blob.payload,
            }),
        }
    }
}

impl From<ToolchainConfig> for BackendBlob {
    fn from(config: ToolchainConfig) -> Self {
        match config {
            ToolchainConfig::Gcc(GccToolchainConfig {}) => BackendBlob {
                kind: "gcc".to_string(),
                payload: Map::new(),
            },
            ToolchainConfig::Unknown { kind, payload } => BackendBlob { kind, payload },
        }
    }
}

impl TryFrom<BackendBlob> for ServerConfig {
    type Error = String;

    fn try_from(blob: BackendBlob) -> Result<Self, Self::Error> {
        match blob.kind.as_str() {
            "openocd" => serde_json::from_value(Value::Object(blob.payload))
                .map(ServerConfig::OpenOcd)
                .map_err(|e| format!("Invalid openocd server configuration: {e}")),
            _ => Ok(ServerConfig::Unknown {
                kind: blob.kind,
                payload: blob.payload,
            }),
        }
    }
}

impl From<ServerConfig> for BackendBlob {
    fn from(config: ServerConfig) -> Self {
        match config {
            ServerConfig::OpenOcd(openocd) => {
                let mut payload = Map::new();
                if let Some(path) = openocd.path {
                    payload.insert("path".to_string(), Value::from(path.to_string_lossy()));
                }
                if let Some(dir) = openocd.scripts_dir {
                    payload.insert("scripts_dir".to_string(), Value::from(dir.to_string_lossy()));
                }
                payload.insert("scripts".to_string(), Value::from(openocd.scripts));
                BackendBlob {
                    kind: "openocd".to_string(),
                    payload,
                }
            }
            ServerConfig::Unknown { kind, payload } => BackendBlob { kind, payload },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detected(address: &str) -> DetectedPort {
        DetectedPort {
            port: Port::serial(address),
            matching_boards: Vec::new(),
        }
    }

    #[test]
    fn test_instance_id_is_transparent() {
        let json = serde_json::to_string(&InstanceId(7)).unwrap();
        assert_eq!(json, "7");
        let id: InstanceId = serde_json::from_str("12").unwrap();
        assert_eq!(id, InstanceId(12));
    }

    #[test]
    fn test_port_usb_ids_are_lowercased() {
        let port = Port::serial("/dev/ttyACM0").with_usb_id("2341", "804E");
        assert_eq!(port.vid(), Some("2341"));
        assert_eq!(port.pid(), Some("804e"));
        assert_eq!(port.key(), ("serial".to_string(), "/dev/ttyACM0".to_string()));
    }

    #[test]
    fn test_port_protocol_defaults_to_serial() {
        let port: Port = serde_json::from_str(r#"{"address":"/dev/ttyUSB0"}"#).unwrap();
        assert_eq!(port.protocol, "serial");
        assert!(port.properties.is_empty());
    }

    #[test]
    fn test_progress_event_tagging() {
        let event = ProgressEvent::Failed {
            message: "Platform not found: acme:avr".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert!(event.is_terminal());

        let event: ProgressEvent =
            serde_json::from_value(json!({"type": "output", "stream": "stderr", "text": "x"}))
                .unwrap();
        assert!(!event.is_terminal());
        assert!(matches!(
            event,
            ProgressEvent::Output {
                stream: OutputStream::Stderr,
                ..
            }
        ));
    }

    #[test]
    fn test_completed_without_result_defaults_to_null() {
        let event: ProgressEvent = serde_json::from_str(r#"{"type":"completed"}"#).unwrap();
        assert_eq!(event, ProgressEvent::Completed { result: Value::Null });
    }

    #[test]
    fn test_debug_request_data_is_hex() {
        let req = DebugRequest::data(b"ping".to_vec());
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"data": "70696e67"}));

        let back: DebugRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, b"ping");
        assert!(back.config.is_none());
        assert!(!back.send_interrupt);
    }

    #[test]
    fn test_debug_request_rejects_bad_hex() {
        let result = serde_json::from_value::<DebugRequest>(json!({"data": "zz"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_request_interrupt_omits_data() {
        let json = serde_json::to_value(DebugRequest::interrupt()).unwrap();
        assert_eq!(json, json!({"send_interrupt": true}));
    }

    #[test]
    fn test_debug_request_open_carries_config() {
        let mut config = DebugConfigRequest::new(InstanceId(1), "/s");
        config.fqbn = Some("vendor:arch:board".to_string());
        let json = serde_json::to_value(DebugRequest::open(config)).unwrap();
        assert_eq!(json["config"]["instance"], 1);
        assert_eq!(json["config"]["fqbn"], "vendor:arch:board");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_debug_response_error() {
        let resp = DebugResponse::error("gdb exited with status 1");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, json!({"error": "gdb exited with status 1"}));
    }

    #[test]
    fn test_toolchain_config_gcc() {
        let config: ToolchainConfig = serde_json::from_value(json!({"kind": "gcc"})).unwrap();
        assert_eq!(config, ToolchainConfig::Gcc(GccToolchainConfig {}));
        assert_eq!(serde_json::to_value(&config).unwrap(), json!({"kind": "gcc"}));
    }

    #[test]
    fn test_server_config_openocd() {
        let config: ServerConfig = serde_json::from_value(json!({
            "kind": "openocd",
            "path": "/tools/openocd/bin/openocd",
            "scripts_dir": "/tools/openocd/share/openocd/scripts",
            "scripts": ["board/atmel_samd.cfg"]
        }))
        .unwrap();

        let ServerConfig::OpenOcd(openocd) = &config else {
            panic!("Expected OpenOcd config");
        };
        assert_eq!(openocd.scripts, vec!["board/atmel_samd.cfg"]);
        assert_eq!(config.kind(), "openocd");

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["kind"], "openocd");
        assert_eq!(json["scripts"][0], "board/atmel_samd.cfg");
    }

    #[test]
    fn test_server_config_openocd_wrong_shape_is_error() {
        let result =
            serde_json::from_value::<ServerConfig>(json!({"kind": "openocd", "scripts": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_backend_kind_is_forwarded_unchanged() {
        let original = json!({
            "kind": "jlink",
            "device": "ATSAMD21G18",
            "speed": 4000,
            "nested": {"a": [1, 2, 3]}
        });
        let config: ServerConfig = serde_json::from_value(original.clone()).unwrap();
        assert_eq!(config.kind(), "jlink");
        assert!(matches!(config, ServerConfig::Unknown { .. }));
        assert_eq!(serde_json::to_value(&config).unwrap(), original);

        let toolchain: ToolchainConfig =
            serde_json::from_value(json!({"kind": "llvm", "target": "thumbv7em"})).unwrap();
        assert_eq!(toolchain.kind(), "llvm");
    }

    #[test]
    fn test_backend_config_requires_kind() {
        let result = serde_json::from_value::<ToolchainConfig>(json!({"target": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_port_set_applies_deltas() {
        let mut set = PortSet::new();
        assert!(set.apply(&BoardDelta {
            seq: 1,
            kind: DeltaKind::Added,
            port: detected("/dev/ttyACM0"),
        }));
        assert!(set.apply(&BoardDelta {
            seq: 2,
            kind: DeltaKind::Added,
            port: detected("/dev/ttyUSB0"),
        }));
        assert!(set.apply(&BoardDelta {
            seq: 3,
            kind: DeltaKind::Removed,
            port: detected("/dev/ttyACM0"),
        }));

        assert_eq!(set.len(), 1);
        assert_eq!(set.last_seq(), 3);
        assert_eq!(set.snapshot()[0].port.address, "/dev/ttyUSB0");
    }

    #[test]
    fn test_port_set_ignores_stale_sequence() {
        let mut set = PortSet::new();
        set.apply(&BoardDelta {
            seq: 5,
            kind: DeltaKind::Added,
            port: detected("/dev/ttyACM0"),
        });
        let applied = set.apply(&BoardDelta {
            seq: 4,
            kind: DeltaKind::Removed,
            port: detected("/dev/ttyACM0"),
        });
        assert!(!applied);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_port_set_update_replaces_boards() {
        let mut set = PortSet::new();
        set.apply(&BoardDelta {
            seq: 1,
            kind: DeltaKind::Added,
            port: detected("/dev/ttyACM0"),
        });
        let mut updated = detected("/dev/ttyACM0");
        updated.matching_boards.push(BoardListItem {
            name: "Zero".to_string(),
            fqbn: "acme:samd:zero".to_string(),
        });
        set.apply(&BoardDelta {
            seq: 2,
            kind: DeltaKind::Updated,
            port: updated.clone(),
        });
        assert_eq!(set.snapshot(), vec![updated]);
    }
}

/// Property-based tests for delta replay.
#[cfg(test)]
mod proptest_delta_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn arb_ops() -> impl Strategy<Value = Vec<(bool, u8)>> {
        proptest::collection::vec((any::<bool>(), 0u8..6), 0..60)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Replaying add/remove deltas yields the same set as tracking addresses directly.
        #[test]
        fn replay_matches_direct_tracking(ops in arb_ops()) {
            let mut set = PortSet::new();
            let mut expected = BTreeSet::new();
            let mut seq = 0;

            for (add, n) in ops {
                let address = format!("/dev/ttyACM{n}");
                let present = expected.contains(&address);
                let kind = match (add, present) {
                    (true, false) => DeltaKind::Added,
                    (false, true) => DeltaKind::Removed,
                    _ => continue,
                };
                seq += 1;
                if add {
                    expected.insert(address.clone());
                } else {
                    expected.remove(&address);
                }
                let applied = set.apply(&BoardDelta {
                    seq,
                    kind,
                    port: DetectedPort { port: Port::serial(address), matching_boards: Vec::new() },
                });
                prop_assert!(applied);
            }

            let actual: BTreeSet<String> = set.iter().map(|p| p.port.address.clone()).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
