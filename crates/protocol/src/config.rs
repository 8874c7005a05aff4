use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            ice: IceConfig::default(),
            capture: CaptureConfig::default(),
            reconnect: ReconnectConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// ICE settings for the host-network deployment.
///
/// The service runs with host networking and only ever talks to browsers on
/// the same LAN, so there are no STUN/TURN servers; candidates are host-only
/// and rewritten to the configured LAN address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// LAN address advertised in host candidates (NAT 1:1 rewrite).
    /// Empty string disables the rewrite.
    #[serde(default = "default_nat_host_ip")]
    pub nat_host_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// X11 display the receiver renders into
    #[serde(default = "default_display")]
    pub display: String,
    /// X authority file readable by this process
    #[serde(default = "default_xauthority")]
    pub xauthority: String,
    /// Process name of the upstream AirPlay receiver (diagnostics only)
    #[serde(default = "default_receiver_process")]
    pub receiver_process: String,
}

/// Auto-reconnection timing knobs. The defaults are the operational values;
/// tests shrink them to drive transitions quickly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive identical observations required to accept a presence flip
    #[serde(default = "default_confirmation_checks")]
    pub confirmation_checks: u32,
    /// Seconds to ignore further appear/ID-change events after an attempt
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Seconds after process start during which window events only seed state
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,
    /// Cap on the wait for a usable window when a client connects
    #[serde(default = "default_window_wait_secs")]
    pub window_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory MP4 recordings are written to
    #[serde(default = "default_records_dir")]
    pub records_dir: String,
    /// File the debug ring is saved to on explicit request
    #[serde(default = "default_debug_log_file")]
    pub debug_log_file: String,
    /// Candidate locations of the upstream receiver log, tried in order
    #[serde(default = "default_receiver_log_paths")]
    pub receiver_log_paths: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            nat_host_ip: default_nat_host_ip(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            display: default_display(),
            xauthority: default_xauthority(),
            receiver_process: default_receiver_process(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            confirmation_checks: default_confirmation_checks(),
            cooldown_secs: default_cooldown_secs(),
            startup_grace_secs: default_startup_grace_secs(),
            window_wait_secs: default_window_wait_secs(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            records_dir: default_records_dir(),
            debug_log_file: default_debug_log_file(),
            receiver_log_paths: default_receiver_log_paths(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_nat_host_ip() -> String {
    "192.168.1.115".to_string()
}
fn default_display() -> String {
    ":0".to_string()
}
fn default_xauthority() -> String {
    "/root/.Xauthority".to_string()
}
fn default_receiver_process() -> String {
    "uxplay".to_string()
}
fn default_confirmation_checks() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    5
}
fn default_startup_grace_secs() -> u64 {
    30
}
fn default_window_wait_secs() -> u64 {
    60
}
fn default_records_dir() -> String {
    "/var/airplay-records".to_string()
}
fn default_debug_log_file() -> String {
    "/var/log/appletv/debug.txt".to_string()
}
fn default_receiver_log_paths() -> Vec<String> {
    vec![
        "/var/log/appletv/uxplay.log".to_string(),
        "/tmp/uxplay.log".to_string(),
    ]
}
