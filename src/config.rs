use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Configuration errors are fatal: the gateway refuses to start
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to fetch configuration: {0}")]
    Fetch(String),

    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// HTTP listen address (`host:port`)
    pub address: String,

    /// Optional static file root served at `/`
    #[serde(rename = "static")]
    pub static_dir: String,

    /// TLS certificate path; TLS is enabled when both `cert` and `key` are set
    pub cert: String,

    /// TLS private key path
    pub key: String,

    /// Default ADB invocation (executable plus options); ports may override
    pub adb: Vec<String>,

    /// Device sessions keyed by TCP port
    pub ports: HashMap<u16, PortConfig>,

    /// When non-empty, every request must authenticate
    pub users: HashMap<String, UserConfig>,

    /// Extra or restricted HTTP endpoints keyed by path
    pub endpoints: HashMap<String, EndpointConfig>,

    /// Plugin processes to spawn at startup (argv per plugin)
    pub extensions: Vec<Vec<String>>,
}

/// Per-port session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PortConfig {
    pub video: bool,
    pub audio: bool,
    pub control: bool,

    /// Dial the device-side tunnel instead of accepting incoming connections
    pub forward: bool,

    /// ADB invocation override for this port
    pub adb: Vec<String>,

    /// Device selector: "usb", "tcpip", a serial, or empty
    pub adb_device: String,

    /// Path of the scrcpy-server JAR on the device
    pub scrcpy_server: String,

    /// Version argument passed to the scrcpy server
    pub scrcpy_server_version: String,

    /// Extra arguments appended to the scrcpy server invocation
    pub scrcpy_server_options: Vec<String>,

    pub clipboard_autosync: bool,
    pub cleanup: bool,
    pub power_on: bool,

    /// HID report descriptors (hex) for the UHID devices created on connect
    pub uhid_keyboard_report_desc: String,
    pub uhid_keyboard_name: String,
    pub uhid_keyboard_vendor_id: u16,
    pub uhid_keyboard_product_id: u16,

    pub uhid_mouse_report_desc: String,
    pub uhid_mouse_name: String,
    pub uhid_mouse_vendor_id: u16,
    pub uhid_mouse_product_id: u16,

    pub uhid_gamepad_report_desc: String,
    pub uhid_gamepad_name: String,
    pub uhid_gamepad_vendor_id: u16,
    pub uhid_gamepad_product_id: u16,

    /// Plugin ids owning a feature stream; the HTTP endpoint 404s when set
    pub video_extension: String,
    pub audio_extension: String,
    pub clipboard_stream_extension: String,
    pub uhid_keyboard_output_extension: String,

    /// Raw-video decoder subprocess configuration
    pub video_decoder: Option<VideoDecoderConfig>,

    /// Commands run after every successful connect
    pub connected_commands: Vec<Vec<String>>,
}

/// External raw-video decoder configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VideoDecoderConfig {
    pub executable: String,

    /// Per-request streaming mode instead of the background snapshot worker
    pub stream: bool,

    /// Decode to RGBA instead of RGB
    pub alpha: bool,

    /// Treat the executable as FFmpeg rather than the custom decoder protocol
    pub ffmpeg: bool,
}

/// A configured user and the ports it may touch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserConfig {
    pub password: String,
    pub allowed_ports: Vec<u16>,
}

/// A configured endpoint: an allow-list for a built-in path, a command
/// template, or a canned response kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Fixed target port; otherwise the `port` query parameter applies
    pub port: Option<u16>,

    /// Users allowed on this endpoint (everyone when empty)
    pub users: Vec<String>,

    /// Command sequence, with `${name}` expanding to query parameters
    pub commands: Option<Vec<Vec<String>>>,

    pub response: Option<ResponseKind>,

    /// How long the `clipboard` response kind waits for the device (e.g. "500ms")
    pub clipboard_timeout: Option<String>,
}

/// Canned responses a configured endpoint can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    VideoStream,
    RawVideoStream,
    RgbVideoStream,
    AudioStream,
    RawAudioStream,
    ClipboardStream,
    UhidKeyboardOutputStream,
    Clipboard,
    DeviceName,
    VideoCodec,
    AudioCodec,
    InitialVideoWidth,
    InitialVideoHeight,
    VideoFrame,
    Encoders,
    Displays,
    Cameras,
    CameraSizes,
    Apps,
}

impl Config {
    /// Load the configuration from the given source: `None` or `-` for
    /// stdin, an `http(s)://` URL, or a file path
    pub async fn load(source: Option<&str>) -> Result<Config, ConfigError> {
        let bytes = match source {
            None | Some("-") => {
                use tokio::io::AsyncReadExt;
                let mut data = Vec::new();
                tokio::io::stdin().read_to_end(&mut data).await?;
                data
            }
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
                let response = reqwest::get(url)
                    .await
                    .map_err(|e| ConfigError::Fetch(e.to_string()))?;
                if response.status() != reqwest::StatusCode::OK {
                    return Err(ConfigError::Fetch(format!(
                        "unexpected status {}",
                        response.status()
                    )));
                }
                response
                    .bytes()
                    .await
                    .map_err(|e| ConfigError::Fetch(e.to_string()))?
                    .to_vec()
            }
            Some(path) => tokio::fs::read(path).await?,
        };

        let config: Config = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation; any failure is fatal
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address is empty".to_string()));
        }

        if self.ports.is_empty() {
            return Err(ConfigError::Invalid("no ports configured".to_string()));
        }

        for (port, port_config) in &self.ports {
            for desc in [
                &port_config.uhid_keyboard_report_desc,
                &port_config.uhid_mouse_report_desc,
                &port_config.uhid_gamepad_report_desc,
            ] {
                if !desc.is_empty() && hex::decode(desc).is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "port {port}: invalid UHID report descriptor"
                    )));
                }
            }
        }

        for (path, endpoint) in &self.endpoints {
            if !path.starts_with('/') || path.ends_with('/') || path != path.trim() {
                return Err(ConfigError::Invalid(format!(
                    "invalid endpoint path {path:?}"
                )));
            }

            if endpoint.commands.is_some() && endpoint.response.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {path}: both commands and response set"
                )));
            }

            if let Some(timeout) = &endpoint.clipboard_timeout
                && humantime::parse_duration(timeout).is_err()
            {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {path}: invalid clipboard timeout"
                )));
            }

            if endpoint.response == Some(ResponseKind::Clipboard) {
                let positive = endpoint
                    .clipboard_timeout
                    .as_deref()
                    .and_then(|t| humantime::parse_duration(t).ok())
                    .is_some_and(|d| !d.is_zero());
                if !positive {
                    return Err(ConfigError::Invalid(format!(
                        "endpoint {path}: clipboard response requires a positive timeout"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Resolve a `port` query parameter. A missing parameter is accepted only
    /// when exactly one port is configured.
    pub fn resolve_port(&self, query: Option<&str>) -> Option<u16> {
        match query {
            None | Some("") => {
                if self.ports.len() == 1 {
                    self.ports.keys().next().copied()
                } else {
                    None
                }
            }
            Some(value) => value.parse().ok(),
        }
    }

    /// ADB argv (executable plus options) for a port
    pub fn adb_invocation(&self, port_config: &PortConfig) -> Vec<String> {
        if !port_config.adb.is_empty() {
            port_config.adb.clone()
        } else if !self.adb.is_empty() {
            self.adb.clone()
        } else {
            vec!["adb".to_string()]
        }
    }
}

impl UserConfig {
    pub fn allows_port(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_str(
            r#"{
                "address": "127.0.0.1:8080",
                "ports": { "27183": { "video": true, "control": true } }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_minimal_config_parses_and_validates() {
        let config = minimal();
        assert!(config.validate().is_ok());
        assert!(config.ports[&27183].video);
        assert!(config.ports[&27183].control);
        assert!(!config.ports[&27183].audio);
    }

    #[test]
    fn test_empty_address_rejected() {
        let mut config = minimal();
        config.address.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_ports_rejected() {
        let mut config = minimal();
        config.ports.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_uhid_descriptor_rejected() {
        let mut config = minimal();
        config
            .ports
            .get_mut(&27183)
            .unwrap()
            .uhid_keyboard_report_desc = "zz".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_path_rules() {
        let mut config = minimal();

        config
            .endpoints
            .insert("nope".to_string(), EndpointConfig::default());
        assert!(config.validate().is_err());

        config.endpoints.clear();
        config
            .endpoints
            .insert("/trailing/".to_string(), EndpointConfig::default());
        assert!(config.validate().is_err());

        config.endpoints.clear();
        config
            .endpoints
            .insert("/ok".to_string(), EndpointConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_contradictory_endpoint_rejected() {
        let mut config = minimal();
        config.endpoints.insert(
            "/both".to_string(),
            EndpointConfig {
                commands: Some(vec![vec!["rotate".to_string()]]),
                response: Some(ResponseKind::DeviceName),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clipboard_endpoint_requires_timeout() {
        let mut config = minimal();
        config.endpoints.insert(
            "/clip".to_string(),
            EndpointConfig {
                response: Some(ResponseKind::Clipboard),
                ..Default::default()
            },
        );
        assert!(config.validate().is_err());

        config.endpoints.get_mut("/clip").unwrap().clipboard_timeout =
            Some("500ms".to_string());
        assert!(config.validate().is_ok());

        config.endpoints.get_mut("/clip").unwrap().clipboard_timeout = Some("0s".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_resolution() {
        let mut config = minimal();
        assert_eq!(config.resolve_port(None), Some(27183));
        assert_eq!(config.resolve_port(Some("")), Some(27183));
        assert_eq!(config.resolve_port(Some("27183")), Some(27183));
        assert_eq!(config.resolve_port(Some("bogus")), None);

        config.ports.insert(27185, PortConfig::default());
        assert_eq!(config.resolve_port(None), None);
        assert_eq!(config.resolve_port(Some("27185")), Some(27185));
    }

    #[test]
    fn test_response_kind_names() {
        let endpoint: EndpointConfig =
            serde_json::from_str(r#"{ "response": "uhidKeyboardOutputStream" }"#).unwrap();
        assert_eq!(
            endpoint.response,
            Some(ResponseKind::UhidKeyboardOutputStream)
        );

        assert!(serde_json::from_str::<EndpointConfig>(r#"{ "response": "bogus" }"#).is_err());
    }

    #[test]
    fn test_adb_invocation_fallbacks() {
        let mut config = minimal();
        let port = config.ports[&27183].clone();
        assert_eq!(config.adb_invocation(&port), vec!["adb".to_string()]);

        config.adb = vec!["adb".to_string(), "-P".to_string(), "5038".to_string()];
        assert_eq!(config.adb_invocation(&port)[2], "5038");

        let mut with_override = port.clone();
        with_override.adb = vec!["/opt/adb".to_string()];
        assert_eq!(
            config.adb_invocation(&with_override),
            vec!["/opt/adb".to_string()]
        );
    }

    #[test]
    fn test_user_port_acl() {
        let user = UserConfig {
            password: "pw".to_string(),
            allowed_ports: vec![27183],
        };
        assert!(user.allows_port(27183));
        assert!(!user.allows_port(27184));
    }
}
