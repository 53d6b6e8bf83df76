//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use common::{DataBits, DriverKind, DriverOverrides, LineParameters, Parity, StopBits, parse_hex_id};
use serde::{Deserialize, Serialize};
use serial::{DEFAULT_WRITE_BUFFER_SIZE, ManagerConfig, ThreadPriority, WorkerSettings};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    /// Line parameters applied on open
    #[serde(default)]
    pub line: LineSettings,
    /// I/O worker tuning
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Vendor/product to driver mappings checked before signature probing
    ///
    /// # Example Configuration
    /// ```toml
    /// [[driver_overrides]]
    /// vendor_id = "0x2341"
    /// product_id = "0x0043"
    /// driver = "cdc_acm"
    /// ```
    #[serde(default)]
    pub driver_overrides: Vec<DriverOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
    /// Ask for access to devices as soon as they are plugged in
    #[serde(default)]
    pub auto_request_permission: bool,
    /// Watch for device arrival and removal
    #[serde(default = "BridgeSettings::default_hotplug")]
    pub hotplug: bool,
}

impl BridgeSettings {
    fn default_hotplug() -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSettings {
    #[serde(default = "LineSettings::default_baud_rate")]
    pub baud_rate: u32,
    /// 5, 6, 7 or 8
    #[serde(default = "LineSettings::default_data_bits")]
    pub data_bits: u8,
    /// "1", "1.5" or "2"
    #[serde(default = "LineSettings::default_stop_bits")]
    pub stop_bits: String,
    /// none, odd, even, mark or space
    #[serde(default = "LineSettings::default_parity")]
    pub parity: Parity,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: Self::default_baud_rate(),
            data_bits: Self::default_data_bits(),
            stop_bits: Self::default_stop_bits(),
            parity: Self::default_parity(),
        }
    }
}

impl LineSettings {
    fn default_baud_rate() -> u32 {
        115_200
    }

    fn default_data_bits() -> u8 {
        8
    }

    fn default_stop_bits() -> String {
        "1".to_string()
    }

    fn default_parity() -> Parity {
        Parity::None
    }

    pub fn to_parameters(&self) -> Result<LineParameters> {
        let params = LineParameters::new(
            self.baud_rate,
            DataBits::try_from(self.data_bits)?,
            self.stop_bits.parse::<StopBits>()?,
            self.parity,
        );
        params.validate()?;
        Ok(params)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Read timeout in milliseconds (0 = block until data arrives)
    #[serde(default)]
    pub read_timeout_ms: u64,
    /// Write timeout in milliseconds (0 = no limit)
    #[serde(default)]
    pub write_timeout_ms: u64,
    /// Read buffer size in bytes (absent = endpoint max packet size)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_buffer_size: Option<usize>,
    /// Pending-write buffer capacity in bytes
    #[serde(default = "WorkerConfig::default_write_buffer_size")]
    pub write_buffer_size: usize,
    /// Run I/O workers above normal scheduling priority
    #[serde(default = "WorkerConfig::default_elevated_priority")]
    pub elevated_priority: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            read_buffer_size: None,
            write_buffer_size: Self::default_write_buffer_size(),
            elevated_priority: Self::default_elevated_priority(),
        }
    }
}

impl WorkerConfig {
    fn default_write_buffer_size() -> usize {
        DEFAULT_WRITE_BUFFER_SIZE
    }

    fn default_elevated_priority() -> bool {
        true
    }

    pub fn to_settings(&self) -> WorkerSettings {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        WorkerSettings {
            read_timeout: millis(self.read_timeout_ms),
            write_timeout: millis(self.write_timeout_ms),
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            priority: if self.elevated_priority {
                ThreadPriority::Elevated
            } else {
                ThreadPriority::Default
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverOverride {
    /// Hex vendor id, e.g. "0x1A86"
    pub vendor_id: String,
    /// Hex product id, e.g. "0x7523"
    pub product_id: String,
    pub driver: DriverKind,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
                auto_request_permission: false,
                hotplug: true,
            },
            line: LineSettings::default(),
            worker: WorkerConfig::default(),
            driver_overrides: Vec::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-serial-bridge/bridge.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-serial-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usb-serial-bridge/bridge.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        self.line
            .to_parameters()
            .context("Invalid [line] section")?;

        if self.worker.write_buffer_size == 0 {
            return Err(anyhow!("write_buffer_size must be greater than 0"));
        }
        if self.worker.read_buffer_size == Some(0) {
            return Err(anyhow!("read_buffer_size must be greater than 0"));
        }

        self.overrides()?;
        Ok(())
    }

    /// Build the driver override table
    pub fn overrides(&self) -> Result<DriverOverrides> {
        let mut table = DriverOverrides::new();
        for entry in &self.driver_overrides {
            let vid = validate_hex_id(&entry.vendor_id, "vendor_id")?;
            let pid = validate_hex_id(&entry.product_id, "product_id")?;
            table.insert(vid, pid, entry.driver);
        }
        Ok(table)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            worker: self.worker.to_settings(),
            auto_request_permission: self.bridge.auto_request_permission,
        }
    }
}

/// Validate a hex id written as "0x1234"
fn validate_hex_id(id: &str, name: &str) -> Result<u16> {
    if !id.starts_with("0x") && !id.starts_with("0X") {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1A86')",
            name,
            id
        ));
    }
    parse_hex_id(id).with_context(|| format!("Invalid {} '{}'", name, id))
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.bridge.log_level, "info");
        assert!(config.bridge.hotplug);
        assert!(!config.bridge.auto_request_permission);
        assert_eq!(
            config.line.to_parameters().unwrap(),
            LineParameters::default()
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_hex_id() {
        assert_eq!(validate_hex_id("0x1A86", "vendor_id").unwrap(), 0x1A86);
        assert_eq!(validate_hex_id("0X7523", "product_id").unwrap(), 0x7523);
        assert!(validate_hex_id("1A86", "vendor_id").is_err());
        assert!(validate_hex_id("0xGHIJ", "vendor_id").is_err());
        assert!(validate_hex_id("0x12345", "vendor_id").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = BridgeConfig::default();
        config.bridge.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.bridge.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_settings_conversion() {
        let worker = WorkerConfig {
            read_timeout_ms: 0,
            write_timeout_ms: 250,
            read_buffer_size: Some(512),
            write_buffer_size: 1024,
            elevated_priority: false,
        };
        let settings = worker.to_settings();
        assert_eq!(settings.read_timeout, None);
        assert_eq!(settings.write_timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.read_buffer_size, Some(512));
        assert_eq!(settings.priority, ThreadPriority::Default);
    }

    #[test]
    fn test_config_serialization() {
        let config = BridgeConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }
}
