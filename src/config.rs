// Config Module - Configuration management and command-line argument parsing
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Terminal control panel for the ESP32 DMX512 controller",
    long_about = "Mirrors the controller's web page in the terminal: live channel levels over the\n\
                  /index_data socket, slider control, firmware + LittleFS upload, WiFi scan,\n\
                  configuration save, factory reset and reboot."
)]
pub struct Args {
    /// Device address (host or host:port)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Quiet mode: no TUI, log to stderr
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Config file path or name (e.g., --cfg /full/path or --cfg hall for ~/.config/dmxpanel/hall.conf)
    #[arg(long)]
    pub cfg: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Live panel (default)
    Monitor,
    /// Send one channel level and exit
    Set {
        /// DMX channel number
        #[arg(long)]
        channel: u16,
        /// Level 0-255
        #[arg(long)]
        value: u8,
    },
    /// Upload firmware and LittleFS images, then reboot
    Upload {
        #[arg(long)]
        firmware: PathBuf,
        #[arg(long)]
        filesystem: PathBuf,
    },
    /// List WiFi networks the device can see
    WifiScan,
    /// Wipe the device configuration and reboot
    FactoryReset {
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Reboot the device
    Reboot,
    /// Print the device's stored configuration
    RawConfig,
    /// Write the device configuration back with overrides, then reboot
    SaveConfig {
        /// Setting override, repeatable (e.g. --set wifi_ssid=attic --set channel2_max=200)
        #[arg(long = "set", value_parser = parse_key_value)]
        set: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    pub host: String,
    pub reconnect_delay_ms: u64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub wifi_rescan_delay_ms: u64,
    pub wifi_scan_timeout_ms: u64,
    pub upload_timeout_secs: u64,
    pub slider_step: u8,
    pub log_filter: String,
    pub log_unknown_fields: bool,
}

impl Default for PanelConfig {
    fn default() -> Self {
        PanelConfig {
            config_path: None,
            host: "192.168.4.1".to_string(),
            reconnect_delay_ms: 1000,
            probe_interval_ms: 1000,
            probe_timeout_ms: 1000,
            wifi_rescan_delay_ms: 5000,
            wifi_scan_timeout_ms: 15_000,
            upload_timeout_secs: 300,
            slider_step: 5,
            log_filter: "info".to_string(),
            log_unknown_fields: true,
        }
    }
}

impl PanelConfig {
    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        let mut args_provided = false;

        if let Some(ref host) = args.host {
            self.host = host.clone();
            args_provided = true;
        }

        if args_provided {
            self.sanitize();
        }
        args_provided
    }

    pub fn config_path(cfg_arg: Option<&str>) -> Result<PathBuf> {
        if let Some(cfg) = cfg_arg {
            let path = PathBuf::from(cfg);
            if path.is_absolute() || cfg.contains('/') || cfg.contains('\\') {
                return Ok(path);
            }

            let filename = if cfg.ends_with(".conf") {
                cfg.to_string()
            } else {
                format!("{}.conf", cfg)
            };
            Ok(Self::config_dir()?.join(filename))
        } else {
            Ok(Self::config_dir()?.join("config.conf"))
        }
    }

    fn config_dir() -> Result<PathBuf> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let config_dir = PathBuf::from(home).join(".config").join("dmxpanel");
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("cannot create {}", config_dir.display()))?;
        Ok(config_dir)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let mut parsed: Self = toml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        parsed.config_path = Some(path.to_path_buf());
        parsed.sanitize();
        Ok(parsed)
    }

    /// Load the file if it exists, otherwise defaults bound to that path.
    /// The flag is true when the file was found.
    pub fn load_or_default(cfg_arg: Option<&str>) -> Result<(Self, bool)> {
        let path = Self::config_path(cfg_arg)?;
        if path.exists() {
            Ok((Self::load_from(&path)?, true))
        } else {
            let config = PanelConfig {
                config_path: Some(path),
                ..Self::default()
            };
            Ok((config, false))
        }
    }

    pub fn sanitize(&mut self) {
        let host = self.host.trim();
        let host = ["http://", "ws://"]
            .iter()
            .find_map(|scheme| host.strip_prefix(scheme))
            .unwrap_or(host);
        self.host = host.trim_end_matches('/').to_string();
        self.log_filter = self.log_filter.trim().to_string();
        if self.log_filter.is_empty() {
            self.log_filter = "info".to_string();
        }

        self.reconnect_delay_ms = self.reconnect_delay_ms.clamp(100, 60_000);
        self.probe_interval_ms = self.probe_interval_ms.clamp(100, 60_000);
        self.probe_timeout_ms = self.probe_timeout_ms.clamp(100, 60_000);
        self.wifi_rescan_delay_ms = self.wifi_rescan_delay_ms.min(60_000);
        self.wifi_scan_timeout_ms = self.wifi_scan_timeout_ms.clamp(1000, 60_000);
        self.upload_timeout_secs = self.upload_timeout_secs.clamp(10, 3600);
        self.slider_step = self.slider_step.max(1);
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn wifi_rescan_delay(&self) -> Duration {
        Duration::from_millis(self.wifi_rescan_delay_ms)
    }

    pub fn wifi_scan_timeout(&self) -> Duration {
        Duration::from_millis(self.wifi_scan_timeout_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn save(&self) -> Result<()> {
        let path = match &self.config_path {
            Some(path) => path.clone(),
            None => Self::config_path(None)?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut sanitized = self.clone();
        sanitized.sanitize();

        let contents = format!(
            r#"# dmxpanel Configuration File

# Controller address (host or host:port, no scheme)
host = {}

# Wait between WebSocket reconnect attempts in milliseconds (fixed, no backoff)
reconnect_delay_ms = {}

# Reachability probe interval and per-probe timeout in milliseconds
probe_interval_ms = {}
probe_timeout_ms = {}

# Delay before asking again when the first WiFi scan comes back empty
wifi_rescan_delay_ms = {}

# Give up on a single WiFi scan request after this many milliseconds
wifi_scan_timeout_ms = {}

# Upper bound for one firmware + filesystem upload in seconds
upload_timeout_secs = {}

# Slider change per arrow key press in the TUI (1-255)
slider_step = {}

# Log filter when RUST_LOG is not set (e.g. "info", "debug", "dmxpanel=trace")
log_filter = {}

# Log device fields that have no matching panel element
log_unknown_fields = {}
"#,
            toml_string(&sanitized.host),
            sanitized.reconnect_delay_ms,
            sanitized.probe_interval_ms,
            sanitized.probe_timeout_ms,
            sanitized.wifi_rescan_delay_ms,
            sanitized.wifi_scan_timeout_ms,
            sanitized.upload_timeout_secs,
            sanitized.slider_step,
            toml_string(&sanitized.log_filter),
            sanitized.log_unknown_fields,
        );

        std::fs::write(&path, contents).with_context(|| format!("cannot write {}", path.display()))?;
        Ok(())
    }
}

fn toml_string(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}
