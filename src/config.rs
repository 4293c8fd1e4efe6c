/// `config.rs` — station configuration model
///
/// Mirrors `config.json`. Wire names are camelCase; every section tolerates
/// missing keys by falling back to defaults so configs written by older
/// builds keep loading. The radio section once kept its transport fields
/// flat (`host`/`port`/`ip`/`wlanPort`/`path`/`rigModel`); `migrate` lifts
/// those into the nested form, writing a `.backup` copy before rewriting.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::qso::OperatorConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StationConfig {
    pub audio: AudioConfig,
    pub ft8: Ft8Config,
    pub last_selected_frequency: Option<FrequencySelection>,
    pub last_volume_gain: Option<VolumeGain>,
    pub server: ServerConfig,
    pub radio: RadioConfig,
    pub operators: Vec<OperatorConfig>,
    /// External logbook integration, passed through opaquely.
    pub wavelog: Option<Value>,
    /// Root for decoded-slot archival (`frames-YYYY-MM-DD.jsonl`).
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioConfig {
    pub input_device_name: Option<String>,
    pub output_device_name: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: u32,
    /// When set, every transmitted composition is archived as WAV here.
    pub dump_tx_dir: Option<PathBuf>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device_name: None,
            output_device_name: None,
            sample_rate: 48_000,
            buffer_size: 768,
            dump_tx_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Ft8Config {
    pub my_callsign: String,
    pub my_grid: String,
    pub frequency: u64,
    pub transmit_power: u32,
    pub auto_reply: bool,
    pub max_qso_timeout: i64,
    pub decode_while_transmitting: bool,
    pub spectrum_while_transmitting: bool,
}

impl Default for Ft8Config {
    fn default() -> Self {
        Self {
            my_callsign: String::new(),
            my_grid: String::new(),
            frequency: 14_074_000,
            transmit_power: 20,
            auto_reply: false,
            max_qso_timeout: 10,
            decode_while_transmitting: false,
            spectrum_while_transmitting: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrequencySelection {
    pub frequency: u64,
    pub mode: String,
    pub radio_mode: Option<String>,
    pub band: String,
    pub description: Option<String>,
}

impl Default for FrequencySelection {
    fn default() -> Self {
        Self {
            frequency: 14_074_000,
            mode: "FT8".into(),
            radio_mode: None,
            band: "20m".into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeGain {
    pub gain: f32,
    pub gain_db: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4_000,
            host: "127.0.0.1".into(),
        }
    }
}

// ── Radio section ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RadioType {
    #[default]
    None,
    Serial,
    Network,
    IcomWlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RadioConfig {
    #[serde(rename = "type")]
    pub kind: RadioType,
    pub transmit_compensation_ms: Option<i64>,
    pub network: Option<NetworkRadioConfig>,
    pub icom_wlan: Option<IcomWlanConfig>,
    pub serial: Option<SerialRadioConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkRadioConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IcomWlanConfig {
    pub ip: String,
    pub port: u16,
    pub user_name: Option<String>,
    pub password: Option<String>,
    pub data_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialRadioConfig {
    pub path: String,
    pub rig_model: Option<String>,
    pub serial_config: Option<Value>,
}

// ── Load / save / migrate ────────────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<StationConfig> {
    let raw = std::fs::read_to_string(path)?;
    let mut value: Value = serde_json::from_str(&raw)
        .map_err(|e| EngineError::InvalidConfig(format!("{}: {e}", path.display())))?;

    if migrate_legacy_radio(&mut value) {
        let backup = path.with_extension("json.backup");
        std::fs::write(&backup, &raw)?;
        std::fs::write(path, serde_json::to_string_pretty(&value)?.as_bytes())?;
        log::info!(
            "migrated legacy radio config; original kept at {}",
            backup.display()
        );
    }

    serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidConfig(format!("{}: {e}", path.display())))
}

pub fn save_config(path: &Path, config: &StationConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(path, json.as_bytes())?;
    Ok(())
}

/// Rewrite flat legacy radio fields into the nested form. Returns whether
/// anything changed; already-nested configs pass through untouched.
pub fn migrate_legacy_radio(config: &mut Value) -> bool {
    let Some(radio) = config.get_mut("radio").and_then(Value::as_object_mut) else {
        return false;
    };

    let mut changed = false;

    // network: { host, port }
    if !radio.contains_key("network") {
        let host = radio.get("host").and_then(Value::as_str).map(str::to_string);
        let port = radio.get("port").and_then(Value::as_u64);
        if let (Some(host), Some(port)) = (host, port) {
            radio.insert(
                "network".into(),
                serde_json::json!({ "host": host, "port": port }),
            );
            changed = true;
        }
    }

    // icomWlan: { ip, port }
    if !radio.contains_key("icomWlan") {
        let ip = radio.get("ip").and_then(Value::as_str).map(str::to_string);
        let port = radio.get("wlanPort").and_then(Value::as_u64);
        if let (Some(ip), Some(port)) = (ip, port) {
            radio.insert(
                "icomWlan".into(),
                serde_json::json!({ "ip": ip, "port": port, "dataMode": true }),
            );
            changed = true;
        }
    }

    // serial: { path, rigModel }
    if !radio.contains_key("serial") {
        let path = radio.get("path").and_then(Value::as_str).map(str::to_string);
        if let Some(path) = path {
            let rig_model = radio
                .get("rigModel")
                .and_then(Value::as_str)
                .map(str::to_string);
            radio.insert(
                "serial".into(),
                serde_json::json!({ "path": path, "rigModel": rig_model }),
            );
            changed = true;
        }
    }

    if changed {
        for legacy in ["host", "port", "ip", "wlanPort", "path", "rigModel"] {
            radio.remove(legacy);
        }
    }
    changed
}
