//! Configuration loading and management
//!
//! Settings are layered: built-in defaults, then `TARS_*` environment
//! variables, then a JSON override file that is rewritten whenever a value is
//! changed at runtime through [`ConfigService::set`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "TARS_";
const OVERRIDE_FILE_NAME: &str = "config_override.json";

/// Which concrete audio implementation to build at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioBackend {
    /// Default host devices, unbounded playback queue
    #[default]
    Desktop,
    /// Named (ALSA) devices, bounded playback queue
    Embedded,
}

/// All runtime settings for both binaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Fallback log filter when `RUST_LOG` is unset
    pub log_level: String,
    pub audio: AudioSettings,
    pub server: ServerSettings,
    pub transport: TransportSettings,
    pub hotword: HotwordSettings,
    pub button: ButtonSettings,
    pub sounds: SoundSettings,
    pub conversation: ConversationSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            audio: AudioSettings::default(),
            server: ServerSettings::default(),
            transport: TransportSettings::default(),
            hotword: HotwordSettings::default(),
            button: ButtonSettings::default(),
            sounds: SoundSettings::default(),
            conversation: ConversationSettings::default(),
            llm: LlmSettings::default(),
            tts: TtsSettings::default(),
        }
    }
}

/// PCM format and device selection; must match on both sides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub backend: AudioBackend,
    pub sample_rate: u32,
    /// Samples per captured frame (1600 = 100ms at 16kHz)
    pub block_size: usize,
    /// Substring of the input device name (embedded backend)
    pub input_device: Option<String>,
    /// Substring of the output device name (embedded backend)
    pub output_device: Option<String>,
    /// Chunk capacity of the bounded playback queue (embedded backend)
    pub playback_queue_size: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            backend: AudioBackend::Desktop,
            sample_rate: 16_000,
            block_size: 1600,
            input_device: None,
            output_device: None,
            playback_queue_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host the client dials
    pub host: String,
    /// Address the server binds
    pub bind_host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port: 7456,
        }
    }
}

impl ServerSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub heartbeat_interval_secs: f64,
    pub backoff_base_secs: f64,
    pub backoff_max_secs: f64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30.0,
            backoff_base_secs: 1.0,
            backoff_max_secs: 60.0,
        }
    }
}

impl TransportSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotwordSettings {
    /// Classifier to load; `energy` is the built-in loudness gate
    pub model: String,
    /// Wake phrases the classifier scores
    pub phrases: Vec<String>,
    /// Confidence in [0, 1] at or above which a phrase counts as detected
    pub threshold: f32,
    /// Minimum spacing between two detections
    pub cooldown_seconds: f64,
    /// RMS level treated as full confidence by the energy gate
    pub energy_full_scale: f32,
    /// Log per-frame confidence
    pub debug_logging: bool,
}

impl Default for HotwordSettings {
    fn default() -> Self {
        Self {
            model: "energy".to_string(),
            phrases: vec!["Hey-Tars".to_string(), "Tars".to_string()],
            threshold: 0.2,
            cooldown_seconds: 2.0,
            energy_full_scale: 0.3,
            debug_logging: false,
        }
    }
}

impl HotwordSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonSettings {
    pub enabled: bool,
    pub gpio_pin: u32,
    pub debounce_seconds: f64,
    pub polling_interval_ms: u64,
}

impl Default for ButtonSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            gpio_pin: 5,
            debounce_seconds: 1.0,
            polling_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundSettings {
    pub directory: PathBuf,
    /// Raw PCM files played on activation
    pub acknowledgements: Vec<String>,
}

impl Default for SoundSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("resources/acknowledgements"),
            acknowledgements: vec!["huh.raw".to_string(), "yes.raw".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    pub timeout_seconds: u64,
    /// Token the transcriber inserts for non-speech, stripped before matching
    pub noise_marker: String,
    pub end_phrases: Vec<String>,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        let end_phrases = [
            // Czech
            "díky", "děkuji", "děkuju", "to je všechno", "to je všechno díky", "na shledanou",
            "měj se", "díky moc", "díky ti", "díky tars", "to je vše", "končím", "konec",
            "sbohem", "měj se hezky", "měj se fajn", "čau", "čauky", "nazdar", "zatím", "pa",
            "papa",
            // English
            "thank you", "thanks", "okay thanks", "okay bye", "okay goodbye", "bye", "goodbye",
            "we're done here", "we are done here", "that'll be all", "that will be all",
            "stand down", "end of transmission", "see you", "see ya", "later",
            "talk to you later", "end session", "end conversation", "disconnect", "terminate",
            "stop listening", "stop", "that's all", "that's it", "done", "finished", "enough",
            "no more", "exit", "close", "abort", "over and out",
        ];

        Self {
            timeout_seconds: 30,
            noise_marker: "<noise>".to_string(),
            end_phrases: end_phrases.iter().map(|p| (*p).to_string()).collect(),
        }
    }
}

impl ConversationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub system_prompt: String,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gemini-live-2.5-flash-preview".to_string(),
            system_prompt: "You are TARS from Interstellar. Stay in character: deadpan, \
                            dry humour at 90%, honesty at 90%. Keep answers brief and precise. \
                            Address the user as Cooper."
                .to_string(),
            vad_prefix_padding_ms: 40,
            vad_silence_duration_ms: 800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
    pub stability: f32,
    pub similarity_boost: f32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice_id: "zsUvyVKkEvpw5ZMnMU2I".to_string(),
            model_id: "eleven_flash_v2_5".to_string(),
            output_format: "pcm_16000".to_string(),
            stability: 0.75,
            similarity_boost: 0.75,
        }
    }
}

/// Explicit configuration handle passed to every component that needs it
#[derive(Debug, Clone)]
pub struct ConfigService {
    /// Defaults with environment overrides applied
    base: Value,
    /// Contents of the override file
    overrides: Value,
    override_path: Option<PathBuf>,
    settings: Settings,
}

impl ConfigService {
    /// Load configuration from defaults, environment and the override file
    pub fn load() -> Result<Self, ConfigError> {
        let override_path = match std::env::var("TARS_CONFIG_FILE") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => data_dir().map(|dir| dir.join(OVERRIDE_FILE_NAME)),
        };

        Self::from_sources(|name| std::env::var(name).ok(), override_path)
    }

    /// Build from an explicit environment lookup and override path
    pub fn from_sources(
        env: impl Fn(&str) -> Option<String>,
        override_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let mut base = serde_json::to_value(Settings::default())?;
        apply_env(&mut base, &env);

        let overrides = match &override_path {
            Some(path) if path.exists() => read_overrides(path)?,
            _ => Value::Object(Map::new()),
        };

        let settings = resolve(&base, &overrides)?;
        debug!(?override_path, "configuration resolved");

        Ok(Self {
            base,
            overrides,
            override_path,
            settings,
        })
    }

    /// Typed view of the current settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Current value at a dotted key such as `hotword.threshold`
    pub fn get(&self, key: &str) -> Option<Value> {
        let merged = serde_json::to_value(&self.settings).ok()?;
        lookup(&merged, key).cloned()
    }

    /// Change a value at runtime and persist it to the override file
    ///
    /// The new document is validated before anything is committed; on error
    /// neither memory nor disk changes.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), ConfigError> {
        if lookup(&self.base, key).is_none() {
            return Err(ConfigError::UnknownKey(key.to_string()));
        }

        let mut overrides = self.overrides.clone();
        insert(&mut overrides, key, value);

        let settings = resolve(&self.base, &overrides).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let previous = std::mem::replace(&mut self.overrides, overrides);
        if let Err(e) = self.persist() {
            self.overrides = previous;
            return Err(e);
        }

        self.settings = settings;
        info!(key, "configuration value updated");
        Ok(())
    }

    /// Write the override layer to disk
    pub fn persist(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.override_path else {
            warn!("no override file configured, change kept in memory only");
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let body = serde_json::to_string_pretty(&self.overrides)?;
        std::fs::write(path, body).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn override_path(&self) -> Option<&Path> {
        self.override_path.as_deref()
    }
}

/// Directory for runtime data (`$HOME/.local/share/tars`, or `TARS_DATA_DIR`)
pub fn data_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("TARS_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }

    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".local").join("share").join("tars"))
}

/// Read a required credential from the environment
pub fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn read_overrides(path: &Path) -> Result<Value, ConfigError> {
    let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_json::from_str(&body)?;
    info!(path = %path.display(), "loaded configuration overrides");
    Ok(value)
}

fn resolve(base: &Value, overrides: &Value) -> Result<Settings, ConfigError> {
    let mut merged = base.clone();
    merge(&mut merged, overrides);
    Ok(serde_json::from_value(merged)?)
}

/// Replace every leaf that has a matching `TARS_*` variable
fn apply_env(value: &mut Value, env: &impl Fn(&str) -> Option<String>) {
    fn walk(value: &mut Value, path: &mut Vec<String>, env: &impl Fn(&str) -> Option<String>) {
        if let Value::Object(map) = value {
            for (key, child) in map.iter_mut() {
                path.push(key.clone());
                walk(child, path, env);
                path.pop();
            }
            return;
        }

        let name = format!("{ENV_PREFIX}{}", path.join("_").to_uppercase());
        if let Some(raw) = env(&name) {
            debug!(name, "environment override");
            *value = parse_env_value(value, &raw);
        }
    }

    walk(value, &mut Vec::new(), env);
}

/// Interpret a raw environment string against the type of the default it replaces
fn parse_env_value(current: &Value, raw: &str) -> Value {
    match current {
        Value::String(_) => Value::String(raw.to_string()),
        Value::Array(_) if !raw.trim_start().starts_with('[') => Value::Array(
            raw.split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        ),
        _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

fn merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(value, |node, part| node.get(part))
}

fn insert(value: &mut Value, key: &str, leaf: Value) {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let Value::Object(map) = value else { return };

    match key.split_once('.') {
        None => {
            map.insert(key.to_string(), leaf);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            insert(child, rest, leaf);
        }
    }
}
