//! Process-level settings and the immutable per-run configuration.
//!
//! [`QcSettings`] carries the knobs that are normally fixed per deployment
//! (policy version, sidecar naming, tracker endpoint). [`RunConfig`] layers
//! the per-invocation choices on top and is shared read-only with every
//! worker task.

use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use crate::mutation::MutationConfig;
use crate::sidecar::QcResult;

pub const DEFAULT_POLICY_VERSION: &str = "2025.11.0";
pub const DEFAULT_SCHEMA_NAME: &str = "eikon.qc.sidecar";
pub const DEFAULT_SIDECAR_FILE_SUFFIX: &str = ".qc.json";
pub const DEFAULT_SEQUENCE_SIDECAR_NAME: &str = "qc.sequence.json";
pub const DEFAULT_HASH_CACHE_NAME: &str = ".qc.hashcache.json";
pub const DEFAULT_XATTR_KEY: &str = "user.eikon.qc";
pub const DEFAULT_TRACKER_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_MIN_SEQUENCE_LEN: usize = 3;

/// Tool identity written into every sidecar.
pub fn default_tool_version() -> String {
    format!("eikon-qc-marker/{}", env!("CARGO_PKG_VERSION"))
}

/// Source that produced the settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum QcSettingsSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
}

/// Deployment-level settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcSettings {
    /// Re-QC policy revision. Bumping it invalidates every stored verdict.
    pub policy_version: String,
    /// Value stamped into `schema_name` of every sidecar.
    pub schema_name: String,
    pub tool_version: String,
    /// Suffix appended to a media file name to form its sidecar name.
    pub sidecar_file_suffix: String,
    /// File name of the per-directory sequence sidecar.
    pub sequence_sidecar_name: String,
    pub hash_cache_name: String,
    pub xattr_key: String,
    pub tracker: TrackerSettings,
}

impl Default for QcSettings {
    fn default() -> Self {
        Self {
            policy_version: DEFAULT_POLICY_VERSION.to_string(),
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            tool_version: default_tool_version(),
            sidecar_file_suffix: DEFAULT_SIDECAR_FILE_SUFFIX.to_string(),
            sequence_sidecar_name: DEFAULT_SEQUENCE_SIDECAR_NAME.to_string(),
            hash_cache_name: DEFAULT_HASH_CACHE_NAME.to_string(),
            xattr_key: DEFAULT_XATTR_KEY.to_string(),
            tracker: TrackerSettings::default(),
        }
    }
}

impl QcSettings {
    /// Load settings using environment variables.
    /// Evaluation order:
    /// 1) `$QC_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$QC_CONFIG_JSON` (inline JSON),
    /// 3) defaults if neither is set,
    ///
    /// followed by the individual `QC_*` / `TRAK_*` overrides.
    pub fn load_from_env() -> anyhow::Result<(Self, QcSettingsSource)> {
        let (mut settings, source) = if let Ok(path_str) = env::var("QC_CONFIG_PATH")
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let settings = Self::load_from_file(&path)?;
            (settings, QcSettingsSource::EnvPath(path))
        } else if let Ok(raw) = env::var("QC_CONFIG_JSON")
            && !raw.trim().is_empty()
        {
            let parsed = Self::parse_json(&raw).context("failed to parse QC_CONFIG_JSON")?;
            (parsed, QcSettingsSource::EnvInline)
        } else {
            (Self::default(), QcSettingsSource::Default)
        };

        settings.apply_env_overrides()?;
        Ok((settings, source))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read QC settings from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid QC settings {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid QC settings {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        // Try TOML first, then JSON for convenience.
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse QC settings {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid QC settings json: {err}"))
    }

    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        let string_overrides: [(&str, &mut String); 6] = [
            ("QC_POLICY_VERSION", &mut self.policy_version),
            ("QC_SCHEMA_NAME", &mut self.schema_name),
            ("QC_SIDE_SUFFIX_FILE", &mut self.sidecar_file_suffix),
            ("QC_SIDE_NAME_SEQUENCE", &mut self.sequence_sidecar_name),
            ("QC_HASHCACHE_NAME", &mut self.hash_cache_name),
            ("QC_XATTR_KEY", &mut self.xattr_key),
        ];
        for (name, slot) in string_overrides {
            if let Some(value) = non_empty_var(name) {
                *slot = value;
            }
        }

        if let Some(url) = non_empty_var("TRAK_BASE_URL") {
            self.tracker.base_url = Some(url);
        }
        if let Some(key) = non_empty_var("TRAK_ASSET_TRACKER_API_KEY") {
            self.tracker.api_key = Some(key);
        }
        if let Some(raw) = non_empty_var("TRAK_TIMEOUT_SECS") {
            self.tracker.timeout_secs = raw
                .parse()
                .with_context(|| format!("TRAK_TIMEOUT_SECS must be an integer, got {raw:?}"))?;
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Asset tracker endpoint. No base URL means the tracker is disabled.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: DEFAULT_TRACKER_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for TrackerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Where sidecars are stored relative to the asset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarMode {
    /// `clip.mxf.qc.json` next to the asset.
    Inline,
    /// `.clip.mxf.qc.json` next to the asset.
    Dot,
    /// `.qc/clip.mxf.qc.json` under the asset's directory.
    #[default]
    Subdir,
}

impl SidecarMode {
    /// Whether written sidecars should also get the platform hidden flag.
    pub fn hides_sidecars(self) -> bool {
        matches!(self, SidecarMode::Dot | SidecarMode::Subdir)
    }
}

impl fmt::Display for SidecarMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarMode::Inline => write!(f, "inline"),
            SidecarMode::Dot => write!(f, "dot"),
            SidecarMode::Subdir => write!(f, "subdir"),
        }
    }
}

impl FromStr for SidecarMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(SidecarMode::Inline),
            "dot" => Ok(SidecarMode::Dot),
            "subdir" => Ok(SidecarMode::Subdir),
            other => Err(format!("unknown sidecar mode '{other}'")),
        }
    }
}

/// Immutable configuration for one crawl invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub settings: QcSettings,
    pub sidecar_mode: SidecarMode,
    pub operator: String,
    /// Operator verdict. `None` means an automated run that only flags.
    pub forced_result: Option<QcResult>,
    pub note: Option<String>,
    /// Sequence mutation thresholds; `None` disables mutation detection.
    pub mutation: Option<MutationConfig>,
    /// Log changed/added/removed frame spans for sequences.
    pub show_mutation_diff: bool,
    pub workers: usize,
    pub min_sequence_len: usize,
}

impl RunConfig {
    pub fn new(settings: QcSettings, operator: impl Into<String>) -> Self {
        Self {
            settings,
            sidecar_mode: SidecarMode::default(),
            operator: operator.into(),
            forced_result: None,
            note: None,
            mutation: None,
            show_mutation_diff: false,
            workers: default_workers(),
            min_sequence_len: DEFAULT_MIN_SEQUENCE_LEN,
        }
    }

    pub fn operator_forced(&self) -> bool {
        self.forced_result.is_some()
    }
}

/// Worker pool size: available parallelism, never fewer than four.
pub fn default_workers() -> usize {
    num_cpus::get().max(4)
}

/// Operator name from `$USER` / `$USERNAME`, falling back to `system`.
pub fn default_operator() -> String {
    non_empty_var("USER")
        .or_else(|| non_empty_var("USERNAME"))
        .unwrap_or_else(|| "system".to_string())
}
