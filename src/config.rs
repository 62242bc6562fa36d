/*!
 * Configuration
 * Run settings from defaults, environment and command line
 */

use crate::core::errors::NestedMapError;
use crate::core::limits::{
    DEFAULT_INNER_KEY, DEFAULT_INNER_VALUE, DEFAULT_OBJECT_PATH, DEFAULT_OUTER_KEY, DEFAULT_OUTER_MAP_NAME,
    INNER_MAP_MAX_ENTRIES, TEMPLATE_MAX_ENTRIES,
};
use crate::core::types::NestedResult;
use crate::ebpf::BpfPlatform;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_OBJECT: &str = "NESTED_MAPS_OBJECT";
pub const ENV_OUTER_MAP: &str = "NESTED_MAPS_OUTER_MAP";
pub const ENV_BACKEND: &str = "NESTED_MAPS_BACKEND";
pub const ENV_SKIP_RLIMIT: &str = "NESTED_MAPS_SKIP_RLIMIT";
pub const ENV_REPORT_JSON: &str = "NESTED_MAPS_REPORT_JSON";

/// Everything a run needs to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Compiled extension object to open
    pub object_path: PathBuf,
    /// Name of the map-of-maps table inside the object
    pub outer_map: String,
    pub backend: BpfPlatform,
    /// Raise RLIMIT_MEMLOCK before creating maps
    pub raise_memlock: bool,
    /// Print the run report as JSON on success
    pub report_json: bool,
    pub outer_key: u32,
    pub inner_key: u32,
    pub inner_value: u32,
    pub inner_max_entries: u32,
    pub template_max_entries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from(DEFAULT_OBJECT_PATH),
            outer_map: DEFAULT_OUTER_MAP_NAME.to_string(),
            backend: BpfPlatform::default(),
            raise_memlock: true,
            report_json: false,
            outer_key: DEFAULT_OUTER_KEY,
            inner_key: DEFAULT_INNER_KEY,
            inner_value: DEFAULT_INNER_VALUE,
            inner_max_entries: INNER_MAP_MAX_ENTRIES,
            template_max_entries: TEMPLATE_MAX_ENTRIES,
        }
    }
}

fn parse_bool(name: &str, value: &str) -> NestedResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(NestedMapError::Config(format!("{name}: expected a boolean, got {other:?}"))),
    }
}

fn parse_backend(value: &str) -> NestedResult<BpfPlatform> {
    match value.trim().to_ascii_lowercase().as_str() {
        "linux" => Ok(BpfPlatform::Linux),
        "simulation" | "sim" => Ok(BpfPlatform::Simulation),
        other => Err(NestedMapError::Config(format!(
            "{ENV_BACKEND}: unknown backend {other:?} (expected linux or simulation)"
        ))),
    }
}

impl Config {
    /// Defaults overridden by `NESTED_MAPS_*` variables
    pub fn from_env() -> NestedResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(ENV_OBJECT) {
            config.object_path = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var(ENV_OUTER_MAP) {
            config.outer_map = name;
        }
        if let Ok(backend) = std::env::var(ENV_BACKEND) {
            config.backend = parse_backend(&backend)?;
        }
        if let Ok(skip) = std::env::var(ENV_SKIP_RLIMIT) {
            config.raise_memlock = !parse_bool(ENV_SKIP_RLIMIT, &skip)?;
        }
        if let Ok(json) = std::env::var(ENV_REPORT_JSON) {
            config.report_json = parse_bool(ENV_REPORT_JSON, &json)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Environment configuration with the first positional argument taken
    /// as the object path
    pub fn from_args<I>(args: I) -> NestedResult<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = Self::from_env()?;
        let mut args = args.into_iter().skip(1);
        if let Some(path) = args.next() {
            config.object_path = PathBuf::from(path);
        }
        if let Some(extra) = args.next() {
            return Err(NestedMapError::Config(format!("unexpected argument {extra:?}")));
        }
        Ok(config)
    }

    pub fn with_object_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.object_path = path.into();
        self
    }

    pub fn with_backend(mut self, backend: BpfPlatform) -> Self {
        self.backend = backend;
        self
    }

    pub fn validate(&self) -> NestedResult<()> {
        if self.outer_map.is_empty() {
            return Err(NestedMapError::Config("outer map name is empty".to_string()));
        }
        if self.inner_max_entries == 0 || self.template_max_entries == 0 {
            return Err(NestedMapError::Config("map capacities must be non-zero".to_string()));
        }
        Ok(())
    }
}
