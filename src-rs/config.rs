//! Run configuration: credentials, per-company entry templates, filter tab
//! stops and the layout constants of the target application. Several YAML
//! files are merged key by key, later files winning.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{AutomationError, Result};
use crate::surface::{Point, Rect};

pub const DEFAULT_FILES: [&str; 2] = ["config.yaml", "filters.yaml"];
const REQUIRED_KEYS: [&str; 4] = ["companies", "filterPositions", "user", "password"];

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub companies: BTreeMap<String, CompanyConfig>,
    /// Document type -> filter name -> tab stop in the filter window.
    #[serde(rename = "filterPositions")]
    pub filter_positions: BTreeMap<String, BTreeMap<String, u32>>,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompanyConfig {
    #[serde(default)]
    pub templates: BTreeMap<String, EntryTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryTemplate {
    #[serde(rename = "tipoXML", deserialize_with = "scalar_text")]
    pub document_type: String,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterValue>,
}

impl EntryTemplate {
    /// Explicit date override from the `firstDate`/`lastDate` filters.
    pub fn date_override(&self) -> Option<(String, String)> {
        let first = self.filters.get("firstDate")?.single()?;
        let last = self.filters.get("lastDate")?.single()?;
        Some((first.to_string(), last.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FilterValue {
    Empty,
    One(String),
    Many(Vec<String>),
}

impl FilterValue {
    pub fn single(&self) -> Option<&str> {
        match self {
            Self::One(value) if !value.trim().is_empty() => Some(value.trim()),
            _ => None,
        }
    }

    fn from_yaml(value: &Value) -> std::result::Result<Self, String> {
        match value {
            Value::Sequence(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(text) = yaml_scalar(item)? {
                        values.push(text);
                    }
                }
                Ok(Self::Many(values))
            }
            other => Ok(match yaml_scalar(other)? {
                Some(text) if !text.is_empty() => Self::One(text),
                _ => Self::Empty,
            }),
        }
    }
}

impl<'de> Deserialize<'de> for FilterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_yaml(&value).map_err(D::Error::custom)
    }
}

fn yaml_scalar(value: &Value) -> std::result::Result<Option<String>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text.clone())),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(flag) => Ok(Some(flag.to_string())),
        other => Err(format!("expected a scalar filter value, got {other:?}")),
    }
}

fn scalar_text<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    match yaml_scalar(&value).map_err(D::Error::custom)? {
        Some(text) => Ok(text),
        None => Err(D::Error::custom("tipoXML must not be empty")),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Full path of the executable; falls back to the installation directory
    /// read from the registry.
    pub executable: Option<PathBuf>,
    pub process_name: String,
    pub restart_wait_secs: u64,
    pub restart_retries: u32,
    pub login_wait_secs: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            executable: None,
            process_name: "contabilidad_i.exe".to_string(),
            restart_wait_secs: 15,
            restart_retries: 3,
            login_wait_secs: 80,
        }
    }
}

impl ApplicationConfig {
    pub fn restart_wait(&self) -> Duration {
        Duration::from_secs(self.restart_wait_secs)
    }

    pub fn login_wait(&self) -> Duration {
        Duration::from_secs(self.login_wait_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub data_dir: Option<PathBuf>,
    pub general_database: String,
    /// User whose companies are processed; defaults to the login user.
    pub company_user: Option<String>,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            general_database: "GeneralesSQL".to_string(),
            company_user: None,
            pool_size: 5,
            acquire_timeout_secs: 5,
        }
    }
}

/// Window titles, label offsets and screen coordinates of the target
/// application. Layout changes there are edits here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub main_title: String,
    pub login_title: String,
    pub catalog_title: String,
    pub posting_title: String,
    pub location_label: String,
    pub location_offset: usize,
    pub first_filter_stop: u32,
    /// Click that commits the filter, relative to the filter window.
    pub filter_commit_click: [i32; 2],
    pub association_color: [u8; 3],
    pub association_area: [i32; 4],
    pub color_tolerance: u8,
    pub color_attempts: u32,
    pub color_interval_ms: u64,
    pub template_dir: Option<PathBuf>,
    pub confidence: f32,
    pub scale_range: [f32; 2],
    pub scale_steps: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            main_title: "CONTPAQi® Contabilidad".to_string(),
            login_title: "Ingreso a CONTPAQi® Contabilidad".to_string(),
            catalog_title: "Catálogo de Empresas".to_string(),
            posting_title: "Contabilizar CFDI".to_string(),
            location_label: "Ubicación:".to_string(),
            location_offset: 1,
            first_filter_stop: 3,
            filter_commit_click: [500, 500],
            association_color: [69, 179, 157],
            association_area: [500, 300, 502, 302],
            color_tolerance: 5,
            color_attempts: 60,
            color_interval_ms: 500,
            template_dir: None,
            confidence: 0.8,
            scale_range: [0.8, 1.2],
            scale_steps: 10,
        }
    }
}

impl LayoutConfig {
    pub fn filter_commit_point(&self) -> Point {
        Point::new(self.filter_commit_click[0], self.filter_commit_click[1])
    }

    pub fn association_rect(&self) -> Rect {
        let [left, top, right, bottom] = self.association_area;
        Rect::new(left, top, right, bottom)
    }
}

impl RunConfig {
    /// Loads and merges `paths` in order. Every file must exist.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut merged = Mapping::new();
        for path in paths {
            let path = path.as_ref();
            let text = fs::read_to_string(path).map_err(|err| {
                AutomationError::Config(format!("cannot read {}: {err}", path.display()))
            })?;
            let value: Value = serde_yaml::from_str(&text).map_err(|err| {
                AutomationError::Config(format!("cannot parse {}: {err}", path.display()))
            })?;
            match value {
                Value::Mapping(mapping) => merged.extend(mapping),
                Value::Null => {}
                _ => {
                    return Err(AutomationError::Config(format!(
                        "{} must contain a mapping at the top level",
                        path.display()
                    )))
                }
            }
            log::debug!("[config] loaded {}", path.display());
        }
        Self::from_mapping(merged)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        match serde_yaml::from_str::<Value>(text) {
            Ok(Value::Mapping(mapping)) => Self::from_mapping(mapping),
            Ok(_) => Err(AutomationError::Config(
                "configuration must be a mapping".to_string(),
            )),
            Err(err) => Err(AutomationError::Config(err.to_string())),
        }
    }

    fn from_mapping(mapping: Mapping) -> Result<Self> {
        for key in REQUIRED_KEYS {
            if !mapping.contains_key(key) {
                return Err(AutomationError::Config(format!(
                    "missing configuration key: {key}"
                )));
            }
        }
        let config: RunConfig = serde_yaml::from_value(Value::Mapping(mapping))
            .map_err(|err| AutomationError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(AutomationError::Config("user must not be empty".to_string()));
        }
        let [min, max] = self.layout.scale_range;
        if !(min > 0.0 && min <= max) {
            return Err(AutomationError::Config(format!(
                "invalid scale range {min}..{max}"
            )));
        }
        for (company, settings) in &self.companies {
            for (code, template) in &settings.templates {
                if !self.filter_positions.contains_key(&template.document_type) {
                    log::warn!(
                        "[config] {company}/{code}: no filter positions for document type {}",
                        template.document_type
                    );
                }
            }
        }
        Ok(())
    }

    pub fn company(&self, name: &str) -> Option<&CompanyConfig> {
        self.companies.get(name)
    }

    pub fn template(&self, company: &str, code: &str) -> Option<&EntryTemplate> {
        self.companies.get(company)?.templates.get(code)
    }

    pub fn positions_for(&self, document_type: &str) -> Option<&BTreeMap<String, u32>> {
        self.filter_positions.get(document_type)
    }

    pub fn company_user(&self) -> &str {
        self.database.company_user.as_deref().unwrap_or(&self.user)
    }
}
