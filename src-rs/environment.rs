//! Installation facts about the target application, read once from the
//! registry at startup and passed to whoever needs them.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::bridge::{query_helper, QueryDiagnostic};
use crate::clock::SystemClock;
use crate::error::{AutomationError, Result};
use crate::primitives::RetryPolicy;

pub const PRODUCT_KEY: &str =
    r"HKEY_LOCAL_MACHINE\SOFTWARE\WOW6432Node\Computación en Acción, SA CV\CONTPAQ i";
pub const LICENSE_KEY: &str =
    r"HKEY_LOCAL_MACHINE\SOFTWARE\WOW6432Node\Computación en Acción, SA CV\AppKey\Contpaq_i\Temp";
pub const SERVER_KEY: &str = concat!(
    r"HKEY_LOCAL_MACHINE\SOFTWARE\WOW6432Node\Computación en Acción, SA CV",
    r"\CONTPAQ I Servidor de Aplicaciones"
);

const REG_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentInfo {
    pub version: Option<String>,
    pub installation_type: Option<String>,
    pub base_directory: Option<PathBuf>,
    pub data_directory: Option<PathBuf>,
    pub license_serial: Option<String>,
    pub site_code: Option<String>,
    pub components_version: Option<String>,
}

impl EnvironmentInfo {
    /// Builds the info from the value pairs of the three registry keys. Value
    /// names carry suffixes, so they are matched by prefix.
    pub fn from_values(
        product: &[(String, String)],
        license: &[(String, String)],
        server: &[(String, String)],
    ) -> Self {
        let mut info = Self::default();
        for (name, value) in product {
            if name.starts_with("DIRECTORIOBASE") {
                info.base_directory = Some(PathBuf::from(value));
            } else if name.starts_with("TIPOINSTALACION") {
                info.installation_type = Some(value.clone());
            } else if name.starts_with("VERSION") {
                info.version = Some(value.clone());
            }
        }
        for (name, value) in license {
            if name.starts_with("Serial-") {
                info.license_serial = Some(value.clone());
            } else if name.starts_with("SiteCode-") {
                info.site_code = Some(value.clone());
            }
        }
        for (name, value) in server {
            if name.starts_with("VERSION") {
                info.components_version = Some(value.clone());
            } else if name.starts_with("DIRECTORIODATOS") {
                info.data_directory = Some(PathBuf::from(value));
            }
        }
        info
    }

    /// Reads the keys through `reg query`. A missing key leaves its fields
    /// empty; only a host without `reg` is an error.
    pub fn query() -> Result<Self> {
        let product = read_key(PRODUCT_KEY)?;
        let license = read_key(LICENSE_KEY)?;
        let server = read_key(SERVER_KEY)?;
        let info = Self::from_values(&product, &license, &server);
        log::debug!("[environment] {info:?}");
        Ok(info)
    }

    pub fn executable(&self, process_name: &str) -> Option<PathBuf> {
        self.base_directory
            .as_ref()
            .map(|base| base.join(process_name))
    }
}

fn read_key(key: &str) -> Result<Vec<(String, String)>> {
    let args = ["query".to_string(), key.to_string()];
    let policy = RetryPolicy::new(2, Duration::from_millis(100), 1.0);
    let (stdout, diag) = query_helper(&SystemClock, policy, "reg", &args, REG_TIMEOUT);
    match stdout {
        Some(raw) => Ok(parse_reg_query(&raw)),
        None if is_missing_key(&diag) => {
            log::warn!("[environment] registry key not found: {key}");
            Ok(Vec::new())
        }
        None => Err(AutomationError::Environment(format!(
            "cannot read registry key {key}: {}",
            diag.message.unwrap_or_default()
        ))),
    }
}

fn is_missing_key(diag: &QueryDiagnostic) -> bool {
    diag.error_code.as_deref() == Some("helper_exit_1")
}

/// Parses `reg query` output: indented `NAME    REG_TYPE    VALUE` lines.
pub fn parse_reg_query(raw: &str) -> Vec<(String, String)> {
    let mut values = Vec::new();
    for line in raw.lines() {
        if !line.starts_with(' ') {
            continue;
        }
        let Some(type_at) = line.find("REG_") else {
            continue;
        };
        let name = line[..type_at].trim();
        let rest = &line[type_at..];
        let value = rest
            .find(char::is_whitespace)
            .map(|end| rest[end..].trim())
            .unwrap_or("");
        if !name.is_empty() {
            values.push((name.to_string(), value.to_string()));
        }
    }
    values
}
