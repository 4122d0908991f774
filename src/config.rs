//! Configuration document: load, atomic save, and the account/rule model.
//!
//! Field names are the external wire contract (existing deployments depend
//! on the Spanish names) and must never be renamed; `#[serde(rename = "...")]`
//! bridges them to idiomatic Rust identifiers.

use std::fs;
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{AppError, AppResult};

/// `SecretString` deliberately has no `Serialize` impl (secrecy's whole
/// point is to make leaking a secret via an incidental `derive` a type
/// error). The config document's wire format stores credentials in the
/// clear, so this call site is the one place that's allowed to expose them.
fn serialize_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// A single forwarding rule: predicate plus destination list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "activa", default = "default_true")]
    pub active: bool,
    /// Substrings matched case-insensitively against the `From` header.
    /// Empty = match any sender.
    #[serde(rename = "remitentes", default)]
    pub senders: Vec<String>,
    /// Substrings matched case-insensitively against the `Subject` header.
    /// Empty = match any subject.
    #[serde(rename = "palabras_clave", default)]
    pub subject_keywords: Vec<String>,
    #[serde(rename = "destinatarios", default)]
    pub recipients: Vec<String>,
    #[serde(rename = "incluir_adjuntos", default)]
    pub include_attachments: bool,
}

/// A single IMAP+SMTP credential pair with its own rule list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "nombre")]
    pub name: String,
    #[serde(rename = "activa", default = "default_true")]
    pub active: bool,
    #[serde(rename = "imap_server")]
    pub imap_host: String,
    pub imap_user: String,
    #[serde(serialize_with = "serialize_secret")]
    pub imap_password: SecretString,
    #[serde(rename = "smtp_server")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_user: String,
    #[serde(serialize_with = "serialize_secret")]
    pub smtp_password: SecretString,
    #[serde(rename = "reglas", default)]
    pub rules: Vec<Rule>,
}

/// The singleton configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(rename = "cuentas", default)]
    pub accounts: Vec<Account>,
    #[serde(rename = "intervalo_revision", default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_true")]
    pub api_enabled: bool,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(rename = "logs_completos", default)]
    pub verbose_logging: bool,
}

fn default_true() -> bool {
    true
}

fn default_smtp_port() -> u16 {
    587
}

fn default_interval() -> u64 {
    60
}

fn default_api_port() -> u16 {
    5555
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            interval_seconds: default_interval(),
            api_enabled: true,
            api_port: default_api_port(),
            verbose_logging: false,
        }
    }
}

impl Configuration {
    /// Load the configuration document from `path`.
    ///
    /// If the file does not exist, a fresh default document is written and
    /// returned. If it exists but fails to parse, the error is logged by the
    /// caller and an empty default is returned in memory (the on-disk file
    /// is left untouched so the operator can inspect it).
    pub fn load_or_default(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&raw) {
            Ok(config) => Ok(config),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to parse configuration, falling back to empty default");
                Ok(Self::default())
            }
        }
    }

    /// Atomically rewrite the configuration document.
    ///
    /// Writes to a sibling temp file and renames over the target so readers
    /// never observe a partially written document.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        atomic_write_json(path, self)
    }

    pub fn get_account(&self, index: usize) -> AppResult<&Account> {
        self.accounts
            .get(index)
            .ok_or_else(|| AppError::NotFound(format!("no account at index {index}")))
    }
}

/// Serialize `value` as pretty JSON and atomically swap it into `path`.
///
/// Used by both the configuration document and the retry queue document so
/// neither ever observes a torn write.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let dir = path.parent().ok_or_else(|| {
        AppError::invalid(format!("path {} has no parent directory", path.display()))
    })?;
    fs::create_dir_all(dir)?;

    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document")
    ));
    let mut pretty = serde_json::to_vec_pretty(value)?;
    pretty.push(b'\n');
    fs::write(&tmp_path, pretty)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_or_default_creates_file_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Configuration::load_or_default(&path).unwrap();
        assert!(path.exists());
        assert!(config.accounts.is_empty());
        assert_eq!(config.interval_seconds, 60);
        assert_eq!(config.api_port, 5555);
    }

    #[test]
    fn parses_spanish_field_names() {
        let json = r#"{
            "cuentas": [{
                "nombre": "cuenta principal",
                "activa": true,
                "imap_server": "imap.example.com",
                "imap_user": "user@example.com",
                "imap_password": "secret",
                "smtp_server": "smtp.example.com",
                "smtp_port": 587,
                "smtp_user": "user@example.com",
                "smtp_password": "secret",
                "reglas": [{
                    "nombre": "facturas",
                    "activa": true,
                    "remitentes": ["@proveedor.com"],
                    "palabras_clave": ["factura"],
                    "destinatarios": ["contabilidad@example.com"],
                    "incluir_adjuntos": true
                }]
            }],
            "intervalo_revision": 120,
            "api_enabled": true,
            "api_port": 6000,
            "logs_completos": true
        }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].name, "cuenta principal");
        assert_eq!(config.accounts[0].rules[0].recipients, vec!["contabilidad@example.com"]);
        assert_eq!(config.interval_seconds, 120);
        assert!(config.verbose_logging);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let json = r#"{"cuentas":[]}"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.interval_seconds, 60);
        assert!(config.api_enabled);
        assert_eq!(config.api_port, 5555);
        assert!(!config.verbose_logging);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Configuration::default();
        config.interval_seconds = 45;
        config.save(&path).unwrap();

        let loaded = Configuration::load_or_default(&path).unwrap();
        assert_eq!(loaded.interval_seconds, 45);
    }

    #[test]
    fn invalid_json_falls_back_to_default_in_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, b"not json").unwrap();

        let config = Configuration::load_or_default(&path).unwrap();
        assert!(config.accounts.is_empty());
        // the broken file on disk is left alone, not overwritten
        assert_eq!(fs::read_to_string(&path).unwrap(), "not json");
    }
}
