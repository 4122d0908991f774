//! Append-only domain log sinks.
//!
//! Three plain-text files, one line per event, format
//! `[YYYY-MM-DD HH:MM:SS] <LEVEL>: <free text>\n`. Distinct from the
//! `tracing` diagnostics in [`crate::main`], which go to stderr/journal.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

use crate::errors::AppResult;

/// Which of the three domain log files an RPC `get_logs` request wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Reenvios,
    Errores,
    Procesamiento,
}

impl LogType {
    pub fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("errores") => Self::Errores,
            Some("procesamiento") => Self::Procesamiento,
            _ => Self::Reenvios,
        }
    }
}

/// The three append-only domain log files, one directory, one mutex each.
pub struct LogSinks {
    reenvios_path: PathBuf,
    errores_path: PathBuf,
    procesamiento_path: PathBuf,
    reenvios: Mutex<File>,
    errores: Mutex<File>,
    procesamiento: Mutex<File>,
}

impl LogSinks {
    pub fn open(config_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(config_dir)?;
        let reenvios_path = config_dir.join("reenvios.log");
        let errores_path = config_dir.join("errores.log");
        let procesamiento_path = config_dir.join("procesamiento.log");
        Ok(Self {
            reenvios: Mutex::new(open_append(&reenvios_path)?),
            errores: Mutex::new(open_append(&errores_path)?),
            procesamiento: Mutex::new(open_append(&procesamiento_path)?),
            reenvios_path,
            errores_path,
            procesamiento_path,
        })
    }

    /// Record one successful forwarded delivery.
    pub fn log_forwarded(&self, subject: &str, rule_name: &str, recipient: &str) {
        let line = format!("Asunto: {subject} | Regla: {rule_name} | Destinatario: {recipient}");
        self.write(&self.reenvios, "INFO", &line);
    }

    /// Record an error. Never panics: a failure to write this sink is
    /// itself only worth a stderr line, never a crash.
    pub fn log_error(&self, message: &str) {
        self.write(&self.errores, "ERROR", message);
        tracing::error!("{message}");
    }

    /// Record a verbose trace line, gated by the caller on
    /// `Configuration::verbose_logging`.
    pub fn log_trace(&self, verbose: bool, message: &str) {
        if !verbose {
            return;
        }
        self.write(&self.procesamiento, "DEBUG", message);
    }

    fn write(&self, sink: &Mutex<File>, level: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{timestamp}] {level}: {message}\n");
        if let Ok(mut file) = sink.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }

    /// Return every line of the requested log file, oldest first.
    pub fn read_lines(&self, log_type: LogType) -> AppResult<Vec<String>> {
        let path = match log_type {
            LogType::Reenvios => &self.reenvios_path,
            LogType::Errores => &self.errores_path,
            LogType::Procesamiento => &self.procesamiento_path,
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(content.lines().map(str::to_owned).collect())
    }
}

fn open_append(path: &Path) -> AppResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn forwarded_line_has_expected_shape() {
        let dir = tempdir().unwrap();
        let sinks = LogSinks::open(dir.path()).unwrap();
        sinks.log_forwarded("Hello", "regla-1", "dest@example.com");

        let lines = sinks.read_lines(LogType::Reenvios).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("Asunto: Hello"));
        assert!(lines[0].contains("Regla: regla-1"));
        assert!(lines[0].contains("Destinatario: dest@example.com"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn trace_is_gated_by_verbose_flag() {
        let dir = tempdir().unwrap();
        let sinks = LogSinks::open(dir.path()).unwrap();
        sinks.log_trace(false, "should not appear");
        sinks.log_trace(true, "should appear");

        let lines = sinks.read_lines(LogType::Procesamiento).unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("should appear"));
    }

    #[test]
    fn missing_log_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let sinks = LogSinks::open(dir.path()).unwrap();
        assert!(sinks.read_lines(LogType::Errores).unwrap().is_empty());
    }

    #[test]
    fn log_type_from_wire_defaults_to_reenvios() {
        assert_eq!(LogType::from_wire(None), LogType::Reenvios);
        assert_eq!(LogType::from_wire(Some("bogus")), LogType::Reenvios);
        assert_eq!(LogType::from_wire(Some("errores")), LogType::Errores);
        assert_eq!(LogType::from_wire(Some("procesamiento")), LogType::Procesamiento);
    }
}
