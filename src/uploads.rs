//! File uploads and connection checks for the connections pages.

use serde::Deserialize;
use std::io::Read;

/// Server reply to an upload. Failures carry `error`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Server reply to a connection test.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn message(&self) -> String {
        if self.success {
            "Connection successful!".to_string()
        } else {
            format!(
                "Connection failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

/// Parses `key=value` words into form fields. Words without `=` are
/// rejected so typos do not silently drop a field.
pub fn parse_form_fields(args: &[&str]) -> anyhow::Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("Expected key=value, got '{}'", arg))
        })
        .collect()
}

/// Wraps a reader and reports `(bytes_sent, total_bytes)` as it is drained.
pub struct ProgressReader<R, F> {
    inner: R,
    sent: u64,
    total: u64,
    on_progress: F,
}

impl<R: Read, F: FnMut(u64, u64)> ProgressReader<R, F> {
    pub fn new(inner: R, total: u64, on_progress: F) -> Self {
        Self {
            inner,
            sent: 0,
            total,
            on_progress,
        }
    }
}

impl<R: Read, F: FnMut(u64, u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sent += n as u64;
            (self.on_progress)(self.sent, self.total);
        }
        Ok(n)
    }
}

/// Percentage for a progress bar, 0 when the size is unknown.
pub fn percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((sent.min(total) * 100) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_reader_reports_bytes() {
        let data = vec![7u8; 10_000];
        let mut seen = Vec::new();
        {
            let mut reader = ProgressReader::new(data.as_slice(), 10_000, |sent, total| {
                seen.push((sent, total))
            });
            let mut sink = Vec::new();
            reader.read_to_end(&mut sink).unwrap();
            assert_eq!(sink.len(), 10_000);
        }
        assert_eq!(seen.last(), Some(&(10_000, 10_000)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(50, 200), 25);
        assert_eq!(percent(300, 200), 100);
    }

    #[test]
    fn test_parse_form_fields() {
        let fields = parse_form_fields(&["alias=reporting", "engine=django.db.backends.sqlite3"])
            .unwrap();
        assert_eq!(fields[0], ("alias".to_string(), "reporting".to_string()));
        assert!(parse_form_fields(&["oops"]).is_err());
    }

    #[test]
    fn test_validation_message() {
        let ok = ValidationResult {
            success: true,
            error: None,
        };
        assert_eq!(ok.message(), "Connection successful!");
        let bad: ValidationResult =
            serde_json::from_str(r#"{"success": false, "error": "bad host"}"#).unwrap();
        assert_eq!(bad.message(), "Connection failed: bad host");
    }
}
