use crate::intake::{DetectionResponse, FailureResponse};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

/// Output handler for detection responses
pub struct OutputHandler {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Jsonl, // Default
        }
    }
}

impl OutputHandler {
    /// Create a new output handler
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let writer: Option<Box<dyn Write + Send>> = match (&format, file_path) {
            (OutputFormat::Console, _) => None,
            (_, Some(path)) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            (_, None) => None,
        };

        Ok(OutputHandler { format, writer })
    }

    /// Handler writing to an arbitrary sink
    pub fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputHandler {
            format,
            writer: Some(writer),
        }
    }

    /// Write the response for a scored attempt
    pub fn write_response(&mut self, response: &DetectionResponse) -> Result<(), Box<dyn std::error::Error>> {
        match &self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(response)?;
                self.write_output(&format!("{}\n", json))?;
            }
            OutputFormat::Jsonl => {
                let json = serde_json::to_string(response)?;
                self.write_output(&format!("{}\n", json))?;
            }
            OutputFormat::Console => {
                let verdict = if response.is_phishing { "PHISHING RISK" } else { "ok" };
                let reasons = if response.reasons.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", response.reasons.join("; "))
                };
                let output = format!(
                    "[{}] User: {}, IP: {}{}, Score: {}{}\n",
                    verdict,
                    response.user_id,
                    response.ip_address,
                    response
                        .country
                        .as_ref()
                        .map(|c| format!(" [{}]", c))
                        .unwrap_or_default(),
                    response.risk_score,
                    reasons
                );
                self.write_output(&output)?;
            }
        }
        Ok(())
    }

    /// Write the generic failure for an attempt that could not be processed
    pub fn write_failure(&mut self, failure: &FailureResponse) -> Result<(), Box<dyn std::error::Error>> {
        let output = match &self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(failure)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(failure)?),
            OutputFormat::Console => format!("[error {}] {}\n", failure.status, failure.error),
        };
        self.write_output(&output)
    }

    fn write_output(&mut self, data: &str) -> Result<(), Box<dyn std::error::Error>> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                print!("{}", data);
                std::io::stdout().flush()?;
            }
        }
        Ok(())
    }

    /// Flush any buffered output
    pub fn flush(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::RiskFactors;
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn response() -> DetectionResponse {
        DetectionResponse {
            message: "Login attempt recorded".to_string(),
            user_id: "alice".to_string(),
            ip_address: "203.0.113.7".to_string(),
            is_phishing: true,
            risk_score: 90,
            risk_factors: RiskFactors {
                high_login_freq: true,
                multiple_ips: true,
                ..Default::default()
            },
            reasons: vec!["High login frequency detected".to_string(), "Multiple IPs detected".to_string()],
            country: Some("Kenya".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!(OutputFormat::from_str("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("console"), OutputFormat::Console);
        assert_eq!(OutputFormat::from_str("xml"), OutputFormat::Jsonl);
    }

    #[test]
    fn test_jsonl_is_one_line_per_response() {
        let buf = SharedBuf::default();
        let mut handler = OutputHandler::with_writer(OutputFormat::Jsonl, Box::new(buf.clone()));

        handler.write_response(&response()).unwrap();
        handler.write_response(&response()).unwrap();

        let contents = buf.contents();
        assert_eq!(contents.lines().count(), 2);
        let parsed: DetectionResponse = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed, response());
    }

    #[test]
    fn test_console_line() {
        let buf = SharedBuf::default();
        let mut handler = OutputHandler::with_writer(OutputFormat::Console, Box::new(buf.clone()));

        handler.write_response(&response()).unwrap();
        handler
            .write_failure(&FailureResponse {
                error: "Invalid login attempt".to_string(),
                status: 400,
            })
            .unwrap();

        let contents = buf.contents();
        assert!(contents.starts_with("[PHISHING RISK] User: alice, IP: 203.0.113.7 [Kenya], Score: 90"));
        assert!(contents.contains("[error 400] Invalid login attempt"));
    }
}
