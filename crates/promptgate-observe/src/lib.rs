use anyhow::Result;
use chrono::Utc;
use promptgate_core::{EventEnvelope, TelemetryConfig, runtime_dir};
use reqwest::blocking::Client;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Diagnostic sink for interception/edit/replay events: every record lands
/// in an append-only log file, and optionally in a telemetry endpoint.
pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(workspace: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        let telemetry = telemetry_sink(telemetry_cfg)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            telemetry,
        })
    }

    /// Record one service event. Interception resolutions and parity
    /// mismatches go through here; skipping any of them hides divergence
    /// bugs, so callers must record on every exit path.
    pub fn record_event(&self, event: &EventEnvelope) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))?;
        self.emit_telemetry(
            &format!("promptgate.{}", event.kind.name()),
            json!({
                "session_key": event.session_key.storage_key(),
                "seq_no": event.seq_no,
                "kind": event.kind,
            }),
        )
    }

    /// Log a warning: always written to the log file, and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[promptgate WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    fn emit_telemetry(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let Some(sink) = &self.telemetry else {
            return Ok(());
        };

        let body = json!({
            "name": name,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        });

        // Fire-and-forget: the POST runs on a detached thread so a slow
        // endpoint never blocks the editing/send path.
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .and_then(|mut f| writeln!(f, "{line}"));
            }
        });
        Ok(())
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}
