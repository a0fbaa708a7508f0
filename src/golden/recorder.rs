//! Durable and in-memory golden recorders.
//!
//! Both variants share the line format and signing code, so a record
//! captured in memory by a test compares byte-for-byte against one
//! written by the durable recorder.
//!
//! The durable recorder owns `{dir}/{run_id}.steps.jsonl` and its
//! `.sig` sibling. Appends go through `tokio::fs`; the signature is
//! written to a temp file and renamed into place, closing the window
//! where a reader could see a signature for bytes it does not match.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::Sha256;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::canonical;

use super::{GoldenError, GoldenEvent, GoldenRecorder, Result};

type HmacSha256 = Hmac<Sha256>;

/// Process-scoped HMAC secret. Debug output never reveals the bytes.
#[derive(Clone)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Load from the `REPLAYWEAVE_SIGNING_SECRET` environment variable.
    pub fn from_env() -> Option<Self> {
        dotenvy::dotenv().ok();
        std::env::var("REPLAYWEAVE_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.into_bytes()))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| GoldenError::Signing {
            message: e.to_string(),
        })
    }

    fn sign_bytes(&self, data: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify_bytes(&self, data: &[u8], signature_hex: &str) -> Result<bool> {
        let Ok(expected) = hex::decode(signature_hex.trim()) else {
            // A corrupted signature encoding is indistinguishable from
            // tampering.
            return Ok(false);
        };
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningSecret").finish_non_exhaustive()
    }
}

/// Canonical on-disk line for an event: the event fields plus a `ts`
/// timestamp, canonically encoded.
fn golden_line(event: &GoldenEvent) -> Result<String> {
    let mut value = serde_json::to_value(event)?;
    if let Value::Object(map) = &mut value {
        map.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
    }
    Ok(canonical::to_canonical_json(&value))
}

fn parse_lines(run_id: &str, content: &str) -> Result<Vec<Value>> {
    let mut events = Vec::new();
    for line in content.lines().filter(|l| !l.is_empty()) {
        let value: Value = serde_json::from_str(line).map_err(GoldenError::Serde)?;
        events.push(value);
    }
    if events.is_empty() {
        return Err(GoldenError::MissingRecord {
            run_id: run_id.to_string(),
        });
    }
    Ok(events)
}

/// Durable recorder writing JSONL files under a directory.
pub struct FileGoldenRecorder {
    dir: PathBuf,
    secret: SigningSecret,
    taps: Mutex<Vec<flume::Sender<(String, Value)>>>,
}

impl FileGoldenRecorder {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, secret: SigningSecret) -> Self {
        Self {
            dir: dir.into(),
            secret,
            taps: Mutex::new(Vec::new()),
        }
    }

    /// Path of a run's record file.
    #[must_use]
    pub fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.steps.jsonl"))
    }

    /// Path of a run's signature file.
    #[must_use]
    pub fn signature_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.steps.jsonl.sig"))
    }

    /// Subscribe a live observer to every appended event. Observers
    /// are best-effort: a dropped receiver is silently pruned.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<(String, Value)> {
        let (tx, rx) = flume::unbounded();
        self.lock_taps().push(tx);
        rx
    }

    fn lock_taps(&self) -> std::sync::MutexGuard<'_, Vec<flume::Sender<(String, Value)>>> {
        match self.taps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn forward_to_taps(&self, run_id: &str, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };
        let mut taps = self.lock_taps();
        taps.retain(|tx| tx.send((run_id.to_string(), value.clone())).is_ok());
    }

    async fn read_record(&self, run_id: &str) -> Result<Vec<u8>> {
        let path = self.record_path(run_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(GoldenError::MissingRecord {
                run_id: run_id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl GoldenRecorder for FileGoldenRecorder {
    #[instrument(skip(self, event), err)]
    async fn record(&self, run_id: &str, event: GoldenEvent) -> Result<()> {
        let line = golden_line(&event)?;
        fs::create_dir_all(&self.dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.record_path(run_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.forward_to_taps(run_id, &line);
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn sign(&self, run_id: &str) -> Result<String> {
        let data = self.read_record(run_id).await?;
        let signature = self.secret.sign_bytes(&data)?;
        let final_path = self.signature_path(run_id);
        let tmp_path = self.dir.join(format!("{run_id}.steps.jsonl.sig.tmp"));
        fs::write(&tmp_path, format!("{signature}\n")).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(signature)
    }

    #[instrument(skip(self), err)]
    async fn verify(&self, run_id: &str) -> Result<()> {
        let data = self.read_record(run_id).await?;
        let signature = match fs::read_to_string(self.signature_path(run_id)).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(GoldenError::MissingSignature {
                    run_id: run_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if self.secret.verify_bytes(&data, &signature)? {
            Ok(())
        } else {
            Err(GoldenError::Tamper {
                run_id: run_id.to_string(),
            })
        }
    }

    async fn events(&self, run_id: &str) -> Result<Vec<Value>> {
        let data = self.read_record(run_id).await?;
        let content = String::from_utf8_lossy(&data);
        parse_lines(run_id, &content)
    }
}

#[derive(Default)]
struct MemoryRun {
    lines: Vec<String>,
    signature: Option<String>,
}

/// In-memory recorder with identical semantics to the file variant.
#[derive(Default)]
pub struct MemoryGoldenRecorder {
    secret: Option<SigningSecret>,
    runs: Mutex<FxHashMap<String, MemoryRun>>,
}

impl MemoryGoldenRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_secret(secret: SigningSecret) -> Self {
        Self {
            secret: Some(secret),
            runs: Mutex::new(FxHashMap::default()),
        }
    }

    /// Raw lines of a run's record, for byte-level assertions.
    #[must_use]
    pub fn lines(&self, run_id: &str) -> Vec<String> {
        self.lock_runs()
            .get(run_id)
            .map(|r| r.lines.clone())
            .unwrap_or_default()
    }

    /// Corrupt a recorded line in place (test hook for tamper paths).
    pub fn tamper(&self, run_id: &str, line_index: usize) {
        let mut runs = self.lock_runs();
        if let Some(run) = runs.get_mut(run_id) {
            if let Some(line) = run.lines.get_mut(line_index) {
                line.push('x');
            }
        }
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, MemoryRun>> {
        match self.runs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record_bytes(run: &MemoryRun) -> Vec<u8> {
        let mut data = Vec::new();
        for line in &run.lines {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
        }
        data
    }

    fn secret(&self) -> Result<&SigningSecret> {
        self.secret.as_ref().ok_or_else(|| GoldenError::Signing {
            message: "recorder has no signing secret".to_string(),
        })
    }
}

#[async_trait]
impl GoldenRecorder for MemoryGoldenRecorder {
    async fn record(&self, run_id: &str, event: GoldenEvent) -> Result<()> {
        let line = golden_line(&event)?;
        let mut runs = self.lock_runs();
        runs.entry(run_id.to_string()).or_default().lines.push(line);
        Ok(())
    }

    async fn sign(&self, run_id: &str) -> Result<String> {
        let secret = self.secret()?;
        let mut runs = self.lock_runs();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| GoldenError::MissingRecord {
                run_id: run_id.to_string(),
            })?;
        let signature = secret.sign_bytes(&Self::record_bytes(run))?;
        run.signature = Some(signature.clone());
        Ok(signature)
    }

    async fn verify(&self, run_id: &str) -> Result<()> {
        let secret = self.secret()?;
        let runs = self.lock_runs();
        let run = runs.get(run_id).ok_or_else(|| GoldenError::MissingRecord {
            run_id: run_id.to_string(),
        })?;
        let signature = run
            .signature
            .as_ref()
            .ok_or_else(|| GoldenError::MissingSignature {
                run_id: run_id.to_string(),
            })?;
        if secret.verify_bytes(&Self::record_bytes(run), signature)? {
            Ok(())
        } else {
            Err(GoldenError::Tamper {
                run_id: run_id.to_string(),
            })
        }
    }

    async fn events(&self, run_id: &str) -> Result<Vec<Value>> {
        let runs = self.lock_runs();
        let run = runs.get(run_id).ok_or_else(|| GoldenError::MissingRecord {
            run_id: run_id.to_string(),
        })?;
        let joined = run.lines.join("\n");
        parse_lines(run_id, &joined)
    }
}

/// Directory-level helper: verify every signed record under `dir`.
///
/// Returns run ids that failed verification. Records without a
/// signature are skipped (the run may still be open).
pub async fn sweep_verify(dir: &Path, secret: &SigningSecret) -> Result<Vec<String>> {
    let mut failed = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(run_id) = name.strip_suffix(".steps.jsonl") else {
            continue;
        };
        let recorder = FileGoldenRecorder::new(dir, secret.clone());
        match recorder.verify(run_id).await {
            Ok(()) => {}
            Err(GoldenError::MissingSignature { .. }) => {}
            Err(GoldenError::Tamper { .. }) => failed.push(run_id.to_string()),
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}
