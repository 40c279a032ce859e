//! Append-only audit log of startup attempts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

#[derive(Serialize)]
struct AuditRecord<'a, T> {
    recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: &'a T,
}

/// Append `payload` as one timestamped JSON line to the audit file.
///
/// Does nothing when `path` is `None`.
pub fn append_audit_record<P: AsRef<Path>, T: Serialize>(
    path: Option<P>,
    payload: &T,
) -> anyhow::Result<()> {
    if let Some(audit_path) = path {
        let record = AuditRecord {
            recorded_at: Utc::now(),
            payload,
        };
        let json = serde_json::to_string(&record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)?;
        writeln!(file, "{}", json)?;
        info!("Wrote startup audit record to {:?}", audit_path.as_ref());
    }
    Ok(())
}
