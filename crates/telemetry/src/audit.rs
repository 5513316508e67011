//! Append-only JSON lines output.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Append payloads to a JSON lines file, one object per line.
///
/// # Arguments
/// * `path` - Output file; nothing is written when `None`
/// * `payloads` - Serializable records to append
pub fn append_jsonl<P: AsRef<Path>, T: Serialize>(
    path: Option<P>,
    payloads: &[T],
) -> anyhow::Result<()> {
    let Some(output_path) = path else {
        return Ok(());
    };
    if payloads.is_empty() {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&output_path)?;
    for payload in payloads {
        let json = serde_json::to_string(payload)?;
        writeln!(file, "{}", json)?;
    }
    debug!("Appended {} records to {:?}", payloads.len(), output_path.as_ref());
    Ok(())
}
