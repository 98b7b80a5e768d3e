//! Versioned spill files: manifest header plus an arrow IPC columnar dump.
//!
//! Layout: `FFRS` magic, `u32` version, `u32` manifest length, JSON manifest
//! (`rows`, `bytes`, `batches`), then the IPC stream bytes. One file per
//! spilled cache slot; the puller re-materializes transparently.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::record_batch::RecordBatch;
use ffr_common::{ContextToken, FfrError, ResourceKind, Result, global_metrics};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SPILL_MAGIC: &[u8; 4] = b"FFRS";
const SPILL_VERSION: u32 = 1;
const SPILL_HEADER_LEN: usize = 12;

static SPILL_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct SpillManifest {
    rows: u64,
    bytes: u64,
    batches: u64,
}

/// Handle to one spilled cache slot.
#[derive(Debug, Clone)]
pub struct SpilledSlot {
    /// Spill file location.
    pub path: PathBuf,
    /// Row count of the dumped slot.
    pub rows: u64,
    /// In-memory byte size the slot had before spilling.
    pub mem_bytes: u64,
}

/// Dump batches to a new spill file under `dir`.
pub fn write_spill(
    dir: &Path,
    token: ContextToken,
    batches: &[RecordBatch],
    mem_bytes: u64,
) -> Result<SpilledSlot> {
    let schema = batches.first().map(|b| b.schema()).ok_or_else(|| {
        FfrError::ResourceExhausted {
            kind: ResourceKind::Disk,
            detail: "cannot spill an empty slot".to_string(),
        }
    })?;

    fs::create_dir_all(dir)?;
    let seq = SPILL_SEQUENCE.fetch_add(1, Ordering::AcqRel);
    let path = dir.join(format!("ffr_spill_{token}_{seq}.ffrs"));

    let mut ipc = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut ipc, schema.as_ref())
            .map_err(|e| spill_error(format!("ipc writer init failed: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| spill_error(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| spill_error(format!("ipc finish failed: {e}")))?;
    }

    let rows = batches.iter().map(|b| b.num_rows() as u64).sum();
    let manifest = SpillManifest {
        rows,
        bytes: mem_bytes,
        batches: batches.len() as u64,
    };
    let manifest_bytes = serde_json::to_vec(&manifest)
        .map_err(|e| spill_error(format!("manifest encode failed: {e}")))?;

    let mut out = Vec::with_capacity(SPILL_HEADER_LEN + manifest_bytes.len() + ipc.len());
    out.extend_from_slice(SPILL_MAGIC);
    out.extend_from_slice(&SPILL_VERSION.to_le_bytes());
    out.extend_from_slice(&(manifest_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&manifest_bytes);
    out.extend_from_slice(&ipc);
    fs::write(&path, out)?;

    global_metrics().add_spill_bytes(&token.to_string(), mem_bytes);
    debug!(query_id = token.0, path = %path.display(), rows, "spilled cache slot");

    Ok(SpilledSlot {
        path,
        rows,
        mem_bytes,
    })
}

/// Re-materialize a spill file written by [`write_spill`].
pub fn read_spill(path: &Path) -> Result<Vec<RecordBatch>> {
    let bytes = fs::read(path)?;
    if bytes.len() < SPILL_HEADER_LEN || &bytes[0..4] != SPILL_MAGIC {
        return Err(spill_error(format!(
            "invalid spill file header: {}",
            path.display()
        )));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != SPILL_VERSION {
        return Err(spill_error(format!("unsupported spill version {version}")));
    }
    let manifest_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if bytes.len() < SPILL_HEADER_LEN + manifest_len {
        return Err(spill_error("spill manifest length is invalid".to_string()));
    }
    let manifest: SpillManifest =
        serde_json::from_slice(&bytes[SPILL_HEADER_LEN..SPILL_HEADER_LEN + manifest_len])
            .map_err(|e| spill_error(format!("manifest decode failed: {e}")))?;

    let ipc = &bytes[SPILL_HEADER_LEN + manifest_len..];
    let reader = arrow::ipc::reader::StreamReader::try_new(Cursor::new(ipc.to_vec()), None)
        .map_err(|e| spill_error(format!("ipc reader init failed: {e}")))?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| spill_error(format!("ipc read failed: {e}")))?;

    let rows: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
    if rows != manifest.rows {
        return Err(spill_error(format!(
            "spill row count mismatch: manifest {} vs dump {rows}",
            manifest.rows
        )));
    }

    let _ = fs::remove_file(path);
    Ok(batches)
}

fn spill_error(detail: String) -> FfrError {
    FfrError::ResourceExhausted {
        kind: ResourceKind::Disk,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    fn temp_spill_dir() -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("ffr_spill_test_{nanos}"))
    }

    #[test]
    fn spill_roundtrip_preserves_batches_and_removes_file() {
        let dir = temp_spill_dir();
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![3_i64, 1, 4, 1, 5]))],
        )
        .expect("batch");

        let slot = write_spill(&dir, ContextToken(11), &[batch.clone()], 4096).expect("write");
        assert_eq!(slot.rows, 5);
        assert!(slot.path.exists());

        let restored = read_spill(&slot.path).expect("read");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0], batch);
        assert!(!slot.path.exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn rejects_corrupt_spill_header() {
        let dir = temp_spill_dir();
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("bogus.ffrs");
        fs::write(&path, b"not a spill file").expect("write");
        assert!(read_spill(&path).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
