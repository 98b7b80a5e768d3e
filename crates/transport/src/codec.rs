//! Batch payload codec: arrow IPC stream bytes, chunked into frames.

use std::io::Cursor;

use arrow::record_batch::RecordBatch;
use ffr_common::{FfrError, NodeId, Result, TransportErrorKind, TransportStage};

/// Default upper bound on one data frame's payload size.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Encode one batch as arrow IPC stream bytes.
pub fn encode_batch(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, &batch.schema())
            .map_err(|e| encode_error(format!("ipc writer init failed: {e}")))?;
        writer
            .write(batch)
            .map_err(|e| encode_error(format!("ipc write failed: {e}")))?;
        writer
            .finish()
            .map_err(|e| encode_error(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

fn encode_error(reason: String) -> FfrError {
    FfrError::Kernel {
        kernel_id: ffr_common::KernelId::HEAD,
        reason,
    }
}

/// Decode IPC stream bytes back into batches, attributing corruption to `from`.
pub fn decode_batches(bytes: &[u8], from: NodeId) -> Result<Vec<RecordBatch>> {
    let cursor = Cursor::new(bytes.to_vec());
    let reader = arrow::ipc::reader::StreamReader::try_new(cursor, None).map_err(|_| {
        FfrError::Transport {
            node_id: from,
            stage: TransportStage::Frame,
            kind: TransportErrorKind::Corrupt,
        }
    })?;
    reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| FfrError::Transport {
            node_id: from,
            stage: TransportStage::Frame,
            kind: TransportErrorKind::Corrupt,
        })
}

/// Split payload bytes into frames of at most `max_frame_bytes`.
pub fn chunk_frames(bytes: &[u8], max_frame_bytes: usize) -> Vec<Vec<u8>> {
    let max = max_frame_bytes.max(1);
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + max).min(bytes.len());
        out.push(bytes[offset..end].to_vec());
        offset = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};

    use super::*;

    #[test]
    fn chunked_ipc_bytes_reassemble_to_the_same_batch() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from((0..100).collect::<Vec<i64>>()))],
        )
        .expect("batch");

        let bytes = encode_batch(&batch).expect("encode");
        let frames = chunk_frames(&bytes, 64);
        assert!(frames.len() > 1);

        let reassembled = frames.concat();
        let decoded = decode_batches(&reassembled, NodeId(0)).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], batch);
    }
}
