//! Wire codec for the begin-transmission header.
//!
//! Little-endian layout:
//! `u32 meta_entries`, then per entry `u32 key_len, key, u32 val_len, val`;
//! `u32 num_columns`, per column `u16 type_id, u32 name_len, name,
//! u64 null_count, u64 length, u32 meta_len, meta`;
//! `u32 num_frames`, `u64[num_frames] frame_sizes`.

use std::collections::BTreeMap;

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use ffr_common::{FfrError, NodeId, Result, TransportErrorKind, TransportStage};

/// Numeric type id of a column descriptor.
///
/// Covers the column types the runtime moves between nodes; anything else is
/// tagged opaque and trusted to the frame payload codec.
fn type_id(data_type: &DataType) -> u16 {
    match data_type {
        DataType::Boolean => 1,
        DataType::Int32 => 2,
        DataType::Int64 => 3,
        DataType::Float32 => 4,
        DataType::Float64 => 5,
        DataType::Utf8 => 6,
        DataType::Date32 => 7,
        DataType::Timestamp(_, _) => 8,
        _ => u16::MAX,
    }
}

/// Serialized description of one transported column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Numeric column type id.
    pub type_id: u16,
    /// Column name.
    pub name: String,
    /// Null count of the column.
    pub null_count: u64,
    /// Row count of the column.
    pub length: u64,
    /// Opaque per-column metadata blob.
    pub metadata: Vec<u8>,
}

/// Begin-transmission header of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Ordered message metadata (routing keys, query token, partition info).
    pub metadata: BTreeMap<String, String>,
    /// Column descriptors of the transported batch; empty for control messages.
    pub columns: Vec<ColumnDescriptor>,
    /// Advertised byte size per data frame.
    pub frame_sizes: Vec<u64>,
}

impl MessageHeader {
    /// Build column descriptors from a batch about to be transported.
    pub fn describe_columns(batch: &RecordBatch) -> Vec<ColumnDescriptor> {
        batch
            .schema()
            .fields()
            .iter()
            .zip(batch.columns())
            .map(|(field, column)| ColumnDescriptor {
                type_id: type_id(field.data_type()),
                name: field.name().clone(),
                null_count: column.null_count() as u64,
                length: column.len() as u64,
                metadata: Vec::new(),
            })
            .collect()
    }

    /// Encode into the little-endian wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&(self.metadata.len() as u32).to_le_bytes());
        for (key, value) in &self.metadata {
            put_bytes(&mut out, key.as_bytes());
            put_bytes(&mut out, value.as_bytes());
        }
        out.extend_from_slice(&(self.columns.len() as u32).to_le_bytes());
        for column in &self.columns {
            out.extend_from_slice(&column.type_id.to_le_bytes());
            put_bytes(&mut out, column.name.as_bytes());
            out.extend_from_slice(&column.null_count.to_le_bytes());
            out.extend_from_slice(&column.length.to_le_bytes());
            put_bytes(&mut out, &column.metadata);
        }
        out.extend_from_slice(&(self.frame_sizes.len() as u32).to_le_bytes());
        for size in &self.frame_sizes {
            out.extend_from_slice(&size.to_le_bytes());
        }
        out
    }

    /// Decode from the wire layout, attributing corruption to `from`.
    pub fn decode(bytes: &[u8], from: NodeId) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0, from };

        let meta_entries = cursor.u32()?;
        let mut metadata = BTreeMap::new();
        for _ in 0..meta_entries {
            let key = cursor.string()?;
            let value = cursor.string()?;
            metadata.insert(key, value);
        }

        let num_columns = cursor.u32()?;
        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            columns.push(ColumnDescriptor {
                type_id: cursor.u16()?,
                name: cursor.string()?,
                null_count: cursor.u64()?,
                length: cursor.u64()?,
                metadata: cursor.bytes_field()?,
            });
        }

        let num_frames = cursor.u32()?;
        let mut frame_sizes = Vec::with_capacity(num_frames as usize);
        for _ in 0..num_frames {
            frame_sizes.push(cursor.u64()?);
        }

        if cursor.pos != bytes.len() {
            return Err(corrupt(from));
        }

        Ok(Self {
            metadata,
            columns,
            frame_sizes,
        })
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn corrupt(from: NodeId) -> FfrError {
    FfrError::Transport {
        node_id: from,
        stage: TransportStage::BeginTransmission,
        kind: TransportErrorKind::Corrupt,
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    from: NodeId,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(corrupt(self.from));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn bytes_field(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes_field()?;
        String::from_utf8(raw).map_err(|_| corrupt(self.from))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow_schema::{Field, Schema};

    use super::*;

    #[test]
    fn header_roundtrips_byte_for_byte() {
        let mut metadata = BTreeMap::new();
        metadata.insert("context_token".to_string(), "77".to_string());
        metadata.insert("route".to_string(), "partition_5".to_string());

        let schema = Arc::new(Schema::new(vec![Field::new(
            "k",
            arrow_schema::DataType::Int64,
            true,
        )]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from(vec![Some(1), None, Some(3)]))],
        )
        .expect("batch");

        let header = MessageHeader {
            metadata,
            columns: MessageHeader::describe_columns(&batch),
            frame_sizes: vec![1024, 77],
        };
        let encoded = header.encode();
        let decoded = MessageHeader::decode(&encoded, NodeId(1)).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(decoded.columns[0].null_count, 1);
        assert_eq!(decoded.columns[0].length, 3);
        assert_eq!(decoded.columns[0].type_id, 3);
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let header = MessageHeader {
            metadata: BTreeMap::new(),
            columns: Vec::new(),
            frame_sizes: vec![9],
        };
        let mut encoded = header.encode();
        encoded.truncate(encoded.len() - 1);
        let err = MessageHeader::decode(&encoded, NodeId(3)).unwrap_err();
        match err {
            FfrError::Transport { node_id, kind, .. } => {
                assert_eq!(node_id, NodeId(3));
                assert_eq!(kind, TransportErrorKind::Corrupt);
            }
            other => panic!("expected transport error, got {other}"),
        }
    }
}
