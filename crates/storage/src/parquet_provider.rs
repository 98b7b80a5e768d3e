use std::fs::File;
use std::path::PathBuf;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use ffr_common::{FfrError, KernelId, Result};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::file::reader::{FileReader, SerializedFileReader};

use crate::BatchProvider;

/// Parquet-backed provider where each handle is one file.
///
/// The schema and row estimate come from file metadata at construction time;
/// row data is only decoded when a handle is read.
pub struct ParquetBatchProvider {
    paths: Vec<PathBuf>,
    schema: SchemaRef,
    estimated_rows: u64,
}

impl ParquetBatchProvider {
    /// Create a provider over one or more parquet files.
    ///
    /// Fails when the path list is empty or the first file cannot be opened;
    /// remaining files are validated lazily when their handle is read.
    pub fn try_new(paths: Vec<PathBuf>) -> Result<Self> {
        let first = paths.first().ok_or_else(|| FfrError::Kernel {
            kernel_id: KernelId::HEAD,
            reason: "parquet provider needs at least one file".to_string(),
        })?;

        let file = File::open(first)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| provider_error(format!("parquet reader build failed: {e}")))?;
        let schema = builder.schema().clone();

        let mut estimated_rows = 0u64;
        for path in &paths {
            let file = File::open(path)?;
            let reader = SerializedFileReader::new(file)
                .map_err(|e| provider_error(format!("parquet metadata read failed: {e}")))?;
            estimated_rows += reader.metadata().file_metadata().num_rows().max(0) as u64;
        }

        Ok(Self {
            paths,
            schema,
            estimated_rows,
        })
    }
}

fn provider_error(reason: String) -> FfrError {
    FfrError::Kernel {
        kernel_id: KernelId::HEAD,
        reason,
    }
}

impl BatchProvider for ParquetBatchProvider {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn num_handles(&self) -> usize {
        self.paths.len()
    }

    fn read_handle(&self, handle: usize) -> Result<Vec<RecordBatch>> {
        let path = self.paths.get(handle).ok_or_else(|| {
            provider_error(format!("handle {handle} out of range"))
        })?;
        let file = File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| provider_error(format!("parquet reader build failed: {e}")))?
            .build()
            .map_err(|e| provider_error(format!("parquet reader open failed: {e}")))?;

        let mut out = Vec::new();
        for batch in reader {
            out.push(batch.map_err(|e| provider_error(format!("parquet decode failed: {e}")))?);
        }
        Ok(out)
    }

    fn estimated_rows(&self) -> Option<u64> {
        Some(self.estimated_rows)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;

    use super::*;

    fn unique_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}_{nanos}.parquet"))
    }

    #[test]
    fn reads_schema_rows_and_batches_per_file() {
        let path = unique_path("ffr_parquet_provider");
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![5_i64, 6, 7]))],
        )
        .expect("batch");

        let file = File::create(&path).expect("create parquet");
        let mut writer = ArrowWriter::try_new(file, schema.clone(), None).expect("writer");
        writer.write(&batch).expect("write");
        writer.close().expect("close");

        let provider = ParquetBatchProvider::try_new(vec![path.clone()]).expect("provider");
        assert_eq!(provider.num_handles(), 1);
        assert_eq!(provider.estimated_rows(), Some(3));
        assert_eq!(provider.schema().fields().len(), 1);

        let batches = provider.read_handle(0).expect("read");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].num_rows(), 3);

        let _ = std::fs::remove_file(path);
    }
}
