use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use object_store::{path::Path as ObjectPath, ObjectStore, WriteMultipart};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::DataAccessError;

/// Thin wrapper over the bucket used for dataset objects: multipart
/// streaming uploads plus deletes.
pub struct DatasetStorage {
    store: Arc<dyn ObjectStore>,
    bucket_url: Url,
    part_size: usize,
    concurrency: usize,
}

impl DatasetStorage {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket_url: Url,
        part_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            bucket_url,
            part_size,
            concurrency: concurrency.max(1),
        }
    }

    /// Full `s3://bucket/key` URL for an object key.
    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.bucket_url, key)
    }

    /// Pipes a byte stream into a multipart upload with up to
    /// `concurrency` parts in flight. The source is only pulled while a
    /// part slot is free, so a slow bucket pauses the source instead of
    /// growing a buffer. A failure on either side aborts the upload and
    /// drops the source.
    pub async fn upload_stream(
        &self,
        key: &str,
        mut source: BoxStream<'_, Result<Bytes, DataAccessError>>,
    ) -> Result<u64, DataAccessError> {
        info!(
            key,
            part_size = self.part_size,
            concurrency = self.concurrency,
            "Starting multipart upload"
        );
        let path = ObjectPath::from(key);

        let multipart = self.store.put_multipart(&path).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(multipart, self.part_size);
        let mut total_bytes = 0u64;

        let upload = async {
            while let Some(chunk) = source.next().await {
                let chunk = chunk?;
                writer.wait_for_capacity(self.concurrency).await?;
                total_bytes += chunk.len() as u64;
                writer.write(&chunk);
            }
            Ok::<(), DataAccessError>(())
        }
        .await;

        if let Err(e) = upload {
            if let Err(abort_err) = writer.abort().await {
                warn!(key, "Failed to abort multipart upload: {}", abort_err);
            }
            return Err(e);
        }

        writer.finish().await?;
        info!(key, total_bytes, "Multipart upload completed");
        Ok(total_bytes)
    }

    pub async fn delete(&self, key: &str) -> Result<(), DataAccessError> {
        debug!(key, "Deleting object");
        self.store.delete(&ObjectPath::from(key)).await?;
        Ok(())
    }

    /// Delete tolerating absence, for datasets that never completed.
    pub async fn delete_if_exists(&self, key: &str) -> Result<(), DataAccessError> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use object_store::memory::InMemory;

    fn memory_storage(part_size: usize, concurrency: usize) -> DatasetStorage {
        DatasetStorage::new(
            Arc::new(InMemory::new()),
            Url::parse("s3://test-bucket").unwrap(),
            part_size,
            concurrency,
        )
    }

    #[tokio::test]
    async fn uploads_a_chunked_stream_across_multiple_parts() {
        let storage = memory_storage(16, 4);
        let chunks: Vec<Result<Bytes, DataAccessError>> = (0u8..8)
            .map(|i| Ok(Bytes::from(vec![i; 10])))
            .collect();

        let total = storage
            .upload_stream("t/x/data.csv", stream::iter(chunks).boxed())
            .await
            .unwrap();
        assert_eq!(total, 80);

        let stored = storage
            .store
            .get(&ObjectPath::from("t/x/data.csv"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.len(), 80);
        assert_eq!(&stored[0..10], &[0u8; 10]);
        assert_eq!(&stored[70..80], &[7u8; 10]);
    }

    #[tokio::test]
    async fn source_error_aborts_and_leaves_no_object_behind() {
        let storage = memory_storage(16, 2);
        let chunks: Vec<Result<Bytes, DataAccessError>> = vec![
            Ok(Bytes::from_static(b"some bytes")),
            Err(DataAccessError::SourceError {
                message: "connection reset".to_string(),
            }),
        ];

        let err = storage
            .upload_stream("t/x/data.csv", stream::iter(chunks).boxed())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SourceError");

        let lookup = storage.store.get(&ObjectPath::from("t/x/data.csv")).await;
        assert!(matches!(lookup, Err(object_store::Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn delete_if_exists_tolerates_missing_objects() {
        let storage = memory_storage(16, 2);
        storage.delete_if_exists("t/x/absent.parquet").await.unwrap();
    }
}
