use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{Checkpointer, CloseReason, EventMessage, EventProcessor, PartitionContext};

/// Drive one processor over one partition until cancelled or the feed
/// closes, then close it with [`CloseReason::Shutdown`].
///
/// Messages already queued are grouped into batches of at most
/// `max_batch_size`. Batches run strictly one after another; cancellation
/// is only observed between batches. Returns the processor for inspection.
pub async fn run_partition<P, K>(
    mut processor: P,
    mut ctx: PartitionContext<K>,
    mut rx: mpsc::Receiver<EventMessage>,
    max_batch_size: usize,
    cancel: CancellationToken,
) -> Result<P>
where
    P: EventProcessor,
    K: Checkpointer,
{
    let max_batch_size = max_batch_size.max(1);
    processor.open(&ctx).await?;

    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let mut batch = Vec::with_capacity(max_batch_size);
        batch.push(first);
        while batch.len() < max_batch_size {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }

        if let Err(e) = processor.process_batch(&mut ctx, batch).await {
            error!(
                consumer = processor.name(),
                partition = ctx.partition_id(),
                error = %e,
                "batch processing failed",
            );
        }
    }

    info!(
        consumer = processor.name(),
        partition = ctx.partition_id(),
        "partition pump stopping",
    );
    processor.close(&mut ctx, CloseReason::Shutdown).await?;
    Ok(processor)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::consumer::ingestion::{IngestionProcessor, IngestionSettings};
    use crate::consumer::{MemoryCheckpointer, ProcessorState};
    use crate::store::{LocationAggregateStore, MemoryBlobBackend};

    fn telemetry(device: &str) -> Vec<u8> {
        format!(
            r#"[{{"deviceid":"{device}","latitude":47.6,"longitude":-122.3,"carspeed":30,
                 "jerks":[{{"verticaljerk":1,"lateraljerk":1,"forwardjerk":1}}]}}]"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_pump_drains_feed_and_closes() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let store = Arc::new(LocationAggregateStore::new(backend, "aggregate/locations.json"));
        let checkpointer = Arc::new(MemoryCheckpointer::new());
        let ctx = PartitionContext::new("ingestion", "0", Arc::clone(&checkpointer));
        let processor = IngestionProcessor::new(Arc::clone(&store), IngestionSettings::default());

        let (tx, rx) = mpsc::channel(16);
        for (i, device) in ["a", "b", "c"].iter().enumerate() {
            tx.send(EventMessage::new(i.to_string(), telemetry(device)))
                .await
                .unwrap();
        }
        drop(tx);

        let processor = run_partition(processor, ctx, rx, 2, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(processor.lifecycle().total_messages(), 3);
        assert_eq!(
            processor.lifecycle().state(),
            ProcessorState::Closed(CloseReason::Shutdown)
        );
        assert_eq!(
            checkpointer.last_checkpoint("ingestion", "0").await.unwrap(),
            Some("2".to_string())
        );

        let snapshot = store.load_snapshot().await.unwrap();
        assert_eq!(snapshot.locations.len(), 1);
        assert_eq!(snapshot.locations[0].devices.len(), 3);
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancel() {
        let backend = Arc::new(MemoryBlobBackend::new());
        let store = Arc::new(LocationAggregateStore::new(backend, "aggregate/locations.json"));
        let ctx = PartitionContext::new("ingestion", "0", Arc::new(MemoryCheckpointer::new()));
        let processor = IngestionProcessor::new(store, IngestionSettings::default());

        let (_tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_partition(processor, ctx, rx, 8, cancel.clone()));
        cancel.cancel();

        let processor = handle.await.unwrap().unwrap();
        assert!(processor.lifecycle().is_closed());
    }
}
