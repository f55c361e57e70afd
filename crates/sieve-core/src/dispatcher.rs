use crate::{
    error::{IndexerError, Result},
    metrics,
    queue::BlockedQueue,
    shutdown::Shutdown,
    types::BlockContent,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Callback invoked for every block, in height order.
#[async_trait]
pub trait ProcessBlock: Send {
    async fn process(&mut self, content: BlockContent) -> Result<()>;
}

/// Single consumer of the block queue.
///
/// A processing error halts dispatching; blocks are never skipped. Heights
/// must be strictly increasing.
pub struct BlockDispatcher {
    blocks: Arc<BlockedQueue<BlockContent>>,
    shutdown: Shutdown,
    stopped: Shutdown,
}

fn log_failure(height: u64, e: &IndexerError) {
    match e {
        IndexerError::Handler {
            handler,
            input: Some(input),
            ..
        } => error!(height, handler = %handler, input = %input, error = %e, "Failed to process block"),
        _ => match e.handler_context() {
            Some((handler, _)) => error!(height, handler, error = %e, "Failed to process block"),
            None => error!(height, error = %e, "Failed to process block"),
        },
    }
}

impl BlockDispatcher {
    pub fn new(blocks: Arc<BlockedQueue<BlockContent>>, shutdown: Shutdown) -> Self {
        Self {
            blocks,
            shutdown,
            stopped: Shutdown::new(),
        }
    }

    /// Handle that stops dispatching before the next block. A block in
    /// progress completes.
    pub fn stop_handle(&self) -> Shutdown {
        self.stopped.clone()
    }

    fn halted(&self) -> bool {
        self.stopped.is_triggered() || self.shutdown.is_triggered()
    }

    pub async fn run(&self, processor: &mut dyn ProcessBlock) -> Result<()> {
        let mut previous: Option<u64> = None;
        while !self.halted() {
            let content = tokio::select! {
                content = self.blocks.take() => content,
                _ = self.shutdown.wait() => break,
                _ = self.stopped.wait() => break,
            };
            metrics::set(metrics::BLOCK_QUEUE_SIZE, self.blocks.size() as u64);

            let height = content.height();
            if let Some(previous) = previous.filter(|p| height <= *p) {
                let e = IndexerError::OutOfOrder { previous, height };
                log_failure(height, &e);
                return Err(e);
            }
            if let Err(e) = processor.process(content).await {
                log_failure(height, &e);
                return Err(e);
            }
            previous = Some(height);
        }
        debug!("Block dispatcher stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::transfer_block;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u64>,
        fail_at: Option<u64>,
        stop_after: Option<(u64, Shutdown)>,
    }

    #[async_trait]
    impl ProcessBlock for Recorder {
        async fn process(&mut self, content: BlockContent) -> Result<()> {
            let height = content.height();
            if self.fail_at == Some(height) {
                return Err(IndexerError::Handler {
                    handler: "handleBlock".into(),
                    height,
                    reason: "boom".into(),
                    input: None,
                });
            }
            self.seen.push(height);
            if let Some((at, stop)) = &self.stop_after {
                if *at == height {
                    stop.trigger();
                }
            }
            Ok(())
        }
    }

    async fn queue_with(heights: &[u64]) -> Arc<BlockedQueue<BlockContent>> {
        let queue = Arc::new(BlockedQueue::new(10));
        queue
            .put_all(heights.iter().map(|h| transfer_block(*h, 1)).collect())
            .await;
        queue
    }

    #[tokio::test]
    async fn test_halts_on_failure() {
        let queue = queue_with(&[1, 2, 3, 4]).await;
        let dispatcher = BlockDispatcher::new(queue.clone(), Shutdown::new());
        let mut recorder = Recorder {
            fail_at: Some(3),
            ..Recorder::default()
        };

        let err = dispatcher.run(&mut recorder).await.unwrap_err();
        assert_eq!(err.handler_context(), Some(("handleBlock", 3)));
        assert_eq!(recorder.seen, vec![1, 2]);
        // block 4 is left untouched
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_increasing_height() {
        let queue = queue_with(&[4, 5, 5, 6]).await;
        let dispatcher = BlockDispatcher::new(queue.clone(), Shutdown::new());
        let mut recorder = Recorder::default();

        let err = dispatcher.run(&mut recorder).await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::OutOfOrder {
                previous: 5,
                height: 5
            }
        ));
        assert_eq!(recorder.seen, vec![4, 5]);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_stop_between_blocks() {
        let queue = queue_with(&[1, 2, 3]).await;
        let dispatcher = BlockDispatcher::new(queue.clone(), Shutdown::new());
        let mut recorder = Recorder {
            stop_after: Some((2, dispatcher.stop_handle())),
            ..Recorder::default()
        };

        dispatcher.run(&mut recorder).await.unwrap();
        assert_eq!(recorder.seen, vec![1, 2]);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting() {
        let queue = Arc::new(BlockedQueue::new(4));
        let shutdown = Shutdown::new();
        let dispatcher = BlockDispatcher::new(queue, shutdown.clone());

        let handle = tokio::spawn(async move {
            let mut recorder = Recorder::default();
            dispatcher.run(&mut recorder).await.map(|_| recorder.seen)
        });
        tokio::task::yield_now().await;
        shutdown.trigger();
        assert!(handle.await.unwrap().unwrap().is_empty());
    }
}
