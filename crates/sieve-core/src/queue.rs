use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Notify;

/// Capacity-bounded FIFO with blocking put/take.
///
/// One producer and one consumer per queue. Waiters are woken through
/// [`Notify`] permits, so a wakeup that races with the check is never lost.
pub struct BlockedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    pushed: Notify,
    popped: Notify,
}

impl<T> BlockedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            pushed: Notify::new(),
            popped: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn free_size(&self) -> usize {
        self.capacity - self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits until there is room for one item, then appends it.
    pub async fn put(&self, item: T) {
        let mut item = Some(item);
        loop {
            {
                let mut items = self.lock();
                if items.len() < self.capacity {
                    if let Some(item) = item.take() {
                        items.push_back(item);
                    }
                    drop(items);
                    self.pushed.notify_one();
                    return;
                }
            }
            self.popped.notified().await;
        }
    }

    /// Waits until the whole batch fits, then appends it in one step.
    ///
    /// A batch larger than the capacity is split into capacity-sized chunks,
    /// each inserted indivisibly.
    pub async fn put_all(&self, items: Vec<T>) {
        let mut pending: VecDeque<T> = items.into();
        while !pending.is_empty() {
            let chunk = pending.len().min(self.capacity);
            loop {
                {
                    let mut items = self.lock();
                    if self.capacity - items.len() >= chunk {
                        items.extend(pending.drain(..chunk));
                        drop(items);
                        self.pushed.notify_one();
                        break;
                    }
                }
                self.popped.notified().await;
            }
        }
    }

    /// Waits until the queue is non-empty, then removes the head.
    pub async fn take(&self) -> T {
        loop {
            {
                let mut items = self.lock();
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.popped.notify_one();
                    return item;
                }
            }
            self.pushed.notified().await;
        }
    }

    /// Waits until the queue is non-empty, then removes up to `max` items
    /// (all of them when `max` is `None`) from the head.
    pub async fn take_all(&self, max: Option<usize>) -> Vec<T> {
        loop {
            {
                let mut items = self.lock();
                if !items.is_empty() {
                    let count = max.map_or(items.len(), |m| m.min(items.len()));
                    let taken: Vec<T> = items.drain(..count).collect();
                    drop(items);
                    if !taken.is_empty() {
                        self.popped.notify_one();
                    }
                    return taken;
                }
            }
            self.pushed.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BlockedQueue::new(10);
        queue.put_all(vec![1, 2, 3]).await;
        queue.put(4).await;

        assert_eq!(queue.size(), 4);
        assert_eq!(queue.free_size(), 6);
        assert_eq!(queue.take().await, 1);
        assert_eq!(queue.take_all(Some(2)).await, vec![2, 3]);
        assert_eq!(queue.take_all(None).await, vec![4]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_all_zero_returns_empty() {
        let queue = BlockedQueue::new(2);
        queue.put(1).await;
        assert!(queue.take_all(Some(0)).await.is_empty());
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_put_blocks_while_full() {
        let queue = Arc::new(BlockedQueue::new(2));
        queue.put_all(vec![1, 2]).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(3).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.size(), 2);

        assert_eq!(queue.take().await, 1);
        producer.await.unwrap();
        assert_eq!(queue.take_all(None).await, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_put_all_waits_for_whole_batch() {
        let queue = Arc::new(BlockedQueue::new(3));
        queue.put_all(vec![1, 2]).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put_all(vec![3, 4]).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        // one slot free, batch of two must not be split
        assert_eq!(queue.size(), 2);

        assert_eq!(queue.take().await, 1);
        producer.await.unwrap();
        assert_eq!(queue.take_all(None).await, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_take_blocks_while_empty() {
        let queue = Arc::new(BlockedQueue::<u64>::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.take_all(None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!consumer.is_finished());

        queue.put_all(vec![7, 8]).await;
        assert_eq!(consumer.await.unwrap(), vec![7, 8]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_size_never_exceeds_capacity() {
        let queue = Arc::new(BlockedQueue::new(5));
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for chunk in (0..200u64).collect::<Vec<_>>().chunks(3) {
                    queue.put_all(chunk.to_vec()).await;
                    assert!(queue.size() <= queue.capacity());
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 200 {
            let batch = queue.take_all(Some(4)).await;
            assert!(queue.size() <= queue.capacity());
            seen.extend(batch);
        }
        producer.await.unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_oversized_batch_is_chunked() {
        let queue = Arc::new(BlockedQueue::new(2));
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put_all(vec![1, 2, 3, 4, 5]).await })
        };

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.extend(queue.take_all(None).await);
        }
        producer.await.unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
