//! Bounded outbound queue with at-least-once hand-off
//!
//! Producers push at the tail; the send loop takes items from the front as
//! [`InFlight`] guards. An in-flight item keeps its slot until it is
//! completed, so putting it back (at the tail after a failed send, or at
//! the front when the loop is cancelled) never needs room the queue does not
//! have. A guard dropped without being resolved restores its item to the
//! front.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Semaphore;

/// Bounded multi-producer FIFO used by the send loop
#[derive(Debug)]
pub struct OutboundQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// Free slots; a slot is held from enqueue until the item is completed
    slots: Semaphore,
    /// Items currently waiting in `items`
    ready: Semaphore,
    capacity: usize,
}

impl<T> OutboundQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slots: Semaphore::new(capacity),
            ready: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items waiting to be taken (excludes an in-flight item)
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots not held by a queued or in-flight item
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait until a slot is free and claim it for an item pushed by the
    /// caller through [`OutboundQueue::push_reserved`].
    pub async fn reserve(&self) {
        // The slot semaphore is never closed.
        if let Ok(permit) = self.slots.acquire().await {
            permit.forget();
        }
    }

    /// Push into a slot previously claimed with [`OutboundQueue::reserve`]
    pub fn push_reserved(&self, item: T) {
        self.lock().push_back(item);
        self.ready.add_permits(1);
    }

    /// Push at the tail, waiting for room
    pub async fn push(&self, item: T) {
        self.reserve().await;
        self.push_reserved(item);
    }

    /// Push at the tail or hand the item back if the queue is full
    pub fn try_push(&self, item: T) -> Result<(), T> {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push_reserved(item);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    /// Wait for the next item and take it from the front
    pub async fn pop(&self) -> InFlight<'_, T> {
        loop {
            if let Ok(permit) = self.ready.acquire().await {
                permit.forget();
            }
            if let Some(item) = self.lock().pop_front() {
                return InFlight {
                    queue: self,
                    item: Some(item),
                };
            }
        }
    }

    /// Clone of every waiting item, front first
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock cannot leave the deque inconsistent
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn return_item(&self, item: T, at_front: bool) {
        {
            let mut items = self.lock();
            if at_front {
                items.push_front(item);
            } else {
                items.push_back(item);
            }
        }
        self.ready.add_permits(1);
    }
}

/// An item taken from the queue that has not been resolved yet
#[derive(Debug)]
pub struct InFlight<'a, T> {
    queue: &'a OutboundQueue<T>,
    item: Option<T>,
}

impl<T> InFlight<'_, T> {
    /// The item being delivered
    pub fn get(&self) -> &T {
        // Only `None` after one of the consuming methods ran.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }

    /// Delivery succeeded; release the slot
    pub fn complete(mut self) {
        self.item = None;
        self.queue.slots.add_permits(1);
    }

    /// Drop the item for good (it can never be delivered); release the slot
    pub fn discard(self) {
        self.complete();
    }

    /// Delivery failed; put the item back at the tail
    pub fn requeue(mut self) {
        if let Some(item) = self.item.take() {
            self.queue.return_item(item, false);
        }
    }

    /// Delivery abandoned; put the item back at the front
    pub fn restore(mut self) {
        if let Some(item) = self.item.take() {
            self.queue.return_item(item, true);
        }
    }
}

impl<T> Drop for InFlight<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.return_item(item, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        for i in 0..4 {
            queue.push(i).await;
        }

        let mut drained = Vec::new();
        for _ in 0..4 {
            let item = queue.pop().await;
            drained.push(*item.get());
            item.complete();
        }
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert_eq!(queue.available_slots(), 4);
    }

    #[test]
    fn test_try_push_reports_full() {
        let queue = OutboundQueue::new(2);
        assert!(queue.try_push("a").is_ok());
        assert!(queue.try_push("b").is_ok());
        assert_eq!(queue.try_push("c"), Err("c"));
        assert_eq!(queue.snapshot(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_requeue_moves_item_to_tail() {
        let queue = OutboundQueue::new(3);
        queue.push(1).await;
        queue.push(2).await;

        queue.pop().await.requeue();
        assert_eq!(queue.snapshot(), vec![2, 1]);
        assert_eq!(queue.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_restore_moves_item_to_front() {
        let queue = OutboundQueue::new(3);
        queue.push(1).await;
        queue.push(2).await;

        queue.pop().await.restore();
        assert_eq!(queue.snapshot(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_dropped_guard_restores_item() {
        let queue = OutboundQueue::new(2);
        queue.push("reading").await;
        {
            let _in_flight = queue.pop().await;
            assert!(queue.is_empty());
        }
        assert_eq!(queue.snapshot(), vec!["reading"]);
    }

    #[tokio::test]
    async fn test_in_flight_item_holds_its_slot() {
        let queue = OutboundQueue::new(1);
        queue.push(1).await;
        let in_flight = queue.pop().await;

        // The slot is still taken by the in-flight item
        assert_eq!(queue.try_push(2), Err(2));

        in_flight.requeue();
        assert_eq!(queue.snapshot(), vec![1]);
    }

    #[tokio::test]
    async fn test_push_waits_for_room() {
        let queue = Arc::new(OutboundQueue::new(1));
        queue.push(1).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        queue.pop().await.complete();
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should get the freed slot")
            .unwrap();
        assert_eq!(queue.snapshot(), vec![2]);
    }

    #[tokio::test]
    async fn test_pop_waits_for_item() {
        let queue = Arc::new(OutboundQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let item = queue.pop().await;
                let value = *item.get();
                item.complete();
                value
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(7).await;
        let value = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake")
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_pop_takes_nothing() {
        let queue = OutboundQueue::<u32>::new(2);
        let result = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await;
        assert!(result.is_err());

        queue.push(3).await;
        let item = queue.pop().await;
        assert_eq!(*item.get(), 3);
    }
}
