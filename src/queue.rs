// Copyright (C) 2024 Wei Tan <wtan.dev@gmail.com>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded FIFO frame queue with drop-oldest overflow.
//!
//! Producers never block: when the queue is full, the oldest entry is
//! dropped before the new one is enqueued. Frames hold their payload as a
//! refcounted [`bytes::Bytes`], so hand-off is zero-copy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::codec::VideoFrame;

pub(crate) struct FrameQueue {
    inner: Mutex<VecDeque<VideoFrame>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl FrameQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues `frame`, dropping the oldest entry if the queue is full.
    pub(crate) fn push(&self, frame: VideoFrame) {
        {
            let mut q = self.inner.lock().expect("frame queue poisoned");
            if q.len() >= self.capacity {
                q.pop_front();
            }
            q.push_back(frame);
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn try_pop(&self) -> Option<VideoFrame> {
        self.inner.lock().expect("frame queue poisoned").pop_front()
    }

    /// Waits up to `timeout` for a frame.
    ///
    /// Returns `None` on timeout or once the queue is closed and empty.
    pub(crate) async fn pop_timeout(&self, timeout: Duration) -> Option<VideoFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking state; `Notify` wake-ups
            // issued between the check and the await would otherwise be lost.
            let notified = self.notify.notified();
            if let Some(f) = self.try_pop() {
                return Some(f);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    /// Waits for a frame until the queue is closed.
    pub(crate) async fn pop(&self) -> Option<VideoFrame> {
        loop {
            let notified = self.notify.notified();
            if let Some(f) = self.try_pop() {
                return Some(f);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Wakes all waiters and makes subsequent pops return `None` once the
    /// queue drains.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().expect("frame queue poisoned").clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("frame queue poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameType, VideoCodec, VideoFrame};
    use bytes::Bytes;

    fn frame(pts: u64) -> VideoFrame {
        VideoFrame::new(
            VideoCodec::H264,
            FrameType::P,
            pts,
            Bytes::from_static(&[0, 0, 0, 1, 0x41, 1]),
        )
    }

    #[tokio::test]
    async fn drops_oldest_when_full() {
        let q = FrameQueue::new(2);
        q.push(frame(1));
        q.push(frame(2));
        q.push(frame(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop().unwrap().pts_ms(), 2);
        assert_eq!(q.try_pop().unwrap().pts_ms(), 3);
    }

    #[tokio::test]
    async fn pop_timeout_expires() {
        let q = FrameQueue::new(2);
        let start = std::time::Instant::now();
        assert!(q.pop_timeout(Duration::from_millis(50)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn close_wakes_waiter() {
        let q = std::sync::Arc::new(FrameQueue::new(2));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop_timeout(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn push_wakes_waiter() {
        let q = std::sync::Arc::new(FrameQueue::new(2));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop_timeout(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(frame(7));
        let got = waiter.await.unwrap();
        assert_eq!(got.unwrap().pts_ms(), 7);
    }
}
