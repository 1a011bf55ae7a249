use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

enum Message<T> {
    Item(T),
    Close,
}

/// Push side of an [`AsyncChannel`]. Cheap to clone.
pub struct ChannelSender<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Queue an item. Returns false once the channel is closed or the
    /// consumer is gone.
    pub fn push(&self, item: T) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Message::Item(item)).is_ok()
    }

    /// Mark the end of the sequence. Items pushed before this are still
    /// delivered; later pushes are dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Message::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

/// Bridges push-style production into a lazily pulled, ordered sequence.
///
/// Items come out in push order. The stream ends after an explicit
/// [`ChannelSender::close`] or once every sender is dropped.
pub struct AsyncChannel<T> {
    rx: mpsc::UnboundedReceiver<Message<T>>,
    done: bool,
}

impl<T> AsyncChannel<T> {
    /// Create a connected (sender, channel) pair.
    pub fn new() -> (ChannelSender<T>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = ChannelSender {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (sender, Self { rx, done: false })
    }

    /// Pull the next item, or `None` once the sequence is finished.
    pub async fn recv(&mut self) -> Option<T> {
        self.next().await
    }

    /// Collect every remaining item.
    pub async fn collect_all(mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.recv().await {
            items.push(item);
        }
        items
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

impl<T> Stream for AsyncChannel<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Message::Item(item))) => Poll::Ready(Some(item)),
            Poll::Ready(Some(Message::Close)) | Poll::Ready(None) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
