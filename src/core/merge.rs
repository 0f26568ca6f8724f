//! Multi-source merge read.
//!
//! A [`MergeReader`] waits on any number of `flume` sources at once and
//! yields whichever value is ready first. Sources can be added through a
//! [`MergeHandle`] while a read is already blocked; they are picked up
//! without restarting the read. Adding the same source id twice is a no-op.
//!
//! "Continue waiting" is calling [`MergeReader::next`] again; "stop" is
//! dropping the reader, which detaches every source.

use std::collections::HashSet;

use flume::r#async::RecvStream;
use futures::stream::{SelectAll, StreamExt};
use tokio::sync::mpsc;

/// Identity of a source, unique for the lifetime of the process.
pub type SourceId = u64;

/// Creates a connected handle/reader pair with no sources.
pub fn merge_read<T: Send + 'static>() -> (MergeHandle<T>, MergeReader<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MergeHandle { tx },
        MergeReader {
            incoming: rx,
            seen: HashSet::new(),
            sources: SelectAll::new(),
        },
    )
}

/// Adds sources to a [`MergeReader`] from anywhere.
pub struct MergeHandle<T> {
    tx: mpsc::UnboundedSender<(SourceId, flume::Receiver<T>)>,
}

impl<T> Clone for MergeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> MergeHandle<T> {
    /// Folds `source` into the read. Returns false once the reader is gone.
    pub fn merge(&self, id: SourceId, source: flume::Receiver<T>) -> bool {
        self.tx.send((id, source)).is_ok()
    }
}

pub struct MergeReader<T: 'static> {
    incoming: mpsc::UnboundedReceiver<(SourceId, flume::Receiver<T>)>,
    seen: HashSet<SourceId>,
    sources: SelectAll<RecvStream<'static, T>>,
}

impl<T: Send + 'static> MergeReader<T> {
    /// Number of live sources currently attached.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn attach(&mut self, id: SourceId, source: flume::Receiver<T>) {
        if self.seen.insert(id) {
            self.sources.push(source.into_stream());
        }
    }

    /// Waits for the next value from any source.
    ///
    /// Returns `None` only when every handle is dropped and every source has
    /// ended. Cancel safe.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            // Drain pending additions first so a freshly merged source is
            // polled in the same round.
            while let Ok((id, source)) = self.incoming.try_recv() {
                self.attach(id, source);
            }

            tokio::select! {
                Some((id, source)) = self.incoming.recv() => self.attach(id, source),
                Some(value) = self.sources.next(), if !self.sources.is_empty() => return Some(value),
                else => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn source_added_while_blocked_is_observed() {
        let (handle, mut reader) = merge_read::<u32>();
        let (tx, rx) = flume::bounded(0);

        let waiter = tokio::spawn(async move { reader.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(handle.merge(1, rx));
        tx.send_async(7).await.unwrap();

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn duplicate_sources_are_ignored() {
        let (handle, mut reader) = merge_read::<u32>();
        let (_tx, rx) = flume::bounded::<u32>(1);

        handle.merge(1, rx.clone());
        handle.merge(1, rx);
        // Let the reader pick up both additions without a value.
        let _ = timeout(Duration::from_millis(20), reader.next()).await;
        assert_eq!(reader.source_count(), 1);
    }

    #[tokio::test]
    async fn first_ready_source_wins() {
        let (handle, mut reader) = merge_read::<&'static str>();
        let (tx_a, rx_a) = flume::bounded(1);
        let (_tx_b, rx_b) = flume::bounded::<&'static str>(1);
        handle.merge(1, rx_a);
        handle.merge(2, rx_b);

        tx_a.send("a").unwrap();
        let got = timeout(Duration::from_secs(1), reader.next()).await.unwrap();
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn ends_when_handles_and_sources_are_gone() {
        let (handle, mut reader) = merge_read::<u32>();
        let (tx, rx) = flume::bounded::<u32>(1);
        handle.merge(1, rx);
        drop(handle);
        drop(tx);

        let got = timeout(Duration::from_secs(1), reader.next()).await.unwrap();
        assert_eq!(got, None);
    }
}
