//! Replay streams
//!
//! A replay is a finite, lazily fetched sequence: the end offset is fixed
//! when the stream is opened and pages are read on demand as the consumer
//! pulls. Nothing is kept on the server between calls, so replaying the same
//! range twice yields the same messages.

use super::model::Message;
use crate::error::Result;
use crate::storage::{broker as db, Store};
use crate::types::{AgentId, LogOffset, TopicId};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

/// Messages with `from < offset <= end`, in offset order
pub struct ReplayStream {
    inner: ReceiverStream<Result<Message>>,
    producer: JoinHandle<()>,
    end: LogOffset,
}

impl ReplayStream {
    pub(crate) fn open(
        store: Store,
        topic: TopicId,
        recipient: Option<AgentId>,
        from: LogOffset,
        end: LogOffset,
        page_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(page_size.max(1));

        let producer = tokio::spawn(async move {
            let mut after = from;
            while after < end {
                let (t, r) = (topic.clone(), recipient.clone());
                let page = store
                    .read(move |conn| db::replay_page(conn, &t, r.as_ref(), after, end, page_size))
                    .await;

                let page = match page {
                    Ok(page) => page,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                let full = page.len() == page_size;
                for message in page {
                    after = message.offset;
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
                if !full {
                    break;
                }
            }
        });

        Self {
            inner: ReceiverStream::new(rx),
            producer,
            end,
        }
    }

    /// Last offset this stream can yield
    pub fn end(&self) -> LogOffset {
        self.end
    }
}

impl Stream for ReplayStream {
    type Item = Result<Message>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for ReplayStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
