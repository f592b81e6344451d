use std::pin::Pin;
use std::task::{Context, Poll};
use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use crate::core::ByteProgress;

pin_project! {
    /// 请求体被读取时汇报累计字节数
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        bytes_sent: u64,
        progress: ByteProgress,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, progress: ByteProgress) -> Self {
        Self {
            inner,
            bytes_sent: 0,
            progress,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.bytes_sent += chunk.len() as u64;
                    (this.progress)(*this.bytes_sent);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use futures::StreamExt;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_reports_cumulative_bytes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress: ByteProgress = {
            let seen = seen.clone();
            Arc::new(move |bytes| seen.lock().push(bytes))
        };

        let parts: Vec<std::io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::new()),
            Ok(Bytes::from_static(b"defg")),
        ];
        let stream = ProgressStream::new(futures::stream::iter(parts), progress);
        let collected: Vec<_> = stream.collect().await;

        assert_eq!(collected.len(), 3);
        assert_eq!(*seen.lock(), vec![3, 7]);
    }
}
