use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

use agent_runner_core::{Error, Result};

/// A stream bounded by one deadline over its whole lifetime.
///
/// When the deadline passes the stream yields a single [`Error::Timeout`]
/// and then ends; the inner stream is dropped at that point.
pub struct DeadlineStream<S> {
    inner: Option<S>,
    sleep: Pin<Box<Sleep>>,
    timeout: Duration,
    started: Instant,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self::with_budget(inner, timeout, Instant::now())
    }

    /// Deadline measured from `started` rather than now, for budgets
    /// partially spent before the stream existed.
    pub fn with_budget(inner: S, timeout: Duration, started: Instant) -> Self {
        Self {
            inner: Some(inner),
            sleep: Box::pin(tokio::time::sleep_until(started + timeout)),
            timeout,
            started,
        }
    }
}

impl<S, T> Stream for DeadlineStream<S>
where
    S: Stream<Item = Result<T>> + Unpin,
{
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        if this.sleep.as_mut().poll(cx).is_ready() {
            this.inner = None;
            let elapsed = this.started.elapsed();
            tracing::warn!(
                timeout = ?this.timeout,
                elapsed_ms = elapsed.as_millis() as u64,
                "Stream deadline exceeded"
            );
            return Poll::Ready(Some(Err(Error::Timeout {
                timeout: this.timeout,
                elapsed,
            })));
        }

        match Pin::new(inner).poll_next(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};

    #[tokio::test(start_paused = true)]
    async fn test_items_before_deadline_pass_through() {
        let inner = stream::iter(vec![Ok(1), Ok(2)]);
        let items: Vec<Result<i32>> = DeadlineStream::new(inner, Duration::from_secs(1))
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_spans_whole_stream() {
        // One item per second; the deadline allows only two.
        let inner = stream::unfold(0, |n| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some((Ok::<_, Error>(n), n + 1))
        })
        .boxed();

        let items: Vec<Result<i32>> = DeadlineStream::new(inner, Duration::from_millis(2500))
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(matches!(
            items[2],
            Err(Error::Timeout { timeout, .. }) if timeout == Duration::from_millis(2500)
        ));
    }
}
