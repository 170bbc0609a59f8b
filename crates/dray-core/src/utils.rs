//! Timing helpers for the poll loop.
use futures::Stream;
use pin_project_lite::pin_project;

pin_project! {
    /// Fixed-period stream driving the poll loop.
    ///
    /// The delay re-arms itself when it fires. `restart` re-arms it early so
    /// a full period is measured from the end of a poll cycle, not from the
    /// previous tick.
    pub struct Ticker {
        #[pin]
        inner: futures_timer::Delay,
        period: std::time::Duration,
    }
}

impl Ticker {
    pub(crate) fn new(period: std::time::Duration) -> Self {
        Self {
            inner: futures_timer::Delay::new(period),
            period,
        }
    }

    /// Start a fresh period now.
    pub(crate) fn restart(self: std::pin::Pin<&mut Self>) {
        let mut this = self.project();
        let period = *this.period;
        this.inner.reset(period);
    }
}

impl Stream for Ticker {
    type Item = ();

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let mut this = self.project();
        let poll = this.inner.as_mut().poll(cx);
        if poll.is_ready() {
            this.inner.reset(*this.period);
        }
        poll.map(Some)
    }
}

/// Clamp `value` into `[min, max]`.
pub(crate) fn clamp_duration(
    value: std::time::Duration,
    min: std::time::Duration,
    max: std::time::Duration,
) -> std::time::Duration {
    value.max(min).min(max)
}
