//! Close procedure for multiplexed-stream connections (HTTP/2).
//!
//! # Delayed-graceful handshake
//! ```text
//! t0:          shutdown intent (last-stream-id = NO_NEW_STREAMS_SENTINEL)
//! t0 + delay:  still open? → final notice (true last-stream-id) → close
//! ```
//! Some peers drop in-flight responses after the intent notice, so
//! `close.allow_graceful_delayed = false` turns the handshake into an
//! immediate close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

use crate::close::{
    schedule_unless_closed, CloseCompletion, CloseState, CloseType, ConnectionFlags,
    MultiplexedControl,
};
use crate::config::{CloseConfig, LiveConfig};

#[derive(Debug)]
pub struct Http2CloseHandler<C> {
    control: Arc<C>,
    flags: Arc<ConnectionFlags>,
    state: Arc<CloseState>,
    config: LiveConfig<CloseConfig>,
    handle: Option<Handle>,
    /// Set once the true last-stream-id has been announced.
    final_notice_sent: AtomicBool,
}

impl<C: MultiplexedControl> Http2CloseHandler<C> {
    /// Create a handler bound to the calling runtime (the connection's worker).
    pub fn new(
        control: Arc<C>,
        flags: Arc<ConnectionFlags>,
        config: LiveConfig<CloseConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            control,
            flags,
            state: Arc::new(CloseState::new()),
            config,
            handle: Handle::try_current().ok(),
            final_notice_sent: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &CloseState {
        &self.state
    }

    pub fn flags(&self) -> &Arc<ConnectionFlags> {
        &self.flags
    }

    pub fn stream_opened(&self) {
        self.state.request_started();
    }

    /// A stream's response completed (or the stream was reset).
    pub fn stream_closed(self: &Arc<Self>) {
        let remaining = self.state.request_finished();
        if remaining == 0
            && self.state.is_closing()
            && self.final_notice_sent.load(Ordering::Acquire)
        {
            self.state.finish(&*self.control);
        }
    }

    /// The peer went away; nothing left to close.
    pub fn peer_disconnected(&self) {
        self.state.mark_closed();
    }

    /// Close using the connection's flagged close type.
    pub fn close_flagged(self: &Arc<Self>) -> CloseCompletion {
        self.close(self.flags.close_type())
    }

    /// Run a close procedure. A second request only waits on the first.
    pub fn close(self: &Arc<Self>, close_type: CloseType) -> CloseCompletion {
        let completion = self.state.completion();
        if !self.state.begin_closing() {
            return completion;
        }

        match close_type {
            CloseType::Immediate => self.close_immediately(),
            CloseType::Graceful => self.close_gracefully(),
            CloseType::DelayedGraceful => {
                if self.config.current().allow_graceful_delayed {
                    self.close_with_delayed_notice();
                } else {
                    tracing::debug!("Delayed graceful close disabled, closing immediately");
                    self.close_immediately();
                }
            }
        }
        completion
    }

    fn close_immediately(&self) {
        self.state.finish(&*self.control);
    }

    fn send_final_notice(&self) {
        if !self.final_notice_sent.swap(true, Ordering::AcqRel) {
            self.control
                .send_final_shutdown_notice(self.control.last_stream_id());
        }
    }

    fn close_gracefully(self: &Arc<Self>) {
        self.send_final_notice();
        if !self.state.is_request_in_flight() {
            self.state.finish(&*self.control);
            return;
        }

        let delay = self.config.current().graceful_delay();
        let this = Arc::clone(self);
        schedule_unless_closed(self.handle.as_ref(), &self.state, delay, move || {
            if this.control.is_open() {
                tracing::debug!(
                    open_streams = this.state.in_flight(),
                    "Grace delay elapsed with streams open, closing connection"
                );
                this.state.finish(&*this.control);
            } else {
                this.state.mark_closed();
            }
        });
    }

    fn close_with_delayed_notice(self: &Arc<Self>) {
        self.control.send_shutdown_intent();

        let delay = self.config.current().graceful_delay();
        tracing::debug!(delay_secs = delay.as_secs(), "Shutdown intent sent");

        let this = Arc::clone(self);
        schedule_unless_closed(self.handle.as_ref(), &self.state, delay, move || {
            if this.control.is_open() {
                this.send_final_notice();
                this.state.finish(&*this.control);
            } else {
                this.state.mark_closed();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::test_support::RecordingControl;
    use std::time::Duration;

    fn handler(
        control: &Arc<RecordingControl>,
        allow_delayed: bool,
    ) -> Arc<Http2CloseHandler<RecordingControl>> {
        Http2CloseHandler::new(
            control.clone(),
            Arc::new(ConnectionFlags::new()),
            LiveConfig::new(CloseConfig {
                allow_graceful_delayed: allow_delayed,
                graceful_delay_secs: 3,
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_graceful_two_phase() {
        let control = RecordingControl::new();
        control.last_stream.store(41, Ordering::SeqCst);
        let h = handler(&control, true);
        h.stream_opened();

        let done = h.close(CloseType::DelayedGraceful);
        assert_eq!(control.actions(), vec!["intent".to_string()]);

        // Streams finishing during the intent phase do not cut it short.
        h.stream_closed();
        assert_eq!(control.close_count(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        done.wait().await;
        assert_eq!(
            control.actions(),
            vec!["intent".to_string(), "final:41".to_string(), "close".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delayed_graceful_disabled_is_immediate() {
        let control = RecordingControl::new();
        let h = handler(&control, false);

        let done = h.close(CloseType::DelayedGraceful);
        done.wait().await;
        assert_eq!(control.actions(), vec!["close".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_escalation_skipped_when_already_closed() {
        let control = RecordingControl::new();
        let h = handler(&control, true);

        let done = h.close(CloseType::DelayedGraceful);
        control.open.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        done.wait().await;

        assert_eq!(control.actions(), vec!["intent".to_string()]);
        assert_eq!(control.close_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_waits_for_streams() {
        let control = RecordingControl::new();
        control.last_stream.store(7, Ordering::SeqCst);
        let h = handler(&control, true);
        h.stream_opened();
        h.stream_opened();

        let done = h.close(CloseType::Graceful);
        assert_eq!(control.actions(), vec!["final:7".to_string()]);

        h.stream_closed();
        assert_eq!(control.close_count(), 0);
        h.stream_closed();
        done.wait().await;
        assert_eq!(control.close_count(), 1);
    }

    #[tokio::test]
    async fn test_second_close_is_noop_and_resolves() {
        let control = RecordingControl::new();
        let h = handler(&control, true);

        let first = h.close(CloseType::Immediate);
        let second = h.close(CloseType::DelayedGraceful);
        first.wait().await;
        second.wait().await;

        assert_eq!(control.actions(), vec!["close".to_string()]);
    }
}
