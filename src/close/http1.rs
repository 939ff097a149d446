//! Close procedure for request/response-per-connection (HTTP/1.x).
//!
//! A closing connection tells the peer through `Connection: close` on the
//! response, and the transport is only closed after that response's last
//! bytes are flushed.

use std::sync::Arc;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION};
use tokio::runtime::Handle;

use crate::close::{
    schedule_unless_closed, CloseCompletion, CloseState, CloseType, ConnectionControl,
    ConnectionFlags,
};
use crate::config::{CloseConfig, LiveConfig};

#[derive(Debug)]
pub struct Http1CloseHandler<C> {
    control: Arc<C>,
    flags: Arc<ConnectionFlags>,
    state: Arc<CloseState>,
    config: LiveConfig<CloseConfig>,
    handle: Option<Handle>,
}

impl<C: ConnectionControl> Http1CloseHandler<C> {
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
        })
    }

    pub fn state(&self) -> &CloseState {
        &self.state
    }

    pub fn flags(&self) -> &Arc<ConnectionFlags> {
        &self.flags
    }

    /// A request was dispatched on this connection.
    pub fn request_started(&self) {
        self.state.request_started();
    }

    /// Attach `Connection: close` if this connection is going away.
    ///
    /// Must run before the response headers are flushed. Returns whether the
    /// header was added.
    pub fn prepare_response_headers(&self, headers: &mut HeaderMap) -> bool {
        if self.state.is_closing() || self.flags.should_close() {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
            true
        } else {
            false
        }
    }

    /// The response's final bytes were flushed to the peer.
    pub fn response_flushed(self: &Arc<Self>) {
        if self.state.request_finished() > 0 {
            return;
        }

        if self.state.is_closing() {
            if self.state.finish(&*self.control) {
                tracing::debug!("Deferred close completed after final flush");
            }
        } else if self.flags.should_close() {
            let _ = self.close(self.flags.close_type());
        }
    }

    /// The peer went away; nothing left to close.
    pub fn peer_disconnected(&self) {
        if self.state.mark_closed() {
            tracing::trace!("Peer disconnected before close completed");
        }
    }

    /// Close using the connection's flagged close type.
    pub fn close_flagged(self: &Arc<Self>) -> CloseCompletion {
        self.close(self.flags.close_type())
    }

    /// Run a close procedure. A second request only waits on the first.
    ///
    /// Delayed-graceful has no meaning without streams and runs as graceful.
    pub fn close(self: &Arc<Self>, close_type: CloseType) -> CloseCompletion {
        let completion = self.state.completion();
        if !self.state.begin_closing() {
            return completion;
        }

        match close_type {
            CloseType::Immediate => {
                self.state.finish(&*self.control);
            }
            CloseType::Graceful | CloseType::DelayedGraceful => self.close_gracefully(),
        }
        completion
    }

    fn close_gracefully(self: &Arc<Self>) {
        if !self.state.is_request_in_flight() {
            self.state.finish(&*self.control);
            return;
        }

        let delay = self.config.current().graceful_delay();
        tracing::debug!(
            in_flight = self.state.in_flight(),
            delay_secs = delay.as_secs(),
            "Deferring close until in-flight response completes"
        );

        let this = Arc::clone(self);
        schedule_unless_closed(self.handle.as_ref(), &self.state, delay, move || {
            if this.control.is_open() {
                tracing::debug!("Grace delay elapsed, closing connection");
                this.state.finish(&*this.control);
            } else {
                this.state.mark_closed();
            }
        });
    }
}
