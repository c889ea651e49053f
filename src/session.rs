//! Session interface.
//!
//! A session owns one network connection to one shifted DC: it encrypts with
//! the DC's keys, sequences messages on the wire and reports results back to
//! the instance through the [`InstanceHandle`](crate::InstanceHandle) it was
//! given at construction. The instance only ever talks to sessions through
//! this trait.

use std::sync::Arc;

use crate::dc_id::ShiftedDcId;
use crate::dcenter::Dcenter;
use crate::instance::InstanceHandle;
use crate::requests::{RequestId, SerializedRequest};

/// Connection state reported through `on_state_change`.
pub const DISCONNECTED_STATE: i32 = 0;
/// Connection is being established.
pub const CONNECTING_STATE: i32 = 1;
/// Connection is up.
pub const CONNECTED_STATE: i32 = 2;

/// Sentinel returned by [`crate::Instance::state`] when a request has been
/// handed over but the session reports nothing more specific. Negative
/// state values mean "waiting for that many milliseconds".
pub const REQUEST_SENT: i32 = 0;

/// Outbound surface of a per-shifted-DC session.
pub trait Session: Send + Sync {
    /// Begin connecting. Called exactly once, right after construction.
    fn start(&self);

    /// Queue an already-serialized request for the wire. Must not block.
    fn send_prepared(&self, request: &SerializedRequest, ms_can_wait: u64);

    /// Flush anything queued, waiting at most `ms_can_wait`.
    fn send_anything(&self, ms_can_wait: u64);

    /// Cancel a request server-side by its wire message id.
    fn cancel(&self, request_id: RequestId, msg_id: u64);

    /// Drop the connection and reconnect.
    fn restart(&self);

    /// Pause a non-main session.
    fn stop(&self);

    /// Terminate for good; the session must not call back afterwards.
    fn kill(&self);

    fn ping(&self);

    /// State of one in-flight request, or of the session itself for id 0.
    fn request_state(&self, request_id: RequestId) -> i32;

    /// Human-readable transport tag ("tcp", "http", …), empty if none yet.
    fn transport(&self) -> String;

    /// The shifted DC this session is bound to.
    fn dc_with_shift(&self) -> ShiftedDcId;

    /// Re-read endpoint/proxy options on the next connect.
    fn refresh_options(&self);

    /// Resend the connection-init wrapper with the next request.
    fn re_init_connection(&self);

    /// The app came back to the foreground; flush paused work.
    fn unpaused(&self);
}

/// Builds sessions on demand as requests start targeting new shifted DCs.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        shifted_dc_id: ShiftedDcId,
        dc: Arc<Dcenter>,
        handle: InstanceHandle,
    ) -> Arc<dyn Session>;
}
