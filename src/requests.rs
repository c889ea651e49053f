//! In-flight request bookkeeping.
//!
//! Three maps with distinct locks keep contention between the caller and the
//! session workers low:
//!
//! | map | key | lock |
//! |---|---|---|
//! | routing (signed shifted DC) | request id | mutex |
//! | payload (shared snapshot)   | request id | read-write lock |
//! | handlers (done/fail pair)   | request id | mutex |
//!
//! Routing is stored as `-bare` for a request aimed at "whichever DC is
//! currently main" and as the full shifted id for a pinned request. Payload
//! snapshots are immutable behind an `Arc`; mutating `needs_layer` or the
//! `after` link replaces the whole pointer under the write lock, so readers
//! holding the read lock always observe a consistent snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::dc_id::{dc_id_shift, shift_dc_id, DcId, ShiftedDcId};
use crate::errors::RpcError;

/// Caller-visible handle of one logical request. Always positive.
pub type RequestId = i32;

// ─── Request id allocator ─────────────────────────────────────────────────────

/// Process-wide source of request ids.
///
/// Ids are positive and increase monotonically; reaching half of the signed
/// range resets the counter, and [`crate::Instance::send`] skips any id that
/// is still live in the table after such a wrap.
pub struct RequestIdAllocator {
    counter: AtomicI32,
}

impl RequestIdAllocator {
    pub const fn new() -> Self {
        Self { counter: AtomicI32::new(0) }
    }

    pub fn next(&self) -> RequestId {
        let result = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if result == i32::MAX / 2 {
            self.counter.store(0, Ordering::SeqCst);
        }
        result
    }

    #[cfg(test)]
    fn force(&self, value: i32) {
        self.counter.store(value, Ordering::SeqCst);
    }
}

impl Default for RequestIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REQUEST_ID: RequestIdAllocator = RequestIdAllocator::new();

/// Allocate the next process-wide request id.
pub fn next_request_id() -> RequestId {
    GLOBAL_REQUEST_ID.next()
}

// ─── Serialized request ───────────────────────────────────────────────────────

/// An already-serialized request payload plus dispatch metadata.
///
/// The buffer layout is owned by the codec; the core only relies on the
/// 64-bit message id sitting at bytes 4..12 (used for server-side
/// cancellation). Cloning is cheap — the payload is shared.
#[derive(Clone)]
pub struct SerializedRequest {
    inner: Arc<RequestData>,
}

struct RequestData {
    body: Vec<u8>,
    request_id: RequestId,
    needs_layer: bool,
    after: Option<RequestId>,
    last_sent_at: u64,
}

impl SerializedRequest {
    /// Wrap a serialized payload. Metadata is stamped by the instance when
    /// the request is stored.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(RequestData {
                body,
                request_id: 0,
                needs_layer: false,
                after: None,
                last_sent_at: 0,
            }),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    /// The wire message id at payload bytes 4..12, or 0 for a short buffer.
    pub fn msg_id(&self) -> u64 {
        match self.inner.body.get(4..12) {
            Some(window) => u64::from_le_bytes(window.try_into().unwrap()),
            None => 0,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.inner.request_id
    }

    pub fn needs_layer(&self) -> bool {
        self.inner.needs_layer
    }

    /// The request this one must be sequenced after, if any.
    pub fn after(&self) -> Option<RequestId> {
        self.inner.after
    }

    /// Millisecond stamp of the last hand-off to a session.
    pub fn last_sent_at(&self) -> u64 {
        self.inner.last_sent_at
    }

    pub(crate) fn prepared(
        &self,
        request_id: RequestId,
        needs_layer: bool,
        after: Option<RequestId>,
        last_sent_at: u64,
    ) -> Self {
        Self {
            inner: Arc::new(RequestData {
                body: self.inner.body.clone(),
                request_id,
                needs_layer,
                after,
                last_sent_at,
            }),
        }
    }

    fn with_needs_layer(&self) -> Self {
        self.prepared(self.inner.request_id, true, self.inner.after, self.inner.last_sent_at)
    }

    fn without_after(&self) -> Self {
        self.prepared(self.inner.request_id, self.inner.needs_layer, None, self.inner.last_sent_at)
    }
}

// ─── Response handlers ────────────────────────────────────────────────────────

/// Decode-and-dispatch callback for a successful response. Receives the raw
/// response window; returns `false` when the bytes would not parse (the core
/// then synthesizes `RESPONSE_PARSE_FAILED`).
pub type DoneHandler = Arc<dyn Fn(RequestId, &[u8]) -> bool + Send + Sync>;

/// Callback for a failed request. Returns `true` when the error was consumed.
pub type FailHandler = Arc<dyn Fn(RequestId, &RpcError) -> bool + Send + Sync>;

/// The `{onDone, onFail}` pair registered with a request.
#[derive(Clone, Default)]
pub struct ResponseHandlers {
    pub on_done: Option<DoneHandler>,
    pub on_fail: Option<FailHandler>,
}

impl ResponseHandlers {
    /// No callbacks — fire and forget.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_done(mut self, f: impl Fn(RequestId, &[u8]) -> bool + Send + Sync + 'static) -> Self {
        self.on_done = Some(Arc::new(f));
        self
    }

    pub fn with_fail(mut self, f: impl Fn(RequestId, &RpcError) -> bool + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_done.is_none() && self.on_fail.is_none()
    }
}

/// A request whose callbacks must be dropped, with the error code that
/// triggered the cleanup (`0` for a silent drop).
#[derive(Clone, Copy, Debug)]
pub struct CallbackClear {
    pub request_id: RequestId,
    pub error_code: i32,
}

// ─── Request table ────────────────────────────────────────────────────────────

const MAX_RETRY_DELAY_SECS: i32 = 60;

/// Thread-safe store of every in-flight request.
///
/// Lock order: a caller never holds two table locks at once; each operation
/// takes exactly the lock of the map it touches.
pub struct RequestTable {
    routing: Mutex<HashMap<RequestId, ShiftedDcId>>,
    payloads: RwLock<HashMap<RequestId, SerializedRequest>>,
    handlers: Mutex<HashMap<RequestId, ResponseHandlers>>,
    retry_delays: Mutex<HashMap<RequestId, i32>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            routing: Mutex::new(HashMap::new()),
            payloads: RwLock::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            retry_delays: Mutex::new(HashMap::new()),
        }
    }

    /// Record where a request was routed. Negative values mean "the main DC".
    pub fn register(&self, request_id: RequestId, signed_dc_id: ShiftedDcId) {
        self.routing.lock().unwrap().insert(request_id, signed_dc_id);
    }

    /// Current routing of a request, sign included.
    pub fn routing(&self, request_id: RequestId) -> Option<ShiftedDcId> {
        self.routing.lock().unwrap().get(&request_id).copied()
    }

    /// Re-point a request at another bare DC, preserving the sign and the
    /// role shift of the stored value.
    pub fn change_routing(&self, request_id: RequestId, new_dc: DcId) -> Option<ShiftedDcId> {
        let mut routing = self.routing.lock().unwrap();
        let slot = routing.get_mut(&request_id)?;
        *slot = if *slot < 0 {
            -new_dc
        } else {
            shift_dc_id(new_dc, dc_id_shift(*slot))
        };
        Some(*slot)
    }

    /// Store payload and (if any) handlers for a request.
    pub fn store(&self, request_id: RequestId, request: SerializedRequest, handlers: ResponseHandlers) {
        if !handlers.is_empty() {
            self.handlers.lock().unwrap().insert(request_id, handlers);
        }
        self.payloads.write().unwrap().insert(request_id, request);
    }

    /// Shared snapshot of a stored payload.
    pub fn payload(&self, request_id: RequestId) -> Option<SerializedRequest> {
        self.payloads.read().unwrap().get(&request_id).cloned()
    }

    pub fn has_payload(&self, request_id: RequestId) -> bool {
        self.payloads.read().unwrap().contains_key(&request_id)
    }

    /// Remove and return the payload (used by `cancel`, which needs the
    /// message id of the erased buffer).
    pub fn remove_payload(&self, request_id: RequestId) -> Option<SerializedRequest> {
        self.payloads.write().unwrap().remove(&request_id)
    }

    /// Flag the stored payload for connection-init wrapping and return the
    /// fresh snapshot.
    pub fn set_needs_layer(&self, request_id: RequestId) -> Option<SerializedRequest> {
        let mut payloads = self.payloads.write().unwrap();
        let slot = payloads.get_mut(&request_id)?;
        *slot = slot.with_needs_layer();
        Some(slot.clone())
    }

    /// Drop the `after` dependency of a stored payload and return the fresh
    /// snapshot.
    pub fn clear_after(&self, request_id: RequestId) -> Option<SerializedRequest> {
        let mut payloads = self.payloads.write().unwrap();
        let slot = payloads.get_mut(&request_id)?;
        *slot = slot.without_after();
        Some(slot.clone())
    }

    /// Drop routing, payload and retry state of a request. Handlers are left
    /// to [`take_handlers`](Self::take_handlers) so a final error can still
    /// be delivered.
    pub fn unregister(&self, request_id: RequestId) {
        log::debug!("[requests] unregistering request {request_id}");
        self.retry_delays.lock().unwrap().remove(&request_id);
        self.payloads.write().unwrap().remove(&request_id);
        self.routing.lock().unwrap().remove(&request_id);
    }

    /// Whether the id still occupies any table slot (wrap-around guard).
    pub fn is_live(&self, request_id: RequestId) -> bool {
        self.routing.lock().unwrap().contains_key(&request_id)
            || self.handlers.lock().unwrap().contains_key(&request_id)
    }

    pub fn take_handlers(&self, request_id: RequestId) -> Option<ResponseHandlers> {
        self.handlers.lock().unwrap().remove(&request_id)
    }

    /// Re-register handlers after a policy-handled error kept the request
    /// alive.
    pub fn put_handlers(&self, request_id: RequestId, handlers: ResponseHandlers) {
        self.handlers.lock().unwrap().insert(request_id, handlers);
    }

    pub fn has_handlers(&self, request_id: RequestId) -> bool {
        self.handlers.lock().unwrap().contains_key(&request_id)
    }

    /// Current transient backoff for a request: 1 s on first failure, then
    /// doubling, capped at 60 s.
    pub fn next_retry_delay(&self, request_id: RequestId) -> i32 {
        let mut delays = self.retry_delays.lock().unwrap();
        match delays.get_mut(&request_id) {
            Some(secs) => {
                *secs = (*secs * 2).min(MAX_RETRY_DELAY_SECS);
                *secs
            }
            None => {
                delays.insert(request_id, 1);
                1
            }
        }
    }

    /// Number of requests with known routing.
    pub fn pending_requests(&self) -> usize {
        self.routing.lock().unwrap().len()
    }

    /// Number of requests with registered handlers.
    pub fn pending_handlers(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    /// Drop everything without invoking any callback (teardown path).
    pub fn discard_all(&self) {
        self.handlers.lock().unwrap().clear();
        self.payloads.write().unwrap().clear();
        self.routing.lock().unwrap().clear();
        self.retry_delays.lock().unwrap().clear();
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dc_id::shift_dc_id;

    #[test]
    fn allocator_skips_zero_and_counts_up() {
        let alloc = RequestIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn allocator_wraps_at_half_range() {
        let alloc = RequestIdAllocator::new();
        alloc.force(i32::MAX / 2 - 1);
        assert_eq!(alloc.next(), i32::MAX / 2);
        assert_eq!(alloc.next(), 1);
    }

    #[test]
    fn msg_id_reads_bytes_4_to_12() {
        let mut body = vec![0u8; 16];
        body[4..12].copy_from_slice(&0xDEAD_BEEF_CAFE_BABEu64.to_le_bytes());
        let request = SerializedRequest::new(body);
        assert_eq!(request.msg_id(), 0xDEAD_BEEF_CAFE_BABE);
        assert_eq!(SerializedRequest::new(vec![0u8; 4]).msg_id(), 0);
    }

    #[test]
    fn change_routing_preserves_sign_and_shift() {
        let table = RequestTable::new();
        table.register(7, -2);
        assert_eq!(table.change_routing(7, 4), Some(-4));

        table.register(8, shift_dc_id(2, 0x11));
        assert_eq!(table.change_routing(8, 4), Some(shift_dc_id(4, 0x11)));

        assert_eq!(table.change_routing(9, 4), None);
    }

    #[test]
    fn handlers_only_stored_when_present() {
        let table = RequestTable::new();
        table.register(1, 2);
        table.store(1, SerializedRequest::new(vec![0u8; 12]), ResponseHandlers::none());
        assert_eq!(table.pending_requests(), 1);
        assert_eq!(table.pending_handlers(), 0);

        table.register(2, 2);
        table.store(
            2,
            SerializedRequest::new(vec![0u8; 12]),
            ResponseHandlers::none().with_done(|_, _| true),
        );
        assert_eq!(table.pending_handlers(), 1);
        assert!(table.pending_requests() >= table.pending_handlers());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let table = RequestTable::new();
        let mut last = 0;
        for _ in 0..10 {
            last = table.next_retry_delay(3);
        }
        assert_eq!(last, 60, "backoff must cap at 60s");
        assert_eq!(table.next_retry_delay(4), 1, "fresh request starts at 1s");
    }

    #[test]
    fn unregister_clears_everything_but_handlers() {
        let table = RequestTable::new();
        table.register(5, -2);
        table.store(
            5,
            SerializedRequest::new(vec![0u8; 12]),
            ResponseHandlers::none().with_done(|_, _| true),
        );
        table.next_retry_delay(5);
        table.unregister(5);
        assert_eq!(table.routing(5), None);
        assert!(table.payload(5).is_none());
        assert!(table.has_handlers(5), "handlers survive until taken");
        assert_eq!(table.next_retry_delay(5), 1, "retry state was reset");
    }

    #[test]
    fn needs_layer_replaces_snapshot() {
        let table = RequestTable::new();
        table.register(6, 2);
        let original = SerializedRequest::new(vec![0u8; 12]).prepared(6, false, None, 0);
        table.store(6, original.clone(), ResponseHandlers::none());
        let updated = table.set_needs_layer(6).expect("payload is stored");
        assert!(updated.needs_layer());
        assert!(!original.needs_layer(), "old snapshot is untouched");
    }
}
