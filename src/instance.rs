//! The instance façade and its control plane.
//!
//! One [`Instance`] multiplexes application requests across every
//! authenticated DC session: it allocates request ids, files payloads and
//! callbacks, picks (and lazily starts) the session for a shifted DC, and
//! reacts to protocol errors — migrating requests between DCs, backing off on
//! floods and server failures, exporting/importing authorization for guest
//! DCs, re-initing the connection layer and sequencing dependent requests.
//!
//! Sessions and one-shot loaders never call back into the instance directly;
//! they post events through a cloneable [`InstanceHandle`] and the
//! [`Instance::run`] driver task applies them. Façade methods are synchronous
//! and never block on the network.
//!
//! ```rust,no_run
//! # use layer_instance::{Instance, InstanceConfig, Mode, SendOptions,
//! #     SerializedRequest, ResponseHandlers};
//! # fn collaborators() -> InstanceConfig { unimplemented!() }
//! # fn parse(_: &[u8]) -> bool { true }
//! # async fn demo() {
//! # let payload = vec![0u8; 16];
//! let instance = Instance::new(Mode::Normal, collaborators());
//! tokio::spawn({
//!     let driver = instance.clone();
//!     async move { driver.run().await }
//! });
//!
//! let request_id = instance.send(
//!     SerializedRequest::new(payload),
//!     ResponseHandlers::none().with_done(|_, bytes| parse(bytes)),
//!     SendOptions::default(),
//! );
//! # let _ = request_id;
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::auth_key::AuthKeyPtr;
use crate::clock::Clock;
use crate::config::{
    ConfigData, CONFIG_BECOMES_OLD_FOR_BLOCKED_IN_MS, CONFIG_BECOMES_OLD_IN_MS,
    CONFIG_REFRESH_MAX_DELAY_MS,
};
use crate::dc_id::{
    bare_dc_id, dc_id_shift, destroy_key_next_dc_id, is_temporary_dc_id, logout_dc_id,
    real_dc_id_from_temporary, shift_dc_id, DcId, ShiftedDcId,
};
use crate::dc_options::{CdnConfig, DcOptions, DcType};
use crate::dcenter::Dcenter;
use crate::delayed::DelayedQueue;
use crate::env::{
    AuthorizationState, Codec, ConfigLoader, DestroyKeyResult, DomainResolver,
    ExportedAuthorization, KeyStoreSink, LanguageSink, ResolvedDomain, SettingsSink, Unixtime,
};
use crate::errors::RpcError;
use crate::requests::{
    next_request_id, CallbackClear, RequestId, RequestTable, ResponseHandlers, SerializedRequest,
};
use crate::session::{Session, SessionFactory, DISCONNECTED_STATE, REQUEST_SENT};

/// Default main DC for a fresh instance without a forced choice.
pub const DEFAULT_MAIN_DC: DcId = 2;

const NONE_MAIN_DC: DcId = 0;

/// Top-level lifecycle of an instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Serve application requests.
    Normal,
    /// Log out of every seeded DC and destroy its auth key, then finish.
    KeysDestroyer,
}

/// Everything an instance needs at construction: identity strings, seeded
/// keys, the main-DC choice and the collaborator capabilities.
pub struct InstanceConfig {
    pub device_model: String,
    pub system_version: String,
    /// Persistent keys to seed the key registry with.
    pub keys: Vec<AuthKeyPtr>,
    /// Forced main DC. `None` falls back to [`DEFAULT_MAIN_DC`] in normal
    /// mode; key-destroyer instances never have a main DC.
    pub main_dc_id: Option<DcId>,

    pub dc_options: Arc<dyn DcOptions>,
    pub session_factory: Arc<dyn SessionFactory>,
    pub codec: Arc<dyn Codec>,
    pub config_loader: Arc<dyn ConfigLoader>,
    pub domain_resolver: Arc<dyn DomainResolver>,
    pub unixtime: Arc<dyn Unixtime>,
    pub settings: Arc<dyn SettingsSink>,
    pub key_store: Arc<dyn KeyStoreSink>,
    pub language: Arc<dyn LanguageSink>,
    pub authorization: Arc<dyn AuthorizationState>,
}

/// Per-send knobs of [`Instance::send`].
#[derive(Clone, Copy)]
pub struct SendOptions {
    /// Target shifted DC; `0` routes to whichever DC is currently main.
    pub shifted_dc_id: ShiftedDcId,
    /// How long the session may batch the request before flushing.
    pub ms_can_wait: u64,
    /// Wrap the request in a connection-init envelope.
    pub needs_layer: bool,
    /// Request this one must be sequenced after (`0` for none).
    pub after: RequestId,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self { shifted_dc_id: 0, ms_can_wait: 0, needs_layer: false, after: 0 }
    }
}

impl SendOptions {
    /// Pin the request to a shifted DC.
    pub fn to_dc(shifted_dc_id: ShiftedDcId) -> Self {
        Self { shifted_dc_id, ..Self::default() }
    }
}

/// Connection-state callback.
pub type StateChangedHandler = Arc<dyn Fn(ShiftedDcId, i32) + Send + Sync>;
/// Session-reset callback.
pub type SessionResetHandler = Arc<dyn Fn(ShiftedDcId) + Send + Sync>;

// ─── Events ───────────────────────────────────────────────────────────────────

pub(crate) enum Event {
    ExecCallback { request_id: RequestId, response: Vec<u8> },
    GlobalCallback { response: Vec<u8> },
    ClearCallbacks { ids: Vec<CallbackClear> },
    StateChange { shifted_dc_id: ShiftedDcId, state: i32 },
    SessionReset { shifted_dc_id: ShiftedDcId },
    PersistentKeyChanged { dc_id: DcId, key: Option<AuthKeyPtr> },
    TemporaryKeyChanged { dc_id: DcId },
    KeyDestroyedOnServer { shifted_dc_id: ShiftedDcId, key_id: u64 },

    AuthExported { request_id: RequestId, exported: ExportedAuthorization },
    AuthExportFailed { request_id: RequestId },
    AuthImported { dc_id: DcId },

    ConfigLoaded { config: ConfigData },
    ConfigLoadFailed { error: RpcError },
    ConfigExpiryCheck,
    CdnConfigLoaded { config: CdnConfig },
    CdnConfigFailed,
    UnixtimeLoaded,
    DomainResolved { host: String, resolved: Option<ResolvedDomain> },

    LogoutGuestDone { request_id: RequestId },
    DestroyerLogout { shifted_dc_id: ShiftedDcId },
    DestroyerKeyDestroyed { shifted_dc_id: ShiftedDcId, result: DestroyKeyResult },
    CompletedKeyDestroy { shifted_dc_id: ShiftedDcId },

    CheckDelayed,
    DrainGraveyards,
}

/// One-way post channel into the instance, handed to sessions and loaders.
///
/// Holding a handle does not keep the instance alive; posting after teardown
/// is a no-op.
#[derive(Clone)]
pub struct InstanceHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl InstanceHandle {
    pub(crate) fn post(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Deliver a response (or error frame) for one request.
    pub fn exec_callback(&self, request_id: RequestId, response: Vec<u8>) {
        self.post(Event::ExecCallback { request_id, response });
    }

    /// Deliver an out-of-band payload (updates) to the global handler.
    pub fn global_callback(&self, response: Vec<u8>) {
        self.post(Event::GlobalCallback { response });
    }

    /// Drop the callbacks of requests the session gave up on.
    pub fn clear_callbacks_delayed(&self, ids: Vec<CallbackClear>) {
        if !ids.is_empty() {
            self.post(Event::ClearCallbacks { ids });
        }
    }

    pub fn on_state_change(&self, shifted_dc_id: ShiftedDcId, state: i32) {
        self.post(Event::StateChange { shifted_dc_id, state });
    }

    pub fn on_session_reset(&self, shifted_dc_id: ShiftedDcId) {
        self.post(Event::SessionReset { shifted_dc_id });
    }

    /// The session negotiated (or lost) the persistent key of a DC.
    pub fn dc_persistent_key_changed(&self, dc_id: DcId, key: Option<AuthKeyPtr>) {
        self.post(Event::PersistentKeyChanged { dc_id, key });
    }

    /// The session rotated the temporary key of a DC.
    pub fn dc_temporary_key_changed(&self, dc_id: DcId) {
        self.post(Event::TemporaryKeyChanged { dc_id });
    }

    /// The server reported the key as destroyed.
    pub fn key_destroyed_on_server(&self, shifted_dc_id: ShiftedDcId, key_id: u64) {
        self.post(Event::KeyDestroyedOnServer { shifted_dc_id, key_id });
    }
}

// ─── Instance ─────────────────────────────────────────────────────────────────

/// The dispatch core. Cheap to clone; the last clone tears everything down
/// in order (loaders, request table, sessions, main reference).
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    mode: Mode,
    clock: Clock,
    device_model: String,
    system_version: String,

    dc_options: Arc<dyn DcOptions>,
    session_factory: Arc<dyn SessionFactory>,
    codec: Arc<dyn Codec>,
    config_loader: Arc<dyn ConfigLoader>,
    domain_resolver: Arc<dyn DomainResolver>,
    unixtime: Arc<dyn Unixtime>,
    settings: Arc<dyn SettingsSink>,
    key_store: Arc<dyn KeyStoreSink>,
    language: Arc<dyn LanguageSink>,
    authorization: Arc<dyn AuthorizationState>,

    requests: RequestTable,
    main: Mutex<MainState>,

    global_handlers: Mutex<ResponseHandlers>,
    state_changed_handler: Mutex<Option<StateChangedHandler>>,
    session_reset_handler: Mutex<Option<SessionResetHandler>>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    temporary_key_changed: broadcast::Sender<DcId>,
    all_keys_destroyed: broadcast::Sender<()>,
}

/// State the original owned on its main thread. One short-held lock; internal
/// operations thread `&mut MainState` through instead of re-locking.
struct MainState {
    main_dc_id: DcId,
    main_dc_id_forced: bool,
    main_session: Option<Arc<dyn Session>>,
    sessions: HashMap<ShiftedDcId, Arc<dyn Session>>,
    sessions_to_destroy: Vec<Arc<dyn Session>>,
    dcenters: HashMap<ShiftedDcId, Arc<Dcenter>>,
    dcenters_to_destroy: Vec<Arc<Dcenter>>,
    keys_for_write: HashMap<ShiftedDcId, AuthKeyPtr>,

    auth_export_requests: HashMap<RequestId, ShiftedDcId>,
    auth_waiters: HashMap<DcId, Vec<RequestId>>,
    bad_guest_dc_requests: HashSet<RequestId>,
    delayed: DelayedQueue,
    logout_guest_request_ids: HashMap<ShiftedDcId, RequestId>,

    config_load: Option<JoinHandle<()>>,
    unixtime_load: Option<JoinHandle<()>>,
    resolving_domains: HashSet<String>,
    cdn_config_request_id: RequestId,
    last_config_loaded_at: u64,
    config_expires_at: u64,
    user_phone: String,
}

enum ErrorDecision {
    /// The core owns the retry; keep the handlers registered.
    Handled,
    /// Surface to the caller; optionally notify the global fail handler
    /// first (unauthorized on the main DC).
    NotHandled { surface_to_global: bool },
}

impl Instance {
    /// Build and start an instance: seed keys, pin the main DC, start the
    /// main session (or, in destroyer mode, one session per seeded key with
    /// its destruction scheduled).
    ///
    /// The initial config fetch begins when [`run`](Self::run) starts.
    pub fn new(mode: Mode, config: InstanceConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (temporary_key_changed, _) = broadcast::channel(64);
        let (all_keys_destroyed, _) = broadcast::channel(4);

        let inner = Arc::new(InstanceInner {
            mode,
            clock: Clock::new(),
            device_model: config.device_model,
            system_version: config.system_version,
            dc_options: config.dc_options,
            session_factory: config.session_factory,
            codec: config.codec,
            config_loader: config.config_loader,
            domain_resolver: config.domain_resolver,
            unixtime: config.unixtime,
            settings: config.settings,
            key_store: config.key_store,
            language: config.language,
            authorization: config.authorization,
            requests: RequestTable::new(),
            main: Mutex::new(MainState {
                main_dc_id: NONE_MAIN_DC,
                main_dc_id_forced: false,
                main_session: None,
                sessions: HashMap::new(),
                sessions_to_destroy: Vec::new(),
                dcenters: HashMap::new(),
                dcenters_to_destroy: Vec::new(),
                keys_for_write: HashMap::new(),
                auth_export_requests: HashMap::new(),
                auth_waiters: HashMap::new(),
                bad_guest_dc_requests: HashSet::new(),
                delayed: DelayedQueue::new(),
                logout_guest_request_ids: HashMap::new(),
                config_load: None,
                unixtime_load: None,
                resolving_domains: HashSet::new(),
                cdn_config_request_id: 0,
                last_config_loaded_at: 0,
                config_expires_at: 0,
                user_phone: String::new(),
            }),
            global_handlers: Mutex::new(ResponseHandlers::none()),
            state_changed_handler: Mutex::new(None),
            session_reset_handler: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            temporary_key_changed,
            all_keys_destroyed,
        });

        {
            let mut state = inner.main.lock().unwrap();
            for key in config.keys {
                let mut shifted_dc_id = key.dc_id();
                if inner.is_keys_destroyer() {
                    // Several keys may exist for one DC while destroying
                    // them; each gets its own shifted slot.
                    shifted_dc_id = destroy_key_next_dc_id(shifted_dc_id);
                    while state.keys_for_write.contains_key(&shifted_dc_id) {
                        shifted_dc_id = destroy_key_next_dc_id(shifted_dc_id);
                    }
                }
                state.keys_for_write.insert(shifted_dc_id, key.clone());
                inner.add_dc_locked(&mut state, shifted_dc_id, Some(key));
            }

            state.main_dc_id = match (mode, config.main_dc_id) {
                (Mode::KeysDestroyer, _) => NONE_MAIN_DC,
                (Mode::Normal, Some(dc_id)) => {
                    state.main_dc_id_forced = true;
                    dc_id
                }
                (Mode::Normal, None) => DEFAULT_MAIN_DC,
            };

            if inner.is_keys_destroyer() {
                let seeded: Vec<ShiftedDcId> = state.dcenters.keys().copied().collect();
                for shifted_dc_id in seeded {
                    inner.start_session_locked(&mut state, shifted_dc_id);
                }
            } else if state.main_dc_id != NONE_MAIN_DC {
                let main_dc_id = state.main_dc_id;
                let session = inner.start_session_locked(&mut state, main_dc_id);
                state.main_session = Some(session);
            }
        }

        Self { inner }
    }

    /// The post channel for sessions and loaders.
    pub fn handle(&self) -> InstanceHandle {
        self.inner.handle()
    }

    /// Drive the instance: apply posted events and fire the delayed-request
    /// timer. Spawn this once; abort the task to shut the instance down.
    pub async fn run(&self) {
        let mut rx = match self.inner.events_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                log::warn!("[instance] run() called twice, ignoring");
                return;
            }
        };

        self.request_config();

        loop {
            let next_due = self.inner.main.lock().unwrap().delayed.next_due();
            let event = match next_due {
                Some(due) => {
                    tokio::select! {
                        event = rx.recv() => event,
                        _ = tokio::time::sleep_until(self.inner.clock.at(due)) => {
                            let mut state = self.inner.main.lock().unwrap();
                            self.inner.check_delayed_requests_locked(&mut state);
                            continue;
                        }
                    }
                }
                None => rx.recv().await,
            };
            match event {
                Some(event) => self.inner.handle_event(event),
                None => break,
            }
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// File a serialized request and hand it to the right session. Returns
    /// the request id used for [`cancel`](Self::cancel) / [`state`](Self::state)
    /// and echoed to the handlers.
    pub fn send(
        &self,
        request: SerializedRequest,
        handlers: ResponseHandlers,
        options: SendOptions,
    ) -> RequestId {
        let mut state = self.inner.main.lock().unwrap();
        self.inner.send_locked(&mut state, request, handlers, options)
    }

    /// Ask the session of a shifted DC to flush whatever it has queued.
    pub fn send_anything(&self, shifted_dc_id: ShiftedDcId, ms_can_wait: u64) {
        let mut state = self.inner.main.lock().unwrap();
        let session = self.inner.get_session_locked(&mut state, shifted_dc_id);
        session.send_anything(ms_can_wait);
    }

    /// Forget a request entirely: routing, payload, callbacks, and ask the
    /// session to cancel it server-side. Idempotent; after this returns no
    /// handler for the id will run.
    pub fn cancel(&self, request_id: RequestId) {
        if request_id == 0 {
            return;
        }
        log::debug!("[instance] cancel request {request_id}");
        let shifted_dc_id = self.inner.requests.routing(request_id);
        let msg_id = self
            .inner
            .requests
            .remove_payload(request_id)
            .map(|request| request.msg_id())
            .unwrap_or(0);
        self.inner.requests.unregister(request_id);
        if let Some(shifted_dc_id) = shifted_dc_id {
            let mut state = self.inner.main.lock().unwrap();
            let session = self.inner.get_session_locked(&mut state, shifted_dc_id.abs());
            session.cancel(request_id, msg_id);
        }
        self.inner.clear_callbacks(request_id, 0);
    }

    /// State of one request (positive id), or of the main session of DC
    /// `|id|` for a negative id. Negative results mean "waiting for that many
    /// milliseconds".
    pub fn state(&self, request_id: RequestId) -> i32 {
        if request_id > 0 {
            if let Some(shifted_dc_id) = self.inner.requests.routing(request_id) {
                let mut state = self.inner.main.lock().unwrap();
                let session = self.inner.get_session_locked(&mut state, shifted_dc_id.abs());
                return session.request_state(request_id);
            }
            return REQUEST_SENT;
        }
        let mut state = self.inner.main.lock().unwrap();
        let session = self.inner.get_session_locked(&mut state, -request_id);
        session.request_state(0)
    }

    /// Connection state of the session for a shifted DC (`0` = main).
    pub fn dc_state(&self, shifted_dc_id: ShiftedDcId) -> i32 {
        let state = self.inner.main.lock().unwrap();
        match self.inner.find_normalized_session(&state, shifted_dc_id) {
            Some(session) => session.request_state(0),
            None => DISCONNECTED_STATE,
        }
    }

    /// Transport tag of the session for a shifted DC, empty when absent.
    pub fn dc_transport(&self, shifted_dc_id: ShiftedDcId) -> String {
        let state = self.inner.main.lock().unwrap();
        match self.inner.find_normalized_session(&state, shifted_dc_id) {
            Some(session) => session.transport(),
            None => String::new(),
        }
    }

    /// Ping the main session.
    pub fn ping(&self) {
        let mut state = self.inner.main.lock().unwrap();
        let session = self.inner.get_session_locked(&mut state, 0);
        session.ping();
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Reconnect every session.
    pub fn restart(&self) {
        let state = self.inner.main.lock().unwrap();
        for session in state.sessions.values() {
            session.restart();
        }
    }

    /// Reconnect every session of one bare DC.
    pub fn restart_dc(&self, shifted_dc_id: ShiftedDcId) {
        let state = self.inner.main.lock().unwrap();
        let dc_id = bare_dc_id(shifted_dc_id);
        for (&shifted, session) in &state.sessions {
            if bare_dc_id(shifted) == dc_id {
                session.restart();
            }
        }
    }

    /// Resend the connection-init wrapper on every session of one bare DC.
    pub fn re_init_connection(&self, dc_id: DcId) {
        let state = self.inner.main.lock().unwrap();
        for (&shifted, session) in &state.sessions {
            if bare_dc_id(shifted) == dc_id {
                session.re_init_connection();
            }
        }
    }

    /// Terminate the session of a shifted DC. Killing the main session
    /// starts a fresh one for the current main DC.
    pub fn kill_session(&self, shifted_dc_id: ShiftedDcId) {
        let mut state = self.inner.main.lock().unwrap();
        self.inner.kill_session_locked(&mut state, shifted_dc_id);
    }

    /// Pause a non-main session. The main session cannot be stopped.
    pub fn stop_session(&self, shifted_dc_id: ShiftedDcId) {
        let state = self.inner.main.lock().unwrap();
        if let Some(session) = state.sessions.get(&shifted_dc_id) {
            let is_main = state
                .main_session
                .as_ref()
                .is_some_and(|main| Arc::ptr_eq(main, session));
            if !is_main {
                session.stop();
            }
        }
    }

    /// The app returned to the foreground; let sessions flush paused work.
    pub fn unpaused(&self) {
        let state = self.inner.main.lock().unwrap();
        for session in state.sessions.values() {
            session.unpaused();
        }
    }

    // ── Main DC ──────────────────────────────────────────────────────────────

    /// Bare id of the current main DC (`0` in destroyer mode).
    pub fn main_dc_id(&self) -> DcId {
        self.inner.main.lock().unwrap().main_dc_id
    }

    /// Force the main DC. Requires a main session; kills the old main
    /// session when the DC actually changes and persists the choice.
    pub fn set_main_dc_id(&self, dc_id: DcId) {
        let mut state = self.inner.main.lock().unwrap();
        self.inner.set_main_dc_id_locked(&mut state, dc_id);
    }

    /// Like [`set_main_dc_id`](Self::set_main_dc_id), unless a forced choice
    /// already exists.
    pub fn suggest_main_dc_id(&self, dc_id: DcId) {
        let mut state = self.inner.main.lock().unwrap();
        if state.main_dc_id_forced {
            return;
        }
        self.inner.set_main_dc_id_locked(&mut state, dc_id);
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    /// Snapshot of the persistent-key registry for persistence.
    pub fn get_keys_for_write(&self) -> Vec<AuthKeyPtr> {
        let state = self.inner.main.lock().unwrap();
        state.keys_for_write.values().cloned().collect()
    }

    /// Seed more keys into a running destroyer instance.
    pub fn add_keys_for_destroy(&self, keys: Vec<AuthKeyPtr>) {
        if !self.inner.is_keys_destroyer() {
            log::error!("[instance] add_keys_for_destroy called on a normal instance");
            return;
        }
        let mut state = self.inner.main.lock().unwrap();
        for key in keys {
            let mut shifted_dc_id = destroy_key_next_dc_id(key.dc_id());
            while state.keys_for_write.contains_key(&shifted_dc_id) {
                shifted_dc_id = destroy_key_next_dc_id(shifted_dc_id);
            }
            state.keys_for_write.insert(shifted_dc_id, key.clone());
            self.inner.add_dc_locked(&mut state, shifted_dc_id, Some(key));
            self.inner.start_session_locked(&mut state, shifted_dc_id);
        }
    }

    /// Stream of "temporary key changed" notifications, one DC id per event.
    pub fn temporary_key_changed(&self) -> broadcast::Receiver<DcId> {
        self.inner.temporary_key_changed.subscribe()
    }

    /// Fires once the destroyer has finished with every seeded key.
    pub fn all_keys_destroyed(&self) -> broadcast::Receiver<()> {
        self.inner.all_keys_destroyed.subscribe()
    }

    /// A session observed its key as possibly destroyed server-side; finish
    /// the destroyer bookkeeping for that shifted DC.
    pub fn key_was_possibly_destroyed(&self, shifted_dc_id: ShiftedDcId) {
        log::info!(
            "[instance] assuming key {shifted_dc_id} destroyed on server"
        );
        self.inner.post(Event::CompletedKeyDestroy { shifted_dc_id });
    }

    // ── Config ───────────────────────────────────────────────────────────────

    /// Kick off a config load unless one is already running.
    pub fn request_config(&self) {
        let mut state = self.inner.main.lock().unwrap();
        self.inner.request_config_locked(&mut state);
    }

    /// Reload the config if the last load is older than the refresh window
    /// (8 s in blocked mode, 120 s otherwise).
    pub fn request_config_if_old(&self) {
        let timeout = if self.inner.settings.blocked_mode() {
            CONFIG_BECOMES_OLD_FOR_BLOCKED_IN_MS
        } else {
            CONFIG_BECOMES_OLD_IN_MS
        };
        let mut state = self.inner.main.lock().unwrap();
        if self.inner.clock.now().saturating_sub(state.last_config_loaded_at) >= timeout {
            self.inner.request_config_locked(&mut state);
        }
    }

    /// Fetch CDN public keys; at most one request at a time, and only when a
    /// main DC exists.
    pub fn request_cdn_config(&self) {
        let mut state = self.inner.main.lock().unwrap();
        if state.cdn_config_request_id != 0 || state.main_dc_id == NONE_MAIN_DC {
            return;
        }
        let payload = self.inner.codec.get_cdn_config();
        let codec = self.inner.codec.clone();
        let handle = self.inner.handle();
        let fail_handle = self.inner.handle();
        let handlers = ResponseHandlers::none()
            .with_done(move |_, bytes| match codec.parse_cdn_config(bytes) {
                Some(config) => {
                    handle.post(Event::CdnConfigLoaded { config });
                    true
                }
                None => false,
            })
            .with_fail(move |_, _| {
                fail_handle.post(Event::CdnConfigFailed);
                true
            });
        let request_id = self.inner.send_locked(
            &mut state,
            SerializedRequest::new(payload),
            handlers,
            SendOptions::default(),
        );
        state.cdn_config_request_id = request_id;
    }

    /// Phone number hint passed to the config loader.
    pub fn set_user_phone(&self, phone: &str) {
        let mut state = self.inner.main.lock().unwrap();
        if state.user_phone != phone {
            state.user_phone = phone.to_string();
        }
    }

    /// The server rejected our configuration outright.
    pub fn bad_configuration_error(&self) {
        if self.inner.mode == Mode::Normal {
            self.inner.settings.bad_configuration_error();
        }
    }

    /// Refresh unix time over HTTP unless a valid value or a running load
    /// already exists.
    pub fn sync_http_unixtime(&self) {
        let mut state = self.inner.main.lock().unwrap();
        if self.inner.unixtime.http_valid() || state.unixtime_load.is_some() {
            return;
        }
        let future = self.inner.unixtime.load_http();
        let handle = self.inner.handle();
        state.unixtime_load = Some(tokio::spawn(async move {
            future.await;
            handle.post(Event::UnixtimeLoaded);
        }));
    }

    /// Resolve a proxy hostname out-of-band; one resolution per host.
    pub fn resolve_proxy_domain(&self, host: &str) {
        let mut state = self.inner.main.lock().unwrap();
        if !state.resolving_domains.insert(host.to_string()) {
            return;
        }
        let future = self.inner.domain_resolver.resolve(host.to_string());
        let handle = self.inner.handle();
        let host = host.to_string();
        tokio::spawn(async move {
            let resolved = future.await;
            handle.post(Event::DomainResolved { host, resolved });
        });
    }

    /// Promote a proven-good proxy IP.
    pub fn set_good_proxy_domain(&self, host: &str, ip: &str) {
        self.inner.settings.set_good_proxy_domain(host, ip);
    }

    // ── Logout ───────────────────────────────────────────────────────────────

    /// Log the account out: `auth.logOut` on the main DC (calling `done` when
    /// it completes either way), plus a log-out of every guest DC with a key.
    pub fn logout(&self, done: impl FnOnce() + Send + 'static) {
        let slot = Arc::new(Mutex::new(Some(Box::new(done) as Box<dyn FnOnce() + Send>)));
        let done_slot = slot.clone();
        let fail_slot = slot;
        let handlers = ResponseHandlers::none()
            .with_done(move |_, _| {
                if let Some(done) = done_slot.lock().unwrap().take() {
                    done();
                }
                true
            })
            .with_fail(move |_, _| {
                if let Some(done) = fail_slot.lock().unwrap().take() {
                    done();
                }
                true
            });
        let payload = self.inner.codec.log_out();
        let mut state = self.inner.main.lock().unwrap();
        self.inner.send_locked(
            &mut state,
            SerializedRequest::new(payload),
            handlers,
            SendOptions::default(),
        );
        self.inner.logout_guest_dcs_locked(&mut state);
    }

    // ── Handlers ─────────────────────────────────────────────────────────────

    /// Receiver of out-of-band payloads (updates). Invoked with request id 0.
    pub fn set_updates_handler(
        &self,
        on_done: impl Fn(RequestId, &[u8]) -> bool + Send + Sync + 'static,
    ) {
        self.inner.global_handlers.lock().unwrap().on_done = Some(Arc::new(on_done));
    }

    /// Receiver of errors with no surviving per-request handler (e.g.
    /// unauthorized on the main DC).
    pub fn set_global_fail_handler(
        &self,
        on_fail: impl Fn(RequestId, &RpcError) -> bool + Send + Sync + 'static,
    ) {
        self.inner.global_handlers.lock().unwrap().on_fail = Some(Arc::new(on_fail));
    }

    pub fn set_state_changed_handler(
        &self,
        handler: impl Fn(ShiftedDcId, i32) + Send + Sync + 'static,
    ) {
        *self.inner.state_changed_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn set_session_reset_handler(&self, handler: impl Fn(ShiftedDcId) + Send + Sync + 'static) {
        *self.inner.session_reset_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn clear_global_handlers(&self) {
        *self.inner.global_handlers.lock().unwrap() = ResponseHandlers::none();
        *self.inner.state_changed_handler.lock().unwrap() = None;
        *self.inner.session_reset_handler.lock().unwrap() = None;
    }

    /// Whether a request still has registered callbacks.
    pub fn has_callbacks(&self, request_id: RequestId) -> bool {
        self.inner.requests.has_handlers(request_id)
    }

    /// Route an error for a request through the policy engine and, when it is
    /// not consumed there, the given fail handler. Returns `true` when the
    /// request data should be cleaned up.
    pub fn rpc_error_occured(
        &self,
        request_id: RequestId,
        handlers: &ResponseHandlers,
        error: &RpcError,
    ) -> bool {
        self.inner.rpc_error_occured(request_id, handlers, error)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn is_keys_destroyer(&self) -> bool {
        self.inner.is_keys_destroyer()
    }

    pub fn device_model(&self) -> &str {
        &self.inner.device_model
    }

    pub fn system_version(&self) -> &str {
        &self.inner.system_version
    }

    pub fn dc_options(&self) -> Arc<dyn DcOptions> {
        self.inner.dc_options.clone()
    }

    /// Number of requests with known routing (diagnostics).
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_requests()
    }

    /// Number of requests with registered handlers (diagnostics).
    pub fn pending_handlers(&self) -> usize {
        self.inner.requests.pending_handlers()
    }
}

// ─── Core ─────────────────────────────────────────────────────────────────────

impl InstanceInner {
    fn is_keys_destroyer(&self) -> bool {
        self.mode == Mode::KeysDestroyer
    }

    fn handle(&self) -> InstanceHandle {
        InstanceHandle { tx: self.events_tx.clone() }
    }

    fn post(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }

    /// Schedule an event for later; the driver applies it.
    fn call_delayed(&self, after_ms: u64, event: Event) {
        let handle = self.handle();
        let deadline = self.clock.at(self.clock.now() + after_ms);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            handle.post(event);
        });
    }

    fn handle_event(&self, event: Event) {
        match event {
            Event::ExecCallback { request_id, response } => {
                self.exec_callback(request_id, &response);
            }
            Event::GlobalCallback { response } => self.global_callback(&response),
            Event::ClearCallbacks { ids } => {
                for clear in ids {
                    log::debug!(
                        "[instance] clearing delayed callback {}, error code {}",
                        clear.request_id,
                        clear.error_code
                    );
                    self.clear_callbacks(clear.request_id, clear.error_code);
                    self.requests.unregister(clear.request_id);
                }
            }
            Event::StateChange { shifted_dc_id, state } => {
                let handler = self.state_changed_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(shifted_dc_id, state);
                }
            }
            Event::SessionReset { shifted_dc_id } => {
                let handler = self.session_reset_handler.lock().unwrap().clone();
                if let Some(handler) = handler {
                    handler(shifted_dc_id);
                }
            }
            Event::PersistentKeyChanged { dc_id, key } => {
                let mut state = self.main.lock().unwrap();
                self.persistent_key_changed_locked(&mut state, dc_id, key);
            }
            Event::TemporaryKeyChanged { dc_id } => {
                let _ = self.temporary_key_changed.send(dc_id);
            }
            Event::KeyDestroyedOnServer { shifted_dc_id, key_id } => {
                let mut state = self.main.lock().unwrap();
                self.key_destroyed_on_server_locked(&mut state, shifted_dc_id, key_id);
            }
            Event::AuthExported { request_id, exported } => {
                let mut state = self.main.lock().unwrap();
                self.auth_exported_locked(&mut state, request_id, exported);
            }
            Event::AuthExportFailed { request_id } => {
                let mut state = self.main.lock().unwrap();
                if let Some(target) = state.auth_export_requests.remove(&request_id) {
                    if let Some(waiters) = state.auth_waiters.get_mut(&bare_dc_id(target)) {
                        waiters.clear();
                    }
                }
            }
            Event::AuthImported { dc_id } => {
                let mut state = self.main.lock().unwrap();
                self.auth_imported_locked(&mut state, dc_id);
            }
            Event::ConfigLoaded { config } => self.config_loaded(config),
            Event::ConfigLoadFailed { error } => {
                self.main.lock().unwrap().config_load = None;
                if !error.is_default_handled() {
                    log::error!("[instance] failed to get config: {error}");
                }
            }
            Event::ConfigExpiryCheck => {
                let mut state = self.main.lock().unwrap();
                self.request_config_if_expired_locked(&mut state);
            }
            Event::CdnConfigLoaded { config } => {
                self.main.lock().unwrap().cdn_config_request_id = 0;
                self.dc_options.set_cdn_config(config);
                self.settings.write_settings();
            }
            Event::CdnConfigFailed => {
                self.main.lock().unwrap().cdn_config_request_id = 0;
            }
            Event::UnixtimeLoaded => {
                self.main.lock().unwrap().unixtime_load = None;
            }
            Event::DomainResolved { host, resolved } => {
                self.main.lock().unwrap().resolving_domains.remove(&host);
                if let Some(resolved) = resolved {
                    let affected = self.settings.apply_resolved_domain(
                        &host,
                        &resolved.ips,
                        resolved.expire_at_ms,
                    );
                    if affected {
                        let state = self.main.lock().unwrap();
                        for session in state.sessions.values() {
                            session.refresh_options();
                        }
                    }
                }
            }
            Event::LogoutGuestDone { request_id } => {
                let mut state = self.main.lock().unwrap();
                let found = state
                    .logout_guest_request_ids
                    .iter()
                    .find(|&(_, &id)| id == request_id)
                    .map(|(&shifted, _)| shifted);
                if let Some(shifted_dc_id) = found {
                    state.logout_guest_request_ids.remove(&shifted_dc_id);
                    self.kill_session_locked(&mut state, shifted_dc_id);
                }
            }
            Event::DestroyerLogout { shifted_dc_id } => {
                let mut state = self.main.lock().unwrap();
                self.perform_key_destroy_locked(&mut state, shifted_dc_id);
            }
            Event::DestroyerKeyDestroyed { shifted_dc_id, result } => {
                let mut state = self.main.lock().unwrap();
                match result {
                    DestroyKeyResult::Ok => {
                        log::info!("[instance] key {shifted_dc_id} destroyed");
                    }
                    DestroyKeyResult::None => {
                        log::info!("[instance] key {shifted_dc_id} already destroyed");
                    }
                    DestroyKeyResult::Fail => {
                        log::error!(
                            "[instance] key {shifted_dc_id} destruction fail, leave it for now"
                        );
                        self.kill_session_locked(&mut state, shifted_dc_id);
                    }
                }
                drop(state);
                self.post(Event::CompletedKeyDestroy { shifted_dc_id });
            }
            Event::CompletedKeyDestroy { shifted_dc_id } => {
                let mut state = self.main.lock().unwrap();
                self.completed_key_destroy_locked(&mut state, shifted_dc_id);
            }
            Event::CheckDelayed => {
                let mut state = self.main.lock().unwrap();
                self.check_delayed_requests_locked(&mut state);
            }
            Event::DrainGraveyards => {
                let mut state = self.main.lock().unwrap();
                state.sessions_to_destroy.clear();
                state.dcenters_to_destroy.clear();
            }
        }
    }

    // ── DC blocks ────────────────────────────────────────────────────────────

    fn add_dc_locked(
        &self,
        state: &mut MainState,
        shifted_dc_id: ShiftedDcId,
        key: Option<AuthKeyPtr>,
    ) -> Arc<Dcenter> {
        let dc = Dcenter::new(bare_dc_id(shifted_dc_id), key);
        state.dcenters.insert(shifted_dc_id, dc.clone());
        dc
    }

    fn remove_dc_locked(&self, state: &mut MainState, shifted_dc_id: ShiftedDcId) {
        if let Some(dc) = state.dcenters.remove(&shifted_dc_id) {
            state.dcenters_to_destroy.push(dc);
        }
    }

    /// Find or create the DC block for a shifted id, resolving temporary
    /// bare ids to their real DC first.
    fn get_dc_by_id_locked(&self, state: &mut MainState, shifted_dc_id: ShiftedDcId) -> Arc<Dcenter> {
        if let Some(dc) = state.dcenters.get(&shifted_dc_id) {
            return dc.clone();
        }
        let bare = bare_dc_id(shifted_dc_id);
        let dc_id = real_dc_id_from_temporary(bare).unwrap_or(bare);
        if dc_id != shifted_dc_id {
            if let Some(dc) = state.dcenters.get(&dc_id) {
                return dc.clone();
            }
        }
        self.add_dc_locked(state, dc_id, None)
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    fn start_session_locked(
        &self,
        state: &mut MainState,
        shifted_dc_id: ShiftedDcId,
    ) -> Arc<dyn Session> {
        assert!(bare_dc_id(shifted_dc_id) != 0, "session needs a concrete DC");

        let dc = self.get_dc_by_id_locked(state, shifted_dc_id);
        let session = self.session_factory.create(shifted_dc_id, dc, self.handle());
        state.sessions.insert(shifted_dc_id, session.clone());
        session.start();
        if self.is_keys_destroyer() {
            self.schedule_key_destroy_locked(state, shifted_dc_id);
        }
        session
    }

    fn remove_session_locked(
        &self,
        state: &mut MainState,
        shifted_dc_id: ShiftedDcId,
    ) -> Option<Arc<dyn Session>> {
        let session = state.sessions.remove(&shifted_dc_id)?;
        session.kill();
        state.sessions_to_destroy.push(session.clone());
        Some(session)
    }

    fn kill_session_locked(&self, state: &mut MainState, shifted_dc_id: ShiftedDcId) {
        let was_main = match self.remove_session_locked(state, shifted_dc_id) {
            Some(removed) => state
                .main_session
                .as_ref()
                .is_some_and(|main| Arc::ptr_eq(main, &removed)),
            None => false,
        };
        if was_main {
            // A stray non-main session for the new main DC would shadow the
            // fresh one; drop it first.
            let main_dc_id = state.main_dc_id;
            self.remove_session_locked(state, main_dc_id);
            let session = self.start_session_locked(state, main_dc_id);
            state.main_session = Some(session);
        }
        self.post(Event::DrainGraveyards);
    }

    /// Resolve a shifted DC to its session, starting one if needed. `0` means
    /// the main session; a bare id of `0` applies the shift to the main DC.
    fn get_session_locked(
        &self,
        state: &mut MainState,
        shifted_dc_id: ShiftedDcId,
    ) -> Arc<dyn Session> {
        let mut shifted_dc_id = shifted_dc_id;
        if shifted_dc_id == 0 {
            return state
                .main_session
                .clone()
                .expect("no main session for a main-DC request");
        } else if bare_dc_id(shifted_dc_id) == 0 {
            let main = state
                .main_session
                .as_ref()
                .expect("no main session to apply a shift to");
            shifted_dc_id += bare_dc_id(main.dc_with_shift());
        }
        if let Some(session) = state.sessions.get(&shifted_dc_id) {
            return session.clone();
        }
        self.start_session_locked(state, shifted_dc_id)
    }

    /// Like `get_session_locked` but read-only: no session is started.
    fn find_normalized_session(
        &self,
        state: &MainState,
        shifted_dc_id: ShiftedDcId,
    ) -> Option<Arc<dyn Session>> {
        if shifted_dc_id == 0 {
            return state.main_session.clone();
        }
        let mut shifted_dc_id = shifted_dc_id;
        if bare_dc_id(shifted_dc_id) == 0 {
            let main = state.main_session.as_ref()?;
            shifted_dc_id += bare_dc_id(main.dc_with_shift());
        }
        state.sessions.get(&shifted_dc_id).cloned()
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    fn send_locked(
        &self,
        state: &mut MainState,
        request: SerializedRequest,
        handlers: ResponseHandlers,
        options: SendOptions,
    ) -> RequestId {
        let mut request_id = next_request_id();
        // After an allocator wrap an id may still be live in the table.
        while self.requests.is_live(request_id) {
            request_id = next_request_id();
        }

        let session = self.get_session_locked(state, options.shifted_dc_id);
        let to_main_dc = options.shifted_dc_id == 0;
        let real_shifted_dc_id = session.dc_with_shift();
        let signed_dc_id = if to_main_dc { -real_shifted_dc_id } else { real_shifted_dc_id };

        let after = (options.after != 0 && self.requests.has_payload(options.after))
            .then_some(options.after);
        let prepared =
            request.prepared(request_id, options.needs_layer, after, self.clock.now());

        self.requests.store(request_id, prepared.clone(), handlers);
        self.requests.register(request_id, signed_dc_id);
        session.send_prepared(&prepared, options.ms_can_wait);
        request_id
    }

    // ── Callbacks ────────────────────────────────────────────────────────────

    fn exec_callback(&self, request_id: RequestId, response: &[u8]) {
        let Some(handlers) = self.requests.take_handlers(request_id) else {
            log::debug!("[instance] no parser found for request {request_id}");
            self.requests.unregister(request_id);
            return;
        };
        log::debug!("[instance] parsing response for request {request_id}");

        let handle_error = |error: RpcError| {
            log::debug!(
                "[instance] error received, code {}, type {}: {}",
                error.code,
                error.name,
                error.description
            );
            if self.rpc_error_occured(request_id, &handlers, &error) {
                self.requests.unregister(request_id);
            } else {
                self.requests.put_handlers(request_id, handlers.clone());
            }
        };

        if response.is_empty() {
            handle_error(RpcError::response_parse_failed("empty response"));
        } else if RpcError::is_error_frame(response) {
            match RpcError::from_wire(response) {
                Some(error) => handle_error(error),
                None => handle_error(RpcError::response_parse_failed("error parse failed")),
            }
        } else {
            if let Some(on_done) = &handlers.on_done {
                if !on_done(request_id, response) {
                    handle_error(RpcError::response_parse_failed("response parse failed"));
                    return;
                }
            }
            self.requests.unregister(request_id);
        }
    }

    fn global_callback(&self, response: &[u8]) {
        let on_done = self.global_handlers.lock().unwrap().on_done.clone();
        if let Some(on_done) = on_done {
            on_done(0, response);
        }
    }

    fn clear_callbacks(&self, request_id: RequestId, error_code: i32) {
        let Some(handlers) = self.requests.take_handlers(request_id) else {
            return;
        };
        if error_code != 0 {
            log::error!(
                "[instance] callbacks cleared without handling! request {request_id}, error code {error_code}"
            );
            self.rpc_error_occured(
                request_id,
                &handlers,
                &RpcError::clear_callback(request_id, error_code),
            );
        }
    }

    fn rpc_error_occured(
        &self,
        request_id: RequestId,
        handlers: &ResponseHandlers,
        error: &RpcError,
    ) -> bool {
        if error.is_default_handled() {
            if let Some(on_fail) = &handlers.on_fail {
                if on_fail(request_id, error) {
                    return true;
                }
            }
        }

        let decision = {
            let mut state = self.main.lock().unwrap();
            self.on_error_default_locked(&mut state, request_id, error)
        };
        match decision {
            ErrorDecision::Handled => false,
            ErrorDecision::NotHandled { surface_to_global } => {
                if surface_to_global {
                    let global_fail = self.global_handlers.lock().unwrap().on_fail.clone();
                    if let Some(on_fail) = global_fail {
                        on_fail(request_id, error);
                    }
                }
                log::error!("[instance] request {request_id} failed: {error}");
                if let Some(on_fail) = &handlers.on_fail {
                    on_fail(request_id, error);
                }
                true
            }
        }
    }

    // ── Error policy engine ──────────────────────────────────────────────────

    fn on_error_default_locked(
        &self,
        state: &mut MainState,
        request_id: RequestId,
        error: &RpcError,
    ) -> ErrorDecision {
        const NOT_HANDLED: ErrorDecision = ErrorDecision::NotHandled { surface_to_global: false };
        let code = error.code;
        let bad_guest_dc = code == 400 && error.is("FILE_ID_INVALID");

        if let Some(target_dc) = error.migrate_target() {
            if request_id == 0 {
                return NOT_HANDLED;
            }
            let Some(dc_with_shift) = self.requests.routing(request_id) else {
                log::error!(
                    "[instance] could not find request {request_id} for migrating to {target_dc}"
                );
                return NOT_HANDLED;
            };
            log::debug!(
                "[instance] changing request {request_id} from dc {dc_with_shift} to dc {target_dc}"
            );
            let new_dc_with_shift = if dc_with_shift < 0 {
                // Main-DC migration repoints the main session; the account
                // authorization moves with the DC, no export round-trip.
                self.set_main_dc_id_locked(state, target_dc);
                target_dc
            } else {
                shift_dc_id(target_dc, dc_id_shift(dc_with_shift))
            };
            let Some(request) = self.requests.payload(request_id) else {
                log::error!("[instance] could not find request {request_id}");
                return NOT_HANDLED;
            };
            let session = self.get_session_locked(state, new_dc_with_shift);
            self.requests.register(
                request_id,
                if dc_with_shift < 0 { -new_dc_with_shift } else { new_dc_with_shift },
            );
            session.send_prepared(&request, 0);
            return ErrorDecision::Handled;
        }

        if error.is_transient() || error.flood_wait_seconds().is_some() {
            if request_id == 0 {
                return NOT_HANDLED;
            }
            let secs = if error.is_transient() {
                self.requests.next_retry_delay(request_id)
            } else {
                error.flood_wait_seconds().unwrap_or(0)
            };
            let send_at = self.clock.now() + (secs.max(0) as u64) * 1000 + 10;
            state.delayed.insert(request_id, send_at);
            self.check_delayed_requests_locked(state);
            self.post(Event::CheckDelayed);
            return ErrorDecision::Handled;
        }

        if (code == 401 && !error.is("AUTH_KEY_PERM_EMPTY"))
            || (bad_guest_dc && !state.bad_guest_dc_requests.contains(&request_id))
        {
            let dc_with_shift = match self.requests.routing(request_id) {
                Some(shifted) => shifted,
                None => {
                    log::error!(
                        "[instance] unauthorized request {request_id} without dc info"
                    );
                    0
                }
            };
            let new_dc = bare_dc_id(dc_with_shift.abs());
            if new_dc == 0
                || new_dc == state.main_dc_id
                || !self.authorization.is_authorized()
            {
                // Unauthorized on the main DC: the account itself lost its
                // authorization.
                return ErrorDecision::NotHandled { surface_to_global: !bad_guest_dc };
            }

            log::debug!("[instance] importing auth to dc {dc_with_shift}");
            let need_export =
                state.auth_waiters.get(&new_dc).map_or(true, |waiters| waiters.is_empty());
            if need_export {
                let payload = self.codec.export_authorization(new_dc);
                let codec = self.codec.clone();
                let done_handle = self.handle();
                let fail_handle = self.handle();
                let handlers = ResponseHandlers::none()
                    .with_done(move |export_request_id, bytes| {
                        match codec.parse_exported_authorization(bytes) {
                            Some(exported) => {
                                done_handle.post(Event::AuthExported {
                                    request_id: export_request_id,
                                    exported,
                                });
                                true
                            }
                            None => false,
                        }
                    })
                    .with_fail(move |export_request_id, err| {
                        if err.is_default_handled() {
                            return false;
                        }
                        fail_handle
                            .post(Event::AuthExportFailed { request_id: export_request_id });
                        true
                    });
                let export_request_id = self.send_locked(
                    state,
                    SerializedRequest::new(payload),
                    handlers,
                    SendOptions::default(),
                );
                state.auth_export_requests.insert(export_request_id, dc_with_shift.abs());
            }
            let waiters = state.auth_waiters.entry(new_dc).or_default();
            waiters.push(request_id);
            if bad_guest_dc {
                state.bad_guest_dc_requests.insert(request_id);
            }
            return ErrorDecision::Handled;
        }

        if error.is("CONNECTION_NOT_INITED") || error.is("CONNECTION_LAYER_INVALID") {
            let Some(dc_with_shift) = self.requests.routing(request_id) else {
                log::error!(
                    "[instance] could not find request {request_id} for layer re-init"
                );
                return NOT_HANDLED;
            };
            let Some(request) = self.requests.set_needs_layer(request_id) else {
                log::error!("[instance] could not find request {request_id}");
                return NOT_HANDLED;
            };
            let session = self.get_session_locked(state, dc_with_shift.abs());
            session.send_prepared(&request, 0);
            return ErrorDecision::Handled;
        }

        if error.is("CONNECTION_LANG_CODE_INVALID") {
            self.language.reset_to_default();
            // Still surfaced: the request itself failed.
        } else if error.is("MSG_WAIT_FAILED") {
            let Some(request) = self.requests.payload(request_id) else {
                log::error!("[instance] could not find request {request_id}");
                return NOT_HANDLED;
            };
            let Some(after_id) = request.after() else {
                log::error!(
                    "[instance] wait failed for non-dependent request {request_id}"
                );
                return NOT_HANDLED;
            };
            let mut dc_with_shift = 0;
            let mut dependency_cleared = false;
            match self.requests.routing(request_id) {
                Some(shifted) => match self.requests.routing(after_id) {
                    Some(after_shifted) => {
                        dc_with_shift = shifted;
                        if shifted != after_shifted {
                            self.requests.clear_after(request_id);
                            dependency_cleared = true;
                        }
                    }
                    None => log::error!(
                        "[instance] could not find dependent request {after_id} by dc"
                    ),
                },
                None => log::error!("[instance] could not find request {request_id} by dc"),
            }
            if dc_with_shift == 0 {
                return NOT_HANDLED;
            }

            if dependency_cleared {
                let Some(request) = self.requests.set_needs_layer(request_id) else {
                    return NOT_HANDLED;
                };
                let session = self.get_session_locked(state, dc_with_shift.abs());
                session.send_prepared(&request, 0);
            } else {
                let new_dc = bare_dc_id(dc_with_shift.abs());
                let dependency_waiting = state
                    .auth_waiters
                    .get(&new_dc)
                    .is_some_and(|waiters| waiters.contains(&after_id));
                if dependency_waiting {
                    let waiters = state.auth_waiters.entry(new_dc).or_default();
                    if !waiters.contains(&request_id) {
                        waiters.push(request_id);
                    }
                    if state.bad_guest_dc_requests.contains(&after_id) {
                        state.bad_guest_dc_requests.insert(request_id);
                    }
                } else {
                    state.delayed.insert_after(request_id, after_id);
                    self.check_delayed_requests_locked(state);
                    self.post(Event::CheckDelayed);
                }
            }
            return ErrorDecision::Handled;
        }

        if bad_guest_dc {
            state.bad_guest_dc_requests.remove(&request_id);
        }
        NOT_HANDLED
    }

    // ── Delayed requests ─────────────────────────────────────────────────────

    fn check_delayed_requests_locked(&self, state: &mut MainState) {
        let now = self.clock.now();
        while let Some(request_id) = state.delayed.pop_due(now) {
            let Some(dc_with_shift) = self.requests.routing(request_id) else {
                log::error!(
                    "[instance] could not find request dc for delayed resend, request {request_id}"
                );
                continue;
            };
            let Some(request) = self.requests.payload(request_id) else {
                log::debug!("[instance] could not find request {request_id}");
                continue;
            };
            let session = self.get_session_locked(state, dc_with_shift.abs());
            session.send_prepared(&request, 0);
        }
    }

    // ── Auth export / import ─────────────────────────────────────────────────

    fn auth_exported_locked(
        &self,
        state: &mut MainState,
        export_request_id: RequestId,
        exported: ExportedAuthorization,
    ) {
        let Some(target) = state.auth_export_requests.remove(&export_request_id) else {
            // Not logging the user out: this may well be a server-side
            // hiccup around export/import.
            log::error!(
                "[instance] auth export target not found, request {export_request_id}"
            );
            return;
        };
        let target_dc = bare_dc_id(target);
        let payload = self.codec.import_authorization(exported.id, &exported.bytes);
        let handle = self.handle();
        let handlers = ResponseHandlers::none()
            .with_done(move |_, _| {
                handle.post(Event::AuthImported { dc_id: target_dc });
                true
            })
            .with_fail(|_, err| !err.is_default_handled());
        self.send_locked(
            state,
            SerializedRequest::new(payload),
            handlers,
            SendOptions::to_dc(target),
        );
    }

    fn auth_imported_locked(&self, state: &mut MainState, dc_id: DcId) {
        log::debug!("[instance] auth import to dc {dc_id} succeeded");
        let Some(waiters) = state.auth_waiters.remove(&dc_id) else {
            return;
        };
        for waited_request_id in waiters {
            let Some(request) = self.requests.payload(waited_request_id) else {
                log::error!(
                    "[instance] could not find request {waited_request_id} for resending"
                );
                continue;
            };
            let Some(new_shifted) = self.requests.change_routing(waited_request_id, dc_id) else {
                log::error!(
                    "[instance] could not find request {waited_request_id} by dc for resending"
                );
                continue;
            };
            if new_shifted < 0 {
                self.set_main_dc_id_locked(state, dc_id);
            }
            log::debug!(
                "[instance] resending request {waited_request_id} to dc {new_shifted} after auth import"
            );
            let session = self.get_session_locked(state, new_shifted.abs());
            session.send_prepared(&request, 0);
        }
    }

    // ── Main DC ──────────────────────────────────────────────────────────────

    fn set_main_dc_id_locked(&self, state: &mut MainState, dc_id: DcId) {
        if state.main_session.is_none() {
            log::error!("[instance] cannot change the main DC without a main session");
            return;
        }
        state.main_dc_id_forced = true;
        let old_main_dc_id = state
            .main_session
            .as_ref()
            .map(|session| session.dc_with_shift())
            .unwrap_or(NONE_MAIN_DC);
        state.main_dc_id = dc_id;
        if old_main_dc_id != state.main_dc_id {
            self.kill_session_locked(state, old_main_dc_id);
        }
        self.write_key_data_locked(state);
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    fn write_key_data_locked(&self, state: &MainState) {
        self.key_store
            .write_key_data(state.main_dc_id, state.keys_for_write.values().cloned().collect());
    }

    fn persistent_key_changed_locked(
        &self,
        state: &mut MainState,
        dc_id: DcId,
        key: Option<AuthKeyPtr>,
    ) {
        let _ = self.temporary_key_changed.send(dc_id);

        if is_temporary_dc_id(dc_id) {
            return;
        }

        let unchanged = match (&key, state.keys_for_write.get(&dc_id)) {
            (Some(new), Some(existing)) => **new == **existing,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        match key {
            Some(key) => state.keys_for_write.insert(dc_id, key),
            None => state.keys_for_write.remove(&dc_id),
        };
        log::debug!("[instance] writing auth keys, changed by dc {dc_id}");
        self.write_key_data_locked(state);
    }

    fn key_destroyed_on_server_locked(
        &self,
        state: &mut MainState,
        shifted_dc_id: ShiftedDcId,
        key_id: u64,
    ) {
        log::info!("[instance] destroying key for dc {shifted_dc_id}");
        let dc_id = bare_dc_id(shifted_dc_id);
        if let Some(dc) = state.dcenters.get(&dc_id).cloned() {
            if dc.destroy_confirmed_forgotten_key(key_id) {
                log::info!("[instance] key destroyed");
                self.persistent_key_changed_locked(state, dc_id, None);
            } else {
                log::info!("[instance] key already is different");
            }
        }
        for (&shifted, session) in &state.sessions {
            if bare_dc_id(shifted) == dc_id {
                session.restart();
            }
        }
    }

    // ── Config ───────────────────────────────────────────────────────────────

    fn request_config_locked(&self, state: &mut MainState) {
        if state.config_load.is_some() || self.is_keys_destroyer() {
            return;
        }
        let future = self.config_loader.load(state.user_phone.clone());
        let handle = self.handle();
        state.config_load = Some(tokio::spawn(async move {
            match future.await {
                Ok(config) => handle.post(Event::ConfigLoaded { config }),
                Err(error) => handle.post(Event::ConfigLoadFailed { error }),
            }
        }));
    }

    fn config_loaded(&self, config: ConfigData) {
        {
            let mut state = self.main.lock().unwrap();
            state.config_load = None;
            state.last_config_loaded_at = self.clock.now();
        }

        log::debug!(
            "[instance] got config: this_dc {}, date {}, {} dc options",
            config.this_dc,
            config.date,
            config.dc_options.len()
        );
        if config.dc_options.is_empty() {
            log::error!("[instance] config with empty dc_options received!");
        } else {
            self.dc_options.set_from_list(config.dc_options.clone());
        }

        self.settings.apply_config(&config);
        self.language.apply_suggestions(
            &config.suggested_lang_code,
            config.lang_pack_version,
            config.base_lang_pack_version,
        );
        self.settings.config_updated();
        if let Some(prefix) = &config.autoupdate_url_prefix {
            self.settings.write_autoupdate_prefix(prefix);
        }
        self.settings.write_settings();

        let mut state = self.main.lock().unwrap();
        let delta_ms = (config.expires - self.unixtime.now()) * 1000;
        state.config_expires_at =
            (self.clock.now() as i64 + delta_ms).max(0) as u64;
        self.request_config_if_expired_locked(&mut state);
    }

    fn request_config_if_expired_locked(&self, state: &mut MainState) {
        let request_in = state.config_expires_at as i64 - self.clock.now() as i64;
        if request_in > 0 {
            self.call_delayed(
                (request_in as u64).min(CONFIG_REFRESH_MAX_DELAY_MS),
                Event::ConfigExpiryCheck,
            );
        } else {
            self.request_config_locked(state);
        }
    }

    // ── Logout ───────────────────────────────────────────────────────────────

    fn logout_guest_dcs_locked(&self, state: &mut MainState) {
        let dc_ids: Vec<ShiftedDcId> = state.keys_for_write.keys().copied().collect();
        for dc_id in dc_ids {
            if dc_id == state.main_dc_id || self.dc_options.dc_type(dc_id) == DcType::Cdn {
                continue;
            }
            let shifted_dc_id = logout_dc_id(dc_id);
            let done_handle = self.handle();
            let fail_handle = self.handle();
            let handlers = ResponseHandlers::none()
                .with_done(move |request_id, _| {
                    done_handle.post(Event::LogoutGuestDone { request_id });
                    true
                })
                .with_fail(move |request_id, _| {
                    fail_handle.post(Event::LogoutGuestDone { request_id });
                    true
                });
            let request_id = self.send_locked(
                state,
                SerializedRequest::new(self.codec.log_out()),
                handlers,
                SendOptions::to_dc(shifted_dc_id),
            );
            state.logout_guest_request_ids.insert(shifted_dc_id, request_id);
        }
    }

    // ── Key destroyer ────────────────────────────────────────────────────────

    fn schedule_key_destroy_locked(&self, state: &mut MainState, shifted_dc_id: ShiftedDcId) {
        debug_assert!(self.is_keys_destroyer());

        if self.dc_options.dc_type(bare_dc_id(shifted_dc_id)) == DcType::Cdn {
            // CDN keys were never logged into; destroy them directly.
            self.perform_key_destroy_locked(state, shifted_dc_id);
        } else {
            let done_handle = self.handle();
            let fail_handle = self.handle();
            let handlers = ResponseHandlers::none()
                .with_done(move |_, _| {
                    done_handle.post(Event::DestroyerLogout { shifted_dc_id });
                    true
                })
                .with_fail(move |_, err| {
                    if err.is_default_handled() {
                        return false;
                    }
                    fail_handle.post(Event::DestroyerLogout { shifted_dc_id });
                    true
                });
            self.send_locked(
                state,
                SerializedRequest::new(self.codec.log_out()),
                handlers,
                SendOptions::to_dc(shifted_dc_id),
            );
        }
    }

    fn perform_key_destroy_locked(&self, state: &mut MainState, shifted_dc_id: ShiftedDcId) {
        debug_assert!(self.is_keys_destroyer());

        let codec = self.codec.clone();
        let done_handle = self.handle();
        let fail_handle = self.handle();
        let handlers = ResponseHandlers::none()
            .with_done(move |_, bytes| match codec.parse_destroy_key_result(bytes) {
                Some(result) => {
                    done_handle.post(Event::DestroyerKeyDestroyed { shifted_dc_id, result });
                    true
                }
                None => false,
            })
            .with_fail(move |_, err| {
                log::error!(
                    "[instance] key {shifted_dc_id} destruction resulted in error: {err}"
                );
                fail_handle.post(Event::CompletedKeyDestroy { shifted_dc_id });
                true
            });
        self.send_locked(
            state,
            SerializedRequest::new(self.codec.destroy_auth_key()),
            handlers,
            SendOptions::to_dc(shifted_dc_id),
        );
    }

    fn completed_key_destroy_locked(&self, state: &mut MainState, shifted_dc_id: ShiftedDcId) {
        debug_assert!(self.is_keys_destroyer());

        self.remove_dc_locked(state, shifted_dc_id);
        state.keys_for_write.remove(&shifted_dc_id);
        self.kill_session_locked(state, shifted_dc_id);
        if state.dcenters.is_empty() {
            let _ = self.all_keys_destroyed.send(());
        }
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        // Teardown order matters: loaders first (they post events), then the
        // request table (no callback runs), then sessions, then the main
        // reference.
        let state = self.main.get_mut().unwrap();
        if let Some(task) = state.config_load.take() {
            task.abort();
        }
        if let Some(task) = state.unixtime_load.take() {
            task.abort();
        }
        self.requests.discard_all();
        for (_, session) in state.sessions.drain() {
            session.kill();
        }
        state.sessions_to_destroy.clear();
        state.main_session = None;
    }
}
