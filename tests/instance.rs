//! End-to-end instance scenarios against scripted collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use layer_instance::{
    AuthKey, AuthKeyPtr, AuthorizationState, BoxFuture, CdnConfig, Codec, ConfigData,
    ConfigLoader, DcId, DcOptionDesc, DcOptions, DcType, Dcenter, DestroyKeyResult,
    DomainResolver, ExportedAuthorization, Instance, InstanceConfig, InstanceHandle,
    KeyStoreSink, LanguageSink, Mode, RequestId, ResolvedDomain, ResponseHandlers, RpcError,
    SendOptions, SerializedRequest, Session, SessionFactory, SettingsSink, ShiftedDcId,
    Unixtime,
};

const UNIX_NOW: i64 = 1_700_000_000;

// Payload tags used by the mock codec.
const TAG_EXPORT: u8 = 0xE1;
const TAG_IMPORT: u8 = 0xE2;
const TAG_LOGOUT: u8 = 0xE3;
const TAG_DESTROY: u8 = 0xE4;
const TAG_CDN_CONFIG: u8 = 0xE5;

// ─── Mock session ─────────────────────────────────────────────────────────────

#[derive(Clone)]
struct SentRequest {
    shifted_dc_id: ShiftedDcId,
    request_id: RequestId,
    body: Vec<u8>,
    needs_layer: bool,
}

#[derive(Default)]
struct SessionLog {
    started: Mutex<Vec<ShiftedDcId>>,
    sent: Mutex<Vec<SentRequest>>,
    cancelled: Mutex<Vec<(ShiftedDcId, RequestId, u64)>>,
    killed: Mutex<Vec<ShiftedDcId>>,
}

impl SessionLog {
    fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_to(&self, shifted_dc_id: ShiftedDcId) -> Vec<SentRequest> {
        self.sent()
            .into_iter()
            .filter(|entry| entry.shifted_dc_id == shifted_dc_id)
            .collect()
    }

    fn sent_with_tag(&self, tag: u8) -> Vec<SentRequest> {
        self.sent()
            .into_iter()
            .filter(|entry| entry.body.first() == Some(&tag))
            .collect()
    }

    fn started(&self) -> Vec<ShiftedDcId> {
        self.started.lock().unwrap().clone()
    }
}

struct MockSession {
    shifted_dc_id: ShiftedDcId,
    log: Arc<SessionLog>,
}

impl Session for MockSession {
    fn start(&self) {
        self.log.started.lock().unwrap().push(self.shifted_dc_id);
    }

    fn send_prepared(&self, request: &SerializedRequest, _ms_can_wait: u64) {
        self.log.sent.lock().unwrap().push(SentRequest {
            shifted_dc_id: self.shifted_dc_id,
            request_id: request.request_id(),
            body: request.body().to_vec(),
            needs_layer: request.needs_layer(),
        });
    }

    fn send_anything(&self, _ms_can_wait: u64) {}

    fn cancel(&self, request_id: RequestId, msg_id: u64) {
        self.log.cancelled.lock().unwrap().push((self.shifted_dc_id, request_id, msg_id));
    }

    fn restart(&self) {}
    fn stop(&self) {}

    fn kill(&self) {
        self.log.killed.lock().unwrap().push(self.shifted_dc_id);
    }

    fn ping(&self) {}

    fn request_state(&self, _request_id: RequestId) -> i32 {
        layer_instance::CONNECTED_STATE
    }

    fn transport(&self) -> String {
        "tcp".to_string()
    }

    fn dc_with_shift(&self) -> ShiftedDcId {
        self.shifted_dc_id
    }

    fn refresh_options(&self) {}
    fn re_init_connection(&self) {}
    fn unpaused(&self) {}
}

struct MockSessionFactory {
    log: Arc<SessionLog>,
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        shifted_dc_id: ShiftedDcId,
        _dc: Arc<Dcenter>,
        _handle: InstanceHandle,
    ) -> Arc<dyn Session> {
        Arc::new(MockSession { shifted_dc_id, log: self.log.clone() })
    }
}

// ─── Mock codec ───────────────────────────────────────────────────────────────

fn tagged_payload(tag: u8) -> Vec<u8> {
    let mut body = vec![0u8; 16];
    body[0] = tag;
    body
}

struct MockCodec;

impl Codec for MockCodec {
    fn export_authorization(&self, dc_id: DcId) -> Vec<u8> {
        let mut body = tagged_payload(TAG_EXPORT);
        body[1] = dc_id as u8;
        body
    }

    fn import_authorization(&self, _id: i64, _bytes: &[u8]) -> Vec<u8> {
        tagged_payload(TAG_IMPORT)
    }

    fn log_out(&self) -> Vec<u8> {
        tagged_payload(TAG_LOGOUT)
    }

    fn destroy_auth_key(&self) -> Vec<u8> {
        tagged_payload(TAG_DESTROY)
    }

    fn get_cdn_config(&self) -> Vec<u8> {
        tagged_payload(TAG_CDN_CONFIG)
    }

    fn parse_exported_authorization(&self, bytes: &[u8]) -> Option<ExportedAuthorization> {
        (bytes.first() == Some(&0xA1))
            .then(|| ExportedAuthorization { id: 777, bytes: vec![9, 9, 9] })
    }

    fn parse_destroy_key_result(&self, bytes: &[u8]) -> Option<DestroyKeyResult> {
        match bytes.first() {
            Some(1) => Some(DestroyKeyResult::Ok),
            Some(2) => Some(DestroyKeyResult::None),
            Some(3) => Some(DestroyKeyResult::Fail),
            _ => None,
        }
    }

    fn parse_cdn_config(&self, _bytes: &[u8]) -> Option<CdnConfig> {
        Some(CdnConfig::default())
    }
}

// ─── Mock loaders ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockConfigLoader {
    responses: Mutex<VecDeque<ConfigData>>,
    calls: AtomicUsize,
}

impl ConfigLoader for MockConfigLoader {
    fn load(&self, _user_phone: String) -> BoxFuture<Result<ConfigData, RpcError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(config) => Ok(config),
                None => Err(RpcError::local("REQUEST_CANCELED", "no config scripted")),
            }
        })
    }
}

struct MockResolver;

impl DomainResolver for MockResolver {
    fn resolve(&self, _host: String) -> BoxFuture<Option<ResolvedDomain>> {
        Box::pin(async { None })
    }
}

struct MockUnixtime;

impl Unixtime for MockUnixtime {
    fn now(&self) -> i64 {
        UNIX_NOW
    }

    fn http_valid(&self) -> bool {
        true
    }

    fn load_http(&self) -> BoxFuture<()> {
        Box::pin(async {})
    }
}

// ─── Mock sinks ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockSettings {
    blocked: AtomicBool,
    applied: AtomicUsize,
    settings_writes: AtomicUsize,
}

impl SettingsSink for MockSettings {
    fn blocked_mode(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn apply_config(&self, _config: &ConfigData) {
        self.applied.fetch_add(1, Ordering::SeqCst);
    }

    fn config_updated(&self) {}

    fn write_settings(&self) {
        self.settings_writes.fetch_add(1, Ordering::SeqCst);
    }

    fn write_autoupdate_prefix(&self, _prefix: &str) {}

    fn apply_resolved_domain(&self, _host: &str, _ips: &[String], _expire_at_ms: u64) -> bool {
        false
    }

    fn set_good_proxy_domain(&self, _host: &str, _ip: &str) {}

    fn bad_configuration_error(&self) {}
}

#[derive(Default)]
struct MockKeyStore {
    writes: Mutex<Vec<(DcId, usize)>>,
}

impl KeyStoreSink for MockKeyStore {
    fn write_key_data(&self, main_dc_id: DcId, keys: Vec<AuthKeyPtr>) {
        self.writes.lock().unwrap().push((main_dc_id, keys.len()));
    }
}

#[derive(Default)]
struct MockLanguage {
    resets: AtomicUsize,
}

impl LanguageSink for MockLanguage {
    fn reset_to_default(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn apply_suggestions(&self, _suggested: &str, _lang_pack: i32, _base_lang_pack: i32) {}
}

#[derive(Default)]
struct MockAuth {
    authorized: AtomicBool,
}

impl AuthorizationState for MockAuth {
    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct MockDcOptions {
    types: Mutex<HashMap<DcId, DcType>>,
    lists: AtomicUsize,
}

impl DcOptions for MockDcOptions {
    fn set_from_list(&self, _options: Vec<DcOptionDesc>) {
        self.lists.fetch_add(1, Ordering::SeqCst);
    }

    fn set_cdn_config(&self, _config: CdnConfig) {}

    fn dc_type(&self, dc_id: DcId) -> DcType {
        self.types.lock().unwrap().get(&dc_id).copied().unwrap_or(DcType::Regular)
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

struct TestEnv {
    log: Arc<SessionLog>,
    settings: Arc<MockSettings>,
    key_store: Arc<MockKeyStore>,
    language: Arc<MockLanguage>,
    auth: Arc<MockAuth>,
    dc_options: Arc<MockDcOptions>,
    config_loader: Arc<MockConfigLoader>,
}

impl TestEnv {
    fn new() -> Self {
        Self {
            log: Arc::new(SessionLog::default()),
            settings: Arc::new(MockSettings::default()),
            key_store: Arc::new(MockKeyStore::default()),
            language: Arc::new(MockLanguage::default()),
            auth: Arc::new(MockAuth::default()),
            dc_options: Arc::new(MockDcOptions::default()),
            config_loader: Arc::new(MockConfigLoader::default()),
        }
    }

    fn instance(&self, mode: Mode, keys: Vec<AuthKeyPtr>, main_dc_id: Option<DcId>) -> Instance {
        Instance::new(
            mode,
            InstanceConfig {
                device_model: "test-rig".to_string(),
                system_version: "1.0".to_string(),
                keys,
                main_dc_id,
                dc_options: self.dc_options.clone(),
                session_factory: Arc::new(MockSessionFactory { log: self.log.clone() }),
                codec: Arc::new(MockCodec),
                config_loader: self.config_loader.clone(),
                domain_resolver: Arc::new(MockResolver),
                unixtime: Arc::new(MockUnixtime),
                settings: self.settings.clone(),
                key_store: self.key_store.clone(),
                language: self.language.clone(),
                authorization: self.auth.clone(),
            },
        )
    }
}

fn spawn_driver(instance: &Instance) {
    let driver = instance.clone();
    tokio::spawn(async move { driver.run().await });
}

/// Let the driver drain its queue (and the paused clock tick forward a bit).
async fn drain() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn test_key(dc_id: DcId, fill: u8) -> AuthKeyPtr {
    Arc::new(AuthKey::new(dc_id, [fill; 256]))
}

fn payload_with_msg_id(msg_id: u64) -> Vec<u8> {
    let mut body = vec![0u8; 16];
    body[4..12].copy_from_slice(&msg_id.to_le_bytes());
    body
}

fn ok_frame() -> Vec<u8> {
    vec![0x01, 0, 0, 0, 0, 0, 0, 0]
}

fn export_ok_frame() -> Vec<u8> {
    vec![0xA1, 0, 0, 0, 0, 0, 0, 0]
}

fn error_frame(code: i32, message: &str) -> Vec<u8> {
    let mut bytes = 0x2144_ca19u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&code.to_le_bytes());
    bytes.push(message.len() as u8);
    bytes.extend_from_slice(message.as_bytes());
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn flood_wait_then_success() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let done = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x1111)),
        ResponseHandlers::none().with_done(move |_, _| {
            done_flag.store(true, Ordering::SeqCst);
            true
        }),
        SendOptions::to_dc(2),
    );
    assert_eq!(env.log.sent_to(2).len(), 1, "payload handed to session 2");

    let handle = instance.handle();
    handle.exec_callback(request_id, error_frame(420, "FLOOD_WAIT_3"));
    drain().await;

    assert!(instance.has_callbacks(request_id), "handlers retained while delayed");
    assert_eq!(env.log.sent_to(2).len(), 1, "no resend before the wait elapses");

    tokio::time::sleep(Duration::from_millis(2900)).await;
    assert_eq!(env.log.sent_to(2).len(), 1, "still waiting at 2.9s");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let resent = env.log.sent_to(2);
    assert_eq!(resent.len(), 2, "request resent after ~3.01s");
    assert_eq!(resent[1].request_id, request_id, "same logical request id");

    handle.exec_callback(request_id, ok_frame());
    drain().await;
    assert!(done.load(Ordering::SeqCst), "done handler ran");
    assert_eq!(instance.pending_requests(), 0, "table is empty again");
    assert_eq!(instance.pending_handlers(), 0);
}

#[tokio::test(start_paused = true)]
async fn file_migrate_moves_the_request() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let failed = Arc::new(AtomicBool::new(false));
    let failed_flag = failed.clone();
    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x2222)),
        ResponseHandlers::none()
            .with_done(|_, _| true)
            .with_fail(move |_, _| {
                failed_flag.store(true, Ordering::SeqCst);
                false
            }),
        SendOptions::to_dc(2),
    );
    let handle = instance.handle();
    handle.exec_callback(request_id, error_frame(303, "FILE_MIGRATE_4"));
    drain().await;

    assert!(env.log.started().contains(&4), "session 4 was started");
    let moved = env.log.sent_to(4);
    assert_eq!(moved.len(), 1, "payload resent on session 4");
    assert_eq!(moved[0].request_id, request_id);
    assert!(!failed.load(Ordering::SeqCst), "no user callback on migration");

    // Replaying the same migrate is idempotent: still DC 4, no bounce back.
    handle.exec_callback(request_id, error_frame(303, "FILE_MIGRATE_4"));
    drain().await;
    assert_eq!(env.log.sent_to(4).len(), 2);
    assert_eq!(env.log.sent_to(2).len(), 1, "DC 2 never sees the request again");
}

#[tokio::test(start_paused = true)]
async fn guest_dc_unauthorized_runs_the_import_chain() {
    let env = TestEnv::new();
    env.auth.authorized.store(true, Ordering::SeqCst);
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let media_body = payload_with_msg_id(0x3333);
    let request_id = instance.send(
        SerializedRequest::new(media_body.clone()),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions::to_dc(3),
    );
    let handle = instance.handle();
    handle.exec_callback(request_id, error_frame(401, "AUTH_KEY_UNREGISTERED"));
    drain().await;

    // One export in flight, sent through the main DC.
    let exports = env.log.sent_with_tag(TAG_EXPORT);
    assert_eq!(exports.len(), 1, "exactly one auth export");
    assert_eq!(exports[0].shifted_dc_id, 2, "export goes to the main DC");
    assert_eq!(exports[0].body[1], 3, "export names the target DC");

    handle.exec_callback(exports[0].request_id, export_ok_frame());
    drain().await;

    let imports = env.log.sent_with_tag(TAG_IMPORT);
    assert_eq!(imports.len(), 1, "import follows the export");
    assert_eq!(imports[0].shifted_dc_id, 3, "import pinned to the guest DC");

    handle.exec_callback(imports[0].request_id, ok_frame());
    drain().await;

    let resent = env.log.sent_to(3);
    assert_eq!(resent.len(), 3, "original + import + waited resend on DC 3");
    let waited = resent.last().unwrap();
    assert_eq!(waited.request_id, request_id, "waiter resent after import");
    assert_eq!(waited.body, media_body, "payload is byte-identical");

    // A second 401 repeats the whole chain.
    handle.exec_callback(request_id, error_frame(401, "AUTH_KEY_UNREGISTERED"));
    drain().await;
    assert_eq!(env.log.sent_with_tag(TAG_EXPORT).len(), 2, "chain restarts on repeat 401");
}

#[tokio::test(start_paused = true)]
async fn file_id_invalid_only_retries_once() {
    let env = TestEnv::new();
    env.auth.authorized.store(true, Ordering::SeqCst);
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let failed = Arc::new(AtomicBool::new(false));
    let failed_flag = failed.clone();
    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x4444)),
        ResponseHandlers::none()
            .with_done(|_, _| true)
            .with_fail(move |_, _| {
                failed_flag.store(true, Ordering::SeqCst);
                false
            }),
        SendOptions::to_dc(3),
    );
    let handle = instance.handle();

    handle.exec_callback(request_id, error_frame(400, "FILE_ID_INVALID"));
    drain().await;
    assert_eq!(env.log.sent_with_tag(TAG_EXPORT).len(), 1, "first occurrence retries");
    assert!(!failed.load(Ordering::SeqCst));

    // Complete the chain so the request is resent and handlers survive.
    let export = env.log.sent_with_tag(TAG_EXPORT).pop().unwrap();
    handle.exec_callback(export.request_id, export_ok_frame());
    drain().await;
    let import = env.log.sent_with_tag(TAG_IMPORT).pop().unwrap();
    handle.exec_callback(import.request_id, ok_frame());
    drain().await;

    handle.exec_callback(request_id, error_frame(400, "FILE_ID_INVALID"));
    drain().await;
    assert_eq!(env.log.sent_with_tag(TAG_EXPORT).len(), 1, "second occurrence surfaces");
    assert!(failed.load(Ordering::SeqCst), "user fail handler saw the error");
}

#[tokio::test(start_paused = true)]
async fn unauthorized_on_main_surfaces_to_global_handler() {
    let env = TestEnv::new();
    env.auth.authorized.store(true, Ordering::SeqCst);
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let global_failed = Arc::new(AtomicBool::new(false));
    let global_flag = global_failed.clone();
    instance.set_global_fail_handler(move |_, _| {
        global_flag.store(true, Ordering::SeqCst);
        true
    });

    let user_failed = Arc::new(AtomicBool::new(false));
    let user_flag = user_failed.clone();
    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x5555)),
        ResponseHandlers::none().with_fail(move |_, _| {
            user_flag.store(true, Ordering::SeqCst);
            false
        }),
        SendOptions::default(),
    );
    instance
        .handle()
        .exec_callback(request_id, error_frame(401, "AUTH_KEY_UNREGISTERED"));
    drain().await;

    assert!(global_failed.load(Ordering::SeqCst), "global fail handler notified");
    assert!(user_failed.load(Ordering::SeqCst), "user fail handler notified");
    assert_eq!(instance.pending_requests(), 0, "request cleaned up");
    assert_eq!(env.log.sent_with_tag(TAG_EXPORT).len(), 0, "no export for the main DC");
}

#[tokio::test(start_paused = true)]
async fn cancel_under_race_silences_late_responses() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let done = Arc::new(AtomicBool::new(false));
    let failed = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    let failed_flag = failed.clone();
    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0xDEAD_BEEF_CAFE_BABE)),
        ResponseHandlers::none()
            .with_done(move |_, _| {
                done_flag.store(true, Ordering::SeqCst);
                true
            })
            .with_fail(move |_, _| {
                failed_flag.store(true, Ordering::SeqCst);
                false
            }),
        SendOptions::to_dc(2),
    );

    instance.cancel(request_id);
    instance.cancel(request_id); // idempotent

    let cancelled = env.log.cancelled.lock().unwrap().clone();
    assert_eq!(cancelled, vec![(2, request_id, 0xDEAD_BEEF_CAFE_BABE)]);
    assert_eq!(instance.pending_requests(), 0);
    assert!(!instance.has_callbacks(request_id));

    // A response racing with the cancel is a no-op.
    instance.handle().exec_callback(request_id, ok_frame());
    drain().await;
    assert!(!done.load(Ordering::SeqCst));
    assert!(!failed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn destroyer_walks_every_key_and_signals_completion() {
    let env = TestEnv::new();
    let keys = vec![test_key(2, 1), test_key(3, 2), test_key(3, 3)];
    let instance = env.instance(Mode::KeysDestroyer, keys, None);

    let mut all_destroyed = instance.all_keys_destroyed();
    spawn_driver(&instance);
    drain().await;

    assert_eq!(instance.main_dc_id(), 0, "destroyer instances have no main DC");
    let started = env.log.started();
    assert_eq!(started.len(), 3, "one session per seeded key");
    let mut unique = started.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 3, "two keys for DC 3 get distinct shifted ids");

    let handle = instance.handle();
    let logouts = env.log.sent_with_tag(TAG_LOGOUT);
    assert_eq!(logouts.len(), 3, "each non-CDN key logs out first");
    for logout in logouts {
        handle.exec_callback(logout.request_id, ok_frame());
    }
    drain().await;

    let destroys = env.log.sent_with_tag(TAG_DESTROY);
    assert_eq!(destroys.len(), 3, "destroy_auth_key follows each logout");
    for destroy in destroys {
        handle.exec_callback(destroy.request_id, vec![1, 0, 0, 0]);
    }
    drain().await;

    assert!(all_destroyed.try_recv().is_ok(), "allKeysDestroyed fired");
    assert!(all_destroyed.try_recv().is_err(), "and fired exactly once");
    assert_eq!(instance.get_keys_for_write().len(), 0, "key registry is empty");
}

#[tokio::test(start_paused = true)]
async fn destroyer_skips_logout_for_cdn_keys() {
    let env = TestEnv::new();
    env.dc_options.types.lock().unwrap().insert(5, DcType::Cdn);
    let instance = env.instance(Mode::KeysDestroyer, vec![test_key(5, 9)], None);
    spawn_driver(&instance);
    drain().await;

    assert_eq!(env.log.sent_with_tag(TAG_LOGOUT).len(), 0, "CDN keys never log out");
    assert_eq!(env.log.sent_with_tag(TAG_DESTROY).len(), 1, "straight to destruction");
}

#[tokio::test(start_paused = true)]
async fn config_refresh_schedules_from_expiry() {
    let env = TestEnv::new();
    {
        let mut responses = env.config_loader.responses.lock().unwrap();
        responses.push_back(ConfigData {
            date: UNIX_NOW,
            expires: UNIX_NOW + 5,
            dc_options: vec![DcOptionDesc {
                id: 2,
                ip: "149.154.167.51".to_string(),
                port: 443,
                ipv6: false,
                media_only: false,
                cdn: false,
                tcpo_only: false,
                secret: None,
            }],
            ..ConfigData::default()
        });
        responses.push_back(ConfigData {
            date: UNIX_NOW,
            expires: UNIX_NOW + 100_000,
            dc_options: vec![DcOptionDesc {
                id: 2,
                ip: "149.154.167.51".to_string(),
                port: 443,
                ipv6: false,
                media_only: false,
                cdn: false,
                tcpo_only: false,
                secret: None,
            }],
            ..ConfigData::default()
        });
    }
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    assert_eq!(env.config_loader.calls.load(Ordering::SeqCst), 1, "initial load");
    assert_eq!(env.settings.applied.load(Ordering::SeqCst), 1, "limits applied");
    assert_eq!(env.dc_options.lists.load(Ordering::SeqCst), 1, "address book updated");

    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert_eq!(env.config_loader.calls.load(Ordering::SeqCst), 1, "not yet expired");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(env.config_loader.calls.load(Ordering::SeqCst), 2, "reloaded at expiry");

    // Blocked mode shortens the old-config window to 8 seconds.
    env.settings.blocked.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(8100)).await;
    instance.request_config_if_old();
    drain().await;
    assert_eq!(env.config_loader.calls.load(Ordering::SeqCst), 3, "blocked-mode refresh");
}

#[tokio::test(start_paused = true)]
async fn suggest_then_set_main_dc() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    assert_eq!(instance.main_dc_id(), 2);

    instance.suggest_main_dc_id(3);
    assert_eq!(instance.main_dc_id(), 3, "first suggestion wins");
    assert!(env.log.killed.lock().unwrap().contains(&2), "old main session killed");
    assert!(env.log.started().contains(&3), "new main session started");

    instance.suggest_main_dc_id(4);
    assert_eq!(instance.main_dc_id(), 3, "later suggestions are ignored");

    instance.set_main_dc_id(5);
    assert_eq!(instance.main_dc_id(), 5, "explicit choice overrides");
    assert!(!env.key_store.writes.lock().unwrap().is_empty(), "choice persisted");
}

#[tokio::test(start_paused = true)]
async fn layer_reinit_resends_with_needs_layer() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x6666)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions::to_dc(2),
    );
    instance
        .handle()
        .exec_callback(request_id, error_frame(400, "CONNECTION_NOT_INITED"));
    drain().await;

    let sent = env.log.sent_to(2);
    assert_eq!(sent.len(), 2, "resent on the same session");
    assert!(!sent[0].needs_layer);
    assert!(sent[1].needs_layer, "resend carries the connection-init flag");
    assert!(instance.has_callbacks(request_id), "handlers survive the retry");
}

#[tokio::test(start_paused = true)]
async fn dependent_wait_follows_the_dependency_delay() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let first = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x7001)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions::to_dc(2),
    );
    let second = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x7002)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions { after: first, ..SendOptions::to_dc(2) },
    );

    let handle = instance.handle();
    handle.exec_callback(first, error_frame(420, "FLOOD_WAIT_2"));
    drain().await;
    handle.exec_callback(second, error_frame(400, "MSG_WAIT_FAILED"));
    drain().await;

    assert_eq!(env.log.sent_to(2).len(), 2, "both parked, nothing resent yet");

    tokio::time::sleep(Duration::from_millis(2200)).await;
    let resent: Vec<RequestId> = env.log.sent_to(2)[2..]
        .iter()
        .map(|entry| entry.request_id)
        .collect();
    assert_eq!(resent, vec![first, second], "dependency fires first, dependent follows");
}

#[tokio::test(start_paused = true)]
async fn dependent_wait_detaches_when_the_dependency_moved() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let first = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x8001)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions::to_dc(2),
    );
    let second = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x8002)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions { after: first, ..SendOptions::to_dc(2) },
    );

    let handle = instance.handle();
    handle.exec_callback(first, error_frame(303, "FILE_MIGRATE_4"));
    drain().await;
    handle.exec_callback(second, error_frame(400, "MSG_WAIT_FAILED"));
    drain().await;

    let sent = env.log.sent_to(2);
    assert_eq!(sent.len(), 3, "dependent resent immediately on its own DC");
    let resend = sent.last().unwrap();
    assert_eq!(resend.request_id, second);
    assert!(resend.needs_layer, "detached resend re-inits the layer");
}

#[tokio::test(start_paused = true)]
async fn transient_errors_back_off_and_cap() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x9001)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions::to_dc(2),
    );
    let handle = instance.handle();

    // First server failure: 1s backoff.
    handle.exec_callback(request_id, error_frame(500, "INTERNAL"));
    drain().await;
    assert_eq!(env.log.sent_to(2).len(), 1);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(env.log.sent_to(2).len(), 2, "first retry after ~1s");

    // Second failure: 2s backoff.
    handle.exec_callback(request_id, error_frame(500, "INTERNAL"));
    drain().await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(env.log.sent_to(2).len(), 2, "2s backoff not elapsed at 1.1s");
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(env.log.sent_to(2).len(), 3, "second retry after ~2s");
}

#[tokio::test(start_paused = true)]
async fn flood_wait_zero_retries_immediately() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0x9002)),
        ResponseHandlers::none().with_done(|_, _| true),
        SendOptions::to_dc(2),
    );
    instance
        .handle()
        .exec_callback(request_id, error_frame(420, "FLOOD_WAIT_0"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.log.sent_to(2).len(), 2, "10ms floor, then immediate resend");
}

#[tokio::test(start_paused = true)]
async fn persistent_key_changes_are_persisted_and_broadcast() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![test_key(2, 4)], None);
    let mut key_events = instance.temporary_key_changed();
    spawn_driver(&instance);
    drain().await;

    instance.handle().dc_persistent_key_changed(3, Some(test_key(3, 5)));
    drain().await;

    assert_eq!(key_events.try_recv().expect("stream fired"), 3);
    let writes = env.key_store.writes.lock().unwrap().clone();
    assert_eq!(writes.last(), Some(&(2, 2)), "snapshot now holds both keys");

    // Re-announcing the identical key writes nothing new.
    let write_count = env.key_store.writes.lock().unwrap().len();
    instance.handle().dc_persistent_key_changed(3, Some(test_key(3, 5)));
    drain().await;
    assert_eq!(env.key_store.writes.lock().unwrap().len(), write_count);
}

#[tokio::test(start_paused = true)]
async fn language_error_resets_language_and_still_fails() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let failed = Arc::new(AtomicBool::new(false));
    let failed_flag = failed.clone();
    let request_id = instance.send(
        SerializedRequest::new(payload_with_msg_id(0xA001)),
        ResponseHandlers::none().with_fail(move |_, _| {
            failed_flag.store(true, Ordering::SeqCst);
            false
        }),
        SendOptions::to_dc(2),
    );
    instance
        .handle()
        .exec_callback(request_id, error_frame(400, "CONNECTION_LANG_CODE_INVALID"));
    drain().await;

    assert_eq!(env.language.resets.load(Ordering::SeqCst), 1);
    assert!(failed.load(Ordering::SeqCst), "error still reaches the caller");
}

#[tokio::test(start_paused = true)]
async fn request_ids_are_distinct_and_positive() {
    let env = TestEnv::new();
    let instance = env.instance(Mode::Normal, vec![], None);
    spawn_driver(&instance);
    drain().await;

    let mut seen = Vec::new();
    for i in 0..64u64 {
        let id = instance.send(
            SerializedRequest::new(payload_with_msg_id(i)),
            ResponseHandlers::none(),
            SendOptions::to_dc(2),
        );
        assert!(id > 0);
        seen.push(id);
    }
    let mut dedup = seen.clone();
    dedup.sort_unstable();
    dedup.dedup();
    assert_eq!(dedup.len(), seen.len(), "all ids distinct");
}
