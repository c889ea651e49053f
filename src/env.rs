//! Collaborator capabilities handed to the instance at construction.
//!
//! The core never reaches for globals: everything it needs from the outside
//! world — serializing its own control requests, loading config, resolving
//! proxy domains, persisting keys and settings — arrives as an `Arc<dyn …>`
//! capability in [`InstanceConfig`](crate::InstanceConfig).

use std::future::Future;
use std::pin::Pin;

use crate::auth_key::AuthKeyPtr;
use crate::config::ConfigData;
use crate::dc_id::DcId;
use crate::dc_options::CdnConfig;
use crate::errors::RpcError;

/// Boxed future used by the one-shot loader capabilities.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// ─── Codec ────────────────────────────────────────────────────────────────────

/// Result of `auth.exportAuthorization`.
#[derive(Clone, Debug)]
pub struct ExportedAuthorization {
    pub id: i64,
    pub bytes: Vec<u8>,
}

/// The three result variants of `destroy_auth_key`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyKeyResult {
    Ok,
    None,
    Fail,
}

/// Serializes the handful of control requests the core sends on its own
/// behalf, and parses their replies. Application payloads never pass through
/// here — those arrive already serialized and leave as raw byte windows.
pub trait Codec: Send + Sync {
    fn export_authorization(&self, dc_id: DcId) -> Vec<u8>;
    fn import_authorization(&self, id: i64, bytes: &[u8]) -> Vec<u8>;
    fn log_out(&self) -> Vec<u8>;
    fn destroy_auth_key(&self) -> Vec<u8>;
    fn get_cdn_config(&self) -> Vec<u8>;

    fn parse_exported_authorization(&self, bytes: &[u8]) -> Option<ExportedAuthorization>;
    fn parse_destroy_key_result(&self, bytes: &[u8]) -> Option<DestroyKeyResult>;
    fn parse_cdn_config(&self, bytes: &[u8]) -> Option<CdnConfig>;
}

// ─── One-shot loaders ─────────────────────────────────────────────────────────

/// Fetches a fresh server config. The instance keeps at most one load alive.
pub trait ConfigLoader: Send + Sync {
    fn load(&self, user_phone: String) -> BoxFuture<Result<ConfigData, RpcError>>;
}

/// Result of a proxy-domain resolution.
#[derive(Clone, Debug)]
pub struct ResolvedDomain {
    pub ips: Vec<String>,
    pub expire_at_ms: u64,
}

/// Resolves proxy hostnames out-of-band. One resolution per host at a time.
pub trait DomainResolver: Send + Sync {
    fn resolve(&self, host: String) -> BoxFuture<Option<ResolvedDomain>>;
}

/// Server-time oracle, optionally refreshable over plain HTTP.
pub trait Unixtime: Send + Sync {
    /// Current unix time, offset-corrected.
    fn now(&self) -> i64;

    /// Whether an HTTP-sourced time value is already present.
    fn http_valid(&self) -> bool;

    /// Fetch the time over HTTP. The instance keeps at most one fetch alive.
    fn load_http(&self) -> BoxFuture<()>;
}

// ─── Sinks ────────────────────────────────────────────────────────────────────

/// Receives config-derived application settings and proxy updates.
pub trait SettingsSink: Send + Sync {
    /// Whether the app currently runs in blocked mode (shortens the config
    /// refresh interval).
    fn blocked_mode(&self) -> bool;

    /// Apply the scalar limits of a freshly loaded config.
    fn apply_config(&self, config: &ConfigData);

    /// The account-level "config changed" notification.
    fn config_updated(&self);

    fn write_settings(&self);

    fn write_autoupdate_prefix(&self, prefix: &str);

    /// Install resolved IPs for a proxy host. Returns `true` when the active
    /// proxy was affected and sessions should refresh their options.
    fn apply_resolved_domain(&self, host: &str, ips: &[String], expire_at_ms: u64) -> bool;

    /// Move a proven-good IP to the front of a proxy's resolved list.
    fn set_good_proxy_domain(&self, host: &str, ip: &str);

    /// The server rejected our configuration outright.
    fn bad_configuration_error(&self);
}

/// Receives persistent-key snapshots whenever the key set changes.
pub trait KeyStoreSink: Send + Sync {
    fn write_key_data(&self, main_dc_id: DcId, keys: Vec<AuthKeyPtr>);
}

/// Receives language hints from config and protocol errors.
pub trait LanguageSink: Send + Sync {
    /// `CONNECTION_LANG_CODE_INVALID`: fall back to the default language.
    fn reset_to_default(&self);

    /// Config carried a suggested language and pack versions.
    fn apply_suggestions(&self, suggested: &str, lang_pack_version: i32, base_lang_pack_version: i32);
}

/// Tells the core whether an account authorization currently exists (guest-DC
/// auth import only makes sense when it does).
pub trait AuthorizationState: Send + Sync {
    fn is_authorized(&self) -> bool;
}
