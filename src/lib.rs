//! # layer-instance
//!
//! Multi-DC dispatch core for an MTProto client.
//!
//! The instance sits between the application API layer and the per-DC
//! session state machines: it multiplexes already-serialized requests across
//! authenticated data-center sessions, reacts to protocol-level errors
//! (migration, flood waits, guest-DC authorization, layer re-init, dependent
//! waits), keeps per-DC auth keys filed and persisted, and drives the config
//! refresh loop that tells the address book where DCs live.
//!
//! | Module | Role |
//! |--------|------|
//! | [`dc_id`] | Bare/shifted DC id arithmetic and role shifts |
//! | [`auth_key`] | Per-DC authorization key material |
//! | [`errors`] | RPC error model, wire-frame parsing, classification |
//! | [`requests`] | Request ids, payload snapshots, response handlers, the in-flight table |
//! | [`dcenter`] | Per-DC control blocks |
//! | [`dc_options`] | Address-book interface |
//! | [`session`] | Session interface and connection states |
//! | [`env`] | Collaborator capabilities (codec, loaders, sinks) |
//! | [`config`] | Server config snapshot and refresh constants |
//! | [`instance`] | The façade, error policy engine and driver |
//!
//! Everything outside the dispatch layer — sockets, cryptographic framing,
//! TL schema codecs, storage formats, UI — stays behind the narrow traits in
//! [`session`], [`dc_options`] and [`env`].
//!
//! ## Quick start
//!
//! Construct an [`Instance`] with your collaborators, spawn its driver, then
//! send serialized requests:
//!
//! ```rust,no_run
//! # use layer_instance::{Instance, InstanceConfig, Mode, SendOptions,
//! #     SerializedRequest, ResponseHandlers};
//! # fn collaborators() -> InstanceConfig { unimplemented!() }
//! # async fn demo() {
//! # let serialized = vec![0u8; 16];
//! let instance = Instance::new(Mode::Normal, collaborators());
//! tokio::spawn({
//!     let driver = instance.clone();
//!     async move { driver.run().await }
//! });
//!
//! let request_id = instance.send(
//!     SerializedRequest::new(serialized),
//!     ResponseHandlers::none()
//!         .with_done(|_, bytes| { /* decode */ let _ = bytes; true })
//!         .with_fail(|_, error| { eprintln!("{error}"); false }),
//!     SendOptions::to_dc(2),
//! );
//! instance.cancel(request_id);
//! # }
//! ```

#![deny(unsafe_code)]

pub mod auth_key;
pub mod config;
pub mod dc_id;
pub mod dc_options;
pub mod dcenter;
pub mod env;
pub mod errors;
pub mod instance;
pub mod requests;
pub mod session;

mod clock;
mod delayed;

pub use auth_key::{AuthKey, AuthKeyPtr};
pub use config::ConfigData;
pub use dc_id::{DcId, ShiftedDcId};
pub use dc_options::{CdnConfig, CdnPublicKey, DcOptionDesc, DcOptions, DcType};
pub use dcenter::Dcenter;
pub use env::{
    AuthorizationState, BoxFuture, Codec, ConfigLoader, DestroyKeyResult, DomainResolver,
    ExportedAuthorization, KeyStoreSink, LanguageSink, ResolvedDomain, SettingsSink, Unixtime,
};
pub use errors::RpcError;
pub use instance::{
    Instance, InstanceConfig, InstanceHandle, Mode, SendOptions, DEFAULT_MAIN_DC,
};
pub use requests::{
    next_request_id, CallbackClear, DoneHandler, FailHandler, RequestId, RequestIdAllocator,
    RequestTable, ResponseHandlers, SerializedRequest,
};
pub use session::{
    Session, SessionFactory, CONNECTED_STATE, CONNECTING_STATE, DISCONNECTED_STATE, REQUEST_SENT,
};
