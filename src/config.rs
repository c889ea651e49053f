//! Server configuration snapshot.
//!
//! A successful config load yields one [`ConfigData`]: the DC list for the
//! address book, the scalar limits for the settings sink, language hints and
//! the expiry that drives the refresh schedule.

use crate::dc_id::DcId;
use crate::dc_options::DcOptionDesc;

/// A config that was loaded longer ago than this is considered old and is
/// re-requested by `request_config_if_old`.
pub const CONFIG_BECOMES_OLD_IN_MS: u64 = 2 * 60 * 1000;

/// Old-config threshold while the app is in blocked mode.
pub const CONFIG_BECOMES_OLD_FOR_BLOCKED_IN_MS: u64 = 8 * 1000;

/// Upper bound on how far ahead a config refresh is scheduled.
pub const CONFIG_REFRESH_MAX_DELAY_MS: u64 = 3600 * 1000;

/// Parsed `config` payload.
#[derive(Clone, Debug, Default)]
pub struct ConfigData {
    /// Server-side unix time the config was generated at.
    pub date: i64,
    /// Unix time this config expires at.
    pub expires: i64,
    pub test_mode: bool,
    pub this_dc: DcId,
    pub dc_options: Vec<DcOptionDesc>,

    pub chat_size_max: i32,
    pub megagroup_size_max: i32,
    pub forwarded_count_max: i32,
    pub online_update_period_ms: i32,
    pub offline_blur_timeout_ms: i32,
    pub offline_idle_timeout_ms: i32,
    pub online_cloud_timeout_ms: i32,
    pub notify_cloud_delay_ms: i32,
    pub notify_default_delay_ms: i32,
    pub push_chat_period_ms: i32,
    pub push_chat_limit: i32,
    pub saved_gifs_limit: i32,
    pub edit_time_limit: i32,
    pub revoke_time_limit: i32,
    pub revoke_pm_time_limit: i32,
    pub revoke_pm_inbox: bool,
    pub stickers_recent_limit: i32,
    pub stickers_faved_limit: i32,
    pub pinned_dialogs_count_max: i32,
    pub pinned_infolder_count_max: i32,
    pub channels_read_media_period: i32,
    pub caption_length_max: i32,
    pub webfile_dc_id: DcId,
    pub dc_txt_domain_name: String,
    pub me_url_prefix: String,
    pub phonecalls_enabled: bool,
    pub call_receive_timeout_ms: i32,
    pub call_ring_timeout_ms: i32,
    pub call_connect_timeout_ms: i32,
    pub call_packet_timeout_ms: i32,
    pub blocked_mode: bool,

    pub suggested_lang_code: String,
    pub lang_pack_version: i32,
    pub base_lang_pack_version: i32,
    pub autoupdate_url_prefix: Option<String>,
}
