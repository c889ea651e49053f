//! DC address book interface.
//!
//! The address book itself (endpoint lists, IPv6 preferences, proxy
//! interaction) lives outside the core; the instance only pushes fresh
//! configuration into it and asks it to classify DCs.

use crate::dc_id::DcId;

/// Classification of a data center.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DcType {
    Regular,
    /// Media-cluster DC, reachable with the account's keys.
    MediaCluster,
    /// CDN DC — never logged into, keys are throwaway.
    Cdn,
    /// Temporary DC id standing in for a real one.
    Temporary,
}

/// One `dcOption` entry from a config response.
#[derive(Clone, Debug)]
pub struct DcOptionDesc {
    pub id: DcId,
    pub ip: String,
    pub port: u16,
    pub ipv6: bool,
    pub media_only: bool,
    pub cdn: bool,
    pub tcpo_only: bool,
    pub secret: Option<Vec<u8>>,
}

/// A CDN public key delivered by `help.getCdnConfig`.
#[derive(Clone, Debug)]
pub struct CdnPublicKey {
    pub dc_id: DcId,
    pub rsa_public_key: String,
}

/// Parsed `cdnConfig` payload.
#[derive(Clone, Debug, Default)]
pub struct CdnConfig {
    pub keys: Vec<CdnPublicKey>,
}

/// The DC address book the instance keeps refreshed.
pub trait DcOptions: Send + Sync {
    /// Replace endpoint data with a freshly received DC list.
    fn set_from_list(&self, options: Vec<DcOptionDesc>);

    /// Install CDN public keys.
    fn set_cdn_config(&self, config: CdnConfig);

    /// Classify a bare DC id.
    fn dc_type(&self, dc_id: DcId) -> DcType;
}
