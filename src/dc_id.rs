//! DC identifier arithmetic.
//!
//! A *bare* DC id is a small positive integer naming a logical data center.
//! A *shifted* DC id packs a bare id together with a role shift so that
//! several independent sessions can target the same data center:
//!
//! ```text
//! shifted = bare + 10_000 * shift
//! ```
//!
//! Shift `0` is the main role. Other shifts select config enumeration,
//! logout-only sessions, media download/upload pipelines and the
//! key-destroyer lifecycle. Distinct shifts for one DC run as fully
//! independent sessions.

/// Bare data-center id.
pub type DcId = i32;

/// Bare DC id plus role shift, packed into one signed integer.
pub type ShiftedDcId = i32;

const DC_SHIFT: i32 = 10_000;

/// Shift used when enumerating DCs for a config request.
pub const CONFIG_DC_SHIFT: i32 = 0x01;
/// Shift used for the one-shot logout sessions of guest DCs.
pub const LOGOUT_DC_SHIFT: i32 = 0x02;
/// Shift used by the autoupdater downloads.
pub const UPDATER_DC_SHIFT: i32 = 0x03;

const DOWNLOAD_DC_SHIFT: i32 = 0x10;
const UPLOAD_DC_SHIFT: i32 = 0x20;
const MAX_MEDIA_DC_COUNT: i32 = 0x10;

/// First shift of the key-destroyer range; `destroy_key_next_dc_id` walks
/// upwards from here so several keys for one DC never collide.
const DESTROY_KEY_START_DC_SHIFT: i32 = 0x100;

/// Temporary bare ids occupy a high band of the bare-id space; the real id
/// is recovered by subtracting the band base.
const TEMPORARY_DC_ID_BASE: DcId = 0x1000;

/// Extract the bare DC id from a shifted one.
pub fn bare_dc_id(shifted_dc_id: ShiftedDcId) -> DcId {
    shifted_dc_id % DC_SHIFT
}

/// Compose a shifted DC id from a bare id and a role shift.
pub fn shift_dc_id(dc_id: DcId, shift: i32) -> ShiftedDcId {
    dc_id + DC_SHIFT * shift
}

/// Extract the role shift from a shifted DC id.
pub fn dc_id_shift(shifted_dc_id: ShiftedDcId) -> i32 {
    shifted_dc_id / DC_SHIFT
}

/// Shifted id of the config-enumeration session for `dc_id`.
pub fn config_dc_id(dc_id: DcId) -> ShiftedDcId {
    shift_dc_id(dc_id, CONFIG_DC_SHIFT)
}

/// Shifted id of the logout session for `dc_id`.
pub fn logout_dc_id(dc_id: DcId) -> ShiftedDcId {
    shift_dc_id(dc_id, LOGOUT_DC_SHIFT)
}

/// Shifted id of the `index`-th media-download session for `dc_id`.
pub fn download_dc_id(dc_id: DcId, index: i32) -> ShiftedDcId {
    debug_assert!(index < MAX_MEDIA_DC_COUNT);
    shift_dc_id(dc_id, DOWNLOAD_DC_SHIFT + index)
}

/// Whether `shifted_dc_id` belongs to the media-download range.
pub fn is_download_dc_id(shifted_dc_id: ShiftedDcId) -> bool {
    let shift = dc_id_shift(shifted_dc_id);
    shift >= DOWNLOAD_DC_SHIFT && shift < DOWNLOAD_DC_SHIFT + MAX_MEDIA_DC_COUNT
}

/// Shifted id of the `index`-th upload session for `dc_id`.
pub fn upload_dc_id(dc_id: DcId, index: i32) -> ShiftedDcId {
    debug_assert!(index < MAX_MEDIA_DC_COUNT);
    shift_dc_id(dc_id, UPLOAD_DC_SHIFT + index)
}

/// Whether `shifted_dc_id` belongs to the upload range.
pub fn is_upload_dc_id(shifted_dc_id: ShiftedDcId) -> bool {
    let shift = dc_id_shift(shifted_dc_id);
    shift >= UPLOAD_DC_SHIFT && shift < UPLOAD_DC_SHIFT + MAX_MEDIA_DC_COUNT
}

/// Next free destroyer slot for a key of this DC. Starting from a plain bare
/// id this yields the first destroyer shift; starting from a destroyer id it
/// bumps the shift by one.
pub fn destroy_key_next_dc_id(shifted_dc_id: ShiftedDcId) -> ShiftedDcId {
    let shift = dc_id_shift(shifted_dc_id);
    let next = if shift == 0 { DESTROY_KEY_START_DC_SHIFT } else { shift + 1 };
    shift_dc_id(bare_dc_id(shifted_dc_id), next)
}

/// Whether a *bare* id sits in the temporary band.
pub fn is_temporary_dc_id(dc_id: DcId) -> bool {
    dc_id >= TEMPORARY_DC_ID_BASE && dc_id < DC_SHIFT
}

/// Real bare id behind a temporary one, or `None` if `dc_id` is not
/// temporary.
pub fn real_dc_id_from_temporary(dc_id: DcId) -> Option<DcId> {
    if is_temporary_dc_id(dc_id) {
        let real = dc_id - TEMPORARY_DC_ID_BASE;
        (real > 0).then_some(real)
    } else {
        None
    }
}

/// Temporary bare id for a real one.
pub fn temporary_dc_id(real_dc_id: DcId) -> DcId {
    debug_assert!(real_dc_id > 0 && real_dc_id < TEMPORARY_DC_ID_BASE);
    real_dc_id + TEMPORARY_DC_ID_BASE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_and_split_round_trip() {
        let shifted = shift_dc_id(4, 0x12);
        assert_eq!(bare_dc_id(shifted), 4);
        assert_eq!(dc_id_shift(shifted), 0x12);
    }

    #[test]
    fn plain_bare_id_has_no_shift() {
        assert_eq!(bare_dc_id(2), 2);
        assert_eq!(dc_id_shift(2), 0);
    }

    #[test]
    fn media_ranges_are_disjoint() {
        let down = download_dc_id(2, 3);
        let up = upload_dc_id(2, 3);
        assert_ne!(down, up);
        assert!(is_download_dc_id(down) && !is_upload_dc_id(down));
        assert!(is_upload_dc_id(up) && !is_download_dc_id(up));
        assert!(!is_download_dc_id(logout_dc_id(2)));
    }

    #[test]
    fn destroyer_shift_chain_never_repeats() {
        let first = destroy_key_next_dc_id(3);
        let second = destroy_key_next_dc_id(first);
        let third = destroy_key_next_dc_id(second);
        assert_eq!(bare_dc_id(first), 3);
        assert_eq!(bare_dc_id(second), 3);
        assert!(first != second && second != third && first != third);
    }

    #[test]
    fn temporary_band_maps_back_to_real() {
        let temp = temporary_dc_id(5);
        assert!(is_temporary_dc_id(temp));
        assert_eq!(real_dc_id_from_temporary(temp), Some(5));
        assert_eq!(real_dc_id_from_temporary(5), None);
    }
}
