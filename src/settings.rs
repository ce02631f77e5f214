//! Engine-wide settings, frozen at construction time.
//!
//! Parsing these from a config file or the environment is explicitly out of
//! scope (see SPEC_FULL.md §1); this module only owns the struct and its
//! validation, mirroring `lsquic_engine_check_settings` /
//! `lsquic_engine_init_settings`.

use crate::error::SettingsError;

/// Bit positions within [`VersionSet`]. Wire-format specifics are out of
/// scope; these exist only so `EngineSettings` can reason about "is this an
/// IETF-shaped version" the way the registry mode selection needs to.
pub mod version_bits {
    /// IETF QUIC versions (draft and final).
    pub const IETF: u32 = 0b0000_1111;
    /// Legacy Google QUIC versions that carry a version-negotiation header.
    pub const GQUIC_HEADER: u32 = 0b0011_0000;
    /// Google QUIC versions that always imply zero-length source CIDs.
    pub const FORCED_TCID0: u32 = 0b0100_0000;
    /// Every version bit this engine build understands.
    pub const SUPPORTED: u32 = IETF | GQUIC_HEADER | FORCED_TCID0;
}

const MIN_FLOW_CONTROL_WINDOW: u32 = 16 * 1024;
const MAX_IDLE_TIMEOUT_SECS: u32 = 600;
const MIN_SCID_LEN: u8 = 4;
const MAX_SCID_LEN: u8 = 18;
/// Maximum number of elements the (out of scope) HTTP/3 priority tree can
/// hold; combined stream + placeholder counts must stay under this.
const H3_PRIO_MAX_ELEMS: u32 = 256;

/// How connections are looked up in the registry (C1). Chosen once, at
/// construction, from the settings below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    /// Keyed by connection-ID element bytes. The common case.
    ByConnectionId,
    /// Keyed by the local endpoint's port. Selected when source connection
    /// IDs are zero-length, or legacy TCID0 compatibility is requested
    /// alongside a Google-QUIC version.
    ByEndpoint,
}

/// Per-connection flow control and protocol parameters the engine validates
/// (but does not itself interpret — that's the connection state machine's
/// job) plus the handful of knobs the engine *does* act on directly.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Is this engine instance a server (accepts inbound connections) or a
    /// client (only `connect`s out)?
    pub is_server: bool,
    /// Supported QUIC version bitmask, see [`version_bits`].
    pub versions: u32,
    /// Connection-level flow control window floor.
    pub cfcw: u32,
    /// Stream-level flow control window floor.
    pub sfcw: u32,
    /// Idle timeout, seconds. Must be <= 600.
    pub idle_timeout_secs: u32,
    /// Source connection ID length in bytes. 0 is only legal for clients.
    pub scid_len: u8,
    /// Legacy Google-QUIC "TCID=0" compatibility toggle.
    pub support_tcid0: bool,
    /// Honor IETF stateless reset tokens on ingress (C6 step 4).
    pub honor_prst: bool,
    /// Declared bidirectional + unidirectional stream limits, summed with
    /// `h3_placeholders` and validated against the (out-of-scope) HTTP/3
    /// priority tree's element budget.
    pub max_streams_bidi: u32,
    pub max_streams_uni: u32,
    pub h3_placeholders: u32,
    /// Wall-clock budget for a single `process_conns` egress slice, in
    /// microseconds. `0` disables the deadline entirely.
    pub proc_time_thresh_micros: u64,
}

impl EngineSettings {
    /// Defaults tuned for a server, mirroring `lsquic_engine_init_settings`
    /// with `ENG_SERVER` set.
    pub fn for_server() -> Self {
        Self {
            is_server: true,
            versions: version_bits::IETF,
            cfcw: 3 * 1024 * 1024,
            sfcw: 1024 * 1024,
            idle_timeout_secs: 30,
            scid_len: 8,
            support_tcid0: false,
            honor_prst: true,
            max_streams_bidi: 100,
            max_streams_uni: 100,
            h3_placeholders: 0,
            proc_time_thresh_micros: 1000,
        }
    }

    /// Defaults tuned for a client.
    pub fn for_client() -> Self {
        Self {
            is_server: false,
            versions: version_bits::IETF,
            cfcw: 1024 * 1024,
            sfcw: 256 * 1024,
            idle_timeout_secs: 30,
            scid_len: 8,
            support_tcid0: false,
            honor_prst: true,
            max_streams_bidi: 100,
            max_streams_uni: 3,
            h3_placeholders: 0,
            proc_time_thresh_micros: 1000,
        }
    }

    /// Validates the settings, mirroring `lsquic_engine_check_settings`.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.cfcw < MIN_FLOW_CONTROL_WINDOW || self.sfcw < MIN_FLOW_CONTROL_WINDOW {
            return Err(SettingsError::FlowControlWindowTooLow {
                cfcw: self.cfcw,
                sfcw: self.sfcw,
                minimum: MIN_FLOW_CONTROL_WINDOW,
            });
        }
        if self.versions & version_bits::SUPPORTED == 0 {
            return Err(SettingsError::NoSupportedVersions);
        }
        if self.versions & !version_bits::SUPPORTED != 0 {
            return Err(SettingsError::UnsupportedVersionBits(self.versions));
        }
        if self.idle_timeout_secs > MAX_IDLE_TIMEOUT_SECS {
            return Err(SettingsError::IdleTimeoutTooLarge(self.idle_timeout_secs));
        }
        let scid_zero_allowed = !self.is_server && self.scid_len == 0;
        if !scid_zero_allowed && !(MIN_SCID_LEN..=MAX_SCID_LEN).contains(&self.scid_len) {
            return Err(SettingsError::InvalidScidLen { len: self.scid_len });
        }
        let sum = self.max_streams_bidi + self.max_streams_uni + self.h3_placeholders;
        if sum > H3_PRIO_MAX_ELEMS {
            return Err(SettingsError::TooManyPriorityElements {
                sum,
                max: H3_PRIO_MAX_ELEMS,
            });
        }
        Ok(())
    }

    /// Which [`RegistryMode`] these settings imply, mirroring
    /// `hash_conns_by_addr`.
    pub fn registry_mode(&self) -> RegistryMode {
        let forced_tcid0 = self.versions & version_bits::FORCED_TCID0 != 0;
        let gquic_tcid0 = self.versions & version_bits::GQUIC_HEADER != 0 && self.support_tcid0;
        if forced_tcid0 || gquic_tcid0 || self.scid_len == 0 {
            RegistryMode::ByEndpoint
        } else {
            RegistryMode::ByConnectionId
        }
    }
}
