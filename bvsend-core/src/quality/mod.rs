//! Quality tiers and negotiation.
//!
//! Tiers are ordered by resolution first; capability flags (high frame rate,
//! HDR, Dolby Vision, ...) only break ties between tiers of equal resolution.
//! A Dolby Vision tier is therefore never "below" a plain tier of a lower
//! resolution, which keeps the lenient downgrade rule well defined.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// `qn` value meaning "pick for me".
pub const AUTO_CODE: u32 = 0;
/// Auto resolves to this tier when cookies are configured.
pub const ELEVATED_AUTO_CODE: u32 = 64;
/// Auto resolves to this tier for anonymous requests.
pub const BASELINE_AUTO_CODE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const ENHANCED: Self = Self(1 << 0);
    pub const HIGH_BITRATE: Self = Self(1 << 1);
    pub const HIGH_FRAME_RATE: Self = Self(1 << 2);
    pub const HDR: Self = Self(1 << 3);
    pub const HDR_VIVID: Self = Self(1 << 4);
    pub const DOLBY_VISION: Self = Self(1 << 5);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct QualityLevel {
    code: u32,
    resolution: u16,
    capabilities: Capabilities,
    label: &'static str,
}

const fn tier(code: u32, resolution: u16, capabilities: Capabilities, label: &'static str) -> QualityLevel {
    QualityLevel {
        code,
        resolution,
        capabilities,
        label,
    }
}

/// Every tier the platform is known to serve, in ascending order.
pub const KNOWN_TIERS: [QualityLevel; 14] = [
    tier(6, 240, Capabilities::NONE, "240P"),
    tier(16, 360, Capabilities::NONE, "360P"),
    tier(32, 480, Capabilities::NONE, "480P"),
    tier(64, 720, Capabilities::NONE, "720P"),
    tier(74, 720, Capabilities::HIGH_FRAME_RATE, "720P60"),
    tier(80, 1080, Capabilities::NONE, "1080P"),
    tier(100, 1080, Capabilities::ENHANCED, "1080P AI enhanced"),
    tier(112, 1080, Capabilities::HIGH_BITRATE, "1080P+"),
    tier(116, 1080, Capabilities::HIGH_FRAME_RATE, "1080P60"),
    tier(120, 2160, Capabilities::NONE, "4K"),
    tier(125, 2160, Capabilities::HDR, "HDR"),
    tier(129, 2160, Capabilities::HDR_VIVID, "HDR Vivid"),
    tier(126, 2160, Capabilities::DOLBY_VISION, "Dolby Vision"),
    tier(127, 4320, Capabilities::NONE, "8K"),
];

impl QualityLevel {
    pub fn from_code(code: u32) -> Option<Self> {
        KNOWN_TIERS.iter().copied().find(|level| level.code == code)
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn resolution(&self) -> u16 {
        self.resolution
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// The platform needs `fourk=1` before it will list 4K and above.
    pub fn needs_fourk(&self) -> bool {
        self.resolution >= 2160
    }

    fn sort_key(&self) -> (u16, u8, u32) {
        (self.resolution, self.capabilities.bits(), self.code)
    }
}

impl Ord for QualityLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for QualityLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (qn={})", self.label, self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "level")]
pub enum RequestedQuality {
    Auto,
    Level(QualityLevel),
}

impl RequestedQuality {
    /// `None` for codes outside the tier table.
    pub fn from_code(code: u32) -> Option<Self> {
        if code == AUTO_CODE {
            Some(RequestedQuality::Auto)
        } else {
            QualityLevel::from_code(code).map(RequestedQuality::Level)
        }
    }

    pub fn resolve(self, has_credentials: bool) -> QualityLevel {
        match self {
            RequestedQuality::Level(level) => level,
            RequestedQuality::Auto => {
                let code = if has_credentials {
                    ELEVATED_AUTO_CODE
                } else {
                    BASELINE_AUTO_CODE
                };
                QualityLevel::from_code(code).unwrap_or(KNOWN_TIERS[2])
            }
        }
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, RequestedQuality::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPolicy {
    pub default: RequestedQuality,
    pub strict: bool,
    pub has_credentials: bool,
}

impl QualityPolicy {
    pub fn from_code(code: u32, strict: bool, has_credentials: bool) -> Self {
        let default = RequestedQuality::from_code(code).unwrap_or_else(|| {
            warn!(qn = code, "configured quality is not a known tier, using auto");
            RequestedQuality::Auto
        });
        Self {
            default,
            strict,
            has_credentials,
        }
    }
}

/// Outcome of steps 1-2: what we will ask the platform for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityTarget {
    pub requested: RequestedQuality,
    pub level: QualityLevel,
    pub strict: bool,
    pub from_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NegotiatedQuality {
    pub target: QualityTarget,
    pub selected: QualityLevel,
}

impl NegotiatedQuality {
    pub fn downgraded(&self) -> bool {
        self.selected != self.target.level
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QualityError {
    #[error("requested quality {requested} is unavailable; available: {}", format_levels(.available))]
    Unavailable {
        requested: QualityLevel,
        available: Vec<QualityLevel>,
    },
    #[error("the platform offered no quality tiers for this video")]
    NoTiers,
}

fn format_levels(levels: &[QualityLevel]) -> String {
    if levels.is_empty() {
        return "none".to_string();
    }
    levels
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct QualityNegotiator {
    policy: QualityPolicy,
}

impl QualityNegotiator {
    pub fn new(policy: QualityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &QualityPolicy {
        &self.policy
    }

    /// Picks the override when it names a known tier, otherwise the policy
    /// default, then resolves auto exactly once.
    pub fn target(&self, override_code: Option<u32>) -> QualityTarget {
        let from_override = override_code.and_then(|code| {
            let parsed = RequestedQuality::from_code(code);
            if parsed.is_none() {
                debug!(qn = code, "ignoring unknown quality override");
            }
            parsed
        });
        let (requested, from_override) = match from_override {
            Some(requested) => (requested, true),
            None => (self.policy.default, false),
        };
        let level = requested.resolve(self.policy.has_credentials);
        if requested.is_auto() {
            debug!(qn = level.code(), credentials = self.policy.has_credentials, "auto quality resolved");
        }
        QualityTarget {
            requested,
            level,
            // An auto-resolved tier was never asked for explicitly.
            strict: self.policy.strict && !requested.is_auto(),
            from_override,
        }
    }

    pub fn select(
        &self,
        target: QualityTarget,
        available: &[QualityLevel],
    ) -> Result<NegotiatedQuality, QualityError> {
        let mut available = available.to_vec();
        available.sort();
        available.dedup();
        if available.is_empty() {
            return Err(QualityError::NoTiers);
        }

        if available.contains(&target.level) {
            info!(qn = target.level.code(), "requested quality available");
            return Ok(NegotiatedQuality {
                target,
                selected: target.level,
            });
        }

        if target.strict {
            return Err(QualityError::Unavailable {
                requested: target.level,
                available,
            });
        }

        let selected = available
            .iter()
            .rev()
            .find(|level| **level <= target.level)
            .or_else(|| available.first())
            .copied()
            .ok_or(QualityError::NoTiers)?;
        info!(
            requested = target.level.code(),
            selected = selected.code(),
            "quality downgraded to best available tier"
        );
        Ok(NegotiatedQuality { target, selected })
    }

    pub fn negotiate(
        &self,
        override_code: Option<u32>,
        available: &[QualityLevel],
    ) -> Result<NegotiatedQuality, QualityError> {
        self.select(self.target(override_code), available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(codes: &[u32]) -> Vec<QualityLevel> {
        codes
            .iter()
            .map(|code| QualityLevel::from_code(*code).unwrap())
            .collect()
    }

    fn negotiator(default: u32, strict: bool, credentials: bool) -> QualityNegotiator {
        QualityNegotiator::new(QualityPolicy::from_code(default, strict, credentials))
    }

    #[test]
    fn tier_table_is_sorted_and_matches_code_order_for_plain_tiers() {
        let mut sorted = KNOWN_TIERS.to_vec();
        sorted.sort();
        assert_eq!(sorted, KNOWN_TIERS.to_vec());
        let fhd = QualityLevel::from_code(80).unwrap();
        let fhd60 = QualityLevel::from_code(116).unwrap();
        let uhd = QualityLevel::from_code(120).unwrap();
        assert!(fhd < fhd60);
        assert!(fhd60 < uhd);
    }

    #[test]
    fn resolution_dominates_capability_flags() {
        let dolby = QualityLevel::from_code(126).unwrap();
        let eight_k = QualityLevel::from_code(127).unwrap();
        let hfr_720 = QualityLevel::from_code(74).unwrap();
        let plain_1080 = QualityLevel::from_code(80).unwrap();
        assert!(dolby < eight_k);
        assert!(hfr_720 < plain_1080);
        assert!(dolby.capabilities().contains(Capabilities::DOLBY_VISION));
    }

    #[test]
    fn auto_resolves_by_credentials() {
        let anonymous = negotiator(0, false, false).target(None);
        assert_eq!(anonymous.level.code(), BASELINE_AUTO_CODE);
        let logged_in = negotiator(0, false, true).target(None);
        assert_eq!(logged_in.level.code(), ELEVATED_AUTO_CODE);
    }

    #[test]
    fn override_takes_precedence_and_auto_override_resolves_after_selection() {
        let negotiator = negotiator(80, false, true);
        let target = negotiator.target(Some(116));
        assert!(target.from_override);
        assert_eq!(target.level.code(), 116);

        let auto = negotiator.target(Some(0));
        assert!(auto.from_override);
        assert!(auto.requested.is_auto());
        assert_eq!(auto.level.code(), ELEVATED_AUTO_CODE);
    }

    #[test]
    fn unknown_override_falls_back_to_policy_default() {
        let target = negotiator(80, false, true).target(Some(999));
        assert!(!target.from_override);
        assert_eq!(target.level.code(), 80);
    }

    #[test]
    fn exact_tier_is_used_when_available() {
        let negotiated = negotiator(80, true, true)
            .negotiate(None, &levels(&[32, 64, 80]))
            .unwrap();
        assert_eq!(negotiated.selected.code(), 80);
        assert!(!negotiated.downgraded());
    }

    #[test]
    fn strict_mode_fails_without_substitution() {
        let err = negotiator(0, true, true)
            .negotiate(Some(120), &levels(&[32, 64, 80]))
            .unwrap_err();
        match err {
            QualityError::Unavailable {
                requested,
                available,
            } => {
                assert_eq!(requested.code(), 120);
                assert_eq!(available, levels(&[32, 64, 80]));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn strict_mode_does_not_apply_to_auto() {
        let negotiated = negotiator(0, true, true)
            .negotiate(None, &levels(&[16, 32]))
            .unwrap();
        assert_eq!(negotiated.selected.code(), 32);
    }

    #[test]
    fn lenient_mode_picks_greatest_tier_not_above_request() {
        let negotiated = negotiator(0, false, true)
            .negotiate(Some(116), &levels(&[127, 80, 64, 32, 112]))
            .unwrap();
        assert_eq!(negotiated.selected.code(), 112);
        assert!(negotiated.downgraded());
    }

    #[test]
    fn lenient_mode_never_prefers_dolby_above_requested_resolution() {
        let negotiated = negotiator(0, false, true)
            .negotiate(Some(116), &levels(&[126, 64]))
            .unwrap();
        assert_eq!(negotiated.selected.code(), 64);
    }

    #[test]
    fn lenient_mode_falls_back_to_lowest_when_nothing_qualifies() {
        let negotiated = negotiator(16, false, false)
            .negotiate(None, &levels(&[80, 64]))
            .unwrap();
        assert_eq!(negotiated.selected.code(), 64);
    }

    #[test]
    fn lenient_selection_never_exceeds_request_when_a_lower_tier_exists() {
        let negotiator = negotiator(0, false, true);
        let pool = levels(&[6, 16, 32, 64, 74, 80, 100, 112, 116, 120, 125, 126, 127, 129]);
        for requested in KNOWN_TIERS {
            for window in 1..pool.len() {
                let available = &pool[window - 1..];
                let negotiated = negotiator
                    .negotiate(Some(requested.code()), available)
                    .unwrap();
                let min = *available.iter().min().unwrap();
                if min <= requested {
                    assert!(negotiated.selected <= requested);
                } else {
                    assert_eq!(negotiated.selected, min);
                }
            }
        }
    }

    #[test]
    fn negotiation_is_idempotent() {
        let negotiator = negotiator(0, false, true);
        let available = levels(&[32, 64, 80]);
        let first = negotiator.negotiate(Some(116), &available).unwrap();
        let second = negotiator.negotiate(Some(116), &available).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_tier_set_is_an_error() {
        let err = negotiator(0, false, false).negotiate(None, &[]).unwrap_err();
        assert_eq!(err, QualityError::NoTiers);
    }

    #[test]
    fn unavailable_error_names_both_sides() {
        let err = QualityError::Unavailable {
            requested: QualityLevel::from_code(120).unwrap(),
            available: levels(&[64, 80]),
        };
        let message = err.to_string();
        assert!(message.contains("4K (qn=120)"));
        assert!(message.contains("1080P (qn=80)"));
    }
}
