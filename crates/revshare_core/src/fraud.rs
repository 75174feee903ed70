//! crates/revshare_core/src/fraud.rs
//!
//! The anti-fraud heuristic: a weighted linear score over client-reported
//! session signals. Pure and deterministic, no I/O.
//!
//! | term                  | value                                          | weight |
//! |-----------------------|------------------------------------------------|--------|
//! | tab focus             | tab-active ratio                               | 0.40   |
//! | speed plausibility    | `1 - min(1, |speed - 1|)`                      | 0.25   |
//! | duration plausibility | `min(1, session / content)`, 0.5 when unknown  | 0.25   |
//! | fingerprint           | 1.0 consistent, 0.5 unseen, 0.0 absent         | 0.10   |

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::domain::SessionSignals;

/// Decimal places kept on a stored validation score.
pub const SCORE_SCALE: u32 = 4;

const TAB_FOCUS_WEIGHT: Decimal = Decimal::from_parts(40, 0, 0, false, 2);
const SPEED_WEIGHT: Decimal = Decimal::from_parts(25, 0, 0, false, 2);
const DURATION_WEIGHT: Decimal = Decimal::from_parts(25, 0, 0, false, 2);
const FINGERPRINT_WEIGHT: Decimal = Decimal::from_parts(10, 0, 0, false, 2);
const NEUTRAL: Decimal = Decimal::from_parts(5, 0, 0, false, 1);

#[derive(Debug, Clone, PartialEq)]
pub struct FraudConfig {
    /// Minimum score for an engagement to count toward payouts.
    pub threshold: Decimal,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            threshold: Decimal::new(70, 2),
        }
    }
}

impl FraudConfig {
    pub fn counts_for_payout(&self, score: Decimal, fraud_flagged: bool) -> bool {
        !fraud_flagged && score >= self.threshold
    }
}

/// How a session's device fingerprint relates to the user's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintStatus {
    Consistent,
    Unseen,
    Absent,
}

impl FingerprintStatus {
    fn term(&self) -> Decimal {
        match self {
            FingerprintStatus::Consistent => Decimal::ONE,
            FingerprintStatus::Unseen => NEUTRAL,
            FingerprintStatus::Absent => Decimal::ZERO,
        }
    }
}

/// Complete inputs for one scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreInputs {
    pub tab_active_ratio: f64,
    pub playback_speed: f64,
    pub session_seconds: f64,
    pub content_seconds: Option<f64>,
    pub fingerprint: FingerprintStatus,
}

impl ScoreInputs {
    /// `None` when a mandatory signal has not been reported.
    pub fn from_signals(signals: &SessionSignals, fingerprint: FingerprintStatus) -> Option<Self> {
        Some(Self {
            tab_active_ratio: signals.tab_active_ratio?,
            playback_speed: signals.playback_speed?,
            session_seconds: signals.session_seconds?,
            content_seconds: signals.content_seconds,
            fingerprint,
        })
    }
}

/// Scores one session. The result is in `[0, 1]` with [`SCORE_SCALE`] decimals.
pub fn score(inputs: &ScoreInputs) -> Decimal {
    let tab_focus = clamp_unit(to_decimal(inputs.tab_active_ratio));

    let speed_deviation = (to_decimal(inputs.playback_speed) - Decimal::ONE).abs();
    let speed = clamp_unit(Decimal::ONE - speed_deviation.min(Decimal::ONE));

    let duration = match inputs.content_seconds {
        Some(content) if content > 0.0 => to_decimal(inputs.session_seconds)
            .checked_div(to_decimal(content))
            .map(|ratio| clamp_unit(ratio.min(Decimal::ONE)))
            .unwrap_or(NEUTRAL),
        _ => NEUTRAL,
    };

    let total = tab_focus * TAB_FOCUS_WEIGHT
        + speed * SPEED_WEIGHT
        + duration * DURATION_WEIGHT
        + inputs.fingerprint.term() * FINGERPRINT_WEIGHT;

    clamp_unit(total).round_dp_with_strategy(SCORE_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

// Non-finite or unrepresentable values score as zero.
fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

fn clamp_unit(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn inputs(tab: f64, speed: f64, session: f64, content: Option<f64>, fp: FingerprintStatus) -> ScoreInputs {
        ScoreInputs {
            tab_active_ratio: tab,
            playback_speed: speed,
            session_seconds: session,
            content_seconds: content,
            fingerprint: fp,
        }
    }

    #[test]
    fn attentive_known_device_scores_full_marks() {
        let s = score(&inputs(1.0, 1.0, 600.0, Some(600.0), FingerprintStatus::Consistent));
        assert_eq!(s, dec!(1.00));
        assert!(FraudConfig::default().counts_for_payout(s, false));
    }

    #[test]
    fn unfocused_sped_up_anonymous_session_is_rejected() {
        let s = score(&inputs(0.0, 4.0, 600.0, Some(600.0), FingerprintStatus::Absent));
        assert_eq!(s, dec!(0.25));
        assert!(!FraudConfig::default().counts_for_payout(s, false));
    }

    #[test]
    fn missing_content_length_is_neutral() {
        let s = score(&inputs(0.5, 1.5, 300.0, None, FingerprintStatus::Absent));
        // 0.20 + 0.125 + 0.125 + 0
        assert_eq!(s, dec!(0.45));
    }

    #[test]
    fn unseen_fingerprint_earns_half_credit() {
        let s = score(&inputs(0.5, 1.0, 600.0, Some(300.0), FingerprintStatus::Unseen));
        // 0.20 + 0.25 + 0.25 + 0.05
        assert_eq!(s, dec!(0.75));
    }

    #[test]
    fn out_of_range_signals_stay_inside_unit_interval() {
        for (tab, speed, session, content) in [
            (7.0, 0.0001, 1e9, Some(1.0)),
            (-3.0, 100.0, 1.0, Some(1e9)),
            (f64::NAN, f64::INFINITY, f64::NAN, Some(f64::NAN)),
        ] {
            let s = score(&inputs(tab, speed, session, content, FingerprintStatus::Consistent));
            assert!(s >= Decimal::ZERO && s <= Decimal::ONE, "score {} out of range", s);
        }
    }

    #[test]
    fn score_is_deterministic() {
        let i = inputs(0.83, 1.25, 512.0, Some(700.0), FingerprintStatus::Unseen);
        assert_eq!(score(&i), score(&i));
    }

    #[test]
    fn threshold_is_inclusive_and_fraud_flag_wins() {
        let config = FraudConfig::default();
        assert!(config.counts_for_payout(dec!(0.70), false));
        assert!(!config.counts_for_payout(dec!(0.6999), false));
        assert!(!config.counts_for_payout(dec!(1.0), true));
    }

    #[test]
    fn incomplete_signals_produce_no_inputs() {
        let signals = SessionSignals {
            tab_active_ratio: Some(1.0),
            playback_speed: None,
            session_seconds: Some(10.0),
            content_seconds: None,
        };
        assert!(ScoreInputs::from_signals(&signals, FingerprintStatus::Absent).is_none());
    }
}
