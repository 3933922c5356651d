//! Tone matchers: compare detector candidates against a trigger's targets.
//!
//! All functions here are pure. An empty result means "no match" for the
//! category, never an error.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::call::{HiLowCandidate, LongToneCandidate, ToneId, TwoToneCandidate};
use crate::catalog::{HiLowTarget, LongToneTarget, TwoToneTarget};

/// Which candidate matched and the frequencies it was measured at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneMatch {
    pub tone_id: ToneId,
    pub tones_matched: String,
}

/// Inclusive band of `target ± tolerance_pct % of target`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyWindow {
    pub low: f64,
    pub high: f64,
}

impl FrequencyWindow {
    pub fn around(target: f64, tolerance_pct: f64) -> Self {
        let delta = (tolerance_pct.abs() / 100.0) * target;
        Self {
            low: target - delta,
            high: target + delta,
        }
    }

    pub fn contains(&self, freq: f64) -> bool {
        self.low <= freq && freq <= self.high
    }
}

/// A zero or negative target is an unset column: required, never met.
fn is_set(freq: f64) -> bool {
    freq > 0.0
}

pub fn match_two_tone(
    target: &TwoToneTarget,
    tolerance_pct: f64,
    candidates: &[TwoToneCandidate],
) -> Vec<ToneMatch> {
    if !is_set(target.freq_a) || !is_set(target.freq_b) {
        return Vec::new();
    }
    let window_a = FrequencyWindow::around(target.freq_a, tolerance_pct);
    let window_b = FrequencyWindow::around(target.freq_b, tolerance_pct);

    candidates
        .iter()
        .filter(|c| {
            let [a, b] = c.detected;
            window_a.contains(a)
                && window_b.contains(b)
                && c.tone_a_length >= target.min_len_a
                && c.tone_b_length >= target.min_len_b
        })
        .map(|c| {
            debug!("Two-tone match: candidate {} at {:?}", c.tone_id, c.detected);
            ToneMatch {
                tone_id: c.tone_id.clone(),
                tones_matched: format!("{}, {}", c.detected[0], c.detected[1]),
            }
        })
        .collect()
}

pub fn match_long_tone(
    target: &LongToneTarget,
    tolerance_pct: f64,
    candidates: &[LongToneCandidate],
) -> Vec<ToneMatch> {
    if !is_set(target.freq) {
        return Vec::new();
    }
    let window = FrequencyWindow::around(target.freq, tolerance_pct);

    candidates
        .iter()
        .filter(|c| window.contains(c.detected) && c.length >= target.min_len)
        .map(|c| {
            debug!("Long-tone match: candidate {} at {}", c.tone_id, c.detected);
            ToneMatch {
                tone_id: c.tone_id.clone(),
                tones_matched: format!("{}", c.detected),
            }
        })
        .collect()
}

pub fn match_hi_low(
    target: &HiLowTarget,
    tolerance_pct: f64,
    candidates: &[HiLowCandidate],
) -> Vec<ToneMatch> {
    if !is_set(target.freq_hi) || !is_set(target.freq_low) {
        return Vec::new();
    }
    let window_hi = FrequencyWindow::around(target.freq_hi, tolerance_pct);
    let window_low = FrequencyWindow::around(target.freq_low, tolerance_pct);

    candidates
        .iter()
        .filter(|c| {
            let [hi, low] = c.detected;
            window_hi.contains(hi)
                && window_low.contains(low)
                && c.alternations >= target.min_alternations
        })
        .map(|c| {
            debug!("Hi-low match: candidate {} at {:?}", c.tone_id, c.detected);
            ToneMatch {
                tone_id: c.tone_id.clone(),
                tones_matched: format!("{}, {}", c.detected[0], c.detected[1]),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tone(a: f64, b: f64, id: i64, len_a: f64, len_b: f64) -> TwoToneCandidate {
        TwoToneCandidate {
            detected: [a, b],
            tone_id: ToneId::Num(id),
            tone_a_length: len_a,
            tone_b_length: len_b,
        }
    }

    fn station_target() -> TwoToneTarget {
        TwoToneTarget {
            freq_a: 700.0,
            min_len_a: 1.0,
            freq_b: 1200.0,
            min_len_b: 3.0,
        }
    }

    #[test]
    fn window_is_inclusive_at_both_edges() {
        let w = FrequencyWindow::around(1000.0, 50.0);
        assert_eq!(w, FrequencyWindow { low: 500.0, high: 1500.0 });
        assert!(w.contains(500.0));
        assert!(w.contains(1500.0));
        assert!(!w.contains(499.99));
        assert!(!w.contains(1500.01));
    }

    #[test]
    fn window_tracks_percentage_of_target() {
        let w = FrequencyWindow::around(700.0, 2.0);
        assert!((w.low - 686.0).abs() < 1e-9);
        assert!((w.high - 714.0).abs() < 1e-9);
        for (freq, expected) in [(685.9, false), (686.5, true), (700.0, true), (713.9, true), (714.1, false)] {
            assert_eq!(w.contains(freq), expected, "freq {freq}");
        }
    }

    #[test]
    fn two_tone_matches_within_tolerance_and_length() {
        let matches = match_two_tone(&station_target(), 2.0, &[two_tone(706.0, 1210.0, 1, 1.1, 3.1)]);
        assert_eq!(
            matches,
            vec![ToneMatch {
                tone_id: ToneId::Num(1),
                tones_matched: "706, 1210".into(),
            }]
        );
    }

    #[test]
    fn two_tone_rejects_short_a_tone() {
        let matches = match_two_tone(&station_target(), 2.0, &[two_tone(706.0, 1210.0, 1, 0.5, 3.1)]);
        assert!(matches.is_empty());
    }

    #[test]
    fn two_tone_sides_use_independent_windows() {
        // 1224 is inside B's window (±24) but far outside A's (±14).
        let matches = match_two_tone(&station_target(), 2.0, &[two_tone(1224.0, 700.0, 1, 2.0, 4.0)]);
        assert!(matches.is_empty());
        let matches = match_two_tone(&station_target(), 2.0, &[two_tone(714.0, 1224.0, 2, 2.0, 4.0)]);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn two_tone_reports_every_matching_candidate() {
        let candidates = [
            two_tone(700.0, 1200.0, 1, 1.0, 3.0),
            two_tone(900.0, 1200.0, 2, 1.0, 3.0),
            two_tone(701.0, 1199.0, 3, 1.5, 3.5),
        ];
        let ids: Vec<ToneId> = match_two_tone(&station_target(), 2.0, &candidates)
            .into_iter()
            .map(|m| m.tone_id)
            .collect();
        assert_eq!(ids, vec![ToneId::Num(1), ToneId::Num(3)]);
    }

    #[test]
    fn long_tone_requires_min_length() {
        let target = LongToneTarget {
            freq: 1000.0,
            min_len: 2.0,
        };
        let candidates = [
            LongToneCandidate {
                detected: 1015.0,
                tone_id: ToneId::Num(1),
                length: 1.9,
            },
            LongToneCandidate {
                detected: 985.0,
                tone_id: ToneId::Num(2),
                length: 2.0,
            },
        ];
        let matches = match_long_tone(&target, 2.0, &candidates);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].tone_id, ToneId::Num(2));
        assert_eq!(matches[0].tones_matched, "985");
    }

    #[test]
    fn long_tone_zero_length_default_accepts_any_duration() {
        let target = LongToneTarget {
            freq: 1000.0,
            min_len: 0.0,
        };
        let candidates = [LongToneCandidate {
            detected: 1000.0,
            tone_id: ToneId::Text("a".into()),
            length: 0.0,
        }];
        assert_eq!(match_long_tone(&target, 2.0, &candidates).len(), 1);
    }

    #[test]
    fn hi_low_requires_alternations() {
        let target = HiLowTarget {
            freq_hi: 1500.0,
            freq_low: 700.0,
            min_alternations: 4,
        };
        let candidate = |alternations| HiLowCandidate {
            detected: [1510.0, 695.0],
            tone_id: ToneId::Num(alternations as i64),
            alternations,
        };
        assert!(match_hi_low(&target, 2.0, &[candidate(3)]).is_empty());
        assert_eq!(match_hi_low(&target, 2.0, &[candidate(4)]).len(), 1);
    }

    #[test]
    fn zero_target_never_matches() {
        let long = LongToneTarget {
            freq: 0.0,
            min_len: 0.0,
        };
        let silent = [LongToneCandidate {
            detected: 0.0,
            tone_id: ToneId::Num(1),
            length: 5.0,
        }];
        assert!(match_long_tone(&long, 2.0, &silent).is_empty());

        let mut two = station_target();
        two.freq_b = 0.0;
        assert!(match_two_tone(&two, 2.0, &[two_tone(700.0, 0.0, 1, 2.0, 4.0)]).is_empty());

        let hl = HiLowTarget {
            freq_hi: 0.0,
            freq_low: 700.0,
            min_alternations: 0,
        };
        let candidate = HiLowCandidate {
            detected: [0.0, 700.0],
            tone_id: ToneId::Num(2),
            alternations: 8,
        };
        assert!(match_hi_low(&hl, 2.0, &[candidate]).is_empty());
    }

    #[test]
    fn empty_candidates_yield_no_matches() {
        assert!(match_two_tone(&station_target(), 2.0, &[]).is_empty());
    }
}
