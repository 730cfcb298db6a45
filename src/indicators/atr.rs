// =============================================================================
// Average True Range (ATR) — mean true range over a trailing window
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// The stop engine wants the plain mean of the most recent `period` TR values
// as its recent-volatility measure, so that is what this computes. The input
// must be oldest-first; `period + 1` bars are required because each TR needs
// the previous bar's close.
// =============================================================================

use crate::types::Kline;

/// Compute the mean true range over the most recent `period` bars.
///
/// # Returns
/// `None` when:
/// - `period` is zero.
/// - Fewer than `period + 1` bars are available.
/// - Any intermediate value is non-finite.
pub fn average_true_range(bars: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    let recent = &tr_values[tr_values.len() - period..];
    let atr = recent.iter().sum::<f64>() / period as f64;

    if atr.is_finite() {
        Some(atr)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Kline {
        Kline {
            open_time: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close,
        }
    }

    #[test]
    fn atr_reference_sequence() {
        // TR for bars 1,2 = max(2,1,1) = 2 and max(2,1,1) = 2 -> ATR = 2.0.
        let bars = vec![bar(10.0, 8.0, 9.0), bar(11.0, 9.0, 10.0), bar(12.0, 10.0, 11.0)];
        let atr = average_true_range(&bars, 2).unwrap();
        assert!((atr - 2.0).abs() < 1e-12, "expected 2.0, got {atr}");
    }

    #[test]
    fn atr_period_zero() {
        let bars = vec![bar(105.0, 95.0, 102.0); 20];
        assert!(average_true_range(&bars, 0).is_none());
    }

    #[test]
    fn atr_insufficient_data() {
        // period = 14 needs 15 bars; 10 is not enough.
        let bars = vec![bar(105.0, 95.0, 102.0); 10];
        assert!(average_true_range(&bars, 14).is_none());
    }

    #[test]
    fn atr_exact_minimum_data() {
        let bars = vec![
            bar(102.0, 98.0, 101.0),
            bar(104.0, 99.0, 103.0),
            bar(106.0, 100.0, 105.0),
            bar(108.0, 102.0, 107.0),
        ];
        let atr = average_true_range(&bars, 3);
        assert!(atr.is_some());
        assert!(atr.unwrap() > 0.0);
    }

    #[test]
    fn atr_uses_only_most_recent_window() {
        // A huge early range must not leak into a short trailing window.
        let mut bars = vec![bar(200.0, 50.0, 100.0), bar(250.0, 80.0, 100.0)];
        for _ in 0..5 {
            bars.push(bar(101.0, 99.0, 100.0));
        }
        let atr = average_true_range(&bars, 3).unwrap();
        assert!((atr - 2.0).abs() < 1e-12, "expected 2.0, got {atr}");
    }

    #[test]
    fn atr_gap_uses_prev_close() {
        // Gap up: |H - prevClose| dominates H - L.
        let bars = vec![
            bar(105.0, 95.0, 95.0),
            bar(115.0, 108.0, 112.0), // |115 - 95| = 20 > 7
            bar(118.0, 110.0, 115.0),
            bar(120.0, 113.0, 118.0),
        ];
        let atr = average_true_range(&bars, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let bars = vec![
            bar(105.0, 95.0, 100.0),
            bar(f64::NAN, 95.0, 100.0),
            bar(105.0, 95.0, 100.0),
            bar(105.0, 95.0, 100.0),
        ];
        assert!(average_true_range(&bars, 3).is_none());
    }
}
