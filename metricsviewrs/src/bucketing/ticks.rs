//! "Nice" tick selection for diagnostic histograms.
//!
//! Step sign convention: [`tick_increment`] returns a positive step
//! `k * 10^p` (k in 1, 2, 5, 10) when the raw step is at least one, and the
//! negative reciprocal `-(10^-p) / k` when the step is a fraction. A fractional
//! step of 0.2 is therefore reported as `-5`. [`nice_and_step`] always returns
//! the real, positive gap.

const E10: f64 = 7.0710678118654755; // sqrt(50)
const E5: f64 = 3.1622776601683795; // sqrt(10)
const E2: f64 = 1.4142135623730951; // sqrt(2)

const MAX_NICE_ITERATIONS: usize = 10;

/// Step between `count` ticks spanning `start..stop`, in the signed encoding.
///
/// Returns a non-finite value or zero when no step exists (equal bounds,
/// non-positive count).
pub fn tick_increment(start: f64, stop: f64, count: f64) -> f64 {
    let step = (stop - start) / count.max(0.0);
    let power = step.log10().floor();
    let error = step / 10f64.powf(power);
    let factor = if error >= E10 {
        10.0
    } else if error >= E5 {
        5.0
    } else if error >= E2 {
        2.0
    } else {
        1.0
    };
    if power >= 0.0 {
        factor * 10f64.powf(power)
    } else {
        -(10f64.powf(-power)) / factor
    }
}

/// Snap `start`/`stop` outward to multiples of a nice step.
///
/// Returns `(start, stop, gap)` with `gap > 0` on success. Degenerate input
/// (equal bounds, `count <= 0`, any non-finite operand) returns the bounds
/// unchanged with a gap of `0`. Reversed bounds are handled and returned in
/// their original orientation.
pub fn nice_and_step(start: f64, stop: f64, count: f64) -> (f64, f64, f64) {
    if !start.is_finite() || !stop.is_finite() || !count.is_finite() || count <= 0.0 {
        return (start, stop, 0.0);
    }
    if start == stop {
        return (start, stop, 0.0);
    }
    if stop < start {
        let (lo, hi, gap) = nice_and_step(stop, start, count);
        return (hi, lo, gap);
    }

    let (mut lo, mut hi) = (start, stop);
    let mut prestep: Option<f64> = None;
    for _ in 0..MAX_NICE_ITERATIONS {
        let step = tick_increment(lo, hi, count);
        if prestep == Some(step) || step == 0.0 || !step.is_finite() {
            break;
        }
        if step > 0.0 {
            lo = (lo / step).floor() * step;
            hi = (hi / step).ceil() * step;
        } else {
            lo = (lo * step).ceil() / step;
            hi = (hi * step).floor() / step;
        }
        prestep = Some(step);
    }

    match prestep {
        Some(step) if step > 0.0 => (lo, hi, step),
        Some(step) => (lo, hi, -1.0 / step),
        None => (start, stop, 0.0),
    }
}

/// Number of diagnostic buckets between nice bounds.
///
/// A unit gap gets one extra bucket so the upper bound has its own bin.
pub fn diagnostic_bucket_count(start: f64, end: f64, gap: f64) -> u64 {
    if !gap.is_finite() || gap <= 0.0 || !start.is_finite() || !end.is_finite() || end < start {
        return 0;
    }
    let mut count = ((end - start) / gap).ceil() as u64;
    if gap == 1.0 {
        count += 1;
    }
    count
}
