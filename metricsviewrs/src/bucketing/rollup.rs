//! M4 reduction for dense time series.
//!
//! Points are grouped into one bin per horizontal pixel; each bin keeps its
//! first, last, minimum and maximum point. The line drawn through the survivors
//! is visually identical to the full series at that width.

/// Indices (ascending, unique) of the points that survive an M4 reduction.
///
/// `point` maps an item to its epoch timestamp and optional value. Items must
/// be sorted by timestamp. Series with fewer than `pixels * 4` points, or a
/// `pixels` of zero, are returned whole.
pub fn m4_rollup_indices<T, F>(rows: &[T], pixels: usize, point: F) -> Vec<usize>
where
    F: Fn(&T) -> (i64, Option<f64>),
{
    let threshold = pixels.saturating_mul(4);
    if pixels == 0 || rows.len() < threshold {
        return (0..rows.len()).collect();
    }

    let points: Vec<(i64, Option<f64>)> = rows.iter().map(&point).collect();
    let min_ts = points.iter().map(|p| p.0).min().unwrap_or(0);
    let max_ts = points.iter().map(|p| p.0).max().unwrap_or(0);
    let span = i128::from(max_ts) - i128::from(min_ts) + 1;

    let mut bins: Vec<Option<Bin>> = vec![None; pixels];
    for (idx, (ts, value)) in points.iter().enumerate() {
        let offset = i128::from(*ts) - i128::from(min_ts);
        let bin_idx = ((offset * pixels as i128) / span) as usize;
        let bin = bins[bin_idx.min(pixels - 1)].get_or_insert_with(|| Bin::new(idx, *ts));
        bin.observe(idx, *ts, *value);
    }

    let mut keep: Vec<usize> = bins
        .into_iter()
        .flatten()
        .flat_map(|b| b.survivors())
        .collect();
    keep.sort_unstable();
    keep.dedup();
    keep
}

/// Clone the rows kept by [`m4_rollup_indices`].
pub fn m4_rollup<T, F>(rows: &[T], pixels: usize, point: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> (i64, Option<f64>),
{
    m4_rollup_indices(rows, pixels, point)
        .into_iter()
        .map(|i| rows[i].clone())
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Bin {
    first: (usize, i64),
    last: (usize, i64),
    min: Option<(usize, f64)>,
    max: Option<(usize, f64)>,
}

impl Bin {
    fn new(idx: usize, ts: i64) -> Self {
        Self {
            first: (idx, ts),
            last: (idx, ts),
            min: None,
            max: None,
        }
    }

    fn observe(&mut self, idx: usize, ts: i64, value: Option<f64>) {
        if ts < self.first.1 {
            self.first = (idx, ts);
        }
        if ts >= self.last.1 {
            self.last = (idx, ts);
        }
        // NULLs can bound a bin in time but never win min/max.
        let Some(v) = value.filter(|v| !v.is_nan()) else {
            return;
        };
        if self.min.map_or(true, |(_, m)| v < m) {
            self.min = Some((idx, v));
        }
        if self.max.map_or(true, |(_, m)| v > m) {
            self.max = Some((idx, v));
        }
    }

    fn survivors(self) -> impl Iterator<Item = usize> {
        [
            Some(self.first.0),
            self.min.map(|m| m.0),
            self.max.map(|m| m.0),
            Some(self.last.0),
        ]
        .into_iter()
        .flatten()
    }
}
