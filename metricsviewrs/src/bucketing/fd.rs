/// Upper bound on histogram buckets for any method.
pub const MAX_BUCKETS: u64 = 40;

/// Summary statistics returned by the histogram stats query.
///
/// Any field is `None` when the column has no non-null values.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramStats {
    pub iqr: Option<f64>,
    pub approx_distinct: Option<u64>,
    pub range: Option<f64>,
}

/// Freedman–Diaconis bucket count.
///
/// Columns with fewer than [`MAX_BUCKETS`] distinct values are treated as
/// categorical and get one bucket per value. An empty or constant column yields
/// zero buckets.
pub fn freedman_diaconis_buckets(stats: &HistogramStats) -> u64 {
    let (Some(iqr), Some(range)) = (stats.iqr, stats.range) else {
        return 0;
    };
    if range == 0.0 || !range.is_finite() {
        return 0;
    }
    let count = stats.approx_distinct.unwrap_or(0);
    if count < MAX_BUCKETS {
        return count;
    }

    let width = 2.0 * iqr / (count as f64).cbrt();
    let buckets = (range / width).ceil();
    if buckets.is_nan() {
        return 0;
    }
    // iqr == 0 gives an infinite ratio, which the cap absorbs.
    buckets.min(MAX_BUCKETS as f64).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(iqr: f64, n: u64, range: f64) -> HistogramStats {
        HistogramStats {
            iqr: Some(iqr),
            approx_distinct: Some(n),
            range: Some(range),
        }
    }

    #[test]
    fn low_cardinality_is_categorical() {
        for n in [1, 7, 39] {
            assert_eq!(freedman_diaconis_buckets(&stats(3.0, n, 100.0)), n);
        }
    }

    #[test]
    fn null_or_flat_columns_have_no_buckets() {
        assert_eq!(freedman_diaconis_buckets(&HistogramStats::default()), 0);
        assert_eq!(freedman_diaconis_buckets(&stats(1.0, 100, 0.0)), 0);
        let missing_iqr = HistogramStats {
            iqr: None,
            ..stats(1.0, 100, 10.0)
        };
        assert_eq!(freedman_diaconis_buckets(&missing_iqr), 0);
    }

    #[test]
    fn sizes_from_iqr() {
        // width = 2 * 10 / cbrt(1000) = 2, ceil(30 / 2) = 15
        assert_eq!(freedman_diaconis_buckets(&stats(10.0, 1000, 30.0)), 15);
        // Wide range saturates.
        assert_eq!(freedman_diaconis_buckets(&stats(10.0, 1000, 1e6)), MAX_BUCKETS);
        assert_eq!(freedman_diaconis_buckets(&stats(0.0, 1000, 5.0)), MAX_BUCKETS);
    }
}
