//! Rolling descriptive statistics, used for scheduler/dark-manager ETA
//! smoothing and stacker outlier-fraction tracking.

use medians::Medianf64;

#[derive(Clone, Debug, Default)]
pub struct DescriptiveStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    // Omitted for `session`.
    pub median: Option<f64>,
    pub median_absolute_deviation: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct ValueStats {
    /// Stats over the most recent `capacity` values.
    pub recent: DescriptiveStats,
    /// Stats since construction, or since the last `reset_session()`.
    pub session: DescriptiveStats,
}

pub struct ValueStatsAccumulator {
    pub value_stats: ValueStats,
    circular_buffer: CircularBuffer,
    rolling_stats: rolling_stats::Stats<f64>,
}

impl ValueStatsAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            value_stats: ValueStats::default(),
            circular_buffer: CircularBuffer::new(capacity),
            rolling_stats: rolling_stats::Stats::<f64>::new(),
        }
    }

    pub fn add_value(&mut self, value: f64) {
        self.circular_buffer.push(value);
        self.rolling_stats.update(value);

        let recent_values = self.circular_buffer.unordered_contents();
        let recent_stats = &mut self.value_stats.recent;
        recent_stats.min = *recent_values.iter().min_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.max = *recent_values.iter().max_by(|a, b| a.total_cmp(b)).unwrap();
        recent_stats.mean = statistical::mean(recent_values);
        if recent_values.len() > 1 {
            recent_stats.stddev = statistical::standard_deviation(recent_values, Some(recent_stats.mean));
        }
        recent_stats.median = Some(recent_values.medf_unchecked());
        recent_stats.median_absolute_deviation = Some(recent_values.madf(recent_stats.median.unwrap()));

        let session_stats = &mut self.value_stats.session;
        session_stats.min = self.rolling_stats.min;
        session_stats.max = self.rolling_stats.max;
        session_stats.mean = self.rolling_stats.mean;
        session_stats.stddev = self.rolling_stats.std_dev;
    }

    pub fn reset_session(&mut self) {
        self.value_stats.session = DescriptiveStats::default();
        self.rolling_stats = rolling_stats::Stats::<f64>::new();
    }

    pub fn mean_recent(&self) -> Option<f64> {
        if self.circular_buffer.unordered_contents().is_empty() {
            None
        } else {
            Some(self.value_stats.recent.mean)
        }
    }

    pub fn len(&self) -> usize {
        self.circular_buffer.unordered_contents().len()
    }
}

// A Vec<f64>-backed ring buffer, used so we can hand callers a single
// contiguous slice of the recent values (order doesn't matter to us).
#[derive(Debug)]
struct CircularBuffer {
    start: usize,
    data: Vec<f64>,
}

impl CircularBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            data: Vec::with_capacity(capacity.max(1)),
        }
    }

    fn push(&mut self, item: f64) {
        if self.data.len() < self.data.capacity() {
            self.data.push(item);
        } else {
            self.data[self.start] = item;
            self.start += 1;
            self.start %= self.data.capacity();
        }
    }

    fn unordered_contents(&self) -> &[f64] {
        self.data.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_circular_buffer() {
        let mut cb = CircularBuffer::new(3);
        assert_eq!(cb.unordered_contents(), &[] as &[f64]);
        cb.push(4.0);
        assert_eq!(cb.unordered_contents(), [4.0]);
        cb.push(5.0);
        cb.push(6.0);
        assert_eq!(cb.unordered_contents(), [4.0, 5.0, 6.0]);
        cb.push(7.0);
        assert_eq!(cb.unordered_contents(), [7.0, 5.0, 6.0]);
    }

    #[test]
    fn test_value_stats_accumulator() {
        let mut vsa = ValueStatsAccumulator::new(3);
        assert_eq!(vsa.mean_recent(), None);

        vsa.add_value(1.5);
        vsa.add_value(3.5);
        assert_eq!(vsa.value_stats.recent.min, 1.5);
        assert_eq!(vsa.value_stats.recent.max, 3.5);
        assert_eq!(vsa.value_stats.recent.mean, 2.5);
        assert_abs_diff_eq!(vsa.value_stats.recent.stddev, 1.41, epsilon = 0.01);
        assert_eq!(vsa.value_stats.recent.median, Some(2.5));
        assert_eq!(vsa.value_stats.session.median, None);

        vsa.reset_session();
        assert_eq!(vsa.value_stats.recent.mean, 2.5);
        assert_eq!(vsa.value_stats.session.mean, 0.0);
    }
}
