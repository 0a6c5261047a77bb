/// Exponential moving average of outbound bytes/sec.
///
/// Bytes are reported in two buckets: confirmed (actually handed to the
/// socket) and preliminary (copied into a chunk but not yet on the wire).
/// Only confirmed bytes feed the average; the preliminary bucket lets the
/// pacing gate see traffic it is about to cause.
#[derive(Debug, Default)]
pub(crate) struct BandwidthTracker {
    last_update_ms: u64,
    bytes_since_update: u32,
    prel_bytes_since_update: u32,
    average: f32,
}

impl BandwidthTracker {
    /// Fold the confirmed bytes into the average. `now_ms` is an absolute
    /// millisecond clock; deltas of 100 ms or less are ignored.
    pub(crate) fn update_time(&mut self, now_ms: u64) {
        if now_ms <= self.last_update_ms + 100 {
            return;
        }

        let rate =
            self.bytes_since_update as f32 * 1000.0 / (now_ms - self.last_update_ms) as f32;

        self.average = (self.average * 9.0 + rate) / 10.0;
        self.bytes_since_update = 0;
        self.prel_bytes_since_update = 0;
        self.last_update_ms = now_ms;
    }

    pub(crate) fn data_sent(&mut self, amount: u32, preliminary: bool) {
        if preliminary {
            self.prel_bytes_since_update += amount;
        } else {
            self.bytes_since_update += amount;
        }
    }

    /// Upper-bound estimate of the current rate; not an exact average, but
    /// good enough for the pacing gate.
    pub(crate) fn get_average(&self, include_preliminary: bool) -> f32 {
        let preliminary = if include_preliminary {
            self.prel_bytes_since_update
        } else {
            0
        };
        self.average + self.bytes_since_update.max(preliminary) as f32
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_small_delta_is_noop() {
        let mut bw = BandwidthTracker::default();
        bw.data_sent(5000, false);
        bw.update_time(100);
        assert_eq!(5000.0, bw.get_average(false), "no fold below 100 ms");
    }

    #[test]
    fn test_average_folds_confirmed_rate() {
        let mut bw = BandwidthTracker::default();
        bw.data_sent(1000, false);
        bw.update_time(1000);
        // 1000 bytes over 1000 ms = 1000 B/s, one EMA step from zero
        assert_eq!(100.0, bw.get_average(false));
        assert_eq!(100.0, bw.get_average(true), "buckets were reset");
    }

    #[test]
    fn test_preliminary_only_counts_when_asked() {
        let mut bw = BandwidthTracker::default();
        bw.data_sent(300, true);
        bw.data_sent(100, false);
        assert_eq!(100.0, bw.get_average(false));
        assert_eq!(300.0, bw.get_average(true), "max of the two buckets");
    }

    #[test]
    fn test_preliminary_does_not_feed_average() {
        let mut bw = BandwidthTracker::default();
        bw.data_sent(100_000, true);
        bw.update_time(1000);
        assert_eq!(0.0, bw.get_average(true));
    }
}
