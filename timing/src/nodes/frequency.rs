//! The multiplexed clock frequency counter found in IO blocks and endpoints

use crate::{
    node::Node,
    transport::{
        Transport,
        TransportResult,
    },
};
use std::time::Duration;
use tracing::debug;

/// MHz per count for an undivided input
const MHZ_PER_COUNT: f64 = 119.209_28 / 1e6;

/// Counting window the firmware needs before a measurement settles
pub const DEFAULT_GATE: Duration = Duration::from_secs(2);

/// A frequency counter, measuring one input channel at a time
#[derive(Debug)]
pub struct FrequencyCounter<T> {
    node: Node<T>,
    gate: Duration,
}

impl<T> FrequencyCounter<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>) -> Self {
        Self::with_gate(node, DEFAULT_GATE)
    }

    #[must_use]
    pub fn with_gate(node: Node<T>, gate: Duration) -> Self {
        Self { node, gate }
    }

    /// Frequency of channel `chan` in MHz, whose input runs through a divide by `divisor`.
    /// NaN if the counter didn't produce a valid count.
    /// # Errors
    /// Returns an error on transport errors
    pub fn measure(&self, chan: u32, divisor: u32) -> TransportResult<f64> {
        self.node.write("ctrl.chan_sel", chan)?;
        self.node.write("ctrl.en_crap_mode", 0)?;
        self.node.dispatch()?;
        std::thread::sleep(self.gate);
        let count = self.node.read("freq.count")?;
        let valid = self.node.read("freq.valid")?;
        let freq = if valid == 0 {
            f64::NAN
        } else {
            f64::from(count) * MHZ_PER_COUNT / f64::from(divisor.max(1))
        };
        debug!(chan, count, valid, freq, "Measured frequency");
        Ok(freq)
    }

    /// Frequencies of the first `channels` inputs, undivided
    /// # Errors
    /// Returns an error on transport errors
    pub fn measure_frequencies(&self, channels: u32) -> TransportResult<Vec<f64>> {
        (0..channels).map(|c| self.measure(c, 1)).collect()
    }

    /// Frequencies of inputs with the given divisors, channel `i` using `divisors[i]`
    /// # Errors
    /// Returns an error on transport errors
    pub fn measure_divided(&self, divisors: &[u32]) -> TransportResult<Vec<f64>> {
        (0u32..)
            .zip(divisors)
            .map(|(c, d)| self.measure(c, *d))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{
        mock_hw,
        with_mock,
    };

    const TABLE: &str = "
?register io.freq.ctrl.chan_sel 0x0 0xf 1
?register io.freq.ctrl.en_crap_mode 0x0 0x10 1
?register io.freq.freq.count 0x1 0x0fffffff 1 r
?register io.freq.freq.valid 0x1 0x10000000 1 r
";

    #[test]
    fn test_measure() {
        let hw = mock_hw(TABLE);
        let freq = FrequencyCounter::with_gate(Node::new(&hw, "io.freq"), Duration::ZERO);
        // 50 MHz worth of counts, then an invalid measurement
        with_mock(&hw, |m| {
            m.poke(0, 0x10);
            m.script(1, [0x1000_0000 | 419_430, 0x1000_0000 | 419_430, 0, 0]);
        });
        let freqs = freq.measure_frequencies(2).unwrap();
        assert!((freqs[0] - 50.0).abs() < 1e-3);
        assert!(freqs[1].is_nan());
        // Channel selected and crap mode cleared
        assert_eq!(with_mock(&hw, |m| m.writes_to(0)), vec![0x10, 0x0, 0x1, 0x1]);
    }

    #[test]
    fn test_divided() {
        let hw = mock_hw(TABLE);
        let freq = FrequencyCounter::with_gate(Node::new(&hw, "io.freq"), Duration::ZERO);
        with_mock(&hw, |m| m.poke(1, 0x1000_0000 | 8_389));
        let freqs = freq.measure_divided(&[1, 64]).unwrap();
        assert!((freqs[0] - 1.0).abs() < 1e-3);
        assert!((freqs[1] - 1.0 / 64.0).abs() < 1e-4);
    }
}
