//! # Transformation Functions
//!
//! A transformation turns the events of interval N into the events of
//! interval N for the other simulator. It never sees two intervals at once
//! and the interval header passes through unchanged.
//!
//! ```text
//! RateToSpike   (time, region, rate Hz)  ──►  (spike time, channel, 1.0)
//! SpikeToRate   (spike time, channel, w) ──►  (bin start, region, rate Hz)
//! Identity      events                   ──►  same events
//! ```
//!
//! Random draws come from a generator seeded per `(seed, interval, channel)`
//! so the output only depends on the input, never on scheduling.

use interscale_core::{Event, IdentifierMapping, Interval, SynchronizationBuffer};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

/// Transformation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    /// A parameter makes the transformation meaningless.
    #[error("invalid parameter {name} = {value}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// The input holds a value the transformation cannot use.
    #[error("interval {index}: invalid input {what}")]
    InvalidInput {
        /// Interval index.
        index: u64,
        /// Description.
        what: String,
    },
}

/// Upper bound on histogram bins per region and interval.
pub const MAX_BINS: usize = 1 << 20;

/// Rejects interval bounds no event time can fall between.
fn check_bounds(interval: &Interval) -> Result<(), TransformError> {
    if interval.start.is_finite() && interval.end.is_finite() && interval.end >= interval.start {
        Ok(())
    } else {
        Err(TransformError::InvalidInput {
            index: interval.index,
            what: format!("interval bounds [{}, {})", interval.start, interval.end),
        })
    }
}

/// Pluggable conversion applied by the Transformer stage.
pub trait Transform: Send {
    /// Converts one interval.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if the input cannot be converted.
    fn transform(&mut self, input: &SynchronizationBuffer) -> Result<SynchronizationBuffer, TransformError>;

    /// Name for logs.
    fn name(&self) -> &'static str;
}

/// Passes events through unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Transform for Identity {
    fn transform(&mut self, input: &SynchronizationBuffer) -> Result<SynchronizationBuffer, TransformError> {
        Ok(input.clone())
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Inhomogeneous Bernoulli spike generation from region rates.
///
/// Every channel of a region receives an independent spike train driven by
/// the region's rate samples. A sample at time `t` holds until the next
/// sample or the end of the interval.
#[derive(Clone, Debug)]
pub struct RateToSpike {
    mapping: IdentifierMapping,
    seed: u64,
    rate_scale: f64,
}

impl RateToSpike {
    /// Creates the transformation.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidParameter`] for a negative or
    /// non-finite scale.
    pub fn new(mapping: IdentifierMapping, seed: u64, rate_scale: f64) -> Result<Self, TransformError> {
        if !(rate_scale.is_finite() && rate_scale >= 0.0) {
            return Err(TransformError::InvalidParameter {
                name: "rate_scale",
                value: rate_scale,
            });
        }
        Ok(Self {
            mapping,
            seed,
            rate_scale,
        })
    }

    fn rng(&self, interval: u64, channel: u64) -> ChaCha8Rng {
        // splitmix64 finaliser over the three inputs
        let mut z = self.seed
            ^ interval.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ channel.wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        ChaCha8Rng::seed_from_u64(z ^ (z >> 31))
    }
}

impl Transform for RateToSpike {
    fn transform(&mut self, input: &SynchronizationBuffer) -> Result<SynchronizationBuffer, TransformError> {
        let interval = input.interval;
        check_bounds(&interval)?;
        let mut output = SynchronizationBuffer::new(interval);

        for (region, range) in self.mapping.entries() {
            let mut samples: Vec<Event> = input.events_for(*region).copied().collect();
            if samples.is_empty() {
                continue;
            }
            if let Some(bad) = samples.iter().find(|e| !e.value.is_finite() || e.value < 0.0) {
                return Err(TransformError::InvalidInput {
                    index: interval.index,
                    what: format!("rate {} for region {region}", bad.value),
                });
            }
            if let Some(bad) = samples.iter().find(|e| !e.time.is_finite()) {
                return Err(TransformError::InvalidInput {
                    index: interval.index,
                    what: format!("sample time {} for region {region}", bad.time),
                });
            }
            samples.sort_by(|a, b| a.time.total_cmp(&b.time));

            for channel in range.ids() {
                let mut rng = self.rng(interval.index, channel);
                for (i, sample) in samples.iter().enumerate() {
                    let until = samples.get(i + 1).map_or(interval.end, |next| next.time);
                    let dt = until - sample.time;
                    if dt <= 0.0 {
                        continue;
                    }
                    let p = (sample.value * self.rate_scale * dt / 1000.0).clamp(0.0, 1.0);
                    // Both draws are always taken so streams stay aligned.
                    let hit: f64 = rng.gen();
                    let offset: f64 = rng.gen();
                    if hit < p {
                        output.events.push(Event::new(sample.time + offset * dt, channel, 1.0));
                    }
                }
            }
        }

        tracing::trace!(index = interval.index, spikes = output.len(), "rates converted");
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "rate_to_spike"
    }
}

/// Population rate histogram from channel spikes.
///
/// Spikes of every channel in a region's range are counted in bins of
/// `width` ms from the interval start. The count is normalized by the
/// number of channels and the bin width into Hz. The last bin may be
/// shorter than `width`.
#[derive(Clone, Debug)]
pub struct SpikeToRate {
    mapping: IdentifierMapping,
    width: f64,
}

impl SpikeToRate {
    /// Creates the transformation.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidParameter`] for a non-positive width.
    pub fn new(mapping: IdentifierMapping, width: f64) -> Result<Self, TransformError> {
        if !(width.is_finite() && width > 0.0) {
            return Err(TransformError::InvalidParameter { name: "width", value: width });
        }
        Ok(Self { mapping, width })
    }
}

impl Transform for SpikeToRate {
    #[allow(clippy::cast_precision_loss)]
    fn transform(&mut self, input: &SynchronizationBuffer) -> Result<SynchronizationBuffer, TransformError> {
        let interval = input.interval;
        check_bounds(&interval)?;
        let mut output = SynchronizationBuffer::new(interval);
        let length = interval.length();
        if length <= 0.0 {
            return Ok(output);
        }

        let bins = (length / self.width).ceil().max(1.0);
        if bins > MAX_BINS as f64 {
            return Err(TransformError::InvalidInput {
                index: interval.index,
                what: format!("{bins} bins of width {} exceed {MAX_BINS}", self.width),
            });
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bins = bins as usize;

        for (region, range) in self.mapping.entries() {
            let mut counts = vec![0u64; bins];
            for event in input.events.iter().filter(|e| range.contains(e.id)) {
                let offset = event.time - interval.start;
                if offset < 0.0 || offset >= length {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let bin = ((offset / self.width) as usize).min(bins - 1);
                counts[bin] += 1;
            }

            for (bin, count) in counts.into_iter().enumerate() {
                let start = interval.start + bin as f64 * self.width;
                let bin_width = (interval.end - start).min(self.width);
                let rate = if range.count == 0 {
                    0.0
                } else {
                    count as f64 / (range.count as f64 * bin_width / 1000.0)
                };
                output.events.push(Event::new(start, *region, rate));
            }
        }

        Ok(output)
    }

    fn name(&self) -> &'static str {
        "spike_to_rate"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interscale_core::{ChannelRange, Interval};

    fn mapping() -> IdentifierMapping {
        IdentifierMapping::new(vec![(0, ChannelRange::new(5, 2)), (1, ChannelRange::new(7, 3))])
    }

    fn rates(rate: f64) -> SynchronizationBuffer {
        SynchronizationBuffer::with_events(
            Interval::new(4, 0.0, 100.0),
            (0..100)
                .flat_map(|t| [Event::new(f64::from(t), 0, rate), Event::new(f64::from(t), 1, rate)])
                .collect(),
        )
    }

    #[test]
    fn test_rate_to_spike_is_deterministic() {
        let mut a = RateToSpike::new(mapping(), 42, 1.0).unwrap();
        let mut b = RateToSpike::new(mapping(), 42, 1.0).unwrap();
        let first = a.transform(&rates(200.0)).unwrap();
        assert_eq!(first, b.transform(&rates(200.0)).unwrap());
        assert_eq!(first, a.transform(&rates(200.0)).unwrap());

        let mut other_seed = RateToSpike::new(mapping(), 43, 1.0).unwrap();
        assert_ne!(first, other_seed.transform(&rates(200.0)).unwrap());
    }

    #[test]
    fn test_rate_to_spike_targets_mapped_channels() {
        let mut transform = RateToSpike::new(mapping(), 1, 1.0).unwrap();
        let output = transform.transform(&rates(200.0)).unwrap();

        assert_eq!(output.interval, Interval::new(4, 0.0, 100.0));
        assert!(output.events.iter().all(|e| (5..10).contains(&e.id)));
        assert!(output.events.iter().all(|e| e.time >= 0.0 && e.time < 100.0));
        // 200 Hz over 100 ms: about 20 spikes per channel.
        for channel in 5..10 {
            let spikes = output.events_for(channel).count();
            assert!((5..=40).contains(&spikes), "channel {channel}: {spikes} spikes");
        }
    }

    #[test]
    fn test_zero_rate_produces_no_spikes() {
        let mut transform = RateToSpike::new(mapping(), 1, 1.0).unwrap();
        assert!(transform.transform(&rates(0.0)).unwrap().is_empty());
        let mut silenced = RateToSpike::new(mapping(), 1, 0.0).unwrap();
        assert!(silenced.transform(&rates(500.0)).unwrap().is_empty());
    }

    #[test]
    fn test_rate_to_spike_rejects_negative_rate() {
        let mut transform = RateToSpike::new(mapping(), 1, 1.0).unwrap();
        assert!(matches!(
            transform.transform(&rates(-1.0)),
            Err(TransformError::InvalidInput { index: 4, .. })
        ));
        assert!(RateToSpike::new(mapping(), 1, f64::NAN).is_err());
    }

    #[test]
    fn test_spike_to_rate_histogram() {
        let mut transform = SpikeToRate::new(mapping(), 20.0).unwrap();
        let spikes = SynchronizationBuffer::with_events(
            Interval::new(0, 100.0, 150.0),
            vec![
                Event::new(101.0, 5, 1.0),
                Event::new(119.0, 6, 1.0),
                Event::new(125.0, 7, 1.0),
                Event::new(149.0, 9, 1.0),
                Event::new(149.0, 42, 1.0),
            ],
        );
        let output = transform.transform(&spikes).unwrap();

        // 3 bins (20, 20, 10 ms) per region.
        assert_eq!(output.len(), 6);
        let region0: Vec<f64> = output.events_for(0).map(|e| e.value).collect();
        let region1: Vec<f64> = output.events_for(1).map(|e| e.value).collect();
        // 2 spikes / (2 channels * 20 ms) = 50 Hz
        assert!((region0[0] - 50.0).abs() < 1e-9);
        assert!(region0[1].abs() < 1e-9);
        // 1 spike / (3 channels * 20 ms)
        assert!((region1[1] - 1000.0 / 60.0).abs() < 1e-9);
        // 1 spike / (3 channels * 10 ms)
        assert!((region1[2] - 1000.0 / 30.0).abs() < 1e-9);
        assert!((output.events_for(1).last().unwrap().time - 140.0).abs() < 1e-9);
    }

    #[test]
    fn test_spike_to_rate_rejects_bad_width() {
        assert!(SpikeToRate::new(mapping(), 0.0).is_err());
        assert!(SpikeToRate::new(mapping(), -3.0).is_err());
    }

    #[test]
    fn test_unbounded_interval_is_rejected() {
        let open_ended = SynchronizationBuffer::with_events(
            Interval::new(9, 0.0, f64::INFINITY),
            vec![Event::new(1.0, 5, 1.0)],
        );
        let mut histogram = SpikeToRate::new(mapping(), 20.0).unwrap();
        assert!(matches!(
            histogram.transform(&open_ended),
            Err(TransformError::InvalidInput { index: 9, .. })
        ));

        let inverted = SynchronizationBuffer::new(Interval::new(2, 50.0, 10.0));
        assert!(histogram.transform(&inverted).is_err());

        let mut spikes = RateToSpike::new(mapping(), 1, 1.0).unwrap();
        assert!(matches!(
            spikes.transform(&open_ended),
            Err(TransformError::InvalidInput { index: 9, .. })
        ));
    }

    #[test]
    fn test_spike_to_rate_caps_bin_count() {
        let mut transform = SpikeToRate::new(mapping(), 1e-3).unwrap();
        let huge = SynchronizationBuffer::new(Interval::new(0, 0.0, 1e6));
        assert!(matches!(
            transform.transform(&huge),
            Err(TransformError::InvalidInput { index: 0, .. })
        ));

        // Exactly at the cap is still served.
        #[allow(clippy::cast_precision_loss)]
        let at_cap = SynchronizationBuffer::new(Interval::new(1, 0.0, MAX_BINS as f64));
        let mut unit = SpikeToRate::new(IdentifierMapping::new(vec![(0, ChannelRange::new(0, 1))]), 1.0).unwrap();
        assert_eq!(unit.transform(&at_cap).unwrap().len(), MAX_BINS);
    }

    #[test]
    fn test_identity() {
        let input = rates(10.0);
        assert_eq!(Identity.transform(&input).unwrap(), input);
    }
}
