use power_core::collector::RetryingCollector;
use power_core::monitor::{Delay, MonitorStatus, PowerMonitor, UsbPassthrough};
use power_core::rate::{DecimationMode, RateConverter};
use std::time::Duration;

/// Monitor that hands out a deterministic ramp in batches of varying size.
struct RampMonitor {
    next: u32,
    end: u32,
    batch_sizes: Vec<u32>,
    pulls: usize,
}

impl PowerMonitor for RampMonitor {
    fn start_collection(&mut self) {}

    fn stop_collection(&mut self) {}

    fn collect(&mut self) -> Option<Vec<f64>> {
        if self.next > self.end {
            return None;
        }
        let size = self.batch_sizes[self.pulls % self.batch_sizes.len()];
        self.pulls += 1;
        let last = (self.next + size - 1).min(self.end);
        let batch = (self.next..=last).map(f64::from).collect();
        self.next = last + 1;
        Some(batch)
    }

    fn status(&mut self) -> Option<MonitorStatus> {
        None
    }

    fn set_usb_passthrough(&mut self, _: UsbPassthrough) {}

    fn set_voltage(&mut self, _: f64) {}

    fn set_max_current(&mut self, _: f64) {}

    fn close(&mut self) {}
}

struct NoSleep;

impl Delay for NoSleep {
    fn sleep(&mut self, _: Duration) {}
}

#[test]
fn block_means_match_for_several_rate_pairs() {
    for (native, target) in [(1000, 100), (5000, 300), (100, 100), (977, 10)] {
        let mut converter = RateConverter::new(native, target, DecimationMode::FixedWindow)
            .expect("native rate is non-zero");
        let block = converter.decimate_by();
        let samples: Vec<f64> = (1..=2500).map(f64::from).collect();

        converter.push(&samples);
        let measurements: Vec<f64> = converter.ready().collect();

        assert_eq!(
            measurements.len(),
            samples.len() / block,
            "{native} -> {target}: floor(len / block) measurements expected"
        );
        for (index, value) in measurements.iter().enumerate() {
            let chunk = &samples[index * block..(index + 1) * block];
            let expected = chunk.iter().sum::<f64>() / chunk.len() as f64;
            assert!(
                (value - expected).abs() < 1e-9,
                "{native} -> {target}: block {index} was {value}, expected {expected}"
            );
        }
    }
}

#[test]
fn collector_output_is_independent_of_batch_boundaries() {
    let monitor = RampMonitor {
        next: 1,
        end: 1000,
        batch_sizes: vec![1, 7, 64, 3, 250],
        pulls: 0,
    };
    let mut collector = RetryingCollector::new(monitor, NoSleep, 1000);

    let measurements = collector
        .collect(100, 100)
        .expect("ramp holds exactly enough samples");

    assert_eq!(measurements.len(), 100);
    assert!((measurements[0] - 5.5).abs() < 1e-9);
    assert!((measurements[57] - 575.5).abs() < 1e-9);
    assert!((measurements[99] - 995.5).abs() < 1e-9);
}
