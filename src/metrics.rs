//! Aggregate metrics over the visualization window.
//!
//! Shannon entropy feeds the per-second stats record. The tracker also
//! follows the Brotli compression ratio of the window: uniform random soup
//! barely compresses, while a soup taken over by self-reinforcing code
//! patterns compresses well, so a sustained rise above the early-run
//! baseline is reported once as an emergence signal.

#![allow(dead_code)] // Metrics are conditionally used based on config

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::Instant;

/// Zero-order Shannon entropy in bits over byte frequencies,
/// `H = -sum(p_i * log2(p_i))`.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let total = data.len() as f64;
    let mut h = 0.0;
    for &count in &counts {
        if count > 0 {
            let p = count as f64 / total;
            h -= p * p.log2();
        }
    }
    h
}

/// Configuration for metrics collection
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    pub enabled: bool,
    /// Samples between collections (stats samples arrive once per second)
    pub interval: u64,
    /// Path to CSV output file (None = detection only)
    pub output_path: Option<String>,
    /// Brotli compression quality (1-11, lower = faster)
    pub brotli_quality: u32,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10,
            output_path: None,
            brotli_quality: 4,
        }
    }
}

/// Collected metrics for a single sample
#[derive(Clone, Debug)]
pub struct SampleMetrics {
    pub sample: u64,
    pub elapsed_secs: u64,
    pub population: u32,
    pub steps_per_second: u64,
    pub entropy: f64,
    pub compression_ratio: f64,
    pub compressed_size: usize,
}

impl SampleMetrics {
    /// Format as CSV row
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{:.4},{:.4},{}",
            self.sample,
            self.elapsed_secs,
            self.population,
            self.steps_per_second,
            self.entropy,
            self.compression_ratio,
            self.compressed_size,
        )
    }

    /// CSV header
    pub fn csv_header() -> &'static str {
        "sample,elapsed_secs,population,steps_per_second,entropy,compression_ratio,compressed_size"
    }
}

/// Collects per-sample metrics, appends them to a CSV file, and watches for
/// the emergence phase transition.
pub struct MetricsTracker {
    config: MetricsConfig,
    csv_writer: Option<BufWriter<File>>,
    start: Instant,
    /// Baseline ratio from the first collection (near-random soup)
    baseline_ratio: Option<f64>,
    /// Consecutive collections above the elevation thresholds
    elevated_count: usize,
    emergence_sample: Option<u64>,
}

impl MetricsTracker {
    pub fn new(config: MetricsConfig) -> std::io::Result<Self> {
        let csv_writer = if let Some(ref path) = config.output_path {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", SampleMetrics::csv_header())?;
            Some(writer)
        } else {
            None
        };

        Ok(Self {
            config,
            csv_writer,
            start: Instant::now(),
            baseline_ratio: None,
            elevated_count: 0,
            emergence_sample: None,
        })
    }

    /// Record one stats sample. Only every `interval`-th sample is collected.
    pub fn record(
        &mut self,
        sample: u64,
        population: u32,
        steps_per_second: u64,
        window: &[u8],
    ) -> Option<SampleMetrics> {
        if !self.config.enabled || self.config.interval == 0 || sample % self.config.interval != 0 {
            return None;
        }

        let (compressed_size, compression_ratio) =
            compression_ratio(window, self.config.brotli_quality);

        let metrics = SampleMetrics {
            sample,
            elapsed_secs: self.start.elapsed().as_secs(),
            population,
            steps_per_second,
            entropy: shannon_entropy(window),
            compression_ratio,
            compressed_size,
        };

        // The first collection happens while the soup is still near its
        // random seeding and serves as the baseline.
        if self.baseline_ratio.is_none() {
            self.baseline_ratio = Some(compression_ratio);
        }

        // Emergence criteria: ratio well above baseline AND above an
        // absolute floor, sustained over consecutive collections.
        let baseline = self.baseline_ratio.unwrap_or(1.0);
        if self.emergence_sample.is_none() {
            if compression_ratio > baseline * 2.0 && compression_ratio > 2.5 {
                self.elevated_count += 1;
                if self.elevated_count >= 5 {
                    self.emergence_sample = Some(sample);
                    println!(
                        "Emergence signal at sample {}: compression ratio {:.2} (baseline {:.2}), sustained for {} collections",
                        sample, compression_ratio, baseline, self.elevated_count
                    );
                }
            } else {
                self.elevated_count = 0;
            }
        }

        if let Some(ref mut writer) = self.csv_writer {
            let _ = writeln!(writer, "{}", metrics.to_csv_row());
            let _ = writer.flush();
        }

        Some(metrics)
    }

    /// The sample at which the emergence signal fired, if it has.
    pub fn emergence_sample(&self) -> Option<u64> {
        self.emergence_sample
    }
}

/// Brotli compression ratio of `data`: original size over compressed size.
fn compression_ratio(data: &[u8], quality: u32) -> (usize, f64) {
    use brotli::enc::BrotliEncoderParams;

    if data.is_empty() {
        return (0, 1.0);
    }

    let mut compressed = Vec::new();
    let mut params = BrotliEncoderParams::default();
    params.quality = quality as i32;

    match brotli::BrotliCompress(&mut std::io::Cursor::new(data), &mut compressed, &params) {
        Ok(_) => {
            let ratio = data.len() as f64 / compressed.len() as f64;
            (compressed.len(), ratio)
        }
        Err(_) => (data.len(), 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_entropy_degenerate_cases() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 1024]), 0.0);
    }

    #[test]
    fn test_entropy_two_symbols() {
        let mut data = vec![0u8; 512];
        data.extend(vec![255u8; 512]);
        let h = shannon_entropy(&data);
        assert!((h - 1.0).abs() < 1e-9, "expected 1 bit, got {}", h);
    }

    #[test]
    fn test_entropy_uniform_is_eight_bits() {
        let data: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
        let h = shannon_entropy(&data);
        assert!((h - 8.0).abs() < 1e-9, "expected 8 bits, got {}", h);
    }

    #[test]
    fn test_compression_ratio_separates_random_from_repetitive() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let random: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
        let (_, random_ratio) = compression_ratio(&random, 4);

        let repetitive = vec![b'A'; 4096];
        let (_, repetitive_ratio) = compression_ratio(&repetitive, 4);

        assert!(random_ratio < 1.5, "random ratio {}", random_ratio);
        assert!(repetitive_ratio > 10.0, "repetitive ratio {}", repetitive_ratio);
    }

    #[test]
    fn test_tracker_respects_interval() {
        let mut tracker = MetricsTracker::new(MetricsConfig {
            enabled: true,
            interval: 5,
            output_path: None,
            brotli_quality: 4,
        })
        .unwrap();

        let window = vec![0u8; 256];
        assert!(tracker.record(1, 10, 100, &window).is_none());
        assert!(tracker.record(5, 10, 100, &window).is_some());
        assert!(tracker.record(7, 10, 100, &window).is_none());
        assert!(tracker.record(10, 10, 100, &window).is_some());
    }

    #[test]
    fn test_emergence_requires_sustained_elevation() {
        let mut tracker = MetricsTracker::new(MetricsConfig {
            enabled: true,
            interval: 1,
            output_path: None,
            brotli_quality: 4,
        })
        .unwrap();

        // Baseline on incompressible data.
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let random: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();
        tracker.record(1, 10, 100, &random).unwrap();
        assert!(tracker.emergence_sample().is_none());

        // Four elevated collections are not enough.
        let repetitive = vec![b'A'; 4096];
        for sample in 2..6 {
            tracker.record(sample, 10, 100, &repetitive).unwrap();
        }
        assert!(tracker.emergence_sample().is_none());

        // The fifth consecutive one fires the signal, exactly once.
        tracker.record(6, 10, 100, &repetitive).unwrap();
        assert_eq!(tracker.emergence_sample(), Some(6));
        tracker.record(7, 10, 100, &repetitive).unwrap();
        assert_eq!(tracker.emergence_sample(), Some(6));
    }

    #[test]
    fn test_csv_output() {
        let path = std::env::temp_dir().join(format!("evosoup_metrics_{}.csv", std::process::id()));
        {
            let mut tracker = MetricsTracker::new(MetricsConfig {
                enabled: true,
                interval: 1,
                output_path: Some(path.to_string_lossy().into_owned()),
                brotli_quality: 4,
            })
            .unwrap();
            tracker.record(1, 42, 12345, &vec![0u8; 256]).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some(SampleMetrics::csv_header()));
        let row = lines.next().unwrap();
        assert!(row.starts_with("1,"));
        assert!(row.contains(",42,12345,"));
        let _ = std::fs::remove_file(&path);
    }
}
