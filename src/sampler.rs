//! Sampling pipeline: periodic frame and stats emitters feeding an abstract
//! visualizer sink.
//!
//! Both emitters read the soup directly, without any lock a worker could
//! contend for; torn reads are acceptable for visualization. Backpressure
//! is the sink's problem: the bundled channel sink drops messages instead
//! of queueing when the consumer falls behind.
//!
//! Note: the channel sink and wire-message types are kept for embedding
//! transports even when the binary only uses the console sink.

#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::metrics::{shannon_entropy, MetricsTracker};
use crate::soup::{wrap, Soup};
use crate::supervisor::Supervisor;
use crate::vm::Ip;

/// Per-second aggregate statistics. The `generation` field carries the
/// elapsed-time string shown by the UI.
#[derive(Clone, Debug, Serialize)]
pub struct StatsRecord {
    pub generation: String,
    pub population: u32,
    #[serde(rename = "stepsPerSecond")]
    pub steps_per_second: u64,
    pub entropy: f64,
}

/// An IP position inside the current view window, in absolute soup
/// coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IpLocation {
    pub x: i32,
    pub y: i32,
}

/// Wire shape of the IP-locations message.
#[derive(Debug, Serialize)]
pub struct IpLocationsMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub locations: &'a [IpLocation],
}

/// Where frames, stats, and IP locations go. Transport, encoding, and
/// backpressure are the implementation's concern; emitters never block on
/// a sink.
pub trait VisualizerSink: Send + Sync {
    /// Raw byte buffer of the sampled window (the pixel frame).
    fn frame(&self, pixels: &[u8]);
    fn stats(&self, stats: &StatsRecord);
    fn ip_locations(&self, locations: &[IpLocation]);
}

/// Prints stats lines to stdout and discards frames.
pub struct ConsoleSink;

impl VisualizerSink for ConsoleSink {
    fn frame(&self, _pixels: &[u8]) {}

    fn stats(&self, stats: &StatsRecord) {
        println!(
            "{} | Pop: {:<6} | Steps/s: {:<12} | Entropy: {:.4} bits",
            stats.generation, stats.population, stats.steps_per_second, stats.entropy
        );
    }

    fn ip_locations(&self, _locations: &[IpLocation]) {}
}

/// Messages a `ChannelSink` forwards to its consumer.
#[derive(Debug)]
pub enum SinkMessage {
    Frame(Vec<u8>),
    Stats(StatsRecord),
    IpLocations(Vec<IpLocation>),
}

/// A bounded, never-blocking sink. When the consumer cannot keep up the
/// send fails and the message is dropped; the next tick's message wins.
pub struct ChannelSink {
    tx: SyncSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (Self { tx }, rx)
    }

    fn push(&self, msg: SinkMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl VisualizerSink for ChannelSink {
    fn frame(&self, pixels: &[u8]) {
        self.push(SinkMessage::Frame(pixels.to_vec()));
    }

    fn stats(&self, stats: &StatsRecord) {
        self.push(SinkMessage::Stats(stats.clone()));
    }

    fn ip_locations(&self, locations: &[IpLocation]) {
        self.push(SinkMessage::IpLocations(locations.to_vec()));
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SamplerConfig {
    pub target_fps: u32,
    pub vis_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { target_fps: 30, vis_size: 65536 }
    }
}

/// Copy a square window of `sqrt(vis_size)` per side out of the soup,
/// starting at a linear index and wrapping toroidally on both axes.
pub fn sample_window(soup: &Soup, start_index: usize, vis_size: usize) -> Vec<u8> {
    let side = (vis_size as f64).sqrt() as i32;
    let start_x = (start_index % soup.dim_x() as usize) as i32;
    let start_y = (start_index / soup.dim_x() as usize) as i32;

    let mut window = Vec::with_capacity((side * side) as usize);
    for y in 0..side {
        for x in 0..side {
            window.push(soup.get(start_x + x, start_y + y) as u8);
        }
    }
    window
}

/// The live IP positions that fall inside the window, handling wrap-around
/// relative to the window origin.
pub fn locations_in_window(
    ips: &[Arc<Ip>],
    soup: &Soup,
    start_index: usize,
    vis_size: usize,
) -> Vec<IpLocation> {
    let side = (vis_size as f64).sqrt() as i32;
    let start_x = (start_index % soup.dim_x() as usize) as i32;
    let start_y = (start_index / soup.dim_x() as usize) as i32;

    ips.iter()
        .filter_map(|ip| {
            let (x, y) = ip.position();
            let dx = wrap(x - start_x, soup.dim_x());
            let dy = wrap(y - start_y, soup.dim_y());
            if dx < side && dy < side {
                Some(IpLocation { x, y })
            } else {
                None
            }
        })
        .collect()
}

fn emit_frame(supervisor: &Supervisor, sink: &dyn VisualizerSink, vis_size: usize) {
    let start = supervisor.view_start_index();
    let pixels = sample_window(supervisor.soup(), start, vis_size);
    sink.frame(&pixels);

    let ips = supervisor.population();
    let locations = locations_in_window(&ips, supervisor.soup(), start, vis_size);
    if !locations.is_empty() {
        sink.ip_locations(&locations);
    }
}

/// Emit frames at roughly `target_fps` while running, plus on-demand frames
/// requested through `request_rx` (pause, step-once, view changes).
pub fn spawn_frame_emitter(
    supervisor: Arc<Supervisor>,
    sink: Arc<dyn VisualizerSink>,
    request_rx: Receiver<()>,
    config: SamplerConfig,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let period = Duration::from_secs(1) / config.target_fps.max(1);
        loop {
            if supervisor.is_terminating() {
                break;
            }
            let emit = match request_rx.recv_timeout(period) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => !supervisor.is_paused(),
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if emit {
                emit_frame(&supervisor, &*sink, config.vis_size);
            }
        }
    })
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Emit one stats record per second while running: population, steps per
/// second, Shannon entropy over the view window, and the elapsed time.
pub fn spawn_stats_emitter(
    supervisor: Arc<Supervisor>,
    sink: Arc<dyn VisualizerSink>,
    mut metrics: Option<MetricsTracker>,
    config: SamplerConfig,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last_total_steps = 0u64;
        loop {
            if supervisor.is_terminating() {
                break;
            }
            if supervisor.is_paused() {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            thread::sleep(Duration::from_secs(1));

            let total_steps = supervisor.total_steps();
            let steps_per_second = total_steps.saturating_sub(last_total_steps);
            last_total_steps = total_steps;

            let window = sample_window(
                supervisor.soup(),
                supervisor.view_start_index(),
                config.vis_size,
            );
            let sample = supervisor.bump_generation();

            let stats = StatsRecord {
                generation: format_elapsed(supervisor.elapsed()),
                population: supervisor.ip_count(),
                steps_per_second,
                entropy: shannon_entropy(&window),
            };
            sink.stats(&stats);

            if let Some(tracker) = metrics.as_mut() {
                tracker.record(sample, stats.population, steps_per_second, &window);
            }
        }
    })
}
