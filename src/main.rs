mod control;
mod metrics;
mod sampler;
mod snapshot;
mod soup;
mod supervisor;
mod vm;

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use metrics::{MetricsConfig, MetricsTracker};
use sampler::{ConsoleSink, SamplerConfig, VisualizerSink};
use snapshot::Snapshot;
use supervisor::{Supervisor, SupervisorParams};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Soup dimensions
    pub soup: SoupConfig,
    /// Initial population
    pub population: PopulationConfig,
    /// Addressing-mode defaults for all IPs
    pub addressing: AddressingConfig,
    /// Cosmic-ray mutator
    pub cosmic_rays: CosmicRayConfig,
    /// Frame and stats emitters
    pub sampling: SamplingConfig,
    /// Snapshot persistence
    pub snapshot: SnapshotConfig,
    /// Metrics collection (entropy / compression-ratio CSV)
    pub metrics: MetricsSettings,
    /// Run duration
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoupConfig {
    pub dim_x: i32,
    pub dim_y: i32,
}

impl Default for SoupConfig {
    fn default() -> Self {
        Self { dim_x: 1024, dim_y: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    pub initial_ips: u32,
    /// Random seed (0 = derive from the system clock)
    pub seed: u64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self { initial_ips: 4096, seed: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressingConfig {
    pub use_32_bit: bool,
    pub use_relative: bool,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self { use_32_bit: false, use_relative: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CosmicRayConfig {
    /// Probability per mutator iteration of one bit flip, in [0, 1]
    pub rate: f64,
}

impl Default for CosmicRayConfig {
    fn default() -> Self {
        Self { rate: 0.001 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub target_fps: u32,
    /// Bytes per frame; the window is square, side sqrt(vis_size)
    pub vis_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { target_fps: 30, vis_size: 65536 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Base path for periodic and final snapshots
    pub path: String,
    /// Minutes between periodic snapshots (0 = final snapshot only)
    pub interval_minutes: u64,
    /// Load this snapshot at startup instead of random seeding (empty = off)
    pub load_from: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: "snapshot.evs".to_string(),
            interval_minutes: 10,
            load_from: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
    /// Stats samples between collections
    pub interval: u64,
    /// CSV output path (empty = detection only)
    pub output_file: String,
    pub brotli_quality: u32,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10,
            output_file: String::new(),
            brotli_quality: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock run time in minutes; negative = run forever
    pub duration_minutes: i64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { duration_minutes: -1 }
    }
}

impl Config {
    pub fn from_yaml(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn write_template(path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let template = serde_yaml::to_string(&Config::default())?;
        fs::write(path, template)?;
        Ok(())
    }

    /// Check the configuration. Returns warnings for odd-but-usable values
    /// and an error for unusable ones.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if self.soup.dim_x <= 0 || self.soup.dim_y <= 0 {
            return Err(format!(
                "soup dimensions must be positive, got {}x{}",
                self.soup.dim_x, self.soup.dim_y
            ));
        }
        if !(0.0..=1.0).contains(&self.cosmic_rays.rate) {
            return Err(format!(
                "cosmic ray rate must be in [0, 1], got {}",
                self.cosmic_rays.rate
            ));
        }
        if self.sampling.target_fps == 0 {
            return Err("target_fps must be at least 1".to_string());
        }
        if self.sampling.vis_size == 0 {
            return Err("vis_size must be positive".to_string());
        }

        let side = (self.sampling.vis_size as f64).sqrt() as usize;
        if side * side != self.sampling.vis_size {
            warnings.push(format!(
                "vis_size {} is not a perfect square; the window will be {}x{} = {} bytes",
                self.sampling.vis_size,
                side,
                side,
                side * side
            ));
        }
        let soup_len = self.soup.dim_x as usize * self.soup.dim_y as usize;
        if self.sampling.vis_size > soup_len {
            warnings.push(format!(
                "vis_size {} exceeds the soup size {}; the window will wrap over itself",
                self.sampling.vis_size, soup_len
            ));
        }
        if self.population.initial_ips == 0 {
            warnings.push("initial_ips is 0; nothing will execute".to_string());
        }

        Ok(warnings)
    }
}

fn parse_args() -> Config {
    let mut config = Config::default();
    let argv: Vec<String> = env::args().collect();

    // First pass: config file handling.
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= argv.len() {
                    eprintln!("--config requires a path");
                    process::exit(1);
                }
                let config_path = &argv[i];
                match Config::from_yaml(config_path) {
                    Ok(loaded) => {
                        println!("Loaded config from: {}", config_path);
                        config = loaded;
                    }
                    Err(e) => {
                        eprintln!("Error loading config file '{}': {}", config_path, e);
                        process::exit(1);
                    }
                }
            }
            "--generate-config" => {
                i += 1;
                let output_path = if i < argv.len() && !argv[i].starts_with('-') {
                    argv[i].clone()
                } else {
                    "config.yaml".to_string()
                };
                match Config::write_template(&output_path) {
                    Ok(_) => {
                        println!("Generated config template: {}", output_path);
                        process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("Error writing config template: {}", e);
                        process::exit(1);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    // Second pass: CLI args override config file values.
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                i += 1; // skip, already processed
            }
            "--snapshot" => {
                i += 1;
                config.snapshot.path = argv[i].clone();
            }
            "--load" => {
                i += 1;
                config.snapshot.load_from = argv[i].clone();
            }
            "--duration" => {
                i += 1;
                config.run.duration_minutes = argv[i].parse().expect("Invalid duration");
            }
            "--seed" | "-s" => {
                i += 1;
                config.population.seed = argv[i].parse().expect("Invalid seed");
            }
            "--ips" => {
                i += 1;
                config.population.initial_ips = argv[i].parse().expect("Invalid ips");
            }
            "--dim-x" => {
                i += 1;
                config.soup.dim_x = argv[i].parse().expect("Invalid dim-x");
            }
            "--dim-y" => {
                i += 1;
                config.soup.dim_y = argv[i].parse().expect("Invalid dim-y");
            }
            "--cosmic-ray-rate" => {
                i += 1;
                config.cosmic_rays.rate = argv[i].parse().expect("Invalid cosmic-ray-rate");
            }
            "--fps" => {
                i += 1;
                config.sampling.target_fps = argv[i].parse().expect("Invalid fps");
            }
            "--vis-size" => {
                i += 1;
                config.sampling.vis_size = argv[i].parse().expect("Invalid vis-size");
            }
            "--metrics" => {
                config.metrics.enabled = true;
            }
            "--metrics-file" => {
                i += 1;
                config.metrics.output_file = argv[i].clone();
                config.metrics.enabled = true;
            }
            "--help" => {
                print_help();
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    match config.validate() {
        Ok(warnings) => {
            for warning in warnings {
                eprintln!("Config warning: {}", warning);
            }
        }
        Err(e) => {
            eprintln!("Config validation error: {}", e);
            process::exit(1);
        }
    }

    config
}

fn print_help() {
    println!("EvoSoup Artificial-Life Substrate");
    println!();
    println!("USAGE:");
    println!("    evosoup [OPTIONS]");
    println!("    evosoup --config config.yaml");
    println!("    evosoup --generate-config [output.yaml]");
    println!();
    println!("CONFIG FILE:");
    println!("    -c, --config <FILE>       Load settings from YAML config file");
    println!("    --generate-config [FILE]  Generate template config (default: config.yaml)");
    println!();
    println!("OPTIONS (override config file values):");
    println!("    --snapshot <PATH>         Base path for snapshots (default: snapshot.evs)");
    println!("    --load <PATH>             Load an initial snapshot instead of random seeding");
    println!("    --duration <MINUTES>      Run for a fixed duration; negative = forever");
    println!("    -s, --seed <N>            Random seed (default: 0 = from system clock)");
    println!("    --ips <N>                 Initial population size (default: 4096)");
    println!("    --dim-x <N>               Soup width (default: 1024)");
    println!("    --dim-y <N>               Soup height (default: 1024)");
    println!("    --cosmic-ray-rate <P>     Bit-flip probability in [0,1] (default: 0.001)");
    println!("    --fps <N>                 Target visualization FPS (default: 30)");
    println!("    --vis-size <N>            Bytes per frame window (default: 65536)");
    println!();
    println!("METRICS:");
    println!("    --metrics                 Enable metrics collection");
    println!("    --metrics-file <PATH>     Write metrics CSV to this path");
    println!();
    println!("CONTROL:");
    println!("    Line-delimited JSON control messages are read from stdin, e.g.");
    println!("    {{\"type\":\"command\",\"command\":\"pause\"}}");
    println!();
    println!("    --help                    Print this help message");
}

/// Save a snapshot every `interval_minutes`, until termination. Failures
/// are logged; the simulation continues.
fn spawn_periodic_snapshots(supervisor: Arc<Supervisor>, config: SnapshotConfig) -> JoinHandle<()> {
    thread::spawn(move || {
        if config.interval_minutes == 0 {
            return;
        }
        let interval = Duration::from_secs(config.interval_minutes * 60);
        let mut last = Instant::now();
        while !supervisor.is_terminating() {
            thread::sleep(Duration::from_secs(1));
            if last.elapsed() >= interval {
                last = Instant::now();
                let snapshot = supervisor.snapshot();
                match snapshot.save(Path::new(&config.path)) {
                    Ok(()) => println!("Snapshot saved to {}", config.path),
                    Err(e) => eprintln!("Error saving snapshot: {}", e),
                }
            }
        }
    })
}

fn main() {
    let config = parse_args();

    println!("EvoSoup Artificial-Life Substrate");
    println!("=================================\n");

    let seed = if config.population.seed != 0 {
        config.population.seed
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    };

    let soup_len = config.soup.dim_x as i64 * config.soup.dim_y as i64;
    println!("Configuration:");
    println!(
        "  Soup: {} cells ({}x{})",
        soup_len, config.soup.dim_x, config.soup.dim_y
    );
    println!("  Initial IPs: {}", config.population.initial_ips);
    println!("  Seed: {}", seed);
    println!(
        "  Addressing: {} / {}",
        if config.addressing.use_32_bit { "32-bit" } else { "8-bit" },
        if config.addressing.use_relative { "relative" } else { "absolute" },
    );
    println!("  Cosmic ray rate: {}", config.cosmic_rays.rate);
    println!(
        "  Sampling: {} fps, {}-byte window",
        config.sampling.target_fps, config.sampling.vis_size
    );
    if config.metrics.enabled {
        println!("  Metrics: every {} samples", config.metrics.interval);
    }
    println!();

    let supervisor = Arc::new(Supervisor::new(SupervisorParams {
        dim_x: config.soup.dim_x,
        dim_y: config.soup.dim_y,
        initial_ips: config.population.initial_ips,
        seed,
        wide_addressing: config.addressing.use_32_bit,
        relative_addressing: config.addressing.use_relative,
        cosmic_ray_rate: config.cosmic_rays.rate,
    }));

    if !config.snapshot.load_from.is_empty() {
        let load_path = &config.snapshot.load_from;
        let snapshot = match Snapshot::load(Path::new(load_path)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                eprintln!("Error loading snapshot '{}': {}", load_path, e);
                process::exit(1);
            }
        };
        if let Err(e) = supervisor.apply_snapshot(&snapshot) {
            eprintln!("Error applying snapshot '{}': {}", load_path, e);
            process::exit(1);
        }
        println!(
            "Loaded snapshot from {} (generation {}, {} IPs)",
            load_path,
            snapshot.generation,
            snapshot.ips.len()
        );
    } else {
        println!(
            "Simulation starting with {} IPs in a soup of {} cells.",
            config.population.initial_ips, soup_len
        );
    }

    let sink: Arc<dyn VisualizerSink> = Arc::new(ConsoleSink);
    let (frame_tx, frame_rx) = mpsc::sync_channel(1);
    supervisor.set_frame_requester(frame_tx);

    let metrics_tracker = if config.metrics.enabled {
        let metrics_config = MetricsConfig {
            enabled: true,
            interval: config.metrics.interval,
            output_path: if config.metrics.output_file.is_empty() {
                None
            } else {
                Some(config.metrics.output_file.clone())
            },
            brotli_quality: config.metrics.brotli_quality,
        };
        match MetricsTracker::new(metrics_config) {
            Ok(tracker) => Some(tracker),
            Err(e) => {
                eprintln!("Warning: could not open metrics output: {}", e);
                None
            }
        }
    } else {
        None
    };

    supervisor.start();

    let sampler_config = SamplerConfig {
        target_fps: config.sampling.target_fps,
        vis_size: config.sampling.vis_size,
    };
    let emitters = vec![
        sampler::spawn_frame_emitter(
            Arc::clone(&supervisor),
            Arc::clone(&sink),
            frame_rx,
            sampler_config,
        ),
        sampler::spawn_stats_emitter(
            Arc::clone(&supervisor),
            Arc::clone(&sink),
            metrics_tracker,
            sampler_config,
        ),
        spawn_periodic_snapshots(Arc::clone(&supervisor), config.snapshot.clone()),
    ];

    // The stdin control source and its dispatcher live for the whole
    // process; they are not joined because stdin reads cannot be
    // interrupted.
    let (cmd_tx, cmd_rx) = mpsc::channel();
    control::spawn_stdin_source(cmd_tx);
    control::spawn_dispatcher(Arc::clone(&supervisor), cmd_rx);

    if config.run.duration_minutes >= 0 {
        thread::sleep(Duration::from_secs(config.run.duration_minutes as u64 * 60));
        println!("Run duration elapsed, shutting down.");
        supervisor.terminate();
        for handle in emitters {
            let _ = handle.join();
        }

        let snapshot = supervisor.snapshot();
        if let Err(e) = snapshot.save(Path::new(&config.snapshot.path)) {
            eprintln!("Error saving final snapshot: {}", e);
            process::exit(1);
        }
        println!("Final snapshot saved to {}", config.snapshot.path);
    } else {
        for handle in emitters {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        let warnings = config.validate().unwrap();
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.soup.dim_x = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cosmic_rays.rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sampling.target_fps = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_odd_values() {
        let mut config = Config::default();
        config.sampling.vis_size = 100_000; // not a perfect square
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);

        let mut config = Config::default();
        config.population.initial_ips = 0;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let mut config = Config::default();
        config.soup.dim_x = 256;
        config.population.seed = 42;
        config.run.duration_minutes = 5;

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.soup.dim_x, 256);
        assert_eq!(parsed.population.seed, 42);
        assert_eq!(parsed.run.duration_minutes, 5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("soup:\n  dim_x: 64\n").unwrap();
        assert_eq!(parsed.soup.dim_x, 64);
        assert_eq!(parsed.soup.dim_y, 1024);
        assert_eq!(parsed.population.initial_ips, 4096);
        assert!(parsed.addressing.use_relative);
    }
}
