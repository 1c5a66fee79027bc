//! Population supervisor: owns the soup and the set of live IPs, runs them
//! concurrently, and exposes the control surface.
//!
//! Each live IP belongs to exactly one worker thread; workers are capped at
//! hardware concurrency and multiplex their IPs round-robin, which is
//! equivalent to a thread per IP because no IP carries shared state between
//! steps. Workers check the stop signal between every step, so after
//! `pause` returns no worker writes the soup again until `resume`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::prelude::*;
use rand::rngs::SmallRng;
use rayon::prelude::*;

use crate::control::Command;
use crate::snapshot::Snapshot;
use crate::soup::Soup;
use crate::vm::Ip;

/// Construction parameters for a supervisor.
#[derive(Clone, Debug)]
pub struct SupervisorParams {
    pub dim_x: i32,
    pub dim_y: i32,
    pub initial_ips: u32,
    pub seed: u64,
    pub wide_addressing: bool,
    pub relative_addressing: bool,
    pub cosmic_ray_rate: f64,
}

impl Default for SupervisorParams {
    fn default() -> Self {
        Self {
            dim_x: 1024,
            dim_y: 1024,
            initial_ips: 4096,
            seed: 0,
            wide_addressing: false,
            relative_addressing: true,
            cosmic_ray_rate: 0.001,
        }
    }
}

pub struct Supervisor {
    soup: Arc<Soup>,
    population: RwLock<Vec<Arc<Ip>>>,
    next_ip_id: AtomicU32,
    ip_count: AtomicU32,

    paused: AtomicBool,
    /// Stop signal shared with the current worker set; replaced on resume.
    stop: Mutex<Arc<AtomicBool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Process-lifetime service threads (cosmic rays).
    service_threads: Mutex<Vec<JoinHandle<()>>>,
    terminating: AtomicBool,

    /// Bit pattern of an f64 probability in [0, 1].
    cosmic_ray_rate: AtomicU64,
    view_start_index: AtomicUsize,
    wide_addressing: AtomicBool,
    relative_addressing: AtomicBool,

    generation: AtomicU64,
    rand_seed: AtomicU64,
    frame_request: Mutex<Option<SyncSender<()>>>,
    start_time: Instant,
}

impl Supervisor {
    /// Allocate the soup, seed it with uniform random signed bytes, and
    /// place `initial_ips` IPs at random coordinates.
    pub fn new(params: SupervisorParams) -> Self {
        let soup = Arc::new(Soup::new(params.dim_x, params.dim_y));
        let mut rng = StdRng::seed_from_u64(params.seed);
        soup.randomize(&mut rng);

        let next_ip_id = AtomicU32::new(0);
        let mut population = Vec::with_capacity(params.initial_ips as usize);
        for _ in 0..params.initial_ips {
            let x = rng.gen_range(0..params.dim_x);
            let y = rng.gen_range(0..params.dim_y);
            let id = next_ip_id.fetch_add(1, Ordering::Relaxed) + 1;
            population.push(Arc::new(Ip::new(
                id,
                x,
                y,
                params.wide_addressing,
                params.relative_addressing,
            )));
        }

        Self {
            soup,
            ip_count: AtomicU32::new(population.len() as u32),
            population: RwLock::new(population),
            next_ip_id,
            paused: AtomicBool::new(false),
            stop: Mutex::new(Arc::new(AtomicBool::new(false))),
            workers: Mutex::new(Vec::new()),
            service_threads: Mutex::new(Vec::new()),
            terminating: AtomicBool::new(false),
            cosmic_ray_rate: AtomicU64::new(params.cosmic_ray_rate.to_bits()),
            view_start_index: AtomicUsize::new(0),
            wide_addressing: AtomicBool::new(params.wide_addressing),
            relative_addressing: AtomicBool::new(params.relative_addressing),
            generation: AtomicU64::new(0),
            rand_seed: AtomicU64::new(params.seed),
            frame_request: Mutex::new(None),
            start_time: Instant::now(),
        }
    }

    /// Launch one worker set for the population plus the cosmic-ray mutator.
    pub fn start(self: &Arc<Self>) {
        self.launch_workers();

        let sup = Arc::clone(self);
        let handle = thread::spawn(move || sup.run_cosmic_rays());
        self.service_threads.lock().unwrap().push(handle);
    }

    /// Spawn workers for every live IP under a fresh stop signal.
    fn launch_workers(&self) {
        let ips: Vec<Arc<Ip>> = self.population.read().unwrap().clone();
        if ips.is_empty() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        *self.stop.lock().unwrap() = Arc::clone(&stop);

        let n_workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(ips.len());
        let seed_base = self.rand_seed.load(Ordering::Relaxed);

        let mut workers = self.workers.lock().unwrap();
        for w in 0..n_workers {
            let lane: Vec<Arc<Ip>> = ips.iter().skip(w).step_by(n_workers).cloned().collect();
            let soup = Arc::clone(&self.soup);
            let stop = Arc::clone(&stop);
            workers.push(thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(
                    seed_base ^ (w as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15),
                );
                'running: loop {
                    for ip in &lane {
                        if stop.load(Ordering::Relaxed) {
                            break 'running;
                        }
                        ip.step(&soup, &mut rng);
                    }
                    thread::yield_now();
                }
            }));
        }
    }

    /// Signal all workers to stop and wait for them to join. While paused
    /// no IP mutates the soup; one frame is emitted so the frozen state can
    /// be inspected.
    pub fn pause(&self) {
        if self
            .paused
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            println!("Pausing simulation");
            self.stop.lock().unwrap().store(true, Ordering::Relaxed);
            let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
            for handle in handles {
                let _ = handle.join();
            }
            self.request_frame();
        } else {
            println!("Simulation is already paused.");
        }
    }

    /// Relaunch one worker per IP under a fresh stop signal.
    pub fn resume(&self) {
        if self
            .paused
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            println!("Resuming simulation");
            self.launch_workers();
        } else {
            println!("Simulation is already running.");
        }
    }

    /// Execute exactly one step on every IP. Only valid while paused; one
    /// frame is emitted afterwards and the simulation stays paused.
    pub fn step_once(&self) {
        if !self.is_paused() {
            println!("Step command received, but simulation is not paused.");
            return;
        }
        let ips = self.population.read().unwrap().clone();
        let seed_base = self.rand_seed.load(Ordering::Relaxed);
        ips.par_iter().for_each(|ip| {
            let mut rng =
                SmallRng::seed_from_u64(seed_base ^ (ip.id() as u64) ^ ip.steps().wrapping_mul(31));
            ip.step(&self.soup, &mut rng);
        });
        self.request_frame();
    }

    /// The cosmic-ray mutator: while not paused, each iteration samples a
    /// uniform r in [0, 1) and, if below the rate, flips one random bit at
    /// one random soup index. A short sleep bounds CPU use.
    fn run_cosmic_rays(&self) {
        let mut rng = SmallRng::from_entropy();
        while !self.terminating.load(Ordering::Relaxed) {
            if self.is_paused() {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            let rate = self.cosmic_ray_rate();
            if rate > 0.0 && rng.gen::<f64>() < rate {
                let index = rng.gen_range(0..self.soup.len());
                let bit = rng.gen_range(0..8);
                self.soup.flip_bit(index, bit);
            }
            thread::sleep(Duration::from_micros(50));
        }
    }

    pub fn handle_command(&self, cmd: Command) {
        match cmd {
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Step => self.step_once(),
            Command::SetViewStartIndex(index) => self.set_view_start_index(index),
            Command::Set32BitAddressing(enabled) => self.set_wide_addressing(enabled),
            Command::SetRelativeAddressing(enabled) => self.set_relative_addressing(enabled),
            Command::SetIpPtr { id, ptr } => self.set_ip_ptr(id, ptr),
            Command::SetCosmicRayRate(rate) => self.set_cosmic_ray_rate(rate),
        }
    }

    pub fn set_view_start_index(&self, index: i64) {
        let index = index.max(0) as usize;
        self.view_start_index.store(index, Ordering::Relaxed);
        self.request_frame();
    }

    pub fn view_start_index(&self) -> usize {
        self.view_start_index.load(Ordering::Relaxed)
    }

    /// Set the operand-width flag on all live IPs (and for IPs created by
    /// later snapshot loads). Running IPs pick the flag up at their next
    /// fetch.
    pub fn set_wide_addressing(&self, enabled: bool) {
        self.wide_addressing.store(enabled, Ordering::Relaxed);
        for ip in self.population.read().unwrap().iter() {
            ip.set_wide_addressing(enabled);
        }
    }

    pub fn set_relative_addressing(&self, enabled: bool) {
        self.relative_addressing.store(enabled, Ordering::Relaxed);
        for ip in self.population.read().unwrap().iter() {
            ip.set_relative_addressing(enabled);
        }
    }

    /// Set a named IP's cursor from a 1D offset.
    pub fn set_ip_ptr(&self, id: u32, ptr: i32) {
        let population = self.population.read().unwrap();
        match population.iter().find(|ip| ip.id() == id) {
            Some(ip) => {
                let x = ptr.rem_euclid(self.soup.dim_x());
                let y = ptr.div_euclid(self.soup.dim_x()).rem_euclid(self.soup.dim_y());
                ip.set_position(x, y);
                println!("Set IP {} position to ({}, {})", id, x, y);
            }
            None => println!("IP with ID {} not found to set pointer.", id),
        }
    }

    pub fn set_cosmic_ray_rate(&self, rate: f64) {
        self.cosmic_ray_rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn cosmic_ray_rate(&self) -> f64 {
        f64::from_bits(self.cosmic_ray_rate.load(Ordering::Relaxed))
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }

    pub fn soup(&self) -> &Soup {
        &self.soup
    }

    /// A point-in-time copy of the live population list.
    pub fn population(&self) -> Vec<Arc<Ip>> {
        self.population.read().unwrap().clone()
    }

    pub fn ip_count(&self) -> u32 {
        self.ip_count.load(Ordering::Relaxed)
    }

    /// Aggregate step count across the population.
    pub fn total_steps(&self) -> u64 {
        self.population
            .read()
            .unwrap()
            .iter()
            .map(|ip| ip.steps())
            .sum()
    }

    pub fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Register the channel the frame emitter listens on for on-demand
    /// frames (pause, step-once, view changes).
    pub fn set_frame_requester(&self, tx: SyncSender<()>) {
        *self.frame_request.lock().unwrap() = Some(tx);
    }

    /// Ask the frame emitter for one frame. Non-blocking: if a request is
    /// already pending the new one is dropped.
    pub fn request_frame(&self) {
        if let Some(tx) = self.frame_request.lock().unwrap().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Capture the full simulation state. IPs are ordered by id so repeated
    /// captures of the same state are byte-identical.
    pub fn snapshot(&self) -> Snapshot {
        let population = self.population.read().unwrap();
        let mut ips: Vec<_> = population.iter().map(|ip| ip.savable(&self.soup)).collect();
        ips.sort_by_key(|ip| ip.id);
        Snapshot {
            generation: self.generation.load(Ordering::Relaxed),
            dim_x: self.soup.dim_x(),
            dim_y: self.soup.dim_y(),
            soup: self.soup.dump(),
            ips,
            next_ip_id: self.next_ip_id.load(Ordering::Relaxed),
            rand_seed: self.rand_seed.load(Ordering::Relaxed),
        }
    }

    /// Replace the simulation state from a snapshot: soup contents in place
    /// (the length must match), all live IPs deleted and one reconstructed
    /// per saved entry. The caller must not have workers running.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<(), String> {
        self.soup.load(&snapshot.soup)?;

        let wide = self.wide_addressing.load(Ordering::Relaxed);
        let relative = self.relative_addressing.load(Ordering::Relaxed);
        let mut population = self.population.write().unwrap();
        population.clear();
        for saved in &snapshot.ips {
            population.push(Arc::new(Ip::from_saved(saved, wide, relative)));
        }
        self.ip_count.store(population.len() as u32, Ordering::Relaxed);
        self.next_ip_id.store(snapshot.next_ip_id, Ordering::Relaxed);
        self.generation.store(snapshot.generation, Ordering::Relaxed);
        self.rand_seed.store(snapshot.rand_seed, Ordering::Relaxed);
        Ok(())
    }

    /// Stop everything: pause the population and join the service threads.
    /// Emitter threads watching `is_terminating` will exit on their own.
    pub fn terminate(&self) {
        self.terminating.store(true, Ordering::Relaxed);
        if !self.is_paused() {
            self.pause();
        }
        let handles: Vec<_> = self.service_threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SavableIp;

    fn small_params() -> SupervisorParams {
        SupervisorParams {
            dim_x: 8,
            dim_y: 8,
            initial_ips: 4,
            seed: 123,
            wide_addressing: false,
            relative_addressing: true,
            cosmic_ray_rate: 0.0,
        }
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let sup = Supervisor::new(small_params());
        let ids: Vec<u32> = sup.population().iter().map(|ip| ip.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(sup.ip_count(), 4);
    }

    #[test]
    fn test_initial_positions_in_bounds() {
        let sup = Supervisor::new(small_params());
        for ip in sup.population() {
            let (x, y) = ip.position();
            assert!((0..8).contains(&x) && (0..8).contains(&y));
        }
    }

    #[test]
    fn test_workers_run_then_pause_quiesces() {
        let sup = Arc::new(Supervisor::new(small_params()));
        sup.start();
        // Give the workers a moment to step.
        thread::sleep(Duration::from_millis(30));
        sup.pause();
        assert!(sup.is_paused());
        assert!(sup.total_steps() > 0);

        // After pause returns, nothing mutates the soup.
        let before = sup.soup().dump();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sup.soup().dump(), before);

        sup.terminate();
    }

    #[test]
    fn test_resume_restarts_workers() {
        let sup = Arc::new(Supervisor::new(small_params()));
        sup.start();
        thread::sleep(Duration::from_millis(10));
        sup.pause();
        let at_pause = sup.total_steps();

        sup.resume();
        assert!(!sup.is_paused());
        thread::sleep(Duration::from_millis(30));
        sup.pause();
        assert!(sup.total_steps() > at_pause);

        sup.terminate();
    }

    #[test]
    fn test_step_once_steps_every_ip_exactly_once() {
        let sup = Supervisor::new(small_params());
        sup.pause(); // no workers were started; this just flips the flag
        let before: Vec<u64> = sup.population().iter().map(|ip| ip.steps()).collect();
        sup.step_once();
        let after: Vec<u64> = sup.population().iter().map(|ip| ip.steps()).collect();
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(a - b, 1);
        }
        // Still paused afterwards.
        assert!(sup.is_paused());
    }

    #[test]
    fn test_step_once_ignored_while_running() {
        let sup = Supervisor::new(small_params());
        sup.step_once();
        assert_eq!(sup.total_steps(), 0);
    }

    #[test]
    fn test_set_ip_ptr_decodes_linear_offset() {
        let sup = Supervisor::new(small_params());
        sup.set_ip_ptr(2, 13);
        let population = sup.population();
        let ip = population.iter().find(|ip| ip.id() == 2).unwrap();
        assert_eq!(ip.position(), (5, 1));

        // Unknown ids are logged and ignored.
        sup.set_ip_ptr(99, 0);
    }

    #[test]
    fn test_addressing_reconfiguration_reaches_all_ips() {
        let sup = Supervisor::new(small_params());
        sup.handle_command(Command::Set32BitAddressing(true));
        sup.handle_command(Command::SetRelativeAddressing(false));
        for ip in sup.population() {
            assert!(ip.wide_addressing());
            assert!(!ip.relative_addressing());
        }
    }

    #[test]
    fn test_cosmic_ray_rate_round_trips_through_bits() {
        let sup = Supervisor::new(small_params());
        assert_eq!(sup.cosmic_ray_rate(), 0.0);
        sup.handle_command(Command::SetCosmicRayRate(0.125));
        assert_eq!(sup.cosmic_ray_rate(), 0.125);
    }

    #[test]
    fn test_view_start_index_clamps_negative() {
        let sup = Supervisor::new(small_params());
        sup.set_view_start_index(-5);
        assert_eq!(sup.view_start_index(), 0);
        sup.set_view_start_index(40);
        assert_eq!(sup.view_start_index(), 40);
    }

    #[test]
    fn test_snapshot_apply_round_trip() {
        let sup = Supervisor::new(small_params());
        sup.pause();
        for _ in 0..10 {
            sup.step_once();
        }
        let snapshot = sup.snapshot();

        let other = Supervisor::new(SupervisorParams {
            seed: 999, // different seeding; the snapshot must fully override it
            ..small_params()
        });
        other.apply_snapshot(&snapshot).unwrap();
        assert_eq!(other.snapshot(), snapshot);
        assert_eq!(other.ip_count(), 4);
    }

    #[test]
    fn test_snapshot_file_round_trip_is_byte_identical() {
        let path_a =
            std::env::temp_dir().join(format!("evosoup_sup_a_{}.evs", std::process::id()));
        let path_b =
            std::env::temp_dir().join(format!("evosoup_sup_b_{}.evs", std::process::id()));

        let sup = Supervisor::new(small_params());
        sup.pause();
        for _ in 0..1000 {
            sup.step_once();
        }
        sup.snapshot().save(&path_a).unwrap();

        let fresh = Supervisor::new(SupervisorParams { seed: 7, ..small_params() });
        fresh.pause();
        let loaded = Snapshot::load(&path_a).unwrap();
        fresh.apply_snapshot(&loaded).unwrap();
        fresh.snapshot().save(&path_b).unwrap();

        assert_eq!(
            std::fs::read(&path_a).unwrap(),
            std::fs::read(&path_b).unwrap()
        );
        let _ = std::fs::remove_file(&path_a);
        let _ = std::fs::remove_file(&path_b);
    }

    #[test]
    fn test_apply_snapshot_rejects_wrong_soup_length() {
        let sup = Supervisor::new(small_params());
        let snapshot = Snapshot {
            generation: 0,
            dim_x: 4,
            dim_y: 4,
            soup: vec![0u8; 16],
            ips: vec![SavableIp { id: 1, x: 0, y: 0, steps: 0, current_instruction_byte: 0 }],
            next_ip_id: 1,
            rand_seed: 0,
        };
        assert!(sup.apply_snapshot(&snapshot).is_err());
        // The failed load must not have touched the population.
        assert_eq!(sup.ip_count(), 4);
    }
}
