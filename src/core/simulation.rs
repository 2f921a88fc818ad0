use std::io::{Read, Write};

use crate::checkpoint;
use crate::config::{NeuronLayout, SimulationConfig};
use crate::error::{ConfigError, Result, SimError};
use crate::growth::{GrowthReport, GrowthState};
use crate::model::{LifModel, NeuronModel};
use crate::network::{Network, NeuronKind};
use crate::prng::Prng;
use crate::report;
use crate::storage;

/// Mutable run-wide state shared by every component: the global step
/// counter and the random number generator. Both are checkpointed.
#[derive(Debug, Clone)]
pub struct SimContext {
    /// Index of the next fine step. Never reset between epochs.
    pub step: u64,
    pub rng: Prng,
}

impl SimContext {
    pub fn new(rng: Prng) -> Self {
        Self { step: 0, rng }
    }
}

/// Epoch scheduler: fine steps for one epoch, then a growth update, for the
/// configured number of epochs.
pub struct Simulation<M: NeuronModel = LifModel> {
    cfg: SimulationConfig,
    model: M,
    ctx: SimContext,
    network: Network,
    growth: GrowthState,
    epochs_completed: u32,
}

impl Simulation<LifModel> {
    pub fn new(cfg: SimulationConfig) -> Result<Self> {
        Self::with_model(cfg, LifModel)
    }
}

impl<M: NeuronModel> Simulation<M> {
    pub fn with_model(cfg: SimulationConfig, model: M) -> Result<Self> {
        cfg.validate()?;

        let mut rng = Prng::new(cfg.seed);
        let kinds = assign_kinds(&cfg, &mut rng);
        let neurons = kinds
            .iter()
            .map(|&kind| {
                let mut n = model.init_neuron(kind, &cfg.neurons, &mut rng);
                model.prepare(&mut n, cfg.delta_t);
                n
            })
            .collect();

        let mut network = Network::new(neurons, cfg.delta_t);
        let growth = GrowthState::new(&cfg);
        growth.rebuild(&mut network, &model, &cfg)?;

        tracing::info!(
            model = model.name(),
            width = cfg.width,
            height = cfg.height,
            epochs = cfg.growth_epochs,
            steps_per_epoch = cfg.steps_per_epoch(),
            synapses = network.synapse_count(),
            "simulation initialised"
        );

        Ok(Self {
            cfg,
            model,
            ctx: SimContext::new(rng),
            network,
            growth,
            epochs_completed: 0,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.cfg
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn growth(&self) -> &GrowthState {
        &self.growth
    }

    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    /// Global step counter.
    pub fn current_step(&self) -> u64 {
        self.ctx.step
    }

    pub fn epochs_completed(&self) -> u32 {
        self.epochs_completed
    }

    pub fn remaining_epochs(&self) -> u32 {
        self.cfg.growth_epochs.saturating_sub(self.epochs_completed)
    }

    pub fn is_finished(&self) -> bool {
        self.remaining_epochs() == 0
    }

    /// Simulated seconds elapsed.
    pub fn simulation_end_time(&self) -> f64 {
        self.ctx.step as f64 * self.cfg.delta_t
    }

    /// One fine step. Returns the number of neurons that fired.
    pub fn step(&mut self) -> Result<usize> {
        let fired = self.network.step(&self.model, &mut self.ctx)?;
        self.growth.record_step(self.ctx.step, fired);
        self.ctx.step += 1;
        Ok(fired)
    }

    /// Run the fine steps of the next epoch and the growth update after it.
    pub fn run_epoch(&mut self) -> Result<GrowthReport> {
        if self.is_finished() {
            return Err(SimError::Config(ConfigError::invalid(
                "growth_epochs",
                format!("all {} epochs have already run", self.cfg.growth_epochs),
            )));
        }
        let epoch = self.epochs_completed + 1;
        for _ in 0..self.cfg.steps_per_epoch() {
            self.step()?;
        }

        let report =
            self.growth
                .update_connections(epoch, &mut self.network, &self.model, &self.cfg)?;
        self.epochs_completed = epoch;

        tracing::info!(
            epoch,
            of = self.cfg.growth_epochs,
            spikes = report.total_spikes,
            synapses = self.network.synapse_count(),
            mean_radius = report.mean_radius,
            "epoch complete"
        );
        if report.runaway > 0 {
            tracing::warn!(epoch, neurons = report.runaway, "neurons above max_firing_rate");
        }
        Ok(report)
    }

    /// Run up to `count` further epochs, stopping at the configured total.
    pub fn run_epochs(&mut self, count: u32) -> Result<Vec<GrowthReport>> {
        let count = count.min(self.remaining_epochs());
        (0..count).map(|_| self.run_epoch()).collect()
    }

    /// Run every remaining epoch.
    pub fn run(&mut self) -> Result<Vec<GrowthReport>> {
        self.run_epochs(self.remaining_epochs())
    }

    /// Write the tagged-matrix state report.
    pub fn save_state<W: Write>(&self, w: &mut W) -> Result<()> {
        report::write_state(w, self)?;
        Ok(())
    }

    /// Write a memory image. Only valid at an epoch boundary.
    pub fn save_memory<W: Write>(&self, w: &mut W) -> Result<()> {
        self.check_at_boundary()?;
        checkpoint::write_memory(
            w,
            &self.cfg,
            &self.ctx,
            self.epochs_completed,
            &self.network,
            &self.growth,
        )?;
        tracing::info!(
            step = self.ctx.step,
            epochs_completed = self.epochs_completed,
            synapses = self.network.synapse_count(),
            "memory image saved"
        );
        Ok(())
    }

    pub fn memory_image_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.save_memory(&mut out)?;
        Ok(out)
    }

    /// Exact size of the memory image in bytes.
    pub fn memory_image_size(&self) -> Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_memory(&mut cw)?;
        Ok(cw.written())
    }

    /// Replace the dynamic state with a memory image. On error the
    /// simulation is left untouched.
    pub fn load_memory<R: Read>(&mut self, r: &mut R) -> Result<()> {
        let image = checkpoint::read_memory(r, &self.cfg, &self.model)?;
        self.ctx = SimContext {
            step: image.step,
            rng: Prng::from_state(image.rng),
        };
        self.epochs_completed = image.epochs_completed;
        self.network = image.network;
        self.growth = image.growth;
        tracing::info!(
            step = self.ctx.step,
            epochs_completed = self.epochs_completed,
            synapses = self.network.synapse_count(),
            "memory image loaded"
        );
        Ok(())
    }

    pub fn load_memory_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.load_memory(&mut &bytes[..])
    }

    fn check_at_boundary(&self) -> Result<()> {
        let expected = self.epochs_completed as u64 * self.cfg.steps_per_epoch();
        if self.ctx.step != expected || !self.network.summation().is_clear() {
            return Err(SimError::Invariant(format!(
                "memory images are taken at epoch boundaries (step {}, expected {expected})",
                self.ctx.step
            )));
        }
        Ok(())
    }
}

/// Assign neuron kinds from the configured layout.
fn assign_kinds(cfg: &SimulationConfig, rng: &mut Prng) -> Vec<NeuronKind> {
    let n = cfg.total_neurons();
    let mut kinds = vec![NeuronKind::Excitatory; n];
    match &cfg.layout {
        NeuronLayout::Random {
            frac_excitatory,
            frac_starter,
        } => {
            let num_inhibitory = (((1.0 - frac_excitatory) * n as f64).round() as usize).min(n);
            let num_starter = (frac_starter * n as f64).round() as usize;

            let mut order: Vec<usize> = (0..n).collect();
            rng.shuffle(&mut order);
            for &i in &order[..num_inhibitory] {
                kinds[i] = NeuronKind::Inhibitory;
            }

            let mut excitatory: Vec<usize> = (0..n)
                .filter(|&i| kinds[i] == NeuronKind::Excitatory)
                .collect();
            rng.shuffle(&mut excitatory);
            for &i in excitatory.iter().take(num_starter) {
                kinds[i] = NeuronKind::Starter;
            }
        }
        NeuronLayout::Fixed {
            inhibitory,
            starter,
        } => {
            for &i in inhibitory {
                kinds[i] = NeuronKind::Inhibitory;
            }
            for &i in starter {
                kinds[i] = NeuronKind::Starter;
            }
        }
    }
    kinds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValueRange;

    fn small_config() -> SimulationConfig {
        let mut cfg = SimulationConfig::default()
            .with_grid(4, 4)
            .with_epochs(0.05, 5)
            .with_seed(2024);
        cfg.layout = NeuronLayout::Random {
            frac_excitatory: 0.8,
            frac_starter: 0.25,
        };
        // Starters sit below their resting drive and fire regularly.
        cfg.neurons.starter_v_thresh = ValueRange::new(13.2e-3, 13.3e-3);
        // Large enough to grow synapses within a few epochs.
        cfg.growth.start_radius = 0.45;
        cfg.growth.rate_constant = 0.3;
        cfg
    }

    fn report_of<M: NeuronModel>(sim: &Simulation<M>) -> Vec<u8> {
        let mut out = Vec::new();
        sim.save_state(&mut out).unwrap();
        out
    }

    #[test]
    fn random_layout_counts() {
        let cfg = SimulationConfig::default().with_grid(10, 10);
        let sim = Simulation::new(cfg).unwrap();
        let count = |k| {
            sim.network()
                .neurons()
                .iter()
                .filter(|n| n.kind == k)
                .count()
        };
        assert_eq!(count(NeuronKind::Inhibitory), 2);
        assert_eq!(count(NeuronKind::Starter), 10);
        assert_eq!(count(NeuronKind::Excitatory), 88);
    }

    #[test]
    fn invalid_config_is_rejected_before_running() {
        let cfg = SimulationConfig::default().with_epochs(0.0, 3);
        assert!(matches!(
            Simulation::new(cfg),
            Err(SimError::Config(ConfigError::Invalid {
                field: "epoch_duration",
                ..
            }))
        ));
    }

    #[test]
    fn runs_are_deterministic() {
        let mut a = Simulation::new(small_config()).unwrap();
        let mut b = Simulation::new(small_config()).unwrap();
        let ra = a.run().unwrap();
        let rb = b.run().unwrap();
        assert_eq!(ra, rb);
        assert_eq!(a.network().synapses(), b.network().synapses());
        assert_eq!(a.growth().radii(), b.growth().radii());
        assert_eq!(report_of(&a), report_of(&b));
        assert_eq!(a.current_step(), 5 * 500);
        assert!(a.is_finished());
        assert!(a.run_epoch().is_err());
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = Simulation::new(small_config()).unwrap();
        let mut b = Simulation::new(small_config().with_seed(7)).unwrap();
        a.run_epochs(2).unwrap();
        b.run_epochs(2).unwrap();
        assert_ne!(report_of(&a), report_of(&b));
    }

    #[test]
    fn isolated_neuron_follows_closed_form() {
        // 2x2 grid, all excitatory, no noise, no synapses; neuron 0 is
        // driven above threshold and the others get no current.
        let mut cfg = SimulationConfig::default()
            .with_grid(2, 2)
            .with_epochs(0.1, 1)
            .with_noise(ValueRange::fixed(0.0))
            .with_layout(NeuronLayout::Fixed {
                inhibitory: vec![],
                starter: vec![],
            });
        cfg.neurons.i_inject = ValueRange::fixed(0.0);
        let mut sim = Simulation::new(cfg).unwrap();
        assert_eq!(sim.network().synapse_count(), 0);

        let i_drive = 20.0e-9;
        {
            let n0 = &mut sim.network.neurons_mut()[0];
            n0.i_inject = i_drive;
            sim.model.prepare(n0, sim.cfg.delta_t);
        }
        let n0 = sim.network().neurons()[0].clone();
        let c1 = n0.c1;
        let v_inf = n0.rm * i_drive;
        assert!(v_inf > n0.v_thresh);

        // Steps from `from` until the membrane first reaches threshold.
        let steps_to_threshold =
            |from: f64| (((n0.v_thresh - v_inf) / (from - v_inf)).ln() / c1.ln()).ceil() as u64;
        let refractory = n0.refractory_total as u64;

        let mut expected_spikes = vec![steps_to_threshold(n0.v_init)];
        while expected_spikes.len() < 20 {
            let last = expected_spikes[expected_spikes.len() - 1];
            expected_spikes.push(last + refractory + steps_to_threshold(n0.v_reset));
        }
        let expected_spikes: Vec<u64> = expected_spikes.into_iter().filter(|&s| s <= 1000).collect();

        let mut spikes = Vec::new();
        let mut v_start = n0.v_init;
        let mut since = 0u64;
        let mut refractory_left = 0u64;
        for k in 1..=1000u64 {
            sim.step().unwrap();
            let n = &sim.network().neurons()[0];
            if n.fired {
                spikes.push(k);
                assert_eq!(n.v_m, n.v_reset);
                v_start = n.v_reset;
                since = 0;
                refractory_left = refractory;
                continue;
            }
            if refractory_left > 0 {
                refractory_left -= 1;
                assert_eq!(n.v_m, n.v_reset);
                continue;
            }
            since += 1;
            let analytic = v_inf + (v_start - v_inf) * c1.powi(since as i32);
            assert!(
                (n.v_m - analytic).abs() < 1e-12,
                "step {k}: {} vs {analytic}",
                n.v_m
            );
            for quiet in &sim.network().neurons()[1..] {
                assert!(!quiet.fired);
            }
        }
        assert_eq!(spikes, expected_spikes);
        assert_eq!(spikes[0], 101);
    }

    #[test]
    fn synapse_appears_once_fields_overlap() {
        // Two silent neurons one unit apart with radius 0.3 each. Zero rate
        // grows the radius by 25% per epoch, so 0.3 -> 0.375 -> 0.469 -> 0.586
        // and the fields first overlap after epoch 3.
        let mut cfg = SimulationConfig::default()
            .with_grid(2, 1)
            .with_epochs(0.01, 4)
            .with_noise(ValueRange::fixed(0.0))
            .with_layout(NeuronLayout::Fixed {
                inhibitory: vec![],
                starter: vec![],
            });
        cfg.neurons.i_inject = ValueRange::fixed(0.0);
        cfg.growth.start_radius = 0.3;
        cfg.growth.rate_constant = 0.25;
        cfg.growth.beta = 0.01;

        let mut sim = Simulation::new(cfg).unwrap();
        assert_eq!(sim.network().synapse_count(), 0);
        for epoch in 1..=2 {
            sim.run_epoch().unwrap();
            assert_eq!(sim.network().synapse_count(), 0, "epoch {epoch}");
            assert!(sim.growth().radii()[0] + sim.growth().radii()[1] <= 1.0);
        }

        let report = sim.run_epoch().unwrap();
        let radii = sim.growth().radii();
        assert!(radii[0] + radii[1] > 1.0);
        assert_eq!(report.created, 2);
        let area = overlap(radii[0], radii[1]);
        let s = sim.network().find_synapse(0, 1).unwrap();
        assert_eq!(s.weight, area * 1e-8);
        assert!(s.weight > 0.0);
        assert_eq!(sim.growth().history_rows(), 4);

        fn overlap(a: f64, b: f64) -> f64 {
            crate::growth::overlap_area(a, b, 1.0)
        }
    }

    #[test]
    fn resumed_run_matches_uninterrupted_run() {
        let mut straight = Simulation::new(small_config()).unwrap();
        straight.run().unwrap();

        let mut first = Simulation::new(small_config()).unwrap();
        first.run_epochs(2).unwrap();
        let image = first.memory_image_bytes().unwrap();
        assert_eq!(image.len(), first.memory_image_size().unwrap());

        let mut resumed = Simulation::new(small_config()).unwrap();
        resumed.load_memory_bytes(&image).unwrap();
        assert_eq!(resumed.epochs_completed(), 2);
        assert_eq!(resumed.current_step(), first.current_step());
        let reports = resumed.run().unwrap();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].epoch, 3);

        assert_eq!(resumed.current_step(), straight.current_step());
        assert_eq!(resumed.network().synapses(), straight.network().synapses());
        assert_eq!(resumed.network().neurons(), straight.network().neurons());
        assert_eq!(report_of(&resumed), report_of(&straight));
        assert_eq!(
            resumed.memory_image_bytes().unwrap(),
            straight.memory_image_bytes().unwrap()
        );
    }

    #[test]
    fn mismatched_image_is_rejected_untouched() {
        let mut source = Simulation::new(small_config()).unwrap();
        source.run_epochs(1).unwrap();
        let image = source.memory_image_bytes().unwrap();

        let mut other = Simulation::new(small_config().with_grid(5, 4)).unwrap();
        let before = report_of(&other);
        assert!(matches!(
            other.load_memory_bytes(&image),
            Err(SimError::CheckpointMismatch(_))
        ));
        assert_eq!(report_of(&other), before);
        assert_eq!(other.current_step(), 0);

        let mut longer_epochs = Simulation::new(small_config().with_epochs(0.06, 5)).unwrap();
        assert!(matches!(
            longer_epochs.load_memory_bytes(&image),
            Err(SimError::CheckpointMismatch(_))
        ));

        source.run_epochs(1).unwrap();
        let image = source.memory_image_bytes().unwrap();
        let mut one_epoch = Simulation::new(small_config().with_epochs(0.05, 1)).unwrap();
        assert!(matches!(
            one_epoch.load_memory_bytes(&image),
            Err(SimError::CheckpointMismatch(_))
        ));
        assert_eq!(one_epoch.current_step(), 0);
    }

    #[test]
    fn finished_run_continues_under_more_epochs() {
        let mut straight = Simulation::new(small_config()).unwrap();
        straight.run().unwrap();

        let mut short = Simulation::new(small_config().with_epochs(0.05, 2)).unwrap();
        short.run().unwrap();
        assert!(short.is_finished());
        let image = short.memory_image_bytes().unwrap();

        let mut resumed = Simulation::new(small_config()).unwrap();
        resumed.load_memory_bytes(&image).unwrap();
        assert_eq!(resumed.epochs_completed(), 2);
        assert_eq!(resumed.remaining_epochs(), 3);
        let reports = resumed.run().unwrap();
        assert_eq!(reports.len(), 3);

        assert_eq!(report_of(&resumed), report_of(&straight));
        assert_eq!(
            resumed.memory_image_bytes().unwrap(),
            straight.memory_image_bytes().unwrap()
        );
    }

    #[test]
    fn truncated_or_garbled_image_is_rejected_untouched() {
        let mut source = Simulation::new(small_config()).unwrap();
        source.run_epochs(1).unwrap();
        let image = source.memory_image_bytes().unwrap();

        let mut target = Simulation::new(small_config()).unwrap();
        let before = report_of(&target);

        for cut in [4, 12, image.len() / 2, image.len() - 1] {
            let err = target.load_memory_bytes(&image[..cut]).unwrap_err();
            assert!(matches!(err, SimError::CheckpointCorrupt(_)), "cut {cut}: {err}");
        }

        let mut bad_magic = image.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            target.load_memory_bytes(&bad_magic),
            Err(SimError::CheckpointCorrupt(_))
        ));

        assert_eq!(report_of(&target), before);
        assert_eq!(target.epochs_completed(), 0);
    }

    #[test]
    fn memory_is_only_saved_at_epoch_boundaries() {
        let mut sim = Simulation::new(small_config()).unwrap();
        sim.step().unwrap();
        assert!(matches!(
            sim.memory_image_bytes(),
            Err(SimError::Invariant(_))
        ));
    }

    #[test]
    fn step_histograms_account_for_every_spike() {
        let mut sim = Simulation::new(small_config()).unwrap();
        let reports = sim.run().unwrap();
        let total: u64 = reports.iter().map(|r| r.total_spikes).sum();
        let binned: u64 = sim.growth().spikes_history().iter().map(|&c| c as u64).sum();
        let burst: u64 = sim.growth().burstiness_hist().iter().map(|&c| c as u64).sum();
        assert!(total > 0);
        assert_eq!(binned, total);
        assert_eq!(burst, total);
    }
}
