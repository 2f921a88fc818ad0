//! Neuron and synapse dynamics behind a strategy trait.
//!
//! The network owns the data; a [`NeuronModel`] owns the arithmetic. The
//! simulation is generic over the model and defaults to [`LifModel`].

use crate::config::{NeuronParams, SimulationConfig};
use crate::delay::DelayQueue;
use crate::network::{Neuron, NeuronKind, Plasticity, Synapse, SynapseKind};
use crate::prng::Prng;

pub trait NeuronModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Draw a fresh neuron of `kind` from the configured parameter ranges.
    fn init_neuron(&self, kind: NeuronKind, params: &NeuronParams, rng: &mut Prng) -> Neuron;

    /// Recompute the per-neuron coefficients that depend on `dt`.
    fn prepare(&self, neuron: &mut Neuron, dt: f64);

    /// Whether `draw_noise` is called for this neuron this step.
    fn wants_noise(&self, neuron: &Neuron) -> bool;

    fn draw_noise(&self, neuron: &Neuron, rng: &mut Prng) -> f64;

    /// Integrate one step with summed synaptic `input`. Returns true on a spike.
    fn advance_neuron(&self, neuron: &mut Neuron, input: f64, noise: f64) -> bool;

    fn synapse_kind(&self, source: NeuronKind, dest: NeuronKind) -> SynapseKind {
        SynapseKind::between(source, dest)
    }

    /// +1 or -1, fixed by the presynaptic neuron.
    fn synapse_sign(&self, source: NeuronKind) -> f64;

    fn create_synapse(
        &self,
        source: usize,
        dest: usize,
        kind: SynapseKind,
        weight: f64,
        cfg: &SimulationConfig,
    ) -> Synapse;

    /// Tick the delay queue and return this step's contribution to the
    /// destination bin.
    fn advance_synapse(&self, synapse: &mut Synapse, step: u64, dt: f64) -> f64;
}

/// Leaky integrate-and-fire neurons with exponential-Euler integration and
/// depressing/facilitating synapses.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifModel;

impl NeuronModel for LifModel {
    fn name(&self) -> &'static str {
        "lif"
    }

    fn init_neuron(&self, kind: NeuronKind, params: &NeuronParams, rng: &mut Prng) -> Neuron {
        let mut draw = |r: &crate::config::ValueRange| rng.gen_range_f64(r.min, r.max);
        let i_inject = draw(&params.i_inject);
        let i_noise = draw(&params.i_noise);
        let mut v_thresh = draw(&params.v_thresh);
        let v_resting = draw(&params.v_resting);
        let mut v_reset = draw(&params.v_reset);
        let v_init = draw(&params.v_init);
        if kind == NeuronKind::Starter {
            v_thresh = draw(&params.starter_v_thresh);
            v_reset = draw(&params.starter_v_reset);
        }

        Neuron {
            kind,
            v_m: v_init,
            v_thresh,
            v_resting,
            v_reset,
            v_init,
            i_inject,
            i_noise,
            rm: params.rm,
            cm: params.cm,
            t_refract: params.t_refract,
            refractory_steps: 0,
            spike_count: 0,
            fired: false,
            c1: 0.0,
            c2: 0.0,
            i0: 0.0,
            refractory_total: 0,
        }
    }

    fn prepare(&self, n: &mut Neuron, dt: f64) {
        let tau = n.rm * n.cm;
        n.c1 = (-dt / tau).exp();
        n.c2 = n.rm * (1.0 - n.c1);
        n.i0 = n.i_inject + n.v_resting / n.rm;
        n.refractory_total = (n.t_refract / dt).round() as u32;
    }

    #[inline]
    fn wants_noise(&self, n: &Neuron) -> bool {
        n.refractory_steps == 0
    }

    #[inline]
    fn draw_noise(&self, n: &Neuron, rng: &mut Prng) -> f64 {
        rng.next_gaussian() * n.i_noise
    }

    #[inline]
    fn advance_neuron(&self, n: &mut Neuron, input: f64, noise: f64) -> bool {
        if n.refractory_steps > 0 {
            n.refractory_steps -= 1;
            n.v_m = n.v_reset;
            return false;
        }

        n.v_m = n.c1 * n.v_m + n.c2 * (input + n.i0 + noise);
        if n.v_m >= n.v_thresh {
            n.spike_count += 1;
            n.fired = true;
            n.v_m = n.v_reset;
            n.refractory_steps = n.refractory_total;
            true
        } else {
            false
        }
    }

    fn synapse_sign(&self, source: NeuronKind) -> f64 {
        if source.is_excitatory() {
            1.0
        } else {
            -1.0
        }
    }

    fn create_synapse(
        &self,
        source: usize,
        dest: usize,
        kind: SynapseKind,
        weight: f64,
        cfg: &SimulationConfig,
    ) -> Synapse {
        let p = cfg.synapses.for_kind(kind);
        Synapse {
            source,
            dest,
            kind,
            weight,
            tau: p.tau,
            decay: (-cfg.delta_t / p.tau).exp(),
            psr: 0.0,
            delay_ticks: cfg.delay_ticks(kind),
            queue: DelayQueue::new(),
            stp: Plasticity::new(p.u, p.d, p.f),
        }
    }

    #[inline]
    fn advance_synapse(&self, s: &mut Synapse, step: u64, dt: f64) -> f64 {
        if s.queue.tick() {
            let stp = &mut s.stp;
            if let Some(last) = stp.last_spike {
                let isi = step.saturating_sub(last) as f64 * dt;
                stp.r = 1.0 + (stp.r * (1.0 - stp.u) - 1.0) * (-isi / stp.depression).exp();
                stp.u = stp.use_param + stp.u * (1.0 - stp.use_param) * (-isi / stp.facilitation).exp();
            }
            s.psr += (s.weight / s.decay) * stp.u * stp.r;
            stp.last_spike = Some(step);
        }
        s.psr *= s.decay;
        s.psr
    }
}
