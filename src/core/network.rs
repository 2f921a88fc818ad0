//! Neurons, synapses and the summation buffer, stored as flat arrays indexed
//! by neuron id.
//!
//! Synapses are kept sorted by `(source, dest)` with a CSR offset table so a
//! neuron's outgoing synapses are one contiguous slice. A synapse refers to
//! its destination summation bin by index.
//!
//! One fine step runs three phases with a barrier between them:
//! 1. neurons that fired in the previous step enqueue on their outgoing synapses;
//! 2. every synapse ticks its delay queue and adds its response into its bin;
//! 3. every neuron drains its bin and integrates its membrane.

use std::io::{self, Read, Write};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::delay::{DelayQueue, DELAY_SLOTS};
use crate::error::{Result, SimError};
use crate::model::NeuronModel;
use crate::simulation::SimContext;
use crate::storage;

pub type NeuronId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum NeuronKind {
    Inhibitory,
    Excitatory,
    /// Excitatory neuron with a threshold low enough to fire without input.
    Starter,
}

impl NeuronKind {
    pub fn is_excitatory(self) -> bool {
        !matches!(self, NeuronKind::Inhibitory)
    }

    /// Numeric code used in reports and memory images.
    pub fn code(self) -> u32 {
        match self {
            NeuronKind::Inhibitory => 1,
            NeuronKind::Excitatory => 2,
            NeuronKind::Starter => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(NeuronKind::Inhibitory),
            2 => Some(NeuronKind::Excitatory),
            3 => Some(NeuronKind::Starter),
            _ => None,
        }
    }
}

/// Synapse kind from (source, destination) polarity: `IE` is inhibitory onto excitatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SynapseKind {
    II,
    IE,
    EI,
    EE,
}

impl SynapseKind {
    pub fn between(source: NeuronKind, dest: NeuronKind) -> Self {
        match (source.is_excitatory(), dest.is_excitatory()) {
            (false, false) => SynapseKind::II,
            (false, true) => SynapseKind::IE,
            (true, false) => SynapseKind::EI,
            (true, true) => SynapseKind::EE,
        }
    }

    pub fn code(self) -> u32 {
        match self {
            SynapseKind::II => 0,
            SynapseKind::IE => 1,
            SynapseKind::EI => 2,
            SynapseKind::EE => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SynapseKind::II),
            1 => Some(SynapseKind::IE),
            2 => Some(SynapseKind::EI),
            3 => Some(SynapseKind::EE),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    pub kind: NeuronKind,

    // Membrane state and potentials (volts).
    pub v_m: f64,
    pub v_thresh: f64,
    pub v_resting: f64,
    pub v_reset: f64,
    pub v_init: f64,

    // Currents (amperes). `i_noise` is the noise standard deviation.
    pub i_inject: f64,
    pub i_noise: f64,

    pub rm: f64,
    pub cm: f64,
    pub t_refract: f64,

    pub refractory_steps: u32,
    /// Spikes since the last growth update.
    pub spike_count: u32,
    /// Crossed threshold in the last integration; notifies synapses next step.
    pub fired: bool,

    // Derived from the fields above by `NeuronModel::prepare`.
    pub(crate) c1: f64,
    pub(crate) c2: f64,
    pub(crate) i0: f64,
    pub(crate) refractory_total: u32,
}

impl Neuron {
    const IMAGE_BYTES: usize = 4 + 10 * 8 + 3 * 4;

    pub(crate) fn write_image<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.kind.code())?;
        for v in [
            self.v_m,
            self.v_thresh,
            self.v_resting,
            self.v_reset,
            self.v_init,
            self.i_inject,
            self.i_noise,
            self.rm,
            self.cm,
            self.t_refract,
        ] {
            storage::write_f64_le(w, v)?;
        }
        storage::write_u32_le(w, self.refractory_steps)?;
        storage::write_u32_le(w, self.spike_count)?;
        storage::write_u32_le(w, self.fired as u32)
    }

    /// Reads the stored fields; derived coefficients are left zero until
    /// the model prepares the neuron.
    pub(crate) fn read_image<R: Read>(r: &mut R) -> io::Result<Self> {
        let kind = NeuronKind::from_code(storage::read_u32_le(r)?)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown neuron kind"))?;
        let mut f = [0.0f64; 10];
        for v in &mut f {
            *v = storage::read_f64_le(r)?;
        }
        let refractory_steps = storage::read_u32_le(r)?;
        let spike_count = storage::read_u32_le(r)?;
        let fired = match storage::read_u32_le(r)? {
            0 => false,
            1 => true,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad neuron fired flag",
                ))
            }
        };
        let [v_m, v_thresh, v_resting, v_reset, v_init, i_inject, i_noise, rm, cm, t_refract] = f;
        Ok(Self {
            kind,
            v_m,
            v_thresh,
            v_resting,
            v_reset,
            v_init,
            i_inject,
            i_noise,
            rm,
            cm,
            t_refract,
            refractory_steps,
            spike_count,
            fired,
            c1: 0.0,
            c2: 0.0,
            i0: 0.0,
            refractory_total: 0,
        })
    }

    pub(crate) fn image_bytes() -> usize {
        Self::IMAGE_BYTES
    }
}

/// Tsodyks-Markram short-term plasticity state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plasticity {
    /// Baseline utilisation `U`.
    pub use_param: f64,
    /// Depression time constant `D` (seconds).
    pub depression: f64,
    /// Facilitation time constant `F` (seconds).
    pub facilitation: f64,
    pub u: f64,
    pub r: f64,
    /// Step of the previous delivery.
    pub last_spike: Option<u64>,
}

impl Plasticity {
    pub fn new(use_param: f64, depression: f64, facilitation: f64) -> Self {
        Self {
            use_param,
            depression,
            facilitation,
            u: use_param,
            r: 1.0,
            last_spike: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Synapse {
    pub source: NeuronId,
    /// Index of the destination neuron's summation bin.
    pub dest: NeuronId,
    pub kind: SynapseKind,
    pub weight: f64,
    pub tau: f64,
    /// Per-step response decay, `exp(-dt / tau)`.
    pub decay: f64,
    /// Post-synaptic response.
    pub psr: f64,
    pub delay_ticks: usize,
    pub queue: DelayQueue,
    pub stp: Plasticity,
}

impl Synapse {
    pub(crate) fn write_image<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.source as u32)?;
        storage::write_u32_le(w, self.dest as u32)?;
        storage::write_u32_le(w, self.kind.code())?;
        storage::write_f64_le(w, self.weight)?;
        storage::write_f64_le(w, self.tau)?;
        storage::write_f64_le(w, self.decay)?;
        storage::write_f64_le(w, self.psr)?;
        storage::write_u32_le(w, self.delay_ticks as u32)?;
        storage::write_f64_le(w, self.stp.use_param)?;
        storage::write_f64_le(w, self.stp.depression)?;
        storage::write_f64_le(w, self.stp.facilitation)?;
        storage::write_f64_le(w, self.stp.u)?;
        storage::write_f64_le(w, self.stp.r)?;
        match self.stp.last_spike {
            Some(step) => {
                storage::write_u32_le(w, 1)?;
                storage::write_u64_le(w, step)?;
            }
            None => {
                storage::write_u32_le(w, 0)?;
                storage::write_u64_le(w, 0)?;
            }
        }
        self.queue.write_image(w)
    }

    pub(crate) fn read_image<R: Read>(r: &mut R) -> io::Result<Self> {
        let source = storage::read_u32_le(r)? as usize;
        let dest = storage::read_u32_le(r)? as usize;
        let kind = SynapseKind::from_code(storage::read_u32_le(r)?)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown synapse kind"))?;
        let weight = storage::read_f64_le(r)?;
        let tau = storage::read_f64_le(r)?;
        let decay = storage::read_f64_le(r)?;
        let psr = storage::read_f64_le(r)?;
        let delay_ticks = storage::read_u32_le(r)? as usize;
        if delay_ticks == 0 || delay_ticks >= DELAY_SLOTS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "synapse delay out of range",
            ));
        }
        let use_param = storage::read_f64_le(r)?;
        let depression = storage::read_f64_le(r)?;
        let facilitation = storage::read_f64_le(r)?;
        let u = storage::read_f64_le(r)?;
        let r_avail = storage::read_f64_le(r)?;
        let has_last = storage::read_u32_le(r)?;
        let last = storage::read_u64_le(r)?;
        let last_spike = match has_last {
            0 => None,
            1 => Some(last),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "bad synapse last-spike flag",
                ))
            }
        };
        let queue = DelayQueue::read_image(r)?;
        Ok(Self {
            source,
            dest,
            kind,
            weight,
            tau,
            decay,
            psr,
            delay_ticks,
            queue,
            stp: Plasticity {
                use_param,
                depression,
                facilitation,
                u,
                r: r_avail,
                last_spike,
            },
        })
    }
}

/// One accumulator per neuron, written by synapses in the delivery phase and
/// drained by the owning neuron in the integration phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SummationBuffer {
    bins: Vec<f64>,
}

impl SummationBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            bins: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn get(&self, i: NeuronId) -> Option<f64> {
        self.bins.get(i).copied()
    }

    #[inline]
    pub fn add(&mut self, i: NeuronId, value: f64) -> Result<()> {
        match self.bins.get_mut(i) {
            Some(bin) => {
                *bin += value;
                Ok(())
            }
            None => Err(SimError::Invariant(format!(
                "summation bin {i} does not exist ({} bins)",
                self.bins.len()
            ))),
        }
    }

    /// Read and clear bin `i`.
    #[inline]
    pub fn take(&mut self, i: NeuronId) -> f64 {
        self.bins.get_mut(i).map(core::mem::take).unwrap_or(0.0)
    }

    pub fn is_clear(&self) -> bool {
        self.bins.iter().all(|&b| b == 0.0)
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.bins
    }
}

#[derive(Debug, Clone)]
pub struct Network {
    neurons: Vec<Neuron>,
    synapses: Vec<Synapse>,
    /// Neuron `i` owns synapses `offsets[i]..offsets[i + 1]`.
    offsets: Vec<usize>,
    bins: SummationBuffer,
    delta_t: f64,

    #[cfg(feature = "parallel")]
    noise: Vec<f64>,
}

impl Network {
    pub fn new(neurons: Vec<Neuron>, delta_t: f64) -> Self {
        let n = neurons.len();
        Self {
            neurons,
            synapses: Vec::new(),
            offsets: vec![0; n + 1],
            bins: SummationBuffer::new(n),
            delta_t,
            #[cfg(feature = "parallel")]
            noise: Vec::with_capacity(n),
        }
    }

    pub fn neuron_count(&self) -> usize {
        self.neurons.len()
    }

    pub fn neurons(&self) -> &[Neuron] {
        &self.neurons
    }

    pub(crate) fn neurons_mut(&mut self) -> &mut [Neuron] {
        &mut self.neurons
    }

    pub fn synapses(&self) -> &[Synapse] {
        &self.synapses
    }

    pub fn synapse_count(&self) -> usize {
        self.synapses.len()
    }

    pub fn summation(&self) -> &SummationBuffer {
        &self.bins
    }

    pub fn delta_t(&self) -> f64 {
        self.delta_t
    }

    /// Outgoing synapses of neuron `i`.
    pub fn outgoing(&self, i: NeuronId) -> &[Synapse] {
        match (self.offsets.get(i), self.offsets.get(i + 1)) {
            (Some(&start), Some(&end)) => &self.synapses[start..end],
            _ => &[],
        }
    }

    pub fn find_synapse(&self, source: NeuronId, dest: NeuronId) -> Option<&Synapse> {
        let out = self.outgoing(source);
        out.binary_search_by_key(&dest, |s| s.dest)
            .ok()
            .map(|k| &out[k])
    }

    pub fn out_degree(&self, i: NeuronId) -> usize {
        self.outgoing(i).len()
    }

    pub fn in_degrees(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.neurons.len()];
        for s in &self.synapses {
            if let Some(c) = counts.get_mut(s.dest) {
                *c += 1;
            }
        }
        counts
    }

    pub fn spike_counts(&self) -> Vec<u32> {
        self.neurons.iter().map(|n| n.spike_count).collect()
    }

    pub fn reset_spike_counts(&mut self) {
        for n in &mut self.neurons {
            n.spike_count = 0;
        }
    }

    pub(crate) fn take_synapses(&mut self) -> Vec<Synapse> {
        self.offsets.iter_mut().for_each(|o| *o = 0);
        core::mem::take(&mut self.synapses)
    }

    /// Install a new synapse set. It must be sorted by `(source, dest)` with
    /// no duplicate pairs and every endpoint inside the network.
    pub(crate) fn set_synapses(&mut self, synapses: Vec<Synapse>) -> Result<()> {
        let n = self.neurons.len();
        let mut offsets = vec![0usize; n + 1];
        let mut prev: Option<(NeuronId, NeuronId)> = None;
        for s in &synapses {
            if s.source >= n || s.dest >= n {
                return Err(SimError::Invariant(format!(
                    "synapse {} -> {} references a neuron outside 0..{n}",
                    s.source, s.dest
                )));
            }
            let key = (s.source, s.dest);
            if prev.is_some_and(|p| p >= key) {
                return Err(SimError::Invariant(format!(
                    "synapse {} -> {} is out of order or duplicated",
                    s.source, s.dest
                )));
            }
            prev = Some(key);
            offsets[s.source + 1] += 1;
        }
        for i in 0..n {
            offsets[i + 1] += offsets[i];
        }
        self.synapses = synapses;
        self.offsets = offsets;
        Ok(())
    }

    /// Check the structural invariants: every synapse's sign matches its
    /// source's kind, its delay fits the queue, and no neuron exceeds
    /// `max_synapses` incoming or outgoing synapses.
    pub fn check_invariants(&self, max_synapses: usize) -> Result<()> {
        let n = self.neurons.len();
        if self.offsets.len() != n + 1 || self.offsets[n] != self.synapses.len() {
            return Err(SimError::Invariant("synapse offsets are stale".into()));
        }
        if self.bins.len() != n {
            return Err(SimError::Invariant(format!(
                "{} summation bins for {n} neurons",
                self.bins.len()
            )));
        }
        for s in &self.synapses {
            let (Some(src), Some(dst)) = (self.neurons.get(s.source), self.neurons.get(s.dest))
            else {
                return Err(SimError::Invariant(format!(
                    "synapse {} -> {} references a missing neuron",
                    s.source, s.dest
                )));
            };
            if s.kind != SynapseKind::between(src.kind, dst.kind) {
                return Err(SimError::Invariant(format!(
                    "synapse {} -> {} has kind {:?}",
                    s.source, s.dest, s.kind
                )));
            }
            let sign_ok = if src.kind.is_excitatory() {
                s.weight >= 0.0
            } else {
                s.weight <= 0.0
            };
            if !sign_ok {
                return Err(SimError::Invariant(format!(
                    "synapse {} -> {} weight {} has the wrong sign",
                    s.source, s.dest, s.weight
                )));
            }
            if s.delay_ticks == 0 || s.delay_ticks >= DELAY_SLOTS {
                return Err(SimError::Invariant(format!(
                    "synapse {} -> {} delay of {} ticks",
                    s.source, s.dest, s.delay_ticks
                )));
            }
        }
        for (i, &c) in self.in_degrees().iter().enumerate() {
            let out = self.out_degree(i);
            if c > max_synapses || out > max_synapses {
                return Err(SimError::Invariant(format!(
                    "neuron {i} has {c} incoming and {out} outgoing synapses (max {max_synapses})"
                )));
            }
        }
        Ok(())
    }

    /// Advance one fine step. Returns the number of neurons that fired.
    pub fn step<M: NeuronModel>(&mut self, model: &M, ctx: &mut SimContext) -> Result<usize> {
        self.notify_fired()?;
        self.deliver(model, ctx.step)?;
        Ok(self.integrate(model, ctx))
    }

    fn notify_fired(&mut self) -> Result<()> {
        let Self {
            neurons,
            synapses,
            offsets,
            ..
        } = self;
        for (i, n) in neurons.iter_mut().enumerate() {
            if !core::mem::take(&mut n.fired) {
                continue;
            }
            for s in &mut synapses[offsets[i]..offsets[i + 1]] {
                s.queue.enqueue(s.delay_ticks)?;
            }
        }
        Ok(())
    }

    fn deliver<M: NeuronModel>(&mut self, model: &M, step: u64) -> Result<()> {
        let dt = self.delta_t;
        for s in &mut self.synapses {
            let contribution = model.advance_synapse(s, step, dt);
            self.bins.add(s.dest, contribution)?;
        }
        Ok(())
    }

    #[cfg(not(feature = "parallel"))]
    fn integrate<M: NeuronModel>(&mut self, model: &M, ctx: &mut SimContext) -> usize {
        let mut fired = 0;
        for (n, bin) in self.neurons.iter_mut().zip(self.bins.as_mut_slice()) {
            let input = core::mem::take(bin);
            let noise = if model.wants_noise(n) {
                model.draw_noise(n, &mut ctx.rng)
            } else {
                0.0
            };
            if model.advance_neuron(n, input, noise) {
                fired += 1;
            }
        }
        fired
    }

    // Noise is drawn up front in neuron order so the generator sees the same
    // sequence as the scalar path.
    #[cfg(feature = "parallel")]
    fn integrate<M: NeuronModel>(&mut self, model: &M, ctx: &mut SimContext) -> usize {
        let rng = &mut ctx.rng;
        self.noise.clear();
        self.noise.extend(self.neurons.iter().map(|n| {
            if model.wants_noise(n) {
                model.draw_noise(n, rng)
            } else {
                0.0
            }
        }));

        self.neurons
            .par_iter_mut()
            .zip(self.bins.as_mut_slice().par_iter_mut())
            .zip(self.noise.par_iter())
            .map(|((n, bin), &noise)| {
                let input = core::mem::take(bin);
                model.advance_neuron(n, input, noise) as usize
            })
            .sum()
    }
}
