//! Activity-dependent structural plasticity.
//!
//! Every neuron has a circular receptive field on the grid. At each epoch
//! boundary the field radius moves toward the homeostatic firing rate and the
//! synapse set is rebuilt: a directed synapse `i -> j` exists exactly when the
//! two fields overlap, with weight proportional to the overlap area.

use std::f64::consts::PI;
use std::io::{self, Read, Write};

use hashbrown::HashSet;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::config::{GrowthParams, SimulationConfig};
use crate::error::Result;
use crate::model::NeuronModel;
use crate::network::{Network, NeuronId, Synapse};
use crate::storage;

/// Width of a `burstiness_hist` bin (seconds).
pub const BURSTINESS_BIN_SECONDS: f64 = 1.0;
/// Width of a `spikes_history` bin (seconds).
pub const SPIKES_BIN_SECONDS: f64 = 0.01;

/// Outgrowth signal for a measured `rate`.
///
/// Positive below `target_rate`, zero at it, negative above, always in
/// `[-1, 1]`.
pub fn outgrowth(rate: f64, p: &GrowthParams) -> f64 {
    if p.target_rate == 0.0 {
        return if rate > 0.0 { -1.0 } else { 0.0 };
    }
    1.0 - 2.0 / (1.0 + ((p.epsilon - rate / p.max_rate()) / p.beta).exp())
}

/// Intersection area of two circles with radii `r1`, `r2` whose centres are
/// `d` apart.
pub fn overlap_area(r1: f64, r2: f64, d: f64) -> f64 {
    if r1 + r2 <= d {
        return 0.0;
    }
    let (small, large) = if r1 < r2 { (r1, r2) } else { (r2, r1) };
    if d + small <= large {
        return PI * small * small;
    }

    let (r1s, r2s, ds) = (r1 * r1, r2 * r2, d * d);
    let ang_cbd = 2.0 * ((r2s + ds - r1s) / (2.0 * r2 * d)).clamp(-1.0, 1.0).acos();
    let ang_cad = 2.0 * ((r1s + ds - r2s) / (2.0 * r1 * d)).clamp(-1.0, 1.0).acos();
    let area = 0.5 * (r2s * (ang_cbd - ang_cbd.sin()) + r1s * (ang_cad - ang_cad.sin()));
    area.max(0.0)
}

/// What one growth update did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrowthReport {
    pub epoch: u32,
    pub total_spikes: u64,
    pub created: usize,
    pub removed: usize,
    pub retained: usize,
    /// Overlapping pairs left unconnected because an endpoint was at its cap.
    pub capped: usize,
    /// Neurons whose rate exceeded `max_firing_rate`.
    pub runaway: usize,
    pub mean_radius: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GrowthState {
    width: usize,
    neuron_count: usize,
    xloc: Vec<f64>,
    yloc: Vec<f64>,
    /// Row-major `n * n`.
    distance: Vec<f64>,
    /// Row-major `n * n`, from the current radii.
    area: Vec<f64>,

    radii: Vec<f64>,
    rates: Vec<f64>,
    outgrowth: Vec<f64>,

    // One row of `n` per recorded epoch, starting with the initial state.
    radii_history: Vec<f64>,
    rates_history: Vec<f64>,

    burstiness_hist: Vec<u32>,
    spikes_history: Vec<u32>,
    burst_bin_steps: u64,
    spike_bin_steps: u64,
}

impl GrowthState {
    pub fn new(cfg: &SimulationConfig) -> Self {
        let n = cfg.total_neurons();
        let width = cfg.width;
        let xloc: Vec<f64> = (0..n).map(|i| (i % width) as f64).collect();
        let yloc: Vec<f64> = (0..n).map(|i| (i / width) as f64).collect();

        let mut distance = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                let dx = xloc[i] - xloc[j];
                let dy = yloc[i] - yloc[j];
                distance[i * n + j] = (dx * dx + dy * dy).sqrt();
            }
        }

        let radii = vec![cfg.growth.start_radius; n];
        let rates = vec![0.0; n];

        // Bin counts are bounded by `SimulationConfig::validate`.
        let burst_bins = cfg.histogram_bins(BURSTINESS_BIN_SECONDS) as usize;
        let spike_bins = cfg.histogram_bins(SPIKES_BIN_SECONDS) as usize;

        let mut state = Self {
            width,
            neuron_count: n,
            xloc,
            yloc,
            distance,
            area: vec![0.0; n * n],
            radii_history: radii.clone(),
            rates_history: rates.clone(),
            outgrowth: vec![0.0; n],
            radii,
            rates,
            burstiness_hist: vec![0; burst_bins],
            spikes_history: vec![0; spike_bins],
            burst_bin_steps: cfg.bin_steps(BURSTINESS_BIN_SECONDS),
            spike_bin_steps: cfg.bin_steps(SPIKES_BIN_SECONDS),
        };
        state.compute_areas();
        state
    }

    pub fn neuron_count(&self) -> usize {
        self.neuron_count
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn xloc(&self) -> &[f64] {
        &self.xloc
    }

    pub fn yloc(&self) -> &[f64] {
        &self.yloc
    }

    pub fn distance(&self, i: NeuronId, j: NeuronId) -> f64 {
        self.distance[i * self.neuron_count + j]
    }

    pub fn area(&self, i: NeuronId, j: NeuronId) -> f64 {
        self.area[i * self.neuron_count + j]
    }

    pub fn radii(&self) -> &[f64] {
        &self.radii
    }

    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    pub fn outgrowth(&self) -> &[f64] {
        &self.outgrowth
    }

    pub fn radii_history(&self) -> &[f64] {
        &self.radii_history
    }

    pub fn rates_history(&self) -> &[f64] {
        &self.rates_history
    }

    /// Rows in the radius/rate histories (completed epochs plus the initial row).
    pub fn history_rows(&self) -> usize {
        if self.neuron_count == 0 {
            0
        } else {
            self.radii_history.len() / self.neuron_count
        }
    }

    pub fn burstiness_hist(&self) -> &[u32] {
        &self.burstiness_hist
    }

    pub fn spikes_history(&self) -> &[u32] {
        &self.spikes_history
    }

    /// Whether the fields of `i` and `j` overlap. Coincident neurons never do.
    #[inline]
    pub fn overlaps(&self, i: NeuronId, j: NeuronId) -> bool {
        let d = self.distance(i, j);
        d > 0.0 && self.radii[i] + self.radii[j] > d
    }

    /// Count the spikes of global step `step` into the histograms.
    #[inline]
    pub fn record_step(&mut self, step: u64, fired: usize) {
        let fired = u32::try_from(fired).unwrap_or(u32::MAX);
        if let Some(b) = self.burstiness_hist.get_mut((step / self.burst_bin_steps) as usize) {
            *b = b.saturating_add(fired);
        }
        if let Some(b) = self.spikes_history.get_mut((step / self.spike_bin_steps) as usize) {
            *b = b.saturating_add(fired);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_radii(&mut self, radii: &[f64]) {
        self.radii.copy_from_slice(radii);
        self.compute_areas();
    }

    /// Run the epoch-boundary update: rates, radii, overlap, topology,
    /// history. Spike counters are cleared afterwards.
    pub fn update_connections<M: NeuronModel>(
        &mut self,
        epoch: u32,
        net: &mut Network,
        model: &M,
        cfg: &SimulationConfig,
    ) -> Result<GrowthReport> {
        let counts = net.spike_counts();
        let total_spikes = counts.iter().map(|&c| c as u64).sum();
        let runaway = self.update_radii(&counts, cfg);
        self.compute_areas();
        let mut report = self.rebuild(net, model, cfg)?;
        self.radii_history.extend_from_slice(&self.radii);
        self.rates_history.extend_from_slice(&self.rates);
        net.reset_spike_counts();

        report.epoch = epoch;
        report.total_spikes = total_spikes;
        report.runaway = runaway;
        report.mean_radius = if self.neuron_count == 0 {
            0.0
        } else {
            self.radii.iter().sum::<f64>() / self.neuron_count as f64
        };
        Ok(report)
    }

    /// Rates from spike counts, then outgrowth and the new radii. Returns the
    /// number of neurons above `max_firing_rate`.
    fn update_radii(&mut self, spike_counts: &[u32], cfg: &SimulationConfig) -> usize {
        let g = &cfg.growth;
        let max_rate = cfg.max_firing_rate as f64;
        let mut runaway = 0;
        for i in 0..self.neuron_count {
            let rate = spike_counts.get(i).copied().unwrap_or(0) as f64 / cfg.epoch_duration;
            if rate > max_rate {
                tracing::debug!(neuron = i, rate, max_rate, "firing rate above maximum");
                runaway += 1;
            }
            let out = outgrowth(rate, g);
            let r = self.radii[i];
            self.rates[i] = rate;
            self.outgrowth[i] = out;
            self.radii[i] = (r + r * g.rate_constant * out).max(g.min_radius);
        }
        runaway
    }

    fn compute_areas(&mut self) {
        let n = self.neuron_count;
        if n == 0 {
            return;
        }
        let radii = &self.radii;
        let distance = &self.distance;
        let fill_row = |i: usize, row: &mut [f64]| {
            for (j, a) in row.iter_mut().enumerate() {
                let d = distance[i * n + j];
                *a = if d > 0.0 {
                    overlap_area(radii[i], radii[j], d)
                } else {
                    0.0
                };
            }
        };

        #[cfg(feature = "parallel")]
        self.area
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, row)| fill_row(i, row));
        #[cfg(not(feature = "parallel"))]
        for (i, row) in self.area.chunks_mut(n).enumerate() {
            fill_row(i, row);
        }
    }

    /// Rebuild the synapse set from the current radii.
    ///
    /// Surviving synapses keep their response, queue and plasticity state and
    /// only get a new weight. New pairs are then added in `(source, dest)`
    /// order while both endpoints are under `max_synapses_per_neuron`.
    pub fn rebuild<M: NeuronModel>(
        &self,
        net: &mut Network,
        model: &M,
        cfg: &SimulationConfig,
    ) -> Result<GrowthReport> {
        let n = self.neuron_count;
        let max = cfg.max_synapses_per_neuron;
        let strength = cfg.synapses.strength_adjustment;
        let kinds: Vec<_> = net.neurons().iter().map(|nr| nr.kind).collect();

        let old = net.take_synapses();
        let mut report = GrowthReport::default();
        let mut out_count = vec![0usize; n];
        let mut in_count = vec![0usize; n];
        let mut existing: HashSet<(NeuronId, NeuronId)> = HashSet::with_capacity(old.len());
        let mut synapses: Vec<Synapse> = Vec::with_capacity(old.len());

        for mut s in old {
            if self.overlaps(s.source, s.dest) {
                s.weight = self.area(s.source, s.dest) * strength * model.synapse_sign(kinds[s.source]);
                out_count[s.source] += 1;
                in_count[s.dest] += 1;
                existing.insert((s.source, s.dest));
                synapses.push(s);
                report.retained += 1;
            } else {
                report.removed += 1;
            }
        }

        for src in 0..n {
            for dst in 0..n {
                if !self.overlaps(src, dst) || existing.contains(&(src, dst)) {
                    continue;
                }
                if out_count[src] >= max || in_count[dst] >= max {
                    report.capped += 1;
                    continue;
                }
                let kind = model.synapse_kind(kinds[src], kinds[dst]);
                let weight = self.area(src, dst) * strength * model.synapse_sign(kinds[src]);
                synapses.push(model.create_synapse(src, dst, kind, weight, cfg));
                out_count[src] += 1;
                in_count[dst] += 1;
                report.created += 1;
            }
        }

        synapses.sort_unstable_by_key(|s| (s.source, s.dest));
        net.set_synapses(synapses)?;
        net.check_invariants(max)?;

        tracing::debug!(
            created = report.created,
            removed = report.removed,
            retained = report.retained,
            capped = report.capped,
            "rebuilt synapse topology"
        );
        Ok(report)
    }

    pub(crate) fn write_image<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_f64_slice(w, &self.radii)?;
        storage::write_f64_slice(w, &self.rates)?;
        storage::write_f64_slice(w, &self.outgrowth)?;
        storage::write_f64_slice(w, &self.radii_history)?;
        storage::write_f64_slice(w, &self.rates_history)?;
        storage::write_u32_slice(w, &self.burstiness_hist)?;
        storage::write_u32_slice(w, &self.spikes_history)
    }

    /// Restore the dynamic growth state on top of the geometry for `cfg`.
    pub(crate) fn read_image<R: Read>(r: &mut R, cfg: &SimulationConfig) -> io::Result<Self> {
        let mut state = Self::new(cfg);
        let n = state.neuron_count;
        let max_rows = cfg.growth_epochs as usize + 1;
        let bad = |what: &str| io::Error::new(io::ErrorKind::InvalidData, format!("GROW: {what}"));

        let radii = storage::read_f64_vec(r, n)?;
        let rates = storage::read_f64_vec(r, n)?;
        let outgrowth = storage::read_f64_vec(r, n)?;
        if radii.len() != n || rates.len() != n || outgrowth.len() != n {
            return Err(bad("per-neuron vector length mismatch"));
        }
        if radii
            .iter()
            .any(|&r| !r.is_finite() || r < cfg.growth.min_radius)
        {
            return Err(bad("radius below minimum"));
        }

        let radii_history = storage::read_f64_vec(r, n * max_rows)?;
        let rates_history = storage::read_f64_vec(r, n * max_rows)?;
        if radii_history.len() != rates_history.len() || (n > 0 && radii_history.len() % n != 0) {
            return Err(bad("history shape mismatch"));
        }

        // The image may come from a run configured with a different number of
        // epochs. Bins past its last step are zero and the bin widths match.
        let limit = SimulationConfig::MAX_HISTOGRAM_BINS as usize;
        for hist in [&mut state.burstiness_hist, &mut state.spikes_history] {
            let stored = storage::read_u32_vec(r, limit)?;
            let keep = stored.len().min(hist.len());
            if stored[keep..].iter().any(|&c| c != 0) {
                return Err(bad("histogram has spikes past the configured run"));
            }
            hist[..keep].copy_from_slice(&stored[..keep]);
        }

        state.radii = radii;
        state.rates = rates;
        state.outgrowth = outgrowth;
        state.radii_history = radii_history;
        state.rates_history = rates_history;
        state.compute_areas();
        Ok(state)
    }
}
