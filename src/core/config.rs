#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::delay::DELAY_SLOTS;
use crate::error::ConfigError;
use crate::growth::{BURSTINESS_BIN_SECONDS, SPIKES_BIN_SECONDS};
use crate::network::SynapseKind;

/// Closed interval a per-neuron parameter is drawn from at setup.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub const fn fixed(value: f64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    fn check(&self, field: &'static str) -> Result<(), ConfigError> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(ConfigError::invalid(field, "bounds must be finite"));
        }
        if self.min > self.max {
            return Err(ConfigError::invalid(field, "min must be <= max"));
        }
        Ok(())
    }
}

/// Membrane and current parameters of the LIF neurons.
///
/// Currents are in amperes, potentials in volts, `rm` in ohms, `cm` in farads
/// and `t_refract` in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NeuronParams {
    pub i_inject: ValueRange,
    /// Standard deviation of the per-step Gaussian noise current.
    pub i_noise: ValueRange,
    pub v_thresh: ValueRange,
    pub v_resting: ValueRange,
    pub v_reset: ValueRange,
    pub v_init: ValueRange,
    pub starter_v_thresh: ValueRange,
    pub starter_v_reset: ValueRange,
    pub rm: f64,
    pub cm: f64,
    pub t_refract: f64,
}

impl Default for NeuronParams {
    fn default() -> Self {
        Self {
            i_inject: ValueRange::fixed(13.5e-9),
            i_noise: ValueRange::new(1.0e-9, 1.5e-9),
            v_thresh: ValueRange::fixed(15.0e-3),
            v_resting: ValueRange::fixed(0.0),
            v_reset: ValueRange::fixed(13.5e-3),
            v_init: ValueRange::fixed(13.0e-3),
            starter_v_thresh: ValueRange::new(13.565e-3, 13.655e-3),
            starter_v_reset: ValueRange::fixed(13.0e-3),
            rm: 1.0e6,
            cm: 3.0e-8,
            t_refract: 3.0e-3,
        }
    }
}

/// Kinetics of one synapse kind. `tau` and `delay` are in seconds;
/// `u`, `d`, `f` are the short-term plasticity use, depression and
/// facilitation constants.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SynapseKindParams {
    pub tau: f64,
    pub delay: f64,
    pub u: f64,
    pub d: f64,
    pub f: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SynapseParams {
    pub ii: SynapseKindParams,
    pub ie: SynapseKindParams,
    pub ei: SynapseKindParams,
    pub ee: SynapseKindParams,
    /// Scales overlap area (in grid units squared) into synaptic current.
    pub strength_adjustment: f64,
}

impl Default for SynapseParams {
    fn default() -> Self {
        Self {
            ii: SynapseKindParams {
                tau: 6.0e-3,
                delay: 0.8e-3,
                u: 0.32,
                d: 0.144,
                f: 0.06,
            },
            ie: SynapseKindParams {
                tau: 6.0e-3,
                delay: 0.8e-3,
                u: 0.25,
                d: 0.7,
                f: 0.02,
            },
            ei: SynapseKindParams {
                tau: 3.0e-3,
                delay: 0.8e-3,
                u: 0.05,
                d: 0.125,
                f: 1.2,
            },
            ee: SynapseKindParams {
                tau: 3.0e-3,
                delay: 1.5e-3,
                u: 0.5,
                d: 1.1,
                f: 0.05,
            },
            strength_adjustment: 1.0e-8,
        }
    }
}

impl SynapseParams {
    pub fn for_kind(&self, kind: SynapseKind) -> &SynapseKindParams {
        match kind {
            SynapseKind::II => &self.ii,
            SynapseKind::IE => &self.ie,
            SynapseKind::EI => &self.ei,
            SynapseKind::EE => &self.ee,
        }
    }
}

/// Homeostatic growth constants.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GrowthParams {
    /// Fraction of the maximum rate that the target rate represents.
    pub epsilon: f64,
    /// Sigmoid width of the outgrowth law.
    pub beta: f64,
    /// Set point in spikes per second.
    pub target_rate: f64,
    /// Fractional radius change per epoch at full outgrowth.
    pub rate_constant: f64,
    pub min_radius: f64,
    pub start_radius: f64,
}

impl Default for GrowthParams {
    fn default() -> Self {
        Self {
            epsilon: 0.6,
            beta: 0.1,
            target_rate: 1.9,
            rate_constant: 0.025,
            min_radius: 0.1,
            start_radius: 0.4,
        }
    }
}

impl GrowthParams {
    /// Rate at which outgrowth saturates at -1 (`target_rate / epsilon`).
    pub fn max_rate(&self) -> f64 {
        self.target_rate / self.epsilon
    }
}

/// How neuron types are assigned at setup.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum NeuronLayout {
    /// Seeded random placement.
    Random {
        frac_excitatory: f64,
        frac_starter: f64,
    },
    /// Explicit neuron indices; everything else is excitatory.
    Fixed {
        inhibitory: Vec<usize>,
        starter: Vec<usize>,
    },
}

impl Default for NeuronLayout {
    fn default() -> Self {
        Self::Random {
            frac_excitatory: 0.98,
            frac_starter: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SimulationConfig {
    pub width: usize,
    pub height: usize,
    /// Accepted for parameter-file compatibility; the grid is 2-D.
    pub depth: usize,

    /// Simulated seconds between growth updates.
    pub epoch_duration: f64,
    pub growth_epochs: u32,
    /// Integration step in seconds.
    pub delta_t: f64,

    /// Spikes per second above which a neuron is reported as runaway.
    pub max_firing_rate: u32,
    pub max_synapses_per_neuron: usize,

    pub seed: u64,

    pub state_output_file: Option<String>,

    pub neurons: NeuronParams,
    pub synapses: SynapseParams,
    pub growth: GrowthParams,
    pub layout: NeuronLayout,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 10,
            height: 10,
            depth: 1,
            epoch_duration: 100.0,
            growth_epochs: 10,
            delta_t: 1.0e-4,
            max_firing_rate: 200,
            max_synapses_per_neuron: 200,
            seed: 777,
            state_output_file: None,
            neurons: NeuronParams::default(),
            synapses: SynapseParams::default(),
            growth: GrowthParams::default(),
            layout: NeuronLayout::default(),
        }
    }
}

impl SimulationConfig {
    /// Pairwise distance and overlap matrices are dense, so the grid is bounded.
    pub const MAX_NEURONS: usize = 1 << 14;
    /// Upper bound on `steps_per_epoch * growth_epochs`.
    pub const MAX_TOTAL_STEPS: u64 = 1 << 40;
    /// Spike histograms are allocated for the whole run up front.
    pub const MAX_HISTOGRAM_BINS: u64 = 1 << 24;

    pub fn with_grid(mut self, width: usize, height: usize) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set epoch length (seconds) and number of growth epochs.
    pub fn with_epochs(mut self, epoch_duration: f64, growth_epochs: u32) -> Self {
        self.epoch_duration = epoch_duration;
        self.growth_epochs = growth_epochs;
        self
    }

    pub fn with_noise(mut self, i_noise: ValueRange) -> Self {
        self.neurons.i_noise = i_noise;
        self
    }

    pub fn with_layout(mut self, layout: NeuronLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_max_synapses(mut self, max_synapses_per_neuron: usize) -> Self {
        self.max_synapses_per_neuron = max_synapses_per_neuron;
        self
    }

    pub fn total_neurons(&self) -> usize {
        self.width * self.height
    }

    pub fn steps_per_epoch(&self) -> u64 {
        (self.epoch_duration / self.delta_t).round() as u64
    }

    /// Fine steps in the whole run, `None` on overflow.
    pub fn total_steps(&self) -> Option<u64> {
        self.steps_per_epoch().checked_mul(self.growth_epochs as u64)
    }

    /// Fine steps per histogram bin of `seconds` width.
    pub fn bin_steps(&self, seconds: f64) -> u64 {
        ((seconds / self.delta_t).round() as u64).max(1)
    }

    /// Bins needed to cover the whole run at `seconds` per bin.
    pub fn histogram_bins(&self, seconds: f64) -> u64 {
        self.total_steps()
            .unwrap_or(u64::MAX)
            .div_ceil(self.bin_steps(seconds))
    }

    /// Total simulated seconds across all configured epochs.
    pub fn total_duration(&self) -> f64 {
        self.epoch_duration * self.growth_epochs as f64
    }

    pub fn delay_ticks(&self, kind: SynapseKind) -> usize {
        let delay = self.synapses.for_kind(kind).delay;
        ((delay / self.delta_t).round() as usize).max(1)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[cfg(feature = "serde")]
    pub fn from_json_reader<R: std::io::Read>(r: R) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_reader(r).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration, naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 {
            return Err(ConfigError::invalid("width", "must be >= 1"));
        }
        if self.height == 0 {
            return Err(ConfigError::invalid("height", "must be >= 1"));
        }
        if self.depth == 0 {
            return Err(ConfigError::invalid("depth", "must be >= 1"));
        }
        if self.total_neurons() > Self::MAX_NEURONS {
            return Err(ConfigError::invalid(
                "width",
                format!("width * height must be <= {}", Self::MAX_NEURONS),
            ));
        }
        if !self.delta_t.is_finite() || self.delta_t <= 0.0 {
            return Err(ConfigError::invalid("delta_t", "must be finite and > 0"));
        }
        if !self.epoch_duration.is_finite() || self.epoch_duration <= 0.0 {
            return Err(ConfigError::invalid(
                "epoch_duration",
                "must be finite and > 0",
            ));
        }
        if self.steps_per_epoch() == 0 {
            return Err(ConfigError::invalid(
                "epoch_duration",
                "must span at least one integration step",
            ));
        }
        if self.growth_epochs == 0 {
            return Err(ConfigError::invalid("growth_epochs", "must be >= 1"));
        }
        match self.total_steps() {
            Some(total) if total <= Self::MAX_TOTAL_STEPS => {}
            _ => {
                return Err(ConfigError::invalid(
                    "epoch_duration",
                    format!(
                        "epoch_duration * growth_epochs exceeds {} integration steps",
                        Self::MAX_TOTAL_STEPS
                    ),
                ))
            }
        }
        for seconds in [BURSTINESS_BIN_SECONDS, SPIKES_BIN_SECONDS] {
            if self.histogram_bins(seconds) > Self::MAX_HISTOGRAM_BINS {
                return Err(ConfigError::invalid(
                    "epoch_duration",
                    format!(
                        "run needs more than {} histogram bins of {seconds} s",
                        Self::MAX_HISTOGRAM_BINS
                    ),
                ));
            }
        }
        if self.max_firing_rate == 0 {
            return Err(ConfigError::invalid("max_firing_rate", "must be >= 1"));
        }
        if self.max_synapses_per_neuron == 0 {
            return Err(ConfigError::invalid(
                "max_synapses_per_neuron",
                "must be >= 1",
            ));
        }

        self.validate_neurons()?;
        self.validate_synapses()?;
        self.validate_growth()?;
        self.validate_layout()
    }

    fn validate_neurons(&self) -> Result<(), ConfigError> {
        let n = &self.neurons;
        n.i_inject.check("neurons.i_inject")?;
        n.i_noise.check("neurons.i_noise")?;
        if n.i_noise.min < 0.0 {
            return Err(ConfigError::invalid("neurons.i_noise", "must be >= 0"));
        }
        n.v_thresh.check("neurons.v_thresh")?;
        n.v_resting.check("neurons.v_resting")?;
        n.v_reset.check("neurons.v_reset")?;
        n.v_init.check("neurons.v_init")?;
        n.starter_v_thresh.check("neurons.starter_v_thresh")?;
        n.starter_v_reset.check("neurons.starter_v_reset")?;
        if !n.rm.is_finite() || n.rm <= 0.0 {
            return Err(ConfigError::invalid("neurons.rm", "must be finite and > 0"));
        }
        if !n.cm.is_finite() || n.cm <= 0.0 {
            return Err(ConfigError::invalid("neurons.cm", "must be finite and > 0"));
        }
        if !n.t_refract.is_finite() || n.t_refract < 0.0 {
            return Err(ConfigError::invalid(
                "neurons.t_refract",
                "must be finite and >= 0",
            ));
        }
        Ok(())
    }

    fn validate_synapses(&self) -> Result<(), ConfigError> {
        let s = &self.synapses;
        if !s.strength_adjustment.is_finite() || s.strength_adjustment <= 0.0 {
            return Err(ConfigError::invalid(
                "synapses.strength_adjustment",
                "must be finite and > 0",
            ));
        }
        for (field, kind) in [
            ("synapses.ii", SynapseKind::II),
            ("synapses.ie", SynapseKind::IE),
            ("synapses.ei", SynapseKind::EI),
            ("synapses.ee", SynapseKind::EE),
        ] {
            let p = s.for_kind(kind);
            if !p.tau.is_finite() || p.tau <= 0.0 {
                return Err(ConfigError::invalid(field, "tau must be finite and > 0"));
            }
            if !p.delay.is_finite() || p.delay < 0.0 {
                return Err(ConfigError::invalid(field, "delay must be finite and >= 0"));
            }
            if self.delay_ticks(kind) >= DELAY_SLOTS {
                return Err(ConfigError::invalid(
                    field,
                    format!(
                        "delay of {} steps exceeds the {}-slot delay queue",
                        self.delay_ticks(kind),
                        DELAY_SLOTS
                    ),
                ));
            }
            if !(p.u > 0.0 && p.u <= 1.0) {
                return Err(ConfigError::invalid(field, "u must be in (0, 1]"));
            }
            if !p.d.is_finite() || p.d <= 0.0 {
                return Err(ConfigError::invalid(field, "d must be finite and > 0"));
            }
            if !p.f.is_finite() || p.f <= 0.0 {
                return Err(ConfigError::invalid(field, "f must be finite and > 0"));
            }
        }
        Ok(())
    }

    fn validate_growth(&self) -> Result<(), ConfigError> {
        let g = &self.growth;
        if !(g.epsilon > 0.0 && g.epsilon <= 1.0) {
            return Err(ConfigError::invalid("growth.epsilon", "must be in (0, 1]"));
        }
        if !g.beta.is_finite() || g.beta <= 0.0 {
            return Err(ConfigError::invalid("growth.beta", "must be finite and > 0"));
        }
        if !g.target_rate.is_finite() || g.target_rate < 0.0 {
            return Err(ConfigError::invalid(
                "growth.target_rate",
                "must be finite and >= 0",
            ));
        }
        if !(g.rate_constant > 0.0 && g.rate_constant < 1.0) {
            return Err(ConfigError::invalid(
                "growth.rate_constant",
                "must be in (0, 1)",
            ));
        }
        if !g.min_radius.is_finite() || g.min_radius <= 0.0 {
            return Err(ConfigError::invalid(
                "growth.min_radius",
                "must be finite and > 0",
            ));
        }
        if !g.start_radius.is_finite() || g.start_radius < g.min_radius {
            return Err(ConfigError::invalid(
                "growth.start_radius",
                "must be finite and >= min_radius",
            ));
        }
        Ok(())
    }

    fn validate_layout(&self) -> Result<(), ConfigError> {
        let n = self.total_neurons();
        match &self.layout {
            NeuronLayout::Random {
                frac_excitatory,
                frac_starter,
            } => {
                if !(0.0..=1.0).contains(frac_excitatory) {
                    return Err(ConfigError::invalid(
                        "layout.frac_excitatory",
                        "must be in [0, 1]",
                    ));
                }
                if !(0.0..=1.0).contains(frac_starter) {
                    return Err(ConfigError::invalid(
                        "layout.frac_starter",
                        "must be in [0, 1]",
                    ));
                }
                if frac_starter > frac_excitatory {
                    return Err(ConfigError::invalid(
                        "layout.frac_starter",
                        "starters are excitatory, so must be <= frac_excitatory",
                    ));
                }
            }
            NeuronLayout::Fixed {
                inhibitory,
                starter,
            } => {
                let mut seen = vec![false; n];
                for (field, list) in [("layout.inhibitory", inhibitory), ("layout.starter", starter)]
                {
                    for &i in list {
                        if i >= n {
                            return Err(ConfigError::invalid(
                                field,
                                format!("neuron index {i} is outside the {n}-neuron grid"),
                            ));
                        }
                        if seen[i] {
                            return Err(ConfigError::invalid(
                                field,
                                format!("neuron index {i} listed more than once"),
                            ));
                        }
                        seen[i] = true;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SimulationConfig::default().validate().unwrap();
    }

    #[test]
    fn steps_and_delays_are_rounded() {
        let cfg = SimulationConfig::default().with_epochs(0.1, 3);
        assert_eq!(cfg.steps_per_epoch(), 1000);
        assert_eq!(cfg.delay_ticks(SynapseKind::EE), 15);
        assert_eq!(cfg.delay_ticks(SynapseKind::II), 8);
    }

    #[test]
    fn run_length_is_bounded() {
        let overflow = SimulationConfig::default()
            .with_grid(2, 2)
            .with_epochs(1.0e15, 10);
        assert_eq!(overflow.total_steps(), None);
        assert!(matches!(
            overflow.validate(),
            Err(ConfigError::Invalid {
                field: "epoch_duration",
                ..
            })
        ));

        // 1e11 steps fit the step bound but not the 10 ms histogram.
        let long = SimulationConfig::default()
            .with_grid(2, 2)
            .with_epochs(1.0e5, 100);
        assert_eq!(long.total_steps(), Some(100_000_000_000));
        assert!(matches!(
            long.validate(),
            Err(ConfigError::Invalid {
                field: "epoch_duration",
                ..
            })
        ));

        let cfg = SimulationConfig::default();
        assert_eq!(cfg.histogram_bins(SPIKES_BIN_SECONDS), 100_000);
        assert_eq!(cfg.histogram_bins(BURSTINESS_BIN_SECONDS), 1_000);
    }

    #[test]
    fn errors_name_the_field() {
        let cfg = SimulationConfig::default().with_grid(0, 4);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "width", .. })
        ));

        let mut cfg = SimulationConfig::default();
        cfg.growth.rate_constant = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "growth.rate_constant",
                ..
            })
        ));

        let mut cfg = SimulationConfig::default();
        cfg.synapses.ee.delay = 10.0e-3; // 100 steps
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "synapses.ee",
                ..
            })
        ));
    }

    #[test]
    fn fixed_layout_is_checked() {
        let cfg = SimulationConfig::default()
            .with_grid(2, 2)
            .with_layout(NeuronLayout::Fixed {
                inhibitory: vec![1],
                starter: vec![1],
            });
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "layout.starter",
                ..
            })
        ));

        let cfg = SimulationConfig::default()
            .with_grid(2, 2)
            .with_layout(NeuronLayout::Fixed {
                inhibitory: vec![4],
                starter: vec![],
            });
        assert!(cfg.validate().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_config_fills_in_defaults() {
        let cfg = SimulationConfig::from_json_str(
            r#"{
                "width": 4,
                "height": 3,
                "epoch_duration": 0.5,
                "growth_epochs": 2,
                "seed": 9,
                "layout": { "kind": "fixed", "inhibitory": [0], "starter": [5] }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.total_neurons(), 12);
        assert_eq!(cfg.seed, 9);
        assert_eq!(cfg.delta_t, 1.0e-4);
        assert_eq!(cfg.growth, GrowthParams::default());

        let err = SimulationConfig::from_json_str(r#"{ "width": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "width", .. }));
        assert!(matches!(
            SimulationConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
