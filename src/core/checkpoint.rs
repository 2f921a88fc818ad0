//! Memory image: a versioned sequence of LZ4-compressed chunks.
//!
//! ```text
//! MAGIC "GROWGRD1" | version u32
//! CFG0  run fingerprint (grid, time step, epoch length, synapse cap)
//! PRNG  generator state and cached Gaussian
//! STAT  global step, completed epochs
//! NEUR  neuron count, then every neuron
//! SYNS  synapse count, then every synapse with its delay queue
//! GROW  radii, rates, outgrowth, histories
//! ```
//!
//! Summation bins are empty at every epoch boundary and are not stored.
//! Unknown chunks are skipped. The epoch count is not part of the
//! fingerprint: an image can be resumed under a configuration with more
//! epochs than the run that wrote it.

use std::io::{self, Read, Write};

use crate::config::SimulationConfig;
use crate::error::{Result, SimError};
use crate::growth::GrowthState;
use crate::model::NeuronModel;
use crate::network::{Network, Neuron, Synapse};
use crate::prng::PrngState;
use crate::simulation::SimContext;
use crate::storage;

/// Configuration values a memory image must agree with.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Fingerprint {
    width: u32,
    height: u32,
    delta_t: f64,
    epoch_duration: f64,
    max_synapses: u32,
}

impl Fingerprint {
    fn of(cfg: &SimulationConfig) -> Self {
        Self {
            width: cfg.width as u32,
            height: cfg.height as u32,
            delta_t: cfg.delta_t,
            epoch_duration: cfg.epoch_duration,
            max_synapses: cfg.max_synapses_per_neuron as u32,
        }
    }

    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        storage::write_u32_le(w, self.width)?;
        storage::write_u32_le(w, self.height)?;
        storage::write_f64_le(w, self.delta_t)?;
        storage::write_f64_le(w, self.epoch_duration)?;
        storage::write_u32_le(w, self.max_synapses)
    }

    fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            width: storage::read_u32_le(r)?,
            height: storage::read_u32_le(r)?,
            delta_t: storage::read_f64_le(r)?,
            epoch_duration: storage::read_f64_le(r)?,
            max_synapses: storage::read_u32_le(r)?,
        })
    }

    fn mismatch(&self, expected: &Self) -> Option<String> {
        if (self.width, self.height) != (expected.width, expected.height) {
            return Some(format!(
                "image grid is {}x{}, configuration is {}x{}",
                self.width, self.height, expected.width, expected.height
            ));
        }
        if self.delta_t.to_bits() != expected.delta_t.to_bits() {
            return Some(format!(
                "image delta_t {} differs from {}",
                self.delta_t, expected.delta_t
            ));
        }
        if self.epoch_duration.to_bits() != expected.epoch_duration.to_bits() {
            return Some(format!(
                "image epoch_duration {} differs from {}",
                self.epoch_duration, expected.epoch_duration
            ));
        }
        if self.max_synapses != expected.max_synapses {
            return Some(format!(
                "image max_synapses_per_neuron {} differs from {}",
                self.max_synapses, expected.max_synapses
            ));
        }
        None
    }
}

/// Everything restored from an image, validated but not yet installed.
pub(crate) struct MemoryImage {
    pub rng: PrngState,
    pub step: u64,
    pub epochs_completed: u32,
    pub network: Network,
    pub growth: GrowthState,
}

pub(crate) fn write_memory<W: Write>(
    w: &mut W,
    cfg: &SimulationConfig,
    ctx: &SimContext,
    epochs_completed: u32,
    network: &Network,
    growth: &GrowthState,
) -> io::Result<()> {
    w.write_all(storage::MAGIC)?;
    storage::write_u32_le(w, storage::VERSION_CURRENT)?;

    let mut payload = Vec::new();
    Fingerprint::of(cfg).write(&mut payload)?;
    storage::write_chunk_lz4(w, *b"CFG0", &payload)?;

    payload.clear();
    let rng = ctx.rng.state();
    storage::write_u64_le(&mut payload, rng.state)?;
    storage::write_u32_le(&mut payload, rng.spare.is_some() as u32)?;
    storage::write_f64_le(&mut payload, rng.spare.unwrap_or(0.0))?;
    storage::write_chunk_lz4(w, *b"PRNG", &payload)?;

    payload.clear();
    storage::write_u64_le(&mut payload, ctx.step)?;
    storage::write_u32_le(&mut payload, epochs_completed)?;
    storage::write_chunk_lz4(w, *b"STAT", &payload)?;

    payload.clear();
    storage::write_u32_le(&mut payload, network.neuron_count() as u32)?;
    for n in network.neurons() {
        n.write_image(&mut payload)?;
    }
    storage::write_chunk_lz4(w, *b"NEUR", &payload)?;

    payload.clear();
    storage::write_u32_le(&mut payload, network.synapse_count() as u32)?;
    for s in network.synapses() {
        s.write_image(&mut payload)?;
    }
    storage::write_chunk_lz4(w, *b"SYNS", &payload)?;

    payload.clear();
    growth.write_image(&mut payload)?;
    storage::write_chunk_lz4(w, *b"GROW", &payload)
}

fn from_io(e: io::Error) -> SimError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => {
            SimError::CheckpointCorrupt(e.to_string())
        }
        _ => SimError::Io(e),
    }
}

fn corrupt(msg: impl Into<String>) -> SimError {
    SimError::CheckpointCorrupt(msg.into())
}

/// Parse and validate a memory image against `cfg`.
pub(crate) fn read_memory<R: Read, M: NeuronModel>(
    r: &mut R,
    cfg: &SimulationConfig,
    model: &M,
) -> Result<MemoryImage> {
    let magic = storage::read_exact::<8, _>(r).map_err(from_io)?;
    if &magic != storage::MAGIC {
        return Err(corrupt("bad memory image magic"));
    }
    let version = storage::read_u32_le(r).map_err(from_io)?;
    if version != storage::VERSION_CURRENT {
        return Err(corrupt(format!("unsupported memory image version {version}")));
    }

    let mut cfg_chunk: Option<Vec<u8>> = None;
    let mut prng_chunk: Option<Vec<u8>> = None;
    let mut stat_chunk: Option<Vec<u8>> = None;
    let mut neur_chunk: Option<Vec<u8>> = None;
    let mut syns_chunk: Option<Vec<u8>> = None;
    let mut grow_chunk: Option<Vec<u8>> = None;

    loop {
        let Some((tag, len)) = storage::try_read_chunk_header(r).map_err(from_io)? else {
            break;
        };
        let payload = storage::read_chunk_payload_lz4(r, len).map_err(from_io)?;
        match &tag {
            b"CFG0" => cfg_chunk = Some(payload),
            b"PRNG" => prng_chunk = Some(payload),
            b"STAT" => stat_chunk = Some(payload),
            b"NEUR" => neur_chunk = Some(payload),
            b"SYNS" => syns_chunk = Some(payload),
            b"GROW" => grow_chunk = Some(payload),
            _ => {}
        }
    }

    let missing = |tag: &str| corrupt(format!("missing {tag} chunk"));

    let image_fp = Fingerprint::read(&mut cfg_chunk.ok_or_else(|| missing("CFG0"))?.as_slice())
        .map_err(from_io)?;
    if let Some(msg) = image_fp.mismatch(&Fingerprint::of(cfg)) {
        return Err(SimError::CheckpointMismatch(msg));
    }

    let rng = {
        let chunk = prng_chunk.ok_or_else(|| missing("PRNG"))?;
        let mut p = chunk.as_slice();
        let state = storage::read_u64_le(&mut p).map_err(from_io)?;
        let has_spare = storage::read_u32_le(&mut p).map_err(from_io)?;
        let spare = storage::read_f64_le(&mut p).map_err(from_io)?;
        let spare = match has_spare {
            0 => None,
            1 => Some(spare),
            _ => return Err(corrupt("bad PRNG spare flag")),
        };
        PrngState { state, spare }
    };

    let (step, epochs_completed) = {
        let chunk = stat_chunk.ok_or_else(|| missing("STAT"))?;
        let mut p = chunk.as_slice();
        let step = storage::read_u64_le(&mut p).map_err(from_io)?;
        let epochs = storage::read_u32_le(&mut p).map_err(from_io)?;
        (step, epochs)
    };
    if epochs_completed > cfg.growth_epochs {
        return Err(SimError::CheckpointMismatch(format!(
            "image has {epochs_completed} completed epochs, configuration runs {}",
            cfg.growth_epochs
        )));
    }
    if step != epochs_completed as u64 * cfg.steps_per_epoch() {
        return Err(corrupt(format!(
            "step {step} is not the end of epoch {epochs_completed}"
        )));
    }

    let n = cfg.total_neurons();
    let neurons = {
        let chunk = neur_chunk.ok_or_else(|| missing("NEUR"))?;
        let mut p = chunk.as_slice();
        let count = storage::read_u32_le(&mut p).map_err(from_io)? as usize;
        if count != n {
            return Err(SimError::CheckpointMismatch(format!(
                "image has {count} neurons, configuration has {n}"
            )));
        }
        if p.len() < count * Neuron::image_bytes() {
            return Err(corrupt("NEUR chunk too short"));
        }
        let mut neurons = Vec::with_capacity(count);
        for _ in 0..count {
            let mut neuron = Neuron::read_image(&mut p).map_err(from_io)?;
            model.prepare(&mut neuron, cfg.delta_t);
            neurons.push(neuron);
        }
        neurons
    };

    let synapses = {
        let chunk = syns_chunk.ok_or_else(|| missing("SYNS"))?;
        let mut p = chunk.as_slice();
        let count = storage::read_u32_le(&mut p).map_err(from_io)? as usize;
        if count > n.saturating_mul(cfg.max_synapses_per_neuron) {
            return Err(SimError::CheckpointMismatch(format!(
                "image has {count} synapses, more than the configured cap allows"
            )));
        }
        let mut synapses = Vec::with_capacity(count);
        for _ in 0..count {
            synapses.push(Synapse::read_image(&mut p).map_err(from_io)?);
        }
        synapses
    };

    let growth = {
        let chunk = grow_chunk.ok_or_else(|| missing("GROW"))?;
        GrowthState::read_image(&mut chunk.as_slice(), cfg).map_err(from_io)?
    };
    if growth.history_rows() != epochs_completed as usize + 1 {
        return Err(corrupt(format!(
            "growth history has {} rows for {epochs_completed} completed epochs",
            growth.history_rows()
        )));
    }

    let mut network = Network::new(neurons, cfg.delta_t);
    network
        .set_synapses(synapses)
        .and_then(|()| network.check_invariants(cfg.max_synapses_per_neuron))
        .map_err(|e| match e {
            SimError::Invariant(msg) => SimError::CheckpointCorrupt(msg),
            other => other,
        })?;

    Ok(MemoryImage {
        rng,
        step,
        epochs_completed,
        network,
        growth,
    })
}
