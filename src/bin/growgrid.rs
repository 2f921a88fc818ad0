//! Command-line front end for the growth simulation.
//!
//! Examples:
//!   growgrid -t params.json -o state.xml
//!   growgrid -t params.json -w epoch10.mem
//!   growgrid -t params.json -r epoch10.mem -o state.xml
//!
//! The parameter file is a JSON `SimulationConfig`; missing fields take
//! their defaults. Logging goes to stderr. A memory image written at the end
//! of a run can be resumed under a parameter file with more growth epochs.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process;
use std::time::Instant;

use growgrid::{SimError, Simulation, SimulationConfig};
use tracing::{error, info};

#[derive(Debug, Default)]
struct Args {
    state_in: String,
    state_out: Option<String>,
    mem_in: Option<String>,
    mem_out: Option<String>,
}

fn print_usage() {
    eprintln!("growgrid: self-organizing LIF grid simulation");
    eprintln!("Usage: growgrid -t <params.json> [options]\n");
    eprintln!("Options:");
    eprintln!("  -t, --stateinfile <file>   Simulation parameters (required)");
    eprintln!("  -o, --stateoutfile <file>  State report (default: state_output_file, else stdout)");
    eprintln!("  -r, --meminfile <file>     Resume from a memory image");
    eprintln!("  -w, --memoutfile <file>    Write a memory image after the run");
    eprintln!("  -h, --help                 Show this help");
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{msg}\n");
    print_usage();
    process::exit(2);
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    args.next()
        .unwrap_or_else(|| usage_error(&format!("missing value for {flag}")))
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let mut state_in = None;
    let mut parsed = Args::default();

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "-t" | "--stateinfile" => state_in = Some(next_value(&mut args, &flag)),
            "-o" | "--stateoutfile" => parsed.state_out = Some(next_value(&mut args, &flag)),
            "-r" | "--meminfile" => parsed.mem_in = Some(next_value(&mut args, &flag)),
            "-w" | "--memoutfile" => parsed.mem_out = Some(next_value(&mut args, &flag)),
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            other => usage_error(&format!("unknown argument: {other}")),
        }
    }

    parsed.state_in = state_in.unwrap_or_else(|| usage_error("-t/--stateinfile is required"));
    parsed
}

fn run(args: &Args) -> Result<(), SimError> {
    let cfg = SimulationConfig::from_json_reader(BufReader::new(File::open(&args.state_in)?))?;
    info!(file = %args.state_in, neurons = cfg.total_neurons(), "loaded parameters");
    let mut sim = Simulation::new(cfg)?;

    if let Some(path) = &args.mem_in {
        let mut r = BufReader::new(File::open(path)?);
        sim.load_memory(&mut r)?;
    }

    let start = Instant::now();
    sim.run()?;
    info!(
        elapsed_secs = start.elapsed().as_secs_f64(),
        simulated_secs = sim.simulation_end_time(),
        "simulation finished"
    );

    match args
        .state_out
        .clone()
        .or_else(|| sim.config().state_output_file.clone())
    {
        Some(path) => {
            let mut w = BufWriter::new(File::create(&path)?);
            sim.save_state(&mut w)?;
            w.flush()?;
            info!(file = %path, "state report written");
        }
        None => {
            let mut out = io::stdout().lock();
            sim.save_state(&mut out)?;
            out.flush()?;
        }
    }

    if let Some(path) = &args.mem_out {
        let mut w = BufWriter::new(File::create(path)?);
        sim.save_memory(&mut w)?;
        w.flush()?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt().with_writer(io::stderr).init();

    let args = parse_args();
    if let Err(e) = run(&args) {
        error!("{e}");
        process::exit(1);
    }
}
