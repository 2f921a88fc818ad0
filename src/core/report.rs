//! Final-state report: named, shaped matrices in an XML-like wrapper.
//!
//! Values are written with `Display`, which prints the shortest string that
//! parses back to the same `f64`, so equal states give byte-identical reports.

use std::fmt::Display;
use std::io::{self, Write};

use crate::model::NeuronModel;
use crate::network::NeuronKind;
use crate::simulation::Simulation;

/// Write one `<Matrix>` block with `rows * columns` row-major values.
pub fn write_matrix<W: Write, T: Display>(
    w: &mut W,
    name: &str,
    rows: usize,
    columns: usize,
    values: &[T],
) -> io::Result<()> {
    if values.len() != rows * columns {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "matrix {name}: {} values for a {rows}x{columns} shape",
                values.len()
            ),
        ));
    }
    writeln!(
        w,
        "   <Matrix name=\"{name}\" type=\"complete\" rows=\"{rows}\" columns=\"{columns}\" multiplier=\"1.0\">"
    )?;
    if columns > 0 {
        for row in values.chunks(columns) {
            write!(w, "  ")?;
            for v in row {
                write!(w, " {v}")?;
            }
            writeln!(w)?;
        }
    }
    writeln!(w, "</Matrix>")
}

pub(crate) fn write_state<W: Write, M: NeuronModel>(w: &mut W, sim: &Simulation<M>) -> io::Result<()> {
    let growth = sim.growth();
    let neurons = sim.network().neurons();
    let n = neurons.len();
    let rows = growth.history_rows();

    writeln!(w, "<?xml version=\"1.0\" standalone=\"no\"?>")?;
    writeln!(w, "<!-- State output file for the growth simulation-->")?;
    writeln!(w, "<SimState>")?;

    write_matrix(w, "radiiHistory", rows, n, growth.radii_history())?;
    write_matrix(w, "ratesHistory", rows, n, growth.rates_history())?;

    let burst = growth.burstiness_hist();
    write_matrix(w, "burstinessHist", 1, burst.len(), burst)?;
    let spikes = growth.spikes_history();
    write_matrix(w, "spikesHistory", 1, spikes.len(), spikes)?;

    write_matrix(w, "xloc", 1, n, growth.xloc())?;
    write_matrix(w, "yloc", 1, n, growth.yloc())?;

    let types: Vec<u32> = neurons.iter().map(|nr| nr.kind.code()).collect();
    write_matrix(w, "neuronTypes", 1, n, &types)?;

    let starters: Vec<usize> = neurons
        .iter()
        .enumerate()
        .filter(|(_, nr)| nr.kind == NeuronKind::Starter)
        .map(|(i, _)| i)
        .collect();
    write_matrix(w, "starterNeurons", 1, starters.len(), &starters)?;

    let thresh: Vec<f64> = neurons.iter().map(|nr| nr.v_thresh).collect();
    write_matrix(w, "neuronThresh", 1, n, &thresh)?;

    write_matrix(w, "Tsim", 1, 1, &[sim.config().epoch_duration])?;
    write_matrix(w, "simulationEndTime", 1, 1, &[sim.simulation_end_time()])?;

    writeln!(w, "</SimState>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NeuronLayout, SimulationConfig};

    fn render(sim: &Simulation) -> String {
        let mut out = Vec::new();
        write_state(&mut out, sim).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn matrix_block_layout() {
        let mut out = Vec::new();
        write_matrix(&mut out, "m", 2, 2, &[1.5, 2.0, -3.0, 0.25]).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "   <Matrix name=\"m\" type=\"complete\" rows=\"2\" columns=\"2\" multiplier=\"1.0\">\n   1.5 2\n   -3 0.25\n</Matrix>\n"
        );
        assert!(write_matrix(&mut Vec::new(), "bad", 2, 2, &[1.0]).is_err());
    }

    #[test]
    fn report_lists_every_matrix_with_its_shape() {
        let cfg = SimulationConfig::default()
            .with_grid(3, 2)
            .with_epochs(0.02, 2)
            .with_layout(NeuronLayout::Fixed {
                inhibitory: vec![0],
                starter: vec![4],
            });
        let mut sim = Simulation::new(cfg).unwrap();
        sim.run_epochs(1).unwrap();
        let text = render(&sim);

        assert!(text.starts_with("<?xml version=\"1.0\" standalone=\"no\"?>\n"));
        assert!(text.ends_with("</SimState>\n"));
        for (name, rows, cols) in [
            ("radiiHistory", 2, 6),
            ("ratesHistory", 2, 6),
            ("burstinessHist", 1, 1),
            ("spikesHistory", 1, 4),
            ("xloc", 1, 6),
            ("yloc", 1, 6),
            ("neuronTypes", 1, 6),
            ("starterNeurons", 1, 1),
            ("neuronThresh", 1, 6),
            ("Tsim", 1, 1),
            ("simulationEndTime", 1, 1),
        ] {
            let header = format!("name=\"{name}\" type=\"complete\" rows=\"{rows}\" columns=\"{cols}\"");
            assert!(text.contains(&header), "missing {header}");
        }
        assert!(text.contains("\"neuronTypes\" type=\"complete\" rows=\"1\" columns=\"6\" multiplier=\"1.0\">\n   1 2 2 2 3 2\n"));
        assert!(text.contains("\"xloc\" type=\"complete\" rows=\"1\" columns=\"6\" multiplier=\"1.0\">\n   0 1 2 0 1 2\n"));
        assert!(text.contains("\"starterNeurons\" type=\"complete\" rows=\"1\" columns=\"1\" multiplier=\"1.0\">\n   4\n"));
        assert!(text.contains("\"Tsim\" type=\"complete\" rows=\"1\" columns=\"1\" multiplier=\"1.0\">\n   0.02\n"));
        assert!(text.contains("\"simulationEndTime\" type=\"complete\" rows=\"1\" columns=\"1\" multiplier=\"1.0\">\n   0.02\n"));
    }
}
