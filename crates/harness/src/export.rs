//! Persist run results as gzipped JSONL, one file per logical connection.
//!
//! Layout: `<data_dir>/<LABEL>/connection_<i>.jsonl.gz`, where `LABEL` is
//! the strategy's short label (`MWMT`, `MWST`, `SWST`). Each line is one
//! sample: `{"update_id":..,"client_timestamp":..,"delay":..}`.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use wslat_core::types::Sample;

use crate::result::{ConnectionSeries, RunResult};

/// Directory a strategy's series are written to.
pub fn run_dir(data_dir: &Path, result: &RunResult) -> PathBuf {
    data_dir.join(result.kind.label())
}

/// Write every series of `result` under `data_dir`. Returns the file paths
/// in connection order. Existing files are overwritten.
pub fn write_run(result: &RunResult, data_dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = run_dir(data_dir, result);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    result
        .iter()
        .map(|series| {
            let path = dir.join(format!("connection_{}.jsonl.gz", series.connection.0));
            write_series(series, &path)?;
            tracing::info!(
                connection = %series.connection,
                samples = series.samples.len(),
                path = %path.display(),
                "series saved"
            );
            Ok(path)
        })
        .collect()
}

fn write_series(series: &ConnectionSeries, path: &Path) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    for sample in &series.samples {
        serde_json::to_writer(&mut encoder, sample)?;
        encoder.write_all(b"\n")?;
    }
    encoder
        .finish()
        .with_context(|| format!("failed to finish {}", path.display()))?
        .flush()?;
    Ok(())
}

/// Read back one series file written by [`write_run`].
pub fn read_series(path: &Path) -> Result<Vec<Sample>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(GzDecoder::new(file));
    let mut samples = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let sample = serde_json::from_str(&line)
            .with_context(|| format!("{}: bad sample on line {}", path.display(), n + 1))?;
        samples.push(sample);
    }
    Ok(samples)
}
