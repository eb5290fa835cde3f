use anyhow::{Context, Result};
use larvadrift_core::{
    DriftConfig, OutputError, ReleasePulse, Simulation, SinkFactory, ZoneKind, ZoneSpec,
};
use larvadrift_forcing::{AnalyticConfig, AnalyticDataset, OceanDataset};
use larvadrift_storage::TrajectoryStore;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;
use tracing::info;

mod runner;

use runner::RunHandle;

/// Everything one run needs: engine settings plus the analytic forcing.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppConfig {
    drift: DriftConfig,
    forcing: AnalyticConfig,
}

fn main() -> Result<()> {
    init_tracing();
    let config = match std::env::args().nth(1) {
        Some(path) => load_config(Path::new(&path))?,
        None => demo_config()?,
    };

    let dataset = AnalyticDataset::new(config.forcing)?;
    let serial = config.drift.serial;
    let mut simulation = Simulation::new(config.drift, Box::new(dataset), trajectory_sinks())?;
    simulation.setup()?;

    if serial {
        let report = simulation.run_serial()?;
        info!(runs = report.runs, "serial sweep finished");
    } else {
        simulation.init()?;
        let handle = RunHandle::spawn(simulation)?;
        let outcome = handle.join()?;
        info!(?outcome, "single run finished");
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let file =
        File::open(path).with_context(|| format!("cannot open config {}", path.display()))?;
    let config: AppConfig = serde_json::from_reader(file)
        .with_context(|| format!("cannot parse config {}", path.display()))?;
    Ok(config)
}

/// One trajectory file per run, numbered for serial sweeps.
fn trajectory_sinks() -> SinkFactory {
    Box::new(|run, _total| {
        let path = format!("larvadrift-run-{run:03}.jsonl");
        let store =
            TrajectoryStore::create(&path).map_err(|err| OutputError::Open(err.to_string()))?;
        info!(path, "recording trajectories");
        Ok(Box::new(store))
    })
}

/// Small self-contained demonstration: a pulsed release drifting across an
/// analytic basin, trajectories recorded every few steps.
fn demo_config() -> Result<AppConfig> {
    let forcing = AnalyticConfig {
        nx: 120,
        ny: 120,
        nz: 25,
        velocity: (0.15, 0.05, 0.0),
        rotation: 2.0e-6,
        land_border: 1,
        ..AnalyticConfig::default()
    };
    // Zone corners are easiest to express in grid space.
    let dataset = AnalyticDataset::new(forcing.clone())?;
    let corners = [(20.0, 20.0), (45.0, 20.0), (45.0, 45.0), (20.0, 45.0)];
    let mut lon = [0.0; 4];
    let mut lat = [0.0; 4];
    for (i, (x, y)) in corners.iter().enumerate() {
        let (vlon, vlat) = dataset.grid_to_geo(*x, *y);
        lon[i] = vlon;
        lat[i] = vlat;
    }
    let release_zone = ZoneSpec {
        kind: ZoneKind::Release,
        lon,
        lat,
        bathy_min: 0.0,
        bathy_max: 10_000.0,
        color: [0.9, 0.5, 0.1],
    };
    let drift = DriftConfig {
        particle_count: 2_000,
        transport_duration: 10 * larvadrift_core::SECONDS_PER_DAY,
        record_interval: 6 * larvadrift_core::SECONDS_PER_HOUR,
        release_zones: vec![release_zone],
        rng_seed: Some(0x1C70),
        sweep: larvadrift_core::SweepAxes {
            pulses: vec![ReleasePulse {
                events: 4,
                interval: larvadrift_core::SECONDS_PER_DAY / 2,
            }],
            ..larvadrift_core::SweepAxes::default()
        },
        ..DriftConfig::default()
    };
    Ok(AppConfig { drift, forcing })
}
