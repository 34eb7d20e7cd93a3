use crate::argparse::{Cli, Commands};
use anyhow::{Context, Result};
use inkdash::sampling::Sampler;
use inkdash::sensor::synthetic::Synthetic;
use inkdash::sensor::{Hardware, Source};
use inkdash::storage::window::{split_series, SERIES_GAP_SECS};
use inkdash::storage::{self, SensorStore, StoreConfig};
use inkdash::SystemClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
// Include these modules as part of the binary crate, not the library crate
// as this contains the actual implementation of the logging facility
mod argparse;
mod logging;

const THIN_EVERY: Duration = Duration::from_secs(24 * 60 * 60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // .env values must be visible before clap looks at the environment
    inkdash::load_env();
    let Cli {
        console,
        log_file,
        verbose,
        data_dir,
        command,
    } = argparse::parse();

    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let _guards = logging::init(level, console, Some(log_file.as_path()));

    // An unusable store is fatal, nothing else can work without it
    let store = SensorStore::open(StoreConfig::new(&data_dir), Arc::new(SystemClock))
        .with_context(|| format!("opening sensor store in {}", data_dir.display()))?;
    let store = Arc::new(store);

    match command {
        Commands::Run { emulated, hardware } => run(store, emulated, hardware).await,
        Commands::Query { period, all, json } => query(&store, period, all, json).await,
        Commands::Thin {} => {
            let report = store.thin().await?;
            println!(
                "{} days thinned, {} records kept, {} dropped, {} failed",
                report.thinned, report.kept, report.dropped, report.failed
            );
            Ok(())
        }
        Commands::Bootstrap {} => {
            let written = store.bootstrap(&mut Synthetic::new()).await?;
            if written == 0 {
                println!("Store already has data, nothing written");
            } else {
                println!("Wrote {written} synthetic samples");
            }
            Ok(())
        }
    }
}

async fn run(store: Arc<SensorStore>, emulated: bool, hardware: argparse::Hardware) -> Result<()> {
    // History first: live sampling must never interleave with it
    let mut generator = Synthetic::new();
    store
        .bootstrap(&mut generator)
        .await
        .context("bootstrapping sensor history")?;

    let source = if emulated {
        info!("Running in emulated mode");
        // carries on the walk where the history ended
        Source::Synthetic(generator)
    } else {
        let hw = Hardware::open(
            &hardware.co2_tty,
            &hardware.i2c_bus,
            hardware.bme280_address,
        )
        .await
        .context("opening sensors")?;
        Source::Hardware(hw)
    };

    let cancel = CancellationToken::new();
    let thinning = tokio::spawn(storage::thinning_task(
        store.clone(),
        THIN_EVERY,
        cancel.clone(),
    ));
    let sampling = tokio::spawn(Sampler::new(source, store.clone()).run(cancel.clone()));

    // Nothing to do on the main task,
    // simply waits here
    shutdown_signal().await?;
    info!("Shutting down");
    cancel.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, sampling).await {
        Ok(Ok(())) => (),
        Ok(Err(e)) => warn!("Sampling task ended abnormally: {e}"),
        Err(_) => warn!("Sampling task still busy after {SHUTDOWN_GRACE:?}, exiting anyway"),
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, thinning).await.is_err() {
        warn!("Thinning pass still running, exiting anyway");
    }
    Ok(())
}

async fn query(store: &SensorStore, period: u64, all: bool, json: bool) -> Result<()> {
    let samples = store.sensor_data(period, all).await?;
    if json {
        for sample in &samples {
            println!("{}", serde_json::to_string(sample)?);
        }
        return Ok(());
    }
    let gap = chrono::Duration::seconds(SERIES_GAP_SECS);
    for (i, run) in split_series(&samples, gap).into_iter().enumerate() {
        if i > 0 {
            println!("-- gap --");
        }
        for s in run {
            println!(
                "{}  {:7.1} ppm  {:6.2} \u{00B0}C  {:5.1} %  {:7.2} hPa",
                s.timestamp.format("%Y-%m-%d %H:%M:%S"),
                s.co2,
                s.temperature,
                s.humidity,
                s.pressure,
            );
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        r = signal::ctrl_c() => r?,
        _ = term.recv() => (),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    signal::ctrl_c().await?;
    Ok(())
}
