pub mod bootstrap;
pub mod codec;
pub mod daily;
pub mod thinner;
pub mod window;

use crate::sensor::synthetic::Synthetic;
use crate::{Clock, Sample, Timestamp};
use chrono::Duration;
use daily::DailyFiles;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use thinner::ThinReport;
use tokio::sync::RwLock;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use window::{Retention, Window};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("requested period of {0} s exceeds the {1} s limit")]
    InvalidPeriod(u64, u64),

    #[error("record too short: {0} bytes")]
    ShortRecord(usize),

    #[error("timestamp out of range: {0} ms")]
    BadTimestamp(i64),

    #[error("cannot create storage directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("{op} {path}: {source}")]
    File {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("storage task failed: {0}")]
    Task(#[from] task::JoinError),
}

pub(crate) fn file_error(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::File { op, path, source }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dir: PathBuf,
    pub retention: Retention,
    pub max_query_secs: u64,  // longest period a query may ask for
    pub thin_after_days: i64, // dense files older than this many days get thinned
    pub bootstrap_span: Duration,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retention: Retention::default(),
            max_query_secs: 7 * 24 * 60 * 60,
            thin_after_days: 7,
            bootstrap_span: Duration::days(7),
        }
    }
}

/// Persistent per-day files plus the in-memory window that queries read.
pub struct SensorStore {
    config: StoreConfig,
    files: DailyFiles,
    window: RwLock<Window>,
    clock: Arc<dyn Clock>,
    degraded: AtomicBool,
}

impl SensorStore {
    /// Creates the storage directory if needed and loads the window from disk.
    pub fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let files = DailyFiles::new(&config.dir);
        files.ensure_dir()?;
        let window = Window::from_samples(files.load_all()?, config.retention, clock.now());
        info!(
            "Opened sensor store {} with {} samples in memory",
            config.dir.display(),
            window.len()
        );
        Ok(Self {
            config,
            files,
            window: RwLock::new(window),
            clock,
            degraded: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn files(&self) -> &DailyFiles {
        &self.files
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// True while the last append to disk failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Fills an empty store with synthetic history so charts have something to show.
    /// Returns the number of samples written, zero if the store already had data.
    /// The generator is left where the history ends, ready to go on live.
    pub async fn bootstrap(&self, generator: &mut Synthetic) -> Result<usize, StoreError> {
        if !self.files.days()?.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        let retention = self.config.retention;
        let history =
            bootstrap::synthetic_history(generator, now, self.config.bootstrap_span, &retention);
        let files = self.files.clone();
        let history = task::spawn_blocking(move || files.append_batch(&history).map(|_| history))
            .await??;
        let written = history.len();
        *self.window.write().await = Window::from_samples(history, retention, now);
        info!("Bootstrapped an empty store with {written} synthetic samples");
        Ok(written)
    }

    /// Persists a sample and adds it to the window. A failed append is logged
    /// and marks the store degraded; the window still gets the sample.
    pub async fn record(&self, sample: Sample) {
        let files = self.files.clone();
        let result = match task::spawn_blocking(move || files.append(&sample)).await {
            Ok(r) => r,
            Err(e) => Err(StoreError::from(e)),
        };
        match result {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Appending to {} works again", self.files.dir().display());
                }
            }
            Err(e) => {
                error!("Sample at {} not persisted: {e}", sample.timestamp);
                self.degraded.store(true, Ordering::Relaxed);
            }
        }
        self.window.write().await.insert(sample);
    }

    pub async fn sensor_data(
        &self,
        period_secs: u64,
        include_all: bool,
    ) -> Result<Vec<Sample>, StoreError> {
        self.sensor_data_at(self.clock.now(), period_secs, include_all)
            .await
    }

    /// Samples younger than `period_secs` at `now`. Unless `include_all`,
    /// only the on-the-minute ones.
    pub async fn sensor_data_at(
        &self,
        now: Timestamp,
        period_secs: u64,
        include_all: bool,
    ) -> Result<Vec<Sample>, StoreError> {
        if period_secs > self.config.max_query_secs {
            return Err(StoreError::InvalidPeriod(
                period_secs,
                self.config.max_query_secs,
            ));
        }
        let period = Duration::seconds(period_secs as i64);
        Ok(self.window.read().await.query(now, period, include_all))
    }

    pub async fn latest(&self) -> Option<Sample> {
        self.window.read().await.latest().copied()
    }

    pub async fn len(&self) -> usize {
        self.window.read().await.len()
    }

    /// One thinning pass over the files, off the async threads.
    pub async fn thin(&self) -> Result<ThinReport, StoreError> {
        let files = self.files.clone();
        let now = self.clock.now();
        let after_days = self.config.thin_after_days;
        task::spawn_blocking(move || thinner::thin_pass(&files, now, after_days)).await?
    }
}

/// Thins once right away and then every `every`, until cancelled.
pub async fn thinning_task(store: Arc<SensorStore>, every: std::time::Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => (),
        }
        if let Err(e) = store.thin().await {
            warn!("Thinning pass aborted, will retry: {e}");
        }
    }
    info!("Thinning task finished");
}
