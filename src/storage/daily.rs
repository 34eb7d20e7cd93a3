// One append-only file per UTC day:
//   <dir>/YYYY-MM-DD.bin        dense, one record per second
//   <dir>/YYYY-MM-DD.thin.bin   thinned, one record per minute

use super::codec::{self, RECORD_SIZE};
use super::{file_error, StoreError};
use crate::Sample;
use chrono::prelude::*;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DAY_FORMAT: &str = "%Y-%m-%d";
const DENSE_SUFFIX: &str = ".bin";
const THIN_SUFFIX: &str = ".thin.bin";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DayFiles {
    pub dense: Option<PathBuf>,
    pub thin: Option<PathBuf>,
}

impl DayFiles {
    /// The file a reader should use for this day: thinned wins over dense.
    pub fn preferred(&self) -> Option<&Path> {
        self.thin.as_deref().or(self.dense.as_deref())
    }
}

enum Kind {
    Dense,
    Thin,
}

fn parse_name(name: &str) -> Option<(NaiveDate, Kind)> {
    let (stem, kind) = if let Some(stem) = name.strip_suffix(THIN_SUFFIX) {
        (stem, Kind::Thin)
    } else {
        (name.strip_suffix(DENSE_SUFFIX)?, Kind::Dense)
    };
    let day = NaiveDate::parse_from_str(stem, DAY_FORMAT).ok()?;
    Some((day, kind))
}

#[derive(Debug, Clone)]
pub struct DailyFiles {
    dir: PathBuf,
}

impl DailyFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the storage directory. An already existing directory is fine,
    /// anything else is fatal for the caller.
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        match fs::create_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && self.dir.is_dir() => Ok(()),
            Err(source) => Err(StoreError::CreateDir {
                path: self.dir.clone(),
                source,
            }),
        }
    }

    pub fn dense_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}{}", day.format(DAY_FORMAT), DENSE_SUFFIX))
    }

    pub fn thin_path(&self, day: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}{}", day.format(DAY_FORMAT), THIN_SUFFIX))
    }

    /// Appends one record to the dense file of the sample's UTC day.
    pub fn append(&self, sample: &Sample) -> Result<(), StoreError> {
        self.append_day(sample.timestamp.date_naive(), std::slice::from_ref(sample))
    }

    /// Appends many samples, opening each day's file once.
    /// Samples are expected in chronological order.
    pub fn append_batch(&self, samples: &[Sample]) -> Result<usize, StoreError> {
        let mut written = 0;
        for run in samples.chunk_by(|a, b| a.timestamp.date_naive() == b.timestamp.date_naive()) {
            self.append_day(run[0].timestamp.date_naive(), run)?;
            written += run.len();
        }
        Ok(written)
    }

    fn append_day(&self, day: NaiveDate, samples: &[Sample]) -> Result<(), StoreError> {
        let path = self.dense_path(day);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(file_error("opening", &path))?;
        if let [sample] = samples {
            // a single write per record so readers never see half of it
            file.write_all(&codec::encode(sample))
                .map_err(file_error("appending to", &path))?;
        } else {
            let mut buffer = Vec::with_capacity(samples.len() * RECORD_SIZE);
            for sample in samples {
                buffer.extend_from_slice(&codec::encode(sample));
            }
            file.write_all(&buffer)
                .map_err(file_error("appending to", &path))?;
        }
        file.flush().map_err(file_error("flushing", &path))?;
        Ok(())
    }

    /// Inventory of the directory, one entry per calendar day.
    pub fn days(&self) -> Result<BTreeMap<NaiveDate, DayFiles>, StoreError> {
        let mut days: BTreeMap<NaiveDate, DayFiles> = BTreeMap::new();
        let entries = fs::read_dir(&self.dir).map_err(file_error("listing", &self.dir))?;
        for entry in entries {
            let entry = entry.map_err(file_error("listing", &self.dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_name(name) {
                Some((day, Kind::Dense)) => days.entry(day).or_default().dense = Some(entry.path()),
                Some((day, Kind::Thin)) => days.entry(day).or_default().thin = Some(entry.path()),
                None => warn!("Skipping foreign file {name} in {}", self.dir.display()),
            }
        }
        Ok(days)
    }

    /// Reads every complete record of a file. A torn trailing record is dropped.
    pub fn read_file(path: &Path) -> Result<Vec<Sample>, StoreError> {
        let bytes = fs::read(path).map_err(file_error("reading", path))?;
        let (samples, leftover) = codec::decode_all(&bytes)?;
        if leftover > 0 {
            warn!(
                "{} ends with a partial record ({leftover} bytes), ignoring it",
                path.display()
            );
        }
        Ok(samples)
    }

    /// Loads every day, preferring the thinned file when both variants exist.
    /// Samples come back day by day, chronological within each day.
    pub fn load_all(&self) -> Result<Vec<Sample>, StoreError> {
        let mut samples = Vec::new();
        for (day, files) in self.days()? {
            if files.thin.is_some() && files.dense.is_some() {
                debug!("{day}: both dense and thinned files present, using the thinned one");
            }
            if let Some(path) = files.preferred() {
                let mut loaded = Self::read_file(path)?;
                debug!("Loaded {} samples from {}", loaded.len(), path.display());
                samples.append(&mut loaded);
            }
        }
        info!(
            "Loaded {} samples from {}",
            samples.len(),
            self.dir.display()
        );
        Ok(samples)
    }
}
