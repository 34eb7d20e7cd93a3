use super::daily::DailyFiles;
use super::{codec, file_error, StoreError};
use crate::{Sample, Timestamp};
use chrono::NaiveDate;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::{debug, error, info};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ThinReport {
    pub thinned: usize, // days rewritten
    pub kept: usize,    // records written to thinned files
    pub dropped: usize, // records discarded
    pub failed: usize,  // days left dense because of an error
}

/// A day may be thinned once it is more than `after_days` calendar days old.
pub fn eligible(day: NaiveDate, today: NaiveDate, after_days: i64) -> bool {
    (today - day).num_days() > after_days
}

fn write_whole(path: &Path, samples: &[Sample]) -> Result<(), StoreError> {
    let mut buffer = Vec::with_capacity(samples.len() * codec::RECORD_SIZE);
    for sample in samples {
        buffer.extend_from_slice(&codec::encode(sample));
    }
    let mut file = File::create(path).map_err(file_error("creating", path))?;
    file.write_all(&buffer).map_err(file_error("writing", path))?;
    file.sync_all().map_err(file_error("syncing", path))?;
    Ok(())
}

/// Rewrites one day's dense file keeping only on-the-minute records.
/// Returns `None` when there is no dense file left for that day.
/// The dense file is removed only after the thinned file is durably in place.
pub fn thin_day(files: &DailyFiles, day: NaiveDate) -> Result<Option<(usize, usize)>, StoreError> {
    let dense = files.dense_path(day);
    if !dense.exists() {
        return Ok(None);
    }
    let samples = DailyFiles::read_file(&dense)?;
    let total = samples.len();
    let kept: Vec<Sample> = samples.into_iter().filter(Sample::on_the_minute).collect();

    let thin = files.thin_path(day);
    let mut tmp = thin.clone().into_os_string();
    tmp.push(TMP_SUFFIX);
    let tmp = Path::new(&tmp);
    if let Err(e) = write_whole(tmp, &kept) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    fs::rename(tmp, &thin).map_err(file_error("renaming", tmp))?;
    fs::remove_file(&dense).map_err(file_error("removing", &dense))?;
    Ok(Some((kept.len(), total - kept.len())))
}

/// Thins every eligible day. Per-day failures are logged and counted;
/// the affected dense files stay for the next pass.
pub fn thin_pass(
    files: &DailyFiles,
    now: Timestamp,
    after_days: i64,
) -> Result<ThinReport, StoreError> {
    let today = now.date_naive();
    let mut report = ThinReport::default();
    for (day, day_files) in files.days()? {
        if day_files.dense.is_none() || !eligible(day, today, after_days) {
            continue;
        }
        match thin_day(files, day) {
            Ok(Some((kept, dropped))) => {
                debug!("{day}: kept {kept} records, dropped {dropped}");
                report.thinned += 1;
                report.kept += kept;
                report.dropped += dropped;
            }
            Ok(None) => (),
            Err(e) => {
                error!("{day}: thinning failed, dense file kept: {e}");
                report.failed += 1;
            }
        }
    }
    if report.thinned > 0 || report.failed > 0 {
        info!(
            "Thinning pass: {} days thinned, {} records kept, {} dropped, {} failed",
            report.thinned, report.kept, report.dropped, report.failed
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, sample};
    use anyhow::Result;
    use chrono::Duration;
    use tempfile::TempDir;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn dense_day(files: &DailyFiles) -> Result<()> {
        let start = at("2024-01-01T10:00:00Z");
        let samples: Vec<Sample> = (0..180)
            .map(|i| sample(start + Duration::seconds(i), 600.0 + i as f32))
            .collect();
        files.append_batch(&samples)?;
        Ok(())
    }

    #[test]
    fn test_eligibility() {
        let today = day("2024-01-10");
        assert!(!eligible(day("2024-01-03"), today, 7));
        assert!(eligible(day("2024-01-02"), today, 7));
        assert!(!eligible(today, today, 7));
    }

    #[test]
    fn test_thin_keeps_minutes_and_removes_dense() -> Result<()> {
        let tmp = TempDir::new()?;
        let files = DailyFiles::new(tmp.path());
        files.ensure_dir()?;
        dense_day(&files)?;

        let report = thin_pass(&files, at("2024-01-09T00:00:00Z"), 7)?;
        assert_eq!(
            report,
            ThinReport {
                thinned: 1,
                kept: 3,
                dropped: 177,
                failed: 0
            }
        );
        let d = day("2024-01-01");
        assert!(!files.dense_path(d).exists());
        let thinned = DailyFiles::read_file(&files.thin_path(d))?;
        assert_eq!(
            thinned.iter().map(|s| s.co2).collect::<Vec<_>>(),
            vec![600.0, 660.0, 720.0]
        );
        Ok(())
    }

    #[test]
    fn test_thin_is_idempotent() -> Result<()> {
        let tmp = TempDir::new()?;
        let files = DailyFiles::new(tmp.path());
        files.ensure_dir()?;
        dense_day(&files)?;
        let now = at("2024-01-20T00:00:00Z");

        thin_pass(&files, now, 7)?;
        let d = day("2024-01-01");
        let first = fs::read(files.thin_path(d))?;
        let report = thin_pass(&files, now, 7)?;
        assert_eq!(report, ThinReport::default());
        assert_eq!(fs::read(files.thin_path(d))?, first);
        assert!(!files.dense_path(d).exists());
        assert_eq!(thin_day(&files, d)?, None);
        Ok(())
    }

    #[test]
    fn test_recent_days_untouched() -> Result<()> {
        let tmp = TempDir::new()?;
        let files = DailyFiles::new(tmp.path());
        files.ensure_dir()?;
        dense_day(&files)?;
        let report = thin_pass(&files, at("2024-01-08T23:59:59Z"), 7)?;
        assert_eq!(report.thinned, 0);
        assert!(files.dense_path(day("2024-01-01")).exists());
        Ok(())
    }

    #[test]
    fn test_leftover_dense_after_crash_is_healed() -> Result<()> {
        let tmp = TempDir::new()?;
        let files = DailyFiles::new(tmp.path());
        files.ensure_dir()?;
        dense_day(&files)?;
        let d = day("2024-01-01");
        let dense_copy = fs::read(files.dense_path(d))?;
        thin_pass(&files, at("2024-01-20T00:00:00Z"), 7)?;
        let first = fs::read(files.thin_path(d))?;
        // the dense file came back, as if the delete never happened
        fs::write(files.dense_path(d), &dense_copy)?;

        let report = thin_pass(&files, at("2024-01-20T00:00:00Z"), 7)?;
        assert_eq!(report.thinned, 1);
        assert_eq!(fs::read(files.thin_path(d))?, first);
        assert!(!files.dense_path(d).exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_write_keeps_dense() -> Result<()> {
        let tmp = TempDir::new()?;
        let files = DailyFiles::new(tmp.path());
        files.ensure_dir()?;
        dense_day(&files)?;
        let d = day("2024-01-01");
        // a directory squatting on the temporary name makes the write fail
        let mut squatter = files.thin_path(d).into_os_string();
        squatter.push(TMP_SUFFIX);
        fs::create_dir(&squatter)?;

        let report = thin_pass(&files, at("2024-01-20T00:00:00Z"), 7)?;
        assert_eq!(report.failed, 1);
        assert!(files.dense_path(d).exists());
        assert!(!files.thin_path(d).exists());
        Ok(())
    }
}
