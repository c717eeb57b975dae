use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use super::{CheckpointErr, CheckpointRecord, read_record, verify_record, write_record};
use crate::config::CheckpointConfig;

/// Saves and restores one checkpoint file per epoch, `<model>.<epoch>.ckp`.
///
/// Files are written next to their final path and renamed once complete, so a
/// reader never observes a partially written record.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    model_name: String,
    keep_checkpoint_files: bool,
}

impl CheckpointManager {
    /// Creates a new `CheckpointManager`.
    ///
    /// # Arguments
    /// * `dir` - The directory holding the checkpoints.
    /// * `model_name` - The file name prefix.
    /// * `keep_checkpoint_files` - Keeps every epoch's file instead of only the latest.
    ///
    /// # Returns
    /// A new `CheckpointManager` instance.
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>, keep_checkpoint_files: bool) -> Self {
        Self {
            dir: dir.into(),
            model_name: model_name.into(),
            keep_checkpoint_files,
        }
    }

    /// Returns `None` if checkpointing isn't configured.
    pub fn from_config(config: &CheckpointConfig) -> Option<Self> {
        let dir = config.dir.as_ref()?;
        Some(Self::new(
            dir,
            &config.model_name,
            config.keep_checkpoint_files,
        ))
    }

    /// Returns the path of `epoch`'s checkpoint.
    pub fn path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{}.{epoch}.ckp", self.model_name))
    }

    fn epoch_of(&self, path: &Path) -> Option<usize> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(&self.model_name)?.strip_prefix('.')?;
        rest.strip_suffix(".ckp")?.parse().ok()
    }

    /// Atomically writes `record` as `epoch`'s checkpoint.
    ///
    /// Unless every file is kept, the previous epoch's checkpoint is removed
    /// afterwards.
    pub fn save(&self, epoch: usize, record: &CheckpointRecord) -> Result<(), CheckpointErr> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path(epoch);
        let tmp = path.with_extension("ckp.tmp");

        let mut w = BufWriter::new(File::create(&tmp)?);
        write_record(&mut w, record)?;
        w.flush()?;
        w.into_inner()
            .map_err(|e| CheckpointErr::Io(e.into_error()))?
            .sync_all()?;
        fs::rename(&tmp, &path)?;

        info!(epoch = epoch; "saved checkpoint {}", path.display());

        if !self.keep_checkpoint_files && epoch > 0 {
            let previous = self.path(epoch - 1);
            match fs::remove_file(&previous) {
                Ok(()) => debug!("removed checkpoint {}", previous.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove checkpoint {}: {e}", previous.display()),
            }
        }

        Ok(())
    }

    /// Loads `epoch`'s checkpoint.
    ///
    /// # Returns
    /// `None` if there is no checkpoint for `epoch`, an error if there is one
    /// but it can't be read.
    pub fn try_load(&self, epoch: usize) -> Result<Option<CheckpointRecord>, CheckpointErr> {
        let path = self.path(epoch);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = read_record(&mut BufReader::new(file))?;
        if record.epoch != epoch {
            return Err(CheckpointErr::Corrupt(format!(
                "{} holds epoch {}",
                path.display(),
                record.epoch
            )));
        }

        Ok(Some(record))
    }

    /// Returns the epochs holding a checkpoint file, latest first.
    fn saved_epochs(&self) -> Vec<usize> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut epochs: Vec<usize> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| self.epoch_of(&e.path()))
            .collect();

        epochs.sort_unstable_by(|a, b| b.cmp(a));
        epochs
    }

    /// Loads the latest checkpoint that reads back completely, skipping broken ones.
    pub fn load_latest(&self) -> Option<CheckpointRecord> {
        self.load_latest_before(usize::MAX)
    }

    /// Loads the latest readable checkpoint older than `epoch`.
    pub fn load_latest_before(&self, epoch: usize) -> Option<CheckpointRecord> {
        for e in self.saved_epochs().into_iter().filter(|&e| e < epoch) {
            match self.try_load(e) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => {}
                Err(err) => warn!(epoch = e; "skipping unreadable checkpoint: {err}"),
            }
        }

        None
    }

    /// Returns the highest epoch whose checkpoint is completely written, `None` for a cold start.
    ///
    /// Only the framing and the checksum of every candidate are checked, none is decoded.
    pub fn determine_start_epoch(&self) -> Option<usize> {
        self.saved_epochs().into_iter().find(|&epoch| {
            let checked = File::open(self.path(epoch))
                .map_err(CheckpointErr::from)
                .and_then(|file| verify_record(&mut BufReader::new(file)));

            match checked {
                Ok(_) => true,
                Err(err) => {
                    warn!(epoch = epoch; "skipping unreadable checkpoint: {err}");
                    false
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: usize) -> CheckpointRecord {
        CheckpointRecord {
            epoch,
            learn_rate_per_sample: 0.01 / (epoch + 1) as f64,
            parameters: vec![vec![epoch as f32; 4]],
            smoothed_gradients: vec![vec![0.5; 4]],
            smoothed_counts: vec![epoch as f64],
            ..Default::default()
        }
    }

    #[test]
    fn save_then_load_returns_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "model", true);

        manager.save(3, &record(3)).unwrap();
        assert_eq!(manager.try_load(3).unwrap(), Some(record(3)));
        assert_eq!(manager.try_load(2).unwrap(), None);
        assert!(!manager.path(3).with_extension("ckp.tmp").exists());
    }

    #[test]
    fn start_epoch_is_the_latest_valid_one() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "model", true);
        assert_eq!(manager.determine_start_epoch(), None);

        manager.save(0, &record(0)).unwrap();
        manager.save(1, &record(1)).unwrap();
        manager.save(2, &record(2)).unwrap();

        // a crash halfway through epoch 2's write
        let bytes = fs::read(manager.path(2)).unwrap();
        fs::write(manager.path(2), &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(manager.try_load(2), Err(CheckpointErr::Truncated)));
        assert_eq!(manager.determine_start_epoch(), Some(1));
        assert_eq!(manager.load_latest(), Some(record(1)));
        assert_eq!(manager.load_latest_before(1), Some(record(0)));
    }

    #[test]
    fn start_epoch_skips_checkpoints_failing_the_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "model", true);

        manager.save(0, &record(0)).unwrap();
        manager.save(1, &record(1)).unwrap();

        // flip the last payload byte, right before the checksum and the end marker
        let mut bytes = fs::read(manager.path(1)).unwrap();
        let at = bytes.len() - 13;
        bytes[at] ^= 0x40;
        fs::write(manager.path(1), &bytes).unwrap();

        assert_eq!(manager.determine_start_epoch(), Some(0));
        assert_eq!(manager.load_latest(), Some(record(0)));
    }

    #[test]
    fn older_checkpoints_are_pruned_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "model", false);

        manager.save(0, &record(0)).unwrap();
        manager.save(1, &record(1)).unwrap();

        assert!(!manager.path(0).exists());
        assert!(manager.path(1).exists());
    }

    #[test]
    fn other_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path(), "model", true);

        fs::write(dir.path().join("model.7.ckp.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("other.9.ckp"), b"foreign").unwrap();
        manager.save(4, &record(4)).unwrap();

        assert_eq!(manager.determine_start_epoch(), Some(4));
    }
}
