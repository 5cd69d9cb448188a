use crate::error::PulseError;
use crate::store::{MemoryDocumentStore, StoreImage};
use crate::telemetry::db_metrics;
use crate::types::Timestamp;
use crc32fast::Hasher as Crc32;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

const SNAP_MAGIC: &[u8; 8] = b"PLSSNP01";
const SNAP_VERSION: u32 = 1;

/// Handles snapshot operations
#[derive(Debug)]
pub struct Snapshotter {
    snapshot_dir: PathBuf,
}

impl Snapshotter {
    /// Creates a new Snapshotter instance
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self, PulseError> {
        let dir_path = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir_path)?;

        Ok(Snapshotter {
            snapshot_dir: dir_path,
        })
    }

    /// Writes the full contents of `store` to `snapshot_{timestamp}.bin`.
    pub fn create_snapshot(
        &self,
        store: &MemoryDocumentStore,
        timestamp: Timestamp,
    ) -> Result<PathBuf, PulseError> {
        let started = Instant::now();
        let payload = bincode::serialize(&store.image()?)?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        // Atomic install: write to temp, fsync, rename, fsync dir.
        let final_path = self.snapshot_dir.join(format!("snapshot_{}.bin", timestamp));
        let tmp_path = self.snapshot_dir.join(format!(".tmp_snapshot_{}.bin", timestamp));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SNAP_MAGIC)?;
        w.write_all(&SNAP_VERSION.to_le_bytes())?;
        w.write_all(&timestamp.to_le_bytes())?;
        w.write_all(&(payload.len() as u64).to_le_bytes())?;
        w.write_all(&crc.to_le_bytes())?;
        w.write_all(&payload)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.snapshot_dir)?;
        tracing::debug!(path = %final_path.display(), bytes = payload.len(), "snapshot installed");
        db_metrics::record_snapshot(started.elapsed(), payload.len() as u64);
        Ok(final_path)
    }

    /// Loads the newest snapshot, if any.
    pub fn load_latest_snapshot(&self) -> Result<Option<MemoryDocumentStore>, PulseError> {
        let mut snaps = list_snapshots(&self.snapshot_dir)?;
        snaps.sort_by(|a, b| b.0.cmp(&a.0));

        let Some((_, latest_path)) = snaps.first() else {
            return Ok(None);
        };
        let image = read_snapshot(latest_path)?;
        Ok(Some(MemoryDocumentStore::from_image(image)))
    }

    /// Timestamp of the newest snapshot, if any.
    pub fn latest_snapshot_timestamp(&self) -> Result<Option<Timestamp>, PulseError> {
        Ok(list_snapshots(&self.snapshot_dir)?
            .into_iter()
            .map(|(ts, _)| ts)
            .max())
    }
}

fn read_snapshot(path: &Path) -> Result<StoreImage, PulseError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SNAP_MAGIC {
        return Err(PulseError::Corruption(format!(
            "snapshot {:?} has an invalid header",
            path
        )));
    }

    let mut b4 = [0u8; 4];
    let mut b8 = [0u8; 8];
    reader.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != SNAP_VERSION {
        return Err(PulseError::Corruption(format!(
            "snapshot {:?} has unsupported version {}",
            path, version
        )));
    }
    reader.read_exact(&mut b8)?; // timestamp, already known from the file name
    reader.read_exact(&mut b8)?;
    let len = u64::from_le_bytes(b8) as usize;
    reader.read_exact(&mut b4)?;
    let expected_crc = u32::from_le_bytes(b4);

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut hasher = Crc32::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Err(PulseError::Corruption(format!(
            "snapshot {:?} checksum mismatch",
            path
        )));
    }
    Ok(bincode::deserialize(&payload)?)
}

fn list_snapshots(dir: &Path) -> Result<Vec<(Timestamp, PathBuf)>, PulseError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(ts) = name
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".bin"))
            .and_then(|s| s.parse::<Timestamp>().ok())
        else {
            continue;
        };
        out.push((ts, entry.path()));
    }
    Ok(out)
}

fn sync_dir(dir: &Path) -> Result<(), PulseError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}
