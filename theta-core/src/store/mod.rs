//! Parquet partition store.
//!
//! Layout: `{root}/symbol={SYMBOL}/kind={KIND}/date={YYYYMMDD}/{exp=YYYYMMDD|underlying}.parquet`
//!
//! Every partition file has a `.meta.json` sidecar holding its blake3 hash,
//! byte size, row count and work unit. A partition is only visible once both
//! have been renamed into place; the data file is written to
//! `.parquet.tmp` first and fsynced. A data file without a readable sidecar
//! is treated as absent.
//!
//! A rewrite publishes the new sidecar before the new data file, keeping the
//! digest of the file it replaces under `superseded`. If the process dies
//! between the two renames, the old file still matches its sidecar.

pub mod frame;

use crate::calendar::{format_terminal_date, parse_terminal_date};
use crate::domain::{DataKind, PartitionData, WorkUnit};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const DATA_EXT: &str = "parquet";
const TMP_EXT: &str = "parquet.tmp";
const QUARANTINE_EXT: &str = "parquet.quarantined";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to write partition {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("corrupt partition {path}: {reason}")]
    CorruptExisting { path: PathBuf, reason: String },

    #[error("partition not found: {0}")]
    NotFound(PathBuf),
}

impl PersistError {
    pub fn path(&self) -> &Path {
        match self {
            Self::WriteFailed { path, .. }
            | Self::CorruptExisting { path, .. }
            | Self::NotFound(path) => path,
        }
    }
}

/// Size, hash and row count of one generation of a partition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub row_count: usize,
    pub file_size: u64,
    pub blake3: String,
}

/// Sidecar written next to every partition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub unit: WorkUnit,
    pub row_count: usize,
    pub file_size: u64,
    pub blake3: String,
    pub written_at: DateTime<Utc>,
    /// The file this sidecar's data is replacing, while a rewrite is in
    /// progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded: Option<FileDigest>,
}

impl PartitionMeta {
    fn digest(&self) -> FileDigest {
        FileDigest {
            row_count: self.row_count,
            file_size: self.file_size,
            blake3: self.blake3.clone(),
        }
    }

    /// The generation a file of `size` bytes belongs to, as a settled
    /// sidecar. `None` when neither generation has that size.
    fn generation_with_size(&self, size: u64) -> Option<PartitionMeta> {
        if self.file_size == size {
            return Some(PartitionMeta {
                superseded: None,
                ..self.clone()
            });
        }
        self.superseded
            .as_ref()
            .filter(|old| old.file_size == size)
            .map(|old| self.settled_as(old))
    }

    /// Whether `hash` names the current or the superseded generation.
    fn accepts_hash(&self, hash: &str) -> bool {
        self.blake3 == hash || self.superseded.as_ref().is_some_and(|old| old.blake3 == hash)
    }

    fn settled_as(&self, digest: &FileDigest) -> PartitionMeta {
        PartitionMeta {
            unit: self.unit.clone(),
            row_count: digest.row_count,
            file_size: digest.file_size,
            blake3: digest.blake3.clone(),
            written_at: self.written_at,
            superseded: None,
        }
    }
}

/// Result of the cheap existence check used to skip completed units.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionCheck {
    Missing,
    Valid(PartitionMeta),
    Invalid(String),
}

impl PartitionCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Per (symbol, kind) inventory line for `status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStatus {
    pub symbol: String,
    pub kind: String,
    pub partitions: usize,
    pub rows: usize,
    pub invalid: usize,
    pub quarantined: usize,
}

/// Sidecar path for a partition file.
pub fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension(TMP_EXT)
}

fn write_failed(path: &Path, reason: impl std::fmt::Display) -> PersistError {
    PersistError::WriteFailed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> PersistError {
    PersistError::CorruptExisting {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// The partition store rooted at one directory.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic file path for a unit.
    pub fn partition_path(&self, unit: &WorkUnit) -> PathBuf {
        let dir = self
            .root
            .join(format!("symbol={}", unit.symbol()))
            .join(format!("kind={}", unit.kind()))
            .join(format!("date={}", format_terminal_date(unit.trade_date())));
        let file = match unit.expiration() {
            Some(exp) => format!("exp={}.{DATA_EXT}", format_terminal_date(exp)),
            None => format!("underlying.{DATA_EXT}"),
        };
        dir.join(file)
    }

    /// Cheap check: the sidecar parses, names this unit, records rows, and
    /// the data file has the recorded size. Does not read the Parquet body.
    pub fn check(&self, unit: &WorkUnit) -> PartitionCheck {
        let path = self.partition_path(unit);
        let Ok(file_meta) = fs::metadata(&path) else {
            return PartitionCheck::Missing;
        };
        let meta = match read_meta(&path) {
            Ok(meta) => meta,
            Err(e) => return PartitionCheck::Invalid(e),
        };
        if &meta.unit != unit {
            return PartitionCheck::Invalid(format!("sidecar names {}", meta.unit));
        }
        let Some(meta) = meta.generation_with_size(file_meta.len()) else {
            return PartitionCheck::Invalid(format!(
                "size {} does not match sidecar {}",
                file_meta.len(),
                meta.file_size
            ));
        };
        if meta.row_count == 0 {
            return PartitionCheck::Invalid("sidecar records zero rows".into());
        }
        PartitionCheck::Valid(meta)
    }

    /// Persist a partition at its deterministic path.
    pub fn write(&self, data: &PartitionData) -> Result<PartitionMeta, PersistError> {
        Self::write_to(&self.partition_path(&data.unit), data)
    }

    /// Persist a partition at `path`.
    ///
    /// Order: data to a temp file and fsync, sidecar naming both the new and
    /// the replaced file, data rename, then the settled sidecar.
    pub fn write_to(path: &Path, data: &PartitionData) -> Result<PartitionMeta, PersistError> {
        let staged = Self::stage(path, data)?;
        Self::commit(path, staged)
    }

    /// Write the temp data file and publish a sidecar that still accepts the
    /// file currently in place.
    fn stage(path: &Path, data: &PartitionData) -> Result<PartitionMeta, PersistError> {
        if data.is_empty() {
            return Err(write_failed(path, "no rows to persist"));
        }
        if data.rows.kind() != data.unit.kind() {
            return Err(write_failed(
                path,
                format!("{} rows for a {} unit", data.rows.kind(), data.unit.kind()),
            ));
        }
        data.check_ordering().map_err(|e| write_failed(path, e))?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| write_failed(path, format!("create dir: {e}")))?;
        }

        let mut df = frame::to_dataframe(&data.rows)
            .map_err(|e| write_failed(path, format!("dataframe creation: {e}")))?;
        let tmp = tmp_path(path);
        if let Err(reason) = write_parquet(&mut df, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(write_failed(path, reason));
        }

        let bytes = fs::read(&tmp).map_err(|e| write_failed(path, format!("re-read: {e}")))?;
        let meta = PartitionMeta {
            unit: data.unit.clone(),
            row_count: data.len(),
            file_size: bytes.len() as u64,
            blake3: blake3::hash(&bytes).to_hex().to_string(),
            written_at: Utc::now(),
            superseded: current_digest(path),
        };
        if meta.superseded.is_some() {
            if let Err(reason) = write_meta(path, &meta) {
                let _ = fs::remove_file(&tmp);
                return Err(write_failed(path, reason));
            }
        }
        Ok(meta)
    }

    fn commit(path: &Path, staged: PartitionMeta) -> Result<PartitionMeta, PersistError> {
        let tmp = tmp_path(path);
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(write_failed(path, format!("atomic rename failed: {e}")));
        }
        let meta = PartitionMeta {
            superseded: None,
            ..staged
        };
        write_meta(path, &meta).map_err(|e| write_failed(path, e))?;
        tracing::debug!(path = %path.display(), rows = meta.row_count, "partition written");
        Ok(meta)
    }

    pub fn read(&self, unit: &WorkUnit) -> Result<PartitionData, PersistError> {
        let data = Self::read_path(&self.partition_path(unit))?;
        if &data.unit != unit {
            return Err(corrupt(
                &self.partition_path(unit),
                format!("holds {}", data.unit),
            ));
        }
        Ok(data)
    }

    /// Full read with validation: hash matches the sidecar (when present),
    /// schema matches the kind, rows exist and are ordered.
    pub fn read_path(path: &Path) -> Result<PartitionData, PersistError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PersistError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(corrupt(path, format!("read: {e}"))),
        };

        let unit = match read_meta(path) {
            Ok(meta) => {
                let hash = blake3::hash(&bytes).to_hex().to_string();
                if !meta.accepts_hash(&hash) {
                    return Err(corrupt(path, "content hash does not match sidecar"));
                }
                meta.unit
            }
            Err(_) => unit_from_path(path)
                .ok_or_else(|| corrupt(path, "no sidecar and unrecognised path"))?,
        };

        let df = ParquetReader::new(io::Cursor::new(bytes))
            .finish()
            .map_err(|e| corrupt(path, format!("read parquet: {e}")))?;
        if df.height() == 0 {
            return Err(corrupt(path, "empty parquet file"));
        }
        let rows = frame::from_dataframe(&df, unit.kind()).map_err(|e| corrupt(path, e))?;
        let data = PartitionData::new(unit, rows);
        data.check_ordering().map_err(|e| corrupt(path, e))?;
        Ok(data)
    }

    /// Move a corrupt file (and its sidecar) aside so it is never read again.
    pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
        let target = path.with_extension(QUARANTINE_EXT);
        fs::rename(path, &target)?;
        let _ = fs::remove_file(meta_path(path));
        tracing::warn!(
            path = %path.display(),
            quarantined = %target.display(),
            "quarantined corrupt partition"
        );
        Ok(target)
    }

    /// Remove temp files left by interrupted writes. Returns how many.
    pub fn sweep_temp_files(&self) -> io::Result<usize> {
        let mut removed = 0;
        for path in walk(&self.root)? {
            if has_suffix(&path, TMP_EXT) {
                fs::remove_file(&path)?;
                tracing::info!(path = %path.display(), "removed stale temp file");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// All partition data files under `dir`, sorted.
    pub fn list_partitions(dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = walk(dir)?
            .into_iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(DATA_EXT))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Inventory per (symbol, kind) from sidecars.
    pub fn status(&self) -> io::Result<Vec<StoreStatus>> {
        let mut by_key: BTreeMap<(String, String), StoreStatus> = BTreeMap::new();
        for path in walk(&self.root)? {
            let quarantined = has_suffix(&path, QUARANTINE_EXT);
            let data = path.extension().and_then(|e| e.to_str()) == Some(DATA_EXT);
            if !quarantined && !data {
                continue;
            }
            let Some(unit) = unit_from_path(&path) else {
                continue;
            };
            let entry = by_key
                .entry((unit.symbol().to_string(), unit.kind().to_string()))
                .or_insert_with(|| StoreStatus {
                    symbol: unit.symbol().to_string(),
                    kind: unit.kind().to_string(),
                    ..StoreStatus::default()
                });
            if quarantined {
                entry.quarantined += 1;
                continue;
            }
            match self.check(&unit) {
                PartitionCheck::Valid(meta) => {
                    entry.partitions += 1;
                    entry.rows += meta.row_count;
                }
                _ => entry.invalid += 1,
            }
        }
        Ok(by_key.into_values().collect())
    }
}

/// Recover a unit from a store path. Works for data, temp and quarantined
/// file names.
pub fn unit_from_path(path: &Path) -> Option<WorkUnit> {
    let parts: Vec<&str> = path
        .iter()
        .rev()
        .take(4)
        .map(|c| c.to_str())
        .collect::<Option<_>>()?;
    let [file, date, kind, symbol] = parts.as_slice() else {
        return None;
    };
    let symbol = symbol.strip_prefix("symbol=")?;
    let kind: DataKind = kind.strip_prefix("kind=")?.parse().ok()?;
    let date = parse_terminal_date(date.strip_prefix("date=")?).ok()?;
    let stem = file.split('.').next()?;
    if stem == "underlying" {
        return (!kind.is_option()).then(|| WorkUnit::underlying(symbol, date));
    }
    let exp = parse_terminal_date(stem.strip_prefix("exp=")?).ok()?;
    WorkUnit::option(symbol, date, exp, kind)
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(&format!(".{suffix}")))
}

fn walk(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), String> {
    let file = fs::File::create(path).map_err(|e| format!("create file: {e}"))?;
    ParquetWriter::new(&file)
        .finish(df)
        .map_err(|e| format!("write parquet: {e}"))?;
    file.sync_all().map_err(|e| format!("fsync: {e}"))
}

/// Digest of the data file now at `path`, if its sidecar vouches for it.
fn current_digest(path: &Path) -> Option<FileDigest> {
    let size = fs::metadata(path).ok()?.len();
    read_meta(path)
        .ok()?
        .generation_with_size(size)
        .map(|meta| meta.digest())
}

fn read_meta(path: &Path) -> Result<PartitionMeta, String> {
    let content =
        fs::read_to_string(meta_path(path)).map_err(|e| format!("sidecar unreadable: {e}"))?;
    serde_json::from_str(&content).map_err(|e| format!("sidecar malformed: {e}"))
}

fn write_meta(path: &Path, meta: &PartitionMeta) -> Result<(), String> {
    let target = meta_path(path);
    let tmp = target.with_extension("json.tmp");
    let json =
        serde_json::to_string_pretty(meta).map_err(|e| format!("meta serialization: {e}"))?;
    let mut file = fs::File::create(&tmp).map_err(|e| format!("meta create: {e}"))?;
    file.write_all(json.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| format!("meta write: {e}"))?;
    fs::rename(&tmp, &target).map_err(|e| format!("meta rename: {e}"))
}
