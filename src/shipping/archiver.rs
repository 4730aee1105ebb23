//! Archiver: turns a batch into an artifact staged on local disk.
//!
//! Archive mode writes one `<timestamp>-<uuid>.tar.gz` per batch.
//! Individual mode writes one placeholder file per batch member into a
//! per-batch directory instead of compressing.

use crate::error::PackagingError;
use crate::shipping::channel::Batch;
use chrono::{DateTime, Local};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Timestamp format for archive names
const ARCHIVE_STAMP: &str = "%Y-%m-%d-%H-%M-%S";

/// Date stamp prefix for individually staged objects
const OBJECT_STAMP: &str = "%Y-%m-%d-%s";

type Result<T> = std::result::Result<T, PackagingError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// One compressed archive per batch
    #[default]
    Archive,
    /// One placeholder record per batch member
    Individual,
}

/// What goes into an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveScope {
    /// Exactly the batch's files, by base name
    #[default]
    Members,
    /// The whole snapshot root, regardless of which files changed
    SnapshotRoot,
}

/// Archiver configuration
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub mode: DeliveryMode,
    pub scope: ArchiveScope,
    /// Directory archived wholesale under [`ArchiveScope::SnapshotRoot`]
    pub snapshot_root: PathBuf,
    /// Where artifacts are written before delivery
    pub staging: PathBuf,
}

/// Local representation of a packaged batch.
#[derive(Debug, Clone)]
pub enum ArtifactPayload {
    Archive { path: PathBuf },
    Staged { dir: PathBuf, files: Vec<PathBuf> },
}

/// A packaged batch waiting for delivery.
#[derive(Debug, Clone)]
pub struct ArchiveArtifact {
    pub id: Uuid,
    pub created: DateTime<Local>,
    pub payload: ArtifactPayload,
}

impl ArchiveArtifact {
    /// Wrap an archive already on disk (e.g. left over from an earlier run).
    pub fn from_archive_path(path: PathBuf) -> Result<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PackagingError::InvalidName(path.display().to_string()))?;
        let name = ArtifactName::parse(file_name)?;
        let created = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());

        Ok(Self {
            id: name.id,
            created,
            payload: ArtifactPayload::Archive { path },
        })
    }

    /// Wrap a per-batch directory written by individual mode.
    pub fn from_staged_dir(dir: PathBuf) -> Result<Self> {
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| Uuid::parse_str(n).ok())
            .ok_or_else(|| PackagingError::InvalidName(dir.display().to_string()))?;

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let created = fs::metadata(&dir)
            .and_then(|m| m.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());

        Ok(Self {
            id,
            created,
            payload: ArtifactPayload::Staged { dir, files },
        })
    }

    /// Local files to upload, paired with their object names.
    pub fn objects(&self) -> Vec<(PathBuf, String)> {
        match &self.payload {
            ArtifactPayload::Archive { path } => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| archive_name(&self.created, &self.id));
                vec![(path.clone(), name)]
            }
            ArtifactPayload::Staged { files, .. } => files
                .iter()
                .map(|file| {
                    let base = file
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    (file.clone(), format!("{}/{}", self.id, base))
                })
                .collect(),
        }
    }

    /// Path reported in logs.
    pub fn local_path(&self) -> &Path {
        match &self.payload {
            ArtifactPayload::Archive { path } => path,
            ArtifactPayload::Staged { dir, .. } => dir,
        }
    }

    /// Remove the staged copy from local disk.
    pub fn remove_local(&self) -> io::Result<()> {
        match &self.payload {
            ArtifactPayload::Archive { path } => fs::remove_file(path),
            ArtifactPayload::Staged { dir, .. } => fs::remove_dir_all(dir),
        }
    }
}

/// Parsed `<stamp>-<uuid>.tar.gz` artifact name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub stamp: String,
    pub id: Uuid,
}

impl ArtifactName {
    const UUID_LEN: usize = 36;

    pub fn parse(file_name: &str) -> Result<Self> {
        let invalid = || PackagingError::InvalidName(file_name.to_string());

        let stem = file_name.strip_suffix(ARCHIVE_SUFFIX).ok_or_else(invalid)?;
        if stem.len() < Self::UUID_LEN + 2 || !stem.is_char_boundary(stem.len() - Self::UUID_LEN) {
            return Err(invalid());
        }
        let (head, uuid) = stem.split_at(stem.len() - Self::UUID_LEN);
        let stamp = head.strip_suffix('-').ok_or_else(invalid)?;
        let id = Uuid::parse_str(uuid).map_err(|_| invalid())?;

        Ok(Self {
            stamp: stamp.to_string(),
            id,
        })
    }
}

pub fn archive_name(created: &DateTime<Local>, id: &Uuid) -> String {
    format!("{}-{}{}", created.format(ARCHIVE_STAMP), id, ARCHIVE_SUFFIX)
}

/// `<date>-<unix-seconds>-<batch-uuid>-<base-name>`
pub fn object_name(created: &DateTime<Local>, id: &Uuid, base_name: &str) -> String {
    format!("{}-{}-{}", created.format(OBJECT_STAMP), id, base_name)
}

pub struct Archiver {
    config: ArchiverConfig,
}

impl Archiver {
    pub fn new(config: ArchiverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Package a batch into a staged artifact.
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn package(&self, batch: &Batch) -> Result<ArchiveArtifact> {
        let staging = &self.config.staging;
        fs::create_dir_all(staging).map_err(|source| PackagingError::StagingNotWritable {
            path: staging.clone(),
            source,
        })?;

        let created = Local::now();
        let payload = match self.config.mode {
            DeliveryMode::Archive => {
                ArtifactPayload::Archive {
                    path: self.write_archive(batch, &created)?,
                }
            }
            DeliveryMode::Individual => self.write_individual(batch, &created)?,
        };

        Ok(ArchiveArtifact {
            id: batch.id,
            created,
            payload,
        })
    }

    fn write_archive(&self, batch: &Batch, created: &DateTime<Local>) -> Result<PathBuf> {
        match self.config.scope {
            ArchiveScope::Members => {
                for path in &batch.paths {
                    if !path.is_file() {
                        return Err(PackagingError::SourceMissing(path.clone()));
                    }
                }
            }
            ArchiveScope::SnapshotRoot => {
                if !self.config.snapshot_root.is_dir() {
                    return Err(PackagingError::SourceMissing(
                        self.config.snapshot_root.clone(),
                    ));
                }
            }
        }

        let name = archive_name(created, &batch.id);
        let path = self.config.staging.join(&name);
        let file = self.create_new(&path)?;

        let top = name.trim_end_matches(ARCHIVE_SUFFIX);
        if let Err(e) = self.fill_archive(file, top, &batch.paths) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        Ok(path)
    }

    fn fill_archive(&self, file: File, top: &str, members: &[PathBuf]) -> Result<()> {
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut tar = tar::Builder::new(encoder);

        match self.config.scope {
            ArchiveScope::Members => {
                for path in members {
                    let base = path
                        .file_name()
                        .ok_or_else(|| PackagingError::SourceMissing(path.clone()))?;
                    tar.append_path_with_name(path, Path::new(top).join(base))?;
                }
            }
            ArchiveScope::SnapshotRoot => {
                // Staging may live inside the root; never archive it
                let skip = fs::canonicalize(&self.config.staging)?;
                append_tree(&mut tar, Path::new(top), &self.config.snapshot_root, &skip)?;
            }
        }

        let mut writer = tar.into_inner()?.finish()?;
        writer.flush()?;
        Ok(())
    }

    fn write_individual(&self, batch: &Batch, created: &DateTime<Local>) -> Result<ArtifactPayload> {
        let dir = self.config.staging.join(batch.id.to_string());
        fs::create_dir(&dir).map_err(|e| self.classify_create_error(&dir, e))?;

        // A partial directory would later be swept up as a complete batch
        match self.fill_individual(&dir, batch, created) {
            Ok(files) => Ok(ArtifactPayload::Staged { dir, files }),
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }

    fn fill_individual(
        &self,
        dir: &Path,
        batch: &Batch,
        created: &DateTime<Local>,
    ) -> Result<Vec<PathBuf>> {
        let mut files = Vec::with_capacity(batch.paths.len());
        for path in &batch.paths {
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| PackagingError::SourceMissing(path.clone()))?;
            let staged = dir.join(object_name(created, &batch.id, &base));

            let mut file = self.create_new(&staged)?;
            file.write_all(staged.to_string_lossy().as_bytes())?;
            files.push(staged);
        }

        Ok(files)
    }

    fn create_new(&self, path: &Path) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| self.classify_create_error(path, e))
    }

    fn classify_create_error(&self, path: &Path, e: io::Error) -> PackagingError {
        match e.kind() {
            io::ErrorKind::AlreadyExists => PackagingError::NameCollision(path.to_path_buf()),
            _ => PackagingError::StagingNotWritable {
                path: self.config.staging.clone(),
                source: e,
            },
        }
    }
}

/// Append `dir` recursively under `name`, leaving out `skip`.
fn append_tree<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &Path,
    dir: &Path,
    skip: &Path,
) -> io::Result<()> {
    tar.append_dir(name, dir)?;

    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if fs::canonicalize(&path).is_ok_and(|p| p == skip) {
            continue;
        }
        let member = name.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            append_tree(tar, &member, &path, skip)?;
        } else {
            tar.append_path_with_name(&path, &member)?;
        }
    }
    Ok(())
}

impl PackagingError {
    /// Errors that leave the staging area unusable for every later batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PackagingError::StagingNotWritable { .. } | PackagingError::NameCollision(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn archiver(tmp: &TempDir, mode: DeliveryMode, scope: ArchiveScope) -> Archiver {
        Archiver::new(ArchiverConfig {
            mode,
            scope,
            snapshot_root: tmp.path().join("snap"),
            staging: tmp.path().join("staging"),
        })
    }

    fn snapshot_dir(tmp: &TempDir) -> Vec<PathBuf> {
        let root = tmp.path().join("snap");
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("snapshot.meta"), "meta-bytes").unwrap();
        fs::write(root.join("snapshot.state"), vec![7u8; 4096]).unwrap();
        fs::write(root.join("nested/blob"), "inner").unwrap();
        vec![root.join("snapshot.meta"), root.join("snapshot.state")]
    }

    fn unpack(archive: &Path, into: &Path) {
        let file = File::open(archive).unwrap();
        tar::Archive::new(GzDecoder::new(file)).unpack(into).unwrap();
    }

    fn tree(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let rel = path.strip_prefix(root).unwrap().to_path_buf();
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        out
    }

    #[test]
    fn test_archive_name_roundtrip() {
        let created = Local::now();
        let id = Uuid::new_v4();
        let name = archive_name(&created, &id);

        let parsed = ArtifactName::parse(&name).unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.stamp, created.format(ARCHIVE_STAMP).to_string());
    }

    #[test]
    fn test_artifact_name_rejects_foreign_files() {
        assert!(ArtifactName::parse("notes.txt").is_err());
        assert!(ArtifactName::parse("backup.tar.gz").is_err());
        assert!(ArtifactName::parse("2024-01-01-not-a-uuid-at-all-but-long-enough.tar.gz").is_err());
    }

    #[test]
    fn test_same_second_names_never_collide() {
        let created = Local::now();
        let a = archive_name(&created, &Uuid::new_v4());
        let b = archive_name(&created, &Uuid::new_v4());
        assert_ne!(a, b);

        let a = object_name(&created, &Uuid::new_v4(), "snapshot.meta");
        let b = object_name(&created, &Uuid::new_v4(), "snapshot.meta");
        assert_ne!(a, b);
    }

    #[test]
    fn test_members_archive_contains_exactly_batch_files() {
        let tmp = TempDir::new().unwrap();
        let members = snapshot_dir(&tmp);
        let batch = Batch::new(0, members);

        let artifact = archiver(&tmp, DeliveryMode::Archive, ArchiveScope::Members)
            .package(&batch)
            .unwrap();
        assert_eq!(artifact.id, batch.id);

        let ArtifactPayload::Archive { path } = &artifact.payload else {
            panic!("Expected archive payload");
        };
        assert!(path.starts_with(tmp.path().join("staging")));

        let out = tmp.path().join("out");
        unpack(path, &out);
        let files = tree(&out);
        let top = PathBuf::from(
            path.file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches(ARCHIVE_SUFFIX),
        );

        assert_eq!(files.len(), 2);
        assert_eq!(files[&top.join("snapshot.meta")], b"meta-bytes");
        assert_eq!(files[&top.join("snapshot.state")], vec![7u8; 4096]);
    }

    #[test]
    fn test_snapshot_root_archive_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let members = snapshot_dir(&tmp);
        let batch = Batch::new(0, members);

        let artifact = archiver(&tmp, DeliveryMode::Archive, ArchiveScope::SnapshotRoot)
            .package(&batch)
            .unwrap();
        let ArtifactPayload::Archive { path } = &artifact.payload else {
            panic!("Expected archive payload");
        };

        let out = tmp.path().join("out");
        unpack(path, &out);
        let top = path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .trim_end_matches(ARCHIVE_SUFFIX)
            .to_string();

        assert_eq!(tree(&out.join(top)), tree(&tmp.path().join("snap")));
    }

    fn archive_entries(archive: &Path) -> Vec<PathBuf> {
        let file = File::open(archive).unwrap();
        tar::Archive::new(GzDecoder::new(file))
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect()
    }

    #[test]
    fn test_snapshot_root_skips_nested_staging() {
        let tmp = TempDir::new().unwrap();
        let members = snapshot_dir(&tmp);
        let a = Archiver::new(ArchiverConfig {
            mode: DeliveryMode::Archive,
            scope: ArchiveScope::SnapshotRoot,
            snapshot_root: tmp.path().join("snap"),
            staging: tmp.path().join("snap/tmp"),
        });

        let first = a.package(&Batch::new(0, members.clone())).unwrap();
        let second = a.package(&Batch::new(1, members)).unwrap();

        for artifact in [&first, &second] {
            let entries = archive_entries(artifact.local_path());
            assert!(
                entries.iter().all(|p| !p.components().any(|c| c.as_os_str() == "tmp")),
                "staging leaked into archive: {:?}",
                entries
            );
            assert!(entries.iter().any(|p| p.ends_with("nested/blob")));
            assert!(entries.iter().any(|p| p.ends_with("snapshot.state")));
        }

        // Staged archives stay put while the root keeps its own files
        assert!(first.local_path().exists());
        assert!(second.local_path().exists());
    }

    #[test]
    fn test_individual_failure_removes_partial_dir() {
        let tmp = TempDir::new().unwrap();
        snapshot_dir(&tmp);
        let other = tmp.path().join("other");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("snapshot.meta"), "second copy").unwrap();

        // Same base name twice: the second placeholder collides
        let batch = Batch::new(
            0,
            vec![tmp.path().join("snap/snapshot.meta"), other.join("snapshot.meta")],
        );
        let err = archiver(&tmp, DeliveryMode::Individual, ArchiveScope::Members)
            .package(&batch)
            .unwrap_err();

        assert!(matches!(err, PackagingError::NameCollision(_)));
        assert!(!tmp.path().join("staging").join(batch.id.to_string()).exists());
    }

    #[test]
    fn test_missing_member_is_reported() {
        let tmp = TempDir::new().unwrap();
        let mut members = snapshot_dir(&tmp);
        members.push(tmp.path().join("snap/snapshot.gc"));

        let err = archiver(&tmp, DeliveryMode::Archive, ArchiveScope::Members)
            .package(&Batch::new(0, members))
            .unwrap_err();
        assert!(matches!(err, PackagingError::SourceMissing(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_collision_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let members = snapshot_dir(&tmp);
        let batch = Batch::new(0, members);
        let a = archiver(&tmp, DeliveryMode::Individual, ArchiveScope::Members);

        a.package(&batch).unwrap();
        let err = a.package(&batch).unwrap_err();
        assert!(matches!(err, PackagingError::NameCollision(_)));
        assert!(err.is_fatal());
    }

    #[test]
    #[cfg(unix)]
    fn test_unwritable_staging_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let members = snapshot_dir(&tmp);
        // A regular file where the staging directory should be
        fs::write(tmp.path().join("staging"), "").unwrap();

        let err = archiver(&tmp, DeliveryMode::Archive, ArchiveScope::Members)
            .package(&Batch::new(0, members))
            .unwrap_err();
        assert!(matches!(err, PackagingError::StagingNotWritable { .. }));
    }

    #[test]
    fn test_individual_mode_writes_placeholders() {
        let tmp = TempDir::new().unwrap();
        let members = snapshot_dir(&tmp);
        let batch = Batch::new(0, members);

        let artifact = archiver(&tmp, DeliveryMode::Individual, ArchiveScope::Members)
            .package(&batch)
            .unwrap();
        let ArtifactPayload::Staged { dir, files } = &artifact.payload else {
            panic!("Expected staged payload");
        };

        assert_eq!(dir, &tmp.path().join("staging").join(batch.id.to_string()));
        assert_eq!(files.len(), 2);
        for file in files {
            let name = file.file_name().unwrap().to_str().unwrap();
            assert!(name.contains(&batch.id.to_string()));
            assert_eq!(fs::read_to_string(file).unwrap(), file.to_string_lossy());
        }

        let objects = artifact.objects();
        assert!(objects[0].1.starts_with(&format!("{}/", batch.id)));
        assert!(objects[0].1.ends_with("-snapshot.meta"));

        artifact.remove_local().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_from_archive_path() {
        let tmp = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let path = tmp.path().join(archive_name(&Local::now(), &id));
        fs::write(&path, "x").unwrap();

        let artifact = ArchiveArtifact::from_archive_path(path.clone()).unwrap();
        assert_eq!(artifact.id, id);
        assert_eq!(artifact.local_path(), path.as_path());

        assert!(ArchiveArtifact::from_archive_path(tmp.path().join("other.tar.gz")).is_err());
    }
}
