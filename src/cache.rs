//! File change detection
//!
//! [`ChangeCache`] remembers the last seen modification time and SHA-256 of
//! every file it has looked at. A file is only rehashed when its modification
//! time differs from the cached one, so same-mtime edits are deliberately
//! invisible. [`DirectoryScanner`] walks the configured application
//! directories and feeds the cache.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Version control directory skipped while scanning
const VCS_DIR: &str = ".git";

/// Last known state of a single file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Hex encoded SHA-256 of the file content
    pub checksum: String,
    /// Modification time reported by the filesystem when the checksum was taken
    pub last_modified: DateTime<Utc>,
}

/// Process-wide path to [`FileRecord`] table.
///
/// Lookups take the shared lock, inserts and removals the exclusive one.
/// Hashing happens outside of both.
#[derive(Debug, Default)]
pub struct ChangeCache {
    records: RwLock<HashMap<String, FileRecord>>,
    checksums_computed: AtomicU64,
}

impl ChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<FileRecord> {
        self.records.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of files hashed from disk since the cache was created
    pub fn checksums_computed(&self) -> u64 {
        self.checksums_computed.load(Ordering::Relaxed)
    }

    /// Copy of every record, sorted by path
    pub fn snapshot(&self) -> BTreeMap<String, FileRecord> {
        self.records
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Insert or overwrite a record
    pub fn record(&self, key: impl Into<String>, record: FileRecord) {
        self.records.write().insert(key.into(), record);
    }

    /// Return the record for `path`, hashing the file only if `modified`
    /// differs from the cached modification time.
    pub fn refresh(&self, key: &str, path: &Path, modified: SystemTime) -> io::Result<FileRecord> {
        let modified = DateTime::<Utc>::from(modified);

        if let Some(record) = self.records.read().get(key) {
            if record.last_modified == modified {
                return Ok(record.clone());
            }
        }

        let checksum = checksum_file(path)?;
        self.checksums_computed.fetch_add(1, Ordering::Relaxed);
        debug!(path = key, %checksum, "Checksum updated");

        let record = FileRecord {
            checksum,
            last_modified: modified,
        };
        self.record(key, record.clone());
        Ok(record)
    }

    /// Drop records under `root` that were not visited and are gone from disk
    fn sweep(&self, root: &Path, seen: &HashSet<String>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|key, _| {
            seen.contains(key) || !Path::new(key).starts_with(root) || Path::new(key).exists()
        });
        before - records.len()
    }
}

/// Walks a set of root directories and keeps a [`ChangeCache`] current
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    roots: Vec<PathBuf>,
}

impl DirectoryScanner {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Cache key for `path` in the form a scan would produce it.
    ///
    /// A path under one of the roots is re-expressed relative to that root as
    /// configured, so `/srv/app/a.py` and root `./` (with `/srv/app` as the
    /// working directory) both key to `a.py`. Other paths use [`cache_key`].
    pub fn key_for(&self, path: &Path) -> String {
        if let Ok(absolute) = std::path::absolute(path) {
            for root in &self.roots {
                let Ok(root_absolute) = std::path::absolute(root) else {
                    continue;
                };
                if let Ok(rest) = absolute.strip_prefix(&root_absolute) {
                    return cache_key(&root.join(rest));
                }
            }
        }
        cache_key(path)
    }

    /// Refresh `cache` from every regular file under the roots.
    ///
    /// Returns the whole cache, which may include paths outside the current
    /// roots. Walk errors are logged and skipped.
    pub fn scan(&self, cache: &ChangeCache) -> BTreeMap<String, FileRecord> {
        let computed_before = cache.checksums_computed();
        let mut visited = 0usize;
        let mut removed = 0usize;

        for root in &self.roots {
            let mut seen = HashSet::new();
            let walker = WalkDir::new(root)
                .into_iter()
                .filter_entry(|entry| !is_vcs_dir(entry));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "Error walking directory");
                        continue;
                    }
                };

                if !entry.file_type().is_file() {
                    continue;
                }

                let key = cache_key(entry.path());
                let modified = entry
                    .metadata()
                    .map_err(io::Error::from)
                    .and_then(|m| m.modified());

                match modified.and_then(|modified| cache.refresh(&key, entry.path(), modified)) {
                    Ok(_) => visited += 1,
                    Err(e) => warn!(path = %key, error = %e, "Failed to checksum file"),
                }
                seen.insert(key);
            }

            removed += cache.sweep(Path::new(&cache_key(root)), &seen);
        }

        info!(
            roots = self.roots.len(),
            visited,
            hashed = cache.checksums_computed() - computed_before,
            removed,
            "Scan complete"
        );

        cache.snapshot()
    }
}

fn is_vcs_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir() && entry.file_name() == VCS_DIR
}

/// Cache key for a path: the path as given, minus `.` components
pub fn cache_key(path: &Path) -> String {
    let cleaned: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    cleaned.to_string_lossy().into_owned()
}

/// Hex SHA-256 of a file's content, streamed from disk
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer
pub fn checksum_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn mtime(path: &Path) -> SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    #[test]
    fn test_cache_key_strips_current_dir() {
        assert_eq!(cache_key(Path::new("./app.py")), "app.py");
        assert_eq!(cache_key(Path::new("src/./lib/a.py")), "src/lib/a.py");
        assert_eq!(cache_key(Path::new("./")), "");
        assert_eq!(cache_key(Path::new("/srv/app/a.py")), "/srv/app/a.py");
    }

    #[test]
    fn test_key_for_matches_scan_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("pkg/app.py");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"x").unwrap();

        let cwd = std::env::current_dir().unwrap();
        let scanner = DirectoryScanner::new(vec![PathBuf::from("./")]);
        assert_eq!(scanner.key_for(&cwd.join("src/lib.rs")), "src/lib.rs");
        assert_eq!(scanner.key_for(Path::new("./src/lib.rs")), "src/lib.rs");

        let scanner = DirectoryScanner::new(vec![tmp.path().to_path_buf()]);
        let cache = ChangeCache::new();
        let files = scanner.scan(&cache);
        assert!(files.contains_key(&scanner.key_for(&path)));

        // Outside every root the path is kept as given
        assert_eq!(scanner.key_for(Path::new("/elsewhere/a.py")), "/elsewhere/a.py");
    }

    #[test]
    fn test_checksum_bytes_matches_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.py");
        std::fs::write(&path, b"print('hi')\n").unwrap();

        assert_eq!(checksum_file(&path).unwrap(), checksum_bytes(b"print('hi')\n"));
        assert_eq!(checksum_bytes(b"").len(), 64);
    }

    #[test]
    fn test_scan_new_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.py");
        std::fs::write(&path, b"x = 1\n").unwrap();

        let cache = ChangeCache::new();
        let scanner = DirectoryScanner::new(vec![tmp.path().to_path_buf()]);
        let files = scanner.scan(&cache);

        let record = files.get(&cache_key(&path)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(record.checksum, checksum_bytes(b"x = 1\n"));
        assert_eq!(record.last_modified, DateTime::<Utc>::from(mtime(&path)));
    }

    #[test]
    fn test_unchanged_file_not_rehashed() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.py"), b"a").unwrap();
        std::fs::write(tmp.path().join("b.py"), b"b").unwrap();

        let cache = ChangeCache::new();
        let scanner = DirectoryScanner::new(vec![tmp.path().to_path_buf()]);

        let first = scanner.scan(&cache);
        assert_eq!(cache.checksums_computed(), 2);

        let second = scanner.scan(&cache);
        assert_eq!(cache.checksums_computed(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_modified_file_rehashed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.py");
        std::fs::write(&path, b"old").unwrap();

        let cache = ChangeCache::new();
        let scanner = DirectoryScanner::new(vec![tmp.path().to_path_buf()]);
        scanner.scan(&cache);

        let later = mtime(&path) + Duration::from_secs(10);
        std::fs::write(&path, b"new").unwrap();
        set_mtime(&path, later);

        let files = scanner.scan(&cache);
        assert_eq!(cache.checksums_computed(), 2);
        assert_eq!(files[&cache_key(&path)].checksum, checksum_bytes(b"new"));
    }

    #[test]
    fn test_same_mtime_is_treated_as_unchanged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.py");
        std::fs::write(&path, b"old").unwrap();

        let cache = ChangeCache::new();
        let scanner = DirectoryScanner::new(vec![tmp.path().to_path_buf()]);
        scanner.scan(&cache);
        let original = mtime(&path);

        std::fs::write(&path, b"new").unwrap();
        set_mtime(&path, original);

        let files = scanner.scan(&cache);
        assert_eq!(cache.checksums_computed(), 1);
        assert_eq!(files[&cache_key(&path)].checksum, checksum_bytes(b"old"));
    }

    #[test]
    fn test_vcs_dir_excluded() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/HEAD"), b"ref").unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/app.py"), b"app").unwrap();

        let cache = ChangeCache::new();
        let files = DirectoryScanner::new(vec![tmp.path().to_path_buf()]).scan(&cache);

        assert_eq!(files.len(), 1);
        assert!(files.contains_key(&cache_key(&tmp.path().join("src/app.py"))));
    }

    #[test]
    fn test_deleted_file_is_swept() {
        let tmp = TempDir::new().unwrap();
        let keep = tmp.path().join("keep.py");
        let gone = tmp.path().join("gone.py");
        std::fs::write(&keep, b"keep").unwrap();
        std::fs::write(&gone, b"gone").unwrap();

        let cache = ChangeCache::new();
        let scanner = DirectoryScanner::new(vec![tmp.path().to_path_buf()]);
        assert_eq!(scanner.scan(&cache).len(), 2);

        std::fs::remove_file(&gone).unwrap();
        let files = scanner.scan(&cache);

        assert_eq!(files.len(), 1);
        assert!(files.contains_key(&cache_key(&keep)));
    }

    #[test]
    fn test_entries_from_other_roots_are_kept() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::write(first.path().join("a.py"), b"a").unwrap();
        std::fs::write(second.path().join("b.py"), b"b").unwrap();

        let cache = ChangeCache::new();
        DirectoryScanner::new(vec![first.path().to_path_buf()]).scan(&cache);
        let files = DirectoryScanner::new(vec![second.path().to_path_buf()]).scan(&cache);

        assert_eq!(files.len(), 2);
        assert!(files.contains_key(&cache_key(&first.path().join("a.py"))));
    }

    #[test]
    fn test_missing_root_does_not_abort_scan() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.py"), b"a").unwrap();

        let cache = ChangeCache::new();
        let scanner = DirectoryScanner::new(vec![
            tmp.path().join("does-not-exist"),
            tmp.path().to_path_buf(),
        ]);

        assert_eq!(scanner.scan(&cache).len(), 1);
    }

    #[test]
    fn test_record_overwrites() {
        let cache = ChangeCache::new();
        let now = Utc::now();
        cache.record(
            "a.py",
            FileRecord {
                checksum: "one".to_string(),
                last_modified: now,
            },
        );
        cache.record(
            "a.py",
            FileRecord {
                checksum: "two".to_string(),
                last_modified: now,
            },
        );

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a.py").unwrap().checksum, "two");
    }

    #[test]
    fn test_file_record_json() {
        let record = FileRecord {
            checksum: "abc".to_string(),
            last_modified: DateTime::from_timestamp(0, 0).unwrap(),
        };
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["checksum"], "abc");
        assert_eq!(json["lastModified"], "1970-01-01T00:00:00Z");
    }
}
