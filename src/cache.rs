//! Content-addressed cache of compiled objects.
//!
//! Objects live at `<root>/objects/<first2hex>/<fingerprint>.o` with a
//! sibling `.meta` record in a plain `key=value` text format, so the cache
//! can be inspected (and swept) without this crate. Stores publish through
//! an atomic rename: racing builds of the same fingerprint both write
//! identical bytes, and whichever rename lands last wins.

use crate::{
    error::{Result, SketchError},
    utils,
};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Subdirectory of the cache root holding object files.
const OBJECTS_DIR: &str = "objects";

/// 128-bit digest identifying one compile step.
///
/// Covers the source content, the exact materialized command, the toolchain
/// identity and the include-search state; equal fingerprints mean equal
/// outputs by assumption.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Digests a sequence of length-delimited parts.
    pub fn digest<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self::digest([bytes])
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// First byte, in hex: the fan-out directory name.
    fn shard(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = SketchError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes: [u8; 16] = hex::decode(s)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| SketchError::msg(format!("malformed fingerprint \"{s}\"")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Store/access times of one cached object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMeta {
    pub stored_at: u64,
    pub last_accessed: u64,
}

impl CacheMeta {
    fn to_text(self) -> String {
        format!("storedAt={}\nlastAccessed={}\n", self.stored_at, self.last_accessed)
    }

    fn parse(text: &str) -> Self {
        let mut meta = Self::default();
        for line in text.lines() {
            match line.split_once('=') {
                Some(("storedAt", v)) => meta.stored_at = v.trim().parse().unwrap_or_default(),
                Some(("lastAccessed", v)) => {
                    meta.last_accessed = v.trim().parse().unwrap_or_default()
                }
                _ => {}
            }
        }
        meta
    }
}

/// Options for one janitor pass.
#[derive(Clone, Debug, Default)]
pub struct SweepOptions {
    /// Delete entries not accessed for longer than this.
    pub max_age: Option<Duration>,
    /// Delete entries whose fingerprint matches this glob.
    pub pattern: Option<String>,
    /// Report what would be deleted without touching anything.
    pub dry_run: bool,
}

impl SweepOptions {
    pub fn max_age_days(days: u64) -> Self {
        Self { max_age: Some(Duration::from_secs(days * 24 * 60 * 60)), ..Default::default() }
    }
}

/// Outcome of a janitor pass.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: Vec<Fingerprint>,
    pub reclaimed_bytes: u64,
    pub dry_run: bool,
}

/// Aggregate numbers for `cache-stats` style reporting.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub oldest_store: Option<u64>,
    pub newest_store: Option<u64>,
}

/// On-disk object cache shared by all builds of a user.
///
/// All I/O failures on the read path degrade to misses; only opening the
/// cache (creating its directories) can error out, and callers treat even
/// that as "build without cache".
#[derive(Clone, Debug)]
pub struct ObjectCache {
    root: PathBuf,
}

impl ObjectCache {
    /// Opens (creating if needed) a cache at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let objects = root.join(OBJECTS_DIR);
        fs::create_dir_all(&objects).map_err(|err| SketchError::io(err, &objects))?;
        Ok(Self { root })
    }

    /// Opens the per-user default cache location.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::cache_dir()
            .ok_or_else(|| SketchError::msg("no user cache directory on this platform"))?;
        Self::open(dir.join("sketch-compilers"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(fingerprint.shard()).join(format!("{fingerprint}.o"))
    }

    fn meta_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(fingerprint.shard()).join(format!("{fingerprint}.meta"))
    }

    /// Returns the cached object bytes, touching its last-access stamp
    /// best-effort.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let path = self.object_path(fingerprint);
        match fs::read(&path) {
            Ok(bytes) => {
                self.touch(fingerprint);
                trace!(%fingerprint, len = bytes.len(), "cache hit");
                Some(bytes)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                trace!(%fingerprint, "cache miss");
                None
            }
            Err(err) => {
                warn!(%fingerprint, %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Returns whether the fingerprint is present, without touching it.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.object_path(fingerprint).is_file()
    }

    /// Stores object bytes under the fingerprint.
    ///
    /// Writes to a temporary sibling and renames into place, so concurrent
    /// builds never observe partial objects.
    pub fn store(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(fingerprint);
        utils::create_parent_dir_all(&path)?;

        let tmp = path.with_extension(format!("o.tmp{}", std::process::id()));
        fs::write(&tmp, bytes).map_err(|err| SketchError::io(err, &tmp))?;
        fs::rename(&tmp, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            SketchError::io(err, &path)
        })?;

        let now = utils::unix_timestamp();
        self.write_meta(fingerprint, CacheMeta { stored_at: now, last_accessed: now })?;
        trace!(%fingerprint, len = bytes.len(), "stored object");
        Ok(())
    }

    fn write_meta(&self, fingerprint: &Fingerprint, meta: CacheMeta) -> Result<()> {
        let path = self.meta_path(fingerprint);
        let tmp = path.with_extension(format!("meta.tmp{}", std::process::id()));
        fs::write(&tmp, meta.to_text()).map_err(|err| SketchError::io(err, &tmp))?;
        fs::rename(&tmp, &path).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            SketchError::io(err, &path)
        })?;
        Ok(())
    }

    fn read_meta(&self, fingerprint: &Fingerprint) -> CacheMeta {
        fs::read_to_string(self.meta_path(fingerprint))
            .map(|text| CacheMeta::parse(&text))
            .unwrap_or_default()
    }

    fn touch(&self, fingerprint: &Fingerprint) {
        let mut meta = self.read_meta(fingerprint);
        meta.last_accessed = utils::unix_timestamp();
        if let Err(err) = self.write_meta(fingerprint, meta) {
            trace!(%fingerprint, %err, "cannot update access time");
        }
    }

    /// Enumerates all fingerprints currently stored.
    fn entries(&self) -> Vec<Fingerprint> {
        let mut found = Vec::new();
        let objects = self.root.join(OBJECTS_DIR);
        for entry in walkdir::WalkDir::new(objects)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(stem) = name.strip_suffix(".o") {
                if let Ok(fingerprint) = stem.parse() {
                    found.push(fingerprint);
                }
            }
        }
        found
    }

    /// One janitor pass: deletes by age, by fingerprint glob, or both.
    /// With `dry_run` only the report is produced.
    pub fn sweep(&self, options: &SweepOptions) -> Result<SweepReport> {
        let pattern = options
            .pattern
            .as_deref()
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|err| SketchError::msg(format!("malformed sweep pattern: {err}")))?;
        let now = utils::unix_timestamp();

        let mut report = SweepReport { dry_run: options.dry_run, ..Default::default() };
        for fingerprint in self.entries() {
            report.scanned += 1;

            let matched = match (&pattern, options.max_age) {
                (Some(pattern), _) if !pattern.matches(&fingerprint.to_hex()) => false,
                (_, Some(max_age)) => {
                    let meta = self.read_meta(&fingerprint);
                    let reference = meta.last_accessed.max(meta.stored_at);
                    now.saturating_sub(reference) > max_age.as_secs()
                }
                (Some(_), None) => true,
                (None, None) => false,
            };
            if !matched {
                continue;
            }

            let object = self.object_path(&fingerprint);
            let size = fs::metadata(&object).map(|m| m.len()).unwrap_or_default();
            if !options.dry_run {
                fs::remove_file(&object).map_err(|err| SketchError::io(err, &object))?;
                let _ = fs::remove_file(self.meta_path(&fingerprint));
            }
            report.deleted.push(fingerprint);
            report.reclaimed_bytes += size;
        }
        debug!(
            scanned = report.scanned,
            deleted = report.deleted.len(),
            dry_run = report.dry_run,
            "cache sweep"
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for fingerprint in self.entries() {
            let object = self.object_path(&fingerprint);
            let size = fs::metadata(&object).map(|m| m.len()).unwrap_or_default();
            let meta = self.read_meta(&fingerprint);
            stats.entries += 1;
            stats.total_bytes += size;
            stats.oldest_store = Some(match stats.oldest_store {
                Some(oldest) => oldest.min(meta.stored_at),
                None => meta.stored_at,
            });
            stats.newest_store = Some(match stats.newest_store {
                Some(newest) => newest.max(meta.stored_at),
                None => meta.stored_at,
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache() -> (tempfile::TempDir, ObjectCache) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ObjectCache::open(tmp.path().join("cache")).unwrap();
        (tmp, cache)
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = Fingerprint::digest([b"source".as_slice(), b"command", b"toolchain"]);
        let b = Fingerprint::digest([b"source".as_slice(), b"command", b"toolchain"]);
        assert_eq!(a, b);

        // a single changed byte in any part changes the digest
        let c = Fingerprint::digest([b"sourcf".as_slice(), b"command", b"toolchain"]);
        assert_ne!(a, c);
        let d = Fingerprint::digest([b"source".as_slice(), b"command!", b"toolchain"]);
        assert_ne!(a, d);

        // length delimiting keeps part boundaries out of play
        let e = Fingerprint::digest([b"sourcecommand".as_slice(), b"", b"toolchain"]);
        assert_ne!(a, e);
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = Fingerprint::of_bytes(b"abc");
        let text = fp.to_hex();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<Fingerprint>().unwrap(), fp);
        assert!("zz".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn store_then_lookup() {
        let (_tmp, cache) = cache();
        let fp = Fingerprint::of_bytes(b"unit");
        assert_eq!(cache.lookup(&fp), None);

        cache.store(&fp, b"object bytes").unwrap();
        assert_eq!(cache.lookup(&fp), Some(b"object bytes".to_vec()));
        assert!(cache.contains(&fp));

        // layout: objects/<first2hex>/<fingerprint>.o
        let shard = &fp.to_hex()[..2];
        assert!(cache
            .root()
            .join(OBJECTS_DIR)
            .join(shard)
            .join(format!("{fp}.o"))
            .is_file());
    }

    #[test]
    fn store_overwrites_atomically() {
        let (_tmp, cache) = cache();
        let fp = Fingerprint::of_bytes(b"unit");
        cache.store(&fp, b"one").unwrap();
        cache.store(&fp, b"two").unwrap();
        assert_eq!(cache.lookup(&fp), Some(b"two".to_vec()));
    }

    #[test]
    fn sweep_by_pattern_and_dry_run() {
        let (_tmp, cache) = cache();
        let a = Fingerprint::of_bytes(b"a");
        let b = Fingerprint::of_bytes(b"b");
        cache.store(&a, b"aaaa").unwrap();
        cache.store(&b, b"bb").unwrap();

        let dry = cache
            .sweep(&SweepOptions { pattern: Some("*".to_string()), dry_run: true, ..Default::default() })
            .unwrap();
        assert_eq!(dry.scanned, 2);
        assert_eq!(dry.deleted.len(), 2);
        assert_eq!(dry.reclaimed_bytes, 6);
        assert!(cache.contains(&a) && cache.contains(&b));

        let real = cache
            .sweep(&SweepOptions {
                pattern: Some(format!("{}*", &a.to_hex()[..8])),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(real.deleted, vec![a]);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
    }

    #[test]
    fn sweep_by_age_keeps_fresh_entries() {
        let (_tmp, cache) = cache();
        let fp = Fingerprint::of_bytes(b"fresh");
        cache.store(&fp, b"data").unwrap();

        let report = cache.sweep(&SweepOptions::max_age_days(1)).unwrap();
        assert!(report.deleted.is_empty());

        // backdate the entry and sweep again
        let meta = CacheMeta { stored_at: 1, last_accessed: 1 };
        cache.write_meta(&fp, meta).unwrap();
        let report = cache.sweep(&SweepOptions::max_age_days(1)).unwrap();
        assert_eq!(report.deleted, vec![fp]);
        assert!(!cache.contains(&fp));
    }

    #[test]
    fn stats_aggregate_entries() {
        let (_tmp, cache) = cache();
        assert_eq!(cache.stats().unwrap().entries, 0);
        cache.store(&Fingerprint::of_bytes(b"a"), b"1234").unwrap();
        cache.store(&Fingerprint::of_bytes(b"b"), b"12").unwrap();
        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 6);
        assert!(stats.oldest_store.is_some());
    }

    #[test]
    fn meta_text_round_trip() {
        let meta = CacheMeta { stored_at: 100, last_accessed: 200 };
        assert_eq!(CacheMeta::parse(&meta.to_text()), meta);
        assert_eq!(CacheMeta::parse("garbage\n"), CacheMeta::default());
    }
}
