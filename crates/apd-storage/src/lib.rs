//! File-backed interim state for the pipeline: geocode cache, crosswalk,
//! known-missing list, permit URL cache, review reports, and the raw report
//! archive. All writes go through an atomic temp-file rename so a failed run
//! never truncates a cache.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use apd_core::GeoPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "apd-storage";

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("creating {}", parent.display()))?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    std::fs::write(&temp_path, bytes)
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

fn read_csv_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("parsing {}", path.display()))?);
    }
    Ok(rows)
}

fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("serializing row for {}", path.display()))?;
    }
    let bytes = writer
        .into_inner()
        .context("flushing csv writer buffer")?;
    atomic_write(path, &bytes)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GeocodeRow {
    facility_address: String,
    lat: Option<f64>,
    lng: Option<f64>,
}

/// Persisted address -> coordinate table. Entries without coordinates are
/// never kept here; they belong in the missing-geocodes report.
#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, GeoPoint>,
}

impl GeocodeCache {
    /// Load the cache, deduplicating by address and keeping the first row
    /// that carries both coordinates.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut cache = Self {
            entries: BTreeMap::new(),
            path: path.clone(),
        };
        let loaded = cache.merge_file(&path)?;
        debug!(entries = loaded, path = %path.display(), "loaded geocode cache");
        Ok(cache)
    }

    /// Merge another geocode table (e.g. manually geocoded addresses) into
    /// this cache. Existing entries win; rows without coordinates are
    /// skipped. Returns how many entries were added.
    pub fn merge_file(&mut self, path: &Path) -> Result<usize> {
        let rows: Vec<GeocodeRow> = read_csv_rows(path)?;
        let mut added = 0;
        for row in rows {
            let (Some(lat), Some(lng)) = (row.lat, row.lng) else {
                continue;
            };
            if !self.entries.contains_key(&row.facility_address) {
                self.entries
                    .insert(row.facility_address, GeoPoint { lat, lng });
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn get(&self, address: &str) -> Option<GeoPoint> {
        self.entries.get(address).copied()
    }

    pub fn insert(&mut self, address: String, point: GeoPoint) {
        self.entries.insert(address, point);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        let rows: Vec<GeocodeRow> = self
            .entries
            .iter()
            .map(|(address, point)| GeocodeRow {
                facility_address: address.clone(),
                lat: Some(point.lat),
                lng: Some(point.lng),
            })
            .collect();
        write_csv_rows(&self.path, &rows)
    }
}

/// Write the still-unresolved addresses next to the cache so an operator can
/// geocode them by hand.
pub fn write_missing_geocodes(path: &Path, addresses: &[String]) -> Result<()> {
    let rows: Vec<GeocodeRow> = addresses
        .iter()
        .map(|address| GeocodeRow {
            facility_address: address.clone(),
            lat: None,
            lng: None,
        })
        .collect();
    write_csv_rows(path, &rows)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CrosswalkRow {
    facility_name: String,
    school_name: String,
}

/// Persisted facility name -> school name mapping, grown as new exact
/// matches are confirmed.
#[derive(Debug)]
pub struct Crosswalk {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl Crosswalk {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows: Vec<CrosswalkRow> = read_csv_rows(&path)?;
        let mut entries = BTreeMap::new();
        for row in rows {
            entries.entry(row.facility_name).or_insert(row.school_name);
        }
        debug!(entries = entries.len(), path = %path.display(), "loaded crosswalk");
        Ok(Self { path, entries })
    }

    pub fn get(&self, facility_name: &str) -> Option<&str> {
        self.entries.get(facility_name).map(String::as_str)
    }

    /// Record a confirmed pair. Returns false when the facility was already
    /// mapped (the existing mapping is kept).
    pub fn insert(&mut self, facility_name: String, school_name: String) -> bool {
        match self.entries.entry(facility_name) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(school_name);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        let rows: Vec<CrosswalkRow> = self
            .entries
            .iter()
            .map(|(facility_name, school_name)| CrosswalkRow {
                facility_name: facility_name.clone(),
                school_name: school_name.clone(),
            })
            .collect();
        write_csv_rows(&self.path, &rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KnownMissingRow {
    facility_name: String,
}

/// Facility names confirmed to be non-school permits; excluded from
/// matching entirely.
#[derive(Debug)]
pub struct KnownMissing {
    path: PathBuf,
    names: BTreeSet<String>,
}

impl KnownMissing {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows: Vec<KnownMissingRow> = read_csv_rows(&path)?;
        let names = rows.into_iter().map(|row| row.facility_name).collect();
        Ok(Self { path, names })
    }

    pub fn contains(&self, facility_name: &str) -> bool {
        self.names.contains(facility_name)
    }

    pub fn insert(&mut self, facility_name: String) -> bool {
        self.names.insert(facility_name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        let rows: Vec<KnownMissingRow> = self
            .names
            .iter()
            .map(|name| KnownMissingRow {
                facility_name: name.clone(),
            })
            .collect();
        write_csv_rows(&self.path, &rows)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PermitUrlRow {
    permit_number: String,
    permit_url: String,
}

/// Persisted permit number -> portal detail URL table. Only ever extended
/// for permit numbers not yet resolved.
#[derive(Debug)]
pub struct PermitUrlCache {
    path: PathBuf,
    urls: BTreeMap<String, String>,
}

impl PermitUrlCache {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows: Vec<PermitUrlRow> = read_csv_rows(&path)?;
        let mut urls = BTreeMap::new();
        for row in rows {
            urls.entry(row.permit_number).or_insert(row.permit_url);
        }
        Ok(Self { path, urls })
    }

    pub fn get(&self, permit_number: &str) -> Option<&str> {
        self.urls.get(permit_number).map(String::as_str)
    }

    pub fn contains(&self, permit_number: &str) -> bool {
        self.urls.contains_key(permit_number)
    }

    /// Record a freshly scraped URL; an already-resolved permit number is
    /// left untouched.
    pub fn insert_new(&mut self, permit_number: String, permit_url: String) -> bool {
        match self.urls.entry(permit_number) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(permit_url);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        let rows: Vec<PermitUrlRow> = self
            .urls
            .iter()
            .map(|(permit_number, permit_url)| PermitUrlRow {
                permit_number: permit_number.clone(),
                permit_url: permit_url.clone(),
            })
            .collect();
        write_csv_rows(&self.path, &rows)
    }
}

/// One fuzzy-match candidate pending manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRow {
    pub facility_name: String,
    pub school_name: String,
    pub facility_address: Option<String>,
    pub school_address: String,
    pub match_probability: f64,
    pub match_tier: String,
}

/// Write the manual-review report. Confirmed pairs get promoted by hand into
/// the crosswalk or known-missing tables before the next run.
pub fn write_review_report(path: &Path, rows: &[ReviewRow]) -> Result<()> {
    write_csv_rows(path, rows)
}

#[derive(Debug, Clone)]
pub struct ArchivedReport {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw portal report downloads. Re-storing the
/// same bytes is a no-op, so daily runs that download an unchanged report
/// do not grow the archive.
#[derive(Debug, Clone)]
pub struct RawReportArchive {
    root: PathBuf,
}

impl RawReportArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn report_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp).join(format!("{content_hash}.{ext}"))
    }

    /// Store report bytes immutably using a hash-addressed path and atomic
    /// temp-file rename.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> Result<ArchivedReport> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.report_relative_path(fetched_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedReport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedReport {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedReport {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn geocode_cache_round_trips_and_prefers_resolved_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("geocoded_addresses.csv");
        std::fs::write(
            &path,
            "facility_address,lat,lng\n\
             440 N Broad St,,\n\
             440 N Broad St,39.96,-75.16\n\
             1 Unknown Way,,\n",
        )
        .unwrap();

        let mut cache = GeocodeCache::open(&path).expect("open");
        // The blank first row must not shadow the resolved duplicate.
        assert_eq!(cache.len(), 1);
        let point = cache.get("440 N Broad St").expect("cached");
        assert_eq!(point.lat, 39.96);
        assert!(cache.get("1 Unknown Way").is_none());

        cache.insert(
            "123 Market St".to_string(),
            GeoPoint { lat: 39.95, lng: -75.15 },
        );
        cache.flush().expect("flush");

        let reloaded = GeocodeCache::open(&path).expect("reopen");
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.get("123 Market St").is_some());
    }

    #[test]
    fn manual_geocodes_merge_without_overriding_cache() {
        let dir = tempdir().expect("tempdir");
        let cache_path = dir.path().join("geocoded_addresses.csv");
        let manual_path = dir.path().join("manual_geocoded_addresses.csv");
        std::fs::write(&cache_path, "facility_address,lat,lng\nA St,1.0,2.0\n").unwrap();
        std::fs::write(
            &manual_path,
            "facility_address,lat,lng\nA St,9.0,9.0\nB St,3.0,4.0\n",
        )
        .unwrap();

        let mut cache = GeocodeCache::open(&cache_path).expect("open");
        let added = cache.merge_file(&manual_path).expect("merge");
        assert_eq!(added, 1);
        assert_eq!(cache.get("A St").unwrap().lat, 1.0);
        assert_eq!(cache.get("B St").unwrap().lat, 3.0);
    }

    #[test]
    fn crosswalk_growth_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("crosswalk.csv");
        let mut crosswalk = Crosswalk::open(&path).expect("open empty");
        assert!(crosswalk.is_empty());

        assert!(crosswalk.insert("MEREDITH ES".into(), "Meredith, William M.".into()));
        assert!(!crosswalk.insert("MEREDITH ES".into(), "Meredith, William M.".into()));
        crosswalk.flush().expect("flush");
        crosswalk.flush().expect("second flush");

        let reloaded = Crosswalk::open(&path).expect("reopen");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("MEREDITH ES"), Some("Meredith, William M."));
    }

    #[test]
    fn permit_url_cache_only_extends_unresolved_numbers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("permit-number-urls.csv");
        let mut cache = PermitUrlCache::open(&path).expect("open");
        assert!(cache.insert_new("P1".into(), "https://portal/p1".into()));
        assert!(!cache.insert_new("P1".into(), "https://portal/other".into()));
        cache.flush().expect("flush");

        let reloaded = PermitUrlCache::open(&path).expect("reopen");
        assert_eq!(reloaded.get("P1"), Some("https://portal/p1"));
    }

    #[test]
    fn review_report_is_written_for_manual_handling() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("fuzzy_matches.csv");
        write_review_report(
            &path,
            &[ReviewRow {
                facility_name: "BARTRAM ANNEX".into(),
                school_name: "Bartram, John".into(),
                facility_address: Some("2401 S 67th St".into()),
                school_address: "2401 S 67th St".into(),
                match_probability: 84.0,
                match_tier: "name".into(),
            }],
        )
        .expect("write");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("BARTRAM ANNEX"));
        assert!(text.contains("84.0"));
    }

    #[tokio::test]
    async fn raw_report_archive_deduplicates_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let archive = RawReportArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .store_bytes(fetched_at, "csv", b"Permit #,Status\nA1,Approved\n")
            .await
            .expect("first store");
        let second = archive
            .store_bytes(fetched_at, "csv", b"Permit #,Status\nA1,Approved\n")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }
}
