//! The pipeline: extraction, school registry, geocoding, matching,
//! transformation, incremental update and publishing.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use apd_adapters::{
    AdapterError, Geocoder, ObjectStore, PermitUrlResolver, ReportSource, ReportWindow,
};
use apd_core::{
    clean_address, clean_facility_name, project_length_days, state_plane, DashboardPermit,
    GeoPoint, PermitRecord, SchoolLevel, SchoolRecord,
};
use apd_storage::{
    write_missing_geocodes, write_review_report, Crosswalk, GeocodeCache, KnownMissing,
    PermitUrlCache, RawReportArchive, ReviewRow,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "apd-etl";

/// Object-store keys the dashboard reads from.
pub const PERMITS_OBJECT_KEY: &str = "asbestos-data.json";
pub const SCHOOLS_OBJECT_KEY: &str = "schools.json";

/// Minimum 0-100 similarity score for a fuzzy candidate to be reported.
pub const FUZZY_SCORE_CUTOFF: f64 = 60.0;

/// Schools whose canonical point disagrees across permits by more than this
/// many state-plane feet get flagged in the log.
const COORDINATE_SPREAD_LIMIT_FEET: f64 = 500.0;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("no raw report matching Citizen*.csv under {0:?}")]
    MissingRawReport(PathBuf),
    #[error("{count} addresses lack coordinates; see {report:?} for manual geocoding")]
    UnresolvedGeocodes { count: usize, report: PathBuf },
    #[error("{count} facilities need fuzzy-match review; see {report:?}")]
    FuzzyReviewRequired { count: usize, report: PathBuf },
    #[error("crosswalk maps {facility:?} to {school:?}, which is not in the school registry")]
    CrosswalkSchoolUnknown { facility: String, school: String },
    #[error("crosswalk re-entry did not converge after exact matching")]
    CrosswalkDivergence,
    #[error("permit number {0} appears more than once")]
    DuplicatePermit(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Filesystem layout + knobs for a run. Everything lives under `data_dir`,
/// mirroring the raw / interim / processed split of the source datasets.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub data_dir: PathBuf,
    pub lookback_days: i64,
    pub allow_unresolved_geocodes: bool,
}

impl EtlConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("APD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            lookback_days: std::env::var("APD_LOOKBACK_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            allow_unresolved_geocodes: std::env::var("APD_ALLOW_UNRESOLVED_GEOCODES")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("raw")
    }

    pub fn schools_dir(&self) -> PathBuf {
        self.raw_dir().join("schools")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.raw_dir().join("archive")
    }

    fn interim(&self, name: &str) -> PathBuf {
        self.data_dir.join("interim").join(name)
    }

    pub fn geocode_cache_path(&self) -> PathBuf {
        self.interim("geocoded_addresses.csv")
    }

    pub fn manual_geocode_path(&self) -> PathBuf {
        self.interim("manual_geocoded_addresses.csv")
    }

    pub fn missing_geocodes_path(&self) -> PathBuf {
        self.interim("missing_geocoded_addresses.csv")
    }

    pub fn crosswalk_path(&self) -> PathBuf {
        self.interim("crosswalk.csv")
    }

    pub fn known_missing_path(&self) -> PathBuf {
        self.interim("known_missing_matches.csv")
    }

    pub fn permit_url_cache_path(&self) -> PathBuf {
        self.interim("permit-number-urls.csv")
    }

    pub fn review_report_path(&self) -> PathBuf {
        self.interim("fuzzy_matches.csv")
    }

    pub fn permits_geojson_path(&self) -> PathBuf {
        self.data_dir.join("processed").join("asbestos-data.geojson")
    }

    pub fn schools_geojson_path(&self) -> PathBuf {
        self.data_dir.join("processed").join("schools.geojson")
    }
}

// ---------------------------------------------------------------------------
// Extractor

/// Raw report row exactly as the portal exports it.
#[derive(Debug, Deserialize)]
struct RawPermitRow {
    #[serde(rename = "Permit #")]
    permit_number: String,
    #[serde(rename = "Work Description", default)]
    work_description: String,
    #[serde(rename = "Subtype", default)]
    subtype: String,
    #[serde(rename = "Applicant", default)]
    applicant: String,
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Site Address", default)]
    facility_address: String,
    #[serde(rename = "Application Date", default)]
    application_date: String,
    #[serde(rename = "Approval Date", default)]
    approval_date: String,
    #[serde(rename = "Issue Date", default)]
    issue_date: String,
    #[serde(rename = "Expiration Date", default)]
    expiration_date: String,
    #[serde(rename = "Work Start", default)]
    work_start: String,
    #[serde(rename = "Complete Date", default)]
    complete_date: String,
    #[serde(rename = "Notification Type", default)]
    notification_type: String,
    #[serde(rename = "Asbestos Inspector", default)]
    asbestos_inspector: String,
    #[serde(rename = "Project Type", default)]
    project_type: String,
    #[serde(rename = "Type of Operation", default)]
    operation_type: String,
    #[serde(rename = "Facility Name", default)]
    facility_name: String,
    #[serde(rename = "Facility Owner", default)]
    facility_owner: String,
    #[serde(rename = "Facility Owner Address", default)]
    facility_owner_address: String,
    #[serde(rename = "Abatement Contractor", default)]
    abatement_contractor: String,
    #[serde(rename = "Demo Contractor", default)]
    demo_contractor: String,
    #[serde(rename = "Asbestos Investigator", default)]
    asbestos_investigator: String,
    #[serde(rename = "Asbestos Present", default)]
    asbestos_present: String,
    #[serde(rename = "Linear Ft of Friable Material", default)]
    linear_ft_friable: String,
    #[serde(rename = "Square Ft of Friable Material", default)]
    square_ft_friable: String,
    #[serde(rename = "Cubic Ft of Friable Material", default)]
    cubic_ft_friable: String,
    // The misspelling is the portal's own column header.
    #[serde(rename = "Linear Ft of Non-Fraibale Material", default)]
    linear_ft_nonfriable: String,
    #[serde(rename = "Square Ft of Non-Friable Material", default)]
    square_ft_nonfriable: String,
    #[serde(rename = "Cubic Ft of Non-Friable Material", default)]
    cubic_ft_nonfriable: String,
    #[serde(rename = "Asbestos Material", default)]
    friable_acm: String,
}

fn opt(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_quantity(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| *c != ',' && *c != ' ').collect();
    if cleaned.is_empty() {
        None
    } else {
        cleaned.parse().ok()
    }
}

impl RawPermitRow {
    fn into_record(self) -> PermitRecord {
        PermitRecord {
            permit_number: self.permit_number.trim().to_string(),
            work_description: opt(self.work_description),
            subtype: opt(self.subtype),
            applicant: opt(self.applicant),
            status: opt(self.status),
            facility_address: opt(self.facility_address),
            application_date: apd_core::parse_report_date(&self.application_date),
            approval_date: apd_core::parse_report_date(&self.approval_date),
            issue_date: apd_core::parse_report_date(&self.issue_date),
            expiration_date: apd_core::parse_report_date(&self.expiration_date),
            work_start: apd_core::parse_report_date(&self.work_start),
            complete_date: apd_core::parse_report_date(&self.complete_date),
            notification_type: opt(self.notification_type),
            asbestos_inspector: opt(self.asbestos_inspector),
            project_type: opt(self.project_type),
            operation_type: opt(self.operation_type),
            facility_name: opt(self.facility_name),
            facility_owner: opt(self.facility_owner),
            facility_owner_address: opt(self.facility_owner_address),
            abatement_contractor: opt(self.abatement_contractor),
            demo_contractor: opt(self.demo_contractor),
            asbestos_investigator: opt(self.asbestos_investigator),
            asbestos_present: opt(self.asbestos_present),
            linear_ft_friable: parse_quantity(&self.linear_ft_friable),
            square_ft_friable: parse_quantity(&self.square_ft_friable),
            cubic_ft_friable: parse_quantity(&self.cubic_ft_friable),
            linear_ft_nonfriable: parse_quantity(&self.linear_ft_nonfriable),
            square_ft_nonfriable: parse_quantity(&self.square_ft_nonfriable),
            cubic_ft_nonfriable: parse_quantity(&self.cubic_ft_nonfriable),
            friable_acm: opt(self.friable_acm),
            lat: None,
            lng: None,
        }
    }
}

fn application_cutoff() -> NaiveDate {
    NaiveDate::from_ymd_opt(2016, 1, 1).expect("static date")
}

fn is_district_owner(owner: &str) -> bool {
    let owner = owner.to_ascii_lowercase();
    (owner.contains("school") && owner.contains("phila") && owner.contains("dis"))
        || owner == "sdp"
}

fn is_district_address(address: &str) -> bool {
    let address = address.to_ascii_lowercase();
    address.contains("440") && address.contains("broad")
}

/// Parse the raw portal export and trim it to School District permits filed
/// on or after the 2016 cutoff, sorted by application date.
pub fn extract_permits<R: Read>(reader: R) -> Result<Vec<PermitRecord>, EtlError> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut all = Vec::new();
    for row in csv_reader.deserialize::<RawPermitRow>() {
        let row = row.context("parsing raw report row")?;
        all.push(row.into_record());
    }
    let total = all.len();

    let mut district: Vec<PermitRecord> = all
        .into_iter()
        .filter(|record| {
            record
                .facility_owner
                .as_deref()
                .is_some_and(is_district_owner)
                || record
                    .facility_owner_address
                    .as_deref()
                    .is_some_and(is_district_address)
        })
        .filter(|record| {
            record
                .application_date
                .is_some_and(|d| d >= application_cutoff())
        })
        .collect();
    district.sort_by(|a, b| {
        (a.application_date, &a.permit_number).cmp(&(b.application_date, &b.permit_number))
    });

    info!(total, district = district.len(), "extracted school district permits");
    Ok(district)
}

pub fn extract_permits_from_path(path: &Path) -> Result<Vec<PermitRecord>, EtlError> {
    let file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    extract_permits(file)
}

/// The most recently modified `Citizen*.csv` export under the raw data
/// directory; the default input of a full rebuild.
pub fn latest_raw_report(raw_dir: &Path) -> Result<PathBuf, EtlError> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    let entries = std::fs::read_dir(raw_dir)
        .with_context(|| format!("reading {}", raw_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {}", raw_dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("Citizen") || !name.ends_with(".csv") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if newest.as_ref().map_or(true, |(ts, _)| modified > *ts) {
            newest = Some((modified, entry.path()));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| EtlError::MissingRawReport(raw_dir.to_path_buf()))
}

// ---------------------------------------------------------------------------
// School registry

#[derive(Debug, Deserialize)]
struct RawSchoolRow {
    #[serde(rename = "ULCS Code", default)]
    ulcs_code: String,
    #[serde(rename = "Publication Name", default)]
    school_name: String,
    #[serde(rename = "School Level", default)]
    school_level: String,
    #[serde(rename = "GPS Location", default)]
    gps_location: String,
    #[serde(rename = "Street Address", default)]
    street_address: String,
    // The longitudinal list names its address column differently.
    #[serde(rename = "Current Year Address", default)]
    current_year_address: String,
    #[serde(rename = "Website", default)]
    website: String,
    #[serde(rename = "Abbreviated Name", default)]
    abbreviation: String,
    #[serde(rename = "Year Opened", default)]
    year_opened: String,
    #[serde(rename = "Year Closed", default)]
    year_closed: String,
}

fn split_gps(raw: &str) -> (Option<f64>, Option<f64>) {
    let mut parts = raw.split(',').map(str::trim);
    let lat = parts.next().and_then(|p| p.parse().ok());
    let lng = parts.next().and_then(|p| p.parse().ok());
    (lat, lng)
}

fn parse_year(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("open") {
        return None;
    }
    // Some snapshots carry years as floats ("2013.0").
    trimmed
        .parse::<i32>()
        .ok()
        .or_else(|| trimmed.parse::<f64>().ok().map(|y| y as i32))
}

fn contains_token(name: &str, token: &str) -> bool {
    name.split_whitespace().any(|word| word == token)
}

impl RawSchoolRow {
    fn into_record(self, snapshot_year: Option<String>) -> SchoolRecord {
        let (lat, lng) = split_gps(&self.gps_location);
        let address = opt(self.street_address).or_else(|| opt(self.current_year_address));
        SchoolRecord {
            ulcs_code: self.ulcs_code.trim().to_string(),
            school_name: self.school_name.trim().to_string(),
            school_level: SchoolLevel::parse(&self.school_level),
            school_address: address.unwrap_or_default(),
            school_abbreviation: opt(self.abbreviation).map(|a| a.to_ascii_lowercase()),
            school_website: opt(self.website),
            year_opened: parse_year(&self.year_opened),
            year_closed: parse_year(&self.year_closed),
            lat,
            lng,
            snapshot_year,
        }
    }
}

fn read_school_file(path: &Path, snapshot_year: Option<String>) -> Result<Vec<SchoolRecord>, EtlError> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut out = Vec::new();
    for row in reader.deserialize::<RawSchoolRow>() {
        let row = row.with_context(|| format!("parsing {}", path.display()))?;
        out.push(row.into_record(snapshot_year.clone()));
    }
    Ok(out)
}

/// Build the canonical school registry from the yearly snapshots (newest
/// first) plus the longitudinal list, deduplicated by (code, name).
pub fn load_school_registry(schools_dir: &Path) -> Result<Vec<SchoolRecord>, EtlError> {
    let mut yearly: Vec<PathBuf> = Vec::new();
    let mut legacy: Option<PathBuf> = None;
    let entries = std::fs::read_dir(schools_dir)
        .with_context(|| format!("reading {}", schools_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading {}", schools_dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".csv") {
            continue;
        }
        if name.starts_with('2') {
            yearly.push(entry.path());
        } else if name.to_ascii_lowercase().contains("longitudinal") {
            legacy = Some(entry.path());
        }
    }
    // Newest snapshot first so dedup keeps the most recent row.
    yearly.sort();
    yearly.reverse();

    let mut registry: Vec<SchoolRecord> = Vec::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut keep = |records: Vec<SchoolRecord>, registry: &mut Vec<SchoolRecord>| {
        for record in records {
            let key = (record.ulcs_code.clone(), record.school_name.clone());
            if seen.insert(key) {
                registry.push(record);
            }
        }
    };

    for path in &yearly {
        let snapshot_year = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.split_whitespace().next())
            .map(|y| y.trim_end_matches(".csv").to_string());
        keep(read_school_file(path, snapshot_year)?, &mut registry);
    }
    if let Some(path) = legacy {
        keep(read_school_file(&path, None)?, &mut registry);
    }

    let before = registry.len();
    registry.retain(|school| {
        !school.school_name.is_empty()
            && !school.school_address.is_empty()
            && !contains_token(&school.school_name, "EOP")
    });
    info!(
        schools = registry.len(),
        dropped = before - registry.len(),
        "loaded school registry"
    );
    Ok(registry)
}

// ---------------------------------------------------------------------------
// Matcher

#[derive(Debug, Clone)]
pub struct MatchedPermit {
    pub permit: PermitRecord,
    pub school: SchoolRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzyTier {
    Name,
    Abbreviation,
}

impl FuzzyTier {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Abbreviation => "abbrev",
        }
    }
}

/// One approximate match proposed for manual review. Never applied
/// automatically.
#[derive(Debug, Clone)]
pub struct FuzzyCandidate {
    pub permit_number: String,
    pub facility_name: String,
    pub facility_address: Option<String>,
    pub school_name: String,
    pub school_address: String,
    pub match_probability: f64,
    pub tier: FuzzyTier,
}

/// Matching either resolves every permit or stops the pipeline with
/// candidates for a human to confirm.
#[derive(Debug)]
pub enum MatchOutcome {
    Matched(Vec<MatchedPermit>),
    NeedsReview(Vec<FuzzyCandidate>),
}

fn facility_name_of(record: &PermitRecord) -> &str {
    record.facility_name.as_deref().unwrap_or("")
}

fn assert_unique_permits(matched: &[MatchedPermit]) -> Result<(), EtlError> {
    let mut seen = HashSet::new();
    for row in matched {
        if !seen.insert(row.permit.permit_number.as_str()) {
            return Err(EtlError::DuplicatePermit(row.permit.permit_number.clone()));
        }
    }
    Ok(())
}

enum CrosswalkPass {
    Complete(Vec<MatchedPermit>),
    Unresolved(Vec<PermitRecord>),
}

/// Join permits to the crosswalk. The pass is complete when every row that
/// missed the crosswalk is a known non-school facility (those rows are
/// dropped); otherwise all the missed rows are handed back for matching.
fn crosswalk_pass(
    permits: &[PermitRecord],
    schools_by_name: &HashMap<&str, &SchoolRecord>,
    crosswalk: &Crosswalk,
    known_missing: &KnownMissing,
) -> Result<CrosswalkPass, EtlError> {
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();
    for permit in permits {
        let facility = facility_name_of(permit);
        match crosswalk.get(facility) {
            Some(school_name) => {
                let school = schools_by_name.get(school_name).ok_or_else(|| {
                    EtlError::CrosswalkSchoolUnknown {
                        facility: facility.to_string(),
                        school: school_name.to_string(),
                    }
                })?;
                matched.push(MatchedPermit {
                    permit: permit.clone(),
                    school: (*school).clone(),
                });
            }
            None => unmatched.push(permit.clone()),
        }
    }

    let unknown = unmatched
        .iter()
        .filter(|permit| !known_missing.contains(facility_name_of(permit)))
        .count();
    if unknown == 0 {
        info!("all facilities match the existing crosswalk");
        Ok(CrosswalkPass::Complete(matched))
    } else {
        info!(unknown, "facilities missing from the crosswalk; matching against the school list");
        Ok(CrosswalkPass::Unresolved(unmatched))
    }
}

struct CleanPermit {
    permit: PermitRecord,
    name_clean: String,
    address_clean: Option<String>,
}

struct CleanSchool {
    school: SchoolRecord,
    name_clean: String,
    address_clean: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExactTier {
    NameVsName,
    NameVsAbbreviation,
    AddressVsAddress,
}

const EXACT_TIERS: [ExactTier; 3] = [
    ExactTier::NameVsName,
    ExactTier::NameVsAbbreviation,
    ExactTier::AddressVsAddress,
];

fn tier_school_key(tier: ExactTier, school: &CleanSchool) -> Option<&str> {
    match tier {
        ExactTier::NameVsName => Some(school.name_clean.as_str()),
        ExactTier::NameVsAbbreviation => school.school.school_abbreviation.as_deref(),
        ExactTier::AddressVsAddress => Some(school.address_clean.as_str()),
    }
}

fn tier_permit_key(tier: ExactTier, permit: &CleanPermit) -> Option<&str> {
    match tier {
        ExactTier::NameVsName | ExactTier::NameVsAbbreviation => {
            Some(permit.name_clean.as_str())
        }
        ExactTier::AddressVsAddress => permit.address_clean.as_deref(),
    }
}

/// Reconcile permits against the school registry: crosswalk first, then the
/// exact tiers, then (only as a last resort) fuzzy candidates for review.
/// Newly confirmed exact pairs are appended to the crosswalk and flushed
/// before re-entering the crosswalk pass.
pub fn match_permits(
    permits: &[PermitRecord],
    schools: &[SchoolRecord],
    crosswalk: &mut Crosswalk,
    known_missing: &KnownMissing,
) -> Result<MatchOutcome, EtlError> {
    let mut schools_by_name: HashMap<&str, &SchoolRecord> = HashMap::new();
    for school in schools {
        schools_by_name
            .entry(school.school_name.as_str())
            .or_insert(school);
    }

    let pending = match crosswalk_pass(permits, &schools_by_name, crosswalk, known_missing)? {
        CrosswalkPass::Complete(matched) => {
            assert_unique_permits(&matched)?;
            return Ok(MatchOutcome::Matched(matched));
        }
        CrosswalkPass::Unresolved(pending) => pending,
    };

    let mut pending: Vec<CleanPermit> = pending
        .into_iter()
        .map(|permit| CleanPermit {
            name_clean: clean_facility_name(facility_name_of(&permit)),
            address_clean: permit.facility_address.as_deref().map(clean_address),
            permit,
        })
        .collect();

    // One row per cleaned (name, address), matching the registry dedup the
    // exact tiers join against.
    let mut clean_schools: Vec<CleanSchool> = Vec::new();
    let mut seen_clean: HashSet<(String, String)> = HashSet::new();
    for school in schools {
        let name_clean = clean_facility_name(&school.school_name);
        let address_clean = clean_address(&school.school_address);
        if seen_clean.insert((name_clean.clone(), address_clean.clone())) {
            clean_schools.push(CleanSchool {
                school: school.clone(),
                name_clean,
                address_clean,
            });
        }
    }

    let mut exact: Vec<(PermitRecord, SchoolRecord)> = Vec::new();
    for tier in EXACT_TIERS {
        let mut lookup: HashMap<&str, &CleanSchool> = HashMap::new();
        for school in &clean_schools {
            if let Some(key) = tier_school_key(tier, school) {
                if !key.is_empty() {
                    lookup.entry(key).or_insert(school);
                }
            }
        }

        let mut still_pending = Vec::new();
        for permit in pending {
            let hit = tier_permit_key(tier, &permit)
                .filter(|key| !key.is_empty())
                .and_then(|key| lookup.get(key));
            match hit {
                Some(school) => exact.push((permit.permit, school.school.clone())),
                None => still_pending.push(permit),
            }
        }
        pending = still_pending;
    }

    pending.retain(|permit| !known_missing.contains(facility_name_of(&permit.permit)));

    if pending.is_empty() {
        info!(pairs = exact.len(), "all entries have exact matches");
        let mut added = 0;
        for (permit, school) in &exact {
            let facility = facility_name_of(permit).to_string();
            if !facility.is_empty()
                && crosswalk.insert(facility, school.school_name.clone())
            {
                added += 1;
            }
        }
        if added > 0 {
            info!(added, "crosswalk grew with newly confirmed pairs");
        }
        // Confirmed progress survives even if a later stage fails.
        crosswalk.flush()?;

        return match crosswalk_pass(permits, &schools_by_name, crosswalk, known_missing)? {
            CrosswalkPass::Complete(matched) => {
                assert_unique_permits(&matched)?;
                Ok(MatchOutcome::Matched(matched))
            }
            CrosswalkPass::Unresolved(_) => Err(EtlError::CrosswalkDivergence),
        };
    }

    info!(
        unmatched = pending.len(),
        "entries without exact matches; proposing fuzzy candidates"
    );
    Ok(MatchOutcome::NeedsReview(fuzzy_candidates(
        &pending,
        &clean_schools,
    )))
}

fn best_fuzzy_for(
    permit: &CleanPermit,
    schools: &[CleanSchool],
    tier: FuzzyTier,
) -> Option<FuzzyCandidate> {
    let mut best: Option<(f64, &CleanSchool)> = None;
    for school in schools {
        let target = match tier {
            FuzzyTier::Name => Some(school.name_clean.as_str()),
            FuzzyTier::Abbreviation => school.school.school_abbreviation.as_deref(),
        };
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            continue;
        };
        let score = jaro_winkler(&permit.name_clean, target) * 100.0;
        if score < FUZZY_SCORE_CUTOFF {
            continue;
        }
        let replace = match &best {
            None => true,
            Some((best_score, best_school)) => {
                score > *best_score
                    || (score == *best_score
                        && school.school.school_name < best_school.school.school_name)
            }
        };
        if replace {
            best = Some((score, school));
        }
    }
    best.map(|(score, school)| FuzzyCandidate {
        permit_number: permit.permit.permit_number.clone(),
        facility_name: facility_name_of(&permit.permit).to_string(),
        facility_address: permit.permit.facility_address.clone(),
        school_name: school.school.school_name.clone(),
        school_address: school.school.school_address.clone(),
        match_probability: score,
        tier,
    })
}

/// The single best candidate per permit across the name and abbreviation
/// passes, ordered by descending confidence for the review report.
fn fuzzy_candidates(pending: &[CleanPermit], schools: &[CleanSchool]) -> Vec<FuzzyCandidate> {
    let mut candidates = Vec::new();
    for permit in pending {
        let by_name = best_fuzzy_for(permit, schools, FuzzyTier::Name);
        let by_abbreviation = best_fuzzy_for(permit, schools, FuzzyTier::Abbreviation);
        let best = match (by_name, by_abbreviation) {
            (Some(a), Some(b)) => {
                if b.match_probability > a.match_probability
                    || (b.match_probability == a.match_probability
                        && b.school_name < a.school_name)
                {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (a, b) => a.or(b),
        };
        if let Some(candidate) = best {
            candidates.push(candidate);
        }
    }
    candidates.sort_by(|a, b| {
        b.match_probability
            .partial_cmp(&a.match_probability)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.facility_name.cmp(&b.facility_name))
    });
    candidates
}

/// Run the matcher; on a fuzzy outcome, persist the review report and fail
/// so a human can promote confirmed pairs before the next run.
pub fn resolve_matches(
    permits: &[PermitRecord],
    schools: &[SchoolRecord],
    crosswalk: &mut Crosswalk,
    known_missing: &KnownMissing,
    review_report: &Path,
) -> Result<Vec<MatchedPermit>, EtlError> {
    match match_permits(permits, schools, crosswalk, known_missing)? {
        MatchOutcome::Matched(matched) => Ok(matched),
        MatchOutcome::NeedsReview(candidates) => {
            let rows: Vec<ReviewRow> = candidates
                .iter()
                .map(|candidate| ReviewRow {
                    facility_name: candidate.facility_name.clone(),
                    school_name: candidate.school_name.clone(),
                    facility_address: candidate.facility_address.clone(),
                    school_address: candidate.school_address.clone(),
                    match_probability: candidate.match_probability,
                    match_tier: candidate.tier.as_str().to_string(),
                })
                .collect();
            write_review_report(review_report, &rows)?;
            Err(EtlError::FuzzyReviewRequired {
                count: candidates.len(),
                report: review_report.to_path_buf(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Geocoding stage

#[derive(Debug, Default)]
pub struct GeocodeOutcome {
    pub cache_hits: usize,
    pub resolved: usize,
    pub unresolved: usize,
}

fn apply_cached_geocodes(permits: &mut [PermitRecord], cache: &GeocodeCache) -> usize {
    let mut hits = 0;
    for permit in permits.iter_mut() {
        if permit.geocoded() {
            continue;
        }
        let Some(address) = permit.facility_address.as_deref() else {
            continue;
        };
        if let Some(point) = cache.get(address) {
            permit.lat = Some(point.lat);
            permit.lng = Some(point.lng);
            hits += 1;
        }
    }
    hits
}

/// Fill coordinates from the cache, then ask the geocoding service once per
/// unique still-missing address. New coordinates are flushed to the cache
/// and the remaining failures are written to the missing report before the
/// stage fails (unless the caller opted to proceed for inspection).
pub async fn geocode_permits(
    permits: &mut [PermitRecord],
    cache: &mut GeocodeCache,
    geocoder: &dyn Geocoder,
    missing_report: &Path,
    allow_unresolved: bool,
) -> Result<GeocodeOutcome, EtlError> {
    let cache_hits = apply_cached_geocodes(permits, cache);

    let missing: BTreeSet<String> = permits
        .iter()
        .filter(|permit| !permit.geocoded())
        .filter_map(|permit| permit.facility_address.clone())
        .collect();
    if missing.is_empty() {
        info!(cache_hits, "no new addresses to geocode");
        return Ok(GeocodeOutcome {
            cache_hits,
            ..Default::default()
        });
    }

    info!(addresses = missing.len(), "geocoding unique addresses");
    let mut unresolved = Vec::new();
    let mut resolved = 0;
    for address in &missing {
        match geocoder.geocode(address).await? {
            Some(point) => {
                cache.insert(address.clone(), point);
                resolved += 1;
            }
            None => unresolved.push(address.clone()),
        }
    }
    info!(resolved, unresolved = unresolved.len(), "geocoding round finished");

    apply_cached_geocodes(permits, cache);
    // Successful lookups are kept even if we abort below.
    cache.flush()?;
    write_missing_geocodes(missing_report, &unresolved)?;

    if !unresolved.is_empty() && !allow_unresolved {
        return Err(EtlError::UnresolvedGeocodes {
            count: unresolved.len(),
            report: missing_report.to_path_buf(),
        });
    }

    Ok(GeocodeOutcome {
        cache_hits,
        resolved,
        unresolved: unresolved.len(),
    })
}

// ---------------------------------------------------------------------------
// Transformer

fn canonical_school_points(matched: &[MatchedPermit]) -> BTreeMap<String, GeoPoint> {
    let mut canonical: BTreeMap<String, GeoPoint> = BTreeMap::new();
    for row in matched {
        let (Some(lat), Some(lng)) = (row.permit.lat, row.permit.lng) else {
            continue;
        };
        let point = GeoPoint { lat, lng };
        match canonical.get(&row.school.school_name) {
            None => {
                canonical.insert(row.school.school_name.clone(), point);
            }
            Some(existing) => {
                let spread = state_plane::distance_feet(*existing, point);
                if spread > COORDINATE_SPREAD_LIMIT_FEET {
                    warn!(
                        school = %row.school.school_name,
                        spread_feet = spread as i64,
                        "permit coordinates disagree; keeping the first point"
                    );
                }
            }
        }
    }
    canonical
}

fn to_dashboard_row(
    row: &MatchedPermit,
    point: Option<GeoPoint>,
    permit_url: Option<String>,
) -> DashboardPermit {
    let permit = &row.permit;
    let school = &row.school;
    DashboardPermit {
        permit_number: permit.permit_number.clone(),
        work_description: permit.work_description.clone(),
        applicant: permit.applicant.clone(),
        status: permit.status.clone(),
        application_date: permit.application_date,
        work_start: permit.work_start,
        complete_date: permit.complete_date,
        project_type: permit.project_type.clone(),
        operation_type: permit.operation_type.clone(),
        facility_name: permit.facility_name.clone(),
        linear_ft_friable: permit.linear_ft_friable,
        square_ft_friable: permit.square_ft_friable,
        cubic_ft_friable: permit.cubic_ft_friable,
        linear_ft_nonfriable: permit.linear_ft_nonfriable,
        square_ft_nonfriable: permit.square_ft_nonfriable,
        cubic_ft_nonfriable: permit.cubic_ft_nonfriable,
        friable_acm: permit.friable_acm.clone(),
        facility_address: permit.facility_address.clone(),
        project_length: project_length_days(permit.work_start, permit.complete_date),
        school_name: school.display_name(),
        school_level: school.school_level,
        school_address: Some(school.school_address.clone()),
        school_website: school.school_website.clone(),
        year_opened: school.year_opened,
        year_closed: school.year_closed,
        permit_url,
        lat: point.map(|p| p.lat),
        lng: point.map(|p| p.lng),
    }
}

/// Resolve detail URLs for every row that still lacks one, extend the cache
/// with the new answers, and fill the rows back in from the cache.
pub async fn update_permit_urls(
    rows: &mut [DashboardPermit],
    cache: &mut PermitUrlCache,
    resolver: &dyn PermitUrlResolver,
) -> Result<usize, EtlError> {
    let missing: BTreeSet<String> = rows
        .iter()
        .filter(|row| row.permit_url.is_none() && !cache.contains(&row.permit_number))
        .map(|row| row.permit_number.clone())
        .collect();

    if !missing.is_empty() {
        info!(permits = missing.len(), "scraping permit detail URLs");
        for permit_number in &missing {
            match resolver.resolve(permit_number).await? {
                Some(url) => {
                    cache.insert_new(permit_number.clone(), url);
                }
                None => warn!(permit_number = %permit_number, "portal search returned no detail link"),
            }
        }
        cache.flush()?;
    }

    let mut filled = 0;
    for row in rows.iter_mut() {
        if row.permit_url.is_none() {
            if let Some(url) = cache.get(&row.permit_number) {
                row.permit_url = Some(url.to_string());
                filled += 1;
            }
        }
    }
    Ok(filled)
}

/// Turn geocoded permits into published dashboard rows: match them to
/// schools, canonicalize one point per school, mark closed schools, and
/// merge detail URLs.
pub async fn transform(
    permits: Vec<PermitRecord>,
    schools: &[SchoolRecord],
    crosswalk: &mut Crosswalk,
    known_missing: &KnownMissing,
    url_cache: &mut PermitUrlCache,
    url_resolver: &dyn PermitUrlResolver,
    review_report: &Path,
) -> Result<Vec<DashboardPermit>, EtlError> {
    let matched = resolve_matches(&permits, schools, crosswalk, known_missing, review_report)?;
    let canonical = canonical_school_points(&matched);

    let mut rows: Vec<DashboardPermit> = matched
        .iter()
        .map(|row| {
            let point = canonical.get(&row.school.school_name).copied();
            let url = url_cache.get(&row.permit.permit_number).map(String::from);
            to_dashboard_row(row, point, url)
        })
        .collect();

    update_permit_urls(&mut rows, url_cache, url_resolver).await?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Incremental updater

/// Split freshly scraped permits into rows that refresh an already-published
/// permit and rows that are genuinely new.
pub fn split_new_permits(
    published: &[DashboardPermit],
    scraped: Vec<PermitRecord>,
) -> (Vec<PermitRecord>, Vec<PermitRecord>) {
    let known: HashSet<&str> = published
        .iter()
        .map(|row| row.permit_number.as_str())
        .collect();
    scraped
        .into_iter()
        .partition(|record| known.contains(record.permit_number.as_str()))
}

fn overwrite_shared_fields(row: &mut DashboardPermit, fresh: &PermitRecord) {
    row.work_description = fresh.work_description.clone();
    row.applicant = fresh.applicant.clone();
    row.status = fresh.status.clone();
    row.application_date = fresh.application_date;
    row.work_start = fresh.work_start;
    row.complete_date = fresh.complete_date;
    row.project_type = fresh.project_type.clone();
    row.operation_type = fresh.operation_type.clone();
    row.facility_name = fresh.facility_name.clone();
    row.linear_ft_friable = fresh.linear_ft_friable;
    row.square_ft_friable = fresh.square_ft_friable;
    row.cubic_ft_friable = fresh.cubic_ft_friable;
    row.linear_ft_nonfriable = fresh.linear_ft_nonfriable;
    row.square_ft_nonfriable = fresh.square_ft_nonfriable;
    row.cubic_ft_nonfriable = fresh.cubic_ft_nonfriable;
    row.friable_acm = fresh.friable_acm.clone();
    row.facility_address = fresh.facility_address.clone();
    // Derived from the overwritten dates, so it has to move with them.
    row.project_length = project_length_days(fresh.work_start, fresh.complete_date);
}

/// Overwrite the mutable fields of already-published rows with the freshly
/// scraped values; the portal is authoritative for status and dates.
pub fn refresh_existing(published: &mut [DashboardPermit], overlap: &[PermitRecord]) -> usize {
    let mut by_number: HashMap<&str, &PermitRecord> = HashMap::new();
    for record in overlap {
        by_number.insert(record.permit_number.as_str(), record);
    }
    let mut refreshed = 0;
    for row in published.iter_mut() {
        if let Some(fresh) = by_number.get(row.permit_number.as_str()) {
            overwrite_shared_fields(row, fresh);
            refreshed += 1;
        }
    }
    refreshed
}

/// Union the refreshed old rows with the transformed new rows, enforcing the
/// updater post-conditions: count adds up and no permit number repeats.
pub fn merged_output(
    published: Vec<DashboardPermit>,
    appended: Vec<DashboardPermit>,
) -> Result<Vec<DashboardPermit>, EtlError> {
    let expected = published.len() + appended.len();
    let mut out = published;
    out.extend(appended);

    let mut seen = HashSet::new();
    for row in &out {
        if !seen.insert(row.permit_number.as_str()) {
            return Err(EtlError::DuplicatePermit(row.permit_number.clone()));
        }
    }
    debug_assert_eq!(out.len(), expected);
    Ok(out)
}

// ---------------------------------------------------------------------------
// GeoJSON + publishing

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointGeometry {
    #[serde(rename = "type")]
    pub geometry_type: String,
    /// `[lng, lat]`, GeoJSON axis order.
    pub coordinates: [f64; 2],
}

impl PointGeometry {
    fn new(point: GeoPoint) -> Self {
        Self {
            geometry_type: "Point".to_string(),
            coordinates: [point.lng, point.lat],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature<P> {
    #[serde(rename = "type")]
    pub feature_type: String,
    pub geometry: Option<PointGeometry>,
    pub properties: P,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCollection<P> {
    #[serde(rename = "type")]
    pub collection_type: String,
    pub features: Vec<Feature<P>>,
}

impl<P> FeatureCollection<P> {
    fn new(features: Vec<Feature<P>>) -> Self {
        Self {
            collection_type: "FeatureCollection".to_string(),
            features,
        }
    }
}

/// The five school columns published in the schools dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchoolProperties {
    pub school_name: String,
    pub school_level: Option<SchoolLevel>,
    pub school_website: Option<String>,
    pub school_address: Option<String>,
    pub year_opened: Option<i32>,
}

fn permit_feature(row: &DashboardPermit) -> Result<Feature<JsonValue>, EtlError> {
    let geometry = match (row.lat, row.lng) {
        (Some(lat), Some(lng)) => Some(PointGeometry::new(GeoPoint { lat, lng })),
        _ => None,
    };
    let mut properties = serde_json::to_value(row)?;
    if let Some(map) = properties.as_object_mut() {
        map.remove("lat");
        map.remove("lng");
    }
    Ok(Feature {
        feature_type: "Feature".to_string(),
        geometry,
        properties,
    })
}

/// Permit rows as the locally published GeoJSON collection.
pub fn permits_feature_collection(
    rows: &[DashboardPermit],
) -> Result<FeatureCollection<JsonValue>, EtlError> {
    let features = rows.iter().map(permit_feature).collect::<Result<_, _>>()?;
    Ok(FeatureCollection::new(features))
}

/// Parse a previously published permits collection back into rows; this is
/// the input of the incremental update.
pub fn permits_from_feature_collection(
    collection: FeatureCollection<JsonValue>,
) -> Result<Vec<DashboardPermit>, EtlError> {
    let mut rows = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let mut properties = feature.properties;
        if let (Some(map), Some(geometry)) = (properties.as_object_mut(), &feature.geometry) {
            map.insert("lng".to_string(), geometry.coordinates[0].into());
            map.insert("lat".to_string(), geometry.coordinates[1].into());
        }
        rows.push(serde_json::from_value(properties)?);
    }
    Ok(rows)
}

/// One feature per (school name, address) pair seen in the permit rows.
pub fn schools_feature_collection(
    rows: &[DashboardPermit],
) -> FeatureCollection<SchoolProperties> {
    let mut seen = HashSet::new();
    let mut features = Vec::new();
    for row in rows {
        let key = (row.school_name.clone(), row.school_address.clone());
        if !seen.insert(key) {
            continue;
        }
        let geometry = match (row.lat, row.lng) {
            (Some(lat), Some(lng)) => Some(PointGeometry::new(GeoPoint { lat, lng })),
            _ => None,
        };
        features.push(Feature {
            feature_type: "Feature".to_string(),
            geometry,
            properties: SchoolProperties {
                school_name: row.school_name.clone(),
                school_level: row.school_level,
                school_website: row.school_website.clone(),
                school_address: row.school_address.clone(),
                year_opened: row.year_opened,
            },
        });
    }
    FeatureCollection::new(features)
}

/// Permit rows as the flat JSON array uploaded for the dashboard: no
/// geometry, no school columns beyond name and level.
pub fn permits_public_json(rows: &[DashboardPermit]) -> Result<Vec<JsonValue>, EtlError> {
    rows.iter()
        .map(|row| {
            let mut value = serde_json::to_value(row)?;
            if let Some(map) = value.as_object_mut() {
                for dropped in ["lat", "lng", "school_website", "school_address", "year_opened"] {
                    map.remove(dropped);
                }
            }
            Ok(value)
        })
        .collect()
}

async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<(), EtlError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Read the previously published permits dataset.
pub fn read_published_permits(path: &Path) -> Result<Vec<DashboardPermit>, EtlError> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let collection: FeatureCollection<JsonValue> = serde_json::from_str(&text)?;
    permits_from_feature_collection(collection)
}

// ---------------------------------------------------------------------------
// Orchestration

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub permits_published: usize,
    pub schools_published: usize,
    pub refreshed: usize,
    pub appended: usize,
}

/// The interim caches a run reads and extends.
pub struct InterimStores {
    pub geocodes: GeocodeCache,
    pub crosswalk: Crosswalk,
    pub known_missing: KnownMissing,
    pub permit_urls: PermitUrlCache,
}

impl InterimStores {
    pub fn open(config: &EtlConfig) -> Result<Self, EtlError> {
        let mut geocodes = GeocodeCache::open(config.geocode_cache_path())
            .context("opening geocode cache")?;
        let manual = config.manual_geocode_path();
        if manual.exists() {
            let added = geocodes.merge_file(&manual).context("merging manual geocodes")?;
            info!(added, "merged manually geocoded addresses");
        }
        Ok(Self {
            geocodes,
            crosswalk: Crosswalk::open(config.crosswalk_path()).context("opening crosswalk")?,
            known_missing: KnownMissing::open(config.known_missing_path())
                .context("opening known-missing list")?,
            permit_urls: PermitUrlCache::open(config.permit_url_cache_path())
                .context("opening permit URL cache")?,
        })
    }
}

/// The whole batch pipeline with its collaborators injected.
pub struct EtlPipeline {
    config: EtlConfig,
    stores: InterimStores,
    archive: RawReportArchive,
    geocoder: Box<dyn Geocoder>,
    reports: Box<dyn ReportSource>,
    permit_urls: Box<dyn PermitUrlResolver>,
    object_store: Box<dyn ObjectStore>,
}

impl EtlPipeline {
    pub fn new(
        config: EtlConfig,
        geocoder: Box<dyn Geocoder>,
        reports: Box<dyn ReportSource>,
        permit_urls: Box<dyn PermitUrlResolver>,
        object_store: Box<dyn ObjectStore>,
    ) -> Result<Self, EtlError> {
        let stores = InterimStores::open(&config)?;
        let archive = RawReportArchive::new(config.archive_dir());
        Ok(Self {
            config,
            stores,
            archive,
            geocoder,
            reports,
            permit_urls,
            object_store,
        })
    }

    async fn clean_and_transform(
        &mut self,
        mut permits: Vec<PermitRecord>,
        schools: &[SchoolRecord],
    ) -> Result<Vec<DashboardPermit>, EtlError> {
        geocode_permits(
            &mut permits,
            &mut self.stores.geocodes,
            self.geocoder.as_ref(),
            &self.config.missing_geocodes_path(),
            self.config.allow_unresolved_geocodes,
        )
        .await?;
        transform(
            permits,
            schools,
            &mut self.stores.crosswalk,
            &self.stores.known_missing,
            &mut self.stores.permit_urls,
            self.permit_urls.as_ref(),
            &self.config.review_report_path(),
        )
        .await
    }

    async fn publish(&self, rows: &[DashboardPermit]) -> Result<usize, EtlError> {
        let permits = permits_feature_collection(rows)?;
        write_json_file(&self.config.permits_geojson_path(), &permits).await?;

        let schools = schools_feature_collection(rows);
        write_json_file(&self.config.schools_geojson_path(), &schools).await?;

        self.object_store
            .put(
                PERMITS_OBJECT_KEY,
                serde_json::to_vec(&permits_public_json(rows)?)?,
                "application/json",
            )
            .await?;
        self.object_store
            .put(
                SCHOOLS_OBJECT_KEY,
                serde_json::to_vec(&schools)?,
                "application/json",
            )
            .await?;
        Ok(schools.features.len())
    }

    /// Full rebuild from a raw export file.
    pub async fn run_etl(&mut self, raw_file: Option<PathBuf>) -> Result<RunSummary, EtlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let raw_path = match raw_file {
            Some(path) => path,
            None => latest_raw_report(&self.config.raw_dir())?,
        };
        info!(run_id = %run_id, raw = %raw_path.display(), "starting full rebuild");

        let permits = extract_permits_from_path(&raw_path)?;
        let schools = load_school_registry(&self.config.schools_dir())?;
        let rows = self.clean_and_transform(permits, &schools).await?;
        let schools_published = self.publish(&rows).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            permits_published: rows.len(),
            schools_published,
            refreshed: 0,
            appended: rows.len(),
        })
    }

    /// Incremental daily run over a lookback window.
    pub async fn run_update(&mut self) -> Result<RunSummary, EtlError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, ndays = self.config.lookback_days, "starting incremental update");

        let mut published = read_published_permits(&self.config.permits_geojson_path())?;

        let window = ReportWindow::lookback(self.config.lookback_days);
        let raw = self.reports.fetch_report(window).await?;
        let archived = self.archive.store_bytes(Utc::now(), "csv", &raw).await?;
        info!(
            report = %archived.relative_path.display(),
            deduplicated = archived.deduplicated,
            "archived raw report"
        );

        let scraped = extract_permits(raw.as_slice())?;
        let (overlap, fresh) = split_new_permits(&published, scraped);
        let refreshed = refresh_existing(&mut published, &overlap);

        let appended_rows = if fresh.is_empty() {
            info!("no new permits found");
            Vec::new()
        } else {
            info!(new = fresh.len(), "new permits found; cleaning");
            let schools = load_school_registry(&self.config.schools_dir())?;
            self.clean_and_transform(fresh, &schools).await?
        };
        let appended = appended_rows.len();

        let mut rows = merged_output(published, appended_rows)?;
        update_permit_urls(&mut rows, &mut self.stores.permit_urls, self.permit_urls.as_ref())
            .await?;
        let schools_published = self.publish(&rows).await?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            permits_published: rows.len(),
            schools_published,
            refreshed,
            appended,
        })
    }
}
