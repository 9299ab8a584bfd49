//! Core domain model for the asbestos permit dashboard pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "apd-core";

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// School level as published by the district school lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchoolLevel {
    Elementary,
    Middle,
    High,
    ElementaryMiddle,
}

impl SchoolLevel {
    /// Parse the level strings found in the yearly snapshots. The snapshots
    /// are inconsistent about hyphenation ("elementarymiddle" vs.
    /// "elementary-middle") and casing.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match key.as_str() {
            "elementary" => Some(Self::Elementary),
            "middle" => Some(Self::Middle),
            "high" => Some(Self::High),
            "elementarymiddle" => Some(Self::ElementaryMiddle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elementary => "elementary",
            Self::Middle => "middle",
            Self::High => "high",
            Self::ElementaryMiddle => "elementary-middle",
        }
    }
}

/// Serde helper for the fixed `%m-%d-%Y` date format used across the raw
/// report, interim files and published datasets.
pub mod mdy_date {
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%m-%d-%Y";

    pub fn serialize<S>(date: &Option<NaiveDate>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => ser.serialize_str(&d.format(FORMAT).to_string()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(de)?;
        match raw.as_deref() {
            Some(s) if !s.trim().is_empty() => NaiveDate::parse_from_str(s.trim(), FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Parse a date cell from the raw portal export. The portal is not
/// consistent about formats and sometimes appends a time component.
pub fn parse_report_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    const DATE_FORMATS: [&str; 3] = ["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d"];
    const DATETIME_FORMATS: [&str; 4] = [
        "%m/%d/%Y %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%m-%d-%Y %H:%M",
    ];
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// One abatement permit as extracted from the portal report, carrying its
/// geocode once the geocoding stage has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PermitRecord {
    pub permit_number: String,
    pub work_description: Option<String>,
    pub subtype: Option<String>,
    pub applicant: Option<String>,
    pub status: Option<String>,
    pub facility_address: Option<String>,
    #[serde(with = "mdy_date", default)]
    pub application_date: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub approval_date: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub expiration_date: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub work_start: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub complete_date: Option<NaiveDate>,
    pub notification_type: Option<String>,
    pub asbestos_inspector: Option<String>,
    pub project_type: Option<String>,
    pub operation_type: Option<String>,
    pub facility_name: Option<String>,
    pub facility_owner: Option<String>,
    pub facility_owner_address: Option<String>,
    pub abatement_contractor: Option<String>,
    pub demo_contractor: Option<String>,
    pub asbestos_investigator: Option<String>,
    pub asbestos_present: Option<String>,
    pub linear_ft_friable: Option<f64>,
    pub square_ft_friable: Option<f64>,
    pub cubic_ft_friable: Option<f64>,
    pub linear_ft_nonfriable: Option<f64>,
    pub square_ft_nonfriable: Option<f64>,
    pub cubic_ft_nonfriable: Option<f64>,
    pub friable_acm: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl PermitRecord {
    pub fn geocoded(&self) -> bool {
        self.lat.is_some() && self.lng.is_some()
    }
}

/// One school from the canonical registry built out of the yearly district
/// snapshots plus the longitudinal list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SchoolRecord {
    pub ulcs_code: String,
    pub school_name: String,
    pub school_level: Option<SchoolLevel>,
    pub school_address: String,
    pub school_abbreviation: Option<String>,
    pub school_website: Option<String>,
    pub year_opened: Option<i32>,
    pub year_closed: Option<i32>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub snapshot_year: Option<String>,
}

impl SchoolRecord {
    pub fn is_closed(&self) -> bool {
        self.year_closed.is_some()
    }

    /// Name shown on the dashboard; closed schools get a marker suffix.
    pub fn display_name(&self) -> String {
        if self.is_closed() {
            format!("{} (Closed)", self.school_name)
        } else {
            self.school_name.clone()
        }
    }
}

/// The published permit row: matched, geocoded, trimmed to the dashboard
/// schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DashboardPermit {
    pub permit_number: String,
    pub work_description: Option<String>,
    pub applicant: Option<String>,
    pub status: Option<String>,
    #[serde(with = "mdy_date", default)]
    pub application_date: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub work_start: Option<NaiveDate>,
    #[serde(with = "mdy_date", default)]
    pub complete_date: Option<NaiveDate>,
    pub project_type: Option<String>,
    pub operation_type: Option<String>,
    pub facility_name: Option<String>,
    pub linear_ft_friable: Option<f64>,
    pub square_ft_friable: Option<f64>,
    pub cubic_ft_friable: Option<f64>,
    pub linear_ft_nonfriable: Option<f64>,
    pub square_ft_nonfriable: Option<f64>,
    pub cubic_ft_nonfriable: Option<f64>,
    pub friable_acm: Option<String>,
    pub facility_address: Option<String>,
    pub project_length: Option<f64>,
    pub school_name: String,
    pub school_level: Option<SchoolLevel>,
    pub school_address: Option<String>,
    pub school_website: Option<String>,
    pub year_opened: Option<i32>,
    pub year_closed: Option<i32>,
    pub permit_url: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

/// Days between work start and completion, fractional.
pub fn project_length_days(work_start: Option<NaiveDate>, complete: Option<NaiveDate>) -> Option<f64> {
    let (start, end) = (work_start?, complete?);
    Some((end - start).num_seconds() as f64 / 86_400.0)
}

const NAME_ABBREVIATIONS: &[(&str, &str)] = &[
    ("es", "elementary school"),
    ("ms", "middle school"),
    ("hs", "high school"),
    ("sch", "school"),
    ("elem", "elementary"),
];

const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
    ("st", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("rd", "road"),
    ("blvd", "boulevard"),
    ("ln", "lane"),
    ("dr", "drive"),
    ("pk", "pike"),
    ("pkwy", "parkway"),
];

/// Lowercase, strip punctuation to spaces, collapse whitespace.
pub fn squash(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn expand_tokens(input: &str, table: &[(&str, &str)]) -> String {
    input
        .split_whitespace()
        .map(|token| {
            table
                .iter()
                .find(|(abbrev, _)| *abbrev == token)
                .map(|(_, full)| *full)
                .unwrap_or(token)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Matching-side normalization of a facility or school name. Never used for
/// display.
pub fn clean_facility_name(raw: &str) -> String {
    expand_tokens(&squash(raw), NAME_ABBREVIATIONS)
}

/// Matching-side normalization of a street address.
pub fn clean_address(raw: &str) -> String {
    expand_tokens(&squash(raw), STREET_ABBREVIATIONS)
}

/// EPSG:4326 <-> EPSG:2272 (NAD83 / Pennsylvania South, US survey feet).
///
/// Lambert conformal conic, two standard parallels, GRS80 ellipsoid. WGS84 is
/// the storage and display CRS; the state plane is only used for spatial
/// computation (distances in feet).
pub mod state_plane {
    const A: f64 = 6_378_137.0;
    const F: f64 = 1.0 / 298.257_222_101;
    // Zone 3702 parameters: standard parallels 39d56' and 40d58', origin
    // 39d20'N 77d45'W, false easting 600 000 m.
    const PHI_1: f64 = 39.0 + 56.0 / 60.0;
    const PHI_2: f64 = 40.0 + 58.0 / 60.0;
    const PHI_F: f64 = 39.0 + 20.0 / 60.0;
    const LAMBDA_F: f64 = -(77.0 + 45.0 / 60.0);
    const FALSE_EASTING_M: f64 = 600_000.0;
    const M_PER_US_FOOT: f64 = 1_200.0 / 3_937.0;

    fn e() -> f64 {
        (2.0 * F - F * F).sqrt()
    }

    fn m(phi: f64) -> f64 {
        let e = e();
        phi.cos() / (1.0 - e * e * phi.sin().powi(2)).sqrt()
    }

    fn t(phi: f64) -> f64 {
        let e = e();
        let esin = e * phi.sin();
        (std::f64::consts::FRAC_PI_4 - phi / 2.0).tan()
            / ((1.0 - esin) / (1.0 + esin)).powf(e / 2.0)
    }

    fn constants() -> (f64, f64, f64) {
        let phi1 = PHI_1.to_radians();
        let phi2 = PHI_2.to_radians();
        let phi_f = PHI_F.to_radians();
        let n = (m(phi1).ln() - m(phi2).ln()) / (t(phi1).ln() - t(phi2).ln());
        let big_f = m(phi1) / (n * t(phi1).powf(n));
        let r_f = A * big_f * t(phi_f).powf(n);
        (n, big_f, r_f)
    }

    /// Project a WGS84 point to state-plane (easting, northing) in US survey
    /// feet.
    pub fn from_wgs84(lng: f64, lat: f64) -> (f64, f64) {
        let (n, big_f, r_f) = constants();
        let phi = lat.to_radians();
        let r = A * big_f * t(phi).powf(n);
        let theta = n * (lng - LAMBDA_F).to_radians();
        let easting = FALSE_EASTING_M + r * theta.sin();
        let northing = r_f - r * theta.cos();
        (easting / M_PER_US_FOOT, northing / M_PER_US_FOOT)
    }

    /// Invert a state-plane (easting, northing) in US survey feet back to a
    /// WGS84 (lng, lat) pair.
    pub fn to_wgs84(easting: f64, northing: f64) -> (f64, f64) {
        let (n, big_f, r_f) = constants();
        let e = e();
        let x = easting * M_PER_US_FOOT - FALSE_EASTING_M;
        let y = r_f - northing * M_PER_US_FOOT;
        let r = (x * x + y * y).sqrt() * n.signum();
        let t_prime = (r / (A * big_f)).powf(1.0 / n);
        let theta = x.atan2(y);
        let lng = (theta / n).to_degrees() + LAMBDA_F;

        let mut phi = std::f64::consts::FRAC_PI_2 - 2.0 * t_prime.atan();
        for _ in 0..8 {
            let esin = e * phi.sin();
            phi = std::f64::consts::FRAC_PI_2
                - 2.0 * (t_prime * ((1.0 - esin) / (1.0 + esin)).powf(e / 2.0)).atan();
        }
        (lng, phi.to_degrees())
    }

    /// Straight-line distance in feet between two WGS84 points, computed on
    /// the state plane.
    pub fn distance_feet(a: super::GeoPoint, b: super::GeoPoint) -> f64 {
        let (ax, ay) = from_wgs84(a.lng, a.lat);
        let (bx, by) = from_wgs84(b.lng, b.lat);
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn school_level_parsing_handles_snapshot_variants() {
        assert_eq!(SchoolLevel::parse("Elementary"), Some(SchoolLevel::Elementary));
        assert_eq!(
            SchoolLevel::parse("elementarymiddle"),
            Some(SchoolLevel::ElementaryMiddle)
        );
        assert_eq!(
            SchoolLevel::parse("Elementary-Middle"),
            Some(SchoolLevel::ElementaryMiddle)
        );
        assert_eq!(SchoolLevel::parse("charter"), None);
        assert_eq!(SchoolLevel::ElementaryMiddle.as_str(), "elementary-middle");
    }

    #[test]
    fn report_dates_parse_across_portal_formats() {
        let expected = NaiveDate::from_ymd_opt(2021, 4, 15).unwrap();
        assert_eq!(parse_report_date("04/15/2021"), Some(expected));
        assert_eq!(parse_report_date("04-15-2021"), Some(expected));
        assert_eq!(parse_report_date("2021-04-15"), Some(expected));
        assert_eq!(parse_report_date("04/15/2021 13:30"), Some(expected));
        assert_eq!(parse_report_date("  "), None);
        assert_eq!(parse_report_date("not a date"), None);
    }

    #[test]
    fn cleaned_addresses_match_across_abbreviation_styles() {
        assert_eq!(
            clean_address("440 N Broad St"),
            clean_address("440 North Broad Street")
        );
        assert_eq!(clean_address("440 N. Broad St."), "440 north broad street");
    }

    #[test]
    fn cleaned_names_expand_school_abbreviations() {
        assert_eq!(clean_facility_name("Meredith ES"), "meredith elementary school");
        assert_eq!(clean_facility_name("Central H.S."), "central h s");
        assert_eq!(clean_facility_name("Bartram HS"), "bartram high school");
        assert_eq!(clean_facility_name("Penn Alexander Sch"), "penn alexander school");
    }

    #[test]
    fn project_length_is_days_between_start_and_completion() {
        let start = NaiveDate::from_ymd_opt(2021, 6, 1);
        let end = NaiveDate::from_ymd_opt(2021, 6, 11);
        assert_eq!(project_length_days(start, end), Some(10.0));
        assert_eq!(project_length_days(start, None), None);
        assert_eq!(project_length_days(None, end), None);
    }

    #[test]
    fn closed_school_display_name_is_suffixed() {
        let open = SchoolRecord {
            school_name: "Meredith".into(),
            ..Default::default()
        };
        let closed = SchoolRecord {
            school_name: "Ada Lewis".into(),
            year_closed: Some(2013),
            ..Default::default()
        };
        assert_eq!(open.display_name(), "Meredith");
        assert_eq!(closed.display_name(), "Ada Lewis (Closed)");
    }

    #[test]
    fn state_plane_origin_maps_to_false_easting() {
        let (easting, northing) = state_plane::from_wgs84(-77.75, 39.0 + 20.0 / 60.0);
        assert!((easting - 600_000.0 * 3_937.0 / 1_200.0).abs() < 1e-3);
        assert!(northing.abs() < 1e-3);
    }

    #[test]
    fn state_plane_round_trips_philadelphia() {
        // City Hall.
        let (lng, lat) = (-75.1636, 39.9524);
        let (e, n) = state_plane::from_wgs84(lng, lat);
        let (lng2, lat2) = state_plane::to_wgs84(e, n);
        assert!((lng - lng2).abs() < 1e-9, "lng {lng} vs {lng2}");
        assert!((lat - lat2).abs() < 1e-9, "lat {lat} vs {lat2}");
    }

    #[test]
    fn state_plane_distances_are_plausible() {
        // Two points ~0.01 deg of latitude apart: about 3640 ft.
        let a = GeoPoint { lat: 39.95, lng: -75.16 };
        let b = GeoPoint { lat: 39.96, lng: -75.16 };
        let d = state_plane::distance_feet(a, b);
        assert!((3_300.0..4_000.0).contains(&d), "distance {d}");
    }

    #[test]
    fn permit_dates_serialize_in_fixed_format() {
        let record = PermitRecord {
            permit_number: "A1".into(),
            application_date: NaiveDate::from_ymd_opt(2021, 4, 15),
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["application_date"], "04-15-2021");
        let back: PermitRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.application_date, record.application_date);
    }
}
