//! Geographic Region Classification
//!
//! Maps coordinates and timezone identifiers onto a fixed catalogue of coarse
//! regions, each with a reference coordinate, and measures great-circle distance
//! between regions. The catalogue carries one `Unknown` sentinel which is never
//! returned by nearest-region matching.
//!
//! Timezone classification is an ordered list of rules evaluated first match
//! wins. Specific rules (a list of South American cities under `america/`)
//! precede the broad rules they specialise (`america/` as a whole).

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Mean Earth radius in kilometers (IUGG)
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

/// Largest possible great-circle distance on Earth
pub const MAX_DISTANCE_KM: f64 = std::f64::consts::PI * EARTH_RADIUS_KM;

/// Region catalogue errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    /// Catalogue has no region eligible for nearest matching
    #[error("Region catalogue has no non-sentinel regions")]
    EmptyCatalogue,

    /// Same region id listed twice
    #[error("Duplicate region id: {0}")]
    DuplicateRegion(RegionId),

    /// Name matches no region id
    #[error("Unknown region: {0}")]
    UnknownRegion(String),
}

/// Coarse geographic region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegionId {
    /// Eastern North America
    NorthAmericaEast,
    /// Western North America
    NorthAmericaWest,
    /// South America
    SouthAmerica,
    /// Western and central Europe
    EuropeWest,
    /// Eastern Europe
    EuropeEast,
    /// Africa
    Africa,
    /// Middle East
    MiddleEast,
    /// South and central Asia
    SouthAsia,
    /// East Asia
    EastAsia,
    /// Southeast Asia
    SoutheastAsia,
    /// Australia and the Pacific
    Oceania,
    /// Sentinel for "could not classify"
    Unknown,
}

impl RegionId {
    /// Every region id, sentinel last
    pub const ALL: [RegionId; 12] = [
        RegionId::NorthAmericaEast,
        RegionId::NorthAmericaWest,
        RegionId::SouthAmerica,
        RegionId::EuropeWest,
        RegionId::EuropeEast,
        RegionId::Africa,
        RegionId::MiddleEast,
        RegionId::SouthAsia,
        RegionId::EastAsia,
        RegionId::SoutheastAsia,
        RegionId::Oceania,
        RegionId::Unknown,
    ];

    /// Whether this is the unknown sentinel
    #[must_use]
    pub fn is_unknown(self) -> bool {
        self == RegionId::Unknown
    }

    /// Stable wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RegionId::NorthAmericaEast => "north-america-east",
            RegionId::NorthAmericaWest => "north-america-west",
            RegionId::SouthAmerica => "south-america",
            RegionId::EuropeWest => "europe-west",
            RegionId::EuropeEast => "europe-east",
            RegionId::Africa => "africa",
            RegionId::MiddleEast => "middle-east",
            RegionId::SouthAsia => "south-asia",
            RegionId::EastAsia => "east-asia",
            RegionId::SoutheastAsia => "southeast-asia",
            RegionId::Oceania => "oceania",
            RegionId::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegionId {
    type Err = RegionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegionId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RegionError::UnknownRegion(s.to_string()))
    }
}

/// Latitude/longitude in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude, -90..=90
    pub lat: f64,
    /// Longitude, -180..=180
    pub lng: f64,
}

impl Coordinate {
    /// Create a coordinate
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance between two coordinates (haversine)
#[must_use]
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Catalogue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Region identifier
    pub id: RegionId,
    /// Human-readable name
    pub name: Cow<'static, str>,
    /// Reference latitude
    pub lat: f64,
    /// Reference longitude
    pub lng: f64,
}

impl Region {
    const fn fixed(id: RegionId, name: &'static str, lat: f64, lng: f64) -> Self {
        Self {
            id,
            name: Cow::Borrowed(name),
            lat,
            lng,
        }
    }

    /// Reference coordinate
    #[must_use]
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    /// Great-circle distance between reference points
    #[must_use]
    pub fn distance_km(&self, other: &Region) -> f64 {
        haversine_km(self.coordinate(), other.coordinate())
    }
}

/// The unknown sentinel
pub static UNKNOWN_REGION: Region = Region::fixed(RegionId::Unknown, "Unknown", 0.0, 0.0);

const DEFAULT_REGIONS: [Region; 12] = [
    Region::fixed(RegionId::NorthAmericaEast, "North America (East)", 38.9, -77.0),
    Region::fixed(RegionId::NorthAmericaWest, "North America (West)", 37.4, -122.1),
    Region::fixed(RegionId::SouthAmerica, "South America", -23.5, -46.6),
    Region::fixed(RegionId::EuropeWest, "Europe (West)", 50.1, 8.7),
    Region::fixed(RegionId::EuropeEast, "Europe (East)", 52.2, 21.0),
    Region::fixed(RegionId::Africa, "Africa", -26.2, 28.0),
    Region::fixed(RegionId::MiddleEast, "Middle East", 25.2, 55.3),
    Region::fixed(RegionId::SouthAsia, "South Asia", 19.1, 72.9),
    Region::fixed(RegionId::EastAsia, "East Asia", 35.7, 139.7),
    Region::fixed(RegionId::SoutheastAsia, "Southeast Asia", 1.35, 103.8),
    Region::fixed(RegionId::Oceania, "Oceania", -33.9, 151.2),
    Region::fixed(RegionId::Unknown, "Unknown", 0.0, 0.0),
];

/// Fixed set of regions with nearest-match and timezone lookup
#[derive(Debug, Clone)]
pub struct RegionCatalogue {
    regions: Vec<Region>,
    timezone_rules: TimezoneRules,
}

impl Default for RegionCatalogue {
    fn default() -> Self {
        Self {
            regions: DEFAULT_REGIONS.to_vec(),
            timezone_rules: TimezoneRules::default(),
        }
    }
}

impl RegionCatalogue {
    /// Build a catalogue from an explicit region list
    ///
    /// Order is significant: nearest-match ties go to the earlier entry.
    ///
    /// # Errors
    ///
    /// Returns an error if ids repeat or no non-sentinel region is present.
    pub fn new(regions: Vec<Region>, timezone_rules: TimezoneRules) -> Result<Self, RegionError> {
        let mut seen = HashSet::new();
        for region in &regions {
            if !seen.insert(region.id) {
                return Err(RegionError::DuplicateRegion(region.id));
            }
        }
        if regions.iter().all(|r| r.id.is_unknown()) {
            return Err(RegionError::EmptyCatalogue);
        }
        Ok(Self {
            regions,
            timezone_rules,
        })
    }

    /// All regions, sentinel included, in catalogue order
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Look up a region by id; the sentinel is always resolvable
    #[must_use]
    pub fn get(&self, id: RegionId) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| r.id == id)
            .or_else(|| id.is_unknown().then_some(&UNKNOWN_REGION))
    }

    /// Region whose reference point is nearest to `coordinate`
    ///
    /// The sentinel never matches. Ties resolve to the first region in
    /// catalogue order.
    #[must_use]
    pub fn region_for_coordinate(&self, coordinate: Coordinate) -> &Region {
        let mut best: Option<(&Region, f64)> = None;
        for region in self.regions.iter().filter(|r| !r.id.is_unknown()) {
            let distance = haversine_km(coordinate, region.coordinate());
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((region, distance)),
            }
        }
        // new() guarantees at least one candidate
        best.map_or(&UNKNOWN_REGION, |(region, _)| region)
    }

    /// Region for a timezone identifier such as `Asia/Tokyo`
    ///
    /// Returns `None` when no rule matches; callers pick their own fallback.
    #[must_use]
    pub fn region_for_timezone(&self, timezone: &str) -> Option<&Region> {
        self.timezone_rules
            .classify(timezone)
            .and_then(|id| self.get(id))
    }

    /// Distance between two regions for proximity ranking
    ///
    /// `None` if either side is the sentinel or not in the catalogue.
    #[must_use]
    pub fn proximity_km(&self, a: RegionId, b: RegionId) -> Option<f64> {
        if a.is_unknown() || b.is_unknown() {
            return None;
        }
        Some(self.get(a)?.distance_km(self.get(b)?))
    }
}

/// How a rule matches a lowercase timezone identifier
#[derive(Debug, Clone)]
pub enum TimezonePattern {
    /// Identifier starts with the prefix
    Prefix(&'static str),
    /// Identifier equals one of the listed names
    Exact(&'static [&'static str]),
    /// Identifier is `prefix` followed by one of the cities, optionally with
    /// further `/`-separated components (`america/argentina/cordoba`)
    City {
        /// Area prefix including the trailing slash
        prefix: &'static str,
        /// City components
        cities: &'static [&'static str],
    },
}

impl TimezonePattern {
    /// Whether the (already lowercased) identifier matches
    #[must_use]
    pub fn matches(&self, timezone: &str) -> bool {
        match self {
            TimezonePattern::Prefix(prefix) => timezone.starts_with(prefix),
            TimezonePattern::Exact(names) => names.contains(&timezone),
            TimezonePattern::City { prefix, cities } => {
                let Some(rest) = timezone.strip_prefix(prefix) else {
                    return false;
                };
                cities.iter().any(|city| {
                    rest.strip_prefix(city)
                        .is_some_and(|tail| tail.is_empty() || tail.starts_with('/'))
                })
            }
        }
    }
}

/// A (pattern, region) pair
#[derive(Debug, Clone)]
pub struct TimezoneRule {
    /// Matching predicate
    pub pattern: TimezonePattern,
    /// Region returned on match
    pub region: RegionId,
}

impl TimezoneRule {
    /// Create a rule
    #[must_use]
    pub const fn new(pattern: TimezonePattern, region: RegionId) -> Self {
        Self { pattern, region }
    }
}

/// Ordered timezone rules, first match wins
#[derive(Debug, Clone)]
pub struct TimezoneRules {
    rules: Vec<TimezoneRule>,
}

const SOUTH_AMERICA_CITIES: &[&str] = &[
    "sao_paulo",
    "buenos_aires",
    "argentina",
    "santiago",
    "lima",
    "bogota",
    "caracas",
    "montevideo",
    "la_paz",
    "asuncion",
    "guayaquil",
    "recife",
    "fortaleza",
    "manaus",
    "belem",
    "bahia",
    "cayenne",
    "paramaribo",
    "punta_arenas",
];

const NORTH_AMERICA_WEST_CITIES: &[&str] = &[
    "los_angeles",
    "vancouver",
    "tijuana",
    "denver",
    "phoenix",
    "boise",
    "edmonton",
    "anchorage",
    "juneau",
    "whitehorse",
];

const EAST_ASIA_CITIES: &[&str] = &[
    "tokyo",
    "seoul",
    "shanghai",
    "hong_kong",
    "taipei",
    "chongqing",
    "harbin",
    "macau",
    "pyongyang",
    "ulaanbaatar",
];

const SOUTHEAST_ASIA_CITIES: &[&str] = &[
    "singapore",
    "bangkok",
    "jakarta",
    "manila",
    "kuala_lumpur",
    "ho_chi_minh",
    "saigon",
    "yangon",
    "phnom_penh",
    "vientiane",
    "makassar",
    "brunei",
];

const MIDDLE_EAST_CITIES: &[&str] = &[
    "dubai",
    "riyadh",
    "tehran",
    "jerusalem",
    "tel_aviv",
    "baghdad",
    "qatar",
    "kuwait",
    "beirut",
    "amman",
    "damascus",
    "muscat",
    "bahrain",
];

const EUROPE_EAST_CITIES: &[&str] = &[
    "moscow",
    "kiev",
    "kyiv",
    "warsaw",
    "bucharest",
    "istanbul",
    "minsk",
    "helsinki",
    "athens",
    "sofia",
    "riga",
    "vilnius",
    "tallinn",
    "budapest",
    "chisinau",
];

const OCEANIA_PACIFIC_CITIES: &[&str] = &["auckland", "fiji", "guam", "port_moresby", "noumea"];

impl Default for TimezoneRules {
    fn default() -> Self {
        use RegionId::*;
        use TimezonePattern::*;

        Self::new(vec![
            TimezoneRule::new(
                City {
                    prefix: "america/",
                    cities: SOUTH_AMERICA_CITIES,
                },
                SouthAmerica,
            ),
            TimezoneRule::new(Prefix("brazil/"), SouthAmerica),
            TimezoneRule::new(Prefix("chile/"), SouthAmerica),
            TimezoneRule::new(
                City {
                    prefix: "america/",
                    cities: NORTH_AMERICA_WEST_CITIES,
                },
                NorthAmericaWest,
            ),
            TimezoneRule::new(
                Exact(&["us/pacific", "us/mountain", "us/arizona", "us/alaska", "canada/pacific"]),
                NorthAmericaWest,
            ),
            TimezoneRule::new(Prefix("america/"), NorthAmericaEast),
            TimezoneRule::new(Prefix("us/"), NorthAmericaEast),
            TimezoneRule::new(Prefix("canada/"), NorthAmericaEast),
            TimezoneRule::new(
                City {
                    prefix: "asia/",
                    cities: EAST_ASIA_CITIES,
                },
                EastAsia,
            ),
            TimezoneRule::new(Exact(&["japan", "rok", "prc", "hongkong", "roc"]), EastAsia),
            TimezoneRule::new(
                City {
                    prefix: "asia/",
                    cities: SOUTHEAST_ASIA_CITIES,
                },
                SoutheastAsia,
            ),
            TimezoneRule::new(
                City {
                    prefix: "asia/",
                    cities: MIDDLE_EAST_CITIES,
                },
                MiddleEast,
            ),
            TimezoneRule::new(Prefix("asia/"), SouthAsia),
            TimezoneRule::new(
                City {
                    prefix: "europe/",
                    cities: EUROPE_EAST_CITIES,
                },
                EuropeEast,
            ),
            TimezoneRule::new(Prefix("europe/"), EuropeWest),
            TimezoneRule::new(Prefix("africa/"), Africa),
            TimezoneRule::new(Prefix("australia/"), Oceania),
            TimezoneRule::new(
                City {
                    prefix: "pacific/",
                    cities: OCEANIA_PACIFIC_CITIES,
                },
                Oceania,
            ),
            TimezoneRule::new(Exact(&["nz"]), Oceania),
        ])
    }
}

impl TimezoneRules {
    /// Build from an ordered rule list
    #[must_use]
    pub fn new(rules: Vec<TimezoneRule>) -> Self {
        Self { rules }
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[TimezoneRule] {
        &self.rules
    }

    /// Region of the first matching rule
    #[must_use]
    pub fn classify(&self, timezone: &str) -> Option<RegionId> {
        let timezone = timezone.trim().to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(&timezone))
            .map(|rule| rule.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_points_map_to_themselves() {
        let catalogue = RegionCatalogue::default();
        for region in catalogue.regions().iter().filter(|r| !r.id.is_unknown()) {
            let found = catalogue.region_for_coordinate(region.coordinate());
            assert_eq!(found.id, region.id);
        }
    }

    #[test]
    fn test_sentinel_never_matches_coordinate() {
        let catalogue = RegionCatalogue::default();
        // (0, 0) is the sentinel's own reference point
        let found = catalogue.region_for_coordinate(Coordinate::new(0.0, 0.0));
        assert!(!found.id.is_unknown());
    }

    #[test]
    fn test_known_cities() {
        let catalogue = RegionCatalogue::default();
        let paris = catalogue.region_for_coordinate(Coordinate::new(48.85, 2.35));
        assert_eq!(paris.id, RegionId::EuropeWest);
        let seattle = catalogue.region_for_coordinate(Coordinate::new(47.6, -122.3));
        assert_eq!(seattle.id, RegionId::NorthAmericaWest);
        let osaka = catalogue.region_for_coordinate(Coordinate::new(34.7, 135.5));
        assert_eq!(osaka.id, RegionId::EastAsia);
    }

    #[test]
    fn test_coordinate_tie_goes_to_first_entry() {
        let regions = vec![
            Region::fixed(RegionId::EuropeWest, "A", 0.0, 10.0),
            Region::fixed(RegionId::EuropeEast, "B", 0.0, -10.0),
        ];
        let catalogue = RegionCatalogue::new(regions, TimezoneRules::default()).unwrap();
        let found = catalogue.region_for_coordinate(Coordinate::new(0.0, 0.0));
        assert_eq!(found.id, RegionId::EuropeWest);
    }

    #[test]
    fn test_catalogue_validation() {
        assert_eq!(
            RegionCatalogue::new(vec![UNKNOWN_REGION.clone()], TimezoneRules::default()).unwrap_err(),
            RegionError::EmptyCatalogue
        );
        let dup = vec![
            Region::fixed(RegionId::Africa, "A", 0.0, 0.0),
            Region::fixed(RegionId::Africa, "B", 1.0, 1.0),
        ];
        assert_eq!(
            RegionCatalogue::new(dup, TimezoneRules::default()).unwrap_err(),
            RegionError::DuplicateRegion(RegionId::Africa)
        );
    }

    #[test]
    fn test_timezone_south_america_before_americas() {
        let catalogue = RegionCatalogue::default();
        for tz in [
            "America/Sao_Paulo",
            "America/Buenos_Aires",
            "America/Argentina/Cordoba",
            "America/Bogota",
            "america/lima",
        ] {
            let region = catalogue.region_for_timezone(tz).unwrap();
            assert_eq!(region.id, RegionId::SouthAmerica, "{tz}");
        }
        assert_eq!(
            catalogue.region_for_timezone("America/New_York").unwrap().id,
            RegionId::NorthAmericaEast
        );
        assert_eq!(
            catalogue.region_for_timezone("America/Los_Angeles").unwrap().id,
            RegionId::NorthAmericaWest
        );
    }

    #[test]
    fn test_timezone_east_asia_before_asia_catch_all() {
        let catalogue = RegionCatalogue::default();
        for tz in ["Asia/Tokyo", "Asia/Seoul", "Asia/Shanghai", "Asia/Hong_Kong"] {
            assert_eq!(
                catalogue.region_for_timezone(tz).unwrap().id,
                RegionId::EastAsia,
                "{tz}"
            );
        }
        assert_eq!(
            catalogue.region_for_timezone("Asia/Kolkata").unwrap().id,
            RegionId::SouthAsia
        );
        assert_eq!(
            catalogue.region_for_timezone("Asia/Singapore").unwrap().id,
            RegionId::SoutheastAsia
        );
        assert_eq!(
            catalogue.region_for_timezone("Asia/Dubai").unwrap().id,
            RegionId::MiddleEast
        );
    }

    #[test]
    fn test_timezone_city_prefix_is_component_aware() {
        // "lima" must not match "limassol"-style identifiers
        let pattern = TimezonePattern::City {
            prefix: "america/",
            cities: &["lima"],
        };
        assert!(pattern.matches("america/lima"));
        assert!(!pattern.matches("america/limassol"));
    }

    #[test]
    fn test_timezone_europe_and_others() {
        let catalogue = RegionCatalogue::default();
        assert_eq!(
            catalogue.region_for_timezone("Europe/Moscow").unwrap().id,
            RegionId::EuropeEast
        );
        assert_eq!(
            catalogue.region_for_timezone("Europe/Berlin").unwrap().id,
            RegionId::EuropeWest
        );
        assert_eq!(
            catalogue.region_for_timezone("Africa/Lagos").unwrap().id,
            RegionId::Africa
        );
        assert_eq!(
            catalogue.region_for_timezone("Australia/Sydney").unwrap().id,
            RegionId::Oceania
        );
        assert_eq!(
            catalogue.region_for_timezone("Pacific/Auckland").unwrap().id,
            RegionId::Oceania
        );
    }

    #[test]
    fn test_timezone_no_match() {
        let catalogue = RegionCatalogue::default();
        assert!(catalogue.region_for_timezone("UTC").is_none());
        assert!(catalogue.region_for_timezone("Etc/GMT+3").is_none());
        assert!(catalogue.region_for_timezone("").is_none());
    }

    #[test]
    fn test_proximity_excludes_sentinel() {
        let catalogue = RegionCatalogue::default();
        assert!(
            catalogue
                .proximity_km(RegionId::Unknown, RegionId::EuropeWest)
                .is_none()
        );
        let d = catalogue
            .proximity_km(RegionId::EuropeWest, RegionId::EastAsia)
            .unwrap();
        assert!(d > 8_000.0 && d < 10_000.0);
    }

    #[test]
    fn test_region_id_parse_and_display() {
        let id: RegionId = "east-asia".parse().unwrap();
        assert_eq!(id, RegionId::EastAsia);
        assert_eq!(id.to_string(), "east-asia");
        assert_eq!(
            "atlantis".parse::<RegionId>(),
            Err(RegionError::UnknownRegion("atlantis".to_string()))
        );
        assert_eq!("Europe-West".parse::<RegionId>(), Ok(RegionId::EuropeWest));
        for id in RegionId::ALL {
            assert_eq!(id.to_string().parse::<RegionId>(), Ok(id));
        }
    }

    fn coordinate_strategy() -> impl Strategy<Value = Coordinate> {
        (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lng)| Coordinate::new(lat, lng))
    }

    proptest! {
        #[test]
        fn prop_region_for_coordinate_is_nearest(c in coordinate_strategy()) {
            let catalogue = RegionCatalogue::default();
            let found = catalogue.region_for_coordinate(c);
            let found_distance = haversine_km(c, found.coordinate());
            prop_assert!(!found.id.is_unknown());
            for region in catalogue.regions().iter().filter(|r| !r.id.is_unknown()) {
                prop_assert!(found_distance <= haversine_km(c, region.coordinate()));
            }
        }

        #[test]
        fn prop_distance_symmetric(a in 0usize..12, b in 0usize..12) {
            let catalogue = RegionCatalogue::default();
            let (ra, rb) = (&catalogue.regions()[a], &catalogue.regions()[b]);
            prop_assert!((ra.distance_km(rb) - rb.distance_km(ra)).abs() < 1e-9);
            prop_assert!(ra.distance_km(ra).abs() < 1e-9);
            prop_assert!(ra.distance_km(rb) <= MAX_DISTANCE_KM + 1e-6);
        }
    }
}
