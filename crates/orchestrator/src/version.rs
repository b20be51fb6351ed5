//! Browser/driver version resolution.
//!
//! The deployment layer installs exactly one browser binary and one or more
//! driver builds; this module discovers what is actually on disk and picks a
//! pair the compatibility rule blesses. Resolution happens once per process,
//! before any session is launched, and its result is immutable.
//!
//! Compatibility rule, in order:
//! 1. known-good allow-list pairs (binary major -> driver major)
//! 2. same-major fallback
//! 3. newest installed driver, only when `allow_latest_fallback` is set

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::ResolutionError;

/// Dotted browser/driver version, e.g. `130.0.6723.116`. Missing trailing
/// fields parse as zero, so `114` and `114.0.0.0` compare equal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BrowserVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub patch: u32,
}

impl BrowserVersion {
    pub const fn new(major: u32, minor: u32, build: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            build,
            patch,
        }
    }

    /// Lenient parse of a dotted version embedded in arbitrary text, e.g.
    /// `Google Chrome 130.0.6723.116` or `ChromeDriver 114.0.5735.90 (...)`.
    pub fn parse(text: &str) -> Option<Self> {
        let token = text
            .split_whitespace()
            .find(|t| t.contains('.') && t.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .or_else(|| {
                text.split_whitespace()
                    .find(|t| t.chars().all(|c| c.is_ascii_digit()) && !t.is_empty())
            })?;
        let mut parts = token
            .trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u32>());
        let major = parts.next()?.ok()?;
        let mut rest = [0u32; 3];
        for slot in rest.iter_mut() {
            match parts.next() {
                Some(Ok(n)) => *slot = n,
                Some(Err(_)) => break,
                None => break,
            }
        }
        Some(Self::new(major, rest[0], rest[1], rest[2]))
    }
}

impl std::fmt::Display for BrowserVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.patch
        )
    }
}

/// The resolved runtime pair. Created once by [`VersionResolver::resolve`],
/// immutable for the rest of the process lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserTarget {
    pub binary_version: BrowserVersion,
    pub driver_version: BrowserVersion,
    pub binary_path: PathBuf,
    pub driver_path: PathBuf,
}

/// One known-good pairing of binary major to driver major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatPair {
    pub binary_major: u32,
    pub driver_major: u32,
}

/// Allow-list of vendor-blessed cross-version pairs. Same-major pairs do not
/// need an entry; the table exists for the exceptions.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityTable {
    pairs: Vec<CompatPair>,
}

impl CompatibilityTable {
    pub fn new(pairs: Vec<CompatPair>) -> Self {
        Self { pairs }
    }

    /// Driver majors the table blesses for the given binary major.
    fn listed_for(&self, binary_major: u32) -> impl Iterator<Item = u32> + '_ {
        self.pairs
            .iter()
            .filter(move |p| p.binary_major == binary_major)
            .map(|p| p.driver_major)
    }
}

#[derive(Debug, Clone)]
pub struct InstalledBinary {
    pub path: PathBuf,
    pub version: BrowserVersion,
}

#[derive(Debug, Clone)]
pub struct InstalledDriver {
    pub path: PathBuf,
    pub version: BrowserVersion,
}

/// What discovery found on disk. Pure data, so resolution is testable
/// without touching the filesystem.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub binary: Option<InstalledBinary>,
    pub drivers: Vec<InstalledDriver>,
    /// How many binary locations were probed, for the error message.
    pub searched: usize,
}

/// Probe the configured locations for the installed binary and drivers.
pub async fn discover(config: &OrchestratorConfig) -> Inventory {
    let mut inventory = Inventory {
        searched: config.browser_paths.len(),
        ..Inventory::default()
    };

    for path in &config.browser_paths {
        if !path.exists() {
            continue;
        }
        if let Some(version) = probe_version(path).await {
            info!(path = %path.display(), %version, "browser binary found");
            inventory.binary = Some(InstalledBinary {
                path: path.clone(),
                version,
            });
            break;
        }
        warn!(path = %path.display(), "binary exists but did not report a version");
    }

    for location in &config.driver_paths {
        for path in expand_driver_location(location) {
            if let Some(version) = probe_version(&path).await {
                debug!(path = %path.display(), %version, "driver found");
                inventory.drivers.push(InstalledDriver { path, version });
            }
        }
    }

    inventory
}

/// A driver location may be a single executable or a directory holding
/// several pinned builds (`chromedriver`, `chromedriver-114`, ...).
fn expand_driver_location(location: &Path) -> Vec<PathBuf> {
    if location.is_dir() {
        let mut found = Vec::new();
        if let Ok(entries) = std::fs::read_dir(location) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with("chromedriver") {
                    found.push(entry.path());
                }
            }
        }
        found.sort();
        found
    } else if location.exists() {
        vec![location.to_path_buf()]
    } else {
        Vec::new()
    }
}

/// Run `<path> --version` and parse the reported version.
async fn probe_version(path: &Path) -> Option<BrowserVersion> {
    let output = Command::new(path).arg("--version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    BrowserVersion::parse(&String::from_utf8_lossy(&output.stdout))
}

/// Picks a compatible {binary, driver} pair, or fails terminally.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    table: CompatibilityTable,
    allow_latest_fallback: bool,
}

impl VersionResolver {
    pub fn new(table: CompatibilityTable, allow_latest_fallback: bool) -> Self {
        Self {
            table,
            allow_latest_fallback,
        }
    }

    /// The single resolved target: the head of the candidate order.
    pub fn resolve(&self, inventory: &Inventory) -> Result<BrowserTarget, ResolutionError> {
        let binary = inventory
            .binary
            .as_ref()
            .ok_or(ResolutionError::NoBinaryFound {
                searched: inventory.searched,
            })?;
        self.candidates(inventory, None)
            .into_iter()
            .next()
            .ok_or(ResolutionError::NoCompatibleDriver {
                binary_version: binary.version,
            })
    }

    /// Every rule-satisfying pair, in fallback order: allow-listed pairs,
    /// then same-major, then (if enabled) the newest installed driver. A
    /// caller preference for a driver major is sorted to the front - the
    /// explicit override wins over the system default.
    pub fn candidates(
        &self,
        inventory: &Inventory,
        preferred_driver_major: Option<u32>,
    ) -> Vec<BrowserTarget> {
        let Some(binary) = inventory.binary.as_ref() else {
            return Vec::new();
        };

        let mut drivers: Vec<&InstalledDriver> = inventory.drivers.iter().collect();
        drivers.sort_by(|a, b| b.version.cmp(&a.version));

        // Dedup by driver path; the first tier that claims a driver wins.
        let listed: Vec<u32> = self.table.listed_for(binary.version.major).collect();
        let mut seen = std::collections::HashSet::new();
        let mut tiers: Vec<&InstalledDriver> = Vec::new();
        // Tier 1: allow-listed pairs for this binary major.
        for driver in drivers
            .iter()
            .copied()
            .filter(|d| listed.contains(&d.version.major))
        {
            if seen.insert(driver.path.clone()) {
                tiers.push(driver);
            }
        }
        // Tier 2: same major.
        for driver in drivers
            .iter()
            .copied()
            .filter(|d| d.version.major == binary.version.major)
        {
            if seen.insert(driver.path.clone()) {
                tiers.push(driver);
            }
        }
        // Tier 3: newest installed, opt-in only.
        if self.allow_latest_fallback {
            if let Some(driver) = drivers.first().copied() {
                if seen.insert(driver.path.clone()) {
                    tiers.push(driver);
                }
            }
        }

        if let Some(major) = preferred_driver_major {
            // Stable partition keeps tier order within each half.
            let (preferred, rest): (Vec<_>, Vec<_>) =
                tiers.into_iter().partition(|d| d.version.major == major);
            tiers = preferred.into_iter().chain(rest).collect();
        }

        tiers
            .into_iter()
            .map(|driver| BrowserTarget {
                binary_version: binary.version,
                driver_version: driver.version,
                binary_path: binary.path.clone(),
                driver_path: driver.path.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(version: &str) -> InstalledBinary {
        InstalledBinary {
            path: PathBuf::from("/usr/bin/google-chrome"),
            version: BrowserVersion::parse(version).unwrap(),
        }
    }

    fn driver(name: &str, version: &str) -> InstalledDriver {
        InstalledDriver {
            path: PathBuf::from(format!("/usr/local/bin/{name}")),
            version: BrowserVersion::parse(version).unwrap(),
        }
    }

    #[test]
    fn parses_vendor_banners() {
        assert_eq!(
            BrowserVersion::parse("Google Chrome 130.0.6723.116"),
            Some(BrowserVersion::new(130, 0, 6723, 116))
        );
        assert_eq!(
            BrowserVersion::parse("ChromeDriver 114.0.5735.90 (386bc09e8f4f2e025eddae123f36f6263096ae49)"),
            Some(BrowserVersion::new(114, 0, 5735, 90))
        );
        assert_eq!(
            BrowserVersion::parse("Chromium 114.0"),
            Some(BrowserVersion::new(114, 0, 0, 0))
        );
        assert_eq!(BrowserVersion::parse("no version here"), None);
    }

    #[test]
    fn version_ordering() {
        let older = BrowserVersion::new(114, 0, 5735, 90);
        let newer = BrowserVersion::new(130, 0, 6723, 116);
        assert!(older < newer);
        assert_eq!(older, BrowserVersion::parse("114.0.5735.90").unwrap());
    }

    #[test]
    fn same_major_resolves_without_table_entry() {
        let inventory = Inventory {
            binary: Some(binary("130.0.6723.116")),
            drivers: vec![
                driver("chromedriver-114", "114.0.5735.90"),
                driver("chromedriver-130", "130.0.6723.69"),
            ],
            searched: 1,
        };
        let resolver = VersionResolver::new(CompatibilityTable::default(), false);
        let target = resolver.resolve(&inventory).unwrap();
        assert_eq!(target.driver_version.major, 130);
    }

    #[test]
    fn allow_list_outranks_same_major() {
        let inventory = Inventory {
            binary: Some(binary("130.0.6723.116")),
            drivers: vec![
                driver("chromedriver-130", "130.0.6723.69"),
                driver("chromedriver-114", "114.0.5735.90"),
            ],
            searched: 1,
        };
        let table = CompatibilityTable::new(vec![CompatPair {
            binary_major: 130,
            driver_major: 114,
        }]);
        let resolver = VersionResolver::new(table, false);
        let candidates = resolver.candidates(&inventory, None);
        assert_eq!(candidates[0].driver_version.major, 114);
        assert_eq!(candidates[1].driver_version.major, 130);
    }

    #[test]
    fn drifted_binary_with_stale_driver_fails() {
        // The motivating incident: the binary drifted to 130 while only a
        // 114 driver is installed, and nothing blesses that pair.
        let inventory = Inventory {
            binary: Some(binary("130.0.6723.116")),
            drivers: vec![driver("chromedriver", "114.0.5735.90")],
            searched: 1,
        };
        let resolver = VersionResolver::new(CompatibilityTable::default(), false);
        match resolver.resolve(&inventory) {
            Err(ResolutionError::NoCompatibleDriver { binary_version }) => {
                assert_eq!(binary_version.major, 130);
            }
            other => panic!("expected NoCompatibleDriver, got {other:?}"),
        }
    }

    #[test]
    fn latest_fallback_is_opt_in() {
        let inventory = Inventory {
            binary: Some(binary("130.0.6723.116")),
            drivers: vec![driver("chromedriver", "114.0.5735.90")],
            searched: 1,
        };
        let resolver = VersionResolver::new(CompatibilityTable::default(), true);
        let target = resolver.resolve(&inventory).unwrap();
        assert_eq!(target.driver_version.major, 114);
    }

    #[test]
    fn missing_binary_is_terminal() {
        let inventory = Inventory {
            searched: 4,
            ..Inventory::default()
        };
        let resolver = VersionResolver::new(CompatibilityTable::default(), true);
        match resolver.resolve(&inventory) {
            Err(ResolutionError::NoBinaryFound { searched }) => assert_eq!(searched, 4),
            other => panic!("expected NoBinaryFound, got {other:?}"),
        }
    }

    #[test]
    fn preferred_major_sorts_first() {
        let inventory = Inventory {
            binary: Some(binary("130.0.6723.116")),
            drivers: vec![
                driver("chromedriver-130", "130.0.6723.69"),
                driver("chromedriver-114", "114.0.5735.90"),
            ],
            searched: 1,
        };
        let table = CompatibilityTable::new(vec![CompatPair {
            binary_major: 130,
            driver_major: 114,
        }]);
        let resolver = VersionResolver::new(table, false);
        let candidates = resolver.candidates(&inventory, Some(130));
        assert_eq!(candidates[0].driver_version.major, 130);
    }
}
