use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DEFAULT_SEG_ID_PAD, OUTPUT_FILE_NAME};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No {0} configured. Set it under [files] in the config file.")]
    MissingPath(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("No config directory available on this system")]
    NoConfigDir,
}

/// Application configuration loaded from TOML config file.
/// All fields have defaults, so the config file is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub files: FilesConfig,
    /// Catalogue column names.
    pub cat: CatColumns,
    pub catalogue: CatalogueConfig,
    pub grisms: GrismConfig,
    /// Passed through to the UI untouched.
    pub appearance: AppearanceConfig,
    pub lines: LinesConfig,
}

/// Input and output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub out_dir: String,
    pub extractions_dir: String,
    pub cat_path: String,
    pub cube_path: String,
    pub prep_dir: String,
    /// Sidecar cache directory. Empty → `<out_dir>/.temp`.
    pub temp_dir: String,
    /// Leave objects already present in the output table out of the worklist.
    pub skip_existing: bool,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            out_dir: String::new(),
            extractions_dir: String::new(),
            cat_path: String::new(),
            cube_path: String::new(),
            prep_dir: String::new(),
            temp_dir: String::new(),
            skip_existing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatColumns {
    pub id: String,
    /// Falls back to `id` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seg_id: Option<String>,
    pub ra: String,
    pub dec: String,
}

impl Default for CatColumns {
    fn default() -> Self {
        Self {
            id: "id".into(),
            seg_id: None,
            ra: "ra".into(),
            dec: "dec".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogueConfig {
    /// Zero-pad width of segmentation ids in extraction filenames.
    pub seg_id_length: usize,
    /// Upper bound on one walk of the extraction tree.
    pub scan_timeout_secs: u64,
}

impl Default for CatalogueConfig {
    fn default() -> Self {
        Self {
            seg_id_length: DEFAULT_SEG_ID_PAD,
            scan_timeout_secs: 600,
        }
    }
}

/// Filters (red, green, blue) and the two position angles of the programme.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrismConfig {
    #[serde(rename = "R")]
    pub r: String,
    #[serde(rename = "G")]
    pub g: String,
    #[serde(rename = "B")]
    pub b: String,
    #[serde(rename = "PA1")]
    pub pa1: f64,
    #[serde(rename = "PA2")]
    pub pa2: f64,
}

impl Default for GrismConfig {
    fn default() -> Self {
        Self {
            r: "F200W".into(),
            g: "F150W".into(),
            b: "F115W".into(),
            pa1: 72.0,
            pa2: 341.0,
        }
    }
}

impl GrismConfig {
    /// Filter names, bluest first.
    pub fn filters(&self) -> [&str; 3] {
        [&self.b, &self.g, &self.r]
    }

    /// Position angles as they appear in column names ("72.0", "341.0").
    pub fn position_angles(&self) -> [String; 2] {
        [format_pa(self.pa1), format_pa(self.pa2)]
    }
}

/// One grism/PA combination, e.g. `F115W,72.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BeamKey {
    pub filter: String,
    pub pa: String,
}

impl BeamKey {
    pub fn new(filter: impl Into<String>, pa: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            pa: pa.into(),
        }
    }
}

impl std::fmt::Display for BeamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.filter, self.pa)
    }
}

/// Render a position angle the way it appears in output column names:
/// integral angles keep one decimal place.
pub fn format_pa(pa: f64) -> String {
    if pa.fract() == 0.0 {
        format!("{pa:.1}")
    } else {
        format!("{pa}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppearanceConfig {
    /// System (default), light, or dark.
    pub appearance_mode: String,
    pub theme: String,
}

impl Default for AppearanceConfig {
    fn default() -> Self {
        Self {
            appearance_mode: "system".into(),
            theme: "blue".into(),
        }
    }
}

/// A reference spectral line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineConfig {
    pub latex_name: String,
    /// Rest-frame wavelength in Å.
    pub centre: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinesConfig {
    pub emission: BTreeMap<String, LineConfig>,
    pub absorption: BTreeMap<String, LineConfig>,
}

impl Default for LinesConfig {
    fn default() -> Self {
        let mut emission = BTreeMap::new();
        emission.insert(
            "Lyman_alpha".to_string(),
            LineConfig {
                latex_name: r"Ly$\alpha$".into(),
                centre: 1215.24,
            },
        );
        emission.insert(
            "H_alpha".to_string(),
            LineConfig {
                latex_name: r"H$\alpha$".into(),
                centre: 6564.61,
            },
        );
        Self {
            emission,
            absorption: BTreeMap::new(),
        }
    }
}

/// A line shifted to the observed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedLine<'a> {
    pub name: &'a str,
    pub kind: LineKind,
    pub observed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Emission,
    Absorption,
}

impl LinesConfig {
    /// Observed wavelength of every configured line at redshift `z`.
    pub fn observed(&self, z: f64) -> Vec<ObservedLine<'_>> {
        let tagged = self
            .emission
            .iter()
            .map(|line| (LineKind::Emission, line))
            .chain(self.absorption.iter().map(|line| (LineKind::Absorption, line)));
        tagged
            .map(|(kind, (name, line))| ObservedLine {
                name: name.as_str(),
                kind,
                observed: line.centre * (1.0 + z),
            })
            .collect()
    }
}

impl AppConfig {
    /// Load config from `path`, or from `~/.config/gcg/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = path.map(Path::to_path_buf).or_else(Self::config_path);
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Write the default configuration to `path` (or the XDG location).
    /// Refuses to clobber an existing file.
    pub fn write_default(path: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path().ok_or(ConfigError::NoConfigDir)?,
        };
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(&Self::default())?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// The paths a session cannot start without.
    pub fn validate_paths(&self) -> Result<(), ConfigError> {
        if self.files.out_dir.trim().is_empty() {
            return Err(ConfigError::MissingPath("out_dir"));
        }
        if self.files.cat_path.trim().is_empty() {
            return Err(ConfigError::MissingPath("cat_path"));
        }
        if self.files.extractions_dir.trim().is_empty() {
            return Err(ConfigError::MissingPath("extractions_dir"));
        }
        Ok(())
    }

    pub fn out_dir(&self) -> PathBuf {
        expand_path(&self.files.out_dir)
    }

    pub fn output_path(&self) -> PathBuf {
        self.out_dir().join(OUTPUT_FILE_NAME)
    }

    pub fn catalogue_path(&self) -> PathBuf {
        expand_path(&self.files.cat_path)
    }

    pub fn extractions_dir(&self) -> PathBuf {
        expand_path(&self.files.extractions_dir)
    }

    pub fn temp_dir(&self) -> PathBuf {
        if self.files.temp_dir.trim().is_empty() {
            self.out_dir().join(".temp")
        } else {
            expand_path(&self.files.temp_dir)
        }
    }

    pub fn seg_id_column(&self) -> &str {
        self.cat.seg_id.as_deref().unwrap_or(&self.cat.id)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.catalogue.scan_timeout_secs)
    }

    /// Every grism/PA combination, PA-major, bluest filter first.
    pub fn beam_keys(&self) -> Vec<BeamKey> {
        let filters = self.grisms.filters();
        self.grisms
            .position_angles()
            .iter()
            .flat_map(|pa| filters.iter().map(move |f| BeamKey::new(*f, pa.clone())))
            .collect()
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Expand a leading `~` and make the path absolute.
pub fn expand_path(raw: &str) -> PathBuf {
    let raw = raw.trim();
    let expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(rest.trim_start_matches('/')))
            .unwrap_or_else(|| PathBuf::from(raw)),
        _ => PathBuf::from(raw),
    };
    match expanded.canonicalize() {
        Ok(p) => p,
        Err(_) if expanded.is_absolute() => expanded,
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = AppConfig::default();
        assert!(config.files.skip_existing);
        assert_eq!(config.catalogue.seg_id_length, 5);
        assert_eq!(config.seg_id_column(), "id");
        assert_eq!(config.grisms.position_angles(), ["72.0".to_string(), "341.0".to_string()]);
    }

    #[test]
    fn test_beam_keys_pa_major_blue_first() {
        let keys: Vec<String> = AppConfig::default()
            .beam_keys()
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(
            keys,
            vec![
                "F115W,72.0",
                "F150W,72.0",
                "F200W,72.0",
                "F115W,341.0",
                "F150W,341.0",
                "F200W,341.0",
            ]
        );
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [files]
            out_dir = "/data/out"
            skip_existing = false

            [cat]
            id = "NUMBER"
            seg_id = "SEG"

            [grisms]
            PA1 = 72.5
            "#,
        )
        .unwrap();
        assert_eq!(config.files.out_dir, "/data/out");
        assert!(!config.files.skip_existing);
        assert_eq!(config.cat.id, "NUMBER");
        assert_eq!(config.seg_id_column(), "SEG");
        assert_eq!(config.cat.ra, "ra");
        assert_eq!(config.grisms.position_angles()[0], "72.5");
        assert_eq!(config.grisms.b, "F115W");
    }

    #[test]
    fn test_validate_paths() {
        let mut config = AppConfig::default();
        assert!(matches!(config.validate_paths(), Err(ConfigError::MissingPath("out_dir"))));
        config.files.out_dir = "/tmp/out".into();
        config.files.cat_path = "/tmp/cat.csv".into();
        assert!(matches!(
            config.validate_paths(),
            Err(ConfigError::MissingPath("extractions_dir"))
        ));
        config.files.extractions_dir = "/tmp/ext".into();
        assert!(config.validate_paths().is_ok());
    }

    #[test]
    fn test_temp_dir_defaults_under_out_dir() {
        let mut config = AppConfig::default();
        config.files.out_dir = "/nonexistent/out".into();
        assert_eq!(config.temp_dir(), PathBuf::from("/nonexistent/out/.temp"));
        assert_eq!(
            config.output_path(),
            PathBuf::from("/nonexistent/out").join(OUTPUT_FILE_NAME)
        );
    }

    #[test]
    fn test_observed_lines() {
        let lines = LinesConfig::default();
        let observed = lines.observed(1.0);
        let h_alpha = observed.iter().find(|l| l.name == "H_alpha").unwrap();
        assert_eq!(h_alpha.kind, LineKind::Emission);
        assert!((h_alpha.observed - 13129.22).abs() < 1e-9);
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        AppConfig::write_default(Some(&path)).unwrap();
        let loaded = AppConfig::load(Some(&path));
        assert_eq!(loaded.grisms.r, "F200W");
        assert_eq!(loaded.lines.emission.len(), 2);
        assert!(matches!(
            AppConfig::write_default(Some(&path)),
            Err(ConfigError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();
        let loaded = AppConfig::load(Some(&path));
        assert_eq!(loaded.cat.id, "id");
    }
}
