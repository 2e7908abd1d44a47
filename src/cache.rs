//! Content-addressed cache of cube-extracted spectra.
//!
//! Extracting an aperture spectrum from the datacube is slow, so each result
//! is kept in memory and written next to the other session files as a JSON
//! sidecar named after its key. A key is computed at most once per cache
//! and reused across sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

/// What an extraction depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionKey {
    pub ra: f64,
    pub dec: f64,
    pub radius_arcsec: f64,
    pub kernel_sigma: f64,
}

impl ExtractionKey {
    /// `{ra}_{dec}_r{radius}_c{kernel}`, fixed precision so equal keys
    /// always map to the same file.
    pub fn file_stem(&self) -> String {
        format!(
            "{:.6}_{:.6}_r{:.6}_c{:.3}",
            self.ra, self.dec, self.radius_arcsec, self.kernel_sigma
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSpectrum {
    /// Å
    pub wavelength: Vec<f64>,
    pub flux: Vec<f64>,
}

#[derive(Debug)]
pub struct SpectrumCache {
    dir: PathBuf,
    memory: HashMap<String, ExtractedSpectrum>,
}

impl SpectrumCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: HashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.temp_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &ExtractionKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }

    /// Cached spectrum for `key`, from memory or disk.
    pub fn get(&mut self, key: &ExtractionKey) -> Option<&ExtractedSpectrum> {
        let stem = key.file_stem();
        if !self.memory.contains_key(&stem) {
            let spectrum = self.read_sidecar(&self.path_for(key))?;
            self.memory.insert(stem.clone(), spectrum);
        }
        self.memory.get(&stem)
    }

    /// Cached spectrum for `key`, running `compute` on a miss. A compute
    /// error is returned and nothing is cached; a failed sidecar write only
    /// costs persistence across sessions.
    pub fn get_or_compute<E>(
        &mut self,
        key: &ExtractionKey,
        compute: impl FnOnce(&ExtractionKey) -> Result<ExtractedSpectrum, E>,
    ) -> Result<&ExtractedSpectrum, E> {
        let stem = key.file_stem();
        if !self.memory.contains_key(&stem) {
            let path = self.path_for(key);
            let spectrum = match self.read_sidecar(&path) {
                Some(spectrum) => spectrum,
                None => {
                    log::debug!("Extracting spectrum for {}", stem);
                    let spectrum = compute(key)?;
                    if let Err(e) = write_sidecar(&path, &spectrum) {
                        log::warn!("Could not cache spectrum to {}: {}", path.display(), e);
                    }
                    spectrum
                }
            };
            self.memory.insert(stem.clone(), spectrum);
        }
        Ok(&self.memory[&stem])
    }

    fn read_sidecar(&self, path: &Path) -> Option<ExtractedSpectrum> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(spectrum) => Some(spectrum),
            Err(e) => {
                log::warn!("Ignoring unreadable cache file {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn write_sidecar(path: &Path, spectrum: &ExtractedSpectrum) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec(spectrum)?;
    std::fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn key() -> ExtractionKey {
        ExtractionKey {
            ra: 3.5812,
            dec: -30.3950,
            radius_arcsec: 0.5,
            kernel_sigma: 1.0,
        }
    }

    fn spectrum() -> ExtractedSpectrum {
        ExtractedSpectrum {
            wavelength: vec![4750.0, 4751.25],
            flux: vec![1.5, 2.5],
        }
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(
            key().file_stem(),
            "3.581200_-30.395000_r0.500000_c1.000"
        );
    }

    #[test]
    fn test_computes_once_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Cell::new(0);
        let compute = |_: &ExtractionKey| -> Result<_, String> {
            calls.set(calls.get() + 1);
            Ok(spectrum())
        };

        let mut cache = SpectrumCache::new(dir.path().join(".temp"));
        assert_eq!(cache.get_or_compute(&key(), compute).unwrap(), &spectrum());
        assert_eq!(cache.get_or_compute(&key(), compute).unwrap(), &spectrum());
        assert_eq!(calls.get(), 1);
        assert!(cache.path_for(&key()).is_file());

        // A fresh cache over the same directory reads the sidecar.
        let mut reopened = SpectrumCache::new(dir.path().join(".temp"));
        assert_eq!(reopened.get(&key()), Some(&spectrum()));
        reopened.get_or_compute(&key(), compute).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_compute_error_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SpectrumCache::new(dir.path());
        let err = cache
            .get_or_compute(&key(), |_| Err::<ExtractedSpectrum, _>("no cube"))
            .unwrap_err();
        assert_eq!(err, "no cube");
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn test_corrupt_sidecar_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = SpectrumCache::new(dir.path());
        std::fs::write(cache.path_for(&key()), b"{not json").unwrap();
        let got = cache
            .get_or_compute(&key(), |_| Ok::<_, String>(spectrum()))
            .unwrap();
        assert_eq!(got, &spectrum());
    }
}
