use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CameraError, Result};

/// Token of the preset that always exists at (0, 0, 0).
pub const HOME_PRESET_TOKEN: &str = "home";

/// A saved viewport under a unique token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtzPreset {
    pub token: String,
    pub name: String,
    pub pan: f64,
    pub tilt: f64,
    pub zoom: f64,
}

impl PtzPreset {
    pub fn home() -> Self {
        Self {
            token: HOME_PRESET_TOKEN.to_string(),
            name: "Home".to_string(),
            pan: 0.0,
            tilt: 0.0,
            zoom: 0.0,
        }
    }
}

/// Durable storage for presets, injected into the controller.
pub trait PresetStore: Send + Sync {
    /// Load every stored preset. A store that has never been written returns
    /// an empty list.
    fn load(&self) -> Result<Vec<PtzPreset>>;

    /// Replace the stored presets with `presets`.
    fn save(&self, presets: &[PtzPreset]) -> Result<()>;
}

/// Keeps presets in memory only; used when no preset file is configured.
#[derive(Default)]
pub struct MemoryPresetStore {
    presets: Mutex<Vec<PtzPreset>>,
}

impl PresetStore for MemoryPresetStore {
    fn load(&self) -> Result<Vec<PtzPreset>> {
        Ok(self.presets.lock().clone())
    }

    fn save(&self, presets: &[PtzPreset]) -> Result<()> {
        *self.presets.lock() = presets.to_vec();
        Ok(())
    }
}

/// Presets persisted as a JSON object keyed by token.
///
/// ```json
/// {
///   "home": { "token": "home", "name": "Home", "pan": 0.0, "tilt": 0.0, "zoom": 0.0 }
/// }
/// ```
pub struct JsonPresetStore {
    path: PathBuf,
}

impl JsonPresetStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PresetStore for JsonPresetStore {
    fn load(&self) -> Result<Vec<PtzPreset>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let map: BTreeMap<String, PtzPreset> = serde_json::from_str(&contents)
            .map_err(|e| CameraError::Config(format!("{}: {e}", self.path.display())))?;
        Ok(map.into_values().collect())
    }

    fn save(&self, presets: &[PtzPreset]) -> Result<()> {
        let map: BTreeMap<&str, &PtzPreset> =
            presets.iter().map(|p| (p.token.as_str(), p)).collect();
        let json = serde_json::to_string_pretty(&map)
            .map_err(|e| CameraError::Config(e.to_string()))?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPresetStore::new(dir.path().join("presets.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn json_store_persists_presets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        let store = JsonPresetStore::new(&path);

        let door = PtzPreset {
            token: "door".into(),
            name: "Front door".into(),
            pan: 0.25,
            tilt: -0.5,
            zoom: 0.75,
        };
        store.save(&[PtzPreset::home(), door.clone()]).unwrap();

        let reloaded = JsonPresetStore::new(&path).load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains(&door));
        assert!(reloaded.contains(&PtzPreset::home()));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonPresetStore::new(&path).load().unwrap_err();
        assert!(matches!(err, CameraError::Config(_)));
    }
}
