//! Acknowledgement sounds played on activation
//!
//! Raw s16le 16 kHz mono clips are loaded once at startup. The library is
//! immutable afterwards, so it can be shared without locking.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use tracing::{info, warn};

const RAW_EXTENSION: &str = ".raw";

#[derive(Debug, Default, Clone)]
pub struct AckSoundLibrary {
    sounds: HashMap<String, Arc<[u8]>>,
}

impl AckSoundLibrary {
    /// Load `files` from `directory`, skipping anything missing or unreadable
    pub fn load(directory: &Path, files: &[String]) -> Self {
        let mut sounds = HashMap::new();

        for filename in files {
            let path = directory.join(filename);
            match std::fs::read(&path) {
                Ok(bytes) => {
                    info!(file = %filename, bytes = bytes.len(), "loaded acknowledgement sound");
                    sounds.insert(strip_extension(filename).to_string(), Arc::from(bytes));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "acknowledgement sound not loaded");
                }
            }
        }

        if sounds.is_empty() {
            warn!("no acknowledgement sounds loaded");
        }

        Self { sounds }
    }

    /// Build from in-memory clips
    pub fn from_clips<I, S>(clips: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: AsRef<str>,
    {
        let sounds = clips
            .into_iter()
            .map(|(name, bytes)| (strip_extension(name.as_ref()).to_string(), Arc::from(bytes)))
            .collect();
        Self { sounds }
    }

    /// Look up a clip by name, with or without the `.raw` extension
    pub fn get(&self, name: &str) -> Option<Arc<[u8]>> {
        self.sounds.get(strip_extension(name)).cloned()
    }

    /// Any loaded clip
    pub fn random(&self) -> Option<Arc<[u8]>> {
        self.sounds.values().choose(&mut rand::thread_rng()).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sounds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.sounds.is_empty()
    }
}

fn strip_extension(name: &str) -> &str {
    name.strip_suffix(RAW_EXTENSION).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_with_or_without_extension() {
        let library = AckSoundLibrary::from_clips([("huh.raw", vec![1, 2])]);
        assert_eq!(library.get("huh").as_deref(), Some(&[1u8, 2][..]));
        assert_eq!(library.get("huh.raw").as_deref(), Some(&[1u8, 2][..]));
        assert!(library.get("yes").is_none());
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let dir = std::env::temp_dir().join(format!("tars-sounds-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("yes.raw"), [7u8, 7]).unwrap();

        let library =
            AckSoundLibrary::load(&dir, &["yes.raw".to_string(), "missing.raw".to_string()]);
        assert_eq!(library.names(), vec!["yes"]);
        assert!(library.random().is_some());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_empty_library_has_no_random() {
        assert!(AckSoundLibrary::default().random().is_none());
    }
}
