use crate::error::ProxyError;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Durable set of `request_key`s that were non-terminal, for reporting after an unclean restart.
pub struct PendingStore {
    pub name: String,
    path: PathBuf,
}

impl PendingStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            name: "pending_store".to_string(),
            path: path.into(),
        }
    }

    pub fn load(&self) -> Result<BTreeSet<String>, ProxyError> {
        match fs::read_to_string(&self.path) {
            Ok(data) if data.trim().is_empty() => Ok(BTreeSet::new()),
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrites the file atomically; an empty set removes it.
    pub fn save(&self, keys: &BTreeSet<String>) -> Result<(), ProxyError> {
        if keys.is_empty() {
            return self.clear();
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, serde_json::to_vec_pretty(keys)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!("{}: saved {} pending keys", self.name, keys.len());
        Ok(())
    }

    pub fn clear(&self) -> Result<(), ProxyError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
