use serde::{Deserialize, Serialize};

/// A base image new machines are cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    /// Folder the template lives in, for hypervisors that organise
    /// inventory hierarchically.
    pub folder: Option<String>,
    #[serde(default)]
    pub snapshots: Vec<String>,
}

impl Template {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            folder: None,
            snapshots: Vec::new(),
        }
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshots.push(snapshot.into());
        self
    }

    pub fn has_snapshot(&self, snapshot: &str) -> bool {
        self.snapshots.iter().any(|s| s == snapshot)
    }
}
