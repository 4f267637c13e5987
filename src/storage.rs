use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable checkpoint of one room, written after every accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub code: String,
    pub language: String,
    pub theme: String,
}

/// Room checkpoints on disk, one JSON file per room id.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self, room_id: Uuid) -> io::Result<Option<RoomSnapshot>> {
        let path = self.snapshot_path(room_id);
        match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, room_id: Uuid, snapshot: &RoomSnapshot) -> io::Result<()> {
        let path = self.snapshot_path(room_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(path, json)
    }

    fn snapshot_path(&self, room_id: Uuid) -> PathBuf {
        self.data_dir.join(format!("{room_id}.json"))
    }
}
