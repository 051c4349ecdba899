//! Slot index to registered connection ID map

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Which connection ID each HA slot currently holds
///
/// Written only on successful registration. A slot that reconnects replaces
/// its entry; entries are never removed.
#[derive(Debug, Default)]
pub struct TunnelsForHA {
    entries: Mutex<BTreeMap<u8, String>>,
}

impl TunnelsForHA {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the connection ID registered on `conn_index`
    pub fn add_tunnel_id(&self, conn_index: u8, tunnel_id: Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(conn_index, tunnel_id.to_string());
        }
    }

    /// Copy of the map, ordered by slot index
    pub fn snapshot(&self) -> BTreeMap<u8, String> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for TunnelsForHA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, id) in self.snapshot() {
            writeln!(f, "{}: {}", index, id)?;
        }
        Ok(())
    }
}
