//! JSON snapshot of the record table, keyed by instance id.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::{StateError, StateResult};
use crate::types::InstanceRecord;

/// Read a snapshot. A missing file is an empty table.
pub(crate) fn load(path: &Path) -> StateResult<HashMap<String, InstanceRecord>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes).map_err(|e| StateError::Deserialize(e.to_string()))
}

/// Write a snapshot via a temporary file and rename.
pub(crate) fn save(path: &Path, records: &HashMap<String, InstanceRecord>) -> StateResult<()> {
    let json =
        serde_json::to_vec_pretty(records).map_err(|e| StateError::Serialize(e.to_string()))?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
