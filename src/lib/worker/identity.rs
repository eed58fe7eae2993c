use std::io;
use std::path::Path;

use sysinfo::System;
use tracing::info;
use uuid::Uuid;

const WORKER_ID_FILE: &str = "worker_id";

/// Reads the worker id persisted in `data_dir`, minting and saving a new one
/// when the file is missing or empty.
pub fn find_or_create_worker_id(data_dir: &Path) -> io::Result<String> {
    let path = data_dir.join(WORKER_ID_FILE);

    let existing = match std::fs::read_to_string(&path) {
        Ok(raw) => raw.trim().to_string(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };

    if !existing.is_empty() {
        return Ok(existing);
    }

    std::fs::create_dir_all(data_dir)?;
    let wid = Uuid::now_v7().to_string();
    std::fs::write(&path, &wid)?;
    info!(worker_id = %wid, path = %path.display(), "minted new worker id");

    Ok(wid)
}

/// `{hostname}-{id}`; an explicit override replaces the persisted id.
pub fn resolve_worker_id(data_dir: &Path, override_id: Option<String>) -> io::Result<String> {
    let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());

    let wid = match override_id.filter(|wid| !wid.is_empty()) {
        Some(wid) => wid,
        None => find_or_create_worker_id(data_dir)?,
    };

    Ok(format!("{}-{}", hostname, wid))
}
