// Pickled results cache.
//
// The cache holds one [`ResultsTable`]. It is rewritten after every completed
// fold, so an interrupted run resumes from the last finished fold.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::cv::records::ResultsTable;
use crate::error::CacheError;

/// `Ok(None)` when there is no cache file yet.
pub fn load(path: &Path) -> Result<Option<ResultsTable>, CacheError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CacheError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let table: ResultsTable = serde_pickle::from_reader(BufReader::new(file)).map_err(|source| CacheError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), records = table.len(), "loaded results cache");
    Ok(Some(table))
}

/// Cached table for this fingerprint, or an empty one. A corrupt or
/// mismatching cache is logged and ignored, never fatal.
pub fn load_matching(path: &Path, fingerprint: &str) -> ResultsTable {
    match load(path) {
        Ok(Some(table)) if table.fingerprint == fingerprint => table,
        Ok(Some(table)) => {
            warn!(
                path = %path.display(),
                records = table.len(),
                "cache was produced by a different configuration, recomputing"
            );
            ResultsTable::new(fingerprint)
        }
        Ok(None) => ResultsTable::new(fingerprint),
        Err(e) => {
            warn!(error = %e, "ignoring unreadable results cache");
            ResultsTable::new(fingerprint)
        }
    }
}

/// Written to a sibling `.tmp` file, then renamed over the cache.
pub fn save(path: &Path, table: &ResultsTable) -> Result<(), CacheError> {
    let io_err = |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = temp_path(path);
    {
        let file = File::create(&tmp).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_pickle::to_writer(&mut writer, table, true).map_err(|source| CacheError::Corrupt {
            path: tmp.clone(),
            source,
        })?;
        writer.flush().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;
    debug!(path = %path.display(), records = table.len(), "saved results cache");
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
