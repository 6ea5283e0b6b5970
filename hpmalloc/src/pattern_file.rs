//! Persistence of warming patterns.

use std::{fs, io, path::Path};

use log::info;

use crate::{Error, WarmingPattern};

/// Reads the pattern stored at `path`.
///
/// Returns None if there is no such file, as is the case on the first run of a server.
pub fn load_pattern(path: &Path) -> Result<Option<WarmingPattern>, Error> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            info!("no pattern file at {:?}, warming skipped", path);
            return Ok(None);
        },
        Err(source) => return Err(Error::Io { path: path.to_owned(), source }),
    };

    Ok(Some(WarmingPattern::parse(&text)?))
}

/// Stores `pattern` at `path`, replacing any previous pattern.
///
/// The pattern is first written alongside, then renamed, so that a concurrent reader never sees a partial pattern.
pub fn save_pattern(path: &Path, pattern: &WarmingPattern) -> Result<(), Error> {
    let temporary = path.with_extension("tmp");

    fs::write(&temporary, pattern.to_string())
        .and_then(|_| fs::rename(&temporary, path))
        .map_err(|source| Error::Io { path: path.to_owned(), source })?;

    info!("updated memory pattern file {:?}", path);

    Ok(())
}
