use std::os::unix::fs::PermissionsExt;

use anyhow::Result;
use camino::Utf8PathBuf;

/// Find `name` in `$PATH`, returning the first executable match.
pub fn find_executable(name: &str) -> Result<Option<Utf8PathBuf>> {
    let Some(path) = std::env::var_os("PATH") else {
        return Ok(None);
    };
    for dir in std::env::split_paths(&path) {
        let Ok(dir) = Utf8PathBuf::try_from(dir) else {
            continue;
        };
        let candidate = dir.join(name);
        match candidate.metadata() {
            Ok(m) if m.is_file() && m.permissions().mode() & 0o111 != 0 => {
                return Ok(Some(candidate));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Returns true if `name` is an executable in `$PATH`.
pub fn have_executable(name: &str) -> Result<bool> {
    find_executable(name).map(|v| v.is_some())
}
