// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Guards the one filesystem surface the HTTP API exposes: serving a
//! recording back by name. The requested name must be a bare file name --
//! no directory separators, no `..` -- so a request can never escape the
//! configured recordings directory.

use std::path::{Path, PathBuf};

/// Resolves `requested_name` to a path inside `recordings_dir`, rejecting
/// anything that isn't a plain file name.
///
/// # Errors
///
/// Returns an error string if the name contains a path separator or `..`
/// component, or resolves to something other than a direct child of
/// `recordings_dir`.
pub fn resolve_recording_path(recordings_dir: &Path, requested_name: &str) -> Result<PathBuf, String> {
    if requested_name.is_empty() {
        return Err("recording name must not be empty".to_string());
    }

    let candidate = Path::new(requested_name);
    if candidate.components().count() != 1 {
        return Err(format!("recording name '{requested_name}' must not contain path separators"));
    }
    if matches!(candidate.file_name(), None) {
        return Err(format!("recording name '{requested_name}' is not a valid file name"));
    }

    Ok(recordings_dir.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_file_name_resolves_inside_directory() {
        let dir = Path::new("/var/relay/recordings");
        let resolved = resolve_recording_path(dir, "broadcast-abcd1234-123.webm").unwrap();
        assert_eq!(resolved, Path::new("/var/relay/recordings/broadcast-abcd1234-123.webm"));
    }

    #[test]
    fn parent_dir_traversal_is_rejected() {
        let dir = Path::new("/var/relay/recordings");
        assert!(resolve_recording_path(dir, "../secrets.txt").is_err());
    }

    #[test]
    fn nested_path_is_rejected() {
        let dir = Path::new("/var/relay/recordings");
        assert!(resolve_recording_path(dir, "sub/broadcast.webm").is_err());
    }

    #[test]
    fn absolute_path_is_rejected() {
        let dir = Path::new("/var/relay/recordings");
        assert!(resolve_recording_path(dir, "/etc/passwd").is_err());
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = Path::new("/var/relay/recordings");
        assert!(resolve_recording_path(dir, "").is_err());
    }
}
