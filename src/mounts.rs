//! Mount planning for path-addressable remote storage
//!
//! Remote paths look like `/<zone>/<collection>/...`. Home directories
//! (`/<zone>/home/<owner>/...`) are mounted per owner, every other collection
//! is mounted at its top level. The planner reduces a list of requested
//! paths to the minimal set of mount roots that covers all of them.

use std::collections::BTreeSet;

use crate::Error;

/// Second path segment that marks a home-directory collection
pub const HOME_SEGMENT: &str = "home";

/// Compute the mount root for a single absolute remote path.
///
/// `/zone/home/owner/...` truncates to `/zone/home/owner`; any other
/// `/zone/collection/...` truncates to `/zone/collection`.
pub fn mount_root(path: &str) -> Result<String, Error> {
    if !path.starts_with('/') {
        return Err(Error::validation(format!(
            "remote path '{}' is not absolute",
            path
        )));
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    if segments.len() < 2 {
        return Err(Error::validation(format!(
            "remote path '{}' has no top-level collection",
            path
        )));
    }

    let depth = if segments[1] == HOME_SEGMENT { 3 } else { 2 };
    if segments.len() < depth {
        return Err(Error::validation(format!(
            "home path '{}' does not name an owner",
            path
        )));
    }

    Ok(format!("/{}", segments[..depth].join("/")))
}

/// Reduce `paths` to the sorted, deduplicated set of mount roots.
///
/// Order of the input does not matter and repeated paths collapse, so the
/// output is stable for a given set of paths.
pub fn plan_mounts<S: AsRef<str>>(paths: &[S]) -> Result<Vec<String>, Error> {
    let mut roots = BTreeSet::new();
    for path in paths {
        roots.insert(mount_root(path.as_ref())?);
    }
    Ok(roots.into_iter().collect())
}
