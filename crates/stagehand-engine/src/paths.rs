//! Filename remapping and sandbox containment
//!
//! Every filename arriving on the wire passes through the job's remap
//! table and must then resolve to a path inside the sandbox. Anything
//! absolute, anything with a parent component, and anything with a NUL
//! byte is rejected; the caller diverts such writes to the null sink and
//! records a hold.

use std::path::{Component, Path, PathBuf};

use stagehand_types::{Error, Result};

/// Apply the first matching `source=target` rewrite rule to a filename
pub fn apply_remaps(name: &str, remaps: &[(String, String)]) -> String {
    for (source, target) in remaps {
        if name == source {
            return target.clone();
        }
    }
    name.to_string()
}

/// Resolve a wire filename to a path under `root`, rejecting escapes
///
/// The checks are purely lexical: no component may be `..`, absolute, or a
/// prefix, and the name may not contain NUL. The result is `root` joined
/// with the surviving components.
pub fn resolve_sandbox_path(root: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(Error::IllegalPath {
            name: name.to_string(),
        });
    }
    if name.contains('\0') {
        return Err(Error::IllegalPath {
            name: name.replace('\0', "\\0"),
        });
    }

    let mut safe = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => safe.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::IllegalPath {
                    name: name.to_string(),
                });
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(Error::IllegalPath {
            name: name.to_string(),
        });
    }
    Ok(root.join(safe))
}

/// Whether a URL path contains an upward traversal
///
/// Signing requests refuse URLs whose path component could escape the
/// destination prefix.
pub fn url_has_traversal(url: &str) -> bool {
    url.contains("/..")
}

/// Basename of a URL's path, used as the local filename for fetched URLs
pub fn url_basename(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query.rsplit('/').next().unwrap_or(without_query)
}
