use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("image path is empty")]
    Empty,
    #[error("image path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Maps a catalog image path ("foo/abc.png") onto the local base directory.
pub fn image_path_for(base_dir: &Path, image: &str) -> Result<PathBuf, PathError> {
    let mut out = base_dir.to_path_buf();
    let mut pushed = false;
    for component in Path::new(image).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(image.to_string()));
            }
        }
    }
    if !pushed {
        return Err(PathError::Empty);
    }
    Ok(out)
}

/// Sibling path a download is written to before being renamed into place.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}
