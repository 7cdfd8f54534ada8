//! Resource location: resolving mapper files against a list of roots and
//! enumerating package contents through three strategies — directories,
//! archives, and pseudo-listing files.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use squill_core::errors::{ConfigError, Result};
use walkdir::WalkDir;

const ARCHIVE_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Looks up resources against an ordered list of roots, the classpath
/// analog. Roots may be directories or archive files.
#[derive(Debug, Clone)]
pub struct ResourceResolver {
    roots: Vec<PathBuf>,
}

impl Default for ResourceResolver {
    fn default() -> Self {
        Self {
            roots: vec![PathBuf::from(".")],
        }
    }
}

impl ResourceResolver {
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots: Vec<PathBuf> = roots.into_iter().collect();
        if roots.is_empty() {
            Self::default()
        } else {
            Self { roots }
        }
    }

    pub fn read_to_string(&self, resource: &str) -> Result<String, ConfigError> {
        let bytes = self.read_bytes(resource)?;
        String::from_utf8(bytes).map_err(|e| ConfigError::Io {
            resource: resource.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    pub fn read_bytes(&self, resource: &str) -> Result<Vec<u8>, ConfigError> {
        let io_error = |source| ConfigError::Io {
            resource: resource.to_string(),
            source,
        };
        let path = Path::new(resource);
        if path.is_absolute() && path.is_file() {
            return fs::read(path).map_err(io_error);
        }
        for root in &self.roots {
            let candidate = root.join(resource);
            if candidate.is_file() {
                return fs::read(&candidate).map_err(io_error);
            }
            if is_archive(root) {
                if let Some(bytes) = read_archive_entry(root, resource).map_err(io_error)? {
                    return Ok(bytes);
                }
            }
        }
        Err(io_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "resource not found under any root",
        )))
    }

    pub fn exists(&self, resource: &str) -> bool {
        self.read_bytes(resource).is_ok()
    }

    /// Enumerates the child resource names of a package across all
    /// roots. Dots in the package name are path separators.
    pub fn list_package(&self, package: &str) -> Result<Vec<String>, ConfigError> {
        let package_path = package.replace('.', "/");
        let mut names = Vec::new();
        for root in &self.roots {
            if is_archive(root) {
                names.extend(list_archive_package(root, &package_path).map_err(|source| {
                    ConfigError::Io {
                        resource: package.to_string(),
                        source,
                    }
                })?);
                continue;
            }
            let dir = root.join(&package_path);
            if dir.is_dir() {
                names.extend(list_directory_package(root, &dir));
            } else if dir.is_file() {
                // a plain file standing where a directory was expected is
                // treated as a listing of child names, each re-verified
                if let Some(listed) = self.list_from_listing(&dir, &package_path) {
                    names.extend(listed);
                }
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// The pseudo-listing strategy. Any line that fails verification
    /// aborts the whole strategy.
    fn list_from_listing(&self, listing: &Path, package_path: &str) -> Option<Vec<String>> {
        let text = fs::read_to_string(listing).ok()?;
        let mut names = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let candidate = format!("{package_path}/{line}");
            if !self.exists(&candidate) {
                tracing::debug!(candidate, "listing entry failed verification, aborting");
                return None;
            }
            names.push(candidate);
        }
        Some(names)
    }
}

fn list_directory_package(root: &Path, dir: &Path) -> Vec<String> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|relative| relative.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}

/// Archive detection by magic prefix.
fn is_archive(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut prefix = [0u8; 4];
    match file.read_exact(&mut prefix) {
        Ok(()) => prefix == ARCHIVE_MAGIC,
        Err(_) => false,
    }
}

fn read_archive_entry(
    archive_path: &Path,
    resource: &str,
) -> Result<Option<Vec<u8>>, std::io::Error> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    match archive.by_name(resource) {
        Ok(mut entry) => {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        }
        Err(_) => Ok(None),
    }
}

fn list_archive_package(
    archive_path: &Path,
    package_path: &str,
) -> Result<Vec<String>, std::io::Error> {
    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    let prefix = format!("{package_path}/");
    let mut names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let name = entry.name();
        if name.starts_with(&prefix) && !name.ends_with('/') {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn reads_resources_relative_to_roots() {
        let dir = TempDir::new("resources").unwrap();
        write(dir.path(), "mappers/users.xml", "<mapper namespace='u'/>");
        let resolver = ResourceResolver::new([dir.path().to_path_buf()]);
        let text = resolver.read_to_string("mappers/users.xml").unwrap();
        assert!(text.contains("namespace"));
        assert!(resolver.read_to_string("missing.xml").is_err());
    }

    #[test]
    fn lists_directory_packages_recursively() {
        let dir = TempDir::new("scan").unwrap();
        write(dir.path(), "app/mappers/users.xml", "x");
        write(dir.path(), "app/mappers/orders/orders.xml", "x");
        let resolver = ResourceResolver::new([dir.path().to_path_buf()]);
        let names = resolver.list_package("app.mappers").unwrap();
        assert_eq!(
            names,
            vec![
                "app/mappers/orders/orders.xml".to_string(),
                "app/mappers/users.xml".to_string(),
            ]
        );
    }

    #[test]
    fn scans_archive_roots_by_magic() {
        let dir = TempDir::new("archive").unwrap();
        let archive_path = dir.path().join("bundle.jar");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();
            writer.start_file("app/mappers/users.xml", options).unwrap();
            writer.write_all(b"<mapper namespace='u'/>").unwrap();
            writer.finish().unwrap();
        }
        assert!(is_archive(&archive_path));

        let resolver = ResourceResolver::new([archive_path.clone()]);
        let names = resolver.list_package("app.mappers").unwrap();
        assert_eq!(names, vec!["app/mappers/users.xml".to_string()]);
        let text = resolver.read_to_string("app/mappers/users.xml").unwrap();
        assert!(text.contains("namespace"));
    }

    #[test]
    fn listing_files_verify_each_line() {
        let dir = TempDir::new("listing").unwrap();
        write(dir.path(), "pkg/real.xml", "x");
        // `pkg2` is a file whose lines list candidates inside `pkg2/`,
        // but no such resources exist: the strategy must abort
        write(dir.path(), "pkg2", "ghost.xml");
        let resolver = ResourceResolver::new([dir.path().to_path_buf()]);
        assert_eq!(resolver.list_package("pkg2").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn listing_files_accept_verified_lines() {
        let dir = TempDir::new("listing2").unwrap();
        write(dir.path(), "pkg/a.xml", "x");
        let listing_root = TempDir::new("listing2b").unwrap();
        write(listing_root.path(), "pkg", "a.xml");
        let resolver =
            ResourceResolver::new([listing_root.path().to_path_buf(), dir.path().to_path_buf()]);
        assert_eq!(resolver.list_package("pkg").unwrap(), vec!["pkg/a.xml".to_string()]);
    }
}
