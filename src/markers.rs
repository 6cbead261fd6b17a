//! Declarative metadata embedded in formula scripts as comment lines.
//!
//! ```text
//! #!/usr/bin/env bash
//! # Build Path: /app/.heroku/python/
//! # Build Deps: libraries/sqlite, libraries/bzip2-1.*
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};

/// Marker introducing the dependency list.
pub const DEPS_MARKER: &str = "# Build Deps: ";

/// Marker introducing the build output directory.
pub const BUILD_PATH_MARKER: &str = "# Build Path: ";

/// Lazy iterator over the values of one marker in a file.
///
/// Yields the remainder of each line that starts with the marker, trimmed.
/// Read errors part-way through the file are yielded as `Err` items.
pub struct MarkerLines {
    marker: String,
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl Iterator for MarkerLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => {
                    let path = self.path.display().to_string();
                    return Some(
                        Err::<String, _>(err).io_context(|| format!("reading '{path}'")),
                    );
                }
            };
            if let Some(rest) = line.strip_prefix(&self.marker) {
                return Some(Ok(rest.trim().to_string()));
            }
        }
    }
}

/// Open `path` and iterate the values of every line starting with `marker`.
///
/// Fails immediately if the file cannot be opened.
pub fn extract(marker: &str, path: &Path) -> Result<MarkerLines> {
    let file =
        File::open(path).io_context(|| format!("opening formula '{}'", path.display()))?;
    Ok(MarkerLines {
        marker: marker.to_string(),
        path: path.to_path_buf(),
        lines: BufReader::new(file).lines(),
    })
}

/// Split a dependency marker value on any run of spaces and commas.
pub fn split_dependencies(value: &str) -> Vec<String> {
    value
        .split([' ', ','])
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Dependencies declared by the first `# Build Deps:` line.
///
/// Only the first such line is honored; any later ones are ignored.
pub fn declared_dependencies(path: &Path) -> Result<Vec<String>> {
    match extract(DEPS_MARKER, path)?.next() {
        Some(value) => Ok(split_dependencies(&value?)),
        None => Ok(Vec::new()),
    }
}

/// Build path declared by the first `# Build Path:` line, if any.
pub fn declared_build_path(path: &Path) -> Result<Option<PathBuf>> {
    match extract(BUILD_PATH_MARKER, path)?.next() {
        Some(value) => Ok(Some(PathBuf::from(value?))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_formula(contents: &str) -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("formula");
        fs::write(&path, contents).unwrap();
        (temp, path)
    }

    #[test]
    fn test_extract_without_matches_is_empty() {
        let (_temp, path) = write_formula("#!/bin/bash\necho hello\n");
        let values: Vec<_> = extract(DEPS_MARKER, &path).unwrap().collect();
        assert!(values.is_empty());
    }

    #[test]
    fn test_extract_empty_file() {
        let (_temp, path) = write_formula("");
        assert_eq!(extract(BUILD_PATH_MARKER, &path).unwrap().count(), 0);
    }

    #[test]
    fn test_extract_strips_marker_and_whitespace() {
        let (_temp, path) = write_formula("# Build Path:   /app/.heroku/php  \n");
        let values: Vec<String> = extract(BUILD_PATH_MARKER, &path)
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(values, vec!["/app/.heroku/php"]);
    }

    #[test]
    fn test_extract_is_anchored_and_case_sensitive() {
        let (_temp, path) = write_formula(
            "  # Build Deps: indented\n# build deps: lower\necho '# Build Deps: quoted'\n",
        );
        assert_eq!(extract(DEPS_MARKER, &path).unwrap().count(), 0);
    }

    #[test]
    fn test_extract_yields_every_matching_line() {
        let (_temp, path) = write_formula("# Build Deps: a\nmake\n# Build Deps: b\n");
        let values: Vec<String> = extract(DEPS_MARKER, &path)
            .unwrap()
            .map(|v| v.unwrap())
            .collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_extract_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let result = extract(DEPS_MARKER, &temp.path().join("missing"));
        assert!(result.is_err());
    }

    #[test]
    fn test_split_dependencies_on_spaces_and_commas() {
        assert_eq!(
            split_dependencies("libraries/sqlite, libraries/bzip2 ,,  zlib"),
            vec!["libraries/sqlite", "libraries/bzip2", "zlib"]
        );
        assert!(split_dependencies("").is_empty());
    }

    #[test]
    fn test_only_first_deps_line_is_honored() {
        let (_temp, path) =
            write_formula("# Build Deps: first-a first-b\n# Build Deps: second\n");
        assert_eq!(
            declared_dependencies(&path).unwrap(),
            vec!["first-a", "first-b"]
        );
    }

    #[test]
    fn test_declared_build_path_absent() {
        let (_temp, path) = write_formula("#!/bin/bash\n");
        assert_eq!(declared_build_path(&path).unwrap(), None);
    }

    #[test]
    fn test_declared_build_path_first_wins() {
        let (_temp, path) = write_formula("# Build Path: /one\n# Build Path: /two\n");
        assert_eq!(
            declared_build_path(&path).unwrap(),
            Some(PathBuf::from("/one"))
        );
    }
}
