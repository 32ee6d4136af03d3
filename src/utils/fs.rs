use std::path::{Path, PathBuf};

/// Naively replaces any path separator with a forward-slash '/'
pub fn normalize_path(path: &str) -> String {
    use std::path::is_separator;
    path.chars()
        .map(|ch| if is_separator(ch) { '/' } else { ch })
        .collect::<String>()
}

/// Absolutise `path` against the current directory, then normalise the
/// separators. Canonicalisation is deliberately avoided: the file may not
/// exist yet (dirty editor buffers).
pub fn absolute_posix(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    normalize_path(&absolute.to_string_lossy())
}

/// Strip `prefix` from `path`, returning the remainder when `path` lies
/// underneath it.
pub fn relative_to(path: &Path, prefix: &Path) -> Option<PathBuf> {
    path.strip_prefix(prefix).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_become_slashes() {
        assert_eq!(normalize_path("a/b/c"), "a/b/c");
        #[cfg(windows)]
        assert_eq!(normalize_path(r"a\b\c"), "a/b/c");
    }

    #[test]
    fn relative_to_strips_the_prefix() {
        let path = Path::new("/src/dir/file.py");
        assert_eq!(
            relative_to(path, Path::new("/src")),
            Some(PathBuf::from("dir/file.py"))
        );
        assert_eq!(relative_to(path, Path::new("/other")), None);
    }
}
