//! Rsync-flavoured exclusion patterns for sync.
//!
//! Rules:
//!
//! * `name`: any file or directory with that name, at any depth.
//! * `name/`: any *directory* with that name.
//! * `foo/bar/baz`: any `baz` whose two immediate parents are `bar` and
//!   `foo`, at any depth.
//! * `foo.*`: glob syntax within a component (`*` does not cross `/`).
//! * `foo/**/bar`: `**` crosses directories.
//! * `/foo`: anchored to the root of the tree being walked.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

pub struct ExclusionMatcher {
    any: GlobSet,
    dirs_only: GlobSet,
}

impl ExclusionMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<ExclusionMatcher, globset::Error> {
        let mut any = GlobSetBuilder::new();
        let mut dirs_only = GlobSetBuilder::new();

        for pattern in patterns {
            let mut pattern = pattern.as_ref();

            let for_dirs = pattern.ends_with('/');
            if for_dirs {
                pattern = pattern.trim_end_matches('/');
            }

            // Rooted patterns are relative to the walked root; everything
            // else applies at any depth.
            let expanded = match pattern.strip_prefix('/') {
                Some(rooted) => rooted.to_string(),
                None => format!("**/{pattern}"),
            };

            let glob = GlobBuilder::new(&expanded)
                .literal_separator(true)
                .build()?;
            if for_dirs {
                dirs_only.add(glob);
            } else {
                any.add(glob);
            }
        }

        Ok(ExclusionMatcher {
            any: any.build()?,
            dirs_only: dirs_only.build()?,
        })
    }

    /// Whether a slash-separated path (relative to the walked root) is
    /// excluded.
    pub fn is_excluded(&self, relative_path: &str, is_dir: bool) -> bool {
        self.any.is_match(relative_path) || (is_dir && self.dirs_only.is_match(relative_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> ExclusionMatcher {
        ExclusionMatcher::new(patterns).unwrap()
    }

    #[test]
    fn bare_name_matches_at_any_depth() {
        let m = matcher(&["exclude_dir"]);
        assert!(m.is_excluded("exclude_dir", true));
        assert!(m.is_excluded("foo/bar/exclude_dir", true));
        assert!(m.is_excluded("foo/exclude_dir", false));
        assert!(!m.is_excluded("foo/exclude_dir_not", false));
    }

    #[test]
    fn extension_glob() {
        let m = matcher(&["*.exclude"]);
        assert!(m.is_excluded("b.exclude", false));
        assert!(m.is_excluded("foo/c.exclude", false));
        assert!(!m.is_excluded("b.exclude/nested", false));
    }

    #[test]
    fn nested_pattern_applies_at_any_depth() {
        let m = matcher(&["exclude_txt/*.txt"]);
        assert!(m.is_excluded("foo/bar/exclude_txt/f.txt", false));
        assert!(!m.is_excluded("foo/bar/exclude_txt/e.not_txt", false));
        assert!(!m.is_excluded("f.txt", false));
    }

    #[test]
    fn rooted_pattern_only_matches_root() {
        let m = matcher(&["/exclude_in_root"]);
        assert!(m.is_excluded("exclude_in_root", false));
        assert!(!m.is_excluded("foo/exclude_in_root", false));
    }

    #[test]
    fn trailing_slash_restricts_to_directories() {
        let m = matcher(&["exclude_when_directory/"]);
        assert!(m.is_excluded("exclude_when_directory", true));
        assert!(!m.is_excluded("foo/exclude_when_directory", false));
        assert!(m.is_excluded("foo/exclude_when_directory", true));
    }

    #[test]
    fn star_does_not_cross_separators() {
        let m = matcher(&["/foo*"]);
        assert!(m.is_excluded("foobar", false));
        assert!(!m.is_excluded("foo/bar", false));
    }

    #[test]
    fn double_star_crosses_separators() {
        let m = matcher(&["foo/**/bar"]);
        assert!(m.is_excluded("foo/x/y/bar", false));
        assert!(m.is_excluded("a/foo/x/bar", false));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(ExclusionMatcher::new(&["[unclosed"]).is_err());
    }
}
