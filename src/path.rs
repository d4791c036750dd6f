//! Api-path normalization.
//!
//! An api path is the canonical key for every filesystem item: always
//! forward-slash separated, always rooted at `/`, never ending in a
//! separator except for the root itself.

/// Builds the canonical api path for an arbitrary input: folds `\` to `/`,
/// collapses repeated separators, forces a leading `/`, and strips any
/// trailing separator except on the root.
pub fn create_api_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');

    let mut last_was_sep = true;
    for chr in path.chars() {
        let chr = if chr == '\\' { '/' } else { chr };
        if chr == '/' {
            if !last_was_sep {
                out.push('/');
            }
            last_was_sep = true;
        } else {
            out.push(chr);
            last_was_sep = false;
        }
    }

    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }

    out
}

/// Parent of an api path; the root is its own parent.
pub fn get_parent_api_path(api_path: &str) -> String {
    match api_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => api_path[..idx].to_owned(),
    }
}

/// Final component of an api path; empty for the root.
pub fn get_leaf(api_path: &str) -> &str {
    match api_path.rfind('/') {
        Some(idx) => &api_path[idx + 1..],
        None => api_path,
    }
}

/// Joins a parent api path with a child name, normalizing the result.
pub fn combine(parent: &str, child: &str) -> String {
    create_api_path(&format!("{parent}/{child}"))
}

/// `true` when `candidate` equals `ancestor` or lies beneath it.
pub fn is_ancestor_of(ancestor: &str, candidate: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    candidate == ancestor
        || (candidate.starts_with(ancestor)
            && candidate.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators() {
        assert_eq!(create_api_path("foo\\bar//baz"), "/foo/bar/baz");
        assert_eq!(create_api_path("//a///b"), "/a/b");
        assert_eq!(create_api_path("a/b/"), "/a/b");
    }

    #[test]
    fn root_stays_root() {
        assert_eq!(create_api_path(""), "/");
        assert_eq!(create_api_path("/"), "/");
        assert_eq!(create_api_path("\\"), "/");
    }

    #[test]
    fn parent_derivation() {
        assert_eq!(get_parent_api_path("/a/b/c"), "/a/b");
        assert_eq!(get_parent_api_path("/a"), "/");
        assert_eq!(get_parent_api_path("/"), "/");
    }

    #[test]
    fn leaf_and_combine() {
        assert_eq!(get_leaf("/a/b/c.txt"), "c.txt");
        assert_eq!(get_leaf("/"), "");
        assert_eq!(combine("/a", "b"), "/a/b");
        assert_eq!(combine("/", "b"), "/b");
    }

    #[test]
    fn ancestry() {
        assert!(is_ancestor_of("/a", "/a/b"));
        assert!(is_ancestor_of("/a", "/a"));
        assert!(!is_ancestor_of("/a", "/ab"));
        assert!(is_ancestor_of("/", "/anything"));
    }
}
