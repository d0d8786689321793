/// Glob matcher over `/`-delimited paths.
///
/// Supported pattern segments:
/// - `users`: exact segment
/// - `*`, `api-*`, `*.json`: `*` matches any run of characters within one
///   segment
/// - `**`: as a whole segment, matches the rest of the path including zero
///   segments; when it is not last, the remaining pattern is searched with
///   memoized backtracking
///
/// Matching normalizes pattern and path first: repeated slashes collapse and
/// a trailing slash is dropped (except for `/`). `strip_prefix` works on the
/// raw path.
pub struct PathMatcher;

impl PathMatcher {
    pub fn matches(pattern: &str, path: &str) -> bool {
        let pattern = Self::normalize(pattern);
        let path = Self::normalize(path);
        let pats: Vec<&str> = segments(&pattern).collect();
        let segs: Vec<&str> = segments(&path).collect();
        match_segments(&pats, &segs)
    }

    pub fn normalize(path: &str) -> String {
        let mut out = String::with_capacity(path.len() + 1);
        out.push('/');
        for seg in segments(path) {
            if out.len() > 1 {
                out.push('/');
            }
            out.push_str(seg);
        }
        out
    }

    /// Remove the literal prefix of `pattern` (its leading segments before the
    /// first wildcard) from the raw `path`, on a segment boundary. The
    /// remainder is kept byte for byte, trailing and repeated slashes
    /// included; an empty remainder becomes `/`. Paths that do not start with
    /// the prefix come back untouched.
    pub fn strip_prefix(pattern: &str, path: &str) -> String {
        let mut rest = path;
        for literal in segments(pattern).take_while(|seg| !seg.contains('*')) {
            match rest.trim_start_matches('/').strip_prefix(literal) {
                Some(r) if r.is_empty() || r.starts_with('/') => rest = r,
                _ => {
                    rest = path;
                    break;
                }
            }
        }
        if rest.is_empty() {
            "/".to_string()
        } else {
            rest.to_string()
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Segment-level match. `**` either ends here or swallows one more segment,
/// and failed `(pattern, segment)` positions are remembered, so the work is
/// bounded by `pats.len() * segs.len()` whatever the number of `**`.
fn match_segments(pats: &[&str], segs: &[&str]) -> bool {
    let mut failed = vec![false; (pats.len() + 1) * (segs.len() + 1)];
    match_from(pats, segs, 0, 0, &mut failed)
}

fn match_from(pats: &[&str], segs: &[&str], pi: usize, si: usize, failed: &mut [bool]) -> bool {
    let key = pi * (segs.len() + 1) + si;
    if failed[key] {
        return false;
    }
    let matched = match pats.get(pi) {
        None => si == segs.len(),
        Some(&"**") if pi + 1 == pats.len() => true,
        Some(&"**") => {
            match_from(pats, segs, pi + 1, si, failed)
                || (si < segs.len() && match_from(pats, segs, pi, si + 1, failed))
        }
        Some(pat) => {
            si < segs.len()
                && segment_matches(pat, segs[si])
                && match_from(pats, segs, pi + 1, si + 1, failed)
        }
    };
    if !matched {
        failed[key] = true;
    }
    matched
}

/// `*` glob inside a single segment.
fn segment_matches(pattern: &str, segment: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == segment;
    }
    let p = pattern.as_bytes();
    let s = segment.as_bytes();
    let (mut pi, mut si) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while si < s.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = si;
            pi += 1;
        } else if pi < p.len() && p[pi] == s[si] {
            pi += 1;
            si += 1;
        } else if let Some(sp) = star {
            pi = sp + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_star_matches_rest() {
        assert!(PathMatcher::matches("/api/**", "/api/v1/users"));
        assert!(PathMatcher::matches("/api/**", "/api"));
        assert!(PathMatcher::matches("/**", "/"));
        assert!(!PathMatcher::matches("/api/**", "/other/v1"));
    }

    #[test]
    fn test_single_star_is_one_segment() {
        assert!(PathMatcher::matches("/api/*/users", "/api/v1/users"));
        assert!(!PathMatcher::matches("/api/*/users", "/api/v1/v2/users"));
        assert!(!PathMatcher::matches("/api/*", "/api"));
    }

    #[test]
    fn test_glob_within_segment() {
        assert!(PathMatcher::matches("/svc/api-*", "/svc/api-orders"));
        assert!(PathMatcher::matches("/files/*.json", "/files/a.json"));
        assert!(PathMatcher::matches("/x/a*b*c", "/x/aXXbYYc"));
        assert!(!PathMatcher::matches("/svc/api-*", "/svc/web-orders"));
        assert!(!PathMatcher::matches("/files/*.json", "/files/a.jsonx"));
    }

    #[test]
    fn test_double_star_in_middle_backtracks() {
        assert!(PathMatcher::matches("/a/**/z", "/a/z"));
        assert!(PathMatcher::matches("/a/**/z", "/a/b/c/z"));
        assert!(PathMatcher::matches("/a/**/b/**/c", "/a/x/b/y/b/c"));
        assert!(!PathMatcher::matches("/a/**/z", "/a/b/c"));
    }

    #[test]
    fn test_normalization() {
        assert!(PathMatcher::matches("/a/b", "/a/b/"));
        assert!(PathMatcher::matches("/a/b", "//a///b"));
        assert_eq!(PathMatcher::normalize("//a//b/"), "/a/b");
        assert_eq!(PathMatcher::normalize("/"), "/");
        assert_eq!(PathMatcher::normalize(""), "/");
        assert_eq!(PathMatcher::normalize("a/b"), "/a/b");
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "/svc/ping"), "/ping");
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "/svc"), "/");
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "/svc/"), "/");
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "/svcx/ping"), "/svcx/ping");
        assert_eq!(PathMatcher::strip_prefix("/**", "/a/b"), "/a/b");
        assert_eq!(PathMatcher::strip_prefix("/api/v1/*/users", "/api/v1/7/users"), "/7/users");
        assert_eq!(PathMatcher::strip_prefix("/api-*/x", "/api-a/x"), "/api-a/x");
        assert_eq!(PathMatcher::strip_prefix("/exact/path", "/exact/path"), "/");
    }

    #[test]
    fn test_strip_prefix_keeps_raw_remainder() {
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "/svc/dir/"), "/dir/");
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "/svc/a//b"), "/a//b");
        assert_eq!(PathMatcher::strip_prefix("/svc/**", "//svc/x/"), "/x/");
        assert_eq!(PathMatcher::strip_prefix("/**", "/a//b/"), "/a//b/");
        assert_eq!(PathMatcher::strip_prefix("/**", ""), "/");
    }

    #[test]
    fn test_many_double_stars_stay_linear() {
        let path = format!("/{}", vec!["a"; 400].join("/"));
        let start = std::time::Instant::now();
        assert!(!PathMatcher::matches("/**/a/**/a/**/a/**/b", &path));
        assert!(PathMatcher::matches("/**/a/**/a/**/a/**/a", &path));
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }
}
