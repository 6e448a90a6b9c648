//! Slash-style remote path helpers.
//!
//! Remote paths are always absolute, `/`-separated and never end with a slash (except the root
//! itself). Backslashes are treated as separators so that listings coming from Windows-hosted
//! sources map onto the same tree.

/// Normalize `path` into an absolute, slash-separated path without `.`/`..` or empty segments.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

pub fn join(base: &str, name: &str) -> String {
    normalize(&format!("{base}/{name}"))
}

/// Parent directory of `path`, `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last segment of `path`, empty for the root.
pub fn file_name(path: &str) -> String {
    let path = normalize(path);
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Every directory from the top-most one down to `path` itself, root excluded.
///
/// `/a/b/c` yields `["/a", "/a/b", "/a/b/c"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let path = normalize(path);
    let mut result = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        result.push(current.clone());
    }
    result
}

/// Path of `path` relative to `root` (without a leading slash), `None` if it lies outside.
pub fn relative_to(root: &str, path: &str) -> Option<String> {
    let root = normalize(root);
    let path = normalize(path);
    if root == "/" {
        return Some(path.trim_start_matches('/').to_string());
    }
    if path == root {
        return Some(String::new());
    }
    path.strip_prefix(&root)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(str::to_string)
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(
            byte,
            b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')'
        )
}

/// Percent-encode a single path segment (everything but unreserved characters).
pub fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if is_unreserved(byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Normalize `path` and percent-encode each of its segments, keeping the separators.
pub fn encode_path(path: &str) -> String {
    let path = normalize(path);
    if path == "/" {
        return path;
    }
    path.split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim, invalid UTF-8 is replaced.
pub fn decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' && idx + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[idx + 1..idx + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                decoded.push(byte);
                idx += 3;
                continue;
            }
        }
        decoded.push(bytes[idx]);
        idx += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Make `name` usable as a single file or directory name on any common filesystem.
pub fn sanitize_segment(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == ' ' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize(""), "/");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("a/b/"), "/a/b");
        assert_eq!(normalize("//a//./b/../c"), "/a/c");
        assert_eq!(normalize("\\share\\docs"), "/share/docs");
        assert_eq!(normalize("/../.."), "/");
    }

    #[test]
    fn parents_and_ancestors() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/".to_string()));
        assert_eq!(parent("/a/b/c.txt"), Some("/a/b".to_string()));
        assert_eq!(ancestors("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert!(ancestors("/").is_empty());
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_to("/", "/a/b"), Some("a/b".to_string()));
        assert_eq!(relative_to("/src", "/src/a/b"), Some("a/b".to_string()));
        assert_eq!(relative_to("/src", "/src"), Some(String::new()));
        assert_eq!(relative_to("/src", "/srcx/a"), None);
        assert_eq!(relative_to("/src", "/other"), None);
    }

    #[test]
    fn encodes_segments() {
        assert_eq!(encode_segment("a b&c"), "a%20b%26c");
        assert_eq!(encode_segment("报告.pdf"), "%E6%8A%A5%E5%91%8A.pdf");
        assert_eq!(encode_path("/dir one/file#1"), "/dir%20one/file%231");
        assert_eq!(encode_path("/"), "/");
    }

    #[test]
    fn decodes_escapes() {
        assert_eq!(decode("a%20b"), "a b");
        assert_eq!(decode("%E6%8A%A5"), "报");
        assert_eq!(decode("100%"), "100%");
        assert_eq!(decode("%zz"), "%zz");
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize_segment("example.com:8080"), "example.com_8080");
        assert_eq!(sanitize_segment("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_segment(" .. "), "_");
        assert_eq!(sanitize_segment("q?*\"<>|"), "q______");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(path in "[a-z./\\\\]{0,24}") {
            let once = normalize(&path);
            prop_assert_eq!(normalize(&once), once.clone());
            prop_assert!(once.starts_with('/'));
            prop_assert!(once == "/" || !once.ends_with('/'));
        }

        #[test]
        fn encoded_segments_decode_back(segment in "\\PC{0,16}") {
            prop_assert_eq!(decode(&encode_segment(&segment)), segment);
        }
    }
}
