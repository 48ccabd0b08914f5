//! Path sanitisation for torrent-supplied file names.
//!
//! Torrents name their files; we put those names on a real filesystem.
//! Every component is scrubbed the same way on every platform so a
//! torrent downloaded on Linux can be seeded from Windows unchanged.

// https://docs.microsoft.com/en-us/windows/win32/fileio/naming-a-file
const RESERVED_NAMES: &[&str] = &[
    "AUX", "CON", "NUL", "PRN", //
    "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9", //
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9", //
];

fn is_reserved_char(ch: char) -> bool {
    matches!(ch, '"' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|') || (ch as u32) <= 31
}

fn is_reserved_name(name: &str) -> bool {
    if name == "." || name == ".." {
        return true;
    }
    // reserved DOS names match exactly or as a "NAME." extension prefix
    let upper = name.to_ascii_uppercase();
    RESERVED_NAMES.iter().any(|r| {
        upper == *r || (upper.starts_with(r) && upper.as_bytes().get(r.len()) == Some(&b'.'))
    })
}

/// Scrub one path component. Idempotent; the result never contains
/// reserved characters and never matches a reserved name. May return an
/// empty string, which callers drop.
pub fn sanitize_component(component: &str) -> String {
    // leading/trailing whitespace and trailing dots confuse Windows
    let stripped = component
        .trim_start_matches(|c: char| c.is_whitespace())
        .trim_end_matches(|c: char| c.is_whitespace() || c == '.');

    let mut out = String::with_capacity(stripped.len() + 1);
    if is_reserved_name(stripped) {
        out.push('_');
    }
    for ch in stripped.chars() {
        out.push(if is_reserved_char(ch) { '_' } else { ch });
    }
    out
}

/// Scrub a `/`-separated subpath, dropping components that scrub away
/// entirely.
pub fn sanitize_subpath(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for component in path.split('/') {
        let clean = sanitize_component(component);
        if clean.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&clean);
    }
    out
}

/// Leftover files that should not keep a directory alive when cleaning
/// up after a move: OS metadata droppings and AppleDouble forks.
pub fn is_junk_file(name: &str) -> bool {
    if name.starts_with("._") {
        return true;
    }
    matches!(name, ".DS_Store" | "Thumbs.db" | "desktop.ini")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names_get_prefixed() {
        assert_eq!(sanitize_component("CON"), "_CON");
        assert_eq!(sanitize_component("con"), "_con");
        assert_eq!(sanitize_component("COM1.txt"), "_COM1.txt");
        assert_eq!(sanitize_component("console"), "console");
        assert_eq!(sanitize_component("LPT9"), "_LPT9");
    }

    #[test]
    fn test_reserved_chars_replaced() {
        assert_eq!(sanitize_component("a<b>c:d"), "a_b_c_d");
        assert_eq!(sanitize_component("x|y?z*"), "x_y_z_");
        assert_eq!(sanitize_component("tab\tchar"), "tab_char");
        assert_eq!(sanitize_component("bell\x07"), "bell_");
    }

    #[test]
    fn test_strip_whitespace_and_trailing_dots() {
        assert_eq!(sanitize_component("  name  "), "name");
        assert_eq!(sanitize_component("name..."), "name");
        assert_eq!(sanitize_component("name. . "), "name");
        assert_eq!(sanitize_component(".hidden"), ".hidden");
    }

    #[test]
    fn test_dot_components_vanish() {
        assert_eq!(sanitize_component("."), "");
        assert_eq!(sanitize_component(".."), "");
        assert_eq!(sanitize_subpath("a/./../b"), "a/b");
    }

    #[test]
    fn test_subpath_seed_scenario() {
        assert_eq!(sanitize_subpath("foo/CON/bar."), "foo/_CON/bar");
    }

    #[test]
    fn test_idempotent() {
        for p in [
            "foo/CON/bar.",
            "  sp aced  /x...",
            "a<b/c|d",
            "CON.tar.gz/..",
            "._fork/.DS_Store",
            "ünïcødé/ok",
        ] {
            let once = sanitize_subpath(p);
            assert_eq!(sanitize_subpath(&once), once, "not idempotent for {p:?}");
        }
    }

    #[test]
    fn test_no_reserved_chars_survive() {
        let out = sanitize_subpath("a<>:\"\\|?*b/\x01\x1f");
        for ch in out.chars() {
            assert!(!is_reserved_char(ch), "reserved char {ch:?} in {out:?}");
        }
    }

    #[test]
    fn test_junk_files() {
        assert!(is_junk_file(".DS_Store"));
        assert!(is_junk_file("Thumbs.db"));
        assert!(is_junk_file("._resource"));
        assert!(!is_junk_file("data.bin"));
    }
}
