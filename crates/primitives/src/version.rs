//! Software and firmware version parsing.
//!
//! Release strings reported by nodes are free-form, e.g.
//! `Lattice Release RELEASE_M46_2-37-gdeadbeef-builder (buildhost ...)`.
//! The parser extracts the `RELEASE_...` body, tokenizes it, and pulls out
//! major/minor numbers when the body is of the form `RELEASE_M<major>[_<minor>]`.
//! Base-config matching later works on the token list, so suffixes like
//! `-RC1` or git hashes never have to match exactly.

use std::cmp::Ordering;

const RELEASE_PREFIX: &str = "RELEASE_";

/// Parsed software version. Ordering compares (major, minor) when either
/// side parsed one, otherwise falls back to comparing the full strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwVersion {
    /// Original input, trimmed.
    pub full: String,
    /// The extracted `RELEASE_...` body (empty if the prefix was absent).
    pub body: String,
    /// Body split on `_` and `-`.
    pub tokens: Vec<String>,
    pub major: u64,
    pub minor: u64,
}

impl SwVersion {
    pub fn parse(input: &str) -> Self {
        let full = input.trim().to_owned();
        let body = match full.find(RELEASE_PREFIX) {
            Some(start) => {
                let rest = &full[start..];
                let end = rest.find('(').unwrap_or(rest.len());
                rest[..end].trim().to_owned()
            }
            None => String::new(),
        };
        let tokens: Vec<String> = body
            .split(|c| c == '_' || c == '-')
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect();

        // Major/minor only parse from the strict RELEASE_M<major>[_<minor>] shape.
        let mut major = 0;
        let mut minor = 0;
        if let Some(m) = tokens.get(1).and_then(|t| t.strip_prefix('M')) {
            if let Ok(parsed) = m.parse::<u64>() {
                major = parsed;
                minor = tokens
                    .get(2)
                    .and_then(|t| t.parse::<u64>().ok())
                    .unwrap_or(0);
            }
        }

        Self {
            full,
            body,
            tokens,
            major,
            minor,
        }
    }

    /// True if neither major nor minor parsed.
    pub fn is_unversioned(&self) -> bool {
        self.major == 0 && self.minor == 0
    }
}

impl PartialOrd for SwVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SwVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.is_unversioned() && other.is_unversioned() {
            return self.full.cmp(&other.full);
        }
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

/// Parsed firmware version. Input of the form `M.M.M.m` splits into a
/// `major` prefix (`M.M.M`) and a numeric minor; anything else keeps the
/// whole input as `major` with `minor = 0`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FwVersion {
    pub full: String,
    pub major: String,
    pub minor: u64,
}

impl FwVersion {
    pub fn parse(input: &str) -> Self {
        let full = input.trim().to_owned();
        let parts: Vec<&str> = full.split('.').collect();
        if parts.len() == 4 {
            if let Ok(minor) = parts[3].parse::<u64>() {
                return Self {
                    major: parts[..3].join("."),
                    minor,
                    full,
                };
            }
        }
        Self {
            major: full.clone(),
            minor: 0,
            full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Lattice Release RELEASE_M21 (user@host)", 21, 0; "major only")]
    #[test_case("Lattice Release RELEASE_M20_1 (user@host)", 20, 1; "major minor")]
    #[test_case("Lattice Release RELEASE_M20_4-user (x)", 20, 4; "minor with suffix")]
    #[test_case("RELEASE_M22_PRE1-83-g5be6d6b-user", 22, 0; "pre release keeps major")]
    #[test_case(" asdf  ", 0, 0; "unparsed")]
    fn sw_version_major_minor(input: &str, major: u64, minor: u64) {
        let v = SwVersion::parse(input);
        assert_eq!((v.major, v.minor), (major, minor), "{input}");
    }

    #[test]
    fn sw_version_tokens() {
        let v = SwVersion::parse("Release RELEASE_M22_PRE1-83-gabc-user (x)");
        assert_eq!(v.tokens[0], "RELEASE");
        assert_eq!(v.tokens[1], "M22");
        assert_eq!(v.tokens[2], "PRE1");
    }

    #[test]
    fn sw_version_ordering() {
        let m20_1 = SwVersion::parse("RELEASE_M20_1");
        let m20_4 = SwVersion::parse("RELEASE_M20_4");
        let m21 = SwVersion::parse("RELEASE_M21");
        assert!(m20_1 < m20_4);
        assert!(m20_4 < m21);
    }

    #[test_case("10.6.0.1", "10.6.0", 1; "standard")]
    #[test_case("10.11.0.329", "10.11.0", 329; "long minor")]
    #[test_case("weird", "weird", 0; "unparsed keeps input")]
    fn fw_version_parse(input: &str, major: &str, minor: u64) {
        let v = FwVersion::parse(input);
        assert_eq!(v.major, major);
        assert_eq!(v.minor, minor);
    }
}
