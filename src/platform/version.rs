use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version `{0}`")]
    InvalidVersion(String),

    #[error("invalid version range `{0}`")]
    InvalidRange(String),
}

/// A concrete runtime version with one to three numeric components.
///
/// Missing components compare as zero, so `3.11` and `3.11.0` are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    pub major: u64,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor: Some(minor),
            patch: Some(patch),
        }
    }

    fn from_parts(parts: &[u64]) -> Self {
        Self {
            major: parts.first().copied().unwrap_or(0),
            minor: parts.get(1).copied(),
            patch: parts.get(2).copied(),
        }
    }

    fn triple(&self) -> (u64, u64, u64) {
        (
            self.major,
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        )
    }

    /// Component by position, zero when absent.
    fn component(&self, index: usize) -> u64 {
        match index {
            0 => self.major,
            1 => self.minor.unwrap_or(0),
            _ => self.patch.unwrap_or(0),
        }
    }

    fn next_patch(&self) -> Self {
        let (major, minor, patch) = self.triple();
        Self::new(major, minor, patch + 1)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{}", patch)?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionError;

    /// Accepts an optional leading `v` and ignores any non-numeric suffix
    /// (`3.12.1rc1` parses as `3.12.1`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let numeric: String = body
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let numeric = numeric.trim_end_matches('.');

        if numeric.is_empty() {
            return Err(VersionError::InvalidVersion(s.to_string()));
        }

        let parts = numeric
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionError::InvalidVersion(s.to_string()))?;

        if parts.len() > 3 {
            return Err(VersionError::InvalidVersion(s.to_string()));
        }

        Ok(Self::from_parts(&parts))
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Comparator {
    /// Leading components must match exactly (`2.x`, `3.11`, `18.16.0`).
    Prefix(Vec<u64>),
    Cmp(Op, Version),
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        match self {
            Comparator::Prefix(parts) => parts
                .iter()
                .enumerate()
                .all(|(i, p)| v.component(i) == *p),
            Comparator::Cmp(op, bound) => {
                let ord = v.cmp(bound);
                match op {
                    Op::Eq => ord == Ordering::Equal,
                    Op::Gt => ord == Ordering::Greater,
                    Op::Ge => ord != Ordering::Less,
                    Op::Lt => ord == Ordering::Less,
                    Op::Le => ord != Ordering::Greater,
                }
            }
        }
    }

    fn lower_bound(&self) -> Option<Version> {
        match self {
            Comparator::Prefix(parts) => Some(Version::from_parts(parts)),
            Comparator::Cmp(Op::Eq | Op::Ge, v) => Some(v.clone()),
            Comparator::Cmp(Op::Gt, v) => Some(v.next_patch()),
            Comparator::Cmp(Op::Lt | Op::Le, _) => None,
        }
    }
}

/// A version range a task requires for one capability.
///
/// Grammar: `*`, `latest` or `any`; wildcards `2.x` / `2.*`; bare partial
/// versions (`3.11`) which match by prefix; comparators `>=`, `>`, `<=`, `<`,
/// `=`/`==`; caret `^18.2`; tilde `~1.2`; pessimistic `~>`/`~=`. Several
/// comparators separated by commas or whitespace must all hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionReq {
    raw: String,
    comparators: Vec<Comparator>,
}

impl VersionReq {
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            comparators: Vec::new(),
        }
    }

    /// Range matching exactly the components `version` spells out.
    pub fn exact(version: &Version) -> Self {
        let mut parts = vec![version.major];
        parts.extend(version.minor);
        parts.extend(version.patch);
        Self {
            raw: version.to_string(),
            comparators: vec![Comparator::Prefix(parts)],
        }
    }

    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    /// Lowest version the range admits, if it has a lower bound.
    pub fn floor(&self) -> Option<Version> {
        self.comparators
            .iter()
            .filter_map(Comparator::lower_bound)
            .max()
    }

    /// Whether two ranges plausibly admit a common version. Ranges without a
    /// lower bound are treated as compatible with everything.
    pub fn is_compatible_with(&self, other: &VersionReq) -> bool {
        match (self.floor(), other.floor()) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => other.matches(&a) || self.matches(&b),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn parse_wildcard(token: &str, raw: &str) -> Result<Option<Comparator>, VersionError> {
    let mut parts = Vec::new();
    for piece in token.trim_start_matches(['v', 'V']).split('.') {
        if piece == "x" || piece == "X" || piece == "*" {
            break;
        }
        let n = piece
            .parse::<u64>()
            .map_err(|_| VersionError::InvalidRange(raw.to_string()))?;
        parts.push(n);
    }
    if parts.len() > 3 {
        return Err(VersionError::InvalidRange(raw.to_string()));
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Comparator::Prefix(parts)))
    }
}

fn parse_bound(rest: &str, raw: &str) -> Result<Version, VersionError> {
    let cleaned: String = rest
        .split('.')
        .take_while(|p| !matches!(*p, "x" | "X" | "*"))
        .collect::<Vec<_>>()
        .join(".");
    cleaned
        .parse()
        .map_err(|_| VersionError::InvalidRange(raw.to_string()))
}

fn count_components(rest: &str) -> usize {
    rest.trim_start_matches(['v', 'V'])
        .split('.')
        .take_while(|p| p.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .count()
}

fn parse_token(token: &str, raw: &str, out: &mut Vec<Comparator>) -> Result<(), VersionError> {
    if let Some(rest) = token.strip_prefix(">=") {
        out.push(Comparator::Cmp(Op::Ge, parse_bound(rest, raw)?));
    } else if let Some(rest) = token.strip_prefix("<=") {
        out.push(Comparator::Cmp(Op::Le, parse_bound(rest, raw)?));
    } else if let Some(rest) = token.strip_prefix("==") {
        out.extend(parse_wildcard(rest, raw)?);
    } else if let Some(rest) = token
        .strip_prefix("~>")
        .or_else(|| token.strip_prefix("~="))
    {
        // Pessimistic: the last given component may grow.
        let v = parse_bound(rest, raw)?;
        let upper = match count_components(rest) {
            0 | 1 => Version::new(v.major + 1, 0, 0),
            2 => Version::new(v.major + 1, 0, 0),
            _ => Version::new(v.major, v.component(1) + 1, 0),
        };
        out.push(Comparator::Cmp(Op::Ge, v));
        out.push(Comparator::Cmp(Op::Lt, upper));
    } else if let Some(rest) = token.strip_prefix('>') {
        out.push(Comparator::Cmp(Op::Gt, parse_bound(rest, raw)?));
    } else if let Some(rest) = token.strip_prefix('<') {
        out.push(Comparator::Cmp(Op::Lt, parse_bound(rest, raw)?));
    } else if let Some(rest) = token.strip_prefix('=') {
        out.extend(parse_wildcard(rest, raw)?);
    } else if let Some(rest) = token.strip_prefix('^') {
        let v = parse_bound(rest, raw)?;
        let upper = if v.major > 0 || v.minor.is_none() {
            Version::new(v.major + 1, 0, 0)
        } else if v.component(1) > 0 || v.patch.is_none() {
            Version::new(0, v.component(1) + 1, 0)
        } else {
            Version::new(0, 0, v.component(2) + 1)
        };
        out.push(Comparator::Cmp(Op::Ge, v));
        out.push(Comparator::Cmp(Op::Lt, upper));
    } else if let Some(rest) = token.strip_prefix('~') {
        let v = parse_bound(rest, raw)?;
        let upper = if v.minor.is_some() {
            Version::new(v.major, v.component(1) + 1, 0)
        } else {
            Version::new(v.major + 1, 0, 0)
        };
        out.push(Comparator::Cmp(Op::Ge, v));
        out.push(Comparator::Cmp(Op::Lt, upper));
    } else {
        out.extend(parse_wildcard(token, raw)?);
    }
    Ok(())
}

impl FromStr for VersionReq {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.contains("||") || raw.contains("!=") {
            return Err(VersionError::InvalidRange(s.to_string()));
        }
        if matches!(
            raw.to_ascii_lowercase().as_str(),
            "" | "*" | "x" | "latest" | "any"
        ) {
            return Ok(Self {
                raw: if raw.is_empty() { "*".to_string() } else { raw.to_string() },
                comparators: Vec::new(),
            });
        }

        // Glue operators separated from their version (`>= 3.8`).
        let mut tokens: Vec<String> = Vec::new();
        let mut pending_op: Option<String> = None;
        for piece in raw.split(|c: char| c == ',' || c.is_whitespace()) {
            if piece.is_empty() {
                continue;
            }
            if piece.chars().all(|c| "<>=~^".contains(c)) {
                pending_op = Some(piece.to_string());
                continue;
            }
            match pending_op.take() {
                Some(op) => tokens.push(format!("{op}{piece}")),
                None => tokens.push(piece.to_string()),
            }
        }
        if pending_op.is_some() {
            return Err(VersionError::InvalidRange(s.to_string()));
        }

        let mut comparators = Vec::new();
        for token in &tokens {
            parse_token(token, raw, &mut comparators)?;
        }

        Ok(Self {
            raw: raw.to_string(),
            comparators,
        })
    }
}

impl TryFrom<String> for VersionReq {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VersionReq> for String {
    fn from(r: VersionReq) -> Self {
        r.raw
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
