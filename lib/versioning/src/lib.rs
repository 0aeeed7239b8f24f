//! # Versioning
//!
//! Parses image tags into comparable shapes and selects update
//! candidates.
//!
//! A tag is classified as one of: semantic (optionally v-prefixed,
//! up to 4 numeric segments, optional prerelease, optional platform
//! suffix, optional `-lsNNN` build number), date (`YYYY.MM.DD`,
//! `YYYY-MM-DD`, `YYYYMMDD`, `YYYY.M.D`), commit hash (pure hex of
//! at least 7 chars, or `sha<N>-<hex>`), meta (`latest`, `stable`,
//! …), or unknown. Tags of different kinds are incomparable.

use std::{cmp::Ordering, sync::LazyLock};

use regex::Regex;

mod select;

pub use select::{PinLevel, Selected, SelectionPolicy, select_candidate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TagKind {
  Semantic,
  Date,
  Hash,
  Meta,
  #[default]
  Unknown,
}

/// A parsed image tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTag {
  pub raw: String,
  pub kind: TagKind,
  /// Numeric segments: major, minor, patch, revision.
  pub segments: Vec<u64>,
  pub prerelease: Option<String>,
  /// Platform variant (`alpine`, `bookworm`, `alpine3.19`). Never
  /// affects ordering.
  pub suffix: Option<String>,
  /// LinuxServer-style `-ls297` build number.
  pub build_number: Option<u64>,
  pub date: Option<(i32, u32, u32)>,
}

impl ParsedTag {
  pub fn major(&self) -> u64 {
    self.segments.first().copied().unwrap_or(0)
  }
  pub fn minor(&self) -> u64 {
    self.segments.get(1).copied().unwrap_or(0)
  }
  pub fn patch(&self) -> u64 {
    self.segments.get(2).copied().unwrap_or(0)
  }
  pub fn revision(&self) -> u64 {
    self.segments.get(3).copied().unwrap_or(0)
  }

  pub fn suffix_str(&self) -> &str {
    self.suffix.as_deref().unwrap_or("")
  }
}

const META_TAGS: &[&str] = &[
  "latest", "stable", "main", "master", "develop", "dev", "edge",
  "nightly", "beta", "alpha", "rc",
];

const ARCH_PREFIXES: &[&str] = &[
  "amd64", "arm64v8", "arm64", "arm32v7", "arm32v6", "arm32v5",
  "armhf", "i386", "ppc64le", "s390x", "riscv64", "version",
];

static SEMANTIC: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^v?(\d+)(?:\.(\d+))?(?:\.(\d+))?(?:\.(\d+))?((?:-[0-9A-Za-z.]+)*)$")
    .unwrap()
});

static DATE_DOTTED: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(\d{4})[.-](\d{1,2})[.-](\d{1,2})$").unwrap()
});

static DATE_COMPACT: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})(\d{2})$").unwrap());

static HASH: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[0-9a-f]{7,64}$").unwrap());

static SHA_PREFIXED: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^sha\d*-[0-9a-fA-F]{7,}$").unwrap()
});

static PRERELEASE_PART: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^(?:rc|alpha|beta|pre|dev|snapshot)[0-9.]*$").unwrap()
});

static BUILD_PART: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^ls(\d+)$").unwrap());

/// Parse a tag. Never fails; unparseable tags come back with
/// `TagKind::Unknown`.
pub fn parse(tag: &str) -> ParsedTag {
  let raw = tag.to_string();
  let unknown = ParsedTag {
    raw: raw.clone(),
    ..Default::default()
  };

  if META_TAGS.contains(&tag.to_ascii_lowercase().as_str()) {
    return ParsedTag {
      raw,
      kind: TagKind::Meta,
      ..Default::default()
    };
  }

  // Architecture-prefixed tags are opaque: `amd64-1.2.3` is not a
  // semantic version of this image's primary stream.
  if let Some((prefix, _)) = tag.split_once('-') {
    if ARCH_PREFIXES.contains(&prefix) {
      return unknown;
    }
  }

  if let Some(date) = parse_date(tag) {
    return ParsedTag {
      raw,
      kind: TagKind::Date,
      date: Some(date),
      ..Default::default()
    };
  }

  // Hex beginning with a digit is a hash, never a version. Short
  // pure integers (CI build numbers) fall through to unknown.
  if SHA_PREFIXED.is_match(tag)
    || (HASH.is_match(tag)
      && tag.chars().next().is_some_and(|c| c.is_ascii_digit()))
  {
    return ParsedTag {
      raw,
      kind: TagKind::Hash,
      ..Default::default()
    };
  }
  if HASH.is_match(tag) && !tag.chars().all(|c| c.is_ascii_digit())
  {
    // Starts with a letter; only a hash when it cannot be a word
    // (contains a digit) — `deadbeef` alone is ambiguous but hex.
    return ParsedTag {
      raw,
      kind: TagKind::Hash,
      ..Default::default()
    };
  }

  if let Some(parsed) = parse_semantic(tag) {
    return parsed;
  }

  unknown
}

fn parse_date(tag: &str) -> Option<(i32, u32, u32)> {
  let caps = DATE_DOTTED
    .captures(tag)
    .or_else(|| DATE_COMPACT.captures(tag))?;
  let year: i32 = caps[1].parse().ok()?;
  let month: u32 = caps[2].parse().ok()?;
  let day: u32 = caps[3].parse().ok()?;
  ((1990..=2100).contains(&year)
    && (1..=12).contains(&month)
    && (1..=31).contains(&day))
  .then_some((year, month, day))
}

fn parse_semantic(tag: &str) -> Option<ParsedTag> {
  let caps = SEMANTIC.captures(tag)?;
  let mut segments = Vec::with_capacity(4);
  for idx in 1..=4 {
    match caps.get(idx) {
      Some(segment) => segments.push(segment.as_str().parse().ok()?),
      None => break,
    }
  }
  let has_v = tag.starts_with('v');
  let trailer = caps.get(5).map(|m| m.as_str()).unwrap_or("");

  let mut prerelease = None;
  let mut suffix_parts: Vec<&str> = Vec::new();
  let mut build_number = None;
  for part in trailer.split('-').filter(|part| !part.is_empty()) {
    if let Some(caps) = BUILD_PART.captures(part) {
      build_number = caps[1].parse().ok();
    } else if prerelease.is_none()
      && suffix_parts.is_empty()
      && PRERELEASE_PART.is_match(&part.to_ascii_lowercase())
    {
      prerelease = Some(part.to_string());
    } else {
      suffix_parts.push(part);
    }
  }

  // A bare integer (`1243`) is a CI build number, not a version.
  // One segment is only a version with a `v` prefix or trailing
  // qualifiers (`16-alpine`).
  if segments.len() == 1
    && !has_v
    && prerelease.is_none()
    && suffix_parts.is_empty()
    && build_number.is_none()
  {
    return None;
  }

  Some(ParsedTag {
    raw: tag.to_string(),
    kind: TagKind::Semantic,
    segments,
    prerelease,
    suffix: (!suffix_parts.is_empty())
      .then(|| suffix_parts.join("-")),
    build_number,
    date: None,
  })
}

/// Compare two parsed tags. Tags of different kinds are
/// incomparable (`None`).
pub fn compare(a: &ParsedTag, b: &ParsedTag) -> Option<Ordering> {
  if a.kind != b.kind {
    return None;
  }
  match a.kind {
    TagKind::Semantic => Some(compare_semantic(a, b)),
    TagKind::Date => Some(a.date.cmp(&b.date)),
    TagKind::Hash | TagKind::Meta | TagKind::Unknown => {
      (a.raw == b.raw).then_some(Ordering::Equal)
    }
  }
}

fn compare_semantic(a: &ParsedTag, b: &ParsedTag) -> Ordering {
  let key = |tag: &ParsedTag| {
    (
      tag.major(),
      tag.minor(),
      tag.patch(),
      tag.revision(),
      tag.build_number.unwrap_or(0),
    )
  };
  key(a)
    .cmp(&key(b))
    .then_with(|| {
      // No prerelease outranks any prerelease; prereleases order
      // lexicographically.
      match (&a.prerelease, &b.prerelease) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
      }
    })
    // Deterministic tie-break: more dotted components wins
    // (`v3.41.0` > `v3.41`).
    .then_with(|| a.segments.len().cmp(&b.segments.len()))
}

/// Classify the change from `current` to `candidate`.
pub fn change_kind(
  current: &ParsedTag,
  candidate: &ParsedTag,
) -> docksmith_client::entities::update::ChangeKind {
  use docksmith_client::entities::update::ChangeKind;
  let Some(order) = compare(current, candidate) else {
    return ChangeKind::Unknown;
  };
  match order {
    Ordering::Equal => ChangeKind::NoChange,
    Ordering::Greater => ChangeKind::Downgrade,
    Ordering::Less => match current.kind {
      TagKind::Semantic => {
        if candidate.major() != current.major() {
          ChangeKind::Major
        } else if candidate.minor() != current.minor() {
          ChangeKind::Minor
        } else {
          ChangeKind::Patch
        }
      }
      TagKind::Date => {
        let (cy, cm, _) = current.date.unwrap_or_default();
        let (ny, nm, _) = candidate.date.unwrap_or_default();
        if ny != cy {
          ChangeKind::Major
        } else if nm != cm {
          ChangeKind::Minor
        } else {
          ChangeKind::Patch
        }
      }
      _ => ChangeKind::Unknown,
    },
  }
}

/// The platform family of a suffix: its letters up to and including
/// the first digit (`alpine3.19` -> `alpine3`, `bookworm` ->
/// `bookworm`).
fn suffix_family(suffix: &str) -> &str {
  match suffix.find(|c: char| c.is_ascii_digit()) {
    Some(idx) => {
      let mut end = idx + 1;
      while !suffix.is_char_boundary(end) {
        end += 1;
      }
      &suffix[..end]
    }
    None => suffix,
  }
}

/// Whether a candidate's suffix may replace the current one:
/// exact match, the generic (letters-only) prefix, or the same
/// platform family. A suffix-less current never accepts a suffixed
/// candidate, and vice versa.
pub fn suffix_compatible(current: &str, candidate: &str) -> bool {
  if current == candidate {
    return true;
  }
  if current.is_empty() || candidate.is_empty() {
    return false;
  }
  let letters =
    |s: &str| !s.chars().any(|c| c.is_ascii_digit());
  // Generic variant (`alpine`) is compatible with a versioned one
  // (`alpine3.19`) in either direction.
  if letters(candidate) && current.starts_with(candidate) {
    return true;
  }
  if letters(current) && candidate.starts_with(current) {
    return true;
  }
  suffix_family(current) == suffix_family(candidate)
}
