use std::cmp::Ordering;

use docksmith_client::entities::update::ChangeKind;
use regex::Regex;

use crate::{ParsedTag, TagKind, change_kind, compare, parse, suffix_compatible};

/// Label-driven candidate restriction, resolved once per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
  /// Same major segment.
  Major,
  /// Same major and minor segments.
  Minor,
  /// Same major, minor and patch; only revision / build changes.
  Patch,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionPolicy {
  pub pin: Option<PinLevel>,
  pub tag_regex: Option<Regex>,
}

impl SelectionPolicy {
  fn admits(&self, current: &ParsedTag, candidate: &ParsedTag) -> bool {
    if let Some(regex) = &self.tag_regex {
      if !regex.is_match(&candidate.raw) {
        return false;
      }
    }
    match self.pin {
      Some(PinLevel::Major) => candidate.major() == current.major(),
      Some(PinLevel::Minor) => {
        candidate.major() == current.major()
          && candidate.minor() == current.minor()
      }
      Some(PinLevel::Patch) => {
        candidate.major() == current.major()
          && candidate.minor() == current.minor()
          && candidate.patch() == current.patch()
      }
      None => true,
    }
  }
}

/// The best admissible candidate, strictly newer than `current`.
#[derive(Debug, Clone)]
pub struct Selected {
  pub tag: String,
  pub parsed: ParsedTag,
  pub change: ChangeKind,
}

/// Select the best update candidate: same kind
/// only, suffix-compatible, policy-admitted, strictly newer than
/// the current tag; ties resolved by the tag ordering itself.
pub fn select_candidate(
  current: &ParsedTag,
  candidates: &[String],
  policy: &SelectionPolicy,
) -> Option<Selected> {
  if !matches!(current.kind, TagKind::Semantic | TagKind::Date) {
    return None;
  }
  let mut best: Option<ParsedTag> = None;
  for raw in candidates {
    let candidate = parse(raw);
    if candidate.kind != current.kind {
      continue;
    }
    if !suffix_compatible(
      current.suffix_str(),
      candidate.suffix_str(),
    ) {
      continue;
    }
    if !policy.admits(current, &candidate) {
      continue;
    }
    if compare(current, &candidate) != Some(Ordering::Less) {
      continue;
    }
    best = match best {
      Some(previous)
        if compare(&previous, &candidate)
          != Some(Ordering::Less) =>
      {
        Some(previous)
      }
      _ => Some(candidate),
    };
  }
  best.map(|parsed| Selected {
    tag: parsed.raw.clone(),
    change: change_kind(current, &parsed),
    parsed,
  })
}
