//! Indentation-aware line scanning over raw compose text.
//!
//! Edits are performed as line-level surgery so that untouched
//! regions of the file stay byte-identical. The YAML parse in
//! `lib.rs` is the read model; this module only locates spans.

pub fn indent_of(line: &str) -> usize {
  line.len() - line.trim_start_matches(' ').len()
}

pub fn is_blank_or_comment(line: &str) -> bool {
  let trimmed = line.trim_start();
  trimmed.is_empty() || trimmed.starts_with('#')
}

/// Whether the line declares `key:` (bare or quoted), returning the
/// rest after the colon.
pub fn key_line<'a>(line: &'a str, key: &str) -> Option<&'a str> {
  let trimmed = line.trim_start();
  for candidate in [
    format!("{key}:"),
    format!("\"{key}\":"),
    format!("'{key}':"),
  ] {
    if let Some(rest) = trimmed.strip_prefix(candidate.as_str()) {
      if rest.is_empty() || rest.starts_with([' ', '\t']) {
        return Some(rest);
      }
    }
  }
  None
}

/// The key declared by a `key:`-shaped line, unquoted.
pub fn declared_key(line: &str) -> Option<&str> {
  let trimmed = line.trim_start();
  if trimmed.starts_with('#') || trimmed.starts_with('-') {
    return None;
  }
  let colon = trimmed.find(':')?;
  let rest = &trimmed[colon + 1..];
  if !(rest.is_empty() || rest.starts_with([' ', '\t'])) {
    return None;
  }
  let key = trimmed[..colon].trim();
  let key = key
    .strip_prefix('"')
    .and_then(|k| k.strip_suffix('"'))
    .or_else(|| {
      key.strip_prefix('\'').and_then(|k| k.strip_suffix('\''))
    })
    .unwrap_or(key);
  (!key.is_empty()).then_some(key)
}

/// A scalar value span within a line: the value itself (with any
/// quotes) with trailing comment and whitespace excluded.
pub fn value_span(
  line: &str,
  after_colon: usize,
) -> std::ops::Range<usize> {
  let rest = &line[after_colon..];
  let lead = rest.len() - rest.trim_start().len();
  let start = after_colon + lead;
  let value = &line[start..];
  let end = match value.chars().next() {
    Some(quote @ ('"' | '\'')) => {
      // Value ends at the closing quote.
      match value[1..].find(quote) {
        Some(close) => start + close + 2,
        None => line.len(),
      }
    }
    _ => {
      // Unquoted: ends before a ` #` comment, trailing ws trimmed.
      let cut = value.find(" #").unwrap_or(value.len());
      start + value[..cut].trim_end().len()
    }
  };
  start..end
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn key_line_matches_bare_and_quoted() {
    assert_eq!(key_line("  image: nginx", "image"), Some(" nginx"));
    assert_eq!(key_line("  \"image\": nginx", "image"), Some(" nginx"));
    assert_eq!(key_line("  images: nginx", "image"), None);
    assert_eq!(key_line("  labels:", "labels"), Some(""));
  }

  #[test]
  fn declared_key_unquotes() {
    assert_eq!(declared_key("  web:"), Some("web"));
    assert_eq!(declared_key("  \"web\":"), Some("web"));
    assert_eq!(declared_key("  - item"), None);
    assert_eq!(declared_key("  # comment"), None);
    assert_eq!(declared_key("  url: http://x"), Some("url"));
  }

  #[test]
  fn value_span_excludes_comment_and_keeps_quotes() {
    let line = "    image: nginx:1.25 # pinned";
    let span = value_span(line, line.find(':').unwrap() + 1);
    assert_eq!(&line[span], "nginx:1.25");

    let line = "    image: \"nginx:1.25 # not a comment\"";
    let span = value_span(line, line.find(':').unwrap() + 1);
    assert_eq!(&line[span], "\"nginx:1.25 # not a comment\"");
  }
}
