//! Compose-style environment variable expressions and `.env` files.
//!
//! Recognized shapes:
//!
//! | Syntax | Semantics |
//! |---|---|
//! | `${VAR}` | lookup; unresolved is left literal |
//! | `${VAR:-default}` | `VAR` if set and non-empty, else default |
//! | `${VAR-default}` | `VAR` if set (even empty), else default |

use anyhow::{Context, anyhow};

mod env_file;

pub use env_file::EnvFile;

/// How a default is selected when the variable is unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultKind {
  /// `:-` — default applies when unset or empty.
  UnsetOrEmpty,
  /// `-` — default applies only when unset.
  Unset,
}

/// One `${…}` expression inside a larger value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarExpr {
  pub name: String,
  pub default: Option<(DefaultKind, String)>,
}

impl VarExpr {
  /// Parse the interior of `${…}` (braces already stripped).
  fn parse_inner(inner: &str) -> Option<VarExpr> {
    let name_end = inner
      .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
      .unwrap_or(inner.len());
    if name_end == 0 {
      return None;
    }
    let name = inner[..name_end].to_string();
    let rest = &inner[name_end..];
    let default = if let Some(default) = rest.strip_prefix(":-") {
      Some((DefaultKind::UnsetOrEmpty, default.to_string()))
    } else if let Some(default) = rest.strip_prefix('-') {
      Some((DefaultKind::Unset, default.to_string()))
    } else if rest.is_empty() {
      None
    } else {
      // Unsupported operator (`:?`, `:+`, …)
      return None;
    };
    Some(VarExpr { name, default })
  }
}

/// Find the first `${…}` expression in `value`. Returns the byte
/// span of the whole expression and its parse.
pub fn find_expr(value: &str) -> Option<(std::ops::Range<usize>, VarExpr)> {
  let start = value.find("${")?;
  let end = value[start..].find('}')? + start;
  let expr = VarExpr::parse_inner(&value[start + 2..end])?;
  Some((start..end + 1, expr))
}

/// Expand every recognized `${…}` expression in `input`.
/// Unresolved plain references are left literal.
pub fn expand(
  input: &str,
  lookup: impl Fn(&str) -> Option<String>,
) -> String {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;
  while let Some((range, expr)) = find_expr(rest) {
    out.push_str(&rest[..range.start]);
    let looked_up = lookup(&expr.name);
    match (&looked_up, &expr.default) {
      (Some(value), Some((DefaultKind::UnsetOrEmpty, default))) => {
        if value.is_empty() {
          out.push_str(default);
        } else {
          out.push_str(value);
        }
      }
      (Some(value), _) => out.push_str(value),
      (None, Some((_, default))) => out.push_str(default),
      (None, None) => out.push_str(&rest[range.clone()]),
    }
    rest = &rest[range.end..];
  }
  out.push_str(rest);
  out
}

/// Replace the tag portion inside the *default* of an env-var
/// expression, eg `${APP_IMAGE:-ghcr.io/me/app:v1}` with `v2`
/// becomes `${APP_IMAGE:-ghcr.io/me/app:v2}`.
///
/// Uses last-colon semantics within the default so registry-with-port
/// forms (`host:5000/img:tag`) keep their port. A default with no
/// tag gets `:<tag>` appended. Plain `${VAR}` references cannot be
/// rewritten — the tag lives in `.env`.
pub fn rewrite_expr_tag(
  value: &str,
  new_tag: &str,
) -> anyhow::Result<String> {
  let (range, expr) = find_expr(value)
    .context("value contains no env-var expression")?;
  let (kind, default) = expr.default.as_ref().ok_or_else(|| {
    anyhow!(
      "cannot rewrite tag of plain ${{{}}} reference, the tag lives in .env",
      expr.name
    )
  })?;
  let new_default = rewrite_image_tag(default, new_tag);
  let delimiter = match kind {
    DefaultKind::UnsetOrEmpty => ":-",
    DefaultKind::Unset => "-",
  };
  let mut out = String::with_capacity(value.len());
  out.push_str(&value[..range.start]);
  out.push_str("${");
  out.push_str(&expr.name);
  out.push_str(delimiter);
  out.push_str(&new_default);
  out.push('}');
  out.push_str(&value[range.end..]);
  Ok(out)
}

/// Replace the tag of a literal image reference using last-colon
/// semantics. Appends `:<tag>` when the reference carries none.
pub fn rewrite_image_tag(image: &str, new_tag: &str) -> String {
  match image.rsplit_once(':') {
    // A colon inside the registry host (before the last `/`) is a
    // port, not a tag separator.
    Some((name, tag)) if !tag.contains('/') => {
      format!("{name}:{new_tag}")
    }
    _ => format!("{image}:{new_tag}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: std::collections::HashMap<String, String> = pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    move |name: &str| map.get(name).cloned()
  }

  #[test]
  fn plain_reference_expands_or_stays_literal() {
    let lookup = env(&[("APP_TAG", "v3")]);
    assert_eq!(expand("img:${APP_TAG}", &lookup), "img:v3");
    assert_eq!(expand("img:${MISSING}", &lookup), "img:${MISSING}");
  }

  #[test]
  fn colon_dash_default_requires_non_empty() {
    let lookup = env(&[("EMPTY", ""), ("SET", "x")]);
    assert_eq!(expand("${EMPTY:-fallback}", &lookup), "fallback");
    assert_eq!(expand("${SET:-fallback}", &lookup), "x");
    assert_eq!(expand("${MISSING:-fallback}", &lookup), "fallback");
  }

  #[test]
  fn dash_default_accepts_empty_value() {
    let lookup = env(&[("EMPTY", "")]);
    assert_eq!(expand("${EMPTY-fallback}", &lookup), "");
    assert_eq!(expand("${MISSING-fallback}", &lookup), "fallback");
  }

  #[test]
  fn rewrite_inside_default() {
    let rewritten = rewrite_expr_tag(
      "${APP_IMAGE:-ghcr.io/me/app:v1}",
      "v2",
    )
    .unwrap();
    assert_eq!(rewritten, "${APP_IMAGE:-ghcr.io/me/app:v2}");
  }

  #[test]
  fn rewrite_keeps_registry_port() {
    let rewritten = rewrite_expr_tag(
      "${APP_IMAGE:-registry.example.com:5000/myapp:v1}",
      "v2",
    )
    .unwrap();
    assert_eq!(
      rewritten,
      "${APP_IMAGE:-registry.example.com:5000/myapp:v2}"
    );
  }

  #[test]
  fn rewrite_appends_when_default_has_no_tag() {
    let rewritten =
      rewrite_expr_tag("${APP_IMAGE-nginx}", "1.27").unwrap();
    assert_eq!(rewritten, "${APP_IMAGE-nginx:1.27}");
  }

  #[test]
  fn rewrite_rejects_plain_reference() {
    assert!(rewrite_expr_tag("${APP_IMAGE}", "v2").is_err());
  }

  #[test]
  fn literal_rewrite_uses_last_colon() {
    assert_eq!(
      rewrite_image_tag("registry.example.com:5000/myapp:v1", "v2"),
      "registry.example.com:5000/myapp:v2"
    );
    assert_eq!(
      rewrite_image_tag("registry.example.com:5000/myapp", "v2"),
      "registry.example.com:5000/myapp:v2"
    );
    assert_eq!(rewrite_image_tag("nginx:1.25.3", "1.25.4"), "nginx:1.25.4");
  }
}
