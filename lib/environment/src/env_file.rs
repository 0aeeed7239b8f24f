use std::{
  fs,
  io::Write,
  path::{Path, PathBuf},
};

use anyhow::Context;

/// A `.env` file held as raw lines so edits preserve comments,
/// blank lines, ordering and quoting exactly.
#[derive(Debug, Clone)]
pub struct EnvFile {
  path: PathBuf,
  lines: Vec<String>,
  /// Whether the source ended with a newline.
  trailing_newline: bool,
}

impl EnvFile {
  pub fn load(path: impl AsRef<Path>) -> anyhow::Result<EnvFile> {
    let path = path.as_ref().to_path_buf();
    let text = fs::read_to_string(&path).with_context(|| {
      format!("failed to read env file at {path:?}")
    })?;
    Ok(EnvFile::from_str_at(path, &text))
  }

  fn from_str_at(path: PathBuf, text: &str) -> EnvFile {
    EnvFile {
      path,
      lines: text.lines().map(String::from).collect(),
      trailing_newline: text.is_empty() || text.ends_with('\n'),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// The unquoted value of `key`, if assigned.
  pub fn get(&self, key: &str) -> Option<String> {
    self.lines.iter().find_map(|line| {
      let (line_key, value) = split_assignment(line)?;
      (line_key == key).then(|| unquote(value).to_string())
    })
  }

  /// Assign `key = value`, editing the existing line in place and
  /// keeping its quote style, or appending a new unquoted line.
  pub fn set(&mut self, key: &str, value: &str) {
    for line in self.lines.iter_mut() {
      let Some((line_key, old_value)) = split_assignment(line)
      else {
        continue;
      };
      if line_key != key {
        continue;
      }
      let prefix_len = line.len() - old_value.len();
      let prefix = &line[..prefix_len];
      let new_value = match old_value.chars().next() {
        Some(quote @ ('"' | '\'')) => {
          format!("{quote}{value}{quote}")
        }
        _ => value.to_string(),
      };
      *line = format!("{prefix}{new_value}");
      return;
    }
    self.lines.push(format!("{key}={value}"));
  }

  pub fn contents(&self) -> String {
    let mut out = self.lines.join("\n");
    if self.trailing_newline && !self.lines.is_empty() {
      out.push('\n');
    }
    out
  }

  /// Atomic save: temp file in the same directory, fsync, rename.
  pub fn save(&self) -> anyhow::Result<()> {
    let directory = self.path.parent().with_context(|| {
      format!("env file path {:?} has no parent", self.path)
    })?;
    let mut temp = tempfile_in(directory)?;
    temp
      .1
      .write_all(self.contents().as_bytes())
      .with_context(|| {
        format!("failed to write temp env file in {directory:?}")
      })?;
    temp.1.sync_all().context("failed to sync temp env file")?;
    drop(temp.1);
    fs::rename(&temp.0, &self.path).with_context(|| {
      format!("failed to move temp env file over {:?}", self.path)
    })
  }
}

/// `KEY=value` split, tolerating leading whitespace and `export `.
/// Returns (key, raw value including quotes).
fn split_assignment(line: &str) -> Option<(&str, &str)> {
  let trimmed = line.trim_start();
  if trimmed.starts_with('#') {
    return None;
  }
  let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
  let (key, value) = trimmed.split_once('=')?;
  let key = key.trim();
  if key.is_empty()
    || !key
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_')
  {
    return None;
  }
  Some((key, value))
}

fn unquote(value: &str) -> &str {
  let value = value.trim();
  for quote in ['"', '\''] {
    if value.len() >= 2
      && value.starts_with(quote)
      && value.ends_with(quote)
    {
      return &value[1..value.len() - 1];
    }
  }
  value
}

fn tempfile_in(
  directory: &Path,
) -> anyhow::Result<(PathBuf, fs::File)> {
  let path = directory.join(format!(
    ".env.docksmith.{}.tmp",
    std::process::id()
  ));
  let file = fs::File::create(&path).with_context(|| {
    format!("failed to create temp file at {path:?}")
  })?;
  Ok((path, file))
}
