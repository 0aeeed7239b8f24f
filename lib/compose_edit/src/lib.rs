//! # Compose Edit
//!
//! Loads compose files (following `include:` graphs), binds a
//! service by container name or service key, and performs
//! structure-preserving edits: label add / set / remove, image tag
//! rewrite, timestamped backup, atomic save.
//!
//! The YAML parse is only a read model. All mutations are
//! line-level surgery on the raw text, so comments, ordering,
//! anchors and quoting survive and a round-trip with no logical
//! changes is byte-identical.

use std::{
  collections::HashMap,
  fs,
  io::Write,
  path::{Path, PathBuf},
};

use anyhow::{Context, anyhow};
use serde_yaml_ng::Value;

mod scan;

use scan::{declared_key, indent_of, is_blank_or_comment, key_line};

/// Bounded `include:` recursion depth.
const MAX_INCLUDE_DEPTH: usize = 8;

/// Result of an image-tag edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEdit {
  /// The compose file was edited in place.
  Edited,
  /// The image is a plain `${VAR}` reference; the tag lives in
  /// `.env` and the compose file was left untouched.
  NeedsEnvFile { var: String },
}

/// A loaded compose file plus its parse.
#[derive(Debug, Clone)]
pub struct ComposeFile {
  path: PathBuf,
  lines: Vec<String>,
  trailing_newline: bool,
  doc: Value,
}

impl ComposeFile {
  pub fn load(path: impl AsRef<Path>) -> anyhow::Result<ComposeFile> {
    let path = path.as_ref().to_path_buf();
    let text = fs::read_to_string(&path).with_context(|| {
      format!("failed to read compose file at {path:?}")
    })?;
    ComposeFile::parse(path, &text)
  }

  pub fn parse(
    path: PathBuf,
    text: &str,
  ) -> anyhow::Result<ComposeFile> {
    let doc = serde_yaml_ng::from_str(text).with_context(|| {
      format!("compose file at {path:?} is not valid yaml")
    })?;
    Ok(ComposeFile {
      path,
      lines: text.split('\n').map(String::from).collect(),
      trailing_newline: text.is_empty() || text.ends_with('\n'),
      doc,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn contents(&self) -> String {
    // split('\n') turns a trailing newline into a final empty
    // element, so join restores the original bytes exactly.
    self.lines.join("\n")
  }

  pub fn services(&self) -> Option<&serde_yaml_ng::Mapping> {
    self.doc.get("services")?.as_mapping()
  }

  /// Included file paths declared by this file, resolved relative
  /// to it.
  pub fn includes(&self) -> Vec<PathBuf> {
    let Some(entries) =
      self.doc.get("include").and_then(Value::as_sequence)
    else {
      return Vec::new();
    };
    let base = self
      .path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_default();
    let mut paths = Vec::new();
    for entry in entries {
      match entry {
        Value::String(path) => paths.push(base.join(path)),
        Value::Mapping(mapping) => {
          let path_value = mapping.iter().find_map(|(key, value)| {
            (key.as_str() == Some("path")).then_some(value)
          });
          match path_value {
            Some(Value::String(path)) => paths.push(base.join(path)),
            Some(Value::Sequence(list)) => paths.extend(
              list
                .iter()
                .filter_map(Value::as_str)
                .map(|path| base.join(path)),
            ),
            _ => {}
          };
        }
        _ => {}
      }
    }
    paths
  }

  /// The service key bound to `target`: a service declaring
  /// `container_name: <target>` wins, then a service key equal to
  /// `target`.
  pub fn bind_service(&self, target: &str) -> Option<String> {
    let services = self.services()?;
    for (key, service) in services {
      let name = service
        .get("container_name")
        .and_then(Value::as_str);
      if name == Some(target) {
        return key.as_str().map(String::from);
      }
    }
    services.iter().find_map(|(key, _)| {
      (key.as_str() == Some(target)).then(|| target.to_string())
    })
  }

  /// Copy the file to a timestamped sibling. Returns the backup
  /// path.
  pub fn backup(&self, timestamp: i64) -> anyhow::Result<PathBuf> {
    let file_name = self
      .path
      .file_name()
      .and_then(|name| name.to_str())
      .with_context(|| {
        format!("compose path {:?} has no file name", self.path)
      })?;
    let backup_path = self
      .path
      .with_file_name(format!("{file_name}.backup.{timestamp}"));
    fs::copy(&self.path, &backup_path).with_context(|| {
      format!("failed to copy compose backup to {backup_path:?}")
    })?;
    Ok(backup_path)
  }

  /// Atomic save: temp file in the same directory, fsync, rename.
  pub fn save(&self) -> anyhow::Result<()> {
    let directory = self.path.parent().with_context(|| {
      format!("compose path {:?} has no parent", self.path)
    })?;
    let temp_path = directory.join(format!(
      ".docksmith.compose.{}.tmp",
      std::process::id()
    ));
    let mut file =
      fs::File::create(&temp_path).with_context(|| {
        format!("failed to create temp file at {temp_path:?}")
      })?;
    file
      .write_all(self.contents().as_bytes())
      .context("failed to write temp compose file")?;
    file.sync_all().context("failed to sync temp compose file")?;
    drop(file);
    fs::rename(&temp_path, &self.path).with_context(|| {
      format!("failed to move temp file over {:?}", self.path)
    })
  }
}

/// Walk the `include:` graph from `path` until a file binding
/// `target` is found. `.yml` / `.yaml` are interchangeable.
pub fn find_service_file(
  path: impl AsRef<Path>,
  target: &str,
) -> anyhow::Result<(ComposeFile, String)> {
  find_service_file_inner(path.as_ref(), target, MAX_INCLUDE_DEPTH)
}

fn find_service_file_inner(
  path: &Path,
  target: &str,
  depth: usize,
) -> anyhow::Result<(ComposeFile, String)> {
  let path = existing_variant(path).with_context(|| {
    format!("compose file not found at {path:?}")
  })?;
  let file = ComposeFile::load(&path)?;
  if let Some(service) = file.bind_service(target) {
    return Ok((file, service));
  }
  if file.services().is_some() {
    return Err(anyhow!(
      "service for container {target} not found in {path:?}"
    ));
  }
  let includes = file.includes();
  if includes.is_empty() {
    return Err(anyhow!(
      "compose file {path:?} has no services section and no include list"
    ));
  }
  if depth == 0 {
    return Err(anyhow!(
      "include graph at {path:?} exceeds maximum depth"
    ));
  }
  for include in includes {
    if let Ok(found) =
      find_service_file_inner(&include, target, depth - 1)
    {
      return Ok(found);
    }
  }
  Err(anyhow!(
    "service for container {target} not found via include graph of {path:?}"
  ))
}

/// Try the path as given, then with its `.yml` / `.yaml` extension
/// swapped.
fn existing_variant(path: &Path) -> Option<PathBuf> {
  if path.is_file() {
    return Some(path.to_path_buf());
  }
  let swapped = match path.extension().and_then(|e| e.to_str()) {
    Some("yml") => path.with_extension("yaml"),
    Some("yaml") => path.with_extension("yml"),
    _ => return None,
  };
  swapped.is_file().then_some(swapped)
}

/// Label node style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LabelStyle {
  Sequence,
  Mapping,
  /// `labels:` with no entries yet; defaults to sequence on first
  /// write.
  Empty,
}

/// Located service block: line indices into the file.
#[derive(Debug, Clone, Copy)]
struct Block {
  header: usize,
  indent: usize,
  /// Exclusive.
  end: usize,
}

/// An editor bound to one service of one compose file.
#[derive(Debug, Clone)]
pub struct ServiceEditor {
  file: ComposeFile,
  service: String,
}

impl ServiceEditor {
  /// Bind `target` (container name, then service key) starting at
  /// `path`, following includes.
  pub fn bind(
    path: impl AsRef<Path>,
    target: &str,
  ) -> anyhow::Result<ServiceEditor> {
    let (file, service) = find_service_file(path, target)?;
    Ok(ServiceEditor { file, service })
  }

  pub fn from_file(
    file: ComposeFile,
    target: &str,
  ) -> anyhow::Result<ServiceEditor> {
    let service = file.bind_service(target).with_context(|| {
      format!(
        "service for container {target} not found in {:?}",
        file.path
      )
    })?;
    Ok(ServiceEditor { file, service })
  }

  pub fn path(&self) -> &Path {
    self.file.path()
  }

  pub fn service(&self) -> &str {
    &self.service
  }

  pub fn contents(&self) -> String {
    self.file.contents()
  }

  pub fn backup(&self, timestamp: i64) -> anyhow::Result<PathBuf> {
    self.file.backup(timestamp)
  }

  pub fn save(&self) -> anyhow::Result<()> {
    self.file.save()
  }

  fn service_value(&self) -> Option<&Value> {
    self
      .file
      .doc
      .get("services")?
      .get(self.service.as_str())
  }

  /// The raw `image` value (quotes stripped, env expressions not
  /// expanded).
  pub fn image(&self) -> Option<String> {
    self
      .service_value()?
      .get("image")
      .and_then(Value::as_str)
      .map(String::from)
  }

  pub fn container_name(&self) -> Option<String> {
    self
      .service_value()?
      .get("container_name")
      .and_then(Value::as_str)
      .map(String::from)
  }

  /// All labels regardless of node style.
  pub fn labels(&self) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let Some(node) = self.service_value().and_then(|service| {
      service.get("labels")
    }) else {
      return labels;
    };
    match node {
      Value::Mapping(mapping) => {
        for (key, value) in mapping {
          let Some(key) = key.as_str() else { continue };
          let value = match value {
            Value::String(value) => value.clone(),
            Value::Bool(value) => value.to_string(),
            Value::Number(value) => value.to_string(),
            Value::Null => String::new(),
            _ => continue,
          };
          labels.insert(key.to_string(), value);
        }
      }
      Value::Sequence(items) => {
        for item in items.iter().filter_map(Value::as_str) {
          match item.split_once('=') {
            Some((key, value)) => {
              labels.insert(key.to_string(), value.to_string());
            }
            None => {
              labels.insert(item.to_string(), String::new());
            }
          }
        }
      }
      _ => {}
    }
    labels
  }

  /// Rewrite the service image tag. Env-var expressions with a
  /// default are rewritten inside the default; a plain `${VAR}`
  /// reference is reported back for a `.env` edit instead.
  pub fn set_image_tag(
    &mut self,
    new_tag: &str,
  ) -> anyhow::Result<TagEdit> {
    let block = self.service_block()?;
    let (line_idx, rest_offset) = self
      .find_child(&block, "image")
      .context("service has no image key")?;
    let line = &self.file.lines[line_idx];
    let span = scan::value_span(line, rest_offset);
    let raw = &line[span.clone()];
    let (inner, quote) = match raw.chars().next() {
      Some(quote @ ('"' | '\''))
        if raw.len() >= 2 && raw.ends_with(quote) =>
      {
        (&raw[1..raw.len() - 1], Some(quote))
      }
      _ => (raw, None),
    };
    let new_inner = if inner.contains("${") {
      match environment::find_expr(inner) {
        Some((_, expr)) if expr.default.is_none() => {
          return Ok(TagEdit::NeedsEnvFile { var: expr.name });
        }
        Some(_) => environment::rewrite_expr_tag(inner, new_tag)?,
        None => {
          return Err(anyhow!(
            "unsupported env-var expression in image value '{inner}'"
          ));
        }
      }
    } else {
      environment::rewrite_image_tag(inner, new_tag)
    };
    let new_raw = match quote {
      Some(quote) => format!("{quote}{new_inner}{quote}"),
      None => new_inner,
    };
    let mut new_line = String::with_capacity(line.len());
    new_line.push_str(&line[..span.start]);
    new_line.push_str(&new_raw);
    new_line.push_str(&line[span.end..]);
    self.replace_line(line_idx, new_line)?;
    Ok(TagEdit::Edited)
  }

  /// Replace an existing label in place (preserving node style and
  /// quoting), otherwise append it.
  pub fn set_label(
    &mut self,
    key: &str,
    value: &str,
  ) -> anyhow::Result<()> {
    let (style, header, item_indent, items_end) =
      self.ensure_labels_node()?;
    match style {
      LabelStyle::Sequence | LabelStyle::Empty => {
        for idx in header + 1..items_end {
          let line = self.file.lines[idx].clone();
          if is_blank_or_comment(&line)
            || indent_of(&line) != item_indent
          {
            continue;
          }
          let Some(item) = line.trim_start().strip_prefix('-')
          else {
            continue;
          };
          let item = item.trim_start();
          let (inner, quote) = strip_quotes(item);
          let item_key =
            inner.split_once('=').map(|(k, _)| k).unwrap_or(inner);
          if item_key != key {
            continue;
          }
          let entry = format!("{key}={value}");
          let entry = match quote {
            Some(quote) => format!("{quote}{entry}{quote}"),
            None => entry,
          };
          let new_line =
            format!("{}- {entry}", " ".repeat(item_indent));
          return self.replace_line(idx, new_line);
        }
        let new_line = format!(
          "{}- {key}={value}",
          " ".repeat(item_indent)
        );
        self.insert_line(items_end, new_line)
      }
      LabelStyle::Mapping => {
        for idx in header + 1..items_end {
          let line = self.file.lines[idx].clone();
          if is_blank_or_comment(&line)
            || indent_of(&line) != item_indent
          {
            continue;
          }
          if let Some(rest) = key_line(&line, key) {
            let rest_offset = line.len() - rest.len();
            let span = scan::value_span(&line, rest_offset);
            let (_, quote) = strip_quotes(&line[span.clone()]);
            let new_value = match quote {
              Some(quote) => format!("{quote}{value}{quote}"),
              None => yaml_scalar(value),
            };
            let mut new_line = String::new();
            new_line.push_str(&line[..span.start]);
            new_line.push_str(&new_value);
            new_line.push_str(&line[span.end..]);
            return self.replace_line(idx, new_line);
          }
        }
        let new_line = format!(
          "{}{key}: {}",
          " ".repeat(item_indent),
          yaml_scalar(value)
        );
        self.insert_line(items_end, new_line)
      }
    }
  }

  /// Remove a label. No-op (Ok(false)) when absent.
  pub fn remove_label(
    &mut self,
    key: &str,
  ) -> anyhow::Result<bool> {
    let block = self.service_block()?;
    let Some((header, _)) = self.find_child(&block, "labels")
    else {
      return Ok(false);
    };
    let Some((style, item_indent, items_end)) =
      self.labels_layout(header, block.end)
    else {
      return Ok(false);
    };
    for idx in header + 1..items_end {
      let line = &self.file.lines[idx];
      if is_blank_or_comment(line)
        || indent_of(line) != item_indent
      {
        continue;
      }
      let found = match style {
        LabelStyle::Sequence => {
          line.trim_start().strip_prefix('-').is_some_and(
            |item| {
              let (inner, _) = strip_quotes(item.trim_start());
              let item_key = inner
                .split_once('=')
                .map(|(k, _)| k)
                .unwrap_or(inner);
              item_key == key
            },
          )
        }
        LabelStyle::Mapping => key_line(line, key).is_some(),
        LabelStyle::Empty => false,
      };
      if found {
        self.remove_line(idx)?;
        return Ok(true);
      }
    }
    Ok(false)
  }

  // ---- text surgery ----

  fn services_section(&self) -> anyhow::Result<Block> {
    let header = self
      .file
      .lines
      .iter()
      .position(|line| {
        indent_of(line) == 0 && key_line(line, "services").is_some()
      })
      .context("compose file has no services section")?;
    let mut end = self.file.lines.len();
    for idx in header + 1..self.file.lines.len() {
      let line = &self.file.lines[idx];
      if !is_blank_or_comment(line) && indent_of(line) == 0 {
        end = idx;
        break;
      }
    }
    Ok(Block {
      header,
      indent: 0,
      end,
    })
  }

  fn service_block(&self) -> anyhow::Result<Block> {
    let section = self.services_section()?;
    let child_indent = self
      .first_child_indent(section.header, section.end)
      .context("services section is empty")?;
    let header = (section.header + 1..section.end)
      .find(|&idx| {
        let line = &self.file.lines[idx];
        indent_of(line) == child_indent
          && declared_key(line) == Some(self.service.as_str())
      })
      .with_context(|| {
        format!("service {} not found", self.service)
      })?;
    let mut end = section.end;
    for idx in header + 1..section.end {
      let line = &self.file.lines[idx];
      if !is_blank_or_comment(line)
        && indent_of(line) <= child_indent
      {
        end = idx;
        break;
      }
    }
    Ok(Block {
      header,
      indent: child_indent,
      end,
    })
  }

  fn first_child_indent(
    &self,
    header: usize,
    end: usize,
  ) -> Option<usize> {
    let parent_indent = indent_of(&self.file.lines[header]);
    (header + 1..end).find_map(|idx| {
      let line = &self.file.lines[idx];
      if is_blank_or_comment(line) {
        return None;
      }
      let indent = indent_of(line);
      (indent > parent_indent).then_some(indent)
    })
  }

  /// Find a direct child key of the service block. Returns the line
  /// index and the byte offset of the text after `key:`.
  fn find_child(
    &self,
    block: &Block,
    key: &str,
  ) -> Option<(usize, usize)> {
    let child_indent =
      self.first_child_indent(block.header, block.end)?;
    (block.header + 1..block.end).find_map(|idx| {
      let line = &self.file.lines[idx];
      if is_blank_or_comment(line)
        || indent_of(line) != child_indent
      {
        return None;
      }
      key_line(line, key)
        .map(|rest| (idx, line.len() - rest.len()))
    })
  }

  /// Style, item indent and end of the labels node at `header`.
  fn labels_layout(
    &self,
    header: usize,
    block_end: usize,
  ) -> Option<(LabelStyle, usize, usize)> {
    let labels_indent = indent_of(&self.file.lines[header]);
    let mut style = LabelStyle::Empty;
    let mut item_indent = labels_indent + 2;
    let mut end = header + 1;
    for idx in header + 1..block_end {
      let line = &self.file.lines[idx];
      if is_blank_or_comment(line) {
        continue;
      }
      let indent = indent_of(line);
      if indent <= labels_indent {
        break;
      }
      if style == LabelStyle::Empty {
        item_indent = indent;
        style = if line.trim_start().starts_with('-') {
          LabelStyle::Sequence
        } else {
          LabelStyle::Mapping
        };
      }
      end = idx + 1;
    }
    Some((style, item_indent, end))
  }

  /// Locate the labels node, creating an empty one (sequence style
  /// by default) at the end of the service block when absent.
  /// Returns (style, header index, item indent, items end).
  fn ensure_labels_node(
    &mut self,
  ) -> anyhow::Result<(LabelStyle, usize, usize, usize)> {
    let block = self.service_block()?;
    if let Some((header, _)) = self.find_child(&block, "labels") {
      let (style, item_indent, end) = self
        .labels_layout(header, block.end)
        .context("labels node layout")?;
      return Ok((style, header, item_indent, end));
    }
    let child_indent = self
      .first_child_indent(block.header, block.end)
      .unwrap_or(block.indent + 2);
    // Insert before any trailing blank lines of the block.
    let mut insert_at = block.end;
    while insert_at > block.header + 1
      && self.file.lines[insert_at - 1].trim().is_empty()
    {
      insert_at -= 1;
    }
    let header_line =
      format!("{}labels:", " ".repeat(child_indent));
    self.insert_line(insert_at, header_line)?;
    Ok((
      LabelStyle::Empty,
      insert_at,
      child_indent + 2,
      insert_at + 1,
    ))
  }

  fn replace_line(
    &mut self,
    idx: usize,
    line: String,
  ) -> anyhow::Result<()> {
    let old = std::mem::replace(&mut self.file.lines[idx], line);
    self.resync(|file| {
      file.lines[idx] = old;
    })
  }

  fn insert_line(
    &mut self,
    idx: usize,
    line: String,
  ) -> anyhow::Result<()> {
    self.file.lines.insert(idx, line);
    self.resync(|file| {
      file.lines.remove(idx);
    })
  }

  fn remove_line(&mut self, idx: usize) -> anyhow::Result<()> {
    let old = self.file.lines.remove(idx);
    self.resync(move |file| {
      file.lines.insert(idx, old);
    })
  }

  /// Re-parse the read model after an edit; revert on parse
  /// failure so the file on disk can never be corrupted.
  fn resync(
    &mut self,
    revert: impl FnOnce(&mut ComposeFile),
  ) -> anyhow::Result<()> {
    match serde_yaml_ng::from_str(&self.file.contents()) {
      Ok(doc) => {
        self.file.doc = doc;
        Ok(())
      }
      Err(e) => {
        revert(&mut self.file);
        Err(anyhow!("edit produced invalid yaml: {e}"))
      }
    }
  }
}

fn strip_quotes(raw: &str) -> (&str, Option<char>) {
  match raw.chars().next() {
    Some(quote @ ('"' | '\''))
      if raw.len() >= 2 && raw.ends_with(quote) =>
    {
      (&raw[1..raw.len() - 1], Some(quote))
    }
    _ => (raw, None),
  }
}

/// Quote a mapping-style label value only when YAML requires it.
fn yaml_scalar(value: &str) -> String {
  let needs_quoting = value.is_empty()
    || value.contains(": ")
    || value.contains(" #")
    || value.starts_with(['#', '&', '*', '!', '|', '>', '@', '`'])
    || value.starts_with(['\'', '"', '[', ']', '{', '}'])
    || value.ends_with(':');
  if needs_quoting {
    format!("\"{}\"", value.replace('"', "\\\""))
  } else {
    value.to_string()
  }
}

#[cfg(test)]
mod tests;
