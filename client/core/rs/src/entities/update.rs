use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Classification of a candidate tag relative to the current one.
///
/// Serialized by name everywhere (database text columns, event
/// payloads); numeric discriminants are not part of any contract.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
  Major,
  Minor,
  /// Includes pure revision changes (fourth segment).
  Patch,
  Downgrade,
  /// Also reported for rebuilds (same version, different digest).
  NoChange,
  #[default]
  Unknown,
}

/// Per-container result of a discovery pass.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStatus {
  UpToDate,
  /// Tracking a meta tag (`latest`, …) that could be pinned.
  UpToDatePinnable,
  UpdateAvailable,
  /// An update exists but a gate (pin, regex, precheck) blocks it.
  UpdateAvailableBlocked,
  /// Image has no repo digests; never checked against a registry.
  LocalImage,
  /// Running image differs from the compose declaration.
  ComposeMismatch,
  Ignored,
  CheckFailed,
  /// The registry returned no usable candidates.
  MetadataUnavailable,
  #[default]
  Unknown,
}

/// One container's line in the discovery snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerCheck {
  pub container_name: String,
  pub stack: Option<String>,
  pub image: String,
  pub current_version: String,
  pub latest_version: Option<String>,
  pub current_digest: Option<String>,
  pub status: UpdateStatus,
  pub change_kind: ChangeKind,
  pub checked_at: i64,
}

/// Cached result of the most recent discovery pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryResult {
  pub containers: Vec<ContainerCheck>,
  /// True while a check is in flight; on-demand triggers coalesce
  /// with it instead of starting another.
  pub checking: bool,
  pub last_check: Option<i64>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn update_status_uses_screaming_snake_case() {
    assert_eq!(
      UpdateStatus::UpdateAvailable.to_string(),
      "UPDATE_AVAILABLE"
    );
    assert_eq!(
      "METADATA_UNAVAILABLE".parse::<UpdateStatus>().unwrap(),
      UpdateStatus::MetadataUnavailable
    );
  }

  #[test]
  fn change_kind_serializes_by_name() {
    let json = serde_json::to_string(&ChangeKind::NoChange).unwrap();
    assert_eq!(json, "\"no_change\"");
  }
}
