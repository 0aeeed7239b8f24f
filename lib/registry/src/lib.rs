//! # Registry
//!
//! OCI distribution client for the two calls Docksmith needs:
//! `list_tags` and `head_manifest`. Auth strategy: use a provided
//! token when the credential provider has one for the registry,
//! else try an anonymous token exchange (public images), else
//! fail.

use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
  time::Duration,
};

use async_trait::async_trait;
use docksmith_client::entities::ImageRef;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("authentication failed for {0}")]
  Auth(String),
  #[error("image not found: {0}")]
  NotFound(String),
  #[error("registry rate limited request")]
  RateLimited,
  #[error("registry returned status {0}")]
  Status(u16),
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),
}

impl RegistryError {
  /// Rate limits and transport errors are worth a backoff-retry;
  /// auth / not-found are not.
  pub fn retryable(&self) -> bool {
    match self {
      RegistryError::RateLimited => true,
      RegistryError::Network(e) => {
        e.is_timeout() || e.is_connect()
      }
      RegistryError::Status(status) => *status >= 500,
      _ => false,
    }
  }
}

/// Opaque credential source. Registry domain -> bearer token.
pub trait CredentialProvider: Send + Sync {
  fn token(&self, registry: &str) -> Option<String>;
}

/// Config-backed provider.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub HashMap<String, String>);

impl CredentialProvider for StaticCredentials {
  fn token(&self, registry: &str) -> Option<String> {
    self.0.get(registry).cloned()
  }
}

/// The registry capability set consumed by the background checker.
#[async_trait]
pub trait TagRegistry: Send + Sync {
  async fn list_tags(
    &self,
    image: &ImageRef,
  ) -> Result<Vec<String>, RegistryError>;

  /// Digest of the manifest (list) currently behind a tag.
  async fn head_manifest(
    &self,
    image: &ImageRef,
  ) -> Result<String, RegistryError>;
}

const TAGS_PAGE_SIZE: usize = 200;

/// List tags with capped-exponential backoff on retryable
/// failures (429, 5xx, transport), bounded by `attempts`.
pub async fn list_tags_with_retry(
  registry: &dyn TagRegistry,
  image: &ImageRef,
  attempts: u32,
) -> Result<Vec<String>, RegistryError> {
  let attempts = attempts.max(1);
  let mut delay = Duration::from_millis(500);
  for attempt in 1..=attempts {
    match registry.list_tags(image).await {
      Ok(tags) => return Ok(tags),
      Err(e) if e.retryable() && attempt < attempts => {
        tracing::debug!(
          image = %image,
          attempt,
          "registry retry after {delay:?} | {e}"
        );
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(8));
      }
      Err(e) => return Err(e),
    }
  }
  unreachable!("loop returns on last attempt")
}

pub struct RegistryClient {
  http: reqwest::Client,
  credentials: Arc<dyn CredentialProvider>,
  /// registry/repository -> bearer token
  token_cache: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
  token: Option<String>,
  access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
  #[serde(default)]
  tags: Option<Vec<String>>,
}

impl RegistryClient {
  pub fn new(
    credentials: Arc<dyn CredentialProvider>,
  ) -> RegistryClient {
    RegistryClient {
      http: reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .expect("failed to build http client"),
      credentials,
      token_cache: Default::default(),
    }
  }

  /// API host and repository for a parsed reference. Docker Hub
  /// gets its registry host and `library/` namespace filled in.
  fn normalize(image: &ImageRef) -> (String, String) {
    let registry = match image.registry.as_str() {
      "" | "docker.io" => String::from("registry-1.docker.io"),
      registry => registry.to_string(),
    };
    let repository = if image.registry.is_empty()
      && !image.repository.contains('/')
    {
      format!("library/{}", image.repository)
    } else {
      image.repository.clone()
    };
    (registry, repository)
  }

  /// Bearer token for a repository: provider token first, then
  /// anonymous exchange against the realm the registry advertises.
  async fn token_for(
    &self,
    registry: &str,
    repository: &str,
  ) -> Result<Option<String>, RegistryError> {
    if let Some(token) = self.credentials.token(registry) {
      return Ok(Some(token));
    }
    let cache_key = format!("{registry}/{repository}");
    if let Some(token) =
      self.token_cache.lock().unwrap().get(&cache_key)
    {
      return Ok(Some(token.clone()));
    }
    let probe = self
      .http
      .get(format!("https://{registry}/v2/"))
      .send()
      .await?;
    if probe.status() != reqwest::StatusCode::UNAUTHORIZED {
      // Registry serves anonymously.
      return Ok(None);
    }
    let challenge = probe
      .headers()
      .get("www-authenticate")
      .and_then(|value| value.to_str().ok())
      .unwrap_or_default()
      .to_string();
    let Some(token) =
      self.anonymous_token(&challenge, repository).await?
    else {
      return Err(RegistryError::Auth(registry.to_string()));
    };
    self
      .token_cache
      .lock()
      .unwrap()
      .insert(cache_key, token.clone());
    Ok(Some(token))
  }

  /// Anonymous token exchange from a `Bearer realm=…,service=…`
  /// challenge.
  async fn anonymous_token(
    &self,
    challenge: &str,
    repository: &str,
  ) -> Result<Option<String>, RegistryError> {
    let fields: HashMap<&str, &str> = challenge
      .trim_start_matches("Bearer ")
      .split(',')
      .filter_map(|part| {
        let (key, value) = part.split_once('=')?;
        Some((key.trim(), value.trim().trim_matches('"')))
      })
      .collect();
    let Some(realm) = fields.get("realm") else {
      return Ok(None);
    };
    let mut url =
      format!("{realm}?scope=repository:{repository}:pull");
    if let Some(service) = fields.get("service") {
      url.push_str(&format!("&service={service}"));
    }
    tracing::debug!("anonymous token exchange at {url}");
    let response = self.http.get(&url).send().await?;
    if !response.status().is_success() {
      return Ok(None);
    }
    let token: TokenResponse = response.json().await?;
    Ok(token.token.or(token.access_token))
  }

  fn bearer(
    request: reqwest::RequestBuilder,
    token: Option<&str>,
  ) -> reqwest::RequestBuilder {
    match token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  fn check_status(
    status: reqwest::StatusCode,
    what: &str,
  ) -> Result<(), RegistryError> {
    if status.is_success() {
      return Ok(());
    }
    match status.as_u16() {
      401 | 403 => Err(RegistryError::Auth(what.to_string())),
      404 => Err(RegistryError::NotFound(what.to_string())),
      429 => Err(RegistryError::RateLimited),
      status => Err(RegistryError::Status(status)),
    }
  }
}

#[async_trait]
impl TagRegistry for RegistryClient {
  async fn list_tags(
    &self,
    image: &ImageRef,
  ) -> Result<Vec<String>, RegistryError> {
    let (registry, repository) = Self::normalize(image);
    let token = self.token_for(&registry, &repository).await?;
    let mut tags = Vec::new();
    let mut last: Option<String> = None;
    loop {
      let mut url = format!(
        "https://{registry}/v2/{repository}/tags/list?n={TAGS_PAGE_SIZE}"
      );
      if let Some(last) = &last {
        url.push_str(&format!("&last={last}"));
      }
      let response = Self::bearer(
        self.http.get(&url),
        token.as_deref(),
      )
      .send()
      .await?;
      Self::check_status(
        response.status(),
        &format!("{registry}/{repository}"),
      )?;
      let page: TagsResponse = response.json().await?;
      let page = page.tags.unwrap_or_default();
      let page_len = page.len();
      last = page.last().cloned();
      tags.extend(page);
      if page_len < TAGS_PAGE_SIZE || last.is_none() {
        break;
      }
    }
    Ok(tags)
  }

  async fn head_manifest(
    &self,
    image: &ImageRef,
  ) -> Result<String, RegistryError> {
    let (registry, repository) = Self::normalize(image);
    let token = self.token_for(&registry, &repository).await?;
    let url = format!(
      "https://{registry}/v2/{repository}/manifests/{}",
      image.tag
    );
    let response = Self::bearer(
      self.http.head(&url),
      token.as_deref(),
    )
    .header(
      reqwest::header::ACCEPT,
      "application/vnd.oci.image.index.v1+json, \
       application/vnd.docker.distribution.manifest.list.v2+json, \
       application/vnd.docker.distribution.manifest.v2+json",
    )
    .send()
    .await?;
    Self::check_status(response.status(), &image.to_string())?;
    response
      .headers()
      .get("docker-content-digest")
      .and_then(|value| value.to_str().ok())
      .map(String::from)
      .ok_or_else(|| {
        RegistryError::NotFound(format!(
          "digest header for {image}"
        ))
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalizes_docker_hub_references() {
    let (registry, repository) =
      RegistryClient::normalize(&ImageRef::parse("nginx:1.25"));
    assert_eq!(registry, "registry-1.docker.io");
    assert_eq!(repository, "library/nginx");

    let (registry, repository) = RegistryClient::normalize(
      &ImageRef::parse("linuxserver/radarr:5.2.6"),
    );
    assert_eq!(registry, "registry-1.docker.io");
    assert_eq!(repository, "linuxserver/radarr");

    let (registry, repository) = RegistryClient::normalize(
      &ImageRef::parse("ghcr.io/me/app:v1"),
    );
    assert_eq!(registry, "ghcr.io");
    assert_eq!(repository, "me/app");
  }

  #[test]
  fn retryable_classification() {
    assert!(RegistryError::RateLimited.retryable());
    assert!(RegistryError::Status(503).retryable());
    assert!(!RegistryError::Status(400).retryable());
    assert!(
      !RegistryError::Auth(String::from("ghcr.io")).retryable()
    );
    assert!(
      !RegistryError::NotFound(String::from("x")).retryable()
    );
  }
}
