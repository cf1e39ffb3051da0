use std::time::Duration;

use docflow_engine::TaskError;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{ClientError, from_status, from_transport};

/// A base URL plus the client used to reach it.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
  client: reqwest::Client,
  base: Url,
}

impl Endpoint {
  pub(crate) fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
    let base = Url::parse(base_url).map_err(|source| ClientError::InvalidUrl {
      url: base_url.to_string(),
      source,
    })?;
    if base.cannot_be_a_base() {
      return Err(ClientError::NotABase(base_url.to_string()));
    }

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    Ok(Self { client, base })
  }

  pub(crate) fn client(&self) -> &reqwest::Client {
    &self.client
  }

  /// The base URL with `segments` appended, each percent-encoded.
  pub(crate) fn url(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  /// Send `request` and decode a success body, classifying failures.
  pub(crate) async fn send<T: DeserializeOwned>(
    &self,
    request: reqwest::RequestBuilder,
  ) -> Result<T, TaskError> {
    let response = request.send().await.map_err(from_transport)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(from_status(status, &body));
    }

    response.json().await.map_err(from_transport)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_url_appends_segments() {
    let endpoint = Endpoint::new("http://workers:8000/api/", Duration::from_secs(1)).unwrap();
    assert_eq!(
      endpoint.url(&["extraction"]).as_str(),
      "http://workers:8000/api/extraction"
    );

    let endpoint = Endpoint::new("http://workers:8000", Duration::from_secs(1)).unwrap();
    assert_eq!(
      endpoint.url(&["analysis", "job 1"]).as_str(),
      "http://workers:8000/analysis/job%201"
    );
  }

  #[test]
  fn test_rejects_invalid_base() {
    assert!(matches!(
      Endpoint::new("not a url", Duration::from_secs(1)),
      Err(ClientError::InvalidUrl { .. })
    ));
    assert!(matches!(
      Endpoint::new("mailto:ops@example.com", Duration::from_secs(1)),
      Err(ClientError::NotABase(_))
    ));
  }
}
