//! Blocking retrieval with a retry budget per strategy and a rendering-proxy fallback.
//!
//! The direct GET is tried first (unless the policy forces the proxy). Only when its whole
//! retry budget is spent does the fetcher move on to the proxy, which gets a budget of its own.

mod error;
mod policy;

pub use error::FetchError;
pub use policy::{
    with_retries, Attempt, RequestOverride, RequestPolicy, DEFAULT_RETRIES,
    DEFAULT_TIMEOUT_SECS, DEFAULT_TIME_BETWEEN_RETRIES_SECS,
};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";
/// FlareSolverr-compatible endpoint used when no proxy URL is configured.
pub const DEFAULT_PROXY_URL: &str = "http://localhost:8191/v1";
const MAX_REDIRECTS: usize = 10;
/// Extra time the HTTP call to the proxy gets on top of the navigation timeout it is given.
const PROXY_GRACE_SECS: u64 = 5;

#[derive(Debug, Serialize)]
struct ProxyRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    #[serde(rename = "maxTimeout")]
    max_timeout: u64,
}

#[derive(Debug, Deserialize)]
struct ProxyEnvelope {
    solution: Option<ProxySolution>,
}

#[derive(Debug, Deserialize)]
struct ProxySolution {
    response: Option<String>,
}

/// Which strategy produced a failure; used for logging only.
#[derive(Debug, Clone, Copy)]
enum Strategy {
    Direct,
    Proxy,
}

impl Strategy {
    fn as_str(self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::Proxy => "proxy",
        }
    }
}

/// Blocking fetcher. Keeps a cookie store and enforces a delay between consecutive requests.
#[derive(Debug)]
pub struct Fetcher {
    inner: reqwest::blocking::Client,
    proxy_url: String,
    secondary_fetch: bool,
    delay: Duration,
    last_request: Option<Instant>,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::builder().build()
    }

    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::default()
    }

    /// Fetch `url` as text under `policy`.
    ///
    /// Fails with InvalidUrl for anything but absolute http(s) URLs, without touching the
    /// network. Fails with Exhausted once every permitted strategy used up its attempts.
    pub fn fetch(&mut self, url: &str, policy: &RequestPolicy) -> Result<String, FetchError> {
        check_url(url)?;
        let mut last = None;

        if !policy.force_secondary_fetch {
            match self.run_strategy(Strategy::Direct, url, policy) {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => last = Some(e),
            }
            if !self.secondary_fetch {
                return Err(exhausted(url, last));
            }
            tracing::info!(url, "direct fetch exhausted; trying rendering proxy");
        } else if !self.secondary_fetch {
            return Err(FetchError::SecondaryDisabled {
                url: url.to_string(),
            });
        }

        match self.run_strategy(Strategy::Proxy, url, policy) {
            Ok(body) => Ok(body),
            Err(e) if !e.is_transient() => Err(e),
            Err(e) => {
                last = Some(e);
                Err(exhausted(url, last))
            }
        }
    }

    fn run_strategy(
        &mut self,
        strategy: Strategy,
        url: &str,
        policy: &RequestPolicy,
    ) -> Result<String, FetchError> {
        let retries = policy.retries.max(1);
        with_retries(
            retries,
            policy.time_between_retries(),
            std::thread::sleep,
            |attempt| {
                let outcome = match strategy {
                    Strategy::Direct => self.direct_once(url, policy),
                    Strategy::Proxy => self.proxy_once(url, policy),
                };
                if let Attempt::Retry(e) = &outcome {
                    tracing::warn!(
                        url,
                        strategy = strategy.as_str(),
                        attempt,
                        retries,
                        error = %e,
                        "fetch attempt failed"
                    );
                }
                outcome
            },
        )
    }

    fn direct_once(&mut self, url: &str, policy: &RequestPolicy) -> Attempt<String, FetchError> {
        self.wait_delay();
        let result = self.inner.get(url).timeout(policy.timeout()).send();
        self.last_request = Some(Instant::now());
        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_builder() => {
                return Attempt::Abort(FetchError::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                return Attempt::Retry(FetchError::Network {
                    url: url.to_string(),
                    source: e,
                })
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Attempt::Retry(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        match response.text() {
            Ok(body) => Attempt::Done(body),
            Err(e) => Attempt::Retry(FetchError::Network {
                url: url.to_string(),
                source: e,
            }),
        }
    }

    fn proxy_once(&mut self, url: &str, policy: &RequestPolicy) -> Attempt<String, FetchError> {
        let body = ProxyRequest {
            cmd: "request.get",
            url,
            max_timeout: policy.timeout_secs.saturating_mul(1000),
        };
        self.wait_delay();
        let result = self
            .inner
            .post(&self.proxy_url)
            .json(&body)
            .timeout(policy.timeout() + Duration::from_secs(PROXY_GRACE_SECS))
            .send();
        self.last_request = Some(Instant::now());
        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_builder() => {
                return Attempt::Abort(FetchError::InvalidUrl {
                    url: self.proxy_url.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                return Attempt::Retry(FetchError::Network {
                    url: self.proxy_url.clone(),
                    source: e,
                })
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Attempt::Retry(FetchError::HttpStatus {
                url: self.proxy_url.clone(),
                status: status.as_u16(),
            });
        }
        let envelope: ProxyEnvelope = match response.json() {
            Ok(v) => v,
            Err(e) => {
                return Attempt::Retry(FetchError::ProxyResponse {
                    url: url.to_string(),
                    reason: format!("malformed JSON: {}", e),
                })
            }
        };
        match envelope.solution.and_then(|s| s.response) {
            Some(document) => Attempt::Done(document),
            None => Attempt::Retry(FetchError::ProxyResponse {
                url: url.to_string(),
                reason: "envelope has no solution.response".to_string(),
            }),
        }
    }

    fn wait_delay(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                std::thread::sleep(self.delay - elapsed);
            }
        }
    }
}

fn check_url(url: &str) -> Result<(), FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(FetchError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn exhausted(url: &str, last: Option<FetchError>) -> FetchError {
    let last = last.unwrap_or_else(|| FetchError::ProxyResponse {
        url: url.to_string(),
        reason: "no attempt was made".to_string(),
    });
    FetchError::Exhausted {
        url: url.to_string(),
        last: Box::new(last),
    }
}

/// Builder for [Fetcher].
#[derive(Debug)]
pub struct FetcherBuilder {
    user_agent: Option<String>,
    proxy_url: String,
    secondary_fetch: bool,
    delay_secs: u64,
}

impl Default for FetcherBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            secondary_fetch: true,
            delay_secs: 0,
        }
    }
}

impl FetcherBuilder {
    /// Set a custom User-Agent. If not set, a browser-like default is used.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Rendering proxy endpoint (FlareSolverr `/v1` protocol).
    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = url.into();
        self
    }

    /// Allow falling back to the rendering proxy. Default true.
    pub fn secondary_fetch(mut self, enabled: bool) -> Self {
        self.secondary_fetch = enabled;
        self
    }

    /// Minimum delay between consecutive requests in seconds. Default 0.
    pub fn delay_secs(mut self, secs: u64) -> Self {
        self.delay_secs = secs;
        self
    }

    pub fn build(self) -> Result<Fetcher, FetchError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let inner = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| FetchError::Client { source: e })?;
        Ok(Fetcher {
            inner,
            proxy_url: self.proxy_url,
            secondary_fetch: self.secondary_fetch,
            delay: Duration::from_secs(self.delay_secs),
            last_request: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_http_scheme_is_rejected_without_retry() -> Result<(), String> {
        let mut fetcher = Fetcher::new().map_err(|e| e.to_string())?;
        let policy = RequestPolicy {
            time_between_retries_secs: 30,
            ..RequestPolicy::default()
        };
        let started = Instant::now();
        match fetcher.fetch("ftp://example.com/toc", &policy) {
            Err(FetchError::InvalidUrl { url, .. }) if url == "ftp://example.com/toc" => {}
            other => return Err(format!("expected InvalidUrl, got {:?}", other)),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn relative_url_is_invalid() {
        assert!(matches!(
            check_url("/chapter-1"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(check_url("https://example.com/chapter-1").is_ok());
    }

    #[test]
    fn forced_proxy_with_secondary_disabled_fails_fast() -> Result<(), String> {
        let mut fetcher = Fetcher::builder()
            .secondary_fetch(false)
            .build()
            .map_err(|e| e.to_string())?;
        let policy = RequestPolicy {
            force_secondary_fetch: true,
            ..RequestPolicy::default()
        };
        match fetcher.fetch("https://example.com/", &policy) {
            Err(FetchError::SecondaryDisabled { .. }) => Ok(()),
            other => Err(format!("expected SecondaryDisabled, got {:?}", other)),
        }
    }

    #[test]
    fn proxy_request_serializes_protocol_fields() -> Result<(), serde_json::Error> {
        let body = ProxyRequest {
            cmd: "request.get",
            url: "https://example.com/",
            max_timeout: 20_000,
        };
        let v = serde_json::to_value(&body)?;
        assert_eq!(
            v,
            serde_json::json!({"cmd": "request.get", "url": "https://example.com/", "maxTimeout": 20000})
        );
        Ok(())
    }

    #[test]
    fn envelope_without_solution_is_accepted_by_parser() -> Result<(), serde_json::Error> {
        let env: ProxyEnvelope = serde_json::from_str(r#"{"status": "error"}"#)?;
        assert!(env.solution.is_none());
        let env: ProxyEnvelope =
            serde_json::from_str(r#"{"solution": {"response": "<html></html>", "status": 200}}"#)?;
        assert_eq!(
            env.solution.and_then(|s| s.response).as_deref(),
            Some("<html></html>")
        );
        Ok(())
    }
}
