//! HTTP connectivity probe used by the `check` command.

use std::time::{Duration, Instant};

use anyhow::Context;
use hrs_core::ErrorClass;
use reqwest::StatusCode;
use tracing::{info_span, Instrument};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub url: String,
    pub status: Option<u16>,
    pub elapsed: Duration,
    /// `None` when the site answered with a success status.
    pub failure: Option<(ErrorClass, String)>,
}

impl ProbeReport {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// 5xx and 429 are worth retrying, 403 is the site pushing back, the rest is permanent.
pub fn classify_status(status: StatusCode) -> ErrorClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::Transient
    } else if status == StatusCode::FORBIDDEN {
        ErrorClass::Challenge
    } else {
        ErrorClass::Permanent
    }
}

/// Same as [`classify_status`] for a raw status code; unknown codes are permanent.
pub fn classify_status_code(code: u16) -> ErrorClass {
    StatusCode::from_u16(code)
        .map(classify_status)
        .unwrap_or(ErrorClass::Permanent)
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

#[derive(Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(config: ProbeConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET without retries; the report carries the classified outcome.
    pub async fn check(&self, url: &str) -> ProbeReport {
        let started = Instant::now();
        let sent = self
            .client
            .get(url)
            .send()
            .instrument(info_span!("connectivity_probe", url))
            .await;
        match sent {
            Ok(resp) => {
                let status = resp.status();
                let failure = (!status.is_success())
                    .then(|| (classify_status(status), format!("http status {status} for {url}")));
                ProbeReport {
                    url: url.to_string(),
                    status: Some(status.as_u16()),
                    elapsed: started.elapsed(),
                    failure,
                }
            }
            Err(err) => ProbeReport {
                url: url.to_string(),
                status: None,
                elapsed: started.elapsed(),
                failure: Some((classify_reqwest_error(&err), err.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ErrorClass::Transient);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorClass::Transient);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorClass::Challenge);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorClass::Permanent);
        assert_eq!(classify_status_code(503), ErrorClass::Transient);
        assert_eq!(classify_status_code(42), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let probe = HttpProbe::new(ProbeConfig {
            timeout: Duration::from_secs(2),
            user_agent: Some("hrs-test".into()),
        })
        .unwrap();
        let report = probe.check("http://127.0.0.1:9/").await;
        assert!(!report.is_ok());
        assert_eq!(report.status, None);
        assert_eq!(report.failure.map(|(class, _)| class), Some(ErrorClass::Transient));
    }
}
