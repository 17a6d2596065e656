//! Service checks
//!
//! The Scheduler only depends on the [`Checker`] trait. [`ServiceChecker`] is
//! the stock implementation: a TCP connect for `tcp` checks and an HTTP GET
//! authenticated with the team's current credential for `http` checks.
//! Timeouts are enforced by the Scheduler, not here.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, ScoreError};
use crate::types::{CheckOutcome, CheckSpec, Credential, ServiceKind, Team};

/// Check capability: given a check and its current credential, report a status
#[async_trait]
pub trait Checker: Send + Sync {
    /// `Err(TransientCheckFailure)` means the service could not be reached.
    async fn check(
        &self,
        team: &Team,
        check: &CheckSpec,
        credential: &Credential,
    ) -> Result<CheckOutcome>;
}

pub struct ServiceChecker {
    http: reqwest::Client,
}

impl ServiceChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| ScoreError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    async fn check_tcp(&self, check: &CheckSpec) -> Result<CheckOutcome> {
        let started = Instant::now();
        tokio::net::TcpStream::connect(&check.target)
            .await
            .map_err(|e| {
                ScoreError::TransientCheckFailure(format!("connect {}: {}", check.target, e))
            })?;
        Ok(CheckOutcome::up(started.elapsed().as_millis() as u64))
    }

    async fn check_http(&self, check: &CheckSpec, credential: &Credential) -> Result<CheckOutcome> {
        let url = http_url(check);
        let mut request = self.http.get(&url);
        if !credential.username.is_empty() {
            request = request.basic_auth(&credential.username, Some(&credential.secret));
        }

        let started = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| ScoreError::TransientCheckFailure(format!("GET {}: {}", url, e)))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = response.status();
        debug!("GET {} -> {}", url, status);
        let outcome = if status.is_success() {
            CheckOutcome::up(latency_ms)
        } else if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            CheckOutcome::down(format!("credential rejected ({})", status))
        } else {
            CheckOutcome::down(format!("unexpected status {}", status))
        };
        Ok(CheckOutcome {
            latency_ms,
            ..outcome
        })
    }
}

#[async_trait]
impl Checker for ServiceChecker {
    async fn check(
        &self,
        _team: &Team,
        check: &CheckSpec,
        credential: &Credential,
    ) -> Result<CheckOutcome> {
        match check.service {
            ServiceKind::Tcp => self.check_tcp(check).await,
            ServiceKind::Http => self.check_http(check, credential).await,
        }
    }
}

fn http_url(check: &CheckSpec) -> String {
    let path = check.path.as_deref().unwrap_or("/");
    if path.starts_with('/') {
        format!("http://{}{}", check.target, path)
    } else {
        format!("http://{}/{}", check.target, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CheckStatus;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn spec(service: ServiceKind, target: String, path: Option<&str>) -> CheckSpec {
        CheckSpec {
            name: "svc".to_string(),
            service,
            target,
            path: path.map(str::to_string),
            username: "admin".to_string(),
            password: None,
        }
    }

    fn team() -> Team {
        Team {
            id: 1,
            name: "team1".to_string(),
            checks: vec![],
            persist_token: None,
        }
    }

    fn credential() -> Credential {
        Credential {
            username: "admin".to_string(),
            secret: "s3cret".to_string(),
            generation: 0,
            rotated_at: Utc::now(),
            rotated_round: 0,
        }
    }

    /// Serve one HTTP response per accepted connection
    async fn serve(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[test]
    fn test_http_url() {
        let target = "10.1.1.5:8080".to_string();
        assert_eq!(
            http_url(&spec(ServiceKind::Http, target.clone(), None)),
            "http://10.1.1.5:8080/"
        );
        assert_eq!(
            http_url(&spec(ServiceKind::Http, target.clone(), Some("login"))),
            "http://10.1.1.5:8080/login"
        );
        assert_eq!(
            http_url(&spec(ServiceKind::Http, target, Some("/health"))),
            "http://10.1.1.5:8080/health"
        );
    }

    #[tokio::test]
    async fn test_tcp_check_up_and_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let checker = ServiceChecker::new(Duration::from_secs(2)).unwrap();

        let outcome = checker
            .check(&team(), &spec(ServiceKind::Tcp, addr.clone(), None), &credential())
            .await
            .unwrap();
        assert_eq!(outcome.status, CheckStatus::Up);

        drop(listener);
        let result = checker
            .check(&team(), &spec(ServiceKind::Tcp, addr, None), &credential())
            .await;
        assert!(matches!(result, Err(ScoreError::TransientCheckFailure(_))));
    }

    #[tokio::test]
    async fn test_http_status_mapping() {
        let checker = ServiceChecker::new(Duration::from_secs(2)).unwrap();

        let ok = serve("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok").await;
        let outcome = checker
            .check(&team(), &spec(ServiceKind::Http, ok, Some("/")), &credential())
            .await
            .unwrap();
        assert_eq!(outcome.status, CheckStatus::Up);

        let denied =
            serve("HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let outcome = checker
            .check(&team(), &spec(ServiceKind::Http, denied, None), &credential())
            .await
            .unwrap();
        assert_eq!(outcome.status, CheckStatus::Down);
        assert!(outcome.detail.unwrap().contains("credential rejected"));
    }
}
