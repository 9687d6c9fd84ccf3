//! HTTP adapter that triggers job bodies hosted by the API service.

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use murmur_application::{JobContext, LeaseGrant, ScheduledJob};
use murmur_core::{AppError, AppResult};
use murmur_domain::{ReplicaId, ScheduledJobKind};

/// Scheduled job whose body runs behind an internal API endpoint.
///
/// Each batch call carries the replica identity, the current fencing token
/// and the store-clock lease expiry. While the endpoint reports more pending work, the lease is renewed
/// and another batch is requested, up to `max_batches_per_tick`.
pub struct HttpScheduledJob {
    http_client: reqwest::Client,
    kind: ScheduledJobKind,
    endpoint: String,
    shared_secret: String,
    replica_id: ReplicaId,
    max_batches_per_tick: u32,
}

#[derive(Debug, Serialize)]
struct RunJobBatchRequest<'a> {
    job: &'a str,
    batch: u32,
    fencing_token: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RunJobBatchResponse {
    #[serde(default)]
    processed: u64,
    #[serde(default)]
    has_more: bool,
}

impl HttpScheduledJob {
    /// Creates a job adapter for `kind` against `api_base_url`.
    #[must_use]
    pub fn new(
        http_client: reqwest::Client,
        api_base_url: &str,
        shared_secret: impl Into<String>,
        kind: ScheduledJobKind,
        replica_id: ReplicaId,
        max_batches_per_tick: u32,
    ) -> Self {
        Self {
            http_client,
            kind,
            endpoint: format!(
                "{}/api/internal/jobs/{}/run",
                api_base_url.trim_end_matches('/'),
                kind.as_str()
            ),
            shared_secret: shared_secret.into(),
            replica_id,
            max_batches_per_tick: max_batches_per_tick.max(1),
        }
    }

    /// Returns the endpoint invoked for each batch.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    async fn run_batch(&self, batch: u32, grant: &LeaseGrant) -> AppResult<RunJobBatchResponse> {
        let response = self
            .http_client
            .post(self.endpoint.as_str())
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", self.shared_secret),
            )
            .header("x-murmur-replica-id", self.replica_id.as_str())
            .header("x-murmur-fencing-token", grant.fencing_token.to_string())
            .header(
                "x-murmur-lease-expiry",
                grant
                    .lease_expiry
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .header("Idempotency-Key", uuid::Uuid::new_v4().to_string())
            .json(&RunJobBatchRequest {
                job: self.kind.as_str(),
                batch,
                fencing_token: grant.fencing_token,
            })
            .send()
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to call job endpoint for '{}': {error}",
                    self.kind
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_owned());
            return Err(AppError::Internal(format!(
                "job endpoint for '{}' returned status {}: {body}",
                self.kind,
                status.as_u16()
            )));
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(RunJobBatchResponse::default());
        }

        response
            .json::<RunJobBatchResponse>()
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to parse job endpoint response for '{}': {error}",
                    self.kind
                ))
            })
    }
}

#[async_trait]
impl ScheduledJob for HttpScheduledJob {
    fn kind(&self) -> ScheduledJobKind {
        self.kind
    }

    async fn run(&self, context: &mut JobContext) -> AppResult<()> {
        let mut processed = 0_u64;

        for batch in 1..=self.max_batches_per_tick {
            let response = self.run_batch(batch, context.grant()).await?;
            processed = processed.saturating_add(response.processed);

            if !response.has_more || batch == self.max_batches_per_tick {
                break;
            }

            if !context.renew_lease().await {
                warn!(
                    job = %self.kind,
                    processed,
                    "lease lost between batches, stopping early"
                );
                break;
            }
        }

        debug!(job = %self.kind, processed, "job batches finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use murmur_application::{
        JobRunner, JobSchedule, LockCoordinator, ReleasePolicy, TickOutcome,
    };
    use murmur_domain::{LeaseDuration, ReplicaId, ScheduledJobKind};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::HttpScheduledJob;
    use crate::InMemoryLockStore;

    async fn serve_batches(listener: TcpListener, bodies: Vec<&'static str>) -> Vec<String> {
        let mut requests = Vec::new();

        for body in bodies {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };

            let mut buffer = Vec::new();
            let mut chunk = [0_u8; 1024];
            let header_end = loop {
                let read = socket.read(&mut chunk).await.unwrap_or(0);
                if read == 0 {
                    break None;
                }
                buffer.extend_from_slice(&chunk[..read]);
                if let Some(position) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                    break Some(position + 4);
                }
            };
            let Some(header_end) = header_end else {
                break;
            };

            let head = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
            let content_length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buffer.len() < header_end + content_length {
                let read = socket.read(&mut chunk).await.unwrap_or(0);
                if read == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..read]);
            }
            requests.push(String::from_utf8_lossy(&buffer).to_ascii_lowercase());

            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }

        requests
    }

    fn schedule(kind: ScheduledJobKind) -> JobSchedule {
        JobSchedule::new(
            kind,
            1_000,
            LeaseDuration::from_millis(30_000).unwrap_or_else(|_| unreachable!()),
            ReleasePolicy::ReleaseOnCompletion,
        )
        .unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn endpoint_is_derived_from_job_kind() {
        let job = HttpScheduledJob::new(
            reqwest::Client::new(),
            "http://api.internal:3001/",
            "secret",
            ScheduledJobKind::UsageAggregation,
            ReplicaId::new("replica-a").unwrap_or_else(|_| unreachable!()),
            0,
        );

        assert_eq!(
            job.endpoint(),
            "http://api.internal:3001/api/internal/jobs/usage_aggregation/run"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_the_tick() {
        let replica_id = ReplicaId::new("replica-a").unwrap_or_else(|_| unreachable!());
        let job = HttpScheduledJob::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            "secret",
            ScheduledJobKind::WebhookDispatch,
            replica_id.clone(),
            3,
        );
        let runner = JobRunner::new(LockCoordinator::new(
            Arc::new(InMemoryLockStore::new()),
            replica_id,
        ));

        let outcome = runner
            .run_tick(&job, &schedule(ScheduledJobKind::WebhookDispatch))
            .await;

        assert!(matches!(outcome, TickOutcome::Failed { ref error } if error.contains("unavailable")));
    }

    #[tokio::test]
    async fn batches_carry_lease_headers_and_continue_while_work_remains() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|_| unreachable!());
        let address = listener.local_addr().unwrap_or_else(|_| unreachable!());
        let server = tokio::spawn(serve_batches(
            listener,
            vec![
                r#"{"processed":3,"has_more":true}"#,
                r#"{"processed":1,"has_more":false}"#,
            ],
        ));

        let replica_id = ReplicaId::new("replica-a").unwrap_or_else(|_| unreachable!());
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| unreachable!());
        let job = HttpScheduledJob::new(
            http_client,
            format!("http://{address}").as_str(),
            "secret",
            ScheduledJobKind::WebhookDispatch,
            replica_id.clone(),
            5,
        );
        let runner = JobRunner::new(LockCoordinator::new(
            Arc::new(InMemoryLockStore::new()),
            replica_id,
        ));

        let outcome = runner
            .run_tick(&job, &schedule(ScheduledJobKind::WebhookDispatch))
            .await;
        let requests = server.await.unwrap_or_else(|_| unreachable!());

        assert_eq!(outcome, TickOutcome::Completed { fencing_token: 1 });
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("post /api/internal/jobs/webhook_dispatch/run "));
        for request in &requests {
            assert!(request.contains("authorization: bearer secret"));
            assert!(request.contains("x-murmur-replica-id: replica-a"));
            assert!(request.contains("x-murmur-fencing-token: 1"));
            assert!(request.contains("x-murmur-lease-expiry: "));
            assert!(request.contains("idempotency-key: "));
        }
        assert!(requests[1].contains(r#""batch":2"#));
    }
}
