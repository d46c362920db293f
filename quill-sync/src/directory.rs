//! Project directory: the REST source and the throttled, single-flight
//! cache in front of it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Draft build status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DraftStatus {
    NotStarted,
    Queued,
    Building,
    Completed,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub short_name: String,
    #[serde(default)]
    pub draft_status: DraftStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("no credential available: {0}")]
    Credentials(String),
    #[error("directory request failed: {0}")]
    Http(String),
    #[error("directory returned HTTP {0}")]
    Status(u16),
    #[error("malformed directory response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DirectoryError::Decode(err.to_string())
        } else {
            DirectoryError::Http(err.to_string())
        }
    }
}

/// Supplies bearer tokens on demand.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, DirectoryError>;
}

/// A fixed token, from configuration.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, DirectoryError> {
        if self.0.is_empty() {
            return Err(DirectoryError::Credentials("empty token".into()));
        }
        Ok(self.0.clone())
    }
}

/// Lists the projects available to the current user.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectDescriptor>, DirectoryError>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectEntry {
    id: String,
    name: String,
    #[serde(default)]
    short_name: String,
}

#[derive(Deserialize)]
struct DraftEntry {
    #[serde(default)]
    status: DraftStatus,
}

/// REST directory: `GET {base}/projects`, then `GET {base}/projects/{id}/draft`
/// per project.
pub struct HttpProjectDirectory {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpProjectDirectory {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    async fn draft_status(
        &self,
        token: &str,
        project_id: &str,
    ) -> Result<DraftStatus, DirectoryError> {
        let url = format!("{}/projects/{project_id}/draft", self.base_url);
        let response = self.client.get(&url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        let entry: DraftEntry = response.json().await?;
        Ok(entry.status)
    }
}

#[async_trait]
impl ProjectDirectory for HttpProjectDirectory {
    async fn list_projects(&self) -> Result<Vec<ProjectDescriptor>, DirectoryError> {
        let token = self.credentials.bearer_token().await?;
        let url = format!("{}/projects", self.base_url);
        let response = self.client.get(&url).bearer_auth(&token).send().await?;
        if !response.status().is_success() {
            return Err(DirectoryError::Status(response.status().as_u16()));
        }
        let entries: Vec<ProjectEntry> = response.json().await?;

        // One project's status failing must not fail the listing.
        let statuses = futures_util::future::join_all(
            entries.iter().map(|entry| self.draft_status(&token, &entry.id)),
        )
        .await;

        Ok(entries
            .into_iter()
            .zip(statuses)
            .map(|(entry, status)| {
                let draft_status = status.unwrap_or_else(|e| {
                    log::warn!("Draft status for project {} unavailable: {e}", entry.id);
                    DraftStatus::Unknown
                });
                ProjectDescriptor {
                    id: entry.id,
                    name: entry.name,
                    short_name: entry.short_name,
                    draft_status,
                }
            })
            .collect())
    }
}

/// A computed directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProjectSnapshot {
    pub projects: Vec<ProjectDescriptor>,
    /// `None` until the first successful computation.
    pub computed_at: Option<DateTime<Utc>>,
    /// Built from the previous snapshot after a failed refresh.
    pub degraded: bool,
}

impl ProjectSnapshot {
    pub fn ids(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.id.clone()).collect()
    }

    /// The previous listing with every status unknown.
    fn degrade(&self) -> Self {
        Self {
            projects: self
                .projects
                .iter()
                .map(|p| ProjectDescriptor {
                    draft_status: DraftStatus::Unknown,
                    ..p.clone()
                })
                .collect(),
            computed_at: self.computed_at,
            degraded: true,
        }
    }
}

struct CacheState {
    snapshot: Arc<ProjectSnapshot>,
    fresh_at: Option<Instant>,
}

/// Throttled single-flight cache over a [`ProjectDirectory`].
pub struct DirectoryCache {
    source: Arc<dyn ProjectDirectory>,
    throttle: Duration,
    state: Mutex<CacheState>,
    refresh: tokio::sync::Mutex<()>,
    remote_calls: AtomicU64,
}

impl DirectoryCache {
    pub fn new(source: Arc<dyn ProjectDirectory>, throttle: Duration) -> Self {
        Self {
            source,
            throttle,
            state: Mutex::new(CacheState {
                snapshot: Arc::new(ProjectSnapshot::default()),
                fresh_at: None,
            }),
            refresh: tokio::sync::Mutex::new(()),
            remote_calls: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current snapshot, without refreshing.
    pub fn snapshot(&self) -> Arc<ProjectSnapshot> {
        self.state().snapshot.clone()
    }

    /// Number of calls made to the underlying directory.
    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::Relaxed)
    }

    /// Available projects, recomputed at most once per throttle interval
    /// unless `force` is set. Never fails: a failed refresh yields a degraded
    /// copy of the previous snapshot.
    pub async fn get_available_projects(&self, force: bool) -> Arc<ProjectSnapshot> {
        let seen = {
            let mut state = self.state();
            if force {
                state.fresh_at = None;
            }
            if let Some(at) = state.fresh_at {
                if at.elapsed() < self.throttle {
                    return state.snapshot.clone();
                }
            }
            state.snapshot.clone()
        };

        let _refreshing = self.refresh.lock().await;

        {
            let state = self.state();
            if !Arc::ptr_eq(&state.snapshot, &seen) {
                log::debug!("Directory refreshed by another caller while waiting");
                return state.snapshot.clone();
            }
        }

        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let result = self.source.list_projects().await;

        let mut state = self.state();
        let snapshot = match result {
            Ok(projects) => {
                log::debug!("Directory refreshed: {} projects", projects.len());
                state.fresh_at = Some(Instant::now());
                Arc::new(ProjectSnapshot {
                    projects,
                    computed_at: Some(Utc::now()),
                    degraded: false,
                })
            }
            Err(e) => {
                log::warn!("Project directory refresh failed, serving last known listing: {e}");
                Arc::new(state.snapshot.degrade())
            }
        };
        state.snapshot = snapshot.clone();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const PROJECT_LIST: &str =
        r#"[{"id":"p1","name":"One","shortName":"ONE"},{"id":"p2","name":"Two"}]"#;

    struct FakeDirectory {
        calls: AtomicU64,
        fail: AtomicBool,
        delay: Duration,
    }

    impl FakeDirectory {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                delay,
            })
        }
    }

    #[async_trait]
    impl ProjectDirectory for FakeDirectory {
        async fn list_projects(&self) -> Result<Vec<ProjectDescriptor>, DirectoryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(DirectoryError::Status(503));
            }
            Ok(vec![ProjectDescriptor {
                id: format!("p{n}"),
                name: format!("Project {n}"),
                short_name: String::new(),
                draft_status: DraftStatus::Completed,
            }])
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let source = FakeDirectory::new(Duration::from_millis(50));
        let cache = Arc::new(DirectoryCache::new(source.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_available_projects(false).await })
            })
            .collect();
        let mut snapshots = Vec::new();
        for h in handles {
            snapshots.push(h.await.unwrap());
        }

        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(snapshots.iter().all(|s| Arc::ptr_eq(s, &snapshots[0])));
        assert_eq!(snapshots[0].ids(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_throttle_and_force() {
        let source = FakeDirectory::new(Duration::ZERO);
        let cache = DirectoryCache::new(source.clone(), Duration::from_secs(60));

        let first = cache.get_available_projects(false).await;
        let second = cache.get_available_projects(false).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.remote_calls(), 1);

        let forced = cache.get_available_projects(true).await;
        assert!(!Arc::ptr_eq(&first, &forced));
        assert_eq!(forced.ids(), vec!["p2"]);
        assert_eq!(cache.remote_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_after_throttle_window() {
        let source = FakeDirectory::new(Duration::ZERO);
        let cache = DirectoryCache::new(source.clone(), Duration::from_secs(60));

        cache.get_available_projects(false).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let refreshed = cache.get_available_projects(false).await;
        assert_eq!(refreshed.ids(), vec!["p2"]);
    }

    #[tokio::test]
    async fn test_failure_degrades_previous_snapshot() {
        let source = FakeDirectory::new(Duration::ZERO);
        let cache = DirectoryCache::new(source.clone(), Duration::from_secs(60));
        let good = cache.get_available_projects(false).await;

        source.fail.store(true, Ordering::SeqCst);
        let degraded = cache.get_available_projects(true).await;
        assert!(degraded.degraded);
        assert_eq!(degraded.ids(), good.ids());
        assert_eq!(degraded.projects[0].draft_status, DraftStatus::Unknown);

        // A failure does not count as fresh; the next call retries.
        source.fail.store(false, Ordering::SeqCst);
        let recovered = cache.get_available_projects(false).await;
        assert!(!recovered.degraded);
        assert_eq!(cache.remote_calls(), 3);
    }

    #[test]
    fn test_unknown_draft_status_string() {
        let entry: DraftEntry = serde_json::from_str(r#"{"status":"somethingNew"}"#).unwrap();
        assert_eq!(entry.status, DraftStatus::Unknown);
        let entry: DraftEntry = serde_json::from_str(r#"{"status":"completed"}"#).unwrap();
        assert_eq!(entry.status, DraftStatus::Completed);
    }

    /// Minimal HTTP/1.1 responder: one request per connection.
    async fn serve_http(listener: tokio::net::TcpListener) {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let authorized = request.contains("authorization: Bearer secret")
                    || request.contains("Authorization: Bearer secret");
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = match path.as_str() {
                    _ if !authorized => ("401 Unauthorized", String::new()),
                    "/api/projects" => ("200 OK", PROJECT_LIST.to_string()),
                    "/api/projects/p1/draft" => ("200 OK", r#"{"status":"building"}"#.to_string()),
                    _ => ("500 Internal Server Error", String::new()),
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\n\
                     content-type: application/json\r\n\
                     content-length: {}\r\n\
                     connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    }

    #[tokio::test]
    async fn test_http_directory_degrades_per_project_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_http(listener));

        let directory = HttpProjectDirectory::new(
            format!("http://{addr}/api/"),
            Arc::new(StaticToken::new("secret")),
            Duration::from_secs(5),
        )
        .unwrap();
        let projects = directory.list_projects().await.unwrap();

        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].short_name, "ONE");
        assert_eq!(projects[0].draft_status, DraftStatus::Building);
        assert_eq!(projects[1].draft_status, DraftStatus::Unknown);

        let unauthorized = HttpProjectDirectory::new(
            format!("http://{addr}/api"),
            Arc::new(StaticToken::new("wrong")),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(unauthorized.list_projects().await, Err(DirectoryError::Status(401)));
    }
}
