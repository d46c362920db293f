//! The worker's capabilities, as invoked by the host over the control plane.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::control::{CapabilityError, CapabilityHandler};
use crate::directory::DirectoryCache;
use crate::realtime::{ChapterRef, ConnectionManager, DocumentHandle, DocumentKey};

pub const GET_PROJECT: &str = "getProject";
pub const GET_CHAPTER: &str = "getChapter";
pub const SUBMIT_CHANGE: &str = "submitChange";
pub const LIST_PROJECTS: &str = "listProjects";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectParams {
    project_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitParams {
    project_id: String,
    /// Book and chapter select a chapter text; both absent means the
    /// project document itself.
    #[serde(default)]
    book: Option<u32>,
    #[serde(default)]
    chapter: Option<u32>,
    patch: Value,
}

#[derive(Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    force: bool,
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, CapabilityError> {
    serde_json::from_value(params).map_err(|e| CapabilityError::InvalidParams(e.to_string()))
}

fn failed(err: impl std::fmt::Display) -> CapabilityError {
    CapabilityError::Failed(err.to_string())
}

fn document_json(handle: &DocumentHandle) -> Value {
    json!({
        "key": handle.key().to_string(),
        "version": handle.version(),
        "data": handle.data(),
    })
}

/// Document and directory access backed by the worker's own connection
/// manager and directory cache.
pub struct WorkerCapabilities {
    realtime: Arc<ConnectionManager>,
    directory: Arc<OnceLock<Arc<DirectoryCache>>>,
}

impl WorkerCapabilities {
    pub fn new(
        realtime: Arc<ConnectionManager>,
        directory: Arc<OnceLock<Arc<DirectoryCache>>>,
    ) -> Self {
        Self { realtime, directory }
    }
}

#[async_trait]
impl CapabilityHandler for WorkerCapabilities {
    fn capabilities(&self) -> Vec<String> {
        [GET_PROJECT, GET_CHAPTER, SUBMIT_CHANGE, LIST_PROJECTS]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn invoke(&self, capability: &str, params: Value) -> Result<Value, CapabilityError> {
        match capability {
            GET_PROJECT => {
                let p: ProjectParams = parse(params)?;
                let handle = self.realtime.get_project(&p.project_id).await.map_err(failed)?;
                Ok(document_json(&handle))
            }
            GET_CHAPTER => {
                let chapter: ChapterRef = parse(params)?;
                let handle = self.realtime.get_chapter(&chapter).await.map_err(failed)?;
                Ok(document_json(&handle))
            }
            SUBMIT_CHANGE => {
                let p: SubmitParams = parse(params)?;
                let handle = match (p.book, p.chapter) {
                    (Some(book), Some(chapter)) => {
                        let r = ChapterRef::new(p.project_id, book, chapter);
                        self.realtime.get_chapter(&r).await
                    }
                    (None, None) => {
                        let key = DocumentKey::project(p.project_id);
                        self.realtime.get_document(key).await
                    }
                    _ => {
                        return Err(CapabilityError::InvalidParams(
                            "book and chapter must be given together".into(),
                        ))
                    }
                }
                .map_err(failed)?;
                let version = self.realtime.submit_change(&handle, p.patch).await.map_err(failed)?;
                Ok(json!({ "version": version }))
            }
            LIST_PROJECTS => {
                let p: ListParams = if params.is_null() {
                    ListParams::default()
                } else {
                    parse(params)?
                };
                let directory = self
                    .directory
                    .get()
                    .ok_or_else(|| CapabilityError::Failed("directory not configured yet".into()))?;
                let snapshot = directory.get_available_projects(p.force).await;
                Ok(json!({
                    "projects": snapshot.projects,
                    "degraded": snapshot.degraded,
                }))
            }
            other => Err(CapabilityError::Unknown(other.to_string())),
        }
    }
}
