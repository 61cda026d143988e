//! In-memory [`Transport`] for exercising the client without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{FetchError, FetchedResponse, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl RecordedRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
struct ScriptedResponse {
    status: u16,
    body: Vec<u8>,
}

/// Answers each path from a FIFO of scripted responses. A path with nothing
/// left to answer responds 404, like an unknown entity would.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_raw(&self, path: &str, status: u16, body: Vec<u8>) {
        self.responses
            .lock()
            .expect("scripted responses lock")
            .entry(path.to_string())
            .or_default()
            .push_back(ScriptedResponse { status, body });
    }

    pub fn respond_json(&self, path: &str, body: serde_json::Value) {
        let bytes = serde_json::to_vec(&body).expect("serializing scripted body");
        self.respond_raw(path, 200, bytes);
    }

    pub fn respond_status(&self, path: &str, status: u16) {
        self.respond_raw(path, status, Vec::new());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("recorded requests lock").clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<FetchedResponse, FetchError> {
        self.requests
            .lock()
            .expect("recorded requests lock")
            .push(RecordedRequest {
                path: path.to_string(),
                query: query
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.clone()))
                    .collect(),
            });

        let scripted = self
            .responses
            .lock()
            .expect("scripted responses lock")
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedResponse {
                status: 404,
                body: Vec::new(),
            });

        let url = format!("scripted://{path}");
        let status = StatusCode::from_u16(scripted.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(FetchedResponse {
            final_url: url,
            body: scripted.body,
        })
    }
}
