#![allow(dead_code)]

use async_trait::async_trait;
use orchcore::{
    EngineConfig, MemoryStore, NodeError, NodeKind, NodeSpec, Storage, WorkflowDefinition,
};
use orchnodes::{HttpClient, HttpRequest, HttpResponse};
use orchruntime::WorkflowEngine;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Replays canned responses in order, then repeats `fallback` forever
pub struct ScriptedHttp {
    responses: Mutex<VecDeque<Result<HttpResponse, NodeError>>>,
    fallback: Result<HttpResponse, NodeError>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    pub fn always(fallback: Result<HttpResponse, NodeError>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn status(status: u16, body: &str) -> Arc<Self> {
        Self::always(Ok(response(status, body)))
    }

    pub fn then(self: &Arc<Self>, reply: Result<HttpResponse, NodeError>) -> Arc<Self> {
        self.responses.lock().unwrap().push_back(reply);
        self.clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

pub fn response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        body: body.to_string(),
        headers: HashMap::new(),
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NodeError> {
        self.calls.lock().unwrap().push(request);
        match self.responses.lock().unwrap().pop_front() {
            Some(reply) => reply,
            None => self.fallback.clone(),
        }
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        retry_delay_ms: 0,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub http: Arc<ScriptedHttp>,
    pub engine: WorkflowEngine,
}

pub fn harness() -> Harness {
    harness_with(ScriptedHttp::status(200, "ok"))
}

pub fn harness_with(http: Arc<ScriptedHttp>) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("orchruntime=debug")
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new());
    let engine = WorkflowEngine::new(store.clone(), http.clone(), test_config());
    Harness { store, http, engine }
}

impl Harness {
    pub async fn save(&self, workflow: &WorkflowDefinition) {
        self.store.save_workflow(workflow).await.unwrap();
    }
}

/// Linear workflow `start -> nodes... -> end`
pub fn linear(id: &str, nodes: Vec<NodeSpec>) -> WorkflowDefinition {
    let mut wf = WorkflowDefinition::new(id, id);
    wf.add_node(NodeSpec::new("start", NodeKind::Start));
    let mut previous = "start".to_string();
    for node in nodes {
        let id = wf.add_node(node);
        wf.connect(&previous, &id);
        previous = id;
    }
    wf.add_node(NodeSpec::new("end", NodeKind::End));
    wf.connect(&previous, "end");
    wf
}

pub fn node(id: &str, kind: NodeKind, data: Value) -> NodeSpec {
    NodeSpec::new(id, kind).with_data(data)
}
