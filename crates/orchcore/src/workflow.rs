use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub type WorkflowId = String;
pub type NodeId = String;

/// Lifecycle state of a workflow definition or one of its version snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Draft,
    Published,
    Deprecated,
    Archived,
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Deprecated => "deprecated",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: LifecycleStatus,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Explicit opt-in for being invoked from a subprocess node
    #[serde(default)]
    pub subprocess_compatible: bool,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            status: LifecycleStatus::Draft,
            version: 1,
            subprocess_compatible: false,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: LifecycleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Plain edge with neither handle nor label
    pub fn connect(&mut self, source: &str, target: &str) -> &mut Edge {
        let id = format!("e{}-{}-{}", self.edges.len(), source, target);
        self.edges.push(Edge {
            id,
            source: source.to_string(),
            target: target.to_string(),
            handle: None,
            label: None,
        });
        let last = self.edges.len() - 1;
        &mut self.edges[last]
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Start)
    }

    pub fn has_end_node(&self) -> bool {
        self.nodes.iter().any(|n| n.kind == NodeKind::End)
    }

    /// Edges leaving `node_id`, in definition order
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Nodes that cannot be reached from the start node by following edges.
    /// Empty when there is no start node.
    pub fn unreachable_nodes(&self) -> Vec<NodeId> {
        let Some(start) = self.start_node() else {
            return Vec::new();
        };

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &self.nodes {
            index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
        for edge in &self.edges {
            if let (Some(from), Some(to)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
                graph.add_edge(*from, *to, ());
            }
        }

        let mut reached = std::collections::HashSet::new();
        let mut dfs = Dfs::new(&graph, index[start.id.as_str()]);
        while let Some(idx) = dfs.next(&graph) {
            reached.insert(graph[idx]);
        }

        self.nodes
            .iter()
            .filter(|n| !reached.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Edges whose source or target names a node missing from the definition
    pub fn dangling_edges(&self) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| self.find_node(&e.source).is_none() || self.find_node(&e.target).is_none())
            .collect()
    }
}

/// Stored snapshot of a workflow definition at a given version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub workflow_id: WorkflowId,
    pub version: String,
    pub status: LifecycleStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub definition: WorkflowDefinition,
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    /// Type-specific payload, decoded by the node library
    #[serde(default)]
    pub data: serde_json::Value,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            data: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    pub target: NodeId,
    /// Explicit routing handle (e.g. "yes"/"no" on decision outputs)
    #[serde(default, alias = "sourceHandle")]
    pub handle: Option<String>,
    /// Human-readable label, used as a routing fallback when no handle is set
    #[serde(default)]
    pub label: Option<String>,
}

impl Edge {
    pub fn with_handle(&mut self, handle: impl Into<String>) -> &mut Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }
}

/// Closed set of node types understood by the executor. Unrecognised names
/// deserialize into `Unknown` so they can fail at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Start,
    End,
    Task,
    Decision,
    Switch,
    Approval,
    Form,
    Screen,
    Action,
    Parallel,
    Merge,
    Timer,
    Subprocess,
    Event,
    Assignment,
    LoopForEach,
    LoopWhile,
    LoopDoWhile,
    LoopRepeat,
    LoopBreak,
    LoopContinue,
    LookupRecord,
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
    Transform,
    Filter,
    Sort,
    Aggregate,
    Calculate,
    Unknown(String),
}

impl NodeKind {
    pub const KNOWN: &'static [NodeKind] = &[
        NodeKind::Start,
        NodeKind::End,
        NodeKind::Task,
        NodeKind::Decision,
        NodeKind::Switch,
        NodeKind::Approval,
        NodeKind::Form,
        NodeKind::Screen,
        NodeKind::Action,
        NodeKind::Parallel,
        NodeKind::Merge,
        NodeKind::Timer,
        NodeKind::Subprocess,
        NodeKind::Event,
        NodeKind::Assignment,
        NodeKind::LoopForEach,
        NodeKind::LoopWhile,
        NodeKind::LoopDoWhile,
        NodeKind::LoopRepeat,
        NodeKind::LoopBreak,
        NodeKind::LoopContinue,
        NodeKind::LookupRecord,
        NodeKind::CreateRecord,
        NodeKind::UpdateRecord,
        NodeKind::DeleteRecord,
        NodeKind::Transform,
        NodeKind::Filter,
        NodeKind::Sort,
        NodeKind::Aggregate,
        NodeKind::Calculate,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task => "task",
            Self::Decision => "decision",
            Self::Switch => "switch",
            Self::Approval => "approval",
            Self::Form => "form",
            Self::Screen => "screen",
            Self::Action => "action",
            Self::Parallel => "parallel",
            Self::Merge => "merge",
            Self::Timer => "timer",
            Self::Subprocess => "subprocess",
            Self::Event => "event",
            Self::Assignment => "assignment",
            Self::LoopForEach => "loop_for_each",
            Self::LoopWhile => "loop_while",
            Self::LoopDoWhile => "loop_do_while",
            Self::LoopRepeat => "loop_repeat",
            Self::LoopBreak => "loop_break",
            Self::LoopContinue => "loop_continue",
            Self::LookupRecord => "lookup_record",
            Self::CreateRecord => "create_record",
            Self::UpdateRecord => "update_record",
            Self::DeleteRecord => "delete_record",
            Self::Transform => "transform",
            Self::Filter => "filter",
            Self::Sort => "sort",
            Self::Aggregate => "aggregate",
            Self::Calculate => "calculate",
            Self::Unknown(name) => name,
        }
    }

    /// Kinds whose transient failures are retried by the engine
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Action | Self::LookupRecord | Self::CreateRecord | Self::UpdateRecord
        )
    }
}

impl FromStr for NodeKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::KNOWN
            .iter()
            .find(|k| k.as_str() == s)
            .cloned()
            .unwrap_or_else(|| Self::Unknown(s.to_string())))
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_round_trips_through_strings() {
        let kind: NodeKind = serde_json::from_str("\"loop_for_each\"").unwrap();
        assert_eq!(kind, NodeKind::LoopForEach);
        let unknown: NodeKind = serde_json::from_str("\"teleport\"").unwrap();
        assert_eq!(unknown, NodeKind::Unknown("teleport".into()));
        assert_eq!(serde_json::to_string(&unknown).unwrap(), "\"teleport\"");
    }

    #[test]
    fn unreachable_nodes_are_reported() {
        let mut wf = WorkflowDefinition::new("wf", "Reachability");
        wf.add_node(NodeSpec::new("start", NodeKind::Start));
        wf.add_node(NodeSpec::new("end", NodeKind::End));
        wf.add_node(NodeSpec::new("orphan", NodeKind::Task));
        wf.connect("start", "end");

        assert_eq!(wf.unreachable_nodes(), vec!["orphan".to_string()]);
    }

    #[test]
    fn edge_accepts_source_handle_alias() {
        let edge: Edge = serde_json::from_value(serde_json::json!({
            "id": "e1", "source": "d", "target": "t", "sourceHandle": "yes"
        }))
        .unwrap();
        assert_eq!(edge.handle.as_deref(), Some("yes"));
    }
}
