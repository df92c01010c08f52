use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form attributes attached to nodes and edges.
pub type Attributes = Map<String, Value>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Person,
    Household,
    Pet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    Parent,
    Child,
    Spouse,
    Partner,
    Sibling,
    Guardian,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyNode {
    pub id: Uuid,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub data: Attributes,
}

impl FamilyNode {
    /// Display name taken from `data.name`, if present.
    pub fn name(&self) -> Option<&str> {
        self.data.get("name").and_then(Value::as_str)
    }

    /// Shallow merge: top-level keys in `partial` replace existing keys.
    pub fn merge_data(&mut self, partial: Attributes) {
        for (key, value) in partial {
            self.data.insert(key, value);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyEdge {
    pub id: Uuid,
    pub source: Uuid,
    pub target: Uuid,
    #[serde(rename = "type")]
    pub kind: RelationshipKind,
    #[serde(default)]
    pub metadata: Attributes,
}

impl FamilyEdge {
    pub fn touches(&self, node_id: Uuid) -> bool {
        self.source == node_id || self.target == node_id
    }
}

/// A node as supplied by a caller of `add_node`; id and type are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(rename = "type", default)]
    pub node_type: Option<NodeType>,
    #[serde(default)]
    pub data: Attributes,
}

impl NodeInput {
    pub fn person(data: Attributes) -> Self {
        Self {
            id: None,
            node_type: Some(NodeType::Person),
            data,
        }
    }

    pub fn into_node(self) -> FamilyNode {
        FamilyNode {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            node_type: self.node_type.unwrap_or_default(),
            data: self.data,
        }
    }
}

/// An edge as supplied by a caller of `add_edge`; id is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeInput {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub source: Uuid,
    pub target: Uuid,
    #[serde(rename = "type")]
    pub kind: RelationshipKind,
    #[serde(default)]
    pub metadata: Attributes,
}

impl EdgeInput {
    pub fn new(source: Uuid, target: Uuid, kind: RelationshipKind) -> Self {
        Self {
            id: None,
            source,
            target,
            kind,
            metadata: Attributes::new(),
        }
    }

    pub fn into_edge(self) -> FamilyEdge {
        FamilyEdge {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            source: self.source,
            target: self.target,
            kind: self.kind,
            metadata: self.metadata,
        }
    }
}

/// The node/edge structure for one family. Snapshots are replaced whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyGraph {
    #[serde(default)]
    pub nodes: Vec<FamilyNode>,
    #[serde(default)]
    pub edges: Vec<FamilyEdge>,
}

impl FamilyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: Uuid) -> Option<&FamilyNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: Uuid) -> Option<&FamilyEdge> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn contains_node(&self, id: Uuid) -> bool {
        self.node(id).is_some()
    }

    /// New snapshot with `node` appended.
    pub fn with_node(&self, node: FamilyNode) -> Self {
        let mut next = self.clone();
        next.nodes.push(node);
        next
    }

    /// New snapshot with `edge` appended.
    pub fn with_edge(&self, edge: FamilyEdge) -> Self {
        let mut next = self.clone();
        next.edges.push(edge);
        next
    }

    /// New snapshot with `node` substituted for the node of the same id.
    pub fn with_replaced_node(&self, node: FamilyNode) -> Self {
        let mut next = self.clone();
        if let Some(slot) = next.nodes.iter_mut().find(|n| n.id == node.id) {
            *slot = node;
        }
        next
    }

    /// New snapshot without the node and without every edge touching it.
    /// Returns the removed edges alongside.
    pub fn without_node(&self, id: Uuid) -> (Self, Vec<FamilyEdge>) {
        let nodes = self.nodes.iter().filter(|n| n.id != id).cloned().collect();
        let (removed, edges): (Vec<_>, Vec<_>) =
            self.edges.iter().cloned().partition(|e| e.touches(id));
        (Self { nodes, edges }, removed)
    }

    pub fn without_edge(&self, id: Uuid) -> Self {
        Self {
            nodes: self.nodes.clone(),
            edges: self.edges.iter().filter(|e| e.id != id).cloned().collect(),
        }
    }

    /// Edges whose source or target does not name a node in this graph.
    pub fn dangling_edges(&self) -> Vec<&FamilyEdge> {
        self.edges
            .iter()
            .filter(|e| !self.contains_node(e.source) || !self.contains_node(e.target))
            .collect()
    }
}
