//! Core types for the test explorer.
//!
//! `RawTestRecord` is what the framework's JSON formatter reports; the
//! `TestNode` tree is what the host renders and what the engine walks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Id of the single root group.
pub const ROOT_ID: &str = "root";

/// Display label of the root group.
pub const ROOT_LABEL: &str = "RSpec";

/// One example as reported by the framework formatter.
///
/// `id` has the shape `<file-or-group-path>[<n>(:<n>)*]`, most significant
/// position first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTestRecord {
    pub id: String,
    #[serde(default)]
    pub full_description: String,
    #[serde(default)]
    pub description: String,
    pub file_path: String,
    pub line_number: u32,
}

/// A runnable test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLeaf {
    pub id: String,
    pub label: String,
    /// Absolute path of the source file.
    pub file: PathBuf,
    /// Zero-based line number.
    pub line: u32,
    /// Positional key from the id (see [`crate::label::location_key`]).
    ///
    /// Informational only: leaves stay in reported order and nothing sorts
    /// by this, since keys from ids of different depths can collide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<u64>,
}

/// A suite: the root, a spec subdirectory, or a single spec file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestGroup {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub children: Vec<TestNode>,
}

impl TestGroup {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            file: None,
            children: Vec::new(),
        }
    }

    /// An empty root group.
    pub fn root() -> Self {
        Self::new(ROOT_ID, ROOT_LABEL)
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// Whether this group stands for a single spec file.
    pub fn is_file_group(&self, suffix: &str) -> bool {
        self.label.ends_with(suffix)
    }
}

/// Tree node, serialized with the host's `suite`/`test` tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TestNode {
    #[serde(rename = "suite")]
    Group(TestGroup),
    #[serde(rename = "test")]
    Leaf(TestLeaf),
}

impl TestNode {
    pub fn id(&self) -> &str {
        match self {
            Self::Group(group) => &group.id,
            Self::Leaf(leaf) => &leaf.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Group(group) => &group.label,
            Self::Leaf(leaf) => &leaf.label,
        }
    }

    pub fn children(&self) -> &[TestNode] {
        match self {
            Self::Group(group) => &group.children,
            Self::Leaf(_) => &[],
        }
    }

    /// Pre-order traversal, children in stored order.
    pub fn depth_first(&self) -> DepthFirst<'_> {
        DepthFirst { stack: vec![self] }
    }

    /// First node with the given id, searching depth first.
    pub fn find(&self, id: &str) -> Option<&TestNode> {
        self.depth_first().find(|node| node.id() == id)
    }

    /// All leaves in traversal order.
    pub fn leaves(&self) -> impl Iterator<Item = &TestLeaf> {
        self.depth_first().filter_map(|node| match node {
            Self::Leaf(leaf) => Some(leaf),
            Self::Group(_) => None,
        })
    }
}

impl From<TestGroup> for TestNode {
    fn from(group: TestGroup) -> Self {
        Self::Group(group)
    }
}

impl From<TestLeaf> for TestNode {
    fn from(leaf: TestLeaf) -> Self {
        Self::Leaf(leaf)
    }
}

/// Iterator returned by [`TestNode::depth_first`].
#[derive(Debug)]
pub struct DepthFirst<'a> {
    stack: Vec<&'a TestNode>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = &'a TestNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children().iter().rev());
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(id: &str) -> TestNode {
        TestNode::Leaf(TestLeaf {
            id: id.to_string(),
            label: id.to_string(),
            file: PathBuf::from("/proj/spec/a_spec.rb"),
            line: 0,
            location: None,
        })
    }

    fn sample_tree() -> TestNode {
        let mut dir = TestGroup::new("models", "models");
        let mut file = TestGroup::new("./spec/models/a_spec.rb", "a_spec.rb");
        file.children = vec![leaf("a[1:1]"), leaf("a[1:2]")];
        dir.children.push(file.into());
        let mut root = TestGroup::root();
        root.children = vec![dir.into(), leaf("b[1:1]")];
        root.into()
    }

    #[test]
    fn depth_first_visits_in_pre_order() {
        let tree = sample_tree();
        let ids: Vec<&str> = tree.depth_first().map(TestNode::id).collect();
        assert_eq!(
            ids,
            vec!["root", "models", "./spec/models/a_spec.rb", "a[1:1]", "a[1:2]", "b[1:1]"]
        );
    }

    #[test]
    fn find_locates_nested_nodes() {
        let tree = sample_tree();
        assert_eq!(tree.find("a[1:2]").map(TestNode::label), Some("a[1:2]"));
        assert!(tree.find("missing").is_none());
    }

    #[test]
    fn leaves_skip_groups() {
        let tree = sample_tree();
        assert_eq!(tree.leaves().count(), 3);
    }

    #[test]
    fn node_serializes_with_host_tags() {
        let json = serde_json::to_value(sample_tree()).unwrap();
        assert_eq!(json["type"], "suite");
        assert_eq!(json["id"], "root");
        assert_eq!(json["children"][1]["type"], "test");
        assert!(json.get("file").is_none());
    }

    #[test]
    fn raw_record_tolerates_missing_descriptions() {
        let record: RawTestRecord = serde_json::from_str(
            r#"{"id":"./spec/a_spec.rb[1:1]","file_path":"./spec/a_spec.rb","line_number":3}"#,
        )
        .unwrap();
        assert_eq!(record.description, "");
        assert_eq!(record.line_number, 3);
    }
}
