// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An in-memory tree of test directories, files and tests.
//!
//! nodetest doesn't discover tests itself: callers populate a [`TestTree`] with the files (and
//! optionally the tests) they know about, and runs fill in tests that are reported on the fly.

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use nodetest_protocol::TestIdentity;
use std::collections::HashMap;
use url::Url;

/// Identifies a node in a [`TestTree`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TestNodeId(usize);

/// A test file registered with a [`TestTree`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestFile {
    /// The file's URL. Its string form is the file id used on the wire.
    pub uri: Url,

    /// The path of the source file.
    pub path: Utf8PathBuf,

    /// The path of the file that actually runs, if the source is compiled to another file.
    pub compiled_in: Option<Utf8PathBuf>,

    /// Whether tests reported by a run but not already in the tree are added to it.
    pub discover_children: bool,
}

impl TestFile {
    /// Creates a file entry for a path that runs as is and accepts discovered tests.
    ///
    /// Returns `None` if the path isn't absolute.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Option<Self> {
        let path = path.into();
        let uri = crate::helpers::file_url(&path)?;
        Some(Self {
            uri,
            path,
            compiled_in: None,
            discover_children: true,
        })
    }

    /// Returns the file id used on the wire.
    pub fn id(&self) -> &str {
        self.uri.as_str()
    }

    /// Returns the path that's passed to the runtime.
    pub fn run_path(&self) -> &Utf8Path {
        self.compiled_in.as_deref().unwrap_or(&self.path)
    }
}

/// What a [`TestTree`] node represents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TestNodeKind {
    /// A directory grouping files and other directories.
    Directory,

    /// A test file.
    File(TestFile),

    /// A test or suite inside a file.
    Test,
}

#[derive(Clone, Debug)]
struct TestNode {
    label: String,
    kind: TestNodeKind,
    parent: Option<TestNodeId>,
    children: IndexMap<String, TestNodeId>,
}

/// A tree of test directories, files and tests.
#[derive(Clone, Debug, Default)]
pub struct TestTree {
    nodes: Vec<TestNode>,
    roots: IndexMap<String, TestNodeId>,
    files: HashMap<String, TestNodeId>,
}

impl TestTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory under `parent`, or at the root. Returns the existing node if one with
    /// the same label is already there.
    pub fn add_directory(
        &mut self,
        parent: Option<TestNodeId>,
        label: impl Into<String>,
    ) -> TestNodeId {
        self.add_node(parent, label.into(), TestNodeKind::Directory)
    }

    /// Adds a test file under `parent`, or at the root. The node is labelled with the file name.
    pub fn add_file(&mut self, parent: Option<TestNodeId>, file: TestFile) -> TestNodeId {
        if let Some(&existing) = self.files.get(file.id()) {
            return existing;
        }
        let label = file
            .path
            .file_name()
            .unwrap_or(file.path.as_str())
            .to_owned();
        let key = file.id().to_owned();
        let id = self.add_node(parent, label, TestNodeKind::File(file));
        self.files.insert(key, id);
        id
    }

    /// Adds a test under a file or another test. Returns the existing node if one with the same
    /// name is already there.
    pub fn add_test(&mut self, parent: TestNodeId, name: impl Into<String>) -> TestNodeId {
        self.add_node(Some(parent), name.into(), TestNodeKind::Test)
    }

    /// Looks up the node addressed by a wire identity: the file id followed by nested test names.
    ///
    /// Tests that aren't in the tree yet are added if their file accepts discovered tests.
    pub fn resolve(&mut self, identity: &[String]) -> Option<TestNodeId> {
        let (file_id, path) = identity.split_first()?;
        let file = *self.files.get(file_id)?;
        let discover = matches!(
            &self.node(file).kind,
            TestNodeKind::File(file) if file.discover_children
        );

        let mut current = file;
        for name in path {
            current = match self.node(current).children.get(name) {
                Some(&child) => child,
                None if discover => self.add_test(current, name.clone()),
                None => return None,
            };
        }
        Some(current)
    }

    /// Returns the file node with the given id.
    pub fn file_node(&self, file_id: &str) -> Option<TestNodeId> {
        self.files.get(file_id).copied()
    }

    /// Returns the top-level nodes, in insertion order.
    pub fn roots(&self) -> impl ExactSizeIterator<Item = TestNodeId> + '_ {
        self.roots.values().copied()
    }

    /// Returns the children of a node, in insertion order.
    pub fn children(&self, id: TestNodeId) -> impl ExactSizeIterator<Item = TestNodeId> + '_ {
        self.node(id).children.values().copied()
    }

    /// Returns a node and all of its descendants, depth first.
    pub fn descendants(&self, id: TestNodeId) -> Vec<TestNodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.node(next).children.values().rev().copied());
        }
        out
    }

    /// Returns the parent of a node.
    pub fn parent(&self, id: TestNodeId) -> Option<TestNodeId> {
        self.node(id).parent
    }

    /// Returns the label of a node.
    pub fn label(&self, id: TestNodeId) -> &str {
        &self.node(id).label
    }

    /// Returns what a node represents.
    pub fn kind(&self, id: TestNodeId) -> &TestNodeKind {
        &self.node(id).kind
    }

    /// Returns the file a node belongs to: the node itself for files, the enclosing file for
    /// tests, and `None` for directories.
    pub fn file_of(&self, id: TestNodeId) -> Option<(TestNodeId, &TestFile)> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            match &node.kind {
                TestNodeKind::File(file) => return Some((node_id, file)),
                TestNodeKind::Test => current = node.parent,
                TestNodeKind::Directory => return None,
            }
        }
        None
    }

    /// Returns the full name of a test: the labels of the test and its enclosing tests, joined
    /// with spaces. This is the name the runtime matches against name patterns.
    ///
    /// Returns an empty string for files and directories.
    pub fn full_name(&self, id: TestNodeId) -> String {
        self.test_labels(id).join(" ")
    }

    /// Returns the wire identity of a file or test node.
    pub fn identity(&self, id: TestNodeId) -> Option<TestIdentity> {
        let (_, file) = self.file_of(id)?;
        let mut identity = TestIdentity::for_file(file.id());
        for (depth, label) in self.test_labels(id).into_iter().enumerate() {
            identity.set_at_depth(depth + 1, label);
        }
        Some(identity)
    }

    /// Returns a human-readable name for a node: the file label followed by the test labels.
    pub fn display_name(&self, id: TestNodeId) -> String {
        match self.file_of(id) {
            Some((file, _)) if file != id => {
                format!("{} > {}", self.label(file), self.test_labels(id).join(" > "))
            }
            _ => self.label(id).to_owned(),
        }
    }

    fn test_labels(&self, id: TestNodeId) -> Vec<&str> {
        let mut labels = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if node.kind != TestNodeKind::Test {
                break;
            }
            labels.push(node.label.as_str());
            current = node.parent;
        }
        labels.reverse();
        labels
    }

    fn add_node(&mut self, parent: Option<TestNodeId>, label: String, kind: TestNodeKind) -> TestNodeId {
        let siblings = match parent {
            Some(parent) => &self.nodes[parent.0].children,
            None => &self.roots,
        };
        if let Some(&existing) = siblings.get(&label) {
            return existing;
        }

        let id = TestNodeId(self.nodes.len());
        self.nodes.push(TestNode {
            label: label.clone(),
            kind,
            parent,
            children: IndexMap::new(),
        });
        match parent {
            Some(parent) => self.nodes[parent.0].children.insert(label, id),
            None => self.roots.insert(label, id),
        };
        id
    }

    fn node(&self, id: TestNodeId) -> &TestNode {
        // Ids are only handed out by this tree, and nodes are never removed.
        &self.nodes[id.0]
    }
}
