// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns a selection of tree nodes into the files a worker runs.

use crate::test_tree::{TestNodeId, TestNodeKind, TestTree};
use indexmap::IndexMap;
use nodetest_protocol::TestRunFile;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Computes the files to run for a selection.
///
/// * With no `include` list, every root of the tree is included.
/// * Excluded nodes are skipped along with everything under them.
/// * A directory includes its children. A file is run as a whole.
/// * A test adds its full name to its file's name filter, unless the whole file already runs.
/// * Excluded tests in files that are run add their full name to the file's skip filter.
///
/// Files are returned in the order they were first selected.
pub fn resolve_run_files(
    tree: &TestTree,
    include: Option<&[TestNodeId]>,
    exclude: &[TestNodeId],
) -> Vec<TestRunFile> {
    let mut resolver = Resolver {
        tree,
        exclude: exclude.iter().copied().collect(),
        files: IndexMap::new(),
    };

    match include {
        Some(include) => include.iter().for_each(|&id| resolver.add(id)),
        None => tree.roots().for_each(|id| resolver.add(id)),
    }

    for &id in exclude {
        // Excluded files and directories were already left out above.
        if tree.kind(id) != &TestNodeKind::Test {
            continue;
        }
        let Some((_, file)) = tree.file_of(id) else {
            continue;
        };
        if let Some(record) = resolver.files.get_mut(file.id()) {
            record
                .exclude
                .get_or_insert_with(BTreeSet::new)
                .insert(tree.full_name(id));
        }
    }

    resolver.files.into_values().collect()
}

struct Resolver<'a> {
    tree: &'a TestTree,
    exclude: HashSet<TestNodeId>,
    files: IndexMap<String, TestRunFile>,
}

impl Resolver<'_> {
    fn add(&mut self, id: TestNodeId) {
        if self.exclude.contains(&id) {
            return;
        }

        let tree = self.tree;
        match tree.kind(id) {
            TestNodeKind::Directory => {
                for child in tree.children(id) {
                    self.add(child);
                }
            }
            TestNodeKind::File(file) => {
                let record = self
                    .files
                    .entry(file.id().to_owned())
                    .or_insert_with(|| TestRunFile {
                        id: file.id().to_owned(),
                        path: file.run_path().to_string(),
                        include: None,
                        exclude: None,
                    });
                // Selecting the file itself wins over any tests selected in it earlier.
                record.include = None;
            }
            TestNodeKind::Test => {
                let Some((_, file)) = tree.file_of(id) else {
                    debug!("test {} has no enclosing file, skipping", tree.label(id));
                    return;
                };
                let record = self
                    .files
                    .entry(file.id().to_owned())
                    .or_insert_with(|| TestRunFile {
                        id: file.id().to_owned(),
                        path: file.run_path().to_string(),
                        include: Some(BTreeSet::new()),
                        exclude: None,
                    });
                if let Some(include) = &mut record.include {
                    include.insert(tree.full_name(id));
                }
            }
        }
    }
}
