// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Source map resolution for failure and log locations.
//!
//! Locations reported by test processes point into the JavaScript that actually ran. For
//! transpiled tests, those are mapped back to the original sources through source maps, found
//! either through a `sourceMappingURL` comment in the file or through an explicit map URL that
//! the runtime reported while loading the file.
//!
//! Maps are cached in a [`SourceMapStore`] and kept alive by [`SourceMapMaintainer`]s: an entry
//! is evicted as soon as its last maintainer is dropped.

use crate::errors::{DisplayErrorChain, SourceMapError};
use futures::future::{BoxFuture, FutureExt, Shared};
use regex::Regex;
use sourcemap::DecodedMap;
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::{debug, warn};
use url::Url;

/// A position in a file: 0-based line and column.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    /// The file.
    pub uri: Url,

    /// The 0-based line.
    pub line: u32,

    /// The 0-based column.
    pub column: u32,
}

/// Maps positions in a generated file back to their original sources.
pub struct MappingAccessor {
    file: Url,
    mapped: Option<MappedSource>,
}

struct MappedSource {
    // Sources in the map are relative to this URL.
    base: Url,
    map: DecodedMap,
}

impl MappingAccessor {
    /// Returns an accessor that maps every position to itself.
    pub fn identity(file: Url) -> Self {
        Self { file, mapped: None }
    }

    /// Returns true if this accessor has no source map behind it.
    pub fn is_identity(&self) -> bool {
        self.mapped.is_none()
    }

    /// Returns the original position of a generated position.
    ///
    /// `line` is 1-based and `column` is 0-based, as reported in stack traces. The returned
    /// location is 0-based. Positions the map doesn't cover are returned as is.
    pub fn original_position_for(&self, line: u32, column: u32) -> Location {
        let line = line.saturating_sub(1);
        if let Some(location) = self.lookup(line, column) {
            return location;
        }

        Location {
            uri: self.file.clone(),
            line,
            column,
        }
    }

    fn lookup(&self, line: u32, column: u32) -> Option<Location> {
        let mapped = self.mapped.as_ref()?;
        let token = mapped.map.lookup_token(line, column)?;
        // The closest token may sit on an earlier line, which says nothing about this one.
        if token.get_dst_line() != line {
            return None;
        }
        let uri = mapped.base.join(token.get_source()?).ok()?;
        Some(Location {
            uri,
            line: token.get_src_line(),
            column: token.get_src_col(),
        })
    }
}

impl fmt::Debug for MappingAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingAccessor")
            .field("file", &self.file.as_str())
            .field("base", &self.mapped.as_ref().map(|m| m.base.as_str()))
            .finish()
    }
}

type SharedAccessor = Shared<BoxFuture<'static, Arc<MappingAccessor>>>;

#[derive(Debug, Default)]
struct Arena {
    entries: HashMap<Url, Entry>,
}

struct Entry {
    refs: usize,
    map_url: Option<String>,
    latest: Option<Arc<MappingAccessor>>,
    in_flight: Option<SharedAccessor>,
    generation: u64,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("refs", &self.refs)
            .field("map_url", &self.map_url)
            .field("loaded", &self.latest.is_some())
            .field("loading", &self.in_flight.is_some())
            .finish()
    }
}

impl Arena {
    fn acquire(&mut self, file: &Url, map_url: Option<&str>) {
        let entry = self.entries.entry(file.clone()).or_insert_with(|| Entry {
            refs: 0,
            map_url: None,
            latest: None,
            in_flight: None,
            generation: 0,
        });
        if entry.map_url.as_deref() != map_url {
            // A new explicit map invalidates whatever was loaded before.
            entry.map_url = map_url.map(str::to_owned);
            entry.latest = None;
            entry.in_flight = None;
            entry.generation += 1;
        }
        entry.refs += 1;
    }

    fn release(&mut self, file: &Url) {
        if let Some(entry) = self.entries.get_mut(file) {
            entry.refs -= 1;
            if entry.refs == 0 {
                self.entries.remove(file);
            }
        }
    }
}

fn lock(arena: &Mutex<Arena>) -> MutexGuard<'_, Arena> {
    arena.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A reference-counted cache of source maps, keyed by file.
#[derive(Clone, Debug, Default)]
pub struct SourceMapStore {
    arena: Arc<Mutex<Arena>>,
}

impl SourceMapStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts maintaining the mapping for `file`, which must be a `file://` URL.
    pub fn maintain(&self, file: &Url) -> SourceMapMaintainer {
        self.maintain_with(file, None)
    }

    /// Returns a store for a single run, which can hold explicit map URLs for files without
    /// affecting this store.
    pub fn scoped(&self) -> ScopedSourceMapStore {
        ScopedSourceMapStore {
            parent: self.clone(),
            own: SourceMapStore::new(),
            overrides: HashMap::new(),
        }
    }

    fn maintain_with(&self, file: &Url, map_url: Option<&str>) -> SourceMapMaintainer {
        lock(&self.arena).acquire(file, map_url);
        SourceMapMaintainer {
            arena: self.arena.clone(),
            file: file.clone(),
        }
    }

    #[cfg(test)]
    fn ref_count(&self, file: &Url) -> Option<usize> {
        lock(&self.arena).entries.get(file).map(|entry| entry.refs)
    }
}

/// Keeps the mapping for one file alive in a [`SourceMapStore`].
///
/// The cached mapping is released when the last maintainer for a file is dropped.
#[derive(Debug)]
pub struct SourceMapMaintainer {
    arena: Arc<Mutex<Arena>>,
    file: Url,
}

impl SourceMapMaintainer {
    /// Returns the file this maintainer is for.
    pub fn file(&self) -> &Url {
        &self.file
    }

    /// Returns the most recently loaded mapping, if any load has completed.
    pub fn value(&self) -> Option<Arc<MappingAccessor>> {
        lock(&self.arena)
            .entries
            .get(&self.file)
            .and_then(|entry| entry.latest.clone())
    }

    /// Loads the mapping again.
    ///
    /// If `contents` is `None`, the file is read from disk and a load already in progress is
    /// shared rather than started again. The returned future never fails: problems with the map
    /// result in an identity mapping.
    pub fn refresh(&self, contents: Option<String>) -> SharedAccessor {
        let mut arena = lock(&self.arena);
        let Some(entry) = arena.entries.get_mut(&self.file) else {
            // Entries live at least as long as their maintainers.
            let accessor = Arc::new(MappingAccessor::identity(self.file.clone()));
            return futures::future::ready(accessor).boxed().shared();
        };

        if contents.is_none() {
            if let Some(in_flight) = &entry.in_flight {
                return in_flight.clone();
            }
        }

        entry.generation += 1;
        let generation = entry.generation;
        let file = self.file.clone();
        let map_url = entry.map_url.clone();
        let arena_ref = Arc::downgrade(&self.arena);

        let future = async move {
            let accessor = Arc::new(load(&file, map_url.as_deref(), contents).await);
            store_loaded(&arena_ref, &file, generation, &accessor);
            accessor
        }
        .boxed()
        .shared();
        entry.in_flight = Some(future.clone());
        future
    }

    /// Returns the loaded mapping, loading it first if necessary.
    pub async fn get(&self) -> Arc<MappingAccessor> {
        match self.value() {
            Some(accessor) => accessor,
            None => self.refresh(None).await,
        }
    }
}

impl Drop for SourceMapMaintainer {
    fn drop(&mut self) {
        lock(&self.arena).release(&self.file);
    }
}

fn store_loaded(
    arena: &Weak<Mutex<Arena>>,
    file: &Url,
    generation: u64,
    accessor: &Arc<MappingAccessor>,
) {
    let Some(arena) = arena.upgrade() else {
        return;
    };
    let mut arena = lock(&arena);
    if let Some(entry) = arena.entries.get_mut(file) {
        // Ignore loads that were superseded while they ran.
        if entry.generation == generation {
            entry.latest = Some(accessor.clone());
            entry.in_flight = None;
        }
    }
}

/// A [`SourceMapStore`] view scoped to a single run.
///
/// Files with an explicit map URL get entries in the scope's own arena; all other files are
/// delegated to the parent store.
#[derive(Debug)]
pub struct ScopedSourceMapStore {
    parent: SourceMapStore,
    own: SourceMapStore,
    overrides: HashMap<Url, String>,
}

impl ScopedSourceMapStore {
    /// Records an explicit source map URL for `file`.
    pub fn set_override(&mut self, file: Url, map_url: impl Into<String>) {
        self.overrides.insert(file, map_url.into());
    }

    /// Returns true if `file` has an explicit source map URL.
    pub fn has_override(&self, file: &Url) -> bool {
        self.overrides.contains_key(file)
    }

    /// Starts maintaining the mapping for `file`.
    pub fn maintain(&self, file: &Url) -> SourceMapMaintainer {
        match self.overrides.get(file) {
            Some(map_url) => self.own.maintain_with(file, Some(map_url)),
            None => self.parent.maintain(file),
        }
    }
}

async fn load(file: &Url, map_url: Option<&str>, contents: Option<String>) -> MappingAccessor {
    match load_mapped(file, map_url, contents).await {
        Ok(Some(mapped)) => MappingAccessor {
            file: file.clone(),
            mapped: Some(mapped),
        },
        Ok(None) => MappingAccessor::identity(file.clone()),
        Err(error) => {
            warn!(
                "using unmapped locations for {file}: {}",
                DisplayErrorChain::new(error)
            );
            MappingAccessor::identity(file.clone())
        }
    }
}

async fn load_mapped(
    file: &Url,
    map_url: Option<&str>,
    contents: Option<String>,
) -> Result<Option<MappedSource>, SourceMapError> {
    let map_url = match map_url {
        Some(map_url) => map_url.to_owned(),
        None => {
            let contents = match contents {
                Some(contents) => contents,
                None => match read_file(file).await {
                    Ok(contents) => contents,
                    Err(error) => {
                        // Not every location points at a readable file (e.g. `node:` internals).
                        debug!("not mapping {file}: {}", DisplayErrorChain::new(error));
                        return Ok(None);
                    }
                },
            };
            match find_source_mapping_url(&contents) {
                Some(map_url) => map_url.to_owned(),
                None => return Ok(None),
            }
        }
    };

    if map_url.starts_with("data:") {
        let map = sourcemap::decode_data_url(&map_url).map_err(|error| SourceMapError::Decode {
            file: file.to_string(),
            error,
        })?;
        return Ok(Some(MappedSource {
            base: file.clone(),
            map,
        }));
    }

    let resolved = file
        .join(&map_url)
        .map_err(|error| SourceMapError::InvalidUrl {
            url: map_url.clone(),
            file: file.to_string(),
            error,
        })?;
    let bytes = read_url(&resolved).await?;
    let map = sourcemap::decode_slice(&bytes).map_err(|error| SourceMapError::Decode {
        file: file.to_string(),
        error,
    })?;
    Ok(Some(MappedSource {
        base: resolved,
        map,
    }))
}

async fn read_file(file: &Url) -> Result<String, SourceMapError> {
    let bytes = read_url(file).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn read_url(url: &Url) -> Result<Vec<u8>, SourceMapError> {
    let path = url
        .to_file_path()
        .map_err(|()| SourceMapError::NotAFile(url.to_string()))?;
    tokio::fs::read(&path)
        .await
        .map_err(|error| SourceMapError::Read {
            path: path.display().to_string(),
            error,
        })
}

/// Returns the URL in the last `sourceMappingURL` comment of a file.
fn find_source_mapping_url(contents: &str) -> Option<&str> {
    static SOURCE_MAPPING_URL: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^[ \t]*//[#@][ \t]*sourceMappingURL=(\S+)[ \t]*\r?$")
            .expect("source mapping URL regex is valid")
    });

    SOURCE_MAPPING_URL
        .captures_iter(contents)
        .last()
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}
