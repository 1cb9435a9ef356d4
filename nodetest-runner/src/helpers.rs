// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8Path;
use std::sync::LazyLock;
use tracing::warn;
use url::Url;

/// Gets the number of available CPUs and caches the value.
#[inline]
pub fn get_num_cpus() -> usize {
    static NUM_CPUS: LazyLock<usize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count.into(),
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                1
            }
        });

    *NUM_CPUS
}

/// Escapes a string for use as a literal inside a JavaScript regular expression.
pub(crate) fn escape_js_regex(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\' | '/'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Converts an absolute path to a `file://` URL.
pub(crate) fn file_url(path: &Utf8Path) -> Option<Url> {
    Url::from_file_path(path.as_std_path()).ok()
}

/// Returns the extension of a path, without the leading dot.
pub(crate) fn extension_of(path: &str) -> Option<&str> {
    Utf8Path::new(path).extension()
}
