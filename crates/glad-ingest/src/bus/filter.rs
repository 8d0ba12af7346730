// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message type accept-list.

use std::collections::HashSet;

/// Accept-list of message type names.
///
/// Patterns support `*` (everything), `prefix*`, `*suffix`, `*contains*` and
/// `head*tail`; anything else must match exactly.
#[derive(Debug, Clone)]
pub struct TypeFilter {
    patterns: HashSet<String>,
}

impl TypeFilter {
    pub fn accept<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: types.into_iter().map(Into::into).collect(),
        }
    }

    /// Accept every type.
    pub fn all() -> Self {
        Self::accept(["*"])
    }

    pub fn matches(&self, type_name: &str) -> bool {
        self.patterns
            .iter()
            .any(|p| pattern_match(p, type_name))
    }

    pub fn patterns(&self) -> &HashSet<String> {
        &self.patterns
    }
}

fn pattern_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == name;
    }

    if pattern.len() > 1 && pattern.starts_with('*') && pattern.ends_with('*') {
        name.contains(&pattern[1..pattern.len() - 1])
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        match pattern.split_once('*') {
            Some((head, tail)) if !tail.contains('*') => {
                name.len() >= head.len() + tail.len()
                    && name.starts_with(head)
                    && name.ends_with(tail)
            }
            _ => pattern == name,
        }
    }
}
