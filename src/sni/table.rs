//! Host pattern → TLS context bindings

use std::fmt;

use tracing::{debug, warn};

use crate::config::SniSection;
use crate::error::{ConduitError, Result};

/// Exact and `*`-wildcard host patterns plus a default context.
///
/// Patterns and requested names compare case-insensitively. Lookup tries
/// every exact pattern (in insertion order) before any wildcard pattern,
/// then falls back to the default.
pub struct SniTable<C> {
    exact: Vec<(String, C)>,
    wildcard: Vec<(String, C)>,
    default: Option<C>,
}

impl<C> SniTable<C> {
    pub fn new() -> Self {
        Self { exact: Vec::new(), wildcard: Vec::new(), default: None }
    }

    pub fn builder() -> SniTableBuilder<C> {
        SniTableBuilder { table: Self::new() }
    }

    /// Bind `pattern` to `context`; rebinding an existing pattern replaces it
    /// in place and returns the previous context.
    pub fn add_match(&mut self, pattern: &str, context: C) -> Option<C> {
        let pattern = pattern.to_ascii_lowercase();
        let entries = if pattern.contains('*') { &mut self.wildcard } else { &mut self.exact };
        if let Some(slot) = entries.iter_mut().find(|(p, _)| *p == pattern) {
            return Some(std::mem::replace(&mut slot.1, context));
        }
        entries.push((pattern, context));
        None
    }

    pub fn remove_match(&mut self, pattern: &str) -> Option<C> {
        let pattern = pattern.to_ascii_lowercase();
        let entries = if pattern.contains('*') { &mut self.wildcard } else { &mut self.exact };
        let index = entries.iter().position(|(p, _)| *p == pattern)?;
        Some(entries.remove(index).1)
    }

    pub fn set_default(&mut self, context: C) -> Option<C> {
        self.default.replace(context)
    }

    pub fn default_context(&self) -> Option<&C> {
        self.default.as_ref()
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// Patterns in lookup order
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.exact.iter().chain(self.wildcard.iter()).map(|(p, _)| p.as_str())
    }

    /// Best binding for the requested names, without the default
    pub fn find<S: AsRef<str>>(&self, names: &[S]) -> Option<(&str, &C)> {
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_ascii_lowercase()).collect();

        let exact = self.exact.iter().find(|(pattern, _)| names.iter().any(|n| n == pattern));
        let matched = exact.or_else(|| {
            self.wildcard
                .iter()
                .find(|(pattern, _)| names.iter().any(|n| glob_match(pattern.as_bytes(), n.as_bytes())))
        });
        matched.map(|(pattern, context)| (pattern.as_str(), context))
    }

    /// Context for the requested names, falling back to the default
    pub fn lookup<S: AsRef<str>>(&self, names: &[S]) -> Option<&C> {
        self.find(names).map(|(_, context)| context).or(self.default.as_ref())
    }

    /// Like [`lookup`](Self::lookup), failing when nothing matches and no
    /// default is configured.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<&C> {
        if let Some((pattern, context)) = self.find(names) {
            debug!(pattern, "SNI pattern matched");
            return Ok(context);
        }
        self.default.as_ref().ok_or_else(|| ConduitError::NoContext {
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
        })
    }
}

impl SniTable<String> {
    /// Table of context names from the `[sni]` config section
    pub fn from_config(section: &SniSection) -> Self {
        let mut table = Self::new();
        for binding in &section.bindings {
            if let Some(previous) = table.add_match(&binding.pattern, binding.context.clone()) {
                warn!(
                    pattern = %binding.pattern,
                    previous = %previous,
                    context = %binding.context,
                    "Duplicate SNI pattern, last binding wins"
                );
            }
        }
        if !section.default.is_empty() {
            table.set_default(section.default.clone());
        }
        table
    }
}

impl<C> Default for SniTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for SniTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniTable")
            .field("patterns", &self.patterns().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

// ============= Builder =============

pub struct SniTableBuilder<C> {
    table: SniTable<C>,
}

impl<C> SniTableBuilder<C> {
    pub fn add_match(mut self, pattern: &str, context: C) -> Self {
        self.table.add_match(pattern, context);
        self
    }

    pub fn default_context(mut self, context: C) -> Self {
        self.table.set_default(context);
        self
    }

    pub fn build(self) -> SniTable<C> {
        self.table
    }
}

/// `*` matches one or more characters; everything else literally.
/// Both sides are expected lowercase already.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Latest star: pattern index after it, text index its run ends at
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p + 1, t + 1));
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((after, end)) = star {
            // let the star swallow one more byte
            star = Some((after, end + 1));
            p = after;
            t = end + 1;
        } else {
            return false;
        }
    }
    p == pattern.len()
}
