//! Hierarchical tensor names.
//!
//! A name is the configured prefix, every open scope segment and the local
//! name joined by the separator. The same string is the store key.

use mlblock_core::{MlbError, Result};

#[derive(Clone, Debug)]
pub struct Resolver {
    sep: char,
    prefix: String,
    scopes: Vec<String>,
}

impl Resolver {
    pub fn new(sep: char, prefix: impl Into<String>) -> Self {
        Self {
            sep,
            prefix: prefix.into(),
            scopes: Vec::new(),
        }
    }

    pub fn push(&mut self, segment: &str) -> Result<()> {
        if segment.is_empty() {
            return Err(MlbError::usage("empty scope name"));
        }
        self.scopes.push(segment.to_string());
        Ok(())
    }

    pub fn pop(&mut self) -> Result<String> {
        self.scopes
            .pop()
            .ok_or_else(|| MlbError::usage("block_end without a matching block_begin"))
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Full name of `local` under the open scopes.
    pub fn resolve(&self, local: &str) -> Result<String> {
        if local.is_empty() {
            return Err(MlbError::usage("empty tensor name"));
        }
        let mut out = String::with_capacity(
            self.prefix.len() + self.scopes.iter().map(|s| s.len() + 1).sum::<usize>() + local.len() + 1,
        );
        let parts = std::iter::once(self.prefix.as_str())
            .filter(|p| !p.is_empty())
            .chain(self.scopes.iter().map(String::as_str))
            .chain(std::iter::once(local));
        for (i, part) in parts.enumerate() {
            if i > 0 {
                out.push(self.sep);
            }
            out.push_str(part);
        }
        Ok(out)
    }
}
