//! Append-only log of what a computation registered.

use std::collections::HashSet;

use tracing::debug;

use mlblock_core::{MlbError, NodeId, Result, StringId, Tensor};

/// Whether a registered tensor is loaded from the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// A leaf; its key must resolve at load time.
    Param,
    /// A named op result, registered for display only.
    Op,
}

#[derive(Clone, Debug)]
pub struct TensorEntry {
    pub tensor: Tensor,
    pub name: StringId,
    pub key: StringId,
    pub kind: EntryKind,
}

#[derive(Clone, Debug)]
pub enum RegistryItem {
    Tensor(TensorEntry),
    ScopeBegin(StringId),
    ScopeEnd,
    Split(Tensor),
}

#[derive(Debug, Default)]
pub struct Registry {
    items: Vec<RegistryItem>,
    names: HashSet<StringId>,
    n_entries: usize,
    sealed: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn writable(&self) -> Result<()> {
        if self.sealed {
            return Err(MlbError::usage("the registry is sealed after build_alloc"));
        }
        Ok(())
    }

    pub fn scope_begin(&mut self, segment: StringId) -> Result<()> {
        self.writable()?;
        self.items.push(RegistryItem::ScopeBegin(segment));
        Ok(())
    }

    pub fn scope_end(&mut self) -> Result<()> {
        self.writable()?;
        self.items.push(RegistryItem::ScopeEnd);
        Ok(())
    }

    pub fn add(&mut self, entry: TensorEntry) -> Result<()> {
        self.writable()?;
        if !self.names.insert(entry.name) {
            return Err(MlbError::usage("duplicate tensor name in computation"));
        }
        debug!(
            node = %entry.tensor.node_id(),
            kind = ?entry.kind,
            "registered {}",
            entry.tensor
        );
        self.n_entries += 1;
        self.items.push(RegistryItem::Tensor(entry));
        Ok(())
    }

    pub fn split(&mut self, tensor: Tensor) -> Result<()> {
        self.writable()?;
        debug!(node = %tensor.node_id(), "graph split");
        self.items.push(RegistryItem::Split(tensor));
        Ok(())
    }

    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn contains_name(&self, name: StringId) -> bool {
        self.names.contains(&name)
    }

    pub fn items(&self) -> &[RegistryItem] {
        &self.items
    }

    /// Registered tensors in registration order.
    pub fn entries(&self) -> impl Iterator<Item = &TensorEntry> {
        self.items.iter().filter_map(|item| match item {
            RegistryItem::Tensor(e) => Some(e),
            _ => None,
        })
    }

    pub fn params(&self) -> impl Iterator<Item = &TensorEntry> {
        self.entries().filter(|e| e.kind == EntryKind::Param)
    }

    pub fn find(&self, node: NodeId) -> Option<&TensorEntry> {
        self.entries().find(|e| e.tensor.node_id() == node)
    }

    /// Split markers in registration order.
    pub fn splits(&self) -> Vec<NodeId> {
        self.items
            .iter()
            .filter_map(|item| match item {
                RegistryItem::Split(t) => Some(t.node_id()),
                _ => None,
            })
            .collect()
    }

    pub fn last_tensor(&self) -> Option<&Tensor> {
        self.entries().last().map(|e| &e.tensor)
    }

    pub fn n_entries(&self) -> usize {
        self.n_entries
    }
}
