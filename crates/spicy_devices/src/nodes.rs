use std::collections::HashMap;
use std::fmt;

use crate::error::{DeviceError, DeviceResult};

/// Index of a circuit unknown. `0` is the ground reference; node voltages, device
/// internal nodes and branch currents all share the `1..=n` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeIndex(pub usize);

impl NodeIndex {
    pub const GROUND: NodeIndex = NodeIndex(0);

    pub fn is_ground(self) -> bool {
        self.0 == 0
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKind {
    /// externally visible node voltage
    Voltage,
    /// node created by a device for its own use (e.g. behind a series resistance)
    Internal,
    /// branch current of a voltage-defined element
    Branch,
}

/// Numbering of every circuit unknown.
///
/// MNA row/column of an unknown is `index - 1`; ground has no row.
#[derive(Debug, Clone, Default)]
pub struct NodeMapping {
    unknowns: Vec<(String, UnknownKind)>,
    lookup: HashMap<String, NodeIndex>,
}

impl NodeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: String, kind: UnknownKind) -> NodeIndex {
        if let Some(existing) = self.lookup.get(&name) {
            return *existing;
        }
        self.unknowns.push((name.clone(), kind));
        let index = NodeIndex(self.unknowns.len());
        self.lookup.insert(name, index);
        index
    }

    /// Index of the named node, registering it on first use. `"0"` and `"gnd"` are ground.
    pub fn node(&mut self, name: &str) -> NodeIndex {
        if name == "0" || name.eq_ignore_ascii_case("gnd") {
            return NodeIndex::GROUND;
        }
        self.insert(name.to_string(), UnknownKind::Voltage)
    }

    /// Device-internal node `<owner>#<suffix>`.
    pub fn internal(&mut self, owner: &str, suffix: &str) -> NodeIndex {
        self.insert(format!("{owner}#{suffix}"), UnknownKind::Internal)
    }

    /// Branch-current unknown `<owner>#branch`.
    pub fn branch(&mut self, owner: &str) -> NodeIndex {
        self.insert(format!("{owner}#branch"), UnknownKind::Branch)
    }

    pub fn get(&self, name: &str) -> Option<NodeIndex> {
        if name == "0" || name.eq_ignore_ascii_case("gnd") {
            return Some(NodeIndex::GROUND);
        }
        self.lookup.get(name).copied()
    }

    /// Number of unknowns, which is also the MNA dimension.
    pub fn len(&self) -> usize {
        self.unknowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unknowns.is_empty()
    }

    pub fn name(&self, node: NodeIndex) -> Option<&str> {
        if node.is_ground() {
            return Some("0");
        }
        self.unknowns.get(node.0 - 1).map(|(name, _)| name.as_str())
    }

    pub fn kind(&self, node: NodeIndex) -> Option<UnknownKind> {
        if node.is_ground() {
            return None;
        }
        self.unknowns.get(node.0 - 1).map(|(_, kind)| *kind)
    }

    /// MNA row of `node`, `None` for ground.
    pub fn mna_index(&self, node: NodeIndex) -> DeviceResult<Option<usize>> {
        if node.is_ground() {
            return Ok(None);
        }
        if node.0 > self.unknowns.len() {
            return Err(DeviceError::UnregisteredNode {
                node: node.0,
                registered: self.unknowns.len(),
            });
        }
        Ok(Some(node.0 - 1))
    }
}
