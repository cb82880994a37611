use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::props::Props;

/// A satellite node of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub props: Props,
    pub online: bool,
    pub deleting: bool,
    pub evacuating: bool,
    /// External tools reported by the satellite (`socat`, `zstd`, ...)
    pub ext_tools: BTreeSet<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            props: Props::default(),
            online: true,
            deleting: false,
            evacuating: false,
            ext_tools: BTreeSet::new(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ext_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Online and not on its way out of the cluster.
    pub fn is_usable(&self) -> bool {
        self.online && !self.deleting && !self.evacuating
    }

    pub fn has_tools(&self, tools: &[&str]) -> bool {
        tools.iter().all(|t| self.ext_tools.contains(*t))
    }
}
