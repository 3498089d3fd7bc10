//! The payload tree: named arrays, scalars and nested maps or lists.

use crate::codec::array::{ArrayData, NdArray};
use crate::codec::container::LazyArray;
use crate::{Result, VaultError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// An array leaf, either in memory or still inside an open container.
#[derive(Debug, Clone)]
pub enum ArrayHandle {
    Loaded(Arc<NdArray>),
    Lazy(LazyArray),
}

impl ArrayHandle {
    /// Materialize the array, reading it from the container on first access.
    pub fn get(&self) -> Result<&NdArray> {
        match self {
            ArrayHandle::Loaded(array) => Ok(array),
            ArrayHandle::Lazy(lazy) => lazy.get(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        match self {
            ArrayHandle::Loaded(_) => true,
            ArrayHandle::Lazy(lazy) => lazy.is_loaded(),
        }
    }
}

impl From<NdArray> for ArrayHandle {
    fn from(array: NdArray) -> Self {
        ArrayHandle::Loaded(Arc::new(array))
    }
}

/// One node of a payload tree.
#[derive(Debug, Clone)]
pub enum TreeNode {
    Array(ArrayHandle),
    Map(BTreeMap<String, TreeNode>),
    List(Vec<TreeNode>),
    Scalar(Value),
}

impl TreeNode {
    pub fn map() -> Self {
        TreeNode::Map(BTreeMap::new())
    }

    pub fn array(array: NdArray) -> Self {
        TreeNode::Array(array.into())
    }

    /// A one-dimensional array leaf.
    pub fn vector(data: ArrayData) -> Self {
        TreeNode::array(NdArray::vector(data))
    }

    pub fn scalar(value: impl Into<Value>) -> Self {
        TreeNode::Scalar(value.into())
    }

    /// Insert a child into a map node. Other nodes are left unchanged.
    pub fn with(mut self, key: &str, child: TreeNode) -> Self {
        if let TreeNode::Map(children) = &mut self {
            children.insert(key.to_string(), child);
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TreeNode::Array(_) => "array",
            TreeNode::Map(_) => "map",
            TreeNode::List(_) => "list",
            TreeNode::Scalar(_) => "scalar",
        }
    }

    /// Child `key` of a map node.
    pub fn get(&self, key: &str) -> Result<&TreeNode> {
        match self {
            TreeNode::Map(children) => children
                .get(key)
                .ok_or_else(|| VaultError::codec(format!("missing key \"{}\"", key))),
            other => Err(VaultError::codec(format!(
                "expected a map holding \"{}\", got {}",
                key,
                other.kind()
            ))),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, TreeNode>> {
        match self {
            TreeNode::Map(children) => Ok(children),
            other => Err(unexpected("map", other)),
        }
    }

    pub fn as_list(&self) -> Result<&[TreeNode]> {
        match self {
            TreeNode::List(items) => Ok(items),
            other => Err(unexpected("list", other)),
        }
    }

    pub fn as_array(&self) -> Result<&NdArray> {
        match self {
            TreeNode::Array(handle) => handle.get(),
            other => Err(unexpected("array", other)),
        }
    }

    pub fn as_handle(&self) -> Result<&ArrayHandle> {
        match self {
            TreeNode::Array(handle) => Ok(handle),
            other => Err(unexpected("array", other)),
        }
    }

    pub fn as_scalar(&self) -> Result<&Value> {
        match self {
            TreeNode::Scalar(value) => Ok(value),
            other => Err(unexpected("scalar", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        self.as_scalar()?
            .as_str()
            .ok_or_else(|| VaultError::codec("expected a string scalar"))
    }

    pub fn as_u64(&self) -> Result<u64> {
        self.as_scalar()?
            .as_u64()
            .ok_or_else(|| VaultError::codec("expected a non-negative integer scalar"))
    }

    /// Visit every array leaf with its `/`-separated path. List items use their index.
    pub fn for_each_array<F>(&self, visit: &mut F) -> Result<()>
    where
        F: FnMut(&str, &ArrayHandle) -> Result<()>,
    {
        self.walk("", visit)
    }

    fn walk<F>(&self, path: &str, visit: &mut F) -> Result<()>
    where
        F: FnMut(&str, &ArrayHandle) -> Result<()>,
    {
        match self {
            TreeNode::Array(handle) => visit(path, handle),
            TreeNode::Map(children) => {
                for (key, child) in children {
                    child.walk(&join_path(path, key), visit)?;
                }
                Ok(())
            }
            TreeNode::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.walk(&join_path(path, &i.to_string()), visit)?;
                }
                Ok(())
            }
            TreeNode::Scalar(_) => Ok(()),
        }
    }
}

pub(crate) fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", parent, key)
    }
}

fn unexpected(wanted: &str, node: &TreeNode) -> VaultError {
    VaultError::codec(format!("expected {}, got {}", wanted, node.kind()))
}
