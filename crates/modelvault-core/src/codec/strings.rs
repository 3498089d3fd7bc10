//! Packing many strings into one buffer plus a squeezed lengths array.

use crate::codec::array::{squeeze_bits, ArrayData};
use crate::codec::tree::TreeNode;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};

/// Whether merged elements were text or raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringKind {
    #[default]
    Text,
    Bytes,
}

impl StringKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StringKind::Text => "text",
            StringKind::Bytes => "bytes",
        }
    }

    fn parse(name: &str) -> Result<Self> {
        match name {
            "text" => Ok(StringKind::Text),
            "bytes" => Ok(StringKind::Bytes),
            other => Err(VaultError::codec(format!("unknown string kind \"{}\"", other))),
        }
    }
}

/// One element of a heterogeneous input to [`merge_strings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringItem<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> StringItem<'a> {
    fn kind(&self) -> StringKind {
        match self {
            StringItem::Text(_) => StringKind::Text,
            StringItem::Bytes(_) => StringKind::Bytes,
        }
    }

    fn bytes(&self) -> &'a [u8] {
        match self {
            StringItem::Text(text) => text.as_bytes(),
            StringItem::Bytes(bytes) => bytes,
        }
    }
}

/// Strings concatenated into `data`, with per-element byte lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedStrings {
    pub data: Vec<u8>,
    pub lengths: ArrayData,
    pub kind: StringKind,
}

/// The inverse of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitStrings {
    Text(Vec<String>),
    Bytes(Vec<Vec<u8>>),
}

impl SplitStrings {
    pub fn len(&self) -> usize {
        match self {
            SplitStrings::Text(items) => items.len(),
            SplitStrings::Bytes(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_text(self) -> Result<Vec<String>> {
        match self {
            SplitStrings::Text(items) => Ok(items),
            SplitStrings::Bytes(_) => Err(VaultError::codec("expected text strings, got bytes")),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<Vec<u8>>> {
        match self {
            SplitStrings::Bytes(items) => Ok(items),
            SplitStrings::Text(_) => Err(VaultError::codec("expected byte strings, got text")),
        }
    }
}

/// Merge a uniform sequence of text or byte strings.
///
/// Mixing text and bytes fails with a codec error. Empty input yields an empty
/// buffer and an empty lengths array.
pub fn merge_strings(items: &[StringItem<'_>]) -> Result<MergedStrings> {
    let kind = items.first().map(StringItem::kind).unwrap_or_default();
    if let Some(pos) = items.iter().position(|item| item.kind() != kind) {
        return Err(VaultError::codec(format!(
            "strings must be all text or all bytes: element {} is {}, expected {}",
            pos,
            items[pos].kind().as_str(),
            kind.as_str()
        )));
    }
    Ok(merge_raw(items.iter().map(StringItem::bytes), kind))
}

/// Merge text strings.
pub fn merge_text<S: AsRef<str>>(strings: &[S]) -> MergedStrings {
    merge_raw(strings.iter().map(|s| s.as_ref().as_bytes()), StringKind::Text)
}

/// Merge byte strings.
pub fn merge_bytes<B: AsRef<[u8]>>(items: &[B]) -> MergedStrings {
    merge_raw(items.iter().map(|item| item.as_ref()), StringKind::Bytes)
}

fn merge_raw<'a>(items: impl Iterator<Item = &'a [u8]>, kind: StringKind) -> MergedStrings {
    let mut data = Vec::new();
    let mut lengths = Vec::new();
    for item in items {
        data.extend_from_slice(item);
        lengths.push(item.len() as u64);
    }
    MergedStrings {
        data,
        lengths: squeeze_bits(&lengths),
        kind,
    }
}

/// Split a merged buffer back into its elements.
pub fn split_strings(merged: &MergedStrings) -> Result<SplitStrings> {
    let lengths = merged.lengths.to_u64_vec()?;
    let total: u64 = lengths.iter().sum();
    if total != merged.data.len() as u64 {
        return Err(VaultError::codec(format!(
            "lengths add up to {} bytes but the buffer holds {}",
            total,
            merged.data.len()
        )));
    }

    let mut offset = 0usize;
    let mut slices = Vec::with_capacity(lengths.len());
    for length in lengths {
        let end = offset + length as usize;
        slices.push(&merged.data[offset..end]);
        offset = end;
    }

    match merged.kind {
        StringKind::Bytes => Ok(SplitStrings::Bytes(
            slices.into_iter().map(<[u8]>::to_vec).collect(),
        )),
        StringKind::Text => slices
            .into_iter()
            .map(|slice| {
                String::from_utf8(slice.to_vec())
                    .map_err(|e| VaultError::codec(format!("invalid UTF-8 in merged strings: {}", e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(SplitStrings::Text),
    }
}

impl MergedStrings {
    /// Tree form: `{strings, lengths, kind}`.
    pub fn to_tree(&self) -> TreeNode {
        TreeNode::map()
            .with("strings", TreeNode::vector(ArrayData::U8(self.data.clone())))
            .with("lengths", TreeNode::vector(self.lengths.clone()))
            .with("kind", TreeNode::scalar(self.kind.as_str()))
    }

    pub fn from_tree(node: &TreeNode) -> Result<Self> {
        let data = node.get("strings")?.as_array()?;
        let data = data
            .data()
            .as_bytes()
            .ok_or_else(|| VaultError::codec("merged strings buffer must be u8"))?
            .to_vec();
        let lengths = node.get("lengths")?.as_array()?.data().clone();
        let kind = StringKind::parse(node.get("kind")?.as_str()?)?;
        Ok(Self {
            data,
            lengths,
            kind,
        })
    }
}
