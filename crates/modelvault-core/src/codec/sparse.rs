//! Sparse matrices and their array-tree form.
//!
//! CSR and CSC store `[data, indices, indptr]`, COO stores `[data, row, col]`.
//! Index arrays are width-squeezed. `indptr` is written as row-length deltas with a
//! leading zero and tagged `indptr_encoding = "diff"`. Trees without the tag are
//! decoded by value inspection: a last offset different from the number of stored
//! values means deltas. A delta array whose last element equals nnz can only come
//! from a matrix whose earlier rows are all empty, in which case deltas and raw
//! offsets coincide, so the inspection never decodes a valid tree wrongly.

use crate::codec::array::{squeeze_bits, ArrayData};
use crate::codec::tree::TreeNode;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Storage format of a sparse matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SparseFormat {
    Csr,
    Csc,
    Coo,
}

impl SparseFormat {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SparseFormat::Csr => "csr",
            SparseFormat::Csc => "csc",
            SparseFormat::Coo => "coo",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "csr" => Ok(SparseFormat::Csr),
            "csc" => Ok(SparseFormat::Csc),
            "coo" => Ok(SparseFormat::Coo),
            other => Err(VaultError::codec(format!(
                "unsupported sparse format \"{}\", expected csr, csc or coo",
                other
            ))),
        }
    }
}

/// How `indptr` is stored in a disassembled tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetEncoding {
    Raw,
    Diff,
}

/// CSR or CSC storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedMatrix {
    pub shape: (usize, usize),
    pub data: ArrayData,
    pub indices: Vec<u64>,
    pub indptr: Vec<u64>,
}

/// Coordinate storage.
#[derive(Debug, Clone, PartialEq)]
pub struct CooMatrix {
    pub shape: (usize, usize),
    pub data: ArrayData,
    pub row: Vec<u64>,
    pub col: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SparseMatrix {
    Csr(CompressedMatrix),
    Csc(CompressedMatrix),
    Coo(CooMatrix),
}

impl SparseMatrix {
    pub fn format(&self) -> SparseFormat {
        match self {
            SparseMatrix::Csr(_) => SparseFormat::Csr,
            SparseMatrix::Csc(_) => SparseFormat::Csc,
            SparseMatrix::Coo(_) => SparseFormat::Coo,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            SparseMatrix::Csr(m) | SparseMatrix::Csc(m) => m.shape,
            SparseMatrix::Coo(m) => m.shape,
        }
    }

    pub fn nnz(&self) -> usize {
        match self {
            SparseMatrix::Csr(m) | SparseMatrix::Csc(m) => m.data.len(),
            SparseMatrix::Coo(m) => m.data.len(),
        }
    }

    /// Check that index arrays are consistent with the shape and the stored values.
    pub fn validate(&self) -> Result<()> {
        match self {
            SparseMatrix::Csr(m) => m.validate(m.shape.0, m.shape.1),
            SparseMatrix::Csc(m) => m.validate(m.shape.1, m.shape.0),
            SparseMatrix::Coo(m) => m.validate(),
        }
    }
}

impl CompressedMatrix {
    fn validate(&self, major: usize, minor: usize) -> Result<()> {
        let nnz = self.data.len() as u64;
        if self.indptr.len() != major + 1 {
            return Err(VaultError::codec(format!(
                "indptr has {} entries, expected {}",
                self.indptr.len(),
                major + 1
            )));
        }
        if self.indices.len() as u64 != nnz {
            return Err(VaultError::codec("indices and data lengths differ"));
        }
        if self.indptr.first() != Some(&0) || self.indptr.last() != Some(&nnz) {
            return Err(VaultError::codec("indptr must start at 0 and end at nnz"));
        }
        if self.indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(VaultError::codec("indptr must be non-decreasing"));
        }
        if self.indices.iter().any(|&i| i >= minor as u64) {
            return Err(VaultError::codec("index out of bounds"));
        }
        Ok(())
    }
}

impl CooMatrix {
    fn validate(&self) -> Result<()> {
        let nnz = self.data.len();
        if self.row.len() != nnz || self.col.len() != nnz {
            return Err(VaultError::codec("row, col and data lengths differ"));
        }
        if self.row.iter().any(|&r| r >= self.shape.0 as u64)
            || self.col.iter().any(|&c| c >= self.shape.1 as u64)
        {
            return Err(VaultError::codec("coordinate out of bounds"));
        }
        Ok(())
    }
}

/// Convert a sparse matrix into `{shape, format, data, indptr_encoding?}`.
pub fn disassemble_sparse_matrix(matrix: &SparseMatrix) -> Result<TreeNode> {
    matrix.validate()?;
    let (rows, cols) = matrix.shape();
    let mut tree = TreeNode::map()
        .with("shape", TreeNode::scalar(json!([rows, cols])))
        .with("format", TreeNode::scalar(matrix.format().as_str()));

    let arrays = match matrix {
        SparseMatrix::Csr(m) | SparseMatrix::Csc(m) => {
            tree = tree.with("indptr_encoding", TreeNode::scalar("diff"));
            vec![
                TreeNode::vector(m.data.clone()),
                TreeNode::vector(squeeze_bits(&m.indices)),
                TreeNode::vector(squeeze_bits(&diff_encode(&m.indptr))),
            ]
        }
        SparseMatrix::Coo(m) => vec![
            TreeNode::vector(m.data.clone()),
            TreeNode::vector(squeeze_bits(&m.row)),
            TreeNode::vector(squeeze_bits(&m.col)),
        ],
    };
    Ok(tree.with("data", TreeNode::List(arrays)))
}

/// Rebuild a sparse matrix from its tree form.
pub fn assemble_sparse_matrix(tree: &TreeNode) -> Result<SparseMatrix> {
    let format = SparseFormat::parse(tree.get("format")?.as_str()?)?;
    let shape = parse_shape(tree.get("shape")?)?;
    let arrays = tree.get("data")?.as_list()?;
    if arrays.len() != 3 {
        return Err(VaultError::codec(format!(
            "sparse matrix needs 3 arrays, got {}",
            arrays.len()
        )));
    }
    let data = arrays[0].as_array()?.data().clone();
    let second = arrays[1].as_array()?.data().to_u64_vec()?;
    let third = arrays[2].as_array()?.data().to_u64_vec()?;

    let matrix = match format {
        SparseFormat::Coo => SparseMatrix::Coo(CooMatrix {
            shape,
            data,
            row: second,
            col: third,
        }),
        SparseFormat::Csr | SparseFormat::Csc => {
            let encoding = match tree.as_map()?.get("indptr_encoding") {
                Some(node) => match node.as_str()? {
                    "diff" => OffsetEncoding::Diff,
                    "raw" => OffsetEncoding::Raw,
                    other => {
                        return Err(VaultError::codec(format!(
                            "unknown indptr encoding \"{}\"",
                            other
                        )))
                    }
                },
                None => detect_offset_encoding(&third, data.len()),
            };
            let indptr = match encoding {
                OffsetEncoding::Diff => cumulative_sum(&third),
                OffsetEncoding::Raw => third,
            };
            let compressed = CompressedMatrix {
                shape,
                data,
                indices: second,
                indptr,
            };
            if format == SparseFormat::Csr {
                SparseMatrix::Csr(compressed)
            } else {
                SparseMatrix::Csc(compressed)
            }
        }
    };
    matrix.validate()?;
    Ok(matrix)
}

/// Offsets whose last element differs from nnz are deltas.
pub fn detect_offset_encoding(offsets: &[u64], nnz: usize) -> OffsetEncoding {
    match offsets.last() {
        Some(&last) if last != nnz as u64 => OffsetEncoding::Diff,
        _ => OffsetEncoding::Raw,
    }
}

/// `[0, o1 - o0, o2 - o1, ...]`, same length as `offsets`.
fn diff_encode(offsets: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(offsets.len());
    if offsets.is_empty() {
        return out;
    }
    out.push(0);
    out.extend(offsets.windows(2).map(|w| w[1] - w[0]));
    out
}

fn cumulative_sum(deltas: &[u64]) -> Vec<u64> {
    deltas
        .iter()
        .scan(0u64, |acc, &d| {
            *acc += d;
            Some(*acc)
        })
        .collect()
}

fn parse_shape(node: &TreeNode) -> Result<(usize, usize)> {
    let dims: Vec<usize> = node
        .as_scalar()?
        .as_array()
        .map(|dims| {
            dims.iter()
                .filter_map(|d| d.as_u64().map(|d| d as usize))
                .collect()
        })
        .unwrap_or_default();
    match dims.as_slice() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(VaultError::codec("sparse shape must be two non-negative integers")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::array::Dtype;

    // 3x4:
    // [1 0 2 0]
    // [0 0 0 0]
    // [0 3 0 4]
    fn csr() -> CompressedMatrix {
        CompressedMatrix {
            shape: (3, 4),
            data: ArrayData::F32(vec![1.0, 2.0, 3.0, 4.0]),
            indices: vec![0, 2, 1, 3],
            indptr: vec![0, 2, 2, 4],
        }
    }

    #[test]
    fn test_csr_round_trip() {
        let matrix = SparseMatrix::Csr(csr());
        let tree = disassemble_sparse_matrix(&matrix).unwrap();
        assert_eq!(tree.get("format").unwrap().as_str().unwrap(), "csr");
        let stored = tree.get("data").unwrap().as_list().unwrap();
        assert_eq!(
            stored[2].as_array().unwrap().data().to_u64_vec().unwrap(),
            vec![0, 2, 0, 2]
        );
        assert_eq!(stored[1].as_array().unwrap().dtype(), Dtype::U8);
        assert_eq!(assemble_sparse_matrix(&tree).unwrap(), matrix);
    }

    #[test]
    fn test_csc_and_coo_round_trip() {
        let csc = SparseMatrix::Csc(CompressedMatrix {
            shape: (2, 3),
            data: ArrayData::I64(vec![5, -6]),
            indices: vec![1, 0],
            indptr: vec![0, 1, 1, 2],
        });
        let coo = SparseMatrix::Coo(CooMatrix {
            shape: (1000, 70000),
            data: ArrayData::F64(vec![0.5, 1.5]),
            row: vec![999, 0],
            col: vec![0, 69999],
        });
        for matrix in [csc, coo] {
            let tree = disassemble_sparse_matrix(&matrix).unwrap();
            assert_eq!(assemble_sparse_matrix(&tree).unwrap(), matrix);
        }
    }

    #[test]
    fn test_untagged_trees_are_detected() {
        let matrix = SparseMatrix::Csr(csr());
        let strip = |tree: TreeNode| match tree {
            TreeNode::Map(mut children) => {
                children.remove("indptr_encoding");
                TreeNode::Map(children)
            }
            other => other,
        };

        let diff_tree = strip(disassemble_sparse_matrix(&matrix).unwrap());
        assert_eq!(assemble_sparse_matrix(&diff_tree).unwrap(), matrix);

        let raw_tree = TreeNode::map()
            .with("shape", TreeNode::scalar(json!([3, 4])))
            .with("format", TreeNode::scalar("csr"))
            .with(
                "data",
                TreeNode::List(vec![
                    TreeNode::vector(ArrayData::F32(vec![1.0, 2.0, 3.0, 4.0])),
                    TreeNode::vector(ArrayData::U8(vec![0, 2, 1, 3])),
                    TreeNode::vector(ArrayData::U8(vec![0, 2, 2, 4])),
                ]),
            );
        assert_eq!(assemble_sparse_matrix(&raw_tree).unwrap(), matrix);
    }

    #[test]
    fn test_all_values_in_last_row() {
        let matrix = SparseMatrix::Csr(CompressedMatrix {
            shape: (3, 2),
            data: ArrayData::U8(vec![1, 2]),
            indices: vec![0, 1],
            indptr: vec![0, 0, 0, 2],
        });
        assert_eq!(diff_encode(&[0, 0, 0, 2]), vec![0, 0, 0, 2]);
        assert_eq!(
            detect_offset_encoding(&[0, 0, 0, 2], 2),
            OffsetEncoding::Raw
        );
        let tree = disassemble_sparse_matrix(&matrix).unwrap();
        assert_eq!(assemble_sparse_matrix(&tree).unwrap(), matrix);
    }

    #[test]
    fn test_empty_matrix() {
        let matrix = SparseMatrix::Csr(CompressedMatrix {
            shape: (2, 2),
            data: ArrayData::F32(vec![]),
            indices: vec![],
            indptr: vec![0, 0, 0],
        });
        let tree = disassemble_sparse_matrix(&matrix).unwrap();
        assert_eq!(assemble_sparse_matrix(&tree).unwrap(), matrix);
    }

    #[test]
    fn test_rejects_unknown_format_and_bad_matrix() {
        let tree = disassemble_sparse_matrix(&SparseMatrix::Csr(csr()))
            .unwrap()
            .with("format", TreeNode::scalar("dia"));
        assert!(matches!(
            assemble_sparse_matrix(&tree),
            Err(VaultError::Codec { .. })
        ));

        let mut bad = csr();
        bad.indptr = vec![0, 1, 4];
        assert!(disassemble_sparse_matrix(&SparseMatrix::Csr(bad)).is_err());
    }
}
