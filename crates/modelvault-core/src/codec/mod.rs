//! Serialization codec: typed arrays, packed strings, sparse matrices and the
//! container file holding a metadata header plus a payload tree.

mod array;
mod container;
mod prefix;
mod sparse;
mod strings;
mod tree;

pub use array::{squeeze_bits, ArrayData, Dtype, NdArray};
pub use container::{
    decode_container, encode_container, open_container, read_meta, read_meta_from_bytes,
    write_container, BlockInfo, Compression, Container, ContainerSource, LazyArray, WriteOptions,
};
pub use prefix::PrefixSet;
pub use sparse::{
    assemble_sparse_matrix, detect_offset_encoding, disassemble_sparse_matrix, CompressedMatrix,
    CooMatrix, OffsetEncoding, SparseFormat, SparseMatrix,
};
pub use strings::{
    merge_bytes, merge_strings, merge_text, split_strings, MergedStrings, SplitStrings, StringItem,
    StringKind,
};
pub use tree::{ArrayHandle, TreeNode};
