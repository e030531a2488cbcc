#![forbid(unsafe_code)]

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;

pub mod sdr;

pub mod codec;

pub mod pack {
    pub mod concat;
    pub mod multi;
    pub mod sparse;
    pub mod trailer;
    pub mod writer;
}

pub mod filter;

pub mod convert;

pub mod store;
pub mod store_fs;

pub mod index {
    pub mod filetree;
    pub mod indirect;
    pub mod object;
}

pub use crate::error::{Error, Result};

pub use crate::pack::concat::Concat;
pub use crate::pack::multi::MultiWriter;
pub use crate::pack::sparse::SparseIndex;
pub use crate::pack::trailer::{BlockDesc, Trailer};
pub use crate::pack::writer::{CompressionWriter, WriterConfig};

pub use crate::convert::{Converter, Input, RowFormat};

pub use crate::index::filetree::FileTree;
pub use crate::index::object::{decode_index, sign, Descriptor, Index, IndexConfig, Key, ObjectInfo};

pub use crate::store_fs::DirFs;

pub mod prelude {
    pub use crate::codec::frame::BlockDecoder;
    pub use crate::convert::{open_input, Converter, Input, RowFormat};
    pub use crate::error::{Error, Result};
    pub use crate::filter::{CmpOp, Expr, Filter};
    pub use crate::index::object::{decode_index, sign, Index, IndexConfig, Key};
    pub use crate::pack::trailer::Trailer;
    pub use crate::pack::writer::WriterConfig;
    pub use crate::store::{InputFs, UploadFs, Uploader};
    pub use crate::store_fs::DirFs;
}
