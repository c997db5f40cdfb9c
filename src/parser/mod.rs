pub mod assembler;
pub mod datasets;
pub mod rows;

pub use assembler::{LogicalRecord, RecordAssembler};
pub use datasets::DatasetSpec;
pub use rows::{RawRow, RecordKind};
