pub mod controller;
pub mod writer;

pub use controller::{
    FileController, PosixFileController, RandomAccessFile, SsdFileController, WritableFile,
    WriteOptions,
};
pub use writer::FileWriter;
