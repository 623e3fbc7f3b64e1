//! Object-storage access: the client seam, its S3 and in-memory
//! implementations, and the gateway that isolates them on a worker thread.

mod client;
mod error;
mod gateway;
pub mod memory;
mod s3;

pub use client::{
    ClientFactory, CompletedPart, ObjectBody, ObjectClient, ObjectInfo, ObjectPage, OpenUpload,
};
pub use error::{ClientError, ClientResult};
pub use gateway::StorageGateway;
pub use memory::MemoryObjectClient;
pub use s3::{S3ClientFactory, S3ObjectClient};
