pub mod error;
pub mod types;

pub use error::{Error, Result};

/// Generated `user.v1` messages, client and server.
pub mod proto {
    tonic::include_proto!("user.v1");

    /// Encoded descriptor set for `tonic-reflection`.
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("user_descriptor");
}
