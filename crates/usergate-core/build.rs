/// Builds the gRPC client and server code for the `user.proto` definition
/// using `tonic-prost-build`.
///
/// The Protocol Buffer definitions in `proto/` are compiled into Rust modules
/// with gRPC bindings in the crate's `OUT_DIR`. An encoded file descriptor set
/// is written next to them so the server can expose gRPC reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/user.proto`
/// - Includes: `proto/`
/// - Descriptor: `$OUT_DIR/user_descriptor.bin`
///
/// # Panics
///
/// Panics if code generation fails (including a missing `protoc`).
///
/// # Output
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("user.v1");
/// }
/// ```
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("user_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/user.proto"], &["proto"])
        .unwrap();

    println!("cargo:rerun-if-changed=proto/user.proto");
}
