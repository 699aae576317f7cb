/// Builds the gRPC client and server code for the `dispatch.proto` definition
/// using `tonic-prost-build`.
///
/// This code generation step processes the Protocol Buffer definitions located
/// in the `proto` directory and emits Rust modules with gRPC bindings into the
/// crate's `OUT_DIR`, together with an encoded file descriptor set that the
/// dispatcher serves through gRPC reflection.
///
/// # Files and Paths
///
/// - Proto file: `proto/dispatch.proto`
/// - Includes: `proto/`
/// - Descriptor: `$OUT_DIR/dispatch_descriptor.bin`
///
/// # Output
///
/// Generated code is accessible via:
///
/// ```rust,ignore
/// pub mod proto {
///     tonic::include_proto!("dispatch");
/// }
/// ```
use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);
    let descriptor_path = out_dir.join("dispatch_descriptor.bin");

    println!("cargo:rerun-if-changed=proto/dispatch.proto");

    tonic_prost_build::configure()
        .file_descriptor_set_path(&descriptor_path)
        .compile_protos(&["proto/dispatch.proto"], &["proto"])?;

    Ok(())
}
