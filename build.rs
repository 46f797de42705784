use std::{env, error::Error, path::PathBuf};

use vergen::{BuildBuilder, Emitter};

fn main() -> Result<(), Box<dyn Error>> {
    let build = BuildBuilder::all_build()?;

    Emitter::default().add_instructions(&build)?.emit()?;

    let proto_files = ["./proto/qsd.proto"];
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_client(true) // Used by the in-process service tests
        .build_server(true)
        .file_descriptor_set_path(out_dir.join("qsd_descriptor.bin"))
        .protoc_arg("--experimental_allow_proto3_optional") // Required for building on Ubuntu 22.04
        .compile_protos(&proto_files, &["proto"])?;
    Ok(())
}
