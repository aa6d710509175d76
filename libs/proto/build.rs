use std::io::Result;
use std::path::PathBuf;

/// Set to regenerate `src/gen` from the proto definitions (needs `protoc`).
const REGEN_ENV: &str = "SSMGR_PROTO_REGEN";

fn main() -> Result<()> {
    let proto_root = PathBuf::from("../../api/proto");
    let protos = ["trojan/api.proto"];

    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed={}", REGEN_ENV);
    for proto in &protos {
        println!(
            "cargo:rerun-if-changed={}",
            proto_root.join(proto).display()
        );
    }

    if std::env::var_os(REGEN_ENV).is_none() {
        return Ok(());
    }

    let proto_paths: Vec<PathBuf> = protos.iter().map(|p| proto_root.join(p)).collect();

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .out_dir("src/gen")
        .compile_protos(&proto_paths, &[&proto_root])?;

    Ok(())
}
