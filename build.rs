const PROTO_DIR: &str = "proto";
const PROTOS: &[&str] = &["proto/federated_learning.proto"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for proto in PROTOS {
        println!("cargo:rerun-if-changed={proto}");
    }

    // protoc ships with the build dependency
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    // Both sides live in this crate: clients host FederatedClient and dial
    // ParameterServer, the coordinator does the reverse.
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile(PROTOS, &[PROTO_DIR])?;

    Ok(())
}
