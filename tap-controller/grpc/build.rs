const PROTO_ROOT: &str = "../../proto";

const PROTOS: &[&str] = &["proxy/tap.proto", "tap.proto"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed={PROTO_ROOT}");

    // Builds do not depend on a system protoc.
    let mut config = prost_build::Config::new();
    config.protoc_executable(protoc_bin_vendored::protoc_bin_path()?);

    let protos = PROTOS
        .iter()
        .map(|p| format!("{PROTO_ROOT}/{p}"))
        .collect::<Vec<_>>();
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos_with_config(config, &protos, &[PROTO_ROOT])?;

    Ok(())
}
