fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure()
        .build_server(true)
        .build_client(true) // Used by launchers and the integration tests
        .compile_protos(&["proto/reprise.proto"], &["proto/"])?;
    Ok(())
}
