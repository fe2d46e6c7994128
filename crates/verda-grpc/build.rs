fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the bundled protoc when none is configured.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path()?;
        // SAFETY: the build script is single-threaded at this point.
        unsafe { std::env::set_var("PROTOC", protoc) };
    }

    println!("cargo:rerun-if-changed=proto/externalgrpc.proto");
    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/externalgrpc.proto"], &["proto"])?;
    Ok(())
}
