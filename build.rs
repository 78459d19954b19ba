fn main() {
    // Re-run build if any proto changes
    println!("cargo:rerun-if-changed=proto");

    // Ensure protoc is available using vendored binary to avoid system dependency.
    let protoc_path = protoc_bin_vendored::protoc_bin_path().expect("vendored protoc not found");
    std::env::set_var("PROTOC", &protoc_path);

    // Configure tonic/prost codegen
    // Well-known types (including wrapper scalars like BoolValue) are mapped
    // to prost_types / native scalars by default, so no extra extern_path or
    // compile_well_known_types(true) call is needed here.
    let cfg = tonic_prost_build::configure()
        // Generate clients as well; the gRPC tests drive the server with them.
        .build_client(true)
        .build_server(true);

    // Compile the callout service protos and minimal dependencies from our local vendor dir
    cfg.compile_protos(
        &[
            "proto/envoy/service/ext_proc/v3/external_processor.proto",
            "proto/envoy/service/auth/v3/external_auth.proto",
            "proto/envoy/service/network_ext_proc/v3/network_external_processor.proto",
            "proto/envoy/extensions/filters/http/ext_proc/v3/processing_mode.proto",
            "proto/envoy/config/core/v3/base.proto",
            "proto/envoy/config/core/v3/address.proto",
            "proto/envoy/type/v3/http_status.proto",
            "proto/google/rpc/status.proto",
        ],
        &["proto"],
    )
    .expect("failed to compile Envoy callout protos");
}
