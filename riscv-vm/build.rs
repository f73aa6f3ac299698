fn main() {
    if std::env::var_os("CARGO_FEATURE_NAPI").is_some() {
        napi_build::setup();
    }

    prost_build::compile_protos(&["proto/checkpoint.proto"], &["proto/"])
        .expect("failed to compile checkpoint.proto");
}
