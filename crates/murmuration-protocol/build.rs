//! Compiles `proto/mumble.proto` into `OUT_DIR/murmuration.rs` (prost names
//! the generated file after the proto package, not the file), included at
//! crate root as `crate::mumble` (see `lib.rs`). Uses `protox` instead of a system
//! `protoc` binary so the build doesn't depend on anything outside cargo —
//! mirrors the teacher's `capnp`-discovery build script in spirit (schema
//! compiled once, generated code dropped into `OUT_DIR`), but protobuf is
//! the wire format the Mumble protocol actually specifies.

fn main() {
    let proto_path = "../../proto/mumble.proto";
    let include_dir = "../../proto";

    let file_descriptor_set =
        protox::compile([proto_path], [include_dir]).expect("failed to compile mumble.proto");

    prost_build::Config::new()
        .out_dir(std::env::var("OUT_DIR").unwrap())
        .compile_fds(file_descriptor_set)
        .expect("failed to generate Rust bindings for mumble.proto");

    println!("cargo:rerun-if-changed={proto_path}");
}
