use std::process::Command;

use tonic_build::manual::{Builder, Method, Service};

fn main() {
    let version = Service::builder()
        .name("VersionService")
        .package("thub.version.v1")
        .method(
            Method::builder()
                .name("version")
                .route_name("Version")
                .input_type("crate::grpc::proto::VersionRequest")
                .output_type("crate::grpc::proto::VersionResponse")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    let registry = Service::builder()
        .name("RegistryService")
        .package("thub.registry.v1")
        .method(
            Method::builder()
                .name("pull")
                .route_name("Pull")
                .input_type("crate::grpc::proto::PullRequest")
                .output_type("crate::grpc::proto::PullResponse")
                .codec_path("tonic::codec::ProstCodec")
                .server_streaming()
                .build(),
        )
        .build();

    Builder::new().compile(&[version, registry]);

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=THUB_RUSTC_VERSION={rustc_version}");

    println!("cargo:rerun-if-env-changed=THUB_GIT_COMMIT");
    println!("cargo:rerun-if-env-changed=THUB_BUILD_DATE");
    println!("cargo:rerun-if-changed=build.rs");
}
