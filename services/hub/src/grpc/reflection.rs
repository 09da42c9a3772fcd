//! Server reflection over descriptors of the hand-written messages.

use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};

use super::{REGISTRY_PACKAGE, VERSION_PACKAGE};

fn field(name: &str, number: i32, kind: Type) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(kind as i32),
        json_name: Some(json_name(name)),
        ..Default::default()
    }
}

/// `git_commit` becomes `gitCommit`.
fn json_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn message(name: &str, fields: Vec<FieldDescriptorProto>) -> DescriptorProto {
    DescriptorProto {
        name: Some(name.to_string()),
        field: fields,
        ..Default::default()
    }
}

fn method(
    package: &str,
    name: &str,
    input: &str,
    output: &str,
    streaming: bool,
) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".{package}.{input}")),
        output_type: Some(format!(".{package}.{output}")),
        client_streaming: Some(false),
        server_streaming: Some(streaming),
        ..Default::default()
    }
}

fn file(
    name: &str,
    package: &str,
    messages: Vec<DescriptorProto>,
    service: ServiceDescriptorProto,
) -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some(name.to_string()),
        package: Some(package.to_string()),
        message_type: messages,
        service: vec![service],
        syntax: Some("proto3".to_string()),
        ..Default::default()
    }
}

/// Descriptors of the version and registry APIs.
pub fn file_descriptor_set() -> FileDescriptorSet {
    let version = file(
        "thub/version/v1/version.proto",
        VERSION_PACKAGE,
        vec![
            message("VersionRequest", Vec::new()),
            message(
                "VersionResponse",
                vec![
                    field("version", 1, Type::String),
                    field("git_commit", 2, Type::String),
                    field("build_date", 3, Type::String),
                    field("rustc_version", 4, Type::String),
                    field("compiler", 5, Type::String),
                    field("platform", 6, Type::String),
                ],
            ),
        ],
        ServiceDescriptorProto {
            name: Some("VersionService".to_string()),
            method: vec![method(
                VERSION_PACKAGE,
                "Version",
                "VersionRequest",
                "VersionResponse",
                false,
            )],
            ..Default::default()
        },
    );

    let registry = file(
        "thub/registry/v1/registry.proto",
        REGISTRY_PACKAGE,
        vec![
            message("PullRequest", Vec::new()),
            message("PullResponse", vec![field("chunk", 1, Type::Bytes)]),
        ],
        ServiceDescriptorProto {
            name: Some("RegistryService".to_string()),
            method: vec![method(
                REGISTRY_PACKAGE,
                "Pull",
                "PullRequest",
                "PullResponse",
                true,
            )],
            ..Default::default()
        },
    );

    FileDescriptorSet {
        file: vec![version, registry],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{REGISTRY_SERVICE, VERSION_SERVICE};

    #[test]
    fn test_json_name() {
        assert_eq!(json_name("rustc_version"), "rustcVersion");
        assert_eq!(json_name("chunk"), "chunk");
    }

    #[test]
    fn test_services_are_described() {
        let set = file_descriptor_set();
        let services: Vec<String> = set
            .file
            .iter()
            .flat_map(|f| {
                let package = f.package().to_string();
                f.service
                    .iter()
                    .map(move |s| format!("{package}.{}", s.name()))
            })
            .collect();
        assert_eq!(services, [VERSION_SERVICE, REGISTRY_SERVICE]);
    }

    #[test]
    fn test_reflection_service_builds() {
        assert!(tonic_reflection::server::Builder::configure()
            .register_file_descriptor_set(file_descriptor_set())
            .build_v1()
            .is_ok());
    }
}
