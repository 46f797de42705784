//! Generated protobuf definitions for the node's volume service.

#[allow(non_camel_case_types, clippy::enum_variant_names)]
pub mod qsd_pb {
    tonic::include_proto!("qsd");
}

pub const QSD_FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("qsd_descriptor");
