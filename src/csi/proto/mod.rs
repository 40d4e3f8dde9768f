// Field names follow the protocol schema
#[allow(missing_docs, clippy::missing_docs_in_private_items)]
pub mod csi;
#[allow(missing_docs, clippy::missing_docs_in_private_items)]
pub mod csi_grpc;
