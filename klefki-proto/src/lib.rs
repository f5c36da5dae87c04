//! Klefki Protocol - Protobuf types for machine, operator and broker communication

/// Generated protobuf types
pub mod rgst {
    pub mod klefki {
        pub mod v1 {
            tonic::include_proto!("rgst.klefki.v1");
        }
    }
}

pub use rgst::klefki::v1::*;

/// File descriptor set for gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("klefki_descriptor");
