//! Protocol buffer definitions and generated gRPC bindings.
//!
//! - [`device::v1`]: management API served by the metagpu device plugin
//! - [`deviceplugin::v1beta1`]: kubelet device plugin API
//! - [`podresources::v1`]: kubelet pod-resources API (List only)

pub mod device {
    pub mod v1 {
        tonic::include_proto!("device.v1");
    }
}

pub mod deviceplugin {
    pub mod v1beta1 {
        tonic::include_proto!("v1beta1");
    }
}

pub mod podresources {
    pub mod v1 {
        tonic::include_proto!("v1");
    }
}

pub use device::v1::device_service_client::DeviceServiceClient;
pub use device::v1::device_service_server::DeviceService;
pub use device::v1::device_service_server::DeviceServiceServer;
pub use device::v1::DeviceProcess;
