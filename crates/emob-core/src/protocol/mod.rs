//! emob wire protocol: frame codec and GATT service layout

pub mod frame;
pub mod service;

pub use frame::{Frame, FrameCodec, Header, HEADER_SIZE};
pub use service::{
    CharacteristicDefinition, DescriptorDefinition, ServiceDefinition, EMOB_CHARACTERISTIC_UUID,
    EMOB_DESCRIPTOR_UUID, EMOB_SERVICE_UUID, ENABLE_NOTIFICATION_VALUE,
};
