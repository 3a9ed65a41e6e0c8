//! GATT service layout and identifiers for emob
//!
//! One primary service exposes one read/write/notify characteristic that
//! carries frame bytes in both directions, plus the client characteristic
//! configuration descriptor used to turn notifications on.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Primary emob service UUID
pub const EMOB_SERVICE_UUID: Uuid = Uuid::from_u128(0xEB5AC374_B364_4B90_BF05_000000000000);

/// Characteristic carrying frames (read, write, notify)
pub const EMOB_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xEB5AC374_B364_4B90_BF05_000000000001);

/// Descriptor written to enable notifications
pub const EMOB_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0xEB5AC374_B364_4B90_BF05_000000000002);

/// Descriptor value that enables notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

pub const PROPERTY_READ: u8 = 0x02;
pub const PROPERTY_WRITE: u8 = 0x08;
pub const PROPERTY_NOTIFY: u8 = 0x10;

pub const PERMISSION_READ: u16 = 0x01;
pub const PERMISSION_WRITE: u16 = 0x10;

// ----------------------------------------------------------------------------
// Service Definition
// ----------------------------------------------------------------------------

/// Descriptor registered under a characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub uuid: Uuid,
    pub permissions: u16,
}

/// Characteristic registered under the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: u8,
    pub permissions: u16,
    pub descriptors: Vec<DescriptorDefinition>,
}

impl CharacteristicDefinition {
    /// Whether the characteristic supports notifications
    pub fn can_notify(&self) -> bool {
        self.properties & PROPERTY_NOTIFY != 0
    }
}

/// Primary service registered by the server role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    /// The emob service with its single characteristic and descriptor
    pub fn emob() -> Self {
        Self {
            uuid: EMOB_SERVICE_UUID,
            characteristics: vec![CharacteristicDefinition {
                uuid: EMOB_CHARACTERISTIC_UUID,
                properties: PROPERTY_READ | PROPERTY_WRITE | PROPERTY_NOTIFY,
                permissions: PERMISSION_READ | PERMISSION_WRITE,
                descriptors: vec![DescriptorDefinition {
                    uuid: EMOB_DESCRIPTOR_UUID,
                    permissions: PERMISSION_READ | PERMISSION_WRITE,
                }],
            }],
        }
    }

    /// Look up a characteristic by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDefinition> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emob_service_layout() {
        let service = ServiceDefinition::emob();
        assert_eq!(service.uuid, EMOB_SERVICE_UUID);

        let characteristic = service.characteristic(EMOB_CHARACTERISTIC_UUID).unwrap();
        assert!(characteristic.can_notify());
        assert_eq!(characteristic.descriptors[0].uuid, EMOB_DESCRIPTOR_UUID);
    }

    #[test]
    fn test_uuids_share_base() {
        assert_eq!(
            EMOB_SERVICE_UUID.to_string(),
            "eb5ac374-b364-4b90-bf05-000000000000"
        );
        assert_eq!(
            EMOB_DESCRIPTOR_UUID.to_string(),
            "eb5ac374-b364-4b90-bf05-000000000002"
        );
    }
}
