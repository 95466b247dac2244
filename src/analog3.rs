pub mod config;
pub mod schema;

use num_enum::{IntoPrimitive, TryFromPrimitive};

// ID assignments /////////////////////////////////
pub const A3_ID_ADMIN_WIRES_BASE: u32 = 0x680;

pub const A3_ID_MISSION_CONTROL: u32 = 0x700;
pub const A3_ID_INDIVIDUAL_MODULE_BASE: u32 = 0x700;

/// Module UIDs are 29-bit values so that they fit into an extended CAN ID.
pub const A3_UID_MASK: u32 = 0x1fff_ffff;

// Opcodes ////////////////////////////////////////

/* Module administration opcodes (extended frames addressed by UID) */
pub const A3_ADMIN_SIGN_IN: u8 = 0x01;
pub const A3_ADMIN_NOTIFY_ID: u8 = 0x02;
pub const A3_ADMIN_REQ_UID_CANCEL: u8 = 0x03;

/* Mission control opcodes */
pub const A3_MC_SIGN_IN: u8 = 0x01;
pub const A3_MC_ASSIGN_MODULE_ID: u8 = 0x02;
pub const A3_MC_PING: u8 = 0x03;
pub const A3_MC_REQUEST_NAME: u8 = 0x04;
pub const A3_MC_REQUEST_CONFIG: u8 = 0x05;
pub const A3_MC_MODIFY_CONFIG: u8 = 0x08;

/* Individual module opcodes */
pub const A3_IM_PING_REPLY: u8 = 0x01;
pub const A3_IM_ID_ASSIGN_ACK: u8 = 0x02;

pub const A3_DATA_LENGTH: usize = 8;
pub const A3_MAX_CONFIG_DATA_LENGTH: usize = 64;

/// Status byte sent on an admin wire in reply to a stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StreamStatus {
    Ready = 0,
    Busy = 1,
    NotSupported = 2,
    NoSuchStream = 3,
}

/// Properties that are common among modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PropertyId {
    ModuleUid = 0,
    ModuleType = 1,
    Name = 2,
}
