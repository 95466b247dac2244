use crate::analog3::{self as a3, StreamStatus};
use crate::can_controller::CanMessage;

// Module side //////////////////////////////////////////////////////////////////

pub fn sign_in(uid: u32) -> CanMessage {
    make_message_by_uid(uid, a3::A3_ADMIN_SIGN_IN)
}

pub fn notify_id(uid: u32, offset: u8) -> CanMessage {
    let mut out_message = make_message_by_uid(uid, a3::A3_ADMIN_NOTIFY_ID);
    out_message.set_data(1, offset);
    out_message.set_data_length(2);
    return out_message;
}

pub fn request_uid_cancel(uid: u32) -> CanMessage {
    make_message_by_uid(uid, a3::A3_ADMIN_REQ_UID_CANCEL)
}

pub fn id_assign_ack(short_addr: u32) -> CanMessage {
    CanMessage::standard(short_addr, &[a3::A3_IM_ID_ASSIGN_ACK])
}

pub fn ping_reply(short_addr: u32) -> CanMessage {
    CanMessage::standard(short_addr, &[a3::A3_IM_PING_REPLY])
}

pub fn stream_status(wire_id: u32, status: StreamStatus) -> CanMessage {
    CanMessage::standard(wire_id, &[status.into()])
}

// Mission control side /////////////////////////////////////////////////////////

pub fn mc_sign_in() -> CanMessage {
    CanMessage::standard(a3::A3_ID_MISSION_CONTROL, &[a3::A3_MC_SIGN_IN])
}

pub fn assign_module_id(remote_uid: u32, offset: u8) -> CanMessage {
    let mut out_message = CanMessage::new();
    out_message.set_id(a3::A3_ID_MISSION_CONTROL);
    out_message.set_data_length(6);
    out_message.set_data(0, a3::A3_MC_ASSIGN_MODULE_ID);
    out_message.set_data(1, ((remote_uid >> 24) & 0xff) as u8);
    out_message.set_data(2, ((remote_uid >> 16) & 0xff) as u8);
    out_message.set_data(3, ((remote_uid >> 8) & 0xff) as u8);
    out_message.set_data(4, (remote_uid & 0xff) as u8);
    out_message.set_data(5, offset);
    return out_message;
}

pub fn ping(offset: u8, enable_visual: bool) -> CanMessage {
    let mut out_message = make_mission_control_message(a3::A3_MC_PING, offset);
    if enable_visual {
        out_message.set_data(2, 1);
        out_message.set_data_length(3);
    }
    return out_message;
}

/// Stream request: REQUEST_NAME, REQUEST_CONFIG or MODIFY_CONFIG.
pub fn request_stream(opcode: u8, offset: u8, wire_index: u8) -> CanMessage {
    let mut out_message = make_mission_control_message(opcode, offset);
    out_message.set_data(2, wire_index);
    out_message.set_data_length(3);
    return out_message;
}

fn make_mission_control_message(opcode: u8, offset: u8) -> CanMessage {
    return CanMessage::standard(a3::A3_ID_MISSION_CONTROL, &[opcode, offset]);
}

fn make_message_by_uid(uid: u32, opcode: u8) -> CanMessage {
    return CanMessage::extended(uid, &[opcode]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_module_id() {
        let message = assign_module_id(0x1acebeef, 5);
        assert_eq!(message.id(), 0x700);
        assert!(!message.is_extended());
        assert_eq!(message.payload(), &[0x02, 0x1a, 0xce, 0xbe, 0xef, 0x05]);
    }

    #[test]
    fn test_notify_id() {
        let message = notify_id(0x0bad_cafe, 3);
        assert!(message.is_extended());
        assert_eq!(message.id(), 0x0bad_cafe);
        assert_eq!(message.payload(), &[0x02, 0x03]);
    }

    #[test]
    fn test_ping() {
        assert_eq!(ping(5, false).payload(), &[0x03, 0x05]);
        assert_eq!(ping(5, true).payload(), &[0x03, 0x05, 0x01]);
    }

    #[test]
    fn test_stream_messages() {
        let message = request_stream(a3::A3_MC_REQUEST_CONFIG, 5, 1);
        assert_eq!(message.payload(), &[0x05, 0x05, 0x01]);
        let message = stream_status(0x681, StreamStatus::Busy);
        assert_eq!(message.id(), 0x681);
        assert_eq!(message.payload(), &[0x01]);
    }
}
