//! MQTT 3.1.1 packet encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    PROTOCOL_LEVEL,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => {
                encode_connack(p, buf);
                Ok(())
            }
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(id) => encode_ack(0x40, *id, buf),
            Packet::PubRec(id) => encode_ack(0x50, *id, buf),
            Packet::PubRel(id) => encode_ack(0x62, *id, buf),
            Packet::PubComp(id) => encode_ack(0x70, *id, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(id) => encode_ack(0xB0, *id, buf),
            Packet::PingReq => encode_empty(0xC0, buf),
            Packet::PingResp => encode_empty(0xD0, buf),
            Packet::Disconnect => encode_empty(0xE0, buf),
        }
    }
}

fn encode_empty(header: u8, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(header);
    buf.put_u8(0x00);
    Ok(())
}

fn encode_ack(header: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(header);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Protocol name, level, flags and keep alive
    let mut remaining_length = 6 + 1 + 1 + 2;
    remaining_length += 2 + packet.client_id.len();
    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len() + 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_variable_int(buf, remaining_length as u32)?;
    write_binary(buf, b"MQTT")?;
    buf.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);
    buf.put_u16(packet.keep_alive);

    write_binary(buf, packet.client_id.as_bytes())?;
    if let Some(ref will) = packet.will {
        write_binary(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_binary(buf, username.as_bytes())?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }
    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(packet.session_present as u8);
    buf.put_u8(packet.code as u8);
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
    if packet.qos != QoS::AtMostOnce {
        remaining_length += 2;
    }

    let mut header = 0x30 | ((packet.qos as u8) << 1);
    if packet.dup {
        header |= 0x08;
    }
    if packet.retain {
        header |= 0x01;
    }

    buf.reserve(5 + remaining_length);
    buf.put_u8(header);
    write_variable_int(buf, remaining_length as u32)?;
    write_binary(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        buf.put_u16(packet.packet_id.unwrap_or(1));
    }
    buf.put_slice(&packet.payload);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length: usize = 2 + packet
        .filters
        .iter()
        .map(|(f, _)| 2 + f.len() + 1)
        .sum::<usize>();

    buf.put_u8(0x82);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);
    for (filter, qos) in &packet.filters {
        write_binary(buf, filter)?;
        buf.put_u8(*qos as u8);
    }
    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x90);
    write_variable_int(buf, (2 + packet.return_codes.len()) as u32)?;
    buf.put_u16(packet.packet_id);
    buf.put_slice(&packet.return_codes);
    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length: usize = 2 + packet.filters.iter().map(|f| 2 + f.len()).sum::<usize>();

    buf.put_u8(0xA2);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);
    for filter in &packet.filters {
        write_binary(buf, filter)?;
    }
    Ok(())
}
