//! MQTT 3.1.1 packet decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, Publish, QoS, SubAck, Subscribe,
    Unsubscribe, Will,
};

pub struct Decoder {
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the buffer.
    /// Returns `None` until a complete packet is buffered.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(payload)?,
            2 => decode_connack(flags, payload)?,
            3 => decode_publish(flags, payload)?,
            4 => Packet::PubAck(decode_ack(flags, 0, payload)?),
            5 => Packet::PubRec(decode_ack(flags, 0, payload)?),
            6 => Packet::PubRel(decode_ack(flags, 0x02, payload)?),
            7 => Packet::PubComp(decode_ack(flags, 0, payload)?),
            8 => decode_subscribe(flags, payload)?,
            9 => decode_suback(flags, payload)?,
            10 => decode_unsubscribe(flags, payload)?,
            11 => Packet::UnsubAck(decode_ack(flags, 0, payload)?),
            12 => {
                expect_flags(flags, 0)?;
                Packet::PingReq
            }
            13 => {
                expect_flags(flags, 0)?;
                Packet::PingResp
            }
            14 => {
                expect_flags(flags, 0)?;
                Packet::Disconnect
            }
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

fn decode_connect(payload: &[u8]) -> Result<Packet, DecodeError> {
    let mut pos = 0;

    let (protocol_name, len) = read_string(payload)?;
    pos += len;
    if protocol_name != "MQTT" && protocol_name != "MQIsdp" {
        return Err(DecodeError::InvalidProtocolName);
    }

    if pos + 4 > payload.len() {
        return Err(DecodeError::InsufficientData);
    }
    let level = payload[pos];
    if level != 3 && level != 4 {
        return Err(DecodeError::InvalidProtocolVersion(level));
    }
    let connect_flags = payload[pos + 1];
    let keep_alive = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]);
    pos += 4;

    // Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::InvalidFlags);
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let will_flag = (connect_flags & 0x04) != 0;
    let will_qos = (connect_flags >> 3) & 0x03;
    let will_retain = (connect_flags & 0x20) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;
    if !will_flag && (will_qos != QoS::AtMostOnce || will_retain) {
        return Err(DecodeError::InvalidFlags);
    }

    let (client_id, len) = read_string(&payload[pos..])?;
    pos += len;

    let will = if will_flag {
        let (topic, len) = read_binary(&payload[pos..])?;
        pos += len;
        let (data, len) = read_binary(&payload[pos..])?;
        pos += len;
        Some(Will {
            topic: Bytes::copy_from_slice(topic),
            payload: Bytes::copy_from_slice(data),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if username_flag {
        let (s, len) = read_string(&payload[pos..])?;
        pos += len;
        Some(s.to_string())
    } else {
        None
    };

    // Emitter clients send the password without a username.
    let password = if password_flag {
        let (data, _) = read_binary(&payload[pos..])?;
        Some(Bytes::copy_from_slice(data))
    } else {
        None
    };

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
        will,
    })))
}

fn decode_connack(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0)?;
    if payload.len() < 2 {
        return Err(DecodeError::InsufficientData);
    }
    if (payload[0] & 0xFE) != 0 {
        return Err(DecodeError::InvalidFlags);
    }
    let code = ConnectReturnCode::from_u8(payload[1])
        .ok_or(DecodeError::MalformedPacket("unknown connack return code"))?;
    Ok(Packet::ConnAck(ConnAck {
        session_present: (payload[0] & 0x01) != 0,
        code,
    }))
}

fn decode_publish(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;
    let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

    let (topic, mut pos) = read_binary(payload)?;

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&payload[pos..])?;
        if id == 0 {
            return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: Bytes::copy_from_slice(topic),
        packet_id,
        payload: Bytes::copy_from_slice(&payload[pos..]),
    }))
}

fn decode_ack(flags: u8, expected: u8, payload: &[u8]) -> Result<u16, DecodeError> {
    expect_flags(flags, expected)?;
    read_u16(payload)
}

fn decode_subscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0x02)?;
    let packet_id = read_u16(payload)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < payload.len() {
        let (filter, len) = read_binary(&payload[pos..])?;
        pos += len;
        let qos_byte = *payload.get(pos).ok_or(DecodeError::InsufficientData)?;
        pos += 1;
        let qos = QoS::from_u8(qos_byte).ok_or(DecodeError::InvalidQoS(qos_byte))?;
        filters.push((Bytes::copy_from_slice(filter), qos));
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("subscribe without filters"));
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0)?;
    let packet_id = read_u16(payload)?;
    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes: payload[2..].to_vec(),
    }))
}

fn decode_unsubscribe(flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
    expect_flags(flags, 0x02)?;
    let packet_id = read_u16(payload)?;
    let mut pos = 2;
    let mut filters = Vec::new();

    while pos < payload.len() {
        let (filter, len) = read_binary(&payload[pos..])?;
        pos += len;
        filters.push(Bytes::copy_from_slice(filter));
    }

    if filters.is_empty() {
        return Err(DecodeError::MalformedPacket("unsubscribe without filters"));
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}
