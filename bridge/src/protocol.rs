//! MQTT 3.1.1 wire helpers.
//!
//! Async packet read/write over any transport, plus constructors for the
//! packets the bridge emits towards clients.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::{PublishMessage, QoS};

pub use rumqttc::mqttbytes::v4::*;

/// Largest packet the bridge writes (matches the default max message size).
pub const MAX_PACKET_SIZE: usize = 128 * 1024;

/// Read a single packet from an async reader.
///
/// `buf` carries bytes over between calls; it may hold the start of the
/// next packet when this returns.
pub async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_size: usize,
) -> Result<Packet> {
    loop {
        if !buf.is_empty() {
            match Packet::read(buf, max_size) {
                Ok(packet) => return Ok(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(Error::Protocol(e.to_string())),
            }
        }

        let mut tmp = [0u8; 4096];
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Write a single packet to an async writer.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: Packet,
    max_size: usize,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.size());
    packet
        .write(&mut buf, max_size)
        .map_err(|e| Error::Protocol(e.to_string()))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Short packet name for logs.
pub fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck::new(code, session_present))
}

/// Create a PUBLISH towards a client.
pub fn create_publish(msg: &PublishMessage) -> Packet {
    let mut publish = Publish::new(
        msg.topic.as_str(),
        msg.qos.into(),
        msg.payload.to_vec(),
    );
    publish.pkid = if msg.qos == QoS::AtMostOnce { 0 } else { msg.message_id };
    publish.dup = msg.dup;
    publish.retain = msg.retain;
    Packet::Publish(publish)
}

/// Convert a client PUBLISH.
pub fn publish_message(publish: &Publish) -> PublishMessage {
    PublishMessage {
        message_id: publish.pkid,
        topic: String::from_utf8_lossy(publish.topic.as_ref()).into_owned(),
        qos: publish.qos.into(),
        dup: publish.dup,
        retain: publish.retain,
        payload: publish.payload.clone(),
    }
}

pub fn create_puback(pkid: u16) -> Packet {
    Packet::PubAck(PubAck::new(pkid))
}

pub fn create_pubrec(pkid: u16) -> Packet {
    Packet::PubRec(PubRec::new(pkid))
}

pub fn create_pubrel(pkid: u16) -> Packet {
    Packet::PubRel(PubRel::new(pkid))
}

pub fn create_pubcomp(pkid: u16) -> Packet {
    Packet::PubComp(PubComp::new(pkid))
}

/// Create a SUBACK. `None` entries are reported as failures.
pub fn create_suback(pkid: u16, granted: &[Option<QoS>]) -> Packet {
    let codes = granted
        .iter()
        .map(|qos| match qos {
            Some(qos) => SubscribeReasonCode::Success((*qos).into()),
            None => SubscribeReasonCode::Failure,
        })
        .collect();
    Packet::SubAck(SubAck::new(pkid, codes))
}

pub fn create_unsuback(pkid: u16) -> Packet {
    Packet::UnsubAck(UnsubAck::new(pkid))
}
