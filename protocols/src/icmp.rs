use anyhow::Context;
use pnet::packet::Packet;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{self, IcmpCode, IcmpPacket, IcmpTypes};

pub const ICMP_ECHO_HDR_LEN: usize = 8;

/// Builds an IPv4 echo request with a valid checksum.
pub fn create_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut buffer: Vec<u8> = vec![0u8; ICMP_ECHO_HDR_LEN + payload.len()];

    let mut echo =
        MutableEchoRequestPacket::new(&mut buffer).context("creating echo request")?;
    echo.set_icmp_type(IcmpTypes::EchoRequest);
    echo.set_icmp_code(IcmpCode(0));
    echo.set_identifier(identifier);
    echo.set_sequence_number(sequence);
    echo.set_payload(payload);
    echo.set_checksum(0);

    let checksum: u16 = {
        let view = IcmpPacket::new(echo.packet()).context("viewing echo request")?;
        icmp::checksum(&view)
    };
    echo.set_checksum(checksum);

    Ok(buffer)
}

/// `(identifier, sequence)` of an echo reply, `None` for anything else.
pub fn parse_echo_reply(packet: &IcmpPacket) -> Option<(u16, u16)> {
    if packet.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let reply = EchoReplyPacket::new(packet.packet())?;
    Some((reply.get_identifier(), reply.get_sequence_number()))
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
