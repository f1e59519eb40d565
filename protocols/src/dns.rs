use std::net::Ipv4Addr;

use anyhow::Context;
use pnet::packet::dns::{
    DnsClass, DnsPacket, DnsQuery, DnsTypes, MutableDnsPacket, Opcode, Retcode,
};

pub const DNS_HDR_LEN: usize = 12;
pub const DNS_PORT: u16 = 53;

/// Answer to one A query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AAnswer {
    pub id: u16,
    pub addrs: Vec<Ipv4Addr>,
}

/// Builds a recursive A query for `name`.
pub fn create_a_packet(name: &str, id: u16) -> anyhow::Result<Vec<u8>> {
    let query: DnsQuery = create_a_query(name)?;
    let q_fixed_len: usize = 4;
    let qlen: usize = query.qname.len() + q_fixed_len;
    let total: usize = DNS_HDR_LEN + qlen;
    let mut buffer: Vec<u8> = vec![0u8; total];

    {
        let mut dns: MutableDnsPacket =
            MutableDnsPacket::new(&mut buffer).context("creating dns header")?;
        dns.set_id(id);
        dns.set_is_response(0);
        dns.set_opcode(Opcode::StandardQuery);
        dns.set_is_truncated(0);
        dns.set_is_recursion_desirable(1);
        dns.set_rcode(Retcode::NoError);
        dns.set_query_count(1);
    }

    let mut cursor: usize = DNS_HDR_LEN;

    buffer[cursor..cursor + query.qname.len()].copy_from_slice(&query.qname);
    cursor += query.qname.len();

    buffer[cursor..cursor + 2].copy_from_slice(&query.qtype.0.to_be_bytes());
    cursor += 2;

    buffer[cursor..cursor + 2].copy_from_slice(&query.qclass.0.to_be_bytes());

    Ok(buffer)
}

/// Extracts every A record from a response. A name error yields no addresses.
pub fn parse_a_response(payload: &[u8]) -> anyhow::Result<AAnswer> {
    let dns = DnsPacket::new(payload).context("Failed to parse DNS packet")?;
    anyhow::ensure!(dns.get_is_response() == 1, "packet is not a DNS response");

    let addrs: Vec<Ipv4Addr> = dns
        .get_responses()
        .iter()
        .filter(|response| response.rtype == DnsTypes::A && response.data.len() == 4)
        .map(|response| {
            Ipv4Addr::new(
                response.data[0],
                response.data[1],
                response.data[2],
                response.data[3],
            )
        })
        .collect();

    Ok(AAnswer {
        id: dns.get_id(),
        addrs,
    })
}

fn create_a_query(name: &str) -> anyhow::Result<DnsQuery> {
    let qname: Vec<u8> = encode_dns_name(name)?;
    Ok(DnsQuery {
        qname,
        qtype: DnsTypes::A,
        qclass: DnsClass(1),
        payload: Vec::new(),
    })
}

fn encode_dns_name(name: &str) -> anyhow::Result<Vec<u8>> {
    let mut encoded: Vec<u8> = Vec::new();
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        anyhow::ensure!(label.len() <= 63, "label '{label}' is longer than 63 bytes");
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }
    encoded.push(0);
    anyhow::ensure!(encoded.len() <= 255, "name '{name}' is too long");
    Ok(encoded)
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built response: header, the echoed question, one A answer using a
    /// compression pointer back to the question name.
    fn response_for(query: &[u8], addr: [u8; 4]) -> Vec<u8> {
        let mut pkt: Vec<u8> = query.to_vec();
        pkt[2] = 0x81; // QR=1, RD=1
        pkt[3] = 0x80; // RA=1, NOERROR
        pkt[7] = 1; // ANCOUNT
        pkt.extend_from_slice(&[0xc0, 0x0c]); // name pointer
        pkt.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A, IN
        pkt.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c]); // TTL
        pkt.extend_from_slice(&[0x00, 0x04]);
        pkt.extend_from_slice(&addr);
        pkt
    }

    #[test]
    fn query_layout() {
        let pkt = create_a_packet("www.example.com", 0xbeef).unwrap();
        let dns = DnsPacket::new(&pkt).unwrap();
        assert_eq!(dns.get_id(), 0xbeef);
        assert_eq!(dns.get_query_count(), 1);
        assert_eq!(dns.get_is_recursion_desirable(), 1);
        assert_eq!(&pkt[DNS_HDR_LEN..DNS_HDR_LEN + 4], &[3, b'w', b'w', b'w']);
        assert_eq!(&pkt[pkt.len() - 4..], &[0, 1, 0, 1]);
    }

    #[test]
    fn parses_a_answer() {
        let query = create_a_packet("mail.example.com", 7).unwrap();
        let answer = parse_a_response(&response_for(&query, [192, 0, 2, 10])).unwrap();
        assert_eq!(answer.id, 7);
        assert_eq!(answer.addrs, vec![Ipv4Addr::new(192, 0, 2, 10)]);
    }

    #[test]
    fn query_is_not_a_response() {
        let query = create_a_packet("a.example", 1).unwrap();
        assert!(parse_a_response(&query).is_err());
    }

    #[test]
    fn rejects_oversized_labels() {
        let long = "x".repeat(64);
        assert!(create_a_packet(&format!("{long}.example"), 1).is_err());
    }
}
