//! DNS message parsing and construction.
//!
//! Only what the sinkhole needs: decoding a single-question query,
//! synthesizing block and SERVFAIL responses, and transaction id handling
//! for relayed upstream replies.

use thiserror::Error;

use crate::config::BlockMode;

pub const HEADER_LEN: usize = 12;

/// Maximum wire length of a domain name.
const MAX_NAME_WIRE_LEN: usize = 255;

const FLAG_QR: u16 = 0x8000;
const OPCODE_MASK: u16 = 0x7800;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// Response codes used by the sinkhole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Rcode {
    NoError = 0,
    ServFail = 2,
    NxDomain = 3,
}

/// Why an inbound packet was not accepted as a query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet shorter than a DNS header")]
    TooShort,
    #[error("packet is a response, not a query")]
    NotAQuery,
    #[error("expected exactly one question, found {0}")]
    QuestionCount(u16),
    #[error("unsupported or malformed label")]
    BadLabel,
    #[error("question section truncated")]
    Truncated,
}

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Lowercased name without the root dot; empty for the root itself.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Question section exactly as received, echoed in synthesized replies.
    question: Vec<u8>,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::TooShort);
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        if flags & FLAG_QR != 0 {
            return Err(DecodeError::NotAQuery);
        }

        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if qdcount != 1 {
            return Err(DecodeError::QuestionCount(qdcount));
        }

        // Parse domain name
        let mut pos = HEADER_LEN;
        let mut domain_parts = Vec::new();

        loop {
            let Some(&label_len) = data.get(pos) else {
                return Err(DecodeError::Truncated);
            };
            let label_len = label_len as usize;
            pos += 1;
            if label_len == 0 {
                break;
            }
            // Compression pointers never appear in a lone question.
            if label_len & 0xC0 != 0 {
                return Err(DecodeError::BadLabel);
            }
            if pos + label_len > data.len() {
                return Err(DecodeError::Truncated);
            }
            let label =
                std::str::from_utf8(&data[pos..pos + label_len]).map_err(|_| DecodeError::BadLabel)?;
            domain_parts.push(label);
            pos += label_len;
            if pos - HEADER_LEN > MAX_NAME_WIRE_LEN {
                return Err(DecodeError::BadLabel);
            }
        }

        // Parse QTYPE and QCLASS
        if pos + 4 > data.len() {
            return Err(DecodeError::Truncated);
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
        pos += 4;

        Ok(Self {
            id,
            flags,
            domain: domain_parts.join(".").to_ascii_lowercase(),
            qtype,
            qclass,
            question: data[HEADER_LEN..pos].to_vec(),
        })
    }

    /// Name suitable for logs; the root is shown as ".".
    pub fn display_name(&self) -> &str {
        if self.domain.is_empty() { "." } else { self.domain.as_str() }
    }

    /// Create the synthesized response for a blocked name.
    pub fn blocked_response(&self, mode: BlockMode, ttl: u32) -> DnsResponse {
        DnsResponse::blocked(self, mode, ttl)
    }

    /// Create a SERVFAIL response, used when the upstream cannot answer.
    pub fn servfail_response(&self) -> DnsResponse {
        DnsResponse::for_query(self, Rcode::ServFail)
    }
}

/// A synthesized DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    question: Vec<u8>,
    pub answers: Vec<DnsRecord>,
}

/// A resource record owned by the question name.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsResponse {
    /// Empty response echoing the query's id, opcode, RD bit and question.
    fn for_query(query: &DnsQuery, rcode: Rcode) -> Self {
        let flags = FLAG_QR | (query.flags & (OPCODE_MASK | FLAG_RD)) | FLAG_RA | rcode as u16;
        Self {
            id: query.id,
            flags,
            question: query.question.clone(),
            answers: Vec::new(),
        }
    }

    /// Create a blocked response for a query.
    ///
    /// `Nxdomain` answers "name does not exist". `ZeroIp` answers A with
    /// 0.0.0.0 and AAAA with `::`; other types get an empty NOERROR.
    pub fn blocked(query: &DnsQuery, mode: BlockMode, ttl: u32) -> Self {
        match mode {
            BlockMode::Nxdomain => Self::for_query(query, Rcode::NxDomain),
            BlockMode::ZeroIp => {
                let mut response = Self::for_query(query, Rcode::NoError);
                let rdata = match (query.qclass, query.qtype) {
                    (CLASS_IN, TYPE_A) => Some(vec![0u8; 4]),
                    (CLASS_IN, TYPE_AAAA) => Some(vec![0u8; 16]),
                    _ => None,
                };
                if let Some(rdata) = rdata {
                    response.answers.push(DnsRecord {
                        rtype: query.qtype,
                        class: CLASS_IN,
                        ttl,
                        rdata,
                    });
                }
                response
            }
        }
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000F
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.question.len() + 28 * self.answers.len());

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        data.extend_from_slice(&self.question);

        // Answers
        for a in &self.answers {
            data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to the question name
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

/// Read the transaction id of a message.
pub fn message_id(packet: &[u8]) -> Option<u16> {
    (packet.len() >= 2).then(|| u16::from_be_bytes([packet[0], packet[1]]))
}

/// Overwrite the transaction id of a message in place.
pub fn set_message_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// True if the packet has a full header with the QR bit set.
pub fn is_response(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN && packet[2] & 0x80 != 0
}

/// Build a wire-format query. Used by tests and benchmarks.
pub fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + domain.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    packet.extend_from_slice(&[0x00, 0x01]); // Questions: 1
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in domain.split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_question() {
        let packet = build_query(0x1234, "Ads.Example.com", TYPE_AAAA);

        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.domain, "ads.example.com");
        assert_eq!(query.qtype, TYPE_AAAA);
        assert_eq!(query.qclass, CLASS_IN);
    }

    #[test]
    fn parse_root_query() {
        let packet = build_query(1, "", 2);

        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.domain, "");
        assert_eq!(query.display_name(), ".");
    }

    #[test]
    fn parse_rejects_short_packets() {
        assert_eq!(DnsQuery::parse(&[0u8; 5]).unwrap_err(), DecodeError::TooShort);
    }

    #[test]
    fn parse_rejects_responses() {
        let mut packet = build_query(1, "example.com", TYPE_A);
        packet[2] |= 0x80;

        assert_eq!(DnsQuery::parse(&packet).unwrap_err(), DecodeError::NotAQuery);
    }

    #[test]
    fn parse_rejects_wrong_question_count() {
        let mut packet = build_query(1, "example.com", TYPE_A);
        packet[5] = 2;

        assert_eq!(
            DnsQuery::parse(&packet).unwrap_err(),
            DecodeError::QuestionCount(2)
        );
    }

    #[test]
    fn parse_rejects_truncated_question() {
        let packet = build_query(1, "example.com", TYPE_A);

        assert_eq!(
            DnsQuery::parse(&packet[..packet.len() - 2]).unwrap_err(),
            DecodeError::Truncated
        );
        assert_eq!(
            DnsQuery::parse(&packet[..16]).unwrap_err(),
            DecodeError::Truncated
        );
    }

    #[test]
    fn parse_rejects_compression_pointer() {
        let mut packet = build_query(1, "example.com", TYPE_A);
        packet[12] = 0xC0;

        assert_eq!(DnsQuery::parse(&packet).unwrap_err(), DecodeError::BadLabel);
    }

    #[test]
    fn nxdomain_block_echoes_question() {
        let packet = build_query(0xBEEF, "Tracker.NET", TYPE_A);
        let query = DnsQuery::parse(&packet).unwrap();

        let bytes = query.blocked_response(BlockMode::Nxdomain, 300).to_bytes();

        assert_eq!(message_id(&bytes), Some(0xBEEF));
        assert!(is_response(&bytes));
        assert_eq!(bytes[3] & 0x0F, Rcode::NxDomain as u8);
        assert_eq!(&bytes[4..6], &[0, 1]);
        assert_eq!(&bytes[6..8], &[0, 0]);
        // Question bytes are echoed verbatim, original case included.
        assert_eq!(&bytes[HEADER_LEN..], &packet[HEADER_LEN..]);
    }

    #[test]
    fn zero_ip_block_answers_a_and_aaaa() {
        let a = DnsQuery::parse(&build_query(1, "ads.com", TYPE_A)).unwrap();
        let aaaa = DnsQuery::parse(&build_query(2, "ads.com", TYPE_AAAA)).unwrap();
        let txt = DnsQuery::parse(&build_query(3, "ads.com", 16)).unwrap();

        let a = a.blocked_response(BlockMode::ZeroIp, 60);
        let aaaa = aaaa.blocked_response(BlockMode::ZeroIp, 60);
        let txt = txt.blocked_response(BlockMode::ZeroIp, 60);

        assert_eq!(a.answers[0].rdata, vec![0; 4]);
        assert_eq!(aaaa.answers[0].rdata, vec![0; 16]);
        assert!(txt.answers.is_empty());
        assert_eq!(txt.rcode(), Rcode::NoError as u16);

        let bytes = a.to_bytes();
        assert_eq!(&bytes[6..8], &[0, 1]);
        assert_eq!(&bytes[bytes.len() - 16..bytes.len() - 14], &[0xC0, 0x0C]);
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn servfail_keeps_rd_and_sets_ra() {
        let query = DnsQuery::parse(&build_query(7, "example.com", TYPE_A)).unwrap();

        let response = query.servfail_response();

        assert_eq!(response.rcode(), Rcode::ServFail as u16);
        assert_ne!(response.flags & FLAG_RD, 0);
        assert_ne!(response.flags & FLAG_RA, 0);
    }

    #[test]
    fn set_message_id_rewrites_header() {
        let mut packet = build_query(1, "example.com", TYPE_A);

        set_message_id(&mut packet, 0xABCD);

        assert_eq!(message_id(&packet), Some(0xABCD));
        assert_eq!(message_id(&[0]), None);
    }
}
