//! DNS wire codec.
//!
//! Parses and serializes RFC 1035 messages for the record types the tunnel
//! uses as carriers (A, AAAA, CNAME, MX, NS, TXT). The encoder never emits
//! compression pointers; the decoder follows them, with loop detection, so
//! answers from real recursive resolvers parse correctly. Unknown record
//! types are not an error: they decode with opaque rdata and re-encode
//! byte-for-byte.

use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum wire length of an encoded name, terminator included
pub const MAX_NAME_LEN: usize = 255;

/// The only class the tunnel speaks
pub const CLASS_IN: u16 = 1;

/// QR bit of the header flags word
pub const FLAG_RESPONSE: u16 = 0x8000;
/// RD bit
pub const FLAG_RECURSION_DESIRED: u16 = 0x0100;
/// RA bit
pub const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;
/// RCODE mask
pub const RCODE_MASK: u16 = 0x000F;

/// Codec error kinds.
///
/// `Truncated` and `BadName` are decode failures; `Oversize` is returned by
/// the encoder when a payload cannot fit the 255-byte query name budget and
/// the caller has to fragment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("message truncated")]
    Truncated,

    #[error("malformed name: {0}")]
    BadName(&'static str),

    #[error("payload too large for the encoded query name")]
    Oversize,

    #[error("carrier data malformed: {0}")]
    BadCarrier(&'static str),
}

/// Record types the tunnel understands. Anything else decodes as
/// `Unknown` with opaque rdata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Mx,
    Txt,
    Aaaa,
    Any,
    Unknown(u16),
}

impl RecordType {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Mx => 15,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Any => 255,
            RecordType::Unknown(v) => v,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            15 => RecordType::Mx,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            255 => RecordType::Any,
            other => RecordType::Unknown(other),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::Ns => write!(f, "NS"),
            RecordType::Cname => write!(f, "CNAME"),
            RecordType::Mx => write!(f, "MX"),
            RecordType::Txt => write!(f, "TXT"),
            RecordType::Aaaa => write!(f, "AAAA"),
            RecordType::Any => write!(f, "ANY"),
            RecordType::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::Ns),
            "CNAME" => Ok(RecordType::Cname),
            "MX" => Ok(RecordType::Mx),
            "TXT" => Ok(RecordType::Txt),
            "AAAA" => Ok(RecordType::Aaaa),
            "ANY" => Ok(RecordType::Any),
            other => Err(format!("unknown record type: {}", other)),
        }
    }
}

/// A domain name as a sequence of labels.
///
/// Labels are stored without length prefixes or the trailing empty label;
/// the empty name (DNS root) is a valid value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name {
    labels: Vec<String>,
}

impl Name {
    pub fn root() -> Self {
        Name { labels: Vec::new() }
    }

    /// Build a name from pre-validated labels.
    pub fn from_labels(labels: Vec<String>) -> Result<Self, DnsError> {
        let name = Name { labels };
        name.check()?;
        Ok(name)
    }

    /// Parse a dotted name like `tunnel.example.com`.
    pub fn parse(s: &str) -> Result<Self, DnsError> {
        let s = s.trim_end_matches('.');
        if s.is_empty() {
            return Ok(Name::root());
        }
        let labels: Vec<String> = s.split('.').map(str::to_string).collect();
        Name::from_labels(labels)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Wire length of the encoded name, terminator included.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| 1 + l.len()).sum::<usize>() + 1
    }

    /// True when `self` ends with every label of `suffix`.
    pub fn ends_with(&self, suffix: &Name) -> bool {
        if suffix.labels.len() > self.labels.len() {
            return false;
        }
        let skip = self.labels.len() - suffix.labels.len();
        self.labels[skip..]
            .iter()
            .zip(&suffix.labels)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// The labels of `self` with `suffix` stripped, or `None` when `self`
    /// does not end in `suffix`.
    pub fn strip_suffix(&self, suffix: &Name) -> Option<&[String]> {
        if !self.ends_with(suffix) {
            return None;
        }
        Some(&self.labels[..self.labels.len() - suffix.labels.len()])
    }

    fn check(&self) -> Result<(), DnsError> {
        for label in &self.labels {
            if label.is_empty() {
                return Err(DnsError::BadName("empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(DnsError::BadName("label longer than 63 bytes"));
            }
        }
        if self.wire_len() > MAX_NAME_LEN {
            return Err(DnsError::BadName("name longer than 255 bytes"));
        }
        Ok(())
    }

    /// Append the uncompressed wire form to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for label in &self.labels {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
    }

    /// Decode a name starting at `*pos`, following compression pointers.
    ///
    /// `*pos` is left just past the name in the outer record, regardless of
    /// where pointers led. A revisited pointer target or a jump past the end
    /// of the buffer fails with `BadName`.
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, DnsError> {
        let mut labels = Vec::new();
        let mut cursor = *pos;
        let mut jumped = false;
        let mut visited: HashSet<usize> = HashSet::new();
        let mut wire_len = 1usize; // terminator

        loop {
            let len = *buf.get(cursor).ok_or(DnsError::Truncated)? as usize;

            if len & 0xC0 == 0xC0 {
                let low = *buf.get(cursor + 1).ok_or(DnsError::Truncated)? as usize;
                let target = ((len & 0x3F) << 8) | low;
                if !jumped {
                    *pos = cursor + 2;
                    jumped = true;
                }
                if target >= buf.len() {
                    return Err(DnsError::BadName("pointer past end of message"));
                }
                if !visited.insert(target) {
                    return Err(DnsError::BadName("pointer loop"));
                }
                cursor = target;
                continue;
            }

            if len & 0xC0 != 0 {
                return Err(DnsError::BadName("reserved label type"));
            }

            if len == 0 {
                if !jumped {
                    *pos = cursor + 1;
                }
                break;
            }

            wire_len += 1 + len;
            if wire_len > MAX_NAME_LEN {
                return Err(DnsError::BadName("name longer than 255 bytes"));
            }

            let bytes = buf
                .get(cursor + 1..cursor + 1 + len)
                .ok_or(DnsError::Truncated)?;
            labels.push(String::from_utf8_lossy(bytes).into_owned());
            cursor += 1 + len;
        }

        Ok(Name { labels })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.labels.is_empty() {
            return write!(f, ".");
        }
        write!(f, "{}", self.labels.join("."))
    }
}

/// One entry of the question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: Name,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: Name, qtype: RecordType) -> Self {
        Question {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        buf.extend_from_slice(&self.qtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.qclass.to_be_bytes());
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, DnsError> {
        let name = Name::decode(buf, pos)?;
        let qtype = RecordType::from_u16(read_u16(buf, pos)?);
        let qclass = read_u16(buf, pos)?;
        Ok(Question {
            name,
            qtype,
            qclass,
        })
    }
}

/// Typed rdata for the carrier record types; everything else is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(Name),
    Ns(Name),
    Mx { preference: u16, exchange: Name },
    Txt(Vec<Vec<u8>>),
    Unknown(Vec<u8>),
}

impl RData {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            RData::A(addr) => buf.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
            RData::Cname(name) | RData::Ns(name) => name.encode(buf),
            RData::Mx {
                preference,
                exchange,
            } => {
                buf.extend_from_slice(&preference.to_be_bytes());
                exchange.encode(buf);
            }
            RData::Txt(strings) => {
                for s in strings {
                    buf.push(s.len() as u8);
                    buf.extend_from_slice(s);
                }
            }
            RData::Unknown(raw) => buf.extend_from_slice(raw),
        }
    }

    /// Decode rdata of `rtype` from the slice `[*pos, *pos + rdlength)`.
    ///
    /// Takes the whole message so names inside rdata can follow compression
    /// pointers backwards.
    fn decode(
        buf: &[u8],
        pos: &mut usize,
        rtype: RecordType,
        rdlength: usize,
    ) -> Result<Self, DnsError> {
        let end = pos
            .checked_add(rdlength)
            .filter(|e| *e <= buf.len())
            .ok_or(DnsError::Truncated)?;

        let rdata = match rtype {
            RecordType::A => {
                if rdlength != 4 {
                    return Err(DnsError::Truncated);
                }
                let octets: [u8; 4] = [buf[*pos], buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]];
                *pos = end;
                RData::A(Ipv4Addr::from(octets))
            }
            RecordType::Aaaa => {
                if rdlength != 16 {
                    return Err(DnsError::Truncated);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[*pos..end]);
                *pos = end;
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::Cname => {
                let name = Name::decode(buf, pos)?;
                RData::Cname(name)
            }
            RecordType::Ns => {
                let name = Name::decode(buf, pos)?;
                RData::Ns(name)
            }
            RecordType::Mx => {
                let preference = read_u16(buf, pos)?;
                let exchange = Name::decode(buf, pos)?;
                RData::Mx {
                    preference,
                    exchange,
                }
            }
            RecordType::Txt => {
                let mut strings = Vec::new();
                while *pos < end {
                    let len = buf[*pos] as usize;
                    *pos += 1;
                    let chunk = buf.get(*pos..*pos + len).ok_or(DnsError::Truncated)?;
                    if *pos + len > end {
                        return Err(DnsError::Truncated);
                    }
                    strings.push(chunk.to_vec());
                    *pos += len;
                }
                RData::Txt(strings)
            }
            _ => {
                let raw = buf[*pos..end].to_vec();
                *pos = end;
                RData::Unknown(raw)
            }
        };

        if *pos != end {
            // Name decoding inside rdata must consume exactly rdlength.
            return Err(DnsError::Truncated);
        }
        Ok(rdata)
    }
}

/// A resource record from the answer, authority, or additional section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl ResourceRecord {
    pub fn new(name: Name, rtype: RecordType, ttl: u32, rdata: RData) -> Self {
        ResourceRecord {
            name,
            rtype,
            class: CLASS_IN,
            ttl,
            rdata,
        }
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        self.name.encode(buf);
        buf.extend_from_slice(&self.rtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.class.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());

        let mut rdata = Vec::new();
        self.rdata.encode(&mut rdata);
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rdata);
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, DnsError> {
        let name = Name::decode(buf, pos)?;
        let rtype = RecordType::from_u16(read_u16(buf, pos)?);
        let class = read_u16(buf, pos)?;
        let ttl = read_u32(buf, pos)?;
        let rdlength = read_u16(buf, pos)? as usize;
        let rdata = RData::decode(buf, pos, rtype, rdlength)?;
        Ok(ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        })
    }
}

/// A complete DNS message: header plus four sections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    /// A recursion-desired query for one question.
    pub fn query(id: u16, name: Name, qtype: RecordType) -> Self {
        Message {
            id,
            flags: FLAG_RECURSION_DESIRED,
            questions: vec![Question::new(name, qtype)],
            ..Default::default()
        }
    }

    /// A response echoing `question` and carrying `answers`.
    pub fn response(id: u16, question: Question, answers: Vec<ResourceRecord>) -> Self {
        Message {
            id,
            flags: FLAG_RESPONSE | FLAG_RECURSION_DESIRED | FLAG_RECURSION_AVAILABLE,
            questions: vec![question],
            answers,
            ..Default::default()
        }
    }

    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for q in &self.questions {
            q.encode(&mut buf);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            rr.encode(&mut buf);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DnsError> {
        let mut pos = 0usize;
        let id = read_u16(buf, &mut pos)?;
        let flags = read_u16(buf, &mut pos)?;
        let qdcount = read_u16(buf, &mut pos)? as usize;
        let ancount = read_u16(buf, &mut pos)? as usize;
        let nscount = read_u16(buf, &mut pos)? as usize;
        let arcount = read_u16(buf, &mut pos)? as usize;

        let mut questions = Vec::with_capacity(qdcount);
        for _ in 0..qdcount {
            questions.push(Question::decode(buf, &mut pos)?);
        }

        let decode_rrs = |count: usize, pos: &mut usize| -> Result<Vec<ResourceRecord>, DnsError> {
            let mut records = Vec::with_capacity(count);
            for _ in 0..count {
                records.push(ResourceRecord::decode(buf, pos)?);
            }
            Ok(records)
        };

        let answers = decode_rrs(ancount, &mut pos)?;
        let authorities = decode_rrs(nscount, &mut pos)?;
        let additionals = decode_rrs(arcount, &mut pos)?;

        Ok(Message {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, DnsError> {
    let bytes = buf.get(*pos..*pos + 2).ok_or(DnsError::Truncated)?;
    *pos += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, DnsError> {
    let bytes = buf.get(*pos..*pos + 4).ok_or(DnsError::Truncated)?;
    *pos += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        Name::parse(s).unwrap()
    }

    #[test]
    fn test_name_roundtrip() {
        let n = name("abc123.tunnel.example.com");
        let mut buf = Vec::new();
        n.encode(&mut buf);

        let mut pos = 0;
        let decoded = Name::decode(&buf, &mut pos).unwrap();
        assert_eq!(decoded, n);
        assert_eq!(pos, buf.len());
        assert_eq!(n.wire_len(), buf.len());
    }

    #[test]
    fn test_name_label_bounds() {
        let long = "a".repeat(64);
        assert_eq!(
            Name::parse(&long),
            Err(DnsError::BadName("label longer than 63 bytes"))
        );

        let label = "a".repeat(63);
        let too_long = [label.as_str(); 4].join(".");
        assert!(Name::parse(&too_long).is_err());
    }

    #[test]
    fn test_name_compression_pointer() {
        // "example.com" at offset 0, "www" + pointer at offset 13
        let mut buf = Vec::new();
        name("example.com").encode(&mut buf);
        let ptr_at = buf.len();
        buf.push(3);
        buf.extend_from_slice(b"www");
        buf.extend_from_slice(&[0xC0, 0x00]);

        let mut pos = ptr_at;
        let decoded = Name::decode(&buf, &mut pos).unwrap();
        assert_eq!(decoded, name("www.example.com"));
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_name_pointer_loop_rejected() {
        // Pointer at offset 0 pointing to itself
        let buf = [0xC0u8, 0x00];
        let mut pos = 0;
        assert_eq!(
            Name::decode(&buf, &mut pos),
            Err(DnsError::BadName("pointer loop"))
        );
    }

    #[test]
    fn test_name_pointer_past_end_rejected() {
        let buf = [0xC0u8, 0x50];
        let mut pos = 0;
        assert!(matches!(
            Name::decode(&buf, &mut pos),
            Err(DnsError::BadName(_))
        ));
    }

    #[test]
    fn test_name_suffix_stripping() {
        let full = name("61626364.s0.tunnel.example.com");
        let domain = name("tunnel.example.com");
        assert!(full.ends_with(&domain));
        let rest = full.strip_suffix(&domain).unwrap();
        assert_eq!(rest, &["61626364".to_string(), "s0".to_string()]);
        assert!(!domain.ends_with(&full));
    }

    #[test]
    fn test_query_roundtrip() {
        let msg = Message::query(0x1234, name("data.t.example.com"), RecordType::Txt);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(!decoded.is_response());
    }

    #[test]
    fn test_response_roundtrip_all_rdata() {
        let q = Question::new(name("q.example.com"), RecordType::Any);
        let answers = vec![
            ResourceRecord::new(
                name("q.example.com"),
                RecordType::A,
                60,
                RData::A(Ipv4Addr::new(10, 0, 0, 1)),
            ),
            ResourceRecord::new(
                name("q.example.com"),
                RecordType::Aaaa,
                60,
                RData::Aaaa(Ipv6Addr::LOCALHOST),
            ),
            ResourceRecord::new(
                name("q.example.com"),
                RecordType::Cname,
                60,
                RData::Cname(name("alias.example.com")),
            ),
            ResourceRecord::new(
                name("q.example.com"),
                RecordType::Mx,
                60,
                RData::Mx {
                    preference: 10,
                    exchange: name("mail.example.com"),
                },
            ),
            ResourceRecord::new(
                name("q.example.com"),
                RecordType::Txt,
                60,
                RData::Txt(vec![b"hello".to_vec(), b"world".to_vec()]),
            ),
        ];
        let msg = Message::response(0xBEEF, q, answers);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.is_response());
        assert_eq!(decoded.rcode(), 0);
    }

    #[test]
    fn test_unknown_type_passes_through() {
        let rr = ResourceRecord::new(
            name("x.example.com"),
            RecordType::Unknown(99),
            30,
            RData::Unknown(vec![1, 2, 3, 4, 5]),
        );
        let msg = Message::response(1, Question::new(name("x.example.com"), RecordType::Any), vec![rr]);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_truncated_message() {
        let msg = Message::query(7, name("abc.example.com"), RecordType::A);
        let bytes = msg.encode();
        for cut in [0, 5, 11, bytes.len() - 1] {
            assert_eq!(Message::decode(&bytes[..cut]), Err(DnsError::Truncated));
        }
    }
}
