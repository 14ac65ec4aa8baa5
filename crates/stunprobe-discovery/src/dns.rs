//! Minimal DNS client for STUN server discovery.
//!
//! Sends a single recursive query over UDP and parses the reply, including
//! compressed names. Only what SRV/A discovery needs is interpreted; other
//! record data is kept raw.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use stunprobe_core::DEFAULT_PORT;
use thiserror::Error;
use tokio::net::UdpSocket;

/// Fixed DNS header size
pub const DNS_HEADER_SIZE: usize = 12;

/// Largest label allowed in a name
const MAX_LABEL_LEN: usize = 63;

/// Largest encoded name
const MAX_NAME_LEN: usize = 255;

/// Compression pointers followed before a name is declared malformed
const MAX_POINTER_HOPS: usize = 16;

/// Recursion desired
const FLAG_RD: u16 = 0x0100;

/// DNS errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// No reply within the request timeout
    #[error("DNS query timed out")]
    Timeout,

    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reply could not be parsed
    #[error("malformed DNS message: {0}")]
    Malformed(&'static str),

    /// Query name has a label over 63 bytes or is over 255 bytes in total
    #[error("name too long")]
    NameTooLong,
}

/// Record types used by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// IPv4 host address
    A,
    /// Name server
    Ns,
    /// Canonical name
    Cname,
    /// Service locator
    Srv,
    /// Anything else
    Other(u16),
}

impl RecordType {
    /// Wire value
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Ns => 2,
            Self::Cname => 5,
            Self::Srv => 33,
            Self::Other(code) => code,
        }
    }
}

impl From<u16> for RecordType {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::A,
            2 => Self::Ns,
            5 => Self::Cname,
            33 => Self::Srv,
            other => Self::Other(other),
        }
    }
}

/// Record classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    /// Internet
    In,
    /// Anything else
    Other(u16),
}

impl RecordClass {
    /// Wire value
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::In => 1,
            Self::Other(code) => code,
        }
    }
}

impl From<u16> for RecordClass {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::In,
            other => Self::Other(other),
        }
    }
}

/// Question section entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Queried name
    pub name: String,
    /// Queried type
    pub rtype: RecordType,
    /// Queried class
    pub rclass: RecordClass,
}

/// Interpreted record data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    /// A record
    A(Ipv4Addr),
    /// SRV record
    Srv {
        /// Lower is preferred
        priority: u16,
        /// Relative weight among equal priorities
        weight: u16,
        /// Service port
        port: u16,
        /// Target host
        target: String,
    },
    /// NS or CNAME target
    Name(String),
    /// Uninterpreted bytes
    Raw(Vec<u8>),
}

/// Answer, authority or additional record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    /// Owner name
    pub name: String,
    /// Record type
    pub rtype: RecordType,
    /// Record class
    pub rclass: RecordClass,
    /// Time to live in seconds
    pub ttl: u32,
    /// Record data
    pub rdata: RData,
}

/// Parsed DNS message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsMessage {
    /// Query id
    pub id: u16,
    /// Header flags word
    pub flags: u16,
    /// Question section
    pub questions: Vec<Question>,
    /// Answer section
    pub answers: Vec<ResourceRecord>,
    /// Authority section
    pub authorities: Vec<ResourceRecord>,
    /// Additional section
    pub additionals: Vec<ResourceRecord>,
}

impl DnsMessage {
    /// Response code from the flags word
    #[must_use]
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    /// Parse a complete message
    ///
    /// # Errors
    ///
    /// Returns [`DnsError::Malformed`] if any section runs past the buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, DnsError> {
        let mut reader = Reader::new(bytes);
        let id = reader.u16()?;
        let flags = reader.u16()?;
        let qd = reader.u16()?;
        let an = reader.u16()?;
        let ns = reader.u16()?;
        let ar = reader.u16()?;

        let mut questions = Vec::with_capacity(usize::from(qd));
        for _ in 0..qd {
            let name = reader.name()?;
            let rtype = RecordType::from(reader.u16()?);
            let rclass = RecordClass::from(reader.u16()?);
            questions.push(Question {
                name,
                rtype,
                rclass,
            });
        }

        Ok(Self {
            id,
            flags,
            questions,
            answers: reader.records(an)?,
            authorities: reader.records(ns)?,
            additionals: reader.records(ar)?,
        })
    }
}

/// Cursor over a message buffer
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DnsError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or(DnsError::Malformed("message truncated"))?;
        self.pos += len;
        Ok(bytes)
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<String, DnsError> {
        let (name, next) = read_name(self.buf, self.pos)?;
        self.pos = next;
        Ok(name)
    }

    fn records(&mut self, count: u16) -> Result<Vec<ResourceRecord>, DnsError> {
        (0..count).map(|_| self.record()).collect()
    }

    fn record(&mut self) -> Result<ResourceRecord, DnsError> {
        let name = self.name()?;
        let rtype = RecordType::from(self.u16()?);
        let rclass = RecordClass::from(self.u16()?);
        let ttl = self.u32()?;
        let rdlen = usize::from(self.u16()?);
        let start = self.pos;
        let raw = self.take(rdlen)?;

        let rdata = match rtype {
            RecordType::A if rdlen == 4 => RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            RecordType::Srv if rdlen >= 6 => RData::Srv {
                priority: u16::from_be_bytes([raw[0], raw[1]]),
                weight: u16::from_be_bytes([raw[2], raw[3]]),
                port: u16::from_be_bytes([raw[4], raw[5]]),
                target: read_name(self.buf, start + 6)?.0,
            },
            RecordType::Ns | RecordType::Cname => RData::Name(read_name(self.buf, start)?.0),
            _ => RData::Raw(raw.to_vec()),
        };

        Ok(ResourceRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }
}

/// Read a possibly compressed name at `offset`
///
/// Returns the dotted name and the offset just past its in-place encoding.
fn read_name(buf: &[u8], mut offset: usize) -> Result<(String, usize), DnsError> {
    let mut labels = Vec::new();
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *buf
            .get(offset)
            .ok_or(DnsError::Malformed("name runs past message"))?;

        match len & 0xc0 {
            0xc0 => {
                let low = *buf
                    .get(offset + 1)
                    .ok_or(DnsError::Malformed("truncated pointer"))?;
                end.get_or_insert(offset + 2);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsError::Malformed("compression loop"));
                }
                offset = (usize::from(len & 0x3f) << 8) | usize::from(low);
            }
            0x00 if len == 0 => {
                end.get_or_insert(offset + 1);
                break;
            }
            0x00 => {
                let start = offset + 1;
                let label = buf
                    .get(start..start + usize::from(len))
                    .ok_or(DnsError::Malformed("label runs past message"))?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                offset = start + usize::from(len);
            }
            _ => return Err(DnsError::Malformed("reserved label type")),
        }
    }

    Ok((labels.join("."), end.unwrap_or(offset + 1)))
}

/// Encode a question: length-prefixed labels, root, type, class
///
/// # Errors
///
/// Returns [`DnsError::NameTooLong`] for labels over 63 bytes or names over
/// 255 bytes.
pub fn encode_question(
    name: &str,
    rtype: RecordType,
    rclass: RecordClass,
) -> Result<Vec<u8>, DnsError> {
    let mut out = Vec::with_capacity(name.len() + 6);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::NameTooLong);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    if out.len() > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong);
    }
    out.extend_from_slice(&rtype.code().to_be_bytes());
    out.extend_from_slice(&rclass.code().to_be_bytes());
    Ok(out)
}

/// Encode a complete single-question recursive query
///
/// # Errors
///
/// See [`encode_question`].
pub fn encode_query(
    id: u16,
    name: &str,
    rtype: RecordType,
    rclass: RecordClass,
) -> Result<Vec<u8>, DnsError> {
    let question = encode_question(name, rtype, rclass)?;
    let mut out = Vec::with_capacity(DNS_HEADER_SIZE + question.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RD.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0; 6]);
    out.extend_from_slice(&question);
    Ok(out)
}

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Server port
    pub port: u16,
    /// Wait for the reply
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            port: 53,
            timeout: Duration::from_secs(10),
        }
    }
}

/// A discovered STUN server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunServerAddress {
    /// Host name or dotted IP
    pub host: String,
    /// UDP port
    pub port: u16,
    /// SRV priority, 0 for A records
    pub priority: u16,
    /// SRV weight, 0 for A records
    pub weight: u16,
}

impl std::fmt::Display for StunServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Single-server UDP resolver
#[derive(Debug, Clone)]
pub struct DnsResolver {
    server: SocketAddr,
    config: DnsConfig,
}

impl DnsResolver {
    /// Resolver using `server` on port 53
    #[must_use]
    pub fn new(server: IpAddr) -> Self {
        Self::with_config(server, DnsConfig::default())
    }

    /// Resolver with custom configuration
    #[must_use]
    pub fn with_config(server: IpAddr, config: DnsConfig) -> Self {
        Self {
            server: SocketAddr::new(server, config.port),
            config,
        }
    }

    /// Server endpoint
    #[must_use]
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Send one query and wait for the matching reply
    ///
    /// # Errors
    ///
    /// Returns an error on socket failure, timeout or an unparseable reply.
    pub async fn query(
        &self,
        name: &str,
        rtype: RecordType,
        rclass: RecordClass,
    ) -> Result<DnsMessage, DnsError> {
        let id: u16 = rand::random();
        let query = encode_query(id, name, rtype, rclass)?;

        let bind: SocketAddr = if self.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(&query, self.server).await?;

        let receive = async {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, from) = socket.recv_from(&mut buf).await?;
                if from.ip() != self.server.ip() {
                    continue;
                }
                let message = DnsMessage::decode(&buf[..len])?;
                if message.id == id {
                    return Ok::<_, DnsError>(message);
                }
            }
        };

        tokio::time::timeout(self.config.timeout, receive)
            .await
            .map_err(|_| DnsError::Timeout)?
    }

    /// SRV lookup of `_stun._udp.<domain>`, falling back to A records
    ///
    /// Failures are logged and produce an empty list.
    pub async fn discover_servers(&self, domain: &str) -> Vec<StunServerAddress> {
        let srv_name = format!("_stun._udp.{domain}");
        let answers = match self.query(&srv_name, RecordType::Srv, RecordClass::In).await {
            Ok(message) => message.answers,
            Err(e) => {
                tracing::warn!(name = %srv_name, error = %e, "SRV lookup failed");
                return Vec::new();
            }
        };

        let answers = if answers.is_empty() {
            match self.query(domain, RecordType::A, RecordClass::In).await {
                Ok(message) => message.answers,
                Err(e) => {
                    tracing::warn!(domain, error = %e, "A lookup failed");
                    return Vec::new();
                }
            }
        } else {
            answers
        };

        servers_from_records(&answers)
    }
}

/// Discover STUN servers for `domain` through `dns_server`
pub async fn discover_servers(domain: &str, dns_server: IpAddr) -> Vec<StunServerAddress> {
    DnsResolver::new(dns_server).discover_servers(domain).await
}

/// Turn SRV or A answers into server addresses ordered by
/// (priority, weight), both ascending
#[must_use]
pub fn servers_from_records(records: &[ResourceRecord]) -> Vec<StunServerAddress> {
    let mut servers: Vec<StunServerAddress> = records
        .iter()
        .filter_map(|record| match &record.rdata {
            RData::Srv {
                priority,
                weight,
                port,
                target,
            } => Some(StunServerAddress {
                host: target.clone(),
                port: *port,
                priority: *priority,
                weight: *weight,
            }),
            RData::A(ip) => Some(StunServerAddress {
                host: ip.to_string(),
                port: DEFAULT_PORT,
                priority: 0,
                weight: 0,
            }),
            RData::Name(_) | RData::Raw(_) => None,
        })
        .collect();

    servers.sort_by_key(|s| (s.priority, s.weight));
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn srv(priority: u16, weight: u16, port: u16, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: "_stun._udp.example.org".to_string(),
            rtype: RecordType::Srv,
            rclass: RecordClass::In,
            ttl: 300,
            rdata: RData::Srv {
                priority,
                weight,
                port,
                target: target.to_string(),
            },
        }
    }

    #[test]
    fn test_question_encoding() {
        let question =
            encode_question("popd.ix.netcom.com", RecordType::A, RecordClass::In).unwrap();
        assert_eq!(
            question,
            vec![
                0x04, 0x70, 0x6F, 0x70, 0x64, 0x02, 0x69, 0x78, 0x06, 0x6E, 0x65, 0x74, 0x63,
                0x6F, 0x6D, 0x03, 0x63, 0x6F, 0x6D, 0x00, 0x00, 0x01, 0x00, 0x01,
            ]
        );
    }

    #[test]
    fn test_question_rejects_long_label() {
        let name = format!("{}.example.org", "a".repeat(64));
        assert!(matches!(
            encode_question(&name, RecordType::A, RecordClass::In),
            Err(DnsError::NameTooLong)
        ));
    }

    #[test]
    fn test_query_header() {
        let query = encode_query(0x1234, "example.org", RecordType::Srv, RecordClass::In).unwrap();
        assert_eq!(&query[..DNS_HEADER_SIZE], &[0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);

        let parsed = DnsMessage::decode(&query).unwrap();
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].name, "example.org");
        assert_eq!(parsed.questions[0].rtype, RecordType::Srv);
    }

    #[test]
    fn test_srv_ordering() {
        let records = vec![
            srv(20, 0, 3478, "c.example.org"),
            srv(10, 5, 3478, "b.example.org"),
            srv(10, 1, 3479, "a.example.org"),
        ];

        let servers = servers_from_records(&records);
        let order: Vec<(u16, u16)> = servers.iter().map(|s| (s.priority, s.weight)).collect();
        assert_eq!(order, vec![(10, 1), (10, 5), (20, 0)]);
        assert_eq!(servers[0].to_string(), "a.example.org:3479");
    }

    #[test]
    fn test_a_record_uses_default_port() {
        let record = ResourceRecord {
            name: "example.org".to_string(),
            rtype: RecordType::A,
            rclass: RecordClass::In,
            ttl: 60,
            rdata: RData::A(Ipv4Addr::new(192, 0, 2, 1)),
        };
        let servers = servers_from_records(&[record]);
        assert_eq!(servers[0].to_string(), "192.0.2.1:3478");
    }

    /// Reply to an SRV query for `_stun._udp.example.org` with one answer
    /// whose owner name points back at the question
    fn srv_reply(id: u16) -> Vec<u8> {
        let mut reply =
            encode_query(id, "_stun._udp.example.org", RecordType::Srv, RecordClass::In).unwrap();
        reply[2] = 0x81;
        reply[3] = 0x80;
        reply[7] = 1;

        reply.extend_from_slice(&[0xc0, 0x0c]);
        reply.extend_from_slice(&33u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&300u32.to_be_bytes());

        // target "stun" + pointer to "example.org" inside the question
        let target = [4, b's', b't', b'u', b'n', 0xc0, 0x17];
        reply.extend_from_slice(&((6 + target.len()) as u16).to_be_bytes());
        reply.extend_from_slice(&[0, 10, 0, 5, 0x0d, 0x96]);
        reply.extend_from_slice(&target);
        reply
    }

    #[test]
    fn test_decode_compressed_srv() {
        let message = DnsMessage::decode(&srv_reply(7)).unwrap();
        assert_eq!(message.rcode(), 0);
        assert_eq!(message.answers.len(), 1);

        let answer = &message.answers[0];
        assert_eq!(answer.name, "_stun._udp.example.org");
        assert_eq!(answer.ttl, 300);
        assert_eq!(
            answer.rdata,
            RData::Srv {
                priority: 10,
                weight: 5,
                port: 3478,
                target: "stun.example.org".to_string(),
            }
        );
    }

    #[test]
    fn test_pointer_loop_rejected() {
        let mut message = encode_query(1, "a", RecordType::A, RecordClass::In).unwrap();
        message[7] = 1;
        let loop_at = message.len();
        message.extend_from_slice(&[0xc0, loop_at as u8]);
        assert!(matches!(
            DnsMessage::decode(&message),
            Err(DnsError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_message() {
        let message = srv_reply(7);
        assert!(DnsMessage::decode(&message[..message.len() - 3]).is_err());
    }

    #[tokio::test]
    async fn test_discover_against_fake_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let query = DnsMessage::decode(&buf[..len]).unwrap();
            assert_eq!(query.questions[0].name, "_stun._udp.example.org");
            server.send_to(&srv_reply(query.id), from).await.unwrap();
        });

        let config = DnsConfig {
            port,
            timeout: Duration::from_secs(2),
        };
        let resolver = DnsResolver::with_config("127.0.0.1".parse().unwrap(), config);
        let servers = resolver.discover_servers("example.org").await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].to_string(), "stun.example.org:3478");
    }

    #[tokio::test]
    async fn test_discover_timeout_is_empty() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = DnsConfig {
            port: silent.local_addr().unwrap().port(),
            timeout: Duration::from_millis(50),
        };
        let resolver = DnsResolver::with_config("127.0.0.1".parse().unwrap(), config);
        assert!(resolver.discover_servers("example.org").await.is_empty());
    }
}
