use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::RngCore;
use crate::nat::error::StunError;

/// STUN magic cookie as defined in RFC 5389
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Value XORed into the CRC-32 of a FINGERPRINT attribute
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

/// HMAC-SHA1 output length carried by MESSAGE-INTEGRITY
pub const INTEGRITY_SIZE: usize = 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// STUN message types used by ICE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Binding request
    BindingRequest = 0x0001,
    /// Binding indication
    BindingIndication = 0x0011,
    /// Binding success response
    BindingResponse = 0x0101,
    /// Binding error response
    BindingError = 0x0111,
}

/// STUN message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Request
    Request,
    /// Indication
    Indication,
    /// Success response
    SuccessResponse,
    /// Error response
    ErrorResponse,
}

/// STUN method number for Binding
pub const METHOD_BINDING: u16 = 0x001;

impl MessageType {
    /// Message class (request, indication, success or error response)
    pub fn class(&self) -> MessageClass {
        class_of(*self as u16)
    }

    /// Message method
    pub fn method(&self) -> u16 {
        method_of(*self as u16)
    }

    /// Create from method and class; only Binding is understood
    pub fn from_method_class(method: u16, class: MessageClass) -> Option<Self> {
        if method != METHOD_BINDING {
            return None;
        }
        Some(match class {
            MessageClass::Request => Self::BindingRequest,
            MessageClass::Indication => Self::BindingIndication,
            MessageClass::SuccessResponse => Self::BindingResponse,
            MessageClass::ErrorResponse => Self::BindingError,
        })
    }

    /// Whether this is a success or error response
    pub fn is_response(&self) -> bool {
        matches!(self.class(), MessageClass::SuccessResponse | MessageClass::ErrorResponse)
    }
}

fn class_of(raw: u16) -> MessageClass {
    match raw & 0x0110 {
        0x0000 => MessageClass::Request,
        0x0010 => MessageClass::Indication,
        0x0100 => MessageClass::SuccessResponse,
        _ => MessageClass::ErrorResponse,
    }
}

fn method_of(raw: u16) -> u16 {
    (raw & 0x000F) | ((raw & 0x00E0) >> 1) | ((raw & 0x3E00) >> 2)
}

/// STUN / ICE attribute types (RFC 5389 Section 18.2, RFC 5245 Section 19.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AttributeType {
    // Comprehension-required (0x0000-0x7FFF)
    /// MAPPED-ADDRESS
    MappedAddress = 0x0001,
    /// USERNAME
    Username = 0x0006,
    /// MESSAGE-INTEGRITY
    MessageIntegrity = 0x0008,
    /// ERROR-CODE
    ErrorCode = 0x0009,
    /// UNKNOWN-ATTRIBUTES
    UnknownAttributes = 0x000A,
    /// XOR-MAPPED-ADDRESS
    XorMappedAddress = 0x0020,
    /// PRIORITY
    Priority = 0x0024,
    /// USE-CANDIDATE
    UseCandidate = 0x0025,

    // Comprehension-optional (0x8000-0xFFFF)
    /// SOFTWARE
    Software = 0x8022,
    /// FINGERPRINT
    Fingerprint = 0x8028,
    /// ICE-CONTROLLED
    IceControlled = 0x8029,
    /// ICE-CONTROLLING
    IceControlling = 0x802A,
}

impl AttributeType {
    /// Check if attribute is comprehension-required
    pub fn is_comprehension_required(&self) -> bool {
        (*self as u16) < 0x8000
    }

    /// Map a wire type code to a known attribute type
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0001 => Self::MappedAddress,
            0x0006 => Self::Username,
            0x0008 => Self::MessageIntegrity,
            0x0009 => Self::ErrorCode,
            0x000A => Self::UnknownAttributes,
            0x0020 => Self::XorMappedAddress,
            0x0024 => Self::Priority,
            0x0025 => Self::UseCandidate,
            0x8022 => Self::Software,
            0x8028 => Self::Fingerprint,
            0x8029 => Self::IceControlled,
            0x802A => Self::IceControlling,
            _ => return None,
        })
    }
}

/// STUN transaction ID (96 bits)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 12]);

impl TransactionId {
    /// Generate new random transaction ID with cryptographically secure RNG
    pub fn new() -> Self {
        let mut id = [0u8; 12];
        use rand::rngs::OsRng;
        OsRng.fill_bytes(&mut id);
        Self(id)
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// A typed STUN attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Address as seen by the server, plain
    MappedAddress(SocketAddr),
    /// Address as seen by the server, XORed on the wire
    XorMappedAddress(SocketAddr),
    /// `local_ufrag:remote_ufrag` on ICE checks
    Username(String),
    /// Raw HMAC as received; produced by [`Message::encode`] when a key is supplied
    MessageIntegrity([u8; INTEGRITY_SIZE]),
    /// Raw CRC as received; produced by [`Message::encode`] when requested
    Fingerprint(u32),
    /// Priority a peer reflexive candidate would get
    Priority(u32),
    /// Nominate the pair the check runs on
    UseCandidate,
    /// Sender is controlling, with its tie-breaker
    IceControlling(u64),
    /// Sender is controlled, with its tie-breaker
    IceControlled(u64),
    /// Error class and number with a reason phrase
    ErrorCode {
        /// Class times 100 plus number
        code: u16,
        /// Reason phrase
        reason: String,
    },
    /// Types the receiver did not understand
    UnknownAttributes(Vec<u16>),
    /// Agent description
    Software(String),
}

impl Attribute {
    /// Wire type of this attribute
    pub fn attr_type(&self) -> AttributeType {
        match self {
            Attribute::MappedAddress(_) => AttributeType::MappedAddress,
            Attribute::XorMappedAddress(_) => AttributeType::XorMappedAddress,
            Attribute::Username(_) => AttributeType::Username,
            Attribute::MessageIntegrity(_) => AttributeType::MessageIntegrity,
            Attribute::Fingerprint(_) => AttributeType::Fingerprint,
            Attribute::Priority(_) => AttributeType::Priority,
            Attribute::UseCandidate => AttributeType::UseCandidate,
            Attribute::IceControlling(_) => AttributeType::IceControlling,
            Attribute::IceControlled(_) => AttributeType::IceControlled,
            Attribute::ErrorCode { .. } => AttributeType::ErrorCode,
            Attribute::UnknownAttributes(_) => AttributeType::UnknownAttributes,
            Attribute::Software(_) => AttributeType::Software,
        }
    }

    fn encode(&self, buf: &mut BytesMut, tid: &TransactionId) -> Result<(), StunError> {
        let start_pos = buf.len();

        buf.put_u16(self.attr_type() as u16);
        buf.put_u16(0); // Length placeholder

        match self {
            Attribute::MappedAddress(addr) => encode_address(buf, addr, false, tid),
            Attribute::XorMappedAddress(addr) => encode_address(buf, addr, true, tid),
            Attribute::Username(s) | Attribute::Software(s) => buf.put_slice(s.as_bytes()),
            Attribute::MessageIntegrity(hmac) => buf.put_slice(hmac),
            Attribute::Fingerprint(crc) => buf.put_u32(*crc),
            Attribute::Priority(p) => buf.put_u32(*p),
            Attribute::UseCandidate => {}
            Attribute::IceControlling(t) | Attribute::IceControlled(t) => buf.put_u64(*t),
            Attribute::ErrorCode { code, reason } => {
                buf.put_u16(0); // Reserved
                buf.put_u8(((code / 100) & 0x07) as u8);
                buf.put_u8((code % 100) as u8);
                buf.put_slice(reason.as_bytes());
            }
            Attribute::UnknownAttributes(types) => {
                for t in types {
                    buf.put_u16(*t);
                }
            }
        }

        let value_len = buf.len() - start_pos - 4;
        let len_field = u16::try_from(value_len).map_err(|_| StunError::Oversize {
            len: value_len,
            limit: u16::MAX as usize,
        })?;
        buf[start_pos + 2..start_pos + 4].copy_from_slice(&len_field.to_be_bytes());

        // Add padding to 4-byte boundary
        buf.put_bytes(0, padding(value_len));
        Ok(())
    }

    fn decode(attr_type: AttributeType, value: &[u8], tid: &TransactionId) -> Result<Self, StunError> {
        let bad_len = || StunError::MalformedPacket(format!(
            "bad length {} for {:?}", value.len(), attr_type
        ));
        let text = |v: &[u8]| String::from_utf8(v.to_vec()).map_err(|_| StunError::MalformedPacket(
            format!("{:?} is not valid UTF-8", attr_type)
        ));

        Ok(match attr_type {
            AttributeType::MappedAddress => Attribute::MappedAddress(decode_address(value, false, tid)?),
            AttributeType::XorMappedAddress => Attribute::XorMappedAddress(decode_address(value, true, tid)?),
            AttributeType::Username => Attribute::Username(text(value)?),
            AttributeType::Software => Attribute::Software(text(value)?),
            AttributeType::MessageIntegrity => {
                let hmac: [u8; INTEGRITY_SIZE] = value.try_into().map_err(|_| bad_len())?;
                Attribute::MessageIntegrity(hmac)
            }
            AttributeType::Fingerprint => {
                let raw: [u8; 4] = value.try_into().map_err(|_| bad_len())?;
                Attribute::Fingerprint(u32::from_be_bytes(raw))
            }
            AttributeType::Priority => {
                let raw: [u8; 4] = value.try_into().map_err(|_| bad_len())?;
                Attribute::Priority(u32::from_be_bytes(raw))
            }
            AttributeType::UseCandidate => {
                if !value.is_empty() {
                    return Err(bad_len());
                }
                Attribute::UseCandidate
            }
            AttributeType::IceControlling | AttributeType::IceControlled => {
                let raw: [u8; 8] = value.try_into().map_err(|_| bad_len())?;
                let tie_breaker = u64::from_be_bytes(raw);
                if attr_type == AttributeType::IceControlling {
                    Attribute::IceControlling(tie_breaker)
                } else {
                    Attribute::IceControlled(tie_breaker)
                }
            }
            AttributeType::ErrorCode => {
                if value.len() < 4 {
                    return Err(bad_len());
                }
                let class = (value[2] & 0x07) as u16;
                let number = value[3] as u16;
                let reason = String::from_utf8_lossy(&value[4..]).into_owned();
                Attribute::ErrorCode { code: class * 100 + number, reason }
            }
            AttributeType::UnknownAttributes => {
                if value.len() % 2 != 0 {
                    return Err(bad_len());
                }
                Attribute::UnknownAttributes(
                    value.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
                )
            }
        })
    }
}

/// STUN message
///
/// `attributes` holds everything but the trailing MESSAGE-INTEGRITY and
/// FINGERPRINT on encode; those are computed by [`Message::encode`]. Decoded
/// messages keep them so callers can inspect what was on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Type of the message
    pub message_type: MessageType,
    /// Transaction the message belongs to
    pub transaction_id: TransactionId,
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// Create new STUN message
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Binding request with a fresh transaction id
    pub fn binding_request() -> Self {
        Self::new(MessageType::BindingRequest, TransactionId::new())
    }

    /// Success response mirroring the transaction id of `request`
    pub fn success_response(request: &Message) -> Self {
        Self::new(MessageType::BindingResponse, request.transaction_id)
    }

    /// Error response mirroring the transaction id of `request`
    pub fn error_response(request: &Message, code: u16, reason: &str) -> Self {
        let mut msg = Self::new(MessageType::BindingError, request.transaction_id);
        msg.add_attribute(Attribute::ErrorCode { code, reason: reason.to_string() });
        msg
    }

    /// Add attribute to message
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Builder-style [`Message::add_attribute`]
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Get attribute by type
    pub fn get_attribute(&self, attr_type: AttributeType) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type() == attr_type)
    }

    /// Mapped address, preferring XOR-MAPPED-ADDRESS
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        let mut plain = None;
        for attr in &self.attributes {
            match attr {
                Attribute::XorMappedAddress(addr) => return Some(*addr),
                Attribute::MappedAddress(addr) if plain.is_none() => plain = Some(*addr),
                _ => {}
            }
        }
        plain
    }

    /// USERNAME value
    pub fn username(&self) -> Option<&str> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Username(u) => Some(u.as_str()),
            _ => None,
        })
    }

    /// PRIORITY value
    pub fn priority(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::Priority(p) => Some(*p),
            _ => None,
        })
    }

    /// Whether USE-CANDIDATE is present
    pub fn use_candidate(&self) -> bool {
        self.attributes.iter().any(|a| matches!(a, Attribute::UseCandidate))
    }

    /// Tie-breaker of ICE-CONTROLLING
    pub fn ice_controlling(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlling(t) => Some(*t),
            _ => None,
        })
    }

    /// Tie-breaker of ICE-CONTROLLED
    pub fn ice_controlled(&self) -> Option<u64> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::IceControlled(t) => Some(*t),
            _ => None,
        })
    }

    /// ERROR-CODE as (code, reason)
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// Encode message to bytes
    ///
    /// When `integrity_key` is set a MESSAGE-INTEGRITY (HMAC-SHA1) is appended,
    /// then FINGERPRINT when `fingerprint` is set.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Result<Bytes, StunError> {
        let mut buf = BytesMut::with_capacity(256);

        buf.put_u16(self.message_type as u16);
        buf.put_u16(0); // Message length (will be set later)
        buf.put_u32(MAGIC_COOKIE);
        buf.put_slice(self.transaction_id.as_bytes());

        for attr in &self.attributes {
            if matches!(attr, Attribute::MessageIntegrity(_) | Attribute::Fingerprint(_)) {
                continue;
            }
            attr.encode(&mut buf, &self.transaction_id)?;
        }

        let trailer = integrity_key.map_or(0, |_| 4 + INTEGRITY_SIZE) + if fingerprint { 8 } else { 0 };
        let body = buf.len() - HEADER_SIZE + trailer;
        if body > u16::MAX as usize {
            return Err(StunError::Oversize { len: HEADER_SIZE + body, limit: HEADER_SIZE + u16::MAX as usize });
        }

        if let Some(key) = integrity_key {
            // Length covers the integrity attribute itself
            let len = buf.len() - HEADER_SIZE + 4 + INTEGRITY_SIZE;
            set_length(&mut buf, len);
            let hmac = compute_hmac(key, &buf)?;

            buf.put_u16(AttributeType::MessageIntegrity as u16);
            buf.put_u16(INTEGRITY_SIZE as u16);
            buf.put_slice(&hmac);
        }

        if fingerprint {
            let len = buf.len() - HEADER_SIZE + 8;
            set_length(&mut buf, len);
            let checksum = CRC32.checksum(&buf) ^ FINGERPRINT_XOR;

            buf.put_u16(AttributeType::Fingerprint as u16);
            buf.put_u16(4);
            buf.put_u32(checksum);
        }

        let len = buf.len() - HEADER_SIZE;
        set_length(&mut buf, len);
        Ok(buf.freeze())
    }

    /// Decode message from bytes
    pub fn decode(raw: &[u8]) -> Result<Self, StunError> {
        if raw.len() < HEADER_SIZE {
            return Err(StunError::MalformedPacket(format!("truncated header ({} bytes)", raw.len())));
        }

        let mut buf = raw;
        let msg_type_raw = buf.get_u16();
        let msg_len = buf.get_u16() as usize;
        let magic = buf.get_u32();

        if msg_type_raw & 0xC000 != 0 {
            return Err(StunError::MalformedPacket("leading bits are not zero".to_string()));
        }
        if magic != MAGIC_COOKIE {
            return Err(StunError::MalformedPacket(format!("bad magic cookie 0x{:08X}", magic)));
        }
        if msg_len % 4 != 0 || buf.remaining() != 12 + msg_len {
            return Err(StunError::MalformedPacket(format!(
                "length field {} does not fit {} byte datagram", msg_len, raw.len()
            )));
        }

        let mut tid_bytes = [0u8; 12];
        buf.copy_to_slice(&mut tid_bytes);
        let transaction_id = TransactionId::from_bytes(tid_bytes);

        let message_type = MessageType::from_method_class(method_of(msg_type_raw), class_of(msg_type_raw))
            .ok_or_else(|| StunError::MalformedPacket(
                format!("unsupported message type 0x{:04X}", msg_type_raw)
            ))?;

        let mut buf = &buf[..msg_len];
        let mut attributes = Vec::new();
        let mut unknown_required = Vec::new();
        let mut seen_integrity = false;

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(StunError::MalformedPacket("incomplete attribute header".to_string()));
            }

            let attr_pos = raw.len() - buf.remaining();
            let attr_type_raw = buf.get_u16();
            let attr_len = buf.get_u16() as usize;
            let padded = attr_len + padding(attr_len);

            if buf.remaining() < padded {
                return Err(StunError::MalformedPacket(format!(
                    "attribute 0x{:04X} length {} overruns message", attr_type_raw, attr_len
                )));
            }
            let value = &buf[..attr_len];
            buf.advance(padded);

            let Some(attr_type) = AttributeType::from_u16(attr_type_raw) else {
                if attr_type_raw < 0x8000 {
                    unknown_required.push(attr_type_raw);
                }
                continue;
            };

            if attr_type == AttributeType::Fingerprint {
                let attr = Attribute::decode(attr_type, value, &transaction_id)?;
                if let Attribute::Fingerprint(expected) = attr {
                    if CRC32.checksum(&raw[..attr_pos]) ^ FINGERPRINT_XOR != expected {
                        return Err(StunError::MalformedPacket("FINGERPRINT mismatch".to_string()));
                    }
                }
                if buf.has_remaining() {
                    return Err(StunError::MalformedPacket("attributes after FINGERPRINT".to_string()));
                }
                attributes.push(attr);
                break;
            }

            // Everything after MESSAGE-INTEGRITY except FINGERPRINT is ignored
            if seen_integrity {
                continue;
            }
            seen_integrity = attr_type == AttributeType::MessageIntegrity;
            attributes.push(Attribute::decode(attr_type, value, &transaction_id)?);
        }

        if !unknown_required.is_empty() {
            return Err(StunError::UnknownAttribute(unknown_required));
        }

        Ok(Self {
            message_type,
            transaction_id,
            attributes,
        })
    }

    /// Verify MESSAGE-INTEGRITY of the encoded form `raw` under `key`
    pub fn verify_integrity(raw: &[u8], key: &[u8]) -> Result<(), StunError> {
        let pos = find_attribute_position(raw, AttributeType::MessageIntegrity)
            .ok_or(StunError::IntegrityFailure)?;
        if raw.len() < pos + 4 + INTEGRITY_SIZE {
            return Err(StunError::IntegrityFailure);
        }

        let mut covered = raw[..pos].to_vec();
        let adjusted = (pos - HEADER_SIZE + 4 + INTEGRITY_SIZE) as u16;
        covered[2..4].copy_from_slice(&adjusted.to_be_bytes());

        let mut mac = Hmac::<Sha1>::new_from_slice(key)
            .map_err(|_| StunError::IntegrityFailure)?;
        mac.update(&covered);
        mac.verify_slice(&raw[pos + 4..pos + 4 + INTEGRITY_SIZE])
            .map_err(|_| StunError::IntegrityFailure)
    }
}

/// Quick demultiplexing test: leading bits 00 and the magic cookie in place
pub fn is_stun_message(data: &[u8]) -> bool {
    data.len() >= HEADER_SIZE
        && data[0] & 0xC0 == 0
        && data[4..8] == MAGIC_COOKIE.to_be_bytes()
}

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn set_length(buf: &mut BytesMut, len: usize) {
    buf[2..4].copy_from_slice(&(len as u16).to_be_bytes());
}

fn compute_hmac(key: &[u8], data: &[u8]) -> Result<[u8; INTEGRITY_SIZE], StunError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key)
        .map_err(|_| StunError::IntegrityFailure)?;
    mac.update(data);
    let mut out = [0u8; INTEGRITY_SIZE];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn find_attribute_position(raw: &[u8], attr_type: AttributeType) -> Option<usize> {
    let mut pos = HEADER_SIZE;

    while pos + 4 <= raw.len() {
        let attr = u16::from_be_bytes([raw[pos], raw[pos + 1]]);
        let len = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]) as usize;

        if attr == attr_type as u16 {
            return Some(pos);
        }

        pos += 4 + len + padding(len);
    }

    None
}

fn encode_address(buf: &mut BytesMut, addr: &SocketAddr, xor: bool, tid: &TransactionId) {
    buf.put_u8(0); // Reserved

    let port = if xor {
        addr.port() ^ (MAGIC_COOKIE >> 16) as u16
    } else {
        addr.port()
    };

    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(0x01);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, tid);
            }
            buf.put_slice(&octets);
        }
        IpAddr::V6(ip) => {
            buf.put_u8(0x02);
            buf.put_u16(port);
            let mut octets = ip.octets();
            if xor {
                xor_in_place(&mut octets, tid);
            }
            buf.put_slice(&octets);
        }
    }
}

fn decode_address(value: &[u8], xor: bool, tid: &TransactionId) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::MalformedPacket("address attribute too short".to_string()));
    }

    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match (family, value.len()) {
        (0x01, 8) => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            if xor {
                xor_in_place(&mut octets, tid);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (0x02, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                xor_in_place(&mut octets, tid);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(StunError::MalformedPacket(format!(
            "address family {} with length {}", family, value.len()
        ))),
    };

    Ok(SocketAddr::new(ip, port))
}

/// XOR with the magic cookie, then the transaction id for IPv6's trailing 12 bytes
fn xor_in_place(octets: &mut [u8], tid: &TransactionId) {
    let mask = MAGIC_COOKIE.to_be_bytes().into_iter().chain(tid.as_bytes().iter().copied());
    for (b, m) in octets.iter_mut().zip(mask) {
        *b ^= m;
    }
}
