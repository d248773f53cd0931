//! Per-protocol signature checks.
//!
//! Every check inspects the bytes available so far and answers one of
//! three ways: the signature matched, the bytes seen so far are consistent
//! with the signature but more are needed, or the bytes contradict it.
//! Checks reject as early as possible so that a short prefix of one
//! protocol is never held back by an unrelated detector.
//!
//! # Wire signatures
//!
//! ```text
//! HTTP/1.x   "<METHOD> " request line, or "HTTP/" status line
//! HTTP/2     "PRI * HTTP/2.0" connection preface
//! Redis      [sigil] [body] "\r\n"
//!              * $ :  body = optional '-' then decimal digits
//!              + -    body = printable ASCII
//! MySQL      [payload_len: 3 bytes LE, non-zero] [seq_id: 0x00]
//!            [protocol_version: 0x0a] [server_version: ASCII digit ...]
//! Postgres   [len: 4 bytes BE, 8..=10000] [code: 4 bytes BE]
//!              code = 0x00030000 (StartupMessage v3.0)
//!                     80877103   (SSLRequest)
//!                     80877104   (GSSENCRequest)
//!                     80877102   (CancelRequest)
//! MongoDB    [messageLength: 4 LE] [requestID: 4 LE]
//!            [responseTo: 4 LE = 0] [opCode: 4 LE]
//! RTMP       C0 [version: 0x03]
//!            C1 [time: 4 bytes] [zero: 4 bytes = 0] [random ...]
//! ```

/// Outcome of a single signature check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Match,
    /// Consistent so far; `required` bytes are needed to decide.
    NeedMore { required: usize },
    NoMatch,
}

// ── HTTP ───────────────────────────────────────────────────────────

pub const HTTP_MIN_BYTES: usize = 4;

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0";

const HTTP_TOKENS: [&[u8]; 11] = [
    b"GET ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
    b"HTTP/",
    HTTP2_PREFACE,
];

pub fn http(data: &[u8]) -> Detection {
    let mut required = None::<usize>;
    for token in HTTP_TOKENS {
        if data.len() >= token.len() {
            if data.starts_with(token) {
                return Detection::Match;
            }
        } else if token.starts_with(data) {
            let need = token.len().max(HTTP_MIN_BYTES);
            required = Some(required.map_or(need, |r| r.min(need)));
        }
    }
    match required {
        Some(required) => Detection::NeedMore { required },
        None => Detection::NoMatch,
    }
}

// ── Redis (RESP) ───────────────────────────────────────────────────

pub const REDIS_MIN_BYTES: usize = 4;

/// Scan `data[..scan_limit]` for a RESP type line. No CRLF within the
/// limit means the bytes are not RESP.
pub fn redis(data: &[u8], scan_limit: usize) -> Detection {
    let Some(&sigil) = data.first() else {
        return Detection::NeedMore {
            required: REDIS_MIN_BYTES,
        };
    };
    let numeric = match sigil {
        b'*' | b'$' | b':' => true,
        b'+' | b'-' => false,
        _ => return Detection::NoMatch,
    };

    let window = &data[..data.len().min(scan_limit)];
    let mut body_len = 0usize;
    let mut i = 1;
    while i < window.len() {
        let b = window[i];
        if b == b'\r' {
            if body_len == 0 || (numeric && window[i - 1] == b'-') {
                return Detection::NoMatch;
            }
            return match window.get(i + 1) {
                Some(b'\n') => Detection::Match,
                Some(_) => Detection::NoMatch,
                None => need_more_within(i + 2, scan_limit),
            };
        }
        let valid = if numeric {
            b.is_ascii_digit() || (b == b'-' && i == 1)
        } else {
            (0x20..=0x7e).contains(&b)
        };
        if !valid {
            return Detection::NoMatch;
        }
        body_len += 1;
        i += 1;
    }
    need_more_within((window.len() + 1).max(REDIS_MIN_BYTES), scan_limit)
}

fn need_more_within(required: usize, scan_limit: usize) -> Detection {
    if required > scan_limit {
        Detection::NoMatch
    } else {
        Detection::NeedMore { required }
    }
}

// ── MySQL ──────────────────────────────────────────────────────────

pub const MYSQL_MIN_BYTES: usize = 6;

/// Protocol version byte of a v10 handshake (MySQL 3.21+ / MariaDB).
const MYSQL_PROTOCOL_V10: u8 = 0x0a;

pub fn mysql(data: &[u8]) -> Detection {
    if data.len() >= 3 && data[0] == 0 && data[1] == 0 && data[2] == 0 {
        return Detection::NoMatch;
    }
    if data.len() >= 4 && data[3] != 0 {
        return Detection::NoMatch;
    }
    if data.len() >= 5 && data[4] != MYSQL_PROTOCOL_V10 {
        return Detection::NoMatch;
    }
    if data.len() < MYSQL_MIN_BYTES {
        return Detection::NeedMore {
            required: MYSQL_MIN_BYTES,
        };
    }
    if data[5].is_ascii_digit() {
        Detection::Match
    } else {
        Detection::NoMatch
    }
}

// ── PostgreSQL ─────────────────────────────────────────────────────

pub const POSTGRES_MIN_BYTES: usize = 8;

const PG_PROTOCOL_V3: u32 = 0x0003_0000;
const PG_SSL_REQUEST: u32 = 80_877_103;
const PG_GSSENC_REQUEST: u32 = 80_877_104;
const PG_CANCEL_REQUEST: u32 = 80_877_102;

/// Upper bound on a plausible startup packet length.
const PG_MAX_STARTUP_LEN: u32 = 10_000;

pub fn postgres(data: &[u8]) -> Detection {
    // Lengths up to PG_MAX_STARTUP_LEN keep the two high bytes zero.
    if data.iter().take(2).any(|&b| b != 0) {
        return Detection::NoMatch;
    }
    if data.len() >= 4 {
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if !(8..=PG_MAX_STARTUP_LEN).contains(&len) {
            return Detection::NoMatch;
        }
    }
    if data.len() < POSTGRES_MIN_BYTES {
        return Detection::NeedMore {
            required: POSTGRES_MIN_BYTES,
        };
    }
    let code = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    match code {
        PG_PROTOCOL_V3 | PG_SSL_REQUEST | PG_GSSENC_REQUEST | PG_CANCEL_REQUEST => {
            Detection::Match
        }
        _ => Detection::NoMatch,
    }
}

// ── MongoDB ────────────────────────────────────────────────────────

pub const MONGODB_MIN_BYTES: usize = 16;

/// Default `maxMessageSizeBytes` of a mongod.
const MONGO_MAX_MESSAGE_LEN: u32 = 48_000_000;

const MONGO_OPCODES: [u32; 8] = [
    2013, // OP_MSG
    2012, // OP_COMPRESSED
    2004, // OP_QUERY
    2001, // OP_UPDATE
    2002, // OP_INSERT
    2005, // OP_GET_MORE
    2006, // OP_DELETE
    2007, // OP_KILL_CURSORS
];

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

pub fn mongodb(data: &[u8]) -> Detection {
    if data.len() >= 4 {
        let len = le_u32(data, 0);
        if !(MONGODB_MIN_BYTES as u32..=MONGO_MAX_MESSAGE_LEN).contains(&len) {
            return Detection::NoMatch;
        }
    }
    // A client request never answers an earlier message.
    if data.iter().skip(8).take(4).any(|&b| b != 0) {
        return Detection::NoMatch;
    }
    if data.len() < MONGODB_MIN_BYTES {
        return Detection::NeedMore {
            required: MONGODB_MIN_BYTES,
        };
    }
    if MONGO_OPCODES.contains(&le_u32(data, 12)) {
        Detection::Match
    } else {
        Detection::NoMatch
    }
}

// ── RTMP ───────────────────────────────────────────────────────────

pub const RTMP_MIN_BYTES: usize = 9;

const RTMP_VERSION: u8 = 0x03;

pub fn rtmp(data: &[u8]) -> Detection {
    match data.first() {
        Some(&RTMP_VERSION) => {}
        Some(_) => return Detection::NoMatch,
        None => {
            return Detection::NeedMore {
                required: RTMP_MIN_BYTES,
            };
        }
    }
    if data.iter().skip(5).take(4).any(|&b| b != 0) {
        return Detection::NoMatch;
    }
    if data.len() < RTMP_MIN_BYTES {
        Detection::NeedMore {
            required: RTMP_MIN_BYTES,
        }
    } else {
        Detection::Match
    }
}
