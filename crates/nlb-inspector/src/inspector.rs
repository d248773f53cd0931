use crate::error::{InspectError, InspectResult};
use crate::signatures::{self, Detection};
use nlb_core::Protocol;
use nlb_core::config::MIN_INSPECT_BYTES;
use serde::Serialize;

/// Detectors in evaluation order. Cheap text checks come first; the
/// binary-header checks that need the most bytes come last.
pub const DETECTION_ORDER: [Protocol; 6] = [
    Protocol::Http,
    Protocol::Redis,
    Protocol::MySql,
    Protocol::Postgres,
    Protocol::MongoDb,
    Protocol::Rtmp,
];

/// Result of a successful classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub protocol: Protocol,
    pub confidence: f32,
}

/// Classifies connections by the signature of their first bytes.
#[derive(Debug, Clone)]
pub struct ProtocolInspector {
    scan_limit: usize,
}

impl Default for ProtocolInspector {
    fn default() -> Self {
        Self::new(MIN_INSPECT_BYTES)
    }
}

impl ProtocolInspector {
    /// Create an inspector that looks at no more than `scan_limit` bytes.
    /// The limit is raised to [`max_required_bytes`](Self::max_required_bytes)
    /// if smaller.
    pub fn new(scan_limit: usize) -> Self {
        Self {
            scan_limit: scan_limit.max(Self::max_required_bytes()),
        }
    }

    pub fn scan_limit(&self) -> usize {
        self.scan_limit
    }

    /// Bytes a detector needs before it can answer on its own.
    pub const fn min_bytes(protocol: Protocol) -> usize {
        match protocol {
            Protocol::Http => signatures::HTTP_MIN_BYTES,
            Protocol::Redis => signatures::REDIS_MIN_BYTES,
            Protocol::MySql => signatures::MYSQL_MIN_BYTES,
            Protocol::Postgres => signatures::POSTGRES_MIN_BYTES,
            Protocol::MongoDb => signatures::MONGODB_MIN_BYTES,
            Protocol::Rtmp => signatures::RTMP_MIN_BYTES,
        }
    }

    /// Largest per-protocol minimum. Reading this many bytes is always
    /// enough to reach a verdict.
    pub const fn max_required_bytes() -> usize {
        let mut max = 0;
        let mut i = 0;
        while i < DETECTION_ORDER.len() {
            let n = Self::min_bytes(DETECTION_ORDER[i]);
            if n > max {
                max = n;
            }
            i += 1;
        }
        max
    }

    pub const fn confidence(protocol: Protocol) -> f32 {
        match protocol {
            Protocol::Http => 0.99,
            Protocol::Postgres => 0.95,
            Protocol::MySql | Protocol::MongoDb | Protocol::Redis => 0.9,
            Protocol::Rtmp => 0.8,
        }
    }

    /// Classify the first bytes of a connection.
    ///
    /// Detectors run in [`DETECTION_ORDER`]. The first detector that still
    /// needs bytes stops the scan with [`InspectError::Incomplete`], so a
    /// later detector can never claim a prefix an earlier one might still
    /// match. Once `scan_limit` bytes are available, undecided detectors
    /// are treated as non-matching.
    pub fn classify(&self, data: &[u8]) -> InspectResult<Classification> {
        let exhausted = data.len() >= self.scan_limit;
        for protocol in DETECTION_ORDER {
            match self.detect(protocol, data) {
                Detection::Match => {
                    return Ok(Classification {
                        protocol,
                        confidence: Self::confidence(protocol),
                    });
                }
                Detection::NeedMore { required } if !exhausted => {
                    return Err(InspectError::Incomplete {
                        available: data.len(),
                        required,
                    });
                }
                Detection::NeedMore { .. } | Detection::NoMatch => {}
            }
        }
        Err(InspectError::Unknown)
    }

    fn detect(&self, protocol: Protocol, data: &[u8]) -> Detection {
        match protocol {
            Protocol::Http => signatures::http(data),
            Protocol::Redis => signatures::redis(data, self.scan_limit),
            Protocol::MySql => signatures::mysql(data),
            Protocol::Postgres => signatures::postgres(data),
            Protocol::MongoDb => signatures::mongodb(data),
            Protocol::Rtmp => signatures::rtmp(data),
        }
    }
}
