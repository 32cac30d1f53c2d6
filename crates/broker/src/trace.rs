//! W3C trace-context propagation.
//!
//! Every outgoing message carries a `traceparent` string
//! (`00-<trace-id>-<span-id>-<flags>`); participants parse it and start a
//! child span, so one cross-service flow is reconstructible from trace
//! data alone.

use rand::RngCore;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceParentError {
    #[error("malformed traceparent: {0}")]
    Malformed(String),
    #[error("unsupported traceparent version: {0}")]
    UnsupportedVersion(String),
}

/// Parsed traceparent, version 00.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceParent {
    /// 32 lowercase hex chars, not all zero.
    pub trace_id: String,
    /// 16 lowercase hex chars, not all zero.
    pub span_id: String,
    /// Lowest flag bit: sampled.
    pub sampled: bool,
}

impl TraceParent {
    /// Starts a fresh trace with a sampled root span.
    pub fn generate() -> Self {
        Self {
            trace_id: random_hex(16),
            span_id: random_hex(8),
            sampled: true,
        }
    }

    /// Child span context: same trace id, fresh span id, same flags.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(8),
            sampled: self.sampled,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TraceParentError> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() != 4 {
            return Err(TraceParentError::Malformed(raw.to_string()));
        }
        let (version, trace_id, span_id, flags) = (parts[0], parts[1], parts[2], parts[3]);
        if version != "00" {
            return Err(TraceParentError::UnsupportedVersion(version.to_string()));
        }
        if trace_id.len() != 32
            || span_id.len() != 16
            || flags.len() != 2
            || !is_lower_hex(trace_id)
            || !is_lower_hex(span_id)
            || !is_lower_hex(flags)
        {
            return Err(TraceParentError::Malformed(raw.to_string()));
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return Err(TraceParentError::Malformed(raw.to_string()));
        }
        let flag_bits = u8::from_str_radix(flags, 16)
            .map_err(|_| TraceParentError::Malformed(raw.to_string()))?;
        Ok(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled: flag_bits & 0x01 == 0x01,
        })
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = if self.sampled { 0x01u8 } else { 0x00u8 };
        write!(f, "00-{}-{}-{:02x}", self.trace_id, self.span_id, flags)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn random_hex(len_bytes: usize) -> String {
    let mut bytes = vec![0u8; len_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    // A fresh id of all zeros is invalid per spec; one forced bit avoids it.
    if bytes.iter().all(|b| *b == 0) {
        bytes[0] = 1;
    }
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
