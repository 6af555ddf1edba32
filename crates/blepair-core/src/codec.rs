//! Pure payload codec: one-time codes, classification, fragmentation.
//!
//! Everything in this module is side-effect free. The wire format is plain
//! UTF-8 text; message kinds are distinguished by shape, not by a schema.
//!
//! # Classification precedence
//!
//! [`classify`] checks Code first, then Identity, then Credential. The order
//! is load-bearing: a 6-character uppercase alphanumeric string always
//! classifies as a Code even if it would also match another shape, and an
//! identity-prefixed string is never inspected for credential markers.
//! Callers that cannot tolerate this ambiguity should route each message
//! kind over its own attribute instead of content-sniffing.
//!
//! # Fragmentation schemes
//!
//! Two schemes exist. The indexed scheme prepends a 2-byte
//! `[index, total]` header to every fragment and is self-describing; it is
//! the default. The sentinel scheme wraps the whole payload once in
//! start/end markers and slices it naively; it survives only as a legacy
//! compatibility mode ([`crate::config::FragmentScheme::Sentinel`]) because
//! deployed responders still speak it.

use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;

/// Alphabet the one-time code is drawn from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a one-time code.
pub const CODE_LEN: usize = 6;

/// Recognized device identity prefixes ("serial number" shapes).
pub const IDENTITY_PREFIXES: [&str; 3] = ["TAB-", "MOB-", "DEV-"];

/// First-part marker of a credential (base64url of `{"`).
pub const CREDENTIAL_MARKER: &str = "eyJ";

/// Bytes of `[index, total]` prepended to each indexed fragment.
pub const FRAGMENT_HEADER_LEN: usize = 2;

/// Default payload bytes per fragment; header + chunk stays within the
/// 20-byte ATT default write ceiling.
pub const DEFAULT_MAX_CHUNK: usize = 18;

/// Start marker of the legacy sentinel framing.
pub const SENTINEL_START: &str = "@@BEGIN@@";

/// End marker of the legacy sentinel framing.
pub const SENTINEL_END: &str = "@@FIN@@";

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9]+$").unwrap());

/// Shape of an inbound text payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Code,
    Identity,
    Credential,
    Unknown,
}

/// Draw a fresh one-time code: [`CODE_LEN`] characters from [`CODE_ALPHABET`].
pub fn generate_code() -> String {
    generate_code_with_len(CODE_LEN)
}

/// Draw a code of an explicit length (the length is configurable).
pub fn generate_code_with_len(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Whether a prefix (without the hyphen) is one of [`IDENTITY_PREFIXES`].
pub fn known_identity_prefix(prefix: &str) -> bool {
    IDENTITY_PREFIXES
        .iter()
        .any(|p| p.trim_end_matches('-') == prefix)
}

/// Generate a device identity: a recognized prefix, a hyphen, and a
/// zero-padded six-digit serial. Generated once per process and immutable
/// thereafter; callers hold on to the result.
///
/// An unrecognized prefix is rejected rather than emitted, since the
/// resulting identity would classify as [`PayloadKind::Unknown`] and the
/// initiator would skip it.
pub fn generate_identity(prefix: &str) -> Result<String, crate::error::PairingError> {
    if !known_identity_prefix(prefix) {
        return Err(crate::error::PairingError::Validation(format!(
            "unrecognized identity prefix: {prefix} (expected TAB, MOB or DEV)"
        )));
    }
    let serial: u32 = rand::thread_rng().gen_range(0..1_000_000);
    Ok(format!("{prefix}-{serial:06}"))
}

/// Classify a payload by shape. See the module docs for the precedence rule.
pub fn classify(payload: &str) -> PayloadKind {
    if validate_code(payload) {
        return PayloadKind::Code;
    }
    if IDENTITY_PREFIXES.iter().any(|p| payload.starts_with(p)) {
        return PayloadKind::Identity;
    }
    if payload.starts_with(CREDENTIAL_MARKER) && payload.matches('.').count() >= 2 {
        return PayloadKind::Credential;
    }
    PayloadKind::Unknown
}

/// Shape check for a one-time code, exposed separately so the responder can
/// re-validate after receipt.
pub fn validate_code(code: &str) -> bool {
    code.len() == CODE_LEN && CODE_PATTERN.is_match(code)
}

/// One indexed fragment of a larger payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: u8,
    pub total: u8,
    pub data: Vec<u8>,
}

impl Fragment {
    /// Wire representation: `[index, total, ...data]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.data.len());
        buf.push(self.index);
        buf.push(self.total);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse a wire frame back into a fragment.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReassemblyError> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(ReassemblyError::TruncatedFragment { len: bytes.len() });
        }
        Ok(Self {
            index: bytes[0],
            total: bytes[1],
            data: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Split a payload into `ceil(len / max_chunk)` indexed fragments.
///
/// `max_chunk` counts payload bytes only; the wire frame is 2 bytes longer.
/// Payloads here are short tokens, so the u8 index space (255 fragments) is
/// never a practical limit.
pub fn fragment(payload: &str, max_chunk: usize) -> Vec<Fragment> {
    assert!(max_chunk >= 1, "max_chunk must be at least 1");
    let bytes = payload.as_bytes();
    let chunks: Vec<&[u8]> = bytes.chunks(max_chunk).collect();
    assert!(
        chunks.len() <= u8::MAX as usize,
        "payload too large for u8 fragment index"
    );
    let total = chunks.len() as u8;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| Fragment {
            index: i as u8,
            total,
            data: chunk.to_vec(),
        })
        .collect()
}

/// Reassemble indexed wire frames back into the original payload.
///
/// Order-independent: frames are sorted by index before concatenation.
/// An empty frame set yields an empty payload, matching [`fragment`] on an
/// empty input.
pub fn reassemble(frames: &[Vec<u8>]) -> Result<String, ReassemblyError> {
    let mut fragments = Vec::with_capacity(frames.len());
    for frame in frames {
        fragments.push(Fragment::from_bytes(frame)?);
    }
    fragments.sort_by_key(|f| f.index);

    if let Some(first) = fragments.first() {
        let total = first.total;
        if fragments.len() != total as usize {
            return Err(ReassemblyError::MissingFragment {
                have: fragments.len(),
                total,
            });
        }
        for (i, frag) in fragments.iter().enumerate() {
            if frag.total != total {
                return Err(ReassemblyError::MismatchedTotals(total, frag.total));
            }
            if frag.index as usize != i {
                return Err(ReassemblyError::MissingFragment {
                    have: fragments.len(),
                    total,
                });
            }
        }
    }

    let bytes: Vec<u8> = fragments.into_iter().flat_map(|f| f.data).collect();
    String::from_utf8(bytes).map_err(|_| ReassemblyError::InvalidUtf8)
}

/// Wrap a payload once in the legacy start/end sentinels.
pub fn wrap_sentinel(payload: &str) -> String {
    format!("{SENTINEL_START}{payload}{SENTINEL_END}")
}

/// Naively slice a sentinel-wrapped payload into chunks with no headers.
///
/// The chunks carry no ordering information; the receiver relies on in-order
/// delivery. This is the legacy scheme's fundamental weakness.
pub fn sentinel_chunks(wrapped: &str, max_chunk: usize) -> Vec<Vec<u8>> {
    assert!(max_chunk >= 1, "max_chunk must be at least 1");
    wrapped
        .as_bytes()
        .chunks(max_chunk)
        .map(<[u8]>::to_vec)
        .collect()
}

/// Search an accumulator buffer for a complete `START..END` span and slice
/// out the payload between the markers.
///
/// Returns `None` while the span is still incomplete; the caller keeps
/// accumulating. Markers may straddle chunk boundaries at any point, which
/// is why the search runs over the whole buffer on every append.
pub fn extract_sentinel(buffer: &[u8]) -> Option<String> {
    let start = find_subsequence(buffer, SENTINEL_START.as_bytes())?;
    let after_start = start + SENTINEL_START.len();
    let end = find_subsequence(&buffer[after_start..], SENTINEL_END.as_bytes())?;
    let payload = &buffer[after_start..after_start + end];
    Some(String::from_utf8_lossy(payload).into_owned())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reassembly failures. Carried as data so the state machine can report them
/// without aborting the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("fragment of {len} bytes is shorter than the {FRAGMENT_HEADER_LEN}-byte header")]
    TruncatedFragment { len: usize },

    #[error("fragment set has {have} pieces but expects {total}")]
    MissingFragment { have: usize, total: u8 },

    #[error("fragment totals disagree: {0} vs {1}")]
    MismatchedTotals(u8, u8),

    #[error("reassembled payload is not valid UTF-8")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_have_the_right_shape() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(validate_code(&code), "bad code: {code}");
            assert_eq!(classify(&code), PayloadKind::Code);
        }
    }

    #[test]
    fn code_validation_rejects_wrong_shapes() {
        assert!(!validate_code("abc"));
        assert!(!validate_code("abcdef")); // lowercase
        assert!(!validate_code("AB12C")); // too short
        assert!(!validate_code("AB12CD3")); // too long
        assert!(!validate_code("AB 2CD")); // symbol
        assert_ne!(classify("abc"), PayloadKind::Code);
        assert_ne!(classify("AB12C!"), PayloadKind::Code);
    }

    #[test]
    fn generated_identities_classify_as_identity() {
        for prefix in ["TAB", "MOB", "DEV"] {
            let identity = generate_identity(prefix).unwrap();
            assert_eq!(classify(&identity), PayloadKind::Identity, "{identity}");
            assert_eq!(identity.len(), prefix.len() + 7);
        }
    }

    #[test]
    fn unknown_identity_prefix_is_rejected() {
        for prefix in ["XYZ", "tab", "TAB-", ""] {
            assert!(!known_identity_prefix(prefix), "{prefix:?}");
            assert!(generate_identity(prefix).is_err(), "{prefix:?}");
        }
        assert!(known_identity_prefix("MOB"));
    }

    #[test]
    fn classification_precedence_is_code_then_identity_then_credential() {
        assert_eq!(classify("AB12CD"), PayloadKind::Code);
        assert_eq!(classify("TAB-000123"), PayloadKind::Identity);
        assert_eq!(classify("eyJhbGc.eyJzdWI.c2ln"), PayloadKind::Credential);
        assert_eq!(classify("what is this"), PayloadKind::Unknown);

        // 6 uppercase alphanumerics win even though "TAB123" carries an
        // identity-looking prefix
        assert_eq!(classify("TAB123"), PayloadKind::Code);
        // identity prefix wins over a dot count
        assert_eq!(classify("TAB-1.2.3"), PayloadKind::Identity);
        // credential needs at least two separators
        assert_eq!(classify("eyJhbGc.only-one"), PayloadKind::Unknown);
    }

    #[test]
    fn indexed_round_trip_for_various_chunk_sizes() {
        let payloads = vec![
            String::new(),
            "x".to_string(),
            "hdr.pld.sig".to_string(),
            "a".repeat(100),
        ];
        for payload in &payloads {
            for k in [1usize, 2, 5, 18, 64, 1000] {
                let frames: Vec<Vec<u8>> = fragment(payload, k)
                    .iter()
                    .map(Fragment::to_bytes)
                    .collect();
                for frame in &frames {
                    assert!(frame.len() <= k + FRAGMENT_HEADER_LEN);
                }
                assert_eq!(reassemble(&frames).unwrap(), *payload, "k={k}");
            }
        }
    }

    #[test]
    fn indexed_reassembly_is_order_independent() {
        let mut frames: Vec<Vec<u8>> = fragment("the quick brown fox jumps", 4)
            .iter()
            .map(Fragment::to_bytes)
            .collect();
        frames.reverse();
        assert_eq!(reassemble(&frames).unwrap(), "the quick brown fox jumps");
    }

    #[test]
    fn reassembly_rejects_truncated_and_incomplete_sets() {
        assert_eq!(
            reassemble(&[vec![0u8]]),
            Err(ReassemblyError::TruncatedFragment { len: 1 })
        );

        let frames: Vec<Vec<u8>> = fragment("hello world", 4)
            .iter()
            .map(Fragment::to_bytes)
            .collect();
        let partial = &frames[..frames.len() - 1];
        assert!(matches!(
            reassemble(partial),
            Err(ReassemblyError::MissingFragment { .. })
        ));
    }

    #[test]
    fn sentinel_extraction_survives_arbitrary_split_points() {
        let payload = "hdr.pld.sig";
        let wrapped = wrap_sentinel(payload);

        // every possible chunk size, including splits mid-marker
        for k in 1..=wrapped.len() {
            let mut buffer = Vec::new();
            let mut extracted = None;
            for chunk in sentinel_chunks(&wrapped, k) {
                buffer.extend_from_slice(&chunk);
                if let Some(found) = extract_sentinel(&buffer) {
                    extracted = Some(found);
                    break;
                }
            }
            assert_eq!(extracted.as_deref(), Some(payload), "k={k}");
        }
    }

    #[test]
    fn sentinel_extraction_waits_for_the_end_marker() {
        let wrapped = wrap_sentinel("token");
        let cut = wrapped.len() - 3; // mid END marker
        assert_eq!(extract_sentinel(&wrapped.as_bytes()[..cut]), None);
        assert_eq!(
            extract_sentinel(wrapped.as_bytes()),
            Some("token".to_string())
        );
    }

    #[test]
    fn sentinel_extraction_ignores_noise_around_the_span() {
        let mut buffer = b"noise-before".to_vec();
        buffer.extend_from_slice(wrap_sentinel("tok").as_bytes());
        buffer.extend_from_slice(b"noise-after");
        assert_eq!(extract_sentinel(&buffer), Some("tok".to_string()));
    }
}
