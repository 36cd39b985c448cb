//! Discovery wire protocol.
//!
//! Debug consoles listen on UDP port 730 for a fixed probe payload and
//! answer with two framing bytes followed by an ASCII name. The payloads
//! are part of the protocol; every byte matters for interoperability.

use std::net::Ipv4Addr;

/// UDP port consoles answer discovery probes on.
pub const DISCOVERY_PORT: u16 = 730;

/// The jtag probe: two framing bytes then "jtag".
pub const JTAG_PROBE: [u8; 6] = [0x03, 0x04, 0x6A, 0x74, 0x61, 0x67];

/// The devkit probe: two framing bytes then "XeDevkit".
/// Reserved — not emitted unless explicitly configured.
pub const DEVKIT_PROBE: [u8; 10] = [0x03, 0x04, 0x58, 0x65, 0x44, 0x65, 0x76, 0x6B, 0x69, 0x74];

/// Framing bytes prefixed to every console reply.
pub const REPLY_HEADER_LEN: usize = 2;

/// Directed broadcast of the legacy Internet-Connection-Sharing bridge
/// subnet (192.168.137.0/24).
pub const ICS_BRIDGE_BROADCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 137, 255);

/// Extract the console name from a discovery reply.
///
/// Returns `None` for payloads too short to carry a name past the framing
/// bytes, or whose name is not ASCII. Trailing NULs are trimmed.
pub fn parse_reply(payload: &[u8]) -> Option<&str> {
    if payload.len() <= REPLY_HEADER_LEN {
        return None;
    }
    let name = std::str::from_utf8(&payload[REPLY_HEADER_LEN..]).ok()?;
    if !name.is_ascii() {
        return None;
    }
    let name = name.trim_end_matches('\0');
    if name.is_empty() {
        return None;
    }
    Some(name)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
