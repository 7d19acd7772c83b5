//! Message type codes and protocol constants.
//!
//! Type codes are two ASCII characters read as a big-endian `u16`, so a
//! hex dump of the wire shows a readable mnemonic.

pub const SERVER_VERSION: &[u8; 8] = b"BZFS0221";

/// Version string prefix every game server advertises.
pub const VERSION_PREFIX: &str = "BZFS";

pub const DEFAULT_SERVER_PORT: u16 = 5155;
pub const DEFAULT_LIST_SERVER_PORT: u16 = DEFAULT_SERVER_PORT + 1;

/// Bytes of the unframed greeting written on TCP accept: version + index.
pub const HELLO_LEN: usize = 9;

pub const CALLSIGN_LEN: usize = 32;
pub const MESSAGE_LEN: usize = 128;

pub type PlayerIndex = u8;

pub const LAST_REAL_PLAYER: PlayerIndex = 243;
/// Base for team-addressed chat: team `t` is `TEAM_TARGET_BASE - t`.
pub const TEAM_TARGET_BASE: PlayerIndex = 250;
pub const ADMIN_PLAYERS: PlayerIndex = 252;
pub const SERVER_PLAYER: PlayerIndex = 253;
pub const ALL_PLAYERS: PlayerIndex = 254;
pub const NO_PLAYER: PlayerIndex = 255;

const fn code(tag: &[u8; 2]) -> u16 {
    ((tag[0] as u16) << 8) | tag[1] as u16
}

pub const MSG_NULL: u16 = 0x0000;
pub const MSG_ACCEPT: u16 = code(b"ac");
pub const MSG_ALIVE: u16 = code(b"al");
pub const MSG_ADD_PLAYER: u16 = code(b"ap");
pub const MSG_CAPTURE_FLAG: u16 = code(b"cf");
pub const MSG_DROP_FLAG: u16 = code(b"df");
pub const MSG_ENTER: u16 = code(b"en");
pub const MSG_EXIT: u16 = code(b"ex");
pub const MSG_FLAG_UPDATE: u16 = code(b"fu");
pub const MSG_GRAB_FLAG: u16 = code(b"gf");
pub const MSG_GM_UPDATE: u16 = code(b"gm");
pub const MSG_KILLED: u16 = code(b"kl");
pub const MSG_MESSAGE: u16 = code(b"mg");
pub const MSG_UDP_LINK_REQUEST: u16 = code(b"of");
pub const MSG_UDP_LINK_ESTABLISHED: u16 = code(b"og");
pub const MSG_LAG_PING: u16 = code(b"pi");
pub const MSG_PLAYER_UPDATE_SMALL: u16 = code(b"ps");
pub const MSG_PLAYER_UPDATE: u16 = code(b"pu");
pub const MSG_REJECT: u16 = code(b"rj");
pub const MSG_REMOVE_PLAYER: u16 = code(b"rp");
pub const MSG_SHOT_BEGIN: u16 = code(b"sb");
pub const MSG_SCORE: u16 = code(b"sc");
pub const MSG_SHOT_END: u16 = code(b"se");
pub const MSG_SUPER_KILL: u16 = code(b"sk");
pub const MSG_TIME_UPDATE: u16 = code(b"to");
pub const MSG_TELEPORT: u16 = code(b"tp");
pub const MSG_WHAT_TIME_IS_IT: u16 = code(b"wt");

/// Datagram-only codes, never sent over TCP.
pub const PING_CODE_REQUEST: u16 = 0x0404;
pub const PING_CODE_REPLY: u16 = 0x0303;

/// Reject reasons carried by `MSG_REJECT`.
pub const REJECT_BAD_REQUEST: u16 = 0x0000;
pub const REJECT_SERVER_FULL: u16 = 0x0004;
pub const REJECT_BAD_CALLSIGN: u16 = 0x0005;

/// Death reason that carries an extra physics driver id.
pub const PHYSICS_DRIVER_DEATH: i16 = 7;

/// Types the server may move onto the UDP fast path once a session's
/// outbound link is established. Everything else stays on TCP.
pub fn is_udp_bulk(code: u16) -> bool {
    matches!(
        code,
        MSG_SHOT_BEGIN
            | MSG_SHOT_END
            | MSG_PLAYER_UPDATE
            | MSG_PLAYER_UPDATE_SMALL
            | MSG_GM_UPDATE
            | MSG_LAG_PING
            | MSG_WHAT_TIME_IS_IT
    )
}

/// Types a client is allowed to send over UDP. Anything else arriving by
/// datagram is treated as spoofed and discarded.
pub fn is_udp_acceptable(code: u16) -> bool {
    is_udp_bulk(code) || matches!(code, MSG_UDP_LINK_REQUEST | MSG_UDP_LINK_ESTABLISHED)
}

/// Smallest payload the server accepts from a client for `code`.
pub fn min_payload_len(code: u16) -> usize {
    match code {
        MSG_ENTER => 4 + CALLSIGN_LEN,
        MSG_PLAYER_UPDATE | MSG_PLAYER_UPDATE_SMALL => 1 + 8 + 6,
        MSG_SHOT_BEGIN => 32,
        MSG_SHOT_END => 5,
        MSG_GM_UPDATE => 30,
        MSG_MESSAGE => 3,
        MSG_ALIVE => 17,
        MSG_KILLED => 8,
        MSG_TELEPORT => 5,
        MSG_GRAB_FLAG => 3,
        MSG_DROP_FLAG => 15,
        MSG_CAPTURE_FLAG => 5,
        MSG_LAG_PING => 2,
        MSG_WHAT_TIME_IS_IT => 1,
        MSG_UDP_LINK_REQUEST => 1,
        _ => 0,
    }
}

/// Human readable name for logs.
pub fn code_name(code: u16) -> &'static str {
    match code {
        MSG_NULL => "Null",
        MSG_ACCEPT => "Accept",
        MSG_ALIVE => "Alive",
        MSG_ADD_PLAYER => "AddPlayer",
        MSG_CAPTURE_FLAG => "CaptureFlag",
        MSG_DROP_FLAG => "DropFlag",
        MSG_ENTER => "Enter",
        MSG_EXIT => "Exit",
        MSG_FLAG_UPDATE => "FlagUpdate",
        MSG_GRAB_FLAG => "GrabFlag",
        MSG_GM_UPDATE => "GMUpdate",
        MSG_KILLED => "Killed",
        MSG_MESSAGE => "Message",
        MSG_UDP_LINK_REQUEST => "UDPLinkRequest",
        MSG_UDP_LINK_ESTABLISHED => "UDPLinkEstablished",
        MSG_LAG_PING => "LagPing",
        MSG_PLAYER_UPDATE_SMALL => "PlayerUpdateSmall",
        MSG_PLAYER_UPDATE => "PlayerUpdate",
        MSG_REJECT => "Reject",
        MSG_REMOVE_PLAYER => "RemovePlayer",
        MSG_SHOT_BEGIN => "ShotBegin",
        MSG_SCORE => "Score",
        MSG_SHOT_END => "ShotEnd",
        MSG_SUPER_KILL => "SuperKill",
        MSG_TIME_UPDATE => "TimeUpdate",
        MSG_TELEPORT => "Teleport",
        MSG_WHAT_TIME_IS_IT => "WhatTimeIsIt",
        PING_CODE_REQUEST => "PingRequest",
        PING_CODE_REPLY => "PingReply",
        _ => "Unknown",
    }
}

/// Chat text is limited to printable ASCII.
pub fn is_printable_text(text: &[u8]) -> bool {
    text.iter().all(|&b| (0x20..0x7f).contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_ascii_mnemonics() {
        assert_eq!(MSG_PLAYER_UPDATE, 0x7075);
        assert_eq!(MSG_MESSAGE, 0x6d67);
        assert_eq!(MSG_UDP_LINK_REQUEST, 0x6f66);
        assert_eq!(MSG_UDP_LINK_ESTABLISHED, 0x6f67);
    }

    #[test]
    fn test_udp_allow_list() {
        assert!(is_udp_bulk(MSG_PLAYER_UPDATE));
        assert!(is_udp_bulk(MSG_SHOT_END));
        assert!(!is_udp_bulk(MSG_MESSAGE));
        assert!(!is_udp_bulk(MSG_SCORE));
        assert!(!is_udp_bulk(MSG_UDP_LINK_REQUEST));
        assert!(is_udp_acceptable(MSG_UDP_LINK_REQUEST));
        assert!(!is_udp_acceptable(MSG_KILLED));
    }

    #[test]
    fn test_printable_text() {
        assert!(is_printable_text(b"hello, world!"));
        assert!(!is_printable_text(b"bell\x07"));
        assert!(!is_printable_text(&[0xc3, 0xa9]));
    }

    #[test]
    fn test_code_names() {
        assert_eq!(code_name(MSG_SHOT_BEGIN), "ShotBegin");
        assert_eq!(code_name(0x1234), "Unknown");
    }
}
