//! Hex-packed server description carried in list-server records.

pub const TEAM_COUNT: usize = 5;

/// Characters in a packed game info string.
pub const GAME_INFO_HEX_LEN: usize = 18 * 4;

/// Character offset of the five team player counts.
pub const COUNTS_OFFSET: usize = 3 * 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GameInfo {
    pub game_style: u16,
    pub max_players: u16,
    pub max_shots: u16,
    pub team_counts: [u16; TEAM_COUNT],
    pub team_max: [u16; TEAM_COUNT],
    pub shake_wins: u16,
    pub shake_timeout: u16,
    pub max_player_score: u16,
    pub max_team_score: u16,
    pub max_time: u16,
}

impl GameInfo {
    fn fields(&self) -> [u16; 18] {
        let mut fields = [0u16; 18];
        fields[0] = self.game_style;
        fields[1] = self.max_players;
        fields[2] = self.max_shots;
        fields[3..8].copy_from_slice(&self.team_counts);
        fields[8..13].copy_from_slice(&self.team_max);
        fields[13] = self.shake_wins;
        fields[14] = self.shake_timeout;
        fields[15] = self.max_player_score;
        fields[16] = self.max_team_score;
        fields[17] = self.max_time;
        fields
    }

    pub fn to_hex(&self) -> String {
        self.fields().iter().map(|v| format!("{v:04x}")).collect()
    }

    pub fn from_hex(text: &str) -> Option<Self> {
        if text.len() < GAME_INFO_HEX_LEN || !text.is_ascii() {
            return None;
        }
        let mut fields = [0u16; 18];
        for (i, field) in fields.iter_mut().enumerate() {
            *field = u16::from_str_radix(&text[i * 4..i * 4 + 4], 16).ok()?;
        }
        let mut info = GameInfo {
            game_style: fields[0],
            max_players: fields[1],
            max_shots: fields[2],
            shake_wins: fields[13],
            shake_timeout: fields[14],
            max_player_score: fields[15],
            max_team_score: fields[16],
            max_time: fields[17],
            ..GameInfo::default()
        };
        info.team_counts.copy_from_slice(&fields[3..8]);
        info.team_max.copy_from_slice(&fields[8..13]);
        Some(info)
    }

    pub fn player_count(&self) -> u32 {
        self.team_counts.iter().map(|&c| u32::from(c)).sum()
    }
}

/// Rewrites the five player counts in a packed string in place. Returns
/// false, leaving it untouched, when the string is too short or not ASCII.
pub fn repack_counts(info: &mut String, counts: &[u16; TEAM_COUNT]) -> bool {
    let end = COUNTS_OFFSET + TEAM_COUNT * 4;
    if info.len() < end || !info.is_ascii() {
        return false;
    }
    let packed: String = counts.iter().map(|v| format!("{v:04x}")).collect();
    info.replace_range(COUNTS_OFFSET..end, &packed);
    true
}
