use serde::{Deserialize, Serialize};

/// Scheduling priority shared by tasks and messages.
///
/// Ordering follows urgency: `Critical > High > Normal > Low`. Messages carry
/// the numeric form (`1` = Low … `4` = Critical).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All levels, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Numeric level, `1` (Low) through `4` (Critical).
    pub fn level(self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// Inverse of [`Priority::level`]. Out-of-range levels yield `None`.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Priority::Low),
            2 => Some(Priority::Normal),
            3 => Some(Priority::High),
            4 => Some(Priority::Critical),
            _ => None,
        }
    }

    /// Position in [`Priority::ALL`]; `0` is drained first.
    pub fn rank(self) -> usize {
        (4 - self.level()) as usize
    }

    /// Lenient parse used for config files and CLI input. Unknown strings
    /// fall back to `Normal`.
    pub fn parse_level(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" | "4" => Priority::Critical,
            "high" | "3" => Priority::High,
            "low" | "1" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}
