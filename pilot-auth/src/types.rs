use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The human's answer to a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Once,
    Always,
    Reject,
}

impl Decision {
    pub const ALL: [Decision; 3] = [Decision::Once, Decision::Always, Decision::Reject];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Always => "always",
            Self::Reject => "reject",
        }
    }

    /// Button label used in push notifications.
    pub fn label(self) -> &'static str {
        match self {
            Self::Once => "Allow Once",
            Self::Always => "Allow Always",
            Self::Reject => "Reject",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(Self::Once),
            "always" => Ok(Self::Always),
            "reject" => Ok(Self::Reject),
            other => Err(AuthError::InvalidDecision(other.to_string())),
        }
    }
}

/// What a valid credential authorizes: one decision for one pending request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialClaims {
    pub session_id: String,
    pub permission_id: String,
}

#[cfg(test)]
mod tests {
    use super::Decision;

    #[test]
    fn decision_parses_only_the_closed_set() {
        for decision in Decision::ALL {
            assert_eq!(decision.as_str().parse::<Decision>(), Ok(decision));
        }
        assert!("maybe".parse::<Decision>().is_err());
        assert!("ONCE".parse::<Decision>().is_err());
        assert!("".parse::<Decision>().is_err());
    }

    #[test]
    fn decision_serializes_lowercase() {
        let json = serde_json::to_string(&Decision::Always).expect("serialize");
        assert_eq!(json, "\"always\"");
    }
}
