// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Whitelist check in front of interactive commands

use std::collections::HashSet;
use tracing::info;

use crate::config::AccessConfig;

#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    allowed: HashSet<String>,
}

impl AccessGate {
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            allowed: config
                .user_whitelist
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
        }
    }

    /// Denials are logged only; the caller gets no reply.
    pub fn is_authorized(&self, user_id: Option<i64>) -> bool {
        let allowed = user_id.map_or(false, |id| self.allowed.contains(&id.to_string()));
        if !allowed {
            info!("Blocked access for user {:?}", user_id);
        }
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist() {
        let gate = AccessGate::new(&AccessConfig {
            user_whitelist: vec!["42".into(), " 7 ".into(), "".into()],
        });
        assert!(gate.is_authorized(Some(42)));
        assert!(gate.is_authorized(Some(7)));
        assert!(!gate.is_authorized(Some(8)));
        assert!(!gate.is_authorized(None));
    }

    #[test]
    fn test_empty_whitelist_denies_everyone() {
        let gate = AccessGate::default();
        assert!(!gate.is_authorized(Some(0)));
    }
}
