//! Health aggregation over check snapshots.
//!
//! A stateless query layer: select checks by level and name, report
//! healthy only when every selected check is up. An empty selection is
//! healthy. The HTTP facade maps the boolean onto 200 or 502.

use crate::{
    checks::{CheckInfo, CheckManager, CheckStatus},
    plan::CheckLevel,
};

/// Whether every check in the snapshot is up.
pub fn all_up(infos: &[CheckInfo]) -> bool {
    infos.iter().all(|info| info.status == CheckStatus::Up)
}

/// Selects checks by level and names and reports aggregate health.
pub fn healthy(manager: &CheckManager, level: CheckLevel, names: &[String]) -> bool {
    all_up(&manager.checks(level, names))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, level: CheckLevel, status: CheckStatus) -> CheckInfo {
        CheckInfo {
            name: name.to_string(),
            level,
            status,
            failures: match status {
                CheckStatus::Up => 0,
                CheckStatus::Down => 3,
            },
            threshold: 3,
            change_id: None,
            last_error: None,
        }
    }

    #[test]
    fn empty_selection_is_healthy() {
        assert!(all_up(&[]));
    }

    #[test]
    fn one_down_check_fails_the_query() {
        let infos = vec![
            info("a", CheckLevel::Alive, CheckStatus::Up),
            info("b", CheckLevel::Ready, CheckStatus::Down),
        ];
        assert!(!all_up(&infos));
    }

    #[test]
    fn all_up_checks_pass_the_query() {
        let infos = vec![
            info("a", CheckLevel::Alive, CheckStatus::Up),
            info("b", CheckLevel::Unset, CheckStatus::Up),
        ];
        assert!(all_up(&infos));
    }
}
