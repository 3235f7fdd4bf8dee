//! Cohort partitioning for canary rollouts.

use std::collections::HashMap;

use serde::Serialize;

use crate::agent::registry::CanaryGroup;
use crate::discovery::DiscoveredAgent;

/// Rollout order. `Unassigned` has no wave of its own; those agents roll
/// out with the general wave.
pub const WAVE_ORDER: [CanaryGroup; 3] = [
    CanaryGroup::Explorer,
    CanaryGroup::EarlyAdopter,
    CanaryGroup::General,
];

/// Target fleet share per cohort, used for operator-facing stats.
pub fn target_percentage(group: CanaryGroup) -> u8 {
    match group {
        CanaryGroup::Explorer => 10,
        CanaryGroup::EarlyAdopter => 20,
        CanaryGroup::General => 70,
        CanaryGroup::Unassigned => 0,
    }
}

#[derive(Debug)]
pub struct Wave {
    pub group: CanaryGroup,
    pub agents: Vec<DiscoveredAgent>,
}

/// Splits agents into ordered waves: explorer, early adopter, then general
/// (including unassigned). Empty waves are dropped.
pub fn partition_into_waves(agents: Vec<DiscoveredAgent>) -> Vec<Wave> {
    let mut by_group: HashMap<CanaryGroup, Vec<DiscoveredAgent>> = HashMap::new();
    for agent in agents {
        let group = match agent.canary_group {
            CanaryGroup::Unassigned => CanaryGroup::General,
            group => group,
        };
        by_group.entry(group).or_default().push(agent);
    }

    WAVE_ORDER
        .into_iter()
        .filter_map(|group| {
            by_group.remove(&group).map(|agents| Wave { group, agents })
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct GroupStats {
    pub count: usize,
    pub target_percentage: u8,
    pub actual_percentage: u32,
}

/// Per-cohort membership counts against the whole fleet.
pub fn group_stats(agents: &[DiscoveredAgent]) -> HashMap<&'static str, GroupStats> {
    let total = agents.len();
    [
        CanaryGroup::Explorer,
        CanaryGroup::EarlyAdopter,
        CanaryGroup::General,
        CanaryGroup::Unassigned,
    ]
    .into_iter()
    .map(|group| {
        let count = agents.iter().filter(|a| a.canary_group == group).count();
        let actual = if total > 0 {
            (count * 100 / total) as u32
        } else {
            0
        };
        (
            group.as_str(),
            GroupStats {
                count,
                target_percentage: target_percentage(group),
                actual_percentage: actual,
            },
        )
    })
    .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::identity::{AgentId, AgentIdentity, ServerId};
    use crate::container::ContainerStatus;

    pub(crate) fn agent(id: &str, group: CanaryGroup) -> DiscoveredAgent {
        DiscoveredAgent {
            identity: AgentIdentity {
                agent_id: AgentId::new(id).unwrap(),
                occurrence_id: None,
                server_id: ServerId::new("main").unwrap(),
            },
            display_name: id.to_string(),
            container_name: format!("fleet-{id}"),
            image: "agent:1.0.0".to_string(),
            status: ContainerStatus::Running,
            api_port: Some(18080),
            version: Some("1.0.0".to_string()),
            codename: None,
            code_hash: None,
            cognitive_state: None,
            canary_group: group,
            do_not_autostart: false,
            compose_file: None,
            registered: true,
        }
    }

    #[test]
    fn waves_follow_cohort_order() {
        let agents = vec![
            agent("gen", CanaryGroup::General),
            agent("exp", CanaryGroup::Explorer),
            agent("early", CanaryGroup::EarlyAdopter),
        ];
        let waves = partition_into_waves(agents);
        let order: Vec<CanaryGroup> = waves.iter().map(|w| w.group).collect();
        assert_eq!(
            order,
            vec![
                CanaryGroup::Explorer,
                CanaryGroup::EarlyAdopter,
                CanaryGroup::General
            ]
        );
    }

    #[test]
    fn unassigned_rolls_out_with_general() {
        let agents = vec![
            agent("floating", CanaryGroup::Unassigned),
            agent("gen", CanaryGroup::General),
        ];
        let waves = partition_into_waves(agents);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].group, CanaryGroup::General);
        assert_eq!(waves[0].agents.len(), 2);
    }

    #[test]
    fn empty_waves_are_dropped() {
        let waves = partition_into_waves(vec![agent("exp", CanaryGroup::Explorer)]);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].group, CanaryGroup::Explorer);
    }

    #[test]
    fn stats_count_each_cohort() {
        let agents = vec![
            agent("a", CanaryGroup::Explorer),
            agent("b", CanaryGroup::General),
            agent("c", CanaryGroup::General),
            agent("d", CanaryGroup::Unassigned),
        ];
        let stats = group_stats(&agents);
        assert_eq!(stats["explorer"].count, 1);
        assert_eq!(stats["general"].count, 2);
        assert_eq!(stats["unassigned"].count, 1);
        assert_eq!(stats["explorer"].actual_percentage, 25);
        assert_eq!(stats["general"].target_percentage, 70);
    }
}
