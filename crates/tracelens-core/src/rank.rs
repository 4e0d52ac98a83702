//! Root-cause ranking
//!
//! Selects the mutated node of a trace tree (slow requests) or error tree
//! (failed requests), marks it and flags the path from the root.

use crate::error::{ApmError, ApmResult};
use crate::tree::{ErrorTree, TraceTree, TreeNode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Ranking strategy for trace trees
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationMode {
    /// Best single node by anomaly score
    #[serde(rename = "single")]
    Single,
    /// Best (service, url) group
    #[serde(rename = "maxService")]
    MaxService,
    /// First profiled representative among the three best groups
    #[default]
    #[serde(rename = "top3Service")]
    Top3Service,
}

type RankFn = fn(&TraceTree, &str, u64) -> ApmResult<usize>;

impl MutationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationMode::Single => "single",
            MutationMode::MaxService => "maxService",
            MutationMode::Top3Service => "top3Service",
        }
    }

    fn strategy(self) -> RankFn {
        match self {
            MutationMode::Single => rank_single,
            MutationMode::MaxService => rank_max_service,
            MutationMode::Top3Service => rank_top3_service,
        }
    }
}

impl fmt::Display for MutationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(MutationMode::Single),
            "maxService" => Ok(MutationMode::MaxService),
            "top3Service" => Ok(MutationMode::Top3Service),
            other => Err(format!("unknown mutate node mode: {}", other)),
        }
    }
}

fn to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

fn percent_of(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part * 100) as f64 / total as f64
    }
}

/// Select, mark and path-flag the mutated node of a trace tree
pub fn find_mutated_node(
    tree: &mut TraceTree,
    trace_id: &str,
    ratio_threshold: u32,
    mode: MutationMode,
) -> ApmResult<usize> {
    if tree.is_empty() {
        return Err(ApmError::NoCandidate(trace_id.to_string()));
    }
    tree.calc_all_mutated_values();

    let threshold = tree.get(0).info.total_time * ratio_threshold as u64 / 100;
    let selected = (mode.strategy())(tree, trace_id, threshold)?;

    tree.get_mut(selected).info.is_mutated = true;
    tree.mark_path(selected);
    debug!(
        trace_id,
        mode = %mode,
        span_id = %tree.get(selected).info.span_id,
        "Selected mutated node"
    );
    Ok(selected)
}

/// Indices sorted by descending anomaly score, ties kept in tree order
fn sort_by_score(tree: &TraceTree, indices: &mut [usize]) {
    indices.sort_by(|&a, &b| tree.get(b).mutated_value().cmp(&tree.get(a).mutated_value()));
}

fn rank_single(tree: &TraceTree, trace_id: &str, threshold: u64) -> ApmResult<usize> {
    let skip_root = tree.has_virtual_child(0);
    let mut candidates: Vec<usize> = (0..tree.len())
        .filter(|&i| !(skip_root && i == 0))
        .collect();
    sort_by_score(tree, &mut candidates);

    let Some(&top) = candidates.first() else {
        return Err(ApmError::NoCandidate(trace_id.to_string()));
    };
    let node = tree.get(top);
    if node.mutated_value() > 0 {
        if node.self_time >= threshold {
            return Ok(top);
        }
        return Err(ApmError::InsufficientRatio {
            instance: node.info.id.clone(),
            self_time_ms: to_ms(node.self_time),
            percent: percent_of(node.self_time, tree.get(0).info.total_time),
        });
    }
    Err(ApmError::NotMutated {
        instance: node.info.id.clone(),
        url: node.info.url.clone(),
        mutated_value: node.mutated_value(),
        self_time: node.self_time,
    })
}

/// Mutated nodes sharing a service and url
#[derive(Debug, Clone)]
struct ServiceGroup {
    service_name: String,
    url: String,
    mutated_value: i64,
    self_time: u64,
    members: Vec<usize>,
}

/// Group positively scored nodes by (service, url), best group first
fn service_groups(tree: &TraceTree) -> Vec<ServiceGroup> {
    let mut groups: Vec<ServiceGroup> = Vec::new();
    for (index, node) in tree.iter() {
        if node.mutated_value() <= 0 {
            continue;
        }
        let position = groups
            .iter()
            .position(|g| g.service_name == node.info.service_name && g.url == node.info.url);
        let group = match position {
            Some(p) => &mut groups[p],
            None => {
                groups.push(ServiceGroup {
                    service_name: node.info.service_name.clone(),
                    url: node.info.url.clone(),
                    mutated_value: 0,
                    self_time: 0,
                    members: Vec::new(),
                });
                let last = groups.len() - 1;
                &mut groups[last]
            }
        };
        group.self_time += node.self_time;
        group.mutated_value += node.mutated_value();
        group.members.push(index);
    }
    groups.sort_by(|a, b| b.mutated_value.cmp(&a.mutated_value));
    groups
}

/// Pick a group member, preferring a profiled one close to the top share.
/// Returns the member and whether it is profiled.
fn representative(tree: &TraceTree, group: &ServiceGroup) -> (usize, bool) {
    let mut members = group.members.clone();
    sort_by_score(tree, &mut members);

    let top = members[0];
    if tree.get(top).info.is_profiled {
        return (top, true);
    }
    if group.self_time == 0 {
        return (top, false);
    }

    let share = |index: usize| tree.get(index).self_time * 100 / group.self_time;
    let top_percent = share(top);
    let window = match top_percent {
        p if p >= 55 => return (top, false),
        p if p >= 40 => 10,
        p if p >= 20 => 5,
        _ => 2,
    };

    for &member in &members[1..] {
        if share(member) + window < top_percent {
            break;
        }
        if tree.get(member).info.is_profiled {
            return (member, true);
        }
    }
    (top, false)
}

fn rank_max_service(tree: &TraceTree, trace_id: &str, threshold: u64) -> ApmResult<usize> {
    let groups = service_groups(tree);
    let Some(group) = groups.first() else {
        return Err(ApmError::NoMutatedService(trace_id.to_string()));
    };

    if group.self_time < threshold {
        return Err(ApmError::InsufficientServiceRatio {
            service: group.service_name.clone(),
            self_time_ms: to_ms(group.self_time),
            percent: percent_of(group.self_time, tree.get(0).info.total_time),
        });
    }

    let (selected, _) = representative(tree, group);
    let node = tree.get(selected);
    if node.mutated_value() > 0 {
        return Ok(selected);
    }
    Err(ApmError::NotMutated {
        instance: node.info.id.clone(),
        url: node.info.url.clone(),
        mutated_value: node.mutated_value(),
        self_time: node.self_time,
    })
}

fn rank_top3_service(tree: &TraceTree, trace_id: &str, threshold: u64) -> ApmResult<usize> {
    let groups = service_groups(tree);
    if groups.is_empty() {
        return Err(ApmError::NoMutatedService(trace_id.to_string()));
    }

    let total = tree.get(0).info.total_time;
    let mut last = None;
    for (rank, group) in groups.iter().take(3).enumerate() {
        if group.self_time < threshold {
            warn!(
                trace_id,
                rank = rank + 1,
                service = %group.service_name,
                self_time_ms = %format!("{:.2}", to_ms(group.self_time)),
                percent = %format!("{:.2}", percent_of(group.self_time, total)),
                "Top service has not enough duration ratio"
            );
            continue;
        }

        let (selected, profiled) = representative(tree, group);
        if tree.get(selected).mutated_value() > 0 && profiled {
            return Ok(selected);
        }
        last = Some(selected);
    }

    match last {
        Some(index) => Err(ApmError::NotProfiled(tree.get(index).info.id.clone())),
        None => Err(ApmError::NoQualifiedService(trace_id.to_string())),
    }
}

/// Select the deepest erroring node of an error tree, mark it and flag its path
pub fn find_root_cause_error_node(tree: &mut ErrorTree, trace_id: &str) -> ApmResult<usize> {
    let mut errors: Vec<usize> = tree
        .iter()
        .filter(|(_, n)| n.is_error)
        .map(|(i, _)| i)
        .collect();
    errors.sort_by(|&a, &b| tree.get(b).depth.cmp(&tree.get(a).depth));

    let Some(&deepest) = errors.first() else {
        return Err(ApmError::NoErrorNode(trace_id.to_string()));
    };
    if !tree.get(deepest).info().is_traced {
        return Err(ApmError::Untraceable {
            trace_id: trace_id.to_string(),
            span_id: tree.get(deepest).info().span_id.clone(),
        });
    }

    tree.get_mut(deepest).info_mut().is_mutated = true;
    tree.mark_path(deepest);
    Ok(deepest)
}
