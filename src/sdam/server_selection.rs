use crate::{
    sdam::description::{ServerDescription, ServerType, TopologyType},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

/// The servers among `servers` that may run an operation with `criteria` in a topology of the
/// given type.
pub(crate) fn suitable_servers<'a>(
    topology_type: TopologyType,
    servers: &[&'a ServerDescription],
    criteria: &SelectionCriteria,
) -> Vec<&'a ServerDescription> {
    let read_preference = match criteria {
        SelectionCriteria::ReadPreference(read_preference) => read_preference,
        SelectionCriteria::Predicate(predicate) => {
            // A direct connection uses its one server whatever its type.
            return servers
                .iter()
                .copied()
                .filter(|server| {
                    (topology_type == TopologyType::Single || server.server_type.is_data_bearing())
                        && predicate(server)
                })
                .collect();
        }
    };

    match topology_type {
        TopologyType::Single => servers.to_vec(),
        TopologyType::Sharded => of_type(servers, &[ServerType::Mongos]),
        replica_set if replica_set.is_replica_set() => in_replica_set(servers, read_preference),
        _ => Vec::new(),
    }
}

fn in_replica_set<'a>(
    servers: &[&'a ServerDescription],
    read_preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let primary = || of_type(servers, &[ServerType::RsPrimary]);
    let secondaries = || tagged(of_type(servers, &[ServerType::RsSecondary]), read_preference);

    match read_preference {
        ReadPreference::Primary => primary(),
        ReadPreference::Secondary { .. } => secondaries(),
        ReadPreference::PrimaryPreferred { .. } => Some(primary())
            .filter(|found| !found.is_empty())
            .unwrap_or_else(secondaries),
        ReadPreference::SecondaryPreferred { .. } => Some(secondaries())
            .filter(|found| !found.is_empty())
            .unwrap_or_else(primary),
        ReadPreference::Nearest { .. } => tagged(
            of_type(servers, &[ServerType::RsPrimary, ServerType::RsSecondary]),
            read_preference,
        ),
    }
}

fn of_type<'a>(
    servers: &[&'a ServerDescription],
    types: &[ServerType],
) -> Vec<&'a ServerDescription> {
    servers
        .iter()
        .copied()
        .filter(|server| types.contains(&server.server_type))
        .collect()
}

/// Keeps the servers matching the first tag set that any server matches. Staleness is not
/// tracked without monitoring, so a max staleness filters nothing.
fn tagged<'a>(
    candidates: Vec<&'a ServerDescription>,
    read_preference: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let tag_sets: &[TagSet] = match read_preference.tag_sets() {
        Some(tag_sets) if !tag_sets.is_empty() => tag_sets,
        _ => return candidates,
    };

    tag_sets
        .iter()
        .map(|tag_set| {
            candidates
                .iter()
                .copied()
                .filter(|server| server.matches_tag_set(tag_set))
                .collect::<Vec<_>>()
        })
        .find(|matching| !matching.is_empty())
        .unwrap_or_default()
}
