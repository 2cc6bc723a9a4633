//! Group hierarchy and transitive membership.
//!
//! Groups form a forest through `subgroupof` links. An account owned by group
//! G is a member of G and of every ancestor of G, so a grant targeting a
//! parent group covers all accounts of its subgroups.

use std::collections::{BTreeMap, BTreeSet};

use keysystem_core::{GroupName, PolicyError, PolicyResult, Principal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: GroupName,
    pub subgroup_of: Option<GroupName>,
    /// Accounts owned by this group or any of its descendants.
    pub all_members: BTreeSet<Principal>,
}

/// Immutable group graph with cached membership closures.
#[derive(Debug, Clone, Default)]
pub struct GroupGraph {
    groups: BTreeMap<GroupName, Group>,
}

impl GroupGraph {
    /// Build the graph.
    ///
    /// Fails on duplicate group names, unknown parents, `subgroupof` cycles
    /// and accounts that reference unknown groups.
    pub fn build<'a, G, A>(groups: G, accounts: A) -> PolicyResult<Self>
    where
        G: IntoIterator<Item = (GroupName, Option<GroupName>)>,
        A: IntoIterator<Item = (&'a Principal, &'a GroupName)>,
    {
        let mut map: BTreeMap<GroupName, Group> = BTreeMap::new();
        for (name, subgroup_of) in groups {
            if map.contains_key(&name) {
                return Err(PolicyError::config(format!("duplicate group '{name}'")));
            }
            map.insert(
                name.clone(),
                Group {
                    name,
                    subgroup_of,
                    all_members: BTreeSet::new(),
                },
            );
        }

        for group in map.values() {
            if let Some(parent) = &group.subgroup_of {
                if !map.contains_key(parent) {
                    return Err(PolicyError::config(format!(
                        "group '{}' is a subgroup of unknown group '{parent}'",
                        group.name
                    )));
                }
            }
        }

        let mut graph = Self { groups: map };
        graph.check_acyclic()?;

        for (principal, group) in accounts {
            if !graph.groups.contains_key(group) {
                return Err(PolicyError::config(format!(
                    "account '{principal}' belongs to unknown group '{group}'"
                )));
            }
            let chain: Vec<GroupName> = graph.ancestors(group).cloned().collect();
            for name in chain {
                if let Some(g) = graph.groups.get_mut(&name) {
                    g.all_members.insert(principal.clone());
                }
            }
        }

        Ok(graph)
    }

    fn check_acyclic(&self) -> PolicyResult<()> {
        // Nodes already proven to reach a root.
        let mut settled: BTreeSet<&GroupName> = BTreeSet::new();

        for start in self.groups.keys() {
            let mut path: Vec<&GroupName> = Vec::new();
            let mut current = Some(start);
            while let Some(name) = current {
                if settled.contains(name) {
                    break;
                }
                if let Some(pos) = path.iter().position(|n| *n == name) {
                    let cycle: Vec<String> = path[pos..]
                        .iter()
                        .chain(std::iter::once(&name))
                        .map(|n| n.to_string())
                        .collect();
                    return Err(PolicyError::config(format!(
                        "subgroupof cycle: {}",
                        cycle.join(" -> ")
                    )));
                }
                path.push(name);
                current = self.groups.get(name).and_then(|g| g.subgroup_of.as_ref());
            }
            settled.extend(path);
        }
        Ok(())
    }

    /// The group itself followed by its parent chain up to the root.
    pub fn ancestors<'a>(&'a self, group: &'a GroupName) -> impl Iterator<Item = &'a GroupName> {
        let mut next = self.groups.get(group).map(|g| &g.name);
        std::iter::from_fn(move || {
            let current = next?;
            next = self
                .groups
                .get(current)
                .and_then(|g| g.subgroup_of.as_ref());
            Some(current)
        })
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Transitive membership closure of `group`.
    pub fn resolve_members(&self, group: &str) -> PolicyResult<&BTreeSet<Principal>> {
        self.groups
            .get(group)
            .map(|g| &g.all_members)
            .ok_or_else(|| PolicyError::not_found(format!("group '{group}'")))
    }

    pub fn is_member(&self, principal: &Principal, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|g| g.all_members.contains(principal))
    }
}
