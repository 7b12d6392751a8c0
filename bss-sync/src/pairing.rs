//! Proposals and ESAFs that cover the same people.
//!
//! A proposal is paired with every ESAF whose badge set equals its own.
//! Records without users never pair.

use std::collections::{BTreeMap, BTreeSet};

use bss_core::{Esaf, EsafId, Proposal, ProposalId, UserList};

fn badges(users: &UserList) -> BTreeSet<&str> {
    users
        .all()
        .iter()
        .map(|u| u.badge.trim())
        .filter(|b| !b.is_empty())
        .collect()
}

/// Proposal id → ids of ESAFs with the same badges, both sorted ascending.
/// Proposals with no matching ESAF are left out.
pub fn pair_by_badges(proposals: &[Proposal], esafs: &[Esaf]) -> BTreeMap<ProposalId, Vec<EsafId>> {
    let esaf_badges: Vec<(EsafId, BTreeSet<&str>)> = esafs
        .iter()
        .map(|e| (e.id, badges(&e.users)))
        .filter(|(_, b)| !b.is_empty())
        .collect();

    let mut pairs = BTreeMap::new();
    for proposal in proposals {
        let wanted = badges(&proposal.users);
        if wanted.is_empty() {
            continue;
        }
        let matched: Vec<EsafId> = esaf_badges
            .iter()
            .filter(|(_, b)| *b == wanted)
            .map(|(id, _)| *id)
            .collect();
        if matched.is_empty() {
            continue;
        }
        pairs
            .entry(proposal.id)
            .or_insert_with(Vec::new)
            .extend(matched);
    }
    for ids in pairs.values_mut() {
        ids.sort_unstable();
        ids.dedup();
    }
    pairs
}
