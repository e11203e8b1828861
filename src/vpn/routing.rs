//! Route table reconciliation for split-tunnel VPN
//!
//! A [`RouteSpace`] collects include/exclude prefixes in any order and
//! reduces them to a sorted, non-overlapping table in which every address
//! carries the flag of the most specific prefix that covered it.
//!
//! The reduction is a priority-queue sweep over the sorted entries. Each
//! queued range remembers the prefix length of the entry it was split from
//! (its authority), so that when pieces of different entries meet, the one
//! derived from the more specific entry wins regardless of insertion order.

use super::address::AddressRange;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Could not parse netmask of route: {0}")]
    InvalidNetmask(String),
    #[error("Prefix length {prefix} exceeds address width {width}")]
    InvalidPrefix { prefix: u8, width: u8 },
    #[error("Local IP address unset, cannot add route {0}")]
    LocalAddressUnset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Claim {
    included: bool,
    authority: u8,
}

impl Claim {
    fn of(range: &AddressRange) -> Self {
        Self {
            included: range.included(),
            authority: range.prefix_len(),
        }
    }

    /// Identical extents: the more specific origin wins, then exclusion.
    fn outranks(&self, other: &Claim) -> bool {
        self.authority > other.authority
            || (self.authority == other.authority && !self.included && other.included)
    }
}

type Queue = BTreeMap<AddressRange, Claim>;

fn offer(queue: &mut Queue, range: AddressRange, claim: Claim) {
    match queue.entry(range) {
        Entry::Vacant(slot) => {
            slot.insert(claim);
        }
        Entry::Occupied(mut slot) => {
            if claim.outranks(slot.get()) {
                slot.insert(claim);
            }
        }
    }
}

/// Unordered bag of include/exclude ranges
#[derive(Debug, Clone, Default)]
pub struct RouteSpace {
    entries: Vec<AddressRange>,
}

impl RouteSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range keeping its own `included` flag
    pub fn add(&mut self, range: AddressRange) {
        self.entries.push(range);
    }

    pub fn add_include(&mut self, range: AddressRange) {
        self.add(range.with_included(true));
    }

    pub fn add_exclude(&mut self, range: AddressRange) {
        self.add(range.with_included(false));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Raw entries with the given flag, as added
    pub fn networks(&self, included: bool) -> Vec<AddressRange> {
        self.entries
            .iter()
            .filter(|r| r.included() == included)
            .copied()
            .collect()
    }

    /// Sorted, non-overlapping table covering every address that any entry
    /// covers.
    pub fn reconciled(&self) -> BTreeSet<AddressRange> {
        let mut queue = Queue::new();
        for range in self.without_redundant() {
            offer(&mut queue, range, Claim::of(&range));
        }

        let mut table = BTreeSet::new();
        let mut current = queue.pop_first();

        while let Some((range, claim)) = current {
            let next = queue.first_key_value().map(|(r, c)| (*r, *c));

            current = match next {
                Some((next, next_claim)) if range.overlaps(&next) => {
                    if next.prefix_len() == range.prefix_len() {
                        // Same extent queued twice
                        if next_claim.outranks(&claim) {
                            queue.pop_first()
                        } else {
                            queue.pop_first();
                            Some((range, claim))
                        }
                    } else if range.first() == next.first() {
                        // `range` sits at the start of the larger `next`
                        if next_claim.authority > claim.authority {
                            queue.pop_first()
                        } else {
                            queue.pop_first();
                            match next.split() {
                                Some((lower, upper)) => {
                                    offer(&mut queue, upper, next_claim);
                                    if lower != range {
                                        offer(&mut queue, lower, next_claim);
                                    }
                                }
                                None => error!("Cannot split {} around {}", next, range),
                            }
                            Some((range, claim))
                        }
                    } else if claim.authority > next_claim.authority {
                        // `next` lies inside `range` and is overridden by it
                        queue.pop_first();
                        Some((range, claim))
                    } else {
                        match range.split() {
                            Some((lower, upper)) => {
                                offer(&mut queue, upper, claim);
                                Some((lower, claim))
                            }
                            None => {
                                error!("Cannot split {} around {}", range, next);
                                table.insert(range.with_included(claim.included));
                                queue.pop_first()
                            }
                        }
                    }
                }
                _ => {
                    table.insert(range.with_included(claim.included));
                    queue.pop_first()
                }
            };
        }

        debug!(
            "Reconciled {} route entries into {} ranges",
            self.entries.len(),
            table.len()
        );
        table
    }

    /// Included ranges of the reconciled table
    pub fn positive_routes(&self) -> Vec<AddressRange> {
        self.reconciled()
            .into_iter()
            .filter(|r| r.included())
            .collect()
    }

    /// Drop entries whose closest enclosing entry carries the same flag.
    /// Identical extents are resolved first so the result does not depend
    /// on insertion order.
    fn without_redundant(&self) -> Vec<AddressRange> {
        let mut unique = Queue::new();
        for range in &self.entries {
            let mut range = *range;
            range.normalize();
            offer(&mut unique, range, Claim::of(&range));
        }

        let mut outer_first: Vec<AddressRange> = unique
            .into_iter()
            .map(|(range, claim)| range.with_included(claim.included))
            .collect();
        outer_first.sort_by_key(|r| (r.family(), r.first(), r.prefix_len()));

        let mut enclosing: Vec<AddressRange> = Vec::new();
        let mut kept = Vec::with_capacity(outer_first.len());
        for range in outer_first {
            while let Some(top) = enclosing.last() {
                if top.contains(&range) {
                    break;
                }
                enclosing.pop();
            }
            let redundant = enclosing
                .last()
                .is_some_and(|parent| parent.included() == range.included());
            if !redundant {
                kept.push(range);
            }
            enclosing.push(range);
        }
        kept
    }
}

impl FromIterator<AddressRange> for RouteSpace {
    fn from_iter<I: IntoIterator<Item = AddressRange>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
