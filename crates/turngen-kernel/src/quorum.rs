//! Ready quorum: every agent in the realm's roster holds a Ready mark.

use std::collections::HashSet;

use crate::identity::AgentRef;
use crate::models::Ready;

/// True when `roster` is non-empty and every member appears in `readies`.
/// Marks from agents outside the roster are ignored.
pub fn is_ready(roster: &[AgentRef], readies: &[Ready]) -> bool {
    if roster.is_empty() {
        return false;
    }
    let marked: HashSet<&AgentRef> = readies.iter().map(|r| &r.agent).collect();
    roster.iter().all(|agent| marked.contains(agent))
}

/// Roster members without a Ready mark, in roster order.
pub fn waiting_on<'a>(roster: &'a [AgentRef], readies: &[Ready]) -> Vec<&'a AgentRef> {
    let marked: HashSet<&AgentRef> = readies.iter().map(|r| &r.agent).collect();
    roster.iter().filter(|a| !marked.contains(a)).collect()
}
