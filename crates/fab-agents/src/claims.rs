//! Ticket claim table — enforces claim uniqueness: within one project's
//! orchestrator, at most one agent holds a given ticket at any instant.

use std::collections::HashMap;
use std::sync::Mutex;

use fab_core::error::{Error, Result};
use uuid::Uuid;

#[derive(Default)]
pub struct ClaimTable {
    claims: Mutex<HashMap<String, Uuid>>,
}

impl ClaimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `ticket` for `agent`. Returns `Conflict` if another agent
    /// already holds it; re-claiming by the current holder is a no-op.
    pub fn claim(&self, ticket: &str, agent: Uuid) -> Result<()> {
        let mut guard = self.claims.lock().unwrap();
        match guard.get(ticket) {
            Some(holder) if *holder != agent => Err(Error::Conflict(format!(
                "ticket {ticket} already claimed by {holder}"
            ))),
            _ => {
                guard.insert(ticket.to_string(), agent);
                Ok(())
            }
        }
    }

    pub fn release(&self, ticket: &str) {
        self.claims.lock().unwrap().remove(ticket);
    }

    pub fn release_all_for_agent(&self, agent: Uuid) {
        self.claims.lock().unwrap().retain(|_, a| *a != agent);
    }

    pub fn claimed_by(&self, ticket: &str) -> Option<Uuid> {
        self.claims.lock().unwrap().get(ticket).copied()
    }

    /// Snapshot of every active `(ticket, agent)` pair — consumed by the
    /// comment poller (§4.F), which must not hold this lock across its
    /// network calls.
    pub fn active(&self) -> Vec<(String, Uuid)> {
        self.claims
            .lock()
            .unwrap()
            .iter()
            .map(|(t, a)| (t.clone(), *a))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_claim_succeeds() {
        let table = ClaimTable::new();
        let agent = Uuid::new_v4();
        table.claim("ISSUE-1", agent).unwrap();
        assert_eq!(table.claimed_by("ISSUE-1"), Some(agent));
    }

    #[test]
    fn second_claim_by_different_agent_conflicts() {
        let table = ClaimTable::new();
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        table.claim("ISSUE-1", a1).unwrap();
        let err = table.claim("ISSUE-1", a2).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(table.claimed_by("ISSUE-1"), Some(a1));
    }

    #[test]
    fn reclaim_by_same_agent_is_ok() {
        let table = ClaimTable::new();
        let agent = Uuid::new_v4();
        table.claim("ISSUE-1", agent).unwrap();
        table.claim("ISSUE-1", agent).unwrap();
    }

    #[test]
    fn release_then_claim_by_other_succeeds() {
        let table = ClaimTable::new();
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        table.claim("ISSUE-1", a1).unwrap();
        table.release("ISSUE-1");
        table.claim("ISSUE-1", a2).unwrap();
        assert_eq!(table.claimed_by("ISSUE-1"), Some(a2));
    }

    #[test]
    fn concurrent_claims_exactly_one_winner() {
        use std::sync::Arc;
        let table = Arc::new(ClaimTable::new());
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        let t1 = table.clone();
        let h1 = std::thread::spawn(move || t1.claim("ISSUE-1", a1));
        let t2 = table.clone();
        let h2 = std::thread::spawn(move || t2.claim("ISSUE-1", a2));
        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();
        assert_ne!(r1.is_ok(), r2.is_ok());
        let winner = if r1.is_ok() { a1 } else { a2 };
        assert_eq!(table.claimed_by("ISSUE-1"), Some(winner));
    }

    #[test]
    fn release_all_for_agent_clears_every_ticket_they_hold() {
        let table = ClaimTable::new();
        let agent = Uuid::new_v4();
        table.claim("ISSUE-1", agent).unwrap();
        table.claim("ISSUE-2", agent).unwrap();
        table.release_all_for_agent(agent);
        assert_eq!(table.claimed_by("ISSUE-1"), None);
        assert_eq!(table.claimed_by("ISSUE-2"), None);
    }
}
