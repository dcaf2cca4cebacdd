//! Client interests and the bookkeeping for in-flight interest operations.

use std::collections::{HashMap, HashSet};

use crate::channel::{DoId, Zone};
use crate::object::DistributedObject;

/// A standing request to observe objects at `(parent, z)` for every zone
/// in the set.
///
/// Interest ids are unique within a session. Two interests may overlap in
/// `(parent, zone)`; each contributes one reference to that cell's
/// visibility, and a cell stays subscribed while any interest covers it.
#[derive(Debug, Clone)]
pub struct Interest {
    pub id: u16,
    pub parent: DoId,
    pub zones: HashSet<Zone>,
}

impl Interest {
    pub fn new(id: u16, parent: DoId, zones: HashSet<Zone>) -> Self {
        Self { id, parent, zones }
    }

    /// Whether this interest covers the given cell.
    pub fn covers(&self, parent: DoId, zone: Zone) -> bool {
        self.parent == parent && self.zones.contains(&zone)
    }
}

/// Tracks completion of a newly opened or altered interest.
///
/// The state server answers an objects query with zero or more entry
/// messages and a count response, in either interleaving. The operation is
/// ready once the count has arrived and the projection holds that many
/// objects inside the requested zones.
#[derive(Debug)]
pub struct InterestOperation {
    interest_id: u16,
    client_context: u32,
    parent: DoId,
    zones: HashSet<Zone>,
    total: Option<u32>,
}

impl InterestOperation {
    pub fn new(
        interest_id: u16,
        client_context: u32,
        parent: DoId,
        zones: HashSet<Zone>,
    ) -> Self {
        Self {
            interest_id,
            client_context,
            parent,
            zones,
            total: None,
        }
    }

    pub fn interest_id(&self) -> u16 {
        self.interest_id
    }

    pub fn client_context(&self) -> u32 {
        self.client_context
    }

    /// Records the expected object count from the zones-count response.
    pub fn store_total(&mut self, count: u32) {
        self.total = Some(count);
    }

    /// Ready when the total is known and the projection holds at least that
    /// many objects located in the operation's zones.
    pub fn is_ready(&self, projection: &HashMap<DoId, DistributedObject>) -> bool {
        let Some(total) = self.total else {
            return false;
        };
        let present = projection
            .values()
            .filter(|obj| obj.parent == self.parent && self.zones.contains(&obj.zone))
            .count() as u32;
        present >= total
    }
}
