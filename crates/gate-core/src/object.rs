//! Projection entries: the objects a single client currently knows about.

use std::sync::Arc;

use crate::channel::{DoId, Zone};
use crate::dclass::DcClass;

/// One server object as projected into a client session.
///
/// The class reference is fixed for the lifetime of the entry; parent and
/// zone track the object's current location.
#[derive(Debug, Clone)]
pub struct DistributedObject {
    pub id: DoId,
    pub parent: DoId,
    pub zone: Zone,
    pub class: Arc<DcClass>,
}
