//! Stage identity assignment.
//!
//! Child identities are UUIDv5 values namespaced by the parent's identity
//! and keyed by the child's declaration position. Re-evaluating the same
//! continuation therefore yields the same identities, which is what lets a
//! re-dispatched stage find its existing children instead of duplicating
//! them.

use pipewright_types::stage::StageId;
use uuid::Uuid;

/// Namespace for roots started with a caller-supplied idempotence key.
const ROOT_NAMESPACE: Uuid = Uuid::from_u128(0x6a2f_41c4_9d0e_4b7a_8c35_1f0e_d2b9_7e01);

/// Identity of the child declared at `position` under `parent`.
pub fn assign(parent: StageId, position: u32) -> StageId {
    StageId(Uuid::new_v5(&parent.0, &position.to_be_bytes()))
}

/// A fresh, time-ordered root identity.
pub fn new_root() -> StageId {
    StageId(Uuid::now_v7())
}

/// A deterministic root identity for an idempotence key.
pub fn root_from_key(key: &str) -> StageId {
    StageId(Uuid::new_v5(&ROOT_NAMESPACE, key.as_bytes()))
}
