pub mod record;
pub mod store;

pub use record::ClaimRecord;
pub use store::{ClaimInfo, ClaimOutcome, SlotClaimStore};
