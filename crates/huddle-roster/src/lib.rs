//! Roster reconciliation for one conference call.
//!
//! Merges the three authoritative views of membership (the backend's
//! authorized client list, the SFT's live participant list, and the local
//! user) into a single member table, elects the keygenerator, tracks MLS
//! epochs, and merges audio levels.

mod member;
mod roster;

pub use member::{Member, MemberSnapshot};
pub use roster::{
    smooth_level, AudioLevel, Roster, RosterEvent, SeClient, SeUpdate, SftUpdate,
};
