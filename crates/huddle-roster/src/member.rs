use serde::Serialize;

use huddle_core::{AudioState, ClientId, IdHash, UserId, VideoState};

/// Position marker for members absent from the current SFT list.
pub const LIST_POS_NONE: u32 = u32::MAX;

/// One roster entry.
///
/// A member created from an SFT snapshot before the SE list confirmed it is
/// "hash-only": the real identity is unknown until `update_from_se_list`
/// promotes it.
#[derive(Debug, Clone)]
pub struct Member {
    pub userid: Option<UserId>,
    pub clientid: Option<ClientId>,
    pub userid_hash: IdHash,
    pub clientid_hash: IdHash,

    pub ssrca: u32,
    pub ssrcv: u32,
    pub video_state: VideoState,
    pub muted: bool,

    /// This member should receive the session key on the next distribution
    /// pass.
    pub needs_key: bool,

    pub incall_now: bool,
    pub incall_prev: bool,
    /// Present in the backend's authorized client list.
    pub se_approved: bool,
    pub was_se_approved: bool,
    /// Member of the MLS subconversation this call rides on.
    pub in_subconv: bool,
    pub was_in_subconv: bool,
    /// Reinstall decoders on the next SFT snapshot even though the member
    /// never formally left (set across reconnects).
    pub force_decoder: bool,

    /// Latest MLS epoch this member reports having installed.
    pub latest_epoch: u32,
    /// Epoch at which the member entered the subconversation.
    pub first_epoch: u32,

    pub active_audio: bool,
    pub active_prev: bool,

    /// Position in the SFT's participant list; drives election order.
    pub listpos: u32,
}

impl Member {
    pub fn hash_only(userid_hash: IdHash, clientid_hash: IdHash) -> Self {
        Self {
            userid: None,
            clientid: None,
            userid_hash,
            clientid_hash,
            ssrca: 0,
            ssrcv: 0,
            video_state: VideoState::Stopped,
            muted: false,
            needs_key: false,
            incall_now: false,
            incall_prev: false,
            se_approved: false,
            was_se_approved: false,
            in_subconv: false,
            was_in_subconv: false,
            force_decoder: false,
            latest_epoch: 0,
            first_epoch: 0,
            active_audio: false,
            active_prev: false,
            listpos: LIST_POS_NONE,
        }
    }

    pub fn with_identity(userid: UserId, clientid: ClientId) -> Self {
        let mut m = Self::hash_only(IdHash::default(), IdHash::default());
        m.userid = Some(userid);
        m.clientid = Some(clientid);
        m
    }

    pub fn has_identity(&self) -> bool {
        self.userid.is_some() && self.clientid.is_some()
    }

    pub fn matches_real(&self, userid: &UserId, clientid: &ClientId) -> bool {
        match (&self.userid, &self.clientid) {
            (Some(u), Some(c)) => u.eq_ignore_case(userid) && c.eq_ignore_case(clientid),
            _ => false,
        }
    }

    pub fn matches_hash(&self, userid_hash: &IdHash, clientid_hash: &IdHash) -> bool {
        !self.userid_hash.is_empty()
            && self.userid_hash.eq_ignore_case(userid_hash)
            && self.clientid_hash.eq_ignore_case(clientid_hash)
    }
}

/// Host-facing member snapshot returned by `get_members`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberSnapshot {
    pub userid: UserId,
    pub clientid: ClientId,
    pub audio_state: AudioState,
    pub video_state: VideoState,
    pub muted: bool,
}
