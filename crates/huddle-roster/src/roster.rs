use tracing::{debug, info, warn};

use huddle_core::{hash, ClientId, IdHash, MutedState, UserId, VideoState};
use huddle_signal::PartMember;

use crate::member::{Member, MemberSnapshot, LIST_POS_NONE};

/// Decay-side smoothing factor for audio levels.
pub const LEVEL_DECAY: f32 = 0.1;

/// Exponential smoothing: rises immediately, decays at [`LEVEL_DECAY`].
pub fn smooth_level(prev: f32, level: f32) -> f32 {
    if level >= prev {
        level
    } else {
        prev + (level - prev) * LEVEL_DECAY
    }
}

/// One entry of the SE (backend authorized-client) list.
#[derive(Debug, Clone)]
pub struct SeClient {
    pub userid: UserId,
    pub clientid: ClientId,
    pub in_subconv: bool,
}

/// One entry of a host-delivered audio level report.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioLevel {
    pub userid: UserId,
    pub clientid: ClientId,
    pub level: i32,
    pub level_smoothed: f32,
}

/// Outcome of reconciling an SFT participant snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SftUpdate {
    pub list_changed: bool,
    pub self_changed: bool,
    /// A member appeared in the SFT list with no matching SE entry; the
    /// controller should request a fresh SE list.
    pub missing_parts: bool,
}

/// Outcome of reconciling the SE list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeUpdate {
    pub changed: bool,
    /// Someone lost approval or left the subconversation; the keygenerator
    /// should rotate faster.
    pub removed: bool,
}

/// Side effects of a reconciliation pass, drained by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum RosterEvent {
    /// An approved member joined: install decoders for their SSRCs.
    AddUser {
        userid: UserId,
        clientid: ClientId,
        userid_hash: IdHash,
        ssrca: u32,
        ssrcv: u32,
        video_state: VideoState,
    },
    /// A member left or changed SSRCs: remove decoders.
    RemoveUser {
        userid: UserId,
        clientid: ClientId,
        ssrca: u32,
        ssrcv: u32,
        video_state: VideoState,
        /// Whether the host should additionally see their video stop.
        fire_vstate: bool,
    },
    /// Decoder set changed; the media session should resynchronise.
    SyncMembers,
    /// The elected keygenerator changed.
    KeygenChanged { is_me: bool, is_first: bool },
    /// A member's video state was forced to a new value.
    VstateChanged {
        userid: UserId,
        clientid: ClientId,
        state: VideoState,
    },
}

/// The member table for one call.
pub struct Roster {
    self_member: Member,
    users: Vec<Member>,
    /// Wire hash of the elected keygenerator (self included), if any.
    keygenerator: Option<IdHash>,
    events: Vec<RosterEvent>,
}

impl Roster {
    pub fn new(userid_self: UserId, clientid_self: ClientId) -> Self {
        Self {
            self_member: Member::with_identity(userid_self, clientid_self),
            users: Vec::new(),
            keygenerator: None,
            events: Vec::new(),
        }
    }

    /// Re-derive every member's wire hash from a new call secret.
    /// Hash-only members keep the hash the SFT reported for them.
    pub fn set_secret(&mut self, secret: &[u8]) {
        rehash(&mut self.self_member, secret);
        for u in &mut self.users {
            if u.has_identity() {
                rehash(u, secret);
            }
        }
    }

    pub fn self_member(&self) -> &Member {
        &self.self_member
    }

    pub fn self_member_mut(&mut self) -> &mut Member {
        &mut self.self_member
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }

    pub fn incall_count(&self) -> usize {
        self.users.iter().filter(|u| u.incall_now).count()
    }

    pub fn find_by_real(&self, userid: &UserId, clientid: &ClientId) -> Option<&Member> {
        self.users.iter().find(|u| u.matches_real(userid, clientid))
    }

    pub fn find_by_real_mut(
        &mut self,
        userid: &UserId,
        clientid: &ClientId,
    ) -> Option<&mut Member> {
        self.users
            .iter_mut()
            .find(|u| u.matches_real(userid, clientid))
    }

    pub fn find_by_hash(&self, userid_hash: &IdHash, clientid_hash: &IdHash) -> Option<&Member> {
        self.users
            .iter()
            .find(|u| u.matches_hash(userid_hash, clientid_hash))
    }

    pub fn find_by_hash_mut(
        &mut self,
        userid_hash: &IdHash,
        clientid_hash: &IdHash,
    ) -> Option<&mut Member> {
        self.users
            .iter_mut()
            .find(|u| u.matches_hash(userid_hash, clientid_hash))
    }

    // --- keygenerator -------------------------------------------------------

    pub fn is_keygenerator_me(&self) -> bool {
        self.keygenerator
            .as_ref()
            .is_some_and(|kg| kg.eq_ignore_case(&self.self_member.userid_hash))
    }

    pub fn has_keygenerator(&self) -> bool {
        self.keygenerator.is_some()
    }

    /// Real identity of the keygenerator, when it is a peer whose SE entry
    /// is known.
    pub fn keygenerator_identity(&self) -> Option<(UserId, ClientId)> {
        let kg = self.keygenerator.as_ref()?;
        if kg.eq_ignore_case(&self.self_member.userid_hash) {
            return None;
        }
        let member = self
            .users
            .iter()
            .find(|u| u.userid_hash.eq_ignore_case(kg))?;
        Some((member.userid.clone()?, member.clientid.clone()?))
    }

    /// Whether the given real identity is the current keygenerator.
    pub fn is_keygenerator(&self, userid: &UserId, clientid: &ClientId) -> bool {
        self.keygenerator_identity()
            .is_some_and(|(u, c)| u.eq_ignore_case(userid) && c.eq_ignore_case(clientid))
    }

    pub fn reset_keygenerator(&mut self) {
        self.keygenerator = None;
    }

    fn track_keygenerator_change(&mut self, prev: Option<IdHash>) {
        let Some(kg) = self.keygenerator.clone() else {
            return;
        };
        if prev.as_ref().is_some_and(|p| p.eq_ignore_case(&kg)) {
            return;
        }
        let is_me = kg.eq_ignore_case(&self.self_member.userid_hash);
        info!(is_me, "keygenerator changed");
        self.events.push(RosterEvent::KeygenChanged {
            is_me,
            is_first: prev.is_none(),
        });
    }

    // --- SFT list reconciliation -------------------------------------------

    /// Reconcile an SFT participant snapshot into the member table.
    ///
    /// The first entry in SFT order that is either self or an SE-approved
    /// member becomes the keygenerator; every endpoint applies the same rule
    /// to the same list and converges on the same choice.
    pub fn update_from_sft_list(&mut self, partlist: &[PartMember]) -> SftUpdate {
        debug!(members = partlist.len(), "reconciling sft list");

        let mut out = SftUpdate::default();
        let mut sync_decoders = false;

        self.self_member.listpos = LIST_POS_NONE;
        let prev_keygenerator = self.keygenerator.take();

        for u in &mut self.users {
            u.incall_prev = u.incall_now;
            u.incall_now = false;
            u.listpos = LIST_POS_NONE;
        }

        let first_approved = self.find_first_approved(partlist);

        for (pos, p) in partlist.iter().enumerate() {
            let listpos = pos as u32;

            if self.self_member.matches_hash(&p.userid, &p.clientid) {
                if Some(pos) == first_approved {
                    debug!("electing self as keygenerator");
                    self.keygenerator = Some(self.self_member.userid_hash.clone());
                }
                if self.self_member.ssrca != p.ssrca || self.self_member.ssrcv != p.ssrcv {
                    self.self_member.ssrca = p.ssrca;
                    self.self_member.ssrcv = p.ssrcv;
                    out.self_changed = true;
                }
                self.self_member.listpos = listpos;
                continue;
            }

            if let Some(idx) = self
                .users
                .iter()
                .position(|u| u.matches_hash(&p.userid, &p.clientid))
            {
                if Some(pos) == first_approved {
                    self.keygenerator = Some(self.users[idx].userid_hash.clone());
                }

                let u = &mut self.users[idx];
                if u.incall_prev && (u.ssrca != p.ssrca || u.ssrcv != p.ssrcv) {
                    // SSRCs moved mid-call: tear down decoders, the second
                    // pass below re-adds them for the new pair.
                    if let (Some(userid), Some(clientid)) = (u.userid.clone(), u.clientid.clone())
                    {
                        self.events.push(RosterEvent::RemoveUser {
                            userid,
                            clientid,
                            ssrca: u.ssrca,
                            ssrcv: u.ssrcv,
                            video_state: u.video_state,
                            fire_vstate: p.ssrcv == 0,
                        });
                    }
                    u.incall_prev = false;
                    sync_decoders = true;
                    out.list_changed = true;
                }

                u.incall_now = true;
                u.ssrca = p.ssrca;
                u.ssrcv = p.ssrcv;

                let muted = match p.muted_state() {
                    MutedState::Unknown => u.muted,
                    MutedState::Muted => true,
                    MutedState::Unmuted => false,
                };
                if muted != u.muted {
                    u.muted = muted;
                    out.list_changed = true;
                }
                u.listpos = listpos;
            } else {
                warn!(userid_hash = %p.userid, "sft member missing from se list");
                let mut u = Member::hash_only(p.userid.clone(), p.clientid.clone());
                u.ssrca = p.ssrca;
                u.ssrcv = p.ssrcv;
                u.incall_now = true;
                u.listpos = listpos;
                self.users.push(u);
                out.missing_parts = true;
            }
        }

        for i in 0..self.users.len() {
            let u = &mut self.users[i];
            if !u.se_approved {
                continue;
            }
            if u.force_decoder || (u.incall_now && !u.incall_prev) {
                if u.ssrca != 0 || u.ssrcv != 0 {
                    if let (Some(userid), Some(clientid)) = (u.userid.clone(), u.clientid.clone())
                    {
                        let ev = RosterEvent::AddUser {
                            userid,
                            clientid,
                            userid_hash: u.userid_hash.clone(),
                            ssrca: u.ssrca,
                            ssrcv: u.ssrcv,
                            video_state: u.video_state,
                        };
                        self.events.push(ev);
                        sync_decoders = true;
                    }
                }
                u.force_decoder = false;
                u.needs_key = true;
                out.list_changed = true;
            } else if !u.incall_now && u.incall_prev {
                if let (Some(userid), Some(clientid)) = (u.userid.clone(), u.clientid.clone()) {
                    let ev = RosterEvent::RemoveUser {
                        userid,
                        clientid,
                        ssrca: u.ssrca,
                        ssrcv: u.ssrcv,
                        video_state: u.video_state,
                        fire_vstate: true,
                    };
                    self.events.push(ev);
                }
                sync_decoders = true;
                u.ssrca = 0;
                u.ssrcv = 0;
                u.video_state = VideoState::Stopped;
                out.list_changed = true;
            }
        }

        if sync_decoders {
            self.events.push(RosterEvent::SyncMembers);
        }

        self.track_keygenerator_change(prev_keygenerator);
        self.users.sort_by_key(|u| u.listpos);

        info!(
            changed = out.list_changed,
            self_changed = out.self_changed,
            missing = out.missing_parts,
            "sft list reconciled"
        );
        out
    }

    fn find_first_approved(&self, partlist: &[PartMember]) -> Option<usize> {
        partlist.iter().position(|p| {
            self.self_member.matches_hash(&p.userid, &p.clientid)
                || self
                    .find_by_hash(&p.userid, &p.clientid)
                    .is_some_and(|u| u.se_approved)
        })
    }

    // --- SE list reconciliation --------------------------------------------

    /// Reconcile the backend's authorized-client list. Hash-only members
    /// created from SFT snapshots are promoted to full identity here.
    pub fn update_from_se_list(
        &mut self,
        clients: &[SeClient],
        epoch: u32,
        secret: &[u8],
    ) -> SeUpdate {
        debug!(clients = clients.len(), epoch, "reconciling se list");

        let mut out = SeUpdate::default();
        let mut sync_decoders = false;
        let prev_keygenerator = self.keygenerator.clone();

        for u in &mut self.users {
            u.was_se_approved = u.se_approved;
            u.se_approved = false;
            u.was_in_subconv = u.in_subconv;
            u.in_subconv = false;
        }

        for cli in clients {
            // The backend may echo self back; self is tracked separately.
            if self.self_member.matches_real(&cli.userid, &cli.clientid) {
                continue;
            }

            let idx = if let Some(idx) = self
                .users
                .iter()
                .position(|u| u.matches_real(&cli.userid, &cli.clientid))
            {
                rehash(&mut self.users[idx], secret);
                idx
            } else {
                let userid_hash = hash::user_hash(secret, &cli.userid, &cli.clientid);
                let clientid_hash = IdHash::from(hash::CLIENT_HASH);

                if let Some(idx) = self
                    .users
                    .iter()
                    .position(|u| u.matches_hash(&userid_hash, &clientid_hash) && !u.se_approved)
                {
                    // Promote a provisional hash-only member to full identity.
                    let u = &mut self.users[idx];
                    u.userid = Some(cli.userid.clone());
                    u.clientid = Some(cli.clientid.clone());
                    u.first_epoch = epoch;
                    u.needs_key = true;
                    u.force_decoder = false;
                    out.changed = true;

                    if u.ssrca != 0 || u.ssrcv != 0 {
                        let ev = RosterEvent::AddUser {
                            userid: cli.userid.clone(),
                            clientid: cli.clientid.clone(),
                            userid_hash: u.userid_hash.clone(),
                            ssrca: u.ssrca,
                            ssrcv: u.ssrcv,
                            video_state: u.video_state,
                        };
                        self.events.push(ev);
                        sync_decoders = true;
                    }

                    if self.users[idx].listpos == 0 {
                        // The promoted member heads the SFT list: they are
                        // the keygenerator everyone else already elected.
                        self.keygenerator = Some(self.users[idx].userid_hash.clone());
                        self.track_keygenerator_change(prev_keygenerator.clone());
                    }
                    idx
                } else {
                    let mut u = Member::with_identity(cli.userid.clone(), cli.clientid.clone());
                    u.userid_hash = userid_hash;
                    u.clientid_hash = clientid_hash;
                    self.users.push(u);
                    out.changed = true;
                    self.users.len() - 1
                }
            };

            let u = &mut self.users[idx];
            u.se_approved = true;
            u.in_subconv = cli.in_subconv;
            if u.in_subconv && u.first_epoch == 0 {
                u.first_epoch = epoch;
            }
        }

        for u in &mut self.users {
            if !u.in_subconv {
                u.first_epoch = 0;
                if u.was_in_subconv {
                    out.removed = true;
                    out.changed = true;
                }
            }
            if u.se_approved != u.was_se_approved {
                out.changed = true;
                if u.was_se_approved {
                    out.removed = true;
                }
            }
        }

        if sync_decoders {
            self.events.push(RosterEvent::SyncMembers);
        }

        info!(changed = out.changed, removed = out.removed, "se list reconciled");
        out
    }

    // --- epochs -------------------------------------------------------------

    pub fn set_latest_epoch(&mut self, epoch: u32) {
        self.self_member.latest_epoch = epoch;
    }

    pub fn latest_epoch(&self) -> u32 {
        self.self_member.latest_epoch
    }

    /// The highest key index every relevant receiver can decrypt: the lowest
    /// non-zero epoch among approved, in-subconv, in-call members, bounded by
    /// self's own epoch. Zero when nothing is known.
    pub fn key_index(&self) -> u32 {
        let mut min_key = self.self_member.latest_epoch;
        for u in &self.users {
            if u.se_approved && u.in_subconv && u.incall_now && u.latest_epoch > 0 {
                if min_key == 0 || u.latest_epoch < min_key {
                    min_key = u.latest_epoch;
                }
            }
        }
        min_key
    }

    // --- in-call state -------------------------------------------------------

    /// Clear in-call flags across a reconnect or teardown.
    ///
    /// With `force_decoder`, members currently in-call keep a reinstall mark
    /// so decoders come back on the next snapshot. With `again`, SSRCs are
    /// preserved (ICE restart rather than a fresh join).
    pub fn incall_clear(&mut self, force_decoder: bool, again: bool) {
        for u in &mut self.users {
            u.incall_now = u.incall_now && force_decoder;
            u.force_decoder = u.incall_now;
            u.incall_prev = false;
            if !again {
                u.ssrca = 0;
                u.ssrcv = 0;
            }
        }
    }

    /// Members owed the session key. Clears their `needs_key` mark.
    pub fn key_targets(&mut self, send_to_all: bool) -> Vec<(UserId, ClientId)> {
        let mut targets = Vec::new();
        for u in &mut self.users {
            if u.incall_now && u.se_approved && (u.needs_key || send_to_all) {
                if let (Some(userid), Some(clientid)) = (u.userid.clone(), u.clientid.clone()) {
                    targets.push((userid, clientid));
                    u.needs_key = false;
                }
            }
        }
        targets
    }

    /// The local user's other devices, for stop-ringing messages.
    pub fn my_clients(&self) -> Vec<(UserId, ClientId)> {
        let self_uid = match &self.self_member.userid {
            Some(u) => u,
            None => return Vec::new(),
        };
        let self_cid = self.self_member.clientid.as_ref();
        self.users
            .iter()
            .filter_map(|u| match (&u.userid, &u.clientid) {
                (Some(uid), Some(cid))
                    if uid.eq_ignore_case(self_uid)
                        && self_cid.is_none_or(|sc| !cid.eq_ignore_case(sc)) =>
                {
                    Some((uid.clone(), cid.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Host-facing member list: self first, then approved members that are
    /// in-call or share the subconversation.
    pub fn members(
        &self,
        self_audio: huddle_core::AudioState,
        self_video: VideoState,
        self_muted: bool,
    ) -> Vec<MemberSnapshot> {
        let mut out = Vec::with_capacity(1 + self.users.len());

        if let (Some(userid), Some(clientid)) =
            (&self.self_member.userid, &self.self_member.clientid)
        {
            out.push(MemberSnapshot {
                userid: userid.clone(),
                clientid: clientid.clone(),
                audio_state: self_audio,
                video_state: self_video,
                muted: self_muted,
            });
        }

        for u in &self.users {
            if !(u.se_approved && (u.incall_now || u.in_subconv)) {
                continue;
            }
            let (Some(userid), Some(clientid)) = (&u.userid, &u.clientid) else {
                continue;
            };
            out.push(MemberSnapshot {
                userid: userid.clone(),
                clientid: clientid.clone(),
                audio_state: if u.ssrca > 0 {
                    huddle_core::AudioState::Established
                } else {
                    huddle_core::AudioState::Connecting
                },
                video_state: if u.ssrcv > 0 {
                    u.video_state
                } else {
                    VideoState::Stopped
                },
                muted: u.muted,
            });
        }
        out
    }

    /// Body of a CONFPART response toward the SFT: approved in-call members
    /// (restricted to the subconversation for MLS calls), hashes only.
    pub fn partlist(&self, require_subconv: bool) -> Vec<PartMember> {
        self.users
            .iter()
            .filter(|u| {
                u.se_approved && u.incall_now && (u.in_subconv || !require_subconv)
            })
            .map(|u| PartMember {
                userid: u.userid_hash.clone(),
                clientid: u.clientid_hash.clone(),
                ssrca: u.ssrca,
                ssrcv: u.ssrcv,
                muted: None,
                authorized: true,
            })
            .collect()
    }

    /// Merge a host-delivered audio level report. Muted members are forced
    /// to level 0; returns whether the host should redraw indicators.
    pub fn update_audio_levels(&mut self, levels: &mut [AudioLevel]) -> bool {
        let mut changed = false;

        for u in &mut self.users {
            u.active_prev = u.active_audio;
            u.active_audio = false;
        }

        for level in levels.iter_mut() {
            let Some(u) = self.find_by_real_mut(&level.userid, &level.clientid) else {
                continue;
            };
            if u.muted {
                level.level = 0;
                level.level_smoothed = 0.0;
            }
            u.active_audio = level.level > 0;
            if u.muted && u.active_audio != u.active_prev {
                changed = true;
            }
        }
        changed
    }

    /// (participants incl. self, active audio senders, active video senders)
    /// for metrics high-water marks.
    pub fn active_counts(&self) -> (u32, u32, u32) {
        let mut active = 1u32;
        let mut active_a = 0u32;
        let mut active_v = 0u32;

        for u in &self.users {
            if u.se_approved && u.incall_now {
                active += 1;
                if u.ssrca > 0 && !u.muted {
                    active_a += 1;
                }
                if u.ssrcv > 0 && u.video_state != VideoState::Stopped {
                    active_v += 1;
                }
            }
        }
        (active, active_a, active_v)
    }

    /// Force every in-call member's video to stopped (teardown path).
    pub fn reset_video_states(&mut self) {
        for u in &mut self.users {
            if u.incall_now && u.video_state != VideoState::Stopped {
                if let (Some(userid), Some(clientid)) = (u.userid.clone(), u.clientid.clone()) {
                    self.events.push(RosterEvent::VstateChanged {
                        userid,
                        clientid,
                        state: VideoState::Stopped,
                    });
                }
                u.video_state = VideoState::Stopped;
            }
        }
    }

    /// Drain the side effects accumulated by reconciliation passes.
    pub fn drain_events(&mut self) -> Vec<RosterEvent> {
        std::mem::take(&mut self.events)
    }
}

fn rehash(member: &mut Member, secret: &[u8]) {
    if let (Some(userid), Some(clientid)) = (&member.userid, &member.clientid) {
        member.userid_hash = hash::user_hash(secret, userid, clientid);
        member.clientid_hash = IdHash::from(hash::CLIENT_HASH);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::AudioState;

    const SECRET: &[u8] = &[0x42; 16];

    fn part(roster: &Roster, userid: &str, clientid: &str, ssrca: u32, ssrcv: u32) -> PartMember {
        let h = roster
            .find_by_real(&userid.into(), &clientid.into())
            .map(|u| u.userid_hash.clone())
            .unwrap_or_else(|| hash::user_hash(SECRET, &userid.into(), &clientid.into()));
        PartMember {
            userid: h,
            clientid: hash::CLIENT_HASH.into(),
            ssrca,
            ssrcv,
            muted: None,
            authorized: false,
        }
    }

    fn self_part(roster: &Roster, ssrca: u32, ssrcv: u32) -> PartMember {
        PartMember {
            userid: roster.self_member().userid_hash.clone(),
            clientid: roster.self_member().clientid_hash.clone(),
            ssrca,
            ssrcv,
            muted: None,
            authorized: false,
        }
    }

    fn se(userid: &str, clientid: &str) -> SeClient {
        SeClient {
            userid: userid.into(),
            clientid: clientid.into(),
            in_subconv: false,
        }
    }

    fn roster_with_clients(clients: &[(&str, &str)]) -> Roster {
        let mut roster = Roster::new("self".into(), "dev0".into());
        roster.set_secret(SECRET);
        let sel: Vec<SeClient> = clients.iter().map(|(u, c)| se(u, c)).collect();
        roster.update_from_se_list(&sel, 0, SECRET);
        roster.drain_events();
        roster
    }

    #[test]
    fn first_approved_sft_entry_is_keygenerator() {
        let mut roster = roster_with_clients(&[("a", "d1"), ("b", "d2"), ("c", "d3")]);

        // SFT order [c, a, b]: c is approved and first, so c wins.
        let parts = vec![
            part(&roster, "c", "d3", 30, 0),
            part(&roster, "a", "d1", 10, 0),
            part(&roster, "b", "d2", 20, 0),
            self_part(&roster, 1, 0),
        ];
        roster.update_from_sft_list(&parts);

        assert!(!roster.is_keygenerator_me());
        assert!(roster.is_keygenerator(&"c".into(), &"d3".into()));
        let events = roster.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, RosterEvent::KeygenChanged { is_me: false, is_first: true })));
    }

    #[test]
    fn unapproved_first_entry_is_skipped_for_election() {
        let mut roster = roster_with_clients(&[("a", "d1")]);

        // A hash the SE list never confirmed heads the list; 'a' wins anyway.
        let stranger = PartMember {
            userid: "unknown-hash".into(),
            clientid: "_".into(),
            ssrca: 99,
            ssrcv: 0,
            muted: None,
            authorized: false,
        };
        let parts = vec![stranger, part(&roster, "a", "d1", 10, 0), self_part(&roster, 1, 0)];
        let out = roster.update_from_sft_list(&parts);

        assert!(out.missing_parts);
        assert!(roster.is_keygenerator(&"a".into(), &"d1".into()));
    }

    #[test]
    fn self_first_in_list_elects_self() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        let parts = vec![self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)];
        roster.update_from_sft_list(&parts);
        assert!(roster.is_keygenerator_me());
    }

    #[test]
    fn reapplying_same_snapshot_reports_no_change() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        let parts = vec![self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 11)];

        let first = roster.update_from_sft_list(&parts);
        assert!(first.list_changed);
        roster.drain_events();

        let second = roster.update_from_sft_list(&parts);
        assert!(!second.list_changed);
        assert!(!second.self_changed);
    }

    #[test]
    fn ssrc_change_removes_then_readds() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);
        roster.drain_events();

        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 33, 0)]);
        let events = roster.drain_events();

        let remove_pos = events
            .iter()
            .position(|e| matches!(e, RosterEvent::RemoveUser { ssrca: 10, .. }))
            .expect("decoder removal for the old ssrc");
        let add_pos = events
            .iter()
            .position(|e| matches!(e, RosterEvent::AddUser { ssrca: 33, .. }))
            .expect("decoder add for the new ssrc");
        assert!(remove_pos < add_pos);
    }

    #[test]
    fn member_leaving_zeroes_ssrcs_and_stops_video() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 11)]);
        roster
            .find_by_real_mut(&"a".into(), &"d1".into())
            .unwrap()
            .video_state = VideoState::Started;
        roster.drain_events();

        let out = roster.update_from_sft_list(&[self_part(&roster, 1, 0)]);
        assert!(out.list_changed);

        let member = roster.find_by_real(&"a".into(), &"d1".into()).unwrap();
        assert_eq!((member.ssrca, member.ssrcv), (0, 0));
        assert_eq!(member.video_state, VideoState::Stopped);
        assert!(!member.incall_now);
    }

    #[test]
    fn hash_only_member_is_promoted_by_se_list() {
        let mut roster = Roster::new("self".into(), "dev0".into());
        roster.set_secret(SECRET);

        // SFT snapshot arrives before the SE list knows the member.
        let hash_b = hash::user_hash(SECRET, &"b".into(), &"d2".into());
        let parts = vec![PartMember {
            userid: hash_b.clone(),
            clientid: hash::CLIENT_HASH.into(),
            ssrca: 20,
            ssrcv: 0,
            muted: None,
            authorized: false,
        }];
        let out = roster.update_from_sft_list(&parts);
        assert!(out.missing_parts);
        roster.drain_events();

        let out = roster.update_from_se_list(&[se("b", "d2")], 5, SECRET);
        assert!(out.changed);

        let member = roster.find_by_real(&"b".into(), &"d2".into()).unwrap();
        assert!(member.se_approved);
        assert_eq!(member.first_epoch, 5);
        assert_eq!(member.userid_hash, hash_b);

        // promoted at listpos 0: the member everyone elected becomes keygen
        assert!(roster.is_keygenerator(&"b".into(), &"d2".into()));
        let events = roster.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, RosterEvent::AddUser { ssrca: 20, .. })));
    }

    #[test]
    fn losing_approval_reports_removed() {
        let mut roster = roster_with_clients(&[("a", "d1"), ("b", "d2")]);
        let out = roster.update_from_se_list(&[se("a", "d1")], 0, SECRET);
        assert!(out.changed);
        assert!(out.removed);
        assert!(!roster.find_by_real(&"b".into(), &"d2".into()).unwrap().se_approved);
    }

    #[test]
    fn key_index_takes_slowest_receiver() {
        let mut roster = Roster::new("self".into(), "dev0".into());
        roster.set_secret(SECRET);
        let clients = vec![
            SeClient { userid: "a".into(), clientid: "d1".into(), in_subconv: true },
            SeClient { userid: "b".into(), clientid: "d2".into(), in_subconv: true },
        ];
        roster.update_from_se_list(&clients, 7, SECRET);
        roster.update_from_sft_list(&[
            self_part(&roster, 1, 0),
            part(&roster, "a", "d1", 10, 0),
            part(&roster, "b", "d2", 20, 0),
        ]);
        roster.set_latest_epoch(7);
        roster.find_by_real_mut(&"a".into(), &"d1".into()).unwrap().latest_epoch = 6;
        roster.find_by_real_mut(&"b".into(), &"d2".into()).unwrap().latest_epoch = 7;

        assert_eq!(roster.key_index(), 6);
    }

    #[test]
    fn key_index_is_bounded_by_self() {
        let mut roster = Roster::new("self".into(), "dev0".into());
        roster.set_secret(SECRET);
        roster.set_latest_epoch(4);
        assert_eq!(roster.key_index(), 4);
    }

    #[test]
    fn key_targets_clear_needs_key() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);

        let targets = roster.key_targets(false);
        assert_eq!(targets, vec![("a".into(), "d1".into())]);
        assert!(roster.key_targets(false).is_empty());

        // send_to_all ignores the needs_key mark
        assert_eq!(roster.key_targets(true).len(), 1);
    }

    #[test]
    fn muted_member_audio_level_is_zeroed() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);
        roster.find_by_real_mut(&"a".into(), &"d1".into()).unwrap().muted = true;

        let mut levels = vec![AudioLevel {
            userid: "a".into(),
            clientid: "d1".into(),
            level: 120,
            level_smoothed: 80.0,
        }];
        let changed = roster.update_audio_levels(&mut levels);

        assert_eq!(levels[0].level, 0);
        assert_eq!(levels[0].level_smoothed, 0.0);
        assert!(!roster.find_by_real(&"a".into(), &"d1".into()).unwrap().active_audio);
        assert!(!changed);
    }

    #[test]
    fn muted_activity_flip_marks_change() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);

        let mut levels = vec![AudioLevel {
            userid: "a".into(),
            clientid: "d1".into(),
            level: 120,
            level_smoothed: 80.0,
        }];
        roster.update_audio_levels(&mut levels);

        // active while unmuted, then the mute flag lands: the activity bit
        // drops and the host must redraw
        roster.find_by_real_mut(&"a".into(), &"d1".into()).unwrap().muted = true;
        let mut levels = vec![AudioLevel {
            userid: "a".into(),
            clientid: "d1".into(),
            level: 120,
            level_smoothed: 80.0,
        }];
        assert!(roster.update_audio_levels(&mut levels));
    }

    #[test]
    fn members_reports_muted_flag_verbatim() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);
        let m = roster.find_by_real_mut(&"a".into(), &"d1".into()).unwrap();
        m.muted = true;
        m.active_audio = true; // stale activity must not unmask a muted user

        let members = roster.members(AudioState::Established, VideoState::Stopped, false);
        assert_eq!(members.len(), 2);
        assert!(members[1].muted);
        assert_eq!(members[1].audio_state, AudioState::Established);
    }

    #[test]
    fn incall_clear_keeps_decoder_marks_for_reconnect() {
        let mut roster = roster_with_clients(&[("a", "d1")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);

        roster.incall_clear(true, true);
        let m = roster.find_by_real(&"a".into(), &"d1".into()).unwrap();
        assert!(m.force_decoder);
        assert!(m.incall_now);
        assert_eq!(m.ssrca, 10); // again=true keeps ssrcs

        roster.incall_clear(false, false);
        let m = roster.find_by_real(&"a".into(), &"d1".into()).unwrap();
        assert!(!m.force_decoder);
        assert!(!m.incall_now);
        assert_eq!(m.ssrca, 0);
    }

    #[test]
    fn my_clients_lists_other_devices_only() {
        let roster = roster_with_clients(&[("self", "dev1"), ("self", "dev2"), ("a", "d1")]);
        let mut clients = roster.my_clients();
        clients.sort_by(|a, b| a.1 .0.cmp(&b.1 .0));
        assert_eq!(
            clients,
            vec![("self".into(), "dev1".into()), ("self".into(), "dev2".into())]
        );
    }

    #[test]
    fn partlist_contains_only_approved_incall_members() {
        let mut roster = roster_with_clients(&[("a", "d1"), ("b", "d2")]);
        roster.update_from_sft_list(&[self_part(&roster, 1, 0), part(&roster, "a", "d1", 10, 0)]);

        let parts = roster.partlist(false);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].authorized);
        assert_eq!(parts[0].ssrca, 10);
    }

    #[test]
    fn sorts_by_sft_position() {
        let mut roster = roster_with_clients(&[("a", "d1"), ("b", "d2")]);
        roster.update_from_sft_list(&[
            part(&roster, "b", "d2", 20, 0),
            part(&roster, "a", "d1", 10, 0),
            self_part(&roster, 1, 0),
        ]);
        let first = &roster.find_by_real(&"b".into(), &"d2".into()).unwrap().listpos;
        assert_eq!(*first, 0);
    }

    #[test]
    fn smoothing_rises_fast_decays_slow() {
        assert_eq!(smooth_level(0.0, 100.0), 100.0);
        let decayed = smooth_level(100.0, 0.0);
        assert!(decayed > 80.0 && decayed < 100.0);
    }
}
