//! Quorum membership model and the derived per-replica snapshot.

use std::collections::HashSet;
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use slate_core::limits::{PEER_UUID_LEN_MAX, QUORUM_PEERS_MAX};
use slate_core::PeerId;

/// Role of a peer within a quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// The single peer driving replication for the current term.
    Leader,
    /// A voting peer replicating from the leader.
    Follower,
    /// A peer campaigning for leadership.
    Candidate,
    /// A non-voting peer catching up on the log.
    Learner,
    /// A peer not listed in the quorum.
    NonParticipant,
}

impl PeerRole {
    /// Returns true if this role participates in majority math.
    #[must_use]
    pub const fn is_voting(self) -> bool {
        matches!(self, Self::Leader | Self::Follower)
    }

    /// Returns the role's wire tag.
    const fn to_u8(self) -> u8 {
        match self {
            Self::Leader => 0,
            Self::Follower => 1,
            Self::Candidate => 2,
            Self::Learner => 3,
            Self::NonParticipant => 4,
        }
    }

    /// Decodes a role from its wire tag.
    const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Leader),
            1 => Some(Self::Follower),
            2 => Some(Self::Candidate),
            3 => Some(Self::Learner),
            4 => Some(Self::NonParticipant),
            _ => None,
        }
    }

    /// Returns the role's name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Leader => "LEADER",
            Self::Follower => "FOLLOWER",
            Self::Candidate => "CANDIDATE",
            Self::Learner => "LEARNER",
            Self::NonParticipant => "NON_PARTICIPANT",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One peer entry in a quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumPeer {
    /// The peer's permanent UUID.
    pub uuid: PeerId,
    /// The peer's role in this quorum.
    pub role: PeerRole,
}

impl QuorumPeer {
    /// Creates a peer entry.
    #[must_use]
    pub fn new(uuid: impl Into<PeerId>, role: PeerRole) -> Self {
        Self {
            uuid: uuid.into(),
            role,
        }
    }
}

/// The set of peers replicating one tablet, with a configuration sequence
/// number that increases on every membership change.
///
/// At most one peer may carry the [`PeerRole::Leader`] role; enforcing that
/// is the responsibility of whoever proposes a quorum. Peers with roles
/// `Leader` or `Follower` form the voting set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quorum {
    /// Ordered list of peers.
    pub peers: Vec<QuorumPeer>,
    /// Configuration sequence number.
    pub seqno: u64,
}

impl Quorum {
    /// Creates a quorum from a peer list and a sequence number.
    ///
    /// # Panics
    /// Panics if the peer list exceeds [`QUORUM_PEERS_MAX`] or a UUID
    /// exceeds [`PEER_UUID_LEN_MAX`] bytes.
    #[must_use]
    pub fn new(peers: Vec<QuorumPeer>, seqno: u64) -> Self {
        assert!(
            peers.len() <= QUORUM_PEERS_MAX,
            "quorum size {} exceeds maximum {}",
            peers.len(),
            QUORUM_PEERS_MAX
        );
        for peer in &peers {
            assert!(
                peer.uuid.as_str().len() <= PEER_UUID_LEN_MAX,
                "peer uuid length exceeds maximum {PEER_UUID_LEN_MAX}"
            );
        }
        Self { peers, seqno }
    }

    /// Returns the number of peers listed.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Encodes the quorum to the buffer.
    ///
    /// Format: seqno (8 bytes) + peer count (4 bytes), then per peer:
    /// role tag (1 byte) + uuid length (2 bytes) + uuid bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.seqno);
        // Safe cast: peer count is bounded by QUORUM_PEERS_MAX.
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.peers.len() as u32);
        for peer in &self.peers {
            buf.put_u8(peer.role.to_u8());
            let uuid = peer.uuid.as_str().as_bytes();
            // Safe cast: uuid length is bounded by PEER_UUID_LEN_MAX.
            #[allow(clippy::cast_possible_truncation)]
            buf.put_u16_le(uuid.len() as u16);
            buf.put_slice(uuid);
        }
    }

    /// Decodes a quorum from the buffer.
    ///
    /// Returns `None` if the buffer is truncated or malformed.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 12 {
            return None;
        }
        let seqno = buf.get_u64_le();
        let count = buf.get_u32_le() as usize;
        if count > QUORUM_PEERS_MAX {
            return None;
        }

        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 3 {
                return None;
            }
            let role = PeerRole::from_u8(buf.get_u8())?;
            let len = buf.get_u16_le() as usize;
            if len > PEER_UUID_LEN_MAX || buf.remaining() < len {
                return None;
            }
            let mut uuid = vec![0u8; len];
            buf.copy_to_slice(&mut uuid);
            let uuid = String::from_utf8(uuid).ok()?;
            peers.push(QuorumPeer::new(uuid, role));
        }
        Some(Self { peers, seqno })
    }

    /// Returns the serialized form, used for byte-equality comparisons
    /// between a pending and a committed quorum.
    #[must_use]
    pub fn encoded(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for Quorum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "quorum(seqno={}, peers=[", self.seqno)?;
        for (i, peer) in self.peers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", peer.uuid, peer.role)?;
        }
        write!(f, "])")
    }
}

/// Immutable projection of a [`Quorum`] for one replica.
///
/// Built once per membership change and shared read-only afterwards. Pure
/// derivation: no I/O, no locking, never fails. A quorum with an empty
/// voting set produces `majority_size == 1`, which is degenerate but
/// representable; rejecting such quorums is the proposer's job.
#[derive(Debug, Clone)]
pub struct QuorumSnapshot {
    /// Role of the local peer, or `NonParticipant` if not listed.
    pub self_role: PeerRole,
    /// The leader peer, if one is listed.
    pub leader_uuid: Option<PeerId>,
    /// Peers whose role is `Leader` or `Follower`.
    pub voting_peers: HashSet<PeerId>,
    /// `⌊|voting_peers| / 2⌋ + 1`.
    pub majority_size: usize,
    /// Total number of peers listed.
    pub quorum_size: usize,
    /// Sequence number of the originating quorum.
    pub config_seqno: u64,
}

impl QuorumSnapshot {
    /// Builds the snapshot by walking the quorum peers once.
    ///
    /// If multiple peers claim the leader role the snapshot is still built
    /// (the last listed leader wins); callers are responsible for having
    /// rejected such a quorum upstream.
    #[must_use]
    pub fn build(quorum: &Quorum, self_uuid: &PeerId) -> Self {
        let mut self_role = PeerRole::NonParticipant;
        let mut leader_uuid = None;
        let mut voting_peers = HashSet::new();

        for peer in &quorum.peers {
            if peer.uuid == *self_uuid {
                self_role = peer.role;
            }
            if peer.role.is_voting() {
                voting_peers.insert(peer.uuid.clone());
            }
            if peer.role == PeerRole::Leader {
                leader_uuid = Some(peer.uuid.clone());
            }
        }

        let majority_size = voting_peers.len() / 2 + 1;
        Self {
            self_role,
            leader_uuid,
            voting_peers,
            majority_size,
            quorum_size: quorum.peer_count(),
            config_seqno: quorum.seqno,
        }
    }

    /// Returns true if the given peer is in the voting set.
    #[must_use]
    pub fn is_voting_peer(&self, uuid: &PeerId) -> bool {
        self.voting_peers.contains(uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_quorum() -> Quorum {
        Quorum::new(
            vec![
                QuorumPeer::new("peer-a", PeerRole::Leader),
                QuorumPeer::new("peer-b", PeerRole::Follower),
                QuorumPeer::new("peer-c", PeerRole::Follower),
                QuorumPeer::new("peer-d", PeerRole::Learner),
            ],
            7,
        )
    }

    #[test]
    fn test_snapshot_for_leader() {
        let snapshot = QuorumSnapshot::build(&make_quorum(), &PeerId::new("peer-a"));

        assert_eq!(snapshot.self_role, PeerRole::Leader);
        assert_eq!(snapshot.leader_uuid, Some(PeerId::new("peer-a")));
        assert_eq!(snapshot.voting_peers.len(), 3);
        assert_eq!(snapshot.majority_size, 2);
        assert_eq!(snapshot.quorum_size, 4);
        assert_eq!(snapshot.config_seqno, 7);
        assert!(!snapshot.is_voting_peer(&PeerId::new("peer-d")));
    }

    #[test]
    fn test_snapshot_for_learner_and_stranger() {
        let quorum = make_quorum();
        let learner = QuorumSnapshot::build(&quorum, &PeerId::new("peer-d"));
        assert_eq!(learner.self_role, PeerRole::Learner);

        let stranger = QuorumSnapshot::build(&quorum, &PeerId::new("peer-z"));
        assert_eq!(stranger.self_role, PeerRole::NonParticipant);
        // The rest of the snapshot is derived the same way.
        assert_eq!(stranger.majority_size, 2);
    }

    #[test]
    fn test_snapshot_with_empty_voting_set() {
        let quorum = Quorum::new(vec![QuorumPeer::new("peer-x", PeerRole::Learner)], 1);
        let snapshot = QuorumSnapshot::build(&quorum, &PeerId::new("peer-x"));

        assert!(snapshot.voting_peers.is_empty());
        assert!(snapshot.leader_uuid.is_none());
        // Degenerate but representable.
        assert_eq!(snapshot.majority_size, 1);
    }

    #[test]
    fn test_majority_sizes() {
        for (voters, majority) in [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3)] {
            let peers = (0..voters)
                .map(|i| QuorumPeer::new(format!("peer-{i}"), PeerRole::Follower))
                .collect();
            let snapshot = QuorumSnapshot::build(&Quorum::new(peers, 0), &PeerId::new("peer-0"));
            assert_eq!(snapshot.majority_size, majority, "voters={voters}");
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let quorum = make_quorum();
        let encoded = quorum.encoded();
        let decoded = Quorum::decode(&mut encoded.clone()).unwrap();
        assert_eq!(decoded, quorum);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let encoded = make_quorum().encoded();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(Quorum::decode(&mut truncated.clone()).is_none());
    }

    #[test]
    fn test_byte_equality_distinguishes_quorums() {
        let q1 = make_quorum();
        let mut q2 = make_quorum();
        q2.seqno += 1;
        assert_ne!(q1.encoded(), q2.encoded());
        assert_eq!(q1.encoded(), make_quorum().encoded());
    }

    #[test]
    #[should_panic(expected = "exceeds maximum")]
    fn test_oversized_quorum_panics() {
        let peers = (0..=QUORUM_PEERS_MAX)
            .map(|i| QuorumPeer::new(format!("peer-{i}"), PeerRole::Follower))
            .collect();
        let _ = Quorum::new(peers, 0);
    }
}
