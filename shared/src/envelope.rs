//! Internal bus envelope exchanged between gateways and workers
//!
//! Envelopes are bincode-encoded and published on subject-style topics:
//! `game.{worker_id}`, `path.{worker_id}`, `gate.broadcast` and
//! `gate.{gate_id}`.

use crate::retcode::CloseReason;
use serde::{Deserialize, Serialize};

/// Broadcast topic every gateway subscribes to
pub const GATE_BROADCAST: &str = "gate.broadcast";

pub fn game_topic(worker_id: u32) -> String {
    format!("game.{}", worker_id)
}

pub fn path_topic(worker_id: u32) -> String {
    format!("path.{}", worker_id)
}

pub fn gate_topic(gate_id: u32) -> String {
    format!("gate.{}", gate_id)
}

/// An application frame travelling between a session and a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMsg {
    pub uid: u32,
    pub cmd_id: u16,
    pub client_seq: u32,
    pub payload: Vec<u8>,
    /// Gateway that owns the session; workers reply on `gate.{gate_id}`
    pub gate_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnCtrlKind {
    KickPlayer,
    UserOffline,
    ClientRtt,
}

/// Connection-level control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnCtrl {
    pub kind: ConnCtrlKind,
    pub uid: u32,
    pub reason: Option<CloseReason>,
    pub rtt: Option<u32>,
    pub gate_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMsgKind {
    WorkerChange,
    WorkersBound,
    PresenceChange,
}

/// Fleet-level server event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMsg {
    pub kind: ServerMsgKind,
    pub uid: u32,
    pub game_worker_id: Option<u32>,
    pub path_worker_id: Option<u32>,
    pub online: Option<bool>,
    pub gate_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    GameMsg(GameMsg),
    ConnCtrl(ConnCtrl),
    ServerMsg(ServerMsg),
}

impl Envelope {
    pub fn kick_player(uid: u32, reason: CloseReason, gate_id: u32) -> Self {
        Envelope::ConnCtrl(ConnCtrl {
            kind: ConnCtrlKind::KickPlayer,
            uid,
            reason: Some(reason),
            rtt: None,
            gate_id,
        })
    }

    pub fn user_offline(uid: u32, reason: CloseReason, gate_id: u32) -> Self {
        Envelope::ConnCtrl(ConnCtrl {
            kind: ConnCtrlKind::UserOffline,
            uid,
            reason: Some(reason),
            rtt: None,
            gate_id,
        })
    }

    pub fn client_rtt(uid: u32, rtt: u32, gate_id: u32) -> Self {
        Envelope::ConnCtrl(ConnCtrl {
            kind: ConnCtrlKind::ClientRtt,
            uid,
            reason: None,
            rtt: Some(rtt),
            gate_id,
        })
    }

    pub fn presence_change(uid: u32, gate_id: u32, online: bool) -> Self {
        Envelope::ServerMsg(ServerMsg {
            kind: ServerMsgKind::PresenceChange,
            uid,
            game_worker_id: None,
            path_worker_id: None,
            online: Some(online),
            gate_id: Some(gate_id),
        })
    }

    pub fn workers_bound(uid: u32, game_worker_id: u32, path_worker_id: Option<u32>, gate_id: u32) -> Self {
        Envelope::ServerMsg(ServerMsg {
            kind: ServerMsgKind::WorkersBound,
            uid,
            game_worker_id: Some(game_worker_id),
            path_worker_id,
            online: None,
            gate_id: Some(gate_id),
        })
    }

    pub fn worker_change(uid: u32, game_worker_id: u32) -> Self {
        Envelope::ServerMsg(ServerMsg {
            kind: ServerMsgKind::WorkerChange,
            uid,
            game_worker_id: Some(game_worker_id),
            path_worker_id: None,
            online: None,
            gate_id: None,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(game_topic(3), "game.3");
        assert_eq!(path_topic(4), "path.4");
        assert_eq!(gate_topic(5), "gate.5");
        assert_eq!(GATE_BROADCAST, "gate.broadcast");
    }

    #[test]
    fn test_game_msg_survives_bincode() {
        let env = Envelope::GameMsg(GameMsg {
            uid: 10001,
            cmd_id: 112,
            client_seq: 2,
            payload: vec![1, 2, 3],
            gate_id: 1,
        });
        let bytes = env.to_bytes().unwrap();
        assert_eq!(Envelope::from_bytes(&bytes).unwrap(), env);
    }

    #[test]
    fn test_kick_carries_reason() {
        match Envelope::kick_player(7, CloseReason::ServerRelogin, 2) {
            Envelope::ConnCtrl(ctrl) => {
                assert_eq!(ctrl.kind, ConnCtrlKind::KickPlayer);
                assert_eq!(ctrl.reason, Some(CloseReason::ServerRelogin));
                assert_eq!(ctrl.gate_id, 2);
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Envelope::from_bytes(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
    }
}
