//! Neighbor help requests.
//!
//! A profile may have one pending request at a time. Opening one broadcasts
//! to the nearest profiles; the first neighbor to accept gets it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Proximity;
use crate::clock::DAY;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::geo::GeoPoint;
use crate::notify::{NotificationType, Payload};

/// Requests older than this can no longer be accepted.
pub const HELP_EXPIRY: i64 = DAY;
pub const BROADCAST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelpState {
    Pending,
    Accepted,
}

impl HelpState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelpState::Pending => "pending",
            HelpState::Accepted => "accepted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpRequest {
    pub id: Uuid,
    pub requester: String,
    pub subject: String,
    pub needs: String,
    pub meeting_location: String,
    pub contact_info: String,
    pub location: GeoPoint,
    pub state: HelpState,
    pub helper: Option<String>,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewHelp {
    pub subject: String,
    pub needs: String,
    pub meeting_location: String,
    pub contact_info: String,
}

impl Engine {
    pub async fn create_help(&self, requester: &str, new: NewHelp) -> EngineResult<HelpRequest> {
        if new.subject.trim().is_empty() {
            return Err(EngineError::invalid("help subject is empty"));
        }
        let profile = self.profile(requester).await?;
        let location = profile.location.ok_or(EngineError::InvalidLocation)?;
        let now = self.now();

        let help = HelpRequest {
            id: Uuid::new_v4(),
            requester: requester.to_string(),
            subject: new.subject,
            needs: new.needs,
            meeting_location: new.meeting_location,
            contact_info: new.contact_info,
            location,
            state: HelpState::Pending,
            helper: None,
            created_at: now,
            accepted_at: None,
        };
        self.help.insert_help(&help, now - HELP_EXPIRY).await?;

        // one extra slot since the requester is usually the nearest
        let neighbors = self
            .aggregator
            .nearest_profiles(
                location,
                Proximity::NearestWithin(self.settings.nearby_radius_m, BROADCAST_LIMIT + 1),
            )
            .await?;
        let mut recipients = Vec::new();
        for id in neighbors.iter().filter(|id| id.as_str() != requester) {
            if let Some(neighbor) = self.state.get_profile(id).await? {
                recipients.push(neighbor.account_number);
            }
        }
        recipients.truncate(BROADCAST_LIMIT);

        let payload = Payload::new(NotificationType::BroadcastNewHelp).with_help(&help.id.to_string());
        if let Err(err) = self.send_text(&recipients, "new_help", &[], &payload).await {
            tracing::warn!(help_id = %help.id, error = %err, "help broadcast failed");
        }
        tracing::info!(help_id = %help.id, requester, recipients = recipients.len(), "help request opened");
        Ok(help)
    }

    pub async fn accept_help(&self, helper: &str, id: Uuid) -> EngineResult<HelpRequest> {
        let help = self
            .help
            .get_help(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("help request {id}")))?;
        if help.requester == helper {
            return Err(EngineError::Conflict("cannot accept your own help request".to_string()));
        }
        if help.state != HelpState::Pending {
            return Err(EngineError::Conflict(format!("help request {id} already accepted")));
        }
        let now = self.now();
        if now - help.created_at > HELP_EXPIRY {
            return Err(EngineError::Conflict(format!("help request {id} expired")));
        }
        self.profile(helper).await?;

        if !self.help.accept_help(id, helper, now).await? {
            return Err(EngineError::Conflict(format!("help request {id} already accepted")));
        }

        let requester = self.profile(&help.requester).await?;
        let payload = Payload::new(NotificationType::NotifyHelpAccepted).with_help(&id.to_string());
        self.send_text(&[requester.account_number], "help_accepted", &[], &payload)
            .await?;

        tracing::info!(help_id = %id, helper, "help request accepted");
        Ok(HelpRequest {
            state: HelpState::Accepted,
            helper: Some(helper.to_string()),
            accepted_at: Some(now),
            ..help
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HOUR;
    use crate::models::Profile;
    use crate::store::{HelpStore, StateStore};
    use crate::testing::{fixture, TS};

    fn ask() -> NewHelp {
        NewHelp {
            subject: "groceries".into(),
            needs: "rice and water".into(),
            meeting_location: "lobby".into(),
            contact_info: "0912".into(),
        }
    }

    async fn neighbors(fx: &crate::testing::Fixture) {
        fx.profile_at("alice", "GMT+8", 25.0330, 121.5654).await;
        fx.profile_at("bob", "GMT+8", 25.0340, 121.5654).await;
        fx.profile_at("carol", "GMT+8", 25.0400, 121.5654).await;
        // ~55 km away
        fx.profile_at("dave", "GMT+8", 24.5330, 121.5654).await;
        let mut nowhere = Profile::new("erin", "acct-erin", "GMT+8");
        nowhere.location = None;
        fx.store.upsert_profile(&nowhere).await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_nearby_profiles_except_requester() {
        let fx = fixture(TS);
        neighbors(&fx).await;

        let help = fx.engine.create_help("alice", ask()).await.unwrap();
        assert_eq!(help.state, HelpState::Pending);

        let sent = fx.sink.requests();
        let mut targets: Vec<String> = sent.iter().flat_map(|r| crate::testing::targets(r)).collect();
        targets.sort();
        assert_eq!(targets, vec!["acct-bob", "acct-carol"]);
        assert!(sent.iter().all(|r| r.data.notification_type == NotificationType::BroadcastNewHelp));
        assert_eq!(sent[0].data.help_id, Some(help.id.to_string()));
    }

    #[tokio::test]
    async fn second_open_request_conflicts() {
        let fx = fixture(TS);
        neighbors(&fx).await;
        fx.engine.create_help("alice", ask()).await.unwrap();
        let err = fx.engine.create_help("alice", ask()).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // an expired request no longer blocks
        fx.clock.advance(DAY + 1);
        fx.engine.create_help("alice", ask()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_open_only_one() {
        let fx = fixture(TS);
        neighbors(&fx).await;

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let engine = fx.engine.clone();
                tokio::spawn(async move { engine.create_help("alice", ask()).await })
            })
            .collect();
        let mut opened = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => opened += 1,
                Err(err) => assert!(matches!(err, EngineError::Conflict(_)), "{err}"),
            }
        }
        assert_eq!(opened, 1);
    }

    #[tokio::test]
    async fn store_rejects_a_second_pending_request() {
        let fx = fixture(TS);
        neighbors(&fx).await;
        let first = fx.engine.create_help("alice", ask()).await.unwrap();

        let second = HelpRequest {
            id: Uuid::new_v4(),
            ..first.clone()
        };
        let err = fx.store.insert_help(&second, TS - HELP_EXPIRY).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert!(fx.store.get_help(second.id).await.unwrap().is_none());
        // older than the window
        fx.store.insert_help(&second, TS + 1).await.unwrap();
    }

    #[tokio::test]
    async fn accept_notifies_requester_once() {
        let fx = fixture(TS);
        neighbors(&fx).await;
        let help = fx.engine.create_help("alice", ask()).await.unwrap();
        fx.sink.clear();

        let accepted = fx.engine.accept_help("bob", help.id).await.unwrap();
        assert_eq!(accepted.helper.as_deref(), Some("bob"));
        let sent = fx.sink.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(crate::testing::targets(&sent[0]), vec!["acct-alice"]);
        assert_eq!(sent[0].data.notification_type, NotificationType::NotifyHelpAccepted);

        let again = fx.engine.accept_help("carol", help.id).await.unwrap_err();
        assert!(matches!(again, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn accept_rejects_self_unknown_and_expired() {
        let fx = fixture(TS);
        neighbors(&fx).await;
        let help = fx.engine.create_help("alice", ask()).await.unwrap();

        let own = fx.engine.accept_help("alice", help.id).await.unwrap_err();
        assert!(matches!(own, EngineError::Conflict(_)));

        let unknown = fx.engine.accept_help("bob", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(unknown, EngineError::NotFound(_)));

        fx.clock.advance(DAY + HOUR);
        let expired = fx.engine.accept_help("bob", help.id).await.unwrap_err();
        assert!(matches!(expired, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn requester_without_location_is_rejected() {
        let fx = fixture(TS);
        neighbors(&fx).await;
        let err = fx.engine.create_help("erin", ask()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidLocation));
    }
}
