use crate::model::{Party, UserMessage};
use crate::pmode::types::ReceivingPMode;
use std::sync::Arc;
use thiserror::Error;

const PMODE_ID_WEIGHT: u32 = 30;
const PARTY_WEIGHT: u32 = 10;
const SERVICE_WEIGHT: u32 = 6;
const ACTION_WEIGHT: u32 = 6;
const AGREEMENT_WEIGHT: u32 = 4;
const MPC_WEIGHT: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PModeResolutionError {
    #[error("no sending pmode with id `{0}`")]
    SendingNotFound(String),
    #[error("no receiving pmode matches user message `{message_id}`")]
    NoMatch { message_id: String },
    #[error("user message `{message_id}` matches receiving pmodes {candidates:?} equally")]
    Ambiguous {
        message_id: String,
        candidates: Vec<String>,
    },
}

/// Picks the receiving PMode that best matches `user`.
///
/// Every criterion a candidate declares must match; a mismatch disqualifies it.
/// Matching criteria add their weight, and the agreement's PMode id adds the
/// most. A tie at the top score is a configuration error, never a silent pick.
pub fn resolve_receiving_pmode(
    candidates: &[Arc<ReceivingPMode>],
    user: &UserMessage,
) -> Result<Arc<ReceivingPMode>, PModeResolutionError> {
    let mut best_score = 0;
    let mut best: Vec<&Arc<ReceivingPMode>> = Vec::new();

    for candidate in candidates {
        let Some(score) = score_candidate(candidate, user) else {
            continue;
        };
        if score == 0 {
            continue;
        }
        if score > best_score {
            best_score = score;
            best.clear();
            best.push(candidate);
        } else if score == best_score {
            best.push(candidate);
        }
    }

    match best.as_slice() {
        [] => Err(PModeResolutionError::NoMatch {
            message_id: user.info.message_id.clone(),
        }),
        [single] => Ok(Arc::clone(single)),
        tied => Err(PModeResolutionError::Ambiguous {
            message_id: user.info.message_id.clone(),
            candidates: tied.iter().map(|pmode| pmode.id.clone()).collect(),
        }),
    }
}

fn score_candidate(pmode: &ReceivingPMode, user: &UserMessage) -> Option<u32> {
    let packaging = &pmode.message_packaging;
    let collaboration = &user.collaboration;
    let mut score = 0;

    if collaboration.agreement.pmode_id.as_deref() == Some(pmode.id.as_str()) {
        score += PMODE_ID_WEIGHT;
    }

    if let Some(expected) = &packaging.party_info.from {
        score += matches_party(expected, &user.from).then_some(PARTY_WEIGHT)?;
    }
    if let Some(expected) = &packaging.party_info.to {
        score += matches_party(expected, &user.to).then_some(PARTY_WEIGHT)?;
    }
    if let Some(expected) = &packaging.collaboration.service {
        let matched = expected.value == collaboration.service.value
            && (expected.service_type.is_none()
                || expected.service_type == collaboration.service.service_type);
        score += matched.then_some(SERVICE_WEIGHT)?;
    }
    if let Some(expected) = &packaging.collaboration.action {
        score += (expected == &collaboration.action).then_some(ACTION_WEIGHT)?;
    }
    if let Some(expected) = &packaging.collaboration.agreement {
        let matched = collaboration.agreement.value.as_deref() == Some(expected.as_str());
        score += matched.then_some(AGREEMENT_WEIGHT)?;
    }
    if let Some(expected) = &packaging.mpc {
        score += (user.mpc.as_deref() == Some(expected.as_str())).then_some(MPC_WEIGHT)?;
    }

    Some(score)
}

/// The expected role (when set) must match and every expected party id must be present.
fn matches_party(expected: &Party, actual: &Party) -> bool {
    if !expected.role.is_empty() && expected.role != actual.role {
        return false;
    }
    expected.party_ids.iter().all(|wanted| {
        actual.party_ids.iter().any(|have| {
            have.id == wanted.id
                && (wanted.party_type.is_none() || wanted.party_type == have.party_type)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AgreementReference, CollaborationInfo, MessageInfo, PartyId, Service,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn user(action: &str) -> UserMessage {
        UserMessage {
            info: MessageInfo::new("m-1", Utc::now()),
            mpc: None,
            from: Party::new("Sender", "org:holodeck"),
            to: Party::new("Receiver", "org:engine"),
            collaboration: CollaborationInfo {
                agreement: AgreementReference::default(),
                service: Service::new("urn:services:ordering"),
                action: action.into(),
                conversation_id: "c-1".into(),
            },
            message_properties: BTreeMap::new(),
            payload_info: Vec::new(),
        }
    }

    fn by_action(id: &str, action: &str) -> Arc<ReceivingPMode> {
        let mut pmode = ReceivingPMode::new(id);
        pmode.message_packaging.collaboration.action = Some(action.into());
        Arc::new(pmode)
    }

    #[test]
    fn most_specific_candidate_wins() {
        let generic = by_action("generic", "Order");
        let mut specific = (*by_action("specific", "Order")).clone();
        specific.message_packaging.party_info.from = Some(Party {
            role: String::new(),
            party_ids: vec![PartyId {
                id: "org:holodeck".into(),
                party_type: None,
            }],
        });
        let candidates = vec![generic, Arc::new(specific)];

        let resolved = resolve_receiving_pmode(&candidates, &user("Order")).unwrap();
        assert_eq!(resolved.id, "specific");
    }

    #[test]
    fn declared_criterion_mismatch_disqualifies() {
        let candidates = vec![by_action("invoice", "Invoice")];
        assert_eq!(
            resolve_receiving_pmode(&candidates, &user("Order")),
            Err(PModeResolutionError::NoMatch {
                message_id: "m-1".into()
            })
        );
    }

    #[test]
    fn equal_scores_are_ambiguous() {
        let candidates = vec![by_action("first", "Order"), by_action("second", "Order")];
        match resolve_receiving_pmode(&candidates, &user("Order")) {
            Err(PModeResolutionError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["first".to_string(), "second".to_string()])
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn agreement_pmode_id_outweighs_criteria() {
        let candidates = vec![by_action("first", "Order"), by_action("second", "Order")];
        let mut message = user("Order");
        message.collaboration.agreement.pmode_id = Some("second".into());
        let resolved = resolve_receiving_pmode(&candidates, &message).unwrap();
        assert_eq!(resolved.id, "second");
    }
}
